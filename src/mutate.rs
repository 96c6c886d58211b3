use std::collections::BTreeSet;
use std::io::Write as _;
use std::path::Path;
use std::time::SystemTime;

use crate::feedback::{FeedbackEngine, FeedbackSnapshot};
use crate::parse::{body_start, FenceTracker};
use crate::resolver::{
    apply_autolinks, AppliedLink, CooccurrenceCounts, EntityResolver, ScoreContext,
};
use crate::store::StateStore;
use crate::{
    Backlink, CancelToken, Error, Note, Result, Section, TaskStatus, Vault, VaultConfig,
    VaultIndex, VaultPath,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteFormat {
    #[default]
    Plain,
    Bullet,
    /// `- HH:MM - content`
    TimestampBullet,
    /// `- [ ] content`
    Task,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertPosition {
    /// After the last non-blank line of the section.
    #[default]
    End,
    /// Directly under the heading.
    Top,
    BeforeLine(u32),
    AfterLine(u32),
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct EditOutcome {
    pub path: VaultPath,
    pub diff: String,
    pub applied_links: Vec<AppliedLink>,
    /// Entities judged incorrect because their applied link disappeared.
    pub implicit_removals: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DeleteOutcome {
    pub path: VaultPath,
    pub deleted: bool,
    pub backlink_warnings: Vec<Backlink>,
}

/// Per-file report of a rename; already-written files are never rolled
/// back, so partial failure is explicit.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RenameReport {
    pub from: VaultPath,
    pub to: VaultPath,
    pub rewritten: Vec<VaultPath>,
    pub failures: Vec<(VaultPath, String)>,
    pub remaining: Vec<VaultPath>,
}

impl RenameReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.remaining.is_empty()
    }
}

/// One step of a chained policy run. Every step targets a single note.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PolicyStep {
    AddToSection {
        path: VaultPath,
        section: String,
        content: String,
        #[serde(default)]
        format: WriteFormat,
        #[serde(default)]
        position: InsertPosition,
    },
    RemoveFromSection {
        path: VaultPath,
        section: String,
        content: String,
    },
    ReplaceInSection {
        path: VaultPath,
        section: String,
        from: String,
        to: String,
    },
    UpdateFrontmatter {
        path: VaultPath,
        updates: serde_yaml::Mapping,
    },
    AddTask {
        path: VaultPath,
        section: String,
        text: String,
    },
    ToggleTask {
        path: VaultPath,
        line: u32,
    },
}

impl PolicyStep {
    fn path(&self) -> &VaultPath {
        match self {
            Self::AddToSection { path, .. }
            | Self::RemoveFromSection { path, .. }
            | Self::ReplaceInSection { path, .. }
            | Self::UpdateFrontmatter { path, .. }
            | Self::AddTask { path, .. }
            | Self::ToggleTask { path, .. } => path,
        }
    }

    fn action(&self) -> &'static str {
        match self {
            Self::AddToSection { .. } => "add_to_section",
            Self::RemoveFromSection { .. } => "remove_from_section",
            Self::ReplaceInSection { .. } => "replace_in_section",
            Self::UpdateFrontmatter { .. } => "update_frontmatter",
            Self::AddTask { .. } => "add_task",
            Self::ToggleTask { .. } => "toggle_task",
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct StepOutcome {
    pub action: String,
    pub path: VaultPath,
    pub ok: bool,
    pub error: Option<String>,
}

/// Result of a policy run. `ok` is the conjunction of every step.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct PolicyReport {
    pub steps: Vec<StepOutcome>,
    pub rolled_back: Vec<VaultPath>,
    pub ok: bool,
}

/// Section-aware, atomic, auto-linking writes. Borrows the index and store
/// mutably; the caller holds the write lock for the duration.
pub struct MutationEngine<'a> {
    vault: &'a Vault,
    index: &'a mut VaultIndex,
    store: &'a mut StateStore,
    cfg: &'a VaultConfig,
}

impl<'a> MutationEngine<'a> {
    pub fn new(
        vault: &'a Vault,
        index: &'a mut VaultIndex,
        store: &'a mut StateStore,
        cfg: &'a VaultConfig,
    ) -> Self {
        Self {
            vault,
            index,
            store,
            cfg,
        }
    }

    pub fn add_to_section(
        &mut self,
        path: &VaultPath,
        section: &str,
        content: &str,
        format: WriteFormat,
        position: InsertPosition,
    ) -> Result<EditOutcome> {
        let text = self.read_text(path)?;
        let note = self.require_note(path)?.clone();
        let sec = find_section(&note, section)?.clone();
        let eol = detect_eol(&text);

        let insert_at = insertion_offset(&text, &sec, position)?;
        self.check_insertion_point(path, &text, insert_at)?;

        let indent = match position {
            InsertPosition::Top | InsertPosition::End => deepest_list_indent(&text, &sec),
            _ => indent_at(&text, insert_at),
        };
        let (linked, applied) = self.autolink(path, content);
        let block = format_block(&linked, format, &indent, eol);

        let mut out = String::with_capacity(text.len() + block.len());
        out.push_str(&text[..insert_at]);
        if insert_at > 0 && !out.ends_with('\n') {
            out.push_str(eol);
        }
        out.push_str(&block);
        out.push_str(&text[insert_at..]);

        let diff = block.lines().map(|l| format!("+{l}\n")).collect();
        self.commit(path, &out, applied, diff, "add_to_section")
    }

    pub fn remove_from_section(
        &mut self,
        path: &VaultPath,
        section: &str,
        needle: &str,
    ) -> Result<EditOutcome> {
        let text = self.read_text(path)?;
        let note = self.require_note(path)?.clone();
        let sec = find_section(&note, section)?.clone();
        let eol = detect_eol(&text);

        let body = &text[sec.body_start..sec.end];
        let needle_trim = needle.trim();
        let mut kept = Vec::new();
        let mut removed = Vec::new();
        for line in body.lines() {
            if line.trim().contains(needle_trim) && !needle_trim.is_empty() {
                removed.push(line.to_string());
            } else {
                kept.push(line.to_string());
            }
        }
        if removed.is_empty() {
            return Err(Error::InvalidVaultPath(format!(
                "no line in section '{}' matches: {needle_trim}",
                sec.heading
            )));
        }

        let mut new_body = kept.join(eol);
        if body.ends_with('\n') && !new_body.is_empty() {
            new_body.push_str(eol);
        }
        let mut out = String::with_capacity(text.len());
        out.push_str(&text[..sec.body_start]);
        out.push_str(&new_body);
        out.push_str(&text[sec.end..]);

        let diff = removed.iter().map(|l| format!("-{l}\n")).collect();
        self.commit(path, &out, Vec::new(), diff, "remove_from_section")
    }

    pub fn replace_in_section(
        &mut self,
        path: &VaultPath,
        section: &str,
        from: &str,
        to: &str,
    ) -> Result<EditOutcome> {
        let text = self.read_text(path)?;
        let note = self.require_note(path)?.clone();
        let sec = find_section(&note, section)?.clone();

        let body = &text[sec.body_start..sec.end];
        if !body.contains(from) {
            return Err(Error::InvalidVaultPath(format!(
                "section '{}' does not contain: {from}",
                sec.heading
            )));
        }
        let (linked, applied) = self.autolink(path, to);
        let new_body = body.replace(from, &linked);

        let mut out = String::with_capacity(text.len());
        out.push_str(&text[..sec.body_start]);
        out.push_str(&new_body);
        out.push_str(&text[sec.end..]);

        let diff = format!("-{from}\n+{linked}\n");
        self.commit(path, &out, applied, diff, "replace_in_section")
    }

    /// Merge frontmatter keys; a null value removes the key. A type change
    /// between scalar and collection is a conflict.
    pub fn update_frontmatter(
        &mut self,
        path: &VaultPath,
        updates: &serde_yaml::Mapping,
    ) -> Result<EditOutcome> {
        let text = self.read_text(path)?;
        let note = self.require_note(path)?.clone();
        let eol = detect_eol(&text);

        let mut fm = note.frontmatter.clone();
        for (k, v) in updates {
            let Some(key) = k.as_str() else {
                return Err(Error::InvalidVaultPath(
                    "frontmatter keys must be strings".into(),
                ));
            };
            if v.is_null() {
                fm.remove(key);
                continue;
            }
            if let Some(existing) = fm.get(key) {
                let was_collection = existing.is_sequence() || existing.is_mapping();
                let is_collection = v.is_sequence() || v.is_mapping();
                if was_collection != is_collection {
                    return Err(Error::EditConflict {
                        path: path.to_string(),
                        line: 1,
                        reason: format!("frontmatter key '{key}' changes type"),
                    });
                }
            }
            fm.insert(key.to_string(), v.clone());
        }

        let (body_offset, _) = body_start(&text);
        let body = &text[body_offset..];
        let mut out = String::new();
        if !fm.is_empty() {
            let mut mapping = serde_yaml::Mapping::new();
            for (k, v) in &fm {
                mapping.insert(serde_yaml::Value::String(k.clone()), v.clone());
            }
            let yaml = serde_yaml::to_string(&serde_yaml::Value::Mapping(mapping))?;
            out.push_str("---");
            out.push_str(eol);
            for line in yaml.lines() {
                out.push_str(line);
                out.push_str(eol);
            }
            out.push_str("---");
            out.push_str(eol);
        }
        out.push_str(body);

        let diff = format!("~frontmatter: {} key(s)\n", updates.len());
        self.commit(path, &out, Vec::new(), diff, "update_frontmatter")
    }

    pub fn create_note(
        &mut self,
        path: &VaultPath,
        frontmatter: Option<&serde_yaml::Mapping>,
        content: &str,
    ) -> Result<EditOutcome> {
        let abs = self.vault.to_abs(path);
        if abs.exists() {
            return Err(Error::NoteExists(path.to_string()));
        }
        if !path.is_markdown() {
            return Err(Error::InvalidVaultPath(format!(
                "not a markdown path: {path}"
            )));
        }
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }

        let (linked, applied) = self.autolink(path, content);
        let mut out = String::new();
        if let Some(fm) = frontmatter.filter(|m| !m.is_empty()) {
            let yaml = serde_yaml::to_string(&serde_yaml::Value::Mapping(fm.clone()))?;
            out.push_str("---\n");
            out.push_str(&yaml);
            if !yaml.ends_with('\n') {
                out.push('\n');
            }
            out.push_str("---\n");
        }
        out.push_str(&linked);
        if !out.ends_with('\n') {
            out.push('\n');
        }

        let diff = out.lines().map(|l| format!("+{l}\n")).collect();
        self.commit(path, &out, applied, diff, "create_note")
    }

    pub fn delete_note(&mut self, path: &VaultPath, force: bool) -> Result<DeleteOutcome> {
        self.require_note(path)?;
        let warnings = self.index.backlinks_of(path);
        if !warnings.is_empty() && !force {
            return Err(Error::DeleteHasBacklinks {
                path: path.to_string(),
                count: warnings.len(),
            });
        }

        let abs = self.vault.to_abs(path);
        std::fs::remove_file(&abs).map_err(|e| Error::io(&abs, e))?;
        self.index.remove(path);
        self.store.remove_note(path)?;
        self.log_mutation("delete_note", path);

        // Inbound references are left in place so health checks surface
        // them as broken.
        Ok(DeleteOutcome {
            path: path.clone(),
            deleted: true,
            backlink_warnings: warnings,
        })
    }

    /// Move a note and rewrite every referencing wikilink. Already-written
    /// files stay written on failure; the report lists exactly what
    /// happened and what is left.
    pub fn rename_note(
        &mut self,
        old: &VaultPath,
        new: &VaultPath,
        update_backlinks: bool,
        cancel: &CancelToken,
    ) -> Result<RenameReport> {
        self.require_note(old)?;
        if !new.is_markdown() {
            return Err(Error::InvalidVaultPath(format!(
                "not a markdown path: {new}"
            )));
        }
        let new_abs = self.vault.to_abs(new);
        if new_abs.exists() {
            return Err(Error::NoteExists(new.to_string()));
        }

        let sources: Vec<VaultPath> = if update_backlinks {
            let mut s: Vec<VaultPath> = self
                .index
                .backlinks_of(old)
                .into_iter()
                .map(|b| b.source)
                .collect();
            s.sort();
            s.dedup();
            s.retain(|p| p != old);
            s
        } else {
            Vec::new()
        };

        // Move the file first, then the store rows in one transaction,
        // then patch the index.
        let old_abs = self.vault.to_abs(old);
        if let Some(parent) = new_abs.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let bytes = std::fs::read(&old_abs).map_err(|e| Error::io(&old_abs, e))?;
        atomic_write(&new_abs, &bytes)?;
        std::fs::remove_file(&old_abs).map_err(|e| Error::io(&old_abs, e))?;
        self.store.rename_note(old, new)?;
        self.index.remove(old);
        self.index.upsert_file(self.vault, new.clone())?;

        let old_stem = old.stem().to_string();
        let old_key = old.link_key();
        let new_stem = new.stem().to_string();

        let mut report = RenameReport {
            from: old.clone(),
            to: new.clone(),
            rewritten: Vec::new(),
            failures: Vec::new(),
            remaining: Vec::new(),
        };

        for (ix, source) in sources.iter().enumerate() {
            if cancel.is_cancelled() {
                report.remaining = sources[ix..].to_vec();
                break;
            }
            match self.rewrite_links_in(source, &old_stem, &old_key, &new_stem) {
                Ok(true) => report.rewritten.push(source.clone()),
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(path = %source, error = %err, "rename: rewrite failed");
                    report.failures.push((source.clone(), err.to_string()));
                }
            }
        }

        self.log_mutation("rename_note", new);
        Ok(report)
    }

    fn rewrite_links_in(
        &mut self,
        source: &VaultPath,
        old_stem: &str,
        old_key: &str,
        new_stem: &str,
    ) -> Result<bool> {
        let text = self.read_text(source)?;
        let rewritten = rewrite_wikilinks(&text, |target| {
            let key = crate::vault::normalize_link_key(target);
            if key == old_key || key == old_stem.to_lowercase() {
                Some(new_stem.to_string())
            } else {
                None
            }
        });
        if rewritten == text {
            return Ok(false);
        }
        let abs = self.vault.to_abs(source);
        atomic_write(&abs, rewritten.as_bytes())?;
        self.index
            .upsert(source.clone(), rewritten.as_bytes(), SystemTime::now());
        if let Some(note) = self.index.lookup(source) {
            let title = note.title.clone();
            self.store.upsert_note_text(source, &title, &rewritten)?;
        }
        Ok(true)
    }

    pub fn toggle_task(&mut self, path: &VaultPath, line: u32) -> Result<EditOutcome> {
        let text = self.read_text(path)?;
        let note = self.require_note(path)?.clone();
        let Some(task) = note.tasks.iter().find(|t| t.line == line) else {
            return Err(Error::InvalidVaultPath(format!(
                "no task at {path}:{line}"
            )));
        };
        let mark = match task.status {
            TaskStatus::Done => ' ',
            _ => 'x',
        };

        let mut out = String::with_capacity(text.len());
        for (ix, raw) in text.split_inclusive('\n').enumerate() {
            if ix as u32 + 1 == line {
                if let Some(open) = raw.find('[') {
                    let mut replaced = String::with_capacity(raw.len());
                    replaced.push_str(&raw[..open + 1]);
                    replaced.push(mark);
                    replaced.push_str(&raw[open + 2..]);
                    out.push_str(&replaced);
                    continue;
                }
            }
            out.push_str(raw);
        }

        let diff = format!("~task at line {line}: [{mark}]\n");
        self.commit(path, &out, Vec::new(), diff, "toggle_task")
    }

    pub fn add_task(
        &mut self,
        path: &VaultPath,
        section: &str,
        text: &str,
    ) -> Result<EditOutcome> {
        self.add_to_section(path, section, text, WriteFormat::Task, InsertPosition::End)
    }

    /// Chain steps transactionally per note: a failing step restores its
    /// note to the bytes it had before the run touched it, and later steps
    /// for that note are skipped.
    pub fn run_policy(&mut self, steps: Vec<PolicyStep>) -> Result<PolicyReport> {
        let mut originals: std::collections::HashMap<VaultPath, String> =
            std::collections::HashMap::new();
        let mut failed: BTreeSet<VaultPath> = BTreeSet::new();
        let mut report = PolicyReport {
            steps: Vec::with_capacity(steps.len()),
            rolled_back: Vec::new(),
            ok: true,
        };

        for step in steps {
            let path = step.path().clone();
            let action = step.action().to_string();

            if failed.contains(&path) {
                report.steps.push(StepOutcome {
                    action,
                    path,
                    ok: false,
                    error: Some("skipped: earlier step for this note failed".into()),
                });
                report.ok = false;
                continue;
            }

            if !originals.contains_key(&path) {
                match self.read_text(&path) {
                    Ok(text) => {
                        originals.insert(path.clone(), text);
                    }
                    Err(err) => {
                        failed.insert(path.clone());
                        report.steps.push(StepOutcome {
                            action,
                            path,
                            ok: false,
                            error: Some(err.to_string()),
                        });
                        report.ok = false;
                        continue;
                    }
                }
            }

            let result = self.apply_policy_step(step);
            match result {
                Ok(()) => report.steps.push(StepOutcome {
                    action,
                    path,
                    ok: true,
                    error: None,
                }),
                Err(err) => {
                    if let Some(original) = originals.get(&path) {
                        if let Err(restore_err) = self.restore_note(&path, original) {
                            tracing::error!(
                                path = %path,
                                error = %restore_err,
                                "policy rollback failed"
                            );
                        } else {
                            report.rolled_back.push(path.clone());
                        }
                    }
                    failed.insert(path.clone());
                    report.steps.push(StepOutcome {
                        action,
                        path,
                        ok: false,
                        error: Some(err.to_string()),
                    });
                    report.ok = false;
                }
            }
        }

        Ok(report)
    }

    fn apply_policy_step(&mut self, step: PolicyStep) -> Result<()> {
        match step {
            PolicyStep::AddToSection {
                path,
                section,
                content,
                format,
                position,
            } => self
                .add_to_section(&path, &section, &content, format, position)
                .map(|_| ()),
            PolicyStep::RemoveFromSection {
                path,
                section,
                content,
            } => self.remove_from_section(&path, &section, &content).map(|_| ()),
            PolicyStep::ReplaceInSection {
                path,
                section,
                from,
                to,
            } => self.replace_in_section(&path, &section, &from, &to).map(|_| ()),
            PolicyStep::UpdateFrontmatter { path, updates } => {
                self.update_frontmatter(&path, &updates).map(|_| ())
            }
            PolicyStep::AddTask {
                path,
                section,
                text,
            } => self.add_task(&path, &section, &text).map(|_| ()),
            PolicyStep::ToggleTask { path, line } => {
                self.toggle_task(&path, line).map(|_| ())
            }
        }
    }

    fn restore_note(&mut self, path: &VaultPath, original: &str) -> Result<()> {
        let abs = self.vault.to_abs(path);
        atomic_write(&abs, original.as_bytes())?;
        self.index
            .upsert(path.clone(), original.as_bytes(), SystemTime::now());
        if let Some(note) = self.index.lookup(path) {
            let title = note.title.clone();
            self.store.upsert_note_text(path, &title, original)?;
        }
        Ok(())
    }

    // ---- shared plumbing ----

    fn require_note(&self, path: &VaultPath) -> Result<&Note> {
        self.index
            .lookup(path)
            .ok_or_else(|| Error::NoteNotFound(path.to_string()))
    }

    fn read_text(&self, path: &VaultPath) -> Result<String> {
        let abs = self.vault.to_abs(path);
        std::fs::read_to_string(&abs).map_err(|e| Error::io(&abs, e))
    }

    /// Run the application policy over new text against the live index.
    fn autolink(&self, dest: &VaultPath, content: &str) -> (String, Vec<AppliedLink>) {
        let resolver = EntityResolver::new(self.index);
        let snapshot = FeedbackSnapshot::load(self.store, self.cfg.feedback_min_sample)
            .unwrap_or_else(|_| FeedbackSnapshot::empty(self.cfg.feedback_min_sample));
        let cooccurrence = CooccurrenceCounts::build(self.index, self.cfg.cooccurrence_window);
        let degrees = self.index.in_degrees();
        let dest_entities: BTreeSet<VaultPath> = self
            .index
            .lookup(dest)
            .map(|n| {
                n.outlinks
                    .iter()
                    .filter_map(|l| self.index.resolve(&l.target).cloned())
                    .collect()
            })
            .unwrap_or_default();
        let ctx = ScoreContext {
            index: self.index,
            feedback: &snapshot,
            cooccurrence: &cooccurrence,
            degrees: &degrees,
            dest_folder: dest.folder(),
            dest_entities: &dest_entities,
            now: SystemTime::now(),
        };
        apply_autolinks(&resolver, content, dest, &ctx, self.cfg)
    }

    /// Atomic write + synchronous index/store/feedback updates. The watcher
    /// will re-parse the same bytes and no-op.
    fn commit(
        &mut self,
        path: &VaultPath,
        new_text: &str,
        applied: Vec<AppliedLink>,
        diff: String,
        op: &str,
    ) -> Result<EditOutcome> {
        let abs = self.vault.to_abs(path);
        atomic_write(&abs, new_text.as_bytes())?;
        self.index
            .upsert(path.clone(), new_text.as_bytes(), SystemTime::now());

        let note = self
            .index
            .lookup(path)
            .ok_or_else(|| Error::NoteNotFound(path.to_string()))?;
        let title = note.title.clone();
        let current_targets: BTreeSet<String> = note
            .outlinks
            .iter()
            .filter_map(|l| self.index.resolve(&l.target))
            .filter_map(|p| self.index.entity(p).map(|e| e.name.clone()))
            .collect();
        self.store.upsert_note_text(path, &title, new_text)?;

        let mut feedback = FeedbackEngine::new(self.store, self.cfg);
        let implicit_removals = feedback.reconcile_applications(path, &current_targets)?;
        for link in &applied {
            feedback.record_application(path, &link.entity_name, &link.surface)?;
        }

        self.log_mutation(op, path);
        Ok(EditOutcome {
            path: path.clone(),
            diff,
            applied_links: applied,
            implicit_removals,
        })
    }

    fn log_mutation(&self, op: &str, path: &VaultPath) {
        tracing::info!(op, path = %path, "mutation committed");
    }

    /// Reject insertion points inside fenced code, blockquotes, or
    /// frontmatter.
    fn check_insertion_point(&self, path: &VaultPath, text: &str, at: usize) -> Result<()> {
        let (body_offset, _) = body_start(text);
        let line_no = 1 + text[..at].bytes().filter(|b| *b == b'\n').count() as u32;
        if at < body_offset {
            return Err(Error::EditConflict {
                path: path.to_string(),
                line: line_no,
                reason: "insertion lands inside frontmatter".into(),
            });
        }

        let mut fences = FenceTracker::default();
        let mut offset = body_offset;
        let mut prev_quote = false;
        for line in text[body_offset..].split_inclusive('\n') {
            let stripped = line.trim_end_matches(['\n', '\r']);
            let was_in_fence = fences.in_fence();
            let is_fence_line = fences.observe(stripped);
            if offset + line.len() > at {
                // Inside an open block, on a closing fence line, or within
                // the opening marker itself.
                let inside_fence = fences.in_fence()
                    || (is_fence_line && was_in_fence)
                    || (is_fence_line && at > offset);
                if inside_fence {
                    return Err(Error::EditConflict {
                        path: path.to_string(),
                        line: line_no,
                        reason: "insertion lands inside a fenced code block".into(),
                    });
                }
                let cur_quote = stripped.trim_start().starts_with('>');
                if prev_quote && cur_quote {
                    return Err(Error::EditConflict {
                        path: path.to_string(),
                        line: line_no,
                        reason: "insertion lands inside a blockquote".into(),
                    });
                }
                return Ok(());
            }
            prev_quote = stripped.trim_start().starts_with('>');
            offset += line.len();
        }

        // Insertion at EOF inside an unclosed fence is still a conflict.
        if fences.in_fence() {
            return Err(Error::EditConflict {
                path: path.to_string(),
                line: line_no,
                reason: "insertion lands inside a fenced code block".into(),
            });
        }
        Ok(())
    }
}

/// Write-to-temp, fsync, rename-over. The reader never observes a partial
/// file.
pub(crate) fn atomic_write(abs: &Path, bytes: &[u8]) -> Result<()> {
    let dir = abs
        .parent()
        .ok_or_else(|| Error::InvalidVaultPath(format!("no parent: {}", abs.display())))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| Error::io(dir, e))?;
    tmp.write_all(bytes).map_err(|e| Error::io(abs, e))?;
    tmp.as_file().sync_all().map_err(|e| Error::io(abs, e))?;
    tmp.persist(abs)
        .map_err(|e| Error::io(abs, e.error))?;
    Ok(())
}

fn detect_eol(text: &str) -> &'static str {
    if text.contains("\r\n") {
        "\r\n"
    } else {
        "\n"
    }
}

/// Resolve a section address, optionally qualified by ancestors
/// (`A > B > C`). Ambiguous addresses list their qualified candidates.
pub(crate) fn find_section<'a>(note: &'a Note, address: &str) -> Result<&'a Section> {
    let segments: Vec<&str> = address.split('>').map(str::trim).collect();
    let Some((leaf, ancestors)) = segments.split_last() else {
        return Err(Error::InvalidVaultPath("empty section address".into()));
    };

    let matches: Vec<usize> = note
        .sections
        .iter()
        .enumerate()
        .filter(|(ix, s)| {
            if !s.heading.eq_ignore_ascii_case(leaf) {
                return false;
            }
            let chain = ancestor_chain(note, *ix);
            ancestors.iter().all(|a| {
                chain
                    .iter()
                    .any(|c| c.eq_ignore_ascii_case(a))
            })
        })
        .map(|(ix, _)| ix)
        .collect();

    match matches.len() {
        0 => Err(Error::SectionNotFound {
            path: note.path.to_string(),
            section: address.to_string(),
        }),
        1 => Ok(&note.sections[matches[0]]),
        _ => Err(Error::AmbiguousSection {
            path: note.path.to_string(),
            section: address.to_string(),
            candidates: matches
                .iter()
                .map(|ix| {
                    let mut chain = ancestor_chain(note, *ix);
                    chain.push(note.sections[*ix].heading.clone());
                    chain.join(" > ")
                })
                .collect(),
        }),
    }
}

/// Headings of strictly shallower level preceding this section, outermost
/// first.
fn ancestor_chain(note: &Note, ix: usize) -> Vec<String> {
    let mut chain = Vec::new();
    let mut level = note.sections[ix].level;
    let start = note.sections[ix].start;
    for s in note.sections.iter().rev() {
        if s.start >= start || s.level >= level {
            continue;
        }
        chain.push(s.heading.clone());
        level = s.level;
        if level == 1 {
            break;
        }
    }
    chain.reverse();
    chain
}

fn insertion_offset(text: &str, sec: &Section, position: InsertPosition) -> Result<usize> {
    match position {
        InsertPosition::Top => Ok(sec.body_start),
        InsertPosition::End => {
            // Back off over trailing blank lines.
            let body = &text[sec.body_start..sec.end];
            let mut end = body.len();
            for line in body.split_inclusive('\n').rev() {
                if line.trim().is_empty() {
                    end -= line.len();
                } else {
                    break;
                }
            }
            Ok(sec.body_start + end)
        }
        InsertPosition::BeforeLine(n) | InsertPosition::AfterLine(n) => {
            let after = matches!(position, InsertPosition::AfterLine(_));
            let mut line_no = 1u32;
            let mut offset = 0usize;
            for line in text.split_inclusive('\n') {
                if line_no == n {
                    let at = if after { offset + line.len() } else { offset };
                    if at < sec.body_start || at > sec.end {
                        return Err(Error::InvalidVaultPath(format!(
                            "line {n} is outside section '{}'",
                            sec.heading
                        )));
                    }
                    return Ok(at);
                }
                line_no += 1;
                offset += line.len();
            }
            Err(Error::InvalidVaultPath(format!("no line {n} in note")))
        }
    }
}

/// Indentation of the deepest list item in the section; two spaces when
/// the section has none to match.
fn deepest_list_indent(text: &str, sec: &Section) -> String {
    let body = &text[sec.body_start..sec.end];
    let mut best: Option<String> = None;
    for line in body.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("- ") || trimmed.starts_with("* ") || trimmed.starts_with("+ ") {
            let indent = &line[..line.len() - trimmed.len()];
            if best.as_ref().is_none_or(|b| indent.len() > b.len()) {
                best = Some(indent.to_string());
            }
        }
    }
    best.unwrap_or_else(|| "  ".to_string())
}

fn indent_at(text: &str, at: usize) -> String {
    let line_start = text[..at].rfind('\n').map(|ix| ix + 1).unwrap_or(0);
    let line = &text[line_start..];
    let trimmed = line.trim_start_matches([' ', '\t']);
    line[..line.len() - trimmed.len()].to_string()
}

fn format_block(content: &str, format: WriteFormat, indent: &str, eol: &str) -> String {
    let prefix = match format {
        WriteFormat::Plain => String::new(),
        WriteFormat::Bullet => "- ".to_string(),
        WriteFormat::TimestampBullet => format!("- {} - ", now_hhmm()),
        WriteFormat::Task => "- [ ] ".to_string(),
    };
    let continuation = if prefix.is_empty() {
        indent.to_string()
    } else {
        format!("{indent}  ")
    };

    let mut out = String::new();
    for (ix, line) in content.lines().enumerate() {
        if ix == 0 {
            out.push_str(indent);
            out.push_str(&prefix);
        } else {
            out.push_str(&continuation);
        }
        out.push_str(line);
        out.push_str(eol);
    }
    if content.is_empty() {
        out.push_str(indent);
        out.push_str(prefix.trim_end());
        out.push_str(eol);
    }
    out
}

fn now_hhmm() -> String {
    chrono::Local::now().format("%H:%M").to_string()
}

/// Rewrite wikilink targets via the mapper, preserving display aliases and
/// leaving code fences untouched.
pub(crate) fn rewrite_wikilinks(
    text: &str,
    map_target: impl Fn(&str) -> Option<String>,
) -> String {
    let mut out = String::with_capacity(text.len());
    let mut fences = FenceTracker::default();
    let (body_offset, _) = body_start(text);
    out.push_str(&text[..body_offset]);

    for line in text[body_offset..].split_inclusive('\n') {
        let stripped = line.trim_end_matches(['\n', '\r']);
        if fences.observe(stripped) || fences.in_fence() {
            out.push_str(line);
            continue;
        }
        out.push_str(&rewrite_line(line, &map_target));
    }
    out
}

fn rewrite_line(line: &str, map_target: &impl Fn(&str) -> Option<String>) -> String {
    let bytes = line.as_bytes();
    let mut out = String::with_capacity(line.len());
    let mut i = 0usize;
    while i < bytes.len() {
        if i + 1 < bytes.len() && bytes[i] == b'[' && bytes[i + 1] == b'[' {
            let mut j = i + 2;
            while j + 1 < bytes.len() && !(bytes[j] == b']' && bytes[j + 1] == b']') {
                j += 1;
            }
            if j + 1 < bytes.len() {
                let inner = &line[i + 2..j];
                let (target, display) = match inner.split_once('|') {
                    Some((t, d)) => (t, Some(d)),
                    None => (inner, None),
                };
                match map_target(target.trim()) {
                    Some(new_target) => {
                        out.push_str("[[");
                        out.push_str(&new_target);
                        if let Some(d) = display {
                            out.push('|');
                            out.push_str(d);
                        }
                        out.push_str("]]");
                    }
                    None => out.push_str(&line[i..j + 2]),
                }
                i = j + 2;
                continue;
            }
        }
        let ch_len = line[i..].chars().next().map(char::len_utf8).unwrap_or(1);
        out.push_str(&line[i..i + ch_len]);
        i += ch_len;
    }
    out
}
