use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::SystemTime;

use nucleo::{
    pattern::{CaseMatching, Normalization, Pattern},
    Matcher, Utf32Str,
};

use crate::feedback::{FeedbackEngine, FeedbackSnapshot, VerdictOutcome};
use crate::graph::{find_hubs, find_orphans, shortest_path, HubNote, OrphanDirection};
use crate::mutate::{
    DeleteOutcome, EditOutcome, InsertPosition, PolicyReport, PolicyStep, RenameReport,
    WriteFormat,
};
use crate::resolver::{CooccurrenceCounts, EntityResolver, ScoreContext, ScoredCandidate};
use crate::store::{FeedbackRow, FeedbackVerdict, MetricsSnapshot};
use crate::{Backlink, CancelToken, Error, Result, Section, VaultPath, VaultService};

/// Category tag; presets filter operations by these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpCategory {
    Search,
    Backlinks,
    Notes,
    Tasks,
    Graph,
    Health,
    Feedback,
    Mutation,
    Resources,
}

/// Declared cost of serving an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CostClass {
    Metadata,
    Index,
    FileRead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchScope {
    Metadata,
    Content,
    Entities,
    #[default]
    All,
}

fn default_limit() -> usize {
    20
}

/// The operation surface: one variant per named operation, typed input
/// embedded. Dispatch is a match, not a handler registry.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    SearchNotes {
        query: String,
        #[serde(default)]
        scope: SearchScope,
        #[serde(default)]
        tag: Option<String>,
        #[serde(default)]
        folder: Option<String>,
        #[serde(default = "default_limit")]
        limit: usize,
    },
    GetBacklinks {
        path: VaultPath,
    },
    GetOutlinks {
        path: VaultPath,
    },
    GetNoteMetadata {
        path: VaultPath,
    },
    GetSectionContent {
        path: VaultPath,
        section: String,
    },
    FindHubNotes {
        #[serde(default = "default_limit")]
        top_k: usize,
    },
    FindOrphanNotes {
        direction: OrphanDirection,
    },
    GetShortestPath {
        from: VaultPath,
        to: VaultPath,
        #[serde(default)]
        weighted: bool,
    },
    GetFrontmatterSchema,
    SuggestWikilinks {
        path: VaultPath,
        #[serde(default = "default_limit")]
        limit: usize,
    },
    VaultAddToSection {
        path: VaultPath,
        section: String,
        content: String,
        #[serde(default)]
        format: WriteFormat,
        #[serde(default)]
        position: InsertPosition,
    },
    VaultRemoveFromSection {
        path: VaultPath,
        section: String,
        content: String,
    },
    VaultReplaceInSection {
        path: VaultPath,
        section: String,
        from: String,
        to: String,
    },
    VaultUpdateFrontmatter {
        path: VaultPath,
        updates: serde_yaml::Mapping,
    },
    VaultCreateNote {
        path: VaultPath,
        #[serde(default)]
        frontmatter: Option<serde_yaml::Mapping>,
        #[serde(default)]
        content: String,
    },
    VaultRenameNote {
        old: VaultPath,
        new: VaultPath,
        #[serde(default)]
        update_backlinks: bool,
    },
    VaultDeleteNote {
        path: VaultPath,
        #[serde(default)]
        force: bool,
    },
    VaultToggleTask {
        path: VaultPath,
        line: u32,
    },
    VaultAddTask {
        path: VaultPath,
        section: String,
        text: String,
    },
    VaultRunPolicy {
        steps: Vec<PolicyStep>,
    },
    ReportWikilinkFeedback {
        target: String,
        context: String,
        verdict: FeedbackVerdict,
    },
    ListWikilinkFeedback {
        #[serde(default = "default_limit")]
        limit: usize,
    },
    ClearWikilinkSuppression {
        target: String,
        context: String,
    },
    GetVaultStats,
    GetRecentNotes {
        #[serde(default = "default_limit")]
        limit: usize,
    },
    ExportEntities,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SearchNotes { .. } => "search_notes",
            Self::GetBacklinks { .. } => "get_backlinks",
            Self::GetOutlinks { .. } => "get_outlinks",
            Self::GetNoteMetadata { .. } => "get_note_metadata",
            Self::GetSectionContent { .. } => "get_section_content",
            Self::FindHubNotes { .. } => "find_hub_notes",
            Self::FindOrphanNotes { .. } => "find_orphan_notes",
            Self::GetShortestPath { .. } => "get_shortest_path",
            Self::GetFrontmatterSchema => "get_frontmatter_schema",
            Self::SuggestWikilinks { .. } => "suggest_wikilinks",
            Self::VaultAddToSection { .. } => "vault_add_to_section",
            Self::VaultRemoveFromSection { .. } => "vault_remove_from_section",
            Self::VaultReplaceInSection { .. } => "vault_replace_in_section",
            Self::VaultUpdateFrontmatter { .. } => "vault_update_frontmatter",
            Self::VaultCreateNote { .. } => "vault_create_note",
            Self::VaultRenameNote { .. } => "vault_rename_note",
            Self::VaultDeleteNote { .. } => "vault_delete_note",
            Self::VaultToggleTask { .. } => "vault_toggle_task",
            Self::VaultAddTask { .. } => "vault_add_task",
            Self::VaultRunPolicy { .. } => "vault_run_policy",
            Self::ReportWikilinkFeedback { .. } => "report_wikilink_feedback",
            Self::ListWikilinkFeedback { .. } => "list_wikilink_feedback",
            Self::ClearWikilinkSuppression { .. } => "clear_wikilink_suppression",
            Self::GetVaultStats => "get_vault_stats",
            Self::GetRecentNotes { .. } => "get_recent_notes",
            Self::ExportEntities => "export_entities",
        }
    }

    pub fn category(&self) -> OpCategory {
        match self {
            Self::SearchNotes { .. } => OpCategory::Search,
            Self::GetBacklinks { .. } | Self::GetOutlinks { .. } => OpCategory::Backlinks,
            Self::GetNoteMetadata { .. } | Self::GetSectionContent { .. } => OpCategory::Notes,
            Self::FindHubNotes { .. }
            | Self::FindOrphanNotes { .. }
            | Self::GetShortestPath { .. } => OpCategory::Graph,
            Self::GetFrontmatterSchema => OpCategory::Health,
            Self::SuggestWikilinks { .. } => OpCategory::Search,
            Self::VaultAddToSection { .. }
            | Self::VaultRemoveFromSection { .. }
            | Self::VaultReplaceInSection { .. }
            | Self::VaultUpdateFrontmatter { .. }
            | Self::VaultCreateNote { .. }
            | Self::VaultRenameNote { .. }
            | Self::VaultDeleteNote { .. }
            | Self::VaultRunPolicy { .. } => OpCategory::Mutation,
            Self::VaultToggleTask { .. } | Self::VaultAddTask { .. } => OpCategory::Tasks,
            Self::ReportWikilinkFeedback { .. }
            | Self::ListWikilinkFeedback { .. }
            | Self::ClearWikilinkSuppression { .. } => OpCategory::Feedback,
            Self::GetVaultStats | Self::GetRecentNotes { .. } | Self::ExportEntities => {
                OpCategory::Resources
            }
        }
    }

    pub fn cost_class(&self) -> CostClass {
        match self {
            Self::GetVaultStats
            | Self::GetRecentNotes { .. }
            | Self::ListWikilinkFeedback { .. }
            | Self::GetFrontmatterSchema => CostClass::Metadata,
            Self::SearchNotes { .. }
            | Self::GetBacklinks { .. }
            | Self::GetOutlinks { .. }
            | Self::GetNoteMetadata { .. }
            | Self::FindHubNotes { .. }
            | Self::FindOrphanNotes { .. }
            | Self::GetShortestPath { .. }
            | Self::ReportWikilinkFeedback { .. }
            | Self::ClearWikilinkSuppression { .. }
            | Self::ExportEntities => CostClass::Index,
            Self::GetSectionContent { .. }
            | Self::SuggestWikilinks { .. }
            | Self::VaultAddToSection { .. }
            | Self::VaultRemoveFromSection { .. }
            | Self::VaultReplaceInSection { .. }
            | Self::VaultUpdateFrontmatter { .. }
            | Self::VaultCreateNote { .. }
            | Self::VaultRenameNote { .. }
            | Self::VaultDeleteNote { .. }
            | Self::VaultToggleTask { .. }
            | Self::VaultAddTask { .. }
            | Self::VaultRunPolicy { .. } => CostClass::FileRead,
        }
    }

    fn is_write(&self) -> bool {
        matches!(
            self.category(),
            OpCategory::Mutation | OpCategory::Tasks
        )
    }
}

/// Which operation categories a session exposes, from a comma-separated
/// preset string. Category names and the bundles `all`, `minimal`, `read`
/// and `write` are recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpPreset {
    allowed: HashSet<OpCategory>,
}

impl Default for OpPreset {
    fn default() -> Self {
        Self::all()
    }
}

impl OpPreset {
    pub fn all() -> Self {
        Self {
            allowed: [
                OpCategory::Search,
                OpCategory::Backlinks,
                OpCategory::Notes,
                OpCategory::Tasks,
                OpCategory::Graph,
                OpCategory::Health,
                OpCategory::Feedback,
                OpCategory::Mutation,
                OpCategory::Resources,
            ]
            .into(),
        }
    }

    pub fn minimal() -> Self {
        Self {
            allowed: [OpCategory::Search, OpCategory::Backlinks, OpCategory::Notes].into(),
        }
    }

    pub fn parse(selector: &str) -> Result<Self> {
        let selector = selector.trim();
        if selector.is_empty() {
            return Ok(Self::all());
        }
        let mut allowed = HashSet::new();
        for part in selector.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.to_lowercase().as_str() {
                "all" => return Ok(Self::all()),
                "minimal" => allowed.extend(Self::minimal().allowed),
                "read" => {
                    allowed.extend(Self::all().allowed);
                    allowed.remove(&OpCategory::Mutation);
                    allowed.remove(&OpCategory::Tasks);
                }
                "write" => {
                    allowed.insert(OpCategory::Mutation);
                    allowed.insert(OpCategory::Tasks);
                }
                "search" => {
                    allowed.insert(OpCategory::Search);
                }
                "backlinks" => {
                    allowed.insert(OpCategory::Backlinks);
                }
                "notes" => {
                    allowed.insert(OpCategory::Notes);
                }
                "tasks" => {
                    allowed.insert(OpCategory::Tasks);
                }
                "graph" => {
                    allowed.insert(OpCategory::Graph);
                }
                "health" => {
                    allowed.insert(OpCategory::Health);
                }
                "feedback" => {
                    allowed.insert(OpCategory::Feedback);
                }
                "mutation" | "vault" => {
                    allowed.insert(OpCategory::Mutation);
                }
                "resources" => {
                    allowed.insert(OpCategory::Resources);
                }
                other => {
                    return Err(Error::UnknownOperation(format!(
                        "unknown preset component: {other}"
                    )));
                }
            }
        }
        Ok(Self { allowed })
    }

    pub fn allows(&self, op: &Operation) -> bool {
        self.allowed.contains(&op.category())
    }
}

// ---- typed outputs ----

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SearchHit {
    pub path: VaultPath,
    pub title: String,
    pub snippet: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct OutlinkInfo {
    pub target: String,
    pub resolved_path: Option<VaultPath>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SectionInfo {
    pub heading: String,
    pub level: u8,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct NoteMetadata {
    pub path: VaultPath,
    pub title: String,
    pub frontmatter: BTreeMap<String, serde_yaml::Value>,
    pub tags: Vec<String>,
    pub aliases: Vec<String>,
    pub outline: Vec<SectionInfo>,
    pub outlink_count: usize,
    pub backlink_count: usize,
    pub task_count: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct FieldSchema {
    pub field: String,
    pub types: BTreeMap<String, usize>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Suggestion {
    pub surface: String,
    pub line: u32,
    pub candidate: ScoredCandidate,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct VaultStats {
    pub state: crate::IndexState,
    pub note_count: usize,
    pub tag_count: usize,
    pub link_count: usize,
    pub orphan_count: usize,
    pub entity_count: usize,
    pub index_age_secs: Option<u64>,
    pub last_snapshot: Option<MetricsSnapshot>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RecentNote {
    pub path: VaultPath,
    pub title: String,
    pub modified_secs_ago: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum OpOutput {
    Search(Vec<SearchHit>),
    Backlinks(Vec<Backlink>),
    Outlinks(Vec<OutlinkInfo>),
    Metadata(Box<NoteMetadata>),
    SectionContent { content: String },
    Hubs(Vec<HubNote>),
    Orphans(Vec<VaultPath>),
    Path(Vec<VaultPath>),
    Schema(Vec<FieldSchema>),
    Suggestions(Vec<Suggestion>),
    Edit(EditOutcome),
    Delete(DeleteOutcome),
    Rename(RenameReport),
    Policy(PolicyReport),
    Feedback(VerdictOutcome),
    FeedbackList(Vec<FeedbackRow>),
    Cleared { cleared: bool },
    Stats(Box<VaultStats>),
    Recent(Vec<RecentNote>),
    Exported { path: String, entities: usize },
}

/// Executes operations against a service, honouring the session preset and
/// the readiness gate.
pub struct OpDispatcher<'a> {
    service: &'a VaultService,
    preset: OpPreset,
}

impl<'a> OpDispatcher<'a> {
    pub fn new(service: &'a VaultService, preset: OpPreset) -> Self {
        Self { service, preset }
    }

    pub fn dispatch(&self, op: Operation) -> Result<OpOutput> {
        if !self.preset.allows(&op) {
            return Err(Error::UnknownOperation(format!(
                "{} (not in session preset)",
                op.name()
            )));
        }
        if op.is_write() {
            self.service.require_ready()?;
        } else {
            self.service.require_readable()?;
        }
        tracing::debug!(op = op.name(), cost = ?op.cost_class(), "dispatch");

        match op {
            Operation::SearchNotes {
                query,
                scope,
                tag,
                folder,
                limit,
            } => self.search_notes(&query, scope, tag.as_deref(), folder.as_deref(), limit),
            Operation::GetBacklinks { path } => Ok(OpOutput::Backlinks(
                self.service.with_index(|idx| idx.backlinks_of(&path)),
            )),
            Operation::GetOutlinks { path } => self.get_outlinks(&path),
            Operation::GetNoteMetadata { path } => self.get_note_metadata(&path),
            Operation::GetSectionContent { path, section } => {
                self.get_section_content(&path, &section)
            }
            Operation::FindHubNotes { top_k } => Ok(OpOutput::Hubs(
                self.service.with_index(|idx| find_hubs(idx, top_k)),
            )),
            Operation::FindOrphanNotes { direction } => Ok(OpOutput::Orphans(
                self.service.with_index(|idx| find_orphans(idx, direction)),
            )),
            Operation::GetShortestPath { from, to, weighted } => Ok(OpOutput::Path(
                self.service
                    .with_index(|idx| shortest_path(idx, &from, &to, weighted)),
            )),
            Operation::GetFrontmatterSchema => self.get_frontmatter_schema(),
            Operation::SuggestWikilinks { path, limit } => self.suggest_wikilinks(&path, limit),
            Operation::VaultAddToSection {
                path,
                section,
                content,
                format,
                position,
            } => Ok(OpOutput::Edit(self.service.mutate(|m| {
                m.add_to_section(&path, &section, &content, format, position)
            })?)),
            Operation::VaultRemoveFromSection {
                path,
                section,
                content,
            } => Ok(OpOutput::Edit(self.service.mutate(|m| {
                m.remove_from_section(&path, &section, &content)
            })?)),
            Operation::VaultReplaceInSection {
                path,
                section,
                from,
                to,
            } => Ok(OpOutput::Edit(self.service.mutate(|m| {
                m.replace_in_section(&path, &section, &from, &to)
            })?)),
            Operation::VaultUpdateFrontmatter { path, updates } => Ok(OpOutput::Edit(
                self.service
                    .mutate(|m| m.update_frontmatter(&path, &updates))?,
            )),
            Operation::VaultCreateNote {
                path,
                frontmatter,
                content,
            } => Ok(OpOutput::Edit(self.service.mutate(|m| {
                m.create_note(&path, frontmatter.as_ref(), &content)
            })?)),
            Operation::VaultRenameNote {
                old,
                new,
                update_backlinks,
            } => Ok(OpOutput::Rename(self.service.mutate(|m| {
                m.rename_note(&old, &new, update_backlinks, &CancelToken::new())
            })?)),
            Operation::VaultDeleteNote { path, force } => Ok(OpOutput::Delete(
                self.service.mutate(|m| m.delete_note(&path, force))?,
            )),
            Operation::VaultToggleTask { path, line } => Ok(OpOutput::Edit(
                self.service.mutate(|m| m.toggle_task(&path, line))?,
            )),
            Operation::VaultAddTask {
                path,
                section,
                text,
            } => Ok(OpOutput::Edit(
                self.service.mutate(|m| m.add_task(&path, &section, &text))?,
            )),
            Operation::VaultRunPolicy { steps } => Ok(OpOutput::Policy(
                self.service.mutate(|m| m.run_policy(steps))?,
            )),
            Operation::ReportWikilinkFeedback {
                target,
                context,
                verdict,
            } => {
                let cfg = self.service.config().clone();
                let outcome = self.service.with_store(|store| {
                    FeedbackEngine::new(store, &cfg).report(&target, &context, verdict)
                })?;
                Ok(OpOutput::Feedback(outcome))
            }
            Operation::ListWikilinkFeedback { limit } => Ok(OpOutput::FeedbackList(
                self.service.with_store(|store| store.list_feedback(limit))?,
            )),
            Operation::ClearWikilinkSuppression { target, context } => {
                let cleared = self
                    .service
                    .with_store(|store| store.clear_suppression(&target, &context))?;
                Ok(OpOutput::Cleared { cleared })
            }
            Operation::GetVaultStats => self.get_vault_stats(),
            Operation::GetRecentNotes { limit } => self.get_recent_notes(limit),
            Operation::ExportEntities => self.export_entities(),
        }
    }

    fn search_notes(
        &self,
        query: &str,
        scope: SearchScope,
        tag: Option<&str>,
        folder: Option<&str>,
        limit: usize,
    ) -> Result<OpOutput> {
        let mut hits: Vec<SearchHit> = Vec::new();

        if matches!(scope, SearchScope::Content | SearchScope::All) {
            hits.extend(
                self.service
                    .with_store(|store| store.search(query, limit))?
                    .into_iter()
                    .filter_map(|h| {
                        let path = VaultPath::try_from(h.path.as_str()).ok()?;
                        Some(SearchHit {
                            path,
                            title: h.title,
                            snippet: h.snippet,
                            score: h.score,
                        })
                    }),
            );
        }

        if matches!(scope, SearchScope::Metadata | SearchScope::All) {
            hits.extend(self.fuzzy_metadata(query));
        }

        if matches!(scope, SearchScope::Entities | SearchScope::All) {
            hits.extend(self.fuzzy_entities(query));
        }

        self.service.with_index(|idx| {
            hits.retain(|h| {
                let note = idx.lookup(&h.path);
                let tag_ok = tag.is_none_or(|t| {
                    let key = t.trim_start_matches('#').to_lowercase();
                    note.is_some_and(|n| n.tags.iter().any(|nt| nt.to_lowercase() == key))
                });
                let folder_ok =
                    folder.is_none_or(|f| h.path.folder() == f.trim_end_matches('/'));
                tag_ok && folder_ok
            });
        });

        // Best score per path wins.
        hits.sort_by(|a, b| {
            a.path.cmp(&b.path).then(
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
        });
        hits.dedup_by(|a, b| a.path == b.path);
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.path.cmp(&b.path))
        });
        hits.truncate(limit);
        Ok(OpOutput::Search(hits))
    }

    /// Fuzzy match over paths and titles, the metadata scope.
    fn fuzzy_metadata(&self, query: &str) -> Vec<SearchHit> {
        let q = query.trim();
        if q.is_empty() {
            return Vec::new();
        }
        let pattern = Pattern::parse(q, CaseMatching::Smart, Normalization::Smart);
        let mut matcher = Matcher::new(nucleo::Config::DEFAULT);
        let mut buf = Vec::new();

        self.service.with_index(|idx| {
            let mut hits = Vec::new();
            for note in idx.all_notes() {
                let hay = format!("{} {}", note.path, note.title);
                if let Some(score) = pattern.score(Utf32Str::new(&hay, &mut buf), &mut matcher) {
                    hits.push(SearchHit {
                        path: note.path.clone(),
                        title: note.title.clone(),
                        snippet: String::new(),
                        score: f64::from(score) / 10.0,
                    });
                }
            }
            hits
        })
    }

    /// Fuzzy match over entity names and aliases.
    fn fuzzy_entities(&self, query: &str) -> Vec<SearchHit> {
        let q = query.trim();
        if q.is_empty() {
            return Vec::new();
        }
        let pattern = Pattern::parse(q, CaseMatching::Smart, Normalization::Smart);
        let mut matcher = Matcher::new(nucleo::Config::DEFAULT);
        let mut buf = Vec::new();

        self.service.with_index(|idx| {
            let mut hits = Vec::new();
            for entity in idx.entities() {
                let mut surfaces = vec![entity.name.clone()];
                surfaces.extend(entity.aliases.iter().cloned());
                let best = surfaces
                    .iter()
                    .filter_map(|s| pattern.score(Utf32Str::new(s, &mut buf), &mut matcher))
                    .max();
                if let Some(score) = best {
                    let title = idx
                        .lookup(&entity.path)
                        .map(|n| n.title.clone())
                        .unwrap_or_else(|| entity.name.clone());
                    hits.push(SearchHit {
                        path: entity.path.clone(),
                        title,
                        snippet: entity.name.clone(),
                        score: f64::from(score) / 10.0,
                    });
                }
            }
            hits
        })
    }

    fn get_outlinks(&self, path: &VaultPath) -> Result<OpOutput> {
        self.service.with_index(|idx| {
            let note = idx
                .lookup(path)
                .ok_or_else(|| Error::NoteNotFound(path.to_string()))?;
            Ok(OpOutput::Outlinks(
                note.outlinks
                    .iter()
                    .map(|l| OutlinkInfo {
                        target: l.target.clone(),
                        resolved_path: idx.resolve(&l.target).cloned(),
                        line: l.line,
                    })
                    .collect(),
            ))
        })
    }

    fn get_note_metadata(&self, path: &VaultPath) -> Result<OpOutput> {
        self.service.with_index(|idx| {
            let note = idx
                .lookup(path)
                .ok_or_else(|| Error::NoteNotFound(path.to_string()))?;
            Ok(OpOutput::Metadata(Box::new(NoteMetadata {
                path: note.path.clone(),
                title: note.title.clone(),
                frontmatter: note.frontmatter.clone(),
                tags: note.tags.clone(),
                aliases: note.aliases.clone(),
                outline: note
                    .sections
                    .iter()
                    .map(|s: &Section| SectionInfo {
                        heading: s.heading.clone(),
                        level: s.level,
                        line: s.heading_line,
                    })
                    .collect(),
                outlink_count: note.outlinks.len(),
                backlink_count: idx.backlinks_of(path).len(),
                task_count: note.tasks.len(),
                warnings: note.warnings.clone(),
            })))
        })
    }

    fn get_section_content(&self, path: &VaultPath, section: &str) -> Result<OpOutput> {
        let (body_start, body_end) = self.service.with_index(|idx| {
            let note = idx
                .lookup(path)
                .ok_or_else(|| Error::NoteNotFound(path.to_string()))?;
            let sec = crate::mutate::find_section(note, section)?;
            Ok::<_, Error>((sec.body_start, sec.end))
        })?;
        let abs = self.service.vault().to_abs(path);
        let text = std::fs::read_to_string(&abs).map_err(|e| Error::io(&abs, e))?;
        let content = text
            .get(body_start..body_end)
            .unwrap_or_default()
            .to_string();
        Ok(OpOutput::SectionContent { content })
    }

    fn get_frontmatter_schema(&self) -> Result<OpOutput> {
        self.service.with_index(|idx| {
            let mut fields: BTreeMap<String, FieldSchema> = BTreeMap::new();
            for note in idx.all_notes() {
                for (key, value) in &note.frontmatter {
                    let entry = fields.entry(key.clone()).or_insert_with(|| FieldSchema {
                        field: key.clone(),
                        types: BTreeMap::new(),
                        count: 0,
                    });
                    entry.count += 1;
                    *entry.types.entry(yaml_type_name(value).to_string()).or_default() += 1;
                }
            }
            Ok(OpOutput::Schema(fields.into_values().collect()))
        })
    }

    fn suggest_wikilinks(&self, path: &VaultPath, limit: usize) -> Result<OpOutput> {
        let abs = self.service.vault().to_abs(path);
        let text = std::fs::read_to_string(&abs).map_err(|e| Error::io(&abs, e))?;
        let cfg = self.service.config();
        let snapshot = self
            .service
            .with_store(|store| FeedbackSnapshot::load(store, cfg.feedback_min_sample))?;

        self.service.with_index(|idx| {
            let resolver = EntityResolver::new(idx);
            let cooccurrence = CooccurrenceCounts::build(idx, cfg.cooccurrence_window);
            let degrees = idx.in_degrees();
            let dest_entities: BTreeSet<VaultPath> = idx
                .lookup(path)
                .map(|n| {
                    n.outlinks
                        .iter()
                        .filter_map(|l| idx.resolve(&l.target).cloned())
                        .collect()
                })
                .unwrap_or_default();
            let ctx = ScoreContext {
                index: idx,
                feedback: &snapshot,
                cooccurrence: &cooccurrence,
                degrees: &degrees,
                dest_folder: path.folder(),
                dest_entities: &dest_entities,
                now: SystemTime::now(),
            };

            let mut seen: BTreeSet<VaultPath> = BTreeSet::new();
            let mut out = Vec::new();
            for res in crate::resolver::resolve_spans(&resolver, &text, path, &ctx) {
                for cand in std::iter::once(&res.winner).chain(res.alternates.iter()) {
                    if seen.insert(cand.path.clone()) {
                        out.push(Suggestion {
                            surface: res.surface.clone(),
                            line: res.line,
                            candidate: cand.clone(),
                        });
                    }
                }
            }
            out.sort_by(|a, b| {
                b.candidate
                    .breakdown
                    .total
                    .partial_cmp(&a.candidate.breakdown.total)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            out.truncate(limit);
            Ok(OpOutput::Suggestions(out))
        })
    }

    fn get_vault_stats(&self) -> Result<OpOutput> {
        let last_snapshot = self.service.with_store(|store| store.latest_metrics())?;
        let stats = self.service.with_index(|idx| VaultStats {
            state: self.service.state(),
            note_count: idx.note_count(),
            tag_count: idx.tag_count(),
            link_count: idx.link_count(),
            orphan_count: find_orphans(idx, OrphanDirection::Incoming).len(),
            entity_count: idx.entities().count(),
            index_age_secs: self.service.index_age().map(|d| d.as_secs()),
            last_snapshot,
        });
        Ok(OpOutput::Stats(Box::new(stats)))
    }

    fn get_recent_notes(&self, limit: usize) -> Result<OpOutput> {
        let now = SystemTime::now();
        self.service.with_index(|idx| {
            let mut notes: Vec<RecentNote> = idx
                .all_notes()
                .map(|n| RecentNote {
                    path: n.path.clone(),
                    title: n.title.clone(),
                    modified_secs_ago: now
                        .duration_since(n.mtime)
                        .map(|d| d.as_secs())
                        .unwrap_or(0),
                })
                .collect();
            notes.sort_by(|a, b| {
                a.modified_secs_ago
                    .cmp(&b.modified_secs_ago)
                    .then_with(|| a.path.cmp(&b.path))
            });
            notes.truncate(limit);
            Ok(OpOutput::Recent(notes))
        })
    }

    /// Human-readable projection next to the store; regenerated at will,
    /// never read back.
    fn export_entities(&self) -> Result<OpOutput> {
        #[derive(serde::Serialize)]
        struct Projected<'a> {
            name: &'a str,
            path: &'a VaultPath,
            aliases: Vec<&'a str>,
            category: Option<&'a str>,
        }

        let json = self.service.with_index(|idx| {
            let mut entities: Vec<&crate::Entity> = idx.entities().collect();
            entities.sort_by_key(|e| e.order);
            let projected: Vec<Projected<'_>> = entities
                .iter()
                .map(|e| Projected {
                    name: &e.name,
                    path: &e.path,
                    aliases: e.aliases.iter().map(String::as_str).collect(),
                    category: e.category.as_deref(),
                })
                .collect();
            serde_json::to_string_pretty(&projected)
                .map(|j| (j, projected.len()))
                .map_err(|e| Error::StoreCorrupt(e.to_string()))
        })?;

        let dir = self.service.vault().state_dir();
        std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        let target = dir.join("entities.json");
        crate::mutate::atomic_write(&target, json.0.as_bytes())?;
        Ok(OpOutput::Exported {
            path: target.display().to_string(),
            entities: json.1,
        })
    }
}

fn yaml_type_name(v: &serde_yaml::Value) -> &'static str {
    match v {
        serde_yaml::Value::Null => "null",
        serde_yaml::Value::Bool(_) => "bool",
        serde_yaml::Value::Number(_) => "number",
        serde_yaml::Value::String(_) => "string",
        serde_yaml::Value::Sequence(_) => "list",
        serde_yaml::Value::Mapping(_) => "mapping",
        serde_yaml::Value::Tagged(_) => "tagged",
    }
}
