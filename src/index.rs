use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::LazyLock;
use std::time::SystemTime;

use rayon::prelude::*;
use regex::Regex;

use crate::parse::{parse_note, ParsedNote};
use crate::scanner::{scan_vault, ScanEntry};
use crate::vault::normalize_link_key;
use crate::{Backlink, CancelToken, Error, Outlink, Result, Vault, VaultPath};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskStatus {
    Todo,
    Done,
    InProgress,
    Cancelled,
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// 1-based line number in the file.
    pub line: u32,
    pub status: TaskStatus,
    pub text: String,
}

/// A heading-delimited span of the note body. Offsets are byte positions
/// into the file content; `start` is the heading line itself, `body_start`
/// the first byte after it, `end` the start of the next heading of equal or
/// shallower level (or EOF).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub heading: String,
    pub level: u8,
    pub heading_line: u32,
    /// First line after the section (exclusive).
    pub end_line: u32,
    pub start: usize,
    pub body_start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    pub path: VaultPath,
    pub title: String,
    pub mtime: SystemTime,
    pub frontmatter: BTreeMap<String, serde_yaml::Value>,
    pub aliases: Vec<String>,
    pub tags: Vec<String>,
    pub outlinks: Vec<Outlink>,
    pub sections: Vec<Section>,
    pub tasks: Vec<Task>,
    pub warnings: Vec<String>,
}

/// A resolvable name derived from a note: its filename stem plus declared
/// aliases. Every note has an entity record; only valid names claim
/// resolvable surfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub name: String,
    pub path: VaultPath,
    pub aliases: BTreeSet<String>,
    pub category: Option<String>,
    /// Stable tie-break between equally ranked entities.
    pub order: u64,
    /// Lowercased surfaces this entity currently claims.
    pub(crate) surfaces: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SurfaceClaim {
    path: VaultPath,
    by_stem: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TagEntry {
    display: String,
    paths: BTreeSet<VaultPath>,
}

/// Names that must never become entities, however a file is named.
pub(crate) const STOP_ENTITIES: &[&str] = &[
    "a", "an", "the", "i", "me", "my", "we", "us", "it", "ok", "okay", "yes", "no", "not",
    "and", "or", "if", "so", "to", "do", "in", "on", "at", "of", "for", "is", "am", "are",
    "was", "be", "as", "by", "up", "out", "all", "any", "new", "old", "now", "then", "etc",
    "eg", "ie", "vs", "via", "per", "re", "todo", "done", "wip", "tbd", "misc", "index",
    "inbox", "daily", "notes", "note", "untitled",
];

pub(crate) fn is_stop_entity(name: &str) -> bool {
    let lower = name.to_lowercase();
    STOP_ENTITIES.iter().any(|s| *s == lower)
}

static DATE_LIKE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-(?:\d{2}-\d{2}|[Ww]\d{1,2})$").unwrap()
});

pub(crate) fn is_date_like(name: &str) -> bool {
    DATE_LIKE.is_match(name.trim())
}

/// Stop words, one-character names, and date-patterned names never become
/// resolvable entity surfaces.
pub(crate) fn is_valid_entity_name(name: &str) -> bool {
    let name = name.trim();
    name.chars().count() >= 2 && !is_stop_entity(name) && !is_date_like(name)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VaultIndex {
    notes: HashMap<VaultPath, Note>,
    entities: HashMap<VaultPath, Entity>,
    surfaces: HashMap<String, SurfaceClaim>,
    /// Inbound references filed under the raw normalised target key.
    backlinks: HashMap<String, Vec<Backlink>>,
    /// Target keys each source currently contributes to, for cheap purge.
    outgoing_keys: HashMap<VaultPath, Vec<String>>,
    tags: HashMap<String, TagEntry>,
    insertion_counter: u64,
}

impl VaultIndex {
    /// Cold build: scan, parse in parallel, fold serially in path order.
    pub fn build(vault: &Vault, cancel: &CancelToken) -> Result<Self> {
        Self::build_with_progress(vault, cancel, None)
    }

    pub fn build_with_progress(
        vault: &Vault,
        cancel: &CancelToken,
        progress: Option<&mut dyn FnMut(usize)>,
    ) -> Result<Self> {
        let entries = scan_vault(vault, cancel, progress)?;

        let parsed: Vec<(ScanEntry, ParsedNote)> = entries
            .into_par_iter()
            .filter_map(|entry| {
                if cancel.is_cancelled() {
                    return None;
                }
                let bytes = match std::fs::read(&entry.abs) {
                    Ok(b) => b,
                    Err(err) => {
                        tracing::warn!(path = %entry.rel, error = %err, "skipping unreadable note");
                        return None;
                    }
                };
                let note = parse_note(&entry.rel, &bytes);
                Some((entry, note))
            })
            .collect();
        cancel.check()?;

        let mut idx = Self::default();
        for (entry, parsed) in parsed {
            idx.insert_parsed(entry.rel, entry.mtime, parsed);
        }
        Ok(idx)
    }

    /// Parse bytes and insert/replace the note, maintaining every derived
    /// structure. Returns the stored note.
    pub fn upsert(&mut self, path: VaultPath, bytes: &[u8], mtime: SystemTime) -> &Note {
        let parsed = parse_note(&path, bytes);
        self.insert_parsed(path.clone(), mtime, parsed);
        &self.notes[&path]
    }

    /// Read the file from disk and upsert it.
    pub fn upsert_file(&mut self, vault: &Vault, rel: VaultPath) -> Result<&Note> {
        let abs = vault.to_abs(&rel);
        let meta = std::fs::metadata(&abs).map_err(|e| Error::io(&abs, e))?;
        if !meta.is_file() {
            return Err(Error::InvalidVaultPath(format!("not a file: {rel}")));
        }
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let bytes = std::fs::read(&abs).map_err(|e| Error::io(&abs, e))?;
        Ok(self.upsert(rel, &bytes, mtime))
    }

    pub fn remove(&mut self, path: &VaultPath) -> bool {
        self.purge_derived(path);
        let existed = self.notes.remove(path).is_some();
        self.entities.remove(path);
        existed
    }

    fn insert_parsed(&mut self, path: VaultPath, mtime: SystemTime, parsed: ParsedNote) {
        // Re-inserts keep the original entity order so scoring tie-breaks
        // stay stable across watcher churn.
        let order = match self.entities.get(&path) {
            Some(e) => e.order,
            None => {
                let o = self.insertion_counter;
                self.insertion_counter += 1;
                o
            }
        };

        self.purge_derived(&path);

        let category = parsed
            .frontmatter
            .get("category")
            .or_else(|| parsed.frontmatter.get("type"))
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let mut entity = Entity {
            name: path.stem().to_string(),
            path: path.clone(),
            aliases: parsed.aliases.iter().cloned().collect(),
            category,
            order,
            surfaces: BTreeSet::new(),
        };

        // Path key first: canonical. A root-level file whose stem fails the
        // entity rules gets no key at all, so stop/date names stay
        // unresolvable even by path.
        let stem_key = entity.name.to_lowercase();
        let stem_valid = is_valid_entity_name(&entity.name);
        let path_key = path.link_key();
        if stem_valid || path_key != stem_key {
            self.claim_surface(&mut entity, path_key, true);
        }
        if stem_valid {
            self.claim_surface(&mut entity, stem_key, true);
        }
        let aliases: Vec<String> = entity.aliases.iter().cloned().collect();
        for alias in aliases {
            if is_valid_entity_name(&alias) {
                self.claim_surface(&mut entity, alias.to_lowercase(), false);
            }
        }
        self.entities.insert(path.clone(), entity);

        for tag in &parsed.tags {
            let entry = self
                .tags
                .entry(tag.to_lowercase())
                .or_insert_with(|| TagEntry {
                    display: tag.clone(),
                    paths: BTreeSet::new(),
                });
            entry.paths.insert(path.clone());
        }

        let mut keys = Vec::with_capacity(parsed.outlinks.len());
        for link in &parsed.outlinks {
            let key = link.target_key();
            self.backlinks.entry(key.clone()).or_default().push(Backlink {
                source: path.clone(),
                target_key: key.clone(),
                line: link.line,
            });
            keys.push(key);
        }
        keys.sort();
        keys.dedup();
        self.outgoing_keys.insert(path.clone(), keys);

        self.notes.insert(
            path.clone(),
            Note {
                path,
                title: parsed.title,
                mtime,
                frontmatter: parsed.frontmatter,
                aliases: parsed.aliases,
                tags: parsed.tags,
                outlinks: parsed.outlinks,
                sections: parsed.sections,
                tasks: parsed.tasks,
                warnings: parsed.warnings,
            },
        );
    }

    /// Stem and path claims are authoritative: they displace alias claims
    /// but never an earlier stem claim by another note. Alias claims only
    /// take unclaimed surfaces.
    fn claim_surface(&mut self, entity: &mut Entity, key: String, by_stem: bool) {
        match self.surfaces.get(&key) {
            None => {}
            Some(existing) if existing.path == entity.path => {}
            Some(existing) => {
                if !(by_stem && !existing.by_stem) {
                    return;
                }
                // Displacing an alias claim: unhook it from its owner.
                let old_path = existing.path.clone();
                if let Some(old) = self.entities.get_mut(&old_path) {
                    old.surfaces.remove(&key);
                }
            }
        }
        self.surfaces.insert(
            key.clone(),
            SurfaceClaim {
                path: entity.path.clone(),
                by_stem,
            },
        );
        entity.surfaces.insert(key);
    }

    fn purge_derived(&mut self, path: &VaultPath) {
        if let Some(entity) = self.entities.get(path) {
            for key in &entity.surfaces {
                if self.surfaces.get(key).is_some_and(|c| &c.path == path) {
                    self.surfaces.remove(key);
                }
            }
        }
        if let Some(entity) = self.entities.get_mut(path) {
            entity.surfaces.clear();
        }

        if let Some(old) = self.notes.get(path) {
            for tag in &old.tags {
                let key = tag.to_lowercase();
                if let Some(entry) = self.tags.get_mut(&key) {
                    entry.paths.remove(path);
                    if entry.paths.is_empty() {
                        self.tags.remove(&key);
                    }
                }
            }
        }

        if let Some(keys) = self.outgoing_keys.remove(path) {
            for key in keys {
                if let Some(list) = self.backlinks.get_mut(&key) {
                    list.retain(|b| &b.source != path);
                    if list.is_empty() {
                        self.backlinks.remove(&key);
                    }
                }
            }
        }
    }

    pub fn lookup(&self, path: &VaultPath) -> Option<&Note> {
        self.notes.get(path)
    }

    /// Resolve a free-text name or path to a note path.
    pub fn resolve(&self, name: &str) -> Option<&VaultPath> {
        self.surfaces.get(&normalize_link_key(name)).map(|c| &c.path)
    }

    pub fn entity(&self, path: &VaultPath) -> Option<&Entity> {
        self.entities.get(path)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Inbound references to a target name or path: the union of every
    /// bucket whose key resolves to the same note, plus the raw bucket.
    pub fn backlinks(&self, target: &str) -> Vec<Backlink> {
        let key = normalize_link_key(target);
        match self.surfaces.get(&key) {
            Some(claim) => self.backlinks_of(&claim.path.clone()),
            None => self.backlinks.get(&key).cloned().unwrap_or_default(),
        }
    }

    pub fn backlinks_of(&self, path: &VaultPath) -> Vec<Backlink> {
        let mut out = Vec::new();
        let mut seen_keys = BTreeSet::new();
        if let Some(entity) = self.entities.get(path) {
            for key in &entity.surfaces {
                if seen_keys.insert(key.clone()) {
                    if let Some(list) = self.backlinks.get(key) {
                        out.extend(list.iter().cloned());
                    }
                }
            }
        }
        let path_key = path.link_key();
        if seen_keys.insert(path_key.clone()) {
            if let Some(list) = self.backlinks.get(&path_key) {
                out.extend(list.iter().cloned());
            }
        }
        out.sort_by(|a, b| a.source.cmp(&b.source).then(a.line.cmp(&b.line)));
        out.dedup_by(|a, b| a.source == b.source && a.line == b.line);
        out
    }

    /// Backlink buckets whose key resolves to no note: broken links.
    pub fn broken_link_keys(&self) -> Vec<(&str, &[Backlink])> {
        let mut out: Vec<(&str, &[Backlink])> = self
            .backlinks
            .iter()
            .filter(|(key, _)| !self.surfaces.contains_key(*key))
            .map(|(key, list)| (key.as_str(), list.as_slice()))
            .collect();
        out.sort_by_key(|(key, _)| *key);
        out
    }

    pub fn tagged(&self, tag: &str) -> Vec<&VaultPath> {
        let key = tag.trim().trim_start_matches('#').to_lowercase();
        self.tags
            .get(&key)
            .map(|e| e.paths.iter().collect())
            .unwrap_or_default()
    }

    pub fn all_notes(&self) -> impl Iterator<Item = &Note> {
        self.notes.values()
    }

    pub fn all_paths(&self) -> impl Iterator<Item = &VaultPath> {
        self.notes.keys()
    }

    /// (display form, note count) for every tag.
    pub fn all_tags(&self) -> Vec<(&str, usize)> {
        let mut out: Vec<(&str, usize)> = self
            .tags
            .values()
            .map(|e| (e.display.as_str(), e.paths.len()))
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        out
    }

    pub fn note_count(&self) -> usize {
        self.notes.len()
    }

    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }

    pub fn link_count(&self) -> usize {
        self.backlinks.values().map(|v| v.len()).sum()
    }

    /// In-degree per note path, resolving each bucket key once.
    pub fn in_degrees(&self) -> HashMap<VaultPath, usize> {
        let mut out: HashMap<VaultPath, usize> = HashMap::new();
        for (key, list) in &self.backlinks {
            if let Some(claim) = self.surfaces.get(key) {
                *out.entry(claim.path.clone()).or_default() += list.len();
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_with(notes: &[(&str, &str)]) -> VaultIndex {
        let mut idx = VaultIndex::default();
        for (path, content) in notes {
            let path = VaultPath::try_from(*path).unwrap();
            idx.upsert(path, content.as_bytes(), SystemTime::UNIX_EPOCH);
        }
        idx
    }

    #[test]
    fn stem_and_alias_resolve_to_path() {
        let idx = index_with(&[(
            "people/Sarah Mitchell.md",
            "---\naliases: [Sarah]\n---\nhi\n",
        )]);
        let p = VaultPath::try_from("people/Sarah Mitchell.md").unwrap();
        assert_eq!(idx.resolve("sarah mitchell"), Some(&p));
        assert_eq!(idx.resolve("Sarah"), Some(&p));
        assert_eq!(idx.resolve("people/Sarah Mitchell.md"), Some(&p));
        assert_eq!(idx.resolve("nobody"), None);
    }

    #[test]
    fn stem_claim_displaces_alias_claim_but_not_stem() {
        let idx = index_with(&[
            ("a/First.md", "---\naliases: [Shared]\n---\n"),
            ("b/Shared.md", "x\n"),
            ("c/Shared.md", "x\n"),
        ]);
        // Stem claim from b/Shared.md displaces the alias; the later stem
        // claim from c/Shared.md does not displace b's.
        let b = VaultPath::try_from("b/Shared.md").unwrap();
        assert_eq!(idx.resolve("shared"), Some(&b));
    }

    #[test]
    fn stop_and_date_names_are_never_entity_keys() {
        let idx = index_with(&[
            ("Me.md", "x\n"),
            ("2025-01-01.md", "x\n"),
            ("2025-W17.md", "x\n"),
            ("x.md", "x\n"),
        ]);
        assert_eq!(idx.resolve("me"), None);
        assert_eq!(idx.resolve("2025-01-01"), None);
        assert_eq!(idx.resolve("2025-W17"), None);
        assert_eq!(idx.resolve("x"), None);
        // Entity records still exist for every note.
        assert_eq!(idx.entities().count(), 4);
    }

    #[test]
    fn backlinks_follow_outlink_changes() {
        let mut idx = index_with(&[
            ("notes/B.md", "x\n"),
            ("notes/A.md", "see [[B]]\n"),
        ]);
        let b = VaultPath::try_from("notes/B.md").unwrap();
        let a = VaultPath::try_from("notes/A.md").unwrap();

        let links = idx.backlinks_of(&b);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].source, a);
        assert_eq!(links[0].line, 1);

        idx.upsert(a.clone(), b"no links\n", SystemTime::UNIX_EPOCH);
        assert!(idx.backlinks_of(&b).is_empty());
    }

    #[test]
    fn removed_note_keeps_inbound_buckets_as_broken() {
        let mut idx = index_with(&[
            ("B.md", "x\n"),
            ("A.md", "see [[B]]\n"),
        ]);
        let b = VaultPath::try_from("B.md").unwrap();
        assert!(idx.remove(&b));
        assert_eq!(idx.resolve("B"), None);
        let broken = idx.broken_link_keys();
        assert_eq!(broken.len(), 1);
        assert_eq!(broken[0].0, "b");
        assert_eq!(broken[0].1.len(), 1);
    }

    #[test]
    fn backlinks_by_target_name_and_by_path_agree() {
        let idx = index_with(&[
            ("clients/Acme Corp.md", "x\n"),
            ("notes/A.md", "met [[Acme Corp]] today\n"),
        ]);
        let by_name = idx.backlinks("Acme Corp");
        let by_path = idx.backlinks("clients/Acme Corp.md");
        assert_eq!(by_name, by_path);
        assert_eq!(by_name.len(), 1);
    }

    #[test]
    fn remove_purges_tags_and_surfaces() {
        let mut idx = index_with(&[("a.md", "#solo\n[[b]]\n"), ("b.md", "x\n")]);
        let a = VaultPath::try_from("a.md").unwrap();
        assert!(idx.remove(&a));
        assert!(idx.tagged("solo").is_empty());
        assert_eq!(idx.resolve("a"), None);
        let b = VaultPath::try_from("b.md").unwrap();
        assert!(idx.backlinks_of(&b).is_empty());
    }

    #[test]
    fn tags_are_case_folded_on_lookup() {
        let idx = index_with(&[("a.md", "#Project\n"), ("b.md", "#project\n")]);
        assert_eq!(idx.tagged("PROJECT").len(), 2);
        assert_eq!(idx.all_tags(), vec![("Project", 2)]);
    }

    #[test]
    fn rebuild_preserves_entity_order_on_upsert() {
        let mut idx = index_with(&[("A.md", "x\n"), ("B.md", "x\n")]);
        let a = VaultPath::try_from("A.md").unwrap();
        let before = idx.entity(&a).unwrap().order;
        idx.upsert(a.clone(), b"changed\n", SystemTime::UNIX_EPOCH);
        assert_eq!(idx.entity(&a).unwrap().order, before);
    }

    #[test]
    fn cold_build_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        std::fs::create_dir_all(root.join("n")).unwrap();
        std::fs::write(root.join("n/A.md"), "[[B]] #tag\n").unwrap();
        std::fs::write(root.join("n/B.md"), "---\naliases: [Bee]\n---\n").unwrap();

        let vault = Vault::open(root).unwrap();
        let one = VaultIndex::build(&vault, &CancelToken::new()).unwrap();
        let two = VaultIndex::build(&vault, &CancelToken::new()).unwrap();
        assert_eq!(one, two);
        assert_eq!(one.note_count(), 2);
    }
}
