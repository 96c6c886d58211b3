use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};

use crate::{Entity, Error, Result, Vault, VaultPath};

/// Verdict attached to a wikilink application or feedback row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackVerdict {
    Correct,
    Incorrect,
}

impl FeedbackVerdict {
    fn as_str(self) -> &'static str {
        match self {
            Self::Correct => "correct",
            Self::Incorrect => "incorrect",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "correct" => Some(Self::Correct),
            "incorrect" => Some(Self::Incorrect),
            _ => None,
        }
    }
}

/// One auto-link rewrite performed on write, awaiting a verdict.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ApplicationRecord {
    pub id: i64,
    pub source_path: String,
    pub target_entity: String,
    pub span_text: String,
    pub context_key: String,
    pub applied_at: i64,
    pub verdict: Option<FeedbackVerdict>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FeedbackRow {
    pub target_entity: String,
    pub context_key: String,
    pub correct: u32,
    pub incorrect: u32,
}

impl FeedbackRow {
    /// `None` until the sample is large enough to trust.
    pub fn accuracy(&self, min_sample: u32) -> Option<f64> {
        let total = self.correct + self.incorrect;
        if total < min_sample {
            return None;
        }
        Some(f64::from(self.correct) / f64::from(total))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub captured_at: i64,
    pub note_count: usize,
    pub tag_count: usize,
    pub link_count: usize,
    pub orphan_count: usize,
    pub index_age_secs: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FtsHit {
    pub path: String,
    pub title: String,
    pub snippet: String,
    /// Higher is better (negated bm25 rank).
    pub score: f64,
}

/// Forward-only migration sequence; the compiled version is the length of
/// this table. Each entry runs exactly once, in order, inside one
/// transaction on open.
const MIGRATIONS: &[&str] = &[
    // v1: full-text index and the wikilink learning tables.
    "CREATE VIRTUAL TABLE notes_fts USING fts5(
       path UNINDEXED,
       title,
       body,
       tokenize = 'porter'
     );
     CREATE TABLE wikilink_applications(
       id INTEGER PRIMARY KEY AUTOINCREMENT,
       source_path TEXT NOT NULL,
       target_entity TEXT NOT NULL,
       span_text TEXT NOT NULL,
       context_key TEXT NOT NULL,
       applied_at INTEGER NOT NULL,
       verdict TEXT
     );
     CREATE INDEX idx_applications_source ON wikilink_applications(source_path);
     CREATE TABLE wikilink_feedback(
       target_entity TEXT NOT NULL,
       context_key TEXT NOT NULL,
       correct INTEGER NOT NULL DEFAULT 0,
       incorrect INTEGER NOT NULL DEFAULT 0,
       PRIMARY KEY(target_entity, context_key)
     );
     CREATE TABLE wikilink_suppressions(
       target_entity TEXT NOT NULL,
       context_key TEXT NOT NULL,
       created_at INTEGER NOT NULL,
       PRIMARY KEY(target_entity, context_key)
     );",
    // v2: growth snapshots.
    "CREATE TABLE vault_metrics(
       id INTEGER PRIMARY KEY AUTOINCREMENT,
       captured_at INTEGER NOT NULL,
       note_count INTEGER NOT NULL,
       tag_count INTEGER NOT NULL,
       link_count INTEGER NOT NULL,
       orphan_count INTEGER NOT NULL,
       index_age_secs INTEGER NOT NULL
     );",
    // v3: materialised entity list, authoritative across restarts.
    "CREATE TABLE entities(
       path TEXT PRIMARY KEY,
       name TEXT NOT NULL,
       category TEXT,
       aliases_json TEXT NOT NULL,
       insertion_order INTEGER NOT NULL
     );",
];

#[derive(Debug)]
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    pub const DB_FILE: &'static str = "state.db";

    pub fn open_default(vault: &Vault) -> Result<Self> {
        Self::open_path(vault.state_dir().join(Self::DB_FILE))
    }

    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let mut this = Self { conn };
        this.migrate()?;
        Ok(this)
    }

    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut this = Self { conn };
        this.migrate()?;
        Ok(this)
    }

    pub fn default_db_path(vault: &Vault) -> PathBuf {
        vault.state_dir().join(Self::DB_FILE)
    }

    fn migrate(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version(version INTEGER NOT NULL);",
        )?;
        let file_version: i64 = self
            .conn
            .query_row("SELECT version FROM schema_version", [], |r| r.get(0))
            .optional()?
            .unwrap_or(0);
        let code_version = MIGRATIONS.len() as i64;

        if file_version > code_version {
            return Err(Error::StoreDowngrade {
                file: file_version,
                supported: code_version,
            });
        }
        if file_version == code_version {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        for (ix, sql) in MIGRATIONS.iter().enumerate() {
            let version = ix as i64 + 1;
            if version <= file_version {
                continue;
            }
            tx.execute_batch(sql)?;
            tracing::debug!(version, "state store migrated");
        }
        tx.execute("DELETE FROM schema_version", [])?;
        tx.execute(
            "INSERT INTO schema_version(version) VALUES(?1)",
            params![code_version],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn version(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT version FROM schema_version", [], |r| r.get(0))?)
    }

    /// Quick integrity probe; failure means the engine must refuse writes
    /// and rebuild cold.
    pub fn integrity_check(&self) -> Result<()> {
        let verdict: String =
            self.conn
                .query_row("PRAGMA integrity_check(1)", [], |r| r.get(0))?;
        if verdict == "ok" {
            Ok(())
        } else {
            Err(Error::StoreCorrupt(verdict))
        }
    }

    // ---- full-text index ----

    pub fn upsert_note_text(&mut self, path: &VaultPath, title: &str, body: &str) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM notes_fts WHERE path=?1",
            params![path.as_str()],
        )?;
        tx.execute(
            "INSERT INTO notes_fts(path,title,body) VALUES(?1,?2,?3)",
            params![path.as_str(), title, body],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn remove_note(&mut self, path: &VaultPath) -> Result<()> {
        self.conn.execute(
            "DELETE FROM notes_fts WHERE path=?1",
            params![path.as_str()],
        )?;
        Ok(())
    }

    pub fn rename_note(&mut self, old: &VaultPath, new: &VaultPath) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE notes_fts SET path=?2 WHERE path=?1",
            params![old.as_str(), new.as_str()],
        )?;
        tx.execute(
            "UPDATE wikilink_applications SET source_path=?2 WHERE source_path=?1",
            params![old.as_str(), new.as_str()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// BM25-ranked content search. Tokens shorter than three characters are
    /// dropped; quoted phrases and trailing-`*` prefixes pass through.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<FtsHit>> {
        let Some(fts_query) = build_fts_query(query) else {
            return Ok(Vec::new());
        };
        let mut stmt = self.conn.prepare(
            "SELECT path, title, snippet(notes_fts, 2, '[', ']', '…', 12), bm25(notes_fts)
             FROM notes_fts WHERE notes_fts MATCH ?1
             ORDER BY bm25(notes_fts) LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![fts_query, limit as i64], |r| {
            Ok(FtsHit {
                path: r.get(0)?,
                title: r.get(1)?,
                snippet: r.get(2)?,
                score: -r.get::<_, f64>(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ---- wikilink applications ----

    pub fn record_application(
        &mut self,
        source: &VaultPath,
        target_entity: &str,
        span_text: &str,
        context_key: &str,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO wikilink_applications(source_path,target_entity,span_text,context_key,applied_at)
             VALUES(?1,?2,?3,?4,?5)",
            params![
                source.as_str(),
                target_entity,
                span_text,
                context_key,
                unix_now()
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Applications for a source that have not yet received a verdict.
    pub fn open_applications(&self, source: &VaultPath) -> Result<Vec<ApplicationRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id,source_path,target_entity,span_text,context_key,applied_at,verdict
             FROM wikilink_applications WHERE source_path=?1 AND verdict IS NULL
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![source.as_str()], row_to_application)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn set_application_verdict(&mut self, id: i64, verdict: FeedbackVerdict) -> Result<()> {
        self.conn.execute(
            "UPDATE wikilink_applications SET verdict=?2 WHERE id=?1",
            params![id, verdict.as_str()],
        )?;
        Ok(())
    }

    // ---- feedback & suppressions ----

    pub fn add_feedback(
        &mut self,
        target_entity: &str,
        context_key: &str,
        verdict: FeedbackVerdict,
    ) -> Result<FeedbackRow> {
        let (dc, di) = match verdict {
            FeedbackVerdict::Correct => (1, 0),
            FeedbackVerdict::Incorrect => (0, 1),
        };
        self.conn.execute(
            "INSERT INTO wikilink_feedback(target_entity,context_key,correct,incorrect)
             VALUES(?1,?2,?3,?4)
             ON CONFLICT(target_entity,context_key)
             DO UPDATE SET correct=correct+?3, incorrect=incorrect+?4",
            params![target_entity, context_key, dc, di],
        )?;
        self.feedback(target_entity, context_key)
            .map(|r| r.unwrap_or(FeedbackRow {
                target_entity: target_entity.to_string(),
                context_key: context_key.to_string(),
                correct: dc as u32,
                incorrect: di as u32,
            }))
    }

    pub fn feedback(
        &self,
        target_entity: &str,
        context_key: &str,
    ) -> Result<Option<FeedbackRow>> {
        Ok(self
            .conn
            .query_row(
                "SELECT target_entity,context_key,correct,incorrect
                 FROM wikilink_feedback WHERE target_entity=?1 AND context_key=?2",
                params![target_entity, context_key],
                row_to_feedback,
            )
            .optional()?)
    }

    /// All rows for an entity, every context.
    pub fn feedback_for_entity(&self, target_entity: &str) -> Result<Vec<FeedbackRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT target_entity,context_key,correct,incorrect
             FROM wikilink_feedback WHERE target_entity=?1 ORDER BY context_key",
        )?;
        let rows = stmt.query_map(params![target_entity], row_to_feedback)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn all_feedback(&self) -> Result<Vec<FeedbackRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT target_entity,context_key,correct,incorrect FROM wikilink_feedback",
        )?;
        let rows = stmt.query_map([], row_to_feedback)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn list_feedback(&self, limit: usize) -> Result<Vec<FeedbackRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT target_entity,context_key,correct,incorrect
             FROM wikilink_feedback
             ORDER BY correct+incorrect DESC, target_entity LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_feedback)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn add_suppression(&mut self, target_entity: &str, context_key: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO wikilink_suppressions(target_entity,context_key,created_at)
             VALUES(?1,?2,?3)",
            params![target_entity, context_key, unix_now()],
        )?;
        Ok(())
    }

    pub fn clear_suppression(&mut self, target_entity: &str, context_key: &str) -> Result<bool> {
        let n = self.conn.execute(
            "DELETE FROM wikilink_suppressions WHERE target_entity=?1 AND context_key=?2",
            params![target_entity, context_key],
        )?;
        Ok(n > 0)
    }

    /// True when (entity, folder) or (entity, "*") is suppressed.
    pub fn is_suppressed(&self, target_entity: &str, folder: &str) -> Result<bool> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(1) FROM wikilink_suppressions
             WHERE target_entity=?1 AND context_key IN (?2, '*')",
            params![target_entity, folder],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    pub fn suppressions(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT target_entity, context_key FROM wikilink_suppressions
             ORDER BY target_entity, context_key",
        )?;
        let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ---- metrics ----

    pub fn record_metrics(&mut self, snap: &MetricsSnapshot) -> Result<()> {
        self.conn.execute(
            "INSERT INTO vault_metrics(captured_at,note_count,tag_count,link_count,orphan_count,index_age_secs)
             VALUES(?1,?2,?3,?4,?5,?6)",
            params![
                snap.captured_at,
                snap.note_count as i64,
                snap.tag_count as i64,
                snap.link_count as i64,
                snap.orphan_count as i64,
                snap.index_age_secs
            ],
        )?;
        Ok(())
    }

    pub fn latest_metrics(&self) -> Result<Option<MetricsSnapshot>> {
        Ok(self
            .conn
            .query_row(
                "SELECT captured_at,note_count,tag_count,link_count,orphan_count,index_age_secs
                 FROM vault_metrics ORDER BY id DESC LIMIT 1",
                [],
                |r| {
                    Ok(MetricsSnapshot {
                        captured_at: r.get(0)?,
                        note_count: r.get::<_, i64>(1)? as usize,
                        tag_count: r.get::<_, i64>(2)? as usize,
                        link_count: r.get::<_, i64>(3)? as usize,
                        orphan_count: r.get::<_, i64>(4)? as usize,
                        index_age_secs: r.get(5)?,
                    })
                },
            )
            .optional()?)
    }

    // ---- entity materialisation ----

    pub fn replace_entities<'a>(
        &mut self,
        entities: impl Iterator<Item = &'a Entity>,
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM entities", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO entities(path,name,category,aliases_json,insertion_order)
                 VALUES(?1,?2,?3,?4,?5)",
            )?;
            for e in entities {
                let aliases_json = serde_json::to_string(&e.aliases)
                    .map_err(|err| Error::StoreCorrupt(err.to_string()))?;
                stmt.execute(params![
                    e.path.as_str(),
                    e.name,
                    e.category,
                    aliases_json,
                    e.order as i64
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn entity_count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(1) FROM entities", [], |r| r.get(0))?;
        Ok(n as usize)
    }
}

fn row_to_application(r: &rusqlite::Row<'_>) -> rusqlite::Result<ApplicationRecord> {
    Ok(ApplicationRecord {
        id: r.get(0)?,
        source_path: r.get(1)?,
        target_entity: r.get(2)?,
        span_text: r.get(3)?,
        context_key: r.get(4)?,
        applied_at: r.get(5)?,
        verdict: r
            .get::<_, Option<String>>(6)?
            .as_deref()
            .and_then(FeedbackVerdict::parse),
    })
}

fn row_to_feedback(r: &rusqlite::Row<'_>) -> rusqlite::Result<FeedbackRow> {
    Ok(FeedbackRow {
        target_entity: r.get(0)?,
        context_key: r.get(1)?,
        correct: r.get::<_, i64>(2)? as u32,
        incorrect: r.get::<_, i64>(3)? as u32,
    })
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Sanitise a user query into FTS5 MATCH syntax. Bare tokens shorter than
/// three characters are dropped; `"quoted phrases"` and `prefix*` forms are
/// preserved.
fn build_fts_query(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let mut parts: Vec<String> = Vec::new();
    let mut rest = raw;
    while !rest.is_empty() {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        if let Some(stripped) = rest.strip_prefix('"') {
            match stripped.find('"') {
                Some(end) => {
                    let phrase = &stripped[..end];
                    if !phrase.trim().is_empty() {
                        parts.push(format!("\"{}\"", phrase.replace('"', "")));
                    }
                    rest = &stripped[end + 1..];
                    continue;
                }
                None => rest = stripped,
            }
        }
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let token = &rest[..end];
        rest = &rest[end..];

        let prefix = token.ends_with('*');
        let word: String = token
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        if word.chars().count() < 3 {
            continue;
        }
        if prefix {
            parts.push(format!("\"{word}\"*"));
        } else {
            parts.push(format!("\"{word}\""));
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> VaultPath {
        VaultPath::try_from(s).unwrap()
    }

    #[test]
    fn migrations_run_once_and_version_sticks() {
        let temp = tempfile::tempdir().unwrap();
        let db = temp.path().join("state.db");
        {
            let store = StateStore::open_path(&db).unwrap();
            assert_eq!(store.version().unwrap(), MIGRATIONS.len() as i64);
        }
        // Re-open: no-op migration.
        let store = StateStore::open_path(&db).unwrap();
        assert_eq!(store.version().unwrap(), MIGRATIONS.len() as i64);
        store.integrity_check().unwrap();
    }

    #[test]
    fn downgrade_is_refused() {
        let temp = tempfile::tempdir().unwrap();
        let db = temp.path().join("state.db");
        drop(StateStore::open_path(&db).unwrap());

        let conn = Connection::open(&db).unwrap();
        conn.execute("UPDATE schema_version SET version = 99", [])
            .unwrap();
        drop(conn);

        match StateStore::open_path(&db) {
            Err(Error::StoreDowngrade { file: 99, .. }) => {}
            other => panic!("expected downgrade refusal, got {other:?}"),
        }
    }

    #[test]
    fn fts_search_ranks_and_snippets() {
        let mut store = StateStore::open_memory().unwrap();
        store
            .upsert_note_text(
                &path("a.md"),
                "Migration plan",
                "We planned the data migration for the quarter.",
            )
            .unwrap();
        store
            .upsert_note_text(&path("b.md"), "Groceries", "milk eggs bread")
            .unwrap();

        let hits = store.search("migration", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "a.md");
        assert!(hits[0].snippet.contains('['));

        // Porter stemming: "migrations" matches "migration".
        assert_eq!(store.search("migrations", 10).unwrap().len(), 1);
        // Tokens under three characters are dropped.
        assert!(store.search("we of", 10).unwrap().is_empty());
    }

    #[test]
    fn feedback_accumulates_and_reports_accuracy() {
        let mut store = StateStore::open_memory().unwrap();
        for _ in 0..4 {
            store
                .add_feedback("Acme Corp", "daily-notes", FeedbackVerdict::Correct)
                .unwrap();
        }
        let row = store
            .add_feedback("Acme Corp", "daily-notes", FeedbackVerdict::Incorrect)
            .unwrap();
        assert_eq!(row.correct, 4);
        assert_eq!(row.incorrect, 1);
        assert_eq!(row.accuracy(5), Some(0.8));
        assert_eq!(row.accuracy(6), None);
    }

    #[test]
    fn suppression_matches_folder_and_wildcard() {
        let mut store = StateStore::open_memory().unwrap();
        store.add_suppression("Acme", "daily-notes").unwrap();
        assert!(store.is_suppressed("Acme", "daily-notes").unwrap());
        assert!(!store.is_suppressed("Acme", "projects").unwrap());

        store.add_suppression("Beta", "*").unwrap();
        assert!(store.is_suppressed("Beta", "anything").unwrap());

        assert!(store.clear_suppression("Acme", "daily-notes").unwrap());
        assert!(!store.is_suppressed("Acme", "daily-notes").unwrap());
    }

    #[test]
    fn applications_round_trip_with_verdicts() {
        let mut store = StateStore::open_memory().unwrap();
        let src = path("daily-notes/2026-01-03.md");
        let id = store
            .record_application(&src, "Sarah Mitchell", "Sarah", "daily-notes")
            .unwrap();
        let open = store.open_applications(&src).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].target_entity, "Sarah Mitchell");

        store
            .set_application_verdict(id, FeedbackVerdict::Incorrect)
            .unwrap();
        assert!(store.open_applications(&src).unwrap().is_empty());
    }

    #[test]
    fn rename_moves_fts_and_applications() {
        let mut store = StateStore::open_memory().unwrap();
        let old = path("a/Old.md");
        let new = path("a/New.md");
        store.upsert_note_text(&old, "Old", "searchable body").unwrap();
        store
            .record_application(&old, "Entity", "span", "a")
            .unwrap();
        store.rename_note(&old, &new).unwrap();

        let hits = store.search("searchable", 10).unwrap();
        assert_eq!(hits[0].path, "a/New.md");
        assert_eq!(store.open_applications(&new).unwrap().len(), 1);
        assert!(store.open_applications(&old).unwrap().is_empty());
    }

    #[test]
    fn fts_query_builder_handles_phrases_and_prefixes() {
        assert_eq!(build_fts_query("  "), None);
        assert_eq!(build_fts_query("ab"), None);
        assert_eq!(
            build_fts_query("data migration"),
            Some("\"data\" \"migration\"".to_string())
        );
        assert_eq!(
            build_fts_query("\"acme corp\" plan*"),
            Some("\"acme corp\" \"plan\"*".to_string())
        );
    }
}
