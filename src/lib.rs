mod cancel;
mod config;
mod error;
mod feedback;
mod graph;
mod index;
mod links;
mod mutate;
mod ops;
mod parse;
mod resolver;
mod scanner;
mod service;
mod store;
mod vault;

pub use crate::cancel::CancelToken;
pub use crate::config::{CooccurrenceWindow, VaultConfig};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::feedback::{FeedbackEngine, FeedbackSnapshot, VerdictOutcome};
pub use crate::graph::{find_hubs, find_orphans, shortest_path, HubNote, OrphanDirection};
pub use crate::index::{Entity, Note, Section, Task, TaskStatus, VaultIndex};
pub use crate::links::{Backlink, Outlink};
pub use crate::mutate::{
    DeleteOutcome, EditOutcome, InsertPosition, MutationEngine, PolicyReport, PolicyStep,
    RenameReport, StepOutcome, WriteFormat,
};
pub use crate::ops::{
    CostClass, FieldSchema, NoteMetadata, OpCategory, OpDispatcher, OpOutput, OpPreset,
    Operation, OutlinkInfo, RecentNote, SearchHit, SearchScope, SectionInfo, Suggestion,
    VaultStats,
};
pub use crate::resolver::{
    apply_autolinks, resolve_spans, score_candidate, AppliedLink, CooccurrenceCounts,
    EntityResolver, ScoreBreakdown, ScoreContext, ScoredCandidate, SpanMatch, SpanResolution,
};
pub use crate::scanner::{scan_vault, ScanEntry};
pub use crate::service::{IndexState, VaultEvent, VaultService, WatchMode};
pub use crate::store::{
    ApplicationRecord, FeedbackRow, FeedbackVerdict, FtsHit, MetricsSnapshot, StateStore,
};
pub use crate::vault::{Vault, VaultPath};
