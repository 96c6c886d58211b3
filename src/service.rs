use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

use crate::scanner::scan_vault;
use crate::store::{MetricsSnapshot, StateStore};
use crate::{
    CancelToken, Error, ErrorKind, OrphanDirection, Result, Vault, VaultConfig, VaultIndex,
    VaultPath,
};

/// Readiness marker gating the query surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    Starting,
    Ready,
    Rebuilding,
    /// Serving from the last consistent snapshot; writes are refused.
    Dirty,
    Error,
}

impl std::fmt::Display for IndexState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Rebuilding => "rebuilding",
            Self::Dirty => "dirty",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchMode {
    Native,
    Polling,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultEvent {
    Indexed { path: VaultPath },
    Removed { path: VaultPath },
    StateChanged { state: IndexState },
    WatchModeChanged { mode: WatchMode },
    Error { path: Option<VaultPath>, error: String },
}

/// Raw per-path event after notify/polling normalisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PathEventKind {
    Add,
    Change,
    Unlink,
}

/// Net effect of the events seen for one path inside a debounce window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CoalescedOp {
    Upsert { from_add: bool },
    Delete,
}

/// Fold one more raw event into the pending op for a path. `None` means
/// the path nets out to nothing and is dropped.
pub(crate) fn coalesce(prev: Option<CoalescedOp>, ev: PathEventKind) -> Option<CoalescedOp> {
    match (prev, ev) {
        (None, PathEventKind::Add) => Some(CoalescedOp::Upsert { from_add: true }),
        (None, PathEventKind::Change) => Some(CoalescedOp::Upsert { from_add: false }),
        (None, PathEventKind::Unlink) => Some(CoalescedOp::Delete),
        (Some(CoalescedOp::Upsert { from_add }), PathEventKind::Add)
        | (Some(CoalescedOp::Upsert { from_add }), PathEventKind::Change) => {
            Some(CoalescedOp::Upsert { from_add })
        }
        (Some(CoalescedOp::Upsert { from_add: true }), PathEventKind::Unlink) => None,
        (Some(CoalescedOp::Upsert { from_add: false }), PathEventKind::Unlink) => {
            Some(CoalescedOp::Delete)
        }
        (Some(CoalescedOp::Delete), PathEventKind::Add)
        | (Some(CoalescedOp::Delete), PathEventKind::Change) => {
            Some(CoalescedOp::Upsert { from_add: false })
        }
        (Some(CoalescedOp::Delete), PathEventKind::Unlink) => Some(CoalescedOp::Delete),
    }
}

struct Pending {
    op: CoalescedOp,
    deadline: Instant,
}

/// Long-lived engine facade: owns the index, the state store, and the
/// watcher task. All components share it through `Arc` internals.
pub struct VaultService {
    vault: Vault,
    index: Arc<RwLock<VaultIndex>>,
    store: Arc<Mutex<StateStore>>,
    state: Arc<RwLock<IndexState>>,
    built_at: Arc<RwLock<Option<SystemTime>>>,
    events: broadcast::Sender<VaultEvent>,
    shutdown_tx: watch::Sender<bool>,
    watch_task: Option<tokio::task::JoinHandle<()>>,
}

impl VaultService {
    pub fn new(vault: Vault) -> Result<Self> {
        let store = StateStore::open_default(&vault)?;
        let state = match store.integrity_check() {
            Ok(()) => IndexState::Starting,
            Err(err) => {
                tracing::error!(error = %err, "state store failed integrity check");
                IndexState::Error
            }
        };
        let (events, _) = broadcast::channel(512);
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            vault,
            index: Arc::new(RwLock::new(VaultIndex::default())),
            store: Arc::new(Mutex::new(store)),
            state: Arc::new(RwLock::new(state)),
            built_at: Arc::new(RwLock::new(None)),
            events,
            shutdown_tx,
            watch_task: None,
        })
    }

    /// In-memory store variant for tests and ephemeral sessions.
    pub fn new_ephemeral(vault: Vault) -> Result<Self> {
        let store = StateStore::open_memory()?;
        let (events, _) = broadcast::channel(512);
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            vault,
            index: Arc::new(RwLock::new(VaultIndex::default())),
            store: Arc::new(Mutex::new(store)),
            state: Arc::new(RwLock::new(IndexState::Starting)),
            built_at: Arc::new(RwLock::new(None)),
            events,
            shutdown_tx,
            watch_task: None,
        })
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    pub fn config(&self) -> &VaultConfig {
        self.vault.config()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VaultEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> IndexState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn index_age(&self) -> Option<Duration> {
        let built = *self.built_at.read().unwrap_or_else(|e| e.into_inner());
        built.and_then(|t| SystemTime::now().duration_since(t).ok())
    }

    pub fn with_index<R>(&self, f: impl FnOnce(&VaultIndex) -> R) -> R {
        let guard = self.index.read().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    pub fn index_snapshot(&self) -> VaultIndex {
        self.with_index(|idx| idx.clone())
    }

    pub fn with_store<R>(&self, f: impl FnOnce(&mut StateStore) -> R) -> R {
        let mut guard = self.store.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Fail fast unless writes are currently allowed.
    pub fn require_ready(&self) -> Result<()> {
        match self.state() {
            IndexState::Ready => Ok(()),
            other => Err(Error::NotReady {
                state: other.to_string(),
            }),
        }
    }

    /// Reads are additionally served from the last snapshot while dirty.
    pub fn require_readable(&self) -> Result<()> {
        match self.state() {
            IndexState::Ready | IndexState::Dirty => Ok(()),
            other => Err(Error::NotReady {
                state: other.to_string(),
            }),
        }
    }

    /// Run a mutation under the write lock with the store held; gated on
    /// readiness.
    pub fn mutate<R>(
        &self,
        f: impl FnOnce(&mut crate::MutationEngine<'_>) -> Result<R>,
    ) -> Result<R> {
        self.require_ready()?;
        let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        let mut engine =
            crate::MutationEngine::new(&self.vault, &mut index, &mut store, self.vault.config());
        f(&mut engine)
    }

    fn set_state(&self, state: IndexState) {
        set_state(&self.state, &self.events, state);
    }

    /// Cold build: scan + parallel parse, then mirror the result into the
    /// state store (full-text rows, entity list, a metrics snapshot).
    pub async fn build_index(&self) -> Result<()> {
        self.build_index_with(CancelToken::new()).await
    }

    pub async fn build_index_with(&self, cancel: CancelToken) -> Result<()> {
        if self.state() == IndexState::Ready {
            self.set_state(IndexState::Rebuilding);
        }
        let vault = self.vault.clone();
        let index = Arc::clone(&self.index);
        let store = Arc::clone(&self.store);

        let result = tokio::task::spawn_blocking(move || -> Result<()> {
            let built = VaultIndex::build(&vault, &cancel)?;

            let mut store = store.lock().unwrap_or_else(|e| e.into_inner());
            store.replace_entities(built.entities())?;
            for note in built.all_notes() {
                cancel.check()?;
                let abs = vault.to_abs(&note.path);
                let text = std::fs::read_to_string(&abs).unwrap_or_default();
                store.upsert_note_text(&note.path, &note.title, &text)?;
            }
            let orphans = crate::graph::find_orphans(&built, OrphanDirection::Incoming).len();
            store.record_metrics(&MetricsSnapshot {
                captured_at: crate::store::unix_now(),
                note_count: built.note_count(),
                tag_count: built.tag_count(),
                link_count: built.link_count(),
                orphan_count: orphans,
                index_age_secs: 0,
            })?;
            drop(store);

            let mut guard = index.write().unwrap_or_else(|e| e.into_inner());
            *guard = built;
            Ok(())
        })
        .await
        .map_err(|e| Error::InvalidVaultPath(format!("index build task failed: {e}")))?;

        match result {
            Ok(()) => {
                *self.built_at.write().unwrap_or_else(|e| e.into_inner()) =
                    Some(SystemTime::now());
                self.set_state(IndexState::Ready);
                Ok(())
            }
            Err(err) => {
                if err.kind() != ErrorKind::Input {
                    self.set_state(IndexState::Error);
                }
                Err(err)
            }
        }
    }

    pub async fn start_watching(&mut self) -> Result<()> {
        if self.watch_task.is_some() {
            return Ok(());
        }
        let ctx = WatchCtx {
            vault: self.vault.clone(),
            index: Arc::clone(&self.index),
            store: Arc::clone(&self.store),
            state: Arc::clone(&self.state),
            events: self.events.clone(),
        };
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        self.watch_task = Some(tokio::spawn(async move {
            watch_loop(ctx, &mut shutdown_rx).await;
        }));
        Ok(())
    }

    /// Idempotent: cancels timers, drops pending events, releases the
    /// watcher.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.watch_task.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for VaultService {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

fn set_state(
    state: &RwLock<IndexState>,
    events: &broadcast::Sender<VaultEvent>,
    next: IndexState,
) {
    let mut guard = state.write().unwrap_or_else(|e| e.into_inner());
    if *guard != next {
        *guard = next;
        let _ = events.send(VaultEvent::StateChanged { state: next });
        tracing::debug!(state = %next, "index state changed");
    }
}

#[derive(Clone)]
struct WatchCtx {
    vault: Vault,
    index: Arc<RwLock<VaultIndex>>,
    store: Arc<Mutex<StateStore>>,
    state: Arc<RwLock<IndexState>>,
    events: broadcast::Sender<VaultEvent>,
}

enum PumpExit {
    Shutdown,
    WatcherFailed(notify::Error),
    ChannelClosed,
}

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const BACKOFF_MAX_RETRIES: u32 = 5;
const MAX_HANDLER_FAILURES: u32 = 5;

/// Outer self-healing loop: native watching with exponential-backoff
/// restarts, falling back to mtime polling when the platform gives up.
async fn watch_loop(ctx: WatchCtx, shutdown_rx: &mut watch::Receiver<bool>) {
    let mut backoff = BACKOFF_START;
    let mut retries = 0u32;

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        let exit = run_native(&ctx, shutdown_rx).await;
        let failure: Error = match exit {
            Ok(PumpExit::Shutdown) | Ok(PumpExit::ChannelClosed) => return,
            Ok(PumpExit::WatcherFailed(err)) => Error::from(err),
            Err(err) => err,
        };

        let kind = failure.kind();
        let _ = ctx.events.send(VaultEvent::Error {
            path: None,
            error: format!("watcher failed ({kind:?}): {failure}"),
        });
        match kind {
            ErrorKind::Transient => {
                retries += 1;
                if retries > BACKOFF_MAX_RETRIES {
                    tracing::warn!("watcher retries exhausted; polling permanently");
                    break;
                }
                set_state(&ctx.state, &ctx.events, IndexState::Dirty);
                tracing::warn!(
                    delay_secs = backoff.as_secs(),
                    retry = retries,
                    "watcher restart backoff"
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown_rx.changed() => return,
                }
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
            _ => {
                tracing::warn!("watching unsupported here; polling instead");
                break;
            }
        }
    }

    let _ = ctx.events.send(VaultEvent::WatchModeChanged {
        mode: WatchMode::Polling,
    });
    run_polling(&ctx, shutdown_rx).await;
}

/// One native-watcher session: pump OS events through the debounce ring
/// until shutdown or a watcher error.
async fn run_native(
    ctx: &WatchCtx,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<PumpExit> {
    let (raw_tx, mut raw_rx) =
        mpsc::unbounded_channel::<std::result::Result<notify::Event, notify::Error>>();
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = raw_tx.send(res);
    })?;
    watcher.watch(ctx.vault.root(), RecursiveMode::Recursive)?;
    let _ = ctx.events.send(VaultEvent::WatchModeChanged {
        mode: WatchMode::Native,
    });

    let cfg = ctx.vault.config().clone();
    let mut pending: HashMap<VaultPath, Pending> = HashMap::new();
    let mut window_opened: Option<Instant> = None;
    let mut handler_failures = 0u32;
    let far_future = Instant::now() + Duration::from_secs(86_400 * 365);

    loop {
        let next_deadline = pending
            .values()
            .map(|p| p.deadline)
            .chain(window_opened.map(|t| t + cfg.watch_flush_interval))
            .min()
            .unwrap_or(far_future);

        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return Ok(PumpExit::Shutdown);
                }
            }

            maybe = raw_rx.recv() => {
                let Some(res) = maybe else {
                    return Ok(PumpExit::ChannelClosed);
                };
                match res {
                    Ok(ev) => {
                        let now = Instant::now();
                        for (path, kind) in normalize_event(&ctx.vault, &ev) {
                            fold_pending(&mut pending, path, kind, now + cfg.watch_debounce);
                            window_opened.get_or_insert(now);
                        }
                        if pending.len() >= cfg.watch_batch_cap {
                            drain(ctx, &mut pending, &mut window_opened, true, &mut handler_failures).await;
                        }
                    }
                    Err(err) => return Ok(PumpExit::WatcherFailed(err)),
                }
            }

            _ = tokio::time::sleep_until(next_deadline), if !pending.is_empty() => {
                let force = window_opened
                    .is_some_and(|t| t.elapsed() >= cfg.watch_flush_interval);
                drain(ctx, &mut pending, &mut window_opened, force, &mut handler_failures).await;
            }
        }
    }
}

/// Mtime-diff polling; synthesises add/change/unlink events.
async fn run_polling(ctx: &WatchCtx, shutdown_rx: &mut watch::Receiver<bool>) {
    let interval = ctx.vault.config().poll_interval;
    let mut known: HashMap<VaultPath, SystemTime> = {
        let guard = ctx.index.read().unwrap_or_else(|e| e.into_inner());
        guard.all_notes().map(|n| (n.path.clone(), n.mtime)).collect()
    };
    let mut handler_failures = 0u32;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
            _ = tokio::time::sleep(interval) => {}
        }
        if *shutdown_rx.borrow() {
            return;
        }

        let vault = ctx.vault.clone();
        let scanned = tokio::task::spawn_blocking(move || {
            scan_vault(&vault, &CancelToken::new(), None)
        })
        .await;
        let entries = match scanned {
            Ok(Ok(entries)) => entries,
            Ok(Err(err)) => {
                let _ = ctx.events.send(VaultEvent::Error {
                    path: None,
                    error: err.to_string(),
                });
                continue;
            }
            Err(join_err) => {
                let _ = ctx.events.send(VaultEvent::Error {
                    path: None,
                    error: join_err.to_string(),
                });
                continue;
            }
        };

        let mut pending: HashMap<VaultPath, Pending> = HashMap::new();
        let now = Instant::now();
        let mut seen: HashMap<VaultPath, SystemTime> = HashMap::new();
        for entry in entries {
            seen.insert(entry.rel.clone(), entry.mtime);
            match known.get(&entry.rel) {
                None => fold_pending(&mut pending, entry.rel, PathEventKind::Add, now),
                Some(prev) if *prev != entry.mtime => {
                    fold_pending(&mut pending, entry.rel, PathEventKind::Change, now)
                }
                Some(_) => {}
            }
        }
        for path in known.keys() {
            if !seen.contains_key(path) {
                fold_pending(&mut pending, path.clone(), PathEventKind::Unlink, now);
            }
        }
        known = seen;

        if !pending.is_empty() {
            let mut window = Some(now);
            drain(ctx, &mut pending, &mut window, true, &mut handler_failures).await;
        }
    }
}

fn fold_pending(
    pending: &mut HashMap<VaultPath, Pending>,
    path: VaultPath,
    kind: PathEventKind,
    deadline: Instant,
) {
    let prev = pending.get(&path).map(|p| p.op);
    match coalesce(prev, kind) {
        Some(op) => {
            pending.insert(path, Pending { op, deadline });
        }
        None => {
            pending.remove(&path);
        }
    }
}

/// Apply due (or all) pending ops inside a blocking task, in the order
/// the debounce windows expire.
async fn drain(
    ctx: &WatchCtx,
    pending: &mut HashMap<VaultPath, Pending>,
    window_opened: &mut Option<Instant>,
    force_all: bool,
    handler_failures: &mut u32,
) {
    let now = Instant::now();
    let mut due: Vec<(VaultPath, CoalescedOp, Instant)> = Vec::new();
    let keys: Vec<VaultPath> = pending
        .iter()
        .filter(|(_, p)| force_all || p.deadline <= now)
        .map(|(k, _)| k.clone())
        .collect();
    for key in keys {
        if let Some(p) = pending.remove(&key) {
            due.push((key, p.op, p.deadline));
        }
    }
    if pending.is_empty() {
        *window_opened = None;
    }
    if due.is_empty() {
        return;
    }
    due.sort_by_key(|(_, _, deadline)| *deadline);

    let vault = ctx.vault.clone();
    let index = Arc::clone(&ctx.index);
    let store = Arc::clone(&ctx.store);
    let batch: Vec<(VaultPath, CoalescedOp)> =
        due.into_iter().map(|(p, op, _)| (p, op)).collect();

    let applied =
        tokio::task::spawn_blocking(move || apply_batch(&vault, &index, &store, batch)).await;

    match applied {
        Ok(events) => {
            let failed = events.iter().any(|e| matches!(e, VaultEvent::Error { .. }));
            for ev in events {
                let _ = ctx.events.send(ev);
            }
            if failed {
                *handler_failures += 1;
                if *handler_failures >= MAX_HANDLER_FAILURES {
                    set_state(&ctx.state, &ctx.events, IndexState::Error);
                }
            } else {
                *handler_failures = 0;
                // A clean batch heals a dirty or errored index.
                let current = *ctx.state.read().unwrap_or_else(|e| e.into_inner());
                if matches!(current, IndexState::Dirty | IndexState::Error) {
                    set_state(&ctx.state, &ctx.events, IndexState::Ready);
                }
            }
        }
        Err(join_err) => {
            let _ = ctx.events.send(VaultEvent::Error {
                path: None,
                error: join_err.to_string(),
            });
            *handler_failures += 1;
            if *handler_failures >= MAX_HANDLER_FAILURES {
                set_state(&ctx.state, &ctx.events, IndexState::Error);
            }
        }
    }
}

fn apply_batch(
    vault: &Vault,
    index: &RwLock<VaultIndex>,
    store: &Mutex<StateStore>,
    batch: Vec<(VaultPath, CoalescedOp)>,
) -> Vec<VaultEvent> {
    let mut out = Vec::new();
    let mut guard = index.write().unwrap_or_else(|e| e.into_inner());
    let mut store = store.lock().unwrap_or_else(|e| e.into_inner());

    for (path, op) in batch {
        match op {
            CoalescedOp::Upsert { .. } => {
                let abs = vault.to_abs(&path);
                match std::fs::metadata(&abs) {
                    Ok(meta) if !meta.is_file() => continue,
                    Ok(_) => {}
                    // Vanished inside the window: net delete.
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        guard.remove(&path);
                        let _ = store.remove_note(&path);
                        out.push(VaultEvent::Removed { path });
                        continue;
                    }
                    Err(err) => {
                        out.push(VaultEvent::Error {
                            path: Some(path),
                            error: err.to_string(),
                        });
                        continue;
                    }
                }
                match guard.upsert_file(vault, path.clone()) {
                    Ok(note) => {
                        let title = note.title.clone();
                        let text = std::fs::read_to_string(&abs).unwrap_or_default();
                        if let Err(err) = store.upsert_note_text(&path, &title, &text) {
                            out.push(VaultEvent::Error {
                                path: Some(path.clone()),
                                error: err.to_string(),
                            });
                        }
                        out.push(VaultEvent::Indexed { path });
                    }
                    Err(err) => out.push(VaultEvent::Error {
                        path: Some(path),
                        error: err.to_string(),
                    }),
                }
            }
            CoalescedOp::Delete => {
                guard.remove(&path);
                if let Err(err) = store.remove_note(&path) {
                    out.push(VaultEvent::Error {
                        path: Some(path.clone()),
                        error: err.to_string(),
                    });
                }
                out.push(VaultEvent::Removed { path });
            }
        }
    }
    out
}

/// Map one notify event onto per-path add/change/unlink events. Access and
/// metadata-only events are self-trigger noise and are dropped.
fn normalize_event(vault: &Vault, ev: &notify::Event) -> Vec<(VaultPath, PathEventKind)> {
    match &ev.kind {
        EventKind::Access(_) => return Vec::new(),
        EventKind::Modify(notify::event::ModifyKind::Metadata(_)) => return Vec::new(),
        _ => {}
    }

    let mut out = Vec::new();
    if let EventKind::Modify(notify::event::ModifyKind::Name(_)) = &ev.kind {
        if ev.paths.len() == 2 {
            if let Ok(from) = vault.to_rel(&ev.paths[0]) {
                if watchable(vault, &from) {
                    out.push((from, PathEventKind::Unlink));
                }
            }
            if let Ok(to) = vault.to_rel(&ev.paths[1]) {
                if watchable(vault, &to) {
                    out.push((to, PathEventKind::Add));
                }
            }
            return out;
        }
    }

    let kind = match &ev.kind {
        EventKind::Create(_) => PathEventKind::Add,
        EventKind::Remove(_) => PathEventKind::Unlink,
        _ => PathEventKind::Change,
    };
    for p in &ev.paths {
        if let Ok(rel) = vault.to_rel(p) {
            if watchable(vault, &rel) {
                out.push((rel.clone(), kind));
            }
        }
    }
    out
}

/// Deletions cannot be stat-ed, so judge by path shape alone.
fn watchable(vault: &Vault, rel: &VaultPath) -> bool {
    vault.is_indexable_rel(rel.as_path())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalescing_follows_the_net_effect_rules() {
        use CoalescedOp::*;
        use PathEventKind::*;

        // add then change -> upsert
        let op = coalesce(coalesce(None, Add), Change);
        assert_eq!(op, Some(Upsert { from_add: true }));
        // change then change -> upsert
        let op = coalesce(coalesce(None, Change), Change);
        assert_eq!(op, Some(Upsert { from_add: false }));
        // add then unlink -> net zero
        assert_eq!(coalesce(coalesce(None, Add), Unlink), None);
        // unlink alone -> delete
        assert_eq!(coalesce(None, Unlink), Some(Delete));
        // unlink then add -> upsert
        let op = coalesce(coalesce(None, Unlink), Add);
        assert_eq!(op, Some(Upsert { from_add: false }));
    }

    #[test]
    fn event_storm_ending_in_add_is_one_upsert() {
        use PathEventKind::*;
        let mut op = None;
        for ev in [Add, Change, Change, Unlink, Add] {
            op = coalesce(op, ev);
        }
        assert_eq!(op, Some(CoalescedOp::Upsert { from_add: false }));
    }

    #[test]
    fn storm_ending_in_unlink_is_one_delete() {
        use PathEventKind::*;
        let mut op = None;
        for ev in [Add, Change, Unlink, Add, Change, Unlink] {
            op = coalesce(op, ev);
        }
        assert_eq!(op, Some(CoalescedOp::Delete));
    }

    #[test]
    fn normalize_drops_access_and_non_markdown() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        std::fs::write(root.join("a.md"), "x").unwrap();
        std::fs::write(root.join("b.txt"), "x").unwrap();
        let vault = Vault::open(root).unwrap();

        let access = notify::Event {
            kind: EventKind::Access(notify::event::AccessKind::Open(
                notify::event::AccessMode::Any,
            )),
            paths: vec![root.join("a.md")],
            attrs: Default::default(),
        };
        assert!(normalize_event(&vault, &access).is_empty());

        let create = notify::Event {
            kind: EventKind::Create(notify::event::CreateKind::File),
            paths: vec![root.join("a.md"), root.join("b.txt")],
            attrs: Default::default(),
        };
        let evs = normalize_event(&vault, &create);
        assert_eq!(evs.len(), 1);
        assert_eq!(evs[0].1, PathEventKind::Add);
    }
}
