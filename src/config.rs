use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result};

/// Window used when counting entity co-occurrence for suggestion scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooccurrenceWindow {
    Paragraph,
    Section,
    Note,
}

#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// Directory names to ignore anywhere in the path.
    pub ignore_dirs: Vec<String>,
    /// Per-path debounce window for filesystem events.
    pub watch_debounce: Duration,
    /// Force a drain of pending events this long after the first arrival.
    pub watch_flush_interval: Duration,
    /// Force a drain once this many distinct paths are pending.
    pub watch_batch_cap: usize,
    /// Revisit interval when the watcher has fallen back to polling.
    pub poll_interval: Duration,
    /// Minimum score before an auto-link rewrite is applied on write.
    pub autolink_floor: f64,
    /// Negatives needed before (entity, folder) is suppressed.
    pub suppression_negatives: u32,
    /// Accuracy below which repeated negatives promote a suppression.
    pub suppression_accuracy: f64,
    /// Minimum feedback sample before accuracy is trusted.
    pub feedback_min_sample: u32,
    /// Window for the co-occurrence scoring signal.
    pub cooccurrence_window: CooccurrenceWindow,
    /// Report scan progress every this many files (0 disables).
    pub scan_progress_every: usize,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            ignore_dirs: vec![
                ".obsidian".into(),
                ".git".into(),
                ".trash".into(),
                ".cache".into(),
                "node_modules".into(),
                "target".into(),
            ],
            watch_debounce: Duration::from_millis(200),
            watch_flush_interval: Duration::from_secs(1),
            watch_batch_cap: 50,
            poll_interval: Duration::from_secs(30),
            autolink_floor: 1.5,
            suppression_negatives: 3,
            suppression_accuracy: 0.4,
            feedback_min_sample: 5,
            cooccurrence_window: CooccurrenceWindow::Section,
            scan_progress_every: 1000,
        }
    }
}

/// On-disk override file, all fields optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    ignore_dirs: Option<Vec<String>>,
    watch_debounce_ms: Option<u64>,
    watch_flush_interval_ms: Option<u64>,
    watch_batch_cap: Option<usize>,
    poll_interval_secs: Option<u64>,
    autolink_floor: Option<f64>,
    suppression_negatives: Option<u32>,
    suppression_accuracy: Option<f64>,
    feedback_min_sample: Option<u32>,
    cooccurrence_window: Option<CooccurrenceWindow>,
    scan_progress_every: Option<usize>,
}

impl VaultConfig {
    /// Relative location of the config override file inside a vault.
    pub const FILE: &'static str = ".notegraph/config.toml";

    /// Load defaults merged with `.notegraph/config.toml` if present.
    pub fn load(vault_root: &Path) -> Result<Self> {
        let mut cfg = Self::default();
        let path = vault_root.join(Self::FILE);
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(cfg),
            Err(err) => return Err(Error::io(&path, err)),
        };
        let file: ConfigFile = toml::from_str(&text)
            .map_err(|e| Error::InvalidVaultPath(format!("{}: {e}", path.display())))?;

        if let Some(v) = file.ignore_dirs {
            cfg.ignore_dirs = v;
        }
        if let Some(ms) = file.watch_debounce_ms {
            cfg.watch_debounce = Duration::from_millis(ms);
        }
        if let Some(ms) = file.watch_flush_interval_ms {
            cfg.watch_flush_interval = Duration::from_millis(ms);
        }
        if let Some(v) = file.watch_batch_cap {
            cfg.watch_batch_cap = v.max(1);
        }
        if let Some(s) = file.poll_interval_secs {
            cfg.poll_interval = Duration::from_secs(s.max(1));
        }
        if let Some(v) = file.autolink_floor {
            cfg.autolink_floor = v;
        }
        if let Some(v) = file.suppression_negatives {
            cfg.suppression_negatives = v.max(1);
        }
        if let Some(v) = file.suppression_accuracy {
            cfg.suppression_accuracy = v.clamp(0.0, 1.0);
        }
        if let Some(v) = file.feedback_min_sample {
            cfg.feedback_min_sample = v;
        }
        if let Some(v) = file.cooccurrence_window {
            cfg.cooccurrence_window = v;
        }
        if let Some(v) = file.scan_progress_every {
            cfg.scan_progress_every = v;
        }
        Ok(cfg)
    }

    /// Hidden state directory at the vault root.
    pub fn state_dir(vault_root: &Path) -> PathBuf {
        vault_root.join(".notegraph")
    }
}
