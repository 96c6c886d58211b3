use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used by callers to decide whether to retry,
/// surface, or refuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid input from the caller; never retried.
    Input,
    /// The operation collides with existing structure; caller decides.
    Conflict,
    /// The index is not serving yet; retryable.
    NotReady,
    /// Transient I/O pressure; retried internally where a policy exists.
    Transient,
    /// Unrecoverable I/O or environment failure.
    Fatal,
    /// The state store failed an integrity check; cold rebuild required.
    Corruption,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("vault root does not exist: {0}")]
    VaultNotFound(PathBuf),

    #[error("invalid vault path: {0}")]
    InvalidVaultPath(String),

    #[error("path is outside vault: {0}")]
    PathOutsideVault(PathBuf),

    #[error("note not found: {0}")]
    NoteNotFound(String),

    #[error("section not found in {path}: {section}")]
    SectionNotFound { path: String, section: String },

    #[error("section address is ambiguous in {path}: {section} ({candidates:?})")]
    AmbiguousSection {
        path: String,
        section: String,
        candidates: Vec<String>,
    },

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("edit conflict in {path} at line {line}: {reason}")]
    EditConflict {
        path: String,
        line: u32,
        reason: String,
    },

    #[error("{path} has {count} backlink(s); pass force to delete anyway")]
    DeleteHasBacklinks { path: String, count: usize },

    #[error("note already exists: {0}")]
    NoteExists(String),

    #[error("index is not ready (state: {state})")]
    NotReady { state: String },

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("frontmatter yaml error: {0}")]
    FrontmatterYaml(#[from] serde_yaml::Error),

    #[error("watcher error: {0}")]
    Notify(#[from] notify::Error),

    #[error("state store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("state store refuses downgrade: file version {file} > supported {supported}")]
    StoreDowngrade { file: i64, supported: i64 },

    #[error("state store corrupt: {0}")]
    StoreCorrupt(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::VaultNotFound(_)
            | Self::InvalidVaultPath(_)
            | Self::PathOutsideVault(_)
            | Self::NoteNotFound(_)
            | Self::SectionNotFound { .. }
            | Self::AmbiguousSection { .. }
            | Self::UnknownOperation(_)
            | Self::FrontmatterYaml(_)
            | Self::Cancelled => ErrorKind::Input,

            Self::EditConflict { .. } | Self::DeleteHasBacklinks { .. } | Self::NoteExists(_) => {
                ErrorKind::Conflict
            }

            Self::NotReady { .. } => ErrorKind::NotReady,

            Self::Io { source, .. } => io_kind(source),
            Self::Notify(err) => notify_kind(err),

            Self::Store(_) => ErrorKind::Fatal,
            Self::StoreDowngrade { .. } | Self::StoreCorrupt(_) => ErrorKind::Corruption,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotReady | ErrorKind::Transient)
    }
}

// ENFILE=23, EMFILE=24 on linux/macos; no stable io::ErrorKind for either.
fn io_kind(err: &std::io::Error) -> ErrorKind {
    use std::io::ErrorKind as Io;
    match err.kind() {
        Io::WouldBlock | Io::Interrupted | Io::TimedOut => ErrorKind::Transient,
        Io::PermissionDenied | Io::NotFound => ErrorKind::Fatal,
        _ => match err.raw_os_error() {
            Some(23) | Some(24) => ErrorKind::Transient,
            _ => ErrorKind::Fatal,
        },
    }
}

fn notify_kind(err: &notify::Error) -> ErrorKind {
    match &err.kind {
        notify::ErrorKind::MaxFilesWatch => ErrorKind::Transient,
        notify::ErrorKind::Io(io) => io_kind(io),
        _ => ErrorKind::Fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_errors_classify_as_conflict() {
        let err = Error::EditConflict {
            path: "a.md".into(),
            line: 3,
            reason: "inside fenced code block".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(!err.is_retryable());
    }

    #[test]
    fn not_ready_is_retryable() {
        let err = Error::NotReady {
            state: "rebuilding".into(),
        };
        assert_eq!(err.kind(), ErrorKind::NotReady);
        assert!(err.is_retryable());
    }

    #[test]
    fn too_many_open_files_is_transient() {
        let io = std::io::Error::from_raw_os_error(24);
        assert_eq!(io_kind(&io), ErrorKind::Transient);
    }
}
