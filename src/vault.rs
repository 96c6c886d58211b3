use std::path::{Component, Path, PathBuf};

use crate::{Error, Result, VaultConfig};

/// A vault-root-relative path, normalised to forward slashes.
///
/// This is the canonical key for every note, entity and backlink; all
/// cross-references in the index are by `VaultPath`, never by pointer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VaultPath(String);

impl VaultPath {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }

    /// Filename stem, e.g. `people/Sarah Mitchell.md` -> `Sarah Mitchell`.
    pub fn stem(&self) -> &str {
        self.as_path()
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("")
    }

    /// Containing folder, `""` for root-level notes.
    pub fn folder(&self) -> &str {
        match self.0.rfind('/') {
            Some(ix) => &self.0[..ix],
            None => "",
        }
    }

    pub fn is_markdown(&self) -> bool {
        Path::new(&self.0)
            .extension()
            .and_then(|s| s.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("md"))
    }

    /// Lowercased, `.md`-stripped form used as the backlink/entity key.
    pub fn link_key(&self) -> String {
        normalize_link_key(&self.0)
    }
}

/// Lowercase and strip a trailing `.md` from a link target or path.
pub(crate) fn normalize_link_key(raw: &str) -> String {
    let s = raw.trim().replace('\\', "/");
    let s = s.strip_suffix(".md").unwrap_or(&s);
    s.to_lowercase()
}

impl TryFrom<&Path> for VaultPath {
    type Error = Error;

    fn try_from(value: &Path) -> Result<Self> {
        if value.as_os_str().is_empty() {
            return Err(Error::InvalidVaultPath("empty path".into()));
        }
        if value.is_absolute() {
            return Err(Error::InvalidVaultPath(
                "absolute paths are not allowed".into(),
            ));
        }

        let mut parts: Vec<String> = Vec::new();
        for c in value.components() {
            match c {
                Component::Prefix(_) | Component::RootDir => {
                    return Err(Error::InvalidVaultPath(
                        "absolute paths are not allowed".into(),
                    ));
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    return Err(Error::InvalidVaultPath(
                        "path traversal is not allowed".into(),
                    ));
                }
                Component::Normal(part) => {
                    let Some(s) = part.to_str() else {
                        return Err(Error::InvalidVaultPath(
                            "path is not valid unicode".into(),
                        ));
                    };
                    parts.push(s.to_string());
                }
            }
        }

        if parts.is_empty() {
            return Err(Error::InvalidVaultPath("empty path".into()));
        }

        Ok(Self(parts.join("/")))
    }
}

impl TryFrom<&str> for VaultPath {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        VaultPath::try_from(Path::new(&value.replace('\\', "/")))
    }
}

impl std::fmt::Display for VaultPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl serde::Serialize for VaultPath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for VaultPath {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        VaultPath::try_from(raw.as_str()).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone)]
pub struct Vault {
    root: PathBuf,
    cfg: VaultConfig,
}

impl Vault {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let cfg = VaultConfig::load(&root).unwrap_or_default();
        Self::with_config(root, cfg)
    }

    pub fn with_config(root: impl Into<PathBuf>, cfg: VaultConfig) -> Result<Self> {
        let root = root.into();
        if !root.exists() {
            return Err(Error::VaultNotFound(root));
        }
        let root = std::fs::canonicalize(&root).map_err(|e| Error::io(&root, e))?;
        Ok(Self { root, cfg })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &VaultConfig {
        &self.cfg
    }

    pub fn state_dir(&self) -> PathBuf {
        VaultConfig::state_dir(&self.root)
    }

    pub fn to_abs(&self, rel: &VaultPath) -> PathBuf {
        self.root.join(rel.as_path())
    }

    pub fn to_rel(&self, abs: &Path) -> Result<VaultPath> {
        let abs = if abs.is_absolute() {
            abs.to_path_buf()
        } else {
            self.root.join(abs)
        };

        let abs = std::fs::canonicalize(&abs).unwrap_or(abs);
        if !abs.starts_with(&self.root) {
            return Err(Error::PathOutsideVault(abs));
        }
        let rel = abs
            .strip_prefix(&self.root)
            .map_err(|_| Error::PathOutsideVault(abs.clone()))?;
        VaultPath::try_from(rel)
    }

    pub fn is_ignored_rel(&self, rel: &Path) -> bool {
        rel.components().any(|c| {
            let Component::Normal(part) = c else {
                return false;
            };
            let s = part.to_string_lossy();
            s.starts_with('.') || self.cfg.ignore_dirs.iter().any(|d| d == &s)
        })
    }

    /// Markdown files outside ignored/hidden directories are indexable.
    pub fn is_indexable_rel(&self, rel: &Path) -> bool {
        if rel.as_os_str().is_empty() || self.is_ignored_rel(rel) {
            return false;
        }
        rel.extension()
            .and_then(|s| s.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("md"))
    }

    pub fn is_indexable_path(&self, abs_or_rel: &Path) -> bool {
        match self.to_rel(abs_or_rel) {
            Ok(rel) => self.is_indexable_rel(rel.as_path()),
            Err(_) => false,
        }
    }
}
