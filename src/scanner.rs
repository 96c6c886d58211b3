use std::path::PathBuf;
use std::time::SystemTime;

use walkdir::WalkDir;

use crate::{CancelToken, Error, Result, Vault, VaultPath};

/// One file yielded by the cold scan.
#[derive(Debug, Clone)]
pub struct ScanEntry {
    pub rel: VaultPath,
    pub abs: PathBuf,
    pub mtime: SystemTime,
}

/// Walk the vault depth-first, yielding indexable Markdown files.
///
/// Hidden directories and configured tool directories are pruned without
/// descending. Results are sorted by relative path so a cold build is
/// deterministic regardless of directory iteration order.
pub fn scan_vault(
    vault: &Vault,
    cancel: &CancelToken,
    mut progress: Option<&mut dyn FnMut(usize)>,
) -> Result<Vec<ScanEntry>> {
    let every = vault.config().scan_progress_every;
    let mut out = Vec::new();

    let walker = WalkDir::new(vault.root())
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            if !e.file_type().is_dir() {
                return true;
            }
            let name = e.file_name().to_string_lossy();
            let hidden = name.starts_with('.') && e.depth() > 0;
            let ignored = vault.config().ignore_dirs.iter().any(|d| d == &name);
            !(hidden || ignored)
        });

    for entry in walker {
        cancel.check()?;
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                tracing::warn!(error = %err, "scan: skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let abs = entry.path();
        let Ok(rel) = vault.to_rel(abs) else {
            continue;
        };
        if !vault.is_indexable_rel(rel.as_path()) {
            continue;
        }
        let mtime = entry
            .metadata()
            .map_err(|e| {
                Error::io(
                    abs,
                    e.into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("metadata unavailable")),
                )
            })?
            .modified()
            .unwrap_or(SystemTime::UNIX_EPOCH);

        out.push(ScanEntry {
            rel,
            abs: abs.to_path_buf(),
            mtime,
        });

        if every > 0 && out.len() % every == 0 {
            if let Some(cb) = progress.as_mut() {
                cb(out.len());
            }
        }
    }

    out.sort_by(|a, b| a.rel.cmp(&b.rel));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(root: &std::path::Path, rel: &str, content: &str) {
        let p = root.join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, content).unwrap();
    }

    #[test]
    fn scan_filters_and_sorts() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        touch(root, "b/two.md", "x");
        touch(root, "a/one.md", "x");
        touch(root, "a/skip.txt", "x");
        touch(root, ".git/HEAD.md", "x");
        touch(root, "node_modules/dep.md", "x");
        touch(root, ".hidden/inner.md", "x");

        let vault = Vault::open(root).unwrap();
        let entries = scan_vault(&vault, &CancelToken::new(), None).unwrap();
        let rels: Vec<_> = entries.iter().map(|e| e.rel.as_str().to_string()).collect();
        assert_eq!(rels, vec!["a/one.md", "b/two.md"]);
    }

    #[test]
    fn scan_honours_cancellation() {
        let temp = tempfile::tempdir().unwrap();
        touch(temp.path(), "a.md", "x");
        let vault = Vault::open(temp.path()).unwrap();
        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(
            scan_vault(&vault, &token, None),
            Err(Error::Cancelled)
        ));
    }
}
