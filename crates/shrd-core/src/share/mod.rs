//! Remote browsing of a shared directory.
//!
//! A node with `general.share_dir` set lets paired devices list that
//! directory and download files from it. Requests name paths relative to
//! the shared root with `/` separators; nothing outside the root is ever
//! listed or sent, symlinks included.
//!
//! ```text
//! client                                 serving node
//!   listDir{path}  ──▶
//!                  ◀── listing{path, entries} | error{forbidden | not_found}
//!   download{path} ──▶
//!                  ◀── header ... (regular transfer, serving node sends)
//! ```

use std::io;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tokio::fs;

use crate::error::{Error, Result};
use crate::protocol::{reason, DirEntry};

/// Result of browsing a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDir {
    /// Normalized path that was listed, empty for the root
    pub path: String,
    /// Entries sorted by name
    pub entries: Vec<DirEntry>,
}

/// The directory this node exposes to paired devices.
#[derive(Debug, Clone)]
pub struct SharedDir {
    root: PathBuf,
}

impl SharedDir {
    /// Share `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The shared root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// List the directory at `relative`.
    pub async fn list(&self, relative: &str) -> Result<RemoteDir> {
        let (path, normalized) = self.resolve(relative).await?;
        if !fs::metadata(&path).await.map_err(|e| not_found(e, relative))?.is_dir() {
            return Err(Error::FileNotFound(relative.to_string()));
        }

        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&path).await?;
        while let Some(entry) = dir.next_entry().await? {
            // Unreadable entries are skipped rather than failing the listing.
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: metadata.is_dir(),
                size: if metadata.is_file() { metadata.len() } else { 0 },
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        tracing::debug!(path = %normalized, count = entries.len(), "Listed shared directory");
        Ok(RemoteDir {
            path: normalized,
            entries,
        })
    }

    /// Absolute path of the regular file at `relative`.
    pub async fn file(&self, relative: &str) -> Result<PathBuf> {
        let (path, _) = self.resolve(relative).await?;
        let metadata = fs::metadata(&path).await.map_err(|e| not_found(e, relative))?;
        if !metadata.is_file() {
            return Err(Error::FileNotFound(relative.to_string()));
        }
        Ok(path)
    }

    /// Canonical path for `relative`, refused when it leaves the root.
    async fn resolve(&self, relative: &str) -> Result<(PathBuf, String)> {
        let normalized = normalize(relative)?;
        let root = fs::canonicalize(&self.root).await.map_err(|e| {
            tracing::warn!(root = %self.root.display(), "Shared directory unavailable: {}", e);
            Error::FileNotFound(self.root.display().to_string())
        })?;

        let path = fs::canonicalize(root.join(&normalized))
            .await
            .map_err(|e| not_found(e, relative))?;
        if !path.starts_with(&root) {
            return Err(Error::InvalidPath(format!("'{relative}' leaves the shared directory")));
        }
        Ok((path, normalized))
    }
}

/// Reduce a requested path to `a/b/c` form.
///
/// Absolute paths and `..` are refused; `.` and empty segments are dropped.
pub fn normalize(relative: &str) -> Result<String> {
    let mut parts = Vec::new();
    for component in Path::new(&relative.replace('\\', "/")).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::InvalidPath(format!(
                    "'{relative}' is not a path inside the shared directory"
                )));
            }
        }
    }
    Ok(parts.join("/"))
}

/// Reason code sent back for a refused request.
#[must_use]
pub fn refusal_reason(error: &Error) -> &'static str {
    match error {
        Error::FileNotFound(_) => reason::NOT_FOUND,
        Error::InvalidPath(_) | Error::PermissionDenied(_) => reason::FORBIDDEN,
        _ => reason::INTERNAL,
    }
}

fn not_found(e: io::Error, relative: &str) -> Error {
    match e.kind() {
        io::ErrorKind::NotFound => Error::FileNotFound(relative.to_string()),
        io::ErrorKind::PermissionDenied => Error::PermissionDenied(relative.to_string()),
        _ => Error::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn shared() -> (TempDir, SharedDir) {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("docs/old")).unwrap();
        std::fs::write(dir.path().join("docs/report.pdf"), vec![1u8; 42]).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hi").unwrap();
        let shared = SharedDir::new(dir.path());
        (dir, shared)
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("").unwrap(), "");
        assert_eq!(normalize("docs/./report.pdf").unwrap(), "docs/report.pdf");
        assert_eq!(normalize("docs//old/").unwrap(), "docs/old");
        assert_eq!(normalize("docs\\old").unwrap(), "docs/old");
        assert!(normalize("../etc/passwd").is_err());
        assert!(normalize("docs/../../x").is_err());
        assert!(normalize("/etc/passwd").is_err());
    }

    #[tokio::test]
    async fn test_list_root_and_subdir() {
        let (_dir, shared) = shared();

        let root = shared.list("").await.unwrap();
        assert_eq!(root.path, "");
        let names: Vec<_> = root.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["docs", "notes.txt"]);
        assert!(root.entries[0].is_dir);
        assert_eq!(root.entries[1].size, 2);

        let docs = shared.list("docs").await.unwrap();
        assert_eq!(
            docs.entries,
            vec![
                DirEntry {
                    name: "old".into(),
                    is_dir: true,
                    size: 0
                },
                DirEntry {
                    name: "report.pdf".into(),
                    is_dir: false,
                    size: 42
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_file_lookup() {
        let (dir, shared) = shared();

        let path = shared.file("docs/report.pdf").await.unwrap();
        assert_eq!(path, dir.path().canonicalize().unwrap().join("docs/report.pdf"));
        assert!(matches!(
            shared.file("docs").await,
            Err(Error::FileNotFound(_))
        ));
        assert!(matches!(
            shared.file("missing.bin").await,
            Err(Error::FileNotFound(_))
        ));
        assert!(matches!(
            shared.list("notes.txt").await,
            Err(Error::FileNotFound(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_out_of_root_is_refused() {
        let (dir, shared) = shared();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret"), b"x").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();

        let err = shared.file("escape/secret").await.unwrap_err();
        assert!(matches!(err, Error::InvalidPath(_)));
        assert_eq!(refusal_reason(&err), reason::FORBIDDEN);
    }

    #[test]
    fn test_refusal_reasons() {
        assert_eq!(
            refusal_reason(&Error::FileNotFound("x".into())),
            reason::NOT_FOUND
        );
        assert_eq!(
            refusal_reason(&Error::InvalidPath("x".into())),
            reason::FORBIDDEN
        );
    }
}
