//! Receive-side file handling.
//!
//! Incoming data goes to a hidden `.<name>.<session>.part` file next to
//! the final destination and only becomes visible under its real name once
//! the digest matched. A staging file that is dropped without being
//! persisted is deleted.

use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::crypto::to_hex;
use crate::error::{Error, Result};

/// Longest file name kept from an offer.
const MAX_FILE_NAME_LEN: usize = 255;

/// Reduce an offered name to a bare, safe file name.
///
/// Directory components are stripped and control characters removed.
/// Returns `None` when nothing usable is left.
#[must_use]
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let last = name.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(name);
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();

    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        return None;
    }

    let mut end = cleaned.len().min(MAX_FILE_NAME_LEN);
    while !cleaned.is_char_boundary(end) {
        end -= 1;
    }
    Some(cleaned[..end].to_string())
}

/// First free path for `name` in `dir`: `name`, then `stem_1.ext`,
/// `stem_2.ext`, and so on.
#[must_use]
pub fn unique_destination(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if is_free(&candidate) {
        return candidate;
    }

    (1u32..)
        .map(|n| dir.join(numbered_name(name, n)))
        .find(|path| is_free(path))
        .unwrap_or(candidate)
}

fn is_free(path: &Path) -> bool {
    path.symlink_metadata().is_err()
}

fn numbered_name(name: &str, n: u32) -> String {
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map_or_else(|| name.to_string(), |s| s.to_string_lossy().into_owned());
    match path.extension() {
        Some(ext) => format!("{stem}_{n}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{n}"),
    }
}

/// Free bytes on the filesystem holding `dir`, when the platform can tell.
#[cfg(unix)]
pub fn available_space(dir: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(dir.as_os_str().as_bytes()).ok()?;
    let mut stat = std::mem::MaybeUninit::<libc::statvfs>::uninit();

    #[allow(unsafe_code)]
    let stat = unsafe {
        if libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) != 0 {
            return None;
        }
        stat.assume_init()
    };

    #[allow(clippy::unnecessary_cast)]
    Some((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
}

/// Free bytes on the filesystem holding `dir` (unsupported platform).
#[cfg(not(unix))]
pub fn available_space(_dir: &Path) -> Option<u64> {
    None
}

/// Hidden file collecting chunks until the digest is verified.
#[derive(Debug)]
pub struct StagingFile {
    path: PathBuf,
    file: Option<File>,
    hasher: Sha256,
    bytes_written: u64,
    persisted: bool,
}

impl StagingFile {
    /// Create `.<name>.<session8>.part` in `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or the file cannot be created.
    pub async fn create(dir: &Path, name: &str, session_id: Uuid) -> Result<Self> {
        fs::create_dir_all(dir).await.map_err(|e| map_io(e, dir))?;

        let session = session_id.simple().to_string();
        let path = dir.join(format!(".{name}.{}.part", &session[..8]));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| map_io(e, &path))?;

        tracing::debug!(path = %path.display(), "Created staging file");
        Ok(Self {
            path,
            file: Some(file),
            hasher: Sha256::new(),
            bytes_written: 0,
            persisted: false,
        })
    }

    /// Append a verified chunk.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::Internal("staging file already closed".to_string()))?;
        file.write_all(data).await.map_err(|e| map_io(e, &self.path))?;
        self.hasher.update(data);
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Bytes written so far.
    #[must_use]
    pub const fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Path of the staging file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush to disk and return the hex SHA-256 of everything written.
    pub async fn finish(&mut self) -> Result<String> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(to_hex(&self.hasher.clone().finalize()))
    }

    /// Give the file its final name in `dir`, never replacing an existing file.
    pub async fn persist(mut self, dir: &Path, name: &str) -> Result<PathBuf> {
        self.finish().await?;

        loop {
            let destination = unique_destination(dir, name);
            match fs::hard_link(&self.path, &destination).await {
                Ok(()) => {
                    if let Err(e) = fs::remove_file(&self.path).await {
                        tracing::debug!("Failed to remove staging link: {}", e);
                    }
                    self.persisted = true;
                    return Ok(destination);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => {
                    tracing::debug!("Hard link failed ({}), renaming instead", e);
                    fs::rename(&self.path, &destination)
                        .await
                        .map_err(|e| map_io(e, &destination))?;
                    self.persisted = true;
                    return Ok(destination);
                }
            }
        }
    }

    /// Delete the staging file now.
    pub async fn discard(mut self) {
        self.file = None;
        if let Err(e) = fs::remove_file(&self.path).await {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), "Failed to remove partial file: {}", e);
            }
        }
        self.persisted = true;
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        if !self.persisted {
            self.file = None;
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn map_io(e: io::Error, path: &Path) -> Error {
    match e.kind() {
        io::ErrorKind::PermissionDenied => Error::PermissionDenied(path.display().to_string()),
        _ => Error::Io(e),
    }
}
