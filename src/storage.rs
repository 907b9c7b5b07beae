//! Managed storage for source and signed documents.
//!
//! Stored paths are strings kept in document records. They are resolved
//! against a single uploads root and rejected before any read or write if
//! they would land outside it.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Component, Path, PathBuf};

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::{SignError, SignResult};

/// Attempts at finding a free artifact name before giving up.
const MAX_NAME_ATTEMPTS: i64 = 1000;

#[derive(Debug, Clone)]
pub struct UploadsRoot {
    root: PathBuf,
}

impl UploadsRoot {
    /// Open (creating if needed) the uploads directory.
    pub fn open(root: impl AsRef<Path>) -> SignResult<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Resolve a stored path to an absolute path inside the root.
    ///
    /// Relative paths are taken relative to the root. `..` components are
    /// applied lexically and may not climb above the root. Absolute paths
    /// are accepted only when they already point inside the root. An
    /// existing file is additionally canonicalized so a symlink cannot lead
    /// outside.
    pub fn resolve(&self, stored: &str) -> SignResult<PathBuf> {
        let traversal = || SignError::PathTraversal(stored.to_string());
        let candidate = Path::new(stored);

        let (base, rest) = if candidate.is_absolute() {
            let rest = candidate.strip_prefix(&self.root).map_err(|_| traversal())?;
            (self.root.clone(), rest)
        } else {
            (self.root.clone(), candidate)
        };

        let mut resolved = base;
        let mut depth = 0usize;
        for component in rest.components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    if depth == 0 {
                        warn!(path = stored, "rejected path escaping the uploads root");
                        return Err(traversal());
                    }
                    resolved.pop();
                    depth -= 1;
                }
                Component::RootDir | Component::Prefix(_) => return Err(traversal()),
            }
        }
        if depth == 0 {
            return Err(traversal());
        }

        if resolved.exists() {
            let canonical = resolved.canonicalize()?;
            if !canonical.starts_with(&self.root) {
                warn!(path = stored, "rejected symlink escaping the uploads root");
                return Err(traversal());
            }
            return Ok(canonical);
        }
        Ok(resolved)
    }

    /// Read a stored document.
    pub fn read(&self, stored: &str) -> SignResult<Vec<u8>> {
        let path = self.resolve(stored)?;
        Ok(fs::read(path)?)
    }

    /// Write a signed artifact into the root as
    /// `signed_<unix-millis>_<base name of source>` and return its stored
    /// path (relative to the root). Existing files are never overwritten.
    pub fn write_signed(&self, source: &str, bytes: &[u8]) -> SignResult<String> {
        let source_path = self.resolve(source)?;
        let base_name = source_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| SignError::PathTraversal(source.to_string()))?;

        let started = Utc::now().timestamp_millis();
        for offset in 0..MAX_NAME_ATTEMPTS {
            let name = format!("signed_{}_{}", started + offset, base_name);
            let path = self.root.join(&name);
            match create_exclusive(&path, |file| file.write_all(bytes)) {
                Ok(()) => {
                    debug!(path = %path.display(), len = bytes.len(), "wrote signed artifact");
                    return Ok(name);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(SignError::Storage(format!("no free artifact name for {base_name}")))
    }

    /// Stored names of every file currently in the root.
    pub fn list(&self) -> SignResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Create `path` (failing if it exists), fill it and sync it. A file that
/// could not be completely written is removed again.
fn create_exclusive(
    path: &Path,
    fill: impl FnOnce(&mut File) -> io::Result<()>,
) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let written = fill(&mut file).and_then(|_| file.sync_all());
    if let Err(e) = written {
        drop(file);
        if let Err(remove) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %remove, "could not remove partial artifact");
        }
        return Err(e);
    }
    Ok(())
}
