//! The file being shared

use std::path::{Path, PathBuf};
use tracing::warn;

/// Directory, name and size of the shared file.
///
/// Built once per service; the file server never mutates it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SharedFile {
    pub directory: PathBuf,
    pub name: String,
    /// `None` when the size could not be read
    pub size: Option<u64>,
}

impl SharedFile {
    /// Describe the file at `path`.
    ///
    /// A failed size lookup leaves `size` unset instead of failing.
    pub fn from_path(path: &Path) -> Self {
        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let size = match std::fs::metadata(path) {
            Ok(meta) => Some(meta.len()),
            Err(e) => {
                warn!("Could not read size of {:?}: {}", path, e);
                None
            }
        };

        Self {
            directory,
            name,
            size,
        }
    }

    /// An empty reference, used when no file is configured
    pub fn unconfigured() -> Self {
        Self::default()
    }

    pub fn is_configured(&self) -> bool {
        !self.name.is_empty()
    }

    /// Full path of the file, if one is configured.
    ///
    /// Names that would escape `directory` are refused.
    pub fn path(&self) -> Option<PathBuf> {
        if !self.is_configured() || self.name.contains('/') || self.name == ".." {
            return None;
        }
        Some(self.directory.join(&self.name))
    }
}
