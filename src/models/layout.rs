//! On-disk layout of the resource directory.
//!
//! ```text
//! <root>/models/       finished, verified artifacts (the only zone consumers read)
//! <root>/staging/      `*.partial` downloads, untrusted
//! <root>/extracting/   temporary extraction and deletion directories
//! ```
//!
//! Everything enters `models/` through a single `rename` from one of the
//! other zones, so readers never see a half-written artifact.

use crate::models::manifest::ModelEntry;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ResourceLayout {
    root: PathBuf,
}

impl ResourceLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create all three zones
    pub fn ensure(&self) -> io::Result<()> {
        fs::create_dir_all(self.models_dir())?;
        fs::create_dir_all(self.staging_dir())?;
        fs::create_dir_all(self.extracting_dir())?;
        Ok(())
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn models_dir(&self) -> PathBuf {
        self.root.join("models")
    }

    #[must_use]
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    #[must_use]
    pub fn extracting_dir(&self) -> PathBuf {
        self.root.join("extracting")
    }

    /// Where a finished artifact lives
    #[must_use]
    pub fn final_path(&self, entry: &ModelEntry) -> PathBuf {
        self.models_dir().join(&entry.filename)
    }

    #[must_use]
    pub fn partial_path(&self, entry: &ModelEntry) -> PathBuf {
        self.staging_dir().join(format!("{}.partial", entry.filename))
    }

    #[must_use]
    pub fn extraction_path(&self, entry: &ModelEntry) -> PathBuf {
        self.extracting_dir()
            .join(format!("{}.extracting", entry.filename))
    }

    /// Holding place a finished artifact is renamed to before removal
    #[must_use]
    pub fn trash_path(&self, entry: &ModelEntry) -> PathBuf {
        self.extracting_dir().join(format!("{}.deleting", entry.filename))
    }

    /// Whether a promoted artifact for `entry` is present.
    ///
    /// Single files must also have the manifest size; a stray file of the
    /// wrong length is not reported as installed.
    #[must_use]
    pub fn is_installed(&self, entry: &ModelEntry) -> bool {
        let path = self.final_path(entry);
        if entry.archive {
            return path.is_dir();
        }
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => {
                if meta.len() == entry.size_bytes {
                    true
                } else {
                    tracing::warn!(
                        "Ignoring {}: {} bytes on disk, manifest says {}",
                        path.display(),
                        meta.len(),
                        entry.size_bytes
                    );
                    false
                }
            }
            _ => false,
        }
    }

    /// Discard staging and extraction leftovers from a previous process.
    ///
    /// Returns the number of removed entries.
    pub fn sweep_orphans(&self) -> io::Result<usize> {
        let mut removed = 0;
        for dir in [self.staging_dir(), self.extracting_dir()] {
            if !dir.exists() {
                continue;
            }
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                tracing::warn!("Discarding leftover {} from a previous run", path.display());
                remove_path(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Remove a file or directory tree; missing paths are not an error
pub fn remove_path(path: &Path) -> io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
