use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use replift_core::{TargetClass, MANIFEST_FILE_NAME};

/// Per-attempt scratch directory. Every path the engine stages, backs
/// up, or journals during one update run lives under this root.
#[derive(Debug, Clone)]
pub struct ScratchLayout {
    root: PathBuf,
}

impl ScratchLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Staging subtree for one install class. Archive entries carry
    /// class-tagged paths, so extraction populates these directly.
    pub fn class_dir(&self, class: TargetClass) -> PathBuf {
        self.root.join(class.as_str())
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join(TargetClass::Temp.as_str())
    }

    pub fn patches_dir(&self) -> PathBuf {
        self.temp_dir().join("patches")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.root.join("backup")
    }

    pub fn archive_path(&self) -> PathBuf {
        self.root.join("package.zip")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE_NAME)
    }

    pub fn file_ledger_path(&self) -> PathBuf {
        self.root.join("files.ledger")
    }

    pub fn registry_ledger_path(&self) -> PathBuf {
        self.root.join("registry.ledger")
    }

    pub fn handoff_path(&self) -> PathBuf {
        self.root.join("handoff.bin")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for class in TargetClass::install_classes() {
            let dir = self.class_dir(class);
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        for dir in [self.temp_dir(), self.backup_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Removes everything staged for this attempt except the downloaded
    /// archive and the manifest, so a retry can start over at extraction
    /// without downloading again.
    pub fn gut_for_retry(&self) -> Result<()> {
        for class in TargetClass::install_classes() {
            remove_dir_if_present(&self.class_dir(class))?;
        }
        remove_dir_if_present(&self.temp_dir())?;
        remove_dir_if_present(&self.backup_dir())?;
        for path in [self.file_ledger_path(), self.registry_ledger_path()] {
            remove_file_if_present(&path)?;
        }
        Ok(())
    }

    /// Removes the whole scratch tree.
    pub fn purge(&self) -> Result<()> {
        remove_dir_if_present(&self.root)
    }
}

fn remove_dir_if_present(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}

fn remove_file_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}
