use std::fs;
use std::io::{self, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use semver::Version;
use serde::{Deserialize, Serialize};

use replift_core::{RegOpKind, RegistryOperation, UpdateManifest};

use crate::ledger;

/// The persisted record of what is installed. Read at startup to decide
/// whether an update applies, rewritten at the commit step of each run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientState {
    pub app_name: String,
    pub version: Version,
}

impl ClientState {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read client state: {}", path.display()));
            }
        };
        let state = toml::from_str(&raw)
            .with_context(|| format!("failed to parse client state: {}", path.display()))?;
        Ok(Some(state))
    }

    pub fn store(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let raw = toml::to_string_pretty(self).context("failed to serialize client state")?;
        fs::write(path, raw)
            .with_context(|| format!("failed to write client state: {}", path.display()))
    }
}

/// One file the uninstaller will remove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UninstallFile {
    /// Class-tagged relative path.
    pub path: String,
    pub deoptimize: bool,
}

/// Everything the uninstall flow needs, written at the commit step by
/// merging the manifest with what this run actually created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UninstallData {
    pub files: Vec<UninstallFile>,
    /// Class-tagged folder paths, in creation order.
    pub folders: Vec<String>,
    /// Operations that remove what the updates wrote to the registry.
    pub registry: Vec<RegistryOperation>,
}

impl UninstallData {
    /// Derives the uninstall records for one update: every installed
    /// (non-deleted) file, the manifest's folders worth removing, and a
    /// registry delete for everything the manifest created.
    pub fn from_manifest(manifest: &UpdateManifest) -> Self {
        let files = manifest
            .files
            .iter()
            .filter(|file| !file.delete)
            .map(|file| UninstallFile {
                path: file.path.clone(),
                deoptimize: file.managed_assembly,
            })
            .collect();

        let registry = manifest
            .registry
            .iter()
            .filter_map(|op| match op.op {
                RegOpKind::CreateValue => Some(RegistryOperation {
                    op: RegOpKind::DeleteValue,
                    hive: op.hive,
                    key: op.key.clone(),
                    value_name: op.value_name.clone(),
                    kind: None,
                    data: Vec::new(),
                }),
                RegOpKind::CreateKey => Some(RegistryOperation {
                    op: RegOpKind::DeleteKey,
                    hive: op.hive,
                    key: op.key.clone(),
                    value_name: None,
                    kind: None,
                    data: Vec::new(),
                }),
                RegOpKind::DeleteValue | RegOpKind::DeleteKey => None,
            })
            .collect();

        Self {
            files,
            folders: Vec::new(),
            registry,
        }
    }

    /// Merges a later update's records into this one. Files and folders
    /// are deduplicated; registry deletes accumulate.
    pub fn merge(&mut self, other: UninstallData) {
        for file in other.files {
            if let Some(existing) = self
                .files
                .iter_mut()
                .find(|existing| existing.path.eq_ignore_ascii_case(&file.path))
            {
                existing.deoptimize |= file.deoptimize;
            } else {
                self.files.push(file);
            }
        }
        for folder in other.folders {
            if !self
                .folders
                .iter()
                .any(|existing| existing.eq_ignore_ascii_case(&folder))
            {
                self.folders.push(folder);
            }
        }
        for op in other.registry {
            if !self.registry.contains(&op) {
                self.registry.push(op);
            }
        }
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read uninstall data: {}", path.display()));
            }
        };

        let mut data = UninstallData::default();
        for line in raw.lines().filter(|line| !line.trim().is_empty()) {
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| anyhow!("invalid uninstall data line: {line}"))?;
            match key {
                "file" => data.files.push(UninstallFile {
                    path: value.to_string(),
                    deoptimize: false,
                }),
                "file_deopt" => data.files.push(UninstallFile {
                    path: value.to_string(),
                    deoptimize: true,
                }),
                "folder" => data.folders.push(value.to_string()),
                "registry" => data.registry.push(ledger::parse_registry_op(value)?),
                other => return Err(anyhow!("unknown uninstall data entry kind: {other}")),
            }
        }
        Ok(Some(data))
    }

    pub fn store(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut out = String::new();
        for file in &self.files {
            let key = if file.deoptimize { "file_deopt" } else { "file" };
            out.push_str(&format!("{key}={}\n", file.path));
        }
        for folder in &self.folders {
            out.push_str(&format!("folder={folder}\n"));
        }
        for op in &self.registry {
            out.push_str(&format!("registry={}\n", ledger::serialize_registry_op(op)));
        }

        let mut file = fs::File::create(path)
            .with_context(|| format!("failed to write uninstall data: {}", path.display()))?;
        file.write_all(out.as_bytes())
            .with_context(|| format!("failed to write uninstall data: {}", path.display()))?;
        file.flush()
            .with_context(|| format!("failed to flush uninstall data: {}", path.display()))?;
        Ok(())
    }
}
