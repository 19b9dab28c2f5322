use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

use replift_core::{split_tagged, InstallTargets, RegHive, TargetClass, UpdateManifest};

use crate::execute::BinaryOptimizer;
use crate::files::copy_with_times;
use crate::layout::ScratchLayout;
use crate::process;
use crate::types::UpdateError;

const HANDOFF_VERSION: u8 = 1;

const TAG_STATE_PATH: u8 = 0x01;
const TAG_CATALOG_PATH: u8 = 0x02;
const TAG_CLIENT_CATALOG_PATH: u8 = 0x03;
const TAG_BASE_DIR: u8 = 0x04;
const TAG_SCRATCH_DIR: u8 = 0x05;
const TAG_CURRENT_EXE: u8 = 0x06;
const TAG_WILL_SELF_UPDATE: u8 = 0x07;
const TAG_NEEDS_ELEVATION: u8 = 0x08;
const TAG_CATALOG_OVERRIDE: u8 = 0x09;
const TAG_END: u8 = 0xFF;

/// Everything a relaunched client needs to pick the update back up:
/// where the run's state lives, which executable started it, and why it
/// was relaunched. Written before handing control to the new or
/// elevated process, consumed exactly once on resume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfUpdateHandoff {
    pub state_path: PathBuf,
    pub catalog_path: PathBuf,
    pub client_catalog_path: Option<PathBuf>,
    pub base_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub current_exe: PathBuf,
    pub will_self_update: bool,
    pub needs_elevation: bool,
    pub catalog_override: Option<String>,
}

impl SelfUpdateHandoff {
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut out = Vec::new();
        out.push(HANDOFF_VERSION);
        write_path_field(&mut out, TAG_STATE_PATH, &self.state_path);
        write_path_field(&mut out, TAG_CATALOG_PATH, &self.catalog_path);
        if let Some(client_catalog) = &self.client_catalog_path {
            write_path_field(&mut out, TAG_CLIENT_CATALOG_PATH, client_catalog);
        }
        write_path_field(&mut out, TAG_BASE_DIR, &self.base_dir);
        write_path_field(&mut out, TAG_SCRATCH_DIR, &self.scratch_dir);
        write_path_field(&mut out, TAG_CURRENT_EXE, &self.current_exe);
        write_bool_field(&mut out, TAG_WILL_SELF_UPDATE, self.will_self_update);
        write_bool_field(&mut out, TAG_NEEDS_ELEVATION, self.needs_elevation);
        if let Some(catalog_override) = &self.catalog_override {
            write_string_field(&mut out, TAG_CATALOG_OVERRIDE, catalog_override);
        }
        out.push(TAG_END);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = fs::File::create(path)
            .with_context(|| format!("failed to write handoff: {}", path.display()))?;
        file.write_all(&out)
            .with_context(|| format!("failed to write handoff: {}", path.display()))?;
        file.flush()
            .with_context(|| format!("failed to flush handoff: {}", path.display()))?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let raw = fs::read(path)
            .with_context(|| format!("failed to read handoff: {}", path.display()))?;
        Self::decode(&raw).with_context(|| format!("invalid handoff file: {}", path.display()))
    }

    /// Reads the handoff and removes it. A handoff drives exactly one
    /// resumption; a stale file must never restart an old run.
    pub fn consume(path: &Path) -> Result<Self> {
        let handoff = Self::read(path)?;
        fs::remove_file(path)
            .with_context(|| format!("failed to remove handoff: {}", path.display()))?;
        Ok(handoff)
    }

    fn decode(raw: &[u8]) -> Result<Self> {
        let mut reader = io::Cursor::new(raw);
        let mut version = [0u8; 1];
        reader
            .read_exact(&mut version)
            .context("handoff is empty")?;
        if version[0] != HANDOFF_VERSION {
            return Err(anyhow!("unsupported handoff version: {}", version[0]));
        }

        let mut state_path = None;
        let mut catalog_path = None;
        let mut client_catalog_path = None;
        let mut base_dir = None;
        let mut scratch_dir = None;
        let mut current_exe = None;
        let mut will_self_update = false;
        let mut needs_elevation = false;
        let mut catalog_override = None;

        loop {
            let mut tag = [0u8; 1];
            reader
                .read_exact(&mut tag)
                .context("handoff is truncated before its end marker")?;
            match tag[0] {
                TAG_END => break,
                TAG_STATE_PATH => state_path = Some(PathBuf::from(read_string(&mut reader)?)),
                TAG_CATALOG_PATH => catalog_path = Some(PathBuf::from(read_string(&mut reader)?)),
                TAG_CLIENT_CATALOG_PATH => {
                    client_catalog_path = Some(PathBuf::from(read_string(&mut reader)?));
                }
                TAG_BASE_DIR => base_dir = Some(PathBuf::from(read_string(&mut reader)?)),
                TAG_SCRATCH_DIR => scratch_dir = Some(PathBuf::from(read_string(&mut reader)?)),
                TAG_CURRENT_EXE => current_exe = Some(PathBuf::from(read_string(&mut reader)?)),
                TAG_WILL_SELF_UPDATE => will_self_update = read_bool(&mut reader)?,
                TAG_NEEDS_ELEVATION => needs_elevation = read_bool(&mut reader)?,
                TAG_CATALOG_OVERRIDE => catalog_override = Some(read_string(&mut reader)?),
                other => return Err(anyhow!("unknown handoff field tag: {other:#04x}")),
            }
        }

        Ok(Self {
            state_path: state_path.ok_or_else(|| anyhow!("handoff is missing its state path"))?,
            catalog_path: catalog_path
                .ok_or_else(|| anyhow!("handoff is missing its catalog path"))?,
            client_catalog_path,
            base_dir: base_dir.ok_or_else(|| anyhow!("handoff is missing its base dir"))?,
            scratch_dir: scratch_dir
                .ok_or_else(|| anyhow!("handoff is missing its scratch dir"))?,
            current_exe: current_exe
                .ok_or_else(|| anyhow!("handoff is missing its client executable"))?,
            will_self_update,
            needs_elevation,
            catalog_override,
        })
    }
}

fn write_string_field(out: &mut Vec<u8>, tag: u8, value: &str) {
    out.push(tag);
    out.extend_from_slice(&(value.len() as u32).to_le_bytes());
    out.extend_from_slice(value.as_bytes());
}

fn write_path_field(out: &mut Vec<u8>, tag: u8, value: &Path) {
    write_string_field(out, tag, &value.to_string_lossy());
}

fn write_bool_field(out: &mut Vec<u8>, tag: u8, value: bool) {
    out.push(tag);
    out.push(u8::from(value));
}

fn read_string<R: Read>(reader: &mut R) -> Result<String> {
    let mut len = [0u8; 4];
    reader
        .read_exact(&mut len)
        .context("handoff string field is truncated")?;
    let mut data = vec![0u8; u32::from_le_bytes(len) as usize];
    reader
        .read_exact(&mut data)
        .context("handoff string field is truncated")?;
    String::from_utf8(data).context("handoff string field is not valid utf-8")
}

fn read_bool<R: Read>(reader: &mut R) -> Result<bool> {
    let mut value = [0u8; 1];
    reader
        .read_exact(&mut value)
        .context("handoff bool field is truncated")?;
    Ok(value[0] != 0)
}

/// True when applying this manifest needs privileges a normal user
/// lacks: system-class file operations or registry writes outside the
/// current user's hive.
pub fn requires_privilege(manifest: &UpdateManifest) -> bool {
    let system_files = manifest
        .files
        .iter()
        .any(|file| matches!(split_tagged(&file.path), Some((TargetClass::System, _))));
    let machine_registry = manifest
        .registry
        .iter()
        .any(|op| op.hive != RegHive::CurrentUser);
    system_files || machine_registry
}

/// Whether this process already runs with effective root.
pub fn is_elevated() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Locates the replacement client executable in the staged base tree.
/// A manifest entry flagged as the managed client wins; otherwise the
/// staging tree must contain exactly one top-level executable.
pub fn find_new_client(
    manifest: Option<&UpdateManifest>,
    staged_base: &Path,
) -> Result<PathBuf, UpdateError> {
    if let Some(manifest) = manifest {
        for file in manifest.files.iter().filter(|file| file.managed_assembly) {
            if let Some((TargetClass::Base, rest)) = split_tagged(&file.path) {
                let candidate: PathBuf = staged_base.join(
                    rest.split(['/', '\\'])
                        .filter(|s| !s.is_empty())
                        .collect::<PathBuf>(),
                );
                if candidate.is_file() {
                    return Ok(candidate);
                }
            }
        }
    }

    let entries = fs::read_dir(staged_base)
        .map_err(|_| UpdateError::SelfClientMissing {
            search_root: staged_base.to_path_buf(),
        })?;

    let mut executables = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() && is_executable(&path) {
            executables.push(path);
        }
    }

    match executables.as_slice() {
        [only] => Ok(only.clone()),
        _ => Err(UpdateError::SelfClientMissing {
            search_root: staged_base.to_path_buf(),
        }),
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("exe"))
        .unwrap_or(false)
}

/// Replaces the running client executable with the staged one. Any
/// other process still running the old image is killed first so the
/// copy cannot race a live instance.
pub fn install_new_client(
    new_client: &Path,
    current_exe: &Path,
    optimizer: &dyn BinaryOptimizer,
) -> Result<()> {
    process::kill_processes_at(current_exe);
    copy_with_times(new_client, current_exe)?;
    optimizer.optimize(current_exe)?;
    Ok(())
}

/// Deletes a stray staged copy of the running client so the file
/// install cannot overwrite the executable mid-update. Every class
/// whose root contains the executable is checked. Self-update replaces
/// the client through its own path, never through the mirror.
pub fn delete_stray_client(layout: &ScratchLayout, targets: &InstallTargets, current_exe: &Path) {
    for class in TargetClass::install_classes() {
        let Some(root) = targets.root(class) else {
            continue;
        };
        let Ok(relative) = current_exe.strip_prefix(root) else {
            continue;
        };
        let stray = layout.class_dir(class).join(relative);
        if stray.is_file() {
            let _ = fs::remove_file(&stray);
        }
    }
}
