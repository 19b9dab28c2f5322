use std::fs;
use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result};

use replift_core::{split_tagged, InstallTargets, ShortcutSpec, TargetClass, UpdateManifest};

use crate::files::copy_with_times;
use crate::layout::ScratchLayout;
use crate::ledger::{self, FileLedgerEntry};

/// Undoes every destination-tree mutation recorded for this attempt:
/// created files and directories are removed in reverse order, then the
/// backup tree is copied back over the targets. Reads only persisted
/// state, so it works identically from the failing process or from a
/// fresh one after a crash.
pub fn rollback_files(layout: &ScratchLayout, targets: &InstallTargets) -> Result<()> {
    let ledger_path = layout.file_ledger_path();
    let entries = ledger::read_file_entries(&ledger_path)?;

    for entry in entries.iter().rev() {
        match entry {
            FileLedgerEntry::CreatedFile(path) => match fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to remove {}", path.display()));
                }
            },
            FileLedgerEntry::CreatedDir(path) => match fs::remove_dir_all(path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to remove {}", path.display()));
                }
            },
        }
    }

    for class in TargetClass::install_classes() {
        let backup = layout.backup_dir().join(class.as_str());
        if !backup.is_dir() {
            continue;
        }
        let Some(dst) = targets.root(class) else {
            continue;
        };
        copy_tree(&backup, dst)?;
    }

    match fs::remove_file(&ledger_path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => {
            Err(err).with_context(|| format!("failed to remove {}", ledger_path.display()))
        }
    }
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;
    let entries =
        fs::read_dir(src).with_context(|| format!("failed to list {}", src.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to list {}", src.display()))?;
        let src_child = entry.path();
        let dst_child = dst.join(entry.file_name());
        let file_type = entry
            .file_type()
            .with_context(|| format!("failed to stat {}", src_child.display()))?;
        if file_type.is_dir() {
            copy_tree(&src_child, &dst_child)?;
        } else if file_type.is_file() {
            copy_with_times(&src_child, &dst_child)?;
        }
    }
    Ok(())
}

/// Removes delete-flagged files from the installation, copying each one
/// into the backup tree first so rollback can bring it back.
pub fn delete_flagged_files(
    manifest: &UpdateManifest,
    targets: &InstallTargets,
    layout: &ScratchLayout,
) -> Result<()> {
    for file in manifest.files.iter().filter(|file| file.delete) {
        let Some((class, rest)) = split_tagged(&file.path) else {
            continue;
        };
        if class == TargetClass::Temp {
            continue;
        }
        let Some(installed) = targets.resolve(layout.root(), &file.path) else {
            continue;
        };
        if !installed.is_file() {
            continue;
        }

        let backup = layout
            .backup_dir()
            .join(class.as_str())
            .join(normalized(rest));
        copy_with_times(&installed, &backup)?;
        fs::remove_file(&installed)
            .with_context(|| format!("failed to remove {}", installed.display()))?;
    }
    Ok(())
}

/// Deletes folders the new version no longer uses, in reverse manifest
/// order so nested entries go before their parents. Only start-menu
/// folders are removed recursively; everywhere else a non-empty folder
/// is left alone. Each folder is copied into the backup tree before it
/// goes, so rollback recreates it exactly.
pub fn remove_obsolete_folders(
    manifest: &UpdateManifest,
    targets: &InstallTargets,
    layout: &ScratchLayout,
) -> Result<()> {
    for tagged in manifest.obsolete_folders.iter().rev() {
        let Some((class, rest)) = split_tagged(tagged) else {
            continue;
        };
        if class == TargetClass::Temp {
            continue;
        }
        let Some(path) = targets.resolve(layout.root(), tagged) else {
            continue;
        };
        // refuse to delete a class root itself
        if targets.root(class) == Some(path.as_path()) {
            continue;
        }
        if !path.is_dir() {
            continue;
        }

        let backup = layout
            .backup_dir()
            .join(class.as_str())
            .join(normalized(rest));
        copy_tree(&path, &backup)?;

        if class == TargetClass::CommonStartMenu {
            let _ = fs::remove_dir_all(&path);
        } else {
            let _ = fs::remove_dir(&path);
        }
    }
    Ok(())
}

/// Shell integration seam: shortcut creation and icon-cache refresh.
/// The default writes shortcut files directly; a desktop-native backend
/// plugs in here.
pub trait ShellOps: Sync {
    fn write_shortcut(&self, path: &Path, spec: &ShortcutSpec) -> Result<()>;
    fn refresh_icons(&self) -> Result<()>;
}

/// Writes shortcuts as plain link files with `key=value` records.
pub struct FsShellOps;

impl ShellOps for FsShellOps {
    fn write_shortcut(&self, path: &Path, spec: &ShortcutSpec) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut out = String::new();
        out.push_str(&format!("target={}\n", spec.target));
        if let Some(working_dir) = &spec.working_dir {
            out.push_str(&format!("working_dir={working_dir}\n"));
        }
        if let Some(args) = &spec.args {
            out.push_str(&format!("args={args}\n"));
        }
        if let Some(description) = &spec.description {
            out.push_str(&format!("description={description}\n"));
        }
        if let Some(icon) = &spec.icon {
            out.push_str(&format!("icon={icon}\n"));
        }

        let mut file = fs::File::create(path)
            .with_context(|| format!("failed to write shortcut: {}", path.display()))?;
        file.write_all(out.as_bytes())
            .with_context(|| format!("failed to write shortcut: {}", path.display()))?;
        file.flush()
            .with_context(|| format!("failed to flush shortcut: {}", path.display()))?;
        Ok(())
    }

    fn refresh_icons(&self) -> Result<()> {
        Ok(())
    }
}

/// Creates the manifest's shortcuts. Desktop and start-menu shortcuts a
/// user deleted stay deleted: on upgrades they are only recreated when
/// the previous-shortcut list says they existed before. An empty list
/// means a fresh install, where everything is created. An overwritten
/// shortcut is copied into the backup tree first and a brand new one is
/// journaled, so rollback restores the exact prior state.
pub fn create_shortcuts(
    manifest: &UpdateManifest,
    targets: &InstallTargets,
    layout: &ScratchLayout,
    shell: &dyn ShellOps,
) -> Result<()> {
    let ledger_path = layout.file_ledger_path();
    for spec in &manifest.shortcuts {
        let Some((class, rest)) = split_tagged(&spec.path) else {
            continue;
        };
        let wanted = match class {
            TargetClass::CommonDesktop => {
                shortcut_wanted(&spec.path, &manifest.previous_desktop_shortcuts)
            }
            TargetClass::CommonStartMenu => {
                shortcut_wanted(&spec.path, &manifest.previous_start_menu_shortcuts)
            }
            _ => true,
        };
        if !wanted {
            continue;
        }
        let Some(path) = targets.resolve(layout.root(), &spec.path) else {
            continue;
        };

        if let Some(root) = targets.root(class) {
            if path.is_file() {
                let backup = layout
                    .backup_dir()
                    .join(class.as_str())
                    .join(normalized(rest));
                copy_with_times(&path, &backup)?;
            } else {
                record_missing_parents(&ledger_path, &path, root)?;
                ledger::append_file_entry(
                    &ledger_path,
                    &FileLedgerEntry::CreatedFile(path.clone()),
                )?;
            }
        }

        let mut resolved = spec.clone();
        if let Some(target) = targets.resolve(layout.root(), &spec.target) {
            resolved.target = target.display().to_string();
        }
        shell.write_shortcut(&path, &resolved)?;
    }
    Ok(())
}

/// Journals every not-yet-existing ancestor of `file` up to the class
/// root, shallowest first, before anything creates them.
fn record_missing_parents(ledger_path: &Path, file: &Path, root: &Path) -> Result<()> {
    let mut missing = Vec::new();
    let mut cursor = file.parent();
    while let Some(dir) = cursor {
        if dir.is_dir() {
            break;
        }
        missing.push(dir.to_path_buf());
        if dir == root {
            break;
        }
        cursor = dir.parent();
    }
    for dir in missing.iter().rev() {
        ledger::append_file_entry(ledger_path, &FileLedgerEntry::CreatedDir(dir.clone()))?;
    }
    Ok(())
}

fn shortcut_wanted(tagged: &str, previous: &[String]) -> bool {
    previous.is_empty() || previous.iter().any(|prev| prev.eq_ignore_ascii_case(tagged))
}

/// A post-update command parsed out of the manifest's command text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostCommand {
    RefreshIcons,
}

/// Parses `$name()` commands from the post-update command text.
/// Unrecognized commands are ignored so newer manifests keep working
/// against older clients.
pub fn parse_command_text(text: &str) -> Vec<PostCommand> {
    let mut commands = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find('$') {
        let tail = &rest[start + 1..];
        let Some(open) = tail.find('(') else {
            break;
        };
        let Some(close) = tail[open..].find(')') else {
            break;
        };
        let name = tail[..open].trim();
        if name.eq_ignore_ascii_case("refreshicons") {
            commands.push(PostCommand::RefreshIcons);
        }
        rest = &tail[open + close + 1..];
    }
    commands
}

/// Runs the parsed post-update commands through the shell seam.
pub fn run_post_commands(manifest: &UpdateManifest, shell: &dyn ShellOps) -> Result<()> {
    for command in parse_command_text(&manifest.post_update_commands) {
        match command {
            PostCommand::RefreshIcons => shell.refresh_icons()?,
        }
    }
    Ok(())
}

fn normalized(rel: &str) -> std::path::PathBuf {
    rel.split(['/', '\\']).filter(|s| !s.is_empty()).collect()
}
