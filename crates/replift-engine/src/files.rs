use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use walkdir::WalkDir;

use replift_core::{InstallTargets, TargetClass};

use crate::layout::ScratchLayout;
use crate::ledger::{self, FileLedgerEntry};
use crate::types::{CancelFlag, ProgressSink, StageOutcome};

/// Counts the files staged for installation across all class subtrees.
/// Drives the per-file progress denominator.
pub fn count_staged_files(layout: &ScratchLayout) -> u64 {
    let mut total = 0u64;
    for class in TargetClass::install_classes() {
        let dir = layout.class_dir(class);
        if !dir.is_dir() {
            continue;
        }
        total += WalkDir::new(&dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .count() as u64;
    }
    total
}

/// Mirrors every staged class subtree into its install target.
///
/// Files that overwrite an existing destination are backed up first,
/// byte- and mtime-exact; files and directories that did not exist
/// before are journaled to the file ledger before they appear. Either
/// record is durable before the destination changes, so rollback can
/// always restore the exact prior tree.
pub fn install_files(
    layout: &ScratchLayout,
    targets: &InstallTargets,
    cancel: &CancelFlag,
    progress: &dyn ProgressSink,
) -> Result<StageOutcome> {
    let total = count_staged_files(layout).max(1);
    let mut installed = 0u64;
    let ledger_path = layout.file_ledger_path();

    for class in TargetClass::install_classes() {
        let src = layout.class_dir(class);
        if !src.is_dir() || dir_is_empty(&src) {
            continue;
        }
        let Some(dst) = targets.root(class) else {
            continue;
        };
        if !dst.is_dir() {
            // a class root that did not pre-exist is journaled like any
            // other created directory
            ledger::append_file_entry(
                &ledger_path,
                &FileLedgerEntry::CreatedDir(dst.to_path_buf()),
            )?;
            fs::create_dir_all(dst)
                .with_context(|| format!("failed to create {}", dst.display()))?;
        }

        let backup = layout.backup_dir().join(class.as_str());
        let outcome = mirror_tree(
            &src,
            dst,
            Some(&backup),
            &ledger_path,
            cancel,
            progress,
            &mut installed,
            total,
        )?;
        if outcome == StageOutcome::Cancelled {
            return Ok(StageOutcome::Cancelled);
        }
    }

    Ok(StageOutcome::Completed)
}

fn dir_is_empty(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true)
}

#[allow(clippy::too_many_arguments)]
fn mirror_tree(
    src: &Path,
    dst: &Path,
    backup: Option<&Path>,
    ledger_path: &Path,
    cancel: &CancelFlag,
    progress: &dyn ProgressSink,
    installed: &mut u64,
    total: u64,
) -> Result<StageOutcome> {
    let entries =
        fs::read_dir(src).with_context(|| format!("failed to list {}", src.display()))?;

    for entry in entries {
        let entry = entry.with_context(|| format!("failed to list {}", src.display()))?;
        let src_child = entry.path();
        let name = entry.file_name();
        let dst_child = dst.join(&name);

        let file_type = entry
            .file_type()
            .with_context(|| format!("failed to stat {}", src_child.display()))?;

        if file_type.is_dir() {
            let outcome = if dst_child.is_dir() {
                // destination directory already exists: prepare a backup
                // counterpart so overwritten children have somewhere to go
                let backup_child = match backup {
                    Some(backup) => {
                        let backup_child = backup.join(&name);
                        fs::create_dir_all(&backup_child).with_context(|| {
                            format!("failed to create {}", backup_child.display())
                        })?;
                        Some(backup_child)
                    }
                    None => None,
                };
                mirror_tree(
                    &src_child,
                    &dst_child,
                    backup_child.as_deref(),
                    ledger_path,
                    cancel,
                    progress,
                    installed,
                    total,
                )?
            } else {
                // brand new directory: one ledger entry covers the whole
                // subtree, children need no backups
                ledger::append_file_entry(
                    ledger_path,
                    &FileLedgerEntry::CreatedDir(dst_child.clone()),
                )?;
                fs::create_dir(&dst_child)
                    .with_context(|| format!("failed to create {}", dst_child.display()))?;
                mirror_tree(
                    &src_child,
                    &dst_child,
                    None,
                    ledger_path,
                    cancel,
                    progress,
                    installed,
                    total,
                )?
            };
            if outcome == StageOutcome::Cancelled {
                return Ok(StageOutcome::Cancelled);
            }
            continue;
        }

        if !file_type.is_file() {
            continue;
        }

        if cancel.is_cancelled() {
            return Ok(StageOutcome::Cancelled);
        }

        if dst_child.is_file() {
            if let Some(backup) = backup {
                let backup_child = backup.join(&name);
                copy_with_times(&dst_child, &backup_child)?;
            }
        } else {
            ledger::append_file_entry(
                ledger_path,
                &FileLedgerEntry::CreatedFile(dst_child.clone()),
            )?;
        }

        move_file(&src_child, &dst_child)?;

        *installed += 1;
        let percent = (*installed * 100 / total) as i32;
        progress.report(
            percent,
            &format!("installed {}", dst_child.display()),
        );
    }

    Ok(StageOutcome::Completed)
}

/// Copies a file preserving its modification time.
pub fn copy_with_times(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::copy(src, dst)
        .with_context(|| format!("failed to copy {} to {}", src.display(), dst.display()))?;

    let metadata =
        fs::metadata(src).with_context(|| format!("failed to stat {}", src.display()))?;
    if let Ok(modified) = metadata.modified() {
        let file = fs::File::options()
            .append(true)
            .open(dst)
            .with_context(|| format!("failed to reopen {}", dst.display()))?;
        file.set_modified(modified)
            .with_context(|| format!("failed to set mtime on {}", dst.display()))?;
    }
    Ok(())
}

/// Moves a file, falling back to copy-and-delete when the scratch tree
/// and the destination live on different filesystems.
pub fn move_file(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        // rename fails across filesystems; retry as copy-and-delete
        Err(_) => {
            copy_with_times(src, dst)?;
            fs::remove_file(src)
                .with_context(|| format!("failed to remove {}", src.display()))
        }
    }
}
