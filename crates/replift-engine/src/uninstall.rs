use std::fs;
use std::path::Path;

use anyhow::Result;

use replift_core::InstallTargets;

use crate::execute::BinaryOptimizer;
use crate::registry::{self, RegistryStore};
use crate::record::UninstallData;
use crate::types::{ProgressSink, UpdateError};

/// Removes everything the updates installed, in the fixed order files,
/// then folders, then registry. Individual removals are best-effort: a
/// file already gone or a folder still holding user data never aborts
/// the uninstall.
pub fn run_uninstall(
    data_path: &Path,
    state_path: &Path,
    targets: &InstallTargets,
    scratch: &Path,
    store: &mut dyn RegistryStore,
    optimizer: &dyn BinaryOptimizer,
    progress: &dyn ProgressSink,
) -> Result<(), UpdateError> {
    let Some(data) = UninstallData::load(data_path)? else {
        // nothing recorded, nothing to remove
        return Ok(());
    };

    let total = data.files.len().max(1);
    for (index, file) in data.files.iter().enumerate() {
        let Some(path) = targets.resolve(scratch, &file.path) else {
            continue;
        };
        if file.deoptimize && path.is_file() {
            let _ = optimizer.deoptimize(&path);
        }
        let _ = fs::remove_file(&path);
        progress.report(
            ((index + 1) * 100 / total) as i32,
            &format!("removed {}", file.path),
        );
    }

    // reverse order so nested folders go before their parents; only
    // empty folders are removed
    for tagged in data.folders.iter().rev() {
        let Some(path) = targets.resolve(scratch, tagged) else {
            continue;
        };
        let _ = fs::remove_dir(&path);
    }

    for op in &data.registry {
        let _ = registry::apply_op(store, op);
    }

    let _ = fs::remove_file(data_path);
    let _ = fs::remove_file(state_path);
    progress.report(100, "uninstall complete");
    Ok(())
}
