use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use replift_core::{crc32_of_file, decode_delta, InstallTargets, UpdateManifest};

use crate::layout::ScratchLayout;
use crate::types::{CancelFlag, ProgressSink, StageOutcome, UpdateError};

/// Rebuilds every delta-shipped file into the scratch staging tree by
/// applying its delta against the currently installed original, then
/// verifies the result against the manifest checksum. Targets are never
/// touched here; a failed patch leaves the installation untouched and
/// the archive available for a retry or a full-package fallback.
pub fn apply_patches(
    manifest: &UpdateManifest,
    targets: &InstallTargets,
    layout: &ScratchLayout,
    cancel: &CancelFlag,
    progress: &dyn ProgressSink,
) -> Result<StageOutcome, UpdateError> {
    let patched: Vec<_> = manifest
        .files
        .iter()
        .filter(|file| file.delta.is_some())
        .collect();
    let total = patched.len();

    for (index, file) in patched.into_iter().enumerate() {
        if cancel.is_cancelled() {
            return Ok(StageOutcome::Cancelled);
        }

        let delta_tagged = file.delta.as_deref().unwrap_or_default();
        let Some(delta_path) = targets.resolve(layout.root(), delta_tagged) else {
            // unresolvable entries are skipped, matching file install
            continue;
        };
        let Some(installed) = targets.resolve(layout.root(), &file.path) else {
            continue;
        };
        let staged = layout.root().join(normalized(&file.path));

        if !installed.is_file() {
            return Err(UpdateError::PatchSourceMissing { path: installed });
        }

        decode_to_staging(&installed, &delta_path, &staged)?;

        // the staged file inherits the delta's timestamp, like a file
        // shipped whole inherits the archive entry's
        let delta_meta = fs::metadata(&delta_path)
            .with_context(|| format!("failed to stat {}", delta_path.display()))?;
        if let Ok(modified) = delta_meta.modified() {
            let staged_file = fs::File::options()
                .append(true)
                .open(&staged)
                .with_context(|| format!("failed to reopen {}", staged.display()))?;
            staged_file
                .set_modified(modified)
                .with_context(|| format!("failed to set mtime on {}", staged.display()))?;
        }

        let expected = file.target_crc32.unwrap_or_default();
        let actual = crc32_of_file(&staged)?;
        if actual != expected {
            return Err(UpdateError::PatchChecksum {
                path: staged,
                expected,
                actual,
            });
        }

        let percent = ((index + 1) * 100 / total.max(1)) as i32;
        progress.report(percent, &format!("patched {}", file.path));
    }

    // the applied deltas are spent; keep the archive, drop the payloads
    let _ = fs::remove_dir_all(layout.patches_dir());

    Ok(StageOutcome::Completed)
}

fn decode_to_staging(installed: &Path, delta_path: &Path, staged: &Path) -> Result<(), UpdateError> {
    if let Some(parent) = staged.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut original = fs::File::open(installed)
        .with_context(|| format!("failed to open {}", installed.display()))?;
    let mut delta = fs::File::open(delta_path)
        .with_context(|| format!("failed to open {}", delta_path.display()))?;
    let mut out = fs::File::create(staged)
        .with_context(|| format!("failed to create {}", staged.display()))?;

    decode_delta(&mut original, &mut delta, &mut out)
        .with_context(|| format!("failed to apply delta to {}", installed.display()))?;
    Ok(())
}

fn normalized(tagged: &str) -> std::path::PathBuf {
    tagged.split(['/', '\\']).filter(|s| !s.is_empty()).collect()
}
