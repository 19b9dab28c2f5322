use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use zip::ZipArchive;

use replift_core::UpdateManifest;

use crate::types::{CancelFlag, ProgressSink, StageOutcome};

const COPY_CHUNK: usize = 8 * 1024;

/// Streams the downloaded archive into the scratch tree. Entries carry
/// class-tagged relative paths, so they land directly in the staging
/// subtrees. Cancellation is polled between entries and between chunks
/// of large entries; a cancelled extraction may leave a partial file,
/// which the scratch purge removes.
pub fn extract_archive(
    archive_path: &Path,
    dest_root: &Path,
    cancel: &CancelFlag,
    progress: &dyn ProgressSink,
) -> Result<StageOutcome> {
    let file = fs::File::open(archive_path)
        .with_context(|| format!("failed to open archive: {}", archive_path.display()))?;
    let mut archive = ZipArchive::new(file)
        .with_context(|| format!("failed to read archive: {}", archive_path.display()))?;

    let total = archive.len();
    for index in 0..total {
        if cancel.is_cancelled() {
            return Ok(StageOutcome::Cancelled);
        }

        let mut entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read archive entry {index}"))?;
        let Some(relative) = entry.enclosed_name() else {
            // entry escapes the destination root, skip it
            continue;
        };
        let out_path = dest_root.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)
                .with_context(|| format!("failed to create {}", out_path.display()))?;
        } else {
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let mut out = fs::File::create(&out_path)
                .with_context(|| format!("failed to create {}", out_path.display()))?;

            let mut chunk = [0u8; COPY_CHUNK];
            loop {
                if cancel.is_cancelled() {
                    return Ok(StageOutcome::Cancelled);
                }
                let read = entry
                    .read(&mut chunk)
                    .with_context(|| format!("failed to extract {}", out_path.display()))?;
                if read == 0 {
                    break;
                }
                out.write_all(&chunk[..read])
                    .with_context(|| format!("failed to write {}", out_path.display()))?;
            }
            out.flush()
                .with_context(|| format!("failed to flush {}", out_path.display()))?;

            if let Some(modified) = entry.last_modified().and_then(dos_datetime_to_system_time) {
                out.set_modified(modified)
                    .with_context(|| format!("failed to set mtime on {}", out_path.display()))?;
            }

            #[cfg(unix)]
            if let Some(mode) = entry.unix_mode() {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&out_path, fs::Permissions::from_mode(mode))
                    .with_context(|| format!("failed to set mode on {}", out_path.display()))?;
            }
        }

        let percent = ((index + 1) * 100 / total.max(1)) as i32;
        progress.report(percent, &format!("extracting {}", entry.name()));
    }

    Ok(StageOutcome::Completed)
}

/// Loads the manifest from the extracted tree if one was shipped.
/// Archives without a manifest carry files only.
pub fn load_manifest(path: &Path) -> Result<Option<UpdateManifest>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read manifest: {}", path.display()));
        }
    };
    let manifest = UpdateManifest::from_toml_str(&raw)
        .with_context(|| format!("failed to parse manifest: {}", path.display()))?;
    Ok(Some(manifest))
}

/// Zip timestamps are local-time DOS fields with two-second resolution.
/// They are mapped onto the unix epoch as if they were UTC, which keeps
/// round trips through our own archives exact.
fn dos_datetime_to_system_time(dt: zip::DateTime) -> Option<SystemTime> {
    let days = days_from_civil(i64::from(dt.year()), u32::from(dt.month()), u32::from(dt.day()));
    let seconds = days.checked_mul(86_400)?
        + i64::from(dt.hour()) * 3_600
        + i64::from(dt.minute()) * 60
        + i64::from(dt.second());
    u64::try_from(seconds)
        .ok()
        .map(|secs| UNIX_EPOCH + Duration::from_secs(secs))
}

// Howard Hinnant's days-from-civil algorithm.
fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = i64::from((month + 9) % 12);
    let doy = (153 * mp + 2) / 5 + i64::from(day) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}
