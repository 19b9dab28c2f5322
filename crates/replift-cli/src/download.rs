use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use replift_core::sha256_hex_of_file;
use replift_engine::{CancelFlag, ProgressSink, StageOutcome};

const DOWNLOAD_CHUNK: usize = 64 * 1024;

/// Downloads one update package, trying each mirror in order. The
/// payload streams into a `.part` file that is renamed into place only
/// after the digest checks out, so an interrupted download never leaves
/// a plausible-looking archive behind.
pub fn download_package(
    urls: &[String],
    expected_sha256: &str,
    dest: &Path,
    cancel: &CancelFlag,
    progress: &dyn ProgressSink,
) -> Result<StageOutcome> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let part_path = dest.with_file_name(format!(
        "{}.part",
        dest.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("package")
    ));

    let mut last_error = anyhow!("no mirrors configured");
    for url in urls {
        match fetch_to_part(url, &part_path, cancel, progress) {
            Ok(StageOutcome::Cancelled) => {
                let _ = fs::remove_file(&part_path);
                return Ok(StageOutcome::Cancelled);
            }
            Ok(StageOutcome::Completed) => {
                let actual = sha256_hex_of_file(&part_path)?;
                if !actual.eq_ignore_ascii_case(expected_sha256) {
                    let _ = fs::remove_file(&part_path);
                    last_error = anyhow!(
                        "digest mismatch from {url}: expected {expected_sha256}, got {actual}"
                    );
                    continue;
                }
                if dest.exists() {
                    fs::remove_file(dest)
                        .with_context(|| format!("failed to replace {}", dest.display()))?;
                }
                fs::rename(&part_path, dest).with_context(|| {
                    format!("failed to move download into place: {}", dest.display())
                })?;
                return Ok(StageOutcome::Completed);
            }
            Err(err) => {
                let _ = fs::remove_file(&part_path);
                last_error = err;
            }
        }
    }

    Err(last_error.context("all mirrors failed"))
}

fn fetch_to_part(
    url: &str,
    part_path: &Path,
    cancel: &CancelFlag,
    progress: &dyn ProgressSink,
) -> Result<StageOutcome> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .context("failed to build http client")?;

    let response = client
        .get(url)
        .send()
        .with_context(|| format!("request to {url} failed"))?
        .error_for_status()
        .with_context(|| format!("request to {url} failed"))?;

    let total = response.content_length().unwrap_or(0);
    let mut reader = response;
    let mut out = fs::File::create(part_path)
        .with_context(|| format!("failed to create {}", part_path.display()))?;

    let mut received = 0u64;
    let mut chunk = [0u8; DOWNLOAD_CHUNK];
    loop {
        if cancel.is_cancelled() {
            // -1 marks the teardown window between the request and the
            // cancelled outcome
            progress.report(-1, "cancelling");
            return Ok(StageOutcome::Cancelled);
        }
        let read = reader
            .read(&mut chunk)
            .with_context(|| format!("download from {url} failed"))?;
        if read == 0 {
            break;
        }
        out.write_all(&chunk[..read])
            .with_context(|| format!("failed to write {}", part_path.display()))?;
        received += read as u64;

        // without a content length there is no denominator; hold the
        // bar at the start instead of overloading the cancel marker
        let percent = if total > 0 {
            (received * 100 / total) as i32
        } else {
            0
        };
        progress.report(percent, &format!("downloading from {url}"));
    }
    out.flush()
        .with_context(|| format!("failed to flush {}", part_path.display()))?;

    Ok(StageOutcome::Completed)
}

/// Fetches the catalog, from a mirror or straight off the filesystem.
pub fn fetch_catalog(location: &str, cache_path: &Path) -> Result<String> {
    if location.starts_with("http://") || location.starts_with("https://") {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build http client")?;
        let raw = client
            .get(location)
            .send()
            .with_context(|| format!("request to {location} failed"))?
            .error_for_status()
            .with_context(|| format!("request to {location} failed"))?
            .text()
            .with_context(|| format!("failed to read catalog from {location}"))?;

        if let Some(parent) = cache_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(cache_path, &raw)
            .with_context(|| format!("failed to cache catalog: {}", cache_path.display()))?;
        Ok(raw)
    } else {
        fs::read_to_string(location)
            .with_context(|| format!("failed to read catalog: {location}"))
    }
}
