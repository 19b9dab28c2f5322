use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;

/// A running process whose executable image could be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: i32,
    pub exe: PathBuf,
}

/// Why a process could not be probed. Access denial is kept distinct:
/// a process we cannot see may still hold one of our files open, and
/// callers surface that instead of silently treating it as absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("access denied")]
    AccessDenied,
    #[error("unreadable")]
    Unreadable,
}

/// Probes every visible process, yielding one result per pid.
pub fn probe_processes() -> Result<Vec<(i32, Result<ProcessInfo, ProbeError>)>> {
    let entries = fs::read_dir("/proc").context("failed to list /proc")?;
    let mut probes = Vec::new();

    for entry in entries {
        let entry = entry.context("failed to list /proc")?;
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        else {
            continue;
        };

        let probe = match fs::read_link(entry.path().join("exe")) {
            Ok(exe) => Ok(ProcessInfo { pid, exe }),
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                Err(ProbeError::AccessDenied)
            }
            Err(_) => Err(ProbeError::Unreadable),
        };
        probes.push((pid, probe));
    }

    Ok(probes)
}

/// Finds processes whose executable image is one of the given paths.
/// Matching is case-insensitive; the calling process is excluded.
pub fn processes_using(paths: &[PathBuf]) -> Result<Vec<ProcessInfo>> {
    let own_pid = std::process::id() as i32;
    let wanted: Vec<String> = paths
        .iter()
        .map(|path| path.to_string_lossy().to_lowercase())
        .collect();

    let mut hits = Vec::new();
    for (pid, probe) in probe_processes()? {
        if pid == own_pid {
            continue;
        }
        let Ok(info) = probe else {
            continue;
        };
        let exe = info.exe.to_string_lossy().to_lowercase();
        if wanted.iter().any(|path| *path == exe) {
            hits.push(info);
        }
    }
    Ok(hits)
}

/// Verifies nothing is running the given images. Matches are never
/// signalled here: they travel out through the error so the caller can
/// tell the user which programs to close, and the run fails before
/// anything gets overwritten under a live process.
pub fn ensure_not_running(paths: &[PathBuf]) -> Result<()> {
    let running = processes_using(paths)?;
    if running.is_empty() {
        return Ok(());
    }

    let names: Vec<String> = running
        .iter()
        .map(|info| format!("{} (pid {})", info.exe.display(), info.pid))
        .collect();
    Err(anyhow!(
        "files about to be replaced are in use by: {}",
        names.join(", ")
    ))
}

/// Force-kills everything running the given image. Used during
/// self-update takeover only, where the old client must die; failures
/// are swallowed since the processes may already be gone.
pub fn kill_processes_at(path: &Path) {
    let Ok(hits) = processes_using(std::slice::from_ref(&path.to_path_buf())) else {
        return;
    };
    if hits.is_empty() {
        return;
    }
    for info in hits {
        let _ = signal::kill(Pid::from_raw(info.pid), Signal::SIGKILL);
    }
    thread::sleep(Duration::from_millis(200));
}
