use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

/// Failure taxonomy for an update run. Anything without a dedicated
/// variant travels as `Other` with its anyhow context chain intact.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(
        "patched file {path} failed verification: expected crc32 {expected:#010x}, got {actual:#010x}"
    )]
    PatchChecksum {
        path: PathBuf,
        expected: u32,
        actual: u32,
    },
    #[error("cannot patch {path}: the installed original is missing")]
    PatchSourceMissing { path: PathBuf },
    #[error("no replacement client executable found under {search_root}")]
    SelfClientMissing { search_root: PathBuf },
    #[error("update requires elevated privileges and the elevated relaunch did not gain them")]
    ElevationRejected,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl UpdateError {
    /// Patch failures get a softer cleanup than other errors: the
    /// downloaded archive and manifest survive so a retry can skip the
    /// download, or fall back to a full-install package.
    pub fn is_patch_failure(&self) -> bool {
        matches!(
            self,
            UpdateError::PatchChecksum { .. } | UpdateError::PatchSourceMissing { .. }
        )
    }
}

/// How a single stage finished. Cancellation is a normal outcome, never
/// an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Completed,
    Cancelled,
}

/// Final outcome of a full update run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Completed,
    Cancelled,
    /// The run stopped before mutating anything because it needs
    /// privileges it does not have. The caller relaunches elevated with
    /// the handoff file and resumes.
    ElevationRequired { handoff_path: PathBuf },
    /// A finished client self-update handed control to this process.
    /// The caller starts the product update over from the catalog
    /// check.
    RestartUpdate { catalog_override: Option<String> },
}

/// Shared cancellation flag. Stage loops poll it between files and
/// between chunks of large files.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Receives progress reports from the engine. `percent` is 0..=100, or
/// -1 when the stage cannot estimate completion. Sinks are shared with
/// the worker thread driving the stages, hence `Sync`.
pub trait ProgressSink: Sync {
    fn report(&self, percent: i32, message: &str);
}

/// Sink that discards everything. Used by callers that only want the
/// outcome.
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn report(&self, _percent: i32, _message: &str) {}
}
