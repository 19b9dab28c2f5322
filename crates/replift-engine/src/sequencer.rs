use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use semver::Version;
use walkdir::WalkDir;

use replift_core::{InstallTargets, TargetClass, UpdateManifest};

use crate::cleanup::{self, ShellOps};
use crate::execute::{self, BinaryOptimizer};
use crate::extract;
use crate::files;
use crate::layout::ScratchLayout;
use crate::patch;
use crate::process;
use crate::record::{ClientState, UninstallData};
use crate::registry::{self, RegistryStore};
use crate::selfupdate::{self, SelfUpdateHandoff};
use crate::types::{CancelFlag, ProgressSink, StageOutcome, UpdateError, UpdateOutcome};

/// The fixed step sequence of an update run. Download steps are driven
/// by the caller before the engine takes over at Extract; they share
/// this enum so progress reporting is uniform across the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStep {
    DownloadClientUpdate,
    SelfUpdate,
    Download,
    Extract,
    ClosingProcesses,
    PreExecute,
    BackingUp,
    ModifyReg,
    OptimizeExecute,
    WriteManifest,
    DeletingTemp,
}

impl UpdateStep {
    pub const ALL: [UpdateStep; 11] = [
        Self::DownloadClientUpdate,
        Self::SelfUpdate,
        Self::Download,
        Self::Extract,
        Self::ClosingProcesses,
        Self::PreExecute,
        Self::BackingUp,
        Self::ModifyReg,
        Self::OptimizeExecute,
        Self::WriteManifest,
        Self::DeletingTemp,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::DownloadClientUpdate => "downloading client update",
            Self::SelfUpdate => "updating client",
            Self::Download => "downloading update",
            Self::Extract => "extracting update",
            Self::ClosingProcesses => "closing running programs",
            Self::PreExecute => "running pre-install programs",
            Self::BackingUp => "backing up and installing files",
            Self::ModifyReg => "updating registry",
            Self::OptimizeExecute => "optimizing and finishing install",
            Self::WriteManifest => "recording installed version",
            Self::DeletingTemp => "cleaning up",
        }
    }

    fn index(self) -> usize {
        Self::ALL
            .iter()
            .position(|step| *step == self)
            .unwrap_or_default()
    }
}

/// Pure transition function over the step sequence. An update without a
/// manifest skips the PreExecute..OptimizeExecute block as a whole; an
/// update whose manifest has no registry operations skips ModifyReg.
pub fn next_step(
    current: UpdateStep,
    has_manifest: bool,
    has_registry_ops: bool,
) -> Option<UpdateStep> {
    use UpdateStep::*;
    let mut next = match current {
        DownloadClientUpdate => Some(SelfUpdate),
        SelfUpdate => Some(Download),
        Download => Some(Extract),
        Extract => Some(ClosingProcesses),
        ClosingProcesses => Some(PreExecute),
        PreExecute => Some(BackingUp),
        BackingUp => Some(ModifyReg),
        ModifyReg => Some(OptimizeExecute),
        OptimizeExecute => Some(WriteManifest),
        WriteManifest => Some(DeletingTemp),
        DeletingTemp => None,
    };
    if next == Some(PreExecute) && !has_manifest {
        next = Some(WriteManifest);
    }
    if next == Some(ModifyReg) && !has_registry_ops {
        next = Some(OptimizeExecute);
    }
    next
}

/// Maps a step plus its internal progress onto the whole run's 0..=100
/// scale.
pub fn overall_percent(step: UpdateStep, substep: i32) -> i32 {
    let total = UpdateStep::ALL.len() as i32;
    let substep = substep.clamp(0, 100);
    (step.index() as i32) * 100 / total + substep / total
}

struct StageProgress<'a> {
    inner: &'a dyn ProgressSink,
    step: UpdateStep,
}

impl ProgressSink for StageProgress<'_> {
    fn report(&self, percent: i32, message: &str) {
        self.inner
            .report(overall_percent(self.step, percent.max(0)), message);
    }
}

/// What to do with the scratch tree when a delta patch fails. Product
/// updates keep the archive and manifest so a retry can skip the
/// download; client self-updates drop the manifest too, forcing a clean
/// full-package attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchFailurePolicy {
    PreserveForRetry,
    DropManifest,
}

/// Everything fixed for the duration of one update run.
#[derive(Debug, Clone)]
pub struct UpdateContext {
    pub app_name: String,
    pub new_version: Version,
    pub layout: ScratchLayout,
    pub targets: InstallTargets,
    pub state_path: PathBuf,
    pub uninstall_data_path: PathBuf,
    pub catalog_path: PathBuf,
    pub current_exe: PathBuf,
}

/// Drives an update from the extracted-archive point through commit,
/// rolling back on failure and unwinding cleanly on cancellation.
pub struct UpdateSequencer<'a> {
    ctx: UpdateContext,
    store: &'a mut dyn RegistryStore,
    optimizer: &'a dyn BinaryOptimizer,
    shell: &'a dyn ShellOps,
    cancel: CancelFlag,
    patch_policy: PatchFailurePolicy,
    assume_elevated: bool,
}

impl<'a> UpdateSequencer<'a> {
    pub fn new(
        ctx: UpdateContext,
        store: &'a mut dyn RegistryStore,
        optimizer: &'a dyn BinaryOptimizer,
        shell: &'a dyn ShellOps,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            ctx,
            store,
            optimizer,
            shell,
            cancel,
            patch_policy: PatchFailurePolicy::PreserveForRetry,
            assume_elevated: false,
        }
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Runs a product update. The archive must already be at the
    /// layout's archive path.
    pub fn run(&mut self, sink: &dyn ProgressSink) -> Result<UpdateOutcome, UpdateError> {
        self.run_from(UpdateStep::Extract, sink)
    }

    /// Picks an interrupted run back up from its handoff file. The
    /// handoff is consumed; a second resume with the same file fails.
    pub fn resume(
        &mut self,
        handoff_path: &Path,
        sink: &dyn ProgressSink,
    ) -> Result<UpdateOutcome, UpdateError> {
        let handoff = SelfUpdateHandoff::read(handoff_path)?;
        if handoff.needs_elevation && !self.assume_elevated && !selfupdate::is_elevated() {
            // leave the handoff in place for an elevated retry
            return Err(UpdateError::ElevationRejected);
        }
        let handoff = SelfUpdateHandoff::consume(handoff_path)?;
        self.assume_elevated = true;

        if handoff.will_self_update {
            // the old client already replaced this executable; the
            // product update starts over from the catalog
            Ok(UpdateOutcome::RestartUpdate {
                catalog_override: handoff.catalog_override,
            })
        } else {
            self.run_from(UpdateStep::ClosingProcesses, sink)
        }
    }

    /// Replaces the running client with the one in the downloaded
    /// client package, then removes the staging tree. No rollback: a
    /// failed client swap leaves the old client in place.
    pub fn run_client_update(
        &mut self,
        sink: &dyn ProgressSink,
    ) -> Result<UpdateOutcome, UpdateError> {
        self.patch_policy = PatchFailurePolicy::DropManifest;

        sink.report(
            overall_percent(UpdateStep::SelfUpdate, 0),
            UpdateStep::SelfUpdate.label(),
        );

        let manifest = match self.run_extract_stage(sink) {
            Ok(Some(manifest)) => manifest,
            Ok(None) => return Ok(UpdateOutcome::Cancelled),
            Err(err) => {
                self.cleanup_after_error(&err);
                return Err(err);
            }
        };
        // the client package's manifest is spent once loaded; a retry
        // after a failure here must start from a fresh package
        let _ = fs::remove_file(self.ctx.layout.manifest_path());

        let staged_base = self.ctx.layout.class_dir(TargetClass::Base);
        let new_client = selfupdate::find_new_client(manifest.as_ref(), &staged_base)?;
        selfupdate::install_new_client(&new_client, &self.ctx.current_exe, self.optimizer)?;

        self.ctx.layout.purge()?;
        sink.report(100, "client updated");
        Ok(UpdateOutcome::Completed)
    }

    fn run_from(
        &mut self,
        start: UpdateStep,
        sink: &dyn ProgressSink,
    ) -> Result<UpdateOutcome, UpdateError> {
        let mut manifest: Option<UpdateManifest> = None;
        if start != UpdateStep::Extract {
            // resuming mid-run: the manifest is still in the scratch tree
            manifest = extract::load_manifest(&self.ctx.layout.manifest_path())?;
        }

        let mut step = Some(start);
        while let Some(current) = step {
            sink.report(overall_percent(current, 0), current.label());

            let outcome = match self.run_stage(current, manifest.as_ref(), sink) {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.cleanup_after_error(&err);
                    return Err(err);
                }
            };

            match outcome {
                StageResult::Continue => {}
                StageResult::Cancelled => {
                    if let Err(err) = self.unwind() {
                        return Err(UpdateError::Other(err));
                    }
                    return Ok(UpdateOutcome::Cancelled);
                }
                StageResult::ManifestLoaded(loaded) => {
                    manifest = loaded;
                    let needs_privilege = manifest
                        .as_ref()
                        .map(selfupdate::requires_privilege)
                        .unwrap_or(false);
                    if needs_privilege && !self.assume_elevated && !selfupdate::is_elevated() {
                        let handoff_path = self.ctx.layout.handoff_path();
                        self.write_elevation_handoff(&handoff_path)?;
                        return Ok(UpdateOutcome::ElevationRequired { handoff_path });
                    }
                }
            }

            let has_manifest = manifest.is_some();
            let has_registry = manifest
                .as_ref()
                .map(UpdateManifest::has_registry_operations)
                .unwrap_or(false);
            step = next_step(current, has_manifest, has_registry);
        }

        sink.report(100, "update complete");
        Ok(UpdateOutcome::Completed)
    }

    fn run_stage(
        &mut self,
        step: UpdateStep,
        manifest: Option<&UpdateManifest>,
        sink: &dyn ProgressSink,
    ) -> Result<StageResult, UpdateError> {
        let stage_sink = StageProgress { inner: sink, step };
        let empty = UpdateManifest::default();
        let manifest_ref = manifest.unwrap_or(&empty);

        match step {
            UpdateStep::DownloadClientUpdate
            | UpdateStep::SelfUpdate
            | UpdateStep::Download => Ok(StageResult::Continue),
            UpdateStep::Extract => match self.run_extract_stage(sink)? {
                Some(manifest) => Ok(StageResult::ManifestLoaded(manifest)),
                None => Ok(StageResult::Cancelled),
            },
            UpdateStep::ClosingProcesses => {
                let overwrites = self.pending_overwrites()?;
                process::ensure_not_running(&overwrites)?;
                Ok(StageResult::Continue)
            }
            UpdateStep::PreExecute => {
                let resolver = self.make_resolver();
                execute::run_pre_execute(manifest_ref, self.ctx.layout.root(), &resolver)?;
                Ok(StageResult::Continue)
            }
            UpdateStep::BackingUp => {
                selfupdate::delete_stray_client(
                    &self.ctx.layout,
                    &self.ctx.targets,
                    &self.ctx.current_exe,
                );
                let outcome = files::install_files(
                    &self.ctx.layout,
                    &self.ctx.targets,
                    &self.cancel,
                    &stage_sink,
                )?;
                if outcome == StageOutcome::Cancelled {
                    return Ok(StageResult::Cancelled);
                }
                cleanup::delete_flagged_files(manifest_ref, &self.ctx.targets, &self.ctx.layout)?;
                cleanup::remove_obsolete_folders(manifest_ref, &self.ctx.targets, &self.ctx.layout)?;
                Ok(StageResult::Continue)
            }
            UpdateStep::ModifyReg => {
                let resolver = self.make_resolver();
                let plan = registry::plan_registry(&*self.store, &manifest_ref.registry, &resolver)?;
                registry::apply_plan(
                    &mut *self.store,
                    &plan,
                    &self.ctx.layout.registry_ledger_path(),
                )?;
                Ok(StageResult::Continue)
            }
            UpdateStep::OptimizeExecute => {
                let resolver = self.make_resolver();
                execute::optimize_managed(
                    manifest_ref,
                    &self.ctx.targets,
                    self.ctx.layout.root(),
                    self.optimizer,
                )?;
                execute::run_post_execute(
                    manifest_ref,
                    &self.ctx.targets,
                    self.ctx.layout.root(),
                    &resolver,
                )?;
                cleanup::create_shortcuts(
                    manifest_ref,
                    &self.ctx.targets,
                    &self.ctx.layout,
                    self.shell,
                )?;
                cleanup::run_post_commands(manifest_ref, self.shell)?;
                Ok(StageResult::Continue)
            }
            UpdateStep::WriteManifest => {
                self.write_installed_record(manifest)?;
                Ok(StageResult::Continue)
            }
            UpdateStep::DeletingTemp => {
                // commit point: the run can no longer be rolled back
                self.ctx.layout.purge()?;
                Ok(StageResult::Continue)
            }
        }
    }

    /// Extracts the archive, loads the manifest, applies the deltas,
    /// and retires the archive. `Ok(None)` means cancelled.
    fn run_extract_stage(
        &mut self,
        sink: &dyn ProgressSink,
    ) -> Result<Option<Option<UpdateManifest>>, UpdateError> {
        let stage_sink = StageProgress {
            inner: sink,
            step: UpdateStep::Extract,
        };
        self.ctx.layout.ensure_dirs()?;

        let outcome = extract::extract_archive(
            &self.ctx.layout.archive_path(),
            self.ctx.layout.root(),
            &self.cancel,
            &stage_sink,
        )?;
        if outcome == StageOutcome::Cancelled {
            return Ok(None);
        }

        let manifest = extract::load_manifest(&self.ctx.layout.manifest_path())?;

        if let Some(manifest) = &manifest {
            let outcome = patch::apply_patches(
                manifest,
                &self.ctx.targets,
                &self.ctx.layout,
                &self.cancel,
                &stage_sink,
            )?;
            if outcome == StageOutcome::Cancelled {
                return Ok(None);
            }
        }

        let _ = fs::remove_file(self.ctx.layout.archive_path());
        Ok(Some(manifest))
    }

    /// Absolute destination paths of every staged file that would
    /// overwrite an existing one. These are the images that must not be
    /// running while files move.
    fn pending_overwrites(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for class in TargetClass::install_classes() {
            let src = self.ctx.layout.class_dir(class);
            if !src.is_dir() {
                continue;
            }
            let Some(root) = self.ctx.targets.root(class) else {
                continue;
            };
            for entry in WalkDir::new(&src)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
            {
                let relative = entry
                    .path()
                    .strip_prefix(&src)
                    .context("staged file escaped its class dir")?;
                let destination = root.join(relative);
                if destination.is_file() {
                    paths.push(destination);
                }
            }
        }
        Ok(paths)
    }

    fn make_resolver(&self) -> impl Fn(&str) -> Option<String> {
        let base = self.ctx.targets.base().display().to_string();
        let app_name = self.ctx.app_name.clone();
        let version = self.ctx.new_version.to_string();
        move |name: &str| match name {
            "basedir" => Some(base.clone()),
            "appname" => Some(app_name.clone()),
            "version" => Some(version.clone()),
            _ => None,
        }
    }

    fn write_installed_record(&self, manifest: Option<&UpdateManifest>) -> Result<()> {
        ClientState {
            app_name: self.ctx.app_name.clone(),
            version: self.ctx.new_version.clone(),
        }
        .store(&self.ctx.state_path)?;

        if let Some(manifest) = manifest {
            let mut data = UninstallData::load(&self.ctx.uninstall_data_path)?.unwrap_or_default();
            data.merge(UninstallData::from_manifest(manifest));
            data.store(&self.ctx.uninstall_data_path)?;
        }
        Ok(())
    }

    fn write_elevation_handoff(&self, handoff_path: &Path) -> Result<(), UpdateError> {
        SelfUpdateHandoff {
            state_path: self.ctx.state_path.clone(),
            catalog_path: self.ctx.catalog_path.clone(),
            client_catalog_path: None,
            base_dir: self.ctx.targets.base().to_path_buf(),
            scratch_dir: self.ctx.layout.root().to_path_buf(),
            current_exe: self.ctx.current_exe.clone(),
            will_self_update: false,
            needs_elevation: true,
            catalog_override: None,
        }
        .write(handoff_path)?;
        Ok(())
    }

    /// Restores the destination trees and the registry from the
    /// persisted ledgers, then removes the scratch tree.
    fn unwind(&mut self) -> Result<()> {
        cleanup::rollback_files(&self.ctx.layout, &self.ctx.targets)?;
        registry::rollback_registry(&mut *self.store, &self.ctx.layout.registry_ledger_path())?;
        self.ctx.layout.purge()
    }

    fn cleanup_after_error(&mut self, err: &UpdateError) {
        if err.is_patch_failure() {
            // nothing was installed yet; keep what a retry can reuse
            let manifest_path = self.ctx.layout.manifest_path();
            let _ = self.ctx.layout.gut_for_retry();
            if self.patch_policy == PatchFailurePolicy::DropManifest {
                let _ = fs::remove_file(manifest_path);
            }
            return;
        }
        // best effort: the error in flight outranks rollback problems
        let _ = self.unwind();
    }
}

enum StageResult {
    Continue,
    Cancelled,
    ManifestLoaded(Option<UpdateManifest>),
}
