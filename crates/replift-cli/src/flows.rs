use std::env;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::thread;

use anyhow::{anyhow, Context, Result};
use semver::Version;
use serde::Serialize;

use replift_core::{encode_delta, AppCatalog, UpdatePackage};
use replift_engine::{
    overall_percent, CancelFlag, ClientState, FsRegistryStore, FsShellOps, NoopOptimizer,
    ProgressSink, ScratchLayout, SelfUpdateHandoff, StageOutcome, UpdateContext, UpdateError,
    UpdateOutcome, UpdateSequencer, UpdateStep,
};

use crate::config::AppConfig;
use crate::download;
use crate::render::{OutputStyle, TerminalSink};

const EXIT_OK: u8 = 0;
const EXIT_CANCELLED: u8 = 3;
const EXIT_NEEDS_ELEVATION: u8 = 4;

/// Maps a non-engine phase (the downloads) onto the run's overall
/// progress scale.
struct StepScope<'a> {
    inner: &'a TerminalSink,
    step: UpdateStep,
}

impl ProgressSink for StepScope<'_> {
    fn report(&self, percent: i32, message: &str) {
        if percent < 0 {
            self.inner.report(-1, message);
        } else {
            self.inner.report(overall_percent(self.step, percent), message);
        }
    }
}

pub fn run_update(
    config: &AppConfig,
    catalog_override: Option<&str>,
    plain: bool,
) -> Result<u8> {
    let sink = TerminalSink::new(style_for(plain));
    let catalog = load_catalog(config, catalog_override)?;

    let state = ClientState::load(&config.state_path())?;
    let installed = state.map(|state| state.version);

    let client_version = Version::parse(env!("CARGO_PKG_VERSION"))
        .context("invalid client version in build metadata")?;
    if catalog.client_needs_update(&client_version) {
        return run_client_update(config, &catalog, catalog_override, &sink);
    }

    if installed.as_ref() == Some(&catalog.latest_version) {
        sink.finish();
        sink.print_status(
            "up to date",
            &format!("{} {}", catalog.app_name, catalog.latest_version),
        );
        return Ok(EXIT_OK);
    }

    let package = catalog
        .package_for(installed.as_ref())
        .ok_or_else(|| anyhow!("catalog lists no package applicable to this installation"))?;

    let ctx = build_context(config, catalog.latest_version.clone());
    let cancel = CancelFlag::new();

    fetch_package(package, &ctx.layout, &cancel, &sink)?;

    let mut store = FsRegistryStore::new(config.registry_dir());
    let mut sequencer =
        UpdateSequencer::new(ctx, &mut store, &NoopOptimizer, &FsShellOps, cancel);

    let outcome = drive(&sink, move |sink| sequencer.run(sink))?;
    finish(config, &catalog, &sink, outcome)
}

pub fn run_resume(config: &AppConfig, handoff: &Path, plain: bool) -> Result<u8> {
    let sink = TerminalSink::new(style_for(plain));
    let catalog = load_catalog(config, None)?;

    let ctx = build_context(config, catalog.latest_version.clone());
    let mut store = FsRegistryStore::new(config.registry_dir());
    let mut sequencer = UpdateSequencer::new(
        ctx,
        &mut store,
        &NoopOptimizer,
        &FsShellOps,
        CancelFlag::new(),
    );

    let handoff = handoff.to_path_buf();
    let outcome = match drive(&sink, move |sink| sequencer.resume(&handoff, sink)) {
        Ok(outcome) => outcome,
        Err(err) => match err.downcast_ref::<UpdateError>() {
            Some(UpdateError::ElevationRejected) => {
                sink.finish();
                sink.print_status("failed", &err.to_string());
                return Ok(EXIT_NEEDS_ELEVATION);
            }
            _ => return Err(err),
        },
    };

    // a consumed client-update handoff means the swap is done; this
    // process is the new client and runs the product update from the top
    if let UpdateOutcome::RestartUpdate { catalog_override } = outcome {
        sink.finish();
        return run_update(config, catalog_override.as_deref(), plain);
    }
    finish(config, &catalog, &sink, outcome)
}

pub fn run_uninstall(config: &AppConfig, plain: bool) -> Result<u8> {
    let sink = TerminalSink::new(style_for(plain));
    let mut store = FsRegistryStore::new(config.registry_dir());

    replift_engine::run_uninstall(
        &config.uninstall_data_path(),
        &config.state_path(),
        &config.install_targets(),
        &config.scratch_dir(),
        &mut store,
        &NoopOptimizer,
        &sink,
    )?;

    sink.finish();
    sink.print_status("uninstalled", &config.app_name);
    Ok(EXIT_OK)
}

#[derive(Debug, Serialize)]
struct StatusReport {
    app_name: String,
    installed_version: Option<String>,
    latest_version: Option<String>,
    update_available: bool,
}

pub fn run_status(config: &AppConfig, json: bool) -> Result<u8> {
    let installed = ClientState::load(&config.state_path())?.map(|state| state.version);

    // status never touches the network: a local catalog is read
    // directly, a remote one through the last cached copy
    let catalog_raw = if is_remote(&config.catalog) {
        fs::read_to_string(config.catalog_cache_path()).ok()
    } else {
        fs::read_to_string(&config.catalog).ok()
    };
    let latest = catalog_raw
        .as_deref()
        .and_then(|raw| AppCatalog::from_toml_str(raw).ok())
        .map(|catalog| catalog.latest_version);

    let report = StatusReport {
        app_name: config.app_name.clone(),
        installed_version: installed.as_ref().map(Version::to_string),
        latest_version: latest.as_ref().map(Version::to_string),
        update_available: matches!(
            (&installed, &latest),
            (Some(installed), Some(latest)) if installed < latest
        ) || (installed.is_none() && latest.is_some()),
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to render status")?
        );
    } else {
        println!("app:       {}", report.app_name);
        println!(
            "installed: {}",
            report.installed_version.as_deref().unwrap_or("none")
        );
        println!(
            "latest:    {}",
            report.latest_version.as_deref().unwrap_or("unknown")
        );
        if report.update_available {
            println!("an update is available; run `replift update`");
        }
    }
    Ok(EXIT_OK)
}

pub fn run_make_delta(original: &Path, target: &Path, out: &Path) -> Result<u8> {
    let original_bytes = fs::read(original)
        .with_context(|| format!("failed to read {}", original.display()))?;
    let target_bytes =
        fs::read(target).with_context(|| format!("failed to read {}", target.display()))?;

    let delta = encode_delta(&original_bytes, &target_bytes);
    fs::write(out, &delta).with_context(|| format!("failed to write {}", out.display()))?;

    println!(
        "{} -> {}: delta {} bytes ({} vs full {})",
        original.display(),
        target.display(),
        delta.len(),
        out.display(),
        target_bytes.len()
    );
    Ok(EXIT_OK)
}

/// Replaces the running client with the catalog's client package, then
/// starts the new client with a handoff telling it to carry on with the
/// product update.
fn run_client_update(
    config: &AppConfig,
    catalog: &AppCatalog,
    catalog_override: Option<&str>,
    sink: &TerminalSink,
) -> Result<u8> {
    let package = catalog
        .client_update
        .as_ref()
        .ok_or_else(|| anyhow!("catalog requires a newer client but ships no client update"))?;

    let ctx = build_context(config, catalog.latest_version.clone());
    let cancel = CancelFlag::new();
    fetch_package(package, &ctx.layout, &cancel, sink)?;

    let mut store = FsRegistryStore::new(config.registry_dir());
    let mut sequencer =
        UpdateSequencer::new(ctx, &mut store, &NoopOptimizer, &FsShellOps, cancel);
    let outcome = drive(sink, move |sink| sequencer.run_client_update(sink))?;

    sink.finish();
    match outcome {
        UpdateOutcome::Completed => {
            let exe = env::current_exe().context("failed to locate the running executable")?;
            let handoff_path = config.handoff_path();
            SelfUpdateHandoff {
                state_path: config.state_path(),
                catalog_path: config.catalog_cache_path(),
                client_catalog_path: None,
                base_dir: config.base_dir.clone(),
                scratch_dir: config.scratch_dir(),
                current_exe: exe.clone(),
                will_self_update: true,
                needs_elevation: false,
                catalog_override: catalog_override.map(str::to_string),
            }
            .write(&handoff_path)?;

            sink.print_status("client updated", "restarting to finish the update");
            Command::new(exe)
                .arg("resume")
                .arg(&handoff_path)
                .spawn()
                .context("failed to restart the updated client")?;
            Ok(EXIT_OK)
        }
        UpdateOutcome::Cancelled => Ok(EXIT_CANCELLED),
        UpdateOutcome::ElevationRequired { .. } => Ok(EXIT_NEEDS_ELEVATION),
        // the client-update path never resumes a handoff itself
        UpdateOutcome::RestartUpdate { .. } => Ok(EXIT_OK),
    }
}

fn style_for(plain: bool) -> OutputStyle {
    if plain {
        OutputStyle::Plain
    } else {
        OutputStyle::Rich
    }
}

fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

fn load_catalog(config: &AppConfig, catalog_override: Option<&str>) -> Result<AppCatalog> {
    let location = catalog_override.unwrap_or(&config.catalog);
    let raw = download::fetch_catalog(location, &config.catalog_cache_path())?;
    AppCatalog::from_toml_str(&raw)
}

fn build_context(config: &AppConfig, new_version: Version) -> UpdateContext {
    UpdateContext {
        app_name: config.app_name.clone(),
        new_version,
        layout: ScratchLayout::new(config.scratch_dir()),
        targets: config.install_targets(),
        state_path: config.state_path(),
        uninstall_data_path: config.uninstall_data_path(),
        catalog_path: config.catalog_cache_path(),
        current_exe: env::current_exe().unwrap_or_default(),
    }
}

fn fetch_package(
    package: &UpdatePackage,
    layout: &ScratchLayout,
    cancel: &CancelFlag,
    sink: &TerminalSink,
) -> Result<()> {
    let scope = StepScope {
        inner: sink,
        step: UpdateStep::Download,
    };
    let outcome = download::download_package(
        &package.urls,
        &package.sha256,
        &layout.archive_path(),
        cancel,
        &scope,
    )?;
    if outcome == StageOutcome::Cancelled {
        return Err(anyhow!("download cancelled"));
    }
    Ok(())
}

/// Runs the engine on a worker thread so terminal rendering never
/// blocks behind long file operations.
fn drive<F>(sink: &TerminalSink, work: F) -> Result<UpdateOutcome>
where
    F: FnOnce(&TerminalSink) -> Result<UpdateOutcome, UpdateError> + Send,
{
    thread::scope(|scope| {
        scope
            .spawn(|| work(sink))
            .join()
            .map_err(|_| anyhow!("update worker panicked"))?
            .map_err(anyhow::Error::from)
    })
}

fn finish(
    config: &AppConfig,
    catalog: &AppCatalog,
    sink: &TerminalSink,
    outcome: UpdateOutcome,
) -> Result<u8> {
    sink.finish();
    match outcome {
        UpdateOutcome::Completed => {
            sink.print_status(
                "updated",
                &format!("{} {}", catalog.app_name, catalog.latest_version),
            );
            Ok(EXIT_OK)
        }
        UpdateOutcome::Cancelled => {
            sink.print_status("cancelled", "everything was restored");
            Ok(EXIT_CANCELLED)
        }
        UpdateOutcome::ElevationRequired { handoff_path } => {
            if relaunch_elevated(config, &handoff_path)? {
                Ok(EXIT_OK)
            } else {
                sink.print_status(
                    "elevation required",
                    &format!(
                        "rerun elevated: replift resume {}",
                        handoff_path.display()
                    ),
                );
                Ok(EXIT_NEEDS_ELEVATION)
            }
        }
        // run_resume turns this into a fresh update before reaching here
        UpdateOutcome::RestartUpdate { .. } => Ok(EXIT_OK),
    }
}

/// Tries to continue the run in an elevated process. Returns false when
/// no elevation mechanism is available, leaving the handoff in place
/// for a manual elevated resume.
fn relaunch_elevated(_config: &AppConfig, handoff: &Path) -> Result<bool> {
    if !cfg!(unix) {
        return Ok(false);
    }
    let exe = env::current_exe().context("failed to locate the running executable")?;
    let status = Command::new("sudo")
        .arg("--non-interactive")
        .arg(&exe)
        .arg("resume")
        .arg(handoff)
        .status();
    Ok(matches!(status, Ok(status) if status.success()))
}
