use std::path::Path;
use std::process::Command;

use anyhow::{anyhow, Context, Result};

use replift_core::{expand, split_tagged, InstallTargets, TargetClass, UpdateManifest};

/// Runs execute-flagged files that must run before installation. These
/// run from the scratch tree, where extraction put them.
pub fn run_pre_execute(
    manifest: &UpdateManifest,
    scratch: &Path,
    resolver: &dyn Fn(&str) -> Option<String>,
) -> Result<()> {
    for file in &manifest.files {
        let Some(spec) = file.execute.as_ref().filter(|spec| spec.before_install) else {
            continue;
        };
        let Some((class, rest)) = split_tagged(&file.path) else {
            continue;
        };
        let program = if class == TargetClass::Temp {
            scratch.join(normalized(&file.path))
        } else {
            scratch.join(class.as_str()).join(normalized(rest))
        };
        run_one(&program, spec.args.as_deref(), spec.wait_for_exit, resolver)?;
    }
    Ok(())
}

/// Runs execute-flagged files that run after installation, from their
/// installed locations.
pub fn run_post_execute(
    manifest: &UpdateManifest,
    targets: &InstallTargets,
    scratch: &Path,
    resolver: &dyn Fn(&str) -> Option<String>,
) -> Result<()> {
    for file in &manifest.files {
        let Some(spec) = file.execute.as_ref().filter(|spec| !spec.before_install) else {
            continue;
        };
        let Some(program) = targets.resolve(scratch, &file.path) else {
            continue;
        };
        run_one(&program, spec.args.as_deref(), spec.wait_for_exit, resolver)?;
    }
    Ok(())
}

fn run_one(
    program: &Path,
    args: Option<&str>,
    wait_for_exit: bool,
    resolver: &dyn Fn(&str) -> Option<String>,
) -> Result<()> {
    let mut command = Command::new(program);
    if let Some(args) = args {
        // arguments are expanded, then split on whitespace
        let expanded = expand(args, resolver);
        command.args(expanded.split_whitespace());
    }

    if wait_for_exit {
        let status = command
            .status()
            .with_context(|| format!("failed to run {}", program.display()))?;
        if !status.success() {
            return Err(anyhow!(
                "{} exited with status {status}",
                program.display()
            ));
        }
    } else {
        command
            .spawn()
            .with_context(|| format!("failed to start {}", program.display()))?;
    }
    Ok(())
}

/// Native-image optimization seam. The original system shells out to
/// the runtime's image generator here; hosts without one use the no-op.
pub trait BinaryOptimizer: Sync {
    fn optimize(&self, path: &Path) -> Result<()>;
    fn deoptimize(&self, path: &Path) -> Result<()>;
}

pub struct NoopOptimizer;

impl BinaryOptimizer for NoopOptimizer {
    fn optimize(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    fn deoptimize(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

/// Optimizes every managed-runtime-flagged file at its installed
/// location. Temp-class files never install, so they are skipped.
pub fn optimize_managed(
    manifest: &UpdateManifest,
    targets: &InstallTargets,
    scratch: &Path,
    optimizer: &dyn BinaryOptimizer,
) -> Result<()> {
    for file in manifest.files.iter().filter(|file| file.managed_assembly) {
        let Some((class, _)) = split_tagged(&file.path) else {
            continue;
        };
        if class == TargetClass::Temp || file.delete {
            continue;
        }
        let Some(installed) = targets.resolve(scratch, &file.path) else {
            continue;
        };
        if installed.is_file() {
            optimizer.optimize(&installed)?;
        }
    }
    Ok(())
}

fn normalized(rel: &str) -> std::path::PathBuf {
    rel.split(['/', '\\']).filter(|s| !s.is_empty()).collect()
}
