use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use replift_core::InstallTargets;

pub const CONFIG_FILE_NAME: &str = "replift.toml";

/// Per-application update configuration, shipped next to the client
/// executable. Only `app_name`, `base_dir` and `catalog` are required;
/// everything else has a sensible place under the base directory.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub app_name: String,
    pub base_dir: PathBuf,
    /// Catalog location: an http(s) url or a local path.
    pub catalog: String,
    #[serde(default)]
    pub system_dir: Option<PathBuf>,
    #[serde(default)]
    pub app_data_dir: Option<PathBuf>,
    #[serde(default)]
    pub common_app_data_dir: Option<PathBuf>,
    #[serde(default)]
    pub common_desktop_dir: Option<PathBuf>,
    #[serde(default)]
    pub common_start_menu_dir: Option<PathBuf>,
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
    #[serde(default)]
    pub registry_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input).context("failed to parse update config")?;
        if config.app_name.trim().is_empty() {
            return Err(anyhow!("update config has an empty app name"));
        }
        if config.catalog.trim().is_empty() {
            return Err(anyhow!("update config has an empty catalog location"));
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("invalid config: {}", path.display()))
    }

    /// Loads the config from an explicit path, or finds it next to the
    /// running executable.
    pub fn locate(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let exe = env::current_exe().context("failed to locate the running executable")?;
        let beside_exe = exe
            .parent()
            .map(|dir| dir.join(CONFIG_FILE_NAME))
            .filter(|path| path.is_file());
        match beside_exe {
            Some(path) => Self::load(&path),
            None => Err(anyhow!(
                "no {CONFIG_FILE_NAME} found next to {}; pass --config",
                exe.display()
            )),
        }
    }

    /// The six install roots this application updates into. Roots the
    /// config leaves out default to subdirectories of the base dir, so
    /// a fully self-contained app needs no extra configuration.
    pub fn install_targets(&self) -> InstallTargets {
        let default = |dir: &Option<PathBuf>, name: &str| {
            dir.clone().unwrap_or_else(|| self.base_dir.join(name))
        };
        InstallTargets::new(
            self.base_dir.clone(),
            default(&self.system_dir, "system"),
            default(&self.app_data_dir, "appdata"),
            default(&self.common_app_data_dir, "comappdata"),
            default(&self.common_desktop_dir, "comdesktop"),
            default(&self.common_start_menu_dir, "comstartmenu"),
        )
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join(".replift"))
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_dir().join("client.state")
    }

    pub fn uninstall_data_path(&self) -> PathBuf {
        self.state_dir().join("uninstall.dat")
    }

    pub fn catalog_cache_path(&self) -> PathBuf {
        self.state_dir().join("catalog.toml")
    }

    /// Where the restarted client finds its handoff after a client
    /// self-update. Lives in the state dir, which survives the scratch
    /// tree purge that follows the client swap.
    pub fn handoff_path(&self) -> PathBuf {
        self.state_dir().join("handoff.bin")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| env::temp_dir().join(format!("{}-update", self.app_name)))
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.registry_dir
            .clone()
            .unwrap_or_else(|| self.state_dir().join("registry"))
    }
}
