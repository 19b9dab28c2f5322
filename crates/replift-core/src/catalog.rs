use anyhow::{anyhow, Context};
use semver::Version;
use serde::{Deserialize, Serialize};

/// The server-published catalog: which version is current, the oldest
/// client allowed to apply it, and where the update packages live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppCatalog {
    pub app_name: String,
    pub latest_version: Version,
    pub minimum_client_version: Version,
    #[serde(default)]
    pub client_update: Option<UpdatePackage>,
    #[serde(default)]
    pub updates: Vec<UpdatePackage>,
}

/// One downloadable update package with its mirror list and digest.
/// `from_version = None` marks the catch-all full-install package.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdatePackage {
    #[serde(default)]
    pub from_version: Option<Version>,
    pub urls: Vec<String>,
    pub sha256: String,
}

impl AppCatalog {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let catalog: Self = toml::from_str(input).context("failed to parse app catalog")?;
        if catalog.updates.is_empty() && catalog.client_update.is_none() {
            return Err(anyhow!(
                "catalog for '{}' lists no update packages",
                catalog.app_name
            ));
        }
        for package in catalog
            .updates
            .iter()
            .chain(catalog.client_update.as_ref())
        {
            if package.urls.is_empty() {
                return Err(anyhow!(
                    "catalog for '{}' has an update package without mirror urls",
                    catalog.app_name
                ));
            }
        }
        Ok(catalog)
    }

    /// Picks the diff package matching the installed version, falling back
    /// to the catch-all package when no exact diff exists.
    pub fn package_for(&self, installed: Option<&Version>) -> Option<&UpdatePackage> {
        if let Some(installed) = installed {
            if let Some(exact) = self
                .updates
                .iter()
                .find(|package| package.from_version.as_ref() == Some(installed))
            {
                return Some(exact);
            }
        }
        self.updates
            .iter()
            .find(|package| package.from_version.is_none())
    }

    /// True when the running client executable is older than the server's
    /// declared minimum and must replace itself first.
    pub fn client_needs_update(&self, client_version: &Version) -> bool {
        client_version < &self.minimum_client_version
    }
}
