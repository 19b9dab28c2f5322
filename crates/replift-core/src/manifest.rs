use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

/// Fixed name of the manifest inside the extracted update tree.
pub const MANIFEST_FILE_NAME: &str = "update.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateManifest {
    #[serde(default)]
    pub files: Vec<FileOperation>,
    #[serde(default)]
    pub registry: Vec<RegistryOperation>,
    #[serde(default)]
    pub shortcuts: Vec<ShortcutSpec>,
    #[serde(default)]
    pub obsolete_folders: Vec<String>,
    #[serde(default)]
    pub previous_desktop_shortcuts: Vec<String>,
    #[serde(default)]
    pub previous_start_menu_shortcuts: Vec<String>,
    #[serde(default)]
    pub post_update_commands: String,
}

/// One file entry of the manifest. `path` is a class-tagged relative path
/// ("base/app.exe", "comdesktop/App.lnk", ...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileOperation {
    pub path: String,
    #[serde(default)]
    pub delta: Option<String>,
    #[serde(default)]
    pub target_crc32: Option<u32>,
    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub execute: Option<ExecuteSpec>,
    #[serde(default)]
    pub managed_assembly: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecuteSpec {
    #[serde(default)]
    pub before_install: bool,
    #[serde(default)]
    pub wait_for_exit: bool,
    #[serde(default)]
    pub args: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShortcutSpec {
    pub path: String,
    pub target: String,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub args: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RegHive {
    ClassesRoot,
    CurrentUser,
    LocalMachine,
    Users,
    CurrentConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RegValueKind {
    String,
    ExpandString,
    MultiString,
    Dword,
    Qword,
    Binary,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RegOpKind {
    CreateValue,
    DeleteValue,
    CreateKey,
    DeleteKey,
}

/// A single registry mutation. Value data is carried as strings: one
/// element for scalar kinds, one per line for multi-string, decimal text
/// for dword/qword, hex text for binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryOperation {
    pub op: RegOpKind,
    pub hive: RegHive,
    pub key: String,
    #[serde(default)]
    pub value_name: Option<String>,
    #[serde(default)]
    pub kind: Option<RegValueKind>,
    #[serde(default)]
    pub data: Vec<String>,
}

impl UpdateManifest {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let manifest: Self = toml::from_str(input).context("failed to parse update manifest")?;

        for file in &manifest.files {
            if file.path.trim().is_empty() {
                return Err(anyhow!("manifest file entry has an empty path"));
            }
            if file.delta.is_some() && file.target_crc32.is_none() {
                return Err(anyhow!(
                    "manifest entry '{}' carries a delta but no expected checksum",
                    file.path
                ));
            }
            if file.delta.is_some() && file.delete {
                return Err(anyhow!(
                    "manifest entry '{}' is marked both delta-patched and deleted",
                    file.path
                ));
            }
        }

        for reg in &manifest.registry {
            reg.validate()?;
        }

        Ok(manifest)
    }

    /// Whether any registry operation is present; drives the ModifyReg skip.
    pub fn has_registry_operations(&self) -> bool {
        !self.registry.is_empty()
    }
}

impl RegistryOperation {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.key.trim().is_empty() {
            return Err(anyhow!("registry operation has an empty key"));
        }
        match self.op {
            RegOpKind::CreateValue => {
                if self.value_name.is_none() {
                    return Err(anyhow!(
                        "create_value operation on '{}' is missing a value name",
                        self.key
                    ));
                }
                if self.kind.is_none() {
                    return Err(anyhow!(
                        "create_value operation on '{}' is missing a value kind",
                        self.key
                    ));
                }
            }
            RegOpKind::DeleteValue => {
                if self.value_name.is_none() {
                    return Err(anyhow!(
                        "delete_value operation on '{}' is missing a value name",
                        self.key
                    ));
                }
            }
            RegOpKind::CreateKey | RegOpKind::DeleteKey => {}
        }
        Ok(())
    }

    /// True for kinds whose payload passes through the variable expander.
    pub fn has_expandable_data(&self) -> bool {
        matches!(
            self.kind,
            Some(RegValueKind::String) | Some(RegValueKind::ExpandString) | Some(RegValueKind::MultiString)
        )
    }
}

impl RegHive {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClassesRoot => "classes_root",
            Self::CurrentUser => "current_user",
            Self::LocalMachine => "local_machine",
            Self::Users => "users",
            Self::CurrentConfig => "current_config",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "classes_root" => Some(Self::ClassesRoot),
            "current_user" => Some(Self::CurrentUser),
            "local_machine" => Some(Self::LocalMachine),
            "users" => Some(Self::Users),
            "current_config" => Some(Self::CurrentConfig),
            _ => None,
        }
    }
}

impl RegValueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::ExpandString => "expand_string",
            Self::MultiString => "multi_string",
            Self::Dword => "dword",
            Self::Qword => "qword",
            Self::Binary => "binary",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "string" => Some(Self::String),
            "expand_string" => Some(Self::ExpandString),
            "multi_string" => Some(Self::MultiString),
            "dword" => Some(Self::Dword),
            "qword" => Some(Self::Qword),
            "binary" => Some(Self::Binary),
            _ => None,
        }
    }
}

impl RegOpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateValue => "create_value",
            Self::DeleteValue => "delete_value",
            Self::CreateKey => "create_key",
            Self::DeleteKey => "delete_key",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "create_value" => Some(Self::CreateValue),
            "delete_value" => Some(Self::DeleteValue),
            "create_key" => Some(Self::CreateKey),
            "delete_key" => Some(Self::DeleteKey),
            _ => None,
        }
    }
}
