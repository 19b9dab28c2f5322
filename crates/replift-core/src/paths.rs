use std::path::{Path, PathBuf};

/// Install-target class a manifest-relative path is tagged with. The tag is
/// the first path segment ("base/app.exe", "comdesktop/App.lnk", ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetClass {
    Base,
    System,
    AppData,
    CommonAppData,
    CommonDesktop,
    CommonStartMenu,
    Temp,
}

impl TargetClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::System => "system",
            Self::AppData => "appdata",
            Self::CommonAppData => "comappdata",
            Self::CommonDesktop => "comdesktop",
            Self::CommonStartMenu => "comstartmenu",
            Self::Temp => "temp",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "base" => Some(Self::Base),
            "system" => Some(Self::System),
            "appdata" => Some(Self::AppData),
            "comappdata" => Some(Self::CommonAppData),
            "comdesktop" => Some(Self::CommonDesktop),
            "comstartmenu" => Some(Self::CommonStartMenu),
            "temp" => Some(Self::Temp),
            _ => None,
        }
    }

    /// The six install-target classes, in manifest order. Temp is not an
    /// install target; it resolves under the scratch tree.
    pub fn install_classes() -> [TargetClass; 6] {
        [
            Self::Base,
            Self::System,
            Self::AppData,
            Self::CommonAppData,
            Self::CommonDesktop,
            Self::CommonStartMenu,
        ]
    }
}

/// Splits a class-tagged relative path into its class and remainder.
/// Both separators are accepted since manifests produced on Windows carry
/// backslashes. Unknown or missing tags yield `None`; callers skip those
/// entries rather than failing the update.
pub fn split_tagged(tagged: &str) -> Option<(TargetClass, &str)> {
    let (tag, rest) = match tagged.find(['/', '\\']) {
        Some(idx) => (&tagged[..idx], &tagged[idx + 1..]),
        None => (tagged, ""),
    };
    TargetClass::parse(tag).map(|class| (class, rest))
}

/// The six resolved install-target roots. Computed once per run and frozen
/// for its duration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallTargets {
    base: PathBuf,
    system: PathBuf,
    app_data: PathBuf,
    common_app_data: PathBuf,
    common_desktop: PathBuf,
    common_start_menu: PathBuf,
}

impl InstallTargets {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        base: impl Into<PathBuf>,
        system: impl Into<PathBuf>,
        app_data: impl Into<PathBuf>,
        common_app_data: impl Into<PathBuf>,
        common_desktop: impl Into<PathBuf>,
        common_start_menu: impl Into<PathBuf>,
    ) -> Self {
        Self {
            base: base.into(),
            system: system.into(),
            app_data: app_data.into(),
            common_app_data: common_app_data.into(),
            common_desktop: common_desktop.into(),
            common_start_menu: common_start_menu.into(),
        }
    }

    /// All six roots under a single parent, named after their class tags.
    /// Used by tests and by per-user installs that keep everything local.
    pub fn rooted_under(parent: &Path) -> Self {
        Self::new(
            parent.join("base"),
            parent.join("system"),
            parent.join("appdata"),
            parent.join("comappdata"),
            parent.join("comdesktop"),
            parent.join("comstartmenu"),
        )
    }

    pub fn root(&self, class: TargetClass) -> Option<&Path> {
        match class {
            TargetClass::Base => Some(&self.base),
            TargetClass::System => Some(&self.system),
            TargetClass::AppData => Some(&self.app_data),
            TargetClass::CommonAppData => Some(&self.common_app_data),
            TargetClass::CommonDesktop => Some(&self.common_desktop),
            TargetClass::CommonStartMenu => Some(&self.common_start_menu),
            TargetClass::Temp => None,
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Resolves a class-tagged relative path to an absolute destination.
    /// Temp-class paths keep their full tagged form under the scratch root,
    /// matching the layout of the extracted update tree. `None` means the
    /// entry is unresolvable and should be skipped.
    pub fn resolve(&self, scratch: &Path, tagged: &str) -> Option<PathBuf> {
        let (class, rest) = split_tagged(tagged)?;
        if class == TargetClass::Temp {
            return Some(scratch.join(normalize_separators(tagged)));
        }
        let root = self.root(class)?;
        if rest.is_empty() {
            return Some(root.to_path_buf());
        }
        Some(root.join(normalize_separators(rest)))
    }
}

fn normalize_separators(rel: &str) -> PathBuf {
    rel.split(['/', '\\']).filter(|s| !s.is_empty()).collect()
}
