use std::path::{Path, PathBuf};

/// File system locations owned by one helper label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperPaths {
    root: PathBuf,
    label: String,
}

impl HelperPaths {
    pub fn new<L: Into<String>>(label: L) -> Self {
        Self::with_root("/", label)
    }

    /// Same layout below `root` instead of `/`.
    pub fn with_root<R: Into<PathBuf>, L: Into<String>>(root: R, label: L) -> Self {
        HelperPaths {
            root: root.into(),
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn launch_daemon_plist(&self) -> PathBuf {
        self.root
            .join("Library/LaunchDaemons")
            .join(format!("{}.plist", self.label))
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.root.join("Library/PrivilegedHelperTools")
    }

    pub fn installed_binary(&self) -> PathBuf {
        self.tools_dir().join(&self.label)
    }

    pub fn socket(&self) -> PathBuf {
        self.root.join("var/run").join(format!("{}.sock", self.label))
    }

    pub fn run_state(&self) -> PathBuf {
        self.root
            .join("Library/Application Support")
            .join(&self.label)
            .join("run_state.toml")
    }

    /// Helper binary shipped inside the app bundle.
    pub fn bundled_binary(&self, app_path: &Path) -> PathBuf {
        app_path
            .join("Contents/Library/LaunchServices")
            .join(&self.label)
    }

    /// Label of a helper running from its installed location, which is
    /// always `<tools dir>/<label>`. `None` for binaries started elsewhere.
    pub fn label_of_installed(binary: &Path) -> Option<String> {
        if !binary.parent()?.ends_with("Library/PrivilegedHelperTools") {
            return None;
        }
        binary.file_name()?.to_str().map(str::to_string)
    }
}
