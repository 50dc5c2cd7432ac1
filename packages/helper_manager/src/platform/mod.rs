use std::path::{Path, PathBuf};

use privileged_helper_kit::HelperVersion;

use crate::install::{InstallError, ScriptError};

#[cfg(target_os = "macos")]
mod macos;

#[cfg(target_os = "macos")]
pub use macos::MacPlatform;

/// Operating system services used by the install state machine. Every call may block.
pub trait HelperPlatform: Send + Sync + 'static {
    /// Path of the running app bundle.
    fn app_path(&self) -> PathBuf;

    /// Version embedded in the helper shipped inside the app bundle.
    fn bundled_helper_version(&self) -> Option<HelperVersion>;

    fn installed_helper_exists(&self) -> bool;

    /// True when the launch daemon at `plist` waits for the user to allow it in System Settings.
    fn requires_approval(&self, plist: &Path) -> bool;

    fn open_login_items_settings(&self);

    fn copy_to_clipboard(&self, text: &str);

    /// Installs the bundled helper through the system elevation prompt.
    fn bless(&self, label: &str) -> Result<(), InstallError>;

    fn run_privileged_script(&self, script: &str) -> Result<(), ScriptError>;

    fn terminate_app(&self);
}

/// Looks `label` up in `launchctl print-disabled system` output.
pub fn is_label_disabled(output: &str, label: &str) -> bool {
    let quoted = format!("\"{}\"", label);

    output.lines().any(|line| {
        let Some((name, state)) = line.trim().split_once("=>") else {
            return false;
        };
        if name.trim() != quoted {
            return false;
        }

        matches!(state.trim(), "disabled" | "true")
    })
}

/// Major version out of `sw_vers -productVersion` output.
pub fn macos_major_version(output: &str) -> Option<u32> {
    output.trim().split('.').next()?.parse().ok()
}
