use std::future::Future;

use privileged_helper_kit::HelperVersion;
use privileged_helper_kit::logging::LogLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// closed by us, or the helper could not be reached
    Invalidated,
    /// the helper went away while the connection was in use
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginItemChoice {
    OpenSystemSettings,
    ResetDaemon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallChoice {
    Install,
    Cancel,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyInstallChoice {
    Confirm,
    Cancel,
}

/// How a reconciliation ended up with a working helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InstallReport {
    pub after_update: bool,
    pub legacy: bool,
    pub tries: u32,
}

/// Everything the manager needs from the host app: paths, policy, logs and user prompts.
pub trait HelperDelegate: Send + Sync + 'static {
    /// Directory shared with the helper, sent along with version requests.
    fn shared_directory(&self) -> Option<String>;

    /// Oldest helper version able to uninstall itself. `None` means no version can.
    fn minimum_uninstall_version(&self) -> Option<HelperVersion> {
        None
    }

    fn on_log(&self, level: LogLevel, message: String) {
        let _ = (level, message);
    }

    fn on_disconnect(&self, reason: DisconnectReason) {
        let _ = reason;
    }

    fn on_installed(&self, report: InstallReport) {
        let _ = report;
    }

    fn show_text_alert(&self, text: String) -> impl Future<Output = ()> + Send;

    fn show_login_item_alert(&self) -> impl Future<Output = LoginItemChoice> + Send;

    fn show_install_alert(&self) -> impl Future<Output = InstallChoice> + Send;

    fn show_legacy_install_alert(&self) -> impl Future<Output = LegacyInstallChoice> + Send;
}

/// Builds the oldest self-uninstalling helper version from a short version.
/// The identifier comes from the bundled helper since live versions carry
/// the helper's bundle identifier, which need not equal its launchd label.
pub fn minimum_uninstall_version(
    bundled: Option<&HelperVersion>,
    label: &str,
    short_version: &str,
) -> HelperVersion {
    let identifier = bundled.map_or(label, HelperVersion::identifier);
    HelperVersion::new(identifier, "0", short_version)
}

#[cfg(test)]
mod test {
    use privileged_helper_kit::HelperVersion;

    use super::minimum_uninstall_version;

    #[test]
    fn minimum_uses_bundled_identifier() {
        let bundled = HelperVersion::new("com.example.helper-bundle", "12", "2.0");
        let live = HelperVersion::new("com.example.helper-bundle", "11", "1.5");

        let min = minimum_uninstall_version(Some(&bundled), "com.example.helper", "1.2");
        assert_eq!(min.identifier(), "com.example.helper-bundle");
        assert!(live.is_greater_or_equal(&min));

        let too_new = minimum_uninstall_version(Some(&bundled), "com.example.helper", "1.6");
        assert!(!live.is_greater_or_equal(&too_new));
    }

    #[test]
    fn minimum_falls_back_to_label() {
        let min = minimum_uninstall_version(None, "com.example.helper", "1.0");
        assert_eq!(min, HelperVersion::new("com.example.helper", "0", "1.0"));
    }
}
