use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::paths::HelperPaths;

pub const DEFAULT_LABEL: &str = "com.privileged-helper-kit.helper";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelperSettings {
    /// launchd label, also used as the mach service name and file names
    #[serde(default = "default_label")]
    pub label: String,
    /// bundle identifier of the app that owns the helper
    #[serde(default)]
    pub app_bundle_identifier: String,
    #[serde(default)]
    pub socket_path: Option<String>,
    #[serde(default)]
    pub state_path: Option<String>,
    #[serde(default)]
    pub timing: Timing,
}

impl Default for HelperSettings {
    fn default() -> Self {
        HelperSettings {
            label: default_label(),
            app_bundle_identifier: String::new(),
            socket_path: None,
            state_path: None,
            timing: Timing::default(),
        }
    }
}

fn default_label() -> String {
    DEFAULT_LABEL.to_string()
}

impl HelperSettings {
    /// Loads settings from `path` or from the default location.
    /// A missing default file yields the defaults, a missing explicit file is an error.
    pub async fn load(path: Option<String>) -> Result<(Self, String), LoadSettingsError> {
        let path = match path {
            Some(v) => v,
            None => {
                let path = Self::get_default_path().await;
                if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    tracing::info!(%path, "no settings file, using defaults");
                    return Ok((Self::default(), path));
                }
                path
            }
        };

        let settings = filetype_load(&path).await?;
        Ok((settings, path))
    }

    pub fn with_label_override(mut self, label: Option<String>) -> Self {
        if let Some(label) = label {
            if label != self.label {
                tracing::warn!(%label, settings = %self.label, "using label from cli args not settings file");
            }
            self.label = label;
        }
        self
    }

    /// Label resolution for the daemon: the cli label wins, then the label
    /// implied by the location of the running binary.
    pub fn with_daemon_label(self, cli_label: Option<String>, executable: Option<&Path>) -> Self {
        let label = cli_label.or_else(|| executable.and_then(HelperPaths::label_of_installed));
        self.with_label_override(label)
    }

    pub fn paths(&self) -> HelperPaths {
        HelperPaths::new(&self.label)
    }

    pub fn socket_path(&self) -> PathBuf {
        match &self.socket_path {
            Some(path) => PathBuf::from(path),
            None => self.paths().socket(),
        }
    }

    pub fn state_path(&self) -> PathBuf {
        match &self.state_path {
            Some(path) => PathBuf::from(path),
            None => self.paths().run_state(),
        }
    }

    pub async fn get_default_path() -> String {
        if tokio::fs::try_exists("privileged_helper.toml").await.unwrap_or(false) {
            return "privileged_helper.toml".to_string();
        }

        let Some(config_path) = dirs::config_local_dir() else {
            return "privileged_helper.toml".to_string();
        };

        format!("{}/privileged_helper/settings.toml", config_path.to_string_lossy())
    }
}

/// Waits and limits of the install loop and the daemon, all in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub status_timeout_ms: u64,
    pub kill_wait_ms: u64,
    pub uninstall_wait_ms: u64,
    pub install_settle_ms: u64,
    pub update_settle_ms: u64,
    pub legacy_settle_ms: u64,
    pub reset_wait_ms: u64,
    pub idle_check_interval_ms: u64,
    pub uninstall_poll_ms: u64,
    pub max_install_attempts: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            status_timeout_ms: 10_000,
            kill_wait_ms: 100,
            uninstall_wait_ms: 500,
            install_settle_ms: 100,
            update_settle_ms: 500,
            legacy_settle_ms: 500,
            reset_wait_ms: 3_000,
            idle_check_interval_ms: 1_000,
            uninstall_poll_ms: 50,
            max_install_attempts: 4,
        }
    }
}

impl Timing {
    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_millis(self.kill_wait_ms)
    }

    pub fn uninstall_wait(&self) -> Duration {
        Duration::from_millis(self.uninstall_wait_ms)
    }

    pub fn install_settle(&self) -> Duration {
        Duration::from_millis(self.install_settle_ms)
    }

    pub fn update_settle(&self) -> Duration {
        Duration::from_millis(self.update_settle_ms)
    }

    pub fn legacy_settle(&self) -> Duration {
        Duration::from_millis(self.legacy_settle_ms)
    }

    pub fn reset_wait(&self) -> Duration {
        Duration::from_millis(self.reset_wait_ms)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_millis(self.idle_check_interval_ms)
    }

    pub fn uninstall_poll(&self) -> Duration {
        Duration::from_millis(self.uninstall_poll_ms)
    }

    /// Every wait shortened, for tests.
    pub fn immediate() -> Self {
        Timing {
            status_timeout_ms: 200,
            kill_wait_ms: 1,
            uninstall_wait_ms: 1,
            install_settle_ms: 1,
            update_settle_ms: 1,
            legacy_settle_ms: 1,
            reset_wait_ms: 1,
            idle_check_interval_ms: 20,
            uninstall_poll_ms: 5,
            max_install_attempts: 4,
        }
    }
}

async fn filetype_load<T: DeserializeOwned>(path: &str) -> Result<T, LoadSettingsError> {
    let data = tokio::fs::read_to_string(path)
        .await
        .map_err(LoadSettingsError::IoError)?;

    if path.ends_with(".toml") {
        return toml::from_str(&data).map_err(|_| LoadSettingsError::ParseError);
    }

    serde_json::from_str(&data).map_err(|_| {
        if path.ends_with(".json") {
            LoadSettingsError::ParseError
        } else {
            LoadSettingsError::UnknownFiletype(path.to_string())
        }
    })
}

#[derive(Debug)]
pub enum LoadSettingsError {
    IoError(std::io::Error),
    ParseError,
    UnknownFiletype(String),
}

impl std::fmt::Display for LoadSettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadSettingsError::IoError(e) => write!(f, "Failed to read settings: {}", e),
            LoadSettingsError::ParseError => write!(f, "Failed to parse settings"),
            LoadSettingsError::UnknownFiletype(path) => {
                write!(f, "Unknown settings file type: {}", path)
            }
        }
    }
}

impl std::error::Error for LoadSettingsError {}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{HelperSettings, LoadSettingsError, Timing};
    use crate::descriptor::LaunchDaemonDescriptor;

    #[tokio::test]
    async fn load_toml_with_partial_timing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(
            &path,
            r#"
label = "com.example.helper"
app_bundle_identifier = "com.example.app"

[timing]
status_timeout_ms = 2500
"#,
        )
        .unwrap();

        let (settings, loaded_from) =
            HelperSettings::load(Some(path.to_string_lossy().to_string())).await.unwrap();
        assert_eq!(loaded_from, path.to_string_lossy());
        assert_eq!(settings.label, "com.example.helper");
        assert_eq!(settings.app_bundle_identifier, "com.example.app");
        assert_eq!(settings.timing.status_timeout(), Duration::from_millis(2500));
        assert_eq!(settings.timing.kill_wait(), Duration::from_millis(100));
        assert_eq!(settings.timing.max_install_attempts, 4);
        assert_eq!(
            settings.socket_path().to_string_lossy(),
            "/var/run/com.example.helper.sock"
        );
    }

    #[tokio::test]
    async fn load_json_overrides_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"label":"com.example.helper","socket_path":"/tmp/h.sock","state_path":"/tmp/state.toml"}"#,
        )
        .unwrap();

        let (settings, _) = HelperSettings::load(Some(path.to_string_lossy().to_string()))
            .await
            .unwrap();
        assert_eq!(settings.socket_path().to_string_lossy(), "/tmp/h.sock");
        assert_eq!(settings.state_path().to_string_lossy(), "/tmp/state.toml");
        assert_eq!(settings.timing, Timing::default());
    }

    #[tokio::test]
    async fn bad_files_report_errors() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("broken.toml");
        std::fs::write(&toml_path, "label = [").unwrap();
        assert!(matches!(
            HelperSettings::load(Some(toml_path.to_string_lossy().to_string())).await,
            Err(LoadSettingsError::ParseError)
        ));

        let other_path = dir.path().join("settings.conf");
        std::fs::write(&other_path, "label: x").unwrap();
        assert!(matches!(
            HelperSettings::load(Some(other_path.to_string_lossy().to_string())).await,
            Err(LoadSettingsError::UnknownFiletype(_))
        ));

        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            HelperSettings::load(Some(missing.to_string_lossy().to_string())).await,
            Err(LoadSettingsError::IoError(_))
        ));
    }

    #[test]
    fn label_override_wins() {
        let settings = HelperSettings::default().with_label_override(Some("com.other".to_string()));
        assert_eq!(settings.label, "com.other");
        assert_eq!(
            settings.paths().installed_binary().to_string_lossy(),
            "/Library/PrivilegedHelperTools/com.other"
        );
    }

    #[test]
    fn daemon_dials_same_socket_as_manager() {
        let manager = HelperSettings {
            label: "com.example.helper".to_string(),
            ..Default::default()
        };

        /* started by launchd from the legacy plist */
        let args = LaunchDaemonDescriptor::new(&manager.paths(), "com.example.app").program_arguments();
        let cli_label = args
            .iter()
            .position(|arg| arg == "--label")
            .map(|at| args[at + 1].clone());
        let launched = HelperSettings::default().with_daemon_label(cli_label, None);
        assert_eq!(launched.socket_path(), manager.socket_path());

        /* started from a blessed plist, no arguments */
        let installed = manager.paths().installed_binary();
        let blessed = HelperSettings::default().with_daemon_label(None, Some(&installed));
        assert_eq!(blessed.socket_path(), manager.socket_path());
        assert_eq!(blessed.paths().installed_binary(), installed);
        assert_eq!(blessed.state_path(), manager.state_path());
    }

    #[test]
    fn daemon_outside_tools_dir_keeps_settings_label() {
        let settings = HelperSettings::default()
            .with_daemon_label(None, Some(std::path::Path::new("/usr/local/bin/privileged-helper")));
        assert_eq!(settings.label, super::DEFAULT_LABEL);
    }
}
