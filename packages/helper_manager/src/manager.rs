use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use privileged_helper_kit::logging::{LogForwardLayer, LogLevel};
use privileged_helper_kit::paths::HelperPaths;
use privileged_helper_kit::HelperVersion;
use privileged_helper_kit::settings::{HelperSettings, Timing};
use tokio::sync::Mutex;

use crate::broker::ConnectionBroker;
use crate::delegate::{
    HelperDelegate, InstallChoice, InstallReport, LegacyInstallChoice, LoginItemChoice,
};
use crate::error::HelperError;
use crate::platform::HelperPlatform;
use crate::script::{install_script, removal_script};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperStatus {
    Installed,
    NotFound,
    NeedsUpdate { uninstall_first: bool },
    RequiresApproval,
}

/// State carried across the iterations of one reconciliation.
#[derive(Debug, Clone, Copy, Default)]
struct InstallAttempt {
    tries: u32,
    after_update: bool,
    legacy: bool,
}

enum InstallOutcome {
    Installed { legacy: bool },
    Stop,
}

pub struct HelperManager<D: HelperDelegate, P: HelperPlatform> {
    label: String,
    app_bundle_identifier: String,
    paths: HelperPaths,
    timing: Timing,
    delegate: Arc<D>,
    platform: Arc<P>,
    broker: ConnectionBroker,
    install_lock: Mutex<()>,
}

impl<D: HelperDelegate, P: HelperPlatform> HelperManager<D, P> {
    pub fn new(settings: &HelperSettings, delegate: D, platform: P) -> Self {
        Self::with_paths(settings, settings.paths(), delegate, platform)
    }

    /// Same as [`HelperManager::new`] with the file system layout replaced.
    pub fn with_paths(settings: &HelperSettings, paths: HelperPaths, delegate: D, platform: P) -> Self {
        let delegate = Arc::new(delegate);

        let disconnect_delegate = delegate.clone();
        let broker = ConnectionBroker::new(
            settings.socket_path(),
            Arc::new(move |reason| disconnect_delegate.on_disconnect(reason)),
        );

        HelperManager {
            label: settings.label.clone(),
            app_bundle_identifier: settings.app_bundle_identifier.clone(),
            paths,
            timing: settings.timing.clone(),
            delegate,
            platform: Arc::new(platform),
            broker,
            install_lock: Mutex::new(()),
        }
    }

    pub fn broker(&self) -> &ConnectionBroker {
        &self.broker
    }

    pub fn delegate(&self) -> &D {
        &self.delegate
    }

    /// Layer forwarding this crate's log events to [`HelperDelegate::on_log`].
    pub fn log_layer(&self) -> LogForwardLayer<impl Fn(LogLevel, String) + Send + Sync + 'static> {
        let delegate = self.delegate.clone();
        LogForwardLayer::new(move |level, message| delegate.on_log(level, message))
            .for_target(env!("CARGO_CRATE_NAME"))
    }

    /// Version reported by the running helper.
    pub async fn helper_version(&self) -> Result<HelperVersion, HelperError> {
        let shared_directory = self.delegate.shared_directory();
        self.broker.get_remote_version(shared_directory.as_deref()).await
    }

    pub async fn helper_status(&self) -> HelperStatus {
        let plist = self.paths.launch_daemon_plist();
        if self.on_platform(move |p| p.requires_approval(&plist)).await.unwrap_or(false) {
            tracing::warn!("helper requires approval in login items");
            return HelperStatus::RequiresApproval;
        }

        let Some(Some(bundled)) = self.on_platform(|p| p.bundled_helper_version()).await else {
            tracing::error!("bundled helper version not readable");
            return HelperStatus::NotFound;
        };

        if !self.on_platform(|p| p.installed_helper_exists()).await.unwrap_or(false) {
            tracing::info!(path = %self.paths.installed_binary().display(), "helper binary not installed");
            return HelperStatus::NotFound;
        }

        let started = Instant::now();
        let live = match tokio::time::timeout(self.timing.status_timeout(), self.helper_version()).await {
            Ok(Ok(version)) => version,
            Ok(Err(error)) => {
                tracing::warn!(%error, elapsed_ms = started.elapsed().as_millis() as u64, "failed to get helper version");
                return HelperStatus::NotFound;
            }
            Err(_) => {
                tracing::warn!(elapsed_ms = started.elapsed().as_millis() as u64, "helper version request timed out");
                return HelperStatus::NotFound;
            }
        };

        tracing::info!(installed = %live, required = %bundled, "compared helper versions");

        let uninstall_first = match self.delegate.minimum_uninstall_version() {
            Some(min) => live.is_greater_or_equal(&min),
            None => false,
        };

        tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "checked helper");

        if live == bundled {
            HelperStatus::Installed
        } else {
            HelperStatus::NeedsUpdate { uninstall_first }
        }
    }

    /// Brings the installed helper in line with the bundled one, prompting the
    /// user as needed. Returns true once the helper is installed and current.
    pub async fn check_helper_install(&self) -> bool {
        let _install = self.install_lock.lock().await;
        tracing::debug!("checking helper install");

        let mut attempt = InstallAttempt::default();

        loop {
            let status = self.helper_status().await;

            let is_update = match status {
                HelperStatus::Installed => {
                    tracing::info!(tries = attempt.tries, "helper is installed");
                    self.delegate.on_installed(InstallReport {
                        after_update: attempt.after_update,
                        legacy: attempt.legacy,
                        tries: attempt.tries,
                    });
                    return true;
                }
                HelperStatus::RequiresApproval => {
                    self.resolve_approval().await;
                    return false;
                }
                _ if self.timing.max_install_attempts <= attempt.tries => {
                    tracing::error!(tries = attempt.tries, "helper still not installed, giving up");
                    return false;
                }
                HelperStatus::NeedsUpdate { uninstall_first: true } => {
                    tracing::info!("helper needs update, uninstalling older");
                    self.broker.uninstall_peer().await;
                    tokio::time::sleep(self.timing.uninstall_wait()).await;
                    true
                }
                HelperStatus::NeedsUpdate { uninstall_first: false } => {
                    tracing::info!("helper needs update, stopping older");
                    self.broker.exit_peer().await;
                    tokio::time::sleep(self.timing.kill_wait()).await;
                    true
                }
                HelperStatus::NotFound => false,
            };

            tracing::info!(tries = attempt.tries, is_update, "helper needs install");
            let outcome = if attempt.tries == 0 {
                self.install_privileged().await
            } else {
                self.install_legacy().await
            };

            let InstallOutcome::Installed { legacy } = outcome else {
                return false;
            };

            let settle = if is_update {
                self.timing.update_settle()
            } else {
                self.timing.install_settle()
            };
            tokio::time::sleep(settle).await;

            attempt = InstallAttempt {
                tries: attempt.tries + 1,
                after_update: is_update,
                legacy,
            };
        }
    }

    async fn resolve_approval(&self) {
        match self.delegate.show_login_item_alert().await {
            LoginItemChoice::OpenSystemSettings => {
                self.on_platform(|p| p.open_login_items_settings()).await;
            }
            LoginItemChoice::ResetDaemon => {
                let script = removal_script(&self.paths);
                match self.on_platform(move |p| p.run_privileged_script(&script)).await {
                    Some(Ok(())) => {
                        self.broker.invalidate().await;
                        tokio::time::sleep(self.timing.reset_wait()).await;
                    }
                    Some(Err(error)) => tracing::error!(%error, "failed to remove helper"),
                    None => {}
                }
            }
        }
    }

    async fn install_privileged(&self) -> InstallOutcome {
        match self.delegate.show_install_alert().await {
            InstallChoice::Install => {}
            InstallChoice::Cancel => {
                tracing::error!("user refused to install privileged helper");
                return InstallOutcome::Stop;
            }
            InstallChoice::Quit => {
                self.platform.terminate_app();
                return InstallOutcome::Stop;
            }
        }

        let label = self.label.clone();
        let result = self.on_platform(move |p| p.bless(&label)).await;
        self.broker.invalidate().await;

        let error = match result {
            Some(Ok(())) => return InstallOutcome::Installed { legacy: false },
            Some(Err(error)) => error,
            None => return InstallOutcome::Stop,
        };

        tracing::error!(%error, "privileged install failed");
        if let Some(command) = error.clipboard_remediation() {
            self.on_platform(move |p| p.copy_to_clipboard(&command)).await;
        }
        self.delegate.show_text_alert(error.alert_text()).await;

        if !error.should_retry_legacy() {
            return InstallOutcome::Stop;
        }

        self.install_legacy().await
    }

    async fn install_legacy(&self) -> InstallOutcome {
        if self.delegate.show_legacy_install_alert().await == LegacyInstallChoice::Cancel {
            tracing::info!("user declined legacy install");
            return InstallOutcome::Stop;
        }

        let app_path: PathBuf = self.platform.app_path();
        let script = match install_script(&self.paths, &app_path, &self.app_bundle_identifier) {
            Ok(script) => script,
            Err(error) => {
                tracing::error!(%error, "failed to build install script");
                self.delegate.show_text_alert(error.to_string()).await;
                return InstallOutcome::Stop;
            }
        };

        match self.on_platform(move |p| p.run_privileged_script(&script)).await {
            Some(Ok(())) => {}
            Some(Err(error)) => {
                tracing::error!(%error, "legacy install failed");
                self.delegate.show_text_alert(error.to_string()).await;
                return InstallOutcome::Stop;
            }
            None => return InstallOutcome::Stop,
        }

        self.broker.invalidate().await;
        tokio::time::sleep(self.timing.legacy_settle()).await;
        InstallOutcome::Installed { legacy: true }
    }

    async fn on_platform<T, F>(&self, call: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&P) -> T + Send + 'static,
    {
        let platform = self.platform.clone();
        match tokio::task::spawn_blocking(move || call(&platform)).await {
            Ok(res) => Some(res),
            Err(error) => {
                tracing::error!(?error, "platform call failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};

    use privileged_helper_kit::HelperRequest;
    use privileged_helper_kit::logging::LogLevel;
    use privileged_helper_kit::paths::HelperPaths;
    use privileged_helper_kit::settings::{HelperSettings, Timing};
    use tempfile::TempDir;
    use tracing_subscriber::layer::SubscriberExt;

    use super::{HelperManager, HelperStatus};
    use crate::delegate::{InstallChoice, InstallReport, LegacyInstallChoice, LoginItemChoice};
    use crate::install::{BlessErrorCode, InstallError};
    use crate::testing::{FakeDaemon, FakeDelegate, FakePlatform, LABEL, version};

    struct Harness {
        _dir: TempDir,
        daemon: FakeDaemon,
        manager: HelperManager<FakeDelegate, FakePlatform>,
    }

    async fn harness<F: FnOnce(&mut FakePlatform)>(
        live: Option<(&str, &str)>,
        delegate: FakeDelegate,
        configure: F,
    ) -> Harness {
        let _ = tracing_subscriber::fmt::try_init();
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("helper.sock");

        let daemon = FakeDaemon::start(&socket, live.map(|(b, s)| version(b, s))).await;
        let mut platform = FakePlatform::new(Some(version("10", "1.1")), &daemon);
        configure(&mut platform);

        let settings = HelperSettings {
            label: LABEL.to_string(),
            app_bundle_identifier: "com.example.app".to_string(),
            socket_path: Some(socket.to_string_lossy().to_string()),
            state_path: None,
            timing: Timing::immediate(),
        };
        let paths = HelperPaths::with_root(dir.path(), LABEL);

        Harness {
            manager: HelperManager::with_paths(&settings, paths, delegate, platform),
            daemon,
            _dir: dir,
        }
    }

    fn installed(platform: &mut FakePlatform) {
        platform.installed.store(true, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn status_not_found_without_installed_binary() {
        let h = harness(Some(("10", "1.1")), FakeDelegate::default(), |_| {}).await;

        assert_eq!(h.manager.helper_status().await, HelperStatus::NotFound);
        assert!(h.daemon.requests().is_empty());
    }

    #[tokio::test]
    async fn status_installed_when_versions_match() {
        let h = harness(Some(("10", "1.1")), FakeDelegate::default(), installed).await;

        assert_eq!(h.manager.helper_status().await, HelperStatus::Installed);
        assert_eq!(
            h.daemon.requests(),
            vec![HelperRequest::GetVersion {
                shared_directory: "/tmp/shared".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn status_needs_update_when_versions_differ() {
        let h = harness(Some(("9", "1.0")), FakeDelegate::default(), installed).await;
        assert_eq!(
            h.manager.helper_status().await,
            HelperStatus::NeedsUpdate {
                uninstall_first: false
            }
        );

        let delegate = FakeDelegate {
            minimum_uninstall: Some(version("1", "1.0")),
            ..FakeDelegate::default()
        };
        let h = harness(Some(("9", "1.0")), delegate, installed).await;
        assert_eq!(
            h.manager.helper_status().await,
            HelperStatus::NeedsUpdate {
                uninstall_first: true
            }
        );

        let delegate = FakeDelegate {
            minimum_uninstall: Some(version("1", "2.0")),
            ..FakeDelegate::default()
        };
        let h = harness(Some(("9", "1.0")), delegate, installed).await;
        assert_eq!(
            h.manager.helper_status().await,
            HelperStatus::NeedsUpdate {
                uninstall_first: false
            }
        );
    }

    #[tokio::test]
    async fn status_requires_approval_first() {
        let h = harness(Some(("10", "1.1")), FakeDelegate::default(), |p| {
            installed(p);
            p.requires_approval.store(true, Ordering::SeqCst);
        })
        .await;

        assert_eq!(h.manager.helper_status().await, HelperStatus::RequiresApproval);
        assert!(h.daemon.requests().is_empty());
    }

    #[tokio::test]
    async fn status_silent_helper_times_out_as_not_found() {
        let h = harness(Some(("10", "1.1")), FakeDelegate::default(), installed).await;
        h.daemon.silent.store(true, Ordering::SeqCst);

        let started = Instant::now();
        assert_eq!(h.manager.helper_status().await, HelperStatus::NotFound);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn status_without_helper_or_directory_is_not_found() {
        let mut h = harness(Some(("10", "1.1")), FakeDelegate::default(), installed).await;
        h.daemon.stop();
        assert_eq!(h.manager.helper_status().await, HelperStatus::NotFound);

        let delegate = FakeDelegate {
            shared_directory: None,
            ..FakeDelegate::default()
        };
        let h = harness(Some(("10", "1.1")), delegate, installed).await;
        assert_eq!(h.manager.helper_status().await, HelperStatus::NotFound);

        let h = harness(Some(("10", "1.1")), FakeDelegate::default(), |p| {
            installed(p);
            p.bundled = None;
        })
        .await;
        assert_eq!(h.manager.helper_status().await, HelperStatus::NotFound);
    }

    #[tokio::test]
    async fn install_with_consent_converges() {
        let h = harness(None, FakeDelegate::default(), |_| {}).await;

        assert!(h.manager.check_helper_install().await);
        assert_eq!(h.manager.platform.calls(), vec!["bless".to_string()]);
        assert_eq!(
            *h.manager.delegate().installed.lock().unwrap(),
            vec![InstallReport {
                after_update: false,
                legacy: false,
                tries: 1
            }]
        );
        assert_eq!(h.manager.helper_status().await, HelperStatus::Installed);
    }

    #[tokio::test]
    async fn already_installed_reports_zero_tries() {
        let h = harness(Some(("10", "1.1")), FakeDelegate::default(), installed).await;

        assert!(h.manager.check_helper_install().await);
        assert!(h.manager.platform.calls().is_empty());
        assert_eq!(
            *h.manager.delegate().installed.lock().unwrap(),
            vec![InstallReport::default()]
        );
    }

    #[tokio::test]
    async fn cancel_stops_without_installing() {
        let delegate = FakeDelegate {
            install_choice: InstallChoice::Cancel,
            ..FakeDelegate::default()
        };
        let h = harness(None, delegate, |_| {}).await;

        assert!(!h.manager.check_helper_install().await);
        assert!(h.manager.platform.calls().is_empty());
        assert!(h.manager.delegate().installed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn quit_terminates_app() {
        let delegate = FakeDelegate {
            install_choice: InstallChoice::Quit,
            ..FakeDelegate::default()
        };
        let h = harness(None, delegate, |_| {}).await;

        assert!(!h.manager.check_helper_install().await);
        assert_eq!(h.manager.platform.calls(), vec!["terminate_app".to_string()]);
    }

    #[tokio::test]
    async fn bless_failure_falls_back_to_legacy() {
        let h = harness(None, FakeDelegate::default(), |p| {
            p.bless_result = std::sync::Mutex::new(Err(InstallError::Bless {
                code: BlessErrorCode::ToolNotValid,
                label: LABEL.to_string(),
            }));
        })
        .await;

        assert!(h.manager.check_helper_install().await);
        assert_eq!(
            h.manager.platform.calls(),
            vec!["bless".to_string(), "install_script".to_string()]
        );
        assert_eq!(
            *h.manager.delegate().alerts.lock().unwrap(),
            vec!["blessError: kSMErrorToolNotValid".to_string()]
        );
        assert_eq!(
            *h.manager.delegate().installed.lock().unwrap(),
            vec![InstallReport {
                after_update: false,
                legacy: true,
                tries: 1
            }]
        );
    }

    #[tokio::test]
    async fn declined_legacy_install_stops() {
        let delegate = FakeDelegate {
            legacy_choice: LegacyInstallChoice::Cancel,
            ..FakeDelegate::default()
        };
        let h = harness(None, delegate, |p| {
            p.bless_result = std::sync::Mutex::new(Err(InstallError::AdminRightsDenied(-60006)));
        })
        .await;

        assert!(!h.manager.check_helper_install().await);
        assert_eq!(h.manager.platform.calls(), vec!["bless".to_string()]);
    }

    #[tokio::test]
    async fn failed_legacy_script_shows_error() {
        let h = harness(None, FakeDelegate::default(), |p| {
            p.bless_result = std::sync::Mutex::new(Err(InstallError::AuthorizationFailed(-1)));
            p.script_fails.store(true, Ordering::SeqCst);
        })
        .await;

        assert!(!h.manager.check_helper_install().await);
        let alerts = h.manager.delegate().alerts.lock().unwrap().clone();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0], "Failed to create authorization!");
        assert!(alerts[1].contains("exit code 1"));
    }

    #[tokio::test]
    async fn job_must_be_enabled_copies_command_and_stops() {
        let h = harness(None, FakeDelegate::default(), |p| {
            p.bless_result = std::sync::Mutex::new(Err(InstallError::Bless {
                code: BlessErrorCode::JobMustBeEnabled,
                label: LABEL.to_string(),
            }));
        })
        .await;

        assert!(!h.manager.check_helper_install().await);
        assert_eq!(
            h.manager.platform.clipboard.lock().unwrap().as_deref(),
            Some("sudo launchctl enable system/com.example.helper")
        );
        assert_eq!(h.manager.platform.count("install_script"), 0);
        assert_eq!(h.manager.delegate().alerts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_with_uninstall_capable_helper_sends_uninstall() {
        let delegate = FakeDelegate {
            minimum_uninstall: Some(version("1", "1.0")),
            ..FakeDelegate::default()
        };
        let h = harness(Some(("9", "1.0")), delegate, installed).await;

        assert!(h.manager.check_helper_install().await);
        assert!(h.daemon.requests().contains(&HelperRequest::Uninstall));
        assert!(!h.daemon.requests().contains(&HelperRequest::ExitProcess));
        assert_eq!(
            *h.manager.delegate().installed.lock().unwrap(),
            vec![InstallReport {
                after_update: true,
                legacy: false,
                tries: 1
            }]
        );
    }

    #[tokio::test]
    async fn update_without_uninstall_support_stops_old_helper() {
        let h = harness(Some(("9", "1.0")), FakeDelegate::default(), installed).await;

        assert!(h.manager.check_helper_install().await);
        assert!(h.daemon.requests().contains(&HelperRequest::ExitProcess));
        assert!(!h.daemon.requests().contains(&HelperRequest::Uninstall));
    }

    #[tokio::test]
    async fn approval_opens_settings() {
        let h = harness(None, FakeDelegate::default(), |p| {
            p.requires_approval.store(true, Ordering::SeqCst);
        })
        .await;

        assert!(!h.manager.check_helper_install().await);
        assert_eq!(
            h.manager.platform.calls(),
            vec!["open_login_items_settings".to_string()]
        );
    }

    #[tokio::test]
    async fn approval_reset_removes_daemon() {
        let delegate = FakeDelegate {
            login_choice: LoginItemChoice::ResetDaemon,
            ..FakeDelegate::default()
        };
        let h = harness(Some(("10", "1.1")), delegate, |p| {
            installed(p);
            p.requires_approval.store(true, Ordering::SeqCst);
        })
        .await;

        assert!(!h.manager.check_helper_install().await);
        assert_eq!(h.manager.platform.calls(), vec!["removal_script".to_string()]);
        assert!(!h.manager.platform.installed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let h = harness(None, FakeDelegate::default(), |_| {}).await;
        h.daemon.silent.store(true, Ordering::SeqCst);

        assert!(!h.manager.check_helper_install().await);
        assert_eq!(h.manager.platform.count("bless"), 1);
        assert_eq!(
            h.manager.platform.count("install_script"),
            Timing::immediate().max_install_attempts as usize - 1
        );
        assert!(h.manager.delegate().installed.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_checks_install_once() {
        let h = harness(None, FakeDelegate::default(), |p| {
            p.bless_delay = Duration::from_millis(100);
        })
        .await;

        let (a, b) = tokio::join!(h.manager.check_helper_install(), h.manager.check_helper_install());
        assert!(a && b);

        assert_eq!(h.manager.platform.count("bless"), 1);
        assert_eq!(h.manager.platform.max_active_blesses.load(Ordering::SeqCst), 1);
        assert_eq!(h.manager.delegate().install_prompts.load(Ordering::SeqCst), 1);
        assert_eq!(h.manager.delegate().installed.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn log_layer_forwards_manager_events() {
        let h = harness(None, FakeDelegate::default(), |p| p.bundled = None).await;

        let subscriber = tracing_subscriber::registry().with(h.manager.log_layer());
        let _guard = tracing::subscriber::set_default(subscriber);

        assert_eq!(h.manager.helper_status().await, HelperStatus::NotFound);
        tracing::info!(target: "elsewhere", "not forwarded");

        let logs = h.manager.delegate().logs.lock().unwrap().clone();
        assert_eq!(
            logs,
            vec![(LogLevel::Error, "bundled helper version not readable".to_string())]
        );
    }
}
