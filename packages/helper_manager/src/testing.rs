use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use privileged_helper_kit::channel::{PeerCredentials, ServerEvent, ServiceServer};
use privileged_helper_kit::logging::LogLevel;
use privileged_helper_kit::{HelperProto, HelperRequest, HelperResponse, HelperVersion};

use crate::delegate::{
    DisconnectReason, HelperDelegate, InstallChoice, InstallReport, LegacyInstallChoice,
    LoginItemChoice,
};
use crate::install::{InstallError, ScriptError};
use crate::platform::HelperPlatform;

pub const LABEL: &str = "com.example.helper";

pub fn version(build: &str, short: &str) -> HelperVersion {
    HelperVersion::new(LABEL, build, short)
}

/// Stand-in for the privileged helper, serving on a temp socket.
pub struct FakeDaemon {
    pub version: Arc<Mutex<Option<HelperVersion>>>,
    pub requests: Arc<Mutex<Vec<HelperRequest>>>,
    pub silent: Arc<AtomicBool>,
    pub connections: Arc<AtomicUsize>,
    server: Option<ServiceServer<HelperProto>>,
}

impl FakeDaemon {
    pub async fn start(path: &Path, version: Option<HelperVersion>) -> Self {
        let (server, mut events) =
            ServiceServer::<HelperProto>::start(path, |_: &PeerCredentials| true)
                .await
                .unwrap();

        let version = Arc::new(Mutex::new(version));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let silent = Arc::new(AtomicBool::new(false));
        let connections = Arc::new(AtomicUsize::new(0));

        let task_connections = connections.clone();
        let task_version = version.clone();
        let task_requests = requests.clone();
        let task_silent = silent.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();

            while let Some(event) = events.recv().await {
                let request = match event {
                    ServerEvent::Request { request, .. } => request,
                    ServerEvent::Connected { .. } => {
                        task_connections.fetch_add(1, Ordering::SeqCst);
                        continue;
                    }
                    ServerEvent::Disconnected(_) => continue,
                };
                task_requests.lock().unwrap().push(request.msg.clone());

                if let HelperRequest::GetVersion { .. } = request.msg {
                    if task_silent.load(Ordering::SeqCst) {
                        held.push(request.sender);
                        continue;
                    }

                    let current = task_version.lock().unwrap().clone();
                    request.sender.send(HelperResponse::Version(current)).await;
                }
            }
        });

        FakeDaemon {
            version,
            requests,
            silent,
            connections,
            server: Some(server),
        }
    }

    pub fn requests(&self) -> Vec<HelperRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn stop(&mut self) {
        self.server.take();
    }
}

pub struct FakeDelegate {
    pub shared_directory: Option<String>,
    pub minimum_uninstall: Option<HelperVersion>,
    pub install_choice: InstallChoice,
    pub legacy_choice: LegacyInstallChoice,
    pub login_choice: LoginItemChoice,
    pub alerts: Mutex<Vec<String>>,
    pub installed: Mutex<Vec<InstallReport>>,
    pub disconnects: Mutex<Vec<DisconnectReason>>,
    pub logs: Mutex<Vec<(LogLevel, String)>>,
    pub install_prompts: AtomicUsize,
}

impl Default for FakeDelegate {
    fn default() -> Self {
        FakeDelegate {
            shared_directory: Some("/tmp/shared".to_string()),
            minimum_uninstall: None,
            install_choice: InstallChoice::Install,
            legacy_choice: LegacyInstallChoice::Confirm,
            login_choice: LoginItemChoice::OpenSystemSettings,
            alerts: Mutex::new(Vec::new()),
            installed: Mutex::new(Vec::new()),
            disconnects: Mutex::new(Vec::new()),
            logs: Mutex::new(Vec::new()),
            install_prompts: AtomicUsize::new(0),
        }
    }
}

impl HelperDelegate for FakeDelegate {
    fn shared_directory(&self) -> Option<String> {
        self.shared_directory.clone()
    }

    fn minimum_uninstall_version(&self) -> Option<HelperVersion> {
        self.minimum_uninstall.clone()
    }

    fn on_log(&self, level: LogLevel, message: String) {
        self.logs.lock().unwrap().push((level, message));
    }

    fn on_disconnect(&self, reason: DisconnectReason) {
        self.disconnects.lock().unwrap().push(reason);
    }

    fn on_installed(&self, report: InstallReport) {
        self.installed.lock().unwrap().push(report);
    }

    async fn show_text_alert(&self, text: String) {
        self.alerts.lock().unwrap().push(text);
    }

    async fn show_login_item_alert(&self) -> LoginItemChoice {
        self.login_choice
    }

    async fn show_install_alert(&self) -> InstallChoice {
        self.install_prompts.fetch_add(1, Ordering::SeqCst);
        self.install_choice
    }

    async fn show_legacy_install_alert(&self) -> LegacyInstallChoice {
        self.legacy_choice
    }
}

/// Records every call. A successful bless or script "installs" the bundled
/// version into the fake daemon.
pub struct FakePlatform {
    pub bundled: Option<HelperVersion>,
    pub daemon_version: Arc<Mutex<Option<HelperVersion>>>,
    pub installed: AtomicBool,
    pub requires_approval: AtomicBool,
    pub bless_result: Mutex<Result<(), InstallError>>,
    pub script_fails: AtomicBool,
    pub bless_delay: Duration,
    pub calls: Mutex<Vec<String>>,
    pub clipboard: Mutex<Option<String>>,
    pub active_blesses: AtomicUsize,
    pub max_active_blesses: AtomicUsize,
}

impl FakePlatform {
    pub fn new(bundled: Option<HelperVersion>, daemon: &FakeDaemon) -> Self {
        FakePlatform {
            bundled,
            daemon_version: daemon.version.clone(),
            installed: AtomicBool::new(false),
            requires_approval: AtomicBool::new(false),
            bless_result: Mutex::new(Ok(())),
            script_fails: AtomicBool::new(false),
            bless_delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            clipboard: Mutex::new(None),
            active_blesses: AtomicUsize::new(0),
            max_active_blesses: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }

    fn install_bundled(&self) {
        self.installed.store(true, Ordering::SeqCst);
        *self.daemon_version.lock().unwrap() = self.bundled.clone();
    }
}

impl HelperPlatform for FakePlatform {
    fn app_path(&self) -> PathBuf {
        PathBuf::from("/Applications/Example.app")
    }

    fn bundled_helper_version(&self) -> Option<HelperVersion> {
        self.bundled.clone()
    }

    fn installed_helper_exists(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    fn requires_approval(&self, _plist: &Path) -> bool {
        self.requires_approval.load(Ordering::SeqCst)
    }

    fn open_login_items_settings(&self) {
        self.record("open_login_items_settings");
    }

    fn copy_to_clipboard(&self, text: &str) {
        self.record("copy_to_clipboard");
        *self.clipboard.lock().unwrap() = Some(text.to_string());
    }

    fn bless(&self, _label: &str) -> Result<(), InstallError> {
        self.record("bless");

        let active = self.active_blesses.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_blesses.fetch_max(active, Ordering::SeqCst);
        std::thread::sleep(self.bless_delay);
        self.active_blesses.fetch_sub(1, Ordering::SeqCst);

        let result = self.bless_result.lock().unwrap().clone();
        if result.is_ok() {
            self.install_bundled();
        }
        result
    }

    fn run_privileged_script(&self, script: &str) -> Result<(), ScriptError> {
        if script.contains("launchctl load") {
            self.record("install_script");
        } else {
            self.record("removal_script");
        }

        if self.script_fails.load(Ordering::SeqCst) {
            return Err(ScriptError::Failed {
                status: Some(1),
                stderr: "cp: no such file".to_string(),
            });
        }

        if script.contains("launchctl load") {
            self.install_bundled();
        } else {
            self.installed.store(false, Ordering::SeqCst);
            self.requires_approval.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    fn terminate_app(&self) {
        self.record("terminate_app");
    }
}
