use std::path::Path;
use std::time::Duration;

use privileged_helper_kit::paths::HelperPaths;

/// System service registry the helper removes itself from.
pub trait ServiceRegistry: Send + Sync {
    fn unregister(&self, label: &str) -> std::io::Result<()>;
}

/// System domain launchd, driven through `service-manager`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LaunchdRegistry;

#[cfg(target_os = "macos")]
impl ServiceRegistry for LaunchdRegistry {
    fn unregister(&self, label: &str) -> std::io::Result<()> {
        use service_manager::{LaunchdServiceManager, ServiceLabel, ServiceManager, ServiceUninstallCtx};

        let label: ServiceLabel = label
            .parse()
            .map_err(|error| std::io::Error::new(std::io::ErrorKind::InvalidInput, error))?;

        LaunchdServiceManager::system().uninstall(ServiceUninstallCtx { label })
    }
}

#[cfg(not(target_os = "macos"))]
impl ServiceRegistry for LaunchdRegistry {
    fn unregister(&self, label: &str) -> std::io::Result<()> {
        tracing::warn!(%label, "launchd is not available on this platform");
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "launchd is only available on macOS",
        ))
    }
}

/// Returns once `pid` no longer exists.
pub async fn wait_for_pid_exit(pid: i32, poll: Duration) {
    if pid <= 0 {
        tracing::warn!(pid, "not waiting on invalid pid");
        return;
    }

    while pid_alive(pid) {
        tokio::time::sleep(poll).await;
    }
    tracing::info!(pid, "process has exited");
}

#[cfg(unix)]
fn pid_alive(pid: i32) -> bool {
    /* signal 0 only checks existence; EPERM still means the pid exists */
    let res = unsafe { libc::kill(pid, 0) };
    if res == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: i32) -> bool {
    false
}

/// Removes the launchd job, its plist and the installed binary.
/// Every step is attempted even when an earlier one fails.
pub fn self_uninstall<R: ServiceRegistry + ?Sized>(registry: &R, paths: &HelperPaths) {
    tracing::info!(label = paths.label(), "uninstalling helper");

    if let Err(error) = registry.unregister(paths.label()) {
        tracing::error!(?error, "failed to unregister launchd job");
    }

    remove_if_present(&paths.launch_daemon_plist());
    remove_if_present(&paths.installed_binary());
}

fn remove_if_present(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::info!(path = %path.display(), "removed"),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => tracing::error!(?error, path = %path.display(), "failed to remove"),
    }
}
