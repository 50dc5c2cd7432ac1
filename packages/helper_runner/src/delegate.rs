use privileged_helper_kit::HelperVersion;
use privileged_helper_kit::logging::LogLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionBehavior {
    Established,
    Invalidated,
}

/// Host side hooks of the daemon.
pub trait RunnerDelegate: Send + Sync + 'static {
    /// Version this helper reports to callers. `None` when unknown.
    fn helper_version(&self, shared_directory: &str) -> Option<HelperVersion>;

    fn on_connection_event(&self, behavior: ConnectionBehavior) {
        let _ = behavior;
    }

    /// Exit once the last caller has disconnected.
    fn should_quit_when_idle(&self) -> bool {
        false
    }

    fn on_log(&self, level: LogLevel, message: String) {
        let _ = (level, message);
    }
}
