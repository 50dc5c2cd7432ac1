use std::path::PathBuf;
use std::sync::Arc;

use privileged_helper_kit::channel::{ConnectionId, PeerCredentials, ServerEvent, ServiceServer};
use privileged_helper_kit::codesign::{CodeSigning, check_peer};
use privileged_helper_kit::logging::{LogForwardLayer, LogLevel};
use privileged_helper_kit::paths::HelperPaths;
use privileged_helper_kit::settings::{HelperSettings, Timing};
use privileged_helper_kit::{HelperProto, HelperRequest};
use tokio::sync::mpsc::Receiver;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::delegate::{ConnectionBehavior, RunnerDelegate};
use crate::dispatcher::Dispatcher;
use crate::process::{ProcessControl, UninstallCommand};
use crate::run_state::{RunStateError, RunStateStore};

/// The daemon: accepts trusted callers and answers their requests until
/// stopped.
pub struct HelperRunner {
    paths: HelperPaths,
    socket_path: PathBuf,
    timing: Timing,
    delegate: Option<Arc<dyn RunnerDelegate>>,
    signing: Arc<dyn CodeSigning>,
    process: Arc<dyn ProcessControl>,
    run_state: Arc<dyn RunStateStore>,
    settings_file: Option<String>,
    stop: CancellationToken,
}

/// Callers currently connected, in connection order.
#[derive(Debug, Default)]
struct ConnectionSet {
    connections: Vec<(ConnectionId, PeerCredentials)>,
}

impl ConnectionSet {
    fn push(&mut self, id: ConnectionId, peer: PeerCredentials) {
        self.connections.push((id, peer));
    }

    fn remove(&mut self, id: ConnectionId) -> bool {
        let before = self.connections.len();
        self.connections.retain(|(existing, _)| *existing != id);
        before != self.connections.len()
    }

    fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn len(&self) -> usize {
        self.connections.len()
    }
}

impl HelperRunner {
    pub fn new(
        settings: &HelperSettings,
        signing: Arc<dyn CodeSigning>,
        process: Arc<dyn ProcessControl>,
        run_state: Arc<dyn RunStateStore>,
    ) -> Self {
        HelperRunner {
            paths: settings.paths(),
            socket_path: settings.socket_path(),
            timing: settings.timing.clone(),
            delegate: None,
            signing,
            process,
            run_state,
            settings_file: None,
            stop: CancellationToken::new(),
        }
    }

    /// Without a delegate every connection is rejected.
    pub fn with_delegate(mut self, delegate: Arc<dyn RunnerDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    pub fn with_paths(mut self, paths: HelperPaths) -> Self {
        self.paths = paths;
        self
    }

    /// Settings file this helper was started with, handed on to the uninstaller.
    pub fn with_settings_file(mut self, settings_file: Option<String>) -> Self {
        self.settings_file = settings_file;
        self
    }

    fn uninstall_command(&self) -> UninstallCommand {
        UninstallCommand {
            program: self.paths.installed_binary(),
            label: self.paths.label().to_string(),
            settings: self.settings_file.clone(),
        }
    }

    /// Cancelling the token makes [`HelperRunner::run`] return within one
    /// idle check interval.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Layer forwarding this crate's log events to [`RunnerDelegate::on_log`].
    pub fn log_layer(
        &self,
    ) -> Option<LogForwardLayer<impl Fn(LogLevel, String) + Send + Sync + 'static>> {
        let delegate = self.delegate.clone()?;
        Some(
            LogForwardLayer::new(move |level, message| delegate.on_log(level, message))
                .for_target(env!("CARGO_CRATE_NAME")),
        )
    }

    pub async fn run(&self) -> Result<(), RunnerError> {
        match self.run_state.load() {
            Ok(true) => tracing::warn!("last run did not quit normally"),
            Ok(false) => tracing::info!("last run quit normally"),
            Err(error) => tracing::error!(?error, "failed to read run state"),
        }
        self.run_state.store(true).map_err(RunnerError::State)?;

        let (server, events) =
            match ServiceServer::<HelperProto>::start(&self.socket_path, self.connection_gate()).await {
                Ok(res) => res,
                Err(error) => {
                    tracing::error!(?error, path = %self.socket_path.display(), "failed to start listener");
                    self.mark_stopped();
                    return Err(RunnerError::Bind(error));
                }
            };

        tracing::info!(path = %server.path().display(), "helper listening");
        self.serve(events).await;

        server.shutdown();
        drop(server);

        tracing::info!("helper stopped");
        self.run_state.store(false).map_err(RunnerError::State)
    }

    fn connection_gate(&self) -> impl Fn(&PeerCredentials) -> bool + Send + Sync + 'static {
        let has_delegate = self.delegate.is_some();
        let signing = self.signing.clone();

        move |peer: &PeerCredentials| {
            if !has_delegate {
                tracing::warn!(pid = ?peer.pid, "no delegate configured, rejecting connection");
                return false;
            }

            match check_peer(signing.as_ref(), peer.pid) {
                Ok(()) => true,
                Err(error) => {
                    tracing::warn!(%error, pid = ?peer.pid, "peer failed code signing check");
                    false
                }
            }
        }
    }

    async fn serve(&self, mut events: Receiver<ServerEvent<HelperProto>>) {
        let dispatcher = Dispatcher::new(
            self.delegate.clone(),
            self.process.clone(),
            self.uninstall_command(),
        );
        let mut connections = ConnectionSet::default();

        let mut idle_check = tokio::time::interval(self.timing.idle_check_interval());
        idle_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        tracing::error!("listener closed");
                        break;
                    };
                    self.handle_event(event, &dispatcher, &mut connections).await;
                }
                _ = idle_check.tick() => {
                    if self.stop.is_cancelled() {
                        tracing::info!(connections = connections.len(), "stop requested");
                        break;
                    }
                }
            }
        }
    }

    async fn handle_event(
        &self,
        event: ServerEvent<HelperProto>,
        dispatcher: &Dispatcher,
        connections: &mut ConnectionSet,
    ) {
        match event {
            ServerEvent::Connected { id, peer } => {
                connections.push(id, peer);
                self.notify_delegate(ConnectionBehavior::Established);
            }
            ServerEvent::Request { connection, request } => {
                tracing::debug!(connection, msg = ?request.msg, "got request");

                if matches!(
                    request.msg,
                    HelperRequest::ExitProcess | HelperRequest::Uninstall
                ) {
                    self.mark_stopped();
                }

                let Some(response) = dispatcher.dispatch(request.msg) else {
                    return;
                };
                if !request.sender.send(response).await {
                    tracing::warn!(connection, "caller went away before the response");
                }
            }
            ServerEvent::Disconnected(id) => {
                if !connections.remove(id) {
                    return;
                }
                self.notify_delegate(ConnectionBehavior::Invalidated);

                let quit_when_idle = self
                    .delegate
                    .as_ref()
                    .is_some_and(|delegate| delegate.should_quit_when_idle());

                if connections.is_empty() && quit_when_idle {
                    tracing::info!("last connection closed, quitting when idle");
                    self.stop.cancel();
                }
            }
        }
    }

    fn notify_delegate(&self, behavior: ConnectionBehavior) {
        if let Some(delegate) = &self.delegate {
            delegate.on_connection_event(behavior);
        }
    }

    fn mark_stopped(&self) {
        if let Err(error) = self.run_state.store(false) {
            tracing::error!(?error, "failed to update run state");
        }
    }
}

#[derive(Debug)]
pub enum RunnerError {
    Bind(std::io::Error),
    State(RunStateError),
}

impl std::fmt::Display for RunnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerError::Bind(e) => write!(f, "failed to start listener: {}", e),
            RunnerError::State(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for RunnerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunnerError::Bind(e) => Some(e),
            RunnerError::State(e) => Some(e),
        }
    }
}
