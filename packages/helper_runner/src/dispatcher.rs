use std::sync::Arc;

use privileged_helper_kit::{HelperRequest, HelperResponse};

use crate::delegate::RunnerDelegate;
use crate::process::{ProcessControl, UninstallCommand};

/// Maps each request to its effect. Knows nothing about sockets.
pub struct Dispatcher {
    delegate: Option<Arc<dyn RunnerDelegate>>,
    process: Arc<dyn ProcessControl>,
    uninstaller: UninstallCommand,
}

impl Dispatcher {
    pub fn new(
        delegate: Option<Arc<dyn RunnerDelegate>>,
        process: Arc<dyn ProcessControl>,
        uninstaller: UninstallCommand,
    ) -> Self {
        Dispatcher {
            delegate,
            process,
            uninstaller,
        }
    }

    /// Returns the response to send back, if the request has one.
    pub fn dispatch(&self, request: HelperRequest) -> Option<HelperResponse> {
        match request {
            HelperRequest::GetVersion { shared_directory } => {
                let version = self
                    .delegate
                    .as_ref()
                    .and_then(|delegate| delegate.helper_version(&shared_directory));

                match &version {
                    Some(version) => tracing::debug!(%version, "reporting helper version"),
                    None => tracing::debug!("helper version is unknown"),
                }
                Some(HelperResponse::Version(version))
            }
            HelperRequest::ExitProcess => {
                tracing::info!("exit requested");
                self.process.exit(0);
                None
            }
            HelperRequest::Uninstall => {
                tracing::info!(program = %self.uninstaller.program.display(), "uninstall requested");
                if let Err(error) = self
                    .process
                    .spawn_uninstaller(&self.uninstaller, std::process::id())
                {
                    tracing::error!(?error, "failed to spawn uninstaller");
                }
                self.process.exit(0);
                None
            }
        }
    }
}
