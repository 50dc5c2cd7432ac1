//! Owns the single connection to the privileged helper.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use privileged_helper_kit::channel::ServiceClient;
use privileged_helper_kit::{HelperProto, HelperRequest, HelperResponse, HelperVersion};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::delegate::DisconnectReason;
use crate::error::HelperError;

pub type DisconnectHandler = Arc<dyn Fn(DisconnectReason) + Send + Sync>;

type HelperClient = ServiceClient<HelperProto>;

#[derive(Clone)]
pub struct ConnectionBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    socket_path: PathBuf,
    current: Mutex<Option<LiveConnection>>,
    generation: AtomicU64,
    on_disconnect: DisconnectHandler,
}

struct LiveConnection {
    generation: u64,
    client: Arc<HelperClient>,
}

impl ConnectionBroker {
    pub fn new<P: Into<PathBuf>>(socket_path: P, on_disconnect: DisconnectHandler) -> Self {
        ConnectionBroker {
            inner: Arc::new(BrokerInner {
                socket_path: socket_path.into(),
                current: Mutex::new(None),
                generation: AtomicU64::new(1),
                on_disconnect,
            }),
        }
    }

    /// Returns the live connection, connecting if there is none.
    pub async fn connection(&self) -> Result<Arc<HelperClient>, HelperError> {
        let mut current = self.inner.current.lock().await;

        if let Some(live) = current.as_ref() {
            if !live.client.is_closed() {
                return Ok(live.client.clone());
            }
        }

        let client = match HelperClient::connect(&self.inner.socket_path).await {
            Ok(client) => Arc::new(client),
            Err(error) => {
                tracing::error!(?error, path = %self.inner.socket_path.display(), "failed to connect to helper");
                *current = None;
                (self.inner.on_disconnect)(DisconnectReason::Invalidated);
                return Err(HelperError::ConnectFailed(error));
            }
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst);
        tracing::info!(generation, "helper connection established");

        tokio::spawn(watch_connection(
            Arc::downgrade(&self.inner),
            generation,
            client.close_signal(),
        ));

        *current = Some(LiveConnection {
            generation,
            client: client.clone(),
        });

        Ok(client)
    }

    /// Drops and closes the current connection, if any.
    pub async fn invalidate(&self) {
        let live = self.inner.current.lock().await.take();
        if let Some(live) = live {
            tracing::debug!(generation = live.generation, "invalidating helper connection");
            live.client.close();
        }
    }

    pub async fn get_remote_version(
        &self,
        shared_directory: Option<&str>,
    ) -> Result<HelperVersion, HelperError> {
        let Some(shared_directory) = shared_directory else {
            return Err(HelperError::WorkingDirectoryNotProvided);
        };

        let client = self.connection().await?;
        let response = client
            .send_request(HelperRequest::GetVersion {
                shared_directory: shared_directory.to_string(),
            })
            .await?;

        match response {
            HelperResponse::Version(Some(version)) => Ok(version),
            HelperResponse::Version(None) => Err(HelperError::RunnerVersionEmpty),
        }
    }

    /// Asks the helper to exit. Does nothing when it cannot be reached.
    pub async fn exit_peer(&self) {
        self.notify(HelperRequest::ExitProcess).await;
    }

    /// Asks the helper to remove itself and exit. Does nothing when it cannot be reached.
    pub async fn uninstall_peer(&self) {
        self.notify(HelperRequest::Uninstall).await;
    }

    async fn notify(&self, request: HelperRequest) {
        let Ok(client) = self.connection().await else {
            tracing::info!(?request, "helper not reachable, skipping");
            return;
        };

        if let Err(error) = client.notify(request).await {
            tracing::warn!(?error, "failed to notify helper");
        }
    }
}

async fn watch_connection(
    inner: Weak<BrokerInner>,
    generation: u64,
    closed: CancellationToken,
) {
    closed.cancelled().await;

    let Some(inner) = inner.upgrade() else { return };

    let reason = {
        let mut current = inner.current.lock().await;
        match current.as_ref() {
            Some(live) if live.generation == generation => {
                *current = None;
                DisconnectReason::Interrupted
            }
            _ => DisconnectReason::Invalidated,
        }
    };

    match reason {
        DisconnectReason::Interrupted => tracing::warn!(generation, "helper connection interrupted"),
        DisconnectReason::Invalidated => tracing::info!(generation, "helper connection invalidated"),
    }

    (inner.on_disconnect)(reason);
}
