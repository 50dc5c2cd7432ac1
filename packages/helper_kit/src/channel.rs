//! Newline delimited JSON request/response channel over a unix socket.
//!
//! One [`ServiceServer`] runs inside the privileged helper, every caller holds
//! one [`ServiceClient`]. Requests carry an id and the server answers with the
//! same id, so several requests can be in flight on one connection.

use std::io;
use std::marker::PhantomData;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use slab::Slab;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;

pub trait ServiceProto: 'static {
    type Request: Serialize + DeserializeOwned + Send + 'static;
    type Response: Serialize + DeserializeOwned + Send + 'static;
}

const MAX_PENDING_REQUESTS: usize = 1024;

type PendingResponses<T> = Arc<Mutex<Option<Slab<oneshot::Sender<WrappedMsg<T>>>>>>;

pub struct ServiceClient<S: ServiceProto> {
    pending: PendingResponses<S::Response>,
    to_send: Sender<WireMessage<S::Request>>,
    cancel: CancellationToken,
    _phantom: PhantomData<S>,
}

impl<S: ServiceProto> ServiceClient<S> {
    pub async fn connect<P: AsRef<Path>>(path: P) -> Result<Self, io::Error> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self::from_stream(stream))
    }

    fn from_stream(stream: UnixStream) -> Self {
        let (read, mut write) = stream.into_split();
        let cancel = CancellationToken::new();
        let pending: PendingResponses<S::Response> =
            Arc::new(Mutex::new(Some(Slab::with_capacity(16))));

        let read_cancel = cancel.clone();
        let read_pending = pending.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read).lines();
            loop {
                let json_line = match read_cancel.run_until_cancelled(lines.next_line()).await {
                    None => break,
                    Some(Ok(Some(line))) => line,
                    Some(Ok(None)) => {
                        tracing::info!("helper closed connection");
                        break;
                    }
                    Some(Err(error)) => {
                        tracing::error!(?error, "got error reading next line from helper");
                        break;
                    }
                };

                let response = match serde_json::from_str::<WireMessage<S::Response>>(&json_line) {
                    Ok(res) => res,
                    Err(error) => {
                        tracing::error!(?error, "failed to read response from helper");
                        break;
                    }
                };

                let mut lock = read_pending.lock().await;
                let Some(pending) = lock.as_mut() else { break };

                let Some(handler) = pending.try_remove(response.id as usize) else {
                    tracing::error!(id = response.id, "helper sent response for request we did not make");
                    continue;
                };

                let _ = handler.send(response.msg);
            }
            read_cancel.cancel();
        });

        let (to_send_tx, mut to_send_rx) = mpsc::channel::<WireMessage<S::Request>>(64);

        let write_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut buf = Vec::new();
            while let Some(Some(msg)) = write_cancel.run_until_cancelled(to_send_rx.recv()).await {
                buf.clear();
                if let Err(error) = serde_json::to_writer(&mut buf, &msg) {
                    tracing::error!(?error, "failed to serialize request");
                    continue;
                }
                buf.push(b'\n');

                if let Err(error) = write.write_all(&buf).await {
                    tracing::error!(?error, "failed to write request to helper");
                    break;
                }
                let _ = write.flush().await;
            }
            write_cancel.cancel();
        });

        let pending_kill = pending.clone();
        let cancel_kill = cancel.clone();
        tokio::spawn(async move {
            cancel_kill.cancelled().await;

            tracing::debug!("closing all pending requests");
            let mut pending = pending_kill.lock().await;
            let _ = pending.take();
        });

        ServiceClient {
            pending,
            to_send: to_send_tx,
            cancel,
            _phantom: PhantomData,
        }
    }

    pub async fn send_request(
        &self,
        request: S::Request,
    ) -> Result<S::Response, ServiceClientError> {
        match self.send(WrappedMsg::Msg(request)).await? {
            WrappedMsg::FailedToParseMessage => Err(ServiceClientError::RequestNotSupported),
            WrappedMsg::Msg(msg) => Ok(msg),
            _ => Err(ServiceClientError::UnexpectedResponse),
        }
    }

    /// Sends a request the server will not answer.
    pub async fn notify(&self, request: S::Request) -> Result<(), ServiceClientError> {
        if self.cancel.is_cancelled() {
            return Err(ServiceClientError::ServerDisconnected);
        }

        self.to_send
            .send(WireMessage {
                id: 0,
                msg: WrappedMsg::Notify(request),
            })
            .await
            .map_err(|_| ServiceClientError::ServerDisconnected)
    }

    pub async fn ping(&self) -> Result<(), ServiceClientError> {
        match self.send(WrappedMsg::Ping).await? {
            WrappedMsg::Pong => Ok(()),
            _ => Err(ServiceClientError::UnexpectedResponse),
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token cancelled once the connection is gone, for whatever reason.
    pub fn close_signal(&self) -> CancellationToken {
        self.cancel.clone()
    }

    async fn send(
        &self,
        request: WrappedMsg<S::Request>,
    ) -> Result<WrappedMsg<S::Response>, ServiceClientError> {
        let (id, rx) = {
            let mut lock = self.pending.lock().await;
            let Some(pending) = lock.as_mut() else {
                return Err(ServiceClientError::ServerDisconnected);
            };

            if MAX_PENDING_REQUESTS <= pending.len() {
                return Err(ServiceClientError::TooManyRequests);
            }

            let (tx, rx) = oneshot::channel();
            (pending.insert(tx) as u64, rx)
        };

        self.to_send
            .send(WireMessage { id, msg: request })
            .await
            .map_err(|_| ServiceClientError::ServerDisconnected)?;

        rx.await.map_err(|_| ServiceClientError::ServerDisconnected)
    }
}

impl<S: ServiceProto> Drop for ServiceClient<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceClientError {
    RequestNotSupported,
    ServerDisconnected,
    TooManyRequests,
    UnexpectedResponse,
}

impl std::fmt::Display for ServiceClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceClientError::RequestNotSupported => write!(f, "Request not supported by helper"),
            ServiceClientError::ServerDisconnected => write!(f, "Helper disconnected"),
            ServiceClientError::TooManyRequests => write!(f, "Too many pending requests"),
            ServiceClientError::UnexpectedResponse => write!(f, "Unexpected response from helper"),
        }
    }
}

impl std::error::Error for ServiceClientError {}

/// Credentials of the process on the other end of an accepted socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub pid: Option<i32>,
    pub uid: u32,
}

pub type ConnectionId = u64;

/// Decides whether an accepted socket is allowed to talk to the server.
/// Runs before any byte is read from the peer.
pub trait ConnectionGate: Send + Sync + 'static {
    fn accept(&self, peer: &PeerCredentials) -> bool;
}

impl<F> ConnectionGate for F
where
    F: Fn(&PeerCredentials) -> bool + Send + Sync + 'static,
{
    fn accept(&self, peer: &PeerCredentials) -> bool {
        self(peer)
    }
}

pub enum ServerEvent<S: ServiceProto> {
    Connected {
        id: ConnectionId,
        peer: PeerCredentials,
    },
    Request {
        connection: ConnectionId,
        request: ServiceRequest<S>,
    },
    Disconnected(ConnectionId),
}

pub struct ServiceServer<S: ServiceProto> {
    path: PathBuf,
    cancel: CancellationToken,
    _phantom: PhantomData<S>,
}

impl<S: ServiceProto> ServiceServer<S> {
    /// Binds the socket and starts accepting connections.
    ///
    /// Fails with [`io::ErrorKind::AlreadyExists`] when another server answers
    /// pings on the same path. A stale socket file is replaced.
    pub async fn start<P: Into<PathBuf>, G: ConnectionGate>(
        path: P,
        gate: G,
    ) -> Result<(Self, Receiver<ServerEvent<S>>), io::Error> {
        let path = path.into();

        let listener = match UnixListener::bind(&path) {
            Ok(res) => res,
            Err(error) => {
                tracing::warn!(
                    ?error,
                    "got error setting up server, checking if already exists"
                );

                'try_connect: {
                    let Ok(client) = ServiceClient::<S>::connect(&path).await else {
                        break 'try_connect;
                    };

                    if client.ping().await.is_ok() {
                        return Err(io::Error::new(
                            io::ErrorKind::AlreadyExists,
                            "server already running",
                        ));
                    }
                }

                let _ = std::fs::remove_file(&path);
                UnixListener::bind(&path)?
            }
        };

        /* the helper runs as root, callers do not; access is checked by the gate */
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666))?;

        let (event_tx, event_rx) = mpsc::channel::<ServerEvent<S>>(1024);
        let server_cancel = CancellationToken::new();
        let gate = Arc::new(gate);

        let accept_cancel = server_cancel.clone();
        tokio::spawn(async move {
            let mut next_id: ConnectionId = 1;

            while let Some(accepted) = accept_cancel.run_until_cancelled(listener.accept()).await {
                let stream = match accepted {
                    Ok((stream, _)) => stream,
                    Err(error) => {
                        tracing::error!(?error, "failed to receive next connection");
                        continue;
                    }
                };

                let peer = match stream.peer_cred() {
                    Ok(cred) => PeerCredentials {
                        pid: cred.pid(),
                        uid: cred.uid(),
                    },
                    Err(error) => {
                        tracing::error!(?error, "failed to read peer credentials, dropping connection");
                        continue;
                    }
                };

                let id = next_id;
                next_id += 1;

                let gate = gate.clone();
                let event_tx = event_tx.clone();
                let server_cancel = accept_cancel.clone();

                /* the gate may block on code signing lookups */
                tokio::spawn(async move {
                    let accepted = match tokio::task::spawn_blocking(move || gate.accept(&peer)).await {
                        Ok(accepted) => accepted,
                        Err(error) => {
                            tracing::error!(?error, id, "connection gate panicked");
                            false
                        }
                    };

                    if !accepted {
                        tracing::warn!(id, pid = ?peer.pid, uid = peer.uid, "connection rejected");
                        return;
                    }

                    tracing::info!(id, pid = ?peer.pid, "got new socket connection");
                    if event_tx.send(ServerEvent::Connected { id, peer }).await.is_err() {
                        tracing::info!("event listener is closed");
                        server_cancel.cancel();
                        return;
                    }

                    serve_connection::<S>(id, stream, event_tx, server_cancel);
                });
            }

            accept_cancel.cancel();
            tracing::info!("server is shut down");
        });

        Ok((
            ServiceServer {
                path,
                cancel: server_cancel,
                _phantom: PhantomData,
            },
            event_rx,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl<S: ServiceProto> Drop for ServiceServer<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
        let _ = std::fs::remove_file(&self.path);
    }
}

fn serve_connection<S: ServiceProto>(
    id: ConnectionId,
    stream: UnixStream,
    event_tx: Sender<ServerEvent<S>>,
    server_cancel: CancellationToken,
) {
    let client_cancel = server_cancel.child_token();
    let (read, mut write) = stream.into_split();
    let (send_to_client, mut to_send) = mpsc::channel::<WireMessage<S::Response>>(64);

    let write_cancel = client_cancel.clone();
    tokio::spawn(async move {
        let mut buf = Vec::new();

        while let Some(Some(msg)) = write_cancel.run_until_cancelled(to_send.recv()).await {
            buf.clear();
            if let Err(error) = serde_json::to_writer(&mut buf, &msg) {
                tracing::error!(?error, "failed to serialize response");
                continue;
            }
            buf.push(b'\n');

            if let Err(error) = write.write_all(&buf).await {
                tracing::error!(?error, "failed to write message to client");
                break;
            }
            let _ = write.flush().await;
        }

        write_cancel.cancel();
    });

    tokio::spawn(async move {
        let requests = read_requests::<S>(id, read, send_to_client, event_tx.clone(), server_cancel);
        client_cancel.run_until_cancelled(requests).await;
        client_cancel.cancel();

        let _ = event_tx.send(ServerEvent::Disconnected(id)).await;
    });
}

async fn read_requests<S: ServiceProto>(
    id: ConnectionId,
    read: tokio::net::unix::OwnedReadHalf,
    send_to_client: Sender<WireMessage<S::Response>>,
    event_tx: Sender<ServerEvent<S>>,
    server_cancel: CancellationToken,
) {
    let mut reader = BufReader::new(read).lines();

    loop {
        let line = match reader.next_line().await {
            Err(error) => {
                tracing::error!(?error, id, "error reading next line from client");
                break;
            }
            Ok(None) => {
                tracing::info!(id, "client closed");
                break;
            }
            Ok(Some(line)) => line,
        };

        let request = match serde_json::from_str::<WireRequestRecoverable<S::Request>>(&line) {
            Ok(request) => request,
            Err(error) => {
                tracing::error!(?error, id, "failed to parse request from client");
                break;
            }
        };

        let (request_id, msg) = match request {
            WireRequestRecoverable::Request(WireMessage {
                id: request_id,
                msg: WrappedMsg::Msg(msg),
            }) => (Some(request_id), msg),
            WireRequestRecoverable::Request(WireMessage {
                msg: WrappedMsg::Notify(msg),
                ..
            }) => (None, msg),
            WireRequestRecoverable::Request(WireMessage {
                id: request_id,
                msg: WrappedMsg::Ping,
            }) => {
                let _ = send_to_client
                    .send(WireMessage {
                        id: request_id,
                        msg: WrappedMsg::Pong,
                    })
                    .await;
                continue;
            }
            WireRequestRecoverable::Failed { id: request_id } => {
                let _ = send_to_client
                    .send(WireMessage {
                        id: request_id,
                        msg: WrappedMsg::FailedToParseMessage,
                    })
                    .await;
                continue;
            }
            _ => continue,
        };

        let event = ServerEvent::Request {
            connection: id,
            request: ServiceRequest {
                msg,
                sender: ResponseSender {
                    id: request_id,
                    response: send_to_client.clone(),
                },
            },
        };

        if event_tx.send(event).await.is_err() {
            tracing::info!("request listener is closed");
            server_cancel.cancel();
            return;
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum WireRequestRecoverable<T> {
    Request(WireMessage<T>),
    Failed { id: u64 },
}

#[derive(Debug, Serialize, Deserialize)]
enum WrappedMsg<T> {
    FailedToParseMessage,
    Ping,
    Pong,
    Msg(T),
    Notify(T),
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage<T> {
    id: u64,
    msg: WrappedMsg<T>,
}

pub struct ServiceRequest<S: ServiceProto> {
    pub msg: S::Request,
    pub sender: ResponseSender<S::Response>,
}

pub struct ResponseSender<T> {
    id: Option<u64>,
    response: Sender<WireMessage<T>>,
}

impl<T> ResponseSender<T> {
    /// False for notifications, the client is not waiting on them.
    pub fn expects_response(&self) -> bool {
        self.id.is_some()
    }

    pub async fn send(self, response: T) -> bool {
        let Some(id) = self.id else { return true };

        self.response
            .send(WireMessage {
                id,
                msg: WrappedMsg::Msg(response),
            })
            .await
            .is_ok()
    }
}
