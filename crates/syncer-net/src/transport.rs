//! TCP pull transport
//!
//! Each pull opens a connection, sends one `PullRequest` frame and reads one
//! `PullResponse` frame. The server side answers from whatever
//! [`SnapshotSource`] it was given and never blocks on outbound sync work.

use crate::framing::{Frame, FrameCodec, FrameError, FrameType};
use crate::messages::{PullRequest, PullResponse};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Unexpected frame: {0:?}")]
    UnexpectedFrame(FrameType),
    #[error("Bind failed on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

/// Client side of the pull RPC
#[async_trait]
pub trait PullClient: Send + Sync {
    /// Pull a snapshot from the peer listening on `addr`
    async fn pull(
        &self,
        addr: SocketAddr,
        request: PullRequest,
    ) -> Result<PullResponse, TransportError>;
}

/// Answers incoming pulls, normally from the latest cached local export
pub trait SnapshotSource: Send + Sync {
    fn answer(&self, request: &PullRequest) -> PullResponse;
}

/// One-connection-per-pull TCP client
#[derive(Debug, Default, Clone)]
pub struct TcpPullClient;

impl TcpPullClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PullClient for TcpPullClient {
    async fn pull(
        &self,
        addr: SocketAddr,
        request: PullRequest,
    ) -> Result<PullResponse, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, FrameCodec::new());

        framed.send(request.to_frame()?).await?;

        let frame = framed
            .next()
            .await
            .ok_or(TransportError::ConnectionClosed)??;
        if frame.frame_type != FrameType::PullResponse {
            return Err(TransportError::UnexpectedFrame(frame.frame_type));
        }
        Ok(PullResponse::from_frame(&frame)?)
    }
}

/// Pull RPC server
pub struct TransportServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TransportServer {
    /// Bind the listener and start accepting pulls.
    ///
    /// The server stops when `shutdown` is cancelled or [`stop`](Self::stop) is called.
    pub async fn bind(
        addr: SocketAddr,
        source: Arc<dyn SnapshotSource>,
        shutdown: CancellationToken,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::BindFailed { addr, source })?;
        let local_addr = listener.local_addr()?;
        info!("Pull transport listening on {}", local_addr);

        let token = shutdown.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer)) => {
                                debug!("Accepted pull connection from {}", peer);
                                let source = source.clone();
                                let token = token.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = serve_connection(stream, source, token).await {
                                        warn!("Pull connection error from {}: {}", peer, e);
                                    }
                                });
                            }
                            Err(e) => {
                                warn!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = token.cancelled() => {
                        break;
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            shutdown,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    /// Address actually bound (useful when binding port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for the accept loop to exit
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
            info!("Pull transport on {} stopped", self.local_addr);
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    source: Arc<dyn SnapshotSource>,
    shutdown: CancellationToken,
) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, FrameCodec::new());

    loop {
        let frame: Frame = tokio::select! {
            next = framed.next() => match next {
                Some(frame) => frame?,
                None => return Ok(()),
            },
            _ = shutdown.cancelled() => return Ok(()),
        };

        if frame.frame_type != FrameType::PullRequest {
            return Err(TransportError::UnexpectedFrame(frame.frame_type));
        }
        let request = PullRequest::from_frame(&frame)?;
        debug!(
            "Pull from cluster {} since version {}",
            request.requester, request.since_version
        );

        let response = source.answer(&request);
        framed.send(response.to_frame()?).await?;
    }
}
