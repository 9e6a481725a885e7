//! Framed privileged operation server.
//!
//! One connection, one request at a time: a frame is decoded, dispatched,
//! answered, and only then is the next frame read.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use stockade_common::error::{Result, StockadeError};
use stockade_core::affinity::AffinityExecutor;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::methods::{self, Methods};
use super::protocol::{Request, Response};

/// Serves one engine's operation catalogue.
#[derive(Clone)]
pub struct PrivilegedServer {
    methods: Arc<dyn Methods>,
    executor: AffinityExecutor,
    poisoned: Arc<AtomicBool>,
}

impl std::fmt::Debug for PrivilegedServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivilegedServer")
            .field("executor", &self.executor)
            .field("poisoned", &self.is_poisoned())
            .finish_non_exhaustive()
    }
}

impl PrivilegedServer {
    /// Creates a server dispatching to `methods`.
    #[must_use]
    pub fn new(methods: Arc<dyn Methods>, executor: AffinityExecutor) -> Self {
        Self {
            methods,
            executor,
            poisoned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns whether an unsafe-state error stopped the server.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Binds `socket`, accepts a single caller and serves it.
    ///
    /// # Errors
    ///
    /// Returns transport errors, or an error once the server is poisoned.
    pub async fn serve_unix_socket(&self, socket: &Path) -> Result<()> {
        let listener = UnixListener::bind(socket).map_err(|e| StockadeError::Io {
            path: socket.to_path_buf(),
            source: e,
        })?;
        tracing::info!(socket = %socket.display(), "waiting for supervisor connection");
        let (stream, _) = listener.accept().await.map_err(|e| StockadeError::Io {
            path: socket.to_path_buf(),
            source: e,
        })?;
        self.serve_stream(stream).await
    }

    /// Serves requests from `stream` until the peer closes it.
    ///
    /// # Errors
    ///
    /// Returns transport errors, or an error once the server is poisoned.
    pub async fn serve_stream<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
        while let Some(frame) = framed.next().await {
            let frame = frame.map_err(|e| StockadeError::Transport {
                message: format!("reading request frame: {e}"),
            })?;
            let response = match serde_json::from_slice::<Request>(&frame) {
                Ok(request) => self.handle_request(request).await,
                Err(e) => {
                    tracing::warn!(error = %e, "undecodable request frame");
                    Response::error(&StockadeError::Config {
                        message: format!("invalid request frame: {e}"),
                    })
                }
            };
            send_response(&mut framed, &response).await?;

            if self.is_poisoned() {
                return Err(StockadeError::Internal {
                    message: "server poisoned by an unsafe-state error".into(),
                });
            }
        }
        tracing::debug!("caller closed the connection");
        Ok(())
    }

    /// Executes one request and builds its response.
    ///
    /// The method body runs on the blocking pool. A poisoned server refuses
    /// every request.
    pub async fn handle_request(&self, request: Request) -> Response {
        let method = request.method();
        if self.is_poisoned() {
            tracing::error!(method, "refusing request on poisoned server");
            return Response::error(&StockadeError::Internal {
                message: format!("{method} refused: server is in an unsafe state"),
            });
        }

        tracing::debug!(method, "dispatching privileged request");
        let poisons = poisons_server(&request);
        let methods = Arc::clone(&self.methods);
        let executor = self.executor.clone();
        let outcome =
            tokio::task::spawn_blocking(move || methods::dispatch(&*methods, &executor, request))
                .await
                .unwrap_or_else(|e| {
                    Err(StockadeError::Internal {
                        message: format!("{method} task failed: {e}"),
                    })
                });

        match outcome {
            Ok(reply) => Response::Ok(reply),
            Err(error) => {
                if poisons && error.is_unsafe() {
                    self.poisoned.store(true, Ordering::SeqCst);
                    tracing::error!(method, error = %error, "unsafe state, poisoning server");
                } else {
                    tracing::warn!(method, error = %error, "privileged request failed");
                }
                Response::error(&error)
            }
        }
    }
}

/// Decrypt restores its namespace on a thread that is thrown away, so a
/// failed restore there cannot leak into later requests.
const fn poisons_server(request: &Request) -> bool {
    !matches!(request, Request::Decrypt(_))
}

async fn send_response<S>(
    framed: &mut Framed<S, LengthDelimitedCodec>,
    response: &Response,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(response)?;
    framed
        .send(Bytes::from(payload))
        .await
        .map_err(|e| StockadeError::Transport {
            message: format!("writing response frame: {e}"),
        })
}
