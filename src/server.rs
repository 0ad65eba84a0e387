//! TCP server for terminal upgrades and the HTTP API.
//!
//! Both share one listener. Each connection's request head is read first:
//! upgrade requests (and anything aimed at the terminal path) go through the
//! handshake and then to a [`Bridge`]; everything else is handed to the
//! axum router with the bytes already read replayed in front of the stream.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes};
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::api::{self, AppState};
use crate::bridge::Bridge;
use crate::config::{Config, ConfigError};
use crate::handshake::{self, RequestHead};
use crate::session::SessionRegistry;

struct ServerInner {
    bridge: Bridge,
    router: axum::Router,
    terminal_path: String,
    max_head_bytes: usize,
}

/// Connection dispatcher. Cheap to clone.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(bridge: Bridge, terminal_path: impl Into<String>, max_head_bytes: usize) -> Self {
        let router = api::router(AppState {
            sessions: bridge.registry().clone(),
        });
        Self {
            inner: Arc::new(ServerInner {
                bridge,
                router,
                terminal_path: terminal_path.into(),
                max_head_bytes,
            }),
        }
    }

    pub fn from_config(config: &Config, registry: SessionRegistry) -> Result<Self, ConfigError> {
        let launcher = config.process.build_launcher()?;
        let bridge = Bridge::new(registry, launcher, config.bridge.to_bridge_config());
        Ok(Self::new(bridge, config.server.terminal_path.clone(), config.server.max_head_bytes))
    }

    pub fn registry(&self) -> &SessionRegistry {
        self.inner.bridge.registry()
    }

    /// Accept connections until `cancel` fires.
    ///
    /// In-flight connections are left running; bridges end when their
    /// sessions are removed.
    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) -> io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, path = %self.inner.terminal_path, "termbridge listening");
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("server received cancel signal, stopping accept loop");
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let _ = stream.set_nodelay(true);
                            let server = self.clone();
                            tokio::spawn(async move {
                                tracing::debug!(%peer, "connection accepted");
                                server.handle_connection(stream).await;
                            });
                        }
                        Err(e) => {
                            tracing::error!(?e, "failed to accept connection");
                            // Backoff to prevent tight loop under sustained accept errors
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Serve one connection to completion.
    pub async fn handle_connection<S>(&self, mut stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (head, head_len, raw) = match handshake::read_request_head(&mut stream, self.inner.max_head_bytes).await {
            Ok(read) => read,
            Err(e) => {
                tracing::debug!(%e, "dropping connection with unreadable request head");
                return;
            }
        };

        if head.is_upgrade() || head.path() == self.inner.terminal_path {
            self.upgrade(stream, head, raw.slice(head_len..)).await;
        } else {
            self.serve_http(stream, raw).await;
        }
    }

    async fn upgrade<S>(&self, mut stream: S, head: RequestHead, leftover: Bytes)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let response = match handshake::negotiate(&head, &self.inner.terminal_path) {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(%e, target = %head.target, "rejecting upgrade");
                return;
            }
        };
        if let Err(e) = stream.write_all(&response.to_bytes()).await {
            tracing::debug!(?e, "failed to write handshake response");
            return;
        }
        match self.inner.bridge.run(stream, leftover).await {
            Ok(outcome) => tracing::debug!(?outcome, "bridge finished"),
            Err(e) => tracing::debug!(%e, "bridge ended with error"),
        }
    }

    async fn serve_http<S>(&self, stream: S, consumed: Bytes)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(Rewind::new(consumed, stream));
        let service = TowerToHyperService::new(self.inner.router.clone());
        if let Err(e) = hyper::server::conn::http1::Builder::new()
            .serve_connection(io, service)
            .await
        {
            tracing::debug!(?e, "http connection ended with error");
        }
    }
}

/// Replays bytes already read from a stream before reading from it again.
pub struct Rewind<S> {
    pre: Bytes,
    inner: S,
}

impl<S> Rewind<S> {
    pub fn new(pre: Bytes, inner: S) -> Self {
        Self { pre, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if !self.pre.is_empty() {
            let n = self.pre.len().min(buf.remaining());
            buf.put_slice(&self.pre[..n]);
            self.pre.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
