//! Stream-socket transport.
//!
//! The broker listens on either a TCP address or a Unix socket path. Both
//! sides of the enum present one connection type to the rest of the server,
//! so the connection driver never cares which transport accepted it.
//!
//! A leftover socket file from a crashed broker would make the Unix bind
//! fail forever, so an `AddrInUse` bind is probed by connecting: refusal
//! proves no broker is listening, the file is removed, and the bind retried
//! once. A live broker on the path is a fatal configuration error.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use crate::config::ListenSettings;
use crate::error::ServerError;

/// The broker's listening socket.
#[derive(Debug)]
pub enum Listener {
    /// TCP listener.
    Tcp(TcpListener),
    /// Unix socket listener.
    Unix(UnixListener),
}

impl Listener {
    /// Binds according to the listen settings; the socket path wins over
    /// host and port when both are set.
    ///
    /// # Errors
    ///
    /// Bind failures are fatal, apart from the single stale-socket retry
    /// described on the module.
    pub async fn bind(settings: &ListenSettings) -> Result<Self, ServerError> {
        match &settings.path {
            Some(path) => Self::bind_unix(path).await,
            None => {
                let addr = format!("{}:{}", settings.host, settings.port);
                let listener = TcpListener::bind(&addr)
                    .await
                    .map_err(|e| ServerError::Transport(format!("failed to bind {addr}: {e}")))?;
                tracing::info!(%addr, "listening on tcp");
                Ok(Self::Tcp(listener))
            },
        }
    }

    async fn bind_unix(path: &Path) -> Result<Self, ServerError> {
        match UnixListener::bind(path) {
            Ok(listener) => {
                tracing::info!(path = %path.display(), "listening on unix socket");
                Ok(Self::Unix(listener))
            },
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                match UnixStream::connect(path).await {
                    Ok(_) => Err(ServerError::Config(format!(
                        "socket {} is in use by a running broker",
                        path.display()
                    ))),
                    Err(probe) if probe.kind() == io::ErrorKind::ConnectionRefused => {
                        tracing::warn!(path = %path.display(), "removing stale socket file");
                        std::fs::remove_file(path).map_err(|e| {
                            ServerError::Transport(format!(
                                "failed to remove stale socket {}: {e}",
                                path.display()
                            ))
                        })?;
                        let listener = UnixListener::bind(path).map_err(|e| {
                            ServerError::Transport(format!(
                                "failed to bind {}: {e}",
                                path.display()
                            ))
                        })?;
                        tracing::info!(path = %path.display(), "listening on unix socket");
                        Ok(Self::Unix(listener))
                    },
                    Err(probe) => Err(ServerError::Transport(format!(
                        "socket {} unusable: {probe}",
                        path.display()
                    ))),
                }
            },
            Err(err) => Err(ServerError::Transport(format!(
                "failed to bind {}: {err}",
                path.display()
            ))),
        }
    }

    /// Accepts one connection. Returns the stream and a peer description
    /// for logging.
    pub async fn accept(&self) -> Result<(Conn, String), ServerError> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Conn::Tcp(stream), peer.to_string()))
            },
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((Conn::Unix(stream), "unix".to_owned()))
            },
        }
    }

    /// The bound TCP address, if this is a TCP listener. Lets tests bind
    /// port 0 and discover the assigned port.
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(listener) => listener.local_addr().ok(),
            Self::Unix(_) => None,
        }
    }
}

/// One accepted client connection.
pub enum Conn {
    /// TCP stream.
    Tcp(TcpStream),
    /// Unix socket stream.
    Unix(UnixStream),
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Self::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
