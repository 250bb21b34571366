//! Per-slot endpoint allocation and connection.
//!
//! GGUF-family runners listen on a Unix socket under the loader's scratch
//! directory; Python runners need loopback TCP.  Ports are allocated by
//! binding port 0 and immediately releasing the listener; the child binds
//! the same port moments later.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::backend::EndpointKind;
use crate::error::RunnerError;

/// Boxed bidirectional stream, so UDS and TCP proxying share one code path.
pub(crate) trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

/// Where a slot's child listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Unix domain socket path.
    Unix(PathBuf),
    /// Loopback TCP port.
    Tcp(u16),
}

impl Endpoint {
    /// Allocate an endpoint for slot `index` under `scratch`.
    pub async fn allocate(
        kind: EndpointKind,
        scratch: &Path,
        index: usize,
    ) -> Result<Endpoint, RunnerError> {
        match kind {
            EndpointKind::Unix => {
                tokio::fs::create_dir_all(scratch).await?;
                let path = scratch.join(format!("runner-{index}.sock"));
                // A stale socket from a crashed run would fail the child's bind.
                let _ = tokio::fs::remove_file(&path).await;
                Ok(Endpoint::Unix(path))
            }
            EndpointKind::Tcp => {
                let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?;
                let port = listener.local_addr()?.port();
                drop(listener);
                Ok(Endpoint::Tcp(port))
            }
        }
    }

    /// Open a stream to the endpoint.
    pub(crate) async fn connect(&self) -> std::io::Result<Box<dyn IoStream>> {
        match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok(Box::new(stream))
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            )),
            Endpoint::Tcp(port) => {
                let stream = TcpStream::connect(("127.0.0.1", *port)).await?;
                Ok(Box::new(stream))
            }
        }
    }

    /// Value for the `Host` header on proxied requests.
    pub fn authority(&self) -> String {
        match self {
            Endpoint::Unix(_) => "localhost".to_owned(),
            Endpoint::Tcp(port) => format!("127.0.0.1:{port}"),
        }
    }

    /// Remove the socket file, if any.  Idempotent.
    pub fn cleanup(&self) {
        if let Endpoint::Unix(path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            Endpoint::Tcp(port) => write!(f, "tcp://127.0.0.1:{port}"),
        }
    }
}
