//! Local side of a bridge: TCP or unix-domain socket listeners and streams.

use std::{
    fmt, io,
    net::SocketAddr,
    path::PathBuf,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpListener, TcpStream},
};

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

use crate::error::BindError;

/// Where a local forward accepts connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalBinding {
    Tcp(SocketAddr),
    Socket(PathBuf),
}

impl fmt::Display for LocalBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalBinding::Tcp(addr) => write!(f, "tcp://{addr}"),
            LocalBinding::Socket(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Where a remote forward delivers its sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalTarget {
    Tcp { host: String, port: u16 },
    Socket(PathBuf),
}

impl fmt::Display for LocalTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalTarget::Tcp { host, port } if host.contains(':') => write!(f, "tcp://[{host}]:{port}"),
            LocalTarget::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            LocalTarget::Socket(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

impl LocalTarget {
    pub async fn connect(&self, nodelay: bool) -> io::Result<LocalStream> {
        match self {
            LocalTarget::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                if nodelay {
                    if let Err(e) = stream.set_nodelay(true) {
                        log::warn!("[LocalTarget] set TCP_NODELAY for {self} failed {e}");
                    }
                }
                Ok(LocalStream::Tcp(stream))
            }
            #[cfg(unix)]
            LocalTarget::Socket(path) => Ok(LocalStream::Unix(UnixStream::connect(path).await?)),
            #[cfg(not(unix))]
            LocalTarget::Socket(_) => Err(io::Error::new(io::ErrorKind::Unsupported, "local sockets require a unix platform")),
        }
    }
}

pub enum LocalListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix { listener: UnixListener, path: PathBuf },
}

impl LocalListener {
    pub async fn bind(binding: &LocalBinding) -> Result<Self, BindError> {
        match binding {
            LocalBinding::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await.map_err(|e| BindError::from_io(addr, e))?;
                Ok(Self::Tcp(listener))
            }
            #[cfg(unix)]
            LocalBinding::Socket(path) => {
                let listener = UnixListener::bind(path).map_err(|e| BindError::from_io(path.display(), e))?;
                Ok(Self::Unix { listener, path: path.clone() })
            }
            #[cfg(not(unix))]
            LocalBinding::Socket(path) => Err(BindError::Unsupported(format!("local socket {}", path.display()))),
        }
    }

    /// Address actually bound, with the ephemeral port filled in for `:0` bindings.
    pub fn local_addr(&self) -> String {
        match self {
            LocalListener::Tcp(listener) => match listener.local_addr() {
                Ok(addr) => addr.to_string(),
                Err(_) => "tcp://unknown".to_string(),
            },
            #[cfg(unix)]
            LocalListener::Unix { path, .. } => path.display().to_string(),
        }
    }

    pub async fn accept(&self, nodelay: bool) -> io::Result<(LocalStream, String)> {
        match self {
            LocalListener::Tcp(listener) => {
                let (stream, remote) = listener.accept().await?;
                if nodelay {
                    if let Err(e) = stream.set_nodelay(true) {
                        log::warn!("[LocalListener] set TCP_NODELAY for {remote} failed {e}");
                    }
                }
                Ok((LocalStream::Tcp(stream), remote.to_string()))
            }
            #[cfg(unix)]
            LocalListener::Unix { listener, path } => {
                let (stream, _remote) = listener.accept().await?;
                Ok((LocalStream::Unix(stream), format!("unix://{}", path.display())))
            }
        }
    }
}

impl Drop for LocalListener {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            if let LocalListener::Unix { path, .. } = self {
                if let Err(e) = std::fs::remove_file(path.as_path()) {
                    log::debug!("[LocalListener] remove socket file {} failed {e}", path.display());
                }
            }
        }
    }
}

pub enum LocalStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for LocalStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            LocalStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(unix)]
            LocalStream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for LocalStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, io::Error>> {
        match self.get_mut() {
            LocalStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(unix)]
            LocalStream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            LocalStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(unix)]
            LocalStream::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            LocalStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(unix)]
            LocalStream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
