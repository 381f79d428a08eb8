use thiserror::Error;

/// Errors raised while framing lines off the wire.
#[derive(Debug, Error)]
pub enum WireError {
    /// Line exceeded the configured maximum before CRLF was seen.
    #[error("line exceeds {max} octets")]
    LineTooLong { max: usize },

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("unable to load certificate from {path}: {source}")]
    CertificateLoad {
        path: String,
        source: std::io::Error,
    },

    #[error("unable to load key from {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    #[error("missing TLS protocol info: {0}")]
    ProtocolInfoMissing(String),

    #[error("TLS error: {0}")]
    Rustls(#[from] tokio_rustls::rustls::Error),

    #[error("handshake failed: {0}")]
    Handshake(#[from] std::io::Error),
}

pub type TlsResult<T> = Result<T, TlsError>;

#[derive(Debug, Error)]
pub enum AuthError {
    /// The client aborted the exchange with `*`.
    #[error("authentication exchange cancelled")]
    Cancelled,

    #[error("malformed base64 in authentication exchange")]
    Base64,

    #[error("malformed credentials")]
    Malformed,

    #[error("I/O error during authentication: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("unable to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
