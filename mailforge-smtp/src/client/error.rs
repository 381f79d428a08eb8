use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The server answered with a 4xx/5xx status.
    #[error("SMTP error {code}: {message}")]
    SmtpError { code: u16, message: String },

    /// A reply outside the expected code ranges.
    #[error("unexpected response {code}: {message}")]
    UnexpectedResponse { code: u16, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed unexpectedly")]
    ConnectionClosed,

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("malformed server response: {0}")]
    ParseError(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
