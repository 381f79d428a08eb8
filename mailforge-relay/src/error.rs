//! Typed error handling for delivery operations.
//!
//! Failures are split into permanent (5xx, never retried), temporary (4xx,
//! network, TLS; retried with backoff) and system (internal) classes, which
//! is what routes an attempt to the retry schedule or a bounce.

use thiserror::Error;

use crate::dns::DnsError;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    #[error("temporary failure: {0}")]
    Temporary(#[from] TemporaryError),

    #[error("system error: {0}")]
    System(#[from] SystemError),
}

/// Failures that will not improve with retries.
#[derive(Debug, Error)]
pub enum PermanentError {
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("domain not found: {0}")]
    DomainNotFound(String),

    #[error("message rejected: {0}")]
    MessageRejected(String),

    #[error("no mail servers available for domain: {0}")]
    NoMailServers(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("TLS required: {0}")]
    TlsRequired(String),
}

/// Failures worth retrying with exponential backoff.
#[derive(Debug, Error)]
pub enum TemporaryError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("server busy: {0}")]
    ServerBusy(String),

    #[error("DNS lookup failed: {0}")]
    DnsLookupFailed(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("temporary SMTP error: {0}")]
    SmtpTemporary(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),
}

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("queue entry not found: {0}")]
    EntryNotFound(String),

    #[error("invalid status transition: {0}")]
    InvalidTransition(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DeliveryError {
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

impl From<DnsError> for DeliveryError {
    fn from(error: DnsError) -> Self {
        match error {
            DnsError::NoMailServers(domain) => {
                Self::Permanent(PermanentError::NoMailServers(domain))
            }
            DnsError::DomainNotFound(domain) => {
                Self::Permanent(PermanentError::DomainNotFound(domain))
            }
            DnsError::Timeout(msg) => Self::Temporary(TemporaryError::Timeout(msg)),
            DnsError::LookupFailed(err) => {
                Self::Temporary(TemporaryError::DnsLookupFailed(err.to_string()))
            }
        }
    }
}

/// Categorise SMTP client failures: 4xx retries, 5xx is final, I/O and TLS
/// problems are transient, everything else is internal.
impl From<mailforge_smtp::client::ClientError> for DeliveryError {
    fn from(error: mailforge_smtp::client::ClientError) -> Self {
        use mailforge_smtp::client::ClientError;

        match error {
            ClientError::SmtpError { code, message } if (400..500).contains(&code) => {
                Self::Temporary(TemporaryError::SmtpTemporary(format!("{code} {message}")))
            }

            ClientError::SmtpError { code, message } if (500..600).contains(&code) => {
                Self::Permanent(PermanentError::MessageRejected(format!("{code} {message}")))
            }

            ClientError::SmtpError { code, message }
            | ClientError::UnexpectedResponse { code, message } => Self::System(
                SystemError::Internal(format!("unexpected SMTP response: {code} {message}")),
            ),

            ClientError::Io(e) => {
                Self::Temporary(TemporaryError::ConnectionFailed(format!("I/O error: {e}")))
            }

            ClientError::ConnectionClosed => Self::Temporary(TemporaryError::ConnectionFailed(
                "connection closed unexpectedly".to_string(),
            )),

            ClientError::TlsError(msg) => Self::Temporary(TemporaryError::TlsHandshakeFailed(msg)),

            ClientError::ParseError(msg) => Self::System(SystemError::Internal(format!(
                "SMTP protocol parse error: {msg}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_flags() {
        let temporary = DeliveryError::Temporary(TemporaryError::ConnectionFailed(
            "connection refused".to_string(),
        ));
        assert!(temporary.is_temporary());
        assert!(!temporary.is_permanent());

        let permanent = DeliveryError::Permanent(PermanentError::InvalidRecipient(
            "user@example.com".to_string(),
        ));
        assert!(permanent.is_permanent());
        assert!(!permanent.is_temporary());
    }

    #[test]
    fn client_error_code_ranges() {
        use mailforge_smtp::client::ClientError;

        let transient: DeliveryError = ClientError::SmtpError {
            code: 421,
            message: "busy".to_string(),
        }
        .into();
        assert!(transient.is_temporary());

        let fatal: DeliveryError = ClientError::SmtpError {
            code: 550,
            message: "no such user".to_string(),
        }
        .into();
        assert!(fatal.is_permanent());

        let io: DeliveryError = ClientError::ConnectionClosed.into();
        assert!(io.is_temporary());
    }

    #[test]
    fn dns_error_conversion() {
        let err: DeliveryError = DnsError::NoMailServers("example.com".to_string()).into();
        assert!(err.is_permanent());

        let err: DeliveryError = DnsError::Timeout("example.com".to_string()).into();
        assert!(err.is_temporary());
    }
}
