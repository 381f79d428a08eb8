use std::{
    fmt::Write as _,
    fs::File,
    io::BufReader,
    path::PathBuf,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ProtocolVersion, ServerConfig, ServerConnection, SupportedCipherSuite,
        pki_types::{CertificateDer, PrivateKeyDer},
    },
    server::TlsStream,
};

use crate::error::{TlsError, TlsResult};

/// Paths to the PEM certificate chain and private key enabling STARTTLS or
/// implicit TLS.
#[derive(Clone, Debug, Deserialize)]
pub struct TlsContext {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

/// Negotiated TLS session parameters, recorded for the session snapshot.
#[derive(Debug)]
pub struct TlsInfo {
    version: ProtocolVersion,
    ciphers: SupportedCipherSuite,
}

impl TlsInfo {
    fn of(conn: &ServerConnection) -> TlsResult<Self> {
        Ok(Self {
            version: conn
                .protocol_version()
                .ok_or_else(|| TlsError::ProtocolInfoMissing("protocol version".to_string()))?,
            ciphers: conn
                .negotiated_cipher_suite()
                .ok_or_else(|| TlsError::ProtocolInfoMissing("cipher suite".to_string()))?,
        })
    }

    #[must_use]
    pub fn proto(&self) -> String {
        self.version.as_str().map_or_default(str::to_string)
    }

    #[must_use]
    pub fn cipher(&self) -> String {
        self.ciphers.suite().as_str().map_or_default(str::to_string)
    }
}

/// A server-side connection that starts plain and may upgrade to TLS.
///
/// `Detached` is the state while the STARTTLS handshake owns the underlying
/// stream; any I/O against it fails with `NotConnected`.
pub enum Connection<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    Plain { stream: Stream },
    Tls { stream: Box<TlsStream<Stream>> },
    Detached,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Connection<Stream> {
    pub const fn plain(stream: Stream) -> Self {
        Self::Plain { stream }
    }

    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls { .. })
    }

    /// Write one reply line, appending CRLF. Formats into a stack buffer to
    /// avoid a heap allocation per reply.
    pub async fn send<S: std::fmt::Display + Send + Sync>(
        &mut self,
        response: &S,
    ) -> std::io::Result<usize> {
        let mut buffer = arrayvec::ArrayString::<512>::new();
        if write!(&mut buffer, "{response}\r\n").is_err() {
            // Reply too large for the stack buffer; fall back to the heap.
            let line = format!("{response}\r\n");
            self.write_all(line.as_bytes()).await?;
            return Ok(line.len());
        }

        self.write_all(buffer.as_bytes()).await?;
        Ok(buffer.len())
    }

    fn load_certs<P: AsRef<std::path::Path>>(
        path: &P,
    ) -> std::io::Result<Vec<CertificateDer<'static>>> {
        rustls_pemfile::certs(&mut BufReader::new(File::open(path)?)).collect()
    }

    fn load_keys<P: AsRef<std::path::Path>>(path: &P) -> TlsResult<PrivateKeyDer<'static>> {
        let path_str = path.as_ref().display().to_string();
        let mut reader = BufReader::new(File::open(path).map_err(|e| TlsError::KeyLoad {
            path: path_str.clone(),
            reason: e.to_string(),
        })?);

        match rustls_pemfile::read_one(&mut reader).map_err(|e| TlsError::KeyLoad {
            path: path_str.clone(),
            reason: e.to_string(),
        })? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
            Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
            _ => Err(TlsError::KeyLoad {
                path: path_str,
                reason: "Unable to determine key file format (expected PKCS1, PKCS8, or SEC1)"
                    .to_string(),
            }),
        }
    }

    /// Build the acceptor for a TLS context. Shared by STARTTLS and
    /// implicit-TLS listeners.
    pub fn acceptor(tls_context: &TlsContext) -> TlsResult<TlsAcceptor> {
        let certs =
            Self::load_certs(&tls_context.certificate).map_err(|e| TlsError::CertificateLoad {
                path: tls_context.certificate.display().to_string(),
                source: e,
            })?;
        let keys = Self::load_keys(&tls_context.key)?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, keys)?;

        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    /// The negotiated TLS parameters, once the connection is upgraded.
    pub fn tls_info(&self) -> Option<TlsInfo> {
        match self {
            Self::Tls { stream } => TlsInfo::of(stream.get_ref().1).ok(),
            Self::Plain { .. } | Self::Detached => None,
        }
    }

    /// Take the plaintext stream out, leaving the connection detached.
    /// Returns `None` if the connection is already TLS (or detached).
    pub fn detach_plain(&mut self) -> Option<Stream> {
        match std::mem::replace(self, Self::Detached) {
            Self::Plain { stream } => Some(stream),
            other => {
                *self = other;
                None
            }
        }
    }
}

fn not_connected() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::NotConnected, "connection detached")
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> AsyncRead for Connection<Stream> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain { stream } => Pin::new(stream).poll_read(cx, buf),
            Self::Tls { stream } => Pin::new(stream.as_mut()).poll_read(cx, buf),
            Self::Detached => Poll::Ready(Err(not_connected())),
        }
    }
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> AsyncWrite for Connection<Stream> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Plain { stream } => Pin::new(stream).poll_write(cx, buf),
            Self::Tls { stream } => Pin::new(stream.as_mut()).poll_write(cx, buf),
            Self::Detached => Poll::Ready(Err(not_connected())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain { stream } => Pin::new(stream).poll_flush(cx),
            Self::Tls { stream } => Pin::new(stream.as_mut()).poll_flush(cx),
            Self::Detached => Poll::Ready(Err(not_connected())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain { stream } => Pin::new(stream).poll_shutdown(cx),
            Self::Tls { stream } => Pin::new(stream.as_mut()).poll_shutdown(cx),
            Self::Detached => Poll::Ready(Err(not_connected())),
        }
    }
}

trait MapOrDefault {
    fn map_or_default<T: Default>(self, f: impl FnOnce(&str) -> T) -> T;
}

impl MapOrDefault for Option<&str> {
    fn map_or_default<T: Default>(self, f: impl FnOnce(&str) -> T) -> T {
        self.map_or_else(T::default, f)
    }
}
