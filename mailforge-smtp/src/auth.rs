//! SASL authentication for the session (RFC 4954).
//!
//! The session hands the selected mechanism a framed I/O pair and the
//! mechanism owns its sub-protocol: base64 challenges out, base64 responses
//! in, `*` from the client cancelling the exchange. Credentials are verified
//! by a pluggable [`Verifier`] and never logged.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

use crate::error::AuthError;

/// Result of a completed authentication exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationResult {
    Success { identity: String },
    Failure { reason: String },
}

/// Credential verification, pluggable per the server configuration.
#[derive(Clone)]
pub enum Verifier {
    /// Fixed username/password table.
    Static(Arc<HashMap<String, String>>),
    /// Arbitrary user-supplied check.
    Custom(Arc<dyn Fn(&str, &str) -> bool + Send + Sync>),
}

impl std::fmt::Debug for Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Static(users) => f
                .debug_struct("Verifier::Static")
                .field("users", &users.len())
                .finish(),
            Self::Custom(_) => f.debug_struct("Verifier::Custom").finish_non_exhaustive(),
        }
    }
}

impl Verifier {
    #[must_use]
    pub fn fixed(users: impl IntoIterator<Item = (String, String)>) -> Self {
        Self::Static(Arc::new(users.into_iter().collect()))
    }

    #[must_use]
    pub fn verify(&self, username: &str, password: &str) -> AuthenticationResult {
        let ok = match self {
            Self::Static(users) => users.get(username).is_some_and(|p| p == password),
            Self::Custom(check) => check(username, password),
        };

        if ok {
            AuthenticationResult::Success {
                identity: username.to_string(),
            }
        } else {
            AuthenticationResult::Failure {
                reason: "invalid credentials".to_string(),
            }
        }
    }
}

/// The framed I/O pair the session lends to a mechanism: one challenge out,
/// one response line back.
#[async_trait]
pub trait Exchange: Send {
    /// Send a `334` continuation carrying the (already base64) payload.
    async fn challenge(&mut self, data: &str) -> std::io::Result<()>;

    /// Read the client's next response line.
    async fn response(&mut self) -> std::io::Result<String>;
}

#[async_trait]
pub trait Mechanism: Send + Sync + std::fmt::Debug {
    fn mechanism(&self) -> &'static str;

    /// Run the mechanism's exchange to completion.
    ///
    /// `initial` is the optional initial response from the AUTH command
    /// line. A client reply of `*` aborts with [`AuthError::Cancelled`],
    /// which the session maps to 501.
    async fn authenticate(
        &self,
        io: &mut dyn Exchange,
        initial: Option<String>,
        verifier: &Verifier,
    ) -> Result<AuthenticationResult, AuthError>;
}

fn decode(data: &str) -> Result<Vec<u8>, AuthError> {
    if data == "*" {
        return Err(AuthError::Cancelled);
    }
    BASE64.decode(data.trim()).map_err(|_| AuthError::Base64)
}

/// AUTH PLAIN: a single `[authzid] NUL authcid NUL password` response.
#[derive(Debug, Default)]
pub struct Plain;

#[async_trait]
impl Mechanism for Plain {
    fn mechanism(&self) -> &'static str {
        "PLAIN"
    }

    async fn authenticate(
        &self,
        io: &mut dyn Exchange,
        initial: Option<String>,
        verifier: &Verifier,
    ) -> Result<AuthenticationResult, AuthError> {
        let payload = match initial {
            Some(payload) => payload,
            None => {
                io.challenge("").await?;
                io.response().await?
            }
        };

        let decoded = decode(&payload)?;
        let mut parts = decoded.split(|&b| b == 0);

        let _authzid = parts.next().ok_or(AuthError::Malformed)?;
        let authcid = parts.next().ok_or(AuthError::Malformed)?;
        let password = parts.next().ok_or(AuthError::Malformed)?;
        if parts.next().is_some() {
            return Err(AuthError::Malformed);
        }

        let username = std::str::from_utf8(authcid).map_err(|_| AuthError::Malformed)?;
        let password = std::str::from_utf8(password).map_err(|_| AuthError::Malformed)?;

        Ok(verifier.verify(username, password))
    }
}

/// AUTH LOGIN: base64 `Username:` / `Password:` prompts.
#[derive(Debug, Default)]
pub struct Login;

#[async_trait]
impl Mechanism for Login {
    fn mechanism(&self) -> &'static str {
        "LOGIN"
    }

    async fn authenticate(
        &self,
        io: &mut dyn Exchange,
        initial: Option<String>,
        verifier: &Verifier,
    ) -> Result<AuthenticationResult, AuthError> {
        let username = match initial {
            Some(payload) => decode(&payload)?,
            None => {
                io.challenge(&BASE64.encode("Username:")).await?;
                decode(&io.response().await?)?
            }
        };

        io.challenge(&BASE64.encode("Password:")).await?;
        let password = decode(&io.response().await?)?;

        let username = String::from_utf8(username).map_err(|_| AuthError::Malformed)?;
        let password = String::from_utf8(password).map_err(|_| AuthError::Malformed)?;

        Ok(verifier.verify(&username, &password))
    }
}

/// The mechanisms the server offers, in advertisement order.
#[must_use]
pub fn default_mechanisms() -> Vec<Arc<dyn Mechanism>> {
    vec![Arc::new(Plain), Arc::new(Login)]
}
