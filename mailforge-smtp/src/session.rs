use std::{net::SocketAddr, sync::Arc, time::SystemTime};

use async_trait::async_trait;
use mailforge_common::{
    Signal,
    address::Address,
    envelope::Envelope,
    events::{Event, EventBus, SessionInfo, Verdict},
    incoming, internal,
    message::Message,
    outgoing,
    pipeline::{Inspection, Inspector, Relayer},
    status::Status,
};
use mailforge_store::MessageStore;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    auth::{AuthenticationResult, Exchange, Mechanism, Verifier},
    command::{Command, MailParameters, ParseError},
    connection::{Connection, TlsContext},
    error::{AuthError, SessionError, WireError},
    extensions::Extension,
    filter::MailboxFilter,
    policy::RelayPolicy,
    state::State,
    wire::{DataOutcome, LineReader, MAX_COMMAND_LINE},
};

const DEFAULT_MAX_ERRORS: u32 = 3;
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;
const MAX_AUTH_FAILURES: u32 = 3;

/// Everything a session needs beyond its socket: limits, TLS material,
/// authentication, policy, and the engine collaborators invoked at
/// end-of-data.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub banner: String,
    /// SIZE extension value; zero advertises no fixed maximum.
    pub max_message_size: usize,
    /// RCPT TO cap per envelope; zero means unlimited.
    pub max_recipients: usize,
    /// Error budget: unsuccessful command events before 421.
    pub max_errors: u32,
    pub command_timeout: std::time::Duration,
    pub require_authentication: bool,
    pub require_secure_connection: bool,
    pub tls: Option<TlsContext>,
    pub mechanisms: Vec<Arc<dyn Mechanism>>,
    pub verifier: Option<Verifier>,
    pub relay_policy: RelayPolicy,
    pub store: Option<Arc<dyn MessageStore>>,
    pub filter: Arc<dyn MailboxFilter>,
    pub inspector: Option<Arc<dyn Inspector>>,
    pub relayer: Option<Arc<dyn Relayer>>,
    pub events: EventBus,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            banner: String::new(),
            max_message_size: 0,
            max_recipients: 0,
            max_errors: DEFAULT_MAX_ERRORS,
            command_timeout: std::time::Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            require_authentication: false,
            require_secure_connection: false,
            tls: None,
            mechanisms: crate::auth::default_mechanisms(),
            verifier: None,
            relay_policy: RelayPolicy::default(),
            store: None,
            filter: Arc::new(crate::filter::AcceptAll),
            inspector: None,
            relayer: None,
            events: EventBus::new(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }
}

/// Builder for `SessionConfig`
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    #[must_use]
    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.config.banner = banner.into();
        self
    }

    #[must_use]
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.config.max_message_size = max;
        self
    }

    #[must_use]
    pub fn with_max_recipients(mut self, max: usize) -> Self {
        self.config.max_recipients = max;
        self
    }

    #[must_use]
    pub fn with_max_errors(mut self, max: u32) -> Self {
        self.config.max_errors = max;
        self
    }

    #[must_use]
    pub fn with_command_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.command_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: Option<TlsContext>) -> Self {
        self.config.tls = tls;
        self
    }

    #[must_use]
    pub fn with_verifier(mut self, verifier: Option<Verifier>) -> Self {
        self.config.verifier = verifier;
        self
    }

    #[must_use]
    pub fn with_require_authentication(mut self, require: bool) -> Self {
        self.config.require_authentication = require;
        self
    }

    #[must_use]
    pub fn with_require_secure_connection(mut self, require: bool) -> Self {
        self.config.require_secure_connection = require;
        self
    }

    #[must_use]
    pub fn with_relay_policy(mut self, policy: RelayPolicy) -> Self {
        self.config.relay_policy = policy;
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: Option<Arc<dyn MessageStore>>) -> Self {
        self.config.store = store;
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Arc<dyn MailboxFilter>) -> Self {
        self.config.filter = filter;
        self
    }

    #[must_use]
    pub fn with_inspector(mut self, inspector: Option<Arc<dyn Inspector>>) -> Self {
        self.config.inspector = inspector;
        self
    }

    #[must_use]
    pub fn with_relayer(mut self, relayer: Option<Arc<dyn Relayer>>) -> Self {
        self.config.relayer = relayer;
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.config.events = events;
        self
    }

    #[must_use]
    pub fn build(self) -> SessionConfig {
        self.config
    }
}

/// What the command loop should do after a command was handled.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
    /// STARTTLS was accepted; the owning loop performs the handshake.
    UpgradeTls,
}

pub struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    id: ulid::Ulid,
    peer: SocketAddr,
    started_at: SystemTime,
    connection: Connection<Stream>,
    reader: LineReader,
    state: State,
    envelope: Envelope,
    helo: Option<String>,
    extended: bool,
    authenticated: Option<String>,
    errors: u32,
    auth_failures: u32,
    /// CHUNKING accumulation; `Some` once the transaction used BDAT.
    bdat: Option<BdatBuffer>,
    config: Arc<SessionConfig>,
}

#[derive(Debug, Default)]
struct BdatBuffer {
    body: Vec<u8>,
    overflowed: bool,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    pub fn create(stream: Stream, peer: SocketAddr, config: Arc<SessionConfig>) -> Self {
        Self {
            id: ulid::Ulid::new(),
            peer,
            started_at: SystemTime::now(),
            connection: Connection::plain(stream),
            reader: LineReader::new(),
            state: State::default(),
            envelope: Envelope::default(),
            helo: None,
            extended: false,
            authenticated: None,
            errors: 0,
            auth_failures: 0,
            bdat: None,
            config,
        }
    }

    /// Construct a session whose socket already completed an implicit-TLS
    /// handshake.
    pub fn create_tls(
        stream: tokio_rustls::server::TlsStream<Stream>,
        peer: SocketAddr,
        config: Arc<SessionConfig>,
    ) -> Self {
        Self {
            id: ulid::Ulid::new(),
            peer,
            started_at: SystemTime::now(),
            connection: Connection::Tls {
                stream: Box::new(stream),
            },
            reader: LineReader::new(),
            state: State::default(),
            envelope: Envelope::default(),
            helo: None,
            extended: false,
            authenticated: None,
            errors: 0,
            auth_failures: 0,
            bdat: None,
            config,
        }
    }

    #[must_use]
    pub const fn id(&self) -> ulid::Ulid {
        self.id
    }

    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the client greeted with EHLO rather than HELO.
    #[must_use]
    pub const fn extended(&self) -> bool {
        self.extended
    }

    #[must_use]
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            peer: self.peer,
            started_at: self.started_at,
            helo: self.helo.clone(),
            tls: self.connection.is_tls(),
            authenticated: self.authenticated.clone(),
        }
    }

    fn banner(&self) -> String {
        if self.config.banner.is_empty() {
            std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
        } else {
            self.config.banner.clone()
        }
    }

    async fn reply(&mut self, status: Status, text: &str) -> std::io::Result<()> {
        let line = format!("{status} {text}");
        outgoing!("{line}");
        self.connection.send(&line).await.map(|_| ())
    }

    /// Record an unsuccessful command event. Returns true when the budget is
    /// exhausted and the session must close.
    fn count_error(&mut self) -> bool {
        self.errors += 1;
        self.errors >= self.config.max_errors
    }

    /// Reply with a counted failure. Charges the error budget first: the
    /// command that exhausts it gets `421 too many errors` instead of its
    /// own status, and the session closes.
    async fn fail(&mut self, status: Status, text: &str) -> Result<Flow, SessionError> {
        if self.count_error() {
            self.reply(Status::Unavailable, "too many errors").await?;
            return Ok(Flow::Close);
        }
        self.reply(status, text).await?;
        Ok(Flow::Continue)
    }

    /// Run the session to completion: greeting, command loop, teardown.
    pub async fn run(
        mut self,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        internal!("connected from {}", self.peer);

        let banner = self.banner();
        self.reply(Status::ServiceReady, &format!("{banner} ESMTP ready"))
            .await?;
        self.state = State::WaitHelo;

        self.config.events.publish(&Event::SessionCreated {
            session: self.info(),
        });

        let result = self.command_loop(&mut shutdown).await;

        if let Err(error) = &result {
            self.config.events.publish(&Event::ErrorOccurred {
                session: Some(self.info()),
                error: error.to_string(),
            });
        }

        self.config.events.publish(&Event::SessionCompleted {
            session: self.info(),
        });
        internal!("connection closed for {}", self.peer);

        // A peer disconnecting mid-session is ordinary teardown, not a fault.
        match result {
            Err(SessionError::Wire(WireError::Closed)) | Ok(()) => Ok(()),
            Err(other) => Err(other),
        }
    }

    async fn command_loop(
        &mut self,
        shutdown: &mut tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        loop {
            let line = tokio::select! {
                _ = shutdown.recv() => {
                    self.reply(Status::Unavailable, "Server shutting down").await?;
                    return Ok(());
                }
                line = tokio::time::timeout(
                    self.config.command_timeout,
                    self.reader.read_line(&mut self.connection, MAX_COMMAND_LINE),
                ) => line
            };

            let line = match line {
                Err(_elapsed) => {
                    if self.count_error() {
                        self.reply(Status::Unavailable, "too many errors").await?;
                        return Ok(());
                    }
                    continue;
                }
                Ok(Err(WireError::LineTooLong { max })) => {
                    let text = format!("line too long (max {max})");
                    if self.fail(Status::SyntaxError, &text).await? == Flow::Close {
                        return Ok(());
                    }
                    continue;
                }
                Ok(Err(err)) => return Err(err.into()),
                Ok(Ok(line)) => line,
            };

            let command = match Command::try_from(line.as_slice()) {
                Ok(command) => command,
                Err(err) => {
                    let status = match &err {
                        ParseError::UnknownCommand(_) => Status::SyntaxError,
                        ParseError::InvalidParameter(_) => Status::ParameterSyntaxError,
                    };
                    if self.fail(status, &err.to_string()).await? == Flow::Close {
                        return Ok(());
                    }
                    continue;
                }
            };

            incoming!("{command}");

            match self.handle(command).await? {
                Flow::Continue => {}
                Flow::Close => return Ok(()),
                Flow::UpgradeTls => {
                    if !self.upgrade_tls().await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn upgrade_tls(&mut self) -> Result<bool, SessionError> {
        let Some(tls) = self.config.tls.clone() else {
            // Checked before 220 was sent; unreachable in practice.
            return Ok(false);
        };

        let acceptor = match Connection::<Stream>::acceptor(&tls) {
            Ok(acceptor) => acceptor,
            Err(err) => {
                internal!(level = ERROR, "TLS setup failed: {err}");
                self.count_error();
                return Ok(false);
            }
        };

        // Anything the client pipelined in plaintext dies here.
        self.reader.clear();

        let Some(plain) = self.connection.detach_plain() else {
            return Ok(false);
        };

        match acceptor.accept(plain).await {
            Ok(stream) => {
                self.connection = Connection::Tls {
                    stream: Box::new(stream),
                };

                // Fresh protocol state: the client must EHLO again. Only the
                // peer endpoint survives the upgrade.
                self.state = State::WaitHelo;
                self.envelope.reset();
                self.helo = None;
                self.extended = false;
                self.authenticated = None;
                self.bdat = None;

                if let Some(info) = self.connection.tls_info() {
                    internal!(
                        "connection upgraded to {} with {} for {}",
                        info.proto(),
                        info.cipher(),
                        self.peer
                    );
                }
                Ok(true)
            }
            Err(err) => {
                internal!(level = ERROR, "TLS handshake failed: {err}");
                self.count_error();
                Ok(false)
            }
        }
    }

    async fn handle(&mut self, command: Command) -> Result<Flow, SessionError> {
        let next = match self.state.transition(&command) {
            Ok(next) => next,
            Err(status) => {
                let text = format!("bad sequence of commands: {}", command.verb());
                return self.fail(status, &text).await;
            }
        };

        match command {
            Command::Helo(host) => self.handle_helo(host, false, next).await,
            Command::Ehlo(host) => self.handle_helo(host, true, next).await,
            Command::StartTls => self.handle_starttls().await,
            Command::Auth { mechanism, initial } => {
                self.handle_auth(&mechanism, initial, next).await
            }
            Command::MailFrom { sender, params } => {
                self.handle_mail(sender, params, next).await
            }
            Command::RcptTo { recipient, params } => {
                self.handle_rcpt(recipient, &params, next).await
            }
            Command::Data => self.handle_data().await,
            Command::Bdat { size, last } => self.handle_bdat(size, last).await,
            Command::Rset => {
                self.envelope.reset();
                self.bdat = None;
                self.state = next;
                self.errors = 0;
                self.reply(Status::Ok, "Ok").await?;
                Ok(Flow::Continue)
            }
            Command::Noop => {
                self.errors = 0;
                self.reply(Status::Ok, "Ok").await?;
                Ok(Flow::Continue)
            }
            Command::Quit => {
                let banner = self.banner();
                self.reply(Status::GoodBye, &format!("{banner} closing connection"))
                    .await?;
                self.state = State::Closing;
                Ok(Flow::Close)
            }
            Command::Vrfy(_) => {
                self.errors = 0;
                self.reply(
                    Status::CannotVerify,
                    "Cannot verify user, but will accept message and attempt delivery",
                )
                .await?;
                Ok(Flow::Continue)
            }
            Command::Expn(_) => {
                self.fail(Status::CommandNotImplemented, "EXPN not available")
                    .await
            }
            Command::Help => {
                self.errors = 0;
                self.send_help().await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_helo(
        &mut self,
        host: String,
        extended: bool,
        next: State,
    ) -> Result<Flow, SessionError> {
        self.envelope.reset();
        self.bdat = None;
        self.helo = Some(host.clone());
        self.extended = extended;
        self.state = next;
        self.errors = 0;

        let banner = self.banner();

        if extended {
            let extensions = self.advertised_extensions();
            let greeting = format!("{banner} says hello to {host}");

            let mut lines = Vec::with_capacity(extensions.len() + 1);
            lines.push(greeting);
            lines.extend(extensions.iter().map(ToString::to_string));

            let last = lines.len() - 1;
            for (idx, line) in lines.iter().enumerate() {
                let sep = if idx == last { ' ' } else { '-' };
                let full = format!("{}{}{}", Status::Ok, sep, line);
                outgoing!("{full}");
                self.connection.send(&full).await?;
            }
        } else {
            self.reply(Status::Ok, &format!("{banner} says hello to {host}"))
                .await?;
        }

        Ok(Flow::Continue)
    }

    fn advertised_extensions(&self) -> Vec<Extension> {
        let mut extensions = vec![
            Extension::Pipelining,
            Extension::EightBitMime,
            Extension::SmtpUtf8,
            Extension::Size(self.config.max_message_size),
            Extension::Chunking,
        ];

        if self.config.tls.is_some() && !self.connection.is_tls() {
            extensions.push(Extension::Starttls);
        }

        let auth_available = self.config.verifier.is_some()
            && self.authenticated.is_none()
            && (!self.config.require_secure_connection || self.connection.is_tls());
        if auth_available {
            extensions.push(Extension::Auth(
                self.config
                    .mechanisms
                    .iter()
                    .map(|m| m.mechanism())
                    .collect(),
            ));
        }

        extensions.push(Extension::Help);
        extensions
    }

    async fn handle_starttls(&mut self) -> Result<Flow, SessionError> {
        if self.config.tls.is_none() {
            return self
                .fail(Status::CommandNotImplemented, "TLS not available")
                .await;
        }

        if self.connection.is_tls() {
            return self
                .fail(Status::InvalidCommandSequence, "already using TLS")
                .await;
        }

        self.errors = 0;
        self.reply(Status::ServiceReady, "Ready to start TLS").await?;
        Ok(Flow::UpgradeTls)
    }

    async fn handle_auth(
        &mut self,
        mechanism: &str,
        initial: Option<String>,
        next: State,
    ) -> Result<Flow, SessionError> {
        let Some(verifier) = self.config.verifier.clone() else {
            return self
                .fail(Status::CommandNotImplemented, "authentication not enabled")
                .await;
        };

        if self.authenticated.is_some() {
            return self
                .fail(Status::InvalidCommandSequence, "already authenticated")
                .await;
        }

        if self.config.require_secure_connection && !self.connection.is_tls() {
            return self
                .fail(Status::AuthRequired, "Must issue STARTTLS first")
                .await;
        }

        let Some(selected) = self
            .config
            .mechanisms
            .iter()
            .find(|m| m.mechanism().eq_ignore_ascii_case(mechanism))
            .cloned()
        else {
            return self
                .fail(
                    Status::ParameterNotImplemented,
                    "authentication mechanism not supported",
                )
                .await;
        };

        self.state = State::InAuth;

        let timeout = self.config.command_timeout;
        let mut exchange = SessionExchange {
            connection: &mut self.connection,
            reader: &mut self.reader,
            timeout,
        };

        let outcome = selected
            .authenticate(&mut exchange, initial, &verifier)
            .await;

        self.state = next;

        match outcome {
            Ok(AuthenticationResult::Success { identity }) => {
                self.authenticated = Some(identity.clone());
                self.errors = 0;
                self.auth_failures = 0;
                self.reply(Status::AuthSucceeded, "2.7.0 Authentication successful")
                    .await?;
                self.config.events.publish(&Event::AuthSucceeded {
                    session: self.info(),
                    identity,
                });
                Ok(Flow::Continue)
            }
            Ok(AuthenticationResult::Failure { reason }) => {
                self.auth_failures += 1;
                self.reply(Status::AuthFailed, &format!("5.7.8 {reason}")).await?;
                self.config.events.publish(&Event::AuthFailed {
                    session: self.info(),
                    mechanism: selected.mechanism().to_string(),
                });

                if self.auth_failures >= MAX_AUTH_FAILURES || self.count_error() {
                    self.reply(Status::Unavailable, "too many failures").await?;
                    return Ok(Flow::Close);
                }
                Ok(Flow::Continue)
            }
            Err(AuthError::Cancelled) => {
                self.fail(Status::ParameterSyntaxError, "authentication cancelled")
                    .await
            }
            Err(AuthError::Base64 | AuthError::Malformed) => {
                self.fail(Status::ParameterSyntaxError, "malformed authentication data")
                    .await
            }
            Err(AuthError::Io(err)) => Err(err.into()),
        }
    }

    async fn handle_mail(
        &mut self,
        sender: Option<Address>,
        params: MailParameters,
        next: State,
    ) -> Result<Flow, SessionError> {
        if self.config.require_authentication && self.authenticated.is_none() {
            return self
                .fail(Status::AuthRequired, "5.7.0 Authentication required")
                .await;
        }

        // RFC 1870: reject a declared size over the advertised maximum
        // before any bytes are transferred. Policy rejections do not count
        // against the error budget.
        if self.config.max_message_size > 0
            && let Some(declared) = params.size
            && declared > self.config.max_message_size
        {
            self.reply(
                Status::ExceededStorage,
                &format!(
                    "5.3.4 message size {declared} exceeds maximum {}",
                    self.config.max_message_size
                ),
            )
            .await?;
            return Ok(Flow::Continue);
        }

        let info = self.info();
        let accepted = self
            .config
            .filter
            .can_accept_from(&info, sender.as_ref(), params.size)
            .await;
        if !accepted {
            self.reply(Status::MailboxUnavailable, "5.7.1 sender rejected")
                .await?;
            return Ok(Flow::Continue);
        }

        self.envelope.open(sender);
        self.envelope.set_declared_size(params.size);
        if let Some(body) = params.body {
            self.envelope.set_body(body);
        }
        self.envelope.set_utf8(params.utf8);

        self.state = next;
        self.errors = 0;
        self.reply(Status::Ok, "Ok").await?;
        Ok(Flow::Continue)
    }

    async fn handle_rcpt(
        &mut self,
        recipient: Address,
        _params: &MailParameters,
        next: State,
    ) -> Result<Flow, SessionError> {
        if self.config.max_recipients > 0
            && self.envelope.recipients().len() >= self.config.max_recipients
        {
            self.reply(
                Status::InsufficientStorage,
                &format!("4.5.3 too many recipients (max {})", self.config.max_recipients),
            )
            .await?;
            return Ok(Flow::Continue);
        }

        let Some(domain) = recipient.domain() else {
            return self
                .fail(Status::ParameterSyntaxError, "5.1.3 invalid recipient")
                .await;
        };

        let policy = &self.config.relay_policy;
        let relayable = policy.is_local(&domain)
            || policy.may_relay(self.authenticated.is_some(), self.peer.ip(), &domain);
        if !relayable {
            self.reply(Status::MailboxUnavailable, "5.7.1 relay access denied")
                .await?;
            return Ok(Flow::Continue);
        }

        let info = self.info();
        let deliverable = self
            .config
            .filter
            .can_deliver_to(&info, &recipient, self.envelope.sender())
            .await;
        if !deliverable {
            self.reply(Status::MailboxUnavailable, "5.1.1 recipient rejected")
                .await?;
            return Ok(Flow::Continue);
        }

        self.envelope.recipients_mut().push(recipient);
        self.state = next;
        self.errors = 0;
        self.reply(Status::Ok, "Ok").await?;
        Ok(Flow::Continue)
    }

    async fn handle_data(&mut self) -> Result<Flow, SessionError> {
        if self.bdat.is_some() {
            return self
                .fail(Status::InvalidCommandSequence, "DATA not allowed after BDAT")
                .await;
        }

        self.state = State::InData;
        self.reply(Status::StartMailInput, "End data with <CR><LF>.<CR><LF>")
            .await?;

        let outcome = self
            .reader
            .read_data(&mut self.connection, self.config.max_message_size)
            .await?;

        match outcome {
            DataOutcome::SizeExceeded { wire_size } => {
                self.envelope.reset();
                self.state = State::Idle;
                self.reply(
                    Status::ExceededStorage,
                    &format!(
                        "5.3.4 message ({wire_size} bytes on the wire) exceeds maximum {}",
                        self.config.max_message_size
                    ),
                )
                .await?;
                Ok(Flow::Continue)
            }
            DataOutcome::Complete { body, .. } => self.finish_message(body).await,
        }
    }

    async fn handle_bdat(&mut self, size: usize, last: bool) -> Result<Flow, SessionError> {
        let chunk = self.reader.read_exact(&mut self.connection, size).await?;

        let max = self.config.max_message_size;
        let buffer = self.bdat.get_or_insert_with(BdatBuffer::default);

        if !buffer.overflowed {
            buffer.body.extend_from_slice(&chunk);
            if max > 0 && buffer.body.len() > max {
                buffer.overflowed = true;
                buffer.body.clear();
            }
        }

        if last {
            let buffer = self.bdat.take().unwrap_or_default();
            if buffer.overflowed {
                self.envelope.reset();
                self.state = State::Idle;
                self.reply(
                    Status::ExceededStorage,
                    &format!("5.3.4 message exceeds maximum {max}"),
                )
                .await?;
                return Ok(Flow::Continue);
            }
            return self.finish_message(buffer.body).await;
        }

        self.errors = 0;
        self.reply(Status::Ok, &format!("{size} octets received")).await?;
        Ok(Flow::Continue)
    }

    /// The end-of-data pipeline: inspection, events, storage, relay, reply.
    async fn finish_message(&mut self, body: Vec<u8>) -> Result<Flow, SessionError> {
        let envelope = std::mem::take(&mut self.envelope);
        self.state = State::Idle;
        self.bdat = None;

        let mut message = Message::new(envelope, Arc::from(body.into_boxed_slice()));
        let info = self.info();

        if let Some(inspector) = &self.config.inspector {
            match inspector.inspect(&info, &mut message).await {
                Inspection::Accept => {}
                Inspection::Defer(reason) => {
                    self.config.events.publish(&Event::MessageRejected {
                        session: info,
                        reason: reason.clone(),
                    });
                    self.reply(Status::ActionAborted, &reason).await?;
                    return Ok(Flow::Continue);
                }
                Inspection::Reject { status, reason } => {
                    self.config.events.publish(&Event::MessageRejected {
                        session: info,
                        reason: reason.clone(),
                    });
                    self.reply(status, &reason).await?;
                    return Ok(Flow::Continue);
                }
            }
        }

        let message = Arc::new(message);

        let verdict = self.config.events.publish(&Event::MessageReceived {
            session: info.clone(),
            message: Arc::clone(&message),
        });
        if let Verdict::Cancel(status, text) = verdict {
            self.config.events.publish(&Event::MessageRejected {
                session: info,
                reason: text.clone(),
            });
            self.reply(status, &text).await?;
            return Ok(Flow::Continue);
        }

        if let Some(store) = &self.config.store
            && let Err(err) = store.save(&info, &message).await
        {
            internal!(level = ERROR, "storage failed: {err}");
            self.config.events.publish(&Event::ErrorOccurred {
                session: Some(info),
                error: err.to_string(),
            });
            self.reply(Status::ActionAborted, "4.3.0 storage failed").await?;
            return Ok(Flow::Continue);
        }

        let external = message
            .envelope()
            .recipients()
            .iter()
            .filter_map(Address::domain)
            .any(|domain| !self.config.relay_policy.is_local(&domain));

        if external
            && let Some(relayer) = &self.config.relayer
            && !relayer.submit(&info, Arc::clone(&message)).await
        {
            self.reply(Status::ActionAborted, "4.3.0 relay queue unavailable")
                .await?;
            return Ok(Flow::Continue);
        }

        self.errors = 0;
        let id = message.id();
        self.reply(Status::Ok, &format!("2.6.0 Ok: queued as {id}"))
            .await?;
        Ok(Flow::Continue)
    }

    async fn send_help(&mut self) -> Result<(), SessionError> {
        let verbs = "HELO EHLO STARTTLS AUTH MAIL RCPT DATA BDAT RSET NOOP VRFY HELP QUIT";
        let lines = [
            "This is mailforge".to_string(),
            format!("Supported commands: {verbs}"),
        ];

        let last = lines.len() - 1;
        for (idx, line) in lines.iter().enumerate() {
            let sep = if idx == last { ' ' } else { '-' };
            let full = format!("{}{}{}", Status::HelpMessage, sep, line);
            outgoing!("{full}");
            self.connection.send(&full).await?;
        }
        Ok(())
    }
}

/// The framed I/O pair lent to an authentication mechanism.
struct SessionExchange<'a, Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    connection: &'a mut Connection<Stream>,
    reader: &'a mut LineReader,
    timeout: std::time::Duration,
}

#[async_trait]
impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Exchange
    for SessionExchange<'_, Stream>
{
    async fn challenge(&mut self, data: &str) -> std::io::Result<()> {
        let line = format!("{} {data}", Status::AuthContinue);
        self.connection.send(&line).await.map(|_| ())
    }

    async fn response(&mut self) -> std::io::Result<String> {
        let line = tokio::time::timeout(
            self.timeout,
            self.reader.read_line(self.connection, MAX_COMMAND_LINE),
        )
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "auth response timeout"))?
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, err.to_string()))?;

        String::from_utf8(line)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "non-UTF-8 response"))
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
    use mailforge_common::{
        events::{Event, EventBus, SessionInfo, Verdict},
        message::Message,
        pipeline::{Inspection, Inspector},
        status::Status,
    };
    use mailforge_store::{MessageStore, MockStore};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::{Session, SessionConfig};
    use crate::{auth::Verifier, policy::RelayPolicy};

    async fn run_session(config: SessionConfig, script: &str) -> Vec<String> {
        let (mut client, server) = tokio::io::duplex(1 << 16);
        let (_shutdown, receiver) = tokio::sync::broadcast::channel(1);

        let session = Session::create(
            server,
            "192.0.2.1:42000".parse().unwrap(),
            Arc::new(config),
        );
        let task = tokio::spawn(session.run(receiver));

        client.write_all(script.as_bytes()).await.unwrap();
        client.shutdown().await.unwrap();

        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();

        task.await.unwrap().unwrap();

        out.lines().map(str::to_string).collect()
    }

    fn open_relay_config() -> SessionConfig {
        SessionConfig::builder()
            .with_banner("testhost")
            .with_relay_policy(RelayPolicy {
                local_domains: vec!["local.example".to_string()],
                relay_domains: Vec::new(),
                relay_networks: vec![crate::policy::IpNetwork::parse("192.0.2.0/24").unwrap()],
            })
            .build()
    }

    #[tokio::test]
    async fn greeting_and_ehlo_capabilities() {
        let replies = run_session(open_relay_config(), "EHLO client.example\r\nQUIT\r\n").await;

        assert!(replies[0].starts_with("220 testhost"));
        assert!(replies[1].starts_with("250-testhost says hello to client.example"));

        let capabilities: Vec<_> = replies
            .iter()
            .filter(|r| r.starts_with("250-") || r.starts_with("250 "))
            .map(|r| r[4..].to_string())
            .collect();
        for expected in ["PIPELINING", "8BITMIME", "SMTPUTF8", "SIZE", "CHUNKING"] {
            assert!(
                capabilities.iter().any(|c| c.starts_with(expected)),
                "missing capability {expected} in {capabilities:?}"
            );
        }

        assert!(replies.last().unwrap().starts_with("221"));
    }

    #[tokio::test]
    async fn error_budget_terminates_session() {
        let replies = run_session(open_relay_config(), "FROB\r\nWIBBLE\r\nWOBBLE\r\n").await;

        assert!(replies[0].starts_with("220"));
        assert!(replies[1].starts_with("500"));
        assert!(replies[2].starts_with("500"));
        assert!(replies[3].starts_with("421"), "got {:?}", replies[3]);
        assert_eq!(replies.len(), 4);
    }

    #[tokio::test]
    async fn noop_resets_the_error_budget() {
        let replies = run_session(
            open_relay_config(),
            "FROB\r\nNOOP\r\nFROB\r\nFROB\r\nFROB\r\n",
        )
        .await;

        // banner, 500, 250, 500, 500, 421
        assert!(replies[1].starts_with("500"));
        assert!(replies[2].starts_with("250"));
        assert!(replies[3].starts_with("500"));
        assert!(replies[4].starts_with("500"));
        assert!(replies[5].starts_with("421"));
    }

    #[tokio::test]
    async fn pipelined_transaction_replies_in_order() {
        let store = Arc::new(MockStore::new());
        let events = EventBus::new();
        let received = Arc::new(AtomicUsize::new(0));
        {
            let received = Arc::clone(&received);
            events.subscribe(Arc::new(move |event: &Event| {
                if matches!(event, Event::MessageReceived { .. }) {
                    received.fetch_add(1, Ordering::SeqCst);
                }
                Verdict::Continue
            }));
        }

        let config = SessionConfig::builder()
            .with_banner("testhost")
            .with_relay_policy(RelayPolicy {
                local_domains: vec!["local.example".to_string()],
                ..RelayPolicy::default()
            })
            .with_store(Some(store.clone() as Arc<dyn MessageStore>))
            .with_events(events)
            .build();

        let script = "EHLO c\r\n\
            MAIL FROM:<a@remote.example>\r\n\
            RCPT TO:<u@local.example>\r\n\
            DATA\r\n\
            Subject: hi\r\n\
            \r\n\
            body\r\n\
            .\r\n\
            QUIT\r\n";
        let replies = run_session(config, script).await;

        let after_ehlo: Vec<_> = replies
            .iter()
            .skip_while(|r| !r.starts_with("250 "))
            .skip(1)
            .collect();

        assert!(after_ehlo[0].starts_with("250"), "{after_ehlo:?}");
        assert!(after_ehlo[1].starts_with("250"));
        assert!(after_ehlo[2].starts_with("354"));
        assert!(after_ehlo[3].contains("queued as"));

        assert_eq!(store.message_count(), 1);
        assert_eq!(received.load(Ordering::SeqCst), 1);

        let stored = store.get_message(0).unwrap();
        assert_eq!(stored.raw(), b"Subject: hi\r\n\r\nbody\r\n");
        assert_eq!(stored.envelope().recipients().len(), 1);
    }

    #[tokio::test]
    async fn rcpt_before_mail_is_rejected() {
        let replies = run_session(
            open_relay_config(),
            "EHLO c\r\nRCPT TO:<u@local.example>\r\nQUIT\r\n",
        )
        .await;

        assert!(replies.iter().any(|r| r.starts_with("503")));
    }

    #[tokio::test]
    async fn data_without_recipient_is_rejected() {
        let replies = run_session(
            open_relay_config(),
            "EHLO c\r\nMAIL FROM:<a@b.example>\r\nDATA\r\nQUIT\r\n",
        )
        .await;

        assert!(replies.iter().any(|r| r.starts_with("503")));
    }

    #[tokio::test]
    async fn declared_size_over_maximum_is_rejected() {
        let config = SessionConfig::builder()
            .with_banner("testhost")
            .with_max_message_size(1000)
            .build();

        let replies = run_session(
            config,
            "EHLO c\r\nMAIL FROM:<a@b.example> SIZE=2000\r\nQUIT\r\n",
        )
        .await;

        assert!(replies.iter().any(|r| r.starts_with("552")));
    }

    #[tokio::test]
    async fn relay_denied_for_untrusted_clients() {
        // Peer is 192.0.2.1 but the policy trusts nothing and lists no
        // local domains, so any recipient is relay access denied.
        let config = SessionConfig::builder().with_banner("testhost").build();

        let replies = run_session(
            config,
            "EHLO c\r\nMAIL FROM:<a@b.example>\r\nRCPT TO:<u@elsewhere.example>\r\nQUIT\r\n",
        )
        .await;

        assert!(
            replies
                .iter()
                .any(|r| r.starts_with("550") && r.contains("relay")),
            "{replies:?}"
        );
    }

    #[tokio::test]
    async fn auth_plain_success_allows_relay() {
        let config = SessionConfig::builder()
            .with_banner("testhost")
            .with_verifier(Some(Verifier::fixed([(
                "user".to_string(),
                "secret".to_string(),
            )])))
            .build();

        let credentials = BASE64.encode("\0user\0secret");
        let script = format!(
            "EHLO c\r\nAUTH PLAIN {credentials}\r\n\
             MAIL FROM:<a@b.example>\r\nRCPT TO:<u@anywhere.example>\r\nQUIT\r\n"
        );
        let replies = run_session(config, &script).await;

        assert!(replies.iter().any(|r| r.starts_with("235")));
        // Authenticated client can relay anywhere
        let rcpt_replies: Vec<_> = replies.iter().filter(|r| r.starts_with("250 Ok")).collect();
        assert!(rcpt_replies.len() >= 2, "{replies:?}");
    }

    #[tokio::test]
    async fn auth_failures_close_after_three_attempts() {
        let config = SessionConfig::builder()
            .with_banner("testhost")
            .with_max_errors(10)
            .with_verifier(Some(Verifier::fixed([(
                "user".to_string(),
                "secret".to_string(),
            )])))
            .build();

        let bad = BASE64.encode("\0user\0wrong");
        let script = format!(
            "EHLO c\r\nAUTH PLAIN {bad}\r\nAUTH PLAIN {bad}\r\nAUTH PLAIN {bad}\r\n"
        );
        let replies = run_session(config, &script).await;

        let failures = replies.iter().filter(|r| r.starts_with("535")).count();
        assert_eq!(failures, 3);
        assert!(replies.last().unwrap().starts_with("421"));
    }

    #[tokio::test]
    async fn cancelling_listener_replaces_the_reply_and_skips_the_store() {
        let store = Arc::new(MockStore::new());
        let events = EventBus::new();
        events.subscribe(Arc::new(|event: &Event| {
            if matches!(event, Event::MessageReceived { .. }) {
                Verdict::Cancel(Status::MailboxUnavailable, "not today".to_string())
            } else {
                Verdict::Continue
            }
        }));

        let config = SessionConfig::builder()
            .with_banner("testhost")
            .with_relay_policy(RelayPolicy {
                local_domains: vec!["local.example".to_string()],
                ..RelayPolicy::default()
            })
            .with_store(Some(store.clone() as Arc<dyn MessageStore>))
            .with_events(events)
            .build();

        let script = "EHLO c\r\nMAIL FROM:<a@b.example>\r\nRCPT TO:<u@local.example>\r\n\
            DATA\r\nbody\r\n.\r\nQUIT\r\n";
        let replies = run_session(config, script).await;

        assert!(replies.iter().any(|r| r == "550 not today"), "{replies:?}");
        assert_eq!(store.message_count(), 0);
    }

    #[tokio::test]
    async fn store_failure_yields_transient_error() {
        let store = Arc::new(MockStore::new());
        store.set_failing(true);

        let config = SessionConfig::builder()
            .with_banner("testhost")
            .with_relay_policy(RelayPolicy {
                local_domains: vec!["local.example".to_string()],
                ..RelayPolicy::default()
            })
            .with_store(Some(store.clone() as Arc<dyn MessageStore>))
            .build();

        let script = "EHLO c\r\nMAIL FROM:<a@b.example>\r\nRCPT TO:<u@local.example>\r\n\
            DATA\r\nbody\r\n.\r\nQUIT\r\n";
        let replies = run_session(config, script).await;

        assert!(
            replies
                .iter()
                .any(|r| r.starts_with("451") && r.contains("storage")),
            "{replies:?}"
        );
    }

    #[derive(Debug)]
    struct Deferrer;

    #[async_trait]
    impl Inspector for Deferrer {
        async fn inspect(&self, _session: &SessionInfo, _message: &mut Message) -> Inspection {
            Inspection::Defer("greylisted, try again later".to_string())
        }
    }

    #[tokio::test]
    async fn deferring_inspector_yields_451() {
        let store = Arc::new(MockStore::new());
        let config = SessionConfig::builder()
            .with_banner("testhost")
            .with_relay_policy(RelayPolicy {
                local_domains: vec!["local.example".to_string()],
                ..RelayPolicy::default()
            })
            .with_store(Some(store.clone() as Arc<dyn MessageStore>))
            .with_inspector(Some(Arc::new(Deferrer)))
            .build();

        let script = "EHLO c\r\nMAIL FROM:<a@b.example>\r\nRCPT TO:<u@local.example>\r\n\
            DATA\r\nbody\r\n.\r\nQUIT\r\n";
        let replies = run_session(config, script).await;

        assert!(
            replies
                .iter()
                .any(|r| r.starts_with("451") && r.contains("greylisted")),
            "{replies:?}"
        );
        assert_eq!(store.message_count(), 0);
    }

    #[tokio::test]
    async fn rset_clears_the_transaction() {
        let replies = run_session(
            open_relay_config(),
            "EHLO c\r\nMAIL FROM:<a@b.example>\r\nRSET\r\nDATA\r\nQUIT\r\n",
        )
        .await;

        // DATA after RSET must be out of order again
        assert!(replies.iter().any(|r| r.starts_with("503")));
    }

    #[tokio::test]
    async fn bdat_chunks_accumulate_into_a_message() {
        let store = Arc::new(MockStore::new());
        let config = SessionConfig::builder()
            .with_banner("testhost")
            .with_relay_policy(RelayPolicy {
                local_domains: vec!["local.example".to_string()],
                ..RelayPolicy::default()
            })
            .with_store(Some(store.clone() as Arc<dyn MessageStore>))
            .build();

        let script = "EHLO c\r\nMAIL FROM:<a@b.example>\r\nRCPT TO:<u@local.example>\r\n\
            BDAT 6\r\nhello\nBDAT 6 LAST\r\nworld\nQUIT\r\n";
        let replies = run_session(config, script).await;

        assert!(
            replies.iter().any(|r| r.contains("queued as")),
            "{replies:?}"
        );
        assert_eq!(store.message_count(), 1);
        assert_eq!(store.get_message(0).unwrap().raw(), b"hello\nworld\n");
    }
}

