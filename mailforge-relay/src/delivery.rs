//! The delivery engine: a pool of workers draining the relay queue.
//!
//! Each worker claims one ready entry at a time, resolves its targets,
//! walks them in order (a connect failure falls through to the next target
//! within the same attempt), performs the outbound SMTP transaction with
//! per-recipient bookkeeping, and folds the outcome back into the queue via
//! the retry schedule.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use mailforge_common::{
    Signal,
    address::Address,
    events::{Event, EventBus, SessionInfo},
    internal,
    message::Message,
    pipeline::Relayer,
};
use mailforge_smtp::client::{ClientError, Response, SmtpClient};
use serde::Deserialize;

use crate::{
    backoff::backoff,
    dns::RelayResolver,
    error::{DeliveryError, PermanentError, TemporaryError},
    queue::{
        CompletionOutcome, QueueStore, RejectedRecipient, RelayMessage, RelayQueue, RelayStatus,
    },
    route::{Router, SmartHost, Target},
};

use crate::bounce::{BounceConfig, generate_bounce, should_bounce};

/// Relay engine configuration (the `Relay.*` surface).
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "defaults::max_concurrent_deliveries")]
    pub max_concurrent_deliveries: usize,

    /// Delivery attempts before a transiently failing entry turns Failed.
    #[serde(default = "defaults::max_retry_count")]
    pub max_retry_count: u32,

    /// Queue lifetime; older entries expire.
    #[serde(default = "defaults::message_lifetime_secs")]
    pub message_lifetime_secs: u64,

    /// Bound on connect and on each SMTP operation.
    #[serde(default = "defaults::connection_timeout_secs")]
    pub connection_timeout_secs: u64,

    /// Idle worker poll interval (retry times are re-evaluated on this
    /// cadence too).
    #[serde(default = "defaults::idle_poll_secs")]
    pub idle_poll_secs: u64,

    #[serde(default = "defaults::use_mx_routing")]
    pub use_mx_routing: bool,

    /// Offer STARTTLS opportunistically when the peer advertises it.
    #[serde(default = "defaults::enable_tls")]
    pub enable_tls: bool,

    /// Refuse to deliver without TLS.
    #[serde(default)]
    pub require_tls: bool,

    #[serde(default)]
    pub accept_invalid_certs: bool,

    /// EHLO identity for outbound transactions.
    #[serde(default = "defaults::hostname")]
    pub hostname: String,

    #[serde(default)]
    pub default_smart_host: Option<SmartHost>,

    #[serde(default)]
    pub smart_hosts: Vec<SmartHost>,

    #[serde(default)]
    pub domain_routing: std::collections::HashMap<String, SmartHost>,

    /// Domains served locally; recipients there never enter the queue.
    #[serde(default)]
    pub local_domains: Vec<String>,

    #[serde(default)]
    pub bounce: BounceConfig,
}

mod defaults {
    pub const fn max_concurrent_deliveries() -> usize {
        4
    }

    pub const fn max_retry_count() -> u32 {
        10
    }

    pub const fn message_lifetime_secs() -> u64 {
        259_200 // 3 days
    }

    pub const fn connection_timeout_secs() -> u64 {
        30
    }

    pub const fn idle_poll_secs() -> u64 {
        10
    }

    pub const fn use_mx_routing() -> bool {
        true
    }

    pub const fn enable_tls() -> bool {
        true
    }

    pub fn hostname() -> String {
        "localhost".to_string()
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_concurrent_deliveries: defaults::max_concurrent_deliveries(),
            max_retry_count: defaults::max_retry_count(),
            message_lifetime_secs: defaults::message_lifetime_secs(),
            connection_timeout_secs: defaults::connection_timeout_secs(),
            idle_poll_secs: defaults::idle_poll_secs(),
            use_mx_routing: defaults::use_mx_routing(),
            enable_tls: defaults::enable_tls(),
            require_tls: false,
            accept_invalid_certs: false,
            hostname: defaults::hostname(),
            default_smart_host: None,
            smart_hosts: Vec::new(),
            domain_routing: std::collections::HashMap::new(),
            local_domains: Vec::new(),
            bounce: BounceConfig::default(),
        }
    }
}

/// How one SMTP transaction against one target ended.
enum TxOutcome {
    Delivered {
        accepted: Vec<String>,
    },
    Partial {
        accepted: Vec<String>,
        rejected: Vec<RejectedRecipient>,
    },
    /// Permanent failure; no other target will change the answer.
    Rejected {
        error: DeliveryError,
        rejected: Vec<RejectedRecipient>,
    },
    /// Transient failure; the next target (or attempt) may succeed.
    Transient {
        error: DeliveryError,
    },
}

/// The relay queue plus its worker pool.
#[derive(Debug)]
pub struct DeliveryEngine {
    config: RelayConfig,
    queue: Arc<RelayQueue>,
    router: Router,
    events: EventBus,
}

impl DeliveryEngine {
    #[must_use]
    pub fn new(
        config: RelayConfig,
        store: Arc<dyn QueueStore>,
        resolver: Option<Arc<dyn RelayResolver>>,
        events: EventBus,
    ) -> Self {
        let router = Router {
            use_mx_routing: config.use_mx_routing,
            default_smart_host: config.default_smart_host.clone(),
            smart_hosts: config.smart_hosts.clone(),
            domain_routing: config
                .domain_routing
                .iter()
                .map(|(domain, host)| (domain.to_ascii_lowercase(), host.clone()))
                .collect(),
            resolver,
        };

        Self {
            config,
            queue: Arc::new(RelayQueue::new(store)),
            router,
            events,
        }
    }

    #[must_use]
    pub fn queue(&self) -> Arc<RelayQueue> {
        Arc::clone(&self.queue)
    }

    #[must_use]
    pub const fn config(&self) -> &RelayConfig {
        &self.config
    }

    fn is_local(&self, domain: &str) -> bool {
        self.config
            .local_domains
            .iter()
            .any(|d| d.eq_ignore_ascii_case(domain))
    }

    /// Run the worker pool until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: tokio::sync::broadcast::Sender<Signal>) {
        internal!(
            level = INFO,
            "delivery engine starting with {} workers",
            self.config.max_concurrent_deliveries
        );

        let mut workers = tokio::task::JoinSet::new();
        for worker in 0..self.config.max_concurrent_deliveries.max(1) {
            let engine = Arc::clone(&self);
            let signal = shutdown.subscribe();
            workers.spawn(async move { engine.worker_loop(worker, signal).await });
        }

        while workers.join_next().await.is_some() {}
        internal!(level = INFO, "delivery engine stopped");
    }

    async fn worker_loop(&self, worker: usize, mut shutdown: tokio::sync::broadcast::Receiver<Signal>) {
        let idle = Duration::from_secs(self.config.idle_poll_secs.max(1));

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::debug!(worker, "delivery worker stopping");
                    return;
                }
                () = self.queue.wait_for_work() => {}
                () = tokio::time::sleep(idle) => {
                    self.sweep_expired().await;
                }
            }

            while let Some(entry) = self.queue.dequeue_ready(1).pop() {
                let queue_id = entry.queue_id;
                tokio::select! {
                    _ = shutdown.recv() => {
                        // Cancellation: release the claim as Deferred so the
                        // entry survives the restart, then stop.
                        let _ = self
                            .queue
                            .complete(
                                queue_id,
                                CompletionOutcome::Deferred {
                                    error: "shutdown during delivery".to_string(),
                                    next_attempt: std::time::SystemTime::now(),
                                },
                            )
                            .await;
                        return;
                    }
                    () = self.process(entry) => {}
                }
            }
        }
    }

    async fn sweep_expired(&self) {
        let lifetime = Duration::from_secs(self.config.message_lifetime_secs);
        for expired in self.queue.clear_expired(lifetime).await {
            internal!(level = WARN, "queue entry {} expired", expired.queue_id);
            self.maybe_bounce(&expired, "message expired in queue").await;
        }
    }

    /// One full delivery attempt for a claimed entry.
    async fn process(&self, entry: RelayMessage) {
        if entry.is_expired(Duration::from_secs(self.config.message_lifetime_secs)) {
            if let Ok(expired) = self.queue.expire(entry.queue_id).await {
                self.maybe_bounce(&expired, "message expired in queue").await;
            }
            return;
        }

        let targets = match self.router.targets_for(&entry.domain).await {
            Ok(targets) => targets,
            Err(error) => {
                self.settle_failure(&entry, error).await;
                return;
            }
        };

        let mut last_error: DeliveryError =
            PermanentError::NoMailServers(entry.domain.clone()).into();

        for target in targets {
            if target.smart_host {
                self.queue
                    .record_smart_host(entry.queue_id, target.address());
            }

            let outcome = self.attempt_target(&entry, &target).await;

            match outcome {
                TxOutcome::Delivered { accepted } => {
                    self.publish_attempt(&entry, &target, true, None);
                    let _ = self
                        .queue
                        .complete(entry.queue_id, CompletionOutcome::Delivered { accepted })
                        .await;
                    return;
                }
                TxOutcome::Partial { accepted, rejected } => {
                    self.publish_attempt(&entry, &target, true, None);
                    let updated = self
                        .queue
                        .complete(
                            entry.queue_id,
                            CompletionOutcome::PartiallyDelivered { accepted, rejected },
                        )
                        .await;
                    if let Ok(updated) = updated {
                        self.maybe_bounce(&updated, "some recipients were rejected")
                            .await;
                    }
                    return;
                }
                TxOutcome::Rejected { error, rejected } => {
                    self.publish_attempt(&entry, &target, false, Some(&error));
                    let updated = self
                        .queue
                        .complete(
                            entry.queue_id,
                            CompletionOutcome::Failed {
                                error: error.to_string(),
                                rejected,
                            },
                        )
                        .await;
                    if let Ok(updated) = updated {
                        let reason = error.to_string();
                        self.maybe_bounce(&updated, &reason).await;
                    }
                    return;
                }
                TxOutcome::Transient { error } => {
                    self.publish_attempt(&entry, &target, false, Some(&error));
                    tracing::debug!(
                        queue_id = %entry.queue_id,
                        target = %target.address(),
                        "target failed transiently, trying next"
                    );
                    last_error = error;
                }
            }
        }

        self.settle_failure(&entry, last_error).await;
    }

    /// All targets exhausted (or routing failed): defer or fail per the
    /// error class, the attempt count and the entry age.
    async fn settle_failure(&self, entry: &RelayMessage, error: DeliveryError) {
        if error.is_temporary() && entry.attempts < self.config.max_retry_count {
            let delay = backoff(entry.attempts);
            let _ = self
                .queue
                .complete(
                    entry.queue_id,
                    CompletionOutcome::Deferred {
                        error: error.to_string(),
                        next_attempt: std::time::SystemTime::now() + delay,
                    },
                )
                .await;
            internal!(
                "deferred {} for {}s after attempt {}",
                entry.queue_id,
                delay.as_secs(),
                entry.attempts
            );
            return;
        }

        let updated = self
            .queue
            .complete(
                entry.queue_id,
                CompletionOutcome::Failed {
                    error: error.to_string(),
                    rejected: Vec::new(),
                },
            )
            .await;
        if let Ok(updated) = updated {
            let reason = error.to_string();
            self.maybe_bounce(&updated, &reason).await;
        }
    }

    async fn maybe_bounce(&self, entry: &RelayMessage, reason: &str) {
        if !should_bounce(&self.config.bounce, entry) {
            return;
        }

        let Some(bounce) = generate_bounce(&self.config.bounce, entry, reason) else {
            return;
        };

        let Some(domain) = bounce
            .envelope()
            .recipients()
            .first()
            .and_then(Address::domain)
        else {
            return;
        };

        let recipients: Vec<String> = bounce
            .envelope()
            .recipients()
            .iter()
            .filter_map(|r| r.email().map(str::to_string))
            .collect();

        let priority = bounce.priority();
        self.queue
            .enqueue(Arc::new(bounce), domain, recipients, priority)
            .await;
    }

    fn publish_attempt(
        &self,
        entry: &RelayMessage,
        target: &Target,
        success: bool,
        error: Option<&DeliveryError>,
    ) {
        self.events.publish(&Event::DeliveryAttempted {
            queue_id: entry.queue_id,
            target: target.address(),
            attempt: entry.attempts,
            success,
            error: error.map(ToString::to_string),
        });
    }

    /// Bound an SMTP operation with the connection timeout and fold client
    /// errors into delivery errors.
    async fn op(
        &self,
        what: &str,
        fut: impl Future<Output = Result<Response, ClientError>> + Send,
    ) -> Result<Response, DeliveryError> {
        match tokio::time::timeout(
            Duration::from_secs(self.config.connection_timeout_secs),
            fut,
        )
        .await
        {
            Err(_) => Err(TemporaryError::Timeout(format!("{what} timed out")).into()),
            Ok(Err(err)) => Err(err.into()),
            Ok(Ok(response)) => Ok(response),
        }
    }

    /// One SMTP transaction against one target.
    async fn attempt_target(&self, entry: &RelayMessage, target: &Target) -> TxOutcome {
        let address = target.address();

        let connect = tokio::time::timeout(
            Duration::from_secs(self.config.connection_timeout_secs),
            SmtpClient::connect(&address, target.host.clone()),
        )
        .await;

        let client = match connect {
            Err(_) => {
                return TxOutcome::Transient {
                    error: TemporaryError::Timeout(format!("connect to {address} timed out"))
                        .into(),
                };
            }
            Ok(Err(err)) => {
                return TxOutcome::Transient {
                    error: TemporaryError::ConnectionFailed(format!(
                        "connect to {address} failed: {err}"
                    ))
                    .into(),
                };
            }
            Ok(Ok(client)) => client.accept_invalid_certs(self.config.accept_invalid_certs),
        };

        match self.transact(client, entry, target).await {
            Ok(outcome) => outcome,
            Err(error) if error.is_permanent() => TxOutcome::Rejected {
                error,
                rejected: Vec::new(),
            },
            Err(error) => TxOutcome::Transient { error },
        }
    }

    async fn transact(
        &self,
        mut client: SmtpClient,
        entry: &RelayMessage,
        target: &Target,
    ) -> Result<TxOutcome, DeliveryError> {
        let address = target.address();
        let greeting = self.op("greeting", client.read_greeting()).await?;
        if !greeting.is_success() {
            return Err(classify(greeting.code, format!("greeting: {}", greeting.message())));
        }

        let mut ehlo = self.op("EHLO", client.ehlo(&self.config.hostname)).await?;
        if !ehlo.is_success() {
            return Err(classify(ehlo.code, format!("EHLO: {}", ehlo.message())));
        }

        // STARTTLS: mandatory under require_tls, opportunistic otherwise
        let offers_tls = ehlo.has_capability("STARTTLS");
        if self.config.require_tls && !offers_tls {
            return Err(PermanentError::TlsRequired(format!(
                "{address} does not offer STARTTLS"
            ))
            .into());
        }

        if (self.config.require_tls || self.config.enable_tls) && offers_tls {
            let response = self.op("STARTTLS", client.starttls()).await;
            match response {
                Ok(response) if response.code == 220 => {
                    ehlo = self.op("EHLO", client.ehlo(&self.config.hostname)).await?;
                    if !ehlo.is_success() {
                        return Err(classify(
                            ehlo.code,
                            format!("EHLO after STARTTLS: {}", ehlo.message()),
                        ));
                    }
                }
                Ok(response) if self.config.require_tls => {
                    return Err(PermanentError::TlsRequired(format!(
                        "{address} refused STARTTLS: {}",
                        response.message()
                    ))
                    .into());
                }
                Ok(_) => {
                    tracing::debug!("{address} refused STARTTLS, continuing in plaintext");
                }
                Err(error) if self.config.require_tls => {
                    return Err(PermanentError::TlsRequired(error.to_string()).into());
                }
                Err(error) => return Err(error),
            }
        }

        if let Some((username, password)) = &target.credentials {
            self.authenticate(&mut client, username, password).await?;
        }

        let sender = entry
            .message
            .envelope()
            .sender()
            .and_then(|s| s.email())
            .unwrap_or_default();

        let mail = self
            .op("MAIL FROM", client.mail_from(sender, Some(entry.message.size())))
            .await?;
        if !mail.is_success() {
            return Err(classify(mail.code, format!("MAIL FROM: {}", mail.message())));
        }

        // Per-recipient bookkeeping: permanent rejections are final for that
        // recipient, transient ones defer the whole entry.
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        let mut transient_reason = None;

        for recipient in &entry.pending_recipients {
            let response = self.op("RCPT TO", client.rcpt_to(recipient)).await?;

            if response.is_success() {
                accepted.push(recipient.clone());
            } else if response.is_permanent() {
                rejected.push(RejectedRecipient {
                    recipient: recipient.clone(),
                    reason: format!("{} {}", response.code, response.message()),
                    permanent: true,
                });
            } else {
                transient_reason.get_or_insert(format!(
                    "{} {}",
                    response.code,
                    response.message()
                ));
            }
        }

        if accepted.is_empty() {
            let _ = client.quit().await;

            if let Some(reason) = transient_reason {
                return Err(TemporaryError::SmtpTemporary(format!(
                    "no recipient accepted: {reason}"
                ))
                .into());
            }
            return Ok(TxOutcome::Rejected {
                error: PermanentError::InvalidRecipient(
                    "all recipients rejected permanently".to_string(),
                )
                .into(),
                rejected,
            });
        }

        if let Some(reason) = transient_reason {
            // Mixed transient refusals: retry the whole entry rather than
            // splitting it mid-flight.
            let _ = client.quit().await;
            return Err(TemporaryError::SmtpTemporary(format!(
                "recipient deferred: {reason}"
            ))
            .into());
        }

        let data = self.op("DATA", client.data()).await?;
        if !data.is_intermediate() {
            return Err(classify(data.code, format!("DATA: {}", data.message())));
        }

        let wire = entry.message.to_wire();
        let final_reply = self.op("message data", client.send_data(&wire)).await?;
        if !final_reply.is_success() {
            return Err(classify(
                final_reply.code,
                format!("message data: {}", final_reply.message()),
            ));
        }

        let _ = self.op("QUIT", client.quit()).await;

        if rejected.is_empty() {
            Ok(TxOutcome::Delivered { accepted })
        } else {
            Ok(TxOutcome::Partial { accepted, rejected })
        }
    }

    async fn authenticate(
        &self,
        client: &mut SmtpClient,
        username: &str,
        password: &str,
    ) -> Result<(), DeliveryError> {
        let plain = self
            .op("AUTH PLAIN", client.auth_plain(username, password))
            .await?;
        if plain.is_success() {
            return Ok(());
        }

        // Some smart hosts only speak LOGIN
        let login = self
            .op("AUTH LOGIN", client.auth_login(username, password))
            .await?;
        if login.is_success() {
            return Ok(());
        }

        Err(PermanentError::AuthenticationFailed(format!(
            "{} {}",
            login.code,
            login.message()
        ))
        .into())
    }
}

const fn classify_code(code: u16) -> bool {
    code >= 500
}

fn classify(code: u16, message: String) -> DeliveryError {
    if classify_code(code) {
        PermanentError::MessageRejected(message).into()
    } else {
        TemporaryError::SmtpTemporary(message).into()
    }
}

/// The seam the SMTP engine submits accepted mail through: external
/// recipients are grouped by domain and each group becomes one queue entry.
#[async_trait]
impl Relayer for DeliveryEngine {
    async fn submit(&self, _session: &SessionInfo, message: Arc<Message>) -> bool {
        let mut by_domain: std::collections::HashMap<String, Vec<String>> =
            std::collections::HashMap::new();

        for recipient in message.envelope().recipients().iter() {
            let Some(email) = recipient.email() else {
                continue;
            };
            let Some(domain) = recipient.domain() else {
                continue;
            };
            if self.is_local(&domain) {
                continue;
            }
            by_domain.entry(domain).or_default().push(email.to_string());
        }

        for (domain, recipients) in by_domain {
            let priority = message.priority();
            self.queue
                .enqueue(Arc::clone(&message), domain, recipients, priority)
                .await;
        }

        true
    }
}

/// Status snapshot helpers used by operators and tests.
impl DeliveryEngine {
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.get_by_status(RelayStatus::Queued).len()
            + self.queue.get_by_status(RelayStatus::Deferred).len()
    }
}
