//! Server composition: the config surface is turned into concrete
//! subsystems here, owned directly by the server. There are no global
//! registries; everything a session touches is handed to it explicitly.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use mailforge_common::{
    Signal,
    events::EventBus,
    internal,
    pipeline::{Inspector, Relayer},
};
use mailforge_relay::{DeliveryEngine, DnsConfig, HickoryRelayResolver, NullQueueStore, RelayResolver};
use mailforge_smtp::{
    auth::Verifier,
    listener::{ConnectionGauge, ConnectionLimits, Endpoint, SmtpListener},
    policy::RelayPolicy,
    session::SessionConfig,
};
use mailforge_spam::{
    AntiSpamService,
    checkers::{
        BayesChecker, ContentChecker, DkimChecker, DmarcChecker, RblChecker, SpfChecker,
    },
};
use mailforge_store::{FileStore, MemoryStore, MessageStore};
use thiserror::Error;
use tokio::net::TcpListener;

use crate::config::{AntiSpamSection, Config, StoreKind, greylist_checker};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("DNS resolver setup failed: {0}")]
    Dns(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The assembled server, ready to bind.
pub struct Server {
    config: Config,
    session_config: Arc<SessionConfig>,
    engine: Arc<DeliveryEngine>,
    events: EventBus,
    gauge: Arc<ConnectionGauge>,
    bayes: Option<Arc<BayesChecker>>,
}

impl Server {
    pub fn from_config(config: Config) -> Result<Self, BuildError> {
        let events = EventBus::new();
        let banner = if config.server.banner.is_empty() {
            "localhost".to_string()
        } else {
            config.server.banner.clone()
        };

        let store: Arc<dyn MessageStore> = match config.store.kind {
            StoreKind::Memory => Arc::new(MemoryStore::new()),
            StoreKind::File => {
                let path = config.store.path.clone().ok_or_else(|| {
                    BuildError::Config("file store requires store.path".to_string())
                })?;
                Arc::new(FileStore::new(path))
            }
        };

        let resolver: Option<Arc<dyn RelayResolver>> = if config.relay.config.use_mx_routing {
            let resolver = HickoryRelayResolver::system(DnsConfig::default())
                .map_err(|e| BuildError::Dns(e.to_string()))?;
            Some(Arc::new(resolver))
        } else {
            None
        };

        let mut relay_config = config.relay.config.clone();
        if relay_config.hostname == "localhost" {
            // Outbound EHLO identity follows the banner unless set explicitly
            relay_config.hostname = banner.clone();
        }

        let engine = Arc::new(DeliveryEngine::new(
            relay_config,
            Arc::new(NullQueueStore),
            resolver,
            events.clone(),
        ));

        let (inspector, bayes) = if config.antispam.enabled {
            let (service, bayes) = build_antispam(&config.antispam, &banner)?;
            (Some(service as Arc<dyn Inspector>), bayes)
        } else {
            (None, None)
        };

        let verifier = (!config.server.users.is_empty()).then(|| {
            Verifier::fixed(
                config
                    .server
                    .users
                    .iter()
                    .map(|(user, pass)| (user.clone(), pass.clone())),
            )
        });

        let relay_policy = RelayPolicy {
            local_domains: config.relay.config.local_domains.clone(),
            relay_domains: config.relay.relay_domains.clone(),
            relay_networks: config.relay.relay_networks.clone(),
        };

        let session_config = Arc::new(
            SessionConfig::builder()
                .with_banner(banner)
                .with_max_message_size(config.server.max_message_size)
                .with_max_recipients(config.server.max_recipients)
                .with_max_errors(config.server.max_retry_count)
                .with_command_timeout(Duration::from_secs(config.server.command_timeout_secs))
                .with_require_authentication(config.server.require_authentication)
                .with_require_secure_connection(config.server.require_secure_connection)
                .with_tls(config.server.certificate.clone())
                .with_verifier(verifier)
                .with_relay_policy(relay_policy)
                .with_store(Some(store))
                .with_inspector(inspector)
                .with_relayer(Some(Arc::clone(&engine) as Arc<dyn Relayer>))
                .with_events(events.clone())
                .build(),
        );

        Ok(Self {
            config,
            session_config,
            engine,
            events,
            gauge: Arc::new(ConnectionGauge::default()),
            bayes,
        })
    }

    #[must_use]
    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    #[must_use]
    pub fn engine(&self) -> Arc<DeliveryEngine> {
        Arc::clone(&self.engine)
    }

    #[must_use]
    pub fn gauge(&self) -> Arc<ConnectionGauge> {
        Arc::clone(&self.gauge)
    }

    /// The Bayesian training entry point, when the checker is enabled.
    #[must_use]
    pub fn bayes(&self) -> Option<Arc<BayesChecker>> {
        self.bayes.clone()
    }

    /// Bind every configured listener. Separated from `serve` so callers
    /// (and tests) can learn the bound addresses before traffic starts.
    pub async fn bind(self) -> Result<BoundServer, BuildError> {
        let limits = ConnectionLimits {
            max_connections: self.config.server.max_connections,
            max_per_ip: self.config.server.max_connections_per_ip,
        };
        let drain_timeout = Duration::from_secs(self.config.server.drain_timeout_secs);

        let mut bound = Vec::new();
        for section in &self.config.server.listeners {
            let ip: std::net::IpAddr = section.address.parse().map_err(|e| {
                BuildError::Config(format!(
                    "invalid listener address {}: {e}",
                    section.address
                ))
            })?;
            let address = SocketAddr::new(ip, section.port);

            let socket = TcpListener::bind(address).await?;
            let local = socket.local_addr()?;

            let endpoint = Endpoint {
                socket: local,
                implicit_tls: section.implicit_tls,
            };
            let listener = SmtpListener::new(
                endpoint,
                limits,
                Arc::clone(&self.gauge),
                Arc::clone(&self.session_config),
            )
            .with_drain_timeout(drain_timeout);

            bound.push((socket, listener));
        }

        Ok(BoundServer {
            listeners: bound,
            engine: self.engine,
        })
    }
}

/// A server with sockets bound, ready to serve.
pub struct BoundServer {
    listeners: Vec<(TcpListener, SmtpListener)>,
    engine: Arc<DeliveryEngine>,
}

impl BoundServer {
    #[must_use]
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|(socket, _)| socket.local_addr().ok())
            .collect()
    }

    /// Serve until `shutdown` broadcasts. Listeners drain their sessions,
    /// the delivery engine parks its queue, then everything joins.
    pub async fn serve(
        self,
        shutdown: tokio::sync::broadcast::Sender<Signal>,
    ) -> anyhow::Result<()> {
        let mut tasks = tokio::task::JoinSet::new();

        tasks.spawn({
            let engine = Arc::clone(&self.engine);
            let shutdown = shutdown.clone();
            async move {
                engine.run(shutdown).await;
                Ok(())
            }
        });

        for (socket, listener) in self.listeners {
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                listener
                    .serve_on(socket, shutdown)
                    .await
                    .map_err(anyhow::Error::from)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    internal!(level = ERROR, "server task failed: {err}");
                    return Err(err);
                }
                Err(err) if err.is_cancelled() => {}
                Err(err) => return Err(err.into()),
            }
        }

        Ok(())
    }
}

fn build_antispam(
    section: &AntiSpamSection,
    banner: &str,
) -> Result<(Arc<AntiSpamService>, Option<Arc<BayesChecker>>), BuildError> {
    let service = AntiSpamService::new(section.thresholds)
        .with_checker_timeout(Duration::from_secs(section.checker_timeout_secs));
    let weights = &section.weights;

    if section.dns_checks {
        let resolver = Arc::new(
            mail_auth::Resolver::new_system_conf().map_err(|e| BuildError::Dns(e.to_string()))?,
        );

        service.register(
            Arc::new(SpfChecker::new(Arc::clone(&resolver), banner)),
            weights.spf,
        );
        service.register(Arc::new(DkimChecker::new(Arc::clone(&resolver))), weights.dkim);
        service.register(
            Arc::new(DmarcChecker::new(resolver, banner)),
            weights.dmarc,
        );
    }

    if !section.rbl_zones.is_empty() {
        let resolver = hickory_resolver::TokioAsyncResolver::tokio(
            hickory_resolver::config::ResolverConfig::default(),
            hickory_resolver::config::ResolverOpts::default(),
        );
        service.register(
            Arc::new(RblChecker::new(resolver, section.rbl_zones.clone())),
            weights.rbl,
        );
    }

    if section.content_rules {
        service.register(
            Arc::new(ContentChecker::with_default_rules()),
            weights.content,
        );
    }

    let bayes = if section.bayes {
        let checker = Arc::new(BayesChecker::new());
        service.register(Arc::clone(&checker) as Arc<dyn mailforge_spam::SpamChecker>, weights.bayes);
        Some(checker)
    } else {
        None
    };

    if section.greylist {
        service.register(Arc::new(greylist_checker(section)), weights.greylist);
    }

    Ok((Arc::new(service), bayes))
}
