//! DNS resolution for mail routing.
//!
//! MX lookups with A/AAAA fallback per RFC 5321 section 5.1, behind a
//! narrow resolver contract so tests and exotic deployments can supply
//! their own, with LRU + TTL caching on the real implementation.

use std::{
    net::IpAddr,
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use hickory_resolver::{
    TokioAsyncResolver,
    config::{ResolverConfig, ResolverOpts},
};
use lru::LruCache;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Errors that can occur during DNS resolution.
#[derive(Debug, Error)]
pub enum DnsError {
    /// No MX, A, or AAAA records found for the domain.
    #[error("no mail servers found for domain: {0}")]
    NoMailServers(String),

    /// DNS query failed due to network or resolver issues.
    #[error("DNS lookup failed: {0}")]
    LookupFailed(#[from] hickory_resolver::error::ResolveError),

    /// Domain does not exist (NXDOMAIN).
    #[error("domain does not exist: {0}")]
    DomainNotFound(String),

    /// DNS query timed out.
    #[error("DNS query timed out for domain: {0}")]
    Timeout(String),
}

/// Configuration for the DNS resolver.
#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    /// DNS query timeout in seconds (default: 5)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Cache TTL in seconds (default: 300)
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Maximum cache size (default: 1000)
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
}

const fn default_timeout_secs() -> u64 {
    5
}

const fn default_cache_ttl_secs() -> u64 {
    300
}

const fn default_cache_size() -> usize {
    1000
}

const DEFAULT_CACHE_SIZE_NONZERO: NonZeroUsize = NonZeroUsize::new(default_cache_size()).unwrap();

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_size: default_cache_size(),
        }
    }
}

/// An MX target: exchange host, preference, and a weight used for
/// tie-breaking among equal preferences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailExchange {
    pub host: String,
    pub preference: u16,
    pub weight: u16,
}

impl MailExchange {
    #[must_use]
    pub const fn new(host: String, preference: u16) -> Self {
        Self {
            host,
            preference,
            weight: 1,
        }
    }
}

/// The resolver contract the router depends on.
#[async_trait]
pub trait RelayResolver: Send + Sync + std::fmt::Debug {
    /// MX records for `domain`, sorted by preference (with A/AAAA fallback
    /// as implicit preference-0 records).
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<MailExchange>, DnsError>;

    /// Address records for `host`.
    async fn resolve_a(&self, host: &str) -> Result<Vec<IpAddr>, DnsError>;
}

#[derive(Clone)]
struct CachedExchanges {
    exchanges: Arc<Vec<MailExchange>>,
    expires_at: Instant,
}

/// Production resolver over hickory with an LRU TTL cache.
pub struct HickoryRelayResolver {
    resolver: TokioAsyncResolver,
    cache: Mutex<LruCache<String, CachedExchanges>>,
    config: DnsConfig,
}

impl std::fmt::Debug for HickoryRelayResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HickoryRelayResolver")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HickoryRelayResolver {
    /// Resolver over the system DNS configuration.
    pub fn system(config: DnsConfig) -> Result<Self, DnsError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(config.timeout_secs);

        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), opts);
        Ok(Self::with_resolver(resolver, config))
    }

    #[must_use]
    pub fn with_resolver(resolver: TokioAsyncResolver, config: DnsConfig) -> Self {
        let cache_size =
            NonZeroUsize::new(config.cache_size).unwrap_or(DEFAULT_CACHE_SIZE_NONZERO);

        Self {
            resolver,
            cache: Mutex::new(LruCache::new(cache_size)),
            config,
        }
    }

    async fn resolve_uncached(&self, domain: &str) -> Result<Vec<MailExchange>, DnsError> {
        match self.resolver.mx_lookup(domain).await {
            Ok(mx_lookup) => {
                let mut exchanges: Vec<MailExchange> = mx_lookup
                    .iter()
                    .map(|mx| {
                        let host = mx.exchange().to_utf8();
                        let preference = mx.preference();
                        debug!("found MX record: {host} (preference {preference})");
                        MailExchange::new(host, preference)
                    })
                    .collect();

                if exchanges.is_empty() {
                    debug!("MX lookup returned no records for {domain}, falling back to A/AAAA");
                    return self.fallback_to_address(domain).await;
                }

                exchanges.sort_by_key(|mx| mx.preference);
                Ok(exchanges)
            }
            Err(err) => {
                if matches!(
                    err.kind(),
                    hickory_resolver::error::ResolveErrorKind::NoRecordsFound { .. }
                ) {
                    debug!("no MX records for {domain}, falling back to A/AAAA");
                    self.fallback_to_address(domain).await
                } else {
                    warn!("MX lookup failed for {domain}: {err}");
                    Err(DnsError::LookupFailed(err))
                }
            }
        }
    }

    /// RFC 5321: a domain with no MX but an address record is its own mail
    /// exchange, at an implicit preference of zero.
    async fn fallback_to_address(&self, domain: &str) -> Result<Vec<MailExchange>, DnsError> {
        match self.resolver.lookup_ip(domain).await {
            Ok(ip_lookup) => {
                let exchanges: Vec<MailExchange> = ip_lookup
                    .iter()
                    .map(|ip| MailExchange::new(ip.to_string(), 0))
                    .collect();

                if exchanges.is_empty() {
                    Err(DnsError::NoMailServers(domain.to_string()))
                } else {
                    Ok(exchanges)
                }
            }
            Err(err) => {
                if matches!(
                    err.kind(),
                    hickory_resolver::error::ResolveErrorKind::NoRecordsFound { .. }
                ) {
                    Err(DnsError::NoMailServers(domain.to_string()))
                } else {
                    Err(DnsError::LookupFailed(err))
                }
            }
        }
    }
}

#[async_trait]
impl RelayResolver for HickoryRelayResolver {
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<MailExchange>, DnsError> {
        {
            let mut cache = self.cache.lock().await;
            if let Some(cached) = cache.get(domain)
                && cached.expires_at > Instant::now()
            {
                debug!("MX cache hit for {domain}");
                return Ok(cached.exchanges.as_ref().clone());
            }
        }

        let exchanges = Arc::new(self.resolve_uncached(domain).await?);

        let expires_at = Instant::now() + Duration::from_secs(self.config.cache_ttl_secs);
        self.cache.lock().await.put(
            domain.to_string(),
            CachedExchanges {
                exchanges: Arc::clone(&exchanges),
                expires_at,
            },
        );

        Ok(exchanges.as_ref().clone())
    }

    async fn resolve_a(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        match self.resolver.lookup_ip(host).await {
            Ok(lookup) => {
                let ips: Vec<IpAddr> = lookup.iter().collect();
                if ips.is_empty() {
                    Err(DnsError::DomainNotFound(host.to_string()))
                } else {
                    Ok(ips)
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    hickory_resolver::error::ResolveErrorKind::NoRecordsFound { .. }
                ) =>
            {
                Err(DnsError::DomainNotFound(host.to_string()))
            }
            Err(err) => Err(DnsError::LookupFailed(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mail_exchange_preference_sorting() {
        let mut exchanges = [
            MailExchange::new("mx3.example.com".to_string(), 30),
            MailExchange::new("mx1.example.com".to_string(), 10),
            MailExchange::new("mx2.example.com".to_string(), 20),
        ];

        exchanges.sort_by_key(|mx| mx.preference);

        assert_eq!(exchanges[0].preference, 10);
        assert_eq!(exchanges[1].preference, 20);
        assert_eq!(exchanges[2].preference, 30);
    }

    #[tokio::test]
    #[ignore = "requires network access"]
    async fn mx_lookup_real_domain() {
        let resolver = HickoryRelayResolver::system(DnsConfig::default()).unwrap();
        let exchanges = resolver.resolve_mx("gmail.com").await.unwrap();

        assert!(!exchanges.is_empty());
        assert!(
            exchanges
                .windows(2)
                .all(|w| w[0].preference <= w[1].preference)
        );
    }
}
