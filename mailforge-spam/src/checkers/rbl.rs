use std::{
    net::IpAddr,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use hickory_resolver::TokioAsyncResolver;
use serde::Deserialize;

use crate::{SpamChecker, SpamCheckContext, SpamCheckResult};

/// One DNSBL zone to query.
#[derive(Debug, Clone, Deserialize)]
pub struct Dnsbl {
    pub zone: String,
    #[serde(default = "default_zone_score")]
    pub score: f64,
}

const fn default_zone_score() -> f64 {
    50.0
}

#[derive(Clone)]
struct CachedListing {
    listed: bool,
    checked_at: Instant,
}

/// Realtime blocklist lookups: the client IP is reversed, appended to each
/// configured zone, and queried for an A record; any answer means listed.
/// Results are cached per (ip, zone).
pub struct RblChecker {
    resolver: TokioAsyncResolver,
    zones: Vec<Dnsbl>,
    cache: DashMap<(IpAddr, String), CachedListing>,
    cache_ttl: Duration,
}

impl std::fmt::Debug for RblChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RblChecker")
            .field("zones", &self.zones)
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

/// Build the DNSBL query name for an address: reversed octets for IPv4,
/// reversed nibbles for IPv6 (RFC 5782).
#[must_use]
pub fn query_name(ip: IpAddr, zone: &str) -> String {
    match ip {
        IpAddr::V4(ipv4) => {
            let octets = ipv4.octets();
            format!(
                "{}.{}.{}.{}.{zone}",
                octets[3], octets[2], octets[1], octets[0]
            )
        }
        IpAddr::V6(ipv6) => {
            let nibbles: Vec<String> = ipv6
                .octets()
                .iter()
                .flat_map(|b| [b >> 4, b & 0x0f])
                .rev()
                .map(|n| format!("{n:x}"))
                .collect();
            format!("{}.{zone}", nibbles.join("."))
        }
    }
}

impl RblChecker {
    #[must_use]
    pub fn new(resolver: TokioAsyncResolver, zones: Vec<Dnsbl>) -> Self {
        Self {
            resolver,
            zones,
            cache: DashMap::new(),
            cache_ttl: Duration::from_secs(3600),
        }
    }

    #[must_use]
    pub const fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    async fn is_listed(&self, ip: IpAddr, zone: &str) -> bool {
        let key = (ip, zone.to_string());

        if let Some(cached) = self.cache.get(&key)
            && cached.checked_at.elapsed() < self.cache_ttl
        {
            return cached.listed;
        }

        let query = query_name(ip, zone);
        tracing::debug!("DNSBL query: {query}");

        // Any A record means listed; NXDOMAIN and lookup failures mean not
        // listed (a broken blocklist must not score mail).
        let listed = self
            .resolver
            .ipv4_lookup(query)
            .await
            .map(|answer| answer.iter().next().is_some())
            .unwrap_or(false);

        self.cache.insert(
            key,
            CachedListing {
                listed,
                checked_at: Instant::now(),
            },
        );

        listed
    }
}

#[async_trait]
impl SpamChecker for RblChecker {
    fn name(&self) -> &'static str {
        "rbl"
    }

    async fn check(&self, ctx: &SpamCheckContext) -> SpamCheckResult {
        // Private and loopback addresses are never meaningfully listed
        let skip = match ctx.client_ip {
            IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
            IpAddr::V6(v6) => v6.is_loopback(),
        };
        if skip {
            return SpamCheckResult::clean();
        }

        let mut score = 0.0;
        let mut listed_zones = Vec::new();

        for dnsbl in &self.zones {
            if self.is_listed(ctx.client_ip, &dnsbl.zone).await {
                score += dnsbl.score;
                listed_zones.push(dnsbl.zone.clone());
            }
        }

        if listed_zones.is_empty() {
            SpamCheckResult::clean()
        } else {
            SpamCheckResult {
                is_spam: true,
                score: score.min(100.0),
                reason: Some(format!(
                    "{} listed on {}",
                    ctx.client_ip,
                    listed_zones.join(", ")
                )),
                details: Some(format!("rbl={}", listed_zones.join(","))),
            }
        }
    }
}
