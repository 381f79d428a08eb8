use std::{
    net::IpAddr,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;

use crate::{SpamChecker, SpamCheckContext, SpamCheckResult};

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct GreylistConfig {
    /// Minimum wait before a retry is accepted.
    #[serde(default = "default_delay_secs")]
    pub delay_secs: u64,
    /// How long a pending tuple stays valid before it must start over.
    #[serde(default = "default_lifetime_secs")]
    pub lifetime_secs: u64,
    /// How long an accepted tuple stays whitelisted.
    #[serde(default = "default_whitelist_secs")]
    pub whitelist_secs: u64,
    /// Score emitted while a tuple is deferred; sized to land in the
    /// greylist action band at weight 1.
    #[serde(default = "default_score")]
    pub score: f64,
}

const fn default_delay_secs() -> u64 {
    300 // 5 minutes
}

const fn default_lifetime_secs() -> u64 {
    14_400 // 4 hours
}

const fn default_whitelist_secs() -> u64 {
    604_800 // 7 days
}

const fn default_score() -> f64 {
    60.0
}

impl Default for GreylistConfig {
    fn default() -> Self {
        Self {
            delay_secs: default_delay_secs(),
            lifetime_secs: default_lifetime_secs(),
            whitelist_secs: default_whitelist_secs(),
            score: default_score(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct GreylistEntry {
    first_seen: Instant,
    whitelisted_until: Option<Instant>,
}

/// Greylisting over `(client /24, sender, first recipient)` tuples.
///
/// A first sighting is remembered and scored into the greylist band, which
/// the service maps to a 451 defer. A retry after the delay window (and
/// within the tuple lifetime) scores zero and whitelists the tuple for the
/// longer TTL. Naive spamware never comes back; real MTAs do.
#[derive(Debug)]
pub struct GreylistChecker {
    entries: DashMap<String, GreylistEntry>,
    config: GreylistConfig,
}

impl GreylistChecker {
    #[must_use]
    pub fn new(config: GreylistConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    /// The tuple key: IPv4 addresses are truncated to their /24 so pool
    /// rotation inside one provider does not restart the clock.
    fn key(ip: IpAddr, sender: &str, recipient: &str) -> String {
        let network = match ip {
            IpAddr::V4(v4) => {
                let [a, b, c, _] = v4.octets();
                format!("{a}.{b}.{c}")
            }
            IpAddr::V6(v6) => {
                let segments = v6.segments();
                format!("{:x}:{:x}:{:x}:{:x}", segments[0], segments[1], segments[2], segments[3])
            }
        };

        format!("{network}|{}|{}", sender.to_ascii_lowercase(), recipient.to_ascii_lowercase())
    }

    /// Drop expired pending entries and expired whitelistings.
    pub fn purge_expired(&self) {
        let lifetime = Duration::from_secs(self.config.lifetime_secs);
        self.entries.retain(|_, entry| {
            entry.whitelisted_until.map_or_else(
                || entry.first_seen.elapsed() <= lifetime,
                |until| Instant::now() < until,
            )
        });
    }

    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    fn evaluate(&self, key: String) -> Verdict {
        let now = Instant::now();
        let delay = Duration::from_secs(self.config.delay_secs);
        let lifetime = Duration::from_secs(self.config.lifetime_secs);
        let whitelist = Duration::from_secs(self.config.whitelist_secs);

        let mut entry = self.entries.entry(key).or_insert(GreylistEntry {
            first_seen: now,
            whitelisted_until: None,
        });

        if let Some(until) = entry.whitelisted_until {
            if now < until {
                return Verdict::Whitelisted;
            }
            // Whitelisting lapsed; start over
            entry.first_seen = now;
            entry.whitelisted_until = None;
            return Verdict::FirstSeen;
        }

        let age = now.duration_since(entry.first_seen);

        if age == Duration::ZERO {
            return Verdict::FirstSeen;
        }

        if age > lifetime {
            entry.first_seen = now;
            return Verdict::FirstSeen;
        }

        if age < delay {
            return Verdict::TooSoon;
        }

        entry.whitelisted_until = Some(now + whitelist);
        Verdict::Matured
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    FirstSeen,
    TooSoon,
    Matured,
    Whitelisted,
}

#[async_trait]
impl SpamChecker for GreylistChecker {
    fn name(&self) -> &'static str {
        "greylist"
    }

    async fn check(&self, ctx: &SpamCheckContext) -> SpamCheckResult {
        // Authenticated submissions are never greylisted
        if ctx.authenticated {
            return SpamCheckResult::clean();
        }

        let sender = ctx.sender.as_deref().unwrap_or("<>");
        let Some(recipient) = ctx.recipients.first() else {
            return SpamCheckResult::clean();
        };

        let key = Self::key(ctx.client_ip, sender, recipient);

        match self.evaluate(key) {
            Verdict::Matured | Verdict::Whitelisted => SpamCheckResult::clean(),
            Verdict::FirstSeen => SpamCheckResult {
                is_spam: false,
                score: self.config.score,
                reason: Some("first sighting of this (network, sender, recipient)".to_string()),
                details: Some("greylist=defer".to_string()),
            },
            Verdict::TooSoon => SpamCheckResult {
                is_spam: false,
                score: self.config.score,
                reason: Some("retry arrived inside the greylist delay window".to_string()),
                details: Some("greylist=defer".to_string()),
            },
        }
    }
}

impl Default for GreylistChecker {
    fn default() -> Self {
        Self::new(GreylistConfig::default())
    }
}
