//! Target selection for a destination domain.
//!
//! Precedence: per-domain routing overrides, then MX records (preference
//! order, weight-weighted random among equals), then the default smart host
//! and the remaining smart hosts by ascending priority tier with weighted
//! random inside a tier.

use std::{collections::HashMap, sync::Arc};

use rand::Rng;
use serde::Deserialize;

use crate::{
    dns::{MailExchange, RelayResolver},
    error::{DeliveryError, PermanentError},
};

/// A fixed downstream MTA. Lower `priority` is tried first; `weight`
/// balances load inside a tier.
#[derive(Debug, Clone, Deserialize)]
pub struct SmartHost {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub priority: u16,
    #[serde(default = "default_weight")]
    pub weight: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

const fn default_port() -> u16 {
    25
}

const fn default_weight() -> u16 {
    1
}

impl SmartHost {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            priority: 0,
            weight: default_weight(),
            username: None,
            password: None,
        }
    }

    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A concrete connection target produced by routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    /// Smart-host credentials, when the target came from one.
    pub credentials: Option<(String, String)>,
    /// Whether this target is a configured smart host (recorded on the
    /// queue entry) rather than an MX.
    pub smart_host: bool,
}

impl Target {
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn from_smart_host(host: &SmartHost) -> Self {
        Self {
            host: host.host.clone(),
            port: host.port,
            credentials: host
                .username
                .clone()
                .zip(host.password.clone()),
            smart_host: true,
        }
    }

    fn from_exchange(exchange: &MailExchange) -> Self {
        Self {
            host: exchange.host.trim_end_matches('.').to_string(),
            port: 25,
            credentials: None,
            smart_host: false,
        }
    }
}

/// Resolves the ordered target list for a domain.
#[derive(Debug, Default)]
pub struct Router {
    pub use_mx_routing: bool,
    pub default_smart_host: Option<SmartHost>,
    pub smart_hosts: Vec<SmartHost>,
    pub domain_routing: HashMap<String, SmartHost>,
    pub resolver: Option<Arc<dyn RelayResolver>>,
}

impl Router {
    /// The targets to try for `domain`, most preferred first.
    pub async fn targets_for(&self, domain: &str) -> Result<Vec<Target>, DeliveryError> {
        let domain = domain.to_ascii_lowercase();

        // Domain overrides take precedence over everything
        if let Some(host) = self.domain_routing.get(&domain) {
            return Ok(vec![Target::from_smart_host(host)]);
        }

        if self.use_mx_routing
            && let Some(resolver) = &self.resolver
        {
            match resolver.resolve_mx(&domain).await {
                Ok(exchanges) => return Ok(order_exchanges(exchanges)),
                Err(err) if self.has_smart_hosts() => {
                    tracing::debug!("MX routing failed for {domain} ({err}), using smart hosts");
                }
                Err(err) => return Err(err.into()),
            }
        }

        let targets = self.smart_host_targets();
        if targets.is_empty() {
            return Err(PermanentError::NoMailServers(domain).into());
        }
        Ok(targets)
    }

    fn has_smart_hosts(&self) -> bool {
        self.default_smart_host.is_some() || !self.smart_hosts.is_empty()
    }

    fn smart_host_targets(&self) -> Vec<Target> {
        let mut targets = Vec::new();

        if let Some(default) = &self.default_smart_host {
            targets.push(Target::from_smart_host(default));
        }

        let mut tiers: Vec<(u16, Vec<&SmartHost>)> = Vec::new();
        for host in &self.smart_hosts {
            match tiers.iter_mut().find(|(priority, _)| *priority == host.priority) {
                Some((_, tier)) => tier.push(host),
                None => tiers.push((host.priority, vec![host])),
            }
        }
        tiers.sort_by_key(|(priority, _)| *priority);

        for (_, tier) in tiers {
            for host in weighted_order(tier) {
                targets.push(Target::from_smart_host(host));
            }
        }

        targets
    }
}

/// Order MX exchanges: ascending preference, equal preferences in
/// weight-weighted random order.
fn order_exchanges(exchanges: Vec<MailExchange>) -> Vec<Target> {
    let mut groups: Vec<(u16, Vec<MailExchange>)> = Vec::new();
    for exchange in exchanges {
        match groups
            .iter_mut()
            .find(|(preference, _)| *preference == exchange.preference)
        {
            Some((_, group)) => group.push(exchange),
            None => groups.push((exchange.preference, vec![exchange])),
        }
    }
    groups.sort_by_key(|(preference, _)| *preference);

    let mut targets = Vec::new();
    for (_, group) in groups {
        let refs: Vec<&MailExchange> = group.iter().collect();
        for exchange in weighted_order_by(refs, |mx| mx.weight) {
            targets.push(Target::from_exchange(exchange));
        }
    }
    targets
}

fn weighted_order(hosts: Vec<&SmartHost>) -> Vec<&SmartHost> {
    weighted_order_by(hosts, |host| host.weight)
}

/// Weighted random order without replacement: each round draws one item
/// with probability proportional to its weight.
fn weighted_order_by<T>(mut items: Vec<T>, weight: impl Fn(&T) -> u16) -> Vec<T> {
    let mut rng = rand::rng();
    let mut ordered = Vec::with_capacity(items.len());

    while !items.is_empty() {
        let total: u32 = items.iter().map(|i| u32::from(weight(i).max(1))).sum();
        let mut pick = rng.random_range(0..total);

        let index = items
            .iter()
            .position(|item| {
                let w = u32::from(weight(item).max(1));
                if pick < w {
                    true
                } else {
                    pick -= w;
                    false
                }
            })
            .unwrap_or(0);

        ordered.push(items.remove(index));
    }

    ordered
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{Router, SmartHost, order_exchanges};
    use crate::dns::MailExchange;

    #[tokio::test]
    async fn domain_override_wins() {
        let mut routing = HashMap::new();
        routing.insert(
            "special.example".to_string(),
            SmartHost::new("relay.special.example", 2525),
        );

        let router = Router {
            use_mx_routing: true,
            domain_routing: routing,
            default_smart_host: Some(SmartHost::new("fallback.example", 25)),
            ..Router::default()
        };

        let targets = router.targets_for("SPECIAL.example").await.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].address(), "relay.special.example:2525");
        assert!(targets[0].smart_host);
    }

    #[tokio::test]
    async fn smart_hosts_order_by_tier() {
        let router = Router {
            use_mx_routing: false,
            default_smart_host: Some(SmartHost::new("primary.example", 25)),
            smart_hosts: vec![
                SmartHost {
                    priority: 20,
                    ..SmartHost::new("tier20.example", 25)
                },
                SmartHost {
                    priority: 10,
                    ..SmartHost::new("tier10.example", 25)
                },
            ],
            ..Router::default()
        };

        let targets = router.targets_for("anything.example").await.unwrap();
        let hosts: Vec<&str> = targets.iter().map(|t| t.host.as_str()).collect();

        assert_eq!(
            hosts,
            vec!["primary.example", "tier10.example", "tier20.example"]
        );
    }

    #[tokio::test]
    async fn no_route_is_a_permanent_failure() {
        let router = Router {
            use_mx_routing: false,
            ..Router::default()
        };

        let err = router.targets_for("nowhere.example").await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[test]
    fn exchanges_are_grouped_by_preference() {
        let targets = order_exchanges(vec![
            MailExchange::new("mx-b.example.".to_string(), 10),
            MailExchange::new("mx-backup.example.".to_string(), 20),
            MailExchange::new("mx-a.example.".to_string(), 10),
        ]);

        assert_eq!(targets.len(), 3);
        // Backup always last; trailing dots stripped
        assert_eq!(targets[2].host, "mx-backup.example");
        assert!(
            targets[..2]
                .iter()
                .all(|t| t.host == "mx-a.example" || t.host == "mx-b.example")
        );
    }

    #[test]
    fn weighted_order_respects_zero_and_dominant_weights() {
        // A dominant weight should come out first almost always; run a few
        // rounds and check it never loses to a weight-1 peer every time.
        let heavy = SmartHost {
            weight: 1000,
            ..SmartHost::new("heavy.example", 25)
        };
        let light = SmartHost {
            weight: 1,
            ..SmartHost::new("light.example", 25)
        };

        let mut heavy_first = 0;
        for _ in 0..50 {
            let ordered = super::weighted_order(vec![&heavy, &light]);
            if ordered[0].host == "heavy.example" {
                heavy_first += 1;
            }
        }

        assert!(heavy_first > 40, "heavy host won only {heavy_first}/50");
    }

    #[tokio::test]
    async fn credentials_come_from_the_smart_host() {
        let router = Router {
            use_mx_routing: false,
            default_smart_host: Some(SmartHost {
                username: Some("relay-user".to_string()),
                password: Some("relay-pass".to_string()),
                ..SmartHost::new("auth.example", 587)
            }),
            ..Router::default()
        };

        let targets = router.targets_for("x.example").await.unwrap();
        assert_eq!(
            targets[0].credentials,
            Some(("relay-user".to_string(), "relay-pass".to_string()))
        );
    }
}
