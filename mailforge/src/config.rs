//! The TOML configuration surface.

use std::{collections::HashMap, path::PathBuf};

use mailforge_relay::RelayConfig;
use mailforge_smtp::{connection::TlsContext, policy::IpNetwork};
use mailforge_spam::{Thresholds, checkers::GreylistChecker};
use serde::Deserialize;

pub use mailforge_spam::checkers as spam_checkers;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub antispam: AntiSpamSection,
}

impl Config {
    pub fn from_toml(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "defaults::listeners")]
    pub listeners: Vec<ListenerSection>,

    /// Hostname used in the greeting banner and EHLO identity.
    #[serde(default)]
    pub banner: String,

    /// Global connection cap; zero disables it.
    #[serde(default)]
    pub max_connections: usize,

    #[serde(default = "defaults::max_connections_per_ip")]
    pub max_connections_per_ip: usize,

    /// SIZE extension value; zero advertises no fixed maximum.
    #[serde(default = "defaults::max_message_size")]
    pub max_message_size: usize,

    #[serde(default = "defaults::max_recipients")]
    pub max_recipients: usize,

    /// Session error budget before `421 too many errors`.
    #[serde(default = "defaults::max_retry_count")]
    pub max_retry_count: u32,

    #[serde(default = "defaults::command_timeout_secs")]
    pub command_timeout_secs: u64,

    #[serde(default = "defaults::drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    #[serde(default)]
    pub require_authentication: bool,

    #[serde(default)]
    pub require_secure_connection: bool,

    /// Enables STARTTLS (and implicit-TLS listeners).
    #[serde(default)]
    pub certificate: Option<TlsContext>,

    /// Authentication credentials; AUTH is offered when non-empty.
    #[serde(default)]
    pub users: HashMap<String, String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listeners: defaults::listeners(),
            banner: String::new(),
            max_connections: 0,
            max_connections_per_ip: defaults::max_connections_per_ip(),
            max_message_size: defaults::max_message_size(),
            max_recipients: defaults::max_recipients(),
            max_retry_count: defaults::max_retry_count(),
            command_timeout_secs: defaults::command_timeout_secs(),
            drain_timeout_secs: defaults::drain_timeout_secs(),
            require_authentication: false,
            require_secure_connection: false,
            certificate: None,
            users: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerSection {
    pub port: u16,
    #[serde(default = "defaults::bind_address")]
    pub address: String,
    #[serde(default)]
    pub implicit_tls: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreSection {
    #[serde(default)]
    pub kind: StoreKind,
    /// Directory for the file store.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// The relay engine settings plus the admission lists shared with the
/// session policy.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelaySection {
    #[serde(flatten)]
    pub config: RelayConfig,

    /// Domains accepted for relay from anyone.
    #[serde(default)]
    pub relay_domains: Vec<String>,

    /// Client networks allowed to relay anywhere.
    #[serde(default)]
    pub relay_networks: Vec<IpNetwork>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AntiSpamSection {
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub thresholds: Thresholds,

    #[serde(default = "defaults::checker_timeout_secs")]
    pub checker_timeout_secs: u64,

    /// SPF/DKIM/DMARC verification (requires working DNS).
    #[serde(default = "defaults::enabled")]
    pub dns_checks: bool,

    /// DNSBL zones; RBL checking is off with an empty list.
    #[serde(default)]
    pub rbl_zones: Vec<spam_checkers::Dnsbl>,

    #[serde(default = "defaults::enabled")]
    pub content_rules: bool,

    #[serde(default = "defaults::enabled")]
    pub bayes: bool,

    #[serde(default = "defaults::enabled")]
    pub greylist: bool,

    #[serde(default)]
    pub greylist_config: mailforge_spam::checkers::GreylistConfig,

    #[serde(default)]
    pub weights: CheckerWeights,
}

impl Default for AntiSpamSection {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled(),
            thresholds: Thresholds::default(),
            checker_timeout_secs: defaults::checker_timeout_secs(),
            dns_checks: defaults::enabled(),
            rbl_zones: Vec::new(),
            content_rules: defaults::enabled(),
            bayes: defaults::enabled(),
            greylist: defaults::enabled(),
            greylist_config: mailforge_spam::checkers::GreylistConfig::default(),
            weights: CheckerWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CheckerWeights {
    #[serde(default = "defaults::weight")]
    pub spf: f64,
    #[serde(default = "defaults::weight")]
    pub dkim: f64,
    #[serde(default = "defaults::weight")]
    pub dmarc: f64,
    #[serde(default = "defaults::weight")]
    pub rbl: f64,
    #[serde(default = "defaults::weight")]
    pub bayes: f64,
    #[serde(default = "defaults::weight")]
    pub content: f64,
    #[serde(default = "defaults::weight")]
    pub greylist: f64,
}

impl Default for CheckerWeights {
    fn default() -> Self {
        Self {
            spf: defaults::weight(),
            dkim: defaults::weight(),
            dmarc: defaults::weight(),
            rbl: defaults::weight(),
            bayes: defaults::weight(),
            content: defaults::weight(),
            greylist: defaults::weight(),
        }
    }
}

mod defaults {
    use super::ListenerSection;

    pub fn listeners() -> Vec<ListenerSection> {
        vec![ListenerSection {
            port: 25,
            address: bind_address(),
            implicit_tls: false,
        }]
    }

    pub fn bind_address() -> String {
        "0.0.0.0".to_string()
    }

    pub const fn max_connections_per_ip() -> usize {
        10
    }

    pub const fn max_message_size() -> usize {
        26_214_400 // 25 MiB
    }

    pub const fn max_recipients() -> usize {
        100
    }

    pub const fn max_retry_count() -> u32 {
        3
    }

    pub const fn command_timeout_secs() -> u64 {
        30
    }

    pub const fn drain_timeout_secs() -> u64 {
        30
    }

    pub const fn enabled() -> bool {
        true
    }

    pub const fn checker_timeout_secs() -> u64 {
        10
    }

    pub const fn weight() -> f64 {
        1.0
    }
}

// Re-exported so the server module can construct the default greylist
// checker from its config section.
pub(crate) fn greylist_checker(section: &AntiSpamSection) -> GreylistChecker {
    GreylistChecker::new(section.greylist_config)
}
