//! Relay queue and delivery engine: durable priority queueing of outbound
//! mail, MX/smart-host routing, a worker pool with a deterministic retry
//! schedule, and bounce generation.

pub mod backoff;
pub mod bounce;
pub mod delivery;
pub mod dns;
pub mod error;
pub mod queue;
pub mod route;

pub use backoff::backoff;
pub use bounce::BounceConfig;
pub use delivery::{DeliveryEngine, RelayConfig};
pub use dns::{DnsConfig, HickoryRelayResolver, MailExchange, RelayResolver};
pub use error::{DeliveryError, PermanentError, SystemError, TemporaryError};
pub use queue::{
    CompletionOutcome, MemoryQueueStore, NullQueueStore, QueueStatistics, QueueStore,
    RejectedRecipient, RelayMessage, RelayQueue, RelayStatus,
};
pub use route::{Router, SmartHost, Target};
