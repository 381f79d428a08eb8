//! Message persistence for received mail.
//!
//! The store is the sole durability boundary on the receive path: it is
//! invoked exactly once per successful DATA, before the 250 reply. A failed
//! save maps to `451` at the session boundary so the client may retry.

mod file;
mod memory;
mod mock;

use std::fmt::Debug;

use async_trait::async_trait;
use mailforge_common::{events::SessionInfo, message::Message};
use thiserror::Error;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use mock::MockStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is at capacity: {0}")]
    CapacityExceeded(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Single write contract for received mail.
///
/// Implementations are free to persist, forward or compress; they may also
/// deduplicate by message id. Cancellation is cooperative: callers wrap
/// `save` in a timeout and treat expiry as a transient failure.
#[async_trait]
pub trait MessageStore: Send + Sync + Debug {
    async fn save(&self, session: &SessionInfo, message: &Message) -> Result<()>;
}
