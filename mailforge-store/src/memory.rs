use std::sync::RwLock;

use async_trait::async_trait;
use mailforge_common::{events::SessionInfo, message::Message};

use crate::{MessageStore, Result, StoreError};

/// In-memory message store.
///
/// Primarily intended for testing and transient handling. Can be bounded to
/// guard against unbounded memory growth; at capacity, writes fail and the
/// session replies 451.
#[derive(Debug, Default)]
pub struct MemoryStore {
    messages: RwLock<Vec<Message>>,
    capacity: Option<usize>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            messages: RwLock::new(Vec::new()),
            capacity: Some(capacity),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all stored messages, in arrival order.
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.messages
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn save(&self, _session: &SessionInfo, message: &Message) -> Result<()> {
        let mut messages = self
            .messages
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if let Some(cap) = self.capacity
            && messages.len() >= cap
        {
            return Err(StoreError::CapacityExceeded(format!(
                "{}/{cap} messages",
                messages.len()
            )));
        }

        messages.push(message.clone());
        Ok(())
    }
}
