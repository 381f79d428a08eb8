use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mailforge_common::{events::SessionInfo, message::Message};
use tokio::sync::Notify;

use crate::{MessageStore, Result, StoreError};

/// Mock store for tests: records every save, can be told to fail, and lets
/// tests await a given message count instead of sleeping.
#[derive(Debug, Clone, Default)]
pub struct MockStore {
    messages: Arc<Mutex<Vec<Message>>>,
    fail: Arc<Mutex<bool>>,
    notify: Arc<Notify>,
}

impl MockStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent saves fail with a transient error.
    pub fn set_failing(&self, failing: bool) {
        *self.fail.lock().expect("MockStore fail mutex poisoned") = failing;
    }

    /// # Panics
    /// Panics if the mutex is poisoned
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages
            .lock()
            .expect("MockStore messages mutex poisoned")
            .len()
    }

    /// # Panics
    /// Panics if the mutex is poisoned
    #[must_use]
    pub fn get_message(&self, index: usize) -> Option<Message> {
        self.messages
            .lock()
            .expect("MockStore messages mutex poisoned")
            .get(index)
            .cloned()
    }

    /// Wait for a specific number of messages to be stored, with timeout.
    ///
    /// # Errors
    /// Returns an error if the timeout is reached before the expected count
    pub async fn wait_for_count(
        &self,
        expected: usize,
        timeout: std::time::Duration,
    ) -> std::result::Result<(), tokio::time::error::Elapsed> {
        tokio::time::timeout(timeout, async {
            loop {
                if self.message_count() >= expected {
                    return;
                }
                self.notify.notified().await;
            }
        })
        .await
    }
}

#[async_trait]
impl MessageStore for MockStore {
    async fn save(&self, _session: &SessionInfo, message: &Message) -> Result<()> {
        if *self.fail.lock().expect("MockStore fail mutex poisoned") {
            return Err(StoreError::Unavailable("mock store failing".to_string()));
        }

        self.messages
            .lock()
            .expect("MockStore messages mutex poisoned")
            .push(message.clone());
        self.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mailforge_common::{envelope::Envelope, events::SessionInfo, message::Message};

    use super::*;

    fn session() -> SessionInfo {
        SessionInfo {
            id: ulid::Ulid::new(),
            peer: "127.0.0.1:2525".parse().unwrap(),
            started_at: std::time::SystemTime::now(),
            helo: None,
            tls: false,
            authenticated: None,
        }
    }

    #[tokio::test]
    async fn records_and_notifies() {
        let store = MockStore::new();
        let message = Message::new(Envelope::default(), Arc::from(b"data".as_slice()));

        store.save(&session(), &message).await.unwrap();

        store
            .wait_for_count(1, std::time::Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(store.message_count(), 1);
        assert_eq!(store.get_message(0).unwrap().raw(), b"data");
    }

    #[tokio::test]
    async fn failing_mode_returns_unavailable() {
        let store = MockStore::new();
        store.set_failing(true);

        let message = Message::new(Envelope::default(), Arc::from(b"data".as_slice()));
        let err = store.save(&session(), &message).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(store.message_count(), 0);
    }
}
