//! The relay queue: a durable, in-memory-indexed priority queue of
//! outbound messages.
//!
//! Entries dequeue by (priority descending, created-at ascending) among
//! those whose next-attempt time has passed; `dequeue_ready` atomically
//! marks entries in progress under the queue lock, so two workers can never
//! claim the same entry. Status changes follow the delivery DAG and
//! anything else is refused.

use std::{
    collections::HashMap,
    fmt::Debug,
    sync::Arc,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use mailforge_common::message::{Message, Priority};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::SystemError;

/// Lifecycle of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelayStatus {
    Queued,
    InProgress,
    Delivered,
    Failed,
    Deferred,
    Expired,
    Cancelled,
    PartiallyDelivered,
}

impl RelayStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Delivered | Self::Failed | Self::Expired | Self::Cancelled | Self::PartiallyDelivered
        )
    }

    /// The delivery DAG: Queued → InProgress → {Delivered, Failed,
    /// Deferred, PartiallyDelivered}; Deferred → Queued/InProgress; any
    /// non-terminal state may expire or be cancelled.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Queued | Self::Deferred, Self::InProgress)
            | (Self::Deferred, Self::Queued)
            | (
                Self::InProgress,
                Self::Delivered | Self::Failed | Self::Deferred | Self::PartiallyDelivered,
            ) => true,
            (from, Self::Expired | Self::Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Queued => "queued",
            Self::InProgress => "in-progress",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Deferred => "deferred",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
            Self::PartiallyDelivered => "partially-delivered",
        })
    }
}

/// A recipient refused by the remote side, with its reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRecipient {
    pub recipient: String,
    pub reason: String,
    pub permanent: bool,
}

/// A message wrapped with queue metadata. One entry carries the recipients
/// of a single destination domain, which keeps routing and per-recipient
/// bookkeeping aligned.
#[derive(Debug, Clone)]
pub struct RelayMessage {
    pub queue_id: ulid::Ulid,
    pub message: Arc<Message>,
    /// Destination domain this entry routes to.
    pub domain: String,
    /// Recipients still awaiting delivery.
    pub pending_recipients: Vec<String>,
    pub priority: Priority,
    pub status: RelayStatus,
    pub attempts: u32,
    pub created_at: SystemTime,
    pub next_attempt: SystemTime,
    pub last_error: Option<String>,
    pub accepted_recipients: Vec<String>,
    pub rejected_recipients: Vec<RejectedRecipient>,
    /// The smart host chosen for the last attempt, if routing used one.
    pub smart_host: Option<String>,
}

impl RelayMessage {
    #[must_use]
    pub fn new(
        message: Arc<Message>,
        domain: String,
        pending_recipients: Vec<String>,
        priority: Priority,
    ) -> Self {
        let now = SystemTime::now();
        Self {
            queue_id: ulid::Ulid::new(),
            message,
            domain,
            pending_recipients,
            priority,
            status: RelayStatus::Queued,
            attempts: 0,
            created_at: now,
            next_attempt: now,
            last_error: None,
            accepted_recipients: Vec::new(),
            rejected_recipients: Vec::new(),
            smart_host: None,
        }
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed().unwrap_or_default()
    }

    #[must_use]
    pub fn is_expired(&self, lifetime: Duration) -> bool {
        self.age() > lifetime
    }
}

/// How an attempt ended; drives the status transition in `complete`.
#[derive(Debug, Clone)]
pub enum CompletionOutcome {
    Delivered {
        accepted: Vec<String>,
    },
    PartiallyDelivered {
        accepted: Vec<String>,
        rejected: Vec<RejectedRecipient>,
    },
    Failed {
        error: String,
        rejected: Vec<RejectedRecipient>,
    },
    Deferred {
        error: String,
        next_attempt: SystemTime,
    },
}

/// Counters reported by [`RelayQueue::statistics`].
#[derive(Debug, Clone, Default)]
pub struct QueueStatistics {
    pub total: usize,
    pub by_status: HashMap<RelayStatus, usize>,
    pub by_priority: HashMap<Priority, usize>,
    pub oldest_age: Option<Duration>,
    pub total_bytes: usize,
    pub average_attempts: f64,
}

/// Persistence hook: every mutation is reported so a backend can mirror the
/// queue in whatever on-disk format it likes.
#[async_trait]
pub trait QueueStore: Send + Sync + Debug {
    async fn persist(&self, entry: &RelayMessage);
    async fn remove(&self, queue_id: ulid::Ulid);
}

/// A store that keeps nothing.
#[derive(Debug, Default)]
pub struct NullQueueStore;

#[async_trait]
impl QueueStore for NullQueueStore {
    async fn persist(&self, _entry: &RelayMessage) {}
    async fn remove(&self, _queue_id: ulid::Ulid) {}
}

/// In-memory mirror, mostly for tests and introspection.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    entries: Mutex<HashMap<ulid::Ulid, RelayMessage>>,
}

impl MemoryQueueStore {
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn persist(&self, entry: &RelayMessage) {
        self.entries.lock().insert(entry.queue_id, entry.clone());
    }

    async fn remove(&self, queue_id: ulid::Ulid) {
        self.entries.lock().remove(&queue_id);
    }
}

/// The queue proper. One exclusive lock guards all status transitions;
/// reads hand out snapshots. Nothing blocking happens under the lock.
#[derive(Debug)]
pub struct RelayQueue {
    entries: Mutex<HashMap<ulid::Ulid, RelayMessage>>,
    store: Arc<dyn QueueStore>,
    notify: tokio::sync::Notify,
}

impl Default for RelayQueue {
    fn default() -> Self {
        Self::new(Arc::new(NullQueueStore))
    }
}

impl RelayQueue {
    #[must_use]
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            store,
            notify: tokio::sync::Notify::new(),
        }
    }

    /// Wake one delivery worker when work arrives.
    pub async fn wait_for_work(&self) {
        self.notify.notified().await;
    }

    /// Add an entry; assigns the queue id and stamps created-at.
    pub async fn enqueue(
        &self,
        message: Arc<Message>,
        domain: String,
        recipients: Vec<String>,
        priority: Priority,
    ) -> ulid::Ulid {
        let entry = RelayMessage::new(message, domain, recipients, priority);
        let queue_id = entry.queue_id;

        self.store.persist(&entry).await;
        self.entries.lock().insert(queue_id, entry);
        self.notify.notify_one();

        tracing::debug!(%queue_id, "message enqueued for relay");
        queue_id
    }

    /// Claim up to `n` ready entries, ordered by (priority descending,
    /// created-at ascending), marking each `InProgress` and bumping its
    /// attempt counter before the lock is released.
    pub fn dequeue_ready(&self, n: usize) -> Vec<RelayMessage> {
        let now = SystemTime::now();
        let mut entries = self.entries.lock();

        let mut ready: Vec<ulid::Ulid> = entries
            .values()
            .filter(|e| {
                matches!(e.status, RelayStatus::Queued | RelayStatus::Deferred)
                    && e.next_attempt <= now
            })
            .map(|e| e.queue_id)
            .collect();

        ready.sort_by(|a, b| {
            let ea = &entries[a];
            let eb = &entries[b];
            eb.priority
                .cmp(&ea.priority)
                .then(ea.created_at.cmp(&eb.created_at))
                .then(a.cmp(b))
        });

        ready
            .into_iter()
            .take(n)
            .filter_map(|id| {
                let entry = entries.get_mut(&id)?;
                entry.status = RelayStatus::InProgress;
                entry.attempts += 1;
                Some(entry.clone())
            })
            .collect()
    }

    /// Apply the outcome of a delivery attempt.
    pub async fn complete(
        &self,
        queue_id: ulid::Ulid,
        outcome: CompletionOutcome,
    ) -> Result<RelayMessage, SystemError> {
        let updated = {
            let mut entries = self.entries.lock();
            let entry = entries
                .get_mut(&queue_id)
                .ok_or_else(|| SystemError::EntryNotFound(queue_id.to_string()))?;

            let next_status = match &outcome {
                CompletionOutcome::Delivered { .. } => RelayStatus::Delivered,
                CompletionOutcome::PartiallyDelivered { .. } => RelayStatus::PartiallyDelivered,
                CompletionOutcome::Failed { .. } => RelayStatus::Failed,
                CompletionOutcome::Deferred { .. } => RelayStatus::Deferred,
            };

            if !entry.status.can_transition_to(next_status) {
                return Err(SystemError::InvalidTransition(format!(
                    "{} -> {next_status} for {queue_id}",
                    entry.status
                )));
            }

            match outcome {
                CompletionOutcome::Delivered { accepted } => {
                    entry.accepted_recipients.extend(accepted);
                    entry.pending_recipients.clear();
                    entry.last_error = None;
                }
                CompletionOutcome::PartiallyDelivered { accepted, rejected } => {
                    entry.accepted_recipients.extend(accepted);
                    entry.rejected_recipients.extend(rejected);
                    entry.pending_recipients.clear();
                }
                CompletionOutcome::Failed { error, rejected } => {
                    entry.rejected_recipients.extend(rejected);
                    entry.last_error = Some(error);
                }
                CompletionOutcome::Deferred {
                    error,
                    next_attempt,
                } => {
                    entry.last_error = Some(error);
                    entry.next_attempt = next_attempt;
                }
            }

            entry.status = next_status;
            entry.clone()
        };

        self.store.persist(&updated).await;

        if updated.status == RelayStatus::Deferred {
            // A deferred entry becomes dequeuable again once its retry time
            // passes; poke the workers so their idle timers re-evaluate.
            self.notify.notify_one();
        }

        Ok(updated)
    }

    /// Record the smart host used for an in-flight attempt.
    pub fn record_smart_host(&self, queue_id: ulid::Ulid, smart_host: String) {
        if let Some(entry) = self.entries.lock().get_mut(&queue_id) {
            entry.smart_host = Some(smart_host);
        }
    }

    /// Cancel a pending entry.
    pub async fn cancel(&self, queue_id: ulid::Ulid) -> Result<(), SystemError> {
        let updated = {
            let mut entries = self.entries.lock();
            let entry = entries
                .get_mut(&queue_id)
                .ok_or_else(|| SystemError::EntryNotFound(queue_id.to_string()))?;

            if !entry.status.can_transition_to(RelayStatus::Cancelled) {
                return Err(SystemError::InvalidTransition(format!(
                    "{} -> cancelled for {queue_id}",
                    entry.status
                )));
            }

            entry.status = RelayStatus::Cancelled;
            entry.clone()
        };

        self.store.persist(&updated).await;
        Ok(())
    }

    /// Expire a single entry, e.g. when a worker claims it past its
    /// lifetime.
    pub async fn expire(&self, queue_id: ulid::Ulid) -> Result<RelayMessage, SystemError> {
        let updated = {
            let mut entries = self.entries.lock();
            let entry = entries
                .get_mut(&queue_id)
                .ok_or_else(|| SystemError::EntryNotFound(queue_id.to_string()))?;

            if !entry.status.can_transition_to(RelayStatus::Expired) {
                return Err(SystemError::InvalidTransition(format!(
                    "{} -> expired for {queue_id}",
                    entry.status
                )));
            }

            entry.status = RelayStatus::Expired;
            entry.clone()
        };

        self.store.persist(&updated).await;
        Ok(updated)
    }

    /// Expire entries older than `lifetime`. Returns the expired entries.
    pub async fn clear_expired(&self, lifetime: Duration) -> Vec<RelayMessage> {
        let expired: Vec<RelayMessage> = {
            let mut entries = self.entries.lock();
            entries
                .values_mut()
                .filter(|e| !e.status.is_terminal() && e.is_expired(lifetime))
                .map(|e| {
                    e.status = RelayStatus::Expired;
                    e.clone()
                })
                .collect()
        };

        for entry in &expired {
            self.store.persist(entry).await;
        }

        expired
    }

    /// Drop terminal entries from the index (and the store).
    pub async fn prune_terminal(&self) -> usize {
        let removed: Vec<ulid::Ulid> = {
            let mut entries = self.entries.lock();
            let ids: Vec<ulid::Ulid> = entries
                .values()
                .filter(|e| e.status.is_terminal())
                .map(|e| e.queue_id)
                .collect();
            for id in &ids {
                entries.remove(id);
            }
            ids
        };

        for id in &removed {
            self.store.remove(*id).await;
        }

        removed.len()
    }

    #[must_use]
    pub fn get(&self, queue_id: ulid::Ulid) -> Option<RelayMessage> {
        self.entries.lock().get(&queue_id).cloned()
    }

    #[must_use]
    pub fn get_all(&self) -> Vec<RelayMessage> {
        self.entries.lock().values().cloned().collect()
    }

    #[must_use]
    pub fn get_by_status(&self, status: RelayStatus) -> Vec<RelayMessage> {
        self.entries
            .lock()
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn statistics(&self) -> QueueStatistics {
        let entries = self.entries.lock();

        let mut stats = QueueStatistics {
            total: entries.len(),
            ..QueueStatistics::default()
        };

        let mut attempts_sum = 0_u64;
        for entry in entries.values() {
            *stats.by_status.entry(entry.status).or_insert(0) += 1;
            *stats.by_priority.entry(entry.priority).or_insert(0) += 1;
            stats.total_bytes += entry.message.size();
            attempts_sum += u64::from(entry.attempts);

            if !entry.status.is_terminal() {
                let age = entry.age();
                if stats.oldest_age.is_none_or(|oldest| age > oldest) {
                    stats.oldest_age = Some(age);
                }
            }
        }

        if !entries.is_empty() {
            stats.average_attempts = attempts_sum as f64 / entries.len() as f64;
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use mailforge_common::{envelope::Envelope, message::Message, message::Priority};

    use super::{
        CompletionOutcome, MemoryQueueStore, RejectedRecipient, RelayQueue, RelayStatus,
    };

    fn message() -> Arc<Message> {
        Arc::new(Message::new(
            Envelope::default(),
            Arc::from(b"Subject: t\r\n\r\nbody\r\n".as_slice()),
        ))
    }

    async fn enqueue(queue: &RelayQueue, priority: Priority) -> ulid::Ulid {
        queue
            .enqueue(
                message(),
                "example.com".to_string(),
                vec!["u@example.com".to_string()],
                priority,
            )
            .await
    }

    #[tokio::test]
    async fn dequeue_orders_by_priority_then_fifo() {
        let queue = RelayQueue::default();

        let low = enqueue(&queue, Priority::Low).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let normal_first = enqueue(&queue, Priority::Normal).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let normal_second = enqueue(&queue, Priority::Normal).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let urgent = enqueue(&queue, Priority::Urgent).await;

        let ready = queue.dequeue_ready(10);
        let order: Vec<ulid::Ulid> = ready.iter().map(|e| e.queue_id).collect();

        assert_eq!(order, vec![urgent, normal_first, normal_second, low]);
    }

    #[tokio::test]
    async fn dequeue_marks_in_progress_and_counts_the_attempt() {
        let queue = RelayQueue::default();
        let id = enqueue(&queue, Priority::Normal).await;

        let claimed = queue.dequeue_ready(1);
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, RelayStatus::InProgress);
        assert_eq!(claimed[0].attempts, 1);

        // Claimed entries are not eligible again
        assert!(queue.dequeue_ready(1).is_empty());

        let entry = queue.get(id).unwrap();
        assert_eq!(entry.status, RelayStatus::InProgress);
    }

    #[tokio::test]
    async fn deferred_entries_wait_for_their_retry_time() {
        let queue = RelayQueue::default();
        let id = enqueue(&queue, Priority::Normal).await;

        queue.dequeue_ready(1);
        queue
            .complete(
                id,
                CompletionOutcome::Deferred {
                    error: "451 busy".to_string(),
                    next_attempt: std::time::SystemTime::now() + Duration::from_secs(3600),
                },
            )
            .await
            .unwrap();

        assert!(queue.dequeue_ready(1).is_empty());

        // An entry whose retry time has already passed is eligible
        queue
            .complete(id, CompletionOutcome::Delivered { accepted: vec![] })
            .await
            .unwrap_err(); // Deferred -> Delivered is not a legal edge

        let entry = queue.get(id).unwrap();
        assert_eq!(entry.status, RelayStatus::Deferred);
    }

    #[tokio::test]
    async fn completion_transitions_follow_the_dag() {
        let queue = RelayQueue::default();
        let id = enqueue(&queue, Priority::Normal).await;

        // Queued -> Delivered without InProgress is refused
        assert!(
            queue
                .complete(id, CompletionOutcome::Delivered { accepted: vec![] })
                .await
                .is_err()
        );

        queue.dequeue_ready(1);
        let delivered = queue
            .complete(
                id,
                CompletionOutcome::Delivered {
                    accepted: vec!["u@example.com".to_string()],
                },
            )
            .await
            .unwrap();

        assert_eq!(delivered.status, RelayStatus::Delivered);
        assert_eq!(delivered.accepted_recipients, vec!["u@example.com"]);
        assert!(delivered.pending_recipients.is_empty());

        // Terminal entries refuse further transitions
        assert!(
            queue
                .complete(
                    id,
                    CompletionOutcome::Failed {
                        error: "nope".to_string(),
                        rejected: vec![],
                    }
                )
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn partial_delivery_keeps_rejected_recipients() {
        let queue = RelayQueue::default();
        let id = queue
            .enqueue(
                message(),
                "example.com".to_string(),
                vec!["a@example.com".to_string(), "b@example.com".to_string()],
                Priority::Normal,
            )
            .await;

        queue.dequeue_ready(1);
        let updated = queue
            .complete(
                id,
                CompletionOutcome::PartiallyDelivered {
                    accepted: vec!["a@example.com".to_string()],
                    rejected: vec![RejectedRecipient {
                        recipient: "b@example.com".to_string(),
                        reason: "550 no such user".to_string(),
                        permanent: true,
                    }],
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.status, RelayStatus::PartiallyDelivered);
        assert!(updated.status.is_terminal());
        assert_eq!(updated.rejected_recipients.len(), 1);
    }

    #[tokio::test]
    async fn clear_expired_marks_old_entries() {
        let queue = RelayQueue::default();
        let id = enqueue(&queue, Priority::Normal).await;

        // Nothing expires within a generous lifetime
        assert!(queue.clear_expired(Duration::from_secs(3600)).await.is_empty());

        let expired = queue.clear_expired(Duration::ZERO).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(queue.get(id).unwrap().status, RelayStatus::Expired);
    }

    #[tokio::test]
    async fn statistics_track_status_priority_and_age() {
        let queue = RelayQueue::default();
        enqueue(&queue, Priority::Normal).await;
        enqueue(&queue, Priority::Urgent).await;
        let failed = enqueue(&queue, Priority::Low).await;

        queue.dequeue_ready(3);
        queue
            .complete(
                failed,
                CompletionOutcome::Failed {
                    error: "550 rejected".to_string(),
                    rejected: vec![],
                },
            )
            .await
            .unwrap();

        let stats = queue.statistics();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_status[&RelayStatus::InProgress], 2);
        assert_eq!(stats.by_status[&RelayStatus::Failed], 1);
        assert_eq!(stats.by_priority[&Priority::Urgent], 1);
        assert!(stats.oldest_age.is_some());
        assert!(stats.total_bytes > 0);
        assert!(stats.average_attempts > 0.0);
    }

    #[tokio::test]
    async fn store_mirrors_queue_mutations() {
        let store = Arc::new(MemoryQueueStore::default());
        let queue = RelayQueue::new(store.clone());

        let id = enqueue(&queue, Priority::Normal).await;
        assert_eq!(store.len(), 1);

        queue.dequeue_ready(1);
        queue
            .complete(id, CompletionOutcome::Delivered { accepted: vec![] })
            .await
            .unwrap();

        assert_eq!(queue.prune_terminal().await, 1);
        assert!(store.is_empty());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn cancel_refuses_terminal_entries() {
        let queue = RelayQueue::default();
        let id = enqueue(&queue, Priority::Normal).await;

        queue.dequeue_ready(1);
        queue
            .complete(id, CompletionOutcome::Delivered { accepted: vec![] })
            .await
            .unwrap();

        assert!(queue.cancel(id).await.is_err());
    }
}
