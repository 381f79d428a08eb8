use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;

use crate::{events::SessionInfo, message::Message, status::Status};

/// What an inspector wants done with a freshly received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inspection {
    /// Keep going; the inspector may have attached trace headers.
    Accept,
    /// Temporarily refuse (451), e.g. greylisting a first-seen tuple.
    Defer(String),
    /// Permanently refuse with the given status and reason.
    Reject { status: Status, reason: String },
}

/// Content inspection hook invoked between end-of-data and storage. The
/// antispam service implements this.
#[async_trait]
pub trait Inspector: Send + Sync + Debug {
    async fn inspect(&self, session: &SessionInfo, message: &mut Message) -> Inspection;
}

/// Onward submission hook for recipients that are not local: the relay
/// engine implements this by enqueueing the message.
#[async_trait]
pub trait Relayer: Send + Sync + Debug {
    /// Returns false when the message could not be queued; the session maps
    /// that to a transient 451.
    async fn submit(&self, session: &SessionInfo, message: Arc<Message>) -> bool;
}
