use std::{
    net::SocketAddr,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
    time::SystemTime,
};

use parking_lot::RwLock;

use crate::{message::Message, status::Status};

/// A read-only snapshot of session state handed to event listeners and spam
/// checkers. Listeners never see (or mutate) the live session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: ulid::Ulid,
    pub peer: SocketAddr,
    pub started_at: SystemTime,
    pub helo: Option<String>,
    pub tls: bool,
    pub authenticated: Option<String>,
}

/// Events published by the engine.
#[derive(Debug, Clone)]
pub enum Event {
    SessionCreated {
        session: SessionInfo,
    },
    SessionCompleted {
        session: SessionInfo,
    },
    /// Fired after DATA completes and before the store is invoked. A
    /// cancelling listener suppresses storage and substitutes the reply.
    MessageReceived {
        session: SessionInfo,
        message: Arc<Message>,
    },
    MessageRejected {
        session: SessionInfo,
        reason: String,
    },
    ErrorOccurred {
        session: Option<SessionInfo>,
        error: String,
    },
    AuthSucceeded {
        session: SessionInfo,
        identity: String,
    },
    AuthFailed {
        session: SessionInfo,
        mechanism: String,
    },
    DeliveryAttempted {
        queue_id: ulid::Ulid,
        target: String,
        attempt: u32,
        success: bool,
        error: Option<String>,
    },
}

/// What a listener wants the engine to do with the event. Folded in
/// registration order; the first `Cancel` wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    /// Suppress the default handling and reply with the given status and
    /// text instead. Only meaningful for `MessageReceived`.
    Cancel(Status, String),
}

impl Verdict {
    /// The conventional rejection used when a listener cancels without
    /// giving a specific reply.
    #[must_use]
    pub fn reject() -> Self {
        Self::Cancel(Status::MailboxUnavailable, "Message rejected".to_string())
    }
}

pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Event) -> Verdict;
}

impl<F> EventListener for F
where
    F: Fn(&Event) -> Verdict + Send + Sync,
{
    fn on_event(&self, event: &Event) -> Verdict {
        self(event)
    }
}

/// Multi-listener publication. Delivery is best-effort: a panicking listener
/// is isolated and the remaining listeners still observe the event.
#[derive(Default, Clone)]
pub struct EventBus {
    listeners: Arc<RwLock<Vec<Arc<dyn EventListener>>>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().push(listener);
    }

    /// Publish an event to every listener, folding their verdicts in
    /// registration order. The first `Cancel` is returned; later listeners
    /// still observe the event.
    pub fn publish(&self, event: &Event) -> Verdict {
        let listeners = self.listeners.read().clone();
        let mut verdict = Verdict::Continue;

        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
                Ok(Verdict::Cancel(status, text)) if verdict == Verdict::Continue => {
                    verdict = Verdict::Cancel(status, text);
                }
                Ok(_) => {}
                Err(_) => {
                    tracing::error!("event listener panicked; continuing");
                }
            }
        }

        verdict
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::{Event, EventBus, SessionInfo, Verdict};
    use crate::status::Status;

    fn session_info() -> SessionInfo {
        SessionInfo {
            id: ulid::Ulid::new(),
            peer: "127.0.0.1:2525".parse().unwrap(),
            started_at: std::time::SystemTime::now(),
            helo: None,
            tls: false,
            authenticated: None,
        }
    }

    #[test]
    fn all_listeners_observe_events() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let seen = Arc::clone(&seen);
            bus.subscribe(Arc::new(move |_: &Event| {
                seen.fetch_add(1, Ordering::SeqCst);
                Verdict::Continue
            }));
        }

        let verdict = bus.publish(&Event::SessionCreated {
            session: session_info(),
        });

        assert_eq!(verdict, Verdict::Continue);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn first_cancel_wins() {
        let bus = EventBus::new();

        bus.subscribe(Arc::new(|_: &Event| {
            Verdict::Cancel(Status::MailboxUnavailable, "first".to_string())
        }));
        bus.subscribe(Arc::new(|_: &Event| {
            Verdict::Cancel(Status::TransactionFailed, "second".to_string())
        }));

        let verdict = bus.publish(&Event::SessionCreated {
            session: session_info(),
        });

        assert_eq!(
            verdict,
            Verdict::Cancel(Status::MailboxUnavailable, "first".to_string())
        );
    }

    #[test]
    fn panicking_listener_does_not_poison_the_bus() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        bus.subscribe(Arc::new(|_: &Event| -> Verdict {
            panic!("listener bug")
        }));
        {
            let seen = Arc::clone(&seen);
            bus.subscribe(Arc::new(move |_: &Event| {
                seen.fetch_add(1, Ordering::SeqCst);
                Verdict::Continue
            }));
        }

        let verdict = bus.publish(&Event::SessionCreated {
            session: session_info(),
        });

        assert_eq!(verdict, Verdict::Continue);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
