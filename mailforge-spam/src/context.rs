use std::{net::IpAddr, sync::Arc};

use mailforge_common::{address::Address, events::SessionInfo, message::Message};

/// Everything a checker may look at, snapshotted from the session and the
/// message. Checkers never see (or mutate) the live message.
#[derive(Debug, Clone)]
pub struct SpamCheckContext {
    pub message_id: ulid::Ulid,
    pub client_ip: IpAddr,
    pub helo: Option<String>,
    pub authenticated: bool,
    pub sender: Option<String>,
    pub sender_domain: Option<String>,
    pub recipients: Vec<String>,
    pub subject: Option<String>,
    pub body_text: Option<String>,
    /// The raw message for header-level checks (DKIM, DMARC).
    pub raw: Arc<[u8]>,
}

impl SpamCheckContext {
    #[must_use]
    pub fn build(session: &SessionInfo, message: &Message) -> Self {
        let envelope = message.envelope();
        let sender = envelope
            .sender()
            .and_then(|s| s.email().map(str::to_string));
        let sender_domain = envelope.sender().and_then(Address::domain);
        let recipients = envelope
            .recipients()
            .iter()
            .filter_map(|r| r.email().map(str::to_string))
            .collect();

        Self {
            message_id: message.id(),
            client_ip: session.peer.ip(),
            helo: session.helo.clone(),
            authenticated: session.authenticated.is_some(),
            sender,
            sender_domain,
            recipients,
            subject: message.subject().map(str::to_string),
            body_text: message.text_body().map(str::to_string),
            raw: message.raw_arc(),
        }
    }

    /// Minimal context for checker unit tests.
    #[must_use]
    pub fn for_tests(sender: &str, client_ip: &str, body: &str) -> Self {
        let raw = format!("Subject: test\r\n\r\n{body}\r\n");
        Self {
            message_id: ulid::Ulid::new(),
            client_ip: client_ip.parse().unwrap_or(IpAddr::from([127, 0, 0, 1])),
            helo: Some("client.test".to_string()),
            authenticated: false,
            sender: Some(sender.to_string()),
            sender_domain: sender.rsplit_once('@').map(|(_, d)| d.to_string()),
            recipients: vec!["rcpt@example.com".to_string()],
            subject: Some("test".to_string()),
            body_text: Some(body.to_string()),
            raw: Arc::from(raw.into_bytes().into_boxed_slice()),
        }
    }
}
