//! Delivery Status Notification generation (RFC 3464).
//!
//! When a relay entry fails terminally and bounces are enabled, the sender
//! gets a multipart/report DSN carrying the rejecting host's last reply and
//! the failed recipients. Never generated for the null reverse-path, which
//! is what stops bounce loops.

use std::{fmt::Write as _, sync::Arc, time::SystemTime};

use mailforge_common::{
    address::Address,
    envelope::Envelope,
    message::{Message, Priority},
};
use serde::Deserialize;

use crate::queue::{RejectedRecipient, RelayMessage};

#[derive(Debug, Clone, Deserialize)]
pub struct BounceConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Reverse-path of generated bounces (also the Reporting-MTA identity).
    #[serde(default = "default_sender")]
    pub sender: String,
    #[serde(default = "default_reporting_mta")]
    pub reporting_mta: String,
}

fn default_sender() -> String {
    "MAILER-DAEMON@localhost".to_string()
}

fn default_reporting_mta() -> String {
    "localhost".to_string()
}

impl Default for BounceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sender: default_sender(),
            reporting_mta: default_reporting_mta(),
        }
    }
}

/// Whether a bounce should be generated for this entry at all.
#[must_use]
pub fn should_bounce(config: &BounceConfig, entry: &RelayMessage) -> bool {
    if !config.enabled {
        return false;
    }

    // The null reverse-path never bounces
    entry.message.envelope().sender().is_some()
}

/// Build the DSN message. Returns `None` when the original has no sender to
/// return it to, or the bounce sender itself does not parse.
#[must_use]
pub fn generate_bounce(
    config: &BounceConfig,
    entry: &RelayMessage,
    last_error: &str,
) -> Option<Message> {
    let original_sender = entry.message.envelope().sender()?;
    // Sanity-check the configured sender; it only appears in the From
    // header. The envelope reverse-path of a DSN is null (RFC 3464), which
    // is also what breaks bounce loops.
    Address::parse(&config.sender)?;

    let failed: Vec<&RejectedRecipient> = entry.rejected_recipients.iter().collect();
    let failed_list = if failed.is_empty() {
        entry.pending_recipients.join(", ")
    } else {
        failed
            .iter()
            .map(|r| r.recipient.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };

    let human_readable = format!(
        "This is the mail system at host {mta}.\n\
        \n\
        I'm sorry to have to inform you that your message could not\n\
        be delivered to one or more recipients.\n\
        \n\
        {failed_list}: {last_error}\n\
        \n\
        Delivery attempts: {attempts}\n\
        Destination domain: {domain}\n",
        mta = config.reporting_mta,
        attempts = entry.attempts,
        domain = entry.domain,
    );

    let machine_readable = machine_readable_part(config, entry, last_error);
    let original_headers = extract_original_headers(entry.message.raw());

    let boundary = format!("----=_Bounce_{}", entry.queue_id);
    let date = chrono::DateTime::<chrono::Utc>::from(SystemTime::now()).to_rfc2822();

    let body = format!(
        "From: Mail Delivery System <{sender}>\r\n\
        To: {original_sender}\r\n\
        Subject: Delivery Status Notification (Failure)\r\n\
        Date: {date}\r\n\
        Auto-Submitted: auto-replied\r\n\
        MIME-Version: 1.0\r\n\
        Content-Type: multipart/report; report-type=\"delivery-status\"; boundary=\"{boundary}\"\r\n\
        \r\n\
        This is a multi-part message in MIME format.\r\n\
        \r\n\
        --{boundary}\r\n\
        Content-Type: text/plain; charset=utf-8\r\n\
        \r\n\
        {human_readable}\r\n\
        --{boundary}\r\n\
        Content-Type: message/delivery-status\r\n\
        \r\n\
        {machine_readable}\r\n\
        --{boundary}\r\n\
        Content-Type: text/rfc822-headers\r\n\
        \r\n\
        {original_headers}\r\n\
        --{boundary}--\r\n",
        sender = config.sender,
    );

    let mut envelope = Envelope::default();
    envelope.open(None);
    envelope
        .recipients_mut()
        .push(original_sender.clone());

    let mut bounce = Message::new(envelope, Arc::from(body.into_bytes().into_boxed_slice()));
    bounce.set_priority(Priority::Low);
    Some(bounce)
}

fn machine_readable_part(
    config: &BounceConfig,
    entry: &RelayMessage,
    last_error: &str,
) -> String {
    let mut dsn = format!("Reporting-MTA: dns; {}\r\n", config.reporting_mta);

    if let Ok(duration) = entry.created_at.duration_since(SystemTime::UNIX_EPOCH) {
        let arrival = chrono::DateTime::<chrono::Utc>::from_timestamp(
            i64::try_from(duration.as_secs()).unwrap_or(0),
            duration.subsec_nanos(),
        )
        .map_or_else(|| "unknown".to_string(), |dt| dt.to_rfc2822());
        let _ = write!(dsn, "Arrival-Date: {arrival}\r\n");
    }

    let report = |dsn: &mut String, recipient: &str, status: &str, diagnostic: &str| {
        dsn.push_str("\r\n");
        let _ = write!(dsn, "Final-Recipient: rfc822; {recipient}\r\n");
        let _ = write!(dsn, "Action: failed\r\n");
        let _ = write!(dsn, "Status: {status}\r\n");
        let _ = write!(dsn, "Diagnostic-Code: smtp; {diagnostic}\r\n");
        if let Some(host) = &entry.smart_host {
            let _ = write!(dsn, "Remote-MTA: dns; {host}\r\n");
        }
    };

    if entry.rejected_recipients.is_empty() {
        for recipient in &entry.pending_recipients {
            report(&mut dsn, recipient, "4.0.0", last_error);
        }
    } else {
        for rejected in &entry.rejected_recipients {
            let status = if rejected.permanent { "5.0.0" } else { "4.0.0" };
            report(&mut dsn, &rejected.recipient, status, &rejected.reason);
        }
    }

    dsn
}

/// The original headers for part three, capped so a large body never rides
/// along.
fn extract_original_headers(raw: &[u8]) -> String {
    let header_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .unwrap_or_else(|| raw.len().min(1024));

    String::from_utf8_lossy(&raw[..header_end]).to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mailforge_common::{
        address::Address,
        envelope::Envelope,
        message::{Message, Priority},
    };

    use super::{BounceConfig, generate_bounce, should_bounce};
    use crate::queue::{RejectedRecipient, RelayMessage};

    fn entry(sender: Option<&str>) -> RelayMessage {
        let mut envelope = Envelope::default();
        envelope.open(sender.and_then(Address::parse));
        envelope
            .recipients_mut()
            .push(Address::parse("rcpt@example.com").unwrap());

        let message = Arc::new(Message::new(
            envelope,
            Arc::from(b"Subject: original\r\nFrom: x\r\n\r\nbody\r\n".as_slice()),
        ));

        let mut entry = RelayMessage::new(
            message,
            "example.com".to_string(),
            vec!["rcpt@example.com".to_string()],
            Priority::Normal,
        );
        entry.attempts = 3;
        entry.rejected_recipients.push(RejectedRecipient {
            recipient: "rcpt@example.com".to_string(),
            reason: "550 5.1.1 no such user".to_string(),
            permanent: true,
        });
        entry
    }

    fn enabled_config() -> BounceConfig {
        BounceConfig {
            enabled: true,
            sender: "MAILER-DAEMON@mail.example".to_string(),
            reporting_mta: "mail.example".to_string(),
        }
    }

    #[test]
    fn null_sender_never_bounces() {
        assert!(!should_bounce(&enabled_config(), &entry(None)));
        assert!(should_bounce(
            &enabled_config(),
            &entry(Some("sender@origin.example"))
        ));
    }

    #[test]
    fn disabled_config_never_bounces() {
        let config = BounceConfig::default();
        assert!(!should_bounce(&config, &entry(Some("sender@origin.example"))));
    }

    #[test]
    fn bounce_addresses_the_original_sender_at_low_priority() {
        let bounce = generate_bounce(
            &enabled_config(),
            &entry(Some("sender@origin.example")),
            "550 5.1.1 no such user",
        )
        .unwrap();

        assert_eq!(bounce.priority(), Priority::Low);
        // Null reverse-path so the bounce itself can never bounce
        assert!(bounce.envelope().sender().is_none());
        assert!(bounce.envelope().has_sender());
        assert_eq!(
            bounce.envelope().recipients()[0].email(),
            Some("sender@origin.example")
        );

        let body = String::from_utf8_lossy(bounce.raw()).to_string();
        assert!(body.contains("multipart/report"));
        assert!(body.contains("Reporting-MTA: dns; mail.example"));
        assert!(body.contains("Final-Recipient: rfc822; rcpt@example.com"));
        assert!(body.contains("Status: 5.0.0"));
        assert!(body.contains("550 5.1.1 no such user"));
        assert!(body.contains("Subject: original"));
    }
}
