use std::{
    sync::{Arc, OnceLock},
    time::SystemTime,
};

use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;

/// Delivery priority attached to a received message and carried into the
/// relay queue. Ordering matters: higher variants dequeue first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// A single header field, name case preserved as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Order-preserving, case-insensitive header view of a message.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    headers: Vec<Header>,
}

impl HeaderMap {
    fn parse(raw: &[u8]) -> Self {
        let headers = mailparse::parse_headers(raw).map_or_else(
            |_| Vec::new(),
            |(parsed, _)| {
                parsed
                    .into_iter()
                    .map(|h| Header {
                        name: h.get_key(),
                        value: h.get_value(),
                    })
                    .collect()
            },
        );

        Self { headers }
    }

    /// First value for `name`, compared case-insensitively.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// All values for `name`, in received order.
    #[must_use]
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
            .collect()
    }

    /// Iterate all headers in received order.
    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.headers.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

#[derive(Debug, Default)]
struct ParsedBody {
    text: Option<String>,
    html: Option<String>,
    attachments: usize,
}

/// A message accepted over SMTP. Immutable after the DATA dot-terminator:
/// the raw bytes never change, headers and bodies are derived lazily, and
/// additional trace headers (e.g. the spam verdict) are kept separately and
/// only merged when the message is rendered for storage or relay.
#[derive(Debug, Clone)]
pub struct Message {
    id: ulid::Ulid,
    envelope: Envelope,
    raw: Arc<[u8]>,
    received_at: SystemTime,
    priority: Priority,
    prepended: Vec<Header>,
    headers: Arc<OnceLock<HeaderMap>>,
    body: Arc<OnceLock<ParsedBody>>,
}

impl Message {
    #[must_use]
    pub fn new(envelope: Envelope, raw: Arc<[u8]>) -> Self {
        Self {
            id: ulid::Ulid::new(),
            envelope,
            raw,
            received_at: SystemTime::now(),
            priority: Priority::default(),
            prepended: Vec::new(),
            headers: Arc::new(OnceLock::new()),
            body: Arc::new(OnceLock::new()),
        }
    }

    /// Globally unique, creation-time sortable identifier.
    #[must_use]
    pub const fn id(&self) -> ulid::Ulid {
        self.id
    }

    /// The envelope as it stood when the message completed DATA.
    #[must_use]
    pub const fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// The de-dot-stuffed message bytes as received.
    #[must_use]
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    #[must_use]
    pub fn raw_arc(&self) -> Arc<[u8]> {
        Arc::clone(&self.raw)
    }

    /// Byte count of the decoded message body (headers included).
    #[must_use]
    pub fn size(&self) -> usize {
        self.raw.len()
    }

    #[must_use]
    pub const fn received_at(&self) -> SystemTime {
        self.received_at
    }

    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    pub const fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    /// Headers parsed from the raw bytes, computed on first access.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        self.headers.get_or_init(|| HeaderMap::parse(&self.raw))
    }

    /// Trace headers prepended after acceptance (spam verdict and the like).
    #[must_use]
    pub fn prepended_headers(&self) -> &[Header] {
        &self.prepended
    }

    /// Prepend a trace header. The raw bytes are left untouched; the header
    /// is emitted ahead of them by [`Message::to_wire`].
    pub fn prepend_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.prepended.push(Header {
            name: name.into(),
            value: value.into(),
        });
    }

    /// First Subject header, if any.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.headers().get("Subject")
    }

    /// The plain-text body, if the message has one.
    #[must_use]
    pub fn text_body(&self) -> Option<&str> {
        self.parsed_body().text.as_deref()
    }

    /// The HTML body, if the message has one.
    #[must_use]
    pub fn html_body(&self) -> Option<&str> {
        self.parsed_body().html.as_deref()
    }

    /// Number of attachment parts.
    #[must_use]
    pub fn attachment_count(&self) -> usize {
        self.parsed_body().attachments
    }

    /// The full wire form: prepended trace headers followed by the original
    /// bytes.
    #[must_use]
    pub fn to_wire(&self) -> Vec<u8> {
        if self.prepended.is_empty() {
            return self.raw.to_vec();
        }

        let mut wire = Vec::with_capacity(self.raw.len() + self.prepended.len() * 64);
        for header in &self.prepended {
            wire.extend_from_slice(header.name.as_bytes());
            wire.extend_from_slice(b": ");
            wire.extend_from_slice(header.value.as_bytes());
            wire.extend_from_slice(b"\r\n");
        }
        wire.extend_from_slice(&self.raw);
        wire
    }

    fn parsed_body(&self) -> &ParsedBody {
        self.body.get_or_init(|| {
            mailparse::parse_mail(&self.raw).map_or_else(|_| ParsedBody::default(), flatten_parts)
        })
    }
}

fn flatten_parts(mail: mailparse::ParsedMail<'_>) -> ParsedBody {
    let mut parsed = ParsedBody::default();
    collect_parts(&mail, &mut parsed);
    parsed
}

fn collect_parts(part: &mailparse::ParsedMail<'_>, out: &mut ParsedBody) {
    if part.subparts.is_empty() {
        let mime = part.ctype.mimetype.to_ascii_lowercase();
        let disposition = part.get_content_disposition();

        if matches!(
            disposition.disposition,
            mailparse::DispositionType::Attachment
        ) {
            out.attachments += 1;
        } else if mime == "text/plain" || mime.is_empty() {
            if out.text.is_none() {
                out.text = part.get_body().ok();
            }
        } else if mime == "text/html" {
            if out.html.is_none() {
                out.html = part.get_body().ok();
            }
        } else if !mime.starts_with("multipart/") {
            out.attachments += 1;
        }
    } else {
        for sub in &part.subparts {
            collect_parts(sub, out);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::{Message, Priority};
    use crate::envelope::Envelope;

    const RAW: &[u8] = b"Subject: Hello\r\n\
        From: a@b.com\r\n\
        To: c@d.com\r\n\
        X-Test: one\r\n\
        X-Test: two\r\n\
        \r\n\
        Body text\r\n";

    fn message() -> Message {
        Message::new(Envelope::default(), Arc::from(RAW))
    }

    #[test]
    fn headers_are_case_insensitive_and_ordered() {
        let message = message();
        assert_eq!(message.headers().get("subject"), Some("Hello"));
        assert_eq!(message.headers().get_all("x-test"), vec!["one", "two"]);
    }

    #[test]
    fn subject_and_body() {
        let message = message();
        assert_eq!(message.subject(), Some("Hello"));
        assert_eq!(message.text_body().map(str::trim), Some("Body text"));
        assert_eq!(message.attachment_count(), 0);
    }

    #[test]
    fn size_is_raw_length() {
        assert_eq!(message().size(), RAW.len());
    }

    #[test]
    fn prepended_headers_render_ahead_of_raw() {
        let mut message = message();
        message.prepend_header("X-Spam-Score", "42");

        let wire = message.to_wire();
        assert!(wire.starts_with(b"X-Spam-Score: 42\r\n"));
        assert!(wire.ends_with(RAW));
        // Original bytes untouched
        assert_eq!(message.raw(), RAW);
    }

    #[test]
    fn priority_defaults_to_normal_and_orders() {
        let message = message();
        assert_eq!(message.priority(), Priority::Normal);
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }
}
