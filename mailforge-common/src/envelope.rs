use serde::{Deserialize, Serialize};

use crate::address::{Address, AddressList};

/// BODY parameter negotiated on MAIL FROM (RFC 6152).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BodyKind {
    #[default]
    SevenBit,
    EightBitMime,
}

/// The in-progress SMTP transaction: reverse-path, forward-paths and the
/// MAIL FROM parameters that shape the transfer.
///
/// Reset on RSET and after a completed DATA.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    sender: Option<Address>,
    recipients: AddressList,
    declared_size: Option<usize>,
    body: BodyKind,
    utf8: bool,
    mail_from_seen: bool,
}

impl Envelope {
    /// Returns a reference to the reverse-path for this transaction. `None`
    /// either means no MAIL FROM yet or the null sender `<>`.
    #[inline]
    pub const fn sender(&self) -> Option<&Address> {
        self.sender.as_ref()
    }

    #[inline]
    pub const fn sender_mut(&mut self) -> &mut Option<Address> {
        &mut self.sender
    }

    /// The forward-paths accepted so far, in order of acceptance.
    #[inline]
    pub const fn recipients(&self) -> &AddressList {
        &self.recipients
    }

    #[inline]
    pub const fn recipients_mut(&mut self) -> &mut AddressList {
        &mut self.recipients
    }

    /// The size hint from the MAIL FROM SIZE parameter, if declared.
    #[inline]
    pub const fn declared_size(&self) -> Option<usize> {
        self.declared_size
    }

    #[inline]
    pub const fn set_declared_size(&mut self, size: Option<usize>) {
        self.declared_size = size;
    }

    #[inline]
    pub const fn body(&self) -> BodyKind {
        self.body
    }

    #[inline]
    pub const fn set_body(&mut self, body: BodyKind) {
        self.body = body;
    }

    /// Whether SMTPUTF8 was requested for this transaction.
    #[inline]
    pub const fn utf8(&self) -> bool {
        self.utf8
    }

    #[inline]
    pub const fn set_utf8(&mut self, utf8: bool) {
        self.utf8 = utf8;
    }

    /// True once MAIL FROM has been accepted (including the null sender).
    #[inline]
    pub const fn has_sender(&self) -> bool {
        self.mail_from_seen
    }

    /// Record that MAIL FROM was accepted. The null sender keeps `sender`
    /// as `None` but still opens the transaction.
    pub fn open(&mut self, sender: Option<Address>) {
        self.sender = sender;
        self.mail_from_seen = true;
    }

    /// Clear the transaction. Used by RSET and after DATA completes.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
