//! Mailbox filters: the accept/deliver predicate pair evaluated on
//! MAIL FROM and RCPT TO.
//!
//! Filters are pure with respect to session state and compose through
//! [`CompositeFilter`] with All (AND) or Any (OR) semantics; children of a
//! composite are evaluated concurrently. A rejection maps to 550 at the
//! session boundary.

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use futures_util::future::join_all;
use mailforge_common::{address::Address, events::SessionInfo};

/// The predicate pair. Both default to accepting so implementations can
/// override only the side they care about.
#[async_trait]
pub trait MailboxFilter: Send + Sync + Debug {
    async fn can_accept_from(
        &self,
        _session: &SessionInfo,
        _from: Option<&Address>,
        _size: Option<usize>,
    ) -> bool {
        true
    }

    async fn can_deliver_to(
        &self,
        _session: &SessionInfo,
        _to: &Address,
        _from: Option<&Address>,
    ) -> bool {
        true
    }
}

/// How a composite folds its children's answers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FilterMode {
    #[default]
    All,
    Any,
}

/// AND/OR composition of filters. An empty composite accepts.
#[derive(Debug, Default)]
pub struct CompositeFilter {
    mode: FilterMode,
    children: Vec<Arc<dyn MailboxFilter>>,
}

impl CompositeFilter {
    #[must_use]
    pub fn new(mode: FilterMode) -> Self {
        Self {
            mode,
            children: Vec::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, filter: Arc<dyn MailboxFilter>) -> Self {
        self.children.push(filter);
        self
    }

    pub fn add(&mut self, filter: Arc<dyn MailboxFilter>) {
        self.children.push(filter);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    fn fold(&self, results: Vec<bool>) -> bool {
        if results.is_empty() {
            return true;
        }
        match self.mode {
            FilterMode::All => results.into_iter().all(|r| r),
            FilterMode::Any => results.into_iter().any(|r| r),
        }
    }
}

#[async_trait]
impl MailboxFilter for CompositeFilter {
    async fn can_accept_from(
        &self,
        session: &SessionInfo,
        from: Option<&Address>,
        size: Option<usize>,
    ) -> bool {
        let results = join_all(
            self.children
                .iter()
                .map(|child| child.can_accept_from(session, from, size)),
        )
        .await;

        self.fold(results)
    }

    async fn can_deliver_to(
        &self,
        session: &SessionInfo,
        to: &Address,
        from: Option<&Address>,
    ) -> bool {
        let results = join_all(
            self.children
                .iter()
                .map(|child| child.can_deliver_to(session, to, from)),
        )
        .await;

        self.fold(results)
    }
}

/// Identity filter.
#[derive(Debug, Default)]
pub struct AcceptAll;

#[async_trait]
impl MailboxFilter for AcceptAll {}

/// Which address a domain list applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterScope {
    Sender,
    Recipient,
}

/// Accept only addresses whose domain appears in the list. The null sender
/// is always accepted so bounces keep flowing.
#[derive(Debug)]
pub struct DomainAllowlist {
    scope: FilterScope,
    domains: Vec<String>,
}

impl DomainAllowlist {
    #[must_use]
    pub fn sender(domains: impl IntoIterator<Item = String>) -> Self {
        Self::new(FilterScope::Sender, domains)
    }

    #[must_use]
    pub fn recipient(domains: impl IntoIterator<Item = String>) -> Self {
        Self::new(FilterScope::Recipient, domains)
    }

    fn new(scope: FilterScope, domains: impl IntoIterator<Item = String>) -> Self {
        Self {
            scope,
            domains: domains
                .into_iter()
                .map(|d| d.to_ascii_lowercase())
                .collect(),
        }
    }

    fn allows(&self, address: &Address) -> bool {
        address
            .domain()
            .is_some_and(|domain| self.domains.iter().any(|d| *d == domain))
    }
}

#[async_trait]
impl MailboxFilter for DomainAllowlist {
    async fn can_accept_from(
        &self,
        _session: &SessionInfo,
        from: Option<&Address>,
        _size: Option<usize>,
    ) -> bool {
        match (self.scope, from) {
            (FilterScope::Sender, Some(from)) => self.allows(from),
            _ => true,
        }
    }

    async fn can_deliver_to(
        &self,
        _session: &SessionInfo,
        to: &Address,
        _from: Option<&Address>,
    ) -> bool {
        match self.scope {
            FilterScope::Recipient => self.allows(to),
            FilterScope::Sender => true,
        }
    }
}

/// Reject addresses whose domain appears in the list.
#[derive(Debug)]
pub struct DomainBlocklist {
    scope: FilterScope,
    domains: Vec<String>,
}

impl DomainBlocklist {
    #[must_use]
    pub fn sender(domains: impl IntoIterator<Item = String>) -> Self {
        Self::new(FilterScope::Sender, domains)
    }

    #[must_use]
    pub fn recipient(domains: impl IntoIterator<Item = String>) -> Self {
        Self::new(FilterScope::Recipient, domains)
    }

    fn new(scope: FilterScope, domains: impl IntoIterator<Item = String>) -> Self {
        Self {
            scope,
            domains: domains
                .into_iter()
                .map(|d| d.to_ascii_lowercase())
                .collect(),
        }
    }

    fn blocks(&self, address: &Address) -> bool {
        address
            .domain()
            .is_some_and(|domain| self.domains.iter().any(|d| *d == domain))
    }
}

#[async_trait]
impl MailboxFilter for DomainBlocklist {
    async fn can_accept_from(
        &self,
        _session: &SessionInfo,
        from: Option<&Address>,
        _size: Option<usize>,
    ) -> bool {
        match (self.scope, from) {
            (FilterScope::Sender, Some(from)) => !self.blocks(from),
            _ => true,
        }
    }

    async fn can_deliver_to(
        &self,
        _session: &SessionInfo,
        to: &Address,
        _from: Option<&Address>,
    ) -> bool {
        match self.scope {
            FilterScope::Recipient => !self.blocks(to),
            FilterScope::Sender => true,
        }
    }
}

/// Reject declared sizes above the limit at MAIL FROM time, before any bytes
/// are transferred.
#[derive(Debug)]
pub struct SizeLimit {
    max: usize,
}

impl SizeLimit {
    #[must_use]
    pub const fn new(max: usize) -> Self {
        Self { max }
    }
}

#[async_trait]
impl MailboxFilter for SizeLimit {
    async fn can_accept_from(
        &self,
        _session: &SessionInfo,
        _from: Option<&Address>,
        size: Option<usize>,
    ) -> bool {
        self.max == 0 || size.is_none_or(|s| s <= self.max)
    }
}

type AcceptFromFn =
    dyn Fn(&SessionInfo, Option<&Address>, Option<usize>) -> bool + Send + Sync;
type DeliverToFn = dyn Fn(&SessionInfo, &Address, Option<&Address>) -> bool + Send + Sync;

/// Catch-all for behaviour the built-in filters don't express.
pub struct CustomFilter {
    accept_from: Option<Arc<AcceptFromFn>>,
    deliver_to: Option<Arc<DeliverToFn>>,
}

impl CustomFilter {
    #[must_use]
    pub fn accepting_from(
        check: impl Fn(&SessionInfo, Option<&Address>, Option<usize>) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            accept_from: Some(Arc::new(check)),
            deliver_to: None,
        }
    }

    #[must_use]
    pub fn delivering_to(
        check: impl Fn(&SessionInfo, &Address, Option<&Address>) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            accept_from: None,
            deliver_to: Some(Arc::new(check)),
        }
    }
}

impl Debug for CustomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomFilter")
            .field("accept_from", &self.accept_from.is_some())
            .field("deliver_to", &self.deliver_to.is_some())
            .finish()
    }
}

#[async_trait]
impl MailboxFilter for CustomFilter {
    async fn can_accept_from(
        &self,
        session: &SessionInfo,
        from: Option<&Address>,
        size: Option<usize>,
    ) -> bool {
        self.accept_from
            .as_ref()
            .is_none_or(|check| check(session, from, size))
    }

    async fn can_deliver_to(
        &self,
        session: &SessionInfo,
        to: &Address,
        from: Option<&Address>,
    ) -> bool {
        self.deliver_to
            .as_ref()
            .is_none_or(|check| check(session, to, from))
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use mailforge_common::{address::Address, events::SessionInfo};

    use super::{
        AcceptAll, CompositeFilter, CustomFilter, DomainAllowlist, DomainBlocklist, FilterMode,
        MailboxFilter, SizeLimit,
    };

    fn session() -> SessionInfo {
        SessionInfo {
            id: ulid::Ulid::new(),
            peer: "192.0.2.7:42000".parse().unwrap(),
            started_at: std::time::SystemTime::now(),
            helo: None,
            tls: false,
            authenticated: None,
        }
    }

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    #[tokio::test]
    async fn empty_composite_accepts() {
        let composite = CompositeFilter::new(FilterMode::All);
        assert!(
            composite
                .can_accept_from(&session(), Some(&addr("a@b.com")), None)
                .await
        );
        assert!(
            composite
                .can_deliver_to(&session(), &addr("a@b.com"), None)
                .await
        );
    }

    #[tokio::test]
    async fn all_mode_requires_every_child() {
        let composite = CompositeFilter::new(FilterMode::All)
            .with(Arc::new(AcceptAll))
            .with(Arc::new(DomainBlocklist::sender(["spam.example".to_string()])));

        assert!(
            composite
                .can_accept_from(&session(), Some(&addr("a@ok.example")), None)
                .await
        );
        assert!(
            !composite
                .can_accept_from(&session(), Some(&addr("a@spam.example")), None)
                .await
        );
    }

    #[tokio::test]
    async fn any_mode_requires_one_child() {
        let composite = CompositeFilter::new(FilterMode::Any)
            .with(Arc::new(DomainAllowlist::recipient(["one.example".to_string()])))
            .with(Arc::new(DomainAllowlist::recipient(["two.example".to_string()])));

        assert!(
            composite
                .can_deliver_to(&session(), &addr("u@two.example"), None)
                .await
        );
        assert!(
            !composite
                .can_deliver_to(&session(), &addr("u@three.example"), None)
                .await
        );
    }

    #[tokio::test]
    async fn allowlist_is_case_insensitive() {
        let filter = DomainAllowlist::sender(["Example.COM".to_string()]);
        assert!(
            filter
                .can_accept_from(&session(), Some(&addr("u@EXAMPLE.com")), None)
                .await
        );
    }

    #[tokio::test]
    async fn null_sender_passes_sender_filters() {
        let allow = DomainAllowlist::sender(["example.com".to_string()]);
        let block = DomainBlocklist::sender(["example.com".to_string()]);

        assert!(allow.can_accept_from(&session(), None, None).await);
        assert!(block.can_accept_from(&session(), None, None).await);
    }

    #[tokio::test]
    async fn size_limit_checks_declared_size_only() {
        let filter = SizeLimit::new(1000);

        assert!(filter.can_accept_from(&session(), None, None).await);
        assert!(filter.can_accept_from(&session(), None, Some(1000)).await);
        assert!(!filter.can_accept_from(&session(), None, Some(1001)).await);

        // Zero max means unlimited
        let unlimited = SizeLimit::new(0);
        assert!(
            unlimited
                .can_accept_from(&session(), None, Some(usize::MAX))
                .await
        );
    }

    #[tokio::test]
    async fn custom_filter_applies_only_its_side() {
        let filter = CustomFilter::delivering_to(|_, to, _| {
            to.email().is_some_and(|e| !e.starts_with("noreply"))
        });

        assert!(
            filter
                .can_accept_from(&session(), Some(&addr("anyone@x.com")), None)
                .await
        );
        assert!(
            filter
                .can_deliver_to(&session(), &addr("user@x.com"), None)
                .await
        );
        assert!(
            !filter
                .can_deliver_to(&session(), &addr("noreply@x.com"), None)
                .await
        );
    }
}
