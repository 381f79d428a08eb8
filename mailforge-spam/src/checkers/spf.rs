use std::sync::Arc;

use async_trait::async_trait;
use mail_auth::{Resolver, SpfResult};
use serde::Deserialize;

use crate::{SpamChecker, SpamCheckContext, SpamCheckResult};

/// Scores for each SPF disposition. The RFC 7208 "higher" results all
/// default to zero.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SpfScores {
    #[serde(default = "default_fail")]
    pub fail: f64,
    #[serde(default = "default_softfail")]
    pub softfail: f64,
}

const fn default_fail() -> f64 {
    50.0
}

const fn default_softfail() -> f64 {
    25.0
}

impl Default for SpfScores {
    fn default() -> Self {
        Self {
            fail: default_fail(),
            softfail: default_softfail(),
        }
    }
}

/// SPF policy evaluation against the connecting IP (RFC 7208), with record
/// fetch and mechanism evaluation delegated to `mail-auth`.
pub struct SpfChecker {
    resolver: Arc<Resolver>,
    hostname: String,
    scores: SpfScores,
}

impl std::fmt::Debug for SpfChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpfChecker")
            .field("hostname", &self.hostname)
            .field("scores", &self.scores)
            .finish_non_exhaustive()
    }
}

impl SpfChecker {
    #[must_use]
    pub fn new(resolver: Arc<Resolver>, hostname: impl Into<String>) -> Self {
        Self {
            resolver,
            hostname: hostname.into(),
            scores: SpfScores::default(),
        }
    }

    #[must_use]
    pub const fn with_scores(mut self, scores: SpfScores) -> Self {
        self.scores = scores;
        self
    }

    fn score_for(&self, result: SpfResult) -> (f64, &'static str) {
        match result {
            SpfResult::Fail => (self.scores.fail, "fail"),
            SpfResult::SoftFail => (self.scores.softfail, "softfail"),
            SpfResult::Pass => (0.0, "pass"),
            SpfResult::Neutral => (0.0, "neutral"),
            SpfResult::TempError => (0.0, "temperror"),
            SpfResult::PermError => (0.0, "permerror"),
            SpfResult::None => (0.0, "none"),
        }
    }
}

#[async_trait]
impl SpamChecker for SpfChecker {
    fn name(&self) -> &'static str {
        "spf"
    }

    async fn check(&self, ctx: &SpamCheckContext) -> SpamCheckResult {
        let Some(sender) = &ctx.sender else {
            // Null reverse-path: SPF is evaluated on HELO alone
            let output = self
                .resolver
                .verify_spf_helo(
                    ctx.client_ip,
                    ctx.helo.as_deref().unwrap_or_default(),
                    &self.hostname,
                )
                .await;
            let (score, disposition) = self.score_for(output.result());
            return SpamCheckResult {
                is_spam: score > 0.0,
                score,
                reason: (score > 0.0).then(|| format!("SPF {disposition} for HELO identity")),
                details: Some(format!("spf={disposition}")),
            };
        };

        let output = self
            .resolver
            .verify_spf_sender(
                ctx.client_ip,
                ctx.helo.as_deref().unwrap_or_default(),
                &self.hostname,
                sender,
            )
            .await;

        let (score, disposition) = self.score_for(output.result());
        SpamCheckResult {
            is_spam: score > 0.0,
            score,
            reason: (score > 0.0)
                .then(|| format!("SPF {disposition} for {sender} from {}", ctx.client_ip)),
            details: Some(format!("spf={disposition}")),
        }
    }
}
