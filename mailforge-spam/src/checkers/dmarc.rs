use std::{
    hash::{Hash, Hasher},
    sync::Arc,
};

use async_trait::async_trait;
use mail_auth::{AuthenticatedMessage, DmarcResult, Resolver, dmarc::Policy};
use serde::Deserialize;

use crate::{SpamChecker, SpamCheckContext, SpamCheckResult};

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DmarcScores {
    #[serde(default = "default_reject")]
    pub reject: f64,
    #[serde(default = "default_quarantine")]
    pub quarantine: f64,
    #[serde(default = "default_none")]
    pub none: f64,
    /// Fraction of failing messages the published policy is applied to,
    /// mirroring the record's `pct` tag at the configuration level.
    #[serde(default = "default_apply_percent")]
    pub apply_percent: u8,
}

const fn default_reject() -> f64 {
    70.0
}

const fn default_quarantine() -> f64 {
    45.0
}

const fn default_none() -> f64 {
    10.0
}

const fn default_apply_percent() -> u8 {
    100
}

impl Default for DmarcScores {
    fn default() -> Self {
        Self {
            reject: default_reject(),
            quarantine: default_quarantine(),
            none: default_none(),
            apply_percent: default_apply_percent(),
        }
    }
}

/// DMARC alignment and policy evaluation (RFC 7489). SPF and DKIM are
/// re-verified independently so the checker stays self-contained in the
/// concurrent pipeline; record fetch, alignment (`aspf`/`adkim`) and policy
/// parsing are `mail-auth`'s.
///
/// Sampling is deterministic per message: a hash of the message id decides
/// whether the policy applies, so retries of one message always agree.
pub struct DmarcChecker {
    resolver: Arc<Resolver>,
    hostname: String,
    scores: DmarcScores,
}

impl std::fmt::Debug for DmarcChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmarcChecker")
            .field("hostname", &self.hostname)
            .field("scores", &self.scores)
            .finish_non_exhaustive()
    }
}

impl DmarcChecker {
    #[must_use]
    pub fn new(resolver: Arc<Resolver>, hostname: impl Into<String>) -> Self {
        Self {
            resolver,
            hostname: hostname.into(),
            scores: DmarcScores::default(),
        }
    }

    #[must_use]
    pub const fn with_scores(mut self, scores: DmarcScores) -> Self {
        self.scores = scores;
        self
    }

    fn sampled(&self, ctx: &SpamCheckContext) -> bool {
        if self.scores.apply_percent >= 100 {
            return true;
        }
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        ctx.message_id.hash(&mut hasher);
        (hasher.finish() % 100) < u64::from(self.scores.apply_percent)
    }
}

#[async_trait]
impl SpamChecker for DmarcChecker {
    fn name(&self) -> &'static str {
        "dmarc"
    }

    async fn check(&self, ctx: &SpamCheckContext) -> SpamCheckResult {
        let Some(sender) = &ctx.sender else {
            return SpamCheckResult::clean();
        };
        let Some(sender_domain) = &ctx.sender_domain else {
            return SpamCheckResult::clean();
        };

        let Some(message) = AuthenticatedMessage::parse(&ctx.raw) else {
            return SpamCheckResult::clean();
        };

        let dkim_output = self.resolver.verify_dkim(&message).await;
        let spf_output = self
            .resolver
            .verify_spf_sender(
                ctx.client_ip,
                ctx.helo.as_deref().unwrap_or_default(),
                &self.hostname,
                sender,
            )
            .await;

        let dmarc = self
            .resolver
            .verify_dmarc(&message, &dkim_output, sender_domain, &spf_output)
            .await;

        let spf_aligned = matches!(dmarc.spf_result(), DmarcResult::Pass);
        let dkim_aligned = matches!(dmarc.dkim_result(), DmarcResult::Pass);

        // One aligned pass is enough
        if spf_aligned || dkim_aligned {
            return SpamCheckResult {
                is_spam: false,
                score: 0.0,
                reason: None,
                details: Some("dmarc=pass".to_string()),
            };
        }

        // No published record means no policy to apply
        if matches!(dmarc.spf_result(), DmarcResult::None)
            && matches!(dmarc.dkim_result(), DmarcResult::None)
        {
            return SpamCheckResult {
                is_spam: false,
                score: 0.0,
                reason: None,
                details: Some("dmarc=none".to_string()),
            };
        }

        if !self.sampled(ctx) {
            return SpamCheckResult {
                is_spam: false,
                score: 0.0,
                reason: None,
                details: Some("dmarc=fail (not sampled)".to_string()),
            };
        }

        let (score, policy) = match dmarc.policy() {
            Policy::Reject => (self.scores.reject, "reject"),
            Policy::Quarantine => (self.scores.quarantine, "quarantine"),
            Policy::None | Policy::Unspecified => (self.scores.none, "none"),
        };

        SpamCheckResult {
            is_spam: score > 0.0,
            score,
            reason: Some(format!(
                "DMARC alignment failed for {sender_domain} (policy {policy})"
            )),
            details: Some(format!("dmarc=fail policy={policy}")),
        }
    }
}

#[cfg(test)]
mod test {
    use super::DmarcScores;

    #[test]
    fn policy_severity_ordering() {
        let scores = DmarcScores::default();
        assert!(scores.reject > scores.quarantine);
        assert!(scores.quarantine > scores.none);
        assert_eq!(scores.apply_percent, 100);
    }
}
