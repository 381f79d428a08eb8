use std::sync::Arc;

use async_trait::async_trait;
use mail_auth::{AuthenticatedMessage, DkimResult, Resolver};
use serde::Deserialize;

use crate::{SpamChecker, SpamCheckContext, SpamCheckResult};

/// Scores for the DKIM dispositions that matter: no signature at all, a
/// signature that fails verification, and an expired one.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DkimScores {
    #[serde(default = "default_unsigned")]
    pub unsigned: f64,
    #[serde(default = "default_broken")]
    pub broken: f64,
    #[serde(default = "default_expired")]
    pub expired: f64,
}

const fn default_unsigned() -> f64 {
    15.0
}

const fn default_broken() -> f64 {
    40.0
}

const fn default_expired() -> f64 {
    25.0
}

impl Default for DkimScores {
    fn default() -> Self {
        Self {
            unsigned: default_unsigned(),
            broken: default_broken(),
            expired: default_expired(),
        }
    }
}

/// DKIM signature verification (RFC 6376): signature-header parsing,
/// selector key fetch, body-hash and signature validation all happen in
/// `mail-auth`; this checker maps the outcome to a score.
pub struct DkimChecker {
    resolver: Arc<Resolver>,
    scores: DkimScores,
}

impl std::fmt::Debug for DkimChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DkimChecker")
            .field("scores", &self.scores)
            .finish_non_exhaustive()
    }
}

impl DkimChecker {
    #[must_use]
    pub fn new(resolver: Arc<Resolver>) -> Self {
        Self {
            resolver,
            scores: DkimScores::default(),
        }
    }

    #[must_use]
    pub const fn with_scores(mut self, scores: DkimScores) -> Self {
        self.scores = scores;
        self
    }
}

#[async_trait]
impl SpamChecker for DkimChecker {
    fn name(&self) -> &'static str {
        "dkim"
    }

    async fn check(&self, ctx: &SpamCheckContext) -> SpamCheckResult {
        let Some(message) = AuthenticatedMessage::parse(&ctx.raw) else {
            return SpamCheckResult::scored(self.scores.unsigned, "unparseable message");
        };

        let outputs = self.resolver.verify_dkim(&message).await;

        if outputs.iter().all(|o| matches!(o.result(), DkimResult::None)) {
            return SpamCheckResult {
                is_spam: self.scores.unsigned > 0.0,
                score: self.scores.unsigned,
                reason: Some("no DKIM signature".to_string()),
                details: Some("dkim=none".to_string()),
            };
        }

        if outputs
            .iter()
            .any(|o| matches!(o.result(), DkimResult::Pass))
        {
            return SpamCheckResult {
                is_spam: false,
                score: 0.0,
                reason: None,
                details: Some("dkim=pass".to_string()),
            };
        }

        let expired = outputs.iter().any(|o| {
            matches!(
                o.result(),
                DkimResult::Fail(mail_auth::Error::SignatureExpired)
            )
        });

        if expired {
            SpamCheckResult {
                is_spam: true,
                score: self.scores.expired,
                reason: Some("DKIM signature expired".to_string()),
                details: Some("dkim=expired".to_string()),
            }
        } else {
            SpamCheckResult {
                is_spam: true,
                score: self.scores.broken,
                reason: Some("DKIM signature failed verification".to_string()),
                details: Some("dkim=fail".to_string()),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::DkimScores;

    #[test]
    fn broken_signatures_score_worse_than_missing_ones() {
        let scores = DkimScores::default();
        assert!(scores.broken > scores.unsigned);
        assert!(scores.broken > scores.expired);
    }
}
