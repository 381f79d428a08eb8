//! Weighted antispam pipeline.
//!
//! A registry of checkers runs concurrently over each received message; the
//! weighted, clamped composite score picks one of five actions. The verdict
//! is recorded on the message as `X-Spam-*` trace headers, and the service
//! plugs into the SMTP engine through the `Inspector` seam.

pub mod checkers;
pub mod context;

use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::future::join_all;
use mailforge_common::{
    events::SessionInfo,
    message::Message,
    pipeline::{Inspection, Inspector},
    status::Status,
};
use parking_lot::RwLock;
use serde::Deserialize;

pub use context::SpamCheckContext;

/// Verdict of a single checker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpamCheckResult {
    pub is_spam: bool,
    /// 0..=100 before weighting.
    pub score: f64,
    pub reason: Option<String>,
    pub details: Option<String>,
}

impl SpamCheckResult {
    /// A clean result contributing nothing to the composite.
    #[must_use]
    pub fn clean() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn scored(score: f64, reason: impl Into<String>) -> Self {
        Self {
            is_spam: score > 0.0,
            score,
            reason: Some(reason.into()),
            details: None,
        }
    }
}

#[async_trait]
pub trait SpamChecker: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    async fn check(&self, ctx: &SpamCheckContext) -> SpamCheckResult;
}

/// What to do with the message, decided from the composite score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpamAction {
    Accept,
    Mark,
    Quarantine,
    Greylist,
    Reject,
}

impl std::fmt::Display for SpamAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Accept => "accept",
            Self::Mark => "mark",
            Self::Quarantine => "quarantine",
            Self::Greylist => "greylist",
            Self::Reject => "reject",
        })
    }
}

/// Score thresholds for the action decision, checked from most to least
/// severe.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Thresholds {
    #[serde(default = "defaults::reject")]
    pub reject: f64,
    #[serde(default = "defaults::quarantine")]
    pub quarantine: f64,
    #[serde(default = "defaults::greylist")]
    pub greylist: f64,
    #[serde(default = "defaults::mark")]
    pub mark: f64,
}

mod defaults {
    pub const fn reject() -> f64 {
        90.0
    }

    pub const fn quarantine() -> f64 {
        70.0
    }

    pub const fn greylist() -> f64 {
        50.0
    }

    pub const fn mark() -> f64 {
        30.0
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            reject: defaults::reject(),
            quarantine: defaults::quarantine(),
            greylist: defaults::greylist(),
            mark: defaults::mark(),
        }
    }
}

impl Thresholds {
    #[must_use]
    pub fn action_for(&self, score: f64) -> SpamAction {
        if score >= self.reject {
            SpamAction::Reject
        } else if score >= self.quarantine {
            SpamAction::Quarantine
        } else if score >= self.greylist {
            SpamAction::Greylist
        } else if score >= self.mark {
            SpamAction::Mark
        } else {
            SpamAction::Accept
        }
    }
}

/// One registry slot: the checker plus its weight and enablement.
#[derive(Debug, Clone)]
pub struct RegisteredChecker {
    pub checker: Arc<dyn SpamChecker>,
    pub weight: f64,
    pub enabled: bool,
}

/// Composite evaluation outcome.
#[derive(Debug, Clone)]
pub struct AntiSpamResult {
    pub total_score: f64,
    /// (checker name, weighted contribution), in registry order.
    pub checker_scores: Vec<(String, f64)>,
    pub action: SpamAction,
    pub reasons: Vec<String>,
}

/// The checker registry and scoring engine.
///
/// The registry is copy-on-write: evaluation reads an immutable snapshot,
/// so adding a checker never blocks in-flight checks.
#[derive(Debug)]
pub struct AntiSpamService {
    checkers: RwLock<Arc<Vec<RegisteredChecker>>>,
    thresholds: Thresholds,
    checker_timeout: Duration,
}

impl Default for AntiSpamService {
    fn default() -> Self {
        Self::new(Thresholds::default())
    }
}

impl AntiSpamService {
    #[must_use]
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            checkers: RwLock::new(Arc::new(Vec::new())),
            thresholds,
            checker_timeout: Duration::from_secs(10),
        }
    }

    #[must_use]
    pub const fn with_checker_timeout(mut self, timeout: Duration) -> Self {
        self.checker_timeout = timeout;
        self
    }

    /// Register a checker by publishing a new registry snapshot.
    pub fn register(&self, checker: Arc<dyn SpamChecker>, weight: f64) {
        self.register_with(RegisteredChecker {
            checker,
            weight,
            enabled: true,
        });
    }

    pub fn register_with(&self, registered: RegisteredChecker) {
        let mut guard = self.checkers.write();
        let mut next = guard.as_ref().clone();
        next.push(registered);
        *guard = Arc::new(next);
    }

    /// Enable or disable a checker by name, publishing a new snapshot.
    pub fn set_enabled(&self, name: &str, enabled: bool) {
        let mut guard = self.checkers.write();
        let mut next = guard.as_ref().clone();
        for slot in &mut next {
            if slot.checker.name() == name {
                slot.enabled = enabled;
            }
        }
        *guard = Arc::new(next);
    }

    #[must_use]
    pub fn checker_count(&self) -> usize {
        self.checkers.read().len()
    }

    /// Run all enabled checkers concurrently and fold the weighted scores.
    pub async fn evaluate(&self, ctx: &SpamCheckContext) -> AntiSpamResult {
        let snapshot = Arc::clone(&self.checkers.read());

        let checks = snapshot.iter().filter(|slot| slot.enabled).map(|slot| {
            let checker = Arc::clone(&slot.checker);
            let weight = slot.weight;
            async move {
                let result =
                    match tokio::time::timeout(self.checker_timeout, checker.check(ctx)).await {
                        Ok(result) => result,
                        Err(_) => {
                            tracing::warn!(checker = checker.name(), "spam checker timed out");
                            SpamCheckResult::clean()
                        }
                    };
                (checker.name().to_string(), weight, result)
            }
        });

        let outcomes = join_all(checks).await;

        let mut total = 0.0;
        let mut checker_scores = Vec::with_capacity(outcomes.len());
        let mut reasons = Vec::new();

        for (name, weight, result) in outcomes {
            let contribution = result.score * weight;
            total += contribution;
            checker_scores.push((name.clone(), contribution));

            if let Some(reason) = result.reason {
                reasons.push(format!("{name}: {reason}"));
            }
        }

        let total_score = total.clamp(0.0, 100.0);

        AntiSpamResult {
            total_score,
            checker_scores,
            action: self.thresholds.action_for(total_score),
            reasons,
        }
    }

    /// Record the verdict on the message as trace headers.
    fn attach_headers(message: &mut Message, result: &AntiSpamResult) {
        let breakdown = result
            .checker_scores
            .iter()
            .map(|(name, score)| format!("{name}={score:.1}"))
            .collect::<Vec<_>>()
            .join(", ");

        let flagged = if matches!(result.action, SpamAction::Accept) {
            "No"
        } else {
            "Yes"
        };

        message.prepend_header("X-Spam-Score", format!("{:.1}", result.total_score));
        message.prepend_header(
            "X-Spam-Status",
            format!(
                "{flagged}, score={:.1} action={}",
                result.total_score, result.action
            ),
        );
        message.prepend_header("X-Spam-Checker-Scores", breakdown);
    }
}

#[async_trait]
impl Inspector for AntiSpamService {
    async fn inspect(&self, session: &SessionInfo, message: &mut Message) -> Inspection {
        let ctx = SpamCheckContext::build(session, message);
        let result = self.evaluate(&ctx).await;

        Self::attach_headers(message, &result);

        tracing::debug!(
            score = result.total_score,
            action = %result.action,
            "antispam verdict"
        );

        match result.action {
            SpamAction::Accept | SpamAction::Mark => Inspection::Accept,
            SpamAction::Quarantine => {
                message.prepend_header("X-Spam-Quarantine", "Yes");
                Inspection::Accept
            }
            SpamAction::Greylist => {
                Inspection::Defer("4.7.1 greylisted, please retry later".to_string())
            }
            SpamAction::Reject => Inspection::Reject {
                status: Status::TransactionFailed,
                reason: format!(
                    "5.7.1 message rejected as spam (score {:.1})",
                    result.total_score
                ),
            },
        }
    }
}
