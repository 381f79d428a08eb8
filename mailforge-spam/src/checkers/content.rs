use async_trait::async_trait;
use regex::Regex;

use crate::{SpamChecker, SpamCheckContext, SpamCheckResult};

/// Which part of the message a rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulePart {
    Subject,
    Body,
}

/// A keyword or regex rule contributing `score` per hit.
#[derive(Debug)]
pub struct ContentRule {
    pub name: &'static str,
    pub part: RulePart,
    pub score: f64,
    matcher: Matcher,
}

#[derive(Debug)]
enum Matcher {
    Keyword(String),
    Pattern(Regex),
}

impl ContentRule {
    #[must_use]
    pub fn keyword(name: &'static str, part: RulePart, keyword: &str, score: f64) -> Self {
        Self {
            name,
            part,
            score,
            matcher: Matcher::Keyword(keyword.to_ascii_lowercase()),
        }
    }

    /// `None` if the pattern does not compile.
    #[must_use]
    pub fn regex(name: &'static str, part: RulePart, pattern: &str, score: f64) -> Option<Self> {
        Regex::new(pattern).ok().map(|regex| Self {
            name,
            part,
            score,
            matcher: Matcher::Pattern(regex),
        })
    }

    fn matches(&self, text: &str) -> bool {
        match &self.matcher {
            Matcher::Keyword(keyword) => text.to_ascii_lowercase().contains(keyword),
            Matcher::Pattern(regex) => regex.is_match(text),
        }
    }
}

/// Keyword and regex matching over subject and body.
#[derive(Debug, Default)]
pub struct ContentChecker {
    rules: Vec<ContentRule>,
}

impl ContentChecker {
    #[must_use]
    pub fn new(rules: Vec<ContentRule>) -> Self {
        Self { rules }
    }

    /// A starter rule set covering the classic patterns.
    #[must_use]
    pub fn with_default_rules() -> Self {
        let mut rules = vec![
            ContentRule::keyword("urgent_subject", RulePart::Subject, "urgent", 10.0),
            ContentRule::keyword("act_now", RulePart::Body, "act now", 10.0),
            ContentRule::keyword("free_money", RulePart::Body, "free money", 15.0),
            ContentRule::keyword("lottery_winner", RulePart::Body, "lottery winner", 20.0),
        ];

        rules.extend(ContentRule::regex(
            "advance_fee",
            RulePart::Body,
            r"(?i)prince|inheritance|million.{1,20}dollars",
            25.0,
        ));
        rules.extend(ContentRule::regex(
            "shouting_subject",
            RulePart::Subject,
            r"^[^a-z]{12,}$",
            8.0,
        ));

        Self::new(rules)
    }

    pub fn add_rule(&mut self, rule: ContentRule) {
        self.rules.push(rule);
    }
}

#[async_trait]
impl SpamChecker for ContentChecker {
    fn name(&self) -> &'static str {
        "content"
    }

    async fn check(&self, ctx: &SpamCheckContext) -> SpamCheckResult {
        let subject = ctx.subject.as_deref().unwrap_or_default();
        let body = ctx.body_text.as_deref().unwrap_or_default();

        let mut score = 0.0;
        let mut hits = Vec::new();

        for rule in &self.rules {
            let text = match rule.part {
                RulePart::Subject => subject,
                RulePart::Body => body,
            };
            if rule.matches(text) {
                score += rule.score;
                hits.push(rule.name);
            }
        }

        if hits.is_empty() {
            SpamCheckResult::clean()
        } else {
            SpamCheckResult {
                is_spam: true,
                score: score.min(100.0),
                reason: Some(format!("content rules matched: {}", hits.join(", "))),
                details: Some(format!("content={}", hits.join(","))),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{ContentChecker, ContentRule, RulePart};
    use crate::{SpamChecker, SpamCheckContext};

    fn ctx(body: &str) -> SpamCheckContext {
        SpamCheckContext::for_tests("a@b.com", "203.0.113.5", body)
    }

    #[tokio::test]
    async fn clean_content_scores_zero() {
        let checker = ContentChecker::with_default_rules();
        let result = checker.check(&ctx("see you at the standup tomorrow")).await;
        assert!(result.score.abs() < f64::EPSILON);
        assert!(!result.is_spam);
    }

    #[tokio::test]
    async fn keyword_hits_accumulate() {
        let checker = ContentChecker::with_default_rules();
        let result = checker
            .check(&ctx("act now to claim your free money"))
            .await;

        // act_now (10) + free_money (15)
        assert!((result.score - 25.0).abs() < f64::EPSILON);
        assert!(result.is_spam);
        assert!(result.reason.as_deref().unwrap().contains("act_now"));
    }

    #[tokio::test]
    async fn regex_rules_match_case_insensitively() {
        let checker = ContentChecker::with_default_rules();
        let result = checker
            .check(&ctx("I am a PRINCE with an inheritance of five million dollars"))
            .await;
        assert!(result.is_spam);
    }

    #[tokio::test]
    async fn subject_rules_only_see_the_subject() {
        let mut checker = ContentChecker::default();
        checker.add_rule(ContentRule::keyword(
            "test_rule",
            RulePart::Subject,
            "winner",
            30.0,
        ));

        // "winner" in the body, not the subject
        let result = checker.check(&ctx("you are a winner")).await;
        assert!(result.score.abs() < f64::EPSILON);
    }

    #[test]
    fn invalid_regex_is_rejected_at_construction() {
        assert!(ContentRule::regex("broken", RulePart::Body, "([", 1.0).is_none());
    }
}
