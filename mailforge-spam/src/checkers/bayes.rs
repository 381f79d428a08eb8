use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::{SpamChecker, SpamCheckContext, SpamCheckResult};

/// Naive-Bayes text classifier over subject + body tokens.
///
/// Untrained, it stays neutral (probability 0.5 contributes nothing). The
/// training API is out-of-band: feed it known spam and ham and the
/// per-token statistics shift the combined probability.
#[derive(Debug)]
pub struct BayesChecker {
    words: RwLock<WordDatabase>,
    /// Score emitted at probability 1.0; scales linearly above neutral.
    max_score: f64,
}

#[derive(Debug, Default)]
struct WordDatabase {
    spam_words: HashMap<String, u64>,
    ham_words: HashMap<String, u64>,
    spam_total: u64,
    ham_total: u64,
}

impl WordDatabase {
    fn add(&mut self, text: &str, is_spam: bool) {
        for word in tokenize(text) {
            if is_spam {
                *self.spam_words.entry(word).or_insert(0) += 1;
                self.spam_total += 1;
            } else {
                *self.ham_words.entry(word).or_insert(0) += 1;
                self.ham_total += 1;
            }
        }
    }

    /// Combined spam probability with Laplace smoothing, computed in log
    /// space to avoid underflow on long messages.
    #[allow(clippy::cast_precision_loss)]
    fn spam_probability(&self, text: &str) -> f64 {
        if self.spam_total == 0 || self.ham_total == 0 {
            return 0.5;
        }

        let mut log_prob_spam = 0.0_f64;
        let mut log_prob_ham = 0.0_f64;

        for word in tokenize(text) {
            let spam_count = *self.spam_words.get(&word).unwrap_or(&0) as f64;
            let ham_count = *self.ham_words.get(&word).unwrap_or(&0) as f64;

            let p_word_spam = (spam_count + 1.0) / (self.spam_total as f64 + 2.0);
            let p_word_ham = (ham_count + 1.0) / (self.ham_total as f64 + 2.0);

            log_prob_spam += p_word_spam.ln();
            log_prob_ham += p_word_ham.ln();
        }

        let max_log = log_prob_spam.max(log_prob_ham);
        let prob_spam = (log_prob_spam - max_log).exp();
        let prob_ham = (log_prob_ham - max_log).exp();

        prob_spam / (prob_spam + prob_ham)
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 3 && w.len() <= 20)
        .map(str::to_string)
        .collect()
}

impl BayesChecker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            words: RwLock::new(WordDatabase::default()),
            max_score: 80.0,
        }
    }

    #[must_use]
    pub const fn with_max_score(mut self, max_score: f64) -> Self {
        self.max_score = max_score;
        self
    }

    /// Out-of-band training entry point.
    pub fn train(&self, content: &str, is_spam: bool) {
        self.words.write().add(content, is_spam);
    }

    #[must_use]
    pub fn is_trained(&self) -> bool {
        let words = self.words.read();
        words.spam_total > 0 && words.ham_total > 0
    }

    fn classify(&self, text: &str) -> f64 {
        self.words.read().spam_probability(text)
    }
}

#[async_trait]
impl SpamChecker for BayesChecker {
    fn name(&self) -> &'static str {
        "bayes"
    }

    async fn check(&self, ctx: &SpamCheckContext) -> SpamCheckResult {
        if !self.is_trained() {
            return SpamCheckResult::clean();
        }

        let text = format!(
            "{} {}",
            ctx.subject.as_deref().unwrap_or_default(),
            ctx.body_text.as_deref().unwrap_or_default()
        );

        let probability = self.classify(&text);

        // Only probabilities above neutral contribute; scale 0.5..1.0 onto
        // 0..max_score.
        let score = ((probability - 0.5).max(0.0) * 2.0 * self.max_score).min(self.max_score);

        SpamCheckResult {
            is_spam: probability > 0.7,
            score,
            reason: (probability > 0.7)
                .then(|| format!("bayesian spam probability {probability:.2}")),
            details: Some(format!("bayes={probability:.3}")),
        }
    }
}

impl Default for BayesChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::{BayesChecker, tokenize};
    use crate::{SpamChecker, SpamCheckContext};

    #[test]
    fn tokenizer_filters_short_and_long_words() {
        let tokens = tokenize("Buy V1AGRA now!! at www.example-pharmacy.com");
        assert!(tokens.contains(&"v1agra".to_string()));
        assert!(tokens.contains(&"now".to_string()));
        assert!(!tokens.contains(&"at".to_string()));
    }

    #[tokio::test]
    async fn untrained_classifier_is_neutral() {
        let checker = BayesChecker::new();
        let ctx = SpamCheckContext::for_tests("a@b.com", "203.0.113.5", "anything at all");

        let result = checker.check(&ctx).await;
        assert!(result.score.abs() < f64::EPSILON);
        assert!(!result.is_spam);
    }

    #[tokio::test]
    async fn training_shifts_the_verdict() {
        let checker = BayesChecker::new();

        for _ in 0..5 {
            checker.train("free money lottery winner casino jackpot prize", true);
            checker.train("meeting schedule project quarterly report review", false);
        }
        assert!(checker.is_trained());

        let spammy = SpamCheckContext::for_tests(
            "a@b.com",
            "203.0.113.5",
            "claim your free money lottery prize now",
        );
        let hammy = SpamCheckContext::for_tests(
            "a@b.com",
            "203.0.113.5",
            "the quarterly report is ready for review before the meeting",
        );

        let spam_result = checker.check(&spammy).await;
        let ham_result = checker.check(&hammy).await;

        assert!(spam_result.score > ham_result.score);
        assert!(spam_result.is_spam);
        assert!(!ham_result.is_spam);
    }
}
