//! Toxicity Guard
//!
//! The checkpoint that sits on both sides of the model call. The same guard
//! inspects the student's latest message before the model sees it and the
//! model's reply before the student sees it. When a sentence scores at or
//! above the threshold, the content is discarded and a fixed fallback
//! message takes its place.
//!
//! The classifier itself is pluggable (see [`crate::classifier`]) and is
//! passed in explicitly, so tests can substitute a fake.

use crate::message::{Content, LlmRequest, LlmResponse, Role};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Substituted for a student message that fails the input check.
pub const INPUT_FALLBACK: &str =
    "Let's keep our conversation respectful. Please rephrase your message.";

/// Substituted for a model reply that fails the output check.
pub const OUTPUT_FALLBACK: &str =
    "I can't provide that response. Let's focus on positive learning!";

/// Reasons a classifier could not score a span. None of these is a
/// statement about the content being checked.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Toxicity classifier unavailable: {0}")]
    Unavailable(String),
    /// The classifier cannot score text in this language. Retrying will not help.
    #[error("Toxicity classifier does not support the language: {0}")]
    UnsupportedLanguage(String),
    #[error("Toxicity classifier timed out after {0:?}")]
    Timeout(Duration),
    #[error("Toxicity classifier returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// Scores a span of text for toxicity.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ToxicityClassifier: Send + Sync {
    /// Returns the probability, in `[0, 1]`, that `text` is toxic.
    async fn score(&self, text: &str) -> Result<f32, ClassifierError>;
}

/// How the text is divided before scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Granularity {
    /// Each sentence is scored on its own; one toxic sentence fails the text.
    #[default]
    Sentence,
    /// The whole text is scored as a single span.
    Full,
}

/// What to do with a span the classifier cannot score because of its language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Unscorable {
    /// Treat the span as clean. The model's own safety settings still apply.
    #[default]
    Pass,
    /// Treat the span as toxic.
    Reject,
}

/// What to do when content is flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnFail {
    /// Reject the content and substitute the fallback.
    #[default]
    Exception,
    /// Log the detection and let the content through.
    Noop,
}

#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Scores at or above this value are toxic. Lower is stricter.
    pub threshold: f32,
    pub granularity: Granularity,
    pub on_fail: OnFail,
    pub unscorable: Unscorable,
    /// Upper bound for a whole check, across all spans.
    pub timeout: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            threshold: 0.3,
            granularity: Granularity::Sentence,
            on_fail: OnFail::Exception,
            unscorable: Unscorable::Pass,
            timeout: Duration::from_secs(10),
        }
    }
}

/// The outcome of a guard check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Forward the original content unchanged.
    Pass,
    /// Drop the original content and deliver `fallback` instead.
    Rejected { fallback: Content },
}

impl Verdict {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Verdict::Rejected { .. })
    }
}

/// Toxicity guard service shared by every session.
pub struct ToxicityGuard {
    classifier: Arc<dyn ToxicityClassifier>,
    config: GuardConfig,
}

impl ToxicityGuard {
    pub fn new(classifier: Arc<dyn ToxicityClassifier>, config: GuardConfig) -> Self {
        Self { classifier, config }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Returns `true` if any span of `text` scores at or above the threshold.
    ///
    /// Spans without a letter or digit (emoji, punctuation) are not scored.
    /// The whole check, not each span, is bounded by the configured timeout.
    pub async fn check(&self, text: &str) -> Result<bool, ClassifierError> {
        let spans: Vec<&str> = match self.config.granularity {
            Granularity::Sentence => split_sentences(text),
            Granularity::Full => vec![text.trim()],
        }
        .into_iter()
        .filter(|span| span.chars().any(char::is_alphanumeric))
        .collect();
        if spans.is_empty() {
            return Ok(false);
        }

        tokio::time::timeout(self.config.timeout, self.any_toxic(&spans))
            .await
            .map_err(|_| ClassifierError::Timeout(self.config.timeout))?
    }

    async fn any_toxic(&self, spans: &[&str]) -> Result<bool, ClassifierError> {
        for span in spans {
            match self.classifier.score(span).await {
                Ok(score) if score >= self.config.threshold => return Ok(true),
                Ok(_) => {}
                Err(ClassifierError::UnsupportedLanguage(detail)) => match self.config.unscorable {
                    Unscorable::Pass => {
                        warn!(%detail, "Span not scorable in its language; passing");
                    }
                    Unscorable::Reject => {
                        warn!(%detail, "Span not scorable in its language; rejecting");
                        return Ok(true);
                    }
                },
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    /// Checks one piece of content on behalf of `expected_role`.
    ///
    /// Every text part is checked, since every part is delivered. Content
    /// from any other role, or without text, is passed through without
    /// consulting the classifier.
    pub async fn validate(
        &self,
        content: Option<&Content>,
        expected_role: Role,
        fallback: &str,
    ) -> Result<Verdict, ClassifierError> {
        let Some(text) = content
            .filter(|c| c.role == expected_role)
            .map(Content::text)
        else {
            return Ok(Verdict::Pass);
        };

        if !self.check(&text).await? {
            return Ok(Verdict::Pass);
        }

        match self.config.on_fail {
            OnFail::Exception => {
                warn!(role = %expected_role, "Toxicity guard rejected content");
                Ok(Verdict::Rejected {
                    fallback: Content::model(fallback),
                })
            }
            OnFail::Noop => {
                warn!(role = %expected_role, "Toxicity detected; passing through (on_fail = noop)");
                Ok(Verdict::Pass)
            }
        }
    }

    /// Checks the latest student message of an outgoing model request.
    pub async fn guard_input(&self, request: &LlmRequest) -> Result<Verdict, ClassifierError> {
        let last = request.contents.last();
        let verdict = self.validate(last, Role::User, INPUT_FALLBACK).await?;
        if verdict.is_rejected() {
            debug!(text = ?last.map(Content::text), "Rejected student input");
        }
        Ok(verdict)
    }

    /// Checks a model reply before it is delivered.
    pub async fn guard_output(&self, response: &LlmResponse) -> Result<Verdict, ClassifierError> {
        self.validate(response.content.as_ref(), Role::Model, OUTPUT_FALLBACK)
            .await
    }
}

/// Splits text into trimmed, non-empty sentences.
///
/// A sentence ends at a newline or at `.`, `!`, `?` or `…` followed by
/// whitespace or the end of the text, so decimals like `3.5` stay intact.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        let boundary = match c {
            '\n' => true,
            '.' | '!' | '?' | '…' => chars.peek().is_none_or(|(_, next)| next.is_whitespace()),
            _ => false,
        };
        if boundary {
            let end = idx + c.len_utf8();
            push_trimmed(&mut sentences, &text[start..end]);
            start = end;
        }
    }
    push_trimmed(&mut sentences, &text[start..]);
    sentences
}

fn push_trimmed<'a>(sentences: &mut Vec<&'a str>, piece: &'a str) {
    let piece = piece.trim();
    if !piece.is_empty() {
        sentences.push(piece);
    }
}
