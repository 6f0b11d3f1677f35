//! Toxicity Classifier Implementations
//!
//! Two backends for [`ToxicityClassifier`]:
//!
//! - [`PerspectiveClassifier`] asks Google's Perspective API for a
//!   `TOXICITY` probability. One request scores a whole text with per-sentence
//!   span annotations, so pair it with [`Granularity::Full`].
//! - [`LexiconClassifier`] matches words against a local list. It needs no
//!   network access, which makes it useful for development and tests.

use crate::guard::{ClassifierError, ToxicityClassifier};
#[cfg(doc)]
use crate::guard::Granularity;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

const PERSPECTIVE_ENDPOINT: &str =
    "https://commentanalyzer.googleapis.com/v1alpha1/comments:analyze";

/// A classifier backed by the Perspective comment analyzer.
pub struct PerspectiveClassifier {
    client: Client,
    api_key: String,
    endpoint: String,
}

impl PerspectiveClassifier {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_endpoint(api_key, PERSPECTIVE_ENDPOINT)
    }

    /// Points the classifier at a different analyzer, e.g. a local proxy.
    pub fn with_endpoint(api_key: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            endpoint: endpoint.into(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeRequest<'a> {
    comment: Comment<'a>,
    requested_attributes: RequestedAttributes,
    do_not_store: bool,
    span_annotations: bool,
}

#[derive(Serialize)]
struct Comment<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct RequestedAttributes {
    #[serde(rename = "TOXICITY")]
    toxicity: serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct AnalyzeResponse {
    attribute_scores: Option<AttributeScores>,
}

#[derive(Deserialize, Debug)]
struct AttributeScores {
    #[serde(rename = "TOXICITY")]
    toxicity: Option<AttributeScore>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct AttributeScore {
    summary_score: Score,
    #[serde(default)]
    span_scores: Vec<SpanScore>,
}

#[derive(Deserialize, Debug)]
struct SpanScore {
    score: Score,
}

#[derive(Deserialize, Debug)]
struct Score {
    value: f32,
}

#[derive(Deserialize, Debug)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ErrorDetail {
    error_type: Option<String>,
}

/// The worst sentence score, or the summary score when the response
/// carries no span annotations.
fn extract_toxicity(body: &str) -> Result<f32, ClassifierError> {
    let parsed: AnalyzeResponse = serde_json::from_str(body)
        .map_err(|e| ClassifierError::InvalidResponse(e.to_string()))?;
    let toxicity = parsed
        .attribute_scores
        .and_then(|s| s.toxicity)
        .ok_or_else(|| ClassifierError::InvalidResponse("missing TOXICITY score".into()))?;
    let value = toxicity
        .span_scores
        .iter()
        .map(|span| span.score.value)
        .reduce(f32::max)
        .unwrap_or(toxicity.summary_score.value);
    if !(0.0..=1.0).contains(&value) {
        return Err(ClassifierError::InvalidResponse(format!(
            "score {value} outside [0, 1]"
        )));
    }
    Ok(value)
}

/// Maps a failed analyze call to a classifier error. Language errors are
/// permanent for the given text and get their own variant.
fn classify_failure(status: reqwest::StatusCode, body: &str) -> ClassifierError {
    if status == reqwest::StatusCode::BAD_REQUEST {
        if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
            let error_type = envelope
                .error
                .details
                .iter()
                .find_map(|d| d.error_type.as_deref())
                .unwrap_or_default();
            if error_type.starts_with("LANGUAGE_")
                || envelope.error.message.to_lowercase().contains("language")
            {
                let detail = if error_type.is_empty() {
                    envelope.error.message
                } else {
                    error_type.to_string()
                };
                return ClassifierError::UnsupportedLanguage(detail);
            }
        }
    }
    ClassifierError::Unavailable(format!("Perspective API error ({status})"))
}

#[async_trait]
impl ToxicityClassifier for PerspectiveClassifier {
    async fn score(&self, text: &str) -> Result<f32, ClassifierError> {
        let request = AnalyzeRequest {
            comment: Comment { text },
            requested_attributes: RequestedAttributes {
                toxicity: serde_json::Map::new(),
            },
            do_not_store: true,
            span_annotations: true,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&request)
            .send()
            .await
            .map_err(|e| ClassifierError::Unavailable(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ClassifierError::Unavailable(e.to_string()))?;
        if !status.is_success() {
            return Err(classify_failure(status, &body));
        }
        extract_toxicity(&body)
    }
}

/// Scores `1.0` when any word of the text appears in the lexicon, else `0.0`.
#[derive(Debug, Clone, Default)]
pub struct LexiconClassifier {
    words: HashSet<String>,
}

impl LexiconClassifier {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            words: words
                .into_iter()
                .map(|w| w.as_ref().trim().to_lowercase())
                .filter(|w| !w.is_empty())
                .collect(),
        }
    }

    /// Loads a newline-separated word list. Blank lines and lines starting
    /// with `#` are ignored.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read lexicon at {}", path.display()))?;
        Ok(Self::new(
            raw.lines().filter(|l| !l.trim_start().starts_with('#')),
        ))
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    fn contains_listed_word(&self, text: &str) -> bool {
        text.split(|c: char| !c.is_alphanumeric() && c != '\'')
            .filter(|w| !w.is_empty())
            .any(|w| self.words.contains(&w.to_lowercase()))
    }
}

#[async_trait]
impl ToxicityClassifier for LexiconClassifier {
    async fn score(&self, text: &str) -> Result<f32, ClassifierError> {
        Ok(if self.contains_listed_word(text) {
            1.0
        } else {
            0.0
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_toxicity_reads_summary_score() {
        let body = r#"{
            "attributeScores": {
                "TOXICITY": {
                    "spanScores": [],
                    "summaryScore": { "value": 0.42, "type": "PROBABILITY" }
                }
            },
            "languages": ["en"]
        }"#;
        assert!((extract_toxicity(body).unwrap() - 0.42).abs() < f32::EPSILON);
    }

    #[test]
    fn test_extract_toxicity_takes_worst_sentence() {
        let body = r#"{
            "attributeScores": {
                "TOXICITY": {
                    "spanScores": [
                        { "begin": 0, "end": 31, "score": { "value": 0.02 } },
                        { "begin": 32, "end": 55, "score": { "value": 0.81 } }
                    ],
                    "summaryScore": { "value": 0.29 }
                }
            }
        }"#;
        assert!((extract_toxicity(body).unwrap() - 0.81).abs() < f32::EPSILON);
    }

    #[test]
    fn test_language_errors_are_not_retryable_outages() {
        let body = r#"{
            "error": {
                "code": 400,
                "message": "Attribute TOXICITY does not support request languages: ta",
                "status": "INVALID_ARGUMENT",
                "details": [{
                    "@type": "type.googleapis.com/google.commentanalyzer.v1alpha1.Error",
                    "errorType": "LANGUAGE_NOT_SUPPORTED_BY_ATTRIBUTE"
                }]
            }
        }"#;
        match classify_failure(reqwest::StatusCode::BAD_REQUEST, body) {
            ClassifierError::UnsupportedLanguage(detail) => {
                assert_eq!(detail, "LANGUAGE_NOT_SUPPORTED_BY_ATTRIBUTE")
            }
            other => panic!("expected UnsupportedLanguage, got {other:?}"),
        }

        let undetected = r#"{"error": {"code": 400, "message": "Unable to detect language."}}"#;
        assert!(matches!(
            classify_failure(reqwest::StatusCode::BAD_REQUEST, undetected),
            ClassifierError::UnsupportedLanguage(_)
        ));
    }

    #[test]
    fn test_other_failures_stay_unavailable() {
        let quota = r#"{"error": {"code": 429, "message": "Quota exceeded"}}"#;
        assert!(matches!(
            classify_failure(reqwest::StatusCode::TOO_MANY_REQUESTS, quota),
            ClassifierError::Unavailable(_)
        ));
        assert!(matches!(
            classify_failure(reqwest::StatusCode::BAD_REQUEST, "<html>bad gateway</html>"),
            ClassifierError::Unavailable(_)
        ));
    }

    #[test]
    fn test_extract_toxicity_rejects_malformed_bodies() {
        assert!(matches!(
            extract_toxicity("not json"),
            Err(ClassifierError::InvalidResponse(_))
        ));
        assert!(matches!(
            extract_toxicity(r#"{"attributeScores": {}}"#),
            Err(ClassifierError::InvalidResponse(_))
        ));
        assert!(matches!(
            extract_toxicity(r#"{"attributeScores":{"TOXICITY":{"summaryScore":{"value":1.5}}}}"#),
            Err(ClassifierError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_request_shape() {
        let request = AnalyzeRequest {
            comment: Comment { text: "hello" },
            requested_attributes: RequestedAttributes {
                toxicity: serde_json::Map::new(),
            },
            do_not_store: true,
            span_annotations: true,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "comment": { "text": "hello" },
                "requestedAttributes": { "TOXICITY": {} },
                "doNotStore": true,
                "spanAnnotations": true
            })
        );
    }

    #[tokio::test]
    async fn test_lexicon_matches_whole_words_case_insensitively() {
        let lexicon = LexiconClassifier::new(["Idiot", " stupid ", ""]);
        assert_eq!(lexicon.len(), 2);
        assert_eq!(lexicon.score("You IDIOT!").await.unwrap(), 1.0);
        assert_eq!(lexicon.score("that's stupid.").await.unwrap(), 1.0);
        assert_eq!(lexicon.score("idiomatic rust").await.unwrap(), 0.0);
        assert_eq!(lexicon.score("").await.unwrap(), 0.0);
    }

    #[test]
    fn test_lexicon_from_file_skips_comments() {
        let path = std::env::temp_dir().join(format!("lexicon-{}.txt", std::process::id()));
        std::fs::write(&path, "# blocked words\nidiot\n\n  dumb\n").unwrap();
        let lexicon = LexiconClassifier::from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(lexicon.len(), 2);
        assert!(lexicon.contains_listed_word("so dumb"));
        assert!(!lexicon.contains_listed_word("blocked words"));
    }
}
