//! Request Guard Pipeline
//!
//! One student turn: input guard, model call, output guard. The pipeline is
//! stateless per call; the caller owns the session and its history.

use crate::guard::{ClassifierError, ToxicityGuard, Verdict};
use crate::llm_client::{GenerationConfig, LLMClient};
use crate::message::{Content, LlmRequest};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Delivered when the model produced no content at all, e.g. because the
/// provider's own safety settings withheld the candidate.
pub const BLOCKED_REPLY: &str =
    "Sorry, I couldn't answer that. Please ask about today's topic.";

pub const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(60);

/// How a turn's reply came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// The model's reply, delivered unchanged.
    Answered,
    /// The student's message was rejected; the model was never called.
    InputRejected,
    /// The model's reply was rejected and replaced.
    OutputRejected,
    /// The model returned nothing.
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub reply: Content,
    pub disposition: Disposition,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The classifier could not give a verdict. Nothing was delivered.
    #[error("Content guard unavailable: {0}")]
    GuardUnavailable(#[source] ClassifierError),
    #[error("Model call timed out after {0:?}")]
    ModelTimeout(Duration),
    #[error("Model call failed: {0}")]
    Model(#[source] anyhow::Error),
}

impl PipelineError {
    /// Whether the same turn may succeed if tried again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::GuardUnavailable(_) | PipelineError::ModelTimeout(_)
        )
    }
}

pub struct RecapPipeline {
    guard: Arc<ToxicityGuard>,
    llm: Arc<dyn LLMClient>,
    generation: GenerationConfig,
    model_timeout: Duration,
}

impl RecapPipeline {
    pub fn new(
        guard: Arc<ToxicityGuard>,
        llm: Arc<dyn LLMClient>,
        generation: GenerationConfig,
        model_timeout: Duration,
    ) -> Self {
        Self {
            guard,
            llm,
            generation,
            model_timeout,
        }
    }

    /// Runs one turn of `user_text` on top of `history`.
    pub async fn run_turn(
        &self,
        instruction: &str,
        history: &[Content],
        user_text: &str,
    ) -> Result<TurnOutcome, PipelineError> {
        let mut contents = history.to_vec();
        contents.push(Content::user(user_text));
        let request = LlmRequest { contents };

        if let Verdict::Rejected { fallback } = self
            .guard
            .guard_input(&request)
            .await
            .map_err(PipelineError::GuardUnavailable)?
        {
            return Ok(TurnOutcome {
                reply: fallback,
                disposition: Disposition::InputRejected,
            });
        }

        let response = tokio::time::timeout(
            self.model_timeout,
            self.llm.generate(instruction, &request, &self.generation),
        )
        .await
        .map_err(|_| PipelineError::ModelTimeout(self.model_timeout))?
        .map_err(PipelineError::Model)?;

        let verdict = self
            .guard
            .guard_output(&response)
            .await
            .map_err(|e| {
                warn!(error = %e, "Output guard failed; withholding model reply");
                PipelineError::GuardUnavailable(e)
            })?;

        let outcome = match (verdict, response.content) {
            (Verdict::Rejected { fallback }, _) => TurnOutcome {
                reply: fallback,
                disposition: Disposition::OutputRejected,
            },
            (Verdict::Pass, Some(content)) if !content.text().trim().is_empty() => TurnOutcome {
                reply: content,
                disposition: Disposition::Answered,
            },
            (Verdict::Pass, _) => {
                debug!("Model returned no text");
                TurnOutcome {
                    reply: Content::model(BLOCKED_REPLY),
                    disposition: Disposition::Blocked,
                }
            }
        };
        info!(disposition = ?outcome.disposition, "Turn completed");
        Ok(outcome)
    }
}
