use crate::message::{Content, LlmRequest, LlmResponse, Part, Role};
use anyhow::{Context, Result, anyhow};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_MODEL: &str = "gemini-2.5-pro";

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Harm categories the provider can block on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HarmCategory {
    #[serde(rename = "HARM_CATEGORY_HATE_SPEECH")]
    HateSpeech,
    #[serde(rename = "HARM_CATEGORY_HARASSMENT")]
    Harassment,
    #[serde(rename = "HARM_CATEGORY_DANGEROUS_CONTENT")]
    DangerousContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HarmBlockThreshold {
    BlockLowAndAbove,
    BlockMediumAndAbove,
    BlockOnlyHigh,
    BlockNone,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetySetting {
    pub category: HarmCategory,
    pub threshold: HarmBlockThreshold,
}

/// Sampling and safety parameters sent with every model call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub safety_settings: Vec<SafetySetting>,
}

impl GenerationConfig {
    /// Hate speech and harassment are blocked from medium probability up,
    /// dangerous content only at high probability.
    pub fn default_safety_settings() -> Vec<SafetySetting> {
        vec![
            SafetySetting {
                category: HarmCategory::HateSpeech,
                threshold: HarmBlockThreshold::BlockMediumAndAbove,
            },
            SafetySetting {
                category: HarmCategory::Harassment,
                threshold: HarmBlockThreshold::BlockMediumAndAbove,
            },
            SafetySetting {
                category: HarmCategory::DangerousContent,
                threshold: HarmBlockThreshold::BlockOnlyHigh,
            },
        ]
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_output_tokens: 1024,
            temperature: 0.4,
            top_p: 0.95,
            safety_settings: Self::default_safety_settings(),
        }
    }
}

/// A generic client for interacting with an LLM.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Sends the conversation with the system `instruction` and returns the
    /// model's reply. A reply withheld by the provider comes back as
    /// `LlmResponse { content: None }` rather than an error.
    async fn generate(
        &self,
        instruction: &str,
        request: &LlmRequest,
        config: &GenerationConfig,
    ) -> Result<LlmResponse>;
}

// --- Gemini ---

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    system_instruction: SystemInstruction<'a>,
    contents: &'a [Content],
    generation_config: GeminiGenerationConfig,
    safety_settings: &'a [SafetySetting],
}

#[derive(Serialize)]
struct SystemInstruction<'a> {
    parts: [TextPart<'a>; 1],
}

#[derive(Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    max_output_tokens: u32,
    temperature: f32,
    top_p: f32,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

/// Talks to the Gemini `generateContent` REST endpoint, which accepts the
/// per-category safety settings natively.
pub struct GeminiClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    api_base: String,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            api_base: GEMINI_API_BASE.to_string(),
        }
    }

    fn url(&self) -> String {
        let model = self.model.trim_start_matches("models/");
        format!("{}/models/{}:generateContent", self.api_base, model)
    }

    fn into_response(parsed: GenerateContentResponse) -> LlmResponse {
        if let Some(reason) = parsed.prompt_feedback.and_then(|f| f.block_reason) {
            debug!(%reason, "Gemini blocked the prompt");
            return LlmResponse::default();
        }

        let Some(candidate) = parsed.candidates.into_iter().next() else {
            return LlmResponse::default();
        };
        let parts: Vec<Part> = candidate
            .content
            .map(|c| c.parts)
            .unwrap_or_default()
            .into_iter()
            .filter(|p| p.text.as_deref().is_some_and(|t| !t.is_empty()))
            .collect();

        if parts.is_empty() {
            debug!(finish_reason = ?candidate.finish_reason, "Gemini returned no text");
            return LlmResponse::default();
        }
        LlmResponse::from_content(Content {
            role: Role::Model,
            parts,
        })
    }
}

#[async_trait]
impl LLMClient for GeminiClient {
    async fn generate(
        &self,
        instruction: &str,
        request: &LlmRequest,
        config: &GenerationConfig,
    ) -> Result<LlmResponse> {
        let body = GenerateContentRequest {
            system_instruction: SystemInstruction {
                parts: [TextPart { text: instruction }],
            },
            contents: &request.contents,
            generation_config: GeminiGenerationConfig {
                max_output_tokens: config.max_output_tokens,
                temperature: config.temperature,
                top_p: config.top_p,
            },
            safety_settings: &config.safety_settings,
        };

        let response = self
            .client
            .post(self.url())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("Failed to reach Gemini API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Gemini API error ({status}): {error_text}"));
        }

        let parsed: GenerateContentResponse = response
            .json()
            .await
            .context("Failed to decode Gemini response")?;
        Ok(Self::into_response(parsed))
    }
}

// --- OpenAI-compatible ---

/// An implementation of `LLMClient` for any OpenAI-compatible API.
pub struct OpenAICompatibleClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAICompatibleClient {
    /// Creates a new client for an OpenAI-compatible service.
    ///
    /// # Arguments
    ///
    /// * `config` - The configuration for the OpenAI client, including API key and base URL.
    /// * `model` - The specific model identifier to use for chat completions (e.g., "gpt-4o").
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }
}

fn to_chat_messages(
    instruction: &str,
    request: &LlmRequest,
) -> Result<Vec<ChatCompletionRequestMessage>> {
    let mut messages: Vec<ChatCompletionRequestMessage> = vec![
        ChatCompletionRequestSystemMessageArgs::default()
            .content(instruction)
            .build()?
            .into(),
    ];
    for content in &request.contents {
        match content.role {
            Role::User => messages.push(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(content.text())
                    .build()?
                    .into(),
            ),
            Role::Model => messages.push(
                ChatCompletionRequestAssistantMessageArgs::default()
                    .content(content.text())
                    .build()?
                    .into(),
            ),
        }
    }
    Ok(messages)
}

#[async_trait]
impl LLMClient for OpenAICompatibleClient {
    async fn generate(
        &self,
        instruction: &str,
        request: &LlmRequest,
        config: &GenerationConfig,
    ) -> Result<LlmResponse> {
        if !config.safety_settings.is_empty() {
            debug!("Safety settings are not supported by OpenAI-compatible providers; ignoring");
        }

        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(to_chat_messages(instruction, request)?)
            .max_completion_tokens(config.max_output_tokens)
            .temperature(config.temperature)
            .top_p(config.top_p)
            .build()?;

        let response = self.client.chat().create(chat_request).await?;
        let text = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .filter(|text| !text.is_empty());

        Ok(LlmResponse {
            content: text.map(Content::model),
        })
    }
}
