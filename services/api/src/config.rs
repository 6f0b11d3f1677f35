use crate::models::MAX_MESSAGE_CHARS;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Defines the supported backend providers for the chat model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Gemini,
}

/// Which toxicity classifier backs the content guard.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClassifierKind {
    Perspective,
    Lexicon,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    /// When unset, sessions live in memory only.
    pub database_url: Option<String>,
    pub provider: Provider,
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub chat_model: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub toxicity_threshold: f32,
    pub classifier: ClassifierKind,
    pub perspective_api_key: Option<String>,
    pub lexicon_path: Option<PathBuf>,
    pub guard_timeout: Duration,
    pub model_timeout: Duration,
    pub session_timeout_minutes: i64,
    /// Longest student message accepted in one turn, in characters.
    pub max_message_chars: usize,
    pub lesson_sheet_id: Option<String>,
    pub sheets_api_key: Option<String>,
    pub lesson_range: String,
    pub roster_range: String,
    pub lesson_plan_path: PathBuf,
    pub log_level: Level,
    pub prompts_path: PathBuf,
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_var(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        None => Ok(default),
    }
}

fn check_range(name: &str, value: f32, min: f32, max: f32) -> Result<f32, ConfigError> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue(
            name.to_string(),
            format!("{value} is outside [{min}, {max}]"),
        ))
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address = parse_var("BIND_ADDRESS", SocketAddr::from(([0, 0, 0, 0], 3000)))?;
        let database_url = optional_var("DATABASE_URL");

        let provider = match optional_var("LLM_PROVIDER")
            .unwrap_or_else(|| "gemini".to_string())
            .to_lowercase()
            .as_str()
        {
            "gemini" => Provider::Gemini,
            "openai" => Provider::OpenAI,
            other => {
                return Err(ConfigError::InvalidValue(
                    "LLM_PROVIDER".to_string(),
                    format!("'{other}' is not one of gemini, openai"),
                ));
            }
        };

        let openai_api_key = optional_var("OPENAI_API_KEY");
        let gemini_api_key = optional_var("GEMINI_API_KEY");

        let chat_model =
            optional_var("CHAT_MODEL").unwrap_or_else(|| recap_core::llm_client::DEFAULT_MODEL.to_string());
        let max_output_tokens = parse_var("MAX_OUTPUT_TOKENS", 1024u32)?;
        let temperature = check_range("TEMPERATURE", parse_var("TEMPERATURE", 0.4f32)?, 0.0, 2.0)?;
        let top_p = check_range("TOP_P", parse_var("TOP_P", 0.95f32)?, 0.0, 1.0)?;

        let toxicity_threshold = check_range(
            "TOXICITY_THRESHOLD",
            parse_var("TOXICITY_THRESHOLD", 0.3f32)?,
            0.0,
            1.0,
        )?;
        let classifier = match optional_var("CLASSIFIER")
            .unwrap_or_else(|| "perspective".to_string())
            .to_lowercase()
            .as_str()
        {
            "perspective" => ClassifierKind::Perspective,
            "lexicon" => ClassifierKind::Lexicon,
            other => {
                return Err(ConfigError::InvalidValue(
                    "CLASSIFIER".to_string(),
                    format!("'{other}' is not one of perspective, lexicon"),
                ));
            }
        };
        let perspective_api_key = optional_var("PERSPECTIVE_API_KEY");
        let lexicon_path = optional_var("LEXICON_PATH").map(PathBuf::from);

        let guard_timeout = Duration::from_secs(parse_var("GUARD_TIMEOUT_SECS", 10u64)?);
        let model_timeout = Duration::from_secs(parse_var("MODEL_TIMEOUT_SECS", 60u64)?);
        let session_timeout_minutes = parse_var("SESSION_TIMEOUT_MINUTES", 60i64)?;
        if session_timeout_minutes <= 0 {
            return Err(ConfigError::InvalidValue(
                "SESSION_TIMEOUT_MINUTES".to_string(),
                "must be positive".to_string(),
            ));
        }
        let max_message_chars = parse_var("MAX_MESSAGE_CHARS", MAX_MESSAGE_CHARS)?;
        if max_message_chars == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_MESSAGE_CHARS".to_string(),
                "must be positive".to_string(),
            ));
        }

        let lesson_sheet_id = optional_var("LESSON_SHEET_ID");
        let sheets_api_key = optional_var("SHEETS_API_KEY");
        let lesson_range = optional_var("LESSON_RANGE").unwrap_or_else(|| "Lessons!A:E".to_string());
        let roster_range = optional_var("ROSTER_RANGE").unwrap_or_else(|| "Roster!A:C".to_string());
        let lesson_plan_path = optional_var("LESSON_PLAN_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./lesson_plans.json"));

        let log_level_str = optional_var("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let prompts_path = optional_var("PROMPTS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./prompts"));

        match provider {
            Provider::OpenAI => {
                if openai_api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "OPENAI_API_KEY must be set for 'openai' provider".to_string(),
                    ));
                }
            }
            Provider::Gemini => {
                if gemini_api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "GEMINI_API_KEY must be set for 'gemini' provider".to_string(),
                    ));
                }
            }
        }

        match classifier {
            ClassifierKind::Perspective if perspective_api_key.is_none() => {
                return Err(ConfigError::MissingVar(
                    "PERSPECTIVE_API_KEY must be set for 'perspective' classifier".to_string(),
                ));
            }
            ClassifierKind::Lexicon if lexicon_path.is_none() => {
                return Err(ConfigError::MissingVar(
                    "LEXICON_PATH must be set for 'lexicon' classifier".to_string(),
                ));
            }
            _ => {}
        }

        if lesson_sheet_id.is_some() && sheets_api_key.is_none() {
            return Err(ConfigError::MissingVar(
                "SHEETS_API_KEY must be set when LESSON_SHEET_ID is set".to_string(),
            ));
        }

        Ok(Self {
            bind_address,
            database_url,
            provider,
            openai_api_key,
            gemini_api_key,
            chat_model,
            max_output_tokens,
            temperature,
            top_p,
            toxicity_threshold,
            classifier,
            perspective_api_key,
            lexicon_path,
            guard_timeout,
            model_timeout,
            session_timeout_minutes,
            max_message_chars,
            lesson_sheet_id,
            sheets_api_key,
            lesson_range,
            roster_range,
            lesson_plan_path,
            log_level,
            prompts_path,
        })
    }
}
