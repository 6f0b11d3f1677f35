//! Conversation Messages
//!
//! Role-tagged text messages exchanged between the student and the model,
//! plus the request/response envelopes the guards inspect.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The author of a piece of conversation content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Model => write!(f, "model"),
        }
    }
}

/// A single part of a message. Parts without text are legal and are
/// ignored by the guards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
        }
    }
}

/// A role plus an ordered sequence of parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![Part::text(text)],
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            parts: vec![Part::text(text)],
        }
    }

    /// Joins the text of every part with newlines.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// The conversation about to be sent to the model.
///
/// The system instruction travels separately so that it is never mistaken
/// for a user turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LlmRequest {
    pub contents: Vec<Content>,
}

/// What the model produced for one request. `content` is `None` when the
/// provider blocked or otherwise withheld the candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LlmResponse {
    pub content: Option<Content>,
}

impl LlmResponse {
    pub fn from_content(content: Content) -> Self {
        Self {
            content: Some(content),
        }
    }
}
