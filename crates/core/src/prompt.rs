//! Recap Instruction Template
//!
//! Builds the one system instruction a session is started with. The
//! template carries the behavioral rules (topic-only scope, single-asterisk
//! emphasis, fixed refusal phrases, topic/subject footer); this module only
//! substitutes the day's lesson into it.

use crate::lesson::LessonPlan;

/// The bundled instruction template.
pub const DEFAULT_TEMPLATE: &str = include_str!("../prompts/recap_instruction.md");

const PLACEHOLDERS: [&str; 4] = ["{subject}", "{class}", "{teacher}", "{topic}"];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PromptError {
    #[error("Instruction template is missing the {0} placeholder")]
    MissingPlaceholder(&'static str),
}

/// A validated instruction template.
#[derive(Debug, Clone)]
pub struct RecapPrompt {
    template: String,
}

impl Default for RecapPrompt {
    fn default() -> Self {
        Self {
            template: DEFAULT_TEMPLATE.to_string(),
        }
    }
}

impl RecapPrompt {
    /// Accepts a template only if it uses all four lesson placeholders.
    pub fn new(template: impl Into<String>) -> Result<Self, PromptError> {
        let template = template.into();
        if let Some(missing) = PLACEHOLDERS.iter().find(|p| !template.contains(*p)) {
            return Err(PromptError::MissingPlaceholder(missing));
        }
        Ok(Self { template })
    }

    /// Fills the template with `lesson`. Substitution is a single pass, so
    /// lesson values that happen to contain braces are copied verbatim.
    pub fn render(&self, lesson: &LessonPlan) -> String {
        let lookup = |placeholder: &str| match placeholder {
            "{subject}" => Some(lesson.subject.as_str()),
            "{class}" => Some(lesson.class_name.as_str()),
            "{teacher}" => Some(lesson.teacher.as_str()),
            "{topic}" => Some(lesson.topic.as_str()),
            _ => None,
        };

        let mut out = String::with_capacity(self.template.len() + 128);
        let mut rest = self.template.as_str();
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let tail = &rest[open..];
            let substituted = tail
                .find('}')
                .map(|close| &tail[..=close])
                .and_then(|placeholder| lookup(placeholder).map(|v| (placeholder.len(), v)));
            match substituted {
                Some((consumed, value)) => {
                    out.push_str(value);
                    rest = &tail[consumed..];
                }
                None => {
                    out.push('{');
                    rest = &tail[1..];
                }
            }
        }
        out.push_str(rest);
        out
    }
}
