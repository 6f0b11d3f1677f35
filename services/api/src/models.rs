//! API Models
//!
//! Request and response bodies of the REST API, documented with `utoipa`.
//! The domain types live in `recap_core`; these are their wire views.

use chrono::{DateTime, NaiveDate, Utc};
use recap_core::{
    lesson::{LessonPlan, StudentContact},
    message::{Content, Role},
    pipeline::{Disposition, TurnOutcome},
    session::{Session, SessionStatus},
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Default for the longest student message accepted in one turn, in characters.
pub const MAX_MESSAGE_CHARS: usize = 4000;

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct MessageView {
    #[schema(value_type = String, example = "user")]
    pub role: Role,
    pub text: String,
}

impl From<&Content> for MessageView {
    fn from(content: &Content) -> Self {
        Self {
            role: content.role,
            text: content.text(),
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct SessionView {
    #[schema(value_type = String, format = Uuid)]
    pub id: Uuid,
    pub user_id: String,
    #[schema(value_type = String, example = "active")]
    pub status: SessionStatus,
    #[schema(example = "Rational Numbers")]
    pub topic: String,
    #[schema(example = "8")]
    pub class_name: String,
    pub teacher: String,
    #[schema(example = "Mathematics")]
    pub subject: String,
    #[schema(value_type = String, format = Date)]
    pub lesson_date: NaiveDate,
    pub last_active: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub history: Vec<MessageView>,
}

impl From<&Session> for SessionView {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id,
            user_id: session.user_id.clone(),
            status: session.status,
            topic: session.state.topic.clone(),
            class_name: session.state.class_name.clone(),
            teacher: session.state.teacher.clone(),
            subject: session.state.subject.clone(),
            lesson_date: session.state.lesson_date,
            last_active: session.state.last_active,
            created_at: session.created_at,
            history: session.history.iter().map(MessageView::from).collect(),
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct SendMessagePayload {
    #[schema(example = "Recap")]
    pub text: String,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct ReplyView {
    pub text: String,
    #[schema(value_type = String, example = "answered")]
    pub disposition: Disposition,
}

impl From<TurnOutcome> for ReplyView {
    fn from(outcome: TurnOutcome) -> Self {
        Self {
            text: outcome.reply.text(),
            disposition: outcome.disposition,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct LessonView {
    #[schema(value_type = String, format = Date)]
    pub date: NaiveDate,
    pub topic: String,
    pub class_name: String,
    pub teacher: String,
    pub subject: String,
}

impl From<LessonPlan> for LessonView {
    fn from(plan: LessonPlan) -> Self {
        Self {
            date: plan.date,
            topic: plan.topic,
            class_name: plan.class_name,
            teacher: plan.teacher,
            subject: plan.subject,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct StudentView {
    pub name: String,
    pub phone: String,
}

impl From<StudentContact> for StudentView {
    fn from(student: StudentContact) -> Self {
        Self {
            name: student.name,
            phone: student.phone,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct ErrorResponse {
    pub message: String,
}
