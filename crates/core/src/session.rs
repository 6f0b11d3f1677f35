//! Session Validation
//!
//! A session is one student's conversation about one day's lesson. It stays
//! `Active` while the student keeps talking and becomes `Expired` once it has
//! been idle for longer than the timeout. Expired sessions are never revived;
//! the caller starts a new one.

use crate::message::Content;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Idle period after which a session is considered expired.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::minutes(60);

/// Lifecycle of a session. `Expired` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Expired,
}

/// Typed per-session state: the lesson the session is scoped to and the
/// last time the student was active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub topic: String,
    pub class_name: String,
    pub teacher: String,
    pub subject: String,
    pub lesson_date: NaiveDate,
    /// `None` when the timestamp was never recorded or could not be parsed.
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub last_active: Option<DateTime<Utc>>,
}

/// A conversation context bound to one user and one day's lesson.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: String,
    pub app_name: String,
    pub status: SessionStatus,
    pub state: SessionState,
    /// The formatted system instruction, built once when the session starts.
    pub instruction: String,
    /// Conversation history as the model sees it.
    pub history: Vec<Content>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        user_id: impl Into<String>,
        app_name: impl Into<String>,
        state: SessionState,
        instruction: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            app_name: app_name.into(),
            status: SessionStatus::Active,
            state,
            instruction,
            history: Vec::new(),
            created_at: now,
        }
    }

    /// Records activity at `now`.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.state.last_active = Some(now);
    }

    pub fn expire(&mut self) {
        self.status = SessionStatus::Expired;
    }

    /// True if the session is marked expired or has been idle too long.
    pub fn is_expired_at(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.status == SessionStatus::Expired || is_expired(&self.state, now, timeout)
    }
}

/// Returns whether a session with `state` has expired at `now`.
///
/// A session without a usable `last_active` timestamp is treated as expired.
/// Otherwise it is expired only if strictly more than `timeout` has elapsed.
pub fn is_expired(state: &SessionState, now: DateTime<Utc>, timeout: Duration) -> bool {
    match state.last_active {
        Some(last_active) => now.signed_duration_since(last_active) > timeout,
        None => true,
    }
}

/// Same rule as [`is_expired`], applied to a loose key/value state map such
/// as one loaded from an external session service.
pub fn is_expired_raw(state: &serde_json::Value, now: DateTime<Utc>, timeout: Duration) -> bool {
    match state
        .get("last_active")
        .and_then(|v| v.as_str())
        .and_then(parse_last_active)
    {
        Some(last_active) => now.signed_duration_since(last_active) > timeout,
        None => true,
    }
}

/// Parses an ISO-8601 timestamp. Offset-less timestamps are taken as UTC.
pub fn parse_last_active(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    raw.parse::<NaiveDateTime>()
        .ok()
        .map(|naive| naive.and_utc())
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(|v| v.as_str())
        .and_then(parse_last_active))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn state_with(last_active: Option<DateTime<Utc>>) -> SessionState {
        SessionState {
            topic: "Rational Numbers".to_string(),
            class_name: "8".to_string(),
            teacher: "Rahul Nair".to_string(),
            subject: "Mathematics".to_string(),
            lesson_date: NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(),
            last_active,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_ninety_minutes_idle_is_expired() {
        let state = state_with(Some(now() - Duration::minutes(90)));
        assert!(is_expired(&state, now(), DEFAULT_SESSION_TIMEOUT));
    }

    #[test]
    fn test_five_minutes_idle_is_active() {
        let state = state_with(Some(now() - Duration::minutes(5)));
        assert!(!is_expired(&state, now(), DEFAULT_SESSION_TIMEOUT));
    }

    #[test]
    fn test_exact_timeout_is_not_expired() {
        let state = state_with(Some(now() - Duration::minutes(60)));
        assert!(!is_expired(&state, now(), DEFAULT_SESSION_TIMEOUT));

        let state = state_with(Some(now() - Duration::minutes(60) - Duration::seconds(1)));
        assert!(is_expired(&state, now(), DEFAULT_SESSION_TIMEOUT));
    }

    #[test]
    fn test_missing_timestamp_is_expired() {
        assert!(is_expired(&state_with(None), now(), DEFAULT_SESSION_TIMEOUT));
    }

    #[test]
    fn test_future_timestamp_is_active() {
        let state = state_with(Some(now() + Duration::minutes(10)));
        assert!(!is_expired(&state, now(), DEFAULT_SESSION_TIMEOUT));
    }

    #[test]
    fn test_verdict_is_stable_for_same_inputs() {
        let state = state_with(Some(now() - Duration::minutes(59)));
        let first = is_expired(&state, now(), DEFAULT_SESSION_TIMEOUT);
        for _ in 0..10 {
            assert_eq!(is_expired(&state, now(), DEFAULT_SESSION_TIMEOUT), first);
        }
    }

    #[test]
    fn test_raw_state_scenarios() {
        let ninety_ago = (now() - Duration::minutes(90)).to_rfc3339();
        let five_ago = (now() - Duration::minutes(5)).to_rfc3339();

        assert!(is_expired_raw(&json!({ "last_active": ninety_ago }), now(), DEFAULT_SESSION_TIMEOUT));
        assert!(!is_expired_raw(&json!({ "last_active": five_ago }), now(), DEFAULT_SESSION_TIMEOUT));
        assert!(is_expired_raw(&json!({}), now(), DEFAULT_SESSION_TIMEOUT));
        assert!(is_expired_raw(&json!({ "last_active": "yesterday" }), now(), DEFAULT_SESSION_TIMEOUT));
        assert!(is_expired_raw(&json!({ "last_active": 1720000000 }), now(), DEFAULT_SESSION_TIMEOUT));
    }

    #[test]
    fn test_parse_naive_iso_timestamp_as_utc() {
        let parsed = parse_last_active("2025-07-01T11:30:00.123456").unwrap();
        assert_eq!(parsed.timestamp(), now().timestamp() - 30 * 60);
        assert!(parse_last_active("2025-07-01T11:30:00").is_some());
        assert!(parse_last_active("2025-07-01T11:30:00+05:30").is_some());
        assert!(parse_last_active("not a time").is_none());
    }

    #[test]
    fn test_state_deserializes_bad_timestamp_as_none() {
        let state: SessionState = serde_json::from_value(json!({
            "topic": "Fractions",
            "class_name": "7",
            "teacher": "A. Teacher",
            "subject": "Mathematics",
            "lesson_date": "2025-07-01",
            "last_active": "garbage"
        }))
        .unwrap();
        assert_eq!(state.last_active, None);

        let state: SessionState = serde_json::from_value(json!({
            "topic": "Fractions",
            "class_name": "7",
            "teacher": "A. Teacher",
            "subject": "Mathematics",
            "lesson_date": "2025-07-01"
        }))
        .unwrap();
        assert_eq!(state.last_active, None);
    }

    #[test]
    fn test_expired_status_is_terminal() {
        let mut session = Session::new(
            "123",
            "ai_teaching_assistant",
            state_with(Some(now())),
            "instruction".to_string(),
            now(),
        );
        assert!(!session.is_expired_at(now(), DEFAULT_SESSION_TIMEOUT));

        session.expire();
        session.touch(now());
        assert!(session.is_expired_at(now(), DEFAULT_SESSION_TIMEOUT));
    }
}
