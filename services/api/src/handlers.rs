//! Axum Handlers for the REST API
//!
//! This module contains the logic for handling HTTP requests for recap sessions,
//! lesson plans and class rosters. It uses `utoipa` doc comments to generate
//! OpenAPI documentation.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{Local, Utc};
use recap_core::{lesson::LessonError, service::AgentError};
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::{
    models::{
        ErrorResponse, LessonView, ReplyView, SendMessagePayload, SessionView,
        StudentView,
    },
    state::AppState,
};

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Gone(String),
    ServiceUnavailable(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Gone(message) => (StatusCode::GONE, message),
            ApiError::ServiceUnavailable(message) => (StatusCode::SERVICE_UNAVAILABLE, message),
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal server error occurred.".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { message })).into_response()
    }
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::NoLessonToday(_) | AgentError::NotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            AgentError::SessionExpired(_) => ApiError::Gone(err.to_string()),
            err if err.is_retryable() => {
                warn!(error = %err, "Turn failed with a retryable error");
                ApiError::ServiceUnavailable(
                    "The assistant is temporarily unavailable. Please try again.".to_string(),
                )
            }
            err => ApiError::InternalServerError(err.into()),
        }
    }
}

impl From<LessonError> for ApiError {
    fn from(err: LessonError) -> Self {
        ApiError::InternalServerError(err.into())
    }
}

fn user_id(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::BadRequest("x-user-id header is required".to_string()))
}

/// Start a recap session for today's lesson.
#[utoipa::path(
    post,
    path = "/sessions",
    responses(
        (status = 201, description = "Session created successfully", body = SessionView),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 404, description = "No lesson plan for today", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("x-user-id" = String, Header, description = "The ID of the student starting the session")
    )
)]
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = user_id(&headers)?;
    let session = state.agent.start_session(user_id, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(SessionView::from(&session))))
}

/// Get a specific session by its ID.
#[utoipa::path(
    get,
    path = "/sessions/{id}",
    responses(
        (status = 200, description = "Session details", body = SessionView),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID"),
        ("x-user-id" = String, Header, description = "The ID of the student")
    )
)]
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, ApiError> {
    let user_id = user_id(&headers)?;
    let session = state.agent.get_session(id, user_id, Utc::now()).await?;
    Ok(Json(SessionView::from(&session)))
}

/// Send one student message and receive the guarded reply.
#[utoipa::path(
    post,
    path = "/sessions/{id}/messages",
    request_body = SendMessagePayload,
    responses(
        (status = 200, description = "Reply delivered", body = ReplyView),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 410, description = "Session expired", body = ErrorResponse),
        (status = 503, description = "Content guard or model temporarily unavailable", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID"),
        ("x-user-id" = String, Header, description = "The ID of the student")
    )
)]
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(payload): Json<SendMessagePayload>,
) -> Result<Json<ReplyView>, ApiError> {
    let user_id = user_id(&headers)?;
    let limit = state.config.max_message_chars;
    if payload.text.chars().count() > limit {
        return Err(ApiError::BadRequest(format!(
            "Message exceeds {limit} characters"
        )));
    }

    let outcome = state
        .agent
        .send_message(id, user_id, &payload.text, Utc::now())
        .await?;
    Ok(Json(ReplyView::from(outcome)))
}

/// Get the lesson plan for today.
#[utoipa::path(
    get,
    path = "/lessons/today",
    responses(
        (status = 200, description = "Today's lesson plan", body = LessonView),
        (status = 404, description = "No lesson plan for today", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn today_lesson(
    State(state): State<Arc<AppState>>,
) -> Result<Json<LessonView>, ApiError> {
    let today = Local::now().date_naive();
    let lesson = state.agent.today_lesson(today).await?;
    Ok(Json(LessonView::from(lesson)))
}

/// List the students enrolled in a class.
#[utoipa::path(
    get,
    path = "/classes/{class_name}/roster",
    responses(
        (status = 200, description = "Students of the class", body = [StudentView]),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("class_name" = String, Path, description = "Class name as written in the roster")
    )
)]
pub async fn class_roster(
    State(state): State<Arc<AppState>>,
    Path(class_name): Path<String>,
) -> Result<Json<Vec<StudentView>>, ApiError> {
    let students = state.roster.roster_for(&class_name).await?;
    Ok(Json(students.into_iter().map(StudentView::from).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClassifierKind, Config, Provider};
    use crate::models::MAX_MESSAGE_CHARS;
    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use recap_core::{
        classifier::LexiconClassifier,
        guard::{ClassifierError, GuardConfig, INPUT_FALLBACK, ToxicityClassifier, ToxicityGuard},
        lesson::{LessonPlan, RosterSource, StaticLessonSource, StudentContact},
        llm_client::{GenerationConfig, LLMClient},
        message::{Content, LlmRequest, LlmResponse},
        pipeline::{DEFAULT_MODEL_TIMEOUT, Disposition, RecapPipeline},
        prompt::RecapPrompt,
        service::InMemorySessionStore,
    };
    use serde_json::Value;
    use std::{path::PathBuf, time::Duration};

    struct EchoModel;

    #[async_trait]
    impl LLMClient for EchoModel {
        async fn generate(
            &self,
            _instruction: &str,
            request: &LlmRequest,
            _config: &GenerationConfig,
        ) -> anyhow::Result<LlmResponse> {
            let last = request.contents.last().map(|c| c.text()).unwrap_or_default();
            Ok(LlmResponse::from_content(Content::model(format!(
                "Let's recap: {last}"
            ))))
        }
    }

    struct DownClassifier;

    #[async_trait]
    impl ToxicityClassifier for DownClassifier {
        async fn score(&self, _text: &str) -> Result<f32, ClassifierError> {
            Err(ClassifierError::Unavailable("connection refused".to_string()))
        }
    }

    struct FixedRoster;

    #[async_trait]
    impl RosterSource for FixedRoster {
        async fn roster_for(&self, class_name: &str) -> Result<Vec<StudentContact>, LessonError> {
            Ok(if class_name == "8" {
                vec![StudentContact {
                    name: "Anil".to_string(),
                    phone: "+911234567890".to_string(),
                }]
            } else {
                vec![]
            })
        }
    }

    fn test_config() -> Config {
        Config {
            bind_address: ([127, 0, 0, 1], 0).into(),
            database_url: None,
            provider: Provider::Gemini,
            openai_api_key: None,
            gemini_api_key: Some("test".to_string()),
            chat_model: "gemini-2.5-pro".to_string(),
            max_output_tokens: 1024,
            temperature: 0.4,
            top_p: 0.95,
            toxicity_threshold: 0.3,
            classifier: ClassifierKind::Lexicon,
            perspective_api_key: None,
            lexicon_path: Some(PathBuf::from("lexicon.txt")),
            guard_timeout: Duration::from_secs(10),
            model_timeout: DEFAULT_MODEL_TIMEOUT,
            session_timeout_minutes: 60,
            max_message_chars: MAX_MESSAGE_CHARS,
            lesson_sheet_id: None,
            sheets_api_key: None,
            lesson_range: "Lessons!A:E".to_string(),
            roster_range: "Roster!A:C".to_string(),
            lesson_plan_path: PathBuf::from("./lesson_plans.json"),
            log_level: tracing::Level::INFO,
            prompts_path: PathBuf::from("./prompts"),
        }
    }

    fn state_with(classifier: Arc<dyn ToxicityClassifier>, lessons: Vec<LessonPlan>) -> Arc<AppState> {
        let guard = Arc::new(ToxicityGuard::new(classifier, GuardConfig::default()));
        let pipeline = RecapPipeline::new(
            guard,
            Arc::new(EchoModel),
            GenerationConfig::default(),
            DEFAULT_MODEL_TIMEOUT,
        );
        let agent = recap_core::service::RecapAgent::new(
            Arc::new(InMemorySessionStore::default()),
            Arc::new(StaticLessonSource::new(lessons)),
            RecapPrompt::default(),
            pipeline,
        );
        Arc::new(AppState {
            agent: Arc::new(agent),
            roster: Arc::new(FixedRoster),
            config: Arc::new(test_config()),
        })
    }

    fn todays_lesson() -> LessonPlan {
        LessonPlan {
            date: Local::now().date_naive(),
            topic: "Rational Numbers".to_string(),
            class_name: "8".to_string(),
            teacher: "Rahul Nair".to_string(),
            subject: "Mathematics".to_string(),
        }
    }

    fn app_state() -> Arc<AppState> {
        state_with(
            Arc::new(LexiconClassifier::new(["idiot"])),
            vec![todays_lesson()],
        )
    }

    fn headers(user: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_str(user).unwrap());
        headers
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn new_session(state: &Arc<AppState>) -> Uuid {
        let response = create_session(State(state.clone()), headers("123"))
            .await
            .unwrap()
            .into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        body["id"].as_str().unwrap().parse().unwrap()
    }

    fn message(text: &str) -> Json<SendMessagePayload> {
        Json(SendMessagePayload {
            text: text.to_string(),
        })
    }

    #[tokio::test]
    async fn test_create_session_requires_user_header() {
        let err = create_session(State(app_state()), HeaderMap::new())
            .await
            .err()
            .unwrap();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_session_returns_lesson_scope() {
        let state = app_state();
        let response = create_session(State(state), headers("123"))
            .await
            .unwrap()
            .into_response();
        assert_eq!(response.status(), StatusCode::CREATED);

        let body = body_json(response).await;
        assert_eq!(body["user_id"], "123");
        assert_eq!(body["status"], "active");
        assert_eq!(body["topic"], "Rational Numbers");
        assert_eq!(body["history"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_create_session_without_lesson_is_not_found() {
        let state = state_with(Arc::new(LexiconClassifier::new(["idiot"])), vec![]);
        let err = create_session(State(state), headers("123"))
            .await
            .err()
            .unwrap();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert!(body["message"].as_str().unwrap().contains("No lesson plan"));
    }

    #[tokio::test]
    async fn test_send_message_round_trip() {
        let state = app_state();
        let id = new_session(&state).await;

        let Json(reply) = send_message(State(state.clone()), headers("123"), Path(id), message("Recap"))
            .await
            .unwrap();
        assert_eq!(reply.text, "Let's recap: Recap");

        let Json(session) = get_session(State(state), headers("123"), Path(id))
            .await
            .unwrap();
        assert_eq!(session.history.len(), 2);
    }

    #[tokio::test]
    async fn test_toxic_message_gets_fallback() {
        let state = app_state();
        let id = new_session(&state).await;

        let Json(reply) = send_message(State(state), headers("123"), Path(id), message("you idiot"))
            .await
            .unwrap();
        assert_eq!(reply.text, INPUT_FALLBACK);
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["disposition"], "input_rejected");
    }

    #[tokio::test]
    async fn test_oversized_message_is_bad_request() {
        let state = app_state();
        let id = new_session(&state).await;
        let long = "a".repeat(MAX_MESSAGE_CHARS + 1);

        let err = send_message(State(state), headers("123"), Path(id), message(&long))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_message_limit_comes_from_config() {
        let base = app_state();
        let id = new_session(&base).await;
        let state = Arc::new(AppState {
            agent: base.agent.clone(),
            roster: base.roster.clone(),
            config: Arc::new(Config {
                max_message_chars: 10,
                ..test_config()
            }),
        });

        let err = send_message(State(state.clone()), headers("123"), Path(id), message("ελληνικά κείμενο"))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);

        // Characters are counted, not bytes.
        let reply = send_message(State(state), headers("123"), Path(id), message("ελληνικά"))
            .await
            .unwrap();
        assert_eq!(reply.disposition, Disposition::Answered);
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let err = get_session(State(app_state()), headers("123"), Path(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_other_users_session_is_not_found() {
        let state = app_state();
        let id = new_session(&state).await;
        let err = send_message(State(state), headers("456"), Path(id), message("Recap"))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_idle_session_is_gone() {
        let state = app_state();
        let stale = state
            .agent
            .start_session("123", Utc::now() - chrono::Duration::hours(2))
            .await
            .unwrap();

        let err = send_message(State(state), headers("123"), Path(stale.id), message("Recap"))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::GONE);
    }

    #[tokio::test]
    async fn test_classifier_outage_is_service_unavailable() {
        let state = state_with(Arc::new(DownClassifier), vec![todays_lesson()]);
        let id = new_session(&state).await;

        let err = send_message(State(state), headers("123"), Path(id), message("Recap"))
            .await
            .unwrap_err();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert!(body["message"].as_str().unwrap().contains("try again"));
    }

    #[tokio::test]
    async fn test_today_lesson() {
        let Json(lesson) = today_lesson(State(app_state())).await.unwrap();
        assert_eq!(lesson.topic, "Rational Numbers");
        assert_eq!(lesson.teacher, "Rahul Nair");
    }

    #[tokio::test]
    async fn test_class_roster() {
        let Json(students) = class_roster(State(app_state()), Path("8".to_string()))
            .await
            .unwrap();
        assert_eq!(students.len(), 1);
        assert_eq!(students[0].name, "Anil");

        let Json(empty) = class_roster(State(app_state()), Path("9".to_string()))
            .await
            .unwrap();
        assert!(empty.is_empty());
    }
}
