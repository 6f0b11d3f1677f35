//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the REST API and OpenAPI documentation.

use crate::{
    handlers,
    models::{
        ErrorResponse, LessonView, MessageView, ReplyView, SendMessagePayload, SessionView,
        StudentView,
    },
    state::AppState,
};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::create_session,
        handlers::get_session,
        handlers::send_message,
        handlers::today_lesson,
        handlers::class_roster,
    ),
    components(
        schemas(SessionView, MessageView, SendMessagePayload, ReplyView, LessonView, StudentView, ErrorResponse)
    ),
    tags(
        (name = "Recap API", description = "Lesson recap sessions for students")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/sessions", post(handlers::create_session))
        .route("/sessions/{id}", get(handlers::get_session))
        .route("/sessions/{id}/messages", post(handlers::send_message))
        .route("/lessons/today", get(handlers::today_lesson))
        .route("/classes/{class_name}/roster", get(handlers::class_roster))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
