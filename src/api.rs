use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::controller::{QuestionView, ReviewController};
use crate::error::{ErrorBody, VaultError};
use crate::models::ReviewSession;

#[derive(Clone)]
pub struct ApiState {
    pub controller: Arc<ReviewController>,
}

pub fn app_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/review/start", post(start_session))
        .route("/api/review/submit", post(submit_answer))
        .route("/api/review/sessions/:id", get(get_session))
        .route("/api/review/sessions/:id/question", post(request_question))
        .route("/api/review/due", get(due_topics))
        .route("/api/topics", post(create_topic))
        .route("/api/topics/:id", get(get_topic))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
    topic_ids: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    session_id: String,
    first_question: QuestionView,
}

async fn start_session(
    State(state): State<ApiState>,
    Json(payload): Json<StartRequest>,
) -> Result<impl IntoResponse, VaultError> {
    let started = state.controller.start_session(payload.topic_ids).await?;
    let body = StartResponse {
        session_id: started.session.id,
        first_question: started.first_question,
    };
    Ok((StatusCode::CREATED, Json(body)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRequest {
    session_id: String,
    topic_id: String,
    answer: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    passed: bool,
    feedback: String,
    next_question: Option<QuestionView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_question_error: Option<ErrorBody>,
    session_complete: bool,
    pass_count: u32,
    fail_count: u32,
}

async fn submit_answer(
    State(state): State<ApiState>,
    Json(payload): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, VaultError> {
    let outcome = state
        .controller
        .submit_answer(&payload.session_id, &payload.topic_id, &payload.answer)
        .await?;

    Ok(Json(SubmitResponse {
        passed: outcome.passed,
        feedback: outcome.feedback,
        next_question: outcome.next_question,
        next_question_error: outcome.next_question_error,
        session_complete: outcome.session_complete,
        pass_count: outcome.pass_count,
        fail_count: outcome.fail_count,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    session: ReviewSession,
    current_question: Option<QuestionView>,
}

async fn get_session(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, VaultError> {
    let view = state.controller.get_session(&id).await?;
    Ok(Json(SessionResponse {
        session: view.session,
        current_question: view.current_question,
    }))
}

#[derive(Serialize)]
struct QuestionResponse {
    question: QuestionView,
}

async fn request_question(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<QuestionResponse>, VaultError> {
    let question = state.controller.request_question(&id).await?;
    Ok(Json(QuestionResponse { question }))
}

#[derive(Deserialize)]
struct DueQuery {
    limit: Option<usize>,
}

async fn due_topics(
    State(state): State<ApiState>,
    Query(query): Query<DueQuery>,
) -> Result<impl IntoResponse, VaultError> {
    let limit = query.limit.unwrap_or(state.controller.settings().max_batch_size);
    let topics = state.controller.due_topics(limit).await?;
    Ok(Json(topics))
}

#[derive(Deserialize)]
struct CreateTopicRequest {
    title: String,
    content: Option<String>,
}

async fn create_topic(
    State(state): State<ApiState>,
    Json(payload): Json<CreateTopicRequest>,
) -> Result<impl IntoResponse, VaultError> {
    let topic = state.controller.create_topic(&payload.title, payload.content).await?;
    Ok((StatusCode::CREATED, Json(topic)))
}

async fn get_topic(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, VaultError> {
    let topic = state.controller.get_topic(&id).await?;
    Ok(Json(topic))
}

#[cfg(test)]
#[path = "api_tests.rs"]
mod tests;
