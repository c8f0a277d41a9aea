//! HTTP Ingress (C5).

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use textproc_core::model::{ProcessTextRequest, TaskDto, TaskIdResponse};
use textproc_producer::PublishError;
use uuid::Uuid;

use crate::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/process-text", post(process_text))
        .route("/results/:task_id", get(get_result))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::auth::require_basic_auth,
        ))
        .with_state(state)
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn validation(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: "task not found".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

async fn process_text(
    State(state): State<AppState>,
    Json(req): Json<ProcessTextRequest>,
) -> Result<Response, ApiError> {
    validate_request(&req, state.config.article_max_length)?;

    let task_id = req.task_id.unwrap_or_else(Uuid::new_v4);

    if state
        .store
        .exists(task_id)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?
    {
        return Ok((StatusCode::OK, Json(TaskIdResponse { task_id })).into_response());
    }

    let body = TaskDto {
        original_text: req.text,
        r#type: req.r#type,
    };

    // Publish before persist (§9 open question: resolved as designed).
    state
        .producer
        .send(&body, Some(task_id))
        .await
        .map_err(|err| match err {
            PublishError::NotAcked(_) => ApiError::internal("broker did not confirm publish"),
            other => ApiError::internal(other.to_string()),
        })?;

    match state.store.create(task_id, req.r#type).await {
        Ok(()) => Ok((StatusCode::CREATED, Json(TaskIdResponse { task_id })).into_response()),
        Err(textproc_core::StoreError::AlreadyExists(_)) => {
            Ok((StatusCode::OK, Json(TaskIdResponse { task_id })).into_response())
        }
        Err(err) => Err(ApiError::internal(err.to_string())),
    }
}

fn validate_request(req: &ProcessTextRequest, article_max_length: usize) -> Result<(), ApiError> {
    if req.text.trim().is_empty() {
        return Err(ApiError::validation("text must contain a non-whitespace character"));
    }
    let (min, max) = req.r#type.length_bounds(article_max_length);
    let len = req.text.chars().count();
    if len < min || len > max {
        return Err(ApiError::validation(format!(
            "text length {len} out of bounds [{min}, {max}] for type"
        )));
    }
    Ok(())
}

async fn get_result(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<textproc_core::Task>, ApiError> {
    let task = state
        .store
        .get(task_id)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?
        .ok_or_else(ApiError::not_found)?;
    Ok(Json(task))
}

#[cfg(test)]
mod tests {
    use super::*;
    use textproc_core::model::TextType;

    fn req(r#type: TextType, text: &str) -> ProcessTextRequest {
        ProcessTextRequest {
            task_id: None,
            r#type,
            text: text.to_string(),
        }
    }

    #[test]
    fn rejects_blank_text() {
        let err = validate_request(&req(TextType::ChatItem, "   "), 1_000_000).unwrap_err();
        assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn rejects_chat_item_over_length_bound() {
        let long = "a".repeat(301);
        assert!(validate_request(&req(TextType::ChatItem, &long), 1_000_000).is_err());
    }

    #[test]
    fn accepts_chat_item_within_bounds() {
        assert!(validate_request(&req(TextType::ChatItem, "hi there"), 1_000_000).is_ok());
    }

    #[test]
    fn rejects_article_under_minimum_length() {
        let short = "a".repeat(299_999);
        assert!(validate_request(&req(TextType::Article, &short), 1_000_000).is_err());
    }

    #[test]
    fn accepts_article_at_minimum_length() {
        let exact = "a".repeat(300_000);
        assert!(validate_request(&req(TextType::Article, &exact), 1_000_000).is_ok());
    }
}
