// Web服务器模块

pub mod handlers;
pub mod state;

pub use state::AppState;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use serde::Serialize;

use crate::error::DownloadError;

/// 统一响应结构
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    /// 状态码 (0: 成功, 其他: 错误码)
    pub code: i32,
    /// 消息
    pub message: String,
    /// 数据
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            message: "Success".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, message: String) -> Self {
        Self {
            code,
            message,
            data: None,
        }
    }
}

impl IntoResponse for DownloadError {
    fn into_response(self) -> Response {
        let status = match &self {
            DownloadError::Validation(_) => StatusCode::BAD_REQUEST,
            DownloadError::NotFound(_) => StatusCode::NOT_FOUND,
            DownloadError::InvalidState { .. } => StatusCode::CONFLICT,
            DownloadError::Persistence(_) | DownloadError::Executor(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(ApiResponse::<()>::error(
            status.as_u16() as i32,
            self.to_string(),
        ));
        (status, body).into_response()
    }
}

/// 构建 API 路由
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/tasks", post(handlers::create_task))
        .route("/tasks", get(handlers::list_tasks))
        .route("/tasks/query", post(handlers::raw_query_tasks))
        .route("/tasks/cancel-all", post(handlers::cancel_all_tasks))
        .route("/tasks/:id", get(handlers::get_task))
        .route("/tasks/:id", delete(handlers::remove_task))
        .route("/tasks/:id/pause", post(handlers::pause_task))
        .route("/tasks/:id/resume", post(handlers::resume_task))
        .route("/tasks/:id/retry", post(handlers::retry_task))
        .route("/tasks/:id/cancel", post(handlers::cancel_task))
        .route("/tasks/:id/open", post(handlers::open_task))
        .with_state(state)
}
