// API处理器模块

use axum::extract::{Path, Query, State};
use axum::response::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ApiResponse, AppState};
use crate::downloader::{DownloadRequest, DownloadStatus, DownloadTask};
use crate::error::{DownloadError, Result};
use crate::store::TaskFilter;

/// 任务列表查询参数
#[derive(Debug, Deserialize, Default)]
pub struct ListQuery {
    /// 逗号分隔的状态集合，如 `running,paused`
    pub status: Option<String>,
    pub created_after: Option<i64>,
    pub created_before: Option<i64>,
    pub url_contains: Option<String>,
}

/// 原生查询请求
#[derive(Debug, Deserialize)]
pub struct RawQueryRequest {
    pub query: String,
}

/// 续传/重试请求体（可省略）
#[derive(Debug, Deserialize, Default)]
pub struct RestartRequest {
    #[serde(default)]
    pub requires_storage_not_low: bool,
}

/// 删除任务查询参数
#[derive(Debug, Deserialize, Default)]
pub struct RemoveQuery {
    #[serde(default)]
    pub delete_content: bool,
}

/// 批量取消响应
#[derive(Debug, Serialize)]
pub struct CancelAllResponse {
    pub canceled: usize,
}

/// POST /api/v1/tasks
/// 创建下载任务
pub async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<DownloadRequest>,
) -> Result<Json<ApiResponse<String>>> {
    let task_id = state.manager.enqueue(req).await?;
    info!("创建下载任务成功: {}", task_id);
    Ok(Json(ApiResponse::success(task_id)))
}

/// GET /api/v1/tasks
/// 查询任务列表（无参数时返回全部）
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ApiResponse<Vec<DownloadTask>>>> {
    let has_filter = query.status.is_some()
        || query.created_after.is_some()
        || query.created_before.is_some()
        || query.url_contains.is_some();

    let tasks = if has_filter {
        let mut statuses = Vec::new();
        if let Some(raw) = &query.status {
            for part in raw.split(',').filter(|s| !s.is_empty()) {
                let status = DownloadStatus::from_str(part).ok_or_else(|| {
                    DownloadError::Validation(format!("未知任务状态: {}", part))
                })?;
                statuses.push(status);
            }
        }
        state.manager.load_tasks_filtered(&TaskFilter {
            statuses,
            created_after: query.created_after,
            created_before: query.created_before,
            url_contains: query.url_contains,
        })?
    } else {
        state.manager.load_tasks()?
    };
    Ok(Json(ApiResponse::success(tasks)))
}

/// POST /api/v1/tasks/query
/// 原生 SQL 查询（仅 SELECT）
pub async fn raw_query_tasks(
    State(state): State<AppState>,
    Json(req): Json<RawQueryRequest>,
) -> Result<Json<ApiResponse<Vec<DownloadTask>>>> {
    let tasks = state.manager.load_tasks_with_raw_query(&req.query)?;
    Ok(Json(ApiResponse::success(tasks)))
}

/// GET /api/v1/tasks/:id
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<DownloadTask>>> {
    let task = state.manager.get_task(&id)?;
    Ok(Json(ApiResponse::success(task)))
}

/// POST /api/v1/tasks/:id/pause
pub async fn pause_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<()>>> {
    state.manager.pause(&id).await?;
    Ok(Json(ApiResponse::success(())))
}

/// POST /api/v1/tasks/:id/resume
/// 返回接续传输的新任务 ID
pub async fn resume_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<RestartRequest>>,
) -> Result<Json<ApiResponse<String>>> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let new_id = state
        .manager
        .resume(&id, req.requires_storage_not_low)
        .await?;
    Ok(Json(ApiResponse::success(new_id)))
}

/// POST /api/v1/tasks/:id/retry
/// 返回重新开始的新任务 ID
pub async fn retry_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<RestartRequest>>,
) -> Result<Json<ApiResponse<String>>> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let new_id = state
        .manager
        .retry(&id, req.requires_storage_not_low)
        .await?;
    Ok(Json(ApiResponse::success(new_id)))
}

/// POST /api/v1/tasks/:id/cancel
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<()>>> {
    state.manager.cancel(&id).await?;
    Ok(Json(ApiResponse::success(())))
}

/// POST /api/v1/tasks/cancel-all
pub async fn cancel_all_tasks(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<CancelAllResponse>>> {
    let canceled = state.manager.cancel_all().await?;
    Ok(Json(ApiResponse::success(CancelAllResponse { canceled })))
}

/// DELETE /api/v1/tasks/:id
pub async fn remove_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> Result<Json<ApiResponse<()>>> {
    state.manager.remove(&id, query.delete_content).await?;
    Ok(Json(ApiResponse::success(())))
}

/// POST /api/v1/tasks/:id/open
/// 返回是否成功唤起系统查看器
pub async fn open_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<bool>>> {
    let opened = state.manager.open(&id).await?;
    Ok(Json(ApiResponse::success(opened)))
}
