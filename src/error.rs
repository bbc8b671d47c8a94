//! 统一错误类型定义
//!
//! 命令层错误（参数校验、状态机拒绝）同步返回给调用方；
//! 传输层失败不走错误返回，而是以 Failed 状态事件的形式投递

use crate::downloader::DownloadStatus;
use thiserror::Error;

/// 下载管理器错误
#[derive(Debug, Error)]
pub enum DownloadError {
    /// 输入参数非法（目录不存在、step 超出范围等）
    #[error("参数校验失败: {0}")]
    Validation(String),

    /// 当前状态下不允许执行该命令
    #[error("任务 {task_id} 处于 {status:?} 状态，不能执行 {command}")]
    InvalidState {
        task_id: String,
        status: DownloadStatus,
        command: &'static str,
    },

    /// 任务不存在
    #[error("任务不存在: {0}")]
    NotFound(String),

    /// 存储层 I/O 失败
    ///
    /// 发生后调用方不应假设之前的状态仍然有效，需重新读取后再操作
    #[error("持久化失败: {0}")]
    Persistence(#[from] rusqlite::Error),

    /// 传输引擎失败（仅在引导引擎时同步暴露，传输中的失败走 Failed 事件）
    #[error("传输引擎错误: {0}")]
    Executor(String),
}

pub type Result<T> = std::result::Result<T, DownloadError>;

impl DownloadError {
    /// 构造状态机拒绝错误
    pub fn invalid_state(task_id: &str, status: DownloadStatus, command: &'static str) -> Self {
        Self::InvalidState {
            task_id: task_id.to_string(),
            status,
            command,
        }
    }
}
