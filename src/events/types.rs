//! 事件类型定义
//!
//! 跨执行上下文传递的不可变事件值。记录本身从不跨边界共享，
//! 只传这些值类型副本

use crate::downloader::DownloadStatus;
use serde::{Deserialize, Serialize};

/// 引擎上报的原始传输事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferEvent {
    pub task_id: String,
    pub status: DownloadStatus,
    pub bytes_downloaded: u64,
    /// 引擎探测出总大小前为 None
    pub bytes_total: Option<u64>,
}

impl TransferEvent {
    pub fn progress(task_id: &str, bytes_downloaded: u64, bytes_total: Option<u64>) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: DownloadStatus::Running,
            bytes_downloaded,
            bytes_total,
        }
    }

    pub fn terminal(task_id: &str, status: DownloadStatus, bytes_downloaded: u64, bytes_total: Option<u64>) -> Self {
        Self {
            task_id: task_id.to_string(),
            status,
            bytes_downloaded,
            bytes_total,
        }
    }

    /// 换算为百分比进度；总大小未知时返回 None
    pub fn percent(&self) -> Option<i8> {
        match self.bytes_total {
            Some(total) if total > 0 => {
                Some(((self.bytes_downloaded.min(total) * 100) / total) as i8)
            }
            _ => None,
        }
    }
}

/// 投递给观察者回调的进度更新
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub task_id: String,
    pub status: DownloadStatus,
    /// 百分比，总大小未知的非终态事件为 -1
    pub progress: i8,
}
