use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

/// 下载任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// 已入队，等待引擎启动
    Enqueued,
    /// 传输中
    Running,
    /// 已暂停（保留部分字节）
    Paused,
    /// 已完成
    Complete,
    /// 失败
    Failed,
    /// 已取消
    Canceled,
}

impl DownloadStatus {
    /// 终态：该 ID 不会再有引擎活动
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Canceled)
    }

    /// 活动状态：引擎可能正在或即将处理
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Enqueued | Self::Running | Self::Paused)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "enqueued" => Some(Self::Enqueued),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

/// 入队请求参数
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadRequest {
    /// 下载地址
    pub url: String,
    /// 保存目录（必须为已存在的绝对路径）
    pub saved_dir: PathBuf,
    /// 保存文件名，缺省时从 URL 推导
    #[serde(default)]
    pub file_name: Option<String>,
    /// 附加请求头，原样传给引擎
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// 通知偏好（本层只存储透传，不做渲染）
    #[serde(default)]
    pub show_notification: bool,
    #[serde(default)]
    pub open_file_from_notification: bool,
    /// 策略标记，透传给引擎
    #[serde(default)]
    pub requires_storage_not_low: bool,
    #[serde(default)]
    pub save_in_public_storage: bool,
}

/// 下载任务记录
///
/// 一次下载尝试对应一条记录。resume/retry 不复用旧 ID，
/// 而是新建记录并通过 `superseded_by` 把旧记录链到新记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    /// 任务ID（创建时分配，不可变，永不复用）
    pub id: String,
    /// 下载地址
    pub url: String,
    /// 保存目录
    pub saved_dir: PathBuf,
    /// 文件名（已解析）
    pub file_name: String,
    /// 请求头
    pub headers: HashMap<String, String>,
    /// 任务状态
    pub status: DownloadStatus,
    /// 进度百分比 0-100，仅在 Running/Paused/Complete 下有意义
    pub progress: i8,
    /// 已下载字节数
    pub bytes_downloaded: u64,
    /// 总字节数，引擎报告前未知
    pub bytes_total: Option<u64>,
    /// 创建时间 (Unix timestamp)
    pub time_created: i64,
    /// 通知偏好
    pub show_notification: bool,
    pub open_file_from_notification: bool,
    /// 策略标记
    pub requires_storage_not_low: bool,
    pub save_in_public_storage: bool,
    /// 是否可断点续传（由引擎探测后回写）
    pub resumable: bool,
    /// 被后继任务取代时记录新任务 ID，部分产物所有权随之转移
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
    /// 失败原因
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DownloadTask {
    pub fn new(req: &DownloadRequest, file_name: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            url: req.url.clone(),
            saved_dir: req.saved_dir.clone(),
            file_name,
            headers: req.headers.clone(),
            status: DownloadStatus::Enqueued,
            progress: 0,
            bytes_downloaded: 0,
            bytes_total: None,
            time_created: chrono::Utc::now().timestamp(),
            show_notification: req.show_notification,
            open_file_from_notification: req.open_file_from_notification,
            requires_storage_not_low: req.requires_storage_not_low,
            save_in_public_storage: req.save_in_public_storage,
            resumable: false,
            superseded_by: None,
            error: None,
        }
    }

    /// 基于暂停的旧任务创建续传任务，继承部分产物与字节偏移
    pub fn new_resumed(old: &DownloadTask, requires_storage_not_low: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            url: old.url.clone(),
            saved_dir: old.saved_dir.clone(),
            file_name: old.file_name.clone(),
            headers: old.headers.clone(),
            status: DownloadStatus::Enqueued,
            progress: old.progress,
            bytes_downloaded: old.bytes_downloaded,
            bytes_total: old.bytes_total,
            time_created: chrono::Utc::now().timestamp(),
            show_notification: old.show_notification,
            open_file_from_notification: old.open_file_from_notification,
            requires_storage_not_low,
            save_in_public_storage: old.save_in_public_storage,
            resumable: old.resumable,
            superseded_by: None,
            error: None,
        }
    }

    /// 基于失败/取消的旧任务创建重试任务，从 0 字节开始
    pub fn new_retried(old: &DownloadTask, requires_storage_not_low: bool) -> Self {
        let mut task = Self::new_resumed(old, requires_storage_not_low);
        task.progress = 0;
        task.bytes_downloaded = 0;
        task.bytes_total = None;
        task
    }

    /// 目标文件完整路径
    pub fn target_path(&self) -> PathBuf {
        self.saved_dir.join(&self.file_name)
    }

    /// 进行中的部分产物路径
    pub fn partial_path(&self) -> PathBuf {
        self.saved_dir.join(format!("{}.part", self.file_name))
    }

    /// 标记为传输中
    pub fn mark_running(&mut self) {
        self.status = DownloadStatus::Running;
    }

    /// 标记为已完成
    pub fn mark_complete(&mut self) {
        self.status = DownloadStatus::Complete;
        self.progress = 100;
        if let Some(total) = self.bytes_total {
            self.bytes_downloaded = total;
        }
    }

    /// 标记为失败
    pub fn mark_failed(&mut self, error: String) {
        self.status = DownloadStatus::Failed;
        self.error = Some(error);
    }

    /// 标记为暂停，进度冻结
    pub fn mark_paused(&mut self) {
        self.status = DownloadStatus::Paused;
    }

    /// 标记为已取消
    pub fn mark_canceled(&mut self) {
        self.status = DownloadStatus::Canceled;
    }

    /// 从 URL 推导文件名，推导不出时退回任务 ID
    pub fn derive_file_name(url: &str, id_fallback: &str) -> String {
        let trimmed = url.split(['?', '#']).next().unwrap_or(url);
        // 去掉 scheme://host 前缀后取最后一个路径段
        let without_scheme = trimmed
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(trimmed);
        let name = match without_scheme.split_once('/') {
            Some((_, path)) => path.rsplit('/').next().unwrap_or(""),
            None => "",
        };
        if name.is_empty() {
            id_fallback.to_string()
        } else {
            urlencoding::decode(name)
                .map(|s| s.to_string())
                .unwrap_or_else(|_| name.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str) -> DownloadRequest {
        DownloadRequest {
            url: url.to_string(),
            saved_dir: PathBuf::from("/tmp"),
            file_name: None,
            headers: HashMap::new(),
            show_notification: false,
            open_file_from_notification: false,
            requires_storage_not_low: false,
            save_in_public_storage: false,
        }
    }

    #[test]
    fn test_task_creation() {
        let task = DownloadTask::new(&request("http://x/file.zip"), "file.zip".to_string());

        assert_eq!(task.status, DownloadStatus::Enqueued);
        assert_eq!(task.progress, 0);
        assert_eq!(task.bytes_downloaded, 0);
        assert!(task.bytes_total.is_none());
        assert!(task.superseded_by.is_none());
    }

    #[test]
    fn test_status_transitions() {
        let mut task = DownloadTask::new(&request("http://x/a.bin"), "a.bin".to_string());

        task.mark_running();
        assert_eq!(task.status, DownloadStatus::Running);

        task.mark_paused();
        assert_eq!(task.status, DownloadStatus::Paused);

        task.mark_failed("connection reset".to_string());
        assert_eq!(task.status, DownloadStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("connection reset"));

        task.bytes_total = Some(1000);
        task.mark_complete();
        assert_eq!(task.status, DownloadStatus::Complete);
        assert_eq!(task.progress, 100);
        assert_eq!(task.bytes_downloaded, 1000);
    }

    #[test]
    fn test_terminal_states() {
        assert!(DownloadStatus::Complete.is_terminal());
        assert!(DownloadStatus::Failed.is_terminal());
        assert!(DownloadStatus::Canceled.is_terminal());
        assert!(!DownloadStatus::Paused.is_terminal());
        assert!(DownloadStatus::Enqueued.is_active());
    }

    #[test]
    fn test_resumed_task_inherits_offset() {
        let mut old = DownloadTask::new(&request("http://x/big.iso"), "big.iso".to_string());
        old.bytes_downloaded = 4096;
        old.bytes_total = Some(8192);
        old.progress = 50;
        old.mark_paused();

        let resumed = DownloadTask::new_resumed(&old, true);
        assert_ne!(resumed.id, old.id);
        assert_eq!(resumed.bytes_downloaded, 4096);
        assert_eq!(resumed.progress, 50);
        assert_eq!(resumed.file_name, "big.iso");
        assert_eq!(resumed.status, DownloadStatus::Enqueued);
        assert!(resumed.requires_storage_not_low);
    }

    #[test]
    fn test_retried_task_starts_from_zero() {
        let mut old = DownloadTask::new(&request("http://x/big.iso"), "big.iso".to_string());
        old.bytes_downloaded = 4096;
        old.bytes_total = Some(8192);
        old.mark_failed("timeout".to_string());

        let retried = DownloadTask::new_retried(&old, false);
        assert_ne!(retried.id, old.id);
        assert_eq!(retried.bytes_downloaded, 0);
        assert_eq!(retried.progress, 0);
        assert!(retried.bytes_total.is_none());
    }

    #[test]
    fn test_derive_file_name() {
        assert_eq!(
            DownloadTask::derive_file_name("http://host/a/b/report.pdf?x=1", "id"),
            "report.pdf"
        );
        assert_eq!(
            DownloadTask::derive_file_name("http://host/%E6%96%87%E6%A1%A3.zip", "id"),
            "文档.zip"
        );
        assert_eq!(DownloadTask::derive_file_name("http://host/", "fallback"), "fallback");
    }
}
