// Download Hub Rust Library
// 可恢复下载任务生命周期管理核心库

// 配置管理模块
pub mod config;

// 下载域模块
pub mod downloader;

// 错误类型
pub mod error;

// 事件分发模块
pub mod events;

// 本地文件系统辅助模块
pub mod filesystem;

// 日志初始化
pub mod logging;

// Web服务器模块
pub mod server;

// 任务持久化模块
pub mod store;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::info;

use crate::config::DownloadConfig;
use crate::downloader::{DownloadManager, DownloadRequest, DownloadTask, HttpEngine, TransferEngine};
use crate::error::{DownloadError, Result};
use crate::events::{EventDispatcher, ProgressUpdate};
use crate::store::{TaskDb, TaskFilter};

// 导出常用类型
pub use config::AppConfig;
pub use downloader::DownloadStatus;
pub use error::DownloadError as Error;
pub use server::AppState;

/// 进程内已打开的任务库路径，同一路径不允许二次初始化
static OPEN_DB_PATHS: Lazy<Mutex<HashSet<PathBuf>>> = Lazy::new(|| Mutex::new(HashSet::new()));

fn registry_key(path: &Path) -> PathBuf {
    // 数据库文件首轮启动时尚不存在，尽量用父目录的真实路径归一化
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => parent
            .canonicalize()
            .map(|p| p.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

/// 下载器门面
///
/// 构造即完成初始化：打开任务库、装配引擎与事件分发器。
/// 同一数据库路径在进程内只能存在一个活动实例
pub struct Downloader {
    db_key: PathBuf,
    manager: Arc<DownloadManager>,
    dispatcher: Arc<EventDispatcher>,
}

impl Downloader {
    /// 按配置初始化
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        let engine = HttpEngine::new(config.ignore_ssl)
            .map_err(|e| DownloadError::Executor(format!("HTTP 客户端构建失败: {}", e)))?;
        Self::with_engine(config, Arc::new(engine))
    }

    /// 使用自定义引擎初始化（测试注入点）
    pub fn with_engine(
        config: &DownloadConfig,
        engine: Arc<dyn TransferEngine>,
    ) -> Result<Self> {
        let db_path = PathBuf::from(&config.db_path);
        let db_key = registry_key(&db_path);
        {
            let mut open_paths = OPEN_DB_PATHS.lock();
            if !open_paths.insert(db_key.clone()) {
                return Err(DownloadError::Validation(format!(
                    "任务库已被本进程打开: {:?}",
                    db_key
                )));
            }
        }

        let db = match TaskDb::open(&db_path) {
            Ok(db) => Arc::new(db),
            Err(e) => {
                OPEN_DB_PATHS.lock().remove(&db_key);
                return Err(e);
            }
        };

        let dispatcher = Arc::new(EventDispatcher::new());
        let manager = DownloadManager::new(
            db,
            engine,
            dispatcher.clone(),
            Duration::from_secs(config.cancel_ack_timeout_secs),
        );

        info!("下载器初始化完成: db={:?}", db_key);
        Ok(Self {
            db_key,
            manager,
            dispatcher,
        })
    }

    pub fn manager(&self) -> Arc<DownloadManager> {
        self.manager.clone()
    }

    pub fn dispatcher(&self) -> Arc<EventDispatcher> {
        self.dispatcher.clone()
    }

    /// 注册进度观察者回调
    pub fn register_callback<F>(&self, callback: F, step: u8) -> Result<()>
    where
        F: Fn(ProgressUpdate) + Send + Sync + 'static,
    {
        self.dispatcher.register_callback(callback, step)
    }

    /// 注销进度观察者回调
    pub fn unregister_callback(&self) {
        self.dispatcher.unregister_callback()
    }

    /// 入队新任务
    pub async fn enqueue(&self, req: DownloadRequest) -> Result<String> {
        self.manager.enqueue(req).await
    }

    /// 暂停任务
    pub async fn pause(&self, task_id: &str) -> Result<()> {
        self.manager.pause(task_id).await
    }

    /// 续传任务，返回新任务 ID
    pub async fn resume(&self, task_id: &str, requires_storage_not_low: bool) -> Result<String> {
        self.manager.resume(task_id, requires_storage_not_low).await
    }

    /// 重试任务，返回新任务 ID
    pub async fn retry(&self, task_id: &str, requires_storage_not_low: bool) -> Result<String> {
        self.manager.retry(task_id, requires_storage_not_low).await
    }

    /// 取消任务
    pub async fn cancel(&self, task_id: &str) -> Result<()> {
        self.manager.cancel(task_id).await
    }

    /// 取消所有进行中的任务
    pub async fn cancel_all(&self) -> Result<usize> {
        self.manager.cancel_all().await
    }

    /// 删除任务记录
    pub async fn remove(&self, task_id: &str, should_delete_content: bool) -> Result<()> {
        self.manager.remove(task_id, should_delete_content).await
    }

    /// 打开已完成任务的产物
    pub async fn open(&self, task_id: &str) -> Result<bool> {
        self.manager.open(task_id).await
    }

    /// 加载全部任务
    pub fn load_tasks(&self) -> Result<Vec<DownloadTask>> {
        self.manager.load_tasks()
    }

    /// 条件查询任务
    pub fn load_tasks_filtered(&self, filter: &TaskFilter) -> Result<Vec<DownloadTask>> {
        self.manager.load_tasks_filtered(filter)
    }

    /// 原生 SQL 查询任务
    pub fn load_tasks_with_raw_query(&self, query: &str) -> Result<Vec<DownloadTask>> {
        self.manager.load_tasks_with_raw_query(query)
    }
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("db_key", &self.db_key)
            .finish_non_exhaustive()
    }
}

impl Drop for Downloader {
    fn drop(&mut self) {
        OPEN_DB_PATHS.lock().remove(&self.db_key);
    }
}
