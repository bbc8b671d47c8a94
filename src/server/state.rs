// 应用状态

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::AppConfig;
use crate::downloader::DownloadManager;
use crate::events::EventDispatcher;

/// 应用全局状态
#[derive(Clone)]
pub struct AppState {
    /// 下载管理器
    pub manager: Arc<DownloadManager>,
    /// 事件分发器
    pub dispatcher: Arc<EventDispatcher>,
    /// 应用配置
    pub config: Arc<RwLock<AppConfig>>,
}

impl AppState {
    pub fn new(
        manager: Arc<DownloadManager>,
        dispatcher: Arc<EventDispatcher>,
        config: AppConfig,
    ) -> Self {
        Self {
            manager,
            dispatcher,
            config: Arc::new(RwLock::new(config)),
        }
    }
}
