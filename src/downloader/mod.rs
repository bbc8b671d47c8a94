//! 下载域：任务模型、传输引擎与管理器

pub mod engine;
pub mod manager;
pub mod task;

pub use engine::{HttpEngine, TransferEngine, TransferRequest};
pub use manager::DownloadManager;
pub use task::{DownloadRequest, DownloadStatus, DownloadTask};
