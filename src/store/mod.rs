//! 任务持久化模块
//!
//! 任务记录的落盘与查询，崩溃重启后 `TaskDb` 是唯一权威状态来源。
//! 所有写入由 DownloadManager 独占发起

pub mod query;
pub mod task_db;

pub use query::TaskFilter;
pub use task_db::TaskDb;
