//! 下载管理器
//!
//! 状态机的唯一所有者，也是任务数据库的唯一写入方。
//! 命令在各任务的串行化点上逐个应用（按 ID 加锁），不同任务并行；
//! 所有命令在状态迁移落盘并把指令移交引擎后立即返回，
//! 绝不等待传输完成

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::downloader::engine::{TransferEngine, TransferRequest};
use crate::downloader::task::{DownloadRequest, DownloadStatus, DownloadTask};
use crate::error::{DownloadError, Result};
use crate::events::{EventDispatcher, TransferEvent};
use crate::filesystem;
use crate::store::{TaskDb, TaskFilter};

/// 下载管理器
pub struct DownloadManager {
    /// 任务数据库（唯一写入方是本结构）
    db: Arc<TaskDb>,
    /// 传输引擎
    engine: Arc<dyn TransferEngine>,
    /// 事件分发器
    dispatcher: Arc<EventDispatcher>,
    /// 每任务串行化锁（task_id -> 锁）
    task_locks: DashMap<String, Arc<Mutex<()>>>,
    /// 任务取消令牌（task_id -> CancellationToken）
    cancellation_tokens: DashMap<String, CancellationToken>,
    /// 引擎事件入口（引擎上下文 -> 管理器事件循环）
    engine_tx: UnboundedSender<TransferEvent>,
    /// 等待引擎确认取消的任务集合
    pending_cancel: Arc<DashMap<String, ()>>,
    /// 取消确认超时
    cancel_ack_timeout: Duration,
}

impl DownloadManager {
    /// 创建管理器并启动引擎事件循环
    pub fn new(
        db: Arc<TaskDb>,
        engine: Arc<dyn TransferEngine>,
        dispatcher: Arc<EventDispatcher>,
        cancel_ack_timeout: Duration,
    ) -> Arc<Self> {
        let (engine_tx, mut engine_rx) = mpsc::unbounded_channel::<TransferEvent>();

        let manager = Arc::new(Self {
            db,
            engine,
            dispatcher,
            task_locks: DashMap::new(),
            cancellation_tokens: DashMap::new(),
            engine_tx,
            pending_cancel: Arc::new(DashMap::new()),
            cancel_ack_timeout,
        });

        // 引擎事件循环：引擎上报的每个事件都经过这里再落盘、再转发，
        // 与命令共用每任务锁，保证单任务一次只有一个状态迁移
        let manager_clone = manager.clone();
        tokio::spawn(async move {
            while let Some(event) = engine_rx.recv().await {
                manager_clone.on_engine_event(event).await;
            }
        });

        manager
    }

    /// 获取任务的串行化锁
    fn lock_for(&self, task_id: &str) -> Arc<Mutex<()>> {
        self.task_locks
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ========================================================================
    // 命令接口
    // ========================================================================

    /// 入队新任务，返回新任务 ID；执行是异步的
    pub async fn enqueue(&self, req: DownloadRequest) -> Result<String> {
        filesystem::validate_saved_dir(&req.saved_dir)?;

        let file_name = match &req.file_name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => {
                let placeholder = uuid::Uuid::new_v4().to_string();
                DownloadTask::derive_file_name(&req.url, &placeholder)
            }
        };

        let task = DownloadTask::new(&req, file_name);
        let task_id = task.id.clone();

        let lock = self.lock_for(&task_id);
        let _guard = lock.lock().await;

        self.db.put(&task)?;
        info!("创建下载任务: id={}, 文件名={}", task_id, task.file_name);

        self.start_engine(&task, 0);
        Ok(task_id)
    }

    /// 暂停传输中的任务，保留已下载字节
    pub async fn pause(&self, task_id: &str) -> Result<()> {
        let lock = self.lock_for(task_id);
        let _guard = lock.lock().await;

        let mut task = self.db.get(task_id)?;
        if task.status != DownloadStatus::Running {
            return Err(DownloadError::invalid_state(task_id, task.status, "pause"));
        }

        task.mark_paused();
        self.db.put(&task)?;

        // 先落盘，再打断引擎；引擎随后的字节回报只更新偏移量
        if let Some((_, token)) = self.cancellation_tokens.remove(task_id) {
            token.cancel();
        }

        info!("暂停下载任务: {}", task_id);
        self.dispatcher.publish(TransferEvent {
            task_id: task_id.to_string(),
            status: DownloadStatus::Paused,
            bytes_downloaded: task.bytes_downloaded,
            bytes_total: task.bytes_total,
        });
        Ok(())
    }

    /// 续传暂停的任务：新建任务继承部分产物与偏移，返回新任务 ID
    pub async fn resume(&self, task_id: &str, requires_storage_not_low: bool) -> Result<String> {
        let lock = self.lock_for(task_id);
        let _guard = lock.lock().await;

        let old = self.db.get(task_id)?;
        // 已被取代的记录视同终态，部分产物归后继所有
        if old.status != DownloadStatus::Paused || old.superseded_by.is_some() {
            return Err(DownloadError::invalid_state(task_id, old.status, "resume"));
        }

        let new_task = DownloadTask::new_resumed(&old, requires_storage_not_low);
        // 旧记录保持 Paused 终局快照，superseded_by 指向新任务；
        // 部分产物所有权随本次事务转移
        self.db
            .supersede_and_insert(task_id, DownloadStatus::Paused, &new_task)?;

        info!(
            "续传任务: {} -> {} (offset={})",
            task_id, new_task.id, new_task.bytes_downloaded
        );
        self.start_engine(&new_task, new_task.bytes_downloaded);
        Ok(new_task.id)
    }

    /// 重试失败/已取消的任务：新建任务从 0 字节开始，返回新任务 ID
    pub async fn retry(&self, task_id: &str, requires_storage_not_low: bool) -> Result<String> {
        let lock = self.lock_for(task_id);
        let _guard = lock.lock().await;

        let old = self.db.get(task_id)?;
        if !matches!(old.status, DownloadStatus::Failed | DownloadStatus::Canceled)
            || old.superseded_by.is_some()
        {
            return Err(DownloadError::invalid_state(task_id, old.status, "retry"));
        }

        let new_task = DownloadTask::new_retried(&old, requires_storage_not_low);
        self.db.supersede_and_insert(task_id, old.status, &new_task)?;

        info!("重试任务: {} -> {}", task_id, new_task.id);
        self.start_engine(&new_task, 0);
        Ok(new_task.id)
    }

    /// 取消任务并丢弃部分产物
    pub async fn cancel(&self, task_id: &str) -> Result<()> {
        let lock = self.lock_for(task_id);
        let _guard = lock.lock().await;
        self.cancel_locked(task_id).await
    }

    /// 取消所有非终态任务
    pub async fn cancel_all(&self) -> Result<usize> {
        let active = self.db.query(&TaskFilter {
            statuses: vec![
                DownloadStatus::Enqueued,
                DownloadStatus::Running,
                DownloadStatus::Paused,
            ],
            ..Default::default()
        })?;

        let mut canceled = 0;
        for task in active {
            if task.superseded_by.is_some() {
                continue;
            }
            let lock = self.lock_for(&task.id);
            let _guard = lock.lock().await;
            match self.cancel_locked(&task.id).await {
                Ok(_) => canceled += 1,
                // 并发窗口内任务可能已自行到达终态，跳过即可
                Err(DownloadError::InvalidState { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        info!("批量取消完成: {} 个任务", canceled);
        Ok(canceled)
    }

    /// 持锁状态下的取消主体
    async fn cancel_locked(&self, task_id: &str) -> Result<()> {
        let mut task = self.db.get(task_id)?;
        // 已被取代的记录不可取消，其部分产物正由后继写入
        if !task.status.is_active() || task.superseded_by.is_some() {
            return Err(DownloadError::invalid_state(task_id, task.status, "cancel"));
        }

        let was_running = task.status == DownloadStatus::Running;
        // 本地乐观置为终态
        task.mark_canceled();
        self.db.put(&task)?;

        if let Some((_, token)) = self.cancellation_tokens.remove(task_id) {
            token.cancel();
        }
        // 部分产物随取消丢弃
        filesystem::delete_artifact(&task.target_path(), &task.partial_path());

        info!("取消下载任务: {}", task_id);
        self.dispatcher.publish(TransferEvent::terminal(
            task_id,
            DownloadStatus::Canceled,
            task.bytes_downloaded,
            task.bytes_total,
        ));

        // 传输中的任务要等引擎确认停止；超时则强制视为已停
        if was_running {
            self.pending_cancel.insert(task_id.to_string(), ());
            let pending = self.pending_cancel.clone();
            let dispatcher = self.dispatcher.clone();
            let id = task_id.to_string();
            let timeout = self.cancel_ack_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if pending.remove(&id).is_some() {
                    warn!("任务 {} 取消超时未获引擎确认，强制置终态", id);
                    dispatcher.publish(TransferEvent::terminal(
                        &id,
                        DownloadStatus::Canceled,
                        0,
                        None,
                    ));
                }
            });
        }
        Ok(())
    }

    /// 删除任务记录；进行中的任务先取消
    pub async fn remove(&self, task_id: &str, should_delete_content: bool) -> Result<()> {
        let lock = self.lock_for(task_id);
        let _guard = lock.lock().await;

        let task = self.db.get(task_id)?;
        if task.status.is_active() {
            self.cancel_locked(task_id).await?;
        }

        if should_delete_content {
            filesystem::delete_artifact(&task.target_path(), &task.partial_path());
        }

        self.db.delete(task_id)?;
        self.task_locks.remove(task_id);
        self.cancellation_tokens.remove(task_id);
        info!("移除下载任务: {} (删除产物={})", task_id, should_delete_content);
        Ok(())
    }

    /// 交给系统查看器打开已完成任务的产物
    pub async fn open(&self, task_id: &str) -> Result<bool> {
        let task = self.db.get(task_id)?;
        if task.status != DownloadStatus::Complete {
            return Err(DownloadError::invalid_state(task_id, task.status, "open"));
        }
        Ok(filesystem::open_artifact(&task.target_path()))
    }

    /// 加载全部任务
    pub fn load_tasks(&self) -> Result<Vec<DownloadTask>> {
        self.db.list_all()
    }

    /// 条件查询
    pub fn load_tasks_filtered(&self, filter: &TaskFilter) -> Result<Vec<DownloadTask>> {
        self.db.query(filter)
    }

    /// 原生 SQL 查询（仅 SELECT）
    pub fn load_tasks_with_raw_query(&self, query: &str) -> Result<Vec<DownloadTask>> {
        self.db.raw_query(query)
    }

    /// 点查单个任务
    pub fn get_task(&self, task_id: &str) -> Result<DownloadTask> {
        self.db.get(task_id)
    }

    // ========================================================================
    // 引擎交互
    // ========================================================================

    /// 把任务移交引擎，立即返回
    fn start_engine(&self, task: &DownloadTask, resume_offset: u64) {
        let token = CancellationToken::new();
        self.cancellation_tokens
            .insert(task.id.clone(), token.clone());

        let request = TransferRequest {
            task_id: task.id.clone(),
            url: task.url.clone(),
            target_path: task.target_path(),
            partial_path: task.partial_path(),
            headers: task.headers.clone(),
            resume_offset,
            requires_storage_not_low: task.requires_storage_not_low,
        };

        let engine = self.engine.clone();
        let events = self.engine_tx.clone();
        tokio::spawn(async move {
            engine.start(request, events, token).await;
        });
    }

    /// 应用一条引擎事件：先落盘，再转发给分发器
    async fn on_engine_event(&self, event: TransferEvent) {
        let lock = self.lock_for(&event.task_id);
        let _guard = lock.lock().await;

        let mut task = match self.db.get(&event.task_id) {
            Ok(task) => task,
            Err(DownloadError::NotFound(_)) => {
                debug!("引擎事件指向未知任务，忽略: {}", event.task_id);
                return;
            }
            Err(e) => {
                error!("读取任务失败，事件被丢弃: {}", e);
                return;
            }
        };

        match event.status {
            DownloadStatus::Running => {
                match task.status {
                    DownloadStatus::Enqueued | DownloadStatus::Running => {
                        let first_progress = task.status == DownloadStatus::Enqueued;
                        task.mark_running();
                        task.bytes_downloaded = task.bytes_downloaded.max(event.bytes_downloaded);
                        if event.bytes_total.is_some() {
                            task.bytes_total = event.bytes_total;
                            task.resumable = true;
                        }
                        if let Some(percent) = event.percent() {
                            // 同一次尝试内进度单调不减
                            task.progress = task.progress.max(percent);
                        }
                        if let Err(e) = self.db.put(&task) {
                            error!("进度落盘失败: {}", e);
                            return;
                        }
                        if first_progress {
                            debug!("任务 {} 进入传输状态", task.id);
                        }
                        self.dispatcher.publish(TransferEvent {
                            task_id: task.id.clone(),
                            status: DownloadStatus::Running,
                            bytes_downloaded: task.bytes_downloaded,
                            bytes_total: task.bytes_total,
                        });
                    }
                    DownloadStatus::Paused => {
                        // 暂停后引擎的尾部回报：只校正偏移量，进度冻结，不再转发
                        task.bytes_downloaded = task.bytes_downloaded.max(event.bytes_downloaded);
                        if let Err(e) = self.db.put(&task) {
                            error!("暂停偏移落盘失败: {}", e);
                        }
                    }
                    DownloadStatus::Canceled => {
                        // 取消后的尾部回报即引擎确认
                        self.pending_cancel.remove(&task.id);
                    }
                    _ => {
                        debug!(
                            "忽略终态任务 {} 的进度事件 ({})",
                            task.id,
                            task.status.as_str()
                        );
                    }
                }
            }
            DownloadStatus::Complete => {
                if !task.status.is_active() {
                    debug!("忽略终态任务 {} 的完成事件", task.id);
                    return;
                }
                if event.bytes_total.is_some() {
                    task.bytes_total = event.bytes_total;
                }
                task.bytes_downloaded = event.bytes_downloaded.max(task.bytes_downloaded);
                task.mark_complete();
                if let Err(e) = self.db.put(&task) {
                    error!("完成状态落盘失败: {}", e);
                    return;
                }
                info!("任务完成: {} ({} 字节)", task.id, task.bytes_downloaded);
                self.cancellation_tokens.remove(&task.id);
                self.dispatcher.publish(TransferEvent::terminal(
                    &task.id,
                    DownloadStatus::Complete,
                    task.bytes_downloaded,
                    task.bytes_total,
                ));
            }
            DownloadStatus::Failed => {
                // 取消竞争窗口内的失败回报视为取消确认
                if task.status == DownloadStatus::Canceled {
                    self.pending_cancel.remove(&task.id);
                    return;
                }
                if !task.status.is_active() {
                    debug!("忽略终态任务 {} 的失败事件", task.id);
                    return;
                }
                task.mark_failed("传输失败".to_string());
                if let Err(e) = self.db.put(&task) {
                    error!("失败状态落盘失败: {}", e);
                    return;
                }
                warn!("任务失败: {}", task.id);
                self.cancellation_tokens.remove(&task.id);
                self.dispatcher.publish(TransferEvent::terminal(
                    &task.id,
                    DownloadStatus::Failed,
                    task.bytes_downloaded,
                    task.bytes_total,
                ));
            }
            DownloadStatus::Canceled => {
                // 引擎主动确认取消
                self.pending_cancel.remove(&task.id);
                if task.status != DownloadStatus::Canceled && task.status.is_active() {
                    task.mark_canceled();
                    if let Err(e) = self.db.put(&task) {
                        error!("取消状态落盘失败: {}", e);
                        return;
                    }
                    self.dispatcher.publish(TransferEvent::terminal(
                        &task.id,
                        DownloadStatus::Canceled,
                        task.bytes_downloaded,
                        task.bytes_total,
                    ));
                }
            }
            _ => {
                debug!("忽略引擎事件: {:?}", event.status);
            }
        }
    }
}
