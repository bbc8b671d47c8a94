//! 事件分发器
//!
//! 接收引擎执行上下文发来的原始传输事件，节流后把
//! (task_id, status, progress) 投递给注册的观察者回调。
//! 两段都走消息通道，跨边界不持有任何锁：
//!
//! ```text
//! 引擎上下文 --TransferEvent--> 分发循环 --ProgressUpdate--> 观察者循环 --> 回调
//! ```
//!
//! 投递语义为 at-least-once：同一任务的终态通知可能重复，
//! 观察者需按 ID 幂等处理

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info, warn};

use super::throttle::StepThrottler;
use super::types::{ProgressUpdate, TransferEvent};
use crate::downloader::DownloadStatus;
use crate::error::{DownloadError, Result};

/// 观察者回调
pub type ProgressCallback = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// 活动中的回调注册
struct Registration {
    callback: ProgressCallback,
    throttler: Arc<StepThrottler>,
}

/// 事件分发器
///
/// 同一时间至多一个活动回调；重复注册替换旧回调
pub struct EventDispatcher {
    /// 引擎侧事件入口
    event_tx: UnboundedSender<TransferEvent>,
    /// 当前注册（分发循环读取，注册接口写入）
    registration: Arc<RwLock<Option<Registration>>>,
}

impl EventDispatcher {
    /// 创建分发器并启动分发循环
    pub fn new() -> Self {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<TransferEvent>();
        let registration: Arc<RwLock<Option<Registration>>> = Arc::new(RwLock::new(None));

        let registration_clone = registration.clone();
        tokio::spawn(async move {
            // 观察者循环：从第二段通道取更新并调用回调，
            // 与分发循环解耦，回调慢不会阻塞引擎侧
            let (deliver_tx, mut deliver_rx) =
                mpsc::unbounded_channel::<(ProgressCallback, ProgressUpdate)>();
            tokio::spawn(async move {
                while let Some((callback, update)) = deliver_rx.recv().await {
                    callback(update);
                }
            });

            while let Some(event) = event_rx.recv().await {
                let (callback, throttler) = {
                    let guard = registration_clone.read();
                    match guard.as_ref() {
                        Some(reg) => (reg.callback.clone(), reg.throttler.clone()),
                        // 无观察者时事件直接丢弃，存储中的任务历史不受影响
                        None => continue,
                    }
                };

                let update = if event.status.is_terminal() {
                    // 终态必投递，并清理该任务的节流基准
                    throttler.clear(&event.task_id);
                    Some(ProgressUpdate {
                        task_id: event.task_id.clone(),
                        status: event.status,
                        progress: event.percent().unwrap_or(-1),
                    })
                } else if event.status != DownloadStatus::Running {
                    // 状态切换（如暂停）不受节流约束
                    Some(ProgressUpdate {
                        task_id: event.task_id.clone(),
                        status: event.status,
                        progress: event.percent().unwrap_or(-1),
                    })
                } else {
                    match event.percent() {
                        Some(percent) => {
                            if throttler.should_deliver(&event.task_id, percent) {
                                Some(ProgressUpdate {
                                    task_id: event.task_id.clone(),
                                    status: event.status,
                                    progress: percent,
                                })
                            } else {
                                None
                            }
                        }
                        // 总大小未知：只转发状态，不带数值进度
                        None => Some(ProgressUpdate {
                            task_id: event.task_id.clone(),
                            status: event.status,
                            progress: -1,
                        }),
                    }
                };

                if let Some(update) = update {
                    debug!(
                        "投递进度更新: {} {} {}%",
                        update.task_id,
                        update.status.as_str(),
                        update.progress
                    );
                    if deliver_tx.send((callback, update)).is_err() {
                        warn!("观察者循环已退出，停止分发");
                        break;
                    }
                }
            }
        });

        Self {
            event_tx,
            registration,
        }
    }

    /// 注册观察者回调
    ///
    /// `step` 取值 0-100；重复注册替换旧回调及其节流状态
    pub fn register_callback<F>(&self, callback: F, step: u8) -> Result<()>
    where
        F: Fn(ProgressUpdate) + Send + Sync + 'static,
    {
        if step > 100 {
            return Err(DownloadError::Validation(format!(
                "step 必须在 0-100 之间: {}",
                step
            )));
        }

        let mut guard = self.registration.write();
        let replaced = guard.is_some();
        *guard = Some(Registration {
            callback: Arc::new(callback),
            throttler: Arc::new(StepThrottler::new(step)),
        });
        info!("观察者回调已注册 (step={}, 替换旧回调={})", step, replaced);
        Ok(())
    }

    /// 注销当前回调（进程退出前可选调用）
    pub fn unregister_callback(&self) {
        *self.registration.write() = None;
        info!("观察者回调已注销");
    }

    /// 引擎侧事件入口的发送端
    pub fn event_sender(&self) -> UnboundedSender<TransferEvent> {
        self.event_tx.clone()
    }

    /// 直接投递一个事件（管理器内部状态迁移时使用）
    pub fn publish(&self, event: TransferEvent) {
        if self.event_tx.send(event).is_err() {
            warn!("分发循环已退出，事件被丢弃");
        }
    }
}
