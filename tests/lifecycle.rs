//! 通过 Downloader 门面的端到端生命周期测试
//!
//! 用脚本化引擎代替真实网络传输，测试用例亲自驱动引擎事件

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use dlhub::config::DownloadConfig;
use dlhub::downloader::{DownloadRequest, DownloadStatus, TransferEngine, TransferRequest};
use dlhub::events::{ProgressUpdate, TransferEvent};
use dlhub::Downloader;

/// 引擎收到的一次启动指令
struct StartedTransfer {
    request: TransferRequest,
    events: UnboundedSender<TransferEvent>,
    #[allow(dead_code)]
    token: CancellationToken,
}

struct ScriptedEngine {
    started_tx: UnboundedSender<StartedTransfer>,
}

#[async_trait]
impl TransferEngine for ScriptedEngine {
    async fn start(
        &self,
        request: TransferRequest,
        events: UnboundedSender<TransferEvent>,
        token: CancellationToken,
    ) {
        let _ = self.started_tx.send(StartedTransfer {
            request,
            events,
            token,
        });
    }
}

fn build_downloader(
    dir: &std::path::Path,
) -> (Downloader, UnboundedReceiver<StartedTransfer>) {
    let config = DownloadConfig {
        db_path: dir.join("tasks.db"),
        debug: false,
        ignore_ssl: false,
        cancel_ack_timeout_secs: 1,
    };
    let (started_tx, started_rx) = mpsc::unbounded_channel();
    let engine = Arc::new(ScriptedEngine { started_tx });
    let downloader = Downloader::with_engine(&config, engine).unwrap();
    (downloader, started_rx)
}

fn request(dir: &std::path::Path) -> DownloadRequest {
    DownloadRequest {
        url: "https://example.com/archive/data.tar.gz".to_string(),
        saved_dir: dir.to_path_buf(),
        file_name: None,
        headers: HashMap::new(),
        show_notification: false,
        open_file_from_notification: false,
        requires_storage_not_low: false,
        save_in_public_storage: false,
    }
}

async fn wait_for_status(downloader: &Downloader, task_id: &str, status: DownloadStatus) {
    for _ in 0..100 {
        let tasks = downloader.load_tasks().unwrap();
        if tasks.iter().any(|t| t.id == task_id && t.status == status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("任务 {} 未在期限内到达 {:?}", task_id, status);
}

#[tokio::test]
async fn full_lifecycle_with_observer() {
    let dir = tempfile::tempdir().unwrap();
    let (downloader, mut started_rx) = build_downloader(dir.path());

    // 步长 20 的观察者
    let updates: Arc<Mutex<Vec<ProgressUpdate>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = updates.clone();
    downloader
        .register_callback(move |u| sink.lock().unwrap().push(u), 20)
        .unwrap();

    let task_id = downloader.enqueue(request(dir.path())).await.unwrap();
    let started = started_rx.recv().await.unwrap();
    assert_eq!(started.request.url, "https://example.com/archive/data.tar.gz");

    // 引擎回报 5%、15%、25%、40%、61%，最后完成
    for bytes in [5u64, 15, 25, 40, 61] {
        started
            .events
            .send(TransferEvent::progress(&task_id, bytes, Some(100)))
            .unwrap();
    }
    started
        .events
        .send(TransferEvent::terminal(
            &task_id,
            DownloadStatus::Complete,
            100,
            Some(100),
        ))
        .unwrap();
    wait_for_status(&downloader, &task_id, DownloadStatus::Complete).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // 同档位的 5/15 被吞掉，25/40/61 跨档放行，终态必达
    let delivered: Vec<(DownloadStatus, i8)> = updates
        .lock()
        .unwrap()
        .iter()
        .filter(|u| u.task_id == task_id)
        .map(|u| (u.status, u.progress))
        .collect();
    assert_eq!(
        delivered,
        vec![
            (DownloadStatus::Running, 25),
            (DownloadStatus::Running, 40),
            (DownloadStatus::Running, 61),
            (DownloadStatus::Complete, 100),
        ]
    );
}

#[tokio::test]
async fn pause_resume_chain_preserves_history() {
    let dir = tempfile::tempdir().unwrap();
    let (downloader, mut started_rx) = build_downloader(dir.path());

    let first_id = downloader.enqueue(request(dir.path())).await.unwrap();
    let started = started_rx.recv().await.unwrap();
    started
        .events
        .send(TransferEvent::progress(&first_id, 300, Some(1000)))
        .unwrap();
    wait_for_status(&downloader, &first_id, DownloadStatus::Running).await;

    downloader.pause(&first_id).await.unwrap();
    let second_id = downloader.resume(&first_id, false).await.unwrap();
    let resumed = started_rx.recv().await.unwrap();
    assert_eq!(resumed.request.resume_offset, 300);

    resumed
        .events
        .send(TransferEvent::terminal(
            &second_id,
            DownloadStatus::Complete,
            1000,
            Some(1000),
        ))
        .unwrap();
    wait_for_status(&downloader, &second_id, DownloadStatus::Complete).await;

    // 历史链完整：旧记录 Paused 且指向后继，新记录 Complete
    let tasks = downloader.load_tasks().unwrap();
    assert_eq!(tasks.len(), 2);
    let first = tasks.iter().find(|t| t.id == first_id).unwrap();
    assert_eq!(first.status, DownloadStatus::Paused);
    assert_eq!(first.superseded_by.as_deref(), Some(second_id.as_str()));
    let second = tasks.iter().find(|t| t.id == second_id).unwrap();
    assert_eq!(second.status, DownloadStatus::Complete);
    assert!(second.superseded_by.is_none());
}

#[tokio::test]
async fn cancel_all_then_retry_one() {
    let dir = tempfile::tempdir().unwrap();
    let (downloader, mut started_rx) = build_downloader(dir.path());

    let id_a = downloader.enqueue(request(dir.path())).await.unwrap();
    let id_b = downloader.enqueue(request(dir.path())).await.unwrap();
    let _started_a = started_rx.recv().await.unwrap();
    let _started_b = started_rx.recv().await.unwrap();

    let canceled = downloader.cancel_all().await.unwrap();
    assert_eq!(canceled, 2);

    // 取消后的任务可以从头重试
    let new_id = downloader.retry(&id_a, false).await.unwrap();
    let retried = started_rx.recv().await.unwrap();
    assert_eq!(retried.request.task_id, new_id);
    assert_eq!(retried.request.resume_offset, 0);

    let tasks = downloader.load_tasks().unwrap();
    let old_a = tasks.iter().find(|t| t.id == id_a).unwrap();
    assert_eq!(old_a.status, DownloadStatus::Canceled);
    assert_eq!(old_a.superseded_by.as_deref(), Some(new_id.as_str()));
    let old_b = tasks.iter().find(|t| t.id == id_b).unwrap();
    assert_eq!(old_b.status, DownloadStatus::Canceled);
}

#[tokio::test]
async fn raw_query_is_select_only() {
    let dir = tempfile::tempdir().unwrap();
    let (downloader, mut started_rx) = build_downloader(dir.path());

    let task_id = downloader.enqueue(request(dir.path())).await.unwrap();
    let _started = started_rx.recv().await.unwrap();

    let rows = downloader
        .load_tasks_with_raw_query("SELECT * FROM tasks WHERE status = 'enqueued'")
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, task_id);

    assert!(downloader
        .load_tasks_with_raw_query("DROP TABLE tasks")
        .is_err());
}
