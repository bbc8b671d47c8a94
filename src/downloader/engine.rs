//! 传输引擎
//!
//! 管理器与实际网络传输之间的窄接口。引擎在自己的并发域里执行传输，
//! 通过事件通道上报 (task_id, status, bytes_downloaded, bytes_total)，
//! 从不直接改写任务记录

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::downloader::DownloadStatus;
use crate::events::TransferEvent;

/// 进度事件最小上报间隔
const PROGRESS_REPORT_INTERVAL: Duration = Duration::from_millis(200);

/// 交给引擎的一次传输指令（值类型，不共享任务记录）
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub task_id: String,
    pub url: String,
    /// 最终产物路径
    pub target_path: PathBuf,
    /// 进行中的部分产物路径
    pub partial_path: PathBuf,
    pub headers: HashMap<String, String>,
    /// 续传起始偏移，0 表示从头下载
    pub resume_offset: u64,
    /// 策略标记，由调用方透传
    pub requires_storage_not_low: bool,
}

/// 传输引擎接口
///
/// `start` 应当尽快返回控制权（内部 spawn），暂停/取消通过
/// CancellationToken 协作完成，结果一律走事件通道
#[async_trait]
pub trait TransferEngine: Send + Sync {
    async fn start(
        &self,
        request: TransferRequest,
        events: UnboundedSender<TransferEvent>,
        token: CancellationToken,
    );
}

/// 基于 reqwest 的 HTTP 传输引擎
///
/// 支持 Range 续传：offset > 0 时带 Range 头请求剩余区间，
/// 服务器不支持（非 206）则回退为从头下载
pub struct HttpEngine {
    client: Client,
}

impl HttpEngine {
    /// 创建引擎
    ///
    /// `ignore_ssl` 为 true 时跳过证书校验（对应 initialize 的 ignoreSsl）
    pub fn new(ignore_ssl: bool) -> anyhow::Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(ignore_ssl)
            .connect_timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self { client })
    }

    /// 单次传输主体，返回 Err 时由调用方发 Failed 事件
    async fn run_transfer(
        &self,
        request: &TransferRequest,
        events: &UnboundedSender<TransferEvent>,
        token: &CancellationToken,
    ) -> anyhow::Result<TransferOutcome> {
        let mut builder = self.client.get(&request.url);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        let mut offset =
            effective_resume_offset(&request.partial_path, request.resume_offset, &request.task_id)
                .await;
        if offset > 0 {
            builder = builder.header("Range", format!("bytes={}-", offset));
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("服务器返回 {}", status);
        }

        // 请求了 Range 但服务器回 200：不支持续传，从头写
        if offset > 0 && status != reqwest::StatusCode::PARTIAL_CONTENT {
            warn!("任务 {} 服务器不支持 Range，回退为完整下载", request.task_id);
            offset = 0;
        }

        let bytes_total = match response.content_length() {
            Some(len) => Some(offset + len),
            None => None,
        };

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&request.partial_path)
            .await?;
        file.set_len(offset).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut bytes_downloaded = offset;
        let mut last_report = Instant::now();
        let mut stream = response.bytes_stream();

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    file.flush().await?;
                    debug!("任务 {} 传输被中断于 {} 字节", request.task_id, bytes_downloaded);
                    return Ok(TransferOutcome::Interrupted { bytes_downloaded, bytes_total });
                }
                chunk = stream.next() => {
                    match chunk {
                        Some(Ok(bytes)) => {
                            file.write_all(&bytes).await?;
                            bytes_downloaded += bytes.len() as u64;

                            if last_report.elapsed() >= PROGRESS_REPORT_INTERVAL {
                                last_report = Instant::now();
                                let _ = events.send(TransferEvent::progress(
                                    &request.task_id,
                                    bytes_downloaded,
                                    bytes_total,
                                ));
                            }
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => break,
                    }
                }
            }
        }

        file.flush().await?;
        drop(file);

        // 完成：部分产物改名为最终文件
        tokio::fs::rename(&request.partial_path, &request.target_path).await?;
        Ok(TransferOutcome::Done {
            bytes_downloaded,
            bytes_total: bytes_total.or(Some(bytes_downloaded)),
        })
    }
}

/// 续传前核对部分产物：缺失或长度不足时 `set_len` 会填零造成静默损坏，
/// 退回从头下载
async fn effective_resume_offset(partial_path: &Path, requested: u64, task_id: &str) -> u64 {
    if requested == 0 {
        return 0;
    }
    let on_disk = match tokio::fs::metadata(partial_path).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };
    if on_disk < requested {
        warn!(
            "任务 {} 部分产物长度 {} 小于续传偏移 {}，回退为完整下载",
            task_id, on_disk, requested
        );
        0
    } else {
        requested
    }
}

enum TransferOutcome {
    Done {
        bytes_downloaded: u64,
        bytes_total: Option<u64>,
    },
    /// 被 token 打断（暂停或取消），终态事件由管理器补发
    Interrupted {
        bytes_downloaded: u64,
        bytes_total: Option<u64>,
    },
}

#[async_trait]
impl TransferEngine for HttpEngine {
    async fn start(
        &self,
        request: TransferRequest,
        events: UnboundedSender<TransferEvent>,
        token: CancellationToken,
    ) {
        info!(
            "引擎开始传输: {} (offset={}, url={})",
            request.task_id, request.resume_offset, request.url
        );

        let client = self.client.clone();
        tokio::spawn(async move {
            let engine = HttpEngine { client };
            match engine.run_transfer(&request, &events, &token).await {
                Ok(TransferOutcome::Done {
                    bytes_downloaded,
                    bytes_total,
                }) => {
                    info!("任务 {} 传输完成: {} 字节", request.task_id, bytes_downloaded);
                    let _ = events.send(TransferEvent::terminal(
                        &request.task_id,
                        DownloadStatus::Complete,
                        bytes_downloaded,
                        bytes_total,
                    ));
                }
                Ok(TransferOutcome::Interrupted {
                    bytes_downloaded,
                    bytes_total,
                }) => {
                    // 暂停/取消：上报一次最终字节数，状态由管理器决定
                    let _ = events.send(TransferEvent::progress(
                        &request.task_id,
                        bytes_downloaded,
                        bytes_total,
                    ));
                }
                Err(e) => {
                    warn!("任务 {} 传输失败: {}", request.task_id, e);
                    let _ = events.send(TransferEvent::terminal(
                        &request.task_id,
                        DownloadStatus::Failed,
                        request.resume_offset,
                        None,
                    ));
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resume_offset_missing_partial_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let partial = dir.path().join("a.bin.part");
        assert_eq!(effective_resume_offset(&partial, 512, "t").await, 0);
    }

    #[tokio::test]
    async fn test_resume_offset_short_partial_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let partial = dir.path().join("a.bin.part");
        tokio::fs::write(&partial, vec![0u8; 100]).await.unwrap();
        assert_eq!(effective_resume_offset(&partial, 512, "t").await, 0);
    }

    #[tokio::test]
    async fn test_resume_offset_honored_when_partial_covers_it() {
        let dir = tempfile::tempdir().unwrap();
        let partial = dir.path().join("a.bin.part");
        tokio::fs::write(&partial, vec![0u8; 512]).await.unwrap();
        assert_eq!(effective_resume_offset(&partial, 512, "t").await, 512);
        // 超长的部分产物照常截回偏移继续写
        tokio::fs::write(&partial, vec![0u8; 700]).await.unwrap();
        assert_eq!(effective_resume_offset(&partial, 512, "t").await, 512);
    }

    #[tokio::test]
    async fn test_zero_offset_skips_partial_check() {
        assert_eq!(
            effective_resume_offset(Path::new("/nonexistent/x.part"), 0, "t").await,
            0
        );
    }
}
