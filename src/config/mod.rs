// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    #[serde(default = "default_host")]
    pub host: String,
    /// 监听端口
    #[serde(default = "default_port")]
    pub port: u16,
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 任务数据库路径
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// 调试模式（放开 debug 级别日志）
    #[serde(default)]
    pub debug: bool,
    /// 跳过 TLS 证书校验
    #[serde(default)]
    pub ignore_ssl: bool,
    /// 取消命令等待引擎确认的超时（秒），超时后强制置终态
    #[serde(default = "default_cancel_ack_timeout")]
    pub cancel_ack_timeout_secs: u64,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default)]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8720
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/tasks.db")
}

fn default_cancel_ack_timeout() -> u64 {
    15
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            debug: false,
            ignore_ssl: false,
            cancel_ack_timeout_secs: default_cancel_ack_timeout(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            download: DownloadConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置，不存在或解析失败时使用默认值
    pub async fn load_or_default(path: &str) -> Self {
        match fs::read_to_string(path).await {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    tracing::info!("已加载配置文件: {}", path);
                    config
                }
                Err(e) => {
                    tracing::warn!("配置文件解析失败，使用默认配置: {}", e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// 保存配置到文件
    pub async fn save(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("序列化配置失败")?;
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent).await.context("创建配置目录失败")?;
        }
        fs::write(path, content).await.context("写入配置文件失败")?;
        Ok(())
    }
}
