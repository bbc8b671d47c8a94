//! 日志系统配置
//!
//! 控制台输出始终开启；按配置可选开启文件持久化（非阻塞写入）

use crate::config::LogConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// 初始化全局日志订阅器
///
/// 返回的 guard 必须在进程生命周期内持有，否则文件日志会丢失尾部
pub fn init(config: &LogConfig, debug: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if debug { "debug" } else { config.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("dlhub={},tower_http=info", level)));

    let console_layer = fmt::layer().with_target(true);

    if config.enabled {
        std::fs::create_dir_all(&config.log_dir)?;
        let appender = tracing_appender::rolling::daily(&config.log_dir, "dlhub.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        let file_layer = fmt::layer().with_ansi(false).with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .with(file_layer)
            .init();
        Ok(Some(guard))
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .init();
        Ok(None)
    }
}
