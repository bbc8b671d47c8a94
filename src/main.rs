use axum::routing::get;
use axum::{Json, Router};
use dlhub::{config::AppConfig, logging, server, AppState, Downloader};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载配置，失败时使用默认配置
    let config = AppConfig::load_or_default("config/app.toml").await;

    // 初始化日志系统（必须保持 _log_guard 存活）
    let _log_guard = logging::init(&config.log, config.download.debug)?;

    info!("Download Hub v0.4.2 启动中...");

    // 初始化下载器
    let downloader = Downloader::new(&config.download)?;
    let state = AppState::new(downloader.manager(), downloader.dispatcher(), config.clone());
    info!("应用状态初始化完成");

    let addr = format!("{}:{}", config.server.host, config.server.port);

    // 配置中间件层
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // 健康检查响应结构
    #[derive(Serialize)]
    struct HealthResponse {
        status: String,
        service: String,
    }

    async fn health_check() -> Json<HealthResponse> {
        Json(HealthResponse {
            status: "ok".to_string(),
            service: "dlhub".to_string(),
        })
    }

    // 构建完整应用
    let app = Router::new()
        .nest("/api/v1", server::build_router(state))
        .route("/health", get(health_check))
        .layer(middleware);

    info!("服务器启动在: http://{}", addr);
    info!("API 基础路径: http://{}/api/v1", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    // 监听关闭信号，支持优雅关闭
    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!("服务器错误: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C，开始优雅关闭...");
        }
    }

    info!("应用已安全退出");
    Ok(())
}
