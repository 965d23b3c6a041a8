pub mod config;
pub mod error;
pub mod gateway;
pub mod gemini;
pub mod image;
pub mod logging;
pub mod pollinations;
pub mod quota;
pub mod session;
pub mod util;

use anyhow::Context;
use axum::Router;
use axum::routing::{get, post};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::load();

    init_tracing(&cfg);

    let primary =
        Arc::new(gemini::GeminiClient::new(&cfg).context("初始化 GeminiClient 失败")?);
    if cfg.gemini_api_key.trim().is_empty() {
        tracing::warn!("未配置 GEMINI_API_KEY，主图请求将全部回退到备用后端");
    }
    let secondary = Arc::new(
        pollinations::PollinationsClient::new(&cfg).context("初始化 PollinationsClient 失败")?,
    );

    // 配额计数：优先使用 Supabase，未配置时退化为进程内计数（重启清零）。
    let quota_store: Arc<dyn quota::QuotaStore> = if cfg.supabase_configured() {
        Arc::new(quota::SupabaseQuotaStore::new(&cfg).context("初始化 Supabase 配额存储失败")?)
    } else {
        tracing::warn!("未配置 Supabase，主图配额使用进程内计数");
        Arc::new(quota::MemoryQuotaStore::new())
    };
    let quota_guard = quota::QuotaGuard::new(quota_store, cfg.image_quota_limit);

    let orchestrator = Arc::new(image::FallbackOrchestrator::new(
        primary,
        secondary,
        quota_guard.clone(),
    ));

    let recovery = Arc::new(session::RecoveryStore::new(cfg.recovery_dir()));
    let service = Arc::new(image::ImageAcquisitionService::new(
        orchestrator,
        cfg.attempt_timeout(),
        cfg.smart_timeout(),
        Some(recovery.clone()),
    ));
    let scheduler = Arc::new(image::PreloadScheduler::new(
        service.clone(),
        cfg.preload_stagger(),
        cfg.initial_preload_count,
    ));

    let state = Arc::new(gateway::AppState {
        registry: session::SessionRegistry::new(recovery),
        service,
        scheduler,
        quota: quota_guard,
    });

    // === 公开路由 ===
    let public_routes = Router::new().route("/health", get(handle_health));

    // === 会话与取图 ===
    let api_routes = Router::new()
        .route("/api/sessions", post(gateway::handle_create_session))
        .route(
            "/api/sessions/{id}",
            get(gateway::handle_get_session).delete(gateway::handle_delete_session),
        )
        .route(
            "/api/sessions/{id}/current",
            post(gateway::handle_set_current),
        )
        .route(
            "/api/sessions/{id}/images/{index}",
            get(gateway::handle_image_status).post(gateway::handle_acquire_image),
        )
        .route("/api/admin/quota", get(gateway::handle_admin_quota))
        .with_state(state);

    let app = Router::new().merge(public_routes).merge(api_routes);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));

    tracing::info!(
        quota_limit = cfg.image_quota_limit,
        "Server listening on http://{addr}"
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("绑定监听端口失败")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务异常退出")?;

    Ok(())
}

async fn handle_health() -> &'static str {
    "ok"
}

fn init_tracing(cfg: &config::Config) {
    // DEBUG 控制后端请求日志块；这里确保本项目自身日志至少为 info，
    // 依赖库默认只输出 warn。
    let debug = cfg.debug.trim().to_lowercase();
    let filter = if debug == "off" {
        EnvFilter::new("off")
    } else {
        let env = std::env::var("RUST_LOG").unwrap_or_default();
        let env = env.trim();
        if env.is_empty() {
            EnvFilter::new("warn,quiz_image_gateway=info")
        } else if env.contains("quiz_image_gateway") {
            EnvFilter::new(env)
        } else {
            EnvFilter::new(format!("{env},quiz_image_gateway=info"))
        }
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}
