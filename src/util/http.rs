use crate::config::Config;
use std::time::Duration;

/// 构建后端共用的 HTTP 客户端（连接池、整体超时、可选代理）。
///
/// 单次图片尝试的超时由编排器控制，这里的超时只是兜底上限。
pub fn build_client(cfg: &Config) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90));

    if cfg.timeout_ms > 0 {
        builder = builder.timeout(Duration::from_millis(cfg.timeout_ms));
    }

    if !cfg.proxy.trim().is_empty() {
        builder = builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
    }

    Ok(builder.build()?)
}
