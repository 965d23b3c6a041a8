use crate::config::Config;
use crate::logging::{self, LogLevel};
use crate::util::http;
use anyhow::{Context, anyhow};
use chrono::NaiveDate;
use futures::future::BoxFuture;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// 每日主图计数的外部存储（读取今日计数 + 原子自增）。
pub trait QuotaStore: Send + Sync {
    fn today_count(&self, date: NaiveDate) -> BoxFuture<'_, anyhow::Result<u64>>;

    fn increment(&self, date: NaiveDate) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// Supabase（PostgREST）实现：`daily_stats` 表 + `increment_image_count` RPC。
#[derive(Debug, Clone)]
pub struct SupabaseQuotaStore {
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
    log_level: LogLevel,
}

#[derive(Debug, serde::Deserialize)]
struct DailyStatRow {
    #[serde(default)]
    image_count: Option<u64>,
}

impl SupabaseQuotaStore {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            http: http::build_client(cfg)?,
            base_url: cfg.supabase_url.trim().trim_end_matches('/').to_string(),
            anon_key: cfg.supabase_anon_key.trim().to_string(),
            log_level: cfg.log_level(),
        })
    }

    fn build_headers(&self) -> anyhow::Result<HeaderMap> {
        let mut h = HeaderMap::new();
        h.insert("apikey", HeaderValue::from_str(&self.anon_key)?);
        h.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.anon_key))?,
        );
        h.insert(ACCEPT, HeaderValue::from_static("application/json"));
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(h)
    }

    async fn fetch_count(&self, date: NaiveDate) -> anyhow::Result<u64> {
        let url = format!(
            "{}/rest/v1/daily_stats?select=image_count&date=eq.{}",
            self.base_url,
            date.format("%Y-%m-%d")
        );
        let headers = self.build_headers()?;
        logging::backend_request(self.log_level, "GET", &url, &headers, &[]);

        let start = std::time::Instant::now();
        let resp = self
            .http
            .get(url.clone())
            .headers(headers)
            .send()
            .await
            .context("查询 daily_stats 失败")?;
        let status = resp.status();
        let bytes = resp.bytes().await?;
        logging::backend_response(
            self.log_level,
            "GET",
            &url,
            status.as_u16(),
            start.elapsed(),
            &bytes,
            false,
        );

        if !status.is_success() {
            return Err(anyhow!("查询 daily_stats 返回 {status}"));
        }
        parse_daily_stats(&bytes)
    }

    async fn call_increment(&self) -> anyhow::Result<()> {
        let url = format!("{}/rest/v1/rpc/increment_image_count", self.base_url);
        let headers = self.build_headers()?;
        logging::backend_request(self.log_level, "POST", &url, &headers, b"{}");

        let start = std::time::Instant::now();
        let resp = self
            .http
            .post(url.clone())
            .headers(headers)
            .body("{}")
            .send()
            .await
            .context("调用 increment_image_count 失败")?;
        let status = resp.status();
        let bytes = resp.bytes().await?;
        logging::backend_response(
            self.log_level,
            "POST",
            &url,
            status.as_u16(),
            start.elapsed(),
            &bytes,
            false,
        );

        if !status.is_success() {
            return Err(anyhow!("increment_image_count 返回 {status}"));
        }
        Ok(())
    }
}

impl QuotaStore for SupabaseQuotaStore {
    fn today_count(&self, date: NaiveDate) -> BoxFuture<'_, anyhow::Result<u64>> {
        Box::pin(self.fetch_count(date))
    }

    // RPC 在服务端按当天日期自增，不需要传日期。
    fn increment(&self, _date: NaiveDate) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(self.call_increment())
    }
}

/// 没有当天记录（空数组）视为 0。
fn parse_daily_stats(body: &[u8]) -> anyhow::Result<u64> {
    let rows: Vec<DailyStatRow> =
        sonic_rs::from_slice(body).context("解析 daily_stats 响应失败")?;
    Ok(rows.first().and_then(|r| r.image_count).unwrap_or(0))
}

/// 进程内计数：未配置 Supabase 时使用，也用于测试。
#[derive(Debug, Default)]
pub struct MemoryQuotaStore {
    counts: RwLock<HashMap<NaiveDate, u64>>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, date: NaiveDate, count: u64) {
        self.counts.write().await.insert(date, count);
    }

    pub async fn get(&self, date: NaiveDate) -> u64 {
        self.counts.read().await.get(&date).copied().unwrap_or(0)
    }
}

impl QuotaStore for MemoryQuotaStore {
    fn today_count(&self, date: NaiveDate) -> BoxFuture<'_, anyhow::Result<u64>> {
        Box::pin(async move { Ok(self.get(date).await) })
    }

    fn increment(&self, date: NaiveDate) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            *self.counts.write().await.entry(date).or_insert(0) += 1;
            Ok(())
        })
    }
}
