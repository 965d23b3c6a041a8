use crate::quota::store::QuotaStore;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;

/// 主图后端的每日配额守卫。
///
/// - 每次主图尝试前都重新读取计数，不做本地缓存
/// - 读取失败时放行
/// - 仅在主图确认成功后自增，且自增是 fire-and-forget
///
/// 读取与自增之间没有锁，并发成功时计数可能略微超过上限。
#[derive(Clone)]
pub struct QuotaGuard {
    store: Arc<dyn QuotaStore>,
    ceiling: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaSnapshot {
    pub date: NaiveDate,
    pub image_count: u64,
    pub limit: u64,
    pub remaining: u64,
}

impl QuotaGuard {
    pub fn new(store: Arc<dyn QuotaStore>, ceiling: u64) -> Self {
        Self { store, ceiling }
    }

    /// 今日主图是否仍可用。
    pub async fn check_quota(&self) -> bool {
        match self.store.today_count(today()).await {
            Ok(count) => count < self.ceiling,
            Err(e) => {
                tracing::warn!("配额检查失败，按可用处理: {e:#}");
                true
            }
        }
    }

    /// 计数 +1，不等待结果；失败只记日志。
    pub fn increment_quota(&self) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.increment(today()).await {
                tracing::warn!("主图配额自增失败: {e:#}");
            }
        });
    }

    /// 管理端查看今日用量。
    pub async fn snapshot(&self) -> anyhow::Result<QuotaSnapshot> {
        let date = today();
        let image_count = self.store.today_count(date).await?;
        Ok(QuotaSnapshot {
            date,
            image_count,
            limit: self.ceiling,
            remaining: self.ceiling.saturating_sub(image_count),
        })
    }
}

/// 配额按 UTC 日历日计算。
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}
