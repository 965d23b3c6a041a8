//! 测试用的进程内后端替身。

use crate::image::orchestrator::FallbackOrchestrator;
use crate::image::provider::{PrimaryProvider, SecondaryProvider};
use crate::image::types::Tier;
use crate::quota::{MemoryQuotaStore, QuotaGuard};
use anyhow::anyhow;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub const TEST_CEILING: u64 = 800;

#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Succeed,
    Fail(&'static str),
    /// 永不返回，只能靠超时结束。
    Hang,
    /// 等待一段时间后成功。
    Delay(Duration),
}

impl Behavior {
    async fn perform(self) -> anyhow::Result<()> {
        match self {
            Behavior::Succeed => Ok(()),
            Behavior::Fail(msg) => Err(anyhow!(msg)),
            Behavior::Hang => futures::future::pending().await,
            Behavior::Delay(d) => {
                tokio::time::sleep(d).await;
                Ok(())
            }
        }
    }
}

pub struct FakePrimary {
    behavior: Behavior,
    calls: Mutex<Vec<String>>,
}

impl FakePrimary {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl PrimaryProvider for FakePrimary {
    fn generate<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, anyhow::Result<String>> {
        self.calls.lock().unwrap().push(prompt.to_string());
        Box::pin(async move {
            self.behavior.perform().await?;
            Ok("data:image/png;base64,iVBORw0KGgo=".to_string())
        })
    }
}

pub struct FakeSecondary {
    behaviors: HashMap<Tier, Behavior>,
    calls: Mutex<Vec<(Tier, Instant)>>,
}

impl FakeSecondary {
    pub fn all(behavior: Behavior) -> Self {
        Self::scripted(&Tier::ORDER.map(|t| (t, behavior)))
    }

    pub fn scripted(script: &[(Tier, Behavior)]) -> Self {
        Self {
            behaviors: script.iter().copied().collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(Tier, Instant)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn tiers(&self) -> Vec<Tier> {
        self.calls().into_iter().map(|(t, _)| t).collect()
    }
}

fn tier_name(tier: Tier) -> &'static str {
    tier.model_param().unwrap_or("default")
}

fn tier_from_url(url: &str) -> Tier {
    let name = url
        .strip_prefix("fake://")
        .and_then(|rest| rest.split('/').next())
        .unwrap_or_default();
    Tier::ORDER
        .into_iter()
        .find(|t| tier_name(*t) == name)
        .unwrap()
}

impl SecondaryProvider for FakeSecondary {
    fn build_url(&self, prompt: &str, tier: Tier) -> String {
        format!("fake://{}/{}", tier_name(tier), urlencoding::encode(prompt))
    }

    fn load<'a>(&'a self, url: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        let tier = tier_from_url(url);
        self.calls.lock().unwrap().push((tier, Instant::now()));
        let behavior = self.behaviors.get(&tier).copied().unwrap_or(Behavior::Succeed);
        Box::pin(behavior.perform())
    }
}

pub struct Harness {
    pub orchestrator: Arc<FallbackOrchestrator>,
    pub primary: Arc<FakePrimary>,
    pub secondary: Arc<FakeSecondary>,
    pub quota: Arc<MemoryQuotaStore>,
}

impl Harness {
    /// 让 fire-and-forget 的配额自增任务跑完。
    pub async fn settle(&self) {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }
}

pub fn harness(primary: FakePrimary, secondary: FakeSecondary) -> Harness {
    let primary = Arc::new(primary);
    let secondary = Arc::new(secondary);
    let quota = Arc::new(MemoryQuotaStore::new());
    let orchestrator = Arc::new(FallbackOrchestrator::new(
        primary.clone(),
        secondary.clone(),
        QuotaGuard::new(quota.clone(), TEST_CEILING),
    ));
    Harness {
        orchestrator,
        primary,
        secondary,
        quota,
    }
}
