//! 回退编排器：单个 ImageRequest 的状态机。
//!
//! `TryPrimary → TrySecondary(flux) → TrySecondary(turbo) → TrySecondary(default) → Failed`，
//! 任一状态成功即进入 `Succeeded`。状态转移是纯函数（[`transition`]），
//! 异步驱动循环只负责执行尝试并把结果喂给转移函数。

use crate::image::error::ImageError;
use crate::image::provider::{PrimaryProvider, SecondaryProvider};
use crate::image::types::{
    AttemptOutcome, FallbackState, ImageRequest, Provider, ProviderAttempt, Tier,
};
use crate::quota::QuotaGuard;
use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// 一步尝试的结果（去掉负载，只保留状态机关心的部分）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// 配额已满，未发起网络请求。
    QuotaExhausted,
    Success,
    /// 失败或超时。
    Failure,
}

/// 一次状态转移及其副作用。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: FallbackState,
    pub set_sticky: bool,
    pub increment_quota: bool,
}

impl Transition {
    fn to(next: FallbackState) -> Self {
        Self {
            next,
            set_sticky: false,
            increment_quota: false,
        }
    }
}

/// 入口状态：会话已固定到备用后端，或本次是重新生成，都直接从 flux 开始。
pub fn entry_state(sticky: bool, is_regeneration: bool) -> FallbackState {
    if sticky || is_regeneration {
        FallbackState::TrySecondary(Tier::Flux)
    } else {
        FallbackState::TryPrimary
    }
}

pub fn transition(state: FallbackState, step: StepKind) -> Transition {
    match (state, step) {
        (FallbackState::TryPrimary, StepKind::Success) => Transition {
            next: FallbackState::Succeeded,
            set_sticky: false,
            increment_quota: true,
        },
        // 配额用尽与主图失败都会把会话固定到备用后端。
        (FallbackState::TryPrimary, StepKind::QuotaExhausted | StepKind::Failure) => Transition {
            next: FallbackState::TrySecondary(Tier::Flux),
            set_sticky: true,
            increment_quota: false,
        },
        (FallbackState::TrySecondary(_), StepKind::Success) => Transition {
            next: FallbackState::Succeeded,
            set_sticky: true,
            increment_quota: false,
        },
        (FallbackState::TrySecondary(tier), _) => match tier.next() {
            Some(next) => Transition::to(FallbackState::TrySecondary(next)),
            None => Transition::to(FallbackState::Failed),
        },
        (terminal, _) => Transition::to(terminal),
    }
}

/// 一次完整遍历的结果。
#[derive(Debug)]
pub struct Traversal {
    pub attempts: Vec<ProviderAttempt>,
    pub result: Result<String, ImageError>,
}

struct AttemptReport {
    id: u64,
    result: anyhow::Result<String>,
}

pub struct FallbackOrchestrator {
    primary: Arc<dyn PrimaryProvider>,
    secondary: Arc<dyn SecondaryProvider>,
    quota: QuotaGuard,
    attempt_seq: AtomicU64,
}

impl FallbackOrchestrator {
    pub fn new(
        primary: Arc<dyn PrimaryProvider>,
        secondary: Arc<dyn SecondaryProvider>,
        quota: QuotaGuard,
    ) -> Self {
        Self {
            primary,
            secondary,
            quota,
            attempt_seq: AtomicU64::new(0),
        }
    }

    /// 驱动一次遍历。各层尝试严格串行，每层至多一次。
    ///
    /// `sticky` 是会话级的“已固定到备用后端”标记，在这里读取并按转移结果置位。
    pub async fn run(&self, req: &ImageRequest, sticky: &AtomicBool, timeout: Duration) -> Traversal {
        let index = req.question_index;
        let (tx, mut rx) = mpsc::unbounded_channel::<AttemptReport>();
        let mut state = entry_state(sticky.load(Ordering::SeqCst), req.is_regeneration);
        let mut attempts = Vec::new();
        let mut image: Option<String> = None;

        while !state.is_terminal() {
            let step = match state {
                FallbackState::TryPrimary => {
                    if self.quota.check_quota().await {
                        let primary = self.primary.clone();
                        let prompt = req.prompt_text.clone();
                        let fut = async move { primary.generate(&prompt).await }.boxed();
                        self.attempt(Provider::Primary, fut, timeout, &tx, &mut rx, index)
                            .await
                    } else {
                        tracing::warn!(index, "{}，改用备用后端", ImageError::QuotaExceeded);
                        StepResult::QuotaExhausted
                    }
                }
                FallbackState::TrySecondary(tier) => {
                    let url = self.secondary.build_url(&req.prompt_text, tier);
                    let secondary = self.secondary.clone();
                    let fut = async move {
                        let loaded = secondary.load(&url).await;
                        loaded.map(|_| url)
                    }
                    .boxed();
                    self.attempt(tier.provider(), fut, timeout, &tx, &mut rx, index)
                        .await
                }
                FallbackState::Succeeded | FallbackState::Failed => break,
            };

            let kind = match step {
                StepResult::QuotaExhausted => StepKind::QuotaExhausted,
                StepResult::Attempted(attempt, Ok(url)) => {
                    attempts.push(attempt);
                    image = Some(url);
                    StepKind::Success
                }
                StepResult::Attempted(attempt, Err(err)) => {
                    tracing::warn!(
                        index,
                        attempt_id = attempt.id,
                        provider = %attempt.provider,
                        "图片尝试失败: {err}"
                    );
                    attempts.push(attempt);
                    StepKind::Failure
                }
            };

            let t = transition(state, kind);
            if t.set_sticky && !sticky.swap(true, Ordering::SeqCst) {
                tracing::info!(index, "本会话后续图片请求固定使用备用后端");
            }
            if t.increment_quota {
                self.quota.increment_quota();
            }
            state = t.next;
        }

        let result = match (state, image) {
            (FallbackState::Succeeded, Some(url)) => Ok(url),
            _ => {
                tracing::error!(index, attempts = attempts.len(), "{}", ImageError::AllProvidersExhausted);
                Err(ImageError::AllProvidersExhausted)
            }
        };

        Traversal { attempts, result }
    }

    /// 执行一次尝试：派发到独立任务，带超时等待与本次 id 匹配的结果。
    ///
    /// 超时会中止任务（相当于清空图片 src），迟到的旧结果因 id 不匹配被丢弃。
    async fn attempt(
        &self,
        provider: Provider,
        fut: BoxFuture<'static, anyhow::Result<String>>,
        timeout: Duration,
        tx: &UnboundedSender<AttemptReport>,
        rx: &mut UnboundedReceiver<AttemptReport>,
        index: usize,
    ) -> StepResult {
        let id = self.attempt_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut record = ProviderAttempt {
            id,
            provider,
            started_at: Utc::now(),
            outcome: AttemptOutcome::Pending,
        };
        tracing::debug!(index, attempt_id = id, %provider, "开始图片尝试");

        let report_tx = tx.clone();
        let handle = tokio::spawn(async move {
            let result = fut.await;
            let _ = report_tx.send(AttemptReport { id, result });
        });

        let result = match tokio::time::timeout(timeout, wait_for_attempt(rx, id)).await {
            Ok(Some(Ok(url))) => {
                record.outcome = AttemptOutcome::Success;
                Ok(url)
            }
            Ok(Some(Err(e))) => {
                record.outcome = AttemptOutcome::Error;
                Err(ImageError::ProviderError {
                    provider,
                    message: format!("{e:#}"),
                })
            }
            Ok(None) => {
                record.outcome = AttemptOutcome::Error;
                Err(ImageError::ProviderError {
                    provider,
                    message: "尝试任务意外结束".to_string(),
                })
            }
            Err(_) => {
                handle.abort();
                record.outcome = AttemptOutcome::Timeout;
                Err(ImageError::ProviderTimeout { provider, timeout })
            }
        };

        StepResult::Attempted(record, result)
    }
}

enum StepResult {
    QuotaExhausted,
    Attempted(ProviderAttempt, Result<String, ImageError>),
}

/// 等待指定 id 的结果，丢弃其它（已过期）尝试的迟到结果。
async fn wait_for_attempt(
    rx: &mut UnboundedReceiver<AttemptReport>,
    id: u64,
) -> Option<anyhow::Result<String>> {
    while let Some(report) = rx.recv().await {
        if report.id == id {
            return Some(report.result);
        }
        tracing::debug!(attempt_id = report.id, current = id, "忽略过期的尝试结果");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::testing::{Behavior, FakePrimary, FakeSecondary, harness};
    use crate::quota::today;

    fn request(regen: bool) -> ImageRequest {
        ImageRequest {
            question_index: 0,
            prompt_text: "un volcán al amanecer".to_string(),
            is_regeneration: regen,
        }
    }

    const T: Duration = Duration::from_secs(12);

    #[test]
    fn entry_state_skips_primary_when_sticky_or_regen() {
        assert_eq!(entry_state(false, false), FallbackState::TryPrimary);
        assert_eq!(
            entry_state(true, false),
            FallbackState::TrySecondary(Tier::Flux)
        );
        assert_eq!(
            entry_state(false, true),
            FallbackState::TrySecondary(Tier::Flux)
        );
    }

    #[test]
    fn transition_table() {
        let t = transition(FallbackState::TryPrimary, StepKind::Success);
        assert_eq!(t.next, FallbackState::Succeeded);
        assert!(t.increment_quota && !t.set_sticky);

        let t = transition(FallbackState::TryPrimary, StepKind::QuotaExhausted);
        assert_eq!(t.next, FallbackState::TrySecondary(Tier::Flux));
        assert!(!t.increment_quota);

        let t = transition(FallbackState::TryPrimary, StepKind::Failure);
        assert_eq!(t.next, FallbackState::TrySecondary(Tier::Flux));
        assert!(t.set_sticky && !t.increment_quota);

        let t = transition(FallbackState::TrySecondary(Tier::Turbo), StepKind::Success);
        assert_eq!(t.next, FallbackState::Succeeded);
        assert!(t.set_sticky && !t.increment_quota);

        assert_eq!(
            transition(FallbackState::TrySecondary(Tier::Flux), StepKind::Failure).next,
            FallbackState::TrySecondary(Tier::Turbo)
        );
        assert_eq!(
            transition(FallbackState::TrySecondary(Tier::Turbo), StepKind::Failure).next,
            FallbackState::TrySecondary(Tier::Default)
        );
        assert_eq!(
            transition(FallbackState::TrySecondary(Tier::Default), StepKind::Failure).next,
            FallbackState::Failed
        );

        for terminal in [FallbackState::Succeeded, FallbackState::Failed] {
            let t = transition(terminal, StepKind::Success);
            assert_eq!(t, Transition::to(terminal));
        }
    }

    #[tokio::test]
    async fn primary_success_increments_quota_once() {
        let h = harness(
            FakePrimary::new(Behavior::Succeed),
            FakeSecondary::all(Behavior::Succeed),
        );
        h.quota.set(today(), 799).await;
        let sticky = AtomicBool::new(false);

        let tr = h.orchestrator.run(&request(false), &sticky, T).await;
        assert!(tr.result.unwrap().starts_with("data:image/png;base64,"));
        assert_eq!(tr.attempts.len(), 1);
        assert_eq!(tr.attempts[0].provider, Provider::Primary);
        assert_eq!(tr.attempts[0].outcome, AttemptOutcome::Success);
        assert!(!sticky.load(Ordering::SeqCst));

        h.settle().await;
        assert_eq!(h.quota.get(today()).await, 800);

        // 计数到达 800 后，下一次请求直接走 flux，不再调用主图。
        let tr = h.orchestrator.run(&request(false), &sticky, T).await;
        assert!(tr.result.is_ok());
        assert_eq!(h.primary.calls(), 1);
        assert_eq!(h.secondary.tiers(), vec![Tier::Flux]);
        assert_eq!(tr.attempts[0].provider, Provider::SecondaryA);
        assert!(sticky.load(Ordering::SeqCst));
        h.settle().await;
        assert_eq!(h.quota.get(today()).await, 800);
    }

    #[tokio::test]
    async fn primary_http_error_falls_back_without_increment() {
        let h = harness(
            FakePrimary::new(Behavior::Fail("Gemini API 错误 500: internal")),
            FakeSecondary::all(Behavior::Succeed),
        );
        let sticky = AtomicBool::new(false);

        let tr = h.orchestrator.run(&request(false), &sticky, T).await;
        let url = tr.result.unwrap();
        assert!(url.contains("/flux/"));
        assert_eq!(
            tr.attempts.iter().map(|a| a.outcome).collect::<Vec<_>>(),
            vec![AttemptOutcome::Error, AttemptOutcome::Success]
        );
        assert!(sticky.load(Ordering::SeqCst));

        h.settle().await;
        assert_eq!(h.quota.get(today()).await, 0);
    }

    #[tokio::test]
    async fn sticky_session_never_calls_primary() {
        let h = harness(
            FakePrimary::new(Behavior::Succeed),
            FakeSecondary::all(Behavior::Succeed),
        );
        let sticky = AtomicBool::new(true);

        for _ in 0..3 {
            assert!(h.orchestrator.run(&request(false), &sticky, T).await.result.is_ok());
        }
        assert_eq!(h.primary.calls(), 0);
    }

    #[tokio::test]
    async fn quota_exhausted_skips_primary_call() {
        let h = harness(
            FakePrimary::new(Behavior::Succeed),
            FakeSecondary::all(Behavior::Succeed),
        );
        h.quota.set(today(), 800).await;
        let sticky = AtomicBool::new(false);

        let tr = h.orchestrator.run(&request(false), &sticky, T).await;
        assert!(tr.result.is_ok());
        assert_eq!(h.primary.calls(), 0);
        // 配额用尽不算一次尝试。
        assert_eq!(tr.attempts.len(), 1);
        assert_eq!(tr.attempts[0].provider, Provider::SecondaryA);
    }

    #[tokio::test]
    async fn regeneration_starts_at_flux() {
        let h = harness(
            FakePrimary::new(Behavior::Succeed),
            FakeSecondary::all(Behavior::Succeed),
        );
        let sticky = AtomicBool::new(false);

        let tr = h.orchestrator.run(&request(true), &sticky, T).await;
        assert!(tr.result.is_ok());
        assert_eq!(h.primary.calls(), 0);
        assert_eq!(h.secondary.tiers(), vec![Tier::Flux]);
    }

    #[tokio::test]
    async fn tiers_are_tried_once_each_in_order() {
        let h = harness(
            FakePrimary::new(Behavior::Fail("boom")),
            FakeSecondary::all(Behavior::Fail("load error")),
        );
        let sticky = AtomicBool::new(false);

        let tr = h.orchestrator.run(&request(false), &sticky, T).await;
        assert_eq!(tr.result, Err(ImageError::AllProvidersExhausted));
        assert_eq!(h.primary.calls(), 1);
        assert_eq!(
            h.secondary.tiers(),
            vec![Tier::Flux, Tier::Turbo, Tier::Default]
        );
        assert_eq!(
            tr.attempts.iter().map(|a| a.provider).collect::<Vec<_>>(),
            vec![
                Provider::Primary,
                Provider::SecondaryA,
                Provider::SecondaryB,
                Provider::SecondaryDefault
            ]
        );
        // id 单调递增。
        assert!(tr.attempts.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn turbo_success_stops_traversal() {
        let h = harness(
            FakePrimary::new(Behavior::Fail("boom")),
            FakeSecondary::scripted(&[
                (Tier::Flux, Behavior::Fail("flux down")),
                (Tier::Turbo, Behavior::Succeed),
                (Tier::Default, Behavior::Succeed),
            ]),
        );
        let sticky = AtomicBool::new(false);

        let tr = h.orchestrator.run(&request(false), &sticky, T).await;
        assert!(tr.result.unwrap().contains("/turbo/"));
        assert_eq!(h.secondary.tiers(), vec![Tier::Flux, Tier::Turbo]);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_frees_slot_for_next_tier() {
        let h = harness(
            FakePrimary::new(Behavior::Succeed),
            FakeSecondary::scripted(&[
                (Tier::Flux, Behavior::Hang),
                (Tier::Turbo, Behavior::Succeed),
                (Tier::Default, Behavior::Succeed),
            ]),
        );
        let sticky = AtomicBool::new(true);

        let tr = h.orchestrator.run(&request(false), &sticky, T).await;
        assert!(tr.result.unwrap().contains("/turbo/"));
        assert_eq!(tr.attempts[0].outcome, AttemptOutcome::Timeout);

        let calls = h.secondary.calls();
        let gap = calls[1].1 - calls[0].1;
        assert!(gap >= T && gap < T + Duration::from_millis(5), "gap = {gap:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn primary_timeout_counts_as_failure() {
        let h = harness(
            FakePrimary::new(Behavior::Hang),
            FakeSecondary::all(Behavior::Succeed),
        );
        let sticky = AtomicBool::new(false);

        let tr = h
            .orchestrator
            .run(&request(false), &sticky, Duration::from_secs(20))
            .await;
        assert!(tr.result.is_ok());
        assert_eq!(tr.attempts[0].outcome, AttemptOutcome::Timeout);
        assert!(sticky.load(Ordering::SeqCst));
        h.settle().await;
        assert_eq!(h.quota.get(today()).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_primary_success_never_counts_against_quota() {
        let h = harness(
            FakePrimary::new(Behavior::Delay(Duration::from_secs(30))),
            FakeSecondary::all(Behavior::Succeed),
        );
        let sticky = AtomicBool::new(false);

        let tr = h.orchestrator.run(&request(false), &sticky, T).await;
        assert!(tr.result.unwrap().starts_with("fake://flux/"));
        assert_eq!(tr.attempts[0].outcome, AttemptOutcome::Timeout);

        // 越过主图的完成时间，迟到的成功也不会自增。
        tokio::time::sleep(Duration::from_secs(60)).await;
        h.settle().await;
        assert_eq!(h.quota.get(today()).await, 0);
        assert_eq!(h.primary.calls(), 1);
    }

    #[tokio::test]
    async fn stale_reports_are_ignored() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(AttemptReport {
            id: 1,
            result: Ok("stale".to_string()),
        })
        .unwrap();
        tx.send(AttemptReport {
            id: 2,
            result: Ok("fresh".to_string()),
        })
        .unwrap();

        let got = wait_for_attempt(&mut rx, 2).await.unwrap().unwrap();
        assert_eq!(got, "fresh");
    }
}
