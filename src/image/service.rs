//! 取图服务：把编排器的遍历结果落到会话的题目状态上。
//!
//! 对同一题目的取图是幂等的：已有图片且未强制重新生成时直接返回，
//! 正在进行中时不会重复发起网络请求。

use crate::image::orchestrator::FallbackOrchestrator;
use crate::image::types::ImageRequest;
use crate::image::error::ImageError;
use crate::session::{ImageSession, RecoveryStore, SessionState};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum AcquireOutcome {
    /// 提示词为空或会话已关闭，什么都没做。
    Skipped,
    OutOfRange,
    InFlight,
    AlreadyPresent,
    #[serde(rename_all = "camelCase")]
    Succeeded { image_url: String },
    Failed,
}

/// [`begin`] 的判定结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Begin {
    OutOfRange,
    InFlight,
    AlreadyPresent,
    Started,
}

/// 开始一次取图前的状态检查与标记，必须在同一把写锁内完成。
pub fn begin(state: &mut SessionState, index: usize, force_regen: bool) -> Begin {
    let is_current = state.current_index == Some(index);
    let Some(q) = state.questions.get_mut(index) else {
        return Begin::OutOfRange;
    };
    if q.in_flight {
        return Begin::InFlight;
    }
    if q.has_image() && !force_regen {
        q.ready = true;
        return Begin::AlreadyPresent;
    }

    q.in_flight = true;
    if is_current {
        // 没有旧图 → 显示加载中；有旧图 → 保留旧图并显示“重新生成中”。
        q.regenerating = force_regen && q.has_image();
        q.ready = false;
    }
    Begin::Started
}

/// 把遍历结果写回题目状态。失败时保留原有图片。
pub fn complete(state: &mut SessionState, index: usize, result: &Result<String, ImageError>) {
    let Some(q) = state.questions.get_mut(index) else {
        return;
    };
    match result {
        Ok(url) => {
            q.image_url = Some(url.clone());
            q.error = false;
        }
        Err(_) => {
            q.error = true;
        }
    }
    q.ready = true;
    q.regenerating = false;
    q.in_flight = false;
}

pub struct ImageAcquisitionService {
    orchestrator: Arc<FallbackOrchestrator>,
    attempt_timeout: Duration,
    smart_timeout: Duration,
    recovery: Option<Arc<RecoveryStore>>,
}

impl ImageAcquisitionService {
    pub fn new(
        orchestrator: Arc<FallbackOrchestrator>,
        attempt_timeout: Duration,
        smart_timeout: Duration,
        recovery: Option<Arc<RecoveryStore>>,
    ) -> Self {
        Self {
            orchestrator,
            attempt_timeout,
            smart_timeout,
            recovery,
        }
    }

    /// 按需取图（题目出现在屏幕上、手动重新生成、后台预加载）。
    pub async fn acquire(
        &self,
        session: &ImageSession,
        index: usize,
        prompt: Option<String>,
        force_regen: bool,
    ) -> AcquireOutcome {
        self.acquire_with(session, index, prompt, force_regen, self.attempt_timeout)
            .await
    }

    /// 首屏生成路径：使用存储的提示词和更长的前台超时。
    pub async fn acquire_smart(&self, session: &ImageSession, index: usize) -> AcquireOutcome {
        self.acquire_with(session, index, None, false, self.smart_timeout)
            .await
    }

    async fn acquire_with(
        &self,
        session: &ImageSession,
        index: usize,
        prompt: Option<String>,
        force_regen: bool,
        timeout: Duration,
    ) -> AcquireOutcome {
        let prompt = match prompt {
            Some(p) => Some(p),
            None => session.prompt(index).await,
        };
        let Some(prompt) = prompt.map(|p| p.trim().to_string()) else {
            return AcquireOutcome::OutOfRange;
        };
        if prompt.is_empty() || session.is_closed() {
            return AcquireOutcome::Skipped;
        }

        match session.update(|s| begin(s, index, force_regen)).await {
            Begin::OutOfRange => return AcquireOutcome::OutOfRange,
            Begin::InFlight => {
                tracing::debug!(session = session.id(), index, "取图进行中，跳过");
                return AcquireOutcome::InFlight;
            }
            Begin::AlreadyPresent => return AcquireOutcome::AlreadyPresent,
            Begin::Started => {}
        }

        let req = ImageRequest {
            question_index: index,
            prompt_text: prompt,
            is_regeneration: force_regen,
        };
        let traversal = self
            .orchestrator
            .run(&req, session.sticky(), timeout)
            .await;

        session.update(|s| complete(s, index, &traversal.result)).await;
        self.persist(session).await;

        match traversal.result {
            Ok(image_url) => {
                tracing::info!(
                    session = session.id(),
                    index,
                    attempts = traversal.attempts.len(),
                    "图片就绪"
                );
                AcquireOutcome::Succeeded { image_url }
            }
            Err(_) => AcquireOutcome::Failed,
        }
    }

    async fn persist(&self, session: &ImageSession) {
        let Some(recovery) = &self.recovery else {
            return;
        };
        if let Err(e) = session.save_to(recovery).await {
            tracing::warn!(session = session.id(), "保存会话快照失败: {e:#}");
        }
    }
}
