//! 预加载：首屏前几题顺序生成，其余题目按固定间隔在后台依次取图。

use crate::image::service::{AcquireOutcome, ImageAcquisitionService};
use crate::session::ImageSession;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const PROGRESS_START: f64 = 40.0;
const PROGRESS_SPAN: f64 = 55.0;
const PROGRESS_CAP: f64 = 95.0;

pub struct PreloadScheduler {
    service: Arc<ImageAcquisitionService>,
    stagger: Duration,
    initial_count: usize,
}

impl PreloadScheduler {
    pub fn new(service: Arc<ImageAcquisitionService>, stagger: Duration, initial_count: usize) -> Self {
        Self {
            service,
            stagger,
            initial_count,
        }
    }

    /// 首屏路径：顺序生成前 `min(initial_count, 题目数)` 题，返回实际生成的题数。
    ///
    /// 失败只记日志，不中断后续题目。
    pub async fn run_initial(&self, session: &ImageSession, mut on_progress: impl FnMut(u8)) -> usize {
        let total = session.question_count().await;
        let count = self.initial_count.min(total);
        if count == 0 {
            on_progress(100);
            return 0;
        }

        on_progress(PROGRESS_START as u8);
        for index in 0..count {
            if self.service.acquire_smart(session, index).await == AcquireOutcome::Failed {
                tracing::warn!(session = session.id(), index, "首屏图片生成失败，继续下一题");
            }
            on_progress(initial_progress(index + 1, count));
        }
        on_progress(100);
        count
    }

    /// 从 `start` 开始为剩余题目各派发一个独立的延迟任务：第 k 个（从 1 计）在 `k * stagger` 后取图。
    ///
    /// 各任务互不等待，某题失败不影响其它题。
    pub async fn schedule(&self, session: Arc<ImageSession>, start: usize) -> Vec<JoinHandle<()>> {
        let total = session.question_count().await;
        if start >= total {
            return Vec::new();
        }
        tracing::info!(
            session = session.id(),
            count = total - start,
            "开始后台预加载剩余图片"
        );

        (start..total)
            .map(|index| {
                let step = u32::try_from(index - start + 1).unwrap_or(u32::MAX);
                let delay = self.stagger.saturating_mul(step);
                let service = self.service.clone();
                let session = session.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if session.is_closed() {
                        return;
                    }
                    let outcome = service.acquire(&session, index, None, false).await;
                    tracing::debug!(session = session.id(), index, ?outcome, "后台预加载结束");
                })
            })
            .collect()
    }

    /// 完整的生成流程：首屏同步部分 + 后台预加载剩余部分。进度写回会话。
    ///
    /// 后台任务登记在会话上，会话关闭时一并中止。
    pub async fn prepare(&self, session: Arc<ImageSession>) -> Vec<JoinHandle<()>> {
        let done = self
            .run_initial(&session, |p| session.set_progress(p))
            .await;
        if session.is_closed() {
            return Vec::new();
        }
        let handles = self.schedule(session.clone(), done).await;
        session
            .track(handles.iter().map(JoinHandle::abort_handle))
            .await;
        handles
    }
}

/// 已完成 `done` / `count` 题时的进度百分比。
fn initial_progress(done: usize, count: usize) -> u8 {
    let p = PROGRESS_START + PROGRESS_SPAN * done as f64 / count as f64;
    p.round().min(PROGRESS_CAP) as u8
}
