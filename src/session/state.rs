use crate::session::recovery::RecoveryStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tokio::sync::{Mutex, RwLock};
use tokio::task::AbortHandle;

/// 单道题目的图片状态。
#[derive(Debug, Clone, Default)]
pub struct QuestionImageState {
    pub prompt: String,
    pub image_url: Option<String>,
    /// 取图流程已结束（成功或失败）。
    pub ready: bool,
    /// 所有后端都失败。
    pub error: bool,
    /// 已有图片正在被替换。
    pub regenerating: bool,
    /// 该题已有一次取图在进行中。
    pub in_flight: bool,
}

impl QuestionImageState {
    pub fn new(prompt: String) -> Self {
        Self {
            prompt,
            ..Self::default()
        }
    }

    pub fn has_image(&self) -> bool {
        self.image_url.as_deref().is_some_and(|u| !u.is_empty())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub current_index: Option<usize>,
    pub questions: Vec<QuestionImageState>,
}

/// 一次答题会话的图片状态。
///
/// `sticky` 一旦置位，本会话后续的所有请求都跳过主图后端。
/// 关闭（回到首页）后不再写快照，挂在会话上的后台任务全部中止。
#[derive(Debug)]
pub struct ImageSession {
    id: String,
    sticky: AtomicBool,
    progress: AtomicU8,
    inner: RwLock<SessionState>,
    closed: AtomicBool,
    /// 快照写入与关闭互斥。
    save_lock: Mutex<()>,
    tasks: Mutex<Vec<AbortHandle>>,
}

/// 持久化到恢复目录的会话快照。不含二进制图片数据。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: String,
    #[serde(default)]
    pub current_index: Option<usize>,
    #[serde(default)]
    pub using_fallback_provider: bool,
    #[serde(default)]
    pub questions: Vec<QuestionSnapshot>,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionSnapshot {
    pub prompt: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub error: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStatus {
    pub index: usize,
    pub image_url: Option<String>,
    pub ready: bool,
    pub error: bool,
    pub regenerating: bool,
    /// 当前题没有图片时回退到最近的前一张有效图片。
    pub display_image: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub id: String,
    pub progress: u8,
    pub current_index: Option<usize>,
    pub using_fallback_provider: bool,
    pub questions: Vec<ImageStatus>,
}

impl ImageSession {
    pub fn new(id: String, prompts: Vec<String>) -> Self {
        Self {
            id,
            sticky: AtomicBool::new(false),
            progress: AtomicU8::new(0),
            inner: RwLock::new(SessionState {
                current_index: None,
                questions: prompts.into_iter().map(QuestionImageState::new).collect(),
            }),
            closed: AtomicBool::new(false),
            save_lock: Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// 从快照恢复：全部 `ready=false`，没有进行中的取图。
    pub fn from_snapshot(snap: SessionSnapshot) -> Self {
        let questions = snap
            .questions
            .into_iter()
            .map(|q| QuestionImageState {
                prompt: q.prompt,
                image_url: q.image_url.filter(|u| !u.is_empty()),
                error: q.error,
                ..QuestionImageState::default()
            })
            .collect();
        Self {
            id: snap.id,
            sticky: AtomicBool::new(snap.using_fallback_provider),
            // 恢复的会话不会重跑首屏生成。
            progress: AtomicU8::new(100),
            inner: RwLock::new(SessionState {
                current_index: snap.current_index,
                questions,
            }),
            closed: AtomicBool::new(false),
            save_lock: Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sticky(&self) -> &AtomicBool {
        &self.sticky
    }

    pub fn using_fallback_provider(&self) -> bool {
        self.sticky.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> u8 {
        self.progress.load(Ordering::SeqCst)
    }

    pub fn set_progress(&self, value: u8) {
        self.progress.store(value.min(100), Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 登记属于本会话的后台任务；会话已关闭时立即中止。
    pub async fn track(&self, handles: impl IntoIterator<Item = AbortHandle>) {
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|h| !h.is_finished());
        for handle in handles {
            if self.is_closed() {
                handle.abort();
            } else {
                tasks.push(handle);
            }
        }
    }

    /// 关闭会话：等待进行中的快照写入结束，之后的写入都会被跳过。
    pub async fn close(&self) {
        {
            let _guard = self.save_lock.lock().await;
            self.closed.store(true, Ordering::SeqCst);
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for handle in tasks {
            handle.abort();
        }
    }

    /// 写入恢复快照。同一会话的写入串行进行；已关闭的会话返回 `Ok(false)`。
    pub async fn save_to(&self, store: &RecoveryStore) -> anyhow::Result<bool> {
        let _guard = self.save_lock.lock().await;
        if self.is_closed() {
            return Ok(false);
        }
        store.save(&self.snapshot().await).await?;
        Ok(true)
    }

    pub async fn question_count(&self) -> usize {
        self.inner.read().await.questions.len()
    }

    pub async fn read<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        let state = self.inner.read().await;
        f(&state)
    }

    pub async fn update<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut state = self.inner.write().await;
        f(&mut state)
    }

    pub async fn prompt(&self, index: usize) -> Option<String> {
        self.read(|s| s.questions.get(index).map(|q| q.prompt.clone()))
            .await
    }

    /// 标记当前显示的题目；越界返回 false。
    pub async fn set_current_index(&self, index: usize) -> bool {
        self.update(|s| {
            if index >= s.questions.len() {
                return false;
            }
            s.current_index = Some(index);
            true
        })
        .await
    }

    pub async fn status(&self, index: usize) -> Option<ImageStatus> {
        self.read(|s| status_of(s, index)).await
    }

    pub async fn view(&self) -> SessionView {
        let (current_index, questions) = self
            .read(|s| {
                let questions = (0..s.questions.len())
                    .filter_map(|i| status_of(s, i))
                    .collect();
                (s.current_index, questions)
            })
            .await;
        SessionView {
            id: self.id.clone(),
            progress: self.progress(),
            current_index,
            using_fallback_provider: self.using_fallback_provider(),
            questions,
        }
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let (current_index, questions) = self
            .read(|s| {
                let questions = s
                    .questions
                    .iter()
                    .map(|q| QuestionSnapshot {
                        prompt: q.prompt.clone(),
                        image_url: q.image_url.clone().filter(|u| !is_inline_payload(u)),
                        error: q.error,
                    })
                    .collect();
                (s.current_index, questions)
            })
            .await;
        SessionSnapshot {
            id: self.id.clone(),
            current_index,
            using_fallback_provider: self.using_fallback_provider(),
            questions,
            saved_at: Utc::now(),
        }
    }
}

/// `data:` URI 直接携带图片字节，不写入快照。
fn is_inline_payload(url: &str) -> bool {
    url.starts_with("data:")
}

fn status_of(state: &SessionState, index: usize) -> Option<ImageStatus> {
    let q = state.questions.get(index)?;
    Some(ImageStatus {
        index,
        image_url: q.image_url.clone(),
        ready: q.ready,
        error: q.error,
        regenerating: q.regenerating,
        display_image: display_image(state, index),
    })
}

/// 本题或之前最近一题的有效图片。
fn display_image(state: &SessionState, index: usize) -> Option<String> {
    let end = index.min(state.questions.len().checked_sub(1)?);
    state.questions[..=end]
        .iter()
        .rev()
        .find(|q| q.has_image())
        .and_then(|q| q.image_url.clone())
}
