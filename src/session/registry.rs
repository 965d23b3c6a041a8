use crate::session::recovery::RecoveryStore;
use crate::session::state::ImageSession;
use crate::util::id;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

const SESSION_CAPACITY: u64 = 10_000;
const SESSION_IDLE: Duration = Duration::from_secs(6 * 60 * 60);

/// 内存中的活跃会话。闲置超时后释放，之后访问会从恢复快照重建。
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Cache<String, Arc<ImageSession>>,
    recovery: Arc<RecoveryStore>,
}

impl SessionRegistry {
    pub fn new(recovery: Arc<RecoveryStore>) -> Self {
        Self {
            sessions: Cache::builder()
                .max_capacity(SESSION_CAPACITY)
                .time_to_idle(SESSION_IDLE)
                .build(),
            recovery,
        }
    }

    pub fn recovery(&self) -> &Arc<RecoveryStore> {
        &self.recovery
    }

    pub async fn create(&self, prompts: Vec<String>) -> Arc<ImageSession> {
        let session = Arc::new(ImageSession::new(id::session_id(), prompts));
        self.sessions
            .insert(session.id().to_string(), session.clone())
            .await;
        if let Err(e) = session.save_to(&self.recovery).await {
            tracing::warn!(session = session.id(), "保存会话快照失败: {e:#}");
        }
        tracing::info!(session = session.id(), "创建图片会话");
        session
    }

    pub async fn get(&self, id: &str) -> Option<Arc<ImageSession>> {
        if !id::is_valid_session_id(id) {
            return None;
        }
        let recovery = self.recovery.clone();
        let key = id.to_string();
        self.sessions
            .optionally_get_with(key.clone(), async move {
                let snap = recovery.load(&key).await?;
                tracing::info!(session = %key, "从恢复快照重建会话");
                Some(Arc::new(ImageSession::from_snapshot(snap)))
            })
            .await
    }

    /// 回到首页：关闭会话（中止后台取图、禁止再写快照），再清除其快照。
    pub async fn remove(&self, id: &str) -> anyhow::Result<bool> {
        let removed = self.sessions.remove(id).await;
        if let Some(session) = &removed {
            session.close().await;
        }
        self.recovery.remove(id).await?;
        Ok(removed.is_some())
    }
}
