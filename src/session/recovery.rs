use crate::session::state::SessionSnapshot;
use crate::util::id::is_valid_session_id;
use anyhow::{Context, anyhow};
use std::path::{Path, PathBuf};

/// 会话恢复快照：`{DATA_DIR}/recovery/{id}.json`，每个会话一个文件。
#[derive(Debug, Clone)]
pub struct RecoveryStore {
    dir: PathBuf,
}

impl RecoveryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> anyhow::Result<PathBuf> {
        if !is_valid_session_id(id) {
            return Err(anyhow!("非法的会话 id: {id:?}"));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    /// 先写临时文件再 rename，读者不会看到写了一半的快照。
    pub async fn save(&self, snap: &SessionSnapshot) -> anyhow::Result<()> {
        let path = self.path_for(&snap.id)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .context("创建 recovery 目录失败")?;

        let data = sonic_rs::to_vec_pretty(snap).context("序列化会话快照失败")?;
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", snap.id, uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, data)
            .await
            .context("写入会话快照失败")?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e).context("替换会话快照失败");
        }
        Ok(())
    }

    /// 不存在或无法解析时返回 None。
    pub async fn load(&self, id: &str) -> Option<SessionSnapshot> {
        let path = self.path_for(id).ok()?;
        let data = tokio::fs::read(&path).await.ok()?;
        match sonic_rs::from_slice::<SessionSnapshot>(&data) {
            Ok(snap) if snap.id == id => Some(snap),
            Ok(_) => {
                tracing::warn!(session = id, "会话快照 id 不匹配，忽略");
                None
            }
            Err(e) => {
                tracing::warn!(session = id, "解析会话快照失败: {e}");
                None
            }
        }
    }

    pub async fn remove(&self, id: &str) -> anyhow::Result<()> {
        let path = self.path_for(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("删除会话快照失败"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::state::QuestionSnapshot;
    use chrono::Utc;

    fn temp_store() -> RecoveryStore {
        RecoveryStore::new(
            std::env::temp_dir().join(format!("quiz-image-recovery-{}", uuid::Uuid::new_v4())),
        )
    }

    fn snapshot(id: &str) -> SessionSnapshot {
        SessionSnapshot {
            id: id.to_string(),
            current_index: Some(2),
            using_fallback_provider: true,
            questions: vec![QuestionSnapshot {
                prompt: "a red fox in snow".to_string(),
                image_url: Some("https://image.pollinations.ai/prompt/fox".to_string()),
                error: false,
            }],
            saved_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_load_remove() {
        let store = temp_store();
        store.save(&snapshot("img-abc")).await.unwrap();

        let loaded = store.load("img-abc").await.unwrap();
        assert_eq!(loaded.current_index, Some(2));
        assert!(loaded.using_fallback_provider);
        assert_eq!(loaded.questions.len(), 1);

        // 覆盖写不留下临时文件。
        store.save(&snapshot("img-abc")).await.unwrap();
        let mut names = Vec::new();
        let mut rd = tokio::fs::read_dir(store.dir()).await.unwrap();
        while let Some(de) = rd.next_entry().await.unwrap() {
            names.push(de.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["img-abc.json".to_string()]);

        store.remove("img-abc").await.unwrap();
        assert!(store.load("img-abc").await.is_none());
        // 重复删除不报错。
        store.remove("img-abc").await.unwrap();

        let _ = tokio::fs::remove_dir_all(store.dir()).await;
    }

    #[tokio::test]
    async fn rejects_invalid_ids() {
        let store = temp_store();
        assert!(store.save(&snapshot("../escape")).await.is_err());
        assert!(store.load("../escape").await.is_none());
        assert!(store.remove("a/b").await.is_err());
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_ignored() {
        let store = temp_store();
        tokio::fs::create_dir_all(store.dir()).await.unwrap();
        tokio::fs::write(store.dir().join("img-bad.json"), b"{not json")
            .await
            .unwrap();
        assert!(store.load("img-bad").await.is_none());
        let _ = tokio::fs::remove_dir_all(store.dir()).await;
    }
}
