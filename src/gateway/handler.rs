//! 图片会话 HTTP 处理器。

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
};
use serde_json::json;
use std::sync::Arc;

use crate::error::AppError;
use crate::gateway::AppState;
use crate::gateway::types::{
    AcquireRequest, AcquireResponse, CreateSessionRequest, SetCurrentRequest,
};
use crate::image::AcquireOutcome;
use crate::quota::QuotaSnapshot;
use crate::session::{ImageSession, ImageStatus, SessionView};

async fn load_session(state: &AppState, id: &str) -> Result<Arc<ImageSession>, AppError> {
    state
        .registry
        .get(id)
        .await
        .ok_or_else(|| AppError::not_found(format!("会话 {id} 不存在")))
}

/// POST /api/sessions
///
/// 创建会话后立即返回；首屏生成与后台预加载在后台进行，进度通过 GET 查询。
pub async fn handle_create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionView>), AppError> {
    let prompts: Vec<String> = req
        .questions
        .into_iter()
        .map(|q| q.visual_prompt.trim().to_string())
        .collect();

    let session = state.registry.create(prompts).await;
    let view = session.view().await;

    let scheduler = state.scheduler.clone();
    let bg = session.clone();
    let task = tokio::spawn(async move {
        // 后台预加载任务各自独立运行，这里不需要等待。
        let _ = scheduler.prepare(bg).await;
    });
    session.track([task.abort_handle()]).await;

    Ok((StatusCode::CREATED, Json(view)))
}

/// GET /api/sessions/{id}
pub async fn handle_get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, AppError> {
    let session = load_session(&state, &id).await?;
    Ok(Json(session.view().await))
}

/// DELETE /api/sessions/{id}：回到首页。
pub async fn handle_delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    if !crate::util::id::is_valid_session_id(&id) {
        return Err(AppError::bad_request("非法的会话 id"));
    }
    let existed = state.registry.remove(&id).await?;
    Ok(Json(json!({ "id": id, "deleted": existed })))
}

/// POST /api/sessions/{id}/current
///
/// 题目出现在屏幕上：标记为当前题并在后台按需取图。
pub async fn handle_set_current(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<SetCurrentRequest>,
) -> Result<Json<ImageStatus>, AppError> {
    let session = load_session(&state, &id).await?;
    if !session.set_current_index(req.index).await {
        return Err(AppError::bad_request(format!("题目下标越界: {}", req.index)));
    }

    let service = state.service.clone();
    let bg = session.clone();
    let index = req.index;
    let task = tokio::spawn(async move {
        service.acquire(&bg, index, None, false).await;
    });
    session.track([task.abort_handle()]).await;

    image_status(&session, index).await.map(Json)
}

/// POST /api/sessions/{id}/images/{index}
pub async fn handle_acquire_image(
    State(state): State<Arc<AppState>>,
    Path((id, index)): Path<(String, usize)>,
    body: Bytes,
) -> Result<Json<AcquireResponse>, AppError> {
    let session = load_session(&state, &id).await?;
    // 请求体可省略：使用存储的提示词，不强制重新生成。
    let req: AcquireRequest = if body.iter().all(u8::is_ascii_whitespace) {
        AcquireRequest::default()
    } else {
        sonic_rs::from_slice(&body)
            .map_err(|e| AppError::bad_request(format!("请求体解析失败: {e}")))?
    };

    let outcome = state
        .service
        .acquire(&session, index, req.prompt, req.force_regen)
        .await;
    if outcome == AcquireOutcome::OutOfRange {
        return Err(AppError::bad_request(format!("题目下标越界: {index}")));
    }

    let image = image_status(&session, index).await?;
    Ok(Json(AcquireResponse { outcome, image }))
}

/// GET /api/sessions/{id}/images/{index}
pub async fn handle_image_status(
    State(state): State<Arc<AppState>>,
    Path((id, index)): Path<(String, usize)>,
) -> Result<Json<ImageStatus>, AppError> {
    let session = load_session(&state, &id).await?;
    image_status(&session, index).await.map(Json)
}

/// GET /api/admin/quota
pub async fn handle_admin_quota(
    State(state): State<Arc<AppState>>,
) -> Result<Json<QuotaSnapshot>, AppError> {
    state
        .quota
        .snapshot()
        .await
        .map(Json)
        .map_err(|e| AppError::backend(format!("{e:#}")))
}

async fn image_status(session: &ImageSession, index: usize) -> Result<ImageStatus, AppError> {
    session
        .status(index)
        .await
        .ok_or_else(|| AppError::not_found(format!("题目 {index} 不存在")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::types::QuestionInput;
    use crate::image::testing::{Behavior, FakePrimary, FakeSecondary, harness};
    use crate::image::{ImageAcquisitionService, PreloadScheduler};
    use crate::quota::QuotaGuard;
    use crate::session::{RecoveryStore, SessionRegistry};
    use std::time::Duration;

    fn state() -> (Arc<AppState>, crate::image::testing::Harness) {
        state_with(Behavior::Succeed)
    }

    fn state_with(primary: Behavior) -> (Arc<AppState>, crate::image::testing::Harness) {
        let h = harness(
            FakePrimary::new(primary),
            FakeSecondary::all(Behavior::Succeed),
        );
        let recovery = Arc::new(RecoveryStore::new(
            std::env::temp_dir().join(format!("quiz-image-gateway-{}", uuid::Uuid::new_v4())),
        ));
        let service = Arc::new(ImageAcquisitionService::new(
            h.orchestrator.clone(),
            Duration::from_secs(12),
            Duration::from_secs(20),
            Some(recovery.clone()),
        ));
        let state = Arc::new(AppState {
            registry: SessionRegistry::new(recovery),
            scheduler: Arc::new(PreloadScheduler::new(
                service.clone(),
                Duration::from_secs(4),
                3,
            )),
            service,
            quota: QuotaGuard::new(h.quota.clone(), 800),
        });
        (state, h)
    }

    fn create_request(n: usize) -> CreateSessionRequest {
        CreateSessionRequest {
            questions: (0..n)
                .map(|i| QuestionInput {
                    visual_prompt: format!("  scene {i} "),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn unknown_session_is_404() {
        let (state, _) = state();
        let err = handle_get_session(State(state), Path("img-nope".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn create_returns_fresh_view() {
        let (state, _) = state();
        let (status, Json(view)) =
            handle_create_session(State(state.clone()), Json(create_request(2)))
                .await
                .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(view.questions.len(), 2);
        let session = state.registry.get(&view.id).await.unwrap();
        assert_eq!(session.prompt(0).await.as_deref(), Some("scene 0"));
        let _ = tokio::fs::remove_dir_all(state.registry.recovery().dir()).await;
    }

    #[tokio::test]
    async fn acquire_and_status_flow() {
        let (state, h) = state();
        let session = state
            .registry
            .create(vec!["scene 0".to_string(), "scene 1".to_string()])
            .await;
        let id = session.id().to_string();

        let Json(resp) = handle_acquire_image(
            State(state.clone()),
            Path((id.clone(), 1)),
            Bytes::from_static(br#"{"forceRegen":true}"#),
        )
        .await
        .unwrap();
        assert!(matches!(resp.outcome, AcquireOutcome::Succeeded { .. }));
        assert!(resp.image.ready);
        assert_eq!(h.secondary.tiers(), vec![crate::image::types::Tier::Flux]);

        let Json(st) = handle_image_status(State(state.clone()), Path((id.clone(), 1)))
            .await
            .unwrap();
        assert_eq!(st.display_image, st.image_url);

        let err =
            handle_acquire_image(State(state.clone()), Path((id.clone(), 7)), Bytes::new())
                .await
                .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        let Json(body) = handle_delete_session(State(state.clone()), Path(id.clone()))
            .await
            .unwrap();
        assert_eq!(body["deleted"], true);
        assert!(state.registry.get(&id).await.is_none());
        let _ = tokio::fs::remove_dir_all(state.registry.recovery().dir()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_session_is_not_restored_by_late_acquire() {
        let (state, h) = state_with(Behavior::Delay(Duration::from_secs(2)));
        let session = state.registry.create(vec!["scene 0".to_string()]).await;
        let id = session.id().to_string();

        let service = state.service.clone();
        let bg = session.clone();
        let pending = tokio::spawn(async move { service.acquire(&bg, 0, None, false).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        let Json(body) = handle_delete_session(State(state.clone()), Path(id.clone()))
            .await
            .unwrap();
        assert_eq!(body["deleted"], true);

        pending.await.unwrap();
        assert_eq!(h.primary.calls(), 1);
        assert!(state.registry.recovery().load(&id).await.is_none());
        let err = handle_get_session(State(state.clone()), Path(id))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        let _ = tokio::fs::remove_dir_all(state.registry.recovery().dir()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn delete_stops_background_preload() {
        let (state, h) = state();
        let (_, Json(view)) =
            handle_create_session(State(state.clone()), Json(create_request(6)))
                .await
                .unwrap();

        // 首屏 3 题完成，剩余 3 题仍在等待。
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.primary.calls(), 3);

        handle_delete_session(State(state.clone()), Path(view.id.clone()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(h.primary.calls(), 3);
        assert!(state.registry.get(&view.id).await.is_none());
        let _ = tokio::fs::remove_dir_all(state.registry.recovery().dir()).await;
    }

    #[tokio::test]
    async fn admin_quota_reports_counter() {
        let (state, h) = state();
        h.quota.set(crate::quota::today(), 120).await;
        let Json(snap) = handle_admin_quota(State(state)).await.unwrap();
        assert_eq!(snap.image_count, 120);
        assert_eq!(snap.remaining, 680);
    }
}
