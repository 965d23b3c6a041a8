//! HTTP 网关：会话、取图与配额查看接口。

pub mod handler;
pub mod types;

use crate::image::{ImageAcquisitionService, PreloadScheduler};
use crate::quota::QuotaGuard;
use crate::session::SessionRegistry;
use std::sync::Arc;

pub use handler::*;

/// 各路由共享的应用状态。
pub struct AppState {
    pub registry: SessionRegistry,
    pub service: Arc<ImageAcquisitionService>,
    pub scheduler: Arc<PreloadScheduler>,
    pub quota: QuotaGuard,
}
