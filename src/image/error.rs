use crate::image::types::Provider;
use std::time::Duration;
use thiserror::Error;

/// 取图过程中的错误分类。
///
/// 只有 `AllProvidersExhausted` 会作为错误标记传到界面状态，其余在编排器内部记录后吞掉。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ImageError {
    #[error("主图后端今日配额已用尽")]
    QuotaExceeded,

    #[error("{provider} 超时（{}ms）", .timeout.as_millis())]
    ProviderTimeout {
        provider: Provider,
        timeout: Duration,
    },

    #[error("{provider} 失败: {message}")]
    ProviderError { provider: Provider, message: String },

    #[error("所有图片后端均失败")]
    AllProvidersExhausted,
}
