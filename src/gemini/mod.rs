//! 主图后端（Gemini 图片模型）。

pub mod client;
pub mod types;

pub use client::{ApiError, GeminiClient};
