//! 备用图片后端（Pollinations，免费、按模型分级）。

pub mod client;

pub use client::{LoadError, PollinationsClient};
