//! 图片后端接缝：编排器只依赖这两个 trait，便于用进程内替身测试。

use crate::image::types::Tier;
use futures::future::BoxFuture;

/// 主图后端：一次调用直接返回可用的图片引用（data URI）。
pub trait PrimaryProvider: Send + Sync {
    fn generate<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, anyhow::Result<String>>;
}

/// 备用后端：先构造图片地址，再“加载”该地址；加载成功即可把地址作为图片引用。
pub trait SecondaryProvider: Send + Sync {
    fn build_url(&self, prompt: &str, tier: Tier) -> String;

    fn load<'a>(&'a self, url: &'a str) -> BoxFuture<'a, anyhow::Result<()>>;
}
