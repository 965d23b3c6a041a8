use crate::config::Config;
use crate::image::provider::SecondaryProvider;
use crate::image::types::Tier;
use crate::logging::{self, LogLevel};
use crate::util::{http, id};
use futures::future::BoxFuture;
use reqwest::header::{CONTENT_TYPE, HeaderMap};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Pollinations 返回状态 {status}")]
    Http { status: u16 },

    #[error("Pollinations 返回的不是图片: {content_type}")]
    NotImage { content_type: String },

    #[error("Pollinations 返回了空图片")]
    Empty,

    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct PollinationsClient {
    http: reqwest::Client,
    base_url: String,
    width: u32,
    height: u32,
    log_level: LogLevel,
}

impl PollinationsClient {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            http: http::build_client(cfg)?,
            base_url: cfg.pollinations_base_url.trim_end_matches('/').to_string(),
            width: cfg.image_width,
            height: cfg.image_height,
            log_level: cfg.log_level(),
        })
    }

    /// 生成图片地址：提示词 URL 编码，附带尺寸、可选模型、去水印与随机 seed。
    pub fn image_url(&self, prompt: &str, tier: Tier, seed: u32) -> String {
        let model = tier
            .model_param()
            .map(|m| format!("&model={m}"))
            .unwrap_or_default();
        format!(
            "{}/prompt/{}?width={}&height={}{model}&nologo=true&seed={seed}",
            self.base_url,
            urlencoding::encode(prompt),
            self.width,
            self.height,
        )
    }

    /// 加载一张图片。成功条件：2xx、`image/*` 类型、非空内容。返回字节数。
    ///
    /// 丢弃返回的 future 即取消本次加载。
    pub async fn load_image(&self, url: &str) -> Result<usize, LoadError> {
        logging::backend_request(self.log_level, "GET", url, &HeaderMap::new(), &[]);

        let start = std::time::Instant::now();
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let bytes = resp.bytes().await?;

        let is_image = content_type.trim().to_lowercase().starts_with("image/");
        logging::backend_response(
            self.log_level,
            "GET",
            url,
            status.as_u16(),
            start.elapsed(),
            &bytes,
            is_image,
        );

        if !status.is_success() {
            return Err(LoadError::Http {
                status: status.as_u16(),
            });
        }
        if !is_image {
            return Err(LoadError::NotImage { content_type });
        }
        if bytes.is_empty() {
            return Err(LoadError::Empty);
        }
        Ok(bytes.len())
    }
}

impl SecondaryProvider for PollinationsClient {
    fn build_url(&self, prompt: &str, tier: Tier) -> String {
        self.image_url(prompt, tier, id::image_seed())
    }

    fn load<'a>(&'a self, url: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.load_image(url).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> PollinationsClient {
        let cfg = Config {
            pollinations_base_url: "https://image.pollinations.ai/".to_string(),
            ..Config::default()
        };
        PollinationsClient::new(&cfg).unwrap()
    }

    #[test]
    fn image_url_encodes_prompt_and_tier() {
        let c = client();
        assert_eq!(
            c.image_url("un zorro rojo & nieve", Tier::Flux, 42),
            "https://image.pollinations.ai/prompt/un%20zorro%20rojo%20%26%20nieve?width=1024&height=600&model=flux&nologo=true&seed=42"
        );
        assert_eq!(
            c.image_url("x", Tier::Turbo, 7),
            "https://image.pollinations.ai/prompt/x?width=1024&height=600&model=turbo&nologo=true&seed=7"
        );
    }

    #[test]
    fn default_tier_omits_model_param() {
        let url = client().image_url("x", Tier::Default, 1);
        assert!(!url.contains("model="));
        assert!(url.ends_with("&nologo=true&seed=1"));
    }

    #[test]
    fn build_url_randomizes_seed_within_range() {
        let url = client().build_url("x", Tier::Flux);
        let seed: u32 = url.rsplit("seed=").next().unwrap().parse().unwrap();
        assert!(seed < 1_000_000);
    }
}
