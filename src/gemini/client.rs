use crate::config::Config;
use crate::gemini::types::{Request, Response};
use crate::image::provider::PrimaryProvider;
use crate::logging::{self, LogLevel};
use crate::util::http;
use futures::future::BoxFuture;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("未配置 GEMINI_API_KEY")]
    MissingApiKey,

    #[error("Gemini API 错误 {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Gemini 响应中没有图片数据")]
    NoImageData,

    #[error("Gemini 图片数据无效: {0}")]
    InvalidImage(String),

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] sonic_rs::Error),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// 主图后端：Gemini generateContent（计量、高质量）。
#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    log_level: LogLevel,
}

impl GeminiClient {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            http: http::build_client(cfg)?,
            base_url: cfg.gemini_base_url.trim_end_matches('/').to_string(),
            model: cfg.gemini_image_model.clone(),
            api_key: cfg.gemini_api_key.trim().to_string(),
            log_level: cfg.log_level(),
        })
    }

    pub fn generate_url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        )
    }

    fn build_headers(&self) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(v) = HeaderValue::from_str(&self.api_key) {
            h.insert("x-goog-api-key", v);
        }
        h
    }

    /// 生成一张图片，返回 data URI。任何失败都直接返回错误，不在此处重试。
    pub async fn generate_image(&self, prompt: &str) -> Result<String, ApiError> {
        if self.api_key.is_empty() {
            return Err(ApiError::MissingApiKey);
        }

        let url = self.generate_url();
        let body = sonic_rs::to_vec(&Request::from_prompt(prompt))?;
        let headers = self.build_headers();
        logging::backend_request(self.log_level, "POST", &url, &headers, &body);

        let start = std::time::Instant::now();
        let resp = self
            .http
            .post(url.clone())
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let bytes = resp.bytes().await?;
        logging::backend_response(
            self.log_level,
            "POST",
            &url,
            status.as_u16(),
            start.elapsed(),
            &bytes,
            false,
        );

        if !status.is_success() {
            return Err(extract_error_details(status.as_u16(), &bytes));
        }

        let parsed = sonic_rs::from_slice::<Response>(&bytes)?;
        extract_image(&parsed)
    }
}

impl PrimaryProvider for GeminiClient {
    fn generate<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async move { Ok(self.generate_image(prompt).await?) })
    }
}

/// 从 generateContent 响应中取出第一张内联图片并校验其负载。
pub fn extract_image(resp: &Response) -> Result<String, ApiError> {
    let Some(inline) = resp.first_inline_image() else {
        if let Some(text) = resp.first_text() {
            tracing::warn!("Gemini 只返回了文本: {}", truncate_chars(text, 200));
        }
        if let Some(reason) = resp.block_reason() {
            tracing::warn!("Gemini 拒绝生成: {reason}");
        }
        return Err(ApiError::NoImageData);
    };

    match inline.decoded_len() {
        Ok(0) => Err(ApiError::InvalidImage("图片数据为空".to_string())),
        Ok(_) => Ok(inline.to_data_uri()),
        Err(e) => Err(ApiError::InvalidImage(e.to_string())),
    }
}

fn extract_error_details(status: u16, body: &[u8]) -> ApiError {
    #[derive(Debug, serde::Deserialize)]
    struct ErrResp {
        error: ErrInner,
    }

    #[derive(Debug, serde::Deserialize)]
    struct ErrInner {
        #[serde(default)]
        message: String,
        #[serde(default)]
        status: String,
    }

    let message = match sonic_rs::from_slice::<ErrResp>(body) {
        Ok(r) if !r.error.status.is_empty() => {
            format!("{} ({})", r.error.message, r.error.status)
        }
        Ok(r) if !r.error.message.is_empty() => r.error.message,
        _ => truncate_chars(&String::from_utf8_lossy(body), 200),
    };

    ApiError::Http { status, message }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push_str("...");
    out
}
