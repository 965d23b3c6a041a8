use reqwest::header::HeaderMap;
use sonic_rs::prelude::*;
use std::borrow::Cow;
use std::time::Duration;

/// 后端（图片提供方/配额服务）请求日志等级：
/// - off：不输出
/// - low：每次请求一行摘要（方法、地址、状态、耗时）
/// - medium：输出请求/响应（格式化/脱敏，base64 图片会被截断）
/// - high：完全原始输出
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "low" | "summary" => Self::Low,
            "medium" | "backend" => Self::Medium,
            "high" | "all" | "raw" => Self::High,
            _ => Self::Off,
        }
    }

    pub fn summary_enabled(self) -> bool {
        self >= Self::Low
    }

    pub fn body_enabled(self) -> bool {
        self >= Self::Medium
    }

    pub fn raw_enabled(self) -> bool {
        self >= Self::High
    }
}

pub fn format_duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

/// 按日志等级输出一次后端请求。
pub fn backend_request(level: LogLevel, method: &str, url: &str, headers: &HeaderMap, body: &[u8]) {
    if !level.body_enabled() {
        return;
    }
    let url = redact_url(url);
    if level.raw_enabled() {
        tracing::info!(
            "\n=================== 后端请求（RAW） ===================\n[后端请求] {method} {url}\n[后端请求头]\n{}\n[后端请求体]\n{}\n=========================================================",
            format_headers(headers),
            String::from_utf8_lossy(body),
        );
        return;
    }
    tracing::info!(
        "\n====================== 后端请求 ========================\n[后端请求] {method} {url}\n[后端请求头]\n{}\n{}\n==========================================================",
        format_headers(headers),
        format_body_bytes(body)
    );
}

/// 按日志等级输出一次后端响应。图片二进制响应只记录长度。
pub fn backend_response(
    level: LogLevel,
    method: &str,
    url: &str,
    status: u16,
    duration: Duration,
    body: &[u8],
    is_binary: bool,
) {
    if !level.summary_enabled() {
        return;
    }
    let url = redact_url(url);
    let ms = format_duration_ms(duration);
    if !level.body_enabled() {
        tracing::info!("[后端] {method} {url} -> {status} {ms}ms ({} bytes)", body.len());
        return;
    }

    let rendered = if is_binary {
        format!("(binary body: {} bytes)", body.len())
    } else if level.raw_enabled() {
        String::from_utf8_lossy(body).to_string()
    } else {
        format_body_bytes(body)
    };
    tracing::info!(
        "\n====================== 后端响应 ========================\n[后端响应] {method} {url} {status} {ms}ms\n{rendered}\n=========================================================="
    );
}

fn format_headers(headers: &HeaderMap) -> String {
    let mut out = String::new();
    for (name, value) in headers.iter() {
        let key = name.as_str();
        let redacted = matches!(
            key.to_lowercase().as_str(),
            "authorization" | "apikey" | "x-goog-api-key" | "proxy-authorization"
        );
        let val = if redacted {
            "***"
        } else {
            value.to_str().unwrap_or("<binary>")
        };
        out.push_str(key);
        out.push_str(": ");
        out.push_str(val);
        out.push('\n');
    }
    out
}

/// 去掉 URL 中可能携带的 key 参数。
fn redact_url(url: &str) -> Cow<'_, str> {
    let Some(idx) = url.find("key=") else {
        return Cow::Borrowed(url);
    };
    let end = url[idx..].find('&').map(|e| idx + e).unwrap_or(url.len());
    Cow::Owned(format!("{}key=***{}", &url[..idx], &url[end..]))
}

fn format_body_value(v: &sonic_rs::Value) -> String {
    let sanitized = sanitize_json_for_log(v, false);
    sonic_rs::to_string_pretty(&sanitized).unwrap_or_else(|_| sanitized.to_string())
}

fn format_body_bytes(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }

    // 超大响应（通常是内联图片）：只展示头尾，避免日志本身占用大量内存。
    const MAX_PARSE_BYTES: usize = 4 * 1024 * 1024;
    const HEAD_TAIL: usize = 8 * 1024;

    if bytes.len() > MAX_PARSE_BYTES {
        let head = &bytes[..HEAD_TAIL.min(bytes.len())];
        let tail = &bytes[bytes.len() - HEAD_TAIL.min(bytes.len())..];
        return format!(
            "(body too large: {} bytes, showing head/tail)\n--- head ---\n{}\n--- tail ---\n{}",
            bytes.len(),
            String::from_utf8_lossy(head),
            String::from_utf8_lossy(tail)
        );
    }

    match sonic_rs::from_slice::<sonic_rs::Value>(bytes) {
        Ok(v) => format_body_value(&v),
        Err(_) => truncate_text_for_log(&String::from_utf8_lossy(bytes)),
    }
}

fn truncate_text_for_log(s: &str) -> String {
    const MAX_CHARS: usize = 16 * 1024;
    if s.chars().count() <= MAX_CHARS {
        return s.to_string();
    }
    let mut out: String = s.chars().take(MAX_CHARS).collect();
    out.push_str("...[TRUNCATED]");
    out
}

fn sanitize_json_for_log(v: &sonic_rs::Value, in_inline_data: bool) -> sonic_rs::Value {
    if let Some(obj) = v.as_object() {
        let mut out = sonic_rs::Object::new();
        for (key, child) in obj.iter() {
            let sanitized = match key {
                "inlineData" | "inline_data" => sanitize_json_for_log(child, true),
                "data" if in_inline_data => match child.as_str() {
                    Some(s) => sonic_rs::Value::from(truncate_base64(s).as_ref()),
                    None => sanitize_json_for_log(child, false),
                },
                _ => sanitize_json_for_log(child, in_inline_data),
            };
            out.insert(key, sanitized);
        }
        return out.into_value();
    }

    if let Some(arr) = v.as_array() {
        let out: Vec<sonic_rs::Value> = arr
            .iter()
            .map(|item| sanitize_json_for_log(item, in_inline_data))
            .collect();
        return sonic_rs::Value::from(out);
    }

    if let Some(s) = v.as_str()
        && s.starts_with("data:")
        && s.contains(";base64,")
    {
        return sonic_rs::Value::from(truncate_base64(s).as_ref());
    }

    v.to_owned()
}

/// 截断 base64 负载（兼容 data URI 前缀），保留首尾各 20 个字符。
pub fn truncate_base64(s: &str) -> Cow<'_, str> {
    const KEEP: usize = 20;

    let (prefix, payload) = match s.find(";base64,") {
        Some(idx) => s.split_at(idx + ";base64,".len()),
        None => ("", s),
    };

    if payload.len() <= 100 || !payload.is_ascii() {
        return Cow::Borrowed(s);
    }

    let omitted = payload.len() - KEEP * 2;
    Cow::Owned(format!(
        "{prefix}{}...[TRUNCATED: {omitted} chars]...{}",
        &payload[..KEEP],
        &payload[payload.len() - KEEP..]
    ))
}
