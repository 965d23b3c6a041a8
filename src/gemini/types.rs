use base64::Engine;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub contents: Vec<Content>,
}

impl Request {
    /// 单轮纯文本提示词请求。
    pub fn from_prompt(prompt: &str) -> Self {
        Self {
            contents: vec![Content {
                role: String::new(),
                parts: vec![Part {
                    text: prompt.to_string(),
                    inline_data: None,
                }],
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub text: String,
    #[serde(
        skip_serializing_if = "Option::is_none",
        default,
        alias = "inline_data"
    )]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default, alias = "mime_type")]
    pub mime_type: String,
    #[serde(default)]
    pub data: String,
}

impl InlineData {
    pub fn mime_or_default(&self) -> &str {
        let m = self.mime_type.trim();
        if m.is_empty() { "image/png" } else { m }
    }

    /// 组装为 `data:<mime>;base64,<payload>`。
    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_or_default(), self.data.trim())
    }

    /// 解码后的字节数；用于确认负载确实是一张非空图片。
    pub fn decoded_len(&self) -> Result<usize, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD
            .decode(self.data.trim())
            .map(|b| b.len())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    #[serde(default)]
    pub block_reason: String,
}

impl Response {
    fn first_parts(&self) -> &[Part] {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| c.parts.as_slice())
            .unwrap_or_default()
    }

    /// 第一个候选中第一个携带内联二进制数据的 part。
    pub fn first_inline_image(&self) -> Option<&InlineData> {
        self.first_parts()
            .iter()
            .find_map(|p| p.inline_data.as_ref())
    }

    /// 模型只回了文字时，用于日志定位原因。
    pub fn first_text(&self) -> Option<&str> {
        self.first_parts()
            .iter()
            .map(|p| p.text.as_str())
            .find(|t| !t.trim().is_empty())
    }

    pub fn block_reason(&self) -> Option<&str> {
        self.prompt_feedback
            .as_ref()
            .map(|f| f.block_reason.as_str())
            .filter(|r| !r.is_empty())
    }
}
