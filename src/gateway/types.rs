use crate::image::AcquireOutcome;
use crate::session::ImageStatus;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub questions: Vec<QuestionInput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuestionInput {
    #[serde(default, rename = "visualPrompt", alias = "visual_prompt")]
    pub visual_prompt: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetCurrentRequest {
    pub index: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquireRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default, alias = "force_regen")]
    pub force_regen: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AcquireResponse {
    pub outcome: AcquireOutcome,
    pub image: ImageStatus,
}
