use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// 备用后端的模型分级，按固定顺序尝试：flux → turbo → 默认。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Flux,
    Turbo,
    Default,
}

impl Tier {
    pub const ORDER: [Tier; 3] = [Tier::Flux, Tier::Turbo, Tier::Default];

    /// `model` 查询参数；默认分级不带该参数。
    pub fn model_param(self) -> Option<&'static str> {
        match self {
            Tier::Flux => Some("flux"),
            Tier::Turbo => Some("turbo"),
            Tier::Default => None,
        }
    }

    pub fn next(self) -> Option<Tier> {
        match self {
            Tier::Flux => Some(Tier::Turbo),
            Tier::Turbo => Some(Tier::Default),
            Tier::Default => None,
        }
    }

    pub fn provider(self) -> Provider {
        match self {
            Tier::Flux => Provider::SecondaryA,
            Tier::Turbo => Provider::SecondaryB,
            Tier::Default => Provider::SecondaryDefault,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Provider {
    Primary,
    SecondaryA,
    SecondaryB,
    SecondaryDefault,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Provider::Primary => "primary(gemini)",
            Provider::SecondaryA => "secondary(flux)",
            Provider::SecondaryB => "secondary(turbo)",
            Provider::SecondaryDefault => "secondary(default)",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Pending,
    Success,
    Timeout,
    Error,
}

/// 一次 ImageRequest 遍历中的单次尝试。同一遍历内按顺序排列，至多一个 pending。
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderAttempt {
    pub id: u64,
    pub provider: Provider,
    pub started_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
}

/// 一次取图请求；派发后不再修改。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    pub question_index: usize,
    pub prompt_text: String,
    pub is_regeneration: bool,
}

/// 回退状态机的状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackState {
    TryPrimary,
    TrySecondary(Tier),
    Succeeded,
    Failed,
}

impl FallbackState {
    pub fn is_terminal(self) -> bool {
        matches!(self, FallbackState::Succeeded | FallbackState::Failed)
    }
}
