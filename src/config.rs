use figment::Figment;
use figment::providers::Env;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8046;
const DEFAULT_TIMEOUT_MS: u64 = 60_000;

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_GEMINI_IMAGE_MODEL: &str = "gemini-2.5-flash-image-preview";
pub const DEFAULT_POLLINATIONS_BASE_URL: &str = "https://image.pollinations.ai";

/// 主图后端每日成功次数上限。
pub const DEFAULT_IMAGE_QUOTA_LIMIT: u64 = 800;
/// 普通（交互/后台/重新生成）单次尝试超时。
pub const DEFAULT_ATTEMPT_TIMEOUT_MS: u64 = 12_000;
/// 首轮生成（前台等待）单次尝试超时。
pub const DEFAULT_SMART_TIMEOUT_MS: u64 = 20_000;
pub const DEFAULT_PRELOAD_STAGGER_MS: u64 = 4_000;
pub const DEFAULT_INITIAL_PRELOAD_COUNT: usize = 3;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub timeout_ms: u64,
    pub proxy: String,
    pub debug: String,
    pub data_dir: String,

    pub gemini_api_key: String,
    pub gemini_base_url: String,
    pub gemini_image_model: String,

    pub pollinations_base_url: String,
    pub image_width: u32,
    pub image_height: u32,

    pub supabase_url: String,
    pub supabase_anon_key: String,

    pub image_quota_limit: u64,
    pub attempt_timeout_ms: u64,
    pub smart_timeout_ms: u64,
    pub preload_stagger_ms: u64,
    pub initial_preload_count: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            proxy: String::new(),
            debug: "off".to_string(),
            data_dir: "./data".to_string(),
            gemini_api_key: String::new(),
            gemini_base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            gemini_image_model: DEFAULT_GEMINI_IMAGE_MODEL.to_string(),
            pollinations_base_url: DEFAULT_POLLINATIONS_BASE_URL.to_string(),
            image_width: 1024,
            image_height: 600,
            supabase_url: String::new(),
            supabase_anon_key: String::new(),
            image_quota_limit: DEFAULT_IMAGE_QUOTA_LIMIT,
            attempt_timeout_ms: DEFAULT_ATTEMPT_TIMEOUT_MS,
            smart_timeout_ms: DEFAULT_SMART_TIMEOUT_MS,
            preload_stagger_ms: DEFAULT_PRELOAD_STAGGER_MS,
            initial_preload_count: DEFAULT_INITIAL_PRELOAD_COUNT,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "HOST")]
    host: Option<String>,
    #[serde(alias = "PORT")]
    port: Option<u16>,

    #[serde(alias = "TIMEOUT")]
    timeout: Option<u64>,
    #[serde(alias = "PROXY")]
    proxy: Option<String>,
    #[serde(alias = "DEBUG")]
    debug: Option<String>,
    #[serde(alias = "DATA_DIR")]
    data_dir: Option<String>,

    #[serde(alias = "GEMINI_API_KEY")]
    gemini_api_key: Option<String>,
    #[serde(alias = "GEMINI_BASE_URL")]
    gemini_base_url: Option<String>,
    #[serde(alias = "GEMINI_IMAGE_MODEL")]
    gemini_image_model: Option<String>,

    #[serde(alias = "POLLINATIONS_BASE_URL")]
    pollinations_base_url: Option<String>,
    #[serde(alias = "IMAGE_WIDTH")]
    image_width: Option<u32>,
    #[serde(alias = "IMAGE_HEIGHT")]
    image_height: Option<u32>,

    #[serde(alias = "SUPABASE_URL")]
    supabase_url: Option<String>,
    #[serde(alias = "SUPABASE_ANON_KEY")]
    supabase_anon_key: Option<String>,

    #[serde(alias = "IMAGE_QUOTA_LIMIT")]
    image_quota_limit: Option<u64>,
    #[serde(alias = "IMAGE_ATTEMPT_TIMEOUT")]
    image_attempt_timeout: Option<u64>,
    #[serde(alias = "SMART_IMAGE_TIMEOUT")]
    smart_image_timeout: Option<u64>,
    #[serde(alias = "PRELOAD_STAGGER")]
    preload_stagger: Option<u64>,
    #[serde(alias = "INITIAL_PRELOAD_COUNT")]
    initial_preload_count: Option<usize>,
}

impl Config {
    pub fn load() -> Self {
        load_dotenv();

        let raw = Figment::from(Env::raw())
            .extract::<RawEnv>()
            .unwrap_or_default();

        let mut cfg = Self::from_raw(raw);

        // 命令行覆盖：-debug <level>
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            if arg == "-debug"
                && let Some(v) = args.next()
            {
                cfg.debug = v;
            }
        }

        cfg
    }

    fn from_raw(raw: RawEnv) -> Self {
        let d = Self::default();
        Self {
            host: non_empty(raw.host).unwrap_or(d.host),
            port: raw.port.unwrap_or(d.port),
            timeout_ms: raw.timeout.unwrap_or(d.timeout_ms),
            proxy: raw.proxy.unwrap_or_default(),
            debug: non_empty(raw.debug).unwrap_or(d.debug),
            data_dir: non_empty(raw.data_dir).unwrap_or(d.data_dir),
            gemini_api_key: raw.gemini_api_key.unwrap_or_default(),
            gemini_base_url: non_empty(raw.gemini_base_url).unwrap_or(d.gemini_base_url),
            gemini_image_model: non_empty(raw.gemini_image_model).unwrap_or(d.gemini_image_model),
            pollinations_base_url: non_empty(raw.pollinations_base_url)
                .unwrap_or(d.pollinations_base_url),
            image_width: raw.image_width.filter(|v| *v > 0).unwrap_or(d.image_width),
            image_height: raw.image_height.filter(|v| *v > 0).unwrap_or(d.image_height),
            supabase_url: raw.supabase_url.unwrap_or_default(),
            supabase_anon_key: raw.supabase_anon_key.unwrap_or_default(),
            image_quota_limit: raw.image_quota_limit.unwrap_or(d.image_quota_limit),
            attempt_timeout_ms: raw
                .image_attempt_timeout
                .filter(|v| *v > 0)
                .unwrap_or(d.attempt_timeout_ms),
            smart_timeout_ms: raw
                .smart_image_timeout
                .filter(|v| *v > 0)
                .unwrap_or(d.smart_timeout_ms),
            preload_stagger_ms: raw.preload_stagger.unwrap_or(d.preload_stagger_ms),
            initial_preload_count: raw
                .initial_preload_count
                .unwrap_or(d.initial_preload_count),
        }
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }

    pub fn supabase_configured(&self) -> bool {
        !self.supabase_url.trim().is_empty() && !self.supabase_anon_key.trim().is_empty()
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn smart_timeout(&self) -> Duration {
        Duration::from_millis(self.smart_timeout_ms)
    }

    pub fn preload_stagger(&self) -> Duration {
        Duration::from_millis(self.preload_stagger_ms)
    }

    pub fn recovery_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("recovery")
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn load_dotenv() {
    let Some(dotenv_path) = find_dotenv_path() else {
        return;
    };

    let Ok(content) = std::fs::read_to_string(&dotenv_path) else {
        return;
    };

    for line in content.lines() {
        let Some((key, value)) = parse_dotenv_line(line) else {
            continue;
        };
        // 已存在的进程环境变量优先于 .env。
        if std::env::var_os(&key).is_some() {
            continue;
        }
        // Rust 2024：set_var 为 unsafe。这里只在启动阶段、尚未创建运行时任务前调用。
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

fn find_dotenv_path() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    let mut dir: &Path = cwd.as_path();

    loop {
        let candidate = dir.join(".env");
        if candidate.is_file() {
            return Some(candidate);
        }

        // 不越过仓库根目录。
        if dir.join("Cargo.toml").is_file() || dir.join(".git").is_dir() {
            return None;
        }

        let parent = dir.parent()?;
        if parent == dir {
            return None;
        }
        dir = parent;
    }
}

fn parse_dotenv_line(line: &str) -> Option<(String, String)> {
    let mut line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    if let Some(rest) = line.strip_prefix("export ") {
        line = rest.trim_start();
    }

    let (key, raw) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }

    let raw = raw.trim();
    for quote in ['"', '\''] {
        if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
            return Some((key.to_string(), raw[1..raw.len() - 1].to_string()));
        }
    }

    Some((key.to_string(), strip_inline_comment(raw).to_string()))
}

fn strip_inline_comment(value: &str) -> &str {
    let bytes = value.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'#' && (i == 0 || bytes[i - 1] == b' ' || bytes[i - 1] == b'\t') {
            return value[..i].trim_end();
        }
    }
    value
}
