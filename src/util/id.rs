use rand::Rng;
use uuid::Uuid;

/// 图片会话 id（URL 与文件名安全）。
pub fn session_id() -> String {
    format!("img-{}", Uuid::new_v4().simple())
}

/// Pollinations 的随机 seed：[0, 1_000_000)，用于绕过缓存。
pub fn image_seed() -> u32 {
    rand::thread_rng().gen_range(0..1_000_000)
}

/// 校验外部传入的会话 id，只允许 `[A-Za-z0-9_-]`，长度 1..=64。
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
