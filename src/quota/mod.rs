//! 主图后端每日配额。

mod guard;
mod store;

pub use guard::{QuotaGuard, QuotaSnapshot, today};
pub use store::{MemoryQuotaStore, QuotaStore, SupabaseQuotaStore};
