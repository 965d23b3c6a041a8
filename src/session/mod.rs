//! 答题会话的图片状态、内存注册表与恢复快照。

mod recovery;
mod registry;
mod state;

pub use recovery::RecoveryStore;
pub use registry::SessionRegistry;
pub use state::{ImageSession, ImageStatus, QuestionImageState, SessionState, SessionView};
