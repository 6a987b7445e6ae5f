//! 会话：数据模型与注册表

pub mod model;
pub mod registry;

pub use model::{DeployedFile, Session, SessionId, SessionSnapshot, SessionStatus};
pub use registry::{GenerationGuard, SessionEntry, SessionRegistry, TurnGuard};
