//! 记忆层：会话内的对话记录（不跨进程持久化）

pub mod conversation;

pub use conversation::{ChatTurn, ConversationMemory, Message, Role};
