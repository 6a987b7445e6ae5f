//! 批处理模式：执行语言与自动修复循环

pub mod autofix;
pub mod language;

pub(crate) use crate::sandbox::shell_quote;

pub use autofix::{AttemptOutcome, ExecutionAttempt, ExecutionReport, Executor};
pub use language::Language;
