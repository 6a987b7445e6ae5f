//! 统一错误类型
//!
//! 每个对外暴露的错误都带一个稳定的机器可读 kind（ErrorKind）和一条人类可读消息；
//! 展示方式由调用方决定。

use serde::Serialize;
use thiserror::Error;

use crate::llm::LlmError;
use crate::sandbox::SandboxError;

/// 错误类别（序列化为 snake_case，供前端/CLI 分支处理）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 模型或沙箱服务暂时不可用
    TransientProvider,
    /// 代码执行返回非零退出码
    ExecutionFailure,
    /// 代码块不完整或无法确定
    ExtractionAmbiguity,
    SessionNotFound,
    SandboxUnavailable,
    /// 沙箱仍在，但单次操作（上传、启动预览等）失败
    SandboxOperation,
    /// 同一会话已有生成在进行
    GenerationInProgress,
    Cancelled,
    /// 鉴权失败（致命，会话进入 error）
    Unauthorized,
    InvalidRequest,
    SessionTerminated,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientProvider => "transient_provider",
            ErrorKind::ExecutionFailure => "execution_failure",
            ErrorKind::ExtractionAmbiguity => "extraction_ambiguity",
            ErrorKind::SessionNotFound => "session_not_found",
            ErrorKind::SandboxUnavailable => "sandbox_unavailable",
            ErrorKind::SandboxOperation => "sandbox_operation",
            ErrorKind::GenerationInProgress => "generation_in_progress",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::SessionTerminated => "session_terminated",
            ErrorKind::Config => "config",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 会话编排过程中可能出现的错误
#[derive(Error, Debug)]
pub enum BoltError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {0} is terminated")]
    SessionTerminated(String),

    #[error("A generation is already in progress for session {0}")]
    GenerationInProgress(String),

    #[error("Sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    #[error("Sandbox operation failed: {0}")]
    SandboxOperation(String),

    #[error("Provider temporarily unavailable: {0}")]
    TransientProvider(String),

    #[error("Execution failed with exit code {exit_code}: {stderr}")]
    ExecutionFailure { exit_code: i32, stderr: String },

    #[error("Ambiguous code block: {0}")]
    ExtractionAmbiguity(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl BoltError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BoltError::SessionNotFound(_) => ErrorKind::SessionNotFound,
            BoltError::SessionTerminated(_) => ErrorKind::SessionTerminated,
            BoltError::GenerationInProgress(_) => ErrorKind::GenerationInProgress,
            BoltError::SandboxUnavailable(_) => ErrorKind::SandboxUnavailable,
            BoltError::SandboxOperation(_) => ErrorKind::SandboxOperation,
            BoltError::TransientProvider(_) => ErrorKind::TransientProvider,
            BoltError::ExecutionFailure { .. } => ErrorKind::ExecutionFailure,
            BoltError::ExtractionAmbiguity(_) => ErrorKind::ExtractionAmbiguity,
            BoltError::Cancelled => ErrorKind::Cancelled,
            BoltError::Unauthorized(_) => ErrorKind::Unauthorized,
            BoltError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            BoltError::Config(_) => ErrorKind::Config,
        }
    }

    /// 致命错误：会话进入 error 状态，需要显式重建
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BoltError::Unauthorized(_) | BoltError::SandboxUnavailable(_)
        )
    }

    /// 已绑定沙箱上的单次操作失败
    ///
    /// 只有沙箱本身丢失才算致命；命令或上传失败会话保持 active，可以重试。
    pub fn sandbox_operation(err: SandboxError) -> Self {
        match err {
            SandboxError::NotFound(msg) => {
                BoltError::SandboxUnavailable(format!("sandbox lost: {}", msg))
            }
            SandboxError::Transient(msg) => BoltError::TransientProvider(msg),
            SandboxError::InvalidPath(msg) => BoltError::InvalidRequest(msg),
            SandboxError::Unavailable(msg) | SandboxError::Command(msg) => {
                BoltError::SandboxOperation(msg)
            }
        }
    }
}

impl From<LlmError> for BoltError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Unauthorized(msg) => BoltError::Unauthorized(msg),
            LlmError::InvalidRequest(msg) => BoltError::InvalidRequest(msg),
            other => BoltError::TransientProvider(other.to_string()),
        }
    }
}

impl From<SandboxError> for BoltError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Transient(msg) => BoltError::TransientProvider(msg),
            SandboxError::InvalidPath(msg) => BoltError::InvalidRequest(msg),
            SandboxError::Command(msg) => BoltError::SandboxOperation(msg),
            other => BoltError::SandboxUnavailable(other.to_string()),
        }
    }
}
