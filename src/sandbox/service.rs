//! 沙箱执行服务抽象
//!
//! 所有后端（Local / Daytona / Mock）实现 SandboxService：创建、销毁、上传、执行、暴露端口。
//! 沙箱内的路径一律相对沙箱 home 目录。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 沙箱服务错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    /// 服务暂时不可用（可在创建阶段重试）
    #[error("Sandbox service temporarily unavailable: {0}")]
    Transient(String),

    #[error("Sandbox service unavailable: {0}")]
    Unavailable(String),

    #[error("Sandbox not found: {0}")]
    NotFound(String),

    #[error("Invalid sandbox path: {0}")]
    InvalidPath(String),

    #[error("Command failed to start: {0}")]
    Command(String),
}

impl SandboxError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SandboxError::Transient(_))
    }
}

/// 沙箱句柄（服务端 ID）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxHandle {
    pub id: String,
}

impl SandboxHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl std::fmt::Display for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

/// 一次命令执行的输出
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// 报告给模型的错误文本：优先 stderr，为空时用 stdout
    pub fn error_text(&self) -> &str {
        if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }
}

/// 沙箱执行服务
#[async_trait]
pub trait SandboxService: Send + Sync {
    async fn create(&self) -> Result<SandboxHandle, SandboxError>;

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;

    async fn upload(&self, handle: &SandboxHandle, path: &str, bytes: &[u8]) -> Result<(), SandboxError>;

    async fn run(&self, handle: &SandboxHandle, command: &str) -> Result<ExecOutput, SandboxError>;

    /// 返回外部可访问的 URL
    async fn expose_port(&self, handle: &SandboxHandle, port: u16) -> Result<String, SandboxError>;
}

/// 简单的 shell 单引号转义
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
