//! 会话数据模型
//!
//! 状态机：`initializing → active ⇄ generating → active`，失败时 `→ error`，
//! 任何非终止状态都可以 `→ terminated`。terminated 是终态。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::core::BoltError;
use crate::execution::Language;
use crate::memory::ConversationMemory;
use crate::sandbox::SandboxHandle;

/// 会话 ID
pub type SessionId = String;

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initializing,
    Active,
    Generating,
    Error,
    Terminated,
}

impl SessionStatus {
    pub fn can_transition(self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, to) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (Initializing, Active) | (Initializing, Error) => true,
            (Active, Generating) | (Active, Error) => true,
            (Generating, Active) | (Generating, Error) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Active => "active",
            SessionStatus::Generating => "generating",
            SessionStatus::Error => "error",
            SessionStatus::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// 已部署到沙箱的文件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployedFile {
    pub filename: String,
    pub content: String,
}

/// 单个会话
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub model: String,
    /// 批处理模式的执行语言
    pub language: Language,
    pub sandbox: Option<SandboxHandle>,
    /// 部署清单：文件名唯一，按首次部署顺序，后写覆盖
    pub manifest: Vec<DeployedFile>,
    pub preview_url: Option<String>,
    pub preview_version: u64,
    pub preview_server_running: bool,
    pub last_error: Option<String>,
    pub conversation: ConversationMemory,
    /// 空闲计时（单调时钟）
    pub(crate) idle_since: Instant,
}

impl Session {
    pub fn new(id: impl Into<String>, model: impl Into<String>, max_context_turns: usize) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: SessionStatus::Initializing,
            created_at: now,
            last_active_at: now,
            model: model.into(),
            language: Language::default(),
            sandbox: None,
            manifest: Vec::new(),
            preview_url: None,
            preview_version: 0,
            preview_server_running: false,
            last_error: None,
            conversation: ConversationMemory::new(max_context_turns),
            idle_since: Instant::now(),
        }
    }

    /// 状态迁移；非法迁移返回错误，状态不变
    pub fn transition(&mut self, to: SessionStatus) -> Result<(), BoltError> {
        if self.status == to {
            return Ok(());
        }
        if self.status == SessionStatus::Terminated {
            return Err(BoltError::SessionTerminated(self.id.clone()));
        }
        if !self.status.can_transition(to) {
            return Err(BoltError::InvalidRequest(format!(
                "session {} cannot go from {} to {}",
                self.id, self.status, to
            )));
        }
        tracing::debug!(session_id = %self.id, from = %self.status, to = %to, "session status");
        self.status = to;
        Ok(())
    }

    pub fn touch(&mut self) {
        self.last_active_at = Utc::now();
        self.idle_since = Instant::now();
    }

    /// 记录一次部署；同名文件原位替换
    pub fn record_file(&mut self, filename: &str, content: &str) {
        match self.manifest.iter_mut().find(|f| f.filename == filename) {
            Some(existing) => existing.content = content.to_string(),
            None => self.manifest.push(DeployedFile {
                filename: filename.to_string(),
                content: content.to_string(),
            }),
        }
    }

    pub fn file_names(&self) -> Vec<String> {
        self.manifest.iter().map(|f| f.filename.clone()).collect()
    }

    pub fn file(&self, filename: &str) -> Option<&str> {
        self.manifest
            .iter()
            .find(|f| f.filename == filename)
            .map(|f| f.content.as_str())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            status: self.status,
            model: self.model.clone(),
            language: self.language,
            created_at: self.created_at,
            last_active_at: self.last_active_at,
            files: self.file_names(),
            preview_url: self.preview_url.clone(),
            preview_version: self.preview_version,
            sandbox_id: self.sandbox.as_ref().map(|h| h.id.clone()),
            last_error: self.last_error.clone(),
        }
    }
}

/// 会话的只读视图
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub status: SessionStatus,
    pub model: String,
    pub language: Language,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub files: Vec<String>,
    pub preview_url: Option<String>,
    pub preview_version: u64,
    pub sandbox_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
