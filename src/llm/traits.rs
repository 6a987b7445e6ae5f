//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：complete（非流式）、complete_stream（流式片段）。
//! 流以显式的 StreamChunk::Done 结束；没有 Done 就结束的流视为服务端故障。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use thiserror::Error;

use crate::memory::Message;

/// 模型服务错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("Rate limited (retry after {retry_after_ms}ms)")]
    RateLimited { retry_after_ms: u64 },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl LlmError {
    /// 按错误文本粗分类（兼容各家 OpenAI 兼容服务的错误格式）
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests") {
            LlmError::RateLimited { retry_after_ms: 1000 }
        } else if lower.contains("401")
            || lower.contains("403")
            || lower.contains("unauthorized")
            || lower.contains("invalid api key")
            || lower.contains("incorrect api key")
        {
            LlmError::Unauthorized(message)
        } else {
            LlmError::ServiceUnavailable(message)
        }
    }
}

/// 一次模型请求：系统指令 + 历史 + 选定模型
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub system: String,
    /// 历史与本轮用户消息（不含 system）
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, system: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system: system.into(),
            messages: Vec::new(),
            temperature: None,
        }
    }

    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// 完整消息序列（system 在最前）
    pub fn full_messages(&self) -> Vec<Message> {
        let mut all = Vec::with_capacity(self.messages.len() + 1);
        all.push(Message::system(self.system.clone()));
        all.extend(self.messages.iter().cloned());
        all
    }
}

/// 流式输出单元
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    /// UTF-8 文本片段
    Fragment(String),
    /// 服务端确认的流结束标记
    Done,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, LlmError>> + Send>>;

/// LLM 客户端 trait：流式完成为主，非流式完成默认由流拼接
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 流式完成，返回片段流（以 Done 结束）
    async fn complete_stream(&self, request: &CompletionRequest) -> Result<ChunkStream, LlmError>;

    /// 非流式完成
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let mut stream = self.complete_stream(request).await?;
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk? {
                StreamChunk::Fragment(fragment) => text.push_str(&fragment),
                StreamChunk::Done => return Ok(text),
            }
        }
        Err(LlmError::ServiceUnavailable(
            "stream ended without end-of-stream marker".to_string(),
        ))
    }

    /// 可用模型 ID 列表；默认空
    async fn list_models(&self) -> Result<Vec<ModelInfo>, LlmError> {
        Ok(Vec::new())
    }
}

/// 模型信息（GET /models）
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub context_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_errors() {
        assert!(matches!(
            LlmError::classify("HTTP 429 Too Many Requests"),
            LlmError::RateLimited { .. }
        ));
        assert!(matches!(
            LlmError::classify("401 Unauthorized: invalid api key"),
            LlmError::Unauthorized(_)
        ));
        assert!(matches!(
            LlmError::classify("connection reset"),
            LlmError::ServiceUnavailable(_)
        ));
    }

    #[test]
    fn test_full_messages_prepends_system() {
        let request = CompletionRequest::new("m", "sys")
            .with_messages(vec![Message::user("hi")]);
        let all = request.full_messages();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], Message::system("sys"));
        assert_eq!(all[1], Message::user("hi"));
    }
}
