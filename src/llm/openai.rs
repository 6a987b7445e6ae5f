//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（默认 Kolosal）；流式输出逐片段转发，
//! 最后一个带 finish_reason 的 chunk 之后追加 StreamChunk::Done。

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;

use crate::config::LlmSection;
use crate::llm::traits::{ChunkStream, CompletionRequest, LlmClient, LlmError, ModelInfo, StreamChunk};
use crate::memory::{Message, Role};

pub const DEFAULT_BASE_URL: &str = "https://api.kolosal.ai/v1";
pub const DEFAULT_MODEL: &str = "meta-llama/llama-4-maverick-17b-128e-instruct";

/// OpenAI 兼容客户端：持有 Client、base_url 与 api_key（list_models 走 reqwest）
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    max_tokens: u32,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, api_key: Option<&str>) -> Self {
        let base_url = base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/').to_string();
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("KOLOSAL_API_KEY").ok())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = OpenAIConfig::new()
            .with_api_base(base_url.clone())
            .with_api_key(api_key.clone());

        Self {
            client: Client::with_config(config),
            http: reqwest::Client::new(),
            base_url,
            api_key,
            max_tokens: 8192,
        }
    }

    pub fn from_config(cfg: &LlmSection) -> Self {
        let mut client = Self::new(cfg.base_url.as_deref(), cfg.api_key.as_deref());
        client.max_tokens = cfg.max_tokens;
        client.http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeouts.request))
            .build()
            .unwrap_or_default();
        client
    }

    fn to_openai_messages(messages: &[Message]) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        messages
            .iter()
            .map(|m| {
                let built = match m.role {
                    Role::System => ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::System),
                    Role::User => ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::User),
                    Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::Assistant),
                };
                built.map_err(|e| LlmError::InvalidRequest(e.to_string()))
            })
            .collect()
    }

    fn build_request(&self, request: &CompletionRequest) -> Result<CreateChatCompletionRequest, LlmError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&request.model)
            .messages(Self::to_openai_messages(&request.full_messages())?)
            .max_completion_tokens(self.max_tokens)
            .stream(true);
        if let Some(t) = request.temperature {
            args.temperature(t);
        }
        args.build().map_err(|e| LlmError::InvalidRequest(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    models: Vec<RawModel>,
    #[serde(default)]
    data: Vec<RawModel>,
}

#[derive(Debug, Deserialize)]
struct RawModel {
    id: String,
    name: Option<String>,
    #[serde(default, rename = "contextSize")]
    context_size: u64,
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete_stream(&self, request: &CompletionRequest) -> Result<ChunkStream, LlmError> {
        let api_request = self.build_request(request)?;

        let upstream = self
            .client
            .chat()
            .create_stream(api_request)
            .await
            .map_err(|e| LlmError::classify(e.to_string()))?;

        // finish_reason 出现即视为服务端确认结束
        let stream = upstream
            .scan(false, |finished, item| {
                if *finished {
                    return futures_util::future::ready(None);
                }
                let out: Vec<Result<StreamChunk, LlmError>> = match item {
                    Ok(response) => {
                        let mut chunks = Vec::new();
                        for choice in response.choices {
                            if let Some(content) = choice.delta.content {
                                if !content.is_empty() {
                                    chunks.push(Ok(StreamChunk::Fragment(content)));
                                }
                            }
                            if choice.finish_reason.is_some() {
                                *finished = true;
                            }
                        }
                        if *finished {
                            chunks.push(Ok(StreamChunk::Done));
                        }
                        chunks
                    }
                    Err(e) => {
                        *finished = true;
                        vec![Err(LlmError::classify(e.to_string()))]
                    }
                };
                futures_util::future::ready(Some(futures_util::stream::iter(out)))
            })
            .flatten();

        Ok(Box::pin(stream))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, LlmError> {
        let response = self
            .http
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| LlmError::ServiceUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LlmError::classify(format!("{} listing models", status)));
        }

        let body: ModelsResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ServiceUnavailable(e.to_string()))?;

        let raw = if body.models.is_empty() { body.data } else { body.models };
        Ok(raw
            .into_iter()
            .map(|m| ModelInfo {
                name: m.name.unwrap_or_else(|| m.id.clone()),
                id: m.id,
                context_size: m.context_size,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_models_response_accepts_both_shapes() {
        let kolosal: ModelsResponse =
            serde_json::from_str(r#"{"models":[{"id":"a","name":"A","contextSize":8192}]}"#).unwrap();
        assert_eq!(kolosal.models[0].context_size, 8192);

        let openai: ModelsResponse = serde_json::from_str(r#"{"data":[{"id":"gpt"}]}"#).unwrap();
        assert_eq!(openai.data[0].id, "gpt");
        assert!(openai.data[0].name.is_none());
    }

    #[test]
    fn test_to_openai_messages_keeps_order() {
        let messages = vec![
            Message::system("s"),
            Message::user("u"),
            Message::assistant("a"),
        ];
        let converted = OpenAiClient::to_openai_messages(&messages).unwrap();
        assert_eq!(converted.len(), 3);
        assert!(matches!(converted[0], ChatCompletionRequestMessage::System(_)));
        assert!(matches!(converted[2], ChatCompletionRequestMessage::Assistant(_)));
    }
}
