//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按脚本依次返回预设回复，并把文本切成小片段流式输出；脚本耗尽后回显最后一条 User 消息。
//! 所有请求都会被记录，便于断言 prompt 内容。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};

use crate::llm::traits::{ChunkStream, CompletionRequest, LlmClient, LlmError, StreamChunk};
use crate::memory::Role;

/// 预设回复
#[derive(Debug, Clone)]
pub enum MockReply {
    /// 完整回复，正常以 Done 结束
    Text(String),
    /// 请求直接失败
    Fail(LlmError),
    /// 输出部分文本后流中断（无 Done）
    Truncated(String),
}

/// Mock 客户端：脚本化回复 + 请求记录
pub struct MockLlmClient {
    replies: Mutex<VecDeque<MockReply>>,
    requests: Mutex<Vec<CompletionRequest>>,
    fragment_chars: usize,
    fragment_delay: Option<Duration>,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            fragment_chars: 8,
            fragment_delay: None,
        }
    }

    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = Self::new();
        for reply in replies {
            client.push(MockReply::Text(reply.into()));
        }
        client
    }

    /// 每个片段的字符数
    pub fn fragment_chars(mut self, n: usize) -> Self {
        self.fragment_chars = n.max(1);
        self
    }

    /// 片段之间的延迟（用于并发测试）
    pub fn fragment_delay(mut self, delay: Duration) -> Self {
        self.fragment_delay = Some(delay);
        self
    }

    pub fn push(&self, reply: MockReply) {
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(reply);
    }

    /// 已收到的请求（按顺序）
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn split(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        chars
            .chunks(self.fragment_chars)
            .map(|c| c.iter().collect())
            .collect()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete_stream(&self, request: &CompletionRequest) -> Result<ChunkStream, LlmError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        let next = self
            .replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();

        let (text, terminated) = match next {
            Some(MockReply::Text(text)) => (text, true),
            Some(MockReply::Truncated(text)) => (text, false),
            Some(MockReply::Fail(err)) => return Err(err),
            None => {
                let last_user = request
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or("(no input)");
                (format!("Echo from Mock: {}", last_user), true)
            }
        };

        let mut items: Vec<Result<StreamChunk, LlmError>> = self
            .split(&text)
            .into_iter()
            .map(|f| Ok(StreamChunk::Fragment(f)))
            .collect();
        if terminated {
            items.push(Ok(StreamChunk::Done));
        }

        match self.fragment_delay {
            Some(delay) => Ok(Box::pin(stream::iter(items).then(move |item| async move {
                tokio::time::sleep(delay).await;
                item
            }))),
            None => Ok(Box::pin(stream::iter(items))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Message;

    #[tokio::test]
    async fn test_scripted_replies_then_echo() {
        let client = MockLlmClient::with_replies(["first"]);
        let request = CompletionRequest::new("m", "sys").with_messages(vec![Message::user("ping")]);

        assert_eq!(client.complete(&request).await.unwrap(), "first");
        assert_eq!(
            client.complete(&request).await.unwrap(),
            "Echo from Mock: ping"
        );
        assert_eq!(client.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_truncated_reply_is_an_error_for_complete() {
        let client = MockLlmClient::new();
        client.push(MockReply::Truncated("partial".into()));
        let request = CompletionRequest::new("m", "sys");
        assert!(matches!(
            client.complete(&request).await,
            Err(LlmError::ServiceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_fragments_split_by_chars() {
        let client = MockLlmClient::with_replies(["abcdefg"]).fragment_chars(3);
        let request = CompletionRequest::new("m", "sys");
        let chunks: Vec<_> = client
            .complete_stream(&request)
            .await
            .unwrap()
            .collect::<Vec<_>>()
            .await;
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0], Ok(StreamChunk::Fragment("abc".into())));
        assert_eq!(chunks[3], Ok(StreamChunk::Done));
    }
}
