//! 生成管线：prompt → 模型流 → 提取
//!
//! 每一轮的状态：`AwaitingFirstToken → Streaming → Complete | Error`。
//! 片段原样转发给 sink（流式模式逐个转发；批处理模式不传 sink，只累积）。
//! sink 关闭或取消令牌触发时，本轮以 Cancelled 结束，不提取任何产物。

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::prompts;
use crate::core::BoltError;
use crate::execution::Language;
use crate::extract::{extract_artifacts, extract_runnable, CodeArtifact};
use crate::llm::{CompletionRequest, LlmClient, LlmError, StreamChunk};
use crate::memory::{Message, Role};
use crate::session::SessionEntry;

/// 单轮生成状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    AwaitingFirstToken,
    Streaming,
    Complete,
    Error,
}

/// 一轮的累积文本与状态
#[derive(Debug)]
struct Turn {
    state: TurnState,
    text: String,
    fragments: usize,
}

impl Turn {
    fn new() -> Self {
        Self {
            state: TurnState::AwaitingFirstToken,
            text: String::new(),
            fragments: 0,
        }
    }

    fn on_fragment(&mut self, fragment: &str) {
        if self.state == TurnState::AwaitingFirstToken {
            self.state = TurnState::Streaming;
        }
        self.fragments += 1;
        self.text.push_str(fragment);
    }

    fn complete(&mut self) {
        self.state = TurnState::Complete;
    }

    fn fail(&mut self) {
        self.state = TurnState::Error;
    }
}

/// 流式模式一轮的结果
#[derive(Debug, Clone)]
pub struct WebTurn {
    /// assistant 轮次序号
    pub turn: usize,
    pub text: String,
    /// 文件名唯一；同名后者覆盖前者
    pub artifacts: Vec<CodeArtifact>,
}

impl WebTurn {
    pub fn files(&self) -> Vec<String> {
        self.artifacts.iter().map(|a| a.filename.clone()).collect()
    }
}

/// 同一轮中重复的文件名：保留首次出现的位置，内容取最后一次
fn dedupe(artifacts: Vec<CodeArtifact>) -> Vec<CodeArtifact> {
    let mut out: Vec<CodeArtifact> = Vec::with_capacity(artifacts.len());
    for artifact in artifacts {
        match out.iter_mut().find(|a| a.filename == artifact.filename) {
            Some(existing) => *existing = artifact,
            None => out.push(artifact),
        }
    }
    out
}

/// 生成管线
#[derive(Clone)]
pub struct GenerationPipeline {
    llm: Arc<dyn LlmClient>,
}

impl GenerationPipeline {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub fn llm(&self) -> &Arc<dyn LlmClient> {
        &self.llm
    }

    /// 驱动一次模型流，返回完整文本
    ///
    /// 流在 Done 之前结束视为服务故障；不会对用户可见的轮次自动重试。
    pub async fn stream(
        &self,
        request: &CompletionRequest,
        sink: Option<mpsc::Sender<String>>,
        cancel: &CancellationToken,
    ) -> Result<String, BoltError> {
        let mut turn = Turn::new();

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BoltError::Cancelled),
            res = self.llm.complete_stream(request) => res.map_err(BoltError::from)?,
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                item = stream.next() => Some(item),
            };
            let Some(item) = next else {
                turn.fail();
                tracing::info!(fragments = turn.fragments, "turn cancelled");
                return Err(BoltError::Cancelled);
            };

            match item {
                Some(Ok(StreamChunk::Fragment(fragment))) => {
                    if turn.state == TurnState::AwaitingFirstToken {
                        tracing::debug!(model = %request.model, "first token received");
                    }
                    turn.on_fragment(&fragment);
                    if let Some(tx) = &sink {
                        if tx.send(fragment).await.is_err() {
                            turn.fail();
                            tracing::info!(fragments = turn.fragments, "fragment consumer gone, turn cancelled");
                            return Err(BoltError::Cancelled);
                        }
                    }
                }
                Some(Ok(StreamChunk::Done)) => {
                    turn.complete();
                    break;
                }
                Some(Err(e)) => {
                    turn.fail();
                    tracing::warn!(error = %e, "model stream failed");
                    return Err(e.into());
                }
                None => {
                    turn.fail();
                    tracing::warn!(fragments = turn.fragments, "model stream ended without end-of-stream marker");
                    return Err(LlmError::ServiceUnavailable(
                        "stream ended without end-of-stream marker".to_string(),
                    )
                    .into());
                }
            }
        }

        tracing::debug!(fragments = turn.fragments, chars = turn.text.len(), "turn complete");
        Ok(turn.text)
    }

    /// 流式模式：网页构建一轮
    ///
    /// 完成后把 user / assistant 两条记录追加到会话，并提取带文件名的产物。
    pub async fn web_turn(
        &self,
        session: &SessionEntry,
        prompt: &str,
        sink: Option<mpsc::Sender<String>>,
        cancel: &CancellationToken,
    ) -> Result<WebTurn, BoltError> {
        let (model, mut messages) =
            session.with(|s| (s.model.clone(), prompts::web_history(&s.conversation)));
        messages.push(Message::user(prompt));
        let request = CompletionRequest::new(model, prompts::WEB_SYSTEM_PROMPT)
            .with_messages(messages)
            .with_temperature(prompts::WEB_TEMPERATURE);

        let text = self.stream(&request, sink, cancel).await?;

        Ok(session.with(|s| {
            s.conversation.push(Role::User, prompt, Vec::new());
            let turn = s.conversation.next_turn();
            let artifacts = dedupe(extract_artifacts(&text, turn));
            let files = artifacts.iter().map(|a| a.filename.clone()).collect();
            s.conversation.push(Role::Assistant, text.clone(), files);
            WebTurn {
                turn,
                text,
                artifacts,
            }
        }))
    }

    /// 批处理模式：生成可运行代码片段并记入会话
    pub async fn generate(
        &self,
        session: &SessionEntry,
        language: Language,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String, BoltError> {
        let model = session.with(|s| s.model.clone());
        let request = CompletionRequest::new(model, prompts::generate_system_prompt(language))
            .with_messages(vec![Message::user(prompt)])
            .with_temperature(prompts::GENERATE_TEMPERATURE);

        let text = self.stream(&request, None, cancel).await?;
        let code = extract_runnable(&text)?;

        session.with(|s| {
            s.conversation.push(Role::User, prompt, Vec::new());
            s.conversation.push(
                Role::Assistant,
                format!("```{}\n{}\n```", language.as_str(), code.trim_end()),
                Vec::new(),
            );
        });
        Ok(code)
    }

    /// 自动修复：带上失败代码与错误输出，请求修正后的片段
    pub async fn fix(
        &self,
        model: &str,
        language: Language,
        code: &str,
        error: &str,
        cancel: &CancellationToken,
    ) -> Result<String, BoltError> {
        let request = CompletionRequest::new(model, prompts::fix_system_prompt(language))
            .with_messages(vec![Message::user(prompts::fix_user_message(
                language, code, error,
            ))])
            .with_temperature(prompts::FIX_TEMPERATURE);
        let text = self.stream(&request, None, cancel).await?;
        extract_runnable(&text)
    }

    /// 批处理模式的通用对话（回放最近几次生成）
    pub async fn chat(
        &self,
        session: &SessionEntry,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String, BoltError> {
        let (model, mut messages) =
            session.with(|s| (s.model.clone(), prompts::chat_history(&s.conversation)));
        messages.push(Message::user(prompt));
        let request = CompletionRequest::new(model, prompts::CHAT_SYSTEM_PROMPT)
            .with_messages(messages)
            .with_temperature(prompts::CHAT_TEMPERATURE);
        self.stream(&request, None, cancel).await
    }

    /// 解释一段代码
    pub async fn explain(
        &self,
        model: &str,
        language: Language,
        code: &str,
        cancel: &CancellationToken,
    ) -> Result<String, BoltError> {
        let request = CompletionRequest::new(model, prompts::EXPLAIN_SYSTEM_PROMPT)
            .with_messages(vec![Message::user(prompts::explain_user_message(language, code))])
            .with_temperature(prompts::WEB_TEMPERATURE);
        self.stream(&request, None, cancel).await
    }
}
