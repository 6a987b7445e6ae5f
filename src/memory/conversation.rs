//! 会话对话记录
//!
//! ChatTurn 按顺序记录 user / assistant 的原始文本；ConversationMemory 只保留最近 N 轮，
//! 超出时从最旧处剪枝。turn 序号单调递增，剪枝后也不会复用。

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 发送给模型的单条消息
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 一轮对话中的一条记录
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatTurn {
    /// 会话内的序号（从 0 开始）
    pub turn: usize,
    pub role: Role,
    /// 累积的原始文本
    pub text: String,
    /// assistant 轮次产生的文件名（流式模式用于回放上下文）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
}

/// 最近 N 轮对话（每轮 user + assistant，故实际保留约 max_turns*2 条）
#[derive(Clone, Debug)]
pub struct ConversationMemory {
    turns: Vec<ChatTurn>,
    max_turns: usize,
    next_turn: usize,
}

impl ConversationMemory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            turns: Vec::new(),
            max_turns,
            next_turn: 0,
        }
    }

    /// 追加一条记录，返回它的序号
    pub fn push(&mut self, role: Role, text: impl Into<String>, files: Vec<String>) -> usize {
        let turn = self.next_turn;
        self.next_turn += 1;
        self.turns.push(ChatTurn {
            turn,
            role,
            text: text.into(),
            files,
        });
        self.prune();
        turn
    }

    /// 下一条记录将获得的序号
    pub fn next_turn(&self) -> usize {
        self.next_turn
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    /// 最近 n 个 (user, assistant) 对，按时间顺序
    pub fn recent_exchanges(&self, n: usize) -> Vec<(&ChatTurn, &ChatTurn)> {
        let pairs: Vec<_> = self
            .turns
            .windows(2)
            .filter(|w| w[0].role == Role::User && w[1].role == Role::Assistant)
            .map(|w| (&w[0], &w[1]))
            .collect();
        let skip = pairs.len().saturating_sub(n);
        pairs.into_iter().skip(skip).collect()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    fn prune(&mut self) {
        let keep = self.max_turns * 2;
        if self.turns.len() > keep {
            let excess = self.turns.len() - keep;
            self.turns.drain(..excess);
        }
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
