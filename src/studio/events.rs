//! 流式模式的事件协议
//!
//! 服务端 → 客户端：StudioEvent；客户端 → 服务端：ClientRequest。
//! 均序列化为带 `type` 标签的 JSON。

use serde::{Deserialize, Serialize};

use crate::core::{BoltError, ErrorKind};
use crate::llm::ModelInfo;
use crate::session::SessionSnapshot;

/// 推送给客户端的事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StudioEvent {
    /// 模型输出片段（原样）
    Token { content: String },

    /// 某个文件已部署
    Artifact { filename: String },

    /// 预览已更新；version 用作缓存破坏参数
    Preview { url: String, version: u64 },

    /// 本轮结束，附本轮部署的文件
    Complete { files: Vec<String> },

    Error { kind: ErrorKind, message: String },

    ModelChanged { model: String },

    /// 会话状态（回应 status 请求）
    Session { session: SessionSnapshot },

    /// 已部署文件的当前内容（回应 get_file）
    File { path: String, content: String },

    /// 可用模型列表（回应 list_models）
    Models { models: Vec<ModelInfo> },
}

impl StudioEvent {
    pub fn token(content: impl Into<String>) -> Self {
        StudioEvent::Token {
            content: content.into(),
        }
    }

    pub fn error(err: &BoltError) -> Self {
        StudioEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"type":"error","kind":"invalid_request","message":"serialize failed: {}"}}"#,
                e
            )
        })
    }
}

/// 客户端请求
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    /// 发起一轮生成
    Chat { prompt: String },

    /// 手动修改某个文件
    UpdateCode { path: String, content: String },

    SetModel { model: String },

    Status,

    /// 读取已部署文件
    GetFile { path: String },

    ListModels,

    /// 结束会话
    Delete,
}

impl ClientRequest {
    pub fn parse(text: &str) -> Result<Self, BoltError> {
        serde_json::from_str(text)
            .map_err(|e| BoltError::InvalidRequest(format!("bad message: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(StudioEvent::Preview {
            url: "https://x/".into(),
            version: 2,
        })
        .unwrap();
        assert_eq!(json["type"], "preview");
        assert_eq!(json["version"], 2);

        let json = serde_json::to_value(StudioEvent::error(&BoltError::GenerationInProgress(
            "s1".into(),
        )))
        .unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["kind"], "generation_in_progress");
    }

    #[test]
    fn test_parse_client_requests() {
        assert_eq!(
            ClientRequest::parse(r#"{"type":"chat","prompt":"make a todo app"}"#).unwrap(),
            ClientRequest::Chat {
                prompt: "make a todo app".into()
            }
        );
        assert_eq!(
            ClientRequest::parse(r#"{"type":"status"}"#).unwrap(),
            ClientRequest::Status
        );
        assert_eq!(
            ClientRequest::parse(r#"{"type":"update_code","path":"index.html","content":"<p/>"}"#)
                .unwrap(),
            ClientRequest::UpdateCode {
                path: "index.html".into(),
                content: "<p/>".into()
            }
        );
        assert_eq!(
            ClientRequest::parse(r#"{"type":"get_file","path":"app.js"}"#).unwrap(),
            ClientRequest::GetFile {
                path: "app.js".into()
            }
        );
        assert_eq!(
            ClientRequest::parse(r#"{"type":"list_models"}"#).unwrap(),
            ClientRequest::ListModels
        );
        let err = ClientRequest::parse(r#"{"type":"launch"}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }
}
