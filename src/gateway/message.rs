//! 网关连接参数与帧编解码
//!
//! 每条 WebSocket 连接对应一个会话：`ws://host/?session=<id>&model=<model>`。
//! 不带 session 时新建会话；文本帧是 JSON 编码的 ClientRequest / StudioEvent。

use reqwest::Url;

use crate::core::BoltError;
use crate::studio::{ClientRequest, StudioEvent};

/// 连接握手时的查询参数
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectParams {
    /// 重新连接已有会话
    pub session: Option<String>,
    /// 新建会话时使用的模型
    pub model: Option<String>,
}

impl ConnectParams {
    /// 解析请求 URI 的 query 部分（支持百分号编码）
    pub fn from_query(query: Option<&str>) -> Self {
        let Some(query) = query.filter(|q| !q.is_empty()) else {
            return Self::default();
        };
        let Ok(url) = Url::parse(&format!("ws://gateway/?{}", query)) else {
            return Self::default();
        };

        let mut params = Self::default();
        for (key, value) in url.query_pairs() {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match key.as_ref() {
                "session" | "session_id" => params.session = Some(value.to_string()),
                "model" => params.model = Some(value.to_string()),
                _ => {}
            }
        }
        params
    }
}

/// 解析客户端文本帧
pub fn decode_request(text: &str) -> Result<ClientRequest, BoltError> {
    ClientRequest::parse(text)
}

/// 编码服务端事件
pub fn encode_event(event: &StudioEvent) -> String {
    event.to_json()
}
