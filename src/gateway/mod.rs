//! 网关：流式模式的 WebSocket 服务端
//!
//! 每个会话一条双向通道：
//! - 客户端发送 `chat` / `update_code` / `set_model` / `status` / `delete`；
//! - 服务端推送 `token` / `artifact` / `preview` / `complete` / `error` / `model_changed` / `session`。
//!
//! Hub 同时负责周期性的空闲回收。

mod hub;
mod message;

pub use hub::{Hub, HubConfig};
pub use message::{decode_request, encode_event, ConnectParams};
