//! Studio：流式模式（网页构建 + 实时预览）
//!
//! 与传输层无关；gateway 把 WebSocket 消息转成 ClientRequest 交给 StudioRuntime。

pub mod events;
pub mod runtime;

pub use events::{ClientRequest, StudioEvent};
pub use runtime::{EventSender, StudioRuntime};
