//! Bolt - AI 编码会话编排
//!
//! 管理编码会话的生命周期：与模型流式交互、从回复中提取代码产物、
//! 部署到隔离沙箱，并在执行失败时有限次自动修复。
//!
//! 模块划分：
//! - **agent**: 批处理模式 CodeAgent（交互式 CLI 使用）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类
//! - **execution**: 执行语言与自动修复循环
//! - **extract**: 围栏代码块词法分析与产物提取
//! - **gateway**: WebSocket 中枢（每会话一条双工通道 + 空闲回收）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 会话内对话历史
//! - **observability**: tracing 订阅器
//! - **pipeline**: 生成管线（提示词、流式驱动、两种模式）
//! - **preview**: 沙箱内静态预览服务与版本化链接
//! - **sandbox**: 沙箱服务抽象（Local / Daytona / Mock）与生命周期控制器
//! - **session**: 会话状态机与注册表
//! - **studio**: 流式模式运行时（网页构建 + 实时预览）

pub mod agent;
pub mod config;
pub mod core;
pub mod execution;
pub mod extract;
#[cfg(feature = "gateway")]
pub mod gateway;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod pipeline;
pub mod preview;
pub mod sandbox;
pub mod session;
pub mod studio;

pub use crate::core::{BoltError, ErrorKind};
