//! 生成管线与提示词

pub mod generation;
pub mod prompts;

pub use generation::{GenerationPipeline, TurnState, WebTurn};
