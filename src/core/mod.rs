//! 核心：错误类型与错误类别

pub mod error;

pub use error::{BoltError, ErrorKind};
