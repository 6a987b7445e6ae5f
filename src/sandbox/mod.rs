//! 沙箱：执行服务抽象、三种后端与生命周期控制器

pub mod controller;
pub mod daytona;
pub mod local;
pub mod mock;
pub mod service;

use std::sync::Arc;
use std::time::Duration;

use crate::config::{SandboxProvider, SandboxSection};

pub use controller::{ControllerConfig, SandboxController, SandboxLease};
pub use daytona::DaytonaSandbox;
pub use local::LocalSandbox;
pub use mock::MockSandbox;
pub use service::{shell_quote, ExecOutput, SandboxError, SandboxHandle, SandboxService};

/// 按配置创建沙箱服务
pub fn create_service(cfg: &SandboxSection) -> Result<Arc<dyn SandboxService>, SandboxError> {
    let service: Arc<dyn SandboxService> = match cfg.provider {
        SandboxProvider::Local => {
            let root = cfg
                .local_root
                .clone()
                .unwrap_or_else(|| std::path::PathBuf::from("sandboxes"));
            Arc::new(LocalSandbox::new(
                root,
                Duration::from_secs(cfg.command_timeout_secs),
            ))
        }
        SandboxProvider::Daytona => Arc::new(DaytonaSandbox::from_config(cfg)?),
    };
    tracing::info!(provider = ?cfg.provider, "sandbox service ready");
    Ok(service)
}
