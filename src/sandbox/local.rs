//! 本机沙箱：每个沙箱是根目录下的一个独立子目录
//!
//! 路径经 resolve 校验必须落在沙箱目录内（禁止绝对路径与 ../ 逃逸）；
//! 命令通过 sh -c 在沙箱目录中执行，带超时与 tracing 审计。只适合本地开发。

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::service::{ExecOutput, SandboxError, SandboxHandle, SandboxService};

/// 基于本机目录的沙箱服务
#[derive(Debug, Clone)]
pub struct LocalSandbox {
    root: PathBuf,
    command_timeout: Duration,
}

impl LocalSandbox {
    pub fn new(root: impl AsRef<Path>, command_timeout: Duration) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            command_timeout,
        }
    }

    fn sandbox_dir(&self, handle: &SandboxHandle) -> Result<PathBuf, SandboxError> {
        let dir = self.root.join(&handle.id);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(SandboxError::NotFound(handle.id.clone()))
        }
    }

    /// 把沙箱内相对路径解析为本机路径
    fn resolve(&self, handle: &SandboxHandle, path: &str) -> Result<PathBuf, SandboxError> {
        let rel = Path::new(path);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(SandboxError::InvalidPath(path.to_string()));
        }
        Ok(self.sandbox_dir(handle)?.join(rel))
    }
}

#[async_trait]
impl SandboxService for LocalSandbox {
    async fn create(&self) -> Result<SandboxHandle, SandboxError> {
        let handle = SandboxHandle::new(format!("local-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(self.root.join(&handle.id))
            .await
            .map_err(|e| SandboxError::Unavailable(format!("create dir failed: {}", e)))?;
        tracing::debug!(sandbox_id = %handle, "local sandbox created");
        Ok(handle)
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let dir = self.sandbox_dir(handle)?;
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|e| SandboxError::Unavailable(format!("remove dir failed: {}", e)))
    }

    async fn upload(&self, handle: &SandboxHandle, path: &str, bytes: &[u8]) -> Result<(), SandboxError> {
        let target = self.resolve(handle, path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SandboxError::Unavailable(e.to_string()))?;
        }
        tokio::fs::write(&target, bytes)
            .await
            .map_err(|e| SandboxError::Unavailable(e.to_string()))
    }

    async fn run(&self, handle: &SandboxHandle, command: &str) -> Result<ExecOutput, SandboxError> {
        let dir = self.sandbox_dir(handle)?;
        tracing::info!(sandbox_id = %handle, command = %command, "local sandbox run");

        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]).current_dir(&dir).kill_on_drop(true);

        let output = tokio::time::timeout(self.command_timeout, cmd.output())
            .await
            .map_err(|_| {
                SandboxError::Command(format!(
                    "command timed out after {}s",
                    self.command_timeout.as_secs()
                ))
            })?
            .map_err(|e| SandboxError::Command(e.to_string()))?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn expose_port(&self, handle: &SandboxHandle, port: u16) -> Result<String, SandboxError> {
        self.sandbox_dir(handle)?;
        Ok(format!("http://127.0.0.1:{}/", port))
    }
}
