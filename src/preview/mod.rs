//! 预览发布（流式模式）
//!
//! 每次部署成功后：确保沙箱内的静态 HTTP 服务在跑（根目录为项目目录，固定端口），
//! 取得（或复用）外部链接，preview_version 加一。版本号是缓存破坏参数，
//! 不带版本直接刷新同一个 URL 可能拿到旧内容。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::PreviewSection;
use crate::core::BoltError;
use crate::sandbox::{shell_quote, SandboxController, SandboxError, SandboxHandle};
use crate::session::SessionEntry;

/// 一次预览更新
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewUpdate {
    pub url: String,
    pub version: u64,
}

impl PreviewUpdate {
    /// 带版本参数的 URL
    pub fn cache_busted_url(&self) -> String {
        let sep = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}v={}", self.url, sep, self.version)
    }
}

/// 预览发布器
pub struct PreviewPublisher {
    controller: Arc<SandboxController>,
    port: u16,
    startup_delay: Duration,
}

impl PreviewPublisher {
    pub fn new(controller: Arc<SandboxController>, cfg: &PreviewSection) -> Self {
        Self {
            controller,
            port: cfg.port,
            startup_delay: Duration::from_millis(cfg.startup_delay_ms),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// 重启沙箱内的静态服务器
    pub async fn start_server(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let kill = format!(
            "pkill -f 'python3 -m http.server {}' 2>/dev/null || true",
            self.port
        );
        self.controller.run(handle, &kill).await?;

        let start = format!(
            "cd {} && nohup python3 -m http.server {} > /dev/null 2>&1 &",
            shell_quote(self.controller.workspace_dir()),
            self.port
        );
        let out = self.controller.run(handle, &start).await?;
        if !out.success() {
            return Err(SandboxError::Command(format!(
                "preview server failed to start: {}",
                out.error_text().trim()
            )));
        }
        tokio::time::sleep(self.startup_delay).await;
        tracing::info!(sandbox_id = %handle, port = self.port, "preview server started");
        Ok(())
    }

    /// 发布新版本预览
    pub async fn publish(
        &self,
        session: &SessionEntry,
        handle: &SandboxHandle,
    ) -> Result<PreviewUpdate, BoltError> {
        if !session.with(|s| s.preview_server_running) {
            self.start_server(handle)
                .await
                .map_err(BoltError::sandbox_operation)?;
            session.with(|s| s.preview_server_running = true);
        }

        let url = match session.with(|s| s.preview_url.clone()) {
            Some(url) => url,
            None => {
                let url = self
                    .controller
                    .expose_port(handle, self.port)
                    .await
                    .map_err(BoltError::sandbox_operation)?;
                session.with(|s| s.preview_url = Some(url.clone()));
                url
            }
        };

        let version = session.with(|s| {
            s.preview_version += 1;
            s.preview_version
        });
        tracing::info!(sandbox_id = %handle, version, "preview updated");
        Ok(PreviewUpdate { url, version })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_busted_url() {
        let p = PreviewUpdate {
            url: "https://8000-abc.proxy.test/".into(),
            version: 3,
        };
        assert_eq!(p.cache_busted_url(), "https://8000-abc.proxy.test/?v=3");

        let p = PreviewUpdate {
            url: "https://host/preview?token=t".into(),
            version: 1,
        };
        assert_eq!(p.cache_busted_url(), "https://host/preview?token=t&v=1");
    }
}
