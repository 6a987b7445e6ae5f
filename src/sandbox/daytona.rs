//! Daytona 兼容 REST API 的沙箱客户端
//!
//! - POST   {api}/sandbox                                        创建，随后轮询直到 state = started
//! - DELETE {api}/sandbox/{id}                                   销毁
//! - POST   {api}/toolbox/{id}/toolbox/files/upload?path=...     multipart 上传
//! - POST   {api}/toolbox/{id}/toolbox/process/execute           执行命令
//! - GET    {api}/sandbox/{id}/ports/{port}/preview-url          预览链接
//!
//! 状态码映射：429 / 5xx → Transient，401 / 403 → Unavailable，404 → NotFound。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;

use super::service::{ExecOutput, SandboxError, SandboxHandle, SandboxService};
use crate::config::SandboxSection;

pub const DEFAULT_API_URL: &str = "https://app.daytona.io/api";

/// 等待沙箱进入 started 的最长轮询次数
const START_POLL_ATTEMPTS: u32 = 60;
const START_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct SandboxInfo {
    id: String,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteResponse {
    #[serde(default)]
    exit_code: i32,
    #[serde(default)]
    result: String,
}

#[derive(Debug, Deserialize)]
struct PreviewUrl {
    url: String,
}

/// Daytona 沙箱服务
pub struct DaytonaSandbox {
    http: Client,
    api_url: String,
    api_key: String,
    command_timeout: Duration,
}

impl DaytonaSandbox {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            http: Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            command_timeout,
        }
    }

    /// 从 [sandbox] 配置构造；缺少 api_key 时返回 Unavailable
    pub fn from_config(cfg: &SandboxSection) -> Result<Self, SandboxError> {
        let api_key = cfg
            .api_key
            .clone()
            .or_else(|| std::env::var("DAYTONA_API_KEY").ok())
            .ok_or_else(|| SandboxError::Unavailable("DAYTONA_API_KEY is not set".to_string()))?;
        let api_url = cfg.api_url.clone().unwrap_or_else(|| DEFAULT_API_URL.to_string());
        Ok(Self::new(
            api_url,
            api_key,
            Duration::from_secs(cfg.command_timeout_secs),
        ))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    async fn check(resp: Response, what: &str) -> Result<Response, SandboxError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(map_status(status, &format!("{} failed ({}): {}", what, status, body)))
    }

    async fn fetch(&self, id: &str) -> Result<SandboxInfo, SandboxError> {
        let resp = self
            .http
            .get(self.url(&format!("/sandbox/{}", id)))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(transport)?;
        Self::check(resp, "get sandbox")
            .await?
            .json()
            .await
            .map_err(|e| SandboxError::Unavailable(e.to_string()))
    }

    async fn wait_started(&self, mut info: SandboxInfo) -> Result<SandboxInfo, SandboxError> {
        for _ in 0..START_POLL_ATTEMPTS {
            match info.state.as_deref() {
                Some("started") | None => return Ok(info),
                Some("error") | Some("build_failed") => {
                    return Err(SandboxError::Unavailable(format!(
                        "sandbox {} failed to start",
                        info.id
                    )))
                }
                Some(state) => {
                    tracing::debug!(sandbox_id = %info.id, state, "waiting for sandbox to start");
                }
            }
            tokio::time::sleep(START_POLL_INTERVAL).await;
            info = self.fetch(&info.id).await?;
        }
        Err(SandboxError::Transient(format!(
            "sandbox {} did not start in time",
            info.id
        )))
    }
}

fn map_status(status: StatusCode, msg: &str) -> SandboxError {
    match status.as_u16() {
        429 | 500..=599 => SandboxError::Transient(msg.to_string()),
        404 => SandboxError::NotFound(msg.to_string()),
        _ => SandboxError::Unavailable(msg.to_string()),
    }
}

fn transport(e: reqwest::Error) -> SandboxError {
    if e.is_timeout() || e.is_connect() {
        SandboxError::Transient(e.to_string())
    } else {
        SandboxError::Unavailable(e.to_string())
    }
}

#[async_trait]
impl SandboxService for DaytonaSandbox {
    async fn create(&self) -> Result<SandboxHandle, SandboxError> {
        let resp = self
            .http
            .post(self.url("/sandbox"))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(transport)?;
        let info: SandboxInfo = Self::check(resp, "create sandbox")
            .await?
            .json()
            .await
            .map_err(|e| SandboxError::Unavailable(e.to_string()))?;
        let info = self.wait_started(info).await?;
        tracing::info!(sandbox_id = %info.id, "daytona sandbox started");
        Ok(SandboxHandle::new(info.id))
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let resp = self
            .http
            .delete(self.url(&format!("/sandbox/{}", handle.id)))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(transport)?;
        Self::check(resp, "delete sandbox").await?;
        Ok(())
    }

    async fn upload(&self, handle: &SandboxHandle, path: &str, bytes: &[u8]) -> Result<(), SandboxError> {
        let file_name = path.rsplit('/').next().unwrap_or(path).to_string();
        let part = reqwest::multipart::Part::bytes(bytes.to_vec()).file_name(file_name);
        let form = reqwest::multipart::Form::new().part("file", part);
        let resp = self
            .http
            .post(self.url(&format!("/toolbox/{}/toolbox/files/upload", handle.id)))
            .query(&[("path", path)])
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(transport)?;
        Self::check(resp, "upload file").await?;
        Ok(())
    }

    async fn run(&self, handle: &SandboxHandle, command: &str) -> Result<ExecOutput, SandboxError> {
        tracing::info!(sandbox_id = %handle, command = %command, "daytona sandbox run");
        let body = serde_json::json!({
            "command": command,
            "timeout": self.command_timeout.as_secs(),
        });
        let resp = self
            .http
            .post(self.url(&format!("/toolbox/{}/toolbox/process/execute", handle.id)))
            .bearer_auth(&self.api_key)
            .timeout(self.command_timeout + Duration::from_secs(10))
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        let out: ExecuteResponse = Self::check(resp, "execute")
            .await?
            .json()
            .await
            .map_err(|e| SandboxError::Command(e.to_string()))?;
        // process/execute 合并了输出流，stderr 为空
        Ok(ExecOutput {
            stdout: out.result,
            stderr: String::new(),
            exit_code: out.exit_code,
        })
    }

    async fn expose_port(&self, handle: &SandboxHandle, port: u16) -> Result<String, SandboxError> {
        let resp = self
            .http
            .get(self.url(&format!("/sandbox/{}/ports/{}/preview-url", handle.id, port)))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(transport)?;
        let preview: PreviewUrl = Self::check(resp, "preview url")
            .await?
            .json()
            .await
            .map_err(|e| SandboxError::Unavailable(e.to_string()))?;
        Ok(preview.url)
    }
}
