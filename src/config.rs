//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BOLT__*` 覆盖（双下划线表示嵌套，如 `BOLT__SANDBOX__PROVIDER=local`）。
//! API Key 额外支持 `KOLOSAL_API_KEY` / `DAYTONA_API_KEY`。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::execution::Language;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub sandbox: SandboxSection,
    pub execution: ExecutionSection,
    pub preview: PreviewSection,
    pub gateway: GatewaySection,
}

/// [app] 段：对话轮数上限
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 会话内保留的对话轮数
    #[serde(default = "default_max_context_turns")]
    pub max_context_turns: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            max_context_turns: default_max_context_turns(),
        }
    }
}

fn default_max_context_turns() -> usize {
    20
}

/// [llm] 段：端点、模型与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            model: default_model(),
            max_tokens: default_max_tokens(),
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_model() -> String {
    crate::llm::DEFAULT_MODEL.to_string()
}

fn default_max_tokens() -> u32 {
    8192
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 普通 HTTP 请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    10
}

/// 沙箱后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SandboxProvider {
    /// 本机目录 + sh -c
    #[default]
    Local,
    /// Daytona 兼容 REST API
    Daytona,
}

/// [sandbox] 段：后端选择、工作目录、空闲回收与重试
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxSection {
    #[serde(default)]
    pub provider: SandboxProvider,
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    /// Local 后端的根目录，未设置时用 ./sandboxes
    pub local_root: Option<PathBuf>,
    /// 沙箱内的项目目录（相对沙箱 home）
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: String,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
    /// 创建沙箱遇到暂时性错误时的额外重试次数
    #[serde(default = "default_provision_retries")]
    pub provision_retries: u32,
    #[serde(default = "default_provision_backoff_ms")]
    pub provision_backoff_ms: u64,
    /// 单条命令超时（秒）
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            provider: SandboxProvider::default(),
            api_url: None,
            api_key: None,
            local_root: None,
            workspace_dir: default_workspace_dir(),
            idle_timeout_secs: default_idle_timeout_secs(),
            reap_interval_secs: default_reap_interval_secs(),
            provision_retries: default_provision_retries(),
            provision_backoff_ms: default_provision_backoff_ms(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl SandboxSection {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

fn default_workspace_dir() -> String {
    "project".to_string()
}

fn default_idle_timeout_secs() -> u64 {
    30 * 60
}

fn default_reap_interval_secs() -> u64 {
    60
}

fn default_provision_retries() -> u32 {
    2
}

fn default_provision_backoff_ms() -> u64 {
    500
}

fn default_command_timeout_secs() -> u64 {
    60
}

/// [execution] 段：批处理模式的自动修复
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionSection {
    /// 总尝试次数（含首次执行）
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub default_language: Language,
    #[serde(default = "default_auto_fix")]
    pub auto_fix: bool,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            default_language: Language::default(),
            auto_fix: default_auto_fix(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_auto_fix() -> bool {
    true
}

/// [preview] 段：沙箱内静态服务器
#[derive(Debug, Clone, Deserialize)]
pub struct PreviewSection {
    #[serde(default = "default_preview_port")]
    pub port: u16,
    /// 启动服务器后的等待时间
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,
}

impl Default for PreviewSection {
    fn default() -> Self {
        Self {
            port: default_preview_port(),
            startup_delay_ms: default_startup_delay_ms(),
        }
    }
}

fn default_preview_port() -> u16 {
    8000
}

fn default_startup_delay_ms() -> u64 {
    1000
}

/// 会话忙时对新 chat 请求的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// 排队等待上一轮结束
    #[default]
    Queue,
    /// 立即返回 generation_in_progress
    Reject,
}

/// [gateway] 段：WebSocket 监听地址
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub busy_policy: BusyPolicy,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            busy_policy: BusyPolicy::default(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

/// 从 config 目录加载配置，环境变量 BOLT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 BOLT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BOLT")
            .separator("__")
            .try_parsing(true),
    );

    let mut cfg: AppConfig = builder.build()?.try_deserialize()?;

    if cfg.llm.api_key.is_none() {
        cfg.llm.api_key = std::env::var("KOLOSAL_API_KEY").ok();
    }
    if cfg.sandbox.api_key.is_none() {
        cfg.sandbox.api_key = std::env::var("DAYTONA_API_KEY").ok();
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.sandbox.idle_timeout(), Duration::from_secs(1800));
        assert_eq!(cfg.execution.max_attempts, 3);
        assert_eq!(cfg.preview.port, 8000);
        assert_eq!(cfg.sandbox.provider, SandboxProvider::Local);
        assert_eq!(cfg.gateway.busy_policy, BusyPolicy::Queue);
        assert_eq!(cfg.execution.default_language, Language::Python);
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[sandbox]
provider = "daytona"
idle_timeout_secs = 60

[execution]
default_language = "javascript"

[gateway]
busy_policy = "reject"
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.sandbox.provider, SandboxProvider::Daytona);
        assert_eq!(cfg.sandbox.idle_timeout_secs, 60);
        assert_eq!(cfg.sandbox.workspace_dir, "project");
        assert_eq!(cfg.execution.default_language, Language::JavaScript);
        assert_eq!(cfg.gateway.busy_policy, BusyPolicy::Reject);
    }
}
