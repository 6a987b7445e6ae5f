//! Mock 沙箱：内存实现，用于测试
//!
//! 记录所有创建、销毁、上传与命令；命令输出按子串规则脚本化，支持注入创建/上传/销毁失败。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::service::{ExecOutput, SandboxError, SandboxHandle, SandboxService};

#[derive(Default)]
struct MockState {
    next_id: usize,
    live: HashSet<String>,
    created: Vec<String>,
    destroyed: Vec<String>,
    files: HashMap<(String, String), Vec<u8>>,
    commands: Vec<(String, String)>,
    /// (子串, 输出序列)；序列只剩一个时保持不变
    rules: Vec<(String, VecDeque<ExecOutput>)>,
    create_failures: VecDeque<SandboxError>,
    destroy_failures: VecDeque<SandboxError>,
    upload_fails: bool,
}

/// 内存沙箱服务
#[derive(Default)]
pub struct MockSandbox {
    state: Mutex<MockState>,
    create_delay: Option<Duration>,
}

impl MockSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// create 前等待，用于并发测试
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    /// 包含 `pattern` 的命令依次返回 `outputs`，最后一个会一直重复
    pub fn on_command(&self, pattern: &str, outputs: impl IntoIterator<Item = ExecOutput>) {
        let outputs: VecDeque<_> = outputs.into_iter().collect();
        if outputs.is_empty() {
            return;
        }
        self.lock().rules.push((pattern.to_string(), outputs));
    }

    /// 接下来的 create 依次返回这些错误
    pub fn fail_creates(&self, errors: impl IntoIterator<Item = SandboxError>) {
        self.lock().create_failures.extend(errors);
    }

    pub fn fail_destroys(&self, errors: impl IntoIterator<Item = SandboxError>) {
        self.lock().destroy_failures.extend(errors);
    }

    /// 原生上传全部失败（触发 base64 回退）
    pub fn fail_uploads(&self, fail: bool) {
        self.lock().upload_fails = fail;
    }

    pub fn created(&self) -> Vec<String> {
        self.lock().created.clone()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.lock().destroyed.clone()
    }

    pub fn live_count(&self) -> usize {
        self.lock().live.len()
    }

    /// 某沙箱执行过的命令
    pub fn commands(&self, handle: &SandboxHandle) -> Vec<String> {
        self.lock()
            .commands
            .iter()
            .filter(|(id, _)| id == &handle.id)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn all_commands(&self) -> Vec<String> {
        self.lock().commands.iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn file(&self, handle: &SandboxHandle, path: &str) -> Option<String> {
        self.lock()
            .files
            .get(&(handle.id.clone(), path.to_string()))
            .map(|b| String::from_utf8_lossy(b).to_string())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_live(state: &MockState, handle: &SandboxHandle) -> Result<(), SandboxError> {
        if state.live.contains(&handle.id) {
            Ok(())
        } else {
            Err(SandboxError::NotFound(handle.id.clone()))
        }
    }
}

#[async_trait]
impl SandboxService for MockSandbox {
    async fn create(&self) -> Result<SandboxHandle, SandboxError> {
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        if let Some(err) = state.create_failures.pop_front() {
            return Err(err);
        }
        state.next_id += 1;
        let id = format!("mock-{}", state.next_id);
        state.live.insert(id.clone());
        state.created.push(id.clone());
        Ok(SandboxHandle::new(id))
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let mut state = self.lock();
        if let Some(err) = state.destroy_failures.pop_front() {
            return Err(err);
        }
        if !state.live.remove(&handle.id) {
            return Err(SandboxError::NotFound(handle.id.clone()));
        }
        state.destroyed.push(handle.id.clone());
        Ok(())
    }

    async fn upload(&self, handle: &SandboxHandle, path: &str, bytes: &[u8]) -> Result<(), SandboxError> {
        let mut state = self.lock();
        Self::ensure_live(&state, handle)?;
        if state.upload_fails {
            return Err(SandboxError::Unavailable("upload endpoint down".to_string()));
        }
        state
            .files
            .insert((handle.id.clone(), path.to_string()), bytes.to_vec());
        Ok(())
    }

    async fn run(&self, handle: &SandboxHandle, command: &str) -> Result<ExecOutput, SandboxError> {
        let mut state = self.lock();
        Self::ensure_live(&state, handle)?;
        state.commands.push((handle.id.clone(), command.to_string()));

        for (pattern, outputs) in state.rules.iter_mut() {
            if command.contains(pattern.as_str()) {
                let out = if outputs.len() > 1 {
                    outputs.pop_front()
                } else {
                    outputs.front().cloned()
                };
                return Ok(out.unwrap_or_default());
            }
        }
        Ok(ExecOutput::default())
    }

    async fn expose_port(&self, handle: &SandboxHandle, port: u16) -> Result<String, SandboxError> {
        let state = self.lock();
        Self::ensure_live(&state, handle)?;
        Ok(format!("https://{}-{}.preview.mock", port, handle.id))
    }
}
