//! 沙箱生命周期控制器
//!
//! 每个会话最多绑定一个沙箱。槽位（slot）状态由 tokio Mutex 保护：
//! - acquire / lease 在锁内检查并按需创建，并发调用只会创建一次；
//! - lease 计数只在持锁时增加，reaper 用 try_lock 拿到锁后看到的计数是稳定的；
//! - release / reap 在锁内 take() 句柄，所以同一个沙箱只会被销毁一次。
//!
//! 销毁失败记日志，并在后台任务里重试一次，不阻塞调用方。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use base64::Engine;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use super::service::{shell_quote, ExecOutput, SandboxError, SandboxHandle, SandboxService};
use crate::config::SandboxSection;

/// 控制器参数
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// 沙箱内项目目录（相对沙箱 home）
    pub workspace_dir: String,
    pub idle_timeout: Duration,
    pub provision_retries: u32,
    pub provision_backoff: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::from(&SandboxSection::default())
    }
}

impl From<&SandboxSection> for ControllerConfig {
    fn from(cfg: &SandboxSection) -> Self {
        Self {
            workspace_dir: cfg.workspace_dir.clone(),
            idle_timeout: cfg.idle_timeout(),
            provision_retries: cfg.provision_retries,
            provision_backoff: Duration::from_millis(cfg.provision_backoff_ms),
        }
    }
}

struct SlotState {
    handle: Option<SandboxHandle>,
    /// 已从表中移除；持有旧 Arc 的调用方需要重新取槽位
    retired: bool,
}

struct SlotEntry {
    state: Mutex<SlotState>,
    leases: AtomicUsize,
    /// 空闲计时；独立于 state 锁，创建沙箱或租约结束时也能立即更新
    last_active: StdMutex<Instant>,
}

impl SlotEntry {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                handle: None,
                retired: false,
            }),
            leases: AtomicUsize::new(0),
            last_active: StdMutex::new(Instant::now()),
        }
    }

    fn mark_active(&self) {
        *self.last_active.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }
}

/// 沙箱租约：存活期间 reaper 不会回收该沙箱
pub struct SandboxLease {
    slot: Arc<SlotEntry>,
    handle: SandboxHandle,
}

impl SandboxLease {
    pub fn handle(&self) -> &SandboxHandle {
        &self.handle
    }
}

impl std::fmt::Debug for SandboxLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxLease")
            .field("handle", &self.handle)
            .finish()
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        // 空闲时间从租约结束开始算
        self.slot.mark_active();
        self.slot.leases.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 沙箱生命周期控制器
pub struct SandboxController {
    service: Arc<dyn SandboxService>,
    slots: RwLock<HashMap<String, Arc<SlotEntry>>>,
    config: ControllerConfig,
}

impl SandboxController {
    pub fn new(service: Arc<dyn SandboxService>, config: ControllerConfig) -> Self {
        Self {
            service,
            slots: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn service(&self) -> &Arc<dyn SandboxService> {
        &self.service
    }

    pub fn workspace_dir(&self) -> &str {
        &self.config.workspace_dir
    }

    pub fn idle_timeout(&self) -> Duration {
        self.config.idle_timeout
    }

    /// 沙箱内项目目录下的路径
    pub fn workspace_path(&self, relative: &str) -> String {
        let dir = self.config.workspace_dir.trim_end_matches('/');
        if dir.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{}", dir, relative.trim_start_matches('/'))
        }
    }

    async fn slot(&self, session_id: &str) -> Arc<SlotEntry> {
        if let Some(slot) = self.slots.read().await.get(session_id) {
            return slot.clone();
        }
        self.slots
            .write()
            .await
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(SlotEntry::new()))
            .clone()
    }

    async fn acquire_slot(
        &self,
        session_id: &str,
        lease: bool,
    ) -> Result<(Arc<SlotEntry>, SandboxHandle), SandboxError> {
        loop {
            let slot = self.slot(session_id).await;
            let mut state = slot.state.lock().await;
            if state.retired {
                continue;
            }

            let handle = match &state.handle {
                Some(handle) => handle.clone(),
                None => {
                    let handle = self.provision(session_id).await?;
                    state.handle = Some(handle.clone());
                    handle
                }
            };
            slot.mark_active();
            if lease {
                slot.leases.fetch_add(1, Ordering::SeqCst);
            }
            drop(state);
            return Ok((slot, handle));
        }
    }

    /// 取得会话的沙箱；已存在则直接返回同一个句柄
    pub async fn acquire(&self, session_id: &str) -> Result<SandboxHandle, SandboxError> {
        let (_, handle) = self.acquire_slot(session_id, false).await?;
        Ok(handle)
    }

    /// 取得沙箱并持有租约
    pub async fn lease(&self, session_id: &str) -> Result<SandboxLease, SandboxError> {
        let (slot, handle) = self.acquire_slot(session_id, true).await?;
        Ok(SandboxLease { slot, handle })
    }

    /// 当前绑定的句柄（不创建）
    pub async fn current(&self, session_id: &str) -> Option<SandboxHandle> {
        let slot = self.slots.read().await.get(session_id).cloned()?;
        let state = slot.state.lock().await;
        state.handle.clone()
    }

    /// 重置空闲计时
    pub async fn touch(&self, session_id: &str) {
        let slot = self.slots.read().await.get(session_id).cloned();
        if let Some(slot) = slot {
            slot.mark_active();
        }
    }

    /// 释放会话的沙箱；重复调用无副作用
    pub async fn release(&self, session_id: &str) {
        let Some(slot) = self.slots.write().await.remove(session_id) else {
            return;
        };
        let handle = {
            let mut state = slot.state.lock().await;
            state.retired = true;
            state.handle.take()
        };
        if let Some(handle) = handle {
            self.destroy(session_id, handle).await;
        }
    }

    /// 回收空闲超时且没有租约的沙箱，返回被回收的会话 ID
    pub async fn reap(&self) -> Vec<String> {
        let candidates: Vec<(String, Arc<SlotEntry>)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        let mut reaped = Vec::new();
        for (session_id, slot) in candidates {
            if slot.leases.load(Ordering::SeqCst) > 0 {
                continue;
            }
            // 正在创建或被其他调用持有：本轮跳过
            let Ok(mut state) = slot.state.try_lock() else {
                continue;
            };
            if state.retired
                || slot.leases.load(Ordering::SeqCst) > 0
                || slot.idle_for() < self.config.idle_timeout
            {
                continue;
            }
            state.retired = true;
            let handle = state.handle.take();
            drop(state);

            self.slots.write().await.remove(&session_id);
            tracing::info!(session_id = %session_id, "reaping idle sandbox");
            if let Some(handle) = handle {
                self.destroy(&session_id, handle).await;
            }
            reaped.push(session_id);
        }
        reaped
    }

    /// 当前绑定了沙箱的会话数
    pub async fn active_count(&self) -> usize {
        let slots: Vec<_> = self.slots.read().await.values().cloned().collect();
        let mut count = 0;
        for slot in slots {
            if slot.state.lock().await.handle.is_some() {
                count += 1;
            }
        }
        count
    }

    /// 上传文件；原生上传失败时改用 base64 + shell 写入
    pub async fn upload(&self, handle: &SandboxHandle, path: &str, bytes: &[u8]) -> Result<(), SandboxError> {
        let err = match self.service.upload(handle, path, bytes).await {
            Ok(()) => return Ok(()),
            Err(SandboxError::InvalidPath(p)) => return Err(SandboxError::InvalidPath(p)),
            Err(e) => e,
        };
        tracing::warn!(sandbox_id = %handle, path, error = %err, "native upload failed, using base64 fallback");

        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        let mut command = String::new();
        if let Some((dir, _)) = path.rsplit_once('/') {
            if !dir.is_empty() {
                command.push_str(&format!("mkdir -p {} && ", shell_quote(dir)));
            }
        }
        command.push_str(&format!(
            "printf '%s' {} | base64 -d > {}",
            shell_quote(&encoded),
            shell_quote(path)
        ));
        let out = self.service.run(handle, &command).await?;
        if out.success() {
            Ok(())
        } else {
            Err(SandboxError::Command(format!(
                "upload of {} failed: {}",
                path,
                out.error_text().trim()
            )))
        }
    }

    pub async fn run(&self, handle: &SandboxHandle, command: &str) -> Result<ExecOutput, SandboxError> {
        self.service.run(handle, command).await
    }

    pub async fn expose_port(&self, handle: &SandboxHandle, port: u16) -> Result<String, SandboxError> {
        self.service.expose_port(handle, port).await
    }

    /// 创建沙箱：暂时性错误按指数退避重试，成功后建好项目目录
    async fn provision(&self, session_id: &str) -> Result<SandboxHandle, SandboxError> {
        let mut attempt = 0u32;
        let handle = loop {
            match self.service.create().await {
                Ok(handle) => break handle,
                Err(e) if e.is_transient() && attempt < self.config.provision_retries => {
                    let backoff = self.config.provision_backoff * 2u32.saturating_pow(attempt);
                    tracing::warn!(
                        session_id = %session_id,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "sandbox provisioning failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(session_id = %session_id, error = %e, "sandbox provisioning failed");
                    return Err(e);
                }
            }
        };

        let mkdir = format!("mkdir -p {}", shell_quote(&self.config.workspace_dir));
        let setup = self.service.run(&handle, &mkdir).await;
        let failure = match setup {
            Ok(out) if out.success() => None,
            Ok(out) => Some(out.error_text().trim().to_string()),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = failure {
            self.destroy(session_id, handle).await;
            return Err(SandboxError::Unavailable(format!(
                "workspace setup failed: {}",
                reason
            )));
        }

        tracing::info!(session_id = %session_id, sandbox_id = %handle, "sandbox provisioned");
        Ok(handle)
    }

    async fn destroy(&self, session_id: &str, handle: SandboxHandle) {
        match self.service.destroy(&handle).await {
            Ok(()) => {
                tracing::info!(session_id = %session_id, sandbox_id = %handle, "sandbox destroyed");
            }
            Err(SandboxError::NotFound(_)) => {
                tracing::debug!(sandbox_id = %handle, "sandbox already gone");
            }
            Err(e) => {
                tracing::warn!(sandbox_id = %handle, error = %e, "sandbox destroy failed, retrying once in background");
                let service = self.service.clone();
                tokio::spawn(async move {
                    if let Err(e) = service.destroy(&handle).await {
                        tracing::error!(sandbox_id = %handle, error = %e, "sandbox destroy retry failed");
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::MockSandbox;

    fn controller(mock: Arc<MockSandbox>) -> SandboxController {
        SandboxController::new(
            mock,
            ControllerConfig {
                workspace_dir: "project".into(),
                idle_timeout: Duration::from_secs(60),
                provision_retries: 2,
                provision_backoff: Duration::from_millis(100),
            },
        )
    }

    #[tokio::test]
    async fn test_acquire_is_idempotent() {
        let mock = Arc::new(MockSandbox::new());
        let ctl = controller(mock.clone());
        let a = ctl.acquire("s1").await.unwrap();
        let b = ctl.acquire("s1").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(mock.created().len(), 1);
        assert_eq!(mock.commands(&a), vec!["mkdir -p 'project'".to_string()]);
    }

    #[tokio::test]
    async fn test_release_twice_destroys_once() {
        let mock = Arc::new(MockSandbox::new());
        let ctl = controller(mock.clone());
        let first = ctl.acquire("s1").await.unwrap();
        ctl.release("s1").await;
        ctl.release("s1").await;
        assert_eq!(mock.destroyed(), vec![first.id.clone()]);

        let second = ctl.acquire("s1").await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_provision_errors_are_retried() {
        let mock = Arc::new(MockSandbox::new());
        mock.fail_creates([
            SandboxError::Transient("429".into()),
            SandboxError::Transient("503".into()),
        ]);
        let ctl = controller(mock.clone());
        assert!(ctl.acquire("s1").await.is_ok());
        assert_eq!(mock.created().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_gives_up_after_retries() {
        let mock = Arc::new(MockSandbox::new());
        mock.fail_creates((0..3).map(|i| SandboxError::Transient(format!("busy {}", i))));
        let ctl = controller(mock.clone());
        assert!(ctl.acquire("s1").await.unwrap_err().is_transient());
        assert!(mock.created().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_is_not_retried() {
        let mock = Arc::new(MockSandbox::new());
        mock.fail_creates([SandboxError::Unavailable("401".into())]);
        let ctl = controller(mock.clone());
        assert!(matches!(
            ctl.acquire("s1").await,
            Err(SandboxError::Unavailable(_))
        ));
        assert!(ctl.acquire("s1").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_respects_threshold() {
        let mock = Arc::new(MockSandbox::new());
        let ctl = controller(mock.clone());
        ctl.acquire("s1").await.unwrap();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(ctl.reap().await.is_empty());
        assert_eq!(mock.live_count(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(ctl.reap().await, vec!["s1".to_string()]);
        assert_eq!(mock.live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_resets_idle_clock() {
        let mock = Arc::new(MockSandbox::new());
        let ctl = controller(mock.clone());
        ctl.acquire("s1").await.unwrap();

        tokio::time::advance(Duration::from_secs(50)).await;
        ctl.touch("s1").await;
        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(ctl.reap().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_skips_leased_sandbox() {
        let mock = Arc::new(MockSandbox::new());
        let ctl = controller(mock.clone());
        let lease = ctl.lease("s1").await.unwrap();

        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(ctl.reap().await.is_empty());
        assert_eq!(mock.live_count(), 1);

        drop(lease);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(ctl.reap().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_drop_refreshes_clock_while_slot_is_locked() {
        let mock = Arc::new(MockSandbox::new());
        let ctl = controller(mock.clone());
        let lease = ctl.lease("s1").await.unwrap();
        tokio::time::advance(Duration::from_secs(600)).await;

        {
            let slot = ctl.slot("s1").await;
            let _state = slot.state.lock().await;
            drop(lease);
        }

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(ctl.reap().await.is_empty());
        assert_eq!(mock.live_count(), 1);
    }

    #[tokio::test]
    async fn test_upload_falls_back_to_base64() {
        let mock = Arc::new(MockSandbox::new());
        mock.fail_uploads(true);
        let ctl = controller(mock.clone());
        let h = ctl.acquire("s1").await.unwrap();

        ctl.upload(&h, "project/js/app.js", b"x").await.unwrap();
        let cmds = mock.commands(&h);
        let last = cmds.last().unwrap();
        assert!(last.starts_with("mkdir -p 'project/js' && printf '%s' 'eA=='"));
        assert!(last.ends_with("base64 -d > 'project/js/app.js'"));
    }

    #[tokio::test]
    async fn test_destroy_failure_does_not_block_release() {
        let mock = Arc::new(MockSandbox::new());
        let ctl = controller(mock.clone());
        let h = ctl.acquire("s1").await.unwrap();
        mock.fail_destroys([SandboxError::Transient("503".into())]);

        ctl.release("s1").await;
        // 后台重试
        for _ in 0..10 {
            if !mock.destroyed().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(mock.destroyed(), vec![h.id]);
    }

    #[test]
    fn test_workspace_path() {
        let ctl = controller(Arc::new(MockSandbox::new()));
        assert_eq!(ctl.workspace_path("index.html"), "project/index.html");
        assert_eq!(ctl.workspace_path("/js/app.js"), "project/js/app.js");
    }
}
