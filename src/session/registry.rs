//! 会话注册表
//!
//! 显式持有的会话表（无全局单例），每个条目自带锁：
//! - `session`：std Mutex，只在同步的短临界区内读写会话字段；
//! - `generation`：tokio Mutex，保证同一会话同时只有一轮生成。
//!
//! 每轮对话先取得 TurnGuard（只调用模型的轮次到此为止）；
//! 需要沙箱的轮次取得 GenerationGuard，它在 TurnGuard 之外再持有沙箱租约，
//! reaper 不会回收正在生成的会话。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};
use tokio_util::sync::CancellationToken;

use super::model::{Session, SessionId, SessionSnapshot, SessionStatus};
use crate::core::BoltError;
use crate::sandbox::{SandboxController, SandboxHandle, SandboxLease};

/// 注册表中的一个会话
pub struct SessionEntry {
    session: Mutex<Session>,
    generation: Arc<AsyncMutex<()>>,
    /// 当前轮次的取消令牌
    cancel: Mutex<CancellationToken>,
}

impl SessionEntry {
    fn new(session: Session) -> Self {
        Self {
            session: Mutex::new(session),
            generation: Arc::new(AsyncMutex::new(())),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 在锁内读写会话
    pub fn with<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.lock().snapshot()
    }

    fn cancel_turn(&self) {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner()).cancel();
    }

    fn new_turn_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = token.clone();
        token
    }
}

/// 一轮对话的独占凭证
///
/// 持有期间会话处于 generating；`finish` 按结果回到 active 或进入 error。
/// 未调用 `finish` 就被丢弃时回到 active。
pub struct TurnGuard {
    entry: Arc<SessionEntry>,
    cancel: CancellationToken,
    finished: bool,
    _permit: OwnedMutexGuard<()>,
}

impl TurnGuard {
    pub fn session_id(&self) -> SessionId {
        self.entry.lock().id.clone()
    }

    pub fn entry(&self) -> &SessionEntry {
        &self.entry
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        self.entry.with(f)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.entry.snapshot()
    }

    /// 结束本轮：致命错误进入 error，其余回到 active
    pub fn finish(mut self, result: Result<(), &BoltError>) {
        self.finished = true;
        let mut session = self.entry.lock();
        session.touch();
        if session.status != SessionStatus::Generating {
            return;
        }
        let next = match result {
            Ok(()) => {
                session.last_error = None;
                SessionStatus::Active
            }
            Err(err) => {
                session.last_error = Some(err.to_string());
                if err.is_fatal() {
                    tracing::error!(session_id = %session.id, error = %err, "fatal error, session moved to error");
                    SessionStatus::Error
                } else {
                    SessionStatus::Active
                }
            }
        };
        let _ = session.transition(next);
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut session = self.entry.lock();
        if session.status == SessionStatus::Generating {
            let _ = session.transition(SessionStatus::Active);
        }
    }
}

/// 需要沙箱的一轮：TurnGuard 加沙箱租约
pub struct GenerationGuard {
    turn: TurnGuard,
    lease: SandboxLease,
}

impl GenerationGuard {
    pub fn session_id(&self) -> SessionId {
        self.turn.session_id()
    }

    pub fn entry(&self) -> &SessionEntry {
        self.turn.entry()
    }

    pub fn handle(&self) -> &SandboxHandle {
        self.lease.handle()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        self.turn.cancel_token()
    }

    pub fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        self.turn.with_session(f)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.turn.snapshot()
    }

    /// 结束本轮；租约随后释放
    pub fn finish(self, result: Result<(), &BoltError>) {
        let Self { turn, lease } = self;
        turn.finish(result);
        drop(lease);
    }
}

/// 会话注册表
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<SessionEntry>>>,
    controller: Arc<SandboxController>,
    max_context_turns: usize,
}

impl SessionRegistry {
    pub fn new(controller: Arc<SandboxController>, max_context_turns: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            controller,
            max_context_turns,
        }
    }

    pub fn controller(&self) -> &Arc<SandboxController> {
        &self.controller
    }

    async fn insert(&self, model: &str) -> (SessionId, Arc<SessionEntry>) {
        let id = uuid::Uuid::new_v4().to_string();
        let entry = Arc::new(SessionEntry::new(Session::new(
            id.clone(),
            model,
            self.max_context_turns,
        )));
        self.sessions.write().await.insert(id.clone(), entry.clone());
        (id, entry)
    }

    /// 创建会话并立即准备沙箱
    ///
    /// 沙箱创建失败时会话留在 error 状态（之后由 reaper 清理），返回 SandboxUnavailable。
    pub async fn create(&self, model: &str) -> Result<SessionSnapshot, BoltError> {
        let (id, entry) = self.insert(model).await;
        tracing::info!(session_id = %id, model, "session created");

        match self.controller.acquire(&id).await {
            Ok(handle) => Ok(entry.with(|s| {
                s.sandbox = Some(handle);
                let _ = s.transition(SessionStatus::Active);
                s.touch();
                s.snapshot()
            })),
            Err(e) => {
                let err = BoltError::SandboxUnavailable(format!("session {}: {}", id, e));
                entry.with(|s| {
                    s.last_error = Some(err.to_string());
                    let _ = s.transition(SessionStatus::Error);
                });
                tracing::error!(session_id = %id, error = %e, "sandbox provisioning failed");
                Err(err)
            }
        }
    }

    /// 创建会话，沙箱推迟到第一次生成时再准备
    pub async fn create_deferred(&self, model: &str) -> SessionSnapshot {
        let (id, entry) = self.insert(model).await;
        tracing::info!(session_id = %id, model, "session created (sandbox deferred)");
        entry.with(|s| {
            let _ = s.transition(SessionStatus::Active);
            s.snapshot()
        })
    }

    pub async fn entry(&self, id: &str) -> Result<Arc<SessionEntry>, BoltError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| BoltError::SessionNotFound(id.to_string()))
    }

    pub async fn get(&self, id: &str) -> Result<SessionSnapshot, BoltError> {
        Ok(self.entry(id).await?.snapshot())
    }

    pub async fn list(&self) -> Vec<SessionSnapshot> {
        let entries: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut list: Vec<_> = entries.iter().map(|e| e.snapshot()).collect();
        list.sort_by_key(|s| s.created_at);
        list
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 在锁内读写会话
    pub async fn with_session<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Result<R, BoltError> {
        Ok(self.entry(id).await?.with(f))
    }

    /// 重置会话与沙箱的空闲计时
    pub async fn touch(&self, id: &str) -> Result<(), BoltError> {
        self.entry(id).await?.with(|s| s.touch());
        self.controller.touch(id).await;
        Ok(())
    }

    pub async fn set_model(&self, id: &str, model: &str) -> Result<(), BoltError> {
        let model = model.trim();
        if model.is_empty() {
            return Err(BoltError::InvalidRequest("model must not be empty".to_string()));
        }
        self.with_session(id, |s| s.model = model.to_string()).await?;
        self.touch(id).await?;
        tracing::info!(session_id = %id, model, "model changed");
        Ok(())
    }

    /// 取消会话当前轮次的 token 转发
    pub async fn cancel(&self, id: &str) -> Result<(), BoltError> {
        self.entry(id).await?.cancel_turn();
        Ok(())
    }

    /// 销毁会话；不存在时同样返回 Ok
    pub async fn destroy(&self, id: &str) -> Result<(), BoltError> {
        let Some(entry) = self.sessions.write().await.remove(id) else {
            return Ok(());
        };
        entry.cancel_turn();
        entry.with(|s| {
            let _ = s.transition(SessionStatus::Terminated);
            s.sandbox = None;
        });
        self.controller.release(id).await;
        tracing::info!(session_id = %id, "session destroyed");
        Ok(())
    }

    /// 开始一轮对话（不占用沙箱）；会话忙时排队等待
    pub async fn begin_turn(&self, id: &str) -> Result<TurnGuard, BoltError> {
        let entry = self.entry(id).await?;
        let permit = entry.generation.clone().lock_owned().await;
        self.start_turn(id, entry, permit).await
    }

    /// 开始一轮对话；会话忙时立即返回 GenerationInProgress
    pub async fn try_begin_turn(&self, id: &str) -> Result<TurnGuard, BoltError> {
        let entry = self.entry(id).await?;
        let permit = entry
            .generation
            .clone()
            .try_lock_owned()
            .map_err(|_| BoltError::GenerationInProgress(id.to_string()))?;
        self.start_turn(id, entry, permit).await
    }

    /// 开始一轮生成并租用沙箱；会话忙时排队等待
    pub async fn begin_generation(&self, id: &str) -> Result<GenerationGuard, BoltError> {
        let turn = self.begin_turn(id).await?;
        self.with_lease(id, turn).await
    }

    /// 开始一轮生成并租用沙箱；会话忙时立即返回 GenerationInProgress
    pub async fn try_begin_generation(&self, id: &str) -> Result<GenerationGuard, BoltError> {
        let turn = self.try_begin_turn(id).await?;
        self.with_lease(id, turn).await
    }

    async fn start_turn(
        &self,
        id: &str,
        entry: Arc<SessionEntry>,
        permit: OwnedMutexGuard<()>,
    ) -> Result<TurnGuard, BoltError> {
        // 排队期间会话可能已被销毁
        entry.with(|s| match s.status {
            SessionStatus::Terminated => Err(BoltError::SessionTerminated(s.id.clone())),
            SessionStatus::Error => Err(BoltError::InvalidRequest(format!(
                "session {} is in error state and must be recreated",
                s.id
            ))),
            _ => Ok(()),
        })?;

        let cancel = entry.new_turn_token();
        entry.with(|s| {
            s.touch();
            s.transition(SessionStatus::Generating)
        })?;
        self.controller.touch(id).await;
        tracing::debug!(session_id = %id, "turn started");

        Ok(TurnGuard {
            entry,
            cancel,
            finished: false,
            _permit: permit,
        })
    }

    async fn with_lease(&self, id: &str, turn: TurnGuard) -> Result<GenerationGuard, BoltError> {
        let lease = match self.controller.lease(id).await {
            Ok(lease) => lease,
            Err(e) => {
                let err = BoltError::from(e);
                turn.finish(Err(&err));
                return Err(err);
            }
        };
        turn.with_session(|s| s.sandbox = Some(lease.handle().clone()));
        Ok(GenerationGuard { turn, lease })
    }

    /// 回收空闲会话，返回被回收的 ID
    ///
    /// 沙箱由控制器按空闲时间和租约判断；没有沙箱的空闲会话（例如创建失败留下的 error 会话）一并清理。
    pub async fn reap(&self) -> Vec<SessionId> {
        let mut reaped = self.controller.reap().await;

        let idle_timeout = self.controller.idle_timeout();
        let entries: Vec<_> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect();
        for (id, entry) in entries {
            if reaped.contains(&id) {
                continue;
            }
            let idle = entry.with(|s| s.idle_since.elapsed() >= idle_timeout);
            if !idle || entry.generation.try_lock().is_err() {
                continue;
            }
            if self.controller.current(&id).await.is_none() {
                reaped.push(id);
            }
        }

        for id in &reaped {
            if let Some(entry) = self.sessions.write().await.remove(id) {
                entry.cancel_turn();
                entry.with(|s| {
                    let _ = s.transition(SessionStatus::Terminated);
                    s.sandbox = None;
                });
                // 控制器中可能还留着空槽位
                self.controller.release(id).await;
                tracing::info!(session_id = %id, "idle session reclaimed");
            }
        }
        reaped
    }

    /// 销毁所有会话（进程退出时）
    pub async fn shutdown(&self) {
        let ids: Vec<_> = self.sessions.read().await.keys().cloned().collect();
        for id in ids {
            let _ = self.destroy(&id).await;
        }
    }
}
