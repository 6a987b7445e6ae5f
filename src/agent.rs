//! 批处理 Agent：交互式 CLI 背后的单会话运行时
//!
//! 一个操作者、一个会话、按顺序 await 每一步：
//! generate / chat / explain 只占用会话的轮次锁并调用模型；
//! execute / run 才通过生成凭证租用沙箱（首次使用时创建）。
//! 任何一轮遇到致命错误（如鉴权失败）会话都进入 error。
//! cleanup 销毁会话及其沙箱。

use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::BoltError;
use crate::execution::{ExecutionReport, Executor, Language};
use crate::llm::{LlmClient, ModelInfo};
use crate::pipeline::GenerationPipeline;
use crate::sandbox::{ControllerConfig, ExecOutput, SandboxController, SandboxService};
use crate::session::{SessionId, SessionRegistry, SessionSnapshot};

/// 批处理模式的代码 Agent
pub struct CodeAgent {
    registry: Arc<SessionRegistry>,
    pipeline: GenerationPipeline,
    executor: Executor,
    session_id: SessionId,
    last_code: Option<String>,
}

impl CodeAgent {
    /// 创建会话（沙箱延迟创建）
    pub async fn new(
        registry: Arc<SessionRegistry>,
        pipeline: GenerationPipeline,
        executor: Executor,
        model: &str,
        language: Language,
    ) -> Self {
        let session = registry.create_deferred(model).await;
        let _ = registry
            .with_session(&session.id, |s| s.language = language)
            .await;
        Self {
            registry,
            pipeline,
            executor,
            session_id: session.id,
            last_code: None,
        }
    }

    pub async fn from_config(
        cfg: &AppConfig,
        llm: Arc<dyn LlmClient>,
        service: Arc<dyn SandboxService>,
    ) -> Self {
        let controller = Arc::new(SandboxController::new(
            service,
            ControllerConfig::from(&cfg.sandbox),
        ));
        let registry = Arc::new(SessionRegistry::new(
            controller.clone(),
            cfg.app.max_context_turns,
        ));
        let pipeline = GenerationPipeline::new(llm);
        let executor = Executor::new(controller, pipeline.clone(), &cfg.execution);
        Self::new(
            registry,
            pipeline,
            executor,
            &cfg.llm.model,
            cfg.execution.default_language,
        )
        .await
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// 最近一次生成或修正后的代码（/exec 使用）
    pub fn last_code(&self) -> Option<&str> {
        self.last_code.as_deref()
    }

    pub async fn status(&self) -> Result<SessionSnapshot, BoltError> {
        self.registry.get(&self.session_id).await
    }

    pub async fn language(&self) -> Result<Language, BoltError> {
        self.registry
            .with_session(&self.session_id, |s| s.language)
            .await
    }

    pub async fn model(&self) -> Result<String, BoltError> {
        self.registry
            .with_session(&self.session_id, |s| s.model.clone())
            .await
    }

    pub async fn set_language(&self, language: Language) -> Result<(), BoltError> {
        self.registry
            .with_session(&self.session_id, |s| s.language = language)
            .await?;
        self.registry.touch(&self.session_id).await?;
        tracing::info!(session_id = %self.session_id, language = %language, "language changed");
        Ok(())
    }

    pub async fn set_model(&self, model: &str) -> Result<(), BoltError> {
        self.registry.set_model(&self.session_id, model).await
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, BoltError> {
        Ok(self.pipeline.llm().list_models().await?)
    }

    /// 生成代码（不执行）
    pub async fn generate(&mut self, prompt: &str) -> Result<String, BoltError> {
        let prompt = non_empty(prompt)?;
        let turn = self.registry.begin_turn(&self.session_id).await?;
        let language = turn.with_session(|s| s.language);
        let result = self
            .pipeline
            .generate(turn.entry(), language, prompt, turn.cancel_token())
            .await;
        turn.finish(result.as_ref().map(|_| ()));
        let code = result?;
        tracing::info!(session_id = %self.session_id, %language, lines = code.lines().count(), "code generated");
        self.last_code = Some(code.clone());
        Ok(code)
    }

    /// 在沙箱里运行一次，不做修复；非零退出码照常返回
    pub async fn execute(&self, code: &str) -> Result<ExecOutput, BoltError> {
        let guard = self.registry.begin_generation(&self.session_id).await?;
        let language = guard.with_session(|s| s.language);
        let result = self
            .executor
            .execute_once(guard.handle(), language, code)
            .await
            .map_err(BoltError::sandbox_operation);
        guard.finish(result.as_ref().map(|_| ()));
        result
    }

    /// 执行上一次生成的代码
    pub async fn execute_last(&self) -> Result<ExecOutput, BoltError> {
        let code = self.last_code.as_deref().ok_or_else(|| {
            BoltError::InvalidRequest("no code to execute, generate some first".to_string())
        })?;
        self.execute(code).await
    }

    /// 生成并执行；auto_fix 时失败会请求修正并重试
    pub async fn run(&mut self, prompt: &str, auto_fix: bool) -> Result<ExecutionReport, BoltError> {
        let code = self.generate(prompt).await?;

        let guard = self.registry.begin_generation(&self.session_id).await?;
        let (model, language) = guard.with_session(|s| (s.model.clone(), s.language));
        let report = self
            .executor
            .run_with(
                guard.handle(),
                &model,
                language,
                &code,
                auto_fix,
                guard.cancel_token(),
            )
            .await;
        guard.finish(report.fatal.as_ref().map_or(Ok(()), Err));

        if let Some(code) = report.final_code() {
            self.last_code = Some(code.to_string());
        }
        Ok(report)
    }

    /// 普通对话，回放最近几次生成作为上下文
    pub async fn chat(&self, prompt: &str) -> Result<String, BoltError> {
        let prompt = non_empty(prompt)?;
        let turn = self.registry.begin_turn(&self.session_id).await?;
        let result = self
            .pipeline
            .chat(turn.entry(), prompt, turn.cancel_token())
            .await;
        turn.finish(result.as_ref().map(|_| ()));
        result
    }

    /// 解释代码；未给出时解释上一次生成的代码
    pub async fn explain(&self, code: Option<&str>) -> Result<String, BoltError> {
        let code = code
            .filter(|c| !c.trim().is_empty())
            .or(self.last_code.as_deref())
            .ok_or_else(|| BoltError::InvalidRequest("no code to explain".to_string()))?;
        let turn = self.registry.begin_turn(&self.session_id).await?;
        let (model, language) = turn.with_session(|s| (s.model.clone(), s.language));
        let result = self
            .pipeline
            .explain(&model, language, code, turn.cancel_token())
            .await;
        turn.finish(result.as_ref().map(|_| ()));
        result
    }

    /// 清空对话历史
    pub async fn clear(&mut self) -> Result<(), BoltError> {
        self.registry
            .with_session(&self.session_id, |s| s.conversation.clear())
            .await?;
        self.last_code = None;
        Ok(())
    }

    /// 销毁会话与沙箱
    pub async fn cleanup(&self) {
        let _ = self.registry.destroy(&self.session_id).await;
    }
}

fn non_empty(prompt: &str) -> Result<&str, BoltError> {
    let prompt = prompt.trim();
    if prompt.is_empty() {
        return Err(BoltError::InvalidRequest("prompt must not be empty".to_string()));
    }
    Ok(prompt)
}
