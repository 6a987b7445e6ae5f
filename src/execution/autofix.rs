//! 执行 / 自动修复循环（批处理模式）
//!
//! `Attempt i of N`：部署代码 → 运行 → 非零退出时把失败代码和错误输出交给模型，拿到修正版再试。
//! 总尝试次数有上限；用尽后把最后一次失败作为终止结果报告，不会静默吞掉。

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::language::Language;
use crate::config::ExecutionSection;
use crate::core::BoltError;
use crate::pipeline::GenerationPipeline;
use crate::sandbox::{ExecOutput, SandboxController, SandboxError, SandboxHandle};

/// 单次尝试的结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Success,
    Failure,
    /// 沙箱错误或修正请求失败，循环终止
    Fatal,
}

/// 一次执行尝试
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionAttempt {
    /// 从 1 开始
    pub attempt: u32,
    pub code: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionAttempt {
    fn from_output(attempt: u32, code: &str, out: ExecOutput) -> Self {
        let outcome = if out.success() {
            AttemptOutcome::Success
        } else {
            AttemptOutcome::Failure
        };
        Self {
            attempt,
            code: code.to_string(),
            stdout: out.stdout,
            stderr: out.stderr,
            exit_code: Some(out.exit_code),
            outcome,
            error: None,
        }
    }

    fn fatal(attempt: u32, code: &str, error: &BoltError) -> Self {
        Self {
            attempt,
            code: code.to_string(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            outcome: AttemptOutcome::Fatal,
            error: Some(error.to_string()),
        }
    }

    /// 交给模型的错误文本：优先 stderr
    pub fn error_text(&self) -> &str {
        if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }
}

/// 一次 run 的全部尝试
#[derive(Debug)]
pub struct ExecutionReport {
    pub language: Language,
    pub attempts: Vec<ExecutionAttempt>,
    /// 致命错误（若有）
    pub fatal: Option<BoltError>,
}

impl ExecutionReport {
    pub fn last(&self) -> Option<&ExecutionAttempt> {
        self.attempts.last()
    }

    pub fn succeeded(&self) -> bool {
        self.last()
            .map(|a| a.outcome == AttemptOutcome::Success)
            .unwrap_or(false)
    }

    /// 修复次数（首次之后的尝试）
    pub fn retries(&self) -> u32 {
        self.attempts.len().saturating_sub(1) as u32
    }

    /// 最终使用的代码
    pub fn final_code(&self) -> Option<&str> {
        self.last().map(|a| a.code.as_str())
    }

    /// 成功返回最后一次尝试，否则返回终止错误
    pub fn into_result(mut self) -> Result<ExecutionAttempt, BoltError> {
        if let Some(err) = self.fatal.take() {
            return Err(err);
        }
        match self.attempts.pop() {
            Some(last) if last.outcome == AttemptOutcome::Success => Ok(last),
            Some(last) => Err(BoltError::ExecutionFailure {
                exit_code: last.exit_code.unwrap_or(-1),
                stderr: last.error_text().to_string(),
            }),
            None => Err(BoltError::InvalidRequest("nothing was executed".to_string())),
        }
    }
}

/// 执行器：在沙箱项目目录里写入脚本并运行，按需自动修复
pub struct Executor {
    controller: Arc<SandboxController>,
    pipeline: GenerationPipeline,
    max_attempts: u32,
    auto_fix: bool,
}

impl Executor {
    pub fn new(controller: Arc<SandboxController>, pipeline: GenerationPipeline, cfg: &ExecutionSection) -> Self {
        Self {
            controller,
            pipeline,
            max_attempts: cfg.max_attempts.max(1),
            auto_fix: cfg.auto_fix,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// 部署并运行一次
    pub async fn execute_once(
        &self,
        handle: &SandboxHandle,
        language: Language,
        code: &str,
    ) -> Result<ExecOutput, SandboxError> {
        let path = self.controller.workspace_path(language.script_name());
        self.controller.upload(handle, &path, code.as_bytes()).await?;
        self.controller.run(handle, &language.command(&path)).await
    }

    pub fn auto_fix(&self) -> bool {
        self.auto_fix
    }

    /// 运行代码；失败时按配置请求修正并重试
    pub async fn run(
        &self,
        handle: &SandboxHandle,
        model: &str,
        language: Language,
        code: &str,
        cancel: &CancellationToken,
    ) -> ExecutionReport {
        self.run_with(handle, model, language, code, self.auto_fix, cancel)
            .await
    }

    /// 同 run，但由调用方决定是否自动修复
    pub async fn run_with(
        &self,
        handle: &SandboxHandle,
        model: &str,
        language: Language,
        code: &str,
        auto_fix: bool,
        cancel: &CancellationToken,
    ) -> ExecutionReport {
        let mut report = ExecutionReport {
            language,
            attempts: Vec::new(),
            fatal: None,
        };
        let attempts = if auto_fix { self.max_attempts } else { 1 };
        let mut code = code.to_string();

        for attempt in 1..=attempts {
            let output = match self.execute_once(handle, language, &code).await {
                Ok(output) => output,
                Err(e) => {
                    let err = BoltError::sandbox_operation(e);
                    tracing::error!(sandbox_id = %handle, attempt, error = %err, "execution attempt aborted");
                    report.attempts.push(ExecutionAttempt::fatal(attempt, &code, &err));
                    report.fatal = Some(err);
                    break;
                }
            };

            let record = ExecutionAttempt::from_output(attempt, &code, output);
            tracing::info!(
                sandbox_id = %handle,
                attempt,
                max_attempts = attempts,
                exit_code = record.exit_code.unwrap_or(-1),
                outcome = ?record.outcome,
                "execution attempt"
            );
            let failed = record.outcome == AttemptOutcome::Failure;
            let error_text = record.error_text().to_string();
            report.attempts.push(record);

            if !failed || attempt == attempts {
                break;
            }

            match self
                .pipeline
                .fix(model, language, &code, &error_text, cancel)
                .await
            {
                Ok(fixed) => code = fixed,
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "correction request failed");
                    report.attempts.push(ExecutionAttempt::fatal(attempt + 1, &code, &err));
                    report.fatal = Some(err);
                    break;
                }
            }
        }

        if !report.succeeded() && report.fatal.is_none() {
            tracing::warn!(
                sandbox_id = %handle,
                attempts = report.attempts.len(),
                "execution failed after all attempts"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlmClient, MockReply};
    use crate::sandbox::{ControllerConfig, MockSandbox};

    fn failing(stderr: &str) -> ExecOutput {
        ExecOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code: 1,
        }
    }

    async fn setup(
        llm: MockLlmClient,
        cfg: ExecutionSection,
    ) -> (Arc<MockSandbox>, Arc<MockLlmClient>, Executor, SandboxHandle) {
        let mock = Arc::new(MockSandbox::new());
        let llm = Arc::new(llm);
        let controller = Arc::new(SandboxController::new(mock.clone(), ControllerConfig::default()));
        let handle = controller.acquire("s").await.unwrap();
        let executor = Executor::new(controller, GenerationPipeline::new(llm.clone()), &cfg);
        (mock, llm, executor, handle)
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let (mock, llm, executor, handle) =
            setup(MockLlmClient::new(), ExecutionSection::default()).await;
        mock.on_command("python3", [ExecOutput {
            stdout: "42\n".into(),
            ..ExecOutput::default()
        }]);

        let report = executor
            .run(&handle, "m", Language::Python, "print(42)", &CancellationToken::new())
            .await;
        assert!(report.succeeded());
        assert_eq!(report.retries(), 0);
        assert_eq!(mock.file(&handle, "project/main.py").as_deref(), Some("print(42)"));
        assert!(llm.requests().is_empty());
    }

    #[tokio::test]
    async fn test_fix_then_success() {
        let llm = MockLlmClient::with_replies(["```python\nprint(1)\n```"]);
        let (mock, llm, executor, handle) = setup(llm, ExecutionSection::default()).await;
        mock.on_command("python3", [failing("NameError: x"), ExecOutput::default()]);

        let report = executor
            .run(&handle, "m", Language::Python, "print(x)", &CancellationToken::new())
            .await;
        assert!(report.succeeded());
        assert_eq!(report.attempts.len(), 2);
        assert_eq!(report.final_code(), Some("print(1)\n"));

        let fix_request = &llm.requests()[0];
        assert!(fix_request.messages[0].content.contains("print(x)"));
        assert!(fix_request.messages[0].content.contains("NameError: x"));
    }

    #[tokio::test]
    async fn test_auto_fix_disabled_runs_once() {
        let cfg = ExecutionSection {
            auto_fix: false,
            ..ExecutionSection::default()
        };
        let (mock, llm, executor, handle) = setup(MockLlmClient::new(), cfg).await;
        mock.on_command("node", [failing("boom")]);

        let report = executor
            .run(&handle, "m", Language::JavaScript, "x()", &CancellationToken::new())
            .await;
        assert_eq!(report.attempts.len(), 1);
        assert!(llm.requests().is_empty());
        assert!(matches!(
            report.into_result(),
            Err(BoltError::ExecutionFailure { exit_code: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_correction_is_fatal() {
        let llm = MockLlmClient::new();
        llm.push(MockReply::Fail(LlmError::ServiceUnavailable("503".into())));
        let (mock, _llm, executor, handle) = setup(llm, ExecutionSection::default()).await;
        mock.on_command("python3", [failing("err")]);

        let report = executor
            .run(&handle, "m", Language::Python, "x", &CancellationToken::new())
            .await;
        assert_eq!(report.attempts.len(), 2);
        assert_eq!(report.attempts[1].outcome, AttemptOutcome::Fatal);
        assert!(matches!(
            report.into_result(),
            Err(BoltError::TransientProvider(_))
        ));
    }

    #[test]
    fn test_error_text_falls_back_to_stdout() {
        let a = ExecutionAttempt::from_output(
            1,
            "c",
            ExecOutput {
                stdout: "Traceback on stdout".into(),
                stderr: String::new(),
                exit_code: 1,
            },
        );
        assert_eq!(a.error_text(), "Traceback on stdout");
    }
}
