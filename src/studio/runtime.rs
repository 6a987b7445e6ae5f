//! Studio Runtime：流式模式的处理核心，与传输层解耦
//!
//! 一次 chat：取得会话的生成凭证 → 流式生成并逐片段推送 token →
//! 按顺序部署产物 → 发布预览 → complete。部署是尽力而为的顺序写入，中途失败不回滚。

use std::sync::Arc;

use tokio::sync::mpsc;

use super::events::{ClientRequest, StudioEvent};
use crate::config::{AppConfig, BusyPolicy};
use crate::core::BoltError;
use crate::extract::parse_filename;
use crate::llm::LlmClient;
use crate::pipeline::GenerationPipeline;
use crate::preview::PreviewPublisher;
use crate::sandbox::{ControllerConfig, SandboxController, SandboxService};
use crate::session::{GenerationGuard, SessionRegistry, SessionSnapshot};

/// 事件发送端
pub type EventSender = mpsc::UnboundedSender<StudioEvent>;

/// token 转发缓冲
const TOKEN_BUFFER: usize = 64;

/// 流式模式运行时
pub struct StudioRuntime {
    registry: Arc<SessionRegistry>,
    pipeline: GenerationPipeline,
    preview: PreviewPublisher,
    busy_policy: BusyPolicy,
    default_model: String,
}

impl StudioRuntime {
    pub fn new(
        registry: Arc<SessionRegistry>,
        pipeline: GenerationPipeline,
        preview: PreviewPublisher,
        busy_policy: BusyPolicy,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            pipeline,
            preview,
            busy_policy,
            default_model: default_model.into(),
        }
    }

    /// 由配置组装：控制器、注册表、管线、预览
    pub fn from_config(
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
        Self::new(
            registry,
            GenerationPipeline::new(llm),
            PreviewPublisher::new(controller, &cfg.preview),
            cfg.gateway.busy_policy,
            cfg.llm.model.clone(),
        )
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// 创建会话（立即准备沙箱）
    pub async fn create_session(&self, model: Option<&str>) -> Result<SessionSnapshot, BoltError> {
        let model = model
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str());
        self.registry.create(model).await
    }

    async fn begin(&self, session_id: &str) -> Result<GenerationGuard, BoltError> {
        match self.busy_policy {
            BusyPolicy::Queue => self.registry.begin_generation(session_id).await,
            BusyPolicy::Reject => self.registry.try_begin_generation(session_id).await,
        }
    }

    /// 分发一条客户端请求
    pub async fn handle(
        &self,
        session_id: &str,
        request: ClientRequest,
        events: &EventSender,
    ) -> Result<(), BoltError> {
        let result = match request {
            ClientRequest::Chat { prompt } => self.chat(session_id, &prompt, events).await.map(|_| ()),
            ClientRequest::UpdateCode { path, content } => {
                self.update_code(session_id, &path, &content, events).await
            }
            ClientRequest::SetModel { model } => self.set_model(session_id, &model, events).await,
            ClientRequest::Status => self.status(session_id, events).await,
            ClientRequest::GetFile { path } => self.get_file(session_id, &path, events).await,
            ClientRequest::ListModels => self.list_models(events).await,
            ClientRequest::Delete => self.registry.destroy(session_id).await,
        };
        if let Err(ref e) = result {
            if !matches!(e, BoltError::Cancelled) {
                events.send(StudioEvent::error(e)).ok();
            }
        }
        result
    }

    /// 一轮流式生成；返回本轮部署的文件
    ///
    /// 失败时由调用方（handle）推送 error 事件。
    pub async fn chat(
        &self,
        session_id: &str,
        prompt: &str,
        events: &EventSender,
    ) -> Result<Vec<String>, BoltError> {
        if prompt.trim().is_empty() {
            return Err(BoltError::InvalidRequest("prompt must not be empty".to_string()));
        }
        let guard = self.begin(session_id).await?;
        tracing::info!(session_id = %session_id, "chat turn started");

        match self.run_turn(&guard, prompt, events).await {
            Ok(files) => {
                guard.finish(Ok(()));
                tracing::info!(session_id = %session_id, files = files.len(), "chat turn complete");
                Ok(files)
            }
            Err(e) => {
                guard.finish(Err(&e));
                tracing::warn!(session_id = %session_id, error = %e, "chat turn failed");
                Err(e)
            }
        }
    }

    async fn run_turn(
        &self,
        guard: &GenerationGuard,
        prompt: &str,
        events: &EventSender,
    ) -> Result<Vec<String>, BoltError> {
        let (token_tx, mut token_rx) = mpsc::channel::<String>(TOKEN_BUFFER);
        let forward = async {
            while let Some(fragment) = token_rx.recv().await {
                if events.send(StudioEvent::token(fragment)).is_err() {
                    break;
                }
            }
        };
        let generate = self.pipeline.web_turn(
            guard.entry(),
            prompt,
            Some(token_tx),
            guard.cancel_token(),
        );
        let (turn, ()) = tokio::join!(generate, forward);
        let turn = turn?;

        let controller = self.registry.controller();
        let handle = guard.handle();
        for artifact in &turn.artifacts {
            let path = controller.workspace_path(&artifact.filename);
            controller
                .upload(handle, &path, artifact.content.as_bytes())
                .await
                .map_err(BoltError::sandbox_operation)?;
            guard.with_session(|s| s.record_file(&artifact.filename, &artifact.content));
            tracing::debug!(session_id = %guard.session_id(), filename = %artifact.filename, "artifact deployed");
            events
                .send(StudioEvent::Artifact {
                    filename: artifact.filename.clone(),
                })
                .ok();
        }

        if !turn.artifacts.is_empty() {
            let update = self.preview.publish(guard.entry(), handle).await?;
            events
                .send(StudioEvent::Preview {
                    url: update.url,
                    version: update.version,
                })
                .ok();
        }

        let files = turn.files();
        events
            .send(StudioEvent::Complete {
                files: files.clone(),
            })
            .ok();
        Ok(files)
    }

    /// 手动修改文件：部署并刷新预览
    pub async fn update_code(
        &self,
        session_id: &str,
        path: &str,
        content: &str,
        events: &EventSender,
    ) -> Result<(), BoltError> {
        let filename = parse_filename(path.trim())
            .ok_or_else(|| BoltError::InvalidRequest(format!("invalid file path: {}", path)))?;
        let guard = self.begin(session_id).await?;

        let result = async {
            let controller = self.registry.controller();
            controller
                .upload(
                    guard.handle(),
                    &controller.workspace_path(&filename),
                    content.as_bytes(),
                )
                .await
                .map_err(BoltError::sandbox_operation)?;
            guard.with_session(|s| s.record_file(&filename, content));
            events
                .send(StudioEvent::Artifact {
                    filename: filename.clone(),
                })
                .ok();
            let update = self.preview.publish(guard.entry(), guard.handle()).await?;
            events
                .send(StudioEvent::Preview {
                    url: update.url,
                    version: update.version,
                })
                .ok();
            Ok::<_, BoltError>(())
        }
        .await;

        match &result {
            Ok(()) => guard.finish(Ok(())),
            Err(e) => guard.finish(Err(e)),
        }
        result
    }

    pub async fn set_model(
        &self,
        session_id: &str,
        model: &str,
        events: &EventSender,
    ) -> Result<(), BoltError> {
        self.registry.set_model(session_id, model).await?;
        events
            .send(StudioEvent::ModelChanged {
                model: model.trim().to_string(),
            })
            .ok();
        Ok(())
    }

    pub async fn status(&self, session_id: &str, events: &EventSender) -> Result<(), BoltError> {
        self.registry.touch(session_id).await?;
        let session = self.registry.get(session_id).await?;
        events.send(StudioEvent::Session { session }).ok();
        Ok(())
    }

    /// 返回会话记录的文件内容（最近一次部署的版本）
    pub async fn get_file(
        &self,
        session_id: &str,
        path: &str,
        events: &EventSender,
    ) -> Result<(), BoltError> {
        let filename = parse_filename(path.trim())
            .ok_or_else(|| BoltError::InvalidRequest(format!("invalid file path: {}", path)))?;
        let content = self
            .registry
            .with_session(session_id, |s| s.file(&filename).map(str::to_string))
            .await?
            .ok_or_else(|| BoltError::InvalidRequest(format!("file not deployed: {}", filename)))?;
        self.registry.touch(session_id).await?;
        events
            .send(StudioEvent::File {
                path: filename,
                content,
            })
            .ok();
        Ok(())
    }

    pub async fn list_models(&self, events: &EventSender) -> Result<(), BoltError> {
        let models = self.pipeline.llm().list_models().await?;
        events.send(StudioEvent::Models { models }).ok();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;
    use crate::llm::MockLlmClient;
    use crate::sandbox::{ExecOutput, MockSandbox};
    use crate::session::SessionStatus;
    use std::time::Duration;

    fn runtime(llm: MockLlmClient, mock: Arc<MockSandbox>) -> StudioRuntime {
        let mut cfg = AppConfig::default();
        cfg.preview.startup_delay_ms = 0;
        StudioRuntime::from_config(&cfg, Arc::new(llm), mock)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<StudioEvent>) -> Vec<StudioEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn test_chat_deploys_and_publishes_preview() {
        let reply = "Counter app.\n```index.html\n<h1>0</h1>\n```\n```app.js\nlet n = 0;\n```\nDone.";
        let mock = Arc::new(MockSandbox::new());
        let rt = runtime(MockLlmClient::with_replies([reply]), mock.clone());
        let session = rt.create_session(None).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let files = rt.chat(&session.id, "make a counter", &tx).await.unwrap();
        assert_eq!(files, vec!["index.html", "app.js"]);

        let events = drain(&mut rx);
        let tokens: String = events
            .iter()
            .filter_map(|e| match e {
                StudioEvent::Token { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(tokens, reply);
        assert!(events.contains(&StudioEvent::Artifact {
            filename: "index.html".into()
        }));
        assert!(matches!(
            events[events.len() - 2],
            StudioEvent::Preview { version: 1, .. }
        ));
        assert_eq!(
            events.last(),
            Some(&StudioEvent::Complete {
                files: vec!["index.html".into(), "app.js".into()]
            })
        );

        let handle = rt.registry().controller().current(&session.id).await.unwrap();
        assert_eq!(mock.file(&handle, "project/index.html").as_deref(), Some("<h1>0</h1>\n"));

        let snap = rt.registry().get(&session.id).await.unwrap();
        assert_eq!(snap.status, SessionStatus::Active);
        assert_eq!(snap.preview_version, 1);
    }

    #[tokio::test]
    async fn test_plain_reply_has_no_preview() {
        let mock = Arc::new(MockSandbox::new());
        let rt = runtime(MockLlmClient::with_replies(["Just text, ```python\nx\n```"]), mock);
        let session = rt.create_session(Some("other-model")).await.unwrap();
        assert_eq!(session.model, "other-model");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let files = rt.chat(&session.id, "hi", &tx).await.unwrap();
        assert!(files.is_empty());
        assert!(!drain(&mut rx)
            .iter()
            .any(|e| matches!(e, StudioEvent::Preview { .. })));
    }

    #[tokio::test]
    async fn test_update_code_bumps_preview_version() {
        let mock = Arc::new(MockSandbox::new());
        let rt = runtime(MockLlmClient::new(), mock.clone());
        let session = rt.create_session(None).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        rt.update_code(&session.id, "index.html", "<p>v1</p>", &tx).await.unwrap();
        rt.update_code(&session.id, "index.html", "<p>v2</p>", &tx).await.unwrap();
        let events = drain(&mut rx);
        assert!(events.contains(&StudioEvent::Preview {
            url: format!(
                "https://8000-{}.preview.mock",
                session.sandbox_id.clone().unwrap()
            ),
            version: 2,
        }));

        // 预览服务器只启动一次
        let starts = mock
            .all_commands()
            .iter()
            .filter(|c| c.contains("nohup python3 -m http.server 8000"))
            .count();
        assert_eq!(starts, 1);

        let err = rt
            .update_code(&session.id, "../etc/passwd.txt", "x", &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, BoltError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_handle_reports_errors_as_events() {
        let rt = runtime(MockLlmClient::new(), Arc::new(MockSandbox::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let err = rt
            .handle("missing", ClientRequest::Status, &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, BoltError::SessionNotFound(_)));
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [StudioEvent::Error { .. }]
        ));
    }

    #[tokio::test]
    async fn test_preview_start_failure_keeps_session_usable() {
        let mock = Arc::new(MockSandbox::new());
        mock.on_command(
            "nohup",
            [
                ExecOutput {
                    stdout: String::new(),
                    stderr: "sh: python3: not found".into(),
                    exit_code: 127,
                },
                ExecOutput::default(),
            ],
        );
        let rt = runtime(
            MockLlmClient::with_replies(["```index.html\n<p>hi</p>\n```", "```index.html\n<p>again</p>\n```"]),
            mock,
        );
        let session = rt.create_session(None).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let err = rt
            .handle(
                &session.id,
                ClientRequest::Chat {
                    prompt: "hello page".into(),
                },
                &tx,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SandboxOperation);
        assert!(drain(&mut rx).contains(&StudioEvent::Error {
            kind: ErrorKind::SandboxOperation,
            message: err.to_string(),
        }));

        let snap = rt.registry().get(&session.id).await.unwrap();
        assert_eq!(snap.status, SessionStatus::Active);
        assert!(snap.last_error.is_some());

        // 下一轮照常进行
        let files = rt.chat(&session.id, "try again", &tx).await.unwrap();
        assert_eq!(files, vec!["index.html"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_and_set_model_keep_sandbox_alive() {
        let mut cfg = AppConfig::default();
        cfg.preview.startup_delay_ms = 0;
        cfg.sandbox.idle_timeout_secs = 60;
        let mock = Arc::new(MockSandbox::new());
        let rt = StudioRuntime::from_config(&cfg, Arc::new(MockLlmClient::new()), mock.clone());
        let session = rt.create_session(None).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        tokio::time::advance(Duration::from_secs(50)).await;
        rt.handle(&session.id, ClientRequest::Status, &tx).await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(rt.registry().reap().await.is_empty());

        tokio::time::advance(Duration::from_secs(50)).await;
        rt.handle(
            &session.id,
            ClientRequest::SetModel {
                model: "qwen".into(),
            },
            &tx,
        )
        .await
        .unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(rt.registry().reap().await.is_empty());
        assert_eq!(mock.live_count(), 1);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(rt.registry().reap().await, vec![session.id.clone()]);
    }

    #[tokio::test]
    async fn test_get_file_and_list_models() {
        let rt = runtime(MockLlmClient::new(), Arc::new(MockSandbox::new()));
        let session = rt.create_session(None).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        rt.update_code(&session.id, "js/app.js", "let n = 1;", &tx).await.unwrap();
        drain(&mut rx);

        rt.handle(
            &session.id,
            ClientRequest::GetFile {
                path: "js/app.js".into(),
            },
            &tx,
        )
        .await
        .unwrap();
        rt.handle(&session.id, ClientRequest::ListModels, &tx).await.unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![
                StudioEvent::File {
                    path: "js/app.js".into(),
                    content: "let n = 1;".into(),
                },
                StudioEvent::Models { models: Vec::new() },
            ]
        );

        let err = rt
            .handle(
                &session.id,
                ClientRequest::GetFile {
                    path: "missing.css".into(),
                },
                &tx,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn test_set_model_emits_event() {
        let rt = runtime(MockLlmClient::new(), Arc::new(MockSandbox::new()));
        let session = rt.create_session(None).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        rt.handle(
            &session.id,
            ClientRequest::SetModel {
                model: "qwen".into(),
            },
            &tx,
        )
        .await
        .unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![StudioEvent::ModelChanged {
                model: "qwen".into()
            }]
        );
        assert_eq!(rt.registry().get(&session.id).await.unwrap().model, "qwen");
    }
}
