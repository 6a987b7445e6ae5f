//! 流式模式集成测试：同一会话的生成严格串行，token 流不交错

use std::sync::Arc;
use std::time::Duration;

use bolt::config::{AppConfig, BusyPolicy};
use bolt::llm::MockLlmClient;
use bolt::sandbox::MockSandbox;
use bolt::studio::{ClientRequest, StudioEvent, StudioRuntime};
use bolt::ErrorKind;
use tokio::sync::mpsc;

const FIRST: &str = "First page.\n```index.html\n<h1>one</h1>\n```\n";
const SECOND: &str = "Second page.\n```index.html\n<h1>two</h1>\n```\n";

fn runtime(policy: BusyPolicy) -> (Arc<StudioRuntime>, Arc<MockSandbox>) {
    let mut cfg = AppConfig::default();
    cfg.preview.startup_delay_ms = 0;
    cfg.gateway.busy_policy = policy;
    let llm = MockLlmClient::with_replies([FIRST, SECOND])
        .fragment_chars(3)
        .fragment_delay(Duration::from_millis(5));
    let mock = Arc::new(MockSandbox::new());
    let rt = StudioRuntime::from_config(&cfg, Arc::new(llm), mock.clone());
    (Arc::new(rt), mock)
}

fn chat(prompt: &str) -> ClientRequest {
    ClientRequest::Chat {
        prompt: prompt.to_string(),
    }
}

/// 以 complete / error 为界切分 token 段
fn turns(events: &[StudioEvent]) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for event in events {
        match event {
            StudioEvent::Token { content } => current.push_str(content),
            StudioEvent::Complete { .. } => out.push(std::mem::take(&mut current)),
            _ => {}
        }
    }
    assert!(current.is_empty(), "tokens after the last complete: {current:?}");
    out
}

#[tokio::test(start_paused = true)]
async fn test_back_to_back_chats_never_interleave() {
    let (rt, _mock) = runtime(BusyPolicy::Queue);
    let session = rt.create_session(None).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let a = {
        let (rt, tx, id) = (rt.clone(), tx.clone(), session.id.clone());
        tokio::spawn(async move { rt.handle(&id, chat("first"), &tx).await })
    };
    let b = {
        let (rt, tx, id) = (rt.clone(), tx.clone(), session.id.clone());
        tokio::spawn(async move { rt.handle(&id, chat("second"), &tx).await })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();
    drop(tx);

    let mut events = Vec::new();
    while let Some(ev) = rx.recv().await {
        events.push(ev);
    }

    assert_eq!(turns(&events), vec![FIRST.to_string(), SECOND.to_string()]);
    let versions: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            StudioEvent::Preview { version, .. } => Some(*version),
            _ => None,
        })
        .collect();
    assert_eq!(versions, vec![1, 2]);

    let snap = rt.registry().get(&session.id).await.unwrap();
    assert_eq!(snap.files, vec!["index.html".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_reject_policy_refuses_second_chat() {
    let (rt, _mock) = runtime(BusyPolicy::Reject);
    let session = rt.create_session(None).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let first = {
        let (rt, tx, id) = (rt.clone(), tx.clone(), session.id.clone());
        tokio::spawn(async move { rt.handle(&id, chat("first"), &tx).await })
    };
    // 等第一轮开始输出
    loop {
        if let Some(StudioEvent::Token { .. }) = rx.recv().await {
            break;
        }
    }

    let err = rt.handle(&session.id, chat("second"), &tx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::GenerationInProgress);
    first.await.unwrap().unwrap();
    drop(tx);

    let mut rest = Vec::new();
    while let Some(ev) = rx.recv().await {
        rest.push(ev);
    }
    assert!(rest.iter().any(|e| matches!(
        e,
        StudioEvent::Error {
            kind: ErrorKind::GenerationInProgress,
            ..
        }
    )));
    assert_eq!(
        rest.iter()
            .filter(|e| matches!(e, StudioEvent::Complete { .. }))
            .count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_forwarding_tokens() {
    let (rt, _mock) = runtime(BusyPolicy::Queue);
    let session = rt.create_session(None).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let turn = {
        let (rt, tx, id) = (rt.clone(), tx.clone(), session.id.clone());
        tokio::spawn(async move { rt.handle(&id, chat("first"), &tx).await })
    };
    loop {
        if let Some(StudioEvent::Token { .. }) = rx.recv().await {
            break;
        }
    }
    rt.registry().cancel(&session.id).await.unwrap();

    let err = turn.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    drop(tx);
    while let Some(ev) = rx.recv().await {
        assert!(!matches!(ev, StudioEvent::Complete { .. } | StudioEvent::Error { .. }));
    }

    // 取消的轮次不写入历史，会话可以继续使用
    let snap = rt.registry().get(&session.id).await.unwrap();
    assert_eq!(snap.status, bolt::session::SessionStatus::Active);
    assert!(snap.files.is_empty());
}
