//! Hub：WebSocket 服务器 + 空闲回收
//!
//! 每条连接绑定一个会话，是该会话唯一的双向流式通道。
//! 后台循环在 accept 之外定期调用 registry.reap()，回收空闲会话及其沙箱。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::message::{decode_request, encode_event, ConnectParams};
use crate::config::AppConfig;
use crate::core::BoltError;
use crate::session::SessionSnapshot;
use crate::studio::{ClientRequest, StudioEvent, StudioRuntime};

/// Hub 配置
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// WebSocket 监听地址
    pub bind_addr: String,
    /// 空闲回收间隔
    pub reap_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for HubConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            bind_addr: cfg.gateway.bind_addr.clone(),
            reap_interval: cfg.sandbox.reap_interval(),
        }
    }
}

/// Hub - 流式模式服务端
pub struct Hub {
    config: HubConfig,
    runtime: Arc<StudioRuntime>,
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl Hub {
    pub fn new(config: HubConfig, runtime: Arc<StudioRuntime>) -> Self {
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);
        Self {
            config,
            runtime,
            shutdown: shutdown_tx,
        }
    }

    pub fn runtime(&self) -> &Arc<StudioRuntime> {
        &self.runtime
    }

    /// 启动网关，返回实际监听地址
    pub async fn start(&self) -> Result<SocketAddr, String> {
        let addr: SocketAddr = self
            .config
            .bind_addr
            .parse()
            .map_err(|e| format!("Invalid bind address: {}", e))?;

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| format!("Failed to bind: {}", e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| format!("Failed to read local address: {}", e))?;

        tracing::info!("Gateway listening on ws://{}", local_addr);

        let mut shutdown_rx = self.shutdown.subscribe();
        let runtime = Arc::clone(&self.runtime);
        let reap_interval = self.config.reap_interval;

        tokio::spawn(async move {
            let mut reap_timer = tokio::time::interval(reap_interval);
            reap_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = reap_timer.tick() => {
                        let reaped = runtime.registry().reap().await;
                        if !reaped.is_empty() {
                            tracing::info!("Reclaimed {} idle sessions", reaped.len());
                        }
                    }
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                let runtime = Arc::clone(&runtime);
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, addr, runtime).await {
                                        tracing::error!("Connection error from {}: {}", addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                }
            }
        });

        Ok(local_addr)
    }

    /// 停止网关并销毁所有会话
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.runtime.registry().shutdown().await;
    }

    pub async fn session_count(&self) -> usize {
        self.runtime.registry().len().await
    }
}

/// 找到或新建本连接的会话
async fn open_session(
    runtime: &StudioRuntime,
    params: &ConnectParams,
) -> Result<SessionSnapshot, BoltError> {
    if let Some(id) = &params.session {
        let session = runtime.registry().get(id).await?;
        runtime.registry().touch(id).await?;
        return Ok(session);
    }
    runtime.create_session(params.model.as_deref()).await
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    runtime: Arc<StudioRuntime>,
) -> Result<(), String> {
    let mut query: Option<String> = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        query = req.uri().query().map(str::to_string);
        Ok::<Response, ErrorResponse>(resp)
    })
    .await
    .map_err(|e| format!("WebSocket handshake failed: {}", e))?;

    let params = ConnectParams::from_query(query.as_deref());
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (events, mut events_rx) = mpsc::unbounded_channel::<StudioEvent>();

    let writer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            if ws_tx.send(WsMessage::Text(encode_event(&event))).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let session = match open_session(&runtime, &params).await {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!("Session open failed for {}: {}", addr, e);
            events.send(StudioEvent::error(&e)).ok();
            drop(events);
            let _ = writer.await;
            return Ok(());
        }
    };
    let session_id = session.id.clone();
    tracing::info!(session_id = %session_id, "New WebSocket connection from {}", addr);
    events.send(StudioEvent::Session { session }).ok();

    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("WebSocket receive error: {}", e);
                break;
            }
        };

        match msg {
            WsMessage::Text(text) => {
                let request = match decode_request(&text) {
                    Ok(r) => r,
                    Err(e) => {
                        events.send(StudioEvent::error(&e)).ok();
                        continue;
                    }
                };

                if request == ClientRequest::Delete {
                    let _ = runtime.handle(&session_id, request, &events).await;
                    break;
                }

                // 生成在后台进行；同一会话的多轮由注册表串行化
                let runtime = Arc::clone(&runtime);
                let events = events.clone();
                let sid = session_id.clone();
                tokio::spawn(async move {
                    let _ = runtime.handle(&sid, request, &events).await;
                });
            }

            WsMessage::Close(_) => break,

            _ => {}
        }
    }

    // 通道关闭：停止转发本轮剩余 token，已派发到沙箱的执行不受影响
    let _ = runtime.registry().cancel(&session_id).await;
    writer.abort();
    tracing::info!(session_id = %session_id, "WebSocket connection closed: {}", addr);
    Ok(())
}
