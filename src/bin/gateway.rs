//! Bolt Gateway - 流式模式服务器
//!
//! 每个会话一条 WebSocket 双工通道：网页构建、实时预览、空闲回收。
//!
//! 运行方式：
//! ```bash
//! cargo run --bin bolt-gateway
//! ```
//! 连接：`ws://127.0.0.1:8080/?model=<model>`，重连已有会话用 `?session=<id>`。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bolt::config::load_config;
use bolt::gateway::{Hub, HubConfig};
use bolt::llm::OpenAiClient;
use bolt::sandbox::create_service;
use bolt::studio::StudioRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bolt::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let mut cfg = load_config(config_path).context("Failed to load config")?;
    if let Ok(bind) = std::env::var("GATEWAY_BIND") {
        cfg.gateway.bind_addr = bind;
    }

    let llm = Arc::new(OpenAiClient::from_config(&cfg.llm));
    let service = create_service(&cfg.sandbox).context("Failed to create sandbox service")?;
    tracing::info!(model = %cfg.llm.model, "model client ready");

    let runtime = Arc::new(StudioRuntime::from_config(&cfg, llm, service));
    let hub = Hub::new(HubConfig::from(&cfg), runtime);

    let addr = hub
        .start()
        .await
        .map_err(anyhow::Error::msg)
        .context("Failed to start gateway")?;
    tracing::info!("Bolt gateway on ws://{}", addr);
    tracing::info!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down, destroying {} sessions...", hub.session_count().await);
    hub.stop().await;

    Ok(())
}
