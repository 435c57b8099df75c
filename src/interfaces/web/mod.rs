mod handlers;
mod router;

pub use router::build_webhook_router;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::dispatcher::Dispatcher;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::state::StateStore;
use crate::core::supervisor::Supervisor;

/// Largest request body the listener accepts.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) started_at: DateTime<Utc>,
}

impl AppState {
    pub(crate) fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            started_at: Utc::now(),
        }
    }

    pub(crate) fn supervisor(&self) -> &Arc<Supervisor> {
        self.dispatcher.supervisor()
    }

    pub(crate) fn store(&self) -> &Arc<StateStore> {
        self.dispatcher.supervisor().store()
    }
}

pub struct WebhookListener {
    dispatcher: Arc<Dispatcher>,
    host: String,
    port: u16,
    shutdown: CancellationToken,
}

impl WebhookListener {
    pub fn new(dispatcher: Arc<Dispatcher>, host: String, port: u16) -> Self {
        Self {
            dispatcher,
            host,
            port,
            shutdown: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl LifecycleComponent for WebhookListener {
    async fn on_init(&mut self) -> Result<()> {
        info!("Webhook listener initializing...");
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        // a taken port fails the boot
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = build_webhook_router(AppState::new(self.dispatcher.clone()));
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            info!("Webhook listener running at http://{addr}");
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = serve.await {
                tracing::error!("Webhook listener crashed: {}", e);
            }
        });
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("Webhook listener shutting down...");
        self.shutdown.cancel();
        Ok(())
    }
}
