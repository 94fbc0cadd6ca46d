//! Shared application state injected into Axum handlers.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::config::AppConfig;
use crate::services::model_manager::{ModelEvent, ModelManager};
use crate::services::registry::ModelRegistry;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    config: AppConfig,
    model_manager: ModelManager,
    event_tx: broadcast::Sender<String>,
    started_at: Instant,
}

impl AppState {
    /// Build the state and start relaying manager lifecycle events to
    /// WebSocket subscribers. Must be called inside a Tokio runtime.
    pub fn new(config: AppConfig, model_manager: ModelManager) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        tokio::spawn(relay_model_events(
            model_manager.subscribe(),
            event_tx.clone(),
        ));
        Self {
            inner: Arc::new(Inner {
                config,
                model_manager,
                event_tx,
                started_at: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn model_manager(&self) -> &ModelManager {
        &self.inner.model_manager
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        self.inner.model_manager.registry()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.inner.started_at.elapsed().as_secs()
    }

    /// Broadcast an event to all connected WebSocket clients.
    pub fn broadcast_event(&self, event_type: &str, data: serde_json::Value) {
        publish(&self.inner.event_tx, event_type, data);
    }

    /// Subscribe to the event broadcast channel.
    pub fn subscribe_events(&self) -> broadcast::Receiver<String> {
        self.inner.event_tx.subscribe()
    }
}

fn publish(tx: &broadcast::Sender<String>, event_type: &str, data: serde_json::Value) {
    let event = serde_json::json!({
        "type": event_type,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "data": data,
    });
    // Ignore send errors (no subscribers)
    let _ = tx.send(event.to_string());
}

async fn relay_model_events(
    mut rx: broadcast::Receiver<ModelEvent>,
    tx: broadcast::Sender<String>,
) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let data = serde_json::to_value(&event).unwrap_or_default();
                publish(&tx, event.kind.as_str(), data);
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event relay lagged; some model events were dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
