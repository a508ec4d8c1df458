use std::sync::Arc;
use std::time::Instant;

use serde_json::Value as JsonValue;
use tracing::info;
use uuid::Uuid;

use crate::pool::ProviderPool;
use crate::upstream_client::{UpstreamBody, UpstreamHttpResponse};

/// Entry point for authenticated gateway traffic: binds one request to the
/// pool, lets the rotation pick an account, and hands the response (JSON or
/// SSE passthrough) back to the listener.
pub struct Dispatcher {
    pool: Arc<ProviderPool>,
}

impl Dispatcher {
    pub fn new(pool: Arc<ProviderPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<ProviderPool> {
        &self.pool
    }

    pub async fn handle_chat(&self, payload: &JsonValue) -> UpstreamHttpResponse {
        let trace_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let model = payload.get("model").and_then(JsonValue::as_str);
        info!(
            event = "chat_received",
            trace_id = %trace_id,
            model = ?model,
        );

        let response = self.pool.dispatch_chat(payload).await;
        info!(
            event = "chat_responded",
            trace_id = %trace_id,
            status = response.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            is_stream = matches!(response.body, UpstreamBody::Stream(_)),
        );
        response
    }

    pub async fn handle_search(&self, query: &str) -> UpstreamHttpResponse {
        let trace_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        info!(event = "search_received", trace_id = %trace_id);

        let response = self.pool.dispatch_search(query).await;
        info!(
            event = "search_responded",
            trace_id = %trace_id,
            status = response.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
        );
        response
    }
}
