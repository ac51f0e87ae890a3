//! Allocator reached over HTTP.

use std::collections::HashMap;

use async_trait::async_trait;
use conduit_slots::AllocatorClient;
use serde::Serialize;
use url::Url;

use crate::connect::{ReqwestClient, TRACING_TARGET, send};
use crate::error::{Error, Result};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Register<'a> {
    vm_id: &'a str,
    metadata: &'a HashMap<String, String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Heartbeat<'a> {
    vm_id: &'a str,
}

/// [`AllocatorClient`] for an allocator exposing `register` and `heartbeat`.
#[derive(Debug, Clone)]
pub struct HttpAllocator {
    client: ReqwestClient,
    base: Url,
}

impl HttpAllocator {
    /// Creates an allocator client for the allocator at `base`.
    pub fn new(client: ReqwestClient, base: Url) -> Self {
        Self { client, base }
    }

    fn url(&self, action: &str) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Endpoint(format!("'{}' cannot be a base", self.base)))?
            .pop_if_empty()
            .push(action);
        Ok(url)
    }
}

#[async_trait]
impl AllocatorClient for HttpAllocator {
    async fn register(
        &self,
        vm_id: &str,
        metadata: &HashMap<String, String>,
    ) -> conduit_core::Result<()> {
        let body = Register { vm_id, metadata };
        send(self.client.http().post(self.url("register")?).json(&body)).await?;
        tracing::info!(target: TRACING_TARGET, vm_id = %vm_id, "Registered with allocator");
        Ok(())
    }

    async fn heartbeat(&self, vm_id: &str) -> conduit_core::Result<()> {
        let body = Heartbeat { vm_id };
        send(self.client.http().post(self.url("heartbeat")?).json(&body)).await?;
        tracing::trace!(target: TRACING_TARGET, vm_id = %vm_id, "Heartbeat sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::Value;

    use super::*;
    use crate::ReqwestConfig;

    type Bodies = Arc<Mutex<Vec<Value>>>;

    async fn record(State(bodies): State<Bodies>, Json(body): Json<Value>) {
        bodies.lock().unwrap().push(body);
    }

    #[tokio::test]
    async fn registers_then_heartbeats() -> anyhow::Result<()> {
        let bodies = Bodies::default();
        let router = Router::new()
            .route("/register", post(record))
            .route("/heartbeat", post(record))
            .with_state(bodies.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        tokio::spawn(async move { axum::serve(listener, router).await });

        let client = ReqwestClient::new(ReqwestConfig::default())?;
        let allocator = HttpAllocator::new(client, Url::parse(&format!("http://{address}"))?);

        let metadata = HashMap::from([("slotApi".to_string(), "10.0.0.1:9000".to_string())]);
        allocator.register("vm-1", &metadata).await?;
        allocator.heartbeat("vm-1").await?;

        let bodies = bodies.lock().unwrap().clone();
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[0]["vmId"], "vm-1");
        assert_eq!(bodies[0]["metadata"]["slotApi"], "10.0.0.1:9000");
        assert_eq!(bodies[1], serde_json::json!({ "vmId": "vm-1" }));
        Ok(())
    }
}
