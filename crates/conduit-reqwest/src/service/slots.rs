//! Client of a peer's slot API.

use async_trait::async_trait;
use conduit_core::{
    ChunkStream, ConnectSlotRequest, CreateSlotRequest, Operation, SlotInstance, SlotRef,
    SlotStatus, SlotStatusList, SlotUri,
};
use conduit_slots::{SlotConnector, SlotTransport};
use reqwest::Method;
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::connect::{
    IDEMPOTENCY_KEY_HEADER, PeerEndpoint, ReqwestClient, TRACING_TARGET, send_leased,
};
use crate::error::Result;

/// Slot API of one data-plane node, or of a terminal behind a relay.
#[derive(Debug, Clone)]
pub struct SlotsClient {
    client: ReqwestClient,
    endpoint: PeerEndpoint,
}

impl SlotsClient {
    /// Creates a client for the node at `endpoint`.
    pub fn new(client: ReqwestClient, endpoint: PeerEndpoint) -> Self {
        Self { client, endpoint }
    }

    /// Creates a client for the node serving the slot at `uri`.
    pub fn for_slot(client: ReqwestClient, uri: &SlotUri) -> Result<Self> {
        Ok(Self::new(client, PeerEndpoint::for_slot(uri)?))
    }

    /// Returns the endpoint this client talks to.
    pub fn endpoint(&self) -> &PeerEndpoint {
        &self.endpoint
    }

    /// Creates a slot on the peer.
    pub async fn create(&self, request: &CreateSlotRequest) -> Result<SlotStatus> {
        self.call(Method::POST, "slots/create", Some(request), None).await
    }

    /// Starts connecting a peer input slot to a producer.
    pub async fn connect(
        &self,
        request: &ConnectSlotRequest,
        idempotency_key: Option<&str>,
    ) -> Result<Operation> {
        self.call(Method::POST, "slots/connect", Some(request), idempotency_key)
            .await
    }

    /// Suspends a peer slot.
    pub async fn disconnect(&self, slot: &SlotRef) -> Result<SlotStatus> {
        self.call(Method::POST, "slots/disconnect", Some(slot), None).await
    }

    /// Returns the status of a peer slot.
    pub async fn status(&self, slot: &SlotRef) -> Result<SlotStatus> {
        self.call(Method::POST, "slots/status", Some(slot), None).await
    }

    /// Starts destroying a peer slot.
    pub async fn destroy(
        &self,
        slot: &SlotRef,
        idempotency_key: Option<&str>,
    ) -> Result<Operation> {
        self.call(Method::POST, "slots/destroy", Some(slot), idempotency_key)
            .await
    }

    /// Lists the slots of the peer.
    pub async fn list(&self) -> Result<SlotStatusList> {
        self.call::<(), _>(Method::GET, "slots", None, None).await
    }

    /// Returns a long-running operation of the peer.
    pub async fn operation(&self, id: Uuid) -> Result<Operation> {
        let path = format!("operations/{id}");
        self.call::<(), _>(Method::GET, &path, None, None).await
    }

    /// Streams the bytes of a peer output slot from `offset`.
    pub async fn open(&self, uri: &SlotUri, offset: u64) -> conduit_core::Result<ChunkStream> {
        self.client.open_output(uri, offset).await
    }

    async fn call<B, T>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        idempotency_key: Option<&str>,
    ) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.endpoint.url(path)?;
        let lease = self.client.peers().acquire(self.endpoint.authority())?;
        let timeout = self.client.config().timeout();

        let response = send_leased(&lease, |client| {
            let mut request = client.request(method, url).timeout(timeout);
            if let Some(body) = body {
                request = request.json(body);
            }
            if let Some(key) = idempotency_key {
                request = request.header(IDEMPOTENCY_KEY_HEADER, key);
            }
            request
        })
        .await?;

        Ok(response.json().await?)
    }
}

/// Starts transfers into input slots hosted by other nodes.
#[async_trait]
impl SlotConnector for ReqwestClient {
    async fn connect(&self, from: &SlotInstance, to: &SlotInstance) -> conduit_core::Result<()> {
        let peer = SlotsClient::for_slot(self.clone(), &from.uri)?;
        let request = ConnectSlotRequest {
            from: SlotRef::from(from),
            to: to.clone(),
            offset: 0,
        };

        let operation = peer.connect(&request, None).await?;
        tracing::debug!(
            target: TRACING_TARGET,
            input = %from.uri,
            output = %to.uri,
            operation = %operation.id,
            "Remote connect started"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::{Json, Router};
    use conduit_core::{SlotDirection, SlotMedia, SlotState};

    use super::*;
    use crate::ReqwestConfig;

    #[derive(Clone, Default)]
    struct Seen {
        keys: Arc<Mutex<Vec<String>>>,
    }

    async fn destroy(
        State(seen): State<Seen>,
        headers: HeaderMap,
        Json(slot): Json<SlotRef>,
    ) -> Json<Operation> {
        if let Some(key) = headers.get(IDEMPOTENCY_KEY_HEADER).and_then(|v| v.to_str().ok()) {
            seen.keys.lock().unwrap().push(key.to_string());
        }
        let operation = Operation::new(format!("destroy {}", slot.slot_name), None);
        Json(operation)
    }

    async fn status(Json(slot): Json<SlotRef>) -> Json<SlotStatus> {
        Json(SlotStatus {
            task_id: slot.task_id,
            name: slot.slot_name,
            direction: SlotDirection::Output,
            media: SlotMedia::Pipe,
            state: SlotState::Open,
            channel_id: String::new(),
            peer_uri: None,
            bytes: 6,
            error: None,
        })
    }

    #[tokio::test]
    async fn calls_carry_idempotency_keys() -> anyhow::Result<()> {
        let seen = Seen::default();
        let router = Router::new()
            .route("/slots/destroy", post(destroy))
            .route("/slots/status", post(status))
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        tokio::spawn(async move { axum::serve(listener, router).await });

        let client = ReqwestClient::new(ReqwestConfig::default())?;
        let endpoint = PeerEndpoint::new(url::Url::parse(&format!("http://{address}"))?)?;
        let peer = SlotsClient::new(client.clone(), endpoint);

        let slot = SlotRef::new("t1", "/out");
        let status = peer.status(&slot).await?;
        assert_eq!(status.state, SlotState::Open);
        assert_eq!(status.bytes, 6);

        let operation = peer.destroy(&slot, Some("destroy-1")).await?;
        assert!(!operation.done);
        assert_eq!(*seen.keys.lock().unwrap(), vec!["destroy-1".to_string()]);
        assert!(client.peers().is_empty());
        Ok(())
    }
}
