//! Reqwest-based HTTP client for conduit peers.

use std::sync::Arc;

use conduit_core::{RELAY_SCHEME, SlotUri};
use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use url::Url;

use super::ReqwestConfig;
use super::peers::{PeerCache, PeerLease};
use crate::error::{Error, Result};

/// Tracing target for reqwest client operations.
pub const TRACING_TARGET: &str = "conduit_reqwest::client";

/// Header carrying the idempotency key of long-running requests.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Inner client that holds the shared HTTP client and the peer cache.
struct ReqwestClientInner {
    http: Client,
    peers: PeerCache,
    config: ReqwestConfig,
}

/// Reqwest-based HTTP client shared by every conduit HTTP integration.
///
/// Calls to other data-plane nodes go through a reference-counted cache of
/// peer connections; calls to fixed collaborators (channel manager,
/// allocator) use one shared client.
#[derive(Clone)]
pub struct ReqwestClient {
    inner: Arc<ReqwestClientInner>,
}

impl std::fmt::Debug for ReqwestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestClient")
            .field("config", &self.inner.config)
            .field("peers", &self.inner.peers)
            .finish_non_exhaustive()
    }
}

impl ReqwestClient {
    /// Creates a new reqwest client with the given configuration.
    pub fn new(config: ReqwestConfig) -> Result<Self> {
        tracing::debug!(
            target: TRACING_TARGET,
            timeout_ms = config.timeout().as_millis(),
            stripes = config.stripes,
            "Creating reqwest client"
        );

        let http = Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.connect_timeout())
            .user_agent(config.user_agent())
            .build()?;

        let inner = ReqwestClientInner {
            http,
            peers: PeerCache::new(config.clone()),
            config,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Gets the client configuration.
    pub fn config(&self) -> &ReqwestConfig {
        &self.inner.config
    }

    /// Gets the peer connection cache.
    pub fn peers(&self) -> &PeerCache {
        &self.inner.peers
    }

    /// Gets the shared HTTP client.
    pub(crate) fn http(&self) -> &Client {
        &self.inner.http
    }

    /// POSTs `body` as JSON with the shared client and decodes the JSON answer.
    pub(crate) async fn post_json<B, T>(&self, url: Url, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = send(self.http().post(url).json(body)).await?;
        Ok(response.json().await?)
    }
}

/// Address of a data-plane node, or of a terminal behind a relay session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    authority: String,
    base: Url,
}

impl PeerEndpoint {
    /// Creates an endpoint for a node reachable at `base`.
    pub fn new(base: Url) -> Result<Self> {
        let authority = authority_of(&base)?;
        Ok(Self { authority, base })
    }

    /// Returns the endpoint serving the slot at `uri`.
    ///
    /// `fs` URIs are served over plain HTTP; relay URIs are served by the
    /// relay under their session.
    pub fn for_slot(uri: &SlotUri) -> Result<Self> {
        let authority = uri.authority();
        if authority.is_empty() {
            return Err(Error::Endpoint(format!("slot uri '{uri}' has no authority")));
        }

        let base = match uri.scheme() {
            RELAY_SCHEME => {
                let session = uri.session_id().ok_or_else(|| {
                    Error::Endpoint(format!("relay uri '{uri}' carries no session"))
                })?;
                format!("http://{authority}/relay/sessions/{session}")
            }
            "https" => format!("https://{authority}"),
            _ => format!("http://{authority}"),
        };

        let base = Url::parse(&base).map_err(|e| Error::Endpoint(e.to_string()))?;
        Ok(Self { authority, base })
    }

    /// Returns the `host:port` the endpoint is reached at.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Returns the URL of `path` below this endpoint.
    pub fn url(&self, path: &str) -> Result<Url> {
        let joined = format!(
            "{}/{}",
            self.base.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(&joined).map_err(|e| Error::Endpoint(format!("invalid url '{joined}': {e}")))
    }
}

fn authority_of(url: &Url) -> Result<String> {
    match (url.host_str(), url.port_or_known_default()) {
        (Some(host), Some(port)) => Ok(format!("{host}:{port}")),
        (Some(host), None) => Ok(host.to_string()),
        _ => Err(Error::Endpoint(format!("'{url}' has no host"))),
    }
}

/// Sends `request` and turns error statuses into [`Error::Status`].
pub(crate) async fn send(request: RequestBuilder) -> Result<Response> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|value| value.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.chars().take(512).collect());

    Err(Error::Status { status, message })
}

/// Sends `request` over `lease`'s connection.
pub(crate) async fn send_leased(
    lease: &PeerLease,
    build: impl FnOnce(&Client) -> RequestBuilder,
) -> Result<Response> {
    send(build(lease.client())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_uris_map_to_endpoints() -> anyhow::Result<()> {
        let direct = PeerEndpoint::for_slot(&SlotUri::parse("fs://10.0.0.1:9000/t1/out")?)?;
        assert_eq!(direct.authority(), "10.0.0.1:9000");
        assert_eq!(direct.url("slots/open")?.as_str(), "http://10.0.0.1:9000/slots/open");

        let relayed = PeerEndpoint::for_slot(&SlotUri::parse(
            "relay://relay.local:8080/t1/out?session=abc",
        )?)?;
        assert_eq!(
            relayed.url("/slots/open")?.as_str(),
            "http://relay.local:8080/relay/sessions/abc/slots/open"
        );

        let sessionless = SlotUri::parse("relay://relay.local:8080/t1/out")?;
        assert!(PeerEndpoint::for_slot(&sessionless).is_err());
        Ok(())
    }
}
