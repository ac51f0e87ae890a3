//! Channel manager reached over HTTP.

use async_trait::async_trait;
use conduit_core::SlotInstance;
use conduit_slots::ChannelManager;
use url::Url;

use crate::connect::{ReqwestClient, TRACING_TARGET, send};
use crate::error::{Error, Result};

/// [`ChannelManager`] backed by a remote channel service.
///
/// The remote service connects inputs to outputs itself, through the slot
/// API of the nodes owning the input slots.
#[derive(Debug, Clone)]
pub struct HttpChannelManager {
    client: ReqwestClient,
    base: Url,
}

impl HttpChannelManager {
    /// Creates a channel manager for the service at `base`.
    pub fn new(client: ReqwestClient, base: Url) -> Self {
        Self { client, base }
    }

    fn channel_url(&self, channel_id: &str, action: Option<&str>) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| Error::Endpoint(format!("'{}' cannot be a base", self.base)))?;
            segments.pop_if_empty().push("channels").push(channel_id);
            if let Some(action) = action {
                segments.push(action);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl ChannelManager for HttpChannelManager {
    async fn create(&self, channel_id: &str) -> conduit_core::Result<()> {
        let url = self.channel_url(channel_id, None)?;
        send(self.client.http().post(url)).await?;
        tracing::debug!(target: TRACING_TARGET, channel = %channel_id, "Channel created");
        Ok(())
    }

    async fn destroy(&self, channel_id: &str) -> conduit_core::Result<()> {
        let url = self.channel_url(channel_id, None)?;
        send(self.client.http().delete(url)).await?;
        tracing::debug!(target: TRACING_TARGET, channel = %channel_id, "Channel destroyed");
        Ok(())
    }

    async fn bind(&self, slot: &SlotInstance) -> conduit_core::Result<()> {
        let url = self.channel_url(&slot.channel_id, Some("bind"))?;
        send(self.client.http().post(url).json(slot)).await?;
        tracing::debug!(
            target: TRACING_TARGET,
            channel = %slot.channel_id,
            slot = %slot.uri,
            "Slot bound to remote channel"
        );
        Ok(())
    }

    async fn unbind(&self, slot: &SlotInstance) -> conduit_core::Result<()> {
        let url = self.channel_url(&slot.channel_id, Some("unbind"))?;
        send(self.client.http().post(url).json(slot)).await?;
        tracing::debug!(
            target: TRACING_TARGET,
            channel = %slot.channel_id,
            slot = %slot.uri,
            "Slot unbound from remote channel"
        );
        Ok(())
    }
}
