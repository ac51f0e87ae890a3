//! Channel manager: binds producer and consumer slots of a channel.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, Weak};

use async_trait::async_trait;
use conduit_core::{Result, SlotInstance};

use crate::lock;

/// Tracing target for channel bindings.
pub const TRACING_TARGET: &str = "conduit_slots::channel";

/// Starts the transfer from an output slot into an input slot.
#[async_trait]
pub trait SlotConnector: Send + Sync {
    /// Connects input slot `from` to the producer slot `to`.
    async fn connect(&self, from: &SlotInstance, to: &SlotInstance) -> Result<()>;
}

/// Owner of channels; wires inputs to the output once both ends are bound.
#[async_trait]
pub trait ChannelManager: Send + Sync {
    /// Creates a channel. Creating an existing channel is a no-op.
    async fn create(&self, channel_id: &str) -> Result<()>;

    /// Destroys a channel and forgets its bindings.
    async fn destroy(&self, channel_id: &str) -> Result<()>;

    /// Binds a slot to its channel, `slot.channel_id`.
    async fn bind(&self, slot: &SlotInstance) -> Result<()>;

    /// Removes a slot binding.
    async fn unbind(&self, slot: &SlotInstance) -> Result<()>;

    /// Provides the connector used once both ends of a channel are bound.
    fn attach_connector(&self, _connector: Weak<dyn SlotConnector>) {}
}

/// Channel manager that ignores bindings.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopChannelManager;

#[async_trait]
impl ChannelManager for NoopChannelManager {
    async fn create(&self, _channel_id: &str) -> Result<()> {
        Ok(())
    }

    async fn destroy(&self, _channel_id: &str) -> Result<()> {
        Ok(())
    }

    async fn bind(&self, _slot: &SlotInstance) -> Result<()> {
        Ok(())
    }

    async fn unbind(&self, _slot: &SlotInstance) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct LocalChannel {
    output: Option<SlotInstance>,
    inputs: Vec<SlotInstance>,
}

fn same_slot(a: &SlotInstance, b: &SlotInstance) -> bool {
    a.task_id == b.task_id && a.spec.name == b.spec.name
}

/// In-process channel manager.
///
/// Each channel has at most one output. Every input bound to a channel is
/// connected to the output as soon as both are bound, whichever comes first.
#[derive(Default)]
pub struct LocalChannelManager {
    channels: Mutex<HashMap<String, LocalChannel>>,
    connector: OnceLock<Weak<dyn SlotConnector>>,
}

impl LocalChannelManager {
    /// Creates an empty channel manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of known channels.
    pub fn len(&self) -> usize {
        lock(&self.channels).len()
    }

    /// Returns `true` if no channel is known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn connect_all(&self, pairs: Vec<(SlotInstance, SlotInstance)>) {
        if pairs.is_empty() {
            return;
        }

        let Some(connector) = self.connector.get().and_then(Weak::upgrade) else {
            tracing::warn!(
                target: TRACING_TARGET,
                pending = pairs.len(),
                "No slot connector attached, bindings stay pending"
            );
            return;
        };

        for (input, output) in pairs {
            if let Err(error) = connector.connect(&input, &output).await {
                tracing::error!(
                    target: TRACING_TARGET,
                    channel_id = %input.channel_id,
                    input = %input.uri,
                    output = %output.uri,
                    error = %error,
                    "Cannot connect channel ends"
                );
            }
        }
    }
}

#[async_trait]
impl ChannelManager for LocalChannelManager {
    async fn create(&self, channel_id: &str) -> Result<()> {
        lock(&self.channels)
            .entry(channel_id.to_string())
            .or_default();
        Ok(())
    }

    async fn destroy(&self, channel_id: &str) -> Result<()> {
        if lock(&self.channels).remove(channel_id).is_some() {
            tracing::debug!(target: TRACING_TARGET, channel_id = %channel_id, "Channel destroyed");
        }
        Ok(())
    }

    async fn bind(&self, slot: &SlotInstance) -> Result<()> {
        let pairs: Vec<(SlotInstance, SlotInstance)> = {
            let mut channels = lock(&self.channels);
            let channel = channels.entry(slot.channel_id.clone()).or_default();

            if slot.spec.is_output() {
                if let Some(existing) = &channel.output {
                    if !same_slot(existing, slot) {
                        return Err(conduit_core::Error::already_exists(format!(
                            "channel '{}' already has output {}",
                            slot.channel_id, existing.uri
                        )));
                    }
                }
                channel.output = Some(slot.clone());
                channel
                    .inputs
                    .iter()
                    .map(|input| (input.clone(), slot.clone()))
                    .collect()
            } else {
                if !channel.inputs.iter().any(|i| same_slot(i, slot)) {
                    channel.inputs.push(slot.clone());
                }
                match &channel.output {
                    Some(output) => vec![(slot.clone(), output.clone())],
                    None => vec![],
                }
            }
        };

        tracing::debug!(
            target: TRACING_TARGET,
            channel_id = %slot.channel_id,
            slot = %slot.uri,
            direction = %slot.spec.direction,
            "Slot bound"
        );

        self.connect_all(pairs).await;
        Ok(())
    }

    async fn unbind(&self, slot: &SlotInstance) -> Result<()> {
        let mut channels = lock(&self.channels);
        if let Some(channel) = channels.get_mut(&slot.channel_id) {
            if channel.output.as_ref().is_some_and(|o| same_slot(o, slot)) {
                channel.output = None;
            }
            channel.inputs.retain(|i| !same_slot(i, slot));
        }

        tracing::debug!(
            target: TRACING_TARGET,
            channel_id = %slot.channel_id,
            slot = %slot.uri,
            "Slot unbound"
        );
        Ok(())
    }

    fn attach_connector(&self, connector: Weak<dyn SlotConnector>) {
        let _ = self.connector.set(connector);
    }
}

impl std::fmt::Debug for LocalChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalChannelManager")
            .field("channels", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use conduit_core::{SlotDirection, SlotMedia, SlotSpec, SlotUri};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        connected: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl SlotConnector for Recorder {
        async fn connect(&self, from: &SlotInstance, to: &SlotInstance) -> Result<()> {
            lock(&self.connected).push((from.spec.name.clone(), to.spec.name.clone()));
            Ok(())
        }
    }

    fn instance(task: &str, name: &str, direction: SlotDirection) -> SlotInstance {
        let uri = SlotUri::parse(&format!("fs://127.0.0.1:9000/{task}{name}"))
            .unwrap_or_else(|e| panic!("{e}"));
        SlotInstance {
            spec: SlotSpec::new(name, SlotMedia::File, direction),
            task_id: task.to_string(),
            channel_id: "c1".to_string(),
            uri,
        }
    }

    #[tokio::test]
    async fn connects_once_both_ends_are_bound() -> Result<()> {
        let recorder = Arc::new(Recorder::default());
        let manager = LocalChannelManager::new();
        let connector: Arc<dyn SlotConnector> = recorder.clone();
        manager.attach_connector(Arc::downgrade(&connector));

        manager.bind(&instance("t2", "/a", SlotDirection::Input)).await?;
        assert!(lock(&recorder.connected).is_empty());

        manager.bind(&instance("t1", "/out", SlotDirection::Output)).await?;
        manager.bind(&instance("t3", "/b", SlotDirection::Input)).await?;

        let connected = lock(&recorder.connected).clone();
        assert_eq!(
            connected,
            vec![
                ("/a".to_string(), "/out".to_string()),
                ("/b".to_string(), "/out".to_string()),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn second_output_is_rejected() -> Result<()> {
        let manager = LocalChannelManager::new();
        manager.bind(&instance("t1", "/out", SlotDirection::Output)).await?;
        let result = manager.bind(&instance("t9", "/other", SlotDirection::Output)).await;
        assert!(result.is_err());

        manager.unbind(&instance("t1", "/out", SlotDirection::Output)).await?;
        manager.bind(&instance("t9", "/other", SlotDirection::Output)).await?;
        manager.destroy("c1").await?;
        assert!(manager.is_empty());
        Ok(())
    }
}
