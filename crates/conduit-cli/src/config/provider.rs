//! Wiring of a node from its configuration.

use std::sync::Arc;

use anyhow::Context;
use conduit_reqwest::{HttpAllocator, HttpChannelManager, ReqwestClient};
use conduit_server::service::ServiceState;
use conduit_slots::{
    AllocatorClient, ChannelManager, LocalChannelManager, NoopAllocator, SlotService,
    SnapshotStore,
};
use conduit_storage::{InMemorySnapshotRegistry, StorageBackend};

use super::Cli;

/// A node ready to serve: its application state and the allocator it reports to.
#[derive(Clone)]
pub struct Node {
    pub state: ServiceState,
    pub allocator: Arc<dyn AllocatorClient>,
}

/// Creates the slot service, collaborators and application state.
///
/// # Errors
///
/// Returns an error if the HTTP client, the storage backend or the slot
/// service cannot be created.
pub fn create_node(cli: &Cli) -> anyhow::Result<Node> {
    let client = ReqwestClient::new(cli.http.clone()).context("failed to create HTTP client")?;

    let channels: Arc<dyn ChannelManager> = match &cli.collaborators.channel_manager_url {
        Some(url) => Arc::new(HttpChannelManager::new(client.clone(), url.clone())),
        None => Arc::new(LocalChannelManager::new()),
    };

    let storage =
        StorageBackend::new(cli.storage.clone()).context("failed to create storage backend")?;
    let snapshots = SnapshotStore::new(storage.clone(), Arc::new(InMemorySnapshotRegistry::new()));

    let slots = SlotService::builder(cli.slots.clone())
        .with_channel_manager(channels)
        .with_storage(storage)
        .with_snapshots(snapshots)
        .with_transport(Arc::new(client.clone()))
        .with_remote_connector(Arc::new(client.clone()))
        .build()
        .context("failed to create slot service")?;

    let allocator: Arc<dyn AllocatorClient> = match &cli.collaborators.allocator_url {
        Some(url) => Arc::new(HttpAllocator::new(client, url.clone())),
        None => Arc::new(NoopAllocator),
    };

    Ok(Node {
        state: ServiceState::new(slots, cli.service.clone()),
        allocator,
    })
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[tokio::test]
    async fn default_node_runs_standalone() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let tmp_dir = dir.path().to_string_lossy().into_owned();
        let cli = Cli::try_parse_from(["conduit", "--slots-tmp-dir", tmp_dir.as_str()])?;

        let node = create_node(&cli)?;
        assert!(node.state.slots.registry().is_empty());
        assert!(node.state.slots.registry().snapshots().is_some());
        Ok(())
    }
}
