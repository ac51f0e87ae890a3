//! Data-plane operations over the slot registry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_core::{
    ChunkStream, ConnectSlotRequest, CreateSlotRequest, Error, OpenOutputSlotRequest, Operation,
    Result, SlotInstance, SlotProgress, SlotRef, SlotStatus, SlotStatusList,
};
use conduit_storage::StorageBackend;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::channel::{ChannelManager, NoopChannelManager, SlotConnector};
use crate::config::SlotsConfig;
use crate::operations::OperationService;
use crate::pool::WorkerPool;
use crate::registry::SlotRegistry;
use crate::resolver::{SlotResolver, SlotTransport};
use crate::slot::Slot;
use crate::snapshooter::SnapshotStore;

/// Tracing target for data-plane calls.
pub const TRACING_TARGET: &str = "conduit_slots::service";

/// The data-plane surface of one node: create, connect, disconnect, status,
/// destroy and open slots.
pub struct SlotService {
    registry: SlotRegistry,
    resolver: SlotResolver,
    operations: OperationService,
    pool: WorkerPool,
    remote: Option<Arc<dyn SlotConnector>>,
}

/// Builder for [`SlotService`].
#[must_use = "builders do nothing unless built"]
pub struct SlotServiceBuilder {
    config: SlotsConfig,
    channels: Arc<dyn ChannelManager>,
    snapshots: Option<SnapshotStore>,
    storage: Option<StorageBackend>,
    transport: Option<Arc<dyn SlotTransport>>,
    remote: Option<Arc<dyn SlotConnector>>,
}

impl SlotServiceBuilder {
    /// Binds slots through `channels`.
    pub fn with_channel_manager(mut self, channels: Arc<dyn ChannelManager>) -> Self {
        self.channels = channels;
        self
    }

    /// Enables snapshot slots, snapshot channels and snapshot downloads.
    pub fn with_snapshots(mut self, store: SnapshotStore) -> Self {
        self.snapshots = Some(store);
        self
    }

    /// Resolves storage URIs against `storage`.
    pub fn with_storage(mut self, storage: StorageBackend) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Opens remote output slots through `transport`.
    pub fn with_transport(mut self, transport: Arc<dyn SlotTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Asks other nodes to connect their input slots through `remote`.
    pub fn with_remote_connector(mut self, remote: Arc<dyn SlotConnector>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Builds the service and attaches it to the channel manager as its connector.
    pub fn build(self) -> Result<Arc<SlotService>> {
        let base = self.config.base_url()?;

        let mut registry = SlotRegistry::builder(base, &self.config.tmp_dir)
            .with_channel_manager(Arc::clone(&self.channels))
            .with_close_policy(self.config.close_wait(), self.config.close_rechecks);
        if let Some(store) = self.snapshots {
            registry = registry.with_snapshots(store);
        }
        let registry = registry.build();

        let mut resolver = SlotResolver::new(registry.clone());
        if let Some(storage) = self.storage {
            resolver = resolver.with_storage(storage);
        }
        if let Some(transport) = self.transport {
            resolver = resolver.with_transport(transport);
        }

        let service = Arc::new(SlotService {
            registry,
            resolver,
            operations: OperationService::new(),
            pool: WorkerPool::new(self.config.pool_size),
            remote: self.remote,
        });

        let connector: Arc<dyn SlotConnector> = service.clone();
        self.channels.attach_connector(Arc::downgrade(&connector));

        tracing::info!(
            target: TRACING_TARGET,
            base_uri = %service.registry.base(),
            pool_size = service.pool.size(),
            "Slot service ready"
        );

        Ok(service)
    }
}

impl SlotService {
    /// Starts building a service.
    pub fn builder(config: SlotsConfig) -> SlotServiceBuilder {
        SlotServiceBuilder {
            config,
            channels: Arc::new(NoopChannelManager),
            snapshots: None,
            storage: None,
            transport: None,
            remote: None,
        }
    }

    /// Returns the slot registry.
    pub fn registry(&self) -> &SlotRegistry {
        &self.registry
    }

    /// Returns the URI resolver.
    pub fn resolver(&self) -> &SlotResolver {
        &self.resolver
    }

    /// Returns the operation registry.
    pub fn operations(&self) -> &OperationService {
        &self.operations
    }

    /// Creates a slot and returns its status.
    pub async fn create_slot(&self, request: CreateSlotRequest) -> Result<SlotStatus> {
        tracing::debug!(
            target: TRACING_TARGET,
            task_id = %request.task_id,
            slot = %request.slot.name,
            channel_id = %request.channel_id,
            "Creating slot"
        );

        let slot = self
            .registry
            .create(&request.task_id, request.slot, &request.channel_id)
            .await?;
        Ok(slot.status())
    }

    /// Connects a local input slot to a producer slot as a long-running operation.
    ///
    /// The operation result carries the slot status once the transfer ended.
    pub fn connect_slot(
        &self,
        request: ConnectSlotRequest,
        idempotency_key: Option<String>,
    ) -> Result<Operation> {
        if let Some(existing) = self.existing(idempotency_key.as_deref()) {
            return Ok(existing);
        }

        let slot = self.slot(&request.from)?;
        if !slot.spec().is_input() {
            return Err(Error::invalid_state(format!(
                "slot '{}' of task '{}' is not an input",
                slot.name(),
                slot.task_id()
            )));
        }

        let source = request.to.uri;
        let offset = request.offset;
        let chunks = self.resolver.resolve(&source, offset);

        tracing::info!(
            target: TRACING_TARGET,
            task_id = %slot.task_id(),
            slot = %slot.name(),
            source = %source,
            offset = offset,
            "Connecting slot"
        );

        let description = format!("connect {} to {}", slot.uri(), source);
        Ok(self
            .operations
            .spawn(&self.pool, description, idempotency_key, async move {
                slot.connect(source, chunks).await?;
                Ok(serde_json::to_value(slot.status())?)
            }))
    }

    /// Detaches a slot from its peer and returns its status.
    pub async fn disconnect_slot(&self, slot_ref: &SlotRef) -> Result<SlotStatus> {
        let slot = self.slot(slot_ref)?;
        slot.suspend().await?;

        tracing::info!(
            target: TRACING_TARGET,
            task_id = %slot.task_id(),
            slot = %slot.name(),
            "Slot disconnected"
        );
        Ok(slot.status())
    }

    /// Returns the status of a slot.
    pub fn status_slot(&self, slot_ref: &SlotRef) -> Result<SlotStatus> {
        Ok(self.slot(slot_ref)?.status())
    }

    /// Destroys a slot as a long-running operation.
    pub fn destroy_slot(
        &self,
        slot_ref: &SlotRef,
        idempotency_key: Option<String>,
    ) -> Result<Operation> {
        if let Some(existing) = self.existing(idempotency_key.as_deref()) {
            return Ok(existing);
        }

        let slot = self.slot(slot_ref)?;
        let description = format!("destroy {}", slot.uri());

        Ok(self
            .operations
            .spawn(&self.pool, description, idempotency_key, async move {
                slot.destroy().await?;
                Ok(serde_json::to_value(slot.status())?)
            }))
    }

    /// Streams an output slot from `offset`.
    ///
    /// Fails before any chunk is produced if the slot is missing or is not an output.
    pub fn open_output_slot(&self, request: &OpenOutputSlotRequest) -> Result<ChunkStream> {
        let slot = self
            .registry
            .find(&request.slot.task_id, &request.slot.slot_name)
            .filter(|slot| slot.spec().is_output())
            .ok_or_else(|| {
                Error::not_found(format!(
                    "output slot '{}' not found in task '{}'",
                    request.slot.slot_name, request.slot.task_id
                ))
            })?;

        tracing::debug!(
            target: TRACING_TARGET,
            task_id = %slot.task_id(),
            slot = %slot.name(),
            offset = request.offset,
            "Opening output slot"
        );
        Ok(slot.read_from(request.offset))
    }

    /// Lists the status of every slot.
    pub fn list(&self) -> SlotStatusList {
        SlotStatusList {
            slots: self.registry.all().iter().map(|slot| slot.status()).collect(),
        }
    }

    /// Returns an operation.
    pub fn operation(&self, id: Uuid) -> Result<Operation> {
        self.operations.get(id)
    }

    /// Waits up to `timeout` for an operation and returns its latest state.
    pub async fn await_operation(&self, id: Uuid, timeout: Duration) -> Result<Operation> {
        self.operations.await_completion(id, timeout).await
    }

    /// Creates a snapshot that snapshot slots and channels can refer to.
    pub async fn create_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let store = self.registry.snapshots().ok_or_else(|| {
            Error::invalid_input("snapshot storage is not configured on this node")
        })?;
        store.create_snapshot(snapshot_id).await?;

        tracing::info!(target: TRACING_TARGET, snapshot_id = %snapshot_id, "Snapshot created");
        Ok(())
    }

    /// Returns a receiver of registry progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<SlotProgress> {
        self.registry.subscribe()
    }

    /// Destroys every slot, waits for the registry to drain and for pending operations.
    pub async fn shutdown(&self) -> Result<()> {
        self.registry.destroy_all().await;
        let closed = self.registry.close().await;
        self.pool.shutdown().await;
        closed
    }

    fn existing(&self, idempotency_key: Option<&str>) -> Option<Operation> {
        idempotency_key.and_then(|key| self.operations.by_key(key))
    }

    fn slot(&self, slot_ref: &SlotRef) -> Result<Arc<Slot>> {
        self.registry.get(&slot_ref.task_id, &slot_ref.slot_name)
    }
}

#[async_trait]
impl SlotConnector for SlotService {
    async fn connect(&self, from: &SlotInstance, to: &SlotInstance) -> Result<()> {
        if self.registry.is_local(&from.uri) {
            let request = ConnectSlotRequest {
                from: SlotRef::from(from),
                to: to.clone(),
                offset: 0,
            };
            self.connect_slot(request, None)?;
            return Ok(());
        }

        let remote = self.remote.as_ref().ok_or_else(|| {
            Error::invalid_input(format!(
                "input slot '{}' is served by another node and no remote connector is configured",
                from.uri
            ))
        })?;
        remote.connect(from, to).await
    }
}

impl std::fmt::Debug for SlotService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotService")
            .field("registry", &self.registry)
            .field("pool", &self.pool)
            .field("operations", &self.operations)
            .finish_non_exhaustive()
    }
}
