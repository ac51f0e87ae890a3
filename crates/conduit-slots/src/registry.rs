//! Per-task slot namespaces.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use conduit_core::{
    Error, Result, SlotInstance, SlotProgress, SlotSpec, SlotState, SlotUri, normalize_binding,
    snapshot_binding,
};
use tokio::sync::{broadcast, watch};
use url::Url;

use crate::channel::{ChannelManager, NoopChannelManager};
use crate::config::{DEFAULT_CLOSE_RECHECKS, DEFAULT_CLOSE_WAIT};
use crate::lock;
use crate::slot::{BackendContext, Slot, SlotBackend};
use crate::snapshooter::{SnapshotStore, Snapshooter};

/// Tracing target for registry events.
pub const TRACING_TARGET: &str = "conduit_slots::registry";

/// Capacity of the progress broadcast channel.
const PROGRESS_CAPACITY: usize = 1024;

type ProgressListener = Arc<dyn Fn(&SlotProgress) + Send + Sync>;
type Namespaces = HashMap<String, HashMap<String, Arc<Slot>>>;

struct RegistryInner {
    base: Url,
    namespaces: Mutex<Namespaces>,
    count: watch::Sender<usize>,
    progress: broadcast::Sender<SlotProgress>,
    listeners: Mutex<Vec<ProgressListener>>,
    context: BackendContext,
    channels: Arc<dyn ChannelManager>,
    snapshooter: Option<Snapshooter>,
    close_wait: Duration,
    close_rechecks: u32,
    closing: AtomicBool,
}

/// Registry of slots, grouped by owning task.
///
/// Every `(taskId, name)` maps to exactly one slot. A slot is removed when it
/// is destroyed, and a task namespace is removed with its last slot.
#[derive(Clone)]
pub struct SlotRegistry {
    inner: Arc<RegistryInner>,
}

/// Builder for [`SlotRegistry`].
#[must_use = "builders do nothing unless built"]
pub struct SlotRegistryBuilder {
    base: Url,
    context: BackendContext,
    channels: Arc<dyn ChannelManager>,
    snapshots: Option<SnapshotStore>,
    close_wait: Duration,
    close_rechecks: u32,
}

impl SlotRegistryBuilder {
    /// Uses `channels` to bind slots to their channels.
    pub fn with_channel_manager(mut self, channels: Arc<dyn ChannelManager>) -> Self {
        self.channels = channels;
        self
    }

    /// Enables snapshot slots and snapshot channels.
    pub fn with_snapshots(mut self, store: SnapshotStore) -> Self {
        self.context = self.context.with_snapshots(store.clone());
        self.snapshots = Some(store);
        self
    }

    /// Sets how [`SlotRegistry::close`] waits for the registry to drain.
    pub fn with_close_policy(mut self, wait: Duration, rechecks: u32) -> Self {
        self.close_wait = wait;
        self.close_rechecks = rechecks;
        self
    }

    /// Builds the registry.
    pub fn build(self) -> SlotRegistry {
        let (count, _) = watch::channel(0);
        let (progress, _) = broadcast::channel(PROGRESS_CAPACITY);

        SlotRegistry {
            inner: Arc::new(RegistryInner {
                base: self.base,
                namespaces: Mutex::new(HashMap::new()),
                count,
                progress,
                listeners: Mutex::new(Vec::new()),
                context: self.context,
                channels: self.channels,
                snapshooter: self.snapshots.map(Snapshooter::new),
                close_wait: self.close_wait,
                close_rechecks: self.close_rechecks,
                closing: AtomicBool::new(false),
            }),
        }
    }
}

impl SlotRegistry {
    /// Starts building a registry advertising slots under `base`.
    pub fn builder(base: Url, tmp_dir: impl Into<std::path::PathBuf>) -> SlotRegistryBuilder {
        SlotRegistryBuilder {
            base,
            context: BackendContext::new(tmp_dir),
            channels: Arc::new(NoopChannelManager),
            snapshots: None,
            close_wait: DEFAULT_CLOSE_WAIT,
            close_rechecks: DEFAULT_CLOSE_RECHECKS,
        }
    }

    /// Returns the base URI of this node.
    pub fn base(&self) -> &Url {
        &self.inner.base
    }

    /// Returns the channel manager.
    pub fn channels(&self) -> &Arc<dyn ChannelManager> {
        &self.inner.channels
    }

    /// Returns the snapshot store, if snapshots are enabled.
    pub fn snapshots(&self) -> Option<&SnapshotStore> {
        self.inner.snapshooter.as_ref().map(Snapshooter::store)
    }

    /// Returns `true` if `uri` points at a slot served by this node.
    pub fn is_local(&self, uri: &SlotUri) -> bool {
        let base = &self.inner.base;
        let authority = match (base.host_str(), base.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            _ => return false,
        };
        uri.authority() == authority && uri.session_id().is_none()
    }

    /// Creates a slot. Fails with `AlreadyExists` if the name is taken.
    pub async fn create(&self, task_id: &str, spec: SlotSpec, binding: &str) -> Result<Arc<Slot>> {
        match self.insert(task_id, spec, binding)? {
            (slot, true) => {
                self.install(&slot, binding).await?;
                Ok(slot)
            }
            (slot, false) => Err(Error::already_exists(format!(
                "slot '{}' already exists in task '{}'",
                slot.name(),
                task_id
            ))),
        }
    }

    /// Returns the slot `(task_id, spec.name)`, creating it if absent.
    ///
    /// Concurrent callers share one slot and one backend.
    pub async fn get_or_create(
        &self,
        task_id: &str,
        spec: SlotSpec,
        binding: &str,
    ) -> Result<Arc<Slot>> {
        let (slot, created) = self.insert(task_id, spec, binding)?;
        if created {
            self.install(&slot, binding).await?;
        }
        Ok(slot)
    }

    fn insert(&self, task_id: &str, spec: SlotSpec, binding: &str) -> Result<(Arc<Slot>, bool)> {
        let mut namespaces = lock(&self.inner.namespaces);
        if self.inner.closing.load(Ordering::SeqCst) {
            return Err(Error::invalid_state("slot registry is closing"));
        }
        if let Some(existing) = namespaces.get(task_id).and_then(|ns| ns.get(&spec.name)) {
            return Ok((Arc::clone(existing), false));
        }

        let backend = SlotBackend::create(task_id, &spec, &self.inner.context)?;
        let instance = SlotInstance {
            uri: SlotUri::for_slot(&self.inner.base, task_id, &spec.name)?,
            channel_id: normalize_binding(binding).to_string(),
            task_id: task_id.to_string(),
            spec,
        };

        let slot = Slot::new(instance, backend);
        namespaces
            .entry(task_id.to_string())
            .or_default()
            .insert(slot.name().to_string(), Arc::clone(&slot));
        self.inner.count.send_replace(total(&namespaces));

        Ok((slot, true))
    }

    /// Wires a freshly inserted slot: listeners, attach event, snapshots, channel.
    async fn install(&self, slot: &Arc<Slot>, binding: &str) -> Result<()> {
        let weak = Arc::downgrade(&self.inner);
        let instance = slot.instance().clone();
        slot.on_state(SlotState::Suspended, move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.detached(instance);
            }
        });

        let weak = Arc::downgrade(&self.inner);
        let removed = Arc::downgrade(slot);
        slot.on_state(SlotState::Destroyed, move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.remove(&removed);
            }
        });

        tracing::info!(
            target: TRACING_TARGET,
            task_id = %slot.task_id(),
            slot = %slot.name(),
            uri = %slot.uri(),
            backend = slot.backend().kind(),
            "Slot attached"
        );
        self.inner.emit(SlotProgress::Attached {
            slot: slot.instance().clone(),
        });

        if let Err(error) = self.register_snapshot(slot, binding).await {
            slot.fail(error.detached()).await;
            return Err(error);
        }

        if is_channel_binding(slot.instance()) {
            if let Err(error) = self.inner.channels.bind(slot.instance()).await {
                slot.fail(error.detached()).await;
                return Err(error);
            }
        }

        Ok(())
    }

    async fn register_snapshot(&self, slot: &Arc<Slot>, binding: &str) -> Result<()> {
        let tracked = snapshot_binding(binding).filter(|_| slot.spec().is_output());
        let entry = slot.backend().snapshot_entry();
        if tracked.is_none() && entry.is_none() {
            return Ok(());
        }

        let snapshooter = self.inner.snapshooter.as_ref().ok_or_else(|| {
            Error::invalid_input(format!(
                "slot '{}' is bound to a snapshot but snapshot storage is not configured",
                slot.name()
            ))
        })?;

        if let Some(snapshot_id) = tracked {
            snapshooter
                .track_output(slot, snapshot_id)
                .await
                .map_err(|e| {
                    Error::new(e.kind()).with_message(format!(
                        "cannot register slot '{}' of task '{}' in snapshot '{}': {}",
                        slot.name(),
                        slot.task_id(),
                        snapshot_id,
                        e.message_or_kind()
                    ))
                })?;
        }

        if let Some((snapshot_id, slot_path)) = entry {
            snapshooter
                .register_input(snapshot_id, slot_path)
                .await
                .map_err(|e| {
                    Error::new(e.kind()).with_message(format!(
                        "cannot register snapshot input '{}' in snapshot '{}': {}",
                        slot_path,
                        snapshot_id,
                        e.message_or_kind()
                    ))
                })?;
        }

        Ok(())
    }

    /// Returns the slot `(task_id, name)`.
    pub fn get(&self, task_id: &str, name: &str) -> Result<Arc<Slot>> {
        self.find(task_id, name).ok_or_else(|| {
            Error::not_found(format!("slot '{name}' not found in task '{task_id}'"))
        })
    }

    /// Returns the slot `(task_id, name)`, if registered.
    pub fn find(&self, task_id: &str, name: &str) -> Option<Arc<Slot>> {
        lock(&self.inner.namespaces)
            .get(task_id)
            .and_then(|ns| ns.get(name))
            .cloned()
    }

    /// Returns every registered slot, ordered by task and name.
    pub fn all(&self) -> Vec<Arc<Slot>> {
        let namespaces = lock(&self.inner.namespaces);
        let mut slots: Vec<_> = namespaces
            .values()
            .flat_map(|ns| ns.values().cloned())
            .collect();
        drop(namespaces);

        slots.sort_by(|a, b| (a.task_id(), a.name()).cmp(&(b.task_id(), b.name())));
        slots
    }

    /// Returns the slots of one task.
    pub fn task_slots(&self, task_id: &str) -> Vec<Arc<Slot>> {
        lock(&self.inner.namespaces)
            .get(task_id)
            .map(|ns| ns.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the number of registered slots.
    pub fn len(&self) -> usize {
        *self.inner.count.borrow()
    }

    /// Returns `true` if no slot is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a receiver of progress events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SlotProgress> {
        self.inner.progress.subscribe()
    }

    /// Registers a callback invoked synchronously for every progress event.
    pub fn on_progress<F>(&self, listener: F)
    where
        F: Fn(&SlotProgress) + Send + Sync + 'static,
    {
        lock(&self.inner.listeners).push(Arc::new(listener));
    }

    /// Destroys every registered slot.
    pub async fn destroy_all(&self) {
        for slot in self.all() {
            if let Err(error) = slot.destroy().await {
                tracing::warn!(
                    target: TRACING_TARGET,
                    task_id = %slot.task_id(),
                    slot = %slot.name(),
                    error = %error,
                    "Slot release failed during shutdown"
                );
            }
        }
    }

    /// Blocks until every slot is gone, then closes snapshot storage and
    /// emits [`SlotProgress::Concluded`].
    ///
    /// New slots are refused from the first call on. Fails with `Timeout` if
    /// the registry does not drain within the configured number of rechecks.
    pub async fn close(&self) -> Result<()> {
        // Under the namespace lock so no insert slips in between the flag and the count.
        let mut count = {
            let _namespaces = lock(&self.inner.namespaces);
            self.inner.closing.store(true, Ordering::SeqCst);
            self.inner.count.subscribe()
        };

        let mut drained = false;
        for recheck in 0..=self.inner.close_rechecks {
            let remaining = *count.borrow_and_update();
            if remaining == 0 {
                drained = true;
                break;
            }
            if recheck == self.inner.close_rechecks {
                break;
            }

            tracing::debug!(
                target: TRACING_TARGET,
                remaining = remaining,
                recheck = recheck,
                "Waiting for slots to be destroyed"
            );
            let _ = tokio::time::timeout(self.inner.close_wait, count.changed()).await;
        }

        if !drained {
            let remaining = self.len();
            tracing::error!(
                target: TRACING_TARGET,
                remaining = remaining,
                "Slot registry did not drain"
            );
            return Err(Error::timeout(format!(
                "slot registry still holds {remaining} slots"
            )));
        }

        if let Some(snapshooter) = &self.inner.snapshooter {
            snapshooter.close().await;
        }

        tracing::info!(target: TRACING_TARGET, "Slot registry concluded");
        self.inner.emit(SlotProgress::Concluded);
        Ok(())
    }
}

impl RegistryInner {
    fn emit(&self, event: SlotProgress) {
        let listeners: Vec<_> = lock(&self.listeners).clone();
        for listener in listeners {
            listener(&event);
        }
        let _ = self.progress.send(event);
    }

    fn detached(&self, instance: SlotInstance) {
        tracing::debug!(
            target: TRACING_TARGET,
            task_id = %instance.task_id,
            slot = %instance.spec.name,
            "Slot detached"
        );

        if is_channel_binding(&instance) {
            let channels = Arc::clone(&self.channels);
            let unbound = instance.clone();
            tokio::spawn(async move {
                if let Err(error) = channels.unbind(&unbound).await {
                    tracing::warn!(
                        target: TRACING_TARGET,
                        channel_id = %unbound.channel_id,
                        slot = %unbound.spec.name,
                        error = %error,
                        "Cannot unbind slot"
                    );
                }
            });
        }

        self.emit(SlotProgress::Detached { slot: instance });
    }

    fn remove(&self, slot: &Weak<Slot>) {
        let Some(slot) = slot.upgrade() else {
            return;
        };

        let (removed, completed) = {
            let mut namespaces = lock(&self.namespaces);
            let Some(namespace) = namespaces.get_mut(slot.task_id()) else {
                drop(namespaces);
                self.violation(&slot);
                return;
            };

            let removed = namespace
                .get(slot.name())
                .is_some_and(|entry| Arc::ptr_eq(entry, &slot));
            if removed {
                namespace.remove(slot.name());
            }

            let completed = namespace.is_empty();
            if completed {
                namespaces.remove(slot.task_id());
            }
            self.count.send_replace(total(&namespaces));
            (removed, completed)
        };

        if !removed {
            self.violation(&slot);
            return;
        }

        tracing::debug!(
            target: TRACING_TARGET,
            task_id = %slot.task_id(),
            slot = %slot.name(),
            "Slot unregistered"
        );

        if completed {
            tracing::info!(
                target: TRACING_TARGET,
                task_id = %slot.task_id(),
                "Task communication completed"
            );
            self.emit(SlotProgress::CommunicationCompleted {
                task_id: slot.task_id().to_string(),
            });
        }
    }

    fn violation(&self, slot: &Slot) {
        tracing::error!(
            target: TRACING_TARGET,
            task_id = %slot.task_id(),
            slot = %slot.name(),
            "Destroyed slot was not registered"
        );
    }
}

fn total(namespaces: &Namespaces) -> usize {
    namespaces.values().map(HashMap::len).sum()
}

/// Returns `true` for slots that take part in a plain channel.
fn is_channel_binding(instance: &SlotInstance) -> bool {
    !instance.channel_id.is_empty()
        && snapshot_binding(&instance.channel_id).is_none()
        && !instance.spec.is_local()
}

impl std::fmt::Debug for SlotRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotRegistry")
            .field("base", &self.inner.base.as_str())
            .field("slots", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use conduit_core::{SlotDirection, SlotMedia};
    use conduit_storage::EntryStatus;

    use super::*;

    fn registry(dir: &std::path::Path) -> anyhow::Result<SlotRegistry> {
        let base = Url::parse("fs://127.0.0.1:9000")?;
        Ok(SlotRegistry::builder(base, dir)
            .with_close_policy(Duration::from_millis(20), 10)
            .build())
    }

    fn output(name: &str) -> SlotSpec {
        SlotSpec::new(name, SlotMedia::File, SlotDirection::Output)
    }

    #[tokio::test]
    async fn concurrent_get_or_create_shares_one_slot() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = registry(dir.path())?;

        let attached = Arc::new(AtomicUsize::new(0));
        let counter = attached.clone();
        registry.on_progress(move |event| {
            if matches!(event, SlotProgress::Attached { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.get_or_create("t1", output("/out"), "").await })
            })
            .collect();

        let mut slots = Vec::new();
        for handle in handles {
            slots.push(handle.await??);
        }

        assert!(slots.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.len(), 1);
        assert_eq!(attached.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_create_is_already_exists() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = registry(dir.path())?;
        registry.create("t1", output("/out"), "channel:c1").await?;

        let second = registry.create("t1", output("/out"), "channel:c1").await;
        assert_eq!(
            second.err().map(|e| e.kind()),
            Some(conduit_core::ErrorKind::AlreadyExists)
        );

        let slot = registry.get("t1", "/out")?;
        assert_eq!(slot.instance().channel_id, "c1");
        assert_eq!(slot.uri().as_str(), "fs://127.0.0.1:9000/t1/out");
        Ok(())
    }

    #[tokio::test]
    async fn drains_and_concludes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = registry(dir.path())?;
        let mut events = registry.subscribe();

        let a = registry.create("t1", output("/a"), "").await?;
        let b = registry.create("t1", output("/b"), "").await?;

        let closing = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.close().await })
        };

        a.destroy().await?;
        assert!(registry.get("t1", "/a").is_err());
        b.destroy().await?;
        assert!(registry.get("t1", "/b").is_err());

        closing.await??;
        assert!(registry.is_empty());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        let completed = seen
            .iter()
            .filter(|e| {
                matches!(e, SlotProgress::CommunicationCompleted { task_id } if task_id == "t1")
            })
            .count();
        assert_eq!(completed, 1);
        assert_eq!(seen.last(), Some(&SlotProgress::Concluded));

        let refused = registry.create("t1", output("/c"), "").await;
        assert!(refused.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn close_racing_creates_concludes_after_every_slot() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let base = Url::parse("fs://127.0.0.1:9000")?;
        let registry = SlotRegistry::builder(base, dir.path())
            .with_close_policy(Duration::from_millis(20), 250)
            .build();
        let mut events = registry.subscribe();

        let creates: Vec<_> = (0..32)
            .map(|i| {
                let registry = registry.clone();
                let spec = output(&format!("/o{i}"));
                tokio::spawn(async move { registry.create("t1", spec, "").await })
            })
            .collect();
        let closing = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.close().await })
        };

        for handle in creates {
            if let Ok(slot) = handle.await? {
                slot.destroy().await?;
            }
        }
        closing.await??;
        assert!(registry.is_empty());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        let concluded = seen
            .iter()
            .position(|e| *e == SlotProgress::Concluded)
            .ok_or_else(|| anyhow::anyhow!("registry never concluded"))?;
        assert!(
            !seen[concluded..]
                .iter()
                .any(|e| matches!(e, SlotProgress::Attached { .. }))
        );
        Ok(())
    }

    #[tokio::test]
    async fn close_times_out_while_slots_remain() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = registry(dir.path())?;
        let _slot = registry.create("t1", output("/stuck"), "").await?;

        let result = registry.close().await;
        assert_eq!(
            result.err().map(|e| e.kind()),
            Some(conduit_core::ErrorKind::Timeout)
        );
        Ok(())
    }

    #[tokio::test]
    async fn suspend_emits_detached() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = registry(dir.path())?;
        let mut events = registry.subscribe();

        let slot = registry.create("t1", output("/out"), "").await?;
        slot.suspend().await?;
        slot.suspend().await?;

        assert!(matches!(events.recv().await?, SlotProgress::Attached { .. }));
        assert!(matches!(events.recv().await?, SlotProgress::Detached { .. }));
        assert!(registry.get("t1", "/out").is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn snapshot_output_is_committed_on_destroy() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = SnapshotStore::in_memory("snapshots")?;
        store.create_snapshot("s1").await?;

        let base = Url::parse("fs://127.0.0.1:9000")?;
        let registry = SlotRegistry::builder(base, dir.path())
            .with_snapshots(store.clone())
            .build();

        let slot = registry.create("t1", output("/out"), "snapshot:s1").await?;
        slot.write(bytes::Bytes::from_static(b"hello\n")).await?;
        slot.close_writer().await?;
        slot.destroy().await?;
        registry.close().await?;

        let entry = store.entry("s1", "/out").await?;
        assert_eq!(entry.status, EntryStatus::Committed);
        assert!(!entry.empty);
        assert_eq!(store.storage().read("s1/out").await?, "hello\n");
        Ok(())
    }

    #[tokio::test]
    async fn failed_snapshot_registration_destroys_slot() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = SnapshotStore::in_memory("snapshots")?;

        let base = Url::parse("fs://127.0.0.1:9000")?;
        let registry = SlotRegistry::builder(base, dir.path())
            .with_snapshots(store)
            .build();

        let result = registry.create("t1", output("/out"), "snapshot:missing").await;
        let error = result.err().map(|e| e.to_string()).unwrap_or_default();
        assert!(error.contains("snapshot 'missing'"));
        assert!(registry.get("t1", "/out").is_err());
        Ok(())
    }
}
