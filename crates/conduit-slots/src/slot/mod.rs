//! Slot state machine.

mod arg;
mod backend;
mod file;
mod pipe;
mod snapshot;

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use conduit_core::{
    ChunkStream, Error, Result, SlotInstance, SlotSpec, SlotState, SlotStatus, SlotUri,
};
use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub use self::backend::{BackendContext, SlotBackend};
pub use self::pipe::BoxedWriter;
use crate::lock;

/// Tracing target for slot lifecycle events.
pub(crate) const TRACING_TARGET: &str = "conduit_slots::slot";

type Callback = Box<dyn FnOnce(SlotState) + Send>;

struct Listener {
    target: SlotState,
    callback: Callback,
}

/// A named data endpoint with a monotonic lifecycle.
///
/// Transitions only move forward. Listeners registered with
/// [`Slot::on_state`] fire exactly once, as part of the transition that
/// reaches their target, or immediately if the target was already reached.
pub struct Slot {
    instance: SlotInstance,
    backend: SlotBackend,
    state: watch::Sender<SlotState>,
    listeners: Mutex<Vec<Listener>>,
    failure: Mutex<Option<Error>>,
    peer: Mutex<Option<SlotUri>>,
    bytes: AtomicU64,
    connected: AtomicBool,
    cancel: CancellationToken,
    attached: TaskTracker,
    lifecycle: tokio::sync::Mutex<()>,
}

impl Slot {
    /// Creates a slot over an already constructed backend.
    pub fn new(instance: SlotInstance, backend: SlotBackend) -> Arc<Self> {
        let (state, _) = watch::channel(backend.initial_state());

        Arc::new(Self {
            instance,
            backend,
            state,
            listeners: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            peer: Mutex::new(None),
            bytes: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            attached: TaskTracker::new(),
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    /// Returns the slot instance.
    pub fn instance(&self) -> &SlotInstance {
        &self.instance
    }

    /// Returns the slot declaration.
    pub fn spec(&self) -> &SlotSpec {
        &self.instance.spec
    }

    /// Returns the slot name.
    pub fn name(&self) -> &str {
        self.instance.name()
    }

    /// Returns the owning task.
    pub fn task_id(&self) -> &str {
        &self.instance.task_id
    }

    /// Returns the resolvable URI of the slot.
    pub fn uri(&self) -> &SlotUri {
        &self.instance.uri
    }

    /// Returns the backend.
    pub fn backend(&self) -> &SlotBackend {
        &self.backend
    }

    /// Returns the current state.
    pub fn state(&self) -> SlotState {
        *self.state.borrow()
    }

    /// Returns a receiver observing state changes.
    pub fn subscribe(&self) -> watch::Receiver<SlotState> {
        self.state.subscribe()
    }

    /// Returns the failure attached to the slot, if any.
    pub fn failure(&self) -> Option<Error> {
        lock(&self.failure).as_ref().map(Error::detached)
    }

    /// Returns the local file backing the slot, for file backends.
    pub fn local_path(&self) -> Option<&Path> {
        self.backend.local_path()
    }

    /// Registers `callback` to run once the slot reaches `target` or any later state.
    pub fn on_state<F>(&self, target: SlotState, callback: F)
    where
        F: FnOnce(SlotState) + Send + 'static,
    {
        let mut listeners = lock(&self.listeners);
        let current = *self.state.borrow();
        if current >= target {
            drop(listeners);
            callback(current);
            return;
        }

        listeners.push(Listener {
            target,
            callback: Box::new(callback),
        });
    }

    /// Waits until the slot reaches `target` or a later state and returns the state.
    pub async fn wait_for(&self, target: SlotState) -> SlotState {
        let mut receiver = self.state.subscribe();
        let reached = receiver.wait_for(|state| *state >= target).await.map(|s| *s);
        reached.unwrap_or_else(|_| self.state())
    }

    /// Resolves once the slot is suspended or destroyed.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Moves the slot forward, firing listeners whose target was reached.
    ///
    /// Returns `false` if the slot is already at or past `next`.
    fn transition(&self, next: SlotState) -> bool {
        let fired = {
            let mut listeners = lock(&self.listeners);
            let moved = self.state.send_if_modified(|state| {
                if next > *state {
                    *state = next;
                    true
                } else {
                    false
                }
            });
            if !moved {
                return false;
            }

            let (fired, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut *listeners)
                .into_iter()
                .partition(|listener| listener.target <= next);
            *listeners = pending;
            fired
        };

        tracing::debug!(
            target: TRACING_TARGET,
            task_id = %self.task_id(),
            slot = %self.name(),
            state = %next,
            "Slot state changed"
        );

        for listener in fired {
            (listener.callback)(next);
        }
        true
    }

    fn record_failure(&self, error: Error) {
        let mut failure = lock(&self.failure);
        if failure.is_none() {
            tracing::warn!(
                target: TRACING_TARGET,
                task_id = %self.task_id(),
                slot = %self.name(),
                error = %error,
                "Slot failed"
            );
            *failure = Some(error);
        }
    }

    /// Runs `future` as part of the slot; destruction waits for it before
    /// releasing the backend.
    pub fn spawn_attached<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.attached.spawn(future);
    }

    /// Appends producer bytes to an output slot.
    pub async fn write(&self, data: Bytes) -> Result<()> {
        if !self.spec().is_output() {
            return Err(Error::invalid_state(format!(
                "slot '{}' is not an output",
                self.name()
            )));
        }
        if self.state().is_closed() {
            return Err(self.failure().unwrap_or_else(|| {
                Error::invalid_state(format!("slot '{}' is closed", self.name()))
            }));
        }

        let len = data.len() as u64;
        self.backend.write(data).await?;
        self.bytes.fetch_add(len, Ordering::Relaxed);
        self.transition(self.backend.producing_state());
        Ok(())
    }

    /// Marks the producer of an output slot as finished, opening the slot for readers.
    pub async fn close_writer(&self) -> Result<()> {
        if !self.spec().is_output() {
            return Err(Error::invalid_state(format!(
                "slot '{}' is not an output",
                self.name()
            )));
        }

        self.backend.close_writer().await?;
        self.transition(SlotState::Open);
        Ok(())
    }

    /// Returns the output bytes starting at `offset` as a lazy chunk stream.
    ///
    /// The stream waits until the slot is open. A failed slot surfaces its
    /// error to the reader.
    pub fn read_from(self: &Arc<Self>, offset: u64) -> ChunkStream {
        let slot = Arc::clone(self);
        let stream = async_stream::try_stream! {
            slot.wait_readable().await?;
            let mut chunks = slot.backend.read(offset).await?;
            while let Some(chunk) = chunks.next().await {
                yield chunk?;
            }
        };

        stream.boxed()
    }

    async fn wait_readable(&self) -> Result<()> {
        if !self.spec().is_output() {
            return Err(Error::invalid_state(format!(
                "slot '{}' is not an output",
                self.name()
            )));
        }

        let state = self.wait_for(SlotState::Open).await;
        if state.is_terminal() {
            return Err(self.failure().unwrap_or_else(|| {
                Error::invalid_state(format!("slot '{}' is destroyed", self.name()))
            }));
        }
        Ok(())
    }

    /// Pulls `chunks` from `source` into an input slot until the stream ends,
    /// fails, or the slot is suspended. Returns the number of bytes received.
    ///
    /// A completed pull leaves the slot suspended; a failed pull destroys it.
    pub async fn connect(&self, source: SlotUri, mut chunks: ChunkStream) -> Result<u64> {
        if !self.spec().is_input() {
            return Err(Error::invalid_state(format!(
                "slot '{}' is not an input",
                self.name()
            )));
        }
        if self.state() != SlotState::Unbound || self.connected.swap(true, Ordering::SeqCst) {
            return Err(Error::invalid_state(format!(
                "slot '{}' is already connected",
                self.name()
            )));
        }

        *lock(&self.peer) = Some(source.clone());
        self.transition(SlotState::Open);

        tracing::info!(
            target: TRACING_TARGET,
            task_id = %self.task_id(),
            slot = %self.name(),
            peer = %source,
            "Slot connected"
        );

        let mut received = 0u64;
        let outcome = loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break Ok(false),
                next = chunks.next() => next,
            };

            match next {
                None => break Ok(true),
                Some(Err(error)) => break Err(error),
                Some(Ok(chunk)) => {
                    let len = chunk.len() as u64;
                    let accepted = tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => break Ok(false),
                        accepted = self.backend.accept(chunk) => accepted,
                    };
                    if let Err(error) = accepted {
                        if self.cancel.is_cancelled() {
                            break Ok(false);
                        }
                        break Err(error);
                    }
                    received += len;
                    self.bytes.fetch_add(len, Ordering::Relaxed);
                }
            }
        };
        drop(chunks);

        let outcome = match outcome {
            Ok(true) => self.backend.finish_input().await.map(|()| true),
            other => other,
        };

        match outcome {
            Ok(completed) => {
                tracing::info!(
                    target: TRACING_TARGET,
                    task_id = %self.task_id(),
                    slot = %self.name(),
                    bytes = received,
                    completed = completed,
                    "Slot transfer finished"
                );
                self.suspend().await?;
                Ok(received)
            }
            Err(error) => {
                self.fail(error.detached()).await;
                Err(error)
            }
        }
    }

    /// Detaches the slot from its peer. No-op once suspended or destroyed.
    pub async fn suspend(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.suspend_locked().await;
        Ok(())
    }

    async fn suspend_locked(&self) {
        if self.state().is_closed() {
            return;
        }

        self.cancel.cancel();
        if let Err(error) = self.backend.flush().await {
            self.record_failure(error);
        }
        self.transition(SlotState::Suspended);
    }

    /// Destroys the slot, releasing its backend. Idempotent.
    ///
    /// Returns the release failure, if releasing the backend failed.
    pub async fn destroy(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.state().is_terminal() {
            return Ok(());
        }

        self.suspend_locked().await;
        self.attached.close();
        self.attached.wait().await;

        let released = self.backend.release().await;
        if let Err(error) = &released {
            self.record_failure(error.detached());
        }
        self.transition(SlotState::Destroyed);

        tracing::info!(
            target: TRACING_TARGET,
            task_id = %self.task_id(),
            slot = %self.name(),
            "Slot destroyed"
        );

        released
    }

    /// Records `error` as the slot's failure and destroys the slot.
    pub async fn fail(&self, error: Error) {
        self.record_failure(error);
        let _ = self.destroy().await;
    }

    /// Returns a status summary.
    pub fn status(&self) -> SlotStatus {
        SlotStatus {
            task_id: self.instance.task_id.clone(),
            name: self.instance.spec.name.clone(),
            direction: self.instance.spec.direction,
            media: self.instance.spec.media,
            state: self.state(),
            channel_id: self.instance.channel_id.clone(),
            peer_uri: lock(&self.peer).clone(),
            bytes: self.bytes.load(Ordering::Relaxed),
            error: lock(&self.failure).as_ref().map(|e| e.to_string()),
        }
    }

    /// Takes the value of an argument slot. Returns `None` after the first call.
    pub fn take_value(&self) -> Option<String> {
        match &self.backend {
            SlotBackend::Arg(arg) => arg.take_value(),
            _ => None,
        }
    }

    /// Takes the reading end of an input pipe, for the attached process.
    pub fn take_pipe_reader(&self) -> Option<tokio::io::DuplexStream> {
        match &self.backend {
            SlotBackend::PipeInput(pipe) => pipe.take_reader(),
            _ => None,
        }
    }

    /// Forwards an input pipe into `writer` instead of the internal buffer.
    pub async fn attach_pipe_writer(&self, writer: BoxedWriter) -> Result<()> {
        match &self.backend {
            SlotBackend::PipeInput(pipe) => {
                pipe.attach_writer(writer).await;
                Ok(())
            }
            _ => Err(Error::invalid_state(format!(
                "slot '{}' is not an input pipe",
                self.name()
            ))),
        }
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("task_id", &self.task_id())
            .field("name", &self.name())
            .field("backend", &self.backend.kind())
            .field("state", &self.state())
            .finish()
    }
}
