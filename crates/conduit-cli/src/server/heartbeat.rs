//! Allocator registration and periodic liveness reports.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use conduit_slots::AllocatorClient;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::TRACING_TARGET_HEARTBEAT;

/// Registers `vm_id` with the allocator, then reports it alive every
/// `interval` until `shutdown` is cancelled.
///
/// A failed registration or heartbeat is logged; reporting goes on.
pub fn spawn_heartbeat(
    allocator: Arc<dyn AllocatorClient>,
    vm_id: String,
    metadata: HashMap<String, String>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(error) = allocator.register(&vm_id, &metadata).await {
            tracing::warn!(
                target: TRACING_TARGET_HEARTBEAT,
                vm_id = %vm_id,
                error = %error,
                "Allocator registration failed"
            );
        }

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(error) = allocator.heartbeat(&vm_id).await {
                        tracing::warn!(
                            target: TRACING_TARGET_HEARTBEAT,
                            vm_id = %vm_id,
                            error = %error,
                            "Heartbeat failed"
                        );
                    }
                }
            }
        }

        tracing::debug!(target: TRACING_TARGET_HEARTBEAT, vm_id = %vm_id, "Heartbeats stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl AllocatorClient for Recorder {
        async fn register(
            &self,
            vm_id: &str,
            _metadata: &HashMap<String, String>,
        ) -> conduit_core::Result<()> {
            self.calls.lock().unwrap().push(format!("register {vm_id}"));
            Ok(())
        }

        async fn heartbeat(&self, vm_id: &str) -> conduit_core::Result<()> {
            self.calls.lock().unwrap().push(format!("heartbeat {vm_id}"));
            Err(conduit_core::Error::transient("allocator restarting"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn registers_once_then_beats_until_shutdown() -> anyhow::Result<()> {
        let recorder = Arc::new(Recorder::default());
        let shutdown = CancellationToken::new();
        let running = spawn_heartbeat(
            recorder.clone(),
            "vm-17".into(),
            HashMap::new(),
            Duration::from_secs(10),
            shutdown.clone(),
        );

        tokio::time::sleep(Duration::from_secs(25)).await;
        shutdown.cancel();
        running.await?;

        let calls = recorder.calls.lock().unwrap().clone();
        assert_eq!(calls, ["register vm-17", "heartbeat vm-17", "heartbeat vm-17"]);
        Ok(())
    }
}
