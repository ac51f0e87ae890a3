//! Allocator client: worker registration and liveness.

use std::collections::HashMap;

use async_trait::async_trait;
use conduit_core::Result;

/// Client of the allocator that owns this worker.
#[async_trait]
pub trait AllocatorClient: Send + Sync {
    /// Announces the worker and its metadata, such as the slot API address.
    async fn register(&self, vm_id: &str, metadata: &HashMap<String, String>) -> Result<()>;

    /// Reports the worker alive.
    async fn heartbeat(&self, vm_id: &str) -> Result<()>;
}

/// Allocator client for standalone workers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAllocator;

#[async_trait]
impl AllocatorClient for NoopAllocator {
    async fn register(&self, _vm_id: &str, _metadata: &HashMap<String, String>) -> Result<()> {
        Ok(())
    }

    async fn heartbeat(&self, _vm_id: &str) -> Result<()> {
        Ok(())
    }
}
