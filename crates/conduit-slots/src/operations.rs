//! Long-running operations, polled by id.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use conduit_core::{Error, Operation, Result};
use tokio::sync::watch;
use uuid::Uuid;

use crate::lock;
use crate::pool::WorkerPool;

/// Tracing target for operations.
pub const TRACING_TARGET: &str = "conduit_slots::operations";

#[derive(Default)]
struct OperationTable {
    operations: HashMap<Uuid, watch::Sender<Operation>>,
    keys: HashMap<String, Uuid>,
}

/// Registry of long-running operations with idempotency keys.
#[derive(Clone, Default)]
pub struct OperationService {
    table: Arc<Mutex<OperationTable>>,
}

/// Outcome of [`OperationService::start`].
pub enum Started {
    /// A new operation; the handle completes it.
    New(OperationHandle),
    /// An operation with the same idempotency key already exists.
    Existing(Operation),
}

/// Completes one operation.
pub struct OperationHandle {
    sender: watch::Sender<Operation>,
}

impl OperationHandle {
    /// Returns the operation as created.
    pub fn operation(&self) -> Operation {
        self.sender.borrow().clone()
    }

    /// Finishes the operation with a JSON response.
    pub fn complete(self, response: serde_json::Value) {
        self.sender.send_modify(|op| op.complete(response));
    }

    /// Finishes the operation with an error.
    pub fn fail(self, error: &Error) {
        self.sender.send_modify(|op| op.fail(error));
    }
}

impl OperationService {
    /// Creates an empty service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an operation, or returns the one registered under `idempotency_key`.
    pub fn start(
        &self,
        description: impl Into<String>,
        idempotency_key: Option<String>,
    ) -> Started {
        let mut table = lock(&self.table);
        if let Some(existing) = idempotency_key
            .as_ref()
            .and_then(|key| table.keys.get(key))
            .and_then(|id| table.operations.get(id))
        {
            return Started::Existing(existing.borrow().clone());
        }

        let operation = Operation::new(description, idempotency_key.clone());
        let id = operation.id;
        let (sender, _) = watch::channel(operation);
        table.operations.insert(id, sender.clone());
        if let Some(key) = idempotency_key {
            table.keys.insert(key, id);
        }

        Started::New(OperationHandle { sender })
    }

    /// Runs `work` on `pool` as an operation and returns it immediately.
    pub fn spawn<F>(
        &self,
        pool: &WorkerPool,
        description: impl Into<String>,
        idempotency_key: Option<String>,
        work: F,
    ) -> Operation
    where
        F: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        let handle = match self.start(description, idempotency_key) {
            Started::Existing(operation) => return operation,
            Started::New(handle) => handle,
        };

        let operation = handle.operation();
        tracing::debug!(
            target: TRACING_TARGET,
            operation_id = %operation.id,
            description = %operation.description,
            "Operation started"
        );

        pool.spawn(async move {
            match work.await {
                Ok(response) => handle.complete(response),
                Err(error) => handle.fail(&error),
            }
        });

        operation
    }

    /// Returns an operation.
    pub fn get(&self, id: Uuid) -> Result<Operation> {
        lock(&self.table)
            .operations
            .get(&id)
            .map(|sender| sender.borrow().clone())
            .ok_or_else(|| Error::not_found(format!("operation '{id}' not found")))
    }

    /// Returns the operation registered under an idempotency key.
    pub fn by_key(&self, idempotency_key: &str) -> Option<Operation> {
        let table = lock(&self.table);
        table
            .keys
            .get(idempotency_key)
            .and_then(|id| table.operations.get(id))
            .map(|sender| sender.borrow().clone())
    }

    /// Returns all operations.
    pub fn list(&self) -> Vec<Operation> {
        let mut operations: Vec<_> = lock(&self.table)
            .operations
            .values()
            .map(|sender| sender.borrow().clone())
            .collect();
        operations.sort_by_key(|op| op.id);
        operations
    }

    /// Waits up to `timeout` for an operation to finish and returns its latest state.
    pub async fn await_completion(&self, id: Uuid, timeout: Duration) -> Result<Operation> {
        let mut receiver = lock(&self.table)
            .operations
            .get(&id)
            .map(|sender| sender.subscribe())
            .ok_or_else(|| Error::not_found(format!("operation '{id}' not found")))?;

        let finished = tokio::time::timeout(timeout, receiver.wait_for(|op| op.done))
            .await
            .ok()
            .and_then(|waited| waited.ok().map(|op| Operation::clone(&op)));

        match finished {
            Some(operation) => Ok(operation),
            None => Ok(receiver.borrow().clone()),
        }
    }
}

impl std::fmt::Debug for OperationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationService")
            .field("operations", &lock(&self.table).operations.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use conduit_core::ErrorKind;

    use super::*;

    #[tokio::test]
    async fn idempotency_key_returns_existing_operation() {
        let service = OperationService::new();
        let pool = WorkerPool::new(1);

        let first = service.spawn(&pool, "connect /in", Some("key-1".into()), async {
            Ok(serde_json::json!({ "bytes": 6 }))
        });
        let second = service.spawn(&pool, "connect /in", Some("key-1".into()), async {
            Err(Error::internal("must not run"))
        });
        assert_eq!(first.id, second.id);
        assert_eq!(service.by_key("key-1").map(|op| op.id), Some(first.id));

        let done = service
            .await_completion(first.id, Duration::from_secs(5))
            .await;
        assert!(done.is_ok_and(|op| op.is_success()));
        assert_eq!(service.list().len(), 1);
    }

    #[tokio::test]
    async fn failure_is_recorded_on_operation() -> Result<()> {
        let service = OperationService::new();
        let pool = WorkerPool::new(1);
        let op = service.spawn(&pool, "destroy /out", None, async {
            Err(Error::transient("storage down"))
        });

        let done = service.await_completion(op.id, Duration::from_secs(5)).await?;
        assert!(done.done);
        assert_eq!(done.error.map(|e| e.kind), Some(ErrorKind::Transient));
        Ok(())
    }

    #[tokio::test]
    async fn unfinished_operation_is_returned_after_timeout() -> Result<()> {
        let service = OperationService::new();
        let Started::New(handle) = service.start("pending", None) else {
            panic!("fresh service has no keys");
        };
        let id = handle.operation().id;

        let op = service.await_completion(id, Duration::from_millis(10)).await?;
        assert!(!op.done);

        handle.complete(serde_json::Value::Null);
        assert!(service.get(id)?.done);
        assert!(service.get(Uuid::new_v4()).is_err());
        Ok(())
    }
}
