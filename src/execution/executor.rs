//! Serialized, branch-and-commit executor

use super::ExecutionContext;
use crate::chain::{BlockHeader, BranchedState, ChainHandle, ChainRegistry};
use crate::config::LockScope;
use crate::coordination::CoordinationContext;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::types::{ChainId, ExecutionHeight};

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Runs callbacks against branched chain state, committing only on success.
///
/// Executions on the same chain never interleave. With `LockScope::Global`
/// all chains share one lock; with `LockScope::PerChain` independent chains
/// run concurrently.
///
/// A callback must never call `execute` for a chain whose lock it already
/// holds: the lock is not re-entrant. Read-only access from inside a callback
/// goes through `query`, which takes no lock.
pub struct BranchedExecutor {
    registry: Arc<ChainRegistry>,
    scope: LockScope,
    global: Arc<Mutex<()>>,
    chain_locks: DashMap<ChainId, Arc<Mutex<()>>>,
}

impl BranchedExecutor {
    pub fn new(registry: Arc<ChainRegistry>, scope: LockScope) -> Self {
        Self {
            registry,
            scope,
            global: Arc::new(Mutex::new(())),
            chain_locks: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ChainRegistry> {
        &self.registry
    }

    pub fn scope(&self) -> LockScope {
        self.scope
    }

    /// Execute `callback` on `chain_id` at `height` and commit its branch on success
    pub async fn execute<F, Fut, T>(
        &self,
        coordination: Option<Arc<CoordinationContext>>,
        height: ExecutionHeight,
        chain_id: &ChainId,
        callback: F,
    ) -> CoordinatorResult<T>
    where
        F: FnOnce(ExecutionContext) -> Fut,
        Fut: Future<Output = CoordinatorResult<T>>,
    {
        let _guard = self.lock(chain_id).await;
        let handle = self.resolve(chain_id)?;
        let header = handle.header_at(height)?;
        self.run(&handle, coordination, header, callback).await
    }

    /// Execute under an explicit header instead of one derived from a height
    pub async fn execute_with_header<F, Fut, T>(
        &self,
        coordination: Option<Arc<CoordinationContext>>,
        header: BlockHeader,
        callback: F,
    ) -> CoordinatorResult<T>
    where
        F: FnOnce(ExecutionContext) -> Fut,
        Fut: Future<Output = CoordinatorResult<T>>,
    {
        let chain_id = header.chain_id.clone();
        let _guard = self.lock(&chain_id).await;
        let handle = self.resolve(&chain_id)?;
        self.run(&handle, coordination, header, callback).await
    }

    /// Run `callback` on a read-only branch that is always discarded
    pub async fn query<F, Fut, T>(
        &self,
        coordination: Option<Arc<CoordinationContext>>,
        height: ExecutionHeight,
        chain_id: &ChainId,
        callback: F,
    ) -> CoordinatorResult<T>
    where
        F: FnOnce(ExecutionContext) -> Fut,
        Fut: Future<Output = CoordinatorResult<T>>,
    {
        let handle = self.resolve(chain_id)?;
        let (state, header) = handle.branch_state(height)?;
        let ctx = ExecutionContext::new(header, state, coordination, true);
        let result = callback(ctx).await;
        crate::metrics::record_execution(chain_id, "query");
        result
    }

    fn resolve(&self, chain_id: &ChainId) -> CoordinatorResult<Arc<ChainHandle>> {
        let handle = self.registry.resolve(chain_id)?;
        if handle.chain_id() != chain_id {
            return Err(CoordinatorError::ChainMismatch {
                requested: chain_id.clone(),
                resolved: handle.chain_id().clone(),
            });
        }
        Ok(handle)
    }

    async fn lock(&self, chain_id: &ChainId) -> OwnedMutexGuard<()> {
        let lock = match self.scope {
            LockScope::Global => self.global.clone(),
            LockScope::PerChain => self
                .chain_locks
                .entry(chain_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone(),
        };
        lock.lock_owned().await
    }

    async fn run<F, Fut, T>(
        &self,
        handle: &ChainHandle,
        coordination: Option<Arc<CoordinationContext>>,
        header: BlockHeader,
        callback: F,
    ) -> CoordinatorResult<T>
    where
        F: FnOnce(ExecutionContext) -> Fut,
        Fut: Future<Output = CoordinatorResult<T>>,
    {
        let chain_id = handle.chain_id().clone();
        let height = header.height;
        let state = Arc::new(BranchedState::new(handle.store().clone()));
        let ctx = ExecutionContext::new(header, state.clone(), coordination.clone(), false);

        match callback(ctx).await {
            Ok(result) => {
                if coordination.as_ref().map(|c| c.is_cancelled()).unwrap_or(false) {
                    debug!(chain_id = %chain_id, height, "Discarding branch: coordination context cancelled");
                    crate::metrics::record_execution(&chain_id, "discard");
                    return Err(CoordinatorError::aborted("branch commit"));
                }
                let stores = state.tracked_stores();
                state.commit();
                debug!(chain_id = %chain_id, height, ?stores, "Committed branch");
                crate::metrics::record_execution(&chain_id, "commit");
                Ok(result)
            }
            Err(e) => {
                debug!(chain_id = %chain_id, height, error = %e, "Discarding branch");
                crate::metrics::record_execution(&chain_id, "discard");
                Err(e)
            }
        }
    }
}
