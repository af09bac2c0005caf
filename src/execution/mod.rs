//! Branched execution for a single chain
//!
//! Every execution runs against a `BranchedState` wrapped in an
//! `ExecutionContext`. The branch is committed only when the callback
//! succeeds; on error it is dropped and the committed store is untouched.

pub mod executor;

pub use executor::BranchedExecutor;

use crate::chain::{BlockHeader, BranchedState};
use crate::coordination::{CoordinationContext, CrossChainCallProtocol};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::events::EventManager;
use crate::types::{ChainId, CrossCallRequest, CrossCallResponse};

use std::sync::Arc;

/// Everything a callback may touch while it executes on one chain
#[derive(Clone)]
pub struct ExecutionContext {
    chain_id: ChainId,
    header: BlockHeader,
    state: Arc<BranchedState>,
    events: EventManager,
    coordination: Option<Arc<CoordinationContext>>,
    read_only: bool,
}

impl ExecutionContext {
    pub fn new(
        header: BlockHeader,
        state: Arc<BranchedState>,
        coordination: Option<Arc<CoordinationContext>>,
        read_only: bool,
    ) -> Self {
        Self {
            chain_id: header.chain_id.clone(),
            header,
            state,
            events: EventManager::new(),
            coordination,
            read_only,
        }
    }

    pub fn chain_id(&self) -> &ChainId {
        &self.chain_id
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn state(&self) -> &Arc<BranchedState> {
        &self.state
    }

    pub fn events(&self) -> &EventManager {
        &self.events
    }

    pub fn coordination(&self) -> Option<&Arc<CoordinationContext>> {
        self.coordination.as_ref()
    }

    /// Whether the branch is a discardable query branch
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Synchronously call a contract on another chain of the current atomic transaction
    pub async fn cross_chain_call(
        &self,
        request: CrossCallRequest,
    ) -> CoordinatorResult<CrossCallResponse> {
        let coordination = self.coordination.as_ref().ok_or_else(|| {
            CoordinatorError::Execution(format!(
                "no coordination context on chain {}: cross-chain calls are only available inside an atomic transaction",
                self.chain_id
            ))
        })?;
        if request.from_chain_id != self.chain_id {
            return Err(CoordinatorError::ChainMismatch {
                requested: request.from_chain_id,
                resolved: self.chain_id.clone(),
            });
        }
        CrossChainCallProtocol::call(coordination, request).await
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("chain_id", &self.chain_id)
            .field("height", &self.header.height)
            .field("read_only", &self.read_only)
            .field("coordinated", &self.coordination.is_some())
            .finish()
    }
}
