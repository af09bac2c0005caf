//! Chain module - the chain instances colocated in this process
//!
//! This module provides:
//! - The process-wide registry from chain identifier to chain handle
//! - Committed multi-stores and copy-on-write branches
//! - The narrow interfaces to the application state machine (`ChainApp`)
//!   and to the transaction codec (`TxRouter`)
//! - A reference ledger application and a JSON envelope router

pub mod ledger;
pub mod router;
pub mod store;

pub use ledger::LedgerApp;
pub use router::{EnvelopeRouter, SubTxEnvelope};
pub use store::{BlockHeader, BranchedState, CommitInfo, KvStore, MultiStore};

use crate::config::Settings;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::execution::ExecutionContext;
use crate::types::{ChainId, ExecTxResult, ExecutionHeight};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Application state machine of one chain
#[async_trait]
pub trait ChainApp: Send + Sync {
    /// Fully execute a raw sub-transaction against the branch in `ctx`, events included.
    /// Failures are reported through the result code, never as an error.
    async fn deliver_sub_transaction(&self, ctx: &ExecutionContext, raw: &[u8]) -> ExecTxResult;

    /// Invoke a contract entry point on behalf of another chain
    async fn invoke_entry_point(
        &self,
        ctx: &ExecutionContext,
        contract: &str,
        sender: &str,
        payload: &[u8],
        read_only: bool,
    ) -> CoordinatorResult<Vec<u8>>;
}

/// Extracts the declared target chain of a raw sub-transaction
#[cfg_attr(test, mockall::automock)]
pub trait TxRouter: Send + Sync {
    fn route_of(&self, raw: &[u8]) -> CoordinatorResult<ChainId>;
}

/// Handle to one chain instance
pub struct ChainHandle {
    chain_id: ChainId,
    name: String,
    store: Arc<MultiStore>,
    app: Arc<dyn ChainApp>,
}

impl ChainHandle {
    pub fn new(
        chain_id: ChainId,
        name: impl Into<String>,
        store: Arc<MultiStore>,
        app: Arc<dyn ChainApp>,
    ) -> Self {
        Self {
            chain_id,
            name: name.into(),
            store,
            app,
        }
    }

    pub fn chain_id(&self) -> &ChainId {
        &self.chain_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<MultiStore> {
        &self.store
    }

    pub fn app(&self) -> &Arc<dyn ChainApp> {
        &self.app
    }

    pub fn latest_height(&self) -> u64 {
        self.store.latest_height()
    }

    /// Header for an execution at `height`: current time on the latest
    /// height, the recorded commit time when replaying an older one
    pub fn header_at(&self, height: ExecutionHeight) -> CoordinatorResult<BlockHeader> {
        let latest = self.store.latest_height();
        if latest == 0 {
            return Err(CoordinatorError::ChainNotReady {
                chain_id: self.chain_id.clone(),
            });
        }
        let resolved = height.resolve(latest)?;
        let commit = self.store.commit_info(resolved);

        let time = match (&commit, resolved == latest) {
            (Some(info), false) => info.timestamp,
            _ => Utc::now(),
        };

        Ok(BlockHeader {
            chain_id: self.chain_id.clone(),
            height: resolved,
            time,
            app_hash: commit.map(|c| c.app_hash).unwrap_or_default(),
        })
    }

    /// Branch the committed multi-store for an execution at `height`
    pub fn branch_state(
        &self,
        height: ExecutionHeight,
    ) -> CoordinatorResult<(Arc<BranchedState>, BlockHeader)> {
        let header = self.header_at(height)?;
        let state = Arc::new(BranchedState::new(self.store.clone()));
        Ok((state, header))
    }

    /// Seal the current contents as a new block
    pub fn commit_block(&self) -> u64 {
        let info = self.store.commit_block(Utc::now());
        crate::metrics::record_chain_height(&self.chain_id, info.height);
        debug!(chain_id = %self.chain_id, height = info.height, "Committed block");
        info.height
    }
}

impl std::fmt::Debug for ChainHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainHandle")
            .field("chain_id", &self.chain_id)
            .field("name", &self.name)
            .field("height", &self.latest_height())
            .finish()
    }
}

/// Process-wide map from chain identifier to chain handle
#[derive(Default)]
pub struct ChainRegistry {
    chains: DashMap<ChainId, Arc<ChainHandle>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one ledger chain per enabled chain in the settings
    pub fn from_settings(settings: &Settings) -> CoordinatorResult<Self> {
        let registry = Self::new();

        for (name, chain_config) in settings.enabled_chains() {
            let chain_id = ChainId::new(chain_config.chain_id.clone());
            let store = Arc::new(MultiStore::new());
            let app = LedgerApp::new();
            app.seed(&store, &chain_config.accounts);
            store.init_genesis(chain_config.genesis_height, Utc::now());

            info!(
                "Initializing chain {} (ID: {}) at height {}",
                name, chain_id, chain_config.genesis_height
            );
            crate::metrics::record_chain_height(&chain_id, chain_config.genesis_height);

            registry.register(Arc::new(ChainHandle::new(
                chain_id,
                chain_config.name.clone(),
                store,
                Arc::new(app),
            )));
        }

        if registry.is_empty() {
            return Err(CoordinatorError::Config(
                "no enabled chains configured".to_string(),
            ));
        }
        Ok(registry)
    }

    pub fn register(&self, handle: Arc<ChainHandle>) {
        self.chains.insert(handle.chain_id().clone(), handle);
    }

    /// Register a handle under an explicit key
    pub fn register_as(&self, chain_id: ChainId, handle: Arc<ChainHandle>) {
        self.chains.insert(chain_id, handle);
    }

    pub fn resolve(&self, chain_id: &ChainId) -> CoordinatorResult<Arc<ChainHandle>> {
        self.chains
            .get(chain_id)
            .map(|h| h.clone())
            .ok_or_else(|| CoordinatorError::ChainNotFound {
                chain_id: chain_id.clone(),
            })
    }

    pub fn contains(&self, chain_id: &ChainId) -> bool {
        self.chains.contains_key(chain_id)
    }

    /// Registered chain identifiers, sorted
    pub fn chain_ids(&self) -> Vec<ChainId> {
        let mut ids: Vec<_> = self.chains.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: &str, height: u64) -> Arc<ChainHandle> {
        let store = Arc::new(MultiStore::new());
        store.init_genesis(height, Utc::now());
        Arc::new(ChainHandle::new(
            ChainId::from(id),
            id,
            store,
            Arc::new(LedgerApp::new()),
        ))
    }

    #[test]
    fn test_resolve() {
        let registry = ChainRegistry::new();
        registry.register(handle("x", 1));

        assert_eq!(registry.resolve(&"x".into()).unwrap().chain_id().as_str(), "x");
        assert!(matches!(
            registry.resolve(&"y".into()),
            Err(CoordinatorError::ChainNotFound { .. })
        ));
        assert_eq!(registry.chain_ids(), vec![ChainId::from("x")]);
    }

    #[test]
    fn test_branch_state_requires_first_block() {
        let chain = handle("x", 0);
        assert!(matches!(
            chain.branch_state(ExecutionHeight::latest()),
            Err(CoordinatorError::ChainNotReady { .. })
        ));
    }

    #[test]
    fn test_replay_header_uses_commit_time() {
        let chain = handle("x", 3);
        let recorded = chain.store().commit_info(2).unwrap().timestamp;
        chain.commit_block();

        let replay = chain.header_at(ExecutionHeight::at(2)).unwrap();
        assert_eq!(replay.height, 2);
        assert_eq!(replay.time, recorded);

        let latest = chain.header_at(ExecutionHeight::latest()).unwrap();
        assert_eq!(latest.height, 4);
        assert_eq!(latest.chain_id.as_str(), "x");
    }
}
