//! Coordination service handed to every chain instance

use super::atomic::AtomicTransactionProtocol;
use super::context::CoordinationContext;
use super::crosschain::CrossChainCallProtocol;
use crate::chain::{ChainRegistry, TxRouter};
use crate::config::CoordinationConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::events::EventManager;
use crate::execution::BranchedExecutor;
use crate::shutdown::Shutdown;
use crate::types::{AtomicTxRequest, AtomicTxResult, ChainId, CrossCallRequest, CrossCallResponse};

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

/// Multi-chain coordination engine
pub struct CoordinationEngine {
    /// Registered chain instances
    registry: Arc<ChainRegistry>,
    /// Branch/commit executor shared by all chains
    executor: Arc<BranchedExecutor>,
    atomic: AtomicTransactionProtocol,
    /// Root cancellation scope; every coordination context hangs off it
    shutdown: Shutdown,
}

impl CoordinationEngine {
    pub fn new(
        registry: Arc<ChainRegistry>,
        router: Arc<dyn TxRouter>,
        config: &CoordinationConfig,
        shutdown: Shutdown,
    ) -> Self {
        let executor = Arc::new(BranchedExecutor::new(registry.clone(), config.lock_scope));
        let cross_chain = Arc::new(CrossChainCallProtocol::new(executor.clone()));
        let atomic = AtomicTransactionProtocol::new(executor.clone(), router, cross_chain);

        info!(
            chains = registry.len(),
            lock_scope = ?config.lock_scope,
            "Coordination engine initialized"
        );

        Self {
            registry,
            executor,
            atomic,
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<ChainRegistry> {
        &self.registry
    }

    pub fn executor(&self) -> &Arc<BranchedExecutor> {
        &self.executor
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Fresh coordination context under the engine's root scope
    pub fn new_context(&self) -> Arc<CoordinationContext> {
        CoordinationContext::new(&self.shutdown)
    }

    /// Run one participant's side of an atomic transaction
    pub async fn execute_atomic_transaction(
        &self,
        coordination: &Arc<CoordinationContext>,
        chain_id: &ChainId,
        request: &AtomicTxRequest,
        events: &EventManager,
    ) -> CoordinatorResult<AtomicTxResult> {
        self.atomic.execute(coordination, chain_id, request, events).await
    }

    /// Make a cross-chain call from inside a running atomic transaction
    pub async fn execute_cross_chain_call(
        &self,
        coordination: &Arc<CoordinationContext>,
        request: CrossCallRequest,
    ) -> CoordinatorResult<CrossCallResponse> {
        CrossChainCallProtocol::call(coordination, request).await
    }

    /// Run every participant of `request` concurrently on one fresh context.
    ///
    /// Returns each chain's result vector; the first failing participant's
    /// error otherwise. The context is torn down before returning.
    pub async fn broadcast_atomic_transaction(
        self: &Arc<Self>,
        request: AtomicTxRequest,
    ) -> CoordinatorResult<BTreeMap<ChainId, AtomicTxResult>> {
        request.validate_participants(&request.leader_chain_id)?;
        for participant in &request.chain_ids {
            self.atomic.validate(participant, &request)?;
        }

        let coordination = self.new_context();
        let request = Arc::new(request);
        info!(
            context = %coordination.id(),
            atomic_txhash = %hex::encode(request.hash()),
            participants = request.chain_ids.len(),
            "Broadcasting atomic transaction"
        );

        let runs = request.chain_ids.iter().cloned().map(|chain_id| {
            let engine = self.clone();
            let coordination = coordination.clone();
            let request = request.clone();
            tokio::spawn(async move {
                let events = EventManager::new();
                let outcome = engine
                    .execute_atomic_transaction(&coordination, &chain_id, &request, &events)
                    .await;
                (chain_id, outcome)
            })
        });
        let joined = futures::future::join_all(runs).await;
        coordination.cancel();

        let mut results = BTreeMap::new();
        for run in joined {
            let (chain_id, outcome) = run.map_err(|e| {
                error!("Atomic transaction task failed: {}", e);
                CoordinatorError::Internal(format!("participant task failed: {}", e))
            })?;
            results.insert(chain_id, outcome?);
        }
        Ok(results)
    }

    /// Seal a block on every registered chain
    pub fn commit_blocks(&self) -> BTreeMap<ChainId, u64> {
        self.registry
            .chain_ids()
            .into_iter()
            .filter_map(|chain_id| {
                let handle = self.registry.resolve(&chain_id).ok()?;
                Some((chain_id, handle.commit_block()))
            })
            .collect()
    }

    /// Cancel the root scope, aborting every in-flight coordination
    pub fn stop(&self) {
        info!("Stopping coordination engine");
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{
        ledger::{CODE_INSUFFICIENT_FUNDS, MARKER_STORE, REMOTE_STORE},
        ChainHandle, EnvelopeRouter, KvStore, LedgerApp, MultiStore, SubTxEnvelope,
    };
    use crate::config::LockScope;
    use crate::types::ExecTxResult;
    use chrono::Utc;
    use serde_json::json;
    use tokio::time::{timeout, Duration};

    fn engine(chains: &[&str], lock_scope: LockScope) -> Arc<CoordinationEngine> {
        let registry = ChainRegistry::new();
        for id in chains {
            let store = Arc::new(MultiStore::new());
            LedgerApp::new().seed(&store, &BTreeMap::from([("alice".to_string(), 100u64)]));
            store.init_genesis(1, Utc::now());
            registry.register(Arc::new(ChainHandle::new(
                ChainId::from(*id),
                *id,
                store,
                Arc::new(LedgerApp::new()),
            )));
        }
        Arc::new(CoordinationEngine::new(
            Arc::new(registry),
            Arc::new(EnvelopeRouter),
            &CoordinationConfig { lock_scope },
            Shutdown::new(),
        ))
    }

    fn subtx(chain: &str, body: serde_json::Value) -> Vec<u8> {
        SubTxEnvelope::new(chain, body).encode()
    }

    fn ids(ids: &[&str]) -> Vec<ChainId> {
        ids.iter().map(|id| ChainId::from(*id)).collect()
    }

    fn store(engine: &CoordinationEngine, id: &str) -> Arc<MultiStore> {
        engine.registry().resolve(&id.into()).unwrap().store().clone()
    }

    fn balance(engine: &CoordinationEngine, id: &str, account: &str) -> u64 {
        LedgerApp::balance_of(store(engine, id).as_ref(), account)
    }

    #[tokio::test]
    async fn test_single_chain_matches_direct_delivery() {
        let engine = engine(&["x", "direct"], LockScope::PerChain);
        let op = json!({"op": "debit", "account": "alice", "amount": 30});

        let coordination = engine.new_context();
        let events = EventManager::new();
        let request = AtomicTxRequest::new(vec![subtx("x", op.clone())], ids(&["x"]), "x".into());
        let atomic = engine
            .execute_atomic_transaction(&coordination, &"x".into(), &request, &events)
            .await
            .unwrap();

        let app = LedgerApp::new();
        let raw = subtx("direct", op);
        let direct = engine
            .executor()
            .execute(None, crate::types::ExecutionHeight::latest(), &"direct".into(), |ctx| async move {
                Ok(crate::chain::ChainApp::deliver_sub_transaction(&app, &ctx, &raw).await)
            })
            .await
            .unwrap();

        let slot = atomic.get(0).unwrap();
        assert_eq!(slot.code, direct.code);
        assert_eq!(slot.data, direct.data);
        assert_eq!(slot.events, direct.events);
        assert_eq!(events.events(), direct.events);
        assert_eq!(balance(&engine, "x", "alice"), balance(&engine, "direct", "alice"));
        assert_eq!(coordination.channel_count(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_two_chain_transfer_agrees_on_both_sides() {
        let engine = engine(&["x", "y"], LockScope::PerChain);
        let request = AtomicTxRequest::new(
            vec![
                subtx("x", json!({"op": "debit", "account": "alice", "amount": 30})),
                subtx("y", json!({"op": "credit", "account": "alice", "amount": 30})),
            ],
            ids(&["x", "y"]),
            "x".into(),
        );

        let results = timeout(Duration::from_secs(5), engine.broadcast_atomic_transaction(request))
            .await
            .unwrap()
            .unwrap();

        let x = &results[&ChainId::from("x")];
        let y = &results[&ChainId::from("y")];
        assert_eq!(x, y);
        assert!(x.is_complete());
        assert!(x.all_succeeded());
        assert_eq!(balance(&engine, "x", "alice"), 70);
        assert_eq!(balance(&engine, "y", "alice"), 130);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_joined_participants_agree_and_leave_channels_empty() {
        let engine = engine(&["x", "y"], LockScope::PerChain);
        let coordination = engine.new_context();
        let request = AtomicTxRequest::new(
            vec![
                subtx("x", json!({"op": "debit", "account": "alice", "amount": 1})),
                subtx("y", json!({"op": "credit", "account": "alice", "amount": 1})),
            ],
            ids(&["x", "y"]),
            "y".into(),
        );
        let (x_id, y_id) = (ChainId::from("x"), ChainId::from("y"));
        let (x_events, y_events) = (EventManager::new(), EventManager::new());

        let (x, y) = timeout(Duration::from_secs(5), async {
            tokio::join!(
                engine.execute_atomic_transaction(&coordination, &x_id, &request, &x_events),
                engine.execute_atomic_transaction(&coordination, &y_id, &request, &y_events),
            )
        })
        .await
        .unwrap();

        assert_eq!(x.unwrap(), y.unwrap());
        assert!(coordination.result_channel(&x_id).try_recv().is_none());
        assert!(coordination.result_channel(&y_id).try_recv().is_none());
        assert_eq!(x_events.events()[0].ty, "debit");
        assert_eq!(y_events.events()[0].ty, "credit");
        assert!(coordination.current_atomic_tx_hash().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_local_result_is_published_exactly_once() {
        let engine = engine(&["x", "y"], LockScope::PerChain);
        let coordination = engine.new_context();
        let request = AtomicTxRequest::new(
            vec![
                subtx("x", json!({"op": "debit", "account": "alice", "amount": 2})),
                subtx("y", json!({"op": "credit", "account": "alice", "amount": 2})),
            ],
            ids(&["x", "y"]),
            "x".into(),
        );
        let (x_id, y_id) = (ChainId::from("x"), ChainId::from("y"));

        let x_side = {
            let engine = engine.clone();
            let coordination = coordination.clone();
            let request = request.clone();
            let x_id = x_id.clone();
            tokio::spawn(async move {
                engine
                    .execute_atomic_transaction(&coordination, &x_id, &request, &EventManager::new())
                    .await
            })
        };

        // play chain y by hand: read x's snapshot, then answer with slot 1
        let published = timeout(Duration::from_secs(2), coordination.result_channel(&x_id).recv())
            .await
            .unwrap()
            .unwrap();
        assert!(published.get(0).unwrap().is_ok());
        assert!(published.get(1).is_none());

        let mut answer = published.clone();
        answer.set(1, ExecTxResult::success(b"102".to_vec(), Vec::new()));
        coordination.result_channel(&y_id).try_send(answer.clone()).unwrap();

        let x = timeout(Duration::from_secs(2), x_side).await.unwrap().unwrap().unwrap();
        assert_eq!(x, answer);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(coordination.result_channel(&x_id).try_recv().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_sub_transaction_fills_slot_without_commit() {
        let engine = engine(&["x", "y"], LockScope::PerChain);
        let x_root = store(&engine, "x").root_hash();
        let request = AtomicTxRequest::new(
            vec![
                subtx("x", json!({"op": "debit", "account": "alice", "amount": 1000})),
                subtx("y", json!({"op": "credit", "account": "bob", "amount": 5})),
            ],
            ids(&["x", "y"]),
            "y".into(),
        );

        let results = timeout(Duration::from_secs(5), engine.broadcast_atomic_transaction(request))
            .await
            .unwrap()
            .unwrap();

        for result in results.values() {
            assert_eq!(result.get(0).unwrap().code, CODE_INSUFFICIENT_FUNDS);
            assert!(result.get(1).unwrap().is_ok());
        }
        assert_eq!(store(&engine, "x").root_hash(), x_root);
        assert_eq!(balance(&engine, "y", "bob"), 5);
    }

    #[tokio::test]
    async fn test_too_many_participants_creates_no_channels() {
        let engine = engine(&["x", "y", "z"], LockScope::PerChain);
        let coordination = engine.new_context();
        let request = AtomicTxRequest::new(
            vec![subtx("x", json!({"op": "credit", "account": "a", "amount": 1}))],
            ids(&["x", "y", "z"]),
            "x".into(),
        );

        let err = engine
            .execute_atomic_transaction(&coordination, &"x".into(), &request, &EventManager::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::TooManyParticipants { count: 3, .. }));
        assert_eq!(coordination.channel_count(), 0);

        let err = engine.broadcast_atomic_transaction(request).await.unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_leader_outside_set_is_rejected() {
        let engine = engine(&["x", "y"], LockScope::PerChain);
        let coordination = engine.new_context();
        let request = AtomicTxRequest::new(
            vec![subtx("x", json!({"op": "credit", "account": "a", "amount": 1}))],
            ids(&["x"]),
            "y".into(),
        );

        let err = engine
            .execute_atomic_transaction(&coordination, &"x".into(), &request, &EventManager::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::LeaderNotInSet { .. }));
        assert_eq!(coordination.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_root_cancellation_aborts_waiting_participant() {
        let engine = engine(&["x", "y"], LockScope::PerChain);
        let coordination = engine.new_context();
        let request = AtomicTxRequest::new(
            vec![subtx("y", json!({"op": "credit", "account": "a", "amount": 1}))],
            ids(&["x", "y"]),
            "x".into(),
        );

        let waiting = {
            let engine = engine.clone();
            let coordination = coordination.clone();
            tokio::spawn(async move {
                engine
                    .execute_atomic_transaction(&coordination, &"x".into(), &request, &EventManager::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.stop();

        let outcome = timeout(Duration::from_secs(1), waiting).await.unwrap().unwrap();
        assert!(matches!(outcome, Err(e) if e.is_aborted()));
        assert!(coordination.is_cancelled());
        assert_eq!(balance(&engine, "y", "a"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_read_only_cross_call_leaves_target_untouched() {
        let engine = engine(&["x", "y"], LockScope::PerChain);
        let y_root = store(&engine, "y").root_hash();
        let request = AtomicTxRequest::new(
            vec![subtx(
                "x",
                json!({
                    "op": "call_remote",
                    "chain_id": "y",
                    "contract": "ledger",
                    "sender": "alice",
                    "payload": {"method": "mark", "key": "seen"},
                    "is_query": true,
                    "timeout_ms": 2000,
                    "store_as": "mark"
                }),
            )],
            ids(&["x", "y"]),
            "x".into(),
        );

        let results = timeout(Duration::from_secs(5), engine.broadcast_atomic_transaction(request))
            .await
            .unwrap()
            .unwrap();

        assert!(results.values().all(AtomicTxResult::all_succeeded));
        assert_eq!(store(&engine, "y").root_hash(), y_root);
        assert!(store(&engine, "y").get(MARKER_STORE, b"seen").is_none());
        assert_eq!(
            store(&engine, "x").get(REMOTE_STORE, b"mark"),
            Some(b"marked".to_vec())
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cross_calls_then_remote_sub_transaction() {
        let engine = engine(&["x", "y"], LockScope::PerChain);
        let call = |amount: u64| {
            json!({
                "op": "call_remote",
                "chain_id": "y",
                "contract": "ledger",
                "sender": "alice",
                "payload": {"method": "credit", "account": "carol", "amount": amount},
                "is_query": false,
                "timeout_ms": 2000,
                "store_as": null
            })
        };
        let request = AtomicTxRequest::new(
            vec![
                subtx("x", call(3)),
                subtx("x", call(4)),
                subtx("y", json!({"op": "debit", "account": "carol", "amount": 7})),
            ],
            ids(&["x", "y"]),
            "x".into(),
        );

        let results = timeout(Duration::from_secs(5), engine.broadcast_atomic_transaction(request))
            .await
            .unwrap()
            .unwrap();

        let x = &results[&ChainId::from("x")];
        assert!(x.all_succeeded());
        assert_eq!(x, &results[&ChainId::from("y")]);
        assert_eq!(x.get(0).unwrap().data, b"3".to_vec());
        assert_eq!(x.get(1).unwrap().data, b"7".to_vec());
        assert_eq!(balance(&engine, "y", "carol"), 0);
    }

    #[tokio::test]
    async fn test_cross_call_outside_atomic_tx_is_an_error_response() {
        let engine = engine(&["x", "y"], LockScope::PerChain);
        let coordination = engine.new_context();
        let response = engine
            .execute_cross_chain_call(
                &coordination,
                CrossCallRequest {
                    from_chain_id: "x".into(),
                    from: "alice".to_string(),
                    to_chain_id: "y".into(),
                    to: "ledger".to_string(),
                    payload: b"{}".to_vec(),
                    is_query: true,
                    timeout_ms: 100,
                },
            )
            .await
            .unwrap();
        assert!(!response.is_ok());
    }

    #[tokio::test]
    async fn test_commit_blocks_advances_every_chain() {
        let engine = engine(&["x", "y"], LockScope::Global);
        let heights = engine.commit_blocks();
        assert_eq!(heights.len(), 2);
        assert!(heights.values().all(|h| *h == 2));
    }
}
