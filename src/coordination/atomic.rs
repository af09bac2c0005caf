//! Atomic multi-chain transaction protocol
//!
//! Every participating chain runs the same atomic transaction concurrently,
//! sharing one coordination context. Sub-transactions are processed in order.
//! A chain executes the sub-transactions routed to itself, publishes its
//! updated result vector on its own result channel, and for sub-transactions
//! routed elsewhere waits on the target chain's result channel and copies the
//! slot. While it runs, each chain also serves cross-chain calls aimed at it.

use super::context::{CoordinationContext, Rendezvous, RendezvousError};
use super::crosschain::CrossChainCallProtocol;
use crate::chain::{ChainRegistry, TxRouter};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::events::EventManager;
use crate::execution::BranchedExecutor;
use crate::types::{AtomicTxRequest, AtomicTxResult, ChainId, ExecTxResult, ExecutionHeight};

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Result code for sub-transactions the executor could not run at all
pub const CODE_EXECUTION_FAILED: u32 = 1;
pub const CODESPACE: &str = "multichain";

pub struct AtomicTransactionProtocol {
    registry: Arc<ChainRegistry>,
    executor: Arc<BranchedExecutor>,
    router: Arc<dyn TxRouter>,
    cross_chain: Arc<CrossChainCallProtocol>,
}

impl AtomicTransactionProtocol {
    pub fn new(
        executor: Arc<BranchedExecutor>,
        router: Arc<dyn TxRouter>,
        cross_chain: Arc<CrossChainCallProtocol>,
    ) -> Self {
        Self {
            registry: executor.registry().clone(),
            executor,
            router,
            cross_chain,
        }
    }

    /// Run `request` as participant `chain_id`.
    ///
    /// Returns the complete result vector, identical on every participant,
    /// or `Aborted` when the coordination context closes first. Events from
    /// locally executed sub-transactions are re-emitted on `events`.
    pub async fn execute(
        &self,
        coordination: &Arc<CoordinationContext>,
        chain_id: &ChainId,
        request: &AtomicTxRequest,
        events: &EventManager,
    ) -> CoordinatorResult<AtomicTxResult> {
        let routes = match self.validate(chain_id, request) {
            Ok(routes) => routes,
            Err(e) => {
                warn!(chain_id = %chain_id, error = %e, "Rejected atomic transaction");
                crate::metrics::record_atomic_tx(chain_id, "rejected");
                return Err(e);
            }
        };

        let hash = request.hash();
        let atomic_txhash = hex::encode(hash);
        info!(
            chain_id = %chain_id,
            atomic_txhash = %atomic_txhash,
            txs = request.txs.len(),
            leader = %request.leader_chain_id,
            "Executing atomic transaction"
        );

        coordination.begin_atomic_tx(hash, &request.chain_ids)?;
        let outcome = self
            .run(coordination, chain_id, request, &routes, events)
            .await;
        coordination.end_atomic_tx();

        match &outcome {
            Ok(result) => {
                let label = if result.all_succeeded() { "success" } else { "failed" };
                info!(
                    chain_id = %chain_id,
                    atomic_txhash = %atomic_txhash,
                    outcome = label,
                    "Executed atomic transaction"
                );
                crate::metrics::record_atomic_tx(chain_id, label);
            }
            Err(e) if e.is_aborted() => {
                info!(chain_id = %chain_id, atomic_txhash = %atomic_txhash, "Atomic transaction aborted");
                crate::metrics::record_atomic_tx(chain_id, "aborted");
            }
            Err(e) => {
                warn!(chain_id = %chain_id, atomic_txhash = %atomic_txhash, error = %e, "Atomic transaction failed");
                crate::metrics::record_atomic_tx(chain_id, "error");
            }
        }
        outcome
    }

    /// Boundary checks; nothing here touches the coordination context.
    ///
    /// Returns the target chain of every sub-transaction.
    pub fn validate(&self, chain_id: &ChainId, request: &AtomicTxRequest) -> CoordinatorResult<Vec<ChainId>> {
        request.validate_participants(chain_id)?;
        for participant in &request.chain_ids {
            self.registry.resolve(participant)?;
        }

        request
            .txs
            .iter()
            .enumerate()
            .map(|(index, raw)| {
                let target = self.router.route_of(raw)?;
                if !request.chain_ids.contains(&target) {
                    return Err(CoordinatorError::RouteResolutionFailure {
                        index,
                        message: format!("target chain {} is not a participant", target),
                    });
                }
                Ok(target)
            })
            .collect()
    }

    async fn run(
        &self,
        coordination: &Arc<CoordinationContext>,
        chain_id: &ChainId,
        request: &AtomicTxRequest,
        routes: &[ChainId],
        events: &EventManager,
    ) -> CoordinatorResult<AtomicTxResult> {
        let own_results = coordination.result_channel(chain_id);
        coordination.inbound_call_channel(chain_id);
        coordination.outbound_call_channel(chain_id);

        let server_stop = coordination.scope().child();
        {
            let cross_chain = self.cross_chain.clone();
            let coordination = coordination.clone();
            let chain_id = chain_id.clone();
            let stop = server_stop.clone();
            tokio::spawn(async move { cross_chain.serve(coordination, chain_id, stop).await });
        }

        let has_peers = request.chain_ids.iter().any(|c| c != chain_id);
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        if has_peers {
            tokio::spawn(publish_results(chain_id.clone(), own_results, publish_rx));
        }

        let outcome = self
            .process(coordination, chain_id, request, routes, events, has_peers.then_some(&publish_tx))
            .await;

        server_stop.cancel();
        outcome
    }

    async fn process(
        &self,
        coordination: &Arc<CoordinationContext>,
        chain_id: &ChainId,
        request: &AtomicTxRequest,
        routes: &[ChainId],
        events: &EventManager,
        publisher: Option<&mpsc::UnboundedSender<AtomicTxResult>>,
    ) -> CoordinatorResult<AtomicTxResult> {
        let mut response = AtomicTxResult::with_slots(request.txs.len());

        for (index, (raw, target)) in request.txs.iter().zip(routes).enumerate() {
            coordination.set_sub_tx_index(chain_id, index);

            if target == chain_id {
                let result = self.execute_local(coordination, chain_id, raw).await?;
                debug!(
                    chain_id = %chain_id,
                    subtx = index,
                    code = result.code,
                    "Executed sub-transaction"
                );
                events.emit_all(result.events.clone());
                crate::metrics::record_sub_tx(chain_id, result.is_ok());
                response.set(index, result);

                if let Some(publisher) = publisher {
                    // the publisher only goes away once the context is closing
                    let _ = publisher.send(response.clone());
                }
                continue;
            }

            debug!(chain_id = %chain_id, subtx = index, target = %target, "Waiting for sub-transaction result");
            let started = Instant::now();
            let remote = coordination
                .result_channel(target)
                .recv()
                .await
                .ok_or_else(|| {
                    info!(chain_id = %chain_id, subtx = index, "Stopping atomic transaction: coordination context closing");
                    CoordinatorError::aborted("atomic transaction")
                })?;
            crate::metrics::record_remote_wait(chain_id, started.elapsed().as_secs_f64());

            let slot = remote.get(index).cloned().ok_or_else(|| {
                CoordinatorError::AtomicTxMismatch(format!(
                    "result from chain {} is missing sub-transaction {}",
                    target, index
                ))
            })?;
            debug!(chain_id = %chain_id, subtx = index, source = %target, code = slot.code, "Received sub-transaction result");
            response.set(index, slot);
        }

        Ok(response)
    }

    /// Deliver one sub-transaction on this chain.
    ///
    /// A failed delivery discards its branch but still produces a result for
    /// the slot. Only cancellation of the context escapes as an error.
    async fn execute_local(
        &self,
        coordination: &Arc<CoordinationContext>,
        chain_id: &ChainId,
        raw: &[u8],
    ) -> CoordinatorResult<ExecTxResult> {
        let app = self.registry.resolve(chain_id)?.app().clone();
        let raw = raw.to_vec();

        let outcome = self
            .executor
            .execute(
                Some(coordination.clone()),
                ExecutionHeight::latest(),
                chain_id,
                move |ctx| async move {
                    let result = app.deliver_sub_transaction(&ctx, &raw).await;
                    if result.is_ok() {
                        Ok(result)
                    } else {
                        Err(CoordinatorError::SubTransactionFailed(result))
                    }
                },
            )
            .await;

        match outcome {
            Ok(result) => Ok(result),
            Err(CoordinatorError::SubTransactionFailed(result)) => Ok(result),
            Err(e) if e.is_aborted() => Err(e),
            Err(e) => {
                let mut result = ExecTxResult::failure(CODE_EXECUTION_FAILED, e.to_string());
                result.codespace = CODESPACE.to_string();
                Ok(result)
            }
        }
    }
}

/// Forward result snapshots into this chain's result channel, one per
/// locally executed sub-transaction, in order
async fn publish_results(
    chain_id: ChainId,
    channel: Arc<Rendezvous<AtomicTxResult>>,
    mut snapshots: mpsc::UnboundedReceiver<AtomicTxResult>,
) {
    while let Some(snapshot) = snapshots.recv().await {
        match channel.send(snapshot).await {
            Ok(()) => {}
            Err(RendezvousError::Closed) | Err(RendezvousError::Occupied) => {
                debug!(chain_id = %chain_id, "Result channel closed, dropping remaining results");
                break;
            }
        }
    }
}
