//! Cross-chain calls between chains taking part in one atomic transaction
//!
//! The caller pushes an indexed request on the target chain's inbound-call
//! channel and blocks on its outbound-call channel. The target chain's
//! atomic-transaction run serves those requests from a concurrent task.
//! Failures on the serving side travel back as the response's error string.

use super::context::{CoordinationContext, RendezvousError};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::execution::BranchedExecutor;
use crate::shutdown::Shutdown;
use crate::types::{
    ChainId, CrossCallRequest, CrossCallResponse, ExecutionHeight, IndexedCrossCallRequest,
    IndexedCrossCallResponse,
};

use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const TIMEOUT_ERROR: &str = "crosschain call timeout";

pub struct CrossChainCallProtocol {
    executor: Arc<BranchedExecutor>,
}

impl CrossChainCallProtocol {
    pub fn new(executor: Arc<BranchedExecutor>) -> Self {
        Self { executor }
    }

    /// Call a contract on `request.to_chain_id` and wait for its response
    pub async fn call(
        coordination: &Arc<CoordinationContext>,
        request: CrossCallRequest,
    ) -> CoordinatorResult<CrossCallResponse> {
        if request.timeout_ms == 0 {
            return Ok(CrossCallResponse::err(format!(
                "cross-chain tx invalid timeout {}",
                request.timeout_ms
            )));
        }
        if coordination.current_atomic_tx_hash().is_none() {
            return Ok(CrossCallResponse::err(format!(
                "current atomic tx not set: cannot execute cross call on chain_id {}",
                request.to_chain_id
            )));
        }
        if request.to_chain_id == request.from_chain_id {
            return Ok(CrossCallResponse::err(format!(
                "cross call from chain {} to itself",
                request.from_chain_id
            )));
        }
        if !coordination
            .current_atomic_tx_chain_ids()
            .contains(&request.to_chain_id)
        {
            return Ok(CrossCallResponse::err(format!(
                "atomic tx with unauthorized chain id: {}",
                request.to_chain_id
            )));
        }

        let from = request.from_chain_id.clone();
        let to = request.to_chain_id.clone();
        let kind = if request.is_query { "query" } else { "execute" };
        let timeout = Duration::from_millis(request.timeout_ms);
        let sub_tx = coordination.sub_tx_index(&from);
        let index = coordination.next_cross_call_index(&from);

        info!(
            from_chain_id = %from,
            from = %request.from,
            to_chain_id = %to,
            to = %request.to,
            is_query = request.is_query,
            subtx = sub_tx,
            subtx_call = coordination.sub_tx_call_count(&from),
            crosschaincall_index = index,
            ?timeout,
            "Executing crosschain call"
        );

        let inbound = coordination.inbound_call_channel(&to);
        let outbound = coordination.outbound_call_channel(&to);

        match inbound.try_send(IndexedCrossCallRequest { index, request }) {
            Ok(()) => {}
            Err(RendezvousError::Occupied) => {
                return Err(CoordinatorError::CrossCallOutstanding { chain_id: to })
            }
            Err(RendezvousError::Closed) => {
                return Err(CoordinatorError::aborted("crosschain call request"))
            }
        }

        let started = Instant::now();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                response = outbound.recv() => match response {
                    Some(response) if response.index == index => {
                        debug!(
                            subtx = sub_tx,
                            crosschaincall_index = index,
                            response_data = %hex::encode(&response.response.data),
                            response_error = ?response.response.error,
                            "Executed crosschain call"
                        );
                        crate::metrics::record_cross_call(&from, &to, kind, started.elapsed().as_secs_f64());
                        return Ok(response.response);
                    }
                    Some(stale) => {
                        warn!(
                            expected = index,
                            received = stale.index,
                            "Dropping stale crosschain call response"
                        );
                    }
                    None => {
                        info!(subtx = sub_tx, crosschaincall_index = index, "Stopping crosschain call: coordination context closing");
                        return Err(CoordinatorError::aborted("crosschain call response"));
                    }
                },
                _ = &mut deadline => {
                    info!(subtx = sub_tx, crosschaincall_index = index, "Stopping crosschain call: timeout");
                    // withdraw the request if the target never picked it up
                    let _ = inbound.try_recv();
                    crate::metrics::record_cross_call(&from, &to, "timeout", started.elapsed().as_secs_f64());
                    return Ok(CrossCallResponse::err(TIMEOUT_ERROR));
                }
            }
        }
    }

    /// Serve inbound calls for `chain_id` until `stop` fires or the context closes
    pub async fn serve(
        &self,
        coordination: Arc<CoordinationContext>,
        chain_id: ChainId,
        stop: Shutdown,
    ) {
        let inbound = coordination.inbound_call_channel(&chain_id);
        let outbound = coordination.outbound_call_channel(&chain_id);
        let atomic_txhash = coordination
            .current_atomic_tx_hash()
            .map(hex::encode)
            .unwrap_or_default();

        loop {
            let call = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                call = inbound.recv() => match call {
                    Some(call) => call,
                    None => break,
                },
            };

            info!(
                chain_id = %chain_id,
                atomic_txhash = %atomic_txhash,
                index = call.index,
                is_query = call.request.is_query,
                "Received crosschain internal call"
            );
            let response = self.handle(&chain_id, &call.request).await;

            info!(
                chain_id = %chain_id,
                atomic_txhash = %atomic_txhash,
                index = call.index,
                is_query = call.request.is_query,
                "Sending crosschain internal call response"
            );
            let indexed = IndexedCrossCallResponse {
                index: call.index,
                response,
            };
            if outbound.send(indexed).await.is_err() {
                debug!(chain_id = %chain_id, "Outbound call channel closed");
                break;
            }
        }
        debug!(chain_id = %chain_id, "Crosschain call server stopped");
    }

    /// Execute one inbound call against this chain's state.
    ///
    /// Queries run on a read-only branch that is always discarded; other
    /// calls run on a normal branch that is committed on success.
    pub async fn handle(&self, chain_id: &ChainId, request: &CrossCallRequest) -> CrossCallResponse {
        match self.invoke(chain_id, request).await {
            Ok(data) => CrossCallResponse::ok(data),
            Err(e) => CrossCallResponse::err(e.to_string()),
        }
    }

    async fn invoke(&self, chain_id: &ChainId, request: &CrossCallRequest) -> CoordinatorResult<Vec<u8>> {
        if &request.to_chain_id != chain_id {
            return Err(CoordinatorError::ChainMismatch {
                requested: request.to_chain_id.clone(),
                resolved: chain_id.clone(),
            });
        }
        let app = self.executor.registry().resolve(chain_id)?.app().clone();
        let contract = request.to.clone();
        let sender = request.from.clone();
        let payload = request.payload.clone();
        let read_only = request.is_query;

        let callback = move |ctx: crate::execution::ExecutionContext| async move {
            app.invoke_entry_point(&ctx, &contract, &sender, &payload, read_only)
                .await
        };

        if read_only {
            self.executor
                .query(None, ExecutionHeight::latest(), chain_id, callback)
                .await
        } else {
            self.executor
                .execute(None, ExecutionHeight::latest(), chain_id, callback)
                .await
        }
    }
}
