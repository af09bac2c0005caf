//! Reference balance ledger
//!
//! A minimal `ChainApp` used by the node binary and the tests. Balances live
//! in the `bank` sub-store as decimal strings. Sub-transaction bodies carry a
//! `LedgerOp`; entry points invoked by other chains carry an `EntryPoint`.

use super::store::MultiStore;
use super::{ChainApp, KvStore, SubTxEnvelope};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::events::Event;
use crate::execution::ExecutionContext;
use crate::types::{ChainId, CrossCallRequest, ExecTxResult};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

pub const BANK_STORE: &str = "bank";
pub const MARKER_STORE: &str = "marker";
pub const REMOTE_STORE: &str = "remote";

/// Contract address the ledger answers to
pub const LEDGER_CONTRACT: &str = "ledger";

pub const CODE_DECODE: u32 = 2;
pub const CODE_WRONG_CHAIN: u32 = 3;
pub const CODE_INSUFFICIENT_FUNDS: u32 = 5;
pub const CODE_CROSS_CALL: u32 = 7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LedgerOp {
    Credit {
        account: String,
        amount: u64,
    },
    Debit {
        account: String,
        amount: u64,
    },
    Transfer {
        from: String,
        to: String,
        amount: u64,
    },
    /// Call a contract on another chain; the response is stored under `store_as`
    CallRemote {
        chain_id: ChainId,
        contract: String,
        sender: String,
        payload: serde_json::Value,
        is_query: bool,
        timeout_ms: u64,
        store_as: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum EntryPoint {
    Balance { account: String },
    Credit { account: String, amount: u64 },
    /// Writes a marker key; used to observe whether a branch was committed
    Mark { key: String },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LedgerApp;

impl LedgerApp {
    pub fn new() -> Self {
        Self
    }

    /// Seed committed balances
    pub fn seed(&self, store: &MultiStore, accounts: &BTreeMap<String, u64>) {
        for (account, amount) in accounts {
            store.set(BANK_STORE, account.as_bytes(), amount.to_string().into_bytes());
        }
    }

    pub fn balance_of(store: &dyn KvStore, account: &str) -> u64 {
        store
            .get(BANK_STORE, account.as_bytes())
            .and_then(|raw| String::from_utf8(raw).ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    fn balance(ctx: &ExecutionContext, account: &str) -> u64 {
        Self::balance_of(ctx.state().as_ref(), account)
    }

    fn set_balance(ctx: &ExecutionContext, account: &str, amount: u64) {
        ctx.state()
            .set(BANK_STORE, account.as_bytes(), amount.to_string().into_bytes());
    }

    fn credit(ctx: &ExecutionContext, account: &str, amount: u64) -> u64 {
        let balance = Self::balance(ctx, account).saturating_add(amount);
        Self::set_balance(ctx, account, balance);
        ctx.events().emit(
            Event::new("credit")
                .with_attribute("account", account)
                .with_attribute("amount", amount.to_string()),
        );
        balance
    }

    fn debit(ctx: &ExecutionContext, account: &str, amount: u64) -> Result<u64, ExecTxResult> {
        let balance = Self::balance(ctx, account);
        if balance < amount {
            return Err(ExecTxResult::failure(
                CODE_INSUFFICIENT_FUNDS,
                format!("insufficient funds: {} has {}, needs {}", account, balance, amount),
            ));
        }
        Self::set_balance(ctx, account, balance - amount);
        ctx.events().emit(
            Event::new("debit")
                .with_attribute("account", account)
                .with_attribute("amount", amount.to_string()),
        );
        Ok(balance - amount)
    }

    async fn apply(&self, ctx: &ExecutionContext, op: LedgerOp) -> Result<Vec<u8>, ExecTxResult> {
        match op {
            LedgerOp::Credit { account, amount } => {
                Ok(Self::credit(ctx, &account, amount).to_string().into_bytes())
            }
            LedgerOp::Debit { account, amount } => {
                Ok(Self::debit(ctx, &account, amount)?.to_string().into_bytes())
            }
            LedgerOp::Transfer { from, to, amount } => {
                let remaining = Self::debit(ctx, &from, amount)?;
                Self::credit(ctx, &to, amount);
                Ok(remaining.to_string().into_bytes())
            }
            LedgerOp::CallRemote {
                chain_id,
                contract,
                sender,
                payload,
                is_query,
                timeout_ms,
                store_as,
            } => {
                let request = CrossCallRequest {
                    from_chain_id: ctx.chain_id().clone(),
                    from: sender,
                    to_chain_id: chain_id,
                    to: contract,
                    payload: payload.to_string().into_bytes(),
                    is_query,
                    timeout_ms,
                };
                let response = ctx
                    .cross_chain_call(request)
                    .await
                    .map_err(|e| ExecTxResult::failure(CODE_CROSS_CALL, e.to_string()))?;
                if let Some(error) = response.error {
                    return Err(ExecTxResult::failure(CODE_CROSS_CALL, error));
                }
                if let Some(key) = store_as {
                    ctx.state()
                        .set(REMOTE_STORE, key.as_bytes(), response.data.clone());
                }
                Ok(response.data)
            }
        }
    }
}

#[async_trait]
impl ChainApp for LedgerApp {
    async fn deliver_sub_transaction(&self, ctx: &ExecutionContext, raw: &[u8]) -> ExecTxResult {
        let envelope = match SubTxEnvelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => return ExecTxResult::failure(CODE_DECODE, e.to_string()),
        };
        if &envelope.chain_id != ctx.chain_id() {
            return ExecTxResult::failure(
                CODE_WRONG_CHAIN,
                format!(
                    "sub-transaction for chain {} delivered to {}",
                    envelope.chain_id,
                    ctx.chain_id()
                ),
            );
        }
        let op: LedgerOp = match serde_json::from_value(envelope.body) {
            Ok(op) => op,
            Err(e) => return ExecTxResult::failure(CODE_DECODE, format!("ledger op: {}", e)),
        };

        debug!(chain_id = %ctx.chain_id(), ?op, "Delivering ledger op");
        match self.apply(ctx, op).await {
            Ok(data) => ExecTxResult::success(data, ctx.events().events()),
            Err(failure) => failure,
        }
    }

    async fn invoke_entry_point(
        &self,
        ctx: &ExecutionContext,
        contract: &str,
        sender: &str,
        payload: &[u8],
        read_only: bool,
    ) -> CoordinatorResult<Vec<u8>> {
        if contract != LEDGER_CONTRACT {
            return Err(CoordinatorError::Execution(format!(
                "contract {} not found on chain {}",
                contract,
                ctx.chain_id()
            )));
        }
        let entry: EntryPoint = serde_json::from_slice(payload)
            .map_err(|e| CoordinatorError::DecodeFailure(format!("entry point: {}", e)))?;

        debug!(chain_id = %ctx.chain_id(), sender, read_only, ?entry, "Invoking ledger entry point");
        match entry {
            EntryPoint::Balance { account } => {
                Ok(Self::balance(ctx, &account).to_string().into_bytes())
            }
            EntryPoint::Credit { account, amount } => {
                Ok(Self::credit(ctx, &account, amount).to_string().into_bytes())
            }
            EntryPoint::Mark { key } => {
                ctx.state().set(MARKER_STORE, key.as_bytes(), sender.as_bytes().to_vec());
                Ok(b"marked".to_vec())
            }
        }
    }
}
