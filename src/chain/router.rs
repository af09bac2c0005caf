//! JSON envelope codec for sub-transactions
//!
//! A sub-transaction is `{"chain_id": "...", "body": {...}}`. Only the
//! routing part is interpreted here; the body belongs to the target chain's
//! application.

use super::TxRouter;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::types::ChainId;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTxEnvelope {
    pub chain_id: ChainId,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl SubTxEnvelope {
    pub fn new(chain_id: impl Into<ChainId>, body: serde_json::Value) -> Self {
        Self {
            chain_id: chain_id.into(),
            body,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // a Value tree always serializes
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(raw: &[u8]) -> CoordinatorResult<Self> {
        serde_json::from_slice(raw)
            .map_err(|e| CoordinatorError::DecodeFailure(format!("sub-transaction envelope: {}", e)))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeRouter;

impl TxRouter for EnvelopeRouter {
    fn route_of(&self, raw: &[u8]) -> CoordinatorResult<ChainId> {
        let envelope = SubTxEnvelope::decode(raw)?;
        if envelope.chain_id.as_str().is_empty() {
            return Err(CoordinatorError::DecodeFailure(
                "sub-transaction envelope has an empty chain id".to_string(),
            ));
        }
        Ok(envelope.chain_id)
    }
}
