//! Core data model shared by the executor and the coordination protocols

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::events::Event;

use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::collections::HashSet;
use std::fmt;

/// Maximum number of chains a single atomic transaction may span
pub const MAX_ATOMIC_TX_CHAINS: usize = 2;

/// Identifier of a chain instance colocated in this process
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(String);

impl ChainId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChainId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ChainId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Which state an execution branches from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecutionHeight {
    /// Target height; 0 selects the latest committed height
    pub height: i64,
    pub prove: bool,
}

impl ExecutionHeight {
    pub fn latest() -> Self {
        Self::default()
    }

    pub fn at(height: i64) -> Self {
        Self {
            height,
            prove: false,
        }
    }

    pub fn with_proof(mut self) -> Self {
        self.prove = true;
        self
    }

    /// Resolve against the latest committed height of a chain
    pub fn resolve(&self, latest: u64) -> CoordinatorResult<u64> {
        if self.height < 0 {
            return Err(CoordinatorError::InvalidHeight {
                height: self.height,
            });
        }
        if self.height as u64 > latest {
            return Err(CoordinatorError::HeightInFuture {
                height: self.height,
                latest,
            });
        }

        let height = if self.height == 0 {
            latest
        } else {
            self.height as u64
        };

        if self.prove && height <= 1 {
            return Err(CoordinatorError::ProofUnavailable { height });
        }
        Ok(height)
    }
}

/// Result of delivering one sub-transaction on its target chain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecTxResult {
    /// 0 on success
    pub code: u32,
    pub data: Vec<u8>,
    pub log: String,
    pub info: String,
    pub gas_wanted: u64,
    pub gas_used: u64,
    pub events: Vec<Event>,
    pub codespace: String,
}

impl ExecTxResult {
    pub fn success(data: Vec<u8>, events: Vec<Event>) -> Self {
        Self {
            data,
            events,
            ..Default::default()
        }
    }

    pub fn failure(code: u32, log: impl Into<String>) -> Self {
        Self {
            code: code.max(1),
            log: log.into(),
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

/// An atomic transaction spanning up to two chains
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomicTxRequest {
    /// Ordered raw sub-transaction payloads
    pub txs: Vec<Vec<u8>>,
    pub chain_ids: Vec<ChainId>,
    pub leader_chain_id: ChainId,
}

impl AtomicTxRequest {
    pub fn new(txs: Vec<Vec<u8>>, chain_ids: Vec<ChainId>, leader_chain_id: ChainId) -> Self {
        Self {
            txs,
            chain_ids,
            leader_chain_id,
        }
    }

    /// Correlation hash over the ordered sub-transaction payloads
    pub fn hash(&self) -> [u8; 32] {
        let mut hasher = Keccak256::new();
        for tx in &self.txs {
            hasher.update((tx.len() as u64).to_be_bytes());
            hasher.update(tx);
        }
        hasher.finalize().into()
    }

    /// Participant-set checks performed before any coordination starts
    pub fn validate_participants(&self, chain_id: &ChainId) -> CoordinatorResult<()> {
        let mut seen = HashSet::with_capacity(self.chain_ids.len());
        if let Some(dup) = self.chain_ids.iter().find(|id| !seen.insert(*id)) {
            return Err(CoordinatorError::DuplicateParticipant {
                chain_id: dup.clone(),
            });
        }
        if self.chain_ids.len() > MAX_ATOMIC_TX_CHAINS {
            return Err(CoordinatorError::TooManyParticipants {
                count: self.chain_ids.len(),
                max: MAX_ATOMIC_TX_CHAINS,
            });
        }
        if !self.chain_ids.contains(&self.leader_chain_id) {
            return Err(CoordinatorError::LeaderNotInSet {
                leader: self.leader_chain_id.clone(),
            });
        }
        if !self.chain_ids.contains(chain_id) {
            return Err(CoordinatorError::ChainNotInSet {
                chain_id: chain_id.clone(),
            });
        }
        if self.txs.is_empty() {
            return Err(CoordinatorError::DecodeFailure(
                "atomic tx has no sub-transactions".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-sub-transaction results, filled in as each chain completes its part
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomicTxResult {
    pub results: Vec<Option<ExecTxResult>>,
}

impl AtomicTxResult {
    pub fn with_slots(count: usize) -> Self {
        Self {
            results: vec![None; count],
        }
    }

    pub fn set(&mut self, index: usize, result: ExecTxResult) {
        if let Some(slot) = self.results.get_mut(index) {
            *slot = Some(result);
        }
    }

    pub fn get(&self, index: usize) -> Option<&ExecTxResult> {
        self.results.get(index).and_then(|slot| slot.as_ref())
    }

    pub fn is_complete(&self) -> bool {
        self.results.iter().all(Option::is_some)
    }

    pub fn all_succeeded(&self) -> bool {
        self.results
            .iter()
            .all(|slot| slot.as_ref().map(ExecTxResult::is_ok).unwrap_or(false))
    }
}

/// A synchronous-looking call from contract code on one chain into another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossCallRequest {
    pub from_chain_id: ChainId,
    pub from: String,
    pub to_chain_id: ChainId,
    pub to: String,
    pub payload: Vec<u8>,
    pub is_query: bool,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossCallResponse {
    pub data: Vec<u8>,
    /// Errors cross the channel boundary as data
    pub error: Option<String>,
}

impl CrossCallResponse {
    pub fn ok(data: Vec<u8>) -> Self {
        Self { data, error: None }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            data: Vec::new(),
            error: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedCrossCallRequest {
    pub index: u32,
    pub request: CrossCallRequest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedCrossCallResponse {
    pub index: u32,
    pub response: CrossCallResponse,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(chains: &[&str], leader: &str) -> AtomicTxRequest {
        AtomicTxRequest::new(
            vec![b"tx".to_vec()],
            chains.iter().map(|c| ChainId::from(*c)).collect(),
            ChainId::from(leader),
        )
    }

    #[test]
    fn test_height_resolution() {
        assert_eq!(ExecutionHeight::latest().resolve(7).unwrap(), 7);
        assert_eq!(ExecutionHeight::at(3).resolve(7).unwrap(), 3);
        assert!(matches!(
            ExecutionHeight::at(-1).resolve(7),
            Err(CoordinatorError::InvalidHeight { height: -1 })
        ));
        assert!(matches!(
            ExecutionHeight::at(8).resolve(7),
            Err(CoordinatorError::HeightInFuture { height: 8, latest: 7 })
        ));
        assert!(matches!(
            ExecutionHeight::at(1).with_proof().resolve(7),
            Err(CoordinatorError::ProofUnavailable { height: 1 })
        ));
        assert!(matches!(
            ExecutionHeight::latest().with_proof().resolve(1),
            Err(CoordinatorError::ProofUnavailable { height: 1 })
        ));
        assert_eq!(ExecutionHeight::at(2).with_proof().resolve(7).unwrap(), 2);
    }

    #[test]
    fn test_participant_validation() {
        let x = ChainId::from("x");
        assert!(request(&["x", "y"], "x").validate_participants(&x).is_ok());
        assert!(matches!(
            request(&["x", "y", "z"], "x").validate_participants(&x),
            Err(CoordinatorError::TooManyParticipants { count: 3, max: 2 })
        ));
        assert!(matches!(
            request(&["x", "y"], "z").validate_participants(&x),
            Err(CoordinatorError::LeaderNotInSet { .. })
        ));
        assert!(matches!(
            request(&["y"], "y").validate_participants(&x),
            Err(CoordinatorError::ChainNotInSet { .. })
        ));
    }

    #[test]
    fn test_duplicate_participants_rejected() {
        let x = ChainId::from("x");
        let err = request(&["x", "x"], "x").validate_participants(&x).unwrap_err();
        assert!(matches!(&err, CoordinatorError::DuplicateParticipant { chain_id } if chain_id == &x));
        assert!(err.is_validation());

        // Reported ahead of the participant count
        assert!(matches!(
            request(&["x", "y", "y"], "x").validate_participants(&x),
            Err(CoordinatorError::DuplicateParticipant { chain_id }) if chain_id == ChainId::from("y")
        ));
    }

    #[test]
    fn test_hash_depends_on_order() {
        let a = AtomicTxRequest::new(
            vec![b"a".to_vec(), b"b".to_vec()],
            vec!["x".into()],
            "x".into(),
        );
        let b = AtomicTxRequest::new(
            vec![b"b".to_vec(), b"a".to_vec()],
            vec!["x".into()],
            "x".into(),
        );
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash(), a.clone().hash());
    }

    #[test]
    fn test_result_slots() {
        let mut result = AtomicTxResult::with_slots(2);
        assert!(!result.is_complete());
        result.set(0, ExecTxResult::success(vec![1], vec![]));
        result.set(1, ExecTxResult::failure(5, "boom"));
        result.set(9, ExecTxResult::default());
        assert!(result.is_complete());
        assert!(!result.all_succeeded());
        assert_eq!(result.get(1).unwrap().code, 5);
    }
}
