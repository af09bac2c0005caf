//! Coordination context and its rendezvous channels
//!
//! A `CoordinationContext` is created once per top-level request and shared
//! by every chain taking part in it. It holds three families of single-slot
//! channels keyed by chain identifier, plus the correlation state of the
//! atomic transaction in flight. Each channel has exactly one writer and one
//! reader, which is what makes a capacity of one sufficient.

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::shutdown::Shutdown;
use crate::types::{AtomicTxResult, ChainId, IndexedCrossCallRequest, IndexedCrossCallResponse};

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Result,
    InboundCall,
    OutboundCall,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelKind::Result => "result",
            ChannelKind::InboundCall => "inbound_call",
            ChannelKind::OutboundCall => "outbound_call",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousError {
    #[error("slot already occupied")]
    Occupied,
    #[error("channel closed")]
    Closed,
}

/// Single-slot handoff between one writer task and one reader task.
///
/// Closes when the owning coordination scope is cancelled; a blocked
/// `recv` or `send` then returns immediately.
pub struct Rendezvous<T> {
    tx: mpsc::Sender<T>,
    rx: AsyncMutex<mpsc::Receiver<T>>,
    scope: Shutdown,
}

impl<T: Send> Rendezvous<T> {
    fn new(scope: Shutdown) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: AsyncMutex::new(rx),
            scope,
        }
    }

    /// Put a value in the slot without waiting
    pub fn try_send(&self, value: T) -> Result<(), RendezvousError> {
        if self.scope.is_cancelled() {
            return Err(RendezvousError::Closed);
        }
        self.tx.try_send(value).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RendezvousError::Occupied,
            mpsc::error::TrySendError::Closed(_) => RendezvousError::Closed,
        })
    }

    /// Wait for the slot to be free, then fill it
    pub async fn send(&self, value: T) -> Result<(), RendezvousError> {
        if self.scope.is_cancelled() {
            return Err(RendezvousError::Closed);
        }
        tokio::select! {
            biased;
            _ = self.scope.cancelled() => Err(RendezvousError::Closed),
            sent = self.tx.send(value) => sent.map_err(|_| RendezvousError::Closed),
        }
    }

    /// Wait for a value; `None` once the channel is closed
    pub async fn recv(&self) -> Option<T> {
        let mut rx = tokio::select! {
            biased;
            _ = self.scope.cancelled() => return None,
            rx = self.rx.lock() => rx,
        };
        tokio::select! {
            biased;
            _ = self.scope.cancelled() => None,
            value = rx.recv() => value,
        }
    }

    /// Take the value in the slot, if any, without waiting
    pub fn try_recv(&self) -> Option<T> {
        let mut rx = self.rx.try_lock().ok()?;
        rx.try_recv().ok()
    }

    pub fn is_closed(&self) -> bool {
        self.scope.is_cancelled()
    }

    fn close(&self) {
        if let Ok(mut rx) = self.rx.try_lock() {
            rx.close();
        }
    }
}

/// Lazily created rendezvous channels of one kind, keyed by chain
pub struct ChannelRegistry<T> {
    kind: ChannelKind,
    channels: DashMap<ChainId, Arc<Rendezvous<T>>>,
    scope: Shutdown,
}

impl<T: Send> ChannelRegistry<T> {
    fn new(kind: ChannelKind, scope: Shutdown) -> Self {
        Self {
            kind,
            channels: DashMap::new(),
            scope,
        }
    }

    /// The channel for `chain_id`, created on first use.
    /// Every caller gets the same channel regardless of arrival order.
    pub fn get_or_create(&self, chain_id: &ChainId) -> Arc<Rendezvous<T>> {
        self.channels
            .entry(chain_id.clone())
            .or_insert_with(|| {
                debug!(chain_id = %chain_id, kind = %self.kind, "Creating channel");
                Arc::new(Rendezvous::new(self.scope.clone()))
            })
            .clone()
    }

    pub fn get(&self, chain_id: &ChainId) -> Option<Arc<Rendezvous<T>>> {
        self.channels.get(chain_id).map(|c| c.clone())
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    fn close_all(&self) {
        for channel in self.channels.iter() {
            channel.value().close();
        }
    }
}

#[derive(Debug, Default)]
struct Correlation {
    atomic_tx_hash: Option<[u8; 32]>,
    atomic_tx_chain_ids: Vec<ChainId>,
    active_participants: usize,
    sub_tx_index: HashMap<ChainId, usize>,
    sub_tx_calls: HashMap<ChainId, u32>,
    /// Never reset; a response is matched to its call by this index
    next_cross_call_index: u32,
}

/// Per-request bag of rendezvous channels and correlation state
pub struct CoordinationContext {
    id: Uuid,
    results: ChannelRegistry<AtomicTxResult>,
    inbound_calls: ChannelRegistry<IndexedCrossCallRequest>,
    outbound_calls: ChannelRegistry<IndexedCrossCallResponse>,
    chain_ids: Mutex<BTreeSet<ChainId>>,
    correlation: Mutex<Correlation>,
    scope: Shutdown,
}

impl CoordinationContext {
    /// Create a context under `parent`; its channels close when `parent` is cancelled
    pub fn new(parent: &Shutdown) -> Arc<Self> {
        let scope = parent.child();
        let ctx = Arc::new(Self {
            id: Uuid::new_v4(),
            results: ChannelRegistry::new(ChannelKind::Result, scope.clone()),
            inbound_calls: ChannelRegistry::new(ChannelKind::InboundCall, scope.clone()),
            outbound_calls: ChannelRegistry::new(ChannelKind::OutboundCall, scope.clone()),
            chain_ids: Mutex::new(BTreeSet::new()),
            correlation: Mutex::new(Correlation::default()),
            scope: scope.clone(),
        });
        crate::metrics::record_context_opened();

        let weak = Arc::downgrade(&ctx);
        tokio::spawn(async move {
            scope.cancelled().await;
            if let Some(ctx) = weak.upgrade() {
                info!(context = %ctx.id, "Closing multichain channels");
                ctx.close_channels();
            }
            crate::metrics::record_context_closed();
        });

        ctx
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn scope(&self) -> &Shutdown {
        &self.scope
    }

    pub fn is_cancelled(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// Tear the context down, closing every channel
    pub fn cancel(&self) {
        self.scope.cancel();
    }

    pub async fn cancelled(&self) {
        self.scope.cancelled().await
    }

    pub fn result_channel(&self, chain_id: &ChainId) -> Arc<Rendezvous<AtomicTxResult>> {
        self.track(chain_id);
        self.results.get_or_create(chain_id)
    }

    pub fn inbound_call_channel(&self, chain_id: &ChainId) -> Arc<Rendezvous<IndexedCrossCallRequest>> {
        self.track(chain_id);
        self.inbound_calls.get_or_create(chain_id)
    }

    pub fn outbound_call_channel(
        &self,
        chain_id: &ChainId,
    ) -> Arc<Rendezvous<IndexedCrossCallResponse>> {
        self.track(chain_id);
        self.outbound_calls.get_or_create(chain_id)
    }

    pub fn results(&self) -> &ChannelRegistry<AtomicTxResult> {
        &self.results
    }

    pub fn inbound_calls(&self) -> &ChannelRegistry<IndexedCrossCallRequest> {
        &self.inbound_calls
    }

    pub fn outbound_calls(&self) -> &ChannelRegistry<IndexedCrossCallResponse> {
        &self.outbound_calls
    }

    /// Total number of channels created so far
    pub fn channel_count(&self) -> usize {
        self.results.len() + self.inbound_calls.len() + self.outbound_calls.len()
    }

    /// Chains that have obtained a channel on this context
    pub fn chain_ids(&self) -> Vec<ChainId> {
        self.chain_ids.lock().iter().cloned().collect()
    }

    /// Join the atomic transaction in flight, or start it.
    ///
    /// Every participant of one context must present the same hash and chain set.
    pub fn begin_atomic_tx(&self, hash: [u8; 32], chain_ids: &[ChainId]) -> CoordinatorResult<()> {
        let mut correlation = self.correlation.lock();
        match correlation.atomic_tx_hash {
            None => {
                correlation.atomic_tx_hash = Some(hash);
                correlation.atomic_tx_chain_ids = chain_ids.to_vec();
            }
            Some(current) => {
                if current != hash {
                    return Err(CoordinatorError::AtomicTxMismatch(format!(
                        "hash expected {}, actual {}",
                        hex::encode(current),
                        hex::encode(hash)
                    )));
                }
                if correlation.atomic_tx_chain_ids != chain_ids {
                    return Err(CoordinatorError::AtomicTxMismatch(format!(
                        "chain ids expected {:?}, actual {:?}",
                        correlation.atomic_tx_chain_ids, chain_ids
                    )));
                }
            }
        }
        correlation.active_participants += 1;
        Ok(())
    }

    /// Leave the atomic transaction; the last participant resets the correlation state
    pub fn end_atomic_tx(&self) {
        let mut correlation = self.correlation.lock();
        correlation.active_participants = correlation.active_participants.saturating_sub(1);
        if correlation.active_participants == 0 {
            correlation.atomic_tx_hash = None;
            correlation.atomic_tx_chain_ids.clear();
        }
    }

    pub fn current_atomic_tx_hash(&self) -> Option<[u8; 32]> {
        self.correlation.lock().atomic_tx_hash
    }

    pub fn current_atomic_tx_chain_ids(&self) -> Vec<ChainId> {
        self.correlation.lock().atomic_tx_chain_ids.clone()
    }

    /// Enter sub-transaction `index` on `chain_id`; resets its per-sub-transaction call count
    pub fn set_sub_tx_index(&self, chain_id: &ChainId, index: usize) {
        let mut correlation = self.correlation.lock();
        correlation.sub_tx_index.insert(chain_id.clone(), index);
        correlation.sub_tx_calls.insert(chain_id.clone(), 0);
    }

    pub fn sub_tx_index(&self, chain_id: &ChainId) -> usize {
        self.correlation
            .lock()
            .sub_tx_index
            .get(chain_id)
            .copied()
            .unwrap_or(0)
    }

    /// Take the correlation index for a cross-call made by `chain_id`.
    ///
    /// Indices are unique for the lifetime of the context, so a response to
    /// an abandoned call can never be taken for the answer to a later one.
    pub fn next_cross_call_index(&self, chain_id: &ChainId) -> u32 {
        let mut correlation = self.correlation.lock();
        *correlation.sub_tx_calls.entry(chain_id.clone()).or_insert(0) += 1;
        let index = correlation.next_cross_call_index;
        correlation.next_cross_call_index = index.wrapping_add(1);
        index
    }

    /// Cross-calls made by `chain_id` since its current sub-transaction started
    pub fn sub_tx_call_count(&self, chain_id: &ChainId) -> u32 {
        self.correlation
            .lock()
            .sub_tx_calls
            .get(chain_id)
            .copied()
            .unwrap_or(0)
    }

    fn track(&self, chain_id: &ChainId) {
        let mut chain_ids = self.chain_ids.lock();
        if !chain_ids.contains(chain_id) {
            chain_ids.insert(chain_id.clone());
        }
    }

    fn close_channels(&self) {
        self.results.close_all();
        self.inbound_calls.close_all();
        self.outbound_calls.close_all();
    }
}

impl Drop for CoordinationContext {
    fn drop(&mut self) {
        // releases the watcher task
        self.scope.cancel();
    }
}

impl fmt::Debug for CoordinationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinationContext")
            .field("id", &self.id)
            .field("chain_ids", &self.chain_ids())
            .field("channels", &self.channel_count())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
