//! Multi-chain coordination for colocated chain instances
//!
//! The coordination layer:
//! 1. Shares one `CoordinationContext` between the chains of a request
//! 2. Runs atomic transactions whose sub-transactions span two chains
//! 3. Serves synchronous cross-chain calls made by executing contracts
//! 4. Closes every channel when the owning scope is cancelled

pub mod atomic;
pub mod context;
pub mod crosschain;
pub mod engine;

pub use atomic::AtomicTransactionProtocol;
pub use context::{ChannelKind, ChannelRegistry, CoordinationContext, Rendezvous, RendezvousError};
pub use crosschain::CrossChainCallProtocol;
pub use engine::CoordinationEngine;
