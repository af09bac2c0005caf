//! Multichain Coordinator - execution coordination for colocated chain instances
//!
//! Several chain state machines run in one process. Each executes against
//! branched state that is committed only on success, and pairs of chains can
//! run one logical transaction atomically, exchanging sub-transaction results
//! and synchronous cross-chain calls over in-process rendezvous channels.

pub mod api;
pub mod chain;
pub mod config;
pub mod coordination;
pub mod error;
pub mod events;
pub mod execution;
pub mod metrics;
pub mod shutdown;
pub mod types;

pub use coordination::CoordinationEngine;
pub use error::{CoordinatorError, CoordinatorResult};
