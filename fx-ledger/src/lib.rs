//! FX Ledger Core
//!
//! Multi-currency account ledger with atomic two-leg exchanges, served by
//! a supervised pool of workers sharing one authoritative store.
//!
//! # Architecture
//!
//! - **Single store**: one `LedgerStore` behind one lock; every mutation
//!   and its log entry are applied in a single critical section
//! - **Single writer**: exactly one worker may persist; the others route
//!   mutations to it with a bounded timeout
//! - **Atomic snapshots**: temp file, fsync, rename, SHA-256 checked on load
//! - **Supervision**: bounded restart budget with backoff, writer promotion
//!   after the durable state has been reloaded
//!
//! # Invariants
//!
//! - Balances never go negative; stored rates are always positive
//! - Every mutation attempt appends exactly one log entry
//! - At most one writer at any instant

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod engine;
pub mod error;
pub mod persistence;
pub mod pool;
pub mod restart;
pub mod store;
pub mod supervisor;
pub mod types;
pub mod worker;
pub mod writer;

// Re-exports
pub use config::Config;
pub use engine::ExchangeEngine;
pub use error::{Error, ErrorKind, Result};
pub use persistence::PersistenceCoordinator;
pub use pool::{PoolStatus, SlotState, WorkerPool, WorkerStatus};
pub use store::{LedgerState, LedgerStore};
pub use supervisor::{start, SupervisorHandle};
pub use types::{
    Account, AccountId, Currency, ExchangeOutcome, ExchangeReceipt, ExchangeRequest, LogEntry,
    Operation, Outcome, Rate, WorkerId,
};
pub use writer::WriterAssignment;
