//! Delivery Escrow Ledger
//!
//! Escrow state machine for peer-to-peer delivery agreements between a
//! requester and a driver.
//!
//! # Architecture
//!
//! - **Single Writer**: Every mutating operation runs inside one critical section
//! - **Effects Before Interaction**: State is committed before funds leave custody
//! - **Atomic Commits**: Each transition is one RocksDB write batch
//! - **Event Log**: Per-package append-only history of committed transitions
//!
//! # Invariants
//!
//! - Exactly-once release: escrowed funds go to the driver once, when both
//!   parties have signed off
//! - All-or-nothing: a rejected operation leaves no observable trace
//! - Monotone ids: package ids start at 1 and are never reused
//! - Monotone registry: registered drivers are never removed
//!
//! # Example
//!
//! ```no_run
//! use delivery_escrow::{AccountId, BalanceBook, Config, PackageLedger};
//! use rust_decimal::Decimal;
//! use std::sync::Arc;
//!
//! fn main() -> delivery_escrow::Result<()> {
//!     let custody = Arc::new(BalanceBook::new());
//!     let ledger = PackageLedger::open(Config::default(), custody.clone())?;
//!
//!     let alice = AccountId::new("alice");
//!     let bob = AccountId::new("bob");
//!     custody.fund(&alice, Decimal::ONE);
//!
//!     let id = ledger.create_package(&alice, "depot", "harbour", "fragile", Decimal::new(1, 3))?;
//!     ledger.register_driver(&bob)?;
//!     ledger.accept_package(&bob, id)?;
//!     ledger.sign_off_delivery(&alice, id)?;
//!     ledger.sign_off_delivery(&bob, id)?;
//!
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod storage;
pub mod registry;
pub mod custody;
pub mod ledger;
pub mod error;
pub mod config;
pub mod metrics;

// Re-exports
pub use error::{CustodyError, Error, EscrowError, Result};
pub use types::{
    AccountId, EscrowEvent, EventKind, Package, PackageId, PackageStatus, SignOff, SignOffRole,
};
pub use storage::{Storage, StorageStats};
pub use registry::DriverRegistry;
pub use custody::{BalanceBook, Custody};
pub use ledger::PackageLedger;
pub use config::Config;
pub use metrics::Metrics;
