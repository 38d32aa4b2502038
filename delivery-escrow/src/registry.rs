//! Driver registry
//!
//! Flat set of identities allowed to accept packages. Membership is
//! monotone: nothing in the ledger removes a driver once registered.

use crate::{types::AccountId, Result, Storage};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Authoritative membership test for "may this identity accept packages"
#[derive(Debug, Clone)]
pub struct DriverRegistry {
    storage: Arc<Storage>,
}

impl DriverRegistry {
    /// Registry backed by the ledger's store
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Mark `caller` as an eligible driver.
    ///
    /// Returns `true` if the identity was newly added. Registering again is
    /// not an error and keeps the original registration time. The
    /// check-then-put must run under the ledger's write lock, so outside
    /// callers go through `PackageLedger::register_driver`.
    pub(crate) fn register_driver(&self, caller: &AccountId) -> Result<bool> {
        if self.storage.get_driver(caller)?.is_some() {
            tracing::debug!(driver = %caller, "Driver already registered");
            return Ok(false);
        }

        self.storage.put_driver(caller, Utc::now())?;
        tracing::info!(driver = %caller, "Driver registered");
        Ok(true)
    }

    /// Whether `account` is a registered driver
    pub fn is_driver(&self, account: &AccountId) -> Result<bool> {
        Ok(self.storage.get_driver(account)?.is_some())
    }

    /// When `account` first registered
    pub fn registered_at(&self, account: &AccountId) -> Result<Option<DateTime<Utc>>> {
        self.storage.get_driver(account)
    }
}
