//! Package escrow ledger
//!
//! This module ties together storage, the driver registry and custody
//! into the escrow lifecycle of a delivery package:
//!
//! ```text
//!   create_package        accept_package        sign_off_delivery      sign_off_delivery
//! ─────────────────▶ Created ──────────▶ Assigned ──────────▶ PartiallySignedOff ──────────▶ Delivered
//!   (funds collected)                                                       (funds released to driver)
//! ```
//!
//! The requester may sign off before a driver is assigned.
//!
//! # Atomicity
//!
//! Every mutating operation runs inside one critical section. Preconditions
//! are checked first, then the new state is committed in a single write
//! batch, and only then are funds moved. When a release fails, the package
//! is put back the way it was before the call.
//!
//! The critical section is re-entrant: custody code that calls back into
//! the ledger while a release is in flight runs on the same thread, enters
//! the section again and sees the package already delivered.

use crate::{
    custody::Custody,
    error::{EscrowError, Error, Result},
    metrics::Metrics,
    registry::DriverRegistry,
    storage::{Storage, StorageStats},
    types::{AccountId, EscrowEvent, EventKind, Package, PackageId, SignOff, SignOffRole},
    Config,
};
use chrono::{DateTime, Utc};
use parking_lot::ReentrantMutex;
use rust_decimal::Decimal;
use std::fmt;
use std::sync::Arc;

/// Escrow ledger for delivery packages
pub struct PackageLedger {
    /// Transactional store shared with the registry
    storage: Arc<Storage>,

    /// Eligible drivers
    registry: DriverRegistry,

    /// Where escrowed funds come from and go to
    custody: Arc<dyn Custody>,

    /// Smallest payment accepted by `create_package`
    minimum_payment: Decimal,

    /// Metrics
    metrics: Metrics,

    /// Serialises mutating operations
    write_lock: ReentrantMutex<()>,
}

impl fmt::Debug for PackageLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackageLedger")
            .field("storage", &self.storage)
            .field("minimum_payment", &self.minimum_payment)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl PackageLedger {
    /// Open the ledger with configuration
    pub fn open(config: Config, custody: Arc<dyn Custody>) -> Result<Self> {
        config.validate()?;

        let storage = Arc::new(Storage::open(&config)?);

        let minimum_payment = match storage.minimum_payment()? {
            Some(stored) => {
                if stored != config.minimum_payment {
                    tracing::warn!(
                        stored = %stored,
                        configured = %config.minimum_payment,
                        "Ignoring configured minimum payment, store was created with another value"
                    );
                }
                stored
            }
            None => {
                storage.put_minimum_payment(config.minimum_payment)?;
                config.minimum_payment
            }
        };

        // Open packages still own their payment, whatever custody we were handed
        let outstanding = storage.outstanding_escrow()?;
        custody.restore_held(outstanding)?;

        let metrics = Metrics::new()
            .map_err(|e| Error::Other(format!("Failed to create metrics: {}", e)))?;
        metrics.record_held(outstanding);

        tracing::info!(
            service = %config.service_name,
            minimum_payment = %minimum_payment,
            next_package_id = %storage.next_package_id()?,
            "Escrow ledger opened"
        );

        Ok(Self {
            registry: DriverRegistry::new(storage.clone()),
            storage,
            custody,
            minimum_payment,
            metrics,
            write_lock: ReentrantMutex::new(()),
        })
    }

    /// Create a package and escrow `attached_payment` from `caller`
    pub fn create_package(
        &self,
        caller: &AccountId,
        location_from: impl Into<String>,
        location_to: impl Into<String>,
        notes: impl Into<String>,
        attached_payment: Decimal,
    ) -> Result<PackageId> {
        let _guard = self.write_lock.lock();

        if attached_payment < self.minimum_payment {
            return self.reject(EscrowError::NotEnoughPaymentEntered {
                provided: attached_payment,
                minimum: self.minimum_payment,
            });
        }

        self.custody.collect(caller, attached_payment).map_err(|e| {
            self.metrics.record_custody_failure();
            tracing::warn!(requester = %caller, amount = %attached_payment, "Payment collection failed: {}", e);
            e
        })?;

        // Anything failing past this point hands the payment back
        let committed = self.commit_new_package(
            caller,
            location_from.into(),
            location_to.into(),
            notes.into(),
            attached_payment,
        );
        let id = match committed {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(requester = %caller, "Failed to commit new package, refunding: {}", e);
                if let Err(refund) = self.custody.release(caller, attached_payment) {
                    self.metrics.record_custody_failure();
                    tracing::error!(requester = %caller, amount = %attached_payment, "Refund failed: {}", refund);
                }
                return Err(e);
            }
        };

        self.metrics.record_created(attached_payment);
        tracing::info!(
            package_id = %id,
            requester = %caller,
            amount = %attached_payment,
            "Package created"
        );

        Ok(id)
    }

    /// Register `caller` as a driver. Returns `true` if newly registered.
    pub fn register_driver(&self, caller: &AccountId) -> Result<bool> {
        let _guard = self.write_lock.lock();
        self.registry.register_driver(caller)
    }

    /// Assign package `id` to `caller`
    pub fn accept_package(&self, caller: &AccountId, id: PackageId) -> Result<()> {
        let _guard = self.write_lock.lock();

        let mut package = match self.storage.get_package(id)? {
            Some(package) => package,
            None => return self.reject(EscrowError::PackageNotExist(id)),
        };

        if !self.registry.is_driver(caller)? {
            return self.reject(EscrowError::DriverNotRegistered(caller.clone()));
        }

        if let Some(driver) = &package.driver {
            return self.reject(EscrowError::PackageAlreadyAssigned {
                package_id: id,
                driver: driver.clone(),
            });
        }

        let now = Utc::now();
        package.driver = Some(caller.clone());
        package.updated_at = now;

        let event = EscrowEvent {
            sequence: self.storage.next_event_sequence()?,
            package_id: id,
            kind: EventKind::PackageAccepted,
            actor: caller.clone(),
            amount: None,
            recorded_at: now,
        };
        self.storage.update_package_atomic(&package, &[event])?;

        self.metrics.record_accepted();
        tracing::info!(package_id = %id, driver = %caller, "Package accepted");

        Ok(())
    }

    /// Confirm delivery of package `id` as `caller`.
    ///
    /// Sets the flag of every role `caller` holds on the package. The call
    /// that completes both sign-offs releases the escrowed payment to the
    /// driver. A repeat sign-off from a role that already signed is a no-op.
    pub fn sign_off_delivery(&self, caller: &AccountId, id: PackageId) -> Result<SignOff> {
        let _guard = self.write_lock.lock();

        let before = match self.storage.get_package(id)? {
            Some(package) => package,
            None => return self.reject(EscrowError::PackageNotExist(id)),
        };

        let roles: Vec<SignOffRole> = [
            (before.is_requester(caller), SignOffRole::Requester),
            (before.is_driver(caller), SignOffRole::Driver),
        ]
        .into_iter()
        .filter_map(|(holds, role)| holds.then_some(role))
        .collect();

        if roles.is_empty() {
            return self.reject(EscrowError::NotAllowedToSignOffPackage {
                package_id: id,
                caller: caller.clone(),
            });
        }

        if before.is_delivered() {
            return self.reject(EscrowError::PackageAlreadyDelivered(id));
        }

        let signing: Vec<SignOffRole> = roles
            .into_iter()
            .filter(|role| !before.has_signed_off(*role))
            .collect();

        if signing.is_empty() {
            tracing::debug!(package_id = %id, caller = %caller, "Sign-off already recorded");
            return Ok(SignOff::Unchanged);
        }

        let now = Utc::now();
        let mut package = before.clone();
        for role in &signing {
            match role {
                SignOffRole::Requester => package.requester_signed_off = true,
                SignOffRole::Driver => package.driver_signed_off = true,
            }
        }
        package.updated_at = now;

        let mut sequence = self.storage.next_event_sequence()?;
        let mut events = Vec::with_capacity(signing.len() + 1);
        for role in &signing {
            events.push(Self::event(
                &mut sequence,
                id,
                EventKind::DeliverySignedOff { role: *role },
                caller,
                None,
                now,
            ));
        }

        if !package.is_delivered() {
            self.storage.update_package_atomic(&package, &events)?;
            self.metrics.record_sign_offs(signing.len() as u64);
            tracing::info!(package_id = %id, caller = %caller, role = %signing[0], "Delivery signed off");
            return Ok(SignOff::Recorded { role: signing[0] });
        }

        // Both flags set: the driver flag can only be set by an assigned driver
        let driver = package.driver.clone().ok_or_else(|| {
            Error::Other(format!("Package {} signed off without a driver", id))
        })?;
        let amount = package.payment_amount;
        events.push(Self::event(
            &mut sequence,
            id,
            EventKind::PaymentReleased,
            &driver,
            Some(amount),
            now,
        ));

        // Terminal state is on disk before any funds move
        self.storage.update_package_atomic(&package, &events)?;

        if let Err(e) = self.custody.release(&driver, amount) {
            self.metrics.record_custody_failure();
            tracing::warn!(
                package_id = %id,
                driver = %driver,
                amount = %amount,
                "Payment release failed, restoring package: {}",
                e
            );
            if let Err(revert) = self.storage.revert_package_atomic(&before, &events) {
                self.metrics.record_stranded();
                tracing::error!(
                    package_id = %id,
                    driver = %driver,
                    amount = %amount,
                    custody_error = %e,
                    "Failed to restore package, payment is stranded: {}",
                    revert
                );
            }
            return Err(e.into());
        }

        self.metrics.record_sign_offs(signing.len() as u64);
        self.metrics.record_released(amount);
        tracing::info!(package_id = %id, driver = %driver, amount = %amount, "Payment released");

        Ok(SignOff::Released { driver, amount })
    }

    /// Smallest payment `create_package` accepts
    pub fn minimum_payment(&self) -> Decimal {
        self.minimum_payment
    }

    /// Id the next created package will receive
    pub fn next_package_id(&self) -> Result<PackageId> {
        self.storage.next_package_id()
    }

    /// Get package by id
    pub fn get_package(&self, id: PackageId) -> Result<Package> {
        self.storage
            .get_package(id)?
            .ok_or_else(|| EscrowError::PackageNotExist(id).into())
    }

    /// Committed history of a package, oldest first
    pub fn package_events(&self, id: PackageId) -> Result<Vec<EscrowEvent>> {
        self.storage.get_package_events(id)
    }

    /// Whether `account` is a registered driver
    pub fn is_driver(&self, account: &AccountId) -> Result<bool> {
        self.registry.is_driver(account)
    }

    /// Driver registry
    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    /// Storage statistics
    pub fn stats(&self) -> Result<StorageStats> {
        self.storage.get_stats()
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Flush the store before shutdown
    pub fn flush(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.storage.flush()
    }

    fn commit_new_package(
        &self,
        caller: &AccountId,
        location_from: String,
        location_to: String,
        notes: String,
        amount: Decimal,
    ) -> Result<PackageId> {
        // Counters are read after collection in case custody re-entered the ledger
        let id = self.storage.next_package_id()?;
        let now = Utc::now();
        let package = Package {
            id,
            requester: caller.clone(),
            driver: None,
            payment_amount: amount,
            location_from,
            location_to,
            notes,
            requester_signed_off: false,
            driver_signed_off: false,
            created_at: now,
            updated_at: now,
        };
        let event = EscrowEvent {
            sequence: self.storage.next_event_sequence()?,
            package_id: id,
            kind: EventKind::PackageCreated,
            actor: caller.clone(),
            amount: Some(amount),
            recorded_at: now,
        };

        self.storage.insert_package_atomic(&package, id.next(), &[event])?;
        Ok(id)
    }

    fn reject<T>(&self, err: EscrowError) -> Result<T> {
        tracing::debug!(reason = err.reason(), "Operation rejected: {}", err);
        self.metrics.record_rejection(&err);
        Err(err.into())
    }

    fn event(
        sequence: &mut u64,
        package_id: PackageId,
        kind: EventKind,
        actor: &AccountId,
        amount: Option<Decimal>,
        recorded_at: DateTime<Utc>,
    ) -> EscrowEvent {
        let event = EscrowEvent {
            sequence: *sequence,
            package_id,
            kind,
            actor: actor.clone(),
            amount,
            recorded_at,
        };
        *sequence += 1;
        event
    }
}
