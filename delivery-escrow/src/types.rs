//! Core types for the escrow ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for money)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Participant identity (requester, driver, or any caller)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Create new account ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Package identifier, minted sequentially starting at 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageId(u64);

impl PackageId {
    /// First id handed out by a fresh ledger
    pub const FIRST: PackageId = PackageId(1);

    /// Wrap a raw id
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw value
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The id minted after this one
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Big-endian key bytes, so RocksDB iterates ids in order
    pub fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Escrowed delivery agreement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    /// Package ID
    pub id: PackageId,

    /// Identity that created the package and funded the escrow
    pub requester: AccountId,

    /// Identity that accepted the package (unset until accepted)
    pub driver: Option<AccountId>,

    /// Escrowed amount, released to the driver on delivery
    pub payment_amount: Decimal,

    /// Pickup location
    pub location_from: String,

    /// Drop-off location
    pub location_to: String,

    /// Free-form notes
    pub notes: String,

    /// Requester confirmed delivery
    pub requester_signed_off: bool,

    /// Driver confirmed delivery
    pub driver_signed_off: bool,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Package {
    /// Current lifecycle stage, derived from the record
    pub fn status(&self) -> PackageStatus {
        match (self.requester_signed_off, self.driver_signed_off) {
            (true, true) => PackageStatus::Delivered,
            (true, false) | (false, true) => PackageStatus::PartiallySignedOff,
            (false, false) if self.driver.is_some() => PackageStatus::Assigned,
            (false, false) => PackageStatus::Created,
        }
    }

    /// Both parties signed off and the payment was released (terminal)
    pub fn is_delivered(&self) -> bool {
        self.requester_signed_off && self.driver_signed_off
    }

    /// Whether `account` is this package's requester
    pub fn is_requester(&self, account: &AccountId) -> bool {
        &self.requester == account
    }

    /// Whether `account` is this package's assigned driver
    pub fn is_driver(&self, account: &AccountId) -> bool {
        self.driver.as_ref() == Some(account)
    }

    /// Whether the flag for `role` is already set
    pub fn has_signed_off(&self, role: SignOffRole) -> bool {
        match role {
            SignOffRole::Requester => self.requester_signed_off,
            SignOffRole::Driver => self.driver_signed_off,
        }
    }
}

/// Package lifecycle stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PackageStatus {
    /// Funded, waiting for a driver
    Created = 1,
    /// Driver assigned, nobody signed off yet
    Assigned = 2,
    /// One of the two parties signed off
    PartiallySignedOff = 3,
    /// Both signed off, payment released (terminal)
    Delivered = 4,
}

impl fmt::Display for PackageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PackageStatus::Created => "CREATED",
            PackageStatus::Assigned => "ASSIGNED",
            PackageStatus::PartiallySignedOff => "PARTIALLY_SIGNED_OFF",
            PackageStatus::Delivered => "DELIVERED",
        };
        f.write_str(s)
    }
}

/// Party confirming a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignOffRole {
    /// The package requester
    Requester,
    /// The assigned driver
    Driver,
}

impl fmt::Display for SignOffRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignOffRole::Requester => f.write_str("requester"),
            SignOffRole::Driver => f.write_str("driver"),
        }
    }
}

/// Outcome of a successful sign-off
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignOff {
    /// The caller's flag was set; payment still held in escrow
    Recorded {
        /// Role whose flag was set
        role: SignOffRole,
    },
    /// The caller's role had already signed off; nothing changed
    Unchanged,
    /// Both parties have signed off and the payment went to the driver
    Released {
        /// Payment recipient
        driver: AccountId,
        /// Amount released
        amount: Decimal,
    },
}

/// Committed transition in a package's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowEvent {
    /// Ledger-wide sequence number
    pub sequence: u64,

    /// Package this event belongs to
    pub package_id: PackageId,

    /// What happened
    pub kind: EventKind,

    /// Identity that triggered the transition
    pub actor: AccountId,

    /// Amount moved, for funding and release events
    pub amount: Option<Decimal>,

    /// Commit timestamp
    pub recorded_at: DateTime<Utc>,
}

/// Kind of package event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// Package created and payment escrowed
    PackageCreated,
    /// Driver accepted the package
    PackageAccepted,
    /// One party signed off
    DeliverySignedOff {
        /// Role that signed off
        role: SignOffRole,
    },
    /// Escrowed payment released to the driver
    PaymentReleased,
}
