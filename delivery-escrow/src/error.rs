//! Error types for the escrow ledger

use crate::types::{AccountId, PackageId};
use rust_decimal::Decimal;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Rejections of an escrow operation.
///
/// Every variant is a precondition violation detected before any mutation,
/// so an operation failing with one of these left no trace behind.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EscrowError {
    /// Attached payment is below the ledger minimum
    #[error("Not enough payment entered: {provided} < minimum {minimum}")]
    NotEnoughPaymentEntered {
        /// Amount attached to the call
        provided: Decimal,
        /// Ledger minimum payment
        minimum: Decimal,
    },

    /// No package with this id
    #[error("Package {0} does not exist")]
    PackageNotExist(PackageId),

    /// Caller is not in the driver registry
    #[error("Driver not registered: {0}")]
    DriverNotRegistered(AccountId),

    /// Package already has a driver
    #[error("Package {package_id} already assigned to {driver}")]
    PackageAlreadyAssigned {
        /// Package id
        package_id: PackageId,
        /// Driver holding the assignment
        driver: AccountId,
    },

    /// Caller is neither the requester nor the driver of the package
    #[error("{caller} is not allowed to sign off package {package_id}")]
    NotAllowedToSignOffPackage {
        /// Package id
        package_id: PackageId,
        /// Rejected caller
        caller: AccountId,
    },

    /// Both parties already signed off; the payment has been released
    #[error("Package {0} already delivered")]
    PackageAlreadyDelivered(PackageId),
}

impl EscrowError {
    /// Short stable label, used as a metrics dimension
    pub fn reason(&self) -> &'static str {
        match self {
            EscrowError::NotEnoughPaymentEntered { .. } => "not_enough_payment",
            EscrowError::PackageNotExist(_) => "package_not_exist",
            EscrowError::DriverNotRegistered(_) => "driver_not_registered",
            EscrowError::PackageAlreadyAssigned { .. } => "package_already_assigned",
            EscrowError::NotAllowedToSignOffPackage { .. } => "not_allowed_to_sign_off",
            EscrowError::PackageAlreadyDelivered(_) => "package_already_delivered",
        }
    }
}

/// Failures moving funds in or out of custody
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CustodyError {
    /// Source account cannot cover the amount
    #[error("Insufficient funds in {account}: available {available}, requested {requested}")]
    InsufficientFunds {
        /// Debited account
        account: AccountId,
        /// Current balance
        available: Decimal,
        /// Requested amount
        requested: Decimal,
    },

    /// Counterparty refused the transfer
    #[error("Transfer to {account} rejected: {reason}")]
    Rejected {
        /// Counterparty account
        account: AccountId,
        /// Reason given by the custody backend
        reason: String,
    },
}

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Operation rejected by the escrow rules
    #[error(transparent)]
    Escrow(#[from] EscrowError),

    /// Funds could not be moved
    #[error("Custody error: {0}")]
    Custody(#[from] CustodyError),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The escrow rejection carried by this error, if any
    pub fn escrow(&self) -> Option<&EscrowError> {
        match self {
            Error::Escrow(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
