//! Fund custody
//!
//! The ledger never touches balances directly. Funds enter escrow through
//! [`Custody::collect`] when a package is created and leave through
//! [`Custody::release`] when delivery is confirmed. `release` is the one
//! point where control passes to code outside the ledger, and an
//! implementation may call back into the ledger before it returns.

use crate::{error::CustodyError, types::AccountId};
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;

/// Moves funds between participants and the escrow
pub trait Custody: Send + Sync {
    /// Take `amount` from `from` into escrow
    fn collect(&self, from: &AccountId, amount: Decimal) -> Result<(), CustodyError>;

    /// Pay `amount` out of escrow to `to`
    fn release(&self, to: &AccountId, amount: Decimal) -> Result<(), CustodyError>;

    /// Make sure at least `outstanding` is held in escrow.
    ///
    /// Called once when the ledger opens, with the total payment of all
    /// packages not yet delivered. Backends whose escrow outlives the
    /// process can keep the default.
    fn restore_held(&self, outstanding: Decimal) -> Result<(), CustodyError> {
        let _ = outstanding;
        Ok(())
    }
}

/// In-process balance book
///
/// Tracks participant balances and the total currently held in escrow.
#[derive(Debug, Default)]
pub struct BalanceBook {
    balances: DashMap<AccountId, Decimal>,
    held: Mutex<Decimal>,
}

impl BalanceBook {
    /// Empty book
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit `amount` to `account` from outside the system
    pub fn fund(&self, account: &AccountId, amount: Decimal) {
        *self.balances.entry(account.clone()).or_insert(Decimal::ZERO) += amount;
    }

    /// Current balance of `account`
    pub fn balance_of(&self, account: &AccountId) -> Decimal {
        self.balances
            .get(account)
            .map(|balance| *balance)
            .unwrap_or(Decimal::ZERO)
    }

    /// Total currently held in escrow
    pub fn held(&self) -> Decimal {
        *self.held.lock()
    }

    /// Sum of all balances plus escrow; constant under collect/release
    pub fn total(&self) -> Decimal {
        let balances: Decimal = self.balances.iter().map(|entry| *entry.value()).sum();
        balances + self.held()
    }
}

impl Custody for BalanceBook {
    fn collect(&self, from: &AccountId, amount: Decimal) -> Result<(), CustodyError> {
        {
            let mut balance = self
                .balances
                .entry(from.clone())
                .or_insert(Decimal::ZERO);
            if *balance < amount {
                return Err(CustodyError::InsufficientFunds {
                    account: from.clone(),
                    available: *balance,
                    requested: amount,
                });
            }
            *balance -= amount;
        }

        *self.held.lock() += amount;
        Ok(())
    }

    fn release(&self, to: &AccountId, amount: Decimal) -> Result<(), CustodyError> {
        {
            let mut held = self.held.lock();
            if *held < amount {
                return Err(CustodyError::Rejected {
                    account: to.clone(),
                    reason: format!("escrow holds {}, cannot release {}", *held, amount),
                });
            }
            *held -= amount;
        }

        self.fund(to, amount);
        Ok(())
    }

    fn restore_held(&self, outstanding: Decimal) -> Result<(), CustodyError> {
        let mut held = self.held.lock();
        if *held < outstanding {
            tracing::info!(held = %*held, outstanding = %outstanding, "Restoring escrow held by open packages");
            *held = outstanding;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_and_release() {
        let book = BalanceBook::new();
        let alice = AccountId::new("alice");
        let bob = AccountId::new("bob");
        book.fund(&alice, Decimal::ONE);

        book.collect(&alice, Decimal::new(25, 2)).unwrap();
        assert_eq!(book.balance_of(&alice), Decimal::new(75, 2));
        assert_eq!(book.held(), Decimal::new(25, 2));

        book.release(&bob, Decimal::new(25, 2)).unwrap();
        assert_eq!(book.balance_of(&bob), Decimal::new(25, 2));
        assert_eq!(book.held(), Decimal::ZERO);
        assert_eq!(book.total(), Decimal::ONE);
    }

    #[test]
    fn test_collect_insufficient_funds() {
        let book = BalanceBook::new();
        let alice = AccountId::new("alice");
        book.fund(&alice, Decimal::new(1, 4));

        let err = book.collect(&alice, Decimal::new(1, 3)).unwrap_err();
        assert_eq!(
            err,
            CustodyError::InsufficientFunds {
                account: alice.clone(),
                available: Decimal::new(1, 4),
                requested: Decimal::new(1, 3),
            }
        );
        assert_eq!(book.balance_of(&alice), Decimal::new(1, 4));
        assert_eq!(book.held(), Decimal::ZERO);
    }

    #[test]
    fn test_restore_held_after_restart() {
        let book = BalanceBook::new();
        let driver = AccountId::new("driver");
        book.restore_held(Decimal::new(3, 3)).unwrap();
        assert_eq!(book.held(), Decimal::new(3, 3));

        book.release(&driver, Decimal::new(1, 3)).unwrap();
        assert_eq!(book.balance_of(&driver), Decimal::new(1, 3));

        // Never lowers what is already held
        book.restore_held(Decimal::new(1, 3)).unwrap();
        assert_eq!(book.held(), Decimal::new(2, 3));
    }

    #[test]
    fn test_release_more_than_held() {
        let book = BalanceBook::new();
        let bob = AccountId::new("bob");
        assert!(matches!(
            book.release(&bob, Decimal::ONE),
            Err(CustodyError::Rejected { .. })
        ));
        assert_eq!(book.balance_of(&bob), Decimal::ZERO);
    }
}
