//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the escrow ledger.
//!
//! # Metrics
//!
//! - `escrow_packages_created_total` - Packages created
//! - `escrow_packages_accepted_total` - Packages accepted by a driver
//! - `escrow_sign_offs_total` - Sign-offs that set a flag
//! - `escrow_payments_released_total` - Payments released to drivers
//! - `escrow_rejections_total{reason}` - Operations rejected by escrow rules
//! - `escrow_custody_failures_total` - Collections or releases that failed
//! - `escrow_stranded_payments_total` - Delivered packages whose payment could not be released or restored
//! - `escrow_held_value` - Value currently held in escrow

use crate::error::EscrowError;
use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::fmt;
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Packages created
    pub packages_created: IntCounter,

    /// Packages accepted
    pub packages_accepted: IntCounter,

    /// Sign-offs recorded
    pub sign_offs: IntCounter,

    /// Payments released
    pub payments_released: IntCounter,

    /// Rejections by reason
    pub rejections: IntCounterVec,

    /// Custody failures
    pub custody_failures: IntCounter,

    /// Payments left unreleased on a delivered package
    pub stranded_payments: IntCounter,

    /// Value held in escrow
    pub held_value: Gauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics")
            .field("packages_created", &self.packages_created.get())
            .field("payments_released", &self.payments_released.get())
            .field("held_value", &self.held_value.get())
            .finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let packages_created =
            IntCounter::new("escrow_packages_created_total", "Packages created")?;
        registry.register(Box::new(packages_created.clone()))?;

        let packages_accepted =
            IntCounter::new("escrow_packages_accepted_total", "Packages accepted by a driver")?;
        registry.register(Box::new(packages_accepted.clone()))?;

        let sign_offs = IntCounter::new("escrow_sign_offs_total", "Sign-offs that set a flag")?;
        registry.register(Box::new(sign_offs.clone()))?;

        let payments_released = IntCounter::new(
            "escrow_payments_released_total",
            "Payments released to drivers",
        )?;
        registry.register(Box::new(payments_released.clone()))?;

        let rejections = IntCounterVec::new(
            Opts::new(
                "escrow_rejections_total",
                "Operations rejected by escrow rules",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(rejections.clone()))?;

        let custody_failures = IntCounter::new(
            "escrow_custody_failures_total",
            "Collections or releases that failed",
        )?;
        registry.register(Box::new(custody_failures.clone()))?;

        let stranded_payments = IntCounter::new(
            "escrow_stranded_payments_total",
            "Delivered packages whose payment could not be released or restored",
        )?;
        registry.register(Box::new(stranded_payments.clone()))?;

        let held_value = Gauge::new("escrow_held_value", "Value currently held in escrow")?;
        registry.register(Box::new(held_value.clone()))?;

        Ok(Self {
            packages_created,
            packages_accepted,
            sign_offs,
            payments_released,
            rejections,
            custody_failures,
            stranded_payments,
            held_value,
            registry,
        })
    }

    /// Record package creation
    pub fn record_created(&self, amount: Decimal) {
        self.packages_created.inc();
        self.held_value.add(amount.to_f64().unwrap_or(0.0));
    }

    /// Set the held value gauge, e.g. from persisted packages on startup
    pub fn record_held(&self, amount: Decimal) {
        self.held_value.set(amount.to_f64().unwrap_or(0.0));
    }

    /// Record package acceptance
    pub fn record_accepted(&self) {
        self.packages_accepted.inc();
    }

    /// Record a sign-off that set `flags` flags
    pub fn record_sign_offs(&self, flags: u64) {
        self.sign_offs.inc_by(flags);
    }

    /// Record payment release
    pub fn record_released(&self, amount: Decimal) {
        self.payments_released.inc();
        self.held_value.sub(amount.to_f64().unwrap_or(0.0));
    }

    /// Record escrow rejection
    pub fn record_rejection(&self, err: &EscrowError) {
        self.rejections.with_label_values(&[err.reason()]).inc();
    }

    /// Record custody failure
    pub fn record_custody_failure(&self) {
        self.custody_failures.inc();
    }

    /// Record a payment that needs manual release
    pub fn record_stranded(&self) {
        self.stranded_payments.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode_text(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PackageId;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.packages_created.get(), 0);
        assert_eq!(metrics.payments_released.get(), 0);

        // Independent registries, so a second collector is fine
        assert!(Metrics::new().is_ok());
    }

    #[test]
    fn test_held_value_tracks_escrow() {
        let metrics = Metrics::new().unwrap();
        metrics.record_created(Decimal::new(5, 1));
        metrics.record_created(Decimal::new(25, 2));
        assert_eq!(metrics.packages_created.get(), 2);
        assert!((metrics.held_value.get() - 0.75).abs() < 1e-9);

        metrics.record_released(Decimal::new(5, 1));
        assert_eq!(metrics.payments_released.get(), 1);
        assert!((metrics.held_value.get() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_record_rejection() {
        let metrics = Metrics::new().unwrap();
        let err = EscrowError::PackageNotExist(PackageId::new(3));
        metrics.record_rejection(&err);
        metrics.record_rejection(&err);
        assert_eq!(
            metrics
                .rejections
                .with_label_values(&["package_not_exist"])
                .get(),
            2
        );
    }

    #[test]
    fn test_encode_text() {
        let metrics = Metrics::new().unwrap();
        metrics.record_accepted();
        let text = metrics.encode_text().unwrap();
        assert!(text.contains("escrow_packages_accepted_total 1"));
    }
}
