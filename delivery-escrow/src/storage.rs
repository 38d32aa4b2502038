//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `packages` - Package records (key: package_id, big-endian)
//! - `drivers` - Driver registry (key: account id bytes, value: registration time)
//! - `events` - Per-package event log (key: package_id || sequence)
//! - `meta` - Ledger-wide counters and constants
//!
//! Every multi-record update goes through a single `WriteBatch`, so a
//! transition is either fully on disk or not at all.

use crate::{
    error::{Error, Result},
    types::{AccountId, EscrowEvent, Package, PackageId},
    Config,
};
use chrono::{DateTime, Utc};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch,
    WriteOptions, DB,
};
use rust_decimal::Decimal;
use std::fmt;
use std::path::PathBuf;

/// Column family names
const CF_PACKAGES: &str = "packages";
const CF_DRIVERS: &str = "drivers";
const CF_EVENTS: &str = "events";
const CF_META: &str = "meta";

/// Meta keys
pub(crate) const META_NEXT_PACKAGE_ID: &[u8] = b"next_package_id";
pub(crate) const META_NEXT_EVENT_SEQUENCE: &[u8] = b"next_event_sequence";
const META_MINIMUM_PAYMENT: &[u8] = b"minimum_payment";

/// Storage wrapper for RocksDB
pub struct Storage {
    db: DB,
    path: PathBuf,
    sync_writes: bool,
    #[cfg(test)]
    fail_writes: std::sync::atomic::AtomicBool,
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.path)
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_PACKAGES, Self::cf_options_packages()),
            ColumnFamilyDescriptor::new(CF_DRIVERS, Self::cf_options_drivers()),
            ColumnFamilyDescriptor::new(CF_EVENTS, Self::cf_options_events()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened escrow store");

        Ok(Self {
            db,
            path: path.clone(),
            sync_writes: config.rocksdb.sync_writes,
            #[cfg(test)]
            fail_writes: std::sync::atomic::AtomicBool::new(false),
        })
    }

    // Column family options

    fn cf_options_packages() -> Options {
        let mut opts = Options::default();
        // Packages are read on every operation, use LZ4 for speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_drivers() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        // Membership lookups benefit from bloom filters
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_options_events() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        self.check_writable()?;
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &opts)?;
        Ok(())
    }

    fn read_u64(&self, key: &[u8]) -> Result<Option<u64>> {
        let cf = self.cf_handle(CF_META)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    Error::Storage(format!(
                        "Corrupt meta value for {}",
                        String::from_utf8_lossy(key)
                    ))
                })?;
                Ok(Some(u64::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    #[cfg(not(test))]
    fn check_writable(&self) -> Result<()> {
        Ok(())
    }

    #[cfg(test)]
    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::Storage("write refused".to_string()));
        }
        Ok(())
    }

    /// Make every following write fail until switched back
    #[cfg(test)]
    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Overwrite a meta counter with bytes that do not decode
    #[cfg(test)]
    pub(crate) fn corrupt_meta(&self, key: &[u8]) -> Result<()> {
        let cf = self.cf_handle(CF_META)?;
        self.db.put_cf(cf, key, [0u8; 3])?;
        Ok(())
    }

    // Meta

    /// Id the next created package will receive
    pub fn next_package_id(&self) -> Result<PackageId> {
        Ok(self
            .read_u64(META_NEXT_PACKAGE_ID)?
            .map(PackageId::new)
            .unwrap_or(PackageId::FIRST))
    }

    /// Sequence number the next event will receive
    pub fn next_event_sequence(&self) -> Result<u64> {
        Ok(self.read_u64(META_NEXT_EVENT_SEQUENCE)?.unwrap_or(1))
    }

    /// Minimum payment fixed at store creation
    pub fn minimum_payment(&self) -> Result<Option<Decimal>> {
        let cf = self.cf_handle(CF_META)?;
        match self.db.get_cf(cf, META_MINIMUM_PAYMENT)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Persist the minimum payment
    pub fn put_minimum_payment(&self, amount: Decimal) -> Result<()> {
        let cf = self.cf_handle(CF_META)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, META_MINIMUM_PAYMENT, bincode::serialize(&amount)?);
        self.write(batch)
    }

    // Package operations

    /// Get package by ID
    pub fn get_package(&self, id: PackageId) -> Result<Option<Package>> {
        let cf = self.cf_handle(CF_PACKAGES)?;
        match self.db.get_cf(cf, id.to_be_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Store a new package, advance the id counter and append its events (atomic)
    pub fn insert_package_atomic(
        &self,
        package: &Package,
        next_package_id: PackageId,
        events: &[EscrowEvent],
    ) -> Result<()> {
        let mut batch = WriteBatch::default();

        self.stage_package(&mut batch, package)?;

        let cf_meta = self.cf_handle(CF_META)?;
        batch.put_cf(
            cf_meta,
            META_NEXT_PACKAGE_ID,
            next_package_id.value().to_be_bytes(),
        );

        self.stage_events(&mut batch, events)?;

        self.write(batch)
    }

    /// Update a package record and append its events (atomic)
    pub fn update_package_atomic(&self, package: &Package, events: &[EscrowEvent]) -> Result<()> {
        let mut batch = WriteBatch::default();
        self.stage_package(&mut batch, package)?;
        self.stage_events(&mut batch, events)?;
        self.write(batch)
    }

    /// Append events without touching the package record (atomic)
    #[cfg(test)]
    pub(crate) fn append_events(&self, events: &[EscrowEvent]) -> Result<()> {
        let mut batch = WriteBatch::default();
        self.stage_events(&mut batch, events)?;
        self.write(batch)
    }

    /// Put back a package's previous record and drop the given events (atomic).
    ///
    /// Compensates an `update_package_atomic` whose follow-up interaction
    /// failed. The event sequence counter is left as is, so sequence numbers
    /// are never handed out twice.
    pub fn revert_package_atomic(&self, previous: &Package, events: &[EscrowEvent]) -> Result<()> {
        let mut batch = WriteBatch::default();
        self.stage_package(&mut batch, previous)?;

        let cf_events = self.cf_handle(CF_EVENTS)?;
        for event in events {
            batch.delete_cf(cf_events, Self::event_key(event.package_id, event.sequence));
        }

        self.write(batch)
    }

    /// Total payment held by packages that are not yet delivered
    pub fn outstanding_escrow(&self) -> Result<Decimal> {
        let cf = self.cf_handle(CF_PACKAGES)?;
        let mut total = Decimal::ZERO;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let package: Package = bincode::deserialize(&value)?;
            if !package.is_delivered() {
                total += package.payment_amount;
            }
        }
        Ok(total)
    }

    fn stage_package(&self, batch: &mut WriteBatch, package: &Package) -> Result<()> {
        let cf = self.cf_handle(CF_PACKAGES)?;
        batch.put_cf(cf, package.id.to_be_bytes(), bincode::serialize(package)?);
        Ok(())
    }

    fn stage_events(&self, batch: &mut WriteBatch, events: &[EscrowEvent]) -> Result<()> {
        let Some(last) = events.last() else {
            return Ok(());
        };

        let cf_events = self.cf_handle(CF_EVENTS)?;
        for event in events {
            let key = Self::event_key(event.package_id, event.sequence);
            batch.put_cf(cf_events, key, bincode::serialize(event)?);
        }

        let cf_meta = self.cf_handle(CF_META)?;
        batch.put_cf(
            cf_meta,
            META_NEXT_EVENT_SEQUENCE,
            (last.sequence + 1).to_be_bytes(),
        );
        Ok(())
    }

    // Event operations

    /// Get events of a package in sequence order
    pub fn get_package_events(&self, package_id: PackageId) -> Result<Vec<EscrowEvent>> {
        let cf = self.cf_handle(CF_EVENTS)?;
        let prefix = package_id.to_be_bytes();

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));

        let mut events = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            events.push(bincode::deserialize(&value)?);
        }

        Ok(events)
    }

    fn event_key(package_id: PackageId, sequence: u64) -> [u8; 16] {
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&package_id.to_be_bytes());
        key[8..].copy_from_slice(&sequence.to_be_bytes());
        key
    }

    // Driver registry

    /// Record a driver registration
    pub fn put_driver(&self, account: &AccountId, registered_at: DateTime<Utc>) -> Result<()> {
        let cf = self.cf_handle(CF_DRIVERS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(
            cf,
            account.as_str().as_bytes(),
            bincode::serialize(&registered_at)?,
        );
        self.write(batch)
    }

    /// Registration time of a driver, if registered
    pub fn get_driver(&self, account: &AccountId) -> Result<Option<DateTime<Utc>>> {
        let cf = self.cf_handle(CF_DRIVERS)?;
        match self.db.get_cf(cf, account.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    // Statistics

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        let total_packages = self.next_package_id()?.value() - 1;
        let total_drivers = self.approximate_count(self.cf_handle(CF_DRIVERS)?)?;
        let total_events = self.approximate_count(self.cf_handle(CF_EVENTS)?)?;

        Ok(StorageStats {
            total_packages,
            total_drivers,
            total_events,
        })
    }

    fn approximate_count(&self, cf: &ColumnFamily) -> Result<u64> {
        let prop = self
            .db
            .property_int_value_cf(cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);

        Ok(prop)
    }

    /// Flush memtables to disk (graceful shutdown)
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        tracing::info!(path = ?self.path, "Escrow store flushed");
        Ok(())
    }
}

/// Storage statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageStats {
    /// Packages ever created
    pub total_packages: u64,
    /// Registered drivers (RocksDB estimate)
    pub total_drivers: u64,
    /// Events in the log (RocksDB estimate)
    pub total_events: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventKind;
    use tempfile::TempDir;

    fn test_config() -> (Config, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;
        (config, temp_dir)
    }

    fn test_package(id: u64) -> Package {
        Package {
            id: PackageId::new(id),
            requester: AccountId::new("requester"),
            driver: None,
            payment_amount: Decimal::new(1, 3),
            location_from: "location A".to_string(),
            location_to: "location B".to_string(),
            notes: "some note".to_string(),
            requester_signed_off: false,
            driver_signed_off: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn test_event(package_id: u64, sequence: u64, kind: EventKind) -> EscrowEvent {
        EscrowEvent {
            sequence,
            package_id: PackageId::new(package_id),
            kind,
            actor: AccountId::new("requester"),
            amount: None,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_storage_open_defaults() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        assert_eq!(storage.next_package_id().unwrap(), PackageId::FIRST);
        assert_eq!(storage.next_event_sequence().unwrap(), 1);
        assert_eq!(storage.minimum_payment().unwrap(), None);
        assert!(storage.get_package(PackageId::FIRST).unwrap().is_none());
    }

    #[test]
    fn test_insert_package_atomic() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();

        let package = test_package(1);
        let event = test_event(1, 1, EventKind::PackageCreated);
        storage
            .insert_package_atomic(&package, PackageId::new(2), &[event.clone()])
            .unwrap();

        assert_eq!(storage.get_package(PackageId::FIRST).unwrap(), Some(package));
        assert_eq!(storage.next_package_id().unwrap(), PackageId::new(2));
        assert_eq!(storage.next_event_sequence().unwrap(), 2);
        assert_eq!(storage.get_package_events(PackageId::FIRST).unwrap(), vec![event]);
    }

    #[test]
    fn test_events_are_scoped_per_package() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();

        storage
            .append_events(&[
                test_event(1, 1, EventKind::PackageCreated),
                test_event(2, 2, EventKind::PackageCreated),
                test_event(1, 3, EventKind::PackageAccepted),
                test_event(3, 4, EventKind::PackageCreated),
            ])
            .unwrap();

        let events = storage.get_package_events(PackageId::FIRST).unwrap();
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 3]);
        assert_eq!(storage.get_package_events(PackageId::new(2)).unwrap().len(), 1);
        assert!(storage.get_package_events(PackageId::new(9)).unwrap().is_empty());
        assert_eq!(storage.next_event_sequence().unwrap(), 5);
    }

    #[test]
    fn test_drivers() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let driver = AccountId::new("driver");

        assert!(storage.get_driver(&driver).unwrap().is_none());

        let at = Utc::now();
        storage.put_driver(&driver, at).unwrap();
        assert_eq!(storage.get_driver(&driver).unwrap(), Some(at));
    }

    #[test]
    fn test_reopen_preserves_state() {
        let (config, _temp) = test_config();
        {
            let storage = Storage::open(&config).unwrap();
            storage.put_minimum_payment(Decimal::new(5, 2)).unwrap();
            storage
                .insert_package_atomic(&test_package(1), PackageId::new(2), &[])
                .unwrap();
            storage.flush().unwrap();
        }

        let storage = Storage::open(&config).unwrap();
        assert_eq!(storage.minimum_payment().unwrap(), Some(Decimal::new(5, 2)));
        assert_eq!(storage.next_package_id().unwrap(), PackageId::new(2));
        assert!(storage.get_package(PackageId::FIRST).unwrap().is_some());
    }

    #[test]
    fn test_stats() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        storage
            .insert_package_atomic(
                &test_package(1),
                PackageId::new(2),
                &[test_event(1, 1, EventKind::PackageCreated)],
            )
            .unwrap();

        let stats = storage.get_stats().unwrap();
        assert_eq!(stats.total_packages, 1);
    }

    #[test]
    fn test_revert_package_atomic() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();

        let before = test_package(1);
        storage
            .insert_package_atomic(&before, PackageId::new(2), &[test_event(1, 1, EventKind::PackageCreated)])
            .unwrap();

        let mut after = before.clone();
        after.requester_signed_off = true;
        let signed = test_event(
            1,
            2,
            EventKind::DeliverySignedOff {
                role: crate::types::SignOffRole::Requester,
            },
        );
        storage.update_package_atomic(&after, &[signed.clone()]).unwrap();
        assert_eq!(storage.get_package_events(PackageId::FIRST).unwrap().len(), 2);

        storage.revert_package_atomic(&before, &[signed]).unwrap();
        assert_eq!(storage.get_package(PackageId::FIRST).unwrap(), Some(before));
        assert_eq!(storage.get_package_events(PackageId::FIRST).unwrap().len(), 1);
        // Sequence numbers are not reused
        assert_eq!(storage.next_event_sequence().unwrap(), 3);
    }

    #[test]
    fn test_outstanding_escrow() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();

        let open = test_package(1);
        let mut delivered = test_package(2);
        delivered.requester_signed_off = true;
        delivered.driver_signed_off = true;
        storage.insert_package_atomic(&open, PackageId::new(2), &[]).unwrap();
        storage.insert_package_atomic(&delivered, PackageId::new(3), &[]).unwrap();

        assert_eq!(storage.outstanding_escrow().unwrap(), Decimal::new(1, 3));
    }
}
