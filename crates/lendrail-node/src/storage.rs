//! RocksDB storage backend for the lendrail node.
//!
//! Each table lives in its own column family, keyed by the row's primary
//! key with the JSON-encoded row as value. A store write lands as one
//! `WriteBatch`, so a composite write (loan plus its create action, proof
//! plus its follow-up action) is all-or-nothing on disk as well.

use anyhow::Result;
use lendrail_core::{Row, RowSink, StoreError, TableStore};
use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;

/// Column family names, one per table.
const CF_LOANS: &str = "loans";
const CF_ACTIONS: &str = "actions";
const CF_FIAT_PROOFS: &str = "fiat_proofs";
const CF_GUARDRAILS: &str = "guardrails";
const CF_INCIDENTS: &str = "incidents";

const COLUMN_FAMILIES: [&str; 5] = [CF_LOANS, CF_ACTIONS, CF_FIAT_PROOFS, CF_GUARDRAILS, CF_INCIDENTS];

/// Store whose rows are written through to RocksDB.
pub type PersistentStore = TableStore<Storage>;

/// RocksDB-backed row storage.
pub struct Storage {
    db: DB,
}

impl Storage {
    /// Open or create a RocksDB database at the given path with column families.
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, cf_descriptors)?;

        Ok(Self { db })
    }

    /// Write rows atomically.
    pub fn put_rows(&self, rows: &[Row]) -> Result<()> {
        let mut batch = WriteBatch::default();
        for row in rows {
            let cf = self
                .db
                .cf_handle(row.table())
                .ok_or_else(|| anyhow::anyhow!("column family '{}' not found", row.table()))?;
            batch.put_cf(&cf, row.key().as_bytes(), serde_json::to_vec(row)?);
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Read a single row back.
    pub fn get_row(&self, table: &str, key: &str) -> Result<Option<Row>> {
        let cf = self
            .db
            .cf_handle(table)
            .ok_or_else(|| anyhow::anyhow!("column family '{}' not found", table))?;
        match self.db.get_cf(&cf, key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every persisted row, table by table.
    pub fn load_rows(&self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        for name in COLUMN_FAMILIES {
            let cf = self
                .db
                .cf_handle(name)
                .ok_or_else(|| anyhow::anyhow!("column family '{}' not found", name))?;
            for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
                let (_, value) = item?;
                rows.push(serde_json::from_slice(&value)?);
            }
        }
        Ok(rows)
    }
}

impl RowSink for Storage {
    fn persist(&self, rows: &[Row]) -> Result<(), StoreError> {
        self.put_rows(rows)
            .map_err(|e| StoreError::Backend(e.to_string()))
    }
}

/// Open the database and rebuild the in-memory tables from it.
pub fn open_store(path: &Path) -> Result<PersistentStore> {
    let storage = Storage::open(path)?;
    let rows = storage.load_rows()?;
    tracing::info!(rows = rows.len(), path = %path.display(), "store loaded");
    Ok(TableStore::with_sink(storage, rows))
}
