//! Row storage for computation stages.
//!
//! Every stage has a plain table `row id -> bincode(StoredRow)` and a secondary index
//! `encoded key -> row id`. The index can be dropped for a bulk write and rebuilt afterwards;
//! while it is absent, lookups fall back to scanning the plain table.

use crate::error::CacheError;
use crate::stage::{Stage, StageKey};
use crate::transaction::Transaction;
use crate::{info, warn};
use redb::{ReadableTable, ReadableTableMetadata, Table, TableDefinition, TableHandle};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Instant;

pub(crate) const STATS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("__table_stats");

#[derive(Serialize, Deserialize)]
struct StoredRow<R> {
    key: Vec<u8>,
    row: R,
}

/// Leading field of a `StoredRow`, decoded without touching the row.
#[derive(Deserialize)]
struct StoredKey {
    key: Vec<u8>,
}

/// Size and shape of a stage table, recorded after each index rebuild.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub table_name: String,
    pub rows: u64,
    pub index_entries: u64,
    pub tree_height: u32,
    pub leaf_pages: u64,
    pub branch_pages: u64,
    pub stored_leaf_bytes: u64,
    pub metadata_bytes: u64,
    pub fragmented_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RebuildReport {
    pub rows: u64,
    pub superseded: u64,
}

pub(crate) fn plain_def<S: Stage>() -> TableDefinition<'static, u64, &'static [u8]> {
    TableDefinition::new(S::TABLE)
}

pub(crate) fn index_def<S: Stage>() -> TableDefinition<'static, &'static [u8], u64> {
    TableDefinition::new(S::INDEX)
}

pub fn index_exists<S: Stage>(tx: &Transaction) -> Result<bool, CacheError> {
    Ok(tx.write_tx()?.list_tables()?.any(|h| h.name() == S::INDEX))
}

/// Creates the plain and index tables if they do not exist yet.
pub fn ensure_tables<S: Stage>(tx: &Transaction) -> Result<(), CacheError> {
    let wtx = tx.write_tx()?;
    wtx.open_table(plain_def::<S>())?;
    wtx.open_table(index_def::<S>())?;
    Ok(())
}

/// Persists one row. A key that is already stored gets its row replaced.
pub fn store_row<S: Stage>(tx: &Transaction, key: &S::Key, row: &S::Row) -> Result<u64, CacheError> {
    let encoded = key.encode();
    let bytes = bincode::serialize(&StoredRow { key: encoded.clone(), row })?;
    let indexed = index_exists::<S>(tx)?;
    let wtx = tx.write_tx()?;
    let mut plain = wtx.open_table(plain_def::<S>())?;
    if indexed {
        let mut index = wtx.open_table(index_def::<S>())?;
        let existing = index.get(encoded.as_slice())?.map(|g| g.value());
        let row_id = match existing {
            Some(id) => id,
            None => next_row_id(&plain)?,
        };
        plain.insert(row_id, bytes.as_slice())?;
        index.insert(encoded.as_slice(), row_id)?;
        Ok(row_id)
    } else {
        let row_id = next_row_id(&plain)?;
        plain.insert(row_id, bytes.as_slice())?;
        Ok(row_id)
    }
}

fn next_row_id(plain: &Table<'_, u64, &'static [u8]>) -> Result<u64, CacheError> {
    Ok(plain.last()?.map(|(k, _)| k.value() + 1).unwrap_or(0))
}

pub fn find_row<S: Stage>(tx: &Transaction, key: &S::Key) -> Result<S::Row, CacheError> {
    find_row_opt::<S>(tx, key)?.ok_or_else(|| CacheError::not_found(format!("{} has no row for {:?}", S::TABLE, key)))
}

pub fn find_row_opt<S: Stage>(tx: &Transaction, key: &S::Key) -> Result<Option<S::Row>, CacheError> {
    let encoded = key.encode();
    let indexed = index_exists::<S>(tx)?;
    let wtx = tx.write_tx()?;
    let plain = wtx.open_table(plain_def::<S>())?;
    if indexed {
        let index = wtx.open_table(index_def::<S>())?;
        let row_id = match index.get(encoded.as_slice())? {
            Some(guard) => guard.value(),
            None => return Ok(None),
        };
        match plain.get(row_id)? {
            Some(guard) => Ok(Some(bincode::deserialize::<StoredRow<S::Row>>(guard.value())?.row)),
            None => Err(CacheError::database(format!("{} points at missing row {}", S::INDEX, row_id))),
        }
    } else {
        let mut found = None;
        for entry in plain.iter()? {
            let (_, bytes) = entry?;
            let stored: StoredRow<S::Row> = bincode::deserialize(bytes.value())?;
            if stored.key == encoded {
                found = Some(stored.row);
            }
        }
        Ok(found)
    }
}

/// Every stored row of a stage in row order.
pub fn all_rows<S: Stage>(tx: &Transaction) -> Result<Vec<(S::Key, S::Row)>, CacheError> {
    let table = tx.write_tx()?.open_table(plain_def::<S>())?;
    let mut out = Vec::new();
    for entry in table.iter()? {
        let (_, bytes) = entry?;
        let stored: StoredRow<S::Row> = bincode::deserialize(bytes.value())?;
        out.push((S::Key::decode(&stored.key)?, stored.row));
    }
    Ok(out)
}

pub fn row_count<S: Stage>(tx: &Transaction) -> Result<u64, CacheError> {
    Ok(tx.write_tx()?.open_table(plain_def::<S>())?.len()?)
}

/// Answers "is this key stored" for the duration of one resolver pass.
pub(crate) enum KeyProbe<'txn> {
    Indexed(Table<'txn, &'static [u8], u64>),
    Scanned(HashSet<Vec<u8>>),
}

impl KeyProbe<'_> {
    pub(crate) fn contains(&self, key: &[u8]) -> Result<bool, CacheError> {
        match self {
            KeyProbe::Indexed(index) => Ok(index.get(key)?.is_some()),
            KeyProbe::Scanned(keys) => Ok(keys.contains(key)),
        }
    }
}

pub(crate) fn key_probe<S: Stage>(tx: &Transaction) -> Result<KeyProbe<'_>, CacheError> {
    let indexed = index_exists::<S>(tx)?;
    let wtx = tx.write_tx()?;
    if indexed {
        Ok(KeyProbe::Indexed(wtx.open_table(index_def::<S>())?))
    } else {
        let plain = wtx.open_table(plain_def::<S>())?;
        let mut keys = HashSet::new();
        for entry in plain.iter()? {
            let (_, bytes) = entry?;
            keys.insert(bincode::deserialize::<StoredKey>(bytes.value())?.key);
        }
        Ok(KeyProbe::Scanned(keys))
    }
}

/// Removes rows the predicate rejects, together with their index entries.
/// Returns how many were removed.
pub fn retain_rows<S: Stage>(tx: &Transaction, mut keep: impl FnMut(&S::Key) -> Result<bool, CacheError>) -> Result<u64, CacheError> {
    let indexed = index_exists::<S>(tx)?;
    let wtx = tx.write_tx()?;
    let mut plain = wtx.open_table(plain_def::<S>())?;
    let mut doomed = Vec::new();
    for entry in plain.iter()? {
        let (row_id, bytes) = entry?;
        let stored: StoredKey = bincode::deserialize(bytes.value())?;
        if !keep(&S::Key::decode(&stored.key)?)? {
            doomed.push((row_id.value(), stored.key));
        }
    }
    for (row_id, _) in &doomed {
        plain.remove(row_id)?;
    }
    if indexed {
        let mut index = wtx.open_table(index_def::<S>())?;
        for (_, key) in &doomed {
            index.remove(key.as_slice())?;
        }
    }
    Ok(doomed.len() as u64)
}

/// Drops the stage's secondary index ahead of a bulk write.
pub fn drop_index<S: Stage>(tx: &Transaction) -> Result<bool, CacheError> {
    Ok(tx.write_tx()?.delete_table(index_def::<S>())?)
}

/// Rebuilds the secondary index from the plain table. When a key was written more than once
/// while the index was down, the latest row wins and older ones are removed.
pub fn rebuild_index<S: Stage>(tx: &Transaction) -> Result<RebuildReport, CacheError> {
    let start = Instant::now();
    let wtx = tx.write_tx()?;
    wtx.delete_table(index_def::<S>())?;
    let mut plain = wtx.open_table(plain_def::<S>())?;
    let mut index = wtx.open_table(index_def::<S>())?;

    let mut latest: HashMap<Vec<u8>, u64> = HashMap::new();
    let mut superseded = Vec::new();
    for entry in plain.iter()? {
        let (row_id, bytes) = entry?;
        let stored: StoredKey = bincode::deserialize(bytes.value())?;
        if let Some(older) = latest.insert(stored.key, row_id.value()) {
            superseded.push(older);
        }
    }
    for row_id in &superseded {
        plain.remove(row_id)?;
    }
    if !superseded.is_empty() {
        warn!("{}: {} rows were superseded by later writes of the same key", S::TABLE, superseded.len());
    }
    for (key, row_id) in latest.iter() {
        index.insert(key.as_slice(), *row_id)?;
    }
    info!("Rebuilt {} over {} rows in {}", S::INDEX, latest.len(), crate::logger::format_elapsed(start.elapsed()));
    Ok(RebuildReport { rows: latest.len() as u64, superseded: superseded.len() as u64 })
}

/// Refreshes and records table statistics for the stage.
pub fn analyze<S: Stage>(tx: &Transaction) -> Result<TableInfo, CacheError> {
    let indexed = index_exists::<S>(tx)?;
    let wtx = tx.write_tx()?;
    let plain = wtx.open_table(plain_def::<S>())?;
    let index_entries = if indexed { wtx.open_table(index_def::<S>())?.len()? } else { 0 };
    let stats = plain.stats()?;
    let info = TableInfo {
        table_name: S::TABLE.to_string(),
        rows: plain.len()?,
        index_entries,
        tree_height: stats.tree_height(),
        leaf_pages: stats.leaf_pages(),
        branch_pages: stats.branch_pages(),
        stored_leaf_bytes: stats.stored_bytes(),
        metadata_bytes: stats.metadata_bytes(),
        fragmented_bytes: stats.fragmented_bytes(),
    };
    let mut stats_table = wtx.open_table(STATS_TABLE)?;
    stats_table.insert(S::TABLE, bincode::serialize(&info)?.as_slice())?;
    info!(
        "{}: {} rows, {} index entries, height {}, {} leaf pages",
        info.table_name, info.rows, info.index_entries, info.tree_height, info.leaf_pages
    );
    Ok(info)
}

pub fn table_info(tx: &Transaction, table: &str) -> Result<Option<TableInfo>, CacheError> {
    let stats_table = tx.write_tx()?.open_table(STATS_TABLE)?;
    let info = match stats_table.get(table)? {
        Some(guard) => Some(bincode::deserialize(guard.value())?),
        None => None,
    };
    Ok(info)
}
