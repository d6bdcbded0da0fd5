use crate::error::CacheError;
use crate::stage::*;
use crate::stage_table::{analyze, rebuild_index, retain_rows};
use crate::transaction::Transaction;
use crate::{info, warn};
use redb::{ReadableTable, TableDefinition};
use std::collections::HashMap;

/// Existence of `(kind table, token id)` pairs, memoized across stages.
struct ReferenceCheck {
    known: HashMap<(&'static str, u32), bool>,
}

impl ReferenceCheck {
    fn exists(&mut self, tx: &Transaction, table: &'static str, id: u32) -> Result<bool, CacheError> {
        if let Some(hit) = self.known.get(&(table, id)) {
            return Ok(*hit);
        }
        let exists = tx.write_tx()?.open_table(TableDefinition::<u32, &[u8]>::new(table))?.get(id)?.is_some();
        self.known.insert((table, id), exists);
        Ok(exists)
    }
}

fn prune<S: Stage>(tx: &Transaction, check: &mut ReferenceCheck) -> Result<u64, CacheError> {
    let removed = retain_rows::<S>(tx, |key| {
        for (table, id) in key.references() {
            if !check.exists(tx, table, id)? {
                return Ok(false);
            }
        }
        Ok(true)
    })?;
    if removed > 0 {
        warn!("{}: dropped {} rows referencing tokens that no longer exist", S::TABLE, removed);
        rebuild_index::<S>(tx)?;
        analyze::<S>(tx)?;
    }
    Ok(removed)
}

/// Removes stage rows whose key names a token missing from its kind table, which is what an
/// interrupted run that wrote results but lost its configuration rows leaves behind.
pub fn drop_inconsistent_configurations(tx: &Transaction) -> Result<u64, CacheError> {
    let mut check = ReferenceCheck { known: HashMap::new() };
    let removed = prune::<TransferStage>(tx, &mut check)?
        + prune::<GrowthStage>(tx, &mut check)?
        + prune::<FilterPkStage>(tx, &mut check)?
        + prune::<LoopIntegralStage>(tx, &mut check)?
        + prune::<MatsubaraXyStage>(tx, &mut check)?
        + prune::<OneLoopPkStage>(tx, &mut check)?
        + prune::<ResumPkStage>(tx, &mut check)?
        + prune::<MultipolePkStage>(tx, &mut check)?;
    info!("Consistency pass removed {} rows", removed);
    Ok(removed)
}
