//! Tensor products of configuration databases and resolution of what is still missing.
//!
//! Candidates are uploaded into a temporary table and the set difference is taken in one pass
//! over it against the stage's index, instead of one round trip per candidate.

use crate::config_db::{IrCutoffDatabase, IrResumDatabase, RedshiftDatabase, UvCutoffDatabase, WavenumberDatabase};
use crate::error::CacheError;
use crate::stage::{Stage, StageKey};
use crate::stage_table::key_probe;
use crate::temp_table::TempTable;
use crate::token::{IrCutoffToken, IrResumToken, RedshiftToken, UvCutoffToken, WavenumberToken};
use crate::transaction::Transaction;
use crate::values::{Redshift, Wavenumber};
use std::collections::HashSet;

/// One point of the k × IR × UV product.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopConfiguration {
    pub k_token: WavenumberToken,
    pub k: Wavenumber,
    pub ir_token: IrCutoffToken,
    pub ir: Wavenumber,
    pub uv_token: UvCutoffToken,
    pub uv: Wavenumber,
}

/// One point of the k × IR × UV × IR-resummation product.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResumConfiguration {
    pub loop_config: LoopConfiguration,
    pub ir_resum_token: IrResumToken,
    pub ir_resum: Wavenumber,
}

pub fn loop_tensor_product(k_db: &WavenumberDatabase, ir_db: &IrCutoffDatabase, uv_db: &UvCutoffDatabase) -> Vec<LoopConfiguration> {
    let mut out = Vec::with_capacity(k_db.len() * ir_db.len() * uv_db.len());
    for (k_token, k) in k_db {
        for (ir_token, ir) in ir_db {
            for (uv_token, uv) in uv_db {
                out.push(LoopConfiguration { k_token, k: *k, ir_token, ir: *ir, uv_token, uv: *uv });
            }
        }
    }
    out
}

pub fn resum_tensor_product(
    k_db: &WavenumberDatabase,
    ir_db: &IrCutoffDatabase,
    uv_db: &UvCutoffDatabase,
    ir_resum_db: &IrResumDatabase,
) -> Vec<ResumConfiguration> {
    let loops = loop_tensor_product(k_db, ir_db, uv_db);
    let mut out = Vec::with_capacity(loops.len() * ir_resum_db.len());
    for loop_config in loops {
        for (ir_resum_token, ir_resum) in ir_resum_db {
            out.push(ResumConfiguration { loop_config, ir_resum_token, ir_resum: *ir_resum });
        }
    }
    out
}

/// Candidates with no stored row in stage `S`, in their original order.
pub fn missing<S: Stage, C>(tx: &Transaction, candidates: Vec<C>, key_of: impl Fn(&C) -> S::Key) -> Result<Vec<C>, CacheError> {
    if candidates.is_empty() {
        return Ok(candidates);
    }
    let staged = TempTable::create(tx, candidates.iter().enumerate().map(|(ordinal, c)| (ordinal as u32, key_of(c).encode())))?;
    let absent = absent_ordinals::<S>(tx, &staged)?;
    staged.discard(tx)?;
    Ok(candidates.into_iter().enumerate().filter(|(ordinal, _)| absent.contains(&(*ordinal as u32))).map(|(_, c)| c).collect())
}

fn absent_ordinals<S: Stage>(tx: &Transaction, staged: &TempTable) -> Result<HashSet<u32>, CacheError> {
    let rows: Vec<(u32, Vec<u8>)> = staged.rows(tx)?;
    let probe = key_probe::<S>(tx)?;
    let mut absent = HashSet::new();
    for (ordinal, key) in rows {
        if !probe.contains(&key)? {
            absent.insert(ordinal);
        }
    }
    Ok(absent)
}

/// A redshift database uploaded once and reused for many per-configuration queries.
pub struct StagedRedshifts<'a> {
    z_db: &'a RedshiftDatabase,
    table: TempTable,
}

impl<'a> StagedRedshifts<'a> {
    pub fn upload(tx: &Transaction, z_db: &'a RedshiftDatabase) -> Result<Self, CacheError> {
        let table = TempTable::create(tx, z_db.iter().map(|(token, z)| (token.id(), *z)))?;
        Ok(StagedRedshifts { z_db, table })
    }

    /// Redshifts not yet stored for the configuration `key_of` completes, or `None` if all are.
    pub fn missing<S: Stage>(&self, tx: &Transaction, key_of: impl Fn(RedshiftToken) -> S::Key) -> Result<Option<RedshiftDatabase>, CacheError> {
        let rows: Vec<(u32, Redshift)> = self.table.rows(tx)?;
        let probe = key_probe::<S>(tx)?;
        let mut absent = HashSet::new();
        for (id, _) in rows {
            if !probe.contains(&key_of(RedshiftToken::new(id)).encode())? {
                absent.insert(id);
            }
        }
        drop(probe);
        if absent.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.z_db.subset(|t| absent.contains(&t.id()))))
        }
    }

    pub fn discard(self, tx: &Transaction) -> Result<(), CacheError> {
        self.table.discard(tx)
    }
}

/// Single-configuration form of [`StagedRedshifts::missing`].
pub fn missing_redshifts<S: Stage>(
    tx: &Transaction,
    z_db: &RedshiftDatabase,
    key_of: impl Fn(RedshiftToken) -> S::Key,
) -> Result<Option<RedshiftDatabase>, CacheError> {
    if z_db.is_empty() {
        return Ok(None);
    }
    let staged = StagedRedshifts::upload(tx, z_db)?;
    let result = staged.missing::<S>(tx, key_of);
    staged.discard(tx)?;
    result
}
