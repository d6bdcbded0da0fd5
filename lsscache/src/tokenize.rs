//! Tolerance keyed lookup-or-insert of configuration values.
//!
//! Each token kind owns a table `id -> bincode(value)`. Lookup scans the table and compares every
//! numeric field of the stored value against the query with the kind's relative tolerance.
//! More than one match means the tolerance is too loose for the data and is reported as a
//! database error; the closest row is never picked.

use crate::error::CacheError;
use crate::token::{kind, LinearPkToken, Token, TokenKind};
use crate::transaction::Transaction;
use crate::values::*;
use redb::{ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub trait Tokenizable<K: TokenKind>: Serialize + DeserializeOwned {
    /// Numeric fields compared componentwise during lookup.
    fn fields(&self) -> Vec<f64>;
    fn tolerance(tolerances: &Tolerances) -> f64;
}

impl Tokenizable<kind::Model> for FrwModel {
    fn fields(&self) -> Vec<f64> {
        FrwModel::fields(self)
    }
    fn tolerance(tolerances: &Tolerances) -> f64 {
        tolerances.model
    }
}

impl Tokenizable<kind::Redshift> for Redshift {
    fn fields(&self) -> Vec<f64> {
        vec![self.0]
    }
    fn tolerance(tolerances: &Tolerances) -> f64 {
        tolerances.redshift
    }
}

macro_rules! wavenumber_kinds {
    ($($kind:ident),*) => {
        $(
            impl Tokenizable<kind::$kind> for Wavenumber {
                fn fields(&self) -> Vec<f64> {
                    vec![self.0]
                }
                fn tolerance(tolerances: &Tolerances) -> f64 {
                    tolerances.wavenumber
                }
            }
        )*
    };
}

wavenumber_kinds!(Wavenumber, UvCutoff, IrCutoff, IrResum);

impl Tokenizable<kind::GrowthParams> for GrowthParams {
    fn fields(&self) -> Vec<f64> {
        vec![if self.eds_mode { 1.0 } else { 0.0 }, self.abs_err, self.rel_err]
    }
    fn tolerance(tolerances: &Tolerances) -> f64 {
        tolerances.growth
    }
}

impl Tokenizable<kind::LoopParams> for LoopParams {
    fn fields(&self) -> Vec<f64> {
        vec![self.abs_err_13, self.rel_err_13, self.abs_err_22, self.rel_err_22]
    }
    fn tolerance(tolerances: &Tolerances) -> f64 {
        tolerances.loop_integral
    }
}

impl Tokenizable<kind::FilterParams> for FilterParams {
    fn fields(&self) -> Vec<f64> {
        vec![self.pk_amplitude, self.pivot, self.index, self.abs_err, self.rel_err]
    }
    fn tolerance(tolerances: &Tolerances) -> f64 {
        tolerances.filter
    }
}

impl Tokenizable<kind::MatsubaraXyParams> for MatsubaraXyParams {
    fn fields(&self) -> Vec<f64> {
        vec![self.qmin, self.qmax]
    }
    fn tolerance(tolerances: &Tolerances) -> f64 {
        tolerances.matsubara_xy
    }
}

pub(crate) fn kind_table<K: TokenKind>() -> TableDefinition<'static, u32, &'static [u8]> {
    TableDefinition::new(K::TABLE)
}

/// Token of the single stored row within `tol` of `value`, if any.
pub fn lookup<K: TokenKind, V: Tokenizable<K>>(tx: &Transaction, value: &V, tol: f64) -> Result<Option<Token<K>>, CacheError> {
    let table = tx.write_tx()?.open_table(kind_table::<K>())?;
    let query = value.fields();
    let mut found: Option<Token<K>> = None;
    for entry in table.iter()? {
        let (id, bytes) = entry?;
        let stored: V = bincode::deserialize(bytes.value())?;
        if fields_within_tolerance(&stored.fields(), &query, tol) {
            if let Some(previous) = found {
                return Err(CacheError::database(format!(
                    "{} lookup is ambiguous: rows {} and {} both match {:?} within tolerance {}",
                    K::LABEL, previous, id.value(), query, tol
                )));
            }
            found = Some(Token::new(id.value()));
        }
    }
    Ok(found)
}

/// Stores `value` under `id = row count`. Does not look for an existing match.
pub fn insert<K: TokenKind, V: Tokenizable<K>>(tx: &Transaction, value: &V) -> Result<Token<K>, CacheError> {
    let mut table = tx.write_tx()?.open_table(kind_table::<K>())?;
    let id = u32::try_from(table.len()?).map_err(|_| CacheError::database(format!("{} table is full", K::LABEL)))?;
    let bytes = bincode::serialize(value)?;
    table.insert(id, bytes.as_slice())?;
    Ok(Token::new(id))
}

pub fn lookup_or_insert<K: TokenKind, V: Tokenizable<K>>(tx: &Transaction, value: &V, tolerances: &Tolerances) -> Result<Token<K>, CacheError> {
    match lookup::<K, V>(tx, value, V::tolerance(tolerances))? {
        Some(token) => Ok(token),
        None => insert::<K, V>(tx, value),
    }
}

pub fn read_value<K: TokenKind, V: DeserializeOwned>(tx: &Transaction, token: Token<K>) -> Result<V, CacheError> {
    let table = tx.write_tx()?.open_table(kind_table::<K>())?;
    let guard = table.get(token.id())?.ok_or_else(|| CacheError::not_found(format!("{:?} has no stored value", token)))?;
    Ok(bincode::deserialize(guard.value())?)
}

/// Every stored value of a kind, in token order.
pub fn read_all<K: TokenKind, V: DeserializeOwned>(tx: &Transaction) -> Result<Vec<(Token<K>, V)>, CacheError> {
    let table = tx.write_tx()?.open_table(kind_table::<K>())?;
    let mut out = Vec::new();
    for entry in table.iter()? {
        let (id, bytes) = entry?;
        out.push((Token::new(id.value()), bincode::deserialize(bytes.value())?));
    }
    Ok(out)
}

/// Datasets are matched by path. A path hit must agree on content hash and model,
/// otherwise the file changed under a stable name and the run stops.
pub fn lookup_or_insert_linear_pk(tx: &Transaction, source: &LinearPkSource) -> Result<LinearPkToken, CacheError> {
    let mut found: Option<(u32, LinearPkSource)> = None;
    {
        let table = tx.write_tx()?.open_table(kind_table::<kind::LinearPk>())?;
        for entry in table.iter()? {
            let (id, bytes) = entry?;
            let stored: LinearPkSource = bincode::deserialize(bytes.value())?;
            if stored.path != source.path {
                continue;
            }
            if let Some((previous, _)) = &found {
                return Err(CacheError::database(format!(
                    "linear Pk lookup is ambiguous: rows {} and {} share path {}",
                    previous, id.value(), source.path
                )));
            }
            found = Some((id.value(), stored));
        }
    }
    match found {
        Some((id, stored)) => {
            if stored.hash != source.hash {
                return Err(CacheError::runtime(format!(
                    "linear Pk {} was stored with hash {} but now hashes to {}",
                    source.path, stored.hash, source.hash
                )));
            }
            if stored.model != source.model {
                return Err(CacheError::runtime(format!(
                    "linear Pk {} is tagged with {:?} but was requested for {:?}",
                    source.path, stored.model, source.model
                )));
            }
            Ok(Token::new(id))
        }
        None => {
            let mut table = tx.write_tx()?.open_table(kind_table::<kind::LinearPk>())?;
            let id = u32::try_from(table.len()?).map_err(|_| CacheError::database("linear Pk table is full"))?;
            table.insert(id, bincode::serialize(source)?.as_slice())?;
            Ok(Token::new(id))
        }
    }
}
