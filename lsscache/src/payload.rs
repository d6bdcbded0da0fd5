//! Payloads crossing the cache boundary: results coming back from workers (`store`) and
//! upstream data assembled from stored rows (`find_*`).

use crate::config_db::{RedshiftDatabase, WavenumberDatabase};
use crate::error::CacheError;
use crate::stage::*;
use crate::stage_table::{find_row, store_row};
use crate::token::*;
use crate::transaction::Transaction;
use crate::values::{Redshift, Wavenumber};
use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

pub(crate) const LINEAR_PK_DATA: TableDefinition<u32, &[u8]> = TableDefinition::new("Pk_linear");

/// A worker result for stage `S`, expanded into rows for a given model.
pub trait StageResult: Send + 'static {
    type S: Stage;
    fn rows(&self, model: ModelToken) -> Vec<(<Self::S as Stage>::Key, <Self::S as Stage>::Row)>;
}

/// Persists every row of a worker result. Returns the number of rows written.
pub fn store<R: StageResult>(tx: &Transaction, model: ModelToken, result: &R) -> Result<usize, CacheError> {
    let rows = result.rows(model);
    for (key, row) in &rows {
        store_row::<R::S>(tx, key, row)?;
    }
    Ok(rows.len())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResult {
    pub k: WavenumberToken,
    pub rows: Vec<(RedshiftToken, TransferRow)>,
}

impl StageResult for TransferResult {
    type S = TransferStage;
    fn rows(&self, model: ModelToken) -> Vec<(TransferKey, TransferRow)> {
        self.rows.iter().map(|(z, row)| (TransferKey { model, k: self.k, z: *z }, row.clone())).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrowthResult {
    pub params: GrowthParamsToken,
    pub rows: Vec<(RedshiftToken, GrowthRow)>,
}

impl StageResult for GrowthResult {
    type S = GrowthStage;
    fn rows(&self, model: ModelToken) -> Vec<(GrowthKey, GrowthRow)> {
        self.rows.iter().map(|(z, row)| (GrowthKey { model, params: self.params, z: *z }, row.clone())).collect()
    }
}

/// Filtered spectra are tagged by their dataset, which already names a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterPkResult {
    pub pk: LinearPkToken,
    pub params: FilterParamsToken,
    pub k: WavenumberToken,
    pub row: FilterPkRow,
}

impl StageResult for FilterPkResult {
    type S = FilterPkStage;
    fn rows(&self, _model: ModelToken) -> Vec<(FilterPkKey, FilterPkRow)> {
        vec![(FilterPkKey { pk: self.pk, params: self.params, k: self.k }, self.row.clone())]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopIntegralResult {
    pub params: LoopParamsToken,
    pub k: WavenumberToken,
    pub pk: LinearPkToken,
    pub ir: IrCutoffToken,
    pub uv: UvCutoffToken,
    pub row: LoopIntegralRow,
}

impl StageResult for LoopIntegralResult {
    type S = LoopIntegralStage;
    fn rows(&self, model: ModelToken) -> Vec<(LoopIntegralKey, LoopIntegralRow)> {
        let key = LoopIntegralKey { model, params: self.params, k: self.k, pk: self.pk, ir: self.ir, uv: self.uv };
        vec![(key, self.row.clone())]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatsubaraXyResult {
    pub params: MatsubaraXyParamsToken,
    pub pk: LinearPkToken,
    pub ir_resum: IrResumToken,
    pub row: MatsubaraXyRow,
}

impl StageResult for MatsubaraXyResult {
    type S = MatsubaraXyStage;
    fn rows(&self, model: ModelToken) -> Vec<(MatsubaraXyKey, MatsubaraXyRow)> {
        vec![(MatsubaraXyKey { model, params: self.params, pk: self.pk, ir_resum: self.ir_resum }, self.row.clone())]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneLoopPkResult {
    pub growth: GrowthParamsToken,
    pub loop_params: LoopParamsToken,
    pub k: WavenumberToken,
    pub z: RedshiftToken,
    pub pk: LinearPkToken,
    pub ir: IrCutoffToken,
    pub uv: UvCutoffToken,
    pub row: OneLoopPkRow,
}

impl StageResult for OneLoopPkResult {
    type S = OneLoopPkStage;
    fn rows(&self, model: ModelToken) -> Vec<(OneLoopPkKey, OneLoopPkRow)> {
        let key = OneLoopPkKey {
            model, growth: self.growth, loop_params: self.loop_params, k: self.k,
            z: self.z, pk: self.pk, ir: self.ir, uv: self.uv,
        };
        vec![(key, self.row.clone())]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumPkResult {
    pub growth: GrowthParamsToken,
    pub loop_params: LoopParamsToken,
    pub xy: MatsubaraXyParamsToken,
    pub k: WavenumberToken,
    pub z: RedshiftToken,
    pub pk: LinearPkToken,
    pub ir: IrCutoffToken,
    pub uv: UvCutoffToken,
    pub ir_resum: IrResumToken,
    pub row: ResumPkRow,
}

impl StageResult for ResumPkResult {
    type S = ResumPkStage;
    fn rows(&self, model: ModelToken) -> Vec<(ResumPkKey, ResumPkRow)> {
        let key = ResumPkKey {
            model, growth: self.growth, loop_params: self.loop_params, xy: self.xy, k: self.k,
            z: self.z, pk: self.pk, ir: self.ir, uv: self.uv, ir_resum: self.ir_resum,
        };
        vec![(key, self.row.clone())]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultipolePkResult {
    pub growth: GrowthParamsToken,
    pub loop_params: LoopParamsToken,
    pub xy: MatsubaraXyParamsToken,
    pub k: WavenumberToken,
    pub z: RedshiftToken,
    pub pk: LinearPkToken,
    pub ir: IrCutoffToken,
    pub uv: UvCutoffToken,
    pub ir_resum: IrResumToken,
    pub row: MultipolePkRow,
}

impl StageResult for MultipolePkResult {
    type S = MultipolePkStage;
    fn rows(&self, model: ModelToken) -> Vec<(ResumPkKey, MultipolePkRow)> {
        let key = ResumPkKey {
            model, growth: self.growth, loop_params: self.loop_params, xy: self.xy, k: self.k,
            z: self.z, pk: self.pk, ir: self.ir, uv: self.uv, ir_resum: self.ir_resum,
        };
        vec![(key, self.row.clone())]
    }
}

/// Samples of a linear power spectrum as read from its source, `(k in h/Mpc, P(k))`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearPk {
    pub token: LinearPkToken,
    pub samples: Vec<(f64, f64)>,
}

impl LinearPk {
    pub fn k_min(&self) -> Option<f64> {
        self.samples.iter().map(|(k, _)| *k).reduce(f64::min)
    }

    pub fn k_max(&self) -> Option<f64> {
        self.samples.iter().map(|(k, _)| *k).reduce(f64::max)
    }

    /// Whether `k` lies inside the sampled range once the ends are pulled in by the clearances.
    pub fn is_valid(&self, k: f64, bottom_clearance: f64, top_clearance: f64) -> bool {
        match (self.k_min(), self.k_max()) {
            (Some(lo), Some(hi)) => k >= lo * bottom_clearance && k <= hi * top_clearance,
            _ => false,
        }
    }
}

pub fn store_linear_pk(tx: &Transaction, pk: &LinearPk) -> Result<(), CacheError> {
    let mut table = tx.write_tx()?.open_table(LINEAR_PK_DATA)?;
    table.insert(pk.token.id(), bincode::serialize(&pk.samples)?.as_slice())?;
    Ok(())
}

pub fn find_linear_pk(tx: &Transaction, token: LinearPkToken) -> Result<LinearPk, CacheError> {
    let table = tx.write_tx()?.open_table(LINEAR_PK_DATA)?;
    let guard = table.get(token.id())?.ok_or_else(|| CacheError::not_found(format!("no samples stored for {:?}", token)))?;
    Ok(LinearPk { token, samples: bincode::deserialize(guard.value())? })
}

/// Growth factors of one model and parameter set over a redshift database.
#[derive(Debug, Clone, PartialEq)]
pub struct GrowthTable {
    pub model: ModelToken,
    pub params: GrowthParamsToken,
    pub rows: Vec<(RedshiftToken, Redshift, GrowthRow)>,
}

impl GrowthTable {
    pub fn at(&self, z: RedshiftToken) -> Option<&GrowthRow> {
        self.rows.iter().find(|(t, _, _)| *t == z).map(|(_, _, row)| row)
    }
}

pub fn find_growth_table(tx: &Transaction, model: ModelToken, params: GrowthParamsToken, z_db: &RedshiftDatabase) -> Result<GrowthTable, CacheError> {
    let mut rows = Vec::with_capacity(z_db.len());
    for (z, value) in z_db {
        rows.push((z, *value, find_row::<GrowthStage>(tx, &GrowthKey { model, params, z })?));
    }
    Ok(GrowthTable { model, params, rows })
}

/// Raw and no-wiggle spectrum of a dataset over a wavenumber database.
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredPk {
    pub pk: LinearPkToken,
    pub params: FilterParamsToken,
    pub samples: Vec<(Wavenumber, FilterPkRow)>,
}

pub fn find_filtered_pk(tx: &Transaction, pk: LinearPkToken, params: FilterParamsToken, k_db: &WavenumberDatabase) -> Result<FilteredPk, CacheError> {
    let mut samples = Vec::with_capacity(k_db.len());
    for (k, value) in k_db {
        samples.push((*value, find_row::<FilterPkStage>(tx, &FilterPkKey { pk, params, k })?));
    }
    Ok(FilteredPk { pk, params, samples })
}

pub fn find_transfer(tx: &Transaction, model: ModelToken, k: WavenumberToken, z_db: &RedshiftDatabase) -> Result<Vec<(RedshiftToken, TransferRow)>, CacheError> {
    let mut out = Vec::with_capacity(z_db.len());
    for (z, _) in z_db {
        out.push((z, find_row::<TransferStage>(tx, &TransferKey { model, k, z })?));
    }
    Ok(out)
}

pub fn find_loop_integral(tx: &Transaction, key: &LoopIntegralKey) -> Result<LoopIntegralRow, CacheError> {
    find_row::<LoopIntegralStage>(tx, key)
}

pub fn find_matsubara_xy(tx: &Transaction, key: &MatsubaraXyKey) -> Result<MatsubaraXyRow, CacheError> {
    find_row::<MatsubaraXyStage>(tx, key)
}

pub fn find_oneloop_pk(tx: &Transaction, key: &OneLoopPkKey) -> Result<OneLoopPkRow, CacheError> {
    find_row::<OneLoopPkStage>(tx, key)
}

pub fn find_resum_pk(tx: &Transaction, key: &ResumPkKey) -> Result<ResumPkRow, CacheError> {
    find_row::<ResumPkStage>(tx, key)
}

pub fn find_multipole_pk(tx: &Transaction, key: &ResumPkKey) -> Result<MultipolePkRow, CacheError> {
    find_row::<MultipolePkStage>(tx, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::test_utils::mk_store;

    fn growth_row(g: f64) -> GrowthRow {
        GrowthRow { g, f: 0.5, a: 0.0, b: 0.0, f_a: 0.0, f_b: 0.0, provenance: Provenance { evaluations: 10, time_ns: 1000 } }
    }

    #[test]
    fn growth_result_expands_per_redshift_and_assembles_back() {
        let dm = mk_store("payload_growth");
        let tx = dm.open_transaction().expect("tx");
        let mut z_db = RedshiftDatabase::new();
        let z0 = z_db.push(Redshift(0.0)).expect("push");
        let z1 = z_db.push(Redshift(1.0)).expect("push");
        let model = ModelToken::new(0);
        let params = GrowthParamsToken::new(0);
        let result = GrowthResult { params, rows: vec![(z0, growth_row(1.0)), (z1, growth_row(0.6))] };
        assert_eq!(store(&tx, model, &result).expect("store"), 2);

        let table = find_growth_table(&tx, model, params, &z_db).expect("table");
        assert_eq!(table.at(z1).map(|r| r.g), Some(0.6));
        assert_eq!(table.rows.len(), 2);

        z_db.push(Redshift(2.0)).expect("push");
        let err = find_growth_table(&tx, model, params, &z_db).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn linear_pk_samples_round_trip_and_clearances_apply() {
        let dm = mk_store("payload_pk");
        let tx = dm.open_transaction().expect("tx");
        let pk = LinearPk { token: LinearPkToken::new(0), samples: vec![(0.01, 100.0), (0.1, 50.0), (1.0, 5.0)] };
        store_linear_pk(&tx, &pk).expect("store");
        assert_eq!(find_linear_pk(&tx, pk.token).expect("find"), pk);
        assert_eq!(find_linear_pk(&tx, LinearPkToken::new(1)).unwrap_err().kind(), ErrorKind::NotFound);

        assert!(pk.is_valid(0.5, 1.25, 0.75));
        assert!(!pk.is_valid(0.011, 1.25, 0.75));
        assert!(!pk.is_valid(0.9, 1.25, 0.75));
    }
}
