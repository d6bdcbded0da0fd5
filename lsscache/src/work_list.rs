//! Work list builders, one per stage.
//!
//! Each builder asks the resolver what is missing, pulls the upstream payloads the missing
//! items depend on, and bundles them into self-contained items. Upstream payloads are fetched
//! once per distinct upstream configuration and shared between items through `Arc`.
//! An empty result is returned as `None`.

use crate::config_db::{IrCutoffDatabase, IrResumDatabase, RedshiftDatabase, UvCutoffDatabase, WavenumberDatabase};
use crate::error::CacheError;
use crate::info;
use crate::logger::format_elapsed;
use crate::payload::*;
use crate::resolver::*;
use crate::stage::*;
use crate::token::*;
use crate::transaction::Transaction;
use crate::values::*;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;

/// Ordered, non-empty collection of work items for one stage.
#[derive(Debug, Clone)]
pub struct WorkList<T> {
    items: Vec<T>,
}

impl<T> WorkList<T> {
    pub fn from_items(items: Vec<T>) -> Option<Self> {
        if items.is_empty() {
            None
        } else {
            Some(WorkList { items })
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }
}

impl<T> IntoIterator for WorkList<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a WorkList<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Memo of upstream payloads for the duration of one build.
pub struct SharedUpstream<K, V> {
    entries: HashMap<K, Arc<V>>,
    fetches: usize,
}

impl<K: Eq + Hash, V> SharedUpstream<K, V> {
    pub fn new() -> Self {
        SharedUpstream { entries: HashMap::new(), fetches: 0 }
    }

    pub fn get_or_fetch(&mut self, key: K, fetch: impl FnOnce() -> Result<V, CacheError>) -> Result<Arc<V>, CacheError> {
        if let Some(hit) = self.entries.get(&key) {
            return Ok(Arc::clone(hit));
        }
        let value = Arc::new(fetch()?);
        self.fetches += 1;
        self.entries.insert(key, Arc::clone(&value));
        Ok(value)
    }

    pub fn fetches(&self) -> usize {
        self.fetches
    }
}

impl<K: Eq + Hash, V> Default for SharedUpstream<K, V> {
    fn default() -> Self {
        SharedUpstream::new()
    }
}

/// A model token together with the parameters it stands for.
#[derive(Debug, Clone)]
pub struct TokenizedModel {
    pub token: ModelToken,
    pub params: Arc<FrwModel>,
}

fn report<T>(stage: &str, start: Instant, items: Vec<T>) -> Option<WorkList<T>> {
    info!("{} work list: {} items, built in {}", stage, items.len(), format_elapsed(start.elapsed()));
    WorkList::from_items(items)
}

#[derive(Debug, Clone)]
pub struct TransferItem {
    pub model: TokenizedModel,
    pub k_token: WavenumberToken,
    pub k: Wavenumber,
    pub z_db: RedshiftDatabase,
}

pub fn build_transfer_work_list(
    tx: &Transaction,
    model: &TokenizedModel,
    k_db: &WavenumberDatabase,
    z_db: &RedshiftDatabase,
) -> Result<Option<WorkList<TransferItem>>, CacheError> {
    let start = Instant::now();
    let mut items = Vec::new();
    if !z_db.is_empty() {
        let staged = StagedRedshifts::upload(tx, z_db)?;
        for (k_token, k) in k_db {
            let missing = staged.missing::<TransferStage>(tx, |z| TransferKey { model: model.token, k: k_token, z })?;
            if let Some(z_db) = missing {
                items.push(TransferItem { model: model.clone(), k_token, k: *k, z_db });
            }
        }
        staged.discard(tx)?;
    }
    Ok(report(TransferStage::TABLE, start, items))
}

#[derive(Debug, Clone)]
pub struct GrowthItem {
    pub model: TokenizedModel,
    pub params_token: GrowthParamsToken,
    pub params: GrowthParams,
    /// Missing redshifts. Integration starts from the largest one.
    pub z_db: RedshiftDatabase,
}

pub fn build_growth_work_list(
    tx: &Transaction,
    model: &TokenizedModel,
    params_token: GrowthParamsToken,
    params: &GrowthParams,
    z_db: &RedshiftDatabase,
) -> Result<Option<WorkList<GrowthItem>>, CacheError> {
    let start = Instant::now();
    let missing = missing_redshifts::<GrowthStage>(tx, z_db, |z| GrowthKey { model: model.token, params: params_token, z })?;
    let items = missing
        .map(|z_db| vec![GrowthItem { model: model.clone(), params_token, params: params.clone(), z_db }])
        .unwrap_or_default();
    Ok(report(GrowthStage::TABLE, start, items))
}

#[derive(Debug, Clone)]
pub struct FilterPkItem {
    pub pk: Arc<LinearPk>,
    pub params_token: FilterParamsToken,
    pub params: FilterParams,
    pub k_token: WavenumberToken,
    pub k: Wavenumber,
}

pub fn build_filter_work_list(
    tx: &Transaction,
    pk: &Arc<LinearPk>,
    params_token: FilterParamsToken,
    params: &FilterParams,
    k_db: &WavenumberDatabase,
) -> Result<Option<WorkList<FilterPkItem>>, CacheError> {
    let start = Instant::now();
    let candidates: Vec<(WavenumberToken, Wavenumber)> = k_db.iter().map(|(t, k)| (t, *k)).collect();
    let missing = missing::<FilterPkStage, _>(tx, candidates, |(k, _)| FilterPkKey { pk: pk.token, params: params_token, k: *k })?;
    let items = missing
        .into_iter()
        .map(|(k_token, k)| FilterPkItem { pk: Arc::clone(pk), params_token, params: params.clone(), k_token, k })
        .collect();
    Ok(report(FilterPkStage::TABLE, start, items))
}

#[derive(Debug, Clone)]
pub struct LoopIntegralItem {
    pub model: TokenizedModel,
    pub params_token: LoopParamsToken,
    pub params: LoopParams,
    pub config: LoopConfiguration,
    pub pk: Arc<FilteredPk>,
}

#[allow(clippy::too_many_arguments)]
pub fn build_loop_integral_work_list(
    tx: &Transaction,
    model: &TokenizedModel,
    params_token: LoopParamsToken,
    params: &LoopParams,
    k_db: &WavenumberDatabase,
    ir_db: &IrCutoffDatabase,
    uv_db: &UvCutoffDatabase,
    pk: &Arc<FilteredPk>,
) -> Result<Option<WorkList<LoopIntegralItem>>, CacheError> {
    let start = Instant::now();
    let key_of = |c: &LoopConfiguration| LoopIntegralKey {
        model: model.token, params: params_token, k: c.k_token, pk: pk.pk, ir: c.ir_token, uv: c.uv_token,
    };
    let missing = missing::<LoopIntegralStage, _>(tx, loop_tensor_product(k_db, ir_db, uv_db), key_of)?;
    let items = missing
        .into_iter()
        .map(|config| LoopIntegralItem { model: model.clone(), params_token, params: params.clone(), config, pk: Arc::clone(pk) })
        .collect();
    Ok(report(LoopIntegralStage::TABLE, start, items))
}

#[derive(Debug, Clone)]
pub struct MatsubaraXyItem {
    pub model: TokenizedModel,
    pub params_token: MatsubaraXyParamsToken,
    pub params: MatsubaraXyParams,
    pub ir_resum_token: IrResumToken,
    pub ir_resum: Wavenumber,
    pub pk: Arc<FilteredPk>,
}

pub fn build_matsubara_xy_work_list(
    tx: &Transaction,
    model: &TokenizedModel,
    params_token: MatsubaraXyParamsToken,
    params: &MatsubaraXyParams,
    ir_resum_db: &IrResumDatabase,
    pk: &Arc<FilteredPk>,
) -> Result<Option<WorkList<MatsubaraXyItem>>, CacheError> {
    let start = Instant::now();
    let candidates: Vec<(IrResumToken, Wavenumber)> = ir_resum_db.iter().map(|(t, v)| (t, *v)).collect();
    let key_of = |(ir_resum, _): &(IrResumToken, Wavenumber)| MatsubaraXyKey {
        model: model.token, params: params_token, pk: pk.pk, ir_resum: *ir_resum,
    };
    let missing = missing::<MatsubaraXyStage, _>(tx, candidates, key_of)?;
    let items = missing
        .into_iter()
        .map(|(ir_resum_token, ir_resum)| MatsubaraXyItem {
            model: model.clone(), params_token, params: params.clone(), ir_resum_token, ir_resum, pk: Arc::clone(pk),
        })
        .collect();
    Ok(report(MatsubaraXyStage::TABLE, start, items))
}

/// Tokens shared by every configuration of the one-loop and resummed power spectrum stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpectrumTokens {
    pub growth: GrowthParamsToken,
    pub loop_params: LoopParamsToken,
    pub pk: LinearPkToken,
}

#[derive(Debug, Clone)]
pub struct OneLoopPkItem {
    pub model: TokenizedModel,
    pub tokens: SpectrumTokens,
    pub config: LoopConfiguration,
    pub z_token: RedshiftToken,
    pub z: Redshift,
    pub growth: Arc<GrowthTable>,
    pub loop_integral: Arc<LoopIntegralRow>,
}

#[allow(clippy::too_many_arguments)]
pub fn build_oneloop_pk_work_list(
    tx: &Transaction,
    model: &TokenizedModel,
    tokens: SpectrumTokens,
    z_db: &RedshiftDatabase,
    k_db: &WavenumberDatabase,
    ir_db: &IrCutoffDatabase,
    uv_db: &UvCutoffDatabase,
) -> Result<Option<WorkList<OneLoopPkItem>>, CacheError> {
    let start = Instant::now();
    let mut items = Vec::new();
    if !z_db.is_empty() {
        let mut growth: SharedUpstream<GrowthParamsToken, GrowthTable> = SharedUpstream::new();
        let mut loops: SharedUpstream<LoopIntegralKey, LoopIntegralRow> = SharedUpstream::new();
        let staged = StagedRedshifts::upload(tx, z_db)?;
        for config in loop_tensor_product(k_db, ir_db, uv_db) {
            let key_of = |z| OneLoopPkKey {
                model: model.token, growth: tokens.growth, loop_params: tokens.loop_params, k: config.k_token,
                z, pk: tokens.pk, ir: config.ir_token, uv: config.uv_token,
            };
            let Some(missing) = staged.missing::<OneLoopPkStage>(tx, key_of)? else {
                continue;
            };
            let growth_table = growth.get_or_fetch(tokens.growth, || find_growth_table(tx, model.token, tokens.growth, z_db))?;
            let loop_key = LoopIntegralKey {
                model: model.token, params: tokens.loop_params, k: config.k_token, pk: tokens.pk,
                ir: config.ir_token, uv: config.uv_token,
            };
            let loop_integral = loops.get_or_fetch(loop_key, || find_loop_integral(tx, &loop_key))?;
            for (z_token, z) in &missing {
                items.push(OneLoopPkItem {
                    model: model.clone(),
                    tokens,
                    config,
                    z_token,
                    z: *z,
                    growth: Arc::clone(&growth_table),
                    loop_integral: Arc::clone(&loop_integral),
                });
            }
        }
        staged.discard(tx)?;
    }
    Ok(report(OneLoopPkStage::TABLE, start, items))
}

#[derive(Debug, Clone)]
pub struct ResumPkItem {
    pub model: TokenizedModel,
    pub tokens: SpectrumTokens,
    pub xy_token: MatsubaraXyParamsToken,
    pub config: ResumConfiguration,
    pub z_token: RedshiftToken,
    pub z: Redshift,
    pub growth: Arc<GrowthTable>,
    pub xy: Arc<MatsubaraXyRow>,
    pub oneloop: OneLoopPkRow,
}

/// Inputs of the projection onto Legendre moments, the same as those of the resummed spectrum.
pub type MultipolePkItem = ResumPkItem;

/// Dimensions of the stages keyed per `(k, IR, UV, IR resum, z)`.
#[derive(Debug, Clone, Copy)]
pub struct ResumDimensions<'a> {
    pub z_db: &'a RedshiftDatabase,
    pub k_db: &'a WavenumberDatabase,
    pub ir_db: &'a IrCutoffDatabase,
    pub uv_db: &'a UvCutoffDatabase,
    pub ir_resum_db: &'a IrResumDatabase,
}

pub fn build_resum_pk_work_list(
    tx: &Transaction,
    model: &TokenizedModel,
    tokens: SpectrumTokens,
    xy_token: MatsubaraXyParamsToken,
    dims: ResumDimensions<'_>,
) -> Result<Option<WorkList<ResumPkItem>>, CacheError> {
    let start = Instant::now();
    let items = resum_shaped_items::<ResumPkStage>(tx, model, tokens, xy_token, dims)?;
    Ok(report(ResumPkStage::TABLE, start, items))
}

pub fn build_multipole_pk_work_list(
    tx: &Transaction,
    model: &TokenizedModel,
    tokens: SpectrumTokens,
    xy_token: MatsubaraXyParamsToken,
    dims: ResumDimensions<'_>,
) -> Result<Option<WorkList<MultipolePkItem>>, CacheError> {
    let start = Instant::now();
    let items = resum_shaped_items::<MultipolePkStage>(tx, model, tokens, xy_token, dims)?;
    Ok(report(MultipolePkStage::TABLE, start, items))
}

/// Items for every `(config, z)` missing from stage `S`. Growth tables and Matsubara XY rows
/// are fetched once and shared, one-loop rows are looked up per item.
fn resum_shaped_items<S: Stage<Key = ResumPkKey>>(
    tx: &Transaction,
    model: &TokenizedModel,
    tokens: SpectrumTokens,
    xy_token: MatsubaraXyParamsToken,
    dims: ResumDimensions<'_>,
) -> Result<Vec<ResumPkItem>, CacheError> {
    let mut items = Vec::new();
    if dims.z_db.is_empty() {
        return Ok(items);
    }
    let mut growth: SharedUpstream<GrowthParamsToken, GrowthTable> = SharedUpstream::new();
    let mut xys: SharedUpstream<IrResumToken, MatsubaraXyRow> = SharedUpstream::new();
    let staged = StagedRedshifts::upload(tx, dims.z_db)?;
    for config in resum_tensor_product(dims.k_db, dims.ir_db, dims.uv_db, dims.ir_resum_db) {
        let lc = config.loop_config;
        let key_of = |z| ResumPkKey {
            model: model.token, growth: tokens.growth, loop_params: tokens.loop_params, xy: xy_token,
            k: lc.k_token, z, pk: tokens.pk, ir: lc.ir_token, uv: lc.uv_token, ir_resum: config.ir_resum_token,
        };
        let Some(missing) = staged.missing::<S>(tx, key_of)? else {
            continue;
        };
        let growth_table = growth.get_or_fetch(tokens.growth, || find_growth_table(tx, model.token, tokens.growth, dims.z_db))?;
        let xy_key = MatsubaraXyKey { model: model.token, params: xy_token, pk: tokens.pk, ir_resum: config.ir_resum_token };
        let xy = xys.get_or_fetch(config.ir_resum_token, || find_matsubara_xy(tx, &xy_key))?;
        for (z_token, z) in &missing {
            let oneloop_key = OneLoopPkKey {
                model: model.token, growth: tokens.growth, loop_params: tokens.loop_params, k: lc.k_token,
                z: z_token, pk: tokens.pk, ir: lc.ir_token, uv: lc.uv_token,
            };
            items.push(ResumPkItem {
                model: model.clone(),
                tokens,
                xy_token,
                config,
                z_token,
                z: *z,
                growth: Arc::clone(&growth_table),
                xy: Arc::clone(&xy),
                oneloop: find_oneloop_pk(tx, &oneloop_key)?,
            });
        }
    }
    staged.discard(tx)?;
    Ok(items)
}
