use crate::dispatch::dispatch;
use crate::err::DriverError;
use crate::kernels::{KernelError, Kernels};
use crate::scheduler::WorkerScheduler;
use crate::settings::AppConfig;
use crate::task::spawn_blocking_named;
use lsscache::logger::format_elapsed;
use lsscache::*;
use lsscache::{info, warn};
use std::fs;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

/// A linear power spectrum file as read from disk.
#[derive(Debug, Clone)]
pub struct LinearPkFile {
    pub path: String,
    pub content: Vec<u8>,
    pub samples: Vec<(f64, f64)>,
}

pub fn read_linear_pk(path: &str) -> Result<LinearPkFile, DriverError> {
    let content = fs::read(path)?;
    let samples = parse_linear_pk(&content).map_err(|e| DriverError::new(format!("{}: {}", path, e)))?;
    Ok(LinearPkFile { path: path.to_string(), content, samples })
}

/// Whitespace separated `k P(k)` pairs, one per line. Blank lines and `#` comments are skipped,
/// extra columns are ignored.
pub fn parse_linear_pk(content: &[u8]) -> Result<Vec<(f64, f64)>, String> {
    let text = std::str::from_utf8(content).map_err(|e| e.to_string())?;
    let mut samples = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let mut columns = line.split_whitespace().map(str::parse::<f64>);
        match (columns.next(), columns.next()) {
            (Some(Ok(k)), Some(Ok(pk))) => samples.push((k, pk)),
            _ => return Err(format!("line {} is not a `k P(k)` pair", n + 1)),
        }
    }
    if samples.is_empty() {
        return Err("no samples".to_string());
    }
    Ok(samples)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSummary {
    pub stage: &'static str,
    pub items: usize,
    pub stored_rows: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub stages: Vec<StageSummary>,
    /// False when a stage left items undone and the run stopped after it.
    pub complete: bool,
}

impl RunSummary {
    pub fn items(&self) -> usize {
        self.stages.iter().map(|s| s.items).sum()
    }

    pub fn stage(&self, stage: &str) -> Option<&StageSummary> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

/// Runs `f` against the store on the blocking pool, keeping redb off the executor threads.
pub async fn with_store<T, F>(store: &Arc<DataManager>, name: &'static str, f: F) -> Result<T, DriverError>
where
    T: Send + 'static,
    F: FnOnce(&DataManager) -> Result<T, DriverError> + Send + 'static,
{
    let store = Arc::clone(store);
    spawn_blocking_named(name, move || f(&store))?.await?
}

/// Tokens and databases every stage of a run is built from.
struct Dimensions {
    model: TokenizedModel,
    pk: Arc<LinearPk>,
    growth: GrowthParamsToken,
    loop_params: LoopParamsToken,
    filter: FilterParamsToken,
    xy: MatsubaraXyParamsToken,
    z_db: RedshiftDatabase,
    k_db: WavenumberDatabase,
    ir_db: IrCutoffDatabase,
    uv_db: UvCutoffDatabase,
    ir_resum_db: IrResumDatabase,
}

impl Dimensions {
    fn spectrum_tokens(&self) -> SpectrumTokens {
        SpectrumTokens { growth: self.growth, loop_params: self.loop_params, pk: self.pk.token }
    }

    fn resum_dimensions(&self) -> ResumDimensions<'_> {
        ResumDimensions { z_db: &self.z_db, k_db: &self.k_db, ir_db: &self.ir_db, uv_db: &self.uv_db, ir_resum_db: &self.ir_resum_db }
    }
}

/// Runs the stages of one model in dependency order: each stage's work list is built and
/// committed, dispatched, and its results stored before the next stage is looked at.
pub struct Coordinator<K: Kernels> {
    store: Arc<DataManager>,
    kernels: Arc<K>,
    settings: AppConfig,
    scheduler: WorkerScheduler,
    shutdown: watch::Receiver<bool>,
}

impl<K: Kernels> Coordinator<K> {
    pub fn new(store: Arc<DataManager>, kernels: Arc<K>, settings: AppConfig, shutdown: watch::Receiver<bool>) -> Self {
        let scheduler = WorkerScheduler::new(settings.workers.worker_count());
        Coordinator { store, kernels, settings, scheduler, shutdown }
    }

    /// Opens the store named in the settings.
    pub fn open(settings: AppConfig, kernels: Arc<K>, shutdown: watch::Receiver<bool>) -> Result<Self, DriverError> {
        let store = DataManager::open(&settings.database.path, settings.database.cache_size_mb, settings.tolerances.clone())?;
        Ok(Coordinator::new(Arc::new(store), kernels, settings, shutdown))
    }

    pub fn store(&self) -> &Arc<DataManager> {
        &self.store
    }

    pub fn scheduler(&self) -> &WorkerScheduler {
        &self.scheduler
    }

    pub async fn run(&mut self, model: &FrwModel) -> Result<RunSummary, DriverError> {
        let start = Instant::now();
        if self.settings.database.prune_on_start {
            self.blocking("prune", |store| Ok(store.drop_inconsistent_configurations()?)).await?;
        }
        let dims = Arc::new(self.prepare(model).await?);
        let spectrum = Arc::new(self.settings.spectrum.clone());
        let model_token = dims.model.token;
        let mut summary = RunSummary { stages: Vec::new(), complete: true };

        let (d, sp) = (Arc::clone(&dims), Arc::clone(&spectrum));
        let list = self.build(FilterPkStage::TABLE, move |tx| build_filter_work_list(tx, &d.pk, d.filter, &sp.filter, &d.k_db)).await?;
        if !self.run_stage(&mut summary, FilterPkStage::TABLE, model_token, list, K::filter_pk).await? {
            return Ok(summary);
        }

        let d = Arc::clone(&dims);
        let list = self.build(TransferStage::TABLE, move |tx| build_transfer_work_list(tx, &d.model, &d.k_db, &d.z_db)).await?;
        if !self.run_stage(&mut summary, TransferStage::TABLE, model_token, list, K::transfer).await? {
            return Ok(summary);
        }

        let (d, sp) = (Arc::clone(&dims), Arc::clone(&spectrum));
        let list = self.build(GrowthStage::TABLE, move |tx| build_growth_work_list(tx, &d.model, d.growth, &sp.growth, &d.z_db)).await?;
        if !self.run_stage(&mut summary, GrowthStage::TABLE, model_token, list, K::growth).await? {
            return Ok(summary);
        }

        let d = Arc::clone(&dims);
        let filtered = Arc::new(
            self.blocking(FilterPkStage::TABLE, move |store| {
                Ok(store.in_transaction(|tx| find_filtered_pk(tx, d.pk.token, d.filter, &d.k_db))?)
            })
            .await?,
        );
        let (d, sp, f) = (Arc::clone(&dims), Arc::clone(&spectrum), Arc::clone(&filtered));
        let list = self
            .build(LoopIntegralStage::TABLE, move |tx| {
                build_loop_integral_work_list(tx, &d.model, d.loop_params, &sp.loop_integral, &d.k_db, &d.ir_db, &d.uv_db, &f)
            })
            .await?;
        if !self.run_stage(&mut summary, LoopIntegralStage::TABLE, model_token, list, K::loop_integral).await? {
            return Ok(summary);
        }

        let (d, sp, f) = (Arc::clone(&dims), Arc::clone(&spectrum), Arc::clone(&filtered));
        let list = self
            .build(MatsubaraXyStage::TABLE, move |tx| build_matsubara_xy_work_list(tx, &d.model, d.xy, &sp.matsubara_xy, &d.ir_resum_db, &f))
            .await?;
        if !self.run_stage(&mut summary, MatsubaraXyStage::TABLE, model_token, list, K::matsubara_xy).await? {
            return Ok(summary);
        }

        let d = Arc::clone(&dims);
        let list = self
            .build(OneLoopPkStage::TABLE, move |tx| {
                build_oneloop_pk_work_list(tx, &d.model, d.spectrum_tokens(), &d.z_db, &d.k_db, &d.ir_db, &d.uv_db)
            })
            .await?;
        if !self.run_stage(&mut summary, OneLoopPkStage::TABLE, model_token, list, K::oneloop_pk).await? {
            return Ok(summary);
        }

        let d = Arc::clone(&dims);
        let list = self
            .build(ResumPkStage::TABLE, move |tx| build_resum_pk_work_list(tx, &d.model, d.spectrum_tokens(), d.xy, d.resum_dimensions()))
            .await?;
        if !self.run_stage(&mut summary, ResumPkStage::TABLE, model_token, list, K::resum_pk).await? {
            return Ok(summary);
        }

        let d = Arc::clone(&dims);
        let list = self
            .build(MultipolePkStage::TABLE, move |tx| {
                build_multipole_pk_work_list(tx, &d.model, d.spectrum_tokens(), d.xy, d.resum_dimensions())
            })
            .await?;
        self.run_stage(&mut summary, MultipolePkStage::TABLE, model_token, list, K::multipole_pk).await?;

        info!("Run of {} finished in {}: {} items computed", dims.model.params.name, format_elapsed(start.elapsed()), summary.items());
        Ok(summary)
    }

    /// Every redb transaction of a run goes through here.
    async fn blocking<T, F>(&self, name: &'static str, f: F) -> Result<T, DriverError>
    where
        T: Send + 'static,
        F: FnOnce(&DataManager) -> Result<T, DriverError> + Send + 'static,
    {
        with_store(&self.store, name, f).await
    }

    async fn prepare(&self, model: &FrwModel) -> Result<Dimensions, DriverError> {
        let model = model.clone();
        let sampling = self.settings.sampling.clone();
        let spectrum = self.settings.spectrum.clone();
        let dims = self
            .blocking("prepare", move |store| {
                let pk_file = read_linear_pk(&spectrum.linear_pk_path)?;
                let dims = store.in_transaction(|tx| {
                    let model = store.tokenize_model(tx, &model)?;
                    let source = LinearPkSource::new(pk_file.path.clone(), &pk_file.content, model.token);
                    let pk = store.ingest_linear_pk(tx, &source, pk_file.samples.clone())?;
                    let growth: GrowthParamsToken = store.tokenize(tx, &spectrum.growth)?;
                    let loop_params: LoopParamsToken = store.tokenize(tx, &spectrum.loop_integral)?;
                    let filter: FilterParamsToken = store.tokenize(tx, &spectrum.filter)?;
                    let xy: MatsubaraXyParamsToken = store.tokenize(tx, &spectrum.matsubara_xy)?;
                    let z_db = store.build_redshift_db(tx, &sampling.redshifts())?;
                    let k_db = store.build_k_db_for_pk(tx, &sampling.wavenumbers(), &pk)?;
                    let ir_db = store.build_ir_cutoff_db(tx, &sampling.ir_cutoffs)?;
                    let uv_db = store.build_uv_cutoff_db(tx, &sampling.uv_cutoffs)?;
                    let ir_resum_db = store.build_ir_resum_db(tx, &sampling.ir_resum)?;
                    Ok(Dimensions { model, pk: Arc::new(pk), growth, loop_params, filter, xy, z_db, k_db, ir_db, uv_db, ir_resum_db })
                })?;
                Ok(dims)
            })
            .await?;
        info!(
            "{} tokenized as {:?}: {} redshifts, {} wavenumbers, {} IR cutoffs, {} UV cutoffs, {} IR resummation scales",
            dims.model.params.name,
            dims.model.token,
            dims.z_db.len(),
            dims.k_db.len(),
            dims.ir_db.len(),
            dims.uv_db.len(),
            dims.ir_resum_db.len()
        );
        Ok(dims)
    }

    /// Builds a stage's work list in its own transaction and commits it.
    async fn build<T, F>(&self, stage: &'static str, f: F) -> Result<Option<WorkList<T>>, DriverError>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction) -> Result<Option<WorkList<T>>, CacheError> + Send + 'static,
    {
        self.blocking(stage, move |store| Ok(store.in_transaction(f)?)).await
    }

    /// Returns whether every item of the stage was computed and stored.
    async fn run_stage<T, R>(
        &mut self,
        summary: &mut RunSummary,
        stage: &'static str,
        model: ModelToken,
        list: Option<WorkList<T>>,
        kernel: fn(&K, &T) -> Result<R, KernelError>,
    ) -> Result<bool, DriverError>
    where
        T: Send + Sync + 'static,
        R: StageResult,
    {
        let Some(list) = list else {
            summary.stages.push(StageSummary { stage, items: 0, stored_rows: 0, failed: 0, cancelled: 0 });
            return Ok(true);
        };
        let items = list.len();
        let kernels = Arc::clone(&self.kernels);
        let report = dispatch(stage, list, move |item: &T| kernel(&kernels, item), &mut self.scheduler, self.shutdown.clone()).await?;
        let complete = report.is_complete();
        let (failed, cancelled) = (report.failed, report.cancelled);
        let stored_rows = self.store_batches(stage, model, report.results).await?;
        summary.stages.push(StageSummary { stage, items, stored_rows, failed, cancelled });
        if !complete {
            warn!("{}: {} failed and {} cancelled of {} items, stopping before dependent stages", stage, failed, cancelled, items);
            summary.complete = false;
        }
        Ok(complete)
    }

    async fn store_batches<R: StageResult>(&self, stage: &'static str, model: ModelToken, results: Vec<R>) -> Result<usize, DriverError> {
        let batch_size = self.settings.workers.store_batch_size.max(1);
        self.blocking(stage, move |store| {
            let mut rows = 0;
            for chunk in results.chunks(batch_size) {
                rows += store.store_results(model, chunk)?;
            }
            Ok(rows)
        })
        .await
    }
}
