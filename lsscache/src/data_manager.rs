use crate::admin;
use crate::config_db::*;
use crate::error::CacheError;
use crate::payload::{self, LinearPk, StageResult};
use crate::stage::*;
use crate::stage_table::{self, TableInfo};
use crate::token::*;
use crate::tokenize::{self, kind_table, Tokenizable};
use crate::transaction::{Transaction, TransactionId, TxRegistry};
use crate::values::*;
use crate::work_list::TokenizedModel;
use crate::{info, warn};
use redb::Database;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{env, fs};

/// Wavenumbers closer to the ends of a sampled spectrum than these factors are not tokenized.
pub const PK_BOTTOM_CLEARANCE: f64 = 1.25;
pub const PK_TOP_CLEARANCE: f64 = 0.75;

/// Owner of the persistent store. Hands out at most one open transaction at a time.
pub struct DataManager {
    db: Arc<Database>,
    registry: Arc<TxRegistry>,
    tolerances: Tolerances,
    path: PathBuf,
}

impl DataManager {
    /// Opens the store at `path`, creating it and its schema if needed.
    pub fn open(path: impl AsRef<Path>, cache_size_mb: usize, tolerances: Tolerances) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        if path.exists() {
            info!("Opening existing store at {:?} with cache size {} MB", path, cache_size_mb);
        } else {
            info!("Creating store at {:?} with cache size {} MB", path, cache_size_mb);
        }
        let db = Database::builder().set_cache_size(cache_size_mb * 1024 * 1024).create(&path)?;
        let manager = DataManager { db: Arc::new(db), registry: Arc::new(TxRegistry::default()), tolerances, path };
        manager.ensure_schema()?;
        Ok(manager)
    }

    /// Store under the system temp directory, optionally with a random suffix.
    pub fn temp(name: &str, random: bool) -> Result<Self, CacheError> {
        let db_name = if random { format!("{}_{}", name, rand::random::<u64>()) } else { name.to_string() };
        let db_path = env::temp_dir().join("lsscache").join(format!("{}.db", db_name));
        if random && db_path.exists() {
            fs::remove_file(&db_path)?;
        }
        DataManager::open(db_path, 64, Tolerances::default())
    }

    fn ensure_schema(&self) -> Result<(), CacheError> {
        self.in_transaction(|tx| {
            let wtx = tx.write_tx()?;
            wtx.open_table(kind_table::<kind::Model>())?;
            wtx.open_table(kind_table::<kind::Redshift>())?;
            wtx.open_table(kind_table::<kind::Wavenumber>())?;
            wtx.open_table(kind_table::<kind::UvCutoff>())?;
            wtx.open_table(kind_table::<kind::IrCutoff>())?;
            wtx.open_table(kind_table::<kind::IrResum>())?;
            wtx.open_table(kind_table::<kind::LinearPk>())?;
            wtx.open_table(kind_table::<kind::GrowthParams>())?;
            wtx.open_table(kind_table::<kind::LoopParams>())?;
            wtx.open_table(kind_table::<kind::FilterParams>())?;
            wtx.open_table(kind_table::<kind::MatsubaraXyParams>())?;
            wtx.open_table(stage_table::STATS_TABLE)?;
            wtx.open_table(payload::LINEAR_PK_DATA)?;
            ensure_stage::<TransferStage>(tx)?;
            ensure_stage::<GrowthStage>(tx)?;
            ensure_stage::<FilterPkStage>(tx)?;
            ensure_stage::<LoopIntegralStage>(tx)?;
            ensure_stage::<MatsubaraXyStage>(tx)?;
            ensure_stage::<OneLoopPkStage>(tx)?;
            ensure_stage::<ResumPkStage>(tx)?;
            ensure_stage::<MultipolePkStage>(tx)?;
            Ok(())
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tolerances(&self) -> &Tolerances {
        &self.tolerances
    }

    /// Fails with a transaction error while another transaction is still open.
    pub fn open_transaction(&self) -> Result<Transaction, CacheError> {
        Transaction::begin(Arc::clone(&self.db), Arc::clone(&self.registry))
    }

    pub fn active_transaction(&self) -> Option<TransactionId> {
        self.registry.active()
    }

    /// Runs `f` in its own transaction, committing on success. On error the transaction is
    /// dropped and therefore rolled back.
    pub fn in_transaction<T>(&self, f: impl FnOnce(&Transaction) -> Result<T, CacheError>) -> Result<T, CacheError> {
        let mut tx = self.open_transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    pub fn tokenize<K: TokenKind, V: Tokenizable<K>>(&self, tx: &Transaction, value: &V) -> Result<Token<K>, CacheError> {
        tokenize::lookup_or_insert(tx, value, &self.tolerances)
    }

    pub fn tokenize_model(&self, tx: &Transaction, model: &FrwModel) -> Result<TokenizedModel, CacheError> {
        let token: ModelToken = self.tokenize(tx, model)?;
        Ok(TokenizedModel { token, params: Arc::new(model.clone()) })
    }

    pub fn tokenize_linear_pk(&self, tx: &Transaction, source: &LinearPkSource) -> Result<LinearPkToken, CacheError> {
        tokenize::lookup_or_insert_linear_pk(tx, source)
    }

    /// Tokenizes the dataset and stores its samples under the token.
    pub fn ingest_linear_pk(&self, tx: &Transaction, source: &LinearPkSource, samples: Vec<(f64, f64)>) -> Result<LinearPk, CacheError> {
        let token = self.tokenize_linear_pk(tx, source)?;
        let pk = LinearPk { token, samples };
        payload::store_linear_pk(tx, &pk)?;
        Ok(pk)
    }

    pub fn build_redshift_db(&self, tx: &Transaction, samples: &[f64]) -> Result<RedshiftDatabase, CacheError> {
        let mut db = RedshiftDatabase::new();
        for z in samples {
            let token: RedshiftToken = self.tokenize(tx, &Redshift(*z))?;
            add_unique(&mut db, token, Redshift(*z));
        }
        Ok(db)
    }

    pub fn build_wavenumber_db<K: TokenKind>(&self, tx: &Transaction, samples: &[f64]) -> Result<ConfigDatabase<K, Wavenumber>, CacheError>
    where
        Wavenumber: Tokenizable<K>,
    {
        let mut db = ConfigDatabase::new();
        for k in samples {
            let token: Token<K> = self.tokenize(tx, &Wavenumber(*k))?;
            add_unique(&mut db, token, Wavenumber(*k));
        }
        Ok(db)
    }

    pub fn build_uv_cutoff_db(&self, tx: &Transaction, samples: &[f64]) -> Result<UvCutoffDatabase, CacheError> {
        self.build_wavenumber_db(tx, samples)
    }

    pub fn build_ir_cutoff_db(&self, tx: &Transaction, samples: &[f64]) -> Result<IrCutoffDatabase, CacheError> {
        self.build_wavenumber_db(tx, samples)
    }

    pub fn build_ir_resum_db(&self, tx: &Transaction, samples: &[f64]) -> Result<IrResumDatabase, CacheError> {
        self.build_wavenumber_db(tx, samples)
    }

    /// Like [`Self::build_wavenumber_db`], keeping only samples the spectrum covers with clearance.
    pub fn build_k_db_for_pk(&self, tx: &Transaction, samples: &[f64], pk: &LinearPk) -> Result<WavenumberDatabase, CacheError> {
        let kept: Vec<f64> = samples.iter().copied().filter(|k| pk.is_valid(*k, PK_BOTTOM_CLEARANCE, PK_TOP_CLEARANCE)).collect();
        if kept.len() < samples.len() {
            warn!("{} of {} k samples fall outside the range covered by {:?}", samples.len() - kept.len(), samples.len(), pk.token);
        }
        self.build_wavenumber_db(tx, &kept)
    }

    pub fn read_redshift_db(&self, tx: &Transaction) -> Result<RedshiftDatabase, CacheError> {
        Ok(tokenize::read_all::<kind::Redshift, Redshift>(tx)?.into_iter().collect())
    }

    pub fn read_wavenumber_db<K: TokenKind>(&self, tx: &Transaction) -> Result<ConfigDatabase<K, Wavenumber>, CacheError> {
        Ok(tokenize::read_all::<K, Wavenumber>(tx)?.into_iter().collect())
    }

    /// Drops the stage's index ahead of a bulk write.
    pub fn setup_write<S: Stage>(&self, tx: &Transaction) -> Result<(), CacheError> {
        stage_table::drop_index::<S>(tx)?;
        Ok(())
    }

    /// Rebuilds the stage's index and refreshes its statistics. Must follow every `setup_write`,
    /// also when nothing was written.
    pub fn finalize_write<S: Stage>(&self, tx: &Transaction) -> Result<TableInfo, CacheError> {
        stage_table::rebuild_index::<S>(tx)?;
        stage_table::analyze::<S>(tx)
    }

    /// Persists worker results in one transaction with the stage index dropped for the duration.
    pub fn store_results<R: StageResult>(&self, model: ModelToken, results: &[R]) -> Result<usize, CacheError> {
        self.in_transaction(|tx| {
            self.setup_write::<R::S>(tx)?;
            let mut rows = 0;
            for result in results {
                rows += payload::store(tx, model, result)?;
            }
            self.finalize_write::<R::S>(tx)?;
            Ok(rows)
        })
    }

    pub fn model_token(&self, model: &FrwModel) -> Result<TokenizedModel, CacheError> {
        self.in_transaction(|tx| self.tokenize_model(tx, model))
    }

    pub fn drop_inconsistent_configurations(&self) -> Result<u64, CacheError> {
        self.in_transaction(admin::drop_inconsistent_configurations)
    }
}

/// Samples that tokenize to an already present token are the same configuration.
fn add_unique<K: TokenKind, V: OrderedValue>(db: &mut ConfigDatabase<K, V>, token: Token<K>, value: V) {
    if !db.contains(token) {
        let _ = db.add(token, value);
    }
}

fn ensure_stage<S: Stage>(tx: &Transaction) -> Result<(), CacheError> {
    if stage_table::index_exists::<S>(tx)? {
        return stage_table::ensure_tables::<S>(tx);
    }
    let rows = stage_table::row_count::<S>(tx)?;
    if rows > 0 {
        warn!("{} has {} rows but no index, rebuilding it", S::TABLE, rows);
        stage_table::rebuild_index::<S>(tx)?;
    }
    stage_table::ensure_tables::<S>(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::payload::GrowthResult;
    use crate::test_utils::mk_store;

    #[test]
    fn in_transaction_rolls_back_on_error() {
        let store = mk_store("dm_rollback");
        let err = store
            .in_transaction(|tx| {
                let _: RedshiftToken = store.tokenize(tx, &Redshift(1.0))?;
                Err::<(), _>(CacheError::runtime("kernel output rejected"))
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Runtime);
        assert_eq!(store.active_transaction(), None);
        let zs = store.in_transaction(|tx| store.read_redshift_db(tx)).expect("read");
        assert!(zs.is_empty());
    }

    #[test]
    fn sampled_databases_are_tokenized_once() {
        let store = mk_store("dm_sampled");
        let tx = store.open_transaction().expect("tx");
        let z_db = store.build_redshift_db(&tx, &linear_samples(0.0, 10.0, 11)).expect("z");
        assert_eq!(z_db.len(), 11);
        let again = store.build_redshift_db(&tx, &[5.0, 5.0 * (1.0 + 1e-8), 20.0]).expect("again");
        assert_eq!(again.len(), 2);
        assert!(z_db.tokens().contains(&again.first().expect("first").0));
        assert_eq!(store.read_redshift_db(&tx).expect("read").len(), 12);

        let uv: UvCutoffDatabase = store.build_wavenumber_db(&tx, &[1.0, 2.0]).expect("uv");
        assert_eq!(uv.len(), 2);
        assert_eq!(store.read_wavenumber_db::<kind::UvCutoff>(&tx).expect("read").len(), 2);
        assert!(store.read_wavenumber_db::<kind::IrCutoff>(&tx).expect("read").is_empty());
    }

    #[test]
    fn k_db_respects_spectrum_range() {
        let store = mk_store("dm_kdb");
        let tx = store.open_transaction().expect("tx");
        let model = store.tokenize_model(&tx, &FrwModel::default()).expect("model");
        let source = LinearPkSource::new("/tmp/pk.dat", b"samples", model.token);
        let pk = store.ingest_linear_pk(&tx, &source, vec![(0.001, 1.0), (1.0, 2.0)]).expect("pk");
        let k_db = store.build_k_db_for_pk(&tx, &[0.001, 0.01, 0.5, 0.9], &pk).expect("k");
        assert_eq!(k_db.values(), vec![Wavenumber(0.01), Wavenumber(0.5)]);
    }

    #[test]
    fn store_results_rebuilds_index_and_records_stats() {
        let store = mk_store("dm_store");
        let (model, params, z_db) = store
            .in_transaction(|tx| {
                let model = store.tokenize_model(tx, &FrwModel::default())?;
                let params: GrowthParamsToken = store.tokenize(tx, &GrowthParams::default())?;
                Ok((model, params, store.build_redshift_db(tx, &[0.0, 1.0])?))
            })
            .expect("setup");
        let row = GrowthRow { g: 1.0, f: 1.0, a: 0.0, b: 0.0, f_a: 0.0, f_b: 0.0, provenance: Provenance::default() };
        let result = GrowthResult { params, rows: z_db.tokens().into_iter().map(|z| (z, row.clone())).collect() };
        assert_eq!(store.store_results(model.token, &[result]).expect("store"), 2);

        let tx = store.open_transaction().expect("tx");
        assert!(stage_table::index_exists::<GrowthStage>(&tx).expect("index"));
        let info = stage_table::table_info(&tx, GrowthStage::TABLE).expect("stats").expect("recorded");
        assert_eq!((info.rows, info.index_entries), (2, 2));
    }

    #[test]
    fn finalize_runs_for_empty_phases() {
        let store = mk_store("dm_empty");
        let none: Vec<GrowthResult> = Vec::new();
        assert_eq!(store.store_results(ModelToken::new(0), &none).expect("store"), 0);
        let tx = store.open_transaction().expect("tx");
        assert!(stage_table::index_exists::<GrowthStage>(&tx).expect("index"));
    }

    #[test]
    fn reopened_store_keeps_its_tokens() {
        let path = std::env::temp_dir().join(format!("dm_reopen_{}.db", rand::random::<u64>()));
        {
            let store = DataManager::open(&path, 16, Tolerances::default()).expect("open");
            assert_eq!(store.model_token(&FrwModel::default()).expect("model").token.id(), 0);
        }
        let store = DataManager::open(&path, 16, Tolerances::default()).expect("reopen");
        let mut other = FrwModel::default();
        other.omega_m = 0.3;
        assert_eq!(store.model_token(&FrwModel::default()).expect("model").token.id(), 0);
        assert_eq!(store.model_token(&other).expect("model").token.id(), 1);
        assert_eq!(store.path(), path.as_path());
    }
}
