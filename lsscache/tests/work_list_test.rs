use lsscache::resolver::missing;
use lsscache::stage_table::store_row;
use lsscache::*;
use std::sync::Arc;

struct Grid {
    model: TokenizedModel,
    tokens: SpectrumTokens,
    xy_token: MatsubaraXyParamsToken,
    z_db: RedshiftDatabase,
    k_db: WavenumberDatabase,
    ir_db: IrCutoffDatabase,
    uv_db: UvCutoffDatabase,
    ir_resum_db: IrResumDatabase,
}

impl Grid {
    fn dims(&self) -> ResumDimensions<'_> {
        ResumDimensions { z_db: &self.z_db, k_db: &self.k_db, ir_db: &self.ir_db, uv_db: &self.uv_db, ir_resum_db: &self.ir_resum_db }
    }
}

fn provenance() -> Provenance {
    Provenance { evaluations: 1, time_ns: 1_000 }
}

fn growth_row() -> GrowthRow {
    GrowthRow { g: 0.8, f: 0.6, a: 0.1, b: 0.2, f_a: 1.2, f_b: 1.3, provenance: provenance() }
}

fn oneloop_row(tree: f64) -> OneLoopPkRow {
    let parts = PkParts { tree, p13: Estimate { value: -1.0, error: 0.01 }, p22: Estimate { value: 2.0, error: 0.01 } };
    OneLoopPkRow { raw: parts, nowiggle: parts, provenance: provenance() }
}

fn resum_row() -> ResumPkRow {
    ResumPkRow { tree: 1.0, resummed: Estimate { value: 1.5, error: 0.02 }, provenance: provenance() }
}

/// 3 wavenumbers × 2 IR cutoffs × 1 UV cutoff × 2 resummation scales at a single redshift,
/// with every upstream stage the resummed spectrum depends on already stored.
fn seed_grid(store: &DataManager) -> Grid {
    store
        .in_transaction(|tx| {
            let model = store.tokenize_model(tx, &FrwModel::default())?;
            let growth: GrowthParamsToken = store.tokenize(tx, &GrowthParams::default())?;
            let loop_params: LoopParamsToken = store.tokenize(tx, &LoopParams::default())?;
            let xy_token: MatsubaraXyParamsToken = store.tokenize(tx, &MatsubaraXyParams::default())?;
            let source = LinearPkSource::new("/data/mdr1_pk.dat", b"0.0001 10\n10 0.1\n", model.token);
            let pk = store.ingest_linear_pk(tx, &source, vec![(0.0001, 10.0), (10.0, 0.1)])?;
            let tokens = SpectrumTokens { growth, loop_params, pk: pk.token };

            let z_db = store.build_redshift_db(tx, &[0.5])?;
            let k_db = store.build_k_db_for_pk(tx, &[0.05, 0.1, 0.2], &pk)?;
            let ir_db: IrCutoffDatabase = store.build_wavenumber_db(tx, &[1e-4, 1e-3])?;
            let uv_db: UvCutoffDatabase = store.build_wavenumber_db(tx, &[1.0])?;
            let ir_resum_db: IrResumDatabase = store.build_wavenumber_db(tx, &[0.1, 0.2])?;

            for (z, _) in &z_db {
                store_row::<GrowthStage>(tx, &GrowthKey { model: model.token, params: growth, z }, &growth_row())?;
            }
            for (ir_resum, _) in &ir_resum_db {
                let key = MatsubaraXyKey { model: model.token, params: xy_token, pk: pk.token, ir_resum };
                store_row::<MatsubaraXyStage>(tx, &key, &MatsubaraXyRow { x: 0.3, y: 0.4, provenance: provenance() })?;
            }
            for config in loop_tensor_product(&k_db, &ir_db, &uv_db) {
                for (z, _) in &z_db {
                    let key = OneLoopPkKey {
                        model: model.token, growth, loop_params, k: config.k_token, z, pk: pk.token,
                        ir: config.ir_token, uv: config.uv_token,
                    };
                    store_row::<OneLoopPkStage>(tx, &key, &oneloop_row(config.k.value()))?;
                }
            }
            Ok(Grid { model, tokens, xy_token, z_db, k_db, ir_db, uv_db, ir_resum_db })
        })
        .expect("seed grid")
}

fn resum_key(grid: &Grid, config: &ResumConfiguration, z: RedshiftToken) -> ResumPkKey {
    let lc = config.loop_config;
    ResumPkKey {
        model: grid.model.token,
        growth: grid.tokens.growth,
        loop_params: grid.tokens.loop_params,
        xy: grid.xy_token,
        k: lc.k_token,
        z,
        pk: grid.tokens.pk,
        ir: lc.ir_token,
        uv: lc.uv_token,
        ir_resum: config.ir_resum_token,
    }
}

fn build(store: &DataManager, grid: &Grid) -> Option<WorkList<ResumPkItem>> {
    let tx = store.open_transaction().expect("tx");
    build_resum_pk_work_list(&tx, &grid.model, grid.tokens, grid.xy_token, grid.dims()).expect("work list")
}

#[test]
fn partially_persisted_grid_yields_only_the_missing_items() {
    let store = DataManager::temp("work_list_resum", true).expect("store");
    let grid = seed_grid(&store);
    let configs = resum_tensor_product(&grid.k_db, &grid.ir_db, &grid.uv_db, &grid.ir_resum_db);
    assert_eq!(configs.len(), 12);
    let (z, _) = grid.z_db.first().expect("one redshift");

    store
        .in_transaction(|tx| {
            for config in configs.iter().take(5) {
                store_row::<ResumPkStage>(tx, &resum_key(&grid, config, z), &resum_row())?;
            }
            Ok(())
        })
        .expect("persist five");

    let list = build(&store, &grid).expect("seven missing");
    assert_eq!(list.len(), 7);
    let expected: Vec<ResumConfiguration> = configs[5..].to_vec();
    let got: Vec<ResumConfiguration> = list.iter().map(|item| item.config).collect();
    assert_eq!(got, expected);

    let first = &list.items()[0];
    for item in list.iter() {
        assert!(Arc::ptr_eq(&item.growth, &first.growth));
        assert_eq!(item.growth.at(z), Some(&growth_row()));
        assert_eq!(item.oneloop.raw.tree, item.config.loop_config.k.value());
    }
    for a in list.iter() {
        for b in list.iter() {
            assert_eq!(Arc::ptr_eq(&a.xy, &b.xy), a.config.ir_resum_token == b.config.ir_resum_token);
        }
    }

    let results: Vec<ResumPkResult> = list
        .iter()
        .map(|item| ResumPkResult {
            growth: item.tokens.growth,
            loop_params: item.tokens.loop_params,
            xy: item.xy_token,
            k: item.config.loop_config.k_token,
            z: item.z_token,
            pk: item.tokens.pk,
            ir: item.config.loop_config.ir_token,
            uv: item.config.loop_config.uv_token,
            ir_resum: item.config.ir_resum_token,
            row: resum_row(),
        })
        .collect();
    assert_eq!(store.store_results(grid.model.token, &results).expect("store"), 7);
    assert!(build(&store, &grid).is_none());
}

fn multipole_row() -> MultipolePkRow {
    let ell = Multipole { tree: 1.0, p13: Estimate { value: -0.5, error: 0.01 }, ..Multipole::default() };
    MultipolePkRow { ell0: ell, ell2: ell, ell4: ell, provenance: provenance() }
}

#[test]
fn multipoles_resolve_separately_from_the_resummed_spectrum() {
    let store = DataManager::temp("work_list_multipole", true).expect("store");
    let grid = seed_grid(&store);
    let configs = resum_tensor_product(&grid.k_db, &grid.ir_db, &grid.uv_db, &grid.ir_resum_db);
    let (z, _) = grid.z_db.first().expect("one redshift");

    store
        .in_transaction(|tx| {
            for config in &configs {
                store_row::<ResumPkStage>(tx, &resum_key(&grid, config, z), &resum_row())?;
            }
            for config in configs.iter().step_by(3) {
                store_row::<MultipolePkStage>(tx, &resum_key(&grid, config, z), &multipole_row())?;
            }
            Ok(())
        })
        .expect("persist");
    assert!(build(&store, &grid).is_none());

    let tx = store.open_transaction().expect("tx");
    let list = build_multipole_pk_work_list(&tx, &grid.model, grid.tokens, grid.xy_token, grid.dims())
        .expect("work list")
        .expect("eight missing");
    assert_eq!(list.len(), 8);
    let expected: Vec<ResumConfiguration> = configs.iter().enumerate().filter(|(i, _)| i % 3 != 0).map(|(_, c)| *c).collect();
    assert_eq!(list.iter().map(|item| item.config).collect::<Vec<_>>(), expected);

    let first = &list.items()[0];
    for a in list.iter() {
        assert!(Arc::ptr_eq(&a.growth, &first.growth));
        assert_eq!(a.oneloop.raw.tree, a.config.loop_config.k.value());
        for b in list.iter() {
            assert_eq!(Arc::ptr_eq(&a.xy, &b.xy), a.config.ir_resum_token == b.config.ir_resum_token);
        }
    }
    drop(tx);

    let results: Vec<MultipolePkResult> = list
        .iter()
        .map(|item| MultipolePkResult {
            growth: item.tokens.growth,
            loop_params: item.tokens.loop_params,
            xy: item.xy_token,
            k: item.config.loop_config.k_token,
            z: item.z_token,
            pk: item.tokens.pk,
            ir: item.config.loop_config.ir_token,
            uv: item.config.loop_config.uv_token,
            ir_resum: item.config.ir_resum_token,
            row: multipole_row(),
        })
        .collect();
    assert_eq!(store.store_results(grid.model.token, &results).expect("store"), 8);
    let tx = store.open_transaction().expect("tx");
    let rest = build_multipole_pk_work_list(&tx, &grid.model, grid.tokens, grid.xy_token, grid.dims()).expect("work list");
    assert!(rest.is_none());
    let key = resum_key(&grid, &configs[1], z);
    assert_eq!(find_multipole_pk(&tx, &key).expect("stored").ell0.tree, 1.0);
}

#[test]
fn missing_is_the_complement_of_what_is_stored() {
    let store = DataManager::temp("work_list_complement", true).expect("store");
    let grid = seed_grid(&store);
    let configs = resum_tensor_product(&grid.k_db, &grid.ir_db, &grid.uv_db, &grid.ir_resum_db);
    let (z, _) = grid.z_db.first().expect("one redshift");
    let stored: Vec<usize> = vec![0, 3, 4, 9, 11];

    let tx = store.open_transaction().expect("tx");
    for i in &stored {
        store_row::<ResumPkStage>(&tx, &resum_key(&grid, &configs[*i], z), &resum_row()).expect("store");
    }
    let absent = missing::<ResumPkStage, _>(&tx, configs.clone(), |c| resum_key(&grid, c, z)).expect("missing");
    assert_eq!(absent.len(), 7);
    for (i, config) in configs.iter().enumerate() {
        assert_eq!(absent.contains(config), !stored.contains(&i));
    }
    assert!(tx.live_temp_tables().is_empty());
}

#[test]
fn missing_redshifts_returns_none_when_everything_is_stored() {
    let store = DataManager::temp("work_list_growth", true).expect("store");
    let grid = seed_grid(&store);
    let tx = store.open_transaction().expect("tx");
    let growth = build_growth_work_list(&tx, &grid.model, grid.tokens.growth, &GrowthParams::default(), &grid.z_db).expect("growth");
    assert!(growth.is_none());

    let more_z = store.build_redshift_db(&tx, &[0.5, 1.0, 2.0]).expect("z");
    let list = build_growth_work_list(&tx, &grid.model, grid.tokens.growth, &GrowthParams::default(), &more_z)
        .expect("growth")
        .expect("two redshifts missing");
    assert_eq!(list.len(), 1);
    let item = &list.items()[0];
    assert_eq!(item.z_db.values(), vec![Redshift(1.0), Redshift(2.0)]);
    assert_eq!(item.z_db.iter().rev().next().map(|(_, z)| *z), Some(Redshift(2.0)));
}

#[test]
fn only_one_transaction_is_open_at_a_time() {
    let store = DataManager::temp("work_list_tx", true).expect("store");
    let mut tx = store.open_transaction().expect("first");
    assert_eq!(store.active_transaction(), Some(tx.id()));
    let err = store.open_transaction().err().expect("second must fail");
    assert_eq!(err.kind(), ErrorKind::Transaction);

    tx.commit().expect("commit");
    assert_eq!(tx.state(), TxState::Committed);
    assert_eq!(tx.rollback().unwrap_err().kind(), ErrorKind::Transaction);
    assert_eq!(store.active_transaction(), None);
}

#[test]
fn dropped_transaction_discards_its_writes() {
    let store = DataManager::temp("work_list_drop", true).expect("store");
    {
        let tx = store.open_transaction().expect("tx");
        store.build_redshift_db(&tx, &[0.0, 1.0, 2.0]).expect("z");
        assert_eq!(store.read_redshift_db(&tx).expect("read").len(), 3);
    }
    assert_eq!(store.active_transaction(), None);
    let tx = store.open_transaction().expect("tx");
    assert!(store.read_redshift_db(&tx).expect("read").is_empty());
}

#[test]
fn changed_dataset_stops_the_run() {
    let store = DataManager::temp("work_list_pk", true).expect("store");
    let model = store.model_token(&FrwModel::default()).expect("model");
    let tx = store.open_transaction().expect("tx");
    let original = LinearPkSource::new("/data/pk.dat", b"0.01 100\n", model.token);
    store.tokenize_linear_pk(&tx, &original).expect("first");
    let edited = LinearPkSource::new("/data/pk.dat", b"0.01 120\n", model.token);
    assert_eq!(store.tokenize_linear_pk(&tx, &edited).unwrap_err().kind(), ErrorKind::Runtime);
}
