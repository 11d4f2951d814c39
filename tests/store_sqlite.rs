use curation_harness::{
    AnnotationModel, BestRunKey, BestRunStore, BestSource, FitConfig, ModelB, ModelKind,
    ModelParameters, Reconciliation, RunOrchestrator, SqliteBestRunStore, StoredBest,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::tempdir;

#[derive(Debug, serde::Deserialize)]
struct ExportRow {
    key_hash: String,
    model: String,
    parameter_count: usize,
    fingerprint: String,
    log_likelihood: f64,
    number_of_runs: usize,
    parameters: ModelParameters,
    hit_count: i64,
}

fn sample_params() -> ModelParameters {
    ModelParameters::Bt {
        gamma: vec![0.6],
        theta: vec![0.9, 0.8],
    }
}

#[test]
fn sqlite_store_put_get_and_export_increments_hit_count() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("best.sqlite");
    let store = SqliteBestRunStore::new(&db_path).unwrap();
    assert_eq!(store.path(), db_path.as_path());

    let key = BestRunKey::new(ModelKind::Bt, 3, "fingerprint-abc");
    assert!(store.get(&key).unwrap().is_none());

    let value = StoredBest {
        log_likelihood: -123.5,
        parameters: sample_params(),
        number_of_runs: 5,
    };
    store.put(&key, &value).unwrap();

    let hit1 = store.get(&key).unwrap().unwrap();
    assert_eq!(hit1, value);
    let _ = store.get(&key).unwrap().unwrap();

    // Upsert keeps one row per key.
    let better = StoredBest {
        log_likelihood: -100.0,
        ..value.clone()
    };
    store.put(&key, &better).unwrap();
    assert_eq!(store.len().unwrap(), 1);

    let export_path = dir.path().join("export.jsonl");
    let written = store.export_jsonl(&export_path).unwrap();
    assert_eq!(written, 1);

    let raw = std::fs::read_to_string(&export_path).unwrap();
    let rows: Vec<ExportRow> = raw
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.key_hash, key.key_hash);
    assert_eq!(row.model, "bt");
    assert_eq!(row.parameter_count, 3);
    assert_eq!(row.fingerprint, "fingerprint-abc");
    assert_eq!(row.log_likelihood, -100.0);
    assert_eq!(row.number_of_runs, 5);
    assert_eq!(row.parameters, sample_params());
    assert_eq!(row.hit_count, 2);
}

#[test]
fn sqlite_store_keys_differ_by_model_and_parameter_count() {
    let a = BestRunKey::new(ModelKind::B, 10, "fp");
    let b = BestRunKey::new(ModelKind::Bt, 10, "fp");
    let c = BestRunKey::new(ModelKind::B, 11, "fp");
    assert_ne!(a.key_hash, b.key_hash);
    assert_ne!(a.key_hash, c.key_hash);
    assert_eq!(a.key_hash, BestRunKey::new(ModelKind::B, 10, "fp").key_hash);
}

#[test]
fn sqlite_store_persists_best_across_batches() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("nested").join("best.sqlite");

    let mut rng = StdRng::seed_from_u64(8);
    let truth = ModelB::create_initial_state(3, 4, None, &mut rng).unwrap();
    let labels = truth.generate_labels(300, &mut rng);
    let data = truth.generate_annotations(&labels, &mut rng).unwrap();

    let orchestrator = RunOrchestrator::new(FitConfig {
        number_of_runs: 3,
        seed: 1,
        parallel: false,
        ..Default::default()
    })
    .unwrap();

    let first_ll = {
        let store = SqliteBestRunStore::new(&db_path).unwrap();
        let _lock = store.lock_exclusive().unwrap();
        let mut outcome = orchestrator.run(&data, None).unwrap();
        let result = orchestrator.reconcile_with_store(&mut outcome, &data, &store);
        assert_eq!(result, Reconciliation::Stored);
        outcome.best_log_likelihood
    };

    // Reopen: the identical batch cannot beat the stored record.
    let store = SqliteBestRunStore::new(&db_path).unwrap();
    let mut outcome = orchestrator.run(&data, None).unwrap();
    let result = orchestrator.reconcile_with_store(&mut outcome, &data, &store);
    assert_eq!(result, Reconciliation::KeptStored);
    assert_eq!(outcome.best_source, BestSource::Store);
    assert_eq!(outcome.best_log_likelihood, first_ll);
    assert_eq!(store.len().unwrap(), 1);
}

#[test]
fn sqlite_store_lock_sits_next_to_database_and_releases_on_drop() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("best.sqlite");
    let store = SqliteBestRunStore::new(&db_path).unwrap();
    let expected = dir.path().join("best.sqlite.lock");
    {
        let lock = store.lock_exclusive().unwrap();
        assert_eq!(lock.path(), expected.as_path());
        assert!(expected.exists());
    }
    // A second guard is only obtainable once the first is gone.
    let again = store.lock_exclusive().unwrap();
    assert_eq!(again.path(), expected.as_path());
}

#[test]
fn sqlite_store_replacement_keeps_creation_time_and_hits() {
    let dir = tempdir().unwrap();
    let store = SqliteBestRunStore::new(dir.path().join("best.sqlite")).unwrap();
    let key = BestRunKey::new(ModelKind::B, 4, "fp");
    let first = StoredBest {
        log_likelihood: -10.0,
        parameters: sample_params(),
        number_of_runs: 2,
    };
    store.put(&key, &first).unwrap();
    store.get(&key).unwrap().unwrap();
    store
        .put(
            &key,
            &StoredBest {
                log_likelihood: -5.0,
                ..first
            },
        )
        .unwrap();

    let export_path = dir.path().join("rows.jsonl");
    store.export_jsonl(&export_path).unwrap();
    let raw = std::fs::read_to_string(&export_path).unwrap();
    let row: serde_json::Value = serde_json::from_str(raw.trim()).unwrap();
    assert_eq!(row["log_likelihood"], -5.0);
    assert_eq!(row["hit_count"], 1);
    assert!(row["created_at"].as_i64().unwrap() <= row["updated_at"].as_i64().unwrap());
    assert!(row["created_at"].as_i64().unwrap() > 0);
}
