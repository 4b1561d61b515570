//! Integration tests for the exclusive resource allocator.

use std::collections::HashSet;
use std::path::Path;

use claimq::allocator::{Allocator, CONSUMED};
use claimq::config::Config;
use claimq::error::Error;
use claimq::lock::LockManager;
use claimq::model::PoolId;
use claimq::storage::Storage;

fn config_in(dir: &Path) -> Config {
    Config {
        pool_path_template: dir.join("pool_{pool}.csv").display().to_string(),
        ..Config::default()
    }
}

fn write_pool(config: &Config, pool: &str, units: usize) {
    let mut body = String::from("name,secret,consumed\n");
    for i in 0..units {
        body.push_str(&format!("unit-{i},s{i},\n"));
    }
    std::fs::write(config.pool_path(&PoolId::new(pool)), body).unwrap();
}

#[test]
fn claim_marks_unit_consumed_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    write_pool(&config, "0", 2);
    let allocator = Allocator::new(config.clone(), LockManager::new());
    let pool = PoolId::new("0");

    let unit = allocator.claim_one(&pool).unwrap();
    assert_eq!(unit.pool, pool);
    assert_eq!(unit.row, 0);
    assert_eq!(unit.payload["name"], "unit-0");
    assert_eq!(unit.payload["secret"], "s0");
    assert!(!unit.payload.contains_key("consumed"));

    let table = Storage::new(config.pool_path(&pool), LockManager::new())
        .load()
        .unwrap()
        .unwrap();
    assert_eq!(table.rows()[0]["consumed"], CONSUMED);
    assert_eq!(table.rows()[1]["consumed"], "");
    assert_eq!(allocator.remaining(&pool).unwrap(), Some(1));
}

#[test]
fn claims_are_handed_out_in_order_until_exhausted() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    write_pool(&config, "0", 3);
    let allocator = Allocator::new(config, LockManager::new());
    let pool = PoolId::new("0");

    let rows: Vec<usize> = (0..3)
        .map(|_| allocator.claim_one(&pool).unwrap().row)
        .collect();
    assert_eq!(rows, vec![0, 1, 2]);

    let err = allocator.claim_one(&pool).unwrap_err();
    assert!(matches!(err, Error::ResourceExhausted { ref pool } if pool == "0"));
    assert!(!err.is_transient());
    assert_eq!(allocator.remaining(&pool).unwrap(), Some(0));
}

#[test]
fn concurrent_claims_never_share_a_unit() {
    const UNITS: usize = 12;
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    write_pool(&config, "0", UNITS);
    let pool = PoolId::new("0");

    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..UNITS + 1)
            .map(|_| {
                // A manager per thread, like independent worker processes.
                let allocator = Allocator::new(config.clone(), LockManager::new());
                let pool = pool.clone();
                s.spawn(move || allocator.claim_one(&pool))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut names = HashSet::new();
    let mut exhausted = 0;
    for result in results {
        match result {
            Ok(unit) => assert!(names.insert(unit.payload["name"].clone())),
            Err(Error::ResourceExhausted { .. }) => exhausted += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(names.len(), UNITS);
    assert_eq!(exhausted, 1);
}

#[test]
fn missing_pool_is_provisioned_with_placeholder() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let allocator = Allocator::new(config.clone(), LockManager::new());
    let pool = PoolId::new("3");

    assert_eq!(allocator.remaining(&pool).unwrap(), None);

    let unit = allocator.claim_one(&pool).unwrap();
    assert_eq!(unit.payload["name"], "placeholder");
    assert!(config.pool_path(&pool).exists());

    let err = allocator.claim_one(&pool).unwrap_err();
    assert!(matches!(err, Error::ResourceExhausted { .. }));
}

#[test]
fn pool_without_consumed_column_gains_one() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let pool = PoolId::new("0");
    std::fs::write(config.pool_path(&pool), "name\nalpha\nbeta\n").unwrap();
    let allocator = Allocator::new(config.clone(), LockManager::new());

    let unit = allocator.claim_one(&pool).unwrap();
    assert_eq!(unit.payload["name"], "alpha");

    let table = Storage::new(config.pool_path(&pool), LockManager::new())
        .load()
        .unwrap()
        .unwrap();
    assert_eq!(table.headers(), &["name", "consumed"]);
    assert_eq!(allocator.remaining(&pool).unwrap(), Some(1));
}

#[test]
fn only_set_markers_count_as_consumed() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let pool = PoolId::new("0");
    std::fs::write(
        config.pool_path(&pool),
        "name,consumed\nalpha,yes\nbeta,TRUE\ngamma,consumed\ndelta,1\nepsilon,  \n",
    )
    .unwrap();
    let allocator = Allocator::new(config, LockManager::new());

    assert_eq!(allocator.remaining(&pool).unwrap(), Some(1));
    assert_eq!(allocator.claim_one(&pool).unwrap().payload["name"], "epsilon");
}

#[test]
fn falsy_markers_leave_units_free() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let pool = PoolId::new("0");
    std::fs::write(
        config.pool_path(&pool),
        "name,consumed\nalpha,false\nbeta,0\ngamma,no\n",
    )
    .unwrap();
    let allocator = Allocator::new(config, LockManager::new());

    assert_eq!(allocator.remaining(&pool).unwrap(), Some(3));
    assert_eq!(allocator.claim_one(&pool).unwrap().payload["name"], "alpha");
    assert_eq!(allocator.claim_one(&pool).unwrap().payload["name"], "beta");
    assert_eq!(allocator.remaining(&pool).unwrap(), Some(1));
}
