//! Integration tests for CSV table storage.

use claimq::error::Error;
use claimq::lock::LockManager;
use claimq::storage::{Commit, Row, Storage, Table};

fn row(pairs: &[(&str, &str)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn store_in(dir: &tempfile::TempDir, name: &str) -> Storage {
    Storage::new(dir.path().join(name), LockManager::new())
}

#[test]
fn load_missing_file_returns_none() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir, "absent.csv");

    assert!(!store.exists());
    assert!(store.load().unwrap().is_none());
}

#[test]
fn save_then_load_preserves_rows_and_column_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir, "tasks.csv");

    let mut table = Table::new(["key", "status", "note"]);
    for i in 0..50 {
        table.push(row(&[
            ("key", &format!("acct-{i}")),
            ("status", if i % 2 == 0 { "done" } else { "" }),
            ("note", "comma, \"quoted\" value"),
        ]));
    }
    store.save(&table).unwrap();

    let loaded = store.load().unwrap().expect("file should exist");
    assert_eq!(loaded.headers(), &["key", "status", "note"]);
    assert_eq!(loaded, table);
}

#[test]
fn save_leaves_no_temp_files_behind() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir, "tasks.csv");

    let mut table = Table::new(["key"]);
    table.push(row(&[("key", "a")]));
    store.save(&table).unwrap();
    table.push(row(&[("key", "b")]));
    store.save(&table).unwrap();

    let names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["tasks.csv".to_string()]);
}

#[test]
fn load_skips_blank_rows_and_pads_short_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ragged.csv");
    std::fs::write(&path, " key , status,extra\na,done\n,,\nb,pending,x\n").unwrap();

    let table = Storage::new(&path, LockManager::new())
        .load()
        .unwrap()
        .unwrap();

    assert_eq!(table.headers(), &["key", "status", "extra"]);
    assert_eq!(table.len(), 2);
    assert_eq!(table.rows()[0]["extra"], "");
    assert_eq!(table.rows()[1]["extra"], "x");
}

#[test]
fn cells_past_the_header_are_rejected_not_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.csv");
    let body = "key,status\na,,extra-cell\n";
    std::fs::write(&path, body).unwrap();
    let store = Storage::new(&path, LockManager::new());

    let err = store.load().unwrap_err();
    assert!(
        matches!(err, Error::ExtraCells { line: 2, width: 3, columns: 2, .. }),
        "{err:?}"
    );

    assert!(store.upsert("key", "a", &row(&[("status", "done")])).is_err());
    assert_eq!(std::fs::read_to_string(&path).unwrap(), body);
}

#[test]
fn trailing_empty_cells_are_tolerated() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.csv");
    std::fs::write(&path, "key,status\na,done,,\n").unwrap();

    let table = Storage::new(&path, LockManager::new())
        .load()
        .unwrap()
        .unwrap();
    assert_eq!(table.rows()[0]["status"], "done");
}

#[test]
fn push_and_merge_add_new_columns() {
    let mut table = Table::new(["key"]);
    table.push(row(&[("key", "a")]));
    table.push(row(&[("key", "b"), ("region", "eu")]));
    assert_eq!(table.headers(), &["key", "region"]);

    table.merge("key", "a", &row(&[("result", "ok")])).unwrap();
    assert!(table.has_column("result"));
    assert_eq!(table.rows()[0]["result"], "ok");

    let err = table.merge("key", "zzz", &Row::new()).unwrap_err();
    assert!(matches!(err, Error::NotFound(ref k) if k == "zzz"));
}

#[test]
fn index_by_rejects_duplicate_keys() {
    let mut table = Table::new(["key"]);
    table.push(row(&[("key", "a")]));
    table.push(row(&[("key", " a ")]));

    let err = table
        .index_by("key", std::path::Path::new("tasks.csv"))
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateKey { ref key, .. } if key == "a"));
}

#[test]
fn index_by_requires_column() {
    let table = Table::new(["name"]);
    let err = table
        .index_by("key", std::path::Path::new("tasks.csv"))
        .unwrap_err();
    assert!(matches!(err, Error::MissingColumn { ref column, .. } if column == "key"));
}

#[test]
fn transaction_discard_does_not_write() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir, "tasks.csv");
    let mut table = Table::new(["key", "status"]);
    table.push(row(&[("key", "a"), ("status", "")]));
    store.save(&table).unwrap();

    store
        .transaction(|t| {
            let t = t.as_mut().unwrap();
            t.merge("key", "a", &row(&[("status", "done")]))?;
            Ok((Commit::Discard, ()))
        })
        .unwrap();
    assert_eq!(store.load().unwrap().unwrap().rows()[0]["status"], "");

    store
        .upsert("key", "a", &row(&[("status", "done")]))
        .unwrap();
    assert_eq!(store.load().unwrap().unwrap().rows()[0]["status"], "done");
}

#[test]
fn transaction_error_releases_lock() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir, "tasks.csv");
    store.save(&Table::new(["key"])).unwrap();

    let failed: claimq::error::Result<()> =
        store.transaction(|_| Err(Error::Other("boom".to_string())));
    assert!(failed.is_err());

    // Same thread, same manager: would be a reentry error if still held.
    store.transaction(|_| Ok((Commit::Discard, ()))).unwrap();
}
