#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;

use anyhow::Result;
use assert_cmd::Command;
use serde_json::Value;
use tempfile::tempdir;

use saga_migrator_lib::store::{open_pool, SqliteTableStore};
use saga_migrator_lib::{derive, PropertyValue, SourceRecord};

const TYPE: &str = "Shop.Sagas.OrderSaga";

async fn seed_source(db_path: &Path, records: Vec<SourceRecord>) -> Result<()> {
    let pool = open_pool(db_path, true).await?;
    let store = SqliteTableStore::new(pool.clone());
    store.ensure_schema().await?;
    for record in &records {
        store.insert(record).await?;
    }
    pool.close().await;
    Ok(())
}

fn order(row: &str, order_id: Option<&str>) -> SourceRecord {
    let record = SourceRecord::new(TYPE, "p", row).with("Step", PropertyValue::String("Billing".into()));
    match order_id {
        Some(id) => record.with("OrderId", PropertyValue::String(id.into())),
        None => record,
    }
}

#[test]
fn derive_prints_the_id() -> Result<()> {
    let output = Command::cargo_bin("saga-migrator")?
        .args(["derive", "--type", "Shop.Sagas.MySagaData", "--property", "MyId", "--value", "X"])
        .output()?;

    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout)?;
    assert_eq!(stdout.trim(), derive("Shop.Sagas.MySagaData", "MyId", "X"));
    Ok(())
}

#[tokio::test]
async fn export_then_import_through_sqlite() -> Result<()> {
    let tmp = tempdir()?;
    let source_db = tmp.path().join("source.sqlite3");
    let target_db = tmp.path().join("target.sqlite3");
    let out = tmp.path().join("export");
    seed_source(&source_db, vec![order("r1", Some("A")), order("r2", Some("B"))]).await?;

    let output = Command::cargo_bin("saga-migrator")?
        .args(["export", "--type", TYPE, "--key-property", "OrderId"])
        .arg("--source")
        .arg(&source_db)
        .arg("--out")
        .arg(&out)
        .output()?;
    assert!(
        output.status.success(),
        "export failed: stdout={} stderr={}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    let summary: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(summary["succeeded"], 2);
    let id = derive(TYPE, "OrderId", "A");
    assert!(out.join(TYPE).join(format!("{id}.json")).is_file());

    let output = Command::cargo_bin("saga-migrator")?
        .arg("import")
        .arg("--target")
        .arg(&target_db)
        .arg("--in")
        .arg(&out)
        .output()?;
    assert!(
        output.status.success(),
        "import failed: stdout={} stderr={}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    let summary: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(summary["succeeded"], 2);
    assert_eq!(summary["failed"], 0);
    Ok(())
}

#[tokio::test]
async fn partial_export_exits_with_two() -> Result<()> {
    let tmp = tempdir()?;
    let source_db = tmp.path().join("source.sqlite3");
    let reports = tmp.path().join("reports");
    seed_source(&source_db, vec![order("r1", Some("A")), order("r2", None)]).await?;

    let output = Command::cargo_bin("saga-migrator")?
        .args(["export", "--type", TYPE, "--key-property", "OrderId"])
        .arg("--source")
        .arg(&source_db)
        .arg("--out")
        .arg(tmp.path().join("export"))
        .arg("--report-dir")
        .arg(&reports)
        .output()?;

    assert_eq!(output.status.code(), Some(2));
    let summary: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(summary["failed"], 1);
    assert_eq!(summary["failures"][0]["rowKey"], "r2");
    assert_eq!(std::fs::read_dir(&reports)?.count(), 1);
    Ok(())
}

#[test]
fn missing_export_tree_exits_with_one() -> Result<()> {
    let tmp = tempdir()?;
    let output = Command::cargo_bin("saga-migrator")?
        .arg("import")
        .arg("--target")
        .arg(tmp.path().join("target.sqlite3"))
        .arg("--in")
        .arg(tmp.path().join("missing"))
        .output()?;

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("IMPORT/ROOT_MISSING"), "stderr={stderr}");
    Ok(())
}
