#![allow(dead_code)]

use chrono::DateTime;
use tempfile::TempDir;

use courier_core::ManualClock;
use courier_infra::{Database, DatabaseConfig};

/// A migrated database in a fresh temporary directory. Keep the `TempDir`
/// alive for as long as the database is used.
pub async fn database() -> (Database, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("test.db");
    let config = DatabaseConfig::default()
        .with_url(path.to_string_lossy().into_owned())
        .with_max_connections(8);
    let db = Database::connect(&config).await.expect("connect");
    db.migrate().await.expect("migrate");
    (db, dir)
}

pub fn clock() -> ManualClock {
    ManualClock::at(DateTime::from_timestamp_millis(1_700_000_000_000).expect("valid timestamp"))
}
