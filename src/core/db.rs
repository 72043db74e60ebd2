//! SQLite connection and schema management
use std::fs;
use std::path::Path;

use anyhow::{Error, Result};
use rusqlite::Connection as SyncConnection;
use tokio_rusqlite::Connection;

const DB_FILE_NAME: &str = "playground.sqlite";

/// Ordered list of schema migrations. Each entry is applied once and
/// tracked in `PRAGMA user_version`.
const MIGRATIONS: &[&str] = &[
    // 1: persisted session records
    r#"
    CREATE TABLE IF NOT EXISTS session_record (
        key TEXT PRIMARY KEY,
        data TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    );
    "#,
];

/// Open an async connection to the database stored in `db_dir`,
/// creating the directory if it doesn't exist yet.
pub async fn async_db(db_dir: &str) -> Result<Connection, Error> {
    fs::create_dir_all(db_dir)?;
    let path = Path::new(db_dir).join(DB_FILE_NAME);
    let db = Connection::open(path).await?;
    Ok(db)
}

/// Create the schema from scratch on a fresh database.
pub fn initialize_db(conn: &mut SyncConnection) -> Result<(), rusqlite::Error> {
    migrate_db(conn)
}

/// Apply any migrations that haven't run yet.
pub fn migrate_db(conn: &mut SyncConnection) -> Result<(), rusqlite::Error> {
    let current: usize = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    let tx = conn.transaction()?;
    for (idx, migration) in MIGRATIONS.iter().enumerate().skip(current) {
        tracing::info!("Applying db migration {}", idx + 1);
        tx.execute_batch(migration)?;
    }
    tx.pragma_update(None, "user_version", MIGRATIONS.len())?;
    tx.commit()?;

    Ok(())
}
