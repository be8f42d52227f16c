//! SQLite key/value backend with schema migrations.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};

use crate::error::AppError;
use crate::storage::backend::KeyValueBackend;

/// Current schema version. Increment when adding new migrations.
const SCHEMA_VERSION: i32 = 1;

/// V1 schema: a single blob table keyed by collection name.
const V1_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
"#;

/// SQLite database handle. Connections are opened per call.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    db_path: PathBuf,
}

impl SqliteBackend {
    /// Initializes the database at the given path.
    /// Creates parent directories if needed, opens the SQLite file, and runs migrations.
    pub async fn init(db_path: PathBuf) -> Result<Self, AppError> {
        let path = db_path.clone();

        tokio::task::spawn_blocking(move || Self::open_blocking(&path))
            .await
            .map_err(|e| AppError::Storage(format!("Database init task failed: {e}")))??;

        Ok(Self { db_path })
    }

    fn open_blocking(path: &Path) -> Result<(), AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                AppError::Storage(format!("Failed to create database directory: {e}"))
            })?;
        }

        let mut conn = Connection::open(path)
            .map_err(|e| AppError::Storage(format!("Failed to open database: {e}")))?;

        configure_connection(&conn)?;
        run_migrations(&mut conn)
    }

    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection, AppError> {
        let conn = Connection::open(&self.db_path)
            .map_err(|e| AppError::Storage(format!("Failed to open database: {e}")))?;
        configure_connection(&conn)?;
        Ok(conn)
    }

    /// Simple health check: executes SELECT 1.
    pub async fn health_check(&self) -> Result<(), AppError> {
        let backend = self.clone();

        tokio::task::spawn_blocking(move || {
            let conn = backend.connect()?;
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(|e| AppError::Storage(format!("Health check failed: {e}")))
        })
        .await
        .map_err(|e| AppError::Storage(format!("Health check task failed: {e}")))?
    }
}

impl KeyValueBackend for SqliteBackend {
    fn load(&self, key: &str) -> Result<Option<String>, AppError> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT value FROM kv_store WHERE key = ?1",
            rusqlite::params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| AppError::Storage(format!("Failed to load {key}: {e}")))
    }

    fn save(&self, key: &str, value: &str) -> Result<(), AppError> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO kv_store (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
            rusqlite::params![key, value, Utc::now().timestamp_millis()],
        )
        .map_err(|e| AppError::Storage(format!("Failed to save {key}: {e}")))?;
        Ok(())
    }
}

/// Configures connection with busy timeout and WAL mode.
fn configure_connection(conn: &Connection) -> Result<(), AppError> {
    conn.busy_timeout(Duration::from_secs(10))
        .map_err(|e| AppError::Storage(format!("Failed to set busy timeout: {e}")))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| AppError::Storage(format!("Failed to set WAL mode: {e}")))?;

    Ok(())
}

/// Runs database migrations using PRAGMA user_version.
fn run_migrations(conn: &mut Connection) -> Result<(), AppError> {
    let current_version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|e| AppError::Storage(format!("Failed to get schema version: {e}")))?;

    if current_version >= SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn
        .transaction()
        .map_err(|e| AppError::Storage(format!("Failed to start migration transaction: {e}")))?;

    if current_version < 1 {
        tx.execute_batch(V1_SCHEMA)
            .map_err(|e| AppError::Storage(format!("V1 migration failed: {e}")))?;
    }

    tx.pragma_update(None, "user_version", SCHEMA_VERSION)
        .map_err(|e| AppError::Storage(format!("Failed to update schema version: {e}")))?;

    tx.commit()
        .map_err(|e| AppError::Storage(format!("Failed to commit migration: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_db_path() -> (TempDir, PathBuf) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("rowloop.db");
        (temp_dir, db_path)
    }

    #[tokio::test]
    async fn init_creates_db_file_and_table() {
        let (_temp_dir, db_path) = test_db_path();

        let db = SqliteBackend::init(db_path.clone())
            .await
            .expect("Failed to init database");
        assert!(db_path.exists(), "Database file should exist");

        let conn = Connection::open(&db_path).expect("open");
        let version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .expect("version");
        assert_eq!(version, SCHEMA_VERSION);

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='kv_store'",
                [],
                |row| row.get(0),
            )
            .expect("query");
        assert_eq!(count, 1);

        db.health_check().await.expect("Health check should pass");
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let (_temp_dir, db_path) = test_db_path();

        let _db1 = SqliteBackend::init(db_path.clone())
            .await
            .expect("First init should succeed");
        let db2 = SqliteBackend::init(db_path.clone())
            .await
            .expect("Second init should succeed");

        db2.health_check().await.expect("Health check should pass");
    }

    #[tokio::test]
    async fn creates_parent_directories() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("nested").join("dirs").join("rowloop.db");

        SqliteBackend::init(db_path.clone())
            .await
            .expect("Should create nested directories");
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn save_overwrites_and_load_reads_back() {
        let (_temp_dir, db_path) = test_db_path();
        let db = SqliteBackend::init(db_path).await.expect("init");

        assert_eq!(db.load("executions_v1").expect("load"), None);
        db.save("executions_v1", "[1]").expect("save");
        db.save("executions_v1", "[1,2]").expect("save again");
        assert_eq!(
            db.load("executions_v1").expect("load").as_deref(),
            Some("[1,2]")
        );
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let (_temp_dir, db_path) = test_db_path();
        SqliteBackend::init(db_path.clone())
            .await
            .expect("init")
            .save("k", "persisted")
            .expect("save");

        let reopened = SqliteBackend::init(db_path).await.expect("reopen");
        assert_eq!(reopened.load("k").expect("load").as_deref(), Some("persisted"));
    }
}
