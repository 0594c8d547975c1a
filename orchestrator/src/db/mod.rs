use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use thiserror::Error;

pub mod jobs;
pub mod models;

/// Migrations embedded at build time, applied in order.
const MIGRATIONS: &[(&str, &str)] = &[(
    "001_jobs.sql",
    include_str!("../../migrations/001_jobs.sql"),
)];

/// Database-related errors
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Rusqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Database not found: {0}")]
    NotFound(String),

    #[error("Database configuration error: {0}")]
    Config(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Database connection pool
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    /// Create a new database connection pool
    pub fn new(database_path: &str) -> Result<Self> {
        tracing::info!(path = %database_path, "Connecting to database");

        // Create directory if needed (skip for in-memory databases)
        let is_memory = database_path == ":memory:" || database_path.contains("mode=memory");
        if !is_memory {
            if let Some(parent) = std::path::Path::new(database_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        DbError::Config(format!("Failed to create database directory: {}", e))
                    })?;
                }
            }
        }

        // Plain :memory: gets a shared cache so every pooled connection sees the same data
        let connection_string = if database_path == ":memory:" {
            "file::memory:?cache=shared"
        } else {
            database_path
        };

        let manager = SqliteConnectionManager::file(connection_string).with_init(move |conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            if !is_memory {
                conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            }
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            Ok(())
        });

        let pool = Pool::builder().max_size(8).build(manager)?;

        tracing::info!("Database connected successfully");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub fn migrate(&self) -> Result<()> {
        tracing::info!("Running database migrations");

        let conn = self.pool.get()?;
        for (name, sql) in MIGRATIONS {
            tracing::debug!(migration = %name, "Applying migration");
            conn.execute_batch(sql)?;
        }

        tracing::info!("Migrations completed successfully");
        Ok(())
    }

    /// Get a connection from the pool
    pub fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Bump and return the process epoch.
    ///
    /// Called once per process start. Versions handed out by this process are
    /// never lower than `epoch << 32`, which keeps them above anything an
    /// earlier process could have published.
    pub fn next_epoch(&self) -> Result<u64> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        let current: Option<i64> = tx
            .query_row("SELECT value FROM meta WHERE key = 'epoch'", [], |row| {
                row.get(0)
            })
            .optional()?;
        let next = current.unwrap_or(0) + 1;

        tx.execute(
            "INSERT INTO meta (key, value) VALUES ('epoch', ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![next],
        )?;
        tx.commit()?;

        Ok(next as u64)
    }
}

#[cfg(test)]
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(test)]
static TEST_DB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Create a unique in-memory database for testing
/// Each call returns a new isolated database
#[cfg(test)]
pub(crate) fn create_test_db() -> Database {
    let id = TEST_DB_COUNTER.fetch_add(1, Ordering::SeqCst);
    let db_name = format!("file:orchestrator_testdb{}?mode=memory&cache=shared", id);
    let db = Database::new(&db_name).expect("Failed to create test database");
    db.migrate().expect("Failed to run migrations");
    db
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_in_memory_db() {
        let db = Database::new(":memory:").expect("Failed to create in-memory database");

        let conn = db.get_conn().expect("Failed to get connection");
        let result: i64 = conn
            .query_row("SELECT 1", [], |row| row.get(0))
            .expect("Failed to execute query");

        assert_eq!(result, 1);
    }

    #[test]
    fn test_run_migrations() {
        let db = create_test_db();

        let conn = db.get_conn().expect("Failed to get connection");
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("Failed to prepare statement");

        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .expect("Failed to query tables")
            .collect::<std::result::Result<Vec<_>, _>>()
            .expect("Failed to collect results");

        assert!(tables.contains(&"jobs".to_string()));
        assert!(tables.contains(&"transcripts".to_string()));
        assert!(tables.contains(&"meta".to_string()));
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let db = create_test_db();
        db.migrate().expect("Second migration run should succeed");
    }

    #[test]
    fn test_epoch_increments() {
        let db = create_test_db();
        let first = db.next_epoch().unwrap();
        let second = db.next_epoch().unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[test]
    fn test_file_db_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("jobs.db");
        let path_str = path.to_str().unwrap();

        {
            let db = Database::new(path_str).unwrap();
            db.migrate().unwrap();
            assert_eq!(db.next_epoch().unwrap(), 1);
        }

        let db = Database::new(path_str).unwrap();
        db.migrate().unwrap();
        assert_eq!(db.next_epoch().unwrap(), 2);
    }
}
