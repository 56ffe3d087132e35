use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;
use tracing::info;

pub mod store;

use crate::error::DispatchError;
pub use store::SqlAuditStore;

/// Initialize the SQLite audit database and run migrations
pub async fn init_db(db_path: impl AsRef<Path>) -> Result<SqlitePool, DispatchError> {
    let db_path = db_path.as_ref();
    let db_path_str = db_path.to_string_lossy();

    // Ensure the database file exists or create it
    if !db_path.exists() {
        info!("Database file not found at {}, creating...", db_path_str);
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DispatchError::DatabaseError(format!("Failed to create database directory: {}", e))
            })?;
        }
        std::fs::File::create(db_path).map_err(|e| {
            DispatchError::DatabaseError(format!("Failed to create database file: {}", e))
        })?;
    }

    let db_url = format!("sqlite:{}", db_path_str);
    info!("Connecting to database at {}", db_url);
    connect_and_migrate(&db_url, 5).await
}

/// Single-connection in-memory database, migrated.
pub async fn init_memory_db() -> Result<SqlitePool, DispatchError> {
    connect_and_migrate("sqlite::memory:", 1).await
}

async fn connect_and_migrate(db_url: &str, max_connections: u32) -> Result<SqlitePool, DispatchError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(db_url)
        .await
        .map_err(|e| DispatchError::DatabaseError(format!("Failed to connect to database: {}", e)))?;

    info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| DispatchError::DatabaseError(format!("Failed to run migrations: {}", e)))?;

    info!("Database initialized successfully");
    Ok(pool)
}
