//! SQLite store plumbing. Each store is a single file behind a small r2d2
//! pool; workers check out their own connection and blocking store work
//! runs under `spawn_blocking`.

pub mod entities;
pub mod enums;
pub mod history_service;
pub mod inventory_service;
pub mod jobs_service;
pub mod template_service;

use std::path::Path;

use r2d2_sqlite::SqliteConnectionManager;
use thiserror::Error;
use tracing::info;

pub type SqlitePool = r2d2::Pool<SqliteConnectionManager>;

const INVENTORY_SCHEMA: &str = include_str!("../../migrations/inventory.sql");
const COLLECTOR_SCHEMA: &str = include_str!("../../migrations/collector.sql");
const TEMPLATE_SCHEMA: &str = include_str!("../../migrations/templates.sql");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("not found: {0}")]
    NotFound(String),
}

/// Opens a pooled connection set against a SQLite file, creating the file
/// and its parent directory if needed.
pub fn open_pool(path: &Path, max_size: u32) -> Result<SqlitePool, StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let manager = SqliteConnectionManager::file(path).with_init(|conn| {
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
    });
    let pool = r2d2::Pool::builder().max_size(max_size).build(manager)?;
    Ok(pool)
}

pub fn initialize_inventory(pool: &SqlitePool) -> Result<(), StoreError> {
    apply_schema(pool, INVENTORY_SCHEMA, "inventory")
}

pub fn initialize_collector(pool: &SqlitePool) -> Result<(), StoreError> {
    apply_schema(pool, COLLECTOR_SCHEMA, "collector")
}

pub fn initialize_templates(pool: &SqlitePool) -> Result<(), StoreError> {
    apply_schema(pool, TEMPLATE_SCHEMA, "templates")
}

fn apply_schema(pool: &SqlitePool, schema: &str, store: &str) -> Result<(), StoreError> {
    let conn = pool.get()?;
    conn.execute_batch(schema)?;
    info!(store, "schema applied");
    Ok(())
}
