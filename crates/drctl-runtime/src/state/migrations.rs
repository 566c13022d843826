//! Schema migrations for the state store.

use sqlx::SqlitePool;
use tracing::{info, instrument};

use drctl_core::{DrError, Result};

const SCHEMA_VERSION: i64 = 3;

fn migration_error(e: sqlx::Error) -> DrError {
    DrError::persistence("migration", e)
}

#[instrument(skip(pool))]
pub async fn run(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(migration_error)?;

    let current_version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(pool)
        .await
        .map_err(migration_error)?;
    let current_version = current_version.unwrap_or(0);

    if current_version >= SCHEMA_VERSION {
        info!("Database schema is up to date (version {})", current_version);
        return Ok(());
    }

    info!(
        "Migrating database from version {} to {}",
        current_version, SCHEMA_VERSION
    );

    if current_version < 1 {
        apply(pool, 1, V1).await?;
    }
    if current_version < 2 {
        apply(pool, 2, V2).await?;
    }
    if current_version < 3 {
        apply(pool, 3, V3).await?;
    }

    Ok(())
}

/// Apply one version's statements and record it, atomically.
async fn apply(pool: &SqlitePool, version: i64, statements: &[&str]) -> Result<()> {
    info!("Running migration to schema version {}", version);
    let mut tx = pool.begin().await.map_err(migration_error)?;
    for statement in statements {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .map_err(migration_error)?;
    }
    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(&mut *tx)
        .await
        .map_err(migration_error)?;
    tx.commit().await.map_err(migration_error)
}

/// Recovery pipeline tables.
const V1: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS restored_volumes (
        serial TEXT PRIMARY KEY,
        volume_name TEXT NOT NULL,
        snapshot_name TEXT NOT NULL,
        lun INTEGER NOT NULL,
        status TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_restored_volumes_name ON restored_volumes(volume_name)",
    r#"
    CREATE TABLE IF NOT EXISTS presented_volumes (
        serial TEXT PRIMARY KEY,
        volume_name TEXT NOT NULL,
        lun INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS checked_volumes (
        canonical TEXT PRIMARY KEY,
        volume_name TEXT NOT NULL,
        status TEXT NOT NULL,
        checked_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS presented_datastores (
        canonical TEXT PRIMARY KEY,
        datastore_name TEXT NOT NULL UNIQUE,
        status TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS datastore_folders (
        folder_path TEXT PRIMARY KEY,
        datastore_name TEXT NOT NULL
            REFERENCES presented_datastores(datastore_name)
            ON DELETE CASCADE ON UPDATE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS vmx_files (
        vmx_path TEXT PRIMARY KEY,
        datastore_name TEXT NOT NULL,
        folder_path TEXT NOT NULL
            REFERENCES datastore_folders(folder_path)
            ON DELETE CASCADE ON UPDATE CASCADE,
        file_name TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'unregistered'
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_vmx_files_file_name ON vmx_files(file_name)",
    "CREATE INDEX IF NOT EXISTS idx_vmx_files_folder ON vmx_files(folder_path)",
    r#"
    CREATE TABLE IF NOT EXISTS registered_vms (
        vmx_path TEXT PRIMARY KEY,
        vm_name TEXT NOT NULL,
        status TEXT NOT NULL,
        nic1 TEXT NOT NULL DEFAULT 'not connected',
        nic2 TEXT NOT NULL DEFAULT 'not connected',
        registered_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_registered_vms_name ON registered_vms(vm_name)",
    r#"
    CREATE TABLE IF NOT EXISTS last_configured_nics (
        vm_name TEXT PRIMARY KEY,
        nic1 TEXT NOT NULL,
        nic2 TEXT NOT NULL,
        configured_at TEXT NOT NULL
    )
    "#,
];

/// Host inventory and protection groups.
const V2: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS vm_hosts (
        name TEXT PRIMARY KEY,
        connection_state TEXT NOT NULL,
        cpu INTEGER NOT NULL,
        memory_gb REAL NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS protection_groups (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        environment TEXT NOT NULL DEFAULT '',
        name TEXT NOT NULL,
        UNIQUE(environment, name)
    )
    "#,
];

/// Cluster-wide datastore and VM inventory.
const V3: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS cluster_datastores (
        name TEXT PRIMARY KEY,
        capacity_gb REAL NOT NULL,
        used_gb REAL NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cluster_vms (
        name TEXT PRIMARY KEY,
        power_state TEXT NOT NULL,
        cpu INTEGER NOT NULL,
        memory_gb REAL NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
];
