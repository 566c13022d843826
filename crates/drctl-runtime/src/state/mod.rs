//! Durable state store for the recovery pipeline (SQLite).
//!
//! Every write is an upsert keyed by the record's natural identity (serial,
//! canonical name, `.vmx` path, VM name), so a stage re-run after a partial
//! failure converges instead of duplicating rows. Deleting a datastore
//! cascades to its folders and files through foreign keys.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info, instrument};

use drctl_core::model::{
    CheckedVolume, ClusterDatastore, ClusterVm, DatastoreFolder, FolderInventory, NicAssignment,
    PresentedDatastore, PresentedVolume, ProtectionGroup, RegisteredVm, RegistrationStatus,
    RestoredVolume, VmHost, VmStatus, VmxFile, VolumeStatus,
};
use drctl_core::naming;
use drctl_core::{DrError, Result};

pub mod migrations;

#[cfg(test)]
mod tests;

const MEMORY: &str = ":memory:";

/// What removing a VM's records touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovedVm {
    /// Definition file reset to unregistered, if one was found.
    pub vmx_path: Option<String>,
    pub registered_rows: u64,
    pub nic_rows: u64,
}

/// Handle to the state store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn col<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| DrError::persistence("decode", format!("{}: {}", name, e)))
}

fn status<T: FromStr<Err = DrError>>(row: &SqliteRow, name: &str) -> Result<T> {
    col::<String>(row, name)?
        .parse()
        .map_err(|e: DrError| DrError::persistence("decode", e))
}

impl Store {
    /// Open (creating if missing) the database at `db_path` and migrate it.
    #[instrument(skip(db_path))]
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        info!("Opening state store at {:?}", db_path);

        let in_memory = db_path == Path::new(MEMORY);
        if !in_memory {
            if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    DrError::persistence("open", format!("create {}: {}", parent.display(), e))
                })?;
            }
        }

        let path = db_path
            .to_str()
            .ok_or_else(|| DrError::invalid("database path is not valid UTF-8"))?;
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| DrError::persistence("open", e))?
            .create_if_missing(true)
            .foreign_keys(true);

        // Each in-memory connection is a separate database, so keep exactly
        // one open for the life of the pool.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| DrError::persistence("open", e))?;

        migrations::run(&pool).await?;

        info!("State store ready");
        Ok(Self { pool })
    }

    /// Open a private in-memory store (tests, dry runs).
    pub async fn open_in_memory() -> Result<Self> {
        Self::open(MEMORY).await
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| DrError::persistence("ping", e))?;
        Ok(())
    }

    // ========================
    // Restored volumes
    // ========================

    #[instrument(skip(self, volume), fields(serial = %volume.serial))]
    pub async fn upsert_restored(&self, volume: &RestoredVolume) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO restored_volumes (serial, volume_name, snapshot_name, lun, status, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(serial) DO UPDATE SET
                volume_name = excluded.volume_name,
                snapshot_name = excluded.snapshot_name,
                lun = excluded.lun,
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&volume.serial)
        .bind(&volume.volume_name)
        .bind(&volume.snapshot_name)
        .bind(volume.lun)
        .bind(volume.status.as_str())
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(|e| DrError::persistence("upsert_restored", e))?;
        Ok(())
    }

    pub async fn list_restored(&self) -> Result<Vec<RestoredVolume>> {
        let rows = sqlx::query("SELECT * FROM restored_volumes ORDER BY volume_name")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DrError::persistence("list_restored", e))?;
        rows.iter()
            .map(|row| {
                Ok(RestoredVolume {
                    volume_name: col(row, "volume_name")?,
                    snapshot_name: col(row, "snapshot_name")?,
                    serial: col(row, "serial")?,
                    lun: col(row, "lun")?,
                    status: status(row, "status")?,
                })
            })
            .collect()
    }

    pub async fn set_restored_status(&self, serial: &str, status: VolumeStatus) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE restored_volumes SET status = ?, updated_at = ? WHERE serial = ?",
        )
        .bind(status.as_str())
        .bind(now())
        .bind(serial)
        .execute(&self.pool)
        .await
        .map_err(|e| DrError::persistence("set_restored_status", e))?;
        Ok(done.rows_affected() > 0)
    }

    /// Forget a restored volume. Returns the number of rows removed.
    pub async fn delete_restored(&self, volume_name: &str) -> Result<u64> {
        let done = sqlx::query("DELETE FROM restored_volumes WHERE volume_name = ?")
            .bind(volume_name)
            .execute(&self.pool)
            .await
            .map_err(|e| DrError::persistence("delete_restored", e))?;
        Ok(done.rows_affected())
    }

    // ========================
    // Presented and checked volumes
    // ========================

    pub async fn upsert_presented(&self, volume: &PresentedVolume) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO presented_volumes (serial, volume_name, lun)
            VALUES (?, ?, ?)
            ON CONFLICT(serial) DO UPDATE SET
                volume_name = excluded.volume_name,
                lun = excluded.lun
            "#,
        )
        .bind(&volume.serial)
        .bind(&volume.volume_name)
        .bind(volume.lun)
        .execute(&self.pool)
        .await
        .map_err(|e| DrError::persistence("upsert_presented", e))?;
        Ok(())
    }

    pub async fn list_presented(&self) -> Result<Vec<PresentedVolume>> {
        let rows = sqlx::query("SELECT * FROM presented_volumes ORDER BY volume_name")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DrError::persistence("list_presented", e))?;
        rows.iter()
            .map(|row| {
                Ok(PresentedVolume {
                    volume_name: col(row, "volume_name")?,
                    serial: col(row, "serial")?,
                    lun: col(row, "lun")?,
                })
            })
            .collect()
    }

    /// Clear presented and checked volumes together, so validation restarts
    /// from an empty slate.
    #[instrument(skip(self))]
    pub async fn clear_presented(&self) -> Result<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DrError::persistence("clear_presented", e))?;
        let presented = sqlx::query("DELETE FROM presented_volumes")
            .execute(&mut *tx)
            .await
            .map_err(|e| DrError::persistence("clear_presented", e))?;
        sqlx::query("DELETE FROM checked_volumes")
            .execute(&mut *tx)
            .await
            .map_err(|e| DrError::persistence("clear_presented", e))?;
        tx.commit()
            .await
            .map_err(|e| DrError::persistence("clear_presented", e))?;
        Ok(presented.rows_affected())
    }

    #[instrument(skip(self, volume), fields(canonical = %volume.canonical))]
    pub async fn upsert_checked(&self, volume: &CheckedVolume) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO checked_volumes (canonical, volume_name, status, checked_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(canonical) DO UPDATE SET
                volume_name = excluded.volume_name,
                status = excluded.status,
                checked_at = excluded.checked_at
            "#,
        )
        .bind(&volume.canonical)
        .bind(&volume.volume_name)
        .bind(volume.status.as_str())
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(|e| DrError::persistence("upsert_checked", e))?;
        Ok(())
    }

    pub async fn list_checked(&self) -> Result<Vec<CheckedVolume>> {
        let rows = sqlx::query("SELECT * FROM checked_volumes ORDER BY canonical")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DrError::persistence("list_checked", e))?;
        rows.iter()
            .map(|row| {
                Ok(CheckedVolume {
                    volume_name: col(row, "volume_name")?,
                    canonical: col(row, "canonical")?,
                    status: status(row, "status")?,
                })
            })
            .collect()
    }

    // ========================
    // Datastores and inventory
    // ========================

    #[instrument(skip(self, datastore), fields(canonical = %datastore.canonical))]
    pub async fn upsert_datastore(&self, datastore: &PresentedDatastore) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO presented_datastores (canonical, datastore_name, status, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(canonical) DO UPDATE SET
                datastore_name = excluded.datastore_name,
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&datastore.canonical)
        .bind(&datastore.datastore_name)
        .bind(datastore.status.as_str())
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(|e| DrError::persistence("upsert_datastore", e))?;
        Ok(())
    }

    pub async fn list_datastores(&self) -> Result<Vec<PresentedDatastore>> {
        let rows = sqlx::query("SELECT * FROM presented_datastores ORDER BY datastore_name")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DrError::persistence("list_datastores", e))?;
        rows.iter()
            .map(|row| {
                Ok(PresentedDatastore {
                    datastore_name: col(row, "datastore_name")?,
                    canonical: col(row, "canonical")?,
                    status: status(row, "status")?,
                })
            })
            .collect()
    }

    /// Drop every datastore; folders and files go with them.
    #[instrument(skip(self))]
    pub async fn clear_datastores(&self) -> Result<u64> {
        let done = sqlx::query("DELETE FROM presented_datastores")
            .execute(&self.pool)
            .await
            .map_err(|e| DrError::persistence("clear_datastores", e))?;
        Ok(done.rows_affected())
    }

    /// Record a datastore's folders and files. Existing rows are left as
    /// they are, so registration status survives a re-inventory.
    #[instrument(skip(self, files), fields(files = files.len()))]
    pub async fn record_inventory(
        &self,
        datastore: &str,
        folders: &[DatastoreFolder],
        files: &[VmxFile],
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DrError::persistence("record_inventory", e))?;
        for folder in folders {
            sqlx::query(
                "INSERT INTO datastore_folders (folder_path, datastore_name) VALUES (?, ?) \
                 ON CONFLICT(folder_path) DO NOTHING",
            )
            .bind(&folder.folder_path)
            .bind(datastore)
            .execute(&mut *tx)
            .await
            .map_err(|e| DrError::persistence("record_inventory", e))?;
        }
        for file in files {
            sqlx::query(
                r#"
                INSERT INTO vmx_files (vmx_path, datastore_name, folder_path, file_name, status)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(vmx_path) DO NOTHING
                "#,
            )
            .bind(&file.vmx_path)
            .bind(datastore)
            .bind(&file.folder_path)
            .bind(&file.file_name)
            .bind(file.status.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| DrError::persistence("record_inventory", e))?;
        }
        tx.commit()
            .await
            .map_err(|e| DrError::persistence("record_inventory", e))?;
        debug!(datastore, folders = folders.len(), "Inventory recorded");
        Ok(())
    }

    /// Folders and files of `datastore`, grouped by folder.
    pub async fn inventory(&self, datastore: &str) -> Result<Vec<FolderInventory>> {
        let folder_rows = sqlx::query(
            "SELECT folder_path FROM datastore_folders WHERE datastore_name = ? ORDER BY folder_path",
        )
        .bind(datastore)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DrError::persistence("inventory", e))?;

        let mut folders: BTreeMap<String, Vec<VmxFile>> = BTreeMap::new();
        for row in &folder_rows {
            folders.insert(col(row, "folder_path")?, Vec::new());
        }
        for file in self.files_where(Some(("datastore_name", datastore))).await? {
            folders.entry(file.folder_path.clone()).or_default().push(file);
        }

        Ok(folders
            .into_iter()
            .map(|(folder_path, vmx_files)| FolderInventory {
                folder_path,
                vmx_files,
            })
            .collect())
    }

    pub async fn get_vmx_file(&self, vmx_path: &str) -> Result<Option<VmxFile>> {
        Ok(self
            .files_where(Some(("vmx_path", vmx_path)))
            .await?
            .into_iter()
            .next())
    }

    pub async fn list_vmx_files(&self) -> Result<Vec<VmxFile>> {
        self.files_where(None).await
    }

    /// Files matching `column = value`, or all files.
    async fn files_where(&self, filter: Option<(&str, &str)>) -> Result<Vec<VmxFile>> {
        let (clause, value) = match filter {
            Some((column, value)) => (format!("WHERE {} = ?", column), Some(value)),
            None => (String::new(), None),
        };
        let sql = format!(
            "SELECT * FROM vmx_files {} ORDER BY folder_path, file_name",
            clause
        );
        let mut query = sqlx::query(&sql);
        if let Some(value) = value {
            query = query.bind(value);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DrError::persistence("list_vmx_files", e))?;
        rows.iter()
            .map(|row| {
                Ok(VmxFile {
                    datastore_name: col(row, "datastore_name")?,
                    folder_path: col(row, "folder_path")?,
                    file_name: col(row, "file_name")?,
                    vmx_path: col(row, "vmx_path")?,
                    status: status(row, "status")?,
                })
            })
            .collect()
    }

    // ========================
    // Registered VMs
    // ========================

    /// Mark the file registered and upsert its VM row. NIC assignments on
    /// an existing row are kept.
    #[instrument(skip(self))]
    pub async fn record_registration(&self, vm_name: &str, vmx_path: &str) -> Result<RegisteredVm> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DrError::persistence("record_registration", e))?;
        sqlx::query("UPDATE vmx_files SET status = ? WHERE vmx_path = ?")
            .bind(RegistrationStatus::Registered.as_str())
            .bind(vmx_path)
            .execute(&mut *tx)
            .await
            .map_err(|e| DrError::persistence("record_registration", e))?;
        sqlx::query(
            r#"
            INSERT INTO registered_vms (vmx_path, vm_name, status, registered_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(vmx_path) DO UPDATE SET
                vm_name = excluded.vm_name,
                status = excluded.status,
                registered_at = excluded.registered_at
            "#,
        )
        .bind(vmx_path)
        .bind(vm_name)
        .bind(VmStatus::Registered.as_str())
        .bind(now())
        .execute(&mut *tx)
        .await
        .map_err(|e| DrError::persistence("record_registration", e))?;
        tx.commit()
            .await
            .map_err(|e| DrError::persistence("record_registration", e))?;

        self.registered_where(Some(("vmx_path", vmx_path)))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DrError::persistence("record_registration", "row vanished after write"))
    }

    pub async fn list_registered(&self) -> Result<Vec<RegisteredVm>> {
        self.registered_where(None).await
    }

    pub async fn get_registered(&self, vm_name: &str) -> Result<Option<RegisteredVm>> {
        Ok(self
            .registered_where(Some(("vm_name", vm_name)))
            .await?
            .into_iter()
            .next())
    }

    async fn registered_where(&self, filter: Option<(&str, &str)>) -> Result<Vec<RegisteredVm>> {
        let (clause, value) = match filter {
            Some((column, value)) => (format!("WHERE {} = ?", column), Some(value)),
            None => (String::new(), None),
        };
        let sql = format!("SELECT * FROM registered_vms {} ORDER BY vm_name", clause);
        let mut query = sqlx::query(&sql);
        if let Some(value) = value {
            query = query.bind(value);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DrError::persistence("list_registered", e))?;
        rows.iter()
            .map(|row| {
                Ok(RegisteredVm {
                    vm_name: col(row, "vm_name")?,
                    vmx_path: col(row, "vmx_path")?,
                    status: status(row, "status")?,
                    nic1: col(row, "nic1")?,
                    nic2: col(row, "nic2")?,
                })
            })
            .collect()
    }

    /// Store the desired NICs for a VM. Returns false when no VM row matched.
    pub async fn set_nic_assignment(&self, assignment: &NicAssignment) -> Result<bool> {
        let done = sqlx::query("UPDATE registered_vms SET nic1 = ?, nic2 = ? WHERE vm_name = ?")
            .bind(&assignment.nic1)
            .bind(&assignment.nic2)
            .bind(&assignment.vm_name)
            .execute(&self.pool)
            .await
            .map_err(|e| DrError::persistence("set_nic_assignment", e))?;
        Ok(done.rows_affected() > 0)
    }

    /// Write a VM's power status. Returns false when no VM row matched.
    pub async fn set_vm_status(&self, vm_name: &str, status: VmStatus) -> Result<bool> {
        let done = sqlx::query("UPDATE registered_vms SET status = ? WHERE vm_name = ?")
            .bind(status.as_str())
            .bind(vm_name)
            .execute(&self.pool)
            .await
            .map_err(|e| DrError::persistence("set_vm_status", e))?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn record_nics_applied(&self, applied: &NicAssignment) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO last_configured_nics (vm_name, nic1, nic2, configured_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(vm_name) DO UPDATE SET
                nic1 = excluded.nic1,
                nic2 = excluded.nic2,
                configured_at = excluded.configured_at
            "#,
        )
        .bind(&applied.vm_name)
        .bind(&applied.nic1)
        .bind(&applied.nic2)
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(|e| DrError::persistence("record_nics_applied", e))?;
        Ok(())
    }

    pub async fn list_last_configured(&self) -> Result<Vec<NicAssignment>> {
        let rows = sqlx::query("SELECT * FROM last_configured_nics ORDER BY vm_name")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DrError::persistence("list_last_configured", e))?;
        rows.iter()
            .map(|row| {
                Ok(NicAssignment {
                    vm_name: col(row, "vm_name")?,
                    nic1: col(row, "nic1")?,
                    nic2: col(row, "nic2")?,
                })
            })
            .collect()
    }

    /// Forget a removed VM: delete its VM and NIC-history rows and reset
    /// its definition file to unregistered, in one transaction.
    ///
    /// The file is found through the VM row; failing that, by the file
    /// name the hypervisor gives the VM (`<vm_name>.vmx`).
    #[instrument(skip(self))]
    pub async fn remove_vm_records(&self, vm_name: &str) -> Result<RemovedVm> {
        let op = "remove_vm_records";
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DrError::persistence(op, e))?;

        let from_row: Option<String> =
            sqlx::query_scalar("SELECT vmx_path FROM registered_vms WHERE vm_name = ? LIMIT 1")
                .bind(vm_name)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| DrError::persistence(op, e))?;
        let vmx_path = match from_row {
            Some(path) => Some(path),
            None => sqlx::query_scalar(
                "SELECT vmx_path FROM vmx_files WHERE file_name = ? ORDER BY vmx_path LIMIT 1",
            )
            .bind(naming::vmx_file_name(vm_name))
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| DrError::persistence(op, e))?,
        };

        if let Some(path) = &vmx_path {
            sqlx::query("UPDATE vmx_files SET status = ? WHERE vmx_path = ?")
                .bind(RegistrationStatus::Unregistered.as_str())
                .bind(path)
                .execute(&mut *tx)
                .await
                .map_err(|e| DrError::persistence(op, e))?;
        }

        let registered = sqlx::query("DELETE FROM registered_vms WHERE vm_name = ?")
            .bind(vm_name)
            .execute(&mut *tx)
            .await
            .map_err(|e| DrError::persistence(op, e))?;
        let nics = sqlx::query("DELETE FROM last_configured_nics WHERE vm_name = ?")
            .bind(vm_name)
            .execute(&mut *tx)
            .await
            .map_err(|e| DrError::persistence(op, e))?;

        tx.commit().await.map_err(|e| DrError::persistence(op, e))?;

        Ok(RemovedVm {
            vmx_path,
            registered_rows: registered.rows_affected(),
            nic_rows: nics.rows_affected(),
        })
    }

    // ========================
    // Hosts
    // ========================

    pub async fn upsert_host(&self, host: &VmHost) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO vm_hosts (name, connection_state, cpu, memory_gb, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                connection_state = excluded.connection_state,
                cpu = excluded.cpu,
                memory_gb = excluded.memory_gb,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&host.name)
        .bind(&host.connection_state)
        .bind(host.cpu)
        .bind(host.memory_gb)
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(|e| DrError::persistence("upsert_host", e))?;
        Ok(())
    }

    pub async fn list_hosts(&self) -> Result<Vec<VmHost>> {
        let rows = sqlx::query("SELECT * FROM vm_hosts ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DrError::persistence("list_hosts", e))?;
        rows.iter()
            .map(|row| {
                Ok(VmHost {
                    name: col(row, "name")?,
                    connection_state: col(row, "connection_state")?,
                    cpu: col(row, "cpu")?,
                    memory_gb: col(row, "memory_gb")?,
                })
            })
            .collect()
    }

    // ========================
    // Cluster inventory
    // ========================

    pub async fn upsert_cluster_datastore(&self, datastore: &ClusterDatastore) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cluster_datastores (name, capacity_gb, used_gb, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                capacity_gb = excluded.capacity_gb,
                used_gb = excluded.used_gb,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&datastore.name)
        .bind(datastore.capacity_gb)
        .bind(datastore.used_gb)
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(|e| DrError::persistence("upsert_cluster_datastore", e))?;
        Ok(())
    }

    pub async fn list_cluster_datastores(&self) -> Result<Vec<ClusterDatastore>> {
        let rows = sqlx::query("SELECT * FROM cluster_datastores ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DrError::persistence("list_cluster_datastores", e))?;
        rows.iter()
            .map(|row| {
                Ok(ClusterDatastore {
                    name: col(row, "name")?,
                    capacity_gb: col(row, "capacity_gb")?,
                    used_gb: col(row, "used_gb")?,
                })
            })
            .collect()
    }

    pub async fn upsert_cluster_vm(&self, vm: &ClusterVm) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cluster_vms (name, power_state, cpu, memory_gb, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                power_state = excluded.power_state,
                cpu = excluded.cpu,
                memory_gb = excluded.memory_gb,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&vm.name)
        .bind(&vm.power_state)
        .bind(vm.cpu)
        .bind(vm.memory_gb)
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(|e| DrError::persistence("upsert_cluster_vm", e))?;
        Ok(())
    }

    pub async fn list_cluster_vms(&self) -> Result<Vec<ClusterVm>> {
        let rows = sqlx::query("SELECT * FROM cluster_vms ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DrError::persistence("list_cluster_vms", e))?;
        rows.iter()
            .map(|row| {
                Ok(ClusterVm {
                    name: col(row, "name")?,
                    power_state: col(row, "power_state")?,
                    cpu: col(row, "cpu")?,
                    memory_gb: col(row, "memory_gb")?,
                })
            })
            .collect()
    }

    // ========================
    // Protection groups (namespaced by environment tag)
    // ========================

    /// Add a group under `namespace`. Returns the group and whether it was
    /// newly created.
    pub async fn add_protection_group(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(ProtectionGroup, bool)> {
        let done = sqlx::query(
            "INSERT INTO protection_groups (environment, name) VALUES (?, ?) \
             ON CONFLICT(environment, name) DO NOTHING",
        )
        .bind(namespace)
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(|e| DrError::persistence("add_protection_group", e))?;

        let id: i64 = sqlx::query_scalar(
            "SELECT id FROM protection_groups WHERE environment = ? AND name = ?",
        )
        .bind(namespace)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DrError::persistence("add_protection_group", e))?;

        Ok((
            ProtectionGroup {
                id,
                name: name.to_string(),
            },
            done.rows_affected() > 0,
        ))
    }

    pub async fn list_protection_groups(&self, namespace: &str) -> Result<Vec<ProtectionGroup>> {
        let rows = sqlx::query(
            "SELECT id, name FROM protection_groups WHERE environment = ? ORDER BY name",
        )
        .bind(namespace)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DrError::persistence("list_protection_groups", e))?;
        rows.iter()
            .map(|row| {
                Ok(ProtectionGroup {
                    id: col(row, "id")?,
                    name: col(row, "name")?,
                })
            })
            .collect()
    }

    pub async fn delete_protection_group(&self, namespace: &str, id: i64) -> Result<bool> {
        let done = sqlx::query("DELETE FROM protection_groups WHERE environment = ? AND id = ?")
            .bind(namespace)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| DrError::persistence("delete_protection_group", e))?;
        Ok(done.rows_affected() > 0)
    }
}
