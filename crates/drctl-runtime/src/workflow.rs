//! Recovery pipeline stages.
//!
//! Each stage is one request: it reads its inputs from the state store (or
//! the caller), fans remote work out through [`run_batch`], and upserts
//! every per-item result under the item's natural key. Stages share no
//! in-memory state, so any of them can be re-run after a partial failure.
//!
//! ```text
//! restore ─► present ─► check_luns ─► resignature ─► inventory ─► register
//!                                                                   │
//!                      remove ◄── power_on/off ◄── reconfigure ◄── commit_nics
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{info, instrument, warn};

use drctl_core::config::{
    DrConfig, EnvironmentProfile, ExecutorConfig, UnmatchedNicPolicy, WorkflowConfig,
};
use drctl_core::model::{
    CheckStatus, CheckedVolume, ClusterDatastore, ClusterVm, DatastoreFolder, DatastoreInventory,
    DatastoreStatus, NOT_CONNECTED, NicAssignment, PresentedDatastore, PresentedVolume,
    ProtectionGroup, RegisteredVm, RegistrationStatus, RestoredVolume, VmHost, VmStatus, VmxFile,
    VolumeStatus,
};
use drctl_core::naming;
use drctl_core::protocol::BatchReport;
use drctl_core::{DrError, Result};

use crate::batch::run_batch;
use crate::extract::{extract, extract_one};
use crate::flasharray::{ArraySnapshot, FlashArrayClient, StorageArray};
use crate::reply::{
    DatastoreListing, HostRecord, LunFacts, NicReply, RegisterReply, RescanRecord,
    ResignatureReply, VmReply,
};
use crate::script::{Operation, build_script};
use crate::shell::{PowerShell, ScriptRunner};
use crate::state::{RemovedVm, Store};

/// Everything a stage needs to know about the request it serves.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub profile: EnvironmentProfile,
    /// Max remote calls in flight per batch stage.
    pub concurrency: usize,
    pub policy: WorkflowConfig,
}

/// Builds the remote-facing halves of an [`Orchestrator`] for a profile.
pub trait Connector: Send + Sync {
    fn runner(
        &self,
        executor: &ExecutorConfig,
        profile: &EnvironmentProfile,
    ) -> Result<Arc<dyn ScriptRunner>>;

    fn array(&self, profile: &EnvironmentProfile) -> Result<Arc<dyn StorageArray>>;
}

/// PowerShell subprocesses and the array's REST API.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveConnector;

impl Connector for LiveConnector {
    fn runner(
        &self,
        executor: &ExecutorConfig,
        profile: &EnvironmentProfile,
    ) -> Result<Arc<dyn ScriptRunner>> {
        Ok(Arc::new(PowerShell::from_config(executor, &profile.vcenter)))
    }

    fn array(&self, profile: &EnvironmentProfile) -> Result<Arc<dyn StorageArray>> {
        Ok(Arc::new(FlashArrayClient::new(&profile.array)?))
    }
}

/// NIC assignment as committed to the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NicCommit {
    #[serde(flatten)]
    pub assignment: NicAssignment,
    /// False when no registered VM had the name (skip policy).
    pub updated: bool,
}

/// Port groups pushed to a VM's adapters. `None` means left untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NicPush {
    pub vm_name: String,
    pub nic1: Option<String>,
    pub nic2: Option<String>,
    /// No adapter had a port group assigned; nothing was run.
    pub skipped: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PowerChange {
    pub vm_name: String,
    pub status: VmStatus,
    /// False when the VM is not tracked in the store.
    pub recorded: bool,
}

/// Runs pipeline stages for one environment. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    store: Store,
    runner: Arc<dyn ScriptRunner>,
    array: Arc<dyn StorageArray>,
    ctx: Arc<StageContext>,
}

impl Orchestrator {
    pub fn new(
        store: Store,
        runner: Arc<dyn ScriptRunner>,
        array: Arc<dyn StorageArray>,
        ctx: StageContext,
    ) -> Self {
        Self {
            store,
            runner,
            array,
            ctx: Arc::new(ctx),
        }
    }

    /// Resolve the profile for `tag` and connect to its endpoints.
    pub fn connect(
        config: &DrConfig,
        store: Store,
        connector: &dyn Connector,
        tag: Option<&str>,
    ) -> Result<Self> {
        let profile = config.profile(tag)?;
        let runner = connector.runner(&config.executor, &profile)?;
        let array = connector.array(&profile)?;
        let ctx = StageContext {
            profile,
            concurrency: config.executor.concurrency,
            policy: config.workflow.clone(),
        };
        Ok(Self::new(store, runner, array, ctx))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn context(&self) -> &StageContext {
        &self.ctx
    }

    fn esx_host(&self) -> String {
        self.ctx.profile.vcenter.esx_host.clone()
    }

    /// Render, run, and extract every record of `op`'s output.
    async fn run_op<T: DeserializeOwned>(&self, op: &Operation) -> Result<Vec<T>> {
        let script = build_script(op)?;
        let stdout = self.runner.execute(&script).await?;
        extract(script.operation, &stdout)
    }

    /// As [`Self::run_op`], for operations that report exactly one record.
    async fn run_one<T: DeserializeOwned>(&self, op: &Operation) -> Result<T> {
        let script = build_script(op)?;
        let stdout = self.runner.execute(&script).await?;
        extract_one(script.operation, &stdout)
    }

    /// Fan `work` out over `items` with this orchestrator's concurrency.
    async fn batch<I, T, K, W, Fut>(
        &self,
        stage: &'static str,
        items: Vec<I>,
        key: K,
        work: W,
    ) -> BatchReport<T>
    where
        I: Send + 'static,
        T: Send + 'static,
        K: Fn(&I) -> String,
        W: Fn(Orchestrator, I) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let this = self.clone();
        run_batch(stage, items, self.ctx.concurrency, key, move |item| {
            work(this.clone(), item)
        })
        .await
    }

    // ========================
    // Restore (storage array)
    // ========================

    /// Create `volume` from `snapshot`, connect it to the host group, and
    /// record it by serial.
    #[instrument(skip(self))]
    pub async fn restore_snapshot(&self, snapshot: &str, volume: &str) -> Result<RestoredVolume> {
        naming::validate_volume_name(snapshot, "Snapshot")?;
        naming::validate_volume_name(volume, "Volume")?;

        let created = self.array.create_volume_from_snapshot(snapshot, volume).await?;
        let lun = self
            .array
            .connect_host_group(volume, &self.ctx.profile.array.host_group)
            .await?;

        let restored = RestoredVolume {
            volume_name: volume.to_string(),
            snapshot_name: snapshot.to_string(),
            serial: created.serial,
            lun,
            status: VolumeStatus::Connected,
        };
        self.store.upsert_restored(&restored).await?;
        info!(volume, serial = %restored.serial, lun, "Snapshot restored");
        Ok(restored)
    }

    /// Refresh every restored volume's status from the array. A failed
    /// lookup leaves the row's previous status in place.
    pub async fn reload_restored_volumes(&self) -> Result<BatchReport<RestoredVolume>> {
        let volumes = self.store.list_restored().await?;
        Ok(self
            .batch(
                "reload_restored",
                volumes,
                |v| v.volume_name.clone(),
                |this, v| async move { this.reload_one(v).await },
            )
            .await)
    }

    async fn reload_one(&self, mut volume: RestoredVolume) -> Result<RestoredVolume> {
        volume.status = match self.array.get_volume(&volume.volume_name).await? {
            Some(found) if !found.destroyed => {
                if found.connection_count == 0 {
                    VolumeStatus::Disconnected
                } else {
                    VolumeStatus::Connected
                }
            }
            _ => VolumeStatus::MissingOrDeleted,
        };
        self.store
            .set_restored_status(&volume.serial, volume.status)
            .await?;
        Ok(volume)
    }

    /// Forget a restored volume. The array is not touched.
    pub async fn delete_restored_volume(&self, volume: &str) -> Result<()> {
        naming::validate_volume_name(volume, "Volume")?;
        if self.store.delete_restored(volume).await? == 0 {
            return Err(DrError::NotFound {
                kind: "restored volume",
                name: volume.to_string(),
            });
        }
        Ok(())
    }

    // ========================
    // Presentation
    // ========================

    /// Record volumes as visible to the compute host, keyed by serial.
    pub async fn present_volumes(
        &self,
        volumes: Vec<PresentedVolume>,
    ) -> Result<BatchReport<PresentedVolume>> {
        let mut report = BatchReport::default();
        for volume in volumes {
            let key = volume.serial.clone();
            let result = async {
                naming::validate_volume_name(&volume.volume_name, "Volume")?;
                naming::validate_serial(&volume.serial)?;
                self.store.upsert_presented(&volume).await?;
                Ok(volume)
            }
            .await;
            report.push(key, result);
        }
        Ok(report.sorted())
    }

    /// Present every restored volume.
    pub async fn present_restored(&self) -> Result<BatchReport<PresentedVolume>> {
        let volumes = self
            .store
            .list_restored()
            .await?
            .into_iter()
            .map(|r| PresentedVolume {
                volume_name: r.volume_name,
                serial: r.serial,
                lun: r.lun,
            })
            .collect();
        self.present_volumes(volumes).await
    }

    /// Clear presented and checked volumes.
    pub async fn reinitialize_presented(&self) -> Result<u64> {
        self.store.clear_presented().await
    }

    /// Clear datastores with their folder and file inventory.
    pub async fn reinitialize_datastores(&self) -> Result<u64> {
        self.store.clear_datastores().await
    }

    // ========================
    // Hosts
    // ========================

    /// Refresh the cluster's host list. An empty cluster prints no payload.
    pub async fn refresh_hosts(&self) -> Result<Vec<VmHost>> {
        let op = Operation::HostInventory {
            cluster: self.ctx.profile.vcenter.cluster.clone(),
        };
        let records: Vec<HostRecord> = or_empty(self.run_op(&op).await)?;
        let mut hosts = Vec::with_capacity(records.len());
        for r in records {
            let host = VmHost {
                name: r.name,
                connection_state: r.connection_state,
                cpu: r.cpu,
                memory_gb: r.memory_gb,
            };
            self.store.upsert_host(&host).await?;
            hosts.push(host);
        }
        Ok(hosts)
    }

    /// Datastores of the cluster. Served from the store unless `force` is
    /// set or nothing is stored yet; a fetch upserts every row by name.
    pub async fn refresh_datastores(&self, force: bool) -> Result<Vec<ClusterDatastore>> {
        if !force {
            let cached = self.store.list_cluster_datastores().await?;
            if !cached.is_empty() {
                return Ok(cached);
            }
        }
        let op = Operation::DatastoreList {
            cluster: self.ctx.profile.vcenter.cluster.clone(),
        };
        let datastores: Vec<ClusterDatastore> = or_empty(self.run_op(&op).await)?;
        for ds in &datastores {
            self.store.upsert_cluster_datastore(ds).await?;
        }
        Ok(datastores)
    }

    /// VMs of the cluster, cached the same way as [`Self::refresh_datastores`].
    pub async fn refresh_vms(&self, force: bool) -> Result<Vec<ClusterVm>> {
        if !force {
            let cached = self.store.list_cluster_vms().await?;
            if !cached.is_empty() {
                return Ok(cached);
            }
        }
        let op = Operation::VmList {
            cluster: self.ctx.profile.vcenter.cluster.clone(),
        };
        let vms: Vec<ClusterVm> = or_empty(self.run_op(&op).await)?;
        for vm in &vms {
            self.store.upsert_cluster_vm(vm).await?;
        }
        Ok(vms)
    }

    /// Rescan HBAs and VMFS on every host of the cluster.
    pub async fn rescan_storage(&self) -> Result<Vec<RescanRecord>> {
        let op = Operation::RescanStorage {
            cluster: self.ctx.profile.vcenter.cluster.clone(),
        };
        or_empty(self.run_op(&op).await)
    }

    // ========================
    // LUN validation and resignature
    // ========================

    /// Classify every presented volume against the host's unresolved
    /// extents and upsert the result by canonical name.
    pub async fn check_luns(&self) -> Result<BatchReport<CheckedVolume>> {
        let volumes = self.store.list_presented().await?;
        Ok(self
            .batch(
                "check_luns",
                volumes,
                |v| naming::canonical_name(&v.serial),
                |this, v| async move { this.check_one(v).await },
            )
            .await)
    }

    async fn check_one(&self, volume: PresentedVolume) -> Result<CheckedVolume> {
        let canonical = naming::canonical_name(&volume.serial);
        let facts: LunFacts = self
            .run_one(&Operation::LunCheck {
                esx_host: self.esx_host(),
                volume_name: volume.volume_name.clone(),
                canonical: canonical.clone(),
            })
            .await?;
        // Classify against the name we derived, not the one echoed back.
        let status = LunFacts {
            canonical: canonical.clone(),
            ..facts
        }
        .classify();

        let checked = CheckedVolume {
            volume_name: volume.volume_name,
            canonical,
            status,
        };
        self.store.upsert_checked(&checked).await?;
        Ok(checked)
    }

    /// Resignature checked volumes that are not mounted yet and rename the
    /// new datastores to their volume names.
    ///
    /// Volumes the check found already mounted are recorded as presented
    /// without running anything. Canonicals whose datastore is already
    /// presented are skipped, so a re-run only retries what failed.
    pub async fn resignature_datastores(&self) -> Result<BatchReport<PresentedDatastore>> {
        let done: HashSet<String> = self
            .store
            .list_datastores()
            .await?
            .into_iter()
            .filter(|d| d.status == DatastoreStatus::Presented)
            .map(|d| d.canonical)
            .collect();

        let (mounted, pending): (Vec<_>, Vec<_>) = self
            .store
            .list_checked()
            .await?
            .into_iter()
            .filter(|c| !done.contains(&c.canonical))
            .partition(|c| c.status == CheckStatus::Presented);

        let mut report = self
            .batch(
                "resignature",
                pending,
                |c| c.canonical.clone(),
                |this, c| async move { this.resignature_one(c).await },
            )
            .await;

        for checked in mounted {
            let datastore = PresentedDatastore {
                datastore_name: checked.volume_name,
                canonical: checked.canonical,
                status: DatastoreStatus::Presented,
            };
            let result = self.store.upsert_datastore(&datastore).await.map(|_| datastore.clone());
            report.push(datastore.canonical.clone(), result);
        }
        Ok(report.sorted())
    }

    async fn resignature_one(&self, checked: CheckedVolume) -> Result<PresentedDatastore> {
        let reply: ResignatureReply = self
            .run_one(&Operation::Resignature {
                esx_host: self.esx_host(),
                volume_name: checked.volume_name.clone(),
                device_path: naming::device_path(&checked.canonical),
                canonical: checked.canonical.clone(),
            })
            .await?;

        let datastore_name = match (reply.status, reply.datastore_name) {
            (DatastoreStatus::Presented, Some(name)) => name,
            _ => checked.volume_name,
        };
        let datastore = PresentedDatastore {
            datastore_name,
            canonical: checked.canonical,
            status: reply.status,
        };
        self.store.upsert_datastore(&datastore).await?;
        if datastore.status == DatastoreStatus::NotPresented {
            warn!(
                canonical = %datastore.canonical,
                "No unresolved extent matched, datastore not presented"
            );
        }
        Ok(datastore)
    }

    // ========================
    // Inventory and registration
    // ========================

    /// List VM folders and `.vmx` files on every presented datastore.
    pub async fn inventory_datastores(&self) -> Result<BatchReport<DatastoreInventory>> {
        let datastores: Vec<PresentedDatastore> = self
            .store
            .list_datastores()
            .await?
            .into_iter()
            .filter(|d| d.status == DatastoreStatus::Presented)
            .collect();
        Ok(self
            .batch(
                "inventory",
                datastores,
                |d| d.datastore_name.clone(),
                |this, d| async move { this.inventory_one(d).await },
            )
            .await)
    }

    async fn inventory_one(&self, datastore: PresentedDatastore) -> Result<DatastoreInventory> {
        let system_folders = &self.ctx.policy.system_folders;
        let listing: DatastoreListing = self
            .run_one(&Operation::DatastoreInventory {
                vcenter_server: self.ctx.profile.vcenter.server.clone(),
                datacenter: self.ctx.profile.vcenter.datacenter.clone(),
                datastore: datastore.datastore_name.clone(),
                system_folders: system_folders.clone(),
            })
            .await?;

        let name = &datastore.datastore_name;
        let mut folders = Vec::new();
        let mut files = Vec::new();
        for entry in listing.folders.into_vec() {
            if system_folders.contains(&entry.folder) {
                continue;
            }
            let folder_path = naming::folder_path(name, &entry.folder);
            for vmx in entry.vmx_files.into_vec() {
                files.push(VmxFile {
                    datastore_name: name.clone(),
                    folder_path: folder_path.clone(),
                    file_name: vmx.file_name,
                    vmx_path: vmx.vmx_path,
                    status: RegistrationStatus::Unregistered,
                });
            }
            folders.push(DatastoreFolder {
                datastore_name: name.clone(),
                folder_path,
            });
        }

        self.store.record_inventory(name, &folders, &files).await?;
        let folders = self.store.inventory(name).await?;
        Ok(DatastoreInventory { datastore, folders })
    }

    /// Register a VM from each `.vmx` path.
    pub async fn register_vms(&self, vmx_paths: Vec<String>) -> Result<BatchReport<RegisteredVm>> {
        for path in &vmx_paths {
            naming::validate_vmx_path(path)?;
        }
        Ok(self
            .batch(
                "register",
                vmx_paths,
                |p| p.clone(),
                |this, p| async move { this.register_one(p).await },
            )
            .await)
    }

    async fn register_one(&self, vmx_path: String) -> Result<RegisteredVm> {
        let reply: RegisterReply = self
            .run_one(&Operation::RegisterVm {
                esx_host: self.esx_host(),
                vmx_path: vmx_path.clone(),
            })
            .await?;
        self.store.record_registration(&reply.vm_name, &vmx_path).await
    }

    /// Register every inventoried file not registered yet.
    pub async fn register_all(&self) -> Result<BatchReport<RegisteredVm>> {
        let paths = self
            .store
            .list_vmx_files()
            .await?
            .into_iter()
            .filter(|f| f.status == RegistrationStatus::Unregistered)
            .map(|f| f.vmx_path)
            .collect();
        self.register_vms(paths).await
    }

    // ========================
    // Network adapters
    // ========================

    /// Store the desired port groups per VM name. Nothing runs remotely.
    pub async fn commit_nics(
        &self,
        assignments: Vec<NicAssignment>,
    ) -> Result<BatchReport<NicCommit>> {
        for a in &assignments {
            naming::validate_display_name(&a.vm_name, "VM")?;
            naming::validate_display_name(&a.nic1, "Port group")?;
            naming::validate_display_name(&a.nic2, "Port group")?;
        }

        let policy = self.ctx.policy.unmatched_nic_policy;
        let mut report = BatchReport::default();
        for assignment in assignments {
            let key = assignment.vm_name.clone();
            let result = match self.store.set_nic_assignment(&assignment).await {
                Ok(true) => Ok(NicCommit {
                    assignment,
                    updated: true,
                }),
                Ok(false) if policy == UnmatchedNicPolicy::Skip => {
                    info!(vm = %assignment.vm_name, "No registered VM by that name, skipped");
                    Ok(NicCommit {
                        assignment,
                        updated: false,
                    })
                }
                Ok(false) => Err(DrError::NotFound {
                    kind: "registered VM",
                    name: assignment.vm_name,
                }),
                Err(e) => Err(e),
            };
            report.push(key, result);
        }
        Ok(report.sorted())
    }

    /// Push each registered VM's stored port groups to its adapters.
    pub async fn reconfigure_nics(&self) -> Result<BatchReport<NicPush>> {
        let (unassigned, assigned): (Vec<_>, Vec<_>) = self
            .store
            .list_registered()
            .await?
            .into_iter()
            .partition(|vm| vm.nic1 == NOT_CONNECTED && vm.nic2 == NOT_CONNECTED);

        let mut report = self
            .batch(
                "reconfigure_nics",
                assigned,
                |vm| vm.vm_name.clone(),
                |this, vm| async move { this.nics_one(vm).await },
            )
            .await;
        for vm in unassigned {
            report.push_ok(
                vm.vm_name.clone(),
                NicPush {
                    vm_name: vm.vm_name,
                    nic1: None,
                    nic2: None,
                    skipped: true,
                },
            );
        }
        Ok(report.sorted())
    }

    async fn nics_one(&self, vm: RegisteredVm) -> Result<NicPush> {
        let wanted = |nic: &str| (nic != NOT_CONNECTED).then(|| nic.to_string());
        let push = NicPush {
            vm_name: vm.vm_name.clone(),
            nic1: wanted(&vm.nic1),
            nic2: wanted(&vm.nic2),
            skipped: false,
        };
        let _reply: NicReply = self
            .run_one(&Operation::ReconfigureNics {
                vm_name: push.vm_name.clone(),
                nic1: push.nic1.clone(),
                nic2: push.nic2.clone(),
            })
            .await?;
        self.store
            .record_nics_applied(&NicAssignment {
                vm_name: vm.vm_name,
                nic1: vm.nic1,
                nic2: vm.nic2,
            })
            .await?;
        Ok(push)
    }

    // ========================
    // Power and removal
    // ========================

    pub async fn power_on(&self, vm_names: Vec<String>) -> Result<BatchReport<PowerChange>> {
        self.power(vm_names, VmStatus::PoweredOn).await
    }

    pub async fn power_off(&self, vm_names: Vec<String>) -> Result<BatchReport<PowerChange>> {
        self.power(vm_names, VmStatus::PoweredOff).await
    }

    async fn power(
        &self,
        vm_names: Vec<String>,
        target: VmStatus,
    ) -> Result<BatchReport<PowerChange>> {
        validate_vm_names(&vm_names)?;
        let stage = if target == VmStatus::PoweredOn {
            "power_on"
        } else {
            "power_off"
        };
        Ok(self
            .batch(
                stage,
                vm_names,
                |n| n.clone(),
                move |this, n| async move { this.power_one(n, target).await },
            )
            .await)
    }

    async fn power_one(&self, vm_name: String, target: VmStatus) -> Result<PowerChange> {
        let op = if target == VmStatus::PoweredOn {
            Operation::PowerOn {
                vm_name: vm_name.clone(),
            }
        } else {
            Operation::PowerOff {
                vm_name: vm_name.clone(),
            }
        };
        let _reply: VmReply = self.run_one(&op).await?;
        let recorded = self.store.set_vm_status(&vm_name, target).await?;
        if !recorded {
            warn!(vm = %vm_name, "VM is not tracked, status not recorded");
        }
        Ok(PowerChange {
            vm_name,
            status: target,
            recorded,
        })
    }

    /// Remove VMs from the inventory and forget their registration.
    pub async fn remove_vms(&self, vm_names: Vec<String>) -> Result<BatchReport<RemovedVm>> {
        validate_vm_names(&vm_names)?;
        Ok(self
            .batch(
                "remove",
                vm_names,
                |n| n.clone(),
                |this, n| async move { this.remove_one(n).await },
            )
            .await)
    }

    async fn remove_one(&self, vm_name: String) -> Result<RemovedVm> {
        let _reply: VmReply = self
            .run_one(&Operation::RemoveVm {
                vm_name: vm_name.clone(),
            })
            .await?;
        self.store.remove_vm_records(&vm_name).await
    }

    // ========================
    // Protection groups
    // ========================

    /// Add a protection group in this environment's namespace. Returns
    /// whether it was newly created.
    pub async fn add_protection_group(&self, name: &str) -> Result<(ProtectionGroup, bool)> {
        naming::validate_volume_name(name, "Protection group")?;
        self.store
            .add_protection_group(self.ctx.profile.namespace(), name)
            .await
    }

    pub async fn list_protection_groups(&self) -> Result<Vec<ProtectionGroup>> {
        self.store
            .list_protection_groups(self.ctx.profile.namespace())
            .await
    }

    pub async fn delete_protection_group(&self, id: i64) -> Result<()> {
        if !self
            .store
            .delete_protection_group(self.ctx.profile.namespace(), id)
            .await?
        {
            return Err(DrError::NotFound {
                kind: "protection group",
                name: id.to_string(),
            });
        }
        Ok(())
    }

    /// Array snapshots of every protection group, one item per group.
    pub async fn protection_snapshots(&self) -> Result<BatchReport<Vec<ArraySnapshot>>> {
        let groups = self.list_protection_groups().await?;
        Ok(self
            .batch(
                "protection_snapshots",
                groups,
                |g| g.name.clone(),
                |this, g| async move { this.array.list_snapshots(&g.name).await },
            )
            .await)
    }

    /// Array identity, for connectivity checks.
    pub async fn array_info(&self) -> Result<serde_json::Value> {
        self.array.login().await?;
        self.array.list_arrays().await
    }
}

fn validate_vm_names(names: &[String]) -> Result<()> {
    for name in names {
        naming::validate_display_name(name, "VM")?;
    }
    Ok(())
}

/// Treat "no payload" as an empty result set.
fn or_empty<T>(result: Result<Vec<T>>) -> Result<Vec<T>> {
    match result {
        Err(e) if e.is_empty_result() => Ok(Vec::new()),
        other => other,
    }
}
