use crate::state::Store;
use drctl_core::model::{
    CheckStatus, CheckedVolume, ClusterDatastore, ClusterVm, DatastoreFolder, DatastoreStatus,
    NOT_CONNECTED, NicAssignment, PresentedDatastore, PresentedVolume, RegistrationStatus,
    RestoredVolume, VmHost, VmStatus, VmxFile, VolumeStatus,
};

fn datastore(name: &str, canonical: &str) -> PresentedDatastore {
    PresentedDatastore {
        datastore_name: name.to_string(),
        canonical: canonical.to_string(),
        status: DatastoreStatus::Presented,
    }
}

fn file(datastore: &str, folder: &str, name: &str) -> VmxFile {
    let folder_path = format!("[{}] {}", datastore, folder);
    VmxFile {
        datastore_name: datastore.to_string(),
        vmx_path: format!("{}/{}", folder_path, name),
        folder_path,
        file_name: name.to_string(),
        status: RegistrationStatus::Unregistered,
    }
}

fn folder(datastore: &str, folder: &str) -> DatastoreFolder {
    DatastoreFolder {
        datastore_name: datastore.to_string(),
        folder_path: format!("[{}] {}", datastore, folder),
    }
}

/// DS-1 with VM-1 and VM-2 inventoried.
async fn inventoried_store() -> Store {
    let store = Store::open_in_memory().await.unwrap();
    store
        .upsert_datastore(&datastore("DS-1", "naa.624a9370aaaa"))
        .await
        .unwrap();
    store
        .record_inventory(
            "DS-1",
            &[folder("DS-1", "VM-1"), folder("DS-1", "VM-2")],
            &[file("DS-1", "VM-1", "VM-1.vmx"), file("DS-1", "VM-2", "VM-2.vmx")],
        )
        .await
        .unwrap();
    store
}

#[tokio::test]
async fn test_store_init() {
    let store = Store::open_in_memory().await.unwrap();
    store.ping().await.unwrap();
    assert!(store.list_restored().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_file_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("drctl.db");

    let store = Store::open(&path).await.unwrap();
    store
        .upsert_presented(&PresentedVolume {
            volume_name: "VOL-A".to_string(),
            serial: "1234".to_string(),
            lun: 1,
        })
        .await
        .unwrap();
    drop(store);

    let reopened = Store::open(&path).await.unwrap();
    assert_eq!(reopened.list_presented().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_restored_upsert_is_keyed_by_serial() {
    let store = Store::open_in_memory().await.unwrap();
    let mut vol = RestoredVolume {
        volume_name: "VOL-A".to_string(),
        snapshot_name: "pg1.snap-1.VOL-A".to_string(),
        serial: "ABCD1234".to_string(),
        lun: 10,
        status: VolumeStatus::Connected,
    };
    store.upsert_restored(&vol).await.unwrap();
    vol.lun = 11;
    store.upsert_restored(&vol).await.unwrap();

    let all = store.list_restored().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].lun, 11);

    assert!(
        store
            .set_restored_status("ABCD1234", VolumeStatus::Disconnected)
            .await
            .unwrap()
    );
    assert!(
        !store
            .set_restored_status("FFFF", VolumeStatus::Disconnected)
            .await
            .unwrap()
    );
    assert_eq!(
        store.list_restored().await.unwrap()[0].status,
        VolumeStatus::Disconnected
    );

    assert_eq!(store.delete_restored("VOL-A").await.unwrap(), 1);
    assert_eq!(store.delete_restored("VOL-A").await.unwrap(), 0);
}

#[tokio::test]
async fn test_checked_upsert_overwrites_status() {
    let store = Store::open_in_memory().await.unwrap();
    let mut checked = CheckedVolume {
        volume_name: "VOL-A".to_string(),
        canonical: "naa.624a93701234".to_string(),
        status: CheckStatus::NoResignatureNeeded,
    };
    store.upsert_checked(&checked).await.unwrap();
    checked.status = CheckStatus::NeedsResignature;
    store.upsert_checked(&checked).await.unwrap();

    let all = store.list_checked().await.unwrap();
    assert_eq!(all, vec![checked]);
}

#[tokio::test]
async fn test_clear_presented_also_clears_checked() {
    let store = Store::open_in_memory().await.unwrap();
    store
        .upsert_presented(&PresentedVolume {
            volume_name: "VOL-A".to_string(),
            serial: "1234".to_string(),
            lun: 1,
        })
        .await
        .unwrap();
    store
        .upsert_checked(&CheckedVolume {
            volume_name: "VOL-A".to_string(),
            canonical: "naa.624a93701234".to_string(),
            status: CheckStatus::Presented,
        })
        .await
        .unwrap();

    assert_eq!(store.clear_presented().await.unwrap(), 1);
    assert!(store.list_presented().await.unwrap().is_empty());
    assert!(store.list_checked().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_datastore_rename_keeps_one_row_per_canonical() {
    let store = Store::open_in_memory().await.unwrap();
    store
        .upsert_datastore(&PresentedDatastore {
            datastore_name: "VOL-A".to_string(),
            canonical: "naa.624a93701234".to_string(),
            status: DatastoreStatus::NotPresented,
        })
        .await
        .unwrap();
    store
        .upsert_datastore(&datastore("snap-1f2e-DS-A", "naa.624a93701234"))
        .await
        .unwrap();

    let all = store.list_datastores().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].datastore_name, "snap-1f2e-DS-A");
    assert_eq!(all[0].status, DatastoreStatus::Presented);
}

#[tokio::test]
async fn test_inventory_groups_files_by_folder() {
    let store = inventoried_store().await;
    let view = store.inventory("DS-1").await.unwrap();
    assert_eq!(view.len(), 2);
    assert_eq!(view[0].folder_path, "[DS-1] VM-1");
    assert_eq!(view[0].vmx_files.len(), 1);
    assert_eq!(view[0].vmx_files[0].vmx_path, "[DS-1] VM-1/VM-1.vmx");
    assert!(store.inventory("DS-404").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reinventory_keeps_registration_status() {
    let store = inventoried_store().await;
    store
        .record_registration("VM-1", "[DS-1] VM-1/VM-1.vmx")
        .await
        .unwrap();

    store
        .record_inventory(
            "DS-1",
            &[folder("DS-1", "VM-1")],
            &[file("DS-1", "VM-1", "VM-1.vmx")],
        )
        .await
        .unwrap();

    let f = store
        .get_vmx_file("[DS-1] VM-1/VM-1.vmx")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(f.status, RegistrationStatus::Registered);
    assert_eq!(store.list_vmx_files().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_clear_datastores_cascades() {
    let store = inventoried_store().await;
    assert_eq!(store.clear_datastores().await.unwrap(), 1);
    assert!(store.list_datastores().await.unwrap().is_empty());
    assert!(store.inventory("DS-1").await.unwrap().is_empty());
    assert!(store.list_vmx_files().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_registration_preserves_nic_assignment() {
    let store = inventoried_store().await;
    let vm = store
        .record_registration("VM-1", "[DS-1] VM-1/VM-1.vmx")
        .await
        .unwrap();
    assert_eq!(vm.status, VmStatus::Registered);
    assert_eq!(vm.nic1, NOT_CONNECTED);

    let assignment = NicAssignment {
        vm_name: "VM-1".to_string(),
        nic1: "PG-APP".to_string(),
        nic2: NOT_CONNECTED.to_string(),
    };
    assert!(store.set_nic_assignment(&assignment).await.unwrap());

    // Registering again must not wipe the chosen port groups.
    let again = store
        .record_registration("VM-1", "[DS-1] VM-1/VM-1.vmx")
        .await
        .unwrap();
    assert_eq!(again.nic1, "PG-APP");
    assert_eq!(store.list_registered().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_updates_on_unknown_vm_report_no_match() {
    let store = Store::open_in_memory().await.unwrap();
    let assignment = NicAssignment {
        vm_name: "ghost".to_string(),
        nic1: "PG-APP".to_string(),
        nic2: "PG-DB".to_string(),
    };
    assert!(!store.set_nic_assignment(&assignment).await.unwrap());
    assert!(!store.set_vm_status("ghost", VmStatus::PoweredOn).await.unwrap());
}

#[tokio::test]
async fn test_vm_status_and_last_configured() {
    let store = inventoried_store().await;
    store
        .record_registration("VM-2", "[DS-1] VM-2/VM-2.vmx")
        .await
        .unwrap();
    assert!(store.set_vm_status("VM-2", VmStatus::PoweredOn).await.unwrap());
    assert_eq!(
        store.get_registered("VM-2").await.unwrap().unwrap().status,
        VmStatus::PoweredOn
    );

    let applied = NicAssignment {
        vm_name: "VM-2".to_string(),
        nic1: "PG-WEB".to_string(),
        nic2: "PG-DB".to_string(),
    };
    store.record_nics_applied(&applied).await.unwrap();
    store.record_nics_applied(&applied).await.unwrap();
    assert_eq!(store.list_last_configured().await.unwrap(), vec![applied]);
}

#[tokio::test]
async fn test_remove_vm_resets_file_and_drops_rows() {
    let store = inventoried_store().await;
    store
        .record_registration("VM-1", "[DS-1] VM-1/VM-1.vmx")
        .await
        .unwrap();
    store
        .record_nics_applied(&NicAssignment {
            vm_name: "VM-1".to_string(),
            nic1: "PG-APP".to_string(),
            nic2: NOT_CONNECTED.to_string(),
        })
        .await
        .unwrap();

    let removed = store.remove_vm_records("VM-1").await.unwrap();
    assert_eq!(removed.vmx_path.as_deref(), Some("[DS-1] VM-1/VM-1.vmx"));
    assert_eq!(removed.registered_rows, 1);
    assert_eq!(removed.nic_rows, 1);

    let f = store
        .get_vmx_file("[DS-1] VM-1/VM-1.vmx")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(f.status, RegistrationStatus::Unregistered);
    assert!(store.get_registered("VM-1").await.unwrap().is_none());
    assert!(store.list_last_configured().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_remove_vm_falls_back_to_file_name() {
    let store = inventoried_store().await;
    store
        .record_registration("VM-2", "[DS-1] VM-2/VM-2.vmx")
        .await
        .unwrap();
    // VM row lost, file still marked registered.
    sqlx::query("DELETE FROM registered_vms")
        .execute(&store.pool)
        .await
        .unwrap();

    let removed = store.remove_vm_records("VM-2").await.unwrap();
    assert_eq!(removed.vmx_path.as_deref(), Some("[DS-1] VM-2/VM-2.vmx"));
    assert_eq!(removed.registered_rows, 0);
    let f = store
        .get_vmx_file("[DS-1] VM-2/VM-2.vmx")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(f.status, RegistrationStatus::Unregistered);
}

#[tokio::test]
async fn test_remove_unknown_vm_is_noop() {
    let store = Store::open_in_memory().await.unwrap();
    let removed = store.remove_vm_records("nothing").await.unwrap();
    assert_eq!(removed.vmx_path, None);
    assert_eq!(removed.registered_rows, 0);
}

#[tokio::test]
async fn test_hosts_upsert() {
    let store = Store::open_in_memory().await.unwrap();
    let mut host = VmHost {
        name: "esx01".to_string(),
        connection_state: "Connected".to_string(),
        cpu: 32,
        memory_gb: 256.0,
    };
    store.upsert_host(&host).await.unwrap();
    host.connection_state = "Maintenance".to_string();
    store.upsert_host(&host).await.unwrap();
    assert_eq!(store.list_hosts().await.unwrap(), vec![host]);
}

#[tokio::test]
async fn test_cluster_inventory_upserts_by_name() {
    let store = Store::open_in_memory().await.unwrap();
    let mut ds = ClusterDatastore {
        name: "VOL-A".to_string(),
        capacity_gb: 1024.0,
        used_gb: 100.5,
    };
    store.upsert_cluster_datastore(&ds).await.unwrap();
    ds.used_gb = 200.0;
    store.upsert_cluster_datastore(&ds).await.unwrap();
    assert_eq!(store.list_cluster_datastores().await.unwrap(), vec![ds]);

    let mut vm = ClusterVm {
        name: "VM-1".to_string(),
        power_state: "PoweredOff".to_string(),
        cpu: 2,
        memory_gb: 8.0,
    };
    store.upsert_cluster_vm(&vm).await.unwrap();
    vm.power_state = "PoweredOn".to_string();
    store.upsert_cluster_vm(&vm).await.unwrap();
    assert_eq!(store.list_cluster_vms().await.unwrap(), vec![vm]);
}

#[tokio::test]
async fn test_protection_groups_are_namespaced() {
    let store = Store::open_in_memory().await.unwrap();
    let (pg, created) = store.add_protection_group("", "pg-prod").await.unwrap();
    assert!(created);
    let (same, created) = store.add_protection_group("", "pg-prod").await.unwrap();
    assert!(!created);
    assert_eq!(same.id, pg.id);

    store.add_protection_group("dr", "pg-prod").await.unwrap();
    assert_eq!(store.list_protection_groups("").await.unwrap().len(), 1);
    assert_eq!(store.list_protection_groups("dr").await.unwrap().len(), 1);

    // Deleting under the wrong namespace must not touch the row.
    assert!(!store.delete_protection_group("dr", pg.id).await.unwrap());
    assert!(store.delete_protection_group("", pg.id).await.unwrap());
    assert!(store.list_protection_groups("").await.unwrap().is_empty());
}
