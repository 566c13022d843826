use serde::{Deserialize, Serialize};

use crate::error::{DrError, Result};

/// Defines a status enum stored as a fixed string in the state store.
macro_rules! stored_status {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($(#[$vmeta])* #[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = DrError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(DrError::invalid(format!(
                        "unknown {} {:?}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

stored_status! {
    /// Array-side state of a restored volume, refreshed on reload.
    pub enum VolumeStatus {
        Connected => "connected",
        Disconnected => "disconnected",
        MissingOrDeleted => "missing_or_deleted",
    }
}

stored_status! {
    /// Outcome of LUN-resolution validation for one presented volume.
    pub enum CheckStatus {
        /// Already visible to the host as a named datastore.
        Presented => "presented",
        /// Device is among the host's unresolved VMFS extents.
        NeedsResignature => "needs_resignature",
        /// Device is not an unresolved extent.
        NoResignatureNeeded => "no_resignature_needed",
    }
}

stored_status! {
    /// Outcome of a resignature attempt.
    pub enum DatastoreStatus {
        Presented => "presented",
        NotPresented => "not_presented",
    }
}

stored_status! {
    pub enum RegistrationStatus {
        Unregistered => "unregistered",
        Registered => "registered",
    }
}

stored_status! {
    /// Last known state of a registered VM as written by drctl.
    pub enum VmStatus {
        Registered => "registered",
        PoweredOn => "powered_on",
        PoweredOff => "powered_off",
    }
}

/// NIC assignment placeholder for adapters with no port group yet.
pub const NOT_CONNECTED: &str = "not connected";

/// A volume created on the array from a snapshot and connected to the host group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoredVolume {
    pub volume_name: String,
    pub snapshot_name: String,
    /// Globally unique on the array.
    pub serial: String,
    pub lun: i64,
    pub status: VolumeStatus,
}

/// A volume reported visible to the compute host, pending validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentedVolume {
    pub volume_name: String,
    pub serial: String,
    pub lun: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckedVolume {
    pub volume_name: String,
    pub canonical: String,
    pub status: CheckStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentedDatastore {
    pub datastore_name: String,
    pub canonical: String,
    pub status: DatastoreStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatastoreFolder {
    pub datastore_name: String,
    /// `[datastore] folder`, unique across datastores.
    pub folder_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmxFile {
    pub datastore_name: String,
    pub folder_path: String,
    pub file_name: String,
    /// Datastore path of the `.vmx`, the VM's identity across stages.
    pub vmx_path: String,
    pub status: RegistrationStatus,
}

/// Folder with its definition files, as returned by the inventory view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderInventory {
    pub folder_path: String,
    pub vmx_files: Vec<VmxFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatastoreInventory {
    pub datastore: PresentedDatastore,
    pub folders: Vec<FolderInventory>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredVm {
    pub vm_name: String,
    pub vmx_path: String,
    pub status: VmStatus,
    pub nic1: String,
    pub nic2: String,
}

/// Desired port-group assignment for a VM's two adapters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicAssignment {
    pub vm_name: String,
    pub nic1: String,
    pub nic2: String,
}

impl NicAssignment {
    /// True when neither adapter has a port group to move to.
    pub fn is_unassigned(&self) -> bool {
        self.nic1 == NOT_CONNECTED && self.nic2 == NOT_CONNECTED
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmHost {
    pub name: String,
    pub connection_state: String,
    pub cpu: i64,
    pub memory_gb: f64,
}

/// A datastore as vCenter reports it, mounted or not by drctl.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterDatastore {
    pub name: String,
    pub capacity_gb: f64,
    pub used_gb: f64,
}

/// A VM as vCenter reports it, registered by drctl or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterVm {
    pub name: String,
    pub power_state: String,
    pub cpu: i64,
    pub memory_gb: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionGroup {
    pub id: i64,
    pub name: String,
}
