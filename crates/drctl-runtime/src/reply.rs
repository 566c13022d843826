//! Record shapes emitted by the PowerCLI scripts in [`crate::script`].

use serde::{Deserialize, Serialize};

use drctl_core::model::{CheckStatus, DatastoreStatus};
use drctl_core::naming;

use crate::extract::OneOrMany;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRecord {
    pub name: String,
    pub connection_state: String,
    pub cpu: i64,
    pub memory_gb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RescanRecord {
    pub host: String,
    pub rescanned: bool,
}

/// What the host reports about one presented volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LunFacts {
    pub volume_name: String,
    pub canonical: String,
    /// Set when a datastore with the volume's name is already mounted.
    #[serde(default)]
    pub datastore_name: Option<String>,
    /// Device paths of every unresolved VMFS extent on the host.
    #[serde(default)]
    pub extent_paths: OneOrMany<String>,
}

impl LunFacts {
    /// Classify the volume: a mounted datastore short-circuits to
    /// `Presented`; otherwise the volume needs resignature exactly when its
    /// device path (or a partition of it, `path:N`) is among the unresolved
    /// extents. Device names are compared case-insensitively.
    pub fn classify(&self) -> CheckStatus {
        if self.datastore_name.is_some() {
            return CheckStatus::Presented;
        }
        let target = naming::device_path(&self.canonical);
        let unresolved = self
            .extent_paths
            .0
            .iter()
            .any(|path| {
                let path = path.to_ascii_lowercase();
                path.strip_prefix(&target)
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with(':'))
            });
        if unresolved {
            CheckStatus::NeedsResignature
        } else {
            CheckStatus::NoResignatureNeeded
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResignatureReply {
    pub canonical: String,
    #[serde(default)]
    pub datastore_name: Option<String>,
    pub status: DatastoreStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmxListing {
    pub file_name: String,
    pub vmx_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderListing {
    pub folder: String,
    #[serde(default)]
    pub vmx_files: OneOrMany<VmxListing>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatastoreListing {
    pub datastore_name: String,
    #[serde(default)]
    pub folders: OneOrMany<FolderListing>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterReply {
    pub vm_name: String,
    pub vmx_path: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NicReply {
    pub vm_name: String,
    #[serde(default)]
    pub nic1: Option<String>,
    #[serde(default)]
    pub nic2: Option<String>,
}

/// Reply of the power and removal scripts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmReply {
    pub vm_name: String,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::extract_one;

    fn facts(datastore: Option<&str>, extents: &[&str]) -> LunFacts {
        LunFacts {
            volume_name: "VOL-A".to_string(),
            canonical: "naa.624a93701234".to_string(),
            datastore_name: datastore.map(str::to_string),
            extent_paths: OneOrMany(extents.iter().map(|s| s.to_string()).collect()),
        }
    }

    #[test]
    fn test_unresolved_extent_needs_resignature() {
        let f = facts(None, &["/vmfs/devices/disks/naa.624a93701234"]);
        assert_eq!(f.classify(), CheckStatus::NeedsResignature);
    }

    #[test]
    fn test_extent_match_ignores_case() {
        let f = LunFacts {
            canonical: "naa.624a9370ABCD".to_string(),
            ..facts(None, &["/vmfs/devices/disks/NAA.624A9370ABCD:1"])
        };
        assert_eq!(f.classify(), CheckStatus::NeedsResignature);
    }

    #[test]
    fn test_absent_extent_needs_nothing() {
        let f = facts(None, &["/vmfs/devices/disks/naa.624a93709999"]);
        assert_eq!(f.classify(), CheckStatus::NoResignatureNeeded);
        assert_eq!(facts(None, &[]).classify(), CheckStatus::NoResignatureNeeded);
        // a longer serial sharing the prefix is a different device
        let f = facts(None, &["/vmfs/devices/disks/naa.624a9370123456"]);
        assert_eq!(f.classify(), CheckStatus::NoResignatureNeeded);
    }

    #[test]
    fn test_mounted_datastore_short_circuits() {
        let f = facts(Some("VOL-A"), &["/vmfs/devices/disks/naa.624a93701234"]);
        assert_eq!(f.classify(), CheckStatus::Presented);
    }

    #[test]
    fn test_lun_facts_with_single_extent_string() {
        let stdout = "checking naa.624a93701234: 1 unresolved extents\n\
            {\"volume_name\":\"VOL-A\",\"canonical\":\"naa.624a93701234\",\"datastore_name\":null,\
            \"extent_paths\":\"/vmfs/devices/disks/naa.624a93701234\"}";
        let f: LunFacts = extract_one("lun_check", stdout).unwrap();
        assert_eq!(f.extent_paths.0.len(), 1);
        assert_eq!(f.classify(), CheckStatus::NeedsResignature);
    }

    #[test]
    fn test_datastore_listing_with_collapsed_arrays() {
        let stdout = r#"{"datastore_name":"VOL-A","folders":{"folder":"VM-1","vmx_files":{"file_name":"VM-1.vmx","vmx_path":"[VOL-A] VM-1/VM-1.vmx"}}}"#;
        let listing: DatastoreListing = extract_one("datastore_inventory", stdout).unwrap();
        let folders = listing.folders.into_vec();
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].vmx_files.0[0].vmx_path, "[VOL-A] VM-1/VM-1.vmx");
    }
}
