//! Command builder: renders one PowerCLI script per remote operation.
//!
//! Every script is a fixed template. Caller-supplied values never reach the
//! script body as text; the operation's parameters are serialized to a
//! single JSON document, base64-encoded, and decoded inside the script with
//! `ConvertFrom-Json`. The only rendered substitutions are that payload and
//! the operation's static name, so rendering is a pure function of the
//! operation and cannot inject script code.

use std::sync::LazyLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use drctl_core::naming::{
    self, CANONICAL_PREFIX, validate_display_name, validate_vmx_path,
};
use drctl_core::{DrError, Result};

/// Env vars the connect preamble reads vCenter credentials from.
pub const ENV_VI_SERVER: &str = "DRCTL_VI_SERVER";
pub const ENV_VI_USER: &str = "DRCTL_VI_USER";
pub const ENV_VI_PASSWORD: &str = "DRCTL_VI_PASSWORD";

/// A remote vSphere operation with its typed parameters.
///
/// Serialized as `{"operation": "<name>", "params": {...}}`, which is also
/// the input format of `drctl script`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "params", rename_all = "snake_case")]
pub enum Operation {
    /// List the hosts of a cluster.
    HostInventory { cluster: String },
    /// Rescan every HBA and VMFS volume on a cluster's hosts.
    RescanStorage { cluster: String },
    /// List the datastores mounted in a cluster, with capacity and usage.
    DatastoreList { cluster: String },
    /// List the VMs of a cluster with power state and sizing.
    VmList { cluster: String },
    /// Report whether a volume is mounted and which device paths the host
    /// holds as unresolved VMFS extents.
    LunCheck {
        esx_host: String,
        volume_name: String,
        canonical: String,
    },
    /// Resignature the unresolved volume backed by `device_path` and rename
    /// the new datastore to `volume_name`.
    Resignature {
        esx_host: String,
        volume_name: String,
        canonical: String,
        device_path: String,
    },
    /// List a datastore's VM folders and their `.vmx` files.
    DatastoreInventory {
        vcenter_server: String,
        datacenter: String,
        datastore: String,
        system_folders: Vec<String>,
    },
    RegisterVm { esx_host: String, vmx_path: String },
    /// Move adapters 1 and 2 onto the given port groups. `None` leaves the
    /// adapter untouched.
    ReconfigureNics {
        vm_name: String,
        nic1: Option<String>,
        nic2: Option<String>,
    },
    PowerOn { vm_name: String },
    PowerOff { vm_name: String },
    RemoveVm { vm_name: String },
}

impl Operation {
    /// Stable snake_case name, also the template name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::HostInventory { .. } => "host_inventory",
            Self::RescanStorage { .. } => "rescan_storage",
            Self::DatastoreList { .. } => "datastore_list",
            Self::VmList { .. } => "vm_list",
            Self::LunCheck { .. } => "lun_check",
            Self::Resignature { .. } => "resignature",
            Self::DatastoreInventory { .. } => "datastore_inventory",
            Self::RegisterVm { .. } => "register_vm",
            Self::ReconfigureNics { .. } => "reconfigure_nics",
            Self::PowerOn { .. } => "power_on",
            Self::PowerOff { .. } => "power_off",
            Self::RemoveVm { .. } => "remove_vm",
        }
    }

    /// Reject parameters no remote call should ever see.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::HostInventory { cluster }
            | Self::RescanStorage { cluster }
            | Self::DatastoreList { cluster }
            | Self::VmList { cluster } => {
                validate_display_name(cluster, "Cluster")
            }
            Self::LunCheck {
                esx_host,
                volume_name,
                canonical,
            } => {
                validate_display_name(esx_host, "ESXi host")?;
                validate_display_name(volume_name, "Volume")?;
                validate_canonical(canonical)
            }
            Self::Resignature {
                esx_host,
                volume_name,
                canonical,
                device_path,
            } => {
                validate_display_name(esx_host, "ESXi host")?;
                validate_display_name(volume_name, "Volume")?;
                validate_canonical(canonical)?;
                if *device_path != naming::device_path(canonical) {
                    return Err(DrError::invalid(format!(
                        "device path {:?} does not belong to {}",
                        device_path, canonical
                    )));
                }
                Ok(())
            }
            Self::DatastoreInventory {
                vcenter_server,
                datacenter,
                datastore,
                ..
            } => {
                validate_display_name(vcenter_server, "vCenter server")?;
                validate_display_name(datacenter, "Datacenter")?;
                validate_display_name(datastore, "Datastore")
            }
            Self::RegisterVm { esx_host, vmx_path } => {
                validate_display_name(esx_host, "ESXi host")?;
                validate_vmx_path(vmx_path)
            }
            Self::ReconfigureNics {
                vm_name,
                nic1,
                nic2,
            } => {
                validate_display_name(vm_name, "VM")?;
                for network in [nic1, nic2].into_iter().flatten() {
                    validate_display_name(network, "Port group")?;
                }
                Ok(())
            }
            Self::PowerOn { vm_name } | Self::PowerOff { vm_name } | Self::RemoveVm { vm_name } => {
                validate_display_name(vm_name, "VM")
            }
        }
    }

    /// The `params` half of the serialized operation.
    pub fn params(&self) -> Result<Value> {
        let mut tagged = serde_json::to_value(self).map_err(|e| {
            DrError::invalid(format!("unserializable {} params: {}", self.name(), e))
        })?;
        Ok(tagged
            .get_mut("params")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }
}

fn validate_canonical(canonical: &str) -> Result<()> {
    match naming::serial_from_canonical(canonical) {
        Some(serial) => naming::validate_serial(serial),
        None => Err(DrError::invalid(format!(
            "canonical name must start with {}: {:?}",
            CANONICAL_PREFIX, canonical
        ))),
    }
}

/// A rendered script, ready for a [`crate::shell::ScriptRunner`].
#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    pub operation: &'static str,
    /// Parameters as embedded in the payload; script runners and the mock
    /// shell key on these.
    pub params: Value,
    pub text: String,
}

impl Script {
    /// String parameter by name, for logging and test matching.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// Render the script for `op`. Pure: equal operations give equal text.
pub fn build_script(op: &Operation) -> Result<Script> {
    op.validate()?;
    let params = op.params()?;
    let json = serde_json::to_string(&params)
        .map_err(|e| DrError::invalid(format!("unserializable {} params: {}", op.name(), e)))?;

    let tera = TEMPLATES
        .as_ref()
        .map_err(|e| DrError::invalid(format!("script templates failed to load: {}", e)))?;

    let mut ctx = tera::Context::new();
    ctx.insert("operation", op.name());
    ctx.insert("payload", &STANDARD.encode(json.as_bytes()));

    let text = tera
        .render(&template_name(op.name()), &ctx)
        .map_err(|e| DrError::invalid(format!("failed to render {} script: {}", op.name(), e)))?;

    Ok(Script {
        operation: op.name(),
        params,
        text,
    })
}

fn template_name(operation: &str) -> String {
    format!("{}.ps1", operation)
}

static TEMPLATES: LazyLock<std::result::Result<tera::Tera, String>> = LazyLock::new(|| {
    let mut tera = tera::Tera::default();
    let mut sources = vec![("frame.ps1".to_string(), FRAME)];
    sources.extend(BODIES.iter().map(|(name, body)| (template_name(name), *body)));
    tera.add_raw_templates(sources).map_err(|e| e.to_string())?;
    Ok(tera)
});

/// Decode the payload, connect with env-supplied credentials, run the
/// body, and always disconnect.
const FRAME: &str = r#"# drctl: {{ operation }}
$ErrorActionPreference = 'Stop'
$ProgressPreference = 'SilentlyContinue'
$p = [System.Text.Encoding]::UTF8.GetString([System.Convert]::FromBase64String('{{ payload }}')) | ConvertFrom-Json
Import-Module VMware.VimAutomation.Core -ErrorAction Stop | Out-Null
Set-PowerCLIConfiguration -Scope Session -InvalidCertificateAction Ignore -ParticipateInCEIP $false -Confirm:$false | Out-Null
$secret = ConvertTo-SecureString -String $env:DRCTL_VI_PASSWORD -AsPlainText -Force
$credential = New-Object System.Management.Automation.PSCredential($env:DRCTL_VI_USER, $secret)
$vi = Connect-VIServer -Server $env:DRCTL_VI_SERVER -Credential $credential
Write-Host "connected to $($vi.Name)"
try {
{% block body %}{% endblock body %}
} finally {
    Disconnect-VIServer -Server $vi -Confirm:$false -ErrorAction SilentlyContinue | Out-Null
}
"#;

const BODIES: &[(&str, &str)] = &[
    ("host_inventory", HOST_INVENTORY),
    ("rescan_storage", RESCAN_STORAGE),
    ("datastore_list", DATASTORE_LIST),
    ("vm_list", VM_LIST),
    ("lun_check", LUN_CHECK),
    ("resignature", RESIGNATURE),
    ("datastore_inventory", DATASTORE_INVENTORY),
    ("register_vm", REGISTER_VM),
    ("reconfigure_nics", RECONFIGURE_NICS),
    ("power_on", POWER_ON),
    ("power_off", POWER_OFF),
    ("remove_vm", REMOVE_VM),
];

const HOST_INVENTORY: &str = r#"{% extends "frame.ps1" %}{% block body %}
$hosts = @(Get-Cluster -Name $p.cluster | Get-VMHost | Sort-Object Name | ForEach-Object {
    [pscustomobject]@{
        name = $_.Name
        connection_state = "$($_.ConnectionState)"
        cpu = $_.NumCpu
        memory_gb = [math]::Round($_.MemoryTotalGB, 2)
    }
})
Write-Host "hosts in $($p.cluster): $($hosts.Count)"
if ($hosts.Count -gt 0) { ConvertTo-Json -InputObject $hosts -Depth 3 -Compress }
{% endblock body %}"#;

const DATASTORE_LIST: &str = r#"{% extends "frame.ps1" %}{% block body %}
$stores = @(Get-Cluster -Name $p.cluster | Get-Datastore | Sort-Object Name -Unique | ForEach-Object {
    [pscustomobject]@{
        name = $_.Name
        capacity_gb = [math]::Round($_.CapacityGB, 2)
        used_gb = [math]::Round($_.CapacityGB - $_.FreeSpaceGB, 2)
    }
})
Write-Host "datastores in $($p.cluster): $($stores.Count)"
if ($stores.Count -gt 0) { ConvertTo-Json -InputObject $stores -Depth 3 -Compress }
{% endblock body %}"#;

const VM_LIST: &str = r#"{% extends "frame.ps1" %}{% block body %}
$vms = @(Get-Cluster -Name $p.cluster | Get-VM | Sort-Object Name | ForEach-Object {
    [pscustomobject]@{
        name = $_.Name
        power_state = "$($_.PowerState)"
        cpu = $_.NumCpu
        memory_gb = [math]::Round($_.MemoryGB, 2)
    }
})
Write-Host "vms in $($p.cluster): $($vms.Count)"
if ($vms.Count -gt 0) { ConvertTo-Json -InputObject $vms -Depth 3 -Compress }
{% endblock body %}"#;

const RESCAN_STORAGE: &str = r#"{% extends "frame.ps1" %}{% block body %}
$hosts = @(Get-Cluster -Name $p.cluster | Get-VMHost)
Get-VMHostStorage -VMHost $hosts -RescanAllHba -RescanVmfs | Out-Null
$done = @($hosts | ForEach-Object { [pscustomobject]@{ host = $_.Name; rescanned = $true } })
Write-Host "rescanned $($done.Count) hosts"
ConvertTo-Json -InputObject $done -Depth 3 -Compress
{% endblock body %}"#;

const LUN_CHECK: &str = r#"{% extends "frame.ps1" %}{% block body %}
$esx = Get-VMHost -Name $p.esx_host
$dsSystem = Get-View $esx.ExtensionData.ConfigManager.DatastoreSystem
$existing = Get-Datastore -Name $p.volume_name -ErrorAction SilentlyContinue | Select-Object -First 1
$paths = @($dsSystem.QueryUnresolvedVmfsVolumes() | ForEach-Object { $_.Extent } | ForEach-Object { $_.DevicePath })
Write-Host "checking $($p.canonical): $($paths.Count) unresolved extents"
$facts = [pscustomobject]@{
    volume_name = $p.volume_name
    canonical = $p.canonical
    datastore_name = $(if ($existing) { $existing.Name } else { $null })
    extent_paths = $paths
}
ConvertTo-Json -InputObject $facts -Depth 3 -Compress
{% endblock body %}"#;

const RESIGNATURE: &str = r#"{% extends "frame.ps1" %}{% block body %}
$esx = Get-VMHost -Name $p.esx_host
$dsSystem = Get-View $esx.ExtensionData.ConfigManager.DatastoreSystem
$status = 'not_presented'
$name = $null
foreach ($unresolved in $dsSystem.QueryUnresolvedVmfsVolumes()) {
    $extentPaths = @($unresolved.Extent | ForEach-Object { $_.DevicePath })
    $pattern = '^' + [regex]::Escape($p.device_path) + '(:\d+)?$'
    if (@($extentPaths -match $pattern).Count -gt 0) {
        Write-Host "resignaturing $($p.canonical)"
        $spec = New-Object VMware.Vim.HostUnresolvedVmfsResignatureSpec
        $spec.ExtentDevicePath = $extentPaths
        $result = $dsSystem.ResignatureUnresolvedVmfsVolume($spec)
        $datastore = Get-Datastore -Id $result.Result
        $name = (Set-Datastore -Datastore $datastore -Name $p.volume_name).Name
        $status = 'presented'
        break
    }
}
$reply = [pscustomobject]@{ canonical = $p.canonical; datastore_name = $name; status = $status }
ConvertTo-Json -InputObject $reply -Depth 3 -Compress
{% endblock body %}"#;

const DATASTORE_INVENTORY: &str = r#"{% extends "frame.ps1" %}{% block body %}
$root = "vmstores:\$($p.vcenter_server)@443\$($p.datacenter)\$($p.datastore)"
$folders = @(Get-ChildItem -Path "$root\" | Where-Object { $_.PSIsContainer -and $_.Name -notin $p.system_folders } | Select-Object -ExpandProperty Name)
$entries = @(foreach ($folder in $folders) {
    $files = @(Get-ChildItem -Path "$root\$folder\" -Filter '*.vmx' | ForEach-Object {
        [pscustomobject]@{ file_name = $_.Name; vmx_path = $_.DatastoreFullPath }
    })
    [pscustomobject]@{ folder = $folder; vmx_files = $files }
})
Write-Host "$($p.datastore): $($entries.Count) folders"
$listing = [pscustomobject]@{ datastore_name = $p.datastore; folders = $entries }
ConvertTo-Json -InputObject $listing -Depth 5 -Compress
{% endblock body %}"#;

const REGISTER_VM: &str = r#"{% extends "frame.ps1" %}{% block body %}
$esx = Get-VMHost -Name $p.esx_host
$vm = New-VM -VMFilePath $p.vmx_path -VMHost $esx
Write-Host "registered $($vm.Name) from $($p.vmx_path)"
$reply = [pscustomobject]@{ vm_name = $vm.Name; vmx_path = $p.vmx_path; status = 'registered' }
ConvertTo-Json -InputObject $reply -Depth 3 -Compress
{% endblock body %}"#;

const RECONFIGURE_NICS: &str = r#"{% extends "frame.ps1" %}{% block body %}
$vm = Get-VM -Name $p.vm_name
$adapters = [ordered]@{ nic1 = 'Network adapter 1'; nic2 = 'Network adapter 2' }
$applied = [ordered]@{ vm_name = $vm.Name; nic1 = $null; nic2 = $null }
foreach ($key in $adapters.Keys) {
    $network = $p.$key
    if ($network) {
        Get-NetworkAdapter -VM $vm -Name $adapters[$key] | Set-NetworkAdapter -NetworkName $network -Confirm:$false | Out-Null
        Write-Host "$($vm.Name) $($adapters[$key]) -> $network"
        $applied[$key] = $network
    }
}
ConvertTo-Json -InputObject ([pscustomobject]$applied) -Depth 3 -Compress
{% endblock body %}"#;

const POWER_ON: &str = r#"{% extends "frame.ps1" %}{% block body %}
$vm = Get-VM -Name $p.vm_name
if ($vm.PowerState -ne 'PoweredOn') {
    Start-VM -VM $vm -RunAsync -Confirm:$false | Out-Null
    Start-Sleep -Seconds 2
    Get-VMQuestion -VM $vm -ErrorAction SilentlyContinue | Set-VMQuestion -Option 'button.uuid.movedTheVM' -Confirm:$false | Out-Null
}
Write-Host "$($vm.Name) power on requested"
$reply = [pscustomobject]@{ vm_name = $vm.Name; status = 'powered_on' }
ConvertTo-Json -InputObject $reply -Depth 3 -Compress
{% endblock body %}"#;

const POWER_OFF: &str = r#"{% extends "frame.ps1" %}{% block body %}
$vm = Get-VM -Name $p.vm_name
if ($vm.PowerState -eq 'PoweredOn') {
    Shutdown-VMGuest -VM $vm -Confirm:$false | Out-Null
}
Write-Host "$($vm.Name) guest shutdown requested"
$reply = [pscustomobject]@{ vm_name = $vm.Name; status = 'powered_off' }
ConvertTo-Json -InputObject $reply -Depth 3 -Compress
{% endblock body %}"#;

const REMOVE_VM: &str = r#"{% extends "frame.ps1" %}{% block body %}
$vm = Get-VM -Name $p.vm_name
Remove-VM -VM $vm -Confirm:$false
Write-Host "$($vm.Name) removed from inventory"
$reply = [pscustomobject]@{ vm_name = $vm.Name; status = 'unregistered' }
ConvertTo-Json -InputObject $reply -Depth 3 -Compress
{% endblock body %}"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_payload(text: &str) -> Value {
        let start = text.find("FromBase64String('").unwrap() + "FromBase64String('".len();
        let end = start + text[start..].find('\'').unwrap();
        let raw = STANDARD.decode(&text[start..end]).unwrap();
        serde_json::from_slice(&raw).unwrap()
    }

    fn lun_check() -> Operation {
        Operation::LunCheck {
            esx_host: "esx01.example.net".to_string(),
            volume_name: "VOL-A".to_string(),
            canonical: "naa.624a93701234".to_string(),
        }
    }

    #[test]
    fn test_every_operation_has_a_template() {
        let tera = TEMPLATES.as_ref().unwrap();
        for (name, _) in BODIES {
            assert!(
                tera.get_template_names().any(|t| t == template_name(name)),
                "missing template for {}",
                name
            );
        }
    }

    #[test]
    fn test_build_is_pure() {
        let a = build_script(&lun_check()).unwrap();
        let b = build_script(&lun_check()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.operation, "lun_check");
    }

    #[test]
    fn test_payload_round_trips_params() {
        let script = build_script(&lun_check()).unwrap();
        let payload = decode_payload(&script.text);
        assert_eq!(payload, script.params);
        assert_eq!(payload["canonical"], "naa.624a93701234");
        assert_eq!(script.param("volume_name"), Some("VOL-A"));
    }

    #[test]
    fn test_caller_strings_never_reach_script_text() {
        let op = Operation::ReconfigureNics {
            vm_name: "VM-1'; Remove-VM * ; '".to_string(),
            nic1: Some("PG \"APP\" $(whoami)".to_string()),
            nic2: None,
        };
        let script = build_script(&op).unwrap();
        assert!(!script.text.contains("Remove-VM *"));
        assert!(!script.text.contains("whoami"));
        assert_eq!(decode_payload(&script.text)["vm_name"], "VM-1'; Remove-VM * ; '");
    }

    #[test]
    fn test_credentials_come_from_env_only() {
        let script = build_script(&Operation::PowerOn {
            vm_name: "VM-1".to_string(),
        })
        .unwrap();
        assert!(script.text.contains("$env:DRCTL_VI_PASSWORD"));
        assert!(script.text.contains("$env:DRCTL_VI_SERVER"));
        assert!(script.text.contains("Disconnect-VIServer"));
        assert!(script.text.contains("Start-VM"));
        assert!(!script.text.contains("{%"));
    }

    #[test]
    fn test_bodies_match_operations() {
        let cases = [
            (
                Operation::RescanStorage {
                    cluster: "CL-DR-01".to_string(),
                },
                "-RescanAllHba -RescanVmfs",
            ),
            (
                Operation::DatastoreList {
                    cluster: "CL-DR-01".to_string(),
                },
                "Get-Datastore",
            ),
            (
                Operation::VmList {
                    cluster: "CL-DR-01".to_string(),
                },
                "Get-VM |",
            ),
            (
                Operation::RegisterVm {
                    esx_host: "esx01".to_string(),
                    vmx_path: "[VOL-A] VM-1/VM-1.vmx".to_string(),
                },
                "New-VM -VMFilePath",
            ),
            (
                Operation::RemoveVm {
                    vm_name: "VM-1".to_string(),
                },
                "Remove-VM -VM $vm",
            ),
            (
                Operation::PowerOff {
                    vm_name: "VM-1".to_string(),
                },
                "Shutdown-VMGuest",
            ),
        ];
        for (op, needle) in cases {
            let script = build_script(&op).unwrap();
            assert!(script.text.contains(needle), "{} lacks {}", op.name(), needle);
        }
    }

    #[test]
    fn test_invalid_params_rejected_before_render() {
        let bad_canonical = Operation::LunCheck {
            esx_host: "esx01".to_string(),
            volume_name: "VOL-A".to_string(),
            canonical: "naa.600508b1001c".to_string(),
        };
        assert!(build_script(&bad_canonical).is_err());

        let wrong_device = Operation::Resignature {
            esx_host: "esx01".to_string(),
            volume_name: "VOL-A".to_string(),
            canonical: "naa.624a93701234".to_string(),
            device_path: "/vmfs/devices/disks/naa.624a93709999".to_string(),
        };
        assert!(build_script(&wrong_device).is_err());

        let bad_vmx = Operation::RegisterVm {
            esx_host: "esx01".to_string(),
            vmx_path: "VM-1.vmx".to_string(),
        };
        assert!(build_script(&bad_vmx).is_err());
    }

    #[test]
    fn test_operation_parses_from_tagged_json() {
        let op: Operation = serde_json::from_value(serde_json::json!({
            "operation": "power_on",
            "params": { "vm_name": "VM-1" }
        }))
        .unwrap();
        assert_eq!(
            op,
            Operation::PowerOn {
                vm_name: "VM-1".to_string()
            }
        );
    }
}
