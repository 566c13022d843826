//! Test mock for [`ScriptRunner`].
//!
//! [`MockShell`] answers scripts with a handler keyed on the operation and
//! its parameters. [`mock_vsphere`] builds one backed by an in-memory
//! vSphere inventory (hosts, unresolved extents, datastores, VMs) that the
//! scripts mutate the way the real ones would.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use drctl_core::Result;
use drctl_core::naming;

use crate::script::Script;
use crate::shell::{ScriptOutput, ScriptRunner};

/// Mock response for a script.
#[derive(Debug, Clone, Default)]
pub struct MockResponse {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Sleep before answering, to exercise timeouts and concurrency.
    pub delay: Option<Duration>,
}

impl MockResponse {
    pub fn ok(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            ..Self::default()
        }
    }

    pub fn empty() -> Self {
        Self::ok("")
    }

    /// A log line followed by `value` as compact JSON, as PowerCLI prints it.
    pub fn json(log: &str, value: &Value) -> Self {
        Self::ok(&format!("{}\n{}\n", log, value))
    }

    pub fn fail(exit_code: i32, stderr: &str) -> Self {
        Self {
            exit_code,
            stderr: stderr.to_string(),
            ..Self::default()
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn to_output(&self) -> ScriptOutput {
        ScriptOutput {
            exit_code: self.exit_code,
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
        }
    }
}

type MockHandler = Box<dyn Fn(&Script) -> MockResponse + Send + Sync>;

/// Script runner that never spawns a process.
pub struct MockShell {
    handler: MockHandler,
    calls: Mutex<Vec<Script>>,
}

impl MockShell {
    pub fn new(handler: impl Fn(&Script) -> MockResponse + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every script run so far, in call order.
    pub fn calls(&self) -> Vec<Script> {
        lock(&self.calls).clone()
    }

    /// Number of runs of `operation`.
    pub fn count(&self, operation: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|s| s.operation == operation)
            .count()
    }
}

#[async_trait]
impl ScriptRunner for MockShell {
    async fn run(&self, script: &Script) -> Result<ScriptOutput> {
        lock(&self.calls).push(script.clone());
        let response = (self.handler)(script);
        if let Some(delay) = response.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(response.to_output())
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── In-memory vSphere ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct MockVm {
    pub vmx_path: String,
    pub powered_on: bool,
    pub nic1: Option<String>,
    pub nic2: Option<String>,
}

/// Inventory the mock scripts read and mutate.
#[derive(Debug, Default)]
pub struct VsphereState {
    pub hosts: Vec<String>,
    /// Device paths of unresolved VMFS extents.
    pub unresolved: Vec<String>,
    /// Datastore → folder → `.vmx` file names.
    pub datastores: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    pub vms: BTreeMap<String, MockVm>,
}

/// Shared reference to the in-memory inventory backing the mock.
pub type SharedVsphere = Arc<Mutex<VsphereState>>;

/// Build a mock backed by an in-memory vSphere inventory.
pub fn mock_vsphere() -> MockVsphereBuilder {
    MockVsphereBuilder {
        state: VsphereState::default(),
        failures: Vec::new(),
    }
}

pub struct MockVsphereBuilder {
    state: VsphereState,
    failures: Vec<(String, String, MockResponse)>,
}

impl MockVsphereBuilder {
    pub fn with_host(mut self, name: &str) -> Self {
        self.state.hosts.push(name.to_string());
        self
    }

    /// Make the device behind `canonical` an unresolved extent.
    pub fn with_unresolved(mut self, canonical: &str) -> Self {
        self.state.unresolved.push(naming::device_path(canonical));
        self
    }

    /// A mounted datastore, with `.vmx` files given as `folder/file.vmx`.
    pub fn with_datastore(mut self, name: &str, files: &[&str]) -> Self {
        let folders = self.state.datastores.entry(name.to_string()).or_default();
        for file in files {
            if let Some((folder, vmx)) = file.split_once('/') {
                folders
                    .entry(folder.to_string())
                    .or_default()
                    .push(vmx.to_string());
            }
        }
        for system in [".sdd.sf", ".vSphere-HA"] {
            folders.entry(system.to_string()).or_default();
        }
        self
    }

    pub fn with_vm(mut self, name: &str, vmx_path: &str) -> Self {
        self.state.vms.insert(
            name.to_string(),
            MockVm {
                vmx_path: vmx_path.to_string(),
                ..MockVm::default()
            },
        );
        self
    }

    /// Answer `operation` with `response` whenever any of its string
    /// parameters equals `key`.
    pub fn failing(mut self, operation: &str, key: &str, response: MockResponse) -> Self {
        self.failures
            .push((operation.to_string(), key.to_string(), response));
        self
    }

    /// Build the runner. Returns it with the shared inventory.
    pub fn install(self) -> (Arc<MockShell>, SharedVsphere) {
        let state = Arc::new(Mutex::new(self.state));
        let shared = state.clone();
        let failures = self.failures;

        let shell = MockShell::new(move |script: &Script| {
            let injected = failures.iter().find(|(op, key, _)| {
                op == script.operation
                    && script
                        .params
                        .as_object()
                        .is_some_and(|p| p.values().any(|v| v.as_str() == Some(key.as_str())))
            });
            if let Some((_, _, response)) = injected {
                return response.clone();
            }
            vsphere_handler(script, &mut lock(&*shared))
        });

        (Arc::new(shell), state)
    }
}

fn param<'a>(script: &'a Script, key: &str) -> &'a str {
    script.param(key).unwrap_or_default()
}

fn not_found(what: &str, name: &str) -> MockResponse {
    MockResponse::fail(1, &format!("{} with name '{}' was not found", what, name))
}

/// Play a script against the in-memory inventory.
fn vsphere_handler(script: &Script, vs: &mut VsphereState) -> MockResponse {
    match script.operation {
        "host_inventory" => {
            let hosts: Vec<Value> = vs
                .hosts
                .iter()
                .map(|h| {
                    json!({
                        "name": h,
                        "connection_state": "Connected",
                        "cpu": 32,
                        "memory_gb": 511.9,
                    })
                })
                .collect();
            if hosts.is_empty() {
                return MockResponse::ok("hosts in cluster: 0\n");
            }
            // Multi-line, as ConvertTo-Json prints without -Compress
            let pretty = serde_json::to_string_pretty(&hosts).unwrap_or_default();
            MockResponse::ok(&format!("hosts in cluster: {}\n{}\n", hosts.len(), pretty))
        }
        "datastore_list" => {
            let stores: Vec<Value> = vs
                .datastores
                .iter()
                .map(|(name, folders)| {
                    let used = 10.0 * folders.len() as f64;
                    json!({ "name": name, "capacity_gb": 1024.0, "used_gb": used })
                })
                .collect();
            if stores.is_empty() {
                return MockResponse::ok("datastores in cluster: 0\n");
            }
            MockResponse::json("datastores in cluster", &Value::Array(stores))
        }
        "vm_list" => {
            let vms: Vec<Value> = vs
                .vms
                .iter()
                .map(|(name, vm)| {
                    let state = if vm.powered_on { "PoweredOn" } else { "PoweredOff" };
                    json!({ "name": name, "power_state": state, "cpu": 2, "memory_gb": 8.0 })
                })
                .collect();
            if vms.is_empty() {
                return MockResponse::ok("vms in cluster: 0\n");
            }
            MockResponse::json("vms in cluster", &Value::Array(vms))
        }
        "rescan_storage" => {
            let done: Vec<Value> = vs
                .hosts
                .iter()
                .map(|h| json!({ "host": h, "rescanned": true }))
                .collect();
            MockResponse::json("rescanned hosts", &Value::Array(done))
        }
        "lun_check" => {
            let volume = param(script, "volume_name");
            let mounted = vs.datastores.contains_key(volume).then(|| volume.to_string());
            MockResponse::json(
                &format!("checking {}", param(script, "canonical")),
                &json!({
                    "volume_name": volume,
                    "canonical": param(script, "canonical"),
                    "datastore_name": mounted,
                    "extent_paths": vs.unresolved,
                }),
            )
        }
        "resignature" => {
            let device = param(script, "device_path");
            let volume = param(script, "volume_name");
            let canonical = param(script, "canonical");
            let reply = match vs.unresolved.iter().position(|p| p.eq_ignore_ascii_case(device)) {
                Some(i) => {
                    vs.unresolved.remove(i);
                    vs.datastores.entry(volume.to_string()).or_default();
                    json!({
                        "canonical": canonical,
                        "datastore_name": volume,
                        "status": "presented",
                    })
                }
                None => json!({
                    "canonical": canonical,
                    "datastore_name": null,
                    "status": "not_presented",
                }),
            };
            MockResponse::json("resignature pass", &reply)
        }
        "datastore_inventory" => {
            let datastore = param(script, "datastore");
            let Some(folders) = vs.datastores.get(datastore) else {
                return not_found("Datastore", datastore);
            };
            let skip: Vec<&str> = script
                .params
                .get("system_folders")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            let entries: Vec<Value> = folders
                .iter()
                .filter(|(folder, _)| !skip.contains(&folder.as_str()))
                .map(|(folder, files)| {
                    let files: Vec<Value> = files
                        .iter()
                        .map(|f| {
                            let vmx_path = format!("[{}] {}/{}", datastore, folder, f);
                            json!({ "file_name": f, "vmx_path": vmx_path })
                        })
                        .collect();
                    // PowerShell collapses one-element arrays
                    let files = if files.len() == 1 {
                        files[0].clone()
                    } else {
                        Value::Array(files)
                    };
                    json!({ "folder": folder, "vmx_files": files })
                })
                .collect();
            MockResponse::json(
                &format!("{}: {} folders", datastore, entries.len()),
                &json!({ "datastore_name": datastore, "folders": entries }),
            )
        }
        "register_vm" => {
            let vmx_path = param(script, "vmx_path");
            let Some(vm_name) = vmx_path
                .rsplit('/')
                .next()
                .and_then(|f| f.strip_suffix(".vmx"))
            else {
                return not_found("File", vmx_path);
            };
            vs.vms.insert(
                vm_name.to_string(),
                MockVm {
                    vmx_path: vmx_path.to_string(),
                    ..MockVm::default()
                },
            );
            MockResponse::json(
                &format!("registered {} from {}", vm_name, vmx_path),
                &json!({ "vm_name": vm_name, "vmx_path": vmx_path, "status": "registered" }),
            )
        }
        "reconfigure_nics" => {
            let name = param(script, "vm_name");
            let Some(vm) = vs.vms.get_mut(name) else {
                return not_found("VM", name);
            };
            let nic1 = script.param("nic1").map(str::to_string);
            let nic2 = script.param("nic2").map(str::to_string);
            if nic1.is_some() {
                vm.nic1 = nic1.clone();
            }
            if nic2.is_some() {
                vm.nic2 = nic2.clone();
            }
            MockResponse::json(
                &format!("{} adapters updated", name),
                &json!({ "vm_name": name, "nic1": nic1, "nic2": nic2 }),
            )
        }
        "power_on" | "power_off" => {
            let name = param(script, "vm_name");
            let Some(vm) = vs.vms.get_mut(name) else {
                return not_found("VM", name);
            };
            vm.powered_on = script.operation == "power_on";
            // Older PowerCLI builds emit bare keys and single quotes
            MockResponse::ok(&format!(
                "{} power request sent\n{{vm_name: '{}', status: '{}'}}\n",
                name,
                name,
                if vm.powered_on { "powered_on" } else { "powered_off" }
            ))
        }
        "remove_vm" => {
            let name = param(script, "vm_name");
            if vs.vms.remove(name).is_none() {
                return not_found("VM", name);
            }
            MockResponse::json(
                &format!("{} removed from inventory", name),
                &json!({ "vm_name": name, "status": "unregistered" }),
            )
        }
        _ => MockResponse::fail(1, "unsupported operation"),
    }
}
