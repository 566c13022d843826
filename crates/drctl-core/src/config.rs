use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use crate::error::{DrError, Result};

/// Default config file name, overridable with `--config` or `DRCTL_CONFIG`.
pub const DEFAULT_CONFIG_FILE: &str = "drctl.toml";

/// Top-level drctl configuration loaded from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct DrConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    pub array: ArrayConfig,
    pub vcenter: VcenterConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    /// Per-deployment overrides selected by environment tag.
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentOverride>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// SQLite database file.
    #[serde(default = "default_database")]
    pub database: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            database: default_database(),
        }
    }
}

/// How automation scripts are launched.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// PowerShell interpreter, bare name (resolved on PATH) or absolute path.
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// Per-script deadline (seconds).
    #[serde(default = "default_script_timeout")]
    pub timeout_secs: u64,
    /// Max scripts in flight for one batch stage.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            timeout_secs: default_script_timeout(),
            concurrency: default_concurrency(),
        }
    }
}

/// Storage array REST endpoint and credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayConfig {
    /// Management address (host or host:port), HTTPS is implied.
    pub address: String,
    pub username: String,
    /// Name of the environment variable carrying the password.
    #[serde(default = "default_array_password_env")]
    pub password_env: String,
    /// Host group restored volumes are connected to.
    pub host_group: String,
    /// Per-request deadline (seconds).
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,
    /// Accept self-signed array certificates.
    #[serde(default)]
    pub insecure_tls: bool,
}

/// vCenter endpoint and the inventory objects drctl operates on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcenterConfig {
    pub server: String,
    pub username: String,
    #[serde(default = "default_vcenter_password_env")]
    pub password_env: String,
    pub datacenter: String,
    pub cluster: String,
    /// ESXi host used for LUN resolution, resignature, and registration.
    pub esx_host: String,
}

/// What to do with a NIC assignment naming a VM that is not registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedNicPolicy {
    /// Leave the item out of the update and report it as skipped.
    #[default]
    Skip,
    /// Report the item as a failure.
    Reject,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub unmatched_nic_policy: UnmatchedNicPolicy,
    /// Platform folders never treated as VM folders during inventory.
    #[serde(default = "default_system_folders")]
    pub system_folders: Vec<String>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            unmatched_nic_policy: UnmatchedNicPolicy::default(),
            system_folders: default_system_folders(),
        }
    }
}

/// Overrides applied on top of the defaults for one environment tag.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvironmentOverride {
    pub array: Option<ArrayConfig>,
    pub vcenter: Option<VcenterConfig>,
}

/// Array and vCenter settings resolved for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentProfile {
    /// `None` for the default (unnamespaced) environment.
    pub tag: Option<String>,
    pub array: ArrayConfig,
    pub vcenter: VcenterConfig,
}

impl EnvironmentProfile {
    /// Namespace for per-environment rows; empty for the default environment.
    pub fn namespace(&self) -> &str {
        self.tag.as_deref().unwrap_or("")
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}
fn default_database() -> PathBuf {
    PathBuf::from("drctl.db")
}
fn default_interpreter() -> String {
    "pwsh".to_string()
}
fn default_script_timeout() -> u64 {
    300
}
fn default_concurrency() -> usize {
    4
}
fn default_api_timeout() -> u64 {
    30
}
fn default_array_password_env() -> String {
    "DRCTL_ARRAY_PASSWORD".to_string()
}
fn default_vcenter_password_env() -> String {
    "DRCTL_VCENTER_PASSWORD".to_string()
}
fn default_system_folders() -> Vec<String> {
    [".sdd.sf", ".dvsData", ".vSphere-HA"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl DrConfig {
    /// Load config from a TOML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read drctl config: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse config from a TOML string.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(s).with_context(|| "Failed to parse drctl config TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.executor.concurrency == 0 {
            bail!("[executor] concurrency must be at least 1");
        }
        if self.executor.timeout_secs == 0 {
            bail!("[executor] timeout_secs must be at least 1");
        }
        if self.executor.interpreter.trim().is_empty() {
            bail!("[executor] interpreter must not be empty");
        }
        check_array(&self.array, "array")?;
        for (tag, env) in &self.environments {
            validate_env_tag(tag).map_err(|e| anyhow::anyhow!("[environments.{}]: {}", tag, e))?;
            if let Some(array) = &env.array {
                check_array(array, &format!("environments.{}.array", tag))?;
            }
        }
        Ok(())
    }

    /// Resolve the array/vCenter settings for an environment tag.
    ///
    /// `None` (or an empty tag) selects the top-level defaults. An unknown tag
    /// is a request error, never a silent fallback.
    pub fn profile(&self, tag: Option<&str>) -> Result<EnvironmentProfile> {
        let tag = tag.map(str::trim).filter(|t| !t.is_empty());
        let Some(tag) = tag else {
            return Ok(EnvironmentProfile {
                tag: None,
                array: self.array.clone(),
                vcenter: self.vcenter.clone(),
            });
        };
        let tag = tag.to_ascii_lowercase();
        let env = self
            .environments
            .get(&tag)
            .ok_or_else(|| DrError::invalid(format!("unknown environment {:?}", tag)))?;
        Ok(EnvironmentProfile {
            array: env.array.clone().unwrap_or_else(|| self.array.clone()),
            vcenter: env.vcenter.clone().unwrap_or_else(|| self.vcenter.clone()),
            tag: Some(tag),
        })
    }
}

fn check_array(array: &ArrayConfig, section: &str) -> anyhow::Result<()> {
    if array.address.trim().is_empty() {
        bail!("[{}] address must not be empty", section);
    }
    if array.address.contains("://") {
        bail!(
            "[{}] address must be a host or host:port without a scheme, got {:?}",
            section,
            array.address
        );
    }
    if array.timeout_secs == 0 {
        bail!("[{}] timeout_secs must be at least 1", section);
    }
    Ok(())
}

/// Validate an environment tag: lowercase alphanumeric + hyphens, 1-32 chars.
pub fn validate_env_tag(tag: &str) -> Result<()> {
    if tag.is_empty() || tag.len() > 32 {
        return Err(DrError::invalid(format!(
            "environment tag must be 1-32 characters, got {}",
            tag.len()
        )));
    }
    if !tag
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(DrError::invalid(format!(
            "environment tag must be lowercase alphanumeric + hyphens: {:?}",
            tag
        )));
    }
    Ok(())
}

/// Read a secret from the environment variable named by `var`.
pub fn secret_from_env(var: &str) -> Result<String> {
    std::env::var(var).map_err(|_| {
        DrError::invalid(format!(
            "environment variable {} is not set (credential source)",
            var
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[array]
address = "10.0.0.10"
username = "pureuser"
host_group = "HG-DR"

[vcenter]
server = "vcenter.example.net"
username = "administrator@vsphere.local"
datacenter = "DC-DR"
cluster = "CL-DR-01"
esx_host = "esx01.example.net"
"#;

    #[test]
    fn test_parse_minimal_config() {
        let config = DrConfig::parse(MINIMAL).unwrap();
        assert_eq!(config.server.listen.port(), 3000);
        assert_eq!(config.executor.interpreter, "pwsh");
        assert_eq!(config.executor.timeout_secs, 300);
        assert_eq!(config.executor.concurrency, 4);
        assert_eq!(config.array.password_env, "DRCTL_ARRAY_PASSWORD");
        assert_eq!(config.array.timeout_secs, 30);
        assert!(!config.array.insecure_tls);
        assert_eq!(config.workflow.unmatched_nic_policy, UnmatchedNicPolicy::Skip);
        assert!(config.workflow.system_folders.contains(&".vSphere-HA".to_string()));
    }

    #[test]
    fn test_default_profile_has_no_namespace() {
        let config = DrConfig::parse(MINIMAL).unwrap();
        let profile = config.profile(None).unwrap();
        assert_eq!(profile.tag, None);
        assert_eq!(profile.namespace(), "");
        assert_eq!(profile.array.host_group, "HG-DR");
        assert_eq!(config.profile(Some("  ")).unwrap().tag, None);
    }

    #[test]
    fn test_environment_override_replaces_section() {
        let toml = format!(
            "{}\n{}",
            MINIMAL,
            r#"
[environments.sby.array]
address = "10.1.0.10"
username = "pureuser"
host_group = "HG-SBY"
"#
        );
        let config = DrConfig::parse(&toml).unwrap();
        let profile = config.profile(Some("SBY")).unwrap();
        assert_eq!(profile.tag.as_deref(), Some("sby"));
        assert_eq!(profile.namespace(), "sby");
        assert_eq!(profile.array.host_group, "HG-SBY");
        // vcenter not overridden, falls back to default
        assert_eq!(profile.vcenter.cluster, "CL-DR-01");
    }

    #[test]
    fn test_unknown_environment_rejected() {
        let config = DrConfig::parse(MINIMAL).unwrap();
        let err = config.profile(Some("jkt")).unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let toml = format!("{}\n[executor]\nconcurrency = 0\n", MINIMAL);
        assert!(DrConfig::parse(&toml).is_err());
    }

    #[test]
    fn test_address_with_scheme_rejected() {
        let toml = MINIMAL.replace("\"10.0.0.10\"", "\"https://10.0.0.10\"");
        assert!(DrConfig::parse(&toml).is_err());
    }

    #[test]
    fn test_bad_environment_tag_rejected() {
        let toml = format!(
            "{}\n[environments.\"Bad_Tag\"]\n",
            MINIMAL
        );
        assert!(DrConfig::parse(&toml).is_err());
    }

    #[test]
    fn test_reject_policy_parses() {
        let toml = format!("{}\n[workflow]\nunmatched_nic_policy = \"reject\"\n", MINIMAL);
        let config = DrConfig::parse(&toml).unwrap();
        assert_eq!(config.workflow.unmatched_nic_policy, UnmatchedNicPolicy::Reject);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drctl.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = DrConfig::from_file(&path).unwrap();
        assert_eq!(config.vcenter.esx_host, "esx01.example.net");
        assert!(DrConfig::from_file(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_secret_from_missing_env() {
        assert!(secret_from_env("DRCTL_TEST_SURELY_UNSET_VAR").is_err());
    }
}
