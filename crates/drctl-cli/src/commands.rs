use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser, Subcommand};
use serde::Serialize;

use drctl_core::config::{DEFAULT_CONFIG_FILE, DrConfig};
use drctl_core::model::{NOT_CONNECTED, NicAssignment, PresentedVolume};
use drctl_core::protocol::BatchReport;
use drctl_runtime::script::{Operation, build_script};
use drctl_runtime::state::Store;
use drctl_runtime::workflow::{LiveConnector, Orchestrator};

use crate::display::{self, OutputFormat};
use crate::logging::{self, LogFormat};
use crate::server::{self, AppState};
use crate::ui;

#[derive(Parser)]
#[command(
    name = "drctl",
    version,
    about = "Recover VMs from block-array snapshots into vSphere"
)]
struct Cli {
    /// Config file (TOML)
    #[arg(
        long,
        short = 'c',
        global = true,
        env = "DRCTL_CONFIG",
        default_value = DEFAULT_CONFIG_FILE
    )]
    config: PathBuf,

    /// Environment tag selecting array/vCenter overrides
    #[arg(long = "env", short = 'e', global = true, env = "DRCTL_ENVIRONMENT")]
    environment: Option<String>,

    /// Output format
    #[arg(long, short = 'o', global = true, value_enum, default_value = "text")]
    output: OutputFormat,

    /// Answer yes to confirmation prompts
    #[arg(long, short = 'y', global = true)]
    yes: bool,

    /// Debug logging (overrides RUST_LOG)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the stage endpoints over HTTP
    Serve {
        /// Listen address (default from [server] listen)
        #[arg(long)]
        listen: Option<SocketAddr>,
    },

    // ---- Storage array ----
    /// Create a volume from an array snapshot and connect it to the host group
    Restore {
        /// Source snapshot (e.g. pgroup.snap-1.volume)
        snapshot: String,
        /// Name of the new volume
        volume: String,
    },
    /// Volumes restored from snapshots
    Restored {
        #[command(subcommand)]
        action: RestoredCmd,
    },
    /// Show the storage array's identity (connectivity check)
    Array,
    /// Protection groups and their snapshots
    Pg {
        #[command(subcommand)]
        action: PgCmd,
    },

    // ---- Recovery pipeline ----
    /// Volumes presented to the compute host
    Present {
        #[command(subcommand)]
        action: PresentCmd,
    },
    /// Rescan HBAs and VMFS volumes on every host of the cluster
    Rescan,
    /// Cluster hosts
    Hosts {
        #[command(subcommand)]
        action: HostsCmd,
    },
    /// Datastores and VMs as vCenter reports them
    Cluster {
        #[command(subcommand)]
        action: ClusterCmd,
    },
    /// LUN resolution checks
    Luns {
        #[command(subcommand)]
        action: LunsCmd,
    },
    /// Resignature, inventory, and list datastores
    Datastores {
        #[command(subcommand)]
        action: DatastoresCmd,
    },
    /// Register, reconfigure, power, and remove VMs
    Vms {
        #[command(subcommand)]
        action: VmsCmd,
    },

    // ---- Tooling ----
    /// Render an operation's PowerCLI script without running it
    Script {
        /// Operation name (e.g. lun_check, register_vm, power_on)
        operation: String,
        /// Operation parameters as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum RestoredCmd {
    /// List restored volumes
    List,
    /// Refresh each restored volume's status from the array
    Reload,
    /// Forget a restored volume (the array is not touched)
    Delete { volume: String },
}

#[derive(Subcommand)]
enum PresentCmd {
    /// Record volumes as presented, each given as NAME:SERIAL:LUN
    Add {
        #[arg(required = true)]
        volumes: Vec<String>,
    },
    /// Present every restored volume
    Restored,
    /// List presented volumes
    List,
    /// Clear presented volumes and their LUN checks
    Reset,
}

#[derive(Subcommand)]
enum HostsCmd {
    /// Refresh the host list from the cluster
    Refresh,
    /// List hosts recorded by the last refresh
    List,
}

#[derive(Subcommand)]
enum ClusterCmd {
    /// Cluster datastores with capacity and usage
    Datastores {
        /// Ask vCenter instead of the stored inventory
        #[arg(long)]
        refresh: bool,
    },
    /// Cluster VMs with power state and sizing
    Vms {
        /// Ask vCenter instead of the stored inventory
        #[arg(long)]
        refresh: bool,
    },
}

#[derive(Subcommand)]
enum LunsCmd {
    /// Classify every presented volume against the host's unresolved extents
    Check,
    /// List the last check results
    List,
}

#[derive(Subcommand)]
enum DatastoresCmd {
    /// Resignature unresolved volumes and name the datastores after them
    Resignature,
    /// List VM folders and .vmx files on every presented datastore
    Inventory,
    /// List datastores
    List,
    /// Show one datastore's folders and files
    Show { datastore: String },
    /// List every inventoried .vmx file
    Files,
    /// Clear datastores with their folder and file inventory
    Reset,
}

#[derive(Subcommand)]
enum VmsCmd {
    /// Register VMs from .vmx paths ("[datastore] folder/file.vmx")
    Register {
        vmx_paths: Vec<String>,
        /// Register every unregistered inventoried file
        #[arg(long, conflicts_with = "vmx_paths")]
        all: bool,
    },
    /// List registered VMs
    List,
    /// Network adapter assignments
    Nics {
        #[command(subcommand)]
        action: NicsCmd,
    },
    /// Power on VMs
    PowerOn {
        #[arg(required = true)]
        vm_names: Vec<String>,
    },
    /// Power off VMs
    PowerOff {
        #[arg(required = true)]
        vm_names: Vec<String>,
    },
    /// Remove VMs from the inventory and forget their registration
    Remove {
        #[arg(required = true)]
        vm_names: Vec<String>,
    },
}

#[derive(Subcommand)]
enum NicsCmd {
    /// Store the port groups for one VM's adapters
    Set {
        vm_name: String,
        #[arg(long, default_value = NOT_CONNECTED)]
        nic1: String,
        #[arg(long, default_value = NOT_CONNECTED)]
        nic2: String,
    },
    /// Store assignments from a JSON file: [{"vm_name", "nic1", "nic2"}, ...]
    Import { file: PathBuf },
    /// Push stored assignments to the VMs' adapters
    Apply,
    /// List the last configuration applied per VM
    Applied,
}

#[derive(Subcommand)]
enum PgCmd {
    /// Add a protection group to this environment
    Add { name: String },
    /// List this environment's protection groups
    List,
    /// Delete a protection group by id
    Delete { id: i64 },
    /// List array snapshots of every protection group
    Snapshots,
}

// ============================================================================
// Command dispatch
// ============================================================================

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    // JSON logs for the daemon, compact logs for one-shot commands
    let log_format = match &cli.command {
        Commands::Serve { .. } => LogFormat::Json,
        _ => LogFormat::Human,
    };
    logging::init(log_format, cli.verbose);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(execute(cli))
}

async fn execute(cli: Cli) -> Result<()> {
    let fmt = cli.output;
    match cli.command {
        Commands::Completions { shell } => return cmd_completions(shell),
        Commands::Script { operation, params } => return cmd_script(&operation, &params),
        _ => {}
    }

    let config = load_config(&cli.config)?;
    let store = Store::open(&config.server.database)
        .await
        .with_context(|| format!("Failed to open {}", config.server.database.display()))?;

    if let Commands::Serve { listen } = cli.command {
        let listen = listen.unwrap_or(config.server.listen);
        let state = AppState {
            config: Arc::new(config),
            store,
            connector: Arc::new(LiveConnector),
        };
        return server::serve(state, listen).await;
    }

    let orch = Orchestrator::connect(&config, store, &LiveConnector, cli.environment.as_deref())?;
    let yes = cli.yes;

    match cli.command {
        Commands::Restore { snapshot, volume } => {
            let restored = orch.restore_snapshot(&snapshot, &volume).await?;
            ui::success(&format!(
                "Restored {} from {} (serial {}, LUN {})",
                restored.volume_name, restored.snapshot_name, restored.serial, restored.lun
            ));
            display::render(&restored, fmt)
        }
        Commands::Restored { action } => cmd_restored(&orch, action, fmt, yes).await,
        Commands::Array => display::render(&orch.array_info().await?, fmt),
        Commands::Pg { action } => cmd_pg(&orch, action, fmt, yes).await,
        Commands::Present { action } => cmd_present(&orch, action, fmt, yes).await,
        Commands::Rescan => {
            let rescanned = spin("Rescanning storage", orch.rescan_storage()).await?;
            display::render(&rescanned, fmt)
        }
        Commands::Hosts { action } => match action {
            HostsCmd::Refresh => {
                let hosts = spin("Reading cluster hosts", orch.refresh_hosts()).await?;
                display::render(&hosts, fmt)
            }
            HostsCmd::List => display::render(&orch.store().list_hosts().await?, fmt),
        },
        Commands::Cluster { action } => match action {
            ClusterCmd::Datastores { refresh } => {
                let datastores =
                    spin("Reading cluster datastores", orch.refresh_datastores(refresh)).await?;
                display::render(&datastores, fmt)
            }
            ClusterCmd::Vms { refresh } => {
                let vms = spin("Reading cluster VMs", orch.refresh_vms(refresh)).await?;
                display::render(&vms, fmt)
            }
        },
        Commands::Luns { action } => match action {
            LunsCmd::Check => finish(spin("Checking LUNs", orch.check_luns()).await?, fmt),
            LunsCmd::List => display::render(&orch.store().list_checked().await?, fmt),
        },
        Commands::Datastores { action } => cmd_datastores(&orch, action, fmt, yes).await,
        Commands::Vms { action } => cmd_vms(&orch, action, fmt, yes).await,
        Commands::Serve { .. } | Commands::Completions { .. } | Commands::Script { .. } => {
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> Result<DrConfig> {
    if !path.exists() {
        bail!(
            "Config file {} not found (set --config or DRCTL_CONFIG)",
            path.display()
        );
    }
    DrConfig::from_file(path)
}

/// Run a stage behind a spinner.
async fn spin<T>(msg: &str, stage: impl Future<Output = T>) -> T {
    let pb = ui::spinner(msg);
    let out = stage.await;
    pb.finish_and_clear();
    out
}

/// Print a batch report; any failed item makes the command fail.
fn finish<T: Serialize>(report: BatchReport<T>, fmt: OutputFormat) -> Result<()> {
    display::render_report(&report, fmt)?;
    if report.failed > 0 {
        bail!(
            "{} of {} items failed",
            report.failed,
            report.succeeded + report.failed
        );
    }
    Ok(())
}

fn cmd_completions(shell: clap_complete::Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "drctl", &mut std::io::stdout());
    Ok(())
}

fn cmd_script(operation: &str, params: &str) -> Result<()> {
    let params: serde_json::Value =
        serde_json::from_str(params).context("--params must be a JSON object")?;
    let op: Operation = serde_json::from_value(serde_json::json!({
        "operation": operation,
        "params": params,
    }))
    .with_context(|| format!("Invalid parameters for operation {:?}", operation))?;
    let script = build_script(&op)?;
    print!("{}", script.text);
    Ok(())
}

/// Parse `NAME:SERIAL:LUN`.
fn parse_presented(spec: &str) -> Result<PresentedVolume> {
    let mut parts = spec.rsplitn(3, ':');
    let (Some(lun), Some(serial), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
        bail!("Expected NAME:SERIAL:LUN, got {:?}", spec);
    };
    let lun = lun
        .parse()
        .with_context(|| format!("LUN must be a number in {:?}", spec))?;
    Ok(PresentedVolume {
        volume_name: name.to_string(),
        serial: serial.to_string(),
        lun,
    })
}

async fn cmd_restored(
    orch: &Orchestrator,
    action: RestoredCmd,
    fmt: OutputFormat,
    yes: bool,
) -> Result<()> {
    match action {
        RestoredCmd::List => display::render(&orch.store().list_restored().await?, fmt),
        RestoredCmd::Reload => finish(
            spin("Querying the array", orch.reload_restored_volumes()).await?,
            fmt,
        ),
        RestoredCmd::Delete { volume } => {
            if !ui::confirm(&format!("Forget restored volume {}?", volume), yes) {
                ui::warn("Cancelled");
                return Ok(());
            }
            orch.delete_restored_volume(&volume).await?;
            ui::success(&format!("Restored volume {} removed", volume));
            Ok(())
        }
    }
}

async fn cmd_present(
    orch: &Orchestrator,
    action: PresentCmd,
    fmt: OutputFormat,
    yes: bool,
) -> Result<()> {
    match action {
        PresentCmd::Add { volumes } => {
            let volumes = volumes
                .iter()
                .map(String::as_str)
                .map(parse_presented)
                .collect::<Result<Vec<_>>>()?;
            finish(orch.present_volumes(volumes).await?, fmt)
        }
        PresentCmd::Restored => finish(orch.present_restored().await?, fmt),
        PresentCmd::List => display::render(&orch.store().list_presented().await?, fmt),
        PresentCmd::Reset => {
            if !ui::confirm("Clear all presented volumes and LUN checks?", yes) {
                ui::warn("Cancelled");
                return Ok(());
            }
            let cleared = orch.reinitialize_presented().await?;
            ui::success(&format!("{} presented volumes cleared", cleared));
            Ok(())
        }
    }
}

async fn cmd_datastores(
    orch: &Orchestrator,
    action: DatastoresCmd,
    fmt: OutputFormat,
    yes: bool,
) -> Result<()> {
    match action {
        DatastoresCmd::Resignature => finish(
            spin("Resignaturing datastores", orch.resignature_datastores()).await?,
            fmt,
        ),
        DatastoresCmd::Inventory => {
            let report = spin("Walking datastores", orch.inventory_datastores()).await?;
            if fmt == OutputFormat::Text {
                for item in report.items.iter().filter_map(|i| i.data.as_ref()) {
                    let files: usize = item.folders.iter().map(|f| f.vmx_files.len()).sum();
                    ui::info(&format!(
                        "{}: {} folders, {} .vmx files",
                        item.datastore.datastore_name,
                        item.folders.len(),
                        files
                    ));
                }
            }
            finish(report, fmt)
        }
        DatastoresCmd::List => display::render(&orch.store().list_datastores().await?, fmt),
        DatastoresCmd::Show { datastore } => {
            let folders = orch.store().inventory(&datastore).await?;
            if fmt == OutputFormat::Json {
                return display::render(&folders, fmt);
            }
            let files: Vec<_> = folders.into_iter().flat_map(|f| f.vmx_files).collect();
            display::render(&files, fmt)
        }
        DatastoresCmd::Files => display::render(&orch.store().list_vmx_files().await?, fmt),
        DatastoresCmd::Reset => {
            if !ui::confirm("Clear all datastores and their inventory?", yes) {
                ui::warn("Cancelled");
                return Ok(());
            }
            let cleared = orch.reinitialize_datastores().await?;
            ui::success(&format!("{} datastores cleared", cleared));
            Ok(())
        }
    }
}

async fn cmd_vms(orch: &Orchestrator, action: VmsCmd, fmt: OutputFormat, yes: bool) -> Result<()> {
    match action {
        VmsCmd::Register { vmx_paths, all } => {
            let report = if all {
                spin("Registering inventoried VMs", orch.register_all()).await?
            } else if vmx_paths.is_empty() {
                bail!("Give .vmx paths or --all");
            } else {
                spin("Registering VMs", orch.register_vms(vmx_paths)).await?
            };
            finish(report, fmt)
        }
        VmsCmd::List => display::render(&orch.store().list_registered().await?, fmt),
        VmsCmd::Nics { action } => match action {
            NicsCmd::Set {
                vm_name,
                nic1,
                nic2,
            } => finish(
                orch.commit_nics(vec![NicAssignment {
                    vm_name,
                    nic1,
                    nic2,
                }])
                .await?,
                fmt,
            ),
            NicsCmd::Import { file } => {
                let text = std::fs::read_to_string(&file)
                    .with_context(|| format!("Failed to read {}", file.display()))?;
                let assignments: Vec<NicAssignment> = serde_json::from_str(&text)
                    .with_context(|| format!("Failed to parse {}", file.display()))?;
                finish(orch.commit_nics(assignments).await?, fmt)
            }
            NicsCmd::Apply => finish(
                spin("Reconfiguring adapters", orch.reconfigure_nics()).await?,
                fmt,
            ),
            NicsCmd::Applied => {
                display::render(&orch.store().list_last_configured().await?, fmt)
            }
        },
        VmsCmd::PowerOn { vm_names } => {
            finish(spin("Powering on", orch.power_on(vm_names)).await?, fmt)
        }
        VmsCmd::PowerOff { vm_names } => {
            if !ui::confirm(&format!("Power off {}?", vm_names.join(", ")), yes) {
                ui::warn("Cancelled");
                return Ok(());
            }
            finish(spin("Powering off", orch.power_off(vm_names)).await?, fmt)
        }
        VmsCmd::Remove { vm_names } => {
            if !ui::confirm(
                &format!("Remove {} from the inventory?", vm_names.join(", ")),
                yes,
            ) {
                ui::warn("Cancelled");
                return Ok(());
            }
            finish(spin("Removing VMs", orch.remove_vms(vm_names)).await?, fmt)
        }
    }
}

async fn cmd_pg(orch: &Orchestrator, action: PgCmd, fmt: OutputFormat, yes: bool) -> Result<()> {
    match action {
        PgCmd::Add { name } => {
            let (group, created) = orch.add_protection_group(&name).await?;
            if created {
                ui::success(&format!("Protection group {} added (id {})", group.name, group.id));
            } else {
                ui::warn(&format!(
                    "Protection group {} already exists (id {})",
                    group.name, group.id
                ));
            }
            Ok(())
        }
        PgCmd::List => display::render(&orch.list_protection_groups().await?, fmt),
        PgCmd::Delete { id } => {
            if !ui::confirm(&format!("Delete protection group {}?", id), yes) {
                ui::warn("Cancelled");
                return Ok(());
            }
            orch.delete_protection_group(id).await?;
            ui::success(&format!("Protection group {} deleted", id));
            Ok(())
        }
        PgCmd::Snapshots => finish(
            spin("Listing snapshots", orch.protection_snapshots()).await?,
            fmt,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_presented_volume() {
        let v = parse_presented("VOL-A:624A9370ABCD:3").unwrap();
        assert_eq!(v.volume_name, "VOL-A");
        assert_eq!(v.serial, "624A9370ABCD");
        assert_eq!(v.lun, 3);
        // Only the last two colons separate fields.
        assert_eq!(parse_presented("pg:VOL:1234:1").unwrap().volume_name, "pg:VOL");
        assert!(parse_presented("VOL-A:1234").is_err());
        assert!(parse_presented("VOL-A:1234:x").is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "drctl", "luns", "check", "--env", "dr", "-o", "json", "--config", "/tmp/x.toml",
        ])
        .unwrap();
        assert_eq!(cli.environment.as_deref(), Some("dr"));
        assert_eq!(cli.output, OutputFormat::Json);
        assert_eq!(cli.config, PathBuf::from("/tmp/x.toml"));
    }

    #[test]
    fn test_cluster_refresh_flag() {
        let cli = Cli::try_parse_from(["drctl", "cluster", "vms", "--refresh"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Cluster {
                action: ClusterCmd::Vms { refresh: true }
            }
        ));
    }

    #[test]
    fn test_register_all_conflicts_with_paths() {
        assert!(
            Cli::try_parse_from(["drctl", "vms", "register", "--all", "[DS] a/a.vmx"]).is_err()
        );
    }
}
