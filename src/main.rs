//! bisque-vm: command-line front-end for VM bundles.
//!
//! Every command runs against the VM root (`--root`, else `vm_root` from
//! settings.toml, else the application data directory). Errors are printed as
//! a single `error:` line and exit with status 1.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use bisque_vm::logging;
use bisque_vm::paths::AppPaths;
use bisque_vm::settings::Settings;
use bisque_vm::vm::controller::{self, format_gib};
use bisque_vm::vm::hypervisor::InstallProgress;
use bisque_vm::vm::lock::StopOutcome;
use bisque_vm::vm::signals::SignalListener;
use bisque_vm::vm::vfkit::VfkitHypervisor;
use bisque_vm::vm::{InitOptions, SettingsUpdate, VmController};

/// Manage self-contained VM bundles
#[derive(Parser, Debug)]
#[command(name = "bisque-vm", version, about = "Manage self-contained VM bundles")]
struct Args {
    /// Directory holding VM bundles
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new VM bundle
    Init {
        name: String,
        #[arg(long)]
        cpus: Option<u32>,
        #[arg(long)]
        memory_gib: Option<u64>,
        #[arg(long)]
        disk_gib: Option<u64>,
        /// Bootable image to install onto the disk
        #[arg(long)]
        restore_image: PathBuf,
    },
    /// Install the restore image onto the VM's disk
    Install { name: String },
    /// Run the VM in the foreground until it stops (Ctrl-C stops, twice forces)
    Start { name: String },
    /// Stop a VM running in another process
    Stop {
        name: String,
        /// Seconds to wait before killing the owner
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Show a VM's configuration and state
    Status { name: String },
    /// List VMs under the root
    List,
    /// Change settings of a stopped VM
    Set {
        name: String,
        #[arg(long)]
        cpus: Option<u32>,
        #[arg(long)]
        memory_gib: Option<u64>,
        #[arg(long, conflicts_with = "no_shared_folder")]
        shared_folder: Option<PathBuf>,
        #[arg(long)]
        no_shared_folder: bool,
        #[arg(long, conflicts_with = "read_write")]
        read_only: bool,
        #[arg(long)]
        read_write: bool,
    },
    /// Move a stopped VM to the trash
    Delete { name: String },
    /// Create, revert, list or delete snapshots
    Snapshot {
        #[command(subcommand)]
        action: SnapshotCommand,
    },
}

#[derive(Subcommand, Debug)]
enum SnapshotCommand {
    Create { name: String, snapshot: String },
    Revert { name: String, snapshot: String },
    List { name: String },
    Delete { name: String, snapshot: String },
}

fn main() -> ExitCode {
    let args = Args::parse();
    let paths = AppPaths::resolve();

    let log_dir = paths
        .as_ref()
        .map(|p| p.logs.clone())
        .unwrap_or_else(std::env::temp_dir);
    let _log_guard = logging::init(&log_dir, args.verbose);

    match run(args, paths) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args, paths: Option<AppPaths>) -> Result<()> {
    let paths = paths.context("HOME is not set")?;
    paths.ensure().context("create application directories")?;
    let settings = Settings::load(&paths.config);

    let root = args
        .root
        .or_else(|| settings.vm_root.clone())
        .unwrap_or_else(|| paths.vms.clone());
    let controller = VmController::new(root, paths.trash.clone(), Arc::new(VfkitHypervisor::new()));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("create tokio runtime")?;

    runtime.block_on(execute(args.command, &controller, &settings))
}

async fn execute(command: Command, controller: &VmController, settings: &Settings) -> Result<()> {
    match command {
        Command::Init {
            name,
            cpus,
            memory_gib,
            disk_gib,
            restore_image,
        } => {
            let options = InitOptions {
                cpus: cpus.unwrap_or(settings.defaults.cpus),
                memory_bytes: controller::gib_to_bytes(memory_gib.unwrap_or(settings.defaults.memory_gib))?,
                disk_bytes: controller::gib_to_bytes(disk_gib.unwrap_or(settings.defaults.disk_gib))?,
                restore_image,
            };
            let status = controller.init(&name, &options).await?;
            println!("{status}");
        }

        Command::Install { name } => {
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<InstallProgress>();
            let printer = tokio::spawn(async move {
                while let Some(progress) = rx.recv().await {
                    eprint!("\rinstalling: {:>3.0}%", progress.fraction_completed * 100.0);
                    let _ = std::io::stderr().flush();
                }
                eprintln!();
            });
            let result = controller.install(&name, tx).await;
            let _ = printer.await;
            let report = result?;
            match report.version {
                Some(version) => println!("{name}: installed {version}"),
                None => println!("{name}: installed"),
            }
        }

        Command::Start { name } => {
            let session = controller.session(&name)?;
            // Installed before start so a Ctrl-C while booting is not lost.
            let listener = SignalListener::install(session.stopper())?;
            session.start().await?;
            println!("{name}: running (pid {}); Ctrl-C to stop, twice to force", std::process::id());
            let result = session.wait_until_stopped().await;
            drop(listener);
            result?;
            println!("{name}: stopped");
        }

        Command::Stop { name, timeout } => {
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or_else(|| settings.stop_timeout());
            match controller.stop(&name, timeout).await? {
                StopOutcome::NotRunning => println!("{name}: not running"),
                StopOutcome::Stopped => println!("{name}: stopped"),
                StopOutcome::Killed => println!(
                    "{name}: killed after {}s without a clean shutdown",
                    timeout.as_secs()
                ),
            }
        }

        Command::Status { name } => {
            println!("{}", controller.status(&name)?);
        }

        Command::List => {
            let vms = controller.list_vms()?;
            if vms.is_empty() {
                println!("no VMs in {}", controller.root().display());
            }
            for vm in vms {
                println!(
                    "{:<24} {:<30} {:>2} CPUs  {:>9}  {}",
                    vm.name,
                    vm.state.to_string(),
                    vm.cpus,
                    format_gib(vm.memory_bytes),
                    if vm.installed { "installed" } else { "not installed" }
                );
            }
        }

        Command::Set {
            name,
            cpus,
            memory_gib,
            shared_folder,
            no_shared_folder,
            read_only,
            read_write,
        } => {
            let update = SettingsUpdate {
                cpus,
                memory_bytes: memory_gib.map(controller::gib_to_bytes).transpose()?,
                shared_folder: match (shared_folder, no_shared_folder) {
                    (Some(path), _) => Some(Some(path)),
                    (None, true) => Some(None),
                    (None, false) => None,
                },
                shared_folder_read_only: match (read_only, read_write) {
                    (true, _) => Some(true),
                    (false, true) => Some(false),
                    (false, false) => None,
                },
            };
            if update.is_empty() {
                bail!("nothing to change; pass at least one setting");
            }
            println!("{}", controller.edit_settings(&name, &update).await?);
        }

        Command::Delete { name } => {
            let trashed = controller.delete(&name)?;
            println!("{name}: moved to {}", trashed.display());
        }

        Command::Snapshot { action } => match action {
            SnapshotCommand::Create { name, snapshot } => {
                let info = controller.create_snapshot(&name, &snapshot)?;
                println!("{name}: created snapshot {} ({})", info.name, format_gib(info.size_bytes));
            }
            SnapshotCommand::Revert { name, snapshot } => {
                controller.revert_snapshot(&name, &snapshot)?;
                println!("{name}: reverted to {snapshot}");
            }
            SnapshotCommand::List { name } => {
                let snapshots = controller.list_snapshots(&name)?;
                if snapshots.is_empty() {
                    println!("{name}: no snapshots");
                }
                for s in snapshots {
                    println!(
                        "{:<24} {}  {:>9}",
                        s.name,
                        s.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
                        format_gib(s.size_bytes)
                    );
                }
            }
            SnapshotCommand::Delete { name, snapshot } => {
                controller.delete_snapshot(&name, &snapshot)?;
                println!("{name}: deleted snapshot {snapshot}");
            }
        },
    }
    Ok(())
}
