//! Command-line interface

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use flowmon::category::CatType;
use flowmon::config::{CaptureMethod, InterfaceConfig, InterfaceRole};
use flowmon::{AgentConfig, Instance, IpcEvent};

/// Exit code for list dumps
pub const EXIT_DUMP: i32 = 2;
/// Exit code after a forced state reset
pub const EXIT_RESET: i32 = 3;
/// Exit code after UUID generation
pub const EXIT_UUID: i32 = 4;

#[derive(Parser)]
#[command(name = "flowmond", version, about = "Passive network traffic inspection agent")]
pub struct Cli {
    /// Configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// Add a LAN-facing capture interface
    #[arg(short = 'I', long = "internal")]
    pub internal: Vec<String>,

    /// Add a WAN-facing capture interface
    #[arg(short = 'E', long = "external")]
    pub external: Vec<String>,

    /// Replay an offline capture file instead of live capture
    #[arg(short, long)]
    pub replay: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the agent (default)
    Run,
    /// Print the loaded category indexes and exit
    DumpCategories,
    /// Delete persisted caches and status and exit
    ForceReset,
    /// Print the agent UUID, generating one if needed
    Uuid,
}

fn load_config(cli: &Cli) -> Result<AgentConfig> {
    let mut config = match &cli.config {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::load_or_default()?,
    };

    for iface in &cli.internal {
        config.interfaces.entry(iface.clone()).or_insert(InterfaceConfig {
            role: InterfaceRole::Lan,
            method: CaptureMethod::Pcap,
            pcap_file: None,
            tpv3: None,
            nfqueue: None,
            filter: None,
            addresses: Vec::new(),
            local_networks: Vec::new(),
        });
    }
    for iface in &cli.external {
        config.interfaces.entry(iface.clone()).or_insert(InterfaceConfig {
            role: InterfaceRole::Wan,
            method: CaptureMethod::Pcap,
            pcap_file: None,
            tpv3: None,
            nfqueue: None,
            filter: None,
            addresses: Vec::new(),
            local_networks: Vec::new(),
        });
    }

    if let Some(replay) = &cli.replay {
        config.interfaces.insert(
            "replay0".to_string(),
            InterfaceConfig {
                role: InterfaceRole::Lan,
                method: CaptureMethod::PcapOffline,
                pcap_file: Some(replay.clone()),
                tpv3: None,
                nfqueue: None,
                filter: None,
                addresses: Vec::new(),
                local_networks: Vec::new(),
            },
        );
    }

    Ok(config)
}

pub async fn run_command(cli: Cli) -> Result<i32> {
    let config = load_config(&cli)?;

    match cli.command.as_ref().unwrap_or(&Command::Run) {
        Command::Run => run_agent(cli, config).await,
        Command::DumpCategories => {
            let instance = Instance::new(config, cli.config.clone());
            let ((app_tags, app_members), (proto_tags, proto_members)) =
                instance.categories.sizes();
            println!(
                "application categories: {} ({} members)",
                app_tags, app_members
            );
            println!(
                "protocol categories: {} ({} members)",
                proto_tags, proto_members
            );
            for tag in ["streaming", "social"] {
                let id = instance.categories.lookup_tag(CatType::Application, tag);
                if id != flowmon::category::CAT_UNKNOWN {
                    println!("{}: {}", tag, id);
                }
            }
            Ok(EXIT_DUMP)
        }
        Command::ForceReset => {
            for path in [config.fhc_path(), config.dhc_path(), Some(config.status_path())]
                .into_iter()
                .flatten()
            {
                match std::fs::remove_file(&path) {
                    Ok(()) => info!("Removed {}", path.display()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => error!("Failed to remove {}: {}", path.display(), e),
                }
            }
            Ok(EXIT_RESET)
        }
        Command::Uuid => {
            let instance = Instance::new(config, cli.config.clone());
            println!("{}", instance.agent_uuid());
            Ok(EXIT_UUID)
        }
    }
}

async fn run_agent(cli: Cli, config: AgentConfig) -> Result<i32> {
    let instance = Instance::new(config, cli.config.clone());
    if cli.debug {
        instance
            .plugins
            .register_processor(Arc::new(flowmon::plugin::LogSink));
    }

    let runner = instance.clone();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let handle = std::thread::Builder::new()
        .name("supervisor".to_string())
        .spawn(move || {
            let code = runner.run();
            let _ = done_tx.send(code);
        })?;

    let ipc = instance.ipc_sender();
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;

    let mut done_rx = done_rx;
    let code = loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("SIGINT: terminating");
                let _ = ipc.send(IpcEvent::Terminate);
            }
            _ = sigterm.recv() => {
                info!("SIGTERM: terminating");
                let _ = ipc.send(IpcEvent::Terminate);
            }
            _ = sighup.recv() => {
                let _ = ipc.send(IpcEvent::Reload);
            }
            _ = sigusr1.recv() => {
                let _ = ipc.send(IpcEvent::Update);
            }
            _ = sigusr2.recv() => {
                let _ = ipc.send(IpcEvent::UpdateApi);
            }
            code = &mut done_rx => {
                break code.unwrap_or(1);
            }
        }
    };

    let _ = handle.join();
    Ok(code)
}
