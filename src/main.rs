//! Buckos init binary.
//!
//! As PID 1 this boots the system and never returns. Run as any other
//! process it talks to the running init over the control socket.

use buckos_init::control::DEFAULT_CONTROL_SOCKET;
use buckos_init::service::ServiceStatus;
use buckos_init::{
    Boot, BootParams, Collaborators, ControlClient, ControlCommand, ControlResponse, LogControl,
    LogLevel,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;

#[derive(Parser)]
#[command(
    name = "init",
    about = "Buckos init - PID 1, or a client for the running init",
    version,
    author
)]
struct Cli {
    /// Control socket of the running init
    #[arg(short, long, default_value = DEFAULT_CONTROL_SOCKET)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show runlevels and boot flags
    Status,

    /// List services, tasks and TTYs
    List,

    /// List conditions recorded so far
    Conditions,

    /// Switch runlevel (0 powers off, 6 reboots)
    Runlevel {
        /// Runlevel, 0-9
        level: u8,
    },

    /// Check that init is responding
    Ping,
}

fn main() -> anyhow::Result<()> {
    if std::process::id() == 1 {
        run_init()
    } else {
        run_client()
    }
}

fn run_init() -> ! {
    let params = BootParams::parse(std::env::args().skip(1));
    let log = LogControl::install(LogLevel::from_params(&params));

    match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => {
            let mut boot = Boot::new(&params, log, Collaborators::system());
            if let Err(e) = runtime.block_on(boot.start()) {
                error!(error = %e, "Init main loop failed");
            }
        }
        Err(e) => error!(error = %e, "Cannot build the runtime"),
    }

    // PID 1 must not exit; once shutdown is under way there is nothing left to do.
    loop {
        std::thread::park();
    }
}

fn run_client() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let client = ControlClient::new(&cli.socket);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let command = match cli.command {
            Commands::Ping => {
                if client.ping().await? {
                    println!("init is responding");
                    return Ok(());
                }
                anyhow::bail!("init did not answer the ping");
            }
            Commands::Status => ControlCommand::Status,
            Commands::List => ControlCommand::ListServices,
            Commands::Conditions => ControlCommand::ListConditions,
            Commands::Runlevel { level } => ControlCommand::Runlevel { level },
        };

        match client.send_command(command).await? {
            ControlResponse::Success { message } => println!("{}", message),
            ControlResponse::Error { message } => anyhow::bail!("{}", message),
            ControlResponse::Status(status) => {
                println!("Runlevel:   {}", status.runlevel);
                if let Some(prev) = status.prevlevel {
                    println!("Previous:   {}", prev);
                }
                println!("Default:    {}", status.cfglevel);
                println!("Bootstrap:  {}", if status.bootstrapped { "done" } else { "in progress" });
                if let Some(hostname) = status.hostname {
                    println!("Hostname:   {}", hostname);
                }
                if status.rescue {
                    println!("Mode:       rescue");
                } else if status.single {
                    println!("Mode:       single user");
                }
            }
            ControlResponse::ServiceList { services } => {
                if services.is_empty() {
                    println!("No services found");
                } else {
                    for status in services {
                        print_status(&status);
                    }
                }
            }
            ControlResponse::Conditions { names } => {
                for name in names {
                    println!("{}", name);
                }
            }
            ControlResponse::Pong => println!("init is responding"),
        }
        Ok::<(), anyhow::Error>(())
    })
}

fn print_status(status: &ServiceStatus) {
    let pid = status
        .pid
        .map(|pid| pid.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{:<20} {:<8} {:<10} {:>7} [{}] {}",
        status.name,
        format!("{:?}", status.kind).to_lowercase(),
        status.state,
        pid,
        status.runlevels,
        status.description
    );
}
