//! Portal Broker
//!
//! Mediates file transfers, notifications and action activation for
//! sandboxed applications.

use std::path::PathBuf;
use std::time::Duration;

use broker::bus::BusClient;
use broker::config::Config;
use broker::orchestrator::BrokerOrchestrator;
use broker::permissions::{FilePermissionStore, PermissionStore};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Portal Broker - mediates privileged desktop operations for sandboxed applications.
#[derive(Parser, Debug)]
#[command(name = "portal-broker")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the broker until SIGINT or SIGTERM
    Serve {
        /// Bus socket path (overrides the configuration)
        #[arg(long, value_name = "PATH")]
        socket: Option<PathBuf>,
    },

    /// Show the status of a running broker
    Status,

    /// Administer stored permissions
    #[command(subcommand)]
    Permissions(PermissionsCommands),
}

/// Permission store subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum PermissionsCommands {
    /// List the object ids of a table
    List {
        /// Table name, e.g. "notifications"
        table: String,
    },

    /// Show the per-application permissions of an object
    Show { table: String, id: String },

    /// Set the permissions of an application on an object
    Set {
        table: String,
        id: String,
        /// Application id ("" for the host)
        app: String,
        /// Permission values, e.g. "yes" or "no"
        #[arg(required = true)]
        values: Vec<String>,
    },

    /// Remove the permissions of an application on an object
    Revoke { table: String, id: String, app: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();
    config.validate()?;

    // RUST_LOG wins over the configured level.
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.broker.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(config_path) = &cli.config {
        tracing::debug!("Using config file: {:?}", config_path);
    }

    match cli.command {
        Commands::Serve { socket } => {
            if let Some(socket) = socket {
                config.broker.socket_path = Some(socket);
            }
            let mut orchestrator = BrokerOrchestrator::new(config)?;
            run_headless(&mut orchestrator).await?;
        }
        Commands::Status => {
            let socket_path = config.socket_path();
            let mut client = BusClient::connect_with_timeout(&socket_path, Duration::from_secs(5))
                .await
                .map_err(|e| anyhow::anyhow!("Cannot connect to broker: {}", e))?;
            let status = client
                .status()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to query status: {}", e))?;

            println!("Portal broker is running");
            println!("  Socket:        {}", socket_path.display());
            println!("  Uptime:        {}", format_duration(status.uptime_secs));
            println!("  Connections:   {}", status.connections);
            println!("  Requests:      {}", status.requests);
            println!("  Transfers:     {}", status.transfers);
            println!("  Notifications: {}", status.notifications);
        }
        Commands::Permissions(command) => {
            let store = FilePermissionStore::open(config.permission_store_path())?;
            run_permissions_command(&store, command)?;
        }
    }

    Ok(())
}

/// Execute a permission store subcommand.
fn run_permissions_command(
    store: &dyn PermissionStore,
    command: PermissionsCommands,
) -> anyhow::Result<()> {
    match command {
        PermissionsCommands::List { table } => {
            let ids = store.list(&table)?;
            if ids.is_empty() {
                println!("No entries in table {}", table);
            }
            for id in ids {
                println!("{}", id);
            }
        }
        PermissionsCommands::Show { table, id } => {
            let entry = store.lookup(&table, &id)?;
            for (app, values) in &entry.permissions {
                let app = if app.is_empty() { "(host)" } else { app.as_str() };
                println!("{:<40} {}", app, values.join(", "));
            }
        }
        PermissionsCommands::Set {
            table,
            id,
            app,
            values,
        } => {
            store.set_permission(&table, true, &id, &app, &values)?;
            println!("Set {} for {} on {} in {}", values.join(", "), app, id, table);
        }
        PermissionsCommands::Revoke { table, id, app } => {
            store.delete_permission(&table, &id, &app)?;
            println!("Revoked {} on {} in {}", app, id, table);
        }
    }
    Ok(())
}

/// Format an uptime in seconds for display.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Run the broker until a shutdown signal arrives.
async fn run_headless(orchestrator: &mut BrokerOrchestrator) -> anyhow::Result<()> {
    orchestrator.start().await?;

    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    orchestrator.stop().await
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}
