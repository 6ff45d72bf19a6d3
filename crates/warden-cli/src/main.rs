mod api;
mod config;
mod device_cmds;
mod run_cmd;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use warden_db::config::DbConfig;
use warden_db::pool;
use warden_db::queries::devices as device_db;

use config::{CliOverrides, WardenConfig};

#[derive(Parser)]
#[command(name = "warden", about = "Keeps a UI test harness running on every device in a fleet")]
struct Cli {
    /// Database URL (overrides WARDEN_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a warden config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = DbConfig::DEFAULT_URL)]
        db_url: String,
        /// Directory containing the Xcode workspace
        #[arg(long)]
        root: Option<PathBuf>,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the warden database (requires config file or env vars)
    DbInit,
    /// Manage the device directory
    Device {
        #[command(subcommand)]
        command: DeviceCommands,
    },
    /// Build the project and supervise every registered device until Ctrl+C
    Run {
        /// Directory containing the Xcode workspace
        #[arg(long)]
        root: Option<PathBuf>,
        /// Seconds without harness output before an instance is restarted
        #[arg(long)]
        timeout: Option<u64>,
        /// Address for the control API
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port for the control API
        #[arg(long, default_value_t = 9100)]
        port: u16,
        /// Skip `xcodebuild build-for-testing`
        #[arg(long)]
        no_build: bool,
    },
}

#[derive(Subcommand)]
pub enum DeviceCommands {
    /// Register a device (or update an existing one)
    Add {
        /// Device UDID
        udid: String,
        /// Human-readable name, passed to the harness as name=<name>
        #[arg(long)]
        name: String,
        /// Extra harness parameter as key=value (repeatable)
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
    /// List registered devices
    List,
    /// Remove a device from the directory
    Remove {
        /// Device UDID
        udid: String,
    },
}

/// Execute the `warden init` command: write config file.
fn cmd_init(db_url: &str, root: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        supervisor: config::SupervisorSection {
            root_path: root.clone(),
            ..Default::default()
        },
        harness: config::HarnessSection::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    if let Some(root) = root {
        println!("  supervisor.root_path = {}", root.display());
    }
    println!();
    println!("Next: run `warden db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `warden db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = WardenConfig::resolve(CliOverrides {
        db_url: cli_db_url,
        ..Default::default()
    })?;

    println!("Initializing warden database...");

    // 1. Create the database if it does not exist.
    pool::ensure_database_exists(&resolved.db_config).await?;

    // 2. Connect to the target database.
    let db_pool = pool::create_pool(&resolved.db_config).await?;

    // 3. Run migrations.
    pool::run_migrations(&db_pool).await?;

    let count = device_db::count_devices(&db_pool).await?;
    println!("Database ready. {count} device(s) registered.");

    db_pool.close().await;

    println!("warden db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            db_url,
            root,
            force,
        } => {
            cmd_init(&db_url, root, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Device { command } => {
            let resolved = WardenConfig::resolve(CliOverrides {
                db_url: cli.database_url.as_deref(),
                ..Default::default()
            })?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = device_cmds::run_device_command(command, &db_pool).await;
            db_pool.close().await;
            result?;
        }
        Commands::Run {
            root,
            timeout,
            bind,
            port,
            no_build,
        } => {
            let resolved = WardenConfig::resolve(CliOverrides {
                db_url: cli.database_url.as_deref(),
                root_path: root,
                timeout_secs: timeout,
            })?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let options = run_cmd::RunOptions {
                bind,
                port,
                build: !no_build,
            };
            let result = run_cmd::run(&resolved, db_pool.clone(), &options).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}
