use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use waystone_lib::db::EntryStatus;
use waystone_lib::{AppError, DatabaseService, DbConfig, DbName, DriverKind, MetaStore};

const EXIT_PENDING: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "waystone", about = "Local database bootstrap and migrations", version)]
struct Cli {
    /// Directory holding the database files
    #[arg(long, value_name = "PATH", global = true)]
    data_dir: Option<PathBuf>,

    /// SQLite engine to open the database with
    #[arg(long, value_name = "native|embedded", global = true)]
    driver: Option<DriverKind>,

    /// Database name (file stem under the data directory)
    #[arg(long, value_name = "NAME", global = true)]
    name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Bring the database to the newest migration
    Migrate {
        #[arg(long)]
        json: bool,
    },
    /// Show applied, pending and drifted migrations without changing anything
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List the embedded migrations
    List,
    /// Read or write device-local settings
    Meta {
        #[command(subcommand)]
        command: MetaCommands,
    },
}

#[derive(Debug, Subcommand)]
enum MetaCommands {
    Get { key: String },
    Set { key: String, value: String },
    /// Print the installation's client id, creating it if needed
    ClientId,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = config_from(&cli);
    if let Err(err) = waystone_lib::init_logging(Some(&config)) {
        eprintln!("Warning: file logging disabled: {err:#}");
    }

    match run(cli, config).await {
        Ok(code) => process::exit(code),
        Err(err) => {
            let app = error_report(&err);
            eprintln!("{}", serde_json::to_string(&app).unwrap_or_else(|_| app.to_string()));
            process::exit(1);
        }
    }
}

/// Surfaces the first `AppError` in the chain so its code leads the JSON
/// output; the anyhow context travels along as `operation`.
fn error_report(err: &anyhow::Error) -> AppError {
    match err.chain().find_map(|e| e.downcast_ref::<AppError>()) {
        Some(app) if app.to_string() == err.to_string() => app.clone(),
        Some(app) => app.clone().with_context("operation", err.to_string()),
        None => AppError::new(AppError::UNKNOWN_CODE, format!("{err:#}")),
    }
}

fn config_from(cli: &Cli) -> DbConfig {
    let mut config = DbConfig::from_env();
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
        config.in_memory = false;
    }
    if let Some(driver) = cli.driver {
        config.driver = driver;
    }
    config
}

async fn run(cli: Cli, config: DbConfig) -> Result<i32> {
    let name = match &cli.name {
        Some(raw) => DbName::new(raw.as_str())?,
        None => DbName::default(),
    };
    let mut service = DatabaseService::new(config).context("load embedded migrations")?;

    let code = match cli.command {
        Commands::List => {
            for entry in service.journal().entries() {
                println!("{}", entry.tag);
            }
            0
        }
        Commands::Migrate { json } => {
            service
                .initialize(&name)
                .await
                .with_context(|| format!("initialize database {name}"))?;
            let report = service.report().cloned().unwrap_or_default();
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for tag in &report.applied {
                    println!("applied {tag}");
                }
                for tag in &report.drifted {
                    println!("drifted {tag}");
                }
                println!("head {}", report.head.as_deref().unwrap_or("none"));
            }
            0
        }
        Commands::Status { json } => status(&service, &name, json).await?,
        Commands::Meta { command } => {
            let db = service
                .initialize(&name)
                .await
                .with_context(|| format!("initialize database {name}"))?;
            let meta = MetaStore::open(&db).await?;
            match command {
                MetaCommands::Get { key } => match meta.get(&key).await? {
                    Some(value) => println!("{value}"),
                    None => {
                        service.close().await;
                        return Ok(1);
                    }
                },
                MetaCommands::Set { key, value } => meta.set(&key, &value).await?,
                MetaCommands::ClientId => println!("{}", meta.client_id().await?),
            }
            0
        }
    };
    service.destroy().await;
    Ok(code)
}

/// Reports per-entry state without migrating or creating the database.
async fn status(service: &DatabaseService, name: &DbName, json: bool) -> Result<i32> {
    let entries = service
        .status(name)
        .await
        .with_context(|| format!("read status of database {name}"))?;

    let outstanding = entries
        .iter()
        .filter(|e| !matches!(e.status, EntryStatus::Applied))
        .count();
    if json {
        let out = json!({
            "database": name.as_str(),
            "head": service.journal().head(),
            "entries": entries,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        for entry in &entries {
            let label = match &entry.status {
                EntryStatus::Applied => "applied",
                EntryStatus::Pending => "pending",
                EntryStatus::Drifted { .. } => "drifted",
            };
            println!("{label:<8} {}", entry.tag);
        }
    }
    Ok(if outstanding > 0 { EXIT_PENDING } else { 0 })
}
