use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use archer_config::ConfigLoader;
use archer_core::{ArcherError, CoordinatorClient};
use archer_model::ScanId;
use archerctl::{NewArgs, build_request, render_scan, render_scans};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "archerctl")]
#[command(about = "Submit and inspect Archer scans")]
struct Cli {
    /// Coordinator base URL (overrides config)
    #[arg(long, global = true, env = "COORDINATOR_URL")]
    coordinator: Option<String>,

    /// Path to archer.toml
    #[arg(long, global = true, env = "ARCHER_CONFIG")]
    config: Option<PathBuf>,

    /// Print the raw JSON returned by the coordinator
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a scan
    New(NewArgs),
    /// List every scan
    List,
    /// Show a scan and its tasks
    Show {
        /// Scan id
        scan: String,
    },
    /// Check that the coordinator is up
    Health,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            // Coordinator messages are shown as the coordinator wrote them.
            match err.downcast_ref::<ArcherError>() {
                Some(ArcherError::Coordinator { message, .. }) => eprintln!("{message}"),
                _ => eprintln!("error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let client = client(&cli)?;
    match cli.command {
        Command::New(args) => {
            let request = build_request(&args)?;
            let scan = client.create_scan(&request).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&scan)?);
            } else {
                println!("{}", scan.id);
            }
        }
        Command::List => {
            let scans = client.scans().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&scans)?);
            } else {
                print!("{}", render_scans(&scans));
            }
        }
        Command::Show { scan } => {
            let id = ScanId::from_raw(scan);
            let scan = client.scan(&id).await?;
            let tasks = client.scan_tasks(&id).await?;
            if cli.json {
                let body = serde_json::json!({ "scan": scan, "tasks": tasks });
                println!("{}", serde_json::to_string_pretty(&body)?);
            } else {
                print!("{}", render_scan(&scan, &tasks));
            }
        }
        Command::Health => {
            client.health().await?;
            println!("coordinator at {} is healthy", client.base_url());
        }
    }
    Ok(())
}

fn client(cli: &Cli) -> anyhow::Result<CoordinatorClient> {
    let (url, timeout) = match &cli.coordinator {
        Some(url) => (url.clone(), Duration::from_secs(10)),
        None => {
            let loader = match &cli.config {
                Some(path) => ConfigLoader::new().with_config_path(path),
                None => ConfigLoader::new(),
            };
            let config = loader
                .load()
                .context("failed to load configuration")?
                .config;
            (config.coordinator.url, config.coordinator.timeout)
        }
    };
    CoordinatorClient::new(&url, timeout, None).context("failed to build coordinator client")
}
