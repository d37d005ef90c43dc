use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dealhub_storage::{AlertStore, PgStore};
use dealhub_sync::{snapshot_catalog, DealHub, DealHubConfig, SnapshotOptions};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dealhub")]
#[command(about = "DealHub deal discovery and alert pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the ops API and, when enabled, the cron scheduler.
    Serve,
    /// Run one discovery cycle and print its report.
    Check {
        #[arg(long)]
        channel: Option<String>,
    },
    /// Ranked deals without sending anything.
    Deals {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Recently delivered alerts.
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Record a price snapshot for every listing whose price moved.
    Snapshot {
        #[arg(long)]
        dry_run: bool,
    },
    Migrate,
    /// Fetch provider usage; `--reset` starts a new monthly window.
    Providers {
        #[arg(long)]
        reset: bool,
    },
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("dealhub=info"))?;
    let json = std::env::var("DEALHUB_LOG_JSON").is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;
    let cli = Cli::parse();
    let config = DealHubConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let hub = DealHub::from_config(config).await?;
            dealhub_web::serve(hub).await?;
        }
        Commands::Check { channel } => {
            let hub = DealHub::from_config(config).await?;
            let report = hub.scheduler.trigger_check(channel.as_deref()).await?;
            info!(
                deals = report.deals_found,
                sent = report.alerts_sent,
                suppressed = report.alerts_suppressed,
                "check complete"
            );
            print_json(&report)?;
        }
        Commands::Deals { limit } => {
            let hub = DealHub::from_config(config).await?;
            print_json(&hub.pipeline.preview_deals(limit).await?)?;
        }
        Commands::History { limit } => {
            let hub = DealHub::from_config(config).await?;
            print_json(&hub.stores.alerts.recent_alerts(limit.clamp(1, 200)).await?)?;
        }
        Commands::Snapshot { dry_run } => {
            let hub = DealHub::from_config(config).await?;
            let options = SnapshotOptions {
                dry_run,
                ..SnapshotOptions::default()
            };
            let report = snapshot_catalog(hub.stores.listings.as_ref(), hub.pipeline.clock().clone(), options).await?;
            println!(
                "snapshot complete: listings={} inserted={} unchanged={} failed={} dry_run={}",
                report.listings, report.inserted, report.unchanged, report.failed, report.dry_run
            );
        }
        Commands::Migrate => {
            let url = config.database_url.as_deref().context("DATABASE_URL is required for migrate")?;
            let store = PgStore::connect(url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Providers { reset } => {
            let hub = DealHub::from_config(config).await?;
            if reset {
                hub.gateway.reset_usage();
            }
            print_json(&hub.gateway.stats())?;
        }
    }

    Ok(())
}
