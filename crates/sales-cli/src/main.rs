use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sales_refresh::{RefreshConfig, RefreshOutcome};
use sales_storage::{run_migrations, PgSalesStore};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "sales-cli")]
#[command(about = "Sales dataset refresh service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Replace the dataset from a CSV export and wait for the result.
    Refresh {
        #[arg(long)]
        file_path: Option<PathBuf>,
    },
    /// Print the most recent refresh log rows.
    Status,
    Migrate,
    /// Serve HTTP and run the refresh schedule.
    Serve,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = RefreshConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Refresh { file_path } => {
            let service = sales_refresh::connect_service(&config).await?;
            let source = file_path.unwrap_or_else(|| config.source_path.clone());
            match service.run_refresh(&source).await {
                RefreshOutcome::Succeeded {
                    log_id,
                    records_count,
                    summary,
                } => {
                    println!(
                        "refresh complete: log_id={} records={} orders={} malformed={} warnings={}",
                        log_id,
                        summary.records,
                        records_count,
                        summary.malformed_records,
                        summary.field_warnings
                    );
                }
                RefreshOutcome::Failed { log_id, error } => {
                    bail!("refresh failed (log_id={log_id:?}): {error}");
                }
            }
        }
        Commands::Status => {
            let service = sales_refresh::connect_service(&config).await?;
            let logs = service.status().await.context("loading refresh status")?;
            for log in logs {
                println!(
                    "{}\t{}\t{}\t{}\t{}\t{}",
                    log.id,
                    log.status,
                    log.start_time.to_rfc3339(),
                    log.end_time.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string()),
                    log.records_count,
                    log.error_message
                );
            }
        }
        Commands::Migrate => {
            let store = PgSalesStore::connect(&config.database_url, config.database_max_connections)
                .await
                .context("connecting to database")?;
            run_migrations(store.pool())
                .await
                .context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let service = sales_refresh::connect_service(&config).await?;
            let scheduler = sales_refresh::build_scheduler(service.clone(), &config).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.refresh_cron, "refresh scheduler started");
            }
            sales_web::serve(service, &config).await?;
        }
    }

    Ok(())
}
