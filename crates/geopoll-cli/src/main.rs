use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use geopoll_core::Category;
use geopoll_sync::{Dispatcher, PollConfig, PollRunSummary};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "geopoll")]
#[command(about = "Polls geospatial catalogs and announces newly published datasets")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one poll over every target.
    Poll {
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Create every category table.
    Init,
    /// Print the stored records of one category (name or table name).
    List { category: Category },
    /// Poll on GEOPOLL_SCHEDULE_CRON until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Poll { json: false }) {
        Commands::Poll { json } => {
            let summary = geopoll_sync::run_poll_once_from_env().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
        }
        Commands::Init => {
            let dispatcher = Dispatcher::from_config(&PollConfig::from_env()).await?;
            dispatcher.init_schema().await?;
            println!("created tables: {}", table_names().join(", "));
        }
        Commands::List { category } => {
            let dispatcher = Dispatcher::from_config(&PollConfig::from_env()).await?;
            let records = dispatcher
                .store()
                .list(category)
                .await
                .with_context(|| format!("listing {}", category.table_name()))?;
            for record in records {
                println!("{}\t{}\t{}", record.id, record.title, record.url);
            }
        }
        Commands::Schedule => {
            geopoll_sync::run_scheduled_from_env().await?;
        }
    }

    Ok(())
}

fn table_names() -> Vec<&'static str> {
    Category::ALL.iter().map(|c| c.table_name()).collect()
}

fn print_summary(summary: &PollRunSummary) {
    let notifications = summary.notifications();
    println!(
        "poll complete: run_id={} items={} new={} sent={} skipped={} failed={}",
        summary.run_id,
        summary.total_items(),
        summary.total_novel(),
        notifications.sent,
        notifications.skipped,
        notifications.failed
    );
    for target in &summary.targets {
        println!(
            "  {:<9} items={} new={} persisted={} malformed={}",
            target.category.to_string(),
            target.items,
            target.novel,
            target.persisted,
            target.malformed_skipped
        );
    }
}
