mod commands;

use clap::{Parser, Subcommand};
use pricetrack_core::{CronExpression, StoreBackend};
use pricetrack_db::Stores;
use pricetrack_fetcher::HttpPriceFetcher;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "pricetrack-cli")]
#[command(about = "Price tracking command line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply pending database migrations.
    Migrate,
    /// Fetch a product page and record its current price.
    Ingest { url: String },
    /// Start a recurring refresh for a product.
    ///
    /// Only the schedule row is written here; a running server picks it up on
    /// its next reconcile pass.
    Track {
        product_id: Uuid,
        /// Five-field cron expression, evaluated in UTC.
        #[arg(long)]
        cron: Option<CronExpression>,
    },
    /// Stop the product's active schedule.
    Untrack { product_id: Uuid },
    /// Print every product with its latest price movement.
    Report {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = pricetrack_core::load_app_config()?;
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.log_level.clone()))?;
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let Some(command) = cli.command else {
        println!("pricetrack-cli: no command given (try --help)");
        return Ok(());
    };

    if config.store_backend == StoreBackend::Memory {
        anyhow::bail!("the CLI needs a durable store; set PRICETRACK_STORE_BACKEND=postgres");
    }
    let pool = pricetrack_db::connect_pool(
        &config.database_url,
        pricetrack_db::PoolConfig::from_app_config(&config),
    )
    .await?;

    let stores = Stores::postgres(pool.clone());
    match command {
        Commands::Migrate => {
            let applied = pricetrack_db::run_migrations(&pool).await?;
            println!("migrations up to date ({applied} applied)");
        }
        Commands::Ingest { url } => {
            let fetcher = HttpPriceFetcher::new(
                config.fetch_timeout_secs,
                &config.fetch_user_agent,
                config.fetch_max_retries,
                config.fetch_retry_backoff_base_secs,
            )?;
            let outcome = commands::run_ingest(&stores, &fetcher, &url).await?;
            let verb = if outcome.created { "created" } else { "updated" };
            println!(
                "{verb} {} ({}) at {}",
                outcome.product.name, outcome.product.id, outcome.observation.price
            );
        }
        Commands::Track { product_id, cron } => {
            let cron = cron.unwrap_or_else(|| config.default_cron.clone());
            let schedule = commands::run_track(&stores, product_id, cron).await?;
            println!(
                "tracking {product_id} on \"{}\" (schedule {})",
                schedule.cron_expression, schedule.id
            );
        }
        Commands::Untrack { product_id } => {
            let previous = commands::run_untrack(&stores, product_id).await?;
            println!("stopped {product_id} (was {previous})");
        }
        Commands::Report { json } => {
            let rows = stores.prices.list_all_with_analytics().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                println!("no products");
            } else {
                for row in &rows {
                    println!("{}", commands::format_report_row(row));
                }
            }
        }
    }

    Ok(())
}
