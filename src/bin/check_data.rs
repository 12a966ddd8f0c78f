//! Inspect what the store holds.
//!
//! `check_data series --category shares --entity SBER --from 2024-01-01 --till 2024-01-31`
//! `check_data status`

use anyhow::anyhow;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use market_ingest_lib::config::IngestConfig;
use market_ingest_lib::db::{self, SeriesStore, Store};
use market_ingest_lib::models::{ActionRecord, Category, ElectricityRecord, EntityDescriptor, RecordKind};
use market_ingest_lib::init_tracing;

#[derive(Parser)]
#[command(name = "check_data", about = "Read stored series and run statuses")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print stored records for one entity over an inclusive day range.
    Series {
        #[arg(long)]
        category: String,

        #[arg(long)]
        entity: String,

        #[arg(long)]
        from: NaiveDate,

        #[arg(long)]
        till: NaiveDate,
    },
    /// Print the last recorded outcome per entity.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = IngestConfig::from_env()?;
    let pool = db::init(&cfg.database).await?;

    let output = match cli.command {
        Commands::Series { category, entity, from, till } => {
            let category =
                Category::parse(&category).ok_or_else(|| anyhow!("unknown category '{}'", category))?;
            let table = EntityDescriptor::new(entity, category).table_name();
            match category.record_kind() {
                RecordKind::Action => {
                    let rows = Store::<ActionRecord>::new(pool.clone()).select_range(&table, from, till).await?;
                    eprintln!("{} rows in {}", rows.len(), table);
                    serde_json::to_string_pretty(&rows)?
                }
                RecordKind::Electricity => {
                    let rows = Store::<ElectricityRecord>::new(pool.clone())
                        .select_range(&table, from, till)
                        .await?;
                    eprintln!("{} rows in {}", rows.len(), table);
                    serde_json::to_string_pretty(&rows)?
                }
            }
        }
        Commands::Status => serde_json::to_string_pretty(&db::get_statuses(&pool).await?)?,
    };

    println!("{}", output);
    pool.close().await;
    Ok(())
}
