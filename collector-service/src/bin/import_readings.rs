use std::env;

use anyhow::{bail, Result};
use collector_service::{config::AppConfig, import::Importer, observability};
use monitor_client::ReadingStore;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        bail!("usage: import_readings <csv_file_path>");
    }
    let file_path = &args[1];

    let cfg = AppConfig::load()?;
    let store = ReadingStore::open(&cfg.database.path, cfg.database.max_connections).await?;

    let file = File::open(file_path).await?;
    let lines = LinesStream::new(BufReader::new(file).lines());

    let importer = Importer::new(store, cfg.import.progress_every_rows);
    let summary = importer.run(lines).await?;

    println!(
        "imported {} of {} rows ({} duplicates, {} invalid, {} distinct meters)",
        summary.rows_imported,
        summary.rows_total,
        summary.rows_skipped_duplicate,
        summary.rows_skipped_invalid,
        summary.distinct_meters_seen
    );

    Ok(())
}
