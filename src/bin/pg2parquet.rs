use clap::Parser;
use log::{error, info, warn};
use pg_parquet_export::domains::export::ParquetCompression;
use pg_parquet_export::{
    init_logging, CancellationFlag, DatabaseConfig, ExportConfig, ExportResult, ExportService,
    ParquetSinkFactory, PgCatalog, PgCursorOpener, SchemaIntrospector, TableRef,
    DEFAULT_BATCH_SIZE,
};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

/// Export one PostgreSQL table to a Parquet file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Schema containing the table
    schema: String,
    /// Table to export
    table: String,
    /// Destination Parquet file
    output: PathBuf,

    /// Rows per fetch and per row group
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,
    /// none, snappy, gzip, lz4, zstd or brotli
    #[arg(long)]
    compression: Option<ParquetCompression>,
    /// JSON file with Parquet writer options
    #[arg(long)]
    writer_config: Option<PathBuf>,
    /// Write the destination directly instead of renaming a finished temp file
    #[arg(long)]
    no_staging: bool,
    /// Overrides DATABASE_URL and the DB_* variables
    #[arg(long)]
    database_url: Option<String>,
}

fn export_config(args: &CliArgs) -> ExportResult<ExportConfig> {
    let mut config = ExportConfig {
        batch_size: args.batch_size,
        ..ExportConfig::default()
    };
    if let Some(path) = &args.writer_config {
        config.writer = ExportConfig::load_writer_config(path)?;
    }
    if let Some(compression) = args.compression {
        config.writer.compression = compression;
    }
    if args.no_staging {
        config.writer.stage_output = false;
    }
    config.validate()?;
    Ok(config)
}

async fn run(args: CliArgs) -> ExportResult<PathBuf> {
    let config = export_config(&args)?;

    let mut database = DatabaseConfig::from_env()?;
    if let Some(url) = args.database_url.clone() {
        database.url = Some(url);
    }
    let pool = database.connect().await?;

    let table = TableRef::new(&args.schema, &args.table);
    let columns = PgCatalog::new(pool.clone()).table_columns(&table).await?;

    let cancel = CancellationFlag::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current batch");
            on_interrupt.cancel();
        }
    });

    let opener = PgCursorOpener::with_cursor_prefix(pool.clone(), &config.cursor_prefix)?;
    let service = ExportService::new(Arc::new(opener), Arc::new(ParquetSinkFactory));
    let request = config.request(table, args.output.clone());

    let report = service.export_table(&request, &columns, &cancel).await;
    pool.close().await;

    let report = report?;
    info!(
        "{} rows in {} row groups, {} bytes",
        report.stats.rows_written, report.stats.row_groups_written, report.stats.bytes_written
    );
    Ok(report.destination)
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    init_logging();

    let args = CliArgs::parse();
    match run(args).await {
        Ok(destination) => {
            println!("Parquet file written to {}", destination.display());
        }
        Err(e) => {
            error!("Export failed: {}", e);
            eprintln!("pg2parquet: {}", e);
            process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_writer_options() {
        let args = CliArgs::parse_from([
            "pg2parquet",
            "public",
            "orders",
            "orders.parquet",
            "--batch-size",
            "500",
            "--compression",
            "zstd",
            "--no-staging",
        ]);

        let config = export_config(&args).unwrap();
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.writer.compression, ParquetCompression::Zstd);
        assert!(!config.writer.stage_output);
    }

    #[test]
    fn test_cli_defaults() {
        let args = CliArgs::parse_from(["pg2parquet", "public", "orders", "out.parquet"]);
        let config = export_config(&args).unwrap();
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert!(config.writer.stage_output);
        assert_eq!(args.output, PathBuf::from("out.parquet"));
    }

    #[test]
    fn test_cli_rejects_bad_input() {
        assert!(CliArgs::try_parse_from(["pg2parquet", "public", "orders"]).is_err());
        assert!(CliArgs::try_parse_from([
            "pg2parquet", "public", "orders", "o.parquet", "--compression", "lzo"
        ])
        .is_err());

        let zero = CliArgs::parse_from(["pg2parquet", "public", "orders", "o.parquet", "--batch-size", "0"]);
        assert!(export_config(&zero).is_err());
    }
}
