//! Export a PostgreSQL table into a single Parquet file.
//!
//! Rows are read through a server-side cursor inside one read-only
//! transaction and written one row group per fetched batch.

pub mod config;
pub mod domains;
pub mod errors;

pub use config::{DatabaseConfig, ExportConfig, DEFAULT_BATCH_SIZE};
pub use domains::export::{
    CancellationFlag, ExportReport, ExportRequest, ExportService, ParquetSinkFactory, PgCatalog,
    PgCursorOpener, SchemaIntrospector, TableRef,
};
pub use errors::{ExportError, ExportResult};

/// Install `env_logger`, honouring `RUST_LOG`. Defaults to `debug` in debug
/// builds and `info` otherwise. Later calls are no-ops.
pub fn init_logging() {
    #[cfg(debug_assertions)]
    let default_level = "debug";
    #[cfg(not(debug_assertions))]
    let default_level = "info";

    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging();
        init_logging();
        log::debug!("logging initialised twice without panicking");
    }
}
