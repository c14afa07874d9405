use crate::domains::export::accumulator::BatchRecord;
use crate::domains::export::types::{ParquetCompression, WriterConfig};
use crate::errors::{ExportError, ExportResult};
use arrow::datatypes::SchemaRef;
use async_trait::async_trait;
use parquet::arrow::AsyncArrowWriter;
use parquet::basic::{BrotliLevel, Compression, GzipLevel, ZstdLevel};
use parquet::file::properties::{EnabledStatistics, WriterProperties, WriterVersion};
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tokio::fs::File;

/// What a closed sink left on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkSummary {
    pub destination: PathBuf,
    pub rows_written: usize,
    pub row_groups_written: usize,
    pub bytes_written: u64,
}

/// Destination for record batches. Each batch becomes its own row group, in
/// the order it was written.
#[async_trait]
pub trait FileSink: Send {
    async fn write_batch(&mut self, batch: BatchRecord) -> ExportResult<()>;

    /// Write the footer and make the file visible at its destination
    async fn close(self: Box<Self>) -> ExportResult<SinkSummary>;

    /// Discard everything written so far. No footer is written and no partial
    /// file is left at the destination.
    async fn abort(self: Box<Self>) -> ExportResult<()>;
}

#[async_trait]
pub trait SinkFactory: Send + Sync {
    async fn open(
        &self,
        schema: SchemaRef,
        destination: &Path,
        config: &WriterConfig,
        rows_per_group: usize,
    ) -> ExportResult<Box<dyn FileSink>>;
}

fn compression(compression: ParquetCompression) -> Compression {
    match compression {
        ParquetCompression::None => Compression::UNCOMPRESSED,
        ParquetCompression::Snappy => Compression::SNAPPY,
        ParquetCompression::Gzip => Compression::GZIP(GzipLevel::default()),
        ParquetCompression::Brotli => Compression::BROTLI(BrotliLevel::default()),
        ParquetCompression::Lz4 => Compression::LZ4_RAW,
        ParquetCompression::Zstd => Compression::ZSTD(ZstdLevel::default()),
    }
}

fn default_created_by() -> String {
    format!("pg2parquet version {}", env!("CARGO_PKG_VERSION"))
}

/// Translate writer options into Parquet writer properties.
///
/// The row group limit is the batch size, so the writer never splits a
/// batch across row groups.
pub fn writer_properties(config: &WriterConfig, rows_per_group: usize) -> WriterProperties {
    let statistics = if config.statistics_enabled {
        EnabledStatistics::Page
    } else {
        EnabledStatistics::None
    };

    let mut builder = WriterProperties::builder()
        .set_compression(compression(config.compression))
        .set_dictionary_enabled(config.dictionary_enabled)
        .set_statistics_enabled(statistics)
        .set_max_row_group_size(rows_per_group.max(1))
        .set_writer_version(WriterVersion::PARQUET_2_0)
        .set_created_by(config.created_by.clone().unwrap_or_else(default_created_by));

    if let Some(limit) = config.data_page_size_limit {
        builder = builder.set_data_page_size_limit(limit);
    }
    builder.build()
}

/// Parquet file sink over an async Arrow writer
pub struct ParquetFileSink {
    writer: AsyncArrowWriter<File>,
    destination: PathBuf,
    /// Temporary file the writer targets while staging is on
    staging: Option<TempPath>,
    rows_written: usize,
    row_groups_written: usize,
}

impl std::fmt::Debug for ParquetFileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParquetFileSink")
            .field("destination", &self.destination)
            .field("staging", &self.staging)
            .field("rows_written", &self.rows_written)
            .field("writer", &"<AsyncArrowWriter>")
            .finish()
    }
}

impl ParquetFileSink {
    pub async fn create(
        schema: SchemaRef,
        destination: &Path,
        config: &WriterConfig,
        rows_per_group: usize,
    ) -> ExportResult<Self> {
        let (file, staging) = if config.stage_output {
            let (file, path) = staging_file(destination)?;
            (file, Some(path))
        } else {
            let file = File::create(destination).await.map_err(|e| {
                ExportError::Io(format!("failed to create {}: {}", destination.display(), e))
            })?;
            (file, None)
        };

        let props = writer_properties(config, rows_per_group);
        let writer = AsyncArrowWriter::try_new(file, schema, Some(props))?;

        log::debug!(
            "Parquet sink opened for {} (staged: {})",
            destination.display(),
            staging.is_some()
        );
        Ok(Self {
            writer,
            destination: destination.to_path_buf(),
            staging,
            rows_written: 0,
            row_groups_written: 0,
        })
    }
}

/// Create `.<name>.<random>.partial` in the destination's directory, so the
/// final rename never crosses a filesystem.
fn staging_file(destination: &Path) -> ExportResult<(File, TempPath)> {
    let dir = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "export".to_string());

    let prefix = format!(".{}.", name);
    let mut builder = tempfile::Builder::new();
    builder.prefix(&prefix).suffix(".partial");
    // tempfile defaults to 0600; match `File::create`, which leaves the mode
    // to the umask
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(std::fs::Permissions::from_mode(0o666));
    }

    let staged = builder.tempfile_in(dir).map_err(|e| {
        ExportError::Io(format!("failed to create staging file in {}: {}", dir.display(), e))
    })?;

    let (file, path) = staged.into_parts();
    Ok((File::from_std(file), path))
}

#[async_trait]
impl FileSink for ParquetFileSink {
    async fn write_batch(&mut self, batch: BatchRecord) -> ExportResult<()> {
        if batch.sequence() != self.row_groups_written {
            return Err(ExportError::Internal(format!(
                "batch {} arrived out of order, expected batch {}",
                batch.sequence(),
                self.row_groups_written
            )));
        }

        let rows = batch.row_count();
        self.writer.write(batch.batch()).await?;
        // Close the row group here so row groups line up with fetches
        self.writer.flush().await?;

        self.rows_written += rows;
        self.row_groups_written += 1;
        log::debug!(
            "Wrote row group {} ({} rows) to {}",
            self.row_groups_written,
            rows,
            self.destination.display()
        );
        Ok(())
    }

    async fn close(self: Box<Self>) -> ExportResult<SinkSummary> {
        let this = *self;
        let metadata = match this.writer.close().await {
            Ok(metadata) => metadata,
            Err(e) => {
                let cleanup = discard(this.staging, &this.destination).await.err();
                return Err(ExportError::with_cleanup(e.into(), cleanup.into_iter().collect()));
            }
        };

        if let Some(staging) = this.staging {
            staging.persist(&this.destination).map_err(|e| {
                ExportError::Io(format!(
                    "failed to move staged file into {}: {}",
                    this.destination.display(),
                    e.error
                ))
            })?;
        }

        let bytes_written = tokio::fs::metadata(&this.destination).await?.len();
        log::info!(
            "Parquet file {} finalized: {} rows in {} row groups, {} bytes",
            this.destination.display(),
            metadata.num_rows,
            metadata.row_groups.len(),
            bytes_written
        );

        Ok(SinkSummary {
            destination: this.destination,
            rows_written: metadata.num_rows as usize,
            row_groups_written: metadata.row_groups.len(),
            bytes_written,
        })
    }

    async fn abort(self: Box<Self>) -> ExportResult<()> {
        let this = *self;
        // Dropping the writer skips the footer
        drop(this.writer);
        discard(this.staging, &this.destination).await?;
        log::warn!("Parquet sink for {} aborted", this.destination.display());
        Ok(())
    }
}

async fn discard(staging: Option<TempPath>, destination: &Path) -> ExportResult<()> {
    match staging {
        Some(path) => path.close().map_err(|e| {
            ExportError::Io(format!("failed to remove staging file: {}", e))
        }),
        None => match tokio::fs::remove_file(destination).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ExportError::Io(format!(
                "failed to remove partial file {}: {}",
                destination.display(),
                e
            ))),
        },
    }
}

/// Opens a `ParquetFileSink` per export
#[derive(Debug, Clone, Copy, Default)]
pub struct ParquetSinkFactory;

#[async_trait]
impl SinkFactory for ParquetSinkFactory {
    async fn open(
        &self,
        schema: SchemaRef,
        destination: &Path,
        config: &WriterConfig,
        rows_per_group: usize,
    ) -> ExportResult<Box<dyn FileSink>> {
        let sink = ParquetFileSink::create(schema, destination, config, rows_per_group).await?;
        Ok(Box::new(sink))
    }
}
