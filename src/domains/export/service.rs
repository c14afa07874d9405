use crate::domains::export::accumulator::{AccumulatorSet, RecordAssembler};
use crate::domains::export::repository::{CursorOpener, CursorSession};
use crate::domains::export::schemas::map_schema;
use crate::domains::export::types::*;
use crate::domains::export::writers::{FileSink, SinkFactory};
use crate::errors::{ExportError, ExportResult};
use arrow::datatypes::SchemaRef;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Drives one table export from schema mapping to a finalized file
pub struct ExportService {
    opener: Arc<dyn CursorOpener>,
    sinks: Arc<dyn SinkFactory>,
    progress: Option<mpsc::Sender<ExportProgress>>,
}

impl std::fmt::Debug for ExportService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportService")
            .field("opener", &"<CursorOpener>")
            .field("sinks", &"<SinkFactory>")
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Bookkeeping for a single `export_table` call
struct ExportRun {
    table: String,
    state: ExportState,
    stats: ExportStats,
    batches_written: usize,
    started: Instant,
    progress: Option<mpsc::Sender<ExportProgress>>,
}

impl ExportRun {
    fn new(table: &TableRef, progress: Option<mpsc::Sender<ExportProgress>>) -> Self {
        Self {
            table: table.to_string(),
            state: ExportState::Init,
            stats: ExportStats::default(),
            batches_written: 0,
            started: Instant::now(),
            progress,
        }
    }

    fn transition(&mut self, next: ExportState) {
        log::debug!("Export of {}: {:?} -> {:?}", self.table, self.state, next);
        self.state = next;
        self.emit();
    }

    fn record_batch(&mut self, rows: usize) {
        self.batches_written += 1;
        self.stats.rows_written += rows;
        self.emit();
    }

    // Slow or gone receivers never hold up the export
    fn emit(&self) {
        if let Some(progress) = &self.progress {
            let _ = progress.try_send(ExportProgress {
                state: self.state,
                batches_written: self.batches_written,
                rows_written: self.stats.rows_written,
            });
        }
    }

    fn fail(&mut self, error: ExportError) -> ExportError {
        self.stats.duration_ms = self.started.elapsed().as_millis() as u64;
        self.transition(ExportState::Failed);
        log::log!(
            failure_level(&error),
            "Export of {} failed after {} rows: {}",
            self.table,
            self.stats.rows_written,
            error
        );
        error
    }
}

/// Cancellation is requested by the caller, so it is only a warning
fn failure_level(error: &ExportError) -> log::Level {
    match error.primary() {
        ExportError::Cancelled => log::Level::Warn,
        _ => log::Level::Error,
    }
}

impl ExportService {
    pub fn new(opener: Arc<dyn CursorOpener>, sinks: Arc<dyn SinkFactory>) -> Self {
        Self {
            opener,
            sinks,
            progress: None,
        }
    }

    /// Send progress events to `progress` while exports run
    pub fn with_progress(mut self, progress: mpsc::Sender<ExportProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Export every row of `request.table` into `request.destination`.
    ///
    /// `columns` is the table's column list in declaration order. An
    /// unsupported column fails the export before anything is opened. Once a
    /// sink and session are open, every exit path releases both; release
    /// failures are returned alongside the error that caused the release.
    pub async fn export_table(
        &self,
        request: &ExportRequest,
        columns: &[SourceColumn],
        cancel: &CancellationFlag,
    ) -> ExportResult<ExportReport> {
        let mut run = ExportRun::new(&request.table, self.progress.clone());

        if request.batch_size == 0 {
            return Err(run.fail(ExportError::InvalidConfig(
                "batch size must be greater than zero".to_string(),
            )));
        }

        let schema = map_schema(columns).map_err(|e| run.fail(e))?;
        run.transition(ExportState::SchemaMapped);
        log::info!(
            "Exporting {} ({} columns) to {} in batches of {}",
            request.table,
            schema.len(),
            request.destination.display(),
            request.batch_size
        );

        let arrow_schema = schema.to_arrow();
        let mut sink = self
            .sinks
            .open(
                arrow_schema.clone(),
                &request.destination,
                &request.writer,
                request.batch_size,
            )
            .await
            .map_err(|e| run.fail(e))?;

        let mut session = match self.opener.open(&request.table, &request.selection).await {
            Ok(session) => session,
            Err(e) => {
                let cleanup = abort_sink(sink).await.into_iter().collect();
                return Err(run.fail(ExportError::with_cleanup(e, cleanup)));
            }
        };
        run.transition(ExportState::CursorOpen);

        let pumped = pump(
            session.as_mut(),
            sink.as_mut(),
            &schema,
            arrow_schema,
            request.batch_size,
            cancel,
            &mut run,
        )
        .await;

        if let Err(e) = pumped {
            let mut cleanup = Vec::new();
            match session.close(false).await {
                Ok(()) => run.transition(ExportState::RolledBack),
                Err(rollback) => {
                    log::warn!("Rollback for {} failed: {}", request.table, rollback);
                    cleanup.push(rollback);
                }
            }
            cleanup.extend(abort_sink(sink).await);
            return Err(run.fail(ExportError::with_cleanup(e, cleanup)));
        }

        run.transition(ExportState::Finalizing);
        if let Err(e) = session.close(true).await {
            let cleanup = abort_sink(sink).await.into_iter().collect();
            return Err(run.fail(ExportError::with_cleanup(e, cleanup)));
        }
        run.transition(ExportState::Committed);

        let summary = match sink.close().await {
            Ok(summary) => summary,
            Err(e) => {
                log::warn!(
                    "Source transaction for {} committed but {} could not be finalized",
                    request.table,
                    request.destination.display()
                );
                return Err(run.fail(e));
            }
        };

        run.stats.row_groups_written = summary.row_groups_written;
        run.stats.bytes_written = summary.bytes_written;
        run.stats.duration_ms = run.started.elapsed().as_millis() as u64;
        run.transition(ExportState::Done);
        log::info!(
            "Exported {} rows of {} to {} ({} row groups, {} bytes, {} ms)",
            run.stats.rows_written,
            request.table,
            summary.destination.display(),
            run.stats.row_groups_written,
            run.stats.bytes_written,
            run.stats.duration_ms
        );

        Ok(ExportReport {
            destination: summary.destination,
            schema,
            stats: run.stats,
            state: ExportState::Done,
        })
    }
}

/// Fetch, accumulate, assemble and write until the cursor runs dry
async fn pump(
    session: &mut dyn CursorSession,
    sink: &mut dyn FileSink,
    schema: &ColumnarSchema,
    arrow_schema: SchemaRef,
    batch_size: usize,
    cancel: &CancellationFlag,
    run: &mut ExportRun,
) -> ExportResult<()> {
    let mut accumulators = AccumulatorSet::new(schema, batch_size);
    let mut assembler = RecordAssembler::new(arrow_schema, batch_size);
    run.transition(ExportState::Fetching);

    loop {
        if cancel.is_cancelled() {
            return Err(ExportError::Cancelled);
        }

        let fetched = session.fetch_next(batch_size).await?;
        run.stats.fetches += 1;
        if fetched.is_empty() {
            break;
        }

        for row in fetched.rows {
            accumulators.append_row(row)?;
        }
        let record = assembler.assemble(&mut accumulators)?;
        let rows = record.row_count();
        sink.write_batch(record).await?;
        run.record_batch(rows);
    }

    log::debug!(
        "Cursor for {} exhausted after {} fetches",
        run.table,
        run.stats.fetches
    );
    Ok(())
}

async fn abort_sink(sink: Box<dyn FileSink>) -> Option<ExportError> {
    match sink.abort().await {
        Ok(()) => None,
        Err(e) => {
            log::warn!("Failed to discard partial output: {}", e);
            Some(e)
        }
    }
}
