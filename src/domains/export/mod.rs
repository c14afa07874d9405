pub mod accumulator;
pub mod catalog;
pub mod repository;
pub mod schemas;
pub mod service;
pub mod types;
pub mod values;
pub mod writers;

pub use accumulator::{AccumulatorSet, BatchRecord, ColumnAccumulator, RecordAssembler};
pub use catalog::{PgCatalog, SchemaIntrospector};
pub use repository::{CursorOpener, CursorSession, PgCursorOpener, PgCursorSession};
pub use schemas::{map_schema, map_type};
pub use service::ExportService;
pub use types::{
    CancellationFlag, ColumnType, ColumnarField, ColumnarSchema, ExportProgress, ExportReport,
    ExportRequest, ExportState, ExportStats, ParquetCompression, RowSelection, SourceColumn,
    TableRef, WriterConfig,
};
pub use values::{FetchedBatch, SourceRow, SourceValue};
pub use writers::{FileSink, ParquetFileSink, ParquetSinkFactory, SinkFactory, SinkSummary};
