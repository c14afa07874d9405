use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One column of the source table as reported by schema introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceColumn {
    pub name: String,
    pub source_type: String,
    pub nullable: bool,
}

impl SourceColumn {
    pub fn new(name: &str, source_type: &str, nullable: bool) -> Self {
        Self {
            name: name.to_string(),
            source_type: source_type.to_string(),
            nullable,
        }
    }
}

/// Columnar types a source column can be mapped onto
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Utf8,
    Binary,
    Bool,
    Date32,
    TimestampMicros,
}

impl ColumnType {
    /// Arrow type used for this column in the output file
    pub fn data_type(&self) -> DataType {
        match self {
            ColumnType::Int16 => DataType::Int16,
            ColumnType::Int32 => DataType::Int32,
            ColumnType::Int64 => DataType::Int64,
            ColumnType::Float32 => DataType::Float32,
            ColumnType::Float64 => DataType::Float64,
            ColumnType::Utf8 => DataType::Utf8,
            ColumnType::Binary => DataType::Binary,
            ColumnType::Bool => DataType::Boolean,
            ColumnType::Date32 => DataType::Date32,
            // Timezone is dropped, values are UTC wall clock
            ColumnType::TimestampMicros => DataType::Timestamp(TimeUnit::Microsecond, None),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnarField {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

/// Ordered columnar schema. Field positions match the source columns it was
/// mapped from one to one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnarSchema {
    fields: Vec<ColumnarField>,
}

impl ColumnarSchema {
    pub fn new(fields: Vec<ColumnarField>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[ColumnarField] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn to_arrow(&self) -> SchemaRef {
        let fields: Vec<Field> = self
            .fields
            .iter()
            .map(|f| Field::new(&f.name, f.column_type.data_type(), f.nullable))
            .collect();
        Arc::new(Schema::new(fields))
    }
}

/// Schema-qualified table name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: &str, table: &str) -> Self {
        Self {
            schema: schema.to_string(),
            table: table.to_string(),
        }
    }

    /// Double-quoted `"schema"."table"`, safe to splice into SQL text.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", quote_identifier(&self.schema), quote_identifier(&self.table))
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Quote an SQL identifier, doubling any embedded quote characters
pub fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Which rows of the table are exported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RowSelection {
    #[default]
    FullTable,
}

impl RowSelection {
    pub fn select_sql(&self, table: &TableRef) -> String {
        match self {
            RowSelection::FullTable => format!("SELECT * FROM {}", table.qualified_name()),
        }
    }
}

/// Parquet compression options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParquetCompression {
    None,
    #[default]
    Snappy,
    Gzip,
    Brotli,
    Lz4,
    Zstd,
}

impl FromStr for ParquetCompression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "uncompressed" => Ok(Self::None),
            "snappy" => Ok(Self::Snappy),
            "gzip" => Ok(Self::Gzip),
            "brotli" => Ok(Self::Brotli),
            "lz4" => Ok(Self::Lz4),
            "zstd" => Ok(Self::Zstd),
            other => Err(format!("unknown compression '{}'", other)),
        }
    }
}

/// Writer options handed through to the Parquet writer untouched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WriterConfig {
    pub compression: ParquetCompression,
    pub dictionary_enabled: bool,
    pub statistics_enabled: bool,
    pub data_page_size_limit: Option<usize>,
    pub created_by: Option<String>,
    /// Write into a temporary file next to the destination and rename it into
    /// place once the footer is written.
    pub stage_output: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            compression: ParquetCompression::default(),
            dictionary_enabled: true,
            statistics_enabled: true,
            data_page_size_limit: None,
            created_by: None,
            stage_output: true,
        }
    }
}

/// Everything the orchestrator needs to export one table
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub table: TableRef,
    pub selection: RowSelection,
    pub destination: PathBuf,
    pub batch_size: usize,
    pub writer: WriterConfig,
}

/// Orchestrator states, in the order an export walks through them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportState {
    Init,
    SchemaMapped,
    CursorOpen,
    Fetching,
    Finalizing,
    Committed,
    RolledBack,
    Done,
    Failed,
}

/// Export statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportStats {
    pub rows_written: usize,
    pub row_groups_written: usize,
    pub fetches: usize,
    pub bytes_written: u64,
    pub duration_ms: u64,
}

/// Summary of a completed export
#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub destination: PathBuf,
    pub schema: ColumnarSchema,
    pub stats: ExportStats,
    pub state: ExportState,
}

/// Progress event emitted while an export runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportProgress {
    pub state: ExportState,
    pub batches_written: usize,
    pub rows_written: usize,
}

/// Cooperative cancellation shared between the caller and a running export.
/// Checked once per batch boundary.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
