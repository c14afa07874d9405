use crate::domains::export::types::{ColumnType, RowSelection, TableRef};
use crate::domains::export::values::{FetchedBatch, SourceRow, SourceValue};
use crate::errors::{ExportError, ExportResult};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Column, Executor, Postgres, Row, Transaction, TypeInfo, ValueRef};
use uuid::Uuid;

/// Default prefix for server-side cursor names
pub const DEFAULT_CURSOR_PREFIX: &str = "export_cursor";

/// Opens read-only cursor sessions over a single table
#[async_trait]
pub trait CursorOpener: Send + Sync {
    async fn open(
        &self,
        table: &TableRef,
        selection: &RowSelection,
    ) -> ExportResult<Box<dyn CursorSession>>;
}

/// A read-only transaction with one declared cursor.
///
/// `close` consumes the session, so a closed session can never be fetched
/// from again. Exactly one of commit or rollback happens per session.
#[async_trait]
pub trait CursorSession: Send {
    /// Fetch at most `batch_size` rows. Fewer rows, or none, means the
    /// cursor is exhausted.
    async fn fetch_next(&mut self, batch_size: usize) -> ExportResult<FetchedBatch>;

    /// Close the cursor, then commit when `commit` is set and no earlier
    /// statement failed; roll back otherwise.
    async fn close(self: Box<Self>, commit: bool) -> ExportResult<()>;
}

/// Check that an unquoted identifier is safe to splice into a statement
pub fn validate_cursor_prefix(prefix: &str) -> ExportResult<()> {
    let mut chars = prefix.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);

    // Leave room for the `_<uuid>` suffix within the 63 byte identifier limit
    if !valid_start
        || prefix.len() > 30
        || !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(ExportError::InvalidConfig(format!(
            "cursor prefix '{}' must be 1-30 ASCII letters, digits or underscores and start with a letter",
            prefix
        )));
    }
    Ok(())
}

pub fn declare_cursor_sql(cursor_name: &str, table: &TableRef, selection: &RowSelection) -> String {
    format!(
        "DECLARE {} NO SCROLL CURSOR FOR {}",
        cursor_name,
        selection.select_sql(table)
    )
}

pub fn fetch_sql(cursor_name: &str, batch_size: usize) -> String {
    format!("FETCH FORWARD {} FROM {}", batch_size, cursor_name)
}

pub fn close_cursor_sql(cursor_name: &str) -> String {
    format!("CLOSE {}", cursor_name)
}

/// `CursorOpener` backed by a PostgreSQL pool
pub struct PgCursorOpener {
    pool: PgPool,
    cursor_prefix: String,
}

impl PgCursorOpener {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cursor_prefix: DEFAULT_CURSOR_PREFIX.to_string(),
        }
    }

    pub fn with_cursor_prefix(pool: PgPool, cursor_prefix: &str) -> ExportResult<Self> {
        validate_cursor_prefix(cursor_prefix)?;
        Ok(Self {
            pool,
            cursor_prefix: cursor_prefix.to_string(),
        })
    }

    fn next_cursor_name(&self) -> String {
        format!("{}_{}", self.cursor_prefix, Uuid::new_v4().simple())
    }
}

#[async_trait]
impl CursorOpener for PgCursorOpener {
    async fn open(
        &self,
        table: &TableRef,
        selection: &RowSelection,
    ) -> ExportResult<Box<dyn CursorSession>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ExportError::Connection(format!("failed to start transaction: {}", e)))?;

        // Must be the first statement of the transaction
        let read_only = (&mut *tx)
            .execute("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .await;
        if let Err(e) = read_only {
            rollback_quietly(tx).await;
            return Err(ExportError::Transaction(format!(
                "failed to make transaction read-only: {}",
                e
            )));
        }

        let cursor_name = self.next_cursor_name();
        let declare = declare_cursor_sql(&cursor_name, table, selection);
        let declared = (&mut *tx).execute(declare.as_str()).await;
        if let Err(e) = declared {
            rollback_quietly(tx).await;
            return Err(ExportError::Transaction(format!(
                "failed to declare cursor for {}: {}",
                table, e
            )));
        }

        log::info!("Cursor {} declared for table {}", cursor_name, table);
        Ok(Box::new(PgCursorSession {
            tx,
            cursor_name,
            table: table.to_string(),
            poisoned: false,
            fetches: 0,
        }))
    }
}

async fn rollback_quietly(tx: Transaction<'static, Postgres>) {
    if let Err(e) = tx.rollback().await {
        log::warn!("Rollback after failed cursor setup also failed: {}", e);
    }
}

/// Cursor session over a live PostgreSQL transaction
pub struct PgCursorSession {
    tx: Transaction<'static, Postgres>,
    cursor_name: String,
    table: String,
    poisoned: bool,
    fetches: usize,
}

impl PgCursorSession {
    async fn rollback(self) -> ExportResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| ExportError::Transaction(format!("rollback failed: {}", e)))?;
        log::info!("Transaction rolled back for table {}", self.table);
        Ok(())
    }
}

#[async_trait]
impl CursorSession for PgCursorSession {
    async fn fetch_next(&mut self, batch_size: usize) -> ExportResult<FetchedBatch> {
        self.fetches += 1;
        let sql = fetch_sql(&self.cursor_name, batch_size);
        let rows = match (&mut *self.tx).fetch_all(sql.as_str()).await {
            Ok(rows) => rows,
            Err(e) => {
                self.poisoned = true;
                return Err(ExportError::Transaction(format!(
                    "failed to fetch from cursor {}: {}",
                    self.cursor_name, e
                )));
            }
        };

        log::debug!(
            "Fetch {} returned {} rows from table {}",
            self.fetches,
            rows.len(),
            self.table
        );

        let decoded = rows
            .iter()
            .map(decode_row)
            .collect::<ExportResult<Vec<_>>>()?;
        Ok(FetchedBatch::from_rows(decoded, batch_size))
    }

    async fn close(mut self: Box<Self>, commit: bool) -> ExportResult<()> {
        if self.poisoned {
            // The server already aborted the transaction, CLOSE would fail too
            (*self).rollback().await?;
            return if commit {
                Err(ExportError::Transaction(
                    "cannot commit a session after a failed statement".to_string(),
                ))
            } else {
                Ok(())
            };
        }

        let close = close_cursor_sql(&self.cursor_name);
        let closed = (&mut *self.tx).execute(close.as_str()).await;
        if let Err(e) = closed {
            let session = *self;
            let table = session.table.clone();
            if let Err(rollback) = session.rollback().await {
                log::warn!("Rollback after failed CLOSE for {} failed: {}", table, rollback);
            }
            return Err(ExportError::Transaction(format!("failed to close cursor: {}", e)));
        }

        let session = *self;
        if !commit {
            return session.rollback().await;
        }

        session
            .tx
            .commit()
            .await
            .map_err(|e| ExportError::Commit(e.to_string()))?;
        log::info!("Transaction committed for table {}", session.table);
        Ok(())
    }
}

/// How cells of one server type are decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Numeric,
    Text,
    Bytes,
    Bool,
    Date,
    Timestamp,
    TimestampTz,
}

impl CellKind {
    /// Resolve a type name as sqlx reports it. `char(n)` is `CHAR` here,
    /// not `BPCHAR`.
    pub fn from_type_name(type_name: &str) -> Option<Self> {
        let kind = match type_name {
            "INT2" => CellKind::Int16,
            "INT4" => CellKind::Int32,
            "INT8" => CellKind::Int64,
            "FLOAT4" => CellKind::Float32,
            "FLOAT8" => CellKind::Float64,
            "NUMERIC" => CellKind::Numeric,
            "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" => CellKind::Text,
            "BYTEA" => CellKind::Bytes,
            "BOOL" => CellKind::Bool,
            "DATE" => CellKind::Date,
            "TIMESTAMP" => CellKind::Timestamp,
            "TIMESTAMPTZ" => CellKind::TimestampTz,
            _ => return None,
        };
        Some(kind)
    }

    /// Column type the decoded values are accepted by
    pub fn column_type(&self) -> ColumnType {
        match self {
            CellKind::Int16 => ColumnType::Int16,
            CellKind::Int32 => ColumnType::Int32,
            CellKind::Int64 => ColumnType::Int64,
            CellKind::Float32 => ColumnType::Float32,
            CellKind::Float64 | CellKind::Numeric => ColumnType::Float64,
            CellKind::Text => ColumnType::Utf8,
            CellKind::Bytes => ColumnType::Binary,
            CellKind::Bool => ColumnType::Bool,
            CellKind::Date => ColumnType::Date32,
            CellKind::Timestamp | CellKind::TimestampTz => ColumnType::TimestampMicros,
        }
    }
}

/// Parse NUMERIC text output as a double. Precision beyond ~15 digits is
/// lost; `NaN`, `Infinity` and `-Infinity` map to their float counterparts.
pub fn parse_numeric(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok()
}

fn decode_error(column: &str, type_name: &str, error: sqlx::Error) -> ExportError {
    ExportError::type_mismatch(column, type_name, format!("undecodable value ({})", error))
}

fn decode_row(row: &PgRow) -> ExportResult<SourceRow> {
    (0..row.len()).map(|index| decode_value(row, index)).collect()
}

/// Decode one cell by the type the server reports for it. Values of types the
/// decoder does not know come back as `SourceValue::Unrecognized`, leaving the
/// accumulator to reject them.
fn decode_value(row: &PgRow, index: usize) -> ExportResult<Option<SourceValue>> {
    let column = &row.columns()[index];
    let name = column.name();
    let type_name = column.type_info().name().to_string();

    let raw = row
        .try_get_raw(index)
        .map_err(|e| decode_error(name, &type_name, e))?;
    if raw.is_null() {
        return Ok(None);
    }

    let kind = match CellKind::from_type_name(&type_name) {
        Some(kind) => kind,
        None => return Ok(Some(SourceValue::Unrecognized(type_name))),
    };

    let decode = |e| decode_error(name, &type_name, e);
    let value = match kind {
        CellKind::Int16 => SourceValue::Int16(row.try_get::<i16, _>(index).map_err(decode)?),
        CellKind::Int32 => SourceValue::Int32(row.try_get::<i32, _>(index).map_err(decode)?),
        CellKind::Int64 => SourceValue::Int64(row.try_get::<i64, _>(index).map_err(decode)?),
        CellKind::Float32 => SourceValue::Float32(row.try_get::<f32, _>(index).map_err(decode)?),
        CellKind::Float64 => SourceValue::Float64(row.try_get::<f64, _>(index).map_err(decode)?),
        CellKind::Numeric => {
            // Simple query protocol, so the cell is NUMERIC text output
            let text = row.try_get_unchecked::<&str, _>(index).map_err(decode)?;
            let float = parse_numeric(text).ok_or_else(|| {
                ExportError::type_mismatch(name, "NUMERIC", format!("unparseable numeric '{}'", text))
            })?;
            SourceValue::Float64(float)
        }
        CellKind::Text => SourceValue::Text(row.try_get::<String, _>(index).map_err(decode)?),
        CellKind::Bytes => SourceValue::Bytes(row.try_get::<Vec<u8>, _>(index).map_err(decode)?),
        CellKind::Bool => SourceValue::Bool(row.try_get::<bool, _>(index).map_err(decode)?),
        CellKind::Date => SourceValue::Date(row.try_get::<NaiveDate, _>(index).map_err(decode)?),
        CellKind::Timestamp => {
            SourceValue::Timestamp(row.try_get::<NaiveDateTime, _>(index).map_err(decode)?)
        }
        CellKind::TimestampTz => {
            let instant = row.try_get::<DateTime<Utc>, _>(index).map_err(decode)?;
            SourceValue::Timestamp(instant.naive_utc())
        }
    };
    Ok(Some(value))
}
