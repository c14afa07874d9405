use crate::domains::export::types::{ColumnType, ColumnarField, ColumnarSchema};
use crate::domains::export::values::{SourceRow, SourceValue};
use crate::errors::{ExportError, ExportResult};
use arrow::array::*;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use chrono::Datelike;
use std::sync::Arc;

/// Days from 0001-01-01 (CE) to 1970-01-01
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Average bytes reserved per value for variable width columns
const VARIABLE_WIDTH_HINT: usize = 32;

/// Upper bound on rows reserved up front; builders grow past it on demand
const MAX_PREALLOCATED_ROWS: usize = 8192;

/// Typed Arrow builder for one field, chosen once from the field's column type.
pub enum ColumnAccumulator {
    Int16(Int16Builder),
    Int32(Int32Builder),
    Int64(Int64Builder),
    Float32(Float32Builder),
    Float64(Float64Builder),
    Utf8(StringBuilder),
    Binary(BinaryBuilder),
    Bool(BooleanBuilder),
    Date32(Date32Builder),
    TimestampMicros(TimestampMicrosecondBuilder),
}

impl ColumnAccumulator {
    pub fn for_type(column_type: ColumnType, capacity: usize) -> Self {
        let capacity = capacity.min(MAX_PREALLOCATED_ROWS);
        match column_type {
            ColumnType::Int16 => Self::Int16(Int16Builder::with_capacity(capacity)),
            ColumnType::Int32 => Self::Int32(Int32Builder::with_capacity(capacity)),
            ColumnType::Int64 => Self::Int64(Int64Builder::with_capacity(capacity)),
            ColumnType::Float32 => Self::Float32(Float32Builder::with_capacity(capacity)),
            ColumnType::Float64 => Self::Float64(Float64Builder::with_capacity(capacity)),
            ColumnType::Utf8 => Self::Utf8(StringBuilder::with_capacity(
                capacity,
                capacity.saturating_mul(VARIABLE_WIDTH_HINT),
            )),
            ColumnType::Binary => Self::Binary(BinaryBuilder::with_capacity(
                capacity,
                capacity.saturating_mul(VARIABLE_WIDTH_HINT),
            )),
            ColumnType::Bool => Self::Bool(BooleanBuilder::with_capacity(capacity)),
            ColumnType::Date32 => Self::Date32(Date32Builder::with_capacity(capacity)),
            ColumnType::TimestampMicros => {
                Self::TimestampMicros(TimestampMicrosecondBuilder::with_capacity(capacity))
            }
        }
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            Self::Int16(_) => ColumnType::Int16,
            Self::Int32(_) => ColumnType::Int32,
            Self::Int64(_) => ColumnType::Int64,
            Self::Float32(_) => ColumnType::Float32,
            Self::Float64(_) => ColumnType::Float64,
            Self::Utf8(_) => ColumnType::Utf8,
            Self::Binary(_) => ColumnType::Binary,
            Self::Bool(_) => ColumnType::Bool,
            Self::Date32(_) => ColumnType::Date32,
            Self::TimestampMicros(_) => ColumnType::TimestampMicros,
        }
    }

    /// Append a value whose runtime type must match the column type exactly.
    /// A mismatching value is handed back untouched.
    pub fn append(&mut self, value: SourceValue) -> Result<(), SourceValue> {
        match (self, value) {
            (Self::Int16(b), SourceValue::Int16(v)) => b.append_value(v),
            (Self::Int32(b), SourceValue::Int32(v)) => b.append_value(v),
            (Self::Int64(b), SourceValue::Int64(v)) => b.append_value(v),
            (Self::Float32(b), SourceValue::Float32(v)) => b.append_value(v),
            (Self::Float64(b), SourceValue::Float64(v)) => b.append_value(v),
            (Self::Utf8(b), SourceValue::Text(v)) => b.append_value(v),
            (Self::Binary(b), SourceValue::Bytes(v)) => b.append_value(v),
            (Self::Bool(b), SourceValue::Bool(v)) => b.append_value(v),
            (Self::Date32(b), SourceValue::Date(v)) => {
                b.append_value(v.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE)
            }
            (Self::TimestampMicros(b), SourceValue::Timestamp(v)) => {
                b.append_value(v.and_utc().timestamp_micros())
            }
            (_, rejected) => return Err(rejected),
        }
        Ok(())
    }

    pub fn append_null(&mut self) {
        match self {
            Self::Int16(b) => b.append_null(),
            Self::Int32(b) => b.append_null(),
            Self::Int64(b) => b.append_null(),
            Self::Float32(b) => b.append_null(),
            Self::Float64(b) => b.append_null(),
            Self::Utf8(b) => b.append_null(),
            Self::Binary(b) => b.append_null(),
            Self::Bool(b) => b.append_null(),
            Self::Date32(b) => b.append_null(),
            Self::TimestampMicros(b) => b.append_null(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Int16(b) => b.len(),
            Self::Int32(b) => b.len(),
            Self::Int64(b) => b.len(),
            Self::Float32(b) => b.len(),
            Self::Float64(b) => b.len(),
            Self::Utf8(b) => b.len(),
            Self::Binary(b) => b.len(),
            Self::Bool(b) => b.len(),
            Self::Date32(b) => b.len(),
            Self::TimestampMicros(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop anything buffered and reserve room for the next batch
    pub fn reset(&mut self, capacity_hint: usize) {
        *self = Self::for_type(self.column_type(), capacity_hint);
    }

    /// Snapshot the buffered values as an immutable array, leaving the
    /// accumulator empty.
    pub fn build(&mut self) -> ArrayRef {
        match self {
            Self::Int16(b) => Arc::new(b.finish()),
            Self::Int32(b) => Arc::new(b.finish()),
            Self::Int64(b) => Arc::new(b.finish()),
            Self::Float32(b) => Arc::new(b.finish()),
            Self::Float64(b) => Arc::new(b.finish()),
            Self::Utf8(b) => Arc::new(b.finish()),
            Self::Binary(b) => Arc::new(b.finish()),
            Self::Bool(b) => Arc::new(b.finish()),
            Self::Date32(b) => Arc::new(b.finish()),
            Self::TimestampMicros(b) => Arc::new(b.finish()),
        }
    }
}

/// One accumulator per schema field, exclusively owned by a single export.
pub struct AccumulatorSet {
    fields: Vec<ColumnarField>,
    accumulators: Vec<ColumnAccumulator>,
    rows: usize,
}

impl AccumulatorSet {
    pub fn new(schema: &ColumnarSchema, capacity: usize) -> Self {
        let accumulators = schema
            .fields()
            .iter()
            .map(|field| ColumnAccumulator::for_type(field.column_type, capacity))
            .collect();

        Self {
            fields: schema.fields().to_vec(),
            accumulators,
            rows: 0,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows
    }

    /// Push one fetched row into the accumulators. Any rejected value aborts
    /// the batch; nothing is rolled back because the export is over.
    pub fn append_row(&mut self, row: SourceRow) -> ExportResult<()> {
        if row.len() != self.accumulators.len() {
            return Err(ExportError::ColumnCountMismatch {
                expected: self.accumulators.len(),
                found: row.len(),
            });
        }

        for ((field, accumulator), cell) in self
            .fields
            .iter()
            .zip(self.accumulators.iter_mut())
            .zip(row)
        {
            match cell {
                None if field.nullable => accumulator.append_null(),
                None => {
                    return Err(ExportError::type_mismatch(
                        &field.name,
                        format!("non-null {}", field.column_type),
                        "NULL",
                    ))
                }
                Some(value) => accumulator.append(value).map_err(|rejected| {
                    ExportError::type_mismatch(&field.name, field.column_type, rejected.type_name())
                })?,
            }
        }

        self.rows += 1;
        Ok(())
    }

    pub fn reset(&mut self, capacity_hint: usize) {
        for accumulator in &mut self.accumulators {
            accumulator.reset(capacity_hint);
        }
        self.rows = 0;
    }
}

/// One Arrow record batch bound for exactly one row group
#[derive(Debug, Clone)]
pub struct BatchRecord {
    sequence: usize,
    batch: RecordBatch,
}

impl BatchRecord {
    pub fn sequence(&self) -> usize {
        self.sequence
    }

    pub fn row_count(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }
}

/// Turns a filled accumulator set into a `BatchRecord`
pub struct RecordAssembler {
    schema: SchemaRef,
    capacity_hint: usize,
    assembled: usize,
}

impl RecordAssembler {
    pub fn new(schema: SchemaRef, capacity_hint: usize) -> Self {
        Self {
            schema,
            capacity_hint,
            assembled: 0,
        }
    }

    pub fn assembled(&self) -> usize {
        self.assembled
    }

    pub fn assemble(&mut self, set: &mut AccumulatorSet) -> ExportResult<BatchRecord> {
        let row_count = set.row_count();

        // Every accumulator must have seen every row, nulls included
        if let Some((index, accumulator)) = set
            .accumulators
            .iter()
            .enumerate()
            .find(|(_, a)| a.len() != row_count)
        {
            return Err(ExportError::Internal(format!(
                "accumulator for '{}' holds {} values, expected {}",
                set.fields[index].name,
                accumulator.len(),
                row_count
            )));
        }

        let arrays: Vec<ArrayRef> = set.accumulators.iter_mut().map(|a| a.build()).collect();
        set.reset(self.capacity_hint);

        let batch = RecordBatch::try_new(self.schema.clone(), arrays)?;
        let record = BatchRecord {
            sequence: self.assembled,
            batch,
        };
        self.assembled += 1;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::export::schemas::map_schema;
    use crate::domains::export::types::SourceColumn;
    use arrow::datatypes::DataType;
    use chrono::{NaiveDate, NaiveDateTime};

    fn sample_schema() -> ColumnarSchema {
        map_schema(&[
            SourceColumn::new("id", "integer", false),
            SourceColumn::new("name", "text", true),
            SourceColumn::new("born", "date", true),
            SourceColumn::new("seen_at", "timestamp without time zone", true),
        ])
        .unwrap()
    }

    fn timestamp(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").unwrap()
    }

    #[test]
    fn test_append_rejects_mismatched_value() {
        let mut accumulator = ColumnAccumulator::for_type(ColumnType::Int32, 4);
        assert!(accumulator.append(SourceValue::Int32(7)).is_ok());

        // No widening, even between integer kinds
        let rejected = accumulator.append(SourceValue::Int64(7)).unwrap_err();
        assert_eq!(rejected, SourceValue::Int64(7));
        assert_eq!(accumulator.len(), 1);
    }

    #[test]
    fn test_build_empties_accumulator() {
        let mut accumulator = ColumnAccumulator::for_type(ColumnType::Utf8, 4);
        accumulator.append(SourceValue::Text("a".into())).unwrap();
        accumulator.append_null();

        let array = accumulator.build();
        assert_eq!(array.len(), 2);
        assert_eq!(array.null_count(), 1);
        assert_eq!(array.data_type(), &DataType::Utf8);
        assert!(accumulator.is_empty());
    }

    #[test]
    fn test_huge_batch_size_does_not_preallocate_everything() {
        let schema = map_schema(&[
            SourceColumn::new("t", "text", true),
            SourceColumn::new("b", "bytea", true),
        ])
        .unwrap();
        let mut set = AccumulatorSet::new(&schema, usize::MAX / 16);
        set.reset(usize::MAX);
        set.append_row(vec![Some(SourceValue::Text("x".into())), None]).unwrap();
        assert_eq!(set.row_count(), 1);
    }

    #[test]
    fn test_date_and_timestamp_conversion() {
        let mut dates = ColumnAccumulator::for_type(ColumnType::Date32, 2);
        dates.append(SourceValue::Date(NaiveDate::from_ymd_opt(1970, 1, 2).unwrap())).unwrap();
        dates.append(SourceValue::Date(NaiveDate::from_ymd_opt(1969, 12, 31).unwrap())).unwrap();
        let dates = dates.build();
        let dates = dates.as_any().downcast_ref::<Date32Array>().unwrap();
        assert_eq!(dates.value(0), 1);
        assert_eq!(dates.value(1), -1);

        let mut stamps = ColumnAccumulator::for_type(ColumnType::TimestampMicros, 1);
        stamps.append(SourceValue::Timestamp(timestamp("1970-01-01 00:00:01.000123"))).unwrap();
        let stamps = stamps.build();
        let stamps = stamps
            .as_any()
            .downcast_ref::<TimestampMicrosecondArray>()
            .unwrap();
        assert_eq!(stamps.value(0), 1_000_123);
    }

    #[test]
    fn test_append_row_reports_column_and_types() {
        let mut set = AccumulatorSet::new(&sample_schema(), 8);
        let row = vec![
            Some(SourceValue::Int32(1)),
            Some(SourceValue::Int32(2)),
            None,
            None,
        ];

        match set.append_row(row) {
            Err(ExportError::TypeMismatch { column, expected, found }) => {
                assert_eq!(column, "name");
                assert_eq!(expected, "Utf8");
                assert_eq!(found, "Int32");
            }
            other => panic!("expected TypeMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_append_row_rejects_null_in_required_column() {
        let mut set = AccumulatorSet::new(&sample_schema(), 8);
        let result = set.append_row(vec![None, None, None, None]);
        assert!(matches!(result, Err(ExportError::TypeMismatch { ref column, .. }) if column == "id"));
    }

    #[test]
    fn test_append_row_rejects_wrong_width() {
        let mut set = AccumulatorSet::new(&sample_schema(), 8);
        let result = set.append_row(vec![Some(SourceValue::Int32(1))]);
        assert!(matches!(
            result,
            Err(ExportError::ColumnCountMismatch { expected: 4, found: 1 })
        ));
    }

    #[test]
    fn test_assemble_builds_batch_and_resets() {
        let schema = sample_schema();
        let mut set = AccumulatorSet::new(&schema, 8);
        let mut assembler = RecordAssembler::new(schema.to_arrow(), 8);

        set.append_row(vec![
            Some(SourceValue::Int32(1)),
            Some(SourceValue::Text("ada".into())),
            None,
            Some(SourceValue::Timestamp(timestamp("2024-02-29 12:30:00.5"))),
        ])
        .unwrap();
        set.append_row(vec![Some(SourceValue::Int32(2)), None, None, None]).unwrap();

        let record = assembler.assemble(&mut set).unwrap();
        assert_eq!(record.sequence(), 0);
        assert_eq!(record.row_count(), 2);
        assert_eq!(record.batch().num_columns(), 4);
        assert_eq!(record.batch().column(1).null_count(), 1);
        assert_eq!(set.row_count(), 0);

        set.append_row(vec![Some(SourceValue::Int32(3)), None, None, None]).unwrap();
        let second = assembler.assemble(&mut set).unwrap();
        assert_eq!(second.sequence(), 1);
        assert_eq!(second.row_count(), 1);
        assert_eq!(assembler.assembled(), 2);
    }

    #[test]
    fn test_assemble_detects_uneven_accumulators() {
        let schema = sample_schema();
        let mut set = AccumulatorSet::new(&schema, 8);
        let mut assembler = RecordAssembler::new(schema.to_arrow(), 8);

        // A failed row leaves the leading columns one value ahead
        let _ = set.append_row(vec![
            Some(SourceValue::Int32(1)),
            Some(SourceValue::Bool(true)),
            None,
            None,
        ]);
        assert!(matches!(assembler.assemble(&mut set), Err(ExportError::Internal(_))));
    }
}
