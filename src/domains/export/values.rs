use chrono::{NaiveDate, NaiveDateTime};

/// A non-null cell as it came off the wire
#[derive(Debug, Clone, PartialEq)]
pub enum SourceValue {
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Text(String),
    Bytes(Vec<u8>),
    Bool(bool),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    /// Server type the decoder has no representation for
    Unrecognized(String),
}

impl SourceValue {
    pub fn type_name(&self) -> &str {
        match self {
            SourceValue::Int16(_) => "Int16",
            SourceValue::Int32(_) => "Int32",
            SourceValue::Int64(_) => "Int64",
            SourceValue::Float32(_) => "Float32",
            SourceValue::Float64(_) => "Float64",
            SourceValue::Text(_) => "Text",
            SourceValue::Bytes(_) => "Bytes",
            SourceValue::Bool(_) => "Bool",
            SourceValue::Date(_) => "Date",
            SourceValue::Timestamp(_) => "Timestamp",
            SourceValue::Unrecognized(name) => name,
        }
    }
}

/// One fetched row; `None` is SQL NULL
pub type SourceRow = Vec<Option<SourceValue>>;

/// Result of one bounded fetch from a cursor
#[derive(Debug, Clone, Default)]
pub struct FetchedBatch {
    pub rows: Vec<SourceRow>,
    pub has_more: bool,
}

impl FetchedBatch {
    pub fn from_rows(rows: Vec<SourceRow>, batch_size: usize) -> Self {
        let has_more = rows.len() == batch_size;
        Self { rows, has_more }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}
