use crate::domains::export::types::{ColumnType, ColumnarField, ColumnarSchema, SourceColumn};
use crate::errors::{ExportError, ExportResult};

/// Strip a type modifier such as `(10,2)` and normalise case and whitespace,
/// so `NUMERIC(10, 2)` and `numeric` resolve the same way.
fn normalize_source_type(source_type: &str) -> String {
    let mut normalized = String::with_capacity(source_type.len());
    let mut depth = 0usize;
    for c in source_type.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => normalized.push(c.to_ascii_lowercase()),
            _ => {}
        }
    }
    normalized.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Resolve a PostgreSQL type name against the fixed whitelist.
///
/// `numeric`/`decimal` map to `Float64`: the conversion is lossy for values
/// that need more than double precision. Both timestamp flavours map to
/// microsecond timestamps without a timezone.
pub fn map_type(source_type: &str) -> ExportResult<ColumnType> {
    let column_type = match normalize_source_type(source_type).as_str() {
        "smallint" | "int2" => ColumnType::Int16,
        "integer" | "int" | "int4" => ColumnType::Int32,
        "bigint" | "int8" => ColumnType::Int64,
        "real" | "float4" => ColumnType::Float32,
        "double precision" | "float8" => ColumnType::Float64,
        "numeric" | "decimal" => ColumnType::Float64,
        "text" | "character varying" | "varchar" | "character" | "char" | "bpchar" => {
            ColumnType::Utf8
        }
        "bytea" => ColumnType::Binary,
        "boolean" | "bool" => ColumnType::Bool,
        "date" => ColumnType::Date32,
        "timestamp without time zone"
        | "timestamp with time zone"
        | "timestamp"
        | "timestamptz" => ColumnType::TimestampMicros,
        _ => {
            return Err(ExportError::UnsupportedType {
                column: None,
                source_type: source_type.to_string(),
            })
        }
    };
    Ok(column_type)
}

fn map_column(column: &SourceColumn) -> ExportResult<ColumnarField> {
    let column_type = map_type(&column.source_type).map_err(|e| match e {
        ExportError::UnsupportedType { source_type, .. } => ExportError::UnsupportedType {
            column: Some(column.name.clone()),
            source_type,
        },
        other => other,
    })?;

    Ok(ColumnarField {
        name: column.name.clone(),
        column_type,
        nullable: column.nullable,
    })
}

/// Build the columnar schema for a table.
///
/// Fails on the first column whose type is not supported, so the schema always
/// covers every source column and stays aligned with `SELECT *` row extraction.
pub fn map_schema(columns: &[SourceColumn]) -> ExportResult<ColumnarSchema> {
    if columns.is_empty() {
        return Err(ExportError::Introspection(
            "table has no columns to export".to_string(),
        ));
    }

    let fields = columns
        .iter()
        .map(map_column)
        .collect::<ExportResult<Vec<_>>>()?;

    log::debug!("Mapped {} source columns to columnar schema", fields.len());
    Ok(ColumnarSchema::new(fields))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapped(source_type: &str) -> Option<ColumnType> {
        map_type(source_type).ok()
    }

    #[test]
    fn test_map_type_whitelist() {
        assert_eq!(mapped("smallint"), Some(ColumnType::Int16));
        assert_eq!(mapped("integer"), Some(ColumnType::Int32));
        assert_eq!(mapped("bigint"), Some(ColumnType::Int64));
        assert_eq!(mapped("real"), Some(ColumnType::Float32));
        assert_eq!(mapped("double precision"), Some(ColumnType::Float64));
        assert_eq!(mapped("text"), Some(ColumnType::Utf8));
        assert_eq!(mapped("character varying"), Some(ColumnType::Utf8));
        assert_eq!(mapped("character"), Some(ColumnType::Utf8));
        assert_eq!(mapped("bytea"), Some(ColumnType::Binary));
        assert_eq!(mapped("boolean"), Some(ColumnType::Bool));
        assert_eq!(mapped("date"), Some(ColumnType::Date32));
        assert_eq!(mapped("timestamp without time zone"), Some(ColumnType::TimestampMicros));
        assert_eq!(mapped("timestamp with time zone"), Some(ColumnType::TimestampMicros));
    }

    #[test]
    fn test_numeric_degrades_to_float64() {
        assert_eq!(mapped("numeric"), Some(ColumnType::Float64));
        assert_eq!(mapped("decimal"), Some(ColumnType::Float64));
        assert_eq!(mapped("NUMERIC(10, 2)"), Some(ColumnType::Float64));
    }

    #[test]
    fn test_type_modifiers_and_case_are_ignored() {
        assert_eq!(mapped("  Character Varying(255) "), Some(ColumnType::Utf8));
        assert_eq!(mapped("timestamp(3) with time zone"), Some(ColumnType::TimestampMicros));
    }

    #[test]
    fn test_unsupported_types() {
        for source_type in ["tsvector", "USER-DEFINED", "ARRAY", "jsonb", "uuid", "interval", ""] {
            match map_type(source_type) {
                Err(ExportError::UnsupportedType { column, source_type: reported }) => {
                    assert_eq!(column, None);
                    assert_eq!(reported, source_type);
                }
                other => panic!("{source_type} should not map, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_map_schema_preserves_order_names_and_nullability() {
        let columns = vec![
            SourceColumn::new("id", "bigint", false),
            SourceColumn::new("label", "text", true),
            SourceColumn::new("price", "numeric", true),
            SourceColumn::new("created_at", "timestamp with time zone", false),
        ];

        let schema = map_schema(&columns).unwrap();
        assert_eq!(schema.len(), columns.len());
        for (field, column) in schema.fields().iter().zip(&columns) {
            assert_eq!(field.name, column.name);
            assert_eq!(field.nullable, column.nullable);
        }
        assert_eq!(schema.fields()[2].column_type, ColumnType::Float64);
        assert_eq!(schema.fields()[3].column_type, ColumnType::TimestampMicros);
    }

    #[test]
    fn test_map_schema_fails_on_first_unsupported_column() {
        let columns = vec![
            SourceColumn::new("id", "integer", false),
            SourceColumn::new("search", "tsvector", true),
            SourceColumn::new("mood", "USER-DEFINED", true),
        ];

        match map_schema(&columns) {
            Err(ExportError::UnsupportedType { column, source_type }) => {
                assert_eq!(column.as_deref(), Some("search"));
                assert_eq!(source_type, "tsvector");
            }
            other => panic!("expected UnsupportedType, got {:?}", other),
        }
    }

    #[test]
    fn test_map_schema_rejects_empty_column_list() {
        assert!(matches!(map_schema(&[]), Err(ExportError::Introspection(_))));
    }
}
