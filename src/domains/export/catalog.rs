use crate::domains::export::types::{SourceColumn, TableRef};
use crate::errors::{ExportError, ExportResult};
use async_trait::async_trait;
use sqlx::postgres::PgPool;

/// Source of a table's column list, in declaration order
#[async_trait]
pub trait SchemaIntrospector: Send + Sync {
    async fn table_columns(&self, table: &TableRef) -> ExportResult<Vec<SourceColumn>>;
}

// information_schema columns are `sql_identifier`/`yes_or_no` domains; cast so
// they decode as plain text.
const COLUMNS_QUERY: &str = "SELECT column_name::text, data_type::text, (is_nullable = 'YES') AS nullable
     FROM information_schema.columns
     WHERE table_schema = $1 AND table_name = $2
     ORDER BY ordinal_position";

/// Reads column metadata from `information_schema`
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SchemaIntrospector for PgCatalog {
    async fn table_columns(&self, table: &TableRef) -> ExportResult<Vec<SourceColumn>> {
        let rows = sqlx::query_as::<_, (String, String, bool)>(COLUMNS_QUERY)
            .bind(&table.schema)
            .bind(&table.table)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                ExportError::Introspection(format!("failed to read columns of {}: {}", table, e))
            })?;

        if rows.is_empty() {
            return Err(ExportError::Introspection(format!(
                "table {} does not exist or has no visible columns",
                table
            )));
        }

        log::debug!("Introspected {} columns for {}", rows.len(), table);
        Ok(rows
            .into_iter()
            .map(|(name, source_type, nullable)| SourceColumn {
                name,
                source_type,
                nullable,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Needs a reachable PostgreSQL; run with
    /// `TEST_DATABASE_URL=postgres://... cargo test -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn test_table_columns_against_postgres() {
        let url = std::env::var("TEST_DATABASE_URL").unwrap();
        let pool = PgPool::connect(&url).await.unwrap();

        sqlx::raw_sql(
            "DROP TABLE IF EXISTS public.catalog_probe;
             CREATE TABLE public.catalog_probe (
                 id bigint NOT NULL,
                 label varchar(20),
                 search tsvector
             );",
        )
        .execute(&pool)
        .await
        .unwrap();

        let catalog = PgCatalog::new(pool);
        let columns = catalog
            .table_columns(&TableRef::new("public", "catalog_probe"))
            .await
            .unwrap();

        assert_eq!(
            columns,
            vec![
                SourceColumn::new("id", "bigint", false),
                SourceColumn::new("label", "character varying", true),
                SourceColumn::new("search", "tsvector", true),
            ]
        );

        let missing = catalog
            .table_columns(&TableRef::new("public", "no_such_table_here"))
            .await;
        assert!(matches!(missing, Err(ExportError::Introspection(_))));
    }
}
