use crate::domains::export::repository::{validate_cursor_prefix, DEFAULT_CURSOR_PREFIX};
use crate::domains::export::types::{ExportRequest, RowSelection, TableRef, WriterConfig};
use crate::errors::{ExportError, ExportResult};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Rows fetched and written per row group unless configured otherwise
pub const DEFAULT_BATCH_SIZE: usize = 100;

const DEFAULT_MAX_CONNECTIONS: u32 = 2;

/// Export settings shared by every table exported in one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub batch_size: usize,
    pub cursor_prefix: String,
    pub writer: WriterConfig,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            cursor_prefix: DEFAULT_CURSOR_PREFIX.to_string(),
            writer: WriterConfig::default(),
        }
    }
}

impl ExportConfig {
    pub fn validate(&self) -> ExportResult<()> {
        if self.batch_size == 0 {
            return Err(ExportError::InvalidConfig(
                "batch size must be greater than zero".to_string(),
            ));
        }
        if self.writer.data_page_size_limit == Some(0) {
            return Err(ExportError::InvalidConfig(
                "data page size limit must be greater than zero".to_string(),
            ));
        }
        validate_cursor_prefix(&self.cursor_prefix)
    }

    /// Load Parquet writer options from a JSON file
    pub fn load_writer_config(path: &Path) -> ExportResult<WriterConfig> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ExportError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            ExportError::InvalidConfig(format!("invalid writer config {}: {}", path.display(), e))
        })
    }

    pub fn request(&self, table: TableRef, destination: PathBuf) -> ExportRequest {
        ExportRequest {
            table,
            selection: RowSelection::FullTable,
            destination,
            batch_size: self.batch_size,
            writer: self.writer.clone(),
        }
    }
}

/// PostgreSQL connection settings
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: String,
    pub max_connections: u32,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("ssl_mode", &self.ssl_mode)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "127.0.0.1".to_string(),
            port: 5432,
            database: None,
            user: None,
            password: None,
            ssl_mode: "prefer".to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl DatabaseConfig {
    /// Read settings from the process environment. Call `dotenv::dotenv()`
    /// first to pick up a `.env` file.
    pub fn from_env() -> ExportResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ExportResult<Self> {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = match non_empty("DB_PORT") {
            Some(port) => port
                .trim()
                .parse()
                .map_err(|_| ExportError::InvalidConfig(format!("DB_PORT '{}' is not a port", port)))?,
            None => defaults.port,
        };
        let max_connections = match non_empty("DB_MAX_CONNECTIONS") {
            Some(max) => max.trim().parse().map_err(|_| {
                ExportError::InvalidConfig(format!("DB_MAX_CONNECTIONS '{}' is not a number", max))
            })?,
            None => defaults.max_connections,
        };

        Ok(Self {
            url: non_empty("DATABASE_URL"),
            host: non_empty("DB_HOST").unwrap_or(defaults.host),
            port,
            database: non_empty("DB_NAME"),
            user: non_empty("DB_USER"),
            password: lookup("DB_PASSWORD"),
            ssl_mode: non_empty("DB_SSL_MODE").unwrap_or(defaults.ssl_mode),
            max_connections,
        })
    }

    pub fn connect_options(&self) -> ExportResult<PgConnectOptions> {
        if let Some(url) = &self.url {
            return PgConnectOptions::from_str(url)
                .map_err(|e| ExportError::InvalidConfig(format!("invalid DATABASE_URL: {}", e)));
        }

        let ssl_mode = PgSslMode::from_str(&self.ssl_mode).map_err(|e| {
            ExportError::InvalidConfig(format!("invalid DB_SSL_MODE '{}': {}", self.ssl_mode, e))
        })?;

        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .ssl_mode(ssl_mode);
        if let Some(database) = &self.database {
            options = options.database(database);
        }
        if let Some(user) = &self.user {
            options = options.username(user);
        }
        if let Some(password) = &self.password {
            options = options.password(password);
        }
        Ok(options)
    }

    pub async fn connect(&self) -> ExportResult<PgPool> {
        let options = self.connect_options()?;
        if self.max_connections == 0 {
            return Err(ExportError::InvalidConfig(
                "DB_MAX_CONNECTIONS must be greater than zero".to_string(),
            ));
        }

        log::debug!("Connecting to PostgreSQL with {:?}", self);
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| ExportError::Connection(format!("failed to connect: {}", e)))
    }
}
