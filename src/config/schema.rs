use std::path::Path;

use config::{Config, ConfigError, File, FileFormat};
use serde::Deserialize;

use crate::repository::interface::RepositoryOptions;

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct TablefrontConfig {
    pub store: Store,
    pub table: Table,
    #[serde(default)]
    pub repository: Repository,
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Store {
    #[cfg(feature = "store-postgres")]
    Postgres(Postgres),
    Sqlite(Sqlite),
}

impl Store {
    /// Schema a table lives in when the config doesn't name one.
    pub fn default_schema(&self) -> &'static str {
        match self {
            #[cfg(feature = "store-postgres")]
            Store::Postgres(_) => "public",
            Store::Sqlite(_) => "main",
        }
    }
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Postgres {
    pub dsn: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Sqlite {
    pub dsn: String,
    #[serde(default)]
    pub journal_mode: JournalMode,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    Delete,
    Truncate,
    Persist,
    Memory,
    #[default]
    Wal,
    Off,
}

fn default_max_connections() -> u32 {
    16
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Table {
    pub schema: Option<String>,
    pub name: String,
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct Repository {
    pub batch_size: usize,
    pub parallelism: usize,
}

impl Default for Repository {
    fn default() -> Self {
        let defaults = RepositoryOptions::default();
        Self {
            batch_size: defaults.batch_size,
            parallelism: defaults.parallelism,
        }
    }
}

impl From<&Repository> for RepositoryOptions {
    fn from(repository: &Repository) -> Self {
        Self {
            batch_size: repository.batch_size,
            parallelism: repository.parallelism,
        }
    }
}

impl TablefrontConfig {
    pub fn schema_name(&self) -> &str {
        self.table
            .schema
            .as_deref()
            .unwrap_or_else(|| self.store.default_schema())
    }
}

pub fn validate_config(config: TablefrontConfig) -> Result<TablefrontConfig, ConfigError> {
    if config.table.name.trim().is_empty() {
        return Err(ConfigError::Message(
            "The table name can't be empty".to_string(),
        ));
    }

    if config.repository.batch_size == 0 || config.repository.parallelism == 0 {
        return Err(ConfigError::Message(
            "The repository batch size and parallelism must be at least 1".to_string(),
        ));
    }

    let max_connections = match &config.store {
        #[cfg(feature = "store-postgres")]
        Store::Postgres(Postgres {
            max_connections, ..
        }) => *max_connections,
        Store::Sqlite(Sqlite {
            max_connections, ..
        }) => *max_connections,
    };
    if max_connections == 0 {
        return Err(ConfigError::Message(
            "The store needs at least one connection".to_string(),
        ));
    }

    Ok(config)
}

pub fn load_config(path: &Path) -> Result<TablefrontConfig, ConfigError> {
    let path = path.to_str().ok_or_else(|| {
        ConfigError::Message(format!("Invalid config path {}", path.display()))
    })?;
    let config = Config::builder().add_source(File::new(path, FileFormat::Toml));

    config.build()?.try_deserialize().and_then(validate_config)
}

// Load a config from a string (to test our structs are defined correctly)
pub fn load_config_from_string(
    config_str: &str,
    skip_validation: bool,
) -> Result<TablefrontConfig, ConfigError> {
    let config =
        Config::builder().add_source(File::from_str(config_str, FileFormat::Toml));

    if skip_validation {
        config.build()?.try_deserialize()
    } else {
        config.build()?.try_deserialize().and_then(validate_config)
    }
}
