use std::sync::Arc;

use sqlx::sqlite::SqliteJournalMode;
use thiserror::Error;
use tracing::info;

use crate::{
    catalog::{discover_fields, MetadataSource},
    identity::IdentityParser,
    repository::{
        interface::{DataRepository, RepositoryOptions},
        sqlite::{self, SqliteDataRepository, SqliteMetadataSource},
    },
    schema::{Fields, SchemaError},
};

#[cfg(feature = "store-postgres")]
use crate::repository::postgres::{self, PostgresDataRepository, PostgresMetadataSource};

use super::schema::{self, JournalMode, TablefrontConfig};

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Error connecting to the store: {0}")]
    Connect(sqlx::Error),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Everything needed to serve one table.
#[derive(Debug)]
pub struct DataContext {
    pub config: TablefrontConfig,
    pub fields: Arc<Fields>,
    pub repository: Arc<dyn DataRepository>,
    pub identity: Arc<IdentityParser>,
}

impl From<JournalMode> for SqliteJournalMode {
    fn from(mode: JournalMode) -> Self {
        match mode {
            JournalMode::Delete => SqliteJournalMode::Delete,
            JournalMode::Truncate => SqliteJournalMode::Truncate,
            JournalMode::Persist => SqliteJournalMode::Persist,
            JournalMode::Memory => SqliteJournalMode::Memory,
            JournalMode::Wal => SqliteJournalMode::Wal,
            JournalMode::Off => SqliteJournalMode::Off,
        }
    }
}

async fn load_fields(
    source: &dyn MetadataSource,
    schema: &str,
    table: &str,
) -> Result<Arc<Fields>, SchemaError> {
    let fields = discover_fields(source, schema, table).await?;
    if fields.is_empty() {
        return Err(SchemaError::NoSuchTable {
            schema: schema.to_string(),
            table: table.to_string(),
        });
    }

    Ok(Arc::new(Fields::try_new(fields)?))
}

pub async fn build_context(cfg: TablefrontConfig) -> Result<DataContext, ContextError> {
    let schema_name = cfg.schema_name().to_string();
    let table = cfg.table.name.clone();
    let options = RepositoryOptions::from(&cfg.repository);

    let (fields, repository): (Arc<Fields>, Arc<dyn DataRepository>) = match &cfg.store {
        #[cfg(feature = "store-postgres")]
        schema::Store::Postgres(schema::Postgres {
            dsn,
            max_connections,
        }) => {
            let executor = postgres::connect(dsn, *max_connections)
                .await
                .map_err(ContextError::Connect)?;
            let source = PostgresMetadataSource::new(executor.clone());
            let fields = load_fields(&source, &schema_name, &table).await?;

            let repository =
                PostgresDataRepository::new(executor, &schema_name, &table, fields.clone(), options);
            (fields, Arc::new(repository))
        }
        schema::Store::Sqlite(schema::Sqlite {
            dsn,
            journal_mode,
            max_connections,
        }) => {
            let executor = sqlite::connect(dsn, (*journal_mode).into(), *max_connections)
                .await
                .map_err(ContextError::Connect)?;
            let source = SqliteMetadataSource::new(executor.clone());
            let fields = load_fields(&source, &schema_name, &table).await?;

            let repository =
                SqliteDataRepository::new(executor, &schema_name, &table, fields.clone(), options);
            (fields, Arc::new(repository))
        }
    };

    info!(
        "Serving {schema_name}.{table} with {} field(s), key {:?}",
        fields.len(),
        fields.key_fields().map(|f| f.name.as_str()).collect::<Vec<_>>()
    );

    Ok(DataContext {
        identity: Arc::new(IdentityParser::new(&fields)),
        config: cfg,
        fields,
        repository,
    })
}
