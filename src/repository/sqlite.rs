use std::{str::FromStr, sync::Arc};

use async_trait::async_trait;
use bigdecimal::{BigDecimal, ToPrimitive};
use indexmap::IndexMap;
use sqlx::{
    query::Query,
    sqlite::{
        SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions,
        SqliteRow,
    },
    Pool, Row, Sqlite,
};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::{
    catalog::{ColumnMetadata, MetadataSource},
    data_types::{Direction, NativeValue, Page, Record, Value},
    filter::{Predicate, PredicateCompiler, QueryPredicateCompiler},
    implement_repository,
    schema::{Field, FieldType, Fields, ValueError},
};

use super::{
    default::{distinct_keys, order_generated_keys, unrecognized_object},
    interface::{DataRepository, Error, RepositoryOptions, Result, StoreError},
    statements::{quote_ident, Flavor, Statement, Statements},
};

// Digits a REAL keeps when SQLite converts numeric text
const EXACT_REAL_DIGITS: usize = 15;

/// Whether SQLite stores the decimal without changing it. NUMERIC affinity
/// turns well-formed numeric text into an INTEGER when it fits in 64 bits and
/// into a REAL otherwise.
fn stores_exactly(decimal: &BigDecimal) -> bool {
    if decimal.is_integer() && decimal.to_i64().is_some() {
        return true;
    }
    if !decimal.to_f64().map_or(false, f64::is_finite) {
        return false;
    }

    let (digits, _) = decimal.as_bigint_and_exponent();
    let digits = digits.magnitude().to_string();
    digits.trim_end_matches('0').len() <= EXACT_REAL_DIGITS
}

/// Whether a `CREATE TABLE` statement gives a column `PRIMARY KEY
/// AUTOINCREMENT`. String literals and quoted identifiers are skipped.
fn declares_autoincrement_key(sql: &str) -> bool {
    let mut words = vec![];
    let mut word = String::new();
    let mut quote = None;
    for c in sql.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if matches!(c, '\'' | '"' | '`') => {
                quote = Some(c);
                words.push(std::mem::take(&mut word));
            }
            None if c == '[' => {
                quote = Some(']');
                words.push(std::mem::take(&mut word));
            }
            None if c.is_ascii_alphanumeric() || c == '_' => word.push(c.to_ascii_uppercase()),
            None => words.push(std::mem::take(&mut word)),
        }
    }
    words.push(word);
    words.retain(|w| !w.is_empty());

    words.windows(2).enumerate().any(|(i, pair)| {
        if pair[0] != "PRIMARY" || pair[1] != "KEY" {
            return false;
        }
        // PRIMARY KEY [ASC | DESC] [ON CONFLICT <resolution>] AUTOINCREMENT
        words[i + 2..]
            .iter()
            .find(|w| {
                !matches!(
                    w.as_str(),
                    "ASC"
                        | "DESC"
                        | "ON"
                        | "CONFLICT"
                        | "ROLLBACK"
                        | "ABORT"
                        | "FAIL"
                        | "IGNORE"
                        | "REPLACE"
                )
            })
            .map_or(false, |w| w.as_str() == "AUTOINCREMENT")
    })
}

pub async fn connect(
    dsn: &str,
    journal_mode: SqliteJournalMode,
    max_connections: u32,
) -> std::result::Result<Pool<Sqlite>, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(dsn)?
        .create_if_missing(true)
        .journal_mode(journal_mode);

    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
}

#[derive(Debug)]
pub struct SqliteDataRepository {
    pub executor: Pool<Sqlite>,
    pub statements: Arc<Statements>,
    pub predicates: Arc<dyn PredicateCompiler>,
    pub query_permits: Arc<Semaphore>,
    pub batch_size: usize,
}

impl SqliteDataRepository {
    pub fn new(
        executor: Pool<Sqlite>,
        schema: &str,
        table: &str,
        fields: Arc<Fields>,
        options: RepositoryOptions,
    ) -> Self {
        Self {
            executor,
            statements: Arc::new(Statements::new(
                Flavor::Sqlite,
                schema,
                table,
                fields.clone(),
            )),
            predicates: Arc::new(QueryPredicateCompiler::new(fields)),
            query_permits: Arc::new(Semaphore::new(options.parallelism.max(1))),
            batch_size: options.batch_size.max(1),
        }
    }

    pub fn interpret_error(error: sqlx::Error) -> StoreError {
        if let sqlx::Error::Database(ref d) = error {
            // Reference: https://www.sqlite.org/rescode.html
            let message = d.message();

            // sqlx doesn't surface the extended code for FK violations, so go by
            // the message for both
            if message.contains("FOREIGN KEY constraint failed") {
                return StoreError::FKConstraintViolation(error);
            }
            if message.contains("UNIQUE constraint failed") {
                return StoreError::UniqueConstraintViolation(error);
            }
        }
        StoreError::SqlxError(error)
    }

    pub fn bind_value<'q>(
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
        value: NativeValue,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        match value {
            // Column affinity decides what a null is
            NativeValue::Null(_) => query.bind(None::<String>),
            NativeValue::Boolean(b) => query.bind(b),
            NativeValue::Integer(i) => query.bind(i),
            NativeValue::Long(l) => query.bind(l),
            NativeValue::Float(f) => query.bind(f),
            NativeValue::Double(d) => query.bind(d),
            // No native decimal type; NUMERIC affinity converts the text
            NativeValue::Decimal(d) => query.bind(d.to_string()),
            NativeValue::Text(s) => query.bind(s),
            NativeValue::Date(d) => query.bind(d),
            NativeValue::Time(t) => query.bind(t),
            NativeValue::Timestamp(ts) => query.bind(ts),
        }
    }

    pub fn read_value(
        row: &SqliteRow,
        index: usize,
        field_type: FieldType,
    ) -> std::result::Result<NativeValue, sqlx::Error> {
        let value = match field_type {
            FieldType::Boolean => row
                .try_get_unchecked::<Option<bool>, _>(index)?
                .map(NativeValue::Boolean),
            // INTEGER storage is 64-bit whatever the declared type
            FieldType::Integer => row
                .try_get_unchecked::<Option<i64>, _>(index)?
                .map(|l| {
                    i32::try_from(l).map_err(|e| sqlx::Error::ColumnDecode {
                        index: index.to_string(),
                        source: Box::new(e),
                    })
                })
                .transpose()?
                .map(NativeValue::Integer),
            FieldType::Long => row
                .try_get_unchecked::<Option<i64>, _>(index)?
                .map(NativeValue::Long),
            FieldType::Float => row
                .try_get_unchecked::<Option<f32>, _>(index)?
                .map(NativeValue::Float),
            FieldType::Double => row
                .try_get_unchecked::<Option<f64>, _>(index)?
                .map(NativeValue::Double),
            FieldType::Decimal => row
                .try_get_unchecked::<Option<String>, _>(index)?
                .map(|s| {
                    BigDecimal::from_str(&s).map_err(|e| sqlx::Error::ColumnDecode {
                        index: index.to_string(),
                        source: Box::new(e),
                    })
                })
                .transpose()?
                .map(NativeValue::Decimal),
            FieldType::Text => row
                .try_get_unchecked::<Option<String>, _>(index)?
                .map(NativeValue::Text),
            FieldType::Date => row
                .try_get_unchecked::<Option<chrono::NaiveDate>, _>(index)?
                .map(NativeValue::Date),
            FieldType::Time => row
                .try_get_unchecked::<Option<chrono::NaiveTime>, _>(index)?
                .map(NativeValue::Time),
            FieldType::Timestamp => row
                .try_get_unchecked::<Option<chrono::NaiveDateTime>, _>(index)?
                .map(NativeValue::Timestamp),
        };

        Ok(value.unwrap_or(NativeValue::Null(field_type)))
    }

    pub fn check_value(field: &Field, value: &Value) -> std::result::Result<(), ValueError> {
        match value {
            Value::Decimal(d) if !stores_exactly(d) => Err(ValueError::InvalidArgument {
                field: field.name.clone(),
                expected: field.r#type,
                actual: "decimal with more than 15 significant digits",
            }),
            _ => Ok(()),
        }
    }
}

implement_repository!(SqliteDataRepository, Sqlite);

/// Reads table metadata through the `table_info` pragma.
#[derive(Debug, Clone)]
pub struct SqliteMetadataSource {
    pub executor: Pool<Sqlite>,
}

impl SqliteMetadataSource {
    pub fn new(executor: Pool<Sqlite>) -> Self {
        Self { executor }
    }

    /// Only an `INTEGER PRIMARY KEY AUTOINCREMENT` column counts as generated;
    /// a plain rowid alias still takes caller-supplied keys.
    async fn declares_autoincrement(
        &self,
        schema: &str,
        table: &str,
    ) -> std::result::Result<bool, sqlx::Error> {
        let sql: Option<String> = sqlx::query_scalar(&format!(
            "SELECT sql FROM {}.sqlite_master WHERE type = 'table' AND name = ?",
            quote_ident(schema)
        ))
        .bind(table)
        .fetch_optional(&self.executor)
        .await?
        .flatten();

        Ok(sql.map_or(false, |s| declares_autoincrement_key(&s)))
    }
}

#[async_trait]
impl MetadataSource for SqliteMetadataSource {
    async fn primary_key_names(
        &self,
        schema: &str,
        table: &str,
    ) -> std::result::Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar("SELECT name FROM pragma_table_info(?, ?) WHERE pk > 0 ORDER BY pk")
            .bind(table)
            .bind(schema)
            .fetch_all(&self.executor)
            .await
    }

    async fn columns(
        &self,
        schema: &str,
        table: &str,
    ) -> std::result::Result<Vec<ColumnMetadata>, sqlx::Error> {
        // Primary keys are never null, whatever the declaration says
        let mut columns: Vec<ColumnMetadata> = sqlx::query_as(
            r#"SELECT
                name,
                type AS type_name,
                ("notnull" = 0 AND pk = 0) AS nullable,
                FALSE AS auto_increment
            FROM pragma_table_info(?, ?)
            ORDER BY cid"#,
        )
        .bind(table)
        .bind(schema)
        .fetch_all(&self.executor)
        .await?;

        let primary_keys = self.primary_key_names(schema, table).await?;
        if let [key] = primary_keys.as_slice() {
            if self.declares_autoincrement(schema, table).await? {
                for column in columns.iter_mut().filter(|c| &c.name == key) {
                    column.auto_increment = true;
                }
            }
        }

        Ok(columns)
    }
}
