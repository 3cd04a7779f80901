use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use indexmap::IndexMap;
use sqlx::{
    postgres::{PgArguments, PgPoolOptions, PgRow},
    query::Query,
    PgPool, Postgres, Row,
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
    statements::{Flavor, Statement, Statements},
};

pub async fn connect(
    dsn: &str,
    max_connections: u32,
) -> std::result::Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .min_connections(1)
        .max_connections(max_connections)
        .idle_timeout(Duration::from_millis(30000))
        .test_before_acquire(true)
        .connect(dsn)
        .await
}

#[derive(Debug)]
pub struct PostgresDataRepository {
    pub executor: PgPool,
    pub statements: Arc<Statements>,
    pub predicates: Arc<dyn PredicateCompiler>,
    pub query_permits: Arc<Semaphore>,
    pub batch_size: usize,
}

impl PostgresDataRepository {
    pub fn new(
        executor: PgPool,
        schema: &str,
        table: &str,
        fields: Arc<Fields>,
        options: RepositoryOptions,
    ) -> Self {
        Self {
            executor,
            statements: Arc::new(Statements::new(
                Flavor::Postgres,
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
            // Reference: https://www.postgresql.org/docs/current/errcodes-appendix.html
            if let Some(code) = d.code() {
                if code == "23505" {
                    return StoreError::UniqueConstraintViolation(error);
                } else if code == "23503" {
                    return StoreError::FKConstraintViolation(error);
                }
            }
        }
        StoreError::SqlxError(error)
    }

    pub fn bind_value<'q>(
        query: Query<'q, Postgres, PgArguments>,
        value: NativeValue,
    ) -> Query<'q, Postgres, PgArguments> {
        match value {
            // Parameters are typed, so nulls need the column's type too
            NativeValue::Null(field_type) => match field_type {
                FieldType::Boolean => query.bind(None::<bool>),
                FieldType::Integer => query.bind(None::<i32>),
                FieldType::Long => query.bind(None::<i64>),
                FieldType::Float => query.bind(None::<f32>),
                FieldType::Double => query.bind(None::<f64>),
                FieldType::Decimal => query.bind(None::<BigDecimal>),
                FieldType::Text => query.bind(None::<String>),
                FieldType::Date => query.bind(None::<NaiveDate>),
                FieldType::Time => query.bind(None::<NaiveTime>),
                FieldType::Timestamp => query.bind(None::<NaiveDateTime>),
            },
            NativeValue::Boolean(b) => query.bind(b),
            NativeValue::Integer(i) => query.bind(i),
            NativeValue::Long(l) => query.bind(l),
            NativeValue::Float(f) => query.bind(f),
            NativeValue::Double(d) => query.bind(d),
            NativeValue::Decimal(d) => query.bind(d),
            NativeValue::Text(s) => query.bind(s),
            NativeValue::Date(d) => query.bind(d),
            NativeValue::Time(t) => query.bind(t),
            NativeValue::Timestamp(ts) => query.bind(ts),
        }
    }

    pub fn read_value(
        row: &PgRow,
        index: usize,
        field_type: FieldType,
    ) -> std::result::Result<NativeValue, sqlx::Error> {
        let value = match field_type {
            FieldType::Boolean => row
                .try_get::<Option<bool>, _>(index)?
                .map(NativeValue::Boolean),
            FieldType::Integer => row
                .try_get::<Option<i32>, _>(index)?
                .map(NativeValue::Integer),
            FieldType::Long => row
                .try_get::<Option<i64>, _>(index)?
                .map(NativeValue::Long),
            FieldType::Float => row
                .try_get::<Option<f32>, _>(index)?
                .map(NativeValue::Float),
            FieldType::Double => row
                .try_get::<Option<f64>, _>(index)?
                .map(NativeValue::Double),
            FieldType::Decimal => row
                .try_get::<Option<BigDecimal>, _>(index)?
                .map(NativeValue::Decimal),
            FieldType::Text => row
                .try_get::<Option<String>, _>(index)?
                .map(NativeValue::Text),
            FieldType::Date => row
                .try_get::<Option<NaiveDate>, _>(index)?
                .map(NativeValue::Date),
            FieldType::Time => row
                .try_get::<Option<NaiveTime>, _>(index)?
                .map(NativeValue::Time),
            FieldType::Timestamp => row
                .try_get::<Option<NaiveDateTime>, _>(index)?
                .map(NativeValue::Timestamp),
        };

        Ok(value.unwrap_or(NativeValue::Null(field_type)))
    }

    // NUMERIC keeps any precision
    pub fn check_value(_field: &Field, _value: &Value) -> std::result::Result<(), ValueError> {
        Ok(())
    }
}

implement_repository!(PostgresDataRepository, Postgres);

/// Reads table metadata from `information_schema`.
#[derive(Debug, Clone)]
pub struct PostgresMetadataSource {
    pub executor: PgPool,
}

impl PostgresMetadataSource {
    pub fn new(executor: PgPool) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl MetadataSource for PostgresMetadataSource {
    async fn primary_key_names(
        &self,
        schema: &str,
        table: &str,
    ) -> std::result::Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar(
            r#"SELECT kcu.column_name::text
            FROM information_schema.table_constraints tc
            INNER JOIN information_schema.key_column_usage kcu
                ON kcu.constraint_schema = tc.constraint_schema
                AND kcu.constraint_name = tc.constraint_name
                AND kcu.table_name = tc.table_name
            WHERE tc.constraint_type = 'PRIMARY KEY'
                AND tc.table_schema = $1
                AND tc.table_name = $2
            ORDER BY kcu.ordinal_position"#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&self.executor)
        .await
    }

    async fn columns(
        &self,
        schema: &str,
        table: &str,
    ) -> std::result::Result<Vec<ColumnMetadata>, sqlx::Error> {
        // Serial columns default to nextval(), identity columns say so
        sqlx::query_as(
            r#"SELECT
                column_name::text AS name,
                data_type::text AS type_name,
                is_nullable::text = 'YES' AS nullable,
                (is_identity::text = 'YES'
                    OR COALESCE(column_default::text, '') LIKE 'nextval(%') AS auto_increment
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position"#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&self.executor)
        .await
    }
}

pub mod testutils {
    use rand::Rng;

    pub fn get_random_schema() -> String {
        // Generate a random schema (taken from IOx)
        let mut rng = rand::thread_rng();
        (&mut rng)
            .sample_iter(rand::distributions::Alphanumeric)
            .filter(|c| c.is_ascii_alphabetic())
            .take(20)
            .map(char::from)
            .collect::<String>()
            .to_lowercase()
    }
}
