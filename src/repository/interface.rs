use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    data_types::{Direction, Page, Record},
    filter::FilterError,
    schema::{Fields, ValueError},
};

use super::statements::StatementError;

/// Root cause of a failed store interaction, with database-specific error
/// codes interpreted.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Unique constraint violation: {0}")]
    UniqueConstraintViolation(sqlx::Error),

    #[error("Foreign key constraint violation: {0}")]
    FKConstraintViolation(sqlx::Error),

    // All other errors
    #[error("Internal SQL error: {0}")]
    SqlxError(sqlx::Error),

    #[error("Store returned an invalid row: {0}")]
    Value(ValueError),

    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Error finding records: {0}")]
    Find(StoreError),

    #[error("Error inserting records: {0}")]
    Insert(StoreError),

    #[error("Error updating records: {0}")]
    Update(StoreError),

    #[error("Error deleting records: {0}")]
    Delete(StoreError),

    #[error(transparent)]
    InvalidValue(#[from] ValueError),

    #[error(transparent)]
    InvalidFilter(#[from] FilterError),

    #[error("Page size must be greater than zero")]
    InvalidPageSize,
}

impl Error {
    /// Whether the failure was caused by the caller's input rather than the
    /// store.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidValue(_) | Error::InvalidFilter(_) | Error::InvalidPageSize
        )
    }
}

impl From<StatementError> for Error {
    fn from(err: StatementError) -> Self {
        match err {
            StatementError::Value(e) => Error::InvalidValue(e),
            e @ StatementError::UnboundParameter(_) => {
                Error::Find(StoreError::Message(e.to_string()))
            }
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Tuning shared by the store implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepositoryOptions {
    /// Most records written or looked up by a single statement
    pub batch_size: usize,
    /// Most page queries running at the same time
    pub parallelism: usize,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            parallelism: 10,
        }
    }
}

/// CRUD access to one table, in terms of wire records.
///
/// Lookups that match nothing return `None` or an empty vector. Keys are
/// records holding (at least) every key field.
#[async_trait]
pub trait DataRepository: Send + Sync + Debug {
    fn fields(&self) -> &Arc<Fields>;

    async fn find(&self, key: &Record) -> Result<Option<Record>>;

    /// All rows ordered by the named fields. Unknown names are ignored and
    /// an empty list sorts by the key fields.
    async fn find_all(&self, sort: &[String], direction: Direction) -> Result<Vec<Record>>;

    async fn find_all_by_keys(&self, keys: &[Record]) -> Result<Vec<Record>>;

    /// One page of the sorted rows. `page_number` is 0-based.
    async fn find_page(
        &self,
        page_number: u64,
        page_size: u64,
        sort: &[String],
        direction: Direction,
    ) -> Result<Page<Record>>;

    async fn find_where(
        &self,
        query: &str,
        sort: &[String],
        direction: Direction,
    ) -> Result<Vec<Record>>;

    async fn find_page_where(
        &self,
        query: &str,
        page_number: u64,
        page_size: u64,
        sort: &[String],
        direction: Direction,
    ) -> Result<Page<Record>>;

    /// Insert a record, returning it with any generated key values.
    async fn insert(&self, record: &Record) -> Result<Record>;

    async fn insert_all(&self, records: &[Record]) -> Result<Vec<Record>>;

    /// Write the mutable fields present in the record and return the stored
    /// row.
    async fn update(&self, record: &Record) -> Result<Record>;

    async fn update_all(&self, records: &[Record]) -> Result<Vec<Record>>;

    /// Delete a row, returning it as it was before the delete.
    async fn delete(&self, key: &Record) -> Result<Option<Record>>;

    /// Delete the rows for all keys. Nothing is deleted (and nothing
    /// returned) unless every key matches a row.
    async fn delete_all(&self, keys: &[Record]) -> Result<Vec<Record>>;
}

#[cfg(test)]
pub mod tests {
    use std::str::FromStr;
    use std::sync::Arc;

    use assert_unordered::assert_eq_unordered;
    use bigdecimal::BigDecimal;

    use crate::data_types::Value;
    use crate::testutils::record;

    use super::*;

    /// Column definitions of the table the generic tests run against,
    /// valid for every supported store.
    pub const DATA_TABLE_COLUMNS: &str = r#"(
        id INTEGER PRIMARY KEY,
        boolean_value BOOLEAN NULL,
        integer_value INTEGER NOT NULL,
        long_value BIGINT,
        float_value REAL,
        double_value DOUBLE PRECISION,
        decimal_value DECIMAL(5,2),
        string_value VARCHAR(10),
        date_value DATE,
        time_value TIME,
        timestamp_value TIMESTAMP
    )"#;

    pub fn data_record(id: i32, name: &str) -> Record {
        record(&[
            ("id", Value::Integer(id)),
            ("booleanValue", Value::Boolean(id % 2 == 0)),
            ("integerValue", Value::Integer(id * 10)),
            ("longValue", Value::Long(id as i64 * 1_000_000_000)),
            ("floatValue", Value::Float(1.25 * id as f32)),
            ("doubleValue", Value::Double(2.5 * id as f64)),
            (
                "decimalValue",
                Value::Decimal(BigDecimal::from_str(&format!("{id}.45")).unwrap()),
            ),
            ("stringValue", Value::from(name)),
            ("dateValue", Value::from("2024-01-31")),
            ("timeValue", Value::from("10:11:12")),
            ("timestampValue", Value::from("2024-01-31T10:11:12")),
        ])
    }

    fn key(id: i32) -> Record {
        record(&[("id", Value::Integer(id))])
    }

    fn ids(records: &[Record]) -> Vec<Value> {
        records.iter().map(|r| r["id"].clone()).collect()
    }

    fn sort_by(name: &str) -> Vec<String> {
        vec![name.to_string()]
    }

    pub async fn run_generic_repository_tests(repository: Arc<dyn DataRepository>) {
        test_single_record_lifecycle(repository.clone()).await;
        test_invalid_inputs(repository.clone()).await;
        test_insert_all_and_find_all(repository.clone()).await;
        test_pagination(repository.clone()).await;
        test_find_where(repository.clone()).await;
        test_update_all(repository.clone()).await;
        test_delete_all(repository).await;
    }

    async fn test_single_record_lifecycle(repository: Arc<dyn DataRepository>) {
        let inserted = repository
            .insert(&data_record(1, "A"))
            .await
            .expect("Error inserting record");
        assert_eq!(inserted, data_record(1, "A"));

        // Reading it back yields exactly what was inserted
        let found = repository.find(&key(1)).await.unwrap();
        assert_eq!(found, Some(inserted.clone()));

        // Only the patched field changes
        let updated = repository
            .update(&record(&[
                ("id", Value::Integer(1)),
                ("stringValue", Value::from("B")),
            ]))
            .await
            .unwrap();
        let expected = data_record(1, "B");
        assert_eq!(updated, expected);

        let deleted = repository.delete(&key(1)).await.unwrap();
        assert_eq!(deleted, Some(expected));
        assert_eq!(repository.find(&key(1)).await.unwrap(), None);
        assert_eq!(repository.delete(&key(1)).await.unwrap(), None);
    }

    async fn test_invalid_inputs(repository: Arc<dyn DataRepository>) {
        repository.insert(&data_record(1, "A")).await.unwrap();

        // Duplicate key
        let err = repository.insert(&data_record(1, "A")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Insert(StoreError::UniqueConstraintViolation(_))
        ));
        assert!(!err.is_client_error());

        // Wrong wire type
        let mut wrong = data_record(2, "A");
        wrong.insert("integerValue".to_string(), Value::from("20"));
        let err = repository.insert(&wrong).await.unwrap_err();
        assert!(matches!(err, Error::InvalidValue(ValueError::InvalidArgument { .. })));
        assert!(err.is_client_error());

        // Missing NOT NULL value
        let mut missing = data_record(2, "A");
        missing.shift_remove("integerValue");
        assert!(matches!(
            repository.insert(&missing).await.unwrap_err(),
            Error::InvalidValue(ValueError::NullNotAllowed(_))
        ));

        // An update has to touch at least one mutable field
        assert!(matches!(
            repository.update(&key(1)).await.unwrap_err(),
            Error::Update(StoreError::Message(_))
        ));

        // Updating a record that doesn't exist
        assert!(matches!(
            repository
                .update(&record(&[
                    ("id", Value::Integer(99)),
                    ("stringValue", Value::from("x")),
                ]))
                .await
                .unwrap_err(),
            Error::Update(_)
        ));

        assert!(matches!(
            repository
                .find_page(0, 0, &[], Direction::Ascending)
                .await
                .unwrap_err(),
            Error::InvalidPageSize
        ));
        assert!(matches!(
            repository
                .find_where("nope=1", &[], Direction::Ascending)
                .await
                .unwrap_err(),
            Error::InvalidFilter(_)
        ));

        // Nothing else was written
        let all = repository.find_all(&[], Direction::Ascending).await.unwrap();
        assert_eq!(ids(&all), vec![Value::Integer(1)]);
        repository.delete(&key(1)).await.unwrap();
    }

    async fn test_insert_all_and_find_all(repository: Arc<dyn DataRepository>) {
        assert!(repository.insert_all(&[]).await.unwrap().is_empty());

        let records: Vec<Record> = (1..=7)
            .map(|id| data_record(id, &format!("Data {id}")))
            .collect();
        let inserted = repository.insert_all(&records).await.unwrap();
        assert_eq!(inserted, records);

        let ascending = repository
            .find_all(&sort_by("integerValue"), Direction::Ascending)
            .await
            .unwrap();
        assert_eq!(ascending, records);

        let mut descending = repository
            .find_all(&sort_by("integerValue"), Direction::Descending)
            .await
            .unwrap();
        descending.reverse();
        assert_eq!(descending, ascending);

        // Unknown sort fields fall back to the key
        let by_key = repository
            .find_all(&sort_by("noSuchField"), Direction::Descending)
            .await
            .unwrap();
        assert_eq!(
            ids(&by_key),
            (1..=7).rev().map(Value::Integer).collect::<Vec<_>>()
        );

        let found = repository
            .find_all_by_keys(&[key(2), key(4), key(99)])
            .await
            .unwrap();
        assert_eq_unordered!(found, vec![records[1].clone(), records[3].clone()]);
        assert!(repository.find_all_by_keys(&[]).await.unwrap().is_empty());
    }

    async fn test_pagination(repository: Arc<dyn DataRepository>) {
        let all = repository
            .find_all(&sort_by("longValue"), Direction::Descending)
            .await
            .unwrap();

        let mut concatenated = vec![];
        for page_number in 0..3 {
            let page = repository
                .find_page(page_number, 3, &sort_by("longValue"), Direction::Descending)
                .await
                .unwrap();
            assert_eq!(page.page_number, page_number);
            assert_eq!(page.page_size, 3);
            assert_eq!(page.total_count, 7);
            assert_eq!(page.total_pages, 3);
            concatenated.extend(page.items);
        }
        assert_eq!(concatenated, all);

        let past_end = repository
            .find_page(5, 3, &[], Direction::Ascending)
            .await
            .unwrap();
        assert!(past_end.items.is_empty());
        assert_eq!(past_end.total_count, 7);

        // Pages can be requested concurrently
        let pages = futures::future::try_join_all(
            (0..3).map(|n| repository.find_page(n, 3, &[], Direction::Ascending)),
        )
        .await
        .unwrap();
        assert_eq!(
            pages.into_iter().flat_map(|p| p.items).collect::<Vec<_>>(),
            repository.find_all(&[], Direction::Ascending).await.unwrap()
        );
    }

    async fn test_find_where(repository: Arc<dyn DataRepository>) {
        let found = repository
            .find_where("stringValue=Data 1", &[], Direction::Ascending)
            .await
            .unwrap();
        assert_eq!(found, vec![data_record(1, "Data 1")]);

        let found = repository
            .find_where(
                "integerValue>=30 && booleanValue=true",
                &sort_by("integerValue"),
                Direction::Descending,
            )
            .await
            .unwrap();
        assert_eq!(
            ids(&found),
            vec![Value::Integer(6), Value::Integer(4)]
        );

        let found = repository
            .find_where(
                "id<2 || stringValue~Data 7",
                &[],
                Direction::Ascending,
            )
            .await
            .unwrap();
        assert_eq!(ids(&found), vec![Value::Integer(1), Value::Integer(7)]);

        let found = repository
            .find_where("dateValue=2024-01-31 && timeValue=null", &[], Direction::Ascending)
            .await
            .unwrap();
        assert!(found.is_empty());

        let page = repository
            .find_page_where("integerValue>=30", 1, 2, &[], Direction::Ascending)
            .await
            .unwrap();
        assert_eq!(page.total_count, 5);
        assert_eq!(page.total_pages, 3);
        assert_eq!(ids(&page.items), vec![Value::Integer(5), Value::Integer(6)]);
    }

    async fn test_update_all(repository: Arc<dyn DataRepository>) {
        let updated = repository
            .update_all(&[
                record(&[("id", Value::Integer(2)), ("stringValue", Value::from("X"))]),
                record(&[("id", Value::Integer(3)), ("longValue", Value::Long(5))]),
                record(&[("id", Value::Integer(4)), ("stringValue", Value::from("Y"))]),
            ])
            .await
            .unwrap();

        let expected_2 = data_record(2, "X");
        let mut expected_3 = data_record(3, "Data 3");
        expected_3.insert("longValue".to_string(), Value::Long(5));
        let expected_4 = data_record(4, "Y");
        assert_eq_unordered!(
            updated,
            vec![expected_2.clone(), expected_3, expected_4]
        );

        // One record without any mutable field fails the whole batch
        let err = repository
            .update_all(&[
                record(&[("id", Value::Integer(2)), ("stringValue", Value::from("Z"))]),
                key(5),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Update(_)));
        assert_eq!(
            repository.find(&key(2)).await.unwrap(),
            Some(expected_2.clone())
        );

        // A record that doesn't exist rolls back the others
        let err = repository
            .update_all(&[
                record(&[("id", Value::Integer(2)), ("stringValue", Value::from("Z"))]),
                record(&[("id", Value::Integer(99)), ("stringValue", Value::from("Z"))]),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Update(_)));
        assert_eq!(repository.find(&key(2)).await.unwrap(), Some(expected_2));

        assert!(repository.update_all(&[]).await.unwrap().is_empty());
    }

    async fn test_delete_all(repository: Arc<dyn DataRepository>) {
        // A partial match deletes nothing
        let deleted = repository.delete_all(&[key(2), key(99)]).await.unwrap();
        assert!(deleted.is_empty());
        assert!(repository.find(&key(2)).await.unwrap().is_some());

        let before = repository.find_all_by_keys(&[key(2), key(3)]).await.unwrap();
        let deleted = repository.delete_all(&[key(2), key(3)]).await.unwrap();
        assert_eq_unordered!(deleted, before);
        assert!(repository
            .find_all_by_keys(&[key(2), key(3)])
            .await
            .unwrap()
            .is_empty());

        assert!(repository.delete_all(&[]).await.unwrap().is_empty());

        let remaining = repository.find_all(&[], Direction::Ascending).await.unwrap();
        assert_eq!(
            ids(&remaining),
            vec![1, 4, 5, 6, 7].into_iter().map(Value::Integer).collect::<Vec<_>>()
        );
    }

    /// Tests for a table whose key is generated by the store:
    /// `id` (auto-increment key) and `name` (text).
    pub async fn run_generated_key_tests(repository: Arc<dyn DataRepository>) {
        let inserted = repository
            .insert(&record(&[("name", Value::from("first"))]))
            .await
            .unwrap();
        let first_id = match inserted["id"] {
            Value::Integer(id) => id,
            ref other => panic!("unexpected generated key {other:?}"),
        };
        assert_eq!(inserted["name"], Value::from("first"));

        let records: Vec<Record> = (0..5)
            .map(|i| record(&[("name", Value::from(format!("name {i}")))]))
            .collect();
        let inserted = repository.insert_all(&records).await.unwrap();
        assert_eq!(inserted.len(), 5);

        // Keys are assigned in input order
        let mut previous = first_id;
        for (input, output) in records.iter().zip(&inserted) {
            assert_eq!(output["name"], input["name"]);
            let Value::Integer(id) = output["id"] else {
                panic!("unexpected generated key {:?}", output["id"]);
            };
            assert!(id > previous);
            previous = id;

            let found = repository
                .find(&record(&[("id", Value::Integer(id))]))
                .await
                .unwrap();
            assert_eq!(found.as_ref(), Some(output));
        }
    }
}
