//! Default implementation of the DataRepository trait that factors out the
//! statement execution shared between Postgres and SQLite.
//!
//! Usage:
//!
//! The struct has to have certain fields, since this macro relies on them:
//!
//! ```ignore
//! pub struct MyRepository {
//!     pub executor: sqlx::Pool<sqlx::SqlxDatabaseType>,
//!     pub statements: Arc<Statements>,
//!     pub predicates: Arc<dyn PredicateCompiler>,
//!     pub query_permits: Arc<Semaphore>,
//!     pub batch_size: usize,
//! }
//!
//! impl MyRepository {
//!     pub fn interpret_error(error: sqlx::Error) -> StoreError {
//!         // Interpret the database-specific error code and turn some sqlx errors
//!         // into the StoreError values like UniqueConstraintViolation/FKConstraintViolation
//!         // ...
//!     }
//!
//!     pub fn bind_value<'q>(query: Query<'q, ...>, value: NativeValue) -> Query<'q, ...> {
//!         // Bind the value with the Rust type the driver expects for the column
//!     }
//!
//!     pub fn read_value(row: &DbRow, index: usize, field_type: FieldType) -> Result<NativeValue, sqlx::Error> {
//!         // Decode a column by position
//!     }
//!
//!     pub fn check_value(field: &Field, value: &Value) -> Result<(), ValueError> {
//!         // Reject values the store can't hold exactly
//!     }
//! }
//!
//! implement_repository!(MyRepository, sqlx::SqlxDatabaseType)
//! ```
//!
//! Both stores need the same sequence of statements per operation, but the
//! sqlx query, argument and row types are distinct per database, and making
//! the implementation generic over `sqlx::Database` runs into the same
//! borrow checker issues with `Query` lifetimes. Hence a macro.
use std::collections::HashSet;

use crate::data_types::{Record, Value};
use crate::schema::Fields;

/// Put rows of generated keys back into insertion order. Stores may return
/// `RETURNING` rows in any order, but assign increasing keys.
pub fn order_generated_keys(fields: &Fields, generated: &mut [Record]) {
    let Some(field) = fields.auto_increment_fields().next() else {
        return;
    };

    generated.sort_by_key(|keys| match keys.get(&field.name) {
        Some(Value::Integer(i)) => *i as i64,
        Some(Value::Long(l)) => *l,
        _ => i64::MIN,
    });
}

/// Key records of the given records, without repeats, in first-seen order.
pub fn distinct_keys(fields: &Fields, records: &[Record]) -> Vec<Record> {
    let mut seen = HashSet::new();
    records
        .iter()
        .map(|r| fields.key_of(r))
        .filter(|k| seen.insert(format!("{k:?}")))
        .collect()
}

#[macro_export]
macro_rules! implement_repository {
    ($repo: ident, $db: ty) => {

impl $repo {
    fn build_query(
        statement: &Statement,
    ) -> sqlx::query::Query<'_, $db, <$db as sqlx::database::HasArguments<'_>>::Arguments> {
        let mut query = sqlx::query(&statement.sql);
        for value in &statement.params {
            query = $repo::bind_value(query, value.clone());
        }
        query
    }

    fn to_record<'a>(
        row: &<$db as sqlx::Database>::Row,
        fields: impl Iterator<Item = &'a Field>,
    ) -> std::result::Result<Record, StoreError> {
        let mut record = Record::new();
        for (index, field) in fields.enumerate() {
            let native = $repo::read_value(row, index, field.r#type)
                .map_err($repo::interpret_error)?;
            field
                .set_from_native(&mut record, native)
                .map_err(StoreError::Value)?;
        }
        Ok(record)
    }

    /// Values are checked against the store before any statement runs.
    fn check_records<'a>(
        &self,
        records: impl IntoIterator<Item = &'a Record>,
    ) -> std::result::Result<(), ValueError> {
        for record in records {
            for field in self.statements.fields().iter() {
                if let Some(value) = record.get(&field.name) {
                    $repo::check_value(field, value)?;
                }
            }
        }
        Ok(())
    }

    async fn fetch_records<'e, E>(
        &self,
        executor: E,
        statement: &Statement,
    ) -> std::result::Result<Vec<Record>, StoreError>
    where
        E: sqlx::Executor<'e, Database = $db>,
    {
        debug!("Fetching records: {}", statement.sql);
        let rows = $repo::build_query(statement)
            .fetch_all(executor)
            .await
            .map_err($repo::interpret_error)?;

        rows.iter()
            .map(|row| $repo::to_record(row, self.statements.fields().iter()))
            .collect()
    }

    async fn fetch_count<'e, E>(
        &self,
        executor: E,
        statement: &Statement,
    ) -> std::result::Result<u64, StoreError>
    where
        E: sqlx::Executor<'e, Database = $db>,
    {
        debug!("Counting records: {}", statement.sql);
        let row = $repo::build_query(statement)
            .fetch_one(executor)
            .await
            .map_err($repo::interpret_error)?;
        let count: i64 = sqlx::Row::try_get(&row, 0).map_err($repo::interpret_error)?;

        Ok(count.max(0) as u64)
    }

    async fn fetch_generated_keys<'e, E>(
        &self,
        executor: E,
        statement: &Statement,
    ) -> std::result::Result<Vec<Record>, StoreError>
    where
        E: sqlx::Executor<'e, Database = $db>,
    {
        debug!("Inserting records: {}", statement.sql);
        let rows = $repo::build_query(statement)
            .fetch_all(executor)
            .await
            .map_err($repo::interpret_error)?;

        rows.iter()
            .map(|row| $repo::to_record(row, self.statements.fields().auto_increment_fields()))
            .collect()
    }

    async fn execute<'e, E>(
        &self,
        executor: E,
        statement: &Statement,
    ) -> std::result::Result<u64, StoreError>
    where
        E: sqlx::Executor<'e, Database = $db>,
    {
        debug!("Executing: {}", statement.sql);
        let result = $repo::build_query(statement)
            .execute(executor)
            .await
            .map_err($repo::interpret_error)?;
        Ok(result.rows_affected())
    }

    async fn fetch_page(
        &self,
        predicate: Option<&dyn Predicate>,
        page_number: u64,
        page_size: u64,
        sort: &[String],
        direction: Direction,
    ) -> Result<Page<Record>> {
        if page_size == 0 {
            return Err(Error::InvalidPageSize);
        }

        let (page, count) = self
            .statements
            .find_page(predicate, page_number, page_size, sort, direction)?;

        // Queues when all permits are taken
        let _permit = self
            .query_permits
            .acquire()
            .await
            .map_err(|e| Error::Find(StoreError::Message(e.to_string())))?;

        let (items, total_count) = tokio::try_join!(
            self.fetch_records(&self.executor, &page),
            self.fetch_count(&self.executor, &count),
        )
        .map_err(Error::Find)?;

        Ok(Page::new(items, page_number, page_size, total_count))
    }

}

#[async_trait]
impl DataRepository for $repo {
    fn fields(&self) -> &Arc<Fields> {
        self.statements.fields()
    }

    async fn find(&self, key: &Record) -> Result<Option<Record>> {
        let statement = self.statements.find(key)?;
        let records = self
            .fetch_records(&self.executor, &statement)
            .await
            .map_err(Error::Find)?;

        Ok(records.into_iter().next())
    }

    async fn find_all(&self, sort: &[String], direction: Direction) -> Result<Vec<Record>> {
        let statement = self.statements.find_all(sort, direction);
        self.fetch_records(&self.executor, &statement)
            .await
            .map_err(Error::Find)
    }

    async fn find_all_by_keys(&self, keys: &[Record]) -> Result<Vec<Record>> {
        let mut records = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(self.batch_size) {
            let statement = self.statements.find_by_keys(chunk)?;
            records.extend(
                self.fetch_records(&self.executor, &statement)
                    .await
                    .map_err(Error::Find)?,
            );
        }
        Ok(records)
    }

    async fn find_page(
        &self,
        page_number: u64,
        page_size: u64,
        sort: &[String],
        direction: Direction,
    ) -> Result<Page<Record>> {
        self.fetch_page(None, page_number, page_size, sort, direction)
            .await
    }

    async fn find_where(
        &self,
        query: &str,
        sort: &[String],
        direction: Direction,
    ) -> Result<Vec<Record>> {
        let predicate = self.predicates.compile(query)?;
        let statement = self
            .statements
            .find_where(predicate.as_ref(), sort, direction)?;

        self.fetch_records(&self.executor, &statement)
            .await
            .map_err(Error::Find)
    }

    async fn find_page_where(
        &self,
        query: &str,
        page_number: u64,
        page_size: u64,
        sort: &[String],
        direction: Direction,
    ) -> Result<Page<Record>> {
        let predicate = self.predicates.compile(query)?;
        self.fetch_page(
            Some(predicate.as_ref()),
            page_number,
            page_size,
            sort,
            direction,
        )
        .await
    }

    async fn insert(&self, record: &Record) -> Result<Record> {
        let mut inserted = self.insert_all(std::slice::from_ref(record)).await?;
        inserted
            .pop()
            .ok_or_else(|| Error::Insert(StoreError::Message("Nothing was inserted".to_string())))
    }

    async fn insert_all(&self, records: &[Record]) -> Result<Vec<Record>> {
        if records.is_empty() {
            return Ok(vec![]);
        }

        self.check_records(records)?;

        let fields = self.statements.fields();
        let generates_keys = fields.has_auto_increment();

        let mut tx = self
            .executor
            .begin()
            .await
            .map_err(|e| Error::Insert($repo::interpret_error(e)))?;

        let mut inserted = Vec::with_capacity(records.len());
        for batch in records.chunks(self.batch_size) {
            debug!("Inserting a batch of {} record(s)", batch.len());

            let mut generated = Vec::with_capacity(batch.len());
            for statement in self.statements.insert(batch)? {
                if generates_keys {
                    generated.extend(
                        self.fetch_generated_keys(&mut *tx, &statement)
                            .await
                            .map_err(Error::Insert)?,
                    );
                } else {
                    self.execute(&mut *tx, &statement)
                        .await
                        .map_err(Error::Insert)?;
                }
            }

            if !generates_keys {
                inserted.extend(batch.iter().cloned());
                continue;
            }

            if generated.len() != batch.len() {
                return Err(Error::Insert(StoreError::Message(format!(
                    "Identifier mismatch after insert: {} record(s), {} generated key(s)",
                    batch.len(),
                    generated.len()
                ))));
            }

            order_generated_keys(fields, &mut generated);
            for (record, keys) in batch.iter().zip(generated) {
                let mut record = record.clone();
                record.extend(keys);
                inserted.push(record);
            }
        }

        tx.commit()
            .await
            .map_err(|e| Error::Insert($repo::interpret_error(e)))?;

        Ok(inserted)
    }

    async fn update(&self, record: &Record) -> Result<Record> {
        let fields = self.statements.fields();
        let touched = fields.touched_fields(record);
        if touched.is_empty() {
            return Err(unrecognized_object(record));
        }
        self.check_records([record])?;

        let update = self.statements.update(&touched, record)?;
        let find = self.statements.find(&fields.key_of(record))?;

        let mut tx = self
            .executor
            .begin()
            .await
            .map_err(|e| Error::Update($repo::interpret_error(e)))?;

        self.execute(&mut *tx, &update)
            .await
            .map_err(Error::Update)?;
        let updated = self
            .fetch_records(&mut *tx, &find)
            .await
            .map_err(Error::Update)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::Update(StoreError::Message(format!(
                    "Record not found after update: {:?}",
                    fields.key_of(record)
                )))
            })?;

        tx.commit()
            .await
            .map_err(|e| Error::Update($repo::interpret_error(e)))?;

        Ok(updated)
    }

    async fn update_all(&self, records: &[Record]) -> Result<Vec<Record>> {
        if records.is_empty() {
            return Ok(vec![]);
        }

        self.check_records(records)?;

        let fields = self.statements.fields();

        // Records that change different fields need different statements
        let mut groups: IndexMap<Vec<String>, (Vec<&Field>, Vec<&Record>)> = IndexMap::new();
        for record in records {
            let touched = fields.touched_fields(record);
            if touched.is_empty() {
                return Err(unrecognized_object(record));
            }

            let shape = touched.iter().map(|f| f.name.clone()).collect();
            groups
                .entry(shape)
                .or_insert_with(|| (touched, vec![]))
                .1
                .push(record);
        }

        let mut tx = self
            .executor
            .begin()
            .await
            .map_err(|e| Error::Update($repo::interpret_error(e)))?;

        for (touched, group) in groups.values() {
            for batch in group.chunks(self.batch_size) {
                debug!(
                    "Updating a batch of {} record(s) touching {} field(s)",
                    batch.len(),
                    touched.len()
                );
                for record in batch {
                    let statement = self.statements.update(touched, record)?;
                    self.execute(&mut *tx, &statement)
                        .await
                        .map_err(Error::Update)?;
                }
            }
        }

        let keys = distinct_keys(fields, records);
        let mut updated = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(self.batch_size) {
            let statement = self.statements.find_by_keys(chunk)?;
            updated.extend(
                self.fetch_records(&mut *tx, &statement)
                    .await
                    .map_err(Error::Update)?,
            );
        }

        if updated.len() != keys.len() {
            return Err(Error::Update(StoreError::Message(format!(
                "{} of {} record(s) not found after update",
                keys.len() - updated.len(),
                keys.len()
            ))));
        }

        tx.commit()
            .await
            .map_err(|e| Error::Update($repo::interpret_error(e)))?;

        Ok(updated)
    }

    async fn delete(&self, key: &Record) -> Result<Option<Record>> {
        let find = self.statements.find(key)?;
        let delete = self.statements.delete(key)?;

        let mut tx = self
            .executor
            .begin()
            .await
            .map_err(|e| Error::Delete($repo::interpret_error(e)))?;

        let Some(found) = self
            .fetch_records(&mut *tx, &find)
            .await
            .map_err(Error::Delete)?
            .into_iter()
            .next()
        else {
            return Ok(None);
        };

        self.execute(&mut *tx, &delete)
            .await
            .map_err(Error::Delete)?;
        tx.commit()
            .await
            .map_err(|e| Error::Delete($repo::interpret_error(e)))?;

        Ok(Some(found))
    }

    async fn delete_all(&self, keys: &[Record]) -> Result<Vec<Record>> {
        if keys.is_empty() {
            return Ok(vec![]);
        }

        let find = self.statements.find_by_keys(keys)?;
        let delete = self.statements.delete_by_keys(keys)?;

        let mut tx = self
            .executor
            .begin()
            .await
            .map_err(|e| Error::Delete($repo::interpret_error(e)))?;

        let found = self
            .fetch_records(&mut *tx, &find)
            .await
            .map_err(Error::Delete)?;
        if found.len() != keys.len() {
            warn!(
                "Found {} of {} record(s) to delete, skipping the delete",
                found.len(),
                keys.len()
            );
            return Ok(vec![]);
        }

        self.execute(&mut *tx, &delete)
            .await
            .map_err(Error::Delete)?;
        tx.commit()
            .await
            .map_err(|e| Error::Delete($repo::interpret_error(e)))?;

        Ok(found)
    }
}

    };
}

pub(crate) fn unrecognized_object(record: &Record) -> super::interface::Error {
    let names: Vec<&str> = record.keys().map(String::as_str).collect();
    super::interface::Error::Update(super::interface::StoreError::Message(format!(
        "Unrecognized object: no mutable fields among {names:?}"
    )))
}
