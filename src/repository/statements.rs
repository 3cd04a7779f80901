use std::sync::Arc;

use itertools::Itertools;
use thiserror::Error;

use crate::{
    data_types::{Direction, NativeValue, Record},
    filter::Predicate,
    schema::{Field, FieldType, Fields, SqlType, ValueError},
};

#[derive(Debug, Error)]
pub enum StatementError {
    #[error(transparent)]
    Value(#[from] ValueError),

    #[error("Parameter {0} was never bound")]
    UnboundParameter(usize),
}

/// SQL dialect differences between the supported stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Sqlite,
    Postgres,
}

impl Flavor {
    fn pagination(self, page_number: u64, page_size: u64) -> String {
        let offset = page_number.saturating_mul(page_size);
        match self {
            Flavor::Sqlite => format!(" LIMIT {page_size} OFFSET {offset}"),
            Flavor::Postgres => {
                format!(" OFFSET {offset} ROWS FETCH NEXT {page_size} ROWS ONLY")
            }
        }
    }

    /// Rewrite `?` placeholders into the dialect's own form. Quoted text is
    /// left alone.
    pub fn render(self, sql: &str) -> String {
        match self {
            Flavor::Sqlite => sql.to_string(),
            Flavor::Postgres => {
                let mut rendered = String::with_capacity(sql.len() + 8);
                let mut quote: Option<char> = None;
                let mut index = 0;

                for c in sql.chars() {
                    match (quote, c) {
                        (None, '\'' | '"') => quote = Some(c),
                        (Some(q), _) if q == c => quote = None,
                        (None, '?') => {
                            index += 1;
                            rendered.push('$');
                            rendered.push_str(&index.to_string());
                            continue;
                        }
                        _ => {}
                    }
                    rendered.push(c);
                }
                rendered
            }
        }
    }

    /// Expression that reads a column in the shape its field type decodes
    /// from.
    fn select_expression(self, field: &Field) -> String {
        let column = quote_ident(&field.column.name);
        match (self, field.r#type, &field.column.sql_type) {
            // Postgres won't decode int2 as int4
            (Flavor::Postgres, FieldType::Integer, sql_type)
                if *sql_type != SqlType::Integer =>
            {
                format!("CAST({column} AS INTEGER) AS {column}")
            }
            _ => column,
        }
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Positional statement parameters, addressed by 0-based index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    slots: Vec<Option<NativeValue>>,
}

impl Params {
    pub fn with_len(len: usize) -> Self {
        Self {
            slots: vec![None; len],
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn set(&mut self, index: usize, value: NativeValue) {
        if index >= self.slots.len() {
            self.slots.resize(index + 1, None);
        }
        self.slots[index] = Some(value);
    }

    pub fn push(&mut self, value: NativeValue) {
        self.slots.push(Some(value));
    }

    pub fn into_values(self) -> Result<Vec<NativeValue>, StatementError> {
        self.slots
            .into_iter()
            .enumerate()
            .map(|(i, v)| v.ok_or(StatementError::UnboundParameter(i)))
            .collect()
    }
}

/// SQL text ready for the store plus its parameters in binding order.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<NativeValue>,
}

/// Builds the statements for one table from its field set.
#[derive(Debug)]
pub struct Statements {
    flavor: Flavor,
    fields: Arc<Fields>,
    table: String,
    select: String,
    count: String,
    delete: String,
    key_predicate: String,
    returning: Option<String>,
}

impl Statements {
    pub fn new(flavor: Flavor, schema: &str, table: &str, fields: Arc<Fields>) -> Self {
        let table = format!("{}.{}", quote_ident(schema), quote_ident(table));

        let select = format!(
            "SELECT {} FROM {table}",
            fields.iter().map(|f| flavor.select_expression(f)).join(", ")
        );
        let count = format!("SELECT COUNT(*) FROM {table}");
        let delete = format!("DELETE FROM {table}");
        let key_predicate = fields
            .key_fields()
            .map(|f| format!("{} = ?", quote_ident(&f.column.name)))
            .join(" AND ");
        let returning = fields.has_auto_increment().then(|| {
            format!(
                " RETURNING {}",
                fields
                    .auto_increment_fields()
                    .map(|f| flavor.select_expression(f))
                    .join(", ")
            )
        });

        Self {
            flavor,
            fields,
            table,
            select,
            count,
            delete,
            key_predicate,
            returning,
        }
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    pub fn fields(&self) -> &Arc<Fields> {
        &self.fields
    }

    fn finish(&self, sql: String, params: Vec<NativeValue>) -> Statement {
        Statement {
            sql: self.flavor.render(&sql),
            params,
        }
    }

    fn key_params(&self, key: &Record, params: &mut Vec<NativeValue>) -> Result<(), ValueError> {
        for field in self.fields.key_fields() {
            params.push(field.native_value(key)?);
        }
        Ok(())
    }

    fn keys_predicate(&self, count: usize) -> String {
        if count == 1 {
            self.key_predicate.clone()
        } else {
            (0..count)
                .map(|_| format!("({})", self.key_predicate))
                .join(" OR ")
        }
    }

    fn order_by(&self, sort: &[String], direction: Direction) -> String {
        let columns = self
            .fields
            .sort_fields(sort)
            .iter()
            .map(|f| format!("{} {}", quote_ident(&f.column.name), direction.to_sql()))
            .join(", ");
        format!(" ORDER BY {columns}")
    }

    pub fn find(&self, key: &Record) -> Result<Statement, ValueError> {
        let mut params = vec![];
        self.key_params(key, &mut params)?;
        Ok(self.finish(
            format!("{} WHERE {}", self.select, self.key_predicate),
            params,
        ))
    }

    pub fn find_all(&self, sort: &[String], direction: Direction) -> Statement {
        self.finish(
            format!("{}{}", self.select, self.order_by(sort, direction)),
            vec![],
        )
    }

    pub fn find_by_keys(&self, keys: &[Record]) -> Result<Statement, ValueError> {
        let mut params = vec![];
        for key in keys {
            self.key_params(key, &mut params)?;
        }
        Ok(self.finish(
            format!("{} WHERE {}", self.select, self.keys_predicate(keys.len())),
            params,
        ))
    }

    fn filtered(
        &self,
        base: &str,
        predicate: Option<&dyn Predicate>,
    ) -> Result<(String, Vec<NativeValue>), StatementError> {
        match predicate {
            None => Ok((base.to_string(), vec![])),
            Some(predicate) => {
                let mut params = Params::default();
                predicate.bind(&mut params, 0);
                Ok((
                    format!("{base} WHERE {}", predicate.to_sql_fragment()),
                    params.into_values()?,
                ))
            }
        }
    }

    pub fn find_where(
        &self,
        predicate: &dyn Predicate,
        sort: &[String],
        direction: Direction,
    ) -> Result<Statement, StatementError> {
        let (sql, params) = self.filtered(&self.select, Some(predicate))?;
        Ok(self.finish(format!("{sql}{}", self.order_by(sort, direction)), params))
    }

    /// The page query and the matching count query.
    pub fn find_page(
        &self,
        predicate: Option<&dyn Predicate>,
        page_number: u64,
        page_size: u64,
        sort: &[String],
        direction: Direction,
    ) -> Result<(Statement, Statement), StatementError> {
        let (sql, params) = self.filtered(&self.select, predicate)?;
        let page = self.finish(
            format!(
                "{sql}{}{}",
                self.order_by(sort, direction),
                self.flavor.pagination(page_number, page_size)
            ),
            params,
        );

        let (sql, params) = self.filtered(&self.count, predicate)?;
        Ok((page, self.finish(sql, params)))
    }

    /// Insert a batch of records. With no insertable columns every record
    /// needs its own `DEFAULT VALUES` statement.
    pub fn insert(&self, records: &[Record]) -> Result<Vec<Statement>, ValueError> {
        let returning = self.returning.as_deref().unwrap_or("");
        let columns = self.fields.insertable_fields();

        if columns.is_empty() {
            let sql = format!("INSERT INTO {} DEFAULT VALUES{returning}", self.table);
            return Ok(records
                .iter()
                .map(|_| self.finish(sql.clone(), vec![]))
                .collect());
        }

        let mut params = vec![];
        for record in records {
            for field in &columns {
                params.push(field.native_value(record)?);
            }
        }

        let row = format!("({})", columns.iter().map(|_| "?").join(", "));
        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}{returning}",
            self.table,
            columns
                .iter()
                .map(|f| quote_ident(&f.column.name))
                .join(", "),
            (0..records.len()).map(|_| row.as_str()).join(", "),
        );

        Ok(vec![self.finish(sql, params)])
    }

    /// Update the given fields of one record, binding them in order and then
    /// the key.
    pub fn update(&self, touched: &[&Field], record: &Record) -> Result<Statement, ValueError> {
        let mut params = vec![];
        for field in touched {
            params.push(field.native_value(record)?);
        }
        self.key_params(record, &mut params)?;

        let assignments = touched
            .iter()
            .map(|f| format!("{} = ?", quote_ident(&f.column.name)))
            .join(", ");

        Ok(self.finish(
            format!(
                "UPDATE {} SET {assignments} WHERE {}",
                self.table, self.key_predicate
            ),
            params,
        ))
    }

    pub fn delete(&self, key: &Record) -> Result<Statement, ValueError> {
        self.delete_by_keys(std::slice::from_ref(key))
    }

    pub fn delete_by_keys(&self, keys: &[Record]) -> Result<Statement, ValueError> {
        let mut params = vec![];
        for key in keys {
            self.key_params(key, &mut params)?;
        }
        Ok(self.finish(
            format!("{} WHERE {}", self.delete, self.keys_predicate(keys.len())),
            params,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rstest::rstest;

    use super::*;
    use crate::data_types::Value;
    use crate::filter::{PredicateCompiler, QueryPredicateCompiler};
    use crate::schema::{Column, Field};
    use crate::testutils::{make_fields, record};

    fn composite_fields() -> Fields {
        let field = |name: &str, t: FieldType, sql_type: SqlType, key: bool, auto: bool| {
            Field::new(
                name,
                t,
                Column {
                    name: name.to_string(),
                    sql_type,
                    key,
                    nullable: !key,
                    auto_increment: auto,
                },
            )
        };

        Fields::try_new(vec![
            field("a", FieldType::Integer, SqlType::Integer, true, false),
            field("b", FieldType::Integer, SqlType::SmallInt, true, true),
            field("c", FieldType::Text, SqlType::Varchar, false, false),
        ])
        .unwrap()
    }

    fn statements(flavor: Flavor) -> Statements {
        Statements::new(flavor, "s", "t", Arc::new(composite_fields()))
    }

    #[test]
    fn test_render_placeholders() {
        assert_eq!(
            Flavor::Postgres.render(r#"SELECT "a?" FROM t WHERE x = ? AND y = '?' AND z = ?"#),
            r#"SELECT "a?" FROM t WHERE x = $1 AND y = '?' AND z = $2"#
        );
        assert_eq!(Flavor::Sqlite.render("x = ?"), "x = ?");
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("plain"), r#""plain""#);
        assert_eq!(quote_ident(r#"we"ird"#), r#""we""ird""#);
    }

    #[test]
    fn test_params_must_all_be_bound() {
        let mut params = Params::with_len(2);
        params.set(1, NativeValue::Integer(1));
        assert!(matches!(
            params.into_values(),
            Err(StatementError::UnboundParameter(0))
        ));
    }

    #[test]
    fn test_find() {
        let key = record(&[("a", Value::Integer(1)), ("b", Value::Integer(2))]);

        let statement = statements(Flavor::Sqlite).find(&key).unwrap();
        assert_eq!(
            statement.sql,
            r#"SELECT "a", "b", "c" FROM "s"."t" WHERE "a" = ? AND "b" = ?"#
        );
        assert_eq!(
            statement.params,
            vec![NativeValue::Integer(1), NativeValue::Integer(2)]
        );

        let statement = statements(Flavor::Postgres).find(&key).unwrap();
        assert_eq!(
            statement.sql,
            r#"SELECT "a", CAST("b" AS INTEGER) AS "b", "c" FROM "s"."t" WHERE "a" = $1 AND "b" = $2"#
        );
    }

    #[rstest]
    #[case(&[], Direction::Ascending, r#" ORDER BY "a" ASC, "b" ASC"#)]
    #[case(&["c", "zzz", "a"], Direction::Descending, r#" ORDER BY "c" DESC, "a" DESC"#)]
    fn test_find_all_ordering(
        #[case] sort: &[&str],
        #[case] direction: Direction,
        #[case] expected: &str,
    ) {
        let sort: Vec<String> = sort.iter().map(|s| s.to_string()).collect();
        let statement = statements(Flavor::Sqlite).find_all(&sort, direction);
        assert_eq!(
            statement.sql,
            format!(r#"SELECT "a", "b", "c" FROM "s"."t"{expected}"#)
        );
    }

    #[test]
    fn test_find_by_keys() {
        let keys = vec![
            record(&[("a", Value::Integer(1)), ("b", Value::Integer(2))]),
            record(&[("a", Value::Integer(3)), ("b", Value::Integer(4))]),
        ];
        let statement = statements(Flavor::Postgres).find_by_keys(&keys).unwrap();
        assert!(statement.sql.ends_with(
            r#"WHERE ("a" = $1 AND "b" = $2) OR ("a" = $3 AND "b" = $4)"#
        ));
        assert_eq!(statement.params.len(), 4);
    }

    #[test]
    fn test_find_page_with_filter() {
        let fields = Arc::new(make_fields());
        let statements = Statements::new(Flavor::Postgres, "public", "t", fields.clone());
        let predicate = QueryPredicateCompiler::new(fields)
            .compile("stringValue=Data 1")
            .unwrap();

        let (page, count) = statements
            .find_page(Some(predicate.as_ref()), 2, 10, &[], Direction::Ascending)
            .unwrap();
        assert!(page.sql.ends_with(
            r#" WHERE "string_value" = $1 ORDER BY "id" ASC OFFSET 20 ROWS FETCH NEXT 10 ROWS ONLY"#
        ));
        assert_eq!(
            count.sql,
            r#"SELECT COUNT(*) FROM "public"."t" WHERE "string_value" = $1"#
        );
        assert_eq!(page.params, count.params);

        let statements = Statements::new(Flavor::Sqlite, "main", "t", Arc::new(make_fields()));
        let (page, count) = statements
            .find_page(None, 0, 5, &["longValue".to_string()], Direction::Descending)
            .unwrap();
        assert!(page
            .sql
            .ends_with(r#" ORDER BY "long_value" DESC LIMIT 5 OFFSET 0"#));
        assert_eq!(count.sql, r#"SELECT COUNT(*) FROM "main"."t""#);
    }

    #[test]
    fn test_insert_batch() {
        let records = vec![
            record(&[("a", Value::Integer(1)), ("c", Value::from("x"))]),
            record(&[("a", Value::Integer(2))]),
        ];

        let statements = statements(Flavor::Sqlite).insert(&records).unwrap();
        assert_eq!(statements.len(), 1);
        assert_eq!(
            statements[0].sql,
            r#"INSERT INTO "s"."t" ("a", "c") VALUES (?, ?), (?, ?) RETURNING "b""#
        );
        assert_eq!(
            statements[0].params,
            vec![
                NativeValue::Integer(1),
                NativeValue::Text("x".to_string()),
                NativeValue::Integer(2),
                NativeValue::Null(FieldType::Text),
            ]
        );
    }

    #[test]
    fn test_insert_default_values() {
        let fields = Fields::try_new(vec![Field::new(
            "id",
            FieldType::Long,
            Column {
                name: "id".to_string(),
                sql_type: SqlType::BigInt,
                key: true,
                nullable: false,
                auto_increment: true,
            },
        )])
        .unwrap();
        let statements = Statements::new(Flavor::Postgres, "public", "seq", Arc::new(fields));

        let inserts = statements
            .insert(&[Record::new(), Record::new()])
            .unwrap();
        assert_eq!(inserts.len(), 2);
        assert_eq!(
            inserts[0].sql,
            r#"INSERT INTO "public"."seq" DEFAULT VALUES RETURNING "id""#
        );
    }

    #[test]
    fn test_update_binds_touched_then_key() {
        let statements = statements(Flavor::Postgres);
        let fields = statements.fields().clone();
        let patch = record(&[
            ("a", Value::Integer(1)),
            ("b", Value::Integer(2)),
            ("c", Value::from("new")),
        ]);

        let touched = fields.touched_fields(&patch);
        let statement = statements.update(&touched, &patch).unwrap();
        assert_eq!(
            statement.sql,
            r#"UPDATE "s"."t" SET "c" = $1 WHERE "a" = $2 AND "b" = $3"#
        );
        assert_eq!(
            statement.params,
            vec![
                NativeValue::Text("new".to_string()),
                NativeValue::Integer(1),
                NativeValue::Integer(2)
            ]
        );
    }

    #[test]
    fn test_delete() {
        let key = record(&[("a", Value::Integer(1)), ("b", Value::Integer(2))]);
        let statement = statements(Flavor::Sqlite).delete(&key).unwrap();
        assert_eq!(
            statement.sql,
            r#"DELETE FROM "s"."t" WHERE "a" = ? AND "b" = ?"#
        );

        let missing = record(&[("a", Value::Integer(1))]);
        assert!(matches!(
            statements(Flavor::Sqlite).delete(&missing),
            Err(ValueError::NullNotAllowed(_))
        ));
    }
}
