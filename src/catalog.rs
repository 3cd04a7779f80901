use async_trait::async_trait;
use tracing::{debug, info};

use crate::schema::{Column, Field, SchemaError, SqlType};

/// A column as reported by the store catalog.
#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Eq)]
pub struct ColumnMetadata {
    pub name: String,
    pub type_name: String,
    pub nullable: bool,
    pub auto_increment: bool,
}

/// Catalog access for one store. Columns come back in catalog order.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn primary_key_names(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<Vec<String>, sqlx::Error>;

    async fn columns(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<Vec<ColumnMetadata>, sqlx::Error>;
}

/// Convert a storage name such as `first_name` to its wire name `firstName`.
pub fn to_field_name(column_name: &str) -> String {
    let mut name = String::with_capacity(column_name.len());
    let mut upper_next = false;

    for c in column_name.chars() {
        if c == '_' {
            upper_next = !name.is_empty();
        } else if upper_next {
            name.extend(c.to_uppercase());
            upper_next = false;
        } else {
            name.extend(c.to_lowercase());
        }
    }

    name
}

fn to_field(metadata: ColumnMetadata, primary_keys: &[String]) -> Result<Field, SchemaError> {
    let sql_type = SqlType::from_type_name(&metadata.type_name);
    let field_type = sql_type
        .field_type()
        .ok_or_else(|| SchemaError::UnsupportedType {
            column: metadata.name.clone(),
            type_name: metadata.type_name.clone(),
        })?;

    let column = Column {
        key: primary_keys.contains(&metadata.name),
        name: metadata.name,
        sql_type,
        nullable: metadata.nullable,
        auto_increment: metadata.auto_increment,
    };

    Ok(Field::new(to_field_name(&column.name), field_type, column))
}

/// Build the field list of a table from catalog metadata. A table that
/// doesn't exist has no columns and yields an empty list.
pub async fn discover_fields(
    source: &dyn MetadataSource,
    schema: &str,
    table: &str,
) -> Result<Vec<Field>, SchemaError> {
    let primary_keys = source.primary_key_names(schema, table).await?;
    let columns = source.columns(schema, table).await?;
    debug!(
        "Catalog reports {} column(s) and primary key {primary_keys:?} for {schema}.{table}",
        columns.len()
    );

    let fields = columns
        .into_iter()
        .map(|c| to_field(c, &primary_keys))
        .collect::<Result<Vec<_>, _>>()?;

    for field in &fields {
        info!(
            "Discovered field {} ({}) on column {}",
            field.name, field.r#type, field.column.name
        );
    }

    Ok(fields)
}
