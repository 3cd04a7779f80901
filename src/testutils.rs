use crate::{
    data_types::{Record, Value},
    schema::{Column, Field, FieldType, Fields, SqlType},
};

pub fn record(entries: &[(&str, Value)]) -> Record {
    entries
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

/// The fields of the data table used throughout the tests: an `id` key and
/// one field of every type, all nullable except `integerValue`.
pub fn make_fields() -> Fields {
    let field = |name: &str, column: &str, r#type: FieldType, sql_type: SqlType| {
        let key = name == "id";
        Field::new(
            name,
            r#type,
            Column {
                name: column.to_string(),
                sql_type,
                key,
                nullable: !key && name != "integerValue",
                auto_increment: false,
            },
        )
    };

    Fields::try_new(vec![
        field("id", "id", FieldType::Integer, SqlType::Integer),
        field("booleanValue", "boolean_value", FieldType::Boolean, SqlType::Boolean),
        field("integerValue", "integer_value", FieldType::Integer, SqlType::Integer),
        field("longValue", "long_value", FieldType::Long, SqlType::BigInt),
        field("floatValue", "float_value", FieldType::Float, SqlType::Real),
        field("doubleValue", "double_value", FieldType::Double, SqlType::Double),
        field("decimalValue", "decimal_value", FieldType::Decimal, SqlType::Decimal),
        field("stringValue", "string_value", FieldType::Text, SqlType::Varchar),
        field("dateValue", "date_value", FieldType::Date, SqlType::Date),
        field("timeValue", "time_value", FieldType::Time, SqlType::Time),
        field(
            "timestampValue",
            "timestamp_value",
            FieldType::Timestamp,
            SqlType::Timestamp,
        ),
    ])
    .expect("test fields are valid")
}
