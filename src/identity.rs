use std::fmt::Debug;

use base64::{engine::general_purpose::STANDARD, Engine};
use thiserror::Error;

use crate::{
    data_types::{record_from_json, record_to_json, Record, Value},
    schema::{Field, Fields, ValueError},
};

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Invalid identifier {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Invalid identifier: {0}")]
    Parse(#[from] ValueError),

    #[error("Cannot encode identifier: {0}")]
    Encode(String),
}

/// Serialization used for composite identifiers.
pub trait RecordCodec: Send + Sync + Debug {
    fn decode(&self, bytes: &[u8]) -> Result<Record, String>;

    fn encode(&self, record: &Record) -> Result<Vec<u8>, String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonRecordCodec;

impl RecordCodec for JsonRecordCodec {
    fn decode(&self, bytes: &[u8]) -> Result<Record, String> {
        let json: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
        record_from_json(json)
    }

    fn encode(&self, record: &Record) -> Result<Vec<u8>, String> {
        serde_json::to_vec(&record_to_json(record)).map_err(|e| e.to_string())
    }
}

/// Turns external identifiers into key records and back.
///
/// A table with a single key field uses the text form of that field. A
/// composite key is the base64 of the codec-encoded key record.
#[derive(Debug)]
pub struct IdentityParser {
    key_fields: Vec<Field>,
    codec: Box<dyn RecordCodec>,
}

impl IdentityParser {
    pub fn new(fields: &Fields) -> Self {
        Self::with_codec(fields, Box::new(JsonRecordCodec))
    }

    pub fn with_codec(fields: &Fields, codec: Box<dyn RecordCodec>) -> Self {
        Self {
            key_fields: fields.key_fields().cloned().collect(),
            codec,
        }
    }

    pub fn parse(&self, key: &str) -> Result<Record, IdentityError> {
        match self.key_fields.as_slice() {
            [] => Err(invalid_key(key, "table has no key fields")),
            [field] => {
                let value = field.parse(key)?;
                Ok(Record::from([(field.name.clone(), value)]))
            }
            fields => {
                let bytes = STANDARD
                    .decode(key)
                    .map_err(|e| invalid_key(key, e.to_string()))?;
                let decoded = self
                    .codec
                    .decode(&bytes)
                    .map_err(|e| invalid_key(key, e))?;

                let mut record = Record::with_capacity(fields.len());
                for field in fields {
                    let value = decoded
                        .get(&field.name)
                        .filter(|v| !v.is_null())
                        .ok_or_else(|| {
                            invalid_key(key, format!("missing field {}", field.name))
                        })?;

                    let value = if field.r#type.is_wire_native(value) {
                        value.clone()
                    } else {
                        field.coerce(value).map_err(|e| {
                            invalid_key(key, format!("field {}: {e}", field.name))
                        })?
                    };
                    record.insert(field.name.clone(), value);
                }
                Ok(record)
            }
        }
    }

    pub fn encode(&self, record: &Record) -> Result<String, IdentityError> {
        let value_of = |field: &Field| -> Result<Value, IdentityError> {
            record
                .get(&field.name)
                .filter(|v| !v.is_null())
                .cloned()
                .ok_or_else(|| IdentityError::Encode(format!("missing key field {}", field.name)))
        };

        match self.key_fields.as_slice() {
            [] => Err(IdentityError::Encode("table has no key fields".to_string())),
            [field] => Ok(value_of(field)?.to_string()),
            fields => {
                let key = fields
                    .iter()
                    .map(|f| value_of(f).map(|v| (f.name.clone(), v)))
                    .collect::<Result<Record, _>>()?;
                let bytes = self.codec.encode(&key).map_err(IdentityError::Encode)?;
                Ok(STANDARD.encode(bytes))
            }
        }
    }
}

fn invalid_key(key: &str, reason: impl Into<String>) -> IdentityError {
    IdentityError::InvalidKey {
        key: key.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use base64::{engine::general_purpose::STANDARD, Engine};

    use super::*;
    use crate::schema::{Column, Field, FieldType, SqlType};
    use crate::testutils::{make_fields, record};

    fn composite_fields() -> Fields {
        let key = |name: &str, column: &str, t: FieldType, sql_type: SqlType| {
            Field::new(
                name,
                t,
                Column {
                    name: column.to_string(),
                    sql_type,
                    key: true,
                    nullable: false,
                    auto_increment: false,
                },
            )
        };

        Fields::try_new(vec![
            key("tenant", "tenant", FieldType::Text, SqlType::Varchar),
            key("seq", "seq", FieldType::Long, SqlType::BigInt),
            key("day", "day", FieldType::Date, SqlType::Date),
        ])
        .unwrap()
    }

    #[test]
    fn test_single_key() {
        let parser = IdentityParser::new(&make_fields());

        assert_eq!(
            parser.parse("42").unwrap(),
            record(&[("id", Value::Integer(42))])
        );
        assert!(matches!(
            parser.parse("forty-two"),
            Err(IdentityError::Parse(_))
        ));
        assert_eq!(
            parser
                .encode(&record(&[("id", Value::Integer(42)), ("x", Value::from("y"))]))
                .unwrap(),
            "42"
        );
    }

    #[test]
    fn test_composite_key_coerces_loose_values() {
        let parser = IdentityParser::new(&composite_fields());
        let id = STANDARD.encode(r#"{"tenant":"acme","seq":"17","day":"2024-01-31"}"#);

        assert_eq!(
            parser.parse(&id).unwrap(),
            record(&[
                ("tenant", Value::from("acme")),
                ("seq", Value::Long(17)),
                ("day", Value::from("2024-01-31")),
            ])
        );
    }

    #[test]
    fn test_composite_key_encode_then_parse() {
        let parser = IdentityParser::new(&composite_fields());
        let key = record(&[
            ("tenant", Value::from("acme")),
            ("seq", Value::Long(5_000_000_000)),
            ("day", Value::from("2024-01-31")),
        ]);

        let id = parser.encode(&key).unwrap();
        assert_eq!(parser.parse(&id).unwrap(), key);
    }

    #[test]
    fn test_composite_key_errors() {
        let parser = IdentityParser::new(&composite_fields());

        let missing = STANDARD.encode(r#"{"tenant":"acme","day":"2024-01-31"}"#);
        let err = parser.parse(&missing).unwrap_err();
        assert!(matches!(err, IdentityError::InvalidKey { .. }));
        assert!(err.to_string().contains("seq"));

        let wrong = STANDARD.encode(r#"{"tenant":1,"seq":1,"day":"2024-01-31"}"#);
        let err = parser.parse(&wrong).unwrap_err();
        assert!(err.to_string().contains("tenant"));

        assert!(matches!(
            parser.parse("not base64!"),
            Err(IdentityError::InvalidKey { .. })
        ));
        assert!(matches!(
            parser.parse(&STANDARD.encode("[1, 2]")),
            Err(IdentityError::InvalidKey { .. })
        ));
    }
}
