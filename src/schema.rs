use std::{collections::HashSet, fmt, str::FromStr};

use bigdecimal::{BigDecimal, ToPrimitive};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use itertools::Itertools;
use thiserror::Error;

use crate::data_types::{
    NativeValue, Record, Value, DATE_FORMAT, TIMESTAMP_FORMAT, TIME_FORMAT,
};

#[derive(Debug, Error)]
pub enum ValueError {
    #[error("Invalid value for field {field}: expected {expected}, got {actual}")]
    InvalidArgument {
        field: String,
        expected: FieldType,
        actual: &'static str,
    },

    #[error("Field {0} does not allow nulls")]
    NullNotAllowed(String),

    #[error("Store returned a null for the non-nullable field {0}")]
    UnexpectedNull(String),

    #[error("Cannot convert {value} to {target}")]
    Coercion { value: String, target: FieldType },

    #[error("Cannot parse {input:?} as {target}")]
    Parse { input: String, target: FieldType },

    #[error("Store returned {actual} for a {expected} field")]
    NativeMismatch { expected: FieldType, actual: String },
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Error reading table metadata: {0}")]
    Find(#[from] sqlx::Error),

    #[error("Unsupported type {type_name} of column {column}")]
    UnsupportedType { column: String, type_name: String },

    #[error("No such table: {schema}.{table}")]
    NoSuchTable { schema: String, table: String },

    #[error("Table has no key fields")]
    NoKeyFields,

    #[error("Duplicate field name {0}")]
    DuplicateField(String),
}

/// The closed set of scalar kinds a column can be exposed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Boolean,
    Integer,
    Long,
    Float,
    Double,
    Decimal,
    Text,
    Date,
    Time,
    Timestamp,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Boolean => "BOOLEAN",
            FieldType::Integer => "INTEGER",
            FieldType::Long => "LONG",
            FieldType::Float => "FLOAT",
            FieldType::Double => "DOUBLE",
            FieldType::Decimal => "DECIMAL",
            FieldType::Text => "TEXT",
            FieldType::Date => "DATE",
            FieldType::Time => "TIME",
            FieldType::Timestamp => "TIMESTAMP",
        };
        write!(f, "{name}")
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT).ok()
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), TIME_FORMAT).ok()
}

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
}

fn format_date(d: &NaiveDate) -> String {
    d.format(DATE_FORMAT).to_string()
}

fn format_time(t: &NaiveTime) -> String {
    t.format(TIME_FORMAT).to_string()
}

fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

fn parse_decimal(s: &str) -> Option<BigDecimal> {
    BigDecimal::from_str(s.trim()).ok()
}

/// Integral value of a numeric (or numeric text) wire value, if it has one.
fn integral_value(value: &Value) -> Option<i128> {
    match value {
        Value::Integer(i) => Some(*i as i128),
        Value::Long(l) => Some(*l as i128),
        Value::Float(f) => integral_f64(*f as f64),
        Value::Double(d) => integral_f64(*d),
        Value::Decimal(d) => d.is_integer().then(|| d.to_i128()).flatten(),
        Value::Text(s) => s
            .trim()
            .parse::<i128>()
            .ok()
            .or_else(|| parse_decimal(s).and_then(|d| integral_value(&Value::Decimal(d)))),
        _ => None,
    }
}

fn integral_f64(d: f64) -> Option<i128> {
    // Bounds are wide enough for i64 and exclude everything that would saturate
    if d.is_finite() && d.fract() == 0.0 && d.abs() < 1e19 {
        Some(d as i128)
    } else {
        None
    }
}

/// Numeric value of a wire value as f64, if it has an exact or
/// closest-decimal representation.
fn float_value(value: &Value) -> Option<f64> {
    let d = match value {
        Value::Integer(i) => *i as f64,
        Value::Long(l) => {
            let d = *l as f64;
            if d as i128 != *l as i128 {
                return None;
            }
            d
        }
        Value::Float(f) => f.to_string().parse::<f64>().ok()?,
        Value::Double(d) => *d,
        Value::Decimal(d) => d.to_f64()?,
        Value::Text(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    d.is_finite().then_some(d)
}

impl FieldType {
    /// Whether the value already has this type's canonical wire shape.
    pub fn is_wire_native(&self, value: &Value) -> bool {
        match (self, value) {
            (FieldType::Boolean, Value::Boolean(_))
            | (FieldType::Integer, Value::Integer(_))
            | (FieldType::Long, Value::Long(_))
            | (FieldType::Float, Value::Float(_))
            | (FieldType::Double, Value::Double(_))
            | (FieldType::Decimal, Value::Decimal(_))
            | (FieldType::Text, Value::Text(_)) => true,
            (FieldType::Date, Value::Text(s)) => parse_date(s).is_some(),
            (FieldType::Time, Value::Text(s)) => parse_time(s).is_some(),
            (FieldType::Timestamp, Value::Text(s)) => parse_timestamp(s).is_some(),
            _ => false,
        }
    }

    /// Convert a loosely shaped wire value into this type's canonical shape.
    /// Conversions that would lose information are rejected.
    pub fn coerce(&self, value: &Value) -> Result<Value, ValueError> {
        let coerced = match self {
            FieldType::Boolean => match value {
                Value::Boolean(b) => Some(Value::Boolean(*b)),
                Value::Text(s) => parse_bool(s).map(Value::Boolean),
                _ => None,
            },
            FieldType::Integer => integral_value(value)
                .and_then(|i| i32::try_from(i).ok())
                .map(Value::Integer),
            FieldType::Long => integral_value(value)
                .and_then(|i| i64::try_from(i).ok())
                .map(Value::Long),
            FieldType::Float => match value {
                Value::Float(f) => Some(Value::Float(*f)),
                Value::Integer(i) if (*i as f32) as i128 == *i as i128 => {
                    Some(Value::Float(*i as f32))
                }
                Value::Long(l) if (*l as f32) as i128 == *l as i128 => {
                    Some(Value::Float(*l as f32))
                }
                Value::Integer(_) | Value::Long(_) => None,
                other => float_value(other)
                    .filter(|d| d.abs() <= f32::MAX as f64)
                    .map(|d| Value::Float(d as f32)),
            },
            FieldType::Double => float_value(value).map(Value::Double),
            FieldType::Decimal => match value {
                Value::Decimal(d) => Some(Value::Decimal(d.clone())),
                Value::Integer(i) => Some(Value::Decimal(BigDecimal::from(*i))),
                Value::Long(l) => Some(Value::Decimal(BigDecimal::from(*l))),
                Value::Float(f) if f.is_finite() => {
                    parse_decimal(&f.to_string()).map(Value::Decimal)
                }
                Value::Double(d) if d.is_finite() => {
                    parse_decimal(&d.to_string()).map(Value::Decimal)
                }
                Value::Text(s) => parse_decimal(s).map(Value::Decimal),
                _ => None,
            },
            FieldType::Text => match value {
                Value::Text(s) => Some(Value::Text(s.clone())),
                _ => None,
            },
            FieldType::Date => match value {
                Value::Text(s) => parse_date(s).map(|d| Value::Text(format_date(&d))),
                _ => None,
            },
            FieldType::Time => match value {
                Value::Text(s) => parse_time(s).map(|t| Value::Text(format_time(&t))),
                _ => None,
            },
            FieldType::Timestamp => match value {
                Value::Text(s) => {
                    parse_timestamp(s).map(|ts| Value::Text(format_timestamp(&ts)))
                }
                _ => None,
            },
        };

        coerced.ok_or_else(|| ValueError::Coercion {
            value: format!("{} {}", value.kind(), value),
            target: *self,
        })
    }

    /// Parse the canonical textual form of this type.
    pub fn parse(&self, s: &str) -> Result<Value, ValueError> {
        let parsed = match self {
            FieldType::Boolean => parse_bool(s).map(Value::Boolean),
            FieldType::Integer => s.trim().parse::<i32>().ok().map(Value::Integer),
            FieldType::Long => s.trim().parse::<i64>().ok().map(Value::Long),
            FieldType::Float => s
                .trim()
                .parse::<f32>()
                .ok()
                .filter(|f| f.is_finite())
                .map(Value::Float),
            FieldType::Double => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|d| d.is_finite())
                .map(Value::Double),
            FieldType::Decimal => parse_decimal(s).map(Value::Decimal),
            FieldType::Text => Some(Value::Text(s.to_string())),
            FieldType::Date => parse_date(s).map(|d| Value::Text(format_date(&d))),
            FieldType::Time => parse_time(s).map(|t| Value::Text(format_time(&t))),
            FieldType::Timestamp => {
                parse_timestamp(s).map(|ts| Value::Text(format_timestamp(&ts)))
            }
        };

        parsed.ok_or_else(|| ValueError::Parse {
            input: s.to_string(),
            target: *self,
        })
    }

    /// Store representation of a wire value, `None` if the value does not
    /// have this type's wire shape.
    pub fn to_native(&self, value: &Value) -> Option<NativeValue> {
        match (self, value) {
            (_, Value::Null) => Some(NativeValue::Null(*self)),
            (FieldType::Boolean, Value::Boolean(b)) => Some(NativeValue::Boolean(*b)),
            (FieldType::Integer, Value::Integer(i)) => Some(NativeValue::Integer(*i)),
            (FieldType::Long, Value::Long(l)) => Some(NativeValue::Long(*l)),
            (FieldType::Float, Value::Float(f)) => Some(NativeValue::Float(*f)),
            (FieldType::Double, Value::Double(d)) => Some(NativeValue::Double(*d)),
            (FieldType::Decimal, Value::Decimal(d)) => Some(NativeValue::Decimal(d.clone())),
            (FieldType::Text, Value::Text(s)) => Some(NativeValue::Text(s.clone())),
            (FieldType::Date, Value::Text(s)) => parse_date(s).map(NativeValue::Date),
            (FieldType::Time, Value::Text(s)) => parse_time(s).map(NativeValue::Time),
            (FieldType::Timestamp, Value::Text(s)) => {
                parse_timestamp(s).map(NativeValue::Timestamp)
            }
            _ => None,
        }
    }

    /// Wire representation of a value read from the store. A null maps to
    /// `Value::Null`; nullability is checked by the owning field.
    pub fn from_native(&self, native: NativeValue) -> Result<Value, ValueError> {
        let value = match (self, native) {
            (_, NativeValue::Null(_)) => Value::Null,
            (FieldType::Boolean, NativeValue::Boolean(b)) => Value::Boolean(b),
            (FieldType::Integer, NativeValue::Integer(i)) => Value::Integer(i),
            (FieldType::Long, NativeValue::Long(l)) => Value::Long(l),
            (FieldType::Long, NativeValue::Integer(i)) => Value::Long(i as i64),
            (FieldType::Float, NativeValue::Float(f)) => Value::Float(f),
            (FieldType::Double, NativeValue::Double(d)) => Value::Double(d),
            (FieldType::Double, NativeValue::Float(f)) => Value::Double(f as f64),
            (FieldType::Decimal, NativeValue::Decimal(d)) => Value::Decimal(d),
            (FieldType::Text, NativeValue::Text(s)) => Value::Text(s),
            (FieldType::Date, NativeValue::Date(d)) => Value::Text(format_date(&d)),
            (FieldType::Time, NativeValue::Time(t)) => Value::Text(format_time(&t)),
            (FieldType::Timestamp, NativeValue::Timestamp(ts)) => {
                Value::Text(format_timestamp(&ts))
            }
            (_, other) => {
                return Err(ValueError::NativeMismatch {
                    expected: *self,
                    actual: format!("{other:?}"),
                })
            }
        };
        Ok(value)
    }
}

/// Column type as declared in the store catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SqlType {
    Bit,
    Boolean,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Real,
    Float,
    Double,
    Decimal,
    Numeric,
    Char,
    Varchar,
    LongVarchar,
    Date,
    Time,
    Timestamp,
    Other(String),
}

impl SqlType {
    /// Classify a declared type name such as `VARCHAR(10)`, `int8` or
    /// `timestamp without time zone`. Length and precision are ignored.
    pub fn from_type_name(type_name: &str) -> Self {
        let mut base = String::with_capacity(type_name.len());
        let mut depth = 0;
        for c in type_name.chars() {
            match c {
                '(' => depth += 1,
                ')' => depth -= 1,
                _ if depth == 0 => base.push(c.to_ascii_lowercase()),
                _ => {}
            }
        }
        let base = base.split_whitespace().join(" ");

        match base.as_str() {
            "bit" => SqlType::Bit,
            "boolean" | "bool" => SqlType::Boolean,
            "tinyint" => SqlType::TinyInt,
            "smallint" | "int2" | "smallserial" => SqlType::SmallInt,
            "integer" | "int" | "int4" | "mediumint" | "serial" => SqlType::Integer,
            "bigint" | "int8" | "bigserial" => SqlType::BigInt,
            "real" | "float4" => SqlType::Real,
            "float" => SqlType::Float,
            "double" | "double precision" | "float8" => SqlType::Double,
            "decimal" => SqlType::Decimal,
            "numeric" => SqlType::Numeric,
            "char" | "character" | "bpchar" | "nchar" => SqlType::Char,
            "varchar" | "character varying" | "nvarchar" => SqlType::Varchar,
            "text" | "clob" | "longvarchar" => SqlType::LongVarchar,
            "date" => SqlType::Date,
            "time" | "time without time zone" => SqlType::Time,
            "timestamp" | "timestamp without time zone" | "datetime" => SqlType::Timestamp,
            _ => SqlType::Other(type_name.to_string()),
        }
    }

    pub fn field_type(&self) -> Option<FieldType> {
        let field_type = match self {
            SqlType::Bit | SqlType::Boolean => FieldType::Boolean,
            SqlType::TinyInt | SqlType::SmallInt | SqlType::Integer => FieldType::Integer,
            SqlType::BigInt => FieldType::Long,
            SqlType::Real | SqlType::Float => FieldType::Float,
            SqlType::Double => FieldType::Double,
            SqlType::Decimal | SqlType::Numeric => FieldType::Decimal,
            SqlType::Char | SqlType::Varchar | SqlType::LongVarchar => FieldType::Text,
            SqlType::Date => FieldType::Date,
            SqlType::Time => FieldType::Time,
            SqlType::Timestamp => FieldType::Timestamp,
            SqlType::Other(_) => return None,
        };
        Some(field_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub sql_type: SqlType,
    pub key: bool,
    pub nullable: bool,
    pub auto_increment: bool,
}

/// A column exposed under its wire name and type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub r#type: FieldType,
    pub column: Column,
}

impl Field {
    pub fn new(name: impl Into<String>, r#type: FieldType, column: Column) -> Self {
        Self {
            name: name.into(),
            r#type,
            column,
        }
    }

    pub fn is_key(&self) -> bool {
        self.column.key
    }

    /// Store value for this field in the record. A missing entry counts as
    /// null.
    pub fn native_value(&self, record: &Record) -> Result<NativeValue, ValueError> {
        match record.get(&self.name) {
            None | Some(Value::Null) => {
                if self.column.nullable {
                    Ok(NativeValue::Null(self.r#type))
                } else {
                    Err(ValueError::NullNotAllowed(self.name.clone()))
                }
            }
            Some(value) => {
                self.r#type
                    .to_native(value)
                    .ok_or_else(|| ValueError::InvalidArgument {
                        field: self.name.clone(),
                        expected: self.r#type,
                        actual: value.kind(),
                    })
            }
        }
    }

    /// Write a value read from the store into the record. Nulls leave the
    /// record without an entry for this field.
    pub fn set_from_native(
        &self,
        record: &mut Record,
        native: NativeValue,
    ) -> Result<(), ValueError> {
        if native.is_null() {
            return if self.column.nullable {
                Ok(())
            } else {
                Err(ValueError::UnexpectedNull(self.name.clone()))
            };
        }

        let value = self.r#type.from_native(native)?;
        record.insert(self.name.clone(), value);
        Ok(())
    }

    pub fn exists_as_wire_type(&self, record: &Record) -> bool {
        record
            .get(&self.name)
            .map(|v| self.r#type.is_wire_native(v))
            .unwrap_or(false)
    }

    pub fn coerce(&self, value: &Value) -> Result<Value, ValueError> {
        self.r#type.coerce(value)
    }

    pub fn parse(&self, s: &str) -> Result<Value, ValueError> {
        self.r#type.parse(s)
    }
}

/// The ordered field set of a table. Always has at least one key field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fields {
    fields: Vec<Field>,
}

impl Fields {
    pub fn try_new(fields: Vec<Field>) -> Result<Self, SchemaError> {
        let mut seen = HashSet::new();
        for field in &fields {
            if !seen.insert(field.name.as_str()) {
                return Err(SchemaError::DuplicateField(field.name.clone()));
            }
        }

        if !fields.iter().any(Field::is_key) {
            return Err(SchemaError::NoKeyFields);
        }

        Ok(Self { fields })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn key_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.is_key())
    }

    pub fn mutable_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| !f.is_key())
    }

    pub fn auto_increment_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.column.auto_increment)
    }

    pub fn has_auto_increment(&self) -> bool {
        self.auto_increment_fields().next().is_some()
    }

    /// Columns named by an INSERT: non-generated keys, then non-generated
    /// mutable fields.
    pub fn insertable_fields(&self) -> Vec<&Field> {
        self.key_fields()
            .chain(self.mutable_fields())
            .filter(|f| !f.column.auto_increment)
            .collect()
    }

    /// Mutable fields present in the record with their wire type.
    pub fn touched_fields(&self, record: &Record) -> Vec<&Field> {
        self.mutable_fields()
            .filter(|f| f.exists_as_wire_type(record))
            .collect()
    }

    /// Resolve requested sort names in the caller's order. Unknown names are
    /// skipped; with nothing left the key fields are used.
    pub fn sort_fields(&self, names: &[String]) -> Vec<&Field> {
        let fields: Vec<&Field> = names
            .iter()
            .filter_map(|n| self.get(n))
            .unique_by(|f| f.name.as_str())
            .collect();

        if fields.is_empty() {
            self.key_fields().collect()
        } else {
            fields
        }
    }

    /// Project the key fields out of a record.
    pub fn key_of(&self, record: &Record) -> Record {
        self.key_fields()
            .filter_map(|f| record.get(&f.name).map(|v| (f.name.clone(), v.clone())))
            .collect()
    }

    /// Bring every known field of a loosely typed record into its wire
    /// shape. Unknown entries are dropped; nulls pass through.
    pub fn coerce_record(&self, record: &Record) -> Result<Record, ValueError> {
        let mut coerced = Record::with_capacity(record.len());
        for (name, value) in record {
            let Some(field) = self.get(name) else {
                continue;
            };
            let value = if value.is_null() || field.r#type.is_wire_native(value) {
                value.clone()
            } else {
                field.coerce(value)?
            };
            coerced.insert(name.clone(), value);
        }
        Ok(coerced)
    }
}

impl<'a> IntoIterator for &'a Fields {
    type Item = &'a Field;
    type IntoIter = std::slice::Iter<'a, Field>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}
