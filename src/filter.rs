//! Compiles filter queries such as `name=Data 1 && (count>=3 || flag=true)`
//! into a SQL condition with positional parameters.
//!
//! Operators: `=`, `!=`, `>`, `>=`, `<`, `<=`, `~` (LIKE, text fields only)
//! and `!~`. Conditions combine with `&&` (binds tighter) and `||`, can be
//! grouped with parentheses and negated with `!`. A value runs up to the
//! next `&&`, `||` or `)` unless it is quoted. `field=null` and
//! `field!=null` test for nulls.
use std::{fmt::Debug, sync::Arc};

use thiserror::Error;

use crate::{
    data_types::NativeValue,
    repository::statements::{quote_ident, Params},
    schema::{Field, FieldType, Fields, ValueError},
};

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("Invalid filter {query:?} at position {position}: {message}")]
    Syntax {
        query: String,
        position: usize,
        message: String,
    },

    #[error("Unknown field {0:?} in filter")]
    UnknownField(String),

    #[error("Invalid value for field {field} in filter: {source}")]
    InvalidValue { field: String, source: ValueError },

    #[error("Operator {operator} is not supported for field {field}")]
    UnsupportedOperator { operator: String, field: String },
}

/// A compiled filter: a SQL condition using `?` placeholders and the
/// values that go with them.
pub trait Predicate: Send + Sync + Debug {
    fn to_sql_fragment(&self) -> &str;

    /// Bind the filter values starting at `start_index`, returning the next
    /// free index.
    fn bind(&self, params: &mut Params, start_index: usize) -> usize;
}

pub trait PredicateCompiler: Send + Sync + Debug {
    fn compile(&self, query: &str) -> Result<Box<dyn Predicate>, FilterError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledPredicate {
    sql: String,
    values: Vec<NativeValue>,
}

impl CompiledPredicate {
    pub fn values(&self) -> &[NativeValue] {
        &self.values
    }
}

impl Predicate for CompiledPredicate {
    fn to_sql_fragment(&self) -> &str {
        &self.sql
    }

    fn bind(&self, params: &mut Params, start_index: usize) -> usize {
        for (offset, value) in self.values.iter().enumerate() {
            params.set(start_index + offset, value.clone());
        }
        start_index + self.values.len()
    }
}

/// Compiles filter queries against the wire names of a field set.
#[derive(Debug, Clone)]
pub struct QueryPredicateCompiler {
    fields: Arc<Fields>,
}

impl QueryPredicateCompiler {
    pub fn new(fields: Arc<Fields>) -> Self {
        Self { fields }
    }
}

impl PredicateCompiler for QueryPredicateCompiler {
    fn compile(&self, query: &str) -> Result<Box<dyn Predicate>, FilterError> {
        let mut parser = QueryParser {
            query,
            pos: 0,
            fields: &self.fields,
            values: vec![],
        };

        let sql = parser.parse_or()?;
        parser.skip_whitespace();
        if parser.pos < query.len() {
            return Err(parser.syntax_error("unexpected input"));
        }

        Ok(Box::new(CompiledPredicate {
            sql,
            values: parser.values,
        }))
    }
}

const OPERATORS: [&str; 8] = [">=", "<=", "!=", "!~", "=", ">", "<", "~"];

struct QueryParser<'a> {
    query: &'a str,
    pos: usize,
    fields: &'a Fields,
    values: Vec<NativeValue>,
}

impl<'a> QueryParser<'a> {
    fn rest(&self) -> &'a str {
        &self.query[self.pos..]
    }

    fn skip_whitespace(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn eat(&mut self, token: &str) -> bool {
        self.skip_whitespace();
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn syntax_error(&self, message: &str) -> FilterError {
        FilterError::Syntax {
            query: self.query.to_string(),
            position: self.pos,
            message: message.to_string(),
        }
    }

    fn parse_or(&mut self) -> Result<String, FilterError> {
        let mut terms = vec![self.parse_and()?];
        while self.eat("||") {
            terms.push(self.parse_and()?);
        }
        Ok(join_terms(terms, " OR "))
    }

    fn parse_and(&mut self) -> Result<String, FilterError> {
        let mut terms = vec![self.parse_primary()?];
        while self.eat("&&") {
            terms.push(self.parse_primary()?);
        }
        Ok(join_terms(terms, " AND "))
    }

    fn parse_primary(&mut self) -> Result<String, FilterError> {
        if self.eat("(") {
            let inner = self.parse_or()?;
            if !self.eat(")") {
                return Err(self.syntax_error("expected ')'"));
            }
            return Ok(format!("({inner})"));
        }

        if self.eat("!") {
            let inner = self.parse_primary()?;
            return Ok(format!("NOT ({inner})"));
        }

        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<String, FilterError> {
        self.skip_whitespace();
        let name: String = self
            .rest()
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        if name.is_empty() {
            return Err(self.syntax_error("expected a field name"));
        }
        self.pos += name.len();

        let fields = self.fields;
        let field = fields
            .get(&name)
            .ok_or_else(|| FilterError::UnknownField(name.clone()))?;

        self.skip_whitespace();
        let operator = OPERATORS
            .iter()
            .find(|op| self.rest().starts_with(**op))
            .copied()
            .ok_or_else(|| self.syntax_error("expected an operator"))?;
        self.pos += operator.len();

        let (raw, quoted) = self.parse_value()?;
        self.compile_condition(field, operator, &raw, quoted)
    }

    fn parse_value(&mut self) -> Result<(String, bool), FilterError> {
        self.skip_whitespace();
        let rest = self.rest();

        if let Some(quote) = rest.chars().next().filter(|c| *c == '"' || *c == '\'') {
            let body = &rest[1..];
            let end = body
                .find(quote)
                .ok_or_else(|| self.syntax_error("unterminated quoted value"))?;
            self.pos += end + 2;
            return Ok((body[..end].to_string(), true));
        }

        let end = ["&&", "||", ")"]
            .iter()
            .filter_map(|t| rest.find(t))
            .min()
            .unwrap_or(rest.len());
        self.pos += end;
        Ok((rest[..end].trim_end().to_string(), false))
    }

    fn compile_condition(
        &mut self,
        field: &Field,
        operator: &str,
        raw: &str,
        quoted: bool,
    ) -> Result<String, FilterError> {
        let column = quote_ident(&field.column.name);
        let unsupported = || FilterError::UnsupportedOperator {
            operator: operator.to_string(),
            field: field.name.clone(),
        };

        if !quoted && raw.eq_ignore_ascii_case("null") {
            return match operator {
                "=" => Ok(format!("{column} IS NULL")),
                "!=" => Ok(format!("{column} IS NOT NULL")),
                _ => Err(unsupported()),
            };
        }

        let sql_operator = match operator {
            "~" | "!~" if field.r#type != FieldType::Text => return Err(unsupported()),
            "~" => "LIKE",
            "!~" => "NOT LIKE",
            "!=" => "<>",
            other => other,
        };

        let invalid = |source: ValueError| FilterError::InvalidValue {
            field: field.name.clone(),
            source,
        };
        let value = field.parse(raw).map_err(invalid)?;
        let native = field.r#type.to_native(&value).ok_or_else(|| {
            invalid(ValueError::Parse {
                input: raw.to_string(),
                target: field.r#type,
            })
        })?;
        self.values.push(native);

        Ok(format!("{column} {sql_operator} ?"))
    }
}

fn join_terms(terms: Vec<String>, separator: &str) -> String {
    if terms.len() == 1 {
        terms.into_iter().collect()
    } else {
        format!("({})", terms.join(separator))
    }
}
