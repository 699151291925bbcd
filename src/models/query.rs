//! Query-related data models.
//!
//! This module defines the query tokens accepted by every verb, the parameter
//! values bound to them, and the result shapes handed back to callers.

use crate::error::{DbError, DbResult};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
    /// JSON document
    Json(JsonValue),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
        }
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for QueryParam {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for QueryParam {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<JsonValue> for QueryParam {
    fn from(v: JsonValue) -> Self {
        Self::Json(v)
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// A structured query: SQL text plus the values bound to its placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlQuery {
    sql: String,
    #[serde(default)]
    values: Vec<QueryParam>,
}

impl SqlQuery {
    /// Create a query with no bound values.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            values: Vec::new(),
        }
    }

    /// Bind the next positional value.
    pub fn bind(mut self, value: impl Into<QueryParam>) -> Self {
        self.values.push(value.into());
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn values(&self) -> &[QueryParam] {
        &self.values
    }

    /// Wrap this query in another statement, keeping its bound values.
    ///
    /// `template` must contain `{}` exactly where the inner query goes.
    pub fn wrap(&self, template: &str) -> Self {
        Self {
            sql: template.replacen("{}", &self.sql, 1),
            values: self.values.clone(),
        }
    }

    /// Check that the query is executable.
    ///
    /// Rejects empty SQL and `$n` placeholders beyond the number of bound values.
    pub fn validate(&self) -> DbResult<()> {
        if self.sql.trim().is_empty() {
            return Err(DbError::validation("SQL text cannot be empty"));
        }
        if let Some(highest) = highest_placeholder(&self.sql) {
            if highest > self.values.len() {
                return Err(DbError::validation(format!(
                    "query references ${} but only {} value(s) are bound",
                    highest,
                    self.values.len()
                )));
            }
        }
        Ok(())
    }
}

/// Highest `$n` placeholder index outside quoted text.
fn highest_placeholder(sql: &str) -> Option<usize> {
    let bytes = sql.as_bytes();
    let mut highest: Option<usize> = None;
    let mut quote: Option<u8> = None;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if end > start {
                    if let Ok(n) = sql[start..end].parse::<usize>() {
                        highest = Some(highest.map_or(n, |h| h.max(n)));
                    }
                    i = end;
                    continue;
                }
            }
            None => {}
        }
        i += 1;
    }

    highest
}

/// Anything a caller may hand to a query verb.
///
/// Only [`SqlToken::Query`] is executable; the other variants exist so that
/// strings and identifier fragments are rejected up front instead of being
/// sent to the database with missing bindings.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlToken {
    Query(SqlQuery),
    /// Quoted (possibly schema-qualified) identifier, usable inside SQL text.
    Identifier(Vec<String>),
    /// Plain SQL text with no binding information.
    Raw(String),
}

impl SqlToken {
    /// Build an identifier token from its path segments.
    pub fn identifier<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Identifier(names.into_iter().map(Into::into).collect())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Query(_) => "query",
            Self::Identifier(_) => "identifier",
            Self::Raw(_) => "raw string",
        }
    }

    /// Unwrap an executable query, failing for any other token.
    pub fn into_query(self) -> DbResult<SqlQuery> {
        match self {
            Self::Query(query) => {
                query.validate()?;
                Ok(query)
            }
            other => Err(DbError::validation(format!(
                "expected a SQL query token, got a {}",
                other.kind()
            ))),
        }
    }
}

impl fmt::Display for SqlToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Query(query) => write!(f, "{}", query.sql),
            Self::Raw(sql) => write!(f, "{}", sql),
            Self::Identifier(names) => {
                let quoted: Vec<String> = names
                    .iter()
                    .map(|name| format!("\"{}\"", name.replace('"', "\"\"")))
                    .collect();
                write!(f, "{}", quoted.join("."))
            }
        }
    }
}

impl From<SqlQuery> for SqlToken {
    fn from(query: SqlQuery) -> Self {
        Self::Query(query)
    }
}

impl From<&SqlQuery> for SqlToken {
    fn from(query: &SqlQuery) -> Self {
        Self::Query(query.clone())
    }
}

impl From<&str> for SqlToken {
    fn from(sql: &str) -> Self {
        Self::Raw(sql.to_string())
    }
}

impl From<String> for SqlToken {
    fn from(sql: String) -> Self {
        Self::Raw(sql)
    }
}

/// Column type of a binary COPY target column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Text,
    Bytea,
    Json,
    Jsonb,
    Uuid,
    Timestamptz,
}

impl ColumnType {
    /// PostgreSQL type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int2 => "int2",
            Self::Int4 => "int4",
            Self::Int8 => "int8",
            Self::Float4 => "float4",
            Self::Float8 => "float8",
            Self::Text => "text",
            Self::Bytea => "bytea",
            Self::Json => "json",
            Self::Jsonb => "jsonb",
            Self::Uuid => "uuid",
            Self::Timestamptz => "timestamptz",
        }
    }
}

impl std::str::FromStr for ColumnType {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ty = match s.to_lowercase().as_str() {
            "bool" | "boolean" => Self::Bool,
            "int2" | "smallint" => Self::Int2,
            "int4" | "int" | "integer" => Self::Int4,
            "int8" | "bigint" => Self::Int8,
            "float4" | "real" => Self::Float4,
            "float8" | "double precision" => Self::Float8,
            "text" | "varchar" => Self::Text,
            "bytea" => Self::Bytea,
            "json" => Self::Json,
            "jsonb" => Self::Jsonb,
            "uuid" => Self::Uuid,
            "timestamptz" => Self::Timestamptz,
            other => {
                return Err(DbError::validation(format!(
                    "unsupported COPY column type: {}",
                    other
                )));
            }
        };
        Ok(ty)
    }
}

/// One result row. Values keep the column order of the result set.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<JsonValue>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<JsonValue>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[JsonValue] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a value by column name.
    pub fn get(&self, column: &str) -> Option<&JsonValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|idx| self.values.get(idx))
    }

    /// The single column value of this row.
    pub fn into_first(self) -> DbResult<JsonValue> {
        if self.values.len() != 1 {
            return Err(DbError::data_integrity(format!(
                "expected exactly one column, got {}",
                self.values.len()
            )));
        }
        self.values
            .into_iter()
            .next()
            .ok_or_else(|| DbError::internal("row lost its only column"))
    }

    pub fn to_json_map(&self) -> serde_json::Map<String, JsonValue> {
        self.columns
            .iter()
            .cloned()
            .zip(self.values.iter().cloned())
            .collect()
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (column, value) in self.columns.iter().zip(&self.values) {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

/// Result-set column description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    /// Database-specific type (e.g., "int8", "varchar", "TEXT")
    pub data_type: String,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// Result of the generic `query` verb.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    /// Rows affected for DML, rows returned otherwise.
    pub row_count: u64,
    pub fields: Vec<Field>,
}

impl QueryResult {
    /// Result of a statement that returned no rows.
    pub fn empty() -> Self {
        Self {
            rows: Vec::new(),
            row_count: 0,
            fields: Vec::new(),
        }
    }

    /// Build a result from returned rows.
    pub fn from_rows(fields: Vec<Field>, rows: Vec<Row>) -> Self {
        Self {
            row_count: rows.len() as u64,
            rows,
            fields,
        }
    }
}
