//! Row decoding.
//!
//! Driver rows are converted into backend-neutral [`Row`] values (column names
//! plus JSON cells) and [`Field`] descriptions. Column types are first sorted
//! into a [`TypeCategory`], then a per-backend decoder extracts the value.

use crate::models::{DatabaseType, Field, Row};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row as _, Type, TypeInfo};
use std::sync::Arc;

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Timestamp,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Checked first: "numeric" would otherwise fall through to the float rules
    if lower.contains("decimal") || lower.contains("numeric") {
        if db == DatabaseType::SQLite && lower == "numeric" {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    if lower.contains("int") || lower.contains("serial") || lower.contains("tiny") {
        return TypeCategory::Integer;
    }

    match lower.as_str() {
        "bool" | "boolean" => return TypeCategory::Boolean,
        "real" | "float4" | "float8" => return TypeCategory::Float,
        "json" | "jsonb" => return TypeCategory::Json,
        "uuid" => return TypeCategory::Uuid,
        "bytea" => return TypeCategory::Binary,
        "timestamptz" | "timestamp" | "datetime" => return TypeCategory::Timestamp,
        "text" | "varchar" | "char" | "bpchar" | "name" => return TypeCategory::Text,
        _ => {}
    }

    if lower.contains("float") || lower.contains("double") {
        return TypeCategory::Float;
    }
    if lower.contains("blob") || lower.contains("binary") {
        return TypeCategory::Binary;
    }

    TypeCategory::Unknown
}

/// DECIMAL/NUMERIC values kept in their exact textual form.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::Postgres>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

/// Binary cells are reported as base64 text.
pub fn encode_binary(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    JsonValue::String(STANDARD.encode(bytes))
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

/// Conversion from a driver row into crate models.
pub trait DecodeRow {
    const DATABASE: DatabaseType;

    fn column_names(&self) -> Arc<[String]>;

    fn fields(&self) -> Vec<Field>;

    /// Decode every cell. `columns` is the shared name list for the result set.
    fn decode(&self, columns: Arc<[String]>) -> Row;
}

macro_rules! impl_decode_row {
    ($row:ty, $db:expr, $decoder:path) => {
        impl DecodeRow for $row {
            const DATABASE: DatabaseType = $db;

            fn column_names(&self) -> Arc<[String]> {
                self.columns().iter().map(|c| c.name().to_string()).collect()
            }

            fn fields(&self) -> Vec<Field> {
                self.columns()
                    .iter()
                    .map(|c| Field::new(c.name(), c.type_info().name()))
                    .collect()
            }

            fn decode(&self, columns: Arc<[String]>) -> Row {
                let values = self
                    .columns()
                    .iter()
                    .enumerate()
                    .map(|(idx, col)| {
                        let category = categorize_type(col.type_info().name(), Self::DATABASE);
                        $decoder(self, idx, category)
                    })
                    .collect();
                Row::new(columns, values)
            }
        }
    };
}

impl_decode_row!(MySqlRow, DatabaseType::MySQL, mysql::decode_column);
impl_decode_row!(PgRow, DatabaseType::PostgreSQL, postgres::decode_column);
impl_decode_row!(SqliteRow, DatabaseType::SQLite, sqlite::decode_column);

/// Decode a full result set, sharing one column-name list across all rows.
pub fn decode_rows<R: DecodeRow>(rows: &[R]) -> (Vec<Field>, Vec<Row>) {
    let Some(first) = rows.first() else {
        return (Vec::new(), Vec::new());
    };
    let columns = first.column_names();
    let decoded = rows.iter().map(|r| r.decode(Arc::clone(&columns))).collect();
    (first.fields(), decoded)
}

mod mysql {
    use super::*;

    pub fn decode_column(row: &MySqlRow, idx: usize, category: TypeCategory) -> JsonValue {
        match category {
            TypeCategory::Decimal => decode_decimal(row, idx),
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => decode_boolean(row, idx),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Binary => decode_binary(row, idx),
            TypeCategory::Json => decode_json(row, idx),
            TypeCategory::Timestamp => decode_timestamp(row, idx),
            _ => decode_text(row, idx),
        }
    }

    fn decode_decimal(row: &MySqlRow, idx: usize) -> JsonValue {
        match row.try_get::<Option<RawDecimal>, _>(idx) {
            Ok(Some(v)) => JsonValue::String(v.0),
            Ok(None) => JsonValue::Null,
            Err(e) => {
                tracing::error!(column = idx, error = ?e, "Failed to decode DECIMAL");
                JsonValue::Null
            }
        }
    }

    fn decode_integer(row: &MySqlRow, idx: usize) -> JsonValue {
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
            return v.into();
        }
        if let Ok(Some(v)) = row.try_get::<Option<u64>, _>(idx) {
            return v.into();
        }
        if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
            return v.into();
        }
        if let Ok(Some(v)) = row.try_get::<Option<i8>, _>(idx) {
            return v.into();
        }
        JsonValue::Null
    }

    fn decode_boolean(row: &MySqlRow, idx: usize) -> JsonValue {
        row.try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map_or(JsonValue::Null, JsonValue::Bool)
    }

    fn decode_float(row: &MySqlRow, idx: usize) -> JsonValue {
        if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
            return float_value(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<f32>, _>(idx) {
            return float_value(v as f64);
        }
        JsonValue::Null
    }

    fn decode_binary(row: &MySqlRow, idx: usize) -> JsonValue {
        row.try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map_or(JsonValue::Null, |v| encode_binary(&v))
    }

    fn decode_json(row: &MySqlRow, idx: usize) -> JsonValue {
        row.try_get::<Option<JsonValue>, _>(idx)
            .ok()
            .flatten()
            .unwrap_or(JsonValue::Null)
    }

    fn decode_timestamp(row: &MySqlRow, idx: usize) -> JsonValue {
        if let Ok(Some(v)) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
            return JsonValue::String(v.to_rfc3339());
        }
        if let Ok(Some(v)) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
            return JsonValue::String(v.to_string());
        }
        decode_text(row, idx)
    }

    fn decode_text(row: &MySqlRow, idx: usize) -> JsonValue {
        row.try_get::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map_or(JsonValue::Null, JsonValue::String)
    }
}

mod postgres {
    use super::*;

    pub fn decode_column(row: &PgRow, idx: usize, category: TypeCategory) -> JsonValue {
        match category {
            TypeCategory::Decimal => decode_decimal(row, idx),
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => decode_boolean(row, idx),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Binary => decode_binary(row, idx),
            TypeCategory::Json => decode_json(row, idx),
            TypeCategory::Uuid => decode_uuid(row, idx),
            TypeCategory::Timestamp => decode_timestamp(row, idx),
            _ => decode_text(row, idx),
        }
    }

    fn decode_decimal(row: &PgRow, idx: usize) -> JsonValue {
        match row.try_get::<Option<RawDecimal>, _>(idx) {
            Ok(Some(v)) => JsonValue::String(v.0),
            Ok(None) => JsonValue::Null,
            Err(e) => {
                tracing::error!(column = idx, error = ?e, "Failed to decode NUMERIC");
                JsonValue::Null
            }
        }
    }

    fn decode_integer(row: &PgRow, idx: usize) -> JsonValue {
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
            return v.into();
        }
        if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
            return v.into();
        }
        if let Ok(Some(v)) = row.try_get::<Option<i16>, _>(idx) {
            return v.into();
        }
        JsonValue::Null
    }

    fn decode_boolean(row: &PgRow, idx: usize) -> JsonValue {
        row.try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map_or(JsonValue::Null, JsonValue::Bool)
    }

    fn decode_float(row: &PgRow, idx: usize) -> JsonValue {
        if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
            return float_value(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<f32>, _>(idx) {
            return float_value(v as f64);
        }
        JsonValue::Null
    }

    fn decode_binary(row: &PgRow, idx: usize) -> JsonValue {
        row.try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map_or(JsonValue::Null, |v| encode_binary(&v))
    }

    fn decode_json(row: &PgRow, idx: usize) -> JsonValue {
        row.try_get::<Option<JsonValue>, _>(idx)
            .ok()
            .flatten()
            .unwrap_or(JsonValue::Null)
    }

    fn decode_uuid(row: &PgRow, idx: usize) -> JsonValue {
        row.try_get::<Option<uuid::Uuid>, _>(idx)
            .ok()
            .flatten()
            .map_or(JsonValue::Null, |v| JsonValue::String(v.to_string()))
    }

    fn decode_timestamp(row: &PgRow, idx: usize) -> JsonValue {
        if let Ok(Some(v)) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
            return JsonValue::String(v.to_rfc3339());
        }
        if let Ok(Some(v)) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
            return JsonValue::String(v.to_string());
        }
        JsonValue::Null
    }

    fn decode_text(row: &PgRow, idx: usize) -> JsonValue {
        row.try_get::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map_or(JsonValue::Null, JsonValue::String)
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(row: &SqliteRow, idx: usize, category: TypeCategory) -> JsonValue {
        match category {
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => decode_boolean(row, idx),
            TypeCategory::Float | TypeCategory::Decimal => decode_float(row, idx),
            TypeCategory::Binary => decode_binary(row, idx),
            TypeCategory::Text | TypeCategory::Timestamp => decode_text(row, idx),
            // SQLite reports the declared type, or NULL for expressions;
            // try the storage classes in turn.
            _ => decode_dynamic(row, idx),
        }
    }

    fn decode_integer(row: &SqliteRow, idx: usize) -> JsonValue {
        row.try_get::<Option<i64>, _>(idx)
            .ok()
            .flatten()
            .map_or(JsonValue::Null, JsonValue::from)
    }

    fn decode_boolean(row: &SqliteRow, idx: usize) -> JsonValue {
        row.try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map_or(JsonValue::Null, JsonValue::Bool)
    }

    fn decode_float(row: &SqliteRow, idx: usize) -> JsonValue {
        row.try_get::<Option<f64>, _>(idx)
            .ok()
            .flatten()
            .map_or(JsonValue::Null, float_value)
    }

    fn decode_binary(row: &SqliteRow, idx: usize) -> JsonValue {
        row.try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map_or(JsonValue::Null, |v| encode_binary(&v))
    }

    fn decode_text(row: &SqliteRow, idx: usize) -> JsonValue {
        row.try_get::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map_or(JsonValue::Null, JsonValue::String)
    }

    fn decode_dynamic(row: &SqliteRow, idx: usize) -> JsonValue {
        let Ok(raw) = row.try_get_raw(idx) else {
            return JsonValue::Null;
        };
        if sqlx::ValueRef::is_null(&raw) {
            return JsonValue::Null;
        }
        match sqlx::ValueRef::type_info(&raw).name() {
            "INTEGER" => decode_integer(row, idx),
            "REAL" => decode_float(row, idx),
            "BLOB" => decode_binary(row, idx),
            _ => decode_text(row, idx),
        }
    }
}
