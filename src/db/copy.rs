//! PostgreSQL binary COPY payload encoding.
//!
//! Layout: an 11-byte signature, a 32-bit flags field and a 32-bit header
//! extension length, then one record per tuple (16-bit field count followed
//! by a 32-bit length and the raw bytes of every field, `-1` for NULL), then a
//! 16-bit `-1` trailer. All integers are big-endian.

use crate::error::{DbError, DbResult};
use crate::models::{ColumnType, QueryParam, SqlQuery};
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::LazyLock;

const SIGNATURE: &[u8; 11] = b"PGCOPY\n\xff\r\n\0";

/// JSONB binary format version.
const JSONB_VERSION: u8 = 1;

/// Midnight 2000-01-01 UTC, the PostgreSQL timestamp epoch.
static PG_EPOCH: LazyLock<DateTime<Utc>> = LazyLock::new(|| {
    NaiveDate::from_ymd_opt(2000, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .unwrap_or_default()
});

/// Check the arguments of a binary copy before any connection is touched.
pub fn validate_copy(
    query: &SqlQuery,
    tuples: &[Vec<QueryParam>],
    column_types: &[ColumnType],
) -> DbResult<()> {
    query.validate()?;
    if !query.values().is_empty() {
        return Err(DbError::validation(
            "COPY statements cannot carry bound values",
        ));
    }
    if column_types.is_empty() {
        return Err(DbError::validation(
            "binary copy requires at least one column type",
        ));
    }
    if column_types.len() > i16::MAX as usize {
        return Err(DbError::validation(format!(
            "binary copy supports at most {} columns",
            i16::MAX
        )));
    }
    if let Some((idx, tuple)) = tuples
        .iter()
        .enumerate()
        .find(|(_, t)| t.len() != column_types.len())
    {
        return Err(DbError::validation(format!(
            "tuple {} has {} values, expected {}",
            idx,
            tuple.len(),
            column_types.len()
        )));
    }
    Ok(())
}

/// Encode `tuples` as a complete binary COPY payload.
pub fn encode_copy_payload(
    tuples: &[Vec<QueryParam>],
    column_types: &[ColumnType],
) -> DbResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(19 + tuples.len() * column_types.len() * 8 + 2);
    buf.extend_from_slice(SIGNATURE);
    buf.extend_from_slice(&0i32.to_be_bytes());
    buf.extend_from_slice(&0i32.to_be_bytes());

    for (row, tuple) in tuples.iter().enumerate() {
        buf.extend_from_slice(&(column_types.len() as i16).to_be_bytes());
        for (col, (value, ty)) in tuple.iter().zip(column_types).enumerate() {
            encode_field(&mut buf, value, *ty).map_err(|message| {
                DbError::validation(format!("row {row}, column {col}: {message}"))
            })?;
        }
    }

    buf.extend_from_slice(&(-1i16).to_be_bytes());
    Ok(buf)
}

fn encode_field(buf: &mut Vec<u8>, value: &QueryParam, ty: ColumnType) -> Result<(), String> {
    if value.is_null() {
        buf.extend_from_slice(&(-1i32).to_be_bytes());
        return Ok(());
    }
    let bytes = field_bytes(value, ty)?;
    let len = i32::try_from(bytes.len()).map_err(|_| "value too large".to_string())?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&bytes);
    Ok(())
}

fn field_bytes(value: &QueryParam, ty: ColumnType) -> Result<Vec<u8>, String> {
    let mismatch = || {
        format!(
            "cannot encode {} as {}",
            value.type_name(),
            ty.type_name()
        )
    };
    let bytes = match (ty, value) {
        (ColumnType::Bool, QueryParam::Bool(v)) => vec![u8::from(*v)],
        (ColumnType::Int2, QueryParam::Int(v)) => i16::try_from(*v)
            .map_err(|_| format!("{v} is out of range for int2"))?
            .to_be_bytes()
            .to_vec(),
        (ColumnType::Int4, QueryParam::Int(v)) => i32::try_from(*v)
            .map_err(|_| format!("{v} is out of range for int4"))?
            .to_be_bytes()
            .to_vec(),
        (ColumnType::Int8, QueryParam::Int(v)) => v.to_be_bytes().to_vec(),
        (ColumnType::Float4, QueryParam::Float(v)) => (*v as f32).to_be_bytes().to_vec(),
        (ColumnType::Float4, QueryParam::Int(v)) => (*v as f32).to_be_bytes().to_vec(),
        (ColumnType::Float8, QueryParam::Float(v)) => v.to_be_bytes().to_vec(),
        (ColumnType::Float8, QueryParam::Int(v)) => (*v as f64).to_be_bytes().to_vec(),
        (ColumnType::Text, QueryParam::String(v)) => v.as_bytes().to_vec(),
        (ColumnType::Bytea, QueryParam::Bytes(v)) => v.clone(),
        (ColumnType::Json, QueryParam::Json(v)) => v.to_string().into_bytes(),
        (ColumnType::Json, QueryParam::String(v)) => v.as_bytes().to_vec(),
        (ColumnType::Jsonb, QueryParam::Json(v)) => jsonb_bytes(&v.to_string()),
        (ColumnType::Jsonb, QueryParam::String(v)) => jsonb_bytes(v),
        (ColumnType::Uuid, QueryParam::String(v)) => uuid::Uuid::parse_str(v)
            .map_err(|e| format!("invalid uuid '{v}': {e}"))?
            .as_bytes()
            .to_vec(),
        (ColumnType::Timestamptz, QueryParam::String(v)) => {
            let ts = DateTime::parse_from_rfc3339(v)
                .map_err(|e| format!("invalid timestamp '{v}': {e}"))?
                .with_timezone(&Utc);
            let micros = (ts - *PG_EPOCH)
                .num_microseconds()
                .ok_or_else(|| format!("timestamp '{v}' is out of range"))?;
            micros.to_be_bytes().to_vec()
        }
        _ => return Err(mismatch()),
    };
    Ok(bytes)
}

fn jsonb_bytes(text: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(text.len() + 1);
    bytes.push(JSONB_VERSION);
    bytes.extend_from_slice(text.as_bytes());
    bytes
}
