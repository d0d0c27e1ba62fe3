//! Row decoding for the sqlx-backed connections.
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies column types into logical categories
//! 2. A decoder extracts the value for that category, with database-specific
//!    handling for DECIMAL and unsigned MySQL integers

use crate::models::{DatabaseType, JsonRow};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, ColumnIndex, Database, Decode, Row, Type, TypeInfo, ValueRef};

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Binary,
    Json,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Decimal/Numeric - check first as it overlaps with "numeric" in float checks
    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC is actually a float
        if db == DatabaseType::SQLite && lower == "numeric" {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    if lower.contains("int") || lower.contains("serial") || lower.contains("tiny") {
        return TypeCategory::Integer;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    if lower.contains("float")
        || lower.contains("double")
        || lower == "real"
        || lower == "float4"
        || lower == "float8"
    {
        return TypeCategory::Float;
    }

    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    // varchar, text, char, date, time, ... are decoded as text
    TypeCategory::Unknown
}

/// Wrapper type for raw DECIMAL/NUMERIC values as strings.
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

/// Binary columns become UTF-8 text when valid, base64 otherwise.
pub fn decode_binary_value(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    match std::str::from_utf8(bytes) {
        Ok(s) => JsonValue::String(s.to_string()),
        Err(_) => JsonValue::String(STANDARD.encode(bytes)),
    }
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

/// Trait for converting database rows to JSON maps.
pub trait RowToJson {
    fn to_json_map(&self) -> JsonRow;
}

/// Decode one column using the types every bundled backend understands.
fn decode_column<'r, R, DB>(row: &'r R, idx: usize, category: TypeCategory) -> JsonValue
where
    DB: Database,
    R: Row<Database = DB>,
    usize: ColumnIndex<R>,
    i64: Type<DB> + Decode<'r, DB>,
    i32: Type<DB> + Decode<'r, DB>,
    i16: Type<DB> + Decode<'r, DB>,
    f64: Type<DB> + Decode<'r, DB>,
    f32: Type<DB> + Decode<'r, DB>,
    bool: Type<DB> + Decode<'r, DB>,
    String: Type<DB> + Decode<'r, DB>,
    Vec<u8>: Type<DB> + Decode<'r, DB>,
    JsonValue: Type<DB> + Decode<'r, DB>,
{
    match row.try_get_raw(idx) {
        Ok(raw) if raw.is_null() => return JsonValue::Null,
        Ok(_) => {}
        Err(e) => {
            tracing::debug!(column = idx, error = %e, "Failed to read column");
            return JsonValue::Null;
        }
    }

    match category {
        TypeCategory::Integer => {
            if let Ok(v) = row.try_get::<i64, _>(idx) {
                return JsonValue::Number(v.into());
            }
            if let Ok(v) = row.try_get::<i32, _>(idx) {
                return JsonValue::Number(v.into());
            }
            if let Ok(v) = row.try_get::<i16, _>(idx) {
                return JsonValue::Number(v.into());
            }
        }
        TypeCategory::Float | TypeCategory::Decimal => {
            if let Ok(v) = row.try_get::<f64, _>(idx) {
                return float_value(v);
            }
            if let Ok(v) = row.try_get::<f32, _>(idx) {
                return float_value(v as f64);
            }
        }
        TypeCategory::Boolean => {
            if let Ok(v) = row.try_get::<bool, _>(idx) {
                return JsonValue::Bool(v);
            }
        }
        TypeCategory::Json => {
            if let Ok(v) = row.try_get::<JsonValue, _>(idx) {
                return v;
            }
        }
        TypeCategory::Binary | TypeCategory::Unknown => {}
    }

    if let Ok(v) = row.try_get::<String, _>(idx) {
        return JsonValue::String(v);
    }
    if let Ok(v) = row.try_get::<Vec<u8>, _>(idx) {
        return decode_binary_value(&v);
    }
    if let Ok(v) = row.try_get::<i64, _>(idx) {
        return JsonValue::Number(v.into());
    }
    if let Ok(v) = row.try_get::<f64, _>(idx) {
        return float_value(v);
    }
    tracing::debug!(column = idx, category = ?category, "Unsupported column type");
    JsonValue::Null
}

impl RowToJson for MySqlRow {
    fn to_json_map(&self) -> JsonRow {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let category = categorize_type(type_name, DatabaseType::MySQL);
                let value = match category {
                    TypeCategory::Decimal => self
                        .try_get::<Option<RawDecimal>, _>(idx)
                        .ok()
                        .flatten()
                        .map(|d| JsonValue::String(d.0))
                        .unwrap_or(JsonValue::Null),
                    TypeCategory::Integer if type_name.contains("UNSIGNED") => self
                        .try_get::<Option<u64>, _>(idx)
                        .ok()
                        .flatten()
                        .map(|v| JsonValue::Number(v.into()))
                        .unwrap_or(JsonValue::Null),
                    _ => decode_column(self, idx, category),
                };
                (col.name().to_string(), value)
            })
            .collect()
    }
}

impl RowToJson for PgRow {
    fn to_json_map(&self) -> JsonRow {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let category = categorize_type(col.type_info().name(), DatabaseType::PostgreSQL);
                let value = match category {
                    TypeCategory::Decimal => self
                        .try_get::<Option<RawDecimal>, _>(idx)
                        .ok()
                        .flatten()
                        .map(|d| JsonValue::String(d.0))
                        .unwrap_or(JsonValue::Null),
                    _ => decode_column(self, idx, category),
                };
                (col.name().to_string(), value)
            })
            .collect()
    }
}

impl RowToJson for SqliteRow {
    fn to_json_map(&self) -> JsonRow {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                // Expression columns carry no declared type; use the storage class
                let category = match self.try_get_raw(idx) {
                    Ok(raw) => categorize_type(raw.type_info().name(), DatabaseType::SQLite),
                    Err(_) => categorize_type(col.type_info().name(), DatabaseType::SQLite),
                };
                (col.name().to_string(), decode_column(self, idx, category))
            })
            .collect()
    }
}
