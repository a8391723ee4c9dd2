//! Conversion between JSON values and PostgreSQL values.
//!
//! Arguments are bound with the parameter types the server inferred when the
//! statement was prepared, so a JSON string can fill a `uuid` or
//! `timestamptz` slot and a JSON `null` carries the slot's own type.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::types::{Oid, PgInterval};
use sqlx::postgres::{PgArguments, PgColumn, PgRow, PgTypeInfo, PgTypeKind};
use sqlx::types::Decimal;
use sqlx::{Column, Postgres, Row, TypeInfo, ValueRef};
use std::str::FromStr;
use uuid::Uuid;

use crate::executor::QueryError;

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

/// One argument, converted to the type of the parameter it fills
#[derive(Debug, Clone, PartialEq)]
pub enum PgParam {
    Bool(Option<bool>),
    Int2(Option<i16>),
    Int4(Option<i32>),
    Int8(Option<i64>),
    Float4(Option<f32>),
    Float8(Option<f64>),
    Numeric(Option<Decimal>),
    Text(Option<String>),
    Uuid(Option<Uuid>),
    Date(Option<NaiveDate>),
    Time(Option<NaiveTime>),
    Timestamp(Option<NaiveDateTime>),
    Timestamptz(Option<DateTime<Utc>>),
    Json(Option<JsonValue>),
    Bytea(Option<Vec<u8>>),
    BoolArray(Option<Vec<Option<bool>>>),
    Int2Array(Option<Vec<Option<i16>>>),
    Int4Array(Option<Vec<Option<i32>>>),
    Int8Array(Option<Vec<Option<i64>>>),
    Float8Array(Option<Vec<Option<f64>>>),
    NumericArray(Option<Vec<Option<Decimal>>>),
    TextArray(Option<Vec<Option<String>>>),
    UuidArray(Option<Vec<Option<Uuid>>>),
}

/// A JSON value that does not fit the parameter type
#[derive(Debug)]
struct Mismatch;

type Converted<T> = Result<Option<T>, Mismatch>;

impl PgParam {
    /// Converts `value` for a parameter of type `type_name`.
    ///
    /// Types without a dedicated conversion are sent as text, which the
    /// server accepts for enums and other text-like types.
    pub fn from_json(value: &JsonValue, type_name: &str) -> Result<Self, String> {
        let param = match type_name {
            "BOOL" => to_bool(value).map(PgParam::Bool),
            "INT2" => to_int(value).map(PgParam::Int2),
            "INT4" => to_int(value).map(PgParam::Int4),
            "INT8" => to_int(value).map(PgParam::Int8),
            "FLOAT4" => to_f64(value).map(|v| PgParam::Float4(v.map(|f| f as f32))),
            "FLOAT8" => to_f64(value).map(PgParam::Float8),
            "NUMERIC" => to_decimal(value).map(PgParam::Numeric),
            "UUID" => to_uuid(value).map(PgParam::Uuid),
            "DATE" => to_date(value).map(PgParam::Date),
            "TIME" => to_time(value).map(PgParam::Time),
            "TIMESTAMP" => to_timestamp(value).map(PgParam::Timestamp),
            "TIMESTAMPTZ" => to_timestamptz(value).map(PgParam::Timestamptz),
            "JSON" | "JSONB" => Ok(PgParam::Json(to_json(value))),
            "BYTEA" => to_bytea(value).map(PgParam::Bytea),
            "BOOL[]" => convert_array(value, to_bool).map(PgParam::BoolArray),
            "INT2[]" => convert_array(value, to_int).map(PgParam::Int2Array),
            "INT4[]" => convert_array(value, to_int).map(PgParam::Int4Array),
            "INT8[]" => convert_array(value, to_int).map(PgParam::Int8Array),
            "FLOAT8[]" => convert_array(value, to_f64).map(PgParam::Float8Array),
            "NUMERIC[]" => convert_array(value, to_decimal).map(PgParam::NumericArray),
            "TEXT[]" => convert_array(value, to_text).map(PgParam::TextArray),
            "UUID[]" => convert_array(value, to_uuid).map(PgParam::UuidArray),
            _ => to_text(value).map(PgParam::Text),
        };

        param.map_err(|Mismatch| format!("invalid input for type {type_name}: {value}"))
    }

    fn bind(self, query: PgQuery<'_>) -> PgQuery<'_> {
        match self {
            PgParam::Bool(v) => query.bind(v),
            PgParam::Int2(v) => query.bind(v),
            PgParam::Int4(v) => query.bind(v),
            PgParam::Int8(v) => query.bind(v),
            PgParam::Float4(v) => query.bind(v),
            PgParam::Float8(v) => query.bind(v),
            PgParam::Numeric(v) => query.bind(v),
            PgParam::Text(v) => query.bind(v),
            PgParam::Uuid(v) => query.bind(v),
            PgParam::Date(v) => query.bind(v),
            PgParam::Time(v) => query.bind(v),
            PgParam::Timestamp(v) => query.bind(v),
            PgParam::Timestamptz(v) => query.bind(v),
            PgParam::Json(v) => query.bind(v),
            PgParam::Bytea(v) => query.bind(v),
            PgParam::BoolArray(v) => query.bind(v),
            PgParam::Int2Array(v) => query.bind(v),
            PgParam::Int4Array(v) => query.bind(v),
            PgParam::Int8Array(v) => query.bind(v),
            PgParam::Float8Array(v) => query.bind(v),
            PgParam::NumericArray(v) => query.bind(v),
            PgParam::TextArray(v) => query.bind(v),
            PgParam::UuidArray(v) => query.bind(v),
        }
    }
}

/// Binds `args` positionally against the prepared parameter types.
pub fn bind_args<'q>(
    mut query: PgQuery<'q>,
    args: &[JsonValue],
    params: &[PgTypeInfo],
) -> Result<PgQuery<'q>, QueryError> {
    for (i, arg) in args.iter().enumerate() {
        // Surplus arguments are left for the server to reject
        let type_name = params.get(i).map_or("TEXT", |ty| ty.name());
        let param = PgParam::from_json(arg, type_name)
            .map_err(|reason| QueryError::new(format!("parameter ${}: {}", i + 1, reason)))?;
        query = param.bind(query);
    }
    Ok(query)
}

fn convert_array<T>(
    value: &JsonValue,
    to: fn(&JsonValue) -> Converted<T>,
) -> Converted<Vec<Option<T>>> {
    match value {
        JsonValue::Null => Ok(None),
        JsonValue::Array(items) => items.iter().map(to).collect::<Result<Vec<_>, _>>().map(Some),
        _ => Err(Mismatch),
    }
}

fn to_bool(value: &JsonValue) -> Converted<bool> {
    match value {
        JsonValue::Null => Ok(None),
        JsonValue::Bool(b) => Ok(Some(*b)),
        JsonValue::String(s) => match s.to_ascii_lowercase().as_str() {
            "t" | "true" | "y" | "yes" | "on" | "1" => Ok(Some(true)),
            "f" | "false" | "n" | "no" | "off" | "0" => Ok(Some(false)),
            _ => Err(Mismatch),
        },
        _ => Err(Mismatch),
    }
}

fn to_int<T: TryFrom<i64>>(value: &JsonValue) -> Converted<T> {
    let wide = match value {
        JsonValue::Null => return Ok(None),
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    wide.and_then(|n| T::try_from(n).ok())
        .map(Some)
        .ok_or(Mismatch)
}

fn to_f64(value: &JsonValue) -> Converted<f64> {
    match value {
        JsonValue::Null => Ok(None),
        JsonValue::Number(n) => n.as_f64().map(Some).ok_or(Mismatch),
        JsonValue::String(s) => s.trim().parse().map(Some).map_err(|_| Mismatch),
        _ => Err(Mismatch),
    }
}

fn to_decimal(value: &JsonValue) -> Converted<Decimal> {
    let text = match value {
        JsonValue::Null => return Ok(None),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => s.trim().to_string(),
        _ => return Err(Mismatch),
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map(Some)
        .map_err(|_| Mismatch)
}

fn to_uuid(value: &JsonValue) -> Converted<Uuid> {
    parse_str(value, |s| Uuid::parse_str(s).ok())
}

fn to_date(value: &JsonValue) -> Converted<NaiveDate> {
    parse_str(value, |s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
}

fn to_time(value: &JsonValue) -> Converted<NaiveTime> {
    parse_str(value, |s| NaiveTime::parse_from_str(s, "%H:%M:%S%.f").ok())
}

fn parse_naive_datetime(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .map(|date| date.and_time(NaiveTime::MIN))
        })
}

fn to_timestamp(value: &JsonValue) -> Converted<NaiveDateTime> {
    parse_str(value, parse_naive_datetime)
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS+hh:mm`, and zone-less forms as UTC.
fn to_timestamptz(value: &JsonValue) -> Converted<DateTime<Utc>> {
    parse_str(value, |s| {
        DateTime::parse_from_rfc3339(s)
            .or_else(|_| DateTime::<FixedOffset>::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z"))
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| parse_naive_datetime(s).map(|naive| naive.and_utc()))
    })
}

/// Strings holding JSON text are parsed; anything else is taken as is.
fn to_json(value: &JsonValue) -> Option<JsonValue> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(serde_json::from_str(s).unwrap_or_else(|_| value.clone())),
        other => Some(other.clone()),
    }
}

/// `\x`-prefixed hex, or the raw UTF-8 bytes of the string.
fn to_bytea(value: &JsonValue) -> Converted<Vec<u8>> {
    match value {
        JsonValue::Null => Ok(None),
        JsonValue::String(s) => match s.strip_prefix("\\x") {
            Some(digits) => hex::decode(digits).map(Some).map_err(|_| Mismatch),
            None => Ok(Some(s.as_bytes().to_vec())),
        },
        _ => Err(Mismatch),
    }
}

fn to_text(value: &JsonValue) -> Converted<String> {
    match value {
        JsonValue::Null => Ok(None),
        JsonValue::String(s) => Ok(Some(s.clone())),
        other => Ok(Some(other.to_string())),
    }
}

fn parse_str<T>(value: &JsonValue, parse: impl FnOnce(&str) -> Option<T>) -> Converted<T> {
    match value {
        JsonValue::Null => Ok(None),
        JsonValue::String(s) => parse(s.trim()).map(Some).ok_or(Mismatch),
        _ => Err(Mismatch),
    }
}

/// Decodes every column of `row` in column order.
pub fn row_to_values(row: &PgRow) -> Result<Vec<JsonValue>, QueryError> {
    row.columns()
        .iter()
        .map(|column| decode_column(row, column))
        .collect()
}

fn float(value: f64) -> JsonValue {
    serde_json::Number::from_f64(value)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

fn string<T: ToString>(value: T) -> JsonValue {
    JsonValue::String(value.to_string())
}

fn timestamptz(value: DateTime<Utc>) -> JsonValue {
    JsonValue::String(value.to_rfc3339())
}

fn bytea(value: Vec<u8>) -> JsonValue {
    JsonValue::String(format!("\\x{}", hex::encode(value)))
}

fn interval(value: PgInterval) -> JsonValue {
    JsonValue::String(format_interval(&value))
}

fn decode<'r, T>(
    row: &'r PgRow,
    idx: usize,
    to_json: impl FnOnce(T) -> JsonValue,
) -> Result<JsonValue, sqlx::Error>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get::<T, _>(idx).map(to_json)
}

fn decode_array<'r, T>(
    row: &'r PgRow,
    idx: usize,
    to_json: fn(T) -> JsonValue,
) -> Result<JsonValue, sqlx::Error>
where
    T: for<'a> sqlx::Decode<'a, Postgres> + sqlx::Type<Postgres> + sqlx::postgres::PgHasArrayType,
{
    let items = row.try_get::<Vec<Option<T>>, _>(idx)?;
    Ok(JsonValue::Array(
        items
            .into_iter()
            .map(|item| item.map_or(JsonValue::Null, to_json))
            .collect(),
    ))
}

fn decode_column(row: &PgRow, column: &PgColumn) -> Result<JsonValue, QueryError> {
    let idx = column.ordinal();
    if row.try_get_raw(idx)?.is_null() {
        return Ok(JsonValue::Null);
    }

    let type_info = column.type_info();
    let decoded = match type_info.name() {
        "BOOL" => decode(row, idx, JsonValue::Bool),
        "INT2" => decode::<i16>(row, idx, JsonValue::from),
        "INT4" => decode::<i32>(row, idx, JsonValue::from),
        "INT8" => decode::<i64>(row, idx, JsonValue::from),
        "OID" => decode::<Oid>(row, idx, |oid| JsonValue::from(oid.0)),
        "FLOAT4" => decode::<f32>(row, idx, |v| float(f64::from(v))),
        "FLOAT8" => decode(row, idx, float),
        "NUMERIC" => decode::<Decimal>(row, idx, string),
        "TEXT" | "VARCHAR" | "CHAR" | "NAME" => decode(row, idx, JsonValue::String),
        "UUID" => decode::<Uuid>(row, idx, string),
        "TIMESTAMPTZ" => decode(row, idx, timestamptz),
        "TIMESTAMP" => decode::<NaiveDateTime>(row, idx, string),
        "DATE" => decode::<NaiveDate>(row, idx, string),
        "TIME" => decode::<NaiveTime>(row, idx, string),
        "INTERVAL" => decode(row, idx, interval),
        "JSON" | "JSONB" => decode(row, idx, |v: JsonValue| v),
        "BYTEA" => decode(row, idx, bytea),
        "BOOL[]" => decode_array(row, idx, JsonValue::Bool),
        "INT2[]" => decode_array::<i16>(row, idx, JsonValue::from),
        "INT4[]" => decode_array::<i32>(row, idx, JsonValue::from),
        "INT8[]" => decode_array::<i64>(row, idx, JsonValue::from),
        "FLOAT4[]" => decode_array::<f32>(row, idx, |v| float(f64::from(v))),
        "FLOAT8[]" => decode_array(row, idx, float),
        "NUMERIC[]" => decode_array::<Decimal>(row, idx, string),
        "TEXT[]" | "VARCHAR[]" | "CHAR[]" | "NAME[]" => {
            decode_array(row, idx, JsonValue::String)
        }
        "UUID[]" => decode_array::<Uuid>(row, idx, string),
        "TIMESTAMPTZ[]" => decode_array(row, idx, timestamptz),
        "TIMESTAMP[]" => decode_array::<NaiveDateTime>(row, idx, string),
        "DATE[]" => decode_array::<NaiveDate>(row, idx, string),
        "TIME[]" => decode_array::<NaiveTime>(row, idx, string),
        "INTERVAL[]" => decode_array(row, idx, interval),
        "JSON[]" | "JSONB[]" => decode_array(row, idx, |v: JsonValue| v),
        "BYTEA[]" => decode_array(row, idx, bytea),
        // Enum labels travel as plain text. Unresolved types are named `?`.
        name if name != "?" && matches!(type_info.kind(), PgTypeKind::Enum(_)) => row
            .try_get_unchecked::<String, _>(idx)
            .map(JsonValue::String),
        other => {
            return Err(QueryError::new(format!(
                "cannot decode column \"{}\" of type {}",
                column.name(),
                other
            )));
        }
    };

    decoded.map_err(QueryError::from)
}

/// Renders an interval the way PostgreSQL prints it by default,
/// e.g. `1 year 2 mons 3 days 04:05:06.5`.
pub fn format_interval(interval: &PgInterval) -> String {
    let mut parts = Vec::new();
    let mut unit = |n: i32, name: &str| {
        if n != 0 {
            let plural = if n == 1 { "" } else { "s" };
            parts.push(format!("{n} {name}{plural}"));
        }
    };
    unit(interval.months / 12, "year");
    unit(interval.months % 12, "mon");
    unit(interval.days, "day");

    if interval.microseconds != 0 || parts.is_empty() {
        let sign = if interval.microseconds < 0 { "-" } else { "" };
        let micros = interval.microseconds.unsigned_abs();
        let secs = micros / 1_000_000;
        let mut time = format!(
            "{sign}{:02}:{:02}:{:02}",
            secs / 3600,
            secs / 60 % 60,
            secs % 60
        );
        let fraction = micros % 1_000_000;
        if fraction != 0 {
            time.push_str(format!(".{fraction:06}").trim_end_matches('0'));
        }
        parts.push(time);
    }

    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_null_keeps_the_parameter_type() {
        assert_eq!(PgParam::from_json(&json!(null), "INT4").unwrap(), PgParam::Int4(None));
        assert_eq!(PgParam::from_json(&json!(null), "UUID").unwrap(), PgParam::Uuid(None));
        assert_eq!(
            PgParam::from_json(&json!(null), "TIMESTAMPTZ").unwrap(),
            PgParam::Timestamptz(None)
        );
        assert_eq!(PgParam::from_json(&json!(null), "TEXT[]").unwrap(), PgParam::TextArray(None));
    }

    #[test]
    fn test_integers_fit_their_width() {
        assert_eq!(PgParam::from_json(&json!(7), "INT2").unwrap(), PgParam::Int2(Some(7)));
        assert_eq!(PgParam::from_json(&json!("42"), "INT4").unwrap(), PgParam::Int4(Some(42)));
        assert_eq!(
            PgParam::from_json(&json!(5_000_000_000i64), "INT8").unwrap(),
            PgParam::Int8(Some(5_000_000_000))
        );
        assert!(PgParam::from_json(&json!(70000), "INT2").is_err());
        assert!(PgParam::from_json(&json!(1.5), "INT4").is_err());
        assert!(PgParam::from_json(&json!("abc"), "INT8").is_err());
    }

    #[test]
    fn test_strings_fill_typed_parameters() {
        assert_eq!(
            PgParam::from_json(&json!("67e55044-10b1-426f-9247-bb680e5fe0c8"), "UUID").unwrap(),
            PgParam::Uuid(Some(
                Uuid::parse_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap()
            ))
        );
        assert_eq!(
            PgParam::from_json(&json!("2024-03-01"), "DATE").unwrap(),
            PgParam::Date(NaiveDate::from_ymd_opt(2024, 3, 1))
        );
        assert_eq!(
            PgParam::from_json(&json!("12.50"), "NUMERIC").unwrap(),
            PgParam::Numeric(Some(Decimal::new(1250, 2)))
        );
        assert_eq!(
            PgParam::from_json(&json!(1.5), "NUMERIC").unwrap(),
            PgParam::Numeric(Some(Decimal::new(15, 1)))
        );
        assert!(PgParam::from_json(&json!("not-a-uuid"), "UUID").is_err());
    }

    #[test]
    fn test_timestamptz_accepts_common_forms() {
        let midnight = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_time(NaiveTime::MIN)
            .and_utc();

        for input in [
            "2024-01-01",
            "2024-01-01T00:00:00Z",
            "2024-01-01 00:00:00",
            "2024-01-01 02:00:00+02:00",
            "2024-01-01T00:00:00.000+00:00",
        ] {
            assert_eq!(
                PgParam::from_json(&json!(input), "TIMESTAMPTZ").unwrap(),
                PgParam::Timestamptz(Some(midnight)),
                "{input}"
            );
        }
    }

    #[test]
    fn test_json_parameters_parse_json_text() {
        assert_eq!(
            PgParam::from_json(&json!("{\"a\":1}"), "JSONB").unwrap(),
            PgParam::Json(Some(json!({"a": 1})))
        );
        assert_eq!(
            PgParam::from_json(&json!("plain"), "JSON").unwrap(),
            PgParam::Json(Some(json!("plain")))
        );
        assert_eq!(
            PgParam::from_json(&json!([1, 2]), "JSONB").unwrap(),
            PgParam::Json(Some(json!([1, 2])))
        );
    }

    #[test]
    fn test_arrays_convert_each_element() {
        assert_eq!(
            PgParam::from_json(&json!([1, null, 3]), "INT4[]").unwrap(),
            PgParam::Int4Array(Some(vec![Some(1), None, Some(3)]))
        );
        assert_eq!(
            PgParam::from_json(&json!(["a", "b"]), "TEXT[]").unwrap(),
            PgParam::TextArray(Some(vec![Some("a".to_string()), Some("b".to_string())]))
        );
        assert!(PgParam::from_json(&json!([1, "x"]), "INT8[]").is_err());
        assert!(PgParam::from_json(&json!("{1,2}"), "INT4[]").is_err());
    }

    #[test]
    fn test_unlisted_types_are_sent_as_text() {
        assert_eq!(
            PgParam::from_json(&json!("happy"), "mood").unwrap(),
            PgParam::Text(Some("happy".to_string()))
        );
        assert_eq!(
            PgParam::from_json(&json!(12), "VARCHAR").unwrap(),
            PgParam::Text(Some("12".to_string()))
        );
        assert_eq!(
            PgParam::from_json(&json!({"k": true}), "TEXT").unwrap(),
            PgParam::Text(Some("{\"k\":true}".to_string()))
        );
    }

    #[test]
    fn test_bytea_accepts_hex_escape() {
        assert_eq!(
            PgParam::from_json(&json!("\\xdeadbeef"), "BYTEA").unwrap(),
            PgParam::Bytea(Some(vec![0xde, 0xad, 0xbe, 0xef]))
        );
        assert_eq!(
            PgParam::from_json(&json!("ab"), "BYTEA").unwrap(),
            PgParam::Bytea(Some(b"ab".to_vec()))
        );
    }

    #[test]
    fn test_mismatch_names_the_type() {
        let err = PgParam::from_json(&json!(true), "TIMESTAMPTZ").unwrap_err();
        assert_eq!(err, "invalid input for type TIMESTAMPTZ: true");
    }

    #[test]
    fn test_format_interval() {
        let interval = |months, days, microseconds| PgInterval {
            months,
            days,
            microseconds,
        };

        assert_eq!(format_interval(&interval(0, 1, 0)), "1 day");
        assert_eq!(format_interval(&interval(0, 0, 0)), "00:00:00");
        assert_eq!(format_interval(&interval(14, 3, 0)), "1 year 2 mons 3 days");
        assert_eq!(
            format_interval(&interval(0, 0, 14_706_500_000)),
            "04:05:06.5"
        );
        assert_eq!(format_interval(&interval(0, -2, -3_600_000_000)), "-2 days -01:00:00");
    }
}
