//! Typed row conversion
//!
//! Turns one [`RawRecord`] (column name -> raw CSV string) into a [`TypedRow`]
//! aligned with a [`TableSchema`]. Field failures are collected as
//! [`ConversionError`]s instead of aborting, so a single bad record never
//! stops the record set.

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::formats::RawRecord;
use crate::schema::{ColumnSpec, ColumnType, TableSchema};

/// Accepted datetime layouts, tried in order
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Fixed-width layouts: `9` is an ASCII digit, anything else must match exactly
const DATETIME_LAYOUT: &[u8] = b"9999-99-99 99:99:99";
const DATE_LAYOUT: &[u8] = b"9999-99-99";

/// A converted column value
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Null,
    String(String),
    Bool(bool),
    Double(f64),
    Int(i32),
    DateTime(NaiveDateTime),
}

impl TypedValue {
    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            TypedValue::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TypedValue::String(s) => Some(s),
            _ => None,
        }
    }
}

/// A record converted to typed values, one per schema column, in schema order
#[derive(Debug, Clone, PartialEq)]
pub struct TypedRow {
    pub values: Vec<TypedValue>,
}

impl TypedRow {
    /// Value of a named column
    pub fn get<'a>(&'a self, schema: &TableSchema, column: &str) -> Option<&'a TypedValue> {
        schema
            .column_index(column)
            .and_then(|idx| self.values.get(idx))
    }
}

/// Why a single field could not be converted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversionError {
    pub column: String,
    pub raw_value: String,
    pub reason: String,
}

impl std::fmt::Display for ConversionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "column '{}' value '{}': {}",
            self.column, self.raw_value, self.reason
        )
    }
}

/// Outcome of converting one record
#[derive(Debug, Clone)]
pub struct ConvertedRecord {
    pub line_number: u64,
    /// Value of the schema's key column, when present and non-empty
    pub key: Option<String>,
    pub row: TypedRow,
    pub errors: Vec<ConversionError>,
}

impl ConvertedRecord {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Converts raw records against a fixed schema
pub struct RowConverter<'a> {
    schema: &'a TableSchema,
}

impl<'a> RowConverter<'a> {
    pub fn new(schema: &'a TableSchema) -> Self {
        Self { schema }
    }

    /// Convert one record. A row is always produced; fields that fail are
    /// `Null` in the row and listed in `errors`.
    pub fn convert(&self, record: &RawRecord) -> ConvertedRecord {
        let mut values = Vec::with_capacity(self.schema.columns.len());
        let mut errors = Vec::new();

        for column in &self.schema.columns {
            let raw = record.get(&column.name);
            let converted = if record.is_invalid_utf8(&column.name) {
                Err("value is not valid UTF-8".to_string())
            } else {
                convert_field(column, raw)
            };
            match converted {
                Ok(value) => values.push(value),
                Err(reason) => {
                    errors.push(ConversionError {
                        column: column.name.clone(),
                        raw_value: raw.unwrap_or_default().to_string(),
                        reason,
                    });
                    values.push(TypedValue::Null);
                }
            }
        }

        let key = self
            .schema
            .key_column
            .as_deref()
            .and_then(|k| record.get(k))
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string);

        ConvertedRecord {
            line_number: record.line_number,
            key,
            row: TypedRow { values },
            errors,
        }
    }
}

/// Convert a single raw field according to its column spec
pub fn convert_field(column: &ColumnSpec, raw: Option<&str>) -> Result<TypedValue, String> {
    let raw = match raw {
        Some(value) if !is_empty_for(column.column_type, value) => value,
        _ => {
            return if column.nullable {
                Ok(TypedValue::Null)
            } else {
                Err("required value is missing".to_string())
            };
        }
    };

    match column.column_type {
        ColumnType::String => Ok(TypedValue::String(raw.to_string())),
        ColumnType::Bool => parse_bool(raw).map(TypedValue::Bool),
        ColumnType::Double => parse_double(raw).map(TypedValue::Double),
        ColumnType::Int => parse_int(raw).map(TypedValue::Int),
        ColumnType::DateTime => parse_datetime(raw).map(TypedValue::DateTime),
    }
}

/// Strings keep surrounding whitespace, so only "" is empty for them
fn is_empty_for(column_type: ColumnType, value: &str) -> bool {
    match column_type {
        ColumnType::String => value.is_empty(),
        _ => value.trim().is_empty(),
    }
}

/// Case-insensitive "true"/"false", or "1"/"0"
pub fn parse_bool(value: &str) -> Result<bool, String> {
    let trimmed = value.trim();
    if trimmed.eq_ignore_ascii_case("true") || trimmed == "1" {
        Ok(true)
    } else if trimmed.eq_ignore_ascii_case("false") || trimmed == "0" {
        Ok(false)
    } else {
        Err("expected true, false, 1 or 0".to_string())
    }
}

/// Locale-invariant decimal: '.' separator, optional exponent, finite only
pub fn parse_double(value: &str) -> Result<f64, String> {
    let parsed = value
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("invalid decimal number: {}", e))?;
    if parsed.is_finite() {
        Ok(parsed)
    } else {
        Err("decimal number must be finite".to_string())
    }
}

pub fn parse_int(value: &str) -> Result<i32, String> {
    value
        .trim()
        .parse::<i32>()
        .map_err(|e| format!("invalid integer: {}", e))
}

/// `yyyy-MM-dd HH:mm:ss`, falling back to `yyyy-MM-dd` at midnight.
///
/// chrono accepts unpadded fields, a signed year and a leap second, so the
/// layout is checked position by position before parsing.
pub fn parse_datetime(value: &str) -> Result<NaiveDateTime, String> {
    const EXPECTED: &str = "expected 'yyyy-MM-dd HH:mm:ss' or 'yyyy-MM-dd'";

    let trimmed = value.trim();
    if matches_layout(trimmed, DATETIME_LAYOUT) {
        // Second 60 is a leap second to chrono
        if &trimmed[17..] == "60" {
            return Err(EXPECTED.to_string());
        }
        return NaiveDateTime::parse_from_str(trimmed, DATETIME_FORMAT)
            .map_err(|_| EXPECTED.to_string());
    }
    if matches_layout(trimmed, DATE_LAYOUT) {
        return NaiveDate::parse_from_str(trimmed, DATE_FORMAT)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .ok_or_else(|| EXPECTED.to_string());
    }
    Err(EXPECTED.to_string())
}

fn matches_layout(value: &str, layout: &[u8]) -> bool {
    value.len() == layout.len()
        && value.bytes().zip(layout).all(|(b, &l)| match l {
            b'9' => b.is_ascii_digit(),
            _ => b == l,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn schema() -> TableSchema {
        TableSchema::new(
            "Contact",
            Some("Id"),
            None,
            vec![
                ColumnSpec::required("Id", ColumnType::String),
                ColumnSpec::optional("Email", ColumnType::String),
                ColumnSpec::optional("DoNotCall", ColumnType::Bool),
                ColumnSpec::optional("Score", ColumnType::Double),
                ColumnSpec::optional("Employees", ColumnType::Int),
                ColumnSpec::optional("Birthdate", ColumnType::DateTime),
            ],
        )
        .unwrap()
    }

    fn record(line_number: u64, pairs: &[(&str, &str)]) -> RawRecord {
        RawRecord {
            line_number,
            values: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            invalid_utf8: Vec::new(),
        }
    }

    #[test]
    fn test_valid_booleans() {
        let test_cases = [
            ("true", true),
            ("TRUE", true),
            ("True", true),
            ("false", false),
            ("FALSE", false),
            ("fAlSe", false),
            ("1", true),
            ("0", false),
        ];

        for (input, expected) in test_cases {
            assert_eq!(parse_bool(input), Ok(expected), "input '{}'", input);
        }
    }

    #[test]
    fn test_invalid_booleans() {
        for input in ["yes", "no", "t", "f", "2", "-1", "truee", "01", "on"] {
            assert!(parse_bool(input).is_err(), "input '{}' should fail", input);
        }
    }

    #[test]
    fn test_double_parsing() {
        assert_eq!(parse_double("2.75"), Ok(2.75));
        assert_eq!(parse_double("-0.5"), Ok(-0.5));
        assert_eq!(parse_double("1e3"), Ok(1000.0));
        assert_eq!(parse_double(" 42 "), Ok(42.0));
        assert!(parse_double("2,75").is_err());
        assert!(parse_double("abc").is_err());
        assert!(parse_double("NaN").is_err());
        assert!(parse_double("inf").is_err());
    }

    #[test]
    fn test_int_parsing() {
        assert_eq!(parse_int("42"), Ok(42));
        assert_eq!(parse_int("-7"), Ok(-7));
        assert!(parse_int("4.2").is_err());
        assert!(parse_int("2147483648").is_err());
        assert!(parse_int("twelve").is_err());
    }

    #[test]
    fn test_datetime_parsing() {
        let dt = parse_datetime("2024-03-05 14:30:15").unwrap();
        assert_eq!(dt.to_string(), "2024-03-05 14:30:15");

        let date_only = parse_datetime("2024-03-05").unwrap();
        assert_eq!(date_only.to_string(), "2024-03-05 00:00:00");

        let padded = parse_datetime(" 2024-12-31 23:59:59 ").unwrap();
        assert_eq!(padded.to_string(), "2024-12-31 23:59:59");

        for input in [
            "2024-03-05T14:30:15",
            "03/05/2024",
            "2024-02-30",
            "2024-03-05 25:00:00",
            "yesterday",
            "2024-3-5",
            "2024-03-5",
            "2024-03-05 1:2:3",
            "2024-03-05 14:30",
            "+2024-03-05",
            "-2024-03-05",
            "2024-03-05 23:59:60",
            "2024-03-05 14:30:15.123",
            "2024/03/05",
            "２０２４-03-05",
        ] {
            assert!(parse_datetime(input).is_err(), "input '{}' should fail", input);
        }
    }

    #[test]
    fn test_nullable_empty_and_missing_values_become_null() {
        let schema = schema();
        let converter = RowConverter::new(&schema);

        let converted = converter.convert(&record(
            2,
            &[
                ("Id", "003A"),
                ("Email", ""),
                ("DoNotCall", ""),
                ("Score", "   "),
                // Employees and Birthdate missing entirely
            ],
        ));

        assert!(converted.is_valid(), "errors: {:?}", converted.errors);
        assert_eq!(converted.row.values[0], TypedValue::String("003A".into()));
        for value in &converted.row.values[1..] {
            assert_eq!(value, &TypedValue::Null);
        }
    }

    #[test]
    fn test_required_column_missing_is_an_error() {
        let schema = schema();
        let converter = RowConverter::new(&schema);

        let converted = converter.convert(&record(5, &[("Id", ""), ("Email", "a@b.c")]));

        assert!(!converted.is_valid());
        assert_eq!(converted.key, None);
        assert_eq!(converted.errors.len(), 1);
        assert_eq!(converted.errors[0].column, "Id");
        assert_eq!(converted.errors[0].reason, "required value is missing");
    }

    #[test]
    fn test_strings_pass_through_unchanged() {
        let schema = schema();
        let converter = RowConverter::new(&schema);

        let converted = converter.convert(&record(2, &[("Id", "003A"), ("Email", "  x@y.z ")]));

        assert_eq!(
            converted.row.get(&schema, "Email"),
            Some(&TypedValue::String("  x@y.z ".into()))
        );
    }

    #[test]
    fn test_bad_datetime_rejects_record_with_key() {
        let schema = schema();
        let converter = RowConverter::new(&schema);

        let converted = converter.convert(&record(
            9,
            &[
                ("Id", "003B"),
                ("DoNotCall", "true"),
                ("Birthdate", "31/12/1990"),
            ],
        ));

        assert!(!converted.is_valid());
        assert_eq!(converted.key.as_deref(), Some("003B"));
        assert_eq!(converted.line_number, 9);
        assert_eq!(converted.errors.len(), 1);
        assert_eq!(converted.errors[0].column, "Birthdate");
        assert_eq!(converted.errors[0].raw_value, "31/12/1990");
        // Row is still produced, with the failing field nulled
        assert_eq!(converted.row.values.len(), schema.columns.len());
        assert_eq!(
            converted.row.get(&schema, "Birthdate"),
            Some(&TypedValue::Null)
        );
        assert_eq!(
            converted.row.get(&schema, "DoNotCall"),
            Some(&TypedValue::Bool(true))
        );
    }

    #[test]
    fn test_invalid_utf8_field_rejects_record() {
        let schema = schema();
        let converter = RowConverter::new(&schema);
        let mut raw = record(3, &[("Id", "003B"), ("Email", "\u{fffd}\u{fffd}")]);
        raw.invalid_utf8.push("Email".to_string());

        let converted = converter.convert(&raw);

        assert!(!converted.is_valid());
        assert_eq!(converted.key.as_deref(), Some("003B"));
        assert_eq!(converted.errors.len(), 1);
        assert_eq!(converted.errors[0].column, "Email");
        assert_eq!(converted.errors[0].reason, "value is not valid UTF-8");
    }

    #[test]
    fn test_multiple_errors_collected() {
        let schema = schema();
        let converter = RowConverter::new(&schema);

        let converted = converter.convert(&record(
            3,
            &[
                ("Id", "003C"),
                ("DoNotCall", "maybe"),
                ("Score", "high"),
                ("Employees", "1.5"),
            ],
        ));

        let failed: Vec<_> = converted.errors.iter().map(|e| e.column.as_str()).collect();
        assert_eq!(failed, vec!["DoNotCall", "Score", "Employees"]);
    }
}
