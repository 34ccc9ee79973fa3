//! Typed parameter binding for both database backends

use chrono::NaiveDateTime;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::{Postgres, Sqlite};

use crate::convert::TypedValue;
use crate::schema::ColumnType;

/// A value to bind together with the type of the column it is written to.
/// The column type decides the SQL type of a NULL.
#[derive(Debug, Clone, Copy)]
pub struct SqlParam<'a> {
    pub column_type: ColumnType,
    pub value: &'a TypedValue,
}

impl<'a> SqlParam<'a> {
    pub fn new(column_type: ColumnType, value: &'a TypedValue) -> Self {
        Self { column_type, value }
    }
}

pub(crate) fn bind_postgres<'q>(
    query: Query<'q, Postgres, PgArguments>,
    param: &SqlParam<'_>,
) -> Query<'q, Postgres, PgArguments> {
    match param.value {
        TypedValue::Null => match param.column_type {
            ColumnType::String => query.bind(None::<String>),
            ColumnType::Bool => query.bind(None::<bool>),
            ColumnType::Double => query.bind(None::<f64>),
            ColumnType::Int => query.bind(None::<i32>),
            ColumnType::DateTime => query.bind(None::<NaiveDateTime>),
        },
        TypedValue::String(s) => query.bind(s.clone()),
        TypedValue::Bool(b) => query.bind(*b),
        TypedValue::Double(d) => query.bind(*d),
        TypedValue::Int(i) => query.bind(*i),
        TypedValue::DateTime(dt) => query.bind(*dt),
    }
}

pub(crate) fn bind_sqlite<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    param: &SqlParam<'_>,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match param.value {
        TypedValue::Null => match param.column_type {
            ColumnType::String => query.bind(None::<String>),
            ColumnType::Bool => query.bind(None::<bool>),
            ColumnType::Double => query.bind(None::<f64>),
            ColumnType::Int => query.bind(None::<i32>),
            ColumnType::DateTime => query.bind(None::<NaiveDateTime>),
        },
        TypedValue::String(s) => query.bind(s.clone()),
        TypedValue::Bool(b) => query.bind(*b),
        TypedValue::Double(d) => query.bind(*d),
        TypedValue::Int(i) => query.bind(*i),
        TypedValue::DateTime(dt) => query.bind(*dt),
    }
}
