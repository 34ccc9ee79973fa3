//! Destination table schemas
//!
//! A [`TableSchema`] is built once (from a preset or a JSON file) and then
//! shared by reference with the row converter, the batch loader and the sink.

pub mod registry;

pub use registry::SchemaRegistry;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Semantic type of a destination column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    #[serde(alias = "boolean")]
    Bool,
    #[serde(alias = "float")]
    Double,
    #[serde(alias = "integer")]
    Int,
    #[serde(alias = "timestamp")]
    DateTime,
}

impl ColumnType {
    pub fn name(&self) -> &'static str {
        match self {
            ColumnType::String => "string",
            ColumnType::Bool => "bool",
            ColumnType::Double => "double",
            ColumnType::Int => "int",
            ColumnType::DateTime => "datetime",
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A column in a destination table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, column_type: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable,
        }
    }

    pub fn required(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self::new(name, column_type, false)
    }

    pub fn optional(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self::new(name, column_type, true)
    }
}

/// A destination table: its name, ordered columns and bookkeeping columns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table: String,
    /// Column whose value identifies a record in reports and upserts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_column: Option<String>,
    /// DateTime column tracking the last modification of a record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark_column: Option<String>,
    pub columns: Vec<ColumnSpec>,
}

impl TableSchema {
    /// Build a schema and validate it
    pub fn new(
        table: impl Into<String>,
        key_column: Option<&str>,
        watermark_column: Option<&str>,
        columns: Vec<ColumnSpec>,
    ) -> Result<Self> {
        let schema = Self {
            table: table.into(),
            key_column: key_column.map(str::to_string),
            watermark_column: watermark_column.map(str::to_string),
            columns,
        };
        schema.validate()?;
        Ok(schema)
    }

    /// Check structural invariants: non-empty, unique column names, and
    /// bookkeeping columns that exist with the right types
    pub fn validate(&self) -> Result<()> {
        if self.table.trim().is_empty() {
            bail!("Schema table name cannot be empty");
        }
        if self.columns.is_empty() {
            bail!("Schema for table '{}' has no columns", self.table);
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            if column.name.trim().is_empty() {
                bail!("Schema for table '{}' has a column with no name", self.table);
            }
            if !seen.insert(column.name.as_str()) {
                bail!(
                    "Duplicate column '{}' in schema for table '{}'",
                    column.name,
                    self.table
                );
            }
        }

        if let Some(key) = &self.key_column
            && self.column(key).is_none()
        {
            bail!(
                "Key column '{}' is not a column of table '{}'",
                key,
                self.table
            );
        }

        if let Some(watermark) = &self.watermark_column {
            match self.column(watermark) {
                None => bail!(
                    "Watermark column '{}' is not a column of table '{}'",
                    watermark,
                    self.table
                ),
                Some(col) if col.column_type != ColumnType::DateTime => bail!(
                    "Watermark column '{}' must be a datetime column, found {}",
                    watermark,
                    col.column_type
                ),
                Some(_) => {}
            }
        }

        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    #[cfg(test)]
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Same columns, different destination table
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }
}
