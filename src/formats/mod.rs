//! CSV parsing for import sources

pub mod reader;

pub use reader::{CsvSource, DelimitedConfig, RawRecord};
