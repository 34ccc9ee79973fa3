use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::warn;

/// A single CSV record keyed by header name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// 1-based line number in the source file (the header is line 1)
    pub line_number: u64,
    pub values: HashMap<String, String>,
    /// Columns whose bytes were not valid UTF-8; their value holds a lossy decoding
    pub invalid_utf8: Vec<String>,
}

impl RawRecord {
    /// Raw value of a column, `None` when the column is absent from the record
    pub fn get(&self, column: &str) -> Option<&str> {
        self.values.get(column).map(String::as_str)
    }

    pub fn is_invalid_utf8(&self, column: &str) -> bool {
        self.invalid_utf8.iter().any(|c| c == column)
    }
}

/// Configuration for delimited file reading (CSV, TSV, etc.)
#[derive(Debug, Clone)]
pub struct DelimitedConfig {
    pub delimiter: u8,
    pub quote: u8,
}

impl Default for DelimitedConfig {
    fn default() -> Self {
        Self {
            delimiter: b',',
            quote: b'"',
        }
    }
}

impl DelimitedConfig {
    pub fn csv() -> Self {
        Self::default()
    }
}

/// A fully read CSV file: its header and records
#[derive(Debug, Clone)]
pub struct CsvSource {
    pub headers: Vec<String>,
    pub records: Vec<RawRecord>,
}

impl CsvSource {
    /// Read a CSV file with a header row
    pub async fn open(path: &Path, config: &DelimitedConfig) -> Result<Self> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            anyhow::bail!("Input file not found: {}", path.display());
        }

        let buffer = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read input file {}", path.display()))?;

        Self::parse(&buffer, config)
            .with_context(|| format!("Failed to parse CSV file {}", path.display()))
    }

    /// Parse CSV bytes with a header row
    pub fn parse(data: &[u8], config: &DelimitedConfig) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .delimiter(config.delimiter)
            .quote(config.quote)
            .has_headers(true)
            // Short or long rows are reported as missing columns, not parse failures
            .flexible(true)
            .from_reader(data);

        let headers: Vec<String> = csv_reader
            .headers()
            .context("Failed to read CSV header")?
            .iter()
            .enumerate()
            .map(|(idx, h)| {
                // Salesforce exports often start with a UTF-8 BOM
                let h = if idx == 0 {
                    h.trim_start_matches('\u{feff}')
                } else {
                    h
                };
                h.trim().to_string()
            })
            .collect();

        if headers.iter().all(|h| h.is_empty()) {
            anyhow::bail!("CSV header row is empty");
        }

        let mut seen = HashSet::new();
        let duplicates: Vec<&str> = headers
            .iter()
            .filter(|h| !h.is_empty() && !seen.insert(h.as_str()))
            .map(String::as_str)
            .collect();
        if !duplicates.is_empty() {
            anyhow::bail!(
                "CSV header has duplicate column(s): {}",
                duplicates.join(", ")
            );
        }

        // Fields are decoded one by one so a bad byte only affects its own record
        let mut records = Vec::new();
        for result in csv_reader.byte_records() {
            let record = result.context("Failed to read CSV record")?;
            let line_number = record.position().map(|p| p.line()).unwrap_or(0);

            let mut values = HashMap::with_capacity(headers.len());
            let mut invalid_utf8 = Vec::new();
            for (name, field) in headers.iter().zip(record.iter()) {
                if name.is_empty() {
                    continue;
                }
                let value = match std::str::from_utf8(field) {
                    Ok(value) => value.to_string(),
                    Err(_) => {
                        warn!("Line {}: column '{}' is not valid UTF-8", line_number, name);
                        invalid_utf8.push(name.clone());
                        String::from_utf8_lossy(field).into_owned()
                    }
                };
                values.insert(name.clone(), value);
            }

            records.push(RawRecord {
                line_number,
                values,
                invalid_utf8,
            });
        }

        Ok(Self { headers, records })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_read_csv_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "Id,LastName,Email").unwrap();
        writeln!(temp_file, "003A,Smith,smith@example.com").unwrap();
        writeln!(temp_file, "003B,\"O'Brien, Jr\",").unwrap();
        temp_file.flush().unwrap();

        let source = CsvSource::open(temp_file.path(), &DelimitedConfig::csv())
            .await
            .unwrap();

        assert_eq!(source.headers, vec!["Id", "LastName", "Email"]);
        assert_eq!(source.records.len(), 2);
        assert_eq!(source.records[0].line_number, 2);
        assert_eq!(source.records[0].get("Email"), Some("smith@example.com"));
        assert_eq!(source.records[1].get("LastName"), Some("O'Brien, Jr"));
        assert_eq!(source.records[1].get("Email"), Some(""));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let err = CsvSource::open(Path::new("/no/such/file.csv"), &DelimitedConfig::csv())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Input file not found"));
    }

    #[test]
    fn test_short_rows_leave_columns_missing() {
        let data = b"Id,FirstName,LastName\n003A,Ann\n";
        let source = CsvSource::parse(data, &DelimitedConfig::csv()).unwrap();

        assert_eq!(source.records[0].get("FirstName"), Some("Ann"));
        assert_eq!(source.records[0].get("LastName"), None);
    }

    #[test]
    fn test_bom_is_stripped_from_header() {
        let data = "\u{feff}Id,Email\n003A,a@b.c\n".as_bytes();
        let source = CsvSource::parse(data, &DelimitedConfig::csv()).unwrap();

        assert_eq!(source.headers[0], "Id");
        assert_eq!(source.records[0].get("Id"), Some("003A"));
    }

    #[test]
    fn test_tab_delimiter() {
        let config = DelimitedConfig {
            delimiter: b'\t',
            ..DelimitedConfig::default()
        };
        let data = b"Id\tEmail\n003A\ta@b.c\n";
        let source = CsvSource::parse(data, &config).unwrap();

        assert_eq!(source.records[0].get("Email"), Some("a@b.c"));
    }

    #[test]
    fn test_invalid_utf8_is_isolated_to_its_record() {
        let data = b"Id,Name\n003A,Ann\n003B,\xff\xfe\n003C,Cy\n";
        let source = CsvSource::parse(data, &DelimitedConfig::csv()).unwrap();

        assert_eq!(source.records.len(), 3);
        assert!(source.records[0].invalid_utf8.is_empty());
        assert_eq!(source.records[1].line_number, 3);
        assert_eq!(source.records[1].get("Id"), Some("003B"));
        assert!(source.records[1].is_invalid_utf8("Name"));
        assert!(!source.records[1].is_invalid_utf8("Id"));
        assert_eq!(source.records[2].get("Name"), Some("Cy"));
        assert!(source.records[2].invalid_utf8.is_empty());
    }

    #[test]
    fn test_duplicate_header_names_are_rejected() {
        let data = b"Id,Email,Email\n003A,a@b.c,c@d.e\n";
        let err = CsvSource::parse(data, &DelimitedConfig::csv()).unwrap_err();

        assert!(err.to_string().contains("duplicate column(s): Email"));
    }

    #[test]
    fn test_line_numbers_account_for_multiline_fields() {
        let data = b"Id,Notes\n003A,\"first\nsecond\"\n003B,plain\n";
        let source = CsvSource::parse(data, &DelimitedConfig::csv()).unwrap();

        assert_eq!(source.records[0].line_number, 2);
        assert_eq!(source.records[1].line_number, 4);
    }
}
