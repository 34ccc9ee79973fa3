use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;

use super::{ColumnSpec, ColumnType, TableSchema};

/// Named destination schemas.
///
/// Starts out with the built-in Salesforce presets; callers can resolve a
/// preset by name or load a JSON schema file instead.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, TableSchema>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::with_presets()
    }
}

impl SchemaRegistry {
    /// Registry without any schemas
    pub fn empty() -> Self {
        Self {
            schemas: BTreeMap::new(),
        }
    }

    /// Registry with the built-in presets
    pub fn with_presets() -> Self {
        let mut registry = Self::empty();
        registry.register("contact", contact());
        registry.register("content_document_link", content_document_link());
        registry.register("content_version", content_version());
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, schema: TableSchema) {
        self.schemas.insert(name.into().to_lowercase(), schema);
    }

    /// Look up a schema by (case-insensitive) preset name
    pub fn get(&self, name: &str) -> Option<&TableSchema> {
        self.schemas.get(&name.to_lowercase())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(|k| k.as_str())
    }

    /// Resolve either a registered preset name or a path to a JSON schema file
    pub fn resolve(&self, name_or_path: &str) -> Result<TableSchema> {
        if let Some(schema) = self.get(name_or_path) {
            return Ok(schema.clone());
        }

        let path = Path::new(name_or_path);
        if path.exists() {
            return Self::load_file(path);
        }

        anyhow::bail!(
            "Unknown schema '{}'. Use one of [{}] or a path to a JSON schema file",
            name_or_path,
            self.names().collect::<Vec<_>>().join(", ")
        )
    }

    /// Load and validate a JSON schema file
    pub fn load_file(path: &Path) -> Result<TableSchema> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read schema file {}", path.display()))?;
        let schema: TableSchema = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse schema file {}", path.display()))?;
        schema
            .validate()
            .with_context(|| format!("Invalid schema file {}", path.display()))?;
        Ok(schema)
    }
}

fn preset(table: &str, columns: Vec<ColumnSpec>) -> TableSchema {
    TableSchema {
        table: table.to_string(),
        key_column: Some("Id".to_string()),
        watermark_column: Some("SystemModstamp".to_string()),
        columns,
    }
}

/// Salesforce Contact export
fn contact() -> TableSchema {
    use ColumnType::*;
    preset(
        "Contact",
        vec![
            ColumnSpec::required("Id", String),
            ColumnSpec::optional("AccountId", String),
            ColumnSpec::optional("Salutation", String),
            ColumnSpec::optional("FirstName", String),
            ColumnSpec::required("LastName", String),
            ColumnSpec::optional("Title", String),
            ColumnSpec::optional("Email", String),
            ColumnSpec::optional("Phone", String),
            ColumnSpec::optional("MobilePhone", String),
            ColumnSpec::optional("MailingStreet", String),
            ColumnSpec::optional("MailingCity", String),
            ColumnSpec::optional("MailingState", String),
            ColumnSpec::optional("MailingPostalCode", String),
            ColumnSpec::optional("MailingCountry", String),
            ColumnSpec::optional("MailingLatitude", Double),
            ColumnSpec::optional("MailingLongitude", Double),
            ColumnSpec::optional("Birthdate", DateTime),
            ColumnSpec::optional("LeadSource", String),
            ColumnSpec::optional("HasOptedOutOfEmail", Bool),
            ColumnSpec::optional("DoNotCall", Bool),
            ColumnSpec::required("IsDeleted", Bool),
            ColumnSpec::optional("OwnerId", String),
            ColumnSpec::optional("CreatedDate", DateTime),
            ColumnSpec::optional("LastModifiedDate", DateTime),
            ColumnSpec::required("SystemModstamp", DateTime),
        ],
    )
}

fn content_document_link() -> TableSchema {
    use ColumnType::*;
    preset(
        "ContentDocumentLink",
        vec![
            ColumnSpec::required("Id", String),
            ColumnSpec::required("LinkedEntityId", String),
            ColumnSpec::required("ContentDocumentId", String),
            ColumnSpec::required("IsDeleted", Bool),
            ColumnSpec::required("SystemModstamp", DateTime),
            ColumnSpec::optional("ShareType", String),
            ColumnSpec::optional("Visibility", String),
        ],
    )
}

fn content_version() -> TableSchema {
    use ColumnType::*;
    preset(
        "ContentVersion",
        vec![
            ColumnSpec::required("Id", String),
            ColumnSpec::required("ContentDocumentId", String),
            ColumnSpec::optional("Title", String),
            ColumnSpec::optional("PathOnClient", String),
            ColumnSpec::optional("FileExtension", String),
            ColumnSpec::optional("ContentSize", Int),
            ColumnSpec::optional("VersionNumber", String),
            ColumnSpec::optional("IsLatest", Bool),
            ColumnSpec::optional("AzureBlobUrl", String),
            ColumnSpec::required("SystemModstamp", DateTime),
        ],
    )
}
