//! Table registry: logical table name → schema and upsert key.
//!
//! Every stage registers the tables it writes once at start-up. Readers and
//! writers are only built for registered tables, so depending on a table
//! nobody declared fails fast with [`DocGraphError::UnregisteredTable`].

use std::collections::HashMap;
use std::sync::RwLock;

use docgraph_shared::{DocGraphError, Result};

/// SQL storage class of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Text,
    Integer,
    Real,
}

impl SqlType {
    fn as_sql(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
        }
    }
}

/// One column of a registered table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: SqlType,
    /// Bulky payload column, only loaded when a reference asks for content.
    pub content: bool,
}

impl ColumnDef {
    pub fn text(name: &str) -> Self {
        Self::new(name, SqlType::Text)
    }

    pub fn integer(name: &str) -> Self {
        Self::new(name, SqlType::Integer)
    }

    pub fn real(name: &str) -> Self {
        Self::new(name, SqlType::Real)
    }

    /// Mark this column as content (lazy-loaded).
    pub fn content(mut self) -> Self {
        self.content = true;
        self
    }

    fn new(name: &str, sql_type: SqlType) -> Self {
        Self {
            name: name.to_string(),
            sql_type,
            content: false,
        }
    }
}

/// Declared shape of a table: columns, upsert key, and document scoping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub key: Vec<String>,
    /// Column holding the owning document id, if rows are document-scoped.
    pub document_column: Option<String>,
}

impl TableSchema {
    pub fn new(name: &str, columns: Vec<ColumnDef>, key: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            columns,
            key: key.iter().map(|k| k.to_string()).collect(),
            document_column: None,
        }
    }

    /// Scope rows by the given document-id column.
    pub fn scoped_by(mut self, column: &str) -> Self {
        self.document_column = Some(column.to_string());
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Columns to select, skipping content columns unless requested.
    pub fn select_columns(&self, load_content: bool) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| load_content || !c.content)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// `CREATE TABLE IF NOT EXISTS` statement for this schema.
    pub fn create_sql(&self) -> String {
        let mut parts: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{} {}", c.name, c.sql_type.as_sql()))
            .collect();
        parts.push(format!("UNIQUE({})", self.key.join(", ")));
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            self.name,
            parts.join(",\n    ")
        )
    }

    /// Check identifiers and key/scope columns.
    fn validate(&self) -> Result<()> {
        check_identifier(&self.name)?;
        if self.columns.is_empty() {
            return Err(DocGraphError::config(format!(
                "table '{}' declares no columns",
                self.name
            )));
        }
        for column in &self.columns {
            check_identifier(&column.name)?;
        }
        if self.key.is_empty() {
            return Err(DocGraphError::config(format!(
                "table '{}' declares no key",
                self.name
            )));
        }
        for key in self.key.iter().chain(self.document_column.iter()) {
            if !self.has_column(key) {
                return Err(DocGraphError::config(format!(
                    "table '{}' has no column '{key}'",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Reject anything that is not a plain lower-case SQL identifier.
pub(crate) fn check_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(DocGraphError::config(format!("invalid identifier '{name}'")))
    }
}

// ---------------------------------------------------------------------------
// TableRegistry
// ---------------------------------------------------------------------------

/// Shared mapping from logical table name to schema.
///
/// An explicit object rather than a process global, so tests can build
/// isolated registries.
#[derive(Debug, Default)]
pub struct TableRegistry {
    tables: RwLock<HashMap<String, TableSchema>>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the built-in graph tables.
    pub fn with_graph_tables() -> Result<Self> {
        let registry = Self::new();
        for schema in graph_tables() {
            registry.register(schema)?;
        }
        Ok(registry)
    }

    /// Register a table. Registering the same schema twice is a no-op;
    /// a different schema under an existing name is a config error.
    pub fn register(&self, schema: TableSchema) -> Result<()> {
        schema.validate()?;
        let mut tables = self
            .tables
            .write()
            .map_err(|_| DocGraphError::Storage("table registry lock poisoned".into()))?;

        match tables.get(&schema.name) {
            Some(existing) if *existing == schema => Ok(()),
            Some(_) => Err(DocGraphError::config(format!(
                "table '{}' is already registered with a different schema",
                schema.name
            ))),
            None => {
                tracing::debug!(table = %schema.name, key = ?schema.key, "registered table");
                tables.insert(schema.name.clone(), schema);
                Ok(())
            }
        }
    }

    /// Look up a table's schema.
    pub fn get(&self, table: &str) -> Result<TableSchema> {
        let tables = self
            .tables
            .read()
            .map_err(|_| DocGraphError::Storage("table registry lock poisoned".into()))?;
        tables
            .get(table)
            .cloned()
            .ok_or_else(|| DocGraphError::unregistered(table))
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables
            .read()
            .map(|t| t.contains_key(table))
            .unwrap_or(false)
    }

    /// Registered table names, sorted.
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tables
            .read()
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

// ---------------------------------------------------------------------------
// Built-in tables (mirrors migration v1)
// ---------------------------------------------------------------------------

/// Schemas of the tables created by the migrations.
pub fn graph_tables() -> Vec<TableSchema> {
    vec![
        TableSchema::new(
            "documents",
            vec![
                ColumnDef::text("id"),
                ColumnDef::text("source_url"),
                ColumnDef::text("status"),
                ColumnDef::text("content_type"),
                ColumnDef::integer("cluster_id"),
                ColumnDef::text("content_path"),
                ColumnDef::text("content").content(),
            ],
            &["id"],
        )
        .scoped_by("id"),
        TableSchema::new(
            "extractions",
            vec![
                ColumnDef::text("document_id"),
                ColumnDef::text("section_id"),
                ColumnDef::text("payload_json"),
            ],
            &["document_id", "section_id"],
        )
        .scoped_by("document_id"),
        TableSchema::new(
            "entities",
            vec![
                ColumnDef::text("id"),
                ColumnDef::text("canonical_name"),
                ColumnDef::text("entity_type"),
                ColumnDef::text("description"),
                ColumnDef::text("embedding_json").content(),
                ColumnDef::text("created_by_run"),
                ColumnDef::text("created_at"),
                ColumnDef::text("updated_at"),
            ],
            &["id"],
        ),
        TableSchema::new(
            "relationships",
            vec![
                ColumnDef::text("id"),
                ColumnDef::text("source_entity_id"),
                ColumnDef::text("target_entity_id"),
                ColumnDef::text("relationship_type"),
                ColumnDef::text("description"),
                ColumnDef::real("confidence"),
                ColumnDef::text("document_id"),
                ColumnDef::text("run_id"),
            ],
            &["id"],
        )
        .scoped_by("document_id"),
        TableSchema::new(
            "claims",
            vec![
                ColumnDef::text("id"),
                ColumnDef::text("statement"),
                ColumnDef::text("claim_type"),
                ColumnDef::text("subject_entity_id"),
                ColumnDef::text("source_document_id"),
                ColumnDef::text("quote"),
                ColumnDef::integer("quote_start"),
                ColumnDef::integer("quote_end"),
                ColumnDef::real("confidence"),
                ColumnDef::text("embedding_json").content(),
                ColumnDef::text("run_id"),
                ColumnDef::text("created_at"),
            ],
            &["id"],
        )
        .scoped_by("source_document_id"),
        TableSchema::new(
            "claim_conflicts",
            vec![
                ColumnDef::text("run_id"),
                ColumnDef::text("claim_id"),
                ColumnDef::text("conflicting_claim_id"),
                ColumnDef::text("reason"),
            ],
            &["claim_id", "conflicting_claim_id"],
        ),
        TableSchema::new(
            "entity_tracking",
            vec![
                ColumnDef::text("run_id"),
                ColumnDef::text("mention_key"),
                ColumnDef::text("name"),
                ColumnDef::text("entity_type"),
                ColumnDef::text("decision"),
                ColumnDef::text("operation"),
                ColumnDef::text("resolved_id"),
                ColumnDef::text("source_document_ids"),
                ColumnDef::integer("cluster_id"),
                ColumnDef::integer("cluster_size"),
                ColumnDef::text("created_at"),
            ],
            &["run_id", "mention_key"],
        ),
        TableSchema::new(
            "claim_tracking",
            vec![
                ColumnDef::text("run_id"),
                ColumnDef::text("claim_key"),
                ColumnDef::text("statement"),
                ColumnDef::text("operation"),
                ColumnDef::text("resolved_id"),
                ColumnDef::text("subject_entity_id"),
                ColumnDef::text("source_document_ids"),
                ColumnDef::text("duplicate_of"),
                ColumnDef::integer("conflict_count"),
                ColumnDef::text("created_at"),
            ],
            &["run_id", "claim_key"],
        ),
        TableSchema::new(
            "processed_documents",
            vec![
                ColumnDef::text("document_id"),
                ColumnDef::text("run_id"),
                ColumnDef::text("processed_at"),
            ],
            &["document_id", "run_id"],
        )
        .scoped_by("document_id"),
    ]
}
