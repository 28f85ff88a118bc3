//! Generic, registry-driven table access.
//!
//! Stages never write SQL for each other's tables: they read through a
//! [`TableReader`] (equality / IN filters plus the run's document
//! selection) and write through a [`TableWriter`] (idempotent upsert by the
//! table's declared key).

use docgraph_shared::{DocGraphError, Result, RunContext, WriteSummary};
use serde_json::Value;

use crate::registry::{TableRegistry, TableSchema};
use crate::{Storage, db_err};

/// One table row as a column → value map.
pub type Row = serde_json::Map<String, Value>;

/// Equality filters; an array value means `IN`.
pub type WhereClause = Vec<(String, Value)>;

/// Serialize a typed record into a row.
pub fn to_row<T: serde::Serialize>(record: &T) -> Result<Row> {
    match serde_json::to_value(record) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(DocGraphError::validation(format!(
            "expected an object row, got {other}"
        ))),
        Err(e) => Err(DocGraphError::validation(format!("unserializable row: {e}"))),
    }
}

// ---------------------------------------------------------------------------
// Value conversion
// ---------------------------------------------------------------------------

fn json_to_sql(value: &Value) -> libsql::Value {
    match value {
        Value::Null => libsql::Value::Null,
        Value::Bool(b) => libsql::Value::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => libsql::Value::Integer(i),
            None => libsql::Value::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => libsql::Value::Text(s.clone()),
        // Nested structures are stored as JSON text.
        other => libsql::Value::Text(other.to_string()),
    }
}

fn sql_to_json(value: libsql::Value) -> Value {
    match value {
        libsql::Value::Null => Value::Null,
        libsql::Value::Integer(i) => Value::from(i),
        libsql::Value::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        libsql::Value::Text(s) => Value::String(s),
        libsql::Value::Blob(bytes) => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
    }
}

// ---------------------------------------------------------------------------
// TableReader
// ---------------------------------------------------------------------------

/// Filtered reads of one registered table.
pub struct TableReader<'s> {
    storage: &'s Storage,
    schema: TableSchema,
}

impl<'s> TableReader<'s> {
    /// Build a reader for a registered table.
    pub fn new(storage: &'s Storage, registry: &TableRegistry, table: &str) -> Result<Self> {
        Ok(Self {
            storage,
            schema: registry.get(table)?,
        })
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Load rows matching `where_clause` and the run's document selection.
    ///
    /// The run's row cap narrows the document selection, never the rows of
    /// a selected document. Only an explicit `limit` caps the rows returned.
    pub async fn load(
        &self,
        ctx: &RunContext,
        where_clause: &WhereClause,
        limit: Option<usize>,
        load_content: bool,
    ) -> Result<Vec<Row>> {
        let columns = self.schema.select_columns(load_content);
        let mut conditions: Vec<String> = Vec::new();
        let mut values: Vec<libsql::Value> = Vec::new();

        for (column, value) in where_clause {
            if !self.schema.has_column(column) {
                return Err(DocGraphError::validation(format!(
                    "table '{}' has no column '{column}'",
                    self.schema.name
                )));
            }
            if let Some(condition) = push_condition(column, value, &mut values) {
                conditions.push(condition);
            } else {
                // `IN ()` matches nothing.
                return Ok(Vec::new());
            }
        }

        if let Some(doc_column) = &self.schema.document_column {
            let selected = if !ctx.resolved_document_ids().is_empty() {
                Some(ctx.resolved_document_ids().to_vec())
            } else if ctx.filter.has_selection() {
                Some(
                    self.storage
                        .select_document_ids(&ctx.filter, false)
                        .await?,
                )
            } else {
                None
            };
            if let Some(ids) = selected {
                let ids = Value::Array(ids.into_iter().map(Value::String).collect());
                match push_condition(doc_column, &ids, &mut values) {
                    Some(condition) => conditions.push(condition),
                    None => return Ok(Vec::new()),
                }
            }
        }

        let mut sql = format!("SELECT {} FROM {}", columns.join(", "), self.schema.name);
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY rowid");
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        tracing::debug!(table = %self.schema.name, %sql, "loading rows");

        let mut rows = self
            .storage
            .conn()
            .query(&sql, libsql::params_from_iter(values))
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let mut map = Row::new();
            for (i, column) in columns.iter().enumerate() {
                let value = row.get_value(i as i32).map_err(db_err)?;
                map.insert((*column).to_string(), sql_to_json(value));
            }
            results.push(map);
        }
        Ok(results)
    }
}

/// Append a bound condition for `column`. Returns `None` for an empty IN list.
fn push_condition(column: &str, value: &Value, values: &mut Vec<libsql::Value>) -> Option<String> {
    match value {
        Value::Null => Some(format!("{column} IS NULL")),
        Value::Array(items) if items.is_empty() => None,
        Value::Array(items) => {
            let placeholders: Vec<String> = items
                .iter()
                .map(|item| {
                    values.push(json_to_sql(item));
                    format!("?{}", values.len())
                })
                .collect();
            Some(format!("{column} IN ({})", placeholders.join(", ")))
        }
        scalar => {
            values.push(json_to_sql(scalar));
            Some(format!("{column} = ?{}", values.len()))
        }
    }
}

// ---------------------------------------------------------------------------
// TableWriter
// ---------------------------------------------------------------------------

/// Idempotent upserts into one registered table.
pub struct TableWriter<'s> {
    storage: &'s Storage,
    schema: TableSchema,
}

impl<'s> TableWriter<'s> {
    /// Build a writer for a registered table, creating the table if needed.
    pub async fn new(storage: &'s Storage, registry: &TableRegistry, table: &str) -> Result<Self> {
        let schema = registry.get(table)?;
        storage.execute_raw(&schema.create_sql()).await?;
        Ok(Self { storage, schema })
    }

    pub fn table(&self) -> &str {
        &self.schema.name
    }

    /// Upsert `rows` by the table key in one transaction.
    ///
    /// Writing zero rows is legal and reports `rows_written = 0`.
    pub async fn write(&self, rows: &[Row]) -> Result<WriteSummary> {
        if rows.is_empty() {
            return Ok(WriteSummary {
                rows_written: 0,
                table: self.schema.name.clone(),
            });
        }

        let _guard = self.storage.write_guard().await?;
        let tx = self.storage.conn().transaction().await.map_err(db_err)?;

        for row in rows {
            let (sql, values) = self.upsert_statement(row)?;
            tx.execute(&sql, libsql::params_from_iter(values))
                .await
                .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;

        tracing::debug!(table = %self.schema.name, rows = rows.len(), "rows written");

        Ok(WriteSummary {
            rows_written: rows.len(),
            table: self.schema.name.clone(),
        })
    }

    fn upsert_statement(&self, row: &Row) -> Result<(String, Vec<libsql::Value>)> {
        for key in &self.schema.key {
            if row.get(key).is_none_or(Value::is_null) {
                return Err(DocGraphError::validation(format!(
                    "row for '{}' is missing key column '{key}'",
                    self.schema.name
                )));
            }
        }
        if let Some(unknown) = row.keys().find(|c| !self.schema.has_column(c)) {
            return Err(DocGraphError::validation(format!(
                "table '{}' has no column '{unknown}'",
                self.schema.name
            )));
        }

        // Schema order keeps statements stable across rows.
        let columns: Vec<&str> = self
            .schema
            .columns
            .iter()
            .map(|c| c.name.as_str())
            .filter(|c| row.contains_key(*c))
            .collect();
        let values: Vec<libsql::Value> = columns.iter().map(|c| json_to_sql(&row[*c])).collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();

        let updates: Vec<String> = columns
            .iter()
            .filter(|c| !self.schema.key.iter().any(|k| k == *c))
            .map(|c| format!("{c} = excluded.{c}"))
            .collect();
        let on_conflict = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", updates.join(", "))
        };

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) {}",
            self.schema.name,
            columns.join(", "),
            placeholders.join(", "),
            self.schema.key.join(", "),
            on_conflict
        );
        Ok((sql, values))
    }
}
