//! Lazy, cached, filtered views over registered tables.
//!
//! A stage declares what it needs by constructing [`Reference`]s. Binding a
//! reference to a reader and run context is free; the first call to
//! [`BoundReference::rows`] performs exactly one load, memoized for the
//! lifetime of the bound reference.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use docgraph_shared::{DocGraphError, Result, RunContext};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::table::{Row, TableReader, WhereClause};

/// How one filter column gets its value.
#[derive(Clone)]
pub enum FilterStrategy {
    /// A fixed value.
    Constant(Value),
    /// Computed from the run context at load time.
    FromContext(Arc<dyn Fn(&RunContext) -> Value + Send + Sync>),
}

impl FilterStrategy {
    /// Convenience constructor for the context-derived variant.
    pub fn from_context<F>(f: F) -> Self
    where
        F: Fn(&RunContext) -> Value + Send + Sync + 'static,
    {
        Self::FromContext(Arc::new(f))
    }

    fn evaluate(&self, ctx: &RunContext) -> Value {
        match self {
            Self::Constant(value) => value.clone(),
            Self::FromContext(f) => f(ctx),
        }
    }
}

impl fmt::Debug for FilterStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant(value) => f.debug_tuple("Constant").field(value).finish(),
            Self::FromContext(_) => f.write_str("FromContext(..)"),
        }
    }
}

/// Which rows of the table a reference sees.
#[derive(Debug, Clone, Default)]
pub enum ReferenceFilter {
    /// Every row.
    #[default]
    All,
    /// Rows of the run's resolved documents. An empty id list means no filter.
    DocumentIds,
    /// Column filters, evaluated against the run context at load time.
    Columns(Vec<(String, FilterStrategy)>),
}

impl ReferenceFilter {
    /// Parse the literal filter form. Only `"id"` is recognised.
    pub fn parse(literal: &str) -> Result<Self> {
        match literal {
            "id" => Ok(Self::DocumentIds),
            other => Err(DocGraphError::config(format!(
                "unknown reference filter '{other}'"
            ))),
        }
    }
}

/// Declarative need for one table. Constructing it performs no I/O.
#[derive(Debug, Clone)]
pub struct Reference {
    table: String,
    filter: ReferenceFilter,
    load_content: bool,
}

impl Reference {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: ReferenceFilter::All,
            load_content: false,
        }
    }

    pub fn with_filter(mut self, filter: ReferenceFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Add one column filter (switching to column filtering if needed).
    pub fn filter_column(mut self, column: impl Into<String>, strategy: FilterStrategy) -> Self {
        match &mut self.filter {
            ReferenceFilter::Columns(columns) => columns.push((column.into(), strategy)),
            _ => self.filter = ReferenceFilter::Columns(vec![(column.into(), strategy)]),
        }
        self
    }

    /// Also load content columns.
    pub fn with_content(mut self) -> Self {
        self.load_content = true;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Bind to a reader and run context. No I/O happens here.
    pub fn bind<'s>(&self, reader: TableReader<'s>, ctx: &RunContext) -> Result<BoundReference<'s>> {
        if reader.schema().name != self.table {
            return Err(DocGraphError::config(format!(
                "reference to '{}' bound to a reader for '{}'",
                self.table,
                reader.schema().name
            )));
        }
        Ok(BoundReference {
            reference: self.clone(),
            reader,
            ctx: ctx.clone(),
            cache: OnceCell::new(),
            loads: AtomicUsize::new(0),
        })
    }

    /// Resolve the filter into a where clause for `ctx`.
    fn where_clause(&self, reader: &TableReader<'_>, ctx: &RunContext) -> Result<WhereClause> {
        match &self.filter {
            ReferenceFilter::All => Ok(Vec::new()),
            ReferenceFilter::DocumentIds => {
                let ids = ctx.resolved_document_ids();
                if ids.is_empty() {
                    return Ok(Vec::new());
                }
                let column = reader.schema().document_column.clone().ok_or_else(|| {
                    DocGraphError::config(format!(
                        "table '{}' is not document-scoped; cannot filter by id",
                        self.table
                    ))
                })?;
                let ids = ids.iter().cloned().map(Value::String).collect();
                Ok(vec![(column, Value::Array(ids))])
            }
            ReferenceFilter::Columns(columns) => Ok(columns
                .iter()
                .map(|(column, strategy)| (column.clone(), strategy.evaluate(ctx)))
                .collect()),
        }
    }
}

/// A reference bound to a reader and run context, loading on first access.
pub struct BoundReference<'s> {
    reference: Reference,
    reader: TableReader<'s>,
    ctx: RunContext,
    cache: OnceCell<Vec<Row>>,
    loads: AtomicUsize,
}

impl BoundReference<'_> {
    /// Rows of the referenced table, loaded once and cached.
    pub async fn rows(&self) -> Result<&[Row]> {
        let rows = self
            .cache
            .get_or_try_init(|| async {
                self.loads.fetch_add(1, Ordering::Relaxed);
                let where_clause = self.reference.where_clause(&self.reader, &self.ctx)?;
                let rows = self
                    .reader
                    .load(&self.ctx, &where_clause, None, self.reference.load_content)
                    .await?;
                tracing::debug!(
                    table = %self.reference.table,
                    rows = rows.len(),
                    run_id = %self.ctx.run_id,
                    "reference loaded"
                );
                Ok::<_, DocGraphError>(rows)
            })
            .await?;
        Ok(rows.as_slice())
    }

    /// Rows deserialized into `T`.
    pub async fn rows_as<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        self.rows()
            .await?
            .iter()
            .map(|row| {
                serde_json::from_value(Value::Object(row.clone())).map_err(|e| {
                    DocGraphError::validation(format!(
                        "row of '{}' does not match the expected shape: {e}",
                        self.reference.table
                    ))
                })
            })
            .collect()
    }

    /// Number of loads performed so far (0 or 1).
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn is_loaded(&self) -> bool {
        self.cache.initialized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TableRegistry;
    use crate::test_support::{doc, test_storage};
    use crate::{Storage, TableWriter};
    use docgraph_shared::DocumentRecord;
    use serde_json::json;

    async fn seeded() -> (Storage, TableRegistry) {
        let storage = test_storage().await;
        let registry = TableRegistry::with_graph_tables().expect("registry");
        for (id, url) in [("d1", "https://x.example/a"), ("d2", "https://x.example/b")] {
            storage.upsert_document(&doc(id, url, "fetched")).await.unwrap();
        }
        (storage, registry)
    }

    #[tokio::test]
    async fn empty_id_list_means_unfiltered() {
        let (storage, registry) = seeded().await;
        let reference = Reference::new("documents").with_filter(ReferenceFilter::parse("id").unwrap());

        let ctx = RunContext::new("run-1");
        let bound = reference
            .bind(TableReader::new(&storage, &registry, "documents").unwrap(), &ctx)
            .unwrap();
        assert_eq!(bound.rows().await.unwrap().len(), 2);

        let ctx = RunContext::new("run-1").with_resolved_document_ids(vec!["d2".into()]);
        let bound = reference
            .bind(TableReader::new(&storage, &registry, "documents").unwrap(), &ctx)
            .unwrap();
        let rows = bound.rows().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!("d2"));
    }

    #[tokio::test]
    async fn binding_is_lazy_and_loads_once() {
        let (storage, registry) = seeded().await;
        let ctx = RunContext::new("run-1");
        let bound = Reference::new("documents")
            .bind(TableReader::new(&storage, &registry, "documents").unwrap(), &ctx)
            .unwrap();
        assert!(!bound.is_loaded());
        assert_eq!(bound.load_count(), 0);

        let first = bound.rows().await.unwrap().len();
        storage
            .upsert_document(&doc("d3", "https://x.example/c", "fetched"))
            .await
            .unwrap();
        let second = bound.rows().await.unwrap().len();

        assert_eq!(first, 2);
        assert_eq!(second, 2, "cached for the reference's lifetime");
        assert_eq!(bound.load_count(), 1);
    }

    #[tokio::test]
    async fn context_filters_are_evaluated_at_load_time() {
        let storage = test_storage().await;
        let registry = TableRegistry::with_graph_tables().unwrap();
        let writer = TableWriter::new(&storage, &registry, "processed_documents")
            .await
            .unwrap();
        writer
            .write(&[
                json!({"document_id": "d1", "run_id": "run-a", "processed_at": "t"})
                    .as_object()
                    .cloned()
                    .unwrap(),
                json!({"document_id": "d2", "run_id": "run-b", "processed_at": "t"})
                    .as_object()
                    .cloned()
                    .unwrap(),
            ])
            .await
            .unwrap();

        // One definition, reused by two runs sharing the table.
        let reference = Reference::new("processed_documents").filter_column(
            "run_id",
            FilterStrategy::from_context(|ctx| Value::String(ctx.run_id.clone())),
        );

        for (run, expected) in [("run-a", "d1"), ("run-b", "d2")] {
            let bound = reference
                .bind(
                    TableReader::new(&storage, &registry, "processed_documents").unwrap(),
                    &RunContext::new(run),
                )
                .unwrap();
            let rows = bound.rows().await.unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0]["document_id"], json!(expected));
        }
    }

    #[tokio::test]
    async fn rows_deserialize_into_types() {
        let (storage, registry) = seeded().await;
        let bound = Reference::new("documents")
            .with_content()
            .bind(
                TableReader::new(&storage, &registry, "documents").unwrap(),
                &RunContext::new("run-1"),
            )
            .unwrap();
        let docs: Vec<DocumentRecord> = bound.rows_as().await.unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].content.as_deref(), Some("content of d1"));
    }

    #[test]
    fn unknown_literal_filter_rejected() {
        assert!(ReferenceFilter::parse("name").is_err());
    }
}
