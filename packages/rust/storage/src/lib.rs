//! Turso Embedded / libSQL storage layer for the knowledge graph.
//!
//! The [`Storage`] struct wraps a libSQL database holding documents,
//! extraction rows, the entity/claim graph, per-run tracking rows, and an
//! embedding cache. On top of it sit the pipeline substrate pieces:
//! [`TableRegistry`], [`TableReader`]/[`TableWriter`], and lazy
//! [`Reference`]s.
//!
//! **Access rules:**
//! - Pipeline runs: read-write via [`Storage::open`]; writes are serialized
//!   through one write lock, and every multi-row mutation runs in a transaction.
//! - Reporting: read-only via [`Storage::open_readonly`]

mod graph;
mod migrations;
pub mod reference;
pub mod registry;
pub mod table;

use std::path::Path;

use chrono::Utc;
use docgraph_shared::{
    ClaimRecord, ClaimTrackingRow, DocGraphError, DocumentRecord, EntityRecord,
    EntityTrackingRow, FilterSpec, Result, TrackingOperation,
};
use libsql::{Connection, Database, params};
use tokio::sync::{Mutex, MutexGuard};

pub use graph::{GraphTx, NewClaim, NewEntity, NewRelationship};
pub use reference::{BoundReference, FilterStrategy, Reference, ReferenceFilter};
pub use registry::{ColumnDef, SqlType, TableRegistry, TableSchema, graph_tables};
pub use table::{Row, TableReader, TableWriter, WhereClause, to_row};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
    write_lock: Mutex<()>,
}

/// Map a libSQL error into the storage variant.
pub(crate) fn db_err(e: libsql::Error) -> DocGraphError {
    DocGraphError::Storage(e.to_string())
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DocGraphError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
            write_lock: Mutex::new(()),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
            write_lock: Mutex::new(()),
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        DocGraphError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    pub(crate) async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(DocGraphError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Serialize writers. Held for the lifetime of a write transaction.
    pub(crate) async fn write_guard(&self) -> Result<MutexGuard<'_, ()>> {
        self.check_writable()?;
        Ok(self.write_lock.lock().await)
    }

    /// Execute raw SQL statements outside any transaction.
    pub async fn execute_raw(&self, sql: &str) -> Result<()> {
        let _guard = self.write_guard().await?;
        self.conn.execute_batch(sql).await.map_err(db_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Document operations
    // -----------------------------------------------------------------------

    /// Upsert a document record by id.
    pub async fn upsert_document(&self, doc: &DocumentRecord) -> Result<()> {
        let _guard = self.write_guard().await?;
        self.conn
            .execute(
                "INSERT INTO documents (id, source_url, status, content_type, cluster_id, content_path, content)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                   source_url = excluded.source_url,
                   status = excluded.status,
                   content_type = excluded.content_type,
                   cluster_id = excluded.cluster_id,
                   content_path = excluded.content_path,
                   content = excluded.content",
                params![
                    doc.id.as_str(),
                    doc.source_url.as_str(),
                    doc.status.as_str(),
                    doc.content_type.as_deref(),
                    doc.cluster_id,
                    doc.content_path.as_deref(),
                    doc.content.as_deref(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Document ids matching `filter`, in id order, capped at `filter.limit`.
    ///
    /// With `exclude_processed`, documents already handled by any earlier
    /// run are left out (incremental mode). The cap applies after that.
    pub async fn select_document_ids(
        &self,
        filter: &FilterSpec,
        exclude_processed: bool,
    ) -> Result<Vec<String>> {
        let mut sql = String::from("SELECT id, source_url FROM documents WHERE 1 = 1");
        let mut values: Vec<libsql::Value> = Vec::new();

        if let Some(status) = &filter.status {
            values.push(status.clone().into());
            sql.push_str(&format!(" AND status = ?{}", values.len()));
        }
        if let Some(content_type) = &filter.content_type {
            values.push(content_type.clone().into());
            sql.push_str(&format!(" AND content_type = ?{}", values.len()));
        }
        if let Some(cluster_id) = filter.cluster_id {
            values.push(cluster_id.into());
            sql.push_str(&format!(" AND cluster_id = ?{}", values.len()));
        }
        if exclude_processed {
            sql.push_str(" AND id NOT IN (SELECT document_id FROM processed_documents)");
        }
        sql.push_str(" ORDER BY id");

        let mut rows = self
            .conn
            .query(&sql, libsql::params_from_iter(values))
            .await
            .map_err(db_err)?;

        let pattern = match &filter.pattern {
            Some(p) => Some(filter.pattern_regex().ok_or_else(|| {
                DocGraphError::validation(format!("invalid document pattern '{p}'"))
            })?),
            None => None,
        };

        let mut ids = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let id: String = row.get(0).map_err(db_err)?;
            let url: String = row.get(1).map_err(db_err)?;
            if let Some(re) = &pattern {
                if !re.is_match(&url) {
                    continue;
                }
            }
            if !filter.document_ids.is_empty() && !filter.document_ids.contains(&id) {
                continue;
            }
            ids.push(id);
            if filter.limit.is_some_and(|cap| ids.len() >= cap) {
                break;
            }
        }
        Ok(ids)
    }

    /// Record that `run_id` has consumed these documents.
    pub async fn mark_documents_processed(&self, run_id: &str, ids: &[String]) -> Result<()> {
        let _guard = self.write_guard().await?;
        let tx = self.conn.transaction().await.map_err(db_err)?;
        let now = Utc::now().to_rfc3339();
        for id in ids {
            tx.execute(
                "INSERT OR IGNORE INTO processed_documents (document_id, run_id, processed_at)
                 VALUES (?1, ?2, ?3)",
                params![id.as_str(), run_id, now.as_str()],
            )
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Embedding cache operations
    // -----------------------------------------------------------------------

    /// Get a cached embedding vector.
    pub async fn get_embedding(&self, hash: &str) -> Result<Option<Vec<f32>>> {
        let mut rows = self
            .conn
            .query(
                "SELECT vector_json FROM embedding_cache WHERE hash = ?1",
                params![hash],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => {
                let json: String = row.get(0).map_err(db_err)?;
                Ok(Some(parse_vector(&json)?))
            }
            None => Ok(None),
        }
    }

    /// Store an embedding vector in the cache (upserts).
    pub async fn set_embedding(&self, hash: &str, model: &str, vector: &[f32]) -> Result<()> {
        let _guard = self.write_guard().await?;
        let now = Utc::now().to_rfc3339();
        let json = vector_json(vector)?;
        self.conn
            .execute(
                "INSERT INTO embedding_cache (hash, model, vector_json, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(hash) DO UPDATE SET
                   vector_json = excluded.vector_json,
                   created_at = excluded.created_at",
                params![hash, model, json.as_str(), now.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Graph reads
    // -----------------------------------------------------------------------

    /// All persisted entities with their embeddings.
    pub async fn list_entities(&self) -> Result<Vec<EntityRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, canonical_name, entity_type, description, embedding_json, created_at, updated_at
                 FROM entities ORDER BY created_at, id",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_entity(&row)?);
        }
        Ok(results)
    }

    /// Get an entity by id.
    pub async fn get_entity(&self, id: &str) -> Result<Option<EntityRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, canonical_name, entity_type, description, embedding_json, created_at, updated_at
                 FROM entities WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_entity(&row)?)),
            None => Ok(None),
        }
    }

    /// Aliases recorded for an entity, sorted.
    pub async fn entity_aliases(&self, entity_id: &str) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT alias FROM entity_aliases WHERE entity_id = ?1 ORDER BY alias",
                params![entity_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row.get::<String>(0).map_err(db_err)?);
        }
        Ok(results)
    }

    /// Persisted claims about one subject entity.
    pub async fn claims_for_subject(&self, subject_id: &str) -> Result<Vec<ClaimRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, statement, claim_type, subject_entity_id, source_document_id, quote,
                        quote_start, quote_end, confidence, embedding_json
                 FROM claims WHERE subject_entity_id = ?1 ORDER BY created_at, id",
                params![subject_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_claim(&row)?);
        }
        Ok(results)
    }

    /// Entity tracking rows written by one run, in mention-key order.
    pub async fn entity_tracking_for_run(&self, run_id: &str) -> Result<Vec<EntityTrackingRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT run_id, mention_key, name, entity_type, decision, operation, resolved_id,
                        source_document_ids, cluster_id, cluster_size
                 FROM entity_tracking WHERE run_id = ?1 ORDER BY mention_key",
                params![run_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_entity_tracking(&row)?);
        }
        Ok(results)
    }

    /// Claim tracking rows written by one run, in claim-key order.
    pub async fn claim_tracking_for_run(&self, run_id: &str) -> Result<Vec<ClaimTrackingRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT run_id, claim_key, statement, operation, resolved_id, subject_entity_id,
                        source_document_ids, duplicate_of, conflict_count
                 FROM claim_tracking WHERE run_id = ?1 ORDER BY claim_key",
                params![run_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_claim_tracking(&row)?);
        }
        Ok(results)
    }

    /// `(claim_id, conflicting_claim_id, reason)` triples recorded by one run.
    pub async fn conflicts_for_run(&self, run_id: &str) -> Result<Vec<(String, String, String)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT claim_id, conflicting_claim_id, reason FROM claim_conflicts
                 WHERE run_id = ?1 ORDER BY rowid",
                params![run_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push((
                row.get::<String>(0).map_err(db_err)?,
                row.get::<String>(1).map_err(db_err)?,
                row.get::<String>(2).map_err(db_err)?,
            ));
        }
        Ok(results)
    }

    pub async fn entity_count(&self) -> Result<u64> {
        self.count("entities").await
    }

    /// Row counts across the graph tables.
    pub async fn graph_stats(&self) -> Result<GraphStats> {
        Ok(GraphStats {
            documents: self.count("documents").await?,
            entities: self.count("entities").await?,
            relationships: self.count("relationships").await?,
            claims: self.count("claims").await?,
            conflicts: self.count("claim_conflicts").await?,
            entity_tracking_rows: self.count("entity_tracking").await?,
            claim_tracking_rows: self.count("claim_tracking").await?,
        })
    }

    async fn count(&self, table: &str) -> Result<u64> {
        registry::check_identifier(table)?;
        let mut rows = self
            .conn
            .query(&format!("SELECT COUNT(*) FROM {table}"), params![])
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(db_err)? as u64),
            None => Ok(0),
        }
    }
}

/// Row counts reported by `docgraph stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct GraphStats {
    pub documents: u64,
    pub entities: u64,
    pub relationships: u64,
    pub claims: u64,
    pub conflicts: u64,
    pub entity_tracking_rows: u64,
    pub claim_tracking_rows: u64,
}

// ---------------------------------------------------------------------------
// Row conversion
// ---------------------------------------------------------------------------

pub(crate) fn vector_json(vector: &[f32]) -> Result<String> {
    serde_json::to_string(vector).map_err(|e| DocGraphError::Storage(e.to_string()))
}

pub(crate) fn parse_vector(json: &str) -> Result<Vec<f32>> {
    serde_json::from_str(json)
        .map_err(|e| DocGraphError::Storage(format!("invalid embedding json: {e}")))
}

fn parse_time(s: &str) -> Result<chrono::DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DocGraphError::Storage(format!("invalid date: {e}")))
}

/// Convert a database row to an [`EntityRecord`].
fn row_to_entity(row: &libsql::Row) -> Result<EntityRecord> {
    Ok(EntityRecord {
        id: row.get::<String>(0).map_err(db_err)?,
        canonical_name: row.get::<String>(1).map_err(db_err)?,
        entity_type: row.get::<String>(2).map_err(db_err)?,
        description: row.get::<String>(3).unwrap_or_default(),
        embedding: parse_vector(&row.get::<String>(4).map_err(db_err)?)?,
        created_at: parse_time(&row.get::<String>(5).map_err(db_err)?)?,
        updated_at: parse_time(&row.get::<String>(6).map_err(db_err)?)?,
    })
}

/// Convert a database row to a [`ClaimRecord`].
fn row_to_claim(row: &libsql::Row) -> Result<ClaimRecord> {
    Ok(ClaimRecord {
        id: row.get::<String>(0).map_err(db_err)?,
        statement: row.get::<String>(1).map_err(db_err)?,
        claim_type: row.get::<String>(2).map_err(db_err)?,
        subject_entity_id: row.get::<String>(3).map_err(db_err)?,
        source_document_id: row.get::<String>(4).map_err(db_err)?,
        quote: row.get::<String>(5).unwrap_or_default(),
        quote_start: row.get::<i64>(6).ok().map(|v| v as usize),
        quote_end: row.get::<i64>(7).ok().map(|v| v as usize),
        confidence: row.get::<f64>(8).map_err(db_err)? as f32,
        embedding: parse_vector(&row.get::<String>(9).map_err(db_err)?)?,
    })
}

/// Convert a database row to an [`EntityTrackingRow`].
fn row_to_entity_tracking(row: &libsql::Row) -> Result<EntityTrackingRow> {
    let operation: String = row.get(5).map_err(db_err)?;
    let docs: String = row.get(7).map_err(db_err)?;
    Ok(EntityTrackingRow {
        run_id: row.get::<String>(0).map_err(db_err)?,
        mention_key: row.get::<String>(1).map_err(db_err)?,
        name: row.get::<String>(2).map_err(db_err)?,
        entity_type: row.get::<String>(3).map_err(db_err)?,
        decision: row.get::<String>(4).map_err(db_err)?,
        operation: operation.parse::<TrackingOperation>()?,
        resolved_id: row.get::<String>(6).ok(),
        source_document_ids: serde_json::from_str(&docs)
            .map_err(|e| DocGraphError::Storage(format!("invalid document list: {e}")))?,
        cluster_id: row.get::<i64>(8).ok(),
        cluster_size: row.get::<i64>(9).map_err(db_err)? as usize,
    })
}

fn row_to_claim_tracking(row: &libsql::Row) -> Result<ClaimTrackingRow> {
    let operation: String = row.get(3).map_err(db_err)?;
    let docs: String = row.get(6).map_err(db_err)?;
    Ok(ClaimTrackingRow {
        run_id: row.get::<String>(0).map_err(db_err)?,
        claim_key: row.get::<String>(1).map_err(db_err)?,
        statement: row.get::<String>(2).map_err(db_err)?,
        operation: operation.parse::<TrackingOperation>()?,
        resolved_id: row.get::<String>(4).ok(),
        subject_entity_id: row.get::<String>(5).ok(),
        source_document_ids: serde_json::from_str(&docs)
            .map_err(|e| DocGraphError::Storage(format!("invalid document list: {e}")))?,
        duplicate_of: row.get::<String>(7).ok(),
        conflict_count: row.get::<i64>(8).map_err(db_err)? as usize,
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("dg_test_{}.db", Uuid::now_v7()));
        let _s1 = Storage::open(&tmp).await.expect("first open");
        drop(_s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn document_selection_filters() {
        let storage = test_storage().await;
        storage
            .upsert_document(&doc("d1", "https://docs.example.com/guide/a", "fetched"))
            .await
            .unwrap();
        storage
            .upsert_document(&doc("d2", "https://docs.example.com/api/b", "fetched"))
            .await
            .unwrap();
        storage
            .upsert_document(&doc("d3", "https://docs.example.com/guide/c", "failed"))
            .await
            .unwrap();

        let all = storage
            .select_document_ids(&FilterSpec::default(), false)
            .await
            .expect("select all");
        assert_eq!(all, vec!["d1", "d2", "d3"]);

        let fetched_guides = FilterSpec {
            status: Some("fetched".into()),
            pattern: Some("https://docs.example.com/guide/*".into()),
            ..Default::default()
        };
        let ids = storage
            .select_document_ids(&fetched_guides, false)
            .await
            .expect("select filtered");
        assert_eq!(ids, vec!["d1"]);

        let capped = FilterSpec {
            limit: Some(2),
            ..Default::default()
        };
        let ids = storage
            .select_document_ids(&capped, false)
            .await
            .expect("select capped");
        assert_eq!(ids, vec!["d1", "d2"]);
    }

    #[tokio::test]
    async fn incremental_selection_skips_processed() {
        let storage = test_storage().await;
        storage
            .upsert_document(&doc("d1", "https://a.example/1", "fetched"))
            .await
            .unwrap();
        storage
            .upsert_document(&doc("d2", "https://a.example/2", "fetched"))
            .await
            .unwrap();

        storage
            .mark_documents_processed("run-1", &["d1".to_string()])
            .await
            .expect("mark processed");

        let ids = storage
            .select_document_ids(&FilterSpec::default(), true)
            .await
            .unwrap();
        assert_eq!(ids, vec!["d2"]);

        let ids = storage
            .select_document_ids(&FilterSpec::default(), false)
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[tokio::test]
    async fn embedding_cache() {
        let storage = test_storage().await;

        let cached = storage.get_embedding("h1").await.expect("miss");
        assert!(cached.is_none());

        storage
            .set_embedding("h1", "embed-small", &[0.5, -0.25])
            .await
            .expect("set");

        let cached = storage.get_embedding("h1").await.expect("hit");
        assert_eq!(cached, Some(vec![0.5, -0.25]));
    }

    #[tokio::test]
    async fn stats_on_empty_graph() {
        let storage = test_storage().await;
        let stats = storage.graph_stats().await.expect("stats");
        assert_eq!(stats, GraphStats::default());
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("dg_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        rw.upsert_document(&doc("d1", "https://example.com", "fetched"))
            .await
            .unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        let result = ro
            .upsert_document(&doc("d2", "https://example.com/2", "fetched"))
            .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }
}
