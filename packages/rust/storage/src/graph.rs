//! Transactional mutations of the knowledge graph.
//!
//! Resolution engines apply a whole run's mutations through one [`GraphTx`].
//! Dropping a `GraphTx` without calling [`GraphTx::commit`] rolls back every
//! statement issued through it.

use chrono::Utc;
use docgraph_shared::{ClaimTrackingRow, DocGraphError, EntityTrackingRow, Result};
use libsql::{Transaction, params};
use tokio::sync::MutexGuard;

use crate::{Storage, db_err, vector_json};

/// An entity about to be created.
#[derive(Debug, Clone)]
pub struct NewEntity<'a> {
    pub id: &'a str,
    pub canonical_name: &'a str,
    pub entity_type: &'a str,
    pub description: &'a str,
    pub embedding: &'a [f32],
    pub run_id: &'a str,
}

/// A relationship between two resolved entities.
#[derive(Debug, Clone)]
pub struct NewRelationship<'a> {
    pub id: &'a str,
    pub source_entity_id: &'a str,
    pub target_entity_id: &'a str,
    pub relationship_type: &'a str,
    pub description: &'a str,
    pub confidence: f32,
    pub document_id: &'a str,
    pub run_id: &'a str,
}

/// A claim about a resolved subject.
#[derive(Debug, Clone)]
pub struct NewClaim<'a> {
    pub id: &'a str,
    pub statement: &'a str,
    pub claim_type: &'a str,
    pub subject_entity_id: &'a str,
    pub source_document_id: &'a str,
    pub quote: &'a str,
    pub quote_start: Option<usize>,
    pub quote_end: Option<usize>,
    pub confidence: f32,
    pub embedding: &'a [f32],
    pub run_id: &'a str,
}

impl Storage {
    /// Start a write transaction. Holds the write lock until commit or drop.
    pub async fn begin(&self) -> Result<GraphTx<'_>> {
        let guard = self.write_guard().await?;
        let tx = self.conn().transaction().await.map_err(db_err)?;
        Ok(GraphTx { tx, _guard: guard })
    }
}

/// One open write transaction over the graph tables.
pub struct GraphTx<'s> {
    tx: Transaction,
    _guard: MutexGuard<'s, ()>,
}

impl GraphTx<'_> {
    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await.map_err(db_err)
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await.map_err(db_err)
    }

    // -----------------------------------------------------------------------
    // Entities
    // -----------------------------------------------------------------------

    pub async fn insert_entity(&self, entity: &NewEntity<'_>) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let embedding = vector_json(entity.embedding)?;
        self.tx
            .execute(
                "INSERT INTO entities (id, canonical_name, entity_type, description, embedding_json,
                                       created_by_run, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entity.id,
                    entity.canonical_name,
                    entity.entity_type,
                    entity.description,
                    embedding.as_str(),
                    entity.run_id,
                    now.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn insert_entity_alias(&self, entity_id: &str, alias: &str) -> Result<()> {
        self.tx
            .execute(
                "INSERT OR IGNORE INTO entity_aliases (entity_id, alias) VALUES (?1, ?2)",
                params![entity_id, alias],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Id of an entity with this canonical name (case-insensitive) and type.
    pub async fn find_entity_by_name(&self, name: &str, entity_type: &str) -> Result<Option<String>> {
        let mut rows = self
            .tx
            .query(
                "SELECT id FROM entities
                 WHERE lower(canonical_name) = lower(?1) AND entity_type = ?2
                 ORDER BY created_at, id LIMIT 1",
                params![name, entity_type],
            )
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row.get::<String>(0).map_err(db_err)?)),
            None => Ok(None),
        }
    }

    pub async fn entity_exists(&self, id: &str) -> Result<bool> {
        let mut rows = self
            .tx
            .query("SELECT 1 FROM entities WHERE id = ?1", params![id])
            .await
            .map_err(db_err)?;
        Ok(rows.next().await.map_err(db_err)?.is_some())
    }

    /// Remove entities created under `run_id` that no tracking row or claim points at.
    ///
    /// Safe to run repeatedly; returns the number of entities removed.
    pub async fn delete_orphan_entities(&self, run_id: &str) -> Result<u64> {
        const ORPHANS: &str = "SELECT id FROM entities
             WHERE created_by_run = ?1
               AND id NOT IN (SELECT resolved_id FROM entity_tracking
                              WHERE run_id = ?1 AND resolved_id IS NOT NULL)
               AND id NOT IN (SELECT subject_entity_id FROM claims)";

        self.tx
            .execute(
                &format!("DELETE FROM entity_aliases WHERE entity_id IN ({ORPHANS})"),
                params![run_id],
            )
            .await
            .map_err(db_err)?;
        self.tx
            .execute(
                &format!(
                    "DELETE FROM relationships WHERE source_entity_id IN ({ORPHANS})
                        OR target_entity_id IN ({ORPHANS})"
                ),
                params![run_id],
            )
            .await
            .map_err(db_err)?;
        let removed = self
            .tx
            .execute(&format!("DELETE FROM entities WHERE id IN ({ORPHANS})"), params![run_id])
            .await
            .map_err(db_err)?;
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Relationships and claims
    // -----------------------------------------------------------------------

    /// Insert a relationship; an identical edge from the same document is kept once.
    pub async fn insert_relationship(&self, rel: &NewRelationship<'_>) -> Result<bool> {
        let inserted = self
            .tx
            .execute(
                "INSERT INTO relationships (id, source_entity_id, target_entity_id, relationship_type,
                                            description, confidence, document_id, run_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(source_entity_id, target_entity_id, relationship_type, document_id)
                 DO NOTHING",
                params![
                    rel.id,
                    rel.source_entity_id,
                    rel.target_entity_id,
                    rel.relationship_type,
                    rel.description,
                    f64::from(rel.confidence),
                    rel.document_id,
                    rel.run_id,
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(inserted > 0)
    }

    pub async fn insert_claim(&self, claim: &NewClaim<'_>) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let embedding = vector_json(claim.embedding)?;
        self.tx
            .execute(
                "INSERT INTO claims (id, statement, claim_type, subject_entity_id, source_document_id,
                                     quote, quote_start, quote_end, confidence, embedding_json,
                                     run_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    claim.id,
                    claim.statement,
                    claim.claim_type,
                    claim.subject_entity_id,
                    claim.source_document_id,
                    claim.quote,
                    claim.quote_start.map(|v| v as i64),
                    claim.quote_end.map(|v| v as i64),
                    f64::from(claim.confidence),
                    embedding.as_str(),
                    claim.run_id,
                    now.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn insert_conflict(
        &self,
        run_id: &str,
        claim_id: &str,
        conflicting_claim_id: &str,
        reason: &str,
    ) -> Result<()> {
        self.tx
            .execute(
                "INSERT OR IGNORE INTO claim_conflicts (run_id, claim_id, conflicting_claim_id, reason)
                 VALUES (?1, ?2, ?3, ?4)",
                params![run_id, claim_id, conflicting_claim_id, reason],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tracking (append-only)
    // -----------------------------------------------------------------------

    /// Record a mention's outcome. An existing row for the same run and mention is kept.
    /// Returns `false` when that earlier row was kept.
    pub async fn upsert_entity_tracking(&self, row: &EntityTrackingRow) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let docs = serde_json::to_string(&row.source_document_ids)
            .map_err(|e| DocGraphError::Storage(e.to_string()))?;
        let inserted = self
            .tx
            .execute(
                "INSERT INTO entity_tracking (run_id, mention_key, name, entity_type, decision, operation,
                                              resolved_id, source_document_ids, cluster_id, cluster_size,
                                              created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(run_id, mention_key) DO NOTHING",
                params![
                    row.run_id.as_str(),
                    row.mention_key.as_str(),
                    row.name.as_str(),
                    row.entity_type.as_str(),
                    row.decision.as_str(),
                    row.operation.as_str(),
                    row.resolved_id.as_deref(),
                    docs.as_str(),
                    row.cluster_id,
                    row.cluster_size as i64,
                    now.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(inserted > 0)
    }

    /// Record a claim's outcome. An existing row for the same run and claim is kept.
    /// Returns `false` when that earlier row was kept.
    pub async fn upsert_claim_tracking(&self, row: &ClaimTrackingRow) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let docs = serde_json::to_string(&row.source_document_ids)
            .map_err(|e| DocGraphError::Storage(e.to_string()))?;
        let inserted = self
            .tx
            .execute(
                "INSERT INTO claim_tracking (run_id, claim_key, statement, operation, resolved_id,
                                             subject_entity_id, source_document_ids, duplicate_of,
                                             conflict_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(run_id, claim_key) DO NOTHING",
                params![
                    row.run_id.as_str(),
                    row.claim_key.as_str(),
                    row.statement.as_str(),
                    row.operation.as_str(),
                    row.resolved_id.as_deref(),
                    row.subject_entity_id.as_deref(),
                    docs.as_str(),
                    row.duplicate_of.as_deref(),
                    row.conflict_count as i64,
                    now.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(inserted > 0)
    }
}
