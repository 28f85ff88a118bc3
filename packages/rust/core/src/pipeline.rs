//! One consolidation run: select documents → cluster → resolve entities →
//! resolve claims → mark processed.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use docgraph_shared::{
    AppConfig, ExistingEntityRef, ExtractionRow, ProposedClaim, ProposedEntity,
    ProposedRelationship, Result, RunContext, WriteSummary,
};
use docgraph_storage::{Reference, ReferenceFilter, Storage, TableReader, TableRegistry};

use crate::bridge::{Embedder, ResolutionDecider};
use crate::claims::{self, ClaimResolutionSummary};
use crate::clustering::ClusterParams;
use crate::conflicts::ConflictPolicy;
use crate::entities::{self, EntityResolutionSummary};
use crate::stages::register_builtin_stages;

pub const EXTRACTIONS: &str = "extractions";

/// Everything one run did.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineResult {
    pub run_id: String,
    /// Documents selected for this run.
    pub documents: usize,
    pub extraction_rows: usize,
    /// Extraction rows whose payload could not be parsed.
    pub rows_skipped: usize,
    pub entity_cluster_rows: usize,
    pub claim_cluster_rows: usize,
    pub entities: EntityResolutionSummary,
    pub claims: ClaimResolutionSummary,
    pub elapsed_ms: u64,
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called when the run completes.
    fn done(&self, result: &PipelineResult);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn done(&self, _result: &PipelineResult) {}
}

/// Stored shape of one `extractions` row.
#[derive(Debug, Deserialize)]
struct StoredExtraction {
    document_id: String,
    section_id: String,
    payload_json: String,
}

/// Model output for one section, as stored in `payload_json`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ExtractionPayload {
    #[serde(default)]
    pub entities: Vec<ProposedEntity>,
    #[serde(default)]
    pub relationships: Vec<ProposedRelationship>,
    #[serde(default)]
    pub claims: Vec<ProposedClaim>,
    #[serde(default)]
    pub existing_entities_context: Vec<ExistingEntityRef>,
}

impl ExtractionPayload {
    pub fn from_row(row: &ExtractionRow) -> Self {
        Self {
            entities: row.entities.clone(),
            relationships: row.relationships.clone(),
            claims: row.claims.clone(),
            existing_entities_context: row.existing_entities_context.clone(),
        }
    }
}

/// Extraction rows of the run's documents. Rows with a malformed payload
/// are skipped; the second value counts them.
pub async fn load_extraction_rows(
    ctx: &RunContext,
    storage: &Storage,
    registry: &TableRegistry,
) -> Result<(Vec<ExtractionRow>, usize)> {
    let bound = Reference::new(EXTRACTIONS)
        .with_filter(ReferenceFilter::DocumentIds)
        .bind(TableReader::new(storage, registry, EXTRACTIONS)?, ctx)?;
    let stored: Vec<StoredExtraction> = bound.rows_as().await?;

    let mut rows = Vec::with_capacity(stored.len());
    let mut skipped = 0;
    for row in stored {
        match serde_json::from_str::<ExtractionPayload>(&row.payload_json) {
            Ok(payload) => rows.push(ExtractionRow {
                document_id: row.document_id,
                section_id: row.section_id,
                entities: payload.entities,
                relationships: payload.relationships,
                claims: payload.claims,
                existing_entities_context: payload.existing_entities_context,
            }),
            Err(e) => {
                warn!(
                    document = %row.document_id,
                    section = %row.section_id,
                    error = %e,
                    "malformed extraction payload, skipping row"
                );
                skipped += 1;
            }
        }
    }
    Ok((rows, skipped))
}

/// Run the consolidation stages for one run.
///
/// 1. Select documents from the filter (skipping processed ones in
///    incremental mode unless `reprocess` is set)
/// 2. Load their extraction rows
/// 3. Entity clustering and claim clustering, concurrently
/// 4. Entity resolution
/// 5. Claim resolution
/// 6. Mark the documents processed
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(run_id = %ctx.run_id, incremental = ctx.incremental))]
pub async fn run_pipeline(
    config: &AppConfig,
    storage: &Storage,
    registry: &TableRegistry,
    ctx: RunContext,
    embedder: &dyn Embedder,
    decider: &dyn ResolutionDecider,
    policy: &dyn ConflictPolicy,
    progress: &dyn ProgressReporter,
) -> Result<PipelineResult> {
    let start = Instant::now();
    let mut result = PipelineResult {
        run_id: ctx.run_id.clone(),
        ..PipelineResult::default()
    };

    info!(run_id = %ctx.run_id, "starting consolidation run");
    register_builtin_stages(registry)?;

    // --- Phase 1: Documents ---
    progress.phase("Selecting documents");
    let exclude_processed = ctx.incremental && !ctx.reprocess;
    let ids = storage
        .select_document_ids(&ctx.filter, exclude_processed)
        .await?;
    result.documents = ids.len();
    if ids.is_empty() {
        warn!(run_id = %ctx.run_id, "no documents selected, nothing to do");
        result.elapsed_ms = start.elapsed().as_millis() as u64;
        progress.done(&result);
        return Ok(result);
    }
    let ctx = ctx.with_resolved_document_ids(ids.clone());

    // --- Phase 2: Extractions ---
    progress.phase("Loading extractions");
    let (rows, skipped) = load_extraction_rows(&ctx, storage, registry).await?;
    result.extraction_rows = rows.len();
    result.rows_skipped = skipped;

    // --- Phase 3: Clustering ---
    progress.phase("Clustering entities and claims");
    // Embed calls block, so the two passes interleave only around storage awaits.
    let (entity_clusters, claim_clusters): (Result<WriteSummary>, Result<WriteSummary>) = tokio::join!(
        entities::entity_clustering(
            &ctx,
            storage,
            registry,
            &rows,
            embedder,
            ClusterParams::from(&config.clustering),
        ),
        claims::claim_clustering(&ctx, storage, registry, &rows, embedder, &config.claims),
    );
    result.entity_cluster_rows = entity_clusters?.rows_written;
    result.claim_cluster_rows = claim_clusters?.rows_written;

    // --- Phase 4: Entity resolution ---
    progress.phase("Resolving entities");
    let clusters = entities::load_entity_clusters(&ctx, storage, registry).await?;
    result.entities = entities::entity_resolution(
        &ctx,
        storage,
        &clusters,
        &rows,
        embedder,
        decider,
        &config.clustering,
    )
    .await?;

    // --- Phase 5: Claim resolution ---
    progress.phase("Resolving claims");
    let groups = claims::load_claim_groups(&ctx, storage, registry).await?;
    result.claims =
        claims::claim_resolution(&ctx, storage, &groups, &rows, embedder, policy, &config.claims)
            .await?;

    // --- Phase 6: Bookkeeping ---
    storage.mark_documents_processed(&ctx.run_id, &ids).await?;

    result.elapsed_ms = start.elapsed().as_millis() as u64;
    info!(
        run_id = %result.run_id,
        documents = result.documents,
        entities_created = result.entities.entities_created,
        claims_created = result.claims.claims_created,
        elapsed_ms = result.elapsed_ms,
        "consolidation run complete"
    );
    progress.done(&result);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflicts::ClaimTypeConflictPolicy;
    use crate::test_support::*;
    use docgraph_shared::{DocumentRecord, FilterSpec, TrackingOperation};
    use docgraph_storage::{TableWriter, to_row};
    use std::sync::Mutex;

    fn document(id: &str, status: &str) -> DocumentRecord {
        DocumentRecord {
            id: id.into(),
            source_url: format!("https://docs.example.com/{id}"),
            status: status.into(),
            content_type: Some("text/html".into()),
            cluster_id: None,
            content_path: None,
            content: None,
        }
    }

    async fn seed(storage: &Storage, registry: &TableRegistry, rows: &[ExtractionRow], status: &str) {
        for row in rows {
            storage.upsert_document(&document(&row.document_id, status)).await.unwrap();
        }
        let writer = TableWriter::new(storage, registry, EXTRACTIONS).await.unwrap();
        let out: Vec<_> = rows
            .iter()
            .map(|row| {
                to_row(&serde_json::json!({
                    "document_id": row.document_id,
                    "section_id": row.section_id,
                    "payload_json": serde_json::to_string(&ExtractionPayload::from_row(row)).unwrap(),
                }))
                .unwrap()
            })
            .collect();
        writer.write(&out).await.unwrap();
    }

    fn react_docs() -> Vec<ExtractionRow> {
        let mut first = row("d1", vec![entity("react", "Technology"), entity("Vite", "Tool")]);
        first.relationships = vec![relationship(1, 0, "supports")];
        first.claims = vec![claim("React supports hooks", "capability", &[0])];
        let mut second = row("d2", vec![entity("reactjs", "Technology")]);
        second.claims = vec![claim("React supports hooks", "capability", &[0])];
        vec![first, second]
    }

    fn decider() -> StubDecider {
        StubDecider::default()
            .decide_as("react", "React", "CREATE_NEW")
            .decide_as("reactjs", "React", "MERGE_WITH:react")
    }

    #[derive(Default)]
    struct RecordingProgress(Mutex<Vec<String>>);

    impl ProgressReporter for RecordingProgress {
        fn phase(&self, name: &str) {
            self.0.lock().unwrap().push(name.to_string());
        }
        fn done(&self, _result: &PipelineResult) {
            self.0.lock().unwrap().push("done".into());
        }
    }

    #[tokio::test]
    async fn full_run_consolidates_documents() {
        let storage = test_storage().await;
        let registry = TableRegistry::with_graph_tables().unwrap();
        seed(&storage, &registry, &react_docs(), "fetched").await;
        let progress = RecordingProgress::default();

        let result = run_pipeline(
            &AppConfig::default(),
            &storage,
            &registry,
            RunContext::new("run-1"),
            &StubEmbedder::default(),
            &decider(),
            &ClaimTypeConflictPolicy::default(),
            &progress,
        )
        .await
        .unwrap();

        assert_eq!(result.documents, 2);
        assert_eq!(result.extraction_rows, 2);
        assert_eq!(result.entity_cluster_rows, 3);
        assert_eq!(result.claim_cluster_rows, 2);
        assert_eq!(result.entities.entities_created, 2);
        assert_eq!(result.entities.relationships_created, 1);
        assert_eq!(result.claims.claims_created, 1);
        assert_eq!(result.claims.duplicates_skipped, 1);
        assert_eq!(progress.0.lock().unwrap().last().map(String::as_str), Some("done"));

        let react = storage
            .list_entities()
            .await
            .unwrap()
            .into_iter()
            .find(|e| e.canonical_name == "React")
            .unwrap();
        assert_eq!(storage.claims_for_subject(&react.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn incremental_run_skips_processed_documents() {
        let storage = test_storage().await;
        let registry = TableRegistry::with_graph_tables().unwrap();
        seed(&storage, &registry, &react_docs(), "fetched").await;
        let embedder = StubEmbedder::default();
        let decider = decider();

        let run = |id: &str, reprocess: bool| {
            RunContext::new(id)
                .with_incremental(true)
                .with_reprocess(reprocess)
        };
        let first = run_pipeline(
            &AppConfig::default(),
            &storage,
            &registry,
            run("run-1", false),
            &embedder,
            &decider,
            &ClaimTypeConflictPolicy::default(),
            &SilentProgress,
        )
        .await
        .unwrap();
        assert_eq!(first.documents, 2);

        let second = run_pipeline(
            &AppConfig::default(),
            &storage,
            &registry,
            run("run-2", false),
            &embedder,
            &decider,
            &ClaimTypeConflictPolicy::default(),
            &SilentProgress,
        )
        .await
        .unwrap();
        assert_eq!(second.documents, 0);
        assert_eq!(second.entities, EntityResolutionSummary::default());

        let third = run_pipeline(
            &AppConfig::default(),
            &storage,
            &registry,
            run("run-3", true),
            &embedder,
            &decider,
            &ClaimTypeConflictPolicy::default(),
            &SilentProgress,
        )
        .await
        .unwrap();
        assert_eq!(third.documents, 2);
        assert_eq!(third.entities.entities_created, 0, "reprocessing links to existing entities");
        assert_eq!(storage.entity_count().await.unwrap(), 2);
        let tracking = storage.entity_tracking_for_run("run-3").await.unwrap();
        assert!(tracking.iter().all(|t| t.operation != TrackingOperation::Created));
    }

    #[tokio::test]
    async fn filter_narrows_the_run() {
        let storage = test_storage().await;
        let registry = TableRegistry::with_graph_tables().unwrap();
        let docs = react_docs();
        seed(&storage, &registry, &docs[..1], "fetched").await;
        seed(&storage, &registry, &docs[1..], "failed").await;

        let ctx = RunContext::new("run-1").with_filter(FilterSpec {
            status: Some("fetched".into()),
            ..Default::default()
        });
        let result = run_pipeline(
            &AppConfig::default(),
            &storage,
            &registry,
            ctx,
            &StubEmbedder::default(),
            &decider(),
            &ClaimTypeConflictPolicy::default(),
            &SilentProgress,
        )
        .await
        .unwrap();
        assert_eq!(result.documents, 1);
        assert_eq!(result.extraction_rows, 1);
        assert_eq!(result.entities.rows_written, 2);
    }

    #[tokio::test]
    async fn document_cap_keeps_every_mention_of_selected_documents() {
        let storage = test_storage().await;
        let registry = TableRegistry::with_graph_tables().unwrap();
        let docs = vec![
            row(
                "d1",
                vec![
                    entity("Kubernetes", "Platform"),
                    entity("Postgres", "Database"),
                    entity("Nginx", "Server"),
                ],
            ),
            row("d2", vec![entity("Redis", "Database")]),
        ];
        seed(&storage, &registry, &docs, "fetched").await;

        let ctx = RunContext::new("run-1")
            .with_incremental(true)
            .with_filter(FilterSpec {
                limit: Some(1),
                ..Default::default()
            });
        let result = run_pipeline(
            &AppConfig::default(),
            &storage,
            &registry,
            ctx,
            &StubEmbedder::default(),
            &StubDecider::default(),
            &ClaimTypeConflictPolicy::default(),
            &SilentProgress,
        )
        .await
        .unwrap();

        assert_eq!(result.documents, 1);
        assert_eq!(result.entity_cluster_rows, 3);
        assert_eq!(result.entities.entities_created, 3);
        assert_eq!(result.entities.unresolved, 0);

        let pending = storage
            .select_document_ids(&FilterSpec::default(), true)
            .await
            .unwrap();
        assert_eq!(pending, vec!["d2"]);
    }

    /// Embedder that records how many embed calls were in flight at once.
    #[derive(Default)]
    struct InFlightEmbedder {
        inner: StubEmbedder,
        current: std::sync::atomic::AtomicUsize,
        peak: std::sync::atomic::AtomicUsize,
    }

    impl Embedder for InFlightEmbedder {
        fn model(&self) -> &str {
            self.inner.model()
        }

        fn embed(&self, texts: &[String]) -> docgraph_shared::Result<Vec<Vec<f32>>> {
            use std::sync::atomic::Ordering;
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let out = self.inner.embed(texts);
            self.current.fetch_sub(1, Ordering::SeqCst);
            out
        }
    }

    #[tokio::test]
    async fn joined_clustering_passes_never_overlap_model_calls() {
        let storage = test_storage().await;
        let registry = TableRegistry::with_graph_tables().unwrap();
        seed(&storage, &registry, &react_docs(), "fetched").await;
        let embedder = InFlightEmbedder::default();

        let result = run_pipeline(
            &AppConfig::default(),
            &storage,
            &registry,
            RunContext::new("run-1"),
            &embedder,
            &decider(),
            &ClaimTypeConflictPolicy::default(),
            &SilentProgress,
        )
        .await
        .unwrap();

        assert_eq!(result.entity_cluster_rows, 3);
        assert_eq!(result.claim_cluster_rows, 2);
        assert!(embedder.inner.calls() >= 2);
        assert_eq!(embedder.peak.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_payload_is_skipped() {
        let storage = test_storage().await;
        let registry = TableRegistry::with_graph_tables().unwrap();
        seed(&storage, &registry, &react_docs()[..1], "fetched").await;
        storage.upsert_document(&document("d9", "fetched")).await.unwrap();
        let writer = TableWriter::new(&storage, &registry, EXTRACTIONS).await.unwrap();
        writer
            .write(&[to_row(&serde_json::json!({
                "document_id": "d9",
                "section_id": "s0",
                "payload_json": "{not json",
            }))
            .unwrap()])
            .await
            .unwrap();

        let ctx = RunContext::new("run-1").with_resolved_document_ids(vec!["d1".into(), "d9".into()]);
        let (rows, skipped) = load_extraction_rows(&ctx, &storage, &registry).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(skipped, 1);
    }

    #[tokio::test]
    async fn cycle_aborts_the_run_before_claims() {
        let storage = test_storage().await;
        let registry = TableRegistry::with_graph_tables().unwrap();
        seed(&storage, &registry, &react_docs(), "fetched").await;
        let decider = StubDecider::default()
            .decide_as("react", "React", "MERGE_WITH:reactjs")
            .decide_as("reactjs", "React", "MERGE_WITH:react");

        let err = run_pipeline(
            &AppConfig::default(),
            &storage,
            &registry,
            RunContext::new("run-1"),
            &StubEmbedder::default(),
            &decider,
            &ClaimTypeConflictPolicy::default(),
            &SilentProgress,
        )
        .await
        .unwrap_err();
        assert!(err.is_fatal());
        let stats = storage.graph_stats().await.unwrap();
        assert_eq!(stats.entities, 0);
        assert_eq!(stats.claim_tracking_rows, 0);
        assert!(
            storage
                .select_document_ids(&FilterSpec::default(), true)
                .await
                .unwrap()
                .len()
                == 2,
            "failed run leaves documents unprocessed"
        );
    }
}
