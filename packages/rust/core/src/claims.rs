//! Claim clustering and claim resolution stages.
//!
//! Claims attach to the entity their first entity index resolved to in
//! this run. Near-identical statements about the same subject are skipped
//! as duplicates; contradicting ones are both kept and the contradiction is
//! recorded.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use docgraph_shared::{
    ClaimRecord, ClaimTrackingRow, ClaimsConfig, ExtractionRow, ProposedClaim, Result, RunContext,
    TrackingOperation, WriteSummary, claim_key, mention_key,
};
use docgraph_storage::{NewClaim, Storage, TableReader, TableRegistry, TableWriter, to_row};

use crate::bridge::{CachedEmbedder, Embedder};
use crate::clustering::{ClusterParams, cluster_indices, cosine_distance};
use crate::conflicts::{ClaimView, ConflictPolicy};
use crate::stages::{CLAIM_CLUSTERS, run_scoped};

/// Counts reported by [`claim_resolution`].
///
/// `claims_processed == claims_created + duplicates_skipped + unresolved_entities`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimResolutionSummary {
    pub claims_processed: usize,
    pub claims_created: usize,
    pub duplicates_skipped: usize,
    /// Claims whose subject did not resolve to an entity.
    pub unresolved_entities: usize,
    pub conflicts_detected: usize,
}

/// One claim of one section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimMention {
    pub key: String,
    pub document_id: String,
    pub section_id: String,
    pub index: usize,
    pub statement: String,
}

/// Claims whose statements embed close together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimGroup {
    pub group_id: i64,
    pub members: Vec<ClaimMention>,
}

fn claim_mentions(rows: &[ExtractionRow]) -> Vec<ClaimMention> {
    rows.iter()
        .flat_map(|row| {
            row.claims.iter().enumerate().map(|(index, claim)| ClaimMention {
                key: claim_key(&row.document_id, &row.section_id, index),
                document_id: row.document_id.clone(),
                section_id: row.section_id.clone(),
                index,
                statement: claim.statement.clone(),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Clustering
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClaimClusterRow {
    run_id: String,
    claim_key: String,
    group_id: i64,
    group_size: i64,
    document_id: String,
    section_id: String,
    claim_index: i64,
    statement: String,
}

/// Group the run's claims by statement embedding and write them to
/// `claim_clusters`. Statements within `conflict_threshold` share a group.
#[instrument(skip_all, fields(run_id = %ctx.run_id, rows = rows.len()))]
pub async fn claim_clustering(
    ctx: &RunContext,
    storage: &Storage,
    registry: &TableRegistry,
    rows: &[ExtractionRow],
    embedder: &dyn Embedder,
    config: &ClaimsConfig,
) -> Result<WriteSummary> {
    let writer = TableWriter::new(storage, registry, CLAIM_CLUSTERS).await?;
    let mentions = claim_mentions(rows);
    if mentions.is_empty() {
        return writer.write(&[]).await;
    }

    let statements: Vec<String> = mentions.iter().map(|m| m.statement.clone()).collect();
    let vectors = CachedEmbedder::new(storage, embedder)
        .embed(&statements, "claim_clustering")
        .await?;
    let params = ClusterParams {
        eps: config.conflict_threshold,
        min_samples: 1,
    };
    let groups = cluster_indices(&vectors, params);

    let mut out = Vec::with_capacity(mentions.len());
    for (group_id, members) in groups.iter().enumerate() {
        for &i in members {
            let m = &mentions[i];
            out.push(to_row(&ClaimClusterRow {
                run_id: ctx.run_id.clone(),
                claim_key: m.key.clone(),
                group_id: group_id as i64,
                group_size: members.len() as i64,
                document_id: m.document_id.clone(),
                section_id: m.section_id.clone(),
                claim_index: m.index as i64,
                statement: m.statement.clone(),
            })?);
        }
    }
    let summary = writer.write(&out).await?;

    info!(
        claims = mentions.len(),
        groups = groups.len(),
        rows_written = summary.rows_written,
        "claim clustering complete"
    );
    Ok(summary)
}

/// This run's claim groups, read back from `claim_clusters`.
pub async fn load_claim_groups(
    ctx: &RunContext,
    storage: &Storage,
    registry: &TableRegistry,
) -> Result<Vec<ClaimGroup>> {
    let bound = run_scoped(CLAIM_CLUSTERS).bind(TableReader::new(storage, registry, CLAIM_CLUSTERS)?, ctx)?;
    let rows: Vec<ClaimClusterRow> = bound.rows_as().await?;

    let mut grouped: BTreeMap<i64, Vec<ClaimMention>> = BTreeMap::new();
    for row in rows {
        grouped.entry(row.group_id).or_default().push(ClaimMention {
            key: row.claim_key,
            document_id: row.document_id,
            section_id: row.section_id,
            index: row.claim_index.max(0) as usize,
            statement: row.statement,
        });
    }
    Ok(grouped
        .into_iter()
        .map(|(group_id, members)| ClaimGroup { group_id, members })
        .collect())
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// One input claim, in processing order.
struct Input<'r> {
    key: String,
    group_id: Option<i64>,
    document_id: &'r str,
    claim: &'r ProposedClaim,
    subject: Option<String>,
}

/// A claim created earlier in this run.
struct Survivor<'r> {
    id: String,
    group_id: Option<i64>,
    subject: String,
    claim: &'r ProposedClaim,
    vector: Vec<f32>,
}

enum Planned {
    Create { survivor: usize },
    Duplicate { of: String, subject: String },
    Unresolved,
}

/// Resolve this run's claims against the graph in one transaction.
///
/// Claims are processed group by group, so a duplicate is matched against
/// its own group before the rest of the batch and the persisted claims.
#[instrument(skip_all, fields(run_id = %ctx.run_id, groups = groups.len()))]
pub async fn claim_resolution(
    ctx: &RunContext,
    storage: &Storage,
    groups: &[ClaimGroup],
    rows: &[ExtractionRow],
    embedder: &dyn Embedder,
    policy: &dyn ConflictPolicy,
    config: &ClaimsConfig,
) -> Result<ClaimResolutionSummary> {
    let subjects: HashMap<String, String> = storage
        .entity_tracking_for_run(&ctx.run_id)
        .await?
        .into_iter()
        .filter_map(|t| t.resolved_id.map(|id| (t.mention_key, id)))
        .collect();

    let mut by_key: HashMap<String, (&ExtractionRow, &ProposedClaim)> = HashMap::new();
    for row in rows {
        for (index, claim) in row.claims.iter().enumerate() {
            by_key.insert(claim_key(&row.document_id, &row.section_id, index), (row, claim));
        }
    }

    // Grouped claims first, then anything the groups do not cover.
    let mut order: Vec<(String, Option<i64>)> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for group in groups {
        for member in &group.members {
            if by_key.contains_key(&member.key) && seen.insert(member.key.clone()) {
                order.push((member.key.clone(), Some(group.group_id)));
            }
        }
    }
    for row in rows {
        for index in 0..row.claims.len() {
            let key = claim_key(&row.document_id, &row.section_id, index);
            if seen.insert(key.clone()) {
                order.push((key, None));
            }
        }
    }

    let inputs: Vec<Input<'_>> = order
        .into_iter()
        .filter_map(|(key, group_id)| {
            let (row, claim) = *by_key.get(&key)?;
            let subject = claim.entity_indices.first().and_then(|&index| {
                subjects
                    .get(&mention_key(&row.document_id, &row.section_id, index))
                    .cloned()
            });
            Some(Input {
                key,
                group_id,
                document_id: &row.document_id,
                claim,
                subject,
            })
        })
        .collect();

    // One embed call for every resolvable statement.
    let statements: Vec<String> = inputs
        .iter()
        .filter(|i| i.subject.is_some())
        .map(|i| i.claim.statement.clone())
        .collect();
    let mut vectors = CachedEmbedder::new(storage, embedder)
        .embed(&statements, "claim_resolution")
        .await?
        .into_iter();

    let mut persisted: HashMap<String, Vec<ClaimRecord>> = HashMap::new();
    for subject in inputs.iter().filter_map(|i| i.subject.as_ref()) {
        if !persisted.contains_key(subject) {
            persisted.insert(subject.clone(), storage.claims_for_subject(subject).await?);
        }
    }

    // --- Plan ---
    let mut summary = ClaimResolutionSummary::default();
    let mut survivors: Vec<Survivor<'_>> = Vec::new();
    let mut plans: Vec<Planned> = Vec::with_capacity(inputs.len());
    let mut conflicts: Vec<(String, String, String)> = Vec::new();
    let mut conflict_counts: HashMap<String, usize> = HashMap::new();

    for input in &inputs {
        summary.claims_processed += 1;
        let Some(subject) = &input.subject else {
            debug!(claim = %input.key, "claim subject did not resolve");
            summary.unresolved_entities += 1;
            plans.push(Planned::Unresolved);
            continue;
        };
        let Some(vector) = vectors.next() else {
            return Err(docgraph_shared::DocGraphError::Bridge(
                "fewer statement embeddings than claims".into(),
            ));
        };
        let known = persisted.get(subject).map(Vec::as_slice).unwrap_or_default();

        let same_group = survivors
            .iter()
            .filter(|s| &s.subject == subject && s.group_id.is_some() && s.group_id == input.group_id);
        let rest = survivors
            .iter()
            .filter(|s| &s.subject == subject && !(s.group_id.is_some() && s.group_id == input.group_id));
        let duplicate = same_group
            .chain(rest)
            .map(|s| (s.id.as_str(), cosine_distance(&vector, &s.vector)))
            .chain(
                known
                    .iter()
                    .map(|c| (c.id.as_str(), cosine_distance(&vector, &c.embedding))),
            )
            .find(|(_, distance)| *distance < config.duplicate_threshold)
            .map(|(id, _)| id.to_string());

        if let Some(of) = duplicate {
            debug!(claim = %input.key, duplicate_of = %of, "duplicate claim skipped");
            summary.duplicates_skipped += 1;
            plans.push(Planned::Duplicate {
                of,
                subject: subject.clone(),
            });
            continue;
        }

        let id = Uuid::now_v7().to_string();
        let view = ClaimView {
            statement: &input.claim.statement,
            claim_type: &input.claim.claim_type,
        };
        let earlier = survivors.iter().filter(|s| &s.subject == subject).map(|s| {
            (
                s.id.as_str(),
                ClaimView {
                    statement: &s.claim.statement,
                    claim_type: &s.claim.claim_type,
                },
                cosine_distance(&vector, &s.vector),
            )
        });
        let stored = known.iter().map(|c| {
            (
                c.id.as_str(),
                ClaimView {
                    statement: &c.statement,
                    claim_type: &c.claim_type,
                },
                cosine_distance(&vector, &c.embedding),
            )
        });
        for (other, other_view, distance) in earlier.chain(stored) {
            if let Some(reason) = policy.conflicts(view, other_view, distance) {
                debug!(claim = %input.key, conflicting_claim = %other, %reason, "conflicting claims");
                conflicts.push((id.clone(), other.to_string(), reason));
            }
        }
        for (claim_id, other, _) in conflicts.iter().filter(|(c, _, _)| *c == id) {
            *conflict_counts.entry(claim_id.clone()).or_default() += 1;
            *conflict_counts.entry(other.clone()).or_default() += 1;
            summary.conflicts_detected += 1;
        }

        summary.claims_created += 1;
        plans.push(Planned::Create {
            survivor: survivors.len(),
        });
        survivors.push(Survivor {
            id,
            group_id: input.group_id,
            subject: subject.clone(),
            claim: input.claim,
            vector,
        });
    }

    // --- Apply ---
    let tx = storage.begin().await?;
    for (input, plan) in inputs.iter().zip(&plans) {
        if let Planned::Create { survivor } = plan {
            let s = &survivors[*survivor];
            tx.insert_claim(&NewClaim {
                id: &s.id,
                statement: &s.claim.statement,
                claim_type: &s.claim.claim_type,
                subject_entity_id: &s.subject,
                source_document_id: input.document_id,
                quote: &s.claim.source_quote,
                quote_start: s.claim.quote_start,
                quote_end: s.claim.quote_end,
                confidence: s.claim.confidence,
                embedding: &s.vector,
                run_id: &ctx.run_id,
            })
            .await?;
        }
    }
    for (claim_id, other, reason) in &conflicts {
        tx.insert_conflict(&ctx.run_id, claim_id, other, reason).await?;
    }
    for (input, plan) in inputs.iter().zip(&plans) {
        let (operation, resolved_id, subject, duplicate_of) = match plan {
            Planned::Create { survivor } => {
                let s = &survivors[*survivor];
                (TrackingOperation::Created, Some(s.id.clone()), Some(s.subject.clone()), None)
            }
            Planned::Duplicate { of, subject } => (
                TrackingOperation::Duplicate,
                Some(of.clone()),
                Some(subject.clone()),
                Some(of.clone()),
            ),
            Planned::Unresolved => (TrackingOperation::Unresolved, None, None, None),
        };
        let conflict_count = resolved_id
            .as_ref()
            .filter(|_| operation == TrackingOperation::Created)
            .and_then(|id| conflict_counts.get(id))
            .copied()
            .unwrap_or(0);
        let inserted = tx
            .upsert_claim_tracking(&ClaimTrackingRow {
                run_id: ctx.run_id.clone(),
                claim_key: input.key.clone(),
                statement: input.claim.statement.clone(),
                operation,
                resolved_id,
                subject_entity_id: subject,
                source_document_ids: vec![input.document_id.to_string()],
                duplicate_of,
                conflict_count,
            })
            .await?;
        if !inserted {
            debug!(claim = %input.key, "claim already tracked for this run, keeping earlier row");
        }
    }
    tx.commit().await?;

    info!(
        processed = summary.claims_processed,
        created = summary.claims_created,
        duplicates = summary.duplicates_skipped,
        unresolved = summary.unresolved_entities,
        conflicts = summary.conflicts_detected,
        "claim resolution complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflicts::{ClaimTypeConflictPolicy, NoConflicts};
    use crate::stages::register_builtin_stages;
    use crate::test_support::*;
    use docgraph_shared::EntityTrackingRow;
    use docgraph_storage::NewEntity;

    /// Persist an entity and map `mention` of this run to it.
    async fn seed_subject(storage: &Storage, run_id: &str, mention: &str, entity_id: &str) {
        let tx = storage.begin().await.unwrap();
        if !tx.entity_exists(entity_id).await.unwrap() {
            tx.insert_entity(&NewEntity {
                id: entity_id,
                canonical_name: entity_id,
                entity_type: "Technology",
                description: "",
                embedding: &[1.0, 0.0],
                run_id,
            })
            .await
            .unwrap();
        }
        tx.upsert_entity_tracking(&EntityTrackingRow {
            run_id: run_id.into(),
            mention_key: mention.into(),
            name: entity_id.into(),
            entity_type: "Technology".into(),
            decision: "CREATE_NEW".into(),
            operation: TrackingOperation::Created,
            resolved_id: Some(entity_id.into()),
            source_document_ids: vec!["d1".into()],
            cluster_id: Some(0),
            cluster_size: 1,
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();
    }

    fn claims_row(document_id: &str, claims: Vec<ProposedClaim>) -> ExtractionRow {
        ExtractionRow {
            claims,
            ..row(document_id, vec![entity("React", "Technology")])
        }
    }

    fn embedder() -> StubEmbedder {
        StubEmbedder::default()
            .pin("React supports hooks", vec![1.0, 0.0, 0.0])
            .pin("React has hook support", vec![0.99, 0.05, 0.0])
            .pin("React renders on the server", vec![0.0, 1.0, 0.0])
            .pin("React cannot render on the server", vec![0.0, 0.8, 0.6])
            .pin("Vue uses templates", vec![0.0, 0.0, 1.0])
    }

    fn groups_of(rows: &[ExtractionRow]) -> Vec<ClaimGroup> {
        vec![ClaimGroup {
            group_id: 0,
            members: claim_mentions(rows),
        }]
    }

    #[tokio::test]
    async fn near_identical_statements_are_duplicates() {
        let storage = test_storage().await;
        seed_subject(&storage, "run-1", "d1#s0#e0", "ent-react").await;
        let rows = vec![claims_row(
            "d1",
            vec![
                claim("React supports hooks", "capability", &[0]),
                claim("React has hook support", "capability", &[0]),
            ],
        )];

        let summary = claim_resolution(
            &RunContext::new("run-1"),
            &storage,
            &groups_of(&rows),
            &rows,
            &embedder(),
            &NoConflicts,
            &ClaimsConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(summary.claims_processed, 2);
        assert_eq!(summary.claims_created, 1);
        assert_eq!(summary.duplicates_skipped, 1);

        let persisted = storage.claims_for_subject("ent-react").await.unwrap();
        assert_eq!(persisted.len(), 1);
        let tracking = storage.claim_tracking_for_run("run-1").await.unwrap();
        assert_eq!(tracking[1].operation, TrackingOperation::Duplicate);
        assert_eq!(tracking[1].duplicate_of.as_deref(), Some(persisted[0].id.as_str()));
    }

    #[tokio::test]
    async fn unresolved_subject_is_counted_not_written() {
        let storage = test_storage().await;
        let rows = vec![claims_row(
            "d1",
            vec![
                claim("React supports hooks", "capability", &[0]),
                claim("Vue uses templates", "capability", &[]),
            ],
        )];
        let summary = claim_resolution(
            &RunContext::new("run-1"),
            &storage,
            &[],
            &rows,
            &embedder(),
            &NoConflicts,
            &ClaimsConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(summary.unresolved_entities, 2);
        assert_eq!(
            summary.claims_processed,
            summary.claims_created + summary.duplicates_skipped + summary.unresolved_entities
        );
        assert_eq!(storage.graph_stats().await.unwrap().claims, 0);
        let tracking = storage.claim_tracking_for_run("run-1").await.unwrap();
        assert!(tracking.iter().all(|t| t.operation == TrackingOperation::Unresolved));
    }

    #[tokio::test]
    async fn contradicting_claims_both_persist() {
        let storage = test_storage().await;
        seed_subject(&storage, "run-1", "d1#s0#e0", "ent-react").await;
        let rows = vec![claims_row(
            "d1",
            vec![
                claim("React renders on the server", "capability", &[0]),
                claim("React cannot render on the server", "capability", &[0]),
            ],
        )];
        let summary = claim_resolution(
            &RunContext::new("run-1"),
            &storage,
            &groups_of(&rows),
            &rows,
            &embedder(),
            &ClaimTypeConflictPolicy::default(),
            &ClaimsConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(summary.claims_created, 2);
        assert_eq!(summary.conflicts_detected, 1);

        let conflicts = storage.conflicts_for_run("run-1").await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert!(conflicts[0].2.contains("negated"));
        let tracking = storage.claim_tracking_for_run("run-1").await.unwrap();
        assert!(tracking.iter().all(|t| t.conflict_count == 1));
    }

    #[tokio::test]
    async fn persisted_claims_catch_duplicates_on_later_runs() {
        let storage = test_storage().await;
        let rows = vec![claims_row("d1", vec![claim("React supports hooks", "capability", &[0])])];
        for run in ["run-1", "run-2"] {
            seed_subject(&storage, run, "d1#s0#e0", "ent-react").await;
            claim_resolution(
                &RunContext::new(run),
                &storage,
                &groups_of(&rows),
                &rows,
                &embedder(),
                &NoConflicts,
                &ClaimsConfig::default(),
            )
            .await
            .unwrap();
        }
        assert_eq!(storage.claims_for_subject("ent-react").await.unwrap().len(), 1);
        let second = storage.claim_tracking_for_run("run-2").await.unwrap();
        assert_eq!(second[0].operation, TrackingOperation::Duplicate);
    }

    #[tokio::test]
    async fn subjects_separate_duplicates() {
        let storage = test_storage().await;
        seed_subject(&storage, "run-1", "d1#s0#e0", "ent-react").await;
        seed_subject(&storage, "run-1", "d2#s0#e0", "ent-preact").await;
        let rows = vec![
            claims_row("d1", vec![claim("React supports hooks", "capability", &[0])]),
            claims_row("d2", vec![claim("React supports hooks", "capability", &[0])]),
        ];
        let summary = claim_resolution(
            &RunContext::new("run-1"),
            &storage,
            &groups_of(&rows),
            &rows,
            &embedder(),
            &NoConflicts,
            &ClaimsConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(summary.claims_created, 2);
        assert_eq!(summary.duplicates_skipped, 0);
    }

    #[tokio::test]
    async fn embedding_failure_leaves_nothing_behind() {
        let storage = test_storage().await;
        seed_subject(&storage, "run-1", "d1#s0#e0", "ent-react").await;
        let rows = vec![claims_row("d1", vec![claim("React supports hooks", "capability", &[0])])];
        let result = claim_resolution(
            &RunContext::new("run-1"),
            &storage,
            &groups_of(&rows),
            &rows,
            &StubEmbedder::failing(),
            &NoConflicts,
            &ClaimsConfig::default(),
        )
        .await;
        assert!(result.is_err());
        let stats = storage.graph_stats().await.unwrap();
        assert_eq!(stats.claims, 0);
        assert_eq!(stats.claim_tracking_rows, 0);
        assert_eq!(stats.entities, 1, "entity resolution results are untouched");
    }

    #[tokio::test]
    async fn clustering_groups_related_statements() {
        let storage = test_storage().await;
        let registry = TableRegistry::with_graph_tables().unwrap();
        register_builtin_stages(&registry).unwrap();
        let ctx = RunContext::new("run-1");
        let rows = vec![claims_row(
            "d1",
            vec![
                claim("React supports hooks", "capability", &[0]),
                claim("Vue uses templates", "capability", &[0]),
                claim("React has hook support", "capability", &[0]),
            ],
        )];

        let summary = claim_clustering(&ctx, &storage, &registry, &rows, &embedder(), &ClaimsConfig::default())
            .await
            .unwrap();
        assert_eq!(summary.rows_written, 3);

        let groups = load_claim_groups(&ctx, &storage, &registry).await.unwrap();
        assert_eq!(groups.len(), 2);
        let first: Vec<usize> = groups[0].members.iter().map(|m| m.index).collect();
        assert_eq!(first, vec![0, 2]);
    }

    #[tokio::test]
    async fn clustering_without_claims_writes_nothing() {
        let storage = test_storage().await;
        let registry = TableRegistry::with_graph_tables().unwrap();
        register_builtin_stages(&registry).unwrap();
        let embedder = embedder();
        let summary = claim_clustering(
            &RunContext::new("run-1"),
            &storage,
            &registry,
            &[row("d1", vec![entity("React", "Technology")])],
            &embedder,
            &ClaimsConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(summary.rows_written, 0);
        assert_eq!(embedder.calls(), 0);
    }
}
