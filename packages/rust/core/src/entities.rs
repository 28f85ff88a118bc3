//! Entity clustering and entity resolution stages.
//!
//! Clustering groups the run's NEW mentions by name embedding and writes one
//! `entity_clusters` row per mention. Resolution asks the decision model
//! about each cluster, walks merge chains across all decisions, and applies
//! the outcome to the graph in a single transaction.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use docgraph_shared::{
    ClusteringConfig, EntityCluster, EntityDecision, EntityMention, EntityRecord,
    EntityTrackingRow, ExtractionRow, ResolutionStatus, Result, RunContext, SimilarEntity,
    TrackingOperation, WriteSummary, mention_key,
};
use docgraph_storage::{
    GraphTx, NewEntity, NewRelationship, Storage, TableReader, TableRegistry, TableWriter, to_row,
};

use crate::bridge::{CachedEmbedder, Embedder, ResolutionDecider};
use crate::clustering::{ClusterParams, cluster_mentions, cosine_distance};
use crate::merge_chain::{ChainNode, Decision, MergeChains, Terminal};
use crate::stages::{ENTITY_CLUSTERS, run_scoped};

/// Counts reported by [`entity_resolution`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityResolutionSummary {
    /// Tracking rows written, one per input mention.
    pub rows_written: usize,
    pub entities_created: usize,
    pub mentions_merged: usize,
    pub mentions_linked: usize,
    pub unresolved: usize,
    /// Clusters whose decision call failed.
    pub clusters_failed: usize,
    pub relationships_created: usize,
    /// Stub entities of an earlier failed attempt of this run.
    pub orphans_removed: u64,
}

// ---------------------------------------------------------------------------
// Clustering
// ---------------------------------------------------------------------------

/// Stored shape of one `entity_clusters` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClusterRow {
    run_id: String,
    mention_key: String,
    cluster_id: i64,
    cluster_size: i64,
    document_id: String,
    section_id: String,
    entity_index: i64,
    name: String,
    entity_type: String,
    description: String,
    aliases_json: String,
    confidence: f64,
}

impl ClusterRow {
    fn new(run_id: &str, cluster: &EntityCluster, mention: &EntityMention) -> Self {
        Self {
            run_id: run_id.to_string(),
            mention_key: mention.key.clone(),
            cluster_id: cluster.cluster_id,
            cluster_size: cluster.size() as i64,
            document_id: mention.document_id.clone(),
            section_id: mention.section_id.clone(),
            entity_index: mention.index as i64,
            name: mention.name.clone(),
            entity_type: mention.entity_type.clone(),
            description: mention.description.clone(),
            aliases_json: serde_json::to_string(&mention.aliases).unwrap_or_else(|_| "[]".into()),
            confidence: f64::from(mention.confidence),
        }
    }

    fn into_mention(self) -> EntityMention {
        EntityMention {
            aliases: serde_json::from_str(&self.aliases_json).unwrap_or_default(),
            key: self.mention_key,
            document_id: self.document_id,
            section_id: self.section_id,
            index: self.entity_index.max(0) as usize,
            name: self.name,
            entity_type: self.entity_type,
            description: self.description,
            confidence: self.confidence as f32,
        }
    }
}

/// Mentions that need clustering: NEW ones, plus EXISTING ones whose
/// context index does not point at a persisted entity.
pub fn clusterable_mentions(rows: &[ExtractionRow]) -> Vec<EntityMention> {
    let mut mentions = Vec::new();
    for row in rows {
        for mention in row.mentions() {
            let entity = &row.entities[mention.index];
            if row.existing_match(mention.index).is_some() {
                continue;
            }
            if entity.resolution_status == ResolutionStatus::Existing {
                warn!(
                    mention = %mention.key,
                    index = ?entity.matched_entity_index,
                    "EXISTING mention has no valid context entry, treating as NEW"
                );
            }
            mentions.push(mention);
        }
    }
    mentions
}

/// Cluster the run's mentions and write them to `entity_clusters`.
#[instrument(skip_all, fields(run_id = %ctx.run_id, rows = rows.len()))]
pub async fn entity_clustering(
    ctx: &RunContext,
    storage: &Storage,
    registry: &TableRegistry,
    rows: &[ExtractionRow],
    embedder: &dyn Embedder,
    params: ClusterParams,
) -> Result<WriteSummary> {
    let writer = TableWriter::new(storage, registry, ENTITY_CLUSTERS).await?;
    let mentions = clusterable_mentions(rows);
    let mention_count = mentions.len();
    let clusters = cluster_mentions(storage, embedder, mentions, params).await?;

    let out = clusters
        .iter()
        .flat_map(|c| c.members.iter().map(|m| ClusterRow::new(&ctx.run_id, c, m)))
        .map(|row| to_row(&row))
        .collect::<Result<Vec<_>>>()?;
    let summary = writer.write(&out).await?;

    info!(
        mentions = mention_count,
        clusters = clusters.len(),
        rows_written = summary.rows_written,
        "entity clustering complete"
    );
    Ok(summary)
}

/// This run's clusters, read back from `entity_clusters`, ordered by cluster id.
pub async fn load_entity_clusters(
    ctx: &RunContext,
    storage: &Storage,
    registry: &TableRegistry,
) -> Result<Vec<EntityCluster>> {
    let bound = run_scoped(ENTITY_CLUSTERS).bind(TableReader::new(storage, registry, ENTITY_CLUSTERS)?, ctx)?;
    let rows: Vec<ClusterRow> = bound.rows_as().await?;

    let mut grouped: BTreeMap<i64, Vec<EntityMention>> = BTreeMap::new();
    for row in rows {
        grouped.entry(row.cluster_id).or_default().push(row.into_mention());
    }
    Ok(grouped
        .into_iter()
        .map(|(cluster_id, members)| EntityCluster { cluster_id, members })
        .collect())
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// One clustered mention with the decision made for it.
struct Decided<'c> {
    mention: &'c EntityMention,
    cluster_id: i64,
    cluster_size: usize,
    raw_decision: String,
    canonical_name: String,
    aliases: Vec<String>,
}

/// Final outcome for one mention.
#[derive(Debug, Clone)]
struct Outcome {
    name: String,
    entity_type: String,
    document_id: String,
    decision: String,
    operation: TrackingOperation,
    resolved_id: Option<String>,
    cluster_id: Option<i64>,
    cluster_size: usize,
}

/// Persisted entities closest to any member of `cluster`.
fn similar_existing(
    member_vectors: &[&Vec<f32>],
    persisted: &[EntityRecord],
    config: &ClusteringConfig,
) -> Vec<SimilarEntity> {
    let mut candidates: Vec<SimilarEntity> = persisted
        .iter()
        .filter(|e| !e.embedding.is_empty())
        .filter_map(|entity| {
            let distance = member_vectors
                .iter()
                .map(|v| cosine_distance(v, &entity.embedding))
                .fold(f32::INFINITY, f32::min);
            (distance <= config.similar_existing_max_distance).then(|| SimilarEntity {
                id: entity.id.clone(),
                name: entity.canonical_name.clone(),
                entity_type: entity.entity_type.clone(),
                description: entity.description.clone(),
                distance,
            })
        })
        .collect();
    candidates.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    candidates.truncate(config.similar_existing_limit);
    candidates
}

/// Pair each member with the decision returned for its name.
fn match_decisions<'c>(cluster: &'c EntityCluster, decisions: &[EntityDecision]) -> Vec<Decided<'c>> {
    cluster
        .members
        .iter()
        .map(|mention| {
            let decision = decisions
                .iter()
                .find(|d| d.entity_name.trim().eq_ignore_ascii_case(mention.name.trim()));
            match decision {
                Some(d) => Decided {
                    mention,
                    cluster_id: cluster.cluster_id,
                    cluster_size: cluster.size(),
                    raw_decision: d.decision.clone(),
                    canonical_name: if d.canonical_name.trim().is_empty() {
                        mention.name.clone()
                    } else {
                        d.canonical_name.trim().to_string()
                    },
                    aliases: d.aliases.clone(),
                },
                None => undecided(cluster, mention),
            }
        })
        .collect()
}

fn undecided<'c>(cluster: &EntityCluster, mention: &'c EntityMention) -> Decided<'c> {
    Decided {
        mention,
        cluster_id: cluster.cluster_id,
        cluster_size: cluster.size(),
        raw_decision: String::new(),
        canonical_name: mention.name.clone(),
        aliases: Vec::new(),
    }
}

/// Resolve this run's clusters against the graph.
///
/// Decision calls run per cluster; a failing call leaves that cluster's
/// mentions unresolved. A cyclic merge chain aborts before anything is
/// written. All graph mutations happen in one transaction that is rolled
/// back on any error.
#[instrument(skip_all, fields(run_id = %ctx.run_id, clusters = clusters.len()))]
pub async fn entity_resolution(
    ctx: &RunContext,
    storage: &Storage,
    clusters: &[EntityCluster],
    rows: &[ExtractionRow],
    embedder: &dyn Embedder,
    decider: &dyn ResolutionDecider,
    config: &ClusteringConfig,
) -> Result<EntityResolutionSummary> {
    let mut summary = EntityResolutionSummary::default();
    let cached = CachedEmbedder::new(storage, embedder);

    // --- Similar existing candidates ---
    let persisted = storage.list_entities().await?;
    let member_names: Vec<String> = clusters
        .iter()
        .flat_map(|c| c.members.iter().map(|m| m.name.clone()))
        .collect();
    let member_vectors = if persisted.is_empty() || member_names.is_empty() {
        Vec::new()
    } else {
        cached.embed(&member_names, "entity_resolution").await?
    };

    // --- One decision call per cluster ---
    let mut decided: Vec<Decided<'_>> = Vec::new();
    let mut offset = 0;
    for cluster in clusters {
        let vectors: Vec<&Vec<f32>> = member_vectors
            .iter()
            .skip(offset)
            .take(cluster.size())
            .collect();
        offset += cluster.size();
        let similar = similar_existing(&vectors, &persisted, config);

        match decider.decide(cluster, &similar) {
            Ok(decisions) => {
                debug!(
                    cluster_id = cluster.cluster_id,
                    size = cluster.size(),
                    candidates = similar.len(),
                    decisions = decisions.len(),
                    "cluster decided"
                );
                decided.extend(match_decisions(cluster, &decisions));
            }
            Err(e) => {
                warn!(cluster_id = cluster.cluster_id, error = %e, "decision call failed, cluster left unresolved");
                summary.clusters_failed += 1;
                decided.extend(cluster.members.iter().map(|m| undecided(cluster, m)));
            }
        }
    }

    // --- Merge chains (a cycle aborts the stage) ---
    let nodes: Vec<ChainNode> = decided
        .iter()
        .map(|d| ChainNode {
            cluster_id: d.cluster_id,
            entity_name: d.mention.name.clone(),
            canonical_name: d.canonical_name.clone(),
            decision: Decision::parse(&d.raw_decision),
        })
        .collect();
    let terminals = MergeChains::new(&nodes).resolve()?;

    // Embeddings for entities that may be created; fetched before the
    // transaction takes the write lock.
    let roots: Vec<usize> = terminals
        .iter()
        .enumerate()
        .filter_map(|(i, t)| matches!(t, Terminal::Create(root) if *root == i).then_some(i))
        .collect();
    let root_names: Vec<String> = roots.iter().map(|&i| decided[i].canonical_name.clone()).collect();
    let root_vectors = if root_names.is_empty() {
        Vec::new()
    } else {
        cached.embed(&root_names, "entity_resolution").await?
    };

    // --- Apply ---
    let tx = storage.begin().await?;
    summary.orphans_removed = tx.delete_orphan_entities(&ctx.run_id).await?;

    let mut root_ids: HashMap<usize, (String, TrackingOperation)> = HashMap::new();
    let mut created_this_run: HashMap<(String, String), String> = HashMap::new();
    for (&root, vector) in roots.iter().zip(&root_vectors) {
        let d = &decided[root];
        let key = (d.canonical_name.to_lowercase(), d.mention.entity_type.clone());
        let resolved = if let Some(id) = created_this_run.get(&key) {
            (id.clone(), TrackingOperation::Merged)
        } else if let Some(id) = tx
            .find_entity_by_name(&d.canonical_name, &d.mention.entity_type)
            .await?
        {
            (id, TrackingOperation::Linked)
        } else {
            let id = Uuid::now_v7().to_string();
            tx.insert_entity(&NewEntity {
                id: &id,
                canonical_name: &d.canonical_name,
                entity_type: &d.mention.entity_type,
                description: &d.mention.description,
                embedding: vector,
                run_id: &ctx.run_id,
            })
            .await?;
            summary.entities_created += 1;
            created_this_run.insert(key, id.clone());
            (id, TrackingOperation::Created)
        };
        root_ids.insert(root, resolved);
    }

    let mut link_exists: HashMap<String, bool> = HashMap::new();
    let mut outcomes: HashMap<String, Outcome> = HashMap::new();
    for (i, (d, terminal)) in decided.iter().zip(&terminals).enumerate() {
        let merged = nodes[i].decision.is_merge();
        let (operation, resolved_id) = match terminal {
            Terminal::Create(root) => match root_ids.get(root) {
                Some((id, op)) if *root == i => (*op, Some(id.clone())),
                Some((id, _)) => (TrackingOperation::Merged, Some(id.clone())),
                None => (TrackingOperation::Unresolved, None),
            },
            Terminal::Link(id) => {
                let exists = match link_exists.get(id) {
                    Some(known) => *known,
                    None => {
                        let found = tx.entity_exists(id).await?;
                        link_exists.insert(id.clone(), found);
                        found
                    }
                };
                if !exists {
                    warn!(mention = %d.mention.key, %id, "decision links to an unknown entity");
                    (TrackingOperation::Unresolved, None)
                } else if merged {
                    (TrackingOperation::Merged, Some(id.clone()))
                } else {
                    (TrackingOperation::Linked, Some(id.clone()))
                }
            }
            Terminal::Unresolved(reason) => {
                debug!(mention = %d.mention.key, %reason, "mention unresolved");
                (TrackingOperation::Unresolved, None)
            }
        };

        if let Some(id) = &resolved_id {
            record_aliases(&tx, id, &d.canonical_name, &d.mention.name, d.mention.aliases.iter().chain(&d.aliases)).await?;
        }

        outcomes.insert(
            d.mention.key.clone(),
            Outcome {
                name: d.mention.name.clone(),
                entity_type: d.mention.entity_type.clone(),
                document_id: d.mention.document_id.clone(),
                decision: d.raw_decision.clone(),
                operation,
                resolved_id,
                cluster_id: Some(d.cluster_id),
                cluster_size: d.cluster_size,
            },
        );
    }

    // EXISTING mentions with a valid context entry link directly.
    for row in rows {
        for mention in row.mentions() {
            let Some(target) = row.existing_match(mention.index) else {
                continue;
            };
            let exists = match link_exists.get(&target.id) {
                Some(known) => *known,
                None => {
                    let found = tx.entity_exists(&target.id).await?;
                    link_exists.insert(target.id.clone(), found);
                    found
                }
            };
            let (operation, resolved_id) = if exists {
                record_aliases(&tx, &target.id, &target.name, &mention.name, mention.aliases.iter()).await?;
                (TrackingOperation::Linked, Some(target.id.clone()))
            } else {
                warn!(mention = %mention.key, id = %target.id, "EXISTING mention points at an unknown entity");
                (TrackingOperation::Unresolved, None)
            };
            outcomes.insert(
                mention.key.clone(),
                Outcome {
                    name: mention.name,
                    entity_type: mention.entity_type,
                    document_id: mention.document_id,
                    decision: target.id.clone(),
                    operation,
                    resolved_id,
                    cluster_id: None,
                    cluster_size: 0,
                },
            );
        }
    }

    // --- Relationships between resolved endpoints ---
    for row in rows {
        for rel in &row.relationships {
            let source = outcomes
                .get(&mention_key(&row.document_id, &row.section_id, rel.source_index))
                .and_then(|o| o.resolved_id.as_deref());
            let target = outcomes
                .get(&mention_key(&row.document_id, &row.section_id, rel.target_index))
                .and_then(|o| o.resolved_id.as_deref());
            let (Some(source), Some(target)) = (source, target) else {
                debug!(document = %row.document_id, kind = %rel.relationship_type, "relationship endpoint unresolved, skipped");
                continue;
            };
            if source == target {
                continue;
            }
            let id = Uuid::now_v7().to_string();
            let inserted = tx
                .insert_relationship(&NewRelationship {
                    id: &id,
                    source_entity_id: source,
                    target_entity_id: target,
                    relationship_type: &rel.relationship_type,
                    description: &rel.description,
                    confidence: rel.confidence,
                    document_id: &row.document_id,
                    run_id: &ctx.run_id,
                })
                .await?;
            if inserted {
                summary.relationships_created += 1;
            }
        }
    }

    // --- Tracking: one row per input mention ---
    let mut documents_by_entity: HashMap<&str, BTreeSet<&str>> = HashMap::new();
    for outcome in outcomes.values() {
        if let Some(id) = &outcome.resolved_id {
            documents_by_entity
                .entry(id.as_str())
                .or_default()
                .insert(outcome.document_id.as_str());
        }
    }

    let mut keys: Vec<String> = rows
        .iter()
        .flat_map(|row| row.mentions().into_iter().map(|m| m.key))
        .collect();
    let listed: BTreeSet<String> = keys.iter().cloned().collect();
    let mut extra: Vec<String> = outcomes.keys().filter(|k| !listed.contains(*k)).cloned().collect();
    extra.sort();
    keys.extend(extra);

    let names_by_key: HashMap<String, EntityMention> = rows
        .iter()
        .flat_map(|row| row.mentions())
        .map(|m| (m.key.clone(), m))
        .collect();

    for key in &keys {
        let outcome = match outcomes.get(key) {
            Some(outcome) => outcome.clone(),
            None => {
                // In the extraction rows but in no cluster of this run.
                let Some(mention) = names_by_key.get(key) else {
                    continue;
                };
                Outcome {
                    name: mention.name.clone(),
                    entity_type: mention.entity_type.clone(),
                    document_id: mention.document_id.clone(),
                    decision: String::new(),
                    operation: TrackingOperation::Unresolved,
                    resolved_id: None,
                    cluster_id: None,
                    cluster_size: 0,
                }
            }
        };

        match outcome.operation {
            TrackingOperation::Merged => summary.mentions_merged += 1,
            TrackingOperation::Linked => summary.mentions_linked += 1,
            TrackingOperation::Unresolved => summary.unresolved += 1,
            TrackingOperation::Created | TrackingOperation::Duplicate => {}
        }

        let source_document_ids = match &outcome.resolved_id {
            Some(id) => documents_by_entity
                .get(id.as_str())
                .map(|docs| docs.iter().map(|d| d.to_string()).collect())
                .unwrap_or_else(|| vec![outcome.document_id.clone()]),
            None => vec![outcome.document_id.clone()],
        };

        let inserted = tx
            .upsert_entity_tracking(&EntityTrackingRow {
                run_id: ctx.run_id.clone(),
                mention_key: key.clone(),
                name: outcome.name,
                entity_type: outcome.entity_type,
                decision: outcome.decision,
                operation: outcome.operation,
                resolved_id: outcome.resolved_id,
                source_document_ids,
                cluster_id: outcome.cluster_id,
                cluster_size: outcome.cluster_size,
            })
            .await?;
        if inserted {
            summary.rows_written += 1;
        }
    }

    tx.commit().await?;

    info!(
        entities_created = summary.entities_created,
        merged = summary.mentions_merged,
        linked = summary.mentions_linked,
        unresolved = summary.unresolved,
        clusters_failed = summary.clusters_failed,
        relationships = summary.relationships_created,
        orphans_removed = summary.orphans_removed,
        "entity resolution complete"
    );
    Ok(summary)
}

/// Record the mention's surface forms as aliases of the entity.
async fn record_aliases<'a>(
    tx: &GraphTx<'_>,
    entity_id: &str,
    canonical_name: &str,
    mention_name: &'a str,
    aliases: impl Iterator<Item = &'a String>,
) -> Result<()> {
    let mut seen: BTreeSet<String> = BTreeSet::new();
    for alias in std::iter::once(mention_name).chain(aliases.map(String::as_str)) {
        let alias = alias.trim();
        if alias.is_empty() || alias.eq_ignore_ascii_case(canonical_name) {
            continue;
        }
        if seen.insert(alias.to_lowercase()) {
            tx.insert_entity_alias(entity_id, alias).await?;
        }
    }
    Ok(())
}
