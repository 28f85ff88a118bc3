//! Density-based clustering over embedding distance.

use docgraph_shared::{ClusteringConfig, EntityCluster, EntityMention, Result};
use docgraph_storage::Storage;
use tracing::debug;

use crate::bridge::{CachedEmbedder, Embedder};

/// DBSCAN parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterParams {
    /// Maximum cosine distance between neighbours.
    pub eps: f32,
    /// Neighbours (self included) a point needs to be a core point.
    pub min_samples: usize,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            eps: 0.25,
            min_samples: 1,
        }
    }
}

impl From<&ClusteringConfig> for ClusterParams {
    fn from(config: &ClusteringConfig) -> Self {
        Self {
            eps: config.eps,
            min_samples: config.min_samples,
        }
    }
}

/// Cosine distance in `[0, 2]`. A zero vector is at distance 1 from everything.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    (1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 2.0)
}

/// DBSCAN labels: `Some(cluster)` or `None` for noise.
///
/// Noise only occurs when `min_samples > 1`.
pub fn dbscan(vectors: &[Vec<f32>], eps: f32, min_samples: usize) -> Vec<Option<usize>> {
    let n = vectors.len();
    let neighbours: Vec<Vec<usize>> = (0..n)
        .map(|i| {
            (0..n)
                .filter(|&j| cosine_distance(&vectors[i], &vectors[j]) <= eps)
                .collect()
        })
        .collect();
    let is_core = |i: usize| neighbours[i].len() >= min_samples.max(1);

    let mut labels: Vec<Option<usize>> = vec![None; n];
    let mut visited = vec![false; n];
    let mut next_label = 0;

    for start in 0..n {
        if visited[start] {
            continue;
        }
        visited[start] = true;
        if !is_core(start) {
            continue;
        }

        let label = next_label;
        next_label += 1;
        labels[start] = Some(label);

        let mut frontier: Vec<usize> = neighbours[start].clone();
        while let Some(point) = frontier.pop() {
            if labels[point].is_none() {
                labels[point] = Some(label);
            }
            if visited[point] {
                continue;
            }
            visited[point] = true;
            if is_core(point) {
                frontier.extend(neighbours[point].iter().copied().filter(|&q| !visited[q]));
            }
        }
    }
    labels
}

/// Group indices by DBSCAN label. Noise points become singleton groups,
/// so every input index lands in exactly one group.
///
/// Groups are ordered by their first member.
pub fn cluster_indices(vectors: &[Vec<f32>], params: ClusterParams) -> Vec<Vec<usize>> {
    let labels = dbscan(vectors, params.eps, params.min_samples);
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut slot_of_label: std::collections::HashMap<usize, usize> =
        std::collections::HashMap::new();

    for (index, label) in labels.into_iter().enumerate() {
        match label {
            Some(label) => {
                let slot = *slot_of_label.entry(label).or_insert_with(|| {
                    groups.push(Vec::new());
                    groups.len() - 1
                });
                groups[slot].push(index);
            }
            None => groups.push(vec![index]),
        }
    }
    groups
}

/// Cluster mentions by the embedding of their names.
///
/// One embed call per pass. Identical names get no special treatment; they
/// land together because their embeddings coincide.
pub async fn cluster_mentions(
    storage: &Storage,
    embedder: &dyn Embedder,
    mentions: Vec<EntityMention>,
    params: ClusterParams,
) -> Result<Vec<EntityCluster>> {
    if mentions.is_empty() {
        return Ok(Vec::new());
    }

    let names: Vec<String> = mentions.iter().map(|m| m.name.clone()).collect();
    let vectors = CachedEmbedder::new(storage, embedder)
        .embed(&names, "entity_clustering")
        .await?;

    let mut slots: Vec<Option<EntityMention>> = mentions.into_iter().map(Some).collect();
    let clusters: Vec<EntityCluster> = cluster_indices(&vectors, params)
        .into_iter()
        .enumerate()
        .map(|(cluster_id, members)| EntityCluster {
            cluster_id: cluster_id as i64,
            members: members.into_iter().filter_map(|i| slots[i].take()).collect(),
        })
        .collect();

    debug!(
        mentions = names.len(),
        clusters = clusters.len(),
        eps = params.eps,
        min_samples = params.min_samples,
        "clustered mentions"
    );
    Ok(clusters)
}
