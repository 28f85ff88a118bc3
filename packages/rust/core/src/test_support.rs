//! Test doubles for the external model calls, plus fixtures.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use docgraph_shared::{
    DocGraphError, EntityCluster, EntityDecision, EntityMention, ExtractionRow, ProposedClaim,
    ProposedEntity, ProposedRelationship, ResolutionStatus, Result, SimilarEntity,
};
use docgraph_storage::Storage;
use uuid::Uuid;

use crate::bridge::{Embedder, ResolutionDecider};

const DIMENSIONS: usize = 1021;

/// Temp-file storage, fresh per test.
pub(crate) async fn test_storage() -> Storage {
    let tmp = std::env::temp_dir().join(format!("dg_core_test_{}.db", Uuid::now_v7()));
    Storage::open(&tmp).await.expect("open test db")
}

/// Deterministic embedder: character-bigram counts of the lower-cased
/// text, hashed into a fixed number of buckets. Explicit vectors can be
/// pinned per text.
#[derive(Default)]
pub(crate) struct StubEmbedder {
    pinned: HashMap<String, Vec<f32>>,
    calls: AtomicUsize,
    texts: AtomicUsize,
    fail: bool,
}

impl StubEmbedder {
    pub(crate) fn pin(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.pinned.insert(text.to_string(), vector);
        self
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn texts_embedded(&self) -> usize {
        self.texts.load(Ordering::SeqCst)
    }

    fn bigrams(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; DIMENSIONS];
        let bytes: Vec<u8> = text.to_lowercase().into_bytes();
        for pair in bytes.windows(2) {
            let bucket = (pair[0] as usize * 31 + pair[1] as usize) % DIMENSIONS;
            vector[bucket] += 1.0;
        }
        vector
    }
}

impl Embedder for StubEmbedder {
    fn model(&self) -> &str {
        "stub-embed"
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(DocGraphError::Bridge("embedding service unavailable".into()));
        }
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|t| {
                self.pinned
                    .get(t)
                    .cloned()
                    .unwrap_or_else(|| Self::bigrams(t))
            })
            .collect())
    }
}

/// Decider answering from a fixed name → (canonical name, decision) table.
///
/// Mentions without an entry get `CREATE_NEW` under their own name.
/// Clusters containing a name listed in `fail_on` make the call fail.
#[derive(Default)]
pub(crate) struct StubDecider {
    decisions: HashMap<String, (String, String)>,
    aliases: HashMap<String, Vec<String>>,
    fail_on: Vec<String>,
    calls: AtomicUsize,
    seen_similar: Mutex<Vec<Vec<SimilarEntity>>>,
}

impl StubDecider {
    pub(crate) fn decide_as(mut self, name: &str, canonical: &str, decision: &str) -> Self {
        self.decisions
            .insert(name.to_string(), (canonical.to_string(), decision.to_string()));
        self
    }

    pub(crate) fn with_aliases(mut self, name: &str, aliases: &[&str]) -> Self {
        self.aliases
            .insert(name.to_string(), aliases.iter().map(|a| a.to_string()).collect());
        self
    }

    pub(crate) fn fail_on(mut self, name: &str) -> Self {
        self.fail_on.push(name.to_string());
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Candidate lists passed to each call, in call order.
    pub(crate) fn seen_similar(&self) -> Vec<Vec<SimilarEntity>> {
        self.seen_similar.lock().unwrap().clone()
    }
}

impl ResolutionDecider for StubDecider {
    fn decide(
        &self,
        cluster: &EntityCluster,
        similar_existing: &[SimilarEntity],
    ) -> Result<Vec<EntityDecision>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_similar.lock().unwrap().push(similar_existing.to_vec());
        if cluster.members.iter().any(|m| self.fail_on.contains(&m.name)) {
            return Err(DocGraphError::Bridge("decision model timed out".into()));
        }
        Ok(cluster
            .members
            .iter()
            .map(|m| {
                let (canonical, decision) = self
                    .decisions
                    .get(&m.name)
                    .cloned()
                    .unwrap_or_else(|| (m.name.clone(), "CREATE_NEW".to_string()));
                EntityDecision {
                    entity_name: m.name.clone(),
                    canonical_name: canonical,
                    decision,
                    aliases: self.aliases.get(&m.name).cloned().unwrap_or_default(),
                    reasoning: String::new(),
                }
            })
            .collect())
    }
}

pub(crate) fn mention(document_id: &str, index: usize, name: &str, entity_type: &str) -> EntityMention {
    EntityMention {
        key: docgraph_shared::mention_key(document_id, "s0", index),
        document_id: document_id.into(),
        section_id: "s0".into(),
        index,
        name: name.into(),
        entity_type: entity_type.into(),
        description: String::new(),
        aliases: Vec::new(),
        confidence: 0.9,
    }
}

pub(crate) fn entity(name: &str, entity_type: &str) -> ProposedEntity {
    ProposedEntity {
        name: name.into(),
        entity_type: entity_type.into(),
        description: format!("{name} description"),
        aliases: Vec::new(),
        confidence: 0.9,
        resolution_status: ResolutionStatus::New,
        matched_entity_index: None,
    }
}

pub(crate) fn existing(name: &str, entity_type: &str, context_index: usize) -> ProposedEntity {
    ProposedEntity {
        resolution_status: ResolutionStatus::Existing,
        matched_entity_index: Some(context_index),
        ..entity(name, entity_type)
    }
}

pub(crate) fn relationship(source: usize, target: usize, kind: &str) -> ProposedRelationship {
    ProposedRelationship {
        source_index: source,
        target_index: target,
        relationship_type: kind.into(),
        description: String::new(),
        confidence: 0.8,
    }
}

pub(crate) fn claim(statement: &str, claim_type: &str, entity_indices: &[usize]) -> ProposedClaim {
    ProposedClaim {
        statement: statement.into(),
        claim_type: claim_type.into(),
        entity_indices: entity_indices.to_vec(),
        source_quote: statement.into(),
        quote_start: Some(0),
        quote_end: Some(statement.len()),
        confidence: 0.9,
    }
}

pub(crate) fn row(document_id: &str, entities: Vec<ProposedEntity>) -> ExtractionRow {
    ExtractionRow {
        document_id: document_id.into(),
        section_id: "s0".into(),
        entities,
        relationships: Vec::new(),
        claims: Vec::new(),
        existing_entities_context: Vec::new(),
    }
}
