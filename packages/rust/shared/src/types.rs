//! Core domain types for the DocGraph knowledge graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

/// A crawled document. Owned by ingestion; the engine only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    /// Source locator (URL or file path).
    pub source_url: String,
    /// Fetch status.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<i64>,
    /// Pointer to the stored content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_path: Option<String>,
    /// Inline content, only present when a reference asked for it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

// ---------------------------------------------------------------------------
// Extraction input
// ---------------------------------------------------------------------------

/// Whether the extractor believed a mention was already in the graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStatus {
    #[default]
    New,
    Existing,
}

/// One entity proposed by the extraction model for a section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedEntity {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default)]
    pub resolution_status: ResolutionStatus,
    /// Index into the row's `existing_entities_context` for EXISTING mentions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_entity_index: Option<usize>,
}

/// A relationship between two entities of the same section, by entity index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedRelationship {
    pub source_index: usize,
    pub target_index: usize,
    pub relationship_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
}

/// One factual claim proposed by the extraction model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedClaim {
    pub statement: String,
    pub claim_type: String,
    /// Indices into the row's entities; the first is the subject.
    #[serde(default)]
    pub entity_indices: Vec<usize>,
    #[serde(default)]
    pub source_quote: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_start: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_end: Option<usize>,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
}

/// A persisted entity shown to the extractor as context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExistingEntityRef {
    pub index: usize,
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
}

/// Extraction output for one document section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRow {
    pub document_id: String,
    pub section_id: String,
    #[serde(default)]
    pub entities: Vec<ProposedEntity>,
    #[serde(default)]
    pub relationships: Vec<ProposedRelationship>,
    #[serde(default)]
    pub claims: Vec<ProposedClaim>,
    #[serde(default)]
    pub existing_entities_context: Vec<ExistingEntityRef>,
}

fn default_confidence() -> f32 {
    1.0
}

/// Stable key of the `index`-th entity of a section.
pub fn mention_key(document_id: &str, section_id: &str, index: usize) -> String {
    format!("{document_id}#{section_id}#e{index}")
}

/// Stable key of the `index`-th claim of a section.
pub fn claim_key(document_id: &str, section_id: &str, index: usize) -> String {
    format!("{document_id}#{section_id}#c{index}")
}

impl ExtractionRow {
    /// Flatten this row's entities into mentions.
    pub fn mentions(&self) -> Vec<EntityMention> {
        self.entities
            .iter()
            .enumerate()
            .map(|(index, entity)| EntityMention {
                key: mention_key(&self.document_id, &self.section_id, index),
                document_id: self.document_id.clone(),
                section_id: self.section_id.clone(),
                index,
                name: entity.name.clone(),
                entity_type: entity.entity_type.clone(),
                description: entity.description.clone(),
                aliases: entity.aliases.clone(),
                confidence: entity.confidence,
            })
            .collect()
    }

    /// The persisted id an EXISTING mention points at, if its context index is valid.
    pub fn existing_match(&self, entity_index: usize) -> Option<&ExistingEntityRef> {
        let entity = self.entities.get(entity_index)?;
        if entity.resolution_status != ResolutionStatus::Existing {
            return None;
        }
        let wanted = entity.matched_entity_index?;
        self.existing_entities_context
            .iter()
            .find(|ctx| ctx.index == wanted)
    }
}

// ---------------------------------------------------------------------------
// Mentions and clusters
// ---------------------------------------------------------------------------

/// One entity mention, flattened out of its extraction row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMention {
    pub key: String,
    pub document_id: String,
    pub section_id: String,
    pub index: usize,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub confidence: f32,
}

/// Mentions judged similar enough to resolve together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityCluster {
    pub cluster_id: i64,
    pub members: Vec<EntityMention>,
}

impl EntityCluster {
    pub fn size(&self) -> usize {
        self.members.len()
    }
}

/// A persisted entity offered to the decision call as a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarEntity {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub description: String,
    /// Cosine distance to the closest cluster member.
    pub distance: f32,
}

/// One per-mention answer of the external decision call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDecision {
    pub entity_name: String,
    pub canonical_name: String,
    /// `CREATE_NEW`, `MERGE_WITH:<name>`, or a persisted entity id.
    pub decision: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
}

// ---------------------------------------------------------------------------
// Persisted graph rows
// ---------------------------------------------------------------------------

/// A long-lived entity in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: String,
    pub canonical_name: String,
    pub entity_type: String,
    pub description: String,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted claim about one subject entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub id: String,
    pub statement: String,
    pub claim_type: String,
    pub subject_entity_id: String,
    pub source_document_id: String,
    pub quote: String,
    pub quote_start: Option<usize>,
    pub quote_end: Option<usize>,
    pub confidence: f32,
    pub embedding: Vec<f32>,
}

// ---------------------------------------------------------------------------
// Tracking
// ---------------------------------------------------------------------------

/// Operation applied to one proposed mention or claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackingOperation {
    Created,
    Merged,
    Linked,
    Duplicate,
    Unresolved,
}

impl TrackingOperation {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Merged => "MERGED",
            Self::Linked => "LINKED",
            Self::Duplicate => "DUPLICATE",
            Self::Unresolved => "UNRESOLVED",
        }
    }
}

impl std::fmt::Display for TrackingOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TrackingOperation {
    type Err = crate::DocGraphError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(Self::Created),
            "MERGED" => Ok(Self::Merged),
            "LINKED" => Ok(Self::Linked),
            "DUPLICATE" => Ok(Self::Duplicate),
            "UNRESOLVED" => Ok(Self::Unresolved),
            other => Err(crate::DocGraphError::parse(format!(
                "unknown tracking operation '{other}'"
            ))),
        }
    }
}

/// Audit record for one input mention of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityTrackingRow {
    pub run_id: String,
    pub mention_key: String,
    pub name: String,
    pub entity_type: String,
    pub decision: String,
    pub operation: TrackingOperation,
    pub resolved_id: Option<String>,
    pub source_document_ids: Vec<String>,
    pub cluster_id: Option<i64>,
    pub cluster_size: usize,
}

/// Audit record for one input claim of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimTrackingRow {
    pub run_id: String,
    pub claim_key: String,
    pub statement: String,
    pub operation: TrackingOperation,
    pub resolved_id: Option<String>,
    pub subject_entity_id: Option<String>,
    pub source_document_ids: Vec<String>,
    pub duplicate_of: Option<String>,
    pub conflict_count: usize,
}

/// Result of writing a batch of rows to a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteSummary {
    pub rows_written: usize,
    pub table: String,
}
