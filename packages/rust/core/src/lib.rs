//! Knowledge-graph consolidation engine for DocGraph.
//!
//! Clusters proposed entity mentions across a run's documents, resolves the
//! clusters against the persisted graph (following merge chains), then
//! deduplicates and conflict-checks proposed claims. Each resolution phase
//! applies its mutations in one transaction. [`pipeline::run_pipeline`]
//! sequences the stages for one run.

pub mod bridge;
pub mod claims;
pub mod clustering;
pub mod conflicts;
pub mod entities;
pub mod merge_chain;
pub mod pipeline;
pub mod stages;
pub mod tracker;

#[cfg(test)]
pub(crate) mod test_support;

pub use bridge::{BridgeClient, CachedEmbedder, Embedder, ResolutionDecider};
pub use claims::{
    ClaimGroup, ClaimResolutionSummary, claim_clustering, claim_resolution, load_claim_groups,
};
pub use conflicts::{ClaimTypeConflictPolicy, ConflictPolicy, NoConflicts};
pub use entities::{
    EntityResolutionSummary, entity_clustering, entity_resolution, load_entity_clusters,
};
pub use pipeline::{
    ExtractionPayload, PipelineResult, ProgressReporter, SilentProgress, load_extraction_rows,
    run_pipeline,
};
pub use stages::{StageDescriptor, StageSpec, register_stage};
pub use tracker::{CallKind, CallRecord, CallTracker, TrackerSnapshot};
