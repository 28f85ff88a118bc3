//! Shared types, error model, run context, and configuration for DocGraph.
//!
//! This crate is the foundation depended on by all other DocGraph crates.
//! It provides:
//! - [`DocGraphError`] — the unified error type
//! - Domain types ([`ExtractionRow`], [`EntityMention`], [`EntityCluster`], tracking rows)
//! - Run scoping ([`RunContext`], [`FilterSpec`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod context;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BridgeConfig, ClaimsConfig, ClusteringConfig, DatabaseConfig, TrackerConfig,
    config_dir, config_file_path, init_config, load_config, load_config_from,
};
pub use context::{FilterSpec, RunContext, glob_to_regex};
pub use error::{DocGraphError, Result};
pub use types::{
    ClaimRecord, ClaimTrackingRow, DocumentRecord, EntityCluster, EntityDecision, EntityMention,
    EntityRecord, EntityTrackingRow, ExistingEntityRef, ExtractionRow, ProposedClaim,
    ProposedEntity, ProposedRelationship, ResolutionStatus, SimilarEntity, TrackingOperation,
    WriteSummary, claim_key, mention_key,
};
