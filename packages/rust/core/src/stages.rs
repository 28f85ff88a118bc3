//! Stage registration.
//!
//! Each stage declares its output table and the tables it reads once at
//! start-up. Registration fails if an input table is unknown, so a
//! misconfigured pipeline stops before any stage runs.

use docgraph_shared::{DocGraphError, Result};
use docgraph_storage::{
    ColumnDef, FilterStrategy, Reference, TableRegistry, TableSchema, graph_tables,
};
use serde_json::Value;
use tracing::debug;

pub const ENTITY_CLUSTERS: &str = "entity_clusters";
pub const CLAIM_CLUSTERS: &str = "claim_clusters";

/// What a stage writes and what it reads.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub name: String,
    pub output: TableSchema,
    pub inputs: Vec<String>,
}

impl StageSpec {
    pub fn new(name: &str, output: TableSchema, inputs: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            output,
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// A registered stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDescriptor {
    pub name: String,
    pub output_table: String,
    pub key: Vec<String>,
    pub inputs: Vec<String>,
}

impl StageDescriptor {
    /// Reference to this stage's output, scoped to the current run.
    pub fn output_for_run(&self) -> Reference {
        run_scoped(&self.output_table)
    }
}

/// Reference to the rows of `table` written by the current run.
pub fn run_scoped(table: &str) -> Reference {
    Reference::new(table).filter_column(
        "run_id",
        FilterStrategy::from_context(|ctx| Value::String(ctx.run_id.clone())),
    )
}

/// Record a stage's output schema in the registry.
///
/// Registering the same stage twice is a no-op; a different schema for an
/// existing table, or an input table nobody registered, is a configuration
/// error.
pub fn register_stage(registry: &TableRegistry, spec: StageSpec) -> Result<StageDescriptor> {
    for input in &spec.inputs {
        registry.get(input)?;
    }
    let descriptor = StageDescriptor {
        name: spec.name.clone(),
        output_table: spec.output.name.clone(),
        key: spec.output.key.clone(),
        inputs: spec.inputs.clone(),
    };
    registry.register(spec.output)?;
    debug!(stage = %descriptor.name, output = %descriptor.output_table, "stage registered");
    Ok(descriptor)
}

fn graph_table(name: &str) -> Result<TableSchema> {
    graph_tables()
        .into_iter()
        .find(|t| t.name == name)
        .ok_or_else(|| DocGraphError::unregistered(name))
}

pub fn entity_clustering_spec() -> StageSpec {
    StageSpec::new(
        "entity_clustering",
        TableSchema::new(
            ENTITY_CLUSTERS,
            vec![
                ColumnDef::text("run_id"),
                ColumnDef::text("mention_key"),
                ColumnDef::integer("cluster_id"),
                ColumnDef::integer("cluster_size"),
                ColumnDef::text("document_id"),
                ColumnDef::text("section_id"),
                ColumnDef::integer("entity_index"),
                ColumnDef::text("name"),
                ColumnDef::text("entity_type"),
                ColumnDef::text("description"),
                ColumnDef::text("aliases_json"),
                ColumnDef::real("confidence"),
            ],
            &["run_id", "mention_key"],
        )
        .scoped_by("document_id"),
        &["extractions"],
    )
}

pub fn claim_clustering_spec() -> StageSpec {
    StageSpec::new(
        "claim_clustering",
        TableSchema::new(
            CLAIM_CLUSTERS,
            vec![
                ColumnDef::text("run_id"),
                ColumnDef::text("claim_key"),
                ColumnDef::integer("group_id"),
                ColumnDef::integer("group_size"),
                ColumnDef::text("document_id"),
                ColumnDef::text("section_id"),
                ColumnDef::integer("claim_index"),
                ColumnDef::text("statement"),
            ],
            &["run_id", "claim_key"],
        )
        .scoped_by("document_id"),
        &["extractions"],
    )
}

pub fn entity_resolution_spec() -> Result<StageSpec> {
    Ok(StageSpec::new(
        "entity_resolution",
        graph_table("entity_tracking")?,
        &[ENTITY_CLUSTERS, "extractions", "entities"],
    ))
}

pub fn claim_resolution_spec() -> Result<StageSpec> {
    Ok(StageSpec::new(
        "claim_resolution",
        graph_table("claim_tracking")?,
        &[CLAIM_CLUSTERS, "extractions", "entity_tracking", "claims"],
    ))
}

/// Register the four consolidation stages, in dependency order.
pub fn register_builtin_stages(registry: &TableRegistry) -> Result<Vec<StageDescriptor>> {
    Ok(vec![
        register_stage(registry, entity_clustering_spec())?,
        register_stage(registry, claim_clustering_spec())?,
        register_stage(registry, entity_resolution_spec()?)?,
        register_stage(registry, claim_resolution_spec()?)?,
    ])
}
