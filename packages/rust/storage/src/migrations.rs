//! SQL migration definitions for the DocGraph database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements; the last statement records
//! the version in `schema_migrations`.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: documents, extractions, entities, relationships, claims, tracking",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Crawled documents (owned by ingestion)
CREATE TABLE IF NOT EXISTS documents (
    id           TEXT PRIMARY KEY,
    source_url   TEXT NOT NULL,
    status       TEXT NOT NULL,
    content_type TEXT,
    cluster_id   INTEGER,
    content_path TEXT,
    content      TEXT
);

CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status);

-- Per-section extraction output
CREATE TABLE IF NOT EXISTS extractions (
    document_id  TEXT NOT NULL,
    section_id   TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    UNIQUE(document_id, section_id)
);

-- Knowledge graph entities
CREATE TABLE IF NOT EXISTS entities (
    id             TEXT PRIMARY KEY,
    canonical_name TEXT NOT NULL,
    entity_type    TEXT NOT NULL,
    description    TEXT NOT NULL DEFAULT '',
    embedding_json TEXT NOT NULL DEFAULT '[]',
    created_by_run TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entities_name ON entities(lower(canonical_name), entity_type);
CREATE INDEX IF NOT EXISTS idx_entities_run ON entities(created_by_run);

CREATE TABLE IF NOT EXISTS entity_aliases (
    entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    alias     TEXT NOT NULL,
    UNIQUE(entity_id, alias)
);

CREATE TABLE IF NOT EXISTS relationships (
    id                TEXT PRIMARY KEY,
    source_entity_id  TEXT NOT NULL REFERENCES entities(id),
    target_entity_id  TEXT NOT NULL REFERENCES entities(id),
    relationship_type TEXT NOT NULL,
    description       TEXT NOT NULL DEFAULT '',
    confidence        REAL NOT NULL,
    document_id       TEXT NOT NULL,
    run_id            TEXT NOT NULL,
    UNIQUE(source_entity_id, target_entity_id, relationship_type, document_id)
);

CREATE TABLE IF NOT EXISTS claims (
    id                 TEXT PRIMARY KEY,
    statement          TEXT NOT NULL,
    claim_type         TEXT NOT NULL,
    subject_entity_id  TEXT NOT NULL REFERENCES entities(id),
    source_document_id TEXT NOT NULL,
    quote              TEXT NOT NULL DEFAULT '',
    quote_start        INTEGER,
    quote_end          INTEGER,
    confidence         REAL NOT NULL,
    embedding_json     TEXT NOT NULL DEFAULT '[]',
    run_id             TEXT NOT NULL,
    created_at         TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_claims_subject ON claims(subject_entity_id);

CREATE TABLE IF NOT EXISTS claim_conflicts (
    run_id               TEXT NOT NULL,
    claim_id             TEXT NOT NULL,
    conflicting_claim_id TEXT NOT NULL,
    reason               TEXT NOT NULL,
    UNIQUE(claim_id, conflicting_claim_id)
);

-- Append-only audit trail, one row per input mention / claim per run
CREATE TABLE IF NOT EXISTS entity_tracking (
    run_id              TEXT NOT NULL,
    mention_key         TEXT NOT NULL,
    name                TEXT NOT NULL,
    entity_type         TEXT NOT NULL,
    decision            TEXT NOT NULL,
    operation           TEXT NOT NULL,
    resolved_id         TEXT,
    source_document_ids TEXT NOT NULL,
    cluster_id          INTEGER,
    cluster_size        INTEGER NOT NULL,
    created_at          TEXT NOT NULL,
    UNIQUE(run_id, mention_key)
);

CREATE TABLE IF NOT EXISTS claim_tracking (
    run_id              TEXT NOT NULL,
    claim_key           TEXT NOT NULL,
    statement           TEXT NOT NULL,
    operation           TEXT NOT NULL,
    resolved_id         TEXT,
    subject_entity_id   TEXT,
    source_document_ids TEXT NOT NULL,
    duplicate_of        TEXT,
    conflict_count      INTEGER NOT NULL,
    created_at          TEXT NOT NULL,
    UNIQUE(run_id, claim_key)
);

CREATE TABLE IF NOT EXISTS processed_documents (
    document_id  TEXT NOT NULL,
    run_id       TEXT NOT NULL,
    processed_at TEXT NOT NULL,
    UNIQUE(document_id, run_id)
);

-- Embedding cache keyed by sha256(model, text)
CREATE TABLE IF NOT EXISTS embedding_cache (
    hash        TEXT PRIMARY KEY,
    model       TEXT NOT NULL,
    vector_json TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

INSERT OR IGNORE INTO schema_migrations (version) VALUES (1);
"#,
        },
    ]
}
