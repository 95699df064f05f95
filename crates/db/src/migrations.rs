// crates/db/src/migrations.rs
/// Inline SQL migrations for the brain database schema.
///
/// Simple inline migrations rather than sqlx migration files: the schema is
/// small and self-contained, and each step is idempotent so reruns are safe.
pub const MIGRATIONS: &[&str] = &[
    // Migration 1: nodes (latest version, flattened for query) + full history
    r#"
CREATE TABLE IF NOT EXISTS nodes (
    id               TEXT PRIMARY KEY,
    version          INTEGER NOT NULL,
    session_file     TEXT NOT NULL,
    segment_json     TEXT NOT NULL,
    session_id       TEXT NOT NULL,
    computer         TEXT NOT NULL,
    node_type        TEXT NOT NULL,
    project          TEXT NOT NULL,
    summary          TEXT NOT NULL,
    outcome          TEXT NOT NULL,
    timestamp        INTEGER NOT NULL,
    analyzed_at      INTEGER NOT NULL,
    analyzer_version TEXT NOT NULL,
    tags             TEXT NOT NULL DEFAULT '[]',
    topics           TEXT NOT NULL DEFAULT '[]',
    friction_score   REAL NOT NULL DEFAULT 0,
    delight_score    REAL NOT NULL DEFAULT 0,
    node_json        TEXT NOT NULL,
    created_at       INTEGER NOT NULL,
    updated_at       INTEGER NOT NULL
);
"#,
    r#"
CREATE TABLE IF NOT EXISTS node_versions (
    id         TEXT NOT NULL,
    version    INTEGER NOT NULL,
    node_json  TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (id, version)
);
"#,
    r#"CREATE INDEX IF NOT EXISTS idx_nodes_project ON nodes(project);"#,
    r#"CREATE INDEX IF NOT EXISTS idx_nodes_type ON nodes(node_type);"#,
    r#"CREATE INDEX IF NOT EXISTS idx_nodes_outcome ON nodes(outcome);"#,
    r#"CREATE INDEX IF NOT EXISTS idx_nodes_timestamp ON nodes(timestamp DESC);"#,
    r#"CREATE INDEX IF NOT EXISTS idx_nodes_analyzer_version ON nodes(analyzer_version);"#,
    r#"CREATE INDEX IF NOT EXISTS idx_nodes_session ON nodes(session_id);"#,
    // Migration 2: edges
    r#"
CREATE TABLE IF NOT EXISTS edges (
    from_node_id TEXT NOT NULL,
    to_node_id   TEXT NOT NULL,
    kind         TEXT NOT NULL,
    metadata     TEXT NOT NULL DEFAULT '{}',
    created_at   INTEGER NOT NULL,
    PRIMARY KEY (from_node_id, to_node_id, kind)
);
"#,
    r#"CREATE INDEX IF NOT EXISTS idx_edges_to ON edges(to_node_id);"#,
    r#"CREATE INDEX IF NOT EXISTS idx_edges_kind ON edges(kind);"#,
    // Migration 3: denormalized observation tables for aggregation
    r#"
CREATE TABLE IF NOT EXISTS lessons (
    node_id TEXT NOT NULL,
    level   TEXT NOT NULL,
    text    TEXT NOT NULL
);
"#,
    r#"CREATE INDEX IF NOT EXISTS idx_lessons_node ON lessons(node_id);"#,
    r#"
CREATE TABLE IF NOT EXISTS model_quirks (
    node_id TEXT NOT NULL,
    model   TEXT,
    text    TEXT NOT NULL
);
"#,
    r#"CREATE INDEX IF NOT EXISTS idx_quirks_node ON model_quirks(node_id);"#,
    r#"
CREATE TABLE IF NOT EXISTS tool_errors (
    node_id TEXT NOT NULL,
    tool    TEXT,
    text    TEXT NOT NULL
);
"#,
    r#"CREATE INDEX IF NOT EXISTS idx_tool_errors_node ON tool_errors(node_id);"#,
    // Migration 4: embeddings (main + integer-rowid mirror for vector scans)
    r#"
CREATE TABLE IF NOT EXISTS node_embeddings (
    node_id    TEXT PRIMARY KEY,
    model      TEXT NOT NULL,
    dimensions INTEGER NOT NULL,
    embedding  BLOB NOT NULL,
    text_hash  TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL
);
"#,
    r#"
CREATE TABLE IF NOT EXISTS node_embeddings_vec (
    rowid     INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id   TEXT NOT NULL UNIQUE,
    embedding BLOB NOT NULL
);
"#,
    // Migration 5: full-text index over node summaries
    r#"
CREATE VIRTUAL TABLE IF NOT EXISTS fts_nodes_summary USING fts5(
    node_id UNINDEXED,
    summary
);
"#,
    // Migration 6: durable job queue
    r#"
CREATE TABLE IF NOT EXISTS jobs (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    kind         TEXT NOT NULL,
    session_file TEXT,
    node_id      TEXT,
    priority     INTEGER NOT NULL,
    run_at       INTEGER NOT NULL,
    attempts     INTEGER NOT NULL DEFAULT 0,
    worker_id    TEXT,
    leased_until INTEGER,
    state        TEXT NOT NULL DEFAULT 'pending',
    last_error   TEXT,
    created_at   INTEGER NOT NULL
);
"#,
    r#"CREATE INDEX IF NOT EXISTS idx_jobs_lease ON jobs(state, run_at, priority);"#,
    r#"CREATE INDEX IF NOT EXISTS idx_jobs_session ON jobs(session_file);"#,
    // Migration 7: aggregated insights
    r#"
CREATE TABLE IF NOT EXISTS aggregated_insights (
    id               TEXT PRIMARY KEY,
    insight_type     TEXT NOT NULL,
    model            TEXT,
    tool             TEXT,
    pattern          TEXT NOT NULL,
    frequency        INTEGER NOT NULL DEFAULT 0,
    confidence       REAL NOT NULL DEFAULT 0,
    severity         TEXT NOT NULL DEFAULT 'low',
    workaround       TEXT,
    examples         TEXT NOT NULL DEFAULT '[]',
    first_seen       INTEGER NOT NULL,
    last_seen        INTEGER NOT NULL,
    prompt_text      TEXT,
    prompt_included  INTEGER NOT NULL DEFAULT 0,
    prompt_version   TEXT
);
"#,
    r#"CREATE INDEX IF NOT EXISTS idx_insights_type ON aggregated_insights(insight_type);"#,
    r#"CREATE INDEX IF NOT EXISTS idx_insights_model ON aggregated_insights(model);"#,
    // Migration 8: clusters
    r#"
CREATE TABLE IF NOT EXISTS clusters (
    id               TEXT PRIMARY KEY,
    name             TEXT,
    description      TEXT,
    node_count       INTEGER NOT NULL DEFAULT 0,
    signal_type      TEXT,
    related_model    TEXT,
    status           TEXT NOT NULL DEFAULT 'pending',
    algorithm        TEXT NOT NULL,
    min_cluster_size INTEGER NOT NULL,
    centroid         BLOB,
    updated_at       INTEGER NOT NULL
);
"#,
    r#"
CREATE TABLE IF NOT EXISTS cluster_members (
    cluster_id TEXT NOT NULL,
    node_id    TEXT NOT NULL,
    PRIMARY KEY (cluster_id, node_id)
);
"#,
    // Migration 9: prompt registry
    r#"
CREATE TABLE IF NOT EXISTS prompt_versions (
    version      TEXT PRIMARY KEY,
    sequential   INTEGER NOT NULL UNIQUE,
    content_hash TEXT NOT NULL UNIQUE,
    created_at   INTEGER NOT NULL,
    file_path    TEXT NOT NULL
);
"#,
    // Migration 10: effectiveness measurements
    r#"
CREATE TABLE IF NOT EXISTS prompt_effectiveness (
    id                 TEXT PRIMARY KEY,
    insight_id         TEXT NOT NULL,
    prompt_version     TEXT NOT NULL,
    before_occurrences INTEGER NOT NULL,
    before_severity    TEXT,
    before_start       INTEGER NOT NULL,
    before_end         INTEGER NOT NULL,
    after_occurrences  INTEGER NOT NULL,
    after_severity     TEXT,
    after_start        INTEGER NOT NULL,
    after_end          INTEGER NOT NULL,
    improvement_pct    REAL NOT NULL,
    significant        INTEGER NOT NULL DEFAULT 0,
    sessions_before    INTEGER NOT NULL,
    sessions_after     INTEGER NOT NULL,
    measured_at        INTEGER NOT NULL,
    created_at         INTEGER NOT NULL
);
"#,
    r#"CREATE INDEX IF NOT EXISTS idx_effectiveness_insight ON prompt_effectiveness(insight_id, measured_at DESC);"#,
];
