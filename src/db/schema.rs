/// Schema for the gateway database.
///
/// Timestamps written by the gateway are fixed-width RFC 3339 strings, so
/// lexical order equals chronological order.
pub const SCHEMA: &str = r#"
-- Physical cache stores, one row per {prefix}-{logical}-{version}
CREATE TABLE IF NOT EXISTS cache_generations (
    name TEXT PRIMARY KEY,
    logical_name TEXT NOT NULL,
    version TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- Captured responses keyed by request digest
CREATE TABLE IF NOT EXISTS cache_entries (
    generation TEXT NOT NULL,
    entry_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (generation, entry_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_age
    ON cache_entries(generation, cached_at);

-- Single-row lifecycle record
CREATE TABLE IF NOT EXISTS lifecycle (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    active_version TEXT,
    waiting_version TEXT,
    updated_at TEXT NOT NULL
);

-- Pending background sync tags
CREATE TABLE IF NOT EXISTS sync_tags (
    tag TEXT PRIMARY KEY,
    registered_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);
"#;
