/// DDL to create the schema_version tracking table.
///
/// Applied unconditionally on every open (before checking the version), using
/// `IF NOT EXISTS` so it is safe to run multiple times.
pub const SCHEMA_VERSION_DDL: &str = "
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER NOT NULL
    ) STRICT;
";

/// DDL for the v1 schema.
///
/// - `threads`: one row per thread; the full thread (comments included) is a
///   JSON payload, with scope columns pulled out for inspection. `position`
///   keeps the collection order stable across restarts.
/// - `tombstones`: remote issue ids removed locally that must never come back.
/// - `preferences`: free-form UI settings (selected scope, last panel).
pub const SCHEMA_V1_SQL: &str = "
    CREATE TABLE IF NOT EXISTS threads (
        id        TEXT    PRIMARY KEY,
        route     TEXT    NOT NULL,
        version   TEXT    NOT NULL,
        position  INTEGER NOT NULL,
        payload   TEXT    NOT NULL
    ) STRICT;

    CREATE INDEX IF NOT EXISTS threads_scope ON threads(route, version);

    CREATE TABLE IF NOT EXISTS tombstones (
        remote_issue_id TEXT    PRIMARY KEY,
        removed_at      INTEGER NOT NULL
    ) STRICT;

    CREATE TABLE IF NOT EXISTS preferences (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    ) STRICT;
";

/// Latest schema version understood by this build.
pub const SCHEMA_VERSION: i64 = 1;

/// Runs forward-only schema migration to the latest version.
///
/// Idempotent: safe to call on every startup. Each step is applied inside a
/// `BEGIN IMMEDIATE` transaction together with its version row.
///
/// A second process opening the same file blocks on the immediate
/// transaction (up to the connection's busy timeout) instead of racing to
/// create the same tables. A database written by a newer build, with a
/// version above [`SCHEMA_VERSION`], is left untouched.
///
/// # Errors
///
/// Returns the underlying `rusqlite` error if the version table cannot be
/// created or a migration step fails. A failed step rolls back together with
/// its version row, so the next open retries it from scratch.
pub fn migrate(db: &mut rusqlite::Connection) -> rusqlite::Result<()> {
    db.execute_batch(SCHEMA_VERSION_DDL)?;

    let version: i64 = db
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |r| r.get(0),
        )
        .unwrap_or(0);

    if version < 1 {
        let tx = db.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        tx.execute_batch(SCHEMA_V1_SQL)?;
        tx.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;
        tx.commit()?;
    }

    Ok(())
}
