use anyhow::{Context, Result};
use rusqlite::{params, Connection};

pub(crate) const MIGRATION_V1_SQL: &str = r#"
CREATE TABLE entities (
    kind            TEXT NOT NULL,
    id              TEXT NOT NULL,
    scope_id        TEXT NULL,
    updated_at_ms   INTEGER NOT NULL,
    deleted_at      TEXT NULL,
    payload         TEXT NOT NULL,
    PRIMARY KEY (kind, id)
);

CREATE INDEX entities_scope_idx
    ON entities (kind, scope_id);
"#;

const MIGRATION_V2_SQL: &str = r#"
CREATE TABLE sync_state (
    kind            TEXT PRIMARY KEY,
    last_synced_at  TEXT NOT NULL
);
"#;

const MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_V1_SQL), (2, MIGRATION_V2_SQL)];

pub(crate) const LATEST_SCHEMA_VERSION: i64 = 2;

/// Configure pragmas and bring the schema up to date.
pub(crate) fn prepare(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;
        PRAGMA journal_mode = WAL;
        ",
    )
    .context("failed to configure sqlite pragmas for the local store")?;

    ensure_migration_table(conn)?;
    apply_pending_migrations(conn)
}

pub(crate) fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| row.get(0))
        .context("failed to read current schema version")
}

fn ensure_migration_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY,
            applied_at  TEXT NOT NULL
        );
        ",
    )
    .context("failed to ensure schema_migrations table exists")
}

fn apply_pending_migrations(conn: &mut Connection) -> Result<()> {
    let mut current_version = current_schema_version(conn)?;

    for (version, sql) in MIGRATIONS {
        if *version <= current_version {
            continue;
        }

        let tx = conn.transaction().context("failed to start migration transaction")?;
        tx.execute_batch(sql)
            .with_context(|| format!("failed to apply local store migration v{version}"))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, datetime('now'))",
            params![version],
        )
        .with_context(|| format!("failed to record migration v{version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        current_version = *version;
    }

    Ok(())
}
