//! Per-kind table initialization
//!
//! Every kind gets the same physical layout:
//!
//! ```text
//! TABLE <kind> {
//!   id          TEXT PRIMARY KEY
//!   namespace   TEXT    (indexed)
//!   state       TEXT    (indexed)
//!   data        TEXT    (full record as JSON)
//!   indexed_by  TEXT?   (indexed)
//!   created_by  TEXT
//!   updated_by  TEXT
//!   created_at  INTEGER (ns since epoch)
//!   updated_at  INTEGER (ns since epoch, version token)
//! }
//! ```
//!
//! With full-text enabled, `_fts_<kind>` is an FTS5 table holding the text
//! leaves of `data`, keyed by the main table's rowid and kept in lockstep by
//! insert/update/delete triggers. When the shadow table is created for a kind
//! that already has rows, it is filled from them in the same transaction.
//!
//! Auxiliary objects (indexes, the shadow table, triggers) start with `_`,
//! which no kind can, so they never collide with another kind's table.
//!
//! All statements are `IF NOT EXISTS`; existing tables are never altered.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::sql::{fts_table, table};
use crate::Result;

/// Create the table, indexes and (optionally) the full-text shadow for `kind`.
///
/// Idempotent.
pub(crate) fn init_kind(conn: &Connection, kind: &str, full_text: bool) -> Result<()> {
    let table = table(kind)?;
    debug!(kind = %table, full_text, "initializing kind table");

    conn.execute_batch(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS "{table}" (
            id          TEXT PRIMARY KEY,
            namespace   TEXT NOT NULL,
            state       TEXT NOT NULL,
            data        TEXT NOT NULL,
            indexed_by  TEXT,
            created_by  TEXT NOT NULL,
            updated_by  TEXT NOT NULL,
            created_at  INTEGER NOT NULL,
            updated_at  INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS "_idx_{table}_namespace" ON "{table}" (namespace);
        CREATE INDEX IF NOT EXISTS "_idx_{table}_state" ON "{table}" (state);
        CREATE INDEX IF NOT EXISTS "_idx_{table}_indexed_by" ON "{table}" (indexed_by);
        "#
    ))?;

    if full_text {
        init_full_text(conn, table)?;
    }

    info!(kind = %table, "✓ kind table initialized");
    Ok(())
}

/// Text that the full-text index sees for a row: every string leaf of `data`.
fn text_of(row: &str) -> String {
    format!("(SELECT group_concat(value, ' ') FROM json_tree({row}.data) WHERE type = 'text')")
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let exists = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        [name],
        |row| row.get(0),
    )?;
    Ok(exists)
}

fn init_full_text(conn: &Connection, table: &str) -> Result<()> {
    let fts = fts_table(table);
    let new_text = text_of("new");
    let tx = conn.unchecked_transaction()?;

    if !table_exists(&tx, &fts)? {
        let row_text = text_of("src");
        tx.execute_batch(&format!(
            r#"
            CREATE VIRTUAL TABLE "{fts}" USING fts5(body);
            INSERT INTO "{fts}" (rowid, body) SELECT src.rowid, {row_text} FROM "{table}" AS src;
            "#
        ))?;
        info!(table = %fts, "✓ full-text index built from existing rows");
    }

    tx.execute_batch(&format!(
        r#"
        CREATE TRIGGER IF NOT EXISTS "{fts}_ai" AFTER INSERT ON "{table}" BEGIN
            INSERT INTO "{fts}" (rowid, body) VALUES (new.rowid, {new_text});
        END;

        CREATE TRIGGER IF NOT EXISTS "{fts}_au" AFTER UPDATE OF data ON "{table}" BEGIN
            DELETE FROM "{fts}" WHERE rowid = old.rowid;
            INSERT INTO "{fts}" (rowid, body) VALUES (new.rowid, {new_text});
        END;

        CREATE TRIGGER IF NOT EXISTS "{fts}_ad" AFTER DELETE ON "{table}" BEGIN
            DELETE FROM "{fts}" WHERE rowid = old.rowid;
        END;
        "#
    ))?;
    tx.commit()?;

    debug!(table = %fts, "full-text shadow table ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fts_rows(conn: &Connection, expr: &str) -> i64 {
        conn.query_row(
            r#"SELECT COUNT(*) FROM "_fts_person" WHERE "_fts_person" MATCH ?1"#,
            [expr],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_kind(&conn, "person", true).unwrap();
        init_kind(&conn, "person", true).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name IN ('person', '_fts_person')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 2);
    }

    fn insert_alice(conn: &Connection) {
        conn.execute(
            "INSERT INTO person (id, namespace, state, data, created_by, updated_by, created_at, updated_at)
             VALUES ('a', 'acme', 'active', ?1, 'x', 'x', 1, 1)",
            [r#"{"name": "Alice Liddell", "tags": ["reader"]}"#],
        )
        .unwrap();
    }

    #[test]
    fn late_full_text_indexes_existing_rows() {
        let conn = Connection::open_in_memory().unwrap();
        init_kind(&conn, "person", false).unwrap();
        insert_alice(&conn);

        init_kind(&conn, "person", true).unwrap();
        assert_eq!(fts_rows(&conn, "alice"), 1);
        assert_eq!(fts_rows(&conn, "reader"), 1);

        // A second pass must not index the row twice.
        init_kind(&conn, "person", true).unwrap();
        let indexed: i64 = conn
            .query_row(r#"SELECT COUNT(*) FROM "_fts_person""#, [], |row| row.get(0))
            .unwrap();
        assert_eq!(indexed, 1);
    }

    #[test]
    fn kinds_named_like_auxiliary_objects_coexist() {
        let conn = Connection::open_in_memory().unwrap();
        init_kind(&conn, "app", true).unwrap();
        init_kind(&conn, "app_fts", true).unwrap();
        init_kind(&conn, "idx_app_state", true).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master
                 WHERE type = 'table' AND name IN ('app', 'app_fts', 'idx_app_state')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3);
    }

    #[test]
    fn rejects_unsafe_kind() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(init_kind(&conn, "x; DROP TABLE y", true).is_err());
    }

    #[test]
    fn triggers_keep_full_text_in_lockstep() {
        let conn = Connection::open_in_memory().unwrap();
        init_kind(&conn, "person", true).unwrap();

        conn.execute(
            "INSERT INTO person (id, namespace, state, data, created_by, updated_by, created_at, updated_at)
             VALUES ('a', 'acme', 'active', ?1, 'x', 'x', 1, 1)",
            [r#"{"name": "Alice Liddell", "age": 30, "created_at": 1700000000000000047}"#],
        )
        .unwrap();
        assert_eq!(fts_rows(&conn, "alice"), 1);
        // Numbers are not text leaves.
        assert_eq!(fts_rows(&conn, "30"), 0);

        conn.execute(
            "UPDATE person SET data = ?1 WHERE id = 'a'",
            [r#"{"name": "Bob"}"#],
        )
        .unwrap();
        assert_eq!(fts_rows(&conn, "alice"), 0);
        assert_eq!(fts_rows(&conn, "bob"), 1);

        conn.execute("DELETE FROM person WHERE id = 'a'", []).unwrap();
        assert_eq!(fts_rows(&conn, "bob"), 0);
    }
}
