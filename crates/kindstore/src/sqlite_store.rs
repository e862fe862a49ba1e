//! SQLite-backed DocumentStore implementation
//!
//! One connection, guarded by a mutex, serves every call: SQLite allows a
//! single writer, and funnelling all work through one handle keeps writes
//! ordered without further locking. Blocking SQLite work runs on tokio's
//! blocking pool.
//!
//! With `op_timeout` configured, a call that misses its deadline returns
//! `StoreError::Timeout`. If its statement is already executing it is
//! interrupted; if it is still queued behind other calls it never starts.
//!
//! A timeout does not prove the call had no effect: a write that committed
//! just as the deadline fired is reported as `Timeout` all the same. Fetch
//! the record before retrying a timed-out insert or update.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{ffi, params, params_from_iter, Connection, InterruptHandle, OptionalExtension};
use tracing::{debug, info, instrument, warn};

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::migrations;
use crate::query::Query;
use crate::sql::{self, COLUMNS};
use crate::storage_traits::{urn_text, Document, DocumentStore, StoreResult};

struct State {
    conn: Connection,
    /// Kinds whose tables exist in this database.
    ready: HashSet<String>,
}

/// Pause between interrupts of a timed-out operation that still holds the connection.
const INTERRUPT_RETRY: Duration = Duration::from_millis(5);

struct Inner {
    state: Mutex<State>,
    /// Id of the operation currently holding the connection.
    running: Mutex<Option<u64>>,
    interrupt: InterruptHandle,
    next_op: AtomicU64,
}

impl Inner {
    /// Interrupt `op_id` if it holds the connection; false once it does not.
    fn interrupt_if_running(&self, op_id: u64) -> bool {
        // Holding `running` keeps the operation from handing the connection
        // to the next caller while the interrupt is issued.
        match self.running.lock() {
            Ok(running) if *running == Some(op_id) => {
                self.interrupt.interrupt();
                true
            }
            _ => false,
        }
    }
}

/// SQLite-backed implementation of [`DocumentStore`].
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<Inner>,
    config: StoreConfig,
}

impl SqliteStore {
    /// Open the database described by `config`.
    pub fn open(config: StoreConfig) -> crate::Result<Self> {
        let conn = match &config.path {
            Some(path) => {
                ensure_parent_dir(path)?;
                let conn = Connection::open(path).map_err(|e| {
                    StoreError::Backend(format!("failed to open {}: {e}", path.display()))
                })?;
                conn.execute_batch("PRAGMA journal_mode = WAL;")?;
                conn
            }
            None => Connection::open_in_memory()?,
        };
        conn.busy_timeout(config.busy_timeout)?;

        match &config.path {
            Some(path) => info!(path = %path.display(), full_text = config.full_text, "SqliteStore opened"),
            None => info!(full_text = config.full_text, "SqliteStore opened (in-memory)"),
        }

        let interrupt = conn.get_interrupt_handle();
        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    conn,
                    ready: HashSet::new(),
                }),
                running: Mutex::new(None),
                interrupt,
                next_op: AtomicU64::new(0),
            }),
            config,
        })
    }

    /// Private in-memory database with default settings.
    pub fn in_memory() -> crate::Result<Self> {
        Self::open(StoreConfig::in_memory())
    }

    /// Open using [`StoreConfig::from_env`].
    pub fn from_env() -> crate::Result<Self> {
        let config = StoreConfig::from_env().map_err(StoreError::Backend)?;
        Self::open(config)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Create tables for `kinds` up front instead of on first use.
    pub async fn init_kinds<I, S>(&self, kinds: I) -> StoreResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let kinds: Vec<String> = kinds.into_iter().map(Into::into).collect();
        let full_text = self.config.full_text;
        self.run("init_kinds", move |state| {
            for kind in &kinds {
                state.ensure_kind(kind, full_text)?;
            }
            Ok(())
        })
        .await
    }

    /// Run `f` against the connection on the blocking pool, honoring `op_timeout`.
    async fn run<T, F>(&self, operation: &'static str, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut State) -> StoreResult<T> + Send + 'static,
    {
        let op_id = self.inner.next_op.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));

        let inner = Arc::clone(&self.inner);
        let task_cancelled = Arc::clone(&cancelled);
        let task = tokio::task::spawn_blocking(move || {
            let mut state = inner
                .state
                .lock()
                .map_err(|_| StoreError::Backend("connection lock poisoned".to_string()))?;
            {
                let mut running = inner
                    .running
                    .lock()
                    .map_err(|_| StoreError::Backend("operation slot poisoned".to_string()))?;
                if task_cancelled.load(Ordering::SeqCst) {
                    return Err(StoreError::Backend(format!("{operation} abandoned")));
                }
                *running = Some(op_id);
            }
            let result = f(&mut *state);
            set_running(&inner.running, None);
            result
        });

        let joined = match self.config.op_timeout {
            None => task.await,
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    cancelled.store(true, Ordering::SeqCst);
                    // An interrupt that lands before the statement starts is
                    // lost, so repeat until the operation lets go.
                    let inner = Arc::clone(&self.inner);
                    tokio::spawn(async move {
                        while inner.interrupt_if_running(op_id) {
                            tokio::time::sleep(INTERRUPT_RETRY).await;
                        }
                    });
                    let after_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
                    warn!(operation, after_ms, "store operation timed out");
                    return Err(StoreError::Timeout {
                        operation: operation.to_string(),
                        after_ms,
                    });
                }
            },
        };

        joined.map_err(|e| StoreError::Backend(format!("{operation} task failed: {e}")))?
    }
}

fn set_running(running: &Mutex<Option<u64>>, value: Option<u64>) {
    if let Ok(mut slot) = running.lock() {
        *slot = value;
    }
}

fn ensure_parent_dir(path: &Path) -> crate::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            StoreError::Backend(format!(
                "failed to create database directory {}: {e}",
                parent.display()
            ))
        })?;
    }
    Ok(())
}

impl State {
    fn ensure_kind(&mut self, kind: &str, full_text: bool) -> StoreResult<()> {
        if !self.ready.contains(kind) {
            migrations::init_kind(&self.conn, kind, full_text)?;
            self.ready.insert(kind.to_string());
        }
        Ok(())
    }
}

fn read_row(kind: &str, row: &rusqlite::Row<'_>) -> rusqlite::Result<Document> {
    Ok(Document {
        kind: kind.to_string(),
        id: row.get(0)?,
        namespace: row.get(1)?,
        state: row.get(2)?,
        data: row.get(3)?,
        indexed_by: row.get(4)?,
        created_by: row.get(5)?,
        updated_by: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

/// Fetch a row by id, or `None`.
fn fetch_row(conn: &Connection, kind: &str, id: &str) -> StoreResult<Option<Document>> {
    let table = sql::table(kind)?;
    let row = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM \"{table}\" WHERE id = ?1"),
            params![id],
            |row| read_row(kind, row),
        )
        .optional()?;
    Ok(row)
}

/// Only a primary-key clash means the row exists; other constraint
/// failures are backend errors.
fn insert_error(err: rusqlite::Error, doc: &Document) -> StoreError {
    match err {
        rusqlite::Error::SqliteFailure(ref failure, _)
            if failure.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
        {
            StoreError::AlreadyExists {
                urn: doc.urn_string(),
            }
        }
        other => StoreError::from(other),
    }
}

fn not_found(kind: &str, namespace: &str, id: &str) -> StoreError {
    StoreError::NotFound {
        urn: urn_text(namespace, kind, id),
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    #[instrument(skip(self, doc), fields(kind = %doc.kind, id = %doc.id))]
    async fn insert(&self, doc: Document) -> StoreResult<Document> {
        let full_text = self.config.full_text;
        self.run("insert", move |state| {
            state.ensure_kind(&doc.kind, full_text)?;
            let table = sql::table(&doc.kind)?;
            debug!("inserting document");

            state
                .conn
                .execute(
                    &format!("INSERT INTO \"{table}\" ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
                    params![
                        doc.id,
                        doc.namespace,
                        doc.state,
                        doc.data,
                        doc.indexed_by,
                        doc.created_by,
                        doc.updated_by,
                        doc.created_at,
                        doc.updated_at,
                    ],
                )
                .map_err(|e| insert_error(e, &doc))?;

            Ok(doc)
        })
        .await
    }

    #[instrument(skip(self, doc), fields(kind = %doc.kind, id = %doc.id))]
    async fn update(&self, doc: Document, expected_version: i64) -> StoreResult<Document> {
        let full_text = self.config.full_text;
        self.run("update", move |state| {
            state.ensure_kind(&doc.kind, full_text)?;
            let table = sql::table(&doc.kind)?;
            let tx = state.conn.transaction()?;

            let changed = tx.execute(
                &format!(
                    "UPDATE \"{table}\" SET namespace = ?1, state = ?2, data = ?3, indexed_by = ?4, \
                     updated_by = ?5, updated_at = ?6 WHERE id = ?7 AND updated_at = ?8"
                ),
                params![
                    doc.namespace,
                    doc.state,
                    doc.data,
                    doc.indexed_by,
                    doc.updated_by,
                    doc.updated_at,
                    doc.id,
                    expected_version,
                ],
            )?;

            if changed == 0 {
                let exists = fetch_row(&tx, &doc.kind, &doc.id)?.is_some();
                return Err(if exists {
                    warn!("version conflict");
                    StoreError::Conflict {
                        urn: doc.urn_string(),
                    }
                } else {
                    not_found(&doc.kind, &doc.namespace, &doc.id)
                });
            }

            let stored = fetch_row(&tx, &doc.kind, &doc.id)?
                .ok_or_else(|| not_found(&doc.kind, &doc.namespace, &doc.id))?;
            tx.commit()?;
            debug!(version = stored.updated_at, "document updated");
            Ok(stored)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn fetch(&self, kind: &str, id: &str) -> StoreResult<Document> {
        let (kind, id) = (kind.to_string(), id.to_string());
        let full_text = self.config.full_text;
        self.run("fetch", move |state| {
            state.ensure_kind(&kind, full_text)?;
            fetch_row(&state.conn, &kind, &id)?.ok_or_else(|| StoreError::NotFound {
                urn: format!("urn:*:{kind}:{id}"),
            })
        })
        .await
    }

    #[instrument(skip(self))]
    async fn delete(&self, kind: &str, id: &str) -> StoreResult<Document> {
        let (kind, id) = (kind.to_string(), id.to_string());
        let full_text = self.config.full_text;
        self.run("delete", move |state| {
            state.ensure_kind(&kind, full_text)?;
            let table = sql::table(&kind)?;
            let tx = state.conn.transaction()?;

            let existing = fetch_row(&tx, &kind, &id)?.ok_or_else(|| StoreError::NotFound {
                urn: format!("urn:*:{kind}:{id}"),
            })?;
            tx.execute(&format!("DELETE FROM \"{table}\" WHERE id = ?1"), params![id])?;
            tx.commit()?;

            debug!("document deleted");
            Ok(existing)
        })
        .await
    }

    #[instrument(skip(self, query), fields(query = %query))]
    async fn search(&self, kind: &str, query: &Query) -> StoreResult<Vec<Document>> {
        let full_text = self.config.full_text;
        let stmt = sql::select(kind, query, full_text)?;
        let kind = kind.to_string();
        self.run("search", move |state| {
            state.ensure_kind(&kind, full_text)?;
            debug!(sql = %stmt.sql, "executing search");
            let mut prepared = state.conn.prepare(&stmt.sql)?;
            let rows = prepared
                .query_map(params_from_iter(stmt.params.iter()), |row| read_row(&kind, row))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    #[instrument(skip(self, query), fields(query = %query))]
    async fn count(&self, kind: &str, query: &Query) -> StoreResult<u64> {
        let full_text = self.config.full_text;
        let stmt = sql::count(kind, query, full_text)?;
        let kind = kind.to_string();
        self.run("count", move |state| {
            state.ensure_kind(&kind, full_text)?;
            let n: i64 = state.conn.query_row(
                &stmt.sql,
                params_from_iter(stmt.params.iter()),
                |row| row.get(0),
            )?;
            Ok(u64::try_from(n).unwrap_or(0))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn doc(kind: &str, id: &str, version: i64) -> Document {
        Document {
            kind: kind.to_string(),
            id: id.to_string(),
            namespace: "acme".to_string(),
            state: "active".to_string(),
            data: r#"{"name":"Alice"}"#.to_string(),
            indexed_by: None,
            created_by: "tester".to_string(),
            updated_by: "tester".to_string(),
            created_at: version,
            updated_at: version,
        }
    }

    #[tokio::test]
    async fn tables_are_created_on_first_use() {
        let store = SqliteStore::in_memory().unwrap();
        let err = store.fetch("person", "0123456789abcdefghij").await.unwrap_err();
        assert!(err.is_not_found());

        store.insert(doc("person", "0123456789abcdefghij", 1)).await.unwrap();
        let loaded = store.fetch("person", "0123456789abcdefghij").await.unwrap();
        assert_eq!(loaded, doc("person", "0123456789abcdefghij", 1));
    }

    #[tokio::test]
    async fn unsafe_kind_is_rejected_before_sql() {
        let store = SqliteStore::in_memory().unwrap();
        let err = store.fetch("person; DROP TABLE x", "id").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidFormat(_)));
    }

    #[tokio::test]
    async fn file_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.db");

        {
            let store = SqliteStore::open(StoreConfig::at_path(&path)).unwrap();
            store.insert(doc("person", "0123456789abcdefghij", 7)).await.unwrap();
        }

        let store = SqliteStore::open(StoreConfig::at_path(&path)).unwrap();
        let loaded = store.fetch("person", "0123456789abcdefghij").await.unwrap();
        assert_eq!(loaded.updated_at, 7);
    }

    #[tokio::test]
    async fn init_kinds_creates_tables_up_front() {
        let store = SqliteStore::in_memory().unwrap();
        store.init_kinds(["person", "company"]).await.unwrap();
        assert_eq!(store.count("company", &Query::new()).await.unwrap(), 0);
        assert!(store.init_kinds(["Bad Kind"]).await.is_err());
    }

    #[tokio::test]
    async fn keyword_kinds_are_quoted() {
        let store = SqliteStore::in_memory().unwrap();
        let mut order = doc("order", "0123456789abcdefghij", 1);
        order.data = r#"{"item":"lamp"}"#.to_string();
        store.insert(order).await.unwrap();

        let q = Query::new().matching("lamp").filter("item", "lamp");
        let rows = store.search("order", &q).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(store.count("group", &Query::new()).await.unwrap(), 0);
    }

    /// Counts a recursive CTE far too long to finish uninterrupted.
    const SLOW_SQL: &str = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
                            SELECT COUNT(*) FROM (SELECT x FROM c LIMIT 5000000000)";

    /// Second handle on the same connection with its own settings.
    fn sharing(store: &SqliteStore, config: StoreConfig) -> SqliteStore {
        SqliteStore {
            inner: Arc::clone(&store.inner),
            config,
        }
    }

    async fn slow_statement(store: &SqliteStore) -> StoreResult<i64> {
        store
            .run("slow", |state| {
                let n = state.conn.query_row(SLOW_SQL, [], |row| row.get(0))?;
                Ok(n)
            })
            .await
    }

    #[tokio::test]
    async fn deadline_interrupts_running_statement() {
        let store = SqliteStore::open(
            StoreConfig::in_memory().with_op_timeout(Duration::from_millis(1)),
        )
        .unwrap();

        let err = slow_statement(&store).await.unwrap_err();
        assert!(
            matches!(err, StoreError::Timeout { ref operation, .. } if operation == "slow"),
            "got {err:?}"
        );

        // Once interrupted the statement gives the connection back.
        let relaxed = sharing(&store, StoreConfig::in_memory());
        let n = tokio::time::timeout(
            Duration::from_secs(20),
            relaxed.count("person", &Query::new()),
        )
        .await
        .expect("connection still held by the timed-out statement")
        .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn queued_call_past_deadline_never_runs() {
        let store = SqliteStore::in_memory().unwrap();
        store.init_kinds(["person"]).await.unwrap();

        let holder = sharing(
            &store,
            StoreConfig::in_memory().with_op_timeout(Duration::from_millis(300)),
        );
        let slow = tokio::spawn(async move { slow_statement(&holder).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let hasty = sharing(
            &store,
            StoreConfig::in_memory().with_op_timeout(Duration::from_millis(1)),
        );
        let err = hasty
            .insert(doc("person", "0123456789abcdefghij", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Timeout { .. }), "got {err:?}");

        // The queued insert's deadline must not interrupt the statement
        // that holds the connection; that one runs into its own deadline.
        let err = slow.await.unwrap().unwrap_err();
        assert!(
            matches!(err, StoreError::Timeout { ref operation, .. } if operation == "slow"),
            "got {err:?}"
        );

        let n = tokio::time::timeout(Duration::from_secs(20), store.count("person", &Query::new()))
            .await
            .expect("connection still held")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn only_primary_key_clash_is_already_exists() {
        let row = doc("person", "0123456789abcdefghij", 1);
        let failure = |code| rusqlite::Error::SqliteFailure(ffi::Error::new(code), None);

        let err = insert_error(failure(ffi::SQLITE_CONSTRAINT_PRIMARYKEY), &row);
        assert!(matches!(err, StoreError::AlreadyExists { .. }), "got {err:?}");

        let err = insert_error(failure(ffi::SQLITE_CONSTRAINT_NOTNULL), &row);
        assert!(matches!(err, StoreError::Backend(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn full_text_enabled_later_finds_existing_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        {
            let store =
                SqliteStore::open(StoreConfig::at_path(&path).with_full_text(false)).unwrap();
            store.insert(doc("app", "0123456789abcdefghij", 1)).await.unwrap();
        }

        let store = SqliteStore::open(StoreConfig::at_path(&path)).unwrap();
        let q = Query::new().matching("alice");
        assert_eq!(store.count("app", &q).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn kind_named_like_shadow_table_is_usable() {
        let store = SqliteStore::in_memory().unwrap();
        store.insert(doc("app", "0123456789abcdefghij", 1)).await.unwrap();
        store.insert(doc("app_fts", "0123456789abcdefghij", 1)).await.unwrap();
        store
            .insert(doc("idx_app_state", "0123456789abcdefghij", 1))
            .await
            .unwrap();

        for kind in ["app", "app_fts", "idx_app_state"] {
            let q = Query::new().matching("alice");
            assert_eq!(store.count(kind, &q).await.unwrap(), 1, "kind {kind}");
        }
    }

    #[tokio::test]
    async fn generous_deadline_does_not_fire() {
        let store = SqliteStore::open(
            StoreConfig::in_memory().with_op_timeout(Duration::from_secs(30)),
        )
        .unwrap();
        store.insert(doc("person", "0123456789abcdefghij", 1)).await.unwrap();
        assert_eq!(store.count("person", &Query::new()).await.unwrap(), 1);
    }
}
