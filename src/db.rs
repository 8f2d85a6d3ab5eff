//! Per-repository metadata DB (C4): the relational schema of spec §3/§6.2,
//! plus an explicit outermost-transaction API.
//!
//! Nested structural changes collapse into a single transaction by
//! construction: [`Txn`] is acquired once at the outermost call site and
//! passed by reference into every nested helper (`blocks::commit`,
//! `vfs::create_file`, …); none of those helpers ever call `begin` itself,
//! so there is nothing to "collapse" — they simply never open a second
//! transaction. This replaces the teacher's lack of transactions entirely
//! (the teacher rewrites the whole vault file on every mutation) and
//! implements the "manual depth counter is fragile" redesign note in spec §9
//! by making a second `BEGIN` impossible to express rather than something to
//! detect at runtime.

use crate::error::{Result, VaultError};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::error;

pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS schema_meta (
        version INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS files (
        id                  INTEGER PRIMARY KEY AUTOINCREMENT,
        parent_id           INTEGER REFERENCES files(id) ON DELETE CASCADE,
        name_ciphertext     BLOB NOT NULL,
        name_nonce          BLOB NOT NULL,
        is_directory        INTEGER NOT NULL,
        logical_size        INTEGER NOT NULL DEFAULT 0,
        comment_ciphertext  BLOB,
        comment_nonce       BLOB,
        created_at          TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_files_parent_id ON files(parent_id);

    CREATE TABLE IF NOT EXISTS blocks (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        content_hash    BLOB NOT NULL UNIQUE,
        relative_path   TEXT NOT NULL,
        stored_size     INTEGER NOT NULL,
        salt            BLOB NOT NULL,
        nonce           BLOB NOT NULL,
        refcount        INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_blocks_hash ON blocks(content_hash);

    CREATE TABLE IF NOT EXISTS file_blocks (
        file_id     INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
        block_id    INTEGER NOT NULL REFERENCES blocks(id),
        order_index INTEGER NOT NULL,
        PRIMARY KEY (file_id, order_index)
    );
    CREATE INDEX IF NOT EXISTS idx_file_blocks_file_id ON file_blocks(file_id);

    CREATE TABLE IF NOT EXISTS repo_stats (
        id          INTEGER PRIMARY KEY CHECK (id = 1),
        used_bytes  INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS operations (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        kind            TEXT NOT NULL CHECK (kind IN ('import', 'export')),
        status          TEXT NOT NULL CHECK (status IN ('pending', 'processing', 'cancelling', 'completed', 'failed')),
        sources         TEXT NOT NULL,
        destination     TEXT NOT NULL,
        total_bytes     INTEGER NOT NULL DEFAULT 0,
        processed_bytes INTEGER NOT NULL DEFAULT 0,
        error           TEXT,
        created_at      TEXT NOT NULL,
        updated_at      TEXT NOT NULL
    );
";

/// Owns the single connection to `<repo>/.vault/vault.db`. All structural
/// writes go through [`Db::begin`]; plain reads may use [`Db::conn_for_read`].
pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA_SQL)?;

        let version: Option<i64> = conn
            .query_row("SELECT version FROM schema_meta LIMIT 1", [], |r| r.get(0))
            .ok();
        match version {
            None => {
                conn.execute("INSERT INTO schema_meta (version) VALUES (?1)", [SCHEMA_VERSION])?;
            }
            Some(v) if v != SCHEMA_VERSION => {
                return Err(crate::error::VaultError::IoFailure {
                    reason: format!("unsupported schema version {v}, expected {SCHEMA_VERSION}"),
                });
            }
            Some(_) => {}
        }

        conn.execute("INSERT OR IGNORE INTO repo_stats (id, used_bytes) VALUES (1, 0)", [])?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Opens the single outermost transaction. Hold the returned [`Txn`] for
    /// the lifetime of the whole structural change and pass `txn.conn()`
    /// into every nested helper — do not call `begin` again from within.
    pub fn begin(&self) -> Result<Txn<'_>> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Txn { conn, committed: false })
    }

    /// A lock-guarded connection for read-only queries that don't need
    /// transactional atomicity (e.g. `list_children`, `poll`).
    pub fn conn_for_read(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("db mutex poisoned")
    }
}

pub struct Txn<'a> {
    conn: MutexGuard<'a, Connection>,
    committed: bool,
}

impl<'a> Txn<'a> {
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn commit(mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        self.committed = true;
        Ok(())
    }
}

impl<'a> Drop for Txn<'a> {
    fn drop(&mut self) {
        if !self.committed {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Import,
    Export,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Import => "import",
            OpKind::Export => "export",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Pending,
    Processing,
    Cancelling,
    Completed,
    Failed,
}

impl OpStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OpStatus::Pending => "pending",
            OpStatus::Processing => "processing",
            OpStatus::Cancelling => "cancelling",
            OpStatus::Completed => "completed",
            OpStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "processing" => OpStatus::Processing,
            "cancelling" => OpStatus::Cancelling,
            "completed" => OpStatus::Completed,
            "failed" => OpStatus::Failed,
            _ => OpStatus::Pending,
        }
    }
}

/// Cached sum of `stored_size` over live blocks, maintained transactionally
/// alongside `blocks` inserts/deletes (see `blocks::commit`/`release`) so
/// quota checks don't need a full-table `SUM` on every commit.
pub fn used_bytes(conn: &Connection) -> Result<u64> {
    let v: i64 = conn.query_row("SELECT used_bytes FROM repo_stats WHERE id = 1", [], |r| r.get(0))?;
    Ok(v as u64)
}

pub fn adjust_used_bytes(conn: &Connection, delta: i64) -> Result<()> {
    conn.execute("UPDATE repo_stats SET used_bytes = used_bytes + ?1 WHERE id = 1", params![delta])?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct OperationRecord {
    pub id: u64,
    pub kind: OpKind,
    pub status: OpStatus,
    pub sources: String,
    pub destination: String,
    pub total_bytes: u64,
    pub processed_bytes: u64,
    pub error: Option<String>,
}

/// Creates an `operations` row in `pending` status. `sources`/`destination`
/// are free-form display strings (host paths or virtual paths joined with
/// `;`) — they are never parsed back, only shown by `poll`.
pub fn create_operation(
    db: &Db,
    kind: OpKind,
    sources: &str,
    destination: &str,
    total_bytes: u64,
) -> Result<u64> {
    let conn = db.conn_for_read();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO operations (kind, status, sources, destination, total_bytes, processed_bytes, error, created_at, updated_at) \
         VALUES (?1, 'pending', ?2, ?3, ?4, 0, NULL, ?5, ?5)",
        params![kind.as_str(), sources, destination, total_bytes as i64, now],
    )?;
    Ok(conn.last_insert_rowid() as u64)
}

pub fn set_operation_status(db: &Db, id: u64, status: OpStatus) -> Result<()> {
    let conn = db.conn_for_read();
    conn.execute(
        "UPDATE operations SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status.as_str(), Utc::now().to_rfc3339(), id as i64],
    )?;
    Ok(())
}

pub fn update_operation_progress(db: &Db, id: u64, processed_bytes: u64) -> Result<()> {
    let conn = db.conn_for_read();
    conn.execute(
        "UPDATE operations SET processed_bytes = ?1, updated_at = ?2 WHERE id = ?3",
        params![processed_bytes as i64, Utc::now().to_rfc3339(), id as i64],
    )?;
    Ok(())
}

pub fn fail_operation(db: &Db, id: u64, error_msg: &str) -> Result<()> {
    let conn = db.conn_for_read();
    conn.execute(
        "UPDATE operations SET status = 'failed', error = ?1, updated_at = ?2 WHERE id = ?3",
        params![error_msg, Utc::now().to_rfc3339(), id as i64],
    )?;
    error!(operation_id = id, reason = error_msg, "operation failed");
    Ok(())
}

pub fn get_operation(db: &Db, id: u64) -> Result<OperationRecord> {
    let conn = db.conn_for_read();
    conn.query_row(
        "SELECT id, kind, status, sources, destination, total_bytes, processed_bytes, error \
         FROM operations WHERE id = ?1",
        params![id as i64],
        row_to_operation,
    )
    .optional()?
    .ok_or_else(|| VaultError::NotFound { what: format!("operation {id}") })
}

/// Rows left `processing` or `cancelling` by a process that never returned —
/// the crash-recovery sweep in `Core::open_repo` marks each one `failed`.
pub fn list_unfinished_operations(db: &Db) -> Result<Vec<OperationRecord>> {
    let conn = db.conn_for_read();
    let mut stmt = conn.prepare(
        "SELECT id, kind, status, sources, destination, total_bytes, processed_bytes, error \
         FROM operations WHERE status IN ('processing', 'cancelling')",
    )?;
    let rows = stmt.query_map([], row_to_operation)?.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn row_to_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<OperationRecord> {
    let kind: String = row.get(1)?;
    let status: String = row.get(2)?;
    Ok(OperationRecord {
        id: row.get::<_, i64>(0)? as u64,
        kind: if kind == "export" { OpKind::Export } else { OpKind::Import },
        status: OpStatus::from_str(&status),
        sources: row.get(3)?,
        destination: row.get(4)?,
        total_bytes: row.get::<_, i64>(5)? as u64,
        processed_bytes: row.get::<_, i64>(6)? as u64,
        error: row.get(7)?,
    })
}
