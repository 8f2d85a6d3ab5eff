//! Import pipeline (C7): host filesystem → vault.
//!
//! Per host file: stream 4 MiB chunks, `prepare` each on the rayon pool (pure,
//! no lock contention), then commit the whole file — every chunk's block and
//! the file's own row and edges — under a single [`Txn`]. A file either
//! appears completely or not at all; files before it in the same import stay
//! committed if a later one fails or the quota is hit.

use crate::blocks::{BlockManager, PreparedBlock};
use crate::db::{self, Db, OpKind, OpStatus};
use crate::error::{Result, VaultError};
use crate::vfs::Vfs;
use rayon::prelude::*;
use rusqlite::OptionalExtension;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use walkdir::WalkDir;

pub const CHUNK_SIZE: usize = 4 * 1024 * 1024;

pub struct ImportOutcome {
    pub operation_id: u64,
    pub imported_file_ids: Vec<u64>,
}

/// Imports `sources` (files or directories, walked recursively) as children
/// of `parent_id`. Cooperative cancellation is polled between files, never
/// mid-file — a file is the smallest unit of atomicity.
pub fn import(
    db: &Db,
    blocks: &BlockManager,
    vfs: &Vfs,
    quota_bytes: u64,
    sources: &[PathBuf],
    parent_id: Option<u64>,
    cancel: &AtomicBool,
) -> Result<ImportOutcome> {
    let host_files = enumerate_files(sources);
    let total_bytes: u64 = host_files.iter().filter_map(|p| p.metadata().ok()).map(|m| m.len()).sum();

    let sources_display = sources.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(";");
    let operation_id = db::create_operation(db, OpKind::Import, &sources_display, "<vault>", total_bytes)?;
    db::set_operation_status(db, operation_id, OpStatus::Processing)?;

    let mut imported = Vec::with_capacity(host_files.len());
    let mut processed_bytes: u64 = 0;

    for host_path in &host_files {
        if cancel.load(Ordering::SeqCst) {
            db::set_operation_status(db, operation_id, OpStatus::Failed)?;
            return Err(VaultError::Interrupted);
        }

        let file_id = import_one_file(db, blocks, vfs, quota_bytes, parent_id, host_path).map_err(|e| {
            let _ = db::fail_operation(db, operation_id, &e.to_string());
            e
        })?;

        imported.push(file_id);
        processed_bytes += host_path.metadata().map(|m| m.len()).unwrap_or(0);
        db::update_operation_progress(db, operation_id, processed_bytes)?;
    }

    db::set_operation_status(db, operation_id, OpStatus::Completed)?;
    Ok(ImportOutcome { operation_id, imported_file_ids: imported })
}

fn enumerate_files(sources: &[PathBuf]) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for src in sources {
        if src.is_dir() {
            for entry in WalkDir::new(src).into_iter().filter_map(|e| e.ok()) {
                if entry.file_type().is_file() {
                    out.push(entry.path().to_path_buf());
                }
            }
        } else {
            out.push(src.clone());
        }
    }
    out
}

fn import_one_file(
    db: &Db,
    blocks: &BlockManager,
    vfs: &Vfs,
    quota_bytes: u64,
    parent_id: Option<u64>,
    host_path: &Path,
) -> Result<u64> {
    let chunks = read_chunks(host_path)?;
    let size: u64 = chunks.iter().map(|c| c.len() as u64).sum();

    let prepared: Vec<PreparedBlock> = chunks.par_iter().map(|c| blocks.prepare(c)).collect::<Result<Vec<_>>>()?;

    let txn = db.begin()?;
    let mut current_used = crate::db::used_bytes(txn.conn())?;
    let mut block_ids = Vec::with_capacity(prepared.len());
    let mut new_blob_paths: Vec<PathBuf> = Vec::new();

    for p in prepared {
        let needed = p.ciphertext.len() as u64;
        let dedup_hit = block_exists(txn.conn(), &p.hash)?;
        if !dedup_hit && current_used + needed > quota_bytes {
            for path in &new_blob_paths {
                let _ = std::fs::remove_file(path);
            }
            return Err(VaultError::QuotaExceeded { used: current_used, needed, quota: quota_bytes });
        }
        let relative_path = p.relative_path.clone();
        let (block, is_new) = blocks.commit(&txn, p)?;
        if is_new {
            current_used += block.stored_size;
            new_blob_paths.push(blocks.blob_path(&relative_path));
        }
        block_ids.push(block.id);
    }

    let desired_name = host_path.file_name().and_then(|s| s.to_str()).unwrap_or("file").to_string();
    let name = unique_sibling_name(vfs, txn.conn(), parent_id, &desired_name)?;
    let file_id = vfs.create_file(&txn, parent_id, &name, size, &block_ids)?;

    txn.commit()?;
    Ok(file_id)
}

fn read_chunks(path: &Path) -> Result<Vec<Vec<u8>>> {
    let mut f = std::fs::File::open(path)?;
    let mut chunks = Vec::new();
    loop {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut filled = 0;
        while filled < buf.len() {
            let n = f.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        buf.truncate(filled);
        let done = filled < CHUNK_SIZE;
        chunks.push(buf);
        if done {
            break;
        }
    }
    Ok(chunks)
}

fn block_exists(conn: &rusqlite::Connection, hash: &[u8; 32]) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM blocks WHERE content_hash = ?1", rusqlite::params![&hash[..]], |r| r.get(0))
        .optional()?;
    Ok(found.is_some())
}

/// `"name.ext"`, `"name (1).ext"`, `"name (2).ext"`, … — the same collision
/// policy `export` uses for host filenames, applied here to virtual siblings.
pub fn unique_sibling_name(
    vfs: &Vfs,
    conn: &rusqlite::Connection,
    parent_id: Option<u64>,
    desired: &str,
) -> Result<String> {
    let siblings = vfs.list_children(conn, parent_id)?;
    let taken: std::collections::HashSet<&str> = siblings.iter().map(|f| f.name.as_str()).collect();
    if !taken.contains(desired) {
        return Ok(desired.to_string());
    }

    let path = Path::new(desired);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(desired);
    let ext = path.extension().and_then(|s| s.to_str());

    let mut n = 1u32;
    loop {
        let candidate = match ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        if !taken.contains(candidate.as_str()) {
            return Ok(candidate);
        }
        n += 1;
    }
}
