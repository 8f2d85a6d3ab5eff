//! Export pipeline (C8): vault → host filesystem.
//!
//! Selected ids are flattened to a list of `(virtual relative path, file
//! row)` leaves; directories contribute their files recursively, preserving
//! the tree under `dest`. Each leaf's blocks are read and decrypted on the
//! rayon pool and written out in order — a `MissingBlob` is a hard failure,
//! never silently zero-filled.

use crate::blocks::BlockManager;
use crate::db::{self, Db, OpKind, OpStatus};
use crate::error::Result;
use crate::vfs::{Vfs, VirtualFile};
use rayon::prelude::*;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

pub struct ExportOutcome {
    pub operation_id: u64,
    pub written_paths: Vec<PathBuf>,
}

/// Exports `file_ids` (files or directories) under `dest`. Cancellation is
/// polled between leaf files, matching import's per-file atomicity unit.
pub fn export(
    db: &Db,
    blocks: &BlockManager,
    vfs: &Vfs,
    file_ids: &[u64],
    dest: &Path,
    cancel: &AtomicBool,
) -> Result<ExportOutcome> {
    let conn = db.conn_for_read();
    let mut leaves = Vec::new();
    for &id in file_ids {
        let root = vfs.get_file(&conn, id)?;
        collect_leaves(&conn, vfs, &root, PathBuf::new(), &mut leaves)?;
    }
    drop(conn);

    let total_bytes: u64 = leaves.iter().map(|(_, f)| f.logical_size).sum();
    let sources_display = file_ids.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(";");
    let operation_id = db::create_operation(db, OpKind::Export, &sources_display, &dest.display().to_string(), total_bytes)?;
    db::set_operation_status(db, operation_id, OpStatus::Processing)?;

    let mut written = Vec::with_capacity(leaves.len());
    let mut processed_bytes: u64 = 0;
    let mut used_host_paths = std::collections::HashSet::new();

    for (relative, file) in &leaves {
        if cancel.load(Ordering::SeqCst) {
            db::set_operation_status(db, operation_id, OpStatus::Failed)?;
            return Err(crate::error::VaultError::Interrupted);
        }

        let out_path = unique_host_path(dest, relative, &used_host_paths);
        if let Err(e) = export_one_file(db, blocks, file.id, &out_path) {
            let _ = db::fail_operation(db, operation_id, &e.to_string());
            return Err(e);
        }
        used_host_paths.insert(out_path.clone());
        written.push(out_path);

        processed_bytes += file.logical_size;
        db::update_operation_progress(db, operation_id, processed_bytes)?;
    }

    db::set_operation_status(db, operation_id, OpStatus::Completed)?;
    Ok(ExportOutcome { operation_id, written_paths: written })
}

fn collect_leaves(
    conn: &rusqlite::Connection,
    vfs: &Vfs,
    node: &VirtualFile,
    prefix: PathBuf,
    out: &mut Vec<(PathBuf, VirtualFile)>,
) -> Result<()> {
    let here = prefix.join(&node.name);
    if node.is_directory {
        for child in vfs.list_children(conn, Some(node.id))? {
            collect_leaves(conn, vfs, &child, here.clone(), out)?;
        }
    } else {
        out.push((here, node.clone()));
    }
    Ok(())
}

fn export_one_file(db: &Db, blocks: &BlockManager, file_id: u64, out_path: &Path) -> Result<()> {
    let rows = {
        let conn = db.conn_for_read();
        let mut stmt = conn.prepare("SELECT block_id FROM file_blocks WHERE file_id = ?1 ORDER BY order_index")?;
        let block_ids: Vec<u64> = stmt
            .query_map(rusqlite::params![file_id as i64], |r| r.get::<_, i64>(0))?
            .map(|r| r.map(|v| v as u64))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        block_ids.iter().map(|&id| crate::blocks::get_by_id(&conn, id)).collect::<Result<Vec<_>>>()?
    };

    let plaintexts: Vec<Vec<u8>> = rows.par_iter().map(|row| blocks.read(row)).collect::<Result<Vec<_>>>()?;

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::File::create(out_path)?;
    for chunk in &plaintexts {
        f.write_all(chunk)?;
    }
    Ok(())
}

/// `"name.ext"`, `"name (1).ext"`, … — applied to the destination host path,
/// checking both the filesystem and names already written this run (the
/// latter matters because the filesystem check alone races against our own
/// just-created files when two leaves share a basename).
fn unique_host_path(dest: &Path, relative: &Path, used: &std::collections::HashSet<PathBuf>) -> PathBuf {
    let candidate = dest.join(relative);
    if !candidate.exists() && !used.contains(&candidate) {
        return candidate;
    }

    let stem = relative.file_stem().and_then(|s| s.to_str()).unwrap_or("file");
    let ext = relative.extension().and_then(|s| s.to_str());
    let parent = relative.parent().unwrap_or_else(|| Path::new(""));

    let mut n = 1u32;
    loop {
        let name = match ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = dest.join(parent).join(name);
        if !candidate.exists() && !used.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KEY_LEN;
    use crate::import;
    use std::sync::atomic::AtomicBool;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Db, BlockManager, Vfs) {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".vault")).unwrap();
        let db = Db::open(&dir.path().join(".vault").join("vault.db")).unwrap();
        let key = [5u8; KEY_LEN];
        let bm = BlockManager::new(dir.path(), key);
        let vfs = Vfs::new(&key).unwrap();
        (dir, db, bm, vfs)
    }

    #[test]
    fn round_trips_single_file_bytes() {
        let (dir, db, bm, vfs) = setup();
        let src = dir.path().join("in.txt");
        std::fs::write(&src, b"round trip me").unwrap();

        let cancel = AtomicBool::new(false);
        let imported = import::import(&db, &bm, &vfs, 1 << 30, &[src], None, &cancel).unwrap();

        let out_dir = dir.path().join("out");
        std::fs::create_dir(&out_dir).unwrap();
        let exported = export(&db, &bm, &vfs, &imported.imported_file_ids, &out_dir, &cancel).unwrap();

        assert_eq!(exported.written_paths.len(), 1);
        let content = std::fs::read(&exported.written_paths[0]).unwrap();
        assert_eq!(content, b"round trip me");
    }

    #[test]
    fn exports_directory_tree_preserving_structure() {
        let (dir, db, bm, vfs) = setup();
        let src_dir = dir.path().join("proj");
        std::fs::create_dir_all(src_dir.join("sub")).unwrap();
        std::fs::write(src_dir.join("a.txt"), b"aaa").unwrap();
        std::fs::write(src_dir.join("sub").join("b.txt"), b"bbb").unwrap();

        let cancel = AtomicBool::new(false);
        let imported = import::import(&db, &bm, &vfs, 1 << 30, &[src_dir], None, &cancel).unwrap();

        let out_dir = dir.path().join("restored");
        std::fs::create_dir(&out_dir).unwrap();
        let exported = export(&db, &bm, &vfs, &imported.imported_file_ids, &out_dir, &cancel).unwrap();

        assert!(exported.written_paths.iter().any(|p| p.ends_with("sub/b.txt") || p.ends_with("sub\\b.txt")));
        let op = db::get_operation(&db, exported.operation_id).unwrap();
        assert_eq!(op.status, OpStatus::Completed);
    }

    #[test]
    fn missing_blob_is_a_hard_failure() {
        let (dir, db, bm, vfs) = setup();
        let src = dir.path().join("in.txt");
        std::fs::write(&src, b"data").unwrap();
        let cancel = AtomicBool::new(false);
        let imported = import::import(&db, &bm, &vfs, 1 << 30, &[src], None, &cancel).unwrap();

        std::fs::remove_dir_all(dir.path().join(".vault").join("blocks")).unwrap();

        let out_dir = dir.path().join("out");
        std::fs::create_dir(&out_dir).unwrap();
        let err = export(&db, &bm, &vfs, &imported.imported_file_ids, &out_dir, &cancel).unwrap_err();
        assert!(matches!(err, crate::error::VaultError::MissingBlob { .. }));
    }
}
