//! Block manager (C5): the deduplicating content-addressed store over
//! encrypted opaque blobs. `prepare` is pure and safe to run on a worker
//! pool; `commit`/`release` must be serialized through the caller's [`Txn`].
//!
//! Blob paths are chosen from a fresh UUID, never from the content hash, so
//! a filesystem observer cannot correlate two blobs sharing a hash with the
//! same plaintext out-of-band — the hash↔path mapping lives only in the
//! encrypted-at-rest metadata DB.

use crate::crypto::{self, KEY_LEN, NONCE_LEN, SALT_LEN};
use crate::db::{self, Txn};
use crate::error::{Result, VaultError};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use tracing::error;

#[derive(Debug, Clone)]
pub struct PreparedBlock {
    pub hash: [u8; 32],
    pub salt: [u8; SALT_LEN],
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub relative_path: PathBuf,
    pub original_len: u64,
}

#[derive(Debug, Clone)]
pub struct BlockRow {
    pub id: u64,
    pub content_hash: [u8; 32],
    pub relative_path: PathBuf,
    pub stored_size: u64,
    pub salt: [u8; SALT_LEN],
    pub nonce: [u8; NONCE_LEN],
    pub refcount: u64,
}

pub struct BlockManager {
    blocks_dir: PathBuf,
    master_key: [u8; KEY_LEN],
}

impl BlockManager {
    pub fn new(repo_root: &Path, master_key: [u8; KEY_LEN]) -> Self {
        Self { blocks_dir: repo_root.join(".vault").join("blocks"), master_key }
    }

    /// Pure, no DB or disk access. Safe to call concurrently from a worker
    /// pool — it touches no shared state.
    pub fn prepare(&self, plaintext: &[u8]) -> Result<PreparedBlock> {
        let hash = crypto::keyed_hash(&self.master_key, plaintext);
        let salt = crypto::random_bytes::<SALT_LEN>();
        let key = crypto::block_key(&self.master_key, &salt)?;
        let nonce = crypto::random_bytes::<NONCE_LEN>();
        let ciphertext = crypto::aead_seal(&key, &nonce, plaintext)?;

        let id = uuid::Uuid::new_v4().simple().to_string();
        let relative_path = PathBuf::from(&id[0..2]).join(&id[2..4]).join(&id);

        Ok(PreparedBlock {
            hash,
            salt,
            nonce,
            ciphertext,
            relative_path,
            original_len: plaintext.len() as u64,
        })
    }

    /// Must be serialized with respect to other commits via `txn`. Returns
    /// the committed row and whether it was newly inserted (`false` means a
    /// dedup hit: `prepared`'s ciphertext is discarded, refcount bumped).
    pub fn commit(&self, txn: &Txn<'_>, prepared: PreparedBlock) -> Result<(BlockRow, bool)> {
        let conn = txn.conn();

        if let Some(mut existing) = find_by_hash(conn, &prepared.hash)? {
            conn.execute("UPDATE blocks SET refcount = refcount + 1 WHERE id = ?1", params![existing.id as i64])?;
            crypto::zeroize_vec(prepared.ciphertext);
            existing.refcount += 1;
            return Ok((existing, false));
        }

        let abs_path = self.blocks_dir.join(&prepared.relative_path);
        if let Some(parent) = abs_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&abs_path, &prepared.ciphertext)?;

        let insert = conn.execute(
            "INSERT INTO blocks (content_hash, relative_path, stored_size, salt, nonce, refcount) \
             VALUES (?1, ?2, ?3, ?4, ?5, 1)",
            params![
                &prepared.hash[..],
                prepared.relative_path.to_string_lossy(),
                prepared.ciphertext.len() as i64,
                &prepared.salt[..],
                &prepared.nonce[..],
            ],
        );
        let id = match insert {
            Ok(_) => conn.last_insert_rowid() as u64,
            Err(e) => {
                let _ = std::fs::remove_file(&abs_path);
                return Err(e.into());
            }
        };
        db::adjust_used_bytes(conn, prepared.ciphertext.len() as i64)?;

        Ok((
            BlockRow {
                id,
                content_hash: prepared.hash,
                stored_size: prepared.ciphertext.len() as u64,
                relative_path: prepared.relative_path,
                salt: prepared.salt,
                nonce: prepared.nonce,
                refcount: 1,
            },
            true,
        ))
    }

    /// Reads and decrypts a block's plaintext. `MissingBlob` if the file is
    /// absent; `CryptoFailure` on auth failure — never both at once.
    pub fn read(&self, block: &BlockRow) -> Result<Vec<u8>> {
        let abs_path = self.blocks_dir.join(&block.relative_path);
        let ciphertext = std::fs::read(&abs_path).map_err(|_| {
            error!(block_id = block.id, path = %abs_path.display(), "blob missing on disk");
            VaultError::MissingBlob { hash: hex::encode(block.content_hash), path: abs_path.clone() }
        })?;
        let key = crypto::block_key(&self.master_key, &block.salt)?;
        crypto::aead_open(&key, &block.nonce, &ciphertext)
    }

    /// Atomically decrements refcount; deletes the row and blob once it
    /// reaches zero. Returns whether the block was actually removed.
    pub fn release(&self, txn: &Txn<'_>, block_id: u64) -> Result<bool> {
        let conn = txn.conn();
        conn.execute("UPDATE blocks SET refcount = refcount - 1 WHERE id = ?1", params![block_id as i64])?;
        let block = get_by_id(conn, block_id)?;
        if block.refcount == 0 {
            conn.execute("DELETE FROM blocks WHERE id = ?1", params![block_id as i64])?;
            db::adjust_used_bytes(conn, -(block.stored_size as i64))?;
            let abs_path = self.blocks_dir.join(&block.relative_path);
            let _ = std::fs::remove_file(&abs_path);
            return Ok(true);
        }
        Ok(false)
    }

    /// Diagnostic only.
    pub fn exists_on_disk(&self, block: &BlockRow) -> bool {
        self.blocks_dir.join(&block.relative_path).exists()
    }

    /// Absolute path a blob at `relative_path` lives at. Lets callers clean
    /// up a blob written by `commit` whose enclosing transaction then rolled
    /// back (filesystem writes aren't part of the SQL transaction).
    pub fn blob_path(&self, relative_path: &Path) -> PathBuf {
        self.blocks_dir.join(relative_path)
    }
}

pub fn get_by_id(conn: &Connection, id: u64) -> Result<BlockRow> {
    conn.query_row(
        "SELECT id, content_hash, relative_path, stored_size, salt, nonce, refcount FROM blocks WHERE id = ?1",
        params![id as i64],
        row_to_block,
    )
    .optional()?
    .ok_or_else(|| VaultError::NotFound { what: format!("block {id}") })
}

fn find_by_hash(conn: &Connection, hash: &[u8; 32]) -> Result<Option<BlockRow>> {
    Ok(conn
        .query_row(
            "SELECT id, content_hash, relative_path, stored_size, salt, nonce, refcount FROM blocks WHERE content_hash = ?1",
            params![&hash[..]],
            row_to_block,
        )
        .optional()?)
}

fn row_to_block(row: &rusqlite::Row<'_>) -> rusqlite::Result<BlockRow> {
    let hash_vec: Vec<u8> = row.get(1)?;
    let path: String = row.get(2)?;
    let salt_vec: Vec<u8> = row.get(4)?;
    let nonce_vec: Vec<u8> = row.get(5)?;

    let mut content_hash = [0u8; 32];
    content_hash.copy_from_slice(&hash_vec);
    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&salt_vec);
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&nonce_vec);

    Ok(BlockRow {
        id: row.get::<_, i64>(0)? as u64,
        content_hash,
        relative_path: PathBuf::from(path),
        stored_size: row.get::<_, i64>(3)? as u64,
        salt,
        nonce,
        refcount: row.get::<_, i64>(6)? as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use tempfile::tempdir;

    fn open(dir: &Path) -> (Db, BlockManager) {
        let db = Db::open(&dir.join(".vault").join("vault.db")).unwrap();
        std::fs::create_dir_all(dir.join(".vault")).unwrap();
        let bm = BlockManager::new(dir, [7u8; KEY_LEN]);
        (db, bm)
    }

    #[test]
    fn commit_is_idempotent_on_dedup() {
        let dir = tempdir().unwrap();
        let (db, bm) = open(dir.path());

        let p1 = bm.prepare(b"hello world").unwrap();
        let p2 = bm.prepare(b"hello world").unwrap();
        assert_eq!(p1.hash, p2.hash);

        let txn = db.begin().unwrap();
        let (b1, is_new1) = bm.commit(&txn, p1).unwrap();
        let (b2, is_new2) = bm.commit(&txn, p2).unwrap();
        txn.commit().unwrap();

        assert!(is_new1);
        assert!(!is_new2);
        assert_eq!(b1.id, b2.id);
        assert_eq!(b2.refcount, 2);
        assert!(bm.exists_on_disk(&b1));
    }

    #[test]
    fn read_round_trips_and_release_reclaims() {
        let dir = tempdir().unwrap();
        let (db, bm) = open(dir.path());

        let prepared = bm.prepare(b"some content").unwrap();
        let txn = db.begin().unwrap();
        let (block, _) = bm.commit(&txn, prepared).unwrap();
        txn.commit().unwrap();

        assert_eq!(bm.read(&block).unwrap(), b"some content");

        let txn = db.begin().unwrap();
        let removed = bm.release(&txn, block.id).unwrap();
        txn.commit().unwrap();

        assert!(removed);
        assert!(!bm.exists_on_disk(&block));
    }

    #[test]
    fn release_above_zero_keeps_blob() {
        let dir = tempdir().unwrap();
        let (db, bm) = open(dir.path());

        let p1 = bm.prepare(b"shared").unwrap();
        let p2 = bm.prepare(b"shared").unwrap();
        let txn = db.begin().unwrap();
        let (block, _) = bm.commit(&txn, p1).unwrap();
        bm.commit(&txn, p2).unwrap();
        txn.commit().unwrap();

        let txn = db.begin().unwrap();
        let removed = bm.release(&txn, block.id).unwrap();
        txn.commit().unwrap();

        assert!(!removed);
        assert!(bm.exists_on_disk(&block));
    }

    #[test]
    fn used_bytes_tracks_commit_and_release() {
        let dir = tempdir().unwrap();
        let (db, bm) = open(dir.path());

        let p1 = bm.prepare(b"alpha").unwrap();
        let p2 = bm.prepare(b"beta").unwrap();
        let txn = db.begin().unwrap();
        let (b1, _) = bm.commit(&txn, p1).unwrap();
        let (b2, _) = bm.commit(&txn, p2).unwrap();
        txn.commit().unwrap();

        let conn = db.conn_for_read();
        assert_eq!(db::used_bytes(&conn).unwrap(), b1.stored_size + b2.stored_size);
        drop(conn);

        let txn = db.begin().unwrap();
        bm.release(&txn, b1.id).unwrap();
        txn.commit().unwrap();

        let conn = db.conn_for_read();
        assert_eq!(db::used_bytes(&conn).unwrap(), b2.stored_size);
    }

    #[test]
    fn read_missing_blob_is_reported() {
        let dir = tempdir().unwrap();
        let (db, bm) = open(dir.path());
        let prepared = bm.prepare(b"x").unwrap();
        let txn = db.begin().unwrap();
        let (block, _) = bm.commit(&txn, prepared).unwrap();
        txn.commit().unwrap();

        std::fs::remove_file(dir.path().join(".vault").join("blocks").join(&block.relative_path)).unwrap();
        assert!(matches!(bm.read(&block), Err(VaultError::MissingBlob { .. })));
    }
}
