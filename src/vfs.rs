//! Virtual filesystem (C6): an encrypted directory tree over the per-repo
//! metadata DB (C4). The root is implicit (`parent_id = NULL`); all names
//! (and optional comments) are AEAD-sealed with a key derived from the
//! master key, so sibling-collision checks require decrypting every
//! sibling — there is no plaintext index to check against.

use crate::blocks::BlockManager;
use crate::crypto::{self, KEY_LEN, NONCE_LEN};
use crate::db::Txn;
use crate::error::{Result, VaultError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug, Clone)]
pub struct VirtualFile {
    pub id: u64,
    pub parent_id: Option<u64>,
    pub name: String,
    pub is_directory: bool,
    pub logical_size: u64,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub struct Vfs {
    names_key: [u8; KEY_LEN],
    comments_key: [u8; KEY_LEN],
}

impl Vfs {
    pub fn new(master_key: &[u8; KEY_LEN]) -> Result<Self> {
        Ok(Self {
            names_key: crypto::hkdf_derive(master_key, b"names")?,
            comments_key: crypto::hkdf_derive(master_key, b"comments")?,
        })
    }

    fn seal_name(&self, name: &str) -> Result<(Vec<u8>, [u8; NONCE_LEN])> {
        let nonce = crypto::random_bytes::<NONCE_LEN>();
        Ok((crypto::aead_seal(&self.names_key, &nonce, name.as_bytes())?, nonce))
    }

    fn open_name(&self, ciphertext: &[u8], nonce: &[u8; NONCE_LEN]) -> Result<String> {
        let plain = crypto::aead_open(&self.names_key, nonce, ciphertext)?;
        String::from_utf8(plain).map_err(|_| VaultError::CryptoFailure)
    }

    fn seal_comment(&self, text: &str) -> Result<(Vec<u8>, [u8; NONCE_LEN])> {
        let nonce = crypto::random_bytes::<NONCE_LEN>();
        Ok((crypto::aead_seal(&self.comments_key, &nonce, text.as_bytes())?, nonce))
    }

    fn open_comment(&self, ciphertext: &[u8], nonce: &[u8; NONCE_LEN]) -> Result<String> {
        let plain = crypto::aead_open(&self.comments_key, nonce, ciphertext)?;
        String::from_utf8(plain).map_err(|_| VaultError::CryptoFailure)
    }

    /// Sorted at the façade layer by decrypted name, as spec §4.6 requires.
    pub fn list_children(&self, conn: &Connection, dir_id: Option<u64>) -> Result<Vec<VirtualFile>> {
        let mut stmt = conn.prepare(
            "SELECT id, parent_id, name_ciphertext, name_nonce, is_directory, logical_size, \
                    comment_ciphertext, comment_nonce, created_at \
             FROM files WHERE parent_id IS ?1",
        )?;
        let rows = stmt.query_map(params![dir_id.map(|v| v as i64)], |row| Self::row_fields(row))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(self.decrypt_row(row?)?);
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    pub fn get_file(&self, conn: &Connection, id: u64) -> Result<VirtualFile> {
        let row = conn
            .query_row(
                "SELECT id, parent_id, name_ciphertext, name_nonce, is_directory, logical_size, \
                        comment_ciphertext, comment_nonce, created_at \
                 FROM files WHERE id = ?1",
                params![id as i64],
                Self::row_fields,
            )
            .optional()?
            .ok_or_else(|| VaultError::NotFound { what: format!("file {id}") })?;
        self.decrypt_row(row)
    }

    pub fn create_directory(&self, txn: &Txn<'_>, parent_id: Option<u64>, name: &str) -> Result<u64> {
        let conn = txn.conn();
        self.ensure_parent_is_directory(conn, parent_id)?;
        self.ensure_name_free(conn, parent_id, name, None)?;

        let (ct, nonce) = self.seal_name(name)?;
        conn.execute(
            "INSERT INTO files (parent_id, name_ciphertext, name_nonce, is_directory, logical_size, created_at) \
             VALUES (?1, ?2, ?3, 1, 0, ?4)",
            params![parent_id.map(|v| v as i64), ct, &nonce[..], Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid() as u64)
    }

    /// Must be called inside the same outer [`Txn`] that committed
    /// `block_ids_in_order`'s refcount increments, so the file row and its
    /// edges appear atomically with those increments.
    pub fn create_file(
        &self,
        txn: &Txn<'_>,
        parent_id: Option<u64>,
        name: &str,
        size: u64,
        block_ids_in_order: &[u64],
    ) -> Result<u64> {
        let conn = txn.conn();
        self.ensure_parent_is_directory(conn, parent_id)?;
        self.ensure_name_free(conn, parent_id, name, None)?;

        let (ct, nonce) = self.seal_name(name)?;
        conn.execute(
            "INSERT INTO files (parent_id, name_ciphertext, name_nonce, is_directory, logical_size, created_at) \
             VALUES (?1, ?2, ?3, 0, ?4, ?5)",
            params![parent_id.map(|v| v as i64), ct, &nonce[..], size as i64, Utc::now().to_rfc3339()],
        )?;
        let file_id = conn.last_insert_rowid() as u64;

        for (order_index, block_id) in block_ids_in_order.iter().enumerate() {
            conn.execute(
                "INSERT INTO file_blocks (file_id, block_id, order_index) VALUES (?1, ?2, ?3)",
                params![file_id as i64, *block_id as i64, order_index as i64],
            )?;
        }
        Ok(file_id)
    }

    pub fn rename(&self, txn: &Txn<'_>, file_id: u64, new_name: &str) -> Result<()> {
        let conn = txn.conn();
        let parent_id: Option<u64> = conn
            .query_row("SELECT parent_id FROM files WHERE id = ?1", params![file_id as i64], |r| {
                r.get::<_, Option<i64>>(0)
            })
            .optional()?
            .ok_or_else(|| VaultError::NotFound { what: format!("file {file_id}") })?
            .map(|v| v as u64);

        self.ensure_name_free(conn, parent_id, new_name, Some(file_id))?;

        let (ct, nonce) = self.seal_name(new_name)?;
        conn.execute(
            "UPDATE files SET name_ciphertext = ?1, name_nonce = ?2 WHERE id = ?3",
            params![ct, &nonce[..], file_id as i64],
        )?;
        Ok(())
    }

    pub fn set_comment(&self, txn: &Txn<'_>, file_id: u64, text: Option<&str>) -> Result<()> {
        let conn = txn.conn();
        let (ct, nonce) = match text {
            Some(t) => {
                let (ct, nonce) = self.seal_comment(t)?;
                (Some(ct), Some(nonce))
            }
            None => (None, None),
        };
        let changed = conn.execute(
            "UPDATE files SET comment_ciphertext = ?1, comment_nonce = ?2 WHERE id = ?3",
            params![ct, nonce.map(|n| n.to_vec()), file_id as i64],
        )?;
        if changed == 0 {
            return Err(VaultError::NotFound { what: format!("file {file_id}") });
        }
        Ok(())
    }

    /// Recursively collects descendants, releases every referenced block,
    /// then cascade-deletes the file rows — never relies on `ON DELETE
    /// CASCADE` for the refcount side effect (spec §9's explicit-walk
    /// resolution: cascade alone would drop `file_blocks` rows without ever
    /// calling [`BlockManager::release`]).
    pub fn delete(&self, txn: &Txn<'_>, blocks: &BlockManager, file_id: u64) -> Result<()> {
        let conn = txn.conn();
        let subtree = self.collect_subtree(conn, file_id)?;
        if subtree.is_empty() {
            return Err(VaultError::NotFound { what: format!("file {file_id}") });
        }

        for &id in &subtree {
            let block_ids: Vec<u64> = {
                let mut stmt = conn.prepare(
                    "SELECT block_id FROM file_blocks WHERE file_id = ?1 ORDER BY order_index",
                )?;
                stmt.query_map(params![id as i64], |r| r.get::<_, i64>(0))?
                    .map(|r| r.map(|v| v as u64))
                    .collect::<rusqlite::Result<Vec<_>>>()?
            };
            for block_id in block_ids {
                blocks.release(txn, block_id)?;
            }
        }

        for &id in &subtree {
            conn.execute("DELETE FROM files WHERE id = ?1", params![id as i64])?;
        }
        Ok(())
    }

    fn collect_subtree(&self, conn: &Connection, root: u64) -> Result<Vec<u64>> {
        let mut stack = vec![root];
        let mut all = Vec::new();
        while let Some(cur) = stack.pop() {
            if conn
                .query_row("SELECT 1 FROM files WHERE id = ?1", params![cur as i64], |_| Ok(()))
                .optional()?
                .is_none()
            {
                continue;
            }
            all.push(cur);
            let mut stmt = conn.prepare("SELECT id FROM files WHERE parent_id = ?1")?;
            let children: Vec<u64> = stmt
                .query_map(params![cur as i64], |r| r.get::<_, i64>(0))?
                .map(|r| r.map(|v| v as u64))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            stack.extend(children);
        }
        Ok(all)
    }

    fn ensure_parent_is_directory(&self, conn: &Connection, parent_id: Option<u64>) -> Result<()> {
        let Some(parent_id) = parent_id else { return Ok(()) };
        let is_dir: Option<bool> = conn
            .query_row("SELECT is_directory FROM files WHERE id = ?1", params![parent_id as i64], |r| r.get(0))
            .optional()?;
        match is_dir {
            Some(true) => Ok(()),
            Some(false) => Err(VaultError::NotFound { what: format!("directory {parent_id}") }),
            None => Err(VaultError::NotFound { what: format!("directory {parent_id}") }),
        }
    }

    fn ensure_name_free(
        &self,
        conn: &Connection,
        parent_id: Option<u64>,
        name: &str,
        excluding: Option<u64>,
    ) -> Result<()> {
        let mut stmt = conn.prepare(
            "SELECT id, name_ciphertext, name_nonce FROM files WHERE parent_id IS ?1",
        )?;
        let rows = stmt.query_map(params![parent_id.map(|v| v as i64)], |row| {
            Ok((row.get::<_, i64>(0)? as u64, row.get::<_, Vec<u8>>(1)?, row.get::<_, Vec<u8>>(2)?))
        })?;

        for row in rows {
            let (id, ct, nonce_vec) = row?;
            if Some(id) == excluding {
                continue;
            }
            let mut nonce = [0u8; NONCE_LEN];
            nonce.copy_from_slice(&nonce_vec);
            let sibling_name = self.open_name(&ct, &nonce)?;
            if sibling_name == name {
                return Err(VaultError::NameCollision { name: name.to_string() });
            }
        }
        Ok(())
    }

    fn decrypt_row(&self, row: RawRow) -> Result<VirtualFile> {
        let mut name_nonce = [0u8; NONCE_LEN];
        name_nonce.copy_from_slice(&row.name_nonce);
        let name = self.open_name(&row.name_ciphertext, &name_nonce)?;

        let comment = match (row.comment_ciphertext, row.comment_nonce) {
            (Some(ct), Some(nonce_vec)) => {
                let mut nonce = [0u8; NONCE_LEN];
                nonce.copy_from_slice(&nonce_vec);
                Some(self.open_comment(&ct, &nonce)?)
            }
            _ => None,
        };

        Ok(VirtualFile {
            id: row.id,
            parent_id: row.parent_id,
            name,
            is_directory: row.is_directory,
            logical_size: row.logical_size,
            comment,
            created_at: DateTime::parse_from_rfc3339(&row.created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }

    fn row_fields(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
        Ok(RawRow {
            id: row.get::<_, i64>(0)? as u64,
            parent_id: row.get::<_, Option<i64>>(1)?.map(|v| v as u64),
            name_ciphertext: row.get(2)?,
            name_nonce: row.get(3)?,
            is_directory: row.get(4)?,
            logical_size: row.get::<_, i64>(5)? as u64,
            comment_ciphertext: row.get(6)?,
            comment_nonce: row.get(7)?,
            created_at: row.get(8)?,
        })
    }
}

struct RawRow {
    id: u64,
    parent_id: Option<u64>,
    name_ciphertext: Vec<u8>,
    name_nonce: Vec<u8>,
    is_directory: bool,
    logical_size: u64,
    comment_ciphertext: Option<Vec<u8>>,
    comment_nonce: Option<Vec<u8>>,
    created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Db, Vfs) {
        let dir = tempdir().unwrap();
        let db = Db::open(&dir.path().join("vault.db")).unwrap();
        let vfs = Vfs::new(&[3u8; KEY_LEN]).unwrap();
        (dir, db, vfs)
    }

    #[test]
    fn mkdir_and_list_children_sorted() {
        let (_dir, db, vfs) = setup();
        let txn = db.begin().unwrap();
        vfs.create_directory(&txn, None, "banana").unwrap();
        vfs.create_directory(&txn, None, "apple").unwrap();
        txn.commit().unwrap();

        let conn = db.conn_for_read();
        let children = vfs.list_children(&conn, None).unwrap();
        assert_eq!(children.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(), vec!["apple", "banana"]);
    }

    #[test]
    fn sibling_name_collision_is_rejected() {
        let (_dir, db, vfs) = setup();
        let txn = db.begin().unwrap();
        vfs.create_directory(&txn, None, "docs").unwrap();
        let err = vfs.create_directory(&txn, None, "docs").unwrap_err();
        assert!(matches!(err, VaultError::NameCollision { .. }));
    }

    #[test]
    fn rename_reseals_with_fresh_nonce() {
        let (_dir, db, vfs) = setup();
        let txn = db.begin().unwrap();
        let id = vfs.create_directory(&txn, None, "old").unwrap();
        vfs.rename(&txn, id, "new").unwrap();
        txn.commit().unwrap();

        let conn = db.conn_for_read();
        assert_eq!(vfs.get_file(&conn, id).unwrap().name, "new");
    }

    #[test]
    fn set_comment_round_trips() {
        let (_dir, db, vfs) = setup();
        let txn = db.begin().unwrap();
        let id = vfs.create_directory(&txn, None, "d").unwrap();
        vfs.set_comment(&txn, id, Some("hello")).unwrap();
        txn.commit().unwrap();

        let conn = db.conn_for_read();
        assert_eq!(vfs.get_file(&conn, id).unwrap().comment.as_deref(), Some("hello"));
    }
}
