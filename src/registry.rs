//! Repository registry (C3): a small global database cataloging known
//! repositories (name, path, quota). Does NOT verify the on-disk repo
//! actually exists — callers verify at `open_repo` time.

use crate::error::{Result, VaultError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryDescriptor {
    pub id: u64,
    pub name: String,
    pub path: PathBuf,
    pub quota_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// `{ name, quota }` as persisted inside `<repo>/.vault/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfigFile {
    pub name: String,
    pub quota_bytes: u64,
}

pub struct Registry {
    conn: Connection,
}

impl Registry {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS repositories (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                name        TEXT NOT NULL UNIQUE,
                path        TEXT NOT NULL UNIQUE,
                quota_bytes INTEGER NOT NULL,
                created_at  TEXT NOT NULL
            );",
        )?;
        Ok(Self { conn })
    }

    pub fn list(&self) -> Result<Vec<RepositoryDescriptor>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, path, quota_bytes, created_at FROM repositories ORDER BY name",
        )?;
        let rows = stmt
            .query_map([], Self::row_to_descriptor)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_by_id(&self, id: u64) -> Result<RepositoryDescriptor> {
        self.conn
            .query_row(
                "SELECT id, name, path, quota_bytes, created_at FROM repositories WHERE id = ?1",
                params![id as i64],
                Self::row_to_descriptor,
            )
            .optional()?
            .ok_or_else(|| VaultError::NotFound { what: format!("repository {id}") })
    }

    pub fn create(&self, name: &str, path: &Path, quota_bytes: u64) -> Result<RepositoryDescriptor> {
        if self.find_by_name(name)?.is_some() {
            return Err(VaultError::NameCollision { name: name.to_string() });
        }
        if self.find_by_path(path)?.is_some() {
            return Err(VaultError::PathCollision { path: path.to_path_buf() });
        }
        let created_at = Utc::now();
        self.conn.execute(
            "INSERT INTO repositories (name, path, quota_bytes, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![name, path.to_string_lossy(), quota_bytes as i64, created_at.to_rfc3339()],
        )?;
        let id = self.conn.last_insert_rowid() as u64;
        Ok(RepositoryDescriptor { id, name: name.to_string(), path: path.to_path_buf(), quota_bytes, created_at })
    }

    pub fn rename(&self, id: u64, new_name: &str) -> Result<()> {
        if let Some(existing) = self.find_by_name(new_name)? {
            if existing.id != id {
                return Err(VaultError::NameCollision { name: new_name.to_string() });
            }
        }
        let changed = self.conn.execute(
            "UPDATE repositories SET name = ?1 WHERE id = ?2",
            params![new_name, id as i64],
        )?;
        if changed == 0 {
            return Err(VaultError::NotFound { what: format!("repository {id}") });
        }
        Ok(())
    }

    pub fn delete(&self, id: u64) -> Result<()> {
        let changed = self.conn.execute("DELETE FROM repositories WHERE id = ?1", params![id as i64])?;
        if changed == 0 {
            return Err(VaultError::NotFound { what: format!("repository {id}") });
        }
        Ok(())
    }

    /// Reconstitutes a registry row from `<repo>/.vault/config.json`. On a
    /// name collision a numeric suffix is appended and `renamed = true` is
    /// returned; a path collision is a hard failure.
    pub fn import_repository(&self, repo_root: &Path) -> Result<(RepositoryDescriptor, bool)> {
        if self.find_by_path(repo_root)?.is_some() {
            return Err(VaultError::PathCollision { path: repo_root.to_path_buf() });
        }
        let cfg_path = repo_root.join(".vault").join("config.json");
        let text = std::fs::read_to_string(&cfg_path)?;
        let cfg: RepoConfigFile = serde_json::from_str(&text)?;

        let mut name = cfg.name.clone();
        let mut renamed = false;
        let mut suffix = 1u32;
        while self.find_by_name(&name)?.is_some() {
            name = format!("{} ({suffix})", cfg.name);
            renamed = true;
            suffix += 1;
        }

        let descriptor = self.create(&name, repo_root, cfg.quota_bytes)?;
        Ok((descriptor, renamed))
    }

    fn find_by_name(&self, name: &str) -> Result<Option<RepositoryDescriptor>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, path, quota_bytes, created_at FROM repositories WHERE name = ?1",
                params![name],
                Self::row_to_descriptor,
            )
            .optional()?)
    }

    fn find_by_path(&self, path: &Path) -> Result<Option<RepositoryDescriptor>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, path, quota_bytes, created_at FROM repositories WHERE path = ?1",
                params![path.to_string_lossy()],
                Self::row_to_descriptor,
            )
            .optional()?)
    }

    fn row_to_descriptor(row: &rusqlite::Row<'_>) -> rusqlite::Result<RepositoryDescriptor> {
        let path: String = row.get(2)?;
        let created_at: String = row.get(4)?;
        Ok(RepositoryDescriptor {
            id: row.get::<_, i64>(0)? as u64,
            name: row.get(1)?,
            path: PathBuf::from(path),
            quota_bytes: row.get::<_, i64>(3)? as u64,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_list_rename_delete_round_trip() {
        let dir = tempdir().unwrap();
        let reg = Registry::open(&dir.path().join("registry.db")).unwrap();

        let d = reg.create("alpha", Path::new("/tmp/alpha"), 1024).unwrap();
        assert_eq!(reg.list().unwrap().len(), 1);

        reg.rename(d.id, "beta").unwrap();
        assert_eq!(reg.get_by_id(d.id).unwrap().name, "beta");

        reg.delete(d.id).unwrap();
        assert!(reg.list().unwrap().is_empty());
    }

    #[test]
    fn name_collision_is_rejected() {
        let dir = tempdir().unwrap();
        let reg = Registry::open(&dir.path().join("registry.db")).unwrap();
        reg.create("alpha", Path::new("/tmp/a"), 1024).unwrap();
        let err = reg.create("alpha", Path::new("/tmp/b"), 1024).unwrap_err();
        assert!(matches!(err, VaultError::NameCollision { .. }));
    }

    #[test]
    fn path_collision_is_rejected() {
        let dir = tempdir().unwrap();
        let reg = Registry::open(&dir.path().join("registry.db")).unwrap();
        reg.create("alpha", Path::new("/tmp/a"), 1024).unwrap();
        let err = reg.create("gamma", Path::new("/tmp/a"), 1024).unwrap_err();
        assert!(matches!(err, VaultError::PathCollision { .. }));
    }
}
