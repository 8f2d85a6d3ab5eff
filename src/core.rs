//! The explicit context object (redesign note in spec §9): replaces any
//! app-wide singleton with a value the caller owns and threads through
//! explicitly. `Core` knows about global config and the repository
//! registry; opening a repository hands back a [`Session`] holding the
//! unlocked master key and the repo's own DB/block/VFS handles.

use crate::blocks::BlockManager;
use crate::config::{self, GlobalConfig};
use crate::crypto::{self, KEY_LEN, NONCE_LEN, SALT_LEN};
use crate::db::{self, Db, OpStatus};
use crate::error::{Result, VaultError};
use crate::export::{self, ExportOutcome};
use crate::import::{self, ImportOutcome};
use crate::registry::{RepoConfigFile, RepositoryDescriptor, Registry};
use crate::vfs::{Vfs, VirtualFile};
use fs2::FileExt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use tracing::{info, warn};
use zeroize::Zeroizing;

/// Argon2id cost parameters for the master-key-wrapping KDF. Conservative
/// for a desktop machine; not user-configurable, matching the teacher's
/// hardcoded `131072`/`3` in `container::create_vault`.
const KDF_M_COST_KIB: u32 = 131_072;
const KDF_T_COST: u32 = 3;

pub struct Core {
    config: GlobalConfig,
    registry: Registry,
}

impl Core {
    pub fn open() -> Result<Self> {
        let config = config::load()?;
        let registry = Registry::open(&config::registry_db_path()?)?;
        Ok(Self { config, registry })
    }

    pub fn is_first_run(&self) -> bool {
        self.config.is_first_run()
    }

    /// First-run setup: mints a random master key, wraps it under a key
    /// derived from `pin`, and persists the wrapped form (never the master
    /// key itself) to the global config file.
    pub fn setup_master_key(&mut self, pin: &str) -> Result<()> {
        let mut master_key = crypto::random_bytes::<KEY_LEN>();
        let salt = crypto::random_bytes::<SALT_LEN>();
        let kek = crypto::kdf(pin, &salt, KDF_M_COST_KIB, KDF_T_COST)?;
        let nonce = crypto::random_bytes::<NONCE_LEN>();
        let wrapped = crypto::aead_seal(&kek, &nonce, &master_key)?;
        let verifier = hex::encode(crypto::master_key_verifier(&master_key)?);

        self.config.encrypted_master_key = Some(hex::encode(&wrapped));
        self.config.master_key_salt = Some(hex::encode(salt));
        self.config.master_key_nonce = Some(hex::encode(nonce));
        self.config.master_key_hash = Some(verifier);
        config::save(&self.config)?;
        crypto::zeroize_key(&mut master_key);
        Ok(())
    }

    /// Unwraps the master key with `pin`. A wrong PIN fails the AEAD
    /// authentication check inside `aead_open` and surfaces as the single
    /// opaque [`VaultError::CryptoFailure`] — never a distinguishable reason.
    pub fn unlock(&self, pin: &str) -> Result<Zeroizing<[u8; KEY_LEN]>> {
        let salt = decode_fixed::<SALT_LEN>(self.config.master_key_salt.as_deref())?;
        let nonce = decode_fixed::<NONCE_LEN>(self.config.master_key_nonce.as_deref())?;
        let wrapped = hex::decode(
            self.config.encrypted_master_key.as_deref().ok_or(VaultError::CryptoFailure)?,
        )
        .map_err(|_| VaultError::CryptoFailure)?;

        let kek = crypto::kdf(pin, &salt, KDF_M_COST_KIB, KDF_T_COST)?;
        let plain = crypto::aead_open(&kek, &nonce, &wrapped)?;
        if plain.len() != KEY_LEN {
            return Err(VaultError::CryptoFailure);
        }
        let mut master_key = [0u8; KEY_LEN];
        master_key.copy_from_slice(&plain);

        if let Some(expected) = &self.config.master_key_hash {
            if hex::encode(crypto::master_key_verifier(&master_key)?) != *expected {
                return Err(VaultError::CryptoFailure);
            }
        }
        Ok(Zeroizing::new(master_key))
    }

    pub fn list_repos(&self) -> Result<Vec<RepositoryDescriptor>> {
        self.registry.list()
    }

    /// Lays out a fresh repository on disk (`.vault/{blocks,vault.db,config.json}`)
    /// and registers it.
    pub fn create_repo(&mut self, name: &str, path: &Path, quota_bytes: u64) -> Result<RepositoryDescriptor> {
        if path.exists() && path.read_dir().map(|mut d| d.next().is_some()).unwrap_or(false) {
            return Err(VaultError::PathCollision { path: path.to_path_buf() });
        }
        std::fs::create_dir_all(path.join(".vault").join("blocks"))?;
        Db::open(&path.join(".vault").join("vault.db"))?;
        let cfg = RepoConfigFile { name: name.to_string(), quota_bytes };
        std::fs::write(path.join(".vault").join("config.json"), serde_json::to_string_pretty(&cfg)?)?;
        let descriptor = self.registry.create(name, path, quota_bytes)?;
        info!(repo_id = descriptor.id, name = %descriptor.name, path = %descriptor.path.display(), "repository created");
        Ok(descriptor)
    }

    /// Records `id` as the last-opened repository in the global config, so a
    /// future launch can default to it. Spec §4.3's `set_active` operation.
    pub fn set_active_repo(&mut self, id: u64) -> Result<()> {
        self.registry.get_by_id(id)?;
        self.config.active_repository_id = Some(id);
        config::save(&self.config)
    }

    pub fn active_repo(&self) -> Option<u64> {
        self.config.active_repository_id
    }

    /// Adopts an existing `<path>/.vault` repository into the registry (spec's
    /// "import repository" flow — distinct from importing files *into* one).
    pub fn import_repo(&mut self, path: &Path) -> Result<(RepositoryDescriptor, bool)> {
        self.registry.import_repository(path)
    }

    pub fn rename_repo(&mut self, id: u64, new_name: &str) -> Result<()> {
        self.registry.rename(id, new_name)
    }

    pub fn remove_repo(&mut self, id: u64) -> Result<()> {
        self.registry.delete(id)
    }

    /// Opens a repository with an already-unwrapped master key. Sweeps the
    /// operation journal for rows left `processing`/`cancelling` by a
    /// process that never returned, marking each `failed` (spec §4.9/§9
    /// crash-recovery), and takes an advisory lock so a second process can't
    /// open the same repository concurrently (spec §5).
    pub fn open_repo(&self, id: u64, master_key: &[u8; KEY_LEN]) -> Result<Session> {
        let descriptor = self.registry.get_by_id(id)?;
        let lock_path = descriptor.path.join(".vault").join(".lock");
        let lock_file = OpenOptions::new().write(true).create(true).truncate(false).open(&lock_path)?;
        lock_file.try_lock_exclusive().map_err(|_| VaultError::IoFailure {
            reason: format!("repository at {} is already open in another process", descriptor.path.display()),
        })?;

        let db = Db::open(&descriptor.path.join(".vault").join("vault.db"))?;
        for op in db::list_unfinished_operations(&db)? {
            warn!(operation_id = op.id, kind = op.kind.as_str(), "recovered interrupted operation on open");
            db::fail_operation(&db, op.id, "interrupted: process exited mid-operation")?;
        }

        let blocks = BlockManager::new(&descriptor.path, *master_key);
        let vfs = Vfs::new(master_key)?;

        info!(repo_id = id, path = %descriptor.path.display(), "repository opened");
        Ok(Session {
            db,
            blocks,
            vfs,
            quota_bytes: descriptor.quota_bytes,
            repo_root: descriptor.path,
            _lock_file: lock_file,
        })
    }
}

fn decode_fixed<const N: usize>(hex_str: Option<&str>) -> Result<[u8; N]> {
    let bytes = hex::decode(hex_str.ok_or(VaultError::CryptoFailure)?).map_err(|_| VaultError::CryptoFailure)?;
    if bytes.len() != N {
        return Err(VaultError::CryptoFailure);
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// An open, unlocked repository: the per-repo DB, block store, and VFS,
/// bound to a single master key for the lifetime of the value.
pub struct Session {
    db: Db,
    blocks: BlockManager,
    vfs: Vfs,
    quota_bytes: u64,
    repo_root: PathBuf,
    _lock_file: std::fs::File,
}

impl Session {
    pub fn list_children(&self, dir_id: Option<u64>) -> Result<Vec<VirtualFile>> {
        let conn = self.db.conn_for_read();
        self.vfs.list_children(&conn, dir_id)
    }

    pub fn get_file(&self, id: u64) -> Result<VirtualFile> {
        let conn = self.db.conn_for_read();
        self.vfs.get_file(&conn, id)
    }

    pub fn mkdir(&self, parent_id: Option<u64>, name: &str) -> Result<u64> {
        let txn = self.db.begin()?;
        let id = self.vfs.create_directory(&txn, parent_id, name)?;
        txn.commit()?;
        Ok(id)
    }

    pub fn import(
        &self,
        sources: &[PathBuf],
        parent_id: Option<u64>,
        cancel: &AtomicBool,
    ) -> Result<ImportOutcome> {
        import::import(&self.db, &self.blocks, &self.vfs, self.quota_bytes, sources, parent_id, cancel)
    }

    pub fn export(&self, file_ids: &[u64], dest: &Path, cancel: &AtomicBool) -> Result<ExportOutcome> {
        export::export(&self.db, &self.blocks, &self.vfs, file_ids, dest, cancel)
    }

    /// Deletes every id in `file_ids` (and its descendants) in a single
    /// transaction: either the whole batch is removed and its blocks'
    /// refcounts decremented, or none of it is.
    pub fn delete(&self, file_ids: &[u64]) -> Result<()> {
        let txn = self.db.begin()?;
        for &id in file_ids {
            self.vfs.delete(&txn, &self.blocks, id)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn rename(&self, file_id: u64, new_name: &str) -> Result<()> {
        let txn = self.db.begin()?;
        self.vfs.rename(&txn, file_id, new_name)?;
        txn.commit()?;
        Ok(())
    }

    pub fn set_comment(&self, file_id: u64, text: Option<&str>) -> Result<()> {
        let txn = self.db.begin()?;
        self.vfs.set_comment(&txn, file_id, text)?;
        txn.commit()?;
        Ok(())
    }

    /// Last known state of an operation, including ones left over from a
    /// crashed process (already swept to `failed` by `open_repo`).
    pub fn poll(&self, operation_id: u64) -> Result<db::OperationRecord> {
        db::get_operation(&self.db, operation_id)
    }

    /// Marks an operation `cancelling` in the journal. `import`/`export` run
    /// synchronously on the calling thread, so within a single process this
    /// can only be observed by a *future* invocation inspecting the journal
    /// (e.g. after the caller wires its own cooperative `AtomicBool` through
    /// a signal handler) — there is no background worker here to preempt.
    pub fn cancel(&self, operation_id: u64) -> Result<()> {
        db::set_operation_status(&self.db, operation_id, OpStatus::Cancelling)
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(self.repo_root.join(".vault").join(".lock"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// `Core::open` resolves the app-data directory from the process-global
    /// `HOME` env var; serialize tests that set it so they can't interleave.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn core_with_home(home: &Path) -> Core {
        std::env::set_var("HOME", home);
        Core::open().unwrap()
    }

    #[test]
    fn setup_then_unlock_round_trips() {
        let _guard = ENV_LOCK.lock().unwrap();
        let home = tempdir().unwrap();
        let mut core = core_with_home(home.path());
        assert!(core.is_first_run());
        core.setup_master_key("123456").unwrap();
        assert!(!core.is_first_run());

        let key = core.unlock("123456").unwrap();
        assert_eq!(key.len(), KEY_LEN);
    }

    #[test]
    fn unlock_with_wrong_pin_fails() {
        let _guard = ENV_LOCK.lock().unwrap();
        let home = tempdir().unwrap();
        let mut core = core_with_home(home.path());
        core.setup_master_key("123456").unwrap();
        let err = core.unlock("000000").unwrap_err();
        assert!(matches!(err, VaultError::CryptoFailure));
    }

    #[test]
    fn mkdir_list_and_rename_round_trip() {
        let _guard = ENV_LOCK.lock().unwrap();
        let home = tempdir().unwrap();
        let mut core = core_with_home(home.path());
        core.setup_master_key("123456").unwrap();
        let key = core.unlock("123456").unwrap();

        let repo_dir = home.path().join("repo");
        let descriptor = core.create_repo("main", &repo_dir, 1 << 30).unwrap();

        let session = core.open_repo(descriptor.id, &key).unwrap();
        let id = session.mkdir(None, "docs").unwrap();
        assert_eq!(session.list_children(None).unwrap()[0].name, "docs");
        session.rename(id, "documents").unwrap();
        assert_eq!(session.get_file(id).unwrap().name, "documents");
    }

    #[test]
    fn journal_sweep_fails_operations_left_processing_by_a_prior_session() {
        let _guard = ENV_LOCK.lock().unwrap();
        let home = tempdir().unwrap();
        let mut core = core_with_home(home.path());
        core.setup_master_key("123456").unwrap();
        let key = core.unlock("123456").unwrap();

        let repo_dir = home.path().join("repo");
        let descriptor = core.create_repo("main", &repo_dir, 1 << 30).unwrap();

        let stray_op_id = {
            let session = core.open_repo(descriptor.id, &key).unwrap();
            let id = db::create_operation(&session.db, crate::db::OpKind::Import, "x", "<vault>", 10).unwrap();
            db::set_operation_status(&session.db, id, OpStatus::Processing).unwrap();
            id
        };

        let session = core.open_repo(descriptor.id, &key).unwrap();
        let rec = session.poll(stray_op_id).unwrap();
        assert_eq!(rec.status, OpStatus::Failed);
    }

    #[test]
    fn set_active_repo_persists_across_core_reopen() {
        let _guard = ENV_LOCK.lock().unwrap();
        let home = tempdir().unwrap();
        let mut core = core_with_home(home.path());
        core.setup_master_key("123456").unwrap();

        let repo_dir = home.path().join("repo");
        let descriptor = core.create_repo("main", &repo_dir, 1 << 30).unwrap();
        assert_eq!(core.active_repo(), None);

        core.set_active_repo(descriptor.id).unwrap();
        assert_eq!(core.active_repo(), Some(descriptor.id));

        let reopened = Core::open().unwrap();
        assert_eq!(reopened.active_repo(), Some(descriptor.id));
    }

    #[test]
    fn set_active_repo_rejects_unknown_id() {
        let _guard = ENV_LOCK.lock().unwrap();
        let home = tempdir().unwrap();
        let mut core = core_with_home(home.path());
        core.setup_master_key("123456").unwrap();
        let err = core.set_active_repo(999).unwrap_err();
        assert!(matches!(err, VaultError::NotFound { .. }));
    }

    #[test]
    fn second_open_while_locked_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        let home = tempdir().unwrap();
        let mut core = core_with_home(home.path());
        core.setup_master_key("123456").unwrap();
        let key = core.unlock("123456").unwrap();

        let repo_dir = home.path().join("repo");
        let descriptor = core.create_repo("main", &repo_dir, 1 << 30).unwrap();

        let _session = core.open_repo(descriptor.id, &key).unwrap();
        let err = core.open_repo(descriptor.id, &key).unwrap_err();
        assert!(matches!(err, VaultError::IoFailure { .. }));
    }
}
