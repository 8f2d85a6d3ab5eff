use anyhow::Context;
use clap::{Parser, Subcommand};
use securevault::core::{Core, Session};
use securevault::logging;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

#[derive(Parser)]
#[command(name = "securevault", version, about = "Local encrypted vault: deduplicating block store with a virtual filesystem")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// First-run: mint a master key and wrap it under a new PIN
    Setup {
        #[arg(long)]
        pin: String,
    },

    /// Verify a PIN unwraps the master key, without doing anything else
    Unlock {
        #[arg(long)]
        pin: String,
    },

    /// Repository registry operations
    Repo {
        #[command(subcommand)]
        cmd: RepoCmd,
    },

    /// List children of a directory
    Ls {
        #[arg(long)]
        pin: String,
        #[arg(long)]
        repo: u64,
        #[arg(long)]
        dir_id: Option<u64>,
    },

    /// Create a directory
    Mkdir {
        #[arg(long)]
        pin: String,
        #[arg(long)]
        repo: u64,
        #[arg(long)]
        parent_id: Option<u64>,
        #[arg(long)]
        name: String,
    },

    /// Import files or directories from the host filesystem
    Import {
        #[arg(long)]
        pin: String,
        #[arg(long)]
        repo: u64,
        #[arg(long)]
        parent_id: Option<u64>,
        #[arg(required = true)]
        sources: Vec<PathBuf>,
    },

    /// Export files or directories to the host filesystem
    Export {
        #[arg(long)]
        pin: String,
        #[arg(long)]
        repo: u64,
        #[arg(long)]
        dest: PathBuf,
        #[arg(required = true, long = "id")]
        file_ids: Vec<u64>,
    },

    /// Delete files or directories
    Rm {
        #[arg(long)]
        pin: String,
        #[arg(long)]
        repo: u64,
        #[arg(required = true, long = "id")]
        file_ids: Vec<u64>,
    },

    /// Rename a file or directory
    Rename {
        #[arg(long)]
        pin: String,
        #[arg(long)]
        repo: u64,
        #[arg(long)]
        id: u64,
        #[arg(long)]
        new_name: String,
    },

    /// Set or clear a file's comment
    Comment {
        #[arg(long)]
        pin: String,
        #[arg(long)]
        repo: u64,
        #[arg(long)]
        id: u64,
        /// Omit to clear the comment
        #[arg(long)]
        text: Option<String>,
    },

    /// Show the last known state of an import/export operation
    Poll {
        #[arg(long)]
        pin: String,
        #[arg(long)]
        repo: u64,
        #[arg(long)]
        op_id: u64,
    },
}

#[derive(Subcommand)]
enum RepoCmd {
    /// Create a new repository at `path`
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        quota_bytes: u64,
    },
    /// List registered repositories
    List,
    /// Adopt an existing `<path>/.vault` repository into the registry
    Import {
        #[arg(long)]
        path: PathBuf,
    },
    /// Record a repository as the active one for future launches
    SetActive {
        #[arg(long)]
        id: u64,
    },
}

fn main() -> anyhow::Result<()> {
    logging::init();
    let cli = Cli::parse();

    match cli.cmd {
        Cmd::Setup { pin } => {
            let mut core = Core::open()?;
            if !core.is_first_run() {
                anyhow::bail!("a master key is already configured");
            }
            core.setup_master_key(&pin)?;
            println!("master key configured");
        }

        Cmd::Unlock { pin } => {
            let core = Core::open()?;
            core.unlock(&pin).context("PIN did not unlock the vault")?;
            println!("unlocked");
        }

        Cmd::Repo { cmd } => match cmd {
            RepoCmd::Create { name, path, quota_bytes } => {
                let mut core = Core::open()?;
                let descriptor = core.create_repo(&name, &path, quota_bytes)?;
                println!("created repository id={} name={}", descriptor.id, descriptor.name);
            }
            RepoCmd::List => {
                let core = Core::open()?;
                for r in core.list_repos()? {
                    println!("id={} name={} path={} quota_bytes={}", r.id, r.name, r.path.display(), r.quota_bytes);
                }
            }
            RepoCmd::Import { path } => {
                let mut core = Core::open()?;
                let (descriptor, renamed) = core.import_repo(&path)?;
                if renamed {
                    println!("imported as id={} name={} (renamed to avoid a collision)", descriptor.id, descriptor.name);
                } else {
                    println!("imported as id={} name={}", descriptor.id, descriptor.name);
                }
            }
            RepoCmd::SetActive { id } => {
                let mut core = Core::open()?;
                core.set_active_repo(id)?;
                println!("active repository set to id={id}");
            }
        },

        Cmd::Ls { pin, repo, dir_id } => {
            let session = open_session(repo, &pin)?;
            for f in session.list_children(dir_id)? {
                let kind = if f.is_directory { "DIR " } else { "FILE" };
                println!("{kind}  id={}  size={}  name={}", f.id, f.logical_size, f.name);
            }
        }

        Cmd::Mkdir { pin, repo, parent_id, name } => {
            let session = open_session(repo, &pin)?;
            let id = session.mkdir(parent_id, &name)?;
            println!("mkdir id={id}");
        }

        Cmd::Import { pin, repo, parent_id, sources } => {
            let session = open_session(repo, &pin)?;
            let cancel = AtomicBool::new(false);
            let outcome = session.import(&sources, parent_id, &cancel)?;
            println!(
                "import op_id={} imported {} file(s)",
                outcome.operation_id,
                outcome.imported_file_ids.len()
            );
        }

        Cmd::Export { pin, repo, dest, file_ids } => {
            let session = open_session(repo, &pin)?;
            let cancel = AtomicBool::new(false);
            let outcome = session.export(&file_ids, &dest, &cancel)?;
            println!("export op_id={} wrote {} file(s)", outcome.operation_id, outcome.written_paths.len());
        }

        Cmd::Rm { pin, repo, file_ids } => {
            let session = open_session(repo, &pin)?;
            session.delete(&file_ids)?;
            println!("removed {} item(s)", file_ids.len());
        }

        Cmd::Rename { pin, repo, id, new_name } => {
            let session = open_session(repo, &pin)?;
            session.rename(id, &new_name)?;
            println!("renamed");
        }

        Cmd::Comment { pin, repo, id, text } => {
            let session = open_session(repo, &pin)?;
            session.set_comment(id, text.as_deref())?;
            println!("comment updated");
        }

        Cmd::Poll { pin, repo, op_id } => {
            let session = open_session(repo, &pin)?;
            let record = session.poll(op_id)?;
            println!(
                "op={} kind={:?} status={:?} processed={}/{} error={:?}",
                record.id, record.kind, record.status, record.processed_bytes, record.total_bytes, record.error
            );
        }
    }

    Ok(())
}

fn open_session(repo_id: u64, pin: &str) -> anyhow::Result<Session> {
    let core = Core::open()?;
    let master_key = core.unlock(pin).context("PIN did not unlock the vault")?;
    let session = core.open_repo(repo_id, &master_key)?;
    Ok(session)
}
