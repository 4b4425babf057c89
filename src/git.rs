//! Git-backed checkpoints.
//!
//! A checkpoint is a commit of the whole working tree (tracked plus
//! untracked, minus ignored files) whose parent is the HEAD at the time it
//! was taken. The commit is not placed on any branch; it is anchored by a
//! ref under `refs/orchestra/checkpoints/`. Restoring checks the snapshot
//! tree out over the working directory and moves HEAD back to the
//! snapshot's parent, leaving the restored files unstaged.

use std::path::{Path, PathBuf};

use git2::build::CheckoutBuilder;
use git2::{Commit, ErrorCode, IndexAddOption, Repository, ResetType, Signature};
use tracing::debug;

use crate::orchestration::{CheckpointBackend, CheckpointRef};
use crate::Result;

/// Namespace for checkpoint refs.
pub const CHECKPOINT_REFS_PREFIX: &str = "refs/orchestra/checkpoints/";

pub struct GitCheckpointBackend {
    repo_path: PathBuf,
}

impl GitCheckpointBackend {
    /// # Errors
    /// Returns an error if `repo_path` is not inside a git repository.
    pub fn new(repo_path: &Path) -> Result<Self> {
        debug!(path = %repo_path.display(), "Opening checkpoint repository");
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Full ref name for a checkpoint label.
    pub fn ref_name(label: &str) -> String {
        let sanitized: String = label
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", CHECKPOINT_REFS_PREFIX, sanitized)
    }

    /// Checkpoint refs currently present, sorted by name.
    pub fn list(&self) -> Result<Vec<CheckpointRef>> {
        let repo = self.repo()?;
        let mut refs: Vec<CheckpointRef> = repo
            .references_glob(&format!("{}*", CHECKPOINT_REFS_PREFIX))?
            .filter_map(|r| r.ok())
            .filter_map(|r| r.name().map(|n| CheckpointRef(n.to_string())))
            .collect();
        refs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(refs)
    }
}

fn head_commit(repo: &Repository) -> Result<Option<Commit<'_>>> {
    match repo.head() {
        Ok(head) => Ok(Some(head.peel_to_commit()?)),
        Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => {
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn signature(repo: &Repository) -> Result<Signature<'static>> {
    match repo.signature() {
        Ok(sig) => Ok(sig.to_owned()),
        Err(_) => Ok(Signature::now("orchestra", "orchestra@localhost")?),
    }
}

impl CheckpointBackend for GitCheckpointBackend {
    fn create(&self, label: &str) -> Result<CheckpointRef> {
        let repo = self.repo()?;

        // The in-memory index is never written back, so the user's staging
        // area is left alone.
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        let tree = repo.find_tree(index.write_tree()?)?;

        let parent = head_commit(&repo)?;
        let parents: Vec<&Commit> = parent.iter().collect();
        let sig = signature(&repo)?;
        let oid = repo.commit(
            None,
            &sig,
            &sig,
            &format!("orchestra checkpoint {}", label),
            &tree,
            &parents,
        )?;

        let refname = Self::ref_name(label);
        repo.reference(&refname, oid, true, "orchestra: checkpoint")?;
        debug!(%refname, commit = %oid, "Checkpoint committed");
        Ok(CheckpointRef(refname))
    }

    fn restore(&self, reference: &CheckpointRef) -> Result<()> {
        let repo = self.repo()?;
        let snapshot = repo.find_reference(&reference.0)?.peel_to_commit()?;

        let mut checkout = CheckoutBuilder::new();
        checkout.force().remove_untracked(true);
        repo.checkout_tree(snapshot.as_object(), Some(&mut checkout))?;

        match snapshot.parent(0) {
            Ok(original) => {
                repo.reset(original.as_object(), ResetType::Mixed, None)?;
                debug!(%reference, head = %original.id(), "Checkpoint restored");
            }
            Err(_) => {
                let mut index = repo.index()?;
                index.clear()?;
                index.write()?;
                debug!(%reference, "Checkpoint restored onto unborn branch");
            }
        }
        Ok(())
    }

    fn discard(&self, reference: &CheckpointRef) -> Result<()> {
        let repo = self.repo()?;
        match repo.find_reference(&reference.0) {
            Ok(mut r) => {
                r.delete()?;
                debug!(%reference, "Checkpoint discarded");
            }
            Err(e) if e.code() == ErrorCode::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}
