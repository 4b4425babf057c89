//! Resource scope arbitration.
//!
//! `ResourceLock` records which path patterns each in-flight task has
//! claimed. It only answers "may this task run now"; picking which task
//! goes first is the scheduler's job.
//!
//! Two patterns overlap when:
//! - they name the same path,
//! - one is a directory prefix of the other (`src` vs `src/api.rs`),
//! - one is a glob matching the other (`src/*.rs` vs `src/api.rs`), or
//! - both are globs whose literal directories nest (`src/**` vs `src/db/*`).
//!
//! Scopes are declarations, not observed writes; nothing here watches the
//! file system.

use crate::core::task::TaskId;
use glob::Pattern;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use tracing::debug;

const GLOB_META: [char; 3] = ['*', '?', '['];

/// Table of resource claims held by running tasks.
#[derive(Debug, Default)]
pub struct ResourceLock {
    held: BTreeMap<TaskId, Vec<String>>,
}

impl ResourceLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `scope` for `task` if it overlaps no other task's claim.
    ///
    /// All-or-nothing: on any overlap nothing is claimed and `false` is
    /// returned. A task re-acquiring replaces its own previous claim.
    pub fn try_acquire(&mut self, task: &TaskId, scope: &BTreeSet<String>) -> bool {
        let normalized: Vec<String> = scope.iter().map(|p| normalize(p)).collect();

        if let Some((holder, _)) = self
            .held
            .iter()
            .filter(|(holder, _)| *holder != task)
            .find(|(_, claimed)| any_overlap(claimed, &normalized))
        {
            debug!(task = %task, holder = %holder, "Resource scope conflict");
            return false;
        }

        self.held.insert(task.clone(), normalized);
        true
    }

    /// Free everything held by `task`. Returns whether it held a claim.
    pub fn release(&mut self, task: &TaskId) -> bool {
        self.held.remove(task).is_some()
    }

    /// Whether `scope` overlaps any current claim.
    pub fn conflicts(&self, scope: &BTreeSet<String>) -> bool {
        !self.holders_conflicting(scope).is_empty()
    }

    /// Tasks whose claims overlap `scope`.
    pub fn holders_conflicting(&self, scope: &BTreeSet<String>) -> Vec<TaskId> {
        let normalized: Vec<String> = scope.iter().map(|p| normalize(p)).collect();
        self.held
            .iter()
            .filter(|(_, claimed)| any_overlap(claimed, &normalized))
            .map(|(holder, _)| holder.clone())
            .collect()
    }

    pub fn holds(&self, task: &TaskId) -> bool {
        self.held.contains_key(task)
    }

    pub fn holder_count(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

fn any_overlap(a: &[String], b: &[String]) -> bool {
    a.iter().any(|x| b.iter().any(|y| patterns_overlap(x, y)))
}

/// Canonical form: forward slashes, no leading `./`, no trailing `/`.
/// The project root (`.`, `./`, empty) normalizes to `""`.
pub fn normalize(path: &str) -> String {
    let mut p = path.trim().replace('\\', "/");
    while let Some(rest) = p.strip_prefix("./") {
        p = rest.to_string();
    }
    while p.len() > 1 && p.ends_with('/') {
        p.pop();
    }
    if p == "." || p == "/" {
        p.clear();
    }
    p
}

fn is_glob(p: &str) -> bool {
    p.contains(GLOB_META)
}

/// Directory part that precedes the first glob metacharacter.
fn literal_dir(p: &str) -> &str {
    let end = p.find(GLOB_META).unwrap_or(p.len());
    let head = &p[..end];
    match head.rfind('/') {
        Some(i) => &head[..i],
        None => "",
    }
}

/// `parent` equals `child` or is one of its ancestor directories.
fn contains_path(parent: &str, child: &str) -> bool {
    parent.is_empty()
        || child == parent
        || (child.starts_with(parent) && child.as_bytes().get(parent.len()) == Some(&b'/'))
}

fn glob_matches(pattern: &str, path: &str) -> bool {
    Pattern::new(pattern)
        .map(|p| p.matches(path))
        // An unparseable pattern is compared by its literal directory only.
        .unwrap_or(false)
}

/// Overlap test on two normalized patterns.
pub fn patterns_overlap(a: &str, b: &str) -> bool {
    match (is_glob(a), is_glob(b)) {
        (false, false) => contains_path(a, b) || contains_path(b, a),
        (true, false) => glob_matches(a, b) || contains_path(b, literal_dir(a)),
        (false, true) => glob_matches(b, a) || contains_path(a, literal_dir(b)),
        (true, true) => {
            let (da, db) = (literal_dir(a), literal_dir(b));
            contains_path(da, db) || contains_path(db, da)
        }
    }
}
