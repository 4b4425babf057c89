//! File-backed context provider.
//!
//! Reads project knowledge from the `.orchestra/` directory:
//!
//! ```text
//! .orchestra/rules.md                  always included
//! .orchestra/wiki/*.md                 pages whose name contains the task component
//! .orchestra/skills/<assignee>/SKILL.md   included for that assignee
//! ```
//!
//! Sections are joined with `---`. Missing files are skipped.

use crate::core::task::Task;
use crate::orchestration::collaborators::ContextProvider;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

pub const CONTEXT_DIR: &str = ".orchestra";
const SEPARATOR: &str = "\n\n---\n\n";

#[derive(Debug, Clone)]
pub struct ProjectContext {
    root: PathBuf,
}

impl ProjectContext {
    pub fn new(project_dir: impl AsRef<Path>) -> Self {
        Self {
            root: project_dir.as_ref().join(CONTEXT_DIR),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn rules(&self) -> Option<String> {
        read_non_empty(&self.root.join("rules.md")).await
    }

    async fn wiki_pages(&self, component: &str) -> Vec<String> {
        let Ok(mut entries) = fs::read_dir(self.root.join("wiki")).await else {
            return Vec::new();
        };
        let needle = component.to_lowercase();

        let mut matches = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let matched = path
                .file_stem()
                .and_then(|s| s.to_str())
                .is_some_and(|s| s.to_lowercase().contains(&needle));
            if matched {
                matches.push(path);
            }
        }
        matches.sort();

        let mut pages = Vec::with_capacity(matches.len());
        for path in &matches {
            pages.extend(read_non_empty(path).await);
        }
        pages
    }

    async fn skill(&self, assignee: &str) -> Option<String> {
        if assignee.is_empty() || assignee.contains(['/', '\\']) || assignee.starts_with('.') {
            return None;
        }
        read_non_empty(&self.root.join("skills").join(assignee).join("SKILL.md")).await
    }
}

async fn read_non_empty(path: &Path) -> Option<String> {
    let text = fs::read_to_string(path).await.ok()?;
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        debug!(path = %path.display(), "Loaded context file");
        Some(text.to_string())
    }
}

#[async_trait]
impl ContextProvider for ProjectContext {
    async fn relevant_context(&self, task: &Task) -> String {
        let mut sections: Vec<String> = self.rules().await.into_iter().collect();
        sections.extend(self.wiki_pages(&task.component).await);
        sections.extend(self.skill(&task.assignee).await);
        sections.join(SEPARATOR)
    }

    async fn planning_context(&self) -> String {
        self.rules().await.unwrap_or_default()
    }
}
