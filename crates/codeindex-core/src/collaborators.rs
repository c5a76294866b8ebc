//! Trait contracts for components the daemon core does not implement
//! (spec §1, §6): the embedding provider, the source chunker, and the
//! git-topology differ. These are capability structs injected at startup,
//! not duck-typed globals — the daemon receives them as trait objects.
//!
//! `GitCliTopology` is the one concrete implementation shipped here: it is
//! a thin wrapper around the system `git` binary, not a new external
//! integration, and the watch-mode tests need something real to run
//! against.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{IndexError, Result};

/// A chunk of source ready for embedding + indexing.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub text: String,
    pub line_start: u32,
    pub line_end: u32,
    pub language: String,
}

/// `embed(texts) -> vectors`. May block on network; failures propagate as
/// query errors, not as cache corruption.
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
    fn dimensions(&self) -> usize;
}

/// Splits a file's content into indexable chunks.
pub trait Chunker: Send + Sync {
    fn chunk(&self, path: &Path, content: &str) -> Result<Vec<Chunk>>;
}

/// Result of comparing two git refs: the changed-file set plus, if the
/// comparison fell back to branch-vs-branch, the merge base used.
#[derive(Debug, Clone, Default)]
pub struct BranchChange {
    pub changed_files: Vec<PathBuf>,
    pub merge_base: Option<String>,
}

/// `analyze_branch_change` — when `old_branch == new_branch` and both
/// commits exist and differ, implementations MUST use commit comparison
/// (`git diff --name-only old..new`); otherwise fall back to a
/// branch-vs-branch diff.
pub trait GitTopology: Send + Sync {
    fn analyze_branch_change(
        &self,
        old_branch: &str,
        new_branch: &str,
        old_commit: Option<&str>,
        new_commit: Option<&str>,
    ) -> Result<BranchChange>;
}

/// Client-side progress sink. `handle_setup_message` carries `total == 0`
/// scroll lines emitted before the progress bar appears.
pub trait ProgressRenderer: Send + Sync {
    fn handle_setup_message(&self, info: &str);
    fn start_bottom_display(&self);
    fn update(
        &self,
        current: usize,
        total: usize,
        path: &str,
        info: &str,
        concurrent_files: Option<&[crate::types::FileStatus]>,
    );
    fn stop(&self);
}

/// Shells out to the system `git` binary. Not a requirement of the spec —
/// any `GitTopology` implementation may be swapped in at daemon startup.
pub struct GitCliTopology {
    pub repo_root: PathBuf,
}

impl GitCliTopology {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    fn run_git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo_root)
            .args(args)
            .output()
            .map_err(|e| IndexError::ExternalFailure(format!("git spawn failed: {e}")))?;
        if !output.status.success() {
            return Err(IndexError::ExternalFailure(format!(
                "git {:?} exited with {:?}",
                args, output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl GitTopology for GitCliTopology {
    fn analyze_branch_change(
        &self,
        old_branch: &str,
        new_branch: &str,
        old_commit: Option<&str>,
        new_commit: Option<&str>,
    ) -> Result<BranchChange> {
        // Fixes a prior same-branch-commit detection gap: when the branch
        // name is unchanged but the commit moved, compare commits directly
        // rather than diffing the branch against itself.
        if old_branch == new_branch {
            if let (Some(old), Some(new)) = (old_commit, new_commit) {
                if old != new {
                    let range = format!("{old}..{new}");
                    let out = self.run_git(&["diff", "--name-only", &range])?;
                    let changed_files = out.lines().map(PathBuf::from).collect();
                    return Ok(BranchChange {
                        changed_files,
                        merge_base: None,
                    });
                }
            }
            return Ok(BranchChange::default());
        }

        let range = format!("{old_branch}...{new_branch}");
        let merge_base = self
            .run_git(&["merge-base", old_branch, new_branch])
            .ok()
            .map(|s| s.trim().to_string());
        let out = self.run_git(&["diff", "--name-only", &range])?;
        let changed_files = out.lines().map(PathBuf::from).collect();
        Ok(BranchChange {
            changed_files,
            merge_base,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubEmbedding;

    impl EmbeddingProvider for StubEmbedding {
        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.0; 4]).collect())
        }

        fn dimensions(&self) -> usize {
            4
        }
    }

    #[test]
    fn stub_embedding_provider_returns_fixed_dimension_vectors() {
        let provider = StubEmbedding;
        let vectors = provider
            .embed(&["fn main() {}".to_string(), "struct X;".to_string()])
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].len(), 4);
    }

    #[test]
    fn same_branch_unchanged_commit_reports_no_changes() {
        // No real git repo needed: old_commit == new_commit short-circuits
        // before any git invocation.
        let topology = GitCliTopology::new(".");
        let result = topology
            .analyze_branch_change("main", "main", Some("abc"), Some("abc"))
            .unwrap();
        assert!(result.changed_files.is_empty());
    }
}
