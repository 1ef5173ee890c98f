//! Read-only repository inspection for the `get_repo_changes` tool.
//!
//! The supervisor reviews what a worker actually did by diffing the worktree
//! against a reference from before the step ran. Inspection never mutates
//! the repository.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use git2::{Delta, DiffOptions, Repository, Sort};
use serde::{Deserialize, Serialize};

/// Aggregated file-level changes between a reference and the working tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub files_added: Vec<PathBuf>,
    pub files_modified: Vec<PathBuf>,
    pub files_deleted: Vec<PathBuf>,
    pub lines_added: u32,
    pub lines_removed: u32,
}

impl ChangeSummary {
    pub fn is_empty(&self) -> bool {
        self.files_added.is_empty()
            && self.files_modified.is_empty()
            && self.files_deleted.is_empty()
    }
}

/// One commit in the inspected range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    pub author: String,
    pub message: String,
    pub time: i64,
}

pub struct RepoInspector {
    repo: Repository,
}

impl RepoInspector {
    pub fn open(worktree: &Path) -> Result<Self> {
        let repo = Repository::open(worktree)
            .with_context(|| format!("Failed to open git repository at {}", worktree.display()))?;
        Ok(Self { repo })
    }

    /// Diff the working tree (including the index and untracked files)
    /// against the tree of `since`, which may be a sha, branch, or other
    /// revspec.
    pub fn changes_since(&self, since: &str) -> Result<ChangeSummary> {
        let base = self
            .repo
            .revparse_single(since)
            .with_context(|| format!("Unknown revision '{}'", since))?
            .peel_to_commit()
            .with_context(|| format!("Revision '{}' does not point at a commit", since))?;
        let base_tree = base.tree()?;

        let mut opts = DiffOptions::new();
        opts.include_untracked(true);

        let diff = self
            .repo
            .diff_tree_to_workdir_with_index(Some(&base_tree), Some(&mut opts))?;

        let mut summary = ChangeSummary::default();
        diff.foreach(
            &mut |delta, _progress| {
                if let Some(path) = delta.new_file().path() {
                    let path_buf = path.to_path_buf();
                    match delta.status() {
                        Delta::Added | Delta::Untracked => summary.files_added.push(path_buf),
                        Delta::Modified => summary.files_modified.push(path_buf),
                        Delta::Deleted => summary.files_deleted.push(path_buf),
                        _ => {}
                    }
                }
                true
            },
            None,
            None,
            Some(&mut |_delta, _hunk, line| {
                match line.origin() {
                    '+' => summary.lines_added += 1,
                    '-' => summary.lines_removed += 1,
                    _ => {}
                }
                true
            }),
        )?;

        Ok(summary)
    }

    /// Commits reachable from HEAD but not from `since`, newest first.
    pub fn commits_since(&self, since: &str) -> Result<Vec<CommitInfo>> {
        let base = self
            .repo
            .revparse_single(since)
            .with_context(|| format!("Unknown revision '{}'", since))?
            .peel_to_commit()?;

        let mut walk = self.repo.revwalk()?;
        walk.push_head()?;
        walk.hide(base.id())?;
        walk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;

        let mut commits = Vec::new();
        for oid in walk {
            let commit = self.repo.find_commit(oid?)?;
            commits.push(CommitInfo {
                sha: commit.id().to_string(),
                author: commit.author().name().unwrap_or("unknown").to_string(),
                message: commit.summary().unwrap_or("").to_string(),
                time: commit.time().seconds(),
            });
        }
        Ok(commits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;
    use std::fs;
    use tempfile::TempDir;

    fn commit_all(repo: &Repository, message: &str) -> String {
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("tester", "tester@localhost").unwrap();
        let parent = repo
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .unwrap()
            .to_string()
    }

    fn repo_with_initial_commit() -> (TempDir, String) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        fs::write(dir.path().join("README.md"), "hello\n").unwrap();
        let sha = commit_all(&repo, "initial");
        (dir, sha)
    }

    #[test]
    fn changes_since_reports_added_and_modified() {
        let (dir, base) = repo_with_initial_commit();
        fs::write(dir.path().join("README.md"), "hello world\n").unwrap();
        fs::write(dir.path().join("new.rs"), "fn main() {}\n").unwrap();

        let inspector = RepoInspector::open(dir.path()).unwrap();
        let summary = inspector.changes_since(&base).unwrap();

        assert_eq!(summary.files_added, vec![PathBuf::from("new.rs")]);
        assert_eq!(summary.files_modified, vec![PathBuf::from("README.md")]);
        assert!(summary.lines_added >= 2);
    }

    #[test]
    fn changes_since_clean_tree_is_empty() {
        let (dir, base) = repo_with_initial_commit();
        let inspector = RepoInspector::open(dir.path()).unwrap();
        let summary = inspector.changes_since(&base).unwrap();
        assert!(summary.is_empty());
    }

    #[test]
    fn commits_since_lists_new_commits_newest_first() {
        let (dir, base) = repo_with_initial_commit();
        let repo = Repository::open(dir.path()).unwrap();
        fs::write(dir.path().join("a.txt"), "a\n").unwrap();
        commit_all(&repo, "add a");
        fs::write(dir.path().join("b.txt"), "b\n").unwrap();
        commit_all(&repo, "add b");

        let inspector = RepoInspector::open(dir.path()).unwrap();
        let commits = inspector.commits_since(&base).unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].message, "add b");
        assert_eq!(commits[1].message, "add a");
    }

    #[test]
    fn unknown_revision_is_an_error() {
        let (dir, _) = repo_with_initial_commit();
        let inspector = RepoInspector::open(dir.path()).unwrap();
        assert!(inspector.changes_since("no-such-ref").is_err());
    }
}
