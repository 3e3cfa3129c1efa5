//! `git` command-line implementation of the workspace collaborator
//!
//! Each repository gets a clone under the workspace root, created on first
//! acquisition. Commands never prompt and are killed if their future is
//! dropped.

use super::{GitWorkspace, MergeMode, MergeOutcome, PushOutcome};
use crate::error::{Error, Result};
use crate::types::RepositoryId;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, info, trace};

/// Workspace backed by the `git` binary
#[derive(Debug, Clone)]
pub struct GitCli {
    root: PathBuf,
    remote_url: String,
    committer_name: String,
    committer_email: String,
}

impl GitCli {
    /// Create a workspace rooted at `root`.
    ///
    /// `remote_url` is a template; `{owner}` and `{name}` are substituted per
    /// repository.
    pub fn new(
        root: impl Into<PathBuf>,
        remote_url: impl Into<String>,
        committer_name: impl Into<String>,
        committer_email: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            remote_url: remote_url.into(),
            committer_name: committer_name.into(),
            committer_email: committer_email.into(),
        }
    }

    /// Clone URL of a repository
    pub fn clone_url(&self, repo: &RepositoryId) -> String {
        self.remote_url
            .replace("{owner}", &repo.owner)
            .replace("{name}", &repo.name)
    }

    /// Working tree path of a repository
    pub fn repo_path(&self, repo: &RepositoryId) -> PathBuf {
        self.root.join(&repo.owner).join(&repo.name)
    }

    fn command(&self, dir: &Path, args: &[&str]) -> Command {
        let mut cmd = Command::new("git");
        cmd.arg("-c")
            .arg(format!("user.name={}", self.committer_name))
            .arg("-c")
            .arg(format!("user.email={}", self.committer_email))
            .args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);
        cmd
    }

    async fn output(&self, dir: &Path, args: &[&str]) -> Result<Output> {
        trace!(dir = %dir.display(), ?args, "running git");
        self.command(dir, args)
            .output()
            .await
            .map_err(|e| Error::Git(format!("failed to run git: {e}")))
    }

    /// Run git, failing on a non-zero exit; returns trimmed stdout
    async fn run(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let output = self.output(dir, args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Git(format!(
                "git {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run git, reporting only whether it exited successfully
    async fn succeeds(&self, dir: &Path, args: &[&str]) -> Result<bool> {
        Ok(self.output(dir, args).await?.status.success())
    }

    async fn merge_in_progress(&self, path: &Path) -> Result<bool> {
        self.succeeds(path, &["rev-parse", "-q", "--verify", "MERGE_HEAD"])
            .await
    }

    async fn rebase_in_progress(&self, path: &Path) -> Result<bool> {
        let git_dir = self.run(path, &["rev-parse", "--git-dir"]).await?;
        let git_dir = path.join(git_dir);
        Ok(git_dir.join("rebase-merge").exists() || git_dir.join("rebase-apply").exists())
    }

    async fn has_staged_changes(&self, path: &Path) -> Result<bool> {
        Ok(!self
            .succeeds(path, &["diff", "--cached", "--quiet"])
            .await?)
    }

    /// After a failed merge: conflicts are an outcome, anything else an error
    async fn conflicts_or_error(&self, path: &Path, output: &Output, what: &str) -> Result<MergeOutcome> {
        let conflicted = self.conflicted_paths(path).await?;
        if conflicted.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Git(format!("{what} failed: {}", stderr.trim())));
        }
        debug!(paths = ?conflicted, "{what} stopped with conflicts");
        Ok(MergeOutcome::Conflicted(conflicted))
    }

    async fn rebase_onto_current(&self, path: &Path, rev: &str) -> Result<MergeOutcome> {
        let branch = self.run(path, &["symbolic-ref", "--short", "HEAD"]).await?;
        self.run(path, &["checkout", "--detach", rev]).await?;

        let output = self.output(path, &["rebase", &branch]).await?;
        if !output.status.success() {
            return self.conflicts_or_error(path, &output, "rebase").await;
        }

        let rebased = self.run(path, &["rev-parse", "HEAD"]).await?;
        self.run(path, &["checkout", &branch]).await?;
        self.run(path, &["merge", "--ff-only", &rebased]).await?;
        Ok(MergeOutcome::Clean {
            needs_commit: false,
        })
    }
}

/// Join a repository-relative file path, refusing paths that leave the tree
fn resolve_in(root: &Path, file: &str) -> Result<PathBuf> {
    let relative = Path::new(file);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if file.is_empty() || escapes {
        return Err(Error::Git(format!("path outside the workspace: {file}")));
    }
    Ok(root.join(relative))
}

fn is_push_rejection(stderr: &str) -> bool {
    ["rejected", "non-fast-forward", "fetch first"]
        .iter()
        .any(|needle| stderr.contains(needle))
}

#[async_trait]
impl GitWorkspace for GitCli {
    async fn acquire_repo(&self, repo: &RepositoryId) -> Result<PathBuf> {
        let path = self.repo_path(repo);
        if path.join(".git").exists() {
            return Ok(path);
        }

        let parent = path
            .parent()
            .ok_or_else(|| Error::Git(format!("invalid workspace path {}", path.display())))?;
        tokio::fs::create_dir_all(parent).await?;

        let url = self.clone_url(repo);
        let target = path.to_string_lossy().to_string();
        info!(repository = %repo, url = %url, "cloning repository");
        self.run(parent, &["clone", &url, &target]).await?;
        Ok(path)
    }

    async fn release_repo(&self, repo: &RepositoryId, changed: bool) -> Result<()> {
        debug!(repository = %repo, changed, "releasing git workspace");
        Ok(())
    }

    async fn fetch(&self, path: &Path, remote: &str) -> Result<()> {
        self.run(path, &["fetch", "--prune", remote]).await?;
        Ok(())
    }

    async fn checkout(&self, path: &Path, branch: &str) -> Result<()> {
        self.run(path, &["checkout", branch]).await?;
        Ok(())
    }

    async fn reset_hard(&self, path: &Path, rev: &str) -> Result<()> {
        self.run(path, &["reset", "--hard", rev]).await?;
        self.run(path, &["clean", "-fd"]).await?;
        Ok(())
    }

    async fn rev_parse(&self, path: &Path, rev: &str) -> Result<String> {
        self.run(path, &["rev-parse", "--verify", rev]).await
    }

    async fn merge(&self, path: &Path, rev: &str, mode: MergeMode) -> Result<MergeOutcome> {
        match mode {
            MergeMode::NoCommitNoFf => {
                let output = self
                    .output(path, &["merge", "--no-commit", "--no-ff", rev])
                    .await?;
                if !output.status.success() {
                    return self.conflicts_or_error(path, &output, "merge").await;
                }
                Ok(MergeOutcome::Clean {
                    needs_commit: self.merge_in_progress(path).await?,
                })
            }
            MergeMode::Squash => {
                let output = self.output(path, &["merge", "--squash", rev]).await?;
                if !output.status.success() {
                    return self.conflicts_or_error(path, &output, "squash merge").await;
                }
                Ok(MergeOutcome::Clean {
                    needs_commit: self.has_staged_changes(path).await?,
                })
            }
            MergeMode::Rebase => self.rebase_onto_current(path, rev).await,
        }
    }

    async fn merge_abort(&self, path: &Path) -> Result<()> {
        if self.rebase_in_progress(path).await? {
            self.run(path, &["rebase", "--abort"]).await?;
        }
        if self.merge_in_progress(path).await? {
            self.run(path, &["merge", "--abort"]).await?;
        }
        // Squash merges leave no MERGE_HEAD; drop whatever is staged
        self.run(path, &["reset", "--hard", "HEAD"]).await?;
        Ok(())
    }

    async fn conflicted_paths(&self, path: &Path) -> Result<Vec<String>> {
        let stdout = self
            .run(path, &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Invalid UTF-8 is replaced so binary or legacy-encoded conflicts still report
    async fn read_file(&self, path: &Path, file: &str) -> Result<String> {
        let full = resolve_in(path, file)?;
        let bytes = tokio::fs::read(full).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn write_file(&self, path: &Path, file: &str, content: &str) -> Result<()> {
        let full = resolve_in(path, file)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(full, content).await?;
        Ok(())
    }

    async fn stage(&self, path: &Path, file: &str) -> Result<()> {
        resolve_in(path, file)?;
        self.run(path, &["add", "--", file]).await?;
        Ok(())
    }

    async fn commit(&self, path: &Path, message: &str) -> Result<String> {
        self.run(path, &["commit", "--no-verify", "-m", message])
            .await?;
        self.run(path, &["rev-parse", "HEAD"]).await
    }

    async fn push(&self, path: &Path, remote: &str, branch: &str) -> Result<PushOutcome> {
        let refspec = format!("HEAD:refs/heads/{branch}");
        let output = self.output(path, &["push", remote, &refspec]).await?;
        if output.status.success() {
            info!(branch, "pushed");
            return Ok(PushOutcome::Pushed);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if is_push_rejection(&stderr) {
            return Ok(PushOutcome::Rejected(stderr));
        }
        Err(Error::Git(format!("git push failed: {stderr}")))
    }
}
