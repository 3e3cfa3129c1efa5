//! Throwaway git remote for exercising the `git` workspace end to end

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args([
            "-c",
            "user.name=Test",
            "-c",
            "user.email=test@example.com",
            "-c",
            "init.defaultBranch=main",
            "-c",
            "commit.gpgsign=false",
        ])
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to run git");
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A bare `origin.git` plus a `seed` clone used to push history into it
pub struct TempGitRemote {
    dir: TempDir,
}

impl TempGitRemote {
    /// Whether a `git` binary is on the path
    pub fn available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success())
    }

    /// Remote with `main` holding `src/a.ts`
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        git(dir.path(), &["init", "--bare", "origin.git"]);
        git(dir.path(), &["clone", "origin.git", "seed"]);
        let remote = Self { dir };
        remote.commit("src/a.ts", "const a = 0;\n", "initial");
        remote.push("main");
        remote
    }

    pub fn origin(&self) -> PathBuf {
        self.dir.path().join("origin.git")
    }

    /// Root for workspaces under test
    pub fn workspaces(&self) -> PathBuf {
        self.dir.path().join("work")
    }

    fn seed(&self) -> PathBuf {
        self.dir.path().join("seed")
    }

    /// Create `name` from `from` and check it out
    pub fn branch(&self, name: &str, from: &str) {
        git(&self.seed(), &["checkout", "-b", name, from]);
    }

    pub fn switch(&self, name: &str) {
        git(&self.seed(), &["checkout", name]);
    }

    pub fn commit(&self, file: &str, content: &str, message: &str) {
        let path = self.seed().join(file);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
        git(&self.seed(), &["add", file]);
        git(&self.seed(), &["commit", "-m", message]);
    }

    pub fn push(&self, branch: &str) {
        git(&self.seed(), &["push", "origin", branch]);
    }

    /// Commit a branch points at in the remote
    pub fn rev(&self, branch: &str) -> String {
        git(&self.origin(), &["rev-parse", branch])
    }

    /// File content at the tip of a remote branch
    pub fn show(&self, branch: &str, file: &str) -> String {
        git(&self.origin(), &["show", &format!("{branch}:{file}")])
    }
}
