//! Conflicts command - inspect and resolve a parked entry

use crate::cli::context::CommandContext;
use crate::cli::style::{Stylize, check, status_label};
use anstream::println;
use mergeq::conflicts::{CONFLICT_MARKER, Resolution};
use mergeq::error::{Error, Result};
use mergeq::types::{EntryId, RepositoryId};
use std::path::Path;

/// Run detection and print the conflicted files
pub async fn run_show(ctx: &CommandContext, repo: &RepositoryId, id: EntryId, full: bool) -> Result<()> {
    let report = ctx.client.conflicts(repo, id).await?;
    if report.is_clean() {
        println!(
            "{} Merges cleanly onto {}",
            check().success(),
            short(&report.base_sha).muted()
        );
        return Ok(());
    }

    println!(
        "{} {} file(s) against {}",
        "Conflicts in".warn(),
        report.files.len(),
        short(&report.base_sha).muted()
    );
    for file in &report.files {
        let markers = file.content.matches(CONFLICT_MARKER).count();
        println!("  {} {}", file.path.accent(), format!("({markers} hunk(s))").muted());
        if full {
            println!("{}", file.content);
        }
    }
    Ok(())
}

/// Submit resolved contents read from `dir` for each path
pub async fn run_resolve(
    ctx: &CommandContext,
    repo: &RepositoryId,
    id: EntryId,
    paths: &[String],
    dir: &Path,
) -> Result<()> {
    if paths.is_empty() {
        return Err(Error::Config("no resolved paths given".to_string()));
    }

    let mut resolutions = Vec::with_capacity(paths.len());
    for path in paths {
        let content = std::fs::read_to_string(dir.join(path))?;
        if content.contains(CONFLICT_MARKER) {
            println!("{}", format!("{path} still contains conflict markers").warn());
        }
        resolutions.push(Resolution {
            path: path.clone(),
            content,
        });
    }

    let entry = ctx.client.resolve(repo, id, resolutions).await?;
    println!(
        "{} #{} is {}",
        check().success(),
        entry.change_request,
        status_label(entry.status)
    );
    if let Some(sha) = &entry.merge_sha {
        println!("  {}", format!("merged as {}", short(sha)).muted());
    }
    Ok(())
}

fn short(sha: &str) -> &str {
    sha.get(..12).unwrap_or(sha)
}
