//! Queue commands - list, add, remove and reorder entries

use crate::cli::context::CommandContext;
use crate::cli::style::{Stylize, check, status_label};
use anstream::println;
use dialoguer::Confirm;
use mergeq::api::EnqueueBody;
use mergeq::error::{Error, Result};
use mergeq::types::{EntryId, MergeMethod, QueueEntry, RepositoryId, StackId, StackMembership};

/// Options for `queue add`
#[derive(Debug, Clone)]
pub struct AddOptions {
    /// Change request number
    pub number: u64,
    /// Higher merges sooner
    pub priority: i32,
    /// Merge method
    pub method: MergeMethod,
    /// Stack name and depth
    pub stack: Option<(String, u32)>,
}

/// List the active queue (or its history)
pub async fn run_list(ctx: &CommandContext, repo: &RepositoryId, history: bool) -> Result<()> {
    if history {
        let entries = ctx.client.history(repo).await?;
        if entries.is_empty() {
            println!("{}", "No finished entries.".muted());
            return Ok(());
        }
        println!("{} {}", "History of".emphasis(), repo.accent());
        for entry in entries.iter().rev() {
            print_history_line(entry);
        }
        return Ok(());
    }

    let items = ctx.client.list(repo).await?;
    if items.is_empty() {
        println!("{}", format!("Queue for {repo} is empty.").muted());
        return Ok(());
    }

    println!("{} {}", "Queue for".emphasis(), repo.accent());
    for item in &items {
        let entry = &item.entry;
        let position = entry.position.map_or_else(|| "-".to_string(), |p| p.to_string());
        println!(
            "  {:>3}  #{:<6} {:<12} {}",
            position,
            entry.change_request,
            status_label(entry.status),
            item.title.as_deref().unwrap_or("(unknown title)")
        );
        let mut details = vec![format!("ci {}", entry.ci_status), format!("by {}", entry.added_by)];
        if let Some(author) = &item.author {
            details.push(format!("author {author}"));
        }
        if entry.priority != 0 {
            details.push(format!("priority {}", entry.priority));
        }
        if let Some(stack) = &entry.stack {
            details.push(format!("stack {}[{}]", stack.id, stack.depth));
        }
        if entry.cancel_requested {
            details.push("cancel requested".to_string());
        }
        println!("             {}", details.join(", ").muted());
        println!("             {}", entry.id.to_string().muted());
    }
    Ok(())
}

fn print_history_line(entry: &QueueEntry) {
    let reason = entry
        .failure
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_default();
    println!(
        "  #{:<6} {:<12} {} {}",
        entry.change_request,
        status_label(entry.status),
        entry.updated_at.format("%Y-%m-%d %H:%M").to_string().muted(),
        reason.warn()
    );
    if entry.resolvable {
        println!(
            "          {} {}",
            "awaiting conflict resolution:".warn(),
            entry.id.to_string().accent()
        );
    }
}

/// Admit a change request
pub async fn run_add(ctx: &CommandContext, repo: &RepositoryId, options: AddOptions) -> Result<()> {
    let body = EnqueueBody {
        number: options.number,
        priority: options.priority,
        merge_method: options.method,
        stack: options
            .stack
            .map(|(id, depth)| StackMembership { id: StackId(id), depth }),
        added_by: Some(whoami()),
    };
    let entry = ctx.client.enqueue(repo, &body).await?;
    println!(
        "{} Queued #{} as {} ({})",
        check().success(),
        entry.change_request,
        entry.id.to_string().accent(),
        status_label(entry.status)
    );
    if let Some(position) = entry.position {
        println!("  {}", format!("position {position}").muted());
    }
    Ok(())
}

/// Cancel an entry, asking for confirmation unless `yes`
pub async fn run_remove(ctx: &CommandContext, repo: &RepositoryId, id: EntryId, yes: bool) -> Result<()> {
    let entry = ctx.client.get(repo, id).await?;
    if !entry.is_active() {
        println!(
            "{}",
            format!("Entry for #{} is already {}.", entry.change_request, entry.status).muted()
        );
        return Ok(());
    }

    if !yes
        && !Confirm::new()
            .with_prompt(format!("Remove #{} from the queue?", entry.change_request))
            .default(false)
            .interact()
            .map_err(|e| Error::Internal(format!("Failed to read confirmation: {e}")))?
    {
        println!("{}", "Aborted".muted());
        return Ok(());
    }

    let response = ctx.client.cancel(repo, id).await?;
    if response.deferred {
        println!(
            "{}",
            format!(
                "#{} is merging; it will be cancelled if the merge does not complete.",
                response.entry.change_request
            )
            .warn()
        );
    } else {
        println!(
            "{} Removed #{}",
            check().success(),
            response.entry.change_request
        );
    }
    Ok(())
}

/// Replace the queue order
pub async fn run_reorder(ctx: &CommandContext, repo: &RepositoryId, entries: Vec<EntryId>) -> Result<()> {
    let ordered = ctx.client.reorder(repo, entries).await?;
    println!("{} Reordered {}", check().success(), repo.accent());
    for entry in &ordered {
        println!(
            "  {:>3}  #{}",
            entry.position.unwrap_or_default(),
            entry.change_request
        );
    }
    Ok(())
}

/// Show the check state of a change request
pub async fn run_checks(ctx: &CommandContext, repo: &RepositoryId, number: u64) -> Result<()> {
    let report = ctx.client.checks(repo, number).await?;
    println!(
        "{} #{}: {}",
        "Checks for".emphasis(),
        number,
        report.mergeable.to_string().accent()
    );
    println!(
        "  {}",
        format!(
            "{} passed, {} failed, {} pending, {} neutral",
            report.summary.passed, report.summary.failed, report.summary.pending, report.summary.neutral
        )
        .muted()
    );
    for name in &report.required.missing {
        println!("  {} {}", "missing".warn(), name);
    }
    for name in &report.required.failing {
        println!("  {} {}", "failing".warn(), name);
    }
    for run in &report.runs {
        let state = run
            .conclusion
            .map_or_else(|| format!("{:?}", run.status), |c| format!("{c:?}"));
        println!("  {:<24} {}", run.name, state.to_lowercase().muted());
    }
    Ok(())
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "cli".to_string())
}
