//! mergeq - merge queue service and client

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use mergeq::types::{EntryId, MergeMethod, RepositoryId};
use std::path::PathBuf;

mod cli;

use cli::context::{CommandContext, load_config};
use cli::queue::AddOptions;

/// Merge queue for pull requests
///
/// Serializes merges into each repository's base branch: queued pull
/// requests wait for their checks, the head of the queue is checked for
/// conflicts against the latest base and merged one at a time.
#[derive(Parser)]
#[command(name = "mergeq")]
#[command(version, about)]
#[command(propagate_version = true)]
struct Cli {
    /// Config file (default: <config dir>/mergeq/config.toml)
    #[arg(long, global = true, env = "MERGEQ_CONFIG")]
    config: Option<PathBuf>,

    /// Queue service address for client commands (default: from `listen`)
    #[arg(long, global = true, env = "MERGEQ_SERVER")]
    server: Option<String>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the queue service
    Serve {
        /// Address to bind (overrides `listen`)
        #[arg(long)]
        listen: Option<String>,
    },

    /// Inspect and manage a repository's queue
    #[command(subcommand)]
    Queue(QueueCommands),

    /// Inspect and resolve conflicts of a queue entry
    #[command(subcommand)]
    Conflicts(ConflictCommands),

    /// Show the check state of a pull request
    Checks {
        /// Repository (owner/name)
        repo: RepositoryId,
        /// Pull request number
        number: u64,
    },

    /// Verify GitHub credentials
    Auth {
        /// Repository to test against (default: first configured)
        repo: Option<RepositoryId>,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// List queued entries
    List {
        /// Repository (owner/name)
        repo: RepositoryId,
        /// Show finished entries instead
        #[arg(long)]
        history: bool,
    },
    /// Add a pull request to the queue
    Add(AddArgs),
    /// Remove an entry from the queue
    Remove {
        /// Repository (owner/name)
        repo: RepositoryId,
        /// Entry ID
        entry: EntryId,
        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Replace the queue order
    Reorder {
        /// Repository (owner/name)
        repo: RepositoryId,
        /// Every active entry ID, in the new order
        #[arg(required = true)]
        entries: Vec<EntryId>,
    },
}

#[derive(Args)]
struct AddArgs {
    /// Repository (owner/name)
    repo: RepositoryId,
    /// Pull request number
    number: u64,
    /// Higher merges sooner
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    priority: i32,
    /// Merge method: merge, squash or rebase
    #[arg(long, default_value = "merge")]
    method: MergeMethod,
    /// Stack the pull request belongs to
    #[arg(long, requires = "depth")]
    stack: Option<String>,
    /// Position within the stack (0 = base-most)
    #[arg(long, requires = "stack")]
    depth: Option<u32>,
}

#[derive(Subcommand)]
enum ConflictCommands {
    /// Run conflict detection for an entry
    Show {
        /// Repository (owner/name)
        repo: RepositoryId,
        /// Entry ID
        entry: EntryId,
        /// Print file contents with markers
        #[arg(long)]
        full: bool,
    },
    /// Submit resolved files for an entry
    Resolve {
        /// Repository (owner/name)
        repo: RepositoryId,
        /// Entry ID
        entry: EntryId,
        /// Resolved paths, relative to --dir
        #[arg(required = true)]
        paths: Vec<String>,
        /// Directory holding the resolved files
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "warn,mergeq=info",
        1 => "debug",
        _ => "trace",
    };
    mergeq::telemetry::init_tracing(cli.json_logs, level);

    let config_path = cli.config.as_deref();
    let server = cli.server.as_deref();

    match cli.command {
        Commands::Serve { listen } => {
            let config = load_config(config_path)?;
            cli::serve::run_serve(config, listen).await?;
        }
        Commands::Queue(command) => {
            let ctx = CommandContext::new(config_path, server)?;
            match command {
                QueueCommands::List { repo, history } => {
                    cli::queue::run_list(&ctx, &repo, history).await?;
                }
                QueueCommands::Add(args) => {
                    let options = AddOptions {
                        number: args.number,
                        priority: args.priority,
                        method: args.method,
                        stack: args.stack.zip(args.depth),
                    };
                    cli::queue::run_add(&ctx, &args.repo, options).await?;
                }
                QueueCommands::Remove { repo, entry, yes } => {
                    cli::queue::run_remove(&ctx, &repo, entry, yes).await?;
                }
                QueueCommands::Reorder { repo, entries } => {
                    cli::queue::run_reorder(&ctx, &repo, entries).await?;
                }
            }
        }
        Commands::Conflicts(command) => {
            let ctx = CommandContext::new(config_path, server)?;
            match command {
                ConflictCommands::Show { repo, entry, full } => {
                    cli::conflicts::run_show(&ctx, &repo, entry, full).await?;
                }
                ConflictCommands::Resolve {
                    repo,
                    entry,
                    paths,
                    dir,
                } => {
                    cli::conflicts::run_resolve(&ctx, &repo, entry, &paths, &dir).await?;
                }
            }
        }
        Commands::Checks { repo, number } => {
            let ctx = CommandContext::new(config_path, server)?;
            cli::queue::run_checks(&ctx, &repo, number).await?;
        }
        Commands::Auth { repo } => {
            let config = load_config(config_path)?;
            cli::auth::run_auth_test(&config, repo).await?;
        }
    }

    Ok(())
}
