mod export;
mod git;
mod guard;
mod import;
mod record;
mod utils;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

#[derive(Parser)]
#[command(name = "cbridge")]
#[command(about = "Commit Bridge CLI - carry commits between unrelated repositories", long_about = None)]
struct Cli {
    /// Stash uncommitted changes automatically and restore them afterwards
    #[arg(long, global = true)]
    auto_stash: bool,

    /// Remote name the carrier repository must have configured
    #[arg(long, global = true, default_value = "origin")]
    remote: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export the last N commits into a batch on a carrier-repo branch
    Export {
        /// Source repository path
        #[arg(long)]
        source: String,

        /// Carrier repository path
        #[arg(long)]
        carrier: String,

        /// Number of commits to export (defaults to unpushed commits, else 1)
        #[arg(long)]
        count: Option<usize>,

        /// Emit structured JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Replay a fetched batch onto the destination's current branch
    Import {
        /// Carrier repository path
        #[arg(long)]
        carrier: String,

        /// Destination repository path
        #[arg(long)]
        dest: String,

        /// Bridge branch to import (auto-discovered when exactly one exists)
        #[arg(long)]
        branch: Option<String>,

        /// Emit structured JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Delete a consumed bridge branch from the carrier
    Cleanup {
        /// Carrier repository path
        #[arg(long)]
        carrier: String,

        /// Bridge branch to delete
        #[arg(long)]
        branch: String,
    },

    /// Guess between export and import from repository state (convenience)
    Auto {
        /// Your working repository
        repo_a: String,

        /// The carrier repository
        repo_b: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BridgeErrorCode {
    NotARepo,
    DirtyTree,
    WrongBranch,
    BatchInvalid,
    PatchFailed,
    NotFound,
    GitFailed,
}

impl BridgeErrorCode {
    fn as_str(&self) -> &'static str {
        match self {
            Self::NotARepo => "NOT_A_REPO",
            Self::DirtyTree => "DIRTY_TREE",
            Self::WrongBranch => "WRONG_BRANCH",
            Self::BatchInvalid => "BATCH_INVALID",
            Self::PatchFailed => "PATCH_FAILED",
            Self::NotFound => "NOT_FOUND",
            Self::GitFailed => "GIT_FAILED",
        }
    }
}

fn classify_error(message: &str) -> BridgeErrorCode {
    let lower = message.to_ascii_lowercase();
    if lower.contains("not a git repository") {
        BridgeErrorCode::NotARepo
    } else if lower.contains("uncommitted changes") || lower.contains("dirty working tree") {
        BridgeErrorCode::DirtyTree
    } else if lower.contains("parent commit") {
        BridgeErrorCode::WrongBranch
    } else if lower.contains("no bridge branches") || lower.contains("no transfer records") || lower.contains("not found") {
        BridgeErrorCode::NotFound
    } else if lower.contains("batch") || lower.contains("missing required string field") {
        BridgeErrorCode::BatchInvalid
    } else if lower.contains("apply") || lower.contains("patch") {
        BridgeErrorCode::PatchFailed
    } else {
        BridgeErrorCode::GitFailed
    }
}

fn main() {
    let cli = Cli::parse();
    let json_mode = is_json_mode(&cli.command);

    if let Err(err) = run(cli) {
        if json_mode {
            let msg = format!("{:#}", err);
            let code = classify_error(&msg);
            let error_json = json!({
                "error_code": code.as_str(),
                "message": msg,
            });
            println!("{}", serde_json::to_string_pretty(&error_json).unwrap_or_default());
        } else {
            eprintln!("{:#}", err);
        }
        std::process::exit(1);
    }
}

fn is_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Export { json, .. } => *json,
        Commands::Import { json, .. } => *json,
        Commands::Cleanup { .. } | Commands::Auto { .. } => false,
    }
}

fn run(cli: Cli) -> Result<()> {
    git::ensure_git_available()?;
    let mut state_guard = guard::StashGuard::new(cli.auto_stash);

    let result = match &cli.command {
        Commands::Export { source, carrier, count, json } => {
            run_export(source, carrier, *count, &cli.remote, *json, &mut state_guard)
        }
        Commands::Import { carrier, dest, branch, json } => {
            run_import(carrier, dest, branch.clone(), *json, &cli.remote, &mut state_guard)
        }
        Commands::Cleanup { carrier, branch } => {
            let carrier = utils::normalize_path(carrier)?;
            import::cleanup(&carrier, branch, &cli.remote)
        }
        Commands::Auto { repo_a, repo_b } => run_auto(repo_a, repo_b, &cli.remote, &mut state_guard),
    };

    if result.is_err() {
        // Never strand a stash silently on a failure path.
        state_guard.report_unrestored();
    }
    result
}

fn run_export(
    source: &str,
    carrier: &str,
    count: Option<usize>,
    remote: &str,
    json: bool,
    state_guard: &mut guard::StashGuard,
) -> Result<()> {
    let source = utils::normalize_path(source)?;
    let carrier = utils::normalize_path(carrier)?;
    let outcome = export::export(&source, &carrier, count, remote, state_guard)?;

    let push_cmd = format!(
        "git -C {} push {} {}",
        outcome.carrier.display(),
        outcome.remote,
        outcome.bridge_branch
    );
    if json {
        let report = json!({
            "mode": "export",
            "records": outcome.records,
            "source_branch": outcome.source_branch,
            "bridge_branch": outcome.bridge_branch,
            "next": [push_cmd],
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "Exported {} record(s) from branch {} onto carrier branch {}",
            outcome.records, outcome.source_branch, outcome.bridge_branch
        );
        println!("Nothing was pushed. To hand the batch over, run:");
        println!("  {}", push_cmd);
    }
    Ok(())
}

fn run_import(
    carrier: &str,
    dest: &str,
    branch: Option<String>,
    json: bool,
    remote: &str,
    state_guard: &mut guard::StashGuard,
) -> Result<()> {
    let carrier = utils::normalize_path(carrier)?;
    let dest = utils::normalize_path(dest)?;
    let outcome = import::import(&carrier, &dest, branch, state_guard)?;

    let push_cmd = format!("git -C {} push", dest.display());
    let cleanup_cmd = format!(
        "cbridge cleanup --carrier {} --branch {}",
        outcome.carrier.display(),
        outcome.bridge_branch
    );
    if json {
        let report = json!({
            "mode": "import",
            "applied": outcome.applied,
            "skipped": outcome.skipped,
            "dest_branch": outcome.dest_branch,
            "bridge_branch": outcome.bridge_branch,
            "remote": remote,
            "next": [push_cmd, cleanup_cmd],
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "Applied {} record(s) onto {} ({} already present)",
            outcome.applied, outcome.dest_branch, outcome.skipped
        );
        println!("Nothing was pushed. Next steps:");
        println!("  {}", push_cmd);
        println!("  {}", cleanup_cmd);
    }
    Ok(())
}

/// Documented heuristic, never the only way in: unpushed commits on repo-a
/// mean export; bridge branches advertised by repo-b mean import. Anything
/// else points at the explicit subcommands.
fn run_auto(repo_a: &str, repo_b: &str, remote: &str, state_guard: &mut guard::StashGuard) -> Result<()> {
    let a = utils::normalize_path(repo_a)?;
    let b = utils::normalize_path(repo_b)?;
    if !git::is_repository(&a) {
        return Err(anyhow!("{} is not a git repository", a.display()));
    }
    if !git::is_repository(&b) {
        return Err(anyhow!("{} is not a git repository", b.display()));
    }

    let ahead = git::upstream_ahead_count(&a)?.unwrap_or(0);
    if ahead > 0 {
        println!("{} is {} commit(s) ahead of upstream; exporting", a.display(), ahead);
        return run_export(repo_a, repo_b, None, remote, false, state_guard);
    }

    let bridge_heads: Vec<String> = git::remote_heads(&a, &b.to_string_lossy())?
        .into_iter()
        .filter(|name| record::is_bridge_branch(name))
        .collect();
    if !bridge_heads.is_empty() {
        println!("{} advertises a bridge batch; importing into {}", b.display(), a.display());
        return run_import(repo_b, repo_a, None, false, remote, state_guard);
    }

    Err(anyhow!(
        "Could not infer a direction: {} has no unpushed commits and {} has no bridge branches.\n\
         Use the explicit subcommands instead:\n\
         \x20 cbridge export --source {} --carrier {}\n\
         \x20 cbridge import --carrier {} --dest {}",
        a.display(),
        b.display(),
        repo_a,
        repo_b,
        repo_b,
        repo_a
    ))
}

#[cfg(test)]
mod tests {
    use super::classify_error;
    use super::BridgeErrorCode;

    #[test]
    fn classifies_dirty_tree_errors() {
        let code = classify_error("/tmp/x has uncommitted changes; export refuses to run");
        assert_eq!(code, BridgeErrorCode::DirtyTree);
    }

    #[test]
    fn classifies_wrong_branch_errors() {
        let code = classify_error("Parent commit 1234abcd of the first record does not exist");
        assert_eq!(code, BridgeErrorCode::WrongBranch);
    }

    #[test]
    fn classifies_missing_batch_as_not_found() {
        let code = classify_error("No bridge branches found in /tmp/carrier");
        assert_eq!(code, BridgeErrorCode::NotFound);
    }

    #[test]
    fn empty_transfer_directory_is_not_found_not_batch_invalid() {
        let code = classify_error(
            "No transfer records found in /tmp/scratch; was this batch exported correctly?",
        );
        assert_eq!(code, BridgeErrorCode::NotFound);
    }

    #[test]
    fn classifies_ordering_mismatch_as_batch_invalid() {
        let code = classify_error("Batch ordering mismatch: x sits at position 2 but carries index 5");
        assert_eq!(code, BridgeErrorCode::BatchInvalid);
    }

    #[test]
    fn unknown_failures_fall_back_to_git_failed() {
        let code = classify_error("something exploded");
        assert_eq!(code, BridgeErrorCode::GitFailed);
    }
}
