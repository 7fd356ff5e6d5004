use crate::git;
use crate::guard::StashGuard;
use crate::record::{self, TransferRecord};
use crate::utils::unique_token;
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub struct ExportOutcome {
    pub bridge_branch: String,
    pub source_branch: String,
    pub records: usize,
    pub carrier: PathBuf,
    pub remote: String,
}

/// Export the last N commits of `source` as a transfer batch committed onto
/// a disposable branch in `carrier`. Stops short of any network I/O; the
/// push is printed, never performed.
pub fn export(
    source: &Path,
    carrier: &Path,
    count: Option<usize>,
    remote: &str,
    guard: &mut StashGuard,
) -> Result<ExportOutcome> {
    if !git::is_repository(source) {
        return Err(anyhow!("{} is not a git repository", source.display()));
    }
    if !git::is_repository(carrier) {
        return Err(anyhow!("{} is not a git repository", carrier.display()));
    }
    if !git::head_exists(source)? {
        return Err(anyhow!(
            "{} has no commits yet; nothing to export",
            source.display()
        ));
    }
    if git::remote_url(carrier, remote)?.is_none() {
        return Err(anyhow!(
            "Carrier {} has no remote named \"{}\"; the batch would be stranded locally.\n\
             Add one first: git -C {} remote add {} <url>",
            carrier.display(),
            remote,
            carrier.display(),
            remote
        ));
    }

    guard.ensure_clean(source, "export")?;
    guard.ensure_clean(carrier, "export")?;

    let count = resolve_count(source, count)?;
    let commits = git::last_commits_oldest_first(source, count)?;
    if commits.is_empty() {
        return Err(anyhow!("No commits found in {}", source.display()));
    }

    let source_branch = git::current_branch(source)?;
    let bridge_branch = record::bridge_branch_name(&source_branch);
    if git::branch_exists(carrier, &bridge_branch)? {
        return Err(anyhow!(
            "Carrier {} already has branch {} from a previous export.\n\
             Finish or discard that batch first: cbridge cleanup --carrier {} --branch {}",
            carrier.display(),
            bridge_branch,
            carrier.display(),
            bridge_branch
        ));
    }

    let staging = std::env::temp_dir().join(format!("cbridge-export-{}", unique_token()));
    fs::create_dir_all(&staging)
        .with_context(|| format!("Failed to create staging directory {}", staging.display()))?;

    match stage_records(source, &commits, &staging) {
        Ok(()) => {}
        Err(err) => {
            eprintln!(
                "Export aborted; staged records kept for inspection at {}",
                staging.display()
            );
            return Err(err);
        }
    }

    if let Err(err) = land_in_carrier(carrier, &bridge_branch, &staging, commits.len(), &source_branch) {
        eprintln!(
            "Export aborted; staged records kept for inspection at {}",
            staging.display()
        );
        return Err(err);
    }

    // Everything landed; only now is the staging area disposable.
    fs::remove_dir_all(&staging)
        .with_context(|| format!("Failed to remove staging directory {}", staging.display()))?;

    guard.restore_all()?;

    Ok(ExportOutcome {
        bridge_branch,
        source_branch,
        records: commits.len(),
        carrier: carrier.to_path_buf(),
        remote: remote.to_string(),
    })
}

/// Explicit count wins; otherwise the number of commits ahead of upstream;
/// otherwise a single commit, with a warning since that is a guess.
fn resolve_count(source: &Path, requested: Option<usize>) -> Result<usize> {
    if let Some(count) = requested {
        if count == 0 {
            return Err(anyhow!("--count must be at least 1"));
        }
        return Ok(count);
    }

    match git::upstream_ahead_count(source)? {
        Some(ahead) if ahead > 0 => {
            eprintln!("Auto-detected {} unpushed commit(s) to export", ahead);
            Ok(ahead)
        }
        Some(_) => {
            eprintln!(
                "Warning: no unpushed commits detected; defaulting to the last 1 commit.\n\
                 Pass --count to export a different range."
            );
            Ok(1)
        }
        None => {
            eprintln!(
                "Warning: no upstream configured for the current branch; defaulting to the last 1 commit.\n\
                 Pass --count to export a different range."
            );
            Ok(1)
        }
    }
}

fn stage_records(source: &Path, commits: &[String], staging: &Path) -> Result<()> {
    for (position, sha) in commits.iter().enumerate() {
        let index = position + 1;
        let parent = git::parent_of(source, sha)?;
        let base = parent.as_deref().unwrap_or(git::EMPTY_TREE);
        let patch = git::commit_patch(source, base, sha)
            .with_context(|| format!("Failed to compute diff for commit {}", record::short_hash(sha)))?;
        let info = git::commit_info(source, sha)
            .with_context(|| format!("Failed to read metadata for commit {}", record::short_hash(sha)))?;

        let transfer = TransferRecord {
            index,
            sha: sha.clone(),
            parent_sha: parent.unwrap_or_default(),
            author_name: info.author_name,
            author_email: info.author_email,
            date_full: info.author_date,
            commit_subject: info.subject,
            commit_body: info.body,
            committer_name: Some(info.committer_name),
            committer_email: Some(info.committer_email),
            committer_date: Some(info.committer_date),
        };
        transfer.validate()?;
        record::write_pair(staging, &transfer, &patch)?;
        println!(
            "  staged {:03}/{:03}  {}  {}",
            index,
            commits.len(),
            record::short_hash(sha),
            transfer.commit_subject
        );
    }
    Ok(())
}

/// Put the staged batch onto a fresh bridge branch in the carrier as one
/// commit, then put the carrier back on its original branch so the user's
/// other work is unaffected.
fn land_in_carrier(
    carrier: &Path,
    bridge_branch: &str,
    staging: &Path,
    records: usize,
    source_branch: &str,
) -> Result<()> {
    let original_branch = git::current_branch(carrier)?;

    // Branch off the remote-tracking ref so the batch commit sits on top of
    // what the other side will actually have; fall back to local HEAD.
    let start_point = git::tracking_ref(carrier, &original_branch)?.unwrap_or_else(|| "HEAD".to_string());
    git::create_branch_at(carrier, bridge_branch, &start_point)?;

    let result = (|| -> Result<()> {
        let transfer_dir = carrier.join(record::TRANSFER_DIR);
        if transfer_dir.exists() {
            // A stale batch from the branch's start point; this batch replaces it.
            fs::remove_dir_all(&transfer_dir)
                .with_context(|| format!("Failed to clear {}", transfer_dir.display()))?;
        }
        fs::create_dir_all(&transfer_dir)
            .with_context(|| format!("Failed to create {}", transfer_dir.display()))?;

        for entry in fs::read_dir(staging)
            .with_context(|| format!("Failed to read staging directory {}", staging.display()))?
        {
            let entry = entry?;
            let target = transfer_dir.join(entry.file_name());
            fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy record into {}", target.display()))?;
        }

        git::run_git(carrier, &["add", "-A", record::TRANSFER_DIR])?;
        let message = format!(
            "bridge transfer: {} record(s) from branch {}",
            records, source_branch
        );
        git::run_git(carrier, &["commit", "--no-verify", "-m", &message])?;
        Ok(())
    })();

    if let Err(err) = result {
        // Undo the partial landing so the user's branch comes back exactly
        // as it was: unstage, drop the copied records, leave the bridge
        // branch gone. The staging directory still has the full batch.
        let _ = git::run_git(carrier, &["reset", "-q"]);
        let transfer_dir = carrier.join(record::TRANSFER_DIR);
        if transfer_dir.exists() {
            let _ = fs::remove_dir_all(&transfer_dir);
        }
        if git::checkout(carrier, &original_branch).is_ok() {
            let _ = git::delete_branch(carrier, bridge_branch);
        }
        eprintln!(
            "Rolled back the partial landing in {}: cleared {}/ and deleted branch {}",
            carrier.display(),
            record::TRANSFER_DIR,
            bridge_branch
        );
        return Err(err);
    }

    // Come back to the user's branch now that the batch is committed.
    git::checkout(carrier, &original_branch)?;
    Ok(())
}
