use crate::git;
use crate::guard::StashGuard;
use crate::record::{self, TransferRecord};
use crate::utils::unique_token;
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub struct ImportOutcome {
    pub applied: usize,
    pub skipped: usize,
    pub bridge_branch: String,
    pub dest_branch: String,
    pub carrier: PathBuf,
}

/// Replay a transfer batch from `carrier` onto the current branch of `dest`.
///
/// The fetched bridge ref is never checked out: its tree holds only the
/// transfer directory, and checking it out would wipe the destination's
/// project files from the working tree. Records are extracted by reading the
/// fetched tree directly.
pub fn import(
    carrier: &Path,
    dest: &Path,
    branch: Option<String>,
    guard: &mut StashGuard,
) -> Result<ImportOutcome> {
    if !git::is_repository(carrier) {
        return Err(anyhow!("{} is not a git repository", carrier.display()));
    }
    if !git::is_repository(dest) {
        return Err(anyhow!("{} is not a git repository", dest.display()));
    }

    guard.ensure_clean(dest, "import")?;

    let carrier_loc = carrier.to_string_lossy().to_string();
    let bridge_branch = resolve_branch(dest, &carrier_loc, branch)?;
    let dest_branch = git::current_branch(dest)?;

    git::fetch_branch(dest, &carrier_loc, &bridge_branch)
        .with_context(|| format!("Failed to fetch {} from {}", bridge_branch, carrier.display()))?;

    // Anchor the fetched commit under a local ref for the duration of the
    // import. This branch only holds the batch; it is never checked out.
    let staging_branch = format!("cbridge-import-{}", unique_token());
    git::create_branch_ref(dest, &staging_branch, "FETCH_HEAD")?;

    let scratch = std::env::temp_dir().join(format!("cbridge-import-{}", unique_token()));
    let batch = match extract_batch(dest, &staging_branch, &scratch) {
        Ok(batch) => batch,
        Err(err) => {
            let _ = git::delete_branch(dest, &staging_branch);
            let _ = fs::remove_dir_all(&scratch);
            return Err(err);
        }
    };

    // Whole-batch validation happens before any patch touches the tree; a
    // failure here leaves no trace behind.
    let validated = (|| -> Result<()> {
        for (_, transfer) in &batch {
            transfer.validate()?;
        }
        check_first_parent(dest, &batch[0].1)
    })();
    if let Err(err) = validated {
        let _ = fs::remove_dir_all(&scratch);
        let _ = git::delete_branch(dest, &staging_branch);
        return Err(err);
    }

    let mut applied = 0usize;
    let mut skipped = 0usize;
    for (patch_path, transfer) in &batch {
        match replay_record(dest, patch_path, transfer, batch.len())? {
            Replay::Applied => applied += 1,
            Replay::AlreadyPresent => skipped += 1,
            Replay::Failed(err) => {
                eprintln!(
                    "Import stopped at record {:03} ({}). {} record(s) were already committed.",
                    transfer.index,
                    record::short_hash(&transfer.sha),
                    applied
                );
                eprintln!(
                    "The working tree was left as the failed apply produced it, for diagnosis.\n\
                     Extracted records remain at {}\n\
                     The fetched batch remains anchored at branch {}\n\
                     Inspect with: git -C {} status && git -C {} apply --check {}",
                    scratch.display(),
                    staging_branch,
                    dest.display(),
                    dest.display(),
                    patch_path.display()
                );
                return Err(err);
            }
        }
    }

    fs::remove_dir_all(&scratch)
        .with_context(|| format!("Failed to remove scratch directory {}", scratch.display()))?;
    git::delete_branch(dest, &staging_branch)?;

    // The working branch never changed during replay; double-check before
    // declaring success.
    let now = git::current_branch(dest)?;
    if now != dest_branch {
        git::checkout(dest, &dest_branch)?;
    }

    guard.restore_all()?;

    Ok(ImportOutcome {
        applied,
        skipped,
        bridge_branch,
        dest_branch,
        carrier: carrier.to_path_buf(),
    })
}

/// Delete a consumed bridge branch in the carrier. Local deletion only; the
/// remote deletion command is printed for the operator.
pub fn cleanup(carrier: &Path, branch: &str, remote: &str) -> Result<()> {
    if !git::is_repository(carrier) {
        return Err(anyhow!("{} is not a git repository", carrier.display()));
    }
    if !record::is_bridge_branch(branch) {
        return Err(anyhow!(
            "{} does not look like a bridge branch (expected {}...{}); refusing to delete it",
            branch,
            record::BRANCH_PREFIX,
            record::BRANCH_SUFFIX
        ));
    }

    if git::branch_exists(carrier, branch)? {
        let current = git::current_branch(carrier)?;
        if current == branch {
            return Err(anyhow!(
                "Carrier {} has {} checked out; switch branches before cleanup",
                carrier.display(),
                branch
            ));
        }
        git::delete_branch(carrier, branch)?;
        println!("Deleted local branch {} in {}", branch, carrier.display());
    } else {
        println!("No local branch {} in {}; nothing to delete", branch, carrier.display());
    }

    println!(
        "If the branch was pushed, remove it remotely with:\n  git -C {} push {} --delete {}",
        carrier.display(),
        remote,
        branch
    );
    Ok(())
}

/// Pick the bridge branch to import. Explicit name wins; otherwise exactly
/// one advertised bridge head is required.
fn resolve_branch(dest: &Path, carrier_loc: &str, requested: Option<String>) -> Result<String> {
    if let Some(branch) = requested {
        return Ok(branch);
    }

    let heads: Vec<String> = git::remote_heads(dest, carrier_loc)?
        .into_iter()
        .filter(|name| record::is_bridge_branch(name))
        .collect();

    match heads.len() {
        0 => Err(anyhow!(
            "No bridge branches found in {}; has the export side pushed its batch?",
            carrier_loc
        )),
        1 => {
            println!("Auto-discovered bridge branch {}", heads[0]);
            Ok(heads[0].clone())
        }
        _ => {
            let mut listing = String::new();
            for head in &heads {
                listing.push_str(&format!(
                    "  cbridge import --carrier {} --dest . --branch {}\n",
                    carrier_loc, head
                ));
            }
            Err(anyhow!(
                "Multiple bridge branches exist in {}; pick one explicitly:\n{}",
                carrier_loc,
                listing.trim_end()
            ))
        }
    }
}

/// Read the transfer directory out of the fetched ref's tree into `scratch`
/// without switching branches, then load and order the batch.
fn extract_batch(
    dest: &Path,
    staging_branch: &str,
    scratch: &Path,
) -> Result<Vec<(PathBuf, TransferRecord)>> {
    let blobs = git::tree_blobs(dest, staging_branch, record::TRANSFER_DIR)?;
    if blobs.is_empty() {
        return Err(anyhow!(
            "The fetched branch contains no {}/ directory; it is not a bridge batch",
            record::TRANSFER_DIR
        ));
    }

    fs::create_dir_all(scratch)
        .with_context(|| format!("Failed to create scratch directory {}", scratch.display()))?;
    for (oid, tree_path) in &blobs {
        let name = tree_path
            .strip_prefix(&format!("{}/", record::TRANSFER_DIR))
            .unwrap_or(tree_path);
        if name.contains('/') {
            return Err(anyhow!(
                "Unexpected nested entry {} in the transfer directory; the batch is malformed",
                tree_path
            ));
        }
        let bytes = git::blob_bytes(dest, oid)?;
        let target = scratch.join(name);
        fs::write(&target, bytes)
            .with_context(|| format!("Failed to write {}", target.display()))?;
    }

    record::load_batch(scratch)
}

/// Primary defense against the wrong-branch failure class: the first
/// record's parent must already exist here, unless that record is a root
/// commit. Later records stack on each other, not on prior destination state.
fn check_first_parent(dest: &Path, first: &TransferRecord) -> Result<()> {
    if first.is_root_commit() {
        return Ok(());
    }
    if !git::object_exists(dest, &first.parent_sha)? {
        return Err(anyhow!(
            "Parent commit {} of the first record does not exist in {}.\n\
             This usually means the destination is on the wrong branch or is the wrong repository.\n\
             Nothing was applied. Verify with: git -C {} log --oneline -5",
            record::short_hash(&first.parent_sha),
            dest.display(),
            dest.display()
        ));
    }
    Ok(())
}

enum Replay {
    Applied,
    AlreadyPresent,
    Failed(anyhow::Error),
}

fn replay_record(
    dest: &Path,
    patch_path: &Path,
    transfer: &TransferRecord,
    total: usize,
) -> Result<Replay> {
    // Re-runs after an interruption skip what already landed.
    if git::object_exists(dest, &transfer.sha)? {
        println!(
            "  skip  {:03}/{:03}  {}  already present",
            transfer.index,
            total,
            record::short_hash(&transfer.sha)
        );
        return Ok(Replay::AlreadyPresent);
    }

    let patch_len = fs::metadata(patch_path)
        .with_context(|| format!("Failed to stat {}", patch_path.display()))?
        .len();
    let empty_change = patch_len == 0;

    if !empty_change {
        // Dry-run first: a record that cannot apply must not touch the tree.
        if let Err(err) = git::apply_check(dest, patch_path) {
            return Ok(Replay::Failed(err.context(format!(
                "Record {:03} ({}) failed its applicability check; files the patch expects may be \
                 missing or different in {}",
                transfer.index,
                record::short_hash(&transfer.sha),
                dest.display()
            ))));
        }
        if let Err(err) = git::apply_patch(dest, patch_path) {
            return Ok(Replay::Failed(err.context(format!(
                "Record {:03} ({}) passed the dry run but failed to apply",
                transfer.index,
                record::short_hash(&transfer.sha)
            ))));
        }
        if let Err(err) = git::add_all(dest) {
            return Ok(Replay::Failed(err));
        }
    }

    let (committer_name, committer_email, committer_date) = transfer.effective_committer();
    let attribution = git::CommitAttribution {
        author_name: transfer.author_name.clone(),
        author_email: transfer.author_email.clone(),
        author_date: transfer.date_full.clone(),
        committer_name,
        committer_email,
        committer_date,
    };

    let new_sha = match git::commit_with_attribution(
        dest,
        &transfer.commit_message(),
        &attribution,
        empty_change,
    ) {
        Ok(sha) => sha,
        Err(err) => {
            return Ok(Replay::Failed(err.context(format!(
                "Record {:03} ({}) applied but committing it failed",
                transfer.index,
                record::short_hash(&transfer.sha)
            ))))
        }
    };

    let preserved = if new_sha == transfer.sha { "  (sha preserved)" } else { "" };
    println!(
        "  apply {:03}/{:03}  {} -> {}{}  {}",
        transfer.index,
        total,
        record::short_hash(&transfer.sha),
        record::short_hash(&new_sha),
        preserved,
        transfer.commit_subject
    );
    Ok(Replay::Applied)
}
