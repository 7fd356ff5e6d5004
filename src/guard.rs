use crate::git;
use crate::utils::unique_token;
use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};

/// Label prefix every auto-stash entry carries. Orphan detection and slot
/// lookup both key off this, so it is part of the on-disk contract.
pub const STASH_LABEL_PREFIX: &str = "cbridge auto-stash";

#[derive(Debug)]
struct StashCheckpoint {
    repo: PathBuf,
    token: String,
    label: String,
    consumed: bool,
}

/// Enforces the clean-working-tree precondition around export/import and
/// restores whatever it stashed, without ever discarding user data.
///
/// Default behavior on a dirty tree is a hard stop with remediation options;
/// auto-stash is opt-in and every step of it is independently verifiable
/// from `git stash list`.
pub struct StashGuard {
    auto_stash: bool,
    checkpoints: Vec<StashCheckpoint>,
}

impl StashGuard {
    pub fn new(auto_stash: bool) -> StashGuard {
        StashGuard {
            auto_stash,
            checkpoints: Vec::new(),
        }
    }

    /// Gate a repository before a mutating operation touches it.
    pub fn ensure_clean(&mut self, repo: &Path, operation: &str) -> Result<()> {
        if !git::working_tree_dirty(repo)? {
            return Ok(());
        }

        if !self.auto_stash {
            return Err(anyhow!(
                "{} has uncommitted changes; {} refuses to run on a dirty working tree.\n\
                 Choose one:\n\
                 \x20 1. commit your changes:        git -C {} commit -am \"wip\"\n\
                 \x20 2. stash them yourself:        git -C {} stash push --include-untracked\n\
                 \x20 3. let cbridge stash for you:  re-run with --auto-stash",
                repo.display(),
                operation,
                repo.display(),
                repo.display()
            ));
        }

        self.warn_orphaned(repo)?;

        let token = unique_token();
        let label = format!("{} [{}] before {}", STASH_LABEL_PREFIX, token, operation);
        let before = git::stash_list(repo)?.len();
        git::stash_push(repo, &label)?;
        let after = git::stash_list(repo)?;
        if after.len() <= before {
            return Err(anyhow!(
                "Auto-stash in {} did not create a stash entry; aborting before any mutation",
                repo.display()
            ));
        }
        // The slot must be findable by token, not assumed to be stash@{0}:
        // slots shift if the user manipulates stashes while we run.
        if find_slot(&after, &token).is_none() {
            return Err(anyhow!(
                "Auto-stash entry [{}] not found in {} after creation; aborting",
                token,
                repo.display()
            ));
        }

        eprintln!(
            "Stashed uncommitted changes in {} as \"{}\" (restored automatically on success)",
            repo.display(),
            label
        );
        self.checkpoints.push(StashCheckpoint {
            repo: repo.to_path_buf(),
            token,
            label,
            consumed: false,
        });
        Ok(())
    }

    /// Pop the checkpoint recorded for `repo`, if any. Safe to call more than
    /// once; a consumed checkpoint is skipped.
    pub fn restore(&mut self, repo: &Path) -> Result<()> {
        let checkpoint = match self
            .checkpoints
            .iter_mut()
            .find(|c| c.repo == repo && !c.consumed)
        {
            Some(checkpoint) => checkpoint,
            None => return Ok(()),
        };

        let entries = git::stash_list(&checkpoint.repo)?;
        let slot = match find_slot(&entries, &checkpoint.token) {
            Some(slot) => slot,
            None => {
                // Gone from the list entirely; nothing left to restore.
                eprintln!(
                    "Warning: auto-stash [{}] no longer exists in {}; was it popped manually?",
                    checkpoint.token,
                    checkpoint.repo.display()
                );
                checkpoint.consumed = true;
                return Ok(());
            }
        };

        match git::stash_pop(&checkpoint.repo, &slot) {
            Ok(()) => {
                checkpoint.consumed = true;
                eprintln!(
                    "Restored stashed changes in {} ({})",
                    checkpoint.repo.display(),
                    checkpoint.label
                );
                Ok(())
            }
            Err(err) => Err(anyhow!(
                "Could not restore your stashed changes in {}: {}\n\
                 The stash is still intact at {} (\"{}\").\n\
                 Either resolve the conflict and run:  git -C {} stash pop {}\n\
                 or reset first and retry:             git -C {} checkout . && git -C {} stash pop {}",
                checkpoint.repo.display(),
                err,
                slot,
                checkpoint.label,
                checkpoint.repo.display(),
                slot,
                checkpoint.repo.display(),
                checkpoint.repo.display(),
                slot
            )),
        }
    }

    pub fn restore_all(&mut self) -> Result<()> {
        let repos: Vec<PathBuf> = self
            .checkpoints
            .iter()
            .filter(|c| !c.consumed)
            .map(|c| c.repo.clone())
            .collect();
        for repo in repos {
            self.restore(&repo)?;
        }
        Ok(())
    }

    /// Report auto-stash entries left behind by earlier interrupted runs.
    /// Informational only; they are never touched.
    pub fn warn_orphaned(&self, repo: &Path) -> Result<()> {
        let orphans: Vec<String> = git::stash_list(repo)?
            .into_iter()
            .filter(|line| line.contains(STASH_LABEL_PREFIX))
            .collect();
        if !orphans.is_empty() {
            eprintln!(
                "Warning: {} has {} leftover cbridge stash entr{} from a previous run:",
                repo.display(),
                orphans.len(),
                if orphans.len() == 1 { "y" } else { "ies" }
            );
            for orphan in &orphans {
                eprintln!("  {}", orphan);
            }
            eprintln!("Inspect with: git -C {} stash list", repo.display());
        }
        Ok(())
    }

    /// Printed from failure paths so an aborted run never strands a stash
    /// silently.
    pub fn report_unrestored(&self) {
        for checkpoint in self.checkpoints.iter().filter(|c| !c.consumed) {
            eprintln!(
                "NOTE: your uncommitted changes in {} are still stashed as \"{}\".",
                checkpoint.repo.display(),
                checkpoint.label
            );
            eprintln!(
                "Restore them with: git -C {} stash list   (find [{}])   then git -C {} stash pop <slot>",
                checkpoint.repo.display(),
                checkpoint.token,
                checkpoint.repo.display()
            );
        }
    }
}

/// Resolve the `stash@{n}` slot whose label carries `token`.
fn find_slot(entries: &[String], token: &str) -> Option<String> {
    let needle = format!("[{}]", token);
    entries
        .iter()
        .find(|line| line.contains(&needle))
        .and_then(|line| line.split(':').next())
        .map(|slot| slot.trim().to_string())
}
