use anyhow::{anyhow, Context, Result};
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

/// Hash of the empty tree, stable across every Git repository. Root commits
/// are diffed against this so they stay exportable.
pub const EMPTY_TREE: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

/// Explicit attribution for commit creation. Passed as per-invocation
/// subprocess environment so no identity state leaks between replay
/// iterations.
#[derive(Debug, Clone)]
pub struct CommitAttribution {
    pub author_name: String,
    pub author_email: String,
    pub author_date: String,
    pub committer_name: String,
    pub committer_email: String,
    pub committer_date: String,
}

impl CommitAttribution {
    pub fn env_pairs(&self) -> [(&'static str, &str); 6] {
        [
            ("GIT_AUTHOR_NAME", self.author_name.as_str()),
            ("GIT_AUTHOR_EMAIL", self.author_email.as_str()),
            ("GIT_AUTHOR_DATE", self.author_date.as_str()),
            ("GIT_COMMITTER_NAME", self.committer_name.as_str()),
            ("GIT_COMMITTER_EMAIL", self.committer_email.as_str()),
            ("GIT_COMMITTER_DATE", self.committer_date.as_str()),
        ]
    }
}

/// Fail early if the git binary is missing, before any mutating step runs.
pub fn ensure_git_available() -> Result<()> {
    let status = Command::new("git")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        Ok(code) if code.success() => Ok(()),
        _ => Err(anyhow!(
            "git was not found on PATH; install git before running cbridge"
        )),
    }
}

pub fn run_git(repo: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .with_context(|| format!("Failed to run git {}", args.join(" ")))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Err(anyhow!(
            "git {} failed in {}: {}{}{}",
            args.join(" "),
            repo.display(),
            stderr,
            if !stderr.is_empty() && !stdout.is_empty() { "\n" } else { "" },
            stdout
        ))
    }
}

/// Variant for commands whose failure is an answer, not an error
/// (object-existence probes, upstream lookups).
pub fn run_git_ok(repo: &Path, args: &[&str]) -> Result<Option<String>> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .with_context(|| format!("Failed to run git {}", args.join(" ")))?;

    if output.status.success() {
        Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
    } else {
        Ok(None)
    }
}

/// Raw-bytes variant for binary-safe output (patches, blob contents).
pub fn run_git_bytes(repo: &Path, args: &[&str]) -> Result<Vec<u8>> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .with_context(|| format!("Failed to run git {}", args.join(" ")))?;

    if output.status.success() {
        Ok(output.stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(anyhow!(
            "git {} failed in {}: {}",
            args.join(" "),
            repo.display(),
            stderr
        ))
    }
}

fn run_git_stdin(repo: &Path, args: &[&str], input: &[u8], envs: &[(&str, &str)]) -> Result<String> {
    let mut command = Command::new("git");
    command
        .args(args)
        .current_dir(repo)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in envs {
        command.env(key, value);
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("Failed to run git {}", args.join(" ")))?;
    child
        .stdin
        .as_mut()
        .ok_or_else(|| anyhow!("Could not open stdin for git {}", args.join(" ")))?
        .write_all(input)
        .with_context(|| format!("Failed to feed input to git {}", args.join(" ")))?;

    let output = child
        .wait_with_output()
        .with_context(|| format!("Failed to wait for git {}", args.join(" ")))?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(anyhow!("git {} failed: {}", args.join(" "), stderr))
    }
}

pub fn is_repository(path: &Path) -> bool {
    path.is_dir() && run_git_ok(path, &["rev-parse", "--git-dir"]).map(|v| v.is_some()).unwrap_or(false)
}

pub fn head_exists(repo: &Path) -> Result<bool> {
    Ok(run_git_ok(repo, &["rev-parse", "--verify", "--quiet", "HEAD"])?.is_some())
}

/// Name of the checked-out branch. Detached HEAD is an error: the bridge
/// needs a branch to name artifacts after and to come back to.
pub fn current_branch(repo: &Path) -> Result<String> {
    run_git_ok(repo, &["symbolic-ref", "--short", "HEAD"])?.ok_or_else(|| {
        anyhow!(
            "{} is on a detached HEAD; check out a branch first",
            repo.display()
        )
    })
}

pub fn working_tree_dirty(repo: &Path) -> Result<bool> {
    let status = run_git(repo, &["status", "--porcelain"])?;
    Ok(!status.is_empty())
}

/// Commits on the current branch not present on its configured upstream.
/// None when there is no upstream at all.
pub fn upstream_ahead_count(repo: &Path) -> Result<Option<usize>> {
    match run_git_ok(repo, &["rev-list", "--count", "@{upstream}..HEAD"])? {
        Some(raw) => {
            let count = raw
                .parse::<usize>()
                .with_context(|| format!("Unexpected rev-list count output: {}", raw))?;
            Ok(Some(count))
        }
        None => Ok(None),
    }
}

/// The last `count` commits reachable from HEAD, oldest first. Limiting
/// happens before --reverse, so this is safe even when `count` exceeds the
/// total history length (unlike a HEAD~N range).
pub fn last_commits_oldest_first(repo: &Path, count: usize) -> Result<Vec<String>> {
    let max = format!("--max-count={}", count);
    let raw = run_git(repo, &["rev-list", "--reverse", &max, "HEAD"])?;
    Ok(raw.lines().map(|line| line.trim().to_string()).filter(|line| !line.is_empty()).collect())
}

pub fn parent_of(repo: &Path, sha: &str) -> Result<Option<String>> {
    let spec = format!("{}^", sha);
    run_git_ok(repo, &["rev-parse", "--verify", "--quiet", &spec])
}

/// Binary-safe patch of `sha` relative to `base` (a parent commit or
/// EMPTY_TREE). --full-index keeps blob ids complete so binary deltas apply.
pub fn commit_patch(repo: &Path, base: &str, sha: &str) -> Result<Vec<u8>> {
    run_git_bytes(repo, &["diff", "--binary", "--full-index", base, sha])
}

pub struct CommitInfo {
    pub author_name: String,
    pub author_email: String,
    pub author_date: String,
    pub committer_name: String,
    pub committer_email: String,
    pub committer_date: String,
    pub subject: String,
    pub body: String,
}

/// Single NUL-separated metadata read per commit.
pub fn commit_info(repo: &Path, sha: &str) -> Result<CommitInfo> {
    let format = "--format=%an%x00%ae%x00%aI%x00%cn%x00%ce%x00%cI%x00%s%x00%b";
    let raw = run_git(repo, &["show", "-s", format, sha])?;
    let fields: Vec<&str> = raw.splitn(8, '\0').collect();
    if fields.len() != 8 {
        return Err(anyhow!(
            "Malformed metadata for commit {}: expected 8 fields, got {}",
            sha,
            fields.len()
        ));
    }

    Ok(CommitInfo {
        author_name: fields[0].to_string(),
        author_email: fields[1].to_string(),
        author_date: fields[2].to_string(),
        committer_name: fields[3].to_string(),
        committer_email: fields[4].to_string(),
        committer_date: fields[5].to_string(),
        subject: fields[6].to_string(),
        body: fields[7].trim_end().to_string(),
    })
}

pub fn object_exists(repo: &Path, sha: &str) -> Result<bool> {
    let spec = format!("{}^{{commit}}", sha);
    Ok(run_git_ok(repo, &["cat-file", "-e", &spec])?.is_some())
}

pub fn remote_url(repo: &Path, remote: &str) -> Result<Option<String>> {
    run_git_ok(repo, &["remote", "get-url", remote])
}

/// Upstream tracking ref of `branch` (e.g. origin/main), if configured.
pub fn tracking_ref(repo: &Path, branch: &str) -> Result<Option<String>> {
    let spec = format!("{}@{{upstream}}", branch);
    run_git_ok(repo, &["rev-parse", "--verify", "--quiet", "--abbrev-ref", &spec])
}

pub fn create_branch_at(repo: &Path, branch: &str, start_point: &str) -> Result<()> {
    run_git(repo, &["checkout", "-b", branch, start_point])?;
    Ok(())
}

pub fn checkout(repo: &Path, branch: &str) -> Result<()> {
    run_git(repo, &["checkout", branch])?;
    Ok(())
}

pub fn branch_exists(repo: &Path, branch: &str) -> Result<bool> {
    let spec = format!("refs/heads/{}", branch);
    Ok(run_git_ok(repo, &["rev-parse", "--verify", "--quiet", &spec])?.is_some())
}

/// Create a branch ref without switching to it.
pub fn create_branch_ref(repo: &Path, branch: &str, target: &str) -> Result<()> {
    run_git(repo, &["branch", branch, target])?;
    Ok(())
}

pub fn delete_branch(repo: &Path, branch: &str) -> Result<()> {
    run_git(repo, &["branch", "-D", branch])?;
    Ok(())
}

/// Fetch one branch from another repository (by path or URL) into this
/// repository's object store. The working tree is untouched; the result is
/// reachable as FETCH_HEAD.
pub fn fetch_branch(repo: &Path, from: &str, branch: &str) -> Result<()> {
    run_git(repo, &["fetch", from, branch])?;
    Ok(())
}

/// Heads advertised by `remote` (a path or URL), as short branch names.
/// Runs from `repo` so it works against file paths relative to it.
pub fn remote_heads(repo: &Path, remote: &str) -> Result<Vec<String>> {
    let raw = run_git(repo, &["ls-remote", "--heads", remote])?;
    Ok(raw
        .lines()
        .filter_map(|line| line.split('\t').nth(1))
        .filter_map(|full| full.strip_prefix("refs/heads/"))
        .map(|name| name.to_string())
        .collect())
}

/// Blob entries (oid, path) under `dir` in the tree of `reference`, read
/// without touching the working tree.
pub fn tree_blobs(repo: &Path, reference: &str, dir: &str) -> Result<Vec<(String, String)>> {
    let raw = run_git(repo, &["ls-tree", "-r", reference, "--", dir])?;
    let mut blobs = Vec::new();
    for line in raw.lines() {
        let (meta, path) = match line.split_once('\t') {
            Some(pair) => pair,
            None => continue,
        };
        let mut parts = meta.split_whitespace();
        let _mode = parts.next();
        let kind = parts.next().unwrap_or("");
        let oid = parts.next().unwrap_or("");
        if kind == "blob" && !oid.is_empty() {
            blobs.push((oid.to_string(), path.to_string()));
        }
    }
    Ok(blobs)
}

pub fn blob_bytes(repo: &Path, oid: &str) -> Result<Vec<u8>> {
    run_git_bytes(repo, &["cat-file", "blob", oid])
}

pub fn apply_check(repo: &Path, patch: &Path) -> Result<()> {
    let patch_str = patch.to_string_lossy();
    run_git(repo, &["apply", "--check", "--binary", "--whitespace=nowarn", &patch_str])
        .map_err(|err| anyhow!("Patch does not apply cleanly: {}", err))?;
    Ok(())
}

pub fn apply_patch(repo: &Path, patch: &Path) -> Result<()> {
    let patch_str = patch.to_string_lossy();
    run_git(repo, &["apply", "--binary", "--whitespace=nowarn", &patch_str])?;
    Ok(())
}

pub fn add_all(repo: &Path) -> Result<()> {
    run_git(repo, &["add", "-A"])?;
    Ok(())
}

/// Create a commit with explicit attribution and return its id. The message
/// is fed over stdin so subject/body reconstruction is byte-exact;
/// attribution travels only in this child's environment.
pub fn commit_with_attribution(
    repo: &Path,
    message: &str,
    attribution: &CommitAttribution,
    allow_empty: bool,
) -> Result<String> {
    let mut args = vec!["commit", "--no-verify", "--no-gpg-sign", "--file", "-"];
    if allow_empty {
        args.push("--allow-empty");
    }
    run_git_stdin(repo, &args, message.as_bytes(), &attribution.env_pairs())?;
    run_git(repo, &["rev-parse", "HEAD"])
}

pub fn head_sha(repo: &Path) -> Result<String> {
    run_git(repo, &["rev-parse", "HEAD"])
}

pub fn stash_push(repo: &Path, label: &str) -> Result<()> {
    run_git(repo, &["stash", "push", "--include-untracked", "-m", label])?;
    Ok(())
}

pub fn stash_list(repo: &Path) -> Result<Vec<String>> {
    let raw = run_git(repo, &["stash", "list"])?;
    Ok(raw.lines().map(|line| line.to_string()).collect())
}

pub fn stash_pop(repo: &Path, slot: &str) -> Result<()> {
    run_git(repo, &["stash", "pop", slot])?;
    Ok(())
}
