use anyhow::{anyhow, Context, Result};
use globset::Glob;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};

/// Directory at the root of the carrier commit's tree holding every
/// patch/metadata pair of one batch, un-nested.
pub const TRANSFER_DIR: &str = "commit-transfer";

/// Namespace prefix for disposable carrier branches.
pub const BRANCH_PREFIX: &str = "bridge/";

/// Fixed suffix constant appended to bridge branch names. Makes automated
/// discovery possible (list remote heads, match the suffix) without a side
/// channel, and keeps bridge branches from colliding with real ones.
pub const BRANCH_SUFFIX: &str = "-kx7q2f";

const SHORT_HASH_LEN: usize = 8;

/// One commit's worth of transferable change: everything the importer needs
/// to replay it with original attribution.
#[derive(Debug, Clone)]
pub struct TransferRecord {
    /// 1-based position in the batch; replay happens in ascending order.
    pub index: usize,
    /// Full id of the source commit.
    pub sha: String,
    /// Full id of the immediate parent, empty for a root commit.
    pub parent_sha: String,
    pub author_name: String,
    pub author_email: String,
    pub date_full: String,
    pub commit_subject: String,
    pub commit_body: String,
    /// Absent in older-format records; import falls back to author fields.
    pub committer_name: Option<String>,
    pub committer_email: Option<String>,
    pub committer_date: Option<String>,
}

impl TransferRecord {
    /// Shared basename of the pair: `<NNN>_commit_<shortHash>`. Lexical sort
    /// of these names is the replay order; there is no separate manifest.
    pub fn basename(&self) -> String {
        format!("{:03}_commit_{}", self.index, short_hash(&self.sha))
    }

    pub fn patch_filename(&self) -> String {
        format!("{}.patch", self.basename())
    }

    pub fn meta_filename(&self) -> String {
        format!("{}.json", self.basename())
    }

    pub fn is_root_commit(&self) -> bool {
        self.parent_sha.is_empty()
    }

    pub fn commit_message(&self) -> String {
        if self.commit_body.is_empty() {
            self.commit_subject.clone()
        } else {
            format!("{}\n\n{}", self.commit_subject, self.commit_body)
        }
    }

    /// Committer identity with fallback to author, so records written before
    /// committer fields existed still import, and so identifier reproduction
    /// works when the original commit had author == committer.
    pub fn effective_committer(&self) -> (String, String, String) {
        (
            self.committer_name.clone().unwrap_or_else(|| self.author_name.clone()),
            self.committer_email.clone().unwrap_or_else(|| self.author_email.clone()),
            self.committer_date.clone().unwrap_or_else(|| self.date_full.clone()),
        )
    }

    pub fn to_json(&self) -> Value {
        json!({
            "index": self.index,
            "sha": self.sha,
            "parent_sha": self.parent_sha,
            "author_name": self.author_name,
            "author_email": self.author_email,
            "date_full": self.date_full,
            "commit_subject": self.commit_subject,
            "commit_body": self.commit_body,
            "committer_name": self.committer_name,
            "committer_email": self.committer_email,
            "committer_date": self.committer_date,
        })
    }

    pub fn from_json(root: &Value, origin: &str) -> Result<TransferRecord> {
        let required = |field: &str| -> Result<String> {
            root[field]
                .as_str()
                .map(|v| v.to_string())
                .with_context(|| format!("{} is missing required string field: {}", origin, field))
        };
        let optional = |field: &str| -> Option<String> {
            root[field].as_str().map(|v| v.to_string()).filter(|v| !v.is_empty())
        };

        // parent_sha may be an explicit null in records describing a root
        // commit; treat null and "" the same.
        let parent_sha = root["parent_sha"].as_str().unwrap_or("").to_string();

        Ok(TransferRecord {
            index: root["index"].as_u64().unwrap_or(0) as usize,
            sha: required("sha")?,
            parent_sha,
            author_name: required("author_name")?,
            author_email: required("author_email")?,
            date_full: required("date_full")?,
            commit_subject: required("commit_subject")?,
            commit_body: root["commit_body"].as_str().unwrap_or("").to_string(),
            committer_name: optional("committer_name"),
            committer_email: optional("committer_email"),
            committer_date: optional("committer_date"),
        })
    }

    /// A record with blank attribution cannot be replayed faithfully; refuse
    /// it before anything mutates.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("author_name", &self.author_name),
            ("author_email", &self.author_email),
            ("date_full", &self.date_full),
            ("commit_subject", &self.commit_subject),
        ];
        for (field, value) in checks {
            if value.trim().is_empty() {
                return Err(anyhow!(
                    "Record {} ({}) has an empty {} field; refusing to replay it",
                    self.index,
                    short_hash(&self.sha),
                    field
                ));
            }
        }
        if self.sha.len() < SHORT_HASH_LEN {
            return Err(anyhow!("Record {} has a malformed sha: {}", self.index, self.sha));
        }
        Ok(())
    }
}

pub fn short_hash(sha: &str) -> &str {
    if sha.len() >= SHORT_HASH_LEN {
        &sha[..SHORT_HASH_LEN]
    } else {
        sha
    }
}

pub fn bridge_branch_name(source_branch: &str) -> String {
    format!("{}{}{}", BRANCH_PREFIX, source_branch, BRANCH_SUFFIX)
}

pub fn is_bridge_branch(name: &str) -> bool {
    name.starts_with(BRANCH_PREFIX) && name.ends_with(BRANCH_SUFFIX)
}

/// Write one record pair into `dir`. Both files or neither: the metadata is
/// written only after the patch write succeeded, and a failure surfaces as
/// an error so the exporter can abort the whole batch.
pub fn write_pair(dir: &Path, record: &TransferRecord, patch: &[u8]) -> Result<()> {
    let patch_path = dir.join(record.patch_filename());
    fs::write(&patch_path, patch)
        .with_context(|| format!("Failed to write {}", patch_path.display()))?;

    let meta_path = dir.join(record.meta_filename());
    let pretty = serde_json::to_string_pretty(&record.to_json())?;
    fs::write(&meta_path, pretty)
        .with_context(|| format!("Failed to write {}", meta_path.display()))?;
    Ok(())
}

/// Load a batch from a directory of extracted pairs: sort metadata files by
/// name, require the sibling patch for each, parse, and cross-check the
/// embedded index against the gapless 1-based filename order.
pub fn load_batch(dir: &Path) -> Result<Vec<(PathBuf, TransferRecord)>> {
    let matcher = Glob::new("*_commit_*.json")
        .context("Invalid record glob")?
        .compile_matcher();

    let mut meta_files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read transfer directory {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .map(|name| matcher.is_match(Path::new(name)))
                .unwrap_or(false)
        })
        .collect();
    meta_files.sort();

    if meta_files.is_empty() {
        return Err(anyhow!(
            "No transfer records found in {}; was this batch exported correctly?",
            dir.display()
        ));
    }

    let mut batch = Vec::with_capacity(meta_files.len());
    for (position, meta_path) in meta_files.iter().enumerate() {
        let origin = meta_path.display().to_string();
        let raw = fs::read_to_string(meta_path)
            .with_context(|| format!("Failed to read {}", origin))?;
        let root: Value = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse record metadata {}", origin))?;
        let record = TransferRecord::from_json(&root, &origin)?;

        let expected = position + 1;
        if record.index != 0 && record.index != expected {
            return Err(anyhow!(
                "Batch ordering mismatch: {} sits at position {} but carries index {}",
                origin,
                expected,
                record.index
            ));
        }

        let patch_path = meta_path.with_extension("patch");
        if !patch_path.exists() {
            return Err(anyhow!(
                "Record {} is missing its patch file {}; the batch is invalid",
                origin,
                patch_path.display()
            ));
        }

        let mut record = record;
        if record.index == 0 {
            // Older-format record without an embedded index; filename order
            // is authoritative.
            record.index = expected;
        }
        batch.push((patch_path, record));
    }

    Ok(batch)
}
