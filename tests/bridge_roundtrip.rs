//! End-to-end exercises of the transfer protocol: export a commit range
//! from a source repository, land it in a carrier, replay it into a
//! destination, and check ordering, attribution, and failure behavior.

mod common;

use common::*;
use tempfile::TempDir;

const BRIDGE_BRANCH: &str = "bridge/main-kx7q2f";

/// Source with root commit A (adds file1), B (modifies file1, has a body),
/// C (adds file2).
fn setup_three_commit_source(dir: &std::path::Path) {
    init_repo(dir);
    write_and_commit(dir, "file1", "one\n", "add file1", "2024-03-01T10:00:00+01:00");
    std::fs::write(dir.join("file1"), "one\ntwo\n").unwrap();
    commit_all(dir, &["-m", "modify file1", "-m", "explains why"], "2024-03-02T11:30:00+01:00");
    write_and_commit(dir, "file2", "alpha\n", "add file2", "2024-03-03T09:15:00+01:00");
}

#[test]
fn three_commit_scenario_roundtrips_into_empty_destination() {
    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("source");
    let carrier = tmp.path().join("carrier");
    let hub = tmp.path().join("hub.git");
    let dest = tmp.path().join("dest");

    setup_three_commit_source(&source);
    setup_carrier(&carrier, &hub);
    init_repo(&dest);

    let shas = git(&source, &["rev-list", "--reverse", "HEAD"]);
    let shas: Vec<&str> = shas.lines().collect();
    assert_eq!(shas.len(), 3);

    cbridge_ok(&[
        "export",
        "--source",
        source.to_str().unwrap(),
        "--carrier",
        carrier.to_str().unwrap(),
        "--count",
        "3",
    ]);

    // Carrier is back on its own branch with a clean tree; the batch lives
    // on the bridge branch only.
    assert_eq!(git(&carrier, &["symbolic-ref", "--short", "HEAD"]), "main");
    assert_eq!(git(&carrier, &["status", "--porcelain"]), "");

    let tree = git(&carrier, &["ls-tree", "-r", "--name-only", BRIDGE_BRANCH]);
    for (position, sha) in shas.iter().enumerate() {
        let short = &sha[..8];
        let base = format!("commit-transfer/{:03}_commit_{}", position + 1, short);
        assert!(tree.contains(&format!("{}.patch", base)), "missing patch in tree:\n{}", tree);
        assert!(tree.contains(&format!("{}.json", base)), "missing json in tree:\n{}", tree);
    }

    // Record 001 describes the root commit: its parent field must be empty.
    let meta_path = format!("{}:commit-transfer/001_commit_{}.json", BRIDGE_BRANCH, &shas[0][..8]);
    let raw = git(&carrier, &["show", &meta_path]);
    let meta: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(meta["parent_sha"].as_str().unwrap_or("x"), "");
    assert_eq!(meta["index"].as_u64(), Some(1));
    assert_eq!(meta["author_name"].as_str(), Some("Ada Lovelace"));

    // Import with branch auto-discovery (exactly one bridge head exists).
    let result = cbridge_ok(&[
        "import",
        "--carrier",
        carrier.to_str().unwrap(),
        "--dest",
        dest.to_str().unwrap(),
    ]);
    assert!(
        result.stdout.contains("Applied 3 record(s)"),
        "unexpected output:\n{}",
        result.stdout
    );

    // Order, messages, content, and (author == committer) the exact ids.
    assert_eq!(
        log_subjects_oldest_first(&dest),
        vec!["add file1", "modify file1", "add file2"]
    );
    assert_eq!(git(&dest, &["log", "-1", "--format=%b", "HEAD~1"]), "explains why");
    assert_eq!(std::fs::read_to_string(dest.join("file1")).unwrap(), "one\ntwo\n");
    assert_eq!(std::fs::read_to_string(dest.join("file2")).unwrap(), "alpha\n");

    let replayed = git(&dest, &["rev-list", "--reverse", "HEAD"]);
    let replayed: Vec<&str> = replayed.lines().collect();
    assert_eq!(replayed, shas, "commit ids were not reproduced");
}

#[test]
fn export_without_count_defaults_to_one_commit() {
    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("source");
    let carrier = tmp.path().join("carrier");
    let hub = tmp.path().join("hub.git");

    init_repo(&source);
    write_and_commit(&source, "a.txt", "1\n", "first", "2024-03-01T10:00:00+00:00");
    write_and_commit(&source, "b.txt", "2\n", "second", "2024-03-02T10:00:00+00:00");
    setup_carrier(&carrier, &hub);

    let result = cbridge_ok(&[
        "export",
        "--source",
        source.to_str().unwrap(),
        "--carrier",
        carrier.to_str().unwrap(),
    ]);
    assert!(
        result.stderr.contains("defaulting to the last 1 commit"),
        "expected a default-count warning:\n{}",
        result.stderr
    );

    let tree = git(&carrier, &["ls-tree", "-r", "--name-only", BRIDGE_BRANCH]);
    let pairs = tree.lines().filter(|l| l.ends_with(".json")).count();
    assert_eq!(pairs, 1, "expected a single record:\n{}", tree);
    assert!(tree.contains("001_commit_"));
}

#[test]
fn import_on_wrong_destination_fails_before_touching_anything() {
    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("source");
    let carrier = tmp.path().join("carrier");
    let hub = tmp.path().join("hub.git");
    let dest = tmp.path().join("dest");

    setup_three_commit_source(&source);
    setup_carrier(&carrier, &hub);

    // Unrelated destination: record 002's parent (commit A) does not exist.
    init_repo(&dest);
    write_and_commit(&dest, "other.txt", "unrelated\n", "unrelated base", "2024-02-01T08:00:00+00:00");
    let head_before = head_sha(&dest);

    cbridge_ok(&[
        "export",
        "--source",
        source.to_str().unwrap(),
        "--carrier",
        carrier.to_str().unwrap(),
        "--count",
        "2",
    ]);

    let result = cbridge(&[
        "import",
        "--carrier",
        carrier.to_str().unwrap(),
        "--dest",
        dest.to_str().unwrap(),
        "--branch",
        BRIDGE_BRANCH,
    ]);
    assert_ne!(result.exit_code, 0);
    assert!(
        result.stderr.contains("Parent commit"),
        "expected a wrong-branch diagnostic:\n{}",
        result.stderr
    );

    // Byte-for-byte untouched destination.
    assert_eq!(head_sha(&dest), head_before);
    assert_eq!(git(&dest, &["status", "--porcelain"]), "");
    assert_eq!(
        std::fs::read_to_string(dest.join("other.txt")).unwrap(),
        "unrelated\n"
    );
}

#[test]
fn reimport_skips_already_applied_records() {
    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("source");
    let carrier = tmp.path().join("carrier");
    let hub = tmp.path().join("hub.git");
    let dest = tmp.path().join("dest");

    init_repo(&source);
    write_and_commit(&source, "file1", "base\n", "base commit", "2024-03-01T10:00:00+00:00");

    // Destination shares history up to the base commit.
    let parent = tmp.path().to_str().unwrap().to_string();
    git(std::path::Path::new(&parent), &["clone", "-q", source.to_str().unwrap(), dest.to_str().unwrap()]);
    git(&dest, &["config", "commit.gpgsign", "false"]);

    write_and_commit(&source, "file1", "base\nmore\n", "extend file1", "2024-03-02T10:00:00+00:00");
    write_and_commit(&source, "file3", "three\n", "add file3", "2024-03-03T10:00:00+00:00");
    setup_carrier(&carrier, &hub);

    cbridge_ok(&[
        "export",
        "--source",
        source.to_str().unwrap(),
        "--carrier",
        carrier.to_str().unwrap(),
        "--count",
        "2",
    ]);

    let first = cbridge_ok(&[
        "import",
        "--carrier",
        carrier.to_str().unwrap(),
        "--dest",
        dest.to_str().unwrap(),
        "--branch",
        BRIDGE_BRANCH,
    ]);
    assert!(first.stdout.contains("Applied 2 record(s)"), "{}", first.stdout);
    let head_after_first = head_sha(&dest);
    assert_eq!(head_after_first, head_sha(&source), "ids should be reproduced");

    // Second run must detect both commits as present and apply nothing.
    let second = cbridge_ok(&[
        "import",
        "--carrier",
        carrier.to_str().unwrap(),
        "--dest",
        dest.to_str().unwrap(),
        "--branch",
        BRIDGE_BRANCH,
    ]);
    assert!(
        second.stdout.contains("Applied 0 record(s)") && second.stdout.contains("2 already present"),
        "second import should be a no-op:\n{}",
        second.stdout
    );
    assert_eq!(head_sha(&dest), head_after_first);
}

#[test]
fn failed_carrier_commit_rolls_back_to_a_clean_user_branch() {
    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("source");
    let carrier = tmp.path().join("carrier");
    let hub = tmp.path().join("hub.git");

    init_repo(&source);
    write_and_commit(&source, "file1", "one\n", "add file1", "2024-03-01T10:00:00+00:00");
    setup_carrier(&carrier, &hub);

    // An empty ident makes the carrier's batch commit fail after the
    // records were already copied and staged.
    git(&carrier, &["config", "user.name", ""]);
    git(&carrier, &["config", "user.email", ""]);

    let result = cbridge(&[
        "export",
        "--source",
        source.to_str().unwrap(),
        "--carrier",
        carrier.to_str().unwrap(),
        "--count",
        "1",
    ]);
    assert_ne!(result.exit_code, 0);
    assert!(
        result.stderr.contains("Rolled back the partial landing"),
        "rollback must be reported:\n{}",
        result.stderr
    );
    assert!(
        result.stderr.contains("staged records kept for inspection"),
        "staging dir must be preserved:\n{}",
        result.stderr
    );

    // The user's branch is exactly as before: checked out, clean, and with
    // no bridge branch left behind to block a retry.
    assert_eq!(git(&carrier, &["symbolic-ref", "--short", "HEAD"]), "main");
    assert_eq!(git(&carrier, &["status", "--porcelain"]), "");
    assert!(!carrier.join("commit-transfer").exists());
    let heads = git(&carrier, &["for-each-ref", "--format=%(refname:short)", "refs/heads"]);
    assert!(!heads.contains(BRIDGE_BRANCH), "bridge branch should be gone:\n{}", heads);
}

#[test]
fn mid_batch_apply_failure_keeps_earlier_commits_and_prints_recovery() {
    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("source");
    let carrier = tmp.path().join("carrier");
    let hub = tmp.path().join("hub.git");
    let dest = tmp.path().join("dest");

    setup_three_commit_source(&source);
    setup_carrier(&carrier, &hub);

    // Destination shares history up to commit A, then gains a conflicting
    // file2 of its own, so record 002 (C adds file2) cannot apply while
    // record 001 (B) still can.
    init_repo(&dest);
    write_and_commit(&dest, "file1", "one\n", "add file1", "2024-03-01T10:00:00+01:00");
    write_and_commit(&dest, "file2", "conflicting\n", "own file2", "2024-03-05T10:00:00+00:00");

    cbridge_ok(&[
        "export",
        "--source",
        source.to_str().unwrap(),
        "--carrier",
        carrier.to_str().unwrap(),
        "--count",
        "2",
    ]);

    let result = cbridge(&[
        "import",
        "--carrier",
        carrier.to_str().unwrap(),
        "--dest",
        dest.to_str().unwrap(),
        "--branch",
        BRIDGE_BRANCH,
    ]);
    assert_ne!(result.exit_code, 0);

    // Record 001 was committed before the failure and stays committed.
    assert!(
        log_subjects_oldest_first(&dest).contains(&"modify file1".to_string()),
        "record 001 must remain applied:\n{}",
        result.stderr
    );
    assert_eq!(std::fs::read_to_string(dest.join("file1")).unwrap(), "one\ntwo\n");
    assert_eq!(
        std::fs::read_to_string(dest.join("file2")).unwrap(),
        "conflicting\n",
        "the failing record must not touch the tree"
    );

    // The recovery transcript names the record, the extracted files, the
    // anchor branch, and the command to diagnose with.
    assert!(result.stderr.contains("Import stopped at record 002"), "{}", result.stderr);
    assert!(result.stderr.contains("Extracted records remain at"), "{}", result.stderr);
    assert!(result.stderr.contains("anchored at branch cbridge-import-"), "{}", result.stderr);
    assert!(result.stderr.contains("apply --check"), "{}", result.stderr);

    // The anchor branch really is still there for manual resumption.
    let anchors = git(&dest, &["for-each-ref", "--format=%(refname:short)", "refs/heads/cbridge-import-*"]);
    assert!(!anchors.is_empty(), "staging branch should survive the failure");
}

#[test]
fn import_aborts_when_multiple_bridge_branches_exist() {
    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("source");
    let carrier = tmp.path().join("carrier");
    let hub = tmp.path().join("hub.git");
    let dest = tmp.path().join("dest");

    setup_three_commit_source(&source);
    setup_carrier(&carrier, &hub);
    init_repo(&dest);

    cbridge_ok(&[
        "export",
        "--source",
        source.to_str().unwrap(),
        "--carrier",
        carrier.to_str().unwrap(),
        "--count",
        "1",
    ]);
    // A second, stale bridge branch from some earlier exchange.
    git(&carrier, &["branch", "bridge/feature-kx7q2f", "main"]);

    let result = cbridge(&[
        "import",
        "--carrier",
        carrier.to_str().unwrap(),
        "--dest",
        dest.to_str().unwrap(),
    ]);
    assert_ne!(result.exit_code, 0);
    assert!(
        result.stderr.contains(BRIDGE_BRANCH) && result.stderr.contains("bridge/feature-kx7q2f"),
        "disambiguation should list every candidate:\n{}",
        result.stderr
    );
}
