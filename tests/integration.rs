use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn crawldex_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("crawldex");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    fs::create_dir_all(root.join("config")).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let lab = root.join("files/lab");
    fs::create_dir_all(lab.join("plates")).unwrap();
    fs::write(
        lab.join("protocol.txt"),
        "Luciferase reporter assay protocol.\n\nIncubate the PT-101 plates overnight.",
    )
    .unwrap();
    fs::write(
        lab.join("plates/readout.md"),
        "# Plate readout\n\nRaw luminescence values for plate PT-101.",
    )
    .unwrap();
    fs::write(lab.join("plates/scan.tif"), [0u8, 1, 2, 3]).unwrap();

    let secret = root.join("files/secret");
    fs::create_dir_all(&secret).unwrap();
    fs::write(secret.join("budget.txt"), "Luciferase budget for next year.").unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/crawl.sqlite"

[server]
bind = "127.0.0.1:7341"

[[roots]]
name = "lab"
path = "{root}/files/lab"
container = "lab"

[[roots]]
name = "secret"
path = "{root}/files/secret"
container = "secret"

[[containers]]
id = "secret"
name = "Finance"
readers = ["carol"]

[[identifiers]]
pattern = "PT-\\d+"
category = "subject"
"#,
        root = root.display(),
    );

    let config_path = root.join("config").join("crawldex.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_crawldex(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = crawldex_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run crawldex binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn crawl(config_path: &Path) -> String {
    let (stdout, stderr, success) = run_crawldex(config_path, &["crawl", "--wait"]);
    assert!(success, "crawl failed: stdout={}, stderr={}", stdout, stderr);
    stdout
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_crawldex(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/crawl.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_crawldex(&config_path, &["init"]);
    assert!(success1, "First init failed");
    let (_, _, success2) = run_crawldex(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_crawl_submits_every_file() {
    let (_tmp, config_path) = setup_test_env();

    let stdout = crawl(&config_path);
    // protocol.txt, readout.md, scan.tif (name only), budget.txt
    assert!(stdout.contains("Submitted files: 4"), "{}", stdout);
    assert!(stdout.contains("ok"));
}

#[test]
fn test_recrawl_is_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    crawl(&config_path);
    let (stdout, _, success) = run_crawldex(&config_path, &["crawl", "--wait"]);
    assert!(success);
    assert!(stdout.contains("Submitted files: 0"), "{}", stdout);
}

#[test]
fn test_forced_crawl_resubmits_one_root() {
    let (_tmp, config_path) = setup_test_env();

    crawl(&config_path);
    let (stdout, stderr, success) =
        run_crawldex(&config_path, &["crawl", "--root", "lab", "--force", "--wait"]);
    assert!(success, "forced crawl failed: {}", stderr);
    assert!(stdout.contains("Submitted files: 3"), "{}", stdout);
}

#[test]
fn test_crawl_unknown_root_errors() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_crawldex(&config_path, &["crawl", "--root", "nope"]);
    assert!(!success);
    assert!(stderr.contains("unknown root"), "{}", stderr);
}

#[test]
fn test_deleted_file_leaves_the_index() {
    let (tmp, config_path) = setup_test_env();

    crawl(&config_path);
    fs::remove_file(tmp.path().join("files/lab/protocol.txt")).unwrap();
    let (stdout, _, success) =
        run_crawldex(&config_path, &["crawl", "--root", "lab", "--wait"]);
    assert!(success);
    assert!(stdout.contains("Deleted files: 1"), "{}", stdout);

    let (search_out, _, _) = run_crawldex(&config_path, &["search", "overnight", "--root", "lab"]);
    assert!(search_out.contains("No results."), "{}", search_out);
}

#[test]
fn test_search_respects_readers() {
    let (_tmp, config_path) = setup_test_env();
    crawl(&config_path);

    let (stdout, stderr, success) =
        run_crawldex(&config_path, &["search", "luciferase", "--root", "secret"]);
    assert!(success, "search failed: {}", stderr);
    assert!(stdout.contains("No results."), "{}", stdout);

    let (stdout, _, success) = run_crawldex(
        &config_path,
        &["search", "luciferase", "--root", "secret", "--user", "carol"],
    );
    assert!(success);
    assert!(stdout.contains("budget.txt"), "{}", stdout);
}

#[test]
fn test_search_identifier() {
    let (_tmp, config_path) = setup_test_env();
    crawl(&config_path);

    let (stdout, stderr, success) =
        run_crawldex(&config_path, &["search", "PT-101", "--root", "lab"]);
    assert!(success, "search failed: {}", stderr);
    assert!(stdout.contains("of 2 hits"), "{}", stdout);
}

#[test]
fn test_search_deterministic() {
    let (_tmp, config_path) = setup_test_env();
    crawl(&config_path);

    let (out1, _, _) = run_crawldex(&config_path, &["search", "luciferase", "--root", "lab"]);
    let (out2, _, _) = run_crawldex(&config_path, &["search", "luciferase", "--root", "lab"]);
    assert_eq!(out1, out2, "Search results should be deterministic");
}

#[test]
fn test_search_malformed_query_is_an_error_message() {
    let (_tmp, config_path) = setup_test_env();
    crawl(&config_path);

    let (_, stderr, success) =
        run_crawldex(&config_path, &["search", "assay AND", "--root", "lab"]);
    assert!(!success);
    assert!(stderr.to_lowercase().contains("incomplete query"), "{}", stderr);
}

#[test]
fn test_search_no_results() {
    let (_tmp, config_path) = setup_test_env();
    crawl(&config_path);

    let (stdout, _, success) =
        run_crawldex(&config_path, &["search", "xyzzynonexistent", "--root", "lab"]);
    assert!(success);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_stats_json() {
    let (_tmp, config_path) = setup_test_env();
    crawl(&config_path);

    let (stdout, stderr, success) = run_crawldex(&config_path, &["stats", "--json"]);
    assert!(success, "stats failed: {}", stderr);
    let stats: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    // container pages for lab and secret plus four files
    assert_eq!(stats["index_documents"], 6);
    assert_eq!(stats["directories_due"], 0);
    assert!(stats["configuration_error"].is_null());
}

#[test]
fn test_clear_then_rebuild() {
    let (_tmp, config_path) = setup_test_env();
    crawl(&config_path);

    let (stdout, _, success) = run_crawldex(&config_path, &["clear"]);
    assert!(success);
    assert!(stdout.contains("Index cleared"));

    let (search_out, _, _) = run_crawldex(&config_path, &["search", "luciferase", "--root", "lab"]);
    assert!(search_out.contains("No results."), "{}", search_out);

    let stdout = crawl(&config_path);
    assert!(stdout.contains("Submitted files: 4"), "{}", stdout);
}
