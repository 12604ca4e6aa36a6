use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn sfs_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_sfs"))
}

fn setup_test_env() -> (TempDir, PathBuf, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let base = tmp.path().canonicalize().unwrap();

    let config_dir = base.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = base.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt contains information about cargo and crates.",
    )
    .unwrap();
    fs::write(
        files_dir.join("beta.md"),
        "# Beta Document\n\nThis document discusses Python and machine learning.\n\nDeep learning frameworks like PyTorch are covered.",
    )
    .unwrap();
    fs::write(
        files_dir.join("gamma.txt"),
        "Gamma plain text file.\n\nContains notes about deployment and infrastructure.\n\nKubernetes and Docker are mentioned here.",
    )
    .unwrap();

    let config_content = format!(
        r#"roots = ["{files}"]

[db]
path = "{base}/data/sfs.sqlite"

[indexing]
workers = 2

[retrieval]
default_k = 5

[server]
bind = "127.0.0.1:7331"
"#,
        files = files_dir.display(),
        base = base.display()
    );

    let config_path = config_dir.join("sfs.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path, files_dir)
}

fn run_sfs(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = sfs_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path)
        .args(args)
        .env("SFS_LOG", "warn")
        .env_remove("OPENAI_API_KEY")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run sfs binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn run_json(config_path: &Path, args: &[&str]) -> serde_json::Value {
    let (stdout, stderr, success) = run_sfs(config_path, args);
    assert!(success, "sfs {:?} failed: {}", args, stderr);
    serde_json::from_str(&stdout).unwrap_or_else(|e| panic!("not JSON ({}): {}", e, stdout))
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path, _) = setup_test_env();
    let (stdout, stderr, success) = run_sfs(&config_path, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("Database initialized"));
    assert!(tmp.path().join("data/sfs.sqlite").exists());

    // idempotent
    let (_, stderr, success) = run_sfs(&config_path, &["init"]);
    assert!(success, "second init failed: {}", stderr);
}

#[test]
fn test_index_then_search() {
    let (_tmp, config_path, files_dir) = setup_test_env();
    let root = files_dir.to_string_lossy().to_string();

    let report = run_json(&config_path, &["index", &root]);
    assert_eq!(report["indexed"], 3);
    assert_eq!(report["state"], "completed");

    let report = run_json(&config_path, &["index", &root]);
    assert_eq!(report["indexed"], 0);
    assert_eq!(report["skipped"], 3);

    let res = run_json(&config_path, &["search", "kubernetes"]);
    let items = res["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert!(items[0]["path"].as_str().unwrap().ends_with("gamma.txt"));

    let res = run_json(&config_path, &["search", "document", "--ext", "md"]);
    let items = res["items"].as_array().unwrap();
    assert!(!items.is_empty());
    assert!(items.iter().all(|i| i["extension"] == ".md"));
}

#[test]
fn test_roots_and_open() {
    let (_tmp, config_path, files_dir) = setup_test_env();
    let root = files_dir.to_string_lossy().to_string();
    run_json(&config_path, &["index", &root]);

    let roots = run_json(&config_path, &["roots"]);
    assert_eq!(roots[0]["indexed_files"], 3);

    let alpha = files_dir.join("alpha.md").to_string_lossy().to_string();
    let preview = run_json(&config_path, &["open", &alpha]);
    assert!(preview["preview"].as_str().unwrap().contains("Alpha"));
}

#[test]
fn test_outside_root_fails() {
    let (tmp, config_path, _) = setup_test_env();
    let outside = tmp.path().join("config").to_string_lossy().to_string();
    let (_, stderr, success) = run_sfs(&config_path, &["index", &outside]);
    assert!(!success);
    assert!(stderr.contains("outside"), "stderr: {}", stderr);
}

#[test]
fn test_rewrite_and_usage_without_ai() {
    let (_tmp, config_path, _) = setup_test_env();
    let rewrite = run_json(&config_path, &["rewrite", "deployment notes"]);
    assert_eq!(rewrite["engine_query"], "\"deployment\" OR \"notes\"");

    let usage = run_json(&config_path, &["usage"]);
    assert_eq!(usage["today_usage"], 0);
}

#[test]
fn test_stats_reports_consistency() {
    let (_tmp, config_path, files_dir) = setup_test_env();
    let root = files_dir.to_string_lossy().to_string();
    run_json(&config_path, &["index", &root]);

    let stats = run_json(&config_path, &["stats", "--json"]);
    assert_eq!(stats["files"], 3);
    assert_eq!(stats["consistent"], true);

    let (stdout, _, success) = run_sfs(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("consistent"));
}

#[test]
fn test_missing_config_fails() {
    let (stdout, stderr, success) = run_sfs(Path::new("/nonexistent/sfs.toml"), &["roots"]);
    assert!(!success);
    assert!(stdout.is_empty());
    assert!(stderr.contains("config"));
}
