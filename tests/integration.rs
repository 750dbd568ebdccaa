use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn ingest_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("ingest");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let data_dir = root.join("data");
    fs::create_dir_all(&data_dir).unwrap();

    let lines: String = (0..10)
        .map(|i| format!("{{\"id\": \"item-{}\", \"text\": \"sentence number {}\"}}\n", i, i))
        .collect();
    fs::write(data_dir.join("items.jsonl"), lines).unwrap();

    let config_content = format!(
        r#"[output]
dir = "{root}/out"

[cache]
enabled = true
cache_dir = "{root}/cache"

[partial_loading]
enabled = true
initial_count = 4
batch_size = 4

[[data_sources]]
type = "file"
id = "local"
path = "{root}/data/items.jsonl"

[[data_sources]]
type = "carrier_pigeon"
id = "birds"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("ingest.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_ingest(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = ingest_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run ingest binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn stats(config_path: &Path) -> serde_json::Value {
    let (stdout, stderr, success) = run_ingest(config_path, &["stats"]);
    assert!(success, "stats failed: {}", stderr);
    serde_json::from_str(&stdout).unwrap()
}

fn stored_lines(tmp: &TempDir) -> usize {
    fs::read_to_string(tmp.path().join("out/items.jsonl"))
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

#[test]
fn test_sources_lists_live_sources_only() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_ingest(&config, &["sources"]);
    assert!(success, "sources failed: {}", stderr);

    let local = stdout.lines().find(|l| l.starts_with("local")).unwrap();
    assert!(local.contains("OK"));
    assert!(!stdout.lines().any(|l| l.starts_with("birds")));
    assert!(stdout.lines().any(|l| l.starts_with("huggingface")));
}

#[test]
fn test_load_then_more_until_complete() {
    let (tmp, config) = setup_test_env();

    let (stdout, stderr, success) = run_ingest(&config, &["load"]);
    assert!(success, "load failed: {}", stderr);
    assert!(stdout.contains("loaded 4 new items"));
    assert_eq!(stored_lines(&tmp), 4);

    let (stdout, _, success) = run_ingest(&config, &["more", "local"]);
    assert!(success);
    assert!(stdout.contains("loaded 4 new items from local"));

    let (stdout, _, success) = run_ingest(&config, &["more", "local"]);
    assert!(success);
    assert!(stdout.contains("loaded 2 new items from local"));

    let (stdout, _, success) = run_ingest(&config, &["more", "local"]);
    assert!(success);
    assert!(stdout.contains("loaded 0 new items from local"));
    assert_eq!(stored_lines(&tmp), 10);

    let stats = stats(&config);
    let source = &stats["sources"][0];
    assert_eq!(source["id"], "local");
    assert_eq!(source["items_loaded"], 10);
    assert_eq!(source["is_complete"], true);
    assert_eq!(stats["item_count"], 10);
}

#[test]
fn test_more_with_count_override() {
    let (tmp, config) = setup_test_env();
    let (stdout, _, success) = run_ingest(&config, &["more", "local", "--count", "7"]);
    assert!(success);
    assert!(stdout.contains("loaded 7 new items"));
    assert_eq!(stored_lines(&tmp), 7);
}

#[test]
fn test_more_unknown_source_fails() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, success) = run_ingest(&config, &["more", "nope"]);
    assert!(!success);
    assert!(stderr.contains("unknown source"));
}

#[test]
fn test_refresh_resets_position_and_dedups() {
    let (tmp, config) = setup_test_env();
    run_ingest(&config, &["load"]);

    let (stdout, stderr, success) = run_ingest(&config, &["refresh", "local"]);
    assert!(success, "refresh failed: {}", stderr);
    assert!(stdout.contains("refreshed local"));
    assert!(stats(&config)["sources"][0]["items_loaded"].is_null());

    // Same first batch again: every item is a duplicate, so nothing new
    // arrives and the source counts as exhausted.
    let (stdout, _, _) = run_ingest(&config, &["more", "local"]);
    assert!(stdout.contains("loaded 0 new items"));
    assert_eq!(stored_lines(&tmp), 4);
    let source = &stats(&config)["sources"][0];
    assert_eq!(source["items_loaded"], 0);
    assert_eq!(source["is_complete"], true);
}

#[test]
fn test_auto_load_respects_threshold() {
    let (tmp, config) = setup_test_env();
    run_ingest(&config, &["load"]);

    let (stdout, _, success) = run_ingest(&config, &["auto", "--annotated", "3"]);
    assert!(success);
    assert!(stdout.contains("no source needs more items"));

    let (stdout, _, success) = run_ingest(&config, &["auto", "--annotated", "4"]);
    assert!(success);
    assert!(stdout.contains("loaded 4 new items from local"));
    assert_eq!(stored_lines(&tmp), 8);
}

#[test]
fn test_cache_commands() {
    let (_tmp, config) = setup_test_env();
    let (stdout, _, success) = run_ingest(&config, &["cache", "clear"]);
    assert!(success);
    assert!(stdout.contains("cleared 0 cache entries"));

    let (stdout, _, success) = run_ingest(&config, &["cache", "cleanup"]);
    assert!(success);
    assert!(stdout.contains("removed 0 expired cache entries"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_ingest(&tmp.path().join("absent.toml"), &["sources"]);
    assert!(!success);
    assert!(stderr.contains("Error"));
}
