use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn weavr_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("weavr");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let notes_dir = root.join("notes");
    fs::create_dir_all(notes_dir.join("projects")).unwrap();
    fs::write(
        notes_dir.join("meeting.md"),
        "# Meeting notes\n\nThe team met on Monday.\n\nMeeting notes: the budget was approved and the launch moved to March.",
    )
    .unwrap();
    fs::write(
        notes_dir.join("projects").join("rust.md"),
        "# Rust\n\nOwnership and borrowing rules keep memory safe without a garbage collector.",
    )
    .unwrap();
    fs::write(notes_dir.join("ignored.txt"), "plain text is not indexed").unwrap();

    let out_dir = root.join("out");
    fs::create_dir_all(&out_dir).unwrap();

    let config_content = format!(
        r#"[knowledge_base]
root = "{root}/notes"

[store]
dir = "{root}/data"

[output]
dir = "{root}/out"

[embedding]
provider = "hash"

[model]
api_key_env = "WEAVR_INTEGRATION_KEY_NEVER_SET"

[logging]
level = "warn"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("weavr.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_weavr(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = weavr_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run weavr binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_index_counts_markdown_only() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_weavr(&config_path, &["index"]);
    assert!(success, "index failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Indexed 2 document(s)"), "stdout: {stdout}");

    let (stdout, _, success) = run_weavr(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("Documents:       2"), "stdout: {stdout}");
    assert!(stdout.contains("Retrieval:       on"));
}

#[test]
fn test_index_is_incremental_across_runs() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_weavr(&config_path, &["index"]);
    assert!(success);
    assert!(stdout.contains("Indexed 2 document(s)"));

    let (stdout, stderr, success) = run_weavr(&config_path, &["index"]);
    assert!(success, "second index failed: {stderr}");
    assert!(stdout.contains("Indexed 0 document(s)"), "stdout: {stdout}");

    let (stdout, _, success) = run_weavr(&config_path, &["index", "--full"]);
    assert!(success);
    assert!(stdout.contains("Indexed 0 document(s), 2 unchanged"), "stdout: {stdout}");
}

#[test]
fn test_search_broad_query_returns_whole_document() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) =
        run_weavr(&config_path, &["search", "summarize meeting notes", "--json"]);
    assert!(success, "search failed: stdout={}, stderr={}", stdout, stderr);

    let result: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(result["granularity"], "whole_documents");
    let first = &result["passages"][0];
    assert!(first["document"].as_str().unwrap().ends_with("meeting.md"));
    assert!(first["chunk"].is_null());
    assert!(first["text"]
        .as_str()
        .unwrap()
        .contains("the launch moved to March"));
}

#[test]
fn test_search_deterministic() {
    let (_tmp, config_path) = setup_test_env();
    run_weavr(&config_path, &["index"]);

    let (first, _, _) = run_weavr(
        &config_path,
        &["search", "how does ownership keep memory safe", "--json"],
    );
    let (second, _, _) = run_weavr(
        &config_path,
        &["search", "how does ownership keep memory safe", "--json"],
    );
    assert_eq!(first, second);
}

#[test]
fn test_clear_knowledge_then_search_finds_nothing() {
    let (_tmp, config_path) = setup_test_env();
    run_weavr(&config_path, &["index"]);

    let (stdout, _, success) = run_weavr(&config_path, &["clear-knowledge"]);
    assert!(success);
    assert!(stdout.contains("Knowledge base cleared."));

    let (stdout, _, success) = run_weavr(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("Documents:       0"), "stdout: {stdout}");
    assert!(stdout.contains("notes"), "root is kept: {stdout}");
}

#[test]
fn test_retrieval_toggle_persists() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_weavr(&config_path, &["retrieval", "off"]);
    assert!(success);
    assert!(stdout.contains("Retrieval disabled."));

    let (stdout, _, _) = run_weavr(&config_path, &["status", "--json"]);
    let status: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(status["retrieval_enabled"], false);
}

#[test]
fn test_set_file_limit_zero_rejected() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_weavr(&config_path, &["set-file-limit", "0"]);
    assert!(!success);
    assert!(stderr.contains("file limit"), "stderr: {stderr}");
}

#[test]
fn test_set_file_limit_excludes_documents() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_weavr(&config_path, &["set-file-limit", "1"]);
    assert!(success, "stderr: {stderr}");
    assert!(stdout.contains("1 document(s) excluded"), "stdout: {stdout}");

    let (stdout, _, _) = run_weavr(&config_path, &["status"]);
    assert!(stdout.contains("Documents:       1"));
    // Shallower path wins.
    assert!(stdout.contains("rust.md"), "excluded list: {stdout}");
}

#[test]
fn test_set_root_missing_directory() {
    let (tmp, config_path) = setup_test_env();
    let missing = tmp.path().join("does-not-exist");

    let (_, stderr, success) =
        run_weavr(&config_path, &["set-root", missing.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("not found"), "stderr: {stderr}");
}

#[cfg(unix)]
#[test]
fn test_set_root_symlink_rejected() {
    let (tmp, config_path) = setup_test_env();
    let link = tmp.path().join("notes-link");
    std::os::unix::fs::symlink(tmp.path().join("notes"), &link).unwrap();

    let (_, stderr, success) = run_weavr(&config_path, &["set-root", link.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("security violation"), "stderr: {stderr}");
}

#[test]
fn test_ask_rejects_invalid_parameters() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_weavr(
        &config_path,
        &["ask", "what was decided?", "--temperature", "1.5", "--max-tokens", "0"],
    );
    assert!(!success);
    assert!(stderr.contains("temperature"), "stderr: {stderr}");
    assert!(stderr.contains("max output length"), "stderr: {stderr}");
}

#[test]
fn test_ask_without_api_key_reports_unconfigured_model() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_weavr(&config_path, &["ask", "what was decided?"]);
    assert!(!success);
    assert!(
        stderr.contains("WEAVR_INTEGRATION_KEY_NEVER_SET"),
        "stderr: {stderr}"
    );
}

#[test]
fn test_index_without_root_fails() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("weavr.toml");
    fs::write(&config_path, "[logging]\nlevel = \"warn\"\n").unwrap();

    let (_, stderr, success) = run_weavr(&config_path, &["index"]);
    assert!(!success);
    assert!(stderr.contains("root is not configured"), "stderr: {stderr}");
}

#[test]
fn test_invalid_config_rejected() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("weavr.toml");
    fs::write(
        &config_path,
        "[reasoning]\nstages = [\"consistency_validation\", \"chain_of_thought\"]\n",
    )
    .unwrap();

    let (_, stderr, success) = run_weavr(&config_path, &["status"]);
    assert!(!success);
    assert!(stderr.contains("reasoning.stages"), "stderr: {stderr}");
}

#[test]
fn test_missing_config_file_errors() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_weavr(&tmp.path().join("nope.toml"), &["status"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"), "stderr: {stderr}");
}
