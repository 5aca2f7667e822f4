use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn rag_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("rag");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(files_dir.join("hr")).unwrap();
    fs::write(
        files_dir.join("hr/vacation.md"),
        "All employees receive 21 days of paid vacation per year. Requests go through the HR portal.",
    )
    .unwrap();
    fs::write(
        files_dir.join("deploy.md"),
        "Deployments go out through the release pipeline every Tuesday after the change review.",
    )
    .unwrap();
    fs::write(
        files_dir.join("vpn.txt"),
        "Connect to the VPN before opening internal dashboards or the build server.",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/rag.sqlite"

[embedding]
provider = "hashing"
dims = 256

[retrieval]
search_limit = 10

[rerank]
provider = "lexical"
top_n = 3

[generation]
provider = "extractive"

[ingest]
root = "{root}/files"

[logging]
level = "warn"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("rag.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_rag(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = rag_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run rag binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_rag(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));

    let (_, _, success) = run_rag(&config_path, &["init"]);
    assert!(success, "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_counts_and_is_idempotent() {
    let (_tmp, config_path) = setup_test_env();
    run_rag(&config_path, &["init"]);

    let (stdout, stderr, success) = run_rag(&config_path, &["ingest"]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("documents: 3"));
    assert!(stdout.contains("parent chunks: 3"));
    assert!(stdout.contains("child chunks: 3"));
    assert!(stdout.contains("ok"));

    let (first_search, _, _) = run_rag(&config_path, &["search", "release pipeline", "--no-rerank"]);
    let (stdout, _, success) = run_rag(&config_path, &["ingest"]);
    assert!(success);
    assert!(stdout.contains("documents: 3"));
    let (second_search, _, _) = run_rag(&config_path, &["search", "release pipeline", "--no-rerank"]);
    assert_eq!(first_search, second_search);
}

#[test]
fn test_search_ranks_vacation_policy_first() {
    let (_tmp, config_path) = setup_test_env();
    run_rag(&config_path, &["ingest"]);

    let (stdout, stderr, success) = run_rag(&config_path, &["search", "What is our vacation policy?"]);
    assert!(success, "search failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("reranked: true"));
    let first = stdout.lines().find(|l| l.starts_with("1. ")).unwrap();
    assert!(first.contains("vacation.md"), "unexpected top result: {}", stdout);
    assert!(stdout.contains("21 days"));
}

#[test]
fn test_search_limit() {
    let (_tmp, config_path) = setup_test_env();
    run_rag(&config_path, &["ingest"]);

    let (stdout, _, success) = run_rag(&config_path, &["search", "internal dashboards", "--limit", "1"]);
    assert!(success);
    assert!(stdout.contains("1. "));
    assert!(!stdout.contains("2. "));
}

#[test]
fn test_ask_streams_cited_answer() {
    let (_tmp, config_path) = setup_test_env();
    run_rag(&config_path, &["ingest"]);

    let (stdout, stderr, success) = run_rag(&config_path, &["ask", "What is our vacation policy?"]);
    assert!(success, "ask failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("According to [1], All employees receive 21 days of paid vacation per year."));
    assert!(stdout.contains("*[1] vacation.md (hr/vacation.md)"));
}

#[test]
fn test_ask_rejects_empty_question() {
    let (_tmp, config_path) = setup_test_env();
    run_rag(&config_path, &["init"]);

    let (_, stderr, success) = run_rag(&config_path, &["ask", "   "]);
    assert!(!success);
    assert!(stderr.contains("query is empty"));
}

#[test]
fn test_delete_document() {
    let (_tmp, config_path) = setup_test_env();
    run_rag(&config_path, &["ingest"]);

    let (stdout, stderr, success) = run_rag(&config_path, &["delete", "deploy.md"]);
    assert!(success, "delete failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("deleted deploy.md (2 chunks)"));

    let (stdout, _, _) = run_rag(&config_path, &["search", "release pipeline", "--no-rerank"]);
    assert!(!stdout.contains("deploy.md"));

    let (_, stderr, success) = run_rag(&config_path, &["delete", "deploy.md"]);
    assert!(!success);
    assert!(stderr.contains("not found"));
}

#[test]
fn test_changed_embedding_model_is_refused() {
    let (_tmp, config_path) = setup_test_env();
    run_rag(&config_path, &["ingest"]);

    let content = fs::read_to_string(&config_path).unwrap().replace("dims = 256", "dims = 128");
    fs::write(&config_path, content).unwrap();

    let (_, stderr, success) = run_rag(&config_path, &["search", "vacation"]);
    assert!(!success);
    assert!(stderr.contains("re-ingest"), "stderr: {}", stderr);
}

#[test]
fn test_invalid_config_rejected() {
    let (_tmp, config_path) = setup_test_env();
    let content = fs::read_to_string(&config_path).unwrap().replace("top_n = 3", "top_n = 0");
    fs::write(&config_path, content).unwrap();

    let (_, stderr, success) = run_rag(&config_path, &["init"]);
    assert!(!success);
    assert!(stderr.contains("rerank.top_n"));
}
