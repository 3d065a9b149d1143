//! Subprocess tests against the `agrafes` binary: init, import, index, query,
//! align, and validate-meta, exercised through the real CLI surface rather
//! than the library API directly.

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

fn agrafes_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // test binary
    path.pop(); // deps/
    path.push("agrafes");
    path
}

fn run(config_path: &Path, args: &[&str]) -> (serde_json::Value, bool) {
    let binary = agrafes_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path)
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run agrafes binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let body: serde_json::Value = serde_json::from_str(stdout.trim())
        .unwrap_or_else(|e| panic!("stdout was not one JSON object: {}\nstdout={}", e, stdout));
    (body, output.status.success())
}

/// Returns (config_path, tmp dir guard). `init-project` writes the config
/// and the database itself, so callers run that first.
fn config_path(dir: &TempDir) -> PathBuf {
    dir.path().join("config/agrafes.toml")
}

fn migrations_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations")
}

#[test]
fn init_project_creates_config_and_db() {
    let dir = TempDir::new().unwrap();
    let config = config_path(&dir);
    let db_path = dir.path().join("data/corpus.db");

    let (body, ok) = run(
        &config,
        &[
            "init-project",
            "--db-path",
            db_path.to_str().unwrap(),
            "--migrations-dir",
            migrations_dir().to_str().unwrap(),
        ],
    );
    assert!(ok, "init-project failed: {}", body);
    assert_eq!(body["ok"], serde_json::json!(true));
    assert!(config.exists());
    assert!(db_path.exists());
}

#[test]
fn import_index_and_query_round_trip() {
    let dir = TempDir::new().unwrap();
    let config = config_path(&dir);
    let db_path = dir.path().join("data/corpus.db");
    run(
        &config,
        &[
            "init-project",
            "--db-path",
            db_path.to_str().unwrap(),
            "--migrations-dir",
            migrations_dir().to_str().unwrap(),
        ],
    );

    let doc_path = dir.path().join("doc.txt");
    std::fs::write(&doc_path, "[1] Bonjour needle.\n[2] Salut.\n[3] Encore needle.\n").unwrap();

    let (import_body, ok) = run(
        &config,
        &[
            "import",
            "--title",
            "Sample",
            "--language",
            "fr",
            "--source-path",
            doc_path.to_str().unwrap(),
        ],
    );
    assert!(ok, "import failed: {}", import_body);
    assert!(import_body["run_id"].is_string());

    let (index_body, ok) = run(&config, &["index"]);
    assert!(ok, "index failed: {}", index_body);
    assert_eq!(index_body["units_indexed"], serde_json::json!(3));

    let (query_body, ok) = run(&config, &["query", "--fts-query", "needle"]);
    assert!(ok, "query failed: {}", query_body);
    assert_eq!(query_body["hits"].as_array().unwrap().len(), 2);
}

#[test]
fn unknown_query_mode_is_a_validation_error() {
    let dir = TempDir::new().unwrap();
    let config = config_path(&dir);
    let db_path = dir.path().join("data/corpus.db");
    run(
        &config,
        &[
            "init-project",
            "--db-path",
            db_path.to_str().unwrap(),
            "--migrations-dir",
            migrations_dir().to_str().unwrap(),
        ],
    );

    let (body, ok) = run(&config, &["query", "--fts-query", "x", "--mode", "weird"]);
    assert!(!ok);
    assert_eq!(body["ok"], serde_json::json!(false));
    assert_eq!(body["error_code"], serde_json::json!("VALIDATION_ERROR"));
}

#[test]
fn status_reports_missing_sidecar_and_clean_diagnostics() {
    let dir = TempDir::new().unwrap();
    let config = config_path(&dir);
    let db_path = dir.path().join("data/corpus.db");
    run(
        &config,
        &[
            "init-project",
            "--db-path",
            db_path.to_str().unwrap(),
            "--migrations-dir",
            migrations_dir().to_str().unwrap(),
        ],
    );

    let (body, ok) = run(&config, &["status"]);
    assert!(ok, "status failed: {}", body);
    assert_eq!(body["sidecar"]["state"], serde_json::json!("missing"));
}

#[test]
fn align_with_missing_documents_is_not_found() {
    let dir = TempDir::new().unwrap();
    let config = config_path(&dir);
    let db_path = dir.path().join("data/corpus.db");
    run(
        &config,
        &[
            "init-project",
            "--db-path",
            db_path.to_str().unwrap(),
            "--migrations-dir",
            migrations_dir().to_str().unwrap(),
        ],
    );

    let (body, ok) = run(
        &config,
        &["align", "--pivot-doc-id", "1", "--target-doc-id", "2"],
    );
    assert!(!ok);
    assert_eq!(body["error_code"], serde_json::json!("NOT_FOUND"));
}
