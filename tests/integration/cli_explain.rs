#![allow(missing_docs)]

mod common;

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::{json, Value};

fn write_config(dir: &Path, catalog: &Path, db: &Path) -> PathBuf {
    let path = dir.join("dyncore.toml");
    let contents = format!(
        "[database]\npath = {:?}\ncatalog = {:?}\n\n[query]\ndefault_limit = 2\n",
        db.display().to_string(),
        catalog.display().to_string()
    );
    fs::write(&path, contents).expect("write config");
    path
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("valid json")
}

#[test]
fn explain_emits_statements_as_json() {
    let (_dir, catalog, _db) = common::on_disk();
    let output = cargo_bin_cmd!("dyncore")
        .env_remove("DYNCORE_CONFIG")
        .args(["--format", "json", "explain", "--catalog"])
        .arg(&catalog)
        .args([
            "--table",
            "posts",
            "--filter",
            r#"{"author": {"name": {"eq": "ann"}}}"#,
            "--fields",
            "title,author.name",
            "--meta",
            "*",
            "--page",
            "2",
        ])
        .assert()
        .success()
        .get_output()
        .clone();
    let json = stdout_json(&output);
    assert_eq!(json["table"], json!("posts"));
    assert_eq!(json["window"], json!({"limit": 10, "skip": 10}));
    assert_eq!(json["skipped"], json!([]));

    let statements = json["statements"].as_object().expect("statements");
    let labels: Vec<_> = statements.keys().map(String::as_str).collect();
    assert_eq!(labels, vec!["data", "totalCount", "filterCount"]);
    let data = &statements["data"];
    assert_eq!(data["params"], json!(["ann"]));
    assert!(data["sql"].as_str().expect("sql").contains("LEFT JOIN \"users\""));
    assert_eq!(data["fingerprint"].as_str().expect("fingerprint").len(), 16);
}

#[test]
fn explain_reports_skipped_and_strict_paths() {
    let (_dir, catalog, _db) = common::on_disk();
    let output = cargo_bin_cmd!("dyncore")
        .env_remove("DYNCORE_CONFIG")
        .args(["--format", "json", "explain", "--catalog"])
        .arg(&catalog)
        .args(["--table", "posts", "--fields", "title,subtitle"])
        .assert()
        .success()
        .get_output()
        .clone();
    let json = stdout_json(&output);
    assert_eq!(json["skipped"], json!(["subtitle"]));
    assert_eq!(json["deferred"], json!([]));

    let output = cargo_bin_cmd!("dyncore")
        .env_remove("DYNCORE_CONFIG")
        .args(["--format", "json", "explain", "--catalog"])
        .arg(&catalog)
        .args(["--table", "posts", "--sort", "-score"])
        .assert()
        .success()
        .get_output()
        .clone();
    let json = stdout_json(&output);
    assert_eq!(json["deferred"], json!(["tags"]));
    assert!(!json["statements"]["data"]["sql"].as_str().expect("sql").contains("post_tags"));

    let output = cargo_bin_cmd!("dyncore")
        .env_remove("DYNCORE_CONFIG")
        .args(["explain", "--strict", "--catalog"])
        .arg(&catalog)
        .args(["--table", "posts", "--fields", "title,subtitle"])
        .assert()
        .failure()
        .get_output()
        .clone();
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error:"), "{stderr}");
    assert!(stderr.contains("subtitle"), "{stderr}");
}

#[test]
fn find_uses_the_config_file() {
    let (dir, catalog, db) = common::on_disk();
    let config = write_config(dir.path(), &catalog, &db);
    let output = cargo_bin_cmd!("dyncore")
        .arg("--config")
        .arg(&config)
        .args([
            "find",
            "--table",
            "users",
            "--fields",
            "name,role.name",
            "--sort",
            "-name",
            "--meta",
            "filterCount",
        ])
        .assert()
        .success()
        .get_output()
        .clone();
    assert_eq!(
        stdout_json(&output),
        json!({
            "data": [
                {"id": 3, "name": "cy", "role": {"id": 2, "name": "editor"}},
                {"id": 2, "name": "bob", "role": {"id": 2, "name": "editor"}}
            ],
            "meta": {"filterCount": 3}
        })
    );
}

#[test]
fn run_executes_a_script_file() {
    let (dir, catalog, db) = common::on_disk();
    let config = write_config(dir.path(), &catalog, &db);
    let script = dir.path().join("handler.rhai");
    fs::write(
        &script,
        "let user = repos.main.find_one(params.id);\n#{ name: user.name, posts: user.posts.len() }\n",
    )
    .expect("write script");

    let output = cargo_bin_cmd!("dyncore")
        .arg("--config")
        .arg(&config)
        .args(["run", "--table", "users", "--params", r#"{"id": 1}"#, "--script"])
        .arg(&script)
        .assert()
        .success()
        .get_output()
        .clone();
    assert_eq!(stdout_json(&output), json!({"name": "ann", "posts": 2}));

    fs::write(&script, "errors::throw401(\"sign in\")\n").expect("write script");
    let output = cargo_bin_cmd!("dyncore")
        .arg("--config")
        .arg(&config)
        .args(["run", "--script"])
        .arg(&script)
        .assert()
        .failure()
        .get_output()
        .clone();
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Unauthorized (401)"), "{stderr}");
}
