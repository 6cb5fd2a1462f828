#![allow(clippy::manual_let_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use ulid::Ulid;

fn famsync_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_famsync"));
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }
    command.env("RUST_LOG", "warn");

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to execute famsync command {:?}: {err}", args),
    }
}

fn run_json(db_path: &Path, args: &[&str]) -> Value {
    let output = famsync_output(db_path, args);
    assert!(
        output.status.success(),
        "famsync {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn string_at(value: &Value, pointer: &str) -> String {
    match value.pointer(pointer).and_then(Value::as_str) {
        Some(raw) => raw.to_string(),
        None => panic!("missing string at {pointer} in {value}"),
    }
}

fn temp_db(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("famsync-cli-{label}-{}.sqlite3", Ulid::new()))
}

fn remove_db(path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let mut raw = path.as_os_str().to_os_string();
        raw.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(raw));
    }
}

#[test]
fn routine_completion_round_trip_through_the_binary() {
    let db = temp_db("routine");

    let init = run_json(
        &db,
        &[
            "family",
            "init",
            "--name",
            "Rivera",
            "--time-zone",
            "America/Chicago",
            "--parent",
            "Maria",
        ],
    );
    let family_id = string_at(&init, "/family/id");

    let child = run_json(&db, &["child", "add", "--family", &family_id, "--name", "Ana"]);
    let child_id = string_at(&child, "/id");

    let created = run_json(
        &db,
        &[
            "routine", "create", "--family", &family_id, "--title", "Morning", "--step",
            "Brush teeth", "--step", "Get dressed",
        ],
    );
    let routine_id = string_at(&created, "/routine/id");
    let first_step = string_at(&created, "/steps/0/id");
    let second_step = string_at(&created, "/steps/1/id");

    run_json(&db, &["routine", "assign", "--routine", &routine_id, "--child", &child_id]);

    for step in [&first_step, &second_step] {
        let event = run_json(
            &db,
            &["step", "complete", "--child", &child_id, "--routine", &routine_id, "--step", step],
        );
        assert_eq!(event["event_type"], Value::String("COMPLETE".to_string()));
    }

    let status = run_json(&db, &["status", "--child", &child_id, "--routine", &routine_id]);
    assert_eq!(status["complete"], Value::Bool(true));

    run_json(
        &db,
        &["step", "undo", "--child", &child_id, "--routine", &routine_id, "--step", &first_step],
    );
    let status = run_json(&db, &["status", "--child", &child_id, "--routine", &routine_id]);
    assert_eq!(status["complete"], Value::Bool(false));

    let progress = run_json(&db, &["status", "--child", &child_id]);
    assert_eq!(progress["event_count"], Value::from(3));

    let listed = run_json(&db, &["routine", "list", "--family", &family_id]);
    assert_eq!(listed.as_array().map(Vec::len), Some(1));

    remove_db(&db);
}

#[test]
fn invite_link_join_and_exhaustion() {
    let db = temp_db("invite");

    let init = run_json(&db, &["family", "init", "--name", "Rivera", "--parent", "Maria"]);
    let family_id = string_at(&init, "/family/id");
    let parent_id = string_at(&init, "/parent/id");

    let created = run_json(
        &db,
        &["invite", "create", "--family", &family_id, "--by", &parent_id, "--max-uses", "1"],
    );
    let url = string_at(&created, "/url");
    let code = string_at(&created, "/invite/code");
    assert!(url.starts_with("famsync://join?familyId="));
    assert_eq!(created["state"], Value::String("valid".to_string()));

    let linked = run_json(&db, &["invite", "link", &code]);
    assert_eq!(string_at(&linked, "/url"), url);

    let joined = run_json(&db, &["invite", "redeem", &url, "--name", "Grandma"]);
    assert_eq!(string_at(&joined, "/user/family_id"), family_id);
    assert_eq!(joined["invite"]["used_count"], Value::from(1));

    let again = famsync_output(&db, &["invite", "redeem", &code, "--name", "Uncle"]);
    assert!(!again.status.success());
    assert!(String::from_utf8_lossy(&again.stderr).contains("exhausted"));

    remove_db(&db);
}

#[test]
fn sync_against_unreachable_remote_reports_errors() {
    let db = temp_db("sync");
    let config = std::env::temp_dir().join(format!("famsync-cli-config-{}.json", Ulid::new()));
    if let Err(err) = std::fs::write(&config, r#"{"remote_timeout_ms": 500}"#) {
        panic!("failed to write config: {err}");
    }
    let config_arg = match config.to_str() {
        Some(value) => value.to_string(),
        None => panic!("config path is not valid UTF-8"),
    };

    let init = run_json(&db, &["family", "init", "--name", "Rivera", "--parent", "Maria"]);
    let family_id = string_at(&init, "/family/id");

    let report = run_json(
        &db,
        &[
            "--config",
            &config_arg,
            "sync",
            "--remote",
            "http://127.0.0.1:9",
            "--family",
            &family_id,
        ],
    );
    let collections = match report["collections"].as_array() {
        Some(value) => value,
        None => panic!("expected collections array in {report}"),
    };
    assert_eq!(collections.len(), 8);
    assert!(collections
        .iter()
        .all(|collection| !collection["pull_error"].is_null()));
    let family_report = collections
        .iter()
        .find(|collection| collection["collection"] == Value::String("family".to_string()));
    match family_report {
        Some(report) => assert!(!report["upload_error"].is_null(), "{report}"),
        None => panic!("expected a family collection report in {report}"),
    }

    let _ = std::fs::remove_file(&config);
    remove_db(&db);
}
