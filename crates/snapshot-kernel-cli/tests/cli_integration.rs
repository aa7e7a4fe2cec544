use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_sk<I, S>(envs: &[(&str, &str)], args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(env!("CARGO_BIN_EXE_sk"));
    for (key, value) in envs {
        command.env(key, value);
    }
    command.args(args).output().unwrap_or_else(|err| panic!("failed to execute sk binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_sk(&[], args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "sk command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }
    parse_stdout(&output)
}

fn parse_stdout(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_bool(value: &Value, key: &str) -> bool {
    value
        .get(key)
        .and_then(Value::as_bool)
        .unwrap_or_else(|| panic!("missing boolean field `{key}` in payload: {value}"))
}

fn as_array<'a>(value: &'a Value, key: &str) -> &'a Vec<Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

#[test]
fn schema_audit_fails_until_migrations_apply() {
    let dir = unique_temp_dir("sk-cli-schema");
    let db = dir.join("kernel.sqlite3");

    let fresh = run_sk(
        &[],
        ["--db", path_str(&db), "--root", path_str(&dir), "schema", "audit", "--assert"],
    );
    assert!(!fresh.status.success(), "audit of an empty database should fail the assertion");
    let payload = parse_stdout(&fresh);
    assert_eq!(as_str(&payload, "contract_version"), "sk.v1");
    assert!(!as_bool(&payload, "ok"));

    let plan = run_json([
        "--db",
        path_str(&db),
        "--root",
        path_str(&dir),
        "schema",
        "migrate",
    ]);
    assert!(!as_bool(&plan, "applied"));
    assert!(!as_array(&plan, "tables_needing_migration").is_empty());

    let applied = run_json([
        "--db",
        path_str(&db),
        "--root",
        path_str(&dir),
        "schema",
        "migrate",
        "--apply",
    ]);
    assert!(as_bool(&applied, "applied"));
    assert!(!as_array(&applied, "steps").is_empty());
    assert_eq!(applied["warnings"], Value::from(0));

    let audit = run_json([
        "--db",
        path_str(&db),
        "--root",
        path_str(&dir),
        "schema",
        "audit",
        "--assert",
        "--print-report",
    ]);
    assert!(as_bool(&audit, "ok"));
    assert!(audit["tables"]["snapshot_index"]["present"].as_bool() == Some(true));

    let again = run_json([
        "--db",
        path_str(&db),
        "--root",
        path_str(&dir),
        "schema",
        "migrate",
        "--apply",
    ]);
    assert!(as_array(&again, "steps").is_empty());
}

#[test]
fn snapshot_take_and_diff_report_row_changes() {
    let dir = unique_temp_dir("sk-cli-diff");
    let db = dir.join("kernel.sqlite3");

    let pre = run_json([
        "--db",
        path_str(&db),
        "--root",
        path_str(&dir),
        "snapshot",
        "take",
        "--label",
        "pre",
        "--run-id",
        "cli-run",
    ]);
    let pre_meta = Path::new(as_str(&pre, "run_dir")).join("pre").join("snapshot_meta.json");
    assert!(pre_meta.exists());

    // Mutate the database between the two snapshots.
    run_json(["--db", path_str(&db), "--root", path_str(&dir), "schema", "migrate", "--apply"]);

    let post = run_json([
        "--db",
        path_str(&db),
        "--root",
        path_str(&dir),
        "snapshot",
        "take",
        "--label",
        "post",
        "--run-id",
        "cli-run",
    ]);
    let post_meta = Path::new(as_str(&post, "run_dir")).join("post").join("snapshot_meta.json");

    let report = run_json([
        "--db",
        path_str(&db),
        "--root",
        path_str(&dir),
        "snapshot",
        "diff",
        "--pre-meta",
        path_str(&pre_meta),
        "--post-meta",
        path_str(&post_meta),
    ]);
    assert_eq!(as_str(&report, "run_id"), "cli-run");
    let changed = as_array(&report, "tables_changed");
    assert!(changed.contains(&Value::from("schema_migrations")));
    assert_eq!(report["row_changes"]["schema_migrations"]["added"], Value::from(1));
}

#[test]
fn wrap_indexes_a_successful_run_and_keeps_streams_aligned() {
    let dir = unique_temp_dir("sk-cli-wrap-ok");
    let db = dir.join("kernel.sqlite3");

    let wrap = run_json([
        "--db",
        path_str(&db),
        "--root",
        path_str(&dir),
        "snapshot",
        "wrap",
        "--run-id",
        "wrap-ok",
        "--",
        "true",
    ]);
    assert_eq!(as_str(&wrap, "status"), "ok");
    assert_eq!(wrap["exit_code"], Value::from(0));
    assert!(wrap["diff"].is_object());

    let audit_log = Path::new(as_str(&wrap, "run_dir")).join("audit.jsonl");
    let body = fs::read_to_string(&audit_log)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", audit_log.display()));
    assert_eq!(body.lines().count(), 2);

    let latest = run_json(["--db", path_str(&db), "--root", path_str(&dir), "runs", "latest"]);
    assert_eq!(as_str(&latest, "run_id"), "wrap-ok");
    assert_eq!(as_str(&latest, "status"), "ok");
    assert!(latest["pre_checksum"].is_string());

    let shown = run_json([
        "--db",
        path_str(&db),
        "--root",
        path_str(&dir),
        "runs",
        "show",
        "--run-id",
        "wrap-ok",
    ]);
    assert_eq!(as_str(&shown, "snapshot_id"), as_str(&latest, "snapshot_id"));

    let check = run_json(["--db", path_str(&db), "--root", path_str(&dir), "crosscheck"]);
    assert!(as_bool(&check, "aligned"));

    let summary =
        run_json(["--db", path_str(&db), "--root", path_str(&dir), "runs", "audit"]);
    assert_eq!(as_str(&summary, "run_id"), "wrap-ok");
    assert!(summary["diff"].is_object());
}

#[test]
fn wrap_propagates_a_failing_command_exit() {
    let dir = unique_temp_dir("sk-cli-wrap-fail");
    let db = dir.join("kernel.sqlite3");

    let output = run_sk(
        &[],
        [
            "--db",
            path_str(&db),
            "--root",
            path_str(&dir),
            "snapshot",
            "wrap",
            "--run-id",
            "wrap-fail",
            "--",
            "false",
        ],
    );
    assert!(!output.status.success());
    let payload = parse_stdout(&output);
    assert_eq!(as_str(&payload, "status"), "error");

    let latest = run_json(["--db", path_str(&db), "--root", path_str(&dir), "runs", "latest"]);
    assert_eq!(as_str(&latest, "status"), "error");
}

#[test]
fn off_mode_wrap_skips_copies_and_diffing() {
    let dir = unique_temp_dir("sk-cli-wrap-off");
    let db = dir.join("kernel.sqlite3");

    let output = run_sk(
        &[("SNAPSHOT_KERNEL_MODE", "off")],
        [
            "--db",
            path_str(&db),
            "--root",
            path_str(&dir),
            "snapshot",
            "wrap",
            "--run-id",
            "wrap-off",
            "--",
            "true",
        ],
    );
    assert!(output.status.success());
    let payload = parse_stdout(&output);
    assert!(payload["diff"].is_null());

    let run_dir = Path::new(as_str(&payload, "run_dir"));
    assert!(!run_dir.join("pre").join("db_copy.sqlite3").exists());

    let latest = run_json(["--db", path_str(&db), "--root", path_str(&dir), "runs", "latest"]);
    assert!(latest["pre_checksum"].is_null());
    assert_eq!(as_str(&latest, "status"), "ok");
}

#[test]
fn mode_resolution_prefers_config_file_over_history() {
    let dir = unique_temp_dir("sk-cli-mode");
    let db = dir.join("kernel.sqlite3");
    let configs = dir.join("configs");
    fs::create_dir_all(&configs)
        .unwrap_or_else(|err| panic!("failed to create configs dir: {err}"));
    fs::write(configs.join("snapshot_kernel.json"), r#"{"snapshot_mode": "light"}"#)
        .unwrap_or_else(|err| panic!("failed to write config: {err}"));
    fs::write(
        configs.join("snapshot_history.json"),
        r#"{"history": [{"mode": "heavy"}]}"#,
    )
    .unwrap_or_else(|err| panic!("failed to write history: {err}"));

    let snapshot = run_json([
        "--db",
        path_str(&db),
        "--root",
        path_str(&dir),
        "snapshot",
        "take",
        "--label",
        "pre",
        "--run-id",
        "mode-run",
    ]);
    assert_eq!(as_str(&snapshot, "mode"), "light");
    // Light mode still captures the database copy checksum.
    assert!(snapshot["db_checksum"].is_string());
}
