use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

const ADMIN: &str = "lead@conference.example";
const MEMBER: &str = "member@conference.example";

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

fn run_casebook<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_casebook"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute casebook binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_casebook(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "casebook command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_u64(value: &Value, key: &str) -> u64 {
    value
        .get(key)
        .and_then(Value::as_u64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_bool(value: &Value, key: &str) -> bool {
    value
        .get(key)
        .and_then(Value::as_bool)
        .unwrap_or_else(|| panic!("missing boolean field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn seed_users(db: &str) {
    run_json(["--db", db, "user", "add", "--actor", ADMIN, "--email", ADMIN, "--admin"]);
    run_json(["--db", db, "user", "add", "--actor", ADMIN, "--email", MEMBER]);
}

fn add_client(db: &str) -> i64 {
    let value = run_json([
        "--db",
        db,
        "client",
        "add",
        "--actor",
        MEMBER,
        "--first-name",
        "Rosa",
        "--last-name",
        "Alvarez",
    ]);
    value
        .get("id")
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing client id in payload: {value}"))
}

fn seed_legacy(db: &str, client_id: i64, count: usize) {
    let client_id = client_id.to_string();
    let count = count.to_string();
    run_json([
        "--db",
        db,
        "visit",
        "seed-legacy",
        "--actor",
        ADMIN,
        "--client-id",
        &client_id,
        "--visited-on",
        "2026-05-02",
        "--assistance",
        "rent assistance",
        "--count",
        &count,
    ]);
}

#[test]
fn db_init_reports_the_latest_schema_version() {
    let dir = unique_temp_dir("casebook-cli-init");
    let db = dir.join("casebook.sqlite3");

    let value = run_json(["--db", path_str(&db), "db", "init"]);
    assert_eq!(value.get("contract_version").and_then(Value::as_str), Some("cli.v1"));
    assert_eq!(as_i64(&value, "schema_version"), 1);

    let version = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_i64(&version, "schema_version"), 1);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn intake_round_trip_writes_visits_with_an_explicit_retired_flag() {
    let dir = unique_temp_dir("casebook-cli-intake");
    let db = dir.join("casebook.sqlite3");
    let db = path_str(&db).to_string();

    seed_users(&db);
    let client_id = add_client(&db);

    let shown = run_json(["--db", &db, "client", "show", "--actor", MEMBER, "--id", &client_id.to_string()]);
    assert_eq!(as_i64(&shown, "id"), client_id);

    run_json([
        "--db",
        &db,
        "visit",
        "add",
        "--actor",
        MEMBER,
        "--client-id",
        &client_id.to_string(),
        "--visited-on",
        "2026-06-10",
        "--assistance",
        "food voucher",
        "--note",
        "follow up next month",
    ]);

    let listed =
        run_json(["--db", &db, "visit", "list", "--actor", MEMBER, "--client-id", &client_id.to_string()]);
    let visits = listed
        .get("visits")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing visits array in payload: {listed}"));
    assert_eq!(visits.len(), 1);
    assert_eq!(
        visits[0].get("visit").and_then(|visit| visit.get("retired")),
        Some(&Value::Bool(false))
    );

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn client_edit_and_list_round_trip() {
    let dir = unique_temp_dir("casebook-cli-client-edit");
    let db = dir.join("casebook.sqlite3");
    let db = path_str(&db).to_string();

    seed_users(&db);
    let client_id = add_client(&db);

    let edited = run_json([
        "--db",
        &db,
        "client",
        "edit",
        "--id",
        &client_id.to_string(),
        "--actor",
        MEMBER,
        "--first-name",
        "Rosa",
        "--last-name",
        "Alvarez-Rios",
        "--phone",
        "555-0100",
    ]);
    assert_eq!(as_i64(&edited, "id"), client_id);

    let missing = run_casebook([
        "--db",
        &db,
        "client",
        "edit",
        "--id",
        "9999",
        "--actor",
        MEMBER,
        "--first-name",
        "No",
        "--last-name",
        "One",
    ]);
    assert!(!missing.status.success());

    let listed = run_json(["--db", &db, "client", "list", "--actor", MEMBER]);
    let clients = listed
        .get("clients")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing clients array in payload: {listed}"));
    assert_eq!(clients.len(), 1);
    assert_eq!(
        clients[0].get("client").and_then(|client| client.get("last_name")).and_then(Value::as_str),
        Some("Alvarez-Rios")
    );
    assert_eq!(
        clients[0].get("client").and_then(|client| client.get("phone")).and_then(Value::as_str),
        Some("555-0100")
    );

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn intake_refuses_an_unregistered_actor() {
    let dir = unique_temp_dir("casebook-cli-forbidden");
    let db = dir.join("casebook.sqlite3");
    let db = path_str(&db).to_string();

    seed_users(&db);
    let output = run_casebook([
        "--db",
        &db,
        "client",
        "add",
        "--actor",
        "stranger@example.org",
        "--first-name",
        "Ana",
        "--last-name",
        "Ng",
    ]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("forbidden"), "unexpected stderr: {stderr}");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn backfill_run_drives_the_chain_to_completion() {
    let dir = unique_temp_dir("casebook-cli-backfill");
    let db = dir.join("casebook.sqlite3");
    let db = path_str(&db).to_string();

    seed_users(&db);
    let client_id = add_client(&db);
    seed_legacy(&db, client_id, 25);

    let run = run_json([
        "--db",
        &db,
        "backfill",
        "run",
        "--actor",
        ADMIN,
        "--chunk-size",
        "10",
    ]);
    assert!(as_bool(&run, "scheduled"));
    assert_eq!(as_u64(&run, "invocations"), 4);
    assert_eq!(as_u64(&run, "total_processed"), 25);
    assert_eq!(as_u64(&run, "remaining_unmigrated"), 0);
    let chunks = run
        .get("chunks")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing chunks array in payload: {run}"));
    assert_eq!(
        chunks.iter().map(|chunk| as_u64(chunk, "processed")).collect::<Vec<_>>(),
        vec![10, 10, 5]
    );

    let progress = run_json(["--db", &db, "backfill", "progress"]);
    let summary = progress
        .get("summary")
        .unwrap_or_else(|| panic!("missing summary in payload: {progress}"));
    assert_eq!(as_u64(summary, "chunks"), 3);
    assert_eq!(as_u64(summary, "total_processed"), 25);
    assert_eq!(as_u64(summary, "last_chunk"), 5);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn backfill_run_on_an_empty_collection_schedules_nothing() {
    let dir = unique_temp_dir("casebook-cli-backfill-empty");
    let db = dir.join("casebook.sqlite3");
    let db = path_str(&db).to_string();

    seed_users(&db);
    let run = run_json(["--db", &db, "backfill", "run", "--actor", ADMIN]);
    assert!(!as_bool(&run, "scheduled"));
    assert_eq!(as_u64(&run, "invocations"), 0);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn rerunning_a_completed_backfill_is_idempotent() {
    let dir = unique_temp_dir("casebook-cli-backfill-rerun");
    let db = dir.join("casebook.sqlite3");
    let db = path_str(&db).to_string();

    seed_users(&db);
    let client_id = add_client(&db);
    seed_legacy(&db, client_id, 7);

    let first = run_json(["--db", &db, "backfill", "run", "--actor", ADMIN, "--chunk-size", "3"]);
    assert_eq!(as_u64(&first, "remaining_unmigrated"), 0);

    let second = run_json(["--db", &db, "backfill", "run", "--actor", ADMIN, "--chunk-size", "3"]);
    assert!(as_bool(&second, "scheduled"));
    assert_eq!(as_u64(&second, "remaining_unmigrated"), 0);

    let listed =
        run_json(["--db", &db, "visit", "list", "--actor", MEMBER, "--client-id", &client_id.to_string()]);
    let visits = listed
        .get("visits")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing visits array in payload: {listed}"));
    assert!(visits
        .iter()
        .all(|record| record.get("visit").and_then(|visit| visit.get("retired"))
            == Some(&Value::Bool(false))));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn backfill_run_requires_an_admin_actor() {
    let dir = unique_temp_dir("casebook-cli-backfill-admin");
    let db = dir.join("casebook.sqlite3");
    let db = path_str(&db).to_string();

    seed_users(&db);
    let output = run_casebook(["--db", &db, "backfill", "run", "--actor", MEMBER]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("forbidden"), "unexpected stderr: {stderr}");

    let _ = fs::remove_dir_all(&dir);
}
