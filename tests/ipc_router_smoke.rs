use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_rollcalld");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn rollcalld");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn error_code(resp: &serde_json::Value) -> Option<&str> {
    resp.get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("rollcall-router-smoke");
    let bundle_out = workspace.join("smoke-backup.rollcall.zip");

    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let health = request(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health.get("ok").and_then(|v| v.as_bool()), Some(true));

    // Store methods refuse to run before a workspace is selected.
    let early = request(&mut stdin, &mut reader, "2", "attendance.dayOpen", json!({ "date": "2024-03-01" }));
    assert_eq!(error_code(&early), Some("no_workspace"));
    let early_roster = request(&mut stdin, &mut reader, "2b", "students.list", json!({}));
    assert_eq!(error_code(&early_roster), Some("no_workspace"));

    let _ = request(
        &mut stdin,
        &mut reader,
        "3",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let created = request(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "name": "Smoke Student" }),
    );
    assert_eq!(created.get("ok").and_then(|v| v.as_bool()), Some(true));
    let _ = request(&mut stdin, &mut reader, "5", "students.list", json!({}));

    let opened = request(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.dayOpen",
        json!({ "date": "2024-03-01" }),
    );
    assert_eq!(opened.get("ok").and_then(|v| v.as_bool()), Some(true));
    let _ = request(&mut stdin, &mut reader, "7", "attendance.dayState", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "8",
        "attendance.stats",
        json!({ "session": "FN" }),
    );
    let saved = request(&mut stdin, &mut reader, "9", "attendance.saveDay", json!({}));
    assert_eq!(saved.get("ok").and_then(|v| v.as_bool()), Some(true));
    let _ = request(&mut stdin, &mut reader, "10", "attendance.list", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "11",
        "attendance.get",
        json!({ "date": "2024-03-01" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "12",
        "attendance.recordStats",
        json!({ "date": "2024-03-01" }),
    );
    let _ = request(&mut stdin, &mut reader, "13", "attendance.dayClose", json!({}));

    let registered = request(
        &mut stdin,
        &mut reader,
        "14",
        "auth.register",
        json!({ "username": "smoke", "email": "smoke@example.com", "password": "hunter22" }),
    );
    assert_eq!(registered.get("ok").and_then(|v| v.as_bool()), Some(true));
    let token = registered
        .get("result")
        .and_then(|r| r.get("token"))
        .and_then(|v| v.as_str())
        .expect("token")
        .to_string();
    let _ = request(
        &mut stdin,
        &mut reader,
        "15",
        "auth.profile",
        json!({ "token": token }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "16",
        "maintenance.scrubPreview",
        json!({}),
    );

    let exported = request(
        &mut stdin,
        &mut reader,
        "17",
        "backup.exportWorkspaceBundle",
        json!({ "outPath": bundle_out.to_string_lossy() }),
    );
    assert_eq!(exported.get("ok").and_then(|v| v.as_bool()), Some(true));
    let imported = request(
        &mut stdin,
        &mut reader,
        "18",
        "backup.importWorkspaceBundle",
        json!({ "inPath": bundle_out.to_string_lossy() }),
    );
    assert_eq!(imported.get("ok").and_then(|v| v.as_bool()), Some(true));

    let unknown = request(&mut stdin, &mut reader, "19", "planner.list", json!({}));
    assert_eq!(error_code(&unknown), Some("not_implemented"));
}

#[test]
fn malformed_request_lines_get_a_bad_json_error() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    writeln!(stdin, "this is not json").expect("write garbage");
    stdin.flush().expect("flush");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(error_code(&value), Some("bad_json"));

    // The loop keeps serving after a bad line.
    let health = request(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health.get("ok").and_then(|v| v.as_bool()), Some(true));
}
