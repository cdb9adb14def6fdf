use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
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

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(resp: &serde_json::Value) -> Option<&str> {
    resp.get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
}

fn outbox_emails(workspace: &Path) -> Vec<serde_json::Value> {
    let outbox = workspace.join("outbox");
    if !outbox.is_dir() {
        return Vec::new();
    }
    let mut paths: Vec<PathBuf> = std::fs::read_dir(&outbox)
        .expect("read outbox")
        .map(|e| e.expect("outbox entry").path())
        .collect();
    paths.sort();
    paths
        .into_iter()
        .map(|p| {
            let text = std::fs::read_to_string(&p).expect("read outbox email");
            serde_json::from_str(&text).expect("parse outbox email")
        })
        .collect()
}

#[test]
fn register_login_and_profile_flow() {
    let workspace = temp_dir("rollcall-auth-register");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let registered = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "auth.register",
        json!({ "username": "priya", "email": "Priya@Example.com", "password": "hunter22" }),
    );
    let token = registered
        .get("token")
        .and_then(|v| v.as_str())
        .expect("token")
        .to_string();
    let user = registered.get("user").expect("user");
    assert_eq!(user.get("email").and_then(|v| v.as_str()), Some("priya@example.com"));
    assert_eq!(user.get("role").and_then(|v| v.as_str()), Some("teacher"));
    assert_eq!(user.get("authProvider").and_then(|v| v.as_str()), Some("local"));

    let profile = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "auth.profile",
        json!({ "token": token }),
    );
    assert_eq!(
        profile
            .get("user")
            .and_then(|u| u.get("username"))
            .and_then(|v| v.as_str()),
        Some("priya")
    );

    // Either half of the identity already taken is a conflict.
    let dup = request(
        &mut stdin,
        &mut reader,
        "4",
        "auth.register",
        json!({ "username": "priya2", "email": "priya@example.com", "password": "hunter22" }),
    );
    assert_eq!(error_code(&dup), Some("user_exists"));

    let wrong = request(
        &mut stdin,
        &mut reader,
        "5",
        "auth.login",
        json!({ "email": "priya@example.com", "password": "wrong-pass" }),
    );
    assert_eq!(error_code(&wrong), Some("invalid_credentials"));
    let unknown = request(
        &mut stdin,
        &mut reader,
        "6",
        "auth.login",
        json!({ "email": "nobody@example.com", "password": "hunter22" }),
    );
    assert_eq!(error_code(&unknown), Some("invalid_credentials"));

    let login = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "auth.login",
        json!({ "email": "priya@example.com", "password": "hunter22" }),
    );
    assert!(login.get("token").and_then(|v| v.as_str()).is_some());

    let bad_profile = request(
        &mut stdin,
        &mut reader,
        "8",
        "auth.profile",
        json!({ "token": "ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff" }),
    );
    assert_eq!(error_code(&bad_profile), Some("invalid_token"));
}

#[test]
fn google_sign_in_creates_then_links_accounts() {
    let workspace = temp_dir("rollcall-auth-google");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    // First sign-in creates the account with the teacher default role.
    let first = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "auth.google",
        json!({
            "email": "ravi@example.com",
            "name": "Ravi",
            "googleId": "google-sub-1",
            "picture": "https://example.com/ravi.png"
        }),
    );
    let user = first.get("user").expect("user");
    assert_eq!(user.get("authProvider").and_then(|v| v.as_str()), Some("google"));
    assert_eq!(user.get("role").and_then(|v| v.as_str()), Some("teacher"));

    // A password account with the same email gets linked, not duplicated.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "auth.register",
        json!({ "username": "meena", "email": "meena@example.com", "password": "hunter22" }),
    );
    let linked = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "auth.google",
        json!({ "email": "meena@example.com", "name": "Meena", "googleId": "google-sub-2" }),
    );
    assert_eq!(
        linked
            .get("user")
            .and_then(|u| u.get("username"))
            .and_then(|v| v.as_str()),
        Some("meena")
    );
    // The password still works after linking.
    let login = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "auth.login",
        json!({ "email": "meena@example.com", "password": "hunter22" }),
    );
    assert!(login.get("token").and_then(|v| v.as_str()).is_some());

    // Google-only accounts have no password to log in with.
    let no_pass = request(
        &mut stdin,
        &mut reader,
        "6",
        "auth.login",
        json!({ "email": "ravi@example.com", "password": "anything6" }),
    );
    assert_eq!(error_code(&no_pass), Some("invalid_credentials"));
}

#[test]
fn password_reset_goes_through_the_outbox() {
    let workspace = temp_dir("rollcall-auth-reset");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "auth.register",
        json!({ "username": "priya", "email": "priya@example.com", "password": "first-pass" }),
    );

    // Unknown address: same neutral answer, nothing composed.
    let neutral = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "auth.requestPasswordReset",
        json!({ "email": "nobody@example.com" }),
    );
    assert!(neutral.get("message").and_then(|v| v.as_str()).is_some());
    assert!(outbox_emails(&workspace).is_empty());

    let known = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "auth.requestPasswordReset",
        json!({ "email": "priya@example.com" }),
    );
    assert_eq!(known.get("message"), neutral.get("message"));

    let emails = outbox_emails(&workspace);
    assert_eq!(emails.len(), 1);
    assert_eq!(
        emails[0].get("to").and_then(|v| v.as_str()),
        Some("priya@example.com")
    );
    assert_eq!(
        emails[0].get("template").and_then(|v| v.as_str()),
        Some("password_reset")
    );
    let reset_token = emails[0]
        .get("resetToken")
        .and_then(|v| v.as_str())
        .expect("resetToken")
        .to_string();

    let garbage = request(
        &mut stdin,
        &mut reader,
        "5",
        "auth.resetPassword",
        json!({ "token": "not-a-real-token", "password": "second-pass" }),
    );
    assert_eq!(error_code(&garbage), Some("invalid_token"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "auth.resetPassword",
        json!({ "token": reset_token, "password": "second-pass" }),
    );

    // Old password dead, new one live, token single-use.
    let old = request(
        &mut stdin,
        &mut reader,
        "7",
        "auth.login",
        json!({ "email": "priya@example.com", "password": "first-pass" }),
    );
    assert_eq!(error_code(&old), Some("invalid_credentials"));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "auth.login",
        json!({ "email": "priya@example.com", "password": "second-pass" }),
    );
    let reused = request(
        &mut stdin,
        &mut reader,
        "9",
        "auth.resetPassword",
        json!({ "token": reset_token, "password": "third-pass" }),
    );
    assert_eq!(error_code(&reused), Some("invalid_token"));
}
