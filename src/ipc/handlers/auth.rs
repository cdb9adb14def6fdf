use crate::auth;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const NEUTRAL_RESET_MESSAGE: &str = "if that email exists, a password reset link has been sent";

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        HandlerErr {
            code,
            message: message.into(),
            details: None,
        }
    }

    fn db(e: impl std::fmt::Display) -> Self {
        HandlerErr::new("db_query_failed", e.to_string())
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

#[derive(Debug, Clone)]
struct UserRow {
    id: String,
    username: String,
    email: String,
    role: String,
    auth_provider: String,
    profile_picture: Option<String>,
}

fn user_json(user: &UserRow) -> serde_json::Value {
    json!({
        "id": user.id,
        "username": user.username,
        "email": user.email,
        "role": user.role,
        "authProvider": user.auth_provider,
        "profilePicture": user.profile_picture
    })
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

fn get_required_email(params: &serde_json::Value) -> Result<String, HandlerErr> {
    let email = get_required_str(params, "email")?.to_lowercase();
    if !email.contains('@') {
        return Err(HandlerErr::new("bad_params", "email is not valid"));
    }
    Ok(email)
}

fn get_required_password(params: &serde_json::Value) -> Result<String, HandlerErr> {
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing password"))?;
    if password.len() < 6 {
        return Err(HandlerErr::new(
            "bad_params",
            "password must be at least 6 characters",
        ));
    }
    Ok(password)
}

fn load_user(conn: &Connection, user_id: &str) -> Result<Option<UserRow>, HandlerErr> {
    conn.query_row(
        "SELECT id, username, email, role, auth_provider, profile_picture
         FROM users
         WHERE id = ?",
        [user_id],
        |r| {
            Ok(UserRow {
                id: r.get(0)?,
                username: r.get(1)?,
                email: r.get(2)?,
                role: r.get(3)?,
                auth_provider: r.get(4)?,
                profile_picture: r.get(5)?,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::db)
}

fn load_user_by_email(conn: &Connection, email: &str) -> Result<Option<UserRow>, HandlerErr> {
    conn.query_row(
        "SELECT id, username, email, role, auth_provider, profile_picture
         FROM users
         WHERE email = ?",
        [email],
        |r| {
            Ok(UserRow {
                id: r.get(0)?,
                username: r.get(1)?,
                email: r.get(2)?,
                role: r.get(3)?,
                auth_provider: r.get(4)?,
                profile_picture: r.get(5)?,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::db)
}

/// Mint a bearer token, persist its hash, return the raw token. The raw
/// token is only ever seen by the shell.
fn issue_session(conn: &Connection, user_id: &str) -> Result<String, HandlerErr> {
    let token = auth::mint_token();
    let expires_at = Utc::now().timestamp() + auth::SESSION_TTL_SECS;
    conn.execute(
        "INSERT INTO auth_sessions(token_hash, user_id, expires_at, created_at)
         VALUES(?, ?, ?, ?)",
        (
            auth::hash_token(&token),
            user_id,
            expires_at,
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    Ok(token)
}

fn resolve_session(conn: &Connection, token: &str) -> Result<UserRow, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT user_id, expires_at FROM auth_sessions WHERE token_hash = ?",
            [auth::hash_token(token)],
            |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let Some((user_id, expires_at)) = row else {
        return Err(HandlerErr::new("invalid_token", "invalid or expired token"));
    };
    if expires_at <= Utc::now().timestamp() {
        return Err(HandlerErr::new("invalid_token", "invalid or expired token"));
    }
    load_user(conn, &user_id)?
        .ok_or_else(|| HandlerErr::new("invalid_token", "invalid or expired token"))
}

/// The daemon never talks SMTP; composed mail lands in <workspace>/outbox
/// as JSON for the shell to deliver.
fn write_outbox_email(workspace: &Path, email: serde_json::Value) -> Result<PathBuf, HandlerErr> {
    let outbox = workspace.join("outbox");
    std::fs::create_dir_all(&outbox)
        .map_err(|e| HandlerErr::new("io_failed", e.to_string()))?;
    let file = outbox.join(format!(
        "{}-{}.json",
        Utc::now().timestamp_millis(),
        &Uuid::new_v4().to_string()[..8]
    ));
    let text = serde_json::to_string_pretty(&email)
        .map_err(|e| HandlerErr::new("io_failed", e.to_string()))?;
    std::fs::write(&file, text).map_err(|e| HandlerErr::new("io_failed", e.to_string()))?;
    Ok(file)
}

fn register(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let username = get_required_str(params, "username")?;
    let email = get_required_email(params)?;
    let password = get_required_password(params)?;
    let role = params
        .get("role")
        .and_then(|v| v.as_str())
        .unwrap_or("teacher")
        .to_string();

    let taken: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM users WHERE email = ? OR username = ?",
            (&email, &username),
            |r| r.get(0),
        )
        .map_err(HandlerErr::db)?;
    if taken > 0 {
        return Err(HandlerErr::new(
            "user_exists",
            "user with this email or username already exists",
        ));
    }

    let user_id = Uuid::new_v4().to_string();
    let record = auth::hash_password(&password);
    conn.execute(
        "INSERT INTO users(id, username, email, role, auth_provider,
                           password_salt, password_hash, password_iterations, created_at)
         VALUES(?, ?, ?, ?, 'local', ?, ?, ?, ?)",
        (
            &user_id,
            &username,
            &email,
            &role,
            &record.salt,
            &record.hash,
            record.iterations,
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;

    let token = issue_session(conn, &user_id)?;
    let user = load_user(conn, &user_id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "user vanished after insert"))?;
    Ok(json!({ "token": token, "user": user_json(&user) }))
}

fn login(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let email = get_required_email(params)?;
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing password"))?;

    // One error for every failure mode; do not reveal which part was wrong.
    let invalid = || HandlerErr::new("invalid_credentials", "invalid email or password");

    let row = conn
        .query_row(
            "SELECT id, password_salt, password_hash, password_iterations
             FROM users
             WHERE email = ?",
            [&email],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, Option<String>>(1)?,
                    r.get::<_, Option<String>>(2)?,
                    r.get::<_, Option<i64>>(3)?,
                ))
            },
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let Some((user_id, salt, hash, iterations)) = row else {
        return Err(invalid());
    };
    // Google-only accounts have no password material.
    let (Some(salt), Some(hash), Some(iterations)) = (salt, hash, iterations) else {
        return Err(invalid());
    };
    if !auth::verify_password(password, &salt, &hash, iterations as u32) {
        return Err(invalid());
    }

    let token = issue_session(conn, &user_id)?;
    let user = load_user(conn, &user_id)?.ok_or_else(invalid)?;
    Ok(json!({ "token": token, "user": user_json(&user) }))
}

/// The shell verifies the Google credential and hands over the profile;
/// the daemon links by email or creates the account.
fn google_sign_in(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let email = get_required_email(params)?;
    let name = get_required_str(params, "name")?;
    let google_id = get_required_str(params, "googleId")?;
    let picture = params
        .get("picture")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let user_id = match load_user_by_email(conn, &email)? {
        Some(user) => {
            conn.execute(
                "UPDATE users
                 SET google_id = COALESCE(google_id, ?),
                     auth_provider = CASE WHEN google_id IS NULL THEN 'google' ELSE auth_provider END,
                     profile_picture = COALESCE(profile_picture, ?)
                 WHERE id = ?",
                (&google_id, &picture, &user.id),
            )
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
            user.id
        }
        None => {
            let mut username = name.clone();
            let collisions: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM users WHERE username = ?",
                    [&username],
                    |r| r.get(0),
                )
                .map_err(HandlerErr::db)?;
            if collisions > 0 {
                username = format!("{}-{}", name, &Uuid::new_v4().to_string()[..8]);
            }
            let user_id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO users(id, username, email, role, auth_provider,
                                   google_id, profile_picture, created_at)
                 VALUES(?, ?, ?, 'teacher', 'google', ?, ?, ?)",
                (
                    &user_id,
                    &username,
                    &email,
                    &google_id,
                    &picture,
                    Utc::now().to_rfc3339(),
                ),
            )
            .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
            user_id
        }
    };

    let token = issue_session(conn, &user_id)?;
    let user = load_user(conn, &user_id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "user vanished after sign-in"))?;
    Ok(json!({ "token": token, "user": user_json(&user) }))
}

fn profile(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let token = get_required_str(params, "token")?;
    let user = resolve_session(conn, &token)?;
    Ok(json!({ "user": user_json(&user) }))
}

fn request_password_reset(
    conn: &Connection,
    workspace: &Path,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let email = get_required_email(params)?;

    // Answer the same whether or not the account exists.
    let Some(user) = load_user_by_email(conn, &email)? else {
        return Ok(json!({ "message": NEUTRAL_RESET_MESSAGE }));
    };

    let raw_token = auth::mint_token();
    let expires_at = Utc::now().timestamp() + auth::RESET_TOKEN_TTL_SECS;
    conn.execute(
        "UPDATE users SET reset_token_hash = ?, reset_token_expires = ? WHERE id = ?",
        (auth::hash_token(&raw_token), expires_at, &user.id),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    let reset_url = params
        .get("resetUrlBase")
        .and_then(|v| v.as_str())
        .map(|base| format!("{}/{}", base.trim_end_matches('/'), raw_token));
    write_outbox_email(
        workspace,
        json!({
            "to": user.email,
            "subject": "Password Reset Request",
            "template": "password_reset",
            "username": user.username,
            "resetToken": raw_token,
            "resetUrl": reset_url,
            "expiresAt": expires_at,
            "createdAt": Utc::now().to_rfc3339()
        }),
    )?;

    Ok(json!({ "message": NEUTRAL_RESET_MESSAGE }))
}

fn reset_password(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let token = get_required_str(params, "token")?;
    let password = get_required_password(params)?;

    let user_id = conn
        .query_row(
            "SELECT id FROM users WHERE reset_token_hash = ? AND reset_token_expires > ?",
            (auth::hash_token(&token), Utc::now().timestamp()),
            |r| r.get::<_, String>(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let Some(user_id) = user_id else {
        return Err(HandlerErr::new(
            "invalid_token",
            "password reset token is invalid or has expired",
        ));
    };

    let record = auth::hash_password(&password);
    conn.execute(
        "UPDATE users
         SET password_salt = ?, password_hash = ?, password_iterations = ?,
             reset_token_hash = NULL, reset_token_expires = NULL
         WHERE id = ?",
        (&record.salt, &record.hash, record.iterations, &user_id),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    Ok(json!({ "message": "password has been reset" }))
}

fn with_conn(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_request_password_reset(state: &mut AppState, req: &Request) -> serde_json::Value {
    let (Some(conn), Some(workspace)) = (state.db.as_ref(), state.workspace.as_ref()) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match request_password_reset(conn, workspace, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.register" => Some(with_conn(state, req, register)),
        "auth.login" => Some(with_conn(state, req, login)),
        "auth.google" => Some(with_conn(state, req, google_sign_in)),
        "auth.profile" => Some(with_conn(state, req, profile)),
        "auth.requestPasswordReset" => Some(handle_request_password_reset(state, req)),
        "auth.resetPassword" => Some(with_conn(state, req, reset_password)),
        _ => None,
    }
}
