use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

fn now_unix_string() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        .to_string()
}

/// Three-state optional string param: absent, explicit clear (null or
/// empty), or a trimmed value.
fn parse_optional_text(v: Option<&serde_json::Value>) -> Result<Option<Option<String>>, String> {
    let Some(v) = v else { return Ok(None) };
    if v.is_null() {
        return Ok(Some(None));
    }
    let Some(s) = v.as_str() else {
        return Err("must be string or null".to_string());
    };
    let t = s.trim();
    if t.is_empty() {
        return Ok(Some(None));
    }
    Ok(Some(Some(t.to_string())))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT id, name, email, roll_number, active
         FROM students
         WHERE active = 1
         ORDER BY name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let email: Option<String> = row.get(2)?;
            let roll_number: Option<String> = row.get(3)?;
            let active: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "email": email,
                "rollNumber": roll_number,
                "active": active != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let email = match parse_optional_text(req.params.get("email")) {
        Ok(v) => v.flatten().map(|s| s.to_lowercase()),
        Err(e) => return err(&req.id, "bad_params", format!("email {}", e), None),
    };
    let roll_number = match parse_optional_text(req.params.get("rollNumber")) {
        Ok(v) => v.flatten(),
        Err(e) => return err(&req.id, "bad_params", format!("rollNumber {}", e), None),
    };

    let student_id = Uuid::new_v4().to_string();
    let now = now_unix_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, name, email, roll_number, active, created_at, updated_at)
         VALUES(?, ?, ?, ?, 1, ?, ?)",
        (&student_id, &name, &email, &roll_number, &now, &now),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(
        &req.id,
        json!({
            "studentId": student_id,
            "name": name,
            "email": email,
            "rollNumber": roll_number,
            "active": true
        }),
    )
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    // Updates apply to inactive students too; that is how reactivation works.
    let existing = match conn
        .query_row(
            "SELECT name, email, roll_number, active FROM students WHERE id = ?",
            [&student_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, Option<String>>(1)?,
                    r.get::<_, Option<String>>(2)?,
                    r.get::<_, i64>(3)? != 0,
                ))
            },
        )
        .optional()
    {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let (mut name, mut email, mut roll_number, mut active) = existing;

    if let Some(v) = req.params.get("name") {
        let Some(s) = v.as_str() else {
            return err(&req.id, "bad_params", "name must be a string", None);
        };
        let t = s.trim();
        if t.is_empty() {
            return err(&req.id, "bad_params", "name must not be empty", None);
        }
        name = t.to_string();
    }
    match parse_optional_text(req.params.get("email")) {
        Ok(Some(v)) => email = v.map(|s| s.to_lowercase()),
        Ok(None) => {}
        Err(e) => return err(&req.id, "bad_params", format!("email {}", e), None),
    }
    match parse_optional_text(req.params.get("rollNumber")) {
        Ok(Some(v)) => roll_number = v,
        Ok(None) => {}
        Err(e) => return err(&req.id, "bad_params", format!("rollNumber {}", e), None),
    }
    if let Some(v) = req.params.get("active") {
        let Some(b) = v.as_bool() else {
            return err(&req.id, "bad_params", "active must be a boolean", None);
        };
        active = b;
    }

    let now = now_unix_string();
    if let Err(e) = conn.execute(
        "UPDATE students SET name = ?, email = ?, roll_number = ?, active = ?, updated_at = ?
         WHERE id = ?",
        (&name, &email, &roll_number, active as i64, &now, &student_id),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(
        &req.id,
        json!({
            "studentId": student_id,
            "name": name,
            "email": email,
            "rollNumber": roll_number,
            "active": active
        }),
    )
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    // Soft delete; historical attendance entries keep referencing the row.
    let now = now_unix_string();
    let changed = match conn.execute(
        "UPDATE students SET active = 0, updated_at = ? WHERE id = ?",
        (&now, &student_id),
    ) {
        Ok(n) => n,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "students" })),
            )
        }
    };
    if changed == 0 {
        return err(&req.id, "not_found", "student not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
