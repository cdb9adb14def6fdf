use crate::day::{self, DaySession, NewEntry, Session, SessionStatus, StoredDay, StoredEntry};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

#[derive(Debug, Clone, Copy)]
struct DayCounts {
    total: i64,
    present_fn: i64,
    absent_fn: i64,
    present_an: i64,
    absent_an: i64,
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn get_required_date(params: &serde_json::Value) -> Result<String, HandlerErr> {
    let date = get_required_str(params, "date")?;
    if date.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "date must not be empty".to_string(),
            details: None,
        });
    }
    Ok(date)
}

fn parse_session(params: &serde_json::Value) -> Result<Session, HandlerErr> {
    let raw = get_required_str(params, "session")?;
    Session::parse(&raw).ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: "session must be FN or AN".to_string(),
        details: None,
    })
}

fn parse_status(params: &serde_json::Value) -> Result<SessionStatus, HandlerErr> {
    let raw = get_required_str(params, "status")?;
    SessionStatus::parse(&raw).ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: "status must be present, absent or unmarked".to_string(),
        details: None,
    })
}

fn now_unix_string() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        .to_string()
}

fn load_active_students(conn: &Connection) -> Result<Vec<day::Student>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, email, roll_number, active
             FROM students
             WHERE active = 1
             ORDER BY name",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    stmt.query_map([], |r| {
        Ok(day::Student {
            id: r.get(0)?,
            name: r.get(1)?,
            email: r.get(2)?,
            roll_number: r.get(3)?,
            active: r.get::<_, i64>(4)? != 0,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn load_day(conn: &Connection, date: &str) -> Result<Option<StoredDay>, HandlerErr> {
    let header = conn
        .query_row(
            "SELECT total_students, present_fn, absent_fn, present_an, absent_an
             FROM attendance_days
             WHERE date = ?",
            [date],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, i64>(3)?,
                    r.get::<_, i64>(4)?,
                ))
            },
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let Some((total_students, present_fn, absent_fn, present_an, absent_an)) = header else {
        return Ok(None);
    };

    // The join only fills names for active students, so read paths that
    // filter on the name drop deactivated references along with missing ones.
    let mut stmt = conn
        .prepare(
            "SELECT e.student_id, s.name, e.fn_status, e.an_status
             FROM attendance_entries e
             LEFT JOIN students s ON s.id = e.student_id AND s.active = 1
             WHERE e.date = ?
             ORDER BY e.rowid",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let entries = stmt
        .query_map([date], |r| {
            let student_id: String = r.get(0)?;
            let name: Option<String> = r.get(1)?;
            let fn_raw: String = r.get(2)?;
            let an_raw: String = r.get(3)?;
            Ok(StoredEntry {
                student_id,
                name,
                fn_status: SessionStatus::parse(&fn_raw).unwrap_or(SessionStatus::Unmarked),
                an_status: SessionStatus::parse(&an_raw).unwrap_or(SessionStatus::Unmarked),
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(Some(StoredDay {
        date: date.to_string(),
        entries,
        total_students,
        present_fn,
        absent_fn,
        present_an,
        absent_an,
    }))
}

/// Every entry must name an active roster student; the reconciler filters a
/// stale view, this guards the store itself.
fn validate_entries_against_roster(
    conn: &Connection,
    entries: &[NewEntry],
) -> Result<(), HandlerErr> {
    if entries.is_empty() {
        return Ok(());
    }
    let placeholders = entries.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!(
        "SELECT id FROM students WHERE active = 1 AND id IN ({})",
        placeholders
    );
    let mut stmt = conn.prepare(&sql).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    let found = stmt
        .query_map(
            params_from_iter(entries.iter().map(|e| e.student_id.clone())),
            |r| r.get::<_, String>(0),
        )
        .and_then(|it| it.collect::<Result<HashSet<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let missing: Vec<String> = entries
        .iter()
        .filter(|e| !found.contains(&e.student_id))
        .map(|e| e.student_id.clone())
        .collect();
    if !missing.is_empty() {
        return Err(HandlerErr {
            code: "validation_failed",
            message: "some students not found".to_string(),
            details: Some(json!({ "studentIds": missing })),
        });
    }
    Ok(())
}

/// Wholesale replace of one day's entries plus a count recompute, in a
/// single transaction. The record row is created on first save.
fn upsert_day(conn: &Connection, date: &str, entries: &[NewEntry]) -> Result<DayCounts, HandlerErr> {
    validate_entries_against_roster(conn, entries)?;

    let counts = DayCounts {
        total: entries.len() as i64,
        present_fn: entries
            .iter()
            .filter(|e| e.fn_status == SessionStatus::Present)
            .count() as i64,
        absent_fn: entries
            .iter()
            .filter(|e| e.fn_status == SessionStatus::Absent)
            .count() as i64,
        present_an: entries
            .iter()
            .filter(|e| e.an_status == SessionStatus::Present)
            .count() as i64,
        absent_an: entries
            .iter()
            .filter(|e| e.an_status == SessionStatus::Absent)
            .count() as i64,
    };

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    let now = now_unix_string();
    if let Err(e) = tx.execute(
        "INSERT INTO attendance_days(date, total_students, present_fn, absent_fn, present_an, absent_an, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(date) DO UPDATE SET
           total_students = excluded.total_students,
           present_fn = excluded.present_fn,
           absent_fn = excluded.absent_fn,
           present_an = excluded.present_an,
           absent_an = excluded.absent_an,
           updated_at = excluded.updated_at",
        (
            date,
            counts.total,
            counts.present_fn,
            counts.absent_fn,
            counts.present_an,
            counts.absent_an,
            &now,
        ),
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "attendance_days" })),
        });
    }

    if let Err(e) = tx.execute("DELETE FROM attendance_entries WHERE date = ?", [date]) {
        let _ = tx.rollback();
        return Err(HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "attendance_entries" })),
        });
    }

    for entry in entries {
        if let Err(e) = tx.execute(
            "INSERT INTO attendance_entries(date, student_id, fn_status, an_status)
             VALUES(?, ?, ?, ?)",
            (
                date,
                &entry.student_id,
                entry.fn_status.as_str(),
                entry.an_status.as_str(),
            ),
        ) {
            let _ = tx.rollback();
            return Err(HandlerErr {
                code: "db_insert_failed",
                message: e.to_string(),
                details: Some(json!({ "table": "attendance_entries" })),
            });
        }
    }

    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(counts)
}

fn stored_students_json(stored: &StoredDay) -> Vec<serde_json::Value> {
    // Entries whose student vanished or was deactivated drop at read time.
    stored
        .entries
        .iter()
        .filter(|e| e.name.is_some())
        .map(|e| {
            json!({
                "id": e.student_id,
                "name": e.name,
                "fnStatus": e.fn_status.as_str(),
                "anStatus": e.an_status.as_str()
            })
        })
        .collect()
}

fn attendance_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT d.date, e.student_id, s.name, e.fn_status, e.an_status
             FROM attendance_days d
             LEFT JOIN attendance_entries e ON e.date = d.date
             LEFT JOIN students s ON s.id = e.student_id AND s.active = 1
             ORDER BY d.date DESC, e.rowid",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, Option<String>>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, Option<String>>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    let mut days = serde_json::Map::new();
    for (date, student_id, name, fn_raw, an_raw) in rows {
        let day_entry = days.entry(date.clone()).or_insert_with(|| {
            json!({
                "date": date,
                "students": []
            })
        });
        let Some(student_id) = student_id else {
            // Day row with no entries.
            continue;
        };
        let Some(name) = name else {
            // Student row is gone or deactivated; skip the entry.
            continue;
        };
        if let Some(students) = day_entry
            .get_mut("students")
            .and_then(|v| v.as_array_mut())
        {
            let fn_status = fn_raw
                .as_deref()
                .and_then(SessionStatus::parse)
                .unwrap_or(SessionStatus::Unmarked);
            let an_status = an_raw
                .as_deref()
                .and_then(SessionStatus::parse)
                .unwrap_or(SessionStatus::Unmarked);
            students.push(json!({
                "id": student_id,
                "name": name,
                "fnStatus": fn_status.as_str(),
                "anStatus": an_status.as_str()
            }));
        }
    }

    Ok(json!({ "days": days }))
}

fn attendance_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let date = get_required_date(params)?;

    // A date never saved is a valid state, not an error; the reconciler
    // turns it into an all-unmarked view on dayOpen.
    let Some(stored) = load_day(conn, &date)? else {
        return Ok(json!({ "date": date, "record": serde_json::Value::Null }));
    };
    Ok(json!({
        "date": stored.date,
        "record": { "students": stored_students_json(&stored) }
    }))
}

fn attendance_record_stats(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let date = get_required_date(params)?;

    let header = conn
        .query_row(
            "SELECT total_students, present_fn, absent_fn, present_an, absent_an
             FROM attendance_days
             WHERE date = ?",
            [&date],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, i64>(3)?,
                    r.get::<_, i64>(4)?,
                ))
            },
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    if let Some((total, present_fn, absent_fn, present_an, absent_an)) = header {
        return Ok(json!({
            "total": total,
            "presentFN": present_fn,
            "absentFN": absent_fn,
            "presentAN": present_an,
            "absentAN": absent_an
        }));
    }

    let total: i64 = conn
        .query_row("SELECT COUNT(*) FROM students WHERE active = 1", [], |r| {
            r.get(0)
        })
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    Ok(json!({
        "total": total,
        "presentFN": 0,
        "absentFN": 0,
        "presentAN": 0,
        "absentAN": 0
    }))
}

fn day_state_json(day: &DaySession) -> serde_json::Value {
    json!({
        "date": day.date(),
        "session": day.active_session().as_str(),
        "dirty": day.is_dirty(),
        "students": day.view().students,
        "marks": day.marks(),
        "stats": {
            "fn": day.stats(Session::Forenoon),
            "an": day.stats(Session::Afternoon)
        }
    })
}

fn day_err(req: &Request, e: day::DayError) -> serde_json::Value {
    err(&req.id, &e.code, e.message, e.details)
}

fn handle_attendance_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_list(conn) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_attendance_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_get(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_attendance_record_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_record_stats(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_day_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let date = match get_required_date(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let roster = match load_active_students(conn) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let stored = match load_day(conn, &date) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let view = match day::reconcile(&date, &roster, stored.as_ref()) {
        Ok(v) => v,
        Err(e) => return day_err(req, e),
    };

    // Opening a date replaces whatever day was open; unsaved edits go with it.
    let session = DaySession::open(view);
    let body = day_state_json(&session);
    state.day = Some(session);
    ok(&req.id, body)
}

fn handle_day_state(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(day) = state.day.as_ref() else {
        return err(&req.id, "no_open_day", "open a day first", None);
    };
    ok(&req.id, day_state_json(day))
}

fn handle_set_session(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match parse_session(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(day) = state.day.as_mut() else {
        return err(&req.id, "no_open_day", "open a day first", None);
    };
    day.set_session(session);
    ok(&req.id, day_state_json(day))
}

fn handle_begin_edit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let student_id = match get_required_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let session = match parse_session(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(day) = state.day.as_mut() else {
        return err(&req.id, "no_open_day", "open a day first", None);
    };
    if let Err(e) = day.begin_edit(&student_id, session) {
        return day_err(req, e);
    }
    ok(&req.id, day_state_json(day))
}

fn handle_commit_edit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let student_id = match get_required_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let session = match parse_session(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let status = match parse_status(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(day) = state.day.as_mut() else {
        return err(&req.id, "no_open_day", "open a day first", None);
    };
    if let Err(e) = day.commit_edit(&student_id, session, status) {
        return day_err(req, e);
    }
    ok(&req.id, day_state_json(day))
}

fn handle_day_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match parse_session(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(day) = state.day.as_ref() else {
        return err(&req.id, "no_open_day", "open a day first", None);
    };
    let stats = day.stats(session);
    ok(
        &req.id,
        json!({
            "session": session.as_str(),
            "total": stats.total,
            "present": stats.present,
            "absent": stats.absent
        }),
    )
}

fn handle_save_day(state: &mut AppState, req: &Request) -> serde_json::Value {
    let (date, snapshot) = match state.day.as_ref() {
        Some(d) => (d.date().to_string(), d.snapshot()),
        None => return err(&req.id, "no_open_day", "open a day first", None),
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    // On failure the session stays dirty with its marks; the shell retries.
    let counts = match upsert_day(conn, &date, &snapshot) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    if let Some(day) = state.day.as_mut() {
        day.mark_saved();
    }

    ok(
        &req.id,
        json!({
            "date": date,
            "saved": true,
            "stats": {
                "total": counts.total,
                "presentFN": counts.present_fn,
                "absentFN": counts.absent_fn,
                "presentAN": counts.present_an,
                "absentAN": counts.absent_an
            }
        }),
    )
}

fn handle_day_close(state: &mut AppState, req: &Request) -> serde_json::Value {
    state.day = None;
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.list" => Some(handle_attendance_list(state, req)),
        "attendance.get" => Some(handle_attendance_get(state, req)),
        "attendance.recordStats" => Some(handle_attendance_record_stats(state, req)),
        "attendance.dayOpen" => Some(handle_day_open(state, req)),
        "attendance.dayState" => Some(handle_day_state(state, req)),
        "attendance.setSession" => Some(handle_set_session(state, req)),
        "attendance.beginEdit" => Some(handle_begin_edit(state, req)),
        "attendance.commitEdit" => Some(handle_commit_edit(state, req)),
        "attendance.stats" => Some(handle_day_stats(state, req)),
        "attendance.saveDay" => Some(handle_save_day(state, req)),
        "attendance.dayClose" => Some(handle_day_close(state, req)),
        _ => None,
    }
}
