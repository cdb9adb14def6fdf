use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{params_from_iter, Connection};
use serde_json::json;

struct HandlerErr {
    code: &'static str,
    message: String,
}

impl HandlerErr {
    fn db(e: impl std::fmt::Display) -> Self {
        HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
        }
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, None)
    }
}

#[derive(Debug, Clone)]
struct ScrubCounts {
    orphan_entries: i64,
    stale_days: i64,
    expired_sessions: i64,
    /// Dates that lose orphan entries but survive the day deletion; their
    /// denormalized counts need a recompute.
    recompute_dates: Vec<String>,
}

/// Entries whose student row is gone entirely. Soft-deleted students keep
/// their row, so their history is not an orphan.
const ORPHAN_ENTRIES_SQL: &str = "SELECT COUNT(*)
     FROM attendance_entries e
     LEFT JOIN students s ON s.id = e.student_id
     WHERE s.id IS NULL";

/// Day records where not a single entry references an active student.
const STALE_DAYS_SQL: &str = "SELECT COUNT(*)
     FROM attendance_days d
     WHERE NOT EXISTS (
         SELECT 1
         FROM attendance_entries e
         JOIN students s ON s.id = e.student_id
         WHERE e.date = d.date AND s.active = 1
     )";

/// Dates with an orphan entry that still keep at least one active-student
/// entry (stale days are deleted outright, not recomputed).
const RECOMPUTE_DATES_SQL: &str = "SELECT DISTINCT e.date
     FROM attendance_entries e
     LEFT JOIN students s ON s.id = e.student_id
     WHERE s.id IS NULL
       AND EXISTS (
           SELECT 1
           FROM attendance_entries live
           JOIN students ls ON ls.id = live.student_id
           WHERE live.date = e.date AND ls.active = 1
       )
     ORDER BY e.date";

fn count(conn: &Connection, sql: &str) -> Result<i64, HandlerErr> {
    conn.query_row(sql, [], |r| r.get(0)).map_err(HandlerErr::db)
}

fn count_expired_sessions(conn: &Connection) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT COUNT(*) FROM auth_sessions WHERE expires_at <= ?",
        [Utc::now().timestamp()],
        |r| r.get(0),
    )
    .map_err(HandlerErr::db)
}

fn recompute_dates(conn: &Connection) -> Result<Vec<String>, HandlerErr> {
    let mut stmt = conn.prepare(RECOMPUTE_DATES_SQL).map_err(HandlerErr::db)?;
    stmt.query_map([], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)
}

fn scrub_counts(conn: &Connection) -> Result<ScrubCounts, HandlerErr> {
    Ok(ScrubCounts {
        orphan_entries: count(conn, ORPHAN_ENTRIES_SQL)?,
        stale_days: count(conn, STALE_DAYS_SQL)?,
        expired_sessions: count_expired_sessions(conn)?,
        recompute_dates: recompute_dates(conn)?,
    })
}

fn counts_json(counts: &ScrubCounts) -> serde_json::Value {
    json!({
        "orphanEntries": counts.orphan_entries,
        "staleDays": counts.stale_days,
        "expiredSessions": counts.expired_sessions,
        "recomputedDays": counts.recompute_dates.len()
    })
}

fn scrub_apply(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    // The dates needing a recompute are captured before the deletes remove
    // the orphan entries that identify them.
    let counts = scrub_counts(conn)?;

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db)?;

    // Stale days are judged before orphan removal so a day whose entries
    // are all orphans still goes away with them.
    let run = |tx: &rusqlite::Transaction<'_>| -> Result<(), rusqlite::Error> {
        tx.execute(
            "DELETE FROM attendance_entries
             WHERE student_id NOT IN (SELECT id FROM students)",
            [],
        )?;
        tx.execute(
            "DELETE FROM attendance_entries
             WHERE date IN (
                 SELECT d.date FROM attendance_days d
                 WHERE NOT EXISTS (
                     SELECT 1
                     FROM attendance_entries e
                     JOIN students s ON s.id = e.student_id
                     WHERE e.date = d.date AND s.active = 1
                 )
             )",
            [],
        )?;
        tx.execute(
            "DELETE FROM attendance_days
             WHERE NOT EXISTS (
                 SELECT 1
                 FROM attendance_entries e
                 JOIN students s ON s.id = e.student_id
                 WHERE e.date = attendance_days.date AND s.active = 1
             )",
            [],
        )?;
        if !counts.recompute_dates.is_empty() {
            let placeholders = vec!["?"; counts.recompute_dates.len()].join(", ");
            tx.execute(
                &format!(
                    "UPDATE attendance_days SET
                         total_students = (SELECT COUNT(*) FROM attendance_entries e
                                           WHERE e.date = attendance_days.date),
                         present_fn = (SELECT COUNT(*) FROM attendance_entries e
                                       WHERE e.date = attendance_days.date AND e.fn_status = 'present'),
                         absent_fn = (SELECT COUNT(*) FROM attendance_entries e
                                      WHERE e.date = attendance_days.date AND e.fn_status = 'absent'),
                         present_an = (SELECT COUNT(*) FROM attendance_entries e
                                       WHERE e.date = attendance_days.date AND e.an_status = 'present'),
                         absent_an = (SELECT COUNT(*) FROM attendance_entries e
                                      WHERE e.date = attendance_days.date AND e.an_status = 'absent')
                     WHERE date IN ({placeholders})"
                ),
                params_from_iter(counts.recompute_dates.iter()),
            )?;
        }
        tx.execute(
            "DELETE FROM auth_sessions WHERE expires_at <= ?",
            [Utc::now().timestamp()],
        )?;
        Ok(())
    };

    if let Err(e) = run(&tx) {
        let _ = tx.rollback();
        return Err(HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
        });
    }
    tx.commit().map_err(HandlerErr::db)?;

    Ok(counts_json(&counts))
}

fn handle_scrub_preview(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match scrub_counts(conn) {
        Ok(counts) => ok(&req.id, counts_json(&counts)),
        Err(error) => error.response(&req.id),
    }
}

fn handle_scrub_apply(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match scrub_apply(conn) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "maintenance.scrubPreview" => Some(handle_scrub_preview(state, req)),
        "maintenance.scrubApply" => Some(handle_scrub_apply(state, req)),
        _ => None,
    }
}
