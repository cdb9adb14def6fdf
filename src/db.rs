use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("rollcall.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT,
            roll_number TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_active_name ON students(active, name)",
        [],
    )?;

    // Existing workspaces may predate the roll-number column. Add if needed.
    ensure_students_roll_number(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_days(
            date TEXT PRIMARY KEY,
            total_students INTEGER NOT NULL DEFAULT 0,
            present_fn INTEGER NOT NULL DEFAULT 0,
            absent_fn INTEGER NOT NULL DEFAULT 0,
            present_an INTEGER NOT NULL DEFAULT 0,
            absent_an INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_entries(
            date TEXT NOT NULL,
            student_id TEXT NOT NULL,
            fn_status TEXT NOT NULL DEFAULT 'unmarked',
            an_status TEXT NOT NULL DEFAULT 'unmarked',
            PRIMARY KEY(date, student_id),
            FOREIGN KEY(date) REFERENCES attendance_days(date),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_entries_student ON attendance_entries(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL UNIQUE,
            role TEXT NOT NULL DEFAULT 'teacher',
            auth_provider TEXT NOT NULL DEFAULT 'local',
            google_id TEXT,
            profile_picture TEXT,
            password_salt TEXT,
            password_hash TEXT,
            password_iterations INTEGER,
            reset_token_hash TEXT,
            reset_token_expires INTEGER,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_google ON users(google_id)",
        [],
    )?;

    // Workspaces created before Google sign-in lack the provider columns.
    ensure_users_provider_columns(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS auth_sessions(
            token_hash TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            expires_at INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_auth_sessions_user ON auth_sessions(user_id)",
        [],
    )?;

    Ok(conn)
}

fn ensure_students_roll_number(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "roll_number")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN roll_number TEXT", [])?;
    Ok(())
}

fn ensure_users_provider_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "users", "auth_provider")? {
        conn.execute(
            "ALTER TABLE users ADD COLUMN auth_provider TEXT NOT NULL DEFAULT 'local'",
            [],
        )?;
    }
    if !table_has_column(conn, "users", "google_id")? {
        conn.execute("ALTER TABLE users ADD COLUMN google_id TEXT", [])?;
    }
    if !table_has_column(conn, "users", "profile_picture")? {
        conn.execute("ALTER TABLE users ADD COLUMN profile_picture TEXT", [])?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
