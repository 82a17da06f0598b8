use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;

pub const DB_FILE: &str = "schooldesk.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    // Several collector processes may share one workspace. WAL plus a busy
    // timeout makes concurrent writers queue on the write lock instead of
    // failing with SQLITE_BUSY. journal_mode echoes the new mode as a row,
    // so it goes through query_row rather than execute.
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |r| r.get(0))?;
    conn.busy_timeout(Duration::from_millis(5000))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            student_no TEXT,
            active INTEGER NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;

    // Existing workspaces may predate the student_no column. Add if needed.
    ensure_students_student_no(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS fee_structures(
            class_id TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            amount TEXT NOT NULL,
            PRIMARY KEY(class_id, academic_year),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;

    // Amounts are canonical decimal TEXT. balance and status are caches
    // recomputed inside the same transaction as every mutation; the sum of
    // live fee_transactions rows is the source of truth for total_paid.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS fee_accounts(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            total_fee TEXT NOT NULL,
            total_paid TEXT NOT NULL,
            balance TEXT NOT NULL,
            status TEXT NOT NULL,
            updated_at TEXT,
            UNIQUE(student_id, academic_year),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    ensure_fee_accounts_updated_at(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fee_accounts_student ON fee_accounts(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fee_accounts_year ON fee_accounts(academic_year)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS fee_transactions(
            id TEXT PRIMARY KEY,
            receipt_no TEXT NOT NULL UNIQUE,
            account_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            amount_paid TEXT NOT NULL,
            payment_mode TEXT NOT NULL,
            payment_for TEXT,
            paid_months TEXT,
            remarks TEXT,
            transaction_date TEXT NOT NULL,
            FOREIGN KEY(account_id) REFERENCES fee_accounts(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fee_transactions_account ON fee_transactions(account_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fee_transactions_student ON fee_transactions(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fee_transactions_year ON fee_transactions(academic_year)",
        [],
    )?;

    // Per-year receipt counters. Never decremented: deleting a payment must
    // not recycle its receipt number.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS receipt_sequences(
            academic_year TEXT PRIMARY KEY,
            last_seq INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_log(
            id TEXT PRIMARY KEY,
            at TEXT NOT NULL,
            action TEXT NOT NULL,
            entity TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            details TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_log_entity ON audit_log(entity, entity_id)",
        [],
    )?;

    Ok(conn)
}

fn ensure_students_student_no(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "student_no")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN student_no TEXT", [])?;
    Ok(())
}

fn ensure_fee_accounts_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "fee_accounts", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE fee_accounts ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, value.to_string()),
    )?;
    Ok(())
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
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
