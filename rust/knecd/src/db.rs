use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE: &str = "knec.sqlite3";

const LEVELS: [(&str, &str); 3] = [
    ("KEPSEA", "KEPSEA Grade 6 (CBC)"),
    ("KCPE", "KCPE Class 8 (8-4-4)"),
    ("KCSE", "KCSE Form 4"),
];

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace).with_context(|| {
        format!("failed to create workspace {}", workspace.to_string_lossy())
    })?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.to_string_lossy()))?;
    init_schema(&conn).context("failed to initialise workspace schema")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_years(
            id TEXT PRIMARY KEY,
            label TEXT NOT NULL UNIQUE,
            start_year INTEGER NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS education_levels(
            id TEXT PRIMARY KEY,
            description TEXT NOT NULL,
            max_score INTEGER NOT NULL DEFAULT 100,
            is_active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;
    for (code, description) in LEVELS {
        conn.execute(
            "INSERT OR IGNORE INTO education_levels(id, description) VALUES(?, ?)",
            (code, description),
        )?;
    }

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            level_id TEXT NOT NULL,
            is_compulsory INTEGER NOT NULL DEFAULT 1,
            is_active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(level_id) REFERENCES education_levels(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_level ON subjects(level_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schools(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            category TEXT NOT NULL,
            county TEXT NOT NULL,
            sub_county TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schools_county ON schools(county)",
        [],
    )?;

    // scope_key is the subject id, or '*' for the overall scheme, so the
    // uniqueness constraint also holds for overall schemes.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grading_schemes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            level_id TEXT NOT NULL,
            year_id TEXT NOT NULL,
            subject_id TEXT,
            scope_key TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            created_by TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(level_id) REFERENCES education_levels(id),
            FOREIGN KEY(year_id) REFERENCES academic_years(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(level_id, year_id, scope_key)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_ranges(
            id TEXT PRIMARY KEY,
            scheme_id TEXT NOT NULL,
            grade TEXT NOT NULL,
            min_score INTEGER NOT NULL,
            max_score INTEGER NOT NULL,
            points INTEGER NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            FOREIGN KEY(scheme_id) REFERENCES grading_schemes(id),
            UNIQUE(scheme_id, grade)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_ranges_scheme ON grade_ranges(scheme_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS birth_certificates(
            number TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            middle_name TEXT NOT NULL DEFAULT '',
            last_name TEXT NOT NULL,
            date_of_birth TEXT NOT NULL,
            place_of_birth TEXT NOT NULL,
            parent_name TEXT NOT NULL,
            is_verified INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS index_sequences(
            school_id TEXT NOT NULL,
            year_id TEXT NOT NULL,
            last_seq INTEGER NOT NULL,
            PRIMARY KEY(school_id, year_id),
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(year_id) REFERENCES academic_years(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS candidates(
            id TEXT PRIMARY KEY,
            index_number TEXT NOT NULL UNIQUE,
            school_id TEXT NOT NULL,
            level_id TEXT NOT NULL,
            year_id TEXT NOT NULL,
            first_name TEXT NOT NULL,
            middle_name TEXT NOT NULL DEFAULT '',
            last_name TEXT NOT NULL,
            gender TEXT NOT NULL,
            date_of_birth TEXT NOT NULL,
            certificate_number TEXT,
            is_cert_verified INTEGER NOT NULL DEFAULT 0,
            phone TEXT NOT NULL DEFAULT '',
            guardian_phone TEXT NOT NULL,
            registered_by TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(level_id) REFERENCES education_levels(id),
            FOREIGN KEY(year_id) REFERENCES academic_years(id),
            FOREIGN KEY(certificate_number) REFERENCES birth_certificates(number)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_candidates_cohort ON candidates(level_id, year_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_candidates_school ON candidates(school_id, year_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS certificate_links(
            certificate_number TEXT NOT NULL,
            level_id TEXT NOT NULL,
            candidate_id TEXT NOT NULL,
            linked_at TEXT NOT NULL,
            PRIMARY KEY(certificate_number, level_id),
            FOREIGN KEY(certificate_number) REFERENCES birth_certificates(number),
            FOREIGN KEY(level_id) REFERENCES education_levels(id),
            FOREIGN KEY(candidate_id) REFERENCES candidates(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS staff(
            actor TEXT PRIMARY KEY,
            full_name TEXT NOT NULL,
            role TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_by TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS marks_permissions(
            id TEXT PRIMARY KEY,
            actor TEXT NOT NULL,
            level_id TEXT NOT NULL,
            year_id TEXT NOT NULL,
            subject_codes_json TEXT NOT NULL DEFAULT '[]',
            school_codes_json TEXT NOT NULL DEFAULT '[]',
            valid_from TEXT NOT NULL,
            valid_until TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_by TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(level_id) REFERENCES education_levels(id),
            FOREIGN KEY(year_id) REFERENCES academic_years(id),
            UNIQUE(actor, level_id, year_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_results(
            id TEXT PRIMARY KEY,
            candidate_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            raw_score INTEGER NOT NULL,
            grade TEXT NOT NULL,
            points INTEGER NOT NULL,
            scheme_id TEXT NOT NULL,
            entered_by TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(candidate_id) REFERENCES candidates(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(scheme_id) REFERENCES grading_schemes(id),
            UNIQUE(candidate_id, subject_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_results_candidate ON exam_results(candidate_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS aggregate_results(
            candidate_id TEXT PRIMARY KEY,
            subject_count INTEGER NOT NULL,
            total_points INTEGER NOT NULL,
            mean_points INTEGER NOT NULL,
            mean_grade TEXT NOT NULL,
            scheme_id TEXT NOT NULL,
            position_school INTEGER,
            position_county INTEGER,
            position_nation INTEGER,
            ranks_stale INTEGER NOT NULL DEFAULT 1,
            is_released INTEGER NOT NULL DEFAULT 0,
            released_at TEXT,
            released_by TEXT,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(candidate_id) REFERENCES candidates(id),
            FOREIGN KEY(scheme_id) REFERENCES grading_schemes(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS payments(
            id TEXT PRIMARY KEY,
            candidate_id TEXT NOT NULL,
            phone TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            currency TEXT NOT NULL,
            merchant_request_id TEXT NOT NULL UNIQUE,
            checkout_request_id TEXT NOT NULL UNIQUE,
            receipt TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL,
            result_code INTEGER,
            result_desc TEXT NOT NULL DEFAULT '',
            paid_at TEXT,
            result_accessed INTEGER NOT NULL DEFAULT 0,
            accessed_at TEXT,
            access_ip TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(candidate_id) REFERENCES candidates(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_candidate ON payments(candidate_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS entitlements(
            candidate_id TEXT PRIMARY KEY,
            transaction_id TEXT NOT NULL,
            granted_at TEXT NOT NULL,
            FOREIGN KEY(candidate_id) REFERENCES candidates(id),
            FOREIGN KEY(transaction_id) REFERENCES payments(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS fraud_attempts(
            id TEXT PRIMARY KEY,
            attempt_type TEXT NOT NULL,
            actor TEXT,
            index_number TEXT NOT NULL DEFAULT '',
            certificate_number TEXT NOT NULL DEFAULT '',
            phone TEXT NOT NULL DEFAULT '',
            ip_address TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL,
            is_resolved INTEGER NOT NULL DEFAULT 0,
            resolved_by TEXT,
            resolution_notes TEXT NOT NULL DEFAULT '',
            resolved_at TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fraud_attempts_type ON fraud_attempts(attempt_type, created_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS activity_log(
            id TEXT PRIMARY KEY,
            actor TEXT,
            action TEXT NOT NULL,
            description TEXT NOT NULL,
            object_type TEXT NOT NULL DEFAULT '',
            object_id TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_activity_log_actor ON activity_log(actor, created_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS school_reports(
            school_id TEXT NOT NULL,
            level_id TEXT NOT NULL,
            year_id TEXT NOT NULL,
            total_candidates INTEGER NOT NULL,
            candidates_with_results INTEGER NOT NULL,
            distribution_json TEXT NOT NULL,
            mean_points REAL NOT NULL,
            top_grade TEXT NOT NULL DEFAULT '',
            rank_county INTEGER,
            rank_nation INTEGER,
            generated_at TEXT NOT NULL,
            generated_by TEXT,
            PRIMARY KEY(school_id, level_id, year_id),
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;

    Ok(())
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    // Unparseable historical values behave as unset.
    Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, value.to_string()),
    )?;
    Ok(())
}

#[cfg(test)]
pub fn open_in_memory() -> Connection {
    let conn = Connection::open_in_memory().expect("in-memory db");
    init_schema(&conn).expect("schema");
    conn
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_db_reports_the_failing_path() {
        let blocker = std::env::temp_dir().join(format!(
            "knecd-db-blocker-{}",
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::write(&blocker, b"not a directory").expect("write blocker");

        let e = open_db(&blocker).expect_err("a file is not a workspace");
        let msg = format!("{e:#}");
        assert!(msg.contains("failed to create workspace"), "{msg}");
        assert!(msg.contains(&*blocker.to_string_lossy()), "{msg}");

        let _ = std::fs::remove_file(&blocker);
    }

    #[test]
    fn reopening_a_workspace_keeps_seeded_levels() {
        let ws = std::env::temp_dir().join(format!("knecd-db-reopen-{}", uuid::Uuid::new_v4().simple()));
        drop(open_db(&ws).expect("first open"));
        let conn = open_db(&ws).expect("second open");
        let levels: i64 = conn
            .query_row("SELECT COUNT(*) FROM education_levels", [], |r| r.get(0))
            .expect("count");
        assert_eq!(levels, 3);
        drop(conn);
        let _ = std::fs::remove_dir_all(&ws);
    }
}
