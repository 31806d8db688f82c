use crate::aggregate::{self, AggregateRecord};
use crate::audit::{self, Activity, FraudKind, FraudReport};
use crate::config::SystemConfig;
use crate::db::now_rfc3339;
use crate::error::{ExamError, ExamResult};
use crate::grading;
use crate::registry::{self, Candidate, ExamLevel};
use crate::schemes;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use rusqlite::{Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

pub const BULK_MAX_ENTRIES: usize = 5000;

// ---------------------------------------------------------------------------
// Permissions

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPermission {
    pub actor: String,
    pub level: String,
    pub year: String,
    #[serde(default)]
    pub subject_codes: Vec<String>,
    #[serde(default)]
    pub school_codes: Vec<String>,
    #[serde(default)]
    pub valid_from: Option<String>,
    #[serde(default)]
    pub valid_until: Option<String>,
}

/// Empty subject or school lists mean "all".
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub id: String,
    pub actor: String,
    pub level: String,
    pub year: String,
    pub subject_codes: Vec<String>,
    pub school_codes: Vec<String>,
    pub valid_from: String,
    pub valid_until: String,
    pub is_active: bool,
}

impl Permission {
    fn covers(&self, subject_code: &str, school_code: &str, now: DateTime<Utc>) -> bool {
        let in_window = match (parse_instant(&self.valid_from), parse_instant(&self.valid_until)) {
            (Some(from), Some(until)) => from <= now && now <= until,
            _ => false,
        };
        self.is_active
            && in_window
            && (self.subject_codes.is_empty() || self.subject_codes.iter().any(|s| s == subject_code))
            && (self.school_codes.is_empty() || self.school_codes.iter().any(|s| s == school_code))
    }
}

fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn parse_instant_field(field: &str, raw: &str) -> ExamResult<DateTime<Utc>> {
    parse_instant(raw).ok_or_else(|| {
        ExamError::validation_with(
            format!("{field} must be an RFC 3339 timestamp"),
            json!({ field: raw }),
        )
    })
}

pub fn grant_permission(
    conn: &Connection,
    cfg: &SystemConfig,
    new: &NewPermission,
    granted_by: Option<&str>,
) -> ExamResult<Permission> {
    let actor = new.actor.trim();
    if actor.is_empty() {
        return Err(ExamError::validation("actor must not be empty"));
    }
    let level = ExamLevel::parse(&new.level)?;
    let year = registry::resolve_year(conn, &new.year)?;

    let mut subject_codes = Vec::with_capacity(new.subject_codes.len());
    for code in &new.subject_codes {
        let s = registry::resolve_subject(conn, code)?;
        if s.level != level.as_str() {
            return Err(ExamError::validation_with(
                "subject belongs to a different education level",
                json!({ "subjectCode": s.code }),
            ));
        }
        subject_codes.push(s.code);
    }
    let mut school_codes = Vec::with_capacity(new.school_codes.len());
    for code in &new.school_codes {
        school_codes.push(registry::resolve_school(conn, code)?.code);
    }

    let from = match &new.valid_from {
        Some(raw) => parse_instant_field("validFrom", raw)?,
        None => Utc::now(),
    };
    let until = match &new.valid_until {
        Some(raw) => parse_instant_field("validUntil", raw)?,
        None => from + Duration::days(cfg.default_validity_days),
    };
    if until <= from {
        return Err(ExamError::validation("validUntil must be after validFrom"));
    }
    let valid_from = from.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let valid_until = until.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO marks_permissions(
            id, actor, level_id, year_id, subject_codes_json, school_codes_json,
            valid_from, valid_until, is_active, created_by, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
         ON CONFLICT(actor, level_id, year_id) DO UPDATE SET
            subject_codes_json = excluded.subject_codes_json,
            school_codes_json = excluded.school_codes_json,
            valid_from = excluded.valid_from,
            valid_until = excluded.valid_until,
            is_active = 1,
            created_by = excluded.created_by",
        (
            &id,
            actor,
            level.as_str(),
            &year.id,
            serde_json::to_string(&subject_codes)?,
            serde_json::to_string(&school_codes)?,
            &valid_from,
            &valid_until,
            granted_by,
            now_rfc3339(),
        ),
    )?;
    tracing::info!(actor, level = level.as_str(), year = %year.label, "marks entry permission granted");

    find_permission(conn, actor, level.as_str(), &year.id)?
        .ok_or_else(|| ExamError::Database("permission vanished after insert".into()))
}

pub fn revoke_permission(conn: &Connection, actor: &str, level: ExamLevel, year: &str) -> ExamResult<()> {
    let year = registry::resolve_year(conn, year)?;
    let n = conn.execute(
        "UPDATE marks_permissions SET is_active = 0
         WHERE actor = ? AND level_id = ? AND year_id = ? AND is_active = 1",
        (actor.trim(), level.as_str(), &year.id),
    )?;
    if n == 0 {
        return Err(ExamError::not_found(
            "marks entry permission",
            format!("{} {} {}", actor.trim(), level.as_str(), year.label),
        ));
    }
    tracing::info!(actor, level = level.as_str(), year = %year.label, "marks entry permission revoked");
    Ok(())
}

const PERMISSION_SELECT: &str = "SELECT p.id, p.actor, p.level_id, y.label, p.subject_codes_json,
    p.school_codes_json, p.valid_from, p.valid_until, p.is_active
  FROM marks_permissions p
  JOIN academic_years y ON y.id = p.year_id";

fn permission_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Permission> {
    let subjects: String = r.get(4)?;
    let schools: String = r.get(5)?;
    Ok(Permission {
        id: r.get(0)?,
        actor: r.get(1)?,
        level: r.get(2)?,
        year: r.get(3)?,
        subject_codes: serde_json::from_str(&subjects).unwrap_or_default(),
        school_codes: serde_json::from_str(&schools).unwrap_or_default(),
        valid_from: r.get(6)?,
        valid_until: r.get(7)?,
        is_active: r.get::<_, i64>(8)? != 0,
    })
}

fn find_permission(
    conn: &Connection,
    actor: &str,
    level: &str,
    year_id: &str,
) -> ExamResult<Option<Permission>> {
    let p = conn
        .query_row(
            &format!("{PERMISSION_SELECT} WHERE p.actor = ? AND p.level_id = ? AND p.year_id = ?"),
            (actor, level, year_id),
            permission_from_row,
        )
        .optional()?;
    Ok(p)
}

pub fn list_permissions(conn: &Connection, actor: Option<&str>) -> ExamResult<Vec<Permission>> {
    let mut sql = format!("{PERMISSION_SELECT} WHERE 1 = 1");
    let mut binds: Vec<Value> = Vec::new();
    if let Some(a) = actor {
        sql.push_str(" AND p.actor = ?");
        binds.push(Value::Text(a.trim().to_string()));
    }
    sql.push_str(" ORDER BY p.actor, y.label DESC, p.level_id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), permission_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Refuse and record an entry attempt not covered by an active permission.
fn authorize_entry(
    conn: &Connection,
    actor: Option<&str>,
    candidate: &Candidate,
    subject_code: &str,
) -> ExamResult<()> {
    let covered = match actor {
        Some(a) => find_permission(conn, a, &candidate.level, &candidate.year_id)?
            .map(|p| p.covers(subject_code, &candidate.school_code, Utc::now()))
            .unwrap_or(false),
        None => false,
    };
    if covered {
        return Ok(());
    }
    let report = FraudReport::new(
        FraudKind::MarksTampering,
        format!(
            "marks entry for {} {} without a valid permission",
            candidate.index_number, subject_code
        ),
    )
    .actor(actor)
    .index_number(&candidate.index_number);
    audit::record_fraud(conn, &report)?;
    Err(ExamError::Forbidden(format!(
        "{} may not enter {} marks for {}",
        actor.unwrap_or("anonymous caller"),
        subject_code,
        candidate.school_code
    )))
}

fn check_entry_window(cfg: &SystemConfig) -> ExamResult<()> {
    if !cfg.marks_entry_enabled {
        return Err(ExamError::Forbidden("marks entry is closed".into()));
    }
    if let Some(deadline) = cfg.marks_entry_deadline {
        if Utc::now() > deadline {
            return Err(ExamError::Forbidden(format!(
                "marks entry deadline passed at {}",
                deadline.to_rfc3339()
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Result entry

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnteredResult {
    pub index_number: String,
    pub subject_code: String,
    pub raw_score: i64,
    pub grade: String,
    pub points: i64,
    pub scheme_id: String,
    pub previous_score: Option<i64>,
    pub aggregate: Option<AggregateRecord>,
}

/// Store one raw mark, grade it, and refresh the candidate's aggregate in the
/// same transaction.
pub fn enter_result(
    conn: &Connection,
    cfg: &SystemConfig,
    actor: Option<&str>,
    index_number: &str,
    subject_code: &str,
    raw_score: Option<&serde_json::Value>,
) -> ExamResult<EnteredResult> {
    check_entry_window(cfg)?;
    let score = grading::parse_score(raw_score)?;
    let candidate = registry::get_candidate(conn, index_number)?;
    let subject = registry::resolve_subject(conn, subject_code)?;
    if subject.level != candidate.level {
        return Err(ExamError::validation_with(
            "subject is not examined at the candidate's level",
            json!({ "subjectCode": subject.code, "level": candidate.level }),
        ));
    }
    authorize_entry(conn, actor, &candidate, &subject.code)?;

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    if aggregate::cohort_released(&tx, &candidate.level, &candidate.year_id)? {
        return Err(ExamError::Conflict(format!(
            "{} {} results are released; marks for {} can no longer change",
            candidate.level, candidate.year, candidate.index_number
        )));
    }

    let resolved =
        schemes::resolve_for_subject(&tx, &candidate.level, &candidate.year_id, &subject.id)?;
    let range = resolved.scheme.grade(score)?;

    let previous: Option<i64> = tx
        .query_row(
            "SELECT raw_score FROM exam_results WHERE candidate_id = ? AND subject_id = ?",
            (&candidate.id, &subject.id),
            |r| r.get(0),
        )
        .optional()?;
    let now = now_rfc3339();
    tx.execute(
        "INSERT INTO exam_results(
            id, candidate_id, subject_id, raw_score, grade, points, scheme_id, entered_by,
            created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(candidate_id, subject_id) DO UPDATE SET
            raw_score = excluded.raw_score,
            grade = excluded.grade,
            points = excluded.points,
            scheme_id = excluded.scheme_id,
            entered_by = excluded.entered_by,
            updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            &candidate.id,
            &subject.id,
            score,
            &range.grade,
            range.points,
            &resolved.id,
            actor,
            &now,
            &now,
        ),
    )?;
    let aggregate =
        aggregate::recompute_candidate(&tx, &candidate.id, &candidate.level, &candidate.year_id)?;

    let description = match previous {
        Some(old) if old != score => format!(
            "{} {} changed {} -> {}",
            candidate.index_number, subject.code, old, score
        ),
        Some(_) => format!("{} {} re-entered {}", candidate.index_number, subject.code, score),
        None => format!("{} {} entered {}", candidate.index_number, subject.code, score),
    };
    audit::log_activity(
        &tx,
        actor,
        Activity::MarksEntry,
        &description,
        "exam_result",
        &candidate.id,
    )?;
    tx.commit()?;

    tracing::debug!(
        index_number = %candidate.index_number,
        subject = %subject.code,
        score,
        grade = %range.grade,
        "result entered"
    );

    Ok(EnteredResult {
        index_number: candidate.index_number,
        subject_code: subject.code,
        raw_score: score,
        grade: range.grade.clone(),
        points: range.points,
        scheme_id: resolved.id.clone(),
        previous_score: previous,
        aggregate,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRowError {
    pub row: i64,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkOutcome {
    pub updated: usize,
    pub rejected: usize,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub limit_exceeded: bool,
    pub errors: Vec<BulkRowError>,
}

/// Enter many marks. Each row stands alone: a bad row is reported and the
/// rest still apply.
pub fn enter_bulk(
    conn: &Connection,
    cfg: &SystemConfig,
    actor: Option<&str>,
    entries: &[serde_json::Value],
) -> ExamResult<BulkOutcome> {
    if entries.len() > BULK_MAX_ENTRIES {
        return Ok(BulkOutcome {
            updated: 0,
            rejected: entries.len(),
            limit_exceeded: true,
            errors: vec![BulkRowError {
                row: -1,
                code: "too_many_entries".into(),
                message: format!(
                    "bulk payload exceeds max entries: {} > {}",
                    entries.len(),
                    BULK_MAX_ENTRIES
                ),
            }],
        });
    }
    // A closed window fails the whole batch rather than every row.
    check_entry_window(cfg)?;

    let mut out = BulkOutcome::default();
    for (i, entry) in entries.iter().enumerate() {
        let row = i as i64;
        let index_number = entry.get("indexNumber").and_then(|v| v.as_str());
        let subject_code = entry.get("subjectCode").and_then(|v| v.as_str());
        let (Some(index_number), Some(subject_code)) = (index_number, subject_code) else {
            out.errors.push(BulkRowError {
                row,
                code: "bad_params".into(),
                message: format!("entry at index {i} needs indexNumber and subjectCode"),
            });
            continue;
        };
        match enter_result(
            conn,
            cfg,
            actor,
            index_number,
            subject_code,
            entry.get("rawScore"),
        ) {
            Ok(_) => out.updated += 1,
            Err(e) => out.errors.push(BulkRowError {
                row,
                code: e.code().to_string(),
                message: e.to_string(),
            }),
        }
    }
    out.rejected = out.errors.len();
    tracing::info!(updated = out.updated, rejected = out.rejected, "bulk marks entry finished");
    Ok(out)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultFilter {
    pub index_number: Option<String>,
    pub school_code: Option<String>,
    pub level: Option<String>,
    pub year: Option<String>,
    pub subject_code: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRow {
    pub index_number: String,
    pub school_code: String,
    pub subject_code: String,
    pub raw_score: i64,
    pub grade: String,
    pub points: i64,
    pub entered_by: Option<String>,
    pub updated_at: String,
}

pub fn list_results(conn: &Connection, filter: &ResultFilter) -> ExamResult<Vec<ResultRow>> {
    let mut sql = String::from(
        "SELECT c.index_number, s.code, sub.code, r.raw_score, r.grade, r.points, r.entered_by,
                r.updated_at
         FROM exam_results r
         JOIN candidates c ON c.id = r.candidate_id
         JOIN schools s ON s.id = c.school_id
         JOIN subjects sub ON sub.id = r.subject_id
         JOIN academic_years y ON y.id = c.year_id
         WHERE 1 = 1",
    );
    let mut binds: Vec<Value> = Vec::new();
    if let Some(v) = &filter.index_number {
        sql.push_str(" AND c.index_number = ?");
        binds.push(Value::Text(v.trim().to_string()));
    }
    if let Some(v) = &filter.school_code {
        sql.push_str(" AND s.code = ?");
        binds.push(Value::Text(v.trim().to_string()));
    }
    if let Some(v) = &filter.level {
        sql.push_str(" AND c.level_id = ?");
        binds.push(Value::Text(ExamLevel::parse(v)?.as_str().to_string()));
    }
    if let Some(v) = &filter.year {
        sql.push_str(" AND y.label = ?");
        binds.push(Value::Text(v.trim().to_string()));
    }
    if let Some(v) = &filter.subject_code {
        sql.push_str(" AND sub.code = ?");
        binds.push(Value::Text(v.trim().to_ascii_uppercase()));
    }
    sql.push_str(" ORDER BY c.index_number, sub.code LIMIT ?");
    binds.push(Value::Integer(filter.limit.unwrap_or(5000).clamp(1, 50_000)));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(ResultRow {
                index_number: r.get(0)?,
                school_code: r.get(1)?,
                subject_code: r.get(2)?,
                raw_score: r.get(3)?,
                grade: r.get(4)?,
                points: r.get(5)?,
                entered_by: r.get(6)?,
                updated_at: r.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::config::{self, ConfigSection};
    use crate::db;
    use crate::registry::fixtures as reg;
    use crate::schemes::fixtures as sch;

    fn setup() -> (Connection, String) {
        let conn = db::open_in_memory();
        reg::year(&conn);
        reg::school(&conn, "NRB-01", "Nairobi", "SENIOR");
        registry::create_subject(&conn, "MAT", "Mathematics", ExamLevel::Kcse, true).expect("MAT");
        registry::create_subject(&conn, "ENG", "English", ExamLevel::Kcse, true).expect("ENG");
        sch::overall(&conn, "KCSE");
        let c = registry::register_candidate(
            &conn,
            &reg::candidate_input("NRB-01", "KCSE", None, "2000-01-01"),
            None,
        )
        .expect("candidate");
        (conn, c.index_number)
    }

    #[test]
    fn entry_grades_and_aggregates() {
        let (conn, index) = setup();
        open_entry(&conn, "examiner", "KCSE");

        let first = enter(&conn, "examiner", &index, "MAT", 85);
        assert_eq!(first.grade, "A");
        assert_eq!(first.points, 12);
        let second = enter(&conn, "examiner", &index, "ENG", 59);
        assert_eq!(second.grade, "C");

        let agg = second.aggregate.expect("aggregate");
        assert_eq!(agg.subject_count, 2);
        assert_eq!(agg.total_points, 18);
        assert_eq!(agg.mean_points, 9);
        assert_eq!(agg.mean_grade, "B");
        assert!(agg.ranks_stale);

        let again = enter(&conn, "examiner", &index, "ENG", 61);
        assert_eq!(again.previous_score, Some(59));
        let rows = list_results(
            &conn,
            &ResultFilter {
                index_number: Some(index.clone()),
                ..Default::default()
            },
        )
        .expect("list");
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn entry_without_permission_is_forbidden_and_logged() {
        let (conn, index) = setup();
        let cfg = SystemConfig::load(&conn).expect("config");
        let e = enter_result(&conn, &cfg, Some("intruder"), &index, "MAT", Some(&json!(90)))
            .expect_err("no permission");
        assert_eq!(e.code(), "forbidden");

        let logged = audit::list_fraud(&conn, &Default::default()).expect("fraud");
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].attempt_type, "MARKS_TAMPERING");
        assert_eq!(logged[0].actor.as_deref(), Some("intruder"));
    }

    #[test]
    fn permission_limited_to_listed_subjects() {
        let (conn, index) = setup();
        let cfg = SystemConfig::load(&conn).expect("config");
        grant_permission(
            &conn,
            &cfg,
            &NewPermission {
                actor: "maths-examiner".into(),
                level: "KCSE".into(),
                year: "2024/2025".into(),
                subject_codes: vec!["MAT".into()],
                school_codes: Vec::new(),
                valid_from: None,
                valid_until: None,
            },
            None,
        )
        .expect("grant");
        enter(&conn, "maths-examiner", &index, "MAT", 70);
        let e = enter_result(&conn, &cfg, Some("maths-examiner"), &index, "ENG", Some(&json!(70)))
            .expect_err("english not granted");
        assert_eq!(e.code(), "forbidden");

        revoke_permission(&conn, "maths-examiner", ExamLevel::Kcse, "2024/2025").expect("revoke");
        let e = enter_result(&conn, &cfg, Some("maths-examiner"), &index, "MAT", Some(&json!(71)))
            .expect_err("revoked");
        assert_eq!(e.code(), "forbidden");
    }

    #[test]
    fn invalid_scores_are_rejected() {
        let (conn, index) = setup();
        open_entry(&conn, "examiner", "KCSE");
        let cfg = SystemConfig::load(&conn).expect("config");
        for bad in [json!(101), json!(-1), json!(55.5), json!("80")] {
            let e = enter_result(&conn, &cfg, Some("examiner"), &index, "MAT", Some(&bad))
                .expect_err("bad score");
            assert_eq!(e.code(), "validation_failed", "{bad}");
        }
    }

    #[test]
    fn closed_entry_window_blocks_marks() {
        let (conn, index) = setup();
        open_entry(&conn, "examiner", "KCSE");
        let patch = json!({ "deadline": "2001-01-01T00:00:00Z" });
        config::update_section(&conn, ConfigSection::MarksEntry, patch.as_object().expect("obj"))
            .expect("deadline");
        let cfg = SystemConfig::load(&conn).expect("config");
        let e = enter_result(&conn, &cfg, Some("examiner"), &index, "MAT", Some(&json!(50)))
            .expect_err("deadline");
        assert_eq!(e.code(), "forbidden");
    }

    #[test]
    fn bulk_entry_reports_bad_rows() {
        let (conn, index) = setup();
        open_entry(&conn, "examiner", "KCSE");
        let cfg = SystemConfig::load(&conn).expect("config");
        let entries = vec![
            json!({ "indexNumber": index, "subjectCode": "MAT", "rawScore": 80 }),
            json!({ "indexNumber": index, "subjectCode": "ENG", "rawScore": 140 }),
            json!({ "subjectCode": "ENG", "rawScore": 40 }),
        ];
        let out = enter_bulk(&conn, &cfg, Some("examiner"), &entries).expect("bulk");
        assert_eq!(out.updated, 1);
        assert_eq!(out.rejected, 2);
        assert_eq!(out.errors[0].row, 1);
        assert_eq!(out.errors[0].code, "validation_failed");
        assert_eq!(out.errors[1].code, "bad_params");
    }
}
