use crate::audit::{self, Activity};
use crate::db::now_rfc3339;
use crate::error::{ExamError, ExamResult};
use crate::grading::{GradeRange, GradingScheme};
use crate::registry::{self, ExamLevel};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use rusqlite::{Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

const OVERALL_SCOPE: &str = "*";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewScheme {
    pub name: String,
    pub level: String,
    pub year: String,
    #[serde(default)]
    pub subject_code: Option<String>,
    #[serde(default)]
    pub description: String,
    pub ranges: Vec<GradeRange>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemeRecord {
    pub id: String,
    pub name: String,
    pub level: String,
    pub year: String,
    pub subject_code: Option<String>,
    pub description: String,
    pub ranges: Vec<GradeRange>,
}

/// A scheme resolved for grading, with the id recorded against results.
#[derive(Debug, Clone)]
pub struct ResolvedScheme {
    pub id: String,
    pub scheme: GradingScheme,
}

pub fn create_scheme(
    conn: &Connection,
    new: &NewScheme,
    actor: Option<&str>,
) -> ExamResult<SchemeRecord> {
    let name = new.name.trim();
    if name.is_empty() {
        return Err(ExamError::validation("scheme name must not be empty"));
    }
    let level = ExamLevel::parse(&new.level)?;
    let year = registry::resolve_year(conn, &new.year)?;
    let subject = match new.subject_code.as_deref().map(str::trim) {
        Some(code) if !code.is_empty() => {
            let s = registry::resolve_subject(conn, code)?;
            if s.level != level.as_str() {
                return Err(ExamError::validation_with(
                    "subject belongs to a different education level",
                    json!({ "subjectCode": s.code, "subjectLevel": s.level }),
                ));
            }
            Some(s)
        }
        _ => None,
    };
    let scheme = GradingScheme::new(new.ranges.clone())?;

    let id = Uuid::new_v4().to_string();
    let scope_key = subject.as_ref().map(|s| s.id.as_str()).unwrap_or(OVERALL_SCOPE);
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    tx.execute(
        "INSERT INTO grading_schemes(
            id, name, level_id, year_id, subject_id, scope_key, description, created_by, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            name,
            level.as_str(),
            &year.id,
            subject.as_ref().map(|s| s.id.as_str()),
            scope_key,
            new.description.trim(),
            actor,
            now_rfc3339(),
        ),
    )
    .map_err(|e| match ExamError::from(e) {
        ExamError::Conflict(_) => ExamError::Conflict(format!(
            "a grading scheme already exists for {} {} {}",
            level.as_str(),
            year.label,
            subject.as_ref().map(|s| s.code.as_str()).unwrap_or("(overall)")
        )),
        other => other,
    })?;
    {
        let mut ins = tx.prepare(
            "INSERT INTO grade_ranges(id, scheme_id, grade, min_score, max_score, points, description)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
        )?;
        for r in scheme.ranges() {
            ins.execute((
                Uuid::new_v4().to_string(),
                &id,
                &r.grade,
                r.min_score,
                r.max_score,
                r.points,
                &r.description,
            ))?;
        }
    }
    audit::log_activity(
        &tx,
        actor,
        Activity::Create,
        &format!("grading scheme {name} created"),
        "grading_scheme",
        &id,
    )?;
    tx.commit()?;

    tracing::info!(
        scheme_id = %id,
        level = level.as_str(),
        year = %year.label,
        ranges = scheme.ranges().len(),
        "grading scheme created"
    );

    Ok(SchemeRecord {
        id,
        name: name.to_string(),
        level: level.as_str().to_string(),
        year: year.label,
        subject_code: subject.map(|s| s.code),
        description: new.description.trim().to_string(),
        ranges: scheme.ranges().to_vec(),
    })
}

fn load_ranges(conn: &Connection, scheme_id: &str) -> ExamResult<Vec<GradeRange>> {
    let mut stmt = conn.prepare(
        "SELECT grade, min_score, max_score, points, description
         FROM grade_ranges WHERE scheme_id = ? ORDER BY min_score",
    )?;
    let rows = stmt
        .query_map([scheme_id], |r| {
            Ok(GradeRange {
                grade: r.get(0)?,
                min_score: r.get(1)?,
                max_score: r.get(2)?,
                points: r.get(3)?,
                description: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

const SCHEME_SELECT: &str = "SELECT g.id, g.name, g.level_id, y.label, s.code, g.description
  FROM grading_schemes g
  JOIN academic_years y ON y.id = g.year_id
  LEFT JOIN subjects s ON s.id = g.subject_id";

fn scheme_header(r: &rusqlite::Row<'_>) -> rusqlite::Result<SchemeRecord> {
    Ok(SchemeRecord {
        id: r.get(0)?,
        name: r.get(1)?,
        level: r.get(2)?,
        year: r.get(3)?,
        subject_code: r.get(4)?,
        description: r.get(5)?,
        ranges: Vec::new(),
    })
}

pub fn get_scheme(conn: &Connection, id: &str) -> ExamResult<SchemeRecord> {
    let mut rec = conn
        .query_row(
            &format!("{SCHEME_SELECT} WHERE g.id = ?"),
            [id],
            scheme_header,
        )
        .optional()?
        .ok_or_else(|| ExamError::not_found("grading scheme", id))?;
    rec.ranges = load_ranges(conn, id)?;
    Ok(rec)
}

pub fn list_schemes(
    conn: &Connection,
    level: Option<ExamLevel>,
    year: Option<&str>,
) -> ExamResult<Vec<SchemeRecord>> {
    let mut sql = format!("{SCHEME_SELECT} WHERE 1 = 1");
    let mut binds: Vec<Value> = Vec::new();
    if let Some(l) = level {
        sql.push_str(" AND g.level_id = ?");
        binds.push(Value::Text(l.as_str().to_string()));
    }
    if let Some(y) = year {
        sql.push_str(" AND y.label = ?");
        binds.push(Value::Text(y.trim().to_string()));
    }
    sql.push_str(" ORDER BY y.label DESC, g.level_id, s.code");

    let mut stmt = conn.prepare(&sql)?;
    let mut out = stmt
        .query_map(params_from_iter(binds), scheme_header)?
        .collect::<Result<Vec<_>, _>>()?;
    for rec in &mut out {
        rec.ranges = load_ranges(conn, &rec.id)?;
    }
    Ok(out)
}

fn load_resolved(conn: &Connection, id: String) -> ExamResult<ResolvedScheme> {
    let ranges = load_ranges(conn, &id)?;
    // Stored ranges were validated on creation; a failure here means the
    // table was edited out of band.
    let scheme = GradingScheme::new(ranges).map_err(|e| {
        ExamError::Configuration(format!("stored grading scheme {id} is invalid: {e}"))
    })?;
    Ok(ResolvedScheme { id, scheme })
}

fn find_scheme_id(
    conn: &Connection,
    level: &str,
    year_id: &str,
    scope_key: &str,
) -> ExamResult<Option<String>> {
    let id = conn
        .query_row(
            "SELECT id FROM grading_schemes WHERE level_id = ? AND year_id = ? AND scope_key = ?",
            (level, year_id, scope_key),
            |r| r.get(0),
        )
        .optional()?;
    Ok(id)
}

/// The overall scheme for a level and year. Used for mean grades.
pub fn resolve_overall(conn: &Connection, level: &str, year_id: &str) -> ExamResult<ResolvedScheme> {
    match find_scheme_id(conn, level, year_id, OVERALL_SCOPE)? {
        Some(id) => load_resolved(conn, id),
        None => Err(ExamError::Configuration(format!(
            "no overall grading scheme configured for {level} in this academic year"
        ))),
    }
}

/// The scheme that grades `subject_id`: subject-specific if one exists,
/// otherwise the overall scheme for the level and year.
pub fn resolve_for_subject(
    conn: &Connection,
    level: &str,
    year_id: &str,
    subject_id: &str,
) -> ExamResult<ResolvedScheme> {
    match find_scheme_id(conn, level, year_id, subject_id)? {
        Some(id) => load_resolved(conn, id),
        None => resolve_overall(conn, level, year_id),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeOutcome {
    pub scheme_id: String,
    pub score: i64,
    pub grade: String,
    pub points: i64,
}

/// Grade a score the way marks entry would, without storing anything.
pub fn grade_score(
    conn: &Connection,
    level: ExamLevel,
    year: &str,
    subject_code: Option<&str>,
    score: i64,
) -> ExamResult<GradeOutcome> {
    let year = registry::resolve_year(conn, year)?;
    let resolved = match subject_code {
        Some(code) => {
            let subject = registry::resolve_subject(conn, code)?;
            resolve_for_subject(conn, level.as_str(), &year.id, &subject.id)?
        }
        None => resolve_overall(conn, level.as_str(), &year.id)?,
    };
    let range = resolved.scheme.grade(score)?;
    tracing::debug!(score, grade = %range.grade, points = range.points, "graded score");
    Ok(GradeOutcome {
        scheme_id: resolved.id.clone(),
        score,
        grade: range.grade.clone(),
        points: range.points,
    })
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::db;
    use crate::registry::fixtures as reg;

    #[test]
    fn subject_scheme_takes_precedence_over_overall() {
        let conn = db::open_in_memory();
        reg::year(&conn);
        registry::create_subject(&conn, "MAT", "Mathematics", ExamLevel::Kcse, true)
            .expect("subject");
        registry::create_subject(&conn, "ENG", "English", ExamLevel::Kcse, true)
            .expect("subject");
        overall(&conn, "KCSE");
        create_scheme(
            &conn,
            &NewScheme {
                name: "Maths curve".into(),
                level: "KCSE".into(),
                year: "2024/2025".into(),
                subject_code: Some("MAT".into()),
                description: String::new(),
                ranges: vec![range("A", 70, 100, 12), range("E", 0, 69, 1)],
            },
            Some("examiner"),
        )
        .expect("subject scheme");

        let maths = grade_score(&conn, ExamLevel::Kcse, "2024/2025", Some("MAT"), 75).expect("grade");
        assert_eq!(maths.grade, "A");
        let english =
            grade_score(&conn, ExamLevel::Kcse, "2024/2025", Some("ENG"), 75).expect("grade");
        assert_eq!(english.grade, "B");
    }

    #[test]
    fn one_scheme_per_scope() {
        let conn = db::open_in_memory();
        reg::year(&conn);
        overall(&conn, "KCPE");
        let e = create_scheme(
            &conn,
            &NewScheme {
                name: "again".into(),
                level: "KCPE".into(),
                year: "2024/2025".into(),
                subject_code: None,
                description: String::new(),
                ranges: abcd(),
            },
            None,
        )
        .expect_err("duplicate");
        assert_eq!(e.code(), "conflict");
    }

    #[test]
    fn invalid_partition_is_rejected_before_storage() {
        let conn = db::open_in_memory();
        reg::year(&conn);
        let e = create_scheme(
            &conn,
            &NewScheme {
                name: "gappy".into(),
                level: "KCSE".into(),
                year: "2024/2025".into(),
                subject_code: None,
                description: String::new(),
                ranges: vec![range("A", 80, 100, 12), range("B", 0, 70, 9)],
            },
            None,
        )
        .expect_err("gap");
        assert_eq!(e.code(), "validation_failed");
        assert!(list_schemes(&conn, None, None).expect("list").is_empty());
    }

    #[test]
    fn missing_scheme_is_a_configuration_error() {
        let conn = db::open_in_memory();
        reg::year(&conn);
        let e = grade_score(&conn, ExamLevel::Kepsea, "2024/2025", None, 50).expect_err("none");
        assert_eq!(e.code(), "config_error");
    }
}
