use crate::audit::{self, Activity};
use crate::db::now_rfc3339;
use crate::error::{ExamError, ExamResult};
use crate::ranking::{self, SchoolPositions, SchoolScore};
use crate::registry::{self, ExamLevel};
use crate::schemes;
use anyhow::Context;
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeCount {
    pub grade: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchoolPerformanceReport {
    pub school_code: String,
    pub school_name: String,
    pub county: String,
    pub level: String,
    pub year: String,
    pub total_candidates: i64,
    pub candidates_with_results: i64,
    pub distribution: Vec<GradeCount>,
    pub mean_points: f64,
    pub top_grade: Option<String>,
    pub rank_county: Option<i64>,
    pub rank_nation: Option<i64>,
    pub generated_at: String,
    pub generated_by: Option<String>,
}

/// Per-school mean of released candidate mean points across a cohort.
fn cohort_school_scores(conn: &Connection, level: &str, year_id: &str) -> ExamResult<Vec<SchoolScore>> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.code, s.county, AVG(a.mean_points)
         FROM aggregate_results a
         JOIN candidates c ON c.id = a.candidate_id
         JOIN schools s ON s.id = c.school_id
         WHERE c.level_id = ? AND c.year_id = ? AND a.is_released = 1
         GROUP BY s.id",
    )?;
    let rows = stmt
        .query_map((level, year_id), |r| {
            Ok(SchoolScore {
                school_id: r.get(0)?,
                school_code: r.get(1)?,
                county: r.get(2)?,
                mean_points: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// Labels of a scheme from best to worst, for stable distribution order.
fn labels_best_first(ranges: &[crate::grading::GradeRange]) -> Vec<String> {
    ranges.iter().rev().map(|r| r.grade.clone()).collect()
}

fn fill_distribution(labels: &[String], counts: &HashMap<String, i64>) -> Vec<GradeCount> {
    labels
        .iter()
        .map(|g| GradeCount {
            grade: g.clone(),
            count: counts.get(g).copied().unwrap_or(0),
        })
        .collect()
}

/// Build and store the performance report for one school's cohort. Only
/// released results count.
pub fn school_performance(
    conn: &Connection,
    school_code: &str,
    level: ExamLevel,
    year: &str,
    actor: Option<&str>,
) -> ExamResult<SchoolPerformanceReport> {
    let school = registry::resolve_school(conn, school_code)?;
    let year = registry::resolve_year(conn, year)?;
    let overall = schemes::resolve_overall(conn, level.as_str(), &year.id)?;

    let total_candidates: i64 = conn.query_row(
        "SELECT COUNT(*) FROM candidates
         WHERE school_id = ? AND level_id = ? AND year_id = ? AND is_active = 1",
        (&school.id, level.as_str(), &year.id),
        |r| r.get(0),
    )?;

    let mut counts: HashMap<String, i64> = HashMap::new();
    let mut with_results = 0i64;
    let mut best: Option<(i64, String)> = None;
    {
        let mut stmt = conn.prepare(
            "SELECT a.mean_grade, a.mean_points
             FROM aggregate_results a
             JOIN candidates c ON c.id = a.candidate_id
             WHERE c.school_id = ? AND c.level_id = ? AND c.year_id = ? AND a.is_released = 1",
        )?;
        let rows = stmt.query_map((&school.id, level.as_str(), &year.id), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (grade, mean) = row?;
            with_results += 1;
            if best.as_ref().map(|(m, _)| mean > *m).unwrap_or(true) {
                best = Some((mean, grade.clone()));
            }
            *counts.entry(grade).or_insert(0) += 1;
        }
    }

    let scores = cohort_school_scores(conn, level.as_str(), &year.id)?;
    let mean_points = scores
        .iter()
        .find(|s| s.school_id == school.id)
        .map(|s| round3(s.mean_points))
        .unwrap_or(0.0);
    let ranks = ranking::rank_schools(&scores);
    let position: Option<&SchoolPositions> = ranks.get(&school.id);

    let distribution = fill_distribution(&labels_best_first(overall.scheme.ranges()), &counts);
    let now = now_rfc3339();
    let report = SchoolPerformanceReport {
        school_code: school.code.clone(),
        school_name: school.name.clone(),
        county: school.county.clone(),
        level: level.as_str().to_string(),
        year: year.label.clone(),
        total_candidates,
        candidates_with_results: with_results,
        distribution,
        mean_points,
        top_grade: best.map(|(_, g)| g),
        rank_county: position.map(|p| p.county),
        rank_nation: position.map(|p| p.nation),
        generated_at: now.clone(),
        generated_by: actor.map(str::to_string),
    };

    conn.execute(
        "INSERT INTO school_reports(
            school_id, level_id, year_id, total_candidates, candidates_with_results,
            distribution_json, mean_points, top_grade, rank_county, rank_nation,
            generated_at, generated_by
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(school_id, level_id, year_id) DO UPDATE SET
            total_candidates = excluded.total_candidates,
            candidates_with_results = excluded.candidates_with_results,
            distribution_json = excluded.distribution_json,
            mean_points = excluded.mean_points,
            top_grade = excluded.top_grade,
            rank_county = excluded.rank_county,
            rank_nation = excluded.rank_nation,
            generated_at = excluded.generated_at,
            generated_by = excluded.generated_by",
        rusqlite::params![
            &school.id,
            level.as_str(),
            &year.id,
            report.total_candidates,
            report.candidates_with_results,
            serde_json::to_string(&report.distribution)?,
            report.mean_points,
            report.top_grade.as_deref().unwrap_or(""),
            report.rank_county,
            report.rank_nation,
            &now,
            actor,
        ],
    )?;
    tracing::info!(
        school = %school.code,
        level = level.as_str(),
        year = %year.label,
        "school performance report generated"
    );
    Ok(report)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeDistribution {
    pub level: String,
    pub year: String,
    pub school_code: Option<String>,
    pub subject_code: Option<String>,
    pub total: i64,
    pub grades: Vec<GradeCount>,
}

/// Counts per grade. With a subject, counts subject grades; otherwise mean
/// grades. Covers entered results whether released or not.
pub fn grade_distribution(
    conn: &Connection,
    level: ExamLevel,
    year: &str,
    school_code: Option<&str>,
    subject_code: Option<&str>,
) -> ExamResult<GradeDistribution> {
    let year = registry::resolve_year(conn, year)?;
    let school = school_code.map(|c| registry::resolve_school(conn, c)).transpose()?;
    let subject = subject_code.map(|c| registry::resolve_subject(conn, c)).transpose()?;

    let (labels, mut sql) = match &subject {
        Some(s) => {
            let resolved = schemes::resolve_for_subject(conn, level.as_str(), &year.id, &s.id)?;
            (
                labels_best_first(resolved.scheme.ranges()),
                String::from(
                    "SELECT r.grade, COUNT(*)
                     FROM exam_results r
                     JOIN candidates c ON c.id = r.candidate_id
                     WHERE c.level_id = ? AND c.year_id = ? AND r.subject_id = ?",
                ),
            )
        }
        None => {
            let resolved = schemes::resolve_overall(conn, level.as_str(), &year.id)?;
            (
                labels_best_first(resolved.scheme.ranges()),
                String::from(
                    "SELECT a.mean_grade, COUNT(*)
                     FROM aggregate_results a
                     JOIN candidates c ON c.id = a.candidate_id
                     WHERE c.level_id = ? AND c.year_id = ?",
                ),
            )
        }
    };
    let mut binds: Vec<Value> = vec![
        Value::Text(level.as_str().to_string()),
        Value::Text(year.id.clone()),
    ];
    if let Some(s) = &subject {
        binds.push(Value::Text(s.id.clone()));
    }
    if let Some(s) = &school {
        sql.push_str(" AND c.school_id = ?");
        binds.push(Value::Text(s.id.clone()));
    }
    sql.push_str(" GROUP BY 1");

    let mut stmt = conn.prepare(&sql)?;
    let counts: HashMap<String, i64> = stmt
        .query_map(params_from_iter(binds), |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<Result<_, _>>()?;

    Ok(GradeDistribution {
        level: level.as_str().to_string(),
        year: year.label,
        school_code: school.map(|s| s.code),
        subject_code: subject.map(|s| s.code),
        total: counts.values().sum(),
        grades: fill_distribution(&labels, &counts),
    })
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub active_year: Option<String>,
    pub schools: i64,
    pub candidates: i64,
    pub results_entered: i64,
    pub aggregates_released: i64,
    pub payments: HashMap<String, i64>,
    pub revenue_cents: i64,
    pub unresolved_fraud: i64,
}

pub fn dashboard_stats(conn: &Connection) -> ExamResult<DashboardStats> {
    let count = |sql: &str| -> ExamResult<i64> { Ok(conn.query_row(sql, [], |r| r.get(0))?) };

    let active_year: Option<String> = conn
        .query_row(
            "SELECT label FROM academic_years WHERE is_active = 1",
            [],
            |r| r.get(0),
        )
        .optional()?;

    let mut payments = HashMap::new();
    {
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM payments GROUP BY status")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        for row in rows {
            let (status, n) = row?;
            payments.insert(status, n);
        }
    }

    Ok(DashboardStats {
        active_year,
        schools: count("SELECT COUNT(*) FROM schools WHERE is_active = 1")?,
        candidates: count("SELECT COUNT(*) FROM candidates WHERE is_active = 1")?,
        results_entered: count("SELECT COUNT(*) FROM exam_results")?,
        aggregates_released: count("SELECT COUNT(*) FROM aggregate_results WHERE is_released = 1")?,
        payments,
        revenue_cents: count(
            "SELECT COALESCE(SUM(amount_cents), 0) FROM payments WHERE status = 'completed'",
        )?,
        unresolved_fraud: count("SELECT COUNT(*) FROM fraud_attempts WHERE is_resolved = 0")?,
    })
}

// ---------------------------------------------------------------------------
// CSV export

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    pub path: String,
    pub rows: usize,
}

fn csv_writer(out_path: &Path) -> anyhow::Result<csv::Writer<std::fs::File>> {
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    csv::Writer::from_path(out_path)
        .with_context(|| format!("failed to create output file {}", out_path.to_string_lossy()))
}

fn opt_num(v: Option<i64>) -> String {
    v.map(|n| n.to_string()).unwrap_or_default()
}

const RESULTS_HEADER: [&str; 13] = [
    "index_number",
    "name",
    "gender",
    "school_code",
    "county",
    "subjects",
    "total_points",
    "mean_points",
    "mean_grade",
    "position_school",
    "position_county",
    "position_nation",
    "released",
];

/// One row per candidate with an aggregate, ordered by national position.
pub fn export_results_csv(
    conn: &Connection,
    level: ExamLevel,
    year: &str,
    school_code: Option<&str>,
    out_path: &Path,
    actor: Option<&str>,
) -> anyhow::Result<ExportSummary> {
    let year = registry::resolve_year(conn, year)?;
    let mut sql = String::from(
        "SELECT c.index_number, c.first_name, c.middle_name, c.last_name, c.gender, s.code,
                s.county, a.subject_count, a.total_points, a.mean_points, a.mean_grade,
                a.position_school, a.position_county, a.position_nation, a.is_released
         FROM aggregate_results a
         JOIN candidates c ON c.id = a.candidate_id
         JOIN schools s ON s.id = c.school_id
         WHERE c.level_id = ? AND c.year_id = ?",
    );
    let mut binds: Vec<Value> = vec![
        Value::Text(level.as_str().to_string()),
        Value::Text(year.id.clone()),
    ];
    if let Some(code) = school_code {
        let school = registry::resolve_school(conn, code)?;
        sql.push_str(" AND c.school_id = ?");
        binds.push(Value::Text(school.id));
    }
    sql.push_str(" ORDER BY a.position_nation IS NULL, a.position_nation, c.index_number");

    let mut stmt = conn.prepare(&sql).map_err(ExamError::from)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            let name = [r.get::<_, String>(1)?, r.get(2)?, r.get(3)?]
                .into_iter()
                .filter(|s: &String| !s.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            Ok(vec![
                r.get::<_, String>(0)?,
                name,
                r.get(4)?,
                r.get(5)?,
                r.get(6)?,
                r.get::<_, i64>(7)?.to_string(),
                r.get::<_, i64>(8)?.to_string(),
                r.get::<_, i64>(9)?.to_string(),
                r.get(10)?,
                opt_num(r.get(11)?),
                opt_num(r.get(12)?),
                opt_num(r.get(13)?),
                if r.get::<_, i64>(14)? != 0 { "yes" } else { "no" }.to_string(),
            ])
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(ExamError::from)?;

    let mut wtr = csv_writer(out_path)?;
    wtr.write_record(RESULTS_HEADER)
        .context("failed to write csv header")?;
    for row in &rows {
        wtr.write_record(row).context("failed to write csv row")?;
    }
    wtr.flush().context("failed to flush csv output")?;

    let path = out_path.to_string_lossy().to_string();
    audit::log_activity(
        conn,
        actor,
        Activity::Export,
        &format!("{} {} results exported ({} rows)", level.as_str(), year.label, rows.len()),
        "export",
        &path,
    )?;
    tracing::info!(path = %path, rows = rows.len(), "results csv exported");
    Ok(ExportSummary {
        path,
        rows: rows.len(),
    })
}

const SCHOOL_RANKING_HEADER: [&str; 7] = [
    "rank_nation",
    "rank_county",
    "school_code",
    "school_name",
    "county",
    "candidates",
    "mean_points",
];

/// Schools ranked by the mean of their released candidates' mean points.
pub fn export_school_ranking_csv(
    conn: &Connection,
    level: ExamLevel,
    year: &str,
    out_path: &Path,
    actor: Option<&str>,
) -> anyhow::Result<ExportSummary> {
    let year = registry::resolve_year(conn, year)?;
    let scores = cohort_school_scores(conn, level.as_str(), &year.id)?;
    let ranks = ranking::rank_schools(&scores);

    let mut rows: Vec<(SchoolPositions, Vec<String>)> = Vec::with_capacity(scores.len());
    for s in &scores {
        let Some(pos) = ranks.get(&s.school_id).copied() else {
            continue;
        };
        let (name, candidates): (String, i64) = conn
            .query_row(
                "SELECT s.name,
                        (SELECT COUNT(*) FROM candidates c
                         WHERE c.school_id = s.id AND c.level_id = ? AND c.year_id = ?)
                 FROM schools s WHERE s.id = ?",
                (level.as_str(), &year.id, &s.school_id),
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .map_err(ExamError::from)?;
        rows.push((
            pos,
            vec![
                pos.nation.to_string(),
                pos.county.to_string(),
                s.school_code.clone(),
                name,
                s.county.clone(),
                candidates.to_string(),
                format!("{:.3}", s.mean_points),
            ],
        ));
    }
    rows.sort_by_key(|(p, _)| p.nation);

    let mut wtr = csv_writer(out_path)?;
    wtr.write_record(SCHOOL_RANKING_HEADER)
        .context("failed to write csv header")?;
    for (_, row) in &rows {
        wtr.write_record(row).context("failed to write csv row")?;
    }
    wtr.flush().context("failed to flush csv output")?;

    let path = out_path.to_string_lossy().to_string();
    audit::log_activity(
        conn,
        actor,
        Activity::Export,
        &format!("{} {} school ranking exported", level.as_str(), year.label),
        "export",
        &path,
    )?;
    tracing::info!(path = %path, rows = rows.len(), "school ranking csv exported");
    Ok(ExportSummary {
        path,
        rows: rows.len(),
    })
}
