use crate::audit::{self, Activity};
use crate::db::now_rfc3339;
use crate::error::{ExamError, ExamResult};
use crate::grading;
use crate::ranking::{self, RankEntry};
use crate::registry::{self, Candidate, ExamLevel};
use crate::schemes;
use rusqlite::{Connection, OptionalExtension};
use rusqlite::{Transaction, TransactionBehavior};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRecord {
    pub subject_count: i64,
    pub total_points: i64,
    pub mean_points: i64,
    pub mean_grade: String,
    pub position_school: Option<i64>,
    pub position_county: Option<i64>,
    pub position_nation: Option<i64>,
    pub ranks_stale: bool,
    pub is_released: bool,
    pub released_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectResult {
    pub subject_code: String,
    pub subject_name: String,
    pub raw_score: i64,
    pub grade: String,
    pub points: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateResults {
    pub candidate: Candidate,
    pub subjects: Vec<SubjectResult>,
    pub aggregate: Option<AggregateRecord>,
}

/// Rebuild one candidate's aggregate from their stored results.
///
/// Called inside the transaction that changed a result. Positions are left
/// as they were and flagged stale until the next cohort ranking pass.
pub fn recompute_candidate(
    conn: &Connection,
    candidate_id: &str,
    level: &str,
    year_id: &str,
) -> ExamResult<Option<AggregateRecord>> {
    let (count, total): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(points), 0) FROM exam_results WHERE candidate_id = ?",
        [candidate_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    if count == 0 {
        conn.execute(
            "DELETE FROM aggregate_results WHERE candidate_id = ?",
            [candidate_id],
        )?;
        return Ok(None);
    }

    let overall = schemes::resolve_overall(conn, level, year_id)?;
    let mean = grading::mean_points(total, count as usize);
    let mean_grade = overall.scheme.mean_grade(mean).grade.clone();

    conn.execute(
        "INSERT INTO aggregate_results(
            candidate_id, subject_count, total_points, mean_points, mean_grade, scheme_id,
            ranks_stale, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, 1, ?)
         ON CONFLICT(candidate_id) DO UPDATE SET
            subject_count = excluded.subject_count,
            total_points = excluded.total_points,
            mean_points = excluded.mean_points,
            mean_grade = excluded.mean_grade,
            scheme_id = excluded.scheme_id,
            ranks_stale = 1,
            updated_at = excluded.updated_at",
        (
            candidate_id,
            count,
            total,
            mean,
            &mean_grade,
            &overall.id,
            now_rfc3339(),
        ),
    )?;
    tracing::debug!(candidate_id, total, mean, grade = %mean_grade, "aggregate recomputed");
    load_aggregate(conn, candidate_id)
}

pub fn load_aggregate(conn: &Connection, candidate_id: &str) -> ExamResult<Option<AggregateRecord>> {
    let rec = conn
        .query_row(
            "SELECT subject_count, total_points, mean_points, mean_grade, position_school,
                    position_county, position_nation, ranks_stale, is_released, released_at
             FROM aggregate_results WHERE candidate_id = ?",
            [candidate_id],
            |r| {
                Ok(AggregateRecord {
                    subject_count: r.get(0)?,
                    total_points: r.get(1)?,
                    mean_points: r.get(2)?,
                    mean_grade: r.get(3)?,
                    position_school: r.get(4)?,
                    position_county: r.get(5)?,
                    position_nation: r.get(6)?,
                    ranks_stale: r.get::<_, i64>(7)? != 0,
                    is_released: r.get::<_, i64>(8)? != 0,
                    released_at: r.get(9)?,
                })
            },
        )
        .optional()?;
    Ok(rec)
}

pub fn is_released(conn: &Connection, candidate_id: &str) -> ExamResult<bool> {
    let released: Option<i64> = conn
        .query_row(
            "SELECT is_released FROM aggregate_results WHERE candidate_id = ?",
            [candidate_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(released == Some(1))
}

/// Whether any candidate in the cohort (level + year) has released results.
/// Release covers the whole cohort, so one released row freezes all of it.
pub fn cohort_released(conn: &Connection, level: &str, year_id: &str) -> ExamResult<bool> {
    let released: i64 = conn.query_row(
        "SELECT COUNT(*)
         FROM aggregate_results a
         JOIN candidates c ON c.id = a.candidate_id
         WHERE c.level_id = ? AND c.year_id = ? AND a.is_released = 1",
        (level, year_id),
        |r| r.get(0),
    )?;
    Ok(released > 0)
}

pub fn subject_results(conn: &Connection, candidate_id: &str) -> ExamResult<Vec<SubjectResult>> {
    let mut stmt = conn.prepare(
        "SELECT s.code, s.name, r.raw_score, r.grade, r.points
         FROM exam_results r
         JOIN subjects s ON s.id = r.subject_id
         WHERE r.candidate_id = ?
         ORDER BY s.code",
    )?;
    let rows = stmt
        .query_map([candidate_id], |r| {
            Ok(SubjectResult {
                subject_code: r.get(0)?,
                subject_name: r.get(1)?,
                raw_score: r.get(2)?,
                grade: r.get(3)?,
                points: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn candidate_results(conn: &Connection, candidate: Candidate) -> ExamResult<CandidateResults> {
    let subjects = subject_results(conn, &candidate.id)?;
    let aggregate = load_aggregate(conn, &candidate.id)?;
    Ok(CandidateResults {
        candidate,
        subjects,
        aggregate,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingSummary {
    pub level: String,
    pub year: String,
    pub ranked: usize,
}

/// Batch pass over a whole cohort (level + year). Every aggregate gets fresh
/// school, county and national positions.
pub fn recompute_rankings(
    conn: &Connection,
    level: ExamLevel,
    year: &str,
    actor: Option<&str>,
) -> ExamResult<RankingSummary> {
    let year = registry::resolve_year(conn, year)?;
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;

    if cohort_released(&tx, level.as_str(), &year.id)? {
        return Err(ExamError::Conflict(format!(
            "{} {} results are already released; positions are frozen",
            level.as_str(),
            year.label
        )));
    }

    let entries = {
        let mut stmt = tx.prepare(
            "SELECT a.candidate_id, c.index_number, c.school_id, s.county, a.total_points
             FROM aggregate_results a
             JOIN candidates c ON c.id = a.candidate_id
             JOIN schools s ON s.id = c.school_id
             WHERE c.level_id = ? AND c.year_id = ? AND c.is_active = 1",
        )?;
        let rows = stmt
            .query_map((level.as_str(), &year.id), |r| {
                Ok(RankEntry {
                    candidate_id: r.get(0)?,
                    index_number: r.get(1)?,
                    school_id: r.get(2)?,
                    county: r.get(3)?,
                    total_points: r.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let positions = ranking::rank_cohort(&entries);
    {
        let mut upd = tx.prepare(
            "UPDATE aggregate_results
             SET position_school = ?, position_county = ?, position_nation = ?,
                 ranks_stale = 0, updated_at = ?
             WHERE candidate_id = ?",
        )?;
        let now = now_rfc3339();
        for (candidate_id, p) in &positions {
            upd.execute((p.school, p.county, p.nation, &now, candidate_id))?;
        }
    }
    audit::log_activity(
        &tx,
        actor,
        Activity::Update,
        &format!(
            "rankings recomputed for {} {} ({} candidates)",
            level.as_str(),
            year.label,
            positions.len()
        ),
        "cohort",
        &format!("{}:{}", level.as_str(), year.label),
    )?;
    tx.commit()?;

    tracing::info!(
        level = level.as_str(),
        year = %year.label,
        ranked = positions.len(),
        "rankings recomputed"
    );
    Ok(RankingSummary {
        level: level.as_str().to_string(),
        year: year.label,
        ranked: positions.len(),
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseSummary {
    pub level: String,
    pub year: String,
    pub released: usize,
    pub released_at: String,
}

/// Mark every aggregate in the cohort released. Refused while any position is
/// stale, so released positions always reflect the released marks.
pub fn release_results(
    conn: &Connection,
    level: ExamLevel,
    year: &str,
    actor: &str,
) -> ExamResult<ReleaseSummary> {
    let year = registry::resolve_year(conn, year)?;
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;

    let (total, stale): (i64, i64) = tx.query_row(
        "SELECT COUNT(*), COALESCE(SUM(a.ranks_stale), 0)
         FROM aggregate_results a
         JOIN candidates c ON c.id = a.candidate_id
         WHERE c.level_id = ? AND c.year_id = ? AND a.is_released = 0",
        (level.as_str(), &year.id),
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    if total == 0 {
        return Err(ExamError::Conflict(format!(
            "no unreleased {} {} results to release",
            level.as_str(),
            year.label
        )));
    }
    if stale > 0 {
        return Err(ExamError::Conflict(format!(
            "{stale} aggregates have stale positions; recompute rankings before release"
        )));
    }

    let now = now_rfc3339();
    let released = tx.execute(
        "UPDATE aggregate_results
         SET is_released = 1, released_at = ?, released_by = ?, updated_at = ?
         WHERE is_released = 0 AND candidate_id IN (
            SELECT id FROM candidates WHERE level_id = ? AND year_id = ?
         )",
        (&now, actor, &now, level.as_str(), &year.id),
    )?;
    audit::log_activity(
        &tx,
        Some(actor),
        Activity::ResultRelease,
        &format!("{} {} results released ({released})", level.as_str(), year.label),
        "cohort",
        &format!("{}:{}", level.as_str(), year.label),
    )?;
    tx.commit()?;

    tracing::info!(level = level.as_str(), year = %year.label, released, actor, "results released");
    Ok(ReleaseSummary {
        level: level.as_str().to_string(),
        year: year.label,
        released,
        released_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SystemConfig;
    use crate::db;
    use crate::marks::{self, fixtures as mk};
    use crate::registry::fixtures as reg;
    use crate::schemes::fixtures as sch;
    use serde_json::json;

    fn cohort(conn: &Connection) -> Vec<String> {
        reg::year(conn);
        reg::school(conn, "NRB-01", "Nairobi", "SENIOR");
        reg::school(conn, "NRB-02", "Nairobi", "SENIOR");
        reg::school(conn, "MSA-01", "Mombasa", "SENIOR");
        registry::create_subject(conn, "MAT", "Mathematics", ExamLevel::Kcse, true).expect("MAT");
        sch::overall(conn, "KCSE");
        mk::open_entry(conn, "examiner", "KCSE");

        let mut out = Vec::new();
        for school in ["NRB-01", "NRB-01", "NRB-02", "MSA-01"] {
            let c = registry::register_candidate(
                conn,
                &reg::candidate_input(school, "KCSE", None, "2000-01-01"),
                None,
            )
            .expect("candidate");
            out.push(c.index_number);
        }
        out
    }

    fn positions(conn: &Connection, index: &str) -> (Option<i64>, Option<i64>, Option<i64>) {
        let c = registry::get_candidate(conn, index).expect("candidate");
        let a = load_aggregate(conn, &c.id).expect("load").expect("aggregate");
        (a.position_school, a.position_county, a.position_nation)
    }

    #[test]
    fn ranking_uses_points_then_index_number() {
        let conn = db::open_in_memory();
        let idx = cohort(&conn);
        // NRB-01-0001: B(9), NRB-01-0002: A(12), NRB-02-0001: B(9), MSA-01-0001: A(12)
        for (i, score) in [70, 90, 65, 95].iter().enumerate() {
            mk::enter(&conn, "examiner", &idx[i], "MAT", *score);
        }

        let summary = recompute_rankings(&conn, ExamLevel::Kcse, "2024/2025", Some("admin"))
            .expect("rank");
        assert_eq!(summary.ranked, 4);

        // Ties on points fall back to index number order.
        assert_eq!(positions(&conn, "MSA-01-2024-0001"), (Some(1), Some(1), Some(1)));
        assert_eq!(positions(&conn, "NRB-01-2024-0002"), (Some(1), Some(1), Some(2)));
        assert_eq!(positions(&conn, "NRB-01-2024-0001"), (Some(2), Some(2), Some(3)));
        assert_eq!(positions(&conn, "NRB-02-2024-0001"), (Some(1), Some(3), Some(4)));

        let again = recompute_rankings(&conn, ExamLevel::Kcse, "2024/2025", None).expect("rank");
        assert_eq!(again.ranked, 4);
        assert_eq!(positions(&conn, "NRB-02-2024-0001"), (Some(1), Some(3), Some(4)));
    }

    #[test]
    fn release_requires_fresh_ranks_and_freezes_marks() {
        let conn = db::open_in_memory();
        let idx = cohort(&conn);
        mk::enter(&conn, "examiner", &idx[0], "MAT", 70);

        let e = release_results(&conn, ExamLevel::Kcse, "2024/2025", "admin").expect_err("stale");
        assert_eq!(e.code(), "conflict");

        recompute_rankings(&conn, ExamLevel::Kcse, "2024/2025", None).expect("rank");
        let released =
            release_results(&conn, ExamLevel::Kcse, "2024/2025", "admin").expect("release");
        assert_eq!(released.released, 1);

        let cfg = SystemConfig::load(&conn).expect("config");
        let e = marks::enter_result(&conn, &cfg, Some("examiner"), &idx[0], "MAT", Some(&json!(80)))
            .expect_err("released");
        assert_eq!(e.code(), "conflict");

        let e = recompute_rankings(&conn, ExamLevel::Kcse, "2024/2025", None)
            .expect_err("frozen");
        assert_eq!(e.code(), "conflict");
    }

    #[test]
    fn late_marks_after_cohort_release_are_refused() {
        let conn = db::open_in_memory();
        let idx = cohort(&conn);
        mk::enter(&conn, "examiner", &idx[0], "MAT", 70);
        recompute_rankings(&conn, ExamLevel::Kcse, "2024/2025", None).expect("rank");
        release_results(&conn, ExamLevel::Kcse, "2024/2025", "admin").expect("release");

        // idx[1] had no aggregate at release time.
        let cfg = SystemConfig::load(&conn).expect("config");
        let e = marks::enter_result(&conn, &cfg, Some("examiner"), &idx[1], "MAT", Some(&json!(55)))
            .expect_err("cohort released");
        assert_eq!(e.code(), "conflict");

        let late = registry::get_candidate(&conn, &idx[1]).expect("candidate");
        assert!(load_aggregate(&conn, &late.id).expect("load").is_none());
        assert!(subject_results(&conn, &late.id).expect("subjects").is_empty());
    }
}
