use crate::error::{ExamError, ExamResult};
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const MIN_SCORE: i64 = 0;
pub const MAX_SCORE: i64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRange {
    pub grade: String,
    pub min_score: i64,
    pub max_score: i64,
    pub points: i64,
    #[serde(default)]
    pub description: String,
}

impl GradeRange {
    pub fn contains(&self, score: i64) -> bool {
        self.min_score <= score && score <= self.max_score
    }
}

/// A validated set of grade ranges.
///
/// Ranges are whole-mark inclusive intervals. After construction they are
/// sorted ascending and partition [0,100] exactly: the first starts at 0, each
/// next one starts at the previous max + 1, and the last ends at 100.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GradingScheme {
    ranges: Vec<GradeRange>,
}

impl GradingScheme {
    pub fn new(mut ranges: Vec<GradeRange>) -> ExamResult<Self> {
        if ranges.is_empty() {
            return Err(ExamError::validation("grading scheme needs at least one range"));
        }

        for r in &ranges {
            let grade = r.grade.trim();
            if grade.is_empty() || grade.len() > 5 {
                return Err(ExamError::validation_with(
                    "grade label must be 1-5 characters",
                    json!({ "grade": r.grade }),
                ));
            }
            if r.min_score > r.max_score {
                return Err(ExamError::validation_with(
                    "range minimum exceeds maximum",
                    json!({ "grade": r.grade, "min": r.min_score, "max": r.max_score }),
                ));
            }
            if r.min_score < MIN_SCORE || r.max_score > MAX_SCORE {
                return Err(ExamError::validation_with(
                    "range bounds must lie within [0,100]",
                    json!({ "grade": r.grade, "min": r.min_score, "max": r.max_score }),
                ));
            }
            if r.points < 0 {
                return Err(ExamError::validation_with(
                    "points must not be negative",
                    json!({ "grade": r.grade, "points": r.points }),
                ));
            }
        }

        let mut labels: Vec<&str> = ranges.iter().map(|r| r.grade.trim()).collect();
        labels.sort_unstable();
        if let Some(w) = labels.windows(2).find(|w| w[0] == w[1]) {
            return Err(ExamError::validation_with(
                "duplicate grade label",
                json!({ "grade": w[0] }),
            ));
        }

        ranges.sort_by_key(|r| r.min_score);

        let mut expected_min = MIN_SCORE;
        for r in &ranges {
            if r.min_score > expected_min {
                return Err(ExamError::validation_with(
                    "grade ranges leave a gap",
                    json!({ "from": expected_min, "to": r.min_score - 1 }),
                ));
            }
            if r.min_score < expected_min {
                return Err(ExamError::validation_with(
                    "grade ranges overlap",
                    json!({ "grade": r.grade, "min": r.min_score }),
                ));
            }
            expected_min = r.max_score + 1;
        }
        if expected_min != MAX_SCORE + 1 {
            return Err(ExamError::validation_with(
                "grade ranges leave a gap",
                json!({ "from": expected_min, "to": MAX_SCORE }),
            ));
        }

        for r in ranges.iter_mut() {
            r.grade = r.grade.trim().to_string();
        }
        Ok(Self { ranges })
    }

    /// Ranges in ascending score order.
    pub fn ranges(&self) -> &[GradeRange] {
        &self.ranges
    }

    pub fn grade(&self, score: i64) -> ExamResult<&GradeRange> {
        check_score_bounds(score)?;
        self.ranges
            .iter()
            .find(|r| r.contains(score))
            .ok_or_else(|| {
                ExamError::Configuration(format!("no grade range covers score {score}"))
            })
    }

    /// Map rounded mean points back to a grade label: the range with the
    /// greatest point value not above `mean_points`; ties go to the higher
    /// score band. Falls back to the lowest-point range.
    pub fn mean_grade(&self, mean_points: i64) -> &GradeRange {
        let best = self
            .ranges
            .iter()
            .filter(|r| r.points <= mean_points)
            .max_by_key(|r| (r.points, r.min_score));
        match best {
            Some(r) => r,
            None => self
                .ranges
                .iter()
                .min_by_key(|r| (r.points, r.min_score))
                .unwrap_or(&self.ranges[0]),
        }
    }
}

fn check_score_bounds(score: i64) -> ExamResult<()> {
    if !(MIN_SCORE..=MAX_SCORE).contains(&score) {
        return Err(ExamError::validation_with(
            "score must be within [0,100]",
            json!({ "score": score }),
        ));
    }
    Ok(())
}

/// Parse a raw mark from request JSON. Only whole marks in [0,100] are accepted.
pub fn parse_score(value: Option<&serde_json::Value>) -> ExamResult<i64> {
    let Some(v) = value else {
        return Err(ExamError::validation("missing rawScore"));
    };
    let score = if let Some(i) = v.as_i64() {
        i
    } else if let Some(f) = v.as_f64() {
        if f.fract() != 0.0 || !f.is_finite() {
            return Err(ExamError::validation_with(
                "score must be a whole mark",
                json!({ "score": f }),
            ));
        }
        f as i64
    } else {
        return Err(ExamError::validation_with(
            "score must be a number",
            json!({ "score": v }),
        ));
    };
    check_score_bounds(score)?;
    Ok(score)
}

/// Mean points rounded half-up. Zero subjects yield zero.
pub fn mean_points(total_points: i64, subject_count: usize) -> i64 {
    if subject_count == 0 {
        return 0;
    }
    let n = subject_count as i64;
    (2 * total_points + n).div_euclid(2 * n)
}
