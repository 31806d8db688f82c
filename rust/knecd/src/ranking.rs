use crate::identity::IndexNumber;
use serde::Serialize;
use std::cmp::{Ordering, Reverse};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct RankEntry {
    pub candidate_id: String,
    pub index_number: String,
    pub school_id: String,
    pub county: String,
    pub total_points: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Positions {
    pub school: i64,
    pub county: i64,
    pub nation: i64,
}

/// Tie-break key: school code, year, then the numeric sequence, so
/// `X-2024-9999` sorts before `X-2024-10000`. The raw text keeps the order
/// total for anything that does not parse.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct IndexKey {
    school_code: String,
    year: i32,
    sequence: u32,
    raw: String,
}

impl IndexKey {
    fn of(raw: &str) -> Self {
        match IndexNumber::parse(raw) {
            Ok(n) => IndexKey {
                school_code: n.school_code,
                year: n.year,
                sequence: n.sequence,
                raw: raw.to_string(),
            },
            Err(_) => IndexKey {
                school_code: raw.to_string(),
                year: 0,
                sequence: 0,
                raw: raw.to_string(),
            },
        }
    }
}

/// Ordinal positions (1..n, no shared places) for a whole cohort within each
/// candidate's school, county and the nation.
pub fn rank_cohort(entries: &[RankEntry]) -> HashMap<String, Positions> {
    let mut order: Vec<&RankEntry> = entries.iter().collect();
    // Total points descending, then index number in sequence order.
    order.sort_by_cached_key(|e| (Reverse(e.total_points), IndexKey::of(&e.index_number)));

    let mut by_school: HashMap<&str, i64> = HashMap::new();
    let mut by_county: HashMap<&str, i64> = HashMap::new();
    let mut out = HashMap::with_capacity(order.len());

    for (i, e) in order.iter().enumerate() {
        let school = by_school.entry(e.school_id.as_str()).or_insert(0);
        *school += 1;
        let county = by_county.entry(e.county.as_str()).or_insert(0);
        *county += 1;
        out.insert(
            e.candidate_id.clone(),
            Positions {
                school: *school,
                county: *county,
                nation: (i as i64) + 1,
            },
        );
    }
    out
}

#[derive(Debug, Clone)]
pub struct SchoolScore {
    pub school_id: String,
    pub school_code: String,
    pub county: String,
    pub mean_points: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchoolPositions {
    pub county: i64,
    pub nation: i64,
}

/// Rank schools by mean points descending; school code breaks ties.
pub fn rank_schools(scores: &[SchoolScore]) -> HashMap<String, SchoolPositions> {
    let mut order: Vec<&SchoolScore> = scores.iter().collect();
    order.sort_by(|a, b| {
        b.mean_points
            .partial_cmp(&a.mean_points)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.school_code.cmp(&b.school_code))
    });

    let mut by_county: HashMap<&str, i64> = HashMap::new();
    let mut out = HashMap::with_capacity(order.len());
    for (i, s) in order.iter().enumerate() {
        let county = by_county.entry(s.county.as_str()).or_insert(0);
        *county += 1;
        out.insert(
            s.school_id.clone(),
            SchoolPositions {
                county: *county,
                nation: (i as i64) + 1,
            },
        );
    }
    out
}
