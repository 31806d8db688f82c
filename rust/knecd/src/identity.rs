use crate::error::{ExamError, ExamResult};
use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use serde_json::json;

pub const ADULT_AGE: i32 = 18;
const SEQUENCE_WIDTH: usize = 4;

/// School codes are upper-case letters, digits and dashes.
pub fn validate_school_code(raw: &str) -> ExamResult<String> {
    let code = raw.trim();
    let ok = !code.is_empty()
        && code.len() <= 20
        && code
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-');
    if !ok {
        return Err(ExamError::validation_with(
            "school code must be 1-20 characters of A-Z, 0-9 or '-'",
            json!({ "schoolCode": raw }),
        ));
    }
    Ok(code.to_string())
}

/// Birth certificate numbers are digits only.
pub fn validate_certificate_number(raw: &str) -> ExamResult<String> {
    let n = raw.trim();
    if n.is_empty() || n.len() > 20 || !n.chars().all(|c| c.is_ascii_digit()) {
        return Err(ExamError::validation_with(
            "birth certificate number must be 1-20 digits",
            json!({ "certificateNumber": raw }),
        ));
    }
    Ok(n.to_string())
}

pub fn validate_phone(raw: &str) -> ExamResult<String> {
    let p = raw.trim();
    let digits = p.strip_prefix('+').unwrap_or(p);
    if digits.len() < 9 || digits.len() > 15 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ExamError::validation_with(
            "phone number must be 9-15 digits",
            json!({ "phoneNumber": raw }),
        ));
    }
    Ok(p.to_string())
}

/// `2024/2025` -> 2024. The second year must follow the first.
pub fn parse_academic_year(label: &str) -> ExamResult<i32> {
    let bad = || {
        ExamError::validation_with(
            "academic year must look like 2024/2025",
            json!({ "year": label }),
        )
    };
    let (a, b) = label.trim().split_once('/').ok_or_else(bad)?;
    if a.len() != 4 || b.len() != 4 {
        return Err(bad());
    }
    let start: i32 = a.parse().map_err(|_| bad())?;
    let end: i32 = b.parse().map_err(|_| bad())?;
    if end != start + 1 {
        return Err(bad());
    }
    Ok(start)
}

pub fn parse_date(field: &str, raw: &str) -> ExamResult<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
        ExamError::validation_with(
            format!("{field} must be a YYYY-MM-DD date"),
            json!({ field: raw }),
        )
    })
}

/// Completed years between `dob` and `on`.
pub fn age_on(dob: NaiveDate, on: NaiveDate) -> i32 {
    let mut age = on.year() - dob.year();
    if (on.month(), on.day()) < (dob.month(), dob.day()) {
        age -= 1;
    }
    age
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexNumber {
    pub school_code: String,
    pub year: i32,
    pub sequence: u32,
}

impl IndexNumber {
    pub fn new(school_code: &str, year: i32, sequence: u32) -> Self {
        Self {
            school_code: school_code.to_string(),
            year,
            sequence,
        }
    }

    /// Parse `{SCHOOL}-{YYYY}-{SEQ}`. School codes may themselves contain
    /// dashes, so the year and sequence are taken from the right.
    pub fn parse(raw: &str) -> ExamResult<Self> {
        let s = raw.trim();
        let malformed = |reason: &str| {
            ExamError::validation_with(
                format!("malformed index number: {reason}"),
                json!({ "indexNumber": raw }),
            )
        };

        let mut parts = s.rsplitn(3, '-');
        let seq = parts.next().unwrap_or("");
        let year = parts.next().ok_or_else(|| malformed("missing year"))?;
        let school = parts.next().ok_or_else(|| malformed("missing school code"))?;

        if seq.len() < SEQUENCE_WIDTH || !seq.chars().all(|c| c.is_ascii_digit()) {
            return Err(malformed("sequence must be at least 4 digits"));
        }
        if year.len() != 4 || !year.chars().all(|c| c.is_ascii_digit()) {
            return Err(malformed("year must be 4 digits"));
        }
        let school_code =
            validate_school_code(school).map_err(|_| malformed("invalid school code"))?;
        let sequence: u32 = seq.parse().map_err(|_| malformed("sequence too large"))?;
        if sequence == 0 {
            return Err(malformed("sequence starts at 1"));
        }
        let year: i32 = year.parse().map_err(|_| malformed("year must be 4 digits"))?;

        Ok(Self {
            school_code,
            year,
            sequence,
        })
    }
}

impl std::fmt::Display for IndexNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}-{:0width$}",
            self.school_code,
            self.year,
            self.sequence,
            width = SEQUENCE_WIDTH
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_and_parses_index_numbers() {
        let n = IndexNumber::new("NRB-001", 2024, 7);
        assert_eq!(n.to_string(), "NRB-001-2024-0007");
        assert_eq!(IndexNumber::parse("NRB-001-2024-0007").expect("parse"), n);

        let wide = IndexNumber::new("K1", 2024, 12345);
        assert_eq!(wide.to_string(), "K1-2024-12345");
        assert_eq!(IndexNumber::parse(&wide.to_string()).expect("parse"), wide);
    }

    #[test]
    fn rejects_malformed_index_numbers() {
        for bad in [
            "",
            "NRB0012024",
            "NRB-24-0001",
            "NRB-2024-01",
            "nrb-2024-0001",
            "NRB-2024-000A",
            "-2024-0001",
            "NRB-2024-0000",
        ] {
            let e = IndexNumber::parse(bad).expect_err(bad);
            assert_eq!(e.code(), "validation_failed", "{bad}");
        }
    }

    #[test]
    fn academic_year_labels() {
        assert_eq!(parse_academic_year("2024/2025").expect("ok"), 2024);
        assert!(parse_academic_year("2024/2026").is_err());
        assert!(parse_academic_year("2024").is_err());
        assert!(parse_academic_year("24/25").is_err());
    }

    #[test]
    fn school_codes_and_certificates() {
        assert_eq!(validate_school_code(" KCS-01 ").expect("ok"), "KCS-01");
        assert!(validate_school_code("kcs01").is_err());
        assert!(validate_school_code("").is_err());
        assert_eq!(validate_certificate_number("0012345").expect("ok"), "0012345");
        assert!(validate_certificate_number("12A45").is_err());
    }

    #[test]
    fn age_counts_completed_years() {
        let dob = NaiveDate::from_ymd_opt(2010, 6, 15).expect("date");
        let before = NaiveDate::from_ymd_opt(2024, 6, 14).expect("date");
        let on = NaiveDate::from_ymd_opt(2024, 6, 15).expect("date");
        assert_eq!(age_on(dob, before), 13);
        assert_eq!(age_on(dob, on), 14);
    }
}
