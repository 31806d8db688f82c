use crate::audit::{self, Activity, FraudKind, FraudReport};
use crate::db::now_rfc3339;
use crate::error::{ExamError, ExamResult};
use crate::identity::{self, IndexNumber};
use chrono::NaiveDate;
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use rusqlite::{Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExamLevel {
    #[serde(rename = "KEPSEA")]
    Kepsea,
    #[serde(rename = "KCPE")]
    Kcpe,
    #[serde(rename = "KCSE")]
    Kcse,
}

impl ExamLevel {
    pub fn parse(s: &str) -> ExamResult<Self> {
        match s.trim() {
            "KEPSEA" => Ok(ExamLevel::Kepsea),
            "KCPE" => Ok(ExamLevel::Kcpe),
            "KCSE" => Ok(ExamLevel::Kcse),
            other => Err(ExamError::validation_with(
                "level must be one of: KEPSEA, KCPE, KCSE",
                json!({ "level": other }),
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExamLevel::Kepsea => "KEPSEA",
            ExamLevel::Kcpe => "KCPE",
            ExamLevel::Kcse => "KCSE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchoolCategory {
    Primary,
    Jss,
    Senior,
    Mixed,
}

impl SchoolCategory {
    pub fn parse(s: &str) -> ExamResult<Self> {
        match s.trim() {
            "PRIMARY" => Ok(SchoolCategory::Primary),
            "JSS" => Ok(SchoolCategory::Jss),
            "SENIOR" => Ok(SchoolCategory::Senior),
            "MIXED" => Ok(SchoolCategory::Mixed),
            other => Err(ExamError::validation_with(
                "category must be one of: PRIMARY, JSS, SENIOR, MIXED",
                json!({ "category": other }),
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SchoolCategory::Primary => "PRIMARY",
            SchoolCategory::Jss => "JSS",
            SchoolCategory::Senior => "SENIOR",
            SchoolCategory::Mixed => "MIXED",
        }
    }

    pub fn can_register_for(self, level: ExamLevel) -> bool {
        match self {
            SchoolCategory::Primary => matches!(level, ExamLevel::Kepsea | ExamLevel::Kcpe),
            SchoolCategory::Jss => false,
            SchoolCategory::Senior => level == ExamLevel::Kcse,
            SchoolCategory::Mixed => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Academic years

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcademicYear {
    pub id: String,
    pub label: String,
    pub start_year: i32,
    pub start_date: String,
    pub end_date: String,
    pub is_active: bool,
}

fn year_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<AcademicYear> {
    Ok(AcademicYear {
        id: r.get(0)?,
        label: r.get(1)?,
        start_year: r.get(2)?,
        start_date: r.get(3)?,
        end_date: r.get(4)?,
        is_active: r.get::<_, i64>(5)? != 0,
    })
}

const YEAR_COLUMNS: &str = "id, label, start_year, start_date, end_date, is_active";

pub fn create_year(
    conn: &Connection,
    label: &str,
    start_date: &str,
    end_date: &str,
    active: bool,
    actor: Option<&str>,
) -> ExamResult<AcademicYear> {
    let start_year = identity::parse_academic_year(label)?;
    let start = identity::parse_date("startDate", start_date)?;
    let end = identity::parse_date("endDate", end_date)?;
    if end <= start {
        return Err(ExamError::validation("endDate must be after startDate"));
    }

    let id = Uuid::new_v4().to_string();
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    if active {
        tx.execute("UPDATE academic_years SET is_active = 0", [])?;
    }
    tx.execute(
        "INSERT INTO academic_years(id, label, start_year, start_date, end_date, is_active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            label.trim(),
            start_year,
            start.to_string(),
            end.to_string(),
            active as i64,
            now_rfc3339(),
        ),
    )?;
    audit::log_activity(
        &tx,
        actor,
        Activity::Create,
        &format!("academic year {} created", label.trim()),
        "academic_year",
        &id,
    )?;
    tx.commit()?;

    Ok(AcademicYear {
        id,
        label: label.trim().to_string(),
        start_year,
        start_date: start.to_string(),
        end_date: end.to_string(),
        is_active: active,
    })
}

pub fn list_years(conn: &Connection) -> ExamResult<Vec<AcademicYear>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {YEAR_COLUMNS} FROM academic_years ORDER BY label DESC"
    ))?;
    let rows = stmt
        .query_map([], year_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn resolve_year(conn: &Connection, label: &str) -> ExamResult<AcademicYear> {
    identity::parse_academic_year(label)?;
    conn.query_row(
        &format!("SELECT {YEAR_COLUMNS} FROM academic_years WHERE label = ?"),
        [label.trim()],
        year_from_row,
    )
    .optional()?
    .ok_or_else(|| ExamError::not_found("academic year", label))
}

pub fn activate_year(conn: &Connection, label: &str) -> ExamResult<AcademicYear> {
    let year = resolve_year(conn, label)?;
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    tx.execute("UPDATE academic_years SET is_active = 0", [])?;
    tx.execute(
        "UPDATE academic_years SET is_active = 1 WHERE id = ?",
        [&year.id],
    )?;
    tx.commit()?;
    tracing::info!(year = %year.label, "academic year activated");
    Ok(AcademicYear {
        is_active: true,
        ..year
    })
}

// ---------------------------------------------------------------------------
// Education levels and subjects

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EducationLevel {
    pub code: String,
    pub description: String,
    pub max_score: i64,
    pub is_active: bool,
}

pub fn list_levels(conn: &Connection) -> ExamResult<Vec<EducationLevel>> {
    let mut stmt = conn.prepare(
        "SELECT id, description, max_score, is_active FROM education_levels ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok(EducationLevel {
                code: r.get(0)?,
                description: r.get(1)?,
                max_score: r.get(2)?,
                is_active: r.get::<_, i64>(3)? != 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub id: String,
    pub code: String,
    pub name: String,
    pub level: String,
    pub is_compulsory: bool,
}

fn subject_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Subject> {
    Ok(Subject {
        id: r.get(0)?,
        code: r.get(1)?,
        name: r.get(2)?,
        level: r.get(3)?,
        is_compulsory: r.get::<_, i64>(4)? != 0,
    })
}

pub fn create_subject(
    conn: &Connection,
    code: &str,
    name: &str,
    level: ExamLevel,
    compulsory: bool,
) -> ExamResult<Subject> {
    let code = code.trim().to_ascii_uppercase();
    let name = name.trim();
    if code.is_empty() || code.len() > 10 {
        return Err(ExamError::validation("subject code must be 1-10 characters"));
    }
    if name.is_empty() {
        return Err(ExamError::validation("subject name must not be empty"));
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, code, name, level_id, is_compulsory) VALUES(?, ?, ?, ?, ?)",
        (&id, &code, name, level.as_str(), compulsory as i64),
    )?;
    Ok(Subject {
        id,
        code,
        name: name.to_string(),
        level: level.as_str().to_string(),
        is_compulsory: compulsory,
    })
}

pub fn list_subjects(conn: &Connection, level: Option<ExamLevel>) -> ExamResult<Vec<Subject>> {
    let mut sql =
        String::from("SELECT id, code, name, level_id, is_compulsory FROM subjects WHERE is_active = 1");
    let mut binds: Vec<Value> = Vec::new();
    if let Some(l) = level {
        sql.push_str(" AND level_id = ?");
        binds.push(Value::Text(l.as_str().to_string()));
    }
    sql.push_str(" ORDER BY level_id, code");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), subject_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn resolve_subject(conn: &Connection, code: &str) -> ExamResult<Subject> {
    conn.query_row(
        "SELECT id, code, name, level_id, is_compulsory FROM subjects WHERE code = ?",
        [code.trim().to_ascii_uppercase()],
        subject_from_row,
    )
    .optional()?
    .ok_or_else(|| ExamError::not_found("subject", code))
}

// ---------------------------------------------------------------------------
// Schools

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSchool {
    pub code: String,
    pub name: String,
    pub category: String,
    pub county: String,
    #[serde(default)]
    pub sub_county: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct School {
    pub id: String,
    pub code: String,
    pub name: String,
    pub category: String,
    pub county: String,
    pub sub_county: String,
}

fn school_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<School> {
    Ok(School {
        id: r.get(0)?,
        code: r.get(1)?,
        name: r.get(2)?,
        category: r.get(3)?,
        county: r.get(4)?,
        sub_county: r.get(5)?,
    })
}

const SCHOOL_COLUMNS: &str = "id, code, name, category, county, sub_county";

pub fn create_school(conn: &Connection, new: &NewSchool, actor: Option<&str>) -> ExamResult<School> {
    let code = identity::validate_school_code(&new.code)?;
    let category = SchoolCategory::parse(&new.category)?;
    let name = new.name.trim();
    let county = new.county.trim();
    if name.is_empty() {
        return Err(ExamError::validation("school name must not be empty"));
    }
    if county.is_empty() {
        return Err(ExamError::validation("county must not be empty"));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO schools(id, code, name, category, county, sub_county, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &code,
            name,
            category.as_str(),
            county,
            new.sub_county.trim(),
            now_rfc3339(),
        ),
    )?;
    audit::log_activity(
        conn,
        actor,
        Activity::Create,
        &format!("school {code} registered"),
        "school",
        &id,
    )?;
    Ok(School {
        id,
        code,
        name: name.to_string(),
        category: category.as_str().to_string(),
        county: county.to_string(),
        sub_county: new.sub_county.trim().to_string(),
    })
}

pub fn list_schools(conn: &Connection, county: Option<&str>) -> ExamResult<Vec<School>> {
    let mut sql = format!("SELECT {SCHOOL_COLUMNS} FROM schools WHERE is_active = 1");
    let mut binds: Vec<Value> = Vec::new();
    if let Some(c) = county {
        sql.push_str(" AND county = ?");
        binds.push(Value::Text(c.trim().to_string()));
    }
    sql.push_str(" ORDER BY name");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), school_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn resolve_school(conn: &Connection, code: &str) -> ExamResult<School> {
    conn.query_row(
        &format!("SELECT {SCHOOL_COLUMNS} FROM schools WHERE code = ?"),
        [code.trim()],
        school_from_row,
    )
    .optional()?
    .ok_or_else(|| ExamError::not_found("school", code))
}

// ---------------------------------------------------------------------------
// Birth certificate registry

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCertificate {
    pub certificate_number: String,
    pub first_name: String,
    #[serde(default)]
    pub middle_name: String,
    pub last_name: String,
    pub date_of_birth: String,
    pub place_of_birth: String,
    pub parent_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BirthCertificate {
    pub certificate_number: String,
    pub full_name: String,
    pub date_of_birth: String,
    pub place_of_birth: String,
    pub parent_name: String,
    pub is_verified: bool,
}

pub fn register_certificate(conn: &Connection, new: &NewCertificate) -> ExamResult<BirthCertificate> {
    let number = identity::validate_certificate_number(&new.certificate_number)?;
    let dob = identity::parse_date("dateOfBirth", &new.date_of_birth)?;
    if new.first_name.trim().is_empty() || new.last_name.trim().is_empty() {
        return Err(ExamError::validation("first and last name are required"));
    }
    conn.execute(
        "INSERT INTO birth_certificates(
            number, first_name, middle_name, last_name, date_of_birth, place_of_birth,
            parent_name, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &number,
            new.first_name.trim(),
            new.middle_name.trim(),
            new.last_name.trim(),
            dob.to_string(),
            new.place_of_birth.trim(),
            new.parent_name.trim(),
            now_rfc3339(),
        ),
    )?;
    Ok(BirthCertificate {
        certificate_number: number,
        full_name: full_name(&new.first_name, &new.middle_name, &new.last_name),
        date_of_birth: dob.to_string(),
        place_of_birth: new.place_of_birth.trim().to_string(),
        parent_name: new.parent_name.trim().to_string(),
        is_verified: false,
    })
}

pub fn verify_certificate(conn: &Connection, number: &str) -> ExamResult<()> {
    let number = identity::validate_certificate_number(number)?;
    let n = conn.execute(
        "UPDATE birth_certificates SET is_verified = 1 WHERE number = ?",
        [&number],
    )?;
    if n == 0 {
        return Err(ExamError::not_found("birth certificate", number));
    }
    // Candidates already linked inherit the verification.
    conn.execute(
        "UPDATE candidates SET is_cert_verified = 1 WHERE certificate_number = ?",
        [&number],
    )?;
    Ok(())
}

fn full_name(first: &str, middle: &str, last: &str) -> String {
    [first.trim(), middle.trim(), last.trim()]
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

// ---------------------------------------------------------------------------
// Candidates

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCandidate {
    pub school_code: String,
    pub level: String,
    pub year: String,
    pub first_name: String,
    #[serde(default)]
    pub middle_name: String,
    pub last_name: String,
    pub gender: String,
    pub date_of_birth: String,
    #[serde(default)]
    pub certificate_number: Option<String>,
    #[serde(default)]
    pub phone: String,
    pub guardian_phone: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub id: String,
    pub index_number: String,
    pub school_id: String,
    pub school_code: String,
    pub school_name: String,
    pub county: String,
    pub level: String,
    pub year_id: String,
    pub year: String,
    pub full_name: String,
    pub gender: String,
    pub date_of_birth: String,
    pub certificate_number: Option<String>,
    pub is_cert_verified: bool,
    pub guardian_phone: String,
    pub is_active: bool,
}

const CANDIDATE_SELECT: &str = "SELECT
    c.id, c.index_number, c.school_id, s.code, s.name, s.county, c.level_id,
    c.year_id, y.label, c.first_name, c.middle_name, c.last_name, c.gender,
    c.date_of_birth, c.certificate_number, c.is_cert_verified, c.guardian_phone,
    c.is_active
  FROM candidates c
  JOIN schools s ON s.id = c.school_id
  JOIN academic_years y ON y.id = c.year_id";

fn candidate_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Candidate> {
    let first: String = r.get(9)?;
    let middle: String = r.get(10)?;
    let last: String = r.get(11)?;
    Ok(Candidate {
        id: r.get(0)?,
        index_number: r.get(1)?,
        school_id: r.get(2)?,
        school_code: r.get(3)?,
        school_name: r.get(4)?,
        county: r.get(5)?,
        level: r.get(6)?,
        year_id: r.get(7)?,
        year: r.get(8)?,
        full_name: full_name(&first, &middle, &last),
        gender: r.get(12)?,
        date_of_birth: r.get(13)?,
        certificate_number: r.get(14)?,
        is_cert_verified: r.get::<_, i64>(15)? != 0,
        guardian_phone: r.get(16)?,
        is_active: r.get::<_, i64>(17)? != 0,
    })
}

/// Register a candidate and allocate the next index number for the school
/// and year.
///
/// Sequence allocation and the certificate link happen inside one immediate
/// transaction, so two registrations can never observe the same sequence or
/// both link the same certificate. A certificate already linked within the
/// same level is refused and recorded as a fraud attempt; the refused
/// registration consumes no sequence number.
pub fn register_candidate(
    conn: &Connection,
    new: &NewCandidate,
    actor: Option<&str>,
) -> ExamResult<Candidate> {
    let level = ExamLevel::parse(&new.level)?;
    let school = resolve_school(conn, &new.school_code)?;
    let category = SchoolCategory::parse(&school.category)?;
    if !category.can_register_for(level) {
        return Err(ExamError::validation_with(
            format!(
                "{} schools cannot register {} candidates",
                category.as_str(),
                level.as_str()
            ),
            json!({ "schoolCode": school.code, "level": level.as_str() }),
        ));
    }
    let year = resolve_year(conn, &new.year)?;

    if new.first_name.trim().is_empty() || new.last_name.trim().is_empty() {
        return Err(ExamError::validation("first and last name are required"));
    }
    let gender = match new.gender.trim() {
        "M" | "F" => new.gender.trim().to_string(),
        other => {
            return Err(ExamError::validation_with(
                "gender must be M or F",
                json!({ "gender": other }),
            ))
        }
    };
    let dob = identity::parse_date("dateOfBirth", &new.date_of_birth)?;
    let guardian_phone = identity::validate_phone(&new.guardian_phone)?;
    let phone = if new.phone.trim().is_empty() {
        String::new()
    } else {
        identity::validate_phone(&new.phone)?
    };

    let year_start = NaiveDate::parse_from_str(&year.start_date, "%Y-%m-%d")
        .map_err(|_| ExamError::Database("stored academic year start date is invalid".into()))?;
    if dob >= year_start {
        return Err(ExamError::validation("dateOfBirth must precede the academic year"));
    }
    let minor = identity::age_on(dob, year_start) < identity::ADULT_AGE;

    let certificate = match new.certificate_number.as_deref().map(str::trim) {
        Some(n) if !n.is_empty() => Some(identity::validate_certificate_number(n)?),
        _ => None,
    };
    if minor && certificate.is_none() {
        return Err(ExamError::validation(
            "a birth certificate number is required for candidates under 18",
        ));
    }

    let mut cert_verified = false;
    if let Some(number) = &certificate {
        let record: Option<(String, i64)> = conn
            .query_row(
                "SELECT date_of_birth, is_verified FROM birth_certificates WHERE number = ?",
                [number],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((cert_dob, verified)) = record else {
            return Err(ExamError::not_found("birth certificate", number.as_str()));
        };
        if cert_dob != dob.to_string() {
            return Err(ExamError::validation_with(
                "dateOfBirth does not match the birth certificate",
                json!({ "certificateNumber": number }),
            ));
        }
        cert_verified = verified != 0;
    }

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;

    if let Some(number) = &certificate {
        let linked: Option<String> = tx
            .query_row(
                "SELECT c.index_number
                 FROM certificate_links l
                 JOIN candidates c ON c.id = l.candidate_id
                 WHERE l.certificate_number = ? AND l.level_id = ?",
                (number, level.as_str()),
                |r| r.get(0),
            )
            .optional()?;
        if let Some(existing) = linked {
            tx.rollback()?;
            let report = FraudReport::new(
                FraudKind::DuplicateBirthCert,
                format!(
                    "birth certificate {number} is already linked to {existing} for {}",
                    level.as_str()
                ),
            )
            .actor(actor)
            .certificate_number(number)
            .index_number(&existing)
            .phone(&guardian_phone);
            return Err(audit::reject_as_fraud(conn, &report));
        }
    }

    let last_seq: Option<i64> = tx
        .query_row(
            "SELECT last_seq FROM index_sequences WHERE school_id = ? AND year_id = ?",
            (&school.id, &year.id),
            |r| r.get(0),
        )
        .optional()?;
    let sequence = last_seq.unwrap_or(0) + 1;
    tx.execute(
        "INSERT INTO index_sequences(school_id, year_id, last_seq) VALUES(?, ?, ?)
         ON CONFLICT(school_id, year_id) DO UPDATE SET last_seq = excluded.last_seq",
        (&school.id, &year.id, sequence),
    )?;
    let sequence = u32::try_from(sequence)
        .map_err(|_| ExamError::Conflict("index sequence exhausted".into()))?;
    let index_number = IndexNumber::new(&school.code, year.start_year, sequence).to_string();

    let id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO candidates(
            id, index_number, school_id, level_id, year_id, first_name, middle_name,
            last_name, gender, date_of_birth, certificate_number, is_cert_verified, phone,
            guardian_phone, registered_by, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &id,
            &index_number,
            &school.id,
            level.as_str(),
            &year.id,
            new.first_name.trim(),
            new.middle_name.trim(),
            new.last_name.trim(),
            &gender,
            dob.to_string(),
            certificate.as_deref(),
            cert_verified as i64,
            &phone,
            &guardian_phone,
            actor,
            now_rfc3339(),
        ],
    )?;
    if let Some(number) = &certificate {
        tx.execute(
            "INSERT INTO certificate_links(certificate_number, level_id, candidate_id, linked_at)
             VALUES(?, ?, ?, ?)",
            (number, level.as_str(), &id, now_rfc3339()),
        )?;
    }
    audit::log_activity(
        &tx,
        actor,
        Activity::Create,
        &format!("candidate {index_number} registered"),
        "candidate",
        &id,
    )?;
    tx.commit()?;

    tracing::info!(
        index_number = %index_number,
        school = %school.code,
        level = level.as_str(),
        "candidate registered"
    );

    Ok(Candidate {
        id,
        index_number,
        school_id: school.id,
        school_code: school.code,
        school_name: school.name,
        county: school.county,
        level: level.as_str().to_string(),
        year_id: year.id,
        year: year.label,
        full_name: full_name(&new.first_name, &new.middle_name, &new.last_name),
        gender,
        date_of_birth: dob.to_string(),
        certificate_number: certificate,
        is_cert_verified: cert_verified,
        guardian_phone,
        is_active: true,
    })
}

/// Look up a candidate by index number. Malformed numbers fail validation
/// before touching the database.
pub fn find_candidate(conn: &Connection, index_number: &str) -> ExamResult<Option<Candidate>> {
    let parsed = IndexNumber::parse(index_number)?;
    let found = conn
        .query_row(
            &format!("{CANDIDATE_SELECT} WHERE c.index_number = ?"),
            [parsed.to_string()],
            candidate_from_row,
        )
        .optional()?;
    Ok(found)
}

pub fn get_candidate(conn: &Connection, index_number: &str) -> ExamResult<Candidate> {
    find_candidate(conn, index_number)?
        .ok_or_else(|| ExamError::not_found("candidate", index_number))
}

/// Like [`get_candidate`], but an unknown well-formed index number from an
/// outside caller is recorded as a fake-index attempt.
pub fn get_candidate_guarded(
    conn: &Connection,
    index_number: &str,
    actor: Option<&str>,
    ip_address: Option<&str>,
) -> ExamResult<Candidate> {
    match find_candidate(conn, index_number)? {
        Some(c) => Ok(c),
        None => {
            let report = FraudReport::new(
                FraudKind::FakeIndex,
                format!("lookup of unregistered index number {}", index_number.trim()),
            )
            .actor(actor)
            .index_number(index_number.trim())
            .ip_address(ip_address);
            Err(audit::reject_as_fraud(conn, &report))
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateFilter {
    pub school_code: Option<String>,
    pub level: Option<String>,
    pub year: Option<String>,
    pub limit: Option<i64>,
}

pub fn list_candidates(conn: &Connection, filter: &CandidateFilter) -> ExamResult<Vec<Candidate>> {
    let mut sql = format!("{CANDIDATE_SELECT} WHERE 1 = 1");
    let mut binds: Vec<Value> = Vec::new();
    if let Some(code) = &filter.school_code {
        sql.push_str(" AND s.code = ?");
        binds.push(Value::Text(code.trim().to_string()));
    }
    if let Some(level) = &filter.level {
        sql.push_str(" AND c.level_id = ?");
        binds.push(Value::Text(ExamLevel::parse(level)?.as_str().to_string()));
    }
    if let Some(year) = &filter.year {
        sql.push_str(" AND y.label = ?");
        binds.push(Value::Text(year.trim().to_string()));
    }
    sql.push_str(" ORDER BY c.index_number LIMIT ?");
    binds.push(Value::Integer(filter.limit.unwrap_or(5000).clamp(1, 50_000)));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), candidate_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
