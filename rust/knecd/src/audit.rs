use crate::db::now_rfc3339;
use crate::error::{ExamError, ExamResult};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

pub const LIST_MAX_LIMIT: i64 = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FraudKind {
    DuplicateBirthCert,
    MultiplePayment,
    FakeIndex,
    UnauthorizedAccess,
    MarksTampering,
    Other,
}

impl FraudKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FraudKind::DuplicateBirthCert => "DUPLICATE_BIRTH_CERT",
            FraudKind::MultiplePayment => "MULTIPLE_PAYMENT",
            FraudKind::FakeIndex => "FAKE_INDEX",
            FraudKind::UnauthorizedAccess => "UNAUTHORIZED_ACCESS",
            FraudKind::MarksTampering => "MARKS_TAMPERING",
            FraudKind::Other => "OTHER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DUPLICATE_BIRTH_CERT" => Some(FraudKind::DuplicateBirthCert),
            "MULTIPLE_PAYMENT" => Some(FraudKind::MultiplePayment),
            "FAKE_INDEX" => Some(FraudKind::FakeIndex),
            "UNAUTHORIZED_ACCESS" => Some(FraudKind::UnauthorizedAccess),
            "MARKS_TAMPERING" => Some(FraudKind::MarksTampering),
            "OTHER" => Some(FraudKind::Other),
            _ => None,
        }
    }
}

/// A fraud attempt about to be recorded. Empty strings mean "not known".
#[derive(Debug, Clone)]
pub struct FraudReport {
    pub kind: FraudKind,
    pub actor: Option<String>,
    pub index_number: String,
    pub certificate_number: String,
    pub phone: String,
    pub ip_address: String,
    pub description: String,
}

impl FraudReport {
    pub fn new(kind: FraudKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            actor: None,
            index_number: String::new(),
            certificate_number: String::new(),
            phone: String::new(),
            ip_address: String::new(),
            description: description.into(),
        }
    }

    pub fn actor(mut self, actor: Option<&str>) -> Self {
        self.actor = actor.map(str::to_string);
        self
    }

    pub fn index_number(mut self, v: &str) -> Self {
        self.index_number = v.to_string();
        self
    }

    pub fn certificate_number(mut self, v: &str) -> Self {
        self.certificate_number = v.to_string();
        self
    }

    pub fn phone(mut self, v: &str) -> Self {
        self.phone = v.to_string();
        self
    }

    pub fn ip_address(mut self, v: Option<&str>) -> Self {
        self.ip_address = v.unwrap_or("").to_string();
        self
    }
}

pub fn record_fraud(conn: &Connection, report: &FraudReport) -> ExamResult<String> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO fraud_attempts(
            id, attempt_type, actor, index_number, certificate_number, phone,
            ip_address, description, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            report.kind.as_str(),
            report.actor.as_deref(),
            &report.index_number,
            &report.certificate_number,
            &report.phone,
            &report.ip_address,
            &report.description,
            now_rfc3339(),
        ),
    )?;
    tracing::warn!(
        fraud_id = %id,
        kind = report.kind.as_str(),
        actor = report.actor.as_deref().unwrap_or("-"),
        "fraud attempt recorded: {}",
        report.description
    );
    Ok(id)
}

/// Record the attempt and build the error returned to the caller.
pub fn reject_as_fraud(conn: &Connection, report: &FraudReport) -> ExamError {
    match record_fraud(conn, report) {
        Ok(fraud_id) => ExamError::Fraud {
            reason: report.description.clone(),
            fraud_id,
        },
        Err(e) => e,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FraudAttempt {
    pub id: String,
    pub attempt_type: String,
    pub actor: Option<String>,
    pub index_number: String,
    pub certificate_number: String,
    pub phone: String,
    pub ip_address: String,
    pub description: String,
    pub is_resolved: bool,
    pub resolved_by: Option<String>,
    pub resolution_notes: String,
    pub resolved_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct FraudFilter {
    pub unresolved_only: bool,
    pub kind: Option<FraudKind>,
    pub limit: Option<i64>,
}

pub fn list_fraud(conn: &Connection, filter: &FraudFilter) -> ExamResult<Vec<FraudAttempt>> {
    let mut sql = String::from(
        "SELECT id, attempt_type, actor, index_number, certificate_number, phone, ip_address,
                description, is_resolved, resolved_by, resolution_notes, resolved_at, created_at
         FROM fraud_attempts WHERE 1 = 1",
    );
    let mut binds: Vec<Value> = Vec::new();
    if filter.unresolved_only {
        sql.push_str(" AND is_resolved = 0");
    }
    if let Some(kind) = filter.kind {
        sql.push_str(" AND attempt_type = ?");
        binds.push(Value::Text(kind.as_str().to_string()));
    }
    sql.push_str(" ORDER BY created_at DESC, rowid DESC LIMIT ?");
    binds.push(Value::Integer(
        filter.limit.unwrap_or(200).clamp(1, LIST_MAX_LIMIT),
    ));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(FraudAttempt {
                id: r.get(0)?,
                attempt_type: r.get(1)?,
                actor: r.get(2)?,
                index_number: r.get(3)?,
                certificate_number: r.get(4)?,
                phone: r.get(5)?,
                ip_address: r.get(6)?,
                description: r.get(7)?,
                is_resolved: r.get::<_, i64>(8)? != 0,
                resolved_by: r.get(9)?,
                resolution_notes: r.get(10)?,
                resolved_at: r.get(11)?,
                created_at: r.get(12)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn resolve_fraud(conn: &Connection, id: &str, actor: &str, notes: &str) -> ExamResult<()> {
    let resolved: Option<i64> = conn
        .query_row(
            "SELECT is_resolved FROM fraud_attempts WHERE id = ?",
            [id],
            |r| r.get(0),
        )
        .optional()?;
    match resolved {
        None => return Err(ExamError::not_found("fraud attempt", id)),
        Some(1) => return Err(ExamError::Conflict("fraud attempt already resolved".into())),
        Some(_) => {}
    }
    conn.execute(
        "UPDATE fraud_attempts
         SET is_resolved = 1, resolved_by = ?, resolution_notes = ?, resolved_at = ?
         WHERE id = ?",
        (actor, notes, now_rfc3339(), id),
    )?;
    tracing::info!(fraud_id = id, actor, "fraud attempt resolved");
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activity {
    Create,
    Update,
    MarksEntry,
    ResultRelease,
    Export,
    Payment,
    ResultAccess,
}

impl Activity {
    pub fn as_str(self) -> &'static str {
        match self {
            Activity::Create => "CREATE",
            Activity::Update => "UPDATE",
            Activity::MarksEntry => "MARKS_ENTRY",
            Activity::ResultRelease => "RESULT_RELEASE",
            Activity::Export => "EXPORT",
            Activity::Payment => "PAYMENT",
            Activity::ResultAccess => "RESULT_ACCESS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATE" => Some(Activity::Create),
            "UPDATE" => Some(Activity::Update),
            "MARKS_ENTRY" => Some(Activity::MarksEntry),
            "RESULT_RELEASE" => Some(Activity::ResultRelease),
            "EXPORT" => Some(Activity::Export),
            "PAYMENT" => Some(Activity::Payment),
            "RESULT_ACCESS" => Some(Activity::ResultAccess),
            _ => None,
        }
    }
}

pub fn log_activity(
    conn: &Connection,
    actor: Option<&str>,
    action: Activity,
    description: &str,
    object_type: &str,
    object_id: &str,
) -> ExamResult<()> {
    conn.execute(
        "INSERT INTO activity_log(id, actor, action, description, object_type, object_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            actor,
            action.as_str(),
            description,
            object_type,
            object_id,
            now_rfc3339(),
        ),
    )?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub id: String,
    pub actor: Option<String>,
    pub action: String,
    pub description: String,
    pub object_type: String,
    pub object_id: String,
    pub created_at: String,
}

pub fn list_activity(
    conn: &Connection,
    actor: Option<&str>,
    action: Option<Activity>,
    limit: Option<i64>,
) -> ExamResult<Vec<ActivityEntry>> {
    let mut sql = String::from(
        "SELECT id, actor, action, description, object_type, object_id, created_at
         FROM activity_log WHERE 1 = 1",
    );
    let mut binds: Vec<Value> = Vec::new();
    if let Some(a) = actor {
        sql.push_str(" AND actor = ?");
        binds.push(Value::Text(a.to_string()));
    }
    if let Some(a) = action {
        sql.push_str(" AND action = ?");
        binds.push(Value::Text(a.as_str().to_string()));
    }
    sql.push_str(" ORDER BY created_at DESC, rowid DESC LIMIT ?");
    binds.push(Value::Integer(limit.unwrap_or(200).clamp(1, LIST_MAX_LIMIT)));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(ActivityEntry {
                id: r.get(0)?,
                actor: r.get(1)?,
                action: r.get(2)?,
                description: r.get(3)?,
                object_type: r.get(4)?,
                object_id: r.get(5)?,
                created_at: r.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
