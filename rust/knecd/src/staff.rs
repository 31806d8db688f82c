use crate::audit::{self, Activity};
use crate::db::now_rfc3339;
use crate::error::{ExamError, ExamResult};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use rusqlite::{Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StaffRole {
    Admin,
    KnecStaff,
    MarksEntry,
    SchoolAdmin,
    SchoolStaff,
}

impl StaffRole {
    pub fn as_str(self) -> &'static str {
        match self {
            StaffRole::Admin => "ADMIN",
            StaffRole::KnecStaff => "KNEC_STAFF",
            StaffRole::MarksEntry => "MARKS_ENTRY",
            StaffRole::SchoolAdmin => "SCHOOL_ADMIN",
            StaffRole::SchoolStaff => "SCHOOL_STAFF",
        }
    }

    pub fn parse(s: &str) -> ExamResult<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ADMIN" => Ok(StaffRole::Admin),
            "KNEC_STAFF" => Ok(StaffRole::KnecStaff),
            "MARKS_ENTRY" => Ok(StaffRole::MarksEntry),
            "SCHOOL_ADMIN" => Ok(StaffRole::SchoolAdmin),
            "SCHOOL_STAFF" => Ok(StaffRole::SchoolStaff),
            other => Err(ExamError::validation(format!("unknown staff role: {other}"))),
        }
    }
}

/// Roles allowed to publish schemes, grant entry permissions and release results.
pub const EXAM_OFFICERS: &[StaffRole] = &[StaffRole::Admin, StaffRole::KnecStaff];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewStaff {
    pub actor: String,
    pub full_name: String,
    pub role: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffMember {
    pub actor: String,
    pub full_name: String,
    pub role: String,
    pub is_active: bool,
    pub created_at: String,
}

const STAFF_COLUMNS: &str = "actor, full_name, role, is_active, created_at";

fn staff_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<StaffMember> {
    Ok(StaffMember {
        actor: r.get(0)?,
        full_name: r.get(1)?,
        role: r.get(2)?,
        is_active: r.get::<_, i64>(3)? != 0,
        created_at: r.get(4)?,
    })
}

/// Registers a staff account. An empty workspace accepts one ADMIN with no
/// registrar; after that only an active ADMIN may register staff.
pub fn register_staff(
    conn: &Connection,
    new: &NewStaff,
    registered_by: Option<&str>,
) -> ExamResult<StaffMember> {
    let actor = new.actor.trim();
    let full_name = new.full_name.trim();
    if actor.is_empty() {
        return Err(ExamError::validation("staff actor must not be empty"));
    }
    if full_name.is_empty() {
        return Err(ExamError::validation("staff name must not be empty"));
    }
    let role = StaffRole::parse(&new.role)?;

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let existing: i64 = tx.query_row("SELECT COUNT(*) FROM staff", [], |r| r.get(0))?;
    if existing == 0 {
        if role != StaffRole::Admin {
            return Err(ExamError::validation(
                "the first staff account must be an ADMIN",
            ));
        }
    } else {
        require_role(&tx, registered_by, &[StaffRole::Admin], "register staff")?;
    }

    let created_at = now_rfc3339();
    tx.execute(
        "INSERT INTO staff(actor, full_name, role, is_active, created_by, created_at)
         VALUES(?, ?, ?, 1, ?, ?)",
        (actor, full_name, role.as_str(), registered_by, &created_at),
    )?;
    audit::log_activity(
        &tx,
        registered_by,
        Activity::Create,
        &format!("staff {actor} registered as {}", role.as_str()),
        "staff",
        actor,
    )?;
    tx.commit()?;
    tracing::info!(actor, role = role.as_str(), "staff registered");

    Ok(StaffMember {
        actor: actor.to_string(),
        full_name: full_name.to_string(),
        role: role.as_str().to_string(),
        is_active: true,
        created_at,
    })
}

pub fn get_staff(conn: &Connection, actor: &str) -> ExamResult<StaffMember> {
    conn.query_row(
        &format!("SELECT {STAFF_COLUMNS} FROM staff WHERE actor = ?"),
        [actor.trim()],
        staff_from_row,
    )
    .optional()?
    .ok_or_else(|| ExamError::not_found("staff", actor))
}

pub fn list_staff(conn: &Connection, role: Option<StaffRole>) -> ExamResult<Vec<StaffMember>> {
    let mut sql = format!("SELECT {STAFF_COLUMNS} FROM staff");
    let mut binds: Vec<Value> = Vec::new();
    if let Some(r) = role {
        sql.push_str(" WHERE role = ?");
        binds.push(Value::Text(r.as_str().to_string()));
    }
    sql.push_str(" ORDER BY actor");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), staff_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Deactivates an account. The last active ADMIN cannot be deactivated.
pub fn deactivate_staff(conn: &Connection, actor: &str, by: Option<&str>) -> ExamResult<()> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    require_role(&tx, by, &[StaffRole::Admin], "deactivate staff")?;
    let target = get_staff(&tx, actor)?;
    if target.role == StaffRole::Admin.as_str() && target.is_active {
        let admins: i64 = tx.query_row(
            "SELECT COUNT(*) FROM staff WHERE role = 'ADMIN' AND is_active = 1",
            [],
            |r| r.get(0),
        )?;
        if admins <= 1 {
            return Err(ExamError::Conflict(
                "the last active ADMIN cannot be deactivated".into(),
            ));
        }
    }
    tx.execute("UPDATE staff SET is_active = 0 WHERE actor = ?", [&target.actor])?;
    audit::log_activity(
        &tx,
        by,
        Activity::Update,
        &format!("staff {} deactivated", target.actor),
        "staff",
        &target.actor,
    )?;
    tx.commit()?;
    Ok(())
}

/// Resolves `actor` to an active account holding one of `allowed`.
pub fn require_role(
    conn: &Connection,
    actor: Option<&str>,
    allowed: &[StaffRole],
    action: &str,
) -> ExamResult<StaffMember> {
    let Some(actor) = actor.map(str::trim).filter(|a| !a.is_empty()) else {
        return Err(ExamError::Forbidden(format!("{action} requires a staff actor")));
    };
    let member = match get_staff(conn, actor) {
        Ok(m) => m,
        Err(ExamError::NotFound { .. }) => {
            return Err(ExamError::Forbidden(format!(
                "{actor} is not a registered staff account"
            )))
        }
        Err(e) => return Err(e),
    };
    if !member.is_active {
        return Err(ExamError::Forbidden(format!("{actor} is deactivated")));
    }
    if !allowed.iter().any(|r| r.as_str() == member.role) {
        tracing::warn!(actor, role = %member.role, action, "role check refused");
        return Err(ExamError::Forbidden(format!(
            "{actor} ({}) may not {action}",
            member.role
        )));
    }
    Ok(member)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn staff(actor: &str, role: &str) -> NewStaff {
        NewStaff {
            actor: actor.into(),
            full_name: format!("{actor} name"),
            role: role.into(),
        }
    }

    #[test]
    fn first_account_must_be_an_admin() {
        let conn = db::open_in_memory();
        let err = register_staff(&conn, &staff("clerk", "MARKS_ENTRY"), None).unwrap_err();
        assert_eq!(err.code(), "validation_failed");

        register_staff(&conn, &staff("admin", "admin"), None).expect("bootstrap admin");
        let listed = list_staff(&conn, None).expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].role, "ADMIN");
    }

    #[test]
    fn only_an_admin_registers_after_bootstrap() {
        let conn = db::open_in_memory();
        fixtures::officers(&conn);

        let err = register_staff(&conn, &staff("intruder", "ADMIN"), None).unwrap_err();
        assert_eq!(err.code(), "forbidden");
        let err =
            register_staff(&conn, &staff("clerk", "MARKS_ENTRY"), Some("registrar")).unwrap_err();
        assert_eq!(err.code(), "forbidden");
        let err = register_staff(&conn, &staff("registrar", "ADMIN"), Some("admin")).unwrap_err();
        assert_eq!(err.code(), "conflict");

        register_staff(&conn, &staff("clerk", "MARKS_ENTRY"), Some("admin")).expect("clerk");
        let clerks = list_staff(&conn, Some(StaffRole::MarksEntry)).expect("list");
        assert_eq!(clerks.len(), 1);
        assert_eq!(clerks[0].actor, "clerk");
    }

    #[test]
    fn role_check_refuses_unknown_wrong_role_and_deactivated() {
        let conn = db::open_in_memory();
        fixtures::officers(&conn);
        register_staff(&conn, &staff("clerk", "MARKS_ENTRY"), Some("admin")).expect("clerk");

        assert!(require_role(&conn, Some("registrar"), EXAM_OFFICERS, "release results").is_ok());
        for who in [None, Some(""), Some("stranger"), Some("clerk")] {
            let err = require_role(&conn, who, EXAM_OFFICERS, "release results").unwrap_err();
            assert_eq!(err.code(), "forbidden", "{who:?}");
        }

        deactivate_staff(&conn, "registrar", Some("admin")).expect("deactivate");
        let err = require_role(&conn, Some("registrar"), EXAM_OFFICERS, "release results")
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");
    }

    #[test]
    fn last_active_admin_stays_active() {
        let conn = db::open_in_memory();
        fixtures::officers(&conn);
        let err = deactivate_staff(&conn, "admin", Some("admin")).unwrap_err();
        assert_eq!(err.code(), "conflict");
        assert!(get_staff(&conn, "admin").expect("admin").is_active);
    }
}
