use serde_json::json;
use thiserror::Error;

/// Errors raised by domain operations. Each variant maps to a stable protocol
/// error code so the UI can branch on it without parsing messages.
#[derive(Error, Debug)]
pub enum ExamError {
    #[error("{message}")]
    Validation {
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("conflict: {0}")]
    Conflict(String),

    /// The request was refused and recorded in the fraud log.
    #[error("rejected: {reason}")]
    Fraud { reason: String, fraud_id: String },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("payment rejected: {0}")]
    PaymentRejected(String),

    #[error("callback conflicts with recorded outcome: {0}")]
    CallbackConflict(String),

    #[error("database error: {0}")]
    Database(String),
}

pub type ExamResult<T> = Result<T, ExamError>;

impl ExamError {
    pub fn validation(message: impl Into<String>) -> Self {
        ExamError::Validation {
            message: message.into(),
            details: None,
        }
    }

    pub fn validation_with(message: impl Into<String>, details: serde_json::Value) -> Self {
        ExamError::Validation {
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        ExamError::NotFound {
            entity,
            key: key.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ExamError::Validation { .. } => "validation_failed",
            ExamError::Configuration(_) => "config_error",
            ExamError::NotFound { .. } => "not_found",
            ExamError::Conflict(_) => "conflict",
            ExamError::Fraud { .. } => "fraud_rejected",
            ExamError::Forbidden(_) => "forbidden",
            ExamError::PaymentRejected(_) => "payment_rejected",
            ExamError::CallbackConflict(_) => "callback_conflict",
            ExamError::Database(_) => "db_query_failed",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            ExamError::Validation { details, .. } => details.clone(),
            ExamError::NotFound { entity, key } => Some(json!({ "entity": entity, "key": key })),
            ExamError::Fraud { fraud_id, .. } => Some(json!({ "fraudAttemptId": fraud_id })),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for ExamError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(_, Some(msg)) if msg.contains("UNIQUE") => {
                ExamError::Conflict(msg)
            }
            _ => ExamError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ExamError {
    fn from(err: serde_json::Error) -> Self {
        ExamError::Database(format!("stored json is invalid: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_violation_maps_to_conflict() {
        let conn = rusqlite::Connection::open_in_memory().expect("open");
        conn.execute("CREATE TABLE t(k TEXT UNIQUE)", []).expect("create");
        conn.execute("INSERT INTO t(k) VALUES('a')", []).expect("insert");
        let e: ExamError = conn
            .execute("INSERT INTO t(k) VALUES('a')", [])
            .expect_err("duplicate")
            .into();
        assert_eq!(e.code(), "conflict");
    }

    #[test]
    fn fraud_details_carry_attempt_id() {
        let e = ExamError::Fraud {
            reason: "duplicate".into(),
            fraud_id: "f-1".into(),
        };
        assert_eq!(e.details(), Some(json!({ "fraudAttemptId": "f-1" })));
    }
}
