use crate::error::ExamError;
use serde_json::json;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

pub fn exam_err(id: &str, e: &ExamError) -> serde_json::Value {
    err(id, e.code(), e.to_string(), e.details())
}

/// File helpers return `anyhow`; domain failures inside keep their code.
pub fn anyhow_err(id: &str, code: &str, e: &anyhow::Error) -> serde_json::Value {
    match e.downcast_ref::<ExamError>() {
        Some(exam) => exam_err(id, exam),
        None => err(id, code, format!("{e:#}"), None),
    }
}
