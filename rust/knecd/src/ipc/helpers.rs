use crate::config::SystemConfig;
use crate::error::ExamResult;
use crate::ipc::error::{err, exam_err, ok};
use crate::ipc::types::{AppState, Request};
use crate::registry::ExamLevel;
use rusqlite::Connection;
use serde::de::DeserializeOwned;

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

/// A trimmed, non-empty string param, or None.
pub fn opt_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn opt_i64(req: &Request, key: &str) -> Option<i64> {
    req.params.get(key).and_then(|v| v.as_i64())
}

/// Who is calling. Recorded on writes and in the fraud log.
pub fn actor(req: &Request) -> Option<String> {
    opt_str(req, "actor")
}

pub fn ip_address(req: &Request) -> Option<String> {
    opt_str(req, "ipAddress")
}

/// Missing params deserialize like an empty object so filter structs default.
pub fn parse_params<T: DeserializeOwned>(req: &Request) -> Result<T, serde_json::Value> {
    let params = if req.params.is_null() {
        serde_json::json!({})
    } else {
        req.params.clone()
    };
    serde_json::from_value(params)
        .map_err(|e| err(&req.id, "bad_params", format!("invalid params: {e}"), None))
}

pub fn level_param(req: &Request) -> Result<ExamLevel, serde_json::Value> {
    let raw = required_str(req, "level")?;
    ExamLevel::parse(&raw).map_err(|e| exam_err(&req.id, &e))
}

pub fn opt_level_param(req: &Request) -> Result<Option<ExamLevel>, serde_json::Value> {
    opt_str(req, "level")
        .map(|raw| ExamLevel::parse(&raw).map_err(|e| exam_err(&req.id, &e)))
        .transpose()
}

pub fn system_config(conn: &Connection, req: &Request) -> Result<SystemConfig, serde_json::Value> {
    SystemConfig::load(conn).map_err(|e| exam_err(&req.id, &e))
}

pub fn reply(req: &Request, result: ExamResult<serde_json::Value>) -> serde_json::Value {
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => exam_err(&req.id, &e),
    }
}
