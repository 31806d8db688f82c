use crate::audit::{self, Activity, FraudFilter, FraudKind};
use crate::ipc::error::err;
use crate::ipc::helpers::{db_conn, opt_i64, opt_str, reply, required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_fraud_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let kind = match opt_str(req, "type") {
        None => None,
        Some(raw) => match FraudKind::parse(&raw) {
            Some(k) => Some(k),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "unknown fraud type",
                    Some(json!({ "type": raw })),
                )
            }
        },
    };
    let filter = FraudFilter {
        unresolved_only: req
            .params
            .get("unresolvedOnly")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        kind,
        limit: opt_i64(req, "limit"),
    };
    reply(
        req,
        audit::list_fraud(conn, &filter)
            .map(|rows| json!({ "count": rows.len(), "attempts": rows })),
    )
}

fn handle_fraud_resolve(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let id = match required_str(req, "id") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let who = match required_str(req, "actor") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let notes = opt_str(req, "notes").unwrap_or_default();
    reply(
        req,
        audit::resolve_fraud(conn, &id, &who, &notes)
            .map(|()| json!({ "id": id, "resolved": true })),
    )
}

fn handle_activity_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let action = match opt_str(req, "action") {
        None => None,
        Some(raw) => match Activity::parse(&raw) {
            Some(a) => Some(a),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "unknown activity action",
                    Some(json!({ "action": raw })),
                )
            }
        },
    };
    let who = opt_str(req, "actor");
    reply(
        req,
        audit::list_activity(conn, who.as_deref(), action, opt_i64(req, "limit"))
            .map(|rows| json!({ "count": rows.len(), "entries": rows })),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "fraud.list" => Some(handle_fraud_list(state, req)),
        "fraud.resolve" => Some(handle_fraud_resolve(state, req)),
        "activity.list" => Some(handle_activity_list(state, req)),
        _ => None,
    }
}
