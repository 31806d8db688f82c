use crate::ipc::error::{err, exam_err};
use crate::ipc::helpers::{
    actor, db_conn, level_param, opt_str, parse_params, reply, required_str, system_config,
};
use crate::ipc::types::{AppState, Request};
use crate::marks::{self, NewPermission, ResultFilter};
use crate::staff;
use serde_json::json;

/// `actor` here names the examiner receiving the grant; the granter is
/// passed as `grantedBy`.
fn handle_permissions_grant(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let cfg = match system_config(conn, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let new: NewPermission = match parse_params(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let granted_by = opt_str(req, "grantedBy");
    if let Err(e) =
        staff::require_role(conn, granted_by.as_deref(), staff::EXAM_OFFICERS, "grant marks entry")
    {
        return exam_err(&req.id, &e);
    }
    let res = marks::grant_permission(conn, &cfg, &new, granted_by.as_deref());
    reply(req, res.map(|p| json!({ "permission": p })))
}

fn handle_permissions_revoke(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let who = match required_str(req, "actor") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let level = match level_param(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let year = match required_str(req, "year") {
        Ok(v) => v,
        Err(e) => return e,
    };
    reply(
        req,
        marks::revoke_permission(conn, &who, level, &year)
            .map(|()| json!({ "actor": who, "revoked": true })),
    )
}

fn handle_permissions_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let who = actor(req);
    reply(
        req,
        marks::list_permissions(conn, who.as_deref()).map(|p| json!({ "permissions": p })),
    )
}

fn handle_results_enter(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let cfg = match system_config(conn, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let index_number = match required_str(req, "indexNumber") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_code = match required_str(req, "subjectCode") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let who = actor(req);
    let res = marks::enter_result(
        conn,
        &cfg,
        who.as_deref(),
        &index_number,
        &subject_code,
        req.params.get("rawScore"),
    );
    reply(req, res.map(|r| json!({ "result": r })))
}

fn handle_results_enter_bulk(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let cfg = match system_config(conn, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let Some(entries) = req.params.get("entries").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing entries", None);
    };
    let who = actor(req);
    reply(
        req,
        marks::enter_bulk(conn, &cfg, who.as_deref(), entries).map(|o| json!(o)),
    )
}

fn handle_results_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let filter: ResultFilter = match parse_params(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    reply(
        req,
        marks::list_results(conn, &filter)
            .map(|rows| json!({ "count": rows.len(), "results": rows })),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "permissions.grant" => Some(handle_permissions_grant(state, req)),
        "permissions.revoke" => Some(handle_permissions_revoke(state, req)),
        "permissions.list" => Some(handle_permissions_list(state, req)),
        "results.enter" => Some(handle_results_enter(state, req)),
        "results.enterBulk" => Some(handle_results_enter_bulk(state, req)),
        "results.list" => Some(handle_results_list(state, req)),
        _ => None,
    }
}
