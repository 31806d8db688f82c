use crate::grading::parse_score;
use crate::ipc::error::exam_err;
use crate::ipc::helpers::{
    actor, db_conn, level_param, opt_level_param, opt_str, parse_params, reply, required_str,
};
use crate::ipc::types::{AppState, Request};
use crate::schemes::{self, NewScheme};
use crate::staff;
use serde_json::json;

fn handle_schemes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let new: NewScheme = match parse_params(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let who = actor(req);
    if let Err(e) =
        staff::require_role(conn, who.as_deref(), staff::EXAM_OFFICERS, "publish grading schemes")
    {
        return exam_err(&req.id, &e);
    }
    let res = schemes::create_scheme(conn, &new, who.as_deref());
    reply(req, res.map(|s| json!({ "scheme": s })))
}

fn handle_schemes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let level = match opt_level_param(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let year = opt_str(req, "year");
    reply(
        req,
        schemes::list_schemes(conn, level, year.as_deref()).map(|s| json!({ "schemes": s })),
    )
}

fn handle_schemes_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let id = match required_str(req, "schemeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    reply(req, schemes::get_scheme(conn, &id).map(|s| json!({ "scheme": s })))
}

/// Preview a grade without storing a result. Without `subjectCode` the
/// overall scheme is used.
fn handle_schemes_grade(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
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
    let subject = opt_str(req, "subjectCode");
    let res = parse_score(req.params.get("score")).and_then(|score| {
        schemes::grade_score(conn, level, &year, subject.as_deref(), score)
    });
    reply(req, res.map(|g| json!(g)))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "schemes.create" => Some(handle_schemes_create(state, req)),
        "schemes.list" => Some(handle_schemes_list(state, req)),
        "schemes.get" => Some(handle_schemes_get(state, req)),
        "schemes.grade" => Some(handle_schemes_grade(state, req)),
        _ => None,
    }
}
