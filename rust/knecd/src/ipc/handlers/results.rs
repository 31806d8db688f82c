use crate::aggregate;
use crate::ipc::error::exam_err;
use crate::ipc::helpers::{actor, db_conn, level_param, reply, required_str};
use crate::ipc::types::{AppState, Request};
use crate::registry;
use crate::staff;
use serde_json::json;

/// Staff view: marks, aggregate and positions whether or not released.
fn handle_aggregates_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let index_number = match required_str(req, "indexNumber") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let res = registry::get_candidate(conn, &index_number)
        .and_then(|c| aggregate::candidate_results(conn, c));
    reply(req, res.map(|r| json!(r)))
}

fn handle_rankings_recompute(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let who = actor(req);
    reply(
        req,
        aggregate::recompute_rankings(conn, level, &year, who.as_deref()).map(|s| json!(s)),
    )
}

fn handle_results_release(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let who = match required_str(req, "actor") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) =
        staff::require_role(conn, Some(&who), staff::EXAM_OFFICERS, "release results")
    {
        return exam_err(&req.id, &e);
    }
    reply(
        req,
        aggregate::release_results(conn, level, &year, &who).map(|s| json!(s)),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "aggregates.get" => Some(handle_aggregates_get(state, req)),
        "rankings.recompute" => Some(handle_rankings_recompute(state, req)),
        "results.release" => Some(handle_results_release(state, req)),
        _ => None,
    }
}
