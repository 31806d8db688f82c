use crate::identity::IndexNumber;
use crate::ipc::helpers::{
    actor, db_conn, opt_level_param, opt_str, parse_params, reply, required_str,
};
use crate::ipc::types::{AppState, Request};
use crate::registry::{self, CandidateFilter, ExamLevel, NewCandidate, NewCertificate, NewSchool};
use serde_json::json;

fn handle_years_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let label = match required_str(req, "label") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let start = match required_str(req, "startDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let end = match required_str(req, "endDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let active = req
        .params
        .get("active")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let res = registry::create_year(conn, &label, &start, &end, active, actor(req).as_deref());
    reply(req, res.map(|y| json!({ "year": y })))
}

fn handle_years_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    reply(req, registry::list_years(conn).map(|years| json!({ "years": years })))
}

fn handle_years_activate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let label = match required_str(req, "label") {
        Ok(v) => v,
        Err(e) => return e,
    };
    reply(req, registry::activate_year(conn, &label).map(|y| json!({ "year": y })))
}

fn handle_levels_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    reply(req, registry::list_levels(conn).map(|levels| json!({ "levels": levels })))
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let code = match required_str(req, "code") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let level = match crate::ipc::helpers::level_param(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let compulsory = req
        .params
        .get("compulsory")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    let res = registry::create_subject(conn, &code, &name, level, compulsory);
    reply(req, res.map(|s| json!({ "subject": s })))
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let level: Option<ExamLevel> = match opt_level_param(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    reply(
        req,
        registry::list_subjects(conn, level).map(|subjects| json!({ "subjects": subjects })),
    )
}

fn handle_schools_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let new: NewSchool = match parse_params(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let res = registry::create_school(conn, &new, actor(req).as_deref());
    reply(req, res.map(|s| json!({ "school": s })))
}

fn handle_schools_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let county = opt_str(req, "county");
    reply(
        req,
        registry::list_schools(conn, county.as_deref()).map(|schools| json!({ "schools": schools })),
    )
}

fn handle_certificates_register(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let new: NewCertificate = match parse_params(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    reply(
        req,
        registry::register_certificate(conn, &new).map(|c| json!({ "certificate": c })),
    )
}

fn handle_certificates_verify(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let number = match required_str(req, "certificateNumber") {
        Ok(v) => v,
        Err(e) => return e,
    };
    reply(
        req,
        registry::verify_certificate(conn, &number)
            .map(|()| json!({ "certificateNumber": number, "verified": true })),
    )
}

fn handle_candidates_register(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let new: NewCandidate = match parse_params(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let res = registry::register_candidate(conn, &new, actor(req).as_deref());
    reply(req, res.map(|c| json!({ "candidate": c })))
}

fn handle_candidates_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let index_number = match required_str(req, "indexNumber") {
        Ok(v) => v,
        Err(e) => return e,
    };
    reply(
        req,
        registry::get_candidate(conn, &index_number).map(|c| json!({ "candidate": c })),
    )
}

fn handle_candidates_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let filter: CandidateFilter = match parse_params(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    reply(
        req,
        registry::list_candidates(conn, &filter).map(|candidates| {
            json!({ "count": candidates.len(), "candidates": candidates })
        }),
    )
}

/// Format check plus a registry lookup. A malformed number is reported as
/// `valid: false` with the reason rather than as an error.
fn handle_candidates_validate_index(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let raw = match required_str(req, "indexNumber") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let parsed = match IndexNumber::parse(&raw) {
        Ok(p) => p,
        Err(e) => {
            return crate::ipc::error::ok(
                &req.id,
                json!({ "indexNumber": raw, "valid": false, "reason": e.to_string() }),
            )
        }
    };
    reply(
        req,
        registry::find_candidate(conn, &raw).map(|found| {
            json!({
                "indexNumber": parsed.to_string(),
                "valid": true,
                "parsed": parsed,
                "registered": found.is_some()
            })
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "years.create" => Some(handle_years_create(state, req)),
        "years.list" => Some(handle_years_list(state, req)),
        "years.activate" => Some(handle_years_activate(state, req)),
        "levels.list" => Some(handle_levels_list(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "schools.create" => Some(handle_schools_create(state, req)),
        "schools.list" => Some(handle_schools_list(state, req)),
        "certificates.register" => Some(handle_certificates_register(state, req)),
        "certificates.verify" => Some(handle_certificates_verify(state, req)),
        "candidates.register" => Some(handle_candidates_register(state, req)),
        "candidates.get" => Some(handle_candidates_get(state, req)),
        "candidates.list" => Some(handle_candidates_list(state, req)),
        "candidates.validateIndex" => Some(handle_candidates_validate_index(state, req)),
        _ => None,
    }
}
