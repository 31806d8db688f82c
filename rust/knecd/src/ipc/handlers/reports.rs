use std::path::PathBuf;

use crate::ipc::error::{anyhow_err, ok};
use crate::ipc::helpers::{actor, db_conn, level_param, opt_str, reply, required_str};
use crate::ipc::types::{AppState, Request};
use crate::reports;
use serde_json::json;

/// Relative output paths land inside the selected workspace.
fn out_path(state: &AppState, raw: &str) -> PathBuf {
    let p = PathBuf::from(raw);
    match (&state.workspace, p.is_relative()) {
        (Some(ws), true) => ws.join(p),
        _ => p,
    }
}

fn handle_school_performance(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let school_code = match required_str(req, "schoolCode") {
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
    let who = actor(req);
    reply(
        req,
        reports::school_performance(conn, &school_code, level, &year, who.as_deref())
            .map(|r| json!({ "report": r })),
    )
}

fn handle_grade_distribution(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let school = opt_str(req, "schoolCode");
    let subject = opt_str(req, "subjectCode");
    reply(
        req,
        reports::grade_distribution(conn, level, &year, school.as_deref(), subject.as_deref())
            .map(|d| json!(d)),
    )
}

fn handle_export_results(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let raw_out = match required_str(req, "outPath") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let path = out_path(state, &raw_out);
    let school = opt_str(req, "schoolCode");
    let who = actor(req);
    match reports::export_results_csv(
        conn,
        level,
        &year,
        school.as_deref(),
        &path,
        who.as_deref(),
    ) {
        Ok(summary) => ok(&req.id, json!(summary)),
        Err(e) => anyhow_err(&req.id, "io_failed", &e),
    }
}

fn handle_export_school_ranking(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let raw_out = match required_str(req, "outPath") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let path = out_path(state, &raw_out);
    let who = actor(req);
    match reports::export_school_ranking_csv(conn, level, &year, &path, who.as_deref()) {
        Ok(summary) => ok(&req.id, json!(summary)),
        Err(e) => anyhow_err(&req.id, "io_failed", &e),
    }
}

fn handle_dashboard_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    reply(req, reports::dashboard_stats(conn).map(|s| json!(s)))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.schoolPerformance" => Some(handle_school_performance(state, req)),
        "reports.gradeDistribution" => Some(handle_grade_distribution(state, req)),
        "reports.exportResultsCsv" => Some(handle_export_results(state, req)),
        "reports.exportSchoolRankingCsv" => Some(handle_export_school_ranking(state, req)),
        "dashboard.stats" => Some(handle_dashboard_stats(state, req)),
        _ => None,
    }
}
