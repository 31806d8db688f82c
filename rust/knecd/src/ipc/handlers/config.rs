use crate::audit::{self, Activity};
use crate::config::{self, ConfigSection};
use crate::ipc::error::{err, exam_err, ok};
use crate::ipc::helpers::{actor, db_conn};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_config_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    match config::public_view(conn) {
        Ok(v) => ok(&req.id, v),
        Err(e) => exam_err(&req.id, &e),
    }
}

fn handle_config_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = ConfigSection::parse(section_raw) else {
        return err(
            &req.id,
            "bad_params",
            "unknown section",
            Some(json!({ "section": section_raw })),
        );
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    if let Err(e) = config::update_section(conn, section, patch_obj) {
        return exam_err(&req.id, &e);
    }
    if let Err(e) = audit::log_activity(
        conn,
        actor(req).as_deref(),
        Activity::Update,
        &format!("configuration section {} updated", section.name()),
        "config",
        section.name(),
    ) {
        return exam_err(&req.id, &e);
    }
    match config::public_view(conn) {
        Ok(v) => ok(&req.id, json!({ "section": section.name(), "config": v })),
        Err(e) => exam_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "config.get" => Some(handle_config_get(state, req)),
        "config.update" => Some(handle_config_update(state, req)),
        _ => None,
    }
}
