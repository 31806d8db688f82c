use super::handlers;
use super::types::{AppState, Request};
use crate::config::SystemConfig;
use crate::ipc::error::{err, exam_err};

/// Methods still served while maintenance mode is on.
fn allowed_in_maintenance(method: &str) -> bool {
    matches!(method, "health" | "workspace.select") || method.starts_with("config.")
}

fn maintenance_gate(state: &AppState, req: &Request) -> Option<serde_json::Value> {
    if allowed_in_maintenance(&req.method) {
        return None;
    }
    let conn = state.db.as_ref()?;
    match SystemConfig::load(conn) {
        Ok(cfg) if cfg.maintenance_enabled => {
            let message = if cfg.maintenance_message.is_empty() {
                "the service is under maintenance".to_string()
            } else {
                cfg.maintenance_message
            };
            Some(err(&req.id, "maintenance", message, None))
        }
        Ok(_) => None,
        Err(e) => Some(exam_err(&req.id, &e)),
    }
}

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    if let Some(resp) = maintenance_gate(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::core::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::config::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::staff::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::registry::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::schemes::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::marks::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::results::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::payments::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::audit::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::reports::try_handle(state, &req) {
        return resp;
    }

    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
