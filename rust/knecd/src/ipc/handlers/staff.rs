use crate::ipc::helpers::{db_conn, opt_str, parse_params, reply, required_str};
use crate::ipc::types::{AppState, Request};
use crate::staff::{self, NewStaff, StaffRole};
use serde_json::json;

/// `actor` names the account being registered; the registering ADMIN is
/// passed as `registeredBy`.
fn handle_staff_register(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let new: NewStaff = match parse_params(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let by = opt_str(req, "registeredBy");
    reply(
        req,
        staff::register_staff(conn, &new, by.as_deref()).map(|s| json!({ "staff": s })),
    )
}

fn handle_staff_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let res = opt_str(req, "role")
        .map(|raw| StaffRole::parse(&raw))
        .transpose()
        .and_then(|role| staff::list_staff(conn, role));
    reply(req, res.map(|rows| json!({ "count": rows.len(), "staff": rows })))
}

fn handle_staff_deactivate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let target = match required_str(req, "staff") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let by = opt_str(req, "actor");
    reply(
        req,
        staff::deactivate_staff(conn, &target, by.as_deref())
            .map(|()| json!({ "staff": target, "active": false })),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "staff.register" => Some(handle_staff_register(state, req)),
        "staff.list" => Some(handle_staff_list(state, req)),
        "staff.deactivate" => Some(handle_staff_deactivate(state, req)),
        _ => None,
    }
}
