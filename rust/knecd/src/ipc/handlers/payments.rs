use crate::ipc::helpers::{
    actor, db_conn, ip_address, parse_params, reply, required_str, system_config,
};
use crate::ipc::types::{AppState, Request};
use crate::payments::{self, CallbackPayload};
use serde_json::json;

fn handle_payments_initiate(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let phone = match required_str(req, "phone") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let (who, ip) = (actor(req), ip_address(req));
    let res = payments::initiate_payment(
        conn,
        &cfg,
        &index_number,
        &phone,
        who.as_deref(),
        ip.as_deref(),
    );
    reply(req, res.map(|p| json!({ "payment": p })))
}

/// Gateway confirmation. The whole params object is the callback body.
fn handle_payments_callback(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let cfg = match system_config(conn, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let payload: CallbackPayload = match parse_params(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    reply(
        req,
        payments::apply_callback(conn, &cfg, &payload).map(|o| json!(o)),
    )
}

fn handle_payments_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let txn = match required_str(req, "transactionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    reply(req, payments::get_payment(conn, &txn).map(|p| json!({ "payment": p })))
}

fn handle_payments_entitlement(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let index_number = match required_str(req, "indexNumber") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let (who, ip) = (actor(req), ip_address(req));
    reply(
        req,
        payments::entitlement(conn, &index_number, who.as_deref(), ip.as_deref())
            .map(|v| json!(v)),
    )
}

fn handle_results_access(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let (who, ip) = (actor(req), ip_address(req));
    reply(
        req,
        payments::access_results(conn, &cfg, &index_number, who.as_deref(), ip.as_deref())
            .map(|r| json!(r)),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "payments.initiate" => Some(handle_payments_initiate(state, req)),
        "payments.callback" => Some(handle_payments_callback(state, req)),
        "payments.status" => Some(handle_payments_status(state, req)),
        "payments.entitlement" => Some(handle_payments_entitlement(state, req)),
        "results.access" => Some(handle_results_access(state, req)),
        _ => None,
    }
}
