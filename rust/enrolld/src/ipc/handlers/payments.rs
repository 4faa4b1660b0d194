use crate::db;
use crate::ipc::error::{err, fee_err, ok};
use crate::ipc::helpers::{db_conn, required_str, required_term};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_payments_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term = match required_term(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match db::get_payment_record(conn, &student_id, &term) {
        Ok(Some(rec)) => ok(
            &req.id,
            json!({
                "recordId": rec.id,
                "studentId": rec.student_id,
                "term": rec.term,
                "values": rec.values,
                "updatedAt": rec.updated_at,
            }),
        ),
        Ok(None) => err(&req.id, "not_found", "payment record not found", None),
        Err(e) => err(&req.id, "db_query_failed", format!("{e:#}"), None),
    }
}

fn handle_payments_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session_id = match required_str(req, "sessionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let AppState { db, sessions, .. } = state;
    let Some(conn) = db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(s) = sessions.get_mut(&session_id) else {
        return err(&req.id, "not_found", "fee session not found", None);
    };
    match s.save(conn) {
        Ok(record_id) => ok(
            &req.id,
            json!({ "recordId": record_id, "session": s.view() }),
        ),
        Err(e) => {
            tracing::warn!(session_id = %session_id, code = %e.code, "payment save rejected");
            fee_err(&req.id, e)
        }
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "payments.get" => Some(handle_payments_get(state, req)),
        "payments.save" => Some(handle_payments_save(state, req)),
        _ => None,
    }
}
