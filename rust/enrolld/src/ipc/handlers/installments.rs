use crate::ipc::error::{err, fee_err, ok};
use crate::ipc::helpers::{required_str, session_mut};
use crate::ipc::types::{AppState, Request};
use crate::ledger::NewInstallment;
use serde_json::json;

fn handle_installments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let s = match session_mut(state, req) {
        Ok(s) => s,
        Err(e) => return e,
    };
    ok(
        &req.id,
        json!({
            "installments": s.ledger().current(),
            "historicalInstallments": s.ledger().historical(),
            "currentTotal": s.ledger().current_total(),
        }),
    )
}

fn handle_installments_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let input: NewInstallment = match req.params.get("entry") {
        Some(v) if v.is_object() => match serde_json::from_value(v.clone()) {
            Ok(i) => i,
            Err(e) => return err(&req.id, "bad_params", format!("entry {}", e), None),
        },
        _ => return err(&req.id, "bad_params", "missing entry", None),
    };
    let s = match session_mut(state, req) {
        Ok(s) => s,
        Err(e) => return e,
    };
    match s.add_installment(input) {
        Ok(entry) => {
            tracing::debug!(session_id = %s.id, installment_id = %entry.id, "installment added");
            ok(&req.id, json!({ "entry": entry, "session": s.view() }))
        }
        Err(e) => fee_err(&req.id, e),
    }
}

fn handle_installments_remove(state: &mut AppState, req: &Request) -> serde_json::Value {
    let installment_id = match required_str(req, "installmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let s = match session_mut(state, req) {
        Ok(s) => s,
        Err(e) => return e,
    };
    match s.remove_installment(&installment_id) {
        Ok(entry) => ok(&req.id, json!({ "removed": entry, "session": s.view() })),
        Err(e) => fee_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "installments.list" => Some(handle_installments_list(state, req)),
        "installments.add" => Some(handle_installments_add(state, req)),
        "installments.remove" => Some(handle_installments_remove(state, req)),
        _ => None,
    }
}
