use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, parse_entry};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_rates_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    match db::load_fee_rates(conn) {
        Ok(rates) => ok(&req.id, json!({ "rates": rates })),
        Err(e) => err(&req.id, "db_query_failed", format!("{e:#}"), None),
    }
}

fn handle_rates_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("rates").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing rates", None);
    };
    let current = match db::load_fee_rates(conn) {
        Ok(r) => r,
        Err(e) => return err(&req.id, "db_query_failed", format!("{e:#}"), None),
    };

    let mut next = current.clone();
    for (key, slot) in [
        ("lectureRate", &mut next.lecture_rate),
        ("labRate", &mut next.lab_rate),
        ("bundledProgramFee", &mut next.bundled_program_fee),
    ] {
        let v = match parse_entry(patch.get(key), *slot) {
            Ok(v) => v,
            Err(m) => return err(&req.id, "bad_params", format!("rates.{} {}", key, m), None),
        };
        *slot = v;
    }

    if let Err(e) = db::save_fee_rates(conn, &next) {
        return err(&req.id, "db_update_failed", format!("{e:#}"), None);
    }
    tracing::info!(?next, "fee rates updated");
    ok(&req.id, json!({ "rates": next, "previous": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "settings.rates.get" => Some(handle_rates_get(state, req)),
        "settings.rates.update" => Some(handle_rates_update(state, req)),
        _ => None,
    }
}
