use crate::db;
use crate::fees::{
    self, Adjustment, DerivationContext, FeeRates, FeeSheet, OverrideFlags, ProgramKind,
    SheetValues, Variant,
};
use crate::ipc::error::{err, fee_err, ok};
use crate::ipc::helpers::{
    db_conn, parse_entry, parse_subjects, raw_value, required_field, required_str, required_term,
    session_mut,
};
use crate::ipc::types::{AppState, Request};
use crate::session;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::json;

fn parse_variant(req: &Request) -> Result<Variant, serde_json::Value> {
    match req.params.get("variant").and_then(|v| v.as_str()) {
        None => Ok(Variant::InitialPayment),
        Some(s) => Variant::parse(s).ok_or_else(|| {
            err(
                &req.id,
                "bad_params",
                "variant must be 'initial' or 'term'",
                None,
            )
        }),
    }
}

fn parse_object<T: DeserializeOwned + Default>(
    req: &Request,
    key: &str,
) -> Result<T, serde_json::Value> {
    match req.params.get(key) {
        None => Ok(T::default()),
        Some(v) if v.is_null() => Ok(T::default()),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| err(&req.id, "bad_params", format!("{} {}", key, e), None)),
    }
}

/// Stateless recompute of a sheet the caller holds, for forms that keep their
/// own state between keystrokes.
fn handle_fees_preview(state: &mut AppState, req: &Request) -> serde_json::Value {
    let program_raw = match required_str(req, "program") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(program) = ProgramKind::parse(&program_raw) else {
        return err(
            &req.id,
            "bad_params",
            "program must be one of SHS, Diploma, Bachelor",
            None,
        );
    };
    let variant = match parse_variant(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let values: SheetValues = match parse_object(req, "values") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let overrides: OverrideFlags = match parse_object(req, "overrides") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subjects = match req.params.get("subjects") {
        None | Some(serde_json::Value::Null) => Vec::new(),
        Some(_) => match parse_subjects(req) {
            Ok(v) => v,
            Err(e) => return e,
        },
    };
    let installments_paid = match parse_entry(req.params.get("installmentsPaid"), Decimal::ZERO)
    {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("installmentsPaid {}", m), None),
    };
    // Workspace rates when one is open, otherwise the built-in schedule.
    let rates = match state.db.as_ref() {
        Some(conn) => match db::load_fee_rates(conn) {
            Ok(r) => r,
            Err(e) => return err(&req.id, "db_query_failed", format!("{e:#}"), None),
        },
        None => FeeRates::default(),
    };

    let sheet = FeeSheet::from_values(&values, &overrides);
    let adjustment = match variant {
        Variant::InitialPayment => Adjustment::CarriedCredit,
        Variant::TermPayment => Adjustment::InstallmentsPaid(installments_paid),
    };
    let out = fees::recompute(
        &sheet,
        &DerivationContext {
            program,
            subjects: &subjects,
            rates: &rates,
            adjustment,
        },
    );
    ok(
        &req.id,
        json!({
            "values": out.sheet.values(),
            "overrides": out.sheet.override_flags(),
            "breakdown": out.breakdown,
            "warnings": out.sheet.parse_warnings(),
        }),
    )
}

fn handle_fees_open(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let variant = match parse_variant(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let opened = match session::open(conn, &student_id, term, variant) {
        Ok(s) => s,
        Err(e) => return fee_err(&req.id, e),
    };
    let view = opened.view();
    state.sessions.insert(opened.id.clone(), opened);
    ok(&req.id, json!({ "session": view }))
}

fn handle_fees_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    match session_mut(state, req) {
        Ok(s) => ok(&req.id, json!({ "session": s.view() })),
        Err(e) => e,
    }
}

fn handle_fees_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let field = match required_field(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let raw = match raw_value(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let s = match session_mut(state, req) {
        Ok(s) => s,
        Err(e) => return e,
    };
    if let Err(e) = s.edit(field, &raw) {
        return fee_err(&req.id, e);
    }
    let view = s.view();
    tracing::debug!(session_id = %s.id, field = field.key(), "fee field updated");
    if !view.warnings.is_empty() {
        tracing::warn!(
            session_id = %s.id,
            warnings = view.warnings.len(),
            "non-numeric fee input counted as zero"
        );
    }
    ok(&req.id, json!({ "session": view }))
}

fn handle_fees_release(state: &mut AppState, req: &Request) -> serde_json::Value {
    let field = match required_field(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let s = match session_mut(state, req) {
        Ok(s) => s,
        Err(e) => return e,
    };
    if let Err(e) = s.release(field) {
        return fee_err(&req.id, e);
    }
    ok(&req.id, json!({ "session": s.view() }))
}

fn handle_fees_close(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session_id = match required_str(req, "sessionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match state.sessions.remove(&session_id) {
        Some(_) => {
            tracing::debug!(session_id = %session_id, "fee session closed");
            ok(&req.id, json!({ "closed": true }))
        }
        None => err(&req.id, "not_found", "fee session not found", None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "fees.preview" => Some(handle_fees_preview(state, req)),
        "fees.open" => Some(handle_fees_open(state, req)),
        "fees.get" => Some(handle_fees_get(state, req)),
        "fees.update" => Some(handle_fees_update(state, req)),
        "fees.release" => Some(handle_fees_release(state, req)),
        "fees.close" => Some(handle_fees_close(state, req)),
        _ => None,
    }
}
