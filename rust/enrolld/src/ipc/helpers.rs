use crate::fees::{EnrolledSubject, EntryIssue, FeeField};
use crate::ipc::error::{err, fee_err};
use crate::ipc::types::{AppState, Request};
use crate::ledger::TermKey;
use crate::session::FeeSession;
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use std::str::FromStr;

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, JsonValue> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, JsonValue> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn parse_opt_string(v: Option<&JsonValue>) -> Result<Option<String>, &'static str> {
    match v {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let s = v.as_str().ok_or("must be string or null")?.trim().to_string();
            if s.is_empty() {
                Ok(None)
            } else {
                Ok(Some(s))
            }
        }
    }
}

/// Strict decimal for collaborator data (hours, rates). Strings and numbers
/// are accepted; anything else is a parameter error.
pub fn parse_decimal(v: Option<&JsonValue>, default: Decimal) -> Result<Decimal, &'static str> {
    match v {
        None => Ok(default),
        Some(v) if v.is_null() => Ok(default),
        Some(JsonValue::Number(n)) => Decimal::from_str(&n.to_string()).map_err(|_| "must be a decimal"),
        Some(JsonValue::String(s)) => Decimal::from_str(s.trim()).map_err(|_| "must be a decimal"),
        Some(_) => Err("must be a decimal"),
    }
}

/// Collaborator figure (hours, rate, ledger total) that must fall in
/// `0..=MAX_ENTRY`.
pub fn parse_entry(v: Option<&JsonValue>, default: Decimal) -> Result<Decimal, &'static str> {
    let value = parse_decimal(v, default)?;
    match EntryIssue::check(value) {
        None => Ok(value),
        Some(EntryIssue::Negative) => Err("must be >= 0"),
        Some(_) => Err("is out of range"),
    }
}

pub fn parse_subjects(req: &Request) -> Result<Vec<EnrolledSubject>, JsonValue> {
    let Some(items) = req.params.get("subjects").and_then(|v| v.as_array()) else {
        return Err(err(&req.id, "bad_params", "subjects must be an array", None));
    };
    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let Some(obj) = item.as_object() else {
            return Err(err(
                &req.id,
                "bad_params",
                format!("subjects[{}] must be an object", i),
                None,
            ));
        };
        let mut hours = [Decimal::ZERO; 2];
        for (slot, key) in hours.iter_mut().zip(["lectureHours", "labHours"]) {
            *slot = parse_entry(obj.get(key), Decimal::ZERO).map_err(|m| {
                err(
                    &req.id,
                    "bad_params",
                    format!("subjects[{}].{} {}", i, key, m),
                    None,
                )
            })?;
        }
        let text = |key: &str| {
            obj.get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .trim()
                .to_string()
        };
        out.push(EnrolledSubject {
            code: text("code"),
            description: text("description"),
            lecture_hours: hours[0],
            lab_hours: hours[1],
        });
    }
    Ok(out)
}

pub fn required_term(req: &Request) -> Result<TermKey, JsonValue> {
    TermKey::from_json(req.params.get("term")).map_err(|e| fee_err(&req.id, e))
}

pub fn required_field(req: &Request) -> Result<FeeField, JsonValue> {
    let key = required_str(req, "field")?;
    FeeField::parse(&key)
        .ok_or_else(|| err(&req.id, "bad_params", format!("unknown field: {}", key), None))
}

/// Raw text for a field edit. Numbers are taken verbatim, null clears the field.
pub fn raw_value(req: &Request) -> Result<String, JsonValue> {
    match req.params.get("value") {
        None => Err(err(&req.id, "bad_params", "missing value", None)),
        Some(JsonValue::Null) => Ok(String::new()),
        Some(JsonValue::String(s)) => Ok(s.clone()),
        Some(JsonValue::Number(n)) => Ok(n.to_string()),
        Some(_) => Err(err(
            &req.id,
            "bad_params",
            "value must be string, number or null",
            None,
        )),
    }
}

pub fn session_mut<'a>(
    state: &'a mut AppState,
    req: &Request,
) -> Result<&'a mut FeeSession, JsonValue> {
    let session_id = required_str(req, "sessionId")?;
    state
        .sessions
        .get_mut(&session_id)
        .ok_or_else(|| err(&req.id, "not_found", "fee session not found", None))
}
