use crate::db;
use crate::fees::ProgramKind;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, parse_opt_string, parse_subjects, required_str, required_term};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "students": [] }));
    };
    match db::list_students(conn) {
        Ok(rows) => {
            let students: Vec<_> = rows
                .into_iter()
                .map(|s| {
                    json!({
                        "id": s.id,
                        "studentNo": s.student_no,
                        "displayName": format!("{}, {}", s.last_name, s.first_name),
                        "lastName": s.last_name,
                        "firstName": s.first_name,
                        "program": s.program,
                    })
                })
                .collect();
            ok(&req.id, json!({ "students": students }))
        }
        Err(e) => err(&req.id, "db_query_failed", format!("{e:#}"), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let last_name = match required_str(req, "lastName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_no = match parse_opt_string(req.params.get("studentNo")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("studentNo {}", m), None),
    };
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

    match db::insert_student(conn, student_no.as_deref(), &last_name, &first_name, program) {
        Ok(student_id) => ok(
            &req.id,
            json!({ "studentId": student_id, "program": program }),
        ),
        Err(e) => err(
            &req.id,
            "db_insert_failed",
            format!("{e:#}"),
            Some(json!({ "table": "students" })),
        ),
    }
}

fn handle_subjects_set(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let subjects = match parse_subjects(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match db::get_student(conn, &student_id) {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", format!("{e:#}"), None),
    }

    if let Err(e) = db::replace_enrolled_subjects(conn, &student_id, &term, &subjects) {
        return err(
            &req.id,
            "db_update_failed",
            format!("{e:#}"),
            Some(json!({ "table": "enrolled_subjects" })),
        );
    }
    ok(&req.id, json!({ "count": subjects.len() }))
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    match db::list_enrolled_subjects(conn, &student_id, &term) {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => err(&req.id, "db_query_failed", format!("{e:#}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "subjects.set" => Some(handle_subjects_set(state, req)),
        "subjects.list" => Some(handle_subjects_list(state, req)),
        _ => None,
    }
}
