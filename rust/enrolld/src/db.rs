use crate::fees::{EnrolledSubject, FeeRates, ProgramKind, SheetValues};
use crate::ledger::{InstallmentEntry, TermKey};
use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

const RATES_KEY: &str = "fees.rates";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("enrolld.sqlite3");
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            student_no TEXT,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            program_kind TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrolled_subjects(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            year_level TEXT NOT NULL,
            semester TEXT NOT NULL,
            school_year TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            code TEXT NOT NULL,
            description TEXT NOT NULL,
            lecture_hours TEXT NOT NULL,
            lab_hours TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrolled_subjects_term
         ON enrolled_subjects(student_id, year_level, semester, school_year)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS payment_records(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            year_level TEXT NOT NULL,
            semester TEXT NOT NULL,
            school_year TEXT NOT NULL,
            values_json TEXT NOT NULL,
            total_amount TEXT NOT NULL,
            remaining_amount TEXT NOT NULL,
            advance_payment TEXT NOT NULL,
            payment_date TEXT,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(student_id, year_level, semester, school_year)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payment_records_student ON payment_records(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS installments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            year_level TEXT NOT NULL,
            semester TEXT NOT NULL,
            school_year TEXT NOT NULL,
            payment_date TEXT NOT NULL,
            or_number TEXT NOT NULL,
            amount TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_installments_student ON installments(student_id)",
        [],
    )?;

    Ok(())
}

fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

fn decimal_col(raw: &str) -> Decimal {
    Decimal::from_str(raw).unwrap_or_default()
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

/// Rates stored in the workspace, falling back to the built-in schedule.
pub fn load_fee_rates(conn: &Connection) -> anyhow::Result<FeeRates> {
    match settings_get_json(conn, RATES_KEY)? {
        Some(v) => serde_json::from_value(v).context("stored fee rates are malformed"),
        None => Ok(FeeRates::default()),
    }
}

pub fn save_fee_rates(conn: &Connection, rates: &FeeRates) -> anyhow::Result<()> {
    settings_set_json(conn, RATES_KEY, &serde_json::to_value(rates)?)
}

#[derive(Debug, Clone)]
pub struct StudentRow {
    pub id: String,
    pub student_no: Option<String>,
    pub last_name: String,
    pub first_name: String,
    pub program: ProgramKind,
}

pub fn insert_student(
    conn: &Connection,
    student_no: Option<&str>,
    last_name: &str,
    first_name: &str,
    program: ProgramKind,
) -> anyhow::Result<String> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, student_no, last_name, first_name, program_kind, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        params![id, student_no, last_name, first_name, program.as_str(), now_ts()],
    )?;
    Ok(id)
}

fn student_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<StudentRow> {
    let program_raw: String = r.get(4)?;
    Ok(StudentRow {
        id: r.get(0)?,
        student_no: r.get(1)?,
        last_name: r.get(2)?,
        first_name: r.get(3)?,
        // Unrecognised kinds carry no bundled fee.
        program: ProgramKind::parse(&program_raw).unwrap_or(ProgramKind::Bachelor),
    })
}

pub fn list_students(conn: &Connection) -> anyhow::Result<Vec<StudentRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, student_no, last_name, first_name, program_kind
         FROM students
         ORDER BY last_name, first_name, id",
    )?;
    let rows = stmt
        .query_map([], student_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_student(conn: &Connection, student_id: &str) -> anyhow::Result<Option<StudentRow>> {
    let row = conn
        .query_row(
            "SELECT id, student_no, last_name, first_name, program_kind
             FROM students
             WHERE id = ?",
            [student_id],
            student_from_row,
        )
        .optional()?;
    Ok(row)
}

pub fn replace_enrolled_subjects(
    conn: &Connection,
    student_id: &str,
    term: &TermKey,
    subjects: &[EnrolledSubject],
) -> anyhow::Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM enrolled_subjects
         WHERE student_id = ? AND year_level = ? AND semester = ? AND school_year = ?",
        (student_id, &term.year_level, &term.semester, &term.school_year),
    )?;
    for (i, s) in subjects.iter().enumerate() {
        tx.execute(
            "INSERT INTO enrolled_subjects(
                id, student_id, year_level, semester, school_year, sort_order,
                code, description, lecture_hours, lab_hours
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                Uuid::new_v4().to_string(),
                student_id,
                term.year_level,
                term.semester,
                term.school_year,
                i as i64,
                s.code,
                s.description,
                s.lecture_hours.to_string(),
                s.lab_hours.to_string()
            ],
        )?;
    }
    tx.commit()?;
    Ok(())
}

pub fn list_enrolled_subjects(
    conn: &Connection,
    student_id: &str,
    term: &TermKey,
) -> anyhow::Result<Vec<EnrolledSubject>> {
    let mut stmt = conn.prepare(
        "SELECT code, description, lecture_hours, lab_hours
         FROM enrolled_subjects
         WHERE student_id = ? AND year_level = ? AND semester = ? AND school_year = ?
         ORDER BY sort_order",
    )?;
    let rows = stmt
        .query_map(
            (student_id, &term.year_level, &term.semester, &term.school_year),
            |r| {
                let lec: String = r.get(2)?;
                let lab: String = r.get(3)?;
                Ok(EnrolledSubject {
                    code: r.get(0)?,
                    description: r.get(1)?,
                    lecture_hours: decimal_col(&lec),
                    lab_hours: decimal_col(&lab),
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone)]
pub struct PaymentRecord {
    pub id: String,
    pub student_id: String,
    pub term: TermKey,
    pub values: SheetValues,
    pub updated_at: String,
}

fn payment_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, TermKey, String, String)> {
    Ok((
        r.get(0)?,
        r.get(1)?,
        TermKey {
            year_level: r.get(2)?,
            semester: r.get(3)?,
            school_year: r.get(4)?,
        },
        r.get(5)?,
        r.get(6)?,
    ))
}

fn into_record(
    row: (String, String, TermKey, String, String),
) -> anyhow::Result<PaymentRecord> {
    let (id, student_id, term, values_json, updated_at) = row;
    let values: SheetValues = serde_json::from_str(&values_json)
        .with_context(|| format!("payment record {} has malformed values", id))?;
    Ok(PaymentRecord {
        id,
        student_id,
        term,
        values,
        updated_at,
    })
}

pub fn get_payment_record(
    conn: &Connection,
    student_id: &str,
    term: &TermKey,
) -> anyhow::Result<Option<PaymentRecord>> {
    let row = conn
        .query_row(
            "SELECT id, student_id, year_level, semester, school_year, values_json, updated_at
             FROM payment_records
             WHERE student_id = ? AND year_level = ? AND semester = ? AND school_year = ?",
            (student_id, &term.year_level, &term.semester, &term.school_year),
            payment_from_row,
        )
        .optional()?;
    row.map(into_record).transpose()
}

/// Most recently saved record of the student for any other term.
///
/// "Most recent" is save time, not term order: term keys are free text, so
/// re-saving an older term makes it the carry-forward source for the next
/// new term. Ties on `updated_at` fall back to insertion order.
pub fn latest_prior_record(
    conn: &Connection,
    student_id: &str,
    term: &TermKey,
) -> anyhow::Result<Option<PaymentRecord>> {
    let row = conn
        .query_row(
            "SELECT id, student_id, year_level, semester, school_year, values_json, updated_at
             FROM payment_records
             WHERE student_id = ?
               AND NOT (year_level = ? AND semester = ? AND school_year = ?)
             ORDER BY updated_at DESC, rowid DESC
             LIMIT 1",
            (student_id, &term.year_level, &term.semester, &term.school_year),
            payment_from_row,
        )
        .optional()?;
    row.map(into_record).transpose()
}

/// Write the record for (student, term) and replace that term's installments.
/// Installments of other terms are left untouched.
pub fn save_payment_record(
    conn: &Connection,
    student_id: &str,
    term: &TermKey,
    values: &SheetValues,
    installments: &[InstallmentEntry],
) -> anyhow::Result<String> {
    let tx = conn.unchecked_transaction()?;

    let existing: Option<String> = tx
        .query_row(
            "SELECT id FROM payment_records
             WHERE student_id = ? AND year_level = ? AND semester = ? AND school_year = ?",
            (student_id, &term.year_level, &term.semester, &term.school_year),
            |r| r.get(0),
        )
        .optional()?;
    let record_id = existing.unwrap_or_else(|| Uuid::new_v4().to_string());
    let ts = now_ts();

    tx.execute(
        "INSERT INTO payment_records(
            id, student_id, year_level, semester, school_year, values_json,
            total_amount, remaining_amount, advance_payment, payment_date, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            values_json = excluded.values_json,
            total_amount = excluded.total_amount,
            remaining_amount = excluded.remaining_amount,
            advance_payment = excluded.advance_payment,
            payment_date = excluded.payment_date,
            updated_at = excluded.updated_at",
        params![
            record_id,
            student_id,
            term.year_level,
            term.semester,
            term.school_year,
            serde_json::to_string(values)?,
            values.total_amount.value().to_string(),
            values.remaining_amount.value().to_string(),
            values.advance_payment.value().to_string(),
            values.payment_date,
            ts
        ],
    )?;

    tx.execute(
        "DELETE FROM installments
         WHERE student_id = ? AND year_level = ? AND semester = ? AND school_year = ?",
        (student_id, &term.year_level, &term.semester, &term.school_year),
    )?;
    for e in installments.iter().filter(|e| &e.term == term) {
        tx.execute(
            "INSERT INTO installments(
                id, student_id, year_level, semester, school_year,
                payment_date, or_number, amount, created_at
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                e.id,
                student_id,
                term.year_level,
                term.semester,
                term.school_year,
                e.payment_date,
                e.or_number,
                e.amount.to_string(),
                ts
            ],
        )?;
    }

    tx.commit()?;
    Ok(record_id)
}

/// Every installment recorded for the student, across all terms.
pub fn list_installments(conn: &Connection, student_id: &str) -> anyhow::Result<Vec<InstallmentEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, year_level, semester, school_year, payment_date, or_number, amount
         FROM installments
         WHERE student_id = ?
         ORDER BY school_year, year_level, semester, payment_date, rowid",
    )?;
    let rows = stmt
        .query_map([student_id], |r| {
            let amount: String = r.get(6)?;
            Ok(InstallmentEntry {
                id: r.get(0)?,
                term: TermKey {
                    year_level: r.get(1)?,
                    semester: r.get(2)?,
                    school_year: r.get(3)?,
                },
                payment_date: r.get(4)?,
                or_number: r.get(5)?,
                amount: decimal_col(&amount),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
