use crate::db;
use crate::fees::{
    self, Adjustment, Amount, Breakdown, DerivationContext, EnrolledSubject, FeeError, FeeField,
    FeeRates, FeeSheet, OverrideFlags, ParseWarning, ProgramKind, SheetValues, Variant,
};
use crate::ledger::{InstallmentEntry, InstallmentLedger, NewInstallment, TermKey};
use rusqlite::Connection;
use serde::Serialize;
use uuid::Uuid;

/// Everything needed to start a session, already loaded.
pub struct SessionSeed {
    pub student_id: String,
    pub variant: Variant,
    pub program: ProgramKind,
    pub subjects: Vec<EnrolledSubject>,
    pub rates: FeeRates,
    pub sheet: FeeSheet,
    pub ledger: InstallmentLedger,
    pub record_id: Option<String>,
}

/// One open payment form for a (student, term) pair.
pub struct FeeSession {
    pub id: String,
    pub student_id: String,
    pub variant: Variant,
    pub program: ProgramKind,
    pub subjects: Vec<EnrolledSubject>,
    pub rates: FeeRates,
    pub record_id: Option<String>,
    sheet: FeeSheet,
    ledger: InstallmentLedger,
    breakdown: Breakdown,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: String,
    pub student_id: String,
    pub term: TermKey,
    pub variant: Variant,
    pub program: ProgramKind,
    pub record_id: Option<String>,
    pub subjects: Vec<EnrolledSubject>,
    pub values: SheetValues,
    pub overrides: OverrideFlags,
    pub breakdown: Breakdown,
    pub warnings: Vec<ParseWarning>,
    pub installments: Vec<InstallmentEntry>,
    pub historical_installments: Vec<InstallmentEntry>,
}

fn db_error(code: &str, e: anyhow::Error) -> FeeError {
    FeeError::new(code, format!("{e:#}"))
}

impl FeeSession {
    pub fn new(seed: SessionSeed) -> Self {
        let mut session = Self {
            id: Uuid::new_v4().to_string(),
            student_id: seed.student_id,
            variant: seed.variant,
            program: seed.program,
            subjects: seed.subjects,
            rates: seed.rates,
            record_id: seed.record_id,
            sheet: seed.sheet,
            ledger: seed.ledger,
            breakdown: Breakdown::default(),
        };
        session.recompute();
        session
    }

    pub fn term(&self) -> &TermKey {
        self.ledger.term()
    }

    #[cfg(test)]
    pub fn sheet(&self) -> &FeeSheet {
        &self.sheet
    }

    pub fn ledger(&self) -> &InstallmentLedger {
        &self.ledger
    }

    fn adjustment(&self) -> Adjustment {
        match self.variant {
            Variant::InitialPayment => Adjustment::CarriedCredit,
            Variant::TermPayment => Adjustment::InstallmentsPaid(self.ledger.current_total()),
        }
    }

    pub fn recompute(&mut self) {
        let ctx = DerivationContext {
            program: self.program,
            subjects: &self.subjects,
            rates: &self.rates,
            adjustment: self.adjustment(),
        };
        let out = fees::recompute(&self.sheet, &ctx);
        self.sheet = out.sheet;
        self.breakdown = out.breakdown;
    }

    pub fn edit(&mut self, field: FeeField, raw: &str) -> Result<(), FeeError> {
        self.sheet.apply_edit(field, raw)?;
        self.recompute();
        Ok(())
    }

    pub fn release(&mut self, field: FeeField) -> Result<(), FeeError> {
        self.sheet.release(field)?;
        self.recompute();
        Ok(())
    }

    fn require_term_variant(&self) -> Result<(), FeeError> {
        if self.variant == Variant::TermPayment {
            Ok(())
        } else {
            Err(FeeError::new(
                "bad_params",
                "installments are tracked on term payment sessions",
            ))
        }
    }

    pub fn add_installment(&mut self, input: NewInstallment) -> Result<InstallmentEntry, FeeError> {
        self.require_term_variant()?;
        let entry = self.ledger.add(input)?;
        self.recompute();
        Ok(entry)
    }

    pub fn remove_installment(&mut self, id: &str) -> Result<InstallmentEntry, FeeError> {
        self.require_term_variant()?;
        let entry = self.ledger.remove(id)?;
        self.recompute();
        Ok(entry)
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            session_id: self.id.clone(),
            student_id: self.student_id.clone(),
            term: self.term().clone(),
            variant: self.variant,
            program: self.program,
            record_id: self.record_id.clone(),
            subjects: self.subjects.clone(),
            values: self.sheet.values(),
            overrides: self.sheet.override_flags(),
            breakdown: self.breakdown.clone(),
            warnings: self.sheet.parse_warnings(),
            installments: self.ledger.current().to_vec(),
            historical_installments: self.ledger.historical().to_vec(),
        }
    }

    /// Validate locally, then write the sheet and this term's installments.
    pub fn save(&mut self, conn: &Connection) -> Result<String, FeeError> {
        fees::validate_for_save(&self.sheet)?;
        let record_id = db::save_payment_record(
            conn,
            &self.student_id,
            self.ledger.term(),
            &self.sheet.values(),
            self.ledger.current(),
        )
        .map_err(|e| db_error("db_save_failed", e))?;
        tracing::info!(
            student_id = %self.student_id,
            record_id = %record_id,
            installments = self.ledger.current().len(),
            "payment record saved"
        );
        self.record_id = Some(record_id.clone());
        Ok(record_id)
    }
}

/// Load collaborator data for (student, term) and start a session.
///
/// An existing record opens frozen. A new initial-payment record carries the
/// balance and credit of the student's most recent other term.
pub fn open(
    conn: &Connection,
    student_id: &str,
    term: TermKey,
    variant: Variant,
) -> Result<FeeSession, FeeError> {
    let student = db::get_student(conn, student_id)
        .map_err(|e| db_error("db_query_failed", e))?
        .ok_or_else(|| FeeError::new("not_found", "student not found"))?;
    let subjects = db::list_enrolled_subjects(conn, student_id, &term)
        .map_err(|e| db_error("db_query_failed", e))?;
    let rates = db::load_fee_rates(conn).map_err(|e| db_error("db_query_failed", e))?;
    let existing = db::get_payment_record(conn, student_id, &term)
        .map_err(|e| db_error("db_query_failed", e))?;

    let (sheet, record_id) = match existing {
        Some(rec) => (FeeSheet::frozen(&rec.values), Some(rec.id)),
        None => {
            let mut sheet = FeeSheet::default();
            if variant == Variant::InitialPayment {
                let prior = db::latest_prior_record(conn, student_id, &term)
                    .map_err(|e| db_error("db_query_failed", e))?;
                if let Some(prior) = prior {
                    sheet.previous_account =
                        Amount::from_decimal(prior.values.remaining_amount.value());
                    sheet.carried_credit =
                        Amount::from_decimal(prior.values.advance_payment.value());
                }
            }
            (sheet, None)
        }
    };

    let entries = db::list_installments(conn, student_id)
        .map_err(|e| db_error("db_query_failed", e))?;
    let ledger = InstallmentLedger::with_entries(term, entries);

    let session = FeeSession::new(SessionSeed {
        student_id: student.id,
        variant,
        program: student.program,
        subjects,
        rates,
        sheet,
        ledger,
        record_id,
    });
    tracing::info!(
        session_id = %session.id,
        student_id = %session.student_id,
        frozen = session.record_id.is_some(),
        "fee session opened"
    );
    Ok(session)
}
