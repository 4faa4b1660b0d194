use crate::fees::{money, Amount, FeeError};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

/// Academic term an installment or payment record belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TermKey {
    pub year_level: String,
    pub semester: String,
    pub school_year: String,
}

impl TermKey {
    pub fn new(
        year_level: impl Into<String>,
        semester: impl Into<String>,
        school_year: impl Into<String>,
    ) -> Self {
        Self {
            year_level: year_level.into().trim().to_string(),
            semester: semester.into().trim().to_string(),
            school_year: school_year.into().trim().to_string(),
        }
    }

    pub fn from_json(raw: Option<&serde_json::Value>) -> Result<Self, FeeError> {
        let Some(raw) = raw else {
            return Err(FeeError::new("bad_params", "missing term"));
        };
        let parsed: TermKey = serde_json::from_value(raw.clone())
            .map_err(|e| FeeError::new("bad_params", format!("invalid term: {}", e)))?;
        let key = TermKey::new(parsed.year_level, parsed.semester, parsed.school_year);
        for (name, v) in [
            ("term.yearLevel", &key.year_level),
            ("term.semester", &key.semester),
            ("term.schoolYear", &key.school_year),
        ] {
            if v.is_empty() {
                return Err(FeeError::new(
                    "bad_params",
                    format!("{} must not be empty", name),
                ));
            }
        }
        Ok(key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallmentEntry {
    pub id: String,
    pub term: TermKey,
    pub payment_date: String,
    pub or_number: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewInstallment {
    pub payment_date: String,
    pub or_number: String,
    pub amount: Amount,
}

/// Installments paid toward one student's balance.
///
/// Entries for `term` are editable. Entries from any other term are kept for
/// display only and never count toward the current balance.
#[derive(Debug, Clone)]
pub struct InstallmentLedger {
    term: TermKey,
    current: Vec<InstallmentEntry>,
    historical: Vec<InstallmentEntry>,
}

impl InstallmentLedger {
    pub fn with_entries(term: TermKey, entries: Vec<InstallmentEntry>) -> Self {
        let (current, historical): (Vec<_>, Vec<_>) = entries.into_iter().partition(|e| e.term == term);
        Self {
            term,
            current,
            historical,
        }
    }

    pub fn term(&self) -> &TermKey {
        &self.term
    }

    pub fn current(&self) -> &[InstallmentEntry] {
        &self.current
    }

    pub fn historical(&self) -> &[InstallmentEntry] {
        &self.historical
    }

    pub fn current_total(&self) -> Decimal {
        self.current.iter().map(|e| e.amount).sum()
    }

    pub fn add(&mut self, input: NewInstallment) -> Result<InstallmentEntry, FeeError> {
        if input.amount.value() <= Decimal::ZERO {
            return Err(FeeError::new(
                "validation_failed",
                "Installment amount must be greater than zero",
            )
            .with_details(json!({ "fieldErrors": { "amount": "must be greater than zero" } })));
        }
        let payment_date = input.payment_date.trim().to_string();
        if payment_date.is_empty() {
            return Err(FeeError::new("validation_failed", "Payment date is required")
                .with_details(json!({ "fieldErrors": { "paymentDate": "is required" } })));
        }

        let entry = InstallmentEntry {
            id: Uuid::new_v4().to_string(),
            term: self.term.clone(),
            payment_date,
            or_number: input.or_number.trim().to_string(),
            amount: money(input.amount.value()),
        };
        self.current.push(entry.clone());
        Ok(entry)
    }

    pub fn remove(&mut self, id: &str) -> Result<InstallmentEntry, FeeError> {
        if let Some(pos) = self.current.iter().position(|e| e.id == id) {
            return Ok(self.current.remove(pos));
        }
        if self.historical.iter().any(|e| e.id == id) {
            return Err(FeeError::new(
                "read_only",
                "installments from another term cannot be removed",
            ));
        }
        Err(FeeError::new("not_found", "installment not found"))
    }
}
