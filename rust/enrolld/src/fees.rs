use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Number of equal installments the outstanding balance is split into.
pub const INSTALLMENT_COUNT: u32 = 4;

const MONEY_DP: u32 = 2;

/// Round half away from zero to centavos and carry the value at scale 2,
/// so `668` renders as `668.00`.
pub fn money(value: Decimal) -> Decimal {
    let mut v = value.round_dp_with_strategy(MONEY_DP, RoundingStrategy::MidpointAwayFromZero);
    v.rescale(MONEY_DP);
    v
}

#[derive(Debug, Clone, Serialize)]
pub struct FeeError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl FeeError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl fmt::Display for FeeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for FeeError {}

/// Largest value a single entry may hold. Anything above it is treated like
/// any other unusable input, which keeps every sum well inside `Decimal`.
pub const MAX_ENTRY: Decimal = dec!(999999999999.99);

/// Why a non-empty entry was counted as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryIssue {
    NotANumber,
    Negative,
    OutOfRange,
}

impl EntryIssue {
    /// Classify a decimal that parsed. `None` means it is usable as is.
    pub fn check(value: Decimal) -> Option<Self> {
        if value < Decimal::ZERO {
            Some(Self::Negative)
        } else if value > MAX_ENTRY {
            Some(Self::OutOfRange)
        } else {
            None
        }
    }
}

/// A user-typed numeric entry.
///
/// The raw text is kept for redisplay. Text that is not a decimal in
/// `0..=MAX_ENTRY` counts as zero in every calculation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Amount {
    raw: String,
    value: Decimal,
    issue: Option<EntryIssue>,
}

impl Amount {
    pub fn parse(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let trimmed = raw.trim();
        let (value, issue) = match Decimal::from_str(trimmed) {
            Ok(v) => match EntryIssue::check(v) {
                None => (v, None),
                issue => (Decimal::ZERO, issue),
            },
            Err(_) if trimmed.is_empty() => (Decimal::ZERO, None),
            Err(_) => (Decimal::ZERO, Some(EntryIssue::NotANumber)),
        };
        Self { raw, value, issue }
    }

    pub fn from_decimal(value: Decimal) -> Self {
        Self {
            raw: value.to_string(),
            value,
            issue: None,
        }
    }

    pub fn value(&self) -> Decimal {
        self.value
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn issue(&self) -> Option<EntryIssue> {
        self.issue
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawAmount {
            Text(String),
            Number(serde_json::Number),
            Empty(()),
        }

        Ok(match RawAmount::deserialize(deserializer)? {
            RawAmount::Text(s) => Amount::parse(s),
            RawAmount::Number(n) => Amount::parse(n.to_string()),
            RawAmount::Empty(()) => Amount::default(),
        })
    }
}

/// A field the deriver can compute. `Manual` means the cashier locked the
/// value and recomputation must leave it alone.
#[derive(Debug, Clone, PartialEq)]
pub enum Derived {
    Auto(Decimal),
    Manual(Amount),
}

impl Default for Derived {
    fn default() -> Self {
        Derived::Auto(Decimal::ZERO)
    }
}

impl Derived {
    pub fn value(&self) -> Decimal {
        match self {
            Derived::Auto(v) => *v,
            Derived::Manual(a) => a.value(),
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, Derived::Manual(_))
    }

    fn resolve(&mut self, computed: Decimal) -> Decimal {
        if let Derived::Auto(v) = self {
            *v = money(computed);
        }
        self.value()
    }

    fn release(&mut self) {
        if self.is_manual() {
            *self = Derived::Auto(self.value());
        }
    }

    fn display(&self) -> Amount {
        match self {
            Derived::Auto(v) => Amount::from_decimal(money(*v)),
            Derived::Manual(a) => a.clone(),
        }
    }

    fn with_flag(amount: &Amount, manual: bool) -> Self {
        if manual {
            Derived::Manual(amount.clone())
        } else {
            Derived::Auto(amount.value())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProgramKind {
    #[serde(rename = "SHS")]
    Shs,
    Diploma,
    Bachelor,
}

impl ProgramKind {
    pub fn parse(s: &str) -> Option<Self> {
        let t = s.trim();
        if t.eq_ignore_ascii_case("shs") {
            Some(Self::Shs)
        } else if t.eq_ignore_ascii_case("diploma") {
            Some(Self::Diploma)
        } else if t.eq_ignore_ascii_case("bachelor") {
            Some(Self::Bachelor)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shs => "SHS",
            Self::Diploma => "Diploma",
            Self::Bachelor => "Bachelor",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrolledSubject {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub lecture_hours: Decimal,
    #[serde(default)]
    pub lab_hours: Decimal,
}

#[cfg(test)]
impl EnrolledSubject {
    pub fn hours(lecture_hours: Decimal, lab_hours: Decimal) -> Self {
        Self {
            code: String::new(),
            description: String::new(),
            lecture_hours,
            lab_hours,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeeRates {
    pub lecture_rate: Decimal,
    pub lab_rate: Decimal,
    pub bundled_program_fee: Decimal,
}

impl Default for FeeRates {
    fn default() -> Self {
        Self {
            lecture_rate: dec!(528),
            lab_rate: dec!(350),
            bundled_program_fee: dec!(17750),
        }
    }
}

impl FeeRates {
    pub fn bundled_fee_for(&self, program: ProgramKind) -> Decimal {
        match program {
            ProgramKind::Shs | ProgramKind::Diploma => self.bundled_program_fee,
            ProgramKind::Bachelor => Decimal::ZERO,
        }
    }
}

/// Which payment form the sheet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Variant {
    #[serde(rename = "initial")]
    InitialPayment,
    #[serde(rename = "term")]
    TermPayment,
}

impl Variant {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initial" => Some(Self::InitialPayment),
            "term" => Some(Self::TermPayment),
            _ => None,
        }
    }
}

/// What gets taken off the balance before the remaining amount is known.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Adjustment {
    /// Subtract the credit carried in from the prior term from the gross total.
    CarriedCredit,
    /// Subtract installments already paid in the current term from the balance.
    InstallmentsPaid(Decimal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FeeField {
    PreviousAccount,
    CarriedCredit,
    AdvancePayment,
    RegistrationFee,
    MiscellaneousFee,
    OtherFees,
    TuitionFee,
    LaboratoryFee,
    BundledProgramFee,
    TotalAmount,
    DiscountPercent,
    DiscountDeduction,
    PaymentAmount,
    RemainingAmount,
    TermPayment,
    PaymentDate,
}

impl FeeField {
    pub const ALL: [FeeField; 16] = [
        FeeField::PreviousAccount,
        FeeField::CarriedCredit,
        FeeField::AdvancePayment,
        FeeField::RegistrationFee,
        FeeField::MiscellaneousFee,
        FeeField::OtherFees,
        FeeField::TuitionFee,
        FeeField::LaboratoryFee,
        FeeField::BundledProgramFee,
        FeeField::TotalAmount,
        FeeField::DiscountPercent,
        FeeField::DiscountDeduction,
        FeeField::PaymentAmount,
        FeeField::RemainingAmount,
        FeeField::TermPayment,
        FeeField::PaymentDate,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Self::PreviousAccount => "previousAccount",
            Self::CarriedCredit => "carriedCredit",
            Self::AdvancePayment => "advancePayment",
            Self::RegistrationFee => "registrationFee",
            Self::MiscellaneousFee => "miscellaneousFee",
            Self::OtherFees => "otherFees",
            Self::TuitionFee => "tuitionFee",
            Self::LaboratoryFee => "laboratoryFee",
            Self::BundledProgramFee => "bundledProgramFee",
            Self::TotalAmount => "totalAmount",
            Self::DiscountPercent => "discountPercent",
            Self::DiscountDeduction => "discountDeduction",
            Self::PaymentAmount => "paymentAmount",
            Self::RemainingAmount => "remainingAmount",
            Self::TermPayment => "termPayment",
            Self::PaymentDate => "paymentDate",
        }
    }

    pub fn parse(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.key() == key)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OverrideFlags {
    pub tuition_fee: bool,
    pub laboratory_fee: bool,
    pub bundled_program_fee: bool,
    pub total_amount: bool,
    pub discount_deduction: bool,
    pub term_payment: bool,
    pub advance_payment: bool,
}

impl OverrideFlags {
    /// The set applied when an existing payment record is opened.
    pub fn all_set() -> Self {
        Self {
            tuition_fee: true,
            laboratory_fee: true,
            bundled_program_fee: true,
            total_amount: true,
            discount_deduction: true,
            term_payment: true,
            advance_payment: true,
        }
    }
}

/// Flat record exchanged with the UI and persisted with a payment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SheetValues {
    pub previous_account: Amount,
    pub carried_credit: Amount,
    pub advance_payment: Amount,
    pub registration_fee: Amount,
    pub miscellaneous_fee: Amount,
    pub other_fees: Amount,
    pub tuition_fee: Amount,
    pub laboratory_fee: Amount,
    pub bundled_program_fee: Amount,
    pub total_amount: Amount,
    pub discount_percent: Amount,
    pub discount_deduction: Amount,
    pub payment_amount: Amount,
    pub remaining_amount: Amount,
    pub term_payment: Amount,
    pub payment_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseWarning {
    pub field: &'static str,
    pub raw: String,
    pub issue: EntryIssue,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeeSheet {
    pub previous_account: Amount,
    pub carried_credit: Amount,
    pub advance_payment: Derived,
    pub registration_fee: Amount,
    pub miscellaneous_fee: Amount,
    pub other_fees: Amount,
    pub tuition_fee: Derived,
    pub laboratory_fee: Derived,
    pub bundled_program_fee: Derived,
    pub total_amount: Derived,
    pub discount_percent: Amount,
    pub discount_deduction: Derived,
    pub payment_amount: Amount,
    pub remaining_amount: Decimal,
    pub term_payment: Derived,
    pub payment_date: Option<String>,
}

impl FeeSheet {
    pub fn from_values(values: &SheetValues, flags: &OverrideFlags) -> Self {
        Self {
            previous_account: values.previous_account.clone(),
            carried_credit: values.carried_credit.clone(),
            advance_payment: Derived::with_flag(&values.advance_payment, flags.advance_payment),
            registration_fee: values.registration_fee.clone(),
            miscellaneous_fee: values.miscellaneous_fee.clone(),
            other_fees: values.other_fees.clone(),
            tuition_fee: Derived::with_flag(&values.tuition_fee, flags.tuition_fee),
            laboratory_fee: Derived::with_flag(&values.laboratory_fee, flags.laboratory_fee),
            bundled_program_fee: Derived::with_flag(
                &values.bundled_program_fee,
                flags.bundled_program_fee,
            ),
            total_amount: Derived::with_flag(&values.total_amount, flags.total_amount),
            discount_percent: values.discount_percent.clone(),
            discount_deduction: Derived::with_flag(
                &values.discount_deduction,
                flags.discount_deduction,
            ),
            payment_amount: values.payment_amount.clone(),
            remaining_amount: values.remaining_amount.value().max(Decimal::ZERO),
            term_payment: Derived::with_flag(&values.term_payment, flags.term_payment),
            payment_date: values
                .payment_date
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        }
    }

    /// Sheet for an already-saved record: every derivable field is locked.
    pub fn frozen(values: &SheetValues) -> Self {
        Self::from_values(values, &OverrideFlags::all_set())
    }

    pub fn values(&self) -> SheetValues {
        SheetValues {
            previous_account: self.previous_account.clone(),
            carried_credit: self.carried_credit.clone(),
            advance_payment: self.advance_payment.display(),
            registration_fee: self.registration_fee.clone(),
            miscellaneous_fee: self.miscellaneous_fee.clone(),
            other_fees: self.other_fees.clone(),
            tuition_fee: self.tuition_fee.display(),
            laboratory_fee: self.laboratory_fee.display(),
            bundled_program_fee: self.bundled_program_fee.display(),
            total_amount: self.total_amount.display(),
            discount_percent: self.discount_percent.clone(),
            discount_deduction: self.discount_deduction.display(),
            payment_amount: self.payment_amount.clone(),
            remaining_amount: Amount::from_decimal(money(self.remaining_amount)),
            term_payment: self.term_payment.display(),
            payment_date: self.payment_date.clone(),
        }
    }

    pub fn override_flags(&self) -> OverrideFlags {
        OverrideFlags {
            tuition_fee: self.tuition_fee.is_manual(),
            laboratory_fee: self.laboratory_fee.is_manual(),
            bundled_program_fee: self.bundled_program_fee.is_manual(),
            total_amount: self.total_amount.is_manual(),
            discount_deduction: self.discount_deduction.is_manual(),
            term_payment: self.term_payment.is_manual(),
            advance_payment: self.advance_payment.is_manual(),
        }
    }

    fn input_mut(&mut self, field: FeeField) -> Option<&mut Amount> {
        match field {
            FeeField::PreviousAccount => Some(&mut self.previous_account),
            FeeField::CarriedCredit => Some(&mut self.carried_credit),
            FeeField::RegistrationFee => Some(&mut self.registration_fee),
            FeeField::MiscellaneousFee => Some(&mut self.miscellaneous_fee),
            FeeField::OtherFees => Some(&mut self.other_fees),
            FeeField::DiscountPercent => Some(&mut self.discount_percent),
            FeeField::PaymentAmount => Some(&mut self.payment_amount),
            _ => None,
        }
    }

    fn derived_mut(&mut self, field: FeeField) -> Option<&mut Derived> {
        match field {
            FeeField::AdvancePayment => Some(&mut self.advance_payment),
            FeeField::TuitionFee => Some(&mut self.tuition_fee),
            FeeField::LaboratoryFee => Some(&mut self.laboratory_fee),
            FeeField::BundledProgramFee => Some(&mut self.bundled_program_fee),
            FeeField::TotalAmount => Some(&mut self.total_amount),
            FeeField::DiscountDeduction => Some(&mut self.discount_deduction),
            FeeField::TermPayment => Some(&mut self.term_payment),
            _ => None,
        }
    }

    /// Store a value typed into `field`. Typing into a derivable field locks it.
    pub fn apply_edit(&mut self, field: FeeField, raw: &str) -> Result<(), FeeError> {
        match field {
            FeeField::RemainingAmount => Err(FeeError::new(
                "read_only",
                "remainingAmount is always derived",
            )),
            FeeField::PaymentDate => {
                let t = raw.trim();
                self.payment_date = if t.is_empty() {
                    None
                } else {
                    Some(t.to_string())
                };
                Ok(())
            }
            FeeField::PaymentAmount => {
                self.payment_amount = Amount::parse(raw);
                // A new down payment supersedes a previously locked credit.
                self.advance_payment.release();
                Ok(())
            }
            _ => {
                if let Some(slot) = self.derived_mut(field) {
                    *slot = Derived::Manual(Amount::parse(raw));
                } else if let Some(slot) = self.input_mut(field) {
                    *slot = Amount::parse(raw);
                }
                Ok(())
            }
        }
    }

    /// Hand a locked field back to automatic derivation.
    pub fn release(&mut self, field: FeeField) -> Result<(), FeeError> {
        let key = field.key();
        let Some(slot) = self.derived_mut(field) else {
            return Err(FeeError::new(
                "bad_params",
                format!("{} has no manual override", key),
            ));
        };
        slot.release();
        Ok(())
    }

    pub fn payment_date_parsed(&self) -> Option<NaiveDate> {
        self.payment_date
            .as_deref()
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
    }

    pub fn parse_warnings(&self) -> Vec<ParseWarning> {
        let mut out = Vec::new();
        let inputs: [(FeeField, &Amount); 7] = [
            (FeeField::PreviousAccount, &self.previous_account),
            (FeeField::CarriedCredit, &self.carried_credit),
            (FeeField::RegistrationFee, &self.registration_fee),
            (FeeField::MiscellaneousFee, &self.miscellaneous_fee),
            (FeeField::OtherFees, &self.other_fees),
            (FeeField::DiscountPercent, &self.discount_percent),
            (FeeField::PaymentAmount, &self.payment_amount),
        ];
        for (field, amount) in inputs {
            if let Some(issue) = amount.issue() {
                out.push(ParseWarning {
                    field: field.key(),
                    raw: amount.raw().to_string(),
                    issue,
                });
            }
        }
        let derived: [(FeeField, &Derived); 7] = [
            (FeeField::AdvancePayment, &self.advance_payment),
            (FeeField::TuitionFee, &self.tuition_fee),
            (FeeField::LaboratoryFee, &self.laboratory_fee),
            (FeeField::BundledProgramFee, &self.bundled_program_fee),
            (FeeField::TotalAmount, &self.total_amount),
            (FeeField::DiscountDeduction, &self.discount_deduction),
            (FeeField::TermPayment, &self.term_payment),
        ];
        for (field, d) in derived {
            if let Derived::Manual(a) = d {
                if let Some(issue) = a.issue() {
                    out.push(ParseWarning {
                        field: field.key(),
                        raw: a.raw().to_string(),
                        issue,
                    });
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct DerivationContext<'a> {
    pub program: ProgramKind,
    pub subjects: &'a [EnrolledSubject],
    pub rates: &'a FeeRates,
    pub adjustment: Adjustment,
}

/// Intermediate figures of one derivation pass, for display.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Breakdown {
    pub total_lecture_hours: Decimal,
    pub total_lab_hours: Decimal,
    pub gross_total: Decimal,
    pub balance_after_down_payment: Decimal,
    pub installments_paid: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Derivation {
    pub sheet: FeeSheet,
    pub breakdown: Breakdown,
}

/// Collaborator figures (hours, rates, ledger totals) are clamped into
/// `0..=MAX_ENTRY` so the additions in `recompute` cannot overflow.
fn clamp_entry(value: Decimal) -> Decimal {
    value.max(Decimal::ZERO).min(MAX_ENTRY)
}

fn capped_sum(values: impl Iterator<Item = Decimal>) -> Decimal {
    values
        .map(clamp_entry)
        .try_fold(Decimal::ZERO, |acc, v| acc.checked_add(v))
        .map_or(MAX_ENTRY, clamp_entry)
}

fn capped_product(a: Decimal, b: Decimal) -> Decimal {
    a.checked_mul(clamp_entry(b)).map_or(MAX_ENTRY, clamp_entry)
}

pub fn recompute(sheet: &FeeSheet, ctx: &DerivationContext<'_>) -> Derivation {
    let mut next = sheet.clone();

    let total_lecture_hours = capped_sum(ctx.subjects.iter().map(|s| s.lecture_hours));
    let total_lab_hours = capped_sum(ctx.subjects.iter().map(|s| s.lab_hours));

    let tuition = next
        .tuition_fee
        .resolve(capped_product(total_lecture_hours, ctx.rates.lecture_rate));
    let laboratory = next
        .laboratory_fee
        .resolve(capped_product(total_lab_hours, ctx.rates.lab_rate));
    let bundled = next
        .bundled_program_fee
        .resolve(clamp_entry(ctx.rates.bundled_fee_for(ctx.program)));

    let mut gross_total = next.previous_account.value()
        + next.registration_fee.value()
        + next.miscellaneous_fee.value()
        + next.other_fees.value()
        + tuition
        + laboratory
        + bundled;
    if ctx.adjustment == Adjustment::CarriedCredit {
        gross_total -= next.carried_credit.value();
    }

    let total = next.total_amount.resolve(gross_total);
    let discount = next
        .discount_deduction
        .resolve(total * next.discount_percent.value() / dec!(100));

    let balance_after_down_payment = total - discount - next.payment_amount.value();
    let installments_paid = match ctx.adjustment {
        Adjustment::CarriedCredit => Decimal::ZERO,
        Adjustment::InstallmentsPaid(sum) => clamp_entry(sum),
    };
    let outstanding = balance_after_down_payment - installments_paid;

    if outstanding < Decimal::ZERO {
        next.advance_payment = Derived::Auto(money(outstanding.abs()));
        next.remaining_amount = money(Decimal::ZERO);
    } else {
        next.remaining_amount = money(outstanding);
        next.advance_payment.resolve(Decimal::ZERO);
    }

    let per_term = if next.remaining_amount > Decimal::ZERO {
        next.remaining_amount / Decimal::from(INSTALLMENT_COUNT)
    } else {
        Decimal::ZERO
    };
    next.term_payment.resolve(per_term);

    Derivation {
        sheet: next,
        breakdown: Breakdown {
            total_lecture_hours,
            total_lab_hours,
            gross_total: money(gross_total),
            balance_after_down_payment: money(balance_after_down_payment),
            installments_paid: money(installments_paid),
        },
    }
}

fn is_negative(entry: &Amount) -> bool {
    entry.issue() == Some(EntryIssue::Negative)
}

/// Checks run before a payment record may be sent to storage.
pub fn validate_for_save(sheet: &FeeSheet) -> Result<(), FeeError> {
    let mut field_errors: BTreeMap<&'static str, &'static str> = BTreeMap::new();
    if is_negative(&sheet.registration_fee) {
        field_errors.insert(
            FeeField::RegistrationFee.key(),
            "registration fee cannot be negative",
        );
    }
    if is_negative(&sheet.payment_amount) {
        field_errors.insert(
            FeeField::PaymentAmount.key(),
            "payment amount cannot be negative",
        );
    }
    let total_negative = match &sheet.total_amount {
        Derived::Manual(a) => is_negative(a),
        Derived::Auto(v) => *v < Decimal::ZERO,
    };
    if total_negative {
        field_errors.insert(
            FeeField::TotalAmount.key(),
            "total amount cannot be negative",
        );
    }
    if sheet.payment_date_parsed().is_none() {
        field_errors.insert(
            FeeField::PaymentDate.key(),
            "payment date is required (YYYY-MM-DD)",
        );
    }

    if field_errors.is_empty() {
        return Ok(());
    }
    Err(
        FeeError::new("validation_failed", "payment record has invalid fields")
            .with_details(json!({ "fieldErrors": field_errors })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn subjects_10_lec_4_lab() -> Vec<EnrolledSubject> {
        vec![
            EnrolledSubject::hours(dec!(3), dec!(1)),
            EnrolledSubject::hours(dec!(3), dec!(0)),
            EnrolledSubject::hours(dec!(4), dec!(3)),
        ]
    }

    fn compute(sheet: &FeeSheet, program: ProgramKind, subjects: &[EnrolledSubject]) -> FeeSheet {
        let rates = FeeRates::default();
        let ctx = DerivationContext {
            program,
            subjects,
            rates: &rates,
            adjustment: Adjustment::CarriedCredit,
        };
        recompute(sheet, &ctx).sheet
    }

    #[test]
    fn bachelor_scenario_matches_worked_example() {
        let out = compute(
            &FeeSheet::default(),
            ProgramKind::Bachelor,
            &subjects_10_lec_4_lab(),
        );
        assert_eq!(out.tuition_fee.value(), dec!(5280));
        assert_eq!(out.laboratory_fee.value(), dec!(1400));
        assert_eq!(out.bundled_program_fee.value(), dec!(0));
        assert_eq!(out.total_amount.value(), dec!(6680));
        assert_eq!(out.remaining_amount, dec!(6680));
        assert_eq!(out.term_payment.value(), dec!(1670));
    }

    #[test]
    fn exact_payment_clears_balance_without_credit() {
        let mut sheet = FeeSheet::default();
        sheet.apply_edit(FeeField::PaymentAmount, "6680").unwrap();
        let out = compute(&sheet, ProgramKind::Bachelor, &subjects_10_lec_4_lab());
        assert_eq!(out.remaining_amount, dec!(0));
        assert_eq!(out.advance_payment.value(), dec!(0));
        assert_eq!(out.term_payment.value(), dec!(0));
    }

    #[test]
    fn overpayment_becomes_advance_credit() {
        let mut sheet = FeeSheet::default();
        sheet.apply_edit(FeeField::PaymentAmount, "7000").unwrap();
        let out = compute(&sheet, ProgramKind::Bachelor, &subjects_10_lec_4_lab());
        assert_eq!(out.remaining_amount, dec!(0));
        assert_eq!(out.advance_payment.value(), dec!(320));
    }

    #[test]
    fn discount_percent_is_rendered_in_centavos() {
        let mut sheet = FeeSheet::default();
        sheet.apply_edit(FeeField::DiscountPercent, "10").unwrap();
        let out = compute(&sheet, ProgramKind::Bachelor, &subjects_10_lec_4_lab());
        assert_eq!(out.discount_deduction.value(), dec!(668));
        assert_eq!(out.values().discount_deduction.raw(), "668.00");
        assert_eq!(out.remaining_amount, dec!(6012));
    }

    #[test]
    fn bundled_fee_follows_program_kind() {
        for (program, expected) in [
            (ProgramKind::Shs, dec!(17750)),
            (ProgramKind::Diploma, dec!(17750)),
            (ProgramKind::Bachelor, dec!(0)),
        ] {
            let out = compute(&FeeSheet::default(), program, &[]);
            assert_eq!(out.bundled_program_fee.value(), expected, "{:?}", program);
        }
    }

    #[test]
    fn manual_tuition_survives_subject_changes() {
        let mut sheet = FeeSheet::default();
        sheet.apply_edit(FeeField::TuitionFee, "1000").unwrap();
        let out = compute(&sheet, ProgramKind::Bachelor, &subjects_10_lec_4_lab());
        assert_eq!(out.tuition_fee.value(), dec!(1000));
        assert_eq!(out.total_amount.value(), dec!(2400));
    }

    #[test]
    fn unparseable_input_counts_as_zero_and_keeps_raw_text() {
        let mut sheet = FeeSheet::default();
        sheet.apply_edit(FeeField::RegistrationFee, "1O0").unwrap();
        let out = compute(&sheet, ProgramKind::Bachelor, &[]);
        assert_eq!(out.total_amount.value(), dec!(0));
        assert_eq!(out.values().registration_fee.raw(), "1O0");
        assert_eq!(
            out.parse_warnings(),
            vec![ParseWarning {
                field: "registrationFee",
                raw: "1O0".to_string(),
                issue: EntryIssue::NotANumber,
            }]
        );
    }

    #[test]
    fn entries_beyond_decimal_headroom_count_as_zero() {
        let mut sheet = FeeSheet::default();
        sheet
            .apply_edit(FeeField::RegistrationFee, "79228162514264337593543950335")
            .unwrap();
        sheet.apply_edit(FeeField::MiscellaneousFee, "1").unwrap();
        sheet
            .apply_edit(FeeField::TuitionFee, "79228162514264337593543950335")
            .unwrap();
        let out = compute(&sheet, ProgramKind::Bachelor, &[]);
        assert_eq!(out.total_amount.value(), dec!(1));
        let issues: Vec<_> = out
            .parse_warnings()
            .into_iter()
            .map(|w| (w.field, w.issue))
            .collect();
        assert_eq!(
            issues,
            vec![
                ("registrationFee", EntryIssue::OutOfRange),
                ("tuitionFee", EntryIssue::OutOfRange),
            ]
        );
    }

    #[test]
    fn oversized_hours_and_rates_saturate_instead_of_overflowing() {
        let rates = FeeRates {
            lecture_rate: Decimal::MAX,
            lab_rate: dec!(350),
            bundled_program_fee: Decimal::MAX,
        };
        let subjects = vec![
            EnrolledSubject::hours(Decimal::MAX, Decimal::MAX),
            EnrolledSubject::hours(Decimal::MAX, dec!(-4)),
        ];
        let out = recompute(
            &FeeSheet::default(),
            &DerivationContext {
                program: ProgramKind::Shs,
                subjects: &subjects,
                rates: &rates,
                adjustment: Adjustment::InstallmentsPaid(Decimal::MAX),
            },
        );
        assert_eq!(out.sheet.tuition_fee.value(), MAX_ENTRY);
        assert_eq!(out.sheet.laboratory_fee.value(), MAX_ENTRY);
        assert_eq!(out.sheet.bundled_program_fee.value(), MAX_ENTRY);
        assert_eq!(out.breakdown.installments_paid, MAX_ENTRY);
        assert!(out.sheet.remaining_amount >= Decimal::ZERO);
    }

    #[test]
    fn negative_entries_are_flagged_and_count_as_zero() {
        let mut sheet = FeeSheet::default();
        sheet.apply_edit(FeeField::AdvancePayment, "-250").unwrap();
        sheet.apply_edit(FeeField::OtherFees, "-40").unwrap();
        let out = compute(&sheet, ProgramKind::Bachelor, &subjects_10_lec_4_lab());
        assert!(out.override_flags().advance_payment);
        assert_eq!(out.advance_payment.value(), dec!(0));
        assert_eq!(out.total_amount.value(), dec!(6680));
        let fields: Vec<_> = out
            .parse_warnings()
            .into_iter()
            .filter(|w| w.issue == EntryIssue::Negative)
            .map(|w| w.field)
            .collect();
        assert_eq!(fields, vec!["otherFees", "advancePayment"]);
        assert_eq!(out.values().advance_payment.raw(), "-250");
    }

    #[test]
    fn empty_input_is_zero_without_warning() {
        let mut sheet = FeeSheet::default();
        sheet.apply_edit(FeeField::OtherFees, "  ").unwrap();
        assert!(sheet.parse_warnings().is_empty());
        assert_eq!(sheet.other_fees.value(), dec!(0));
    }

    #[test]
    fn payment_amount_edit_releases_advance_lock() {
        let mut sheet = FeeSheet::default();
        sheet.apply_edit(FeeField::AdvancePayment, "500").unwrap();
        assert!(sheet.override_flags().advance_payment);
        sheet.apply_edit(FeeField::PaymentAmount, "100").unwrap();
        assert!(!sheet.override_flags().advance_payment);
    }

    #[test]
    fn carried_credit_reduces_initial_total_only() {
        let mut sheet = FeeSheet::default();
        sheet.apply_edit(FeeField::CarriedCredit, "680").unwrap();
        let out = compute(&sheet, ProgramKind::Bachelor, &subjects_10_lec_4_lab());
        assert_eq!(out.total_amount.value(), dec!(6000));

        let rates = FeeRates::default();
        let subjects = subjects_10_lec_4_lab();
        let term = recompute(
            &sheet,
            &DerivationContext {
                program: ProgramKind::Bachelor,
                subjects: &subjects,
                rates: &rates,
                adjustment: Adjustment::InstallmentsPaid(dec!(1000)),
            },
        );
        assert_eq!(term.sheet.total_amount.value(), dec!(6680));
        assert_eq!(term.sheet.remaining_amount, dec!(5680));
        assert_eq!(term.breakdown.installments_paid, dec!(1000));
    }

    #[test]
    fn installments_beyond_balance_turn_into_credit() {
        let rates = FeeRates::default();
        let subjects = subjects_10_lec_4_lab();
        let out = recompute(
            &FeeSheet::default(),
            &DerivationContext {
                program: ProgramKind::Bachelor,
                subjects: &subjects,
                rates: &rates,
                adjustment: Adjustment::InstallmentsPaid(dec!(7000)),
            },
        );
        assert_eq!(out.sheet.remaining_amount, dec!(0));
        assert_eq!(out.sheet.advance_payment.value(), dec!(320));
    }

    #[test]
    fn frozen_sheet_locks_everything_but_remaining() {
        let derived = compute(
            &FeeSheet::default(),
            ProgramKind::Bachelor,
            &subjects_10_lec_4_lab(),
        );
        let mut loaded = FeeSheet::frozen(&derived.values());
        assert_eq!(loaded.override_flags(), OverrideFlags::all_set());

        loaded.apply_edit(FeeField::RegistrationFee, "500").unwrap();
        let out = compute(&loaded, ProgramKind::Bachelor, &subjects_10_lec_4_lab());
        assert_eq!(out.tuition_fee.value(), dec!(5280));
        assert_eq!(out.total_amount.value(), dec!(6680));
        assert_eq!(out.remaining_amount, dec!(6680));
    }

    #[test]
    fn remaining_amount_cannot_be_edited() {
        let mut sheet = FeeSheet::default();
        let e = sheet
            .apply_edit(FeeField::RemainingAmount, "10")
            .unwrap_err();
        assert_eq!(e.code, "read_only");
    }

    #[test]
    fn release_returns_field_to_auto() {
        let mut sheet = FeeSheet::default();
        sheet.apply_edit(FeeField::TuitionFee, "1").unwrap();
        sheet.release(FeeField::TuitionFee).unwrap();
        let out = compute(&sheet, ProgramKind::Bachelor, &subjects_10_lec_4_lab());
        assert_eq!(out.tuition_fee.value(), dec!(5280));
        assert!(sheet.release(FeeField::RegistrationFee).is_err());
    }

    #[test]
    fn save_validation_reports_each_field() {
        let mut sheet = FeeSheet::default();
        sheet.apply_edit(FeeField::RegistrationFee, "-1").unwrap();
        sheet.apply_edit(FeeField::PaymentAmount, "-2").unwrap();
        sheet.apply_edit(FeeField::TotalAmount, "-3").unwrap();
        let e = validate_for_save(&sheet).unwrap_err();
        assert_eq!(e.code, "validation_failed");
        let fields = e.details.unwrap()["fieldErrors"].clone();
        for key in ["registrationFee", "paymentAmount", "totalAmount", "paymentDate"] {
            assert!(fields.get(key).is_some(), "missing {}", key);
        }

        let mut ok_sheet = FeeSheet::default();
        ok_sheet
            .apply_edit(FeeField::PaymentDate, "2024-06-03")
            .unwrap();
        assert!(validate_for_save(&ok_sheet).is_ok());
        assert_eq!(
            ok_sheet.payment_date_parsed(),
            NaiveDate::from_ymd_opt(2024, 6, 3)
        );
    }

    #[test]
    fn amount_deserializes_from_numbers_strings_and_null() {
        let v: SheetValues = serde_json::from_value(serde_json::json!({
            "registrationFee": 1500,
            "otherFees": "12.5",
            "miscellaneousFee": null
        }))
        .unwrap();
        assert_eq!(v.registration_fee.value(), dec!(1500));
        assert_eq!(v.other_fees.raw(), "12.5");
        assert_eq!(v.miscellaneous_fee.value(), dec!(0));
    }

    fn cents() -> impl Strategy<Value = Decimal> {
        (0i64..5_000_000).prop_map(|c| Decimal::new(c, 2))
    }

    fn hours() -> impl Strategy<Value = Decimal> {
        (0i64..120).prop_map(|h| Decimal::new(h, 1))
    }

    /// Typed text as a cashier might enter it, typos and sign slips included.
    fn entry() -> impl Strategy<Value = Amount> {
        prop_oneof![
            6 => cents().prop_map(|c| Amount::parse(c.to_string())),
            1 => cents().prop_map(|c| Amount::parse(format!("-{}", c))),
            1 => Just(Amount::parse("79228162514264337593543950335")),
            1 => Just(Amount::parse("1O0")),
            1 => Just(Amount::parse("")),
        ]
    }

    fn arb_sheet() -> impl Strategy<Value = FeeSheet> {
        (
            (entry(), entry(), entry(), entry(), entry()),
            (
                prop_oneof![
                    (0i64..=100).prop_map(|p| Amount::parse(p.to_string())),
                    entry()
                ],
                entry(),
            ),
            proptest::collection::vec(any::<bool>(), 7),
            proptest::collection::vec(entry(), 7),
        )
            .prop_map(|((prev, credit, reg, misc, other), (pct, pay), flags, manual)| {
                let values = SheetValues {
                    previous_account: prev,
                    carried_credit: credit,
                    registration_fee: reg,
                    miscellaneous_fee: misc,
                    other_fees: other,
                    discount_percent: pct,
                    payment_amount: pay,
                    advance_payment: manual[0].clone(),
                    tuition_fee: manual[1].clone(),
                    laboratory_fee: manual[2].clone(),
                    bundled_program_fee: manual[3].clone(),
                    total_amount: manual[4].clone(),
                    discount_deduction: manual[5].clone(),
                    term_payment: manual[6].clone(),
                    ..SheetValues::default()
                };
                let flags = OverrideFlags {
                    advance_payment: flags[0],
                    tuition_fee: flags[1],
                    laboratory_fee: flags[2],
                    bundled_program_fee: flags[3],
                    total_amount: flags[4],
                    discount_deduction: flags[5],
                    term_payment: flags[6],
                };
                FeeSheet::from_values(&values, &flags)
            })
    }

    fn arb_adjustment() -> impl Strategy<Value = Adjustment> {
        prop_oneof![
            Just(Adjustment::CarriedCredit),
            cents().prop_map(Adjustment::InstallmentsPaid),
        ]
    }

    fn arb_program() -> impl Strategy<Value = ProgramKind> {
        prop_oneof![
            Just(ProgramKind::Shs),
            Just(ProgramKind::Diploma),
            Just(ProgramKind::Bachelor),
        ]
    }

    proptest! {
        #[test]
        fn recompute_is_idempotent(
            sheet in arb_sheet(),
            program in arb_program(),
            adjustment in arb_adjustment(),
            subject_hours in proptest::collection::vec((hours(), hours()), 0..8),
        ) {
            let subjects: Vec<EnrolledSubject> = subject_hours
                .into_iter()
                .map(|(lec, lab)| EnrolledSubject::hours(lec, lab))
                .collect();
            let rates = FeeRates::default();
            let ctx = DerivationContext { program, subjects: &subjects, rates: &rates, adjustment };
            let once = recompute(&sheet, &ctx);
            let twice = recompute(&once.sheet, &ctx);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn locked_fields_are_left_alone(
            sheet in arb_sheet(),
            program in arb_program(),
            adjustment in arb_adjustment(),
            lec in hours(),
            lab in hours(),
        ) {
            let subjects = vec![EnrolledSubject::hours(lec, lab)];
            let rates = FeeRates::default();
            let ctx = DerivationContext { program, subjects: &subjects, rates: &rates, adjustment };
            let out = recompute(&sheet, &ctx).sheet;
            for (before, after) in [
                (&sheet.tuition_fee, &out.tuition_fee),
                (&sheet.laboratory_fee, &out.laboratory_fee),
                (&sheet.bundled_program_fee, &out.bundled_program_fee),
                (&sheet.total_amount, &out.total_amount),
                (&sheet.discount_deduction, &out.discount_deduction),
                (&sheet.term_payment, &out.term_payment),
            ] {
                if before.is_manual() {
                    prop_assert_eq!(before, after);
                }
            }
        }

        #[test]
        fn balances_never_go_negative(
            sheet in arb_sheet(),
            program in arb_program(),
            adjustment in arb_adjustment(),
        ) {
            let rates = FeeRates::default();
            let ctx = DerivationContext { program, subjects: &[], rates: &rates, adjustment };
            let out = recompute(&sheet, &ctx);
            prop_assert!(out.sheet.remaining_amount >= Decimal::ZERO);
            prop_assert!(out.sheet.advance_payment.value() >= Decimal::ZERO);
            prop_assert!(out.sheet.term_payment.value() >= Decimal::ZERO);
        }

        #[test]
        fn credit_and_debt_are_exclusive(
            sheet in arb_sheet(),
            paid in cents(),
        ) {
            let mut sheet = sheet;
            sheet.advance_payment = Derived::Auto(Decimal::ZERO);
            let rates = FeeRates::default();
            let ctx = DerivationContext {
                program: ProgramKind::Bachelor,
                subjects: &[],
                rates: &rates,
                adjustment: Adjustment::InstallmentsPaid(paid),
            };
            let out = recompute(&sheet, &ctx).sheet;
            prop_assert!(
                out.remaining_amount == Decimal::ZERO
                    || out.advance_payment.value() == Decimal::ZERO
            );
        }

        #[test]
        fn payment_edit_always_unlocks_advance(sheet in arb_sheet(), pay in cents()) {
            let mut sheet = sheet;
            sheet.apply_edit(FeeField::PaymentAmount, &pay.to_string()).unwrap();
            prop_assert!(!sheet.override_flags().advance_payment);
        }
    }
}
