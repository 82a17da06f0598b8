use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Payment state of a fee account for one academic year.
///
/// Stored alongside the totals as a materialized cache; always recomputed
/// from the arithmetic truth via `derive_status`, never edited directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeStatus {
    Pending,
    Partial,
    Paid,
    Overdue,
}

impl FeeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FeeStatus::Pending => "pending",
            FeeStatus::Partial => "partial",
            FeeStatus::Paid => "paid",
            FeeStatus::Overdue => "overdue",
        }
    }

    #[allow(dead_code)]
    pub fn parse(s: &str) -> Option<FeeStatus> {
        match s {
            "pending" => Some(FeeStatus::Pending),
            "partial" => Some(FeeStatus::Partial),
            "paid" => Some(FeeStatus::Paid),
            "overdue" => Some(FeeStatus::Overdue),
            _ => None,
        }
    }
}

impl fmt::Display for FeeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a payment was made. Receipts keep the mode for reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentMode {
    Cash,
    Upi,
    BankTransfer,
    Cheque,
    Online,
}

impl PaymentMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMode::Cash => "cash",
            PaymentMode::Upi => "upi",
            PaymentMode::BankTransfer => "bank_transfer",
            PaymentMode::Cheque => "cheque",
            PaymentMode::Online => "online",
        }
    }

    pub fn parse(s: &str) -> Option<PaymentMode> {
        match s {
            "cash" => Some(PaymentMode::Cash),
            "upi" => Some(PaymentMode::Upi),
            "bank_transfer" => Some(PaymentMode::BankTransfer),
            "cheque" => Some(PaymentMode::Cheque),
            "online" => Some(PaymentMode::Online),
            _ => None,
        }
    }
}

pub fn balance(total_fee: Decimal, total_paid: Decimal) -> Decimal {
    total_fee - total_paid
}

/// Pure status derivation. Precedence: paid, overdue, partial, pending.
///
/// `due_date_passed` is injected by the caller; the ledger does no
/// due-date arithmetic of its own.
pub fn derive_status(total_fee: Decimal, total_paid: Decimal, due_date_passed: bool) -> FeeStatus {
    if balance(total_fee, total_paid) <= Decimal::ZERO {
        return FeeStatus::Paid;
    }
    if due_date_passed {
        return FeeStatus::Overdue;
    }
    if total_paid > Decimal::ZERO {
        FeeStatus::Partial
    } else {
        FeeStatus::Pending
    }
}

/// Receipt numbers: `<academicYear>-<sequence>` with the sequence
/// zero-padded to six digits. Sortable within a year, never reused.
pub fn format_receipt_no(academic_year: &str, seq: i64) -> String {
    format!("{}-{:06}", academic_year, seq)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseAmountError {
    Invalid,
    TooPrecise,
}

impl fmt::Display for ParseAmountError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseAmountError::Invalid => write!(f, "not a valid decimal amount"),
            ParseAmountError::TooPrecise => write!(f, "amounts carry at most two decimal places"),
        }
    }
}

impl std::error::Error for ParseAmountError {}

/// Parse a money amount from its text form. Exact decimal, no floats;
/// more than two decimal places is rejected rather than rounded.
pub fn parse_amount(raw: &str) -> Result<Decimal, ParseAmountError> {
    let d = Decimal::from_str(raw.trim()).map_err(|_| ParseAmountError::Invalid)?;
    if d.normalize().scale() > 2 {
        return Err(ParseAmountError::TooPrecise);
    }
    Ok(d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).expect("decimal literal")
    }

    #[test]
    fn status_follows_balance_and_due_date() {
        // Fully paid wins regardless of the due date.
        assert_eq!(derive_status(dec("1000"), dec("1000"), false), FeeStatus::Paid);
        assert_eq!(derive_status(dec("1000"), dec("1000"), true), FeeStatus::Paid);
        // Overpayment still reads as paid.
        assert_eq!(derive_status(dec("1000"), dec("1200"), true), FeeStatus::Paid);
        // Zero-fee accounts have nothing outstanding.
        assert_eq!(derive_status(Decimal::ZERO, Decimal::ZERO, false), FeeStatus::Paid);

        // Past the due date, anything outstanding is overdue.
        assert_eq!(derive_status(dec("1000"), dec("400"), true), FeeStatus::Overdue);
        assert_eq!(derive_status(dec("1000"), Decimal::ZERO, true), FeeStatus::Overdue);

        // Before the due date the split is partial vs pending.
        assert_eq!(derive_status(dec("1000"), dec("400"), false), FeeStatus::Partial);
        assert_eq!(derive_status(dec("1000"), Decimal::ZERO, false), FeeStatus::Pending);
        assert_eq!(derive_status(dec("1000"), dec("0.01"), false), FeeStatus::Partial);
    }

    #[test]
    fn status_derivation_is_idempotent() {
        let cases = [
            (dec("1000"), dec("0"), false),
            (dec("1000"), dec("400"), false),
            (dec("1000"), dec("400"), true),
            (dec("1000"), dec("1000"), true),
        ];
        for (fee, paid, due) in cases {
            assert_eq!(derive_status(fee, paid, due), derive_status(fee, paid, due));
        }
    }

    #[test]
    fn balance_is_fee_minus_paid() {
        assert_eq!(balance(dec("1000"), dec("400")), dec("600"));
        assert_eq!(balance(dec("1000"), dec("1000")), dec("0"));
        assert_eq!(balance(dec("1000.50"), dec("400.25")), dec("600.25"));
    }

    #[test]
    fn receipt_numbers_are_zero_padded_per_year() {
        assert_eq!(format_receipt_no("2025-26", 1), "2025-26-000001");
        assert_eq!(format_receipt_no("2025-26", 123), "2025-26-000123");
        // Past six digits the number keeps growing rather than wrapping.
        assert_eq!(format_receipt_no("2025-26", 1234567), "2025-26-1234567");
    }

    #[test]
    fn parse_amount_accepts_two_decimal_places_at_most() {
        assert_eq!(parse_amount("1500"), Ok(dec("1500")));
        assert_eq!(parse_amount("1500.5"), Ok(dec("1500.5")));
        assert_eq!(parse_amount(" 1500.50 "), Ok(dec("1500.50")));
        // Trailing zeros beyond two places normalize away.
        assert_eq!(parse_amount("1500.500"), Ok(dec("1500.500")));
        assert_eq!(parse_amount("1500.505"), Err(ParseAmountError::TooPrecise));
        assert_eq!(parse_amount("abc"), Err(ParseAmountError::Invalid));
        assert_eq!(parse_amount(""), Err(ParseAmountError::Invalid));
        // Sign handling is the caller's concern; parsing keeps it.
        assert_eq!(parse_amount("-50"), Ok(dec("-50")));
    }

    #[test]
    fn payment_mode_round_trips_canonical_names() {
        for mode in [
            PaymentMode::Cash,
            PaymentMode::Upi,
            PaymentMode::BankTransfer,
            PaymentMode::Cheque,
            PaymentMode::Online,
        ] {
            assert_eq!(PaymentMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(PaymentMode::parse("card"), None);
        assert_eq!(PaymentMode::parse("CASH"), None);
    }
}
