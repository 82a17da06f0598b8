use crate::audit;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_amount, get_optional_bool, get_optional_str, get_optional_str_array, get_required_str,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::ledger::{self, FeeStatus, PaymentMode};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use rust_decimal::Decimal;
use serde_json::json;
use std::str::FromStr;
use uuid::Uuid;

struct AccountRow {
    id: String,
    total_fee: Decimal,
    total_paid: Decimal,
}

fn parse_stored_decimal(raw: &str, column: &str) -> Result<Decimal, HandlerErr> {
    Decimal::from_str(raw).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: format!("corrupt decimal in {}: {}", column, e),
        details: None,
    })
}

fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn load_account(
    conn: &Connection,
    student_id: &str,
    academic_year: &str,
) -> Result<Option<AccountRow>, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT id, total_fee, total_paid FROM fee_accounts
             WHERE student_id = ? AND academic_year = ?",
            (student_id, academic_year),
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ))
            },
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    match row {
        Some((id, fee, paid)) => Ok(Some(AccountRow {
            id,
            total_fee: parse_stored_decimal(&fee, "fee_accounts.total_fee")?,
            total_paid: parse_stored_decimal(&paid, "fee_accounts.total_paid")?,
        })),
        None => Ok(None),
    }
}

/// The fee owed by a student who has no synced account yet comes from the
/// class's fee structure for that year; zero when none is assigned.
fn structure_fee_for_student(
    conn: &Connection,
    student_id: &str,
    academic_year: &str,
) -> Result<Decimal, HandlerErr> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT fs.amount
             FROM fee_structures fs
             JOIN students s ON s.class_id = fs.class_id
             WHERE s.id = ? AND fs.academic_year = ?",
            (student_id, academic_year),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    match raw {
        Some(text) => parse_stored_decimal(&text, "fee_structures.amount"),
        None => Ok(Decimal::ZERO),
    }
}

fn get_or_create_account(
    tx: &Transaction,
    student_id: &str,
    academic_year: &str,
    due_date_passed: bool,
) -> Result<AccountRow, HandlerErr> {
    if !student_exists(tx, student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }
    if let Some(account) = load_account(tx, student_id, academic_year)? {
        return Ok(account);
    }

    let total_fee = structure_fee_for_student(tx, student_id, academic_year)?;
    let id = Uuid::new_v4().to_string();
    let status = ledger::derive_status(total_fee, Decimal::ZERO, due_date_passed);
    tx.execute(
        "INSERT INTO fee_accounts(id, student_id, academic_year, total_fee, total_paid, balance, status, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            student_id,
            academic_year,
            total_fee.to_string(),
            Decimal::ZERO.to_string(),
            total_fee.to_string(),
            status.as_str(),
            chrono::Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;

    Ok(AccountRow {
        id,
        total_fee,
        total_paid: Decimal::ZERO,
    })
}

/// Receipt sequences are per academic year and only ever grow, so a deleted
/// payment's number is never handed out again.
fn next_receipt_seq(tx: &Transaction, academic_year: &str) -> Result<i64, HandlerErr> {
    tx.execute(
        "INSERT INTO receipt_sequences(academic_year, last_seq) VALUES(?, 1)
         ON CONFLICT(academic_year) DO UPDATE SET last_seq = last_seq + 1",
        [academic_year],
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    tx.query_row(
        "SELECT last_seq FROM receipt_sequences WHERE academic_year = ?",
        [academic_year],
        |r| r.get(0),
    )
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

/// Write the new running total and its derived balance/status in one update.
fn apply_account_totals(
    tx: &Transaction,
    account_id: &str,
    total_fee: Decimal,
    new_total_paid: Decimal,
    due_date_passed: bool,
) -> Result<(Decimal, FeeStatus), HandlerErr> {
    let balance = ledger::balance(total_fee, new_total_paid);
    let status = ledger::derive_status(total_fee, new_total_paid, due_date_passed);
    tx.execute(
        "UPDATE fee_accounts SET total_paid = ?, balance = ?, status = ?, updated_at = ?
         WHERE id = ?",
        (
            new_total_paid.to_string(),
            balance.to_string(),
            status.as_str(),
            chrono::Utc::now().to_rfc3339(),
            account_id,
        ),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    Ok((balance, status))
}

struct RecordPaymentParams {
    student_id: String,
    academic_year: String,
    amount: Decimal,
    payment_mode: PaymentMode,
    payment_for: Option<String>,
    paid_months: Option<Vec<String>>,
    remarks: Option<String>,
    transaction_date: String,
    due_date_passed: bool,
}

fn parse_record_payment_params(
    params: &serde_json::Value,
) -> Result<RecordPaymentParams, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let academic_year = get_required_str(params, "academicYear")?;

    let amount = get_amount(params, "amount")?;
    if amount <= Decimal::ZERO {
        return Err(HandlerErr {
            code: "bad_params",
            message: "amount must be positive".to_string(),
            details: Some(json!({ "amount": amount.to_string() })),
        });
    }

    let mode_raw = get_required_str(params, "paymentMode")?;
    let Some(payment_mode) = PaymentMode::parse(&mode_raw) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "paymentMode must be one of: cash, upi, bank_transfer, cheque, online"
                .to_string(),
            details: Some(json!({ "paymentMode": mode_raw })),
        });
    };

    let transaction_date = match get_optional_str(params, "transactionDate")? {
        Some(v) => v,
        None => chrono::Utc::now().to_rfc3339(),
    };

    Ok(RecordPaymentParams {
        student_id,
        academic_year,
        amount,
        payment_mode,
        payment_for: get_optional_str(params, "paymentFor")?,
        paid_months: get_optional_str_array(params, "paidMonths")?,
        remarks: get_optional_str(params, "remarks")?,
        transaction_date,
        due_date_passed: get_optional_bool(params, "dueDatePassed", false)?,
    })
}

struct RecordPaymentOutcome {
    transaction_id: String,
    receipt_no: String,
    account_id: String,
    new_balance: Decimal,
    new_status: FeeStatus,
}

fn record_payment_tx(
    tx: &Transaction,
    p: &RecordPaymentParams,
) -> Result<RecordPaymentOutcome, HandlerErr> {
    let account = get_or_create_account(tx, &p.student_id, &p.academic_year, p.due_date_passed)?;

    let seq = next_receipt_seq(tx, &p.academic_year)?;
    let receipt_no = ledger::format_receipt_no(&p.academic_year, seq);

    let transaction_id = Uuid::new_v4().to_string();
    let paid_months_json = p
        .paid_months
        .as_ref()
        .map(|m| serde_json::to_string(m).unwrap_or_else(|_| "[]".to_string()));
    tx.execute(
        "INSERT INTO fee_transactions(id, receipt_no, account_id, student_id, academic_year,
                                      amount_paid, payment_mode, payment_for, paid_months,
                                      remarks, transaction_date)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &transaction_id,
            &receipt_no,
            &account.id,
            &p.student_id,
            &p.academic_year,
            p.amount.to_string(),
            p.payment_mode.as_str(),
            &p.payment_for,
            &paid_months_json,
            &p.remarks,
            &p.transaction_date,
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;

    let new_total_paid = account.total_paid + p.amount;
    let (new_balance, new_status) = apply_account_totals(
        tx,
        &account.id,
        account.total_fee,
        new_total_paid,
        p.due_date_passed,
    )?;

    audit::record(
        tx,
        "fees.recordPayment",
        "fee_transaction",
        &transaction_id,
        &json!({
            "receiptNo": receipt_no.as_str(),
            "studentId": p.student_id.as_str(),
            "academicYear": p.academic_year.as_str(),
            "amount": p.amount.to_string(),
            "paymentMode": p.payment_mode.as_str(),
        }),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;

    Ok(RecordPaymentOutcome {
        transaction_id,
        receipt_no,
        account_id: account.id,
        new_balance,
        new_status,
    })
}

fn handle_record_payment(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let p = match parse_record_payment_params(&req.params) {
        Ok(p) => p,
        Err(e) => return e.response(&req.id),
    };

    // The transaction row, the receipt allocation, the account delta and the
    // audit entry commit as one unit. An IMMEDIATE transaction takes the
    // write lock up front so concurrent collectors serialize here instead of
    // losing an update on the read-modify-write of total_paid.
    let tx = match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let outcome = match record_payment_tx(&tx, &p) {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return e.response(&req.id);
        }
    };

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    tracing::info!(
        receipt = %outcome.receipt_no,
        student = %p.student_id,
        amount = %p.amount,
        "payment recorded"
    );

    ok(
        &req.id,
        json!({
            "transactionId": outcome.transaction_id,
            "receiptNumber": outcome.receipt_no,
            "accountId": outcome.account_id,
            "newBalance": outcome.new_balance.to_string(),
            "newStatus": outcome.new_status.as_str(),
        }),
    )
}

struct DeletePaymentOutcome {
    receipt_no: String,
    new_balance: Decimal,
    new_status: FeeStatus,
}

fn delete_payment_tx(
    tx: &Transaction,
    transaction_id: &str,
    due_date_passed: bool,
) -> Result<DeletePaymentOutcome, HandlerErr> {
    let row = tx
        .query_row(
            "SELECT t.receipt_no, t.amount_paid, t.student_id, a.id, a.total_fee, a.total_paid
             FROM fee_transactions t
             JOIN fee_accounts a ON a.id = t.account_id
             WHERE t.id = ?",
            [transaction_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, String>(5)?,
                ))
            },
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let Some((receipt_no, amount_raw, student_id, account_id, fee_raw, paid_raw)) = row else {
        return Err(HandlerErr::not_found("transaction not found"));
    };

    let amount = parse_stored_decimal(&amount_raw, "fee_transactions.amount_paid")?;
    let total_fee = parse_stored_decimal(&fee_raw, "fee_accounts.total_fee")?;
    let total_paid = parse_stored_decimal(&paid_raw, "fee_accounts.total_paid")?;

    let new_total_paid = total_paid - amount;
    if new_total_paid < Decimal::ZERO {
        // The running total no longer covers this receipt. That means the
        // books are already inconsistent; refuse rather than clamp.
        return Err(HandlerErr::invalid_state(
            "reversal would drive totalPaid negative",
            Some(json!({
                "receiptNo": receipt_no,
                "amountPaid": amount.to_string(),
                "totalPaid": total_paid.to_string(),
            })),
        ));
    }

    let deleted = tx
        .execute("DELETE FROM fee_transactions WHERE id = ?", [transaction_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    if deleted == 0 {
        return Err(HandlerErr::not_found("transaction not found"));
    }

    let (new_balance, new_status) =
        apply_account_totals(tx, &account_id, total_fee, new_total_paid, due_date_passed)?;

    audit::record(
        tx,
        "fees.deletePayment",
        "fee_transaction",
        transaction_id,
        &json!({
            "receiptNo": receipt_no.as_str(),
            "studentId": student_id.as_str(),
            "amount": amount.to_string(),
        }),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;

    Ok(DeletePaymentOutcome {
        receipt_no,
        new_balance,
        new_status,
    })
}

fn handle_delete_payment(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let transaction_id = match get_required_str(&req.params, "transactionId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let due_date_passed = match get_optional_bool(&req.params, "dueDatePassed", false) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let tx = match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let outcome = match delete_payment_tx(&tx, &transaction_id, due_date_passed) {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return e.response(&req.id);
        }
    };

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    tracing::info!(receipt = %outcome.receipt_no, "payment reversed");

    ok(
        &req.id,
        json!({
            "receiptNumber": outcome.receipt_no,
            "newBalance": outcome.new_balance.to_string(),
            "newStatus": outcome.new_status.as_str(),
        }),
    )
}

fn handle_get_account(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match get_required_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let academic_year = match get_required_str(&req.params, "academicYear") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let row = conn
        .query_row(
            "SELECT id, total_fee, total_paid, balance, status, updated_at
             FROM fee_accounts
             WHERE student_id = ? AND academic_year = ?",
            (&student_id, &academic_year),
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "studentId": student_id.as_str(),
                    "academicYear": academic_year.as_str(),
                    "totalFee": r.get::<_, String>(1)?,
                    "totalPaid": r.get::<_, String>(2)?,
                    "balance": r.get::<_, String>(3)?,
                    "status": r.get::<_, String>(4)?,
                    "updatedAt": r.get::<_, Option<String>>(5)?,
                }))
            },
        )
        .optional();

    match row {
        Ok(Some(account)) => ok(&req.id, json!({ "account": account })),
        Ok(None) => ok(&req.id, json!({ "account": null })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_list_transactions(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let academic_year = match get_required_str(&req.params, "academicYear") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let student_id = match get_optional_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let account_id = match get_optional_str(&req.params, "accountId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let mut sql = String::from(
        "SELECT id, receipt_no, account_id, student_id, amount_paid, payment_mode,
                payment_for, paid_months, remarks, transaction_date
         FROM fee_transactions
         WHERE academic_year = ?",
    );
    let mut binds: Vec<String> = vec![academic_year];
    if let Some(sid) = student_id {
        sql.push_str(" AND student_id = ?");
        binds.push(sid);
    }
    if let Some(aid) = account_id {
        sql.push_str(" AND account_id = ?");
        binds.push(aid);
    }
    sql.push_str(" ORDER BY receipt_no");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), |r| {
            let paid_months: Option<String> = r.get(7)?;
            let paid_months = paid_months
                .and_then(|text| serde_json::from_str::<serde_json::Value>(&text).ok())
                .unwrap_or(serde_json::Value::Null);
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "receiptNumber": r.get::<_, String>(1)?,
                "accountId": r.get::<_, String>(2)?,
                "studentId": r.get::<_, String>(3)?,
                "amountPaid": r.get::<_, String>(4)?,
                "paymentMode": r.get::<_, String>(5)?,
                "paymentFor": r.get::<_, Option<String>>(6)?,
                "paidMonths": paid_months,
                "remarks": r.get::<_, Option<String>>(8)?,
                "transactionDate": r.get::<_, String>(9)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(transactions) => ok(&req.id, json!({ "transactions": transactions })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn sync_accounts_tx(
    tx: &Transaction,
    class_id: &str,
    academic_year: &str,
    due_date_passed: bool,
) -> Result<(i64, i64), HandlerErr> {
    let fee_raw: Option<String> = tx
        .query_row(
            "SELECT amount FROM fee_structures WHERE class_id = ? AND academic_year = ?",
            (class_id, academic_year),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let Some(fee_raw) = fee_raw else {
        return Err(HandlerErr::not_found(
            "no fee structure for class and academic year",
        ));
    };
    let total_fee = parse_stored_decimal(&fee_raw, "fee_structures.amount")?;

    let student_ids: Vec<String> = {
        let mut stmt = tx
            .prepare("SELECT id FROM students WHERE class_id = ? AND active = 1")
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;
        stmt.query_map([class_id], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| HandlerErr::db("db_query_failed", e))?
    };

    let mut created: i64 = 0;
    let mut updated: i64 = 0;
    for student_id in &student_ids {
        match load_account(tx, student_id, academic_year)? {
            None => {
                let status = ledger::derive_status(total_fee, Decimal::ZERO, due_date_passed);
                tx.execute(
                    "INSERT INTO fee_accounts(id, student_id, academic_year, total_fee, total_paid, balance, status, updated_at)
                     VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
                    (
                        Uuid::new_v4().to_string(),
                        student_id,
                        academic_year,
                        total_fee.to_string(),
                        Decimal::ZERO.to_string(),
                        total_fee.to_string(),
                        status.as_str(),
                        chrono::Utc::now().to_rfc3339(),
                    ),
                )
                .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
                created += 1;
            }
            Some(account) => {
                let balance = ledger::balance(total_fee, account.total_paid);
                let status =
                    ledger::derive_status(total_fee, account.total_paid, due_date_passed);
                tx.execute(
                    "UPDATE fee_accounts SET total_fee = ?, balance = ?, status = ?, updated_at = ?
                     WHERE id = ?",
                    (
                        total_fee.to_string(),
                        balance.to_string(),
                        status.as_str(),
                        chrono::Utc::now().to_rfc3339(),
                        &account.id,
                    ),
                )
                .map_err(|e| HandlerErr::db("db_update_failed", e))?;
                updated += 1;
            }
        }
    }

    audit::record(
        tx,
        "fees.syncAccounts",
        "class",
        class_id,
        &json!({
            "academicYear": academic_year,
            "totalFee": total_fee.to_string(),
            "created": created,
            "updated": updated,
        }),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;

    Ok((created, updated))
}

fn handle_sync_accounts(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match get_required_str(&req.params, "classId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let academic_year = match get_required_str(&req.params, "academicYear") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let due_date_passed = match get_optional_bool(&req.params, "dueDatePassed", false) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let class_found: Result<Option<i64>, _> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional();
    match class_found {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let tx = match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let (created, updated) = match sync_accounts_tx(&tx, &class_id, &academic_year, due_date_passed)
    {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return e.response(&req.id);
        }
    };

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "created": created, "updated": updated }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "fees.recordPayment" => Some(handle_record_payment(state, req)),
        "fees.deletePayment" => Some(handle_delete_payment(state, req)),
        "fees.getAccount" => Some(handle_get_account(state, req)),
        "fees.listTransactions" => Some(handle_list_transactions(state, req)),
        "fees.syncAccounts" => Some(handle_sync_accounts(state, req)),
        _ => None,
    }
}
