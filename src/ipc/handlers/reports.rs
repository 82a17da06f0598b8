use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_str, get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde_json::json;
use std::str::FromStr;

struct SummaryRow {
    student_id: String,
    account_id: String,
    display_name: String,
    total_fee: Decimal,
    total_paid: Decimal,
    balance: Decimal,
    status: String,
}

fn parse_stored_decimal(raw: &str, column: &str) -> Result<Decimal, HandlerErr> {
    Decimal::from_str(raw).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: format!("corrupt decimal in {}: {}", column, e),
        details: None,
    })
}

/// Decimal columns are TEXT, so the aggregation happens here rather than in
/// SQL. Account counts are small (one row per student per year).
fn load_summary_rows(
    conn: &Connection,
    academic_year: &str,
    class_id: Option<&str>,
) -> Result<Vec<SummaryRow>, HandlerErr> {
    let mut sql = String::from(
        "SELECT a.id, a.student_id, s.last_name, s.first_name,
                a.total_fee, a.total_paid, a.balance, a.status
         FROM fee_accounts a
         JOIN students s ON s.id = a.student_id
         WHERE a.academic_year = ?",
    );
    let mut binds: Vec<String> = vec![academic_year.to_string()];
    if let Some(cid) = class_id {
        sql.push_str(" AND s.class_id = ?");
        binds.push(cid.to_string());
    }

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let raw_rows = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
                r.get::<_, String>(6)?,
                r.get::<_, String>(7)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let mut rows = Vec::with_capacity(raw_rows.len());
    for (account_id, student_id, last, first, fee, paid, balance, status) in raw_rows {
        rows.push(SummaryRow {
            account_id,
            student_id,
            display_name: format!("{}, {}", last, first),
            total_fee: parse_stored_decimal(&fee, "fee_accounts.total_fee")?,
            total_paid: parse_stored_decimal(&paid, "fee_accounts.total_paid")?,
            balance: parse_stored_decimal(&balance, "fee_accounts.balance")?,
            status,
        });
    }
    Ok(rows)
}

fn handle_fee_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let academic_year = match get_required_str(&req.params, "academicYear") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let class_id = match get_optional_str(&req.params, "classId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let rows = match load_summary_rows(conn, &academic_year, class_id.as_deref()) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let mut total_fee = Decimal::ZERO;
    let mut total_collected = Decimal::ZERO;
    let mut total_outstanding = Decimal::ZERO;
    let mut pending: i64 = 0;
    let mut partial: i64 = 0;
    let mut paid: i64 = 0;
    let mut overdue: i64 = 0;
    for row in &rows {
        total_fee += row.total_fee;
        total_collected += row.total_paid;
        total_outstanding += row.balance;
        match row.status.as_str() {
            "pending" => pending += 1,
            "partial" => partial += 1,
            "paid" => paid += 1,
            "overdue" => overdue += 1,
            _ => {}
        }
    }

    ok(
        &req.id,
        json!({
            "academicYear": academic_year,
            "accountCount": rows.len(),
            "totalFee": total_fee.to_string(),
            "totalCollected": total_collected.to_string(),
            "totalOutstanding": total_outstanding.to_string(),
            "statusCounts": {
                "pending": pending,
                "partial": partial,
                "paid": paid,
                "overdue": overdue,
            }
        }),
    )
}

fn handle_defaulters(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let academic_year = match get_required_str(&req.params, "academicYear") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let class_id = match get_optional_str(&req.params, "classId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let mut rows = match load_summary_rows(conn, &academic_year, class_id.as_deref()) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    rows.retain(|r| r.balance > Decimal::ZERO);
    rows.sort_by(|a, b| b.balance.cmp(&a.balance));

    let defaulters: Vec<serde_json::Value> = rows
        .iter()
        .map(|r| {
            json!({
                "studentId": r.student_id.as_str(),
                "accountId": r.account_id.as_str(),
                "displayName": r.display_name.as_str(),
                "totalFee": r.total_fee.to_string(),
                "totalPaid": r.total_paid.to_string(),
                "balance": r.balance.to_string(),
                "status": r.status.as_str(),
            })
        })
        .collect();

    ok(&req.id, json!({ "defaulters": defaulters }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.feeSummary" => Some(handle_fee_summary(state, req)),
        "reports.defaulters" => Some(handle_defaulters(state, req)),
        _ => None,
    }
}
