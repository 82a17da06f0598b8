use crate::audit;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_amount, get_required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use rust_decimal::Decimal;
use serde_json::json;

fn handle_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
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
    let amount = match get_amount(&req.params, "amount") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if amount < Decimal::ZERO {
        return err(
            &req.id,
            "bad_params",
            "amount must not be negative",
            Some(json!({ "amount": amount.to_string() })),
        );
    }

    let class_found: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if class_found.is_none() {
        return err(&req.id, "not_found", "class not found", None);
    }

    if let Err(e) = conn.execute(
        "INSERT INTO fee_structures(class_id, academic_year, amount) VALUES(?, ?, ?)
         ON CONFLICT(class_id, academic_year) DO UPDATE SET amount = excluded.amount",
        (&class_id, &academic_year, amount.to_string()),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "fee_structures" })),
        );
    }

    if let Err(e) = audit::record(
        conn,
        "feeStructures.set",
        "class",
        &class_id,
        &json!({ "academicYear": academic_year.as_str(), "amount": amount.to_string() }),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "classId": class_id, "academicYear": academic_year, "amount": amount.to_string() }),
    )
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
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

    let amount: Result<Option<String>, _> = conn
        .query_row(
            "SELECT amount FROM fee_structures WHERE class_id = ? AND academic_year = ?",
            (&class_id, &academic_year),
            |r| r.get(0),
        )
        .optional();

    match amount {
        Ok(Some(v)) => ok(&req.id, json!({ "amount": v })),
        Ok(None) => ok(&req.id, json!({ "amount": null })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "feeStructures.set" => Some(handle_set(state, req)),
        "feeStructures.get" => Some(handle_get(state, req)),
        _ => None,
    }
}
