use crate::ipc::error::{err, ok};
use crate::ipc::helpers::get_optional_str;
use crate::ipc::types::{AppState, Request};
use serde_json::json;

const AUDIT_LIST_MAX_ROWS: i64 = 500;

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let entity = match get_optional_str(&req.params, "entity") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let entity_id = match get_optional_str(&req.params, "entityId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let limit = req
        .params
        .get("limit")
        .and_then(|v| v.as_i64())
        .unwrap_or(100)
        .clamp(1, AUDIT_LIST_MAX_ROWS);

    let mut sql = String::from(
        "SELECT id, at, action, entity, entity_id, details FROM audit_log WHERE 1=1",
    );
    let mut binds: Vec<String> = Vec::new();
    if let Some(e) = entity {
        sql.push_str(" AND entity = ?");
        binds.push(e);
    }
    if let Some(eid) = entity_id {
        sql.push_str(" AND entity_id = ?");
        binds.push(eid);
    }
    sql.push_str(&format!(" ORDER BY at DESC, rowid DESC LIMIT {}", limit));

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), |r| {
            let details: Option<String> = r.get(5)?;
            let details = details
                .and_then(|text| serde_json::from_str::<serde_json::Value>(&text).ok())
                .unwrap_or(serde_json::Value::Null);
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "at": r.get::<_, String>(1)?,
                "action": r.get::<_, String>(2)?,
                "entity": r.get::<_, String>(3)?,
                "entityId": r.get::<_, String>(4)?,
                "details": details,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(entries) => ok(&req.id, json!({ "entries": entries })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "audit.list" => Some(handle_list(state, req)),
        _ => None,
    }
}
