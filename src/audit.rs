use rusqlite::Connection;
use uuid::Uuid;

/// Append one audit entry. Callers pass the transaction handle so the entry
/// commits or rolls back together with the mutation it describes.
pub fn record(
    conn: &Connection,
    action: &str,
    entity: &str,
    entity_id: &str,
    details: &serde_json::Value,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO audit_log(id, at, action, entity, entity_id, details)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            chrono::Utc::now().to_rfc3339(),
            action,
            entity,
            entity_id,
            details.to_string(),
        ),
    )?;
    Ok(())
}
