use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::errors::AppError;
use crate::store::Record;

pub fn record_from_row(row: &SqliteRow) -> Result<Record, AppError> {
    let id: String = row.try_get("id").map_err(|e| AppError::internal(format!("missing id: {}", e)))?;
    let data_s: String = row.try_get("data").map_err(|e| AppError::internal(format!("missing data: {}", e)))?;

    let data: Value = serde_json::from_str(&data_s)
        .map_err(|e| AppError::internal(format!("invalid record body for {}: {}", id, e)))?;
    if !data.is_object() {
        return Err(AppError::internal(format!("record body for {} is not an object", id)));
    }

    Ok(Record { id, data })
}
