//! Rewritten history records

use ledger_migrator_types::HistoryRecord;
use rusqlite::params;

use super::super::NodeStore;
use crate::error::Result;

impl NodeStore {
    /// Writes rewritten records in the given order. The stored byte count is
    /// always the length of the body actually written.
    pub fn insert_history(&mut self, records: &[HistoryRecord]) -> Result<usize> {
        self.with_new(|conn| {
            let mut stmt = conn.prepare(
                "INSERT INTO history (operation_uuid, operation_timestamp, record_type, record_body,
                                      record_body_bytes_count, equivalent, command_uuid)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for record in records {
                stmt.execute(params![
                    record.operation_uuid,
                    record.operation_timestamp,
                    record.record_type,
                    record.record_body,
                    record.record_body.len() as i64,
                    record.equivalent,
                    record.command_uuid
                ])?;
            }
            Ok(records.len())
        })
    }

    pub fn list_history(&mut self) -> Result<Vec<HistoryRecord>> {
        self.with_new(|conn| {
            let mut stmt = conn.prepare(
                "SELECT operation_uuid, operation_timestamp, record_type, record_body,
                        record_body_bytes_count, equivalent, command_uuid
                 FROM history ORDER BY rowid",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(HistoryRecord {
                        operation_uuid: row.get(0)?,
                        operation_timestamp: row.get(1)?,
                        record_type: row.get(2)?,
                        record_body: row.get(3)?,
                        record_body_bytes_count: row.get(4)?,
                        equivalent: row.get(5)?,
                        command_uuid: row.get(6)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}
