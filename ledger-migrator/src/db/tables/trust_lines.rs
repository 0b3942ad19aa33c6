//! Trust lines and their seed audit rows

use ledger_migrator_types::{NewTrustLine, OldTrustLine};
use rusqlite::params;

use super::super::NodeStore;
use crate::error::Result;

/// State of a trust line that is established on both sides.
pub const TRUST_LINE_STATE_ACTIVE: i64 = 2;

const KEYS_SET_HASH_SIZE: usize = 32;

fn row_to_new_trust_line(row: &rusqlite::Row) -> rusqlite::Result<NewTrustLine> {
    Ok(NewTrustLine {
        id: row.get(0)?,
        state: row.get(1)?,
        contractor_id: row.get(2)?,
        equivalent: row.get(3)?,
        is_contractor_gateway: row.get::<_, i64>(4)? != 0,
    })
}

impl NodeStore {
    /// Inserts one active trust line per old line toward the channel `contractor_id`
    /// and seeds its audit record (number 1, placeholder crypto, carried-over amounts).
    pub fn insert_trust_lines(&mut self, contractor_id: u32, lines: &[&OldTrustLine]) -> Result<Vec<NewTrustLine>> {
        self.with_new(|conn| {
            let zero_hash = vec![0u8; KEYS_SET_HASH_SIZE];
            let placeholder = vec![0u8; 1];
            let mut inserted = Vec::with_capacity(lines.len());
            for line in lines {
                conn.execute(
                    "INSERT INTO trust_lines (state, contractor_id, equivalent, is_contractor_gateway)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        TRUST_LINE_STATE_ACTIVE,
                        contractor_id,
                        line.equivalent,
                        line.is_contractor_gateway as i64
                    ],
                )?;
                let id = conn.last_insert_rowid();
                conn.execute(
                    "INSERT INTO audit (number, trust_line_id, our_key_hash, our_signature,
                                        contractor_key_hash, contractor_signature,
                                        own_keys_set_hash, contractor_keys_set_hash,
                                        balance, outgoing_amount, incoming_amount)
                     VALUES (1, ?1, ?2, ?2, ?2, ?2, ?3, ?3, ?4, ?5, ?6)",
                    params![
                        id,
                        placeholder,
                        zero_hash,
                        line.balance,
                        line.outgoing_amount,
                        line.incoming_amount
                    ],
                )?;
                inserted.push(NewTrustLine {
                    id,
                    state: TRUST_LINE_STATE_ACTIVE,
                    contractor_id,
                    equivalent: line.equivalent,
                    is_contractor_gateway: line.is_contractor_gateway,
                });
            }
            Ok(inserted)
        })
    }

    pub fn list_trust_lines(&mut self) -> Result<Vec<NewTrustLine>> {
        self.with_new(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, state, contractor_id, equivalent, is_contractor_gateway FROM trust_lines ORDER BY id",
            )?;
            let rows = stmt
                .query_map([], row_to_new_trust_line)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}
