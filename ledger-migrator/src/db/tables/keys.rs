//! Own keys (written by the node executable) and contractor keys (cross-registered)

use ledger_migrator_types::OwnKey;
use rusqlite::params;

use super::super::NodeStore;
use crate::error::Result;

fn row_to_own_key(row: &rusqlite::Row) -> rusqlite::Result<OwnKey> {
    Ok(OwnKey {
        hash: row.get(0)?,
        trust_line_id: row.get(1)?,
        keys_set_sequence_number: row.get(2)?,
        public_key: row.get(3)?,
        private_key: row.get(4)?,
        number: row.get(5)?,
        is_valid: row.get::<_, i64>(6)? != 0,
    })
}

fn row_to_contractor_key(row: &rusqlite::Row) -> rusqlite::Result<OwnKey> {
    Ok(OwnKey {
        hash: row.get(0)?,
        trust_line_id: row.get(1)?,
        keys_set_sequence_number: row.get(2)?,
        public_key: row.get(3)?,
        private_key: None,
        number: row.get(4)?,
        is_valid: row.get::<_, i64>(5)? != 0,
    })
}

impl NodeStore {
    pub fn list_own_keys(&mut self, trust_line_id: i64) -> Result<Vec<OwnKey>> {
        self.with_new(|conn| {
            let mut stmt = conn.prepare(
                "SELECT hash, trust_line_id, keys_set_sequence_number, public_key, private_key, number, is_valid
                 FROM own_keys WHERE trust_line_id = ?1 ORDER BY number",
            )?;
            let keys = stmt
                .query_map([trust_line_id], row_to_own_key)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(keys)
        })
    }

    /// Registers `peer`'s public key on the local trust line that `own` belongs to.
    pub fn insert_contractor_key(&mut self, own: &OwnKey, peer: &OwnKey) -> Result<()> {
        self.with_new(|conn| {
            conn.execute(
                "INSERT INTO contractor_keys (hash, trust_line_id, keys_set_sequence_number, public_key, number, is_valid)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    peer.hash,
                    own.trust_line_id,
                    own.keys_set_sequence_number,
                    peer.public_key,
                    own.number,
                    own.is_valid as i64
                ],
            )?;
            Ok(())
        })
    }

    pub fn list_contractor_keys(&mut self, trust_line_id: i64) -> Result<Vec<OwnKey>> {
        self.with_new(|conn| {
            let mut stmt = conn.prepare(
                "SELECT hash, trust_line_id, keys_set_sequence_number, public_key, number, is_valid
                 FROM contractor_keys WHERE trust_line_id = ?1 ORDER BY number",
            )?;
            let keys = stmt
                .query_map([trust_line_id], row_to_contractor_key)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(keys)
        })
    }

    #[cfg(test)]
    pub fn insert_own_key(&mut self, key: &OwnKey) -> Result<()> {
        self.with_new(|conn| {
            conn.execute(
                "INSERT INTO own_keys (hash, trust_line_id, keys_set_sequence_number, public_key, private_key, number, is_valid)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    key.hash,
                    key.trust_line_id,
                    key.keys_set_sequence_number,
                    key.public_key,
                    key.private_key.clone().unwrap_or_default(),
                    key.number,
                    key.is_valid as i64
                ],
            )?;
            Ok(())
        })
    }
}
