//! Channel rows: contractors and their addresses

use ledger_migrator_types::{ContractorAddressRow, ContractorRow};
use rusqlite::params;

use super::super::NodeStore;
use crate::codec::NodeAddress;
use crate::error::Result;

fn row_to_contractor(row: &rusqlite::Row) -> rusqlite::Result<ContractorRow> {
    Ok(ContractorRow {
        id: row.get(0)?,
        id_on_contractor_side: row.get(1)?,
        crypto_key: row.get(2)?,
        is_confirmed: row.get::<_, i64>(3)? != 0,
    })
}

impl NodeStore {
    /// Persists one side of a channel together with the peer's encoded address.
    pub fn insert_channel(&mut self, contractor: &ContractorRow, peer_address: &NodeAddress) -> Result<()> {
        let address = peer_address.encode()?;
        self.with_new(|conn| {
            conn.execute(
                "INSERT INTO contractors (id, id_on_contractor_side, crypto_key, is_confirmed)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    contractor.id,
                    contractor.id_on_contractor_side,
                    contractor.crypto_key,
                    contractor.is_confirmed as i64
                ],
            )?;
            conn.execute(
                "INSERT INTO contractors_addresses (type, contractor_id, address_size, address)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    peer_address.type_code(),
                    contractor.id,
                    address.len() as i64,
                    address
                ],
            )?;
            Ok(())
        })
    }

    /// Removes one side of a channel and its address.
    pub fn delete_channel(&mut self, id: u32) -> Result<()> {
        self.with_new(|conn| {
            conn.execute("DELETE FROM contractors_addresses WHERE contractor_id = ?1", params![id])?;
            conn.execute("DELETE FROM contractors WHERE id = ?1", params![id])?;
            Ok(())
        })
    }

    pub fn list_contractors(&mut self) -> Result<Vec<ContractorRow>> {
        self.with_new(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, id_on_contractor_side, crypto_key, is_confirmed FROM contractors ORDER BY id",
            )?;
            let rows = stmt
                .query_map([], row_to_contractor)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn list_contractor_addresses(&mut self) -> Result<Vec<ContractorAddressRow>> {
        self.with_new(|conn| {
            let mut stmt = conn.prepare(
                "SELECT type, contractor_id, address FROM contractors_addresses ORDER BY contractor_id",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(ContractorAddressRow {
                        address_type: row.get(0)?,
                        contractor_id: row.get(1)?,
                        address: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}
