use ledger_migrator_types::AuditRecord;
use rusqlite::params;

use super::super::NodeStore;
use crate::error::Result;

const AUDIT_COLUMNS: &str = "number, trust_line_id, our_key_hash, our_signature, contractor_key_hash, \
     contractor_signature, own_keys_set_hash, contractor_keys_set_hash, balance, outgoing_amount, incoming_amount";

fn row_to_audit(row: &rusqlite::Row) -> rusqlite::Result<AuditRecord> {
    Ok(AuditRecord {
        number: row.get(0)?,
        trust_line_id: row.get(1)?,
        our_key_hash: row.get(2)?,
        our_signature: row.get(3)?,
        contractor_key_hash: row.get(4)?,
        contractor_signature: row.get(5)?,
        own_keys_set_hash: row.get(6)?,
        contractor_keys_set_hash: row.get(7)?,
        balance: row.get(8)?,
        outgoing_amount: row.get(9)?,
        incoming_amount: row.get(10)?,
    })
}

impl NodeStore {
    pub fn list_audits(&mut self) -> Result<Vec<AuditRecord>> {
        self.with_new(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM audit ORDER BY trust_line_id, number",
                AUDIT_COLUMNS
            ))?;
            let rows = stmt
                .query_map([], row_to_audit)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Copies the peer's key hash and signature into the audit of a local trust line.
    pub fn update_audit_crypto(
        &mut self,
        trust_line_id: i64,
        contractor_key_hash: &[u8],
        contractor_signature: &[u8],
    ) -> Result<usize> {
        self.with_new(|conn| {
            let updated = conn.execute(
                "UPDATE audit SET contractor_key_hash = ?1, contractor_signature = ?2 WHERE trust_line_id = ?3",
                params![contractor_key_hash, contractor_signature, trust_line_id],
            )?;
            Ok(updated)
        })
    }

    #[cfg(test)]
    pub fn sign_audit(&mut self, trust_line_id: i64, our_key_hash: &[u8], our_signature: &[u8]) -> Result<()> {
        self.with_new(|conn| {
            conn.execute(
                "UPDATE audit SET our_key_hash = ?1, our_signature = ?2 WHERE trust_line_id = ?3",
                params![our_key_hash, our_signature, trust_line_id],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::NodeAddress;
    use ledger_migrator_types::{ContractorRow, OldTrustLine};
    use tempfile::tempdir;

    #[test]
    fn test_update_audit_crypto_touches_only_target_line() {
        let dir = tempdir().unwrap();
        let mut store = NodeStore::new("n1", &dir.path().join("old"), Some(&dir.path().join("new")), false);
        store.create_new_schema().unwrap();
        store
            .insert_channel(
                &ContractorRow {
                    id: 0,
                    id_on_contractor_side: 0,
                    crypto_key: vec![0u8; 96],
                    is_confirmed: true,
                },
                &NodeAddress::parse("127.0.0.1:2033").unwrap(),
            )
            .unwrap();
        let old = |equivalent| OldTrustLine {
            contractor: vec![0u8; 16],
            contractor_id: String::new(),
            incoming_amount: vec![0u8; 32],
            outgoing_amount: vec![0u8; 32],
            balance: vec![0u8; 33],
            is_contractor_gateway: false,
            equivalent,
        };
        let (a, b) = (old(1), old(2));
        let lines = store.insert_trust_lines(0, &[&a, &b]).unwrap();

        assert_eq!(store.update_audit_crypto(lines[1].id, &[7u8; 32], &[8u8; 64]).unwrap(), 1);
        let audits = store.list_audits().unwrap();
        let first = audits.iter().find(|r| r.trust_line_id == lines[0].id).unwrap();
        let second = audits.iter().find(|r| r.trust_line_id == lines[1].id).unwrap();
        assert_eq!(first.contractor_key_hash.as_deref(), Some(&[0u8][..]));
        assert_eq!(second.contractor_key_hash.as_deref(), Some(&[7u8; 32][..]));
        assert_eq!(second.contractor_signature.as_deref(), Some(&[8u8; 64][..]));

        assert_eq!(store.update_audit_crypto(999, &[1], &[1]).unwrap(), 0);
    }
}
