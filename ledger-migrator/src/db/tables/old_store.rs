//! Read-only access to the old node schema

use ledger_migrator_types::{CommunicatorMessage, HistoryRecord, OldTrustLine, PendingWork};

use super::super::NodeStore;
use crate::codec::decode_identity_slice;
use crate::config::EquivalentMap;
use crate::error::Result;

fn row_to_old_trust_line(row: &rusqlite::Row, equivalents: &EquivalentMap) -> rusqlite::Result<OldTrustLine> {
    let contractor: Vec<u8> = row.get(0)?;
    let contractor_id = decode_identity_slice(&contractor).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Blob, Box::new(e))
    })?;
    Ok(OldTrustLine {
        contractor,
        contractor_id,
        incoming_amount: row.get(1)?,
        outgoing_amount: row.get(2)?,
        balance: row.get(3)?,
        is_contractor_gateway: row.get::<_, i64>(4)? != 0,
        equivalent: equivalents.map(row.get(5)?),
    })
}

fn row_to_history_record(row: &rusqlite::Row, equivalents: &EquivalentMap) -> rusqlite::Result<HistoryRecord> {
    Ok(HistoryRecord {
        operation_uuid: row.get(0)?,
        operation_timestamp: row.get(1)?,
        record_type: row.get(2)?,
        record_body: row.get(3)?,
        record_body_bytes_count: row.get(4)?,
        equivalent: equivalents.map(row.get(5)?),
        command_uuid: row.get(6)?,
    })
}

fn identity_column(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<String> {
    let raw: Vec<u8> = row.get(idx)?;
    decode_identity_slice(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Blob, Box::new(e))
    })
}

impl NodeStore {
    /// All old trust lines, with equivalents remapped to their new ids.
    pub fn read_old_trust_lines(&mut self, equivalents: &EquivalentMap) -> Result<Vec<OldTrustLine>> {
        self.with_old(|conn| {
            let mut stmt = conn.prepare(
                "SELECT contractor, incoming_amount, outgoing_amount, balance, is_contractor_gateway, equivalent
                 FROM trust_lines",
            )?;
            let lines = stmt
                .query_map([], |row| row_to_old_trust_line(row, equivalents))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(lines)
        })
    }

    /// All old history records in storage order.
    pub fn read_old_history(&mut self, equivalents: &EquivalentMap) -> Result<Vec<HistoryRecord>> {
        self.with_old(|conn| {
            let mut stmt = conn.prepare(
                "SELECT operation_uuid, operation_timestamp, record_type, record_body,
                        record_body_bytes_count, equivalent, command_uuid
                 FROM history ORDER BY rowid",
            )?;
            let records = stmt
                .query_map([], |row| row_to_history_record(row, equivalents))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
    }

    /// Transactions and queued messages the old node still holds.
    pub fn read_pending_work(&mut self) -> Result<PendingWork> {
        let transactions = self.with_old(|conn| {
            let mut stmt = conn.prepare("SELECT transaction_uuid FROM transactions")?;
            let uuids = stmt
                .query_map([], |row| identity_column(row, 0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(uuids)
        })?;

        let messages = self
            .with_communicator(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT contractor_uuid, transaction_uuid, message_type, recording_time, equivalent
                     FROM communicator_messages_queue",
                )?;
                let messages = stmt
                    .query_map([], |row| {
                        Ok(CommunicatorMessage {
                            contractor_uuid: identity_column(row, 0)?,
                            transaction_uuid: identity_column(row, 1)?,
                            message_type: row.get(2)?,
                            recording_time: row.get(3)?,
                            equivalent: row.get(4)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(messages)
            })?
            .unwrap_or_default();

        Ok(PendingWork {
            transactions,
            messages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_amount, AmountSign};
    use crate::test_support::OldNodeFixture;
    use tempfile::tempdir;

    #[test]
    fn test_read_trust_lines_remaps_equivalents() {
        let dir = tempdir().unwrap();
        let peer = "00000000-0000-0000-0000-000000000002";
        OldNodeFixture::new(dir.path(), "00000000-0000-0000-0000-000000000001")
            .trust_line(peer, 7, 100, 0, AmountSign::NonNegative, 0)
            .write();

        let equivalents = EquivalentMap::from_pairs([(7, 1001)]);
        let mut store = NodeStore::new(
            "00000000-0000-0000-0000-000000000001",
            &dir.path().join("00000000-0000-0000-0000-000000000001"),
            None,
            false,
        );
        let lines = store.read_old_trust_lines(&equivalents).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].contractor_id, peer);
        assert_eq!(lines[0].equivalent, 1001);
        assert_eq!(lines[0].balance, encode_amount(AmountSign::NonNegative, 0));
        assert!(!store.is_connected());
    }

    #[test]
    fn test_pending_work_without_communicator_store() {
        let dir = tempdir().unwrap();
        let node = "00000000-0000-0000-0000-000000000001";
        OldNodeFixture::new(dir.path(), node)
            .pending_transaction("00000000-0000-0000-0000-0000000000aa")
            .without_communicator()
            .write();

        let mut store = NodeStore::new(node, &dir.path().join(node), None, false);
        let pending = store.read_pending_work().unwrap();
        assert_eq!(pending.transactions, vec!["00000000-0000-0000-0000-0000000000aa".to_string()]);
        assert!(pending.messages.is_empty());
        assert!(!pending.is_empty());
    }

    #[test]
    fn test_pending_work_counts_queued_messages() {
        let dir = tempdir().unwrap();
        let node = "00000000-0000-0000-0000-000000000001";
        OldNodeFixture::new(dir.path(), node)
            .queued_message("00000000-0000-0000-0000-000000000002", "00000000-0000-0000-0000-0000000000bb")
            .write();

        let mut store = NodeStore::new(node, &dir.path().join(node), None, false);
        let pending = store.read_pending_work().unwrap();
        assert!(pending.transactions.is_empty());
        assert_eq!(pending.messages.len(), 1);
        assert_eq!(pending.messages[0].contractor_uuid, "00000000-0000-0000-0000-000000000002");
    }
}
