//! Shared types for the ledger migrator and the tooling that reads its run artifacts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =====================================================
// Old Store Rows
// =====================================================

/// A trust line as persisted by the old node schema.
///
/// `contractor` is the raw 16-byte identity of the peer; `contractor_id` is
/// the same value in canonical dashed form. Amounts are opaque sign-magnitude
/// blobs and are carried over to the new store byte for byte.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OldTrustLine {
    pub contractor: Vec<u8>,
    pub contractor_id: String,
    pub incoming_amount: Vec<u8>,
    pub outgoing_amount: Vec<u8>,
    pub balance: Vec<u8>,
    pub is_contractor_gateway: bool,
    pub equivalent: u32,
}

/// A historical ledger record. The body layout is owned by the node
/// executable; only the leading operation tag and peer identity are known here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub operation_uuid: Vec<u8>,
    pub operation_timestamp: i64,
    pub record_type: i64,
    pub record_body: Vec<u8>,
    pub record_body_bytes_count: i64,
    pub equivalent: u32,
    pub command_uuid: Option<Vec<u8>>,
}

/// Record type tags stored in `history.record_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryRecordType {
    TrustLine,
    Payment,
    PaymentAdditional,
    Other(i64),
}

impl HistoryRecordType {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::TrustLine,
            2 => Self::Payment,
            3 => Self::PaymentAdditional,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> i64 {
        match self {
            Self::TrustLine => 1,
            Self::Payment => 2,
            Self::PaymentAdditional => 3,
            Self::Other(code) => code,
        }
    }
}

/// A queued outgoing message still waiting in the old communicator store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunicatorMessage {
    pub contractor_uuid: String,
    pub transaction_uuid: String,
    pub message_type: i64,
    pub recording_time: i64,
    pub equivalent: i64,
}

/// Work the old node still has in flight. Anything non-zero blocks migration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PendingWork {
    pub transactions: Vec<String>,
    pub messages: Vec<CommunicatorMessage>,
}

impl PendingWork {
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty() && self.messages.is_empty()
    }
}

// =====================================================
// New Store Rows
// =====================================================

/// A row of the new `contractors` table, one per channel side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractorRow {
    pub id: u32,
    pub id_on_contractor_side: u32,
    pub crypto_key: Vec<u8>,
    pub is_confirmed: bool,
}

/// A row of the new `contractors_addresses` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractorAddressRow {
    pub address_type: u8,
    pub contractor_id: u32,
    pub address: Vec<u8>,
}

/// A row of the new `trust_lines` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTrustLine {
    pub id: i64,
    pub state: i64,
    pub contractor_id: u32,
    pub equivalent: u32,
    pub is_contractor_gateway: bool,
}

/// A key generated by the node executable for one of its own trust lines.
/// The same shape is used for contractor keys, which never carry a private part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnKey {
    pub hash: Vec<u8>,
    pub trust_line_id: i64,
    pub keys_set_sequence_number: i64,
    pub public_key: Vec<u8>,
    pub private_key: Option<Vec<u8>>,
    pub number: i64,
    pub is_valid: bool,
}

/// Signed snapshot of a trust line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub number: i64,
    pub trust_line_id: i64,
    pub our_key_hash: Vec<u8>,
    pub our_signature: Vec<u8>,
    pub contractor_key_hash: Option<Vec<u8>>,
    pub contractor_signature: Option<Vec<u8>>,
    pub own_keys_set_hash: Vec<u8>,
    pub contractor_keys_set_hash: Vec<u8>,
    pub balance: Vec<u8>,
    pub outgoing_amount: Vec<u8>,
    pub incoming_amount: Vec<u8>,
}

// =====================================================
// Run Artifacts
// =====================================================

/// One entry of `migration_error.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationErrorEntry {
    pub error: String,
    pub node: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contractor: Option<String>,
}

/// Normalized trust line used for old/new comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustLineEntry {
    pub equivalent: u32,
    pub contractor_id: String,
    pub incoming_trust_amount: String,
    pub outgoing_trust_amount: String,
    pub balance: String,
}

/// Normalized trust-line history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryTrustLineEntry {
    pub equivalent: u32,
    pub transaction_uuid: String,
    pub timestamp: i64,
    pub address: String,
    pub operation_type: String,
    pub sum: String,
}

/// Normalized payment history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPaymentEntry {
    pub equivalent: u32,
    pub transaction_uuid: String,
    pub timestamp: i64,
    pub address: String,
    pub payment_type: String,
    pub sum: String,
    pub balance: String,
}

/// Anything that can appear in a node's comparison set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ComparisonEntry {
    TrustLine(TrustLineEntry),
    HistoryTrustLine(HistoryTrustLineEntry),
    HistoryPayment(HistoryPaymentEntry),
}

/// Keyed comparison set of one node (`tl_<eq>,<peer>`, `h_tl_<eq>,<uuid>`, `h_p_<eq>,<uuid>`).
pub type NodeComparison = BTreeMap<String, ComparisonEntry>;

/// Per-node outcome of an old/new comparison.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeVerdict {
    pub node: String,
    pub passed: bool,
    pub only_in_old: Vec<String>,
    pub only_in_new: Vec<String>,
    pub differing: Vec<String>,
    pub ignored: usize,
}

/// Per-equivalent trust line statistics gathered by the checker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustLineStat {
    pub equivalent: u32,
    pub count_all: u64,
    pub count_0_bal: u64,
    pub count_non_0_bal: u64,
}

/// Final counters of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_type_codes() {
        assert_eq!(HistoryRecordType::from_code(1), HistoryRecordType::TrustLine);
        assert_eq!(HistoryRecordType::from_code(3).code(), 3);
        assert_eq!(HistoryRecordType::from_code(9), HistoryRecordType::Other(9));
    }

    #[test]
    fn test_comparison_entry_serializes_flat() {
        let entry = ComparisonEntry::TrustLine(TrustLineEntry {
            equivalent: 1,
            contractor_id: "peer".to_string(),
            incoming_trust_amount: "0".to_string(),
            outgoing_trust_amount: "100".to_string(),
            balance: "0".to_string(),
        });
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["contractor_id"], "peer");
        assert_eq!(value["outgoing_trust_amount"], "100");
    }

    #[test]
    fn test_error_entry_omits_missing_contractor() {
        let entry = MigrationErrorEntry {
            error: "Cannot parse 'conf.json' file".to_string(),
            node: "n1".to_string(),
            contractor: None,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("contractor"));
    }
}
