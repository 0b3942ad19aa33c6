//! New-schema table set

use rusqlite::params;

use super::super::NodeStore;
use crate::error::Result;

pub const EQUIVALENTS_REGISTRY_FEATURE: &str = "EQUIVALENTS_REGISTRY_ADDRESS";
pub const EQUIVALENTS_REGISTRY_ADDRESS: &str = "eth";

pub const NEW_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS contractors (
    id INTEGER PRIMARY KEY,
    id_on_contractor_side INTEGER,
    crypto_key BLOB NOT NULL,
    is_confirmed INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS contractors_addresses (
    type INTEGER NOT NULL,
    contractor_id INTEGER NOT NULL,
    address_size INTEGER NOT NULL,
    address BLOB NOT NULL,
    FOREIGN KEY(contractor_id) REFERENCES contractors(id) ON DELETE CASCADE ON UPDATE CASCADE
);
CREATE TABLE IF NOT EXISTS trust_lines (
    id INTEGER PRIMARY KEY,
    state INTEGER NOT NULL,
    contractor_id INTEGER NOT NULL,
    equivalent INTEGER NOT NULL,
    is_contractor_gateway INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY(contractor_id) REFERENCES contractors(id) ON DELETE CASCADE ON UPDATE CASCADE
);
CREATE TABLE IF NOT EXISTS audit (
    number INTEGER NOT NULL,
    trust_line_id INTEGER NOT NULL,
    our_key_hash BLOB NOT NULL,
    our_signature BLOB NOT NULL,
    contractor_key_hash BLOB DEFAULT NULL,
    contractor_signature BLOB DEFAULT NULL,
    own_keys_set_hash BLOB NOT NULL,
    contractor_keys_set_hash BLOB NOT NULL,
    balance BLOB NOT NULL,
    outgoing_amount BLOB NOT NULL,
    incoming_amount BLOB NOT NULL,
    FOREIGN KEY(trust_line_id) REFERENCES trust_lines(id) ON DELETE CASCADE ON UPDATE CASCADE
);
CREATE TABLE IF NOT EXISTS own_keys (
    hash BLOB PRIMARY KEY,
    trust_line_id INTEGER NOT NULL,
    keys_set_sequence_number INTEGER NOT NULL,
    public_key BLOB NOT NULL,
    private_key BLOB NOT NULL,
    number INTEGER NOT NULL,
    is_valid INTEGER NOT NULL DEFAULT 1,
    FOREIGN KEY(trust_line_id) REFERENCES trust_lines(id) ON DELETE CASCADE ON UPDATE CASCADE
);
CREATE TABLE IF NOT EXISTS contractor_keys (
    hash BLOB PRIMARY KEY,
    trust_line_id INTEGER NOT NULL,
    keys_set_sequence_number INTEGER NOT NULL,
    public_key BLOB NOT NULL,
    number INTEGER NOT NULL,
    is_valid INTEGER NOT NULL DEFAULT 1,
    FOREIGN KEY(trust_line_id) REFERENCES trust_lines(id) ON DELETE CASCADE ON UPDATE CASCADE
);
CREATE TABLE IF NOT EXISTS history (
    operation_uuid BLOB NOT NULL,
    operation_timestamp INTEGER NOT NULL,
    record_type INTEGER NOT NULL,
    record_body BLOB NOT NULL,
    record_body_bytes_count INT NOT NULL,
    equivalent INTEGER NOT NULL,
    command_uuid BLOB
);
CREATE TABLE IF NOT EXISTS history_additional (
    operation_uuid BLOB NOT NULL,
    operation_timestamp INTEGER NOT NULL,
    record_type INTEGER NOT NULL,
    record_body BLOB NOT NULL,
    record_body_bytes_count INT NOT NULL,
    equivalent INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS incoming_receipt (
    trust_line_id INTEGER NOT NULL,
    audit_number INTEGER NOT NULL,
    transaction_uuid BLOB NOT NULL,
    contractor_public_key_hash BLOB NOT NULL,
    amount BLOB NOT NULL,
    contractor_signature BLOB NOT NULL,
    FOREIGN KEY(trust_line_id) REFERENCES trust_lines(id) ON DELETE CASCADE ON UPDATE CASCADE,
    FOREIGN KEY(contractor_public_key_hash) REFERENCES contractor_keys(hash) ON DELETE CASCADE ON UPDATE CASCADE
);
CREATE TABLE IF NOT EXISTS outgoing_receipt (
    trust_line_id INTEGER NOT NULL,
    audit_number INTEGER NOT NULL,
    transaction_uuid BLOB NOT NULL,
    own_public_key_hash BLOB NOT NULL,
    amount BLOB NOT NULL,
    FOREIGN KEY(trust_line_id) REFERENCES trust_lines(id) ON DELETE CASCADE ON UPDATE CASCADE,
    FOREIGN KEY(own_public_key_hash) REFERENCES own_keys(hash) ON DELETE CASCADE ON UPDATE CASCADE
);
CREATE TABLE IF NOT EXISTS payment_keys (
    transaction_uuid BLOB NOT NULL,
    public_key BLOB NOT NULL,
    private_key BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS payment_participants_votes (
    transaction_uuid BLOB NOT NULL,
    contractor BLOB NOT NULL,
    payment_node_id INTEGER NOT NULL,
    public_key BLOB NOT NULL,
    signature BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS payment_transactions (
    uuid BLOB NOT NULL,
    maximal_claiming_block_number BLOB NOT NULL,
    observing_state INTEGER NOT NULL,
    recording_time INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS transactions (
    transaction_uuid BLOB NOT NULL,
    transaction_body BLOB NOT NULL,
    transaction_bytes_count INT NOT NULL
);
CREATE TABLE IF NOT EXISTS features (
    feature_name STRING NOT NULL,
    feature_length INTEGER NOT NULL,
    feature_value STRING NOT NULL
);
";

impl NodeStore {
    /// Creates every new-schema table and records the equivalents registry feature.
    pub fn create_new_schema(&mut self) -> Result<()> {
        self.with_new(|conn| {
            conn.execute_batch(NEW_SCHEMA)?;
            conn.execute(
                "INSERT INTO features (feature_name, feature_length, feature_value) VALUES (?1, ?2, ?3)",
                params![
                    EQUIVALENTS_REGISTRY_FEATURE,
                    EQUIVALENTS_REGISTRY_ADDRESS.len() as i64,
                    EQUIVALENTS_REGISTRY_ADDRESS
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_feature(&mut self, name: &str) -> Result<Option<String>> {
        self.with_new(|conn| {
            let mut stmt = conn.prepare("SELECT feature_value FROM features WHERE feature_name = ?1")?;
            let mut rows = stmt.query([name])?;
            match rows.next()? {
                Some(row) => Ok(Some(row.get(0)?)),
                None => Ok(None),
            }
        })
    }
}
