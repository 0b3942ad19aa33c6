//! Fixtures shared by the unit and end-to-end tests: old node trees on disk
//! and a stand-in for the node executable.

use async_trait::async_trait;
use ledger_migrator_types::{HistoryRecord, OldTrustLine, OwnKey};
use rusqlite::{params, Connection};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::codec::{encode_amount, encode_identity, AmountSign};
use crate::db::store::{COMMUNICATOR_DB, STORAGE_DB};
use crate::db::NodeStore;
use crate::driver::{CommandSession, ProcessDriver};
use crate::error::{MigrationError, Result};

const OLD_SCHEMA: &str = "
CREATE TABLE trust_lines (
    contractor BLOB NOT NULL,
    incoming_amount BLOB NOT NULL,
    outgoing_amount BLOB NOT NULL,
    balance BLOB NOT NULL,
    is_contractor_gateway INTEGER NOT NULL DEFAULT 0,
    equivalent INTEGER NOT NULL
);
CREATE TABLE history (
    operation_uuid BLOB NOT NULL,
    operation_timestamp INTEGER NOT NULL,
    record_type INTEGER NOT NULL,
    record_body BLOB NOT NULL,
    record_body_bytes_count INTEGER NOT NULL,
    equivalent INTEGER NOT NULL,
    command_uuid BLOB
);
CREATE TABLE transactions (
    transaction_uuid BLOB NOT NULL,
    transaction_body BLOB,
    transaction_bytes_count INTEGER
);
";

const COMMUNICATOR_SCHEMA: &str = "
CREATE TABLE communicator_messages_queue (
    contractor_uuid BLOB NOT NULL,
    transaction_uuid BLOB NOT NULL,
    message_type INTEGER NOT NULL,
    message BLOB,
    recording_time INTEGER NOT NULL,
    equivalent INTEGER NOT NULL
);
";

/// An old trust line toward `peer` with a zero balance.
pub fn line_to(peer: &str, equivalent: u32, outgoing: u128, incoming: u128) -> OldTrustLine {
    OldTrustLine {
        contractor: encode_identity(peer).unwrap().to_vec(),
        contractor_id: peer.to_string(),
        incoming_amount: encode_amount(AmountSign::Unsigned, incoming),
        outgoing_amount: encode_amount(AmountSign::Unsigned, outgoing),
        balance: encode_amount(AmountSign::NonNegative, 0),
        is_contractor_gateway: false,
        equivalent,
    }
}

/// A history record whose body is `tag | peer identity | tail`.
pub fn history_record(record_type: i64, peer: &str, tail: &[u8]) -> HistoryRecord {
    let mut body = vec![record_type as u8];
    body.extend_from_slice(&encode_identity(peer).unwrap());
    body.extend_from_slice(tail);
    HistoryRecord {
        operation_uuid: uuid::Uuid::new_v4().as_bytes().to_vec(),
        operation_timestamp: 1_600_000_000,
        record_type,
        record_body_bytes_count: body.len() as i64,
        record_body: body,
        equivalent: 1,
        command_uuid: None,
    }
}

/// Builds an old node directory: `conf.json`, `io/storageDB` and optionally
/// `io/communicatorStorageDB`.
pub struct OldNodeFixture {
    path: PathBuf,
    name: String,
    port: u16,
    conf: Option<String>,
    trust_lines: Vec<OldTrustLine>,
    history: Vec<HistoryRecord>,
    transactions: Vec<String>,
    messages: Vec<(String, String)>,
    communicator: bool,
}

impl OldNodeFixture {
    pub fn new(root: &Path, name: &str) -> Self {
        Self {
            path: root.join(name),
            name: name.to_string(),
            port: 2033,
            conf: None,
            trust_lines: Vec::new(),
            history: Vec::new(),
            transactions: Vec::new(),
            messages: Vec::new(),
            communicator: true,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn trust_line(
        mut self,
        peer: &str,
        equivalent: u32,
        outgoing: u128,
        incoming: u128,
        balance_sign: AmountSign,
        balance: u128,
    ) -> Self {
        let mut line = line_to(peer, equivalent, outgoing, incoming);
        line.balance = encode_amount(balance_sign, balance);
        self.trust_lines.push(line);
        self
    }

    pub fn gateway_line(mut self, peer: &str, equivalent: u32, balance_sign: AmountSign, balance: u128) -> Self {
        let mut line = line_to(peer, equivalent, 0, 0);
        line.balance = encode_amount(balance_sign, balance);
        line.is_contractor_gateway = true;
        self.trust_lines.push(line);
        self
    }

    pub fn history(mut self, record: HistoryRecord) -> Self {
        self.history.push(record);
        self
    }

    pub fn pending_transaction(mut self, transaction_uuid: &str) -> Self {
        self.transactions.push(transaction_uuid.to_string());
        self
    }

    pub fn queued_message(mut self, contractor: &str, transaction_uuid: &str) -> Self {
        self.messages.push((contractor.to_string(), transaction_uuid.to_string()));
        self
    }

    pub fn without_communicator(mut self) -> Self {
        self.communicator = false;
        self
    }

    /// Replaces the generated `conf.json` with arbitrary text.
    pub fn raw_conf(mut self, text: &str) -> Self {
        self.conf = Some(text.to_string());
        self
    }

    pub fn write(self) -> PathBuf {
        std::fs::create_dir_all(self.path.join("io")).unwrap();
        let conf = self.conf.clone().unwrap_or_else(|| {
            serde_json::json!({
                "node": { "uuid": self.name },
                "network": { "interface": "127.0.0.1", "port": self.port }
            })
            .to_string()
        });
        std::fs::write(self.path.join("conf.json"), conf).unwrap();

        let conn = Connection::open(self.path.join(STORAGE_DB)).unwrap();
        conn.execute_batch(OLD_SCHEMA).unwrap();
        for line in &self.trust_lines {
            conn.execute(
                "INSERT INTO trust_lines (contractor, incoming_amount, outgoing_amount, balance, is_contractor_gateway, equivalent)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    line.contractor,
                    line.incoming_amount,
                    line.outgoing_amount,
                    line.balance,
                    line.is_contractor_gateway as i64,
                    line.equivalent
                ],
            )
            .unwrap();
        }
        for record in &self.history {
            conn.execute(
                "INSERT INTO history (operation_uuid, operation_timestamp, record_type, record_body,
                                      record_body_bytes_count, equivalent, command_uuid)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.operation_uuid,
                    record.operation_timestamp,
                    record.record_type,
                    record.record_body,
                    record.record_body_bytes_count,
                    record.equivalent,
                    record.command_uuid
                ],
            )
            .unwrap();
        }
        for transaction in &self.transactions {
            conn.execute(
                "INSERT INTO transactions (transaction_uuid) VALUES (?1)",
                params![encode_identity(transaction).unwrap().to_vec()],
            )
            .unwrap();
        }

        if self.communicator {
            let conn = Connection::open(self.path.join(COMMUNICATOR_DB)).unwrap();
            conn.execute_batch(COMMUNICATOR_SCHEMA).unwrap();
            for (contractor, transaction) in &self.messages {
                conn.execute(
                    "INSERT INTO communicator_messages_queue (contractor_uuid, transaction_uuid, message_type, recording_time, equivalent)
                     VALUES (?1, ?2, 1, 1600000000, 1)",
                    params![
                        encode_identity(contractor).unwrap().to_vec(),
                        encode_identity(transaction).unwrap().to_vec()
                    ],
                )
                .unwrap();
            }
        }
        self.path
    }
}

pub fn synthetic_public_key(node: &str, trust_line_id: i64) -> Vec<u8> {
    format!("pk:{}:{}", node, trust_line_id).into_bytes()
}

fn synthetic_key(node: &str, trust_line_id: i64) -> OwnKey {
    OwnKey {
        hash: format!("hash:{}:{}", node, trust_line_id).into_bytes(),
        trust_line_id,
        keys_set_sequence_number: 1,
        public_key: synthetic_public_key(node, trust_line_id),
        private_key: Some(format!("sk:{}:{}", node, trust_line_id).into_bytes()),
        number: 0,
        is_valid: true,
    }
}

/// Stands in for the node executable. `run_and_wait` writes one own key per
/// trust line that has none and signs its audit; `start` hands out scripted
/// sessions in the order they were queued.
pub struct StubDriver {
    runs: Mutex<Vec<PathBuf>>,
    failing: Vec<String>,
    sessions: Mutex<VecDeque<ScriptedSession>>,
}

impl StubDriver {
    pub fn new() -> Self {
        Self {
            runs: Mutex::new(Vec::new()),
            failing: Vec::new(),
            sessions: Mutex::new(VecDeque::new()),
        }
    }

    pub fn failing_on(mut self, node: &str) -> Self {
        self.failing.push(node.to_string());
        self
    }

    /// Queues a session answering with `tails` (everything after the request id), in order.
    pub fn with_session(self, tails: Vec<String>) -> Self {
        self.sessions.lock().unwrap().push_back(ScriptedSession::new(tails));
        self
    }

    pub fn runs(&self) -> Vec<PathBuf> {
        self.runs.lock().unwrap().clone()
    }

    fn provision_keys(node: &str, node_path: &Path) -> Result<()> {
        let mut store = NodeStore::new(node, node_path, Some(node_path), false);
        for line in store.list_trust_lines()? {
            if !store.list_own_keys(line.id)?.is_empty() {
                continue;
            }
            let key = synthetic_key(node, line.id);
            store.insert_own_key(&key)?;
            store.sign_audit(line.id, &key.hash, format!("sig:{}:{}", node, line.id).as_bytes())?;
        }
        Ok(())
    }
}

fn node_name(node_path: &Path) -> String {
    node_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[async_trait]
impl ProcessDriver for StubDriver {
    async fn run_and_wait(&self, node_path: &Path) -> Result<()> {
        self.runs.lock().unwrap().push(node_path.to_path_buf());
        let node = node_name(node_path);
        if self.failing.contains(&node) {
            return Err(MigrationError::CommandTimeout {
                node,
                command: "run".to_string(),
                waited: std::time::Duration::from_secs(0),
            });
        }
        Self::provision_keys(&node, node_path)
    }

    async fn start(&self, node_path: &Path) -> Result<Box<dyn CommandSession>> {
        self.runs.lock().unwrap().push(node_path.to_path_buf());
        match self.sessions.lock().unwrap().pop_front() {
            Some(session) => Ok(Box::new(session)),
            None => Err(MigrationError::protocol(format!(
                "no scripted session left for {}",
                node_path.display()
            ))),
        }
    }
}

/// Replies to commands from a fixed script, echoing each request id.
pub struct ScriptedSession {
    tails: VecDeque<String>,
    pub sent: Vec<String>,
    terminated: bool,
}

impl ScriptedSession {
    pub fn new(tails: Vec<String>) -> Self {
        Self {
            tails: tails.into(),
            sent: Vec::new(),
            terminated: false,
        }
    }
}

#[async_trait]
impl CommandSession for ScriptedSession {
    async fn send_command(&mut self, line: &str) -> Result<String> {
        if self.terminated {
            return Err(MigrationError::protocol("session already terminated"));
        }
        self.sent.push(line.to_string());
        let request_id = line.split('\t').next().unwrap_or_default();
        match self.tails.pop_front() {
            Some(tail) => Ok(format!("{}\t{}\n", request_id, tail)),
            None => Err(MigrationError::CommandTimeout {
                node: "scripted".to_string(),
                command: line.to_string(),
                waited: std::time::Duration::from_secs(0),
            }),
        }
    }

    async fn terminate(&mut self) {
        self.terminated = true;
    }
}
