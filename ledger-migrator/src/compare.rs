//! Old/new state comparison of migrated nodes.
//!
//! Each node's trust lines and history are collected from both trees, either
//! straight from the stores or by asking the running executables, and keyed
//! so the two sides can be diffed entry by entry. Records whose counterparty
//! is outside the migrated set are kept apart as ignored.

use ledger_migrator_types::{
    ComparisonEntry, HistoryPaymentEntry, HistoryRecord, HistoryRecordType, HistoryTrustLineEntry, NodeComparison,
    NodeVerdict, TrustLineEntry,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::codec::{decode_amount, decode_identity_slice, NodeAddress, IDENTITY_SIZE};
use crate::config::{EquivalentMap, GnsTable, MigrationConfig};
use crate::db::NodeStore;
use crate::driver::protocol::{address_of, normalize_number, parse_field, stride};
use crate::driver::{request, Command, CommandSession, ProcessDriver};
use crate::error::{MigrationError, Result};
use crate::history::{embedded_peer, padding_for, CHANNEL_ID_SIZE, OPERATION_TYPE_SIZE};
use crate::inventory::{discover, NodeEntry, NodeIndex};
use crate::state::{save_json, RunState};

/// Marker written into a new node directory once it has been compared.
pub const COMPARED_MARKER: &str = "compared.json";

const OLD_COMPARE: &str = "old_compare.json";
const NEW_COMPARE: &str = "new_compare.json";
const OLD_IGNORED: &str = "old_ignored.json";
const NEW_IGNORED: &str = "new_ignored.json";
const VERDICTS: &str = "verdicts.json";
const ARTIFACTS: [&str; 5] = [OLD_COMPARE, NEW_COMPARE, OLD_IGNORED, NEW_IGNORED, VERDICTS];

/// Where node state is read from.
#[derive(Clone)]
pub enum StateSource {
    Store,
    Process {
        old: Arc<dyn ProcessDriver>,
        new: Arc<dyn ProcessDriver>,
    },
}

#[derive(Debug, Default)]
pub struct CompareReport {
    pub verdicts: Vec<NodeVerdict>,
    /// Nodes compared in this or an earlier, interrupted pass.
    pub compared: usize,
    pub pending: usize,
    pub total: usize,
    pub errors: usize,
}

impl CompareReport {
    pub fn passed(&self) -> bool {
        self.pending == 0 && self.errors == 0 && self.verdicts.iter().all(|v| v.passed)
    }
}

pub fn trust_line_key(equivalent: u32, peer: &str) -> String {
    format!("tl_{},{}", equivalent, peer)
}

pub fn history_trust_line_key(equivalent: u32, transaction_uuid: &str) -> String {
    format!("h_tl_{},{}", equivalent, transaction_uuid)
}

pub fn history_payment_key(equivalent: u32, transaction_uuid: &str) -> String {
    format!("h_p_{},{}", equivalent, transaction_uuid)
}

/// Comparable state of one side of one node.
#[derive(Debug, Default)]
struct NodeSnapshot {
    comparison: NodeComparison,
    ignored: NodeComparison,
}

impl NodeSnapshot {
    fn insert(&mut self, known_peer: bool, key: String, entry: ComparisonEntry) {
        if known_peer {
            self.comparison.insert(key, entry);
        } else {
            self.ignored.insert(key, entry);
        }
    }
}

/// Entry-by-entry difference of the two sides of a node.
pub fn diff(node: &str, old: &NodeComparison, new: &NodeComparison, ignored: usize) -> NodeVerdict {
    let mut verdict = NodeVerdict {
        node: node.to_string(),
        ignored,
        ..Default::default()
    };
    for (key, old_entry) in old {
        match new.get(key) {
            None => verdict.only_in_old.push(key.clone()),
            Some(new_entry) if new_entry != old_entry => verdict.differing.push(key.clone()),
            Some(_) => {}
        }
    }
    verdict.only_in_new = new.keys().filter(|k| !old.contains_key(*k)).cloned().collect();
    verdict.passed = verdict.only_in_old.is_empty() && verdict.only_in_new.is_empty() && verdict.differing.is_empty();
    verdict
}

// =====================================================
// Store source
// =====================================================

fn transaction_uuid(record: &HistoryRecord) -> String {
    if record.operation_uuid.len() == IDENTITY_SIZE {
        if let Ok(uuid) = decode_identity_slice(&record.operation_uuid) {
            return uuid;
        }
    }
    hex::encode(&record.operation_uuid)
}

/// Comparison entry of a history record once the counterparty is resolved.
/// `tail` is the part of the body that migration carries over untouched.
fn history_entry(record: &HistoryRecord, address: &str, tail: &[u8]) -> (String, ComparisonEntry) {
    let uuid = transaction_uuid(record);
    let operation_type = record.record_body.first().copied().unwrap_or_default().to_string();
    match HistoryRecordType::from_code(record.record_type) {
        HistoryRecordType::TrustLine => (
            history_trust_line_key(record.equivalent, &uuid),
            ComparisonEntry::HistoryTrustLine(HistoryTrustLineEntry {
                equivalent: record.equivalent,
                transaction_uuid: uuid,
                timestamp: record.operation_timestamp,
                address: address.to_string(),
                operation_type,
                sum: hex::encode(tail),
            }),
        ),
        _ => (
            history_payment_key(record.equivalent, &uuid),
            ComparisonEntry::HistoryPayment(HistoryPaymentEntry {
                equivalent: record.equivalent,
                transaction_uuid: uuid,
                timestamp: record.operation_timestamp,
                address: address.to_string(),
                payment_type: operation_type,
                sum: hex::encode(tail),
                balance: String::new(),
            }),
        ),
    }
}

/// Nodes the migrated node has a channel with, from its new contractor addresses.
fn channel_peers(entry: &NodeEntry, index: &NodeIndex) -> Result<HashSet<String>> {
    let mut store = NodeStore::new(&entry.name, &entry.old_path, Some(&entry.new_path), false);
    let mut peers = HashSet::new();
    for row in store.list_contractor_addresses()? {
        let address = NodeAddress::decode(&row.address)?.to_string();
        if let Some(name) = index.name_by_address(&address) {
            peers.insert(name.to_string());
        }
    }
    Ok(peers)
}

/// Old state of a node. History toward a node without a channel was dropped
/// by the migration and goes to the ignored bucket.
fn old_snapshot_from_store(
    entry: &NodeEntry,
    channel_peers: &HashSet<String>,
    equivalents: &EquivalentMap,
) -> Result<NodeSnapshot> {
    let mut store = NodeStore::new(&entry.name, &entry.old_path, None, true);
    let mut snapshot = NodeSnapshot::default();

    for line in store.read_old_trust_lines(equivalents)? {
        let key = trust_line_key(line.equivalent, &line.contractor_id);
        let trust_line = TrustLineEntry {
            equivalent: line.equivalent,
            contractor_id: line.contractor_id.clone(),
            incoming_trust_amount: decode_amount(&line.incoming_amount)?.to_normalized(),
            outgoing_trust_amount: decode_amount(&line.outgoing_amount)?.to_normalized(),
            balance: decode_amount(&line.balance)?.to_normalized(),
        };
        snapshot.comparison.insert(key, ComparisonEntry::TrustLine(trust_line));
    }

    for record in store.read_old_history(equivalents)? {
        let peer = match embedded_peer(&record.record_body) {
            Ok(peer) => peer,
            Err(e) => {
                log::warn!("Node {}: {}", entry.name, e);
                continue;
            }
        };
        let tail = &record.record_body[OPERATION_TYPE_SIZE + IDENTITY_SIZE..];
        let (key, value) = history_entry(&record, &peer, tail);
        snapshot.insert(channel_peers.contains(&peer), key, value);
    }
    store.close()?;
    Ok(snapshot)
}

/// Splits a rewritten history body into the counterparty address and the
/// carried-over tail.
fn split_new_history_body(record: &HistoryRecord) -> Result<(NodeAddress, &[u8])> {
    let body = &record.record_body;
    let record_type = HistoryRecordType::from_code(record.record_type);
    let mut pos = OPERATION_TYPE_SIZE;
    if record_type == HistoryRecordType::TrustLine {
        pos += CHANNEL_ID_SIZE;
    }
    // Address count.
    pos += 1;
    let rest = body
        .get(pos..)
        .ok_or_else(|| MigrationError::MalformedRecord(format!("body of {} bytes has no address", body.len())))?;
    let address = NodeAddress::decode(rest)?;
    let start = pos + address.encode()?.len();
    let end = body.len().saturating_sub(padding_for(record_type));
    let tail = body
        .get(start..end.max(start))
        .ok_or_else(|| MigrationError::MalformedRecord(format!("body of {} bytes is truncated", body.len())))?;
    Ok((address, tail))
}

fn new_snapshot_from_store(entry: &NodeEntry, index: &NodeIndex) -> Result<NodeSnapshot> {
    let mut store = NodeStore::new(&entry.name, &entry.old_path, Some(&entry.new_path), true);
    let mut snapshot = NodeSnapshot::default();

    let mut addresses = HashMap::new();
    for row in store.list_contractor_addresses()? {
        addresses.insert(row.contractor_id, NodeAddress::decode(&row.address)?.to_string());
    }
    let audits: HashMap<i64, _> = store
        .list_audits()?
        .into_iter()
        .map(|audit| (audit.trust_line_id, audit))
        .collect();

    for line in store.list_trust_lines()? {
        let address = addresses.get(&line.contractor_id).cloned().unwrap_or_default();
        let contractor = match index.name_by_address(&address) {
            Some(name) => name.to_string(),
            None => {
                log::warn!("Node {}: trust line to unknown address '{}'", entry.name, address);
                address.clone()
            }
        };
        let audit = audits.get(&line.id).ok_or_else(|| {
            MigrationError::protocol(format!("trust line {} of node {} has no audit", line.id, entry.name))
        })?;
        let trust_line = TrustLineEntry {
            equivalent: line.equivalent,
            contractor_id: contractor.clone(),
            incoming_trust_amount: decode_amount(&audit.incoming_amount)?.to_normalized(),
            outgoing_trust_amount: decode_amount(&audit.outgoing_amount)?.to_normalized(),
            balance: decode_amount(&audit.balance)?.to_normalized(),
        };
        snapshot.comparison.insert(
            trust_line_key(line.equivalent, &contractor),
            ComparisonEntry::TrustLine(trust_line),
        );
    }

    for record in store.list_history()? {
        let (address, tail) = match split_new_history_body(&record) {
            Ok(parts) => parts,
            Err(e) => {
                log::warn!("Node {}: {}", entry.name, e);
                continue;
            }
        };
        let address = address.to_string();
        let (known, label) = match index.name_by_address(&address) {
            Some(name) => (true, name.to_string()),
            None => (false, address),
        };
        let (key, value) = history_entry(&record, &label, tail);
        snapshot.insert(known, key, value);
    }
    store.close()?;
    Ok(snapshot)
}

// =====================================================
// Process source
// =====================================================

async fn list_equivalents(session: &mut dyn CommandSession) -> Result<Vec<u32>> {
    let reply = request(session, &Command::Equivalents).await?.ensure_ok()?;
    reply
        .records(1)?
        .iter()
        .map(|record| parse_field(record, 0, "equivalent"))
        .collect()
}

async fn old_snapshot_from_process(
    session: &mut dyn CommandSession,
    index: &NodeIndex,
    equivalents: &EquivalentMap,
) -> Result<NodeSnapshot> {
    let mut snapshot = NodeSnapshot::default();
    for equivalent in list_equivalents(session).await? {
        let mapped = equivalents.map(equivalent);

        let reply = request(session, &Command::TrustLines { equivalent }).await?.ensure_ok()?;
        for record in reply.records(stride::OLD_TRUST_LINES)? {
            let contractor = record[0].trim().to_string();
            snapshot.comparison.insert(
                trust_line_key(mapped, &contractor),
                ComparisonEntry::TrustLine(TrustLineEntry {
                    equivalent: mapped,
                    contractor_id: contractor,
                    incoming_trust_amount: normalize_number(&record[1]),
                    outgoing_trust_amount: normalize_number(&record[2]),
                    balance: normalize_number(&record[3]),
                }),
            );
        }

        let reply = request(session, &Command::HistoryTrustLines { equivalent })
            .await?
            .ensure_ok()?;
        for record in reply.records(stride::HISTORY_TRUST_LINES)? {
            let peer = record[2].trim();
            let uuid = record[0].trim().to_string();
            snapshot.insert(
                index.contains(peer),
                history_trust_line_key(mapped, &uuid),
                ComparisonEntry::HistoryTrustLine(HistoryTrustLineEntry {
                    equivalent: mapped,
                    transaction_uuid: uuid,
                    timestamp: parse_field(record, 1, "timestamp")?,
                    address: peer.to_string(),
                    operation_type: record[3].trim().to_string(),
                    sum: normalize_number(&record[4]),
                }),
            );
        }

        let reply = request(session, &Command::HistoryPayments { equivalent })
            .await?
            .ensure_ok()?;
        for record in reply.records(stride::OLD_HISTORY_PAYMENTS)? {
            let peer = record[2].trim();
            let uuid = record[0].trim().to_string();
            snapshot.insert(
                index.contains(peer),
                history_payment_key(mapped, &uuid),
                ComparisonEntry::HistoryPayment(HistoryPaymentEntry {
                    equivalent: mapped,
                    transaction_uuid: uuid,
                    timestamp: parse_field(record, 1, "timestamp")?,
                    address: peer.to_string(),
                    payment_type: record[3].trim().to_string(),
                    sum: normalize_number(&record[4]),
                    balance: normalize_number(&record[5]),
                }),
            );
        }
    }
    Ok(snapshot)
}

/// Node name behind an `"<type> <address>"` field, or the bare address.
fn resolve_peer<'a>(index: &'a NodeIndex, addresses: &'a str) -> (bool, &'a str) {
    let address = address_of(addresses);
    match index.name_by_address(address) {
        Some(name) => (true, name),
        None => (false, address),
    }
}

async fn new_snapshot_from_process(session: &mut dyn CommandSession, index: &NodeIndex) -> Result<NodeSnapshot> {
    let mut snapshot = NodeSnapshot::default();
    for equivalent in list_equivalents(session).await? {
        let reply = request(session, &Command::TrustLines { equivalent }).await?.ensure_ok()?;
        for record in reply.records(stride::NEW_TRUST_LINES)? {
            let (known, contractor) = resolve_peer(index, &record[1]);
            if !known {
                log::warn!("Trust line to unknown address '{}'", contractor);
            }
            snapshot.comparison.insert(
                trust_line_key(equivalent, contractor),
                ComparisonEntry::TrustLine(TrustLineEntry {
                    equivalent,
                    contractor_id: contractor.to_string(),
                    incoming_trust_amount: normalize_number(&record[5]),
                    outgoing_trust_amount: normalize_number(&record[6]),
                    balance: normalize_number(&record[7]),
                }),
            );
        }

        let reply = request(session, &Command::HistoryTrustLines { equivalent })
            .await?
            .ensure_ok()?;
        for record in reply.records(stride::HISTORY_TRUST_LINES)? {
            let (known, peer) = resolve_peer(index, &record[2]);
            let uuid = record[0].trim().to_string();
            snapshot.insert(
                known,
                history_trust_line_key(equivalent, &uuid),
                ComparisonEntry::HistoryTrustLine(HistoryTrustLineEntry {
                    equivalent,
                    transaction_uuid: uuid,
                    timestamp: parse_field(record, 1, "timestamp")?,
                    address: peer.to_string(),
                    operation_type: record[3].trim().to_string(),
                    sum: normalize_number(&record[4]),
                }),
            );
        }

        let reply = request(session, &Command::HistoryPayments { equivalent })
            .await?
            .ensure_ok()?;
        for record in reply.records(stride::NEW_HISTORY_PAYMENTS)? {
            let (known, peer) = resolve_peer(index, &record[2]);
            let uuid = record[0].trim().to_string();
            snapshot.insert(
                known,
                history_payment_key(equivalent, &uuid),
                ComparisonEntry::HistoryPayment(HistoryPaymentEntry {
                    equivalent,
                    transaction_uuid: uuid,
                    timestamp: parse_field(record, 1, "timestamp")?,
                    address: peer.to_string(),
                    payment_type: record[3].trim().to_string(),
                    sum: normalize_number(&record[4]),
                    balance: normalize_number(&record[5]),
                }),
            );
        }
    }
    Ok(snapshot)
}

// =====================================================
// Sharded pass
// =====================================================

struct Shard {
    id: usize,
    prefix: String,
    entries: Vec<NodeEntry>,
    index: Arc<NodeIndex>,
    equivalents: Arc<EquivalentMap>,
    source: StateSource,
    out_dir: PathBuf,
}

#[derive(Default)]
struct ShardResult {
    state: RunState,
    verdicts: Vec<NodeVerdict>,
    compared: usize,
}

async fn snapshots(entry: &NodeEntry, shard: &Shard) -> Result<(NodeSnapshot, NodeSnapshot)> {
    match &shard.source {
        StateSource::Store => {
            let peers = channel_peers(entry, &shard.index)?;
            Ok((
                old_snapshot_from_store(entry, &peers, &shard.equivalents)?,
                new_snapshot_from_store(entry, &shard.index)?,
            ))
        }
        StateSource::Process { old, new } => {
            let mut session = old.start(&entry.old_path).await?;
            let old_snapshot = old_snapshot_from_process(session.as_mut(), &shard.index, &shard.equivalents).await;
            session.terminate().await;
            let old_snapshot = old_snapshot?;

            let mut session = new.start(&entry.new_path).await?;
            let new_snapshot = new_snapshot_from_process(session.as_mut(), &shard.index).await;
            session.terminate().await;
            Ok((old_snapshot, new_snapshot?))
        }
    }
}

impl Shard {
    fn artifact(&self, name: &str) -> PathBuf {
        self.out_dir.join(format!("{}{}", self.prefix, name))
    }

    fn save(&self, result: &ShardResult) -> Result<()> {
        save_json(&result.state.old_comparison, &self.artifact(OLD_COMPARE))?;
        save_json(&result.state.new_comparison, &self.artifact(NEW_COMPARE))?;
        save_json(&result.state.old_ignored, &self.artifact(OLD_IGNORED))?;
        save_json(&result.state.new_ignored, &self.artifact(NEW_IGNORED))?;
        save_json(&result.verdicts, &self.artifact(VERDICTS))
    }

    async fn run(self) -> ShardResult {
        let mut result = ShardResult::default();
        for (position, entry) in self.entries.iter().enumerate() {
            let marker = entry.new_path.join(COMPARED_MARKER);
            if marker.exists() {
                result.compared += 1;
                continue;
            }
            log::info!(
                "[shard {}] Comparing node #{}/{}: {}",
                self.id,
                position + 1,
                self.entries.len(),
                entry.name
            );
            match snapshots(entry, &self).await {
                Ok((old, new)) => {
                    let verdict = diff(
                        &entry.name,
                        &old.comparison,
                        &new.comparison,
                        old.ignored.len() + new.ignored.len(),
                    );
                    if verdict.passed {
                        log::info!("Node {} matches ({} ignored)", entry.name, verdict.ignored);
                    } else {
                        log::error!(
                            "Node {} differs: {} only in old, {} only in new, {} changed",
                            entry.name,
                            verdict.only_in_old.len(),
                            verdict.only_in_new.len(),
                            verdict.differing.len()
                        );
                    }
                    let state = &mut result.state;
                    state.old_comparison.insert(entry.name.clone(), old.comparison);
                    state.new_comparison.insert(entry.name.clone(), new.comparison);
                    state.old_ignored.insert(entry.name.clone(), old.ignored);
                    state.new_ignored.insert(entry.name.clone(), new.ignored);
                    result.verdicts.push(verdict);

                    if let Err(e) = save_json(&serde_json::json!({}), &marker) {
                        log::error!("Cannot mark node {} as compared: {}", entry.name, e);
                        result.state.record(&entry.name, &e);
                    } else {
                        result.compared += 1;
                    }
                }
                Err(e) => {
                    log::error!("Failed to compare node {}: {}", entry.name, e);
                    result.state.record(&entry.name, &e);
                }
            }
            if let Err(e) = self.save(&result) {
                log::error!("[shard {}] Cannot save comparison artifacts: {}", self.id, e);
            }
        }
        result
    }
}

/// Renames the artifacts of a finished pass with a timestamp suffix and
/// clears the per-node markers.
fn rotate(out_dir: &Path, prefixes: &[String], entries: &[NodeEntry]) -> Result<()> {
    let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    for prefix in prefixes {
        for name in ARTIFACTS {
            let path = out_dir.join(format!("{}{}", prefix, name));
            if !path.exists() {
                continue;
            }
            let stem = name.trim_end_matches(".json");
            let rotated = out_dir.join(format!("{}{}_{}.json", prefix, stem, stamp));
            std::fs::rename(&path, &rotated)?;
            log::debug!("Rotated {} -> {}", path.display(), rotated.display());
        }
    }
    for entry in entries {
        let marker = entry.new_path.join(COMPARED_MARKER);
        if marker.exists() {
            std::fs::remove_file(marker)?;
        }
    }
    Ok(())
}

/// Compares every migrated node. A node missing from the new tree aborts the
/// pass before anything is compared.
pub async fn compare(config: &MigrationConfig, source: StateSource) -> Result<CompareReport> {
    let equivalents = Arc::new(EquivalentMap::load(&config.equivalents_table_path)?);
    let gns = GnsTable::load(&config.gns_table_path)?;
    let mut discovery = RunState::new();
    let entries = discover(
        &config.old_infrastructure_path,
        &config.new_infrastructure_path,
        &gns,
        &mut discovery,
    )?;
    if let Some(missing) = entries.iter().find(|e| !e.is_migrated()) {
        return Err(MigrationError::MissingMigratedNode(missing.name.clone()));
    }
    let index = Arc::new(NodeIndex::new(&entries));

    let threads = config.threads.clamp(1, entries.len().max(1));
    let prefixes: Vec<String> = (0..threads)
        .map(|n| if threads > 1 { format!("t{}_", n) } else { String::new() })
        .collect();

    let mut handles = Vec::with_capacity(threads);
    for (id, prefix) in prefixes.iter().enumerate() {
        let shard = Shard {
            id,
            prefix: prefix.clone(),
            entries: entries
                .iter()
                .enumerate()
                .filter(|(idx, _)| idx % threads == id)
                .map(|(_, e)| e.clone())
                .collect(),
            index: index.clone(),
            equivalents: equivalents.clone(),
            source: source.clone(),
            out_dir: config.new_infrastructure_path.clone(),
        };
        handles.push(tokio::spawn(shard.run()));
    }

    let mut report = CompareReport {
        total: entries.len(),
        ..Default::default()
    };
    let mut seen = BTreeSet::new();
    for handle in handles {
        let result = handle
            .await
            .map_err(|e| MigrationError::protocol(format!("comparison task failed: {}", e)))?;
        report.compared += result.compared;
        report.errors += result.state.errors.len();
        for verdict in result.verdicts {
            seen.insert(verdict.node.clone());
            report.verdicts.push(verdict);
        }
    }
    report.pending = report.total.saturating_sub(report.compared);

    log::info!(
        "Compared {}/{} nodes ({} in this pass), {} failed, {} pending",
        report.compared,
        report.total,
        seen.len(),
        report.verdicts.iter().filter(|v| !v.passed).count(),
        report.pending
    );
    if report.pending == 0 {
        rotate(&config.new_infrastructure_path, &prefixes, &entries)?;
    }
    Ok(report)
}
