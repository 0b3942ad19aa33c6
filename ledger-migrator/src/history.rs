//! History record rewriting.
//!
//! Old record bodies start with a one-byte operation tag followed by the raw
//! identity of the peer. The new layout replaces that identity with the
//! peer's encoded address (prefixed by an address count of one) and, for
//! trust-line records, the local channel id in front of it. Payment records
//! grow by a fixed amount of zero padding.

use ledger_migrator_types::{HistoryRecord, HistoryRecordType};
use std::collections::HashMap;

use crate::codec::{decode_identity_slice, NodeAddress, IDENTITY_SIZE};
use crate::error::{MigrationError, Result};
use crate::graph::ChannelGraph;
use crate::state::RunState;

pub const OPERATION_TYPE_SIZE: usize = 1;
pub const CHANNEL_ID_SIZE: usize = 4;
const ADDRESSES_COUNT: u8 = 1;
const PAYMENT_PADDING: usize = 5;
const PAYMENT_ADDITIONAL_PADDING: usize = 4;

/// Zero bytes appended to a rewritten record of the given type.
pub fn padding_for(record_type: HistoryRecordType) -> usize {
    match record_type {
        HistoryRecordType::Payment => PAYMENT_PADDING,
        HistoryRecordType::PaymentAdditional => PAYMENT_ADDITIONAL_PADDING,
        _ => 0,
    }
}

/// Where a peer lives from the point of view of the node being rewritten.
#[derive(Debug, Clone)]
pub struct PeerRoute {
    pub local_id: u32,
    pub address: NodeAddress,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HistoryStats {
    pub added: usize,
    pub skipped: usize,
    pub malformed: usize,
}

/// Identity of the peer embedded in a record body.
pub fn embedded_peer(body: &[u8]) -> Result<String> {
    let end = OPERATION_TYPE_SIZE + IDENTITY_SIZE;
    let raw = body.get(OPERATION_TYPE_SIZE..end).ok_or_else(|| {
        MigrationError::MalformedRecord(format!("body of {} bytes has no peer identity", body.len()))
    })?;
    decode_identity_slice(raw)
}

/// Rewrites one record. `Ok(None)` means the peer is outside the migrated set.
pub fn rewrite_record(
    record: &HistoryRecord,
    resolve: impl Fn(&str) -> Option<PeerRoute>,
) -> Result<Option<HistoryRecord>> {
    let peer = embedded_peer(&record.record_body)?;
    let route = match resolve(&peer) {
        Some(route) => route,
        None => return Ok(None),
    };

    let record_type = HistoryRecordType::from_code(record.record_type);
    let body = &record.record_body;
    let address = route.address.encode()?;
    let mut out = Vec::with_capacity(body.len() + address.len() + 16);
    out.extend_from_slice(&body[..OPERATION_TYPE_SIZE]);
    if record_type == HistoryRecordType::TrustLine {
        out.extend_from_slice(&route.local_id.to_le_bytes());
    }
    out.push(ADDRESSES_COUNT);
    out.extend_from_slice(&address);
    out.extend_from_slice(&body[OPERATION_TYPE_SIZE + IDENTITY_SIZE..]);
    out.resize(out.len() + padding_for(record_type), 0);

    Ok(Some(HistoryRecord {
        record_body_bytes_count: out.len() as i64,
        record_body: out,
        ..record.clone()
    }))
}

/// Rewrites a node's whole history against its channel routes.
pub fn rewrite_history(
    node: &str,
    records: &[HistoryRecord],
    routes: &HashMap<String, PeerRoute>,
) -> (Vec<HistoryRecord>, HistoryStats) {
    let mut stats = HistoryStats::default();
    let mut rewritten = Vec::with_capacity(records.len());
    for record in records {
        match rewrite_record(record, |peer| routes.get(peer).cloned()) {
            Ok(Some(new_record)) => {
                stats.added += 1;
                rewritten.push(new_record);
            }
            Ok(None) => stats.skipped += 1,
            Err(e) => {
                log::warn!("Node {}: skipping history record: {}", node, e);
                stats.malformed += 1;
            }
        }
    }
    (rewritten, stats)
}

impl ChannelGraph {
    /// Routes from `node` to every peer it has a channel with.
    pub fn routes_for(&self, node: &str) -> HashMap<String, PeerRoute> {
        let mut routes = HashMap::new();
        if let Some(this) = self.node(node) {
            for (peer, &local_id) in &this.channels {
                if let Some(peer_node) = self.node(peer) {
                    routes.insert(
                        peer.clone(),
                        PeerRoute {
                            local_id,
                            address: peer_node.new_address.clone(),
                        },
                    );
                }
            }
        }
        routes
    }

    /// Rewrites and persists the history of every healthy node.
    pub fn migrate_history(&mut self, state: &mut RunState) -> HistoryStats {
        let mut total = HistoryStats::default();
        for idx in 0..self.nodes.len() {
            if self.nodes[idx].failed {
                continue;
            }
            let name = self.nodes[idx].name.clone();
            let routes = self.routes_for(&name);
            let node = &mut self.nodes[idx];
            let (records, stats) = rewrite_history(&name, &node.old_history, &routes);
            if let Err(e) = node.store.insert_history(&records) {
                log::error!("Failed to write history of node {}: {}", name, e);
                state.record(&name, &e);
                continue;
            }
            log::info!(
                "Generating history for node: {} added: {} skipped: {}",
                name,
                stats.added,
                stats.skipped
            );
            if stats.malformed > 0 {
                state.append_error(
                    &format!("{} malformed history records", stats.malformed),
                    &name,
                    None,
                );
            }
            total.added += stats.added;
            total.skipped += stats.skipped;
            total.malformed += stats.malformed;
        }
        total
    }
}
