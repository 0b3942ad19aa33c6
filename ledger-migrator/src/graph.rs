//! Channel graph: pairs mutually trusting nodes and re-keys every relationship
//! from global identities to per-node local channel ids.

use ledger_migrator_types::{AuditRecord, ContractorRow, HistoryRecord, NewTrustLine, OldTrustLine};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use crate::codec::NodeAddress;
use crate::crypto::ChannelKeypair;
use crate::db::NodeStore;
use crate::error::MigrationError;
use crate::state::RunState;

/// What the channel builder needs to know about a node.
pub trait GraphParticipant {
    fn name(&self) -> &str;
    fn old_trust_lines(&self) -> &[OldTrustLine];
}

pub struct Node {
    pub name: String,
    pub old_path: PathBuf,
    pub new_path: PathBuf,
    pub new_address: NodeAddress,
    pub old_trust_lines: Vec<OldTrustLine>,
    pub old_history: Vec<HistoryRecord>,
    /// Next local channel id to hand out.
    pub channel_idx: u32,
    /// Peer name -> local channel id (`contractors.id` on this node).
    pub channels: BTreeMap<String, u32>,
    pub trust_lines: Vec<NewTrustLine>,
    /// Audit rows read back after the executable signed them, by trust line id.
    pub audits: HashMap<i64, AuditRecord>,
    pub failed: bool,
    pub store: NodeStore,
}

impl Node {
    pub fn new(name: &str, old_path: PathBuf, new_path: PathBuf, new_address: NodeAddress, keep_open: bool) -> Self {
        let store = NodeStore::new(name, &old_path, Some(&new_path), keep_open);
        Self {
            name: name.to_string(),
            old_path,
            new_path,
            new_address,
            old_trust_lines: Vec::new(),
            old_history: Vec::new(),
            channel_idx: 0,
            channels: BTreeMap::new(),
            trust_lines: Vec::new(),
            audits: HashMap::new(),
            failed: false,
            store,
        }
    }

    /// New trust lines this node holds toward the channel with `peer`.
    pub fn trust_lines_toward(&self, peer: &str) -> Vec<&NewTrustLine> {
        match self.channels.get(peer) {
            Some(local_id) => self
                .trust_lines
                .iter()
                .filter(|line| line.contractor_id == *local_id)
                .collect(),
            None => Vec::new(),
        }
    }
}

impl GraphParticipant for Node {
    fn name(&self) -> &str {
        &self.name
    }

    fn old_trust_lines(&self) -> &[OldTrustLine] {
        &self.old_trust_lines
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChannelState {
    New,
    ChannelsGenerated,
    TrustLinesGenerated,
    OwnKeysRetrieved,
    ContractorKeysGenerated,
    AuditCryptoGenerated,
    Migrated,
}

/// One bidirectional relationship. `node1` is the lexicographically smaller name.
#[derive(Debug, Clone)]
pub struct Channel {
    pub node1: String,
    pub node2: String,
    pub state: ChannelState,
    /// Set when a step failed; later steps leave the channel alone.
    pub failure: Option<String>,
    /// Matched (node1 trust line id, node2 trust line id) pairs, one per equivalent.
    pub line_pairs: Vec<(i64, i64)>,
}

impl Channel {
    fn new(a: &str, b: &str) -> Self {
        let (node1, node2) = pair_key(a, b);
        Self {
            node1,
            node2,
            state: ChannelState::New,
            failure: None,
            line_pairs: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.failure.is_none()
    }

    /// Moves to `next` if the channel is healthy and exactly one step behind.
    pub fn advance(&mut self, from: ChannelState, next: ChannelState) -> bool {
        if self.is_active() && self.state == from {
            self.state = next;
            true
        } else {
            false
        }
    }
}

pub fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Unique unordered pairs of participants that share at least one trust line,
/// in sorted order. Lines toward unknown peers or toward the node itself are
/// reported and skipped.
pub fn construct_channels<P: GraphParticipant>(participants: &[P], state: &mut RunState) -> BTreeMap<(String, String), Channel> {
    let known: HashSet<&str> = participants.iter().map(|p| p.name()).collect();
    let mut channels = BTreeMap::new();
    for participant in participants {
        for line in participant.old_trust_lines() {
            let peer = line.contractor_id.as_str();
            if peer == participant.name() {
                log::warn!("Node {} has a trust line to itself, skipping", participant.name());
                state.append_error("Trust line to itself", participant.name(), Some(peer));
                continue;
            }
            if !known.contains(peer) {
                let err = MigrationError::PeerNotFound {
                    node: participant.name().to_string(),
                    peer: peer.to_string(),
                };
                log::warn!("{}", err);
                state.record(participant.name(), &err);
                continue;
            }
            channels
                .entry(pair_key(participant.name(), peer))
                .or_insert_with(|| Channel::new(participant.name(), peer));
        }
    }
    channels
}

pub struct ChannelGraph {
    pub nodes: Vec<Node>,
    index: HashMap<String, usize>,
    pub channels: BTreeMap<(String, String), Channel>,
}

impl ChannelGraph {
    pub fn new(nodes: Vec<Node>) -> Self {
        let index = nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| (node.name.clone(), idx))
            .collect();
        Self {
            nodes,
            index,
            channels: BTreeMap::new(),
        }
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|&idx| &self.nodes[idx])
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut Node> {
        match self.index.get(name) {
            Some(&idx) => Some(&mut self.nodes[idx]),
            None => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn construct_channels(&mut self, state: &mut RunState) {
        self.channels = construct_channels(&self.nodes, state);
        log::info!(
            "Constructed {} channels between {} nodes",
            self.channels.len(),
            self.nodes.len()
        );
    }

    pub(crate) fn fail_channel(&mut self, key: &(String, String), node: &str, err: &MigrationError, state: &mut RunState) {
        log::error!("Channel {} <-> {} failed: {}", key.0, key.1, err);
        state.record(node, err);
        if let Some(channel) = self.channels.get_mut(key) {
            channel.failure = Some(err.to_string());
        }
    }

    /// Persists both sides of every channel. Each side's `id_on_contractor_side`
    /// is the other side's channel counter at creation time.
    pub fn generate_channels(&mut self, state: &mut RunState) {
        let keys: Vec<_> = self.channels.keys().cloned().collect();
        for key in keys {
            let (name1, name2) = (&key.0, &key.1);
            let (idx1, idx2) = match (self.index.get(name1), self.index.get(name2)) {
                (Some(&a), Some(&b)) => (a, b),
                _ => continue,
            };
            log::info!("Generating channel between nodes: {}, {}", name1, name2);

            let keys1 = ChannelKeypair::generate();
            let keys2 = ChannelKeypair::generate();
            let id1 = self.nodes[idx1].channel_idx;
            let id2 = self.nodes[idx2].channel_idx;
            let address1 = self.nodes[idx1].new_address.clone();
            let address2 = self.nodes[idx2].new_address.clone();

            let row1 = ContractorRow {
                id: id1,
                id_on_contractor_side: id2,
                crypto_key: keys1.crypto_key(&keys2.public),
                is_confirmed: true,
            };
            let row2 = ContractorRow {
                id: id2,
                id_on_contractor_side: id1,
                crypto_key: keys2.crypto_key(&keys1.public),
                is_confirmed: true,
            };

            let result = match self.nodes[idx1].store.insert_channel(&row1, &address2) {
                Err(e) => Err((name1.clone(), e)),
                Ok(()) => match self.nodes[idx2].store.insert_channel(&row2, &address1) {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        // The first side is already committed.
                        if let Err(undo) = self.nodes[idx1].store.delete_channel(id1) {
                            log::error!("Cannot remove channel {} from node {}: {}", id1, name1, undo);
                        }
                        Err((name2.clone(), e))
                    }
                },
            };
            // Counters advance even on failure so later ids stay unique per node.
            self.nodes[idx1].channel_idx += 1;
            self.nodes[idx2].channel_idx += 1;

            match result {
                Ok(()) => {
                    self.nodes[idx1].channels.insert(name2.clone(), id1);
                    self.nodes[idx2].channels.insert(name1.clone(), id2);
                    if let Some(channel) = self.channels.get_mut(&key) {
                        channel.advance(ChannelState::New, ChannelState::ChannelsGenerated);
                    }
                }
                Err((node, e)) => self.fail_channel(&key, &node, &e, state),
            }
        }
    }

    /// Persists one trust line (plus seed audit) per old line on both sides of every channel.
    pub fn generate_trust_lines(&mut self, state: &mut RunState) {
        let keys: Vec<_> = self.channels.keys().cloned().collect();
        for key in keys {
            let ready = self
                .channels
                .get(&key)
                .map(|c| c.is_active() && c.state == ChannelState::ChannelsGenerated)
                .unwrap_or(false);
            if !ready {
                continue;
            }
            let mut outcome = Ok(());
            for (this, peer) in [(&key.0, &key.1), (&key.1, &key.0)] {
                if let Err(e) = self.add_trust_lines(this, peer) {
                    outcome = Err((this.clone(), e));
                    break;
                }
            }
            match outcome {
                Ok(()) => {
                    self.pair_trust_lines(&key);
                    if let Some(channel) = self.channels.get_mut(&key) {
                        channel.advance(ChannelState::ChannelsGenerated, ChannelState::TrustLinesGenerated);
                    }
                }
                Err((node, e)) => self.fail_channel(&key, &node, &e, state),
            }
        }
    }

    fn add_trust_lines(&mut self, this: &str, peer: &str) -> crate::error::Result<()> {
        let node = match self.node_mut(this) {
            Some(node) => node,
            None => return Ok(()),
        };
        let local_id = match node.channels.get(peer) {
            Some(&id) => id,
            None => return Ok(()),
        };
        let matching: Vec<&OldTrustLine> = node
            .old_trust_lines
            .iter()
            .filter(|line| line.contractor_id == peer)
            .collect();
        for line in &matching {
            log::info!(
                "\tGenerating trust line for node: {} id: {} eq: {} gw: {}",
                this,
                local_id,
                line.equivalent,
                line.is_contractor_gateway
            );
        }
        let inserted = node.store.insert_trust_lines(local_id, &matching)?;
        node.trust_lines.extend(inserted);
        Ok(())
    }

    /// Pairs the two sides' trust lines of a channel by equivalent.
    fn pair_trust_lines(&mut self, key: &(String, String)) {
        let (node1, node2) = match (self.node(&key.0), self.node(&key.1)) {
            (Some(a), Some(b)) => (a, b),
            _ => return,
        };
        let lines2 = node2.trust_lines_toward(&key.0);
        let pairs: Vec<(i64, i64)> = node1
            .trust_lines_toward(&key.1)
            .into_iter()
            .filter_map(|l1| {
                lines2
                    .iter()
                    .find(|l2| l2.equivalent == l1.equivalent)
                    .map(|l2| (l1.id, l2.id))
            })
            .collect();
        if let Some(channel) = self.channels.get_mut(key) {
            channel.line_pairs = pairs;
        }
    }

    /// Marks every channel touching `node` as failed.
    pub fn fail_node(&mut self, node: &str, err: &MigrationError, state: &mut RunState) {
        log::error!("Failed to process node {}: {}", node, err);
        state.record(node, err);
        if let Some(n) = self.node_mut(node) {
            n.failed = true;
        }
        for channel in self.channels.values_mut() {
            if channel.node1 == node || channel.node2 == node {
                channel.failure.get_or_insert_with(|| err.to_string());
            }
        }
    }

    /// Advances every healthy channel whose nodes both completed a node-level step.
    pub fn advance_all(&mut self, from: ChannelState, next: ChannelState) {
        for channel in self.channels.values_mut() {
            channel.advance(from, next);
        }
    }

    pub fn active_channel_count(&self) -> usize {
        self.channels.values().filter(|c| c.is_active()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_amount, encode_identity, AmountSign};
    use tempfile::tempdir;

    const A: &str = "00000000-0000-0000-0000-00000000000a";
    const B: &str = "00000000-0000-0000-0000-00000000000b";
    const C: &str = "00000000-0000-0000-0000-00000000000c";

    fn line_to(peer: &str, equivalent: u32) -> OldTrustLine {
        OldTrustLine {
            contractor: encode_identity(peer).unwrap().to_vec(),
            contractor_id: peer.to_string(),
            incoming_amount: encode_amount(AmountSign::Unsigned, 0),
            outgoing_amount: encode_amount(AmountSign::Unsigned, 100),
            balance: encode_amount(AmountSign::NonNegative, 0),
            is_contractor_gateway: false,
            equivalent,
        }
    }

    fn node(root: &std::path::Path, name: &str, port: u16, peers: &[&str]) -> Node {
        let mut node = Node::new(
            name,
            root.join("old").join(name),
            root.join("new").join(name),
            NodeAddress::parse(&format!("127.0.0.1:{}", port)).unwrap(),
            false,
        );
        node.old_trust_lines = peers.iter().map(|p| line_to(p, 1)).collect();
        node.store.create_new_schema().unwrap();
        node
    }

    #[test]
    fn test_fully_connected_channel_ids_are_mutual_inverses() {
        let dir = tempdir().unwrap();
        let mut state = RunState::new();
        let mut graph = ChannelGraph::new(vec![
            node(dir.path(), A, 2033, &[B, C]),
            node(dir.path(), B, 2034, &[A, C]),
            node(dir.path(), C, 2035, &[A, B]),
        ]);
        graph.construct_channels(&mut state);
        assert_eq!(graph.channels.len(), 3);

        graph.generate_channels(&mut state);
        assert!(!state.has_errors());

        fn id(graph: &ChannelGraph, this: &str, peer: &str) -> u32 {
            graph.node(this).unwrap().channels[peer]
        }
        assert_eq!(id(&graph, A, B), 0);
        assert_eq!(id(&graph, B, A), 0);
        assert_eq!(id(&graph, A, C), 1);
        assert_eq!(id(&graph, C, A), 0);
        assert_eq!(id(&graph, B, C), 1);
        assert_eq!(id(&graph, C, B), 1);

        // id_on_contractor_side stored on each node is the peer's local id for it.
        for this in [A, B, C] {
            let contractors = graph.node_mut(this).unwrap().store.list_contractors().unwrap();
            assert_eq!(contractors.len(), 2);
            for row in contractors {
                let peer = graph
                    .node(this)
                    .unwrap()
                    .channels
                    .iter()
                    .find(|(_, &local)| local == row.id)
                    .map(|(peer, _)| peer.clone())
                    .unwrap();
                assert_eq!(row.id_on_contractor_side, id(&graph, &peer, this));
            }
        }
    }

    #[test]
    fn test_failed_second_side_leaves_no_channel_row() {
        let dir = tempdir().unwrap();
        let mut state = RunState::new();
        let mut graph = ChannelGraph::new(vec![
            node(dir.path(), A, 2033, &[B]),
            node(dir.path(), B, 2034, &[A]),
        ]);
        let taken = ContractorRow {
            id: 0,
            id_on_contractor_side: 9,
            crypto_key: vec![0u8; 96],
            is_confirmed: true,
        };
        graph
            .node_mut(B)
            .unwrap()
            .store
            .insert_channel(&taken, &NodeAddress::parse("127.0.0.1:2099").unwrap())
            .unwrap();

        graph.construct_channels(&mut state);
        graph.generate_channels(&mut state);

        let channel = graph.channels.values().next().unwrap();
        assert!(!channel.is_active());
        assert_eq!(state.errors["1"].node, B);
        assert!(graph.node(A).unwrap().channels.is_empty());
        let a = graph.node_mut(A).unwrap();
        assert!(a.store.list_contractors().unwrap().is_empty());
        assert!(a.store.list_contractor_addresses().unwrap().is_empty());
    }

    #[test]
    fn test_channel_discovered_twice_is_created_once() {
        let dir = tempdir().unwrap();
        let mut state = RunState::new();
        let nodes = vec![node(dir.path(), A, 2033, &[B]), node(dir.path(), B, 2034, &[A])];
        let channels = construct_channels(&nodes, &mut state);
        assert_eq!(channels.len(), 1);
        let channel = channels.values().next().unwrap();
        assert_eq!((channel.node1.as_str(), channel.node2.as_str()), (A, B));
        assert_eq!(channel.state, ChannelState::New);
    }

    #[test]
    fn test_unknown_peer_and_self_line_are_recorded() {
        let dir = tempdir().unwrap();
        let mut state = RunState::new();
        let nodes = vec![node(dir.path(), A, 2033, &[C, A])];
        let channels = construct_channels(&nodes, &mut state);
        assert!(channels.is_empty());
        assert_eq!(state.errors.len(), 2);
        assert_eq!(state.errors["1"].contractor.as_deref(), Some(C));
    }

    #[test]
    fn test_trust_lines_use_local_channel_ids() {
        let dir = tempdir().unwrap();
        let mut state = RunState::new();
        let mut graph = ChannelGraph::new(vec![
            node(dir.path(), A, 2033, &[B, C]),
            node(dir.path(), B, 2034, &[A]),
            node(dir.path(), C, 2035, &[A]),
        ]);
        graph.construct_channels(&mut state);
        graph.generate_channels(&mut state);
        graph.generate_trust_lines(&mut state);

        assert!(graph
            .channels
            .values()
            .all(|c| c.state == ChannelState::TrustLinesGenerated && c.line_pairs.len() == 1));
        let a = graph.node(A).unwrap();
        assert_eq!(a.trust_lines.len(), 2);
        assert_eq!(a.trust_lines_toward(C)[0].contractor_id, a.channels[C]);

        let stored = graph.node_mut(C).unwrap().store.list_trust_lines().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].contractor_id, 0);
    }
}
