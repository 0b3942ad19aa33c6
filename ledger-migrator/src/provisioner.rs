//! Key provisioning across the two sides of every channel.
//!
//! The node executable generates own keys and signs audits; this module only
//! runs it against the new stores and then cross-registers what it produced.

use std::collections::HashMap;

use crate::driver::ProcessDriver;
use crate::error::{MigrationError, Result};
use crate::graph::{ChannelGraph, ChannelState};
use crate::state::RunState;

type Failure = (String, MigrationError);

impl ChannelGraph {
    /// Runs the executable once per healthy node so it writes its own keys.
    pub async fn retrieve_own_keys(&mut self, driver: &dyn ProcessDriver, state: &mut RunState) {
        for idx in 0..self.nodes.len() {
            if self.nodes[idx].failed {
                continue;
            }
            log::info!("Starting node [own_keys]: {}", self.nodes[idx].name);
            if let Err(e) = self.run_executable(idx, driver).await {
                let name = self.nodes[idx].name.clone();
                self.fail_node(&name, &e, state);
            }
        }
        self.advance_all(ChannelState::TrustLinesGenerated, ChannelState::OwnKeysRetrieved);
    }

    async fn run_executable(&mut self, idx: usize, driver: &dyn ProcessDriver) -> Result<()> {
        // The executable needs exclusive access to the store.
        self.nodes[idx].store.close()?;
        driver.run_and_wait(&self.nodes[idx].new_path).await
    }

    /// Registers each side's own keys as contractor keys on the other side.
    pub fn generate_contractor_keys(&mut self, state: &mut RunState) {
        let keys: Vec<_> = self.channels.keys().cloned().collect();
        for key in keys {
            let pairs = match self.channels.get(&key) {
                Some(c) if c.is_active() && c.state == ChannelState::OwnKeysRetrieved => c.line_pairs.clone(),
                _ => continue,
            };
            log::info!("Generating contractor keys for channel: {}, {}", key.0, key.1);
            match self.cross_register_keys(&key, &pairs) {
                Ok(registered) => {
                    log::debug!("\tregistered {} contractor key pairs", registered);
                    if let Some(channel) = self.channels.get_mut(&key) {
                        channel.advance(ChannelState::OwnKeysRetrieved, ChannelState::ContractorKeysGenerated);
                    }
                }
                Err((node, e)) => self.fail_channel(&key, &node, &e, state),
            }
        }
    }

    fn ensure_paired(&self, key: &(String, String), pairs: &[(i64, i64)]) -> std::result::Result<(), Failure> {
        for (this, peer, side) in [(&key.0, &key.1, 0), (&key.1, &key.0, 1)] {
            let node = match self.node(this) {
                Some(node) => node,
                None => continue,
            };
            for line in node.trust_lines_toward(peer) {
                let paired = pairs
                    .iter()
                    .any(|pair| if side == 0 { pair.0 == line.id } else { pair.1 == line.id });
                if !paired {
                    return Err((
                        this.clone(),
                        MigrationError::UnpairedTrustLine {
                            node: this.clone(),
                            peer: peer.clone(),
                            equivalent: line.equivalent,
                        },
                    ));
                }
            }
        }
        Ok(())
    }

    fn cross_register_keys(&mut self, key: &(String, String), pairs: &[(i64, i64)]) -> std::result::Result<usize, Failure> {
        self.ensure_paired(key, pairs)?;
        let (idx1, idx2) = self.indices(key).ok_or_else(|| {
            (
                key.0.clone(),
                MigrationError::PeerNotFound {
                    node: key.0.clone(),
                    peer: key.1.clone(),
                },
            )
        })?;
        let (name1, name2) = (key.0.clone(), key.1.clone());

        let mut registered = 0;
        for &(line1, line2) in pairs {
            let keys1 = self.nodes[idx1].store.list_own_keys(line1).map_err(|e| (name1.clone(), e))?;
            let keys2 = self.nodes[idx2].store.list_own_keys(line2).map_err(|e| (name2.clone(), e))?;
            for (name, line, keys) in [(&name1, line1, &keys1), (&name2, line2, &keys2)] {
                if keys.is_empty() {
                    return Err((
                        name.clone(),
                        MigrationError::protocol(format!("node {} has no own keys for trust line {}", name, line)),
                    ));
                }
            }

            for own1 in &keys1 {
                let own2 = match keys2.iter().find(|k| k.number == own1.number) {
                    Some(own2) => own2,
                    None => continue,
                };
                self.nodes[idx1]
                    .store
                    .insert_contractor_key(own1, own2)
                    .map_err(|e| (name1.clone(), e))?;
                self.nodes[idx2]
                    .store
                    .insert_contractor_key(own2, own1)
                    .map_err(|e| (name2.clone(), e))?;
                registered += 1;
            }
        }
        Ok(registered)
    }

    /// Runs the executable again so it signs the audits, then reads them back.
    pub async fn hash_audits(&mut self, driver: &dyn ProcessDriver, state: &mut RunState) {
        for idx in 0..self.nodes.len() {
            if self.nodes[idx].failed {
                continue;
            }
            log::info!("Starting node [audit]: {}", self.nodes[idx].name);
            let result = match self.run_executable(idx, driver).await {
                Ok(()) => self.nodes[idx].store.list_audits(),
                Err(e) => Err(e),
            };
            match result {
                Ok(audits) => {
                    let node = &mut self.nodes[idx];
                    node.audits = audits
                        .into_iter()
                        .filter(|a| node.trust_lines.iter().any(|l| l.id == a.trust_line_id))
                        .map(|a| (a.trust_line_id, a))
                        .collect::<HashMap<_, _>>();
                }
                Err(e) => {
                    let name = self.nodes[idx].name.clone();
                    self.fail_node(&name, &e, state);
                }
            }
        }
    }

    /// Copies each side's audit key hash and signature into the peer's audit.
    pub fn generate_audit_crypto(&mut self, state: &mut RunState) {
        let keys: Vec<_> = self.channels.keys().cloned().collect();
        for key in keys {
            let pairs = match self.channels.get(&key) {
                Some(c) if c.is_active() && c.state == ChannelState::ContractorKeysGenerated => c.line_pairs.clone(),
                _ => continue,
            };
            log::info!("Generating audit crypto for channel: {}, {}", key.0, key.1);
            match self.exchange_audit_crypto(&key, &pairs) {
                Ok(()) => {
                    if let Some(channel) = self.channels.get_mut(&key) {
                        channel.advance(ChannelState::ContractorKeysGenerated, ChannelState::AuditCryptoGenerated);
                    }
                }
                Err((node, e)) => self.fail_channel(&key, &node, &e, state),
            }
        }
    }

    fn exchange_audit_crypto(&mut self, key: &(String, String), pairs: &[(i64, i64)]) -> std::result::Result<(), Failure> {
        let (idx1, idx2) = match self.indices(key) {
            Some(indices) => indices,
            None => return Ok(()),
        };
        for &(line1, line2) in pairs {
            let audit1 = self.nodes[idx1].audits.get(&line1).cloned();
            let audit2 = self.nodes[idx2].audits.get(&line2).cloned();
            let (audit1, audit2) = match (audit1, audit2) {
                (Some(a), Some(b)) => (a, b),
                (None, _) => return Err(missing_audit(&key.0, line1)),
                (_, None) => return Err(missing_audit(&key.1, line2)),
            };
            self.nodes[idx1]
                .store
                .update_audit_crypto(line1, &audit2.our_key_hash, &audit2.our_signature)
                .map_err(|e| (key.0.clone(), e))?;
            self.nodes[idx2]
                .store
                .update_audit_crypto(line2, &audit1.our_key_hash, &audit1.our_signature)
                .map_err(|e| (key.1.clone(), e))?;
        }
        Ok(())
    }

    fn indices(&self, key: &(String, String)) -> Option<(usize, usize)> {
        let idx1 = self.nodes.iter().position(|n| n.name == key.0)?;
        let idx2 = self.nodes.iter().position(|n| n.name == key.1)?;
        Some((idx1, idx2))
    }

    /// Marks every channel that made it through all steps as migrated.
    pub fn finish(&mut self) -> usize {
        self.advance_all(ChannelState::AuditCryptoGenerated, ChannelState::Migrated);
        self.channels
            .values()
            .filter(|c| c.state == ChannelState::Migrated)
            .count()
    }
}

fn missing_audit(node: &str, trust_line_id: i64) -> Failure {
    (
        node.to_string(),
        MigrationError::protocol(format!("node {} has no audit for trust line {}", node, trust_line_id)),
    )
}
