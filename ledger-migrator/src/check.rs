//! Pre-migration checks over the old infrastructure.

use ledger_migrator_types::{OldTrustLine, TrustLineStat};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::codec::decode_amount;
use crate::config::{EquivalentMap, GnsTable, MigrationConfig};
use crate::db::NodeStore;
use crate::error::{MigrationError, Result};
use crate::inventory::discover;
use crate::state::{save_json, RunState};

pub const NO_TRUST_LINES: &str = "checking_tr_0.json";
pub const GATEWAY_WITH_BALANCE: &str = "checking_tr_gw_bal.json";
pub const GATEWAY_WITHOUT_BALANCE: &str = "checking_tr_gw_non_bal.json";
pub const NO_GNS_ADDRESS: &str = "checking_no_gns_address.json";

/// Node names written as `{"<name>": null}`.
pub type NodeBucket = BTreeMap<String, Option<String>>;

#[derive(Debug, Default)]
pub struct CheckReport {
    pub no_trust_lines: NodeBucket,
    pub gateway_with_balance: NodeBucket,
    pub gateway_without_balance: NodeBucket,
    pub no_gns_address: NodeBucket,
    pub stats: BTreeMap<u32, TrustLineStat>,
    pub state: RunState,
    pub checked: usize,
}

impl CheckReport {
    fn save(&self, out_dir: &Path) -> Result<()> {
        save_json(&self.no_trust_lines, &out_dir.join(NO_TRUST_LINES))?;
        save_json(&self.gateway_with_balance, &out_dir.join(GATEWAY_WITH_BALANCE))?;
        save_json(&self.gateway_without_balance, &out_dir.join(GATEWAY_WITHOUT_BALANCE))?;
        save_json(&self.no_gns_address, &out_dir.join(NO_GNS_ADDRESS))
    }
}

/// Fails when the old node still has transactions or queued messages.
pub fn precheck(store: &mut NodeStore) -> Result<()> {
    let pending = store.read_pending_work()?;
    if pending.is_empty() {
        return Ok(());
    }
    for transaction in &pending.transactions {
        log::debug!("Node {} has pending transaction {}", store.node(), transaction);
    }
    for message in &pending.messages {
        log::debug!(
            "Node {} has a queued message to {} for transaction {}",
            store.node(),
            message.contractor_uuid,
            message.transaction_uuid
        );
    }
    Err(MigrationError::PrecheckFailed {
        node: store.node().to_string(),
        transactions: pending.transactions.len(),
        messages: pending.messages.len(),
    })
}

fn same_amount(a: &[u8], b: &[u8]) -> Result<bool> {
    Ok(decode_amount(a)?.to_normalized() == decode_amount(b)?.to_normalized())
}

fn check_pair(node: &str, own: &OldTrustLine, peer: &OldTrustLine, state: &mut RunState) -> Result<()> {
    let contractor = own.contractor_id.as_str();
    if !same_amount(&own.outgoing_amount, &peer.incoming_amount)? || !same_amount(&own.incoming_amount, &peer.outgoing_amount)? {
        log::error!(
            "Trust line amounts of {} and {} in equivalent {} do not match",
            node,
            contractor,
            own.equivalent
        );
        state.append_error(
            &format!("Trust line amounts do not match in equivalent {}", own.equivalent),
            node,
            Some(contractor),
        );
    }
    if !decode_amount(&own.balance)?.mirrors(&decode_amount(&peer.balance)?) {
        log::error!(
            "Balances of {} and {} in equivalent {} do not mirror",
            node,
            contractor,
            own.equivalent
        );
        state.append_error(
            &format!("Balances do not mirror in equivalent {}", own.equivalent),
            node,
            Some(contractor),
        );
    }
    Ok(())
}

fn add_stat(stats: &mut BTreeMap<u32, TrustLineStat>, line: &OldTrustLine, zero_balance: bool) {
    let stat = stats.entry(line.equivalent).or_insert_with(|| TrustLineStat {
        equivalent: line.equivalent,
        ..Default::default()
    });
    stat.count_all += 1;
    if zero_balance {
        stat.count_0_bal += 1;
    } else {
        stat.count_non_0_bal += 1;
    }
}

/// Checks every old node and writes the classification buckets into `out_dir`.
pub fn check(config: &MigrationConfig, out_dir: &Path) -> Result<CheckReport> {
    let equivalents = EquivalentMap::load(&config.equivalents_table_path)?;
    let gns = GnsTable::load(&config.gns_table_path)?;
    let mut report = CheckReport::default();
    let entries = discover(
        &config.old_infrastructure_path,
        &config.new_infrastructure_path,
        &gns,
        &mut report.state,
    )?;

    let mut lines: HashMap<String, Vec<OldTrustLine>> = HashMap::new();
    for (idx, entry) in entries.iter().enumerate() {
        if entry.no_gns_address {
            report.no_gns_address.insert(entry.name.clone(), None);
        }
        if entry.conf.is_none() {
            continue;
        }
        log::info!("Reading node #{}: {}", idx + 1, entry.name);
        let mut store = NodeStore::new(&entry.name, &entry.old_path, None, config.keep_open);
        if let Err(e) = precheck(&mut store) {
            log::error!("{}", e);
            report.state.record(&entry.name, &e);
        }
        match store.read_old_trust_lines(&equivalents) {
            Ok(node_lines) => {
                lines.insert(entry.name.clone(), node_lines);
            }
            Err(e) => {
                log::error!("Failed to read trust lines of node {}: {}", entry.name, e);
                report.state.record(&entry.name, &e);
            }
        }
        if let Err(e) = store.close() {
            log::warn!("Cannot close store of node {}: {}", entry.name, e);
        }
    }

    for entry in &entries {
        let own_lines = match lines.get(&entry.name) {
            Some(own_lines) => own_lines,
            None => continue,
        };
        report.checked += 1;
        if own_lines.is_empty() {
            report.no_trust_lines.insert(entry.name.clone(), None);
            continue;
        }

        let mut gateway_only = true;
        let mut non_null_balance = true;
        for line in own_lines {
            let zero_balance = decode_amount(&line.balance).map(|b| b.is_zero()).unwrap_or(false);
            add_stat(&mut report.stats, line, zero_balance);
            if zero_balance {
                non_null_balance = false;
            }

            let peer_lines = match lines.get(&line.contractor_id) {
                Some(peer_lines) => peer_lines,
                None => {
                    let err = MigrationError::PeerNotFound {
                        node: entry.name.clone(),
                        peer: line.contractor_id.clone(),
                    };
                    log::error!("{}", err);
                    report.state.record(&entry.name, &err);
                    continue;
                }
            };
            let counterpart = peer_lines
                .iter()
                .find(|p| p.contractor_id == entry.name && p.equivalent == line.equivalent);
            match counterpart {
                Some(peer_line) => {
                    if !peer_line.is_contractor_gateway {
                        gateway_only = false;
                    }
                    if let Err(e) = check_pair(&entry.name, line, peer_line, &mut report.state) {
                        log::error!("Cannot compare trust lines of {}: {}", entry.name, e);
                        report.state.record(&entry.name, &e);
                    }
                }
                None => {
                    let err = MigrationError::UnpairedTrustLine {
                        node: entry.name.clone(),
                        peer: line.contractor_id.clone(),
                        equivalent: line.equivalent,
                    };
                    log::error!("{}", err);
                    report.state.record(&entry.name, &err);
                }
            }
        }

        if gateway_only {
            if non_null_balance {
                report.gateway_with_balance.insert(entry.name.clone(), None);
            } else {
                report.gateway_without_balance.insert(entry.name.clone(), None);
            }
        }
    }

    for stat in report.stats.values() {
        log::info!(
            "Equivalent {}: {} trust lines, {} with zero balance, {} with non-zero balance",
            stat.equivalent,
            stat.count_all,
            stat.count_0_bal,
            stat.count_non_0_bal
        );
    }
    log::info!(
        "Checked {} nodes: {} without trust lines, {} gateway-only with balance, {} gateway-only without balance, {} without gns address, {} issues",
        report.checked,
        report.no_trust_lines.len(),
        report.gateway_with_balance.len(),
        report.gateway_without_balance.len(),
        report.no_gns_address.len(),
        report.state.errors.len()
    );
    report.save(out_dir)?;
    if report.state.has_errors() {
        save_json(&report.state.errors, &out_dir.join("checking_errors.json"))?;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::AmountSign;
    use crate::test_support::OldNodeFixture;
    use tempfile::tempdir;

    const A: &str = "00000000-0000-0000-0000-00000000000a";
    const B: &str = "00000000-0000-0000-0000-00000000000b";
    const C: &str = "00000000-0000-0000-0000-00000000000c";
    const D: &str = "00000000-0000-0000-0000-00000000000d";
    const E: &str = "00000000-0000-0000-0000-00000000000e";
    const F: &str = "00000000-0000-0000-0000-00000000000f";
    const G: &str = "00000000-0000-0000-0000-000000000010";
    const STRANGER: &str = "00000000-0000-0000-0000-0000000000ff";

    #[test]
    fn test_check_classifies_nodes_and_reports_asymmetry() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("old");
        OldNodeFixture::new(&old, A)
            .trust_line(B, 1, 100, 40, AmountSign::NonNegative, 10)
            .trust_line(STRANGER, 1, 5, 0, AmountSign::NonNegative, 0)
            .write();
        OldNodeFixture::new(&old, B)
            .trust_line(A, 1, 40, 100, AmountSign::Negative, 10)
            .write();
        OldNodeFixture::new(&old, C)
            .trust_line(D, 1, 100, 0, AmountSign::NonNegative, 0)
            .write();
        OldNodeFixture::new(&old, D)
            .trust_line(C, 1, 0, 50, AmountSign::NonNegative, 0)
            .write();
        OldNodeFixture::new(&old, E)
            .pending_transaction("00000000-0000-0000-0000-0000000000aa")
            .write();
        OldNodeFixture::new(&old, F)
            .trust_line(G, 2, 0, 0, AmountSign::NonNegative, 5)
            .write();
        OldNodeFixture::new(&old, G)
            .gateway_line(F, 2, AmountSign::Negative, 5)
            .write();

        let config = MigrationConfig::for_roots(&old, &dir.path().join("new"));
        let out = dir.path().join("out");
        let report = check(&config, &out).unwrap();

        assert_eq!(report.checked, 7);
        assert_eq!(report.no_trust_lines.keys().collect::<Vec<_>>(), vec![E]);
        assert_eq!(report.gateway_with_balance.keys().collect::<Vec<_>>(), vec![F]);
        assert!(report.gateway_without_balance.is_empty());

        let errors: Vec<_> = report.state.errors.values().collect();
        let mismatched: Vec<_> = errors
            .iter()
            .filter(|e| e.error.starts_with("Trust line amounts do not match"))
            .map(|e| e.node.as_str())
            .collect();
        assert_eq!(mismatched, vec![C, D]);
        assert!(errors.iter().any(|e| e.node == A && e.contractor.as_deref() == Some(STRANGER)));
        assert!(errors.iter().any(|e| e.node == E && e.error.contains("1 transactions")));
        assert!(!errors.iter().any(|e| e.error.starts_with("Balances do not mirror")));

        let stat = &report.stats[&1];
        assert_eq!(stat.count_all, 5);
        assert_eq!(stat.count_non_0_bal, 2);
        assert_eq!(report.stats[&2].count_all, 2);

        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(out.join(NO_TRUST_LINES)).unwrap()).unwrap();
        assert_eq!(saved, serde_json::json!({ E: null }));
        assert!(out.join(NO_GNS_ADDRESS).exists());
    }

    #[test]
    fn test_node_with_only_unknown_peers_counts_as_gateway_only() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("old");
        OldNodeFixture::new(&old, A)
            .trust_line(STRANGER, 1, 5, 0, AmountSign::NonNegative, 2)
            .write();
        OldNodeFixture::new(&old, B)
            .trust_line(STRANGER, 1, 5, 0, AmountSign::NonNegative, 0)
            .write();
        let config = MigrationConfig::for_roots(&old, &dir.path().join("new"));
        let report = check(&config, &dir.path().join("out")).unwrap();

        assert_eq!(report.gateway_with_balance.keys().collect::<Vec<_>>(), vec![A]);
        assert_eq!(report.gateway_without_balance.keys().collect::<Vec<_>>(), vec![B]);
        let unknown_peers = report
            .state
            .errors
            .values()
            .filter(|e| e.contractor.as_deref() == Some(STRANGER))
            .count();
        assert_eq!(unknown_peers, 2);
    }

    #[test]
    fn test_same_sign_balances_do_not_mirror() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("old");
        OldNodeFixture::new(&old, A)
            .trust_line(B, 1, 10, 10, AmountSign::NonNegative, 3)
            .write();
        OldNodeFixture::new(&old, B)
            .trust_line(A, 1, 10, 10, AmountSign::NonNegative, 3)
            .write();
        let config = MigrationConfig::for_roots(&old, &dir.path().join("new"));
        let report = check(&config, &dir.path().join("out")).unwrap();
        let mirrored: Vec<_> = report
            .state
            .errors
            .values()
            .filter(|e| e.error.starts_with("Balances do not mirror"))
            .collect();
        assert_eq!(mirrored.len(), 2);
    }

    #[test]
    fn test_precheck_counts_pending_work() {
        let dir = tempdir().unwrap();
        let path = OldNodeFixture::new(dir.path(), A)
            .pending_transaction("00000000-0000-0000-0000-0000000000aa")
            .queued_message(B, "00000000-0000-0000-0000-0000000000bb")
            .write();
        let mut store = NodeStore::new(A, &path, None, false);
        match precheck(&mut store) {
            Err(MigrationError::PrecheckFailed {
                transactions, messages, ..
            }) => assert_eq!((transactions, messages), (1, 1)),
            other => panic!("unexpected {:?}", other),
        }

        let clean = OldNodeFixture::new(dir.path(), B).write();
        assert!(precheck(&mut NodeStore::new(B, &clean, None, false)).is_ok());
    }
}
