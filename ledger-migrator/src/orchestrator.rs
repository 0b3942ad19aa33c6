//! One migration pass over the old infrastructure tree.
//!
//! Node generation happens node by node; everything after it runs as whole
//! passes over the channel graph so that both sides of a channel exist before
//! any key material is exchanged.

use std::path::Path;

use crate::check::precheck;
use crate::codec::NodeAddress;
use crate::config::{increment_address, EquivalentMap, GnsTable, MigrationConfig, NewNodeConf, OldNodeConf};
use crate::db::NodeStore;
use crate::driver::ProcessDriver;
use crate::error::Result;
use crate::graph::{ChannelGraph, Node};
use crate::inventory::{discover, NodeEntry};
use crate::state::{save_json, RunState};

pub const MIGRATION_ERRORS: &str = "migration_error.json";

/// Writes the new `conf.json` and schema and loads the node's old data.
fn generate_node(
    entry: &NodeEntry,
    conf: &OldNodeConf,
    address: NodeAddress,
    config: &MigrationConfig,
    equivalents: &EquivalentMap,
) -> Result<Node> {
    NewNodeConf::build(&address, conf.port, &config.gns_address_separator, &config.observers).write(&entry.new_path)?;
    let mut node = Node::new(
        &entry.name,
        entry.old_path.clone(),
        entry.new_path.clone(),
        address,
        config.keep_open,
    );
    node.store.create_new_schema()?;
    node.old_trust_lines = node.store.read_old_trust_lines(equivalents)?;
    node.old_history = node.store.read_old_history(equivalents)?;
    log::info!(
        "\tread {} trust lines and {} history records",
        node.old_trust_lines.len(),
        node.old_history.len()
    );
    Ok(node)
}

fn discard_new_node(path: &Path) {
    if let Err(e) = std::fs::remove_dir_all(path) {
        log::warn!("Cannot remove partially generated node {}: {}", path.display(), e);
    }
}

/// Migrates every node of the old tree that has no counterpart in the new one.
pub async fn migrate(config: &MigrationConfig, driver: &dyn ProcessDriver) -> Result<RunState> {
    let equivalents = EquivalentMap::load(&config.equivalents_table_path)?;
    let gns = match &config.base_address {
        Some(_) => GnsTable::default(),
        None => GnsTable::load(&config.gns_table_path)?,
    };
    let mut state = RunState::new();
    let entries = discover(
        &config.old_infrastructure_path,
        &config.new_infrastructure_path,
        &gns,
        &mut state,
    )?;
    state.summary.total = entries.len();

    let mut next_address = config.base_address.clone();
    let mut nodes = Vec::new();
    for (idx, entry) in entries.iter().enumerate() {
        if entry.is_migrated() {
            log::info!("Node #{}: {} is already migrated, skipping", idx + 1, entry.name);
            state.summary.skipped += 1;
            continue;
        }
        let conf = match &entry.conf {
            Some(conf) => conf,
            None => {
                state.summary.failed += 1;
                continue;
            }
        };
        let address = match next_address.as_mut() {
            Some(base) => {
                let address = NodeAddress::parse(base);
                *base = increment_address(base);
                address
            }
            None => match &entry.new_address {
                Some(address) => Ok(address.clone()),
                None => {
                    state.summary.failed += 1;
                    continue;
                }
            },
        };
        let address = match address {
            Ok(address) => address,
            Err(e) => {
                log::error!("Failed to process node #{}: {}: {}", idx + 1, entry.name, e);
                state.record(&entry.name, &e);
                state.summary.failed += 1;
                continue;
            }
        };

        let mut store = NodeStore::new(&entry.name, &entry.old_path, None, false);
        if let Err(e) = precheck(&mut store) {
            log::error!("{}", e);
            state.record(&entry.name, &e);
            state.summary.failed += 1;
            continue;
        }

        log::info!("Generating node #{}: {} at {}", idx + 1, entry.name, address);
        match generate_node(entry, conf, address, config, &equivalents) {
            Ok(node) => nodes.push(node),
            Err(e) => {
                log::error!("Failed to process node #{}: {}: {}", idx + 1, entry.name, e);
                state.record(&entry.name, &e);
                state.summary.failed += 1;
                discard_new_node(&entry.new_path);
            }
        }
    }

    let mut graph = ChannelGraph::new(nodes);
    graph.construct_channels(&mut state);
    graph.generate_channels(&mut state);
    graph.generate_trust_lines(&mut state);
    graph.retrieve_own_keys(driver, &mut state).await;
    graph.generate_contractor_keys(&mut state);
    graph.hash_audits(driver, &mut state).await;
    graph.generate_audit_crypto(&mut state);
    let history = graph.migrate_history(&mut state);
    let migrated_channels = graph.finish();

    for node in graph.nodes.iter_mut() {
        if let Err(e) = node.store.close() {
            log::warn!("Cannot close store of node {}: {}", node.name, e);
        }
        if node.failed {
            state.summary.failed += 1;
        } else {
            state.summary.succeeded += 1;
        }
    }

    log::info!(
        "Migrated {} channels; history records added: {} skipped: {}",
        migrated_channels,
        history.added,
        history.skipped
    );
    log::info!(
        "Nodes: succeeded={} failed={} skipped={} total={}",
        state.summary.succeeded,
        state.summary.failed,
        state.summary.skipped,
        state.summary.total
    );
    if state.has_errors() {
        log::error!("THERE ARE ERRORS!!");
        save_json(&state.errors, &config.new_infrastructure_path.join(MIGRATION_ERRORS))?;
    }
    Ok(state)
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
