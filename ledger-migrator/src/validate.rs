//! Post-migration validation against the running new executables.
//!
//! For every channel the outgoing amount is raised by one on both sides and
//! the executables must agree on the result with exactly one own and one
//! contractor key per side.

use std::collections::HashSet;
use std::time::Duration;

use crate::config::{GnsTable, MigrationConfig};
use crate::db::store::STORAGE_DB;
use crate::db::NodeStore;
use crate::driver::protocol::{address_of, parse_field, stride};
use crate::driver::{request, Command, CommandSession, ProcessDriver};
use crate::error::{MigrationError, Result};
use crate::inventory::{discover, NodeEntry, NodeIndex};
use crate::state::{save_json, RunState};

pub const VALIDATED_MARKER: &str = "validated.json";

const STATE_POLL_ATTEMPTS: usize = 10;
const STATE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const ACTIVE_STATE: u32 = 2;

#[derive(Debug, Default)]
pub struct ValidateReport {
    pub succeeded: usize,
    pub failed: usize,
    pub total: usize,
}

/// A trust line as listed by the new executable.
#[derive(Debug, Clone)]
struct ListedLine {
    contractor_id: u32,
    address: String,
    equivalent: u32,
    outgoing: u128,
}

/// The fields of `GET:contractors/trust-lines/one/id` that validation looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LineState {
    state: u32,
    own_keys: u32,
    contractor_keys: u32,
    outgoing: u128,
}

impl LineState {
    fn is_valid(&self, expected_outgoing: u128) -> bool {
        self.outgoing == expected_outgoing && self.state == ACTIVE_STATE && self.own_keys == 1 && self.contractor_keys == 1
    }
}

fn parse_amount(text: &str, what: &str) -> Result<u128> {
    let text = text.trim();
    text.parse::<u128>()
        .map_err(|_| MigrationError::protocol(format!("bad {} '{}'", what, text)))
}

async fn list_lines(session: &mut dyn CommandSession) -> Result<Vec<ListedLine>> {
    let reply = request(session, &Command::Equivalents).await?.ensure_ok()?;
    let equivalents: Vec<u32> = reply
        .records(1)?
        .iter()
        .map(|record| parse_field(record, 0, "equivalent"))
        .collect::<Result<_>>()?;

    let mut lines = Vec::new();
    for equivalent in equivalents {
        let reply = request(session, &Command::TrustLines { equivalent }).await?.ensure_ok()?;
        for record in reply.records(stride::NEW_TRUST_LINES)? {
            lines.push(ListedLine {
                contractor_id: parse_field(record, 0, "contractor id")?,
                address: address_of(&record[1]).to_string(),
                equivalent,
                outgoing: parse_amount(&record[6], "outgoing amount")?,
            });
        }
    }
    Ok(lines)
}

/// Sets a new outgoing amount and waits for the line to settle back into the
/// active state.
async fn change_trust_line(session: &mut dyn CommandSession, line: &ListedLine, amount: u128) -> Result<LineState> {
    let reply = request(
        session,
        &Command::SetTrustLine {
            contractor_id: line.contractor_id,
            amount,
            equivalent: line.equivalent,
        },
    )
    .await?;
    log::debug!("SET trust line {} -> {}: status {}", line.contractor_id, amount, reply.status);

    let mut last = None;
    for attempt in 0..STATE_POLL_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(STATE_POLL_INTERVAL).await;
        }
        let reply = request(
            session,
            &Command::TrustLine {
                contractor_id: line.contractor_id,
                equivalent: line.equivalent,
            },
        )
        .await?
        .ensure_ok()?;
        let fields = reply.single(7)?;
        let state = LineState {
            state: parse_field(fields, 1, "state")?,
            own_keys: parse_field(fields, 2, "own keys")?,
            contractor_keys: parse_field(fields, 3, "contractor keys")?,
            outgoing: parse_amount(&fields[5], "outgoing amount")?,
        };
        let settled = state.state == ACTIVE_STATE;
        last = Some(state);
        if settled {
            break;
        }
    }
    last.ok_or_else(|| MigrationError::protocol("trust line state never reported"))
}

async fn validate_with_peer(
    session: &mut dyn CommandSession,
    entry: &NodeEntry,
    own_address: &str,
    line: &ListedLine,
    peer: &NodeEntry,
    driver: &dyn ProcessDriver,
) -> Result<bool> {
    let mut peer_session = driver.start(&peer.new_path).await?;
    let result = async {
        let peer_lines = list_lines(peer_session.as_mut()).await?;
        let mut valid = true;
        for peer_line in peer_lines
            .iter()
            .filter(|l| l.equivalent == line.equivalent && l.address == own_address)
        {
            let own_target = line.outgoing + 1;
            let peer_target = peer_line.outgoing + 1;
            let own_state = change_trust_line(&mut *session, line, own_target).await?;
            let peer_state = change_trust_line(peer_session.as_mut(), peer_line, peer_target).await?;
            if !own_state.is_valid(own_target) || !peer_state.is_valid(peer_target) {
                log::error!(
                    "Trust line {} <-> {} in equivalent {} is invalid: {:?} / {:?}",
                    entry.name,
                    peer.name,
                    line.equivalent,
                    own_state,
                    peer_state
                );
                valid = false;
            }
        }
        Ok::<_, MigrationError>(valid)
    }
    .await;
    peer_session.terminate().await;
    result
}

async fn validate_node(
    entry: &NodeEntry,
    entries: &[NodeEntry],
    index: &NodeIndex,
    validated: &HashSet<String>,
    driver: &dyn ProcessDriver,
) -> Result<bool> {
    let own_address = entry
        .new_address
        .as_ref()
        .map(|a| a.to_string())
        .ok_or_else(|| MigrationError::protocol(format!("node {} has no address", entry.name)))?;

    let mut session = driver.start(&entry.new_path).await?;
    let result = async {
        let lines = list_lines(session.as_mut()).await?;
        let mut valid = true;
        for line in &lines {
            let peer = match index.name_by_address(&line.address) {
                Some(name) => name,
                None => {
                    log::error!("Node {}: trust line to unknown address {}", entry.name, line.address);
                    valid = false;
                    continue;
                }
            };
            if validated.contains(peer) {
                continue;
            }
            let peer_entry = match index.position(peer) {
                Some(idx) => &entries[idx],
                None => continue,
            };
            if !validate_with_peer(session.as_mut(), entry, &own_address, line, peer_entry, driver).await? {
                valid = false;
            }
        }
        Ok::<_, MigrationError>(valid)
    }
    .await;
    session.terminate().await;
    result
}

fn trust_line_count(entry: &NodeEntry) -> usize {
    if !entry.new_path.join(STORAGE_DB).exists() {
        return 0;
    }
    let mut store = NodeStore::new(&entry.name, &entry.old_path, Some(&entry.new_path), false);
    store.list_trust_lines().map(|lines| lines.len()).unwrap_or(0)
}

/// Validates every migrated node, busiest first. Nodes with a marker from an
/// earlier run count as succeeded.
pub async fn validate(config: &MigrationConfig, driver: &dyn ProcessDriver) -> Result<ValidateReport> {
    let gns = GnsTable::load(&config.gns_table_path)?;
    let mut state = RunState::new();
    let entries = discover(
        &config.old_infrastructure_path,
        &config.new_infrastructure_path,
        &gns,
        &mut state,
    )?;
    if let Some(missing) = entries.iter().find(|e| !e.is_migrated()) {
        return Err(MigrationError::MissingMigratedNode(missing.name.clone()));
    }
    let index = NodeIndex::new(&entries);

    let mut order: Vec<(usize, usize)> = entries
        .iter()
        .enumerate()
        .map(|(idx, entry)| (idx, trust_line_count(entry)))
        .collect();
    order.sort_by(|a, b| b.1.cmp(&a.1));

    let mut validated = HashSet::new();
    let mut report = ValidateReport {
        total: entries.len(),
        ..Default::default()
    };
    for (position, (idx, _)) in order.into_iter().enumerate() {
        let entry = &entries[idx];
        let marker = entry.new_path.join(VALIDATED_MARKER);
        if marker.exists() {
            validated.insert(entry.name.clone());
            report.succeeded += 1;
            continue;
        }
        log::info!("Validating node #{}: {}", position + 1, entry.name);
        match validate_node(entry, &entries, &index, &validated, driver).await {
            Ok(true) => {
                save_json(&serde_json::json!({}), &marker)?;
                validated.insert(entry.name.clone());
                report.succeeded += 1;
            }
            Ok(false) => {
                log::error!("Failed to validate node #{}: {}", position + 1, entry.name);
                report.failed += 1;
            }
            Err(e) => {
                log::error!("Failed to validate node #{}: {}: {}", position + 1, entry.name, e);
                state.record(&entry.name, &e);
                report.failed += 1;
            }
        }
    }
    log::info!(
        "Succeeded={} Failed={} All={}",
        report.succeeded,
        report.failed,
        report.total
    );
    Ok(report)
}
