use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::codec::NodeAddress;
use crate::error::{MigrationError, Result};

/// Environment variable names - single source of truth
pub mod env_vars {
    pub const OLD_INFRASTRUCTURE_PATH: &str = "LEDGER_MIGRATOR_OLD_INFRASTRUCTURE_PATH";
    pub const NEW_INFRASTRUCTURE_PATH: &str = "LEDGER_MIGRATOR_NEW_INFRASTRUCTURE_PATH";
    // Node executables
    pub const MIGRATION_CLIENT_PATH: &str = "LEDGER_MIGRATOR_MIGRATION_CLIENT_PATH";
    pub const OLD_CLIENT_PATH: &str = "LEDGER_MIGRATOR_OLD_CLIENT_PATH";
    pub const NEW_CLIENT_PATH: &str = "LEDGER_MIGRATOR_NEW_CLIENT_PATH";
    // Addressing
    pub const GNS_ADDRESS_SEPARATOR: &str = "LEDGER_MIGRATOR_GNS_ADDRESS_SEPARATOR";
    pub const GNS_TABLE_PATH: &str = "LEDGER_MIGRATOR_GNS_TABLE_PATH";
    pub const EQUIVALENTS_TABLE_PATH: &str = "LEDGER_MIGRATOR_EQUIVALENTS_TABLE_PATH";
    pub const BASE_ADDRESS: &str = "LEDGER_MIGRATOR_BASE_ADDRESS";
    pub const OBSERVERS: &str = "LEDGER_MIGRATOR_OBSERVERS";
    // Run shape
    pub const KEEP_OPEN: &str = "LEDGER_MIGRATOR_KEEP_OPEN";
    pub const THREADS: &str = "LEDGER_MIGRATOR_THREADS";
    pub const COMPARE_SOURCE: &str = "LEDGER_MIGRATOR_COMPARE_SOURCE";
    pub const COMMAND_TIMEOUT_SECS: &str = "LEDGER_MIGRATOR_COMMAND_TIMEOUT_SECS";
    // Correlation
    pub const OLD_HANDLER_URL: &str = "LEDGER_MIGRATOR_OLD_HANDLER_URL";
    pub const NEW_HANDLER_URL: &str = "LEDGER_MIGRATOR_NEW_HANDLER_URL";
    pub const REDIS_URL: &str = "LEDGER_MIGRATOR_REDIS_URL";
    pub const LOOP_PERIOD_SECS: &str = "LEDGER_MIGRATOR_LOOP_PERIOD_SECS";
}

/// Default values
pub mod defaults {
    pub const OLD_INFRASTRUCTURE_PATH: &str = "./io";
    pub const NEW_INFRASTRUCTURE_PATH: &str = "./io_new";
    pub const MIGRATION_CLIENT_PATH: &str = "./geo_network_client_mod";
    pub const OLD_CLIENT_PATH: &str = "./client_prod";
    pub const NEW_CLIENT_PATH: &str = "./geo_network_client";
    pub const GNS_ADDRESS_SEPARATOR: &str = "#";
    pub const GNS_TABLE_PATH: &str = "users_addresses.csv";
    pub const EQUIVALENTS_TABLE_PATH: &str = "new_equivalents.csv";
    pub const OBSERVERS: &str = "127.0.0.1:4000,127.0.0.1:4001,127.0.0.1:4002";
    pub const THREADS: usize = 1;
    pub const COMMAND_TIMEOUT_SECS: u64 = 60;
    pub const OLD_HANDLER_URL: &str = "0.0.0.0:2001";
    pub const NEW_HANDLER_URL: &str = "0.0.0.0:2000";
    pub const REDIS_URL: &str = "redis://localhost:6379/0";
    pub const LOOP_PERIOD_SECS: u64 = 10;

    // Old node conf.json fallbacks
    pub const NODE_INTERFACE: &str = "127.0.0.1";
    pub const NODE_PORT: u16 = 2033;

    // Generated provider section of the new conf.json
    pub const PROVIDER_NAME: &str = "geo.pay";
    pub const PROVIDER_KEY: &str = "111111";
    pub const PROVIDER_ADDRESSES: [&str; 2] = ["127.0.0.1:2010", "127.0.0.1:2011"];
    pub const EQUIVALENTS_REGISTRY_ADDRESS: &str = "eth";
}

/// Where the comparator reads node state from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareSource {
    /// Directly from the old and new stores.
    Store,
    /// From the running old and new node executables.
    Process,
}

impl CompareSource {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "store" | "db" => Some(CompareSource::Store),
            "process" | "client" => Some(CompareSource::Process),
            _ => None,
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            log::warn!("Ignoring invalid value '{}' for {}", raw, name);
            default
        }),
        Err(_) => default,
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Immutable settings of one run.
#[derive(Clone, Debug)]
pub struct MigrationConfig {
    pub old_infrastructure_path: PathBuf,
    pub new_infrastructure_path: PathBuf,
    pub migration_client_path: PathBuf,
    pub old_client_path: PathBuf,
    pub new_client_path: PathBuf,
    pub gns_address_separator: String,
    pub gns_table_path: PathBuf,
    pub equivalents_table_path: PathBuf,
    /// First new address; every further node gets the next port.
    pub base_address: Option<String>,
    pub observers: Vec<String>,
    /// Hold node stores open for a whole pass instead of per operation.
    pub keep_open: bool,
    pub threads: usize,
    pub compare_source: CompareSource,
    pub command_timeout: Duration,
    pub old_handler_url: String,
    pub new_handler_url: String,
    pub redis_url: String,
    pub loop_period: Duration,
}

impl MigrationConfig {
    pub fn from_env() -> Self {
        let compare_source = env::var(env_vars::COMPARE_SOURCE)
            .ok()
            .and_then(|v| {
                CompareSource::parse(&v).or_else(|| {
                    log::warn!("Unknown compare source '{}', using process", v);
                    None
                })
            })
            .unwrap_or(CompareSource::Process);

        Self {
            old_infrastructure_path: PathBuf::from(env_or(
                env_vars::OLD_INFRASTRUCTURE_PATH,
                defaults::OLD_INFRASTRUCTURE_PATH,
            )),
            new_infrastructure_path: PathBuf::from(env_or(
                env_vars::NEW_INFRASTRUCTURE_PATH,
                defaults::NEW_INFRASTRUCTURE_PATH,
            )),
            migration_client_path: PathBuf::from(env_or(
                env_vars::MIGRATION_CLIENT_PATH,
                defaults::MIGRATION_CLIENT_PATH,
            )),
            old_client_path: PathBuf::from(env_or(env_vars::OLD_CLIENT_PATH, defaults::OLD_CLIENT_PATH)),
            new_client_path: PathBuf::from(env_or(env_vars::NEW_CLIENT_PATH, defaults::NEW_CLIENT_PATH)),
            gns_address_separator: env_or(env_vars::GNS_ADDRESS_SEPARATOR, defaults::GNS_ADDRESS_SEPARATOR),
            gns_table_path: PathBuf::from(env_or(env_vars::GNS_TABLE_PATH, defaults::GNS_TABLE_PATH)),
            equivalents_table_path: PathBuf::from(env_or(
                env_vars::EQUIVALENTS_TABLE_PATH,
                defaults::EQUIVALENTS_TABLE_PATH,
            )),
            base_address: env::var(env_vars::BASE_ADDRESS).ok().filter(|v| !v.is_empty()),
            observers: split_list(&env_or(env_vars::OBSERVERS, defaults::OBSERVERS)),
            keep_open: env_flag(env_vars::KEEP_OPEN),
            threads: env_parse(env_vars::THREADS, defaults::THREADS).max(1),
            compare_source,
            command_timeout: Duration::from_secs(env_parse(
                env_vars::COMMAND_TIMEOUT_SECS,
                defaults::COMMAND_TIMEOUT_SECS,
            )),
            old_handler_url: env_or(env_vars::OLD_HANDLER_URL, defaults::OLD_HANDLER_URL),
            new_handler_url: env_or(env_vars::NEW_HANDLER_URL, defaults::NEW_HANDLER_URL),
            redis_url: env_or(env_vars::REDIS_URL, defaults::REDIS_URL),
            loop_period: Duration::from_secs(env_parse(env_vars::LOOP_PERIOD_SECS, defaults::LOOP_PERIOD_SECS)),
        }
    }

    /// Settings rooted at the given trees, everything else at defaults.
    pub fn for_roots(old_root: &Path, new_root: &Path) -> Self {
        Self {
            old_infrastructure_path: old_root.to_path_buf(),
            new_infrastructure_path: new_root.to_path_buf(),
            migration_client_path: PathBuf::from(defaults::MIGRATION_CLIENT_PATH),
            old_client_path: PathBuf::from(defaults::OLD_CLIENT_PATH),
            new_client_path: PathBuf::from(defaults::NEW_CLIENT_PATH),
            gns_address_separator: defaults::GNS_ADDRESS_SEPARATOR.to_string(),
            gns_table_path: old_root.join(defaults::GNS_TABLE_PATH),
            equivalents_table_path: old_root.join(defaults::EQUIVALENTS_TABLE_PATH),
            base_address: None,
            observers: split_list(defaults::OBSERVERS),
            keep_open: false,
            threads: defaults::THREADS,
            compare_source: CompareSource::Store,
            command_timeout: Duration::from_secs(defaults::COMMAND_TIMEOUT_SECS),
            old_handler_url: defaults::OLD_HANDLER_URL.to_string(),
            new_handler_url: defaults::NEW_HANDLER_URL.to_string(),
            redis_url: defaults::REDIS_URL.to_string(),
            loop_period: Duration::from_secs(defaults::LOOP_PERIOD_SECS),
        }
    }
}

// =====================================================
// Lookup tables
// =====================================================

/// Reads a `;`-separated two-column file. A missing file is an empty table.
fn load_pairs(path: &Path) -> Result<Vec<(String, String)>> {
    if !path.exists() {
        log::info!("Lookup table {} not found, using an empty one", path.display());
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    let mut pairs = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split(';');
        match (fields.next(), fields.next()) {
            (Some(key), Some(value)) => pairs.push((key.trim().to_string(), value.trim().to_string())),
            _ => log::warn!("{}:{}: expected two ';'-separated columns", path.display(), idx + 1),
        }
    }
    Ok(pairs)
}

/// Old equivalent id -> new equivalent id. Unmapped ids pass through.
#[derive(Debug, Clone, Default)]
pub struct EquivalentMap {
    map: HashMap<u32, u32>,
}

impl EquivalentMap {
    pub fn load(path: &Path) -> Result<Self> {
        let mut map = HashMap::new();
        for (old, new) in load_pairs(path)? {
            match (old.parse::<u32>(), new.parse::<u32>()) {
                (Ok(old), Ok(new)) => {
                    map.insert(old, new);
                }
                _ => log::warn!("Skipping equivalent mapping '{};{}'", old, new),
            }
        }
        Ok(Self { map })
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (u32, u32)>) -> Self {
        Self {
            map: pairs.into_iter().collect(),
        }
    }

    pub fn map(&self, equivalent: u32) -> u32 {
        self.map.get(&equivalent).copied().unwrap_or(equivalent)
    }
}

/// Node identity -> symbolic address.
#[derive(Debug, Clone, Default)]
pub struct GnsTable {
    addresses: HashMap<String, String>,
    loaded: bool,
}

impl GnsTable {
    pub fn load(path: &Path) -> Result<Self> {
        let loaded = path.exists();
        Ok(Self {
            addresses: load_pairs(path)?.into_iter().collect(),
            loaded,
        })
    }

    pub fn from_pairs<K: Into<String>, V: Into<String>>(pairs: impl IntoIterator<Item = (K, V)>) -> Self {
        Self {
            addresses: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            loaded: true,
        }
    }

    /// True when a table file was present; only then is a missing entry an error.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn get(&self, node: &str) -> Option<&str> {
        self.addresses.get(node).map(String::as_str)
    }

    /// Entries in a stable order.
    pub fn entries(&self) -> Vec<(&str, &str)> {
        let mut entries: Vec<_> = self
            .addresses
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        entries.sort();
        entries
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }
}

// =====================================================
// Node conf.json
// =====================================================

#[derive(Debug, Deserialize)]
struct OldConfFile {
    node: OldConfNode,
    network: OldConfNetwork,
}

#[derive(Debug, Deserialize)]
struct OldConfNode {
    uuid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OldConfNetwork {
    interface: Option<String>,
    port: Option<u16>,
}

/// The parts of an old node's `conf.json` the migrator needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OldNodeConf {
    pub uuid: Option<String>,
    pub interface: String,
    pub port: u16,
}

impl OldNodeConf {
    pub fn address(&self) -> String {
        format!("{}:{}", self.interface, self.port)
    }
}

pub fn read_old_node_conf(node_name: &str, node_path: &Path) -> Result<OldNodeConf> {
    let path = node_path.join("conf.json");
    let parse_error = |reason: String| MigrationError::ConfigParse {
        node: node_name.to_string(),
        reason,
    };
    let raw = std::fs::read_to_string(&path).map_err(|e| parse_error(e.to_string()))?;
    let conf: OldConfFile = serde_json::from_str(&raw).map_err(|e| parse_error(e.to_string()))?;
    Ok(OldNodeConf {
        uuid: conf.node.uuid,
        interface: conf
            .network
            .interface
            .unwrap_or_else(|| defaults::NODE_INTERFACE.to_string()),
        port: conf.network.port.unwrap_or(defaults::NODE_PORT),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfAddress {
    #[serde(rename = "type")]
    pub address_type: String,
    pub address: String,
}

impl ConfAddress {
    fn ipv4(address: &str) -> Self {
        Self {
            address_type: "ipv4".to_string(),
            address: address.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfProvider {
    pub name: String,
    pub key: String,
    pub participant_id: u64,
    pub addresses: Vec<ConfAddress>,
}

/// Generated `conf.json` of a migrated node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewNodeConf {
    pub addresses: Vec<ConfAddress>,
    pub equivalents_registry_address: String,
    pub observers: Vec<ConfAddress>,
    pub providers: Vec<ConfProvider>,
}

/// `user_<id><separator>...` -> `<id>`; anything else maps to participant 0.
pub fn participant_id(address: &str, separator: &str) -> u64 {
    let rest = address.get(5..).unwrap_or("");
    let id = match rest.find(separator) {
        Some(end) => &rest[..end],
        None => rest,
    };
    id.parse().unwrap_or_else(|_| {
        log::warn!("Cannot derive participant id from address '{}'", address);
        0
    })
}

impl NewNodeConf {
    pub fn build(address: &NodeAddress, old_port: u16, separator: &str, observers: &[String]) -> Self {
        let (own_address, participant) = match address {
            NodeAddress::Ipv4(addr) => (ConfAddress::ipv4(&addr.to_string()), 0),
            NodeAddress::Symbolic(text) => (
                ConfAddress {
                    address_type: "gns".to_string(),
                    address: format!("{}:{}", text, old_port),
                },
                participant_id(text, separator),
            ),
        };
        Self {
            addresses: vec![own_address],
            equivalents_registry_address: defaults::EQUIVALENTS_REGISTRY_ADDRESS.to_string(),
            observers: observers.iter().map(|o| ConfAddress::ipv4(o)).collect(),
            providers: vec![ConfProvider {
                name: defaults::PROVIDER_NAME.to_string(),
                key: defaults::PROVIDER_KEY.to_string(),
                participant_id: participant,
                addresses: defaults::PROVIDER_ADDRESSES
                    .iter()
                    .map(|a| ConfAddress::ipv4(a))
                    .collect(),
            }],
        }
    }

    pub fn write(&self, node_path: &Path) -> Result<()> {
        std::fs::create_dir_all(node_path)?;
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(node_path.join("conf.json"), json)?;
        Ok(())
    }
}

/// `host:port` -> `host:port+1`. Text without a numeric port is returned unchanged.
pub fn increment_address(address: &str) -> String {
    match address.rfind(':') {
        Some(idx) => match address[idx + 1..].parse::<u32>() {
            Ok(port) => format!("{}:{}", &address[..idx], port + 1),
            Err(_) => address.to_string(),
        },
        None => address.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_equivalent_map_passes_unknown_through() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("new_equivalents.csv");
        std::fs::write(&path, "1;1001\n2;1002\nbroken\n\n").unwrap();
        let map = EquivalentMap::load(&path).unwrap();
        assert_eq!(map.map(1), 1001);
        assert_eq!(map.map(2), 1002);
        assert_eq!(map.map(3), 3);
    }

    #[test]
    fn test_missing_tables_are_empty() {
        let dir = tempdir().unwrap();
        let gns = GnsTable::load(&dir.path().join("absent.csv")).unwrap();
        assert!(!gns.is_loaded());
        assert_eq!(gns.len(), 0);
        assert_eq!(EquivalentMap::load(&dir.path().join("absent.csv")).unwrap().map(5), 5);
    }

    #[test]
    fn test_old_conf_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("conf.json"),
            r#"{"node": {"uuid": "abc"}, "network": {}}"#,
        )
        .unwrap();
        let conf = read_old_node_conf("abc", dir.path()).unwrap();
        assert_eq!(conf.address(), "127.0.0.1:2033");
        assert_eq!(conf.uuid.as_deref(), Some("abc"));
    }

    #[test]
    fn test_unparsable_conf_is_config_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("conf.json"), "{ not json").unwrap();
        match read_old_node_conf("n1", dir.path()) {
            Err(MigrationError::ConfigParse { node, .. }) => assert_eq!(node, "n1"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(read_old_node_conf("n1", &dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_symbolic_conf_carries_participant_and_port() {
        let address = NodeAddress::parse("user_42#geo.pay").unwrap();
        let conf = NewNodeConf::build(&address, 2040, "#", &["127.0.0.1:4000".to_string()]);
        assert_eq!(conf.addresses[0].address_type, "gns");
        assert_eq!(conf.addresses[0].address, "user_42#geo.pay:2040");
        assert_eq!(conf.providers[0].participant_id, 42);
        assert_eq!(conf.observers.len(), 1);
        assert_eq!(conf.equivalents_registry_address, "eth");

        let value = serde_json::to_value(&conf).unwrap();
        assert_eq!(value["addresses"][0]["type"], "gns");
    }

    #[test]
    fn test_ipv4_conf_uses_participant_zero() {
        let address = NodeAddress::parse("10.0.0.1:2033").unwrap();
        let conf = NewNodeConf::build(&address, 2033, "#", &[]);
        assert_eq!(conf.addresses[0], ConfAddress::ipv4("10.0.0.1:2033"));
        assert_eq!(conf.providers[0].participant_id, 0);
    }

    #[test]
    fn test_increment_address() {
        assert_eq!(increment_address("127.0.0.1:2033"), "127.0.0.1:2034");
        assert_eq!(increment_address("no-port"), "no-port");
    }

    #[test]
    fn test_compare_source_parse() {
        assert_eq!(CompareSource::parse("Store"), Some(CompareSource::Store));
        assert_eq!(CompareSource::parse("process"), Some(CompareSource::Process));
        assert_eq!(CompareSource::parse("other"), None);
    }
}
