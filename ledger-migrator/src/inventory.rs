//! Node discovery over the old infrastructure tree and new-address assignment.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::codec::NodeAddress;
use crate::config::{read_old_node_conf, GnsTable, NewNodeConf, OldNodeConf};
use crate::error::Result;
use crate::state::RunState;

/// One node directory of the old tree.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    /// Directory name, shared by the old and new trees.
    pub dir_name: String,
    /// Identity from `conf.json`, falling back to the directory name.
    pub name: String,
    pub old_path: PathBuf,
    pub new_path: PathBuf,
    pub conf: Option<OldNodeConf>,
    pub new_address: Option<NodeAddress>,
    pub no_gns_address: bool,
}

impl NodeEntry {
    pub fn is_migrated(&self) -> bool {
        self.new_path.is_dir()
    }
}

/// Sub-directory names of `root`, sorted.
pub fn list_node_dirs(root: &Path) -> Result<Vec<String>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// New address of a node: the GNS entry if a table is loaded, else the old
/// `interface:port`. The flag reports a loaded table without an entry.
pub fn resolve_address(name: &str, conf: &OldNodeConf, gns: &GnsTable) -> Result<(NodeAddress, bool)> {
    if gns.is_loaded() {
        if let Some(symbolic) = gns.get(name) {
            return Ok((NodeAddress::Symbolic(symbolic.to_string()), false));
        }
        return Ok((NodeAddress::parse(&conf.address())?, true));
    }
    Ok((NodeAddress::parse(&conf.address())?, false))
}

/// Address a migrated node was generated with, from its new `conf.json`.
/// Symbolic addresses are stored there with the node's port appended.
pub fn read_migrated_address(new_path: &Path) -> Option<NodeAddress> {
    let raw = std::fs::read_to_string(new_path.join("conf.json")).ok()?;
    let conf: NewNodeConf = serde_json::from_str(&raw).ok()?;
    let own = conf.addresses.first()?;
    let text = match own.address_type.as_str() {
        "gns" => own.address.rsplit_once(':').map(|(name, _)| name).unwrap_or(&own.address),
        _ => own.address.as_str(),
    };
    NodeAddress::parse(text).ok()
}

/// Reads every node's `conf.json` under the old root. Nodes whose
/// configuration cannot be parsed stay in the list without an address.
/// Migrated nodes keep the address they were generated with.
pub fn discover(old_root: &Path, new_root: &Path, gns: &GnsTable, state: &mut RunState) -> Result<Vec<NodeEntry>> {
    let mut entries = Vec::new();
    for dir_name in list_node_dirs(old_root)? {
        let old_path = old_root.join(&dir_name);
        let new_path = new_root.join(&dir_name);
        let mut entry = NodeEntry {
            dir_name: dir_name.clone(),
            name: dir_name.clone(),
            old_path,
            new_path,
            conf: None,
            new_address: None,
            no_gns_address: false,
        };
        match read_old_node_conf(&dir_name, &entry.old_path) {
            Ok(conf) => {
                if let Some(uuid) = conf.uuid.clone() {
                    entry.name = uuid;
                }
                match resolve_address(&entry.name, &conf, gns) {
                    Ok((address, no_gns)) => {
                        if no_gns {
                            log::error!("Node #{}: {} has no gns address", entries.len() + 1, entry.name);
                            state.append_error("no gns address", &entry.name, None);
                        }
                        entry.new_address = Some(address);
                        entry.no_gns_address = no_gns;
                    }
                    Err(e) => {
                        log::error!("Cannot determine address of node {}: {}", entry.name, e);
                        state.record(&entry.name, &e);
                    }
                }
                entry.conf = Some(conf);
                if let Some(address) = read_migrated_address(&entry.new_path) {
                    entry.new_address = Some(address);
                }
            }
            Err(e) => {
                log::error!("{}", e);
                state.record(&dir_name, &e);
            }
        }
        entries.push(entry);
    }
    Ok(entries)
}

/// Lookups from identities and printed addresses back to node names.
#[derive(Debug, Default, Clone)]
pub struct NodeIndex {
    names: HashMap<String, usize>,
    by_address: HashMap<String, String>,
}

impl NodeIndex {
    pub fn new(entries: &[NodeEntry]) -> Self {
        let mut index = Self::default();
        for (idx, entry) in entries.iter().enumerate() {
            index.names.insert(entry.name.clone(), idx);
            if let Some(address) = &entry.new_address {
                index.by_address.insert(address.to_string(), entry.name.clone());
            }
        }
        index
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.get(name).copied()
    }

    pub fn name_by_address(&self, address: &str) -> Option<&str> {
        self.by_address.get(address.trim()).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::OldNodeFixture;
    use tempfile::tempdir;

    const N1: &str = "00000000-0000-0000-0000-000000000001";
    const N2: &str = "00000000-0000-0000-0000-000000000002";
    const N3: &str = "00000000-0000-0000-0000-000000000003";

    #[test]
    fn test_discover_resolves_addresses_and_records_bad_conf() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("old");
        OldNodeFixture::new(&old, N1).port(2040).write();
        OldNodeFixture::new(&old, N2).write();
        OldNodeFixture::new(&old, N3).raw_conf("{ not json").write();
        std::fs::write(old.join("notes.txt"), "not a node").unwrap();

        let gns = GnsTable::from_pairs([(N2, "user_2#geo.pay")]);
        let mut state = RunState::new();
        let entries = discover(&old, &dir.path().join("new"), &gns, &mut state).unwrap();

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].new_address.as_ref().unwrap().to_string(), "127.0.0.1:2040");
        assert!(entries[0].no_gns_address);
        assert_eq!(
            entries[1].new_address,
            Some(NodeAddress::Symbolic("user_2#geo.pay".to_string()))
        );
        assert!(entries[2].new_address.is_none());
        assert!(!entries[2].is_migrated());

        let errors: Vec<_> = state.errors.values().map(|e| (e.node.as_str(), e.error.as_str())).collect();
        assert_eq!(errors[0], (N1, "no gns address"));
        assert_eq!(errors[1].0, N3);
        assert!(errors[1].1.starts_with("Cannot parse 'conf.json'"));

        let index = NodeIndex::new(&entries);
        assert_eq!(index.name_by_address("user_2#geo.pay"), Some(N2));
        assert_eq!(index.name_by_address("127.0.0.1:2040"), Some(N1));
        assert!(index.contains(N3));
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_migrated_node_keeps_generated_address() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("old");
        let new = dir.path().join("new");
        OldNodeFixture::new(&old, N1).port(2050).write();
        OldNodeFixture::new(&old, N2).port(2051).write();
        NewNodeConf::build(&NodeAddress::parse("10.0.0.1:3000").unwrap(), 2050, "#", &[])
            .write(&new.join(N1))
            .unwrap();
        NewNodeConf::build(&NodeAddress::Symbolic("user_2#geo.pay".to_string()), 2051, "#", &[])
            .write(&new.join(N2))
            .unwrap();

        let mut state = RunState::new();
        let entries = discover(&old, &new, &GnsTable::default(), &mut state).unwrap();
        assert_eq!(entries[0].new_address.as_ref().unwrap().to_string(), "10.0.0.1:3000");
        assert_eq!(
            entries[1].new_address,
            Some(NodeAddress::Symbolic("user_2#geo.pay".to_string()))
        );
        assert!(entries[0].is_migrated());
    }

    #[test]
    fn test_without_gns_table_old_address_is_kept() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("old");
        OldNodeFixture::new(&old, N1).port(2050).write();
        let mut state = RunState::new();
        let entries = discover(&old, &dir.path().join("new"), &GnsTable::default(), &mut state).unwrap();
        assert_eq!(entries[0].new_address.as_ref().unwrap().to_string(), "127.0.0.1:2050");
        assert!(!entries[0].no_gns_address);
        assert!(!state.has_errors());
    }
}
