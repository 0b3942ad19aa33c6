//! Scoped access to a node's old and new embedded stores.
//!
//! Every operation opens what it needs and closes it again before returning,
//! on success and on failure alike. In bulk mode (`keep_open`) connections
//! stay open across operations until [`NodeStore::close`] is called.
//!
//! The new store is written inside one transaction per connection; closing
//! the connection commits it, which is the only durability point.

use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};

use crate::error::{MigrationError, Result};

/// Location of the embedded database inside a node directory.
pub const STORAGE_DB: &str = "io/storageDB";
/// Old-schema store holding queued outgoing messages.
pub const COMMUNICATOR_DB: &str = "io/communicatorStorageDB";

pub struct NodeStore {
    node: String,
    old_db_path: PathBuf,
    communicator_db_path: PathBuf,
    new_db_path: Option<PathBuf>,
    pub(super) old: Option<Connection>,
    pub(super) new: Option<Connection>,
    keep_open: bool,
}

impl NodeStore {
    pub fn new(node: &str, old_node_path: &Path, new_node_path: Option<&Path>, keep_open: bool) -> Self {
        Self {
            node: node.to_string(),
            old_db_path: old_node_path.join(STORAGE_DB),
            communicator_db_path: old_node_path.join(COMMUNICATOR_DB),
            new_db_path: new_node_path.map(|p| p.join(STORAGE_DB)),
            old: None,
            new: None,
            keep_open,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn has_new_store(&self) -> bool {
        self.new_db_path.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.old.is_some() || self.new.is_some()
    }

    pub fn set_keep_open(&mut self, keep_open: bool) {
        self.keep_open = keep_open;
    }

    fn open_old(&mut self) -> Result<&Connection> {
        let conn = match self.old.take() {
            Some(conn) => conn,
            None => {
                log::debug!("Connecting to old store of node {}", self.node);
                Connection::open_with_flags(&self.old_db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?
            }
        };
        Ok(self.old.insert(conn))
    }

    fn open_new(&mut self) -> Result<&Connection> {
        let conn = match self.new.take() {
            Some(conn) => conn,
            None => {
                let path = self.new_db_path.as_ref().ok_or_else(|| {
                    MigrationError::protocol(format!("node {} has no new store configured", self.node))
                })?;
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                log::debug!("Connecting to new store of node {}", self.node);
                let conn = Connection::open(path)?;
                conn.execute_batch("PRAGMA foreign_keys=ON; BEGIN;")?;
                conn
            }
        };
        Ok(self.new.insert(conn))
    }

    /// Runs `f` against the old store.
    pub fn with_old<T>(&mut self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let result = match self.open_old() {
            Ok(conn) => f(conn),
            Err(e) => Err(e),
        };
        if !self.keep_open {
            self.old = None;
        }
        result
    }

    /// Runs `f` against the communicator store of the old node, if the node has one.
    pub fn with_communicator<T>(&mut self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<Option<T>> {
        if !self.communicator_db_path.exists() {
            return Ok(None);
        }
        let conn = Connection::open_with_flags(&self.communicator_db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        f(&conn).map(Some)
    }

    /// Runs `f` inside the new store's transaction. Outside bulk mode the
    /// transaction is committed on success and rolled back on failure.
    pub fn with_new<T>(&mut self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let result = match self.open_new() {
            Ok(conn) => f(conn),
            Err(e) => return Err(e),
        };
        if !self.keep_open {
            let closed = self.close_new(result.is_ok());
            if let (Ok(_), Err(e)) = (&result, closed) {
                return Err(e);
            }
        }
        result
    }

    fn close_new(&mut self, commit: bool) -> Result<()> {
        if let Some(conn) = self.new.take() {
            if commit {
                conn.execute_batch("COMMIT;")?;
            } else if let Err(e) = conn.execute_batch("ROLLBACK;") {
                log::warn!("Rollback failed for node {}: {}", self.node, e);
            }
            log::debug!("Disconnected from new store of node {}", self.node);
        }
        Ok(())
    }

    /// Commits pending writes and releases both connections.
    pub fn close(&mut self) -> Result<()> {
        self.old = None;
        self.close_new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_new_store_disconnects_after_operation() {
        let dir = tempdir().unwrap();
        let mut store = NodeStore::new("n1", &dir.path().join("old"), Some(&dir.path().join("new")), false);
        store
            .with_new(|conn| {
                conn.execute_batch("CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (1);")?;
                Ok(())
            })
            .unwrap();
        assert!(!store.is_connected());
        assert!(dir.path().join("new").join(STORAGE_DB).exists());

        let count: i64 = store
            .with_new(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_failed_operation_rolls_back_and_disconnects() {
        let dir = tempdir().unwrap();
        let mut store = NodeStore::new("n1", &dir.path().join("old"), Some(&dir.path().join("new")), false);
        store
            .with_new(|conn| Ok(conn.execute_batch("CREATE TABLE t (v INTEGER);")?))
            .unwrap();

        let result: Result<()> = store.with_new(|conn| {
            conn.execute("INSERT INTO t VALUES (1)", [])?;
            conn.execute("INSERT INTO missing VALUES (1)", [])?;
            Ok(())
        });
        assert!(result.is_err());
        assert!(!store.is_connected());

        let count: i64 = store
            .with_new(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_bulk_mode_keeps_connection_until_close() {
        let dir = tempdir().unwrap();
        let mut store = NodeStore::new("n1", &dir.path().join("old"), Some(&dir.path().join("new")), true);
        store
            .with_new(|conn| Ok(conn.execute_batch("CREATE TABLE t (v INTEGER);")?))
            .unwrap();
        assert!(store.is_connected());
        store.close().unwrap();
        assert!(!store.is_connected());
    }

    #[test]
    fn test_missing_old_store_fails_and_stays_disconnected() {
        let dir = tempdir().unwrap();
        let mut store = NodeStore::new("n1", &dir.path().join("absent"), None, false);
        let result = store.with_old(|_| Ok(()));
        assert!(result.is_err());
        assert!(!store.is_connected());
        assert!(store.with_new(|_| Ok(())).is_err());
    }
}
