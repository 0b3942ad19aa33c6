//! Error kinds raised while migrating, checking and comparing node state.

use std::fmt;
use std::time::Duration;

#[derive(Debug)]
pub enum MigrationError {
    /// A trust line or history record references an identity outside the migrated set.
    PeerNotFound { node: String, peer: String },
    /// A trust line has no counterpart on the peer's side of the channel.
    UnpairedTrustLine {
        node: String,
        peer: String,
        equivalent: u32,
    },
    /// The node executable did not answer a command in time.
    CommandTimeout {
        node: String,
        command: String,
        waited: Duration,
    },
    /// A node's `conf.json` is missing or malformed.
    ConfigParse { node: String, reason: String },
    /// The old node still has transactions or queued messages in flight.
    PrecheckFailed {
        node: String,
        transactions: usize,
        messages: usize,
    },
    /// The new infrastructure tree lacks a node present in the old one.
    MissingMigratedNode(String),
    /// Text that is neither an `ipv4:port` pair nor a symbolic address.
    InvalidAddress(String),
    /// A history record is too short to carry an operation tag and peer identity.
    MalformedRecord(String),
    /// The node executable answered with something that is not a valid reply.
    Protocol(String),
    /// The HTTP handler / Redis side-channel used for correlation failed.
    Handler(String),
    Storage(rusqlite::Error),
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl MigrationError {
    /// Only an inconsistent pair of infrastructure trees may abort a whole run.
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(self, MigrationError::MissingMigratedNode(_))
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        MigrationError::Protocol(msg.into())
    }
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationError::PeerNotFound { node, peer } => {
                write!(f, "Node {} references unknown peer {}", node, peer)
            }
            MigrationError::UnpairedTrustLine {
                node,
                peer,
                equivalent,
            } => write!(
                f,
                "Trust line of node {} to {} in equivalent {} has no counterpart",
                node, peer, equivalent
            ),
            MigrationError::CommandTimeout {
                node,
                command,
                waited,
            } => write!(
                f,
                "No response from node {} to '{}' after {}s",
                node,
                command.trim_end(),
                waited.as_secs()
            ),
            MigrationError::ConfigParse { node, reason } => {
                write!(f, "Cannot parse 'conf.json' of node {}: {}", node, reason)
            }
            MigrationError::PrecheckFailed {
                node,
                transactions,
                messages,
            } => write!(
                f,
                "Node {} is not idle: {} transactions, {} queued communicator messages",
                node, transactions, messages
            ),
            MigrationError::MissingMigratedNode(node) => {
                write!(f, "Migrated node {} is not found", node)
            }
            MigrationError::InvalidAddress(text) => write!(f, "Invalid node address '{}'", text),
            MigrationError::MalformedRecord(msg) => write!(f, "Malformed history record: {}", msg),
            MigrationError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            MigrationError::Handler(msg) => write!(f, "Handler error: {}", msg),
            MigrationError::Storage(e) => write!(f, "Storage error: {}", e),
            MigrationError::Io(e) => write!(f, "I/O error: {}", e),
            MigrationError::Json(e) => write!(f, "JSON error: {}", e),
        }
    }
}

impl std::error::Error for MigrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MigrationError::Storage(e) => Some(e),
            MigrationError::Io(e) => Some(e),
            MigrationError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for MigrationError {
    fn from(e: rusqlite::Error) -> Self {
        MigrationError::Storage(e)
    }
}

impl From<std::io::Error> for MigrationError {
    fn from(e: std::io::Error) -> Self {
        MigrationError::Io(e)
    }
}

impl From<serde_json::Error> for MigrationError {
    fn from(e: serde_json::Error) -> Self {
        MigrationError::Json(e)
    }
}

pub type Result<T> = std::result::Result<T, MigrationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_missing_node_is_fatal() {
        assert!(MigrationError::MissingMigratedNode("n1".into()).is_fatal_for_run());
        assert!(!MigrationError::PeerNotFound {
            node: "n1".into(),
            peer: "n2".into()
        }
        .is_fatal_for_run());
        assert!(!MigrationError::protocol("bad reply").is_fatal_for_run());
    }

    #[test]
    fn test_timeout_message_trims_command() {
        let err = MigrationError::CommandTimeout {
            node: "n1".into(),
            command: "id\tGET:equivalents\n".into(),
            waited: Duration::from_secs(60),
        };
        assert_eq!(
            err.to_string(),
            "No response from node n1 to 'id\tGET:equivalents' after 60s"
        );
    }
}
