//! Driving the external node executable.

use async_trait::async_trait;
use std::path::Path;

use crate::error::Result;

pub mod process;
pub mod protocol;

pub use process::NodeProcessDriver;
pub use protocol::{Command, Reply};

/// Spawns the node executable against a node directory.
#[async_trait]
pub trait ProcessDriver: Send + Sync {
    /// Runs the executable to completion (key generation, audit signing).
    async fn run_and_wait(&self, node_path: &Path) -> Result<()>;

    /// Starts a long-running executable and opens its command pipes.
    async fn start(&self, node_path: &Path) -> Result<Box<dyn CommandSession>>;
}

/// One running executable. Commands are issued strictly one at a time.
#[async_trait]
pub trait CommandSession: Send {
    /// Sends a rendered command line and waits for its reply line.
    async fn send_command(&mut self, line: &str) -> Result<String>;

    /// Kills the process and closes the pipes. Safe to call more than once.
    async fn terminate(&mut self);
}

/// Renders `command`, sends it and parses the reply.
pub async fn request(session: &mut dyn CommandSession, command: &Command) -> Result<Reply> {
    let request_id = uuid::Uuid::new_v4();
    let line = command.render(&request_id);
    log::debug!("-> {}", line.trim_end());
    let raw = session.send_command(&line).await?;
    log::debug!("<- {}", raw.trim_end());
    Reply::parse(&raw)
}
