//! Node executable as a child process talking over named pipes.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at, Instant};

use super::protocol::{COMMANDS_FIFO, RESULTS_FIFO};
use super::{CommandSession, ProcessDriver};
use crate::error::{MigrationError, Result};

/// Pause between attempts to open a pipe the node has not created yet.
const PIPE_RETRY: Duration = Duration::from_millis(100);
/// Pause after the node closed its end of the results pipe.
const EOF_BACKOFF: Duration = Duration::from_millis(20);

pub struct NodeProcessDriver {
    client_path: PathBuf,
    command_timeout: Duration,
    verbose: bool,
}

impl NodeProcessDriver {
    pub fn new(client_path: impl Into<PathBuf>, command_timeout: Duration) -> Self {
        Self {
            client_path: client_path.into(),
            command_timeout,
            verbose: false,
        }
    }

    /// Let the executable write to our stdout/stderr.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    fn command(&self, node_path: &Path) -> Command {
        let mut cmd = Command::new(&self.client_path);
        cmd.current_dir(node_path).kill_on_drop(true).stdin(Stdio::null());
        if !self.verbose {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        cmd
    }
}

fn node_label(node_path: &Path) -> String {
    node_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| node_path.display().to_string())
}

#[async_trait]
impl ProcessDriver for NodeProcessDriver {
    async fn run_and_wait(&self, node_path: &Path) -> Result<()> {
        log::info!("Starting node: {}", node_label(node_path));
        let status = self.command(node_path).status().await?;
        if !status.success() {
            log::warn!("Node {} exited with {}", node_label(node_path), status);
        }
        Ok(())
    }

    async fn start(&self, node_path: &Path) -> Result<Box<dyn CommandSession>> {
        let node = node_label(node_path);
        log::info!("Starting node: {}", node);
        let child = self.command(node_path).spawn()?;

        let (tx, rx) = mpsc::channel(1);
        let reader = tokio::spawn(read_results(node.clone(), node_path.join(RESULTS_FIFO), tx));

        Ok(Box::new(NodeSession {
            node,
            commands_path: node_path.join(COMMANDS_FIFO),
            command_timeout: self.command_timeout,
            child: Some(child),
            reader: Some(reader),
            replies: rx,
        }))
    }
}

/// Forwards every reply line from the results pipe. Opening is retried until
/// the node has created the pipe.
async fn read_results(node: String, path: PathBuf, tx: mpsc::Sender<String>) {
    log::debug!("Opening result FIFO for node {}", node);
    let receiver = loop {
        match pipe::OpenOptions::new().open_receiver(&path) {
            Ok(receiver) => break receiver,
            Err(_) => sleep(PIPE_RETRY).await,
        }
    };
    let mut lines = BufReader::new(receiver).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.is_empty() {
                    continue;
                }
                if tx.send(line).await.is_err() {
                    return;
                }
            }
            Ok(None) => sleep(EOF_BACKOFF).await,
            Err(e) => {
                log::warn!("Result FIFO of node {} failed: {}", node, e);
                return;
            }
        }
    }
}

pub struct NodeSession {
    node: String,
    commands_path: PathBuf,
    command_timeout: Duration,
    child: Option<Child>,
    reader: Option<JoinHandle<()>>,
    replies: mpsc::Receiver<String>,
}

impl NodeSession {
    async fn write_line(&self, line: &str, deadline: Instant) -> Result<()> {
        let mut sender = loop {
            match pipe::OpenOptions::new().open_sender(&self.commands_path) {
                Ok(sender) => break sender,
                Err(e) => {
                    if Instant::now() >= deadline {
                        log::warn!("Commands FIFO of node {} never opened: {}", self.node, e);
                        return Err(self.timeout_error(line));
                    }
                    sleep(PIPE_RETRY).await;
                }
            }
        };
        sender.write_all(line.as_bytes()).await?;
        sender.flush().await?;
        Ok(())
    }

    fn timeout_error(&self, line: &str) -> MigrationError {
        MigrationError::CommandTimeout {
            node: self.node.clone(),
            command: line.to_string(),
            waited: self.command_timeout,
        }
    }
}

#[async_trait]
impl CommandSession for NodeSession {
    async fn send_command(&mut self, line: &str) -> Result<String> {
        while let Ok(stale) = self.replies.try_recv() {
            log::debug!("Dropping stale reply from node {}: {}", self.node, stale);
        }

        let deadline = Instant::now() + self.command_timeout;
        self.write_line(line, deadline).await?;

        let request_id = line.split('\t').next().unwrap_or_default().to_string();
        loop {
            match timeout_at(deadline, self.replies.recv()).await {
                Ok(Some(reply)) => {
                    if reply.split('\t').next() == Some(request_id.as_str()) {
                        return Ok(reply);
                    }
                    log::debug!("Ignoring reply to another request from node {}: {}", self.node, reply);
                }
                Ok(None) => {
                    return Err(MigrationError::protocol(format!(
                        "result FIFO of node {} closed",
                        self.node
                    )))
                }
                Err(_) => return Err(self.timeout_error(line)),
            }
        }
    }

    async fn terminate(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                log::debug!("Node {} already gone: {}", self.node, e);
            }
            let _ = child.wait().await;
            log::debug!("Node {} terminated", self.node);
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for NodeSession {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}
