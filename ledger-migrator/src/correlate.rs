//! Continuous correlation of old and new nodes through their HTTP handlers.
//!
//! A handler answers every request with a `response_uuid`; the actual answer
//! shows up later in Redis under that key.

use async_trait::async_trait;
use redis::AsyncCommands;
use serde_json::Value;
use std::time::Duration;

use crate::config::{EquivalentMap, GnsTable, MigrationConfig};
use crate::error::{MigrationError, Result};

const RESPONSE_POLL_ATTEMPTS: usize = 1000;
const RESPONSE_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Old trust lines are only ever reported once established.
const OLD_TRUST_LINE_STATE: &str = "2";

/// Equivalents and trust lines of a node as one handler reports them.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn equivalents(&self, node: &str) -> Result<Vec<u32>>;
    async fn trust_lines(&self, node: &str, equivalent: u32) -> Result<Vec<Value>>;
}

fn handler_error(e: impl std::fmt::Display) -> MigrationError {
    MigrationError::Handler(e.to_string())
}

/// HTTP handler whose answers are picked up from Redis.
pub struct HandlerClient {
    http: reqwest::Client,
    base_url: String,
    redis: redis::Client,
}

impl HandlerClient {
    pub fn new(base_url: &str, redis_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(handler_error)?;
        let redis = redis::Client::open(redis_url).map_err(handler_error)?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            redis,
        })
    }

    async fn ask(&self, node: &str, path: &str) -> Result<Value> {
        let url = format!(
            "http://{}/api/v1/nodes/{}/{}",
            self.base_url,
            urlencoding::encode(node),
            path
        );
        log::debug!("GET {}", url);
        let response: Value = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(handler_error)?
            .json()
            .await
            .map_err(handler_error)?;
        let key = response["data"]["response_uuid"]
            .as_str()
            .ok_or_else(|| MigrationError::Handler(format!("no response_uuid in answer to {}", url)))?;
        let answer = self.await_response(key).await?;
        if answer["status"] != 200 {
            return Err(MigrationError::Handler(format!(
                "node {} handler returned '{}'",
                node, answer["status"]
            )));
        }
        Ok(answer["data"].clone())
    }

    async fn await_response(&self, key: &str) -> Result<Value> {
        let mut conn = self
            .redis
            .get_multiplexed_async_connection()
            .await
            .map_err(handler_error)?;
        for _ in 0..RESPONSE_POLL_ATTEMPTS {
            let raw: Option<String> = conn.get(key).await.map_err(handler_error)?;
            if let Some(raw) = raw {
                log::debug!("Redis {}: {}", key, raw);
                return Ok(serde_json::from_str(&raw.replace('\'', "\""))?);
            }
            tokio::time::sleep(RESPONSE_POLL_INTERVAL).await;
        }
        Err(MigrationError::Handler(format!("no response stored under {}", key)))
    }
}

#[async_trait]
impl NodeHandler for HandlerClient {
    async fn equivalents(&self, node: &str) -> Result<Vec<u32>> {
        let data = self.ask(node, "equivalents/").await?;
        data["equivalents"]
            .as_array()
            .ok_or_else(|| MigrationError::Handler(format!("node {} reported no equivalents", node)))?
            .iter()
            .map(|v| {
                v.as_u64()
                    .map(|n| n as u32)
                    .ok_or_else(|| MigrationError::Handler(format!("bad equivalent {}", v)))
            })
            .collect()
    }

    async fn trust_lines(&self, node: &str, equivalent: u32) -> Result<Vec<Value>> {
        let data = self
            .ask(node, &format!("contractors/trust-lines/{}/", equivalent))
            .await?;
        Ok(data["trust_lines"].as_array().cloned().unwrap_or_default())
    }
}

/// Text of a JSON field, without quotes for strings.
fn text(line: &Value, field: &str) -> String {
    match &line[field] {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn describe(address: &str, line: &Value, state: &str) -> String {
    format!(
        "address={}; incoming_trust_amount={}; outgoing_trust_amount={}; balance={}; state={};",
        address,
        text(line, "incoming_trust_amount"),
        text(line, "outgoing_trust_amount"),
        text(line, "balance"),
        state
    )
}

/// Sorted per-equivalent descriptions of old trust lines. Contractors are
/// translated to their new addresses through the GNS table.
pub fn old_descriptions(node: &str, lines: &[(u32, Vec<Value>)], gns: &GnsTable) -> Result<Vec<Vec<String>>> {
    let mut all = Vec::with_capacity(lines.len());
    for (_, equivalent_lines) in lines {
        let mut descriptions = Vec::with_capacity(equivalent_lines.len());
        for line in equivalent_lines {
            let uuid = text(line, "uuid");
            let address = gns.get(&uuid).ok_or_else(|| {
                MigrationError::Handler(format!("node {}: no gns address for uuid '{}'", node, uuid))
            })?;
            descriptions.push(describe(address, line, OLD_TRUST_LINE_STATE));
        }
        descriptions.sort();
        all.push(descriptions);
    }
    all.sort();
    Ok(all)
}

pub fn new_descriptions(lines: &[(u32, Vec<Value>)]) -> Vec<Vec<String>> {
    let mut all: Vec<Vec<String>> = lines
        .iter()
        .map(|(_, equivalent_lines)| {
            let mut descriptions: Vec<String> = equivalent_lines
                .iter()
                .map(|line| describe(&text(line, "contractor"), line, &text(line, "state")))
                .collect();
            descriptions.sort();
            descriptions
        })
        .collect();
    all.sort();
    all
}

/// First difference between two description sets, if any.
pub fn find_difference(node: &str, old: &[Vec<String>], new: &[Vec<String>]) -> Option<String> {
    if old.len() != new.len() {
        return Some(format!(
            "node {}: sizes of old and new equivalents differ: {} != {}",
            node,
            old.len(),
            new.len()
        ));
    }
    for (old_lines, new_lines) in old.iter().zip(new) {
        if old_lines.len() != new_lines.len() {
            return Some(format!(
                "node {}: sizes of old and new trust lines differ: {} != {}",
                node,
                old_lines.len(),
                new_lines.len()
            ));
        }
        for (old_line, new_line) in old_lines.iter().zip(new_lines) {
            if old_line != new_line {
                return Some(format!(
                    "node {}: old and new trust line differ:\n{}\n{}",
                    node, old_line, new_line
                ));
            }
        }
    }
    None
}

pub struct Correlator<H: NodeHandler> {
    old: H,
    new: H,
    gns: GnsTable,
    equivalents: EquivalentMap,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationPass {
    pub correlated: usize,
    pub failed: usize,
}

impl<H: NodeHandler> Correlator<H> {
    pub fn new(old: H, new: H, gns: GnsTable, equivalents: EquivalentMap) -> Self {
        Self {
            old,
            new,
            gns,
            equivalents,
        }
    }

    /// Correlates one node: `name` on the old handler, `address` on the new one.
    pub async fn correlate_node(&self, name: &str, address: &str) -> Result<()> {
        let old_equivalents = self.old.equivalents(name).await?;
        let mut new_equivalents = self.new.equivalents(address).await?;
        let mut mapped: Vec<u32> = old_equivalents.iter().map(|&eq| self.equivalents.map(eq)).collect();
        mapped.sort_unstable();
        new_equivalents.sort_unstable();
        log::debug!("\told_equivalents={:?} new_equivalents={:?}", mapped, new_equivalents);
        if mapped != new_equivalents {
            return Err(MigrationError::Handler(format!(
                "node {}: old and new equivalents differ",
                name
            )));
        }

        let mut old_lines = Vec::with_capacity(old_equivalents.len());
        for &equivalent in &old_equivalents {
            old_lines.push((self.equivalents.map(equivalent), self.old.trust_lines(name, equivalent).await?));
        }
        let mut new_lines = Vec::with_capacity(new_equivalents.len());
        for &equivalent in &new_equivalents {
            new_lines.push((equivalent, self.new.trust_lines(address, equivalent).await?));
        }

        let old_descriptions = old_descriptions(name, &old_lines, &self.gns)?;
        let new_descriptions = new_descriptions(&new_lines);
        match find_difference(name, &old_descriptions, &new_descriptions) {
            Some(difference) => Err(MigrationError::Handler(difference)),
            None => Ok(()),
        }
    }

    /// One pass over every node in the GNS table. Failures are logged and counted.
    pub async fn correlate_all(&self) -> CorrelationPass {
        let mut pass = CorrelationPass::default();
        for (idx, (name, address)) in self.gns.entries().into_iter().enumerate() {
            log::info!("Correlating node #{}: {}: {}", idx + 1, name, address);
            match self.correlate_node(name, address).await {
                Ok(()) => pass.correlated += 1,
                Err(e) => {
                    log::error!("{}", e);
                    log::error!("Failed to correlate node #{}: {}", idx + 1, name);
                    pass.failed += 1;
                }
            }
        }
        pass
    }
}

/// Correlates every `loop_period` until the process is stopped.
pub async fn run(config: &MigrationConfig) -> Result<()> {
    let gns = GnsTable::load(&config.gns_table_path)?;
    let equivalents = EquivalentMap::load(&config.equivalents_table_path)?;
    log::info!("Loaded {} nodes from {}", gns.len(), config.gns_table_path.display());
    let correlator = Correlator::new(
        HandlerClient::new(&config.old_handler_url, &config.redis_url)?,
        HandlerClient::new(&config.new_handler_url, &config.redis_url)?,
        gns,
        equivalents,
    );

    log::info!("Starting correlation loop...");
    let mut interval = tokio::time::interval(config.loop_period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        log::info!("Beginning new correlation sequence...");
        let pass = correlator.correlate_all().await;
        log::info!("Correlated {} nodes, {} failed", pass.correlated, pass.failed);
    }
}
