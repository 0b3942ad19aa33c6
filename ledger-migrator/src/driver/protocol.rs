//! Line-oriented command protocol of the node executable.
//!
//! Requests are `<request-id>\t<VERB:resource>\t<args...>\n`. Replies are one
//! tab-separated line: request id, status code, then (for listing verbs) a
//! record count followed by `count * stride` flat fields.

use uuid::Uuid;

use crate::error::{MigrationError, Result};

pub const COMMANDS_FIFO: &str = "fifo/commands.fifo";
pub const RESULTS_FIFO: &str = "fifo/results.fifo";

pub const STATUS_OK: u32 = 200;

/// Listing page large enough to return everything a node holds.
const PAGE_OFFSET: u32 = 0;
const PAGE_LIMIT: u32 = 100_000;

/// Record widths per listing verb.
pub mod stride {
    /// contractor uuid, incoming, outgoing, balance
    pub const OLD_TRUST_LINES: usize = 4;
    /// contractor id, addresses, state, own keys, contractor keys, incoming, outgoing, balance
    pub const NEW_TRUST_LINES: usize = 8;
    /// transaction uuid, timestamp, address, operation type, sum
    pub const HISTORY_TRUST_LINES: usize = 5;
    /// transaction uuid, timestamp, address, payment type, sum, balance
    pub const OLD_HISTORY_PAYMENTS: usize = 6;
    /// as above plus one trailing field
    pub const NEW_HISTORY_PAYMENTS: usize = 7;
    /// contractor id, addresses
    pub const CONTRACTORS: usize = 2;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Equivalents,
    TrustLines { equivalent: u32 },
    HistoryTrustLines { equivalent: u32 },
    HistoryPayments { equivalent: u32 },
    SetTrustLine { contractor_id: u32, amount: u128, equivalent: u32 },
    TrustLine { contractor_id: u32, equivalent: u32 },
    ContractorsAll,
}

impl Command {
    pub fn render(&self, request_id: &Uuid) -> String {
        let body = match self {
            Command::Equivalents => "GET:equivalents".to_string(),
            Command::TrustLines { equivalent } => format!(
                "GET:contractors/trust-lines\t{}\t{}\t{}",
                PAGE_OFFSET, PAGE_LIMIT, equivalent
            ),
            Command::HistoryTrustLines { equivalent } => format!(
                "GET:history/trust-lines\t{}\t{}\tnull\tnull\t{}",
                PAGE_OFFSET, PAGE_LIMIT, equivalent
            ),
            Command::HistoryPayments { equivalent } => format!(
                "GET:history/payments\t{}\t{}\tnull\tnull\tnull\tnull\tnull\t{}",
                PAGE_OFFSET, PAGE_LIMIT, equivalent
            ),
            Command::SetTrustLine {
                contractor_id,
                amount,
                equivalent,
            } => format!(
                "SET:contractors/trust-lines\t{}\t{}\t{}",
                contractor_id, amount, equivalent
            ),
            Command::TrustLine {
                contractor_id,
                equivalent,
            } => format!(
                "GET:contractors/trust-lines/one/id\t{}\t{}",
                contractor_id, equivalent
            ),
            Command::ContractorsAll => "GET:contractors-all".to_string(),
        };
        format!("{}\t{}\n", request_id.hyphenated(), body)
    }
}

/// A parsed reply line.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub request_id: String,
    pub status: u32,
    fields: Vec<String>,
}

impl Reply {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\n', '\r']);
        let fields: Vec<String> = line.split('\t').map(str::to_string).collect();
        if fields.len() < 2 {
            return Err(MigrationError::protocol(format!("short reply '{}'", line)));
        }
        let status = fields[1]
            .trim()
            .parse()
            .map_err(|_| MigrationError::protocol(format!("bad status in reply '{}'", line)))?;
        Ok(Self {
            request_id: fields[0].clone(),
            status,
            fields,
        })
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }

    pub fn ensure_ok(self) -> Result<Self> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(MigrationError::protocol(format!("node answered with status {}", self.status)))
        }
    }

    /// Raw field by absolute position (0 is the request id).
    pub fn field(&self, idx: usize) -> Result<&str> {
        self.fields
            .get(idx)
            .map(String::as_str)
            .ok_or_else(|| MigrationError::protocol(format!("reply has no field {}", idx)))
    }

    pub fn count(&self) -> Result<usize> {
        self.field(2)?
            .trim()
            .parse()
            .map_err(|_| MigrationError::protocol("bad record count"))
    }

    /// Fixed-width records following the count.
    pub fn records(&self, stride: usize) -> Result<Vec<&[String]>> {
        let count = self.count()?;
        let needed = count
            .checked_mul(stride)
            .and_then(|n| n.checked_add(3))
            .ok_or_else(|| MigrationError::protocol(format!("record count {} is out of range", count)))?;
        if self.fields.len() < needed {
            return Err(MigrationError::protocol(format!(
                "reply announces {} records of {} fields but carries {} fields",
                count,
                stride,
                self.fields.len().saturating_sub(3)
            )));
        }
        Ok(self.fields[3..needed].chunks(stride).collect())
    }

    /// Fields of a single-record reply (no count), starting after the status.
    pub fn single(&self, width: usize) -> Result<&[String]> {
        self.fields
            .get(2..2 + width)
            .ok_or_else(|| MigrationError::protocol("single-record reply is truncated"))
    }
}

/// `"<type> <address>"` -> `<address>`.
pub fn address_of(addresses: &str) -> &str {
    let trimmed = addresses.trim_end_matches(['\n', '\r']);
    match trimmed.find(' ') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Normalizes a number printed by the executable so that `100`, `100.0` and
/// `1e2` compare equal.
pub fn normalize_number(text: &str) -> String {
    let text = text.trim();
    if let Ok(value) = text.parse::<i128>() {
        return value.to_string();
    }
    match text.parse::<f64>() {
        Ok(value) if value.fract() == 0.0 && value.abs() < 1e30 => format!("{}", value as i128),
        Ok(value) => format!("{}", value),
        Err(_) => text.to_string(),
    }
}

pub fn parse_field<T: std::str::FromStr>(record: &[String], idx: usize, what: &str) -> Result<T> {
    record
        .get(idx)
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| MigrationError::protocol(format!("bad {} field", what)))
}
