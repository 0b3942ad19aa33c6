//! Binary layouts shared with the node executable.
//!
//! Everything written here ends up in rows the executable reads directly, so
//! the byte layouts must stay identical to what it expects: integers are
//! little-endian, IPv4 addresses are 7 bytes, symbolic addresses are
//! length-prefixed UTF-8.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use uuid::Uuid;

use crate::error::{MigrationError, Result};

/// Size of a raw identity token.
pub const IDENTITY_SIZE: usize = 16;

/// Width of an unsigned amount magnitude.
pub const AMOUNT_MAGNITUDE_SIZE: usize = 32;

pub const ADDRESS_TYPE_IPV4: u8 = 12;
pub const ADDRESS_TYPE_SYMBOLIC: u8 = 41;

/// Encoded size of an IPv4 address: tag, 4 octets, port.
pub const IPV4_ADDRESS_SIZE: usize = 7;

// =====================================================
// Identities
// =====================================================

/// Formats a raw identity as the canonical 8-4-4-4-12 dashed hex string.
pub fn decode_identity(bytes: &[u8; IDENTITY_SIZE]) -> String {
    Uuid::from_bytes(*bytes).hyphenated().to_string()
}

/// Same as [`decode_identity`] for blobs read from a store, where the length
/// is not guaranteed by the type.
pub fn decode_identity_slice(bytes: &[u8]) -> Result<String> {
    let raw: [u8; IDENTITY_SIZE] = bytes.try_into().map_err(|_| {
        MigrationError::MalformedRecord(format!(
            "identity must be {} bytes, got {}",
            IDENTITY_SIZE,
            bytes.len()
        ))
    })?;
    Ok(decode_identity(&raw))
}

pub fn encode_identity(token: &str) -> Result<[u8; IDENTITY_SIZE]> {
    Uuid::parse_str(token)
        .map(|uuid| *uuid.as_bytes())
        .map_err(|e| MigrationError::MalformedRecord(format!("identity '{}': {}", token, e)))
}

// =====================================================
// Amounts
// =====================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmountSign {
    /// Plain 32-byte magnitude without a sign byte.
    Unsigned,
    NonNegative,
    Negative,
}

impl AmountSign {
    /// Numeric code: -1 for unsigned amounts, otherwise the stored sign byte.
    pub fn code(self) -> i8 {
        match self {
            AmountSign::Unsigned => -1,
            AmountSign::NonNegative => 0,
            AmountSign::Negative => 1,
        }
    }

    fn opposite(self, other: AmountSign) -> bool {
        matches!(
            (self, other),
            (AmountSign::NonNegative, AmountSign::Negative)
                | (AmountSign::Negative, AmountSign::NonNegative)
        )
    }
}

/// A decoded sign-magnitude amount. The magnitude keeps the stored width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Amount {
    pub sign: AmountSign,
    pub magnitude: String,
}

/// Decodes an amount blob: 32 bytes or less is an unsigned magnitude, longer
/// blobs carry a leading sign byte (0 or 1).
pub fn decode_amount(bytes: &[u8]) -> Result<Amount> {
    if bytes.len() <= AMOUNT_MAGNITUDE_SIZE {
        return Ok(Amount {
            sign: AmountSign::Unsigned,
            magnitude: hex::encode(bytes),
        });
    }
    let sign = match bytes[0] {
        0 => AmountSign::NonNegative,
        1 => AmountSign::Negative,
        other => {
            return Err(MigrationError::MalformedRecord(format!(
                "amount sign byte {:#04x}",
                other
            )))
        }
    };
    Ok(Amount {
        sign,
        magnitude: hex::encode(&bytes[1..]),
    })
}

impl Amount {
    /// True only for a non-negative amount whose magnitude is all zeros.
    pub fn is_zero(&self) -> bool {
        self.sign == AmountSign::NonNegative && self.magnitude_is_zero()
    }

    fn magnitude_is_zero(&self) -> bool {
        self.magnitude.chars().all(|c| c == '0')
    }

    fn significant_digits(&self) -> &str {
        let trimmed = self.magnitude.trim_start_matches('0');
        if trimmed.is_empty() {
            "0"
        } else {
            trimmed
        }
    }

    /// Balance mirroring between the two ends of a trust line: both zero, or
    /// the same magnitude with opposite signs.
    pub fn mirrors(&self, other: &Amount) -> bool {
        if self.is_zero() && other.is_zero() {
            return true;
        }
        self.significant_digits() == other.significant_digits() && self.sign.opposite(other.sign)
    }

    /// Decimal text when the magnitude fits in 128 bits, `0x`-prefixed hex otherwise.
    pub fn to_normalized(&self) -> String {
        let digits = self.significant_digits();
        let body = match u128::from_str_radix(digits, 16) {
            Ok(value) if digits.len() <= 32 => value.to_string(),
            _ => format!("0x{}", digits),
        };
        if self.sign == AmountSign::Negative && !self.magnitude_is_zero() {
            format!("-{}", body)
        } else {
            body
        }
    }
}

/// Encodes an amount the way the old store keeps it. Unsigned amounts are
/// 32 bytes, signed ones get a leading sign byte.
#[cfg(test)]
pub fn encode_amount(sign: AmountSign, value: u128) -> Vec<u8> {
    let mut magnitude = vec![0u8; AMOUNT_MAGNITUDE_SIZE - 16];
    magnitude.extend_from_slice(&value.to_be_bytes());
    match sign {
        AmountSign::Unsigned => magnitude,
        AmountSign::NonNegative | AmountSign::Negative => {
            let mut out = Vec::with_capacity(AMOUNT_MAGNITUDE_SIZE + 1);
            out.push(sign.code() as u8);
            out.extend(magnitude);
            out
        }
    }
}

// =====================================================
// Addresses
// =====================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeAddress {
    Ipv4(SocketAddrV4),
    Symbolic(String),
}

impl NodeAddress {
    /// `a.b.c.d:port` becomes an IPv4 address; any other non-empty text is symbolic.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(MigrationError::InvalidAddress(text.to_string()));
        }
        match text.parse::<SocketAddrV4>() {
            Ok(addr) => Ok(NodeAddress::Ipv4(addr)),
            Err(_) if text.contains(':') && looks_numeric_host(text) => {
                Err(MigrationError::InvalidAddress(text.to_string()))
            }
            Err(_) => Ok(NodeAddress::Symbolic(text.to_string())),
        }
    }

    pub fn type_code(&self) -> u8 {
        match self {
            NodeAddress::Ipv4(_) => ADDRESS_TYPE_IPV4,
            NodeAddress::Symbolic(_) => ADDRESS_TYPE_SYMBOLIC,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            NodeAddress::Ipv4(addr) => Ok(encode_ipv4_address(addr)),
            NodeAddress::Symbolic(text) => encode_symbolic_address(text),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let malformed = || MigrationError::InvalidAddress(hex::encode(bytes));
        match bytes.first() {
            Some(&ADDRESS_TYPE_IPV4) => {
                if bytes.len() < IPV4_ADDRESS_SIZE {
                    return Err(malformed());
                }
                let ip = Ipv4Addr::new(bytes[1], bytes[2], bytes[3], bytes[4]);
                let port = u16::from_le_bytes([bytes[5], bytes[6]]);
                Ok(NodeAddress::Ipv4(SocketAddrV4::new(ip, port)))
            }
            Some(&ADDRESS_TYPE_SYMBOLIC) => {
                if bytes.len() < 3 {
                    return Err(malformed());
                }
                let len = u16::from_le_bytes([bytes[1], bytes[2]]) as usize;
                let text = bytes.get(3..3 + len).ok_or_else(malformed)?;
                let text = String::from_utf8(text.to_vec()).map_err(|_| malformed())?;
                Ok(NodeAddress::Symbolic(text))
            }
            _ => Err(malformed()),
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            NodeAddress::Ipv4(addr) => Some(addr.port()),
            NodeAddress::Symbolic(_) => None,
        }
    }
}

fn looks_numeric_host(text: &str) -> bool {
    text.split(':')
        .next()
        .map(|host| !host.is_empty() && host.chars().all(|c| c.is_ascii_digit() || c == '.'))
        .unwrap_or(false)
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeAddress::Ipv4(addr) => write!(f, "{}", addr),
            NodeAddress::Symbolic(text) => f.write_str(text),
        }
    }
}

/// Type tag, four octets, little-endian port.
pub fn encode_ipv4_address(addr: &SocketAddrV4) -> Vec<u8> {
    let mut out = Vec::with_capacity(IPV4_ADDRESS_SIZE);
    out.push(ADDRESS_TYPE_IPV4);
    out.extend_from_slice(&addr.ip().octets());
    out.extend_from_slice(&addr.port().to_le_bytes());
    out
}

/// Type tag, little-endian byte length, raw UTF-8. The length must fit in 16 bits.
pub fn encode_symbolic_address(text: &str) -> Result<Vec<u8>> {
    let bytes = text.as_bytes();
    let len = u16::try_from(bytes.len()).map_err(|_| {
        MigrationError::InvalidAddress(format!("symbolic address of {} bytes is too long", bytes.len()))
    })?;
    let mut out = Vec::with_capacity(3 + bytes.len());
    out.push(ADDRESS_TYPE_SYMBOLIC);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(bytes);
    Ok(out)
}
