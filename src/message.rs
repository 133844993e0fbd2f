//! CCB wire messages
//!
//! Every message is a self-describing key/value record, sent as one frame:
//!
//! ```text
//! +--------+--------+--------+--------+----------------------------+
//! | Payload length (u32, big-endian)  | JSON object (UTF-8)        |
//! +--------+--------+--------+--------+----------------------------+
//! ```
//!
//! # Protocol Flow
//!
//! ```text
//! Target                   Broker                     Client
//!   │                        │                           │
//!   │──── Register ─────────►│                           │
//!   │◄─── RegisterReply ─────│                           │
//!   │                        │◄──────── Request ─────────│
//!   │◄─── Request (forward) ─│                           │
//!   │═══════════ reverse connection (direct) ═══════════►│
//!   │──── Result ───────────►│                           │
//!   │                        │───── RequestReply ───────►│
//! ```

use std::fmt;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::MessageError;

// ============================================================================
// Constants
// ============================================================================

/// Maximum payload size of one frame (64 KB)
pub const MAX_MESSAGE_SIZE: u32 = 65536;

/// Length of the frame header (4 bytes for length)
pub const HEADER_LEN: usize = 4;

/// Attribute names used in CCB records
pub mod attr {
    pub const COMMAND: &str = "Command";
    pub const NAME: &str = "Name";
    /// Reconnect cookie (registration) or connect secret (requests).
    /// Always treated as a secret.
    pub const CLAIM_ID: &str = "ClaimId";
    pub const CCBID: &str = "CcbId";
    pub const MY_ADDRESS: &str = "MyAddress";
    pub const REQUEST_ID: &str = "RequestId";
    pub const RESULT: &str = "Result";
    pub const ERROR_STRING: &str = "ErrorString";
}

const REDACTED: &str = "(redacted)";

// ============================================================================
// Commands
// ============================================================================

/// Value of the `Command` attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Target registration, and the broker's reply to it
    Register,
    /// Client request, and the broker's forward to the target
    Request,
    /// Heartbeat. Target-initiated ones are acknowledged with another
    /// `Alive`; broker-initiated ones expect no answer.
    Alive,
    /// Broker is going away
    Shutdown,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Register => "Register",
            Command::Request => "Request",
            Command::Alive => "Alive",
            Command::Shutdown => "Shutdown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Register" => Some(Command::Register),
            "Request" => Some(Command::Request),
            "Alive" => Some(Command::Alive),
            "Shutdown" => Some(Command::Shutdown),
            _ => None,
        }
    }
}

// ============================================================================
// Record
// ============================================================================

/// A key/value message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    attrs: Map<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a record carrying only a `Command` attribute
    pub fn with_command(command: Command) -> Self {
        let mut record = Self::new();
        record.assign(attr::COMMAND, command.as_str());
        record
    }

    /// Set an attribute, replacing any previous value
    pub fn assign(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.attrs.insert(key.to_string(), value.into());
        self
    }

    pub fn lookup_str(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(Value::as_str)
    }

    pub fn lookup_bool(&self, key: &str) -> Option<bool> {
        self.attrs.get(key).and_then(Value::as_bool)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.attrs.contains_key(key)
    }

    /// The record's command, if it carries a recognised one
    pub fn command(&self) -> Option<Command> {
        self.lookup_str(attr::COMMAND).and_then(Command::parse)
    }

    fn from_payload(payload: &[u8]) -> Result<Self, MessageError> {
        match serde_json::from_slice::<Value>(payload) {
            Ok(Value::Object(attrs)) => Ok(Record { attrs }),
            Ok(other) => Err(MessageError::Invalid(format!(
                "expected key/value record, got {}",
                json_kind(&other)
            ))),
            Err(e) => Err(MessageError::Invalid(e.to_string())),
        }
    }
}

/// Renders the record for logs with secrets masked
impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut shown = self.attrs.clone();
        if let Some(v) = shown.get_mut(attr::CLAIM_ID) {
            *v = Value::from(REDACTED);
        }
        match serde_json::to_string(&shown) {
            Ok(s) => f.write_str(&s),
            Err(_) => f.write_str("[unprintable record]"),
        }
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// Framing
// ============================================================================

/// Encode a record with its 4-byte length prefix
pub fn encode_record(record: &Record) -> Result<Vec<u8>, MessageError> {
    let payload = serde_json::to_vec(record).map_err(|e| MessageError::Invalid(e.to_string()))?;

    if payload.len() > MAX_MESSAGE_SIZE as usize {
        return Err(MessageError::TooLarge(payload.len()));
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);

    Ok(buf)
}

/// Read exactly one framed record
pub fn read_record<R: Read>(reader: &mut R) -> Result<Record, MessageError> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;

    let length = u32::from_be_bytes(header) as usize;
    if length > MAX_MESSAGE_SIZE as usize {
        return Err(MessageError::TooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload)?;

    let record = Record::from_payload(&payload)?;
    log::trace!("read record {}", record);
    Ok(record)
}

/// Write one framed record and flush it
pub fn write_record<W: Write>(writer: &mut W, record: &Record) -> Result<(), MessageError> {
    let buf = encode_record(record)?;
    writer.write_all(&buf)?;
    writer.flush()?;
    log::trace!("wrote record {}", record);
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
