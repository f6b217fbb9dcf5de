//! Wire packets and their text encoding.
//!
//! Each packet is one JSON object terminated by a newline, sent as one datagram
//! or as the whole content of one stream connection.
//! Two shapes exist on the wire:
//! - control: `{"NAME", "MY_IP", "TYPE", "PAYLOAD"}`, plus `"SERIAL"` for `FILE` chunks.
//! - data-channel: `{"SERIAL", "RWND"}`, used by acknowledgments.
//!
//! Decoding is all-or-nothing: a text that does not match exactly one shape is rejected.

use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use strum::{EnumIter, EnumString, IntoStaticStr};

use std::net::{Ipv4Addr};
use std::str::{FromStr};

/// Identity of the node sending a control packet.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Header {
    pub alias: String,
    pub address: Ipv4Addr,
}

impl Header {
    pub fn new(alias: &str, address: Ipv4Addr) -> Self {
        Self { alias: alias.into(), address }
    }
}

/// A base64 slice of a file tagged with its position.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Chunk {
    pub serial: i64,
    pub payload: String,
}

impl Chunk {
    /// Serial of the empty chunk used to probe the receiver window.
    pub const PROBE_SERIAL: i64 = -1;

    pub fn new(serial: i64, payload: String) -> Self {
        Self { serial, payload }
    }

    pub fn probe() -> Self {
        Self { serial: Self::PROBE_SERIAL, payload: String::new() }
    }

    pub fn is_probe(&self) -> bool {
        self.serial == Self::PROBE_SERIAL
    }

    /// Payload bytes that fit in a `FILE` datagram of `max_packet_len` sent with `header`.
    /// The envelope is measured with the widest serial used on the wire (`i32::MAX`).
    /// Base64 text needs no JSON escaping, so each payload byte is one encoded byte.
    pub fn payload_budget(header: &Header, max_packet_len: usize) -> usize {
        let widest = Chunk::new(i32::MAX as i64, String::new());
        let overhead = Packet::FileChunk(header.clone(), widest).encode().len();
        max_packet_len.saturating_sub(overhead)
    }
}

/// Acknowledgment of a chunk, carrying the window still available in the receiver.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Acknowledge {
    pub serial: i64,
    pub window: i64,
}

/// How a packet travels.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Channel {
    /// Best-effort UDP datagram, unicast or broadcast.
    Datagram,
    /// Reliable unicast, one TCP connection per packet.
    Stream,
}

/// Value of the `TYPE` field.
#[derive(EnumString, IntoStaticStr, EnumIter, Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PacketKind {
    #[strum(serialize = "DISCOVER")]
    Discover,
    #[strum(serialize = "RESPOND")]
    Respond,
    #[strum(serialize = "GOODBYE")]
    Goodbye,
    #[strum(serialize = "MESSAGE")]
    Message,
    #[strum(serialize = "ALLOW")]
    Allow,
    #[strum(serialize = "YES")]
    ConsentGranted,
    #[strum(serialize = "FILE")]
    FileChunk,
    #[strum(serialize = "DOWNLOAD_SUCCESS")]
    TransferSucceeded,
    #[strum(serialize = "DOWNLOAD_FAIL")]
    TransferFailed,
    #[strum(serialize = "QUIT")]
    Quit,
    #[strum(serialize = "ACK")]
    Acknowledge,
}

impl PacketKind {
    pub fn as_str(self) -> &'static str {
        self.into()
    }

    pub fn channel(self) -> Channel {
        match self {
            PacketKind::Discover
            | PacketKind::Goodbye
            | PacketKind::FileChunk
            | PacketKind::Acknowledge => Channel::Datagram,
            PacketKind::Respond
            | PacketKind::Message
            | PacketKind::Allow
            | PacketKind::ConsentGranted
            | PacketKind::TransferSucceeded
            | PacketKind::TransferFailed
            | PacketKind::Quit => Channel::Stream,
        }
    }
}

impl std::fmt::Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Packet {
    /// Presence announcement, usually broadcast.
    Discover(Header),
    /// Answer to a `Discover`, sent back to the announcer.
    Respond(Header),
    /// The sender leaves the network.
    Goodbye(Header),
    /// One line of chat text.
    Message(Header, String),
    /// Request to send the named file.
    Allow(Header, String),
    /// The receiver accepted the last `Allow`.
    ConsentGranted(Header),
    FileChunk(Header, Chunk),
    /// Every chunk was acknowledged. Carries the number of chunks.
    TransferSucceeded(Header, usize),
    /// The transfer was abandoned. Carries the number of chunks when known.
    TransferFailed(Header, Option<usize>),
    Quit(Header),
    Acknowledge(Acknowledge),
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Discover(..) => PacketKind::Discover,
            Packet::Respond(..) => PacketKind::Respond,
            Packet::Goodbye(..) => PacketKind::Goodbye,
            Packet::Message(..) => PacketKind::Message,
            Packet::Allow(..) => PacketKind::Allow,
            Packet::ConsentGranted(..) => PacketKind::ConsentGranted,
            Packet::FileChunk(..) => PacketKind::FileChunk,
            Packet::TransferSucceeded(..) => PacketKind::TransferSucceeded,
            Packet::TransferFailed(..) => PacketKind::TransferFailed,
            Packet::Quit(..) => PacketKind::Quit,
            Packet::Acknowledge(..) => PacketKind::Acknowledge,
        }
    }

    /// Sender identity. Acknowledgments are anonymous.
    pub fn header(&self) -> Option<&Header> {
        match self {
            Packet::Discover(header)
            | Packet::Respond(header)
            | Packet::Goodbye(header)
            | Packet::Message(header, _)
            | Packet::Allow(header, _)
            | Packet::ConsentGranted(header)
            | Packet::FileChunk(header, _)
            | Packet::TransferSucceeded(header, _)
            | Packet::TransferFailed(header, _)
            | Packet::Quit(header) => Some(header),
            Packet::Acknowledge(_) => None,
        }
    }

    pub fn channel(&self) -> Channel {
        self.kind().channel()
    }

    /// Encodes the packet as a newline-terminated JSON object.
    pub fn encode(&self) -> String {
        let object = match self {
            Packet::Acknowledge(ack) => json!({
                "TYPE": PacketKind::Acknowledge.as_str(),
                "SERIAL": ack.serial,
                "RWND": ack.window,
            }),
            Packet::FileChunk(header, chunk) => {
                let mut object = control_object(header, self.kind(), json!(chunk.payload));
                object["SERIAL"] = json!(chunk.serial);
                object
            }
            Packet::Message(header, text) => control_object(header, self.kind(), json!(text)),
            Packet::Allow(header, filename) => {
                control_object(header, self.kind(), json!(filename))
            }
            Packet::TransferSucceeded(header, total) => {
                control_object(header, self.kind(), json!(total.to_string()))
            }
            Packet::TransferFailed(header, total) => control_object(
                header,
                self.kind(),
                total.map(|total| json!(total.to_string())).unwrap_or(Value::Null),
            ),
            Packet::Discover(header)
            | Packet::Respond(header)
            | Packet::Goodbye(header)
            | Packet::ConsentGranted(header)
            | Packet::Quit(header) => control_object(header, self.kind(), Value::Null),
        };
        format!("{}\n", object)
    }

    /// Decodes one packet. Surrounding whitespace (the newline terminator) is ignored.
    pub fn decode(text: &str) -> Result<Packet, DecodeError> {
        let envelope: Envelope =
            serde_json::from_str(text.trim()).map_err(|_| DecodeError::Malformed)?;
        envelope.into_packet()
    }
}

fn control_object(header: &Header, kind: PacketKind, payload: Value) -> Value {
    json!({
        "NAME": header.alias,
        "MY_IP": header.address.to_string(),
        "TYPE": kind.as_str(),
        "PAYLOAD": payload,
    })
}

/// Raw field set of a wire object. Any key can be missing; the shape is checked later.
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "NAME")]
    name: Option<String>,
    #[serde(rename = "MY_IP")]
    address: Option<String>,
    #[serde(rename = "TYPE")]
    kind: Option<String>,
    // A present but null PAYLOAD is valid, an absent one is not.
    #[serde(rename = "PAYLOAD", default, deserialize_with = "present")]
    payload: Option<Value>,
    #[serde(rename = "SERIAL")]
    serial: Option<i64>,
    #[serde(rename = "RWND")]
    window: Option<i64>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where D: Deserializer<'de> {
    Value::deserialize(deserializer).map(Some)
}

impl Envelope {
    fn is_control(&self) -> bool {
        self.name.is_some() && self.address.is_some() && self.kind.is_some() && self.payload.is_some()
    }

    fn is_data(&self) -> bool {
        self.serial.is_some() && self.window.is_some()
    }

    fn into_packet(self) -> Result<Packet, DecodeError> {
        let kind = match self.kind.as_deref() {
            Some(kind) => {
                PacketKind::from_str(kind).map_err(|_| DecodeError::UnknownType(kind.into()))?
            }
            None if self.is_data() => return self.acknowledge(),
            None => return Err(DecodeError::ShapeMismatch),
        };

        let packet = match kind {
            // Acknowledgments may come with the control fields too (older peers add them).
            PacketKind::Acknowledge => return self.acknowledge(),
            _ if !self.is_control() || self.is_data() => return Err(DecodeError::ShapeMismatch),
            PacketKind::Discover => Packet::Discover(self.header()?),
            PacketKind::Respond => Packet::Respond(self.header()?),
            PacketKind::Goodbye => Packet::Goodbye(self.header()?),
            PacketKind::ConsentGranted => Packet::ConsentGranted(self.header()?),
            PacketKind::Quit => Packet::Quit(self.header()?),
            PacketKind::Message => match self.payload() {
                Value::String(text) => Packet::Message(self.header()?, text.clone()),
                _ => return Err(DecodeError::MissingField("PAYLOAD")),
            },
            PacketKind::Allow => match self.payload() {
                Value::String(filename) if !filename.is_empty() => {
                    Packet::Allow(self.header()?, filename.clone())
                }
                _ => return Err(DecodeError::MissingField("PAYLOAD")),
            },
            PacketKind::FileChunk => {
                let serial = self.serial.ok_or(DecodeError::MissingField("SERIAL"))?;
                if serial < Chunk::PROBE_SERIAL {
                    return Err(DecodeError::InvalidField("SERIAL", serial.to_string()))
                }
                let payload = match self.payload() {
                    Value::String(payload) => payload.clone(),
                    Value::Null => String::new(),
                    other => return Err(DecodeError::InvalidField("PAYLOAD", other.to_string())),
                };
                Packet::FileChunk(self.header()?, Chunk { serial, payload })
            }
            PacketKind::TransferSucceeded => match parse_count(self.payload()) {
                Some(total) => Packet::TransferSucceeded(self.header()?, total),
                None => {
                    return Err(DecodeError::InvalidField("PAYLOAD", self.payload().to_string()))
                }
            },
            PacketKind::TransferFailed => {
                Packet::TransferFailed(self.header()?, parse_count(self.payload()))
            }
        };
        Ok(packet)
    }

    fn acknowledge(&self) -> Result<Packet, DecodeError> {
        let serial = self.serial.ok_or(DecodeError::MissingField("SERIAL"))?;
        let window = self.window.ok_or(DecodeError::MissingField("RWND"))?;
        Ok(Packet::Acknowledge(Acknowledge { serial, window }))
    }

    fn header(&self) -> Result<Header, DecodeError> {
        let address = self.address.as_deref().unwrap_or_default();
        Ok(Header {
            alias: self.name.clone().unwrap_or_default(),
            address: address
                .parse()
                .map_err(|_| DecodeError::InvalidField("MY_IP", address.into()))?,
        })
    }

    fn payload(&self) -> &Value {
        self.payload.as_ref().unwrap_or(&Value::Null)
    }
}

/// Chunk counts are sent as text but older peers send them as numbers.
fn parse_count(value: &Value) -> Option<usize> {
    match value {
        Value::String(text) => text.trim().parse().ok(),
        Value::Number(number) => number.as_u64().map(|n| n as usize),
        _ => None,
    }
}

/// Reason of a rejected packet.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum DecodeError {
    /// The text is not a JSON object.
    Malformed,
    UnknownType(String),
    /// The field set matches neither the control nor the data-channel shape.
    ShapeMismatch,
    MissingField(&'static str),
    InvalidField(&'static str, String),
}

impl std::error::Error for DecodeError {}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DecodeError::Malformed => write!(f, "Malformed packet"),
            DecodeError::UnknownType(kind) => write!(f, "Unknown packet type '{}'", kind),
            DecodeError::ShapeMismatch => write!(f, "Fields match no packet shape"),
            DecodeError::MissingField(field) => write!(f, "Missing field {}", field),
            DecodeError::InvalidField(field, value) => {
                write!(f, "Invalid value for {}: {}", field, value)
            }
        }
    }
}
