//! Reliable file transfer over datagrams.
//!
//! A file is sent as base64 chunks, one per datagram, each one acknowledged by the receiver.
//! Acknowledgments carry the receiver window: the sender suspends itself when the window is low
//! and probes the receiver until it recovers.

pub mod chunk;
pub mod ledger;
pub mod sender;
pub mod receiver;

pub use sender::{CancelHandle, OutboundTransfer};
pub use receiver::{FileOffer, InboundTransfer};

use std::net::{Ipv4Addr};
use std::io::{self};

/// Lifecycle of the send side of a transfer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SendPhase {
    Idle,
    /// `Allow` sent, waiting for the receiver to accept it.
    AwaitingConsent,
    Transferring,
    /// The receiver window is low: no chunk is sent until a probe reports recovery.
    Suspended,
    Completed,
    Failed,
    Cancelled,
}

impl SendPhase {
    pub fn is_finished(self) -> bool {
        matches!(self, SendPhase::Completed | SendPhase::Failed | SendPhase::Cancelled)
    }
}

/// Summary of a completed send.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct TransferReport {
    pub total_chunks: usize,
    /// Datagrams sent again because their first acknowledgment never arrived.
    pub resent: usize,
    /// Times the sender was suspended by a low receiver window.
    pub suspensions: usize,
}

#[derive(Debug)]
pub enum TransferError {
    /// The send was cancelled before the receiver accepted it.
    Cancelled,
    /// The `Allow` request could not be delivered.
    ConsentUnreachable(Ipv4Addr),
    /// A chunk, or the probe if the serial is `-1`, was never acknowledged.
    PacketLoss { serial: i64 },
    /// Another send of this node is still running.
    SenderBusy,
    /// A file is already being received.
    ReceiverBusy,
    /// The offer was already answered or never existed.
    NoSuchOffer,
    Io(io::Error),
}

impl std::error::Error for TransferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransferError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TransferError::Cancelled => write!(f, "Transfer cancelled"),
            TransferError::ConsentUnreachable(peer) => {
                write!(f, "Unable to ask {} for consent", peer)
            }
            TransferError::PacketLoss { serial } if *serial < 0 => {
                write!(f, "The receiver stopped answering probes")
            }
            TransferError::PacketLoss { serial } => {
                write!(f, "Chunk {} was never acknowledged", serial)
            }
            TransferError::SenderBusy => write!(f, "Another file is being sent"),
            TransferError::ReceiverBusy => write!(f, "Another file is being received"),
            TransferError::NoSuchOffer => write!(f, "No pending offer matches"),
            TransferError::Io(err) => write!(f, "{}", err),
        }
    }
}

impl From<io::Error> for TransferError {
    fn from(err: io::Error) -> Self {
        TransferError::Io(err)
    }
}

/// Why a download produced no file.
#[derive(Debug)]
pub enum ReceiveError {
    /// The sender abandoned the transfer.
    Aborted,
    /// Some serials below the reported total never arrived.
    Incomplete { missing: usize, total: usize },
    InvalidPayload(base64::DecodeError),
    Io(io::Error),
}

impl std::error::Error for ReceiveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReceiveError::InvalidPayload(err) => Some(err),
            ReceiveError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReceiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ReceiveError::Aborted => write!(f, "The sender aborted the transfer"),
            ReceiveError::Incomplete { missing, total } => {
                write!(f, "{} of {} chunks are missing", missing, total)
            }
            ReceiveError::InvalidPayload(err) => write!(f, "Invalid file content: {}", err),
            ReceiveError::Io(err) => write!(f, "Unable to write the file: {}", err),
        }
    }
}

impl From<io::Error> for ReceiveError {
    fn from(err: io::Error) -> Self {
        ReceiveError::Io(err)
    }
}
