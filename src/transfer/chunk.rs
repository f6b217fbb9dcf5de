use super::{ReceiveError};

use crate::packet::{Chunk, Header};

use base64::{Engine, engine::general_purpose::STANDARD};

use std::collections::{BTreeMap};
use std::convert::TryFrom;
use std::path::{Path};
use std::io::{self, ErrorKind};

/// Reads the whole file and splits it with [`chunk_bytes()`].
pub fn chunk_file(path: &Path, header: &Header, max_packet_len: usize) -> io::Result<Vec<Chunk>> {
    let data = std::fs::read(path)?;
    log::debug!("Read {} bytes from {}", data.len(), path.display());
    chunk_bytes(&data, header, max_packet_len)
}

/// Base64-encodes `data` and splits the text in chunks with serials `0..N`.
/// The `FILE` datagram of every chunk, sent with `header`, fits in `max_packet_len`.
/// Empty data produces no chunks.
pub fn chunk_bytes(data: &[u8], header: &Header, max_packet_len: usize) -> io::Result<Vec<Chunk>> {
    let budget = Chunk::payload_budget(header, max_packet_len);
    if budget == 0 {
        let msg = format!("A datagram of {} bytes can not carry file content", max_packet_len);
        return Err(io::Error::new(ErrorKind::InvalidInput, msg))
    }

    let encoded = STANDARD.encode(data);
    // Base64 is ASCII: every byte index is a char boundary.
    let chunks = (0..encoded.len())
        .step_by(budget)
        .enumerate()
        .map(|(serial, start)| {
            let end = (start + budget).min(encoded.len());
            Chunk::new(serial as i64, encoded[start..end].to_string())
        })
        .collect::<Vec<_>>();

    log::trace!("{} bytes split in {} chunks of up to {} bytes", data.len(), chunks.len(), budget);
    Ok(chunks)
}

/// Joins the payloads `0..total` and decodes them.
/// Nothing is decoded unless every serial is present.
/// `total` comes from the peer: only the received serials are walked, never the whole range.
pub fn reassemble(received: &BTreeMap<i64, String>, total: usize) -> Result<Vec<u8>, ReceiveError> {
    // A total beyond i64 can never be complete: serials are i64.
    let end = i64::try_from(total).unwrap_or(i64::MAX);
    let present = received.range(0..end).count();
    if present < total {
        return Err(ReceiveError::Incomplete { missing: total - present, total })
    }

    let encoded = received.range(0..end).map(|(_, payload)| payload.as_str()).collect::<String>();
    STANDARD.decode(encoded).map_err(ReceiveError::InvalidPayload)
}
