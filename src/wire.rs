//! Wire codec for the streaming channel
//!
//! Inbound traffic is length-prefixed chunks of concatenated
//! (header, payload) records; outbound traffic is fixed 12-byte request
//! commands. Both directions share one bidirectional fd.

use anyhow::{bail, Context, Result};
use std::io::{Read, Write};

use crate::protocol::{COMMAND_SIZE, HEADER_SIZE, INCR_MAGIC};

/// Decoded block header. Field widths match the wire layout; signedness is
/// load-bearing (the sentinel is fileIdx == -1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub file_idx: i16,
    pub block_type: i8,
    pub compression_type: i8,
    pub block_idx: i32,
    pub block_size: i16,
}

impl BlockHeader {
    /// Shutdown sentinel: fileIdx == -1 and every other field zero. On the
    /// wire this is `FF FF` followed by eight zero bytes; match after
    /// decoding, never against a raw byte pattern.
    pub fn is_sentinel(&self) -> bool {
        self.file_idx == -1
            && self.block_type == 0
            && self.compression_type == 0
            && self.block_idx == 0
            && self.block_size == 0
    }

    /// A header the receiver may act on: no negative field, payload present.
    pub fn is_valid(&self) -> bool {
        self.file_idx >= 0
            && self.block_size > 0
            && self.block_type >= 0
            && self.compression_type >= 0
            && self.block_idx >= 0
    }
}

/// Decode one header off the front of `data`, advancing the slice.
/// `None` when fewer than 10 bytes remain; content itself never fails here,
/// suspicious field values are the caller's problem (`is_valid`).
pub fn decode_header(data: &mut &[u8]) -> Option<BlockHeader> {
    if data.len() < HEADER_SIZE {
        return None;
    }
    let header = BlockHeader {
        file_idx: i16::from_be_bytes([data[0], data[1]]),
        block_type: data[2] as i8,
        compression_type: data[3] as i8,
        block_idx: i32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        block_size: i16::from_be_bytes([data[8], data[9]]),
    };
    *data = &data[HEADER_SIZE..];
    Some(header)
}

/// Encode one block header (feeder side and tests).
pub fn encode_header(header: &BlockHeader) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    buf[0..2].copy_from_slice(&header.file_idx.to_be_bytes());
    buf[2] = header.block_type as u8;
    buf[3] = header.compression_type as u8;
    buf[4..8].copy_from_slice(&header.block_idx.to_be_bytes());
    buf[8..10].copy_from_slice(&header.block_size.to_be_bytes());
    buf
}

/// Encode a 12-byte request command.
///
/// Wart kept for wire compatibility: the historical loader pushed the
/// integer fields through a host-order byte swap before writing, so behind
/// the little-endian magic the fields land byte-swapped from host order
/// (big-endian on the little-endian hosts that matter). Do not "fix" this.
pub fn encode_request(request_type: i16, file_idx: i16, block_idx: i32) -> [u8; COMMAND_SIZE] {
    let mut buf = [0u8; COMMAND_SIZE];
    buf[0..4].copy_from_slice(&INCR_MAGIC.to_le_bytes());
    buf[4..6].copy_from_slice(&request_type.swap_bytes().to_ne_bytes());
    buf[6..8].copy_from_slice(&file_idx.swap_bytes().to_ne_bytes());
    buf[8..12].copy_from_slice(&block_idx.swap_bytes().to_ne_bytes());
    buf
}

/// Decode a request command (feeder side). `None` on short input or bad
/// magic.
pub fn decode_request(bytes: &[u8]) -> Option<(i16, i16, i32)> {
    if bytes.len() < COMMAND_SIZE {
        return None;
    }
    let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if magic != INCR_MAGIC {
        return None;
    }
    let request_type = i16::from_ne_bytes([bytes[4], bytes[5]]).swap_bytes();
    let file_idx = i16::from_ne_bytes([bytes[6], bytes[7]]).swap_bytes();
    let block_idx = i32::from_ne_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]).swap_bytes();
    Some((request_type, file_idx, block_idx))
}

/// Write one request command atomically. A short write surfaces as an error
/// the caller treats as terminal for the channel.
pub fn send_request(
    out: &mut impl Write,
    request_type: i16,
    file_idx: i16,
    block_idx: i32,
) -> Result<()> {
    let command = encode_request(request_type, file_idx, block_idx);
    out.write_all(&command)
        .context("failed to write request command")?;
    Ok(())
}

/// Read one length-prefixed chunk into the reused `data` vector. Fails on a
/// short read or a non-positive length; both are terminal for the session.
pub fn read_chunk(input: &mut impl Read, data: &mut Vec<u8>) -> Result<()> {
    let mut prefix = [0u8; 4];
    input
        .read_exact(&mut prefix)
        .context("failed to read chunk length")?;
    let size = i32::from_be_bytes(prefix);
    if size <= 0 {
        bail!("non-positive chunk length: {}", size);
    }
    data.resize(size as usize, 0);
    input
        .read_exact(data)
        .context("failed to read chunk payload")?;
    Ok(())
}

/// Write one chunk of concatenated (header, payload) records (feeder side).
pub fn write_chunk(out: &mut impl Write, records: &[u8]) -> Result<()> {
    out.write_all(&(records.len() as i32).to_be_bytes())?;
    out.write_all(records)?;
    Ok(())
}
