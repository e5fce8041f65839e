//! Block assembler
//!
//! Pulls bytes from one input fd into a shared 256 KiB staging buffer,
//! carves them into filesystem blocks, and submits batched write
//! instructions. Page indices are assigned monotonically from 0 per input;
//! the only short block an input may produce is its final one.

use anyhow::{bail, Context, Result};
use std::io::Read;
use std::os::fd::{AsRawFd, BorrowedFd};

use crate::incfs::{BlockKind, CompressionKind, DataBlock, FilesystemConnector, BLOCK_SIZE};
use crate::protocol::timeouts;

/// Staging buffer capacity, shared across all inputs of one prepare pass.
pub const BUFFER_SIZE: usize = 256 * 1024;

/// Largest batch one flush can submit.
pub const BLOCKS_COUNT: usize = BUFFER_SIZE / BLOCK_SIZE;

/// Copy up to `size` bytes from `input` into the per-file fs handle,
/// returning how many bytes actually arrived.
///
/// A read of 0 with `wait_on_eof` means the upstream pipe is still being
/// filled: sleep briefly and retry. Without `wait_on_eof` a read of 0 ends
/// the input early; the declared size is an upper bound for such inputs.
pub fn copy_to_fs(
    fs: &dyn FilesystemConnector,
    fs_fd: BorrowedFd<'_>,
    size: i64,
    kind: BlockKind,
    input: &mut impl Read,
    wait_on_eof: bool,
    buffer: &mut Vec<u8>,
) -> Result<u64> {
    let mut remaining = size;
    let mut total: u64 = 0;
    let mut block_cursor: i32 = 0;
    while remaining > 0 {
        let len = buffer.len();
        if BUFFER_SIZE - len < BLOCK_SIZE {
            flush(fs, fs_fd, kind, false, &mut block_cursor, buffer)?;
            continue;
        }

        let to_read = (remaining as usize).min(BUFFER_SIZE - len);
        buffer.resize(len + to_read, 0);
        match input.read(&mut buffer[len..len + to_read]) {
            Ok(0) => {
                buffer.truncate(len);
                if wait_on_eof {
                    std::thread::sleep(timeouts::EOF_WAIT);
                    continue;
                }
                break;
            }
            Ok(n) => {
                buffer.truncate(len + n);
                remaining -= n as i64;
                total += n as u64;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                buffer.truncate(len);
            }
            Err(e) => {
                buffer.truncate(len);
                return Err(e).context("failed to read install input");
            }
        }
    }

    if !buffer.is_empty() {
        flush(fs, fs_fd, kind, true, &mut block_cursor, buffer)?;
    }
    Ok(total)
}

/// Turn the buffered bytes into block instructions and submit them. Only an
/// `eof` flush may emit a short trailing block; otherwise the sub-block
/// remainder stays buffered for the next round.
fn flush(
    fs: &dyn FilesystemConnector,
    fs_fd: BorrowedFd<'_>,
    kind: BlockKind,
    eof: bool,
    block_cursor: &mut i32,
    buffer: &mut Vec<u8>,
) -> Result<()> {
    let mut blocks: Vec<DataBlock<'_>> = Vec::with_capacity(BLOCKS_COUNT);
    let mut consumed = 0;
    for chunk in buffer.chunks_exact(BLOCK_SIZE) {
        blocks.push(DataBlock {
            file_fd: fs_fd.as_raw_fd(),
            page_index: *block_cursor,
            compression: CompressionKind::NONE,
            kind,
            data: chunk,
        });
        *block_cursor += 1;
        consumed += BLOCK_SIZE;
    }
    if eof && consumed < buffer.len() {
        blocks.push(DataBlock {
            file_fd: fs_fd.as_raw_fd(),
            page_index: *block_cursor,
            compression: CompressionKind::NONE,
            kind,
            data: &buffer[consumed..],
        });
        *block_cursor += 1;
        consumed = buffer.len();
    }

    let submitted = blocks.len();
    let written = fs
        .write_blocks(&blocks)
        .context("failed to write blocks")?;
    buffer.drain(..consumed);

    if written != submitted {
        bail!("partial block write: {written} of {submitted}");
    }
    Ok(())
}
