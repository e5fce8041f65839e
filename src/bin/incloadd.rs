//! incloadd - the peer side of the streaming channel, for local testing
//!
//! Speaks the loader's wire protocol over a unix socket: OKAY handshake,
//! length-prefixed chunks of block records, the all-zero sentinel, then
//! drains request commands until EXIT.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use incload::cli::FeederOpts;
use incload::incfs::BLOCK_SIZE;
use incload::log::{FeedLog, FeedLogEntry, FeedStatus};
use incload::protocol::{request, COMMAND_SIZE, OKAY};
use incload::wire::{decode_request, encode_header, write_chunk, BlockHeader};

fn main() -> Result<()> {
    let opts = FeederOpts::parse();
    if opts.chunk_blocks == 0 {
        bail!("--chunk-blocks must be positive");
    }

    if opts.socket.exists() {
        std::fs::remove_file(&opts.socket)
            .with_context(|| format!("failed to remove stale socket {}", opts.socket.display()))?;
    }
    let listener = UnixListener::bind(&opts.socket)
        .with_context(|| format!("failed to bind {}", opts.socket.display()))?;
    println!(
        "incloadd\n  Socket: {}\n  Files: {}",
        opts.socket.display(),
        opts.files.len()
    );

    for stream in listener.incoming() {
        let stream = stream.context("accept failed")?;
        if let Err(e) = serve(stream, &opts) {
            eprintln!("session failed: {e:#}");
        }
    }
    Ok(())
}

fn serve(mut stream: UnixStream, opts: &FeederOpts) -> Result<()> {
    stream.write_all(OKAY).context("failed to send handshake")?;

    let feed_log = opts.feed_log.as_deref().map(FeedLog::new);
    for (file_idx, path) in opts.files.iter().enumerate() {
        let file_idx = file_idx as i16;
        let mut entry = FeedLogEntry::new(&opts.session, path, file_idx);
        match serve_file(&mut stream, file_idx, path, opts.chunk_blocks) {
            Ok((blocks, bytes)) => {
                entry.blocks_sent = blocks;
                entry.bytes_sent = bytes;
                entry.status = FeedStatus::Completed;
            }
            Err(e) => {
                entry.status = FeedStatus::Failed;
                entry.error = Some(format!("{e:#}"));
                if let Some(log) = &feed_log {
                    let _ = log.add_entry(&entry);
                }
                return Err(e);
            }
        }
        if let Some(log) = &feed_log {
            log.add_entry(&entry)?;
        }
    }

    // no more data; tell the loader to shut the session down
    let sentinel = BlockHeader {
        file_idx: -1,
        block_type: 0,
        compression_type: 0,
        block_idx: 0,
        block_size: 0,
    };
    write_chunk(&mut stream, &encode_header(&sentinel)).context("failed to send sentinel")?;

    drain_requests(&mut stream)
}

/// Push every block of one file, `chunk_blocks` records per chunk. Returns
/// (blocks, bytes) sent.
fn serve_file(
    stream: &mut UnixStream,
    file_idx: i16,
    path: &Path,
    chunk_blocks: usize,
) -> Result<(u64, u64)> {
    let data = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    if data.is_empty() {
        bail!("{} is empty", path.display());
    }

    let mut blocks_sent = 0u64;
    let mut bytes_sent = 0u64;
    let mut records = Vec::with_capacity(chunk_blocks * (BLOCK_SIZE + 10));
    for (chunk_idx, blocks) in data.chunks(BLOCK_SIZE * chunk_blocks).enumerate() {
        records.clear();
        for (i, block) in blocks.chunks(BLOCK_SIZE).enumerate() {
            let header = BlockHeader {
                file_idx,
                block_type: 0,
                compression_type: 0,
                block_idx: (chunk_idx * chunk_blocks + i) as i32,
                block_size: block.len() as i16,
            };
            records.extend_from_slice(&encode_header(&header));
            records.extend_from_slice(block);
            blocks_sent += 1;
            bytes_sent += block.len() as u64;
        }
        write_chunk(stream, &records)
            .with_context(|| format!("failed to send a chunk of {}", path.display()))?;
    }
    Ok((blocks_sent, bytes_sent))
}

/// Read request commands until EXIT or the peer hangs up.
fn drain_requests(stream: &mut UnixStream) -> Result<()> {
    let mut command = [0u8; COMMAND_SIZE];
    loop {
        if let Err(e) = stream.read_exact(&mut command) {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Ok(());
            }
            return Err(e).context("failed to read a request command");
        }
        let Some((request_type, file_idx, block_idx)) = decode_request(&command) else {
            bail!("bad request command magic");
        };
        match request_type {
            request::EXIT => {
                println!("EXIT received");
                return Ok(());
            }
            request::BLOCK_MISSING => {
                println!("BLOCK_MISSING file={file_idx} block={block_idx}");
            }
            request::PREFETCH => {
                println!("PREFETCH file={file_idx} block={block_idx}");
            }
            other => {
                println!("unknown request type {other}");
            }
        }
    }
}
