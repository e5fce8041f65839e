//! Shared CLI helpers and small reusable Clap fragments

use clap::Parser;
use std::path::PathBuf;

/// Options for the block feeder daemon
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "incloadd - serves package blocks to an incremental loader")]
pub struct FeederOpts {
    /// Unix socket to listen on
    #[arg(long, default_value = "/tmp/incload-feed.sock")]
    pub socket: PathBuf,

    /// Files to serve, in file-index order
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Block records per chunk
    #[arg(long, default_value_t = 32)]
    pub chunk_blocks: usize,

    /// Append a JSONL feed log here
    #[arg(long)]
    pub feed_log: Option<PathBuf>,

    /// Session label recorded in the feed log
    #[arg(long, default_value = "local")]
    pub session: String,
}
