//! Contract with the incremental filesystem collaborator
//!
//! The loader never issues IncFS ioctls itself; block writes, per-file
//! handles and parameter flips all go through `FilesystemConnector`, and the
//! filesystem drives the loader back through the `DataLoader` hooks. Keeping
//! this seam as traits lets the block pipeline run against a mock filesystem
//! in tests.

use anyhow::Result;
use std::os::fd::{OwnedFd, RawFd};

/// IncFS data-file block size. Every block submitted during an install is
/// exactly this long, except at most one short trailing block per input.
pub const BLOCK_SIZE: usize = 4096;

/// Opaque 16-byte filesystem file identifier.
///
/// For streaming installs the loader overloads byte 0 with the metadata mode
/// tag and bytes 1..15 with the decimal text of the peer-assigned file index
/// (see `source::file_id_from_index`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct FileId(pub [u8; 16]);

impl FileId {
    pub fn is_valid(&self) -> bool {
        self.0 != [0u8; 16]
    }
}

/// Block kind carried to the filesystem: file body or verity-tree node.
/// Newtype over the wire value so unknown kinds pass through untouched.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BlockKind(pub i8);

impl BlockKind {
    pub const DATA: BlockKind = BlockKind(0);
    pub const HASH: BlockKind = BlockKind(1);
}

/// Compression of a block payload. Passed through opaquely; the filesystem
/// decides what it accepts.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CompressionKind(pub i8);

impl CompressionKind {
    pub const NONE: CompressionKind = CompressionKind(0);
    pub const LZ4: CompressionKind = CompressionKind(1);
    pub const ZSTD: CompressionKind = CompressionKind(2);
}

/// One block-write instruction. `file_fd` must stay open for the duration of
/// the `write_blocks` call that consumes the instruction; the payload length
/// is the block's data size.
#[derive(Clone, Copy, Debug)]
pub struct DataBlock<'a> {
    pub file_fd: RawFd,
    pub page_index: i32,
    pub compression: CompressionKind,
    pub kind: BlockKind,
    pub data: &'a [u8],
}

/// Filesystem parameters the loader may flip at runtime.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsParams {
    pub read_logs_enabled: bool,
}

/// A page fault the filesystem could not serve: somebody read a block that
/// has not been written yet.
#[derive(Clone, Copy, Debug)]
pub struct PendingRead {
    pub id: FileId,
    pub block: i32,
}

/// A served page read, reported for tracing.
#[derive(Clone, Copy, Debug)]
pub struct PageRead {
    pub id: FileId,
    pub block: i32,
    pub boot_clock_ts_us: u64,
}

/// One file of the install set handed to `on_prepare_image`.
#[derive(Clone, Debug)]
pub struct InstallFile {
    pub name: String,
    pub size: i64,
    pub metadata: Vec<u8>,
    pub id: FileId,
}

pub trait FilesystemConnector: Send + Sync {
    /// Open a per-file write handle for block-level writes.
    fn open_for_special_ops(&self, id: &FileId) -> Result<OwnedFd>;

    /// Submit a batch of block writes. `Err` is the fatal negative result;
    /// `Ok(n)` with `n < blocks.len()` is a partial write the caller must
    /// decide on.
    fn write_blocks(&self, blocks: &[DataBlock<'_>]) -> Result<usize>;

    fn set_params(&self, params: FsParams);
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LoaderStatus {
    Unrecoverable,
}

/// Install-session status sink; the higher layer decides whether to abandon
/// the session.
pub trait StatusListener: Send + Sync {
    fn report_status(&self, status: LoaderStatus);
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LoaderType {
    None,
    Streaming,
    Incremental,
}

/// Creation parameters for a loader instance.
#[derive(Clone, Debug)]
pub struct LoaderParams {
    pub loader_type: LoaderType,
    /// Opaque install argument, resolved through the host-process bridge.
    pub arguments: String,
}

/// Lifecycle and callback surface the filesystem drives. All hooks except
/// `on_prepare_image` run on the filesystem's own threads.
pub trait DataLoader: Send + Sync {
    fn on_create(&self) -> bool {
        true
    }
    fn on_start(&self) -> bool {
        true
    }
    fn on_stop(&self) {}
    fn on_destroy(&self) {}

    /// Feed the non-streaming inputs of every install file into the image;
    /// hand off to the streaming loop if any input declares itself streaming.
    fn on_prepare_image(&self, files: &[InstallFile]) -> bool;

    /// Page faults to translate into outbound block requests.
    fn on_pending_reads(&self, reads: &[PendingRead]);

    /// Served page reads, traced when the ambient tag is on.
    fn on_page_reads(&self, reads: &[PageRead]);
}
