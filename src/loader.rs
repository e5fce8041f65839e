//! The incremental-install loader
//!
//! Owns the whole block pipeline: the prepare-image driver that drains
//! non-streaming inputs through the assembler, the receiver thread that
//! serves the bidirectional streaming channel, and the filesystem callbacks
//! that translate page faults into outbound block requests.
//!
//! Thread shape: the filesystem drives prepare on its own thread; streaming
//! adds exactly one receiver thread; the process-wide trace watcher is
//! shared. All outbound channel writes go through one mutex-guarded fd.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::assembler::{copy_to_fs, BUFFER_SIZE};
use crate::incfs::{
    BlockKind, CompressionKind, DataBlock, DataLoader, FilesystemConnector, FsParams, InstallFile,
    LoaderParams, LoaderStatus, LoaderType, PageRead, PendingRead, StatusListener,
};
use crate::logger::Logger;
use crate::protocol::{request, timeouts, OKAY};
use crate::shell::ShellCommandConnector;
use crate::source::{file_id_from_index, file_index_from_id, open_inputs, MetadataMode};
use crate::trace::{self, ReadLogsListener};
use crate::wire::{decode_header, read_chunk, send_request};

/// Build a loader for an install. Only incremental installs are supported;
/// anything else yields no loader.
pub fn new_loader(
    params: &LoaderParams,
    fs: Arc<dyn FilesystemConnector>,
    status: Arc<dyn StatusListener>,
    shell: Arc<dyn ShellCommandConnector>,
    logger: Arc<dyn Logger>,
) -> Option<IncrementalLoader> {
    if params.loader_type != LoaderType::Incremental {
        return None;
    }
    Some(IncrementalLoader {
        inner: Arc::new(LoaderInner {
            args: params.arguments.clone(),
            fs,
            status,
            shell,
            logger,
            outbound: Mutex::new(Outbound::default()),
            event_fd: Mutex::new(None),
            receiver: Mutex::new(None),
            stop_receiving: AtomicBool::new(false),
            read_logs_enabled: AtomicBool::new(false),
        }),
    })
}

pub struct IncrementalLoader {
    inner: Arc<LoaderInner>,
}

/// Outbound half of the streaming channel plus the per-session prefetch
/// bookkeeping that lives under the same lock.
#[derive(Default)]
struct Outbound {
    fd: Option<File>,
    requested_files: HashSet<i16>,
}

struct LoaderInner {
    args: String,
    fs: Arc<dyn FilesystemConnector>,
    status: Arc<dyn StatusListener>,
    shell: Arc<dyn ShellCommandConnector>,
    logger: Arc<dyn Logger>,
    outbound: Mutex<Outbound>,
    event_fd: Mutex<Option<OwnedFd>>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    stop_receiving: AtomicBool,
    read_logs_enabled: AtomicBool,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum PollEvent {
    Timeout,
    Readable,
    Cancelled,
}

fn wait_for_data_or_signal(fd: RawFd, event_fd: RawFd) -> Result<PollEvent> {
    let mut pfds = [
        libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: event_fd,
            events: libc::POLLIN,
            revents: 0,
        },
    ];
    let res = unsafe { libc::poll(pfds.as_mut_ptr(), 2, timeouts::POLL_MS) };
    if res == 0 {
        return Ok(PollEvent::Timeout);
    }
    if res < 0 {
        return Err(std::io::Error::last_os_error()).context("poll failed");
    }
    // the stop signal wins over pending data
    if pfds[1].revents & libc::POLLIN != 0 {
        return Ok(PollEvent::Cancelled);
    }
    if pfds[0].revents & libc::POLLIN != 0 {
        return Ok(PollEvent::Readable);
    }
    bail!(
        "unexpected poll events: {:#x}/{:#x}",
        pfds[0].revents,
        pfds[1].revents
    );
}

fn new_event_fd() -> Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error()).context("failed to create eventfd");
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn signal_event_fd(fd: &OwnedFd) {
    let value: u64 = 1;
    unsafe {
        libc::write(
            fd.as_raw_fd(),
            &value as *const u64 as *const libc::c_void,
            std::mem::size_of::<u64>(),
        );
    }
}

impl IncrementalLoader {
    fn listener_weak(&self) -> std::sync::Weak<dyn ReadLogsListener> {
        let as_dyn: Arc<dyn ReadLogsListener> = self.inner.clone();
        Arc::downgrade(&as_dyn)
    }
}

impl DataLoader for IncrementalLoader {
    fn on_create(&self) -> bool {
        self.inner.update_read_logs_state(trace::is_enabled());
        trace::watcher().register(self.listener_weak());
        true
    }

    fn on_stop(&self) {
        self.inner.stop_receiving.store(true, Ordering::Relaxed);
        if let Some(event_fd) = self.inner.event_fd.lock().as_ref() {
            signal_event_fd(event_fd);
        }
        let handle = self.inner.receiver.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn on_destroy(&self) {
        trace::watcher().unregister(&self.listener_weak());
        // the receiver must have been joined by on_stop
        debug_assert!(self.inner.receiver.lock().is_none());
    }

    fn on_prepare_image(&self, files: &[InstallFile]) -> bool {
        self.inner.logger.prepare_start(files.len());
        match LoaderInner::prepare_image(&self.inner, files) {
            Ok(()) => {
                self.inner.logger.prepare_done(files.len());
                true
            }
            Err(e) => {
                self.inner.logger.error("prepare_image", &format!("{e:#}"));
                false
            }
        }
    }

    fn on_pending_reads(&self, reads: &[PendingRead]) {
        let mut out = self.inner.outbound.lock();
        let Outbound {
            fd,
            requested_files,
        } = &mut *out;
        let Some(fd) = fd.as_mut() else {
            return;
        };
        for read in reads {
            let Some(file_idx) = file_index_from_id(&read.id) else {
                self.inner.logger.error(
                    "pending_reads",
                    &format!("no file index for id {:?}, ignoring", read.id),
                );
                continue;
            };
            // the prefetch is advisory and sent once per file; the missing
            // request is the binding demand
            if requested_files.insert(file_idx)
                && send_request(fd, request::PREFETCH, file_idx, read.block).is_err()
            {
                requested_files.remove(&file_idx);
            }
            let _ = send_request(fd, request::BLOCK_MISSING, file_idx, read.block);
        }
    }

    fn on_page_reads(&self, reads: &[PageRead]) {
        if !trace::is_enabled() {
            return;
        }
        for run in coalesce_page_reads(reads) {
            let file_idx = file_index_from_id(&run.id).unwrap_or(-1);
            trace::emit(&format!(
                "page_read: index={} count={} file={}",
                run.first_block, run.count, file_idx
            ));
        }
    }
}

impl Drop for IncrementalLoader {
    fn drop(&mut self) {
        trace::watcher().unregister(&self.listener_weak());
    }
}

impl ReadLogsListener for LoaderInner {
    fn update_read_logs_state(&self, enabled: bool) {
        if enabled != self.read_logs_enabled.swap(enabled, Ordering::Relaxed) {
            self.fs.set_params(FsParams {
                read_logs_enabled: enabled,
            });
        }
    }
}

impl LoaderInner {
    fn prepare_image(this: &Arc<Self>, files: &[InstallFile]) -> Result<()> {
        let cmd = this
            .shell
            .lookup_shell_command(&this.args)
            .context("missing shell command")?;

        let mut buffer = Vec::with_capacity(BUFFER_SIZE);
        let mut streaming: Option<(File, MetadataMode)> = None;

        for file in files {
            let inputs = open_inputs(this.shell.as_ref(), &cmd, file.size, &file.metadata)
                .with_context(|| format!("failed to open an input for {}", file.name))?;
            if inputs.is_empty() {
                bail!("no inputs resolved for {}", file.name);
            }

            let incfs_fd = this
                .fs
                .open_for_special_ops(&file.id)
                .with_context(|| format!("failed to open the image file for {}", file.name))?;

            let mut copied: u64 = 0;
            for input in &inputs {
                if input.streaming && streaming.is_none() {
                    let dup = input
                        .file
                        .try_clone()
                        .context("failed to duplicate the streaming fd")?;
                    streaming = Some((dup, input.mode));
                }
                copied += copy_to_fs(
                    this.fs.as_ref(),
                    incfs_fd.as_fd(),
                    input.size,
                    input.kind,
                    &mut (&input.file),
                    input.wait_on_eof,
                    &mut buffer,
                )
                .with_context(|| format!("failed to copy {} into the image", file.name))?;
            }
            this.logger.copy_done(&file.name, copied);
        }

        if let Some((channel, mode)) = streaming {
            this.logger.info("prepare done, proceeding to streaming");
            Self::init_streaming(this, channel, mode)?;
        }
        Ok(())
    }

    fn init_streaming(this: &Arc<Self>, mut channel: File, mode: MetadataMode) -> Result<()> {
        let event_fd = new_event_fd()?;
        let event_raw = event_fd.as_raw_fd();
        *this.event_fd.lock() = Some(event_fd);

        let mut okay = [0u8; 4];
        channel
            .read_exact(&mut okay)
            .context("failed to receive handshake")?;
        if &okay != OKAY {
            bail!(
                "bad handshake {:?}, expecting {:?}",
                String::from_utf8_lossy(&okay),
                String::from_utf8_lossy(OKAY)
            );
        }

        {
            let mut out = this.outbound.lock();
            match channel.try_clone() {
                Ok(dup) => out.fd = Some(dup),
                // outbound requests will be skipped; inbound still works
                Err(e) => this
                    .logger
                    .error("init_streaming", &format!("failed to duplicate channel fd: {e}")),
            }
        }

        let inner = Arc::clone(this);
        let handle = thread::Builder::new()
            .name("incload-receiver".into())
            .spawn(move || inner.receiver(channel, mode, event_raw))
            .context("failed to spawn the receiver thread")?;
        *this.receiver.lock() = Some(handle);

        this.logger.streaming_start();
        Ok(())
    }

    fn receiver(self: Arc<Self>, mut channel: File, mode: MetadataMode, event_fd: RawFd) {
        let mut data = Vec::new();
        let mut write_fds: HashMap<i16, OwnedFd> = HashMap::new();

        while !self.stop_receiving.load(Ordering::Relaxed) {
            match wait_for_data_or_signal(channel.as_raw_fd(), event_fd) {
                Ok(PollEvent::Timeout) => continue,
                Ok(PollEvent::Cancelled) => {
                    self.logger.info("stop signal received, sending exit");
                    let _ = send_request(&mut channel, request::EXIT, -1, -1);
                    break;
                }
                Ok(PollEvent::Readable) => {}
                Err(e) => {
                    self.logger.error("receiver", &format!("{e:#}"));
                    self.status.report_status(LoaderStatus::Unrecoverable);
                    break;
                }
            }

            if let Err(e) = read_chunk(&mut channel, &mut data) {
                self.logger
                    .error("receiver", &format!("failed to read a chunk: {e:#}"));
                self.status.report_status(LoaderStatus::Unrecoverable);
                break;
            }

            self.apply_chunk(&data, mode, &mut channel, &mut write_fds);
        }

        self.outbound.lock().fd = None;
    }

    /// Walk one chunk's (header, payload) records and commit them as a
    /// single batch.
    fn apply_chunk(
        &self,
        data: &[u8],
        mode: MetadataMode,
        channel: &mut File,
        write_fds: &mut HashMap<i16, OwnedFd>,
    ) {
        let mut rest: &[u8] = data;
        let mut instructions: Vec<DataBlock<'_>> = Vec::new();

        while !rest.is_empty() {
            let Some(header) = decode_header(&mut rest) else {
                self.logger.error("receiver", "truncated block header");
                self.stop_receiving.store(true, Ordering::Relaxed);
                break;
            };
            if header.is_sentinel() {
                self.logger.info(&format!(
                    "stop signal received, sending exit ({} bytes remaining)",
                    rest.len()
                ));
                let _ = send_request(channel, request::EXIT, -1, -1);
                self.stop_receiving.store(true, Ordering::Relaxed);
                break;
            }
            if !header.is_valid() {
                self.logger.error("receiver", "invalid block header");
                self.stop_receiving.store(true, Ordering::Relaxed);
                break;
            }
            let block_size = header.block_size as usize;
            if rest.len() < block_size {
                self.logger.error("receiver", "truncated block payload");
                self.stop_receiving.store(true, Ordering::Relaxed);
                break;
            }
            let (payload, after) = rest.split_at(block_size);
            rest = after;

            let file_id = file_id_from_index(mode, header.file_idx);
            if !file_id.is_valid() {
                self.logger.error(
                    "receiver",
                    &format!("unknown data destination for file {}, ignoring", header.file_idx),
                );
                continue;
            }

            if !write_fds.contains_key(&header.file_idx) {
                match self.fs.open_for_special_ops(&file_id) {
                    Ok(fd) => {
                        write_fds.insert(header.file_idx, fd);
                    }
                    Err(e) => {
                        self.logger.error(
                            "receiver",
                            &format!("failed to open file {} for writing: {e}", header.file_idx),
                        );
                        break;
                    }
                }
            }

            instructions.push(DataBlock {
                file_fd: write_fds[&header.file_idx].as_raw_fd(),
                page_index: header.block_idx,
                compression: CompressionKind(header.compression_type),
                kind: BlockKind(header.block_type),
                data: payload,
            });
        }

        self.write_instructions(&instructions);
    }

    fn write_instructions(&self, instructions: &[DataBlock<'_>]) {
        if instructions.is_empty() {
            return;
        }
        match self.fs.write_blocks(instructions) {
            Ok(n) if n == instructions.len() => {}
            Ok(n) => self.logger.error(
                "receiver",
                &format!("partial block write: {} of {}", n, instructions.len()),
            ),
            Err(e) => self
                .logger
                .error("receiver", &format!("failed to write blocks: {e}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct TracedRead {
    id: crate::incfs::FileId,
    first_block: i32,
    count: i32,
}

/// Merge runs of consecutive blocks of the same file into single trace
/// records.
fn coalesce_page_reads(reads: &[PageRead]) -> Vec<TracedRead> {
    let mut out = Vec::new();
    let mut last: Option<TracedRead> = None;
    for read in reads {
        match &mut last {
            Some(run) if read.id == run.id && read.block == run.first_block + run.count => {
                run.count += 1;
            }
            _ => {
                if let Some(run) = last.take() {
                    out.push(run);
                }
                last = Some(TracedRead {
                    id: read.id,
                    first_block: read.block,
                    count: 1,
                });
            }
        }
    }
    if let Some(run) = last {
        out.push(run);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    fn page_read(id: crate::incfs::FileId, block: i32) -> PageRead {
        PageRead {
            id,
            block,
            boot_clock_ts_us: 0,
        }
    }

    #[test]
    fn test_coalesce_merges_consecutive_blocks_of_one_file() {
        let a = file_id_from_index(MetadataMode::Streaming, 1);
        let b = file_id_from_index(MetadataMode::Streaming, 2);
        let reads = [
            page_read(a, 4),
            page_read(a, 5),
            page_read(a, 6),
            page_read(b, 6),
            page_read(a, 7),
            page_read(a, 9),
        ];
        let runs = coalesce_page_reads(&reads);
        assert_eq!(runs.len(), 4);
        assert_eq!((runs[0].first_block, runs[0].count), (4, 3));
        assert_eq!(runs[0].id, a);
        assert_eq!((runs[1].first_block, runs[1].count), (6, 1));
        assert_eq!(runs[1].id, b);
        assert_eq!((runs[2].first_block, runs[2].count), (7, 1));
        assert_eq!((runs[3].first_block, runs[3].count), (9, 1));
    }

    #[test]
    fn test_coalesce_empty_input() {
        assert!(coalesce_page_reads(&[]).is_empty());
    }

    #[test]
    fn test_poll_sees_readable_channel() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let event_fd = new_event_fd().unwrap();
        a.write_all(b"x").unwrap();
        let res = wait_for_data_or_signal(b.as_raw_fd(), event_fd.as_raw_fd()).unwrap();
        assert_eq!(res, PollEvent::Readable);
    }

    #[test]
    fn test_poll_prefers_the_stop_signal() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let event_fd = new_event_fd().unwrap();
        a.write_all(b"x").unwrap();
        signal_event_fd(&event_fd);
        let res = wait_for_data_or_signal(b.as_raw_fd(), event_fd.as_raw_fd()).unwrap();
        assert_eq!(res, PollEvent::Cancelled);
    }
}
