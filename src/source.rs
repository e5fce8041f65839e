//! Input source multiplexer
//!
//! Every install file carries a metadata blob whose first byte selects where
//! its bytes come from: a staged local file (plus optional `.idsig`
//! sidecar), the install's piped input, or the bidirectional streaming
//! channel. `open_inputs` turns that blob into owned input descriptors the
//! assembler can drain.

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::Read;

use crate::incfs::{BlockKind, FileId, BLOCK_SIZE};
use crate::shell::{ShellCommandConnector, ShellHandle};

const SHA256_DIGEST_SIZE: i64 = 32;

/// First byte of a file's install metadata.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(i8)]
pub enum MetadataMode {
    /// Consume the install's piped input as this file's data, waiting out
    /// temporary EOFs while the pipe is still being filled.
    Stdin = 0,
    /// Remainder of the metadata is a UTF-8 path to a staged file.
    LocalFile = 1,
    /// Verity tree from the pipe, data blocks over the streaming channel.
    DataOnlyStreaming = 2,
    /// Everything over the streaming channel.
    Streaming = 3,
}

impl MetadataMode {
    pub fn from_tag(tag: i8) -> Option<MetadataMode> {
        match tag {
            0 => Some(MetadataMode::Stdin),
            1 => Some(MetadataMode::LocalFile),
            2 => Some(MetadataMode::DataOnlyStreaming),
            3 => Some(MetadataMode::Streaming),
            _ => None,
        }
    }

    pub fn tag(self) -> i8 {
        self as i8
    }
}

/// One opened input of an install file. The fd is exclusively owned and
/// closed on drop; a streaming input's fd gets duplicated into the channel
/// holder before the assembler drains it.
#[derive(Debug)]
pub struct InputDesc {
    pub file: File,
    pub size: i64,
    pub kind: BlockKind,
    pub wait_on_eof: bool,
    pub streaming: bool,
    pub mode: MetadataMode,
}

/// Size of the SHA-256 verity tree IncFS keeps for a file of `file_size`
/// bytes: level sizes accumulate from the leaf hashing upward until a single
/// block remains.
pub fn verity_tree_size_for_file(file_size: i64) -> i64 {
    let block_size = BLOCK_SIZE as i64;
    let hash_per_block = block_size / SHA256_DIGEST_SIZE;

    let mut total_tree_block_count: i64 = 0;
    let mut hash_block_count = 1 + (file_size - 1) / block_size;
    while hash_block_count > 1 {
        hash_block_count = (hash_block_count + hash_per_block - 1) / hash_per_block;
        total_tree_block_count += hash_block_count;
    }
    total_tree_block_count * block_size
}

fn read_le_i32(input: &mut impl Read) -> Result<i32> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn skip_le_bytes(input: &mut impl Read) -> Result<()> {
    let size = read_le_i32(input)?;
    if size < 0 {
        bail!("negative length field in .idsig preamble: {}", size);
    }
    let copied = std::io::copy(&mut input.take(size as u64), &mut std::io::sink())?;
    if copied != size as u64 {
        bail!("truncated .idsig preamble");
    }
    Ok(())
}

/// Skip the `.idsig` preamble (version, hashingInfo, signingInfo) and return
/// the declared verity-tree size, leaving the reader at the tree bytes.
pub fn skip_idsig_headers(input: &mut impl Read) -> Result<i32> {
    read_le_i32(input).context("failed to read .idsig version")?;
    skip_le_bytes(input).context("failed to skip .idsig hashing info")?;
    skip_le_bytes(input).context("failed to skip .idsig signing info")?;
    read_le_i32(input).context("failed to read .idsig tree size")
}

/// Build the filesystem id for a streamed file: mode tag in byte 0, decimal
/// text of the index in bytes 1..15, NUL padding.
pub fn file_id_from_index(mode: MetadataMode, file_idx: i16) -> FileId {
    let mut id = FileId::default();
    id.0[0] = mode.tag() as u8;
    let text = file_idx.to_string();
    id.0[1..1 + text.len()].copy_from_slice(text.as_bytes());
    id
}

/// Reverse of `file_id_from_index`. `None` when the mode tag is not a
/// streaming mode or the text does not decode to an in-range index.
pub fn file_index_from_id(id: &FileId) -> Option<i16> {
    let mode = MetadataMode::from_tag(id.0[0] as i8)?;
    if mode != MetadataMode::DataOnlyStreaming && mode != MetadataMode::Streaming {
        return None;
    }
    let tail = &id.0[1..];
    let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    let text = std::str::from_utf8(&tail[..end]).ok()?;
    let idx: i32 = text.parse().ok()?;
    i16::try_from(idx).ok()
}

fn open_local_file(
    shell: &dyn ShellCommandConnector,
    cmd: &ShellHandle,
    size: i64,
    file_path: &str,
) -> Result<Vec<InputDesc>> {
    let mut result = Vec::with_capacity(2);

    let idsig_path = format!("{file_path}.idsig");
    if let Some(fd) = shell.get_local_file(cmd, &idsig_path) {
        let mut idsig = File::from(fd);
        let tree_size = verity_tree_size_for_file(size);
        let actual_tree_size = i64::from(skip_idsig_headers(&mut idsig)?);
        if tree_size != actual_tree_size {
            bail!(
                "verity tree size mismatch: computed {} vs .idsig {}",
                tree_size,
                actual_tree_size
            );
        }
        result.push(InputDesc {
            file: idsig,
            size: tree_size,
            kind: BlockKind::HASH,
            wait_on_eof: false,
            streaming: false,
            mode: MetadataMode::LocalFile,
        });
    }

    if let Some(fd) = shell.get_local_file(cmd, file_path) {
        result.push(InputDesc {
            file: File::from(fd),
            size,
            kind: BlockKind::DATA,
            wait_on_eof: false,
            streaming: false,
            mode: MetadataMode::LocalFile,
        });
    }

    Ok(result)
}

/// Open the inputs an install file's metadata names. An empty result means
/// the resolver had nothing for us; the driver treats that as failure.
pub fn open_inputs(
    shell: &dyn ShellCommandConnector,
    cmd: &ShellHandle,
    size: i64,
    metadata: &[u8],
) -> Result<Vec<InputDesc>> {
    let mode = match metadata.first() {
        None => MetadataMode::Stdin,
        Some(&tag) => MetadataMode::from_tag(tag as i8)
            .with_context(|| format!("unknown metadata mode tag: {tag}"))?,
    };

    if mode == MetadataMode::LocalFile {
        let file_path =
            std::str::from_utf8(&metadata[1..]).context("local-file metadata is not UTF-8")?;
        return open_local_file(shell, cmd, size, file_path);
    }

    let Some(fd) = shell.get_stdin(cmd) else {
        return Ok(Vec::new());
    };
    let file = File::from(fd);

    let mut result = Vec::with_capacity(1);
    match mode {
        MetadataMode::Stdin => {
            result.push(InputDesc {
                file,
                size,
                kind: BlockKind::DATA,
                wait_on_eof: true,
                streaming: false,
                mode,
            });
        }
        MetadataMode::DataOnlyStreaming => {
            // verity tree over the pipe, the data itself is streamed later
            result.push(InputDesc {
                file,
                size: verity_tree_size_for_file(size),
                kind: BlockKind::HASH,
                wait_on_eof: true,
                streaming: true,
                mode,
            });
        }
        MetadataMode::Streaming => {
            // zero-length input: it exists only to carry the channel fd
            result.push(InputDesc {
                file,
                size: 0,
                kind: BlockKind::DATA,
                wait_on_eof: false,
                streaming: true,
                mode,
            });
        }
        MetadataMode::LocalFile => unreachable!(),
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::{Seek, SeekFrom, Write};
    use std::os::fd::OwnedFd;

    struct TestShell {
        files: HashMap<String, Vec<u8>>,
        stdin: Option<Vec<u8>>,
    }

    impl TestShell {
        fn new() -> Self {
            TestShell {
                files: HashMap::new(),
                stdin: None,
            }
        }

        fn staged(content: &[u8]) -> OwnedFd {
            let mut f = tempfile::tempfile().unwrap();
            f.write_all(content).unwrap();
            f.seek(SeekFrom::Start(0)).unwrap();
            OwnedFd::from(f)
        }
    }

    impl ShellCommandConnector for TestShell {
        fn lookup_shell_command(&self, _args: &str) -> Option<ShellHandle> {
            Some(ShellHandle(1))
        }

        fn get_stdin(&self, _cmd: &ShellHandle) -> Option<OwnedFd> {
            self.stdin.as_ref().map(|data| Self::staged(data))
        }

        fn get_local_file(&self, _cmd: &ShellHandle, path: &str) -> Option<OwnedFd> {
            self.files.get(path).map(|data| Self::staged(data))
        }
    }

    fn idsig_bytes(tree_size: i32, hashing: &[u8], signing: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&2i32.to_le_bytes()); // version
        out.extend_from_slice(&(hashing.len() as i32).to_le_bytes());
        out.extend_from_slice(hashing);
        out.extend_from_slice(&(signing.len() as i32).to_le_bytes());
        out.extend_from_slice(signing);
        out.extend_from_slice(&tree_size.to_le_bytes());
        out
    }

    // Independent statement of the sizing law: fixed-point sum of level
    // block counts.
    fn tree_size_by_law(file_size: i64) -> i64 {
        let block = BLOCK_SIZE as i64;
        let mut b = (file_size + block - 1) / block;
        if file_size == 0 {
            b = 1;
        }
        let mut sum = 0;
        while b > 1 {
            b = (b + (block / 32) - 1) / (block / 32);
            sum += b;
        }
        sum * block
    }

    #[test]
    fn test_verity_tree_size_known_values() {
        assert_eq!(verity_tree_size_for_file(0), 0);
        assert_eq!(verity_tree_size_for_file(10), 0);
        assert_eq!(verity_tree_size_for_file(4096), 0);
        assert_eq!(verity_tree_size_for_file(8192), 4096);
        assert_eq!(verity_tree_size_for_file(4096 * 128), 4096);
        assert_eq!(verity_tree_size_for_file(4096 * 129), 3 * 4096);
        assert_eq!(verity_tree_size_for_file(4096 * 128 * 128), 129 * 4096);
    }

    #[test]
    fn test_verity_tree_size_matches_fixed_point_law() {
        for size in [
            1,
            4095,
            4097,
            100_000,
            1 << 20,
            50 << 20,
            (4096 * 128 * 128) - 1,
            (4096 * 128 * 128) + 1,
        ] {
            assert_eq!(verity_tree_size_for_file(size), tree_size_by_law(size), "size {size}");
        }
    }

    #[test]
    fn test_file_id_round_trip() {
        for mode in [MetadataMode::DataOnlyStreaming, MetadataMode::Streaming] {
            for idx in [-32768i16, -1, 0, 1, 7, 300, 32767] {
                let id = file_id_from_index(mode, idx);
                assert!(id.is_valid());
                assert_eq!(file_index_from_id(&id), Some(idx), "mode {mode:?} idx {idx}");
            }
        }
    }

    #[test]
    fn test_file_index_rejects_non_streaming_modes() {
        let id = file_id_from_index(MetadataMode::Stdin, 3);
        assert_eq!(file_index_from_id(&id), None);
        let id = file_id_from_index(MetadataMode::LocalFile, 3);
        assert_eq!(file_index_from_id(&id), None);
    }

    #[test]
    fn test_file_index_rejects_garbage_ids() {
        assert_eq!(file_index_from_id(&FileId([0u8; 16])), None);
        let mut id = FileId([0u8; 16]);
        id.0[0] = MetadataMode::Streaming.tag() as u8;
        // no digits at all
        assert_eq!(file_index_from_id(&id), None);
        // out of i16 range
        id.0[1..7].copy_from_slice(b"100000");
        assert_eq!(file_index_from_id(&id), None);
    }

    #[test]
    fn test_skip_idsig_headers() {
        let bytes = idsig_bytes(8192, b"hash-info", b"sign-info");
        let mut cursor = &bytes[..];
        assert_eq!(skip_idsig_headers(&mut cursor).unwrap(), 8192);
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_skip_idsig_headers_truncated() {
        let mut bytes = idsig_bytes(8192, b"hash-info", b"sign-info");
        bytes.truncate(8);
        let mut cursor = &bytes[..];
        assert!(skip_idsig_headers(&mut cursor).is_err());
    }

    #[test]
    fn test_open_inputs_stdin() {
        let mut shell = TestShell::new();
        shell.stdin = Some(b"payload".to_vec());
        let cmd = ShellHandle(1);
        let inputs = open_inputs(&shell, &cmd, 7, &[0]).unwrap();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].size, 7);
        assert_eq!(inputs[0].kind, BlockKind::DATA);
        assert!(inputs[0].wait_on_eof);
        assert!(!inputs[0].streaming);
    }

    #[test]
    fn test_open_inputs_empty_metadata_defaults_to_stdin() {
        let mut shell = TestShell::new();
        shell.stdin = Some(Vec::new());
        let inputs = open_inputs(&shell, &ShellHandle(1), 3, &[]).unwrap();
        assert_eq!(inputs.len(), 1);
        assert!(inputs[0].wait_on_eof);
    }

    #[test]
    fn test_open_inputs_local_file_with_idsig() {
        let size = 4096 * 129;
        let tree_size = verity_tree_size_for_file(size);
        let mut shell = TestShell::new();
        shell
            .files
            .insert("pkg.apk".into(), vec![0xAB; 64]);
        shell.files.insert(
            "pkg.apk.idsig".into(),
            idsig_bytes(tree_size as i32, b"h", b"s"),
        );
        let mut metadata = vec![MetadataMode::LocalFile.tag() as u8];
        metadata.extend_from_slice(b"pkg.apk");

        let inputs = open_inputs(&shell, &ShellHandle(1), size, &metadata).unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[0].kind, BlockKind::HASH);
        assert_eq!(inputs[0].size, tree_size);
        assert_eq!(inputs[1].kind, BlockKind::DATA);
        assert_eq!(inputs[1].size, size);
    }

    #[test]
    fn test_open_inputs_idsig_size_mismatch_fails() {
        let mut shell = TestShell::new();
        shell.files.insert("pkg.apk".into(), vec![1; 16]);
        shell
            .files
            .insert("pkg.apk.idsig".into(), idsig_bytes(99, b"h", b"s"));
        let mut metadata = vec![MetadataMode::LocalFile.tag() as u8];
        metadata.extend_from_slice(b"pkg.apk");

        assert!(open_inputs(&shell, &ShellHandle(1), 8192, &metadata).is_err());
    }

    #[test]
    fn test_open_inputs_missing_everything_is_empty() {
        let shell = TestShell::new();
        let mut metadata = vec![MetadataMode::LocalFile.tag() as u8];
        metadata.extend_from_slice(b"nope.apk");
        let inputs = open_inputs(&shell, &ShellHandle(1), 10, &metadata).unwrap();
        assert!(inputs.is_empty());

        // stdin modes with no pipe resolve to empty too
        let inputs = open_inputs(&shell, &ShellHandle(1), 10, &[0]).unwrap();
        assert!(inputs.is_empty());
    }

    #[test]
    fn test_open_inputs_data_only_streaming() {
        let mut shell = TestShell::new();
        shell.stdin = Some(Vec::new());
        let size = 4096 * 200;
        let inputs = open_inputs(
            &shell,
            &ShellHandle(1),
            size,
            &[MetadataMode::DataOnlyStreaming.tag() as u8],
        )
        .unwrap();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].kind, BlockKind::HASH);
        assert_eq!(inputs[0].size, verity_tree_size_for_file(size));
        assert!(inputs[0].wait_on_eof);
        assert!(inputs[0].streaming);
        assert_eq!(inputs[0].mode, MetadataMode::DataOnlyStreaming);
    }

    #[test]
    fn test_open_inputs_streaming_is_zero_length() {
        let mut shell = TestShell::new();
        shell.stdin = Some(Vec::new());
        let inputs = open_inputs(
            &shell,
            &ShellHandle(1),
            1 << 30,
            &[MetadataMode::Streaming.tag() as u8],
        )
        .unwrap();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].size, 0);
        assert_eq!(inputs[0].kind, BlockKind::DATA);
        assert!(!inputs[0].wait_on_eof);
        assert!(inputs[0].streaming);
    }

    #[test]
    fn test_open_inputs_unknown_mode_fails() {
        let mut shell = TestShell::new();
        shell.stdin = Some(Vec::new());
        assert!(open_inputs(&shell, &ShellHandle(1), 1, &[9]).is_err());
    }
}
