//! Patch file format.
//!
//! ```text
//! for each non-null term, ascending:
//!     term key   u64
//!     doc count  u32
//!     doc count x DocDelta (u32, ascending document id)
//! optional null-term block, same shape, key = u64::MAX
//! meta record (16 bytes):
//!     non-null term count  u64
//!     has null term        u8
//!     reserved             [u8; 7]
//! ```
//!
//! All integers are little-endian. The meta record sits at the end of the
//! stream; readers fetch it first and then scan the term blocks from offset 0.
//! When compression is configured the whole record is wrapped in
//! [`crate::storage::compression`] blocks, which is invisible at this level.
//!
//! Patch files live in the patch area of their destination segment:
//! `segment_<dst>/patch/<index>` (or `<index>_@_<shard>` for sharded
//! dictionaries), named `<src>_<dst>.patch`.

use log::debug;

use crate::error::{Result, SegpatchError};
use crate::lexical::SegmentId;
use crate::lexical::config::PatchCompression;
use crate::lexical::core::doc_delta::{DOC_DELTA_SIZE, DocDelta};
use crate::lexical::core::term_key::TermKey;
use crate::storage::compression::{CompressedInput, CompressedOutput};
use crate::storage::structured::StructWriter;
use crate::storage::{StorageInput, StorageOutput};

/// Size of the trailing meta record.
pub const PATCH_META_SIZE: u64 = 16;

/// Size of a term block header (key + doc count).
pub const TERM_HEADER_SIZE: u64 = 12;

/// Extension of patch files.
pub const PATCH_FILE_EXTENSION: &str = ".patch";

const SHARD_SEPARATOR: &str = "_@_";

/// Trailing meta record of a patch file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchMeta {
    /// Number of term blocks with a non-null key.
    pub non_null_term_count: u64,
    /// Whether a null-term block follows the non-null blocks.
    pub has_null_term: bool,
}

impl PatchMeta {
    /// Total number of term blocks.
    pub fn term_count(&self) -> u64 {
        self.non_null_term_count + self.has_null_term as u64
    }

    /// Encode the 16-byte meta record.
    pub fn encode(&self) -> [u8; PATCH_META_SIZE as usize] {
        let mut bytes = [0u8; PATCH_META_SIZE as usize];
        bytes[..8].copy_from_slice(&self.non_null_term_count.to_le_bytes());
        bytes[8] = self.has_null_term as u8;
        bytes
    }

    /// Decode a meta record, rejecting unknown flag values and non-zero padding.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PATCH_META_SIZE as usize {
            return Err(SegpatchError::inconsistent(format!(
                "patch meta must be {PATCH_META_SIZE} bytes, got {}",
                bytes.len()
            )));
        }

        let mut count = [0u8; 8];
        count.copy_from_slice(&bytes[..8]);
        let has_null_term = match bytes[8] {
            0 => false,
            1 => true,
            flag => {
                return Err(SegpatchError::inconsistent(format!(
                    "invalid has-null-term flag {flag}"
                )));
            }
        };
        if bytes[9..].iter().any(|&b| b != 0) {
            return Err(SegpatchError::inconsistent("non-zero reserved bytes in patch meta"));
        }

        Ok(PatchMeta {
            non_null_term_count: u64::from_le_bytes(count),
            has_null_term,
        })
    }
}

/// Streams term blocks into a patch file.
///
/// Terms must arrive in ascending order with the null term last, and each
/// delta list must be non-empty and strictly ascending by document id; anything
/// else is rejected before a byte is written for that term.
#[derive(Debug)]
pub struct PatchFileWriter {
    writer: StructWriter<Box<dyn StorageOutput>>,
    last_term: Option<TermKey>,
    meta: PatchMeta,
    item_count: u64,
}

impl PatchFileWriter {
    /// Start a patch file on `output`, wrapping it according to `compression`.
    pub fn new(output: Box<dyn StorageOutput>, compression: PatchCompression) -> Self {
        PatchFileWriter {
            writer: StructWriter::new(wrap_output(output, compression)),
            last_term: None,
            meta: PatchMeta::default(),
            item_count: 0,
        }
    }

    /// Append one term block.
    pub fn write_term(&mut self, term: TermKey, deltas: &[DocDelta]) -> Result<()> {
        if deltas.is_empty() {
            return Err(SegpatchError::invalid_argument(format!(
                "term {term} has no deltas"
            )));
        }
        if let Some(last) = self.last_term
            && term <= last
        {
            return Err(SegpatchError::invalid_argument(format!(
                "term {term} written after {last}"
            )));
        }
        if let Some(pair) = deltas.windows(2).find(|pair| pair[0] >= pair[1]) {
            return Err(SegpatchError::invalid_argument(format!(
                "deltas of term {term} not strictly ascending at document {}",
                pair[1].doc_id()
            )));
        }

        self.writer.write_u64(term.key())?;
        self.writer.write_u32(deltas.len() as u32)?;
        for delta in deltas {
            self.writer.write_u32(delta.to_bits())?;
        }

        if term.is_null() {
            self.meta.has_null_term = true;
        } else {
            self.meta.non_null_term_count += 1;
        }
        self.item_count += deltas.len() as u64;
        self.last_term = Some(term);
        Ok(())
    }

    /// Number of deltas written so far.
    pub fn item_count(&self) -> u64 {
        self.item_count
    }

    /// Meta record as it stands.
    pub fn meta(&self) -> PatchMeta {
        self.meta
    }

    /// Write the meta record and close the stream.
    pub fn finish(mut self) -> Result<PatchMeta> {
        let meta = self.meta;
        self.writer.write_raw(&meta.encode())?;
        let bytes = self.writer.position();
        self.writer.close()?;

        debug!(
            "patch record finished: {} terms, {} deltas, {bytes} bytes",
            meta.term_count(),
            self.item_count
        );
        Ok(meta)
    }
}

/// Wrap a raw output with the configured compression.
pub fn wrap_output(
    output: Box<dyn StorageOutput>,
    compression: PatchCompression,
) -> Box<dyn StorageOutput> {
    match compression {
        PatchCompression::None => output,
        PatchCompression::Lz4 { block_size } => Box::new(CompressedOutput::new(output, block_size)),
    }
}

/// Wrap a raw input with the configured compression.
pub fn wrap_input(
    input: Box<dyn StorageInput>,
    compression: PatchCompression,
) -> Result<Box<dyn StorageInput>> {
    match compression {
        PatchCompression::None => Ok(input),
        PatchCompression::Lz4 { .. } => Ok(Box::new(CompressedInput::open(input)?)),
    }
}

/// Name of the patch file carrying deltas from `src` to `dst`.
pub fn patch_file_name(src: SegmentId, dst: SegmentId) -> String {
    format!("{src}_{dst}{PATCH_FILE_EXTENSION}")
}

/// Recover `(src, dst)` from a patch file name.
pub fn parse_patch_file_name(name: &str) -> Result<(SegmentId, SegmentId)> {
    let malformed = || SegpatchError::inconsistent(format!("malformed patch file name {name:?}"));

    let stem = name.strip_suffix(PATCH_FILE_EXTENSION).ok_or_else(malformed)?;
    let (src, dst) = stem.split_once('_').ok_or_else(malformed)?;
    let src = src.parse::<SegmentId>().map_err(|_| malformed())?;
    let dst = dst.parse::<SegmentId>().map_err(|_| malformed())?;
    Ok((src, dst))
}

/// Whether `name` looks like a finished patch file (temp files do not).
pub fn is_patch_file_name(name: &str) -> bool {
    parse_patch_file_name(name).is_ok()
}

/// Patch area of `index` inside destination segment `dst`.
pub fn patch_directory(dst: SegmentId, index_name: &str, shard: Option<u32>) -> String {
    match shard {
        Some(shard) => format!("segment_{dst}/patch/{index_name}{SHARD_SEPARATOR}{shard}"),
        None => format!("segment_{dst}/patch/{index_name}"),
    }
}

/// Full storage path of a patch file.
pub fn patch_file_path(
    index_name: &str,
    shard: Option<u32>,
    src: SegmentId,
    dst: SegmentId,
) -> String {
    format!(
        "{}/{}",
        patch_directory(dst, index_name, shard),
        patch_file_name(src, dst)
    )
}

/// Encoded size of a term block holding `doc_count` deltas.
pub fn term_block_size(doc_count: u64) -> u64 {
    TERM_HEADER_SIZE + doc_count * DOC_DELTA_SIZE as u64
}
