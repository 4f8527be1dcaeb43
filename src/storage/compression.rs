//! Transparent block compression for storage streams.
//!
//! Layout of a compressed stream:
//!
//! ```text
//! repeated: raw_len u32 | compressed_len u32 | crc32(raw) u32 | lz4 payload
//! footer:   block_count u64 | raw_len u64 | magic u32
//! ```
//!
//! [`CompressedInput`] reports the *uncompressed* size and supports random seeks,
//! so formats that read a trailing record first work unchanged on top of it.

use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;

use crate::error::{Result, SegpatchError};
use crate::storage::{StorageError, StorageInput, StorageOutput};

const MAGIC: u32 = 0x5A4C_5053; // "SPLZ"
const BLOCK_HEADER_SIZE: u64 = 12;
const FOOTER_SIZE: u64 = 20;

/// Default uncompressed block size.
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Output that lz4-compresses everything written to it in fixed-size blocks.
#[derive(Debug)]
pub struct CompressedOutput<W: StorageOutput> {
    inner: W,
    block_size: usize,
    block: Vec<u8>,
    raw_len: u64,
    block_count: u64,
    closed: bool,
}

impl<W: StorageOutput> CompressedOutput<W> {
    /// Wrap `inner`, cutting the data into blocks of `block_size` bytes.
    pub fn new(inner: W, block_size: usize) -> Self {
        let block_size = block_size.max(1);
        CompressedOutput {
            inner,
            block_size,
            block: Vec::with_capacity(block_size),
            raw_len: 0,
            block_count: 0,
            closed: false,
        }
    }

    fn flush_block(&mut self) -> std::io::Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }

        let payload = lz4_flex::block::compress(&self.block);
        self.inner.write_u32::<LittleEndian>(self.block.len() as u32)?;
        self.inner.write_u32::<LittleEndian>(payload.len() as u32)?;
        self.inner
            .write_u32::<LittleEndian>(crc32fast::hash(&self.block))?;
        self.inner.write_all(&payload)?;

        self.block_count += 1;
        self.block.clear();
        Ok(())
    }
}

impl<W: StorageOutput> Write for CompressedOutput<W> {
    fn write(&mut self, mut buf: &[u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::other("Output is closed"));
        }

        let written = buf.len();
        while !buf.is_empty() {
            let room = self.block_size - self.block.len();
            let take = room.min(buf.len());
            self.block.extend_from_slice(&buf[..take]);
            buf = &buf[take..];
            if self.block.len() == self.block_size {
                self.flush_block()?;
            }
        }

        self.raw_len += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        // Partial blocks stay buffered until close.
        self.inner.flush()
    }
}

impl<W: StorageOutput> Seek for CompressedOutput<W> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        match pos {
            SeekFrom::Current(0) => Ok(self.raw_len),
            SeekFrom::Start(offset) if offset == self.raw_len => Ok(self.raw_len),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                StorageError::InvalidOperation("cannot seek a compressed stream".to_string())
                    .to_string(),
            )),
        }
    }
}

impl<W: StorageOutput> StorageOutput for CompressedOutput<W> {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.inner.flush_and_sync()
    }

    fn position(&self) -> Result<u64> {
        Ok(self.raw_len)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        self.flush_block()?;
        self.inner.write_u64::<LittleEndian>(self.block_count)?;
        self.inner.write_u64::<LittleEndian>(self.raw_len)?;
        self.inner.write_u32::<LittleEndian>(MAGIC)?;
        self.inner.flush_and_sync()?;
        self.inner.close()?;
        self.closed = true;

        debug!(
            "closed compressed stream: {} raw bytes in {} blocks",
            self.raw_len, self.block_count
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct BlockEntry {
    raw_offset: u64,
    payload_offset: u64,
    raw_len: u32,
    compressed_len: u32,
    crc: u32,
}

/// Input over a stream produced by [`CompressedOutput`].
#[derive(Debug)]
pub struct CompressedInput<R: StorageInput> {
    inner: R,
    blocks: Vec<BlockEntry>,
    raw_len: u64,
    position: u64,
    cached: Option<(usize, Vec<u8>)>,
}

impl<R: StorageInput> CompressedInput<R> {
    /// Open a compressed stream, validating its footer and block index.
    pub fn open(mut inner: R) -> Result<Self> {
        let size = inner.size()?;
        if size < FOOTER_SIZE {
            return Err(SegpatchError::inconsistent(format!(
                "compressed stream of {size} bytes is shorter than its footer"
            )));
        }

        inner.seek(SeekFrom::Start(size - FOOTER_SIZE))?;
        let block_count = inner.read_u64::<LittleEndian>()?;
        let raw_len = inner.read_u64::<LittleEndian>()?;
        let magic = inner.read_u32::<LittleEndian>()?;
        if magic != MAGIC {
            return Err(SegpatchError::inconsistent(format!(
                "bad compressed stream magic {magic:#x}"
            )));
        }

        let data_end = size - FOOTER_SIZE;
        let mut blocks = Vec::new();
        let mut offset = 0u64;
        let mut raw_offset = 0u64;
        while offset < data_end {
            if offset + BLOCK_HEADER_SIZE > data_end {
                return Err(SegpatchError::inconsistent("truncated compressed block header"));
            }
            inner.seek(SeekFrom::Start(offset))?;
            let block_raw_len = inner.read_u32::<LittleEndian>()?;
            let compressed_len = inner.read_u32::<LittleEndian>()?;
            let crc = inner.read_u32::<LittleEndian>()?;
            let payload_offset = offset + BLOCK_HEADER_SIZE;
            if payload_offset + compressed_len as u64 > data_end {
                return Err(SegpatchError::inconsistent("truncated compressed block payload"));
            }

            blocks.push(BlockEntry {
                raw_offset,
                payload_offset,
                raw_len: block_raw_len,
                compressed_len,
                crc,
            });
            raw_offset += block_raw_len as u64;
            offset = payload_offset + compressed_len as u64;
        }

        if blocks.len() as u64 != block_count || raw_offset != raw_len {
            return Err(SegpatchError::inconsistent(format!(
                "compressed footer declares {block_count} blocks / {raw_len} bytes, found {} / {raw_offset}",
                blocks.len()
            )));
        }

        inner.seek(SeekFrom::Start(0))?;
        Ok(CompressedInput {
            inner,
            blocks,
            raw_len,
            position: 0,
            cached: None,
        })
    }

    fn block_index(&self, position: u64) -> Option<usize> {
        let index = self
            .blocks
            .partition_point(|block| block.raw_offset + block.raw_len as u64 <= position);
        (index < self.blocks.len()).then_some(index)
    }

    fn load_block(&mut self, index: usize) -> std::io::Result<()> {
        if matches!(self.cached, Some((cached, _)) if cached == index) {
            return Ok(());
        }

        let entry = self.blocks[index];
        self.inner.seek(SeekFrom::Start(entry.payload_offset))?;
        let mut payload = vec![0u8; entry.compressed_len as usize];
        self.inner.read_exact(&mut payload)?;

        let raw = lz4_flex::block::decompress(&payload, entry.raw_len as usize)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        if crc32fast::hash(&raw) != entry.crc {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("checksum mismatch in compressed block {index}"),
            ));
        }

        self.cached = Some((index, raw));
        Ok(())
    }
}

impl<R: StorageInput> Read for CompressedInput<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let Some(index) = self.block_index(self.position) else {
            return Ok(0);
        };
        self.load_block(index)?;

        let entry = self.blocks[index];
        let Some((_, raw)) = &self.cached else {
            return Ok(0);
        };
        let start = (self.position - entry.raw_offset) as usize;
        let take = (raw.len() - start).min(buf.len());
        buf[..take].copy_from_slice(&raw[start..start + take]);
        self.position += take as u64;
        Ok(take)
    }
}

impl<R: StorageInput> Seek for CompressedInput<R> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => self.raw_len as i64 + offset,
            SeekFrom::Current(offset) => self.position as i64 + offset,
        };
        if target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "Invalid seek position",
            ));
        }
        self.position = target as u64;
        Ok(self.position)
    }
}

impl<R: StorageInput> StorageInput for CompressedInput<R> {
    fn size(&self) -> Result<u64> {
        Ok(self.raw_len)
    }

    fn close(&mut self) -> Result<()> {
        self.cached = None;
        self.inner.close()
    }
}
