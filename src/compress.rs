//! Chunked compression of stored blob data.
//!
//! Stored compressed bytes are a self-describing frame: a header, a
//! table of compressed chunk lengths, then one zstd frame per chunk.
//! Chunks compress independently so the expensive ingest phase can
//! fan them out across a thread pool, and a reader can bound memory
//! by decoding chunk by chunk.

use crate::error::Error;
use crate::error::Result;
use rayon::prelude::*;
use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;

/// Identifies a chunked compressed frame.
pub const ARCHIVE_MAGIC: u64 = 0x63686e6b7a737464;
/// Uncompressed bytes per chunk.
pub const CHUNK_SIZE: usize = 32 * 1024;
/// zstd level used for every chunk.
pub const COMPRESSION_LEVEL: i32 = 3;

/// Frame header preceding the chunk table.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct FrameHeader {
	magic: U64,
	decompressed_size: U64,
	chunk_size: U32,
	chunk_count: U32,
}

const HEADER_SIZE: usize = std::mem::size_of::<FrameHeader>();

/// Compresses `data` into a chunked frame. `data` must not be empty.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
	debug_assert!(!data.is_empty());
	let chunks: Vec<Vec<u8>> = data
		.par_chunks(CHUNK_SIZE)
		.map(|chunk| {
			zstd::bulk::compress(chunk, COMPRESSION_LEVEL)
				.map_err(|e| Error::Io(e))
		})
		.collect::<Result<_>>()?;

	let header = FrameHeader {
		magic: ARCHIVE_MAGIC.into(),
		decompressed_size: (data.len() as u64).into(),
		chunk_size: (CHUNK_SIZE as u32).into(),
		chunk_count: (chunks.len() as u32).into(),
	};
	let table_size = chunks.len() * std::mem::size_of::<U32>();
	let payload_size: usize = chunks.iter().map(Vec::len).sum();
	let mut frame = Vec::with_capacity(HEADER_SIZE + table_size + payload_size);
	frame.extend_from_slice(header.as_bytes());
	for chunk in &chunks {
		frame.extend_from_slice(U32::new(chunk.len() as u32).as_bytes());
	}
	for chunk in &chunks {
		frame.extend_from_slice(chunk);
	}
	Ok(frame)
}

/// Returns the byte length of the frame at the front of `frame`,
/// excluding any trailing padding.
pub fn frame_size(frame: &[u8]) -> Result<usize> {
	let (header, rest) = FrameHeader::read_from_prefix(frame)
		.map_err(|_| Error::FormatError("compressed frame shorter than its header".to_string()))?;
	if header.magic.get() != ARCHIVE_MAGIC {
		return Err(Error::FormatError(format!(
			"bad compressed frame magic {:#x}",
			header.magic.get()
		)));
	}
	let chunk_count = header.chunk_count.get() as usize;
	let table_size = chunk_count * std::mem::size_of::<U32>();
	if rest.len() < table_size {
		return Err(Error::FormatError("compressed frame truncated in chunk table".to_string()));
	}
	let lengths = <[U32]>::ref_from_bytes(&rest[..table_size])
		.map_err(|_| Error::FormatError("bad chunk table".to_string()))?;
	let payload: usize = lengths.iter().map(|l| l.get() as usize).sum();
	Ok(HEADER_SIZE + table_size + payload)
}

/// Decompresses a chunked frame produced by [`compress`].
///
/// `frame` may carry trailing zeros past the frame proper; stored
/// data is only bounded by its block count.
pub fn decompress(frame: &[u8]) -> Result<Vec<u8>> {
	let (header, rest) = FrameHeader::read_from_prefix(frame)
		.map_err(|_| Error::FormatError("compressed frame shorter than its header".to_string()))?;
	if header.magic.get() != ARCHIVE_MAGIC {
		return Err(Error::FormatError(format!(
			"bad compressed frame magic {:#x}",
			header.magic.get()
		)));
	}
	let chunk_size = header.chunk_size.get() as usize;
	let chunk_count = header.chunk_count.get() as usize;
	let decompressed_size = header.decompressed_size.get() as usize;
	if chunk_size == 0 || chunk_count != decompressed_size.div_ceil(chunk_size) {
		return Err(Error::FormatError(format!(
			"chunk geometry {chunk_count}x{chunk_size} does not cover {decompressed_size} bytes"
		)));
	}

	let table_size = chunk_count * std::mem::size_of::<U32>();
	if rest.len() < table_size {
		return Err(Error::FormatError("compressed frame truncated in chunk table".to_string()));
	}
	let (table, mut payload) = rest.split_at(table_size);
	let lengths = <[U32]>::ref_from_bytes(table)
		.map_err(|_| Error::FormatError("bad chunk table".to_string()))?;

	let mut out = Vec::with_capacity(decompressed_size);
	for (i, length) in lengths.iter().enumerate() {
		let length = length.get() as usize;
		if payload.len() < length {
			return Err(Error::FormatError(format!("compressed frame truncated in chunk {i}")));
		}
		let (chunk, remainder) = payload.split_at(length);
		payload = remainder;
		let expected = if i + 1 == chunk_count {
			decompressed_size - i * chunk_size
		} else {
			chunk_size
		};
		let decoded = zstd::bulk::decompress(chunk, expected)
			.map_err(|e| Error::FormatError(format!("chunk {i} failed to decode: {e}")))?;
		if decoded.len() != expected {
			return Err(Error::FormatError(format!(
				"chunk {i} decoded to {} bytes, expected {expected}",
				decoded.len()
			)));
		}
		out.extend_from_slice(&decoded);
	}
	Ok(out)
}
