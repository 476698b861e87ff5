//! Placement of a blob's data and Merkle tree within its blocks.
//!
//! All quantities are pure functions of the layout format, the
//! logical file size, the stored data size and the block size, so a
//! layout can be recomputed identically at build time, at check time
//! and from an inode.

use crate::error::Error;
use crate::error::Result;
use crate::format::Inode;
use crate::format::MAX_BLOCKS_PER_BLOB;
use crate::merkle;

/// How a blob is laid out in storage. The discriminant is serialized
/// into the superblock, which pins the values.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum BlobLayoutFormat {
	/// Merkle tree first, each tree level padded to a block multiple,
	/// data starting on the next block boundary. Kept only for images
	/// produced before the compact layout existed.
	PaddedMerkleTreeAtStart = 0,
	/// Data first, compact Merkle tree aligned to end at the end of
	/// the last block. Tree and data may share a block.
	CompactMerkleTreeAtEnd = 1,
}

impl BlobLayoutFormat {
	pub fn from_u8(value: u8) -> Result<Self> {
		match value {
			0 => Ok(Self::PaddedMerkleTreeAtStart),
			1 => Ok(Self::CompactMerkleTreeAtEnd),
			_ => Err(Error::InvalidArgs(format!("unknown blob layout format {value}"))),
		}
	}

	/// Tells whether the Merkle tree is stored in the compact
	/// per-level packing.
	pub fn is_compact(&self) -> bool {
		matches!(self, Self::CompactMerkleTreeAtEnd)
	}
}

/// Layout information for one blob.
#[derive(Clone, Debug)]
pub struct BlobLayout {
	format: BlobLayoutFormat,
	file_size: u64,
	data_size: u64,
	merkle_tree_size: u64,
	block_size: u64,
}

impl BlobLayout {
	/// Builds a layout from a blob's sizes.
	///
	/// `data_size` equals `file_size` for uncompressed blobs and the
	/// compressed size otherwise.
	pub fn from_sizes(
		format: BlobLayoutFormat,
		file_size: u64,
		data_size: u64,
		block_size: u64,
	) -> Result<Self> {
		let merkle_tree_size = merkle::merkle_tree_size(file_size, block_size, format.is_compact());
		let layout = Self { format, file_size, data_size, merkle_tree_size, block_size };
		layout.check_sizes()?;
		Ok(layout)
	}

	/// Reconstructs a layout from an inode.
	///
	/// The exact compressed size of a blob is not stored; for
	/// compressed inodes the stored-data size is the upper bound
	/// implied by the inode's block count, with every byte between
	/// the true compressed size and the bound guaranteed zero.
	pub fn from_inode(format: BlobLayoutFormat, inode: &Inode, block_size: u64) -> Result<Self> {
		let file_size = inode.blob_size.get();
		let block_count = u64::from(inode.block_count.get());
		if !inode.is_compressed() {
			let layout = Self::from_sizes(format, file_size, file_size, block_size)?;
			if layout.total_block_count() != block_count {
				return Err(Error::InvalidArgs(format!(
					"inode block count {block_count} does not match layout ({})",
					layout.total_block_count()
				)));
			}
			return Ok(layout);
		}
		let merkle_tree_size = merkle::merkle_tree_size(file_size, block_size, format.is_compact());
		let data_size = match format {
			BlobLayoutFormat::CompactMerkleTreeAtEnd => (block_count * block_size)
				.checked_sub(merkle_tree_size),
			BlobLayoutFormat::PaddedMerkleTreeAtStart => {
				let merkle_blocks = merkle_tree_size.div_ceil(block_size);
				block_count.checked_sub(merkle_blocks).map(|b| b * block_size)
			}
		};
		let data_size = data_size.ok_or_else(|| {
			Error::InvalidArgs(format!(
				"inode block count {block_count} cannot hold the blob's Merkle tree"
			))
		})?;
		Self::from_sizes(format, file_size, data_size, block_size)
	}

	pub fn format(&self) -> BlobLayoutFormat {
		self.format
	}

	pub fn block_size(&self) -> u64 {
		self.block_size
	}

	/// The uncompressed size of the file.
	pub fn file_size(&self) -> u64 {
		self.file_size
	}

	/// The uncompressed size rounded up to the next block multiple.
	pub fn file_block_aligned_size(&self) -> u64 {
		self.file_size.div_ceil(self.block_size) * self.block_size
	}

	/// Bytes used to store the blob's data. For compressed blobs read
	/// back from an inode this is an upper bound; the bytes between
	/// the true size and the bound are zero.
	pub fn data_size_upper_bound(&self) -> u64 {
		self.data_size
	}

	/// The size of a buffer holding `data_block_count()` blocks.
	pub fn data_block_aligned_size(&self) -> u64 {
		self.data_block_count() * self.block_size
	}

	/// The number of blocks the data spans.
	pub fn data_block_count(&self) -> u64 {
		self.data_size.div_ceil(self.block_size)
	}

	/// The block, within the blob, where the data begins.
	pub fn data_block_offset(&self) -> u64 {
		match self.format {
			BlobLayoutFormat::PaddedMerkleTreeAtStart => self.merkle_tree_block_count(),
			BlobLayoutFormat::CompactMerkleTreeAtEnd => 0,
		}
	}

	/// Byte offset, within the blob, where the data begins.
	pub fn data_offset(&self) -> u64 {
		self.data_block_offset() * self.block_size
	}

	/// Bytes required to store the Merkle tree.
	pub fn merkle_tree_size(&self) -> u64 {
		self.merkle_tree_size
	}

	/// The size of a buffer holding `merkle_tree_block_count()` blocks.
	pub fn merkle_tree_block_aligned_size(&self) -> u64 {
		self.merkle_tree_block_count() * self.block_size
	}

	/// The number of blocks the Merkle tree spans.
	pub fn merkle_tree_block_count(&self) -> u64 {
		self.merkle_tree_size.div_ceil(self.block_size)
	}

	/// Byte offset, within the blob, where the Merkle tree begins.
	pub fn merkle_tree_offset(&self) -> u64 {
		match self.format {
			BlobLayoutFormat::PaddedMerkleTreeAtStart => 0,
			// Aligned so the tree ends exactly at the end of the blob.
			BlobLayoutFormat::CompactMerkleTreeAtEnd => {
				self.total_block_count() * self.block_size - self.merkle_tree_size
			}
		}
	}

	/// First block of the blob containing part of the Merkle tree.
	pub fn merkle_tree_block_offset(&self) -> u64 {
		self.merkle_tree_offset() / self.block_size
	}

	/// Offset of the Merkle tree within its first block.
	pub fn merkle_tree_offset_within_block(&self) -> u64 {
		self.merkle_tree_offset() % self.block_size
	}

	/// Total blocks the blob occupies.
	pub fn total_block_count(&self) -> u64 {
		match self.format {
			BlobLayoutFormat::PaddedMerkleTreeAtStart => {
				self.data_block_count() + self.merkle_tree_block_count()
			}
			BlobLayoutFormat::CompactMerkleTreeAtEnd => {
				(self.data_size + self.merkle_tree_size).div_ceil(self.block_size)
			}
		}
	}

	/// True when the last data block also holds the start of the
	/// Merkle tree.
	pub fn has_merkle_tree_and_data_shared_block(&self) -> bool {
		if self.format == BlobLayoutFormat::PaddedMerkleTreeAtStart {
			return false;
		}
		let merkle_remainder = self.merkle_tree_size % self.block_size;
		let data_remainder = self.data_size % self.block_size;
		// A block-multiple tree or data can never share.
		if merkle_remainder == 0 || data_remainder == 0 {
			return false;
		}
		merkle_remainder + data_remainder <= self.block_size
	}

	fn check_sizes(&self) -> Result<()> {
		let max_block_bytes = MAX_BLOCKS_PER_BLOB.saturating_mul(self.block_size);
		let max_aligned_bytes = u64::MAX - self.block_size + 1;
		if self.file_size > max_aligned_bytes
			|| self.data_size > max_block_bytes
			|| self.merkle_tree_size > max_block_bytes
		{
			return Err(Error::InvalidArgs("blob size out of range".to_string()));
		}
		let total = self
			.data_size
			.checked_add(self.merkle_tree_size)
			.ok_or_else(|| Error::InvalidArgs("blob size out of range".to_string()))?;
		if total > max_block_bytes {
			return Err(Error::InvalidArgs("blob size out of range".to_string()));
		}
		Ok(())
	}
}
