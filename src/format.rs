//! On-disk format: constants, superblock, node table records and
//! extent encoding.
//!
//! Every structure here is written to disk exactly as laid out, all
//! integers little-endian. The format is append-mostly: images are
//! built once, host-side, and the node table and bitmaps only ever
//! grow during a build.

use crate::error::Error;
use crate::error::Result;
use crate::layout::BlobLayoutFormat;
use bitflags::bitflags;
use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;

/// The size of a block in bytes.
pub const BLOCK_SIZE: u64 = 8192;
/// Number of block-bitmap bits that fit in one block.
pub const BLOCK_BITS: u64 = BLOCK_SIZE * 8;

/// First magic number identifying an image.
pub const MAGIC0: u64 = 0xac2153479e694d21;
/// Second magic number identifying an image.
pub const MAGIC1: u64 = 0x985000d4d4d3d314;

/// The major format version. Images with any other value are rejected.
pub const FORMAT_VERSION: u32 = 8;
/// The smallest minor version whose images carry a backup superblock
/// when FVM-hosted.
pub const MINOR_VERSION_BACKUP_SUPERBLOCK: u32 = 8;
/// The minor version written by this engine.
pub const CURRENT_MINOR_VERSION: u32 = 10;
/// The version stamped into every node header.
pub const NODE_VERSION: u16 = 1;

/// The size of the superblock structure in bytes. The superblock
/// occupies all of block 0; bytes past the structure are zero.
pub const SUPERBLOCK_SIZE: usize = 512;
/// Block index of the backup superblock in FVM-hosted images.
pub const BACKUP_SUPERBLOCK_BLOCK: u64 = 1;

/// The size of a node table record in bytes.
pub const NODE_SIZE: usize = 64;
/// Number of node records per block.
pub const NODES_PER_BLOCK: u64 = BLOCK_SIZE / NODE_SIZE as u64;

/// Node id marking the end of a chain.
pub const SENTINEL_NODE: u32 = u32::MAX;

/// Extents that fit inline in an inode.
pub const INLINE_MAX_EXTENTS: u16 = 1;
/// Extents that fit in one extent container.
pub const CONTAINER_MAX_EXTENTS: u16 = 6;
/// Largest block run a single extent can encode (u16 length field).
pub const EXTENT_LENGTH_MAX: u64 = u16::MAX as u64;
/// Largest block number an extent can encode (48-bit start field).
pub const EXTENT_START_MAX: u64 = (1 << 48) - 1;
/// The allocator refuses to spread one blob over more extents than
/// this, well below the encoded u16 ceiling.
pub const MAX_EXTENTS_PER_BLOB: u64 = 1024;
/// Largest number of blocks one blob can span (u32 block count).
pub const MAX_BLOCKS_PER_BLOB: u64 = u32::MAX as u64;

/// The first data block available for allocation; block 0 of the data
/// region is reserved at mkfs time.
pub const START_BLOCK_MINIMUM: u64 = 1;

/// Default node table capacity for fresh images.
pub const DEFAULT_INODE_COUNT: u64 = 10240;
/// Journal region size for host-built images, header included.
pub const MINIMUM_JOURNAL_BLOCKS: u64 = 16;
/// Magic number in the journal header block.
pub const JOURNAL_MAGIC: u64 = 0x626c6f626a6e6c21;

/// FVM-hosted region start blocks. Each region begins at a fixed
/// offset and occupies whole slices.
pub const FVM_BLOCK_MAP_START: u64 = 0x10000;
pub const FVM_NODE_MAP_START: u64 = 0x20000;
pub const FVM_JOURNAL_START: u64 = 0x30000;
pub const FVM_DATA_START: u64 = 0x40000;

bitflags! {
	/// Superblock flag bits.
	#[derive(Clone, Copy, Debug, Eq, PartialEq)]
	pub struct FsFlags: u32 {
		/// The image was cleanly produced or unmounted.
		const CLEAN = 0x1;
		/// The image lives inside a slice-based volume manager and
		/// carries a backup superblock.
		const FVM = 0x2;
	}
}

bitflags! {
	/// Node header flag bits.
	#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
	pub struct NodeFlags: u16 {
		/// The record is live.
		const ALLOCATED = 0x1;
		/// The record is an extent container, not an inode.
		const EXTENT_CONTAINER = 0x2;
		/// The blob's stored bytes are a chunked compressed frame.
		const CHUNK_COMPRESSED = 0x4;
	}
}

/// Number of node records a blob with `extent_count` extents needs:
/// the inode plus enough extent containers for the overflow.
pub fn node_count_for_extents(extent_count: u64) -> u64 {
	let overflow = extent_count.saturating_sub(u64::from(INLINE_MAX_EXTENTS));
	1 + overflow.div_ceil(u64::from(CONTAINER_MAX_EXTENTS))
}

/// A contiguous run of data blocks, packed on disk into a single
/// little-endian u64: start block in the low 48 bits, length in the
/// high 16.
#[derive(Clone, Copy, Default, Eq, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(transparent)]
pub struct Extent(U64);

impl Extent {
	/// Packs `start` and `length` into an extent.
	///
	/// `start` must fit in 48 bits and `length` in 16; the allocator
	/// guarantees both.
	pub fn new(start: u64, length: u16) -> Self {
		debug_assert!(start <= EXTENT_START_MAX);
		Self(U64::new(start | (u64::from(length) << 48)))
	}

	/// First block of the run, relative to the data region.
	pub fn start(&self) -> u64 {
		self.0.get() & EXTENT_START_MAX
	}

	/// Number of blocks in the run.
	pub fn length(&self) -> u64 {
		self.0.get() >> 48
	}
}

impl std::fmt::Debug for Extent {
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(fmt, "Extent[{}, {})", self.start(), self.start() + self.length())
	}
}

/// Common prelude of every node table record.
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct NodeHeader {
	/// `NodeFlags` bits.
	pub flags: U16,
	/// Must equal `NODE_VERSION` on allocated records.
	pub version: U16,
	/// Next node in this blob's chain, or `SENTINEL_NODE`.
	pub next_node: U32,
}

impl NodeHeader {
	pub fn flags(&self) -> NodeFlags {
		NodeFlags::from_bits_truncate(self.flags.get())
	}

	pub fn is_allocated(&self) -> bool {
		self.flags().contains(NodeFlags::ALLOCATED)
	}

	pub fn is_extent_container(&self) -> bool {
		self.flags().contains(NodeFlags::EXTENT_CONTAINER)
	}

	pub fn is_inode(&self) -> bool {
		self.is_allocated() && !self.is_extent_container()
	}

	/// Flag bits set that no known `NodeFlags` bit accounts for.
	pub fn unknown_flags(&self) -> u16 {
		self.flags.get() & !NodeFlags::all().bits()
	}
}

/// A blob's inode: the head record of its node chain.
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Inode {
	pub header: NodeHeader,
	/// Content digest of the logical blob.
	pub merkle_root_hash: [u8; 32],
	/// Uncompressed size of the blob in bytes.
	pub blob_size: U64,
	/// Blocks occupied on disk by data plus Merkle tree.
	pub block_count: U32,
	/// Total extents across the whole chain.
	pub extent_count: U16,
	/// Must be zero.
	pub reserved: U16,
	/// The first `min(extent_count, 1)` extents.
	pub inline_extent: Extent,
}

impl Inode {
	pub fn is_compressed(&self) -> bool {
		self.header.flags().contains(NodeFlags::CHUNK_COMPRESSED)
	}
}

/// An extent container: an overflow record in a blob's node chain.
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ExtentContainer {
	pub header: NodeHeader,
	/// The preceding node in the chain.
	pub previous_node: U32,
	/// Extents stored in this container.
	pub extent_count: U16,
	/// Must be zero.
	pub reserved: U16,
	pub extents: [Extent; CONTAINER_MAX_EXTENTS as usize],
}

/// An untyped node table slot. Interpreted as an `Inode` or an
/// `ExtentContainer` depending on the header flags.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(transparent)]
pub struct RawNode(pub [u8; NODE_SIZE]);

impl RawNode {
	pub fn zeroed() -> Self {
		Self([0; NODE_SIZE])
	}

	pub fn header(&self) -> &NodeHeader {
		&self.as_inode().header
	}

	pub fn as_inode(&self) -> &Inode {
		zerocopy::transmute_ref!(&self.0)
	}

	pub fn as_inode_mut(&mut self) -> &mut Inode {
		zerocopy::transmute_mut!(&mut self.0)
	}

	pub fn as_container(&self) -> &ExtentContainer {
		zerocopy::transmute_ref!(&self.0)
	}

	pub fn as_container_mut(&mut self) -> &mut ExtentContainer {
		zerocopy::transmute_mut!(&mut self.0)
	}

	/// Tells whether every byte of the record is zero, as required of
	/// unallocated slots in strict checking.
	pub fn is_zeroed(&self) -> bool {
		self.0.iter().all(|b| *b == 0)
	}
}

impl Default for RawNode {
	fn default() -> Self {
		Self::zeroed()
	}
}

/// The journal header block's meaningful prefix; the remainder of the
/// block and every later journal block are zero after mkfs.
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct JournalHeader {
	/// Must equal `JOURNAL_MAGIC`.
	pub magic: U64,
	/// Sequence number of the next entry; zero marks the journal empty.
	pub sequence: U64,
}

/// The image superblock, written at byte 0 of the device and, for
/// FVM-hosted images, repeated at `BACKUP_SUPERBLOCK_BLOCK`.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Superblock {
	/// Image identifier, validated before all else.
	pub magic0: U64,
	/// Image identifier, validated before all else.
	pub magic1: U64,
	/// Major format version.
	pub format_version: U32,
	/// `FsFlags` bits.
	pub flags: U32,
	/// Block size in bytes; must equal `BLOCK_SIZE`.
	pub block_size: U32,
	/// Must be zero.
	pub reserved1: U32,
	/// Capacity of the data region in blocks.
	pub data_block_count: U64,
	/// Length of the journal region in blocks, header included.
	pub journal_block_count: U64,
	/// Capacity of the node table in records.
	pub inode_count: U64,
	/// Data blocks currently allocated.
	pub alloc_block_count: U64,
	/// Inodes currently allocated (extent containers excluded).
	pub alloc_inode_count: U64,
	/// `BlobLayoutFormat` discriminant.
	pub blob_layout_format: u8,
	/// Must be zero.
	pub reserved2: [u8; 3],
	/// Smallest minor version whose invariants this image satisfies.
	pub oldest_minor_version: U32,
	/// Bytes per slice; meaningful only with `FsFlags::FVM`.
	pub slice_size: U64,
	/// Slices backing the block bitmap region.
	pub abm_slices: U32,
	/// Slices backing the node table region.
	pub ino_slices: U32,
	/// Slices backing the journal region.
	pub journal_slices: U32,
	/// Slices backing the data region.
	pub dat_slices: U32,
	/// Must be zero.
	pub reserved3: [u8; 408],
}

const _: () = assert!(std::mem::size_of::<Superblock>() == SUPERBLOCK_SIZE);
const _: () = assert!(std::mem::size_of::<Inode>() == NODE_SIZE);
const _: () = assert!(std::mem::size_of::<ExtentContainer>() == NODE_SIZE);

impl Superblock {
	/// Decodes a superblock from the front of `block`.
	pub fn read_from_block(block: &[u8]) -> Result<Self> {
		let (sb, _) = Superblock::read_from_prefix(block)
			.map_err(|_| Error::FormatError("block too short for a superblock".to_string()))?;
		Ok(sb)
	}

	pub fn flags(&self) -> FsFlags {
		FsFlags::from_bits_truncate(self.flags.get())
	}

	pub fn is_fvm(&self) -> bool {
		self.flags().contains(FsFlags::FVM)
	}

	/// Tells whether this image is expected to carry a backup
	/// superblock.
	pub fn has_backup_superblock(&self) -> bool {
		self.is_fvm() && self.oldest_minor_version.get() >= MINOR_VERSION_BACKUP_SUPERBLOCK
	}

	pub fn layout_format(&self) -> Result<BlobLayoutFormat> {
		BlobLayoutFormat::from_u8(self.blob_layout_format)
	}

	/// Blocks needed for the block bitmap region.
	pub fn block_map_block_count(&self) -> u64 {
		self.data_block_count.get().div_ceil(BLOCK_BITS)
	}

	/// Blocks needed for the node table region.
	pub fn node_map_block_count(&self) -> u64 {
		self.inode_count.get().div_ceil(NODES_PER_BLOCK)
	}

	/// Blocks in this image's slice, when FVM-hosted.
	pub fn blocks_per_slice(&self) -> u64 {
		self.slice_size.get() / BLOCK_SIZE
	}

	pub fn block_map_start_block(&self) -> u64 {
		if self.is_fvm() {
			FVM_BLOCK_MAP_START
		} else {
			1
		}
	}

	pub fn node_map_start_block(&self) -> u64 {
		if self.is_fvm() {
			FVM_NODE_MAP_START
		} else {
			self.block_map_start_block() + self.block_map_block_count()
		}
	}

	pub fn journal_start_block(&self) -> u64 {
		if self.is_fvm() {
			FVM_JOURNAL_START
		} else {
			self.node_map_start_block() + self.node_map_block_count()
		}
	}

	pub fn data_start_block(&self) -> u64 {
		if self.is_fvm() {
			FVM_DATA_START
		} else {
			self.journal_start_block() + self.journal_block_count.get()
		}
	}

	/// Total blocks the image occupies on its device.
	pub fn total_blocks(&self) -> u64 {
		if self.is_fvm() {
			self.data_start_block() + u64::from(self.dat_slices.get()) * self.blocks_per_slice()
		} else {
			self.data_start_block() + self.data_block_count.get()
		}
	}

	/// Validates the superblock against the backing device's size.
	///
	/// Magic and version failures are fatal format errors; geometry
	/// that cannot fit the device is rejected as well.
	pub fn check(&self, device_block_count: u64) -> Result<()> {
		if self.magic0.get() != MAGIC0 || self.magic1.get() != MAGIC1 {
			return Err(Error::Integrity(format!(
				"bad superblock magic {:#x}/{:#x}",
				self.magic0.get(),
				self.magic1.get()
			)));
		}
		if self.format_version.get() != FORMAT_VERSION {
			return Err(Error::Unsupported(format!(
				"format version {} (expected {FORMAT_VERSION})",
				self.format_version.get()
			)));
		}
		if u64::from(self.block_size.get()) != BLOCK_SIZE {
			return Err(Error::FormatError(format!(
				"block size {} (expected {BLOCK_SIZE})",
				self.block_size.get()
			)));
		}
		self.layout_format()?;
		if self.inode_count.get() == 0
			|| self.inode_count.get() % NODES_PER_BLOCK != 0
		{
			return Err(Error::NoSpace(format!(
				"inode count {} is not a positive multiple of {NODES_PER_BLOCK}",
				self.inode_count.get()
			)));
		}
		if self.alloc_block_count.get() > self.data_block_count.get() {
			return Err(Error::FormatError(format!(
				"allocated blocks {} exceed capacity {}",
				self.alloc_block_count.get(),
				self.data_block_count.get()
			)));
		}
		if self.alloc_inode_count.get() > self.inode_count.get() {
			return Err(Error::FormatError(format!(
				"allocated inodes {} exceed capacity {}",
				self.alloc_inode_count.get(),
				self.inode_count.get()
			)));
		}
		if self.is_fvm() {
			let slice_size = self.slice_size.get();
			if slice_size == 0 || slice_size % BLOCK_SIZE != 0 {
				return Err(Error::FormatError(format!(
					"slice size {slice_size} is not a block multiple"
				)));
			}
			let per = self.blocks_per_slice();
			if self.block_map_block_count() > u64::from(self.abm_slices.get()) * per
				|| self.node_map_block_count() > u64::from(self.ino_slices.get()) * per
				|| self.journal_block_count.get() > u64::from(self.journal_slices.get()) * per
				|| self.data_block_count.get() > u64::from(self.dat_slices.get()) * per
			{
				return Err(Error::FormatError(
					"region exceeds its slice allocation".to_string(),
				));
			}
		} else if self.total_blocks() > device_block_count {
			return Err(Error::NoSpace(format!(
				"image needs {} blocks, device has {device_block_count}",
				self.total_blocks()
			)));
		}
		Ok(())
	}
}
