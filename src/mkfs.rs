//! Image initialization: region geometry, superblock, bitmaps, node
//! table and an empty journal.

use crate::device::BlockDevice;
use crate::error::Error;
use crate::error::Result;
use crate::format::node_count_for_extents;
use crate::format::JournalHeader;
use crate::format::Superblock;
use crate::format::BACKUP_SUPERBLOCK_BLOCK;
use crate::format::BLOCK_BITS;
use crate::format::BLOCK_SIZE;
use crate::format::CURRENT_MINOR_VERSION;
use crate::format::DEFAULT_INODE_COUNT;
use crate::format::EXTENT_LENGTH_MAX;
use crate::format::FORMAT_VERSION;
use crate::format::FVM_BLOCK_MAP_START;
use crate::format::FVM_DATA_START;
use crate::format::FVM_JOURNAL_START;
use crate::format::FVM_NODE_MAP_START;
use crate::format::FsFlags;
use crate::format::JOURNAL_MAGIC;
use crate::format::MAGIC0;
use crate::format::MAGIC1;
use crate::format::MINIMUM_JOURNAL_BLOCKS;
use crate::format::NODES_PER_BLOCK;
use crate::format::START_BLOCK_MINIMUM;
use crate::format::SUPERBLOCK_SIZE;
use crate::image::BlobInfo;
use crate::layout::BlobLayoutFormat;
use zerocopy::IntoBytes;

/// Options controlling a fresh image.
#[derive(Clone, Copy, Debug)]
pub struct FilesystemOptions {
	/// Capacity of the node table; rounded up to fill whole blocks.
	pub num_inodes: u64,
	/// Layout format stamped into the superblock.
	pub blob_layout_format: BlobLayoutFormat,
	/// When set, the image is FVM-hosted with this slice size.
	pub fvm_slice_size: Option<u64>,
}

impl Default for FilesystemOptions {
	fn default() -> Self {
		Self {
			num_inodes: DEFAULT_INODE_COUNT,
			blob_layout_format: BlobLayoutFormat::CompactMerkleTreeAtEnd,
			fvm_slice_size: None,
		}
	}
}

/// Computes the superblock for a fresh image of `block_count` device
/// blocks.
pub fn initialize_superblock(block_count: u64, options: &FilesystemOptions) -> Result<Superblock> {
	if options.num_inodes == 0 {
		return Err(Error::InvalidArgs("inode count must be non-zero".to_string()));
	}
	let inode_count = options.num_inodes.div_ceil(NODES_PER_BLOCK) * NODES_PER_BLOCK;
	let node_map_blocks = inode_count / NODES_PER_BLOCK;

	let mut superblock = Superblock {
		magic0: MAGIC0.into(),
		magic1: MAGIC1.into(),
		format_version: FORMAT_VERSION.into(),
		flags: FsFlags::CLEAN.bits().into(),
		block_size: (BLOCK_SIZE as u32).into(),
		reserved1: 0.into(),
		data_block_count: 0.into(),
		journal_block_count: MINIMUM_JOURNAL_BLOCKS.into(),
		inode_count: inode_count.into(),
		alloc_block_count: START_BLOCK_MINIMUM.into(),
		alloc_inode_count: 0.into(),
		blob_layout_format: options.blob_layout_format as u8,
		reserved2: [0; 3],
		oldest_minor_version: CURRENT_MINOR_VERSION.into(),
		slice_size: 0.into(),
		abm_slices: 0.into(),
		ino_slices: 0.into(),
		journal_slices: 0.into(),
		dat_slices: 0.into(),
		reserved3: [0; 408],
	};

	match options.fvm_slice_size {
		None => {
			let fixed = 1 + node_map_blocks + MINIMUM_JOURNAL_BLOCKS;
			let remaining = block_count.checked_sub(fixed).ok_or_else(|| {
				Error::NoSpace(format!("{block_count} blocks cannot hold the metadata regions"))
			})?;
			let block_map_blocks = remaining.div_ceil(BLOCK_BITS);
			let data_blocks = remaining.checked_sub(block_map_blocks).filter(|d| *d > 0);
			let data_blocks = data_blocks.ok_or_else(|| {
				Error::NoSpace(format!("{block_count} blocks leave no data region"))
			})?;
			superblock.data_block_count = data_blocks.into();
		}
		Some(slice_size) => {
			if slice_size == 0 || slice_size % BLOCK_SIZE != 0 {
				return Err(Error::InvalidArgs(format!(
					"slice size {slice_size} is not a block multiple"
				)));
			}
			let bps = slice_size / BLOCK_SIZE;
			let data_capacity = block_count.checked_sub(FVM_DATA_START).unwrap_or(0);
			let dat_slices = data_capacity / bps;
			if dat_slices == 0 {
				return Err(Error::NoSpace(format!(
					"{block_count} blocks cannot host an FVM image with {slice_size}-byte slices"
				)));
			}
			let data_blocks = dat_slices * bps;
			let block_map_blocks = data_blocks.div_ceil(BLOCK_BITS);
			let abm_slices = block_map_blocks.div_ceil(bps);
			let ino_slices = node_map_blocks.div_ceil(bps);
			let journal_slices = MINIMUM_JOURNAL_BLOCKS.div_ceil(bps);
			if abm_slices * bps > FVM_NODE_MAP_START - FVM_BLOCK_MAP_START
				|| ino_slices * bps > FVM_JOURNAL_START - FVM_NODE_MAP_START
				|| journal_slices * bps > FVM_DATA_START - FVM_JOURNAL_START
			{
				return Err(Error::NoSpace(
					"a metadata region overflows its reserved span".to_string(),
				));
			}
			superblock.flags = (FsFlags::CLEAN | FsFlags::FVM).bits().into();
			superblock.slice_size = slice_size.into();
			superblock.data_block_count = data_blocks.into();
			// The journal region rounds up to whole slices.
			superblock.journal_block_count = (journal_slices * bps).into();
			superblock.abm_slices = (abm_slices as u32).into();
			superblock.ino_slices = (ino_slices as u32).into();
			superblock.journal_slices = (journal_slices as u32).into();
			superblock.dat_slices = (dat_slices as u32).into();
		}
	}

	superblock.check(block_count)?;
	Ok(superblock)
}

/// Formats `device` as an empty image of `block_count` blocks.
pub fn make_image<D: BlockDevice>(
	device: &mut D,
	block_count: u64,
	options: &FilesystemOptions,
) -> Result<()> {
	let superblock = initialize_superblock(block_count, options)?;
	log::info!(
		"formatting: {} data blocks, {} inodes, journal {} blocks{}",
		superblock.data_block_count.get(),
		superblock.inode_count.get(),
		superblock.journal_block_count.get(),
		if superblock.is_fvm() { ", FVM-hosted" } else { "" }
	);

	// Superblock, then its backup where the format carries one.
	let mut block = vec![0u8; BLOCK_SIZE as usize];
	block[..SUPERBLOCK_SIZE].copy_from_slice(superblock.as_bytes());
	device.write_blocks(0, &block)?;
	if superblock.has_backup_superblock() {
		device.write_blocks(BACKUP_SUPERBLOCK_BLOCK, &block)?;
	}

	// Block bitmap: clear except the reserved start blocks.
	let bitmap_blocks = superblock.block_map_block_count();
	let mut bitmap = vec![0u8; (bitmap_blocks * BLOCK_SIZE) as usize];
	for bit in 0..START_BLOCK_MINIMUM {
		bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
	}
	device.write_blocks(superblock.block_map_start_block(), &bitmap)?;

	// Node table: all slots zero.
	let zero_block = vec![0u8; BLOCK_SIZE as usize];
	let node_map_start = superblock.node_map_start_block();
	for i in 0..superblock.node_map_block_count() {
		device.write_blocks(node_map_start + i, &zero_block)?;
	}

	// Journal: a header block marking the journal empty, then zeros.
	let mut journal_block = vec![0u8; BLOCK_SIZE as usize];
	let header = JournalHeader { magic: JOURNAL_MAGIC.into(), sequence: 0.into() };
	journal_block[..std::mem::size_of::<JournalHeader>()].copy_from_slice(header.as_bytes());
	let journal_start = superblock.journal_start_block();
	device.write_blocks(journal_start, &journal_block)?;
	for i in 1..superblock.journal_block_count.get() {
		device.write_blocks(journal_start + i, &zero_block)?;
	}

	Ok(())
}

/// Data blocks and node records a set of prepared blobs will consume,
/// assuming unfragmented allocation. Used to size a fresh image.
pub fn required_image_size<'a>(
	blobs: impl IntoIterator<Item = &'a BlobInfo>,
) -> (u64, u64) {
	let mut data_blocks = 0u64;
	let mut node_count = 0u64;
	for blob in blobs {
		let blocks = blob.layout().total_block_count();
		data_blocks += blocks;
		let extents = blocks.div_ceil(EXTENT_LENGTH_MAX).max(1);
		node_count += node_count_for_extents(extents);
	}
	(data_blocks, node_count)
}
