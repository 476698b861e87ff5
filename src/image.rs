//! An open image and the ingest path into it.
//!
//! Blob preparation (mapping, compression decision, Merkle tree) is
//! pure and runs on a worker pool; everything that touches the image
//! (allocate, write, populate, commit) runs on the single thread
//! that owns the [`Image`].

use crate::allocator::Allocator;
use crate::allocator::ExtentIterator;
use crate::allocator::ReservedExtent;
use crate::allocator::ReservedNode;
use crate::bitmap::Bitmap;
use crate::compress;
use crate::device::BlockDevice;
use crate::digest::BlobDigest;
use crate::error::Error;
use crate::error::Result;
use crate::format::node_count_for_extents;
use crate::format::Extent;
use crate::format::NodeFlags;
use crate::format::RawNode;
use crate::format::Superblock;
use crate::format::BACKUP_SUPERBLOCK_BLOCK;
use crate::format::BLOCK_SIZE;
use crate::format::NODES_PER_BLOCK;
use crate::format::NODE_VERSION;
use crate::format::SENTINEL_NODE;
use crate::format::SUPERBLOCK_SIZE;
use crate::layout::BlobLayout;
use crate::layout::BlobLayoutFormat;
use crate::merkle::MerkleTree;
use crate::merkle::MerkleTreeVerifier;
use memmap2::Mmap;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// Worker threads used when the hardware concurrency is unknown.
const DEFAULT_CONCURRENCY: usize = 4;

/// Blocks moved per device write when copying blob data.
const WRITE_BATCH_BLOCKS: u64 = 1024;

/// The bytes an ingest will store for a blob.
enum BlobData {
	/// The source file, mapped. Used for uncompressed blobs.
	Mapped(Mmap),
	/// An owned buffer: the compressed frame, or tiny/empty content.
	Owned(Vec<u8>),
}

impl BlobData {
	fn as_slice(&self) -> &[u8] {
		match self {
			BlobData::Mapped(map) => map,
			BlobData::Owned(bytes) => bytes,
		}
	}
}

/// Everything the ingest loop needs to add one blob: produced by the
/// pure prepare phase, consumed against an image.
pub struct BlobInfo {
	digest: BlobDigest,
	merkle_tree: Vec<u8>,
	layout: BlobLayout,
	src_path: PathBuf,
	data: BlobData,
	compressed: bool,
}

impl BlobInfo {
	/// Prepares `path` without attempting compression.
	pub fn create_uncompressed(path: &Path, format: BlobLayoutFormat) -> Result<Self> {
		Self::create(path, format, false)
	}

	/// Prepares `path`, storing the compressed form if that strictly
	/// reduces the blob's block count under `format`.
	pub fn create_compressed(path: &Path, format: BlobLayoutFormat) -> Result<Self> {
		Self::create(path, format, true)
	}

	fn create(path: &Path, format: BlobLayoutFormat, try_compress: bool) -> Result<Self> {
		let file = File::open(path)?;
		let file_size = file.metadata()?.len();
		let data = if file_size == 0 {
			BlobData::Owned(Vec::new())
		} else {
			// Safety: the mapping is read-only and lives only for the
			// build; the manifest contract is that sources do not
			// change mid-build.
			BlobData::Mapped(unsafe { Mmap::map(&file)? })
		};

		let tree = MerkleTree::build(data.as_slice(), format.is_compact());
		let uncompressed = BlobLayout::from_sizes(format, file_size, file_size, BLOCK_SIZE)?;

		if try_compress && file_size > BLOCK_SIZE {
			let frame = compress::compress(data.as_slice())?;
			let compressed = BlobLayout::from_sizes(format, file_size, frame.len() as u64, BLOCK_SIZE)?;
			// Compression pays its way only in whole blocks.
			if compressed.total_block_count() < uncompressed.total_block_count() {
				return Ok(Self {
					digest: tree.root,
					merkle_tree: tree.tree,
					layout: compressed,
					src_path: path.to_path_buf(),
					data: BlobData::Owned(frame),
					compressed: true,
				});
			}
		}

		Ok(Self {
			digest: tree.root,
			merkle_tree: tree.tree,
			layout: uncompressed,
			src_path: path.to_path_buf(),
			data,
			compressed: false,
		})
	}

	pub fn digest(&self) -> &BlobDigest {
		&self.digest
	}

	/// The bytes that will land in the data region.
	pub fn stored_bytes(&self) -> &[u8] {
		self.data.as_slice()
	}

	pub fn merkle_tree(&self) -> &[u8] {
		&self.merkle_tree
	}

	pub fn layout(&self) -> &BlobLayout {
		&self.layout
	}

	pub fn src_path(&self) -> &Path {
		&self.src_path
	}

	pub fn is_compressed(&self) -> bool {
		self.compressed
	}
}

fn worker_count() -> usize {
	std::thread::available_parallelism()
		.map(|n| n.get())
		.unwrap_or(DEFAULT_CONCURRENCY)
}

/// Prepares every file in `paths` on a worker pool and collects the
/// results keyed by digest, deduplicating identical content.
///
/// Workers share a relaxed cancellation flag: after the first
/// failure the remaining workers finish their current file and stop
/// picking up new ones.
pub fn build_blob_set(
	paths: &[PathBuf],
	format: BlobLayoutFormat,
	try_compress: bool,
) -> Result<BTreeMap<BlobDigest, BlobInfo>> {
	let cancelled = AtomicBool::new(false);
	let blobs = Mutex::new(BTreeMap::new());
	let pool = rayon::ThreadPoolBuilder::new()
		.num_threads(worker_count())
		.build()
		.map_err(|_| Error::IllegalState("could not start worker pool"))?;

	pool.install(|| {
		paths.par_iter().try_for_each(|path| {
			if cancelled.load(Ordering::Relaxed) {
				return Ok(());
			}
			let info = match BlobInfo::create(path, format, try_compress) {
				Ok(info) => info,
				Err(e) => {
					cancelled.store(true, Ordering::Relaxed);
					log::error!("failed to prepare {}: {e}", path.display());
					return Err(e);
				}
			};
			let mut blobs = blobs.lock().expect("blob map lock poisoned");
			blobs.insert(*info.digest(), info);
			Ok(())
		})
	})?;

	Ok(blobs.into_inner().expect("blob map lock poisoned"))
}

/// Outcome of adding a blob: newly written, or already present
/// (idempotent by digest, not an error).
#[derive(Debug, Eq, PartialEq)]
pub enum AddOutcome {
	Added { node: u32 },
	AlreadyExists,
}

/// An image open for reading and appending.
pub struct Image<D: BlockDevice> {
	device: D,
	superblock: Superblock,
	allocator: Allocator,
}

impl<D: BlockDevice> Image<D> {
	/// Opens `device`, validating the superblock and loading the
	/// block bitmap and node table.
	pub fn open(mut device: D) -> Result<Self> {
		let mut block = vec![0u8; BLOCK_SIZE as usize];
		device.read_blocks(0, &mut block)?;
		let superblock = Superblock::read_from_block(&block)?;
		superblock.check(device.block_count())?;

		let mut bitmap_bytes =
			vec![0u8; (superblock.block_map_block_count() * BLOCK_SIZE) as usize];
		device.read_blocks(superblock.block_map_start_block(), &mut bitmap_bytes)?;
		let block_bitmap = Bitmap::from_bytes(bitmap_bytes, superblock.data_block_count.get());

		let mut node_bytes =
			vec![0u8; (superblock.node_map_block_count() * BLOCK_SIZE) as usize];
		device.read_blocks(superblock.node_map_start_block(), &mut node_bytes)?;
		let node_table_len = superblock.inode_count.get() as usize * std::mem::size_of::<RawNode>();
		let nodes = <[RawNode]>::ref_from_bytes(&node_bytes[..node_table_len])
			.map_err(|_| Error::FormatError("node table region malformed".to_string()))?
			.to_vec();

		Ok(Self { device, superblock, allocator: Allocator::new(block_bitmap, nodes) })
	}

	pub fn superblock(&self) -> &Superblock {
		&self.superblock
	}

	pub fn layout_format(&self) -> Result<BlobLayoutFormat> {
		self.superblock.layout_format()
	}

	pub(crate) fn allocator(&self) -> &Allocator {
		&self.allocator
	}

	pub(crate) fn device_mut(&mut self) -> &mut D {
		&mut self.device
	}

	pub fn device(&self) -> &D {
		&self.device
	}

	/// The `node_index`-th node table record.
	pub fn get_node(&self, node_index: u32) -> Result<&RawNode> {
		if u64::from(node_index) >= self.superblock.inode_count.get() {
			return Err(Error::InvalidArgs(format!("node id {node_index} out of range")));
		}
		self.allocator.node(node_index)
	}

	/// Finds the inode holding `digest`.
	pub fn find_inode_by_digest(&self, digest: &BlobDigest) -> Result<u32> {
		self.allocator
			.nodes()
			.iter()
			.enumerate()
			.find_map(|(i, node)| {
				(node.header().is_inode()
					&& node.as_inode().merkle_root_hash == *digest.as_bytes())
				.then_some(i as u32)
			})
			.ok_or_else(|| Error::NotFound(digest.to_string()))
	}

	/// Bytes of data-region payload currently allocated.
	pub fn used_data_size(&self) -> u64 {
		self.superblock.alloc_block_count.get() * BLOCK_SIZE
	}

	/// Allocated inode count (extent containers excluded).
	pub fn used_inodes(&self) -> u64 {
		self.superblock.alloc_inode_count.get()
	}

	/// Bytes used by data plus everything reserved ahead of it:
	/// superblock, bitmaps, node table and journal.
	pub fn used_size(&self) -> u64 {
		(self.superblock.data_start_block() + self.superblock.alloc_block_count.get())
			* BLOCK_SIZE
	}

	/// Reads the backup superblock copy.
	pub fn read_backup_superblock(&mut self) -> Result<Superblock> {
		let mut block = vec![0u8; BLOCK_SIZE as usize];
		self.device.read_blocks(BACKUP_SUPERBLOCK_BLOCK, &mut block)?;
		Superblock::read_from_block(&block)
	}

	/// Adds a prepared blob to the image.
	///
	/// Data and Merkle bytes are committed before the node chain is
	/// populated, and the superblock counters are the last write. A
	/// failure in any step releases every reservation; no partial
	/// blob stays visible.
	pub fn add_blob(&mut self, info: &BlobInfo) -> Result<AddOutcome> {
		if self.find_inode_by_digest(info.digest()).is_ok() {
			log::info!("blob {} already present", info.digest());
			return Ok(AddOutcome::AlreadyExists);
		}
		let layout = info.layout();
		if layout.format() != self.layout_format()? {
			return Err(Error::InvalidArgs(
				"blob was prepared for a different layout format".to_string(),
			));
		}

		// Allocate.
		let extents = self.allocator.reserve_blocks(layout.total_block_count())?;
		let node_count = node_count_for_extents(extents.len() as u64);
		let mut nodes = Vec::with_capacity(node_count as usize);
		for i in 0..node_count {
			// Node 0 may only hold a chain head, never a container.
			let reservation = match self.allocator.reserve_node(if i == 0 { 0 } else { 1 }) {
				Ok(reservation) => reservation,
				Err(e) => {
					self.allocator.release_nodes(&nodes);
					self.allocator.release_blocks(&extents);
					return Err(e);
				}
			};
			nodes.push(reservation);
		}

		// Write, populate and commit; unwind the reservations on any
		// failure.
		if let Err(e) = self.write_blob(info, &extents, &nodes) {
			self.allocator.release_nodes(&nodes);
			self.allocator.release_blocks(&extents);
			return Err(e);
		}

		let committed = self.allocator.commit_blocks(&extents);
		self.allocator.commit_nodes(&nodes);
		self.superblock.alloc_block_count =
			(self.superblock.alloc_block_count.get() + committed).into();
		self.superblock.alloc_inode_count =
			(self.superblock.alloc_inode_count.get() + 1).into();
		self.write_info()?;

		log::info!(
			"added blob {} ({} blocks, {} extents{})",
			info.digest(),
			layout.total_block_count(),
			extents.len(),
			if info.is_compressed() { ", compressed" } else { "" }
		);
		Ok(AddOutcome::Added { node: nodes[0].node() })
	}

	fn write_blob(
		&mut self,
		info: &BlobInfo,
		extents: &[ReservedExtent],
		nodes: &[ReservedNode],
	) -> Result<()> {
		self.write_data(info, extents)?;
		self.write_merkle_tree(info, extents)?;
		self.populate_node_chain(info, extents, nodes)?;
		for reservation in nodes {
			self.write_node(reservation.node())?;
		}
		for reservation in extents {
			self.write_block_bitmap(reservation.extent())?;
		}
		Ok(())
	}

	/// Device block backing blob-relative block `blob_block`.
	fn device_block_for(&self, extents: &[ReservedExtent], blob_block: u64) -> u64 {
		let mut remaining = blob_block;
		for reservation in extents {
			let extent = reservation.extent();
			if remaining < extent.length() {
				return self.superblock.data_start_block() + extent.start() + remaining;
			}
			remaining -= extent.length();
		}
		unreachable!("blob block {blob_block} beyond reserved extents");
	}

	/// Writes the stored bytes into the blob's data blocks, zero
	/// padding the final partial block.
	fn write_data(&mut self, info: &BlobInfo, extents: &[ReservedExtent]) -> Result<()> {
		let layout = info.layout();
		let data = info.stored_bytes();
		let first = layout.data_block_offset();
		let block_count = layout.data_block_count();

		let mut block = first;
		while block < first + block_count {
			// Batch physically contiguous blob blocks into one write.
			let mut run = 1u64;
			let device_start = self.device_block_for(extents, block);
			while block + run < first + block_count
				&& run < WRITE_BATCH_BLOCKS
				&& self.device_block_for(extents, block + run) == device_start + run
			{
				run += 1;
			}
			let mut buf = vec![0u8; (run * BLOCK_SIZE) as usize];
			for i in 0..run {
				let data_block = block + i - first;
				let start = (data_block * BLOCK_SIZE) as usize;
				let end = data.len().min(start + BLOCK_SIZE as usize);
				if start < end {
					let at = (i * BLOCK_SIZE) as usize;
					buf[at..at + (end - start)].copy_from_slice(&data[start..end]);
				}
			}
			self.device.write_blocks(device_start, &buf)?;
			block += run;
		}
		Ok(())
	}

	/// Writes the Merkle tree into its blocks. On the compact layout
	/// the first tree block may be shared with the last data block:
	/// read it back and merge so the data prefix survives.
	fn write_merkle_tree(&mut self, info: &BlobInfo, extents: &[ReservedExtent]) -> Result<()> {
		let layout = info.layout();
		let tree = info.merkle_tree();
		if tree.is_empty() {
			return Ok(());
		}
		let first_block = layout.merkle_tree_block_offset();
		let within = layout.merkle_tree_offset_within_block() as usize;

		let mut buf = vec![0u8; BLOCK_SIZE as usize];
		let mut written = 0usize;
		let mut blob_block = first_block;
		while written < tree.len() {
			let device_block = self.device_block_for(extents, blob_block);
			buf.fill(0);
			let offset = if written == 0 { within } else { 0 };
			if written == 0 && layout.has_merkle_tree_and_data_shared_block() {
				self.device.read_blocks(device_block, &mut buf)?;
				buf[offset..].fill(0);
			}
			let take = (BLOCK_SIZE as usize - offset).min(tree.len() - written);
			buf[offset..offset + take].copy_from_slice(&tree[written..written + take]);
			written += take;
			self.device.write_blocks(device_block, &buf)?;
			blob_block += 1;
		}
		Ok(())
	}

	/// Fills the inode and any extent containers for a freshly
	/// written blob.
	fn populate_node_chain(
		&mut self,
		info: &BlobInfo,
		extents: &[ReservedExtent],
		nodes: &[ReservedNode],
	) -> Result<()> {
		let layout = info.layout();
		let head = nodes[0].node();

		let mut flags = NodeFlags::ALLOCATED;
		if info.is_compressed() {
			flags |= NodeFlags::CHUNK_COMPRESSED;
		}
		{
			let record = self.allocator.node_mut(head)?;
			*record = RawNode::zeroed();
			let inode = record.as_inode_mut();
			inode.header.flags = flags.bits().into();
			inode.header.version = NODE_VERSION.into();
			inode.header.next_node = SENTINEL_NODE.into();
			inode.merkle_root_hash = *info.digest().as_bytes();
			inode.blob_size = layout.file_size().into();
			inode.block_count = (layout.total_block_count() as u32).into();
			inode.extent_count = (extents.len() as u16).into();
			if let Some(first) = extents.first() {
				inode.inline_extent = first.extent();
			}
		}

		// Overflow extents go into containers, in chain order.
		let container_flags = NodeFlags::ALLOCATED | NodeFlags::EXTENT_CONTAINER;
		let mut previous = head;
		let overflow: Vec<Extent> =
			extents.iter().skip(1).map(|r| r.extent()).collect();
		for (reservation, chunk) in nodes[1..]
			.iter()
			.zip(overflow.chunks(crate::format::CONTAINER_MAX_EXTENTS as usize))
		{
			let id = reservation.node();
			{
				let record = self.allocator.node_mut(previous)?;
				record.as_inode_mut().header.next_node = id.into();
			}
			let record = self.allocator.node_mut(id)?;
			*record = RawNode::zeroed();
			let container = record.as_container_mut();
			container.header.flags = container_flags.bits().into();
			container.header.version = NODE_VERSION.into();
			container.header.next_node = SENTINEL_NODE.into();
			container.previous_node = previous.into();
			container.extent_count = (chunk.len() as u16).into();
			container.extents[..chunk.len()].copy_from_slice(chunk);
			previous = id;
		}
		Ok(())
	}

	/// Persists the node table block holding `node_index`.
	fn write_node(&mut self, node_index: u32) -> Result<()> {
		let block = u64::from(node_index) / NODES_PER_BLOCK;
		let first = (block * NODES_PER_BLOCK) as usize;
		let slice = &self.allocator.nodes()[first..first + NODES_PER_BLOCK as usize];
		let bytes = slice.as_bytes().to_vec();
		self.device.write_blocks(self.superblock.node_map_start_block() + block, &bytes)
	}

	/// Persists the block bitmap blocks covering `extent`.
	fn write_block_bitmap(&mut self, extent: Extent) -> Result<()> {
		let first_block = extent.start() / crate::format::BLOCK_BITS;
		let last_block = (extent.start() + extent.length() - 1) / crate::format::BLOCK_BITS;
		let bytes = self.allocator.block_bitmap().as_bytes();
		let start = (first_block * BLOCK_SIZE) as usize;
		let end = (((last_block + 1) * BLOCK_SIZE) as usize).min(bytes.len());
		let mut buf = bytes[start..end].to_vec();
		buf.resize(((last_block - first_block + 1) * BLOCK_SIZE) as usize, 0);
		self.device
			.write_blocks(self.superblock.block_map_start_block() + first_block, &buf)
	}

	/// Persists the superblock, and its backup where present.
	pub(crate) fn write_info(&mut self) -> Result<()> {
		let mut block = vec![0u8; BLOCK_SIZE as usize];
		block[..SUPERBLOCK_SIZE].copy_from_slice(self.superblock.as_bytes());
		self.device.write_blocks(0, &block)?;
		if self.superblock.has_backup_superblock() {
			self.device.write_blocks(BACKUP_SUPERBLOCK_BLOCK, &block)?;
		}
		Ok(())
	}

	/// Reads every block of the blob at `node_index` into one buffer
	/// laid out exactly as on disk.
	fn read_blob_blocks(&mut self, node_index: u32, layout: &BlobLayout) -> Result<Vec<u8>> {
		let extents: Vec<Extent> =
			ExtentIterator::new(self.allocator.nodes(), node_index)?.collect::<Result<_>>()?;
		let total: u64 = extents.iter().map(Extent::length).sum();
		if total != layout.total_block_count() {
			return Err(Error::FormatError(format!(
				"node {node_index}: extents cover {total} blocks, layout needs {}",
				layout.total_block_count()
			)));
		}
		let mut buf = vec![0u8; (total * BLOCK_SIZE) as usize];
		let mut filled = 0usize;
		let data_start = self.superblock.data_start_block();
		for extent in extents {
			let len = (extent.length() * BLOCK_SIZE) as usize;
			self.device
				.read_blocks(data_start + extent.start(), &mut buf[filled..filled + len])?;
			filled += len;
		}
		Ok(buf)
	}

	/// Loads the blob at `node_index`, verifies it against its Merkle
	/// tree, and returns the logical (decompressed) content.
	pub fn load_and_verify_blob(&mut self, node_index: u32) -> Result<Vec<u8>> {
		let record = *self.get_node(node_index)?;
		if !record.header().is_inode() {
			return Err(Error::InvalidArgs(format!("node {node_index} is not an inode")));
		}
		let inode = record.as_inode();
		let digest = BlobDigest::from(inode.merkle_root_hash);
		let format = self.layout_format()?;
		let layout = BlobLayout::from_inode(format, inode, BLOCK_SIZE)?;

		let blocks = self.read_blob_blocks(node_index, &layout)?;
		let tree_start = layout.merkle_tree_offset() as usize;
		let tree = &blocks[tree_start..tree_start + layout.merkle_tree_size() as usize];
		let data_start = layout.data_offset() as usize;
		let stored =
			&blocks[data_start..data_start + layout.data_size_upper_bound() as usize];

		let logical: Vec<u8>;
		let content: &[u8] = if inode.is_compressed() {
			let frame_len = compress::frame_size(stored)?;
			if frame_len > stored.len() {
				return Err(Error::FormatError(format!(
					"node {node_index}: compressed frame larger than its blocks"
				)));
			}
			// Anything between the frame and the data-size bound must
			// be zero.
			crate::merkle::verify_tail_zeroed(stored, frame_len as u64)?;
			logical = compress::decompress(stored)?;
			if logical.len() as u64 != layout.file_size() {
				return Err(Error::FormatError(format!(
					"node {node_index}: decompressed {} bytes, inode says {}",
					logical.len(),
					layout.file_size()
				)));
			}
			&logical
		} else {
			if layout.data_size_upper_bound() != layout.file_size() {
				return Err(Error::FormatError(format!(
					"node {node_index}: stored size does not match file size"
				)));
			}
			stored
		};

		let verifier = MerkleTreeVerifier::new(
			digest,
			tree,
			layout.file_size(),
			format.is_compact(),
			None,
		)?;
		verifier.verify(content, layout.file_size())?;
		Ok(content.to_vec())
	}

	/// Calls `visitor` with (digest, logical bytes) for every blob,
	/// verifying each before it is surfaced. Visitor errors abort the
	/// walk.
	pub fn visit_blobs<F>(&mut self, mut visitor: F) -> Result<()>
	where
		F: FnMut(&BlobDigest, &[u8]) -> Result<()>,
	{
		for node_index in 0..self.superblock.inode_count.get() as u32 {
			let record = *self.get_node(node_index)?;
			if !record.header().is_inode() {
				continue;
			}
			let digest = BlobDigest::from(record.as_inode().merkle_root_hash);
			let content = self.load_and_verify_blob(node_index)?;
			visitor(&digest, &content)?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::format::INLINE_MAX_EXTENTS;
	use crate::format::MAX_EXTENTS_PER_BLOB;
	use crate::mkfs;
	use crate::mkfs::FilesystemOptions;
	use std::io::Write as _;

	fn make_image(block_count: u64, options: FilesystemOptions) -> Image<crate::device::FileDevice> {
		let file = tempfile::tempfile().unwrap();
		file.set_len(block_count * BLOCK_SIZE).unwrap();
		let mut device = crate::device::FileDevice::new(file, block_count);
		mkfs::make_image(&mut device, block_count, &options).unwrap();
		Image::open(device).unwrap()
	}

	fn blob_file(contents: &[u8]) -> tempfile::NamedTempFile {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		file.write_all(contents).unwrap();
		file.flush().unwrap();
		file
	}

	fn compact_options() -> FilesystemOptions {
		FilesystemOptions {
			blob_layout_format: BlobLayoutFormat::CompactMerkleTreeAtEnd,
			..FilesystemOptions::default()
		}
	}

	fn padded_options() -> FilesystemOptions {
		FilesystemOptions {
			blob_layout_format: BlobLayoutFormat::PaddedMerkleTreeAtStart,
			..FilesystemOptions::default()
		}
	}

	fn add_file(image: &mut Image<crate::device::FileDevice>, contents: &[u8]) -> u32 {
		let file = blob_file(contents);
		let info = BlobInfo::create_uncompressed(
			file.path(),
			image.layout_format().unwrap(),
		)
		.unwrap();
		match image.add_blob(&info).unwrap() {
			AddOutcome::Added { node } => node,
			AddOutcome::AlreadyExists => panic!("blob unexpectedly present"),
		}
	}

	fn test_data(len: usize) -> Vec<u8> {
		(0..len).map(|i| (i % 251) as u8).collect()
	}

	#[test]
	fn empty_blob_takes_a_node_and_no_blocks() {
		let mut image = make_image(600, compact_options());
		let before = image.superblock().alloc_block_count.get();
		let node = add_file(&mut image, &[]);

		let inode = *image.get_node(node).unwrap().as_inode();
		assert_eq!(inode.block_count.get(), 0);
		assert_eq!(inode.extent_count.get(), 0);
		assert_eq!(image.superblock().alloc_block_count.get(), before);
		assert_eq!(image.superblock().alloc_inode_count.get(), 1);
		assert_eq!(image.load_and_verify_blob(node).unwrap(), Vec::<u8>::new());
	}

	#[test]
	fn shared_block_blob_round_trips_compact() {
		let mut image = make_image(600, compact_options());
		// Two blocks minus one tree: data and tree share the second
		// block under the compact layout.
		let data = test_data(2 * BLOCK_SIZE as usize - 64);
		let node = add_file(&mut image, &data);

		let inode = *image.get_node(node).unwrap().as_inode();
		assert_eq!(inode.block_count.get(), 2);
		assert!(!inode.is_compressed());
		assert_eq!(image.load_and_verify_blob(node).unwrap(), data);
	}

	#[test]
	fn same_file_under_padded_format_needs_an_extra_block() {
		let mut image = make_image(600, padded_options());
		let data = test_data(2 * BLOCK_SIZE as usize - 64);
		let node = add_file(&mut image, &data);

		let inode = *image.get_node(node).unwrap().as_inode();
		assert_eq!(inode.block_count.get(), 3);
		assert_eq!(image.load_and_verify_blob(node).unwrap(), data);
	}

	#[test]
	fn compressible_blob_stores_compressed() {
		let mut image = make_image(600, compact_options());
		let file = blob_file(&vec![0u8; 12 * 1024]);
		let info =
			BlobInfo::create_compressed(file.path(), BlobLayoutFormat::CompactMerkleTreeAtEnd)
				.unwrap();
		assert!(info.is_compressed());

		let node = match image.add_blob(&info).unwrap() {
			AddOutcome::Added { node } => node,
			outcome => panic!("unexpected outcome {outcome:?}"),
		};
		let inode = *image.get_node(node).unwrap().as_inode();
		assert!(inode.is_compressed());
		assert_eq!(inode.block_count.get(), 1);
		assert_eq!(image.load_and_verify_blob(node).unwrap(), vec![0u8; 12 * 1024]);
	}

	#[test]
	fn incompressible_blob_stays_uncompressed() {
		// Pseudo-random bytes do not compress into fewer blocks.
		let mut data = Vec::with_capacity(2 * BLOCK_SIZE as usize);
		let mut state = 0x12345678u32;
		while data.len() < 2 * BLOCK_SIZE as usize {
			state = state.wrapping_mul(1664525).wrapping_add(1013904223);
			data.extend_from_slice(&state.to_le_bytes());
		}
		let file = blob_file(&data);
		let info =
			BlobInfo::create_compressed(file.path(), BlobLayoutFormat::CompactMerkleTreeAtEnd)
				.unwrap();
		assert!(!info.is_compressed());
	}

	#[test]
	fn tiny_file_is_never_compressed() {
		let file = blob_file(&vec![0u8; BLOCK_SIZE as usize]);
		let info =
			BlobInfo::create_compressed(file.path(), BlobLayoutFormat::CompactMerkleTreeAtEnd)
				.unwrap();
		assert!(!info.is_compressed());
	}

	#[test]
	fn duplicate_add_is_idempotent() {
		let mut image = make_image(600, compact_options());
		let data = test_data(10_000);
		let file = blob_file(&data);
		let info = BlobInfo::create_uncompressed(
			file.path(),
			BlobLayoutFormat::CompactMerkleTreeAtEnd,
		)
		.unwrap();

		assert!(matches!(image.add_blob(&info).unwrap(), AddOutcome::Added { .. }));
		let blocks = image.superblock().alloc_block_count.get();
		let inodes = image.superblock().alloc_inode_count.get();

		assert_eq!(image.add_blob(&info).unwrap(), AddOutcome::AlreadyExists);
		assert_eq!(image.superblock().alloc_block_count.get(), blocks);
		assert_eq!(image.superblock().alloc_inode_count.get(), inodes);
	}

	#[test]
	fn fragmented_allocation_builds_a_container_chain() {
		let mut image = make_image(600, compact_options());
		// Pin every third data block so free space is split into
		// two-block runs and a large blob has to span many extents.
		let data_blocks = image.superblock().data_block_count.get();
		for block in (1..data_blocks).step_by(3) {
			image.allocator.set_block(block);
		}

		let data = test_data(12 * BLOCK_SIZE as usize);
		let node = add_file(&mut image, &data);
		let inode = *image.get_node(node).unwrap().as_inode();
		assert!(u64::from(inode.extent_count.get()) > u64::from(INLINE_MAX_EXTENTS));
		assert_ne!(inode.header.next_node.get(), SENTINEL_NODE);

		let container = image.get_node(inode.header.next_node.get()).unwrap();
		assert!(container.header().is_extent_container());
		assert_eq!(
			u64::from(container.as_container().extent_count.get()),
			u64::from(inode.extent_count.get()) - u64::from(INLINE_MAX_EXTENTS)
		);
		assert_eq!(image.load_and_verify_blob(node).unwrap(), data);
	}

	#[test]
	fn over_fragmented_allocation_fails_and_unwinds() {
		let mut image = make_image(
			MAX_EXTENTS_PER_BLOB * 2 + 2200,
			FilesystemOptions {
				blob_layout_format: BlobLayoutFormat::CompactMerkleTreeAtEnd,
				num_inodes: 512,
				..FilesystemOptions::default()
			},
		);
		// Pin alternating data blocks: every free run is one block, so
		// a blob larger than MAX_EXTENTS_PER_BLOB blocks cannot fit
		// within the extent limit.
		let data_blocks = image.superblock().data_block_count.get();
		for block in (1..data_blocks).step_by(2) {
			image.allocator.set_block(block);
		}
		let blocks_before = image.superblock().alloc_block_count.get();
		let inodes_before = image.superblock().alloc_inode_count.get();

		let data = test_data(((MAX_EXTENTS_PER_BLOB + 2) * BLOCK_SIZE) as usize);
		let file = blob_file(&data);
		let info = BlobInfo::create_uncompressed(
			file.path(),
			BlobLayoutFormat::CompactMerkleTreeAtEnd,
		)
		.unwrap();
		assert!(matches!(image.add_blob(&info), Err(Error::TooFragmented { .. })));

		assert_eq!(image.superblock().alloc_block_count.get(), blocks_before);
		assert_eq!(image.superblock().alloc_inode_count.get(), inodes_before);
		// A small blob still goes in afterwards.
		let node = add_file(&mut image, &test_data(100));
		assert_eq!(image.load_and_verify_blob(node).unwrap(), test_data(100));
	}

	#[test]
	fn visit_blobs_sees_every_blob() {
		let mut image = make_image(600, compact_options());
		let first = test_data(100);
		let second = test_data(3 * BLOCK_SIZE as usize + 11);
		add_file(&mut image, &first);
		add_file(&mut image, &second);

		let mut seen = Vec::new();
		image
			.visit_blobs(|digest, content| {
				seen.push((*digest, content.to_vec()));
				Ok(())
			})
			.unwrap();
		assert_eq!(seen.len(), 2);
		assert!(seen.iter().any(|(_, c)| *c == first));
		assert!(seen.iter().any(|(_, c)| *c == second));
	}

	#[test]
	fn visit_blobs_forwards_visitor_errors() {
		let mut image = make_image(600, compact_options());
		add_file(&mut image, &test_data(10));
		let result = image.visit_blobs(|_, _| Err(Error::IllegalState("stop")));
		assert!(matches!(result, Err(Error::IllegalState("stop"))));
	}

	#[test]
	fn lookup_by_unknown_digest_is_not_found() {
		let image = make_image(600, compact_options());
		let digest = BlobDigest::hash(b"not in the image");
		assert!(matches!(
			image.find_inode_by_digest(&digest),
			Err(Error::NotFound(_))
		));
	}

	#[test]
	fn usage_queries_track_allocation() {
		let mut image = make_image(600, compact_options());
		assert_eq!(image.used_inodes(), 0);
		let metadata = image.superblock().data_start_block() * BLOCK_SIZE;
		assert_eq!(image.used_data_size(), BLOCK_SIZE);
		assert_eq!(image.used_size(), metadata + BLOCK_SIZE);

		add_file(&mut image, &test_data(3 * BLOCK_SIZE as usize));
		// Three data blocks plus one for the Merkle tree.
		assert_eq!(image.used_data_size(), 5 * BLOCK_SIZE);
		assert_eq!(image.used_inodes(), 1);
		assert_eq!(image.used_size(), metadata + 5 * BLOCK_SIZE);
	}

	#[test]
	fn get_node_rejects_out_of_range_ids() {
		let image = make_image(600, compact_options());
		assert!(image.get_node(SENTINEL_NODE - 1).is_err());
	}

	#[test]
	fn build_blob_set_dedupes_identical_content() {
		let a = blob_file(b"same bytes");
		let b = blob_file(b"same bytes");
		let c = blob_file(b"different bytes");
		let paths = vec![
			a.path().to_path_buf(),
			b.path().to_path_buf(),
			c.path().to_path_buf(),
		];
		let blobs =
			build_blob_set(&paths, BlobLayoutFormat::CompactMerkleTreeAtEnd, true).unwrap();
		assert_eq!(blobs.len(), 2);
	}

	#[test]
	fn build_blob_set_reports_missing_files() {
		let paths = vec![PathBuf::from("/nonexistent/blob/source")];
		assert!(
			build_blob_set(&paths, BlobLayoutFormat::CompactMerkleTreeAtEnd, false).is_err()
		);
	}

	#[test]
	fn no_space_leaves_image_unchanged() {
		let mut image = make_image(
			40,
			FilesystemOptions {
				blob_layout_format: BlobLayoutFormat::CompactMerkleTreeAtEnd,
				num_inodes: 128,
				..FilesystemOptions::default()
			},
		);
		let blocks = image.superblock().alloc_block_count.get();
		let inodes = image.superblock().alloc_inode_count.get();

		let file = blob_file(&test_data(BLOCK_SIZE as usize * 64));
		let info = BlobInfo::create_uncompressed(
			file.path(),
			BlobLayoutFormat::CompactMerkleTreeAtEnd,
		)
		.unwrap();
		assert!(matches!(image.add_blob(&info), Err(Error::NoSpace(_))));

		assert_eq!(image.superblock().alloc_block_count.get(), blocks);
		assert_eq!(image.superblock().alloc_inode_count.get(), inodes);
		assert_eq!(image.allocator().block_bitmap().popcount(), blocks);
	}
}
