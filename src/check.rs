//! Consistency checking for images at rest.
//!
//! The checker validates the superblock pair, cross-checks the block
//! bitmap and node table against each other and the allocation
//! counters, and verifies every blob's bytes against its Merkle
//! root. Findings accumulate into a report; only an unreadable or
//! mis-identified superblock aborts the run.

use crate::allocator::ExtentIterator;
use crate::device::BlockDevice;
use crate::digest::BlobDigest;
use crate::error::Result;
use crate::format::Extent;
use crate::format::NodeFlags;
use crate::format::BLOCK_SIZE;
use crate::format::FVM_BLOCK_MAP_START;
use crate::format::FVM_DATA_START;
use crate::format::FVM_JOURNAL_START;
use crate::format::FVM_NODE_MAP_START;
use crate::format::NODE_VERSION;
use crate::format::SENTINEL_NODE;
use crate::format::START_BLOCK_MINIMUM;
use crate::format::SUPERBLOCK_SIZE;
use crate::image::Image;
use crate::layout::BlobLayout;
use zerocopy::IntoBytes;

/// Options controlling a check run.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsckOptions {
	/// Also require reserved fields zero, no unknown flags, exact
	/// node versions and fully zeroed free records.
	pub strict: bool,
	/// Repair what is safely repairable: rewrite a damaged superblock
	/// copy from the surviving one, and shrink volume-manager
	/// over-allocation. Never touches blob content.
	pub repair: bool,
}

/// The outcome of a check run.
#[derive(Debug, Default)]
pub struct CheckReport {
	/// Human-readable findings, one per problem.
	pub errors: Vec<String>,
	/// Digests of blobs whose bytes failed verification.
	pub corrupt_blobs: Vec<BlobDigest>,
}

impl CheckReport {
	/// True when the image checked out clean.
	pub fn ok(&self) -> bool {
		self.errors.is_empty() && self.corrupt_blobs.is_empty()
	}
}

/// Checks one image.
pub struct Checker<'a, D: BlockDevice> {
	image: &'a mut Image<D>,
	options: FsckOptions,
	report: CheckReport,
	/// Allocated non-container inodes seen.
	alloc_inodes: u64,
	/// Blocks claimed by extents of valid blobs.
	inode_blocks: u64,
}

/// Runs a full check of `image`.
pub fn fsck<D: BlockDevice>(image: &mut Image<D>, options: FsckOptions) -> Result<CheckReport> {
	Checker::new(image, options).check()
}

impl<'a, D: BlockDevice> Checker<'a, D> {
	pub fn new(image: &'a mut Image<D>, options: FsckOptions) -> Self {
		Self {
			image,
			options,
			report: CheckReport::default(),
			alloc_inodes: 0,
			inode_blocks: 0,
		}
	}

	/// Runs every phase and returns the report. `Err` is reserved for
	/// conditions that prevent checking at all.
	pub fn check(mut self) -> Result<CheckReport> {
		log::info!("checking backup superblock");
		self.check_backup_superblock()?;
		log::info!("verifying inodes and blob data");
		self.traverse_inode_table()?;
		log::info!("checking allocation counts");
		self.check_allocated_counts();
		log::info!("checking volume-manager consistency");
		self.check_volume_consistency()?;
		Ok(self.report)
	}

	fn note(&mut self, finding: String) {
		log::error!("check: {finding}");
		self.report.errors.push(finding);
	}

	fn check_backup_superblock(&mut self) -> Result<()> {
		if !self.image.superblock().has_backup_superblock() {
			return Ok(());
		}
		let primary = *self.image.superblock();
		let device_blocks = self.image.device().block_count();
		let backup = self.image.read_backup_superblock()?;
		if primary.as_bytes() == backup.as_bytes() {
			return Ok(());
		}
		if !self.options.repair {
			self.note("backup superblock differs from primary".to_string());
			return Ok(());
		}
		// Repair from whichever copy still validates; the primary
		// wins when both do.
		if primary.check(device_blocks).is_ok() {
			self.note("backup superblock differs from primary; rewriting backup".to_string());
			self.write_superblock_copy(&primary, crate::format::BACKUP_SUPERBLOCK_BLOCK)?;
		} else if backup.check(device_blocks).is_ok() {
			self.note("primary superblock invalid; restoring from backup".to_string());
			self.write_superblock_copy(&backup, 0)?;
		} else {
			self.note("both superblock copies invalid; cannot repair".to_string());
		}
		Ok(())
	}

	fn write_superblock_copy(
		&mut self,
		superblock: &crate::format::Superblock,
		block_index: u64,
	) -> Result<()> {
		let mut block = vec![0u8; BLOCK_SIZE as usize];
		block[..SUPERBLOCK_SIZE].copy_from_slice(superblock.as_bytes());
		self.image.device_mut().write_blocks(block_index, &block)
	}

	fn traverse_inode_table(&mut self) -> Result<()> {
		let mut seen_digests = std::collections::BTreeMap::new();
		let inode_count = self.image.superblock().inode_count.get() as u32;
		for n in 0..inode_count {
			let record = *self.image.get_node(n)?;
			let header = *record.header();
			if !header.is_allocated() {
				if self.options.strict && !record.is_zeroed() {
					self.note(format!("free node {n} is not fully zeroed"));
				}
				continue;
			}

			if self.options.strict {
				if header.unknown_flags() != 0 {
					self.note(format!(
						"node {n} carries unknown flags {:#06x}",
						header.flags.get()
					));
				}
				if header.version.get() != NODE_VERSION {
					self.note(format!(
						"node {n} has version {}, expected {NODE_VERSION}",
						header.version.get()
					));
				}
			}

			if header.is_extent_container() {
				if self.options.strict
					&& header.flags()
						!= NodeFlags::ALLOCATED | NodeFlags::EXTENT_CONTAINER
				{
					self.note(format!("extent container {n} carries unexpected flags"));
				}
				if self.options.strict && record.as_container().reserved.get() != 0 {
					self.note(format!("extent container {n} has non-zero reserved field"));
				}
				// Containers are validated again while walking each
				// blob's chain.
				continue;
			}

			self.alloc_inodes += 1;
			if self.options.strict && record.as_inode().reserved.get() != 0 {
				self.note(format!("inode {n} has non-zero reserved field"));
			}
			let digest = BlobDigest::from(record.as_inode().merkle_root_hash);
			if let Some(previous) = seen_digests.insert(digest, n) {
				self.note(format!(
					"inodes {previous} and {n} both carry digest {digest}"
				));
			}
			self.check_blob(n)?;
		}
		Ok(())
	}

	/// Validates one blob's chain, extents, layout and content.
	fn check_blob(&mut self, n: u32) -> Result<()> {
		let inode = *self.image.get_node(n)?.as_inode();
		let digest = BlobDigest::from(inode.merkle_root_hash);

		let chain = {
			let nodes = self.image.allocator().nodes();
			ExtentIterator::new(nodes, n).and_then(|mut iterator| {
				let extents: Vec<Extent> = iterator.by_ref().collect::<Result<_>>()?;
				Ok((extents, iterator.terminal_next_node()))
			})
		};
		let (extents, terminal) = match chain {
			Ok(chain) => chain,
			Err(e) => {
				self.note(format!("inode {n} ({digest}): {e}"));
				return Ok(());
			}
		};
		if self.options.strict && terminal != SENTINEL_NODE {
			self.note(format!(
				"inode {n} ({digest}): chain does not terminate at the sentinel"
			));
		}

		let mut blob_valid = true;
		let data_block_count = self.image.superblock().data_block_count.get();
		let mut total_blocks = 0u64;
		for extent in &extents {
			let start = extent.start();
			let end = start + extent.length();
			if end > data_block_count {
				self.note(format!(
					"inode {n} ({digest}): {extent:?} extends past the data region"
				));
				blob_valid = false;
				continue;
			}
			if let Err(first_unset) =
				self.image.allocator().block_bitmap().all_set(start, end)
			{
				self.note(format!(
					"inode {n} ({digest}): {extent:?} not fully allocated, first unset bit {first_unset}"
				));
				blob_valid = false;
			}
			total_blocks += extent.length();
		}
		self.inode_blocks += total_blocks;

		if total_blocks != u64::from(inode.block_count.get()) {
			self.note(format!(
				"inode {n} ({digest}): extents cover {total_blocks} blocks, inode says {}",
				inode.block_count.get()
			));
			blob_valid = false;
		}
		let format = self.image.layout_format()?;
		match BlobLayout::from_inode(format, &inode, BLOCK_SIZE) {
			Ok(layout) => {
				if layout.total_block_count() != u64::from(inode.block_count.get()) {
					self.note(format!(
						"inode {n} ({digest}): layout computes {} blocks, inode says {}",
						layout.total_block_count(),
						inode.block_count.get()
					));
					blob_valid = false;
				}
			}
			Err(e) => {
				self.note(format!("inode {n} ({digest}): sizes are inconsistent: {e}"));
				blob_valid = false;
			}
		}

		if blob_valid {
			if let Err(e) = self.image.load_and_verify_blob(n) {
				self.note(format!("inode {n} ({digest}): {e}"));
				self.report.corrupt_blobs.push(digest);
			}
		}
		Ok(())
	}

	fn check_allocated_counts(&mut self) {
		let superblock = self.image.superblock();
		let alloc_block_count = superblock.alloc_block_count.get();
		let alloc_inode_count = superblock.alloc_inode_count.get();
		let bitmap_blocks = self.image.allocator().block_bitmap().popcount();

		if bitmap_blocks != alloc_block_count {
			self.note(format!(
				"block bitmap has {bitmap_blocks} bits set, superblock says {alloc_block_count}"
			));
		}
		if bitmap_blocks < START_BLOCK_MINIMUM {
			self.note(format!(
				"allocated blocks {bitmap_blocks} below the reserved minimum {START_BLOCK_MINIMUM}"
			));
		}
		if self.inode_blocks + START_BLOCK_MINIMUM != bitmap_blocks {
			self.note(format!(
				"blobs account for {} blocks, bitmap has {bitmap_blocks}",
				self.inode_blocks + START_BLOCK_MINIMUM
			));
		}
		if self.alloc_inodes != alloc_inode_count {
			self.note(format!(
				"{} allocated inodes found, superblock says {alloc_inode_count}",
				self.alloc_inodes
			));
		}
	}

	/// FVM-hosted images: each region's slice count must be backed by
	/// the volume manager; surplus slices are shrunk under repair.
	fn check_volume_consistency(&mut self) -> Result<()> {
		let superblock = *self.image.superblock();
		if !superblock.is_fvm() {
			return Ok(());
		}
		let info = match self.image.device().volume_info() {
			Some(info) => info,
			None => {
				self.note("image is FVM-hosted but the device reports no volume".to_string());
				return Ok(());
			}
		};
		if info.slice_size != superblock.slice_size.get() {
			self.note(format!(
				"device slice size {} does not match superblock {}",
				info.slice_size,
				superblock.slice_size.get()
			));
			return Ok(());
		}
		let blocks_per_slice = superblock.blocks_per_slice();
		let expected = [
			u64::from(superblock.abm_slices.get()),
			u64::from(superblock.ino_slices.get()),
			u64::from(superblock.journal_slices.get()),
			u64::from(superblock.dat_slices.get()),
		];
		let start_slices = [
			FVM_BLOCK_MAP_START / blocks_per_slice,
			FVM_NODE_MAP_START / blocks_per_slice,
			FVM_JOURNAL_START / blocks_per_slice,
			FVM_DATA_START / blocks_per_slice,
		];
		let ranges = self.image.device().volume_query_slices(&start_slices)?;
		if ranges.len() != start_slices.len() {
			self.note("volume manager returned a short slice query".to_string());
			return Ok(());
		}
		for (i, range) in ranges.iter().enumerate() {
			if !range.allocated || range.count < expected[i] {
				self.note(format!(
					"region {i} expects {} slices, volume has {}",
					expected[i], range.count
				));
				continue;
			}
			if range.count > expected[i] && self.options.repair {
				let offset = start_slices[i] + expected[i];
				let length = range.count - expected[i];
				log::info!("shrinking over-allocated region {i} by {length} slices");
				self.image.device_mut().volume_shrink(offset, length)?;
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::device::FileDevice;
	use crate::error::Error;
	use crate::format::Superblock;
	use crate::image::AddOutcome;
	use crate::image::BlobInfo;
	use crate::layout::BlobLayoutFormat;
	use crate::mkfs;
	use crate::mkfs::FilesystemOptions;
	use std::io::Write as _;
	use std::path::Path;

	fn format_image(path: &Path, blocks: u64) {
		let mut device = FileDevice::open(path).unwrap();
		mkfs::make_image(&mut device, blocks, &FilesystemOptions::default()).unwrap();
	}

	fn image_file(blocks: u64) -> tempfile::NamedTempFile {
		let file = tempfile::NamedTempFile::new().unwrap();
		file.as_file().set_len(blocks * BLOCK_SIZE).unwrap();
		format_image(file.path(), blocks);
		file
	}

	fn open_image(path: &Path) -> Image<FileDevice> {
		Image::open(FileDevice::open(path).unwrap()).unwrap()
	}

	fn add_blob(image: &mut Image<FileDevice>, contents: &[u8]) -> (u32, BlobDigest) {
		let mut src = tempfile::NamedTempFile::new().unwrap();
		src.write_all(contents).unwrap();
		src.flush().unwrap();
		let info =
			BlobInfo::create_uncompressed(src.path(), image.layout_format().unwrap()).unwrap();
		let digest = *info.digest();
		match image.add_blob(&info).unwrap() {
			AddOutcome::Added { node } => (node, digest),
			AddOutcome::AlreadyExists => panic!("blob already present"),
		}
	}

	fn test_data(len: usize) -> Vec<u8> {
		(0..len).map(|i| (i % 239) as u8).collect()
	}

	#[test]
	fn fresh_image_checks_clean() {
		let file = image_file(10_000);
		let mut image = open_image(file.path());
		let report = fsck(&mut image, FsckOptions { strict: true, repair: false }).unwrap();
		assert!(report.ok(), "unexpected findings: {:?}", report.errors);
	}

	#[test]
	fn populated_image_checks_clean() {
		let file = image_file(10_000);
		let mut image = open_image(file.path());
		add_blob(&mut image, &[]);
		add_blob(&mut image, &test_data(100));
		add_blob(&mut image, &test_data(5 * BLOCK_SIZE as usize + 17));

		let mut image = open_image(file.path());
		let report = fsck(&mut image, FsckOptions { strict: true, repair: false }).unwrap();
		assert!(report.ok(), "unexpected findings: {:?}", report.errors);
	}

	#[test]
	fn corrupt_blob_is_reported_by_digest_and_others_pass() {
		let file = image_file(10_000);
		let mut image = open_image(file.path());
		let (node, digest) = add_blob(&mut image, &test_data(3 * BLOCK_SIZE as usize));
		add_blob(&mut image, &test_data(100));

		// Flip one byte in the blob's first data block.
		let inode = *image.get_node(node).unwrap().as_inode();
		let block =
			image.superblock().data_start_block() + inode.inline_extent.start();
		let mut device = FileDevice::open(file.path()).unwrap();
		let mut buf = vec![0u8; BLOCK_SIZE as usize];
		device.read_blocks(block, &mut buf).unwrap();
		buf[123] ^= 0x80;
		device.write_blocks(block, &buf).unwrap();

		let mut image = open_image(file.path());
		let report = fsck(&mut image, FsckOptions::default()).unwrap();
		assert_eq!(report.corrupt_blobs, vec![digest]);
		assert_eq!(report.errors.len(), 1);
	}

	#[test]
	fn counter_mismatch_is_reported() {
		let file = image_file(10_000);
		{
			let mut image = open_image(file.path());
			add_blob(&mut image, &test_data(1000));
		}

		// Inflate the allocated-block counter behind the image's back.
		let mut device = FileDevice::open(file.path()).unwrap();
		let mut block = vec![0u8; BLOCK_SIZE as usize];
		device.read_blocks(0, &mut block).unwrap();
		let mut superblock = Superblock::read_from_block(&block).unwrap();
		superblock.alloc_block_count =
			(superblock.alloc_block_count.get() + 5).into();
		block[..SUPERBLOCK_SIZE].copy_from_slice(superblock.as_bytes());
		device.write_blocks(0, &block).unwrap();

		let mut image = open_image(file.path());
		let report = fsck(&mut image, FsckOptions::default()).unwrap();
		assert!(!report.ok());
		assert!(report
			.errors
			.iter()
			.any(|e| e.contains("bitmap") || e.contains("blocks")));
	}

	#[test]
	fn bad_magic_is_fatal() {
		let file = image_file(10_000);
		let mut device = FileDevice::open(file.path()).unwrap();
		let mut block = vec![0u8; BLOCK_SIZE as usize];
		device.read_blocks(0, &mut block).unwrap();
		block[0] ^= 0xff;
		device.write_blocks(0, &block).unwrap();

		assert!(matches!(
			Image::open(FileDevice::open(file.path()).unwrap()),
			Err(Error::Integrity(_))
		));
	}

	/// A file-backed device that pretends to live inside a volume
	/// manager, with a configurable slice table.
	struct FakeVolumeDevice {
		inner: FileDevice,
		slice_size: u64,
		/// start slice -> allocated slice count.
		ranges: std::collections::HashMap<u64, u64>,
		shrunk: Vec<(u64, u64)>,
	}

	impl crate::device::BlockDevice for FakeVolumeDevice {
		fn read_blocks(&mut self, start_block: u64, dst: &mut [u8]) -> crate::error::Result<()> {
			self.inner.read_blocks(start_block, dst)
		}

		fn write_blocks(&mut self, start_block: u64, src: &[u8]) -> crate::error::Result<()> {
			self.inner.write_blocks(start_block, src)
		}

		fn block_count(&self) -> u64 {
			self.inner.block_count()
		}

		fn volume_info(&self) -> Option<crate::device::VolumeInfo> {
			Some(crate::device::VolumeInfo { slice_size: self.slice_size })
		}

		fn volume_query_slices(
			&self,
			start_slices: &[u64],
		) -> crate::error::Result<Vec<crate::device::SliceRange>> {
			Ok(start_slices
				.iter()
				.map(|start| crate::device::SliceRange {
					allocated: true,
					count: self.ranges.get(start).copied().unwrap_or(0),
				})
				.collect())
		}

		fn volume_shrink(&mut self, offset: u64, length: u64) -> crate::error::Result<()> {
			self.shrunk.push((offset, length));
			Ok(())
		}
	}

	fn fvm_fixture() -> (tempfile::NamedTempFile, u64, Superblock) {
		let slice_size = 32 * BLOCK_SIZE;
		let blocks = FVM_DATA_START + 64;
		let file = tempfile::NamedTempFile::new().unwrap();
		file.as_file().set_len(blocks * BLOCK_SIZE).unwrap();
		let mut device = FileDevice::open(file.path()).unwrap();
		mkfs::make_image(
			&mut device,
			blocks,
			&FilesystemOptions {
				num_inodes: 512,
				fvm_slice_size: Some(slice_size),
				..FilesystemOptions::default()
			},
		)
		.unwrap();
		let mut block = vec![0u8; BLOCK_SIZE as usize];
		device.read_blocks(0, &mut block).unwrap();
		let superblock = Superblock::read_from_block(&block).unwrap();
		(file, slice_size, superblock)
	}

	fn fake_volume_device(
		path: &Path,
		slice_size: u64,
		superblock: &Superblock,
		extra_data_slices: u64,
	) -> FakeVolumeDevice {
		let bps = superblock.blocks_per_slice();
		let ranges = std::collections::HashMap::from([
			(FVM_BLOCK_MAP_START / bps, u64::from(superblock.abm_slices.get())),
			(FVM_NODE_MAP_START / bps, u64::from(superblock.ino_slices.get())),
			(FVM_JOURNAL_START / bps, u64::from(superblock.journal_slices.get())),
			(
				FVM_DATA_START / bps,
				u64::from(superblock.dat_slices.get()) + extra_data_slices,
			),
		]);
		FakeVolumeDevice {
			inner: FileDevice::open(path).unwrap(),
			slice_size,
			ranges,
			shrunk: Vec::new(),
		}
	}

	#[test]
	fn fvm_image_with_matching_slices_checks_clean() {
		let (file, slice_size, superblock) = fvm_fixture();
		let device = fake_volume_device(file.path(), slice_size, &superblock, 0);
		let mut image = Image::open(device).unwrap();
		let report = fsck(&mut image, FsckOptions { strict: true, repair: false }).unwrap();
		assert!(report.ok(), "unexpected findings: {:?}", report.errors);
	}

	#[test]
	fn fvm_over_allocation_is_shrunk_under_repair() {
		let (file, slice_size, superblock) = fvm_fixture();
		let device = fake_volume_device(file.path(), slice_size, &superblock, 3);
		let mut image = Image::open(device).unwrap();
		let report = fsck(&mut image, FsckOptions { strict: false, repair: true }).unwrap();
		assert!(report.ok(), "unexpected findings: {:?}", report.errors);

		let bps = superblock.blocks_per_slice();
		let expected_offset = FVM_DATA_START / bps + u64::from(superblock.dat_slices.get());
		assert_eq!(image.device().shrunk, vec![(expected_offset, 3)]);
	}

	#[test]
	fn fvm_under_allocation_is_reported() {
		let (file, slice_size, superblock) = fvm_fixture();
		let mut device = fake_volume_device(file.path(), slice_size, &superblock, 0);
		let bps = superblock.blocks_per_slice();
		device.ranges.insert(FVM_JOURNAL_START / bps, 0);
		let mut image = Image::open(device).unwrap();
		let report = fsck(&mut image, FsckOptions::default()).unwrap();
		assert!(!report.ok());
	}

	#[test]
	fn damaged_backup_superblock_is_reported_and_repaired() {
		let (file, slice_size, superblock) = fvm_fixture();

		// Scribble over the backup copy.
		{
			let mut device = FileDevice::open(file.path()).unwrap();
			let mut block = vec![0u8; BLOCK_SIZE as usize];
			device
				.read_blocks(crate::format::BACKUP_SUPERBLOCK_BLOCK, &mut block)
				.unwrap();
			block[4] ^= 0xff;
			device
				.write_blocks(crate::format::BACKUP_SUPERBLOCK_BLOCK, &block)
				.unwrap();
		}

		let device = fake_volume_device(file.path(), slice_size, &superblock, 0);
		let mut image = Image::open(device).unwrap();
		let report = fsck(&mut image, FsckOptions::default()).unwrap();
		assert!(!report.ok());

		// Under repair the primary rewrites the backup, and a re-check
		// comes back clean.
		let device = fake_volume_device(file.path(), slice_size, &superblock, 0);
		let mut image = Image::open(device).unwrap();
		let report = fsck(&mut image, FsckOptions { strict: false, repair: true }).unwrap();
		assert_eq!(report.errors.len(), 1);

		let device = fake_volume_device(file.path(), slice_size, &superblock, 0);
		let mut image = Image::open(device).unwrap();
		let report = fsck(&mut image, FsckOptions { strict: true, repair: false }).unwrap();
		assert!(report.ok(), "unexpected findings: {:?}", report.errors);
	}

	#[test]
	fn strict_mode_flags_scribbled_free_nodes() {
		let file = image_file(10_000);
		let mut image = open_image(file.path());
		add_blob(&mut image, &test_data(100));

		// Scribble into a free node table slot on disk.
		let node_map_start = image.superblock().node_map_start_block();
		let mut device = FileDevice::open(file.path()).unwrap();
		let mut block = vec![0u8; BLOCK_SIZE as usize];
		device.read_blocks(node_map_start, &mut block).unwrap();
		// Slot 5 is unused; poke a byte in its body without setting
		// the allocated flag.
		block[5 * 64 + 20] = 0xaa;
		device.write_blocks(node_map_start, &block).unwrap();

		let mut image = open_image(file.path());
		let lax = fsck(&mut image, FsckOptions::default()).unwrap();
		assert!(lax.ok());

		let mut image = open_image(file.path());
		let strict = fsck(&mut image, FsckOptions { strict: true, repair: false }).unwrap();
		assert!(!strict.ok());
		assert!(strict.errors.iter().any(|e| e.contains("zeroed")));
	}
}
