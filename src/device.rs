//! The synchronous block-addressed interface the engine builds on,
//! and its file-backed implementation.

use crate::error::Error;
use crate::error::Result;
use crate::format::BLOCK_SIZE;
use std::fs::File;
use std::fs;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

/// ioctl macro: Command.
macro_rules! ioc {
	($a:expr, $b:expr, $c:expr, $d:expr) => {
		(($a) << 30) | (($b) << 8) | ($c) | (($d) << 16)
	};
}

/// ioctl macro: Read command.
macro_rules! ior {
	($a:expr, $b:expr, $c:ty) => {
		ioc!(2, $a, $b, std::mem::size_of::<$c>() as u64)
	};
}

/// ioctl command: Get size of disk in bytes.
const BLKGETSIZE64: u64 = ior!(0x12, 114, u64);

/// Volume-manager information for FVM-hosted images.
#[derive(Clone, Copy, Debug)]
pub struct VolumeInfo {
	/// Bytes per slice.
	pub slice_size: u64,
}

/// One queried slice range.
#[derive(Clone, Copy, Debug)]
pub struct SliceRange {
	pub allocated: bool,
	/// Slices in the range.
	pub count: u64,
}

/// A synchronous block device. Blocks are `BLOCK_SIZE` bytes.
///
/// The volume-manager operations have defaults for plain devices;
/// only FVM-hosted backings override them.
pub trait BlockDevice {
	/// Reads `dst.len() / BLOCK_SIZE` blocks starting at `start_block`.
	fn read_blocks(&mut self, start_block: u64, dst: &mut [u8]) -> Result<()>;

	/// Writes `src.len() / BLOCK_SIZE` blocks starting at `start_block`.
	fn write_blocks(&mut self, start_block: u64, src: &[u8]) -> Result<()>;

	/// Total blocks in the backing device.
	fn block_count(&self) -> u64;

	/// Volume-manager info, when hosted in one.
	fn volume_info(&self) -> Option<VolumeInfo> {
		None
	}

	/// Queries the slice allocation at each of `start_slices`.
	fn volume_query_slices(&self, _start_slices: &[u64]) -> Result<Vec<SliceRange>> {
		Err(Error::Unsupported("device is not volume-hosted".to_string()))
	}

	/// Frees `length` slices starting at slice `offset`.
	fn volume_shrink(&mut self, _offset: u64, _length: u64) -> Result<()> {
		Err(Error::Unsupported("device is not volume-hosted".to_string()))
	}
}

/// Returns the size in bytes of the device or regular file at `path`.
pub fn device_size(path: &Path) -> Result<u64> {
	let metadata = fs::metadata(path)?;
	let file_type = metadata.file_type();
	if file_type.is_block_device() || file_type.is_char_device() {
		let dev = File::open(path)?;
		let mut size = 0u64;
		let ret = unsafe {
			libc::ioctl(dev.as_raw_fd(), BLKGETSIZE64 as _, &mut size)
		};
		if ret < 0 {
			return Err(std::io::Error::last_os_error().into());
		}
		Ok(size)
	} else {
		Ok(metadata.len())
	}
}

/// A device backed by a regular file or raw disk.
pub struct FileDevice {
	file: File,
	block_count: u64,
}

impl FileDevice {
	/// Wraps an already opened file covering `block_count` blocks.
	pub fn new(file: File, block_count: u64) -> Self {
		Self { file, block_count }
	}

	/// Opens `path` read/write and derives the block count from its
	/// size.
	pub fn open(path: &Path) -> Result<Self> {
		let file = fs::OpenOptions::new().read(true).write(true).open(path)?;
		let block_count = device_size(path)? / BLOCK_SIZE;
		Ok(Self { file, block_count })
	}

	/// Opens `path` read-only.
	pub fn open_readonly(path: &Path) -> Result<Self> {
		let file = File::open(path)?;
		let block_count = device_size(path)? / BLOCK_SIZE;
		Ok(Self { file, block_count })
	}

	fn check_range(&self, start_block: u64, len: usize) -> Result<()> {
		if len as u64 % BLOCK_SIZE != 0 {
			return Err(Error::InvalidArgs(format!(
				"buffer of {len} bytes is not a block multiple"
			)));
		}
		let blocks = len as u64 / BLOCK_SIZE;
		if start_block + blocks > self.block_count {
			return Err(Error::InvalidArgs(format!(
				"blocks [{start_block}, {}) beyond device end {}",
				start_block + blocks,
				self.block_count
			)));
		}
		Ok(())
	}
}

impl BlockDevice for FileDevice {
	fn read_blocks(&mut self, start_block: u64, dst: &mut [u8]) -> Result<()> {
		self.check_range(start_block, dst.len())?;
		self.file.seek(SeekFrom::Start(start_block * BLOCK_SIZE))?;
		self.file.read_exact(dst)?;
		Ok(())
	}

	fn write_blocks(&mut self, start_block: u64, src: &[u8]) -> Result<()> {
		self.check_range(start_block, src.len())?;
		self.file.seek(SeekFrom::Start(start_block * BLOCK_SIZE))?;
		self.file.write_all(src)?;
		Ok(())
	}

	fn block_count(&self) -> u64 {
		self.block_count
	}
}
