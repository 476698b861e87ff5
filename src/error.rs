//! Error taxonomy shared by every component of the engine.

use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All the ways an operation on an image can fail.
///
/// Variants map one-to-one onto the conditions a caller can act on;
/// lower-level detail travels in the message strings.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// A size, offset or option was malformed: bad alignment,
	/// out-of-range size, unknown layout format, zero inode count.
	#[error("invalid argument: {0}")]
	InvalidArgs(String),

	/// The image is too small or the free pool is exhausted.
	#[error("out of space: {0}")]
	NoSpace(String),

	/// The free pool has room, but not in few enough extents.
	#[error("allocation too fragmented: needs {needed} extents, limit is {limit}")]
	TooFragmented { needed: u64, limit: u64 },

	/// The underlying device read or write failed.
	#[error("I/O error: {0}")]
	Io(#[from] io::Error),

	/// A lookup by digest found nothing.
	#[error("blob {0} not found")]
	NotFound(String),

	/// The blob is already present in the image.
	#[error("blob {0} already exists")]
	AlreadyExists(String),

	/// Verification against a Merkle tree failed, a tail byte was
	/// non-zero, or a superblock magic did not match.
	#[error("integrity failure: {0}")]
	Integrity(String),

	/// The operation does not apply to the component's current state.
	#[error("illegal state: {0}")]
	IllegalState(&'static str),

	/// An on-disk structure could not be decoded.
	#[error("format error: {0}")]
	FormatError(String),

	/// The on-disk format version is not one this engine understands.
	#[error("unsupported: {0}")]
	Unsupported(String),
}

impl Error {
	/// Tells whether this error is an integrity failure, the class of
	/// error fsck reports rather than aborts on.
	pub fn is_integrity(&self) -> bool {
		matches!(self, Error::Integrity(_))
	}
}
