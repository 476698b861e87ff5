//! Content digests: the 32-byte SHA-256 values that name blobs.

use crate::error::Error;
use sha2::Digest as _;
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;

/// The size of a content digest in bytes.
pub const DIGEST_LENGTH: usize = 32;

/// A blob's content digest: the root of its Merkle tree.
///
/// Digests order and compare by their raw bytes so that collections
/// keyed on them iterate in a stable order.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BlobDigest([u8; DIGEST_LENGTH]);

impl BlobDigest {
	/// Hashes `data` in one shot.
	pub fn hash(data: &[u8]) -> Self {
		let mut hasher = Sha256::new();
		hasher.update(data);
		Self(hasher.finalize().into())
	}

	/// Returns the raw digest bytes.
	pub fn as_bytes(&self) -> &[u8; DIGEST_LENGTH] {
		&self.0
	}
}

impl From<[u8; DIGEST_LENGTH]> for BlobDigest {
	fn from(bytes: [u8; DIGEST_LENGTH]) -> Self {
		Self(bytes)
	}
}

impl TryFrom<&[u8]> for BlobDigest {
	type Error = Error;

	fn try_from(bytes: &[u8]) -> Result<Self, Error> {
		let bytes: [u8; DIGEST_LENGTH] = bytes
			.try_into()
			.map_err(|_| Error::InvalidArgs(format!("digest must be {DIGEST_LENGTH} bytes")))?;
		Ok(Self(bytes))
	}
}

impl FromStr for BlobDigest {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Error> {
		let bytes = hex::decode(s)
			.map_err(|e| Error::InvalidArgs(format!("invalid digest string: {e}")))?;
		Self::try_from(bytes.as_slice())
	}
}

impl fmt::Display for BlobDigest {
	fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt.write_str(&hex::encode(self.0))
	}
}
