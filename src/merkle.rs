//! Merkle tree construction and verification.
//!
//! Trees hash 8 KiB nodes with SHA-256. Leaves cover the blob's
//! logical content; each internal level hashes 256 child digests per
//! parent. The final node of any level is zero-padded to the node
//! size for hashing only. Blobs of one node or less have an empty
//! tree and their digest is simply the hash of their content.
//!
//! Stored trees are laid out leaves-first, level by level, up to but
//! excluding the root. The compact encoding packs each level as raw
//! digests; the padded encoding rounds each level up to a block
//! multiple.

use crate::digest::BlobDigest;
use crate::digest::DIGEST_LENGTH;
use crate::error::Error;
use crate::error::Result;
use crate::format::BLOCK_SIZE;
use sha2::Digest as _;
use sha2::Sha256;

/// Size of one node digest.
pub const HASH_SIZE: usize = DIGEST_LENGTH;
/// Child digests hashed into one parent: a full node of digests.
pub const HASHES_PER_NODE: u64 = BLOCK_SIZE / HASH_SIZE as u64;

/// Receives the digest of a blob that failed verification. Purely
/// informational; must not assume anything about the verifier's
/// state.
pub trait CorruptionNotifier: Sync {
	fn notify_corrupt_blob(&self, digest: &BlobDigest);
}

/// Digest counts of every tree level below the root, leaves first.
/// Empty for blobs of one node or less.
fn level_counts(file_size: u64, node_size: u64) -> Vec<u64> {
	let hashes_per_node = node_size / HASH_SIZE as u64;
	let mut counts = Vec::new();
	let mut count = file_size.div_ceil(node_size);
	while count > 1 {
		counts.push(count);
		count = count.div_ceil(hashes_per_node);
	}
	counts
}

/// Bytes one level occupies in the stored encoding.
fn level_size(count: u64, node_size: u64, compact: bool) -> u64 {
	let raw = count * HASH_SIZE as u64;
	if compact {
		raw
	} else {
		raw.div_ceil(node_size) * node_size
	}
}

/// Bytes required to store the Merkle tree for `file_size` bytes of
/// content. A pure function of the file size and encoding.
pub fn merkle_tree_size(file_size: u64, node_size: u64, compact: bool) -> u64 {
	level_counts(file_size, node_size)
		.into_iter()
		.map(|count| level_size(count, node_size, compact))
		.sum()
}

/// Hashes one node, zero-padding `bytes` up to the node size.
fn hash_node(bytes: &[u8]) -> [u8; HASH_SIZE] {
	debug_assert!(bytes.len() as u64 <= BLOCK_SIZE);
	let mut hasher = Sha256::new();
	hasher.update(bytes);
	let pad = BLOCK_SIZE as usize - bytes.len();
	if pad > 0 {
		hasher.update(&vec![0u8; pad]);
	}
	hasher.finalize().into()
}

/// Computes the digests of one level from its raw child bytes.
fn hash_level(bytes: &[u8]) -> Vec<u8> {
	let mut digests = Vec::with_capacity(bytes.len().div_ceil(BLOCK_SIZE as usize) * HASH_SIZE);
	for node in bytes.chunks(BLOCK_SIZE as usize) {
		digests.extend_from_slice(&hash_node(node));
	}
	digests
}

/// A blob's freshly built Merkle tree.
pub struct MerkleTree {
	/// Stored tree bytes in the requested encoding; empty for blobs
	/// of one node or less.
	pub tree: Vec<u8>,
	/// The root digest: the blob's name.
	pub root: BlobDigest,
}

impl MerkleTree {
	/// Builds the tree for `data` in the given encoding.
	pub fn build(data: &[u8], compact: bool) -> Self {
		let counts = level_counts(data.len() as u64, BLOCK_SIZE);
		if counts.is_empty() {
			return Self { tree: Vec::new(), root: BlobDigest::hash(data) };
		}

		let mut tree = Vec::new();
		let mut level = hash_level(data);
		for count in &counts {
			debug_assert_eq!(level.len(), *count as usize * HASH_SIZE);
			tree.extend_from_slice(&level);
			if !compact {
				let padded = level_size(*count, BLOCK_SIZE, false) as usize;
				tree.resize(tree.len() + padded - level.len(), 0);
			}
			level = hash_level(&level);
		}
		debug_assert_eq!(level.len(), HASH_SIZE);
		let mut root = [0u8; HASH_SIZE];
		root.copy_from_slice(&level);
		Self { tree, root: root.into() }
	}
}

/// Verifies ranges of a blob against its stored Merkle tree and an
/// expected root.
///
/// The verifier is immutable after construction, so concurrent
/// `verify`/`verify_partial` calls against one instance are safe.
/// Every call re-walks the stored digests from the covered leaves to
/// the root, so corrupt tree bytes surface as `Integrity` errors at
/// verify time.
pub struct MerkleTreeVerifier<'a> {
	digest: BlobDigest,
	data_size: u64,
	/// (byte offset into `tree`, digest count) per stored level,
	/// leaves first.
	levels: Vec<(u64, u64)>,
	tree: Vec<u8>,
	compact: bool,
	notifier: Option<&'a dyn CorruptionNotifier>,
}

impl<'a> MerkleTreeVerifier<'a> {
	/// Creates a verifier for a blob of `data_size` logical bytes.
	///
	/// `tree` must hold at least the stored tree for `data_size`;
	/// callers slice it out of the surrounding blocks first.
	pub fn new(
		digest: BlobDigest,
		tree: &[u8],
		data_size: u64,
		compact: bool,
		notifier: Option<&'a dyn CorruptionNotifier>,
	) -> Result<Self> {
		let expected = merkle_tree_size(data_size, BLOCK_SIZE, compact);
		if (tree.len() as u64) < expected {
			return Err(Error::InvalidArgs(format!(
				"merkle tree too small for data: {} < {expected}",
				tree.len()
			)));
		}
		let counts = level_counts(data_size, BLOCK_SIZE);
		let mut levels = Vec::with_capacity(counts.len());
		let mut offset = 0u64;
		for count in counts {
			levels.push((offset, count));
			offset += level_size(count, BLOCK_SIZE, compact);
		}
		Ok(Self {
			digest,
			data_size,
			levels,
			tree: tree[..expected as usize].to_vec(),
			compact,
			notifier,
		})
	}

	/// Creates a verifier for a blob small enough to have no tree.
	pub fn without_tree(
		digest: BlobDigest,
		data_size: u64,
		notifier: Option<&'a dyn CorruptionNotifier>,
	) -> Result<Self> {
		if merkle_tree_size(data_size, BLOCK_SIZE, true) > 0 {
			return Err(Error::InvalidArgs(
				"data too big for an empty merkle tree".to_string(),
			));
		}
		Self::new(digest, &[], data_size, true, notifier)
	}

	/// The blob digest this verifier checks against.
	pub fn digest(&self) -> &BlobDigest {
		&self.digest
	}

	/// Fully verifies `data_size` bytes of `buf` and requires the
	/// rest of `buf` to be zero.
	pub fn verify(&self, buf: &[u8], data_size: u64) -> Result<()> {
		if data_size != self.data_size {
			return Err(Error::InvalidArgs(format!(
				"verify length {data_size} does not match blob size {}",
				self.data_size
			)));
		}
		self.verify_partial(buf, data_size, 0)
	}

	/// Verifies `length` bytes at `data_offset`, supplied in
	/// `buf[..length]`, and requires `buf[length..]` to be zero.
	///
	/// The range must be node-aligned: `data_offset` a multiple of
	/// the node size, and the end either node-aligned or exactly the
	/// end of the data.
	pub fn verify_partial(&self, buf: &[u8], length: u64, data_offset: u64) -> Result<()> {
		let result = self.verify_range(&buf[..length.min(buf.len() as u64) as usize], length, data_offset)
			.and_then(|()| verify_tail_zeroed(buf, length));
		if let Err(Error::Integrity(ref reason)) = result {
			log::error!("verification of blob {} failed: {reason}", self.digest);
			if let Some(notifier) = self.notifier {
				notifier.notify_corrupt_blob(&self.digest);
			}
		}
		result
	}

	fn verify_range(&self, data: &[u8], length: u64, data_offset: u64) -> Result<()> {
		let end = data_offset
			.checked_add(length)
			.ok_or_else(|| Error::InvalidArgs("range overflows".to_string()))?;
		if end > self.data_size {
			return Err(Error::InvalidArgs(format!(
				"range [{data_offset}, {end}) extends past data size {}",
				self.data_size
			)));
		}
		if data_offset % BLOCK_SIZE != 0 || (end % BLOCK_SIZE != 0 && end != self.data_size) {
			return Err(Error::InvalidArgs(format!(
				"range [{data_offset}, {end}) is not node-aligned"
			)));
		}
		if data.len() as u64 != length {
			return Err(Error::InvalidArgs("buffer shorter than range".to_string()));
		}
		if length == 0 {
			return Ok(());
		}

		if self.levels.is_empty() {
			// Single-node blob: the root is the content hash.
			if BlobDigest::hash(data) != self.digest {
				return Err(Error::Integrity("content does not match root digest".to_string()));
			}
			return Ok(());
		}

		// Check the covered leaves against the stored leaf digests.
		let mut first = data_offset / BLOCK_SIZE;
		let mut last = end.div_ceil(BLOCK_SIZE);
		for (i, node) in data.chunks(BLOCK_SIZE as usize).enumerate() {
			let leaf = first + i as u64;
			if hash_node(node)[..] != *self.level_digest(0, leaf)? {
				return Err(Error::Integrity(format!("leaf {leaf} mismatch")));
			}
		}

		// Walk the stored digests up to the root. Untouched siblings
		// come from the stored tree; the chain of node hashes anchors
		// them all to the expected root.
		for level in 0..self.levels.len() {
			let (_, count) = self.levels[level];
			let parent_first = first / HASHES_PER_NODE;
			let parent_last = last.div_ceil(HASHES_PER_NODE);
			for parent in parent_first..parent_last {
				let node_first = parent * HASHES_PER_NODE;
				let node_last = (node_first + HASHES_PER_NODE).min(count);
				let node_bytes = self.level_bytes(level, node_first, node_last)?;
				let computed = hash_node(node_bytes);
				let expected: &[u8] = if level + 1 < self.levels.len() {
					self.level_digest(level + 1, parent)?
				} else {
					self.digest.as_bytes()
				};
				if computed[..] != *expected {
					return Err(Error::Integrity(format!(
						"level {} node {parent} mismatch",
						level + 1
					)));
				}
			}
			first = parent_first;
			last = parent_last;
		}
		Ok(())
	}

	/// The stored digest at `index` within `level`.
	fn level_digest(&self, level: usize, index: u64) -> Result<&[u8]> {
		let (offset, count) = self.levels[level];
		if index >= count {
			return Err(Error::IllegalState("digest index out of range"));
		}
		let start = (offset + index * HASH_SIZE as u64) as usize;
		Ok(&self.tree[start..start + HASH_SIZE])
	}

	/// The stored digest bytes `[first, last)` of `level`.
	fn level_bytes(&self, level: usize, first: u64, last: u64) -> Result<&[u8]> {
		let (offset, count) = self.levels[level];
		if last > count {
			return Err(Error::IllegalState("digest range out of range"));
		}
		let start = (offset + first * HASH_SIZE as u64) as usize;
		let end = (offset + last * HASH_SIZE as u64) as usize;
		Ok(&self.tree[start..end])
	}
}

/// Requires every byte of `buf` past `data_size` to be zero.
pub fn verify_tail_zeroed(buf: &[u8], data_size: u64) -> Result<()> {
	if (buf.len() as u64) < data_size {
		return Err(Error::InvalidArgs("buffer shorter than data".to_string()));
	}
	if buf[data_size as usize..].iter().any(|b| *b != 0) {
		return Err(Error::Integrity("non-zero bytes past the end of data".to_string()));
	}
	Ok(())
}
