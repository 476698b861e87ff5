//! Free-space management: block and node reservation, and traversal
//! of the extent chains reservations eventually become.
//!
//! Reservations are in-memory only. Nothing touches the persistent
//! bitmaps or the node table until `commit`; `release` hands the
//! bits back untouched. The allocator is single-writer: one image
//! build commits from one thread.

use crate::bitmap::Bitmap;
use crate::error::Error;
use crate::error::Result;
use crate::format::Extent;
use crate::format::RawNode;
use crate::format::EXTENT_LENGTH_MAX;
use crate::format::EXTENT_START_MAX;
use crate::format::MAX_EXTENTS_PER_BLOB;
use crate::format::SENTINEL_NODE;
use std::collections::BTreeSet;

/// A run of blocks held for one ingest, not yet committed.
#[derive(Debug)]
pub struct ReservedExtent {
	extent: Extent,
}

impl ReservedExtent {
	pub fn extent(&self) -> Extent {
		self.extent
	}
}

/// A node table slot held for one ingest, not yet committed.
#[derive(Debug)]
pub struct ReservedNode {
	node: u32,
}

impl ReservedNode {
	pub fn node(&self) -> u32 {
		self.node
	}
}

/// Owns the block bitmap and the node table of an open image.
pub struct Allocator {
	block_bitmap: Bitmap,
	nodes: Vec<RawNode>,
	/// Blocks handed out but not committed.
	reserved_blocks: Bitmap,
	/// Node ids handed out but not committed.
	reserved_nodes: BTreeSet<u32>,
}

impl Allocator {
	pub fn new(block_bitmap: Bitmap, nodes: Vec<RawNode>) -> Self {
		let reserved_blocks = Bitmap::new(block_bitmap.size(), block_bitmap.as_bytes().len());
		Self { block_bitmap, nodes, reserved_blocks, reserved_nodes: BTreeSet::new() }
	}

	pub fn block_bitmap(&self) -> &Bitmap {
		&self.block_bitmap
	}

	pub fn node_count(&self) -> u64 {
		self.nodes.len() as u64
	}

	pub fn node(&self, node: u32) -> Result<&RawNode> {
		self.nodes
			.get(node as usize)
			.ok_or_else(|| Error::InvalidArgs(format!("node id {node} out of range")))
	}

	pub fn node_mut(&mut self, node: u32) -> Result<&mut RawNode> {
		self.nodes
			.get_mut(node as usize)
			.ok_or_else(|| Error::InvalidArgs(format!("node id {node} out of range")))
	}

	pub fn nodes(&self) -> &[RawNode] {
		&self.nodes
	}

	fn is_block_free(&self, block: u64) -> bool {
		!self.block_bitmap.get(block) && !self.reserved_blocks.get(block)
	}

	/// Reserves extents covering exactly `block_count` blocks,
	/// first-fit.
	///
	/// Each extent is capped at `EXTENT_LENGTH_MAX` blocks; more than
	/// `MAX_EXTENTS_PER_BLOB` extents is a fragmentation failure and
	/// releases everything taken so far.
	pub fn reserve_blocks(&mut self, block_count: u64) -> Result<Vec<ReservedExtent>> {
		let mut extents = Vec::new();
		let mut remaining = block_count;
		let mut cursor = 0u64;
		while remaining > 0 {
			let start = match self.next_free_block(cursor) {
				Some(start) => start,
				None => {
					let taken = block_count - remaining;
					self.release_blocks(&extents);
					return Err(Error::NoSpace(format!(
						"no free blocks after reserving {taken} of {block_count}"
					)));
				}
			};
			let run = self.free_run_len(start, remaining.min(EXTENT_LENGTH_MAX));
			debug_assert!(run > 0);
			debug_assert!(start <= EXTENT_START_MAX);
			if extents.len() as u64 == MAX_EXTENTS_PER_BLOB {
				self.release_blocks(&extents);
				return Err(Error::TooFragmented {
					needed: MAX_EXTENTS_PER_BLOB + 1,
					limit: MAX_EXTENTS_PER_BLOB,
				});
			}
			for block in start..start + run {
				self.reserved_blocks.set(block);
			}
			extents.push(ReservedExtent { extent: Extent::new(start, run as u16) });
			remaining -= run;
			cursor = start + run;
		}
		Ok(extents)
	}

	fn next_free_block(&self, start: u64) -> Option<u64> {
		let mut bit = start;
		while bit < self.block_bitmap.size() {
			if self.is_block_free(bit) {
				return Some(bit);
			}
			bit += 1;
		}
		None
	}

	fn free_run_len(&self, start: u64, limit: u64) -> u64 {
		let end = self.block_bitmap.size().min(start + limit);
		let mut bit = start;
		while bit < end && self.is_block_free(bit) {
			bit += 1;
		}
		bit - start
	}

	/// Reserves a free node slot with id at least `min_node`.
	///
	/// Node 0 may only head a chain, so extent-container reservations
	/// pass `min_node` = 1.
	pub fn reserve_node(&mut self, min_node: u32) -> Result<ReservedNode> {
		for (i, node) in self.nodes.iter().enumerate().skip(min_node as usize) {
			let id = i as u32;
			if !node.header().is_allocated() && !self.reserved_nodes.contains(&id) {
				self.reserved_nodes.insert(id);
				return Ok(ReservedNode { node: id });
			}
		}
		Err(Error::NoSpace("node table exhausted".to_string()))
	}

	/// Commits block reservations: sets the persistent bits and
	/// returns the number of blocks committed.
	pub fn commit_blocks(&mut self, extents: &[ReservedExtent]) -> u64 {
		let mut committed = 0;
		for reserved in extents {
			let extent = reserved.extent;
			for block in extent.start()..extent.start() + extent.length() {
				debug_assert!(self.reserved_blocks.get(block));
				debug_assert!(!self.block_bitmap.get(block));
				self.reserved_blocks.clear(block);
				self.block_bitmap.set(block);
			}
			committed += extent.length();
		}
		committed
	}

	/// Commits node reservations. The caller has already populated
	/// the records; allocation is visible through their headers.
	pub fn commit_nodes(&mut self, nodes: &[ReservedNode]) {
		for reserved in nodes {
			let removed = self.reserved_nodes.remove(&reserved.node);
			debug_assert!(removed);
		}
	}

	/// Returns reserved blocks to the free pool.
	pub fn release_blocks(&mut self, extents: &[ReservedExtent]) {
		for reserved in extents {
			let extent = reserved.extent;
			for block in extent.start()..extent.start() + extent.length() {
				self.reserved_blocks.clear(block);
			}
		}
	}

	/// Returns reserved nodes to the free pool and zeroes any records
	/// a failed ingest may have partially populated.
	pub fn release_nodes(&mut self, nodes: &[ReservedNode]) {
		for reserved in nodes {
			self.reserved_nodes.remove(&reserved.node);
			if let Some(record) = self.nodes.get_mut(reserved.node as usize) {
				*record = RawNode::zeroed();
			}
		}
	}

	/// Marks a block allocated directly; only mkfs-time state like the
	/// reserved start block goes through here.
	pub fn set_block(&mut self, block: u64) {
		self.block_bitmap.set(block);
	}
}

/// Walks the extents of a blob's node chain in order, validating the
/// chain shape as it goes.
pub struct ExtentIterator<'a> {
	nodes: &'a [RawNode],
	/// Node currently being read.
	current: u32,
	/// Node the iterator arrived from, for backlink checks.
	previous: u32,
	/// Index of the next extent within the current node.
	index_in_node: u16,
	/// Extents already yielded.
	yielded: u16,
	/// Total extents the inode promised.
	extent_count: u16,
	/// Nodes visited, to cut cycles.
	visited: u64,
	failed: bool,
}

impl<'a> ExtentIterator<'a> {
	/// Starts iterating at `node`, which must be an allocated inode.
	pub fn new(nodes: &'a [RawNode], node: u32) -> Result<Self> {
		let record = nodes
			.get(node as usize)
			.ok_or_else(|| Error::InvalidArgs(format!("node id {node} out of range")))?;
		if !record.header().is_inode() {
			return Err(Error::FormatError(format!("node {node} is not an allocated inode")));
		}
		Ok(Self {
			nodes,
			current: node,
			previous: node,
			index_in_node: 0,
			yielded: 0,
			extent_count: record.as_inode().extent_count.get(),
			visited: 1,
			failed: false,
		})
	}

	/// The `next_node` field of the node holding the last extent, for
	/// terminal-sentinel checks once iteration is done.
	pub fn terminal_next_node(&self) -> u32 {
		match self.nodes.get(self.current as usize) {
			Some(record) => record.header().next_node.get(),
			None => SENTINEL_NODE,
		}
	}

	fn advance(&mut self) -> Result<Option<Extent>> {
		loop {
			if self.yielded == self.extent_count {
				return Ok(None);
			}
			let record = &self.nodes[self.current as usize];
			let (extents, count): (&[Extent], u16) = if self.current == self.previous
				&& !record.header().is_extent_container()
			{
				let inode = record.as_inode();
				(
					std::slice::from_ref(&inode.inline_extent),
					inode.extent_count.get().min(1),
				)
			} else {
				let container = record.as_container();
				(&container.extents, container.extent_count.get())
			};
			if count as usize > extents.len() {
				return Err(Error::FormatError(format!(
					"node {} claims {count} extents, capacity is {}",
					self.current,
					extents.len()
				)));
			}
			if self.index_in_node < count {
				let extent = extents[self.index_in_node as usize];
				if extent.length() == 0 {
					return Err(Error::FormatError(format!(
						"zero-length extent in node {}",
						self.current
					)));
				}
				self.index_in_node += 1;
				self.yielded += 1;
				return Ok(Some(extent));
			}

			// Move to the next container in the chain.
			let next = record.header().next_node.get();
			if next == SENTINEL_NODE {
				return Err(Error::FormatError(format!(
					"chain ends after {} of {} extents",
					self.yielded, self.extent_count
				)));
			}
			let next_record = self
				.nodes
				.get(next as usize)
				.ok_or_else(|| Error::FormatError(format!("next node {next} out of range")))?;
			let header = next_record.header();
			if !header.is_allocated() || !header.is_extent_container() {
				return Err(Error::FormatError(format!(
					"next node {next} is not an allocated extent container"
				)));
			}
			if next_record.as_container().previous_node.get() != self.current {
				return Err(Error::FormatError(format!(
					"container {next} does not link back to node {}",
					self.current
				)));
			}
			self.visited += 1;
			if self.visited > self.nodes.len() as u64 {
				return Err(Error::FormatError("node chain contains a cycle".to_string()));
			}
			self.previous = self.current;
			self.current = next;
			self.index_in_node = 0;
		}
	}
}

impl Iterator for ExtentIterator<'_> {
	type Item = Result<Extent>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.failed {
			return None;
		}
		match self.advance() {
			Ok(Some(extent)) => Some(Ok(extent)),
			Ok(None) => None,
			Err(e) => {
				self.failed = true;
				Some(Err(e))
			}
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::format::NodeFlags;
	use crate::format::CONTAINER_MAX_EXTENTS;
	use crate::format::NODE_VERSION;

	fn allocator(block_count: u64, node_count: usize) -> Allocator {
		let bitmap = Bitmap::new(block_count, block_count.div_ceil(8) as usize);
		Allocator::new(bitmap, vec![RawNode::zeroed(); node_count])
	}

	#[test]
	fn reserve_blocks_is_first_fit() {
		let mut alloc = allocator(64, 4);
		alloc.set_block(0);

		let extents = alloc.reserve_blocks(5).unwrap();
		assert_eq!(extents.len(), 1);
		assert_eq!(extents[0].extent().start(), 1);
		assert_eq!(extents[0].extent().length(), 5);

		// The reservation holds the blocks even before commit.
		let more = alloc.reserve_blocks(3).unwrap();
		assert_eq!(more[0].extent().start(), 6);
	}

	#[test]
	fn reserve_blocks_skips_holes() {
		let mut alloc = allocator(32, 4);
		alloc.set_block(2);
		alloc.set_block(5);

		let extents = alloc.reserve_blocks(6).unwrap();
		let runs: Vec<(u64, u64)> =
			extents.iter().map(|r| (r.extent().start(), r.extent().length())).collect();
		assert_eq!(runs, vec![(0, 2), (3, 2), (6, 2)]);
	}

	#[test]
	fn exhaustion_releases_partial_reservations() {
		let mut alloc = allocator(8, 4);
		assert!(matches!(alloc.reserve_blocks(9), Err(Error::NoSpace(_))));
		// Nothing stays reserved after the failure.
		let extents = alloc.reserve_blocks(8).unwrap();
		assert_eq!(extents[0].extent().length(), 8);
	}

	#[test]
	fn commit_sets_bits_and_counts() {
		let mut alloc = allocator(16, 4);
		let extents = alloc.reserve_blocks(4).unwrap();
		assert_eq!(alloc.block_bitmap().popcount(), 0);
		assert_eq!(alloc.commit_blocks(&extents), 4);
		assert_eq!(alloc.block_bitmap().popcount(), 4);
	}

	#[test]
	fn release_returns_blocks() {
		let mut alloc = allocator(16, 4);
		let extents = alloc.reserve_blocks(16).unwrap();
		alloc.release_blocks(&extents);
		let again = alloc.reserve_blocks(16).unwrap();
		assert_eq!(again[0].extent().start(), 0);
	}

	#[test]
	fn node_reservation_respects_min_node() {
		let mut alloc = allocator(8, 4);
		let head = alloc.reserve_node(0).unwrap();
		assert_eq!(head.node(), 0);
		let container = alloc.reserve_node(1).unwrap();
		assert_eq!(container.node(), 1);
		let another = alloc.reserve_node(0).unwrap();
		assert_eq!(another.node(), 2);
	}

	#[test]
	fn node_reservation_exhausts() {
		let mut alloc = allocator(8, 2);
		alloc.reserve_node(0).unwrap();
		alloc.reserve_node(0).unwrap();
		assert!(matches!(alloc.reserve_node(0), Err(Error::NoSpace(_))));
	}

	fn build_chain(alloc: &mut Allocator, extents: &[Extent]) -> u32 {
		// Hand-assemble an inode plus containers for the test cases.
		let inode_flags = NodeFlags::ALLOCATED;
		let head = 0u32;
		{
			let record = alloc.node_mut(head).unwrap();
			let inode = record.as_inode_mut();
			inode.header.flags = inode_flags.bits().into();
			inode.header.version = NODE_VERSION.into();
			inode.header.next_node = SENTINEL_NODE.into();
			inode.extent_count = (extents.len() as u16).into();
			if let Some(first) = extents.first() {
				inode.inline_extent = *first;
			}
		}
		let mut previous = head;
		for (i, chunk) in extents[1.min(extents.len())..]
			.chunks(CONTAINER_MAX_EXTENTS as usize)
			.enumerate()
		{
			let id = 1 + i as u32;
			{
				let record = alloc.node_mut(previous).unwrap();
				record.as_inode_mut().header.next_node = id.into();
			}
			let record = alloc.node_mut(id).unwrap();
			let container = record.as_container_mut();
			container.header.flags =
				(NodeFlags::ALLOCATED | NodeFlags::EXTENT_CONTAINER).bits().into();
			container.header.version = NODE_VERSION.into();
			container.header.next_node = SENTINEL_NODE.into();
			container.previous_node = previous.into();
			container.extent_count = (chunk.len() as u16).into();
			container.extents[..chunk.len()].copy_from_slice(chunk);
			previous = id;
		}
		head
	}

	#[test]
	fn extent_iterator_walks_a_chain() {
		let mut alloc = allocator(1024, 8);
		let extents: Vec<Extent> =
			(0..9).map(|i| Extent::new(i * 10, 2)).collect();
		let head = build_chain(&mut alloc, &extents);

		let mut iter = ExtentIterator::new(alloc.nodes(), head).unwrap();
		let walked: Vec<Extent> = iter.by_ref().collect::<Result<_>>().unwrap();
		assert_eq!(walked, extents);
		assert_eq!(iter.terminal_next_node(), SENTINEL_NODE);
	}

	#[test]
	fn extent_iterator_rejects_broken_backlink() {
		let mut alloc = allocator(1024, 8);
		let extents: Vec<Extent> = (0..3).map(|i| Extent::new(i * 10, 1)).collect();
		let head = build_chain(&mut alloc, &extents);
		alloc.node_mut(1).unwrap().as_container_mut().previous_node = 7.into();

		let result: Result<Vec<Extent>> =
			ExtentIterator::new(alloc.nodes(), head).unwrap().collect();
		assert!(matches!(result, Err(Error::FormatError(_))));
	}

	#[test]
	fn extent_iterator_rejects_truncated_chain() {
		let mut alloc = allocator(1024, 8);
		let extents: Vec<Extent> = (0..2).map(|i| Extent::new(i * 10, 1)).collect();
		let head = build_chain(&mut alloc, &extents);
		// Claim one more extent than the chain holds.
		alloc.node_mut(head).unwrap().as_inode_mut().extent_count = 3.into();

		let result: Result<Vec<Extent>> =
			ExtentIterator::new(alloc.nodes(), head).unwrap().collect();
		assert!(matches!(result, Err(Error::FormatError(_))));
	}
}
