//! Generic persistent B+-tree (spec §4.2): uniform interior nodes, leaves
//! plugged in by a per-tree [`LeafOps`] implementation.

pub mod node;

use crate::buffer::{Buffer, BufferOps, Map};
use crate::error::{Error, Result};
use crate::volume::BtreeRoot;
use node::BNode;
use parking_lot::Mutex;
use std::sync::Arc;

/// Allocates and frees the physical blocks a tree's own nodes live in.
/// Implemented by the bitmap allocator (spec §4.6) for every tree in the
/// engine, including the inode table itself.
pub trait BlockAlloc: Send + Sync {
	/// Allocates a single block, logging the change.
	fn alloc(&self) -> Result<u64>;
	/// Frees `count` blocks starting at `block`, logging the change.
	fn free(&self, block: u64, count: u32) -> Result<()>;
}

/// The capability set a leaf family plugs into the generic tree (spec
/// §4.2). Each method operates on one leaf's raw bytes; the tree engine
/// never interprets leaf contents itself.
pub trait LeafOps: Send + Sync {
	/// The magic identifying this leaf family (spec §3).
	fn magic(&self) -> u16;

	/// Verifies the leaf's magic.
	fn sniff(&self, data: &[u8]) -> bool {
		crate::codec::be16(data, 0) == self.magic()
	}

	/// Initializes a freshly allocated, empty leaf.
	fn init(&self, data: &mut [u8], block_size: usize);

	/// Bytes of live content in the leaf (spec: `need`).
	fn need(&self, data: &[u8]) -> usize;

	/// Bytes of unused slack in the leaf (spec: `free`).
	fn free_space(&self, data: &[u8], block_size: usize) -> usize;

	/// Partitions a full leaf into two halves, returning
	/// `(left_bytes, right_bytes, split_key)` where `split_key` is the
	/// first key of the right half.
	fn split(&self, data: &[u8], block_size: usize) -> (Vec<u8>, Vec<u8>, u64);

	/// Merges `right` into `left`, returning the merged bytes, or `None` if
	/// `need(right) > free_space(left)`.
	fn merge(&self, left: &[u8], right: &[u8], block_size: usize) -> Option<Vec<u8>>;

	/// Removes every entry at or beyond `from_key`, returning the new leaf
	/// bytes and the list of `(block, count)` ranges that became free as a
	/// result.
	fn chop(&self, data: &[u8], from_key: u64, block_size: usize) -> (Vec<u8>, Vec<(u64, u32)>);
}

/// One level of a root-to-leaf traversal path.
pub struct Frame {
	/// Block holding this level's node.
	pub block: u64,
	/// The pinned buffer.
	pub buffer: Arc<Mutex<Buffer>>,
	/// Index of the next child to descend into on a left-to-right scan; one
	/// past the child chosen by `probe`.
	pub next: usize,
}

/// An owned root-to-leaf path. Every buffer referenced by a frame is pinned
/// (reference-counted) until the cursor is released; dropping a `Cursor`
/// without releasing it leaks the pin, so callers always route it back
/// through [`Tree::release_cursor`], including on error paths.
pub struct Cursor {
	pub frames: Vec<Frame>,
}

impl Cursor {
	/// The leaf frame, if the cursor is non-empty (i.e. the tree has a root).
	pub fn leaf(&self) -> Option<&Frame> {
		self.frames.last()
	}
}

/// Progress state for a suspendable [`Tree::chop`] call.
#[derive(Debug, Clone)]
pub struct ChopInfo {
	/// Smallest key not yet processed; the chop range is `[resume, +inf)`.
	pub resume: u64,
	/// Blocks freed so far in this call (and prior suspended installments).
	pub freed: u64,
	/// Suspend once `freed >= blocks`; `0` means unlimited.
	pub blocks: u64,
}

impl ChopInfo {
	/// Starts a chop at `from_key` with no budget limit.
	pub fn from(from_key: u64) -> Self {
		Self {
			resume: from_key,
			freed: 0,
			blocks: 0,
		}
	}
}

/// A generic B+-tree bound to one buffer-cache map (the address space its
/// nodes live in — the raw volume for every tree in this engine) and one
/// leaf family.
pub struct Tree<O: BufferOps> {
	pub(crate) map: Arc<Map<O>>,
	pub(crate) alloc: Arc<dyn BlockAlloc>,
	pub(crate) leaf_ops: Arc<dyn LeafOps>,
	block_size: usize,
}

impl<O: BufferOps> Tree<O> {
	/// Builds a tree engine over `map`'s blocks, using `alloc` for node
	/// allocation and `leaf_ops` to interpret leaves.
	pub fn new(map: Arc<Map<O>>, alloc: Arc<dyn BlockAlloc>, leaf_ops: Arc<dyn LeafOps>) -> Self {
		let block_size = map.block_size();
		Self {
			map,
			alloc,
			leaf_ops,
			block_size,
		}
	}

	fn entries_per_node(&self) -> usize {
		BNode::entries_per_node(self.block_size)
	}

	fn read_node(&self, block: u64) -> Result<(Arc<Mutex<Buffer>>, BNode)> {
		let buf = self.map.read(block)?;
		let node = {
			let g = buf.lock();
			BNode::decode(g.data())
		};
		Ok((buf, node))
	}

	/// Allocates and initializes a fresh, empty leaf, making it the tree's
	/// sole (leaf-only) root.
	pub fn create_root(&self, root: &mut BtreeRoot) -> Result<()> {
		let block = self.alloc.alloc()?;
		let mut data = vec![0u8; self.block_size];
		self.leaf_ops.init(&mut data, self.block_size);
		let buf = self.map.get(block);
		buf.lock().data_mut().copy_from_slice(&data);
		self.map.release_dirty(&buf);
		root.depth = 0;
		root.block = block;
		Ok(())
	}

	/// Releases every buffer a cursor holds. Always call this exactly once
	/// per successfully returned cursor, on every path (including errors
	/// discovered after the cursor was built).
	pub fn release_cursor(&self, cursor: Cursor) {
		for frame in cursor.frames {
			self.map.release(&frame.buffer);
		}
	}

	/// Loads one buffer per level root-to-leaf, choosing at each interior
	/// level the child whose successor key is the first strictly greater
	/// than `key`. Returns an empty cursor (no frames) if the tree has no
	/// root yet.
	pub fn probe(&self, root: &BtreeRoot, key: u64) -> Result<Cursor> {
		if root.is_empty() {
			return Ok(Cursor { frames: Vec::new() });
		}
		let mut frames = Vec::with_capacity(root.depth as usize + 1);
		let mut block = root.block;
		for _ in 0..root.depth {
			let (buf, node) = match self.read_node(block) {
				Ok(v) => v,
				Err(e) => {
					self.release_cursor(Cursor { frames });
					return Err(e);
				}
			};
			if node.entries.is_empty() {
				self.map.release(&buf);
				self.release_cursor(Cursor { frames });
				return Err(Error::Corrupt("interior node with no entries"));
			}
			let (child_idx, next) = node.find_child(key);
			let child_block = node.entries[child_idx].1;
			frames.push(Frame {
				block,
				buffer: buf,
				next,
			});
			block = child_block;
		}
		let leaf_buf = match self.map.read(block) {
			Ok(b) => b,
			Err(e) => {
				self.release_cursor(Cursor { frames });
				return Err(e);
			}
		};
		let sniffed = self.leaf_ops.sniff(leaf_buf.lock().data());
		if !sniffed {
			self.map.release(&leaf_buf);
			self.release_cursor(Cursor { frames });
			return Err(Error::Corrupt("leaf magic mismatch"));
		}
		frames.push(Frame {
			block,
			buffer: leaf_buf,
			next: 0,
		});
		Ok(Cursor { frames })
	}

	/// Advances the cursor to the next leaf in left-to-right order,
	/// releasing the buffers it no longer needs. Returns `false` once the
	/// scan runs off the right edge of the tree (the cursor is then empty
	/// and needs no further release).
	pub fn advance(&self, root: &BtreeRoot, cursor: &mut Cursor) -> Result<bool> {
		if let Some(leaf) = cursor.frames.pop() {
			self.map.release(&leaf.buffer);
		}
		loop {
			let Some(top_idx) = cursor.frames.len().checked_sub(1) else {
				return Ok(false);
			};
			let node = {
				let g = cursor.frames[top_idx].buffer.lock();
				BNode::decode(g.data())
			};
			if cursor.frames[top_idx].next >= node.entries.len() {
				let f = cursor.frames.pop().unwrap();
				self.map.release(&f.buffer);
				continue;
			}
			let next = cursor.frames[top_idx].next;
			let child_block = node.entries[next].1;
			cursor.frames[top_idx].next += 1;
			let remaining = root.depth as usize - 1 - top_idx;
			let mut block = child_block;
			for _ in 0..remaining {
				let (buf, n) = self.read_node(block)?;
				let child = n.entries[0].1;
				cursor.frames.push(Frame {
					block,
					buffer: buf,
					next: 1,
				});
				block = child;
			}
			let leaf_buf = self.map.read(block)?;
			cursor.frames.push(Frame {
				block,
				buffer: leaf_buf,
				next: 0,
			});
			return Ok(true);
		}
	}

	/// The smallest key strictly greater than every key in the cursor's
	/// current leaf subtree, or `u64::MAX` at the right edge of the tree.
	pub fn next_key(&self, cursor: &Cursor) -> u64 {
		if cursor.frames.len() < 2 {
			return u64::MAX;
		}
		for frame in cursor.frames[..cursor.frames.len() - 1].iter().rev() {
			let node = {
				let g = frame.buffer.lock();
				BNode::decode(g.data())
			};
			if frame.next < node.entries.len() {
				return node.entries[frame.next].0;
			}
		}
		u64::MAX
	}

	/// Propagates a leaf split: inserts `(split_key, new_block)` at the
	/// cursor's position, splitting interior nodes (and the root, growing
	/// the tree by one level) as needed.
	pub fn insert_leaf(&self, root: &mut BtreeRoot, cursor: &Cursor, new_block: u64, split_key: u64) -> Result<()> {
		if cursor.frames.len() < 2 {
			// No interior level yet: the leaf alone was the whole tree.
			let leaf_block = cursor.frames[0].block;
			let new_root_block = self.alloc.alloc()?;
			let new_root = BNode {
				entries: vec![(0, leaf_block), (split_key, new_block)],
			};
			let mut data = vec![0u8; self.block_size];
			new_root.encode(&mut data);
			let buf = self.map.get(new_root_block);
			buf.lock().data_mut().copy_from_slice(&data);
			self.map.release_dirty(&buf);
			root.depth = 1;
			root.block = new_root_block;
			return Ok(());
		}
		let mut child_key = split_key;
		let mut child_block = new_block;
		let mut level = cursor.frames.len() - 2;
		let epn = self.entries_per_node();
		loop {
			let frame = &cursor.frames[level];
			let mut node = {
				let g = frame.buffer.lock();
				BNode::decode(g.data())
			};
			let pos = frame.next.min(node.entries.len());
			node.entries.insert(pos, (child_key, child_block));
			if node.entries.len() <= epn {
				let mut data = vec![0u8; self.block_size];
				node.encode(&mut data);
				frame.buffer.lock().data_mut().copy_from_slice(&data);
				self.map.mark_dirty(&frame.buffer);
				return Ok(());
			}
			// Node overflowed: split, left keeps the first half.
			let n = node.entries.len();
			let left_count = n / 2;
			let right_entries = node.entries.split_off(left_count);
			let separator = right_entries[0].0;
			let right_block = self.alloc.alloc()?;
			let mut left_data = vec![0u8; self.block_size];
			BNode {
				entries: node.entries,
			}
			.encode(&mut left_data);
			frame.buffer.lock().data_mut().copy_from_slice(&left_data);
			self.map.mark_dirty(&frame.buffer);
			let mut right_data = vec![0u8; self.block_size];
			BNode {
				entries: right_entries,
			}
			.encode(&mut right_data);
			let rbuf = self.map.get(right_block);
			rbuf.lock().data_mut().copy_from_slice(&right_data);
			self.map.release_dirty(&rbuf);
			if level == 0 {
				let new_root_block = self.alloc.alloc()?;
				let new_root = BNode {
					entries: vec![(0, frame.block), (separator, right_block)],
				};
				let mut data = vec![0u8; self.block_size];
				new_root.encode(&mut data);
				let buf = self.map.get(new_root_block);
				buf.lock().data_mut().copy_from_slice(&data);
				self.map.release_dirty(&buf);
				root.depth += 1;
				root.block = new_root_block;
				return Ok(());
			}
			child_key = separator;
			child_block = right_block;
			level -= 1;
		}
	}

	/// Attempts to merge the leaf at `cursor`'s position with its left
	/// sibling (another direct child of the same parent), when
	/// `leaf_need(this) <= leaf_free(prev)`. Returns `true` if a merge
	/// happened; the caller's leaf frame is no longer the merged block in
	/// that case (its block has been freed) and must not be reused.
	fn try_merge_left(&self, cursor: &Cursor, leaf_data: &[u8]) -> Result<bool> {
		if cursor.frames.len() < 2 {
			return Ok(false);
		}
		let parent = &cursor.frames[cursor.frames.len() - 2];
		let parent_node = {
			let g = parent.buffer.lock();
			BNode::decode(g.data())
		};
		let cur_child_idx = parent.next.saturating_sub(1);
		if cur_child_idx == 0 {
			return Ok(false);
		}
		let left_block = parent_node.entries[cur_child_idx - 1].1;
		let left_buf = self.map.read(left_block)?;
		let left_data = left_buf.lock().data().to_vec();
		let need = self.leaf_ops.need(leaf_data);
		let free = self.leaf_ops.free_space(&left_data, self.block_size);
		if need > free {
			self.map.release(&left_buf);
			return Ok(false);
		}
		let Some(merged) = self.leaf_ops.merge(&left_data, leaf_data, self.block_size) else {
			self.map.release(&left_buf);
			return Ok(false);
		};
		left_buf.lock().data_mut().copy_from_slice(&merged);
		self.map.mark_dirty(&left_buf);
		self.map.release(&left_buf);
		// Remove the current leaf's entry from the parent and free its block.
		let leaf_block = cursor.frames.last().unwrap().block;
		let mut new_parent = parent_node;
		new_parent.entries.remove(cur_child_idx);
		let mut data = vec![0u8; self.block_size];
		new_parent.encode(&mut data);
		parent.buffer.lock().data_mut().copy_from_slice(&data);
		self.map.mark_dirty(&parent.buffer);
		self.alloc.free(leaf_block, 1)?;
		Ok(true)
	}

	/// Range-deletes `[info.resume, +inf)`, walking leaves left to right,
	/// merging each consumed leaf with its left neighbor when possible.
	/// Returns `Ok(1)` if suspended (with `info.resume` set to the deepest
	/// unprocessed key), `Ok(0)` on completion.
	pub fn chop(&self, root: &mut BtreeRoot, info: &mut ChopInfo, deadline: &dyn Fn() -> bool) -> Result<i32> {
		if root.is_empty() {
			return Ok(0);
		}
		loop {
			if deadline() || (info.blocks != 0 && info.freed >= info.blocks) {
				return Ok(1);
			}
			let cursor = self.probe(root, info.resume)?;
			if cursor.frames.is_empty() {
				return Ok(0);
			}
			let leaf_frame = cursor.frames.last().unwrap();
			let (new_leaf, freed_list) = {
				let g = leaf_frame.buffer.lock();
				self.leaf_ops.chop(g.data(), info.resume, self.block_size)
			};
			for &(block, count) in &freed_list {
				self.alloc.free(block, count)?;
				info.freed += count as u64;
			}
			leaf_frame.buffer.lock().data_mut().copy_from_slice(&new_leaf);
			self.map.mark_dirty(&leaf_frame.buffer);
			let merged = self.try_merge_left(&cursor, &new_leaf)?;
			let moved = if merged {
				// The current leaf no longer exists; re-probe from the
				// resume key to pick up where the merge left off.
				self.release_cursor(cursor);
				true
			} else {
				let mut cursor = cursor;
				let moved = self.advance(root, &mut cursor)?;
				let nk = if moved {
					self.next_key(&cursor)
				} else {
					u64::MAX
				};
				self.release_cursor(cursor);
				if !moved {
					self.maybe_shorten(root)?;
					return Ok(0);
				}
				info.resume = nk;
				continue;
			};
			let _ = moved;
			// After a merge we stay at the same logical resume key; if
			// nothing is left beyond it the next probe will see an empty
			// remainder and the loop above will end via `advance` returning
			// false on the following iteration.
			let probe_again = self.probe(root, info.resume)?;
			if probe_again.frames.is_empty() {
				return Ok(0);
			}
			let done = {
				let leaf = probe_again.leaf().unwrap();
				let g = leaf.buffer.lock();
				self.leaf_ops.need(g.data()) == 0
			};
			self.release_cursor(probe_again);
			if done {
				self.maybe_shorten(root)?;
				return Ok(0);
			}
		}
	}

	/// Shortens the tree by one level while the root has a single child.
	fn maybe_shorten(&self, root: &mut BtreeRoot) -> Result<()> {
		while root.depth > 0 {
			let (buf, node) = self.read_node(root.block)?;
			if node.entries.len() != 1 {
				self.map.release(&buf);
				break;
			}
			let only_child = node.entries[0].1;
			self.map.release(&buf);
			self.alloc.free(root.block, 1)?;
			root.block = only_child;
			root.depth -= 1;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::buffer::BufferOps as _;
	use std::collections::HashMap as StdHashMap;
	use std::sync::atomic::{AtomicU64, Ordering};

	const BLOCK_SIZE: usize = 256;
	/// A leaf that stores a fixed-capacity sorted list of u64 keys, enough
	/// to exercise probe/advance/insert/split/chop without pulling in the
	/// dleaf/ileaf encodings.
	const TEST_MAGIC: u16 = 0xbeef;
	const TEST_CAP: usize = 6;

	struct TestLeafOps;

	fn decode_keys(data: &[u8]) -> Vec<u64> {
		let count = crate::codec::be16(data, 2) as usize;
		(0..count)
			.map(|i| crate::codec::be64(data, 4 + i * 8))
			.collect()
	}

	fn encode_keys(keys: &[u64]) -> Vec<u8> {
		let mut data = vec![0u8; BLOCK_SIZE];
		crate::codec::put_be16(&mut data, 0, TEST_MAGIC);
		crate::codec::put_be16(&mut data, 2, keys.len() as u16);
		for (i, &k) in keys.iter().enumerate() {
			crate::codec::put_be64(&mut data, 4 + i * 8, k);
		}
		data
	}

	impl LeafOps for TestLeafOps {
		fn magic(&self) -> u16 {
			TEST_MAGIC
		}

		fn init(&self, data: &mut [u8], _block_size: usize) {
			data.fill(0);
			crate::codec::put_be16(data, 0, TEST_MAGIC);
		}

		fn need(&self, data: &[u8]) -> usize {
			4 + decode_keys(data).len() * 8
		}

		fn free_space(&self, data: &[u8], block_size: usize) -> usize {
			block_size - self.need(data)
		}

		fn split(&self, data: &[u8], _block_size: usize) -> (Vec<u8>, Vec<u8>, u64) {
			let keys = decode_keys(data);
			let mid = keys.len() / 2;
			let (l, r) = keys.split_at(mid);
			(encode_keys(l), encode_keys(r), r[0])
		}

		fn merge(&self, left: &[u8], right: &[u8], _block_size: usize) -> Option<Vec<u8>> {
			let mut keys = decode_keys(left);
			keys.extend(decode_keys(right));
			Some(encode_keys(&keys))
		}

		fn chop(&self, data: &[u8], from_key: u64, _block_size: usize) -> (Vec<u8>, Vec<(u64, u32)>) {
			let keys = decode_keys(data);
			let kept: Vec<u64> = keys.iter().copied().filter(|&k| k < from_key).collect();
			(encode_keys(&kept), Vec::new())
		}
	}

	struct MemOps {
		store: Mutex<StdHashMap<u64, Vec<u8>>>,
	}

	impl BufferOps for MemOps {
		fn bread(&self, index: u64, buf: &mut [u8]) -> Result<()> {
			if let Some(data) = self.store.lock().get(&index) {
				buf.copy_from_slice(data);
			}
			Ok(())
		}

		fn bwrite(&self, index: u64, buf: &[u8]) -> Result<()> {
			self.store.lock().insert(index, buf.to_vec());
			Ok(())
		}
	}

	struct TestAlloc {
		next: AtomicU64,
	}

	impl BlockAlloc for TestAlloc {
		fn alloc(&self) -> Result<u64> {
			Ok(self.next.fetch_add(1, Ordering::SeqCst))
		}

		fn free(&self, _block: u64, _count: u32) -> Result<()> {
			Ok(())
		}
	}

	fn new_tree() -> (Tree<MemOps>, BtreeRoot) {
		let map = Arc::new(Map::new(
			MemOps {
				store: Mutex::new(StdHashMap::new()),
			},
			BLOCK_SIZE,
			64,
		));
		let alloc = Arc::new(TestAlloc {
			next: AtomicU64::new(1),
		});
		let tree = Tree::new(map, alloc, Arc::new(TestLeafOps));
		let mut root = BtreeRoot::EMPTY;
		tree.create_root(&mut root).unwrap();
		(tree, root)
	}

	/// Inserts `key` by probing, appending into the leaf's key list, and
	/// splitting via `insert_leaf` when the leaf would overflow capacity.
	fn insert(tree: &Tree<MemOps>, root: &mut BtreeRoot, key: u64) {
		let cursor = tree.probe(root, key).unwrap();
		let leaf = cursor.leaf().unwrap();
		let mut keys = decode_keys(leaf.buffer.lock().data());
		let pos = keys.partition_point(|&k| k < key);
		keys.insert(pos, key);
		if keys.len() <= TEST_CAP {
			let data = encode_keys(&keys);
			leaf.buffer.lock().data_mut().copy_from_slice(&data);
			tree.map.mark_dirty(&leaf.buffer);
			tree.release_cursor(cursor);
		} else {
			let data = encode_keys(&keys);
			let (left, right, split_key) = tree.leaf_ops.split(&data, BLOCK_SIZE);
			leaf.buffer.lock().data_mut().copy_from_slice(&left);
			tree.map.mark_dirty(&leaf.buffer);
			let new_block = tree.alloc.alloc().unwrap();
			let rbuf = tree.map.get(new_block);
			rbuf.lock().data_mut().copy_from_slice(&right);
			tree.map.release_dirty(&rbuf);
			tree.insert_leaf(root, &cursor, new_block, split_key).unwrap();
			tree.release_cursor(cursor);
		}
	}

	fn collect_all(tree: &Tree<MemOps>, root: &BtreeRoot) -> Vec<u64> {
		let mut out = Vec::new();
		let mut cursor = tree.probe(root, 0).unwrap();
		if cursor.frames.is_empty() {
			return out;
		}
		loop {
			let leaf = cursor.leaf().unwrap();
			out.extend(decode_keys(leaf.buffer.lock().data()));
			if !tree.advance(root, &mut cursor).unwrap() {
				break;
			}
		}
		out
	}

	#[test]
	fn round_trip_ascending_order() {
		let (tree, mut root) = new_tree();
		let mut keys: Vec<u64> = (0..40).map(|i| (i * 37) % 101).collect();
		keys.dedup();
		for &k in &keys {
			insert(&tree, &mut root, k);
		}
		let mut expected = keys.clone();
		expected.sort_unstable();
		expected.dedup();
		assert_eq!(collect_all(&tree, &root), expected);
	}

	#[test]
	fn probe_finds_inserted_key() {
		let (tree, mut root) = new_tree();
		for k in [10u64, 3, 77, 42, 5, 90, 1, 2, 3000] {
			insert(&tree, &mut root, k);
		}
		let cursor = tree.probe(&root, 42).unwrap();
		let leaf = cursor.leaf().unwrap();
		let keys = decode_keys(leaf.buffer.lock().data());
		assert!(keys.contains(&42));
		tree.release_cursor(cursor);
	}

	#[test]
	fn split_separator_is_first_key_of_right_half() {
		let (tree, mut root) = new_tree();
		for k in 0..(TEST_CAP as u64 + 1) {
			insert(&tree, &mut root, k);
		}
		assert_eq!(root.depth, 1);
		let all = collect_all(&tree, &root);
		assert_eq!(all, (0..(TEST_CAP as u64 + 1)).collect::<Vec<_>>());
	}

	#[test]
	fn chop_suspension_matches_uninterrupted_chop() {
		let (tree_a, mut root_a) = new_tree();
		let (tree_b, mut root_b) = new_tree();
		let keys: Vec<u64> = (0..30).collect();
		for &k in &keys {
			insert(&tree_a, &mut root_a, k);
			insert(&tree_b, &mut root_b, k);
		}
		let mut info = ChopInfo::from(10);
		tree_a.chop(&mut root_a, &mut info, &|| false).unwrap();

		let mut info_b = ChopInfo::from(10);
		let mut installments = 0;
		loop {
			let status = tree_b
				.chop(&mut root_b, &mut info_b, &|| {
					installments += 1;
					installments % 2 == 0
				})
				.unwrap();
			if status == 0 {
				break;
			}
		}
		assert_eq!(collect_all(&tree_a, &root_a), collect_all(&tree_b, &root_b));
		assert_eq!(collect_all(&tree_a, &root_a), (0..10).collect::<Vec<_>>());
	}
}
