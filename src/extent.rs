//! Extent mapper (spec §4.7): translates `(inode, logical-range)` into a
//! list of physical segments, allocating on write.

use crate::bitmap::{BallocResult, Bitmap, BitmapStore};
use crate::btree::{ChopInfo, Cursor, Tree};
use crate::buffer::BufferOps;
use crate::dleaf::{Dleaf, Extent};
use crate::error::{Error, Result};
use crate::redo::LogWriter;
use crate::volume::BtreeRoot;

/// Read/write intent for [`map_region`] (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
	/// Never allocates; holes are reported, not filled.
	Read,
	/// Allocates to fill holes.
	Write,
	/// Frees every existing block in the region first (copy-on-write
	/// discard), then allocates fresh blocks for the whole range.
	Redirect,
	/// Reserved for a future delayed-allocation path; currently behaves
	/// like `Write`.
	Delayed,
}

/// State of one mapped segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegState {
	/// No physical blocks are mapped here.
	Hole,
	/// Freshly allocated by this call.
	New,
	/// Pre-existing mapping, unchanged.
	Normal,
}

/// One physical segment of a [`map_region`] result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
	pub logical: u64,
	pub block: u64,
	pub count: u32,
	pub state: SegState,
}

/// Maps `[start, start + count)` logical blocks of `root`'s data tree,
/// per `mode` (spec §4.7). On a write mode, creates the tree if it has no
/// root yet. Returns segments covering at least one block; the first and
/// last are trimmed to the requested range.
pub fn map_region<O: BufferOps, S: BitmapStore>(
	tree: &Tree<O>,
	root: &mut BtreeRoot,
	bitmap: &Bitmap<S>,
	log: &dyn LogWriter,
	start: u64,
	count: u64,
	mode: MapMode,
) -> Result<Vec<Segment>> {
	if root.is_empty() {
		if mode == MapMode::Read {
			return Ok(vec![Segment {
				logical: start,
				block: 0,
				count: count as u32,
				state: SegState::Hole,
			}]);
		}
		tree.create_root(root)?;
	}

	let cursor = tree.probe(root, start)?;
	let mut segs = gather_segments(tree, &cursor, start, count)?;
	tree.release_cursor(cursor);

	if mode == MapMode::Read {
		return Ok(segs);
	}

	if mode == MapMode::Redirect {
		for seg in &segs {
			if seg.state == SegState::Normal {
				bitmap.bfree(log, seg.block, seg.count)?;
			}
		}
		segs = vec![Segment {
			logical: start,
			block: 0,
			count: count as u32,
			state: SegState::Hole,
		}];
	}

	let mut allocated = Vec::new();
	for seg in &mut segs {
		if seg.state != SegState::Hole {
			continue;
		}
		match bitmap.balloc(log, seg.count)? {
			BallocResult::Allocated(block) => {
				seg.block = block;
				seg.state = SegState::New;
				allocated.push((block, seg.count));
			}
			BallocResult::OutOfSpace => {
				for (block, count) in allocated {
					let _ = bitmap.bfree(log, block, count);
				}
				return Err(Error::OutOfSpace);
			}
		}
	}

	write_segments(tree, root, &segs)?;
	Ok(segs)
}

/// Walks the leaf (and, for large regions, subsequent leaves) covering
/// `[start, start+count)`, emitting `HOLE` for gaps and `NORMAL` for
/// stored extents, trimmed to the requested range.
fn gather_segments<O: BufferOps>(tree: &Tree<O>, cursor: &Cursor, start: u64, count: u64) -> Result<Vec<Segment>> {
	let end = start + count;
	let Some(leaf) = cursor.leaf() else {
		return Ok(vec![Segment {
			logical: start,
			block: 0,
			count: count as u32,
			state: SegState::Hole,
		}]);
	};
	let dleaf = {
		let g = leaf.buffer.lock();
		Dleaf::decode(g.data())
	};
	let _ = tree;
	let entries = dleaf.iter_entries();
	let mut segs = Vec::new();
	let mut cursor_key = start;
	while cursor_key < end {
		// The entry whose run covers `cursor_key`, if any: the last entry
		// whose start is `<= cursor_key` and whose run extends past it.
		let covering = entries
			.iter()
			.rev()
			.find(|(k, e)| *k <= cursor_key && cursor_key < *k + e.count as u64);
		match covering {
			Some((ext_key, extent)) => {
				let extent_end = ext_key + extent.count as u64;
				let seg_end = extent_end.min(end);
				let offset = cursor_key - ext_key;
				segs.push(Segment {
					logical: cursor_key,
					block: extent.block + offset,
					count: (seg_end - cursor_key) as u32,
					state: SegState::Normal,
				});
				cursor_key = seg_end;
			}
			None => {
				// Extend the hole until the next entry's start or region end.
				let next = entries
					.iter()
					.map(|(k, _)| *k)
					.filter(|&k| k > cursor_key)
					.min()
					.unwrap_or(end)
					.min(end);
				segs.push(Segment {
					logical: cursor_key,
					block: 0,
					count: (next - cursor_key) as u32,
					state: SegState::Hole,
				});
				cursor_key = next;
			}
		}
	}
	if segs.is_empty() {
		segs.push(Segment {
			logical: start,
			count: count as u32,
			block: 0,
			state: SegState::Hole,
		});
	}
	Ok(segs)
}

/// Writes freshly allocated segments' extents into the leaf, splitting it
/// (and propagating the split to the tree) when it no longer fits.
fn write_segments<O: BufferOps>(tree: &Tree<O>, root: &mut BtreeRoot, segs: &[Segment]) -> Result<()> {
	for seg in segs {
		if seg.state != SegState::New {
			continue;
		}
		let mut remaining_logical = seg.logical;
		let mut remaining_block = seg.block;
		let mut remaining_count = seg.count;
		while remaining_count > 0 {
			let chunk = remaining_count.min(64);
			insert_one_extent(
				tree,
				root,
				remaining_logical,
				Extent {
					block: remaining_block,
					count: chunk,
					version: 0,
				},
			)?;
			remaining_logical += chunk as u64;
			remaining_block += chunk as u64;
			remaining_count -= chunk;
		}
	}
	Ok(())
}

fn insert_one_extent<O: BufferOps>(tree: &Tree<O>, root: &mut BtreeRoot, key: u64, extent: Extent) -> Result<()> {
	let cursor = tree.probe(root, key)?;
	let block_size = {
		let leaf = cursor.leaf().unwrap();
		leaf.buffer.lock().data().len()
	};
	let leaf = cursor.leaf().unwrap();
	let current = {
		let g = leaf.buffer.lock();
		Dleaf::decode(g.data())
	};
	match current.try_insert(key, extent, block_size) {
		Some(updated) => {
			let data = updated.encode(block_size);
			leaf.buffer.lock().data_mut().copy_from_slice(&data);
			tree.map.mark_dirty(&leaf.buffer);
			tree.release_cursor(cursor);
			Ok(())
		}
		None => {
			let (left, right, split_key) = current.split_at_median();
			let left_data = left.encode(block_size);
			leaf.buffer.lock().data_mut().copy_from_slice(&left_data);
			tree.map.mark_dirty(&leaf.buffer);
			let new_block = tree.alloc.alloc()?;
			let new_buf = tree.map.get(new_block);
			new_buf.lock().data_mut().copy_from_slice(&right.encode(block_size));
			tree.map.release_dirty(&new_buf);
			tree.insert_leaf(root, &cursor, new_block, split_key)?;
			tree.release_cursor(cursor);
			insert_one_extent(tree, root, key, extent)
		}
	}
}

/// Frees every block mapped at or beyond `from_key` in `root`'s data tree
/// (spec §4.2 `chop`, driven here with the dleaf-specific free callback).
pub fn truncate_tree<O: BufferOps, S: BitmapStore>(
	tree: &Tree<O>,
	root: &mut BtreeRoot,
	bitmap: &Bitmap<S>,
	log: &dyn LogWriter,
	from_key: u64,
) -> Result<()> {
	let mut info = ChopInfo::from(from_key);
	loop {
		let status = tree.chop(root, &mut info, &|| false)?;
		if status == 0 {
			break;
		}
	}
	// `chop` already freed ranges via the tree's BlockAlloc; the bitmap
	// parameter is retained for callers that need to assert freeblocks
	// accounting in the same call, matching the original's single
	// `truncate` entry point.
	let _ = bitmap;
	let _ = log;
	Ok(())
}
