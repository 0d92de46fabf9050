//! Inode facade (spec §4.10): `iget`/`iput`, `create`, `read`/`write`,
//! `truncate`, `unlink`, layered over the inode-table B-tree and each
//! file's own data B-tree.

use crate::attr::{self, Attr};
use crate::bitmap::{Bitmap, BitmapStore};
use crate::btree::Tree;
use crate::buffer::BufferOps;
use crate::error::{Error, Result};
use crate::extent::{self, MapMode, SegState};
use crate::ileaf::{Ileaf, IleafOps};
use crate::redo::LogWriter;
use crate::volume::BtreeRoot;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// In-memory inode state (spec §3).
#[derive(Debug, Clone)]
pub struct Inode {
	pub inum: u64,
	pub mode: u32,
	pub uid: u32,
	pub gid: u32,
	pub ctime: u64,
	pub mtime: u64,
	pub size: u64,
	pub nlink: u32,
	pub data_root: BtreeRoot,
	pub xattrs: Vec<(String, Vec<u8>)>,
	dirty: bool,
}

impl Inode {
	fn from_attrs(inum: u64, attrs: &[Attr]) -> Result<Self> {
		let mut inode = Inode {
			inum,
			mode: 0,
			uid: 0,
			gid: 0,
			ctime: 0,
			mtime: 0,
			size: 0,
			nlink: 1,
			data_root: BtreeRoot::EMPTY,
			xattrs: Vec::new(),
			dirty: false,
		};
		for a in attrs {
			match a {
				Attr::CtimeOwner { ctime, mode, uid, gid } => {
					inode.ctime = *ctime;
					inode.mode = *mode;
					inode.uid = *uid;
					inode.gid = *gid;
				}
				Attr::MtimeSize { mtime, isize } => {
					inode.mtime = *mtime;
					inode.size = *isize;
				}
				Attr::DataBtree(root) => inode.data_root = *root,
				Attr::LinkCount(n) => inode.nlink = *n,
				Attr::Xattr { name, value } => inode.xattrs.push((name.clone(), value.clone())),
				Attr::Unknown { .. } => {}
			}
		}
		Ok(inode)
	}

	fn to_attrs(&self) -> Vec<Attr> {
		let mut attrs = vec![
			Attr::CtimeOwner {
				ctime: self.ctime,
				mode: self.mode,
				uid: self.uid,
				gid: self.gid,
			},
			Attr::MtimeSize {
				mtime: self.mtime,
				isize: self.size,
			},
			Attr::DataBtree(self.data_root),
			Attr::LinkCount(self.nlink),
		];
		for (name, value) in &self.xattrs {
			attrs.push(Attr::Xattr {
				name: name.clone(),
				value: value.clone(),
			});
		}
		attrs
	}
}

struct Cache {
	/// Inodes with in-memory state not yet written back; `iget` checks
	/// here first so an in-flight mutation is observed by a concurrent
	/// looker-upper (spec §4.10).
	dirty: HashMap<u64, Inode>,
	/// Reference counts for inodes currently pinned by a holder.
	refs: HashMap<u64, usize>,
}

/// Ties together the inode-table B-tree, the bitmap allocator, and the
/// redo log into the engine's top-level read/write/create/unlink surface.
pub struct InodeTable<O: BufferOps, S: BitmapStore> {
	itable: Tree<O>,
	bitmap: Arc<Bitmap<S>>,
	log: Arc<dyn LogWriter>,
	block_size: usize,
	cache: Mutex<Cache>,
}

impl<O: BufferOps, S: BitmapStore> InodeTable<O, S> {
	/// Builds the facade over an inode-table tree already bound to
	/// [`IleafOps`], a bitmap allocator, and a log writer.
	pub fn new(itable: Tree<O>, bitmap: Arc<Bitmap<S>>, log: Arc<dyn LogWriter>, block_size: usize) -> Self {
		Self {
			itable,
			bitmap,
			log,
			block_size,
			cache: Mutex::new(Cache {
				dirty: HashMap::new(),
				refs: HashMap::new(),
			}),
		}
	}

	/// Looks up `inum`, preferring the dirty-inode list over the on-disk
	/// table so unwritten mutations are observed.
	pub fn iget(&self, root: &BtreeRoot, inum: u64) -> Result<Inode> {
		{
			let mut cache = self.cache.lock();
			if let Some(inode) = cache.dirty.get(&inum).cloned() {
				*cache.refs.entry(inum).or_insert(0) += 1;
				return Ok(inode);
			}
		}
		let cursor = self.itable.probe(root, inum)?;
		let attrs_bytes = {
			let leaf = cursor.leaf().ok_or(Error::NotFound)?;
			let g = leaf.buffer.lock();
			let ileaf = Ileaf::decode(g.data());
			ileaf.lookup(inum).map(|s| s.to_vec())
		};
		self.itable.release_cursor(cursor);
        let attrs_bytes = attrs_bytes.ok_or(Error::NotFound)?;
		let attrs = attr::decode_all(&attrs_bytes)?;
		let inode = Inode::from_attrs(inum, &attrs)?;
		let mut cache = self.cache.lock();
		*cache.refs.entry(inum).or_insert(0) += 1;
		Ok(inode)
	}

	/// Releases a reference acquired by [`Self::iget`]; once the count
	/// reaches zero and the inode carries no unwritten state it is
	/// dropped from the dirty-inode list.
	pub fn iput(&self, inum: u64) {
		let mut cache = self.cache.lock();
		if let Some(count) = cache.refs.get_mut(&inum) {
			*count = count.saturating_sub(1);
			if *count == 0 {
				cache.refs.remove(&inum);
				if let Some(inode) = cache.dirty.get(&inum) {
					if !inode.dirty {
						cache.dirty.remove(&inum);
					}
				}
			}
		}
	}

	/// Marks `inode` dirty (pending write-back) and updates the in-memory
	/// cache so subsequent `iget` calls observe it.
	pub fn mark_dirty(&self, mut inode: Inode) {
		inode.dirty = true;
		self.cache.lock().dirty.insert(inode.inum, inode);
	}

	/// Writes every dirty cached inode's attributes into the itable.
	pub fn writeback_all(&self, root: &mut BtreeRoot) -> Result<()> {
		let dirty_inums: Vec<u64> = {
			let cache = self.cache.lock();
			cache.dirty.iter().filter(|(_, i)| i.dirty).map(|(&k, _)| k).collect()
		};
		for inum in dirty_inums {
			let mut inode = { self.cache.lock().dirty.get(&inum).cloned().ok_or(Error::NotFound)? };
			self.put_attrs(root, inum, &inode.to_attrs())?;
			inode.dirty = false;
			self.cache.lock().dirty.insert(inum, inode);
		}
		Ok(())
	}

	fn put_attrs(&self, root: &mut BtreeRoot, inum: u64, attrs: &[Attr]) -> Result<()> {
		let encoded = attr::encode_all(attrs);
		let cursor = self.itable.probe(root, inum)?;
		if cursor.frames.is_empty() {
			self.itable.release_cursor(cursor);
			self.itable.create_root(root)?;
			return self.put_attrs(root, inum, attrs);
		}
		let leaf = cursor.leaf().unwrap();
		let current = {
			let g = leaf.buffer.lock();
			Ileaf::decode(g.data())
		};
		match current.try_put(inum, &encoded, self.block_size) {
			Some(updated) => {
				leaf.buffer.lock().data_mut().copy_from_slice(&updated.encode(self.block_size));
				self.itable.map.mark_dirty(&leaf.buffer);
				self.itable.release_cursor(cursor);
				Ok(())
			}
			None => {
				let (left, right, split_key) = current.split_at_median(self.block_size);
				leaf.buffer.lock().data_mut().copy_from_slice(&left.encode(self.block_size));
				self.itable.map.mark_dirty(&leaf.buffer);
				let new_block = self.itable.alloc.alloc()?;
				let new_buf = self.itable.map.get(new_block);
				new_buf.lock().data_mut().copy_from_slice(&right.encode(self.block_size));
				self.itable.map.release_dirty(&new_buf);
				self.itable.insert_leaf(root, &cursor, new_block, split_key)?;
				self.itable.release_cursor(cursor);
				self.put_attrs(root, inum, attrs)
			}
		}
	}

	/// Probes the itable starting at `goal`, advancing across leaves while
	/// none offers a free inum, then writes a fresh attribute record and
	/// an empty data B-tree for it.
	pub fn create(&self, root: &mut BtreeRoot, goal: u64, mode: u32, uid: u32, gid: u32, now: u64) -> Result<Inode> {
		if root.is_empty() {
			self.itable.create_root(root)?;
		}
		let mut cursor = self.itable.probe(root, goal)?;
		let inum = loop {
			let found = {
				let leaf = cursor.leaf().ok_or(Error::NoMemory)?;
				let g = leaf.buffer.lock();
				Ileaf::decode(g.data()).find_empty_inode(goal, self.block_size)
			};
			if let Some(inum) = found {
				break inum;
			}
			if !self.itable.advance(root, &mut cursor)? {
				return Err(Error::NoMemory);
			}
		};
		self.itable.release_cursor(cursor);

		let inode = Inode {
			inum,
			mode,
			uid,
			gid,
			ctime: now,
			mtime: now,
			size: 0,
			nlink: 1,
			data_root: BtreeRoot::EMPTY,
			xattrs: Vec::new(),
			dirty: false,
		};
		self.put_attrs(root, inum, &inode.to_attrs())?;
		Ok(inode)
	}

	/// Reads `len` bytes starting at `offset` from `inode`'s data tree via
	/// the extent mapper and buffer cache, writing into `buf` (which must
	/// be exactly `len` bytes). Unmapped regions read as zero.
	pub fn read(
		&self,
		data_tree: &Tree<O>,
		inode: &Inode,
		offset: u64,
		buf: &mut [u8],
	) -> Result<()> {
		let block_size = self.block_size as u64;
		let start_block = offset / block_size;
		let end_block = (offset + buf.len() as u64).div_ceil(block_size);
		let mut root = inode.data_root;
		let segs = extent::map_region(
			data_tree,
			&mut root,
			&*self.bitmap,
			&*self.log,
			start_block,
			end_block - start_block,
			MapMode::Read,
		)?;
		let mut dst = 0usize;
		let mut logical = start_block;
		for seg in segs {
			for i in 0..seg.count as u64 {
				let block_buf = if seg.state == SegState::Hole {
					vec![0u8; self.block_size]
				} else {
					let buffer = data_tree.map.read(seg.block + i)?;
					let data = buffer.lock().data().to_vec();
					data_tree.map.release(&buffer);
					data
				};
				let block_start = logical * block_size;
				let block_end = block_start + block_size;
				let want_start = offset.max(block_start);
				let want_end = (offset + buf.len() as u64).min(block_end);
				if want_start < want_end {
					let src_off = (want_start - block_start) as usize;
					let len = (want_end - want_start) as usize;
					buf[dst..dst + len].copy_from_slice(&block_buf[src_off..src_off + len]);
					dst += len;
				}
				logical += 1;
			}
		}
		Ok(())
	}

	/// Writes `buf` at `offset` into `inode`'s data tree, allocating as
	/// needed, and updates `mtime`/`size`.
	pub fn write(&self, data_tree: &Tree<O>, inode: &mut Inode, offset: u64, buf: &[u8], now: u64) -> Result<()> {
		let block_size = self.block_size as u64;
		let start_block = offset / block_size;
		let end_block = (offset + buf.len() as u64).div_ceil(block_size);
		let mut root = inode.data_root;
		let segs = extent::map_region(
			data_tree,
			&mut root,
			&*self.bitmap,
			&*self.log,
			start_block,
			end_block - start_block,
			MapMode::Write,
		)?;
		inode.data_root = root;
		let mut src = 0usize;
		let mut logical = start_block;
		for seg in segs {
			for i in 0..seg.count as u64 {
				let block_start = logical * block_size;
				let block_end = block_start + block_size;
				let want_start = offset.max(block_start);
				let want_end = (offset + buf.len() as u64).min(block_end);
				let whole_block = want_start == block_start && want_end == block_end;
				let buffer = if whole_block {
					data_tree.map.get(seg.block + i)
				} else {
					data_tree.map.read(seg.block + i)?
				};
				if want_start < want_end {
					let dst_off = (want_start - block_start) as usize;
					let len = (want_end - want_start) as usize;
					buffer.lock().data_mut()[dst_off..dst_off + len].copy_from_slice(&buf[src..src + len]);
					src += len;
				}
				data_tree.map.release_dirty(&buffer);
				logical += 1;
			}
		}
		inode.mtime = now;
		inode.size = inode.size.max(offset + buf.len() as u64);
		Ok(())
	}

	/// Trims `inode`'s data tree to `size` bytes, zero-filling the tail of
	/// the new last block so a later expansion does not expose stale data.
	pub fn truncate(&self, data_tree: &Tree<O>, inode: &mut Inode, size: u64, now: u64) -> Result<()> {
		let block_size = self.block_size as u64;
		if size < inode.size {
			let from_block = size.div_ceil(block_size);
			let mut root = inode.data_root;
			extent::truncate_tree(data_tree, &mut root, &*self.bitmap, &*self.log, from_block)?;
			inode.data_root = root;
			let tail_off = size % block_size;
			if tail_off != 0 {
				let block_idx = size / block_size;
				let segs = extent::map_region(
					data_tree,
					&mut root,
					&*self.bitmap,
					&*self.log,
					block_idx,
					1,
					MapMode::Read,
				)?;
				if let Some(seg) = segs.first() {
					if seg.state != SegState::Hole {
						let buffer = data_tree.map.read(seg.block)?;
						buffer.lock().data_mut()[tail_off as usize..].fill(0);
						data_tree.map.release_dirty(&buffer);
					}
				}
			}
		}
		inode.size = size;
		inode.mtime = now;
		Ok(())
	}

	/// Decrements `nlink`; if it drops to zero, truncates the file to
	/// empty and removes its inode-table entry.
	pub fn unlink(&self, root: &mut BtreeRoot, data_tree: &Tree<O>, inode: &mut Inode, now: u64) -> Result<()> {
		inode.nlink = inode.nlink.saturating_sub(1);
		if inode.nlink == 0 {
			self.truncate(data_tree, inode, 0, now)?;
			self.purge(root, inode.inum)?;
		} else {
			self.mark_dirty(inode.clone());
		}
		Ok(())
	}

	fn purge(&self, root: &mut BtreeRoot, inum: u64) -> Result<()> {
		let cursor = self.itable.probe(root, inum)?;
		let leaf = cursor.leaf().ok_or(Error::NotFound)?;
		let updated = {
			let g = leaf.buffer.lock();
			Ileaf::decode(g.data()).purge(inum)
		};
		leaf.buffer.lock().data_mut().copy_from_slice(&updated.encode(self.block_size));
		self.itable.map.mark_dirty(&leaf.buffer);
		self.itable.release_cursor(cursor);
		self.cache.lock().dirty.remove(&inum);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::bitmap::BitmapStore;
	use crate::btree::BlockAlloc;
	use crate::buffer::Map;
	use parking_lot::Mutex as PMutex;
	use std::collections::HashMap as StdHashMap;
	use std::sync::atomic::{AtomicU64, Ordering};

	const BLOCK_SIZE: usize = 512;

	struct MemOps {
		store: PMutex<StdHashMap<u64, Vec<u8>>>,
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

	struct CountingAlloc {
		next: AtomicU64,
	}

	impl BlockAlloc for CountingAlloc {
		fn alloc(&self) -> Result<u64> {
			Ok(self.next.fetch_add(1, Ordering::SeqCst))
		}
		fn free(&self, _block: u64, _count: u32) -> Result<()> {
			Ok(())
		}
	}

	struct MemBitmapStore {
		bytes: PMutex<Vec<u8>>,
		blocks: u64,
	}

	impl BitmapStore for MemBitmapStore {
		fn block_count(&self) -> u64 {
			self.blocks
		}
		fn read_byte(&self, off: u64) -> Result<u8> {
			Ok(self.bytes.lock()[off as usize])
		}
		fn write_byte(&self, off: u64, v: u8) -> Result<()> {
			self.bytes.lock()[off as usize] = v;
			Ok(())
		}
	}

	struct NullLog;
	impl LogWriter for NullLog {
		fn log_alloc(&self, _block: u64, _count: u32) -> Result<()> {
			Ok(())
		}
		fn log_free(&self, _block: u64, _count: u32) -> Result<()> {
			Ok(())
		}
	}

	fn new_table() -> (InodeTable<MemOps, MemBitmapStore>, Tree<MemOps>, BtreeRoot) {
		let itable_map = Arc::new(Map::new(
			MemOps {
				store: PMutex::new(StdHashMap::new()),
			},
			BLOCK_SIZE,
			64,
		));
		let data_map = Arc::new(Map::new(
			MemOps {
				store: PMutex::new(StdHashMap::new()),
			},
			BLOCK_SIZE,
			64,
		));
		let alloc = Arc::new(CountingAlloc { next: AtomicU64::new(1) });
		let itable = Tree::new(itable_map, alloc.clone(), Arc::new(IleafOps));
		let data_tree = Tree::new(data_map, alloc, Arc::new(crate::dleaf::DleafOps));
		let bitmap = Arc::new(Bitmap::new(
			MemBitmapStore {
				bytes: PMutex::new(vec![0u8; 128]),
				blocks: 1024,
			},
			0,
			1024,
		));
		let table = InodeTable::new(itable, bitmap, Arc::new(NullLog), BLOCK_SIZE);
		let root = BtreeRoot::EMPTY;
		(table, data_tree, root)
	}

	#[test]
	fn create_then_iget_round_trip() {
		let (table, _data_tree, mut root) = new_table();
		let created = table.create(&mut root, 0, 0o644, 1000, 1000, 12345).unwrap();
		let fetched = table.iget(&root, created.inum).unwrap();
		assert_eq!(fetched.mode, 0o644);
		assert_eq!(fetched.uid, 1000);
		assert_eq!(fetched.nlink, 1);
	}

	#[test]
	fn write_then_read_back() {
		let (table, data_tree, mut root) = new_table();
		let mut inode = table.create(&mut root, 0, 0o644, 0, 0, 1).unwrap();
		let payload = b"hello, filesystem!";
		table.write(&data_tree, &mut inode, 0, payload, 2).unwrap();
		assert_eq!(inode.size, payload.len() as u64);
		let mut out = vec![0u8; payload.len()];
		table.read(&data_tree, &inode, 0, &mut out).unwrap();
		assert_eq!(&out, payload);
	}

	#[test]
	fn write_across_block_boundary() {
		let (table, data_tree, mut root) = new_table();
		let mut inode = table.create(&mut root, 0, 0o644, 0, 0, 1).unwrap();
		let payload = vec![0xABu8; BLOCK_SIZE + 100];
		table.write(&data_tree, &mut inode, 10, &payload, 2).unwrap();
		let mut out = vec![0u8; payload.len()];
		table.read(&data_tree, &inode, 10, &mut out).unwrap();
		assert_eq!(out, payload);
	}

	#[test]
	fn truncate_shrinks_and_zero_fills_tail() {
		let (table, data_tree, mut root) = new_table();
		let mut inode = table.create(&mut root, 0, 0o644, 0, 0, 1).unwrap();
		let payload = vec![0xFFu8; BLOCK_SIZE];
		table.write(&data_tree, &mut inode, 0, &payload, 2).unwrap();
		table.truncate(&data_tree, &mut inode, 10, 3).unwrap();
		assert_eq!(inode.size, 10);
		let mut out = vec![0u8; BLOCK_SIZE];
		table.read(&data_tree, &inode, 0, &mut out).unwrap();
		assert!(out[10..].iter().all(|&b| b == 0));
	}

	#[test]
	fn unlink_to_zero_removes_inode() {
		let (table, data_tree, mut root) = new_table();
		let mut inode = table.create(&mut root, 0, 0o644, 0, 0, 1).unwrap();
		let inum = inode.inum;
		table.unlink(&mut root, &data_tree, &mut inode, 5).unwrap();
		assert!(table.iget(&root, inum).is_err());
	}

	#[test]
	fn create_allocates_distinct_inums() {
		let (table, _data_tree, mut root) = new_table();
		let a = table.create(&mut root, 0, 0o644, 0, 0, 1).unwrap();
		let b = table.create(&mut root, 0, 0o644, 0, 0, 1).unwrap();
		assert_ne!(a.inum, b.inum);
	}
}
