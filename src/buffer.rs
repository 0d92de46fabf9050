//! Buffer cache: an address-space-scoped block cache with a hash table,
//! dirty list, tail-LRU, and pluggable I/O callbacks (spec §4.1).

use crate::error::Result;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// State of a single cached block (spec §3, "Buffer").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
	/// No valid data; freshly allocated and not yet populated.
	Empty,
	/// Matches what is on disk.
	Clean,
	/// Modified in memory, not yet written back.
	Dirty,
	/// Dirty, but already covered by a durable log record (reserved for the
	/// redirect/log-commit path; treated like `Dirty` for flush purposes).
	Journaled,
}

/// A single cached block. Exactly one of [`State`] applies at any time;
/// `count > 0` pins the buffer against eviction.
pub struct Buffer {
	index: u64,
	state: State,
	data: Vec<u8>,
	count: usize,
}

impl Buffer {
	fn new_empty(index: u64, block_size: usize) -> Self {
		Self {
			index,
			state: State::Empty,
			data: vec![0u8; block_size],
			count: 0,
		}
	}

	/// The block index this buffer caches.
	pub fn index(&self) -> u64 {
		self.index
	}

	/// Current cache state.
	pub fn state(&self) -> State {
		self.state
	}

	/// Read-only view of the cached bytes.
	pub fn data(&self) -> &[u8] {
		&self.data
	}

	/// Mutable view of the cached bytes. Does not itself mark the buffer
	/// dirty; pair with [`Map::release_dirty`] when the caller is done.
	pub fn data_mut(&mut self) -> &mut [u8] {
		&mut self.data
	}
}

/// Map-supplied I/O callbacks: for the raw volume map these hit the device
/// directly, for a file's data map they resolve through the extent mapper
/// first (spec §4.1).
pub trait BufferOps: Send + Sync {
	/// Populates `buf` with the contents of block `index`.
	fn bread(&self, index: u64, buf: &mut [u8]) -> Result<()>;
	/// Writes `buf` back to block `index`.
	fn bwrite(&self, index: u64, buf: &[u8]) -> Result<()>;
}

struct Inner {
	buffers: HashMap<u64, Arc<Mutex<Buffer>>>,
	dirty: VecDeque<u64>,
	lru: VecDeque<u64>,
}

/// An address space: one buffer cache instance per raw volume or per file.
pub struct Map<O: BufferOps> {
	ops: O,
	block_size: usize,
	pool_size: usize,
	inner: Mutex<Inner>,
}

impl<O: BufferOps> Map<O> {
	/// Creates an empty map with the given block size and target clean-LRU
	/// pool size (blocks beyond this are evicted opportunistically).
	pub fn new(ops: O, block_size: usize, pool_size: usize) -> Self {
		Self {
			ops,
			block_size,
			pool_size,
			inner: Mutex::new(Inner {
				buffers: HashMap::new(),
				dirty: VecDeque::new(),
				lru: VecDeque::new(),
			}),
		}
	}

	/// Block size of buffers in this map.
	pub fn block_size(&self) -> usize {
		self.block_size
	}

	/// Returns the buffer for `index` if already cached, without allocating
	/// or incrementing its reference count.
	pub fn peek(&self, index: u64) -> Option<Arc<Mutex<Buffer>>> {
		self.inner.lock().buffers.get(&index).cloned()
	}

	/// Returns the buffer for `index`, creating an `EMPTY` one if absent.
	/// Increments the buffer's reference count.
	pub fn get(&self, index: u64) -> Arc<Mutex<Buffer>> {
		let mut inner = self.inner.lock();
		let buf = inner
			.buffers
			.entry(index)
			.or_insert_with(|| Arc::new(Mutex::new(Buffer::new_empty(index, self.block_size))))
			.clone();
		buf.lock().count += 1;
		inner.lru.retain(|&i| i != index);
		buf
	}

	/// Like [`Map::get`], but if the buffer is `EMPTY` populates it via
	/// `ops.bread` and transitions it to `CLEAN`.
	pub fn read(&self, index: u64) -> Result<Arc<Mutex<Buffer>>> {
		let buf = self.get(index);
		let needs_read = buf.lock().state == State::Empty;
		if needs_read {
			let mut guard = buf.lock();
			self.ops.bread(index, &mut guard.data)?;
			guard.state = State::Clean;
		}
		Ok(buf)
	}

	/// Drops one reference. The buffer becomes eligible for eviction once
	/// `count` reaches zero.
	pub fn release(&self, buf: &Arc<Mutex<Buffer>>) {
		let (index, count, state) = {
			let mut guard = buf.lock();
			guard.count = guard.count.saturating_sub(1);
			(guard.index, guard.count, guard.state)
		};
		if count == 0 && state != State::Dirty && state != State::Journaled {
			let mut inner = self.inner.lock();
			inner.lru.retain(|&i| i != index);
			inner.lru.push_back(index);
		}
	}

	/// Drops one reference after transitioning the buffer to `DIRTY`
	/// (appending it to the dirty list the first time).
	pub fn release_dirty(&self, buf: &Arc<Mutex<Buffer>>) {
		let (index, was_dirty) = {
			let mut guard = buf.lock();
			let was_dirty = matches!(guard.state, State::Dirty | State::Journaled);
			guard.state = State::Dirty;
			(guard.index, was_dirty)
		};
		if !was_dirty {
			self.inner.lock().dirty.push_back(index);
		}
		self.release(buf);
	}

	/// Transitions a buffer to `DIRTY` without changing its reference count.
	///
	/// Used by the B+-tree engine, which holds buffers pinned via a cursor
	/// and needs to mark them dirty in place rather than through the
	/// get/release pairing `release_dirty` assumes.
	pub fn mark_dirty(&self, buf: &Arc<Mutex<Buffer>>) {
		let (index, was_dirty) = {
			let mut guard = buf.lock();
			let was_dirty = matches!(guard.state, State::Dirty | State::Journaled);
			guard.state = State::Dirty;
			(guard.index, was_dirty)
		};
		if !was_dirty {
			self.inner.lock().dirty.push_back(index);
		}
	}

	/// Writes every dirty buffer back via `ops.bwrite`, transitioning each
	/// to `CLEAN` on success. New dirties created during the flush (from
	/// another thread) are left for the next call.
	pub fn flush(&self) -> Result<()> {
		let pending: Vec<u64> = {
			let mut inner = self.inner.lock();
			inner.dirty.drain(..).collect()
		};
		for index in pending {
			let Some(buf) = self.peek(index) else {
				continue;
			};
			let mut guard = buf.lock();
			if guard.state == State::Dirty || guard.state == State::Journaled {
				self.ops.bwrite(index, &guard.data)?;
				guard.state = State::Clean;
			}
		}
		Ok(())
	}

	/// Releases clean buffers from the LRU tail until the pool is back at
	/// (or under) its configured size. `EMPTY` buffers with no holders are
	/// dropped unconditionally, since they carry no useful content.
	pub fn evict(&self) {
		let mut inner = self.inner.lock();
		while inner.buffers.len() > self.pool_size {
			let Some(index) = inner.lru.pop_front() else {
				break;
			};
			if let Some(buf) = inner.buffers.get(&index) {
				let guard = buf.lock();
				if guard.count > 0 || guard.state == State::Dirty || guard.state == State::Journaled {
					continue;
				}
			}
			inner.buffers.remove(&index);
		}
	}

	/// Number of buffers currently cached, for tests and diagnostics.
	pub fn len(&self) -> usize {
		self.inner.lock().buffers.len()
	}

	/// `true` if no buffers are cached.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	struct CountingOps {
		reads: AtomicUsize,
		writes: AtomicUsize,
		backing: Mutex<HashMap<u64, Vec<u8>>>,
		block_size: usize,
	}

	impl BufferOps for CountingOps {
		fn bread(&self, index: u64, buf: &mut [u8]) -> Result<()> {
			self.reads.fetch_add(1, Ordering::SeqCst);
			if let Some(data) = self.backing.lock().get(&index) {
				buf.copy_from_slice(data);
			}
			Ok(())
		}

		fn bwrite(&self, index: u64, buf: &[u8]) -> Result<()> {
			self.writes.fetch_add(1, Ordering::SeqCst);
			self.backing.lock().insert(index, buf.to_vec());
			Ok(())
		}
	}

	fn ops(block_size: usize) -> CountingOps {
		CountingOps {
			reads: AtomicUsize::new(0),
			writes: AtomicUsize::new(0),
			backing: Mutex::new(HashMap::new()),
			block_size,
		}
	}

	#[test]
	fn read_populates_once() {
		let map = Map::new(ops(64), 64, 16);
		let b1 = map.read(0).unwrap();
		map.release(&b1);
		let b2 = map.read(0).unwrap();
		map.release(&b2);
		assert_eq!(map.ops.reads.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn dirty_then_flush_writes_back() {
		let map = Map::new(ops(64), 64, 16);
		let buf = map.get(0);
		buf.lock().data_mut()[0] = 0x42;
		map.release_dirty(&buf);
		assert_eq!(map.ops.writes.load(Ordering::SeqCst), 0);
		map.flush().unwrap();
		assert_eq!(map.ops.writes.load(Ordering::SeqCst), 1);
		assert_eq!(map.peek(0).unwrap().lock().state(), State::Clean);
	}

	#[test]
	fn pinned_buffer_is_not_evicted() {
		let map = Map::new(ops(64), 64, 1);
		let held = map.get(0);
		for i in 1..5 {
			let b = map.get(i);
			map.release(&b);
		}
		map.evict();
		assert!(map.peek(0).is_some());
		map.release(&held);
	}

	#[test]
	fn evict_respects_pool_size() {
		let map = Map::new(ops(64), 64, 2);
		for i in 0..5 {
			let b = map.get(i);
			map.release(&b);
		}
		map.evict();
		assert!(map.len() <= 2);
	}
}
