//! Redo (write-ahead) log (spec §4.8): a chain of log blocks recording
//! small typed metadata-change records, replayed in full at mount.

use crate::buffer::BufferOps;
use crate::codec::{be16, be32, be48, be64, put_be16, put_be32, put_be48, put_be64};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;

/// Magic stamped at the start of every log block.
pub const LOG_MAGIC: u16 = 0x10ad;

const TAG_ALLOC: u8 = 1;
const TAG_FREE: u8 = 2;
const TAG_UPDATE: u8 = 3;
const TAG_DROOT: u8 = 4;
const TAG_IROOT: u8 = 5;
const TAG_REDIRECT: u8 = 6;

/// One decoded log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
	/// `block..block+count` transitioned free → allocated.
	Alloc { block: u64, count: u8 },
	/// `block..block+count` transitioned allocated → free.
	Free { block: u64, count: u8 },
	/// An interior-node entry at `parent` now points `key -> child`.
	Update { child: u64, parent: u64, key: u64 },
	/// The data B-tree root changed (reserved, carried for forward
	/// compatibility with the original format).
	Droot { inum: u64, depth: u16, block: u64 },
	/// The inode-table root changed.
	Iroot { depth: u16, block: u64 },
	/// A cursor buffer was redirected (copy-on-write) from `old` to `new`.
	Redirect { old: u64, new: u64 },
}

impl LogRecord {
	fn tag(&self) -> u8 {
		match self {
			LogRecord::Alloc { .. } => TAG_ALLOC,
			LogRecord::Free { .. } => TAG_FREE,
			LogRecord::Update { .. } => TAG_UPDATE,
			LogRecord::Droot { .. } => TAG_DROOT,
			LogRecord::Iroot { .. } => TAG_IROOT,
			LogRecord::Redirect { .. } => TAG_REDIRECT,
		}
	}

	fn encoded_len(&self) -> usize {
		match self {
			LogRecord::Alloc { .. } | LogRecord::Free { .. } => 1 + 6,
			LogRecord::Update { .. } => 6 + 6 + 6,
			LogRecord::Droot { .. } => 6 + 2 + 6,
			LogRecord::Iroot { .. } => 2 + 6,
			LogRecord::Redirect { .. } => 6 + 6,
		}
	}

	fn encode(&self, buf: &mut Vec<u8>) {
		buf.push(self.tag());
		let start = buf.len();
		buf.resize(start + self.encoded_len(), 0);
		let s = &mut buf[start..];
		match self {
			LogRecord::Alloc { block, count } | LogRecord::Free { block, count } => {
				s[0] = *count;
				put_be48(s, 1, *block);
			}
			LogRecord::Update { child, parent, key } => {
				put_be48(s, 0, *child);
				put_be48(s, 6, *parent);
				put_be48(s, 12, *key);
			}
			LogRecord::Droot { inum, depth, block } => {
				put_be48(s, 0, *inum);
				put_be16(s, 6, *depth);
				put_be48(s, 8, *block);
			}
			LogRecord::Iroot { depth, block } => {
				put_be16(s, 0, *depth);
				put_be48(s, 2, *block);
			}
			LogRecord::Redirect { old, new } => {
				put_be48(s, 0, *old);
				put_be48(s, 6, *new);
			}
		}
	}

	fn decode(tag: u8, data: &[u8], off: &mut usize) -> Result<Self> {
		let s = &data[*off..];
		let record = match tag {
			TAG_ALLOC | TAG_FREE => {
				let count = s[0];
				let block = be48(s, 1);
				*off += 1 + 6;
				if tag == TAG_ALLOC {
					LogRecord::Alloc { block, count }
				} else {
					LogRecord::Free { block, count }
				}
			}
			TAG_UPDATE => {
				let child = be48(s, 0);
				let parent = be48(s, 6);
				let key = be48(s, 12);
				*off += 18;
				LogRecord::Update { child, parent, key }
			}
			TAG_DROOT => {
				let inum = be48(s, 0);
				let depth = be16(s, 6);
				let block = be48(s, 8);
				*off += 14;
				LogRecord::Droot { inum, depth, block }
			}
			TAG_IROOT => {
				let depth = be16(s, 0);
				let block = be48(s, 2);
				*off += 8;
				LogRecord::Iroot { depth, block }
			}
			TAG_REDIRECT => {
				let old = be48(s, 0);
				let new = be48(s, 6);
				*off += 12;
				LogRecord::Redirect { old, new }
			}
			_ => return Err(Error::Corrupt("unrecognized log record tag")),
		};
		Ok(record)
	}
}

/// Callback surface the bitmap allocator (and, eventually, the B-tree
/// redirect path) appends records through, without depending on the log
/// block layout directly.
pub trait LogWriter: Send + Sync {
	fn log_alloc(&self, block: u64, count: u32) -> Result<()>;
	fn log_free(&self, block: u64, count: u32) -> Result<()>;
}

struct Inner {
	/// Records accumulated for the current, not-yet-flushed log block.
	pending: Vec<LogRecord>,
	/// Block the head log block will chain to once written.
	logchain: u64,
	logcount: u32,
}

/// The append-only redo log for one volume.
///
/// Records are buffered in memory and packed into log blocks as they
/// fill; [`Log::commit`] writes the current block and links a fresh one
/// in, matching the "append to a memory-buffered block, flush when full"
/// behavior of spec §4.8.
pub struct Log<O: BufferOps> {
	map: Arc<crate::buffer::Map<O>>,
	block_size: usize,
	inner: Mutex<Inner>,
}

impl<O: BufferOps> Log<O> {
	/// Builds a log writer resuming after a chain of `logcount` blocks
	/// headed at `logchain` (both as read from the superblock).
	pub fn new(map: Arc<crate::buffer::Map<O>>, logchain: u64, logcount: u32) -> Self {
		let block_size = map.block_size();
		Self {
			map,
			block_size,
			inner: Mutex::new(Inner {
				pending: Vec::new(),
				logchain,
				logcount,
			}),
		}
	}

	/// Appends a record to the in-memory pending block.
	pub fn append(&self, record: LogRecord) {
		self.inner.lock().pending.push(record);
	}

	fn header_len() -> usize {
		2 + 2 + 8 // magic, bytes, logchain
	}

    /// Estimated size, in bytes, of the pending block if flushed now.
    fn pending_encoded_len(pending: &[LogRecord]) -> usize {
        Self::header_len() + pending.iter().map(|r| 1 + r.encoded_len()).sum::<usize>()
    }

	/// Packs the pending records into a log block, writes it, and links it
	/// onto the chain. Returns `(new_logchain, new_logcount)` for the
	/// caller to persist into the superblock as part of the same delta.
	pub fn commit(&self, alloc_block: impl FnOnce() -> Result<u64>) -> Result<(u64, u32)> {
		let mut inner = self.inner.lock();
		if inner.pending.is_empty() {
			return Ok((inner.logchain, inner.logcount));
		}
		let needed = Self::pending_encoded_len(&inner.pending);
		if needed > self.block_size {
			return Err(Error::Corrupt("log block too small for pending records"));
		}
		let block = alloc_block()?;
		let mut data = vec![0u8; self.block_size];
		let mut payload = Vec::new();
		for record in inner.pending.drain(..) {
			record.encode(&mut payload);
		}
		crate::codec::put_be16(&mut data, 0, LOG_MAGIC);
		put_be16(&mut data, 2, payload.len() as u16);
		put_be64(&mut data, 4, inner.logchain);
		data[Self::header_len()..Self::header_len() + payload.len()].copy_from_slice(&payload);
		let buf = self.map.get(block);
		buf.lock().data_mut().copy_from_slice(&data);
		self.map.release_dirty(&buf);
		self.map.flush()?;
		inner.logchain = block;
		inner.logcount += 1;
		Ok((inner.logchain, inner.logcount))
	}
}

impl<O: BufferOps> LogWriter for Log<O> {
	fn log_alloc(&self, block: u64, count: u32) -> Result<()> {
		self.append(LogRecord::Alloc {
			block,
			count: count as u8,
		});
		Ok(())
	}

	fn log_free(&self, block: u64, count: u32) -> Result<()> {
		self.append(LogRecord::Free {
			block,
			count: count as u8,
		});
		Ok(())
	}
}

/// Reads one log block's records, verifying its magic.
fn decode_block(data: &[u8]) -> Result<(Vec<LogRecord>, u64)> {
	if be16(data, 0) != LOG_MAGIC {
		return Err(Error::Corrupt("bad log block magic"));
	}
	let bytes = be16(data, 2) as usize;
	let logchain = be64(data, 4);
	let payload = &data[8..8 + bytes];
	let mut records = Vec::new();
	let mut off = 0usize;
	while off < payload.len() {
		let tag = payload[off];
		off += 1;
		records.push(LogRecord::decode(tag, payload, &mut off)?);
	}
	Ok((records, logchain))
}

/// Walks `logcount` blocks backward from `logchain`, verifying each
/// block's magic, then returns every record in original (oldest-first)
/// order, ready for replay.
pub fn read_chain_for_replay(
	read_block: impl Fn(u64) -> Result<Vec<u8>>,
	logchain: u64,
	logcount: u32,
) -> Result<Vec<LogRecord>> {
	let mut blocks = Vec::with_capacity(logcount as usize);
	let mut cur = logchain;
	for _ in 0..logcount {
		if cur == 0 {
			return Err(Error::Corrupt("log chain shorter than logcount"));
		}
		let data = read_block(cur)?;
		let (records, prev) = decode_block(&data)?;
		blocks.push(records);
		cur = prev;
	}
	blocks.reverse();
	Ok(blocks.into_iter().flatten().collect())
}
