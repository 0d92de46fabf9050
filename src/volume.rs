//! Block devices and the superblock.

use crate::codec::{be16, be32, be64, put_be16, put_be32, put_be64};
use crate::error::{Error, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Mutex;

/// Seek-and-read/seek-and-write of `block_size` units at `index * block_size`.
///
/// This is the engine's only contract with physical storage; everything
/// above this trait (buffer cache, B+-tree, bitmap) is written against it
/// and never touches a file descriptor or device node directly.
pub trait BlockDevice: Send + Sync {
	/// Returns the size, in bytes, of one block.
	fn block_size(&self) -> usize;
	/// Returns the total number of blocks in the device.
	fn block_count(&self) -> u64;
	/// Reads block `index` into `buf`, which must be exactly `block_size()` bytes.
	fn read_block(&self, index: u64, buf: &mut [u8]) -> Result<()>;
	/// Writes `buf` (exactly `block_size()` bytes) to block `index`.
	fn write_block(&self, index: u64, buf: &[u8]) -> Result<()>;
}

/// An in-memory block device, used by tests and by callers that want to
/// stage a volume before committing it to disk.
pub struct MemDevice {
	block_size: usize,
	data: Mutex<Vec<u8>>,
}

impl MemDevice {
	/// Creates a zero-filled device of `block_count` blocks of `block_size` bytes.
	pub fn new(block_size: usize, block_count: u64) -> Self {
		Self {
			block_size,
			data: Mutex::new(vec![0u8; block_size * block_count as usize]),
		}
	}
}

impl BlockDevice for MemDevice {
	fn block_size(&self) -> usize {
		self.block_size
	}

	fn block_count(&self) -> u64 {
		(self.data.lock().unwrap().len() / self.block_size) as u64
	}

	fn read_block(&self, index: u64, buf: &mut [u8]) -> Result<()> {
		let data = self.data.lock().unwrap();
		let off = index as usize * self.block_size;
		buf.copy_from_slice(&data[off..off + self.block_size]);
		Ok(())
	}

	fn write_block(&self, index: u64, buf: &[u8]) -> Result<()> {
		let mut data = self.data.lock().unwrap();
		let off = index as usize * self.block_size;
		data[off..off + self.block_size].copy_from_slice(buf);
		Ok(())
	}
}

/// A block device backed by a regular host file, for real deployments and
/// integration tests that want on-disk persistence across mounts.
pub struct FileDevice {
	block_size: usize,
	block_count: u64,
	file: Mutex<File>,
}

impl FileDevice {
	/// Opens `file` as a volume of `block_count` blocks of `block_size` bytes.
	///
	/// The file is extended with zeroes if it is shorter than the volume.
	pub fn open(mut file: File, block_size: usize, block_count: u64) -> Result<Self> {
		let len = block_size as u64 * block_count;
		if file.metadata()?.len() < len {
			file.set_len(len)?;
		}
		Ok(Self {
			block_size,
			block_count,
			file: Mutex::new(file),
		})
	}
}

impl BlockDevice for FileDevice {
	fn block_size(&self) -> usize {
		self.block_size
	}

	fn block_count(&self) -> u64 {
		self.block_count
	}

	fn read_block(&self, index: u64, buf: &mut [u8]) -> Result<()> {
		let mut file = self.file.lock().unwrap();
		file.seek(SeekFrom::Start(index * self.block_size as u64))?;
		file.read_exact(buf)?;
		Ok(())
	}

	fn write_block(&self, index: u64, buf: &[u8]) -> Result<()> {
		let mut file = self.file.lock().unwrap();
		file.seek(SeekFrom::Start(index * self.block_size as u64))?;
		file.write_all(buf)?;
		Ok(())
	}
}

/// Magic stamped at the start of the superblock.
pub const SB_MAGIC: &[u8; 8] = b"FSENGINE";
/// Byte offset of the superblock within block 0.
pub const SB_LOC: usize = 0;
/// Fixed on-disk size of the superblock record.
pub const SB_SIZE: usize = 8 + 2 + 8 + 8 + 8 + 4 + 4 + 8 + 8 + 4;

/// The packed `(depth, block)` root pointer of a B+-tree, as stored in the
/// superblock's `iroot` field and (conceptually) in each inode's
/// `DATA_BTREE` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BtreeRoot {
	/// Number of interior levels above the leaf level. `0` means "no root yet".
	pub depth: u16,
	/// Block holding the root node (meaningless when `depth == 0`).
	pub block: u64,
}

impl BtreeRoot {
	/// The canonical empty root: no tree has been created yet.
	pub const EMPTY: Self = Self { depth: 0, block: 0 };

	/// Packs `(depth, block)` into the on-disk `u64` representation.
	pub fn pack(&self) -> u64 {
		((self.depth as u64) << 48) | (self.block & 0x0000_ffff_ffff_ffff)
	}

	/// Unpacks a `(depth, block)` pair from its on-disk `u64` representation.
	pub fn unpack(v: u64) -> Self {
		Self {
			depth: (v >> 48) as u16,
			block: v & 0x0000_ffff_ffff_ffff,
		}
	}

	/// Returns `true` if no tree has been created yet.
	///
	/// `block == 0` is the sentinel for "no root": block `0` always holds
	/// the superblock and is never handed out by the allocator, so it is
	/// safe to reuse as "absent". `depth` alone cannot serve this role since
	/// a tree consisting of a single leaf (no interior levels) legitimately
	/// has `depth == 0`.
	pub fn is_empty(&self) -> bool {
		self.block == 0
	}
}

/// Tunables the embedder chooses at format/mount time: this crate has no
/// config-file format of its own (that belongs to a user-facing daemon
/// layered on top), so a plain struct of defaults is the single place
/// these values live, matching the teacher's pattern of passing a small
/// struct of tunables to subsystem constructors rather than threading
/// each parameter through every call.
#[derive(Debug, Clone, Copy)]
pub struct VolumeParams {
	/// `log2` of the block size used when formatting a new volume.
	pub blockbits: u16,
	/// Total number of blocks in the volume being formatted.
	pub volblocks: u64,
	/// Number of buffers the raw block-device cache keeps resident.
	pub buffer_pool_size: usize,
	/// Initial rotating allocation goal handed to the bitmap allocator.
	pub alloc_goal: u64,
}

impl VolumeParams {
	/// Defaults sized for the small in-memory/test volumes this crate
	/// targets directly: a 512-buffer pool and an allocation goal of 0.
	pub fn new(blockbits: u16, volblocks: u64) -> Self {
		Self {
			blockbits,
			volblocks,
			buffer_pool_size: 512,
			alloc_goal: 0,
		}
	}
}

/// Whether the engine is replaying the log (mutators must not themselves
/// append log records while this holds) or running normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
	/// Ordinary operation: mutators append log records as usual.
	Normal,
	/// Log replay at mount: mutators must bypass the log entirely.
	Replaying,
}

/// The persistent superblock (spec §3, §6), plus the in-memory replay mode
/// flag (spec §9, "log re-entrance").
#[derive(Debug, Clone)]
pub struct Superblock {
	/// `log2` of the block size.
	pub blockbits: u16,
	/// Total number of blocks on the volume.
	pub volblocks: u64,
	/// Number of blocks currently unallocated.
	pub freeblocks: u64,
	/// Rotating allocation goal for the bitmap allocator.
	pub nextalloc: u64,
	/// Next atom id to hand out (extended-attribute atom table, external
	/// collaborator; the engine only preserves the counter).
	pub atomgen: u32,
	/// Head of the atom free list (same caveat as `atomgen`).
	pub freeatom: u32,
	/// Root of the inode-table B+-tree.
	pub iroot: BtreeRoot,
	/// Block of the most recent (head) log block, or `0` if none.
	pub logchain: u64,
	/// Number of log blocks reachable by following `logchain`.
	pub logcount: u32,
	/// In-memory only: not persisted.
	pub mode: Mode,
}

impl Superblock {
	/// The block size in bytes.
	pub fn block_size(&self) -> usize {
		1usize << self.blockbits
	}

	/// Builds a fresh, empty superblock for a volume of the given geometry.
	pub fn new(blockbits: u16, volblocks: u64) -> Self {
		Self {
			blockbits,
			volblocks,
			freeblocks: volblocks,
			nextalloc: 0,
			atomgen: 0,
			freeatom: !0,
			iroot: BtreeRoot::EMPTY,
			logchain: 0,
			logcount: 0,
			mode: Mode::Normal,
		}
	}

	/// Decodes a superblock from the first `SB_SIZE` bytes of `buf`.
	pub fn decode(buf: &[u8]) -> Result<Self> {
		if buf.len() < SB_SIZE || &buf[0..8] != SB_MAGIC {
			return Err(Error::Corrupt("bad superblock magic"));
		}
		let mut off = 8;
		let blockbits = be16(buf, off);
		off += 2;
		let volblocks = be64(buf, off);
		off += 8;
		let freeblocks = be64(buf, off);
		off += 8;
		let nextalloc = be64(buf, off);
		off += 8;
		let atomgen = be32(buf, off);
		off += 4;
		let freeatom = be32(buf, off);
		off += 4;
		let iroot = BtreeRoot::unpack(be64(buf, off));
		off += 8;
		let logchain = be64(buf, off);
		off += 8;
		let logcount = be32(buf, off);
		Ok(Self {
			blockbits,
			volblocks,
			freeblocks,
			nextalloc,
			atomgen,
			freeatom,
			iroot,
			logchain,
			logcount,
			mode: Mode::Normal,
		})
	}

	/// Encodes the superblock into the first `SB_SIZE` bytes of `buf`.
	pub fn encode(&self, buf: &mut [u8]) {
		buf[0..8].copy_from_slice(SB_MAGIC);
		let mut off = 8;
		put_be16(buf, off, self.blockbits);
		off += 2;
		put_be64(buf, off, self.volblocks);
		off += 8;
		put_be64(buf, off, self.freeblocks);
		off += 8;
		put_be64(buf, off, self.nextalloc);
		off += 8;
		put_be32(buf, off, self.atomgen);
		off += 4;
		put_be32(buf, off, self.freeatom);
		off += 4;
		put_be64(buf, off, self.iroot.pack());
		off += 8;
		put_be64(buf, off, self.logchain);
		off += 8;
		put_be32(buf, off, self.logcount);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn btree_root_pack_round_trip() {
		let root = BtreeRoot {
			depth: 3,
			block: 0x0000_dead_beef,
		};
		assert_eq!(BtreeRoot::unpack(root.pack()), root);
	}

	#[test]
	fn superblock_round_trip() {
		let mut sb = Superblock::new(12, 65536);
		sb.freeblocks = 100;
		sb.nextalloc = 42;
		sb.iroot = BtreeRoot { depth: 1, block: 7 };
		sb.logchain = 99;
		sb.logcount = 3;
		let mut buf = vec![0u8; SB_SIZE];
		sb.encode(&mut buf);
		let decoded = Superblock::decode(&buf).unwrap();
		assert_eq!(decoded.blockbits, sb.blockbits);
		assert_eq!(decoded.volblocks, sb.volblocks);
		assert_eq!(decoded.freeblocks, sb.freeblocks);
		assert_eq!(decoded.nextalloc, sb.nextalloc);
		assert_eq!(decoded.iroot, sb.iroot);
		assert_eq!(decoded.logchain, sb.logchain);
		assert_eq!(decoded.logcount, sb.logcount);
	}

	#[test]
	fn mem_device_read_write() {
		let dev = MemDevice::new(512, 16);
		let mut buf = vec![0xAAu8; 512];
		dev.write_block(3, &buf).unwrap();
		buf.fill(0);
		dev.read_block(3, &mut buf).unwrap();
		assert!(buf.iter().all(|&b| b == 0xAA));
	}
}
