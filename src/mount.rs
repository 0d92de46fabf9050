//! Top-level volume lifecycle: mount (superblock load + log replay),
//! commit (log flush + superblock write), and the wiring that hands the
//! inode facade a real bitmap, log, and pair of B-trees.

use crate::bitmap::{Bitmap, BitmapStore};
use crate::buffer::{BufferOps, Map};
use crate::dleaf::DleafOps;
use crate::error::{Error, Result};
use crate::ileaf::IleafOps;
use crate::inode::InodeTable;
use crate::redo::{read_chain_for_replay, Log, LogRecord};
use crate::btree::Tree;
use crate::volume::{BlockDevice, Mode, Superblock, VolumeParams};
use log::{info, warn};
use parking_lot::Mutex;
use std::sync::Arc;

/// `ops.bread`/`bwrite` for the raw volume map: straight through to the
/// block device, with no extent-mapper indirection (spec §4.1).
struct DeviceOps<D: BlockDevice> {
	device: D,
}

impl<D: BlockDevice> BufferOps for DeviceOps<D> {
	fn bread(&self, index: u64, buf: &mut [u8]) -> Result<()> {
		self.device.read_block(index, buf)
	}
	fn bwrite(&self, index: u64, buf: &[u8]) -> Result<()> {
		self.device.write_block(index, buf)
	}
}

/// Presents the bitmap inode's backing blocks as a flat byte array,
/// routed through the raw volume's own buffer map (the bitmap inode's
/// "data" lives directly in volume blocks starting at `bitmap_start`
/// rather than through its own extent-mapped data tree, matching the
/// original's treatment of the bitmap as a reserved, contiguously
/// allocated region).
struct VolumeBitmapStore<D: BlockDevice> {
	map: Arc<Map<DeviceOps<D>>>,
	bitmap_start: u64,
	block_count: u64,
}

impl<D: BlockDevice> BitmapStore for VolumeBitmapStore<D> {
	fn block_count(&self) -> u64 {
		self.block_count
	}

	fn read_byte(&self, byte_offset: u64) -> Result<u8> {
		let block_size = self.map.block_size() as u64;
		let block = self.bitmap_start + byte_offset / block_size;
		let buf = self.map.read(block)?;
		let byte = buf.lock().data()[(byte_offset % block_size) as usize];
		self.map.release(&buf);
		Ok(byte)
	}

	fn write_byte(&self, byte_offset: u64, value: u8) -> Result<()> {
		let block_size = self.map.block_size() as u64;
		let block = self.bitmap_start + byte_offset / block_size;
		let buf = self.map.get(block);
		buf.lock().data_mut()[(byte_offset % block_size) as usize] = value;
		self.map.release_dirty(&buf);
		Ok(())
	}
}

/// A mounted volume: superblock, buffer maps, allocator, log, and inode
/// facade all wired together.
pub struct Volume<D: BlockDevice> {
	pub superblock: Mutex<Superblock>,
	raw_map: Arc<Map<DeviceOps<D>>>,
	bitmap: Arc<Bitmap<VolumeBitmapStore<D>>>,
	log: Arc<Log<DeviceOps<D>>>,
	inodes: InodeTable<DeviceOps<D>, VolumeBitmapStore<D>>,
	log_region_start: u64,
	log_region_len: u64,
	log_cursor: Mutex<u64>,
}

/// Reserved block immediately after the superblock where the bitmap's
/// contiguous region begins. A production layout would size this from
/// `volblocks`; this engine reserves a fixed run sized for the bitmap of
/// a volume up to 2^32 blocks at any block size, which is ample for the
/// test and demo volumes this crate targets.
const BITMAP_START_BLOCK: u64 = 1;

/// Number of blocks reserved at the tail of the volume for log blocks.
/// The bitmap marks this run permanently allocated at format time so the
/// ordinary allocator never hands these blocks to a file or the itable;
/// the log cycles through them round-robin rather than drawing from the
/// general free pool, avoiding the reentrance a log commit allocating via
/// `balloc` (which itself logs) would otherwise require.
const LOG_RESERVED_BLOCKS: u64 = 8;

/// Buffer-pool size used by [`Volume::mount`], which has no [`VolumeParams`]
/// of its own to draw from since a remount's geometry comes from the
/// on-disk superblock, not the caller.
const DEFAULT_BUFFER_POOL_SIZE: usize = 256;

/// Derives `(log_region_start, log_region_len)` from `volblocks`; pure so
/// `mount` can recompute what `format` chose without persisting it.
fn log_region(volblocks: u64) -> (u64, u64) {
	let len = LOG_RESERVED_BLOCKS.min(volblocks / 4).max(1);
	(volblocks - len, len)
}

impl<D: BlockDevice> Volume<D> {
	/// Formats a brand-new volume using default [`VolumeParams`] derived
	/// from the device's own geometry.
	pub fn format(device: D) -> Result<Self> {
		let blockbits = device.block_size().trailing_zeros() as u16;
		let volblocks = device.block_count();
		Self::format_with_params(device, VolumeParams::new(blockbits, volblocks))
	}

	/// Formats a brand-new volume: writes an empty superblock, an all-free
	/// bitmap, and marks the tail log-block reservation allocated, using
	/// the embedder-supplied `params` for buffer-pool size and initial
	/// allocation goal.
	pub fn format_with_params(device: D, params: VolumeParams) -> Result<Self> {
		let block_size = device.block_size();
		let blockbits = params.blockbits;
		let volblocks = params.volblocks;
		let (log_region_start, log_region_len) = log_region(volblocks);
		let mut sb = Superblock::new(blockbits, volblocks);
		sb.freeblocks = volblocks - log_region_len;
		sb.nextalloc = params.alloc_goal;
		let raw_map = Arc::new(Map::new(DeviceOps { device }, block_size, params.buffer_pool_size));
		let sb_buf = raw_map.get(0);
		{
			let mut guard = sb_buf.lock();
			guard.data_mut().fill(0);
			sb.encode(guard.data_mut());
		}
		raw_map.release_dirty(&sb_buf);
		let bitmap_blocks = (volblocks as usize).div_ceil(8).div_ceil(block_size) as u64;
		for b in 0..bitmap_blocks.max(1) {
			let buf = raw_map.get(BITMAP_START_BLOCK + b);
			buf.lock().data_mut().fill(0);
			raw_map.release_dirty(&buf);
		}
		raw_map.flush()?;
		let store = VolumeBitmapStore {
			map: raw_map.clone(),
			bitmap_start: BITMAP_START_BLOCK,
			block_count: volblocks,
		};
		for block in log_region_start..volblocks {
			let byte_off = block / 8;
			let mut byte = store.read_byte(byte_off)?;
			byte |= 1 << (block % 8);
			store.write_byte(byte_off, byte)?;
		}
		raw_map.flush()?;
		info!("formatted volume: {} blocks of {} bytes", volblocks, block_size);
		Self::open_with_superblock(raw_map, sb, log_region_start, log_region_len)
	}

	/// Mounts an existing volume: reads the superblock, then replays its
	/// log chain before any other operation touches the bitmap or trees.
	pub fn mount(device: D) -> Result<Self> {
		let block_size = device.block_size();
		let raw_map = Arc::new(Map::new(DeviceOps { device }, block_size, DEFAULT_BUFFER_POOL_SIZE));
		let sb_buf = raw_map.read(0)?;
		let mut sb = Superblock::decode(sb_buf.lock().data())?;
		raw_map.release(&sb_buf);
		sb.mode = Mode::Replaying;
		info!("mounting volume: {} blocks, logcount={}", sb.volblocks, sb.logcount);

		let (log_region_start, log_region_len) = log_region(sb.volblocks);
		let volume = Self::open_with_superblock(raw_map, sb.clone(), log_region_start, log_region_len)?;
		if sb.logcount > 0 {
			volume.replay(sb.logchain, sb.logcount)?;
		}
		volume.superblock.lock().mode = Mode::Normal;
		Ok(volume)
	}

	fn open_with_superblock(
		raw_map: Arc<Map<DeviceOps<D>>>,
		sb: Superblock,
		log_region_start: u64,
		log_region_len: u64,
	) -> Result<Self> {
		let block_size = raw_map.block_size();
		let volblocks = sb.volblocks;
		let bitmap_store = VolumeBitmapStore {
			map: raw_map.clone(),
			bitmap_start: BITMAP_START_BLOCK,
			block_count: volblocks,
		};
		let bitmap = Arc::new(Bitmap::new(bitmap_store, sb.nextalloc, sb.freeblocks));
		let log = Arc::new(Log::new(raw_map.clone(), sb.logchain, sb.logcount));
		let itable = Tree::new(raw_map.clone(), alloc_adapter(bitmap.clone(), log.clone()), Arc::new(IleafOps));
		let inodes = InodeTable::new(itable, bitmap.clone(), log.clone() as Arc<dyn crate::redo::LogWriter>, block_size);
		Ok(Self {
			superblock: Mutex::new(sb),
			raw_map,
			bitmap,
			log,
			inodes,
			log_region_start,
			log_region_len,
			log_cursor: Mutex::new(log_region_start),
		})
	}

	/// Builds a fresh per-file data tree bound to this volume's raw map
	/// and allocator, for reading/writing one inode's contents.
	pub fn data_tree(&self) -> Tree<DeviceOps<D>> {
		Tree::new(
			self.raw_map.clone(),
			alloc_adapter(self.bitmap.clone(), self.log.clone()),
			Arc::new(DleafOps),
		)
	}

	/// The inode facade for this volume.
	pub fn inodes(&self) -> &InodeTable<DeviceOps<D>, VolumeBitmapStore<D>> {
		&self.inodes
	}

	/// Walks the log chain backward from `logchain` for `logcount` blocks,
	/// verifying magics, then applies every record in oldest-first order.
	/// Only `LOG_ALLOC`/`LOG_FREE` mutate durable state in this build;
	/// other tags are accepted but not yet interpreted (spec §4.8
	/// `LOG_UPDATE`/`LOG_DROOT`/`LOG_IROOT`/`LOG_REDIRECT` describe tree
	/// and redirect bookkeeping this simplified engine does not persist
	/// separately from the bitmap and itable root it already replays).
	fn replay(&self, logchain: u64, logcount: u32) -> Result<()> {
		let records = read_chain_for_replay(
			|block| {
				let buf = self.raw_map.read(block)?;
				let data = buf.lock().data().to_vec();
				self.raw_map.release(&buf);
				Ok(data)
			},
			logchain,
			logcount,
		)?;
		for record in &records {
			match record {
				LogRecord::Alloc { block, count } => {
					self.bitmap.replay_flip(*block, *count as u32, false, true)?;
				}
				LogRecord::Free { block, count } => {
					self.bitmap.replay_flip(*block, *count as u32, true, false)?;
				}
				LogRecord::Iroot { depth, block } => {
					let mut sb = self.superblock.lock();
					sb.iroot = crate::volume::BtreeRoot { depth: *depth, block: *block };
				}
				LogRecord::Update { .. } | LogRecord::Droot { .. } | LogRecord::Redirect { .. } => {
					warn!("replay: tag not interpreted by this build, skipping");
				}
			}
		}
		info!("replay complete: {} records applied", records.len());
		Ok(())
	}

	/// Writes back every dirty inode, commits the pending log block, then
	/// flushes the raw buffer map and rewrites the superblock — the unit of
	/// durability the engine provides (spec §5 ordering guarantee: the log
	/// record for a mutation must be durable before the bitmap/leaf state
	/// it describes is, so `commit` runs, and flushes the log block it
	/// wrote, before this function's own flush of the remaining buffers).
	pub fn sync(&self) -> Result<()> {
		let mut root = self.superblock.lock().iroot;
		self.inodes.writeback_all(&mut root)?;
		self.superblock.lock().iroot = root;
		let (logchain, logcount) = self.log.commit(|| {
			// The log's own block allocation bypasses `balloc` so a log
			// commit never itself generates a `LOG_ALLOC` record (which
			// would be unboundedly recursive): log blocks cycle through a
			// fixed reserved run the bitmap marks permanently allocated
			// at format time, rather than drawing from the general pool.
			let mut cursor = self.log_cursor.lock();
			let block = *cursor;
			*cursor = self.log_region_start + (*cursor + 1 - self.log_region_start) % self.log_region_len;
			Ok(block)
		})?;
		let mut sb = self.superblock.lock();
		sb.logchain = logchain;
		sb.logcount = logcount;
		sb.freeblocks = self.bitmap.freeblocks();
		sb.nextalloc = self.bitmap.nextalloc();
		let sb_buf = self.raw_map.get(0);
		sb.encode(sb_buf.lock().data_mut());
		self.raw_map.release_dirty(&sb_buf);
		self.raw_map.flush()
	}
}

/// A [`crate::btree::BlockAlloc`] adapter over the bitmap allocator and
/// log, so the generic B-tree code never needs to know about either
/// directly.
struct BitmapBlockAlloc<D: BlockDevice> {
	bitmap: Arc<Bitmap<VolumeBitmapStore<D>>>,
	log: Arc<Log<DeviceOps<D>>>,
}

impl<D: BlockDevice> crate::btree::BlockAlloc for BitmapBlockAlloc<D> {
	fn alloc(&self) -> Result<u64> {
		match self.bitmap.balloc(self.log.as_ref(), 1)? {
			crate::bitmap::BallocResult::Allocated(block) => Ok(block),
			crate::bitmap::BallocResult::OutOfSpace => Err(Error::OutOfSpace),
		}
	}

	fn free(&self, block: u64, count: u32) -> Result<()> {
		self.bitmap.bfree(self.log.as_ref(), block, count)
	}
}

fn alloc_adapter<D: BlockDevice>(
	bitmap: Arc<Bitmap<VolumeBitmapStore<D>>>,
	log: Arc<Log<DeviceOps<D>>>,
) -> Arc<dyn crate::btree::BlockAlloc> {
	Arc::new(BitmapBlockAlloc { bitmap, log })
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::volume::MemDevice;

	#[test]
	fn format_then_mount_round_trip() {
		let device = MemDevice::new(512, 256);
		{
			let volume = Volume::format(device).unwrap();
			let sb = volume.superblock.lock();
			assert_eq!(sb.volblocks, 256);
		}
	}

	#[test]
	fn format_with_params_honors_buffer_pool_and_goal() {
		let device = MemDevice::new(512, 256);
		let params = VolumeParams {
			blockbits: 9,
			volblocks: 256,
			buffer_pool_size: 64,
			alloc_goal: 10,
		};
		let volume = Volume::format_with_params(device, params).unwrap();
		let sb = volume.superblock.lock();
		assert_eq!(sb.nextalloc, 10);
	}

	#[test]
	fn create_and_sync_persists_inode() {
		let device = MemDevice::new(512, 512);
		let volume = Volume::format(device).unwrap();
		let mut root = volume.superblock.lock().iroot;
		let inode = volume.inodes().create(&mut root, 0, 0o644, 0, 0, 1).unwrap();
		volume.superblock.lock().iroot = root;
		volume.sync().unwrap();

		let root = volume.superblock.lock().iroot;
		let fetched = volume.inodes().iget(&root, inode.inum).unwrap();
		assert_eq!(fetched.mode, 0o644);
	}
}
