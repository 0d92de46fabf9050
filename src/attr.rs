//! Attribute codec (spec §4.5): typed, versioned inode attribute records.
//!
//! Every record starts with a big-endian `u16` header `(kind:4 |
//! version:12)`. An unrecognized `(kind, version)` combination is skipped
//! *by length* rather than rejected, so that re-encoding an inode read by
//! an older build does not silently drop attributes a newer build wrote.
//! A zero version of an unknown kind is the one case that cannot be
//! skipped safely (no size table entry exists yet) and is a protocol
//! error.

use crate::codec::{be16, be32, be48, put_be16, put_be32, put_be48};
use crate::error::{Error, Result};
use crate::volume::BtreeRoot;

const HEADER: usize = 2;

fn pack_header(kind: u8, version: u16) -> u16 {
	debug_assert!(kind < 16);
	debug_assert!(version < (1 << 12));
	((kind as u16) << 12) | version
}

fn unpack_header(h: u16) -> (u8, u16) {
	((h >> 12) as u8, h & 0x0fff)
}

/// Attribute kinds this build understands (spec §3, §9 xattr supplement).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attr {
	/// 48-bit ctime, mode, uid, gid.
	CtimeOwner {
		ctime: u64,
		mode: u32,
		uid: u32,
		gid: u32,
	},
	/// 48-bit mtime, 64-bit logical size.
	MtimeSize { mtime: u64, isize: u64 },
	/// Root of the file's data B-tree.
	DataBtree(BtreeRoot),
	/// Hard-link count.
	LinkCount(u32),
	/// A named extended attribute: `name` and opaque `value` bytes.
	Xattr { name: String, value: Vec<u8> },
	/// A record this build cannot interpret, preserved verbatim so a
	/// decode/encode round trip does not lose it.
	Unknown { kind: u8, version: u16, payload: Vec<u8> },
}

const KIND_CTIME_OWNER: u8 = 0;
const KIND_MTIME_SIZE: u8 = 1;
const KIND_DATA_BTREE: u8 = 2;
const KIND_LINK_COUNT: u8 = 3;
const KIND_XATTR: u8 = 4;

const CTIME_OWNER_VERSION: u16 = 0;
const MTIME_SIZE_VERSION: u16 = 0;
const DATA_BTREE_VERSION: u16 = 0;
const LINK_COUNT_VERSION: u16 = 0;
const XATTR_VERSION: u16 = 0;

const CTIME_OWNER_LEN: usize = 6 + 4 + 4 + 4;
const MTIME_SIZE_LEN: usize = 6 + 8;
const DATA_BTREE_LEN: usize = 2 + 6;
const LINK_COUNT_LEN: usize = 4;

impl Attr {
	fn kind(&self) -> u8 {
		match self {
			Attr::CtimeOwner { .. } => KIND_CTIME_OWNER,
			Attr::MtimeSize { .. } => KIND_MTIME_SIZE,
			Attr::DataBtree(_) => KIND_DATA_BTREE,
			Attr::LinkCount(_) => KIND_LINK_COUNT,
			Attr::Xattr { .. } => KIND_XATTR,
			Attr::Unknown { kind, .. } => *kind,
		}
	}

	fn version(&self) -> u16 {
		match self {
			Attr::CtimeOwner { .. } => CTIME_OWNER_VERSION,
			Attr::MtimeSize { .. } => MTIME_SIZE_VERSION,
			Attr::DataBtree(_) => DATA_BTREE_VERSION,
			Attr::LinkCount(_) => LINK_COUNT_VERSION,
			Attr::Xattr { .. } => XATTR_VERSION,
			Attr::Unknown { version, .. } => *version,
		}
	}

	/// Encoded size of this record's payload, header excluded.
	fn payload_len(&self) -> usize {
		match self {
			Attr::CtimeOwner { .. } => CTIME_OWNER_LEN,
			Attr::MtimeSize { .. } => MTIME_SIZE_LEN,
			Attr::DataBtree(_) => DATA_BTREE_LEN,
			Attr::LinkCount(_) => LINK_COUNT_LEN,
			Attr::Xattr { name, value } => 2 + name.len() + 2 + value.len(),
			Attr::Unknown { payload, .. } => 2 + payload.len(),
		}
	}

	fn encode_into(&self, buf: &mut Vec<u8>) {
		let header = pack_header(self.kind(), self.version());
		let mut header_bytes = [0u8; HEADER];
		put_be16(&mut header_bytes, 0, header);
		buf.extend_from_slice(&header_bytes);
		let start = buf.len();
		buf.resize(start + self.payload_len(), 0);
		let slice = &mut buf[start..];
		match self {
			Attr::CtimeOwner { ctime, mode, uid, gid } => {
				put_be48(slice, 0, *ctime);
				put_be32(slice, 6, *mode);
				put_be32(slice, 10, *uid);
				put_be32(slice, 14, *gid);
			}
			Attr::MtimeSize { mtime, isize } => {
				put_be48(slice, 0, *mtime);
				crate::codec::put_be64(slice, 6, *isize);
			}
			Attr::DataBtree(root) => {
				put_be16(slice, 0, root.depth);
				put_be48(slice, 2, root.block);
			}
			Attr::LinkCount(n) => {
				put_be32(slice, 0, *n);
			}
			Attr::Xattr { name, value } => {
				put_be16(slice, 0, name.len() as u16);
				slice[2..2 + name.len()].copy_from_slice(name.as_bytes());
				let off = 2 + name.len();
				put_be16(slice, off, value.len() as u16);
				slice[off + 2..off + 2 + value.len()].copy_from_slice(value);
			}
			Attr::Unknown { payload, .. } => {
				put_be16(slice, 0, payload.len() as u16);
				slice[2..2 + payload.len()].copy_from_slice(payload);
			}
		}
	}
}

/// Encodes a full attribute block (the concatenation of every record) for
/// one inode.
pub fn encode_all(attrs: &[Attr]) -> Vec<u8> {
	let mut buf = Vec::new();
	for attr in attrs {
		attr.encode_into(&mut buf);
	}
	buf
}

/// Decodes a full attribute block, skipping unrecognized records by
/// length rather than failing, so newer on-disk attributes survive a
/// round trip through an older reader.
pub fn decode_all(data: &[u8]) -> Result<Vec<Attr>> {
	let mut attrs = Vec::new();
	let mut off = 0usize;
	while off + HEADER <= data.len() {
		let header = be16(data, off);
		off += HEADER;
		let (kind, version) = unpack_header(header);
		let remaining = &data[off..];
		let attr = match (kind, version) {
			(KIND_CTIME_OWNER, CTIME_OWNER_VERSION) => {
				let ctime = be48(remaining, 0);
				let mode = be32(remaining, 6);
				let uid = be32(remaining, 10);
				let gid = be32(remaining, 14);
				off += CTIME_OWNER_LEN;
				Attr::CtimeOwner { ctime, mode, uid, gid }
			}
			(KIND_MTIME_SIZE, MTIME_SIZE_VERSION) => {
				let mtime = be48(remaining, 0);
				let isize = crate::codec::be64(remaining, 6);
				off += MTIME_SIZE_LEN;
				Attr::MtimeSize { mtime, isize }
			}
			(KIND_DATA_BTREE, DATA_BTREE_VERSION) => {
				let depth = be16(remaining, 0);
				let block = be48(remaining, 2);
				off += DATA_BTREE_LEN;
				Attr::DataBtree(BtreeRoot { depth, block })
			}
			(KIND_LINK_COUNT, LINK_COUNT_VERSION) => {
				let n = be32(remaining, 0);
				off += LINK_COUNT_LEN;
				Attr::LinkCount(n)
			}
			(KIND_XATTR, XATTR_VERSION) => {
				let name_len = be16(remaining, 0) as usize;
				let name = String::from_utf8_lossy(&remaining[2..2 + name_len]).into_owned();
				let value_off = 2 + name_len;
				let value_len = be16(remaining, value_off) as usize;
				let value = remaining[value_off + 2..value_off + 2 + value_len].to_vec();
				off += 2 + name_len + 2 + value_len;
				Attr::Xattr { name, value }
			}
			(_, 0) => {
				return Err(Error::Corrupt("unknown attribute kind at version 0"));
			}
			(kind, version) => {
				// Forward-compatibility path: a future version of a known
				// (or entirely new) kind carries its own length prefix so
				// this build can skip it without understanding it.
				let len = be16(remaining, 0) as usize;
				let payload = remaining[2..2 + len].to_vec();
				off += 2 + len;
				Attr::Unknown { kind, version, payload }
			}
		};
		attrs.push(attr);
	}
	Ok(attrs)
}
