//! Error taxonomy for the storage engine.
//!
//! Every fallible operation in this crate returns [`Result<T>`], whose error
//! variants mirror the taxonomy mandated by the engine's design: callers
//! need to distinguish "no space", "corrupt", "not found" and friends rather
//! than receiving an opaque I/O failure for all of them.

use std::fmt;

/// Errors produced by the storage engine core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// The underlying block device failed to read or write.
	#[error("device I/O error: {0}")]
	Io(#[from] std::io::Error),
	/// No free block run of the requested size could be found.
	#[error("out of space")]
	OutOfSpace,
	/// An in-memory allocation (buffer, cursor) could not be satisfied.
	#[error("no memory")]
	NoMemory,
	/// The requested key (inode, directory entry, attribute, extent) does not exist.
	#[error("not found")]
	NotFound,
	/// The operation would create a name or key that already exists.
	#[error("already exists")]
	Exists,
	/// An argument violates a precondition of the operation.
	#[error("invalid argument: {0}")]
	InvalidArgument(&'static str),
	/// On-disk structure failed a consistency check (bad magic, broken
	/// invariant, unknown log tag at version 0). Fatal to the mount.
	#[error("corrupt filesystem structure: {0}")]
	Corrupt(&'static str),
}

/// Convenience alias used throughout the crate, mirroring the teacher's
/// `utils::errno::EResult`.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
	/// Returns `true` if the error is safe to retry after freeing resources
	/// (currently only [`Error::OutOfSpace`]).
	pub fn is_retryable(&self) -> bool {
		matches!(self, Error::OutOfSpace)
	}
}

/// A lightweight display helper used when logging partially-decoded
/// structures (dleaf/ileaf dumps); never returns an error itself.
pub(crate) struct HexDump<'a>(pub &'a [u8]);

impl fmt::Display for HexDump<'_> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		for (i, b) in self.0.iter().enumerate() {
			if i > 0 && i % 16 == 0 {
				writeln!(f)?;
			}
			write!(f, "{b:02x} ")?;
		}
		Ok(())
	}
}
