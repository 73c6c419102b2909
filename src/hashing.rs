//! Streaming content hashing
//!
//! The digest algorithm is a single seam: everything else in the crate
//! handles opaque 32-byte [`Digest`] values. Hashing reads files through a
//! fixed buffer so large files never have to fit in memory.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use crate::types::Digest;

const READ_BUF_SIZE: usize = 128 * 1024;

/// Hash a file's content without loading it whole.
///
/// Returns the digest and the number of bytes read. The read count is
/// the authoritative size for the content: the file may have changed
/// between an earlier stat and the read.
pub fn hash_file(path: &Path) -> io::Result<(Digest, u64)> {
	let mut file = File::open(path)?;
	let mut hasher = blake3::Hasher::new();
	let mut buf = vec![0u8; READ_BUF_SIZE];
	let mut total: u64 = 0;

	loop {
		let n = file.read(&mut buf)?;
		if n == 0 {
			break;
		}
		hasher.update(&buf[..n]);
		total += n as u64;
	}

	Ok((Digest(*hasher.finalize().as_bytes()), total))
}

/// Hash an in-memory buffer (used by tests and small payload checks)
pub fn hash_bytes(data: &[u8]) -> Digest {
	Digest(*blake3::hash(data).as_bytes())
}


// vim: ts=4
