//! Core types shared by the index, the scanner and the bundle manager

use serde::de::{self, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Deserializer, Serialize};
use std::convert::TryInto;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Opaque transfer unit identifier (UUIDv4)
pub type BundleId = Uuid;

/// 32-byte content digest identifying a blob
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest(pub [u8; 32]);

impl Digest {
	pub fn as_bytes(&self) -> &[u8; 32] {
		&self.0
	}

	pub fn to_hex(&self) -> String {
		hex::encode(self.0)
	}

	pub fn from_hex(s: &str) -> Result<Digest, String> {
		let bytes = hex::decode(s).map_err(|e| format!("Invalid digest '{}': {}", s, e))?;
		let arr: [u8; 32] =
			bytes.try_into().map_err(|_| format!("Invalid digest length: {}", s))?;
		Ok(Digest(arr))
	}

	/// Digest from a raw database key; the key width is enforced on insert
	pub(crate) fn from_slice(bytes: &[u8]) -> Result<Digest, String> {
		let arr: [u8; 32] =
			bytes.try_into().map_err(|_| format!("Invalid digest key length: {}", bytes.len()))?;
		Ok(Digest(arr))
	}
}

impl fmt::Display for Digest {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_hex())
	}
}

impl fmt::Debug for Digest {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Digest({})", self.to_hex())
	}
}

impl Serialize for Digest {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&self.to_hex())
	}
}

struct DigestVisitor;

impl<'de> Visitor<'de> for DigestVisitor {
	type Value = Digest;

	fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("a 64 character hex string")
	}

	fn visit_str<E: de::Error>(self, v: &str) -> Result<Digest, E> {
		Digest::from_hex(v).map_err(de::Error::custom)
	}
}

impl<'de> Deserialize<'de> for Digest {
	fn deserialize<D>(deserializer: D) -> Result<Digest, D::Error>
	where
		D: Deserializer<'de>,
	{
		deserializer.deserialize_str(DigestVisitor)
	}
}

/// File kind; part of a path's identity - a kind change is always
/// delete + recreate, never an in-place mutation
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum FileKind {
	#[serde(rename = "F")]
	Regular,
	#[serde(rename = "D")]
	Directory,
	#[serde(rename = "L")]
	Symlink,
}

impl fmt::Display for FileKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			FileKind::Regular => f.write_str("file"),
			FileKind::Directory => f.write_str("directory"),
			FileKind::Symlink => f.write_str("symlink"),
		}
	}
}

/// Metadata of one filesystem entry as observed during a walk.
/// Paths are relative to the scan root, byte-exact.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FileMeta {
	pub path: PathBuf,
	pub kind: FileKind,
	pub size: u64,
	pub mtime: i64,
	pub ctime: i64,
	pub inode: u64,
	pub executable: bool,
	pub link_target: Option<PathBuf>,
}

/// Persisted local file row. The table key is the path bytes; `generation`
/// records the scan that last wrote the row (audit only - the mark phase of
/// the sweep lives in the scan transaction itself).
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct LocalFileRow {
	#[serde(rename = "k")]
	pub kind: FileKind,
	#[serde(rename = "sz")]
	pub size: u64,
	#[serde(rename = "mt")]
	pub mtime: i64,
	#[serde(rename = "ct")]
	pub ctime: i64,
	#[serde(rename = "in")]
	pub inode: u64,
	#[serde(rename = "x")]
	pub executable: bool,
	#[serde(rename = "lt")]
	pub link_target: Option<Vec<u8>>,
	#[serde(rename = "g")]
	pub generation: u64,
}

impl LocalFileRow {
	pub fn from_meta(meta: &FileMeta, generation: u64) -> LocalFileRow {
		LocalFileRow {
			kind: meta.kind,
			size: meta.size,
			mtime: meta.mtime,
			ctime: meta.ctime,
			inode: meta.inode,
			executable: meta.executable,
			link_target: meta.link_target.as_deref().map(path_key),
			generation,
		}
	}

	/// True when the stat identity of a regular file is unchanged and its
	/// content hash can be reused without re-reading the file
	pub fn same_content_identity(&self, meta: &FileMeta) -> bool {
		self.kind == FileKind::Regular
			&& meta.kind == FileKind::Regular
			&& self.size == meta.size
			&& self.mtime == meta.mtime
			&& self.ctime == meta.ctime
			&& self.inode == meta.inode
	}

	/// True when nothing observable changed (kind, stat identity,
	/// executable bit, link target)
	pub fn same_meta(&self, meta: &FileMeta) -> bool {
		self.kind == meta.kind
			&& self.size == meta.size
			&& self.mtime == meta.mtime
			&& self.ctime == meta.ctime
			&& self.inode == meta.inode
			&& self.executable == meta.executable
			&& self.link_target.as_deref() == meta.link_target.as_deref().map(path_key).as_deref()
	}
}

/// Persisted remote file row: the last state confirmed present on the
/// remote side. Never scanned live, only written on bundle confirmation
/// or explicit removal.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct RemoteFileRow {
	#[serde(rename = "k")]
	pub kind: FileKind,
	#[serde(rename = "sz")]
	pub size: u64,
	#[serde(rename = "mt")]
	pub mtime: i64,
	#[serde(rename = "x")]
	pub executable: bool,
	#[serde(rename = "lt")]
	pub link_target: Option<Vec<u8>>,
}

impl RemoteFileRow {
	pub fn from_local(local: &LocalFileRow) -> RemoteFileRow {
		RemoteFileRow {
			kind: local.kind,
			size: local.size,
			mtime: local.mtime,
			executable: local.executable,
			link_target: local.link_target.clone(),
		}
	}
}

/// Persisted blob row; the table key is the digest. Size is immutable
/// once created. `bundle` is set while the blob is reserved by a pending
/// bundle and cleared when the transfer is confirmed.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct BlobRow {
	#[serde(rename = "sz")]
	pub size: u64,
	#[serde(rename = "bu")]
	pub bundle: Option<BundleId>,
}

/// Persisted bundle row. Bundles are an audit trail: rows persist after
/// the transfer completes, with the member digests they carried.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct BundleRow {
	#[serde(rename = "cr")]
	pub created: u64,
	#[serde(rename = "tr")]
	pub transferred: bool,
	#[serde(rename = "bl")]
	pub blobs: Vec<Digest>,
}

/// One path the scan could not process (permission denied, vanished
/// mid-read, unsupported kind, ...). The scan skips it and continues.
#[derive(Clone, Debug)]
pub struct ScanFailure {
	pub path: PathBuf,
	pub error: String,
}

/// Partial-success report of one scan cycle
#[derive(Clone, Debug, Default)]
pub struct ScanSummary {
	/// Paths visited and marked during the walk
	pub files_seen: usize,
	/// Rows created or updated (metadata changes)
	pub files_updated: usize,
	/// Content hashes actually computed
	pub files_hashed: usize,
	/// Rows swept because the path no longer exists
	pub files_deleted: usize,
	/// Per-path failures; never abort the scan
	pub failed: Vec<ScanFailure>,
}

/// Local vs. remote index comparison
#[derive(Clone, Debug, Default)]
pub struct DiffReport {
	/// Present locally, absent remotely
	pub added: Vec<PathBuf>,
	/// Present on both sides with differing kind/metadata/content
	pub modified: Vec<PathBuf>,
	/// Present remotely, absent locally
	pub deleted: Vec<PathBuf>,
}

/// One blob the transport must upload: the digest, the recorded size and
/// the lexicographically smallest local path currently holding the content
#[derive(Clone, Debug)]
pub struct BlobSource {
	pub digest: Digest,
	pub size: u64,
	pub path: PathBuf,
}

/// Exact byte representation of a path, used as database key
#[cfg(unix)]
pub fn path_key(path: &Path) -> Vec<u8> {
	use std::os::unix::ffi::OsStrExt;
	path.as_os_str().as_bytes().to_vec()
}

/// Inverse of [`path_key`]
#[cfg(unix)]
pub fn key_path(key: &[u8]) -> PathBuf {
	use std::os::unix::ffi::OsStrExt;
	PathBuf::from(OsStr::from_bytes(key))
}


// vim: ts=4
