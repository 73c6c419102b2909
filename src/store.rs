//! Persistent index backed by redb
//!
//! One database holds the five entities: blobs, bundles, local files,
//! remote files and the two file-to-blob link tables. Rows are serialized
//! with serde_json; paths are stored byte-exact as table keys. Every
//! multi-row operation runs inside a single write transaction - an early
//! return drops the transaction uncommitted, so partial application never
//! reaches disk.

use redb::{ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::error::StoreError;
use crate::logging::*;
use crate::types::{path_key, BlobRow, BundleId, BundleRow, Digest, LocalFileRow, RemoteFileRow};

/// Key: 32-byte content digest. Value: serialized [`BlobRow`].
pub(crate) const BLOBS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("blobs");

/// Key: bundle UUID string. Value: serialized [`BundleRow`].
pub(crate) const BUNDLES: TableDefinition<&str, &[u8]> = TableDefinition::new("bundles");

/// Key: path bytes relative to the scan root. Value: serialized [`LocalFileRow`].
pub(crate) const LOCAL_FILES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("local_files");

/// Key: path bytes. Value: digest bytes of the linked blob.
pub(crate) const LOCAL_FILE_BLOBS: TableDefinition<&[u8], &[u8]> =
	TableDefinition::new("local_file_blobs");

/// Key: path bytes. Value: serialized [`RemoteFileRow`].
pub(crate) const REMOTE_FILES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("remote_files");

/// Key: path bytes. Value: digest bytes of the linked blob.
pub(crate) const REMOTE_FILE_BLOBS: TableDefinition<&[u8], &[u8]> =
	TableDefinition::new("remote_file_blobs");

/// Singleton counters (currently only the scan generation)
pub(crate) const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const SCAN_GENERATION_KEY: &str = "scan_generation";

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
	Ok(serde_json::to_vec(value)?)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
	Ok(serde_json::from_slice(bytes)?)
}

/// Insert a blob row for `digest` unless one already exists.
///
/// An existing row whose recorded size disagrees with `size` means two
/// different contents produced the same digest. That breaks the content
/// address and is fatal; the enclosing transaction must not commit.
pub(crate) fn blob_get_or_create(
	blobs: &mut redb::Table<&'static [u8], &'static [u8]>,
	digest: Digest,
	size: u64,
) -> Result<(), StoreError> {
	let existing = match blobs.get(digest.as_bytes().as_slice())? {
		Some(guard) => Some(decode::<BlobRow>(guard.value())?),
		None => None,
	};

	match existing {
		Some(row) => {
			if row.size != size {
				return Err(StoreError::HashMismatch {
					digest,
					stored: row.size,
					observed: size,
				});
			}
			Ok(())
		}
		None => {
			let row = BlobRow { size, bundle: None };
			blobs.insert(digest.as_bytes().as_slice(), encode(&row)?.as_slice())?;
			Ok(())
		}
	}
}

/// Changes one scan cycle wants applied atomically.
///
/// `visited` is the mark set of the mark-and-sweep pass: every path seen
/// during the walk. Rows whose key is not in it are swept, cascading their
/// blob link. `upserts` carry metadata changes only; `hashed` carries the
/// new content links (creating blob rows as needed); `unlink` drops links
/// of paths that stopped being regular files.
#[derive(Debug, Default)]
pub struct ScanBatch {
	pub visited: BTreeSet<Vec<u8>>,
	pub upserts: Vec<(Vec<u8>, LocalFileRow)>,
	pub hashed: Vec<(Vec<u8>, Digest, u64)>,
	pub unlink: Vec<Vec<u8>>,
}

/// What `apply_scan` actually did
#[derive(Debug)]
pub struct ScanApplyStats {
	pub generation: u64,
	pub files_deleted: usize,
}

/// The five-entity index over a single redb database
pub struct Index {
	pub(crate) db: redb::Database,
}

impl Index {
	/// Open or create the index database and make sure all tables exist
	pub fn open(db_path: &Path) -> Result<Index, StoreError> {
		let db = redb::Database::create(db_path)?;
		{
			let write_txn = db.begin_write()?;
			let _ = write_txn.open_table(BLOBS)?;
			let _ = write_txn.open_table(BUNDLES)?;
			let _ = write_txn.open_table(LOCAL_FILES)?;
			let _ = write_txn.open_table(LOCAL_FILE_BLOBS)?;
			let _ = write_txn.open_table(REMOTE_FILES)?;
			let _ = write_txn.open_table(REMOTE_FILE_BLOBS)?;
			let _ = write_txn.open_table(META)?;
			write_txn.commit()?;
		}
		Ok(Index { db })
	}

	/// Number of the last completed scan (0 before the first one)
	pub fn generation(&self) -> Result<u64, StoreError> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(META)?;
		Ok(table.get(SCAN_GENERATION_KEY)?.map(|g| g.value()).unwrap_or(0))
	}

	/// Snapshot of all local file rows, keyed by path bytes
	pub fn local_tree(&self) -> Result<BTreeMap<Vec<u8>, LocalFileRow>, StoreError> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(LOCAL_FILES)?;
		let mut tree = BTreeMap::new();

		let mut iter = table.iter()?;
		loop {
			match iter.next() {
				Some(Ok((key, value))) => {
					tree.insert(key.value().to_vec(), decode(value.value())?);
				}
				None => break,
				Some(Err(e)) => return Err(e.into()),
			}
		}
		Ok(tree)
	}

	/// Snapshot of all remote file rows, keyed by path bytes
	pub fn remote_tree(&self) -> Result<BTreeMap<Vec<u8>, RemoteFileRow>, StoreError> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(REMOTE_FILES)?;
		let mut tree = BTreeMap::new();

		let mut iter = table.iter()?;
		loop {
			match iter.next() {
				Some(Ok((key, value))) => {
					tree.insert(key.value().to_vec(), decode(value.value())?);
				}
				None => break,
				Some(Err(e)) => return Err(e.into()),
			}
		}
		Ok(tree)
	}

	/// Snapshot of the local path -> blob digest links
	pub fn local_links(&self) -> Result<BTreeMap<Vec<u8>, Digest>, StoreError> {
		self.link_snapshot(LOCAL_FILE_BLOBS)
	}

	/// Snapshot of the remote path -> blob digest links
	pub fn remote_links(&self) -> Result<BTreeMap<Vec<u8>, Digest>, StoreError> {
		self.link_snapshot(REMOTE_FILE_BLOBS)
	}

	fn link_snapshot(
		&self,
		def: TableDefinition<&'static [u8], &'static [u8]>,
	) -> Result<BTreeMap<Vec<u8>, Digest>, StoreError> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(def)?;
		let mut links = BTreeMap::new();

		let mut iter = table.iter()?;
		loop {
			match iter.next() {
				Some(Ok((key, value))) => {
					let digest = Digest::from_slice(value.value())
						.map_err(|message| StoreError::Corrupted { message })?;
					links.insert(key.value().to_vec(), digest);
				}
				None => break,
				Some(Err(e)) => return Err(e.into()),
			}
		}
		Ok(links)
	}

	pub fn local_file(&self, path: &Path) -> Result<Option<LocalFileRow>, StoreError> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(LOCAL_FILES)?;
		match table.get(path_key(path).as_slice())? {
			Some(guard) => Ok(Some(decode(guard.value())?)),
			None => Ok(None),
		}
	}

	pub fn remote_file(&self, path: &Path) -> Result<Option<RemoteFileRow>, StoreError> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(REMOTE_FILES)?;
		match table.get(path_key(path).as_slice())? {
			Some(guard) => Ok(Some(decode(guard.value())?)),
			None => Ok(None),
		}
	}

	/// Digest linked to a local path, if the file has been hashed
	pub fn local_blob(&self, path: &Path) -> Result<Option<Digest>, StoreError> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(LOCAL_FILE_BLOBS)?;
		match table.get(path_key(path).as_slice())? {
			Some(guard) => {
				let digest = Digest::from_slice(guard.value())
					.map_err(|message| StoreError::Corrupted { message })?;
				Ok(Some(digest))
			}
			None => Ok(None),
		}
	}

	pub fn blob(&self, digest: Digest) -> Result<Option<BlobRow>, StoreError> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(BLOBS)?;
		match table.get(digest.as_bytes().as_slice())? {
			Some(guard) => Ok(Some(decode(guard.value())?)),
			None => Ok(None),
		}
	}

	/// Number of blob rows (equals the number of distinct digests observed)
	pub fn blob_count(&self) -> Result<usize, StoreError> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(BLOBS)?;
		Ok(table.len()? as usize)
	}

	pub fn bundle(&self, id: BundleId) -> Result<Option<BundleRow>, StoreError> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(BUNDLES)?;
		match table.get(id.to_string().as_str())? {
			Some(guard) => Ok(Some(decode(guard.value())?)),
			None => Ok(None),
		}
	}

	/// All bundle rows, pending and transferred (audit trail)
	pub fn bundles(&self) -> Result<Vec<(BundleId, BundleRow)>, StoreError> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(BUNDLES)?;
		let mut out = Vec::new();

		let mut iter = table.iter()?;
		loop {
			match iter.next() {
				Some(Ok((key, value))) => {
					let id = key
						.value()
						.parse::<BundleId>()
						.map_err(|e| StoreError::Corrupted { message: e.to_string() })?;
					out.push((id, decode(value.value())?));
				}
				None => break,
				Some(Err(e)) => return Err(e.into()),
			}
		}
		Ok(out)
	}

	/// Register a digest/size pair in its own transaction.
	///
	/// The scan path uses [`blob_get_or_create`] inside its apply
	/// transaction instead; this standalone form exists for callers that
	/// inject content out of band.
	pub fn get_or_create_blob(&self, digest: Digest, size: u64) -> Result<(), StoreError> {
		let write_txn = self.db.begin_write()?;
		{
			let mut blobs = write_txn.open_table(BLOBS)?;
			blob_get_or_create(&mut blobs, digest, size)?;
		}
		write_txn.commit()?;
		Ok(())
	}

	/// Apply one scan cycle: bump the generation, write the changed rows,
	/// create blobs and replace links for re-hashed files, then sweep every
	/// row whose path was not visited (cascading its link). All or nothing.
	pub fn apply_scan(&self, batch: ScanBatch) -> Result<ScanApplyStats, StoreError> {
		let write_txn = self.db.begin_write()?;
		let generation;
		let files_deleted;
		{
			let mut meta = write_txn.open_table(META)?;
			generation = meta.get(SCAN_GENERATION_KEY)?.map(|g| g.value()).unwrap_or(0) + 1;
			meta.insert(SCAN_GENERATION_KEY, generation)?;
		}
		{
			let mut files = write_txn.open_table(LOCAL_FILES)?;
			let mut links = write_txn.open_table(LOCAL_FILE_BLOBS)?;
			let mut blobs = write_txn.open_table(BLOBS)?;

			for (key, mut row) in batch.upserts {
				row.generation = generation;
				files.insert(key.as_slice(), encode(&row)?.as_slice())?;
			}

			for key in &batch.unlink {
				links.remove(key.as_slice())?;
			}

			for (key, digest, size) in &batch.hashed {
				blob_get_or_create(&mut blobs, *digest, *size)?;
				links.insert(key.as_slice(), digest.as_bytes().as_slice())?;
			}

			// Sweep phase: paths absent from the mark set no longer exist.
			// Descendants of deleted directories were never visited either,
			// so they are swept by the same rule.
			let mut stale = Vec::new();
			{
				let mut iter = files.iter()?;
				loop {
					match iter.next() {
						Some(Ok((key, _value))) => {
							let key_bytes = key.value().to_vec();
							if !batch.visited.contains(&key_bytes) {
								stale.push(key_bytes);
							}
						}
						None => break,
						Some(Err(e)) => return Err(e.into()),
					}
				}
			}
			for key in &stale {
				files.remove(key.as_slice())?;
				links.remove(key.as_slice())?;
			}
			files_deleted = stale.len();
		}
		write_txn.commit()?;

		debug!("Scan generation {} applied, {} rows swept", generation, files_deleted);
		Ok(ScanApplyStats { generation, files_deleted })
	}

	/// Mirror a local deletion on the remote side: drop the remote row and
	/// its blob link. Blob cleanup is left to [`Index::purge_unreferenced`].
	pub fn remove_remote(&self, path: &Path) -> Result<bool, StoreError> {
		let key = path_key(path);
		let write_txn = self.db.begin_write()?;
		let existed;
		{
			let mut files = write_txn.open_table(REMOTE_FILES)?;
			let mut links = write_txn.open_table(REMOTE_FILE_BLOBS)?;
			existed = files.remove(key.as_slice())?.is_some();
			links.remove(key.as_slice())?;
		}
		write_txn.commit()?;
		Ok(existed)
	}

	/// Delete every blob with zero referencing file rows and no pending
	/// bundle assignment. Idempotent maintenance pass, run separately from
	/// link removal so bulk deletes do not interleave with it.
	pub fn purge_unreferenced(&self) -> Result<usize, StoreError> {
		let write_txn = self.db.begin_write()?;
		let purged;
		{
			let mut referenced: BTreeSet<Vec<u8>> = BTreeSet::new();
			for def in [LOCAL_FILE_BLOBS, REMOTE_FILE_BLOBS] {
				let links = write_txn.open_table(def)?;
				let mut iter = links.iter()?;
				loop {
					match iter.next() {
						Some(Ok((_key, value))) => {
							referenced.insert(value.value().to_vec());
						}
						None => break,
						Some(Err(e)) => return Err(e.into()),
					}
				}
			}

			let mut blobs = write_txn.open_table(BLOBS)?;
			let mut orphans = Vec::new();
			{
				let mut iter = blobs.iter()?;
				loop {
					match iter.next() {
						Some(Ok((key, value))) => {
							let row: BlobRow = decode(value.value())?;
							if row.bundle.is_none() && !referenced.contains(key.value()) {
								orphans.push(key.value().to_vec());
							}
						}
						None => break,
						Some(Err(e)) => return Err(e.into()),
					}
				}
			}
			for key in &orphans {
				blobs.remove(key.as_slice())?;
			}
			purged = orphans.len();
		}
		write_txn.commit()?;

		if purged > 0 {
			info!("Purged {} unreferenced blobs", purged);
		}
		Ok(purged)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::FileKind;
	use tempfile::TempDir;

	fn open_index(tmp: &TempDir) -> Index {
		Index::open(&tmp.path().join("index.redb")).unwrap()
	}

	fn digest(byte: u8) -> Digest {
		Digest([byte; 32])
	}

	fn local_row(size: u64) -> LocalFileRow {
		LocalFileRow {
			kind: FileKind::Regular,
			size,
			mtime: 1000,
			ctime: 1000,
			inode: 42,
			executable: false,
			link_target: None,
			generation: 0,
		}
	}

	#[test]
	fn test_get_or_create_is_idempotent() {
		let tmp = TempDir::new().unwrap();
		let index = open_index(&tmp);

		index.get_or_create_blob(digest(1), 10).unwrap();
		index.get_or_create_blob(digest(1), 10).unwrap();

		assert_eq!(index.blob_count().unwrap(), 1);
		assert_eq!(index.blob(digest(1)).unwrap().unwrap().size, 10);
	}

	#[test]
	fn test_size_disagreement_is_fatal() {
		let tmp = TempDir::new().unwrap();
		let index = open_index(&tmp);

		index.get_or_create_blob(digest(1), 10).unwrap();
		let err = index.get_or_create_blob(digest(1), 11).unwrap_err();
		match err {
			StoreError::HashMismatch { stored, observed, .. } => {
				assert_eq!(stored, 10);
				assert_eq!(observed, 11);
			}
			other => panic!("expected HashMismatch, got {:?}", other),
		}

		// The original row is untouched
		assert_eq!(index.blob(digest(1)).unwrap().unwrap().size, 10);
	}

	#[test]
	fn test_apply_scan_creates_links_and_blobs() {
		let tmp = TempDir::new().unwrap();
		let index = open_index(&tmp);

		let key = path_key(Path::new("a.txt"));
		let mut batch = ScanBatch::default();
		batch.visited.insert(key.clone());
		batch.upserts.push((key.clone(), local_row(2)));
		batch.hashed.push((key.clone(), digest(7), 2));

		let stats = index.apply_scan(batch).unwrap();
		assert_eq!(stats.generation, 1);
		assert_eq!(stats.files_deleted, 0);

		assert_eq!(index.local_blob(Path::new("a.txt")).unwrap(), Some(digest(7)));
		assert_eq!(index.blob(digest(7)).unwrap().unwrap().size, 2);
		assert_eq!(index.local_file(Path::new("a.txt")).unwrap().unwrap().generation, 1);
	}

	#[test]
	fn test_apply_scan_sweeps_unvisited_rows() {
		let tmp = TempDir::new().unwrap();
		let index = open_index(&tmp);

		let key_a = path_key(Path::new("a.txt"));
		let key_b = path_key(Path::new("b.txt"));

		let mut batch = ScanBatch::default();
		batch.visited.insert(key_a.clone());
		batch.visited.insert(key_b.clone());
		batch.upserts.push((key_a.clone(), local_row(1)));
		batch.upserts.push((key_b.clone(), local_row(1)));
		batch.hashed.push((key_a.clone(), digest(1), 1));
		batch.hashed.push((key_b.clone(), digest(2), 1));
		index.apply_scan(batch).unwrap();

		// Second scan only sees a.txt
		let mut batch = ScanBatch::default();
		batch.visited.insert(key_a.clone());
		let stats = index.apply_scan(batch).unwrap();

		assert_eq!(stats.files_deleted, 1);
		assert!(index.local_file(Path::new("b.txt")).unwrap().is_none());
		assert!(index.local_blob(Path::new("b.txt")).unwrap().is_none());
		// The blob row survives until purged
		assert!(index.blob(digest(2)).unwrap().is_some());

		assert_eq!(index.purge_unreferenced().unwrap(), 1);
		assert!(index.blob(digest(2)).unwrap().is_none());
		assert!(index.blob(digest(1)).unwrap().is_some());
	}

	#[test]
	fn test_hash_mismatch_aborts_whole_batch() {
		let tmp = TempDir::new().unwrap();
		let index = open_index(&tmp);

		index.get_or_create_blob(digest(9), 5).unwrap();

		let key_a = path_key(Path::new("a.txt"));
		let key_b = path_key(Path::new("b.txt"));
		let mut batch = ScanBatch::default();
		batch.visited.insert(key_a.clone());
		batch.visited.insert(key_b.clone());
		batch.upserts.push((key_a.clone(), local_row(3)));
		batch.upserts.push((key_b.clone(), local_row(6)));
		batch.hashed.push((key_a.clone(), digest(8), 3));
		// Same digest as the preexisting blob, different size
		batch.hashed.push((key_b.clone(), digest(9), 6));

		assert!(matches!(
			index.apply_scan(batch),
			Err(StoreError::HashMismatch { .. })
		));

		// Nothing from the batch was applied
		assert_eq!(index.generation().unwrap(), 0);
		assert!(index.local_file(Path::new("a.txt")).unwrap().is_none());
		assert!(index.blob(digest(8)).unwrap().is_none());
	}

	#[test]
	fn test_purge_spares_bundled_blobs() {
		let tmp = TempDir::new().unwrap();
		let index = open_index(&tmp);

		index.get_or_create_blob(digest(1), 4).unwrap();

		// Reserve the blob for a bundle by hand
		let write_txn = index.db.begin_write().unwrap();
		{
			let mut blobs = write_txn.open_table(BLOBS).unwrap();
			let row = BlobRow { size: 4, bundle: Some(uuid::Uuid::new_v4()) };
			blobs
				.insert(digest(1).as_bytes().as_slice(), encode(&row).unwrap().as_slice())
				.unwrap();
		}
		write_txn.commit().unwrap();

		assert_eq!(index.purge_unreferenced().unwrap(), 0);
		assert!(index.blob(digest(1)).unwrap().is_some());
	}

	#[test]
	fn test_remove_remote_cascades_link() {
		let tmp = TempDir::new().unwrap();
		let index = open_index(&tmp);

		let key = path_key(Path::new("gone.txt"));
		let write_txn = index.db.begin_write().unwrap();
		{
			let mut files = write_txn.open_table(REMOTE_FILES).unwrap();
			let mut links = write_txn.open_table(REMOTE_FILE_BLOBS).unwrap();
			let row = RemoteFileRow {
				kind: FileKind::Regular,
				size: 1,
				mtime: 0,
				executable: false,
				link_target: None,
			};
			files.insert(key.as_slice(), encode(&row).unwrap().as_slice()).unwrap();
			links.insert(key.as_slice(), digest(3).as_bytes().as_slice()).unwrap();
		}
		write_txn.commit().unwrap();

		assert!(index.remove_remote(Path::new("gone.txt")).unwrap());
		assert!(index.remote_file(Path::new("gone.txt")).unwrap().is_none());
		assert!(index.remote_links().unwrap().is_empty());
		assert!(!index.remove_remote(Path::new("gone.txt")).unwrap());
	}
}

// vim: ts=4
