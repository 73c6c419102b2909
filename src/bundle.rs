//! Bundle manager
//!
//! Bundles group not-yet-transferred blobs into one transfer unit.
//! Scheduling and confirmation are single write transactions: an error
//! drops the transaction uncommitted, so a bundle is never half-assigned
//! and a confirmation never applies partially. Bundle rows persist after
//! transfer as an audit trail.

use redb::ReadableTable;
use std::collections::BTreeSet;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::error::{BundleError, StoreError};
use crate::logging::*;
use crate::store::{
	blob_get_or_create, decode, encode, Index, BLOBS, BUNDLES, LOCAL_FILES, LOCAL_FILE_BLOBS,
	REMOTE_FILES, REMOTE_FILE_BLOBS,
};
use crate::types::{
	key_path, BlobRow, BlobSource, BundleId, BundleRow, Digest, LocalFileRow, RemoteFileRow,
};

fn unix_now() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// What a confirmation updated
#[derive(Debug)]
pub struct ConfirmStats {
	/// Blobs whose pending assignment was cleared
	pub blobs: usize,
	/// Remote file rows upserted to mirror local referencing files
	pub remote_files: usize,
}

/// Bundle operations over an open [`Index`]
pub struct BundleManager<'a> {
	index: &'a Index,
}

impl<'a> BundleManager<'a> {
	pub fn new(index: &'a Index) -> BundleManager<'a> {
		BundleManager { index }
	}

	/// Create a fresh empty bundle. Always succeeds; the id is a new
	/// UUIDv4, unique across past and future bundles.
	pub fn create_bundle(&self) -> Result<BundleId, BundleError> {
		let id = Uuid::new_v4();
		let write_txn = self.index.db.begin_write()?;
		{
			let mut bundles = write_txn.open_table(BUNDLES)?;
			let row = BundleRow { created: unix_now(), transferred: false, blobs: Vec::new() };
			bundles.insert(id.to_string().as_str(), encode(&row)?.as_slice())?;
		}
		write_txn.commit()?;

		debug!("Created bundle {}", id);
		Ok(id)
	}

	/// Create a bundle and assign every digest in `digests` to it, all or
	/// nothing. Fails with `PartiallyBundled` if any blob already belongs
	/// to a different pending bundle - the caller must resolve that bundle
	/// first; nothing is merged implicitly and nothing is assigned on
	/// failure.
	pub fn schedule_for_transfer(&self, digests: &[Digest]) -> Result<BundleId, BundleError> {
		let mut members: Vec<Digest> = Vec::new();
		let mut seen: BTreeSet<Digest> = BTreeSet::new();
		for digest in digests {
			if seen.insert(*digest) {
				members.push(*digest);
			}
		}

		let id = Uuid::new_v4();
		let write_txn = self.index.db.begin_write()?;
		{
			let mut blobs = write_txn.open_table(BLOBS)?;
			let mut bundles = write_txn.open_table(BUNDLES)?;

			// Verify the whole set before assigning anything
			let mut rows: Vec<(Digest, BlobRow)> = Vec::new();
			for digest in &members {
				let row: BlobRow = match blobs.get(digest.as_bytes().as_slice())? {
					Some(guard) => decode(guard.value())?,
					None => return Err(BundleError::UnknownBlob { digest: *digest }),
				};
				if let Some(pending) = row.bundle {
					// A set bundle field always means a pending transfer;
					// confirmation clears it
					return Err(BundleError::PartiallyBundled {
						digest: *digest,
						bundle: pending,
					});
				}
				rows.push((*digest, row));
			}

			for (digest, mut row) in rows {
				row.bundle = Some(id);
				blobs.insert(digest.as_bytes().as_slice(), encode(&row)?.as_slice())?;
			}

			let row = BundleRow { created: unix_now(), transferred: false, blobs: members.clone() };
			bundles.insert(id.to_string().as_str(), encode(&row)?.as_slice())?;
		}
		write_txn.commit()?;

		info!("Scheduled {} blobs into bundle {}", members.len(), id);
		Ok(id)
	}

	/// Assign one blob to an existing pending bundle. Fails with
	/// `AlreadyBundled` if the blob is reserved by a different pending
	/// bundle, unless `reassign` is set - then the blob moves and is
	/// removed from the old bundle's member list.
	pub fn assign_to_bundle(
		&self,
		digest: Digest,
		bundle: BundleId,
		reassign: bool,
	) -> Result<(), BundleError> {
		let write_txn = self.index.db.begin_write()?;
		{
			let mut blobs = write_txn.open_table(BLOBS)?;
			let mut bundles = write_txn.open_table(BUNDLES)?;

			let mut target: BundleRow = match bundles.get(bundle.to_string().as_str())? {
				Some(guard) => decode(guard.value())?,
				None => return Err(BundleError::UnknownBundle { bundle }),
			};
			if target.transferred {
				return Err(BundleError::Store(StoreError::ConstraintViolation {
					message: format!("Bundle {} is already transferred", bundle),
				}));
			}

			let mut row: BlobRow = match blobs.get(digest.as_bytes().as_slice())? {
				Some(guard) => decode(guard.value())?,
				None => return Err(BundleError::UnknownBlob { digest }),
			};

			if let Some(current) = row.bundle {
				if current == bundle {
					// Nothing was written; dropping the transaction is enough
					return Ok(());
				}
				if !reassign {
					return Err(BundleError::AlreadyBundled { digest, bundle: current });
				}
				// Drop the digest from the old pending bundle's member list
				let old_key = current.to_string();
				let old_row: Option<BundleRow> = match bundles.get(old_key.as_str())? {
					Some(guard) => Some(decode(guard.value())?),
					None => None,
				};
				if let Some(mut old_row) = old_row {
					old_row.blobs.retain(|d| *d != digest);
					bundles.insert(old_key.as_str(), encode(&old_row)?.as_slice())?;
				}
			}

			row.bundle = Some(bundle);
			blobs.insert(digest.as_bytes().as_slice(), encode(&row)?.as_slice())?;

			if !target.blobs.contains(&digest) {
				target.blobs.push(digest);
			}
			bundles.insert(bundle.to_string().as_str(), encode(&target)?.as_slice())?;
		}
		write_txn.commit()?;
		Ok(())
	}

	/// Mark a bundle delivered: clear the pending assignment of every
	/// member blob and mirror every local file referencing a member blob
	/// into the remote tree (row + blob link). This is how the remote
	/// index catches up after a successful upload. All or nothing.
	///
	/// Re-confirming an already transferred bundle is allowed and simply
	/// re-mirrors the referencing local files.
	pub fn confirm_transferred(&self, bundle: BundleId) -> Result<ConfirmStats, BundleError> {
		let write_txn = self.index.db.begin_write()?;
		let mut stats = ConfirmStats { blobs: 0, remote_files: 0 };
		{
			let mut bundles = write_txn.open_table(BUNDLES)?;
			let mut blobs = write_txn.open_table(BLOBS)?;
			let files = write_txn.open_table(LOCAL_FILES)?;
			let links = write_txn.open_table(LOCAL_FILE_BLOBS)?;
			let mut remote_files = write_txn.open_table(REMOTE_FILES)?;
			let mut remote_links = write_txn.open_table(REMOTE_FILE_BLOBS)?;

			let mut row: BundleRow = match bundles.get(bundle.to_string().as_str())? {
				Some(guard) => decode(guard.value())?,
				None => return Err(BundleError::UnknownBundle { bundle }),
			};

			// Snapshot the local links once; member blobs are usually a
			// small subset of them
			let mut local_links: Vec<(Vec<u8>, Digest)> = Vec::new();
			{
				let mut iter = links.iter().map_err(StoreError::from)?;
				loop {
					match iter.next() {
						Some(Ok((key, value))) => {
							let digest = Digest::from_slice(value.value())
								.map_err(|message| StoreError::Corrupted { message })?;
							local_links.push((key.value().to_vec(), digest));
						}
						None => break,
						Some(Err(e)) => return Err(BundleError::from(StoreError::from(e))),
					}
				}
			}

			for digest in &row.blobs {
				let blob_row: Option<BlobRow> = match blobs.get(digest.as_bytes().as_slice())? {
					Some(guard) => Some(decode(guard.value())?),
					None => None,
				};
				if let Some(mut blob_row) = blob_row {
					if blob_row.bundle == Some(bundle) {
						blob_row.bundle = None;
						blobs.insert(digest.as_bytes().as_slice(), encode(&blob_row)?.as_slice())?;
						stats.blobs += 1;
					}
				}

				for (key, linked) in &local_links {
					if linked != digest {
						continue;
					}
					let local_row: LocalFileRow = match files.get(key.as_slice())? {
						Some(guard) => decode(guard.value())?,
						None => {
							return Err(BundleError::Store(StoreError::ConstraintViolation {
								message: format!(
									"Blob link without file row: {:?}",
									key_path(key)
								),
							}))
						}
					};
					let remote_row = RemoteFileRow::from_local(&local_row);
					remote_files.insert(key.as_slice(), encode(&remote_row)?.as_slice())?;
					remote_links.insert(key.as_slice(), digest.as_bytes().as_slice())?;
					stats.remote_files += 1;
				}
			}

			row.transferred = true;
			bundles.insert(bundle.to_string().as_str(), encode(&row)?.as_slice())?;
		}
		write_txn.commit()?;

		info!(
			"Bundle {} confirmed: {} blobs released, {} remote files updated",
			bundle, stats.blobs, stats.remote_files
		);
		Ok(stats)
	}

	/// Payload for the transport: each member digest with its recorded
	/// size and the lexicographically smallest local path currently
	/// holding the content. Sorted by that path, matching upload order to
	/// directory order.
	pub fn bundle_payload(
		&self,
		bundle: BundleId,
		root: &Path,
	) -> Result<Vec<BlobSource>, BundleError> {
		let row = match self.index.bundle(bundle)? {
			Some(row) => row,
			None => return Err(BundleError::UnknownBundle { bundle }),
		};
		let links = self.index.local_links()?;

		let mut payload = Vec::new();
		for digest in &row.blobs {
			let blob_row = match self.index.blob(*digest)? {
				Some(blob_row) => blob_row,
				None => return Err(BundleError::UnknownBlob { digest: *digest }),
			};

			// BTreeMap iterates in key order, so the first link wins
			let holder = links.iter().find(|(_, linked)| *linked == digest);
			match holder {
				Some((key, _)) => payload.push(BlobSource {
					digest: *digest,
					size: blob_row.size,
					path: root.join(key_path(key)),
				}),
				None => return Err(BundleError::MissingContent { digest: *digest }),
			}
		}

		payload.sort_by(|a, b| a.path.cmp(&b.path));
		Ok(payload)
	}

	/// Register content that exists outside any scanned file (used by
	/// callers that inject blobs out of band)
	pub fn register_blob(&self, digest: Digest, size: u64) -> Result<(), BundleError> {
		let write_txn = self.index.db.begin_write()?;
		{
			let mut blobs = write_txn.open_table(BLOBS)?;
			blob_get_or_create(&mut blobs, digest, size)?;
		}
		write_txn.commit()?;
		Ok(())
	}
}


// vim: ts=4
