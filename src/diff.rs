//! Local vs. remote index comparison
//!
//! The remote tree is never scanned live; it only changes on bundle
//! confirmation or explicit removal. The diff is therefore a pure
//! path-keyed comparison of the two stored trees.

use std::collections::BTreeSet;

use crate::error::StoreError;
use crate::store::Index;
use crate::types::{key_path, DiffReport, Digest};

/// Compare the local and remote trees path by path
pub fn diff(index: &Index) -> Result<DiffReport, StoreError> {
	let local = index.local_tree()?;
	let remote = index.remote_tree()?;
	let local_links = index.local_links()?;
	let remote_links = index.remote_links()?;

	let mut report = DiffReport::default();

	for (key, local_row) in &local {
		match remote.get(key) {
			None => report.added.push(key_path(key)),
			Some(remote_row) => {
				let changed = local_row.kind != remote_row.kind
					|| local_row.size != remote_row.size
					|| local_row.mtime != remote_row.mtime
					|| local_row.executable != remote_row.executable
					|| local_row.link_target != remote_row.link_target
					|| local_links.get(key) != remote_links.get(key);
				if changed {
					report.modified.push(key_path(key));
				}
			}
		}
	}

	for key in remote.keys() {
		if !local.contains_key(key) {
			report.deleted.push(key_path(key));
		}
	}

	Ok(report)
}

/// Digests referenced by local files but not yet confirmed remotely and
/// not reserved by a pending bundle. This is the set the next bundle
/// should carry.
pub fn blobs_needing_transfer(index: &Index) -> Result<Vec<Digest>, StoreError> {
	let local: BTreeSet<Digest> = index.local_links()?.values().copied().collect();
	let remote: BTreeSet<Digest> = index.remote_links()?.values().copied().collect();

	let mut out = Vec::new();
	for digest in local.difference(&remote) {
		match index.blob(*digest)? {
			Some(row) => {
				if row.bundle.is_none() {
					out.push(*digest);
				}
			}
			None => {
				return Err(StoreError::ConstraintViolation {
					message: format!("Local file link references missing blob {}", digest),
				})
			}
		}
	}
	Ok(out)
}

// vim: ts=4
