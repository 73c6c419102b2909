//! Mark-and-sweep filesystem scan
//!
//! One scan cycle walks the tree, marks every path it sees, detects
//! metadata changes against the stored rows, re-hashes only the regular
//! files whose stat identity (size, mtime, ctime, inode) changed, and
//! applies everything - including the sweep of unmarked rows - in a single
//! write transaction. A crash before the commit leaves the index at the
//! previous scan's state; re-running the scan re-marks everything and
//! self-heals.
//!
//! Per-path problems (permission denied, file vanished mid-read, hard
//! links, sockets) never abort the cycle: the path is skipped and reported
//! in the summary. Only a hash-collision anomaly or a database error
//! aborts, with no effect on the stored state.
//!
//! Known limitation of the stat-identity shortcut: content rewritten
//! without changing size, mtime, ctime and inode is not detected.

use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use crate::config::Config;
use crate::error::ReplicatorError;
use crate::hashing;
use crate::logging::*;
use crate::store::{Index, ScanBatch};
use crate::types::{
	key_path, path_key, FileKind, FileMeta, LocalFileRow, ScanFailure, ScanSummary,
};

/// Build a [`FileMeta`] from a lstat result, rejecting kinds the index
/// does not model
fn meta_from_stat(abs: &Path, rel: &Path, md: &fs::Metadata) -> Result<FileMeta, String> {
	let file_type = md.file_type();

	let (kind, size, link_target) = if file_type.is_symlink() {
		let target = fs::read_link(abs).map_err(|e| format!("Cannot read link target: {}", e))?;
		(FileKind::Symlink, 0, Some(target))
	} else if file_type.is_dir() {
		(FileKind::Directory, 0, None)
	} else if file_type.is_file() {
		if md.nlink() > 1 {
			return Err("Hard links are not supported".to_string());
		}
		(FileKind::Regular, md.len(), None)
	} else {
		return Err("Unsupported file kind".to_string());
	};

	Ok(FileMeta {
		path: rel.to_path_buf(),
		kind,
		size,
		mtime: md.mtime(),
		ctime: md.ctime(),
		inode: md.ino(),
		executable: md.mode() & 0o100 != 0,
		link_target,
	})
}

/// The failing entry's path, when a walker error carries one. Walker
/// errors wrap each other, so unwrap until a path shows up.
fn walk_error_path(e: &ignore::Error) -> Option<&Path> {
	match e {
		ignore::Error::WithPath { path, .. } => Some(path),
		ignore::Error::WithDepth { err, .. } => walk_error_path(err),
		ignore::Error::WithLineNumber { err, .. } => walk_error_path(err),
		ignore::Error::Loop { child, .. } => Some(child),
		_ => None,
	}
}

/// Scan `root` and reconcile the local index with the live tree.
///
/// Returns a partial-success summary; see the module docs for the failure
/// model.
pub async fn scan(
	index: &Index,
	config: &Config,
	root: &Path,
) -> Result<ScanSummary, ReplicatorError> {
	let snapshot = index.local_tree()?;
	let exclude = config.exclude_set()?;

	let mut summary = ScanSummary::default();
	let mut visited: BTreeSet<Vec<u8>> = BTreeSet::new();
	let mut upserts: Vec<(Vec<u8>, LocalFileRow)> = Vec::new();
	let mut unlink: Vec<Vec<u8>> = Vec::new();
	// (absolute path, path key) of files whose content must be hashed
	let mut to_hash: Vec<(std::path::PathBuf, Vec<u8>)> = Vec::new();

	let mut builder = ignore::WalkBuilder::new(root);
	builder
		.hidden(false)
		.parents(false)
		.ignore(false)
		.git_ignore(config.respect_ignore_files)
		.git_global(false)
		.git_exclude(false)
		.follow_links(false);

	let filter_root = root.to_path_buf();
	let walker = builder
		.filter_entry(move |entry| match entry.path().strip_prefix(&filter_root) {
			Ok(rel) => rel.as_os_str().is_empty() || !exclude.is_match(rel),
			Err(_) => true,
		})
		.build();

	for result in walker {
		let entry = match result {
			Ok(entry) => entry,
			Err(e) => {
				let path = walk_error_path(&e)
					.map(|p| p.strip_prefix(root).unwrap_or(p).to_path_buf())
					.unwrap_or_else(|| root.to_path_buf());
				summary.failed.push(ScanFailure { path, error: e.to_string() });
				continue;
			}
		};
		if entry.depth() == 0 {
			// The root itself is not indexed
			continue;
		}

		let abs = entry.path();
		let rel = match abs.strip_prefix(root) {
			Ok(rel) => rel,
			Err(e) => {
				summary
					.failed
					.push(ScanFailure { path: abs.to_path_buf(), error: e.to_string() });
				continue;
			}
		};

		let md = match fs::symlink_metadata(abs) {
			Ok(md) => md,
			Err(e) => {
				summary
					.failed
					.push(ScanFailure { path: rel.to_path_buf(), error: e.to_string() });
				continue;
			}
		};

		let meta = match meta_from_stat(abs, rel, &md) {
			Ok(meta) => meta,
			Err(error) => {
				summary.failed.push(ScanFailure { path: rel.to_path_buf(), error });
				continue;
			}
		};

		let key = path_key(rel);
		visited.insert(key.clone());
		summary.files_seen += 1;

		match snapshot.get(&key) {
			Some(row) if row.same_meta(&meta) => {
				// Unchanged: the mark is enough, no row write and no hashing
			}
			Some(row) => {
				let kind_changed = row.kind != meta.kind;
				if kind_changed {
					// Kind is part of identity: delete + recreate. The old
					// blob link (if any) is dropped rather than carried over.
					debug!("{:?}: kind changed {} -> {}", rel, row.kind, meta.kind);
					if row.kind == FileKind::Regular {
						unlink.push(key.clone());
					}
				}
				upserts.push((key.clone(), LocalFileRow::from_meta(&meta, 0)));

				if meta.kind == FileKind::Regular
					&& (kind_changed || !row.same_content_identity(&meta))
				{
					to_hash.push((abs.to_path_buf(), key.clone()));
				}
			}
			None => {
				upserts.push((key.clone(), LocalFileRow::from_meta(&meta, 0)));
				if meta.kind == FileKind::Regular {
					to_hash.push((abs.to_path_buf(), key.clone()));
				}
			}
		}
	}

	// Hash dirty files through a bounded worker pool. Hashing is the
	// CPU-bound part of the cycle, so it runs on blocking threads while the
	// walk results are already in memory. The blob size is the byte count
	// hash_file actually read, not the stat-time size: a file rewritten in
	// between must not pair a foreign size with its digest.
	let parallel = config.parallel_hashing.max(1);
	let hash_results: Vec<(Vec<u8>, Result<(crate::types::Digest, u64), String>)> =
		stream::iter(to_hash.into_iter().map(|(abs, key)| async move {
			let joined = tokio::task::spawn_blocking(move || hashing::hash_file(&abs)).await;
			let result = match joined {
				Ok(hashed) => hashed.map_err(|e| e.to_string()),
				Err(e) => Err(e.to_string()),
			};
			(key, result)
		}))
		.buffer_unordered(parallel)
		.collect()
		.await;

	let mut hashed = Vec::new();
	let mut hash_failed: BTreeSet<Vec<u8>> = BTreeSet::new();
	for (key, result) in hash_results {
		match result {
			Ok((digest, size)) => hashed.push((key, digest, size)),
			Err(error) => {
				warn!("{:?}: hashing failed: {}", key_path(&key), error);
				summary.failed.push(ScanFailure { path: key_path(&key), error });
				hash_failed.insert(key);
			}
		}
	}

	// A file whose content could not be read keeps its previous row (it
	// stays marked, so it is not swept) and will be retried next scan.
	if !hash_failed.is_empty() {
		upserts.retain(|(key, _)| !hash_failed.contains(key));
	}

	summary.files_updated = upserts.len();
	summary.files_hashed = hashed.len();

	let stats = index.apply_scan(ScanBatch { visited, upserts, hashed, unlink })?;
	summary.files_deleted = stats.files_deleted;

	info!(
		"Scan generation {}: {} seen, {} updated, {} hashed, {} deleted, {} failed",
		stats.generation,
		summary.files_seen,
		summary.files_updated,
		summary.files_hashed,
		summary.files_deleted,
		summary.failed.len()
	);

	Ok(summary)
}


// vim: ts=4
