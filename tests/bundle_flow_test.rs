/// Bundle and push-cycle integration tests
///
/// Cover the transfer side: scheduling blobs into bundles, uploading
/// through a transport, confirming delivery and the remote index catching
/// up, plus the failure modes that must leave no partial state behind.
use async_trait::async_trait;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

use replicator::bundle::BundleManager;
use replicator::config::Config;
use replicator::diff;
use replicator::error::ReplicatorError;
use replicator::hashing;
use replicator::scan::scan;
use replicator::store::Index;
use replicator::sync::push_cycle;
use replicator::transport::{DirTransport, Transport};
use replicator::types::{BlobSource, BundleId, FileKind};

fn test_config() -> Config {
	Config { parallel_hashing: 2, ..Config::default() }
}

fn open_index(state: &TempDir) -> Index {
	Index::open(&state.path().join("index.redb")).unwrap()
}

fn create_file(dir: &Path, name: &str, content: &str) {
	fs::write(dir.join(name), content).unwrap();
}

/// Transport that always fails, for pending-bundle behavior
struct BrokenTransport;

#[async_trait]
impl Transport for BrokenTransport {
	async fn upload(
		&self,
		_bundle: BundleId,
		_payload: &[BlobSource],
	) -> Result<(), ReplicatorError> {
		Err(ReplicatorError::Transport { message: "wire cut".to_string() })
	}
}

#[tokio::test]
async fn test_push_cycle_end_to_end() {
	let state = TempDir::new().unwrap();
	let tree = TempDir::new().unwrap();
	let target = TempDir::new().unwrap();
	let index = open_index(&state);

	create_file(tree.path(), "a.txt", "shared content");
	create_file(tree.path(), "b.txt", "shared content");
	create_file(tree.path(), "c.txt", "unique content");

	let transport = DirTransport::new(target.path());
	let report = push_cycle(&index, &test_config(), tree.path(), &transport).await.unwrap();

	// Two distinct contents -> two blobs uploaded, despite three files
	assert!(report.bundle.is_some());
	assert_eq!(report.blobs_sent, 2);
	assert_eq!(report.remote_files_updated, 3);

	let shared = hashing::hash_bytes(b"shared content");
	let unique = hashing::hash_bytes(b"unique content");
	assert_eq!(
		fs::read(target.path().join(shared.to_hex())).unwrap(),
		b"shared content"
	);
	assert_eq!(
		fs::read(target.path().join(unique.to_hex())).unwrap(),
		b"unique content"
	);

	// Remote index caught up with every referencing local file
	for name in ["a.txt", "b.txt", "c.txt"] {
		let local = index.local_file(Path::new(name)).unwrap().unwrap();
		let remote = index.remote_file(Path::new(name)).unwrap().unwrap();
		assert_eq!(remote.kind, FileKind::Regular);
		assert_eq!(remote.size, local.size);
		assert_eq!(remote.mtime, local.mtime);
		assert_eq!(remote.executable, local.executable);
	}

	// The bundle row remains as audit trail, transferred
	let (id, row) = &index.bundles().unwrap()[0];
	assert_eq!(Some(*id), report.bundle);
	assert!(row.transferred);

	// Second cycle with no changes schedules nothing
	let report = push_cycle(&index, &test_config(), tree.path(), &transport).await.unwrap();
	assert!(report.bundle.is_none());
	assert_eq!(report.scan.files_hashed, 0);
}

#[tokio::test]
async fn test_failed_upload_leaves_bundle_pending() {
	let state = TempDir::new().unwrap();
	let tree = TempDir::new().unwrap();
	let index = open_index(&state);

	create_file(tree.path(), "a.txt", "undelivered");

	let err = push_cycle(&index, &test_config(), tree.path(), &BrokenTransport).await;
	assert!(matches!(err, Err(ReplicatorError::Transport { .. })));

	// The bundle exists and is still pending; the blob stays reserved
	let bundles = index.bundles().unwrap();
	assert_eq!(bundles.len(), 1);
	assert!(!bundles[0].1.transferred);

	let digest = hashing::hash_bytes(b"undelivered");
	assert_eq!(index.blob(digest).unwrap().unwrap().bundle, Some(bundles[0].0));

	// Reserved blobs are not selected again
	assert!(diff::blobs_needing_transfer(&index).unwrap().is_empty());

	// Nothing reached the remote index
	assert!(index.remote_file(Path::new("a.txt")).unwrap().is_none());

	// Retrying means confirming (or reassigning) the pending bundle
	let manager = BundleManager::new(&index);
	manager.confirm_transferred(bundles[0].0).unwrap();
	assert!(index.remote_file(Path::new("a.txt")).unwrap().is_some());
}

#[tokio::test]
async fn test_payload_picks_smallest_referencing_path() {
	let state = TempDir::new().unwrap();
	let tree = TempDir::new().unwrap();
	let index = open_index(&state);

	create_file(tree.path(), "zz.txt", "twice held");
	create_file(tree.path(), "aa.txt", "twice held");
	scan(&index, &test_config(), tree.path()).await.unwrap();

	let manager = BundleManager::new(&index);
	let pending = diff::blobs_needing_transfer(&index).unwrap();
	let bundle = manager.schedule_for_transfer(&pending).unwrap();

	let payload = manager.bundle_payload(bundle, tree.path()).unwrap();
	assert_eq!(payload.len(), 1);
	assert!(payload[0].path.ends_with("aa.txt"));
	assert_eq!(payload[0].size, "twice held".len() as u64);
}

#[tokio::test]
async fn test_payload_missing_content_is_an_error() {
	let state = TempDir::new().unwrap();
	let index = open_index(&state);

	// Blob registered out of band, no local file holds it
	let digest = hashing::hash_bytes(b"ghost");
	index.get_or_create_blob(digest, 5).unwrap();

	let manager = BundleManager::new(&index);
	let bundle = manager.schedule_for_transfer(&[digest]).unwrap();

	let err = manager.bundle_payload(bundle, Path::new("/")).unwrap_err();
	assert!(matches!(err, replicator::BundleError::MissingContent { .. }));
}

#[tokio::test]
async fn test_diff_tracks_added_modified_deleted() {
	let state = TempDir::new().unwrap();
	let tree = TempDir::new().unwrap();
	let target = TempDir::new().unwrap();
	let index = open_index(&state);

	create_file(tree.path(), "a.txt", "first");
	create_file(tree.path(), "b.txt", "second");

	// Before any transfer everything is an addition
	scan(&index, &test_config(), tree.path()).await.unwrap();
	let report = diff::diff(&index).unwrap();
	assert_eq!(report.added.len(), 2);
	assert!(report.modified.is_empty());
	assert!(report.deleted.is_empty());

	let transport = DirTransport::new(target.path());
	push_cycle(&index, &test_config(), tree.path(), &transport).await.unwrap();
	let report = diff::diff(&index).unwrap();
	assert!(report.added.is_empty());
	assert!(report.modified.is_empty());

	// Change one file, remove the other
	create_file(tree.path(), "a.txt", "first, edited");
	fs::remove_file(tree.path().join("b.txt")).unwrap();
	scan(&index, &test_config(), tree.path()).await.unwrap();

	let report = diff::diff(&index).unwrap();
	assert_eq!(report.modified, vec![Path::new("a.txt").to_path_buf()]);
	assert_eq!(report.deleted, vec![Path::new("b.txt").to_path_buf()]);
}

#[tokio::test]
async fn test_remove_remote_makes_content_pending_again() {
	let state = TempDir::new().unwrap();
	let tree = TempDir::new().unwrap();
	let target = TempDir::new().unwrap();
	let index = open_index(&state);

	create_file(tree.path(), "a.txt", "resend me");

	let transport = DirTransport::new(target.path());
	push_cycle(&index, &test_config(), tree.path(), &transport).await.unwrap();
	assert!(diff::blobs_needing_transfer(&index).unwrap().is_empty());

	assert!(index.remove_remote(Path::new("a.txt")).unwrap());

	let pending = diff::blobs_needing_transfer(&index).unwrap();
	assert_eq!(pending, vec![hashing::hash_bytes(b"resend me")]);
	// The blob row itself survived: the local file still references it
	assert_eq!(index.purge_unreferenced().unwrap(), 0);
}

#[tokio::test]
async fn test_reupload_after_local_and_remote_removal() {
	let state = TempDir::new().unwrap();
	let tree = TempDir::new().unwrap();
	let target = TempDir::new().unwrap();
	let index = open_index(&state);

	create_file(tree.path(), "a.txt", "short lived");
	let transport = DirTransport::new(target.path());
	push_cycle(&index, &test_config(), tree.path(), &transport).await.unwrap();

	// The file disappears locally and is forgotten remotely
	fs::remove_file(tree.path().join("a.txt")).unwrap();
	scan(&index, &test_config(), tree.path()).await.unwrap();
	index.remove_remote(Path::new("a.txt")).unwrap();

	// Now the blob is fully unreferenced and purge-eligible
	assert_eq!(index.purge_unreferenced().unwrap(), 1);
	assert!(index.blob(hashing::hash_bytes(b"short lived")).unwrap().is_none());
}

// vim: ts=4
