//! Full replication cycle orchestration
//!
//! Data flows one direction per cycle:
//! filesystem -> local index -> blob store -> bundle -> transport ->
//! remote index. The cycle stops at the first fatal error; a transport
//! failure leaves the scheduled bundle pending for a later retry.

use std::path::Path;

use crate::bundle::BundleManager;
use crate::config::Config;
use crate::diff;
use crate::error::ReplicatorError;
use crate::logging::*;
use crate::scan;
use crate::store::Index;
use crate::transport::Transport;
use crate::types::{BundleId, ScanSummary};

/// Outcome of one push cycle
#[derive(Debug)]
pub struct PushReport {
	pub scan: ScanSummary,
	/// Bundle created this cycle, if anything needed transfer
	pub bundle: Option<BundleId>,
	pub blobs_sent: usize,
	pub remote_files_updated: usize,
	pub blobs_purged: usize,
}

/// Scan the tree, bundle every blob that is not yet confirmed remote,
/// upload the bundle and confirm it.
pub async fn push_cycle(
	index: &Index,
	config: &Config,
	root: &Path,
	transport: &dyn Transport,
) -> Result<PushReport, ReplicatorError> {
	let scan_summary = scan::scan(index, config, root).await?;

	let mut report = PushReport {
		scan: scan_summary,
		bundle: None,
		blobs_sent: 0,
		remote_files_updated: 0,
		blobs_purged: 0,
	};

	let pending = diff::blobs_needing_transfer(index)?;
	if pending.is_empty() {
		info!("Nothing to transfer");
	} else {
		let manager = BundleManager::new(index);
		let bundle = manager.schedule_for_transfer(&pending)?;
		let payload = manager.bundle_payload(bundle, root)?;

		// On upload failure the bundle stays pending: the error propagates
		// and the caller retries or resolves explicitly
		transport.upload(bundle, &payload).await?;

		let stats = manager.confirm_transferred(bundle)?;
		report.bundle = Some(bundle);
		report.blobs_sent = payload.len();
		report.remote_files_updated = stats.remote_files;
	}

	if config.purge_after_scan {
		report.blobs_purged = index.purge_unreferenced()?;
	}

	Ok(report)
}

// vim: ts=4
