//! Transport seam for uploading bundle payloads
//!
//! The core never talks to the network itself: it hands a bundle's
//! payload to a [`Transport`] and expects the caller to confirm the
//! bundle afterwards. A failed upload leaves the bundle pending; there is
//! no automatic rollback.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs as afs;
use tokio::io::AsyncWriteExt;

use crate::error::ReplicatorError;
use crate::logging::*;
use crate::types::{BlobSource, BundleId};

const TMP_SUFFIX: &str = ".rpl-tmp";

#[async_trait]
pub trait Transport: Send + Sync {
	/// Upload every blob of a bundle. The payload paths are live local
	/// files; content must be streamed, never buffered whole.
	async fn upload(
		&self,
		bundle: BundleId,
		payload: &[BlobSource],
	) -> Result<(), ReplicatorError>;
}

/// Reference transport: copies blob content into a directory, one file
/// per digest. Used by the CLI's `push` and by tests; a real remote
/// backend implements [`Transport`] the same way.
pub struct DirTransport {
	target: PathBuf,
}

impl DirTransport {
	pub fn new(target: &Path) -> DirTransport {
		DirTransport { target: target.to_path_buf() }
	}

	/// Where a blob lands in the target directory
	pub fn blob_path(&self, digest: &crate::types::Digest) -> PathBuf {
		self.target.join(digest.to_hex())
	}
}

#[async_trait]
impl Transport for DirTransport {
	async fn upload(
		&self,
		bundle: BundleId,
		payload: &[BlobSource],
	) -> Result<(), ReplicatorError> {
		afs::create_dir_all(&self.target).await?;

		for blob in payload {
			let dest = self.blob_path(&blob.digest);
			if afs::metadata(&dest).await.is_ok() {
				// Content-addressed: an existing file is the same content
				debug!("Blob {} already present at target", blob.digest);
				continue;
			}

			let tmp = self.target.join(format!("{}{}", blob.digest.to_hex(), TMP_SUFFIX));
			let mut src = afs::File::open(&blob.path).await.map_err(|e| {
				ReplicatorError::Transport {
					message: format!("Cannot open {}: {}", blob.path.display(), e),
				}
			})?;
			let mut dst = afs::File::create(&tmp).await?;
			tokio::io::copy(&mut src, &mut dst).await?;
			dst.flush().await?;
			afs::rename(&tmp, &dest).await?;
		}

		debug!("Uploaded {} blobs for bundle {}", payload.len(), bundle);
		Ok(())
	}
}


// vim: ts=4
