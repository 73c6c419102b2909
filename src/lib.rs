//! # Replicator - content-addressed deduplicating directory replication
//!
//! Replicator keeps a local index of a directory tree, deduplicates file
//! content into a hash-keyed blob store, groups untransferred blobs into
//! bundles and tracks which files are confirmed present on the remote
//! side. Scans re-hash only files whose stat identity changed; everything
//! that mutates the index happens in single transactions.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use replicator::{scan, store::Index, Config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let index = Index::open(std::path::Path::new("index.redb"))?;
//!     let summary = replicator::scan::scan(&index, &config, std::path::Path::new("./data")).await?;
//!     println!("{} files hashed", summary.files_hashed);
//!     Ok(())
//! }
//! ```

pub mod bundle;
pub mod config;
pub mod diff;
pub mod error;
pub mod hashing;
pub mod logging;
pub mod scan;
pub mod store;
pub mod sync;
pub mod transport;
pub mod types;

// Re-export commonly used types and functions
pub use bundle::BundleManager;
pub use config::Config;
pub use error::{BundleError, ReplicatorError, StoreError};
pub use store::Index;
pub use types::{BlobSource, BundleId, Digest, DiffReport, FileKind, ScanSummary};

// vim: ts=4
