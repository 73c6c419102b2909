//! Error types for replicator operations

use std::error::Error;
use std::fmt;
use std::io;

use crate::types::{BundleId, Digest};

/// Errors raised by the persistent index (blob store + file tables)
#[derive(Debug)]
pub enum StoreError {
	/// An existing blob was observed with a different size than recorded.
	/// Two different contents produced the same digest; the index can no
	/// longer be trusted, so this is fatal and never auto-recovered.
	HashMismatch { digest: Digest, stored: u64, observed: u64 },

	/// Uniqueness or referential integrity broken - a logic bug, always fatal
	ConstraintViolation { message: String },

	/// A stored row could not be decoded
	Corrupted { message: String },

	/// Underlying database error
	Db(Box<dyn Error + Send + Sync>),
}

impl fmt::Display for StoreError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			StoreError::HashMismatch { digest, stored, observed } => {
				write!(
					f,
					"Hash collision anomaly for {}: recorded size {}, observed {}",
					digest, stored, observed
				)
			}
			StoreError::ConstraintViolation { message } => {
				write!(f, "Index constraint violation: {}", message)
			}
			StoreError::Corrupted { message } => write!(f, "Index corrupted: {}", message),
			StoreError::Db(e) => write!(f, "Database error: {}", e),
		}
	}
}

impl Error for StoreError {}

impl From<redb::DatabaseError> for StoreError {
	fn from(e: redb::DatabaseError) -> Self {
		StoreError::Db(Box::new(e))
	}
}

impl From<redb::TransactionError> for StoreError {
	fn from(e: redb::TransactionError) -> Self {
		StoreError::Db(Box::new(e))
	}
}

impl From<redb::TableError> for StoreError {
	fn from(e: redb::TableError) -> Self {
		StoreError::Db(Box::new(e))
	}
}

impl From<redb::StorageError> for StoreError {
	fn from(e: redb::StorageError) -> Self {
		StoreError::Db(Box::new(e))
	}
}

impl From<redb::CommitError> for StoreError {
	fn from(e: redb::CommitError) -> Self {
		StoreError::Db(Box::new(e))
	}
}

impl From<serde_json::Error> for StoreError {
	fn from(e: serde_json::Error) -> Self {
		StoreError::Corrupted { message: e.to_string() }
	}
}

/// Errors raised by bundle scheduling and confirmation.
///
/// These are caller-recoverable: the caller must resolve the conflict
/// explicitly (e.g. confirm or reassign the other bundle) and retry.
/// Nothing is retried automatically.
#[derive(Debug)]
pub enum BundleError {
	/// The blob is already assigned to another pending bundle
	AlreadyBundled { digest: Digest, bundle: BundleId },

	/// A bulk assignment hit a blob that belongs to a different pending
	/// bundle; no blob in the set was assigned
	PartiallyBundled { digest: Digest, bundle: BundleId },

	/// No bundle with this id exists
	UnknownBundle { bundle: BundleId },

	/// No blob with this digest exists
	UnknownBlob { digest: Digest },

	/// A bundle member is no longer held by any local file, so no payload
	/// can be produced for it
	MissingContent { digest: Digest },

	/// Index error (nested)
	Store(StoreError),
}

impl fmt::Display for BundleError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			BundleError::AlreadyBundled { digest, bundle } => {
				write!(f, "Blob {} is already assigned to bundle {}", digest, bundle)
			}
			BundleError::PartiallyBundled { digest, bundle } => {
				write!(
					f,
					"Blob {} belongs to pending bundle {}; nothing was scheduled",
					digest, bundle
				)
			}
			BundleError::UnknownBundle { bundle } => write!(f, "Unknown bundle: {}", bundle),
			BundleError::UnknownBlob { digest } => write!(f, "Unknown blob: {}", digest),
			BundleError::MissingContent { digest } => {
				write!(f, "No local file holds the content of blob {}", digest)
			}
			BundleError::Store(e) => write!(f, "Store error: {}", e),
		}
	}
}

impl Error for BundleError {}

impl From<StoreError> for BundleError {
	fn from(e: StoreError) -> Self {
		BundleError::Store(e)
	}
}

impl From<redb::TransactionError> for BundleError {
	fn from(e: redb::TransactionError) -> Self {
		BundleError::Store(e.into())
	}
}

impl From<redb::TableError> for BundleError {
	fn from(e: redb::TableError) -> Self {
		BundleError::Store(e.into())
	}
}

impl From<redb::StorageError> for BundleError {
	fn from(e: redb::StorageError) -> Self {
		BundleError::Store(e.into())
	}
}

impl From<redb::CommitError> for BundleError {
	fn from(e: redb::CommitError) -> Self {
		BundleError::Store(e.into())
	}
}

/// Top level error type for the library API and the CLI
#[derive(Debug)]
pub enum ReplicatorError {
	/// Index error (nested)
	Store(StoreError),

	/// Bundle error (nested)
	Bundle(BundleError),

	/// I/O error outside the per-path scan recovery
	Io(io::Error),

	/// Invalid configuration
	InvalidConfig { message: String },

	/// Transport failure; the bundle stays pending
	Transport { message: String },

	/// Generic error message
	Other { message: String },
}

impl fmt::Display for ReplicatorError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ReplicatorError::Store(e) => write!(f, "Store error: {}", e),
			ReplicatorError::Bundle(e) => write!(f, "Bundle error: {}", e),
			ReplicatorError::Io(e) => write!(f, "I/O error: {}", e),
			ReplicatorError::InvalidConfig { message } => {
				write!(f, "Invalid configuration: {}", message)
			}
			ReplicatorError::Transport { message } => write!(f, "Transport error: {}", message),
			ReplicatorError::Other { message } => write!(f, "{}", message),
		}
	}
}

impl Error for ReplicatorError {}

impl From<StoreError> for ReplicatorError {
	fn from(e: StoreError) -> Self {
		ReplicatorError::Store(e)
	}
}

impl From<BundleError> for ReplicatorError {
	fn from(e: BundleError) -> Self {
		ReplicatorError::Bundle(e)
	}
}

impl From<io::Error> for ReplicatorError {
	fn from(e: io::Error) -> Self {
		ReplicatorError::Io(e)
	}
}

impl From<String> for ReplicatorError {
	fn from(e: String) -> Self {
		ReplicatorError::Other { message: e }
	}
}

// vim: ts=4
