//! Configuration for replicator
//!
//! A profile is a named index + settings pair living under the replicator
//! state directory (`~/.replicator` by default). Settings come from an
//! optional json5 file `<profile>.profile.json5`; missing files fall back
//! to the built-in defaults, CLI flags override loaded values.

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ReplicatorError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
	/// Home directory for replicator state (~/.replicator)
	pub replicator_dir: PathBuf,

	/// Profile name for index and settings isolation
	pub profile: String,

	/// Glob patterns excluded from scans (e.g. "*.tmp", "target/**")
	pub exclude_patterns: Vec<String>,

	/// Honor .gitignore files during the walk
	pub respect_ignore_files: bool,

	/// Number of parallel hashing workers
	pub parallel_hashing: usize,

	/// Run the orphan blob purge after every scan
	pub purge_after_scan: bool,
}

impl Default for Config {
	fn default() -> Config {
		Config {
			replicator_dir: PathBuf::new(),
			profile: "default".to_string(),
			exclude_patterns: Vec::new(),
			respect_ignore_files: false,
			parallel_hashing: 4,
			purge_after_scan: false,
		}
	}
}

impl Config {
	/// Load the profile settings file if present, otherwise defaults.
	/// `replicator_dir` and `profile` always reflect the arguments, not the
	/// file content.
	pub fn load(replicator_dir: &Path, profile: &str) -> Result<Config, ReplicatorError> {
		let path = replicator_dir.join(format!("{}.profile.json5", profile));

		let mut config = if path.exists() {
			let contents = std::fs::read_to_string(&path)?;
			json5::from_str(&contents).map_err(|e| ReplicatorError::InvalidConfig {
				message: format!("{}: {}", path.display(), e),
			})?
		} else {
			Config::default()
		};

		config.replicator_dir = replicator_dir.to_path_buf();
		config.profile = profile.to_string();
		Ok(config)
	}

	/// Path of the profile's index database
	pub fn db_path(&self) -> PathBuf {
		self.replicator_dir.join(format!("{}.index.redb", self.profile))
	}

	/// Compiled exclusion matcher
	pub fn exclude_set(&self) -> Result<GlobSet, ReplicatorError> {
		let mut builder = GlobSetBuilder::new();
		for pattern in &self.exclude_patterns {
			let glob = Glob::new(pattern).map_err(|e| ReplicatorError::InvalidConfig {
				message: format!("Bad exclude pattern '{}': {}", pattern, e),
			})?;
			builder.add(glob);
		}
		builder
			.build()
			.map_err(|e| ReplicatorError::InvalidConfig { message: e.to_string() })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[test]
	fn test_defaults() {
		let config = Config::default();
		assert_eq!(config.profile, "default");
		assert!(!config.respect_ignore_files);
		assert!(config.parallel_hashing > 0);
	}

	#[test]
	fn test_load_missing_file_gives_defaults() {
		let tmp = TempDir::new().unwrap();
		let config = Config::load(tmp.path(), "work").unwrap();
		assert_eq!(config.profile, "work");
		assert_eq!(config.replicator_dir, tmp.path());
		assert!(config.db_path().to_string_lossy().ends_with("work.index.redb"));
	}

	#[test]
	fn test_load_profile_file() {
		let tmp = TempDir::new().unwrap();
		std::fs::write(
			tmp.path().join("work.profile.json5"),
			// json5: comments and unquoted keys allowed
			"{ excludePatterns: ['*.tmp'], parallelHashing: 2 }",
		)
		.unwrap();

		let config = Config::load(tmp.path(), "work").unwrap();
		assert_eq!(config.exclude_patterns, vec!["*.tmp".to_string()]);
		assert_eq!(config.parallel_hashing, 2);
		// Arguments win over file content for identity fields
		assert_eq!(config.profile, "work");
	}

	#[test]
	fn test_exclude_set_matches() {
		let config = Config {
			exclude_patterns: vec!["*.tmp".to_string(), "build/**".to_string()],
			..Config::default()
		};
		let set = config.exclude_set().unwrap();
		assert!(set.is_match("junk.tmp"));
		assert!(set.is_match("build/out/a.o"));
		assert!(!set.is_match("src/lib.rs"));
	}

	#[test]
	fn test_bad_exclude_pattern() {
		let config = Config {
			exclude_patterns: vec!["a{".to_string()],
			..Config::default()
		};
		assert!(config.exclude_set().is_err());
	}
}

// vim: ts=4
