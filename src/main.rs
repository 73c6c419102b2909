use clap::{Arg, ArgAction, Command};
use std::error::Error;
use std::{env, fs, path};

use replicator::bundle::BundleManager;
use replicator::config::Config;
use replicator::logging::init_tracing;
use replicator::store::Index;
use replicator::transport::DirTransport;
use replicator::types::BundleId;
use replicator::{diff, scan, sync};

///////////////////////
// Utility functions //
///////////////////////

fn init_replicator_dir() -> Result<path::PathBuf, Box<dyn Error>> {
	match env::var("HOME") {
		Ok(home) => {
			let replicator_dir = path::PathBuf::from(home).join(".replicator");

			match fs::metadata(&replicator_dir) {
				Ok(meta) => {
					if meta.is_dir() {
						Ok(replicator_dir)
					} else {
						Err(format!(
							"{} exists, but it is not a directory!",
							replicator_dir.display()
						)
						.into())
					}
				}
				Err(_err) => {
					// Not exists
					fs::create_dir(&replicator_dir)
						.map_err(|err| format!("Cannot create directory: {}", err))?;
					Ok(replicator_dir)
				}
			}
		}
		Err(_e) => Err("Could not determine HOME directory!".into()),
	}
}

fn print_scan_summary(summary: &replicator::ScanSummary) {
	println!("{} file metadata updates", summary.files_updated);
	println!("{} file hashes recomputed", summary.files_hashed);
	println!("{} files deleted", summary.files_deleted);
	for failure in &summary.failed {
		eprintln!("failed: {}: {}", failure.path.display(), failure.error);
	}
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
	init_tracing();

	let matches = Command::new("Replicator")
		.version("0.2.0")
		.author("Szilard Hajba <szilard@symbion.hu>")
		.about("Content-addressed deduplicating directory replication")
		.subcommand_required(true)
		.arg(
			Arg::new("profile")
				.short('p')
				.long("profile")
				.value_name("PROFILE")
				.help("Profile"),
		)
		.subcommand(
			Command::new("scan")
				.about("Scan a directory tree into the local index")
				.arg(Arg::new("dir").required(true))
				.arg(
					Arg::new("purge")
						.long("purge")
						.action(ArgAction::SetTrue)
						.help("Purge unreferenced blobs after the scan"),
				),
		)
		.subcommand(Command::new("status").about("Compare the local and remote indexes"))
		.subcommand(
			Command::new("schedule")
				.about("Bundle every blob that is not yet confirmed remote"),
		)
		.subcommand(
			Command::new("push")
				.about("Scan, bundle and upload to a target directory")
				.arg(Arg::new("dir").required(true))
				.arg(
					Arg::new("target")
						.long("target")
						.value_name("DIR")
						.required(true)
						.help("Directory receiving the blob payloads"),
				),
		)
		.subcommand(
			Command::new("confirm")
				.about("Mark a bundle transferred and update the remote index")
				.arg(Arg::new("bundle").required(true)),
		)
		.subcommand(Command::new("bundles").about("List bundles"))
		.subcommand(Command::new("purge").about("Delete unreferenced blobs"))
		.subcommand(
			Command::new("rm-remote")
				.about("Forget a path on the remote side")
				.arg(Arg::new("path").required(true)),
		)
		.get_matches();

	let profile =
		matches.get_one::<String>("profile").map(|s| s.as_str()).unwrap_or("default");
	let replicator_dir = init_replicator_dir()?;
	let config = Config::load(&replicator_dir, profile)?;
	let index = Index::open(&config.db_path())?;

	if let Some(sub_matches) = matches.subcommand_matches("scan") {
		let dir = sub_matches.get_one::<String>("dir").ok_or("scan: directory required")?;
		let summary = scan::scan(&index, &config, path::Path::new(dir)).await?;
		print_scan_summary(&summary);

		if sub_matches.get_flag("purge") || config.purge_after_scan {
			let purged = index.purge_unreferenced()?;
			println!("{} blobs purged", purged);
		}
	} else if matches.subcommand_matches("status").is_some() {
		let report = diff::diff(&index)?;
		println!("Files added:    {}", report.added.len());
		println!("Files modified: {}", report.modified.len());
		println!("Files deleted:  {}", report.deleted.len());
	} else if matches.subcommand_matches("schedule").is_some() {
		let pending = diff::blobs_needing_transfer(&index)?;
		if pending.is_empty() {
			println!("Nothing to schedule");
		} else {
			let manager = BundleManager::new(&index);
			let bundle = manager.schedule_for_transfer(&pending)?;
			println!("Bundle {} ({} blobs)", bundle, pending.len());
		}
	} else if let Some(sub_matches) = matches.subcommand_matches("push") {
		let dir = sub_matches.get_one::<String>("dir").ok_or("push: directory required")?;
		let target =
			sub_matches.get_one::<String>("target").ok_or("push: target directory required")?;

		let transport = DirTransport::new(path::Path::new(target));
		let report =
			sync::push_cycle(&index, &config, path::Path::new(dir), &transport).await?;

		print_scan_summary(&report.scan);
		match report.bundle {
			Some(bundle) => println!(
				"Bundle {}: {} blobs sent, {} remote files updated",
				bundle, report.blobs_sent, report.remote_files_updated
			),
			None => println!("Nothing to transfer"),
		}
	} else if let Some(sub_matches) = matches.subcommand_matches("confirm") {
		let bundle = sub_matches
			.get_one::<String>("bundle")
			.ok_or("confirm: bundle id required")?
			.parse::<BundleId>()
			.map_err(|e| format!("Invalid bundle id: {}", e))?;

		let manager = BundleManager::new(&index);
		let stats = manager.confirm_transferred(bundle)?;
		println!("{} blobs released, {} remote files updated", stats.blobs, stats.remote_files);
	} else if matches.subcommand_matches("bundles").is_some() {
		for (id, row) in index.bundles()? {
			let state = if row.transferred { "transferred" } else { "pending" };
			println!("{}  {}  {} blobs", id, state, row.blobs.len());
		}
	} else if matches.subcommand_matches("purge").is_some() {
		let purged = index.purge_unreferenced()?;
		println!("{} blobs purged", purged);
	} else if let Some(sub_matches) = matches.subcommand_matches("rm-remote") {
		let target = sub_matches.get_one::<String>("path").ok_or("rm-remote: path required")?;
		if index.remove_remote(path::Path::new(target))? {
			println!("Removed {}", target);
		} else {
			println!("Not present remotely: {}", target);
		}
	}

	Ok(())
}

// vim: ts=4
