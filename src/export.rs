//! Export: materialize every blob in an image as a file named by its
//! digest.

use crate::device::BlockDevice;
use crate::digest::BlobDigest;
use crate::error::Error;
use crate::error::Result;
use crate::image::Image;
use std::fs;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Per-blob failures collected by an export run.
#[derive(Debug)]
pub struct ExportError {
	/// (digest, failure) for every blob that could not be exported.
	pub failures: Vec<(BlobDigest, Error)>,
}

impl std::fmt::Display for ExportError {
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		writeln!(fmt, "{} blob(s) failed to export:", self.failures.len())?;
		for (digest, error) in &self.failures {
			writeln!(fmt, "  {digest}: {error}")?;
		}
		Ok(())
	}
}

impl std::error::Error for ExportError {}

/// Writes every blob's logical bytes into `out_dir`, one file per
/// blob named by its 64-character hex digest.
///
/// Every blob is verified (and decompressed) before it is written.
/// A failing blob is recorded and the export continues; the
/// accumulated failures come back as one [`ExportError`].
pub fn export_blobs<D: BlockDevice>(
	image: &mut Image<D>,
	out_dir: &Path,
) -> Result<std::result::Result<(), ExportError>> {
	fs::create_dir_all(out_dir)?;

	let mut failures = Vec::new();
	let inode_count = image.superblock().inode_count.get() as u32;
	for node_index in 0..inode_count {
		let record = *image.get_node(node_index)?;
		if !record.header().is_inode() {
			continue;
		}
		let digest = BlobDigest::from(record.as_inode().merkle_root_hash);
		match image.load_and_verify_blob(node_index) {
			Ok(content) => {
				if let Err(e) = write_blob_file(out_dir, &digest, &content) {
					log::error!("export of {digest} failed: {e}");
					failures.push((digest, e));
				}
			}
			Err(e) => {
				log::error!("export of {digest} failed: {e}");
				failures.push((digest, e));
			}
		}
	}

	if failures.is_empty() {
		Ok(Ok(()))
	} else {
		Ok(Err(ExportError { failures }))
	}
}

fn write_blob_file(out_dir: &Path, digest: &BlobDigest, content: &[u8]) -> Result<()> {
	let path = out_dir.join(digest.to_string());
	let mut file = File::create(&path)?;
	file.write_all(content)?;
	Ok(())
}
