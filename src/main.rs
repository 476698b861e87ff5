//! Host tool for building, checking and exporting blob store images.

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use blobfs::build_blob_set;
use blobfs::check;
use blobfs::export_blobs;
use blobfs::format::DEFAULT_INODE_COUNT;
use blobfs::fsck;
use blobfs::make_image;
use blobfs::BlobLayoutFormat;
use blobfs::FileDevice;
use blobfs::FilesystemOptions;
use blobfs::Image;
use std::env;
use std::path::PathBuf;
use std::process::exit;

/// Command line arguments across every subcommand.
#[derive(Default)]
struct Args {
	command: String,
	image: Option<PathBuf>,
	/// `mkfs`: total image size in blocks.
	block_count: Option<u64>,
	/// `mkfs`: node table capacity.
	num_inodes: Option<u64>,
	/// `mkfs`: use the deprecated padded layout.
	padded: bool,
	/// `fsck`: enable strict checks.
	strict: bool,
	/// `fsck`: repair the backup superblock and slice over-allocation.
	repair: bool,
	/// `add`: source files; `export`: the output directory.
	paths: Vec<PathBuf>,
	help: bool,
}

fn usage(prog: &str) {
	eprintln!("usage: {prog} <command> [options]");
	eprintln!();
	eprintln!("commands:");
	eprintln!("  mkfs <image> <block-count> [--padded] [--inodes=N]");
	eprintln!("  add <image> <file>...");
	eprintln!("  fsck <image> [--strict] [--repair]");
	eprintln!("  export <image> <dir>");
}

fn parse_args() -> Result<Args> {
	let mut args: Args = Default::default();
	let mut iter = env::args().skip(1);
	args.command = iter.next().unwrap_or_default();
	for arg in iter {
		match arg.as_str() {
			"-h" | "--help" => args.help = true,
			"--padded" => args.padded = true,
			"--strict" => args.strict = true,
			"--repair" => args.repair = true,
			_ if arg.starts_with("--inodes=") => {
				let value = &arg["--inodes=".len()..];
				args.num_inodes =
					Some(value.parse().with_context(|| format!("bad inode count `{value}`"))?);
			}
			_ if args.image.is_none() => args.image = Some(PathBuf::from(arg)),
			_ if args.command == "mkfs" && args.block_count.is_none() => {
				args.block_count =
					Some(arg.parse().with_context(|| format!("bad block count `{arg}`"))?);
			}
			_ => args.paths.push(PathBuf::from(arg)),
		}
	}
	Ok(args)
}

fn open_image(path: &PathBuf, readonly: bool) -> Result<Image<FileDevice>> {
	let device = if readonly {
		FileDevice::open_readonly(path)
	} else {
		FileDevice::open(path)
	}
	.with_context(|| format!("open {}", path.display()))?;
	Image::open(device).with_context(|| format!("load {}", path.display()))
}

fn run(args: Args) -> Result<()> {
	let image_path = || args.image.clone().context("specify the path to an image");
	match args.command.as_str() {
		"mkfs" => {
			let block_count = args.block_count.context("specify the image size in blocks")?;
			let options = FilesystemOptions {
				num_inodes: args.num_inodes.unwrap_or(DEFAULT_INODE_COUNT),
				blob_layout_format: if args.padded {
					BlobLayoutFormat::PaddedMerkleTreeAtStart
				} else {
					BlobLayoutFormat::CompactMerkleTreeAtEnd
				},
				fvm_slice_size: None,
			};
			let path = image_path()?;
			let mut device = FileDevice::open(&path)
				.with_context(|| format!("open {}", path.display()))?;
			make_image(&mut device, block_count, &options)
				.with_context(|| format!("format {}", path.display()))?;
			Ok(())
		}
		"add" => {
			if args.paths.is_empty() {
				bail!("specify at least one file to add");
			}
			let mut image = open_image(&image_path()?, false)?;
			let format = image.layout_format()?;
			let blobs = build_blob_set(&args.paths, format, true)?;
			for info in blobs.values() {
				image
					.add_blob(info)
					.with_context(|| format!("add {}", info.src_path().display()))?;
			}
			Ok(())
		}
		"fsck" => {
			let mut image = open_image(&image_path()?, !args.repair)?;
			let options = check::FsckOptions { strict: args.strict, repair: args.repair };
			let report = fsck(&mut image, options)?;
			if !report.ok() {
				bail!(
					"image is inconsistent: {} finding(s), {} corrupt blob(s)",
					report.errors.len(),
					report.corrupt_blobs.len()
				);
			}
			Ok(())
		}
		"export" => {
			let out_dir = match args.paths.as_slice() {
				[dir] => dir.clone(),
				_ => bail!("specify exactly one output directory"),
			};
			let mut image = open_image(&image_path()?, true)?;
			export_blobs(&mut image, &out_dir)?.map_err(anyhow::Error::from)?;
			Ok(())
		}
		_ => bail!("unknown command `{}`", args.command),
	}
}

fn main() {
	env_logger::init();
	let prog = env::args()
		.next()
		.and_then(|p| {
			PathBuf::from(p)
				.file_name()
				.map(|name| name.to_string_lossy().into_owned())
		})
		.unwrap_or_else(|| "blobfs".to_string());

	let args = match parse_args() {
		Ok(args) => args,
		Err(e) => {
			eprintln!("{prog}: {e:#}");
			exit(1);
		}
	};
	if args.help || args.command.is_empty() {
		usage(&prog);
		exit(if args.help { 0 } else { 1 });
	}
	if let Err(e) = run(args) {
		eprintln!("{prog}: {e:#}");
		exit(1);
	}
}
