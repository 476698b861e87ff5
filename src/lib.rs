//! A content-addressed, verified, append-mostly block store for
//! immutable blobs.
//!
//! Blobs are named by the SHA-256 root of a Merkle tree over 8 KiB
//! nodes, and every byte read back out of an image is verified
//! against that root. This crate is the host-side engine: it formats
//! images, ingests blobs (deciding per blob whether chunked
//! compression pays for itself), checks images for consistency, and
//! exports verified content back out.
//!
//! The mounted runtime that serves these images lives elsewhere and
//! shares only the on-disk contracts in [`format`].

pub mod allocator;
pub mod bitmap;
pub mod check;
pub mod compress;
pub mod device;
pub mod digest;
pub mod error;
pub mod export;
pub mod format;
pub mod image;
pub mod layout;
pub mod merkle;
pub mod mkfs;

pub use check::fsck;
pub use check::CheckReport;
pub use check::FsckOptions;
pub use device::BlockDevice;
pub use device::FileDevice;
pub use digest::BlobDigest;
pub use error::Error;
pub use error::Result;
pub use export::export_blobs;
pub use image::build_blob_set;
pub use image::AddOutcome;
pub use image::BlobInfo;
pub use image::Image;
pub use layout::BlobLayout;
pub use layout::BlobLayoutFormat;
pub use mkfs::make_image;
pub use mkfs::FilesystemOptions;
