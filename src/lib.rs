//! Construction, extraction, and maintenance of UBI (Unsorted Block Images) volume sets.
//!
//! The crate is organized bottom-up:
//! - [`mtd`] gives an eraseblock-addressed view of a flash device or image file, with
//!   skip-on-bad semantics left to the layers above.
//! - [`ubi::headers`] knows the on-flash byte layout of the EC header, VID header, and
//!   volume table, with CRC verification/computation.
//! - [`ubi::geom`] derives the per-image layout (VID header offset, data offset, LEB size)
//!   from the physical eraseblock size and the minimum I/O unit.
//! - [`ubi::write`] streams volume payloads into physical eraseblocks, and [`ubi::scan`]
//!   reverses the process, reconstructing volumes from a (possibly damaged) image.
//! - [`ubi::image`] composes these into the whole-image operations the CLI tools invoke.
//! - [`compr`] is the adaptive per-chunk compression pipeline used on UBIFS payloads.
//!
//! Nothing in the library writes to stderr; diagnostics flow through a caller-supplied
//! [`report::Reporter`].

pub mod compr;
pub mod error;
pub mod mtd;
pub mod report;
pub mod ubi;
pub mod util;

pub use error::{Error, Result};
