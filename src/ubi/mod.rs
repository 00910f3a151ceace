//! The UBI on-flash format: header synthesis and parsing, image geometry, the volume
//! writer, the scanner/reconstructor, and the whole-image driver operations.

pub mod geom;
pub mod headers;
pub mod image;
pub mod scan;
pub mod write;

pub use geom::Geometry;
pub use headers::{Ec, Vid, VolTableRecord, VolType};
pub use scan::Scan;
pub use write::{BasicVolume, Volume};
