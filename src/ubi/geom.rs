//! Per-image layout, derived once from the physical eraseblock size and the minimum I/O
//! unit. Immutable after construction; every other component takes it by reference.

use crate::error::{Error, Result};
use crate::ubi::headers::{Ec, UBI_EC_HDR_SIZE, UBI_MAX_VOLUMES, UBI_VERSION, UBI_VTBL_RECORD_SIZE};

fn align_up(x: u32, alignment: u32) -> u32 {
    x.div_ceil(alignment) * alignment
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct Geometry {
    /// Size of a physical eraseblock.
    pub peb_size: u32,

    /// Minimum input/output unit size; header offsets are multiples of this.
    pub min_io_size: u32,

    /// Offset of the VID header within each PEB.
    pub vid_hdr_offs: u32,

    /// Offset of LEB payload within each PEB.
    pub data_offs: u32,

    /// Usable bytes per eraseblock: `peb_size - data_offs`.
    pub leb_size: u32,

    /// Number of records in the volume table (also the maximum volume count).
    pub vtbl_slots: usize,

    /// UBI on-flash format version, stamped into every header.
    pub ubi_ver: u8,
}

impl Geometry {
    /// Derive the image geometry.
    ///
    /// `vid_hdr_offs` defaults to the next `min_io_size` boundary after the EC header;
    /// a caller-supplied value may not overlap the EC header or push the data area out of
    /// the eraseblock.
    pub fn new(
        peb_size: u32,
        min_io_size: u32,
        vid_hdr_offs: Option<u32>,
        ubi_ver: u8,
    ) -> Result<Self> {
        if ubi_ver != UBI_VERSION {
            return Err(Error::Usage(format!(
                "only UBI format version {UBI_VERSION} is supported, not {ubi_ver}"
            )));
        }
        if min_io_size < 1 {
            return Err(Error::Usage("min-io-size must be at least 1".to_string()));
        }
        if !peb_size.is_power_of_two() {
            return Err(Error::Usage(format!(
                "PEB size {peb_size} is not a power of two"
            )));
        }
        if peb_size % min_io_size != 0 {
            return Err(Error::Usage(format!(
                "min-io-size {min_io_size} does not divide PEB size {peb_size}"
            )));
        }
        if peb_size < 2 * min_io_size {
            return Err(Error::Usage(format!(
                "PEB size {peb_size} too small for min-io-size {min_io_size}"
            )));
        }

        let vid_default = align_up(UBI_EC_HDR_SIZE as u32, min_io_size);
        let vid_hdr_offs = vid_hdr_offs.unwrap_or(vid_default);
        if vid_hdr_offs < UBI_EC_HDR_SIZE as u32 {
            return Err(Error::Usage(format!(
                "VID header offset {vid_hdr_offs} overlaps the EC header"
            )));
        }
        if vid_hdr_offs > peb_size - min_io_size {
            return Err(Error::Usage(format!(
                "VID header offset {vid_hdr_offs} leaves no room for data"
            )));
        }

        let data_offs = align_up(vid_hdr_offs + min_io_size, min_io_size);
        if data_offs >= peb_size {
            return Err(Error::Usage(format!(
                "data offset {data_offs} leaves no usable LEB space"
            )));
        }

        Ok(Self::with_offsets(
            peb_size,
            min_io_size,
            vid_hdr_offs,
            data_offs,
            ubi_ver,
        ))
    }

    /// Recover a geometry from a scanned EC header, honoring images written with
    /// non-default offsets. The PEB size cannot be learned from the header and must be
    /// presumed by the caller.
    pub fn from_ec(peb_size: u32, ec: &Ec) -> Result<Self> {
        let (vid, data) = (ec.vid_hdr_offset, ec.data_offset);
        if vid < UBI_EC_HDR_SIZE as u32 || data <= vid || data >= peb_size {
            return Err(Error::Usage(format!(
                "EC header offsets (VID 0x{vid:x}, data 0x{data:x}) inconsistent with \
                 PEB size 0x{peb_size:x}"
            )));
        }

        // The distance between the two headers is the I/O unit the image was built for.
        let min_io_size = data - vid;
        Ok(Self::with_offsets(peb_size, min_io_size, vid, data, 1))
    }

    fn with_offsets(
        peb_size: u32,
        min_io_size: u32,
        vid_hdr_offs: u32,
        data_offs: u32,
        ubi_ver: u8,
    ) -> Self {
        let leb_size = peb_size - data_offs;
        let vtbl_slots = std::cmp::min(leb_size as usize / UBI_VTBL_RECORD_SIZE, UBI_MAX_VOLUMES);

        Self {
            peb_size,
            min_io_size,
            vid_hdr_offs,
            data_offs,
            leb_size,
            vtbl_slots,
            ubi_ver,
        }
    }

    /// Maximum number of volumes this image can declare.
    pub fn max_volumes(&self) -> usize {
        self.vtbl_slots
    }

    /// Size in bytes of one volume-table copy (the meaningful prefix of a layout LEB).
    pub fn vtbl_bytes(&self) -> usize {
        self.vtbl_slots * UBI_VTBL_RECORD_SIZE
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_offsets() {
        let g = Geometry::new(128 * 1024, 2048, None, 1).unwrap();
        assert_eq!(g.vid_hdr_offs, 2048);
        assert_eq!(g.data_offs, 4096);
        assert_eq!(g.leb_size, 126976);
        assert_eq!(g.vtbl_slots, 128);
        assert_eq!(g.vid_hdr_offs % g.min_io_size, 0);
        assert_eq!(g.data_offs % g.min_io_size, 0);
        assert!(g.data_offs >= g.vid_hdr_offs + 64);
    }

    #[test]
    fn test_nor_style_geometry() {
        // NOR flash: 1-byte I/O unit; headers pack tightly
        let g = Geometry::new(64 * 1024, 1, None, 1).unwrap();
        assert_eq!(g.vid_hdr_offs, 64);
        assert_eq!(g.data_offs, 65);
        assert_eq!(g.leb_size, 64 * 1024 - 65);
    }

    #[test]
    fn test_subpage_vid_offset() {
        let g = Geometry::new(128 * 1024, 2048, Some(512), 1).unwrap();
        assert_eq!(g.vid_hdr_offs, 512);
        assert_eq!(g.data_offs, 4096);
    }

    #[test]
    fn test_small_leb_caps_vtbl_slots() {
        let g = Geometry::new(16 * 1024, 512, None, 1).unwrap();
        assert_eq!(g.leb_size, 15 * 1024);
        assert_eq!(g.vtbl_slots, 15 * 1024 / 172);
        assert!(g.vtbl_slots < UBI_MAX_VOLUMES);
    }

    #[test]
    fn test_rejections() {
        assert!(Geometry::new(100000, 2048, None, 1).is_err()); // not a power of two
        assert!(Geometry::new(2048, 2048, None, 1).is_err()); // < 2 * min_io
        assert!(Geometry::new(128 * 1024, 0, None, 1).is_err());
        assert!(Geometry::new(128 * 1024, 2048, Some(32), 1).is_err()); // overlaps EC hdr
        assert!(Geometry::new(128 * 1024, 2048, Some(127 * 1024), 1).is_err());
    }

    #[test]
    fn test_from_ec_roundtrip() {
        let g = Geometry::new(128 * 1024, 2048, None, 1).unwrap();
        let ec = Ec {
            vid_hdr_offset: g.vid_hdr_offs,
            data_offset: g.data_offs,
            ..Default::default()
        };
        let g2 = Geometry::from_ec(g.peb_size, &ec).unwrap();
        assert_eq!(g, g2);
    }
}
