//! This module contains the code necessary to read, write, and manipulate the UBI
//! on-flash records (EC headers, VID headers, and volume-table records), with CRC
//! verification/computation.
//!
//! All multi-byte fields are serialized little-endian. The CRC is the bit-reflected
//! CRC-32 (polynomial 0xEDB88320) with initializer 0xFFFFFFFF and no final inversion,
//! compared as the raw accumulator; `CRC_32_JAMCRC` is exactly that algorithm.

use crc::{Crc, CRC_32_JAMCRC};
use deku::prelude::*;
pub use deku::{DekuContainerRead, DekuContainerWrite};

use crate::error::{CorruptKind, Error, Result as CrateResult};
use crate::ubi::geom::Geometry;

pub const UBI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);

pub const UBI_EC_HDR_MAGIC: u32 = 0x5542_4923;
pub const UBI_VID_HDR_MAGIC: u32 = 0x5542_4921;
pub const UBI_VERSION: u8 = 1;

pub const UBI_EC_HDR_SIZE: usize = 64;
pub const UBI_VID_HDR_SIZE: usize = 64;
pub const UBI_VTBL_RECORD_SIZE: usize = 172;

pub const UBI_MAX_VOLUMES: usize = 128;
pub const UBI_VOL_NAME_MAX: usize = 127;

/// Reserved volume id of the layout volume, which holds the volume table.
pub const UBI_LAYOUT_VOLUME_ID: u32 = 0x7FFF_EFFF;
pub const UBI_LAYOUT_VOLUME_EBS: u32 = 2;
pub const UBI_LAYOUT_VOLUME_COMPAT: u8 = 5;

/// Volume-table record flag: this volume absorbs leftover eraseblocks at attach time.
pub const UBI_VTBL_AUTORESIZE_FLG: u8 = 0x01;

/// Raw erase-counter header, one at offset 0 of every PEB.
#[derive(Debug, Default, Eq, PartialEq, Clone, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct EcHdr {
    pub magic: u32,
    pub version: u8,
    pub padding1: [u8; 3],
    pub ec: u64,
    pub vid_hdr_offset: u32,
    pub data_offset: u32,
    pub image_seq: u32,
    pub padding2: [u8; 32],
    pub hdr_crc: u32,
}

/// Raw volume-id header, at the geometry's VID header offset of every mapped PEB.
#[derive(Debug, Default, Eq, PartialEq, Clone, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct VidHdr {
    pub magic: u32,
    pub version: u8,
    pub vol_type: u8,
    pub copy_flag: u8,
    pub compat: u8,
    pub vol_id: u32,
    pub lnum: u32,
    pub leb_ver: u32,
    pub data_size: u32,
    pub used_ebs: u32,
    pub data_pad: u32,
    pub data_crc: u32,
    pub padding1: [u8; 4],
    pub sqnum: u64,
    pub padding2: [u8; 12],
    pub hdr_crc: u32,
}

/// Raw volume-table record; the layout volume holds `vtbl_slots` of these per copy.
#[derive(Debug, Eq, PartialEq, Clone, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct VtblRecord {
    pub reserved_pebs: u32,
    pub alignment: u32,
    pub data_pad: u32,
    pub vol_type: u8,
    pub upd_marker: u8,
    pub name_len: u16,
    pub name: [u8; 128],
    pub flags: u8,
    pub padding: [u8; 23],
    pub crc: u32,
}

/// Computes the CRC of a header: the raw accumulator over everything but the trailing
/// CRC field itself.
pub trait ComputeCrc: DekuContainerWrite {
    fn compute_crc(&self) -> u32 {
        let header_bytes = self.to_bytes().unwrap();
        let header_len = header_bytes.len() - std::mem::size_of::<u32>();
        UBI_CRC.checksum(&header_bytes[..header_len])
    }

    fn check_crc(&self) -> bool {
        self.get_crc() == self.compute_crc()
    }

    fn fix_crc(&mut self) {
        self.set_crc(self.compute_crc())
    }

    fn get_crc(&self) -> u32;
    fn set_crc(&mut self, crc: u32);
}

impl ComputeCrc for EcHdr {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}
impl ComputeCrc for VidHdr {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}
impl ComputeCrc for VtblRecord {
    fn get_crc(&self) -> u32 {
        self.crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.crc = crc;
    }
}

/// Parsing of UBI headers from byteslices, with every failure classified: magic, then
/// version, then CRC, then field ranges. Parsing never panics and allocates only the
/// fixed-size scratch `deku` needs.
pub trait ParseHeader<'a>: Sized + DekuContainerRead<'a> + ComputeCrc {
    fn magic() -> u32;
    fn hdr_magic(&self) -> u32;
    fn hdr_version(&self) -> u8;

    /// Per-header sanity of parsed fields; runs after the CRC has been accepted.
    fn fields_in_range(&self) -> bool {
        true
    }

    fn parse(buf: &'a [u8]) -> std::result::Result<Self, CorruptKind> {
        let (_, header) = Self::from_bytes((buf, 0)).map_err(|_| CorruptKind::FieldRange)?;

        if header.hdr_magic() != Self::magic() {
            return Err(CorruptKind::MagicMismatch);
        }
        if header.hdr_version() != UBI_VERSION {
            return Err(CorruptKind::VersionMismatch);
        }
        if !header.check_crc() {
            return Err(CorruptKind::CrcMismatch);
        }
        if !header.fields_in_range() {
            return Err(CorruptKind::FieldRange);
        }

        Ok(header)
    }
}

impl ParseHeader<'_> for EcHdr {
    fn magic() -> u32 {
        UBI_EC_HDR_MAGIC
    }
    fn hdr_magic(&self) -> u32 {
        self.magic
    }
    fn hdr_version(&self) -> u8 {
        self.version
    }

    fn fields_in_range(&self) -> bool {
        u64::from(self.vid_hdr_offset) >= UBI_EC_HDR_SIZE as u64
            && self.data_offset > self.vid_hdr_offset
    }
}

impl ParseHeader<'_> for VidHdr {
    fn magic() -> u32 {
        UBI_VID_HDR_MAGIC
    }
    fn hdr_magic(&self) -> u32 {
        self.magic
    }
    fn hdr_version(&self) -> u8 {
        self.version
    }

    fn fields_in_range(&self) -> bool {
        VolType::try_from(self.vol_type).is_ok()
            && self.compat <= UBI_LAYOUT_VOLUME_COMPAT
            && (self.vol_id == UBI_LAYOUT_VOLUME_ID || self.vol_id < UBI_MAX_VOLUMES as u32)
    }
}

/// This represents the specific fields we care about in an EC header
///
/// This is meant to be more ergonomic to work with than [EcHdr], which is the raw record
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Ec {
    pub ec: u64,
    pub vid_hdr_offset: u32,
    pub data_offset: u32,
    pub image_seq: u32,
}

impl Ec {
    /// An EC header matching the given geometry.
    pub fn new(geom: &Geometry, ec: u64, image_seq: u32) -> Self {
        Self {
            ec,
            vid_hdr_offset: geom.vid_hdr_offs,
            data_offset: geom.data_offs,
            image_seq,
        }
    }

    /// Change the erase counter of this EC header
    pub fn ec(mut self, ec: u64) -> Self {
        self.ec = ec;
        self
    }

    /// Increment the erase counter of this EC header
    pub fn inc_ec(mut self) -> Self {
        self.ec += 1;
        self
    }

    /// Parse from a byte slice, classifying any failure
    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, CorruptKind> {
        EcHdr::parse(bytes).map(Into::into)
    }

    /// Serialize into the leading bytes of `out_bytes`
    pub fn encode(self, out_bytes: &mut [u8]) -> CrateResult<()> {
        let bytes = EcHdr::from(self)
            .to_bytes()
            .map_err(|e| Error::Usage(e.to_string()))?;
        out_bytes
            .get_mut(..bytes.len())
            .ok_or_else(|| Error::Usage("output buffer too small for EC header".to_string()))?
            .copy_from_slice(&bytes);
        Ok(())
    }
}

impl From<EcHdr> for Ec {
    fn from(value: EcHdr) -> Self {
        let EcHdr {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
            ..
        } = value;

        Self {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
        }
    }
}

impl From<Ec> for EcHdr {
    fn from(value: Ec) -> EcHdr {
        let Ec {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
        } = value;

        let mut target = Self {
            magic: UBI_EC_HDR_MAGIC,
            version: UBI_VERSION,

            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,

            ..Default::default()
        };

        target.fix_crc();
        target
    }
}

/// These represent UBI volume types
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum VolType {
    /// A volume that may be read and written in random order
    #[default]
    Dynamic,

    /// A volume that is read-only after it is initially written, except for whole-volume
    /// updates; its contents are length-delimited and CRC-protected per LEB
    Static,
}

impl From<VolType> for u8 {
    fn from(value: VolType) -> Self {
        match value {
            VolType::Dynamic => 1,
            VolType::Static => 2,
        }
    }
}

impl TryFrom<u8> for VolType {
    type Error = ();

    fn try_from(value: u8) -> std::result::Result<Self, ()> {
        match value {
            1 => Ok(Self::Dynamic),
            2 => Ok(Self::Static),
            _ => Err(()),
        }
    }
}

/// This represents the specific fields we care about in a VID header
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Vid {
    /// The type of volume.
    pub vol_type: VolType,

    /// Whether this PEB was written as a copy of another, for wear-leveling purposes.
    pub copy_flag: bool,

    /// For internal volumes, flags indicating how UBI should handle the volume.
    pub compat: u8,

    /// The ID of the volume, and entry in the volume table.
    pub vol_id: u32,

    /// The offset of the LEB within this volume.
    pub lnum: u32,

    /// Per-LEB version counter; among several PEBs holding the same `vol_id:lnum`, the
    /// highest version is current.
    pub leb_ver: u32,

    /// For `Static` volumes, the number of payload bytes covered by `data_crc`;
    /// otherwise 0.
    pub data_size: u32,

    /// The number of LEBs used by this volume, or 0 if this volume is `Dynamic`
    pub used_ebs: u32,

    /// The number of bytes unused at the end of the LEB, to cut it down to a multiple of
    /// the requested volume alignment size.
    pub data_pad: u32,

    /// The CRC of the first `data_size` bytes of the LEB, or 0 when unused.
    pub data_crc: u32,

    /// A unique counter greater than any other VID header written, for resolving
    /// `vol_id:lnum` collisions.
    pub sqnum: u64,
}

impl Vid {
    /// Change the sequence number for this `Vid`
    pub fn sqnum(mut self, sqnum: u64) -> Self {
        self.sqnum = sqnum;
        self
    }

    /// Change the LEB version for this `Vid`
    pub fn leb_ver(mut self, leb_ver: u32) -> Self {
        self.leb_ver = leb_ver;
        self
    }

    /// Is this a LEB of the layout volume?
    pub fn is_layout(&self) -> bool {
        self.vol_id == UBI_LAYOUT_VOLUME_ID
    }

    /// Parse from a byte slice, classifying any failure
    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, CorruptKind> {
        VidHdr::parse(bytes).and_then(|x| x.try_into().map_err(|_| CorruptKind::FieldRange))
    }

    /// Serialize into the leading bytes of `out_bytes`
    pub fn encode(self, out_bytes: &mut [u8]) -> CrateResult<()> {
        let bytes = VidHdr::from(self)
            .to_bytes()
            .map_err(|e| Error::Usage(e.to_string()))?;
        out_bytes
            .get_mut(..bytes.len())
            .ok_or_else(|| Error::Usage("output buffer too small for VID header".to_string()))?
            .copy_from_slice(&bytes);
        Ok(())
    }
}

impl TryFrom<VidHdr> for Vid {
    type Error = ();

    fn try_from(value: VidHdr) -> std::result::Result<Self, ()> {
        let VidHdr {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            leb_ver,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
            ..
        } = value;

        let vol_type = vol_type.try_into()?;
        let copy_flag = copy_flag != 0;

        Ok(Self {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            leb_ver,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
        })
    }
}

impl From<Vid> for VidHdr {
    fn from(value: Vid) -> VidHdr {
        let Vid {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            leb_ver,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
        } = value;

        let mut target = Self {
            magic: UBI_VID_HDR_MAGIC,
            version: UBI_VERSION,

            vol_type: vol_type.into(),
            copy_flag: copy_flag.into(),
            compat,
            vol_id,
            lnum,
            leb_ver,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,

            ..Default::default()
        };

        target.fix_crc();
        target
    }
}

/// This represents the specific fields we care about in a volume table record
#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub struct VolTableRecord {
    /// The total number of PEBs allocated to this volume.
    pub reserved_pebs: u32,

    /// All LEBs in this volume will be a multiple of this size.
    pub alignment: u32,

    /// The number of bytes reserved from the end of each LEB to ensure alignment.
    pub data_pad: u32,

    /// The type of volume.
    pub vol_type: VolType,

    /// Set to `true` during a whole-volume update, so that if interrupted, it's possible
    /// to detect that the volume is corrupt.
    pub upd_marker: bool,

    /// The name of the volume. This code supports any UTF-8 string, but as other UBI
    /// implementors might assume only ASCII, it's best to stick to that.
    pub name: String,

    /// Any flags set on this volume.
    pub flags: u8,
}

impl VolTableRecord {
    /// Parse one record slot. `Ok(None)` is an unused slot: an all-zero record, or a
    /// zero body under a valid CRC (some generators stamp empty slots).
    pub fn decode(bytes: &[u8]) -> std::result::Result<Option<Self>, CorruptKind> {
        let (_, raw) = VtblRecord::from_bytes((bytes, 0)).map_err(|_| CorruptKind::FieldRange)?;

        let body_is_zero = bytes[..UBI_VTBL_RECORD_SIZE - 4].iter().all(|&b| b == 0);
        if body_is_zero && (raw.crc == 0 || raw.check_crc()) {
            return Ok(None);
        }

        if !raw.check_crc() {
            return Err(CorruptKind::CrcMismatch);
        }
        raw.try_into().map(Some).map_err(|_| CorruptKind::FieldRange)
    }

    /// Serialize into a freshly CRC-stamped raw record
    pub fn into_bytes(self) -> Vec<u8> {
        VtblRecord::from(self).to_bytes().unwrap()
    }

    /// An unused slot, all zeroes by convention
    pub fn empty_bytes() -> Vec<u8> {
        vec![0; UBI_VTBL_RECORD_SIZE]
    }
}

impl TryFrom<VtblRecord> for VolTableRecord {
    type Error = ();

    fn try_from(value: VtblRecord) -> std::result::Result<Self, ()> {
        let VtblRecord {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            name_len,
            flags,
            ..
        } = value;

        if name_len as usize > UBI_VOL_NAME_MAX || alignment == 0 {
            return Err(());
        }

        let vol_type = vol_type.try_into()?;
        let upd_marker = upd_marker != 0;
        let name = std::str::from_utf8(&name[..name_len as usize])
            .map_err(|_| ())?
            .to_string();

        Ok(Self {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            flags,
        })
    }
}

impl From<VolTableRecord> for VtblRecord {
    fn from(value: VolTableRecord) -> VtblRecord {
        let VolTableRecord {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            flags,
        } = value;

        let name_len = name.len() as u16;
        let name_bytes = name.as_bytes();
        let mut name = std::array::from_fn(|_| 0u8);
        name[..name_bytes.len()].copy_from_slice(name_bytes);

        let mut target = Self {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type: vol_type.into(),
            upd_marker: upd_marker.into(),
            name,
            name_len,
            flags,

            crc: 0,
            padding: [0; 23],
        };

        target.fix_crc();
        target
    }
}

/// Serialize a full volume-table copy: one record per declared volume (indexed by volume
/// id), zero-filled unused slots, each used record CRC-stamped independently. The result
/// is one LEB's worth of bytes.
pub fn build_vtbl(geom: &Geometry, records: &[Option<VolTableRecord>]) -> CrateResult<Vec<u8>> {
    if records.len() > geom.vtbl_slots {
        return Err(Error::Usage(format!(
            "{} volumes declared but the volume table has {} slots",
            records.len(),
            geom.vtbl_slots
        )));
    }

    let autoresize = records
        .iter()
        .flatten()
        .filter(|r| r.flags & UBI_VTBL_AUTORESIZE_FLG != 0)
        .count();
    if autoresize > 1 {
        return Err(Error::Usage(format!(
            "more than one volume ({autoresize}) carries the auto-resize flag"
        )));
    }

    let mut out = Vec::with_capacity(geom.leb_size as usize);
    for slot in records {
        match slot {
            Some(record) => {
                if record.name.len() > UBI_VOL_NAME_MAX {
                    return Err(Error::Usage(format!(
                        "volume name \"{}\" exceeds {UBI_VOL_NAME_MAX} bytes",
                        record.name
                    )));
                }
                out.extend(record.clone().into_bytes());
            }
            None => out.extend(VolTableRecord::empty_bytes()),
        }
    }
    out.resize(geom.leb_size as usize, 0);

    Ok(out)
}

/// Parse a volume-table copy back into per-slot records.
///
/// A corrupt record anywhere invalidates the whole copy; the caller falls back to the
/// redundant copy in the other layout PEB.
pub fn parse_vtbl(
    geom: &Geometry,
    data: &[u8],
) -> std::result::Result<Vec<Option<VolTableRecord>>, CorruptKind> {
    if data.len() < geom.vtbl_bytes() {
        return Err(CorruptKind::FieldRange);
    }

    data[..geom.vtbl_bytes()]
        .chunks_exact(UBI_VTBL_RECORD_SIZE)
        .map(VolTableRecord::decode)
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn geom() -> Geometry {
        Geometry::new(128 * 1024, 2048, None, 1).unwrap()
    }

    #[test]
    fn test_encode_decode() -> CrateResult<()> {
        let ec = Ec::new(&geom(), 7, 0x11223344);
        let vid = Vid {
            vol_id: 3,
            lnum: 9,
            leb_ver: 2,
            sqnum: 77,
            ..Default::default()
        };
        let vtbl = VolTableRecord {
            reserved_pebs: 4,
            alignment: 1024,
            name: "example".to_string(),
            ..Default::default()
        };

        let mut buf = vec![0u8; 1024];

        ec.encode(&mut buf)?;
        assert_eq!(Ec::decode(&buf), Ok(ec));

        vid.encode(&mut buf)?;
        assert_eq!(Vid::decode(&buf), Ok(vid));

        let vec = vtbl.clone().into_bytes();
        assert_eq!(VolTableRecord::decode(&vec), Ok(Some(vtbl)));

        Ok(())
    }

    #[test]
    fn test_header_sizes_and_crc_placement() {
        let ec_bytes = EcHdr::from(Ec::new(&geom(), 1, 0)).to_bytes().unwrap();
        assert_eq!(ec_bytes.len(), UBI_EC_HDR_SIZE);
        // CRC is the raw accumulator over the 60-byte prefix
        assert_eq!(
            u32::from_le_bytes(ec_bytes[60..64].try_into().unwrap()),
            UBI_CRC.checksum(&ec_bytes[..60])
        );

        let vid_bytes = VidHdr::from(Vid::default()).to_bytes().unwrap();
        assert_eq!(vid_bytes.len(), UBI_VID_HDR_SIZE);
        assert_eq!(
            u32::from_le_bytes(vid_bytes[60..64].try_into().unwrap()),
            UBI_CRC.checksum(&vid_bytes[..60])
        );

        let rec_bytes = VolTableRecord::default().into_bytes();
        assert_eq!(rec_bytes.len(), UBI_VTBL_RECORD_SIZE);
        assert_eq!(
            u32::from_le_bytes(rec_bytes[168..172].try_into().unwrap()),
            UBI_CRC.checksum(&rec_bytes[..168])
        );
    }

    #[test]
    fn test_classified_failures() {
        let mut buf = vec![0u8; UBI_EC_HDR_SIZE];
        Ec::new(&geom(), 1, 0).encode(&mut buf).unwrap();

        assert!(Ec::decode(&buf).is_ok());

        let mut wrong_magic = buf.clone();
        wrong_magic[0] ^= 0xFF;
        assert_eq!(Ec::decode(&wrong_magic), Err(CorruptKind::MagicMismatch));

        let mut wrong_version = buf.clone();
        wrong_version[4] = 9;
        assert_eq!(Ec::decode(&wrong_version), Err(CorruptKind::VersionMismatch));

        let mut flipped = buf.clone();
        flipped[10] ^= 0x01;
        assert_eq!(Ec::decode(&flipped), Err(CorruptKind::CrcMismatch));

        // Offsets that cannot hold headers are rejected even under a valid CRC
        let bogus = EcHdr {
            magic: UBI_EC_HDR_MAGIC,
            version: UBI_VERSION,
            vid_hdr_offset: 8,
            data_offset: 4,
            ..Default::default()
        };
        let mut bogus_bytes = bogus.to_bytes().unwrap();
        let crc = UBI_CRC.checksum(&bogus_bytes[..60]);
        bogus_bytes[60..].copy_from_slice(&crc.to_le_bytes());
        assert_eq!(Ec::decode(&bogus_bytes), Err(CorruptKind::FieldRange));
    }

    #[test]
    fn test_vid_vol_type_range() {
        let mut raw = VidHdr::from(Vid::default());
        raw.vol_type = 3;
        raw.fix_crc();
        let bytes = raw.to_bytes().unwrap();
        assert_eq!(Vid::decode(&bytes), Err(CorruptKind::FieldRange));
    }

    #[test]
    fn test_empty_vtbl_slot() {
        // All-zero is unused
        assert_eq!(
            VolTableRecord::decode(&VolTableRecord::empty_bytes()),
            Ok(None)
        );

        // Zero body under a valid CRC (as some generators write) is unused too
        let mut stamped = VtblRecord {
            reserved_pebs: 0,
            alignment: 0,
            data_pad: 0,
            vol_type: 0,
            upd_marker: 0,
            name: std::array::from_fn(|_| 0u8),
            name_len: 0,
            flags: 0,
            padding: [0; 23],
            crc: 0,
        };
        stamped.fix_crc();
        assert_eq!(
            VolTableRecord::decode(&stamped.to_bytes().unwrap()),
            Ok(None)
        );

        // A used record with a flipped bit is corrupt, not unused
        let mut used = VolTableRecord {
            reserved_pebs: 2,
            alignment: 1,
            name: "boot".to_string(),
            ..Default::default()
        }
        .into_bytes();
        used[0] ^= 0x02;
        assert_eq!(
            VolTableRecord::decode(&used),
            Err(CorruptKind::CrcMismatch)
        );
    }

    #[test]
    fn test_build_vtbl_rejects_double_autoresize() {
        let g = geom();
        let rec = |flags| {
            Some(VolTableRecord {
                reserved_pebs: 1,
                alignment: 1,
                name: "v".to_string(),
                flags,
                ..Default::default()
            })
        };

        assert!(build_vtbl(&g, &[rec(UBI_VTBL_AUTORESIZE_FLG), rec(0)]).is_ok());
        assert!(build_vtbl(
            &g,
            &[rec(UBI_VTBL_AUTORESIZE_FLG), rec(UBI_VTBL_AUTORESIZE_FLG)]
        )
        .is_err());
    }

    #[test]
    fn test_vtbl_roundtrip() {
        let g = geom();
        let records = vec![
            Some(VolTableRecord {
                reserved_pebs: 4,
                alignment: 1,
                vol_type: VolType::Dynamic,
                name: "rootfs".to_string(),
                ..Default::default()
            }),
            None,
            Some(VolTableRecord {
                reserved_pebs: 2,
                alignment: 1,
                vol_type: VolType::Static,
                name: "kernel".to_string(),
                ..Default::default()
            }),
        ];

        let bytes = build_vtbl(&g, &records).unwrap();
        assert_eq!(bytes.len(), g.leb_size as usize);

        let parsed = parse_vtbl(&g, &bytes).unwrap();
        assert_eq!(parsed.len(), g.vtbl_slots);
        assert_eq!(&parsed[..3], &records[..]);
        assert!(parsed[3..].iter().all(Option::is_none));
    }
}
