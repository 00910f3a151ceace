//! This module implements volume writing support.
//!
//! The user specifies a series of volumes as boxed [Volume] values. Once the geometry is
//! known, each volume yields `(Vid, Vec<u8>)` pairs for its LEBs, and the [ImageWriter]
//! stamps headers and pushes the assembled PEBs into a [PebSink]. Sequence numbers are
//! strictly increasing across every header the writer emits, and each volume's PEBs are
//! emitted in increasing index order, so physical order equals logical order.

use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroU32;

use crate::error::{Error, Result};
use crate::mtd::Mtd;
use crate::ubi::geom::Geometry;
use crate::ubi::headers::{Ec, Vid, VolTableRecord, VolType, UBI_CRC, UBI_VTBL_AUTORESIZE_FLG};
use crate::util::ReadExt;

/// An output sink addressed by physical eraseblock and byte offset.
pub trait PebSink {
    fn write(&mut self, peb: u32, offset: u32, data: &[u8]) -> Result<()>;

    /// Whether each PEB must be materialized in one contiguous write, trailing 0xFF
    /// included. Seekable sinks and real flash can skip the erased tail.
    fn requires_contiguous(&self) -> bool {
        false
    }
}

/// A sink over any seekable byte stream (image files, `Vec<u8>` cursors).
pub struct IoSink<W> {
    inner: W,
    peb_size: u32,
}

impl<W: Write + Seek> IoSink<W> {
    pub fn new(inner: W, geom: &Geometry) -> Self {
        Self {
            inner,
            peb_size: geom.peb_size,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write + Seek> PebSink for IoSink<W> {
    fn write(&mut self, peb: u32, offset: u32, data: &[u8]) -> Result<()> {
        let pos = u64::from(peb) * u64::from(self.peb_size) + u64::from(offset);
        self.inner.seek(SeekFrom::Start(pos))?;
        self.inner.write_all(data)?;
        Ok(())
    }

    // Keep image files whole multiples of the PEB size so the scanner never sees a
    // truncated final eraseblock.
    fn requires_contiguous(&self) -> bool {
        true
    }
}

/// A sink over an MTD device: erases each eraseblock on first touch and remaps the image
/// PEB index past any bad blocks.
pub struct MtdSink<'a, M: Mtd> {
    mtd: &'a mut M,
    map: Vec<u32>,
    next_phys: u32,
}

impl<'a, M: Mtd> MtdSink<'a, M> {
    pub fn new(mtd: &'a mut M) -> Self {
        Self {
            mtd,
            map: Vec::new(),
            next_phys: 0,
        }
    }

    /// Find (allocating if necessary) the physical eraseblock backing image PEB `peb`.
    fn phys_for(&mut self, peb: u32) -> Result<u32> {
        while self.map.len() <= peb as usize {
            let phys = loop {
                let candidate = self.next_phys;
                if candidate >= self.mtd.info().eb_count {
                    return Err(Error::Usage(
                        "device too small for image (after skipping bad blocks)".to_string(),
                    ));
                }
                self.next_phys += 1;

                if !self.mtd.is_bad(candidate)? {
                    break candidate;
                }
            };

            self.mtd.erase(phys)?;
            self.map.push(phys);
        }

        Ok(self.map[peb as usize])
    }
}

impl<M: Mtd> PebSink for MtdSink<'_, M> {
    fn write(&mut self, peb: u32, offset: u32, data: &[u8]) -> Result<()> {
        let phys = self.phys_for(peb)?;
        self.mtd.write(phys, offset, data)
    }
}

/// Represents a UBI volume to be written to flash or an image file
pub trait Volume {
    /// Get the *preferred* volume ID that this `Volume` would like to use, if any.
    ///
    /// The caller may ignore this and supply its own `vol_id` to `into_data`, especially
    /// if there is a conflict.
    fn vol_id(&self) -> Option<u32>;

    /// How many PEBs this volume reserves.
    fn reserved_pebs(&self, geom: &Geometry) -> Result<u32>;

    /// The volume-table record declaring this volume.
    fn vtbl_record(&self, geom: &Geometry) -> Result<VolTableRecord>;

    /// Begin streaming the payload, chunked into LEB-sized pieces.
    fn into_data<'a>(
        self: Box<Self>,
        geom: &Geometry,
        vol_id: u32,
    ) -> Result<Box<dyn VolumeData + 'a>>
    where
        Self: 'a;
}

/// A provider of LEB payloads for a single volume of an image
pub trait VolumeData {
    /// Try to determine the next LEB that should be written as part of this volume.
    ///
    /// The LEB's payload is *appended* to `data`, so space for headers may be
    /// pre-reserved by the caller if desired.
    ///
    /// On success, the result is `Some(Vid)`, or `None` if there are no further LEBs.
    /// The `Vid` will not have the sqnum set to anything in particular; the caller must
    /// override this.
    fn next_leb(&mut self, data: &mut Vec<u8>) -> Result<Option<Vid>>;
}

/// A user volume, the contents of which come from a byte stream or are initially blank
pub struct BasicVolume<'a> {
    image: Option<&'a mut dyn Read>,
    vtype: VolType,
    id: Option<u32>,
    size: Option<u64>,
    name: String,
    flags: u8,
    alignment: NonZeroU32,
}

impl Default for BasicVolume<'_> {
    fn default() -> Self {
        Self {
            image: Default::default(),
            vtype: Default::default(),
            id: Default::default(),
            size: Default::default(),
            name: Default::default(),
            flags: Default::default(),
            alignment: NonZeroU32::MIN,
        }
    }
}

impl<'a> BasicVolume<'a> {
    /// Begin creating a new `BasicVolume`, of a given type
    pub fn new(vtype: VolType) -> Self {
        Self {
            vtype,
            ..Default::default()
        }
    }

    /// Change the source of the volume's contents.
    pub fn image(mut self, image: &'a mut dyn Read) -> Self {
        self.image = Some(image);
        self
    }

    /// Change the ID assigned to the volume from a default of auto-assigned.
    pub fn id(mut self, id: u32) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the size, in bytes, reserved for the volume; rounded up to whole LEBs.
    ///
    /// Mandatory for static volumes and for any volume with streamed contents.
    pub fn size(mut self, bytes: u64) -> Self {
        self.size = Some(bytes);
        self
    }

    /// Set the name of the volume.
    ///
    /// The default is `""`
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// Set the UBI "autoresize" flag.
    pub fn autoresize(mut self) -> Self {
        self.flags |= UBI_VTBL_AUTORESIZE_FLG;
        self
    }

    /// Set the alignment of the volume. All LEBs will be cut down to a multiple of this
    /// size. The default alignment is 1.
    pub fn align(mut self, alignment: NonZeroU32) -> Self {
        self.alignment = alignment;
        self
    }

    /// Usable bytes per LEB once the alignment tail is reserved.
    fn effective_leb(&self, geom: &Geometry) -> u32 {
        geom.leb_size - self.data_pad(geom)
    }

    fn data_pad(&self, geom: &Geometry) -> u32 {
        geom.leb_size % self.alignment
    }

    fn size_checked(&self) -> Result<u64> {
        match (self.size, self.vtype, self.image.is_some()) {
            (Some(bytes), _, _) => Ok(bytes),
            (None, VolType::Static, _) => Err(Error::Usage(format!(
                "static volume \"{}\" needs an explicit size",
                self.name
            ))),
            (None, _, true) => Err(Error::Usage(format!(
                "volume \"{}\" has streamed contents and needs an explicit size",
                self.name
            ))),
            (None, _, false) => Ok(0),
        }
    }
}

impl Volume for BasicVolume<'_> {
    fn vol_id(&self) -> Option<u32> {
        self.id
    }

    fn reserved_pebs(&self, geom: &Geometry) -> Result<u32> {
        let leb = u64::from(self.effective_leb(geom));
        if leb == 0 {
            return Err(Error::Usage(format!(
                "alignment {} leaves no usable space in a {}-byte LEB",
                self.alignment, geom.leb_size
            )));
        }
        Ok(self.size_checked()?.div_ceil(leb) as u32)
    }

    fn vtbl_record(&self, geom: &Geometry) -> Result<VolTableRecord> {
        Ok(VolTableRecord {
            reserved_pebs: self.reserved_pebs(geom)?,
            alignment: self.alignment.into(),
            data_pad: self.data_pad(geom),
            vol_type: self.vtype,
            upd_marker: false,
            name: self.name.clone(),
            flags: self.flags,
        })
    }

    fn into_data<'a>(
        self: Box<Self>,
        geom: &Geometry,
        vol_id: u32,
    ) -> Result<Box<dyn VolumeData + 'a>>
    where
        Self: 'a,
    {
        let used_ebs = match self.vtype {
            VolType::Dynamic => 0,
            VolType::Static => self.reserved_pebs(geom)?,
        };
        let effective_leb = self.effective_leb(geom);

        let vid = Vid {
            vol_type: self.vtype,
            vol_id,
            used_ebs,
            data_pad: self.data_pad(geom),
            ..Default::default()
        };

        // Never read more than the reserved size from the stream
        let size = self.size_checked()?;
        let image = self.image.map(|image| image.take(size));

        Ok(Box::new(BasicVolumeData {
            image,
            effective_leb,
            vid,
        }))
    }
}

struct BasicVolumeData<'a> {
    image: Option<std::io::Take<&'a mut dyn Read>>,
    effective_leb: u32,
    vid: Vid,
}

impl VolumeData for BasicVolumeData<'_> {
    fn next_leb(&mut self, data: &mut Vec<u8>) -> Result<Option<Vid>> {
        let image = match &mut self.image {
            Some(image) => image,
            None => return Ok(None),
        };

        let data_len = data.len();
        image.read_up_to(data, self.effective_leb as usize)?;
        let new_data = &data[data_len..];

        if new_data.is_empty() {
            return Ok(None);
        }

        let mut vid = self.vid;
        self.vid.lnum += 1;

        if vid.vol_type == VolType::Static {
            vid.data_size = new_data.len() as u32;
            vid.data_crc = UBI_CRC.checksum(new_data);
        }

        Ok(Some(vid))
    }
}

/// Emits whole PEBs: an EC header at offset 0, a VID header at the geometry's VID offset,
/// payload at the data offset, and (only when the sink demands contiguous PEBs) a 0xFF
/// tail out to the full eraseblock size.
pub struct ImageWriter<'a, S: PebSink> {
    geom: Geometry,
    sink: &'a mut S,
    ec: u64,
    image_seq: u32,
    sqnum: u64,
    next_peb: u32,
}

impl<'a, S: PebSink> ImageWriter<'a, S> {
    pub fn new(geom: &Geometry, sink: &'a mut S, ec: u64, image_seq: u32) -> Self {
        Self {
            geom: *geom,
            sink,
            ec,
            image_seq,
            sqnum: 0,
            next_peb: 0,
        }
    }

    /// How many PEBs have been emitted so far.
    pub fn pebs_written(&self) -> u32 {
        self.next_peb
    }

    fn next_sqnum(&mut self) -> u64 {
        self.sqnum += 1;
        self.sqnum
    }

    /// Write one mapped PEB: headers plus payload.
    pub fn write_leb(&mut self, vid: Vid, payload: &[u8]) -> Result<()> {
        let geom = self.geom;
        if payload.len() > geom.leb_size as usize {
            return Err(Error::Usage(format!(
                "LEB payload of {} bytes exceeds LEB size {}",
                payload.len(),
                geom.leb_size
            )));
        }

        let vid = vid.sqnum(self.next_sqnum());
        let peb = self.next_peb;
        self.next_peb += 1;

        let mut ec_bytes = [0u8; 64];
        Ec::new(&geom, self.ec, self.image_seq).encode(&mut ec_bytes)?;
        let mut vid_bytes = [0u8; 64];
        vid.encode(&mut vid_bytes)?;

        if self.sink.requires_contiguous() {
            let mut buf = vec![0xFFu8; geom.peb_size as usize];
            buf[..64].copy_from_slice(&ec_bytes);
            buf[geom.vid_hdr_offs as usize..][..64].copy_from_slice(&vid_bytes);
            buf[geom.data_offs as usize..][..payload.len()].copy_from_slice(payload);
            self.sink.write(peb, 0, &buf)
        } else {
            self.sink.write(peb, 0, &ec_bytes)?;
            self.sink.write(peb, geom.vid_hdr_offs, &vid_bytes)?;
            if !payload.is_empty() {
                self.sink.write(peb, geom.data_offs, payload)?;
            }
            Ok(())
        }
    }

    /// Write one free PEB: an EC header and nothing else.
    pub fn write_blank(&mut self) -> Result<()> {
        let geom = self.geom;
        let peb = self.next_peb;
        self.next_peb += 1;

        let mut ec_bytes = [0u8; 64];
        Ec::new(&geom, self.ec, self.image_seq).encode(&mut ec_bytes)?;

        if self.sink.requires_contiguous() {
            let mut buf = vec![0xFFu8; geom.peb_size as usize];
            buf[..64].copy_from_slice(&ec_bytes);
            self.sink.write(peb, 0, &buf)
        } else {
            self.sink.write(peb, 0, &ec_bytes)
        }
    }

    /// Stream one volume's LEBs in order. Returns the number of LEBs written.
    pub fn write_volume(&mut self, mut data: Box<dyn VolumeData + '_>) -> Result<u32> {
        let mut written = 0;
        let mut payload = Vec::with_capacity(self.geom.leb_size as usize);
        loop {
            payload.clear();
            match data.next_leb(&mut payload)? {
                None => return Ok(written),
                Some(vid) => {
                    self.write_leb(vid, &payload)?;
                    written += 1;
                }
            }
        }
    }
}
