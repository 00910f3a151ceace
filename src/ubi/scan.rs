//! This module contains the image scanner: a single forward pass over the PEBs of an
//! image (or device), classifying each one, followed by an ordered emission pass that
//! reconstructs per-volume byte streams.
//!
//! PEBs carrying the same `vol_id:lnum` are kept in a chain ordered by `leb_ver`
//! descending; the head is the active version and the tail is history, retained for
//! diagnostics only. Equal versions are a corruption warning, resolved in favor of the
//! later file offset.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use crate::error::{CorruptKind, Error, Result, StaticVolumeFault};
use crate::mtd::{ByteUtil, Mtd};
use crate::report::{Reporter, Severity};
use crate::ubi::geom::Geometry;
use crate::ubi::headers::{
    parse_vtbl, Ec, Vid, VolTableRecord, VolType, UBI_CRC, UBI_EC_HDR_SIZE,
    UBI_LAYOUT_VOLUME_EBS, UBI_LAYOUT_VOLUME_ID, UBI_VID_HDR_SIZE,
};
use crate::util::ReadExt;

/// One PEB observed to hold a `(vol_id, lnum)` mapping.
#[derive(Debug, Clone)]
pub struct ScanEntry {
    /// Physical eraseblock index within the scanned image.
    pub peb: u32,

    pub ec: Ec,
    pub vid: Vid,

    /// Whether the static payload CRC held up (always true for dynamic volumes).
    pub data_ok: bool,

    /// LEB payload, from the PEB's own data offset to its end. Retained for the active
    /// entry only; history entries keep headers for diagnostics.
    data: Option<Vec<u8>>,
}

/// All versions seen for one `(vol_id, lnum)`; index 0 is active.
#[derive(Debug, Default, Clone)]
struct LebSlot {
    entries: Vec<ScanEntry>,
}

impl LebSlot {
    /// Insert in `leb_ver`-descending order. On a version tie the newcomer (the later
    /// file offset) wins the active position. Demoted entries lose their payload.
    fn insert(&mut self, entry: ScanEntry) -> InsertOutcome {
        let pos = self
            .entries
            .iter()
            .position(|e| e.vid.leb_ver <= entry.vid.leb_ver)
            .unwrap_or(self.entries.len());

        let outcome = match self.entries.get(pos) {
            Some(displaced) if displaced.vid.leb_ver == entry.vid.leb_ver => {
                InsertOutcome::DuplicateVersion {
                    older_peb: displaced.peb,
                }
            }
            _ if pos == 0 => InsertOutcome::Active,
            _ => InsertOutcome::History,
        };

        self.entries.insert(pos, entry);
        for stale in &mut self.entries[1..] {
            stale.data = None;
        }

        outcome
    }
}

enum InsertOutcome {
    Active,
    History,
    DuplicateVersion { older_peb: u32 },
}

/// Per-classification PEB tallies for the scanned image.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct PebCounts {
    pub total: u32,
    pub empty: u32,
    pub free: u32,
    pub mapped: u32,
    pub corrupt: u32,
    pub bad: u32,
}

/// Per-volume report, in the shape of the UBI volume info schema.
#[derive(Debug, Clone)]
pub struct VolInfo {
    pub dev_num: i32,
    pub vol_id: u32,
    pub vol_type: VolType,
    pub rsvd_lebs: u32,
    pub data_bytes: u64,
    pub corrupted: bool,
    pub alignment: u32,
    pub name: String,
}

/// The result of scanning an image: classified PEBs and the LEB chains.
#[derive(Debug)]
pub struct Scan {
    geom: Geometry,
    slots: BTreeMap<(u32, u32), LebSlot>,
    corrupt: Vec<(u32, CorruptKind)>,
    unused: Vec<u32>,
    counts: PebCounts,
}

impl Scan {
    /// Scan a byte stream of concatenated PEBs, one forward pass.
    ///
    /// With `geom` of `None`, the layout parameters are detected from the first valid EC
    /// header; `peb_size` cannot be learned from headers and must always be presumed.
    pub fn read_image<R: Read>(
        mut image: R,
        peb_size: u32,
        geom: Option<Geometry>,
        rpt: &mut dyn Reporter,
    ) -> Result<Self> {
        let placeholder = match geom {
            Some(geom) => geom,
            None => Geometry::new(peb_size, 1, None, 1)?,
        };
        let peb_size = placeholder.peb_size;
        let mut scan = Self {
            geom: placeholder,
            slots: BTreeMap::new(),
            corrupt: Vec::new(),
            unused: Vec::new(),
            counts: PebCounts::default(),
        };
        let mut detected = geom.is_some();

        let mut buf = Vec::with_capacity(peb_size as usize);
        let mut peb = 0;
        loop {
            buf.clear();
            image.read_up_to(&mut buf, peb_size as usize)?;
            if buf.is_empty() {
                break;
            }
            if buf.len() < peb_size as usize {
                rpt.report(
                    Severity::Warning,
                    &format!("PEB {peb}: truncated to {} bytes, padding", buf.len()),
                );
                buf.resize(peb_size as usize, 0xFF);
            }

            if !detected {
                if let Ok(ec) = Ec::decode(&buf[..UBI_EC_HDR_SIZE]) {
                    scan.geom = Geometry::from_ec(peb_size, &ec)?;
                    detected = true;
                }
            }

            scan.scan_peb(peb, &buf, rpt);
            peb += 1;
        }

        if !detected {
            return Err(Error::Usage(
                "no valid EC header found; cannot infer image geometry".to_string(),
            ));
        }

        Ok(scan)
    }

    /// Scan an MTD device eraseblock by eraseblock, skipping bad blocks.
    pub fn read_mtd<M: Mtd>(
        mtd: &M,
        geom: Option<Geometry>,
        rpt: &mut dyn Reporter,
    ) -> Result<Self> {
        let info = *mtd.info();
        let geom = match geom {
            Some(geom) => geom,
            None => Geometry::new(info.eb_size, info.min_io_size, None, 1)?,
        };
        let mut scan = Self {
            geom,
            slots: BTreeMap::new(),
            corrupt: Vec::new(),
            unused: Vec::new(),
            counts: PebCounts::default(),
        };

        let mut buf = vec![0u8; info.eb_size as usize];
        for peb in 0..info.eb_count {
            if mtd.is_bad(peb)? {
                scan.counts.total += 1;
                scan.counts.bad += 1;
                continue;
            }
            mtd.read(peb, 0, &mut buf)?;
            scan.scan_peb(peb, &buf, rpt);
        }

        Ok(scan)
    }

    fn mark_corrupt(&mut self, peb: u32, kind: CorruptKind, what: &str, rpt: &mut dyn Reporter) {
        rpt.report(Severity::Warning, &format!("PEB {peb}: corrupt {what}: {kind}"));
        self.corrupt.push((peb, kind));
        self.counts.corrupt += 1;
    }

    /// Classify one PEB and, if mapped, insert it into its LEB chain.
    fn scan_peb(&mut self, peb: u32, buf: &[u8], rpt: &mut dyn Reporter) {
        self.counts.total += 1;

        // An erased magic word means UBI never touched this PEB
        if buf[..4].is_erased() {
            self.counts.empty += 1;
            self.unused.push(peb);
            return;
        }

        let ec = match Ec::decode(&buf[..UBI_EC_HDR_SIZE]) {
            Ok(ec) => ec,
            Err(kind) => return self.mark_corrupt(peb, kind, "EC header", rpt),
        };

        // The VID header location comes from the EC header just parsed, not from the
        // presumed geometry; this keeps images with non-default offsets readable.
        let vid_offs = ec.vid_hdr_offset as usize;
        if vid_offs + UBI_VID_HDR_SIZE > buf.len() || ec.data_offset as usize > buf.len() {
            return self.mark_corrupt(peb, CorruptKind::FieldRange, "EC header offsets", rpt);
        }

        let vid_area = &buf[vid_offs..vid_offs + UBI_VID_HDR_SIZE];
        if vid_area.is_erased() {
            // EC header only: the PEB is free
            self.counts.free += 1;
            self.unused.push(peb);
            return;
        }

        let vid = match Vid::decode(vid_area) {
            Ok(vid) => vid,
            Err(kind) => return self.mark_corrupt(peb, kind, "VID header", rpt),
        };

        if vid.is_layout() && vid.lnum >= UBI_LAYOUT_VOLUME_EBS {
            return self.mark_corrupt(peb, CorruptKind::FieldRange, "layout volume LEB number", rpt);
        }

        let data = &buf[ec.data_offset as usize..];
        let mut data_ok = true;
        if vid.vol_type == VolType::Static {
            if vid.data_size as usize > data.len() {
                return self.mark_corrupt(peb, CorruptKind::FieldRange, "static data size", rpt);
            }
            data_ok = UBI_CRC.checksum(&data[..vid.data_size as usize]) == vid.data_crc;
            if !data_ok {
                rpt.report(
                    Severity::Warning,
                    &format!(
                        "PEB {peb}: static volume {} LEB {} fails its data CRC",
                        vid.vol_id, vid.lnum
                    ),
                );
            }
        }

        let entry = ScanEntry {
            peb,
            ec,
            vid,
            data_ok,
            data: Some(data.to_vec()),
        };

        let slot = self.slots.entry((vid.vol_id, vid.lnum)).or_default();
        if let InsertOutcome::DuplicateVersion { older_peb } = slot.insert(entry) {
            rpt.report(
                Severity::Warning,
                &format!(
                    "volume {} LEB {}: PEBs {older_peb} and {peb} share version {}; \
                     assuming the later copy",
                    vid.vol_id, vid.lnum, vid.leb_ver
                ),
            );
        }
        self.counts.mapped += 1;
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geom
    }

    pub fn counts(&self) -> PebCounts {
        self.counts
    }

    /// PEBs that failed header validation, in scan order.
    pub fn corrupt_pebs(&self) -> &[(u32, CorruptKind)] {
        &self.corrupt
    }

    /// PEBs holding no LEB: fully erased, or carrying only an EC header.
    pub fn unused_pebs(&self) -> &[u32] {
        &self.unused
    }

    /// The active (highest-version) entry for a logical eraseblock.
    pub fn active(&self, vol_id: u32, lnum: u32) -> Option<&ScanEntry> {
        self.slots.get(&(vol_id, lnum))?.entries.first()
    }

    /// Every entry for a logical eraseblock, active first.
    pub fn chain(&self, vol_id: u32, lnum: u32) -> &[ScanEntry] {
        self.slots
            .get(&(vol_id, lnum))
            .map(|slot| slot.entries.as_slice())
            .unwrap_or_default()
    }

    /// Every populated LEB chain of one volume, in `lnum` order.
    pub fn volume_chains(&self, vol_id: u32) -> impl Iterator<Item = (u32, &[ScanEntry])> {
        self.slots
            .range((vol_id, 0)..=(vol_id, u32::MAX))
            .map(|(&(_, lnum), slot)| (lnum, slot.entries.as_slice()))
    }

    /// Highest sequence number seen anywhere in the image.
    pub fn max_sqnum(&self) -> u64 {
        self.slots
            .values()
            .flat_map(|slot| slot.entries.iter())
            .map(|e| e.vid.sqnum)
            .max()
            .unwrap_or(0)
    }

    /// Physical position and header of each active layout-volume copy.
    pub fn layout_copies(&self) -> [Option<&ScanEntry>; 2] {
        [
            self.active(UBI_LAYOUT_VOLUME_ID, 0),
            self.active(UBI_LAYOUT_VOLUME_ID, 1),
        ]
    }

    /// Reconstruct the volume table from the layout volume.
    ///
    /// Both copies are consulted; a copy with any corrupt record is discarded whole. Of
    /// the surviving copies the one with the higher `leb_ver` wins, and if both carry the
    /// same version but different contents, the higher `sqnum` is preferred and the
    /// inconsistency is reported.
    pub fn volume_table(&self, rpt: &mut dyn Reporter) -> Result<Vec<Option<VolTableRecord>>> {
        let mut best: Option<(&ScanEntry, Vec<Option<VolTableRecord>>)> = None;

        for copy in self.layout_copies().into_iter().flatten() {
            let data = match &copy.data {
                Some(data) => data,
                None => continue,
            };
            let records = match parse_vtbl(&self.geom, data) {
                Ok(records) => records,
                Err(kind) => {
                    rpt.report(
                        Severity::Warning,
                        &format!(
                            "PEB {}: volume table copy {} unusable: {kind}",
                            copy.peb, copy.vid.lnum
                        ),
                    );
                    continue;
                }
            };

            best = match best.take() {
                None => Some((copy, records)),
                Some((prev, prev_records)) => {
                    if prev_records != records {
                        rpt.report(
                            Severity::Warning,
                            &format!(
                                "volume table copies disagree (versions {} and {})",
                                prev.vid.leb_ver, copy.vid.leb_ver
                            ),
                        );
                    }

                    let key = |e: &ScanEntry| (e.vid.leb_ver, e.vid.sqnum);
                    if key(copy) > key(prev) {
                        Some((copy, records))
                    } else {
                        Some((prev, prev_records))
                    }
                }
            };
        }

        match best {
            Some((_, records)) => Ok(records),
            None => Err(Error::CorruptHeader {
                kind: CorruptKind::CrcMismatch,
                peb: self.layout_copies()[0].map(|e| e.peb).unwrap_or(0),
            }),
        }
    }

    /// Build a stand-in volume table from the mapped PEBs alone, for images whose layout
    /// volume did not survive.
    pub fn synthesized_table(&self) -> Vec<Option<VolTableRecord>> {
        let mut table: Vec<Option<VolTableRecord>> = vec![None; self.geom.vtbl_slots];

        for ((vol_id, lnum), slot) in &self.slots {
            let Some(record) = table
                .get_mut(*vol_id as usize)
                .filter(|_| *vol_id != UBI_LAYOUT_VOLUME_ID)
            else {
                continue;
            };
            let entry = &slot.entries[0];

            let record = record.get_or_insert_with(|| VolTableRecord {
                alignment: 1,
                data_pad: entry.vid.data_pad,
                vol_type: entry.vid.vol_type,
                ..Default::default()
            });
            record.reserved_pebs = record.reserved_pebs.max(lnum + 1);
        }

        table
    }

    /// Per-volume summaries for a reconstructed table.
    pub fn volume_infos(&self, dev_num: i32, table: &[Option<VolTableRecord>]) -> Vec<VolInfo> {
        table
            .iter()
            .enumerate()
            .filter_map(|(vol_id, record)| {
                let record = record.as_ref()?;
                let vol_id = vol_id as u32;

                Some(VolInfo {
                    dev_num,
                    vol_id,
                    vol_type: record.vol_type,
                    rsvd_lebs: record.reserved_pebs,
                    data_bytes: self.volume_bytes(vol_id, record),
                    corrupted: record.upd_marker,
                    alignment: record.alignment,
                    name: record.name.clone(),
                })
            })
            .collect()
    }

    fn effective_leb(&self, record: &VolTableRecord) -> u64 {
        u64::from(self.geom.leb_size.saturating_sub(record.data_pad))
    }

    /// Declared output length of a volume: `sum(data_size)` for static volumes, the full
    /// reserved range for dynamic volumes.
    fn volume_bytes(&self, vol_id: u32, record: &VolTableRecord) -> u64 {
        match record.vol_type {
            VolType::Dynamic => u64::from(record.reserved_pebs) * self.effective_leb(record),
            VolType::Static => (0..self.static_used_ebs(vol_id))
                .filter_map(|lnum| self.active(vol_id, lnum))
                .map(|e| u64::from(e.vid.data_size))
                .sum(),
        }
    }

    fn static_used_ebs(&self, vol_id: u32) -> u32 {
        // Every LEB of a static volume is stamped with the same used_ebs
        self.slots
            .range((vol_id, 0)..=(vol_id, u32::MAX))
            .next()
            .map(|(_, slot)| slot.entries[0].vid.used_ebs)
            .unwrap_or(0)
    }

    /// Emit one volume's reconstructed byte stream.
    ///
    /// Dynamic volumes cover their whole reserved range, with missing LEBs filled with
    /// 0xFF. Static volumes must be complete and CRC-clean; a hole or a bad payload
    /// aborts this volume (and only this volume) with [Error::BrokenStaticVolume].
    pub fn read_volume<W: Write>(
        &self,
        vol_id: u32,
        record: &VolTableRecord,
        out: &mut W,
        rpt: &mut dyn Reporter,
    ) -> Result<u64> {
        let effective_leb = self.effective_leb(record) as usize;
        let mut written = 0u64;

        let leb_payload = |entry: &ScanEntry, len: usize| -> Vec<u8> {
            let mut bytes = entry.data.clone().unwrap_or_default();
            bytes.resize(len, 0xFF);
            bytes
        };

        match record.vol_type {
            VolType::Dynamic => {
                for lnum in 0..record.reserved_pebs {
                    match self.active(vol_id, lnum) {
                        Some(entry) => out.write_all(&leb_payload(entry, effective_leb))?,
                        None => out.write_all(&vec![0xFF; effective_leb])?,
                    }
                    written += effective_leb as u64;
                }
            }
            VolType::Static => {
                let used_ebs = self.static_used_ebs(vol_id);
                for lnum in 0..used_ebs {
                    let entry = self.active(vol_id, lnum).ok_or(Error::BrokenStaticVolume {
                        vol_id,
                        fault: StaticVolumeFault::MissingLnum(lnum),
                    })?;
                    if !entry.data_ok {
                        return Err(Error::BrokenStaticVolume {
                            vol_id,
                            fault: StaticVolumeFault::BadCrcLnum(lnum),
                        });
                    }

                    let data_size = entry.vid.data_size as usize;
                    if lnum + 1 < used_ebs && data_size != effective_leb {
                        rpt.report(
                            Severity::Warning,
                            &format!(
                                "volume {vol_id} LEB {lnum}: interior data size {data_size} \
                                 differs from LEB size {effective_leb}"
                            ),
                        );
                    }

                    out.write_all(&leb_payload(entry, data_size))?;
                    written += data_size as u64;
                }
            }
        }

        Ok(written)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::report::Quiet;
    use crate::ubi::write::{ImageWriter, IoSink};

    fn geom() -> Geometry {
        Geometry::new(2048, 64, Some(64), 1).unwrap()
    }

    enum Op {
        Blank,
        Leb(Vid, Vec<u8>),
    }

    fn build_image(geom: &Geometry, ops: Vec<Op>) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        let mut sink = IoSink::new(&mut cursor, geom);
        let mut writer = ImageWriter::new(geom, &mut sink, 0, 0);
        for op in ops {
            match op {
                Op::Blank => writer.write_blank().unwrap(),
                Op::Leb(vid, payload) => writer.write_leb(vid, &payload).unwrap(),
            }
        }
        cursor.into_inner()
    }

    #[test]
    fn test_classification() -> Result<()> {
        let geom = geom();
        let mut image = build_image(
            &geom,
            vec![
                Op::Blank, // free: EC only
                Op::Leb(
                    Vid {
                        vol_id: 0,
                        lnum: 0,
                        ..Default::default()
                    },
                    vec![0xAA; 64],
                ),
            ],
        );

        // Append one erased PEB and one garbage PEB
        image.extend(vec![0xFF; 2048]);
        image.extend(vec![0x55; 2048]);

        let scan = Scan::read_image(&image[..], geom.peb_size, Some(geom), &mut Quiet)?;
        let counts = scan.counts();
        assert_eq!(counts.total, 4);
        assert_eq!(counts.free, 1);
        assert_eq!(counts.mapped, 1);
        assert_eq!(counts.empty, 1);
        assert_eq!(counts.corrupt, 1);
        assert_eq!(
            scan.corrupt_pebs(),
            &[(3, CorruptKind::MagicMismatch)]
        );
        Ok(())
    }

    #[test]
    fn test_higher_version_wins() -> Result<()> {
        let geom = geom();
        let payload_old = vec![0x01u8; geom.leb_size as usize];
        let payload_new = vec![0x02u8; geom.leb_size as usize];

        let vid = Vid {
            vol_id: 4,
            lnum: 0,
            ..Default::default()
        };
        let image = build_image(
            &geom,
            vec![
                Op::Leb(vid, payload_old),
                Op::Leb(vid.leb_ver(1), payload_new.clone()),
            ],
        );

        let scan = Scan::read_image(&image[..], geom.peb_size, Some(geom), &mut Quiet)?;
        let active = scan.active(4, 0).unwrap();
        assert_eq!(active.vid.leb_ver, 1);
        assert_eq!(active.peb, 1);
        assert_eq!(active.data.as_deref(), Some(&payload_new[..]));

        // The demoted version is still visible as history, sans payload
        let chain = scan.chain(4, 0);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1].vid.leb_ver, 0);
        assert!(chain[1].data.is_none());
        Ok(())
    }

    #[test]
    fn test_equal_version_prefers_later_offset() -> Result<()> {
        let geom = geom();
        let vid = Vid {
            vol_id: 4,
            lnum: 0,
            ..Default::default()
        };
        let image = build_image(
            &geom,
            vec![
                Op::Leb(vid, vec![0x01; 32]),
                Op::Leb(vid, vec![0x02; 32]),
            ],
        );

        let mut warnings = Vec::new();
        let mut rpt = |sev: Severity, msg: &str| {
            if sev == Severity::Warning {
                warnings.push(msg.to_string());
            }
        };
        let scan = Scan::read_image(&image[..], geom.peb_size, Some(geom), &mut rpt)?;

        let active = scan.active(4, 0).unwrap();
        assert_eq!(active.peb, 1);
        assert_eq!(scan.chain(4, 0).len(), 2);
        assert!(warnings.iter().any(|w| w.contains("share version")));
        Ok(())
    }

    #[test]
    fn test_vid_offset_taken_from_ec_header() -> Result<()> {
        // Write with a non-default VID offset, scan with only the PEB size presumed
        let geom = Geometry::new(2048, 64, Some(128), 1).unwrap();
        let image = build_image(
            &geom,
            vec![Op::Leb(
                Vid {
                    vol_id: 2,
                    lnum: 0,
                    ..Default::default()
                },
                vec![0x77; 100],
            )],
        );

        let scan = Scan::read_image(&image[..], geom.peb_size, None, &mut Quiet)?;
        assert_eq!(scan.geometry().vid_hdr_offs, 128);
        assert!(scan.active(2, 0).is_some());
        Ok(())
    }
}
