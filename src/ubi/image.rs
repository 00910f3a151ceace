//! Whole-image operations: the driver surfaces the CLI tools are thin wrappers over.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result, StaticVolumeFault};
use crate::mtd::Mtd;
use crate::report::{Reporter, Severity};
use crate::ubi::geom::Geometry;
use crate::ubi::headers::{
    build_vtbl, Ec, Vid, VolTableRecord, VolType, UBI_EC_HDR_SIZE, UBI_LAYOUT_VOLUME_COMPAT,
    UBI_LAYOUT_VOLUME_EBS, UBI_LAYOUT_VOLUME_ID, UBI_VID_HDR_SIZE,
};
use crate::ubi::scan::Scan;
use crate::ubi::write::{ImageWriter, PebSink, Volume};

/// Image-wide knobs for [create_image].
#[derive(Debug, Copy, Clone)]
pub struct ImageParams {
    /// Erase counter stamped uniformly on every PEB.
    pub ec: u64,

    /// Image sequence number stamped on every EC header.
    pub image_seq: u32,

    /// Emit EC-header-only blanks out to this many PEBs (e.g. the whole device), beyond
    /// the reserved ranges.
    pub total_pebs: Option<u32>,
}

impl Default for ImageParams {
    fn default() -> Self {
        Self {
            ec: 0,
            image_seq: 0,
            total_pebs: None,
        }
    }
}

/// What [create_image] ended up emitting.
#[derive(Debug)]
pub struct CreateSummary {
    pub pebs_written: u32,
    pub volumes: u32,
    pub table: Vec<Option<VolTableRecord>>,
}

/// Build a complete UBI image: two layout PEBs holding the volume table, each volume's
/// LEBs in declaration order, and EC-header-only blanks covering the rest of the
/// reserved space.
pub fn create_image<'a, S: PebSink>(
    geom: &Geometry,
    params: &ImageParams,
    volumes: Vec<Box<dyn Volume + 'a>>,
    sink: &mut S,
    rpt: &mut dyn Reporter,
) -> Result<CreateSummary> {
    // Resolve volume IDs: explicit IDs must be unique and in range, the rest are
    // allocated lowest-first.
    let mut used = vec![false; geom.vtbl_slots];
    let mut assigned = Vec::with_capacity(volumes.len());
    for volume in &volumes {
        let id = match volume.vol_id() {
            Some(id) => {
                if id as usize >= geom.vtbl_slots {
                    return Err(Error::Usage(format!(
                        "volume id {id} out of range (volume table has {} slots)",
                        geom.vtbl_slots
                    )));
                }
                if used[id as usize] {
                    return Err(Error::Usage(format!("volume id {id} declared twice")));
                }
                id
            }
            None => used
                .iter()
                .position(|&taken| !taken)
                .ok_or_else(|| Error::Usage("no free volume id left".to_string()))?
                as u32,
        };
        used[id as usize] = true;
        assigned.push(id);
    }

    // The volume table is fully known up front, so the layout volume goes first.
    let mut table: Vec<Option<VolTableRecord>> = vec![None; geom.vtbl_slots];
    let mut reserved_total = 0;
    for (volume, &id) in volumes.iter().zip(&assigned) {
        reserved_total += volume.reserved_pebs(geom)?;
        table[id as usize] = Some(volume.vtbl_record(geom)?);
    }
    let vtbl = build_vtbl(geom, &table)?;

    let needed_pebs = UBI_LAYOUT_VOLUME_EBS + reserved_total;
    if let Some(total) = params.total_pebs {
        if total < needed_pebs {
            return Err(Error::Usage(format!(
                "{needed_pebs} PEBs needed but only {total} available"
            )));
        }
    }

    let mut writer = ImageWriter::new(geom, sink, params.ec, params.image_seq);

    for lnum in 0..UBI_LAYOUT_VOLUME_EBS {
        let vid = Vid {
            vol_type: VolType::Dynamic,
            compat: UBI_LAYOUT_VOLUME_COMPAT,
            vol_id: UBI_LAYOUT_VOLUME_ID,
            lnum,
            ..Default::default()
        };
        writer.write_leb(vid, &vtbl)?;
    }

    for (volume, &id) in volumes.into_iter().zip(&assigned) {
        let reserved = volume.reserved_pebs(geom)?;
        let data = volume.into_data(geom, id)?;
        let written = writer.write_volume(data)?;
        if written > reserved {
            return Err(Error::Usage(format!(
                "volume {id} produced {written} LEBs but reserved only {reserved}"
            )));
        }
        rpt.report(
            Severity::Info,
            &format!("volume {id}: {written} of {reserved} reserved LEBs written"),
        );
    }

    let target = params.total_pebs.unwrap_or(needed_pebs);
    while writer.pebs_written() < target.max(needed_pebs) {
        writer.write_blank()?;
    }

    Ok(CreateSummary {
        pebs_written: writer.pebs_written(),
        volumes: assigned.len() as u32,
        table,
    })
}

/// One recovered volume on disk.
#[derive(Debug)]
pub struct ExtractedVolume {
    pub vol_id: u32,
    pub bytes: u64,
    pub path: PathBuf,
}

#[derive(Debug, Default)]
pub struct ExtractSummary {
    pub volumes: Vec<ExtractedVolume>,
    pub broken: Vec<(u32, StaticVolumeFault)>,
}

/// Scan an image stream and write each recovered volume to `<dir>/ubivol_<id>.bin`.
///
/// Broken static volumes are reported and skipped; they do not abort the extraction.
/// When the layout volume itself did not survive, extraction falls back to the mapped
/// PEBs alone.
pub fn extract_image<R: Read, P: AsRef<Path>>(
    image: R,
    peb_size: u32,
    geom: Option<Geometry>,
    dir: P,
    rpt: &mut dyn Reporter,
) -> Result<ExtractSummary> {
    let scan = Scan::read_image(image, peb_size, geom, rpt)?;

    let table = match scan.volume_table(rpt) {
        Ok(table) => table,
        Err(err) => {
            rpt.report(
                Severity::Warning,
                &format!("{err}; reconstructing volumes from mapped PEBs alone"),
            );
            scan.synthesized_table()
        }
    };

    fs::create_dir_all(&dir)?;

    for info in scan.volume_infos(0, &table) {
        rpt.report(
            Severity::Info,
            &format!(
                "volume {} (\"{}\"): {:?}, {} reserved LEBs, {} bytes{}",
                info.vol_id,
                info.name,
                info.vol_type,
                info.rsvd_lebs,
                info.data_bytes,
                if info.corrupted { ", update interrupted" } else { "" },
            ),
        );
    }

    let mut summary = ExtractSummary::default();
    for (vol_id, record) in table.iter().enumerate() {
        let Some(record) = record else { continue };
        let vol_id = vol_id as u32;

        let path = dir.as_ref().join(format!("ubivol_{vol_id}.bin"));
        let mut file = File::create(&path)?;

        match scan.read_volume(vol_id, record, &mut file, rpt) {
            Ok(bytes) => {
                summary.volumes.push(ExtractedVolume {
                    vol_id,
                    bytes,
                    path,
                });
            }
            Err(Error::BrokenStaticVolume { vol_id, fault }) => {
                rpt.report(
                    Severity::Error,
                    &format!("static volume {vol_id} is broken: {fault}"),
                );
                drop(file);
                fs::remove_file(&path)?;
                summary.broken.push((vol_id, fault));
            }
            Err(err) => return Err(err),
        }
    }

    Ok(summary)
}

/// Re-serialize a mutated volume table into both layout PEBs, with the LEB version
/// bumped past every copy seen on the device.
fn rewrite_layout<M: Mtd>(
    mtd: &mut M,
    scan: &Scan,
    table: &[Option<VolTableRecord>],
    rpt: &mut dyn Reporter,
) -> Result<()> {
    let geom = *scan.geometry();
    let vtbl = build_vtbl(&geom, table)?;

    let copies = scan.layout_copies();
    let leb_ver = copies
        .into_iter()
        .flatten()
        .map(|e| e.vid.leb_ver)
        .max()
        .map_or(0, |v| v + 1);
    let mut sqnum = scan.max_sqnum();
    let mut spares = scan.unused_pebs().iter().copied();

    for (lnum, copy) in copies.into_iter().enumerate() {
        let (peb, ec) = match copy {
            Some(entry) => (entry.peb, entry.ec.inc_ec()),
            None => {
                let peb = spares.next().ok_or_else(|| {
                    Error::Usage("no spare PEB to hold a volume table copy".to_string())
                })?;
                rpt.report(
                    Severity::Warning,
                    &format!("volume table copy {lnum} was missing; rebuilding it in PEB {peb}"),
                );
                (peb, Ec::new(&geom, 1, 0))
            }
        };

        sqnum += 1;
        let vid = Vid {
            vol_type: VolType::Dynamic,
            compat: UBI_LAYOUT_VOLUME_COMPAT,
            vol_id: UBI_LAYOUT_VOLUME_ID,
            lnum: lnum as u32,
            leb_ver,
            sqnum,
            ..Default::default()
        };

        mtd.erase(peb)?;

        let mut hdr = [0u8; UBI_EC_HDR_SIZE];
        ec.encode(&mut hdr)?;
        mtd.write(peb, 0, &hdr)?;

        let mut hdr = [0u8; UBI_VID_HDR_SIZE];
        vid.encode(&mut hdr)?;
        mtd.write(peb, geom.vid_hdr_offs, &hdr)?;

        mtd.write(peb, geom.data_offs, &vtbl)?;
    }

    Ok(())
}

/// Erase every PEB mapped to a volume, preserving erase counters.
fn release_volume_pebs<M: Mtd>(mtd: &mut M, scan: &Scan, vol_id: u32) -> Result<()> {
    let geom = scan.geometry();

    let pebs: Vec<(u32, Ec)> = scan
        .volume_chains(vol_id)
        .flat_map(|(_, chain)| chain.iter().map(|e| (e.peb, e.ec)))
        .collect();

    for (peb, ec) in pebs {
        mtd.erase(peb)?;
        let mut hdr = [0u8; UBI_EC_HDR_SIZE];
        Ec {
            vid_hdr_offset: geom.vid_hdr_offs,
            data_offset: geom.data_offs,
            ..ec.inc_ec()
        }
        .encode(&mut hdr)?;
        mtd.write(peb, 0, &hdr)?;
    }

    Ok(())
}

/// Remove a volume: drop its record from both volume-table copies and release its PEBs.
pub fn remove_volume<M: Mtd>(mtd: &mut M, vol_id: u32, rpt: &mut dyn Reporter) -> Result<()> {
    let scan = Scan::read_mtd(mtd, None, rpt)?;
    let mut table = scan.volume_table(rpt)?;

    let slot = table
        .get_mut(vol_id as usize)
        .ok_or_else(|| Error::Usage(format!("volume id {vol_id} out of range")))?;
    if slot.take().is_none() {
        return Err(Error::Usage(format!("volume {vol_id} does not exist")));
    }

    rewrite_layout(mtd, &scan, &table, rpt)?;
    release_volume_pebs(mtd, &scan, vol_id)
}

/// Change a volume's reservation, in PEBs, in both volume-table copies.
pub fn resize_volume<M: Mtd>(
    mtd: &mut M,
    vol_id: u32,
    reserved_pebs: u32,
    rpt: &mut dyn Reporter,
) -> Result<()> {
    let scan = Scan::read_mtd(mtd, None, rpt)?;
    let mut table = scan.volume_table(rpt)?;

    let record = table
        .get_mut(vol_id as usize)
        .and_then(Option::as_mut)
        .ok_or_else(|| Error::Usage(format!("volume {vol_id} does not exist")))?;

    // A volume's mapped payload cannot be shrunk away
    let in_use = scan
        .volume_chains(vol_id)
        .map(|(lnum, _)| lnum + 1)
        .max()
        .unwrap_or(0);
    if reserved_pebs < in_use {
        return Err(Error::Usage(format!(
            "volume {vol_id} has {in_use} LEBs in use; cannot shrink to {reserved_pebs}"
        )));
    }

    record.reserved_pebs = reserved_pebs;
    rewrite_layout(mtd, &scan, &table, rpt)
}

#[derive(Debug, Default, Eq, PartialEq)]
pub struct EraseSummary {
    pub erased: u32,
    pub skipped_bad: u32,
    pub failed: u32,
}

/// Erase every eraseblock of a device, skipping bad blocks.
///
/// `after_erase` runs once per successfully erased block; the JFFS2 cleanmarker of the
/// `eraseall` tool is wired through here, keeping the core format-agnostic. Erase
/// failures are reported and counted, not retried.
pub fn erase_all<M: Mtd>(
    mtd: &mut M,
    mut after_erase: Option<&mut dyn FnMut(&mut M, u32) -> Result<()>>,
    rpt: &mut dyn Reporter,
) -> Result<EraseSummary> {
    let mut summary = EraseSummary::default();

    for eb in 0..mtd.info().eb_count {
        if mtd.is_bad(eb)? {
            rpt.report(Severity::Info, &format!("skipping bad block {eb}"));
            summary.skipped_bad += 1;
            continue;
        }

        if let Err(err) = mtd.erase(eb) {
            rpt.report(Severity::Warning, &format!("erase of block {eb} failed: {err}"));
            summary.failed += 1;
            continue;
        }
        summary.erased += 1;

        if let Some(hook) = after_erase.as_mut() {
            hook(mtd, eb)?;
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Cursor;

    use crate::error::CorruptKind;
    use crate::mtd::{ByteUtil, MemMtd};
    use crate::report::Quiet;
    use crate::ubi::write::{BasicVolume, IoSink, MtdSink};

    /// The NAND-style geometry of the end-to-end scenarios: 128 KiB PEBs, 2 KiB pages.
    fn nand_geom() -> Geometry {
        Geometry::new(128 * 1024, 2048, Some(2048), 1).unwrap()
    }

    /// A small geometry that keeps hand-built images readable.
    fn small_geom() -> Geometry {
        Geometry::new(2048, 64, Some(64), 1).unwrap()
    }

    /// One dynamic volume (id 0, "test", 4 PEBs reserved) holding two LEBs of payload.
    fn dynamic_image() -> (Geometry, Vec<u8>, Vec<u8>) {
        let geom = nand_geom();
        let leb = geom.leb_size as usize;
        assert_eq!(leb, 126976);

        let mut payload = vec![0xA5u8; 1024];
        payload.extend(vec![0x00; 125952]);
        payload.extend(vec![0x5A; 126976]);
        assert_eq!(payload.len(), 2 * leb);

        let mut reader = &payload[..];
        let volumes: Vec<Box<dyn Volume + '_>> = vec![Box::new(
            BasicVolume::new(VolType::Dynamic)
                .id(0)
                .name("test")
                .size(4 * leb as u64)
                .image(&mut reader),
        )];

        let mut cursor = Cursor::new(Vec::new());
        let mut sink = IoSink::new(&mut cursor, &geom);
        let summary =
            create_image(&geom, &ImageParams::default(), volumes, &mut sink, &mut Quiet).unwrap();
        assert_eq!(summary.pebs_written, 6); // 2 layout + 4 reserved

        (geom, cursor.into_inner(), payload)
    }

    #[test]
    fn test_create_extract_dynamic() {
        let (geom, image, payload) = dynamic_image();
        let leb = geom.leb_size as usize;
        assert_eq!(image.len(), 6 * geom.peb_size as usize);

        let scan = Scan::read_image(&image[..], geom.peb_size, None, &mut Quiet).unwrap();
        assert_eq!(scan.geometry(), &geom);

        let table = scan.volume_table(&mut Quiet).unwrap();
        let record = table[0].clone().unwrap();
        assert_eq!(record.name, "test");
        assert_eq!(record.reserved_pebs, 4);
        assert!(table[1..].iter().all(Option::is_none));

        let mut out = Vec::new();
        let bytes = scan.read_volume(0, &record, &mut out, &mut Quiet).unwrap();
        assert_eq!(bytes, 4 * leb as u64);
        assert_eq!(&out[..2 * leb], &payload[..]);
        assert!(out[2 * leb..].is_erased());

        let infos = scan.volume_infos(0, &table);
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name, "test");
        assert_eq!(infos[0].rsvd_lebs, 4);
        assert_eq!(infos[0].data_bytes, 4 * leb as u64);
        assert!(!infos[0].corrupted);
    }

    #[test]
    fn test_sqnums_strictly_monotonic() {
        let (geom, image, _) = dynamic_image();

        let mut last = 0;
        for peb in 0..6u32 {
            let base = peb as usize * geom.peb_size as usize;
            let vid_area = &image[base + 2048..base + 2048 + UBI_VID_HDR_SIZE];
            if vid_area.is_erased() {
                continue;
            }
            let vid = Vid::decode(vid_area).unwrap();
            assert!(vid.sqnum > last, "sqnum not increasing at PEB {peb}");
            last = vid.sqnum;
        }
        assert_eq!(last, 4); // 2 layout LEBs + 2 data LEBs
    }

    #[test]
    fn test_static_short_last_leb() {
        let geom = nand_geom();
        let payload: Vec<u8> = (0..200000u32).map(|i| (i % 251) as u8).collect();

        let mut reader = &payload[..];
        let volumes: Vec<Box<dyn Volume + '_>> = vec![Box::new(
            BasicVolume::new(VolType::Static)
                .id(1)
                .name("kernel")
                .size(200000)
                .image(&mut reader),
        )];

        let mut cursor = Cursor::new(Vec::new());
        let mut sink = IoSink::new(&mut cursor, &geom);
        create_image(&geom, &ImageParams::default(), volumes, &mut sink, &mut Quiet).unwrap();
        let mut image = cursor.into_inner();

        let scan = Scan::read_image(&image[..], geom.peb_size, Some(geom), &mut Quiet).unwrap();
        let lnum0 = scan.active(1, 0).unwrap();
        let lnum1 = scan.active(1, 1).unwrap();
        assert_eq!(lnum0.vid.data_size, 126976);
        assert_eq!(lnum1.vid.data_size, 73024);
        assert_eq!(lnum0.vid.used_ebs, 2);
        assert_eq!(lnum1.vid.used_ebs, 2);

        let record = scan.volume_table(&mut Quiet).unwrap()[1].clone().unwrap();
        let mut out = Vec::new();
        let bytes = scan.read_volume(1, &record, &mut out, &mut Quiet).unwrap();
        assert_eq!(bytes, 200000);
        assert_eq!(out, payload);

        // Corrupting the final payload byte of LEB 1 breaks the volume, cleanly
        let last_byte = 3 * geom.peb_size as usize + geom.data_offs as usize + 73024 - 1;
        image[last_byte] ^= 0xFF;

        let scan = Scan::read_image(&image[..], geom.peb_size, Some(geom), &mut Quiet).unwrap();
        let err = scan
            .read_volume(1, &record, &mut Vec::new(), &mut Quiet)
            .unwrap_err();
        match err {
            Error::BrokenStaticVolume { vol_id, fault } => {
                assert_eq!(vol_id, 1);
                assert_eq!(fault, StaticVolumeFault::BadCrcLnum(1));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_higher_version_override() {
        let geom = small_geom();
        let leb = geom.leb_size as usize;
        let p1 = vec![0x01u8; leb];
        let p2 = vec![0x02u8; leb];

        let mut table: Vec<Option<VolTableRecord>> = vec![None; geom.vtbl_slots];
        table[0] = Some(VolTableRecord {
            reserved_pebs: 4,
            alignment: 1,
            vol_type: VolType::Dynamic,
            name: "v".to_string(),
            ..Default::default()
        });
        let vtbl = build_vtbl(&geom, &table).unwrap();

        let mut cursor = Cursor::new(Vec::new());
        let mut sink = IoSink::new(&mut cursor, &geom);
        let mut writer = ImageWriter::new(&geom, &mut sink, 0, 0);
        for lnum in 0..2 {
            let vid = Vid {
                vol_type: VolType::Dynamic,
                compat: UBI_LAYOUT_VOLUME_COMPAT,
                vol_id: UBI_LAYOUT_VOLUME_ID,
                lnum,
                ..Default::default()
            };
            writer.write_leb(vid, &vtbl).unwrap();
        }

        let vid = Vid {
            vol_id: 0,
            lnum: 0,
            ..Default::default()
        };
        writer.write_leb(vid, &p1).unwrap(); // PEB 2, version 0
        writer.write_blank().unwrap();
        writer.write_blank().unwrap();
        writer.write_leb(vid.leb_ver(1), &p2).unwrap(); // PEB 5, version 1
        let image = cursor.into_inner();

        let scan = Scan::read_image(&image[..], geom.peb_size, Some(geom), &mut Quiet).unwrap();
        assert_eq!(scan.active(0, 0).unwrap().peb, 5);

        let record = scan.volume_table(&mut Quiet).unwrap()[0].clone().unwrap();
        let mut out = Vec::new();
        scan.read_volume(0, &record, &mut out, &mut Quiet).unwrap();
        assert_eq!(&out[..leb], &p2[..]);
    }

    #[test]
    fn test_corrupt_ec_header() {
        let (geom, mut image, payload) = dynamic_image();
        let leb = geom.leb_size as usize;

        // Flip one bit inside the erase counter of PEB 3 (the volume's LEB 1)
        image[3 * geom.peb_size as usize + 10] ^= 0x01;

        let mut warnings = Vec::new();
        let mut rpt = |sev: Severity, msg: &str| {
            if sev >= Severity::Warning {
                warnings.push(msg.to_string());
            }
        };
        let scan = Scan::read_image(&image[..], geom.peb_size, Some(geom), &mut rpt).unwrap();
        assert!(scan
            .corrupt_pebs()
            .contains(&(3, CorruptKind::CrcMismatch)));
        assert!(warnings.iter().any(|w| w.contains("PEB 3")));

        // The LEB is treated as missing: a dynamic volume reads back 0xFF there
        let record = scan.volume_table(&mut Quiet).unwrap()[0].clone().unwrap();
        let mut out = Vec::new();
        scan.read_volume(0, &record, &mut out, &mut Quiet).unwrap();
        assert_eq!(&out[..leb], &payload[..leb]);
        assert!(out[leb..2 * leb].is_erased());
    }

    #[test]
    fn test_dual_layout_divergence() {
        let geom = small_geom();
        let mut reader = &[0x33u8; 100][..];
        let volumes: Vec<Box<dyn Volume + '_>> = vec![Box::new(
            BasicVolume::new(VolType::Dynamic)
                .id(0)
                .name("test")
                .size(100)
                .image(&mut reader),
        )];

        let mut cursor = Cursor::new(Vec::new());
        let mut sink = IoSink::new(&mut cursor, &geom);
        let summary =
            create_image(&geom, &ImageParams::default(), volumes, &mut sink, &mut Quiet).unwrap();
        let mut image = cursor.into_inner();

        // Rewrite the second layout copy with a newer version and a changed name
        let mut table2 = summary.table.clone();
        table2[0].as_mut().unwrap().name = "newname".to_string();
        let vtbl2 = build_vtbl(&geom, &table2).unwrap();

        let vid = Vid {
            vol_type: VolType::Dynamic,
            compat: UBI_LAYOUT_VOLUME_COMPAT,
            vol_id: UBI_LAYOUT_VOLUME_ID,
            lnum: 1,
            leb_ver: 1,
            sqnum: 99,
            ..Default::default()
        };
        let base = geom.peb_size as usize; // layout copy 1 lives in PEB 1
        vid.encode(&mut image[base + geom.vid_hdr_offs as usize..]).unwrap();
        image[base + geom.data_offs as usize..base + geom.peb_size as usize]
            .copy_from_slice(&vtbl2);

        let scan = Scan::read_image(&image[..], geom.peb_size, Some(geom), &mut Quiet).unwrap();
        let table = scan.volume_table(&mut Quiet).unwrap();
        assert_eq!(table[0].as_ref().unwrap().name, "newname");
    }

    #[test]
    fn test_extract_to_directory() -> Result<()> {
        let geom = small_geom();
        let rootfs: Vec<u8> = (0..3000).map(|i| (i % 7) as u8).collect();
        let kernel: Vec<u8> = (0..2500).map(|i| (i % 13) as u8).collect();

        let mut rootfs_reader = &rootfs[..];
        let mut kernel_reader = &kernel[..];
        let volumes: Vec<Box<dyn Volume + '_>> = vec![
            Box::new(
                BasicVolume::new(VolType::Dynamic)
                    .name("rootfs")
                    .size(rootfs.len() as u64)
                    .image(&mut rootfs_reader),
            ),
            Box::new(
                BasicVolume::new(VolType::Static)
                    .name("kernel")
                    .size(kernel.len() as u64)
                    .image(&mut kernel_reader),
            ),
        ];

        let mut cursor = Cursor::new(Vec::new());
        let mut sink = IoSink::new(&mut cursor, &geom);
        create_image(&geom, &ImageParams::default(), volumes, &mut sink, &mut Quiet)?;
        let image = cursor.into_inner();

        let dir = tempfile::tempdir()?;
        let summary = extract_image(&image[..], geom.peb_size, None, dir.path(), &mut Quiet)?;
        assert!(summary.broken.is_empty());
        assert_eq!(summary.volumes.len(), 2);

        // Dynamic volumes come back padded out to their reservation
        let leb = geom.leb_size as usize;
        let out0 = fs::read(dir.path().join("ubivol_0.bin"))?;
        assert_eq!(out0.len(), rootfs.len().div_ceil(leb) * leb);
        assert_eq!(&out0[..rootfs.len()], &rootfs[..]);
        assert!(out0[rootfs.len()..].is_erased());

        // Static volumes come back byte-exact
        let out1 = fs::read(dir.path().join("ubivol_1.bin"))?;
        assert_eq!(out1, kernel);

        Ok(())
    }

    #[test]
    fn test_remove_and_resize_volume() -> Result<()> {
        let geom = small_geom();
        let mut mtd = MemMtd::new(geom.peb_size, 16, geom.min_io_size);

        let mut reader = &[0x11u8; 4000][..];
        let volumes: Vec<Box<dyn Volume + '_>> = vec![
            Box::new(
                BasicVolume::new(VolType::Dynamic)
                    .id(0)
                    .name("scratch")
                    .size(4000)
                    .image(&mut reader),
            ),
            Box::new(BasicVolume::new(VolType::Dynamic).id(1).name("data").size(1920)),
        ];

        {
            let mut sink = MtdSink::new(&mut mtd);
            create_image(&geom, &ImageParams::default(), volumes, &mut sink, &mut Quiet)?;
        }

        remove_volume(&mut mtd, 0, &mut Quiet)?;

        let scan = Scan::read_mtd(&mtd, Some(geom), &mut Quiet)?;
        let table = scan.volume_table(&mut Quiet)?;
        assert!(table[0].is_none());
        assert!(table[1].is_some());
        // The released PEBs kept EC headers, so they scan as free, not empty
        assert!(scan.volume_chains(0).next().is_none());

        resize_volume(&mut mtd, 1, 5, &mut Quiet)?;
        let scan = Scan::read_mtd(&mtd, Some(geom), &mut Quiet)?;
        let table = scan.volume_table(&mut Quiet)?;
        assert_eq!(table[1].as_ref().unwrap().reserved_pebs, 5);

        // Removing a volume that is already gone is a usage error
        assert!(matches!(
            remove_volume(&mut mtd, 0, &mut Quiet),
            Err(Error::Usage(_))
        ));
        Ok(())
    }

    #[test]
    fn test_erase_all_skips_bad_blocks() -> Result<()> {
        let mut mtd = MemMtd::new(2048, 8, 64);
        for eb in 0..8 {
            if eb != 5 {
                mtd.write(eb, 0, &[0xAB; 16])?;
            }
        }
        mtd.set_bad(5);

        let marker = *b"\x85\x19\x03\x20";
        let mut stamp = |mtd: &mut MemMtd, eb: u32| mtd.write(eb, 0, &marker);
        let summary = erase_all(&mut mtd, Some(&mut stamp), &mut Quiet)?;
        assert_eq!(
            summary,
            EraseSummary {
                erased: 7,
                skipped_bad: 1,
                failed: 0
            }
        );

        let mut buf = [0u8; 16];
        mtd.read(0, 0, &mut buf)?;
        assert_eq!(&buf[..4], &marker);
        assert!(buf[4..].is_erased());
        Ok(())
    }
}

