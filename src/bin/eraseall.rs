//! Erase an entire MTD device or flash image, skipping bad blocks, optionally leaving a
//! JFFS2 cleanmarker in each erased block.

use anyhow::{bail, Context, Result};
use clap::Parser;
use crc::{Algorithm, Crc, CRC_32_JAMCRC};

use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use ubigen::mtd::{FileMtd, Mtd, MtdType};
use ubigen::report::Severity;
use ubigen::ubi::image::{erase_all, EraseSummary};
use ubigen::util::parse_bytes;

/// JFFS2's node CRC starts from a zero accumulator, unlike UBI's.
const CRC_32_JFFS2: Algorithm<u32> = Algorithm {
    init: 0,
    ..CRC_32_JAMCRC
};

const JFFS2_MAGIC_BITMASK: u16 = 0x1985;
const JFFS2_NODETYPE_CLEANMARKER: u16 = 0x2003;

/// The 12-byte cleanmarker node written at the head of each erased block.
fn cleanmarker() -> [u8; 12] {
    let mut node = [0u8; 12];
    node[0..2].copy_from_slice(&JFFS2_MAGIC_BITMASK.to_le_bytes());
    node[2..4].copy_from_slice(&JFFS2_NODETYPE_CLEANMARKER.to_le_bytes());
    let node_len = node.len() as u32;
    node[4..8].copy_from_slice(&node_len.to_le_bytes());

    let crc = Crc::<u32>::new(&CRC_32_JFFS2).checksum(&node[..8]);
    node[8..12].copy_from_slice(&crc.to_le_bytes());
    node
}

#[derive(Debug, Copy, Clone)]
struct Size(u64);

impl FromStr for Size {
    type Err = ubigen::Error;

    fn from_str(s: &str) -> ubigen::Result<Self> {
        parse_bytes(s).map(Size)
    }
}

#[derive(Parser, Debug)]
#[clap(about = "Erase every eraseblock of an MTD device or flash image")]
struct Args {
    /// An MTD character device (e.g. /dev/mtd0), or a plain image file with --eb-size
    device: PathBuf,

    /// Treat the target as a plain file with this eraseblock size
    #[clap(long)]
    eb_size: Option<Size>,

    /// Format the device for JFFS2 usage by writing a cleanmarker after each erase
    #[clap(long)]
    jffs2: bool,

    /// Don't output progress
    #[clap(short, long)]
    quiet: bool,
}

fn erase_target<M: Mtd>(mtd: &mut M, args: &Args) -> Result<EraseSummary> {
    if args.jffs2 && mtd.info().mtd_type == MtdType::NandFlash {
        bail!("JFFS2 cleanmarkers belong in NAND out-of-band data, which is not supported");
    }

    let quiet = args.quiet;
    let mut reporter = |severity: Severity, message: &str| match severity {
        Severity::Info if quiet => (),
        Severity::Info => println!("{message}"),
        _ => eprintln!("{message}"),
    };

    let marker = cleanmarker();
    let mut stamp = move |mtd: &mut M, eb: u32| mtd.write(eb, 0, &marker);
    let hook = args
        .jffs2
        .then_some(&mut stamp as &mut dyn FnMut(&mut M, u32) -> ubigen::Result<()>);

    Ok(erase_all(mtd, hook, &mut reporter)?)
}

fn run(args: &Args) -> Result<EraseSummary> {
    match args.eb_size {
        Some(eb_size) => {
            let mut mtd = FileMtd::open(&args.device, eb_size.0 as u32, 1)
                .with_context(|| format!("cannot open {}", args.device.display()))?;
            erase_target(&mut mtd, args)
        }
        None => {
            #[cfg(target_os = "linux")]
            {
                let mut mtd = ubigen::mtd::dev::MtdDev::open(&args.device)
                    .with_context(|| format!("cannot open {}", args.device.display()))?;
                erase_target(&mut mtd, args)
            }

            #[cfg(not(target_os = "linux"))]
            bail!("MTD character devices need Linux; use --eb-size for image files")
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    howudoin::init(howudoin::consumers::TermLine::default());
    let rpt = howudoin::new().label("Erasing");
    let result = run(&args);
    rpt.close();
    howudoin::disable();

    match result {
        Ok(summary) => {
            if !args.quiet {
                println!(
                    "{} erased, {} bad blocks skipped, {} failures",
                    summary.erased, summary.skipped_bad, summary.failed
                );
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("eraseall: {err:#}");
            let code = err
                .downcast_ref::<ubigen::Error>()
                .map_or(1, ubigen::Error::exit_code);
            ExitCode::from(code as u8)
        }
    }
}

#[test]
fn test_cleanmarker_layout() {
    let node = cleanmarker();
    assert_eq!(&node[..2], &[0x85, 0x19]);
    assert_eq!(&node[2..4], &[0x03, 0x20]);
    assert_eq!(&node[4..8], &12u32.to_le_bytes());
}
