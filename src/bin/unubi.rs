//! Decompose a UBI image into one `ubivol_<id>.bin` file per recovered volume.

use anyhow::{Context, Result};
use clap::Parser;

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use ubigen::report::Severity;
use ubigen::ubi::geom::Geometry;
use ubigen::ubi::image::{extract_image, ExtractSummary};
use ubigen::util::parse_bytes;

#[derive(Debug, Copy, Clone)]
struct Size(u64);

impl FromStr for Size {
    type Err = ubigen::Error;

    fn from_str(s: &str) -> ubigen::Result<Self> {
        parse_bytes(s).map(Size)
    }
}

#[derive(Parser, Debug)]
#[clap(about = "Extract the volumes of a UBI image")]
struct Args {
    /// The image file to decompose
    image: PathBuf,

    /// Output directory
    #[clap(short, long, default_value = "unubi")]
    dir: PathBuf,

    /// Size of a physical eraseblock; cannot be detected from headers
    #[clap(long, default_value = "128KiB")]
    peb_size: Size,

    /// Offset of the VID header, if the auto-detection must be overridden
    #[clap(long)]
    vid_hdr_offset: Option<Size>,

    /// Minimum input/output unit size, required with --vid-hdr-offset
    #[clap(long, requires = "vid_hdr_offset")]
    min_io_size: Option<Size>,

    /// Only report errors
    #[clap(short, long)]
    quiet: bool,
}

fn run(args: &Args) -> Result<ExtractSummary> {
    let geom = match (args.vid_hdr_offset, args.min_io_size) {
        (Some(vid), Some(min_io)) => Some(Geometry::new(
            args.peb_size.0 as u32,
            min_io.0 as u32,
            Some(vid.0 as u32),
            1,
        )?),
        _ => None,
    };

    let image = File::open(&args.image)
        .with_context(|| format!("cannot open {}", args.image.display()))?;

    let quiet = args.quiet;
    let mut reporter = |severity: Severity, message: &str| match severity {
        Severity::Info if quiet => (),
        Severity::Info => println!("{message}"),
        _ => eprintln!("{message}"),
    };

    let rpt = howudoin::new().label("Scanning image");
    let summary = extract_image(
        BufReader::new(image),
        args.peb_size.0 as u32,
        geom,
        &args.dir,
        &mut reporter,
    )?;
    rpt.add_info(format!(
        "{} volumes extracted to {}",
        summary.volumes.len(),
        args.dir.display()
    ));
    rpt.close();

    Ok(summary)
}

fn main() -> ExitCode {
    let args = Args::parse();

    howudoin::init(howudoin::consumers::TermLine::default());
    let result = run(&args);
    howudoin::disable();

    match result {
        // Some static volumes did not survive: partial recovery
        Ok(summary) if !summary.broken.is_empty() => ExitCode::from(4),
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("unubi: {err:#}");
            let code = err
                .downcast_ref::<ubigen::Error>()
                .map_or(1, ubigen::Error::exit_code);
            ExitCode::from(code as u8)
        }
    }
}
