//! Build a UBI image file from a list of volume descriptors.
//!
//! Volumes are described as comma-separated `key=value` lists, e.g.
//! `--volume id=0,type=dynamic,name=rootfs,image=rootfs.img,size=48MiB`.

use anyhow::{bail, Context, Result};
use clap::Parser;

use std::fs::File;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use ubigen::ubi::geom::Geometry;
use ubigen::ubi::image::{create_image, ImageParams};
use ubigen::ubi::write::{BasicVolume, IoSink, Volume};
use ubigen::ubi::VolType;
use ubigen::report::Severity;
use ubigen::util::parse_bytes;

/// A byte count accepting KiB/MiB/GiB suffixes.
#[derive(Debug, Copy, Clone)]
struct Size(u64);

impl FromStr for Size {
    type Err = ubigen::Error;

    fn from_str(s: &str) -> ubigen::Result<Self> {
        parse_bytes(s).map(Size)
    }
}

/// One `--volume` descriptor.
#[derive(Debug, Default, Clone)]
struct VolumeDesc {
    id: Option<u32>,
    vtype: VolType,
    name: String,
    image: Option<PathBuf>,
    size: Option<u64>,
    align: Option<u32>,
    autoresize: bool,
}

impl FromStr for VolumeDesc {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut desc = VolumeDesc::default();

        for part in s.split(',') {
            let (key, value) = part.split_once('=').unwrap_or((part, ""));
            match key {
                "id" => desc.id = Some(value.parse()?),
                "type" => {
                    desc.vtype = match value {
                        "dynamic" => VolType::Dynamic,
                        "static" => VolType::Static,
                        other => bail!("unknown volume type \"{other}\""),
                    }
                }
                "name" => desc.name = value.to_string(),
                "image" => desc.image = Some(PathBuf::from(value)),
                "size" => desc.size = Some(parse_bytes(value)?),
                "align" => desc.align = Some(value.parse()?),
                "autoresize" => desc.autoresize = true,
                other => bail!("unknown volume descriptor key \"{other}\""),
            }
        }

        if desc.name.is_empty() {
            bail!("volume descriptor needs a name");
        }
        Ok(desc)
    }
}

#[derive(Parser, Debug)]
#[clap(about = "Generate a UBI image from volume descriptors")]
struct Args {
    /// Size of a physical eraseblock (e.g. 128KiB)
    #[clap(long)]
    peb_size: Size,

    /// Minimum input/output unit size (e.g. 2048)
    #[clap(long)]
    min_io_size: Size,

    /// Offset of the VID header within a PEB (default: one I/O unit in)
    #[clap(long)]
    vid_hdr_offset: Option<Size>,

    /// UBI on-flash format version
    #[clap(long, default_value = "1")]
    ubi_ver: u8,

    /// Image sequence number stamped on every EC header
    #[clap(long, default_value = "0")]
    image_seq: u32,

    /// Erase counter stamped on every PEB
    #[clap(long, default_value = "0")]
    ec: u64,

    /// Pad the image with blank PEBs out to this many eraseblocks
    #[clap(long)]
    total_pebs: Option<u32>,

    /// Where to write the image
    #[clap(short, long)]
    output: PathBuf,

    /// Volume descriptors, one per volume
    #[clap(long = "volume", required = true)]
    volumes: Vec<VolumeDesc>,

    /// Only report errors
    #[clap(short, long)]
    quiet: bool,
}

fn run(args: &Args) -> Result<()> {
    let geom = Geometry::new(
        args.peb_size.0 as u32,
        args.min_io_size.0 as u32,
        args.vid_hdr_offset.map(|s| s.0 as u32),
        args.ubi_ver,
    )?;

    let params = ImageParams {
        ec: args.ec,
        image_seq: args.image_seq,
        total_pebs: args.total_pebs,
    };

    // Open the payload files up front so descriptor typos fail before any output exists
    let mut files: Vec<Option<File>> = args
        .volumes
        .iter()
        .map(|desc| {
            desc.image
                .as_ref()
                .map(|path| {
                    File::open(path).with_context(|| format!("cannot open {}", path.display()))
                })
                .transpose()
        })
        .collect::<Result<_>>()?;

    let mut volumes: Vec<Box<dyn Volume + '_>> = Vec::with_capacity(args.volumes.len());
    for (desc, file) in args.volumes.iter().zip(files.iter_mut()) {
        // A missing size means "exactly the payload file"
        let size = match (desc.size, file.as_ref()) {
            (Some(size), _) => Some(size),
            (None, Some(file)) => Some(file.metadata()?.len()),
            (None, None) => None,
        };

        let mut volume = BasicVolume::new(desc.vtype).name(desc.name.clone());
        if let Some(id) = desc.id {
            volume = volume.id(id);
        }
        if let Some(size) = size {
            volume = volume.size(size);
        }
        if let Some(align) = desc.align {
            let align = NonZeroU32::new(align).context("alignment must be nonzero")?;
            volume = volume.align(align);
        }
        if desc.autoresize {
            volume = volume.autoresize();
        }
        if let Some(file) = file {
            volume = volume.image(file);
        }

        volumes.push(Box::new(volume));
    }

    let rpt = howudoin::new().label("Writing image");

    let output = File::create(&args.output)
        .with_context(|| format!("cannot create {}", args.output.display()))?;
    let mut sink = IoSink::new(output, &geom);

    let quiet = args.quiet;
    let mut reporter = |severity: Severity, message: &str| match severity {
        Severity::Info if quiet => (),
        Severity::Info => println!("{message}"),
        _ => eprintln!("{message}"),
    };

    let summary = create_image(&geom, &params, volumes, &mut sink, &mut reporter)?;

    rpt.add_info(format!(
        "{}: {} PEBs, {} volumes",
        args.output.display(),
        summary.pebs_written,
        summary.volumes
    ));
    rpt.close();

    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    howudoin::init(howudoin::consumers::TermLine::default());
    let result = run(&args);
    howudoin::disable();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("ubinize: {err:#}");
            let code = err
                .downcast_ref::<ubigen::Error>()
                .map_or(1, ubigen::Error::exit_code);
            ExitCode::from(code as u8)
        }
    }
}

#[test]
fn test_volume_descriptor() {
    let desc: VolumeDesc = "id=3,type=static,name=kernel,size=4MiB,autoresize"
        .parse()
        .unwrap();
    assert_eq!(desc.id, Some(3));
    assert_eq!(desc.vtype, VolType::Static);
    assert_eq!(desc.name, "kernel");
    assert_eq!(desc.size, Some(4 << 20));
    assert!(desc.autoresize);

    assert!("size=1KiB".parse::<VolumeDesc>().is_err()); // nameless
    assert!("name=x,type=magic".parse::<VolumeDesc>().is_err());
}
