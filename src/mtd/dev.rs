//! MTD layer implementation over the Linux MTD character-device interface.

use super::{Mtd, MtdInfo, MtdType};
use crate::error::{Error, Result};

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// An open `/dev/mtdX` device.
#[derive(Debug)]
pub struct MtdDev {
    file: File,
    info: MtdInfo,
}

impl MtdDev {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let info = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())
                .map_err(std::io::Error::from)?;
            info.assume_init()
        }
        .try_into()?;

        Ok(Self { file, info })
    }

    /// Open an `mtd` device by its name, by searching `/proc/mtd`
    pub fn open_named(name: &str) -> Result<Self> {
        // Put `name` in quotes
        let name = format!("\"{name}\"");

        let proc_mtd = File::open("/proc/mtd")?;
        let proc_mtd = BufReader::new(proc_mtd);
        for line in proc_mtd.lines() {
            let line = line?;
            if line.contains(&name) {
                let mtd_dev = line.split(':').next().unwrap_or_default();
                return Self::open(Path::new("/dev").join(mtd_dev));
            }
        }

        Err(Error::Usage(format!("MTD device {name} could not be found")))
    }
}

impl Mtd for MtdDev {
    fn info(&self) -> &MtdInfo {
        &self.info
    }

    fn is_bad(&self, eb: u32) -> Result<bool> {
        let base = self.info.locate(eb, 0, 0)?;
        if !self.info.may_have_bad_blocks {
            return Ok(false);
        }

        let result = unsafe { ioctl::memgetbadblock(self.file.as_raw_fd(), &base) };
        match result {
            Ok(0) => Ok(false),
            Ok(_) => Ok(true),
            // The device advertises bad-block support but the driver declined the probe
            Err(nix::errno::Errno::EOPNOTSUPP) => Ok(false),
            Err(errno) => Err(std::io::Error::from(errno).into()),
        }
    }

    fn erase(&mut self, eb: u32) -> Result<()> {
        let base = self.info.locate(eb, 0, self.info.eb_size as usize)?;
        let erase_info = ioctl::erase_info_user {
            start: base as u32,
            length: self.info.eb_size,
        };
        unsafe {
            ioctl::memerase(self.file.as_raw_fd(), &erase_info).map_err(std::io::Error::from)?;
        }
        Ok(())
    }

    fn read(&self, eb: u32, offset: u32, buf: &mut [u8]) -> Result<()> {
        let base = self.info.locate(eb, offset, buf.len())?;
        self.file.read_exact_at(buf, base)?;
        Ok(())
    }

    fn write(&mut self, eb: u32, offset: u32, buf: &[u8]) -> Result<()> {
        let base = self.info.locate(eb, offset, buf.len())?;
        self.file.write_all_at(buf, base)?;
        Ok(())
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use super::{MtdInfo, MtdType};
    use crate::error::Error;

    use nix::{ioctl_read, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    const MTD_NORFLASH: u8 = 3;
    const MTD_NANDFLASH: u8 = 4;
    const MTD_RAM: u8 = 1;
    const MTD_ROM: u8 = 2;
    const MTD_DATAFLASH: u8 = 6;
    const MTD_UBIVOLUME: u8 = 7;
    const MTD_MLCNANDFLASH: u8 = 8;

    const MTD_WRITEABLE: u32 = 0x400;

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    impl TryInto<MtdInfo> for mtd_info_user {
        type Error = Error;

        fn try_into(mut self) -> Result<MtdInfo, Error> {
            if self.writesize == 1 {
                // Hack for debugging on mtdram devices
                self.writesize = 64;
            }

            if self.erasesize == 0 || self.size % self.erasesize != 0 {
                return Err(Error::Usage(
                    "MTD size not a multiple of erasesize".to_string(),
                ));
            }
            if self.writesize == 0 || self.erasesize % self.writesize != 0 {
                return Err(Error::Usage(
                    "MTD erasesize not a multiple of writesize".to_string(),
                ));
            }

            let mtd_type = match self.r#type {
                MTD_RAM => MtdType::Ram,
                MTD_ROM => MtdType::Rom,
                MTD_NORFLASH => MtdType::NorFlash,
                MTD_NANDFLASH | MTD_MLCNANDFLASH => MtdType::NandFlash,
                MTD_DATAFLASH => MtdType::DataFlash,
                MTD_UBIVOLUME => MtdType::UbiVolume,
                _ => MtdType::Unknown,
            };

            Ok(MtdInfo {
                mtd_type,
                size: self.size.into(),
                eb_size: self.erasesize,
                eb_count: self.size / self.erasesize,
                min_io_size: self.writesize,
                read_only: self.flags & MTD_WRITEABLE == 0,
                may_have_bad_blocks: mtd_type == MtdType::NandFlash,
            })
        }
    }

    #[repr(C)]
    pub struct erase_info_user {
        pub start: u32,
        pub length: u32,
    }
    ioctl_write_ptr!(memerase, MTD_IOC_MAGIC, 2, erase_info_user);

    ioctl_write_ptr!(memgetbadblock, MTD_IOC_MAGIC, 11, u64);
}
