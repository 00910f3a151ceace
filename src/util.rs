//! Small helpers shared by the library and the CLI tools.

use std::io::{self, Read};

use crate::error::{Error, Result};

pub trait ReadExt {
    /// Append up to `read_len` bytes to `vec`, stopping short only at end of input.
    ///
    /// Returns how many bytes were actually appended. The writer and scanner use this to
    /// pull one LEB or PEB worth of bytes at a time from payload and image streams.
    fn read_up_to(&mut self, vec: &mut Vec<u8>, read_len: usize) -> io::Result<usize>;
}

impl<T: Read> ReadExt for T {
    fn read_up_to(&mut self, vec: &mut Vec<u8>, read_len: usize) -> io::Result<usize> {
        self.by_ref().take(read_len as u64).read_to_end(vec)
    }
}

/// Parse an amount of bytes, accepting the `KiB`, `MiB`, and `GiB` suffixes.
///
/// Bare numbers are bytes. A `0x` prefix selects hexadecimal.
pub fn parse_bytes(s: &str) -> Result<u64> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_hexdigit() && c != 'x' && c != 'X')
        .unwrap_or(s.len());
    let (num, suffix) = s.split_at(split);

    let value = if let Some(hex) = num.strip_prefix("0x").or_else(|| num.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        num.parse()
    }
    .map_err(|_| Error::Usage(format!("incorrect amount of bytes: \"{s}\"")))?;

    let multiplier: u64 = match suffix.trim_start() {
        "" => 1,
        "KiB" => 1024,
        "MiB" => 1024 * 1024,
        "GiB" => 1024 * 1024 * 1024,
        other => {
            return Err(Error::Usage(format!(
                "bad size specifier: \"{other}\" - should be 'KiB', 'MiB' or 'GiB'"
            )))
        }
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| Error::Usage(format!("amount of bytes too large: \"{s}\"")))
}

#[test]
fn test_read_up_to() -> io::Result<()> {
    let mut input = &[1u8, 2, 3, 4, 5][..];
    let mut vec = vec![9];

    assert_eq!(input.read_up_to(&mut vec, 3)?, 3);
    assert_eq!(vec, [9, 1, 2, 3]);

    // End of input cuts the read short rather than failing
    assert_eq!(input.read_up_to(&mut vec, 8)?, 2);
    assert_eq!(vec, [9, 1, 2, 3, 4, 5]);
    assert_eq!(input.read_up_to(&mut vec, 8)?, 0);
    Ok(())
}

#[test]
fn test_parse_bytes() {
    assert_eq!(parse_bytes("512").unwrap(), 512);
    assert_eq!(parse_bytes("128KiB").unwrap(), 128 * 1024);
    assert_eq!(parse_bytes("128 KiB").unwrap(), 128 * 1024);
    assert_eq!(parse_bytes("2MiB").unwrap(), 2 * 1024 * 1024);
    assert_eq!(parse_bytes("1GiB").unwrap(), 1 << 30);
    assert_eq!(parse_bytes("0x20000").unwrap(), 0x20000);
    assert!(parse_bytes("12kb").is_err());
    assert!(parse_bytes("").is_err());
}
