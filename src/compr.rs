//! Adaptive per-chunk compression, as used for UBIFS payloads.
//!
//! Compression is best-effort: a failing compressor, or output that fails to shrink the
//! chunk, falls through to plain storage and is never an error. Decompression is strict.
//! The [`Compressor`] owns the LZO working memory, so it is created once per session and
//! is not reentrant; callers serialize access.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{Error, Result};

/// Chunks shorter than this are stored plain; the headers would eat any gain.
pub const MIN_COMPR_LEN: usize = 64;

/// Deflate window size. The kernel crypto API runs zlib with windowBits = -11 (a 2 KiB
/// window, no zlib header/trailer) and memLevel 8; memLevel 8 is zlib's default.
const DEFLATE_WINDOW_BITS: u8 = 11;

/// The compression algorithms recognized on flash, by tagged identifier.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum ComprType {
    /// Plain storage.
    #[default]
    None,

    /// LZO1X.
    Lzo,

    /// Raw deflate, without the zlib header/trailer, matching the kernel crypto API's
    /// parameters.
    Deflate,
}

/// A compression session: scratch state plus the error tally reported at teardown.
pub struct Compressor {
    lzo: minilzo_rs::LZO,
    err_count: u64,
}

impl Compressor {
    /// Allocate the working memory. Call once per session.
    pub fn new() -> Result<Self> {
        let lzo = minilzo_rs::LZO::init()
            .map_err(|e| Error::Compression(format!("LZO init failed: {e:?}")))?;
        Ok(Self { lzo, err_count: 0 })
    }

    /// Compress `buf` with `requested`, falling back to plain storage when the chunk is
    /// tiny, the compressor fails, or the output would not shrink. Returns the stored
    /// bytes and the algorithm that actually produced them.
    pub fn compress(&mut self, buf: &[u8], requested: ComprType) -> (Vec<u8>, ComprType) {
        if buf.len() < MIN_COMPR_LEN || requested == ComprType::None {
            return (buf.to_vec(), ComprType::None);
        }

        let attempt = match requested {
            ComprType::Lzo => self
                .lzo
                .compress(buf)
                .map_err(|e| Error::Compression(format!("LZO: {e:?}"))),
            ComprType::Deflate => deflate(buf),
            ComprType::None => unreachable!(),
        };

        match attempt {
            Ok(out) if out.len() < buf.len() => (out, requested),
            // Incompressible is not an error; only genuine compressor failures count
            Ok(_) => (buf.to_vec(), ComprType::None),
            Err(_) => {
                self.err_count += 1;
                (buf.to_vec(), ComprType::None)
            }
        }
    }

    /// Decompress `buf`, which was stored with `algo` and must expand to exactly
    /// `expected_len` bytes. Any decoder error or size mismatch is a hard error.
    pub fn decompress(
        &mut self,
        buf: &[u8],
        algo: ComprType,
        expected_len: usize,
    ) -> Result<Vec<u8>> {
        let out = match algo {
            ComprType::None => buf.to_vec(),
            ComprType::Lzo => self
                .lzo
                .decompress_safe(buf, expected_len)
                .map_err(|e| Error::Compression(format!("LZO: {e:?}")))?,
            ComprType::Deflate => inflate(buf, expected_len)?,
        };

        if out.len() != expected_len {
            return Err(Error::Compression(format!(
                "expected {expected_len} decompressed bytes, got {}",
                out.len()
            )));
        }

        Ok(out)
    }

    /// Number of genuine compressor errors absorbed so far; drivers report this through
    /// their reporter at teardown.
    pub fn error_count(&self) -> u64 {
        self.err_count
    }
}

fn deflate(buf: &[u8]) -> Result<Vec<u8>> {
    let mut deflate =
        Compress::new_with_window_bits(Compression::default(), false, DEFLATE_WINDOW_BITS);
    let mut out = Vec::with_capacity(buf.len() + 64);

    loop {
        let consumed = deflate.total_in() as usize;
        let status = deflate
            .compress_vec(&buf[consumed..], &mut out, FlushCompress::Finish)
            .map_err(|e| Error::Compression(format!("deflate: {e}")))?;
        match status {
            Status::StreamEnd => return Ok(out),
            Status::Ok | Status::BufError => out.reserve(64.max(buf.len() / 2)),
        }
    }
}

fn inflate(buf: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let mut inflate = Decompress::new_with_window_bits(false, DEFLATE_WINDOW_BITS);
    let mut out = Vec::with_capacity(expected_len);

    loop {
        let consumed = inflate.total_in() as usize;
        let before = (consumed, out.len());
        let status = inflate
            .decompress_vec(&buf[consumed..], &mut out, FlushDecompress::Finish)
            .map_err(|e| Error::Compression(format!("deflate: {e}")))?;

        match status {
            Status::StreamEnd => return Ok(out),
            Status::Ok | Status::BufError => {
                if out.len() > expected_len {
                    return Err(Error::Compression(format!(
                        "deflate output exceeds the expected {expected_len} bytes"
                    )));
                }
                if (inflate.total_in() as usize, out.len()) == before {
                    return Err(Error::Compression("deflate: truncated stream".to_string()));
                }
                out.reserve(64.max(expected_len - out.len() + 1));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// xorshift32; the tests need uniform bytes without pulling in an RNG crate
    fn noise(len: usize, mut state: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            out.extend(state.to_le_bytes());
        }
        out.truncate(len);
        out
    }

    fn compressible(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i / 32) as u8).collect()
    }

    #[test]
    fn test_roundtrip_all_algorithms() -> Result<()> {
        let mut ctx = Compressor::new()?;
        let data = compressible(8192);

        for algo in [ComprType::Lzo, ComprType::Deflate, ComprType::None] {
            let (stored, actual) = ctx.compress(&data, algo);
            assert_eq!(actual, algo);
            if algo != ComprType::None {
                assert!(stored.len() < data.len());
            }

            let back = ctx.decompress(&stored, actual, data.len())?;
            assert_eq!(back, data);
        }

        assert_eq!(ctx.error_count(), 0);
        Ok(())
    }

    #[test]
    fn test_short_chunk_stored_plain() -> Result<()> {
        let mut ctx = Compressor::new()?;
        let data = vec![0u8; MIN_COMPR_LEN - 1];

        let (stored, actual) = ctx.compress(&data, ComprType::Deflate);
        assert_eq!(actual, ComprType::None);
        assert_eq!(stored, data);
        Ok(())
    }

    #[test]
    fn test_incompressible_falls_back() -> Result<()> {
        let mut ctx = Compressor::new()?;
        let data = noise(256, 0x2545F491);

        let (stored, actual) = ctx.compress(&data, ComprType::Deflate);
        assert_eq!(actual, ComprType::None);
        assert_eq!(stored, data);

        // Fallback is not an error
        assert_eq!(ctx.error_count(), 0);
        Ok(())
    }

    #[test]
    fn test_strict_decompression() -> Result<()> {
        let mut ctx = Compressor::new()?;

        // Plain storage with the wrong expected length is a size mismatch
        assert!(ctx.decompress(&[0u8; 10], ComprType::None, 11).is_err());

        // Garbage input is a decoder error, not a panic
        let garbage = noise(64, 0xDEADBEEF);
        assert!(ctx.decompress(&garbage, ComprType::Deflate, 4096).is_err());

        Ok(())
    }
}
