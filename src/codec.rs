//! External collaborator interfaces: relocation codec, compressor and
//! loader stub.
//!
//! The packer core drives these through traits so the host can plug in its
//! real implementations. The reference implementations shipped here are
//! deliberately simple but honest inverses of each other, which is all the
//! core's tests need.

use crate::{Error, Result};

/// Compacts a sorted list of relocation positions into a byte stream and
/// back. Positions are image offsets relative to `rvamin`; the image slice
/// passed alongside allows codecs that fold data into the encoded words.
pub trait RelocCodec {
    /// Encode `positions` (sorted ascending). `bits` is 32 or 64.
    /// `big_relocs` collects codec-defined flag bits.
    fn optimize_reloc(
        &self,
        positions: &[u32],
        image: &mut [u8],
        bits: u32,
        big_relocs: &mut u32,
    ) -> Vec<u8>;

    /// Decode a stream produced by `optimize_reloc`. Returns the positions
    /// and the number of bytes consumed.
    fn unoptimize_reloc(
        &self,
        data: &[u8],
        image: &mut [u8],
        bits: u32,
    ) -> Result<(Vec<u32>, usize)>;
}

/// Reference relocation codec: LE32 count followed by LE32 positions.
#[derive(Debug, Default)]
pub struct LeRelocCodec;

impl RelocCodec for LeRelocCodec {
    fn optimize_reloc(
        &self,
        positions: &[u32],
        _image: &mut [u8],
        _bits: u32,
        _big_relocs: &mut u32,
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 4 * positions.len());
        out.extend_from_slice(&(positions.len() as u32).to_le_bytes());
        for &pos in positions {
            out.extend_from_slice(&pos.to_le_bytes());
        }
        out
    }

    fn unoptimize_reloc(
        &self,
        data: &[u8],
        _image: &mut [u8],
        _bits: u32,
    ) -> Result<(Vec<u32>, usize)> {
        if data.len() < 4 {
            return Err(Error::cant_unpack("truncated relocation stream"));
        }
        let count = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let end = 4 + 4 * count;
        if end > data.len() {
            return Err(Error::cant_unpack("truncated relocation stream"));
        }
        let mut positions = Vec::with_capacity(count);
        for ic in 0..count {
            let off = 4 + 4 * ic;
            positions.push(u32::from_le_bytes([
                data[off],
                data[off + 1],
                data[off + 2],
                data[off + 3],
            ]));
        }
        Ok((positions, end))
    }
}

/// Block compressor used for the main payload.
pub trait Compressor {
    /// Codec method id recorded in the pack header.
    fn method(&self) -> u8;

    /// Compress a buffer.
    fn compress(&self, data: &[u8], level: u8) -> Vec<u8>;

    /// Decompress `data` into exactly `u_len` bytes.
    fn decompress(&self, data: &[u8], u_len: usize) -> Result<Vec<u8>>;
}

/// Reference compressor: byte-level run length encoding. Enough to shrink
/// the zero-heavy images the tests build, and trivially invertible.
#[derive(Debug, Default)]
pub struct RleCompressor;

impl Compressor for RleCompressor {
    fn method(&self) -> u8 {
        1
    }

    fn compress(&self, data: &[u8], _level: u8) -> Vec<u8> {
        let mut out = Vec::new();
        let mut ic = 0;
        while ic < data.len() {
            let byte = data[ic];
            let mut run = 1usize;
            while run < 255 && ic + run < data.len() && data[ic + run] == byte {
                run += 1;
            }
            out.push(run as u8);
            out.push(byte);
            ic += run;
        }
        out
    }

    fn decompress(&self, data: &[u8], u_len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(u_len);
        let mut ic = 0;
        while ic + 2 <= data.len() && out.len() < u_len {
            let run = data[ic] as usize;
            let byte = data[ic + 1];
            out.resize(out.len() + run, byte);
            ic += 2;
        }
        if out.len() != u_len {
            return Err(Error::cant_unpack("corrupt compressed data"));
        }
        Ok(out)
    }
}

/// The in-place decompression stub linked into the packed file.
pub trait LoaderStub {
    /// Machine code of the stub; the new entry point lands at its start.
    fn code(&self) -> &[u8];

    /// Identification string placed in front of the compressed data.
    fn ident(&self) -> &[u8];

    /// Offset of a named symbol within the stub code (e.g. the TLS
    /// callback handler).
    fn symbol_offset(&self, name: &str) -> Option<u32>;
}

/// A stub with no code. Packed files built with it cannot run, but every
/// structural transformation is exercised.
#[derive(Debug, Default)]
pub struct EmptyStub;

impl LoaderStub for EmptyStub {
    fn code(&self) -> &[u8] {
        &[]
    }

    fn ident(&self) -> &[u8] {
        b"packed by pepack\n\0"
    }

    fn symbol_offset(&self, _name: &str) -> Option<u32> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reloc_codec_roundtrip() {
        let codec = LeRelocCodec;
        let positions = vec![0x10, 0x204, 0x1000];
        let mut image = vec![0u8; 16];
        let mut big = 0;
        let encoded = codec.optimize_reloc(&positions, &mut image, 32, &mut big);
        let (decoded, consumed) = codec.unoptimize_reloc(&encoded, &mut image, 32).unwrap();
        assert_eq!(decoded, positions);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_reloc_codec_truncated() {
        let codec = LeRelocCodec;
        let mut image = vec![];
        assert!(codec.unoptimize_reloc(&[9, 0, 0, 0], &mut image, 32).is_err());
    }

    #[test]
    fn test_rle_roundtrip() {
        let comp = RleCompressor;
        let data = {
            let mut v = vec![0u8; 1000];
            v[100] = 7;
            v[500..600].fill(0xAA);
            v
        };
        let packed = comp.compress(&data, 8);
        assert!(packed.len() < data.len());
        assert_eq!(comp.decompress(&packed, data.len()).unwrap(), data);
    }

    #[test]
    fn test_rle_bad_length() {
        let comp = RleCompressor;
        let packed = comp.compress(&[1, 2, 3], 8);
        assert!(comp.decompress(&packed, 5).is_err());
    }
}
