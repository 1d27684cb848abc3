//! Input and output stream traits.
//!
//! The core never opens files itself; the host hands it an [`InputSource`]
//! and an [`OutputSink`]. Implementations are provided for byte slices,
//! owned vectors and `std::fs::File`.

use crate::{Error, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// A seekable byte source.
///
/// Reads are positional; a read that cannot be satisfied in full is an
/// error (`readx` semantics), so callers never have to handle short reads.
pub trait InputSource {
    /// Read bytes at the given offset. Returns the number of bytes read.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Total size of the source in bytes.
    fn size(&self) -> u64;

    /// Read exactly `buf.len()` bytes at `offset`; short reads fail.
    fn readx_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let n = self.read_at(offset, buf)?;
        if n < buf.len() {
            return Err(Error::cant_pack(format!(
                "premature end of file (tried to read {} bytes at offset {:#x})",
                buf.len(),
                offset
            )));
        }
        Ok(())
    }

    /// Read a block of bytes at offset, returning an owned Vec.
    fn read_block(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.readx_at(offset, &mut buf)?;
        Ok(buf)
    }
}

/// A byte sink that tracks how many bytes have been written.
pub trait OutputSink {
    /// Append bytes to the output.
    fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Number of bytes written so far.
    fn bytes_written(&self) -> u64;
}

/// Input over a borrowed byte slice.
#[derive(Debug, Clone)]
pub struct SliceSource<'a> {
    data: &'a [u8],
}

impl<'a> SliceSource<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl InputSource for SliceSource<'_> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let offset = offset as usize;
        if offset >= self.data.len() {
            return Ok(0);
        }
        let to_read = buf.len().min(self.data.len() - offset);
        buf[..to_read].copy_from_slice(&self.data[offset..offset + to_read]);
        Ok(to_read)
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Input over a file on disk.
pub struct FileSource {
    file: std::cell::RefCell<File>,
    size: u64,
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)?;
        let size = file.seek(SeekFrom::End(0))?;
        Ok(Self {
            file: std::cell::RefCell::new(file),
            size,
        })
    }
}

impl InputSource for FileSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            let n = file.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// Output collecting into an owned vector.
#[derive(Debug, Default)]
pub struct VecSink {
    data: Vec<u8>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl OutputSink for VecSink {
    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.data.extend_from_slice(buf);
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Output writing through to a file.
pub struct FileSink {
    file: File,
    written: u64,
}

impl FileSink {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            file: File::create(path)?,
            written: 0,
        })
    }
}

impl OutputSink for FileSink {
    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.file.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.written
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_source() {
        let data = [0x4D, 0x5A, 0x90, 0x00];
        let src = SliceSource::new(&data);
        assert_eq!(src.size(), 4);
        let mut buf = [0u8; 2];
        src.readx_at(0, &mut buf).unwrap();
        assert_eq!(buf, [0x4D, 0x5A]);
    }

    #[test]
    fn test_short_read_fails() {
        let data = [0x4D, 0x5A];
        let src = SliceSource::new(&data);
        let mut buf = [0u8; 4];
        assert!(src.readx_at(0, &mut buf).is_err());
        assert!(src.readx_at(100, &mut buf).is_err());
    }

    #[test]
    fn test_vec_sink_tracks_written() {
        let mut sink = VecSink::new();
        sink.write(b"head").unwrap();
        assert_eq!(sink.bytes_written(), 4);
        sink.write(b"tail").unwrap();
        assert_eq!(sink.bytes_written(), 8);
        assert_eq!(sink.data(), b"headtail");
    }

    #[test]
    fn test_file_source_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.bin");
        std::fs::write(&path, [1u8, 2, 3, 4, 5]).unwrap();
        let src = FileSource::open(&path).unwrap();
        assert_eq!(src.size(), 5);
        assert_eq!(src.read_block(1, 3).unwrap(), vec![2, 3, 4]);
    }
}
