//! TLS (Thread Local Storage) directory processing.
//!
//! The TLS template must stay uncompressed: the loader reads it before the
//! stub runs. Pass 1 clones the directory and its `[datastart, dataend)`
//! template into a side buffer and remembers every base relocation inside
//! the template. Pass 2 rebases the clone to its final address, re-emits
//! those relocations and, when the original had callbacks, installs a
//! one-entry callback chain pointing at the stub's TLS handler.

use crate::data_dir::DataDirectory;
use crate::layout::align_up;
use crate::reloc::{RelocBuilder, RelocReader};
use crate::{Error, Result};
use log::info;

/// IMAGE_TLS_DIRECTORY32 - 24 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TlsDirectory32 {
    pub start_address_of_raw_data: u32,
    pub end_address_of_raw_data: u32,
    pub address_of_index: u32,
    pub address_of_callbacks: u32,
    pub size_of_zero_fill: u32,
    pub characteristics: u32,
}

impl TlsDirectory32 {
    pub const SIZE: usize = 24;

    pub fn parse(data: &[u8]) -> Self {
        let u32_at = |o: usize| u32::from_le_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]]);
        Self {
            start_address_of_raw_data: u32_at(0),
            end_address_of_raw_data: u32_at(4),
            address_of_index: u32_at(8),
            address_of_callbacks: u32_at(12),
            size_of_zero_fill: u32_at(16),
            characteristics: u32_at(20),
        }
    }

    pub fn write(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.start_address_of_raw_data.to_le_bytes());
        buf[4..8].copy_from_slice(&self.end_address_of_raw_data.to_le_bytes());
        buf[8..12].copy_from_slice(&self.address_of_index.to_le_bytes());
        buf[12..16].copy_from_slice(&self.address_of_callbacks.to_le_bytes());
        buf[16..20].copy_from_slice(&self.size_of_zero_fill.to_le_bytes());
        buf[20..24].copy_from_slice(&self.characteristics.to_le_bytes());
    }
}

/// IMAGE_TLS_DIRECTORY64 - 40 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TlsDirectory64 {
    pub start_address_of_raw_data: u64,
    pub end_address_of_raw_data: u64,
    pub address_of_index: u64,
    pub address_of_callbacks: u64,
    pub size_of_zero_fill: u32,
    pub characteristics: u32,
}

impl TlsDirectory64 {
    pub const SIZE: usize = 40;

    pub fn parse(data: &[u8]) -> Self {
        let u64_at = |o: usize| {
            u64::from_le_bytes([
                data[o],
                data[o + 1],
                data[o + 2],
                data[o + 3],
                data[o + 4],
                data[o + 5],
                data[o + 6],
                data[o + 7],
            ])
        };
        Self {
            start_address_of_raw_data: u64_at(0),
            end_address_of_raw_data: u64_at(8),
            address_of_index: u64_at(16),
            address_of_callbacks: u64_at(24),
            size_of_zero_fill: u32::from_le_bytes([data[32], data[33], data[34], data[35]]),
            characteristics: u32::from_le_bytes([data[36], data[37], data[38], data[39]]),
        }
    }

    pub fn write(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.start_address_of_raw_data.to_le_bytes());
        buf[8..16].copy_from_slice(&self.end_address_of_raw_data.to_le_bytes());
        buf[16..24].copy_from_slice(&self.address_of_index.to_le_bytes());
        buf[24..32].copy_from_slice(&self.address_of_callbacks.to_le_bytes());
        buf[32..36].copy_from_slice(&self.size_of_zero_fill.to_le_bytes());
        buf[36..40].copy_from_slice(&self.characteristics.to_le_bytes());
    }
}

// generic view over the pointer-width fields of either directory
#[derive(Debug, Clone, Copy)]
struct TlsFields {
    datastart: u64,
    dataend: u64,
    tlsindex: u64,
    callbacks: u64,
}

fn read_fields(data: &[u8], is64: bool) -> TlsFields {
    if is64 {
        let d = TlsDirectory64::parse(data);
        TlsFields {
            datastart: d.start_address_of_raw_data,
            dataend: d.end_address_of_raw_data,
            tlsindex: d.address_of_index,
            callbacks: d.address_of_callbacks,
        }
    } else {
        let d = TlsDirectory32::parse(data);
        TlsFields {
            datastart: d.start_address_of_raw_data as u64,
            dataend: d.end_address_of_raw_data as u64,
            tlsindex: d.address_of_index as u64,
            callbacks: d.address_of_callbacks as u64,
        }
    }
}

fn write_field(data: &mut [u8], index: usize, value: u64, is64: bool) {
    if is64 {
        data[index * 8..index * 8 + 8].copy_from_slice(&value.to_le_bytes());
    } else {
        data[index * 4..index * 4 + 4].copy_from_slice(&(value as u32).to_le_bytes());
    }
}

/// State carried between the two TLS passes.
#[derive(Debug)]
pub struct TlsProcessor {
    /// Cloned directory plus template (plus callback chain slots).
    data: Vec<u8>,
    /// Side buffer size before pointer-width alignment.
    sotls: u32,
    /// RVA of the TLS index slot, zeroed in the image.
    pub tlsindex: u32,
    pub use_callbacks: bool,
    /// Base relocations inside the template: (rva, type).
    relocs: Vec<(u32, u32)>,
    is64: bool,
}

impl TlsProcessor {
    /// Pass 1. Returns `None` when the image has no TLS directory.
    pub fn process(
        image: &mut [u8],
        tls_dir: DataDirectory,
        relocs: &RelocReader,
        imagebase: u64,
        imagesize: u32,
        is_efi: bool,
        is64: bool,
    ) -> Result<Option<Self>> {
        if is_efi && tls_dir.size != 0 {
            return Err(Error::cant_pack("TLS not supported on EFI"));
        }
        if align_up(tls_dir.size, 4) == 0 {
            return Ok(None);
        }
        let dir_size = if is64 {
            TlsDirectory64::SIZE
        } else {
            TlsDirectory32::SIZE
        };
        let cb_size = if is64 { 8u32 } else { 4u32 };

        let skip = tls_dir.vaddr as usize;
        let raw = image
            .get(skip..skip + dir_size)
            .ok_or_else(|| Error::cant_pack(format!("bad tls {skip:#x}")))?;
        let tls = read_fields(raw, is64);

        // TLS callbacks are invoked before the stub runs, so the stub must
        // take over the chain
        let mut use_callbacks = false;
        if tls.callbacks != 0 {
            if tls.callbacks < imagebase
                || tls.callbacks - imagebase + 4 >= imagesize as u64
            {
                return Err(Error::cant_pack("invalid TLS callback"));
            }
            let mut cb_off = (tls.callbacks - imagebase) as u32;
            let mut num_callbacks = 0u32;
            while read_ptr(image, cb_off, is64)? != 0 {
                num_callbacks += 1;
                cb_off += cb_size;
            }
            if num_callbacks != 0 {
                info!("TLS: {num_callbacks} callback(s) found, adding TLS callback handler");
                use_callbacks = true;
            }
        }

        let tlsdatastart = (tls.datastart.wrapping_sub(imagebase)) as u32;
        let tlsdataend = (tls.dataend.wrapping_sub(imagebase)) as u32;
        if tlsdataend < tlsdatastart {
            return Err(Error::cant_pack("bad tls data range"));
        }

        // relocation entries inside the tls template move with it
        let mut saved = Vec::new();
        for &(pos, rtype) in relocs.entries() {
            if pos >= tlsdatastart && pos < tlsdataend {
                saved.push((pos, rtype as u32));
            }
        }

        let mut sotls = dir_size as u32 + (tlsdataend - tlsdatastart);
        // two more pointer slots hold the new one-entry callback chain
        if use_callbacks {
            sotls = align_up(sotls, cb_size) + 2 * cb_size;
        }
        let aligned_sotls = align_up(sotls, cb_size);

        let mut data = vec![0u8; aligned_sotls as usize];
        data[..dir_size].copy_from_slice(&image[skip..skip + dir_size]);
        let take = (tlsdataend - tlsdatastart) as usize;
        let src = image
            .get(tlsdatastart as usize..tlsdatastart as usize + take)
            .ok_or_else(|| Error::cant_pack(format!("bad tls {tlsdatastart:#x}")))?;
        data[dir_size..dir_size + take].copy_from_slice(src);

        let tlsindex = (tls.tlsindex.wrapping_sub(imagebase)) as u32;
        info!(
            "TLS: {} bytes tls data and {} relocations added",
            tlsdataend - tlsdatastart,
            saved.len()
        );

        // the index slot must read zero after decompression
        if tlsindex != 0 && tlsindex < imagesize {
            if let Some(slot) = image.get_mut(tlsindex as usize..tlsindex as usize + 4) {
                slot.fill(0);
            }
        }

        Ok(Some(Self {
            data,
            sotls,
            tlsindex,
            use_callbacks,
            relocs: saved,
            is64,
        }))
    }

    /// Aligned size of the side buffer.
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// On-disk size of the TLS data directory entry.
    pub fn dir_entry_size(&self) -> u32 {
        if self.is64 {
            0x28
        } else {
            0x18
        }
    }

    /// Pass 2: rebase the clone to `newaddr` and emit relocations for its
    /// pointers. `tls_handler_offset` is the stub's TLS handler (0 when
    /// the stub has none).
    pub fn finalize(
        &mut self,
        rel: &mut RelocBuilder,
        newaddr: u32,
        imagebase: u64,
        tls_handler_offset: u32,
    ) -> Result<()> {
        let is64 = self.is64;
        let dir_size = if is64 {
            TlsDirectory64::SIZE
        } else {
            TlsDirectory32::SIZE
        } as u32;
        let cb_size = if is64 { 8u32 } else { 4u32 };
        let reloc_type = if is64 { 10 } else { 3 };

        // in 32-bit mode the stub stores the original handler chain right
        // after a pointer that itself needs a fixup
        if !is64 && tls_handler_offset > 0 {
            rel.add(tls_handler_offset + 4, reloc_type)?;
        }

        let head_ptrs = if self.use_callbacks { 4 } else { 3 };
        for ic in 0..head_ptrs {
            rel.add(newaddr + ic * cb_size, reloc_type)?;
        }

        let tls = read_fields(&self.data, is64);

        // pointers inside the template move with the data
        for &(pos, rtype) in &self.relocs.clone() {
            let off = (pos as u64 - (tls.datastart - imagebase)) as usize + dir_size as usize;
            let mut kc = read_ptr(&self.data, off as u32, is64)?;
            if kc >= tls.datastart && kc < tls.dataend {
                kc += newaddr as u64 + dir_size as u64 - tls.datastart;
                write_ptr(&mut self.data, off, kc + imagebase, is64);
                rel.add(kc as u32, rtype)?;
            } else {
                rel.add((kc.wrapping_sub(imagebase)) as u32, rtype)?;
            }
        }

        let tls_data_size = tls.dataend - tls.datastart;
        let new_datastart = newaddr as u64 + dir_size as u64 + imagebase;
        write_field(&mut self.data, 0, new_datastart, is64);
        write_field(&mut self.data, 1, new_datastart + tls_data_size, is64);
        let new_callbacks = if self.use_callbacks {
            newaddr as u64 + self.sotls as u64 + imagebase - 2 * cb_size as u64
        } else {
            0
        };
        write_field(&mut self.data, 3, new_callbacks, is64);

        if self.use_callbacks {
            let chain = (self.sotls - 2 * cb_size) as usize;
            write_ptr(&mut self.data, chain, tls_handler_offset as u64 + imagebase, is64);
            write_ptr(&mut self.data, chain + cb_size as usize, 0, is64);
            rel.add(newaddr + self.sotls - 2 * cb_size, reloc_type)?;
        }
        Ok(())
    }

    /// The finished side buffer.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

fn read_ptr(buf: &[u8], off: u32, is64: bool) -> Result<u64> {
    let off = off as usize;
    let len = if is64 { 8 } else { 4 };
    let raw = buf
        .get(off..off + len)
        .ok_or_else(|| Error::cant_pack(format!("bad TLS {off:#x}")))?;
    Ok(if is64 {
        u64::from_le_bytes([
            raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
        ])
    } else {
        u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as u64
    })
}

fn write_ptr(buf: &mut [u8], off: usize, value: u64, is64: bool) {
    if is64 {
        buf[off..off + 8].copy_from_slice(&value.to_le_bytes());
    } else {
        buf[off..off + 4].copy_from_slice(&(value as u32).to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_directory_sizes() {
        assert_eq!(TlsDirectory32::SIZE, 24);
        assert_eq!(TlsDirectory64::SIZE, 40);
    }

    #[test]
    fn test_tls_directory_32_roundtrip() {
        let original = TlsDirectory32 {
            start_address_of_raw_data: 0x0040_1000,
            end_address_of_raw_data: 0x0040_1100,
            address_of_index: 0x0040_2000,
            address_of_callbacks: 0x0040_3000,
            size_of_zero_fill: 256,
            characteristics: 0,
        };
        let mut buf = [0u8; TlsDirectory32::SIZE];
        original.write(&mut buf);
        assert_eq!(TlsDirectory32::parse(&buf), original);
    }

    #[test]
    fn test_tls_directory_64_roundtrip() {
        let original = TlsDirectory64 {
            start_address_of_raw_data: 0x1_4000_1000,
            end_address_of_raw_data: 0x1_4000_1100,
            address_of_index: 0x1_4000_2000,
            address_of_callbacks: 0,
            size_of_zero_fill: 512,
            characteristics: 0,
        };
        let mut buf = [0u8; TlsDirectory64::SIZE];
        original.write(&mut buf);
        assert_eq!(TlsDirectory64::parse(&buf), original);
    }

    fn image_with_tls(callbacks: bool) -> (Vec<u8>, DataDirectory) {
        let imagebase = 0x40_0000u64;
        let mut image = vec![0u8; 0x4000];
        let dir = TlsDirectory32 {
            start_address_of_raw_data: (imagebase + 0x2000) as u32,
            end_address_of_raw_data: (imagebase + 0x2010) as u32,
            address_of_index: (imagebase + 0x2100) as u32,
            address_of_callbacks: if callbacks {
                (imagebase + 0x2200) as u32
            } else {
                0
            },
            size_of_zero_fill: 0,
            characteristics: 0,
        };
        dir.write(&mut image[0x1000..0x1000 + 24]);
        image[0x2000..0x2010].copy_from_slice(b"tls template....");
        if callbacks {
            image[0x2200..0x2204].copy_from_slice(&(imagebase as u32 + 0x1500).to_le_bytes());
        }
        (
            image,
            DataDirectory {
                vaddr: 0x1000,
                size: 24,
            },
        )
    }

    #[test]
    fn test_process_no_tls() {
        let mut image = vec![0u8; 0x1000];
        let none = TlsProcessor::process(
            &mut image,
            DataDirectory::default(),
            &RelocReader::default(),
            0x40_0000,
            0x4000,
            false,
            false,
        )
        .unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn test_process_rejects_efi() {
        let (mut image, dir) = image_with_tls(false);
        let err = TlsProcessor::process(
            &mut image,
            dir,
            &RelocReader::default(),
            0x40_0000,
            0x4000,
            true,
            false,
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "TLS not supported on EFI");
    }

    #[test]
    fn test_process_clones_template() {
        let (mut image, dir) = image_with_tls(false);
        let tls = TlsProcessor::process(
            &mut image,
            dir,
            &RelocReader::default(),
            0x40_0000,
            0x4000,
            false,
            false,
        )
        .unwrap()
        .unwrap();
        assert!(!tls.use_callbacks);
        assert_eq!(tls.size(), 24 + 16);
        assert_eq!(&tls.data()[24..40], b"tls template....");
        assert_eq!(tls.tlsindex, 0x2100);
        // the index slot was zeroed
        assert_eq!(&image[0x2100..0x2104], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_finalize_rebases_directory() {
        let (mut image, dir) = image_with_tls(true);
        let mut tls = TlsProcessor::process(
            &mut image,
            dir,
            &RelocReader::default(),
            0x40_0000,
            0x4000,
            false,
            false,
        )
        .unwrap()
        .unwrap();
        assert!(tls.use_callbacks);
        // template (16) + dir (24) rounded to 4, plus two chain slots
        assert_eq!(tls.size(), 24 + 16 + 8);

        let mut rel = RelocBuilder::new(64);
        tls.finalize(&mut rel, 0x3000, 0x40_0000, 0x1234).unwrap();

        let rebased = TlsDirectory32::parse(tls.data());
        assert_eq!(rebased.start_address_of_raw_data, 0x40_0000 + 0x3000 + 24);
        assert_eq!(
            rebased.end_address_of_raw_data,
            rebased.start_address_of_raw_data + 16
        );
        // callback chain: one handler entry then the terminator
        let chain = (tls.size() - 8) as usize;
        let first = u32::from_le_bytes([
            tls.data()[chain],
            tls.data()[chain + 1],
            tls.data()[chain + 2],
            tls.data()[chain + 3],
        ]);
        assert_eq!(first, 0x40_0000 + 0x1234);
        assert_eq!(rebased.address_of_callbacks, 0x40_0000 + 0x3000 + tls.size() - 8);

        let out = rel.finish(false).unwrap();
        let reader = RelocReader::parse(&out, false).unwrap();
        // handler slot + 4 head pointers + the chain entry
        assert_eq!(reader.total(), 6);
    }
}
