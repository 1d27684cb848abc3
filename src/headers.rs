//! PE file headers: the MZ header chain, the fixed PE header pair and the
//! pack header the packer embeds in its output.
//!
//! The PE header is modelled as one fixed-size block starting at the
//! `PE\0\0` signature: 248 bytes for PE32, 264 for PE32+, both ending in
//! the 16 data directory entries. This mirrors the on-disk layout exactly
//! so the header can be stashed verbatim in the extra-info trailer and
//! restored on unpack.

use crate::data_dir::DataDirectory;
use crate::stream::InputSource;
use crate::{Error, Result};

/// Machine types.
pub mod machine {
    pub const I386: u16 = 0x14C;
    /// Upper bound of the i386 family range accepted by the packer.
    /// Origin unclear; kept verbatim.
    pub const I386_FAMILY_MAX: u16 = 0x150;
    pub const ARM: u16 = 0x1C0;
    pub const THUMB: u16 = 0x1C2;
    pub const ARMNT: u16 = 0x1C4;
    pub const IA64: u16 = 0x200;
    pub const AMD64: u16 = 0x8664;
    pub const ARM64: u16 = 0xAA64;
    pub const ARM64EC: u16 = 0xA641;
    pub const LOONGARCH64: u16 = 0x6264;
    pub const RISCV64: u16 = 0x5064;
}

/// Subsystem values.
pub mod subsystem {
    pub const NATIVE: u16 = 1;
    pub const WINDOWS_GUI: u16 = 2;
    pub const WINDOWS_CUI: u16 = 3;
    pub const WINDOWS_CE_GUI: u16 = 9;
    pub const EFI_APPLICATION: u16 = 10;
    pub const EFI_BOOT_SERVICE_DRIVER: u16 = 11;
    pub const EFI_RUNTIME_DRIVER: u16 = 12;
    pub const EFI_ROM: u16 = 13;

    /// Bit mask of all EFI subsystems.
    pub const EFI_MASK: u32 = (1 << EFI_APPLICATION)
        | (1 << EFI_BOOT_SERVICE_DRIVER)
        | (1 << EFI_RUNTIME_DRIVER)
        | (1 << EFI_ROM);
}

/// COFF characteristics flags.
pub mod coff_flags {
    pub const RELOCS_STRIPPED: u16 = 0x0001;
    pub const EXECUTABLE_IMAGE: u16 = 0x0002;
    pub const DLL: u16 = 0x2000;
}

/// DLL characteristics flags.
pub mod dll_flags {
    pub const HIGH_ENTROPY_VA: u16 = 0x0020;
    pub const DYNAMIC_BASE: u16 = 0x0040;
    pub const FORCE_INTEGRITY: u16 = 0x0080;
    pub const NX_COMPAT: u16 = 0x0100;
    pub const GUARD_CF: u16 = 0x4000;
}

/// GuardFlags value written when Control Flow Guard is force-disabled.
pub const GUARD_SECURITY_COOKIE_UNUSED: u32 = 0x0000_0800;

/// Supported output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Format {
    W32PeI386 = 1,
    W64PeAmd64 = 2,
    WinCeArm = 3,
}

impl Format {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::W32PeI386),
            2 => Some(Self::W64PeAmd64),
            3 => Some(Self::WinCeArm),
            _ => None,
        }
    }

    /// Whether images of this format use 64-bit thunks and headers.
    pub fn is_64bit(self) -> bool {
        matches!(self, Self::W64PeAmd64)
    }

    /// The DLL supplying the loader's own imports.
    pub fn kernel_dll(self) -> &'static str {
        match self {
            Self::WinCeArm => "COREDLL.dll",
            _ => "kernel32.dll",
        }
    }

    /// Bit mask of subsystems accepted for this format.
    pub fn subsystem_mask(self) -> u32 {
        match self {
            Self::WinCeArm => 1 << subsystem::WINDOWS_CE_GUI,
            _ => {
                (1 << subsystem::WINDOWS_GUI)
                    | (1 << subsystem::WINDOWS_CUI)
                    | subsystem::EFI_MASK
            }
        }
    }

    /// Preferred imagebase used by the strip-relocs default.
    pub fn default_imagebase(self) -> u64 {
        match self {
            Self::W32PeI386 => 0x40_0000,
            Self::W64PeAmd64 => 0x1_4000_0000,
            Self::WinCeArm => 0x1_0000,
        }
    }

    /// WinCE wants resources alone in the last section.
    pub fn last_section_rsrc_only(self) -> bool {
        matches!(self, Self::WinCeArm)
    }
}

/// Map a machine type to the output format, rejecting known-unsupported
/// machines with a specific message.
pub fn check_machine(cpu: u16) -> Result<Format> {
    // unsupported
    if cpu == machine::IA64 {
        return Err(Error::cant_pack("win64/ia64 is not supported"));
    }
    if cpu == machine::LOONGARCH64 {
        return Err(Error::cant_pack("win64/loong64 is not supported"));
    }
    if cpu == machine::RISCV64 {
        return Err(Error::cant_pack("win64/riscv64 is not supported"));
    }

    // known but not supported
    if cpu == machine::ARMNT {
        return Err(Error::cant_pack("win32/armnt is not supported"));
    }
    if cpu == machine::ARM64 {
        return Err(Error::cant_pack("win64/arm64 is not supported"));
    }
    if cpu == machine::ARM64EC {
        return Err(Error::cant_pack("win64/arm64ec is not supported"));
    }

    // supported
    if cpu == machine::AMD64 {
        return Ok(Format::W64PeAmd64);
    }
    if cpu == machine::ARM || cpu == machine::THUMB {
        return Ok(Format::WinCeArm);
    }
    if cpu >= machine::I386 && cpu <= machine::I386_FAMILY_MAX {
        return Ok(Format::W32PeI386);
    }

    Err(Error::cant_pack(format!("unsupported machine {cpu:#x}")))
}

/// The fields of the 64-byte MZ header the packer cares about.
#[derive(Debug, Clone, Copy)]
pub struct ExeHeader {
    pub mz: u16,
    pub m512: u16,
    pub p512: u16,
    pub relocoffs: u16,
    pub nexepos: u32,
}

impl ExeHeader {
    pub const SIZE: usize = 64;

    pub fn parse(data: &[u8; Self::SIZE]) -> Self {
        Self {
            mz: u16::from_le_bytes([data[0], data[1]]),
            m512: u16::from_le_bytes([data[2], data[3]]),
            p512: u16::from_le_bytes([data[4], data[5]]),
            relocoffs: u16::from_le_bytes([data[24], data[25]]),
            nexepos: u32::from_le_bytes([data[60], data[61], data[62], data[63]]),
        }
    }

    pub fn is_mz(&self) -> bool {
        self.mz == u16::from_le_bytes(*b"MZ")
    }
}

/// Locate the PE header by following the MZ header chain.
///
/// DOS executables can be chained (`nexepos` of one pointing at the next),
/// so the search hops up to 20 times. Each hop is validated against header
/// overlap and offset wrap-around. Returns `None` if no PE signature is
/// found, i.e. the input is not this format.
pub fn find_pe_offset<S: InputSource + ?Sized>(src: &S) -> Result<Option<u32>> {
    let file_size = src.size();
    let mut pe_offset = 0u32;
    for _ in 0..20 {
        let mut raw = [0u8; ExeHeader::SIZE];
        src.readx_at(pe_offset as u64, &mut raw)?;
        let h = ExeHeader::parse(&raw);
        if h.is_mz() {
            if h.nexepos != 0 && (h.nexepos as usize) < ExeHeader::SIZE {
                // Overlapping MZ and PE headers produced by 'leanify', etc.
                return Err(Error::cant_pack(format!(
                    "PE and MZ header overlap: {:#x} < {:#x}",
                    h.nexepos,
                    ExeHeader::SIZE
                )));
            }
            let delta = if h.relocoffs >= 0x40 {
                h.nexepos // new format exe
            } else if h.p512 != 0 {
                512
            } else {
                h.nexepos
            };
            let next = pe_offset.checked_add(delta);
            match next {
                Some(n) if (n as u64) <= file_size => pe_offset = n,
                _ => {
                    return Err(Error::cant_pack(format!(
                        "bad PE delta {delta:#x} at offset {pe_offset:#x}"
                    )))
                }
            }
        } else if raw[0..4] == *b"PE\0\0" {
            return Ok(Some(pe_offset));
        } else {
            return Ok(None);
        }
    }
    Ok(None)
}

/// The fixed PE header: signature, COFF header and optional header with 16
/// data directories, as one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeHeader {
    pub is64: bool,
    // COFF
    pub cpu: u16,
    pub objects: u16,
    pub time_date_stamp: u32,
    pub symbol_table_ptr: u32,
    pub symbol_count: u32,
    pub opthdrsize: u16,
    pub flags: u16,
    // optional header
    pub coff_magic: u16,
    pub linker_major: u8,
    pub linker_minor: u8,
    pub codesize: u32,
    pub datasize: u32,
    pub bsssize: u32,
    pub entry: u32,
    pub codebase: u32,
    /// PE32 only; absent from the PE32+ layout.
    pub database: u32,
    pub imagebase: u64,
    pub objectalign: u32,
    pub filealign: u32,
    pub os_major: u16,
    pub os_minor: u16,
    pub image_major: u16,
    pub image_minor: u16,
    pub subsystem_major: u16,
    pub subsystem_minor: u16,
    pub win32_version: u32,
    pub imagesize: u32,
    pub headersize: u32,
    pub chksum: u32,
    pub subsystem: u16,
    pub dllflags: u16,
    pub stackreserve: u64,
    pub stackcommit: u64,
    pub heapreserve: u64,
    pub heapcommit: u64,
    pub loader_flags: u32,
    pub ddirsentries: u32,
    pub ddirs: [DataDirectory; 16],
}

pub const PE32_MAGIC: u16 = 0x10B;
pub const PE32PLUS_MAGIC: u16 = 0x20B;

impl PeHeader {
    pub const SIZE32: usize = 248;
    pub const SIZE64: usize = 264;

    /// On-disk size of this header.
    pub fn size(&self) -> usize {
        if self.is64 {
            Self::SIZE64
        } else {
            Self::SIZE32
        }
    }

    /// Parse a fixed PE header starting at the `PE\0\0` signature.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE32 {
            return Err(Error::cant_pack("truncated PE header"));
        }
        if data[0..4] != *b"PE\0\0" {
            return Err(Error::cant_pack("bad PE signature"));
        }
        let u16_at = |o: usize| u16::from_le_bytes([data[o], data[o + 1]]);
        let u32_at = |o: usize| u32::from_le_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]]);
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

        let coff_magic = u16_at(24);
        let is64 = match coff_magic {
            PE32_MAGIC => false,
            PE32PLUS_MAGIC => true,
            other => {
                return Err(Error::cant_pack(format!(
                    "bad optional header magic {other:#x}"
                )))
            }
        };
        if is64 && data.len() < Self::SIZE64 {
            return Err(Error::cant_pack("truncated PE header"));
        }

        let mut hdr = Self {
            is64,
            cpu: u16_at(4),
            objects: u16_at(6),
            time_date_stamp: u32_at(8),
            symbol_table_ptr: u32_at(12),
            symbol_count: u32_at(16),
            opthdrsize: u16_at(20),
            flags: u16_at(22),
            coff_magic,
            linker_major: data[26],
            linker_minor: data[27],
            codesize: u32_at(28),
            datasize: u32_at(32),
            bsssize: u32_at(36),
            entry: u32_at(40),
            codebase: u32_at(44),
            database: if is64 { 0 } else { u32_at(48) },
            imagebase: if is64 {
                u64_at(48)
            } else {
                u32_at(52) as u64
            },
            objectalign: u32_at(56),
            filealign: u32_at(60),
            os_major: u16_at(64),
            os_minor: u16_at(66),
            image_major: u16_at(68),
            image_minor: u16_at(70),
            subsystem_major: u16_at(72),
            subsystem_minor: u16_at(74),
            win32_version: u32_at(76),
            imagesize: u32_at(80),
            headersize: u32_at(84),
            chksum: u32_at(88),
            subsystem: u16_at(92),
            dllflags: u16_at(94),
            stackreserve: 0,
            stackcommit: 0,
            heapreserve: 0,
            heapcommit: 0,
            loader_flags: 0,
            ddirsentries: 0,
            ddirs: [DataDirectory::default(); 16],
        };

        let ddirs_offset;
        if is64 {
            hdr.stackreserve = u64_at(96);
            hdr.stackcommit = u64_at(104);
            hdr.heapreserve = u64_at(112);
            hdr.heapcommit = u64_at(120);
            hdr.loader_flags = u32_at(128);
            hdr.ddirsentries = u32_at(132);
            ddirs_offset = 136;
        } else {
            hdr.stackreserve = u32_at(96) as u64;
            hdr.stackcommit = u32_at(100) as u64;
            hdr.heapreserve = u32_at(104) as u64;
            hdr.heapcommit = u32_at(108) as u64;
            hdr.loader_flags = u32_at(112);
            hdr.ddirsentries = u32_at(116);
            ddirs_offset = 120;
        }
        for (ic, dir) in hdr.ddirs.iter_mut().enumerate() {
            *dir = DataDirectory::parse(&data[ddirs_offset + ic * 8..ddirs_offset + ic * 8 + 8]);
        }
        Ok(hdr)
    }

    /// Write the header to a buffer of at least `self.size()` bytes.
    pub fn write(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(b"PE\0\0");
        buf[4..6].copy_from_slice(&self.cpu.to_le_bytes());
        buf[6..8].copy_from_slice(&self.objects.to_le_bytes());
        buf[8..12].copy_from_slice(&self.time_date_stamp.to_le_bytes());
        buf[12..16].copy_from_slice(&self.symbol_table_ptr.to_le_bytes());
        buf[16..20].copy_from_slice(&self.symbol_count.to_le_bytes());
        buf[20..22].copy_from_slice(&self.opthdrsize.to_le_bytes());
        buf[22..24].copy_from_slice(&self.flags.to_le_bytes());
        buf[24..26].copy_from_slice(&self.coff_magic.to_le_bytes());
        buf[26] = self.linker_major;
        buf[27] = self.linker_minor;
        buf[28..32].copy_from_slice(&self.codesize.to_le_bytes());
        buf[32..36].copy_from_slice(&self.datasize.to_le_bytes());
        buf[36..40].copy_from_slice(&self.bsssize.to_le_bytes());
        buf[40..44].copy_from_slice(&self.entry.to_le_bytes());
        buf[44..48].copy_from_slice(&self.codebase.to_le_bytes());
        if self.is64 {
            buf[48..56].copy_from_slice(&self.imagebase.to_le_bytes());
        } else {
            buf[48..52].copy_from_slice(&self.database.to_le_bytes());
            buf[52..56].copy_from_slice(&(self.imagebase as u32).to_le_bytes());
        }
        buf[56..60].copy_from_slice(&self.objectalign.to_le_bytes());
        buf[60..64].copy_from_slice(&self.filealign.to_le_bytes());
        buf[64..66].copy_from_slice(&self.os_major.to_le_bytes());
        buf[66..68].copy_from_slice(&self.os_minor.to_le_bytes());
        buf[68..70].copy_from_slice(&self.image_major.to_le_bytes());
        buf[70..72].copy_from_slice(&self.image_minor.to_le_bytes());
        buf[72..74].copy_from_slice(&self.subsystem_major.to_le_bytes());
        buf[74..76].copy_from_slice(&self.subsystem_minor.to_le_bytes());
        buf[76..80].copy_from_slice(&self.win32_version.to_le_bytes());
        buf[80..84].copy_from_slice(&self.imagesize.to_le_bytes());
        buf[84..88].copy_from_slice(&self.headersize.to_le_bytes());
        buf[88..92].copy_from_slice(&self.chksum.to_le_bytes());
        buf[92..94].copy_from_slice(&self.subsystem.to_le_bytes());
        buf[94..96].copy_from_slice(&self.dllflags.to_le_bytes());
        let ddirs_offset;
        if self.is64 {
            buf[96..104].copy_from_slice(&self.stackreserve.to_le_bytes());
            buf[104..112].copy_from_slice(&self.stackcommit.to_le_bytes());
            buf[112..120].copy_from_slice(&self.heapreserve.to_le_bytes());
            buf[120..128].copy_from_slice(&self.heapcommit.to_le_bytes());
            buf[128..132].copy_from_slice(&self.loader_flags.to_le_bytes());
            buf[132..136].copy_from_slice(&self.ddirsentries.to_le_bytes());
            ddirs_offset = 136;
        } else {
            buf[96..100].copy_from_slice(&(self.stackreserve as u32).to_le_bytes());
            buf[100..104].copy_from_slice(&(self.stackcommit as u32).to_le_bytes());
            buf[104..108].copy_from_slice(&(self.heapreserve as u32).to_le_bytes());
            buf[108..112].copy_from_slice(&(self.heapcommit as u32).to_le_bytes());
            buf[112..116].copy_from_slice(&self.loader_flags.to_le_bytes());
            buf[116..120].copy_from_slice(&self.ddirsentries.to_le_bytes());
            ddirs_offset = 120;
        }
        for (ic, dir) in self.ddirs.iter().enumerate() {
            dir.write(&mut buf[ddirs_offset + ic * 8..ddirs_offset + ic * 8 + 8]);
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.size()];
        self.write(&mut buf);
        buf
    }

    /// Pointer size of the image (4 or 8).
    pub fn ptr_size(&self) -> u32 {
        if self.is64 {
            8
        } else {
            4
        }
    }

    /// Whether the subsystem is one of the EFI variants.
    pub fn is_efi(&self) -> bool {
        self.subsystem < 32 && (1u32 << self.subsystem) & subsystem::EFI_MASK != 0
    }

    pub fn is_dll(&self) -> bool {
        !self.is_efi() && self.flags & coff_flags::DLL != 0
    }
}

/// Version byte written into the pack header; bumped when the packed
/// layout changes incompatibly.
pub const PACK_VERSION: u8 = 14;

/// Magic identifying the embedded pack header.
pub const PACK_MAGIC: [u8; 4] = *b"UPX!";

/// The small header embedded in the packed file, describing the compressed
/// stream so the unpacker can find and invert it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackHeader {
    pub version: u8,
    pub format: Format,
    pub method: u8,
    pub level: u8,
    pub u_len: u32,
    pub c_len: u32,
    pub filter: u8,
    pub filter_cto: u8,
}

impl PackHeader {
    pub const SIZE: usize = 20;

    pub fn write(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&PACK_MAGIC);
        buf[4] = self.version;
        buf[5] = self.format as u8;
        buf[6] = self.method;
        buf[7] = self.level;
        buf[8..12].copy_from_slice(&self.u_len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.c_len.to_le_bytes());
        buf[16] = self.filter;
        buf[17] = self.filter_cto;
        buf[18..20].copy_from_slice(&0u16.to_le_bytes());
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::SIZE];
        self.write(&mut buf);
        buf
    }

    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE || data[0..4] != PACK_MAGIC {
            return Err(Error::cant_unpack("pack header not found"));
        }
        if data[4] != PACK_VERSION {
            return Err(Error::cant_unpack(
                "program has been modified; run a virus checker!",
            ));
        }
        let format = Format::from_u8(data[5]).ok_or_else(|| {
            Error::cant_unpack("this program is packed with an obsolete version")
        })?;
        Ok(Self {
            version: data[4],
            format,
            method: data[6],
            level: data[7],
            u_len: u32::from_le_bytes([data[8], data[9], data[10], data[11]]),
            c_len: u32::from_le_bytes([data[12], data[13], data[14], data[15]]),
            filter: data[16],
            filter_cto: data[17],
        })
    }

    /// Scan a window for the pack header magic. Returns the offset of the
    /// header within the window and the parsed header.
    pub fn find(window: &[u8]) -> Result<(usize, Self)> {
        let mut off = 0;
        while off + Self::SIZE <= window.len() {
            if window[off..off + 4] == PACK_MAGIC {
                return Self::parse(&window[off..]).map(|ph| (off, ph));
            }
            off += 1;
        }
        Err(Error::cant_unpack("pack header not found"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::SliceSource;

    fn mz_header(relocoffs: u16, nexepos: u32) -> [u8; 64] {
        let mut h = [0u8; 64];
        h[0..2].copy_from_slice(b"MZ");
        h[24..26].copy_from_slice(&relocoffs.to_le_bytes());
        h[60..64].copy_from_slice(&nexepos.to_le_bytes());
        h
    }

    #[test]
    fn test_check_machine() {
        assert_eq!(check_machine(machine::I386).unwrap(), Format::W32PeI386);
        assert_eq!(check_machine(0x150).unwrap(), Format::W32PeI386);
        assert_eq!(check_machine(machine::AMD64).unwrap(), Format::W64PeAmd64);
        assert_eq!(check_machine(machine::THUMB).unwrap(), Format::WinCeArm);
        assert!(check_machine(machine::IA64).is_err());
        assert!(check_machine(machine::ARM64).is_err());
        assert!(check_machine(0x151).is_err());
    }

    #[test]
    fn test_find_pe_offset() {
        let mut data = vec![0u8; 0x100];
        data[0..64].copy_from_slice(&mz_header(0x40, 0x80));
        data[0x80..0x84].copy_from_slice(b"PE\0\0");
        let src = SliceSource::new(&data);
        assert_eq!(find_pe_offset(&src).unwrap(), Some(0x80));
    }

    #[test]
    fn test_find_pe_offset_overlap_rejected() {
        let mut data = vec![0u8; 0x100];
        data[0..64].copy_from_slice(&mz_header(0x40, 0x20));
        let src = SliceSource::new(&data);
        let err = find_pe_offset(&src).unwrap_err();
        assert!(err.to_string().contains("PE and MZ header overlap"));
    }

    #[test]
    fn test_find_pe_offset_bad_delta() {
        let mut data = vec![0u8; 0x100];
        data[0..64].copy_from_slice(&mz_header(0x40, 0xFFFF_FF00));
        let src = SliceSource::new(&data);
        let err = find_pe_offset(&src).unwrap_err();
        assert!(err.to_string().contains("bad PE delta"));
    }

    #[test]
    fn test_find_pe_offset_not_pe() {
        let data = vec![0u8; 0x100];
        let src = SliceSource::new(&data);
        assert_eq!(find_pe_offset(&src).unwrap(), None);
    }

    fn sample_header(is64: bool) -> PeHeader {
        PeHeader {
            is64,
            cpu: if is64 { machine::AMD64 } else { machine::I386 },
            objects: 3,
            time_date_stamp: 0,
            symbol_table_ptr: 0,
            symbol_count: 0,
            opthdrsize: if is64 { 240 } else { 224 },
            flags: coff_flags::EXECUTABLE_IMAGE,
            coff_magic: if is64 { PE32PLUS_MAGIC } else { PE32_MAGIC },
            linker_major: 14,
            linker_minor: 0,
            codesize: 0x1000,
            datasize: 0x200,
            bsssize: 0,
            entry: 0x1100,
            codebase: 0x1000,
            database: if is64 { 0 } else { 0x2000 },
            imagebase: if is64 { 0x1_4000_0000 } else { 0x40_0000 },
            objectalign: 0x1000,
            filealign: 0x200,
            os_major: 6,
            os_minor: 0,
            image_major: 0,
            image_minor: 0,
            subsystem_major: 6,
            subsystem_minor: 0,
            win32_version: 0,
            imagesize: 0x4000,
            headersize: 0x400,
            chksum: 0,
            subsystem: subsystem::WINDOWS_CUI,
            dllflags: 0,
            stackreserve: 0x100000,
            stackcommit: 0x1000,
            heapreserve: 0x100000,
            heapcommit: 0x1000,
            loader_flags: 0,
            ddirsentries: 16,
            ddirs: [DataDirectory::default(); 16],
        }
    }

    #[test]
    fn test_pe_header_roundtrip_32() {
        let hdr = sample_header(false);
        assert_eq!(hdr.size(), PeHeader::SIZE32);
        let bytes = hdr.to_bytes();
        assert_eq!(PeHeader::parse(&bytes).unwrap(), hdr);
    }

    #[test]
    fn test_pe_header_roundtrip_64() {
        let hdr = sample_header(true);
        assert_eq!(hdr.size(), PeHeader::SIZE64);
        let bytes = hdr.to_bytes();
        assert_eq!(PeHeader::parse(&bytes).unwrap(), hdr);
    }

    #[test]
    fn test_pack_header_find() {
        let ph = PackHeader {
            version: PACK_VERSION,
            format: Format::W32PeI386,
            method: 2,
            level: 8,
            u_len: 0x1234,
            c_len: 0x800,
            filter: 0,
            filter_cto: 0,
        };
        let mut window = vec![0u8; 128];
        window[37..37 + PackHeader::SIZE].copy_from_slice(&ph.to_bytes());
        let (off, found) = PackHeader::find(&window).unwrap();
        assert_eq!(off, 37);
        assert_eq!(found, ph);
    }

    #[test]
    fn test_pack_header_version_mismatch() {
        let ph = PackHeader {
            version: PACK_VERSION,
            format: Format::W32PeI386,
            method: 2,
            level: 8,
            u_len: 0,
            c_len: 0,
            filter: 0,
            filter_cto: 0,
        };
        let mut bytes = ph.to_bytes();
        bytes[4] = PACK_VERSION + 1;
        let err = PackHeader::find(&bytes).unwrap_err();
        assert!(err.to_string().contains("virus checker"));
    }
}
