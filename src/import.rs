//! Import directory processing.
//!
//! Packing walks the original import descriptors, decides which dll/proc
//! pairs the stub must resolve at load time, drives the [`ImportLinker`]
//! to build the replacement import table, and emits a compact preprocessed
//! stream the unpacker replays to reconstruct the original descriptors,
//! IATs and name tables.
//!
//! Preprocessed stream, per dll: LE32 offset of the dll name inside the new
//! import block, LE32 original IAT rva minus rvamin, then tagged entries
//! until a zero byte: 1 = imported name (zstring follows), 0xFF = ordinal
//! (LE16 follows), 0xFE = kernel32 ordinal resolved through the new import
//! table (LE32 thunk offset follows). A final LE32 zero ends the stream.

use crate::data_dir::DataDirectory;
use crate::ilinker::ImportLinker;
use crate::interval::Interval;
use crate::{Error, Result};
use log::{info, warn};

/// Stream tag: import by name, zstring follows.
pub const TAG_NAME: u8 = 1;
/// Stream tag: import by ordinal, LE16 follows.
pub const TAG_ORDINAL: u8 = 0xFF;
/// Stream tag: kernel32 ordinal import, LE32 thunk offset follows.
pub const TAG_K32_ORDINAL: u8 = 0xFE;

/// IMAGE_IMPORT_DESCRIPTOR - 20 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImportDescriptor {
    /// RVA of the import lookup table (original first thunk).
    pub oft: u32,
    pub time_date_stamp: u32,
    pub forwarder_chain: u32,
    /// RVA of the dll name.
    pub dllname: u32,
    /// RVA of the import address table.
    pub iat: u32,
}

impl ImportDescriptor {
    pub const SIZE: usize = 20;

    pub fn parse(data: &[u8]) -> Self {
        Self {
            oft: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            time_date_stamp: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            forwarder_chain: u32::from_le_bytes([data[8], data[9], data[10], data[11]]),
            dllname: u32::from_le_bytes([data[12], data[13], data[14], data[15]]),
            iat: u32::from_le_bytes([data[16], data[17], data[18], data[19]]),
        }
    }

    pub fn write(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.oft.to_le_bytes());
        buf[4..8].copy_from_slice(&self.time_date_stamp.to_le_bytes());
        buf[8..12].copy_from_slice(&self.forwarder_chain.to_le_bytes());
        buf[12..16].copy_from_slice(&self.dllname.to_le_bytes());
        buf[16..20].copy_from_slice(&self.iat.to_le_bytes());
    }
}

fn subref<'a>(image: &'a [u8], off: u32, len: usize, what: &str) -> Result<&'a [u8]> {
    let off = off as usize;
    if off + len > image.len() {
        return Err(Error::cant_pack(format!("bad {what} {off:#x}")));
    }
    Ok(&image[off..off + len])
}

fn zstr_at<'a>(image: &'a [u8], off: u32, what: &str) -> Result<&'a [u8]> {
    let start = off as usize;
    if start >= image.len() {
        return Err(Error::cant_pack(format!("bad {what} {start:#x}")));
    }
    let end = image[start..]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::cant_pack(format!("bad {what} {start:#x}")))?;
    Ok(&image[start..start + end])
}

fn thunk_at(image: &[u8], off: u32, is64: bool) -> Result<u64> {
    let raw = subref(image, off, if is64 { 8 } else { 4 }, "dll lookupt")?;
    Ok(if is64 {
        u64::from_le_bytes([
            raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
        ])
    } else {
        u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as u64
    })
}

/// High bit marking an ordinal import in a thunk.
fn ord_mask(is64: bool) -> u64 {
    if is64 {
        1 << 63
    } else {
        1 << 31
    }
}

struct UDll {
    name_off: u32,
    name: Vec<u8>,
    shname: Option<Vec<u8>>,
    ordinal: u16,
    iat: u32,
    lookup: u32,
    first_thunk: u64,
    original_position: usize,
    isk32: bool,
}

/// Inputs to the pass-1 import processor.
pub struct ImportContext<'a> {
    pub image: &'a mut [u8],
    pub import_dir: DataDirectory,
    pub rvamin: u32,
    pub is64: bool,
    pub is_dll: bool,
    pub is_efi: bool,
    pub kernel_dll: &'a str,
}

/// Result of the pass-1 import processor.
#[derive(Debug)]
pub struct ProcessedImports {
    pub linker: ImportLinker,
    /// The preprocessed import stream.
    pub oimport: Vec<u8>,
    /// Size of the new import table built by the linker.
    pub soimpdlls: usize,
    /// Start RVA of the (contiguous) dll name region, 0 if scattered.
    pub dllstrings: u32,
    pub import_by_ordinal: bool,
    pub kernel32_ordinal: bool,
}

/// Pass 1: parse the original imports, populate the linker, emit the
/// preprocessed stream and zero what the unpacker can reconstruct.
pub fn process_imports(ctx: ImportContext<'_>) -> Result<Option<ProcessedImports>> {
    let ImportContext {
        image,
        import_dir,
        rvamin,
        is64,
        is_dll,
        is_efi,
        kernel_dll,
    } = ctx;

    if is_efi {
        if !import_dir.is_empty() {
            return Err(Error::cant_pack("imports not supported on EFI"));
        }
        return Ok(None);
    }
    if import_dir.vaddr == 0 {
        return Ok(None);
    }

    let omask = ord_mask(is64);
    let thunk_size = if is64 { 8u32 } else { 4u32 };

    // count descriptors
    let mut dllnum = 0usize;
    loop {
        let off = import_dir.vaddr + (dllnum * ImportDescriptor::SIZE) as u32;
        let desc = ImportDescriptor::parse(subref(image, off, ImportDescriptor::SIZE, "import")?);
        if desc.dllname == 0 {
            break;
        }
        dllnum += 1;
        if dllnum > 4096 {
            return Err(Error::cant_pack(format!("too many DLL imports {dllnum}")));
        }
    }

    let mut soimport = 1024usize; // safety
    let mut dlls = Vec::with_capacity(dllnum);
    let mut import_by_ordinal = false;

    for ic in 0..dllnum {
        let off = import_dir.vaddr + (ic * ImportDescriptor::SIZE) as u32;
        let desc = ImportDescriptor::parse(subref(image, off, ImportDescriptor::SIZE, "import")?);
        let name = zstr_at(image, desc.dllname, "dllname")?.to_vec();
        let lookup = if desc.oft != 0 { desc.oft } else { desc.iat };
        let mut dll = UDll {
            name_off: desc.dllname,
            shname: None,
            ordinal: 0,
            iat: desc.iat,
            lookup,
            first_thunk: thunk_at(image, lookup, is64)?,
            original_position: ic,
            isk32: name.eq_ignore_ascii_case(kernel_dll.as_bytes()),
            name,
        };
        soimport += dll.name.len() + 1 + 4;

        let mut toff = lookup;
        loop {
            let entry = thunk_at(image, toff, is64)?;
            if entry == 0 {
                break;
            }
            if entry & omask != 0 {
                import_by_ordinal = true;
                soimport += 2;
                dll.ordinal = (entry & 0xFFFF) as u16;
            } else {
                let name = zstr_at(image, entry as u32 + 2, "import name")?;
                soimport += name.len() + 1;
                if dll
                    .shname
                    .as_ref()
                    .is_none_or(|sh| name.len() < sh.len())
                {
                    dll.shname = Some(name.to_vec());
                }
            }
            soimport += 1; // separator
            toff += thunk_size;
        }
        dlls.push(dll);
    }

    let mut order: Vec<usize> = (0..dllnum).collect();
    order.sort_by(|&a, &b| {
        use std::cmp::Ordering;
        let (a, b) = (&dlls[a], &dlls[b]);
        if a.original_position == b.original_position {
            return Ordering::Equal;
        }
        b.isk32
            .cmp(&a.isk32)
            .then((b.first_thunk != 0).cmp(&(a.first_thunk != 0)))
            .then_with(|| {
                a.name
                    .to_ascii_lowercase()
                    .cmp(&b.name.to_ascii_lowercase())
            })
            .then((b.ordinal != 0).cmp(&(a.ordinal != 0)))
            .then_with(|| match (&a.shname, &b.shname) {
                (Some(x), Some(y)) => x.len().cmp(&y.len()).then(x.cmp(y)),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
            .then(a.original_position.cmp(&b.original_position))
    });

    info!("Processing imports: {dllnum} DLLs");

    let mut linker = ImportLinker::new(thunk_size);
    // imports the stub itself needs
    linker.add_proc(kernel_dll, "LoadLibraryA");
    linker.add_proc(kernel_dll, "GetProcAddress");
    if !is_dll {
        linker.add_proc(kernel_dll, "ExitProcess");
    }
    linker.add_proc(kernel_dll, "VirtualProtect");

    let mut kernel32_ordinal = false;
    for &idx in &order {
        let dll = &dlls[idx];
        let name = String::from_utf8_lossy(&dll.name).into_owned();
        if dll.isk32 {
            // for kernel32.dll every imported ordinal goes into the new
            // import table: on some versions of windows GetProcAddress
            // does not resolve them
            if !name.eq_ignore_ascii_case("kernel32.dll") {
                continue;
            }
            if dll.ordinal != 0 {
                let mut toff = dll.lookup;
                loop {
                    let entry = thunk_at(image, toff, is64)?;
                    if entry == 0 {
                        break;
                    }
                    if entry & omask != 0 {
                        linker.add_ordinal(kernel_dll, (entry & 0xFFFF) as u16);
                        kernel32_ordinal = true;
                    }
                    toff += thunk_size;
                }
            }
        } else if !linker.has_dll(&name) {
            match (&dll.shname, dll.ordinal) {
                (Some(sh), 0) => {
                    linker.add_proc(&name, &String::from_utf8_lossy(sh));
                }
                _ => linker.add_ordinal(&name, dll.ordinal),
            }
        }
    }

    let soimpdlls = linker.build();

    let mut names = Interval::new();
    let mut iats = Interval::new();
    let mut lookups = Interval::new();

    // create the preprocessed stream
    let mut ppi: Vec<u8> = Vec::with_capacity(soimport);
    for &idx in &order {
        let dll = &dlls[idx];
        let dname = String::from_utf8_lossy(&dll.name).into_owned();
        ppi.extend_from_slice(&(linker.dll_name_offset(&dname)? as u32).to_le_bytes());
        ppi.extend_from_slice(&(dll.iat.wrapping_sub(rvamin)).to_le_bytes());

        let mut toff = dll.lookup;
        let mut count = 0u32;
        loop {
            let entry = thunk_at(image, toff, is64)?;
            if entry == 0 {
                break;
            }
            if entry & omask != 0 {
                let ord = (entry & 0xFFFF) as u16;
                if dll.isk32 && kernel32_ordinal {
                    ppi.push(TAG_K32_ORDINAL);
                    ppi.extend_from_slice(
                        &(linker.thunk_offset_ordinal(kernel_dll, ord)? as u32).to_le_bytes(),
                    );
                } else {
                    ppi.push(TAG_ORDINAL);
                    ppi.extend_from_slice(&ord.to_le_bytes());
                }
            } else {
                ppi.push(TAG_NAME);
                let name = zstr_at(image, entry as u32 + 2, "import name")?;
                ppi.extend_from_slice(name);
                ppi.push(0);
                names.add(entry as u32, 2 + name.len() as u32 + 1);
            }
            toff += thunk_size;
            count += 1;
        }
        ppi.push(0); // end of dll

        let esize = count * thunk_size;
        lookups.add(dll.lookup, esize);
        if dll.iat != dll.lookup {
            // the unpacker rebuilds from the IAT, so it must mirror the
            // lookup table
            let src = subref(image, dll.lookup, esize as usize, "import")?.to_vec();
            subref(image, dll.iat, esize as usize, "import name")?;
            image[dll.iat as usize..(dll.iat + esize) as usize].copy_from_slice(&src);
            iats.add(dll.iat, esize);
        }
        names.add(dll.name_off, dll.name.len() as u32 + 1 + 1);
    }
    ppi.extend_from_slice(&0u32.to_le_bytes());
    debug_assert!(ppi.len() < soimport);
    let mut oimport = ppi;
    if oimport.len() == 4 {
        oimport.clear();
    }

    let descriptors_len = (ImportDescriptor::SIZE * dllnum) as u32;
    let mut ilen = 0u32;
    names.flatten();
    if names.len() > 1 {
        // the dll and imported names are not in one contiguous area, so
        // the iat cannot be zeroed without breaking decompression
        warn!("can't remove unneeded imports");
        ilen += descriptors_len;
        // keep a descriptor stub so the unpacker can find the names
        for (ic, &idx) in order.iter().enumerate() {
            let off = import_dir.vaddr as usize + ic * ImportDescriptor::SIZE;
            image[off..off + ImportDescriptor::SIZE].fill(0);
            let desc = ImportDescriptor {
                dllname: dlls[idx].name_off,
                ..Default::default()
            };
            desc.write(&mut image[off..off + ImportDescriptor::SIZE]);
        }
    } else {
        iats.add(import_dir.vaddr, descriptors_len);
        // zero unneeded data
        iats.clear(image);
        lookups.clear(image);
    }
    names.clear(image);

    iats.add_interval(&names);
    iats.add_interval(&lookups);
    iats.flatten();
    ilen += iats.covered();

    info!(
        "Imports: original size: {} bytes, preprocessed size: {} bytes",
        ilen,
        oimport.len()
    );

    let dllstrings = if names.len() == 1 {
        names.ranges()[0].0
    } else {
        0
    };

    Ok(Some(ProcessedImports {
        linker,
        oimport,
        soimpdlls,
        dllstrings,
        import_by_ordinal,
        kernel32_ordinal,
    }))
}

/// Inputs to the unpack-side import rebuilder.
pub struct RebuildImports<'a> {
    /// The decompressed image, indexed by rva - rvamin.
    pub obuf: &'a mut [u8],
    pub rvamin: u32,
    /// The new import table read from the packed file, starting at the
    /// import directory.
    pub import_block: &'a [u8],
    /// RVA of the (restored) import directory in the output image.
    pub import_vaddr: u32,
    /// Offset of the preprocessed stream within `obuf`.
    pub cimports: u32,
    /// RVA of the rebuilt dll name region, 0 when names stay in place.
    pub dllstrings: u32,
    pub is64: bool,
    /// WinCE also mirrors the IAT rva into the lookup table field.
    pub set_oft: bool,
}

/// Replay the preprocessed stream, rebuilding descriptors, dll names and
/// IATs in the output image.
pub fn rebuild_imports(ctx: RebuildImports<'_>) -> Result<()> {
    let RebuildImports {
        obuf,
        rvamin,
        import_block,
        import_vaddr,
        cimports,
        dllstrings,
        is64,
        set_oft,
    } = ctx;

    let omask = ord_mask(is64);
    let bad = || Error::cant_unpack("corrupted imports");

    let stream_u32 = |obuf: &[u8], off: usize| -> Result<u32> {
        if off + 4 > obuf.len() {
            return Err(bad());
        }
        Ok(u32::from_le_bytes([
            obuf[off],
            obuf[off + 1],
            obuf[off + 2],
            obuf[off + 3],
        ]))
    };
    let block_zstr = |off: usize| -> Result<Vec<u8>> {
        if off >= import_block.len() {
            return Err(bad());
        }
        let end = import_block[off..].iter().position(|&b| b == 0).ok_or_else(bad)?;
        Ok(import_block[off..off + end].to_vec())
    };

    // size of the rebuilt dll name region
    let mut sdllnames = 0u32;
    let mut p = cimports as usize;
    while stream_u32(obuf, p)? != 0 {
        let dname = block_zstr(stream_u32(obuf, p)? as usize)?;
        sdllnames += dname.len() as u32 + 1;
        p += 8;
        loop {
            match obuf.get(p).copied().ok_or_else(bad)? {
                0 => break,
                TAG_NAME => {
                    let name = block_zstr_in_obuf(obuf, p + 1)?;
                    p += 1 + name + 1;
                }
                TAG_ORDINAL => p += 3,
                _ => p += 5,
            }
        }
        p += 1;
    }
    sdllnames = (sdllnames + 1) & !1;

    let mut desc_off = import_vaddr.wrapping_sub(rvamin) as usize;
    let mut dllnames = dllstrings.wrapping_sub(rvamin);
    let importednames_start = dllnames.wrapping_add(sdllnames);
    let mut importednames = importednames_start;

    let mut p = cimports as usize;
    while stream_u32(obuf, p)? != 0 {
        let dname = block_zstr(stream_u32(obuf, p)? as usize)?;
        let iatoffs = stream_u32(obuf, p + 4)?.wrapping_add(rvamin);
        p += 8;

        let mut desc = ImportDescriptor::parse(
            obuf.get(desc_off..desc_off + ImportDescriptor::SIZE)
                .ok_or_else(bad)?,
        );
        if dllstrings != 0 {
            // rebuild the dll name
            write_bytes(obuf, dllnames as usize, &dname)?;
            write_bytes(obuf, dllnames as usize + dname.len(), &[0])?;
            desc.dllname = dllnames + rvamin;
            dllnames += dname.len() as u32 + 1;
        } else {
            let at = desc.dllname.wrapping_sub(rvamin) as usize;
            write_bytes(obuf, at, &dname)?;
            write_bytes(obuf, at + dname.len(), &[0])?;
        }
        desc.iat = iatoffs;
        if set_oft {
            desc.oft = iatoffs;
        }
        desc.write(
            obuf.get_mut(desc_off..desc_off + ImportDescriptor::SIZE)
                .ok_or_else(bad)?,
        );

        let mut iat = iatoffs.wrapping_sub(rvamin) as usize;
        let thunk_size = if is64 { 8 } else { 4 };
        loop {
            let tag = obuf.get(p).copied().ok_or_else(bad)?;
            let value: u64;
            match tag {
                0 => break,
                TAG_NAME => {
                    let nlen = block_zstr_in_obuf(obuf, p + 1)?;
                    let name = obuf[p + 1..p + 1 + nlen].to_vec();
                    if dllstrings != 0 {
                        if (importednames - importednames_start) & 1 != 0 {
                            importednames -= 1; // keep the hint aligned
                        }
                        write_bytes(obuf, importednames as usize + 2, &name)?;
                        write_bytes(obuf, importednames as usize + 2 + nlen, &[0])?;
                        value = (importednames + rvamin) as u64;
                        importednames += 2 + nlen as u32 + 1;
                    } else {
                        // the original hint/name entry location survives in
                        // the thunk
                        let orig = read_thunk(obuf, iat, is64)?;
                        let at = (orig as u32).wrapping_sub(rvamin) as usize + 2;
                        write_bytes(obuf, at, &name)?;
                        write_bytes(obuf, at + nlen, &[0])?;
                        value = orig;
                    }
                    p += 1 + nlen + 1;
                }
                TAG_ORDINAL => {
                    let ord = u16::from_le_bytes([
                        *obuf.get(p + 1).ok_or_else(bad)?,
                        *obuf.get(p + 2).ok_or_else(bad)?,
                    ]);
                    value = ord as u64 | omask;
                    p += 3;
                }
                _ => {
                    // kernel32 ordinal: the thunk value lives in the new
                    // import table
                    let toff = stream_u32(obuf, p + 1)? as usize;
                    value = if is64 {
                        let raw = import_block.get(toff..toff + 8).ok_or_else(bad)?;
                        u64::from_le_bytes([
                            raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
                        ])
                    } else {
                        let raw = import_block.get(toff..toff + 4).ok_or_else(bad)?;
                        u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as u64
                    };
                    if value & omask == 0 {
                        return Err(bad());
                    }
                    p += 5;
                }
            }
            write_thunk(obuf, iat, value, is64)?;
            iat += thunk_size;
        }
        write_thunk(obuf, iat, 0, is64)?;
        p += 1;
        desc_off += ImportDescriptor::SIZE;
    }
    Ok(())
}

fn block_zstr_in_obuf(obuf: &[u8], off: usize) -> Result<usize> {
    obuf.get(off..)
        .and_then(|s| s.iter().position(|&b| b == 0))
        .ok_or_else(|| Error::cant_unpack("corrupted imports"))
}

fn write_bytes(obuf: &mut [u8], off: usize, data: &[u8]) -> Result<()> {
    obuf.get_mut(off..off + data.len())
        .ok_or_else(|| Error::cant_unpack("corrupted imports"))?
        .copy_from_slice(data);
    Ok(())
}

fn read_thunk(obuf: &[u8], off: usize, is64: bool) -> Result<u64> {
    let bad = || Error::cant_unpack("corrupted imports");
    if is64 {
        let raw = obuf.get(off..off + 8).ok_or_else(bad)?;
        Ok(u64::from_le_bytes([
            raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
        ]))
    } else {
        let raw = obuf.get(off..off + 4).ok_or_else(bad)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as u64)
    }
}

fn write_thunk(obuf: &mut [u8], off: usize, value: u64, is64: bool) -> Result<()> {
    let bad = || Error::cant_unpack("corrupted imports");
    if is64 {
        obuf.get_mut(off..off + 8)
            .ok_or_else(bad)?
            .copy_from_slice(&value.to_le_bytes());
    } else {
        obuf.get_mut(off..off + 4)
            .ok_or_else(bad)?
            .copy_from_slice(&(value as u32).to_le_bytes());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_descriptor_roundtrip() {
        let original = ImportDescriptor {
            oft: 0x1000,
            time_date_stamp: 0,
            forwarder_chain: 0xFFFF_FFFF,
            dllname: 0x2000,
            iat: 0x3000,
        };
        let mut buf = [0u8; ImportDescriptor::SIZE];
        original.write(&mut buf);
        assert_eq!(ImportDescriptor::parse(&buf), original);
    }

    // a tiny image with one dll importing one name and one ordinal
    fn build_image() -> (Vec<u8>, DataDirectory) {
        let mut image = vec![0u8; 0x3000];
        let dir = DataDirectory {
            vaddr: 0x1000,
            size: 40,
        };
        let desc = ImportDescriptor {
            oft: 0x1100,
            dllname: 0x1200,
            iat: 0x1300,
            ..Default::default()
        };
        desc.write(&mut image[0x1000..0x1014]);
        // lookup table: name import at 0x1400, ordinal 5, terminator
        image[0x1100..0x1104].copy_from_slice(&0x1400u32.to_le_bytes());
        image[0x1104..0x1108].copy_from_slice(&(5u32 | 0x8000_0000).to_le_bytes());
        // dll name
        image[0x1200..0x120A].copy_from_slice(b"user32.dll");
        // IAT mirrors the lookup table
        let iat_mirror = image[0x1100..0x1108].to_vec();
        image[0x1300..0x1308].copy_from_slice(&iat_mirror);
        // hint/name entry
        image[0x1400..0x1402].copy_from_slice(&0u16.to_le_bytes());
        image[0x1402..0x140D].copy_from_slice(b"MessageBoxA");
        (image, dir)
    }

    #[test]
    fn test_process_imports_stream() {
        let (mut image, dir) = build_image();
        let result = process_imports(ImportContext {
            image: &mut image,
            import_dir: dir,
            rvamin: 0x1000,
            is64: false,
            is_dll: false,
            is_efi: false,
            kernel_dll: "kernel32.dll",
        })
        .unwrap()
        .unwrap();

        assert!(result.import_by_ordinal);
        assert!(!result.kernel32_ordinal);
        assert!(result.soimpdlls > 0);
        // stream: dllname offset, iat - rvamin, name entry, ordinal entry
        let s = &result.oimport;
        let iat = u32::from_le_bytes([s[4], s[5], s[6], s[7]]);
        assert_eq!(iat, 0x300);
        assert_eq!(s[8], TAG_NAME);
        assert_eq!(&s[9..9 + 11], b"MessageBoxA");
        assert_eq!(s[9 + 12], TAG_ORDINAL);
        assert_eq!(u16::from_le_bytes([s[22], s[23]]), 5);
        assert_eq!(s[24], 0); // end of dll
        // terminating LE32 0
        assert_eq!(&s[25..29], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_process_imports_stub_procs_added() {
        let (mut image, dir) = build_image();
        let result = process_imports(ImportContext {
            image: &mut image,
            import_dir: dir,
            rvamin: 0x1000,
            is64: false,
            is_dll: false,
            is_efi: false,
            kernel_dll: "kernel32.dll",
        })
        .unwrap()
        .unwrap();
        let linker = &result.linker;
        assert!(linker.has_dll("kernel32.dll"));
        assert!(linker.thunk_offset("kernel32.dll", "LoadLibraryA").is_ok());
        assert!(linker.thunk_offset("kernel32.dll", "GetProcAddress").is_ok());
        assert!(linker.thunk_offset("kernel32.dll", "ExitProcess").is_ok());
        assert!(linker.thunk_offset("kernel32.dll", "VirtualProtect").is_ok());
        assert!(linker.has_dll("user32.dll"));
    }

    #[test]
    fn test_process_imports_efi_rejected() {
        let (mut image, dir) = build_image();
        let err = process_imports(ImportContext {
            image: &mut image,
            import_dir: dir,
            rvamin: 0x1000,
            is64: false,
            is_dll: false,
            is_efi: true,
            kernel_dll: "kernel32.dll",
        })
        .unwrap_err();
        assert!(err.to_string().contains("imports not supported on EFI"));
    }

    #[test]
    fn test_process_imports_zeroes_contiguous_regions() {
        let (mut image, dir) = build_image();
        process_imports(ImportContext {
            image: &mut image,
            import_dir: dir,
            rvamin: 0x1000,
            is64: false,
            is_dll: false,
            is_efi: false,
            kernel_dll: "kernel32.dll",
        })
        .unwrap()
        .unwrap();
        // names are scattered across 0x1200 and 0x1400, two intervals,
        // so descriptors survive as dllname stubs
        let desc = ImportDescriptor::parse(&image[0x1000..0x1014]);
        assert_eq!(desc.dllname, 0x1200);
        assert_eq!(desc.iat, 0);
    }
}
