//! Export directory processing.
//!
//! The export directory is copied out of the image field by field
//! (directory, module name, function pointers, name pointers and strings,
//! ordinals, forwarder strings) and rebuilt at a new RVA with every
//! internal pointer rebased. Forwarders - function RVAs pointing back into
//! the directory - are carried as strings and re-pointed at rebuild time.

use crate::interval::Interval;
use crate::{Error, Result};

/// IMAGE_EXPORT_DIRECTORY - 40 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExportDir {
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    /// RVA of the module name.
    pub name: u32,
    /// Ordinal base.
    pub base: u32,
    pub functions: u32,
    pub names: u32,
    /// RVA of the function pointer table.
    pub addrtable: u32,
    /// RVA of the name pointer table.
    pub nameptrtable: u32,
    /// RVA of the ordinal table.
    pub ordinaltable: u32,
}

impl ExportDir {
    pub const SIZE: usize = 40;

    pub fn parse(data: &[u8]) -> Self {
        let u32_at = |o: usize| u32::from_le_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]]);
        Self {
            characteristics: u32_at(0),
            time_date_stamp: u32_at(4),
            major_version: u16::from_le_bytes([data[8], data[9]]),
            minor_version: u16::from_le_bytes([data[10], data[11]]),
            name: u32_at(12),
            base: u32_at(16),
            functions: u32_at(20),
            names: u32_at(24),
            addrtable: u32_at(28),
            nameptrtable: u32_at(32),
            ordinaltable: u32_at(36),
        }
    }

    pub fn write(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.characteristics.to_le_bytes());
        buf[4..8].copy_from_slice(&self.time_date_stamp.to_le_bytes());
        buf[8..10].copy_from_slice(&self.major_version.to_le_bytes());
        buf[10..12].copy_from_slice(&self.minor_version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.name.to_le_bytes());
        buf[16..20].copy_from_slice(&self.base.to_le_bytes());
        buf[20..24].copy_from_slice(&self.functions.to_le_bytes());
        buf[24..28].copy_from_slice(&self.names.to_le_bytes());
        buf[28..32].copy_from_slice(&self.addrtable.to_le_bytes());
        buf[32..36].copy_from_slice(&self.nameptrtable.to_le_bytes());
        buf[36..40].copy_from_slice(&self.ordinaltable.to_le_bytes());
    }
}

/// The export directory lifted into owned storage.
#[derive(Debug)]
pub struct ExportProcessor {
    edir: ExportDir,
    ename: Vec<u8>,
    functionptrs: Vec<u8>,
    ordinals: Vec<u8>,
    names: Vec<Vec<u8>>,
    forwarders: Vec<Option<Vec<u8>>>,
    size: u32,
}

fn take<'a>(image: &'a [u8], bias: u32, rva: u32, len: usize) -> Result<&'a [u8]> {
    let off = rva.wrapping_sub(bias) as usize;
    image
        .get(off..off + len)
        .ok_or_else(|| Error::cant_pack(format!("bad export {rva:#x}")))
}

fn take_zstr<'a>(image: &'a [u8], bias: u32, rva: u32) -> Result<&'a [u8]> {
    let off = rva.wrapping_sub(bias) as usize;
    let tail = image
        .get(off..)
        .ok_or_else(|| Error::cant_pack(format!("bad export {rva:#x}")))?;
    let end = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::cant_pack(format!("bad export {rva:#x}")))?;
    Ok(&tail[..end])
}

impl ExportProcessor {
    /// Copy the export directory at `eoffs` out of the image, recording
    /// every covered byte range; the covered region is zeroed when it
    /// turns out to be contiguous. `bias` is subtracted from RVAs to index
    /// into `image`.
    pub fn convert(image: &mut [u8], bias: u32, eoffs: u32, esize: u32) -> Result<Self> {
        let edir = ExportDir::parse(take(image, bias, eoffs, ExportDir::SIZE)?);
        let mut iv = Interval::new();
        let mut size = ExportDir::SIZE as u32;
        iv.add(eoffs.wrapping_sub(bias), size);

        if edir.name == 0 || eoffs + esize <= edir.name {
            return Err(Error::internal(format!(
                "bad export directory name RVA {:#x}",
                edir.name
            )));
        }
        let ename = take_zstr(image, bias, edir.name)?.to_vec();
        size += ename.len() as u32 + 1;
        iv.add(edir.name.wrapping_sub(bias), ename.len() as u32 + 1);

        let fplen = 4 * edir.functions;
        let functionptrs = take(image, bias, edir.addrtable, fplen as usize)?.to_vec();
        size += fplen;
        iv.add(edir.addrtable.wrapping_sub(bias), fplen);

        let mut names = Vec::with_capacity(edir.names as usize);
        for ic in 0..edir.names {
            let ptr = take(image, bias, edir.nameptrtable + ic * 4, 4)?;
            let nrva = u32::from_le_bytes([ptr[0], ptr[1], ptr[2], ptr[3]]);
            let n = take_zstr(image, bias, nrva)?.to_vec();
            size += n.len() as u32 + 1;
            iv.add(nrva.wrapping_sub(bias), n.len() as u32 + 1);
            names.push(n);
        }
        iv.add(edir.nameptrtable.wrapping_sub(bias), 4 * edir.names);
        size += 4 * edir.names;

        // export forwarders live inside the directory area
        let mut forwarders = Vec::with_capacity(edir.functions as usize);
        for ic in 0..edir.functions {
            let off = 4 * ic as usize;
            let fp = u32::from_le_bytes([
                functionptrs[off],
                functionptrs[off + 1],
                functionptrs[off + 2],
                functionptrs[off + 3],
            ]);
            if fp >= eoffs && fp < eoffs + esize {
                let forw = take_zstr(image, bias, fp)?.to_vec();
                size += forw.len() as u32 + 1;
                iv.add(fp.wrapping_sub(bias), forw.len() as u32 + 1);
                forwarders.push(Some(forw));
            } else {
                forwarders.push(None);
            }
        }

        let olen = 2 * edir.names;
        let ordinals = take(image, bias, edir.ordinaltable, olen as usize)?.to_vec();
        size += olen;
        iv.add(edir.ordinaltable.wrapping_sub(bias), olen);

        iv.flatten();
        if iv.len() == 1 {
            iv.clear(image);
        }

        Ok(Self {
            edir,
            ename,
            functionptrs,
            ordinals,
            names,
            forwarders,
            size,
        })
    }

    /// Total size of the rebuilt directory.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Re-emit the directory for placement at `newoffs`.
    pub fn build(&self, newoffs: u32) -> Vec<u8> {
        let mut edir = self.edir;
        let mut out = vec![0u8; self.size as usize];

        let functionp = ExportDir::SIZE;
        let namep = functionp + 4 * edir.functions as usize;
        let ordinalp = namep + 4 * edir.names as usize;
        let enamep = ordinalp + 2 * edir.names as usize;
        let mut exports = enamep + self.ename.len() + 1;

        edir.addrtable = newoffs + functionp as u32;
        edir.ordinaltable = newoffs + ordinalp as u32;
        out[ordinalp..ordinalp + self.ordinals.len()].copy_from_slice(&self.ordinals);

        edir.name = newoffs + enamep as u32;
        out[enamep..enamep + self.ename.len()].copy_from_slice(&self.ename);
        edir.nameptrtable = newoffs + namep as u32;
        for (ic, n) in self.names.iter().enumerate() {
            out[exports..exports + n.len()].copy_from_slice(n);
            out[namep + 4 * ic..namep + 4 * ic + 4]
                .copy_from_slice(&(newoffs + exports as u32).to_le_bytes());
            exports += n.len() + 1;
        }

        out[functionp..functionp + self.functionptrs.len()].copy_from_slice(&self.functionptrs);
        for (ic, forw) in self.forwarders.iter().enumerate() {
            if let Some(f) = forw {
                out[exports..exports + f.len()].copy_from_slice(f);
                out[functionp + 4 * ic..functionp + 4 * ic + 4]
                    .copy_from_slice(&(newoffs + exports as u32).to_le_bytes());
                exports += f.len() + 1;
            }
        }

        edir.write(&mut out[..ExportDir::SIZE]);
        debug_assert_eq!(exports, self.size as usize);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // lay out a small export directory at 0x1000 with one named export
    // and one forwarder
    fn build_image() -> Vec<u8> {
        let mut image = vec![0u8; 0x2000];
        let edir = ExportDir {
            name: 0x1100,
            base: 1,
            functions: 2,
            names: 1,
            addrtable: 0x1040,
            nameptrtable: 0x1050,
            ordinaltable: 0x1060,
            ..Default::default()
        };
        edir.write(&mut image[0x1000..0x1028]);
        image[0x1100..0x1108].copy_from_slice(b"mod.dll\0");
        // function 0: code rva, function 1: forwarder string inside dir
        image[0x1040..0x1044].copy_from_slice(&0x4000u32.to_le_bytes());
        image[0x1044..0x1048].copy_from_slice(&0x1200u32.to_le_bytes());
        image[0x1200..0x1214].copy_from_slice(b"other.dll.SomeFunc\0\0");
        // one name
        image[0x1050..0x1054].copy_from_slice(&0x1110u32.to_le_bytes());
        image[0x1110..0x1117].copy_from_slice(b"MyFunc\0");
        image[0x1060..0x1062].copy_from_slice(&0u16.to_le_bytes());
        image
    }

    #[test]
    fn test_convert_and_build() {
        let mut image = build_image();
        let xport = ExportProcessor::convert(&mut image, 0, 0x1000, 0x300).unwrap();

        let newoffs = 0x5000;
        let out = xport.build(newoffs);
        assert_eq!(out.len(), xport.size() as usize);

        let rebuilt = ExportDir::parse(&out);
        assert_eq!(rebuilt.functions, 2);
        assert_eq!(rebuilt.names, 1);
        assert!(rebuilt.name >= newoffs);
        // the module name is where the directory says it is
        let name_off = (rebuilt.name - newoffs) as usize;
        assert_eq!(&out[name_off..name_off + 7], b"mod.dll");
        // function 0 unchanged, function 1 re-pointed at the forwarder copy
        let fp0 = u32::from_le_bytes([out[40], out[41], out[42], out[43]]);
        let fp1 = u32::from_le_bytes([out[44], out[45], out[46], out[47]]);
        assert_eq!(fp0, 0x4000);
        let forw_off = (fp1 - newoffs) as usize;
        assert_eq!(&out[forw_off..forw_off + 18], b"other.dll.SomeFunc");
    }

    #[test]
    fn test_convert_rejects_bad_name_rva() {
        let mut image = build_image();
        // name RVA outside the directory
        image[0x100C..0x1010].copy_from_slice(&0x1FFFu32.to_le_bytes());
        let err = ExportProcessor::convert(&mut image, 0, 0x1000, 0x300).unwrap_err();
        assert!(err.to_string().contains("bad export directory name RVA"));
    }

    #[test]
    fn test_roundtrip_preserves_via_second_convert() {
        let mut image = build_image();
        let xport = ExportProcessor::convert(&mut image, 0, 0x1000, 0x300).unwrap();
        let out = xport.build(0x1000);

        // feeding the rebuilt directory back through convert yields the
        // same strings and tables
        let mut image2 = vec![0u8; 0x2000];
        image2[0x1000..0x1000 + out.len()].copy_from_slice(&out);
        let xport2 =
            ExportProcessor::convert(&mut image2, 0, 0x1000, out.len() as u32).unwrap();
        assert_eq!(xport2.ename, xport.ename);
        assert_eq!(xport2.names, xport.names);
        assert_eq!(xport2.ordinals, xport.ordinals);
        assert_eq!(xport2.size(), xport.size());
    }
}
