//! Load configuration directory processing.
//!
//! The table carries security-cookie and Control Flow Guard metadata the
//! loader reads before the stub runs, so it is preserved byte for byte.
//! Relocations targeting the table are collected in pass 1 and re-emitted
//! against the table's new address in pass 2.

use crate::data_dir::DataDirectory;
use crate::reloc::{RelocBuilder, RelocReader};
use crate::{Error, Result};
use log::info;

/// Tables larger than this trigger an informational message. The
/// threshold is arbitrary but kept for compatibility.
const MAX_SOLOADCONF: u32 = 256;

/// The load config table and the relocations into it.
#[derive(Debug)]
pub struct LoadConfProcessor {
    data: Vec<u8>,
    /// (offset within table, relocation type)
    relocs: Vec<(u32, u32)>,
}

impl LoadConfProcessor {
    /// Pass 1: copy the table verbatim. Returns `None` when the directory
    /// is absent or reports size zero.
    pub fn process(
        image: &[u8],
        dir: DataDirectory,
        relocs: &RelocReader,
    ) -> Result<Option<Self>> {
        if dir.size == 0 {
            return Ok(None);
        }
        let lcaddr = dir.vaddr;
        let head = image
            .get(lcaddr as usize..lcaddr as usize + 4)
            .ok_or_else(|| Error::cant_pack(format!("bad loadconf {lcaddr:#x}")))?;
        // the first dword of the table is its own size
        let soloadconf = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
        if soloadconf == 0 {
            return Ok(None);
        }
        if soloadconf > MAX_SOLOADCONF {
            info!("Load Configuration directory {soloadconf} > {MAX_SOLOADCONF}");
        }

        let mut saved = Vec::new();
        for &(pos, rtype) in relocs.entries() {
            if pos >= lcaddr && pos < lcaddr + soloadconf {
                saved.push((pos - lcaddr, rtype as u32));
            }
        }

        let data = image
            .get(lcaddr as usize..(lcaddr + soloadconf) as usize)
            .ok_or_else(|| Error::cant_pack(format!("bad loadconf {lcaddr:#x}")))?
            .to_vec();

        Ok(Some(Self {
            data,
            relocs: saved,
        }))
    }

    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of relocations collected in pass 1.
    pub fn reloc_count(&self) -> usize {
        self.relocs.len()
    }

    /// Pass 2: re-emit the collected relocations at the table's new
    /// address.
    pub fn finalize(&self, rel: &mut RelocBuilder, newaddr: u32) -> Result<()> {
        for &(off, rtype) in &self.relocs {
            rel.add(off + newaddr, rtype)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reloc_table(entries: &[(u32, u16)]) -> Vec<u8> {
        // single page block at 0x1000
        let mut out = Vec::new();
        out.extend_from_slice(&0x1000u32.to_le_bytes());
        out.extend_from_slice(&((8 + 2 * entries.len()) as u32).to_le_bytes());
        for &(off, rtype) in entries {
            out.extend_from_slice(&((rtype << 12) | (off as u16 & 0xFFF)).to_le_bytes());
        }
        out
    }

    #[test]
    fn test_absent_directory() {
        let image = vec![0u8; 0x100];
        let none = LoadConfProcessor::process(
            &image,
            DataDirectory::default(),
            &RelocReader::default(),
        )
        .unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn test_copies_table_and_relocs() {
        let mut image = vec![0u8; 0x2000];
        // 64-byte table at 0x1040
        image[0x1040..0x1044].copy_from_slice(&64u32.to_le_bytes());
        image[0x1050] = 0xAB;
        let rr = RelocReader::parse(&reloc_table(&[(0x48, 3), (0x200, 3)]), false).unwrap();

        let lc = LoadConfProcessor::process(
            &image,
            DataDirectory {
                vaddr: 0x1040,
                size: 64,
            },
            &rr,
        )
        .unwrap()
        .unwrap();
        assert_eq!(lc.size(), 64);
        assert_eq!(lc.data()[0x10], 0xAB);
        // only the reloc inside the table was kept, rebased to the table
        assert_eq!(lc.relocs, vec![(8, 3)]);

        let mut rel = RelocBuilder::new(8);
        lc.finalize(&mut rel, 0x5000).unwrap();
        let out = rel.finish(false).unwrap();
        let rr2 = RelocReader::parse(&out, false).unwrap();
        assert_eq!(rr2.entries(), &[(0x5008, 3)]);
    }
}
