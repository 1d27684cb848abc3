//! Pack and unpack orchestration.
//!
//! [`PePacker`] owns one transformation at a time: the parsed header, the
//! section table, the virtual image the sections are loaded into, and the
//! side buffers the processors hand back. `pack` reads a PE from an
//! [`InputSource`], runs the processors, compresses the image and lays out
//! the new file; `unpack` inverts all of it, driven by the extra-info
//! trailer appended to the compressed stream.

use crate::codec::{Compressor, LoaderStub, RelocCodec};
use crate::data_dir::{index as dd, DataDirectory};
use crate::export::ExportProcessor;
use crate::headers::{
    check_machine, coff_flags, dll_flags, find_pe_offset, Format, PackHeader, PeHeader,
    GUARD_SECURITY_COOKIE_UNUSED, PACK_VERSION,
};
use crate::import::{process_imports, rebuild_imports, ImportContext, RebuildImports};
use crate::layout::{align_gap, align_up, is_power_of_two};
use crate::loadconfig::LoadConfProcessor;
use crate::options::{rt, PackOptions, Tristate};
use crate::reloc::{RelocBuilder, RelocReader};
use crate::resource::{match_keep, ResourceTree};
use crate::section::{characteristics as sc, section_index_of, SectionHeader};
use crate::stream::{InputSource, OutputSink};
use crate::tls::TlsProcessor;
use crate::{Error, Result};
use log::{info, warn};

/// Decompression-in-place headroom between the packed stream and the end
/// of the unpacked image.
const OVERLAP_OVERHEAD: u32 = 4096;

const DEBUG_DIR_ENTRY_SIZE: u32 = 28;

/// Filter id meaning "no filter".
const FILTER_NONE: u8 = 0;

/// The PE packer/unpacker front end. Options and collaborators are fixed
/// at construction; each `pack`/`unpack` call handles one file.
pub struct PePacker<'a> {
    opts: PackOptions,
    compressor: &'a dyn Compressor,
    reloc_codec: &'a dyn RelocCodec,
    stub: &'a dyn LoaderStub,
}

// per-file state shared by the pack helpers
struct PackState {
    ih: PeHeader,
    isection: Vec<SectionHeader>,
    rvamin: u32,
    ibuf: Vec<u8>,
    strip_relocs: bool,
    big_relocs: u8,
}

fn le16(buf: &[u8], off: usize) -> Result<u16> {
    buf.get(off..off + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| Error::cant_pack(format!("bad resoff {off:#x}")))
}

fn le32(buf: &[u8], off: usize) -> Result<u32> {
    buf.get(off..off + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| Error::cant_unpack("corrupted PE header"))
}

impl<'a> PePacker<'a> {
    pub fn new(
        opts: PackOptions,
        compressor: &'a dyn Compressor,
        reloc_codec: &'a dyn RelocCodec,
        stub: &'a dyn LoaderStub,
    ) -> Self {
        Self {
            opts,
            compressor,
            reloc_codec,
            stub,
        }
    }

    fn read_headers<S: InputSource + ?Sized>(&self, src: &S) -> Result<(u32, PeHeader, Format)> {
        let pe_offset = find_pe_offset(src)?
            .ok_or_else(|| Error::cant_pack("not a PE file (no PE header found)"))?;
        let avail = src.size().saturating_sub(pe_offset as u64) as usize;
        if avail < PeHeader::SIZE32 {
            return Err(Error::cant_pack("truncated PE header"));
        }
        let raw = src.read_block(pe_offset as u64, avail.min(PeHeader::SIZE64))?;
        let ih = PeHeader::parse(&raw)?;
        let format = check_machine(ih.cpu)?;
        if ih.is64 != format.is_64bit() {
            return Err(Error::cant_pack(
                "optional header magic does not match machine",
            ));
        }
        Ok((pe_offset, ih, format))
    }

    fn read_section_headers<S: InputSource + ?Sized>(
        &self,
        src: &S,
        pe_offset: u32,
        ih: &PeHeader,
    ) -> Result<Vec<SectionHeader>> {
        let objs = ih.objects as usize;
        if objs == 0 {
            return Err(Error::cant_pack("No section was found"));
        }
        let table_off = pe_offset as u64 + ih.size() as u64;
        if src.size() < table_off + (objs * SectionHeader::SIZE) as u64 {
            return Err(Error::cant_pack(format!("too many sections {objs}")));
        }
        let raw = src.read_block(table_off, objs * SectionHeader::SIZE)?;
        let isection = SectionHeader::parse_table(&raw, objs)?;

        // expect: first section has the lowest rva, last one ends highest
        let rvamin = isection[0].virtual_address;
        let last = &isection[objs - 1];
        let rvalast = last.virtual_size + last.virtual_address;
        for (j, s) in isection.iter().enumerate() {
            let lo = s.virtual_address;
            let hi = s.virtual_size.wrapping_add(lo);
            if hi < lo {
                return Err(Error::cant_pack(format!(
                    "bad section[{j}] wrap-around {lo:#x} {:#x}",
                    s.virtual_size
                )));
            }
            if lo < rvamin {
                return Err(Error::cant_pack(format!(
                    "bad section .rva [{j}] {lo:#x} < [0] {rvamin:#x}"
                )));
            }
            if rvalast < hi {
                return Err(Error::cant_pack(format!(
                    "bad section .rva+.vsize [{j}] {hi:#x} > [{}] {rvalast:#x}",
                    objs - 1
                )));
            }
        }
        Ok(isection)
    }

    fn check_header_values(
        &self,
        ih: &PeHeader,
        format: Format,
        isection: &[SectionHeader],
    ) -> Result<()> {
        let subsystem = ih.subsystem as u32;
        if subsystem >= 32 || (1u32 << subsystem) & format.subsystem_mask() == 0 {
            return Err(Error::cant_pack(format!(
                "PE: subsystem {subsystem} is not supported"
            )));
        }
        if !ih.ddirs[dd::COM_DESCRIPTOR].is_empty() {
            return Err(Error::cant_pack(".NET files are not yet supported"));
        }
        if isection[0].name.starts_with(b"UPX") {
            return Err(Error::AlreadyPacked);
        }
        if !self.opts.force && !ih.ddirs[dd::RESERVED].is_empty() {
            return Err(Error::cant_pack(
                "file is possibly packed/protected (try --force)",
            ));
        }
        if ih.entry != 0 && ih.entry < isection[0].virtual_address {
            return Err(Error::cant_pack("run a virus scanner on this file!"));
        }
        if !is_power_of_two(ih.filealign) {
            return Err(Error::cant_pack(format!(
                "bad file alignment {:#x}",
                ih.filealign
            )));
        }
        Ok(())
    }

    // resolve the strip-relocs tristate; returns (strip, flag to set)
    fn handle_strip_relocs(&self, ih: &mut PeHeader, format: Format) -> Result<(bool, u16)> {
        let isdll = ih.is_dll();
        let isefi = ih.is_efi();
        let aslr = ih.dllflags & dll_flags::DYNAMIC_BASE != 0;
        let strip = match self.opts.strip_relocs {
            Tristate::Default => {
                !isdll && !isefi && !aslr && ih.imagebase >= format.default_imagebase()
            }
            Tristate::No => false,
            Tristate::Yes => true,
        };
        if !strip {
            info!("Base relocations stripping is disabled for this image");
            return Ok((false, 0));
        }
        if isdll || isefi {
            return Err(Error::cant_pack(
                "--strip-relocs is not allowed with DLL and EFI images",
            ));
        }
        if aslr {
            if !self.opts.force {
                return Err(Error::cant_pack(
                    "--strip-relocs is not allowed with ASLR (use with --force to remove)",
                ));
            }
            ih.dllflags ^= dll_flags::DYNAMIC_BASE;
            ih.dllflags &= !dll_flags::HIGH_ENTROPY_VA;
        }
        if !self.opts.force && ih.imagebase < format.default_imagebase() {
            return Err(Error::cant_pack(
                "--strip-relocs may not support this imagebase (try with --force)",
            ));
        }
        Ok((true, coff_flags::RELOCS_STRIPPED))
    }

    // load the sections into a virtual image; returns the overlay start
    fn read_sections<S: InputSource + ?Sized>(&self, src: &S, st: &mut PackState) -> Result<u32> {
        let ih = &st.ih;
        let xtrasize = ih.datasize.max(65536)
            + ih.ddirs[dd::IMPORT].size
            + ih.ddirs[dd::BOUND_IMPORT].size
            + ih.ddirs[dd::IAT].size
            + ih.ddirs[dd::DELAY_IMPORT].size
            + ih.ddirs[dd::BASERELOC].size;
        let image_size = ih.imagesize;
        st.ibuf = vec![0u8; image_size as usize + xtrasize as usize];

        let headers_len = (st.isection[0].pointer_to_raw_data as u64).min(src.size()) as usize;
        let headers_len = headers_len.min(st.ibuf.len());
        src.readx_at(0, &mut st.ibuf[..headers_len])?;

        let filealign = st.ih.filealign;
        let mut overlaystart = 0u32;
        let mut prev_end = 0u32;
        for ic in 0..st.isection.len() {
            let s = st.isection[ic].clone();
            if s.pointer_to_raw_data != 0
                && overlaystart < s.pointer_to_raw_data + s.size_of_raw_data
            {
                overlaystart = align_up(s.pointer_to_raw_data + s.size_of_raw_data, filealign);
            }
            if s.virtual_size == 0 {
                st.isection[ic].virtual_size = s.size_of_raw_data;
            }
            if s.characteristics & sc::UNINITIALIZED_DATA != 0
                || s.pointer_to_raw_data == 0
                || s.characteristics & sc::LINK_INFO != 0
            {
                continue;
            }
            if s.virtual_address + s.size_of_raw_data > image_size {
                return Err(Error::cant_pack("section size problem"));
            }
            if s.characteristics & (sc::WRITE | sc::SHARED) == (sc::WRITE | sc::SHARED)
                && !self.opts.force
            {
                return Err(Error::cant_pack(
                    "writable shared sections not supported (try --force)",
                ));
            }
            if prev_end != 0
                && s.pointer_to_raw_data.wrapping_sub(prev_end) > filealign
                && !self.opts.force
            {
                return Err(Error::cant_pack(
                    "superfluous data between sections (try --force)",
                ));
            }
            let take = s.size_of_raw_data.min(st.isection[ic].virtual_size);
            let dst = s.virtual_address as usize;
            if dst + take as usize > st.ibuf.len() {
                return Err(Error::internal("buffer too small 1"));
            }
            src.readx_at(
                s.pointer_to_raw_data as u64,
                &mut st.ibuf[dst..dst + take as usize],
            )?;
            prev_end = s.pointer_to_raw_data + take;
        }
        Ok(overlaystart)
    }

    // debug data glued to the overlay start belongs to the image
    fn strip_debug(&self, st: &mut PackState, mut overlaystart: u32) -> u32 {
        let dir = st.ih.ddirs[dd::DEBUG];
        if dir.vaddr == 0 {
            return overlaystart;
        }
        for ic in 0..dir.size / DEBUG_DIR_ENTRY_SIZE {
            let off = (dir.vaddr + ic * DEBUG_DIR_ENTRY_SIZE) as usize;
            if off + DEBUG_DIR_ENTRY_SIZE as usize > st.ibuf.len() {
                break;
            }
            let size = u32::from_le_bytes([
                st.ibuf[off + 16],
                st.ibuf[off + 17],
                st.ibuf[off + 18],
                st.ibuf[off + 19],
            ]);
            let fpos = u32::from_le_bytes([
                st.ibuf[off + 24],
                st.ibuf[off + 25],
                st.ibuf[off + 26],
                st.ibuf[off + 27],
            ]);
            if overlaystart == fpos {
                overlaystart += size;
            }
        }
        let lo = (dir.vaddr as usize).min(st.ibuf.len());
        let hi = ((dir.vaddr + dir.size) as usize).min(st.ibuf.len());
        st.ibuf[lo..hi].fill(0);
        overlaystart
    }

    fn try_remove_last_section(st: &mut PackState, vaddr: u32) {
        let objs = st.ih.objects as usize;
        let ic = section_index_of(&st.isection, vaddr);
        if ic != 0 && ic == objs - 1 {
            info!(
                "removed section: {} size: {:#x}",
                ic, st.isection[ic].size_of_raw_data
            );
            st.ih.objects -= 1;
            st.isection.truncate(objs - 1);
        }
    }

    // pass 1 relocation preprocessing; returns the preprocessed stream
    fn process_relocs(&self, st: &mut PackState) -> Result<Vec<u8>> {
        st.big_relocs = 0;
        let dir = st.ih.ddirs[dd::BASERELOC];
        let is64 = st.ih.is64;
        let region = st
            .ibuf
            .get(dir.vaddr as usize..(dir.vaddr as usize + dir.size as usize))
            .ok_or_else(|| Error::cant_pack(format!("bad reloc {:#x}", dir.vaddr)))?;
        let rel = RelocReader::parse(region, self.opts.force)?;
        let relocnum = rel.total();

        if st.strip_relocs || relocnum == 0 {
            if dir.size != 0 {
                st.ibuf[dir.vaddr as usize..(dir.vaddr + dir.size) as usize].fill(0);
                Self::try_remove_last_section(st, dir.vaddr);
            }
            return Ok(Vec::new());
        }

        let counts = rel.counts();
        let ptr_type = if is64 { 10usize } else { 3 };
        for (ic, &count) in counts.iter().enumerate() {
            let supported = if is64 { ic == 10 } else { ic < 4 };
            if !supported && count != 0 {
                warn!("skipping unsupported relocation type {ic} ({count})");
            }
        }

        let rvamin = st.rvamin;
        let mut fix: [Vec<u32>; 16] = Default::default();
        for &(pos, rtype) in rel.entries() {
            if pos >= st.ih.imagesize {
                continue; // skip out-of-bounds record
            }
            if is64 || (rtype as usize) < 4 {
                fix[rtype as usize].push(pos.wrapping_sub(rvamin));
            }
        }
        for f in fix.iter_mut() {
            f.sort_unstable();
            f.dedup();
        }

        // make the wide targets imagebase-relative so the stream compresses
        let bias = st.ih.imagebase.wrapping_add(rvamin as u64);
        for &pos in &fix[ptr_type] {
            let at = pos.wrapping_add(rvamin) as usize;
            if is64 {
                let raw = st
                    .ibuf
                    .get(at..at + 8)
                    .ok_or_else(|| Error::cant_pack(format!("bad reloc 10 {at:#x}")))?;
                let w = u64::from_le_bytes([
                    raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
                ]);
                st.ibuf[at..at + 8].copy_from_slice(&w.wrapping_sub(bias).to_le_bytes());
            } else {
                let raw = st
                    .ibuf
                    .get(at..at + 4)
                    .ok_or_else(|| Error::cant_pack(format!("bad reloc type 3 {at:#x}")))?;
                let w = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                st.ibuf[at..at + 4].copy_from_slice(&w.wrapping_sub(bias as u32).to_le_bytes());
            }
        }

        st.ibuf[dir.vaddr as usize..(dir.vaddr + dir.size) as usize].fill(0);

        let mut big = st.big_relocs as u32;
        let mut orelocs = self.reloc_codec.optimize_reloc(
            &fix[ptr_type],
            &mut st.ibuf[rvamin as usize..],
            if is64 { 64 } else { 32 },
            &mut big,
        );
        st.big_relocs = big as u8;

        if !is64 {
            // hostile headers can make the appended arrays overflow the
            // buffer the unpacker sizes from relocnum
            let tail = 4 * (2 + fix[2].len() + fix[1].len());
            if (4 * relocnum as usize + 8192) < orelocs.len() + tail {
                return Err(Error::cant_unpack("Invalid relocs"));
            }
            // append relocs type "LOW" then "HIGH"
            for ic in [2usize, 1] {
                for &pos in &fix[ic] {
                    orelocs.extend_from_slice(&pos.to_le_bytes());
                }
                if !fix[ic].is_empty() {
                    orelocs.extend_from_slice(&0u32.to_le_bytes());
                    st.big_relocs |= 2 * ic as u8;
                }
            }
        }
        info!(
            "Relocations: original size: {} bytes, preprocessed size: {} bytes",
            dir.size,
            orelocs.len()
        );
        Ok(orelocs)
    }

    // pass 1 resource processing: classify leaves, copy kept blobs into
    // the side buffer, zero what the unpacker can restore
    fn process_resources(
        &self,
        st: &mut PackState,
    ) -> Result<(Option<ResourceTree>, Vec<u8>, u16)> {
        let dir = st.ih.ddirs[dd::RESOURCE];
        if dir.size == 0 {
            return Ok((None, Vec::new(), 0));
        }
        let isefi = st.ih.is_efi();
        let compress_resources = self.opts.compress_resources.resolve(!isefi);
        let compress_icons = if compress_resources {
            self.opts.compress_icons
        } else {
            0
        };
        let mut compress_rt = [false; rt::RT_LAST];
        for (ic, flag) in self.opts.compress_rt.iter().enumerate() {
            compress_rt[ic] = compress_resources && flag.resolve(true);
        }
        // by default, don't compress RT_STRINGs of screensavers (".scr")
        if self.opts.compress_rt[rt::RT_STRING as usize].is_default()
            && self.opts.input_has_ext("scr")
        {
            compress_rt[rt::RT_STRING as usize] = false;
        }

        let region = st
            .ibuf
            .get(dir.vaddr as usize..)
            .ok_or_else(|| Error::cant_pack(format!("bad res {:#x}", dir.vaddr)))?;
        let mut res = ResourceTree::parse(region)?;

        // icon ids referenced by the first icon group
        let mut keep_icons = String::new();
        if compress_icons == 2 {
            for lc in 0..res.leaf_count() {
                if res.itype(lc) == rt::RT_GROUP_ICON {
                    let offs = res.offs(lc) as usize;
                    let count = le16(&st.ibuf, offs + 4)?;
                    for ic in 0..count as usize {
                        let id = le16(&st.ibuf, offs + 6 + ic * 14 + 12)?;
                        if !keep_icons.is_empty() {
                            keep_icons.push(',');
                        }
                        keep_icons.push_str(&format!("3/{id}"));
                    }
                    break;
                }
            }
        }

        // the icon id which stays uncompressed when compress_icons == 1
        let mut first_icon_id: Option<u16> = None;
        if compress_icons == 1 {
            for lc in 0..res.leaf_count() {
                if res.itype(lc) == rt::RT_GROUP_ICON {
                    first_icon_id = Some(le16(&st.ibuf, res.offs(lc) as usize + 6 + 12)?);
                    break;
                }
            }
        }

        let mut compress_icon = compress_icons > 1;
        let mut compress_idir = compress_icons == 3;
        let mut icondir_count = 0u16;

        let mut oresources = vec![0u8; res.dirsize() as usize];
        let (mut usize_, mut csize, mut unum, mut cnum) = (0u32, 0u32, 0u32, 0u32);

        for lc in 0..res.leaf_count() {
            let rtype = res.itype(lc);
            let mut do_compress = compress_resources;
            if rtype == rt::RT_ICON {
                if compress_icons == 0 {
                    do_compress = false;
                } else if compress_icons == 1
                    && first_icon_id.is_none_or(|id| id as u32 == res.iname(lc))
                {
                    do_compress = compress_icon;
                }
            } else if rtype == rt::RT_GROUP_ICON {
                do_compress = compress_idir && compress_icons != 0;
            } else if rtype > 0 && (rtype as usize) < rt::RT_LAST {
                do_compress = compress_rt[rtype as usize];
            }

            if do_compress && !keep_icons.is_empty() {
                do_compress &= !match_keep(
                    rtype,
                    res.ntype(lc),
                    res.iname(lc),
                    res.nname(lc),
                    &keep_icons,
                );
            }
            if do_compress {
                do_compress &= !match_keep(
                    rtype,
                    res.ntype(lc),
                    res.iname(lc),
                    res.nname(lc),
                    "TYPELIB,REGISTRY,16",
                );
            }
            if do_compress && !self.opts.keep_resource.is_empty() {
                do_compress &= !match_keep(
                    rtype,
                    res.ntype(lc),
                    res.iname(lc),
                    res.nname(lc),
                    &self.opts.keep_resource,
                );
            }

            if do_compress {
                csize += res.size(lc);
                cnum += 1;
                continue;
            }

            usize_ += res.size(lc);
            unum += 1;

            // save the original offset, then the blob
            let offs = res.offs(lc);
            let take = res.size(lc) as usize;
            let blob = st
                .ibuf
                .get(offs as usize..offs as usize + take)
                .ok_or_else(|| Error::cant_pack(format!("bad resoff {offs:#x}")))?
                .to_vec();
            oresources.extend_from_slice(&offs.to_le_bytes());
            let newoffs = oresources.len() as u32;
            oresources.extend_from_slice(&blob);
            st.ibuf[offs as usize..offs as usize + take].fill(0);
            res.set_newoffs(lc, newoffs);

            if rtype == rt::RT_ICON && compress_icons == 1 {
                compress_icon = true;
            } else if rtype == rt::RT_GROUP_ICON {
                if compress_icons == 1 {
                    let icondir_offset = newoffs as usize + 4;
                    icondir_count = le16(&oresources, icondir_offset)?;
                    oresources[icondir_offset..icondir_offset + 2]
                        .copy_from_slice(&1u16.to_le_bytes());
                }
                compress_idir = true;
            }
        }

        if !res.clear_original(&mut st.ibuf[dir.vaddr as usize..]) {
            // the directory area is not one contiguous run; leaving it in
            // place costs ratio but keeps the unpacker working
            warn!("can't remove unneeded resource directory");
        }
        info!(
            "Resources: compressed {cnum} ({csize} bytes), not compressed {unum} ({usize_} bytes)"
        );
        Ok((Some(res), oresources, icondir_count))
    }

    /// Pack `src` into `sink`.
    pub fn pack<S, O>(&self, src: &S, sink: &mut O) -> Result<()>
    where
        S: InputSource + ?Sized,
        O: OutputSink + ?Sized,
    {
        let (pe_offset, mut ih, format) = self.read_headers(src)?;
        let is64 = ih.is64;
        let isefi = ih.is_efi();
        let isdll = ih.is_dll();
        let last_section_rsrc_only = format.last_section_rsrc_only();

        let isection = self.read_section_headers(src, pe_offset, &ih)?;
        let rvamin = isection[0].virtual_address;

        if ih.dllflags & dll_flags::FORCE_INTEGRITY != 0 {
            if self.opts.force {
                ih.dllflags &= !dll_flags::FORCE_INTEGRITY;
            } else {
                return Err(Error::cant_pack(
                    "image forces integrity check (use --force to remove)",
                ));
            }
        }
        self.check_header_values(&ih, format, &isection)?;

        // remove certificate directory entry
        ih.ddirs[dd::SECURITY].clear();

        let strip_relocs = if ih.flags & coff_flags::RELOCS_STRIPPED != 0 {
            true
        } else {
            let (strip, flag) = self.handle_strip_relocs(&mut ih, format)?;
            ih.flags |= flag;
            strip
        };

        // the output keeps the original DOS stub; EFI gets a minimal one
        let out_pe_offset;
        if isefi {
            let mut stub = [0u8; 0x40];
            stub[0..2].copy_from_slice(b"MZ");
            stub[0x3C..0x40].copy_from_slice(&0x40u32.to_le_bytes());
            sink.write(&stub)?;
            out_pe_offset = 0x40u32;
        } else {
            let dos = src.read_block(0, pe_offset as usize)?;
            sink.write(&dos)?;
            out_pe_offset = pe_offset;
        }

        let mut st = PackState {
            ih,
            isection,
            rvamin,
            ibuf: Vec::new(),
            strip_relocs,
            big_relocs: 0,
        };

        let overlaystart = self.read_sections(src, &mut st)?;
        let overlaystart = self.strip_debug(&mut st, overlaystart);
        let file_size = src.size();
        let mut overlay = file_size.saturating_sub(overlaystart as u64);
        if overlay >= file_size {
            overlay = 0;
        }

        if st.ih.dllflags & dll_flags::GUARD_CF != 0 {
            if self.opts.force {
                let lc = st.ih.ddirs[dd::LOAD_CONFIG];
                let gfpos = 14 * st.ih.ptr_size() + 6 * 4 + 4 * 2;
                if lc.vaddr != 0 && lc.size >= gfpos + 4 {
                    let at = (lc.vaddr + gfpos) as usize;
                    if at + 4 <= st.ibuf.len() {
                        // GuardFlags: security cookie unused, rest cleared
                        st.ibuf[at..at + 4]
                            .copy_from_slice(&GUARD_SECURITY_COOKIE_UNUSED.to_le_bytes());
                    }
                }
                st.ih.dllflags ^= dll_flags::GUARD_CF;
            } else {
                return Err(Error::cant_pack(
                    "GUARD_CF enabled PE files are not supported (use --force to disable)",
                ));
            }
        }

        // three processors scan the base relocations; parse them once
        let reloc_dir = st.ih.ddirs[dd::BASERELOC];
        let reloc_region = st
            .ibuf
            .get(reloc_dir.vaddr as usize..(reloc_dir.vaddr + reloc_dir.size) as usize)
            .ok_or_else(|| Error::cant_pack(format!("bad reloc {:#x}", reloc_dir.vaddr)))?
            .to_vec();
        let reloc_reader = RelocReader::parse(&reloc_region, self.opts.force)?;

        // processors, pass 1
        let imports = process_imports(ImportContext {
            image: &mut st.ibuf,
            import_dir: st.ih.ddirs[dd::IMPORT],
            rvamin,
            is64,
            is_dll: isdll,
            is_efi: isefi,
            kernel_dll: format.kernel_dll(),
        })?;
        let (mut import_linker, oimport, soimpdlls, dllstrings) = match imports {
            Some(im) => (Some(im.linker), im.oimport, im.soimpdlls as u32, im.dllstrings),
            None => (None, Vec::new(), 0, 0),
        };
        let soimport = oimport.len() as u32;

        let mut tls = TlsProcessor::process(
            &mut st.ibuf,
            st.ih.ddirs[dd::TLS],
            &reloc_reader,
            st.ih.imagebase,
            st.ih.imagesize,
            isefi,
            is64,
        )?;
        let aligned_sotls = tls.as_ref().map_or(0, |t| t.size());

        let loadconf =
            LoadConfProcessor::process(&st.ibuf, st.ih.ddirs[dd::LOAD_CONFIG], &reloc_reader)?;
        let soloadconf = loadconf.as_ref().map_or(0, |lc| lc.size());
        let lc_reloc_count = loadconf.as_ref().map_or(0, |lc| lc.reloc_count());

        let (mut res, mut oresources, icondir_count) = self.process_resources(&mut st)?;
        let soresources = oresources.len() as u32;

        let export_dir = st.ih.ddirs[dd::EXPORT];
        let mut soexport = align_up(export_dir.size, 4);
        let mut xport = None;
        if soexport != 0 {
            if !isdll && self.opts.compress_exports {
                warn!("exports compressed, --compress-exports=0 might be needed");
                soexport = 0;
            } else {
                let x =
                    ExportProcessor::convert(&mut st.ibuf, 0, export_dir.vaddr, export_dir.size)?;
                soexport = align_up(x.size(), 4);
                xport = Some(x);
            }
        }

        let orelocs = self.process_relocs(&mut st)?;
        let sorelocs = orelocs.len() as u32;

        // some checks for broken linkers - disable the filter if needed
        let objs = st.ih.objects as usize;
        let code_section = section_index_of(&st.isection, st.ih.codebase);
        let mut allow_filter = !(st.ih.codebase + st.ih.codesize > st.ih.imagesize
            || code_section >= objs
            || st.isection[code_section].characteristics & sc::CODE == 0);

        if !is_power_of_two(st.ih.objectalign) {
            return Err(Error::cant_pack(format!(
                "bad object alignment {:#x}",
                st.ih.objectalign
            )));
        }
        let oam1 = st.ih.objectalign - 1;

        let last = &st.isection[objs - 1];
        let mut newvsize = (last.virtual_address + last.virtual_size + oam1) & !oam1;
        if (newvsize + soimport + sorelocs) as usize > st.ibuf.len() {
            return Err(Error::internal("buffer too small 2"));
        }
        st.ibuf[newvsize as usize..newvsize as usize + soimport as usize]
            .copy_from_slice(&oimport);
        st.ibuf[(newvsize + soimport) as usize..(newvsize + soimport + sorelocs) as usize]
            .copy_from_slice(&orelocs);

        let cimports = newvsize - rvamin; // rva of preprocessed imports
        let crelocs = cimports + soimport; // rva of preprocessed fixups

        let mut u_len = newvsize + soimport + sorelocs;

        // extra_info trailer for the unpacker
        let mut extra = Vec::new();
        extra.extend_from_slice(&st.ih.to_bytes());
        for s in &st.isection {
            extra.extend_from_slice(&s.to_bytes());
        }
        if soimport != 0 {
            extra.extend_from_slice(&cimports.to_le_bytes());
            extra.extend_from_slice(&dllstrings.to_le_bytes());
        }
        if sorelocs != 0 {
            extra.extend_from_slice(&crelocs.to_le_bytes());
            extra.push(st.big_relocs & 6);
        }
        if soresources != 0 {
            extra.extend_from_slice(&icondir_count.to_le_bytes());
        }
        extra.extend_from_slice(&(u_len - rvamin).to_le_bytes());
        if u_len as usize + extra.len() > st.ibuf.len() {
            return Err(Error::internal("buffer too small 2"));
        }
        st.ibuf[u_len as usize..u_len as usize + extra.len()].copy_from_slice(&extra);
        u_len += extra.len() as u32;

        if u_len < rvamin {
            return Err(Error::internal(format!(
                "bad PE header  u_len={u_len:#x}  rvamin={rvamin:#x}"
            )));
        }
        u_len -= rvamin;

        // disable the filter when the code range overflows the
        // uncompressed length
        if st.ih.codebase + st.ih.codesize > u_len + rvamin {
            allow_filter = false;
        }
        // the filter engine lives in the codec collaborator; the shipped
        // codecs implement none, so the selected id is FILTER_NONE even
        // when filtering is allowed
        let filter: u8 = if allow_filter { FILTER_NONE } else { 0 };

        let level = 8u8;
        let mut obuf = self
            .compressor
            .compress(&st.ibuf[rvamin as usize..(rvamin + u_len) as usize], level);
        if obuf.len() as u32 >= u_len {
            return Err(Error::NotCompressible);
        }
        let mut ph = PackHeader {
            version: PACK_VERSION,
            format,
            method: self.compressor.method(),
            level,
            u_len,
            c_len: obuf.len() as u32,
            filter,
            filter_cto: 0,
        };

        newvsize = (u_len + rvamin + OVERLAP_OVERHEAD + oam1) & !oam1;

        let oh_filealign = st.ih.filealign.min(0x200);
        let fam1 = oh_filealign - 1;

        let codesize = self.stub.code().len() as u32;

        let predicted_oxrelocs = !st.strip_relocs && (tls.is_some() || lc_reloc_count != 0);
        let has_ncsection =
            predicted_oxrelocs || soimpdlls != 0 || soexport != 0 || soresources != 0;
        let oobjs: usize = if last_section_rsrc_only {
            4
        } else if has_ncsection {
            3
        } else {
            2
        };
        let sizeof_osection = (SectionHeader::SIZE * oobjs) as u32;

        // identsplit - number of ident bytes placed in the header padding
        let identsize = (self.stub.ident().len() + PackHeader::SIZE) as u32;
        let header_end = out_pe_offset + sizeof_osection + st.ih.size() as u32;
        let identsplit = if header_end & fam1 == 0 {
            0
        } else if ((header_end + identsize) ^ header_end) < oh_filealign {
            identsize
        } else {
            align_gap(header_end, oh_filealign)
        };
        let ic_ident = identsize - identsplit;

        // pad the compressed stream so the loader code lands 16-aligned
        let c_len = if (ph.c_len + ic_ident) & 15 == 0 {
            ph.c_len
        } else {
            ph.c_len + 16 - ((ph.c_len + ic_ident) & 15)
        };
        obuf.resize(c_len as usize, 0);

        let lexx = st.ih.ptr_size();
        let s1size = align_up(ic_ident + c_len + codesize, lexx) + aligned_sotls + soloadconf;
        let s1addr = (newvsize.wrapping_sub(ic_ident + c_len) + oam1) & !oam1;
        let ncsection = (s1addr + s1size + oam1) & !oam1;
        let upxsection = s1addr + ic_ident + c_len;

        let mut rel = Some(RelocBuilder::new(1024 + reloc_reader.total() as usize));

        // new PE header
        let mut oh = st.ih.clone();
        oh.filealign = oh_filealign;
        oh.entry = upxsection;
        oh.objects = oobjs as u16;
        oh.chksum = 0;
        oh.ddirs[dd::DEBUG].clear();
        oh.ddirs[dd::IAT].clear();
        oh.ddirs[dd::BOUND_IMPORT].clear();

        // tls & loadconf sit at the end of section 1
        let mut ic = s1addr + s1size - aligned_sotls - soloadconf;

        let tls_handler_offset = if tls.as_ref().is_some_and(|t| t.use_callbacks) {
            self.stub
                .symbol_offset("tls_callback_handler")
                .map_or(0, |off| off + upxsection)
        } else {
            0
        };
        oh.ddirs[dd::TLS].clear();
        if let Some(t) = tls.as_mut() {
            t.finalize(rel.as_mut().unwrap(), ic, st.ih.imagebase, tls_handler_offset)?;
            oh.ddirs[dd::TLS] = DataDirectory {
                vaddr: ic,
                size: t.dir_entry_size(),
            };
        }
        let otls = tls.as_ref().map(|t| t.data().to_vec()).unwrap_or_default();
        ic += aligned_sotls;

        oh.ddirs[dd::LOAD_CONFIG].clear();
        if let Some(lc) = &loadconf {
            lc.finalize(rel.as_mut().unwrap(), ic)?;
            oh.ddirs[dd::LOAD_CONFIG] = DataDirectory {
                vaddr: ic,
                size: soloadconf,
            };
        }
        ic += soloadconf;

        ic = ncsection;
        if !last_section_rsrc_only {
            if let Some(tree) = res.as_mut() {
                finalize_resources(tree, &mut oresources, ic)?;
            }
            oh.ddirs[dd::RESOURCE] = DataDirectory {
                vaddr: if soresources != 0 { ic } else { 0 },
                size: soresources,
            };
            ic += soresources;
        }

        // WinCE wants the relocation data at the start of the section
        let mut oxrelocs = Vec::new();
        let mut rel_done = false;
        if last_section_rsrc_only {
            oxrelocs = rel.take().unwrap().finish(self.opts.force)?;
            rel_done = true;
            if st.strip_relocs {
                oxrelocs.clear();
            }
            oh.ddirs[dd::BASERELOC] = DataDirectory {
                vaddr: if oxrelocs.is_empty() { 0 } else { ic },
                size: oxrelocs.len() as u32,
            };
            ic += oxrelocs.len() as u32;
        }

        // pass 2 imports: relocate the new table to its final address
        let mut oimpdlls = Vec::new();
        if let Some(linker) = import_linker.as_mut() {
            linker.relocate(ic as u64)?;
            oimpdlls = linker.output().to_vec();
        }
        oh.ddirs[dd::IMPORT] = DataDirectory {
            vaddr: if soimpdlls != 0 { ic } else { 0 },
            size: soimpdlls,
        };
        ic += soimpdlls;

        let mut oexport = Vec::new();
        if let Some(x) = &xport {
            oexport = x.build(ic);
            oexport.resize(soexport as usize, 0);
        }
        oh.ddirs[dd::EXPORT] = DataDirectory {
            vaddr: if soexport != 0 { ic } else { 0 },
            size: soexport,
        };
        if !isdll && self.opts.compress_exports {
            oh.ddirs[dd::EXPORT] = st.ih.ddirs[dd::EXPORT];
        }
        ic += soexport;

        if !rel_done {
            oxrelocs = rel.take().unwrap().finish(self.opts.force)?;
            if st.strip_relocs {
                oxrelocs.clear();
            }
            oh.ddirs[dd::BASERELOC] = DataDirectory {
                vaddr: if oxrelocs.is_empty() { 0 } else { ic },
                size: oxrelocs.len() as u32,
            };
            ic += oxrelocs.len() as u32;
        }
        let soxrelocs = oxrelocs.len() as u32;

        // WinCE: resources alone in the last section
        let res_start = (ic + oam1) & !oam1;
        if last_section_rsrc_only {
            if let Some(tree) = res.as_mut() {
                finalize_resources(tree, &mut oresources, res_start)?;
            }
            oh.ddirs[dd::RESOURCE] = DataDirectory {
                vaddr: if soresources != 0 { res_start } else { 0 },
                size: soresources,
            };
        }

        let ncsize =
            soxrelocs + soimpdlls + soexport + if last_section_rsrc_only { 0 } else { soresources };
        // windows touches a few bytes after the end of relocation data, so
        // the virtual size must leave room for that
        let ncsize_virt_increase = if soxrelocs != 0 && ncsize & oam1 == 0 {
            8
        } else {
            0
        };

        // the output section table; slots beyond oh.objects stay unused
        // and are dropped before writing
        let mut osection = vec![SectionHeader::default(); 4];
        osection[0].set_name("UPX0");
        osection[1].set_name("UPX1");
        // the resource directory must start the section: some system dlls
        // locate resources by section name rather than data directory
        osection[2].set_name(if !last_section_rsrc_only && soresources != 0 {
            ".rsrc"
        } else {
            "UPX2"
        });

        osection[0].virtual_address = rvamin;
        osection[1].virtual_address = s1addr;
        osection[2].virtual_address = ncsection;

        osection[0].size_of_raw_data = 0;
        osection[1].size_of_raw_data = (s1size + fam1) & !fam1;
        osection[2].size_of_raw_data = (ncsize + fam1) & !fam1;

        osection[0].virtual_size = s1addr - rvamin;
        if !last_section_rsrc_only {
            osection[1].virtual_size = (osection[1].size_of_raw_data + oam1) & !oam1;
            osection[2].virtual_size =
                (osection[2].size_of_raw_data + ncsize_virt_increase + oam1) & !oam1;
            oh.imagesize = osection[2].virtual_address + osection[2].virtual_size;
            osection[0].pointer_to_raw_data = (header_end + fam1) & !fam1;
            osection[1].pointer_to_raw_data = osection[0].pointer_to_raw_data;
        } else {
            osection[1].virtual_size = osection[1].size_of_raw_data;
            osection[2].virtual_size = osection[2].size_of_raw_data;
            osection[0].pointer_to_raw_data = 0;
            osection[1].pointer_to_raw_data = (header_end + fam1) & !fam1;
        }
        osection[2].pointer_to_raw_data =
            osection[1].pointer_to_raw_data + osection[1].size_of_raw_data;

        osection[0].characteristics =
            sc::UNINITIALIZED_DATA | sc::READ | sc::WRITE | sc::EXECUTE;
        osection[1].characteristics = sc::INITIALIZED_DATA | sc::READ | sc::WRITE | sc::EXECUTE;
        osection[2].characteristics = sc::INITIALIZED_DATA | sc::READ | sc::WRITE;

        if last_section_rsrc_only {
            osection[3].set_name(".rsrc");
            osection[3].virtual_address = res_start;
            osection[3].size_of_raw_data = (soresources + fam1) & !fam1;
            osection[3].virtual_size = osection[3].size_of_raw_data;
            osection[3].pointer_to_raw_data =
                osection[2].pointer_to_raw_data + osection[2].size_of_raw_data;
            osection[2].characteristics = sc::INITIALIZED_DATA | sc::READ;
            osection[3].characteristics = sc::INITIALIZED_DATA | sc::READ;
            oh.imagesize =
                (osection[3].virtual_address + osection[3].virtual_size + oam1) & !oam1;
            if soresources == 0 {
                oh.objects = 3;
                osection[3] = SectionHeader::default();
            }
        }

        oh.bsssize = osection[0].virtual_size;
        oh.datasize = osection[2].virtual_size
            + if oh.objects as usize > 3 {
                osection[3].virtual_size
            } else {
                0
            };
        if !oh.is64 {
            oh.database = osection[2].virtual_address;
        }
        oh.codesize = osection[1].virtual_size;
        oh.codebase = osection[1].virtual_address;
        oh.headersize = osection
            .iter()
            .find(|s| s.pointer_to_raw_data != 0)
            .map_or(0, |s| s.pointer_to_raw_data);
        if rvamin < osection[0].pointer_to_raw_data {
            return Err(Error::cant_pack(format!(
                "object alignment too small rvamin={rvamin:#x} oraw={:#x}",
                osection[0].pointer_to_raw_data
            )));
        }

        if st.strip_relocs {
            oh.flags |= coff_flags::RELOCS_STRIPPED;
        }

        info!(
            "Image size change: {} -> {} KiB",
            st.ih.imagesize / 1024,
            oh.imagesize / 1024
        );

        // the loader ident block carries the pack header
        ph.c_len = c_len;
        let mut ident = self.stub.ident().to_vec();
        ident.extend_from_slice(&ph.to_bytes());

        // write loader + compressed file
        sink.write(&oh.to_bytes())?;
        for s in &osection[..oobjs] {
            sink.write(&s.to_bytes())?;
        }
        let first_raw = if last_section_rsrc_only {
            osection[1].pointer_to_raw_data
        } else {
            osection[0].pointer_to_raw_data
        };
        if identsplit == identsize {
            let n = first_raw as u64 - sink.bytes_written() - identsize as u64;
            debug_assert!(n <= oh.filealign as u64);
            sink.write(&vec![0u8; n as usize])?;
        }
        sink.write(&ident)?;
        sink.write(&obuf)?;
        sink.write(self.stub.code())?;
        let misalign = (sink.bytes_written() % lexx as u64) as u32;
        if misalign != 0 {
            sink.write(&vec![0u8; (lexx - misalign) as usize])?;
        }
        sink.write(&otls)?;
        if let Some(lc) = &loadconf {
            sink.write(lc.data())?;
        }
        pad_to(sink, oh.filealign)?;
        if !last_section_rsrc_only {
            sink.write(&oresources)?;
        } else {
            sink.write(&oxrelocs)?;
        }
        sink.write(&oimpdlls)?;
        sink.write(&oexport)?;
        if !last_section_rsrc_only {
            sink.write(&oxrelocs)?;
        }
        pad_to(sink, oh.filealign)?;
        if last_section_rsrc_only {
            sink.write(&oresources)?;
            pad_to(sink, oh.filealign)?;
        }

        // copy the overlay
        if overlay != 0 {
            let tail = src.read_block(file_size - overlay, overlay as usize)?;
            sink.write(&tail)?;
        }

        // finally check the compression ratio
        if sink.bytes_written() >= file_size {
            return Err(Error::NotCompressible);
        }
        Ok(())
    }

    /// Check whether `src` looks like a file this packer produced.
    pub fn can_unpack<S: InputSource + ?Sized>(&self, src: &S) -> Result<bool> {
        match self.read_packed_headers(src) {
            Ok(_) => Ok(true),
            Err(Error::Io(e)) => Err(Error::Io(e)),
            Err(_) => Ok(false),
        }
    }

    fn read_packed_headers<S: InputSource + ?Sized>(
        &self,
        src: &S,
    ) -> Result<(u32, PeHeader, Format, Vec<SectionHeader>, PackHeader, u64)> {
        let (pe_offset, ih, format) = self.read_headers(src).map_err(|e| match e {
            Error::Io(e) => Error::Io(e),
            other => Error::cant_unpack(other.to_string()),
        })?;
        let isection = self
            .read_section_headers(src, pe_offset, &ih)
            .map_err(|e| Error::cant_unpack(e.to_string()))?;
        let min_sections = if ih.is_efi() { 2 } else { 3 };
        if isection.len() < min_sections {
            return Err(Error::cant_unpack("not packed by this program"));
        }
        if !isection[0].name.starts_with(b"UPX") {
            return Err(Error::cant_unpack("not packed by this program"));
        }
        if ih.entry <= isection[1].virtual_address {
            return Err(Error::cant_unpack(
                "file is possibly modified/hacked/protected; take care!",
            ));
        }
        // the pack header sits at the end of the loader ident block,
        // right in front of the compressed stream
        let window_start = (isection[1].pointer_to_raw_data as u64).saturating_sub(64);
        let window_len = src.size().saturating_sub(window_start).min(1024) as usize;
        let window = src.read_block(window_start, window_len)?;
        let (off, ph) = PackHeader::find(&window)?;
        if ph.format != format {
            return Err(Error::cant_unpack(
                "this program is packed with an obsolete version",
            ));
        }
        let c_start = window_start + off as u64 + PackHeader::SIZE as u64;
        Ok((pe_offset, ih, format, isection, ph, c_start))
    }

    /// Unpack `src` (a file produced by `pack`) into `sink`.
    pub fn unpack<S, O>(&self, src: &S, sink: &mut O) -> Result<()>
    where
        S: InputSource + ?Sized,
        O: OutputSink + ?Sized,
    {
        let (pe_offset, ih, format, isection, ph, c_start) = self.read_packed_headers(src)?;
        if ih.filealign == 0 {
            return Err(Error::cant_unpack("unexpected value in the PE header"));
        }
        let is64 = ih.is64;
        let iobjs = isection.len();
        let file_size = src.size();
        let last = &isection[iobjs - 1];
        let overlay = file_size.saturating_sub(align_up(
            last.pointer_to_raw_data + last.size_of_raw_data,
            ih.filealign,
        ) as u64);

        let cdata = src.read_block(c_start, ph.c_len as usize)?;
        let mut obuf = self.compressor.decompress(&cdata, ph.u_len as usize)?;
        let u_len = ph.u_len as usize;
        if u_len < 4 {
            return Err(Error::cant_unpack("unexpected end of compressed data"));
        }

        // the extra_info trailer drives reconstruction
        let mut skip = le32(&obuf, u_len - 4)? as usize;
        let mut oh = PeHeader::parse(
            obuf.get(skip..)
                .ok_or_else(|| Error::cant_unpack("bad extra_info offset"))?,
        )
        .map_err(|e| Error::cant_unpack(e.to_string()))?;
        skip += oh.size();
        let objs = oh.objects as usize;
        if objs == 0 || (iobjs > 2 && isection[2].size_of_raw_data == 0) {
            return Err(Error::cant_unpack("unexpected value in the PE header"));
        }
        let osection = SectionHeader::parse_table(
            obuf.get(skip..)
                .ok_or_else(|| Error::cant_unpack("bad extra section size"))?,
            objs,
        )
        .map_err(|e| Error::cant_unpack(e.to_string()))?;
        skip += objs * SectionHeader::SIZE;
        let rvamin = osection[0].virtual_address;

        // the non-compressed section
        let mut ncbuf = Vec::new();
        if iobjs > 2 {
            ncbuf = src.read_block(
                isection[2].pointer_to_raw_data as u64,
                isection[2].size_of_raw_data as usize,
            )?;
        }

        // unfilter would run here; filter 0 means there is nothing to do

        if ih.flags & coff_flags::RELOCS_STRIPPED != 0 {
            oh.flags |= coff_flags::RELOCS_STRIPPED;
            oh.ddirs[dd::BASERELOC].clear();
        }

        // imports
        if oh.ddirs[dd::IMPORT].vaddr != 0 && oh.ddirs[dd::IMPORT].size > 20 {
            let cimports = le32(&obuf, skip)?;
            let dllstrings = le32(&obuf, skip + 4)?;
            skip += 8;
            let block_off = ih.ddirs[dd::IMPORT]
                .vaddr
                .wrapping_sub(isection[2].virtual_address) as usize;
            let import_block = ncbuf
                .get(block_off..)
                .ok_or_else(|| Error::cant_unpack("corrupted imports"))?
                .to_vec();
            rebuild_imports(RebuildImports {
                obuf: &mut obuf,
                rvamin,
                import_block: &import_block,
                import_vaddr: oh.ddirs[dd::IMPORT].vaddr,
                cimports,
                dllstrings,
                is64,
                set_oft: format == Format::WinCeArm,
            })?;
        }

        // relocations
        self.rebuild_relocs(&mut obuf, &mut skip, &mut oh, rvamin, is64)?;

        // tls needs no rebuilding: the original directory was left in the
        // image

        // exports
        if oh.ddirs[dd::EXPORT].size != 0
            && oh.ddirs[dd::EXPORT].vaddr != ih.ddirs[dd::EXPORT].vaddr
        {
            let xp = ExportProcessor::convert(
                &mut ncbuf,
                isection[2].virtual_address,
                ih.ddirs[dd::EXPORT].vaddr,
                ih.ddirs[dd::EXPORT].size,
            )
            .map_err(|e| Error::cant_unpack(e.to_string()))?;
            let built = xp.build(oh.ddirs[dd::EXPORT].vaddr);
            let at = (oh.ddirs[dd::EXPORT].vaddr - rvamin) as usize;
            obuf.get_mut(at..at + built.len())
                .ok_or_else(|| Error::cant_unpack("corrupted exports"))?
                .copy_from_slice(&built);
        }

        // resources: WinCE keeps them in their own final section
        if iobjs > 3 {
            ncbuf = src.read_block(
                isection[3].pointer_to_raw_data as u64,
                isection[3].size_of_raw_data as usize,
            )?;
        }
        let lastvaddr = isection[iobjs - 1].virtual_address;
        self.rebuild_resources(&mut obuf, &mut skip, &oh, &ih, rvamin, lastvaddr, &ncbuf)?;

        // fill the data directory
        oh.ddirs[dd::DEBUG].clear();
        oh.ddirs[dd::IAT].clear();
        oh.ddirs[dd::BOUND_IMPORT].clear();
        oh.headersize = osection
            .iter()
            .find(|s| s.pointer_to_raw_data != 0)
            .map_or(0, |s| s.pointer_to_raw_data);
        oh.chksum = 0;

        // write the reconstructed file
        let dos = src.read_block(0, pe_offset as usize)?;
        sink.write(&dos)?;
        sink.write(&oh.to_bytes())?;
        for s in &osection {
            sink.write(&s.to_bytes())?;
        }
        let first_raw = oh.headersize as u64;
        if first_raw < sink.bytes_written() {
            return Err(Error::cant_unpack("corrupted PE header"));
        }
        sink.write(&vec![0u8; (first_raw - sink.bytes_written()) as usize])?;
        for s in &osection {
            if s.pointer_to_raw_data == 0 {
                continue;
            }
            let start = (s.virtual_address - rvamin) as usize;
            let len = align_up(s.size_of_raw_data, oh.filealign) as usize;
            if obuf.len() < start + len {
                obuf.resize(start + len, 0);
            }
            sink.write(&obuf[start..start + len])?;
        }
        if overlay != 0 {
            let tail = src.read_block(file_size - overlay, overlay as usize)?;
            sink.write(&tail)?;
        }
        Ok(())
    }

    fn rebuild_relocs(
        &self,
        obuf: &mut Vec<u8>,
        skip: &mut usize,
        oh: &mut PeHeader,
        rvamin: u32,
        is64: bool,
    ) -> Result<()> {
        let dir = oh.ddirs[dd::BASERELOC];
        if dir.vaddr == 0 || dir.size == 0 || oh.flags & coff_flags::RELOCS_STRIPPED != 0 {
            return Ok(());
        }
        let at = (dir.vaddr - rvamin) as usize;
        if dir.size == 8 {
            // some tricky dlls keep a single empty block
            obuf.get_mut(at..at + 8)
                .ok_or_else(|| Error::cant_unpack("corrupted relocations"))?
                .copy_from_slice(&[0, 0, 0, 0, 8, 0, 0, 0]);
            return Ok(());
        }

        let crelocs = le32(obuf, *skip)? as usize;
        let big = *obuf
            .get(*skip + 4)
            .ok_or_else(|| Error::cant_unpack("corrupted relocations"))?;
        *skip += 5;

        let rdata = obuf
            .get(crelocs..)
            .ok_or_else(|| Error::cant_unpack("corrupted relocations"))?
            .to_vec();
        let (positions, consumed) =
            self.reloc_codec
                .unoptimize_reloc(&rdata, obuf, if is64 { 64 } else { 32 })?;

        // 16-bit relocations follow the wide stream
        let mut tails: Vec<(u32, u32)> = Vec::new();
        let mut toff = consumed;
        if big & 6 != 0 {
            let first_type = if big & 4 != 0 { 2 } else { 1 };
            loop {
                let v = le32(&rdata, toff)?;
                toff += 4;
                if v == 0 {
                    break;
                }
                tails.push((v.wrapping_add(rvamin), first_type));
            }
            if big & 6 == 6 {
                loop {
                    let v = le32(&rdata, toff)?;
                    toff += 4;
                    if v == 0 {
                        break;
                    }
                    tails.push((v.wrapping_add(rvamin), 1));
                }
            }
        }

        let mut rel = RelocBuilder::new(positions.len() + tails.len());
        for &(pos, rtype) in &tails {
            rel.add(pos, rtype)?;
        }
        let bias = oh.imagebase.wrapping_add(rvamin as u64);
        for &pos in &positions {
            let wat = pos as usize;
            if is64 {
                let raw = obuf
                    .get(wat..wat + 8)
                    .ok_or_else(|| Error::cant_unpack("corrupted relocations"))?;
                let w = u64::from_le_bytes([
                    raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
                ]);
                obuf[wat..wat + 8].copy_from_slice(&w.wrapping_add(bias).to_le_bytes());
            } else {
                let raw = obuf
                    .get(wat..wat + 4)
                    .ok_or_else(|| Error::cant_unpack("corrupted relocations"))?;
                let w = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                obuf[wat..wat + 4].copy_from_slice(&w.wrapping_add(bias as u32).to_le_bytes());
            }
            rel.add(rvamin + pos, if is64 { 10 } else { 3 })?;
        }
        let oxrelocs = rel.finish(self.opts.force)?;
        obuf.get_mut(at..at + oxrelocs.len())
            .ok_or_else(|| Error::cant_unpack("corrupted relocations"))?
            .copy_from_slice(&oxrelocs);
        oh.ddirs[dd::BASERELOC].size = oxrelocs.len() as u32;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn rebuild_resources(
        &self,
        obuf: &mut Vec<u8>,
        skip: &mut usize,
        oh: &PeHeader,
        ih: &PeHeader,
        rvamin: u32,
        lastvaddr: u32,
        ncbuf: &[u8],
    ) -> Result<()> {
        if oh.ddirs[dd::RESOURCE].size == 0 || ih.ddirs[dd::RESOURCE].size == 0 {
            return Ok(());
        }
        let mut icondir_count = u16::from_le_bytes([
            *obuf
                .get(*skip)
                .ok_or_else(|| Error::cant_unpack("corrupted resources"))?,
            *obuf
                .get(*skip + 1)
                .ok_or_else(|| Error::cant_unpack("corrupted resources"))?,
        ]);
        *skip += 2;

        let vaddr = ih.ddirs[dd::RESOURCE].vaddr;
        if vaddr < lastvaddr || (vaddr - lastvaddr) as usize > ncbuf.len() {
            return Err(Error::cant_unpack("corrupted PE header"));
        }
        let mut res = ResourceTree::parse(&ncbuf[(vaddr - lastvaddr) as usize..])?;
        for lc in 0..res.leaf_count() {
            if res.offs(lc) <= vaddr {
                continue;
            }
            let src_off = (res.offs(lc) - lastvaddr) as usize;
            let origoffs = le32(ncbuf, src_off - 4)?;
            res.set_newoffs(lc, origoffs);
            let take = res.size(lc) as usize;
            let blob = ncbuf
                .get(src_off..src_off + take)
                .ok_or_else(|| Error::cant_unpack("corrupted resources"))?;
            let dst = (origoffs.wrapping_sub(rvamin)) as usize;
            obuf.get_mut(dst..dst + take)
                .ok_or_else(|| Error::cant_unpack("corrupted resources"))?
                .copy_from_slice(blob);
            if icondir_count != 0 && res.itype(lc) == rt::RT_GROUP_ICON {
                obuf[dst + 4..dst + 6].copy_from_slice(&icondir_count.to_le_bytes());
                icondir_count = 0;
            }
        }
        if res.dirsize() != 0 {
            let built = res.build()?;
            let at = (oh.ddirs[dd::RESOURCE].vaddr - rvamin) as usize;
            // write back only when the original was zeroed during packing
            if le32(obuf, at + 12)? == 0 {
                obuf.get_mut(at..at + built.len())
                    .ok_or_else(|| Error::cant_unpack("corrupted resources"))?
                    .copy_from_slice(&built);
            }
        }
        Ok(())
    }
}

// processResources pass 2: rebase the kept blobs and emit the directory
fn finalize_resources(
    res: &mut ResourceTree,
    oresources: &mut [u8],
    newaddr: u32,
) -> Result<()> {
    for lc in 0..res.leaf_count() {
        let off = res.newoffs(lc);
        if off != 0 {
            res.set_newoffs(lc, off + newaddr);
        }
    }
    let dirsize = res.dirsize() as usize;
    if dirsize != 0 {
        let built = res.build()?;
        oresources[..dirsize].copy_from_slice(&built);
    }
    Ok(())
}

fn pad_to<O: OutputSink + ?Sized>(sink: &mut O, alignment: u32) -> Result<()> {
    let misalign = (sink.bytes_written() % alignment as u64) as u32;
    if misalign != 0 {
        sink.write(&vec![0u8; (alignment - misalign) as usize])?;
    }
    Ok(())
}
