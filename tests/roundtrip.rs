//! Integration tests: pack a minimal PE, unpack it again and compare the
//! loader-visible state against the original.

use pepack::data_dir::index as dd;
use pepack::headers::{coff_flags, dll_flags, machine, subsystem, PE32PLUS_MAGIC, PE32_MAGIC};
use pepack::section::characteristics as sc;
use pepack::stream::{SliceSource, VecSink};
use pepack::tls::TlsDirectory64;
use pepack::{
    DataDirectory, EmptyStub, Error, LeRelocCodec, PackOptions, PeHeader, PePacker, ResourceTree,
    RleCompressor, SectionHeader,
};

fn pack_bytes(opts: PackOptions, input: &[u8]) -> pepack::Result<Vec<u8>> {
    let compressor = RleCompressor;
    let codec = LeRelocCodec;
    let stub = EmptyStub;
    let packer = PePacker::new(opts, &compressor, &codec, &stub);
    let mut sink = VecSink::new();
    packer.pack(&SliceSource::new(input), &mut sink)?;
    Ok(sink.into_inner())
}

fn unpack_bytes(input: &[u8]) -> pepack::Result<Vec<u8>> {
    let compressor = RleCompressor;
    let codec = LeRelocCodec;
    let stub = EmptyStub;
    let packer = PePacker::new(PackOptions::default(), &compressor, &codec, &stub);
    let mut sink = VecSink::new();
    packer.unpack(&SliceSource::new(input), &mut sink)?;
    Ok(sink.into_inner())
}

fn mz_stub(f: &mut [u8]) {
    f[0..2].copy_from_slice(b"MZ");
    f[0x18..0x1A].copy_from_slice(&0x40u16.to_le_bytes());
    f[0x3C..0x40].copy_from_slice(&0x80u32.to_le_bytes());
}

fn text_section() -> SectionHeader {
    let mut sh = SectionHeader::default();
    sh.set_name(".text");
    sh.virtual_size = 0x1000;
    sh.virtual_address = 0x1000;
    sh.size_of_raw_data = 0x1000;
    sh.pointer_to_raw_data = 0x200;
    sh.characteristics = sc::CODE | sc::EXECUTE | sc::READ | sc::WRITE;
    sh
}

fn header_64(imagebase: u64) -> PeHeader {
    PeHeader {
        is64: true,
        cpu: machine::AMD64,
        objects: 1,
        time_date_stamp: 0,
        symbol_table_ptr: 0,
        symbol_count: 0,
        opthdrsize: 240,
        flags: coff_flags::EXECUTABLE_IMAGE | coff_flags::DLL,
        coff_magic: PE32PLUS_MAGIC,
        linker_major: 14,
        linker_minor: 0,
        codesize: 0x100,
        datasize: 0x200,
        bsssize: 0,
        entry: 0x1050,
        codebase: 0x1000,
        database: 0,
        imagebase,
        objectalign: 0x1000,
        filealign: 0x200,
        os_major: 6,
        os_minor: 0,
        image_major: 0,
        image_minor: 0,
        subsystem_major: 6,
        subsystem_minor: 0,
        win32_version: 0,
        imagesize: 0x2000,
        headersize: 0x200,
        chksum: 0,
        subsystem: subsystem::WINDOWS_CUI,
        dllflags: dll_flags::DYNAMIC_BASE,
        stackreserve: 0x100000,
        stackcommit: 0x1000,
        heapreserve: 0x100000,
        heapcommit: 0x1000,
        loader_flags: 0,
        ddirsentries: 16,
        ddirs: [DataDirectory::default(); 16],
    }
}

/// A 64-bit DLL with a TLS directory and one callback.
fn build_tls_dll(subsys: u16) -> Vec<u8> {
    const BASE: u64 = 0x1_8000_0000;
    let mut f = vec![0u8; 0x1200];
    mz_stub(&mut f);

    let mut ih = header_64(BASE);
    ih.subsystem = subsys;
    ih.ddirs[dd::TLS] = DataDirectory {
        vaddr: 0x1100,
        size: 40,
    };
    ih.write(&mut f[0x80..0x80 + PeHeader::SIZE64]);
    text_section().write(&mut f[0x188..0x188 + SectionHeader::SIZE]);

    let sec = |rva: u32| 0x200 + (rva - 0x1000) as usize;
    f[sec(0x1050)..sec(0x1058)].fill(0xCC);
    let tls = TlsDirectory64 {
        start_address_of_raw_data: BASE + 0x1200,
        end_address_of_raw_data: BASE + 0x1210,
        address_of_index: BASE + 0x1300,
        address_of_callbacks: BASE + 0x1400,
        size_of_zero_fill: 0,
        characteristics: 0,
    };
    tls.write(&mut f[sec(0x1100)..sec(0x1100) + 40]);
    f[sec(0x1200)..sec(0x1210)].copy_from_slice(b"tls-template-ab.");
    // one callback, then the terminator
    f[sec(0x1400)..sec(0x1408)].copy_from_slice(&(BASE + 0x1050).to_le_bytes());
    f
}

#[test]
fn test_tls_dll_roundtrip_is_byte_identical() {
    let input = build_tls_dll(subsystem::WINDOWS_CUI);
    let packed = pack_bytes(PackOptions::default(), &input).unwrap();
    assert!(packed.len() < input.len());

    // the packed image carries an uncompressed TLS directory
    let ph = PeHeader::parse(&packed[0x80..]).unwrap();
    assert_ne!(ph.ddirs[dd::TLS].vaddr, 0);
    assert_eq!(ph.ddirs[dd::TLS].size, 0x28);

    // nothing in this image needed lossy rewriting
    let unpacked = unpack_bytes(&packed).unwrap();
    assert_eq!(unpacked, input);
}

#[test]
fn test_tls_rejected_on_efi() {
    let input = build_tls_dll(subsystem::EFI_APPLICATION);
    let err = pack_bytes(PackOptions::default(), &input).unwrap_err();
    assert_eq!(err.to_string(), "TLS not supported on EFI");
}

/// A 32-bit exe with an icon group (2 icons) and its two icon blobs.
fn build_icon_exe() -> Vec<u8> {
    const BASE: u64 = 0x40_0000;
    let mut f = vec![0u8; 0x1200];
    mz_stub(&mut f);

    let mut ih = PeHeader {
        is64: false,
        cpu: machine::I386,
        objects: 1,
        time_date_stamp: 0,
        symbol_table_ptr: 0,
        symbol_count: 0,
        opthdrsize: 224,
        flags: coff_flags::EXECUTABLE_IMAGE,
        coff_magic: PE32_MAGIC,
        linker_major: 14,
        linker_minor: 0,
        codesize: 0x100,
        datasize: 0x200,
        bsssize: 0,
        entry: 0x1050,
        codebase: 0x1000,
        database: 0x1000,
        imagebase: BASE,
        objectalign: 0x1000,
        filealign: 0x200,
        os_major: 6,
        os_minor: 0,
        image_major: 0,
        image_minor: 0,
        subsystem_major: 6,
        subsystem_minor: 0,
        win32_version: 0,
        imagesize: 0x2000,
        headersize: 0x200,
        chksum: 0,
        subsystem: subsystem::WINDOWS_GUI,
        dllflags: dll_flags::DYNAMIC_BASE,
        stackreserve: 0x100000,
        stackcommit: 0x1000,
        heapreserve: 0x100000,
        heapcommit: 0x1000,
        loader_flags: 0,
        ddirsentries: 16,
        ddirs: [DataDirectory::default(); 16],
    };
    ih.ddirs[dd::RESOURCE] = DataDirectory {
        vaddr: 0x1800,
        size: 0x200,
    };
    ih.write(&mut f[0x80..0x80 + PeHeader::SIZE32]);
    text_section().write(&mut f[0x178..0x178 + SectionHeader::SIZE]);

    let sec = |rva: u32| 0x200 + (rva - 0x1000) as usize;
    f[sec(0x1050)..sec(0x1058)].fill(0xCC);

    // resource tree at rva 0x1800: {RT_ICON -> {1, 2}, RT_GROUP_ICON -> 1}
    let r = sec(0x1800);
    let dir = |f: &mut [u8], off: usize, entries: &[(u32, u32)]| {
        f[r + off + 14..r + off + 16].copy_from_slice(&(entries.len() as u16).to_le_bytes());
        for (ic, &(tnl, child)) in entries.iter().enumerate() {
            let e = r + off + 16 + ic * 8;
            f[e..e + 4].copy_from_slice(&tnl.to_le_bytes());
            f[e + 4..e + 8].copy_from_slice(&child.to_le_bytes());
        }
    };
    dir(&mut f, 0, &[(3, 0x8000_0000 | 32), (14, 0x8000_0000 | 112)]);
    dir(
        &mut f,
        32,
        &[(1, 0x8000_0000 | 64), (2, 0x8000_0000 | 88)],
    );
    dir(&mut f, 64, &[(0x409, 160)]);
    dir(&mut f, 88, &[(0x409, 176)]);
    dir(&mut f, 112, &[(1, 0x8000_0000 | 136)]);
    dir(&mut f, 136, &[(0x409, 192)]);
    let data = |f: &mut [u8], off: usize, rva: u32, size: u32| {
        f[r + off..r + off + 4].copy_from_slice(&rva.to_le_bytes());
        f[r + off + 4..r + off + 8].copy_from_slice(&size.to_le_bytes());
    };
    data(&mut f, 160, 0x1900, 0x20);
    data(&mut f, 176, 0x1920, 0x20);
    data(&mut f, 192, 0x1940, 34);

    // icon blobs
    f[sec(0x1900)..sec(0x1920)].fill(0xA1);
    f[sec(0x1920)..sec(0x1940)].fill(0xB2);
    // icon group: ICONDIR with 2 entries referencing icons 1 and 2
    let g = sec(0x1940);
    f[g + 2..g + 4].copy_from_slice(&1u16.to_le_bytes()); // type
    f[g + 4..g + 6].copy_from_slice(&2u16.to_le_bytes()); // count
    f[g + 6 + 12..g + 6 + 14].copy_from_slice(&1u16.to_le_bytes());
    f[g + 6 + 14 + 12..g + 6 + 14 + 14].copy_from_slice(&2u16.to_le_bytes());
    f
}

#[test]
fn test_icon_resources_roundtrip() {
    let input = build_icon_exe();
    let opts = PackOptions {
        compress_icons: 1,
        ..Default::default()
    };
    let packed = pack_bytes(opts, &input).unwrap();

    // the kept icon directory in the packed file reports a single icon
    let unpacked = unpack_bytes(&packed).unwrap();

    let sec = |rva: u32| 0x200 + (rva - 0x1000) as usize;
    // all three blobs byte-identical, including the restored entry count
    assert_eq!(
        &unpacked[sec(0x1900)..sec(0x1964)],
        &input[sec(0x1900)..sec(0x1964)]
    );
    let g = sec(0x1940);
    assert_eq!(
        u16::from_le_bytes([unpacked[g + 4], unpacked[g + 5]]),
        2
    );

    // the rebuilt tree resolves to the same leaves
    let tree = ResourceTree::parse(&unpacked[sec(0x1800)..]).unwrap();
    assert_eq!(tree.leaf_count(), 3);
    let offsets: Vec<u32> = (0..3).map(|lc| tree.offs(lc)).collect();
    assert!(offsets.contains(&0x1900));
    assert!(offsets.contains(&0x1920));
    assert!(offsets.contains(&0x1940));
}

#[test]
fn test_unpack_refuses_foreign_file() {
    let input = build_tls_dll(subsystem::WINDOWS_CUI);
    let err = unpack_bytes(&input).unwrap_err();
    assert!(matches!(err, Error::CantUnpack(_)));
}
