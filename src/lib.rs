//! # pepack
//!
//! The PE-structural core of an executable packer: given a Windows PE
//! image (32-bit or 64-bit, EFI and WinCE/ARM variants included), it
//! produces a smaller, self-extracting layout, and reconstructs the
//! original image from a packed one.
//!
//! ## Architecture
//!
//! The transformation is a pipeline of processors over a virtual image:
//! imports are rewritten into a compact preprocessed stream (replayed on
//! unpack), base relocations into a run-length style encoding, TLS data is
//! cloned with its relocations fixed up, the load-configuration table is
//! preserved verbatim, and the resource tree is rebuilt with per-leaf
//! compression decisions. The orchestrator in [`pe`] lays the results out
//! into a three-or-four-section output image.
//!
//! External collaborators - the compression codec, the relocation codec
//! and the decompression stub - are traits in [`codec`]; the host wires in
//! real implementations.
//!
//! ## Example
//!
//! ```no_run
//! use pepack::{LeRelocCodec, PackOptions, PePacker, RleCompressor, EmptyStub};
//! use pepack::stream::{FileSource, FileSink};
//!
//! let compressor = RleCompressor;
//! let reloc_codec = LeRelocCodec;
//! let stub = EmptyStub;
//! let packer = PePacker::new(PackOptions::default(), &compressor, &reloc_codec, &stub);
//!
//! let src = FileSource::open("app.exe")?;
//! let mut out = FileSink::create("app-packed.exe")?;
//! packer.pack(&src, &mut out)?;
//! # Ok::<(), pepack::Error>(())
//! ```

pub mod codec;
pub mod data_dir;
pub mod error;
pub mod export;
pub mod headers;
pub mod ilinker;
pub mod import;
pub mod interval;
pub mod layout;
pub mod loadconfig;
pub mod options;
pub mod pe;
pub mod reloc;
pub mod resource;
pub mod section;
pub mod stream;
pub mod tls;

pub use codec::{Compressor, EmptyStub, LeRelocCodec, LoaderStub, RelocCodec, RleCompressor};
pub use data_dir::DataDirectory;
pub use error::{Error, Result};
pub use export::{ExportDir, ExportProcessor};
pub use headers::{Format, PackHeader, PeHeader};
pub use ilinker::ImportLinker;
pub use import::ImportDescriptor;
pub use interval::Interval;
pub use loadconfig::LoadConfProcessor;
pub use options::{PackOptions, Tristate};
pub use pe::PePacker;
pub use reloc::{RelocBuilder, RelocReader};
pub use resource::{ResourceDataEntry, ResourceDirectoryEntry, ResourceDirectoryHeader, ResourceTree};
pub use section::SectionHeader;
pub use stream::{FileSink, FileSource, InputSource, OutputSink, SliceSource, VecSink};
pub use tls::{TlsDirectory32, TlsDirectory64, TlsProcessor};
