//! Packing options.
//!
//! The orchestrator takes an explicit [`PackOptions`] value; there is no
//! process-wide option state. Options that default differently depending on
//! the input (relocation stripping, resource compression) are modelled with
//! [`Tristate`] so "not specified" is distinguishable from an explicit
//! yes/no.

/// Resource type ids used by the per-type compression flags.
pub mod rt {
    pub const RT_CURSOR: u32 = 1;
    pub const RT_BITMAP: u32 = 2;
    pub const RT_ICON: u32 = 3;
    pub const RT_MENU: u32 = 4;
    pub const RT_DIALOG: u32 = 5;
    pub const RT_STRING: u32 = 6;
    pub const RT_FONTDIR: u32 = 7;
    pub const RT_FONT: u32 = 8;
    pub const RT_ACCELERATOR: u32 = 9;
    pub const RT_RCDATA: u32 = 10;
    pub const RT_MESSAGETABLE: u32 = 11;
    pub const RT_GROUP_CURSOR: u32 = 12;
    pub const RT_GROUP_ICON: u32 = 14;
    pub const RT_VERSION: u32 = 16;
    pub const RT_DLGINCLUDE: u32 = 17;
    pub const RT_PLUGPLAY: u32 = 19;
    pub const RT_VXD: u32 = 20;
    pub const RT_ANICURSOR: u32 = 21;
    pub const RT_ANIICON: u32 = 22;
    pub const RT_HTML: u32 = 23;
    pub const RT_MANIFEST: u32 = 24;
    /// One past the largest type id covered by per-type flags.
    pub const RT_LAST: usize = 25;
}

/// A yes/no option with an unspecified default state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tristate {
    /// Not specified; the packer picks a default based on the input.
    #[default]
    Default,
    No,
    Yes,
}

impl Tristate {
    /// Resolve against the default that applies when unspecified.
    pub fn resolve(self, default: bool) -> bool {
        match self {
            Tristate::Default => default,
            Tristate::No => false,
            Tristate::Yes => true,
        }
    }

    /// True unless explicitly `No`.
    pub fn is_default(self) -> bool {
        self == Tristate::Default
    }
}

impl From<bool> for Tristate {
    fn from(b: bool) -> Self {
        if b {
            Tristate::Yes
        } else {
            Tristate::No
        }
    }
}

/// Options consumed by the pack path.
#[derive(Debug, Clone)]
pub struct PackOptions {
    /// Override safety checks (duplicate relocs, odd block sizes, ASLR
    /// stripping, superfluous inter-section data, ...).
    pub force: bool,
    /// Strip base relocations. Unspecified: stripped for non-DLL, non-EFI
    /// images without DYNAMIC_BASE loaded at or above the default imagebase.
    pub strip_relocs: Tristate,
    /// Compress the export directory of executables (DLL exports are always
    /// preserved uncompressed).
    pub compress_exports: bool,
    /// Compress resources. Unspecified: enabled except on EFI.
    pub compress_resources: Tristate,
    /// Icon compression level: 0 = none, 1 = all but the first group's
    /// icons, 2 = all icons, 3 = also the icon directories.
    pub compress_icons: u8,
    /// Per resource type compression flag, indexed by type id.
    pub compress_rt: [Tristate; rt::RT_LAST],
    /// Resources to keep uncompressed: `type[/name],...` with numeric or
    /// string clauses.
    pub keep_resource: String,
    /// Name of the input file, if known. Only used for input-dependent
    /// defaults (`.scr` files keep RT_STRING uncompressed).
    pub input_name: Option<String>,
    /// Verbosity level, passed through from the host.
    pub verbose: u8,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            force: false,
            strip_relocs: Tristate::Default,
            compress_exports: true,
            compress_resources: Tristate::Default,
            compress_icons: 1,
            compress_rt: [Tristate::Default; rt::RT_LAST],
            keep_resource: String::new(),
            input_name: None,
            verbose: 0,
        }
    }
}

impl PackOptions {
    /// Whether the input file name carries the given extension.
    pub fn input_has_ext(&self, ext: &str) -> bool {
        match &self.input_name {
            Some(name) => name
                .rsplit('.')
                .next()
                .is_some_and(|e| e.eq_ignore_ascii_case(ext)),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tristate_resolve() {
        assert!(Tristate::Default.resolve(true));
        assert!(!Tristate::Default.resolve(false));
        assert!(!Tristate::No.resolve(true));
        assert!(Tristate::Yes.resolve(false));
    }

    #[test]
    fn test_input_ext() {
        let mut opt = PackOptions::default();
        assert!(!opt.input_has_ext("scr"));
        opt.input_name = Some("saver.SCR".into());
        assert!(opt.input_has_ext("scr"));
        opt.input_name = Some("app.exe".into());
        assert!(!opt.input_has_ext("scr"));
    }
}
