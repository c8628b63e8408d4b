//! Mach-O 64-bit Executable Generation
//!
//! Generates self-contained macOS arm64 executables. No external linker
//! required: the builder lays out the segments, resolves every page-relative
//! reference of the generated code, and writes the chained-fixups metadata
//! dyld needs to bind `_printf` and `_exit` from libSystem.
//!
//! ## File layout
//!
//! ```text
//! 0x0000  mach header + load commands
//! 0x4000  __TEXT,__text      code
//!         __TEXT,__cstring   interned strings
//!         __TEXT,__const     interned doubles (8-aligned)
//! page    __DATA_CONST,__got two chained bind pointers
//! page    __LINKEDIT         chained fixups, exports trie
//! ```

use std::io::{self, Write};

use tracing::{debug, trace};

use super::codegen::{DataRef, Import, MachineImage};
use super::data::DataLabel;
use super::encoding::{patch_adrp, patch_imm12, read_insn, write_insn};
use crate::{JibJabError, Result};

/// Mach-O file format constants
pub mod consts {
    // Magic numbers
    pub const MH_MAGIC_64: u32 = 0xFEED_FACF;

    // CPU types
    pub const CPU_TYPE_ARM64: i32 = 0x0100_000C; // CPU_TYPE_ARM | CPU_ARCH_ABI64
    pub const CPU_SUBTYPE_ARM64_ALL: i32 = 0;

    // File types
    pub const MH_EXECUTE: u32 = 2;

    // Flags
    pub const MH_NOUNDEFS: u32 = 0x0000_0001;
    pub const MH_DYLDLINK: u32 = 0x0000_0004;
    pub const MH_TWOLEVEL: u32 = 0x0000_0080;
    pub const MH_PIE: u32 = 0x0020_0000;

    // Load command types
    pub const LC_SEGMENT_64: u32 = 0x19;
    pub const LC_SYMTAB: u32 = 0x2;
    pub const LC_DYSYMTAB: u32 = 0xB;
    pub const LC_LOAD_DYLIB: u32 = 0xC;
    pub const LC_LOAD_DYLINKER: u32 = 0xE;
    pub const LC_BUILD_VERSION: u32 = 0x32;
    pub const LC_MAIN: u32 = 0x8000_0028;
    pub const LC_DYLD_EXPORTS_TRIE: u32 = 0x8000_0033;
    pub const LC_DYLD_CHAINED_FIXUPS: u32 = 0x8000_0034;

    // Segment protection
    pub const VM_PROT_NONE: i32 = 0x00;
    pub const VM_PROT_READ: i32 = 0x01;
    pub const VM_PROT_WRITE: i32 = 0x02;
    pub const VM_PROT_EXECUTE: i32 = 0x04;

    // Segment flags
    pub const SG_READ_ONLY: u32 = 0x10;

    // Section types and attributes
    pub const S_REGULAR: u32 = 0x00;
    pub const S_CSTRING_LITERALS: u32 = 0x02;
    pub const S_NON_LAZY_SYMBOL_POINTERS: u32 = 0x06;
    pub const S_ATTR_PURE_INSTRUCTIONS: u32 = 0x8000_0000;
    pub const S_ATTR_SOME_INSTRUCTIONS: u32 = 0x0000_0400;

    // Build version
    pub const PLATFORM_MACOS: u32 = 1;
    pub const MACOS_11_0: u32 = 0x000B_0000;

    // dylib versions (1.0.0)
    pub const DYLIB_VERSION_1_0_0: u32 = 0x0001_0000;

    // Chained fixups
    pub const DYLD_CHAINED_PTR_64: u16 = 2;
    pub const DYLD_CHAINED_IMPORT: u32 = 1;
    pub const CHAINED_FIXUPS_HEADER_SIZE: u32 = 28;

    // Header and command sizes
    pub const MACH_HEADER_64_SIZE: u32 = 32;
    pub const SEGMENT_COMMAND_64_SIZE: u32 = 72;
    pub const SECTION_64_SIZE: u32 = 80;
    pub const LINKEDIT_DATA_COMMAND_SIZE: u32 = 16;
    pub const SYMTAB_COMMAND_SIZE: u32 = 24;
    pub const DYSYMTAB_COMMAND_SIZE: u32 = 80;
    pub const DYLINKER_COMMAND_SIZE: u32 = 32;
    pub const BUILD_VERSION_COMMAND_SIZE: u32 = 24;
    pub const ENTRY_POINT_COMMAND_SIZE: u32 = 24;
    pub const DYLIB_COMMAND_SIZE: u32 = 56;

    // Paths
    pub const DYLD_PATH: &str = "/usr/lib/dyld";
    pub const LIBSYSTEM_PATH: &str = "/usr/lib/libSystem.B.dylib";

    // Address space
    pub const PAGE_SIZE: u64 = 0x4000; // 16KB, Apple Silicon
    pub const IMAGE_BASE: u64 = 0x1_0000_0000;
}

/// Fixed-size, NUL-padded segment or section name
fn name16(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    let len = name.len().min(16);
    out[..len].copy_from_slice(&name.as_bytes()[..len]);
    out
}

/// Mach-O 64-bit header
#[derive(Debug, Clone)]
pub struct MachHeader64 {
    pub magic: u32,
    pub cputype: i32,
    pub cpusubtype: i32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
    pub reserved: u32,
}

impl Default for MachHeader64 {
    fn default() -> Self {
        Self {
            magic: consts::MH_MAGIC_64,
            cputype: consts::CPU_TYPE_ARM64,
            cpusubtype: consts::CPU_SUBTYPE_ARM64_ALL,
            filetype: consts::MH_EXECUTE,
            ncmds: 0,
            sizeofcmds: 0,
            flags: consts::MH_NOUNDEFS | consts::MH_DYLDLINK | consts::MH_TWOLEVEL | consts::MH_PIE,
            reserved: 0,
        }
    }
}

impl MachHeader64 {
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.magic.to_le_bytes())?;
        w.write_all(&self.cputype.to_le_bytes())?;
        w.write_all(&self.cpusubtype.to_le_bytes())?;
        w.write_all(&self.filetype.to_le_bytes())?;
        w.write_all(&self.ncmds.to_le_bytes())?;
        w.write_all(&self.sizeofcmds.to_le_bytes())?;
        w.write_all(&self.flags.to_le_bytes())?;
        w.write_all(&self.reserved.to_le_bytes())?;
        Ok(())
    }
}

/// LC_SEGMENT_64 load command with its sections
#[derive(Debug, Clone)]
pub struct SegmentCommand64 {
    pub segname: [u8; 16],
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: i32,
    pub initprot: i32,
    pub flags: u32,
    pub sections: Vec<Section64>,
}

impl SegmentCommand64 {
    pub fn new(name: &str, prot: i32) -> Self {
        Self {
            segname: name16(name),
            vmaddr: 0,
            vmsize: 0,
            fileoff: 0,
            filesize: 0,
            maxprot: prot,
            initprot: prot,
            flags: 0,
            sections: Vec::new(),
        }
    }

    pub fn cmdsize(&self) -> u32 {
        consts::SEGMENT_COMMAND_64_SIZE + consts::SECTION_64_SIZE * self.sections.len() as u32
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&consts::LC_SEGMENT_64.to_le_bytes())?;
        w.write_all(&self.cmdsize().to_le_bytes())?;
        w.write_all(&self.segname)?;
        w.write_all(&self.vmaddr.to_le_bytes())?;
        w.write_all(&self.vmsize.to_le_bytes())?;
        w.write_all(&self.fileoff.to_le_bytes())?;
        w.write_all(&self.filesize.to_le_bytes())?;
        w.write_all(&self.maxprot.to_le_bytes())?;
        w.write_all(&self.initprot.to_le_bytes())?;
        w.write_all(&(self.sections.len() as u32).to_le_bytes())?;
        w.write_all(&self.flags.to_le_bytes())?;
        for section in &self.sections {
            section.write(w)?;
        }
        Ok(())
    }
}

/// Section 64-bit structure
#[derive(Debug, Clone)]
pub struct Section64 {
    pub sectname: [u8; 16],
    pub segname: [u8; 16],
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    /// Power of two
    pub align: u32,
    pub flags: u32,
}

impl Section64 {
    pub fn new(segment: &str, name: &str, align: u32, flags: u32) -> Self {
        Self {
            sectname: name16(name),
            segname: name16(segment),
            addr: 0,
            size: 0,
            offset: 0,
            align,
            flags,
        }
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.sectname)?;
        w.write_all(&self.segname)?;
        w.write_all(&self.addr.to_le_bytes())?;
        w.write_all(&self.size.to_le_bytes())?;
        w.write_all(&self.offset.to_le_bytes())?;
        w.write_all(&self.align.to_le_bytes())?;
        // reloff, nreloc, flags, reserved1-3
        w.write_all(&0u32.to_le_bytes())?;
        w.write_all(&0u32.to_le_bytes())?;
        w.write_all(&self.flags.to_le_bytes())?;
        w.write_all(&[0u8; 12])?;
        Ok(())
    }
}

/// LC_DYLD_CHAINED_FIXUPS / LC_DYLD_EXPORTS_TRIE
#[derive(Debug, Clone)]
pub struct LinkeditDataCommand {
    pub cmd: u32,
    pub dataoff: u32,
    pub datasize: u32,
}

impl LinkeditDataCommand {
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.cmd.to_le_bytes())?;
        w.write_all(&consts::LINKEDIT_DATA_COMMAND_SIZE.to_le_bytes())?;
        w.write_all(&self.dataoff.to_le_bytes())?;
        w.write_all(&self.datasize.to_le_bytes())?;
        Ok(())
    }
}

/// LC_SYMTAB with no symbols; both tables point at the end of __LINKEDIT
#[derive(Debug, Clone)]
pub struct SymtabCommand {
    pub offset: u32,
}

impl SymtabCommand {
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&consts::LC_SYMTAB.to_le_bytes())?;
        w.write_all(&consts::SYMTAB_COMMAND_SIZE.to_le_bytes())?;
        w.write_all(&self.offset.to_le_bytes())?; // symoff
        w.write_all(&0u32.to_le_bytes())?; // nsyms
        w.write_all(&self.offset.to_le_bytes())?; // stroff
        w.write_all(&0u32.to_le_bytes())?; // strsize
        Ok(())
    }
}

fn write_dysymtab<W: Write>(w: &mut W) -> io::Result<()> {
    w.write_all(&consts::LC_DYSYMTAB.to_le_bytes())?;
    w.write_all(&consts::DYSYMTAB_COMMAND_SIZE.to_le_bytes())?;
    w.write_all(&[0u8; (consts::DYSYMTAB_COMMAND_SIZE - 8) as usize])
}

/// Write a load command whose fixed fields are followed by a NUL-padded path
fn write_path_command<W: Write>(
    w: &mut W,
    cmd: u32,
    cmdsize: u32,
    fields: &[u32],
    path: &str,
) -> io::Result<()> {
    let name_offset = 8 + 4 * fields.len();
    if name_offset + path.len() >= cmdsize as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path `{}` does not fit a {}-byte load command", path, cmdsize),
        ));
    }
    w.write_all(&cmd.to_le_bytes())?;
    w.write_all(&cmdsize.to_le_bytes())?;
    for field in fields {
        w.write_all(&field.to_le_bytes())?;
    }
    w.write_all(path.as_bytes())?;
    w.write_all(&vec![0u8; cmdsize as usize - name_offset - path.len()])
}

/// LC_LOAD_DYLINKER
fn write_dylinker<W: Write>(w: &mut W) -> io::Result<()> {
    // name offset
    write_path_command(
        w,
        consts::LC_LOAD_DYLINKER,
        consts::DYLINKER_COMMAND_SIZE,
        &[12],
        consts::DYLD_PATH,
    )
}

/// LC_LOAD_DYLIB for libSystem
fn write_libsystem<W: Write>(w: &mut W) -> io::Result<()> {
    // name offset, timestamp, current version, compatibility version
    write_path_command(
        w,
        consts::LC_LOAD_DYLIB,
        consts::DYLIB_COMMAND_SIZE,
        &[24, 0, consts::DYLIB_VERSION_1_0_0, consts::DYLIB_VERSION_1_0_0],
        consts::LIBSYSTEM_PATH,
    )
}

/// LC_BUILD_VERSION: macOS 11.0, no tools
fn write_build_version<W: Write>(w: &mut W) -> io::Result<()> {
    w.write_all(&consts::LC_BUILD_VERSION.to_le_bytes())?;
    w.write_all(&consts::BUILD_VERSION_COMMAND_SIZE.to_le_bytes())?;
    w.write_all(&consts::PLATFORM_MACOS.to_le_bytes())?;
    w.write_all(&consts::MACOS_11_0.to_le_bytes())?; // minos
    w.write_all(&consts::MACOS_11_0.to_le_bytes())?; // sdk
    w.write_all(&0u32.to_le_bytes())?; // ntools
    Ok(())
}

/// LC_MAIN entry point command
#[derive(Debug, Clone, Default)]
pub struct EntryPointCommand {
    pub entryoff: u64, // File offset to main()
    pub stacksize: u64,
}

impl EntryPointCommand {
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&consts::LC_MAIN.to_le_bytes())?;
        w.write_all(&consts::ENTRY_POINT_COMMAND_SIZE.to_le_bytes())?;
        w.write_all(&self.entryoff.to_le_bytes())?;
        w.write_all(&self.stacksize.to_le_bytes())?;
        Ok(())
    }
}

/// Chained-fixups payload for a `__got` of `Import::ALL.len()` bind pointers
/// in segment 2 (`__DATA_CONST`)
pub fn chained_fixups(data_const_offset: u64) -> Vec<u8> {
    const STARTS_OFFSET: u32 = 32;
    const SEG_COUNT: u32 = 4;
    const DATA_CONST_INDEX: usize = 2;
    // seg_count + offsets, rounded up to 8
    const SEG_INFO_OFFSET: u32 = 24;
    const STARTS_IN_SEGMENT_SIZE: u32 = 24;
    const IMPORTS_OFFSET: u32 = STARTS_OFFSET + SEG_INFO_OFFSET + STARTS_IN_SEGMENT_SIZE;

    let mut symbols = Vec::new();
    let mut imports = Vec::new();
    for import in Import::ALL {
        let name_offset = symbols.len() as u32;
        symbols.extend_from_slice(import.symbol().as_bytes());
        symbols.push(0);
        // lib_ordinal 1 (libSystem), not weak
        imports.push(1 | (name_offset << 9));
    }
    let symbols_offset = IMPORTS_OFFSET + 4 * imports.len() as u32;

    let mut out = Vec::new();
    // dyld_chained_fixups_header
    for field in [
        0, // fixups_version
        STARTS_OFFSET,
        IMPORTS_OFFSET,
        symbols_offset,
        imports.len() as u32,
        consts::DYLD_CHAINED_IMPORT,
        0, // symbols_format: uncompressed
    ] {
        out.extend_from_slice(&field.to_le_bytes());
    }
    debug_assert_eq!(out.len() as u32, consts::CHAINED_FIXUPS_HEADER_SIZE);
    out.resize(STARTS_OFFSET as usize, 0);

    // dyld_chained_starts_in_image
    out.extend_from_slice(&SEG_COUNT.to_le_bytes());
    for index in 0..SEG_COUNT as usize {
        let offset = if index == DATA_CONST_INDEX { SEG_INFO_OFFSET } else { 0 };
        out.extend_from_slice(&offset.to_le_bytes());
    }
    out.resize((STARTS_OFFSET + SEG_INFO_OFFSET) as usize, 0);

    // dyld_chained_starts_in_segment
    out.extend_from_slice(&STARTS_IN_SEGMENT_SIZE.to_le_bytes());
    out.extend_from_slice(&(consts::PAGE_SIZE as u16).to_le_bytes());
    out.extend_from_slice(&consts::DYLD_CHAINED_PTR_64.to_le_bytes());
    out.extend_from_slice(&data_const_offset.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // max_valid_pointer
    out.extend_from_slice(&1u16.to_le_bytes()); // page_count
    out.extend_from_slice(&0u16.to_le_bytes()); // page_start[0]

    for import in imports {
        out.extend_from_slice(&import.to_le_bytes());
    }
    out.extend_from_slice(&symbols);
    out.resize(align_to(out.len() as u64, 8) as usize, 0);
    out
}

/// `__got` contents: one DYLD_CHAINED_PTR_64 bind per import, chained in
/// order
pub fn got_binds() -> Vec<u8> {
    let count = Import::ALL.len();
    let mut out = Vec::with_capacity(count * 8);
    for (i, import) in Import::ALL.iter().enumerate() {
        let ordinal = import.got_index() as u64;
        // stride 4 bytes; 0 ends the chain
        let next: u64 = if i + 1 < count { 2 } else { 0 };
        let bind = ordinal | (next << 51) | (1 << 63);
        out.extend_from_slice(&bind.to_le_bytes());
    }
    out
}

/// Final placement of everything the code refers to
#[derive(Debug, Clone, Copy)]
struct Placement {
    text_offset: u64,
    cstring_offset: u64,
    const_offset: u64,
    got_offset: u64,
}

impl Placement {
    fn address(&self, image: &MachineImage, target: DataRef) -> Result<u64> {
        let address = match target {
            DataRef::Data(label) => {
                let offset = image.data.offset_of(label).ok_or_else(|| JibJabError::Internal {
                    message: format!("data label {:?} was never interned", label),
                })? as u64;
                let section = match label {
                    DataLabel::Str(_) => self.cstring_offset,
                    DataLabel::Double(_) => self.const_offset,
                };
                section + offset
            }
            DataRef::Got(import) => self.got_offset + import.got_index() as u64 * 8,
        };
        Ok(consts::IMAGE_BASE + address)
    }
}

/// Mach-O 64-bit arm64 executable builder
#[derive(Debug)]
pub struct MachOBuilder {
    image: MachineImage,
}

impl MachOBuilder {
    pub fn new(image: MachineImage) -> Self {
        Self { image }
    }

    /// Build the complete Mach-O file
    pub fn build(mut self) -> Result<Vec<u8>> {
        let page = consts::PAGE_SIZE;
        let has_cstrings = !self.image.data.cstrings.is_empty();
        let has_consts = !self.image.data.doubles.is_empty();

        // Section placement inside __TEXT
        let text_offset = page;
        let code_size = self.image.code.len() as u64;
        let cstring_offset = text_offset + code_size;
        let cstring_size = self.image.data.cstrings.len() as u64;
        let const_offset = align_to(cstring_offset + cstring_size, 8);
        let const_size = self.image.data.doubles.len() as u64;
        let text_end = align_to(const_offset + const_size, page);

        let data_const_offset = text_end;
        let got = got_binds();

        let linkedit_offset = data_const_offset + page;
        let fixups = chained_fixups(data_const_offset);
        let exports_offset = linkedit_offset + fixups.len() as u64;
        let exports = vec![0u8; 8]; // empty trie root, padded
        let linkedit_size = fixups.len() as u64 + exports.len() as u64;
        let file_size = linkedit_offset + linkedit_size;

        let placement = Placement {
            text_offset,
            cstring_offset,
            const_offset,
            got_offset: data_const_offset,
        };
        self.resolve_data_fixups(&placement)?;

        // Segments
        let mut pagezero = SegmentCommand64::new("__PAGEZERO", consts::VM_PROT_NONE);
        pagezero.vmsize = consts::IMAGE_BASE;

        let mut text = SegmentCommand64::new(
            "__TEXT",
            consts::VM_PROT_READ | consts::VM_PROT_EXECUTE,
        );
        text.vmaddr = consts::IMAGE_BASE;
        text.vmsize = text_end;
        text.filesize = text_end;
        let mut code = Section64::new(
            "__TEXT",
            "__text",
            2,
            consts::S_REGULAR | consts::S_ATTR_PURE_INSTRUCTIONS | consts::S_ATTR_SOME_INSTRUCTIONS,
        );
        code.addr = consts::IMAGE_BASE + text_offset;
        code.size = code_size;
        code.offset = text_offset as u32;
        text.sections.push(code);
        if has_cstrings {
            let mut cstrings = Section64::new("__TEXT", "__cstring", 0, consts::S_CSTRING_LITERALS);
            cstrings.addr = consts::IMAGE_BASE + cstring_offset;
            cstrings.size = cstring_size;
            cstrings.offset = cstring_offset as u32;
            text.sections.push(cstrings);
        }
        if has_consts {
            let mut doubles = Section64::new("__TEXT", "__const", 3, consts::S_REGULAR);
            doubles.addr = consts::IMAGE_BASE + const_offset;
            doubles.size = const_size;
            doubles.offset = const_offset as u32;
            text.sections.push(doubles);
        }

        let mut data_const = SegmentCommand64::new(
            "__DATA_CONST",
            consts::VM_PROT_READ | consts::VM_PROT_WRITE,
        );
        data_const.vmaddr = consts::IMAGE_BASE + data_const_offset;
        data_const.vmsize = page;
        data_const.fileoff = data_const_offset;
        data_const.filesize = page;
        data_const.flags = consts::SG_READ_ONLY;
        let mut got_section = Section64::new(
            "__DATA_CONST",
            "__got",
            3,
            consts::S_NON_LAZY_SYMBOL_POINTERS,
        );
        got_section.addr = consts::IMAGE_BASE + data_const_offset;
        got_section.size = got.len() as u64;
        got_section.offset = data_const_offset as u32;
        data_const.sections.push(got_section);

        let mut linkedit = SegmentCommand64::new("__LINKEDIT", consts::VM_PROT_READ);
        linkedit.vmaddr = consts::IMAGE_BASE + linkedit_offset;
        linkedit.vmsize = align_to(linkedit_size, page);
        linkedit.fileoff = linkedit_offset;
        linkedit.filesize = linkedit_size;

        let fixups_cmd = LinkeditDataCommand {
            cmd: consts::LC_DYLD_CHAINED_FIXUPS,
            dataoff: linkedit_offset as u32,
            datasize: fixups.len() as u32,
        };
        let exports_cmd = LinkeditDataCommand {
            cmd: consts::LC_DYLD_EXPORTS_TRIE,
            dataoff: exports_offset as u32,
            datasize: exports.len() as u32,
        };
        let symtab = SymtabCommand {
            offset: file_size as u32,
        };
        let entry = EntryPointCommand {
            entryoff: text_offset + self.image.entry_offset as u64,
            ..Default::default()
        };

        let segments = [&pagezero, &text, &data_const, &linkedit];
        let sizeofcmds = segments.iter().map(|s| s.cmdsize()).sum::<u32>()
            + 2 * consts::LINKEDIT_DATA_COMMAND_SIZE
            + consts::SYMTAB_COMMAND_SIZE
            + consts::DYSYMTAB_COMMAND_SIZE
            + consts::DYLINKER_COMMAND_SIZE
            + consts::BUILD_VERSION_COMMAND_SIZE
            + consts::ENTRY_POINT_COMMAND_SIZE
            + consts::DYLIB_COMMAND_SIZE;
        if (consts::MACH_HEADER_64_SIZE + sizeofcmds) as u64 > text_offset {
            return Err(JibJabError::Internal {
                message: "load commands overflow the first page".to_string(),
            });
        }
        let header = MachHeader64 {
            ncmds: segments.len() as u32 + 8,
            sizeofcmds,
            ..Default::default()
        };

        let mut buf = Vec::with_capacity(file_size as usize);
        header.write(&mut buf)?;
        for segment in segments {
            segment.write(&mut buf)?;
        }
        fixups_cmd.write(&mut buf)?;
        exports_cmd.write(&mut buf)?;
        symtab.write(&mut buf)?;
        write_dysymtab(&mut buf)?;
        write_dylinker(&mut buf)?;
        write_build_version(&mut buf)?;
        entry.write(&mut buf)?;
        write_libsystem(&mut buf)?;

        buf.resize(text_offset as usize, 0);
        buf.extend_from_slice(&self.image.code);
        buf.extend_from_slice(&self.image.data.cstrings);
        buf.resize(const_offset as usize, 0);
        buf.extend_from_slice(&self.image.data.doubles);
        buf.resize(data_const_offset as usize, 0);
        buf.extend_from_slice(&got);
        buf.resize(linkedit_offset as usize, 0);
        buf.extend_from_slice(&fixups);
        buf.extend_from_slice(&exports);

        debug!(
            file_size = buf.len(),
            code_bytes = code_size,
            cstring_bytes = cstring_size,
            const_bytes = const_size,
            "wrote mach-o image"
        );
        Ok(buf)
    }

    /// Fill in the page delta of every ADRP and the page offset of the
    /// instruction that follows it
    fn resolve_data_fixups(&mut self, placement: &Placement) -> Result<()> {
        for fixup in &self.image.data_fixups {
            let target = placement.address(&self.image, fixup.target)?;
            let pc = consts::IMAGE_BASE + placement.text_offset + fixup.site as u64;
            let pages = ((target & !0xFFF) as i64 - (pc & !0xFFF) as i64) >> 12;
            let page_offset = (target & 0xFFF) as u32;
            // ADD takes the byte offset; 64-bit loads take it in words
            let imm12 = match fixup.target {
                DataRef::Data(DataLabel::Str(_)) => page_offset,
                DataRef::Data(DataLabel::Double(_)) | DataRef::Got(_) => {
                    page_offset / 8
                }
            };

            let code = &mut self.image.code;
            let broken = || JibJabError::Internal {
                message: format!("malformed address computation at {:#x}", fixup.site),
            };
            let adrp = read_insn(code, fixup.site).and_then(|insn| patch_adrp(insn, pages));
            let second = read_insn(code, fixup.site + 4).and_then(|insn| patch_imm12(insn, imm12));
            let (adrp, second) = adrp.zip(second).ok_or_else(broken)?;
            write_insn(code, fixup.site, adrp).ok_or_else(broken)?;
            write_insn(code, fixup.site + 4, second).ok_or_else(broken)?;
            trace!(site = fixup.site, target, "patched adrp");
        }
        Ok(())
    }
}

/// Align value up to the next multiple of alignment
fn align_to(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}
