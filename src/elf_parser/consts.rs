//! Constants of the ELF file format used by the parser.

/// Magic number at the start of every ELF file
pub const ELFMAG: [u8; 4] = [0x7f, 0x45, 0x4c, 0x46];

/// Index of the class byte in `e_ident`
pub const EI_CLASS: usize = 4;
/// Index of the data-encoding byte in `e_ident`
pub const EI_DATA: usize = 5;
/// Index of the version byte in `e_ident`
pub const EI_VERSION: usize = 6;

/// 64-bit object class
pub const ELFCLASS64: u8 = 2;
/// Little-endian data encoding
pub const ELFDATA2LSB: u8 = 1;
/// Big-endian data encoding
pub const ELFDATA2MSB: u8 = 2;
/// The current (and only) ELF version
pub const EV_CURRENT: u8 = 1;

/// Relocatable object file
pub const ET_REL: u16 = 1;
/// Machine code left unset by old toolchains
pub const EM_NONE: u16 = 0;
/// Machine code of eBPF bytecode objects
pub const EM_BPF: u16 = 247;

/// Section type: program-defined contents
pub const SHT_PROGBITS: u32 = 1;
/// Section type: symbol table
pub const SHT_SYMTAB: u32 = 2;
/// Section type: string table
pub const SHT_STRTAB: u32 = 3;
/// Section type: zero-initialized data, occupies no file space
pub const SHT_NOBITS: u32 = 8;
/// Section type: relocation entries without addends
pub const SHT_REL: u32 = 9;

/// Section flag: holds executable instructions
pub const SHF_EXECINSTR: u64 = 0x4;

/// Symbol binding: global
pub const STB_GLOBAL: u8 = 1;
