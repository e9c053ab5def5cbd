//! Record types of the 64-bit ELF format.

use byteorder::{ByteOrder, LittleEndian};

/// Byte length of the ELF file header
pub const EHDR_SIZE: usize = 64;
/// Byte length of one section header
pub const SHDR_SIZE: usize = 64;
/// Byte length of one symbol record
pub const SYM_SIZE: usize = 24;
/// Byte length of one relocation record (without addend)
pub const REL_SIZE: usize = 16;

/// ELF file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Elf64Ehdr {
    /// Identification bytes (magic, class, data encoding, version)
    pub e_ident: [u8; 16],
    /// Object file type
    pub e_type: u16,
    /// Architecture
    pub e_machine: u16,
    /// Object file version
    pub e_version: u32,
    /// Entry point virtual address
    pub e_entry: u64,
    /// Program header table file offset
    pub e_phoff: u64,
    /// Section header table file offset
    pub e_shoff: u64,
    /// Processor-specific flags
    pub e_flags: u32,
    /// File header size in bytes
    pub e_ehsize: u16,
    /// Program header entry size
    pub e_phentsize: u16,
    /// Number of program header entries
    pub e_phnum: u16,
    /// Section header entry size
    pub e_shentsize: u16,
    /// Number of section header entries
    pub e_shnum: u16,
    /// Section header string table index
    pub e_shstrndx: u16,
}

impl Elf64Ehdr {
    pub(crate) fn parse(bytes: &[u8]) -> Elf64Ehdr {
        let mut e_ident = [0u8; 16];
        e_ident.copy_from_slice(&bytes[..16]);
        Elf64Ehdr {
            e_ident,
            e_type: LittleEndian::read_u16(&bytes[16..]),
            e_machine: LittleEndian::read_u16(&bytes[18..]),
            e_version: LittleEndian::read_u32(&bytes[20..]),
            e_entry: LittleEndian::read_u64(&bytes[24..]),
            e_phoff: LittleEndian::read_u64(&bytes[32..]),
            e_shoff: LittleEndian::read_u64(&bytes[40..]),
            e_flags: LittleEndian::read_u32(&bytes[48..]),
            e_ehsize: LittleEndian::read_u16(&bytes[52..]),
            e_phentsize: LittleEndian::read_u16(&bytes[54..]),
            e_phnum: LittleEndian::read_u16(&bytes[56..]),
            e_shentsize: LittleEndian::read_u16(&bytes[58..]),
            e_shnum: LittleEndian::read_u16(&bytes[60..]),
            e_shstrndx: LittleEndian::read_u16(&bytes[62..]),
        }
    }
}

/// Section header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Elf64Shdr {
    /// Offset of the section name in the section header string table
    pub sh_name: u32,
    /// Section type
    pub sh_type: u32,
    /// Section flags
    pub sh_flags: u64,
    /// Virtual address at execution
    pub sh_addr: u64,
    /// Section file offset
    pub sh_offset: u64,
    /// Section size in bytes
    pub sh_size: u64,
    /// Link to another section
    pub sh_link: u32,
    /// Additional section information
    pub sh_info: u32,
    /// Section alignment
    pub sh_addralign: u64,
    /// Entry size if the section holds a table
    pub sh_entsize: u64,
}

impl Elf64Shdr {
    pub(crate) fn parse(bytes: &[u8]) -> Elf64Shdr {
        Elf64Shdr {
            sh_name: LittleEndian::read_u32(&bytes[0..]),
            sh_type: LittleEndian::read_u32(&bytes[4..]),
            sh_flags: LittleEndian::read_u64(&bytes[8..]),
            sh_addr: LittleEndian::read_u64(&bytes[16..]),
            sh_offset: LittleEndian::read_u64(&bytes[24..]),
            sh_size: LittleEndian::read_u64(&bytes[32..]),
            sh_link: LittleEndian::read_u32(&bytes[40..]),
            sh_info: LittleEndian::read_u32(&bytes[44..]),
            sh_addralign: LittleEndian::read_u64(&bytes[48..]),
            sh_entsize: LittleEndian::read_u64(&bytes[56..]),
        }
    }
}

/// Symbol record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Elf64Sym {
    /// Offset of the symbol name in the linked string table
    pub st_name: u32,
    /// Binding and type
    pub st_info: u8,
    /// Visibility
    pub st_other: u8,
    /// Index of the section the symbol refers to
    pub st_shndx: u16,
    /// Symbol value
    pub st_value: u64,
    /// Symbol size
    pub st_size: u64,
}

impl Elf64Sym {
    pub(crate) fn parse(bytes: &[u8]) -> Elf64Sym {
        Elf64Sym {
            st_name: LittleEndian::read_u32(&bytes[0..]),
            st_info: bytes[4],
            st_other: bytes[5],
            st_shndx: LittleEndian::read_u16(&bytes[6..]),
            st_value: LittleEndian::read_u64(&bytes[8..]),
            st_size: LittleEndian::read_u64(&bytes[16..]),
        }
    }

    /// Binding half of `st_info`
    pub fn st_bind(&self) -> u8 {
        self.st_info >> 4
    }
}

/// Relocation record without addend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Elf64Rel {
    /// Location to apply the relocation at
    pub r_offset: u64,
    /// Symbol index and relocation type
    pub r_info: u64,
}

impl Elf64Rel {
    pub(crate) fn parse(bytes: &[u8]) -> Elf64Rel {
        Elf64Rel {
            r_offset: LittleEndian::read_u64(&bytes[0..]),
            r_info: LittleEndian::read_u64(&bytes[8..]),
        }
    }

    /// Index of the referenced symbol
    pub fn r_sym(&self) -> u32 {
        (self.r_info >> 32) as u32
    }

    /// Relocation type
    pub fn r_type(&self) -> u32 {
        self.r_info as u32
    }
}
