//! Minimal parser for relocatable 64-bit ELF objects.
//!
//! Only the little-endian `ELFCLASS64` layout is supported; the loader
//! rejects everything else before it ever inspects section contents.

pub mod consts;
pub mod types;

use crate::elf_parser::{
    consts::{EI_CLASS, EI_DATA, EI_VERSION, ELFCLASS64, ELFDATA2LSB, ELFMAG, EV_CURRENT,
        SHT_NOBITS},
    types::{Elf64Ehdr, Elf64Rel, Elf64Shdr, Elf64Sym, EHDR_SIZE, REL_SIZE, SHDR_SIZE, SYM_SIZE},
};

/// Error definitions
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ElfParserError {
    /// The file header is malformed or not an ELF header at all
    #[error("invalid file header")]
    InvalidFileHeader,
    /// The object is not encoded little-endian
    #[error("wrong endianness")]
    WrongEndianness,
    /// A section header is malformed
    #[error("invalid section header")]
    InvalidSectionHeader,
    /// A table's size is not a multiple of its entry size
    #[error("invalid size")]
    InvalidSize,
    /// A string is unterminated or outside its string table
    #[error("invalid string")]
    InvalidString,
    /// The section name string table is missing
    #[error("no section name string table")]
    NoSectionNameStringTable,
    /// An offset or size reaches past the end of the file
    #[error("out of bounds")]
    OutOfBounds,
}

/// A parsed relocatable ELF object borrowing the underlying bytes.
#[derive(Debug, PartialEq, Eq)]
pub struct Elf64<'a> {
    bytes: &'a [u8],
    file_header: Elf64Ehdr,
    section_headers: Vec<Elf64Shdr>,
}

impl<'a> Elf64<'a> {
    /// Parses the file header and section header table.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ElfParserError> {
        if bytes.len() < EHDR_SIZE {
            return Err(ElfParserError::OutOfBounds);
        }
        if bytes[..4] != ELFMAG {
            return Err(ElfParserError::InvalidFileHeader);
        }
        if bytes[EI_DATA] != ELFDATA2LSB {
            return Err(ElfParserError::WrongEndianness);
        }
        if bytes[EI_CLASS] != ELFCLASS64 || bytes[EI_VERSION] != EV_CURRENT {
            return Err(ElfParserError::InvalidFileHeader);
        }
        let file_header = Elf64Ehdr::parse(bytes);

        if file_header.e_shnum > 0 && file_header.e_shentsize as usize != SHDR_SIZE {
            return Err(ElfParserError::InvalidSectionHeader);
        }
        let table_size = (file_header.e_shnum as usize).saturating_mul(SHDR_SIZE);
        let table_end = (file_header.e_shoff as usize)
            .checked_add(table_size)
            .ok_or(ElfParserError::OutOfBounds)?;
        if table_end > bytes.len() {
            return Err(ElfParserError::OutOfBounds);
        }
        let section_headers = bytes[file_header.e_shoff as usize..table_end]
            .chunks(SHDR_SIZE)
            .map(Elf64Shdr::parse)
            .collect::<Vec<_>>();

        if file_header.e_shnum > 0 && file_header.e_shstrndx >= file_header.e_shnum {
            return Err(ElfParserError::NoSectionNameStringTable);
        }

        Ok(Self {
            bytes,
            file_header,
            section_headers,
        })
    }

    /// Returns the file header.
    pub fn file_header(&self) -> &Elf64Ehdr {
        &self.file_header
    }

    /// Returns the section header table.
    pub fn section_header_table(&self) -> &[Elf64Shdr] {
        &self.section_headers
    }

    /// Returns the bytes of a section's body.
    ///
    /// `SHT_NOBITS` sections occupy no file space and yield an empty slice.
    pub fn section_data(&self, section_header: &Elf64Shdr) -> Result<&'a [u8], ElfParserError> {
        if section_header.sh_type == SHT_NOBITS {
            return Ok(&[]);
        }
        let start = section_header.sh_offset as usize;
        let end = (section_header.sh_offset)
            .checked_add(section_header.sh_size)
            .ok_or(ElfParserError::OutOfBounds)? as usize;
        self.bytes.get(start..end).ok_or(ElfParserError::OutOfBounds)
    }

    /// Looks a section's name up in the section header string table.
    pub fn section_name(&self, sh_name: u32) -> Result<&'a [u8], ElfParserError> {
        let strtab = self
            .section_headers
            .get(self.file_header.e_shstrndx as usize)
            .ok_or(ElfParserError::NoSectionNameStringTable)?;
        self.get_string(strtab, sh_name)
    }

    /// Fetches a NUL-terminated string out of a string table section.
    pub fn get_string(
        &self,
        strtab: &Elf64Shdr,
        offset: u32,
    ) -> Result<&'a [u8], ElfParserError> {
        let data = self.section_data(strtab)?;
        let tail = data.get(offset as usize..).ok_or(ElfParserError::InvalidString)?;
        let end = tail
            .iter()
            .position(|&byte| byte == 0x00)
            .ok_or(ElfParserError::InvalidString)?;
        Ok(&tail[..end])
    }

    /// Decodes a symbol table section.
    pub fn symbols(&self, section_header: &Elf64Shdr) -> Result<Vec<Elf64Sym>, ElfParserError> {
        let data = self.section_data(section_header)?;
        if data.len() % SYM_SIZE != 0 {
            return Err(ElfParserError::InvalidSize);
        }
        Ok(data.chunks(SYM_SIZE).map(Elf64Sym::parse).collect())
    }

    /// Decodes a `SHT_REL` relocation section.
    pub fn relocations(&self, section_header: &Elf64Shdr) -> Result<Vec<Elf64Rel>, ElfParserError> {
        let entsize = if section_header.sh_entsize == 0 {
            REL_SIZE as u64
        } else {
            section_header.sh_entsize
        };
        if entsize != REL_SIZE as u64 {
            return Err(ElfParserError::InvalidSize);
        }
        let data = self.section_data(section_header)?;
        if data.len() % REL_SIZE != 0 {
            return Err(ElfParserError::InvalidSize);
        }
        Ok(data.chunks(REL_SIZE).map(Elf64Rel::parse).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_header() -> Vec<u8> {
        let mut bytes = vec![0u8; EHDR_SIZE];
        bytes[..4].copy_from_slice(&ELFMAG);
        bytes[EI_CLASS] = ELFCLASS64;
        bytes[EI_DATA] = ELFDATA2LSB;
        bytes[EI_VERSION] = EV_CURRENT;
        bytes
    }

    #[test]
    fn test_parse_header_only() {
        let bytes = minimal_header();
        let elf = Elf64::parse(&bytes).unwrap();
        assert_eq!(elf.section_header_table().len(), 0);
    }

    #[test]
    fn test_reject_truncated() {
        assert_eq!(Elf64::parse(&[0x7f, 0x45]), Err(ElfParserError::OutOfBounds));
    }

    #[test]
    fn test_reject_bad_magic() {
        let mut bytes = minimal_header();
        bytes[0] = 0x00;
        assert_eq!(Elf64::parse(&bytes), Err(ElfParserError::InvalidFileHeader));
    }

    #[test]
    fn test_reject_big_endian() {
        let mut bytes = minimal_header();
        bytes[EI_DATA] = consts::ELFDATA2MSB;
        assert_eq!(Elf64::parse(&bytes), Err(ElfParserError::WrongEndianness));
    }

    #[test]
    fn test_reject_section_table_out_of_bounds() {
        let mut bytes = minimal_header();
        // e_shoff far past the end, one section
        bytes[40] = 0xff;
        bytes[58] = SHDR_SIZE as u8;
        bytes[60] = 1;
        assert_eq!(Elf64::parse(&bytes), Err(ElfParserError::OutOfBounds));
    }
}
