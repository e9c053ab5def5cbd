//! Seam to the type-metadata (BTF) collaborator.
//!
//! Parsing the `.BTF` section is not this crate's business; embedders
//! inject a parser and the loader consumes the result through the
//! [`TypeInfo`] capability when annotating map creation requests.

use crate::error::Error;
use std::os::unix::io::RawFd;

/// Kind tag of a struct type record
pub const BTF_KIND_STRUCT: u32 = 4;

/// One member of a composite type record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeMember {
    /// Offset of the member name in the metadata string table
    pub name_off: u32,
    /// Type id of the member
    pub type_id: u32,
    /// Bit offset of the member within its container
    pub offset: u32,
}

/// A type record as exposed by the metadata parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRecord {
    /// Kind tag of the record
    pub kind: u32,
    /// Members of a composite record, in declaration order
    pub members: Vec<TypeMember>,
}

/// Capability over parsed type metadata.
pub trait TypeInfo {
    /// Looks a type id up by name.
    fn find_by_name(&self, name: &str) -> Option<u32>;
    /// Fetches the record of a type id.
    fn type_by_id(&self, type_id: u32) -> Option<TypeRecord>;
    /// Resolves the byte size of a type.
    fn resolve_size(&self, type_id: u32) -> Option<u32>;
    /// Kernel descriptor of the loaded metadata blob.
    fn fd(&self) -> RawFd;
}

/// Injected parser for the raw bytes of a `.BTF` section.
pub type TypeInfoParser = Box<dyn Fn(&[u8]) -> Result<Box<dyn TypeInfo>, Error>>;
