//! Error taxonomy of the object loader.

use crate::elf_parser::ElfParserError;

/// Errors surfaced at the public boundary.
///
/// The set is closed; [`Error::code`] gives each kind its numeric
/// encoding for callers that pass errors across a C-style boundary.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// The ELF reader failed below the object layer
    #[error("failed to read ELF: {0}")]
    Libelf(String),
    /// The object file is malformed
    #[error("malformed object file: {0}")]
    Format(String),
    /// The object does not carry the kernel version its program type requires
    #[error("object does not provide a kernel version")]
    KernelVersion,
    /// Byte order of the object does not match the host
    #[error("endianness mismatch between object and host")]
    Endianness,
    /// A precondition was violated inside the loader
    #[error("internal error: {0}")]
    Internal(String),
    /// A relocation entry cannot be resolved
    #[error("invalid relocation: {0}")]
    Relocation(String),
    /// The kernel rejected the program and produced no verifier log
    #[error("kernel rejected program (errno {0})")]
    Load(i32),
    /// The kernel rejected the program; the verifier log is attached
    #[error("program verification failed:\n{0}")]
    Verify(String),
    /// The program exceeds the kernel's instruction limit
    #[error("program too large ({0} insns)")]
    ProgramTooBig(usize),
    /// The chosen program type does not fit the program
    #[error("program type mismatch")]
    WrongProgramType,
    /// Rejection most likely caused by a kernel version mismatch
    #[error("kernel version mismatch")]
    KernelVersionMismatch,
    /// An argument or object input is invalid
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// A referenced entity does not exist
    #[error("not found: {0}")]
    NotFound(String),
    /// A raw operating system error
    #[error("os error {0}")]
    Os(i32),
}

impl Error {
    /// Numeric encoding at the public boundary.
    ///
    /// Library kinds occupy the 4000 block; system errors map to their
    /// negated errno.
    pub fn code(&self) -> i32 {
        match self {
            Error::Libelf(_) => -4000,
            Error::Format(_) => -4001,
            Error::KernelVersion => -4002,
            Error::Endianness => -4003,
            Error::Internal(_) => -4004,
            Error::Relocation(_) => -4005,
            Error::Load(_) => -4006,
            Error::Verify(_) => -4007,
            Error::ProgramTooBig(_) => -4008,
            Error::WrongProgramType => -4009,
            Error::KernelVersionMismatch => -4010,
            Error::InvalidInput(_) => -libc::EINVAL,
            Error::NotFound(_) => -libc::ENOENT,
            Error::Os(errno) => -errno,
        }
    }

    pub(crate) fn os(err: std::io::Error) -> Self {
        Error::Os(err.raw_os_error().unwrap_or(libc::EIO))
    }
}

impl From<ElfParserError> for Error {
    fn from(err: ElfParserError) -> Self {
        match err {
            ElfParserError::WrongEndianness => Error::Endianness,
            ElfParserError::InvalidSectionHeader
            | ElfParserError::InvalidFileHeader
            | ElfParserError::InvalidSize
            | ElfParserError::InvalidString
            | ElfParserError::NoSectionNameStringTable
            | ElfParserError::OutOfBounds => Error::Format(err.to_string()),
        }
    }
}
