//! Loader for eBPF ELF object files.
//!
//! This crate ingests a relocatable ELF object produced by an eBPF
//! toolchain, builds its map and program tables, performs the link-time
//! fixups (map-descriptor stamping and inlining of the shared `.text`
//! pool into its callers) and submits every program to the kernel for
//! verification, all through an embedder-controlled [`KernelBpf`]
//! capability.
//!
//! # Examples
//!
//! ```no_run
//! use ebpf_loader::kernel::SyscallKernel;
//! use ebpf_loader::object::load_file;
//! use ebpf_loader::program::ProgramType;
//! use std::sync::Arc;
//!
//! let kernel = Arc::new(SyscallKernel);
//! let (object, prog_fd) =
//!     load_file("trace_output_kern.o", ProgramType::Unspec, kernel).unwrap();
//! for map in object.maps() {
//!     println!("map {} fd {}", map.name(), map.fd());
//! }
//! # drop(prog_fd);
//! ```

#![warn(missing_docs)]

pub mod btf;
pub mod ebpf;
pub mod elf_parser;
pub mod error;
pub mod kernel;
pub mod map;
pub mod object;
pub mod program;

pub use crate::error::Error;
pub use crate::kernel::KernelBpf;
pub use crate::object::Object;
