//! The object aggregate and its open and load pipelines.
//!
//! Opening parses the ELF image, classifies sections, builds the map and
//! program tables and collects relocations; loading creates the kernel
//! maps, patches the instruction streams and submits each program. The
//! ELF scratch state lives only inside the open pipeline.

use crate::btf::{TypeInfo, TypeInfoParser};
use crate::ebpf;
use crate::elf_parser::{
    consts::{EM_BPF, EM_NONE, ET_REL, SHF_EXECINSTR, SHT_PROGBITS, SHT_REL, SHT_SYMTAB,
        STB_GLOBAL},
    types::{Elf64Shdr, Elf64Sym},
    Elf64,
};
use crate::error::Error;
use crate::kernel::{make_dir, KernelBpf, MapCreateAttr};
use crate::map::{find_btf_info, Map, MapDef, MAP_DEF_SIZE};
use crate::program::{prog_type_by_name, AttachType, Program, ProgramType, RelocDesc};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};
use std::any::Any;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;

/// Name of the type-metadata section
const BTF_SECTION: &[u8] = b".BTF";
/// Bytes of license text retained, terminator excluded
const LICENSE_MAX: usize = 63;

/// Options for opening an object.
#[derive(Default)]
pub struct OpenAttr {
    /// Program type the caller intends to load; drives the
    /// kernel-version requirement check.
    pub prog_type: ProgramType,
    /// Parser for the type-metadata section, if the embedder has one.
    pub type_info: Option<TypeInfoParser>,
}

/// Options for the load-from-file wrapper.
#[derive(Default)]
pub struct LoadFileAttr {
    /// Program type forced onto every program; section-name inference
    /// runs when this is [`ProgramType::Unspec`].
    pub prog_type: ProgramType,
    /// Expected attach type used together with a forced program type.
    pub expected_attach_type: AttachType,
    /// Network device index propagated to programs and device-bound maps.
    pub ifindex: u32,
    /// Parser for the type-metadata section, if the embedder has one.
    pub type_info: Option<TypeInfoParser>,
}

/// ELF scratch state, alive only while the open pipeline runs.
struct ElfScratch {
    symbols: Vec<Elf64Sym>,
    strtabidx: usize,
    maps_shndx: Option<usize>,
    relocs: Vec<RelocSection>,
}

struct RelocSection {
    /// `sh_info` of the relocation section: the section it applies to
    target: usize,
    entries: Vec<crate::elf_parser::types::Elf64Rel>,
}

/// An eBPF object file with its maps and programs.
pub struct Object {
    name: String,
    license: String,
    kern_version: u32,
    programs: Vec<Program>,
    maps: Vec<Map>,
    btf: Option<Box<dyn TypeInfo>>,
    loaded: bool,
    has_pseudo_calls: bool,
    text_shndx: Option<usize>,
    kernel: Arc<dyn KernelBpf>,
    priv_data: Option<Box<dyn Any>>,
}

impl Object {
    /// Opens an object file with default options.
    pub fn open(path: impl AsRef<Path>, kernel: Arc<dyn KernelBpf>) -> Result<Object, Error> {
        Self::open_xattr(path, kernel, OpenAttr::default())
    }

    /// Opens an object file.
    pub fn open_xattr(
        path: impl AsRef<Path>,
        kernel: Arc<dyn KernelBpf>,
        attr: OpenAttr,
    ) -> Result<Object, Error> {
        let path = path.as_ref();
        debug!("loading {}", path.display());
        let bytes = std::fs::read(path).map_err(|err| {
            warn!("failed to open {}: {err}", path.display());
            Error::os(err)
        })?;
        Self::open_internal(
            path.display().to_string(),
            &bytes,
            kernel,
            attr.prog_type.needs_kern_version(),
            attr.type_info,
        )
    }

    /// Opens an object from an in-memory buffer.
    ///
    /// When `name` is absent a synthetic one is derived from the buffer.
    pub fn open_buffer(
        buf: &[u8],
        name: Option<&str>,
        kernel: Arc<dyn KernelBpf>,
        attr: OpenAttr,
    ) -> Result<Object, Error> {
        if buf.is_empty() {
            return Err(Error::InvalidInput("empty object buffer".to_string()));
        }
        let name = name
            .map(str::to_owned)
            .unwrap_or_else(|| format!("{:x}-{:x}", buf.as_ptr() as usize, buf.len()));
        debug!("loading object '{name}' from buffer");
        // Objects from buffers always carry trace-style programs often
        // enough that the kernel version requirement stays on.
        Self::open_internal(name, buf, kernel, true, attr.type_info)
    }

    fn open_internal(
        name: String,
        bytes: &[u8],
        kernel: Arc<dyn KernelBpf>,
        needs_kver: bool,
        type_info: Option<TypeInfoParser>,
    ) -> Result<Object, Error> {
        let elf = Elf64::parse(bytes)?;
        let mut obj = Object {
            name,
            license: String::new(),
            kern_version: 0,
            programs: Vec::new(),
            maps: Vec::new(),
            btf: None,
            loaded: false,
            has_pseudo_calls: false,
            text_shndx: None,
            kernel,
            priv_data: None,
        };
        obj.check_format(&elf)?;
        obj.check_endianness()?;
        let scratch = obj.collect_sections(&elf, type_info)?;
        obj.init_maps(&elf, &scratch)?;
        obj.init_prog_names(&elf, &scratch)?;
        obj.collect_relocations(&scratch)?;
        obj.validate(needs_kver)?;
        Ok(obj)
    }

    fn check_format(&self, elf: &Elf64) -> Result<(), Error> {
        let ehdr = elf.file_header();
        // Old LLVM left e_machine unset
        if ehdr.e_type != ET_REL || (ehdr.e_machine != EM_NONE && ehdr.e_machine != EM_BPF) {
            warn!("{} is not an eBPF object file", self.name);
            return Err(Error::Format(
                "not a relocatable eBPF object".to_string(),
            ));
        }
        Ok(())
    }

    fn check_endianness(&self) -> Result<(), Error> {
        // The parser only admits little-endian objects, so a mismatch is
        // only possible on a big-endian host.
        if cfg!(target_endian = "big") {
            warn!("error: endianness mismatch");
            return Err(Error::Endianness);
        }
        Ok(())
    }

    fn collect_sections(
        &mut self,
        elf: &Elf64,
        type_info: Option<TypeInfoParser>,
    ) -> Result<ElfScratch, Error> {
        let mut scratch = ElfScratch {
            symbols: Vec::new(),
            strtabidx: 0,
            maps_shndx: None,
            relocs: Vec::new(),
        };
        let mut symtab_seen = false;
        let section_count = elf.section_header_table().len();

        for idx in 1..section_count {
            let shdr = &elf.section_header_table()[idx];
            let name = elf.section_name(shdr.sh_name)?;
            let data = elf.section_data(shdr)?;
            debug!(
                "section({idx}) {}, size {}, link {}, flags {:#x}, type={}",
                String::from_utf8_lossy(name),
                data.len(),
                shdr.sh_link,
                shdr.sh_flags,
                shdr.sh_type
            );

            if name == b"license" {
                self.init_license(data);
            } else if name == b"version" {
                self.init_kversion(data)?;
            } else if name == b"maps" {
                scratch.maps_shndx = Some(idx);
            } else if name == BTF_SECTION {
                if let Some(parse) = type_info.as_ref() {
                    match parse(data) {
                        Ok(btf) => self.btf = Some(btf),
                        Err(err) => warn!(
                            "error loading ELF section .BTF: {err}. Ignored and continue."
                        ),
                    }
                }
            } else if shdr.sh_type == SHT_SYMTAB {
                if symtab_seen {
                    warn!("bpf: multiple SYMTAB in {}", self.name);
                    return Err(Error::Format("multiple symbol tables".to_string()));
                }
                scratch.symbols = elf.symbols(shdr)?;
                scratch.strtabidx = shdr.sh_link as usize;
                symtab_seen = true;
            } else if shdr.sh_type == SHT_PROGBITS
                && shdr.sh_flags & SHF_EXECINSTR != 0
                && !data.is_empty()
            {
                if name == b".text" {
                    self.text_shndx = Some(idx);
                }
                let section_name = String::from_utf8_lossy(name).into_owned();
                let prog = Program::new(data, section_name, idx, self.kernel.clone())?;
                debug!("found program {}", prog.section_name());
                self.programs.push(prog);
            } else if shdr.sh_type == SHT_REL {
                let target = shdr.sh_info as usize;
                // Only do relocations for sections with exec instructions
                if !section_have_execinstr(elf, target) {
                    debug!(
                        "skip relo {}({idx}) for section({target})",
                        String::from_utf8_lossy(name)
                    );
                    continue;
                }
                let entries = elf.relocations(shdr)?;
                scratch.relocs.push(RelocSection { target, entries });
            } else {
                debug!("skip section({idx}) {}", String::from_utf8_lossy(name));
            }
        }

        if scratch.strtabidx == 0 || scratch.strtabidx >= section_count {
            warn!("corrupted ELF file: index of strtab invalid");
            return Err(Error::Format("invalid string table index".to_string()));
        }
        Ok(scratch)
    }

    fn init_license(&mut self, data: &[u8]) {
        let data = &data[..data.len().min(LICENSE_MAX)];
        let end = data.iter().position(|&byte| byte == 0).unwrap_or(data.len());
        self.license = String::from_utf8_lossy(&data[..end]).into_owned();
        debug!("license of {} is {}", self.name, self.license);
    }

    fn init_kversion(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.len() != 4 {
            warn!("invalid kver section in {}", self.name);
            return Err(Error::Format("version section is not 4 bytes".to_string()));
        }
        self.kern_version = LittleEndian::read_u32(data);
        debug!(
            "kernel version of {} is {:x}",
            self.name, self.kern_version
        );
        Ok(())
    }

    fn init_maps(&mut self, elf: &Elf64, scratch: &ElfScratch) -> Result<(), Error> {
        let maps_shndx = match scratch.maps_shndx {
            Some(idx) => idx,
            None => return Ok(()),
        };
        let shdr = &elf.section_header_table()[maps_shndx];
        let data = elf.section_data(shdr)?;
        let strtab = &elf.section_header_table()[scratch.strtabidx];

        // Each map has a name; arrays of maps are not supported.
        let map_symbols = scratch
            .symbols
            .iter()
            .filter(|sym| sym.st_shndx as usize == maps_shndx)
            .collect::<Vec<_>>();
        let nr_maps = map_symbols.len();
        debug!(
            "maps in {}: {nr_maps} maps in {} bytes",
            self.name,
            data.len()
        );
        if nr_maps == 0 {
            return Ok(());
        }

        // Assume equally sized map definitions
        if data.is_empty() || data.len() % nr_maps != 0 {
            warn!(
                "unable to determine map definition size, section {}, {nr_maps} maps in {} bytes",
                self.name,
                data.len()
            );
            return Err(Error::InvalidInput(
                "indivisible maps section".to_string(),
            ));
        }
        let map_def_sz = data.len() / nr_maps;

        for sym in map_symbols {
            let name = elf
                .get_string(strtab, sym.st_name)
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                .map_err(|_| Error::Libelf("failed to get map name".to_string()))?;
            let offset = sym.st_value as usize;
            if offset + map_def_sz > data.len() {
                warn!(
                    "corrupted maps section in {}: last map \"{name}\" too small",
                    self.name
                );
                return Err(Error::InvalidInput("map definition out of bounds".to_string()));
            }
            let def_bytes = &data[offset..offset + map_def_sz];
            let def = if map_def_sz <= MAP_DEF_SIZE {
                MapDef::from_bytes(def_bytes)
            } else {
                // The definition in the object is bigger than the known
                // shape; keep the prefix if the excess is all zero.
                if def_bytes[MAP_DEF_SIZE..].iter().any(|&byte| byte != 0) {
                    warn!(
                        "maps section in {}: \"{name}\" has unrecognized, non-zero options",
                        self.name
                    );
                    return Err(Error::InvalidInput(format!(
                        "map '{name}' carries unrecognized options"
                    )));
                }
                MapDef::from_bytes(&def_bytes[..MAP_DEF_SIZE])
            };
            debug!("map {} is \"{name}\"", self.maps.len());
            self.maps
                .push(Map::new(name, sym.st_value, def, self.kernel.clone()));
        }

        self.maps.sort_by_key(|map| map.offset);
        Ok(())
    }

    fn init_prog_names(&mut self, elf: &Elf64, scratch: &ElfScratch) -> Result<(), Error> {
        let strtab = &elf.section_header_table()[scratch.strtabidx];
        for prog in &mut self.programs {
            let mut name: Option<&[u8]> = None;
            for sym in &scratch.symbols {
                if sym.st_shndx as usize != prog.shndx || sym.st_bind() != STB_GLOBAL {
                    continue;
                }
                name = Some(elf.get_string(strtab, sym.st_name).map_err(|_| {
                    warn!(
                        "failed to get sym name string for prog {}",
                        prog.section_name()
                    );
                    Error::Libelf("failed to get symbol name".to_string())
                })?);
                break;
            }
            if name.is_none() && Some(prog.shndx) == self.text_shndx {
                name = Some(b".text");
            }
            let name = name.ok_or_else(|| {
                warn!("failed to find sym for prog {}", prog.section_name());
                Error::InvalidInput(format!(
                    "no global symbol names program '{}'",
                    prog.section_name()
                ))
            })?;
            prog.name = String::from_utf8_lossy(name).into_owned();
        }
        Ok(())
    }

    fn collect_relocations(&mut self, scratch: &ElfScratch) -> Result<(), Error> {
        for sec in &scratch.relocs {
            let prog_idx = self
                .programs
                .iter()
                .position(|prog| prog.shndx == sec.target)
                .ok_or_else(|| {
                    warn!("relocation failed: no section({})", sec.target);
                    Error::Relocation(format!("no program for section {}", sec.target))
                })?;
            debug!(
                "collecting relocating info for: '{}'",
                self.programs[prog_idx].section_name()
            );

            let mut descs = Vec::with_capacity(sec.entries.len());
            for rel in &sec.entries {
                let sym = scratch.symbols.get(rel.r_sym() as usize).ok_or_else(|| {
                    warn!("relocation: symbol {:#x} not found", rel.r_sym());
                    Error::Format(format!("relocation symbol {} missing", rel.r_sym()))
                })?;
                debug!(
                    "relo for {:x} value {:x} name {}",
                    rel.r_info >> 32,
                    sym.st_value,
                    sym.st_name
                );

                let prog = &self.programs[prog_idx];
                let in_maps = scratch.maps_shndx == Some(sym.st_shndx as usize);
                let in_text = self.text_shndx == Some(sym.st_shndx as usize);
                if !in_maps && !in_text {
                    warn!(
                        "program '{}' contains non-map related relo data pointing to section {}",
                        prog.section_name(),
                        sym.st_shndx
                    );
                    return Err(Error::Relocation(format!(
                        "relocation against unexpected section {}",
                        sym.st_shndx
                    )));
                }

                let insn_idx = (rel.r_offset / ebpf::INSN_SIZE as u64) as usize;
                debug!("relocation: insn_idx={insn_idx}");
                if insn_idx >= prog.insns_cnt() {
                    warn!("relocation out of range: '{}'", prog.section_name());
                    return Err(Error::Relocation(format!(
                        "instruction index {insn_idx} out of range"
                    )));
                }

                let insn = ebpf::get_insn(&prog.insns, insn_idx);
                if insn.opc == ebpf::CALL_IMM {
                    if insn.src != ebpf::BPF_PSEUDO_CALL {
                        warn!("incorrect bpf_call opcode");
                        return Err(Error::Relocation(
                            "call relocation without pseudo-call tag".to_string(),
                        ));
                    }
                    descs.push(RelocDesc::Call {
                        insn_idx,
                        text_off: sym.st_value,
                    });
                    self.has_pseudo_calls = true;
                    continue;
                }

                if insn.opc != ebpf::LD_DW_IMM {
                    warn!(
                        "bpf: relocation: invalid relo for insns[{insn_idx}].code {:#x}",
                        insn.opc
                    );
                    return Err(Error::Relocation(format!(
                        "unexpected opcode {:#x} at instruction {insn_idx}",
                        insn.opc
                    )));
                }

                let map_idx = self
                    .maps
                    .iter()
                    .position(|map| map.offset == sym.st_value)
                    .ok_or_else(|| {
                        warn!("bpf relocation: no map at offset {:#x}", sym.st_value);
                        Error::Relocation(format!(
                            "no map definition at offset {:#x}",
                            sym.st_value
                        ))
                    })?;
                debug!(
                    "relocation: find map {map_idx} ({}) for insn {insn_idx}",
                    self.maps[map_idx].name()
                );
                descs.push(RelocDesc::Ld64 { insn_idx, map_idx });
            }
            self.programs[prog_idx].relocs.extend(descs);
        }
        Ok(())
    }

    fn validate(&self, needs_kver: bool) -> Result<(), Error> {
        if needs_kver && self.kern_version == 0 {
            warn!("{} doesn't provide kernel version", self.name);
            return Err(Error::KernelVersion);
        }
        Ok(())
    }

    /// Creates the kernel maps and loads every program.
    pub fn load(&mut self) -> Result<(), Error> {
        if self.loaded {
            warn!("object should not be loaded twice");
            return Err(Error::InvalidInput("object already loaded".to_string()));
        }
        self.loaded = true;

        let result = self
            .create_maps()
            .and_then(|()| self.relocate())
            .and_then(|()| self.load_progs());
        if let Err(err) = result {
            self.unload();
            warn!("failed to load object '{}'", self.name);
            return Err(err);
        }
        Ok(())
    }

    fn create_maps(&mut self) -> Result<(), Error> {
        // on failure, close only what this call opened; reused
        // descriptors stay with their owners
        let mut created = Vec::new();
        for i in 0..self.maps.len() {
            let btf = self.btf.as_deref();
            let map = &mut self.maps[i];
            if map.fd >= 0 {
                // reused descriptor, owned by whoever handed it over
                debug!("skip map create (preset) {}: fd={}", map.name(), map.fd);
                continue;
            }

            let mut attr = MapCreateAttr {
                name: map.name().to_owned(),
                map_type: map.def().map_type,
                key_size: map.def().key_size,
                value_size: map.def().value_size,
                max_entries: map.def().max_entries,
                map_flags: map.def().map_flags,
                map_ifindex: map.ifindex,
                btf_fd: 0,
                btf_key_type_id: 0,
                btf_value_type_id: 0,
            };
            if let Some(btf) = btf {
                if find_btf_info(map, btf).is_ok() {
                    attr.btf_fd = btf.fd() as u32;
                    attr.btf_key_type_id = map.btf_key_type_id;
                    attr.btf_value_type_id = map.btf_value_type_id;
                }
            }

            let mut result = self.kernel.create_map(&attr);
            if result.is_err() && attr.btf_key_type_id != 0 {
                // tolerate kernels that predate map type metadata
                warn!(
                    "error creating map {} (errno {}). Retrying without BTF.",
                    attr.name,
                    result.as_ref().unwrap_err()
                );
                attr.btf_fd = 0;
                attr.btf_key_type_id = 0;
                attr.btf_value_type_id = 0;
                map.btf_key_type_id = 0;
                map.btf_value_type_id = 0;
                result = self.kernel.create_map(&attr);
            }

            match result {
                Ok(fd) => {
                    map.fd = fd;
                    created.push(i);
                    debug!("create map {}: fd={fd}", attr.name);
                }
                Err(errno) => {
                    warn!("failed to create map (name: '{}'): errno {errno}", attr.name);
                    for j in created {
                        self.maps[j].unload();
                    }
                    return Err(Error::Os(errno));
                }
            }
        }
        Ok(())
    }

    fn relocate(&mut self) -> Result<(), Error> {
        for i in 0..self.programs.len() {
            self.relocate_program(i).map_err(|err| {
                warn!("failed to relocate '{}'", self.programs[i].section_name());
                err
            })?;
        }
        Ok(())
    }

    fn relocate_program(&mut self, idx: usize) -> Result<(), Error> {
        let relocs = std::mem::take(&mut self.programs[idx].relocs);
        for relo in relocs {
            match relo {
                RelocDesc::Ld64 { insn_idx, map_idx } => {
                    let fd = self.maps[map_idx].fd();
                    let prog = &mut self.programs[idx];
                    if insn_idx >= prog.insns_cnt() {
                        warn!("relocation out of range: '{}'", prog.section_name());
                        return Err(Error::Relocation(format!(
                            "instruction index {insn_idx} out of range"
                        )));
                    }
                    ebpf::set_src_reg(&mut prog.insns, insn_idx, ebpf::BPF_PSEUDO_MAP_FD);
                    ebpf::set_imm(&mut prog.insns, insn_idx, fd);
                }
                RelocDesc::Call { insn_idx, text_off } => {
                    self.reloc_text(idx, insn_idx, text_off)?;
                }
            }
        }
        Ok(())
    }

    /// Splices the shared `.text` pool into a caller and rebases the call.
    fn reloc_text(&mut self, idx: usize, insn_idx: usize, text_off: u64) -> Result<(), Error> {
        if Some(self.programs[idx].shndx) == self.text_shndx {
            warn!("relo in .text insn {insn_idx} into off {text_off}");
            return Err(Error::Relocation(
                "call relocation inside .text".to_string(),
            ));
        }

        if self.programs[idx].main_prog_cnt == 0 {
            let text_idx = self
                .text_shndx
                .and_then(|shndx| self.programs.iter().position(|prog| prog.shndx == shndx))
                .ok_or_else(|| {
                    warn!("no .text section found yet relo into text exist");
                    Error::Relocation("no .text program to inline".to_string())
                })?;
            let text_insns = self.programs[text_idx].insns.clone();
            let text_cnt = self.programs[text_idx].insns_cnt();
            let text_section_name = self.programs[text_idx].section_name().to_owned();

            let prog = &mut self.programs[idx];
            prog.main_prog_cnt = prog.insns_cnt();
            prog.insns.extend_from_slice(&text_insns);
            debug!(
                "added {text_cnt} insn from {text_section_name} to prog {}",
                prog.section_name()
            );
        }

        let prog = &mut self.programs[idx];
        // The callee's own offset within .text is already folded into the
        // immediate; rebase it onto the spliced-in copy.
        let delta = (prog.main_prog_cnt as i64 - insn_idx as i64) as i32;
        let imm = ebpf::get_imm(&prog.insns, insn_idx);
        ebpf::set_imm(&mut prog.insns, insn_idx, imm.wrapping_add(delta));
        Ok(())
    }

    fn load_progs(&mut self) -> Result<(), Error> {
        let license = self.license.clone();
        let kern_version = self.kern_version;
        for i in 0..self.programs.len() {
            if self.is_function_storage(&self.programs[i]) {
                continue;
            }
            self.programs[i].load(&license, kern_version)?;
        }
        Ok(())
    }

    /// Whether `prog` is the `.text` pool that was inlined into every
    /// caller and must not be submitted on its own.
    fn is_function_storage(&self, prog: &Program) -> bool {
        Some(prog.shndx) == self.text_shndx && self.has_pseudo_calls
    }

    /// Closes every map and program-instance descriptor. Idempotent.
    pub fn unload(&mut self) {
        for map in &mut self.maps {
            map.unload();
        }
        for prog in &mut self.programs {
            prog.unload();
        }
    }

    /// Pins all maps and program instances below `path`.
    ///
    /// Creates `path`, then `path/<map_name>` per map and
    /// `path/<section_name>/<instance>` per program instance.
    pub fn pin(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        if !self.loaded {
            warn!("object not yet loaded; load it first");
            return Err(Error::NotFound("object is not loaded".to_string()));
        }
        make_dir(path)?;
        for map in &self.maps {
            map.pin(&path.join(map.name()))?;
        }
        for prog in self.programs() {
            prog.pin(&path.join(prog.section_name()))?;
        }
        Ok(())
    }

    /// Returns the origin path of the object, or its synthetic name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the license carried by the object.
    pub fn license(&self) -> &str {
        &self.license
    }

    /// Returns the kernel version word of the object.
    pub fn kversion(&self) -> u32 {
        self.kern_version
    }

    /// Returns the descriptor of the attached type metadata, or -1.
    pub fn btf_fd(&self) -> RawFd {
        self.btf.as_ref().map(|btf| btf.fd()).unwrap_or(-1)
    }

    /// Iterates the loadable programs, skipping inlined `.text` storage.
    pub fn programs(&self) -> impl Iterator<Item = &Program> {
        self.programs
            .iter()
            .filter(|prog| !self.is_function_storage(prog))
    }

    /// Iterates the loadable programs mutably.
    pub fn programs_mut(&mut self) -> impl Iterator<Item = &mut Program> {
        let text_shndx = self.text_shndx;
        let has_pseudo_calls = self.has_pseudo_calls;
        self.programs
            .iter_mut()
            .filter(move |prog| !(Some(prog.shndx) == text_shndx && has_pseudo_calls))
    }

    /// Iterates the maps in ascending section-offset order.
    pub fn maps(&self) -> impl Iterator<Item = &Map> {
        self.maps.iter()
    }

    /// Iterates the maps mutably.
    pub fn maps_mut(&mut self) -> impl Iterator<Item = &mut Map> {
        self.maps.iter_mut()
    }

    /// Finds a map by name.
    pub fn find_map_by_name(&self, name: &str) -> Option<&Map> {
        self.maps.iter().find(|map| map.name() == name)
    }

    /// Finds a map by name, mutably.
    pub fn find_map_by_name_mut(&mut self, name: &str) -> Option<&mut Map> {
        self.maps.iter_mut().find(|map| map.name() == name)
    }

    /// Finds a map by its offset within the maps section.
    pub fn find_map_by_offset(&self, offset: u64) -> Result<&Map, Error> {
        self.maps
            .iter()
            .find(|map| map.offset == offset)
            .ok_or_else(|| Error::NotFound(format!("no map at offset {offset:#x}")))
    }

    /// Attaches caller-owned data to the object.
    pub fn set_priv(&mut self, priv_data: Box<dyn Any>) {
        self.priv_data = Some(priv_data);
    }

    /// Returns the caller-owned data attached to the object.
    pub fn priv_data(&self) -> Option<&dyn Any> {
        self.priv_data.as_deref()
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        self.unload();
    }
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("name", &self.name)
            .field("license", &self.license)
            .field("kern_version", &self.kern_version)
            .field("programs", &self.programs)
            .field("maps", &self.maps)
            .field("loaded", &self.loaded)
            .finish()
    }
}

fn section_have_execinstr(elf: &Elf64, idx: usize) -> bool {
    elf.section_header_table()
        .get(idx)
        .map(|shdr: &Elf64Shdr| shdr.sh_flags & SHF_EXECINSTR != 0)
        .unwrap_or(false)
}

/// Opens `path`, infers program types from section names, loads the
/// object and returns it together with the first program's descriptor.
pub fn load_file(
    path: impl AsRef<Path>,
    prog_type: ProgramType,
    kernel: Arc<dyn KernelBpf>,
) -> Result<(Object, RawFd), Error> {
    load_file_xattr(
        path,
        LoadFileAttr {
            prog_type,
            ..LoadFileAttr::default()
        },
        kernel,
    )
}

/// [`load_file`] with explicit attach type, device index and metadata
/// parser.
pub fn load_file_xattr(
    path: impl AsRef<Path>,
    attr: LoadFileAttr,
    kernel: Arc<dyn KernelBpf>,
) -> Result<(Object, RawFd), Error> {
    let mut obj = Object::open_xattr(
        path,
        kernel,
        OpenAttr {
            prog_type: attr.prog_type,
            type_info: attr.type_info,
        },
    )?;

    let mut first_prog: Option<usize> = None;
    for i in 0..obj.programs.len() {
        // inlined .text storage never reaches the kernel on its own
        if obj.is_function_storage(&obj.programs[i]) {
            continue;
        }
        let prog = &obj.programs[i];
        // If no type was requested, guess it from the section name.
        let (prog_type, expected_attach_type) = if attr.prog_type == ProgramType::Unspec {
            match prog_type_by_name(prog.section_name()) {
                Some(pair) => pair,
                None => {
                    warn!(
                        "failed to guess program type based on section name {}",
                        prog.section_name()
                    );
                    return Err(Error::InvalidInput(format!(
                        "unknown section name '{}'",
                        prog.section_name()
                    )));
                }
            }
        } else {
            (attr.prog_type, attr.expected_attach_type)
        };
        let prog = &mut obj.programs[i];
        prog.set_type(prog_type);
        prog.set_expected_attach_type(expected_attach_type);
        prog.set_ifindex(attr.ifindex);
        if first_prog.is_none() {
            first_prog = Some(i);
        }
    }

    for map in &mut obj.maps {
        if !map.is_offload_neutral() {
            map.set_ifindex(attr.ifindex);
        }
    }

    let first_prog = first_prog.ok_or_else(|| {
        warn!("object file doesn't contain bpf program");
        Error::NotFound("no program in object".to_string())
    })?;

    obj.load()?;
    let fd = obj.programs[first_prog].fd()?;
    Ok((obj, fd))
}
