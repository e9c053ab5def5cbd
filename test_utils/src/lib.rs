//! Helpers for building eBPF object files in memory and for mocking the
//! loader's kernel and type-metadata collaborators in tests.

#![allow(clippy::new_without_default)]

use byteorder::{ByteOrder, LittleEndian};
use ebpf_loader::btf::{TypeInfo, TypeRecord};
use ebpf_loader::kernel::{KernelBpf, MapCreateAttr, MapInfo, ProgLoadAttr};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

/// Symbol binding: global, shifted into `st_info`
pub const STB_GLOBAL: u8 = 1;
/// Symbol binding: local
pub const STB_LOCAL: u8 = 0;

const EHDR_SIZE: usize = 64;
const SHDR_SIZE: usize = 64;
const SYM_SIZE: usize = 24;
const REL_SIZE: usize = 16;

const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHT_REL: u32 = 9;

/// Encodes one instruction word.
pub fn insn(opc: u8, dst: u8, src: u8, off: i16, imm: i32) -> [u8; 8] {
    let mut bytes = [0u8; 8];
    bytes[0] = opc;
    bytes[1] = (src << 4) | (dst & 0x0f);
    LittleEndian::write_i16(&mut bytes[2..4], off);
    LittleEndian::write_i32(&mut bytes[4..8], imm);
    bytes
}

/// `mov r0, 0; exit` - the smallest accepted program.
pub fn ret0_prog() -> Vec<u8> {
    let mut prog = Vec::new();
    prog.extend_from_slice(&insn(0xb7, 0, 0, 0, 0));
    prog.extend_from_slice(&insn(0x95, 0, 0, 0, 0));
    prog
}

struct SectionSpec {
    name: String,
    sh_type: u32,
    sh_flags: u64,
    data: Vec<u8>,
}

struct SymbolSpec {
    name: String,
    shndx: u16,
    value: u64,
    info: u8,
}

/// Builds little-endian relocatable ELF64 images for loader tests.
///
/// User sections occupy indices `1..=n` in insertion order, followed by
/// the synthesized symbol table, string table, relocation sections and
/// section name table.
pub struct ElfBuilder {
    sections: Vec<SectionSpec>,
    symbols: Vec<SymbolSpec>,
    rels: Vec<(usize, u64, usize)>,
    e_type: u16,
    e_machine: u16,
    ei_data: u8,
    duplicate_symtab: bool,
    symtab_link: Option<u32>,
}

impl ElfBuilder {
    /// A builder for a valid, empty eBPF object.
    pub fn new() -> ElfBuilder {
        ElfBuilder {
            sections: Vec::new(),
            symbols: Vec::new(),
            rels: Vec::new(),
            e_type: 1,      // ET_REL
            e_machine: 247, // EM_BPF
            ei_data: 1,     // ELFDATA2LSB
            duplicate_symtab: false,
            symtab_link: None,
        }
    }

    /// Adds a section and returns its index.
    pub fn section(&mut self, name: &str, sh_type: u32, sh_flags: u64, data: &[u8]) -> usize {
        self.sections.push(SectionSpec {
            name: name.to_owned(),
            sh_type,
            sh_flags,
            data: data.to_vec(),
        });
        self.sections.len()
    }

    /// Adds a `PROGBITS` section with `SHF_EXECINSTR` set.
    pub fn exec_section(&mut self, name: &str, insns: &[u8]) -> usize {
        self.section(name, 1, 0x4, insns)
    }

    /// Adds a symbol and returns its symbol-table index.
    pub fn symbol(&mut self, name: &str, shndx: usize, value: u64, bind: u8) -> usize {
        self.symbols.push(SymbolSpec {
            name: name.to_owned(),
            shndx: shndx as u16,
            value,
            info: bind << 4,
        });
        self.symbols.len()
    }

    /// Adds a relocation entry against the section at `target`.
    pub fn rel(&mut self, target: usize, r_offset: u64, sym: usize) {
        self.rels.push((target, r_offset, sym));
    }

    /// Overrides the object file type.
    pub fn e_type(&mut self, e_type: u16) {
        self.e_type = e_type;
    }

    /// Overrides the machine code.
    pub fn e_machine(&mut self, e_machine: u16) {
        self.e_machine = e_machine;
    }

    /// Overrides the data-encoding identification byte.
    pub fn ei_data(&mut self, ei_data: u8) {
        self.ei_data = ei_data;
    }

    /// Emits the symbol table twice.
    pub fn duplicate_symtab(&mut self) {
        self.duplicate_symtab = true;
    }

    /// Overrides the symbol table's string-table link.
    pub fn symtab_link(&mut self, link: u32) {
        self.symtab_link = Some(link);
    }

    /// Serializes the object.
    pub fn build(&self) -> Vec<u8> {
        // Full section list: null + user + symtab(s) + strtab + rels + shstrtab
        let nr_user = self.sections.len();
        let symtab_idx = nr_user + 1;
        let nr_symtabs = if self.duplicate_symtab { 2 } else { 1 };
        let strtab_idx = symtab_idx + nr_symtabs;

        // String table and symbol records
        let mut strtab = vec![0u8];
        let mut symtab = vec![0u8; SYM_SIZE];
        for sym in &self.symbols {
            let name_off = strtab.len() as u32;
            strtab.extend_from_slice(sym.name.as_bytes());
            strtab.push(0);
            let mut record = [0u8; SYM_SIZE];
            LittleEndian::write_u32(&mut record[0..4], name_off);
            record[4] = sym.info;
            LittleEndian::write_u16(&mut record[6..8], sym.shndx);
            LittleEndian::write_u64(&mut record[8..16], sym.value);
            symtab.extend_from_slice(&record);
        }

        // Group relocations per target section, in first-seen order
        let mut rel_groups: Vec<(usize, Vec<(u64, usize)>)> = Vec::new();
        for &(target, r_offset, sym) in &self.rels {
            match rel_groups.iter_mut().find(|(t, _)| *t == target) {
                Some((_, entries)) => entries.push((r_offset, sym)),
                None => rel_groups.push((target, vec![(r_offset, sym)])),
            }
        }

        struct OutSection {
            name: String,
            sh_type: u32,
            sh_flags: u64,
            sh_link: u32,
            sh_info: u32,
            sh_entsize: u64,
            data: Vec<u8>,
        }
        let mut out = vec![OutSection {
            name: String::new(),
            sh_type: 0,
            sh_flags: 0,
            sh_link: 0,
            sh_info: 0,
            sh_entsize: 0,
            data: Vec::new(),
        }];
        for section in &self.sections {
            out.push(OutSection {
                name: section.name.clone(),
                sh_type: section.sh_type,
                sh_flags: section.sh_flags,
                sh_link: 0,
                sh_info: 0,
                sh_entsize: 0,
                data: section.data.clone(),
            });
        }
        let symtab_link = self.symtab_link.unwrap_or(strtab_idx as u32);
        for _ in 0..nr_symtabs {
            out.push(OutSection {
                name: ".symtab".to_owned(),
                sh_type: SHT_SYMTAB,
                sh_flags: 0,
                sh_link: symtab_link,
                sh_info: 1,
                sh_entsize: SYM_SIZE as u64,
                data: symtab.clone(),
            });
        }
        out.push(OutSection {
            name: ".strtab".to_owned(),
            sh_type: SHT_STRTAB,
            sh_flags: 0,
            sh_link: 0,
            sh_info: 0,
            sh_entsize: 0,
            data: strtab,
        });
        for (target, entries) in &rel_groups {
            let mut data = Vec::with_capacity(entries.len() * REL_SIZE);
            for &(r_offset, sym) in entries {
                let mut record = [0u8; REL_SIZE];
                LittleEndian::write_u64(&mut record[0..8], r_offset);
                // relocation type 1, symbol index in the upper half
                LittleEndian::write_u64(&mut record[8..16], ((sym as u64) << 32) | 1);
                data.extend_from_slice(&record);
            }
            let target_name = &self.sections[*target - 1].name;
            out.push(OutSection {
                name: format!(".rel{target_name}"),
                sh_type: SHT_REL,
                sh_flags: 0,
                sh_link: symtab_idx as u32,
                sh_info: *target as u32,
                sh_entsize: REL_SIZE as u64,
                data,
            });
        }
        let shstrtab_idx = out.len();
        let mut shstrtab = vec![0u8];
        let mut name_offsets = Vec::with_capacity(out.len() + 1);
        for section in &out {
            if section.name.is_empty() {
                name_offsets.push(0);
                continue;
            }
            name_offsets.push(shstrtab.len() as u32);
            shstrtab.extend_from_slice(section.name.as_bytes());
            shstrtab.push(0);
        }
        name_offsets.push(shstrtab.len() as u32);
        shstrtab.extend_from_slice(b".shstrtab\0");
        out.push(OutSection {
            name: ".shstrtab".to_owned(),
            sh_type: SHT_STRTAB,
            sh_flags: 0,
            sh_link: 0,
            sh_info: 0,
            sh_entsize: 0,
            data: shstrtab,
        });

        // Lay the bodies out after the file header
        let mut image = vec![0u8; EHDR_SIZE];
        let mut offsets = Vec::with_capacity(out.len());
        for section in &out {
            while image.len() % 8 != 0 {
                image.push(0);
            }
            offsets.push(image.len() as u64);
            image.extend_from_slice(&section.data);
        }
        while image.len() % 8 != 0 {
            image.push(0);
        }
        let e_shoff = image.len() as u64;
        for (index, section) in out.iter().enumerate() {
            let mut shdr = [0u8; SHDR_SIZE];
            LittleEndian::write_u32(&mut shdr[0..4], name_offsets[index]);
            LittleEndian::write_u32(&mut shdr[4..8], section.sh_type);
            LittleEndian::write_u64(&mut shdr[8..16], section.sh_flags);
            LittleEndian::write_u64(&mut shdr[24..32], offsets[index]);
            LittleEndian::write_u64(&mut shdr[32..40], section.data.len() as u64);
            LittleEndian::write_u32(&mut shdr[40..44], section.sh_link);
            LittleEndian::write_u32(&mut shdr[44..48], section.sh_info);
            LittleEndian::write_u64(&mut shdr[56..64], section.sh_entsize);
            image.extend_from_slice(&shdr);
        }

        // File header
        image[0..4].copy_from_slice(&[0x7f, 0x45, 0x4c, 0x46]);
        image[4] = 2; // ELFCLASS64
        image[5] = self.ei_data;
        image[6] = 1; // EV_CURRENT
        LittleEndian::write_u16(&mut image[16..18], self.e_type);
        LittleEndian::write_u16(&mut image[18..20], self.e_machine);
        LittleEndian::write_u32(&mut image[20..24], 1);
        LittleEndian::write_u64(&mut image[40..48], e_shoff);
        LittleEndian::write_u16(&mut image[52..54], EHDR_SIZE as u16);
        LittleEndian::write_u16(&mut image[58..60], SHDR_SIZE as u16);
        LittleEndian::write_u16(&mut image[60..62], (shstrtab_idx + 1) as u16);
        LittleEndian::write_u16(&mut image[62..64], shstrtab_idx as u16);
        image
    }

    /// Serializes the object and writes it to a fresh temporary file.
    pub fn build_file(&self, tag: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "ebpf_loader_test_{tag}_{}.o",
            std::process::id()
        ));
        std::fs::write(&path, self.build()).expect("failed to write object file");
        path
    }
}

/// One program submission recorded by [`MockKernel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedProgram {
    /// Descriptor handed back to the loader
    pub fd: RawFd,
    /// Submitted program type id
    pub prog_type: u32,
    /// Submitted attach type id
    pub expected_attach_type: u32,
    /// Submitted program name
    pub name: String,
    /// Submitted instruction stream
    pub insns: Vec<u8>,
    /// Submitted license
    pub license: String,
    /// Submitted kernel version
    pub kern_version: u32,
    /// Submitted device index
    pub prog_ifindex: u32,
}

/// Scripted failure for program submissions.
#[derive(Debug, Default, Clone)]
pub struct ProgLoadFailure {
    /// errno returned for the submission
    pub errno: i32,
    /// Verifier log text written into the caller's buffer, if any
    pub log: Option<String>,
    /// Whether a log-less probe with the kprobe type succeeds
    pub accept_kprobe_probe: bool,
}

/// Book-keeping state of [`MockKernel`].
#[derive(Debug, Default)]
pub struct MockState {
    next_fd: RawFd,
    /// Descriptors currently open; `close` panics when a descriptor is
    /// missing, which catches double closes
    pub open_fds: BTreeSet<RawFd>,
    /// Externally owned descriptors registered for reuse tests
    pub external: HashMap<RawFd, MapInfo>,
    /// Every successful map creation, in order
    pub created_maps: Vec<(RawFd, MapCreateAttr)>,
    /// Every successful program submission, in order
    pub loaded_programs: Vec<LoadedProgram>,
    /// Every pin call
    pub pinned: Vec<(RawFd, PathBuf)>,
    /// Fails the nth `create_map` call with the given errno
    pub fail_map_create_at: Option<(usize, i32)>,
    /// Fails any `create_map` carrying type metadata with the given errno
    pub fail_map_create_with_btf: Option<i32>,
    /// Fails program submissions
    pub prog_load_failure: Option<ProgLoadFailure>,
    map_create_calls: usize,
}

/// In-memory [`KernelBpf`] with descriptor book-keeping and scripted
/// failures.
#[derive(Debug, Default)]
pub struct MockKernel {
    /// Interior state, inspectable from tests
    pub state: RefCell<MockState>,
}

impl MockKernel {
    /// A mock kernel that accepts everything.
    pub fn new() -> MockKernel {
        MockKernel::default()
    }

    /// Registers a caller-owned descriptor for reuse tests.
    pub fn register_external(&self, fd: RawFd, info: MapInfo) {
        let mut state = self.state.borrow_mut();
        state.open_fds.insert(fd);
        state.external.insert(fd, info);
    }

    /// Descriptors still open, excluding registered external ones.
    pub fn leaked_fds(&self) -> Vec<RawFd> {
        let state = self.state.borrow();
        state
            .open_fds
            .iter()
            .copied()
            .filter(|fd| !state.external.contains_key(fd))
            .collect()
    }

    fn alloc_fd(state: &mut MockState) -> RawFd {
        if state.next_fd < 100 {
            state.next_fd = 100;
        }
        let fd = state.next_fd;
        state.next_fd += 1;
        state.open_fds.insert(fd);
        fd
    }
}

impl KernelBpf for MockKernel {
    fn create_map(&self, attr: &MapCreateAttr) -> Result<RawFd, i32> {
        let mut state = self.state.borrow_mut();
        let call = state.map_create_calls;
        state.map_create_calls += 1;
        if let Some((at, errno)) = state.fail_map_create_at {
            if call == at {
                return Err(errno);
            }
        }
        if let Some(errno) = state.fail_map_create_with_btf {
            if attr.btf_key_type_id != 0 {
                return Err(errno);
            }
        }
        let fd = Self::alloc_fd(&mut state);
        state.created_maps.push((fd, attr.clone()));
        Ok(fd)
    }

    fn load_program(&self, attr: &ProgLoadAttr, log: Option<&mut Vec<u8>>) -> Result<RawFd, i32> {
        let mut state = self.state.borrow_mut();
        if let Some(failure) = state.prog_load_failure.clone() {
            match log {
                Some(log) => {
                    if let Some(text) = &failure.log {
                        log.extend_from_slice(text.as_bytes());
                    }
                    return Err(failure.errno);
                }
                None => {
                    // log-less probe submission from the type heuristic
                    if failure.accept_kprobe_probe && attr.prog_type == 2 {
                        return Ok(Self::alloc_fd(&mut state));
                    }
                    return Err(failure.errno);
                }
            }
        }
        let fd = Self::alloc_fd(&mut state);
        state.loaded_programs.push(LoadedProgram {
            fd,
            prog_type: attr.prog_type,
            expected_attach_type: attr.expected_attach_type,
            name: attr.name.to_owned(),
            insns: attr.insns.to_vec(),
            license: attr.license.to_owned(),
            kern_version: attr.kern_version,
            prog_ifindex: attr.prog_ifindex,
        });
        Ok(fd)
    }

    fn pin(&self, fd: RawFd, path: &Path) -> Result<(), i32> {
        self.state.borrow_mut().pinned.push((fd, path.to_owned()));
        Ok(())
    }

    fn object_info_by_fd(&self, fd: RawFd) -> Result<MapInfo, i32> {
        let state = self.state.borrow();
        state.external.get(&fd).cloned().ok_or(9) // EBADF
    }

    fn dup_cloexec(&self, fd: RawFd) -> Result<RawFd, i32> {
        let mut state = self.state.borrow_mut();
        if !state.open_fds.contains(&fd) {
            return Err(9); // EBADF
        }
        Ok(Self::alloc_fd(&mut state))
    }

    fn close(&self, fd: RawFd) {
        assert!(
            self.state.borrow_mut().open_fds.remove(&fd),
            "double close of fd {fd}"
        );
    }
}

/// [`TypeInfo`] backed by plain lookup tables.
#[derive(Debug, Default)]
pub struct MockTypeInfo {
    /// name -> type id
    pub names: HashMap<String, u32>,
    /// type id -> record
    pub records: HashMap<u32, TypeRecord>,
    /// type id -> byte size
    pub sizes: HashMap<u32, u32>,
    /// Descriptor reported for the metadata blob
    pub fd: RawFd,
}

impl MockTypeInfo {
    /// Metadata describing one `____btf_map_<name>` container.
    pub fn with_map_container(
        map_name: &str,
        key_type_id: u32,
        value_type_id: u32,
        key_size: u32,
        value_size: u32,
        fd: RawFd,
    ) -> MockTypeInfo {
        use ebpf_loader::btf::{TypeMember, BTF_KIND_STRUCT};

        let container_id = 1;
        let mut info = MockTypeInfo {
            fd,
            ..MockTypeInfo::default()
        };
        info.names
            .insert(format!("____btf_map_{map_name}"), container_id);
        info.records.insert(
            container_id,
            TypeRecord {
                kind: BTF_KIND_STRUCT,
                members: vec![
                    TypeMember {
                        name_off: 0,
                        type_id: key_type_id,
                        offset: 0,
                    },
                    TypeMember {
                        name_off: 0,
                        type_id: value_type_id,
                        offset: 0,
                    },
                ],
            },
        );
        info.sizes.insert(key_type_id, key_size);
        info.sizes.insert(value_type_id, value_size);
        info
    }
}

impl TypeInfo for MockTypeInfo {
    fn find_by_name(&self, name: &str) -> Option<u32> {
        self.names.get(name).copied()
    }

    fn type_by_id(&self, type_id: u32) -> Option<TypeRecord> {
        self.records.get(&type_id).cloned()
    }

    fn resolve_size(&self, type_id: u32) -> Option<u32> {
        self.sizes.get(&type_id).copied()
    }

    fn fd(&self) -> RawFd {
        self.fd
    }
}
