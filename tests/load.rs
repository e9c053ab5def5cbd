//! Load-pipeline tests: map creation, instruction patching, `.text`
//! inlining, kernel submission and the cleanup discipline.

use byteorder::{ByteOrder, LittleEndian};
use ebpf_loader::btf::TypeInfo;
use ebpf_loader::error::Error;
use ebpf_loader::kernel::MapInfo;
use ebpf_loader::object::{load_file, Object, OpenAttr};
use ebpf_loader::program::{AttachType, ProgramType};
use std::sync::Arc;
use test_utils::{
    insn, ret0_prog, ElfBuilder, MockKernel, MockTypeInfo, ProgLoadFailure, STB_GLOBAL, STB_LOCAL,
};

const SHT_PROGBITS: u32 = 1;

fn base() -> ElfBuilder {
    let mut builder = ElfBuilder::new();
    builder.section("license", SHT_PROGBITS, 0, b"GPL\0");
    builder.section("version", SHT_PROGBITS, 0, &0x0004_0f00u32.to_le_bytes());
    builder
}

fn map_def(map_type: u32, key_size: u32, value_size: u32, max_entries: u32) -> [u8; 20] {
    let mut bytes = [0u8; 20];
    LittleEndian::write_u32(&mut bytes[0..4], map_type);
    LittleEndian::write_u32(&mut bytes[4..8], key_size);
    LittleEndian::write_u32(&mut bytes[8..12], value_size);
    LittleEndian::write_u32(&mut bytes[12..16], max_entries);
    bytes
}

fn open(builder: &ElfBuilder, kernel: Arc<MockKernel>) -> Object {
    Object::open_buffer(&builder.build(), Some("test.o"), kernel, OpenAttr::default()).unwrap()
}

#[test]
fn test_load_single_kprobe() {
    let mut builder = base();
    let prog = builder.exec_section("kprobe/do_sys_open", &ret0_prog());
    builder.symbol("trace_open", prog, 0, STB_GLOBAL);
    let path = builder.build_file("single_kprobe");

    let kernel = Arc::new(MockKernel::new());
    let (obj, prog_fd) = load_file(&path, ProgramType::Unspec, kernel.clone()).unwrap();
    {
        let state = kernel.state.borrow();
        assert_eq!(state.loaded_programs.len(), 1);
        let loaded = &state.loaded_programs[0];
        assert_eq!(loaded.fd, prog_fd);
        assert_eq!(loaded.prog_type, ProgramType::Kprobe as u32);
        assert_eq!(loaded.name, "trace_open");
        assert_eq!(loaded.license, "GPL");
        assert_eq!(loaded.kern_version, 0x0004_0f00);
        assert_eq!(loaded.insns, ret0_prog());
    }
    assert!(obj.programs().next().unwrap().is_kprobe());

    drop(obj);
    assert!(kernel.leaked_fds().is_empty());
    std::fs::remove_file(path).unwrap();
}

#[test]
fn test_ld64_relocation() {
    let mut builder = base();
    let maps = builder.section("maps", SHT_PROGBITS, 0, &map_def(1, 4, 4, 1024));
    let map_sym = builder.symbol("counters", maps, 0, STB_GLOBAL);
    let mut prog_insns = Vec::new();
    prog_insns.extend_from_slice(&insn(0x18, 1, 0, 0, 0)); // lddw r1, <map>
    prog_insns.extend_from_slice(&insn(0, 0, 0, 0, 0));
    prog_insns.extend_from_slice(&ret0_prog());
    let prog = builder.exec_section("kprobe/p", &prog_insns);
    builder.symbol("p", prog, 0, STB_GLOBAL);
    builder.rel(prog, 0, map_sym);

    let kernel = Arc::new(MockKernel::new());
    let mut obj = open(&builder, kernel.clone());
    obj.load().unwrap();

    let state = kernel.state.borrow();
    assert_eq!(state.created_maps.len(), 1);
    let (map_fd, create_attr) = &state.created_maps[0];
    assert_eq!(create_attr.name, "counters");
    assert_eq!(create_attr.map_type, 1);
    assert_eq!(create_attr.key_size, 4);
    assert_eq!(create_attr.value_size, 4);
    assert_eq!(create_attr.max_entries, 1024);
    assert_eq!(obj.find_map_by_name("counters").unwrap().fd(), *map_fd);

    let loaded = &state.loaded_programs[0];
    // source-register tag stamped as pseudo-map-fd, immediate is the fd
    assert_eq!(loaded.insns[1] >> 4, 1);
    assert_eq!(LittleEndian::read_i32(&loaded.insns[4..8]), *map_fd);
    // second slot of the wide load is untouched
    assert_eq!(&loaded.insns[8..16], &[0u8; 8]);
}

#[test]
fn test_call_inlining() {
    let mut text_insns = Vec::new();
    for i in 0..5 {
        text_insns.extend_from_slice(&insn(0xb7, 0, 0, 0, 0x100 + i));
    }
    let mut caller_insns = Vec::new();
    for i in 0..3 {
        caller_insns.extend_from_slice(&insn(0xb7, 1, 0, 0, i));
    }
    caller_insns.extend_from_slice(&insn(0x85, 0, 1, 0, 7)); // pseudo call at index 3
    caller_insns.extend_from_slice(&insn(0x95, 0, 0, 0, 0));

    let mut builder = base();
    let caller = builder.exec_section("kprobe/caller", &caller_insns);
    let text = builder.exec_section(".text", &text_insns);
    builder.symbol("caller", caller, 0, STB_GLOBAL);
    let helper = builder.symbol("helper", text, 0, STB_LOCAL);
    builder.rel(caller, 24, helper);

    let kernel = Arc::new(MockKernel::new());
    let mut obj = open(&builder, kernel.clone());
    // .text is callee storage, not a loadable program
    assert_eq!(obj.programs().count(), 1);
    obj.load().unwrap();

    let state = kernel.state.borrow();
    assert_eq!(state.loaded_programs.len(), 1);
    let loaded = &state.loaded_programs[0];
    assert_eq!(loaded.name, "caller");
    assert_eq!(loaded.insns.len(), 10 * 8);
    assert_eq!(&loaded.insns[40..80], text_insns.as_slice());
    // imm rebased by main_prog_cnt - insn_idx = 5 - 3
    assert_eq!(LittleEndian::read_i32(&loaded.insns[3 * 8 + 4..3 * 8 + 8]), 9);
}

#[test]
fn test_text_without_calls_is_loaded() {
    let mut builder = base();
    builder.exec_section(".text", &ret0_prog());
    let kernel = Arc::new(MockKernel::new());
    let mut obj = open(&builder, kernel.clone());
    assert_eq!(obj.programs().count(), 1);
    obj.load().unwrap();
    let state = kernel.state.borrow();
    assert_eq!(state.loaded_programs.len(), 1);
    assert_eq!(state.loaded_programs[0].name, ".text");
}

fn btf_attr() -> OpenAttr {
    OpenAttr {
        prog_type: ProgramType::Unspec,
        type_info: Some(Box::new(|_data: &[u8]| {
            Ok(Box::new(MockTypeInfo::with_map_container("counters", 2, 3, 4, 4, 999))
                as Box<dyn TypeInfo>)
        })),
    }
}

#[test]
fn test_map_created_with_type_metadata() {
    let mut builder = base();
    builder.section(".BTF", SHT_PROGBITS, 0, b"opaque metadata bytes");
    let maps = builder.section("maps", SHT_PROGBITS, 0, &map_def(1, 4, 4, 1024));
    builder.symbol("counters", maps, 0, STB_GLOBAL);

    let kernel = Arc::new(MockKernel::new());
    let mut obj =
        Object::open_buffer(&builder.build(), Some("test.o"), kernel.clone(), btf_attr()).unwrap();
    assert_eq!(obj.btf_fd(), 999);
    obj.load().unwrap();

    let state = kernel.state.borrow();
    let (_, create_attr) = &state.created_maps[0];
    assert_eq!(create_attr.btf_fd, 999);
    assert_eq!(create_attr.btf_key_type_id, 2);
    assert_eq!(create_attr.btf_value_type_id, 3);
    assert_eq!(obj.find_map_by_name("counters").unwrap().btf_key_type_id(), 2);
    assert_eq!(obj.find_map_by_name("counters").unwrap().btf_value_type_id(), 3);
}

#[test]
fn test_map_creation_retries_without_type_metadata() {
    let mut builder = base();
    builder.section(".BTF", SHT_PROGBITS, 0, b"opaque metadata bytes");
    let maps = builder.section("maps", SHT_PROGBITS, 0, &map_def(1, 4, 4, 1024));
    builder.symbol("counters", maps, 0, STB_GLOBAL);

    let kernel = Arc::new(MockKernel::new());
    // kernels predating map type metadata reject the annotated request
    kernel.state.borrow_mut().fail_map_create_with_btf = Some(22);
    let mut obj =
        Object::open_buffer(&builder.build(), Some("test.o"), kernel.clone(), btf_attr()).unwrap();
    obj.load().unwrap();

    let state = kernel.state.borrow();
    assert_eq!(state.created_maps.len(), 1);
    let (map_fd, create_attr) = &state.created_maps[0];
    assert_eq!(create_attr.btf_fd, 0);
    assert_eq!(create_attr.btf_key_type_id, 0);
    assert_eq!(create_attr.btf_value_type_id, 0);
    let map = obj.find_map_by_name("counters").unwrap();
    assert_eq!(map.fd(), *map_fd);
    assert_eq!(map.btf_key_type_id(), 0);
    assert_eq!(map.btf_value_type_id(), 0);
}

#[test]
fn test_unparseable_type_metadata_is_ignored() {
    let mut builder = base();
    builder.section(".BTF", SHT_PROGBITS, 0, b"garbage");
    let kernel = Arc::new(MockKernel::new());
    let attr = OpenAttr {
        prog_type: ProgramType::Unspec,
        type_info: Some(Box::new(|_data: &[u8]| {
            Err(Error::Format("truncated type section".to_string()))
        })),
    };
    let obj = Object::open_buffer(&builder.build(), Some("test.o"), kernel, attr).unwrap();
    assert_eq!(obj.btf_fd(), -1);
}

#[test]
fn test_partial_map_creation_cleanup() {
    let mut builder = base();
    let mut data = Vec::new();
    data.extend_from_slice(&map_def(1, 4, 4, 16));
    data.extend_from_slice(&map_def(1, 4, 8, 16));
    data.extend_from_slice(&map_def(1, 4, 16, 16));
    let maps = builder.section("maps", SHT_PROGBITS, 0, &data);
    builder.symbol("map_a", maps, 0, STB_GLOBAL);
    builder.symbol("map_b", maps, 20, STB_GLOBAL);
    builder.symbol("map_c", maps, 40, STB_GLOBAL);

    let kernel = Arc::new(MockKernel::new());
    kernel.state.borrow_mut().fail_map_create_at = Some((2, 1)); // third map, EPERM
    let mut obj = open(&builder, kernel.clone());
    assert_eq!(obj.load().unwrap_err(), Error::Os(1));

    for map in obj.maps() {
        assert_eq!(map.fd(), -1);
    }
    assert!(kernel.leaked_fds().is_empty());
    // a failed load still consumes the one load attempt
    assert!(matches!(obj.load(), Err(Error::InvalidInput(_))));
}

#[test]
fn test_unload_is_idempotent() {
    let mut builder = base();
    let maps = builder.section("maps", SHT_PROGBITS, 0, &map_def(1, 4, 4, 16));
    builder.symbol("map_a", maps, 0, STB_GLOBAL);
    let prog = builder.exec_section("kprobe/p", &ret0_prog());
    builder.symbol("p", prog, 0, STB_GLOBAL);

    let kernel = Arc::new(MockKernel::new());
    let mut obj = open(&builder, kernel.clone());
    obj.load().unwrap();
    assert!(obj.programs().next().unwrap().fd().is_ok());

    obj.unload();
    assert_eq!(obj.find_map_by_name("map_a").unwrap().fd(), -1);
    assert!(obj.programs().next().unwrap().fd().is_err());
    // a second unload must not double-close anything; MockKernel panics
    // on a close without a matching open descriptor
    obj.unload();
    assert!(kernel.leaked_fds().is_empty());
}

#[test]
fn test_drop_closes_descriptors() {
    let mut builder = base();
    let maps = builder.section("maps", SHT_PROGBITS, 0, &map_def(1, 4, 4, 16));
    builder.symbol("map_a", maps, 0, STB_GLOBAL);
    let prog = builder.exec_section("kprobe/p", &ret0_prog());
    builder.symbol("p", prog, 0, STB_GLOBAL);

    let kernel = Arc::new(MockKernel::new());
    let mut obj = open(&builder, kernel.clone());
    obj.load().unwrap();
    assert!(!kernel.leaked_fds().is_empty());
    drop(obj);
    assert!(kernel.leaked_fds().is_empty());
}

#[test]
fn test_reuse_fd_skips_creation() {
    let mut builder = base();
    let maps = builder.section("maps", SHT_PROGBITS, 0, &map_def(1, 4, 4, 1024));
    builder.symbol("counters", maps, 0, STB_GLOBAL);

    let kernel = Arc::new(MockKernel::new());
    kernel.register_external(
        500,
        MapInfo {
            name: "counters".to_string(),
            map_type: 1,
            key_size: 4,
            value_size: 4,
            max_entries: 1024,
            map_flags: 0,
            btf_key_type_id: 0,
            btf_value_type_id: 0,
        },
    );

    let mut obj = open(&builder, kernel.clone());
    let map = obj.find_map_by_name_mut("counters").unwrap();
    map.reuse_fd(500).unwrap();
    let reused_fd = map.fd();
    assert!(reused_fd >= 100); // a duplicate, not the caller's descriptor
    obj.load().unwrap();

    assert!(kernel.state.borrow().created_maps.is_empty());
    drop(obj);
    // the duplicate is closed, the caller's descriptor stays open
    assert!(kernel.leaked_fds().is_empty());
    assert!(kernel.state.borrow().open_fds.contains(&500));
}

#[test]
fn test_preprocessor_instances() {
    let mut builder = base();
    let prog = builder.exec_section("kprobe/p", &ret0_prog());
    builder.symbol("p", prog, 0, STB_GLOBAL);

    let kernel = Arc::new(MockKernel::new());
    let mut obj = open(&builder, kernel.clone());
    obj.programs_mut()
        .next()
        .unwrap()
        .set_prep(
            2,
            Box::new(|instance, insns| {
                if instance == 0 {
                    // skip directive
                    Ok(None)
                } else {
                    let mut patched = insns.to_vec();
                    patched[4] = 0x2a; // mov r0, 42
                    Ok(Some(patched))
                }
            }),
        )
        .unwrap();
    obj.load().unwrap();

    let prog = obj.programs().next().unwrap();
    assert!(matches!(prog.nth_fd(0), Err(Error::NotFound(_))));
    let fd = prog.nth_fd(1).unwrap();
    let state = kernel.state.borrow();
    assert_eq!(state.loaded_programs.len(), 1);
    assert_eq!(state.loaded_programs[0].fd, fd);
    assert_eq!(state.loaded_programs[0].insns[4], 0x2a);
}

#[test]
fn test_set_prep_after_load_fails() {
    let mut builder = base();
    let prog = builder.exec_section("kprobe/p", &ret0_prog());
    builder.symbol("p", prog, 0, STB_GLOBAL);
    let kernel = Arc::new(MockKernel::new());
    let mut obj = open(&builder, kernel);
    obj.load().unwrap();
    let err = obj
        .programs_mut()
        .next()
        .unwrap()
        .set_prep(1, Box::new(|_, insns| Ok(Some(insns.to_vec()))))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[test]
fn test_rejection_with_verifier_log() {
    let mut builder = base();
    let prog = builder.exec_section("kprobe/p", &ret0_prog());
    builder.symbol("p", prog, 0, STB_GLOBAL);
    let kernel = Arc::new(MockKernel::new());
    kernel.state.borrow_mut().prog_load_failure = Some(ProgLoadFailure {
        errno: 13,
        log: Some("invalid stack access off=-8".to_string()),
        accept_kprobe_probe: false,
    });
    let mut obj = open(&builder, kernel);
    match obj.load().unwrap_err() {
        Error::Verify(log) => assert!(log.contains("invalid stack access")),
        other => panic!("expected a verifier rejection, got {other:?}"),
    }
}

#[test]
fn test_rejection_program_too_big() {
    let mut prog_insns = Vec::new();
    for _ in 0..4095 {
        prog_insns.extend_from_slice(&insn(0xb7, 0, 0, 0, 0));
    }
    prog_insns.extend_from_slice(&insn(0x95, 0, 0, 0, 0));
    let mut builder = base();
    let prog = builder.exec_section("kprobe/p", &prog_insns);
    builder.symbol("p", prog, 0, STB_GLOBAL);
    let kernel = Arc::new(MockKernel::new());
    kernel.state.borrow_mut().prog_load_failure = Some(ProgLoadFailure {
        errno: 7,
        log: None,
        accept_kprobe_probe: false,
    });
    let mut obj = open(&builder, kernel);
    assert_eq!(obj.load().unwrap_err(), Error::ProgramTooBig(4096));
}

#[test]
fn test_rejection_wrong_program_type() {
    let mut builder = base();
    let prog = builder.exec_section("xdp_prog", &ret0_prog());
    builder.symbol("p", prog, 0, STB_GLOBAL);
    let kernel = Arc::new(MockKernel::new());
    kernel.state.borrow_mut().prog_load_failure = Some(ProgLoadFailure {
        errno: 22,
        log: None,
        accept_kprobe_probe: true,
    });
    let mut obj = open(&builder, kernel.clone());
    obj.programs_mut().next().unwrap().set_xdp();
    assert_eq!(obj.load().unwrap_err(), Error::WrongProgramType);
    // the probe descriptor must not leak
    assert!(kernel.leaked_fds().is_empty());
}

#[test]
fn test_rejection_kernel_version_mismatch() {
    let mut builder = base();
    let prog = builder.exec_section("kprobe/p", &ret0_prog());
    builder.symbol("p", prog, 0, STB_GLOBAL);
    let kernel = Arc::new(MockKernel::new());
    kernel.state.borrow_mut().prog_load_failure = Some(ProgLoadFailure {
        errno: 22,
        log: None,
        accept_kprobe_probe: false,
    });
    let mut obj = open(&builder, kernel);
    assert_eq!(obj.load().unwrap_err(), Error::KernelVersionMismatch);
}

#[test]
fn test_type_inference_from_section_names() {
    let mut builder = base();
    let prog = builder.exec_section("cgroup/connect6", &ret0_prog());
    builder.symbol("connect6", prog, 0, STB_GLOBAL);
    let path = builder.build_file("connect6");

    let kernel = Arc::new(MockKernel::new());
    let (_obj, _fd) = load_file(&path, ProgramType::Unspec, kernel.clone()).unwrap();
    let state = kernel.state.borrow();
    assert_eq!(
        state.loaded_programs[0].prog_type,
        ProgramType::CgroupSockAddr as u32
    );
    assert_eq!(
        state.loaded_programs[0].expected_attach_type,
        AttachType::CgroupInet6Connect as u32
    );
    std::fs::remove_file(path).unwrap();
}

#[test]
fn test_type_inference_unknown_section_name() {
    let mut builder = base();
    let prog = builder.exec_section("uprobe/unknown", &ret0_prog());
    builder.symbol("p", prog, 0, STB_GLOBAL);
    let path = builder.build_file("unknown_section");

    let kernel = Arc::new(MockKernel::new());
    let err = load_file(&path, ProgramType::Unspec, kernel).unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    std::fs::remove_file(path).unwrap();
}

#[test]
fn test_forced_type_skips_inference() {
    let mut builder = base();
    let prog = builder.exec_section("uprobe/unknown", &ret0_prog());
    builder.symbol("p", prog, 0, STB_GLOBAL);
    let path = builder.build_file("forced_type");

    let kernel = Arc::new(MockKernel::new());
    let (_obj, _fd) = load_file(&path, ProgramType::Kprobe, kernel.clone()).unwrap();
    assert_eq!(
        kernel.state.borrow().loaded_programs[0].prog_type,
        ProgramType::Kprobe as u32
    );
    std::fs::remove_file(path).unwrap();
}

#[cfg(target_os = "linux")]
#[test]
fn test_pin_refuses_paths_outside_bpffs() {
    let mut builder = base();
    // a section name without '/' keeps the pin path one level deep
    let prog = builder.exec_section("xdp", &ret0_prog());
    builder.symbol("p", prog, 0, STB_GLOBAL);
    let kernel = Arc::new(MockKernel::new());
    let mut obj = open(&builder, kernel);

    let pin_dir = std::env::temp_dir().join(format!("ebpf_loader_pin_{}", std::process::id()));
    // pinning an unloaded object is refused outright
    assert!(matches!(obj.pin(&pin_dir), Err(Error::NotFound(_))));

    obj.load().unwrap();
    let err = obj.pin(&pin_dir).unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    let _ = std::fs::remove_dir_all(&pin_dir);
}
