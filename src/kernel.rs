//! Capability over the kernel bpf syscall surface.
//!
//! Every descriptor the loader acquires or releases flows through one
//! implementation of [`KernelBpf`], so embedders and tests can interpose
//! on the kernel boundary the same way they interpose on type metadata.

use crate::error::Error;
use log::warn;
use std::os::unix::io::RawFd;
use std::path::Path;

/// Filesystem magic of the bpf filesystem, required for pinning
pub const BPF_FS_MAGIC: i64 = 0xcafe4a11;
/// Size of the verifier log buffer handed to the kernel
pub const LOG_BUF_SIZE: usize = 256 * 1024;
/// Object name length limit imposed by the kernel, terminator included
pub const OBJ_NAME_LEN: usize = 16;

/// Request to create one kernel map.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MapCreateAttr {
    /// Map name, truncated by the kernel to [`OBJ_NAME_LEN`] - 1 bytes
    pub name: String,
    /// Kernel map type id
    pub map_type: u32,
    /// Key size in bytes
    pub key_size: u32,
    /// Value size in bytes
    pub value_size: u32,
    /// Maximum number of entries
    pub max_entries: u32,
    /// Creation flags
    pub map_flags: u32,
    /// Network device index for offloaded maps, zero otherwise
    pub map_ifindex: u32,
    /// Descriptor of the type-metadata blob, zero when unused
    pub btf_fd: u32,
    /// Type id of the key, zero when unused
    pub btf_key_type_id: u32,
    /// Type id of the value, zero when unused
    pub btf_value_type_id: u32,
}

/// Request to load one program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgLoadAttr<'a> {
    /// Kernel program type id
    pub prog_type: u32,
    /// Expected attach type id
    pub expected_attach_type: u32,
    /// Program name
    pub name: &'a str,
    /// Encoded instruction stream, 8 bytes per instruction
    pub insns: &'a [u8],
    /// License string
    pub license: &'a str,
    /// Kernel version the object was built against
    pub kern_version: u32,
    /// Network device index for offloaded programs, zero otherwise
    pub prog_ifindex: u32,
}

/// Map attributes the kernel reports for an existing descriptor.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MapInfo {
    /// Map name
    pub name: String,
    /// Kernel map type id
    pub map_type: u32,
    /// Key size in bytes
    pub key_size: u32,
    /// Value size in bytes
    pub value_size: u32,
    /// Maximum number of entries
    pub max_entries: u32,
    /// Creation flags
    pub map_flags: u32,
    /// Type id of the key, zero when absent
    pub btf_key_type_id: u32,
    /// Type id of the value, zero when absent
    pub btf_value_type_id: u32,
}

/// Capability over the kernel bpf syscall surface.
///
/// Errors are raw errno values; the object layer wraps them into the
/// public [`Error`] taxonomy.
pub trait KernelBpf {
    /// Creates a map and returns its descriptor.
    fn create_map(&self, attr: &MapCreateAttr) -> Result<RawFd, i32>;
    /// Loads a program. On rejection the verifier log, if any, is
    /// appended to `log`.
    fn load_program(&self, attr: &ProgLoadAttr, log: Option<&mut Vec<u8>>) -> Result<RawFd, i32>;
    /// Pins a descriptor at a path on the bpf filesystem.
    fn pin(&self, fd: RawFd, path: &Path) -> Result<(), i32>;
    /// Queries the map attributes of an existing descriptor.
    fn object_info_by_fd(&self, fd: RawFd) -> Result<MapInfo, i32>;
    /// Duplicates a descriptor with close-on-exec set.
    fn dup_cloexec(&self, fd: RawFd) -> Result<RawFd, i32>;
    /// Releases a descriptor.
    fn close(&self, fd: RawFd);
}

/// Verifies that the parent directory of `path` is on the bpf filesystem.
#[cfg(target_os = "linux")]
pub(crate) fn check_path(path: &Path) -> Result<(), Error> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let c_dir = CString::new(dir.as_os_str().as_bytes())
        .map_err(|_| Error::InvalidInput("path contains a NUL byte".to_string()))?;
    let mut st_fs: libc::statfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statfs(c_dir.as_ptr(), &mut st_fs) } != 0 {
        let err = std::io::Error::last_os_error();
        warn!("failed to statfs {}: {}", dir.display(), err);
        return Err(Error::os(err));
    }
    if st_fs.f_type as i64 != BPF_FS_MAGIC {
        warn!("specified path {} is not on BPF FS", path.display());
        return Err(Error::InvalidInput(format!(
            "{} is not on the bpf filesystem",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn check_path(_path: &Path) -> Result<(), Error> {
    Err(Error::Os(libc::ENOSYS))
}

/// Creates a pinning directory, tolerating one that already exists.
pub(crate) fn make_dir(path: &Path) -> Result<(), Error> {
    use std::os::unix::fs::DirBuilderExt;

    let mut builder = std::fs::DirBuilder::new();
    builder.mode(0o700);
    match builder.create(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => {
            warn!("failed to mkdir {}: {}", path.display(), err);
            Err(Error::os(err))
        }
    }
}

/// [`KernelBpf`] backed by the real `bpf(2)` syscall.
#[cfg(target_os = "linux")]
#[derive(Debug, Default, Clone, Copy)]
pub struct SyscallKernel;

#[cfg(target_os = "linux")]
mod sys {
    use super::{KernelBpf, MapCreateAttr, MapInfo, ProgLoadAttr, SyscallKernel, OBJ_NAME_LEN};
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::io::RawFd;
    use std::path::Path;

    const BPF_MAP_CREATE: libc::c_long = 0;
    const BPF_PROG_LOAD: libc::c_long = 5;
    const BPF_OBJ_PIN: libc::c_long = 6;
    const BPF_OBJ_GET_INFO_BY_FD: libc::c_long = 15;

    #[repr(C)]
    #[derive(Default)]
    struct MapCreateAttrSys {
        map_type: u32,
        key_size: u32,
        value_size: u32,
        max_entries: u32,
        map_flags: u32,
        inner_map_fd: u32,
        numa_node: u32,
        map_name: [u8; OBJ_NAME_LEN],
        map_ifindex: u32,
        btf_fd: u32,
        btf_key_type_id: u32,
        btf_value_type_id: u32,
    }

    #[repr(C)]
    #[derive(Default)]
    struct ProgLoadAttrSys {
        prog_type: u32,
        insn_cnt: u32,
        insns: u64,
        license: u64,
        log_level: u32,
        log_size: u32,
        log_buf: u64,
        kern_version: u32,
        prog_flags: u32,
        prog_name: [u8; OBJ_NAME_LEN],
        prog_ifindex: u32,
        expected_attach_type: u32,
    }

    #[repr(C)]
    #[derive(Default)]
    struct ObjPinAttrSys {
        pathname: u64,
        bpf_fd: u32,
        file_flags: u32,
    }

    #[repr(C)]
    #[derive(Default)]
    struct InfoByFdAttrSys {
        bpf_fd: u32,
        info_len: u32,
        info: u64,
    }

    #[repr(C)]
    #[derive(Default)]
    struct MapInfoSys {
        map_type: u32,
        id: u32,
        key_size: u32,
        value_size: u32,
        max_entries: u32,
        map_flags: u32,
        name: [u8; OBJ_NAME_LEN],
        ifindex: u32,
        netns_dev: u64,
        netns_ino: u64,
        btf_id: u32,
        btf_key_type_id: u32,
        btf_value_type_id: u32,
    }

    fn obj_name(name: &str) -> [u8; OBJ_NAME_LEN] {
        let mut out = [0u8; OBJ_NAME_LEN];
        for (slot, byte) in out[..OBJ_NAME_LEN - 1].iter_mut().zip(name.bytes()) {
            *slot = byte;
        }
        out
    }

    fn bpf<T>(cmd: libc::c_long, attr: &mut T) -> Result<libc::c_long, i32> {
        let ret = unsafe {
            libc::syscall(
                libc::SYS_bpf,
                cmd,
                attr as *mut T as *mut libc::c_void,
                std::mem::size_of::<T>(),
            )
        };
        if ret < 0 {
            Err(std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EIO))
        } else {
            Ok(ret)
        }
    }

    impl KernelBpf for SyscallKernel {
        fn create_map(&self, attr: &MapCreateAttr) -> Result<RawFd, i32> {
            let mut sys_attr = MapCreateAttrSys {
                map_type: attr.map_type,
                key_size: attr.key_size,
                value_size: attr.value_size,
                max_entries: attr.max_entries,
                map_flags: attr.map_flags,
                map_name: obj_name(&attr.name),
                map_ifindex: attr.map_ifindex,
                btf_fd: attr.btf_fd,
                btf_key_type_id: attr.btf_key_type_id,
                btf_value_type_id: attr.btf_value_type_id,
                ..MapCreateAttrSys::default()
            };
            bpf(BPF_MAP_CREATE, &mut sys_attr).map(|fd| fd as RawFd)
        }

        fn load_program(
            &self,
            attr: &ProgLoadAttr,
            log: Option<&mut Vec<u8>>,
        ) -> Result<RawFd, i32> {
            let license = CString::new(attr.license).map_err(|_| libc::EINVAL)?;
            let mut log_storage = log
                .as_ref()
                .map(|_| vec![0u8; super::LOG_BUF_SIZE]);
            let mut sys_attr = ProgLoadAttrSys {
                prog_type: attr.prog_type,
                insn_cnt: (attr.insns.len() / crate::ebpf::INSN_SIZE) as u32,
                insns: attr.insns.as_ptr() as u64,
                license: license.as_ptr() as u64,
                kern_version: attr.kern_version,
                prog_name: obj_name(attr.name),
                prog_ifindex: attr.prog_ifindex,
                expected_attach_type: attr.expected_attach_type,
                ..ProgLoadAttrSys::default()
            };
            if let Some(buf) = log_storage.as_mut() {
                sys_attr.log_level = 1;
                sys_attr.log_size = buf.len() as u32;
                sys_attr.log_buf = buf.as_mut_ptr() as u64;
            }
            let result = bpf(BPF_PROG_LOAD, &mut sys_attr).map(|fd| fd as RawFd);
            if let (Some(out), Some(buf)) = (log, log_storage.as_ref()) {
                let len = buf.iter().position(|&byte| byte == 0).unwrap_or(buf.len());
                out.extend_from_slice(&buf[..len]);
            }
            result
        }

        fn pin(&self, fd: RawFd, path: &Path) -> Result<(), i32> {
            let pathname =
                CString::new(path.as_os_str().as_bytes()).map_err(|_| libc::EINVAL)?;
            let mut sys_attr = ObjPinAttrSys {
                pathname: pathname.as_ptr() as u64,
                bpf_fd: fd as u32,
                file_flags: 0,
            };
            bpf(BPF_OBJ_PIN, &mut sys_attr).map(|_| ())
        }

        fn object_info_by_fd(&self, fd: RawFd) -> Result<MapInfo, i32> {
            let mut info = MapInfoSys::default();
            let mut sys_attr = InfoByFdAttrSys {
                bpf_fd: fd as u32,
                info_len: std::mem::size_of::<MapInfoSys>() as u32,
                info: &mut info as *mut MapInfoSys as u64,
            };
            bpf(BPF_OBJ_GET_INFO_BY_FD, &mut sys_attr)?;
            let name_len = info
                .name
                .iter()
                .position(|&byte| byte == 0)
                .unwrap_or(OBJ_NAME_LEN);
            Ok(MapInfo {
                name: String::from_utf8_lossy(&info.name[..name_len]).into_owned(),
                map_type: info.map_type,
                key_size: info.key_size,
                value_size: info.value_size,
                max_entries: info.max_entries,
                map_flags: info.map_flags,
                btf_key_type_id: info.btf_key_type_id,
                btf_value_type_id: info.btf_value_type_id,
            })
        }

        fn dup_cloexec(&self, fd: RawFd) -> Result<RawFd, i32> {
            let new_fd = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 3) };
            if new_fd < 0 {
                Err(std::io::Error::last_os_error()
                    .raw_os_error()
                    .unwrap_or(libc::EIO))
            } else {
                Ok(new_fd)
            }
        }

        fn close(&self, fd: RawFd) {
            unsafe { libc::close(fd) };
        }
    }
}
