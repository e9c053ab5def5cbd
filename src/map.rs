//! Kernel map records.

use crate::btf::{TypeInfo, BTF_KIND_STRUCT};
use crate::error::Error;
use crate::kernel::{check_path, KernelBpf};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};
use std::any::Any;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;

/// Fixed-size map definition as laid out in the maps section.
///
/// All fields are 32-bit little-endian words in the object file. Objects
/// built against a newer definition may append fields; the loader keeps
/// this prefix and requires the rest to be zero.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MapDef {
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
}

/// Byte length of the known definition shape
pub const MAP_DEF_SIZE: usize = 20;

/// Map type id of the perf event array, which is never device-bound
pub const MAP_TYPE_PERF_EVENT_ARRAY: u32 = 4;

impl MapDef {
    /// Decodes a definition prefix; fields the prefix does not cover
    /// default to zero.
    pub(crate) fn from_bytes(bytes: &[u8]) -> MapDef {
        let word = |index: usize| {
            bytes
                .get(index * 4..index * 4 + 4)
                .map(LittleEndian::read_u32)
                .unwrap_or(0)
        };
        MapDef {
            map_type: word(0),
            key_size: word(1),
            value_size: word(2),
            max_entries: word(3),
            map_flags: word(4),
        }
    }
}

/// One kernel map resource owned by an [`Object`](crate::object::Object).
pub struct Map {
    pub(crate) name: String,
    /// Offset of the definition within the maps section; the sort key
    /// and the match key for data-load relocations.
    pub(crate) offset: u64,
    pub(crate) fd: RawFd,
    pub(crate) ifindex: u32,
    pub(crate) def: MapDef,
    pub(crate) btf_key_type_id: u32,
    pub(crate) btf_value_type_id: u32,
    pub(crate) kernel: Arc<dyn KernelBpf>,
    pub(crate) priv_data: Option<Box<dyn Any>>,
}

impl Map {
    pub(crate) fn new(name: String, offset: u64, def: MapDef, kernel: Arc<dyn KernelBpf>) -> Map {
        Map {
            name,
            offset,
            // -1 so a failure path never closes somebody else's descriptor
            fd: -1,
            ifindex: 0,
            def,
            btf_key_type_id: 0,
            btf_value_type_id: 0,
            kernel,
            priv_data: None,
        }
    }

    /// Returns the map name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the kernel descriptor, or -1 before creation.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Returns the map definition.
    pub fn def(&self) -> &MapDef {
        &self.def
    }

    /// Returns the type id of the key, or zero when no metadata is attached.
    pub fn btf_key_type_id(&self) -> u32 {
        self.btf_key_type_id
    }

    /// Returns the type id of the value, or zero when no metadata is attached.
    pub fn btf_value_type_id(&self) -> u32 {
        self.btf_value_type_id
    }

    /// Binds the map to a network device for offload.
    pub fn set_ifindex(&mut self, ifindex: u32) {
        self.ifindex = ifindex;
    }

    /// Whether the map type is never bound to a device.
    pub fn is_offload_neutral(&self) -> bool {
        self.def.map_type == MAP_TYPE_PERF_EVENT_ARRAY
    }

    /// Adopts an existing kernel descriptor instead of creating a map.
    ///
    /// The descriptor is duplicated with close-on-exec set; name,
    /// definition and type-metadata ids are refreshed from the kernel's
    /// view. `fd` itself stays owned by the caller.
    pub fn reuse_fd(&mut self, fd: RawFd) -> Result<(), Error> {
        let info = self.kernel.object_info_by_fd(fd).map_err(Error::Os)?;
        let new_fd = self.kernel.dup_cloexec(fd).map_err(Error::Os)?;
        if self.fd >= 0 {
            self.kernel.close(self.fd);
        }
        self.fd = new_fd;
        self.name = info.name;
        self.def.map_type = info.map_type;
        self.def.key_size = info.key_size;
        self.def.value_size = info.value_size;
        self.def.max_entries = info.max_entries;
        self.def.map_flags = info.map_flags;
        self.btf_key_type_id = info.btf_key_type_id;
        self.btf_value_type_id = info.btf_value_type_id;
        Ok(())
    }

    /// Pins the map at `path` on the bpf filesystem.
    pub fn pin(&self, path: &Path) -> Result<(), Error> {
        check_path(path)?;
        self.kernel.pin(self.fd, path).map_err(|errno| {
            warn!("failed to pin map: errno {errno}");
            Error::Os(errno)
        })?;
        debug!("pinned map '{}'", path.display());
        Ok(())
    }

    /// Attaches caller-owned data to the map.
    pub fn set_priv(&mut self, priv_data: Box<dyn Any>) {
        self.priv_data = Some(priv_data);
    }

    /// Returns the caller-owned data attached to the map.
    pub fn priv_data(&self) -> Option<&dyn Any> {
        self.priv_data.as_deref()
    }

    pub(crate) fn unload(&mut self) {
        if self.fd >= 0 {
            self.kernel.close(self.fd);
            self.fd = -1;
        }
    }
}

impl Drop for Map {
    fn drop(&mut self) {
        self.unload();
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("name", &self.name)
            .field("offset", &self.offset)
            .field("fd", &self.fd)
            .field("def", &self.def)
            .finish()
    }
}

/// Resolves the `____btf_map_<name>` container for a map and records the
/// key and value type ids when the metadata agrees with the definition.
pub(crate) fn find_btf_info(map: &mut Map, btf: &dyn TypeInfo) -> Result<(), Error> {
    let container_name = format!("____btf_map_{}", map.name);
    let container_id = match btf.find_by_name(&container_name) {
        Some(id) => id,
        None => {
            debug!(
                "map:{} container_name:{container_name} cannot be found in BTF",
                map.name
            );
            return Err(Error::NotFound(container_name));
        }
    };
    let container = btf.type_by_id(container_id).ok_or_else(|| {
        warn!(
            "map:{} cannot find BTF type for container_id:{container_id}",
            map.name
        );
        Error::InvalidInput(format!("missing type record {container_id}"))
    })?;
    if container.kind != BTF_KIND_STRUCT || container.members.len() < 2 {
        warn!(
            "map:{} container_name:{container_name} is an invalid container struct",
            map.name
        );
        return Err(Error::InvalidInput(container_name));
    }
    let key = &container.members[0];
    let value = &container.members[1];

    let key_size = btf.resolve_size(key.type_id).ok_or_else(|| {
        warn!("map:{} invalid BTF key_type_size", map.name);
        Error::InvalidInput("unsized key type".to_string())
    })?;
    if map.def.key_size != key_size {
        warn!(
            "map:{} btf_key_type_size:{key_size} != map_def_key_size:{}",
            map.name, map.def.key_size
        );
        return Err(Error::InvalidInput("key size mismatch".to_string()));
    }
    let value_size = btf.resolve_size(value.type_id).ok_or_else(|| {
        warn!("map:{} invalid BTF value_type_size", map.name);
        Error::InvalidInput("unsized value type".to_string())
    })?;
    if map.def.value_size != value_size {
        warn!(
            "map:{} btf_value_type_size:{value_size} != map_def_value_size:{}",
            map.name, map.def.value_size
        );
        return Err(Error::InvalidInput("value size mismatch".to_string()));
    }

    map.btf_key_type_id = key.type_id;
    map.btf_value_type_id = value.type_id;
    Ok(())
}
