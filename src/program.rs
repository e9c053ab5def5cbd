//! Program records and kernel submission.

use crate::ebpf;
use crate::error::Error;
use crate::kernel::{check_path, make_dir, KernelBpf, ProgLoadAttr};
use log::{debug, warn};
use std::any::Any;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;

/// Kernel program type ids.
#[allow(missing_docs)]
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
#[repr(u32)]
pub enum ProgramType {
    #[default]
    Unspec = 0,
    SocketFilter = 1,
    Kprobe = 2,
    SchedCls = 3,
    SchedAct = 4,
    Tracepoint = 5,
    Xdp = 6,
    PerfEvent = 7,
    CgroupSkb = 8,
    CgroupSock = 9,
    LwtIn = 10,
    LwtOut = 11,
    LwtXmit = 12,
    SockOps = 13,
    SkSkb = 14,
    CgroupDevice = 15,
    SkMsg = 16,
    RawTracepoint = 17,
    CgroupSockAddr = 18,
    LwtSeg6local = 19,
    LircMode2 = 20,
}

impl ProgramType {
    /// Whether a program of this type is only accepted by the kernel when
    /// the object carries the kernel version it was built against.
    pub(crate) fn needs_kern_version(self) -> bool {
        matches!(
            self,
            ProgramType::Unspec
                | ProgramType::Kprobe
                | ProgramType::Tracepoint
                | ProgramType::PerfEvent
                | ProgramType::RawTracepoint
        )
    }
}

/// Kernel attach type ids.
#[allow(missing_docs)]
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
#[repr(u32)]
pub enum AttachType {
    #[default]
    CgroupInetIngress = 0,
    CgroupInetEgress = 1,
    CgroupInetSockCreate = 2,
    CgroupSockOps = 3,
    SkSkbStreamParser = 4,
    SkSkbStreamVerdict = 5,
    CgroupDevice = 6,
    SkMsgVerdict = 7,
    CgroupInet4Bind = 8,
    CgroupInet6Bind = 9,
    CgroupInet4Connect = 10,
    CgroupInet6Connect = 11,
    CgroupInet4PostBind = 12,
    CgroupInet6PostBind = 13,
    CgroupUdp4Sendmsg = 14,
    CgroupUdp6Sendmsg = 15,
    LircMode2 = 16,
}

/// A collected relocation, resolved and consumed by the load pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RelocDesc {
    /// Wide-immediate load to be stamped with a map descriptor
    Ld64 {
        /// Index of the first instruction slot of the load
        insn_idx: usize,
        /// Index into the object's sorted map array
        map_idx: usize,
    },
    /// Program-local call into the shared `.text` pool
    Call {
        /// Index of the call instruction
        insn_idx: usize,
        /// Offset of the callee within `.text`
        text_off: u64,
    },
}

/// Descriptors of the loaded realizations of one program.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) enum Instances {
    /// Nothing loaded and no instance count configured yet
    #[default]
    Uninit,
    /// One slot per instance; -1 marks an explicitly skipped instance
    Fds(Vec<RawFd>),
}

/// Callback deriving a per-instance instruction stream from a program's
/// buffer. Returning `Ok(None)` skips the instance.
pub type ProgramPrep = Box<dyn Fn(usize, &[u8]) -> Result<Option<Vec<u8>>, Error>>;

/// One verifier-bound bytecode unit of an [`Object`](crate::object::Object).
pub struct Program {
    /// Index of the backing section in the object file; the join key for
    /// relocation sections.
    pub(crate) shndx: usize,
    pub(crate) name: String,
    pub(crate) section_name: String,
    pub(crate) insns: Vec<u8>,
    /// Length before `.text` was appended; zero until inlining happens
    pub(crate) main_prog_cnt: usize,
    pub(crate) relocs: Vec<RelocDesc>,
    pub(crate) prog_type: ProgramType,
    pub(crate) expected_attach_type: AttachType,
    pub(crate) ifindex: u32,
    pub(crate) preprocessor: Option<ProgramPrep>,
    pub(crate) instances: Instances,
    pub(crate) kernel: Arc<dyn KernelBpf>,
    pub(crate) priv_data: Option<Box<dyn Any>>,
}

impl Program {
    pub(crate) fn new(
        data: &[u8],
        section_name: String,
        shndx: usize,
        kernel: Arc<dyn KernelBpf>,
    ) -> Result<Program, Error> {
        if data.len() < ebpf::INSN_SIZE {
            warn!("corrupted section '{section_name}'");
            return Err(Error::InvalidInput(format!(
                "section '{section_name}' is too small"
            )));
        }
        let insns_cnt = data.len() / ebpf::INSN_SIZE;
        Ok(Program {
            shndx,
            name: String::new(),
            section_name,
            insns: data[..insns_cnt * ebpf::INSN_SIZE].to_vec(),
            main_prog_cnt: 0,
            relocs: Vec::new(),
            prog_type: ProgramType::Kprobe,
            expected_attach_type: AttachType::default(),
            ifindex: 0,
            preprocessor: None,
            instances: Instances::Uninit,
            kernel,
            priv_data: None,
        })
    }

    /// Returns the canonical program name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the name of the backing object section.
    pub fn section_name(&self) -> &str {
        &self.section_name
    }

    /// Number of instructions currently in the buffer.
    pub fn insns_cnt(&self) -> usize {
        self.insns.len() / ebpf::INSN_SIZE
    }

    /// Sets the program type.
    pub fn set_type(&mut self, prog_type: ProgramType) {
        self.prog_type = prog_type;
    }

    /// Sets the expected attach type submitted alongside the program.
    pub fn set_expected_attach_type(&mut self, attach_type: AttachType) {
        self.expected_attach_type = attach_type;
    }

    /// Binds the program to a network device for offload.
    pub fn set_ifindex(&mut self, ifindex: u32) {
        self.ifindex = ifindex;
    }

    /// Configures a pre-processor deriving `nr_instances` instruction
    /// streams from this program.
    pub fn set_prep(&mut self, nr_instances: usize, prep: ProgramPrep) -> Result<(), Error> {
        if nr_instances == 0 {
            return Err(Error::InvalidInput("no instances requested".to_string()));
        }
        if self.instances != Instances::Uninit {
            warn!("can't set pre-processor after loading");
            return Err(Error::InvalidInput(
                "pre-processor set after loading".to_string(),
            ));
        }
        self.instances = Instances::Fds(vec![-1; nr_instances]);
        self.preprocessor = Some(prep);
        Ok(())
    }

    /// Returns the descriptor of instance `n`.
    pub fn nth_fd(&self, n: usize) -> Result<RawFd, Error> {
        let fds = match &self.instances {
            Instances::Fds(fds) => fds,
            Instances::Uninit => {
                return Err(Error::InvalidInput(format!(
                    "program '{}' is not loaded",
                    self.section_name
                )))
            }
        };
        let fd = *fds.get(n).ok_or_else(|| {
            warn!(
                "can't get the {n}th fd from program {}: only {} instances",
                self.section_name,
                fds.len()
            );
            Error::InvalidInput(format!("no instance {n}"))
        })?;
        if fd < 0 {
            warn!(
                "{n}th instance of program '{}' is invalid",
                self.section_name
            );
            return Err(Error::NotFound(format!("instance {n} was skipped")));
        }
        Ok(fd)
    }

    /// Returns the descriptor of the first instance.
    pub fn fd(&self) -> Result<RawFd, Error> {
        self.nth_fd(0)
    }

    /// Attaches caller-owned data to the program.
    pub fn set_priv(&mut self, priv_data: Box<dyn Any>) {
        self.priv_data = Some(priv_data);
    }

    /// Returns the caller-owned data attached to the program.
    pub fn priv_data(&self) -> Option<&dyn Any> {
        self.priv_data.as_deref()
    }

    /// Pins instance `n` at `path` on the bpf filesystem.
    pub fn pin_instance(&self, path: &Path, n: usize) -> Result<(), Error> {
        check_path(path)?;
        let fd = self.nth_fd(n)?;
        self.kernel.pin(fd, path).map_err(|errno| {
            warn!("failed to pin program: errno {errno}");
            Error::Os(errno)
        })?;
        debug!("pinned program '{}'", path.display());
        Ok(())
    }

    /// Pins every instance below `path`, one entry per instance index.
    pub fn pin(&self, path: &Path) -> Result<(), Error> {
        check_path(path)?;
        let nr_instances = match &self.instances {
            Instances::Fds(fds) if !fds.is_empty() => fds.len(),
            _ => {
                warn!("no instances of prog {} to pin", self.section_name);
                return Err(Error::InvalidInput(format!(
                    "program '{}' has no instances",
                    self.section_name
                )));
            }
        };
        make_dir(path)?;
        for n in 0..nr_instances {
            self.pin_instance(&path.join(n.to_string()), n)?;
        }
        Ok(())
    }

    /// Submits the program to the kernel, one request per instance.
    pub(crate) fn load(&mut self, license: &str, kern_version: u32) -> Result<(), Error> {
        let result = self.load_instances(license, kern_version);
        if result.is_err() {
            warn!("failed to load program '{}'", self.section_name);
        }
        // the kernel holds the authoritative copy from here on
        self.insns = Vec::new();
        result
    }

    fn load_instances(&mut self, license: &str, kern_version: u32) -> Result<(), Error> {
        if self.instances == Instances::Uninit {
            if self.preprocessor.is_some() {
                warn!("internal error: can't load program '{}'", self.section_name);
                return Err(Error::Internal(format!(
                    "pre-processor without instances on '{}'",
                    self.section_name
                )));
            }
            self.instances = Instances::Fds(vec![-1]);
        }
        let mut fds = match std::mem::take(&mut self.instances) {
            Instances::Fds(fds) => fds,
            Instances::Uninit => unreachable!(),
        };

        let result = self.fill_instances(&mut fds, license, kern_version);
        self.instances = Instances::Fds(fds);
        result
    }

    fn fill_instances(
        &self,
        fds: &mut [RawFd],
        license: &str,
        kern_version: u32,
    ) -> Result<(), Error> {
        let preprocessor = match &self.preprocessor {
            Some(preprocessor) => preprocessor,
            None => {
                if fds.len() != 1 {
                    warn!(
                        "program '{}' is inconsistent: nr({}) != 1",
                        self.section_name,
                        fds.len()
                    );
                }
                fds[0] = load_program(
                    &*self.kernel,
                    self.prog_type,
                    self.expected_attach_type,
                    &self.name,
                    &self.insns,
                    license,
                    kern_version,
                    self.ifindex,
                )?;
                return Ok(());
            }
        };

        for (n, slot) in fds.iter_mut().enumerate() {
            let instance_insns = preprocessor(n, &self.insns).map_err(|err| {
                warn!(
                    "preprocessing the {n}th instance of program '{}' failed",
                    self.section_name
                );
                err
            })?;
            match instance_insns {
                None => {
                    debug!(
                        "skip loading the {n}th instance of program '{}'",
                        self.section_name
                    );
                    *slot = -1;
                }
                Some(insns) => {
                    *slot = load_program(
                        &*self.kernel,
                        self.prog_type,
                        self.expected_attach_type,
                        &self.name,
                        &insns,
                        license,
                        kern_version,
                        self.ifindex,
                    )
                    .map_err(|err| {
                        warn!(
                            "loading the {n}th instance of program '{}' failed",
                            self.section_name
                        );
                        err
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Closes every instance descriptor and forgets the instance setup.
    pub(crate) fn unload(&mut self) {
        if let Instances::Fds(fds) = std::mem::take(&mut self.instances) {
            for fd in fds {
                if fd >= 0 {
                    self.kernel.close(fd);
                }
            }
        }
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        self.unload();
    }
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("name", &self.name)
            .field("section_name", &self.section_name)
            .field("shndx", &self.shndx)
            .field("insns_cnt", &self.insns_cnt())
            .field("prog_type", &self.prog_type)
            .finish()
    }
}

macro_rules! prog_type_fns {
    ($(#[$attr:meta])* $set:ident, $is:ident, $variant:ident) => {
        $(#[$attr])*
        pub fn $set(&mut self) {
            self.set_type(ProgramType::$variant);
        }

        /// Queries the corresponding program type.
        pub fn $is(&self) -> bool {
            self.prog_type == ProgramType::$variant
        }
    };
}

impl Program {
    prog_type_fns!(
        /// Marks the program as a socket filter.
        set_socket_filter,
        is_socket_filter,
        SocketFilter
    );
    prog_type_fns!(
        /// Marks the program as a kprobe.
        set_kprobe,
        is_kprobe,
        Kprobe
    );
    prog_type_fns!(
        /// Marks the program as a traffic classifier.
        set_sched_cls,
        is_sched_cls,
        SchedCls
    );
    prog_type_fns!(
        /// Marks the program as a traffic action.
        set_sched_act,
        is_sched_act,
        SchedAct
    );
    prog_type_fns!(
        /// Marks the program as a tracepoint probe.
        set_tracepoint,
        is_tracepoint,
        Tracepoint
    );
    prog_type_fns!(
        /// Marks the program as a raw tracepoint probe.
        set_raw_tracepoint,
        is_raw_tracepoint,
        RawTracepoint
    );
    prog_type_fns!(
        /// Marks the program as an XDP program.
        set_xdp,
        is_xdp,
        Xdp
    );
    prog_type_fns!(
        /// Marks the program as a perf event handler.
        set_perf_event,
        is_perf_event,
        PerfEvent
    );
}

/// Submits one instruction stream and classifies a kernel rejection.
#[allow(clippy::too_many_arguments)]
fn load_program(
    kernel: &dyn KernelBpf,
    prog_type: ProgramType,
    expected_attach_type: AttachType,
    name: &str,
    insns: &[u8],
    license: &str,
    kern_version: u32,
    prog_ifindex: u32,
) -> Result<RawFd, Error> {
    if insns.is_empty() {
        return Err(Error::InvalidInput("empty instruction stream".to_string()));
    }
    let mut attr = ProgLoadAttr {
        prog_type: prog_type as u32,
        expected_attach_type: expected_attach_type as u32,
        name,
        insns,
        license,
        kern_version,
        prog_ifindex,
    };
    let mut log = Vec::new();
    let errno = match kernel.load_program(&attr, Some(&mut log)) {
        Ok(fd) => return Ok(fd),
        Err(errno) => errno,
    };
    warn!("load bpf program failed: errno {errno}");

    if !log.is_empty() {
        let text = String::from_utf8_lossy(&log).into_owned();
        warn!("-- BEGIN DUMP LOG ---\n{text}\n-- END LOG --");
        return Err(Error::Verify(text));
    }
    let insns_cnt = insns.len() / ebpf::INSN_SIZE;
    if insns_cnt >= ebpf::MAXINSNS {
        warn!(
            "program too large ({insns_cnt} insns), at most {} insns",
            ebpf::MAXINSNS
        );
        return Err(Error::ProgramTooBig(insns_cnt));
    }
    // Wrong program type?
    if prog_type != ProgramType::Kprobe {
        attr.prog_type = ProgramType::Kprobe as u32;
        attr.expected_attach_type = 0;
        if let Ok(fd) = kernel.load_program(&attr, None) {
            kernel.close(fd);
            return Err(Error::WrongProgramType);
        }
    }
    Err(Error::KernelVersionMismatch)
}

struct SectionDef {
    prefix: &'static str,
    prog_type: ProgramType,
    expected_attach_type: AttachType,
}

const fn sec(prefix: &'static str, prog_type: ProgramType) -> SectionDef {
    SectionDef {
        prefix,
        prog_type,
        expected_attach_type: AttachType::CgroupInetIngress,
    }
}

const fn sec_full(
    prefix: &'static str,
    prog_type: ProgramType,
    expected_attach_type: AttachType,
) -> SectionDef {
    SectionDef {
        prefix,
        prog_type,
        expected_attach_type,
    }
}

static SECTION_DEFS: [SectionDef; 28] = [
    sec("socket", ProgramType::SocketFilter),
    sec("kprobe/", ProgramType::Kprobe),
    sec("kretprobe/", ProgramType::Kprobe),
    sec("classifier", ProgramType::SchedCls),
    sec("action", ProgramType::SchedAct),
    sec("tracepoint/", ProgramType::Tracepoint),
    sec("raw_tracepoint/", ProgramType::RawTracepoint),
    sec("xdp", ProgramType::Xdp),
    sec("perf_event", ProgramType::PerfEvent),
    sec("cgroup/skb", ProgramType::CgroupSkb),
    sec("cgroup/sock", ProgramType::CgroupSock),
    sec("cgroup/dev", ProgramType::CgroupDevice),
    sec("lwt_in", ProgramType::LwtIn),
    sec("lwt_out", ProgramType::LwtOut),
    sec("lwt_xmit", ProgramType::LwtXmit),
    sec("lwt_seg6local", ProgramType::LwtSeg6local),
    sec("sockops", ProgramType::SockOps),
    sec("sk_skb", ProgramType::SkSkb),
    sec("sk_msg", ProgramType::SkMsg),
    sec("lirc_mode2", ProgramType::LircMode2),
    sec_full(
        "cgroup/bind4",
        ProgramType::CgroupSockAddr,
        AttachType::CgroupInet4Bind,
    ),
    sec_full(
        "cgroup/bind6",
        ProgramType::CgroupSockAddr,
        AttachType::CgroupInet6Bind,
    ),
    sec_full(
        "cgroup/connect4",
        ProgramType::CgroupSockAddr,
        AttachType::CgroupInet4Connect,
    ),
    sec_full(
        "cgroup/connect6",
        ProgramType::CgroupSockAddr,
        AttachType::CgroupInet6Connect,
    ),
    sec_full(
        "cgroup/sendmsg4",
        ProgramType::CgroupSockAddr,
        AttachType::CgroupUdp4Sendmsg,
    ),
    sec_full(
        "cgroup/sendmsg6",
        ProgramType::CgroupSockAddr,
        AttachType::CgroupUdp6Sendmsg,
    ),
    sec_full(
        "cgroup/post_bind4",
        ProgramType::CgroupSock,
        AttachType::CgroupInet4PostBind,
    ),
    sec_full(
        "cgroup/post_bind6",
        ProgramType::CgroupSock,
        AttachType::CgroupInet6PostBind,
    ),
];

/// Infers program and attach types from an object section name prefix.
pub fn prog_type_by_name(name: &str) -> Option<(ProgramType, AttachType)> {
    SECTION_DEFS
        .iter()
        .find(|def| name.starts_with(def.prefix))
        .map(|def| (def.prog_type, def.expected_attach_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prog_type_by_name() {
        assert_eq!(
            prog_type_by_name("kprobe/do_sys_open"),
            Some((ProgramType::Kprobe, AttachType::CgroupInetIngress))
        );
        assert_eq!(
            prog_type_by_name("cgroup/connect6"),
            Some((ProgramType::CgroupSockAddr, AttachType::CgroupInet6Connect))
        );
        assert_eq!(
            prog_type_by_name("cgroup/post_bind4"),
            Some((ProgramType::CgroupSock, AttachType::CgroupInet4PostBind))
        );
        assert_eq!(prog_type_by_name("uprobe/whatever"), None);
    }

    #[test]
    fn test_needs_kern_version() {
        assert!(ProgramType::Kprobe.needs_kern_version());
        assert!(ProgramType::Unspec.needs_kern_version());
        assert!(!ProgramType::Xdp.needs_kern_version());
        assert!(!ProgramType::CgroupSockAddr.needs_kern_version());
    }
}
