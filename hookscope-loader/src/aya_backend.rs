use crate::probe::{Capability, KernelBackend, ProbeHandle, UProbeSpec};
use crate::{LoaderError, Result};
use aya::maps::{Map, MapData};
use aya::programs::{uprobe::UProbeLinkId, UProbe};
use aya::{Ebpf, EbpfLoader, VerifierLogLevel};
use libc as c;
use std::collections::{HashMap, HashSet};
use std::io;
use std::os::fd::{AsFd, AsRawFd};
use tracing::{error, info, warn};

/// Real kernel backend: loads the probe-handler eBPF object, attaches
/// uprobes at absolute file offsets, and writes symaddr map elements
/// through the bpf(2) syscall.
pub struct AyaBackend {
    bpf: Ebpf,
    map_fds: HashMap<Capability, MapData>,
    links: HashMap<u64, (String, UProbeLinkId)>,
    loaded_programs: HashSet<String>,
    next_handle: u64,
}

impl std::fmt::Debug for AyaBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AyaBackend")
            .field("bpf", &"<eBPF object>")
            .field("links", &self.links.len())
            .finish()
    }
}

impl AyaBackend {
    /// Load the probe-handler object and take ownership of the five
    /// symaddr maps it declares. A missing map is fatal: the kernel
    /// object and this binary disagree on the record layout version.
    pub fn load(bytecode: &[u8]) -> Result<Self> {
        info!("loading eBPF object ({} bytes)", bytecode.len());
        let mut bpf = EbpfLoader::new()
            .verifier_log_level(VerifierLogLevel::DEBUG | VerifierLogLevel::STATS)
            .load(bytecode)
            .inspect_err(|e| error!("eBPF object load failed: {e}"))?;

        let mut map_fds = HashMap::new();
        for cap in Capability::ALL {
            let map = bpf
                .take_map(cap.map_name())
                .ok_or_else(|| LoaderError::MapNotFound(cap.map_name().to_string()))?;
            let data = match map {
                Map::HashMap(data) => data,
                _ => return Err(LoaderError::MapNotFound(cap.map_name().to_string())),
            };
            map_fds.insert(cap, data);
        }

        Ok(Self {
            bpf,
            map_fds,
            links: HashMap::new(),
            loaded_programs: HashSet::new(),
            next_handle: 0,
        })
    }

    fn program_mut(&mut self, name: &str) -> Result<&mut UProbe> {
        let program = self
            .bpf
            .program_mut(name)
            .ok_or_else(|| LoaderError::ProgramNotFound(name.to_string()))?;
        let uprobe: &mut UProbe = program
            .try_into()
            .map_err(|e| LoaderError::ProgramNotFound(format!("{name} is not a uprobe: {e:?}")))?;
        Ok(uprobe)
    }
}

impl KernelBackend for AyaBackend {
    fn attach_uprobe(&mut self, spec: &UProbeSpec) -> Result<ProbeHandle> {
        let program_name = spec.probe_fn.clone();
        let needs_load = !self.loaded_programs.contains(&program_name);
        let program = self.program_mut(&program_name)?;
        if needs_load {
            program.load()?;
        }

        let link = program
            .attach(None, spec.address, &spec.binary_path, None)
            .map_err(|e| LoaderError::AttachFailed {
                binary: spec.binary_path.clone(),
                offset: spec.address,
                probe_fn: spec.probe_fn.clone(),
                reason: e.to_string(),
            })?;

        self.loaded_programs.insert(program_name.clone());
        self.next_handle += 1;
        self.links.insert(self.next_handle, (program_name, link));
        Ok(ProbeHandle(self.next_handle))
    }

    fn detach_uprobe(&mut self, handle: ProbeHandle) -> Result<()> {
        let (program_name, link) = self
            .links
            .remove(&handle.0)
            .ok_or(LoaderError::UnknownHandle(handle.0))?;
        let program = self.program_mut(&program_name)?;
        program.detach(link)?;
        Ok(())
    }

    fn map_update(&mut self, cap: Capability, pid: u32, value: &[u8]) -> Result<()> {
        let data = self.map_fds.get(&cap).expect("all maps taken at load");
        let fd = data.fd().as_fd().as_raw_fd();
        bpf_map_update_elem(fd, &pid as *const _ as *const c::c_void, value).map_err(|e| {
            warn!("map update failed: {} pid {}: {}", cap.map_name(), pid, e);
            LoaderError::MapWrite {
                map: cap.map_name(),
                pid,
                source: e,
            }
        })
    }

    fn map_delete(&mut self, cap: Capability, pid: u32) -> Result<()> {
        let data = self.map_fds.get(&cap).expect("all maps taken at load");
        let fd = data.fd().as_fd().as_raw_fd();
        bpf_map_delete_elem(fd, &pid as *const _ as *const c::c_void).map_err(|e| {
            LoaderError::MapWrite {
                map: cap.map_name(),
                pid,
                source: e,
            }
        })
    }
}

// Raw bpf(2) element ops. Values are opaque byte records whose size is
// validated by the kernel against the map definition, which keeps this
// backend independent of the per-capability record types.

const BPF_MAP_DELETE_ELEM: c::c_long = 1; // from linux/bpf.h
const BPF_MAP_UPDATE_ELEM: c::c_long = 2; // from linux/bpf.h

#[repr(C)]
struct BpfMapElemAttr {
    map_fd: u32,
    _pad: u32, // align to 64-bit for following fields
    key: u64,
    value: u64,
    flags: u64,
}

fn bpf_map_update_elem(fd: i32, key: *const c::c_void, value: &[u8]) -> io::Result<()> {
    let attr = BpfMapElemAttr {
        map_fd: fd as u32,
        _pad: 0,
        key: key as usize as u64,
        value: value.as_ptr() as usize as u64,
        flags: 0, // BPF_ANY: create or overwrite
    };
    let ret = unsafe {
        c::syscall(
            c::SYS_bpf,
            BPF_MAP_UPDATE_ELEM,
            &attr,
            std::mem::size_of::<BpfMapElemAttr>(),
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn bpf_map_delete_elem(fd: i32, key: *const c::c_void) -> io::Result<()> {
    let attr = BpfMapElemAttr {
        map_fd: fd as u32,
        _pad: 0,
        key: key as usize as u64,
        value: 0,
        flags: 0,
    };
    let ret = unsafe {
        c::syscall(
            c::SYS_bpf,
            BPF_MAP_DELETE_ELEM,
            &attr,
            std::mem::size_of::<BpfMapElemAttr>(),
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}
