use std::{
    ffi::CString,
    fs::File,
    io, mem,
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
        unix::{ffi::OsStrExt, fs::OpenOptionsExt},
    },
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use log::{debug, info};
use serde::Serialize;

use crate::error::{AttachError, InitError};
use crate::feature_matrix::{PlanStep, Program};

pub const DEFAULT_PIN_ROOT: &str = "/sys/fs/bpf/traffic_tagger";

const BPF_OBJ_GET: libc::c_long = 7;
const BPF_PROG_ATTACH: libc::c_long = 8;
const BPF_PROG_QUERY: libc::c_long = 16;
const BPF_F_RDONLY: u32 = 1 << 3;

/// cgroup hook points a program can be attached to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPoint {
    InetIngress,
    InetEgress,
    InetSockCreate,
    Inet4Bind,
    Inet6Bind,
    SetSockOpt,
}

impl HookPoint {
    /// `enum bpf_attach_type` value from the kernel uapi.
    pub fn attach_type(self) -> u32 {
        match self {
            HookPoint::InetIngress => 0,
            HookPoint::InetEgress => 1,
            HookPoint::InetSockCreate => 2,
            HookPoint::Inet4Bind => 8,
            HookPoint::Inet6Bind => 9,
            HookPoint::SetSockOpt => 22,
        }
    }
}

/// Where the external loader pins each program under the pin root.
#[derive(Clone, Debug)]
pub struct ProgramLayout {
    pub pin_root: PathBuf,
}

impl ProgramLayout {
    pub fn new(pin_root: impl Into<PathBuf>) -> Self {
        Self {
            pin_root: pin_root.into(),
        }
    }

    pub fn path(&self, program: Program) -> PathBuf {
        self.pin_root.join(program.pin_name())
    }
}

impl Default for ProgramLayout {
    fn default() -> Self {
        Self::new(DEFAULT_PIN_ROOT)
    }
}

/// Kernel operations needed to wire pinned programs into a cgroup.
pub trait ProgramHost {
    /// Opens a pinned program by bpffs path.
    fn retrieve(&self, path: &Path) -> io::Result<OwnedFd>;
    fn attach(
        &self,
        hook: HookPoint,
        program: BorrowedFd<'_>,
        cgroup: BorrowedFd<'_>,
    ) -> io::Result<()>;
    /// Number of programs currently attached at `hook` on `cgroup`.
    fn query(&self, hook: HookPoint, cgroup: BorrowedFd<'_>) -> io::Result<u32>;
}

/// [`ProgramHost`] backed by raw `bpf(2)` calls.
///
/// aya's cgroup `attach` returns links that detach on drop and, from 5.7,
/// creates a `bpf_link` instead of a legacy attachment. Attachments made
/// here must outlive this process and stay replaceable by the platform, so
/// `BPF_PROG_ATTACH` is issued directly. aya has no public program query.
#[derive(Clone, Copy, Debug, Default)]
pub struct BpfSyscalls;

#[repr(C)]
#[derive(Default)]
struct ObjGetAttr {
    pathname: u64,
    bpf_fd: u32,
    file_flags: u32,
}

#[repr(C)]
#[derive(Default)]
struct ProgAttachAttr {
    target_fd: u32,
    attach_bpf_fd: u32,
    attach_type: u32,
    attach_flags: u32,
    replace_bpf_fd: u32,
}

#[repr(C)]
#[derive(Default)]
struct ProgQueryAttr {
    target_fd: u32,
    attach_type: u32,
    query_flags: u32,
    attach_flags: u32,
    prog_ids: u64,
    prog_cnt: u32,
}

fn bpf<T>(cmd: libc::c_long, attr: &mut T) -> io::Result<libc::c_long> {
    let rc = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd,
            attr as *mut T as *mut libc::c_void,
            mem::size_of::<T>() as libc::c_uint,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc)
}

impl ProgramHost for BpfSyscalls {
    fn retrieve(&self, path: &Path) -> io::Result<OwnedFd> {
        let pathname = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let mut attr = ObjGetAttr {
            pathname: pathname.as_ptr() as u64,
            bpf_fd: 0,
            file_flags: BPF_F_RDONLY,
        };
        let fd = bpf(BPF_OBJ_GET, &mut attr)?;
        Ok(unsafe { OwnedFd::from_raw_fd(fd as libc::c_int) })
    }

    fn attach(
        &self,
        hook: HookPoint,
        program: BorrowedFd<'_>,
        cgroup: BorrowedFd<'_>,
    ) -> io::Result<()> {
        let mut attr = ProgAttachAttr {
            target_fd: cgroup.as_raw_fd() as u32,
            attach_bpf_fd: program.as_raw_fd() as u32,
            attach_type: hook.attach_type(),
            ..Default::default()
        };
        bpf(BPF_PROG_ATTACH, &mut attr).map(|_| ())
    }

    fn query(&self, hook: HookPoint, cgroup: BorrowedFd<'_>) -> io::Result<u32> {
        // With a zero-sized id buffer the kernel only reports the count.
        let mut attr = ProgQueryAttr {
            target_fd: cgroup.as_raw_fd() as u32,
            attach_type: hook.attach_type(),
            ..Default::default()
        };
        bpf(BPF_PROG_QUERY, &mut attr)?;
        Ok(attr.prog_cnt)
    }
}

/// Opens the cgroup v2 directory programs are attached to.
pub fn open_cgroup(path: &Path) -> Result<OwnedFd> {
    let dir = File::options()
        .read(true)
        .custom_flags(libc::O_DIRECTORY | libc::O_CLOEXEC)
        .open(path)
        .with_context(|| format!("failed to open cgroup directory {}", path.display()))?;
    Ok(OwnedFd::from(dir))
}

pub fn check_accessible(host: &impl ProgramHost, path: &Path) -> Result<(), AttachError> {
    host.retrieve(path)
        .map(drop)
        .map_err(|source| AttachError::ProgramUnavailable {
            path: path.to_path_buf(),
            source,
        })
}

pub fn attach_program(
    host: &impl ProgramHost,
    path: &Path,
    hook: HookPoint,
    cgroup: BorrowedFd<'_>,
) -> Result<(), AttachError> {
    let program = host
        .retrieve(path)
        .map_err(|source| AttachError::ProgramUnavailable {
            path: path.to_path_buf(),
            source,
        })?;
    host.attach(hook, program.as_fd(), cgroup)
        .map_err(|source| AttachError::AttachRejected {
            path: path.to_path_buf(),
            hook,
            source,
        })?;
    debug!("attached {} to {hook:?}", path.display());
    Ok(())
}

/// Confirms the kernel reports at least one program at `hook`. A failed
/// query counts as a mismatch too: the attach just succeeded.
pub fn verify_attached(
    host: &impl ProgramHost,
    hook: HookPoint,
    cgroup: BorrowedFd<'_>,
) -> Result<u32, InitError> {
    match host.query(hook, cgroup) {
        Ok(count) if count > 0 => Ok(count),
        _ => Err(InitError::VerificationInconsistency { hook }),
    }
}

/// Runs an attach plan step by step, stopping at the first failure.
pub fn execute_plan(
    host: &impl ProgramHost,
    layout: &ProgramLayout,
    steps: &[PlanStep],
    cgroup: BorrowedFd<'_>,
) -> Result<(), InitError> {
    for step in steps {
        match *step {
            PlanStep::CheckAccessible(program) => {
                check_accessible(host, &layout.path(program))?;
            }
            PlanStep::Attach { program, hook } => {
                attach_program(host, &layout.path(program), hook, cgroup)?;
            }
            PlanStep::Verify(hook) => {
                let count = verify_attached(host, hook, cgroup)?;
                debug!("{hook:?} has {count} program(s) attached");
            }
        }
    }
    info!("attach plan complete ({} steps)", steps.len());
    Ok(())
}

#[cfg(test)]
pub(crate) mod fake {
    use std::{
        cell::RefCell,
        collections::{HashMap, HashSet},
    };

    use super::*;

    /// In-process [`ProgramHost`] recording attachments by hook.
    #[derive(Default)]
    pub struct FakeHost {
        pub missing: HashSet<PathBuf>,
        pub rejected: HashSet<HookPoint>,
        /// Hooks whose attach succeeds but never shows up in a query.
        pub phantom: HashSet<HookPoint>,
        pub attached: RefCell<HashMap<HookPoint, u32>>,
        pub log: RefCell<Vec<String>>,
    }

    impl ProgramHost for FakeHost {
        fn retrieve(&self, path: &Path) -> io::Result<OwnedFd> {
            if self.missing.contains(path) {
                return Err(io::Error::from_raw_os_error(libc::ENOENT));
            }
            self.log
                .borrow_mut()
                .push(format!("retrieve {}", path.display()));
            Ok(OwnedFd::from(File::open("/dev/null")?))
        }

        fn attach(
            &self,
            hook: HookPoint,
            _program: BorrowedFd<'_>,
            _cgroup: BorrowedFd<'_>,
        ) -> io::Result<()> {
            if self.rejected.contains(&hook) {
                return Err(io::Error::from_raw_os_error(libc::EINVAL));
            }
            self.log.borrow_mut().push(format!("attach {hook:?}"));
            if !self.phantom.contains(&hook) {
                *self.attached.borrow_mut().entry(hook).or_default() += 1;
            }
            Ok(())
        }

        fn query(&self, hook: HookPoint, _cgroup: BorrowedFd<'_>) -> io::Result<u32> {
            self.log.borrow_mut().push(format!("query {hook:?}"));
            Ok(self.attached.borrow().get(&hook).copied().unwrap_or(0))
        }
    }
}
