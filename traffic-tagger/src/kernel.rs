use std::{ffi::CStr, fmt, io, mem, str::FromStr};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;

/// `major.minor.sub` kernel release, ordered lexicographically.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub sub: u32,
}

impl KernelVersion {
    pub const fn new(major: u32, minor: u32, sub: u32) -> Self {
        Self { major, minor, sub }
    }

    fn from_aya(version: aya::util::KernelVersion) -> Result<Self> {
        version.to_string().parse()
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.sub)
    }
}

/// Parses a `uname -r` style release. Anything after the numeric prefix of
/// each component (`-android14`, `+`, `-rc1`) is ignored and a missing
/// component counts as zero.
impl FromStr for KernelVersion {
    type Err = anyhow::Error;

    fn from_str(release: &str) -> Result<Self> {
        let mut parts = release.trim().splitn(3, '.');
        let mut next = |required: bool| -> Result<u32> {
            let part = parts.next().unwrap_or("");
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            if digits.is_empty() {
                if required {
                    return Err(anyhow!("invalid kernel release '{release}'"));
                }
                return Ok(0);
            }
            digits
                .parse()
                .with_context(|| format!("kernel version component '{digits}' out of range"))
        };
        let major = next(true)?;
        let minor = next(true)?;
        let sub = next(false)?;
        Ok(Self { major, minor, sub })
    }
}

/// Kernel-side facts the feature matrix consumes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct KernelFacts {
    pub version: KernelVersion,
    pub kernel_32bit: bool,
    pub userspace_32bit: bool,
}

impl KernelFacts {
    /// Facts for the running system. The release comes from aya, which also
    /// sees through distro version quirks; bitness comes from `uname(2)`.
    pub fn running() -> Result<Self> {
        let version = aya::util::KernelVersion::current()
            .context("failed to read running kernel version")?;
        Ok(Self {
            version: KernelVersion::from_aya(version)?,
            kernel_32bit: !is_64bit_machine(&machine()?),
            userspace_32bit: cfg!(target_pointer_width = "32"),
        })
    }
}

fn machine() -> Result<String> {
    let mut uts: libc::utsname = unsafe { mem::zeroed() };
    let rc = unsafe { libc::uname(&mut uts) };
    if rc < 0 {
        return Err(io::Error::last_os_error()).context("uname failed");
    }
    let machine = unsafe { CStr::from_ptr(uts.machine.as_ptr()) };
    Ok(machine.to_string_lossy().into_owned())
}

fn is_64bit_machine(machine: &str) -> bool {
    matches!(
        machine,
        "aarch64" | "x86_64" | "riscv64" | "ppc64" | "ppc64le" | "s390x" | "loongarch64"
    ) || machine.starts_with("mips64")
}
