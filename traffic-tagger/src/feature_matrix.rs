//! Startup negotiation of which cgroup hooks the running platform can rely on.
//!
//! Admission is a table of [`FeatureRequirement`] rows folded over the
//! platform facts; the first unmet row decides the failure reason. When the
//! platform is admitted, the optional hook rows are filtered by kernel version
//! into an ordered [`PlanStep`] list for the hook attacher.

use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::Serialize;

use crate::hooks::HookPoint;
use crate::kernel::{KernelFacts, KernelVersion};

/// The only cgroup v2 mount accepted from tier U onwards.
pub const CANONICAL_CGROUP_PATH: &str = "/sys/fs/cgroup";

/// Platform release tiers in increasing order. `S` predates this agent.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, ValueEnum)]
pub enum PlatformTier {
    S,
    T,
    U,
    V,
}

/// Everything the matrix decides on.
#[derive(Clone, Debug, Serialize)]
pub struct PlatformFacts {
    pub tier: PlatformTier,
    pub kernel: KernelFacts,
    pub cgroup_path: Option<PathBuf>,
}

/// Pinned programs the external loader provides.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Program {
    AllowlistFilter,
    DenylistFilter,
    EgressFilter,
    IngressFilter,
    EgressStats,
    IngressStats,
    SockCreate,
    BlockBind4,
    BlockBind6,
    SetSockOpt,
}

impl Program {
    pub fn pin_name(self) -> &'static str {
        match self {
            Program::AllowlistFilter => "prog_skfilter_allowlist_xtbpf",
            Program::DenylistFilter => "prog_skfilter_denylist_xtbpf",
            Program::EgressFilter => "prog_skfilter_egress_xtbpf",
            Program::IngressFilter => "prog_skfilter_ingress_xtbpf",
            Program::EgressStats => "prog_cgroupskb_egress_stats",
            Program::IngressStats => "prog_cgroupskb_ingress_stats",
            Program::SockCreate => "prog_cgroupsock_inet_create",
            Program::BlockBind4 => "prog_block_bind4_block_port",
            Program::BlockBind6 => "prog_block_bind6_block_port",
            Program::SetSockOpt => "prog_setsockopt_prog",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStep {
    CheckAccessible(Program),
    Attach { program: Program, hook: HookPoint },
    Verify(HookPoint),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Condition {
    /// Holds when a base directory was supplied at all.
    CgroupPathPresent,
    MinimumTier(PlatformTier),
    KernelAtLeast(KernelVersion),
    /// A 32-bit kernel must stay below the given version.
    Kernel32BitBelow(KernelVersion),
    /// 32-bit userspace must run on a kernel below the given version.
    Userspace32BitBelow(KernelVersion),
    CanonicalCgroupPath,
}

/// One admission row: `condition` must hold on platforms at or above
/// `from_tier`.
#[derive(Clone, Copy, Debug)]
pub struct FeatureRequirement {
    from_tier: PlatformTier,
    condition: Condition,
    reason: &'static str,
}

const fn require(
    from_tier: PlatformTier,
    condition: Condition,
    reason: &'static str,
) -> FeatureRequirement {
    FeatureRequirement {
        from_tier,
        condition,
        reason,
    }
}

/// Evaluated top to bottom.
const ADMISSION: &[FeatureRequirement] = &[
    require(
        PlatformTier::S,
        Condition::CgroupPathPresent,
        "cgroup path is missing",
    ),
    require(
        PlatformTier::S,
        Condition::MinimumTier(PlatformTier::T),
        "S- platform is unsupported",
    ),
    require(
        PlatformTier::S,
        Condition::KernelAtLeast(KernelVersion::new(4, 9, 0)),
        "kernel version < 4.9.0 is unsupported",
    ),
    require(
        PlatformTier::U,
        Condition::KernelAtLeast(KernelVersion::new(4, 14, 0)),
        "U+ platform with kernel version < 4.14.0 is unsupported",
    ),
    require(
        PlatformTier::V,
        Condition::KernelAtLeast(KernelVersion::new(4, 19, 0)),
        "V+ platform with kernel version < 4.19.0 is unsupported",
    ),
    require(
        PlatformTier::V,
        Condition::Kernel32BitBelow(KernelVersion::new(5, 16, 0)),
        "V+ platform with 32 bit kernel, version >= 5.16.0 is unsupported",
    ),
    require(
        PlatformTier::S,
        Condition::Userspace32BitBelow(KernelVersion::new(6, 2, 0)),
        "32 bit userspace with Kernel version >= 6.2.0 is unsupported",
    ),
    require(
        PlatformTier::U,
        Condition::CanonicalCgroupPath,
        "U+ platform with cg2_path != /sys/fs/cgroup is unsupported",
    ),
];

impl FeatureRequirement {
    fn applies(&self, facts: &PlatformFacts) -> bool {
        facts.tier >= self.from_tier
    }

    fn holds(&self, facts: &PlatformFacts) -> bool {
        let kernel = &facts.kernel;
        match self.condition {
            Condition::CgroupPathPresent => facts
                .cgroup_path
                .as_deref()
                .is_some_and(|p| !p.as_os_str().is_empty()),
            Condition::MinimumTier(tier) => facts.tier >= tier,
            Condition::KernelAtLeast(min) => kernel.version >= min,
            Condition::Kernel32BitBelow(max) => !kernel.kernel_32bit || kernel.version < max,
            Condition::Userspace32BitBelow(max) => {
                !kernel.userspace_32bit || kernel.version < max
            }
            Condition::CanonicalCgroupPath => {
                facts.cgroup_path.as_deref() == Some(Path::new(CANONICAL_CGROUP_PATH))
            }
        }
    }
}

/// A group of hooks enabled together once the kernel reaches `min_kernel`.
/// When `verify` is set every hook attached so far is re-checked through a
/// program query right after the group attaches.
struct HookGroup {
    min_kernel: Option<KernelVersion>,
    hooks: &'static [(Program, HookPoint)],
    verify: bool,
}

const SOCKET_FILTERS: &[Program] = &[
    Program::AllowlistFilter,
    Program::DenylistFilter,
    Program::EgressFilter,
    Program::IngressFilter,
];

const HOOK_GROUPS: &[HookGroup] = &[
    HookGroup {
        min_kernel: None,
        hooks: &[
            (Program::EgressStats, HookPoint::InetEgress),
            (Program::IngressStats, HookPoint::InetIngress),
        ],
        verify: false,
    },
    HookGroup {
        min_kernel: Some(KernelVersion::new(4, 14, 0)),
        hooks: &[(Program::SockCreate, HookPoint::InetSockCreate)],
        verify: false,
    },
    // Program queries only exist from 4.19, so this is the first group that
    // can verify, and it verifies everything before it as well.
    HookGroup {
        min_kernel: Some(KernelVersion::new(4, 19, 0)),
        hooks: &[
            (Program::BlockBind4, HookPoint::Inet4Bind),
            (Program::BlockBind6, HookPoint::Inet6Bind),
        ],
        verify: true,
    },
    // The setsockopt program needs the 5.8 cgroup sockopt fixes.
    HookGroup {
        min_kernel: Some(KernelVersion::new(5, 8, 0)),
        hooks: &[(Program::SetSockOpt, HookPoint::SetSockOpt)],
        verify: true,
    },
];

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Supported { plan: Vec<PlanStep> },
    Unsupported { reason: &'static str },
}

impl Verdict {
    pub fn plan(&self) -> Option<&[PlanStep]> {
        match self {
            Verdict::Supported { plan } => Some(plan),
            Verdict::Unsupported { .. } => None,
        }
    }

    /// Hooks the plan attaches, in attach order.
    pub fn enabled_hooks(&self) -> Vec<HookPoint> {
        self.plan()
            .unwrap_or_default()
            .iter()
            .filter_map(|step| match step {
                PlanStep::Attach { hook, .. } => Some(*hook),
                _ => None,
            })
            .collect()
    }
}

/// First unmet admission row, if any.
pub fn admission_failure(facts: &PlatformFacts) -> Option<&'static str> {
    ADMISSION
        .iter()
        .find(|row| row.applies(facts) && !row.holds(facts))
        .map(|row| row.reason)
}

pub fn attach_plan(kernel: KernelVersion) -> Vec<PlanStep> {
    let mut plan: Vec<PlanStep> = SOCKET_FILTERS
        .iter()
        .map(|&program| PlanStep::CheckAccessible(program))
        .collect();
    let mut attached = Vec::new();
    for group in HOOK_GROUPS {
        if group.min_kernel.is_some_and(|min| kernel < min) {
            continue;
        }
        for &(program, hook) in group.hooks {
            plan.push(PlanStep::Attach { program, hook });
            attached.push(hook);
        }
        if group.verify {
            plan.extend(attached.drain(..).map(PlanStep::Verify));
        }
    }
    plan
}

pub fn evaluate(facts: &PlatformFacts) -> Verdict {
    match admission_failure(facts) {
        Some(reason) => Verdict::Unsupported { reason },
        None => Verdict::Supported {
            plan: attach_plan(facts.kernel.version),
        },
    }
}
