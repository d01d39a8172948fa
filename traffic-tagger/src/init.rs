use std::{
    os::fd::AsFd,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use log::{info, warn};
use traffic_tagger_common::{StatsKey, StatsValue, UidTag};

use crate::error::InitError;
use crate::feature_matrix::{PlatformFacts, Verdict, evaluate};
use crate::hooks::{ProgramHost, ProgramLayout, execute_plan, open_cgroup};
use crate::sockets::SocketProbe;
use crate::tables::{PinnedArray, PinnedHashMap};
use crate::tagger::{AttributionMaps, QuotaLimits, Tagger};

pub const MAP_STATS_A: &str = "map_stats_map_A";
pub const MAP_STATS_B: &str = "map_stats_map_B";
pub const MAP_CONFIGURATION: &str = "map_configuration_map";
pub const MAP_UID_PERMISSION: &str = "map_uid_permission_map";
pub const MAP_COOKIE_TAG: &str = "map_cookie_tag_map";
/// Created by the loader once every program and map is pinned.
pub const LOADER_DONE_MARKER: &str = "loader_done";

const LOADER_POLL_INTERVAL: Duration = Duration::from_millis(100);
const LOADER_LOG_INTERVAL: Duration = Duration::from_secs(5);

pub struct InitOptions {
    pub layout: ProgramLayout,
    pub limits: QuotaLimits,
    /// Give up waiting for the loader after this long; `None` waits forever.
    pub loader_timeout: Option<Duration>,
}

/// Blocks until the external loader has pinned everything.
pub fn wait_for_loader(pin_root: &Path, timeout: Option<Duration>) -> Result<(), InitError> {
    let marker = pin_root.join(LOADER_DONE_MARKER);
    let start = Instant::now();
    let mut last_log = start;
    while !marker.exists() {
        let waited = start.elapsed();
        if timeout.is_some_and(|limit| waited >= limit) {
            return Err(InitError::Configuration(format!(
                "loader did not finish within {waited:?} ({} missing)",
                marker.display()
            )));
        }
        if last_log.elapsed() >= LOADER_LOG_INTERVAL {
            warn!("still waiting for {} after {waited:?}", marker.display());
            last_log = Instant::now();
        }
        thread::sleep(LOADER_POLL_INTERVAL);
    }
    info!("BPF programs are loaded");
    Ok(())
}

/// Negotiates and attaches the cgroup hooks for `facts`.
pub fn init_programs(
    host: &impl ProgramHost,
    layout: &ProgramLayout,
    facts: &PlatformFacts,
) -> Result<(), InitError> {
    let plan = match evaluate(facts) {
        Verdict::Supported { plan } => plan,
        Verdict::Unsupported { reason } => return Err(InitError::PlatformUnsupported(reason)),
    };
    let cgroup_path = facts
        .cgroup_path
        .as_deref()
        .ok_or_else(|| InitError::Configuration("no cgroup path configured".to_string()))?;
    let cgroup =
        open_cgroup(cgroup_path).map_err(|err| InitError::Configuration(format!("{err:#}")))?;
    execute_plan(host, layout, &plan, cgroup.as_fd())
}

fn map_path(layout: &ProgramLayout, name: &str) -> PathBuf {
    layout.pin_root.join(name)
}

fn opened<T>(name: &'static str, result: Result<T, aya::maps::MapError>) -> Result<T, InitError> {
    result.map_err(|source| InitError::Maps { name, source })
}

/// Opens the pinned maps. The cookie tag map goes last so a usable tagger
/// implies every other map opened too.
pub fn init_maps(layout: &ProgramLayout) -> Result<AttributionMaps, InitError> {
    let stats_a = opened(
        MAP_STATS_A,
        PinnedHashMap::<StatsKey, StatsValue>::from_pin(map_path(layout, MAP_STATS_A)),
    )?;
    let stats_b = opened(
        MAP_STATS_B,
        PinnedHashMap::<StatsKey, StatsValue>::from_pin(map_path(layout, MAP_STATS_B)),
    )?;
    let configuration = opened(
        MAP_CONFIGURATION,
        PinnedArray::<u32>::from_pin(map_path(layout, MAP_CONFIGURATION)),
    )?;
    let permissions = opened(
        MAP_UID_PERMISSION,
        PinnedHashMap::<u32, u8>::from_pin(map_path(layout, MAP_UID_PERMISSION)),
    )?;
    let cookie_tags = opened(
        MAP_COOKIE_TAG,
        PinnedHashMap::<u64, UidTag>::from_pin(map_path(layout, MAP_COOKIE_TAG)),
    )?;
    info!("maps opened from {}", layout.pin_root.display());
    Ok(AttributionMaps {
        stats_a: Box::new(stats_a),
        stats_b: Box::new(stats_b),
        configuration: Box::new(configuration),
        permissions: Box::new(permissions),
        cookie_tags: Box::new(cookie_tags),
    })
}

/// Full startup: wait for the loader, attach hooks, open maps. Only the
/// returned tagger accepts tag requests.
pub fn init<P: SocketProbe>(
    host: &impl ProgramHost,
    facts: &PlatformFacts,
    opts: &InitOptions,
    probe: P,
) -> Result<Tagger<P>, InitError> {
    wait_for_loader(&opts.layout.pin_root, opts.loader_timeout)?;
    init_programs(host, &opts.layout, facts)?;
    let maps = init_maps(&opts.layout)?;
    Ok(Tagger::new(opts.limits, probe).with_maps(maps))
}

#[cfg(test)]
mod tests {
    use std::{env, fs};

    use super::*;
    use crate::error::AttachError;
    use crate::feature_matrix::{PlatformTier, Program};
    use crate::hooks::{HookPoint, fake::FakeHost};
    use crate::kernel::{KernelFacts, KernelVersion};

    fn scratch(name: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("traffic-tagger-{name}-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn facts(tier: PlatformTier, version: KernelVersion, cgroup: &Path) -> PlatformFacts {
        PlatformFacts {
            tier,
            kernel: KernelFacts {
                version,
                kernel_32bit: false,
                userspace_32bit: false,
            },
            cgroup_path: Some(cgroup.to_path_buf()),
        }
    }

    #[test]
    fn unsupported_platform_attaches_nothing() {
        let host = FakeHost::default();
        let f = facts(
            PlatformTier::U,
            KernelVersion::new(4, 10, 0),
            Path::new("/sys/fs/cgroup"),
        );
        let err = init_programs(&host, &ProgramLayout::default(), &f).unwrap_err();
        assert!(matches!(err, InitError::PlatformUnsupported(_)));
        assert!(host.log.borrow().is_empty());
    }

    #[test]
    fn t_platform_attaches_through_setsockopt() {
        let cgroup = scratch("cg-full");
        let host = FakeHost::default();
        let f = facts(PlatformTier::T, KernelVersion::new(5, 10, 0), &cgroup);
        init_programs(&host, &ProgramLayout::default(), &f).unwrap();
        let attached = host.attached.borrow();
        for hook in [
            HookPoint::InetEgress,
            HookPoint::InetIngress,
            HookPoint::InetSockCreate,
            HookPoint::Inet4Bind,
            HookPoint::Inet6Bind,
            HookPoint::SetSockOpt,
        ] {
            assert_eq!(attached.get(&hook), Some(&1), "{hook:?}");
        }
    }

    #[test]
    fn missing_socket_filter_fails_before_attaching() {
        let cgroup = scratch("cg-filter");
        let layout = ProgramLayout::new("/pins");
        let host = FakeHost {
            missing: [layout.path(Program::DenylistFilter)].into(),
            ..Default::default()
        };
        let f = facts(PlatformTier::T, KernelVersion::new(4, 9, 0), &cgroup);
        let err = init_programs(&host, &layout, &f).unwrap_err();
        assert!(matches!(
            err,
            InitError::Attach(AttachError::ProgramUnavailable { .. })
        ));
        assert!(host.attached.borrow().is_empty());
    }

    #[test]
    fn phantom_attach_is_fatal() {
        let cgroup = scratch("cg-phantom");
        let host = FakeHost {
            phantom: [HookPoint::InetSockCreate].into(),
            ..Default::default()
        };
        let f = facts(PlatformTier::T, KernelVersion::new(4, 19, 0), &cgroup);
        let err = init_programs(&host, &ProgramLayout::default(), &f).unwrap_err();
        assert!(err.is_fatal_abort());
    }

    #[test]
    fn unopenable_cgroup_is_configuration_error() {
        let host = FakeHost::default();
        let f = facts(
            PlatformTier::T,
            KernelVersion::new(5, 4, 0),
            Path::new("/nonexistent/cgroup"),
        );
        let err = init_programs(&host, &ProgramLayout::default(), &f).unwrap_err();
        assert!(matches!(err, InitError::Configuration(_)));
    }

    #[test]
    fn missing_cgroup_path_opens_nothing() {
        let host = FakeHost::default();
        let mut f = facts(PlatformTier::T, KernelVersion::new(5, 4, 0), Path::new("/"));
        f.cgroup_path = None;
        let err = init_programs(&host, &ProgramLayout::default(), &f).unwrap_err();
        assert!(matches!(err, InitError::PlatformUnsupported(_)));
        assert!(host.log.borrow().is_empty());
    }

    #[test]
    fn loader_wait_times_out_without_marker() {
        let dir = scratch("loader-missing");
        let err = wait_for_loader(&dir, Some(Duration::from_millis(250))).unwrap_err();
        assert!(matches!(err, InitError::Configuration(_)));
    }

    #[test]
    fn loader_wait_returns_once_marker_exists() {
        let dir = scratch("loader-done");
        fs::write(dir.join(LOADER_DONE_MARKER), b"").unwrap();
        wait_for_loader(&dir, Some(Duration::ZERO)).unwrap();
    }

    #[test]
    fn missing_maps_name_the_first_map() {
        let dir = scratch("maps-missing");
        let err = match init_maps(&ProgramLayout::new(&dir)) {
            Ok(_) => panic!("maps should not open"),
            Err(err) => err,
        };
        assert!(matches!(err, InitError::Maps { name: MAP_STATS_A, .. }));
    }
}
