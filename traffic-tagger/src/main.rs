use std::{
    os::fd::{BorrowedFd, RawFd},
    path::PathBuf,
    process::{abort, exit},
    time::Duration,
};

use anyhow::{Context, Result, anyhow, ensure};
use clap::{Args, CommandFactory, Parser, Subcommand};
use log::{error, info};
use serde_json::json;

use traffic_tagger::{
    QuotaLimits, Tagger,
    feature_matrix::{self, CANONICAL_CGROUP_PATH, PlatformFacts, PlatformTier},
    hooks::{BpfSyscalls, DEFAULT_PIN_ROOT, ProgramLayout},
    init::{self, InitOptions},
    kernel::{KernelFacts, KernelVersion},
    sockets::KernelSockets,
    tagger::{PER_UID_STATS_ENTRIES_LIMIT, TOTAL_UID_STATS_ENTRIES_LIMIT},
};
use traffic_tagger_common::STATS_MAP_SIZE;

#[derive(Parser)]
#[command(name = "traffic-tagger")]
#[command(about = "Socket traffic attribution agent", long_about = None)]
struct Cli {
    /// bpffs directory holding the loader's pinned programs and maps
    #[arg(long, global = true, value_name = "DIR", default_value = DEFAULT_PIN_ROOT)]
    pin_root: PathBuf,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Negotiate and attach cgroup hooks, then open the attribution maps
    Init(InitCommand),
    /// Print the hook plan for the given platform facts without touching the kernel
    Plan(PlanCommand),
    /// Print how full the live stats map is
    Usage(UsageCommand),
    /// Charge a socket inherited on a file descriptor to a uid and tag
    Tag(TagCommand),
    /// Remove a socket's charge
    Untag(UntagCommand),
}

#[derive(Args)]
struct QuotaArgs {
    /// Stats entries one uid may hold before tagging is refused
    #[arg(long, default_value_t = PER_UID_STATS_ENTRIES_LIMIT)]
    per_uid_limit: u32,
    /// Stats entries across all uids before tagging is refused
    #[arg(long, default_value_t = TOTAL_UID_STATS_ENTRIES_LIMIT)]
    total_limit: u32,
    /// Capacity of each stats map
    #[arg(long, default_value_t = STATS_MAP_SIZE)]
    map_capacity: u32,
}

impl QuotaArgs {
    fn limits(&self) -> Result<QuotaLimits> {
        QuotaLimits::checked(self.per_uid_limit, self.total_limit, self.map_capacity)
            .context("invalid quota limits")
    }
}

#[derive(Args)]
struct InitCommand {
    /// cgroup v2 mount the hooks attach to
    #[arg(long, value_name = "DIR", default_value = CANONICAL_CGROUP_PATH)]
    cgroup_path: PathBuf,
    #[arg(long, value_enum)]
    platform_tier: PlatformTier,
    /// Override the running kernel version (e.g. 5.10.0)
    #[arg(long, value_name = "VERSION")]
    kernel_version: Option<KernelVersion>,
    /// Seconds to wait for the loader; waits forever when omitted
    #[arg(long, value_name = "SECS")]
    loader_timeout_secs: Option<u64>,
    #[command(flatten)]
    quota: QuotaArgs,
}

#[derive(Args)]
struct PlanCommand {
    #[arg(long, value_name = "DIR")]
    cgroup_path: Option<PathBuf>,
    #[arg(long, value_enum)]
    platform_tier: PlatformTier,
    #[arg(long, value_name = "VERSION")]
    kernel_version: KernelVersion,
    #[arg(long)]
    kernel_32bit: bool,
    #[arg(long)]
    userspace_32bit: bool,
}

#[derive(Args)]
struct UsageCommand {
    /// Uid whose entries are counted separately
    #[arg(long)]
    uid: u32,
}

#[derive(Args)]
struct TagCommand {
    /// Inherited socket descriptor
    #[arg(long)]
    fd: RawFd,
    #[arg(long, value_parser = parse_tag)]
    tag: u32,
    /// Uid the traffic is charged to; defaults to the caller's
    #[arg(long)]
    uid: Option<u32>,
    #[command(flatten)]
    quota: QuotaArgs,
}

#[derive(Args)]
struct UntagCommand {
    #[arg(long)]
    fd: RawFd,
}

fn parse_tag(raw: &str) -> Result<u32, String> {
    let parsed = match raw.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|err| format!("invalid tag '{raw}': {err}"))
}

fn main() {
    if std::env::var("RUST_LOG").is_err() {
        unsafe { std::env::set_var("RUST_LOG", "info") };
    }
    env_logger::init();

    if let Err(err) = run() {
        error!("traffic-tagger error: {err:?}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let layout = ProgramLayout::new(&cli.pin_root);

    match cli.command {
        Some(Commands::Init(cmd)) => run_init(cmd, layout),
        Some(Commands::Plan(cmd)) => run_plan(cmd),
        Some(Commands::Usage(cmd)) => {
            let tagger = open_tagger(&layout, QuotaLimits::default())?;
            let (view, occupancy) = tagger
                .usage(cmd.uid)
                .map_err(|err| anyhow!("failed to read stats map usage: {err}"))?;
            let report = json!({
                "map": view,
                "occupancy": occupancy,
                "limits": tagger.limits(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Some(Commands::Tag(cmd)) => {
            let tagger = open_tagger(&layout, cmd.quota.limits()?)?;
            let caller_uid = unsafe { libc::getuid() };
            let socket = inherited_socket(cmd.fd)?;
            let charge_uid = cmd.uid.unwrap_or(caller_uid);
            tagger
                .tag_socket(socket, cmd.tag, charge_uid, caller_uid)
                .with_context(|| format!("failed to tag fd {}", cmd.fd))?;
            info!("fd {} charged to uid {charge_uid} tag {:#x}", cmd.fd, cmd.tag);
            Ok(())
        }
        Some(Commands::Untag(cmd)) => {
            let tagger = open_tagger(&layout, QuotaLimits::default())?;
            let socket = inherited_socket(cmd.fd)?;
            tagger
                .untag_socket(socket)
                .with_context(|| format!("failed to untag fd {}", cmd.fd))?;
            Ok(())
        }
        None => {
            Cli::command().print_help().ok();
            println!();
            Ok(())
        }
    }
}

fn run_init(cmd: InitCommand, layout: ProgramLayout) -> Result<()> {
    let mut kernel = KernelFacts::running()?;
    if let Some(version) = cmd.kernel_version {
        kernel.version = version;
    }
    let facts = PlatformFacts {
        tier: cmd.platform_tier,
        kernel,
        cgroup_path: Some(cmd.cgroup_path),
    };
    let opts = InitOptions {
        layout,
        limits: cmd.quota.limits()?,
        loader_timeout: cmd.loader_timeout_secs.map(Duration::from_secs),
    };
    info!(
        "initializing on {:?} platform, kernel {}",
        facts.tier, facts.kernel.version
    );
    match init::init(&BpfSyscalls, &facts, &opts, KernelSockets) {
        Ok(_) => {
            info!("initialization complete");
            Ok(())
        }
        Err(err) if err.is_fatal_abort() => {
            error!("{err}");
            abort();
        }
        Err(err) => Err(err).context("initialization failed"),
    }
}

fn run_plan(cmd: PlanCommand) -> Result<()> {
    let facts = PlatformFacts {
        tier: cmd.platform_tier,
        kernel: KernelFacts {
            version: cmd.kernel_version,
            kernel_32bit: cmd.kernel_32bit,
            userspace_32bit: cmd.userspace_32bit,
        },
        cgroup_path: cmd.cgroup_path,
    };
    let verdict = feature_matrix::evaluate(&facts);
    let report = json!({
        "facts": facts,
        "result": verdict,
        "enabled_hooks": verdict.enabled_hooks(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn open_tagger(layout: &ProgramLayout, limits: QuotaLimits) -> Result<Tagger> {
    let maps = init::init_maps(layout).context("failed to open attribution maps")?;
    Ok(Tagger::new(limits, KernelSockets).with_maps(maps))
}

fn inherited_socket(fd: RawFd) -> Result<BorrowedFd<'static>> {
    ensure!(fd >= 0, "invalid file descriptor {fd}");
    // The descriptor was inherited and stays open for the life of the process.
    Ok(unsafe { BorrowedFd::borrow_raw(fd) })
}
