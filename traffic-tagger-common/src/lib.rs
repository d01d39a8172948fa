#![no_std]

// Key/value layouts shared with the kernel-side cgroup programs.
// Keep this crate `no_std` friendly so it can be used from eBPF code.

/// Number of entries the kernel side provisions for each stats map.
pub const STATS_MAP_SIZE: u32 = 5000;

/// Key of the configuration map slot that selects the live stats map.
pub const CURRENT_STATS_MAP_CONFIGURATION_KEY: u32 = 1;
pub const SELECT_MAP_A: u32 = 0;
pub const SELECT_MAP_B: u32 = 1;

/// Permission bit allowing an app to charge traffic to other uids.
pub const PERMISSION_UPDATE_DEVICE_STATS: u8 = 1 << 3;

/// Value of the cookie tag map: who a socket's traffic is charged to.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct UidTag {
    pub uid: u32,
    pub tag: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct StatsKey {
    pub uid: u32,
    pub tag: u32,
    pub counter_set: u32,
    pub iface_index: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct StatsValue {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
}

// With the `user` feature the types implement `aya::Pod` so userspace can
// use them with aya's typed map APIs. The eBPF side never enables it.
#[cfg(feature = "user")]
mod user_impls {
    extern crate aya;

    use super::{StatsKey, StatsValue, UidTag};
    use aya::Pod;

    unsafe impl Pod for UidTag {}
    unsafe impl Pod for StatsKey {}
    unsafe impl Pod for StatsValue {}
}
