use std::os::fd::BorrowedFd;

use anyhow::{Result, ensure};
use log::{debug, error};
use serde::Serialize;
use traffic_tagger_common::{STATS_MAP_SIZE, UidTag};

use crate::counters::{ConfigurationTable, CounterMaps, CounterView, Occupancy, StatsTable};
use crate::delegation::{AID_CLAT, PermissionTable, may_charge_others};
use crate::error::TagError;
use crate::sockets::{KernelSockets, SocketProbe, is_supported_family, is_supported_protocol};
use crate::tables::Table;

pub const PER_UID_STATS_ENTRIES_LIMIT: u32 = 500;
/// At most 90% of a stats map may hold tagged entries, so untagged traffic
/// (one entry per uid) always has room to be counted.
pub const TOTAL_UID_STATS_ENTRIES_LIMIT: u32 = STATS_MAP_SIZE / 10 * 9;
/// Absolute headroom the reserved margin must exceed, covering concurrent
/// taggers that pass the scan before any of them inserts.
pub const MIN_RESERVED_ENTRIES: u32 = 100;

const _: () = assert!(
    STATS_MAP_SIZE - TOTAL_UID_STATS_ENTRIES_LIMIT > MIN_RESERVED_ENTRIES,
    "stats map limit too high, stats may be lost to overflow"
);

pub type CookieTagTable = dyn Table<u64, UidTag>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct QuotaLimits {
    pub per_uid: u32,
    pub total: u32,
}

impl QuotaLimits {
    /// Limits without any margin validation.
    pub const fn new(per_uid: u32, total: u32) -> Self {
        Self { per_uid, total }
    }

    /// Limits for a stats map of `capacity` entries, keeping at least 10% of
    /// the map and more than [`MIN_RESERVED_ENTRIES`] free of tagged entries.
    pub fn checked(per_uid: u32, total: u32, capacity: u32) -> Result<Self> {
        ensure!(per_uid > 0, "per-uid limit must be greater than zero");
        ensure!(
            per_uid <= total,
            "per-uid limit {per_uid} exceeds total limit {total}"
        );
        ensure!(
            total < capacity,
            "total limit {total} must be below map capacity {capacity}"
        );
        let reserved = capacity - total;
        ensure!(
            reserved as u64 * 10 >= capacity as u64,
            "total limit {total} leaves less than 10% of {capacity} entries reserved"
        );
        ensure!(
            reserved > MIN_RESERVED_ENTRIES,
            "total limit {total} reserves only {reserved} entries, need more than {MIN_RESERVED_ENTRIES}"
        );
        Ok(Self { per_uid, total })
    }

    pub fn admits(&self, occupancy: &Occupancy) -> bool {
        occupancy.total <= self.total && occupancy.per_uid <= self.per_uid
    }
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self::new(PER_UID_STATS_ENTRIES_LIMIT, TOTAL_UID_STATS_ENTRIES_LIMIT)
    }
}

/// Tables the tagger reads and writes. The cookie tag map is the only one
/// written from here.
pub struct AttributionMaps {
    pub stats_a: Box<StatsTable>,
    pub stats_b: Box<StatsTable>,
    pub configuration: Box<ConfigurationTable>,
    pub permissions: Box<PermissionTable>,
    pub cookie_tags: Box<CookieTagTable>,
}

impl AttributionMaps {
    pub fn counters(&self) -> CounterMaps<'_> {
        CounterMaps {
            stats_a: self.stats_a.as_ref(),
            stats_b: self.stats_b.as_ref(),
            configuration: self.configuration.as_ref(),
        }
    }
}

/// Charges sockets to (uid, tag) pairs. Shared by reference between any
/// number of concurrent callers.
pub struct Tagger<P = KernelSockets> {
    maps: Option<AttributionMaps>,
    limits: QuotaLimits,
    probe: P,
}

impl<P: SocketProbe> Tagger<P> {
    /// A tagger whose maps are not open yet; every request is refused with
    /// `EPERM` until [`Tagger::with_maps`].
    pub fn new(limits: QuotaLimits, probe: P) -> Self {
        Self {
            maps: None,
            limits,
            probe,
        }
    }

    pub fn with_maps(mut self, maps: AttributionMaps) -> Self {
        self.maps = Some(maps);
        self
    }

    pub fn limits(&self) -> QuotaLimits {
        self.limits
    }

    pub fn tag_socket(
        &self,
        socket: BorrowedFd<'_>,
        tag: u32,
        charge_uid: u32,
        caller_uid: u32,
    ) -> Result<(), TagError> {
        let maps = self.maps.as_ref().ok_or(TagError::PermissionDenied)?;

        if charge_uid != caller_uid && !may_charge_others(maps.permissions.as_ref(), caller_uid) {
            error!("uid {caller_uid} may not charge traffic to uid {charge_uid}");
            return Err(TagError::PermissionDenied);
        }

        // Only the translator itself charges to this uid; allowing it here
        // would let callers hide their traffic from accounting.
        if charge_uid == AID_CLAT {
            error!("refusing to charge uid {caller_uid}'s socket to the clat uid");
            return Err(TagError::PermissionDenied);
        }

        let family = self.probe.family(socket).map_err(|err| {
            error!("failed to read socket family: {err}");
            TagError::lookup(&err)
        })?;
        if !is_supported_family(family) {
            error!("unsupported family: {family}");
            return Err(TagError::FamilyUnsupported(family));
        }
        let protocol = self.probe.protocol(socket).map_err(|err| {
            error!("failed to read socket protocol: {err}");
            TagError::lookup(&err)
        })?;
        if !is_supported_protocol(protocol) {
            error!("unsupported protocol: {protocol}");
            return Err(TagError::ProtocolUnsupported(protocol));
        }

        let cookie = self
            .probe
            .cookie(socket)
            .map_err(|err| TagError::lookup(&err))?;

        let (view, occupancy) = maps.counters().occupancy(charge_uid).inspect_err(|err| {
            error!("failed to count stats entries: {err}");
        })?;
        if !self.limits.admits(&occupancy) {
            error!(
                "too many stats entries in map {view:?}, total count: {}, uid {charge_uid} count: {}, \
                 blocking tag request to prevent map overflow",
                occupancy.total, occupancy.per_uid
            );
            return Err(TagError::QuotaExceeded {
                uid: charge_uid,
                total: occupancy.total,
                per_uid: occupancy.per_uid,
            });
        }

        let value = UidTag {
            uid: charge_uid,
            tag,
        };
        maps.cookie_tags.upsert(&cookie, &value).inspect_err(|err| {
            error!("failed to tag socket: {err}");
        })?;
        debug!(
            "socket with cookie {cookie} tagged with tag {tag} uid {charge_uid} and real uid {caller_uid}"
        );
        Ok(())
    }

    pub fn untag_socket(&self, socket: BorrowedFd<'_>) -> Result<(), TagError> {
        let cookie = self
            .probe
            .cookie(socket)
            .map_err(|err| TagError::lookup(&err))?;
        let maps = self.maps.as_ref().ok_or(TagError::PermissionDenied)?;
        maps.cookie_tags.delete(&cookie).inspect_err(|err| {
            error!("failed to untag socket: {err}");
        })?;
        debug!("socket with cookie {cookie} untagged");
        Ok(())
    }

    /// [`Tagger::tag_socket`] as a status code: 0 or a negative errno.
    pub fn tag(&self, socket: BorrowedFd<'_>, tag: u32, charge_uid: u32, caller_uid: u32) -> i32 {
        status(self.tag_socket(socket, tag, charge_uid, caller_uid))
    }

    /// [`Tagger::untag_socket`] as a status code: 0 or a negative errno.
    pub fn untag(&self, socket: BorrowedFd<'_>) -> i32 {
        status(self.untag_socket(socket))
    }

    /// Current live stats map and its occupancy for `uid`.
    pub fn usage(&self, uid: u32) -> Result<(CounterView, Occupancy), TagError> {
        let maps = self.maps.as_ref().ok_or(TagError::PermissionDenied)?;
        maps.counters().occupancy(uid)
    }
}

fn status(result: Result<(), TagError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => err.errno(),
    }
}
