use serde::Serialize;
use traffic_tagger_common::{
    CURRENT_STATS_MAP_CONFIGURATION_KEY, SELECT_MAP_A, SELECT_MAP_B, StatsKey, StatsValue,
};

use crate::error::{TableError, TagError};
use crate::tables::Table;

pub type StatsTable = dyn Table<StatsKey, StatsValue>;
pub type ConfigurationTable = dyn Table<u32, u32>;

/// Which of the two stats maps the kernel is writing to right now.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum CounterView {
    A,
    B,
}

impl CounterView {
    pub fn from_selector(value: u32) -> Option<Self> {
        match value {
            SELECT_MAP_A => Some(CounterView::A),
            SELECT_MAP_B => Some(CounterView::B),
            _ => None,
        }
    }
}

/// Entry counts of one stats map snapshot.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Occupancy {
    pub total: u32,
    pub per_uid: u32,
}

/// The pair of stats maps plus the configuration cell choosing between them.
pub struct CounterMaps<'a> {
    pub stats_a: &'a StatsTable,
    pub stats_b: &'a StatsTable,
    pub configuration: &'a ConfigurationTable,
}

impl<'a> CounterMaps<'a> {
    /// Reads the configuration cell. A fresh read every call: an external
    /// rotation flips the selector at any time.
    pub fn current(&self) -> Result<CounterView, TagError> {
        let value = self
            .configuration
            .get(&CURRENT_STATS_MAP_CONFIGURATION_KEY)?
            .ok_or(TableError(libc::ENOENT))?;
        CounterView::from_selector(value).ok_or(TagError::UnknownConfiguration(value))
    }

    pub fn table(&self, view: CounterView) -> &'a StatsTable {
        match view {
            CounterView::A => self.stats_a,
            CounterView::B => self.stats_b,
        }
    }

    /// Counts entries of the live map, and those charged to `uid`. Best
    /// effort: the map can be cleared or swapped mid-walk.
    pub fn occupancy(&self, uid: u32) -> Result<(CounterView, Occupancy), TagError> {
        let view = self.current()?;
        let mut occupancy = Occupancy::default();
        self.table(view).for_each_key(&mut |key: &StatsKey| {
            if key.uid == uid {
                occupancy.per_uid += 1;
            }
            occupancy.total += 1;
        })?;
        Ok((view, occupancy))
    }
}
