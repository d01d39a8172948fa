use std::{path::Path, sync::RwLock};

use aya::{
    Pod,
    maps::{Array, HashMap as BpfHashMap, Map, MapData, MapError, MapType},
};

use crate::error::TableError;

/// Typed key-value table shared with kernel-side readers.
pub trait Table<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Result<Option<V>, TableError>;
    /// Visits every key present at the time of the walk. Entries inserted or
    /// removed concurrently may or may not be seen.
    fn for_each_key(&self, visit: &mut dyn FnMut(&K)) -> Result<(), TableError>;
    /// Insert-or-update.
    fn upsert(&self, key: &K, value: &V) -> Result<(), TableError>;
    /// Removing an absent key succeeds.
    fn delete(&self, key: &K) -> Result<(), TableError>;
}

fn map_errno(err: &MapError) -> i32 {
    match err {
        MapError::KeyNotFound => libc::ENOENT,
        MapError::OutOfBounds { .. } => libc::E2BIG,
        MapError::SyscallError(err) => err.io_error.raw_os_error().unwrap_or(libc::EIO),
        _ => libc::EIO,
    }
}

impl From<MapError> for TableError {
    fn from(err: MapError) -> Self {
        TableError(map_errno(&err))
    }
}

/// Opens a pinned map, wrapped according to the type the kernel reports.
fn open_pinned(pin: &Path) -> Result<Map, MapError> {
    let map_data = MapData::from_pin(pin)?;
    match map_data.info()?.map_type()? {
        MapType::Hash => Ok(Map::HashMap(map_data)),
        MapType::LruHash => Ok(Map::LruHashMap(map_data)),
        MapType::Array => Ok(Map::Array(map_data)),
        other => Err(MapError::InvalidMapType {
            map_type: other as u32,
        }),
    }
}

/// Pinned `BPF_MAP_TYPE_HASH`. Writers take the lock only for the single
/// update syscall; the kernel map synchronizes itself against the programs.
pub struct PinnedHashMap<K: Pod, V: Pod> {
    inner: RwLock<BpfHashMap<MapData, K, V>>,
}

impl<K: Pod, V: Pod> PinnedHashMap<K, V> {
    pub fn from_pin<P: AsRef<Path>>(pin: P) -> Result<Self, MapError> {
        let map = BpfHashMap::<_, K, V>::try_from(open_pinned(pin.as_ref())?)?;
        Ok(Self {
            inner: RwLock::new(map),
        })
    }
}

impl<K, V> Table<K, V> for PinnedHashMap<K, V>
where
    K: Pod + Send + Sync,
    V: Pod + Send + Sync,
{
    fn get(&self, key: &K) -> Result<Option<V>, TableError> {
        let map = self.inner.read().expect("pinned map lock poisoned");
        match map.get(key, 0) {
            Ok(value) => Ok(Some(value)),
            Err(MapError::KeyNotFound) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn for_each_key(&self, visit: &mut dyn FnMut(&K)) -> Result<(), TableError> {
        let map = self.inner.read().expect("pinned map lock poisoned");
        for key in map.keys() {
            visit(&key?);
        }
        Ok(())
    }

    fn upsert(&self, key: &K, value: &V) -> Result<(), TableError> {
        let mut map = self.inner.write().expect("pinned map lock poisoned");
        map.insert(key, value, 0)?;
        Ok(())
    }

    fn delete(&self, key: &K) -> Result<(), TableError> {
        let mut map = self.inner.write().expect("pinned map lock poisoned");
        match map.remove(key) {
            Ok(()) => Ok(()),
            Err(err) if map_errno(&err) == libc::ENOENT => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Pinned `BPF_MAP_TYPE_ARRAY`, indexed by `u32`. Read-only from userspace
/// here; writes are refused with `EPERM`.
pub struct PinnedArray<V: Pod> {
    inner: Array<MapData, V>,
}

impl<V: Pod> PinnedArray<V> {
    pub fn from_pin<P: AsRef<Path>>(pin: P) -> Result<Self, MapError> {
        let inner = Array::<_, V>::try_from(open_pinned(pin.as_ref())?)?;
        Ok(Self { inner })
    }
}

impl<V> Table<u32, V> for PinnedArray<V>
where
    V: Pod + Send + Sync,
{
    fn get(&self, key: &u32) -> Result<Option<V>, TableError> {
        match self.inner.get(key, 0) {
            Ok(value) => Ok(Some(value)),
            Err(MapError::OutOfBounds { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn for_each_key(&self, visit: &mut dyn FnMut(&u32)) -> Result<(), TableError> {
        for index in 0..self.inner.len() {
            visit(&index);
        }
        Ok(())
    }

    fn upsert(&self, _key: &u32, _value: &V) -> Result<(), TableError> {
        Err(TableError(libc::EPERM))
    }

    fn delete(&self, _key: &u32) -> Result<(), TableError> {
        Err(TableError(libc::EPERM))
    }
}

#[cfg(test)]
pub(crate) use memory::MemoryTable;

#[cfg(test)]
mod memory {
    use std::{collections::HashMap, hash::Hash, sync::Mutex};

    use super::Table;
    use crate::error::TableError;

    /// Bounded in-memory table standing in for a pinned map.
    pub struct MemoryTable<K, V> {
        entries: Mutex<HashMap<K, V>>,
        capacity: usize,
    }

    impl<K: Eq + Hash, V> MemoryTable<K, V> {
        pub fn with_capacity(capacity: usize) -> Self {
            Self {
                entries: Mutex::new(HashMap::new()),
                capacity,
            }
        }

        pub fn len(&self) -> usize {
            self.entries.lock().expect("memory table mutex poisoned").len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    impl<K, V> Table<K, V> for MemoryTable<K, V>
    where
        K: Eq + Hash + Clone + Send,
        V: Clone + Send,
    {
        fn get(&self, key: &K) -> Result<Option<V>, TableError> {
            let guard = self.entries.lock().expect("memory table mutex poisoned");
            Ok(guard.get(key).cloned())
        }

        fn for_each_key(&self, visit: &mut dyn FnMut(&K)) -> Result<(), TableError> {
            let keys: Vec<K> = {
                let guard = self.entries.lock().expect("memory table mutex poisoned");
                guard.keys().cloned().collect()
            };
            keys.iter().for_each(|key| visit(key));
            Ok(())
        }

        fn upsert(&self, key: &K, value: &V) -> Result<(), TableError> {
            let mut guard = self.entries.lock().expect("memory table mutex poisoned");
            if !guard.contains_key(key) && guard.len() >= self.capacity {
                return Err(TableError(libc::E2BIG));
            }
            guard.insert(key.clone(), value.clone());
            Ok(())
        }

        fn delete(&self, key: &K) -> Result<(), TableError> {
            let mut guard = self.entries.lock().expect("memory table mutex poisoned");
            guard.remove(key);
            Ok(())
        }
    }
}
