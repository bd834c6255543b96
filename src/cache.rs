// Hash keyed object caches
//
// All of the derivable pipeline objects (render passes, framebuffers,
// pipeline layouts, shaders, programs) are cached by a 64-bit digest of
// their inputs. The caches here have a read/write split: lookups hit a
// read-mostly snapshot first and only fall back to the short lived
// writable half on a miss. Promoting the writable half at a frame
// boundary keeps the hot path free of write contention.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// An FNV-1a digest builder.
///
/// Requesters compute cache keys themselves by feeding a well defined
/// sequence of fields through one of these.
pub struct HashCombiner {
    state: u64,
}

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

impl HashCombiner {
    pub fn new() -> Self {
        Self { state: FNV_OFFSET }
    }

    pub fn u8(&mut self, val: u8) -> &mut Self {
        self.state = (self.state ^ val as u64).wrapping_mul(FNV_PRIME);
        self
    }

    pub fn u32(&mut self, val: u32) -> &mut Self {
        for b in val.to_le_bytes().iter() {
            self.u8(*b);
        }
        self
    }

    pub fn i32(&mut self, val: i32) -> &mut Self {
        self.u32(val as u32)
    }

    pub fn u64(&mut self, val: u64) -> &mut Self {
        self.u32(val as u32).u32((val >> 32) as u32)
    }

    pub fn f32(&mut self, val: f32) -> &mut Self {
        self.u32(val.to_bits())
    }

    pub fn bool(&mut self, val: bool) -> &mut Self {
        self.u8(val as u8)
    }

    pub fn data(&mut self, data: &[u8]) -> &mut Self {
        for b in data.iter() {
            self.u8(*b);
        }
        self
    }

    pub fn get(&self) -> u64 {
        self.state
    }
}

/// A cache of shared objects with a read/write split.
///
/// `find` consults the read-only snapshot without taking the write
/// mutex. Misses re-check and insert under the writable half, so two
/// racing requesters end up with the same entry. The writable half is
/// merged into the snapshot by `move_to_read_only`, which the device
/// calls at frame boundaries.
pub struct VulkanCache<T> {
    read_only: RwLock<HashMap<u64, Arc<T>>>,
    read_write: Mutex<HashMap<u64, Arc<T>>>,
}

impl<T> VulkanCache<T> {
    pub fn new() -> Self {
        Self {
            read_only: RwLock::new(HashMap::new()),
            read_write: Mutex::new(HashMap::new()),
        }
    }

    pub fn find(&self, hash: u64) -> Option<Arc<T>> {
        if let Some(hit) = self.read_only.read().unwrap().get(&hash) {
            return Some(hit.clone());
        }

        self.read_write.lock().unwrap().get(&hash).cloned()
    }

    /// Return the entry for `hash`, constructing it if missing.
    ///
    /// The constructor runs under the write mutex so the insert is
    /// atomic with respect to other requesters.
    pub fn get_or_insert_with<F>(&self, hash: u64, func: F) -> Arc<T>
    where
        F: FnOnce() -> T,
    {
        if let Some(hit) = self.read_only.read().unwrap().get(&hash) {
            return hit.clone();
        }

        let mut write = self.read_write.lock().unwrap();
        if let Some(hit) = write.get(&hash) {
            return hit.clone();
        }

        let val = Arc::new(func());
        write.insert(hash, val.clone());
        val
    }

    /// Fallible variant of `get_or_insert_with`.
    pub fn try_get_or_insert_with<F>(&self, hash: u64, func: F) -> crate::Result<Arc<T>>
    where
        F: FnOnce() -> crate::Result<T>,
    {
        if let Some(hit) = self.read_only.read().unwrap().get(&hash) {
            return Ok(hit.clone());
        }

        let mut write = self.read_write.lock().unwrap();
        if let Some(hit) = write.get(&hash) {
            return Ok(hit.clone());
        }

        let val = Arc::new(func()?);
        write.insert(hash, val.clone());
        Ok(val)
    }

    /// Promote all writable entries into the read-only snapshot.
    pub fn move_to_read_only(&self) {
        let mut write = self.read_write.lock().unwrap();
        if write.is_empty() {
            return;
        }

        let mut read = self.read_only.write().unwrap();
        for (hash, val) in write.drain() {
            read.insert(hash, val);
        }
    }

    /// Drain every entry out of the cache, handing each to `func`.
    pub fn clear<F>(&self, mut func: F)
    where
        F: FnMut(Arc<T>),
    {
        for (_, val) in self.read_write.lock().unwrap().drain() {
            func(val);
        }
        for (_, val) in self.read_only.write().unwrap().drain() {
            func(val);
        }
    }

    pub fn for_each<F>(&self, mut func: F)
    where
        F: FnMut(&Arc<T>),
    {
        for val in self.read_only.read().unwrap().values() {
            func(val);
        }
        for val in self.read_write.lock().unwrap().values() {
            func(val);
        }
    }
}

/// A two generation frame cache.
///
/// Entries requested during the current frame stay in the front map.
/// `begin_frame` swaps the maps, so an entry that goes one full frame
/// without being requested falls out of the back map on the following
/// rotation. The framebuffer and transient attachment allocators sit
/// on top of this.
pub struct TempHashMap<T> {
    front: HashMap<u64, T>,
    back: HashMap<u64, T>,
}

impl<T> TempHashMap<T> {
    pub fn new() -> Self {
        Self {
            front: HashMap::new(),
            back: HashMap::new(),
        }
    }

    /// Look up `hash`, reviving a previous-generation entry if needed.
    pub fn request(&mut self, hash: u64) -> Option<&T> {
        if self.front.contains_key(&hash) {
            return self.front.get(&hash);
        }

        if let Some(old) = self.back.remove(&hash) {
            self.front.insert(hash, old);
            return self.front.get(&hash);
        }

        None
    }

    pub fn insert(&mut self, hash: u64, val: T) -> &T {
        self.front.insert(hash, val);
        self.front.get(&hash).unwrap()
    }

    /// Rotate generations. Entries that were not requested in the
    /// frame that just ended are evicted and handed back so the
    /// caller can route their handles into a destruction queue.
    pub fn begin_frame(&mut self) -> Vec<T> {
        let evicted: Vec<T> = self.back.drain().map(|(_, v)| v).collect();
        std::mem::swap(&mut self.front, &mut self.back);
        evicted
    }

    pub fn clear(&mut self) {
        self.front.clear();
        self.back.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_combiner_is_deterministic() {
        let mut a = HashCombiner::new();
        a.u32(42).u64(0xdead_beef_0000_1111).bool(true);
        let mut b = HashCombiner::new();
        b.u32(42).u64(0xdead_beef_0000_1111).bool(true);
        assert_eq!(a.get(), b.get());

        let mut c = HashCombiner::new();
        c.u32(42).u64(0xdead_beef_0000_1111).bool(false);
        assert_ne!(a.get(), c.get());
    }

    #[test]
    fn cache_returns_identical_entries() {
        let cache: VulkanCache<u32> = VulkanCache::new();
        let a = cache.get_or_insert_with(7, || 1);
        let b = cache.get_or_insert_with(7, || 2);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*b, 1);
    }

    #[test]
    fn cache_promotion_keeps_entries_visible() {
        let cache: VulkanCache<u32> = VulkanCache::new();
        cache.get_or_insert_with(9, || 3);
        cache.move_to_read_only();
        assert_eq!(*cache.find(9).unwrap(), 3);
        // The writable half is empty again
        assert!(cache.read_write.lock().unwrap().is_empty());
    }

    #[test]
    fn temp_map_evicts_after_two_rotations() {
        let mut map: TempHashMap<u32> = TempHashMap::new();
        map.insert(1, 10);
        map.insert(2, 20);

        assert!(map.begin_frame().is_empty());
        // Entry 1 is touched, entry 2 is not
        assert_eq!(*map.request(1).unwrap(), 10);

        let evicted = map.begin_frame();
        assert_eq!(evicted, vec![20]);
        assert_eq!(*map.request(1).unwrap(), 10);
        assert!(map.request(2).is_none());
    }
}
