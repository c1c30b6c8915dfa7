//! Tile cache with reference counting and lazy LRU eviction.
//!
//! A [`TileCache`] maps [`TileKey`]s to tiles whose slots come from the cache's
//! storages (one slot per storage). Tiles are reference counted: a tile whose
//! count drops to zero is kept around as *unused* and only evicted when a new
//! tile needs its slots. Unused tiles are evicted in the order they became
//! unused, oldest first. A held tile is never evicted.
//!
//! The cache is shared between producers through `Rc<TileCache>`. Its state
//! sits behind a `RefCell` whose borrow is always dropped before calling into a
//! producer, so generation may recursively request tiles from producers that
//! use the same cache.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;

use crate::error::TileError;
use crate::key::{ProducerId, TileKey};
use crate::producer::TileProducer;
use crate::slot::TileSlot;
use crate::storage::{StorageKind, TileStorage};
use crate::tile::{Tile, TileState};

/// Counters describing cache occupancy and traffic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Maximum number of resident tiles.
    pub capacity: usize,
    /// Tiles with a non-zero reference count.
    pub used: usize,
    /// Resident tiles nobody holds (eviction candidates).
    pub unused: usize,
    /// Tiles queued for deferred generation.
    pub pending: usize,
    /// Requests served by a resident ready tile.
    pub hits: u64,
    /// Requests that had to allocate a new tile.
    pub misses: u64,
    /// Tiles evicted to make room.
    pub evictions: u64,
    /// Successful generations, regenerations included.
    pub generated: u64,
}

struct Entry {
    tile: Rc<Tile>,
    users: u32,
    /// LRU stamp while unused.
    unused_since: Option<u64>,
}

struct CacheState {
    storages: Vec<Box<dyn TileStorage>>,
    entries: HashMap<TileKey, Entry>,
    /// Unused tiles ordered by the tick at which they became unused.
    unused: BTreeMap<u64, TileKey>,
    pending: VecDeque<TileKey>,
    tick: u64,
    next_producer: u32,
    stats: CacheStats,
}

impl CacheState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Take a reference on a resident tile.
    fn acquire(&mut self, key: &TileKey) -> Option<Rc<Tile>> {
        let entry = self.entries.get_mut(key)?;
        entry.users += 1;
        if let Some(stamp) = entry.unused_since.take() {
            self.unused.remove(&stamp);
        }
        Some(Rc::clone(&entry.tile))
    }

    fn insert(&mut self, tile: Rc<Tile>) {
        self.entries.insert(
            tile.key(),
            Entry {
                tile,
                users: 1,
                unused_since: None,
            },
        );
    }

    /// Allocate one slot per storage, evicting unused tiles while any storage is full.
    fn allocate_slots(&mut self) -> Result<(Vec<TileSlot>, Vec<Rc<Tile>>), TileError> {
        let mut evicted = Vec::new();
        while let Some(full) = self.storages.iter().find(|s| s.free_slots() == 0) {
            let Some((_, key)) = self.unused.pop_first() else {
                return Err(TileError::CapacityExceeded {
                    storage: full.id(),
                    capacity: full.capacity(),
                });
            };
            evicted.push(self.remove(&key)?);
            self.stats.evictions += 1;
        }

        let slots = self
            .storages
            .iter_mut()
            .map(|storage| storage.allocate_slot())
            .collect::<Result<Vec<_>, _>>()?;
        Ok((slots, evicted))
    }

    /// Queue `key` for deferred generation unless it is queued already.
    fn enqueue(&mut self, key: TileKey) {
        if !self.pending.contains(&key) {
            self.pending.push_back(key);
        }
    }

    /// Give back a reference taken for a generation that failed. A tile left
    /// without holders is discarded instead of becoming unused.
    fn drop_failed(&mut self, key: &TileKey) -> Result<Option<Rc<Tile>>, TileError> {
        let Some(entry) = self.entries.get_mut(key) else {
            return Ok(None);
        };
        entry.users = entry.users.saturating_sub(1);
        if entry.users > 0 {
            return Ok(None);
        }
        self.remove(key).map(Some)
    }

    /// Drop an entry and return its slots to the storages.
    fn remove(&mut self, key: &TileKey) -> Result<Rc<Tile>, TileError> {
        let entry = self
            .entries
            .remove(key)
            .ok_or_else(|| TileError::missing(*key, "not resident"))?;
        if let Some(stamp) = entry.unused_since {
            self.unused.remove(&stamp);
        }
        self.pending.retain(|k| k != key);
        for (storage, slot) in self.storages.iter_mut().zip(entry.tile.slots()) {
            storage.release_slot(slot)?;
        }
        entry.tile.set_state(TileState::Evicted);
        tracing::trace!(tile = %key, "evicted tile");
        Ok(entry.tile)
    }
}

/// Maps tile keys to storage slots for one or more producers.
pub struct TileCache {
    name: String,
    tile_size: u32,
    capacity: usize,
    state: RefCell<CacheState>,
}

impl TileCache {
    /// Create a cache over `storages`. Each tile takes one slot from every storage,
    /// so the cache holds at most as many tiles as its smallest storage.
    pub fn new(
        name: impl Into<String>,
        storages: Vec<Box<dyn TileStorage>>,
    ) -> Result<Self, TileError> {
        let name = name.into();
        let Some(first) = storages.first() else {
            return Err(TileError::InvalidConfiguration(format!(
                "cache '{name}' needs at least one storage"
            )));
        };
        let tile_size = first.tile_size();
        let capacity = storages
            .iter()
            .map(|s| s.capacity())
            .min()
            .unwrap_or_default();

        tracing::debug!(cache = %name, storages = storages.len(), capacity, "created tile cache");

        Ok(Self {
            name,
            tile_size,
            capacity,
            state: RefCell::new(CacheState {
                storages,
                entries: HashMap::new(),
                unused: BTreeMap::new(),
                pending: VecDeque::new(),
                tick: 0,
                next_producer: 0,
                stats: CacheStats::default(),
            }),
        })
    }

    /// Cache name, used in diagnostics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tile width of storage 0.
    #[must_use]
    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    /// Maximum number of resident tiles.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of storages (slots per tile).
    #[must_use]
    pub fn storage_count(&self) -> usize {
        self.state.borrow().storages.len()
    }

    /// Kind of storage `index`.
    #[must_use]
    pub fn storage_kind(&self, index: usize) -> Option<StorageKind> {
        self.with_storage(index, |s| s.kind())
    }

    /// Run `f` against storage `index`.
    pub fn with_storage<R>(&self, index: usize, f: impl FnOnce(&dyn TileStorage) -> R) -> Option<R> {
        let state = self.state.borrow();
        state.storages.get(index).map(|s| f(s.as_ref()))
    }

    /// Hand out a fresh producer id for a producer using this cache.
    pub fn register_producer(&self) -> ProducerId {
        let mut state = self.state.borrow_mut();
        let id = ProducerId(state.next_producer);
        state.next_producer += 1;
        id
    }

    /// Acquire a resident, ready tile. Returns `None` if the tile is missing or
    /// not ready; [`create_tile`](Self::create_tile) handles those.
    pub fn get_tile(&self, producer: ProducerId, level: u32, x: u32, y: u32) -> Option<Rc<Tile>> {
        let key = TileKey::new(producer, level, x, y);
        let mut state = self.state.borrow_mut();
        let ready = state.entries.get(&key).is_some_and(|e| e.tile.is_ready());
        if !ready {
            return None;
        }
        state.stats.hits += 1;
        tracing::trace!(cache = %self.name, tile = %key, "cache hit");
        state.acquire(&key)
    }

    /// Acquire the tile at `(level, x, y)`, generating it with `producer` if needed.
    ///
    /// A missing tile gets one slot per storage (evicting the least recently used
    /// unused tiles if necessary), then `producer`'s dependency hook and
    /// [`TileProducer::do_create_tile`] run. A resident tile that is requested,
    /// or stale, is generated in place. The returned tile is held; give it back
    /// with [`release_tile`](Self::release_tile).
    pub fn create_tile<P: TileProducer + ?Sized>(
        &self,
        producer: &P,
        level: u32,
        x: u32,
        y: u32,
    ) -> Result<Rc<Tile>, TileError> {
        let key = TileKey::new(producer.id(), level, x, y);

        let (tile, evicted, generate) = {
            let mut state = self.state.borrow_mut();
            let resident = state.entries.get(&key).map(|e| e.tile.state());
            match resident {
                Some(TileState::Generating) => return Err(TileError::DependencyCycle(key)),
                Some(TileState::Ready) => {
                    state.stats.hits += 1;
                    let tile = state
                        .acquire(&key)
                        .ok_or_else(|| TileError::missing(key, "vanished during lookup"))?;
                    (tile, Vec::new(), false)
                }
                Some(_) => {
                    let tile = state
                        .acquire(&key)
                        .ok_or_else(|| TileError::missing(key, "vanished during lookup"))?;
                    (tile, Vec::new(), true)
                }
                None => {
                    state.stats.misses += 1;
                    let (slots, evicted) = state.allocate_slots()?;
                    let tile = Rc::new(Tile::new(key, slots));
                    state.insert(Rc::clone(&tile));
                    (tile, evicted, true)
                }
            }
        };

        release_evicted(evicted)?;
        if generate && let Err(err) = self.generate(producer, &tile) {
            // The caller never receives the tile, so its reference goes too.
            if let Err(drop) = self.state.borrow_mut().drop_failed(&key) {
                tracing::warn!(error = %drop, "could not discard failed tile");
            }
            return Err(err);
        }
        Ok(tile)
    }

    /// Acquire the tile at `(level, x, y)` without generating it.
    ///
    /// A missing tile is allocated in the `Requested` state and queued; the
    /// next [`update`](Self::update) for its producer generates it. A resident
    /// stale or requested tile is queued again.
    pub fn request_tile(
        &self,
        producer: ProducerId,
        level: u32,
        x: u32,
        y: u32,
    ) -> Result<Rc<Tile>, TileError> {
        let key = TileKey::new(producer, level, x, y);
        let (tile, evicted) = {
            let mut state = self.state.borrow_mut();
            if let Some(tile) = state.acquire(&key) {
                match tile.state() {
                    TileState::Ready => state.stats.hits += 1,
                    TileState::Requested | TileState::Stale => state.enqueue(key),
                    TileState::Generating | TileState::Evicted => {}
                }
                (tile, Vec::new())
            } else {
                state.stats.misses += 1;
                let (slots, evicted) = state.allocate_slots()?;
                let tile = Rc::new(Tile::new(key, slots));
                state.insert(Rc::clone(&tile));
                state.pending.push_back(key);
                (tile, evicted)
            }
        };
        release_evicted(evicted)?;
        Ok(tile)
    }

    /// Give back one reference to `tile`. At zero the tile becomes an eviction
    /// candidate but keeps its content.
    pub fn release_tile(&self, tile: &Tile) -> Result<(), TileError> {
        let key = tile.key();
        let mut state = self.state.borrow_mut();
        let tick = state.next_tick();
        let entry = state
            .entries
            .get_mut(&key)
            .filter(|e| std::ptr::eq(Rc::as_ptr(&e.tile), tile) && e.users > 0)
            .ok_or(TileError::NotHeld(key))?;
        entry.users -= 1;
        if entry.users == 0 {
            entry.unused_since = Some(tick);
            state.unused.insert(tick, key);
        }
        Ok(())
    }

    /// Look up a resident tile without taking a reference.
    ///
    /// - ready tiles are always returned;
    /// - with `include_pending` and without `deferred_generation`, requested or
    ///   stale tiles are generated now and returned;
    /// - with both flags, tiles in any non-ready state are returned as they are;
    /// - everything else yields `None`.
    pub fn find_tile<P: TileProducer + ?Sized>(
        &self,
        producer: &P,
        level: u32,
        x: u32,
        y: u32,
        include_pending: bool,
        deferred_generation: bool,
    ) -> Result<Option<Rc<Tile>>, TileError> {
        let key = TileKey::new(producer.id(), level, x, y);
        let found = self
            .state
            .borrow()
            .entries
            .get(&key)
            .map(|e| Rc::clone(&e.tile));
        let Some(tile) = found else {
            return Ok(None);
        };

        match tile.state() {
            TileState::Ready => Ok(Some(tile)),
            TileState::Requested | TileState::Stale if include_pending && !deferred_generation => {
                self.generate(producer, &tile)?;
                Ok(Some(tile))
            }
            _ if include_pending && deferred_generation => Ok(Some(tile)),
            _ => Ok(None),
        }
    }

    /// Generate up to `budget` queued tiles of `producer`, oldest request first.
    /// Queued tiles that every holder has released are dropped from the queue
    /// without generating. Returns how many were generated.
    pub fn update<P: TileProducer + ?Sized>(
        &self,
        producer: &P,
        budget: usize,
    ) -> Result<usize, TileError> {
        let id = producer.id();
        let mut generated = 0;
        while generated < budget {
            let next = {
                let mut state = self.state.borrow_mut();
                let position = state.pending.iter().position(|k| k.producer == id);
                position.and_then(|i| state.pending.remove(i))
            };
            let Some(key) = next else {
                break;
            };
            let tile = self
                .state
                .borrow()
                .entries
                .get(&key)
                .filter(|e| e.users > 0)
                .map(|e| Rc::clone(&e.tile));
            if let Some(tile) = tile
                && matches!(tile.state(), TileState::Requested | TileState::Stale)
            {
                self.generate(producer, &tile)?;
                generated += 1;
            }
        }
        Ok(generated)
    }

    /// Mark every ready tile of `producer` stale. Returns how many were marked.
    pub fn invalidate(&self, producer: ProducerId) -> usize {
        let state = self.state.borrow();
        let mut count = 0;
        for entry in state.entries.values() {
            if entry.tile.key().producer == producer && entry.tile.is_ready() {
                entry.tile.set_state(TileState::Stale);
                count += 1;
            }
        }
        tracing::debug!(cache = %self.name, %producer, count, "invalidated tiles");
        count
    }

    /// Evict every unused tile, including upstream tiles freed by those evictions.
    pub fn evict_unused(&self) -> Result<usize, TileError> {
        let mut total = 0;
        loop {
            let evicted = {
                let mut state = self.state.borrow_mut();
                let keys: Vec<_> = std::mem::take(&mut state.unused).into_values().collect();
                for key in &keys {
                    // Forget the stamp first so `remove` does not look it up again.
                    if let Some(entry) = state.entries.get_mut(key) {
                        entry.unused_since = None;
                    }
                }
                let evicted = keys
                    .iter()
                    .map(|key| state.remove(key))
                    .collect::<Result<Vec<_>, _>>()?;
                state.stats.evictions += evicted.len() as u64;
                evicted
            };
            if evicted.is_empty() {
                return Ok(total);
            }
            total += evicted.len();
            release_evicted(evicted)?;
        }
    }

    /// Whether a tile is resident, in any state.
    #[must_use]
    pub fn contains(&self, producer: ProducerId, level: u32, x: u32, y: u32) -> bool {
        self.state
            .borrow()
            .entries
            .contains_key(&TileKey::new(producer, level, x, y))
    }

    /// Current reference count of a resident tile.
    #[must_use]
    pub fn users(&self, producer: ProducerId, level: u32, x: u32, y: u32) -> Option<u32> {
        self.state
            .borrow()
            .entries
            .get(&TileKey::new(producer, level, x, y))
            .map(|e| e.users)
    }

    /// Occupancy and traffic counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let state = self.state.borrow();
        CacheStats {
            capacity: self.capacity,
            used: state.entries.len() - state.unused.len(),
            unused: state.unused.len(),
            pending: state.pending.len(),
            ..state.stats
        }
    }

    fn generate<P: TileProducer + ?Sized>(&self, producer: &P, tile: &Rc<Tile>) -> Result<(), TileError> {
        let key = tile.key();
        let _span = tracing::debug_span!("create_tile", producer = producer.name(), %key).entered();

        let previous = tile.state();
        // A stale tile still holds the leases of its previous generation.
        tile.release_dependencies()?;
        tile.set_state(TileState::Generating);

        // Pinned so that allocations made by upstream producers cannot evict it.
        self.state.borrow_mut().acquire(&key);

        let result = producer
            .acquire_dependencies(key.level, key.x, key.y)
            .and_then(|leases| {
                tile.add_dependencies(leases);
                producer.do_create_tile(key.level, key.x, key.y, tile.slots())
            });

        match result {
            Ok(()) => {
                tile.set_state(TileState::Ready);
                self.state.borrow_mut().stats.generated += 1;
                self.release_tile(tile)?;
                tracing::debug!("tile ready");
                Ok(())
            }
            Err(err) => {
                if let Err(release) = tile.release_dependencies() {
                    tracing::warn!(error = %release, "dependency release failed after generation error");
                }
                tile.set_state(previous);

                // Drop the pin. Holders keep the tile in its previous state and
                // it is queued for another attempt; otherwise it is discarded.
                let dropped = {
                    let mut state = self.state.borrow_mut();
                    let dropped = state.drop_failed(&key);
                    if matches!(dropped, Ok(None)) && state.entries.contains_key(&key) {
                        state.enqueue(key);
                    }
                    dropped
                };
                match dropped {
                    Ok(Some(_)) => tracing::debug!(error = %err, "tile generation failed, discarded"),
                    Ok(None) => tracing::debug!(error = %err, "tile generation failed, requeued for its holders"),
                    Err(remove) => tracing::warn!(error = %remove, "could not discard failed tile"),
                }
                Err(err)
            }
        }
    }
}

fn release_evicted(evicted: Vec<Rc<Tile>>) -> Result<(), TileError> {
    for tile in evicted {
        tile.release_dependencies()?;
    }
    Ok(())
}
